// Copyright 2025 Cowboy AI, LLC.

//! The aspect driver: executing one instance for one layer
//!
//! The driver owns the execution state machine. A skipped instance is
//! returned untouched; everything else resolves its target against the
//! layer's initial snapshot, checks the target kind against the class, runs
//! declarative advice and the build callback inside the user-code sandbox,
//! and materializes a structured result. Unrecoverable user errors skip the
//! instance permanently.
//!
//! Weaver-bound classes never run the build callback; the weaver produces
//! the transformations in one call. A missing weaver yields a
//! diagnostic-only error result, not an initialization failure, because the
//! weaver legitimately does not exist while the project defining it is
//! itself being compiled.

use crate::aspect::AspectWeaver;
use crate::aspect_class::AspectClass;
use crate::collector::{
    CollectedAspect, CollectedExclusion, CollectedOptions, CollectedRequirement,
    DeclarationValidator,
};
use crate::declaration::{Declaration, DeclarationRef};
use crate::diagnostics::{descriptors, Diagnostic, DiagnosticSink};
use crate::errors::{AspectError, AspectResult};
use crate::instance::AspectInstance;
use crate::manifest::ReferenceValidator;
use crate::pipeline::{CancellationToken, PipelineConfig};
use crate::predecessor::AspectPredecessor;
use crate::snapshot::CompilationSnapshot;
use crate::user_code::run_user_code;
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// An opaque code transformation produced by an aspect
///
/// The engine never interprets transformations; it only orders and carries
/// them to the weaving stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Transformation {
    /// Human-readable description of the transformation
    pub description: String,
    /// Declaration the transformation applies to, when it has one
    pub target: Option<DeclarationRef>,
}

impl Transformation {
    /// Create a transformation with a description only
    pub fn new(description: impl Into<String>) -> Self {
        Transformation {
            description: description.into(),
            target: None,
        }
    }

    /// Attach the declaration the transformation applies to
    pub fn on(mut self, target: impl Into<DeclarationRef>) -> Self {
        self.target = Some(target.into());
        self
    }
}

impl From<String> for Transformation {
    fn from(description: String) -> Self {
        Transformation::new(description)
    }
}

impl From<&str> for Transformation {
    fn from(description: &str) -> Self {
        Transformation::new(description)
    }
}

/// Kind of member a declarative advice introduces
///
/// The discriminant order is the prepass execution order: fields first,
/// destructors last. Ties are broken by name, then display string, so the
/// order never depends on source layout (the class may come from a
/// precompiled dependency with no source at all).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
pub enum AdviceKind {
    /// An introduced field
    Field,
    /// An introduced static constructor
    StaticConstructor,
    /// An introduced instance constructor
    Constructor,
    /// An introduced property
    Property,
    /// An introduced event
    Event,
    /// An introduced ordinary method
    Method,
    /// An introduced operator
    Operator,
    /// An introduced conversion
    Conversion,
    /// An introduced destructor
    Destructor,
}

impl AdviceKind {
    /// Prepass rank; lower runs first
    pub const fn rank(self) -> u8 {
        self as u8
    }
}

/// A statically-declared piece of advice on an aspect class
///
/// Runs during the prepass, before the build callback, in the deterministic
/// advice order.
#[derive(Clone)]
pub struct DeclarativeAdvice {
    kind: AdviceKind,
    name: String,
    display: String,
    build: Arc<dyn Fn(&mut AspectBuilder<'_>) -> AspectResult<()> + Send + Sync>,
}

impl DeclarativeAdvice {
    /// Create advice for a member of the given kind and name
    pub fn new(
        kind: AdviceKind,
        name: impl Into<String>,
        build: impl Fn(&mut AspectBuilder<'_>) -> AspectResult<()> + Send + Sync + 'static,
    ) -> Self {
        let name = name.into();
        DeclarativeAdvice {
            kind,
            display: name.clone(),
            name,
            build: Arc::new(build),
        }
    }

    /// Override the display string used as the last ordering tie-break
    pub fn with_display(mut self, display: impl Into<String>) -> Self {
        self.display = display.into();
        self
    }

    /// The member kind
    pub fn kind(&self) -> AdviceKind {
        self.kind
    }

    /// The member name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The display string
    pub fn display(&self) -> &str {
        &self.display
    }

    /// Run the advice builder
    pub fn run(&self, builder: &mut AspectBuilder<'_>) -> AspectResult<()> {
        (self.build)(builder)
    }
}

impl fmt::Debug for DeclarativeAdvice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeclarativeAdvice")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Sort advice into the deterministic prepass order
pub fn sort_declarative_advice(advice: &mut [DeclarativeAdvice]) {
    advice.sort_by(|a, b| {
        a.kind
            .rank()
            .cmp(&b.kind.rank())
            .then_with(|| a.name.cmp(&b.name))
            .then_with(|| a.display.cmp(&b.display))
    });
}

/// Outcome of executing one instance for one layer
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
pub enum ExecutionOutcome {
    /// The aspect was applied; transformations are valid
    Applied,
    /// The aspect chose to skip itself, or was already skipped
    Ignored,
    /// The execution failed; the instance is permanently skipped
    Error,
}

impl fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionOutcome::Applied => write!(f, "applied"),
            ExecutionOutcome::Ignored => write!(f, "ignored"),
            ExecutionOutcome::Error => write!(f, "error"),
        }
    }
}

/// Everything one execution produced
#[derive(Debug, Default)]
pub struct AspectExecutionResult {
    /// How the execution ended
    pub outcome: ExecutionOutcome,
    /// Diagnostics reported during the execution, in report order
    pub diagnostics: DiagnosticSink,
    /// Transformations to hand to the weaving stage
    pub transformations: Vec<Transformation>,
    /// New aspect instances requested by the build
    pub aspect_sources: Vec<CollectedAspect>,
    /// Aspect requirements demanded by the build
    pub requirements: Vec<CollectedRequirement>,
    /// Exclusions requested by the build
    pub exclusions: Vec<CollectedExclusion>,
    /// Validators emitted by the build (already run against the initial
    /// snapshot; kept for downstream layers)
    pub validator_sources: Vec<DeclarationValidator>,
    /// Cross-assembly reference validators emitted by the build
    pub reference_validators: Vec<ReferenceValidator>,
    /// Hierarchical options contributed by the build
    pub option_sources: Vec<CollectedOptions>,
}

impl Default for ExecutionOutcome {
    fn default() -> Self {
        ExecutionOutcome::Ignored
    }
}

impl AspectExecutionResult {
    /// The empty, neutral result of a skipped instance
    pub fn neutral() -> Self {
        Self::default()
    }

    /// A diagnostic-only error result
    pub fn error(diagnostic: Diagnostic) -> Self {
        let mut diagnostics = DiagnosticSink::new();
        diagnostics.report(diagnostic);
        AspectExecutionResult {
            outcome: ExecutionOutcome::Error,
            diagnostics,
            ..Self::default()
        }
    }
}

/// The surface an executing aspect builds against
///
/// Handed to declarative advice and the build callback. Everything added
/// here lands in the [`AspectExecutionResult`]; nothing touches shared
/// state until the pipeline merges results after the fan-out joins.
pub struct AspectBuilder<'a> {
    instance: &'a AspectInstance,
    target: &'a Declaration,
    layer: Option<&'a str>,
    skip_requested: bool,
    diagnostics: DiagnosticSink,
    transformations: Vec<Transformation>,
    aspects: Vec<CollectedAspect>,
    requirements: Vec<CollectedRequirement>,
    exclusions: Vec<CollectedExclusion>,
    validators: Vec<DeclarationValidator>,
    reference_validators: Vec<ReferenceValidator>,
    options: Vec<CollectedOptions>,
}

impl<'a> AspectBuilder<'a> {
    fn new(instance: &'a AspectInstance, target: &'a Declaration, layer: Option<&'a str>) -> Self {
        AspectBuilder {
            instance,
            target,
            layer,
            skip_requested: false,
            diagnostics: DiagnosticSink::new(),
            transformations: Vec::new(),
            aspects: Vec::new(),
            requirements: Vec::new(),
            exclusions: Vec::new(),
            validators: Vec::new(),
            reference_validators: Vec::new(),
            options: Vec::new(),
        }
    }

    /// The resolved target declaration
    pub fn target(&self) -> &Declaration {
        self.target
    }

    /// The layer being executed; `None` is the default layer
    pub fn layer(&self) -> Option<&str> {
        self.layer
    }

    /// The cross-layer state stored by an earlier layer, if any
    pub fn state(&self) -> Option<serde_json::Value> {
        self.instance.state()
    }

    /// Store cross-layer state for later layers
    pub fn set_state(&self, state: serde_json::Value) {
        self.instance.set_state(state);
    }

    /// Skip this aspect; the execution ends with outcome `Ignored`
    pub fn skip_aspect(&mut self) {
        self.skip_requested = true;
    }

    /// Whether skip was requested
    pub fn is_skip_requested(&self) -> bool {
        self.skip_requested
    }

    /// Add a transformation
    pub fn add_transformation(&mut self, transformation: impl Into<Transformation>) {
        self.transformations.push(transformation.into());
    }

    /// Request a child aspect on a target declaration
    pub fn add_child_aspect(
        &mut self,
        class: Arc<AspectClass>,
        aspect: Arc<dyn crate::aspect::Aspect>,
        target: impl Into<DeclarationRef>,
    ) {
        self.aspects.push(CollectedAspect {
            class,
            aspect,
            target: target.into(),
            predecessor: AspectPredecessor::child_of(self.instance.id()),
        });
    }

    /// Require an aspect class to be present on a target declaration
    pub fn require_aspect(&mut self, class: Arc<AspectClass>, target: impl Into<DeclarationRef>) {
        self.requirements.push(CollectedRequirement {
            class,
            target: target.into(),
            required_by: self.instance.id(),
        });
    }

    /// Exclude a (class, target) pair from aggregation
    pub fn exclude_aspect(
        &mut self,
        class_name: impl Into<String>,
        target: impl Into<DeclarationRef>,
    ) {
        self.exclusions.push(CollectedExclusion {
            class_name: class_name.into(),
            target: target.into(),
        });
    }

    /// Emit a validator, run against this layer's initial snapshot
    pub fn add_validator(&mut self, validator: DeclarationValidator) {
        self.validators.push(validator);
    }

    /// Emit a cross-assembly reference validator
    pub fn add_reference_validator(&mut self, validator: ReferenceValidator) {
        self.reference_validators.push(validator);
    }

    /// Contribute options to a declaration scope
    pub fn add_options(&mut self, scope: impl Into<DeclarationRef>, options: serde_json::Value) {
        self.options.push(CollectedOptions {
            scope: scope.into(),
            options,
        });
    }

    /// Report a diagnostic
    pub fn report(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.report(diagnostic);
    }
}

/// Per-compilation registry of code weavers, keyed by weaver type name
#[derive(Default)]
pub struct WeaverRegistry {
    weavers: DashMap<String, Arc<dyn AspectWeaver>>,
}

impl WeaverRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a weaver under its own type name
    pub fn register(&self, weaver: Arc<dyn AspectWeaver>) {
        self.weavers
            .insert(weaver.weaver_type().to_string(), weaver);
    }

    /// Look up a weaver by type name
    pub fn get(&self, weaver_type: &str) -> Option<Arc<dyn AspectWeaver>> {
        self.weavers
            .get(weaver_type)
            .map(|entry| Arc::clone(&entry))
    }
}

impl fmt::Debug for WeaverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeaverRegistry")
            .field("weavers", &self.weavers.len())
            .finish()
    }
}

/// Executes aspect instances, one (instance, layer) pair at a time
///
/// Stateless; executions for distinct pairs are independent and safely
/// parallel. The only shared input is the immutable snapshot.
#[derive(Debug, Default)]
pub struct AspectDriver;

impl AspectDriver {
    /// Create a driver
    pub fn new() -> Self {
        Self::default()
    }

    /// Execute one instance for one layer
    ///
    /// `initial` is the snapshot the layer started from; targets and
    /// validators resolve against it. `current` is the snapshot as
    /// transformed so far, available to hosts that interleave weaving.
    /// Cancellation and internal faults return `Err`; user faults end in
    /// the result with outcome [`ExecutionOutcome::Error`].
    pub fn execute(
        &self,
        instance: &Arc<AspectInstance>,
        layer: Option<&str>,
        initial: &dyn CompilationSnapshot,
        current: &dyn CompilationSnapshot,
        config: &PipelineConfig,
        cancellation: &CancellationToken,
    ) -> AspectResult<AspectExecutionResult> {
        cancellation.check()?;

        if instance.is_skipped() {
            return Ok(AspectExecutionResult::neutral());
        }

        let class = Arc::clone(instance.class());
        debug!(
            aspect_class = class.full_name(),
            target = %instance.target(),
            layer = layer.unwrap_or("<default>"),
            snapshot = %current.snapshot_id(),
            project = config.project_name.as_str(),
            "executing aspect instance"
        );

        // Declarations are snapshot-specific; the durable reference is
        // re-bound against the layer's initial snapshot every time.
        let target = initial.resolve(instance.target()).ok_or_else(|| {
            AspectError::DeclarationNotFound {
                reference: instance.target().to_string(),
            }
        })?;

        if !class.target_kinds().contains(target.kind) {
            instance.skip();
            return Ok(AspectExecutionResult::error(
                descriptors::INCORRECT_TARGET_KIND.create_at(
                    format!(
                        "aspect '{}' cannot be applied to {} '{}'",
                        class.short_name(),
                        target.kind,
                        target.name
                    ),
                    target.reference.clone(),
                ),
            ));
        }

        if let Some(weaver_type) = class.weaver_type() {
            return self.execute_woven(instance, &class, &target, weaver_type, config);
        }

        let mut builder = AspectBuilder::new(instance, &target, layer);

        let mut advice = class.declarative_advice().to_vec();
        sort_declarative_advice(&mut advice);
        for item in &advice {
            let ran = run_user_code(class.full_name(), "advice", || item.run(&mut builder));
            if let Err(err) = ran {
                return self.fail(instance, &target, err);
            }
        }

        if !builder.is_skip_requested() {
            let built = run_user_code(class.full_name(), "build", || {
                instance.aspect().build(&mut builder)
            });
            if let Err(err) = built {
                return self.fail(instance, &target, err);
            }
        }

        let mut result = AspectExecutionResult {
            outcome: ExecutionOutcome::Applied,
            diagnostics: builder.diagnostics,
            transformations: builder.transformations,
            aspect_sources: builder.aspects,
            requirements: builder.requirements,
            exclusions: builder.exclusions,
            validator_sources: builder.validators,
            reference_validators: builder.reference_validators,
            option_sources: builder.options,
        };

        if result.diagnostics.has_errors() {
            instance.skip();
            result.outcome = ExecutionOutcome::Error;
            result.transformations.clear();
        } else if builder.skip_requested {
            result.outcome = ExecutionOutcome::Ignored;
        }

        // Validators run against the layer's initial snapshot so their
        // diagnostics are attributed to this layer's state. Findings are
        // appended; the outcome is already decided.
        for validator in &result.validator_sources {
            if let Some(declaration) = initial.resolve(&validator.target) {
                let mut sink = DiagnosticSink::new();
                (validator.check)(&declaration, &mut sink);
                result.diagnostics.extend(sink);
            }
        }

        Ok(result)
    }

    fn execute_woven(
        &self,
        instance: &Arc<AspectInstance>,
        class: &Arc<AspectClass>,
        target: &Declaration,
        weaver_type: &str,
        config: &PipelineConfig,
    ) -> AspectResult<AspectExecutionResult> {
        let Some(weaver) = config.weavers.get(weaver_type) else {
            // The weaver may be missing legitimately (the project defining
            // it is being compiled right now), so the instance is not
            // skipped; a later attempt may find it.
            warn!(
                aspect_class = class.full_name(),
                weaver_type, "weaver not registered"
            );
            return Ok(AspectExecutionResult::error(
                descriptors::MISSING_WEAVER.create_at(
                    format!(
                        "weaver '{}' required by aspect '{}' is not registered",
                        weaver_type,
                        class.short_name()
                    ),
                    target.reference.clone(),
                ),
            ));
        };

        let mut diagnostics = DiagnosticSink::new();
        let woven = run_user_code(class.full_name(), "weave", || {
            weaver.weave(instance.aspect().as_ref(), target, &mut diagnostics)
        });
        match woven {
            Ok(transformations) => {
                let outcome = if diagnostics.has_errors() {
                    instance.skip();
                    ExecutionOutcome::Error
                } else {
                    ExecutionOutcome::Applied
                };
                Ok(AspectExecutionResult {
                    outcome,
                    diagnostics,
                    transformations: if outcome == ExecutionOutcome::Error {
                        Vec::new()
                    } else {
                        transformations
                    },
                    ..AspectExecutionResult::default()
                })
            }
            Err(err) => self.fail(instance, target, err),
        }
    }

    fn fail(
        &self,
        instance: &Arc<AspectInstance>,
        target: &Declaration,
        err: AspectError,
    ) -> AspectResult<AspectExecutionResult> {
        if err.is_canceled() {
            return Err(err);
        }
        // Partially-applied user code cannot leave half a transformation
        // set behind: the instance is done for the rest of the run.
        instance.skip();
        Ok(AspectExecutionResult::error(
            descriptors::USER_CODE_FAILURE.create_at(err.to_string(), target.reference.clone()),
        ))
    }
}
