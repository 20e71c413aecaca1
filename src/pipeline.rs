// Copyright 2025 Cowboy AI, LLC.

//! The aspect collection phase
//!
//! `collect_aspect_instances` turns attribute/fabric seeds and the
//! inheritance sources into the complete, aggregated set of aspect
//! instances for one compilation. Newly created instances execute once so
//! their child aspects, requirements, exclusions, validators, and options
//! land in the collector; the drained collector creates more instances;
//! the loop runs to a fixed point. Construction order keeps the causality
//! DAG acyclic, so the loop terminates as soon as a round discovers
//! nothing.
//!
//! Ordering and aggregation run after the loop, single-threaded, over the
//! frozen arena.

use crate::aggregate::{aggregate, AggregatedAspectInstance};
use crate::aspect::Aspect;
use crate::aspect_class::{AspectClass, AspectClassRegistry};
use crate::collector::{
    CollectedAspect, CollectedOptions, CollectedRequirement, DeclarationValidator,
    OutboundActionCollector,
};
use crate::declaration::{Declaration, DeclarationRef};
use crate::diagnostics::{descriptors, DiagnosticSink};
use crate::driver::{AspectDriver, AspectExecutionResult, WeaverRegistry};
use crate::eligibility::EligibleScenarios;
use crate::errors::{AspectError, AspectResult};
use crate::inheritance::AspectSource;
use crate::instance::{AspectInstance, AspectInstanceArena};
use crate::manifest::ReferenceValidator;
use crate::predecessor::{AspectPredecessor, AttributeRef, FabricRef, PredecessorKind};
use crate::snapshot::{AssemblyIdentity, CompilationSnapshot};
use crate::user_code::run_user_code;
use futures::future::join_all;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Cooperative cancellation flag shared across phase tasks
///
/// Checked once per work item. Cancellation surfaces as
/// [`AspectError::Canceled`]; partial diagnostics are discarded by the
/// caller, never reported.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    canceled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Create a token that is not canceled
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; every clone observes it
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
    }

    /// Whether cancellation was requested
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    /// Fail with [`AspectError::Canceled`] if cancellation was requested
    pub fn check(&self) -> AspectResult<()> {
        if self.is_canceled() {
            Err(AspectError::Canceled)
        } else {
            Ok(())
        }
    }
}

/// Constructor-injected configuration for one pipeline run
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Project being compiled, used in logs
    pub project_name: String,
    /// Identity of the assembly being produced
    pub assembly: AssemblyIdentity,
    /// Weavers available to weaver-bound aspect classes
    pub weavers: Arc<WeaverRegistry>,
    /// Capacity of the per-compilation manifest cache
    pub manifest_cache_capacity: usize,
}

impl PipelineConfig {
    /// Create a configuration with an empty weaver registry
    pub fn new(project_name: impl Into<String>, assembly: AssemblyIdentity) -> Self {
        PipelineConfig {
            project_name: project_name.into(),
            assembly,
            weavers: Arc::new(WeaverRegistry::new()),
            manifest_cache_capacity: 16,
        }
    }

    /// Use the given weaver registry
    pub fn with_weavers(mut self, weavers: Arc<WeaverRegistry>) -> Self {
        self.weavers = weavers;
        self
    }

    /// Override the manifest cache capacity
    pub fn with_manifest_cache_capacity(mut self, capacity: usize) -> Self {
        self.manifest_cache_capacity = capacity;
        self
    }
}

/// Where a seed was discovered
#[derive(Debug, Clone)]
pub enum SeedOrigin {
    /// A custom attribute on the target declaration
    Attribute {
        /// Source file containing the attribute, when known
        source_file: Option<String>,
    },
    /// A fabric amendment
    Fabric {
        /// Full name of the fabric type
        fabric_type: String,
        /// Containment depth the fabric amends at
        depth: u32,
        /// Source file declaring the fabric, when known
        source_file: Option<String>,
    },
}

/// A raw (class, aspect, target) tuple discovered by the host
///
/// The host's attribute/fabric discovery produces these; the collection
/// phase treats them purely as instance-creation seeds.
pub struct AspectSeed {
    /// Class of the aspect to instantiate
    pub class: Arc<AspectClass>,
    /// The user aspect value
    pub aspect: Arc<dyn Aspect>,
    /// Declaration the seed targets
    pub target: DeclarationRef,
    /// How the seed was discovered
    pub origin: SeedOrigin,
}

impl AspectSeed {
    /// Seed from a custom attribute on `target`
    pub fn from_attribute(
        class: Arc<AspectClass>,
        aspect: Arc<dyn Aspect>,
        target: impl Into<DeclarationRef>,
        source_file: Option<String>,
    ) -> Self {
        AspectSeed {
            class,
            aspect,
            target: target.into(),
            origin: SeedOrigin::Attribute { source_file },
        }
    }

    /// Seed from a fabric amendment
    pub fn from_fabric(
        class: Arc<AspectClass>,
        aspect: Arc<dyn Aspect>,
        target: impl Into<DeclarationRef>,
        fabric_type: impl Into<String>,
        depth: u32,
        source_file: Option<String>,
    ) -> Self {
        AspectSeed {
            class,
            aspect,
            target: target.into(),
            origin: SeedOrigin::Fabric {
                fabric_type: fabric_type.into(),
                depth,
                source_file,
            },
        }
    }
}

impl fmt::Debug for AspectSeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AspectSeed")
            .field("class", &self.class.full_name())
            .field("target", &self.target)
            .field("origin", &self.origin)
            .finish()
    }
}

/// Everything one collection phase produced
#[derive(Debug, Default)]
pub struct CollectionOutcome {
    /// Aggregated instances, one per surviving (class, target) pair,
    /// ordered by class full name then target
    pub aggregates: Vec<AggregatedAspectInstance>,
    /// Diagnostics from eligibility, execution, and expansion
    pub diagnostics: DiagnosticSink,
    /// Declaration validators emitted during collection
    pub validators: Vec<DeclarationValidator>,
    /// Cross-assembly reference validators emitted during collection
    pub reference_validators: Vec<ReferenceValidator>,
    /// Hierarchical options contributed during collection
    pub options: Vec<CollectedOptions>,
}

/// Collect, expand, and aggregate every aspect instance of a compilation
///
/// Seeds become instances (eligibility permitting); each new instance
/// executes once on the default layer so its outbound actions reach the
/// collector; sources run every round so inheritance propagates one direct
/// hop per round; the loop ends when a round creates nothing. Exclusions
/// collected anywhere in the run filter matching (class, target) pairs
/// before aggregation.
pub async fn collect_aspect_instances(
    snapshot: &dyn CompilationSnapshot,
    registry: &AspectClassRegistry,
    arena: &AspectInstanceArena,
    seeds: Vec<AspectSeed>,
    sources: &[Arc<dyn AspectSource>],
    config: &PipelineConfig,
    cancellation: &CancellationToken,
) -> AspectResult<CollectionOutcome> {
    let driver = AspectDriver::new();
    let collector = OutboundActionCollector::new();
    let mut outcome = CollectionOutcome::default();
    let mut excluded: HashSet<(String, DeclarationRef)> = HashSet::new();

    info!(
        project = config.project_name.as_str(),
        seeds = seeds.len(),
        sources = sources.len(),
        "collecting aspect instances"
    );

    let mut pending = create_seed_instances(snapshot, arena, seeds, &mut outcome.diagnostics)?;
    let mut round = 0u32;

    loop {
        cancellation.check()?;

        // Fan out one execution per newly created instance. Executions
        // are independent; results merge after the join.
        let executions: Vec<AspectResult<AspectExecutionResult>> = join_all(
            pending
                .iter()
                .map(|instance| async {
                    cancellation.check()?;
                    driver.execute(instance, None, snapshot, snapshot, config, cancellation)
                }),
        )
        .await;
        for execution in executions {
            let result = execution?;
            outcome.diagnostics.extend(result.diagnostics);
            for aspect in result.aspect_sources {
                collector.add_aspect_instance(aspect);
            }
            for requirement in result.requirements {
                collector.add_requirement(requirement);
            }
            for exclusion in result.exclusions {
                collector.add_exclusion(exclusion);
            }
            for validator in result.validator_sources {
                collector.add_validator(validator);
            }
            for validator in result.reference_validators {
                collector.add_reference_validator(validator);
            }
            for options in result.option_sources {
                collector.add_options(options);
            }
        }

        let mut fresh: Vec<Arc<AspectInstance>> = Vec::new();
        for source in sources {
            fresh.extend(
                source
                    .collect(snapshot, registry, arena, &collector, cancellation)
                    .await?,
            );
        }

        for exclusion in collector.drain_exclusions() {
            excluded.insert((exclusion.class_name, exclusion.target));
        }
        for collected in collector.drain_aspect_instances() {
            cancellation.check()?;
            if let Some(instance) =
                create_collected_instance(snapshot, arena, collected, &mut outcome.diagnostics)
            {
                fresh.push(instance);
            }
        }
        for requirement in collector.drain_requirements() {
            cancellation.check()?;
            if let Some(instance) =
                satisfy_requirement(snapshot, arena, requirement, &mut outcome.diagnostics)
            {
                fresh.push(instance);
            }
        }
        outcome.validators.extend(collector.drain_validators());
        outcome
            .reference_validators
            .extend(collector.drain_reference_validators());
        outcome.options.extend(collector.drain_options());
        for diagnostic in collector.drain_diagnostics() {
            outcome.diagnostics.report(diagnostic);
        }

        debug!(round, discovered = fresh.len(), "collection round finished");
        round += 1;
        if fresh.is_empty() {
            break;
        }
        pending = fresh;
    }

    outcome.aggregates = aggregate_arena(arena, &excluded);
    info!(
        project = config.project_name.as_str(),
        instances = arena.len(),
        aggregates = outcome.aggregates.len(),
        rounds = round,
        "aspect collection complete"
    );
    Ok(outcome)
}

fn create_seed_instances(
    snapshot: &dyn CompilationSnapshot,
    arena: &AspectInstanceArena,
    seeds: Vec<AspectSeed>,
    diagnostics: &mut DiagnosticSink,
) -> AspectResult<Vec<Arc<AspectInstance>>> {
    let mut instances = Vec::with_capacity(seeds.len());
    for seed in seeds {
        // Seeds come from the host's own discovery over this snapshot; a
        // target that does not resolve is a host bug, not user error.
        let declaration = snapshot.resolve(&seed.target).ok_or_else(|| {
            AspectError::DeclarationNotFound {
                reference: seed.target.to_string(),
            }
        })?;

        if !check_eligibility(
            &seed.class,
            &declaration,
            EligibleScenarios::ASPECT,
            diagnostics,
        ) {
            continue;
        }

        let predecessor = match seed.origin {
            SeedOrigin::Attribute { source_file } => {
                let mut attribute = AttributeRef::new(seed.target.clone(), declaration.depth);
                if let Some(file) = source_file {
                    attribute = attribute.with_source_file(file);
                }
                AspectPredecessor::from_attribute(attribute)
            }
            SeedOrigin::Fabric {
                fabric_type,
                depth,
                source_file,
            } => {
                let mut fabric = FabricRef::new(fabric_type, depth);
                if let Some(file) = source_file {
                    fabric = fabric.with_source_file(file);
                }
                AspectPredecessor::from_fabric(fabric)
            }
        };

        instances.push(arena.create(
            seed.class,
            seed.aspect,
            seed.target,
            declaration.depth,
            vec![predecessor],
        ));
    }
    Ok(instances)
}

fn create_collected_instance(
    snapshot: &dyn CompilationSnapshot,
    arena: &AspectInstanceArena,
    collected: CollectedAspect,
    diagnostics: &mut DiagnosticSink,
) -> Option<Arc<AspectInstance>> {
    let Some(declaration) = snapshot.resolve(&collected.target) else {
        // The target was chosen by user code and may simply not exist.
        diagnostics.report(descriptors::NOT_ELIGIBLE.create_at(
            format!(
                "aspect '{}' targets '{}', which does not exist",
                collected.class.short_name(),
                collected.target
            ),
            collected.target.clone(),
        ));
        return None;
    };

    let scenario = match collected.predecessor.kind() {
        PredecessorKind::Inherited => EligibleScenarios::INHERITANCE,
        _ => EligibleScenarios::ASPECT,
    };
    if !check_eligibility(&collected.class, &declaration, scenario, diagnostics) {
        return None;
    }

    Some(arena.create(
        collected.class,
        collected.aspect,
        collected.target,
        declaration.depth,
        vec![collected.predecessor],
    ))
}

fn satisfy_requirement(
    snapshot: &dyn CompilationSnapshot,
    arena: &AspectInstanceArena,
    requirement: CollectedRequirement,
    diagnostics: &mut DiagnosticSink,
) -> Option<Arc<AspectInstance>> {
    // A requirement is satisfied by any existing instance of the class on
    // the target; only unmet requirements materialize new instances.
    let already_present = arena.instances().iter().any(|instance| {
        instance.class().full_name() == requirement.class.full_name()
            && instance.target() == &requirement.target
    });
    if already_present {
        return None;
    }

    let Some(declaration) = snapshot.resolve(&requirement.target) else {
        diagnostics.report(descriptors::NOT_ELIGIBLE.create_at(
            format!(
                "required aspect '{}' targets '{}', which does not exist",
                requirement.class.short_name(),
                requirement.target
            ),
            requirement.target.clone(),
        ));
        return None;
    };

    let Some(factory) = requirement.class.factory() else {
        diagnostics.report(descriptors::REQUIREMENT_WITHOUT_FACTORY.create_at(
            format!(
                "aspect class '{}' was required on '{}' but has no factory",
                requirement.class.full_name(),
                requirement.target
            ),
            requirement.target.clone(),
        ));
        return None;
    };
    let factory = Arc::clone(factory);

    let aspect = match run_user_code(requirement.class.full_name(), "factory", || {
        factory(&declaration)
    }) {
        Ok(aspect) => aspect,
        Err(err) => {
            diagnostics.report(
                descriptors::USER_CODE_FAILURE
                    .create_at(err.to_string(), requirement.target.clone()),
            );
            return None;
        }
    };

    if !check_eligibility(
        &requirement.class,
        &declaration,
        EligibleScenarios::ASPECT,
        diagnostics,
    ) {
        return None;
    }

    Some(arena.create(
        requirement.class,
        aspect,
        requirement.target,
        declaration.depth,
        vec![AspectPredecessor::required_by(requirement.required_by)],
    ))
}

/// Evaluate eligibility, reporting ineligibility and user faults
///
/// Returns whether instance creation may proceed. An ineligible target is
/// an `ASP0008` with the rules' own justification when one exists; a user
/// fault during evaluation is an `ASP0002`. Neither stops the phase.
fn check_eligibility(
    class: &Arc<AspectClass>,
    declaration: &Declaration,
    scenario: EligibleScenarios,
    diagnostics: &mut DiagnosticSink,
) -> bool {
    match class.eligibility(declaration) {
        Ok(scenarios) if scenarios.contains(scenario) => true,
        Ok(_) => {
            let justification = class
                .ineligibility_justification(scenario, declaration)
                .unwrap_or(None)
                .unwrap_or_else(|| format!("the {} is not eligible", declaration.kind));
            diagnostics.report(descriptors::NOT_ELIGIBLE.create_at(
                format!(
                    "aspect '{}' cannot be applied to '{}': {}",
                    class.short_name(),
                    declaration.name,
                    justification
                ),
                declaration.reference.clone(),
            ));
            false
        }
        Err(err) => {
            diagnostics.report(
                descriptors::USER_CODE_FAILURE
                    .create_at(err.to_string(), declaration.reference.clone()),
            );
            false
        }
    }
}

fn aggregate_arena(
    arena: &AspectInstanceArena,
    excluded: &HashSet<(String, DeclarationRef)>,
) -> Vec<AggregatedAspectInstance> {
    let mut groups: Vec<((String, DeclarationRef), Vec<Arc<AspectInstance>>)> = Vec::new();
    for instance in arena.instances() {
        let key = (
            instance.class().full_name().to_string(),
            instance.target().clone(),
        );
        if excluded.contains(&key) {
            continue;
        }
        match groups.iter_mut().find(|(existing, _)| *existing == key) {
            Some((_, group)) => group.push(instance),
            None => groups.push((key, vec![instance])),
        }
    }

    groups.sort_by(|(a, _), (b, _)| a.cmp(b));
    groups
        .into_iter()
        .map(|(_, group)| aggregate(arena, group))
        .collect()
}
