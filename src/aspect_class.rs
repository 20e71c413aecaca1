// Copyright 2025 Cowboy AI, LLC.

//! Aspect classes and the per-compilation class registry
//!
//! An `AspectClass` is the immutable metadata of one aspect type: its
//! inheritance behavior, processing layers, target kinds, eligibility rules,
//! declarative advice, and the factory/deserializer seams. Classes are built
//! once per compilation and shared by every instance.
//!
//! There is no global registry. Each compilation owns an
//! [`AspectClassRegistry`] and passes it where needed.

use crate::aspect::{Aspect, AspectDeserializer, AspectFactory};
use crate::declaration::{Declaration, DeclarationKindSet};
use crate::diagnostics::{descriptors, DiagnosticSink};
use crate::driver::DeclarativeAdvice;
use crate::eligibility::{self, EligibilityRule, EligibleScenarios};
use crate::errors::{AspectError, AspectResult};
use crate::user_code::run_user_code;
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// How instances of an aspect class propagate to derived declarations
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default,
)]
pub enum Inheritance {
    /// Instances never propagate
    #[default]
    None,
    /// Every instance propagates
    Always,
    /// Each aspect value decides for itself
    Conditional,
}

/// Immutable metadata of one aspect type
pub struct AspectClass {
    full_name: String,
    short_name: String,
    is_abstract: bool,
    inheritance: Inheritance,
    layers: Vec<Option<String>>,
    target_kinds: DeclarationKindSet,
    weaver_type: Option<String>,
    rules: Vec<Arc<dyn EligibilityRule>>,
    declarative_advice: Vec<DeclarativeAdvice>,
    factory: Option<AspectFactory>,
    deserializer: Option<AspectDeserializer>,
}

impl AspectClass {
    /// Start building a class with the given full name
    pub fn builder(full_name: impl Into<String>) -> AspectClassBuilder {
        AspectClassBuilder::new(full_name)
    }

    /// Fully qualified name, unique within a compilation
    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    /// Last segment of the full name
    pub fn short_name(&self) -> &str {
        &self.short_name
    }

    /// Whether the class is abstract (never instantiated directly)
    pub fn is_abstract(&self) -> bool {
        self.is_abstract
    }

    /// Inheritance behavior of the class
    pub fn inheritance(&self) -> Inheritance {
        self.inheritance
    }

    /// Whether any instance of this class can ever be inherited
    pub fn is_inheritable_class(&self) -> bool {
        !matches!(self.inheritance, Inheritance::None)
    }

    /// Processing layers, default layer first
    pub fn layers(&self) -> &[Option<String>] {
        &self.layers
    }

    /// Declaration kinds instances may target
    pub fn target_kinds(&self) -> DeclarationKindSet {
        self.target_kinds
    }

    /// Weaver this class is bound to, if any
    pub fn weaver_type(&self) -> Option<&str> {
        self.weaver_type.as_deref()
    }

    /// Declarative advice declared on the class, in declaration order
    pub fn declarative_advice(&self) -> &[DeclarativeAdvice] {
        &self.declarative_advice
    }

    /// Factory used to materialize required instances, if registered
    pub fn factory(&self) -> Option<&AspectFactory> {
        self.factory.as_ref()
    }

    /// Deserializer used to read manifest payloads, if registered
    pub fn deserializer(&self) -> Option<&AspectDeserializer> {
        self.deserializer.as_ref()
    }

    /// Rebuild an aspect value from a manifest payload
    pub fn deserialize_aspect(&self, payload: &serde_json::Value) -> AspectResult<Arc<dyn Aspect>> {
        let deserializer = self.deserializer.as_ref().ok_or_else(|| {
            AspectError::ClassConfiguration {
                aspect_class: self.full_name.clone(),
                reason: "no deserializer registered".to_string(),
            }
        })?;
        run_user_code(&self.full_name, "deserialize", || deserializer(payload))
    }

    /// Scenarios for which a declaration is eligible under this class
    ///
    /// Runs the class's rules (after the built-in structural rules) inside
    /// the user-code sandbox. A rule failure propagates; it is never
    /// reported as "ineligible".
    pub fn eligibility(&self, declaration: &Declaration) -> AspectResult<EligibleScenarios> {
        run_user_code(&self.full_name, "eligibility", || {
            eligibility::evaluate(&self.rules, declaration, self.is_inheritable_class())
        })
    }

    /// Why the requested scenarios are not all eligible, for diagnostics
    pub fn ineligibility_justification(
        &self,
        requested: EligibleScenarios,
        declaration: &Declaration,
    ) -> AspectResult<Option<String>> {
        if requested.contains(EligibleScenarios::INHERITANCE) && !self.is_inheritable_class() {
            return Ok(Some(format!(
                "aspect class '{}' is not inheritable",
                self.full_name
            )));
        }
        run_user_code(&self.full_name, "eligibility", || {
            eligibility::justify(&self.rules, requested, declaration)
        })
    }
}

impl fmt::Debug for AspectClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AspectClass")
            .field("full_name", &self.full_name)
            .field("inheritance", &self.inheritance)
            .field("layers", &self.layers)
            .field("target_kinds", &self.target_kinds)
            .field("weaver_type", &self.weaver_type)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for AspectClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.full_name)
    }
}

/// Builder for [`AspectClass`]
///
/// `build` validates the configuration; a failed build is a definition
/// fault, reported as a diagnostic by the registry, and the class is
/// excluded from the compilation.
pub struct AspectClassBuilder {
    full_name: String,
    is_abstract: bool,
    inheritance: Inheritance,
    extra_layers: Vec<String>,
    target_kinds: DeclarationKindSet,
    weaver_type: Option<String>,
    rules: Vec<Arc<dyn EligibilityRule>>,
    declarative_advice: Vec<DeclarativeAdvice>,
    factory: Option<AspectFactory>,
    deserializer: Option<AspectDeserializer>,
}

impl AspectClassBuilder {
    /// Create a builder with permissive defaults
    pub fn new(full_name: impl Into<String>) -> Self {
        AspectClassBuilder {
            full_name: full_name.into(),
            is_abstract: false,
            inheritance: Inheritance::None,
            extra_layers: Vec::new(),
            target_kinds: DeclarationKindSet::ANY,
            weaver_type: None,
            rules: Vec::new(),
            declarative_advice: Vec::new(),
            factory: None,
            deserializer: None,
        }
    }

    /// Mark the class abstract
    pub fn abstract_class(mut self) -> Self {
        self.is_abstract = true;
        self
    }

    /// Set the inheritance behavior
    pub fn inheritance(mut self, inheritance: Inheritance) -> Self {
        self.inheritance = inheritance;
        self
    }

    /// Add a named layer after the default layer
    pub fn layer(mut self, name: impl Into<String>) -> Self {
        self.extra_layers.push(name.into());
        self
    }

    /// Restrict the declaration kinds instances may target
    pub fn targets(mut self, kinds: DeclarationKindSet) -> Self {
        self.target_kinds = kinds;
        self
    }

    /// Bind the class to a weaver
    pub fn weaver(mut self, weaver_type: impl Into<String>) -> Self {
        self.weaver_type = Some(weaver_type.into());
        self
    }

    /// Append an eligibility rule (runs after earlier rules)
    pub fn rule(mut self, rule: Arc<dyn EligibilityRule>) -> Self {
        self.rules.push(rule);
        self
    }

    /// Append declarative advice
    pub fn advice(mut self, advice: DeclarativeAdvice) -> Self {
        self.declarative_advice.push(advice);
        self
    }

    /// Register the factory used for required instances
    pub fn factory(
        mut self,
        factory: impl Fn(&Declaration) -> AspectResult<Arc<dyn Aspect>> + Send + Sync + 'static,
    ) -> Self {
        self.factory = Some(Arc::new(factory));
        self
    }

    /// Register the manifest deserializer
    pub fn deserializer(
        mut self,
        deserializer: impl Fn(&serde_json::Value) -> AspectResult<Arc<dyn Aspect>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.deserializer = Some(Arc::new(deserializer));
        self
    }

    /// Validate and build the class
    pub fn build(self) -> AspectResult<AspectClass> {
        if self.full_name.is_empty() {
            return Err(AspectError::ClassConfiguration {
                aspect_class: "<unnamed>".to_string(),
                reason: "aspect class name is empty".to_string(),
            });
        }

        for (i, layer) in self.extra_layers.iter().enumerate() {
            if layer.is_empty() {
                return Err(AspectError::ClassConfiguration {
                    aspect_class: self.full_name.clone(),
                    reason: "layer name is empty".to_string(),
                });
            }
            if self.extra_layers[..i].contains(layer) {
                return Err(AspectError::ClassConfiguration {
                    aspect_class: self.full_name.clone(),
                    reason: format!("duplicate layer name '{layer}'"),
                });
            }
        }

        // Inheritable instances must survive serialization, which is
        // impossible without a way back from JSON.
        if !matches!(self.inheritance, Inheritance::None) && self.deserializer.is_none() {
            return Err(AspectError::ClassConfiguration {
                aspect_class: self.full_name.clone(),
                reason: "inheritable aspect class requires a deserializer".to_string(),
            });
        }

        let short_name = self
            .full_name
            .rsplit('.')
            .next()
            .unwrap_or(&self.full_name)
            .to_string();

        let mut layers = Vec::with_capacity(1 + self.extra_layers.len());
        layers.push(None);
        layers.extend(self.extra_layers.into_iter().map(Some));

        Ok(AspectClass {
            full_name: self.full_name,
            short_name,
            is_abstract: self.is_abstract,
            inheritance: self.inheritance,
            layers,
            target_kinds: self.target_kinds,
            weaver_type: self.weaver_type,
            rules: self.rules,
            declarative_advice: self.declarative_advice,
            factory: self.factory,
            deserializer: self.deserializer,
        })
    }
}

/// Per-compilation registry of aspect classes, keyed by full name
///
/// Concurrent readers are expected; registration happens up front during
/// compilation setup.
#[derive(Debug, Default)]
pub struct AspectClassRegistry {
    classes: DashMap<String, Arc<AspectClass>>,
}

impl AspectClassRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a class and register it, excluding it on configuration faults
    ///
    /// A failed build reports one `ASP0003` diagnostic and returns `None`;
    /// the rest of the compilation proceeds without the class.
    pub fn build_and_register(
        &self,
        builder: AspectClassBuilder,
        diagnostics: &mut DiagnosticSink,
    ) -> Option<Arc<AspectClass>> {
        match builder.build() {
            Ok(class) => Some(self.register(class)),
            Err(err) => {
                diagnostics.report(descriptors::CLASS_CONFIGURATION.create(err.to_string()));
                None
            }
        }
    }

    /// Register an already-built class, replacing any same-named one
    pub fn register(&self, class: AspectClass) -> Arc<AspectClass> {
        let class = Arc::new(class);
        self.classes
            .insert(class.full_name().to_string(), Arc::clone(&class));
        class
    }

    /// Look up a class by full name
    pub fn get(&self, full_name: &str) -> Option<Arc<AspectClass>> {
        self.classes.get(full_name).map(|entry| Arc::clone(&entry))
    }

    /// Whether a class with this full name is registered
    pub fn contains(&self, full_name: &str) -> bool {
        self.classes.contains_key(full_name)
    }

    /// Number of registered classes
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// All registered classes, sorted by full name
    pub fn classes(&self) -> Vec<Arc<AspectClass>> {
        let mut classes: Vec<Arc<AspectClass>> = self
            .classes
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        classes.sort_by(|a, b| a.full_name().cmp(b.full_name()));
        classes
    }

    /// Registered classes that can produce inherited instances
    pub fn inheritable_classes(&self) -> Vec<Arc<AspectClass>> {
        self.classes()
            .into_iter()
            .filter(|class| class.is_inheritable_class())
            .collect()
    }
}
