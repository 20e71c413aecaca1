// Copyright 2025 Cowboy AI, LLC.

//! Concurrent collection of outbound aspect actions
//!
//! While aspects execute, many tasks add instances, exclusions,
//! requirements, validators, options, and diagnostics at once. The
//! collector gives every action kind a lazily-created append-only bag:
//! writers never block each other, an action kind nobody uses costs
//! nothing, and draining yields items in the order their tickets were
//! issued.
//!
//! Draining removes items, so a fixed-point loop that drains between
//! rounds sees each item exactly once.

use crate::aspect::Aspect;
use crate::aspect_class::AspectClass;
use crate::declaration::DeclarationRef;
use crate::diagnostics::{Diagnostic, DiagnosticSink};
use crate::manifest::ReferenceValidator;
use crate::predecessor::AspectPredecessor;
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// A new aspect instance requested during execution
pub struct CollectedAspect {
    /// Class of the requested instance
    pub class: Arc<AspectClass>,
    /// The aspect value to instantiate with
    pub aspect: Arc<dyn Aspect>,
    /// Target declaration
    pub target: DeclarationRef,
    /// Provenance edge connecting the new instance to its cause
    pub predecessor: AspectPredecessor,
}

impl fmt::Debug for CollectedAspect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectedAspect")
            .field("class", &self.class.full_name())
            .field("target", &self.target)
            .field("predecessor", &self.predecessor.kind())
            .finish()
    }
}

/// A (class, target) pair excluded from aggregation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectedExclusion {
    /// Full name of the excluded aspect class
    pub class_name: String,
    /// Declaration the exclusion applies to
    pub target: DeclarationRef,
}

/// A demand that some class be present on a target
///
/// Materialized through the class factory with a required-aspect
/// predecessor; a class without a factory turns this into an `ASP0007`
/// diagnostic.
pub struct CollectedRequirement {
    /// Class that must be present
    pub class: Arc<AspectClass>,
    /// Declaration it must be present on
    pub target: DeclarationRef,
    /// The instance that demanded it
    pub required_by: crate::instance::AspectInstanceId,
}

impl fmt::Debug for CollectedRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectedRequirement")
            .field("class", &self.class.full_name())
            .field("target", &self.target)
            .field("required_by", &self.required_by)
            .finish()
    }
}

/// A runnable validation emitted by a build, run against the initial
/// snapshot of the layer that produced it
pub struct DeclarationValidator {
    /// Declaration to validate
    pub target: DeclarationRef,
    /// The check; reports its findings into the sink
    pub check: Arc<dyn Fn(&crate::declaration::Declaration, &mut DiagnosticSink) + Send + Sync>,
}

impl DeclarationValidator {
    /// Create a validator for a target declaration
    pub fn new(
        target: impl Into<DeclarationRef>,
        check: impl Fn(&crate::declaration::Declaration, &mut DiagnosticSink) + Send + Sync + 'static,
    ) -> Self {
        DeclarationValidator {
            target: target.into(),
            check: Arc::new(check),
        }
    }
}

impl fmt::Debug for DeclarationValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeclarationValidator")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

/// Hierarchical options contributed to a declaration scope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectedOptions {
    /// Scope the options apply to (the declaration and everything under it)
    pub scope: DeclarationRef,
    /// Opaque options payload
    pub options: serde_json::Value,
}

/// Lock-free, append-only sink for actions produced during execution
#[derive(Debug, Default)]
pub struct OutboundActionCollector {
    aspects: OnceLock<AppendBag<CollectedAspect>>,
    exclusions: OnceLock<AppendBag<CollectedExclusion>>,
    requirements: OnceLock<AppendBag<CollectedRequirement>>,
    validators: OnceLock<AppendBag<DeclarationValidator>>,
    reference_validators: OnceLock<AppendBag<ReferenceValidator>>,
    options: OnceLock<AppendBag<CollectedOptions>>,
    diagnostics: OnceLock<AppendBag<Diagnostic>>,
}

impl OutboundActionCollector {
    /// Create an empty collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a new aspect instance
    pub fn add_aspect_instance(&self, aspect: CollectedAspect) {
        self.aspects.get_or_init(AppendBag::new).push(aspect);
    }

    /// Exclude a (class, target) pair from aggregation
    pub fn add_exclusion(&self, exclusion: CollectedExclusion) {
        self.exclusions.get_or_init(AppendBag::new).push(exclusion);
    }

    /// Require a class to be present on a target
    pub fn add_requirement(&self, requirement: CollectedRequirement) {
        self.requirements
            .get_or_init(AppendBag::new)
            .push(requirement);
    }

    /// Add a runnable declaration validator
    pub fn add_validator(&self, validator: DeclarationValidator) {
        self.validators.get_or_init(AppendBag::new).push(validator);
    }

    /// Add a serializable cross-assembly reference validator
    pub fn add_reference_validator(&self, validator: ReferenceValidator) {
        self.reference_validators
            .get_or_init(AppendBag::new)
            .push(validator);
    }

    /// Contribute options to a declaration scope
    pub fn add_options(&self, options: CollectedOptions) {
        self.options.get_or_init(AppendBag::new).push(options);
    }

    /// Report a diagnostic
    pub fn report(&self, diagnostic: Diagnostic) {
        self.diagnostics
            .get_or_init(AppendBag::new)
            .push(diagnostic);
    }

    /// Drain requested instances, in ticket order
    pub fn drain_aspect_instances(&self) -> Vec<CollectedAspect> {
        drain(&self.aspects)
    }

    /// Drain exclusions, in ticket order
    pub fn drain_exclusions(&self) -> Vec<CollectedExclusion> {
        drain(&self.exclusions)
    }

    /// Drain requirements, in ticket order
    pub fn drain_requirements(&self) -> Vec<CollectedRequirement> {
        drain(&self.requirements)
    }

    /// Drain runnable validators, in ticket order
    pub fn drain_validators(&self) -> Vec<DeclarationValidator> {
        drain(&self.validators)
    }

    /// Drain reference validators, in ticket order
    pub fn drain_reference_validators(&self) -> Vec<ReferenceValidator> {
        drain(&self.reference_validators)
    }

    /// Drain options, in ticket order
    pub fn drain_options(&self) -> Vec<CollectedOptions> {
        drain(&self.options)
    }

    /// Drain diagnostics, in ticket order
    pub fn drain_diagnostics(&self) -> Vec<Diagnostic> {
        drain(&self.diagnostics)
    }
}

fn drain<T>(bag: &OnceLock<AppendBag<T>>) -> Vec<T> {
    match bag.get() {
        Some(bag) => bag.drain_ordered(),
        None => Vec::new(),
    }
}

/// Concurrent append-only bag with ticketed ordering
///
/// Writers take a ticket from an atomic counter and insert under it; no
/// writer ever contends with another beyond the counter bump. Draining
/// removes items ticket by ticket, so items appear exactly once across
/// repeated drains.
struct AppendBag<T> {
    next: AtomicU64,
    items: DashMap<u64, T>,
}

impl<T> AppendBag<T> {
    fn new() -> Self {
        AppendBag {
            next: AtomicU64::new(0),
            items: DashMap::new(),
        }
    }

    fn push(&self, item: T) {
        let ticket = self.next.fetch_add(1, Ordering::Relaxed);
        self.items.insert(ticket, item);
    }

    fn drain_ordered(&self) -> Vec<T> {
        let issued = self.next.load(Ordering::Acquire);
        (0..issued)
            .filter_map(|ticket| self.items.remove(&ticket).map(|(_, item)| item))
            .collect()
    }
}

impl<T> fmt::Debug for AppendBag<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppendBag")
            .field("issued", &self.next.load(Ordering::Relaxed))
            .field("pending", &self.items.len())
            .finish()
    }
}
