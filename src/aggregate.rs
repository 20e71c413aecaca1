// Copyright 2025 Cowboy AI, LLC.

//! Aggregation of duplicate aspect instances
//!
//! The same class can land on the same declaration several times (duplicate
//! attributes, inheritance plus a local attribute, several fabrics). Exactly
//! one of them executes: the primary, chosen by the deterministic order.
//! The rest ride along as inert secondary instances so diagnostics and
//! manifests can still see them.

use crate::aspect_class::AspectClass;
use crate::declaration::DeclarationRef;
use crate::instance::{AspectInstance, AspectInstanceArena};
use crate::ordering::sort_instances;
use std::sync::Arc;

/// One or more same-class instances on one target, merged
///
/// A lone instance stays unwrapped; building an aggregate of one is
/// pointless allocation on the hot path.
#[derive(Debug, Clone)]
pub enum AggregatedAspectInstance {
    /// The only instance of its class on its target
    Single(Arc<AspectInstance>),
    /// Duplicates merged under a deterministic primary
    Aggregate {
        /// The instance that executes
        primary: Arc<AspectInstance>,
        /// Non-executing duplicates, in deterministic order
        secondary: Vec<Arc<AspectInstance>>,
    },
}

impl AggregatedAspectInstance {
    /// The instance that executes
    pub fn primary(&self) -> &Arc<AspectInstance> {
        match self {
            AggregatedAspectInstance::Single(instance) => instance,
            AggregatedAspectInstance::Aggregate { primary, .. } => primary,
        }
    }

    /// The inert duplicates (empty for a single instance)
    pub fn secondary(&self) -> &[Arc<AspectInstance>] {
        match self {
            AggregatedAspectInstance::Single(_) => &[],
            AggregatedAspectInstance::Aggregate { secondary, .. } => secondary,
        }
    }

    /// Total number of merged instances
    pub fn count(&self) -> usize {
        1 + self.secondary().len()
    }

    /// The shared class
    pub fn class(&self) -> &Arc<AspectClass> {
        self.primary().class()
    }

    /// The shared target
    pub fn target(&self) -> &DeclarationRef {
        self.primary().target()
    }

    /// Whether the aggregate propagates to derived declarations
    pub fn is_inheritable(&self) -> bool {
        self.primary().is_inheritable()
    }

    /// Whether the primary has been skipped
    pub fn is_skipped(&self) -> bool {
        self.primary().is_skipped()
    }

    /// Skip the primary permanently; secondaries are inert already
    pub fn skip(&self) {
        self.primary().skip();
    }

    /// Iterate primary first, then secondaries
    pub fn instances(&self) -> impl Iterator<Item = &Arc<AspectInstance>> {
        std::iter::once(self.primary()).chain(self.secondary().iter())
    }
}

/// Merge same-class, same-target instances into one execution unit
///
/// The input group must be non-empty and homogeneous (one class, one
/// target); anything else is an engine bug and panics. The instances are
/// stable-sorted by the deterministic order; the first becomes primary.
/// The primary is invariant under the input permutation except for full
/// ordering ties, where discovery order decides.
pub fn aggregate(
    arena: &AspectInstanceArena,
    mut instances: Vec<Arc<AspectInstance>>,
) -> AggregatedAspectInstance {
    let first = match instances.first() {
        Some(first) => Arc::clone(first),
        None => panic!("cannot aggregate an empty instance group"),
    };
    for instance in &instances[1..] {
        if instance.class().full_name() != first.class().full_name()
            || instance.target() != first.target()
        {
            panic!(
                "aggregation group mixes ({}, {}) with ({}, {})",
                first.class().full_name(),
                first.target(),
                instance.class().full_name(),
                instance.target(),
            );
        }
    }

    if instances.len() == 1 {
        return AggregatedAspectInstance::Single(first);
    }

    sort_instances(arena, &mut instances);
    let primary = instances.remove(0);
    AggregatedAspectInstance::Aggregate {
        primary,
        secondary: instances,
    }
}
