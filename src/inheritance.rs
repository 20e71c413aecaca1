// Copyright 2025 Cowboy AI, LLC.

//! Propagation of inheritable aspects to derived declarations
//!
//! An inheritable instance on a base type or virtual member reappears on
//! every declaration that directly derives from its target. Propagation is
//! deliberately single-hop: the inherited copy is itself inheritable, so
//! the next collection round carries it one level further. That keeps each
//! inherited instance's causal distance honest and lets eligibility veto
//! propagation at any level of the hierarchy.

use crate::aspect_class::AspectClassRegistry;
use crate::collector::OutboundActionCollector;
use crate::declaration::DeclarationRef;
use crate::diagnostics::descriptors;
use crate::eligibility::EligibleScenarios;
use crate::errors::AspectResult;
use crate::instance::{AspectInstance, AspectInstanceArena, AspectInstanceId};
use crate::pipeline::CancellationToken;
use crate::predecessor::{AspectPredecessor, PredecessorKind, PredecessorSource};
use crate::snapshot::CompilationSnapshot;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// A producer of aspect instances beyond attribute and fabric seeds
///
/// Sources run once per collection round over the arena as it stood at the
/// start of the round. Instances they create through the arena are
/// returned so the pipeline executes them in the next round.
#[async_trait]
pub trait AspectSource: Send + Sync {
    /// Discover and create new instances for this round
    async fn collect(
        &self,
        snapshot: &dyn CompilationSnapshot,
        registry: &AspectClassRegistry,
        arena: &AspectInstanceArena,
        collector: &OutboundActionCollector,
        cancellation: &CancellationToken,
    ) -> AspectResult<Vec<Arc<AspectInstance>>>;
}

/// Propagates inheritable instances to directly derived declarations
#[derive(Debug, Default)]
pub struct InheritanceAspectSource;

impl InheritanceAspectSource {
    /// Create the source
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AspectSource for InheritanceAspectSource {
    async fn collect(
        &self,
        snapshot: &dyn CompilationSnapshot,
        _registry: &AspectClassRegistry,
        arena: &AspectInstanceArena,
        collector: &OutboundActionCollector,
        cancellation: &CancellationToken,
    ) -> AspectResult<Vec<Arc<AspectInstance>>> {
        // Snapshot the arena up front; instances created below must not
        // propagate again within the same round.
        let existing = arena.instances();

        // Every (base instance, derived target) pair that already has an
        // inherited copy. Re-running the source is idempotent.
        let mut propagated: HashSet<(AspectInstanceId, DeclarationRef)> = HashSet::new();
        for instance in &existing {
            for predecessor in instance.predecessors() {
                if predecessor.kind() == PredecessorKind::Inherited {
                    if let PredecessorSource::Instance(base) = predecessor.source() {
                        propagated.insert((*base, instance.target().clone()));
                    }
                }
            }
        }

        let mut created = Vec::new();
        for instance in &existing {
            cancellation.check()?;
            if !instance.is_inheritable() || instance.is_skipped() {
                continue;
            }

            for derived in snapshot.direct_derived(instance.target()) {
                if propagated.contains(&(instance.id(), derived.clone())) {
                    continue;
                }

                let Some(declaration) = snapshot.resolve(&derived) else {
                    continue;
                };

                match instance.class().eligibility(&declaration) {
                    Ok(scenarios) if scenarios.contains(EligibleScenarios::INHERITANCE) => {}
                    Ok(_) => continue,
                    Err(err) => {
                        collector.report(
                            descriptors::USER_CODE_FAILURE
                                .create_at(err.to_string(), derived.clone()),
                        );
                        continue;
                    }
                }

                debug!(
                    class = instance.class().full_name(),
                    base = %instance.target(),
                    derived = %derived,
                    "inheriting aspect"
                );
                propagated.insert((instance.id(), derived.clone()));
                created.push(arena.create(
                    Arc::clone(instance.class()),
                    Arc::clone(instance.aspect()),
                    derived,
                    declaration.depth,
                    vec![AspectPredecessor::inherited_from(instance.id())],
                ));
            }
        }

        Ok(created)
    }
}
