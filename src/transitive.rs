// Copyright 2025 Cowboy AI, LLC.

//! Inheritance across assembly boundaries
//!
//! Referenced assemblies carry a [`TransitiveAspectsManifest`] resource.
//! The [`TransitiveAspectSource`] reads each referenced manifest through an
//! LRU cache and re-creates the exported instances on the local
//! declarations that derive from their original targets. From there the
//! in-compilation inheritance source carries them further down the local
//! hierarchy.
//!
//! Manifest problems never fail the compilation: an unreadable blob or an
//! unknown aspect class degrades to a warning and the assembly is treated
//! as exporting nothing.

use crate::aspect_class::AspectClassRegistry;
use crate::collector::OutboundActionCollector;
use crate::declaration::DeclarationRef;
use crate::diagnostics::descriptors;
use crate::eligibility::EligibleScenarios;
use crate::errors::{AspectError, AspectResult};
use crate::inheritance::AspectSource;
use crate::instance::{AspectInstance, AspectInstanceArena};
use crate::manifest::{InheritableAspectInstance, TransitiveAspectsManifest};
use crate::pipeline::CancellationToken;
use crate::predecessor::{AspectPredecessor, PredecessorSource};
use crate::snapshot::{AssemblyIdentity, CompilationSnapshot};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use lru::LruCache;
use std::collections::HashSet;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Reads transitive manifests out of referenced assemblies
///
/// The production implementation extracts the manifest resource from the
/// referenced assembly's metadata; tests and in-process hosts substitute
/// in-memory implementations.
#[async_trait]
pub trait TransitiveManifestProvider: Send + Sync {
    /// The manifest exported by `assembly`, or `None` if it exports none
    ///
    /// An error means the assembly carries a manifest that could not be
    /// read; callers degrade it to a warning.
    async fn manifest(
        &self,
        assembly: &AssemblyIdentity,
    ) -> AspectResult<Option<TransitiveAspectsManifest>>;
}

/// Provider over already-decoded manifests
#[derive(Default)]
pub struct InMemoryManifestProvider {
    manifests: DashMap<AssemblyIdentity, TransitiveAspectsManifest>,
}

impl InMemoryManifestProvider {
    /// Create an empty provider
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the manifest exported by `assembly`
    pub fn insert(&self, assembly: AssemblyIdentity, manifest: TransitiveAspectsManifest) {
        self.manifests.insert(assembly, manifest);
    }
}

impl fmt::Debug for InMemoryManifestProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryManifestProvider")
            .field("manifests", &self.manifests.len())
            .finish()
    }
}

#[async_trait]
impl TransitiveManifestProvider for InMemoryManifestProvider {
    async fn manifest(
        &self,
        assembly: &AssemblyIdentity,
    ) -> AspectResult<Option<TransitiveAspectsManifest>> {
        Ok(self.manifests.get(assembly).map(|entry| entry.clone()))
    }
}

/// Provider over raw manifest resource blobs, decoded on read
#[derive(Default)]
pub struct ResourceManifestProvider {
    resources: DashMap<AssemblyIdentity, Bytes>,
}

impl ResourceManifestProvider {
    /// Create an empty provider
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the raw manifest resource of `assembly`
    pub fn insert(&self, assembly: AssemblyIdentity, blob: Bytes) {
        self.resources.insert(assembly, blob);
    }
}

impl fmt::Debug for ResourceManifestProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceManifestProvider")
            .field("resources", &self.resources.len())
            .finish()
    }
}

#[async_trait]
impl TransitiveManifestProvider for ResourceManifestProvider {
    async fn manifest(
        &self,
        assembly: &AssemblyIdentity,
    ) -> AspectResult<Option<TransitiveAspectsManifest>> {
        let Some(blob) = self.resources.get(assembly).map(|entry| entry.clone()) else {
            return Ok(None);
        };
        TransitiveAspectsManifest::decode(&blob).map(Some)
    }
}

/// LRU cache in front of a [`TransitiveManifestProvider`]
///
/// Caches both hits and "no manifest" answers; errors are not cached so a
/// transient read failure retries on the next lookup.
pub struct ManifestCache {
    provider: Arc<dyn TransitiveManifestProvider>,
    cache: RwLock<LruCache<AssemblyIdentity, Option<Arc<TransitiveAspectsManifest>>>>,
}

impl ManifestCache {
    /// Create a cache of the given capacity over `provider`
    pub fn new(provider: Arc<dyn TransitiveManifestProvider>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        ManifestCache {
            provider,
            cache: RwLock::new(LruCache::new(capacity)),
        }
    }

    /// The manifest of `assembly`, from cache or the provider
    pub async fn get(
        &self,
        assembly: &AssemblyIdentity,
    ) -> AspectResult<Option<Arc<TransitiveAspectsManifest>>> {
        {
            let mut cache = self.cache.write().await;
            if let Some(cached) = cache.get(assembly) {
                return Ok(cached.clone());
            }
        }

        let manifest = self.provider.manifest(assembly).await?.map(Arc::new);
        let mut cache = self.cache.write().await;
        cache.put(assembly.clone(), manifest.clone());
        Ok(manifest)
    }
}

impl fmt::Debug for ManifestCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManifestCache").finish_non_exhaustive()
    }
}

/// Re-creates manifest-exported instances on local derived declarations
pub struct TransitiveAspectSource {
    cache: ManifestCache,
}

impl TransitiveAspectSource {
    /// Create a source reading manifests through `provider`
    pub fn new(provider: Arc<dyn TransitiveManifestProvider>, cache_capacity: usize) -> Self {
        TransitiveAspectSource {
            cache: ManifestCache::new(provider, cache_capacity),
        }
    }
}

impl fmt::Debug for TransitiveAspectSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransitiveAspectSource").finish_non_exhaustive()
    }
}

#[async_trait]
impl AspectSource for TransitiveAspectSource {
    async fn collect(
        &self,
        snapshot: &dyn CompilationSnapshot,
        registry: &AspectClassRegistry,
        arena: &AspectInstanceArena,
        collector: &OutboundActionCollector,
        cancellation: &CancellationToken,
    ) -> AspectResult<Vec<Arc<AspectInstance>>> {
        // Every (class, target) pair already materialized from a manifest;
        // re-running the source must not duplicate them.
        let mut materialized: HashSet<(String, DeclarationRef)> = HashSet::new();
        for instance in arena.instances() {
            let from_manifest = instance
                .predecessors()
                .iter()
                .any(|p| matches!(p.source(), PredecessorSource::Manifest(_)));
            if from_manifest {
                materialized.insert((
                    instance.class().full_name().to_string(),
                    instance.target().clone(),
                ));
            }
        }

        let mut created = Vec::new();
        for reference in snapshot.references() {
            cancellation.check()?;

            let manifest = match self.cache.get(&reference).await {
                Ok(Some(manifest)) => manifest,
                Ok(None) => continue,
                Err(AspectError::Canceled) => return Err(AspectError::Canceled),
                Err(err) => {
                    warn!(assembly = %reference, error = %err, "unreadable transitive manifest");
                    collector.report(descriptors::MANIFEST_UNREADABLE.create(format!(
                        "the transitive aspects manifest of '{reference}' could not be read: {err}"
                    )));
                    continue;
                }
            };

            debug!(
                assembly = %reference,
                instances = manifest.instance_count(),
                "read transitive manifest"
            );

            for (class_name, exported) in &manifest.aspects {
                let Some(class) = registry.get(class_name) else {
                    warn!(
                        assembly = %reference,
                        class = class_name.as_str(),
                        "manifest refers to an unknown aspect class"
                    );
                    collector.report(descriptors::UNKNOWN_ASPECT_CLASS.create(format!(
                        "assembly '{reference}' exports aspect class '{class_name}', \
                         which is not registered in this compilation"
                    )));
                    continue;
                };

                for inherited in exported {
                    created.extend(materialize(
                        snapshot,
                        arena,
                        collector,
                        &class,
                        inherited,
                        &mut materialized,
                    ));
                }
            }
        }

        Ok(created)
    }
}

/// Re-create one exported instance on every local derived declaration
fn materialize(
    snapshot: &dyn CompilationSnapshot,
    arena: &AspectInstanceArena,
    collector: &OutboundActionCollector,
    class: &Arc<crate::aspect_class::AspectClass>,
    inherited: &InheritableAspectInstance,
    materialized: &mut HashSet<(String, DeclarationRef)>,
) -> Vec<Arc<AspectInstance>> {
    let mut created = Vec::new();
    for derived in snapshot.direct_derived(&inherited.target) {
        let key = (inherited.aspect_class.clone(), derived.clone());
        if materialized.contains(&key) {
            continue;
        }
        let Some(declaration) = snapshot.resolve(&derived) else {
            continue;
        };

        match class.eligibility(&declaration) {
            Ok(scenarios) if scenarios.contains(EligibleScenarios::INHERITANCE) => {}
            Ok(_) => continue,
            Err(err) => {
                collector.report(
                    descriptors::USER_CODE_FAILURE.create_at(err.to_string(), derived.clone()),
                );
                continue;
            }
        }

        let aspect = match class.deserialize_aspect(&inherited.aspect_payload) {
            Ok(aspect) => aspect,
            Err(err) => {
                collector.report(descriptors::USER_CODE_FAILURE.create_at(
                    format!(
                        "aspect '{}' could not be deserialized from the manifest: {err}",
                        inherited.aspect_class
                    ),
                    derived.clone(),
                ));
                continue;
            }
        };

        let instance = arena.create(
            Arc::clone(class),
            aspect,
            derived.clone(),
            declaration.depth,
            vec![AspectPredecessor::inherited_from_manifest(Arc::new(
                inherited.clone(),
            ))],
        );
        if let Some(state) = &inherited.state {
            instance.set_state(state.clone());
        }
        materialized.insert(key);
        created.push(instance);
    }
    created
}
