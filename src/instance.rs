// Copyright 2025 Cowboy AI, LLC.

//! Aspect instances and the append-only instance arena
//!
//! Instances are owned by one [`AspectInstanceArena`] per compilation and
//! referenced everywhere else by [`AspectInstanceId`]. Predecessor edges
//! store ids, never `Arc`s, so the causality DAG cannot keep instances
//! alive in cycles and the arena can memoize derived values (degree, root
//! depth, contributing files) once per instance.
//!
//! An id handed to the arena that it did not issue is an engine bug and
//! panics; it is never reported as a diagnostic.

use crate::aspect::Aspect;
use crate::aspect_class::{AspectClass, Inheritance};
use crate::declaration::DeclarationRef;
use crate::predecessor::{AspectPredecessor, PredecessorSource};
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

/// Index of an aspect instance within its arena
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
pub struct AspectInstanceId(u32);

impl AspectInstanceId {
    /// Create an id from its raw index
    pub const fn from_raw(raw: u32) -> Self {
        AspectInstanceId(raw)
    }

    /// The raw index
    pub const fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for AspectInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One application of an aspect class to one target declaration
///
/// Instances are immutable except for two monotonic slots: the skip flag
/// (set once, never cleared; a skipped instance stays skipped for the rest
/// of the run) and the opaque state value that user code carries across
/// processing layers.
pub struct AspectInstance {
    id: AspectInstanceId,
    class: Arc<AspectClass>,
    aspect: Arc<dyn Aspect>,
    target: DeclarationRef,
    target_depth: u32,
    inheritable: bool,
    predecessors: Vec<AspectPredecessor>,
    skipped: AtomicBool,
    state: Mutex<Option<serde_json::Value>>,
    degree: OnceLock<u32>,
    root_depth: OnceLock<u32>,
    files: OnceLock<BTreeSet<String>>,
}

impl AspectInstance {
    /// Arena index of this instance
    pub fn id(&self) -> AspectInstanceId {
        self.id
    }

    /// The class this instance belongs to
    pub fn class(&self) -> &Arc<AspectClass> {
        &self.class
    }

    /// The user aspect value
    pub fn aspect(&self) -> &Arc<dyn Aspect> {
        &self.aspect
    }

    /// Durable reference to the target declaration
    pub fn target(&self) -> &DeclarationRef {
        &self.target
    }

    /// Containment depth of the target at creation time
    pub fn target_depth(&self) -> u32 {
        self.target_depth
    }

    /// Whether this instance propagates to derived declarations
    ///
    /// Resolved once at creation from the class's inheritance setting and,
    /// for conditional classes, the aspect value itself.
    pub fn is_inheritable(&self) -> bool {
        self.inheritable
    }

    /// Provenance edges, in creation order
    pub fn predecessors(&self) -> &[AspectPredecessor] {
        &self.predecessors
    }

    /// Whether the instance has been skipped
    pub fn is_skipped(&self) -> bool {
        self.skipped.load(Ordering::Acquire)
    }

    /// Skip this instance permanently
    ///
    /// The terminal failure state: execution never revisits a skipped
    /// instance, and nothing un-skips one.
    pub fn skip(&self) {
        self.skipped.store(true, Ordering::Release);
    }

    /// The opaque cross-layer state, if any was stored
    pub fn state(&self) -> Option<serde_json::Value> {
        // User code may panic while the driver holds this lock; the stored
        // value is still coherent, so recover it instead of propagating.
        match self.state.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Store the opaque cross-layer state
    pub fn set_state(&self, state: serde_json::Value) {
        match self.state.lock() {
            Ok(mut guard) => *guard = Some(state),
            Err(poisoned) => *poisoned.into_inner() = Some(state),
        }
    }

    /// Smallest predecessor-kind rank, or -1 with no predecessors
    pub fn min_predecessor_rank(&self) -> i8 {
        self.predecessors
            .iter()
            .map(AspectPredecessor::rank)
            .min()
            .unwrap_or(-1)
    }
}

impl fmt::Debug for AspectInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AspectInstance")
            .field("id", &self.id)
            .field("class", &self.class.full_name())
            .field("target", &self.target)
            .field("target_depth", &self.target_depth)
            .field("inheritable", &self.inheritable)
            .field("predecessors", &self.predecessors.len())
            .field("skipped", &self.is_skipped())
            .finish()
    }
}

/// Append-only arena owning every aspect instance of one compilation
///
/// Creation is concurrent (many collection tasks insert at once); instances
/// are never removed. Derived values are memoized lazily per instance,
/// which matters because predecessor subtrees are shared by many
/// descendants.
#[derive(Debug, Default)]
pub struct AspectInstanceArena {
    instances: DashMap<AspectInstanceId, Arc<AspectInstance>>,
    next: AtomicU32,
}

impl AspectInstanceArena {
    /// Create an empty arena
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an instance and add it to the arena
    ///
    /// Every `Instance` predecessor edge must point into this arena;
    /// anything else panics.
    pub fn create(
        &self,
        class: Arc<AspectClass>,
        aspect: Arc<dyn Aspect>,
        target: DeclarationRef,
        target_depth: u32,
        predecessors: Vec<AspectPredecessor>,
    ) -> Arc<AspectInstance> {
        for predecessor in &predecessors {
            if let PredecessorSource::Instance(parent) = predecessor.source() {
                if !self.instances.contains_key(parent) {
                    panic!("predecessor {parent} is not in this arena");
                }
            }
        }

        let inheritable = match class.inheritance() {
            Inheritance::None => false,
            Inheritance::Always => true,
            Inheritance::Conditional => aspect.is_inheritable(),
        };

        let id = AspectInstanceId(self.next.fetch_add(1, Ordering::Relaxed));
        let instance = Arc::new(AspectInstance {
            id,
            class,
            aspect,
            target,
            target_depth,
            inheritable,
            predecessors,
            skipped: AtomicBool::new(false),
            state: Mutex::new(None),
            degree: OnceLock::new(),
            root_depth: OnceLock::new(),
            files: OnceLock::new(),
        });
        self.instances.insert(id, Arc::clone(&instance));
        instance
    }

    /// Look up an instance by id
    pub fn get(&self, id: AspectInstanceId) -> Option<Arc<AspectInstance>> {
        self.instances.get(&id).map(|entry| Arc::clone(&entry))
    }

    /// Number of instances in the arena
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Whether the arena is empty
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// All instances, ordered by id (creation order)
    pub fn instances(&self) -> Vec<Arc<AspectInstance>> {
        let mut instances: Vec<Arc<AspectInstance>> = self
            .instances
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        instances.sort_by_key(|instance| instance.id());
        instances
    }

    /// Distance of an instance from its nearest attribute or fabric root
    ///
    /// Attribute and fabric edges contribute 0 (the instance *is* the
    /// rooted application), instance edges contribute the parent's degree
    /// plus one, manifest edges contribute the degree recorded at
    /// serialization time (the cross-assembly hop is already counted in
    /// it). The degree is the minimum over all edges; an instance without
    /// predecessors has degree 0.
    pub fn degree(&self, id: AspectInstanceId) -> u32 {
        let instance = self.expect(id);
        *instance.degree.get_or_init(|| self.compute_degree(&instance))
    }

    /// Largest containment depth among an instance's root predecessors
    ///
    /// An instance without predecessors is its own root at its target
    /// depth.
    pub fn max_root_depth(&self, id: AspectInstanceId) -> u32 {
        let instance = self.expect(id);
        *instance
            .root_depth
            .get_or_init(|| self.compute_root_depth(&instance))
    }

    /// Source files whose syntax transitively caused this instance
    ///
    /// Attribute and fabric roots contribute their file; manifest edges
    /// contribute nothing because the causing syntax lives in a foreign
    /// assembly.
    pub fn contributing_files(&self, id: AspectInstanceId) -> BTreeSet<String> {
        let instance = self.expect(id);
        instance
            .files
            .get_or_init(|| self.compute_files(&instance))
            .clone()
    }

    fn expect(&self, id: AspectInstanceId) -> Arc<AspectInstance> {
        match self.get(id) {
            Some(instance) => instance,
            None => panic!("aspect instance {id} is not in this arena"),
        }
    }

    fn compute_degree(&self, instance: &AspectInstance) -> u32 {
        instance
            .predecessors()
            .iter()
            .map(|predecessor| match predecessor.source() {
                PredecessorSource::Attribute(_) | PredecessorSource::Fabric(_) => 0,
                PredecessorSource::Instance(parent) => self.degree(*parent) + 1,
                PredecessorSource::Manifest(inherited) => inherited.degree,
            })
            .min()
            .unwrap_or(0)
    }

    fn compute_root_depth(&self, instance: &AspectInstance) -> u32 {
        instance
            .predecessors()
            .iter()
            .map(|predecessor| match predecessor.source() {
                PredecessorSource::Attribute(attribute) => attribute.declaration_depth,
                PredecessorSource::Fabric(fabric) => fabric.depth,
                PredecessorSource::Instance(parent) => self.max_root_depth(*parent),
                PredecessorSource::Manifest(inherited) => inherited.target_depth,
            })
            .max()
            .unwrap_or(instance.target_depth())
    }

    fn compute_files(&self, instance: &AspectInstance) -> BTreeSet<String> {
        let mut files = BTreeSet::new();
        for predecessor in instance.predecessors() {
            match predecessor.source() {
                PredecessorSource::Attribute(attribute) => {
                    if let Some(file) = &attribute.source_file {
                        files.insert(file.clone());
                    }
                }
                PredecessorSource::Fabric(fabric) => {
                    if let Some(file) = &fabric.source_file {
                        files.insert(file.clone());
                    }
                }
                PredecessorSource::Instance(parent) => {
                    files.extend(self.contributing_files(*parent));
                }
                PredecessorSource::Manifest(_) => {}
            }
        }
        files
    }
}
