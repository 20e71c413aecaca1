// Copyright 2025 Cowboy AI, LLC.

//! Deterministic ordering of aspect instances
//!
//! Instances targeting the same declaration are compared by three keys,
//! first difference wins:
//!
//! 1. degree, ascending (instances closer to an attribute/fabric root run
//!    first);
//! 2. largest root depth, descending (an aspect rooted on a deep member
//!    beats one rooted on its containing type);
//! 3. smallest predecessor-kind rank, ascending (attribute beats child
//!    aspect beats required aspect beats inherited beats fabric; no
//!    predecessors ranks below attribute).
//!
//! Instances equal under all three keys keep their discovery order because
//! the sort is stable. That residual order is deliberately NOT part of the
//! contract; callers must not depend on it.

use crate::instance::{AspectInstance, AspectInstanceArena};
use std::cmp::Ordering;
use std::sync::Arc;

/// Compare two instances under the deterministic order
///
/// The comparison is a strict weak ordering over any instance set drawn
/// from `arena`.
pub fn compare_instances(
    arena: &AspectInstanceArena,
    a: &AspectInstance,
    b: &AspectInstance,
) -> Ordering {
    arena
        .degree(a.id())
        .cmp(&arena.degree(b.id()))
        .then_with(|| arena.max_root_depth(b.id()).cmp(&arena.max_root_depth(a.id())))
        .then_with(|| a.min_predecessor_rank().cmp(&b.min_predecessor_rank()))
}

/// Stable-sort instances into the deterministic order
pub fn sort_instances(arena: &AspectInstanceArena, instances: &mut [Arc<AspectInstance>]) {
    instances.sort_by(|a, b| compare_instances(arena, a, b));
}
