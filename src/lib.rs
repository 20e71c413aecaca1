// Copyright 2025 Cowboy AI, LLC.

//! # CIM Aspects
//!
//! Deterministic aspect ordering, aggregation, and cross-assembly
//! inheritance for compile-time metaprogramming hosts.
//!
//! This crate provides the machinery a weaving compiler needs between
//! "aspects were discovered" and "aspects are applied":
//! - **Aspect classes**: per-type configuration (layers, eligibility,
//!   inheritance, weaver binding) shared by every instance
//! - **Aspect instances**: one application of an aspect to a declaration,
//!   with full provenance through predecessor edges
//! - **Deterministic ordering**: causal degree, then root depth, then
//!   predecessor kind, independent of discovery order
//! - **Aggregation**: duplicate instances on one target merge under a
//!   single executing primary
//! - **Eligibility**: scenario-masked rules that veto application or
//!   inheritance per declaration
//! - **Execution**: the sandboxed driver that runs user aspect code and
//!   turns it into transformations and diagnostics
//! - **Inheritance**: single-hop propagation to derived declarations,
//!   within the compilation and across assembly boundaries through
//!   compressed binary manifests
//!
//! ## Design Principles
//!
//! 1. **Determinism**: identical inputs produce identical order, primaries,
//!    and diagnostics regardless of discovery interleaving
//! 2. **Isolation**: user aspect code runs sandboxed; its failures become
//!    diagnostics on the instance, never engine faults
//! 3. **Provenance**: every instance can name the attribute, fabric,
//!    aspect, or manifest that caused it
//! 4. **Graceful degradation**: unreadable manifests and unknown classes
//!    warn and degrade instead of failing the compilation

#![warn(missing_docs)]

mod aggregate;
mod aspect;
mod aspect_class;
mod collector;
mod declaration;
mod diagnostics;
mod driver;
pub mod eligibility;
mod errors;
mod inheritance;
mod instance;
mod manifest;
mod ordering;
mod pipeline;
mod predecessor;
mod snapshot;
mod transitive;
mod user_code;

// Re-export core types
pub use aggregate::{aggregate, AggregatedAspectInstance};
pub use aspect::{Aspect, AspectDeserializer, AspectFactory, AspectWeaver};
pub use aspect_class::{AspectClass, AspectClassBuilder, AspectClassRegistry, Inheritance};
pub use collector::{
    CollectedAspect, CollectedExclusion, CollectedOptions, CollectedRequirement,
    DeclarationValidator, OutboundActionCollector,
};
pub use declaration::{Declaration, DeclarationKind, DeclarationKindSet, DeclarationRef};
pub use diagnostics::{descriptors, Diagnostic, DiagnosticDescriptor, DiagnosticSink, Severity};
pub use driver::{
    sort_declarative_advice, AdviceKind, AspectBuilder, AspectDriver, AspectExecutionResult,
    DeclarativeAdvice, ExecutionOutcome, Transformation, WeaverRegistry,
};
pub use eligibility::{EligibilityRule, EligibleScenarios, FnRule};
pub use errors::{AspectError, AspectResult};
pub use inheritance::{AspectSource, InheritanceAspectSource};
pub use instance::{AspectInstance, AspectInstanceArena, AspectInstanceId};
pub use manifest::{
    build_manifest, InheritableAspectInstance, ReferenceValidator, TransitiveAspectsManifest,
    MANIFEST_FORMAT_VERSION, MANIFEST_RESOURCE_NAME,
};
pub use ordering::{compare_instances, sort_instances};
pub use pipeline::{
    collect_aspect_instances, AspectSeed, CancellationToken, CollectionOutcome, PipelineConfig,
    SeedOrigin,
};
pub use predecessor::{
    AspectPredecessor, AttributeRef, FabricRef, PredecessorKind, PredecessorSource,
};
pub use snapshot::{AssemblyIdentity, CompilationBuilder, CompilationSnapshot, InMemoryCompilation};
pub use transitive::{
    InMemoryManifestProvider, ManifestCache, ResourceManifestProvider, TransitiveAspectSource,
    TransitiveManifestProvider,
};
pub use user_code::run_user_code;
