// Copyright 2025 Cowboy AI, LLC.

//! Execution semantics of the aspect driver
//!
//! Failure isolation is the contract under test: a misbehaving user aspect
//! produces a diagnostic and a permanently skipped instance, never an
//! engine fault, and a skipped instance stays inert for the rest of the
//! run.

use cim_aspects::{
    descriptors, AdviceKind, Aspect, AspectBuilder, AspectClass, AspectDriver, AspectError,
    AspectInstance, AspectInstanceArena, AspectPredecessor, AspectResult, AspectWeaver,
    AssemblyIdentity, AttributeRef, CancellationToken, CompilationBuilder, CompilationSnapshot,
    Declaration, DeclarationKind, DeclarationKindSet, DeclarationRef, DeclarationValidator,
    DeclarativeAdvice, DiagnosticSink, ExecutionOutcome, InMemoryCompilation, PipelineConfig,
    Transformation, WeaverRegistry,
};
use mockall::mock;
use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use test_case::test_case;
use uuid::Uuid;

/// Counts build invocations; behavior is injected per test
struct CountingAspect {
    builds: Arc<AtomicUsize>,
    behavior: fn(&mut AspectBuilder<'_>) -> AspectResult<()>,
}

impl std::fmt::Debug for CountingAspect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CountingAspect").finish_non_exhaustive()
    }
}

impl Aspect for CountingAspect {
    fn build(&self, builder: &mut AspectBuilder<'_>) -> AspectResult<()> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        (self.behavior)(builder)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn to_json(&self) -> AspectResult<serde_json::Value> {
        Ok(serde_json::json!({}))
    }
}

fn snapshot() -> InMemoryCompilation {
    CompilationBuilder::new("Acme.App", "1.0.0")
        .namespace("N:Acme", "Acme")
        .type_in("N:Acme", "T:Acme.Widget", "Widget")
        .member(
            "T:Acme.Widget",
            DeclarationKind::Method,
            "M:Acme.Widget.Render",
            "Render",
        )
        .build()
}

fn config() -> PipelineConfig {
    PipelineConfig::new("Acme.App", AssemblyIdentity::new("Acme.App", "1.0.0"))
}

fn instance_of(
    arena: &AspectInstanceArena,
    class: Arc<AspectClass>,
    target: &str,
    builds: &Arc<AtomicUsize>,
    behavior: fn(&mut AspectBuilder<'_>) -> AspectResult<()>,
) -> Arc<AspectInstance> {
    arena.create(
        class,
        Arc::new(CountingAspect {
            builds: Arc::clone(builds),
            behavior,
        }),
        DeclarationRef::new(target),
        2,
        vec![AspectPredecessor::from_attribute(AttributeRef::new(
            target, 2,
        ))],
    )
}

/// A failing build skips the instance permanently
///
/// ```mermaid
/// graph TD
///     E1[execute] -->|panic in build| R1[Error + ASP0002 + skip]
///     E2[execute again] -->|skipped| R2[neutral, build not invoked]
/// ```
#[test]
fn failing_build_skips_permanently() {
    let arena = AspectInstanceArena::new();
    let builds = Arc::new(AtomicUsize::new(0));
    let class = Arc::new(AspectClass::builder("Acme.Retry").build().unwrap());
    let instance = instance_of(&arena, class, "M:Acme.Widget.Render", &builds, |_| {
        panic!("user aspect blew up")
    });

    let driver = AspectDriver::new();
    let snapshot = snapshot();
    let config = config();
    let cancellation = CancellationToken::new();

    let result = driver
        .execute(&instance, None, &snapshot, &snapshot, &config, &cancellation)
        .unwrap();

    assert_eq!(result.outcome, ExecutionOutcome::Error);
    assert!(instance.is_skipped());
    assert!(result.transformations.is_empty());
    assert_eq!(result.diagnostics.len(), 1);
    let diagnostic = &result.diagnostics.diagnostics()[0];
    assert_eq!(diagnostic.code, "ASP0002");
    assert!(diagnostic.message.contains("user aspect blew up"));
    assert_eq!(builds.load(Ordering::SeqCst), 1);

    // Re-execution is neutral and never re-enters user code.
    let again = driver
        .execute(&instance, None, &snapshot, &snapshot, &config, &cancellation)
        .unwrap();
    assert_eq!(again.outcome, ExecutionOutcome::Ignored);
    assert!(again.diagnostics.is_empty());
    assert_eq!(builds.load(Ordering::SeqCst), 1);
}

/// A clean build applies with its transformations and outbound actions
#[test]
fn successful_build_applies() {
    let arena = AspectInstanceArena::new();
    let builds = Arc::new(AtomicUsize::new(0));
    let class = Arc::new(AspectClass::builder("Acme.Log").build().unwrap());
    let instance = instance_of(&arena, class, "M:Acme.Widget.Render", &builds, |builder| {
        builder.add_transformation(
            Transformation::new("wrap body in log scope").on(builder.target().reference.clone()),
        );
        builder.add_options("T:Acme.Widget", serde_json::json!({ "verbosity": "debug" }));
        Ok(())
    });

    let result = AspectDriver::new()
        .execute(
            &instance,
            None,
            &snapshot(),
            &snapshot(),
            &config(),
            &CancellationToken::new(),
        )
        .unwrap();

    assert_eq!(result.outcome, ExecutionOutcome::Applied);
    assert!(!instance.is_skipped());
    assert_eq!(result.transformations.len(), 1);
    assert_eq!(result.transformations[0].description, "wrap body in log scope");
    assert_eq!(result.option_sources.len(), 1);
    assert!(result.diagnostics.is_empty());
}

/// An error diagnostic fails the execution even when build returns Ok
#[test]
fn reported_error_discards_transformations() {
    let arena = AspectInstanceArena::new();
    let builds = Arc::new(AtomicUsize::new(0));
    let class = Arc::new(AspectClass::builder("Acme.Strict").build().unwrap());
    let instance = instance_of(&arena, class, "M:Acme.Widget.Render", &builds, |builder| {
        builder.add_transformation("half-finished change");
        builder.report(
            descriptors::NOT_ELIGIBLE.create("cannot apply to this method after all"),
        );
        Ok(())
    });

    let result = AspectDriver::new()
        .execute(
            &instance,
            None,
            &snapshot(),
            &snapshot(),
            &config(),
            &CancellationToken::new(),
        )
        .unwrap();

    assert_eq!(result.outcome, ExecutionOutcome::Error);
    assert!(instance.is_skipped());
    assert!(result.transformations.is_empty());
}

/// skip_aspect ends the execution as ignored without skipping future runs
#[test]
fn skip_aspect_is_per_execution() {
    let arena = AspectInstanceArena::new();
    let builds = Arc::new(AtomicUsize::new(0));
    let class = Arc::new(AspectClass::builder("Acme.Maybe").build().unwrap());
    let instance = instance_of(&arena, class, "M:Acme.Widget.Render", &builds, |builder| {
        builder.skip_aspect();
        Ok(())
    });

    let result = AspectDriver::new()
        .execute(
            &instance,
            None,
            &snapshot(),
            &snapshot(),
            &config(),
            &CancellationToken::new(),
        )
        .unwrap();

    assert_eq!(result.outcome, ExecutionOutcome::Ignored);
    assert!(!instance.is_skipped());
}

/// Target kinds are enforced before any user code runs
#[test_case(DeclarationKind::Method, "T:Acme.Widget" ; "method aspect on a type")]
#[test_case(DeclarationKind::Property, "M:Acme.Widget.Render" ; "property aspect on a method")]
fn wrong_target_kind_is_rejected(allowed: DeclarationKind, target: &str) {
    let arena = AspectInstanceArena::new();
    let builds = Arc::new(AtomicUsize::new(0));
    let class = Arc::new(
        AspectClass::builder("Acme.Narrow")
            .targets(DeclarationKindSet::of(allowed))
            .build()
            .unwrap(),
    );
    let instance = instance_of(&arena, class, target, &builds, |_| Ok(()));

    let result = AspectDriver::new()
        .execute(
            &instance,
            None,
            &snapshot(),
            &snapshot(),
            &config(),
            &CancellationToken::new(),
        )
        .unwrap();

    assert_eq!(result.outcome, ExecutionOutcome::Error);
    assert!(instance.is_skipped());
    assert_eq!(result.diagnostics.diagnostics()[0].code, "ASP0001");
    assert_eq!(builds.load(Ordering::SeqCst), 0);
}

/// Declarative advice runs before build, in kind-rank then name order
#[test]
fn advice_runs_before_build_in_order() {
    fn record(builder: &mut AspectBuilder<'_>, label: &str) {
        builder.add_transformation(format!("advice:{label}"));
    }

    let arena = AspectInstanceArena::new();
    let builds = Arc::new(AtomicUsize::new(0));
    let class = Arc::new(
        AspectClass::builder("Acme.Advised")
            .advice(DeclarativeAdvice::new(AdviceKind::Method, "Close", |b| {
                record(b, "method");
                Ok(())
            }))
            .advice(DeclarativeAdvice::new(AdviceKind::Field, "_handle", |b| {
                record(b, "field");
                Ok(())
            }))
            .advice(DeclarativeAdvice::new(
                AdviceKind::Constructor,
                ".ctor",
                |b| {
                    record(b, "ctor");
                    Ok(())
                },
            ))
            .build()
            .unwrap(),
    );
    let instance = instance_of(&arena, class, "T:Acme.Widget", &builds, |builder| {
        builder.add_transformation("build");
        Ok(())
    });

    let result = AspectDriver::new()
        .execute(
            &instance,
            None,
            &snapshot(),
            &snapshot(),
            &config(),
            &CancellationToken::new(),
        )
        .unwrap();

    let order: Vec<&str> = result
        .transformations
        .iter()
        .map(|t| t.description.as_str())
        .collect();
    assert_eq!(
        order,
        vec!["advice:field", "advice:ctor", "advice:method", "build"]
    );
}

struct RecordingWeaver;

impl AspectWeaver for RecordingWeaver {
    fn weaver_type(&self) -> &str {
        "Acme.NullabilityWeaver"
    }

    fn weave(
        &self,
        _aspect: &dyn Aspect,
        target: &Declaration,
        _diagnostics: &mut DiagnosticSink,
    ) -> AspectResult<Vec<Transformation>> {
        Ok(vec![Transformation::new(format!(
            "annotate {}",
            target.name
        ))])
    }
}

/// A weaver-bound class bypasses build and a missing weaver does not skip
#[test]
fn weaver_binding() {
    let arena = AspectInstanceArena::new();
    let builds = Arc::new(AtomicUsize::new(0));
    let class = Arc::new(
        AspectClass::builder("Acme.Nullability")
            .weaver("Acme.NullabilityWeaver")
            .build()
            .unwrap(),
    );
    let instance = instance_of(&arena, class, "T:Acme.Widget", &builds, |_| Ok(()));
    let driver = AspectDriver::new();
    let snapshot = snapshot();
    let cancellation = CancellationToken::new();

    // The weaver's project may still be compiling, so the instance is
    // left alive for a later attempt.
    let missing = driver
        .execute(
            &instance,
            None,
            &snapshot,
            &snapshot,
            &config(),
            &cancellation,
        )
        .unwrap();
    assert_eq!(missing.outcome, ExecutionOutcome::Error);
    assert_eq!(missing.diagnostics.diagnostics()[0].code, "ASP0004");
    assert!(!instance.is_skipped());

    let weavers = WeaverRegistry::new();
    weavers.register(Arc::new(RecordingWeaver));
    let configured = config().with_weavers(Arc::new(weavers));

    let woven = driver
        .execute(
            &instance,
            None,
            &snapshot,
            &snapshot,
            &configured,
            &cancellation,
        )
        .unwrap();
    assert_eq!(woven.outcome, ExecutionOutcome::Applied);
    assert_eq!(woven.transformations[0].description, "annotate Widget");
    assert_eq!(builds.load(Ordering::SeqCst), 0);
}

/// Validators emitted by the build run against the initial snapshot
#[test]
fn validators_run_against_initial_snapshot() {
    let arena = AspectInstanceArena::new();
    let builds = Arc::new(AtomicUsize::new(0));
    let class = Arc::new(AspectClass::builder("Acme.Guard").build().unwrap());
    let instance = instance_of(&arena, class, "T:Acme.Widget", &builds, |builder| {
        builder.add_validator(DeclarationValidator::new(
            "M:Acme.Widget.Render",
            |declaration, sink| {
                sink.report(descriptors::NOT_ELIGIBLE.create_at(
                    format!("'{}' must not be woven", declaration.name),
                    declaration.reference.clone(),
                ));
            },
        ));
        Ok(())
    });

    let result = AspectDriver::new()
        .execute(
            &instance,
            None,
            &snapshot(),
            &snapshot(),
            &config(),
            &CancellationToken::new(),
        )
        .unwrap();

    // Validator findings arrive after the outcome is decided.
    assert_eq!(result.outcome, ExecutionOutcome::Applied);
    assert_eq!(result.diagnostics.len(), 1);
    assert!(result.diagnostics.diagnostics()[0]
        .message
        .contains("'Render' must not be woven"));
}

/// Cancellation surfaces as an error, not a result
#[test]
fn cancellation_wins() {
    let arena = AspectInstanceArena::new();
    let builds = Arc::new(AtomicUsize::new(0));
    let class = Arc::new(AspectClass::builder("Acme.Log").build().unwrap());
    let instance = instance_of(&arena, class, "T:Acme.Widget", &builds, |_| Ok(()));

    let cancellation = CancellationToken::new();
    cancellation.cancel();

    let err = AspectDriver::new()
        .execute(
            &instance,
            None,
            &snapshot(),
            &snapshot(),
            &config(),
            &cancellation,
        )
        .unwrap_err();
    assert!(err.is_canceled());
    assert!(!instance.is_skipped());
}

mock! {
    Snapshot {}

    impl CompilationSnapshot for Snapshot {
        fn snapshot_id(&self) -> Uuid;
        fn assembly(&self) -> AssemblyIdentity;
        fn resolve(&self, reference: &DeclarationRef) -> Option<Declaration>;
        fn direct_derived(&self, base: &DeclarationRef) -> Vec<DeclarationRef>;
        fn references(&self) -> Vec<AssemblyIdentity>;
    }
}

/// A target that no longer resolves is an engine-level error
#[test]
fn vanished_target_is_an_engine_error() {
    let arena = AspectInstanceArena::new();
    let builds = Arc::new(AtomicUsize::new(0));
    let class = Arc::new(AspectClass::builder("Acme.Log").build().unwrap());
    let instance = instance_of(&arena, class, "T:Acme.Gone", &builds, |_| Ok(()));

    let mut snapshot = MockSnapshot::new();
    snapshot.expect_resolve().returning(|_| None);
    snapshot.expect_snapshot_id().return_const(Uuid::nil());

    let err = AspectDriver::new()
        .execute(
            &instance,
            None,
            &snapshot,
            &snapshot,
            &config(),
            &CancellationToken::new(),
        )
        .unwrap_err();

    assert!(matches!(err, AspectError::DeclarationNotFound { .. }));
    assert_eq!(builds.load(Ordering::SeqCst), 0);
}
