// Copyright 2025 Cowboy AI, LLC.

//! The aspect trait and its factory seams
//!
//! User aspect logic enters the engine only as `Arc<dyn Aspect>`. The engine
//! never knows concrete aspect types; hosts downcast through `as_any` when
//! their templates need the original value back.

use crate::declaration::Declaration;
use crate::diagnostics::DiagnosticSink;
use crate::driver::{AspectBuilder, Transformation};
use crate::errors::AspectResult;
use std::any::Any;
use std::sync::Arc;

/// A unit of user-authored cross-cutting behavior
///
/// Implementations must be cheap to share: the same aspect value may be held
/// by several instances (inheritance re-targets the value, it does not clone
/// the logic).
///
/// # Examples
///
/// ```rust
/// use cim_aspects::{Aspect, AspectBuilder, AspectResult};
/// use std::any::Any;
///
/// #[derive(Debug)]
/// struct LogAspect {
///     category: String,
/// }
///
/// impl Aspect for LogAspect {
///     fn build(&self, builder: &mut AspectBuilder<'_>) -> AspectResult<()> {
///         builder.add_transformation(format!("log[{}]", self.category));
///         Ok(())
///     }
///
///     fn as_any(&self) -> &dyn Any {
///         self
///     }
///
///     fn to_json(&self) -> AspectResult<serde_json::Value> {
///         Ok(serde_json::json!({ "category": self.category }))
///     }
/// }
/// ```
pub trait Aspect: Send + Sync {
    /// Apply the aspect to its target through the builder
    ///
    /// Runs inside the user-code sandbox. Returning an error (or panicking)
    /// fails this instance permanently without crashing the run.
    fn build(&self, builder: &mut AspectBuilder<'_>) -> AspectResult<()>;

    /// Access the concrete aspect value
    fn as_any(&self) -> &dyn Any;

    /// Serialize the aspect for the transitive manifest
    fn to_json(&self) -> AspectResult<serde_json::Value>;

    /// Whether this particular aspect value propagates to derived targets
    ///
    /// Consulted only when the class declares conditional inheritance; for
    /// classes with fixed inheritance the class setting wins.
    fn is_inheritable(&self) -> bool {
        true
    }
}

/// Creates an aspect value for a target declaration
///
/// Registered per class; used to materialize required aspects where no user
/// attribute supplies a value.
pub type AspectFactory =
    Arc<dyn Fn(&Declaration) -> AspectResult<Arc<dyn Aspect>> + Send + Sync>;

/// Rebuilds an aspect value from its manifest payload
///
/// Registered per class; mandatory for inheritable classes because their
/// instances must cross assembly boundaries as JSON.
pub type AspectDeserializer =
    Arc<dyn Fn(&serde_json::Value) -> AspectResult<Arc<dyn Aspect>> + Send + Sync>;

/// A code weaver bound to an aspect class
///
/// Weaver-bound classes skip the build callback; the weaver produces the
/// transformations for the whole instance in one call.
pub trait AspectWeaver: Send + Sync {
    /// Identifier matched against `AspectClass::weaver_type`
    fn weaver_type(&self) -> &str;

    /// Produce the transformations for one instance
    fn weave(
        &self,
        aspect: &dyn Aspect,
        target: &Declaration,
        diagnostics: &mut DiagnosticSink,
    ) -> AspectResult<Vec<Transformation>>;
}
