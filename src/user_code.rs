// Copyright 2025 Cowboy AI, LLC.

//! Sandbox boundary for user-supplied aspect code
//!
//! User code (build callbacks, eligibility rules, factories, deserializers)
//! must not crash the compilation. Everything that crosses into user code
//! goes through [`run_user_code`], which converts panics and errors into an
//! attributed [`AspectError::UserCode`]. Cancellation passes through
//! untouched; it is a signal, not a fault.

use crate::errors::{AspectError, AspectResult};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Run a closure of user code on behalf of an aspect class
///
/// `operation` names what was running ("build", "eligibility", "factory",
/// "deserialize") and ends up in the error message verbatim. A nested
/// sandbox failure keeps its original attribution.
pub fn run_user_code<T>(
    aspect_class: &str,
    operation: &str,
    f: impl FnOnce() -> AspectResult<T>,
) -> AspectResult<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(AspectError::Canceled)) => Err(AspectError::Canceled),
        Ok(Err(err)) if err.is_user_code() => Err(err),
        Ok(Err(err)) => Err(AspectError::user_code(
            aspect_class,
            operation,
            err.to_string(),
        )),
        Err(payload) => Err(AspectError::user_code(
            aspect_class,
            operation,
            panic_message(payload.as_ref()),
        )),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic of unknown type".to_string()
    }
}
