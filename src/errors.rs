// Copyright 2025 Cowboy AI, LLC.

//! Error types for aspect processing

use thiserror::Error;

/// Errors that can occur while building or executing aspects
///
/// Internal invariant violations are not represented here. They panic,
/// because a broken invariant means the engine itself is wrong and no
/// diagnostic can make the output trustworthy.
#[derive(Debug, Clone, Error)]
pub enum AspectError {
    /// User-supplied aspect code failed (panicked or returned an error)
    #[error("User code failed in {aspect_class}::{operation}: {message}")]
    UserCode {
        /// Full name of the aspect class whose code failed
        aspect_class: String,
        /// The operation that was running (e.g. "build", "eligibility")
        operation: String,
        /// Error message extracted from the failure
        message: String,
    },

    /// Aspect class configuration is invalid
    #[error("Invalid configuration for aspect class {aspect_class}: {reason}")]
    ClassConfiguration {
        /// Full name of the misconfigured aspect class
        aspect_class: String,
        /// Why the configuration was rejected
        reason: String,
    },

    /// A durable declaration reference no longer resolves in the snapshot
    #[error("Declaration not found: {reference}")]
    DeclarationNotFound {
        /// The reference that failed to resolve
        reference: String,
    },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A transitive aspects manifest could not be decoded
    #[error("Manifest error: {0}")]
    Manifest(String),

    /// The operation was canceled before it completed
    #[error("Operation canceled")]
    Canceled,
}

/// Result type for aspect operations
pub type AspectResult<T> = Result<T, AspectError>;

impl From<serde_json::Error> for AspectError {
    fn from(err: serde_json::Error) -> Self {
        AspectError::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for AspectError {
    fn from(err: bincode::Error) -> Self {
        AspectError::Serialization(err.to_string())
    }
}

impl AspectError {
    /// Create a user-code error for the given class and operation
    pub fn user_code(
        aspect_class: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        AspectError::UserCode {
            aspect_class: aspect_class.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Check if this error is a cancellation signal
    pub fn is_canceled(&self) -> bool {
        matches!(self, AspectError::Canceled)
    }

    /// Check if this error originated in user-supplied aspect code
    pub fn is_user_code(&self) -> bool {
        matches!(self, AspectError::UserCode { .. })
    }

    /// Check if this error is a class configuration fault
    pub fn is_configuration(&self) -> bool {
        matches!(self, AspectError::ClassConfiguration { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test error creation and display messages
    ///
    /// ```mermaid
    /// graph TD
    ///     A[AspectError] -->|Display| B[Error Message]
    ///     A -->|Clone| C[Cloned Error]
    ///     A -->|Debug| D[Debug Format]
    /// ```
    #[test]
    fn test_error_display_messages() {
        let err = AspectError::UserCode {
            aspect_class: "Acme.LogAspect".to_string(),
            operation: "build".to_string(),
            message: "index out of bounds".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "User code failed in Acme.LogAspect::build: index out of bounds"
        );

        let err = AspectError::ClassConfiguration {
            aspect_class: "Acme.CacheAspect".to_string(),
            reason: "duplicate layer name 'wrap'".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid configuration for aspect class Acme.CacheAspect: duplicate layer name 'wrap'"
        );

        let err = AspectError::DeclarationNotFound {
            reference: "M:Acme.Widget.Render".to_string(),
        };
        assert_eq!(err.to_string(), "Declaration not found: M:Acme.Widget.Render");

        let err = AspectError::Serialization("unexpected EOF".to_string());
        assert_eq!(err.to_string(), "Serialization error: unexpected EOF");

        let err = AspectError::Manifest("bad magic".to_string());
        assert_eq!(err.to_string(), "Manifest error: bad magic");

        assert_eq!(AspectError::Canceled.to_string(), "Operation canceled");
    }

    /// Test error cloning
    #[test]
    fn test_error_clone() {
        let original = AspectError::Manifest("truncated".to_string());
        let cloned = original.clone();

        assert_eq!(original.to_string(), cloned.to_string());
    }

    /// Test user_code constructor
    #[test]
    fn test_user_code_constructor() {
        let err = AspectError::user_code("Acme.LogAspect", "eligibility", "boom");
        assert_eq!(
            err.to_string(),
            "User code failed in Acme.LogAspect::eligibility: boom"
        );
        assert!(err.is_user_code());
    }

    /// Test is_canceled helper
    ///
    /// ```mermaid
    /// graph TD
    ///     A[Canceled] -->|is_canceled| B[true]
    ///     C[UserCode] -->|is_canceled| D[false]
    /// ```
    #[test]
    fn test_is_canceled() {
        assert!(AspectError::Canceled.is_canceled());

        assert!(!AspectError::user_code("A", "build", "x").is_canceled());
        assert!(!AspectError::Serialization("x".to_string()).is_canceled());
    }

    /// Test helper method exclusivity
    #[test]
    fn test_helper_method_exclusivity() {
        let user = AspectError::user_code("A", "build", "x");
        assert!(user.is_user_code());
        assert!(!user.is_canceled());
        assert!(!user.is_configuration());

        let config = AspectError::ClassConfiguration {
            aspect_class: "A".to_string(),
            reason: "bad".to_string(),
        };
        assert!(config.is_configuration());
        assert!(!config.is_user_code());
        assert!(!config.is_canceled());
    }

    /// Test serde_json error conversion
    #[test]
    fn test_serde_json_conversion() {
        let invalid_json = "{ invalid json }";
        let serde_err = serde_json::from_str::<serde_json::Value>(invalid_json).unwrap_err();

        let aspect_err: AspectError = serde_err.into();

        match aspect_err {
            AspectError::Serialization(msg) => {
                assert!(!msg.is_empty());
            }
            _ => panic!("Expected Serialization"),
        }
    }

    /// Test AspectResult type alias
    #[test]
    fn test_aspect_result() {
        let success: AspectResult<i32> = Ok(42);
        assert!(success.is_ok());
        assert_eq!(success.ok().unwrap(), 42);

        let error: AspectResult<i32> = Err(AspectError::Canceled);
        assert!(error.is_err());
        assert!(error.unwrap_err().is_canceled());
    }

    /// Test error propagation through `?` in functions
    #[test]
    fn test_error_in_functions() {
        fn may_fail(should_fail: bool) -> AspectResult<String> {
            if should_fail {
                Err(AspectError::DeclarationNotFound {
                    reference: "T:Gone".to_string(),
                })
            } else {
                Ok("resolved".to_string())
            }
        }

        let result = may_fail(false);
        assert!(result.is_ok());
        assert_eq!(result.unwrap(), "resolved");

        let result = may_fail(true);
        assert!(result.is_err());
        assert_eq!(
            result.unwrap_err().to_string(),
            "Declaration not found: T:Gone"
        );
    }
}
