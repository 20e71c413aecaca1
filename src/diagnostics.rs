// Copyright 2025 Cowboy AI, LLC.

//! Diagnostics reported during aspect processing
//!
//! Every user-visible problem carries a stable code so build logs and
//! suppressions keep working across releases. Codes are never reused.

use crate::declaration::DeclarationRef;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity of a diagnostic
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
pub enum Severity {
    /// Informational, not shown by default
    Info,
    /// Warning, does not fail the build
    Warning,
    /// Error, fails the build
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

/// A fixed diagnostic definition with a stable code
///
/// Instances live in [`descriptors`]. A descriptor is a template; calling
/// [`DiagnosticDescriptor::create`] stamps out a concrete [`Diagnostic`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiagnosticDescriptor {
    /// Stable code, `ASP` followed by four digits
    pub code: &'static str,
    /// Severity every instance of this diagnostic carries
    pub severity: Severity,
    /// Short title describing the problem class
    pub title: &'static str,
}

impl DiagnosticDescriptor {
    /// Create a diagnostic from this descriptor
    pub fn create(&self, message: impl Into<String>) -> Diagnostic {
        Diagnostic {
            code: self.code.to_string(),
            severity: self.severity,
            message: message.into(),
            location: None,
        }
    }

    /// Create a diagnostic attached to a declaration
    pub fn create_at(&self, message: impl Into<String>, location: DeclarationRef) -> Diagnostic {
        Diagnostic {
            code: self.code.to_string(),
            severity: self.severity,
            message: message.into(),
            location: Some(location),
        }
    }
}

/// The well-known diagnostic descriptors
pub mod descriptors {
    use super::{DiagnosticDescriptor, Severity};

    /// Aspect applied to a declaration kind outside its declared target set
    pub const INCORRECT_TARGET_KIND: DiagnosticDescriptor = DiagnosticDescriptor {
        code: "ASP0001",
        severity: Severity::Error,
        title: "Aspect applied to incorrect declaration kind",
    };

    /// User-supplied aspect code failed while executing
    pub const USER_CODE_FAILURE: DiagnosticDescriptor = DiagnosticDescriptor {
        code: "ASP0002",
        severity: Severity::Error,
        title: "User code failed while executing aspect",
    };

    /// Aspect class definition is invalid; the class is excluded
    pub const CLASS_CONFIGURATION: DiagnosticDescriptor = DiagnosticDescriptor {
        code: "ASP0003",
        severity: Severity::Error,
        title: "Invalid aspect class configuration",
    };

    /// Aspect class is bound to a weaver nothing registered
    pub const MISSING_WEAVER: DiagnosticDescriptor = DiagnosticDescriptor {
        code: "ASP0004",
        severity: Severity::Error,
        title: "No weaver registered for aspect class",
    };

    /// A referenced assembly carries a manifest that could not be read
    pub const MANIFEST_UNREADABLE: DiagnosticDescriptor = DiagnosticDescriptor {
        code: "ASP0005",
        severity: Severity::Warning,
        title: "Transitive aspects manifest could not be read",
    };

    /// A manifest names an aspect class this compilation does not know
    pub const UNKNOWN_ASPECT_CLASS: DiagnosticDescriptor = DiagnosticDescriptor {
        code: "ASP0006",
        severity: Severity::Warning,
        title: "Inherited aspect class is not known to this compilation",
    };

    /// An aspect requirement names a class without a registered factory
    pub const REQUIREMENT_WITHOUT_FACTORY: DiagnosticDescriptor = DiagnosticDescriptor {
        code: "ASP0007",
        severity: Severity::Error,
        title: "Required aspect class has no factory",
    };

    /// A declaration was targeted by an aspect it is not eligible for
    pub const NOT_ELIGIBLE: DiagnosticDescriptor = DiagnosticDescriptor {
        code: "ASP0008",
        severity: Severity::Error,
        title: "Declaration is not eligible for aspect",
    };
}

/// A single reported diagnostic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Diagnostic {
    /// Stable diagnostic code
    pub code: String,
    /// Severity
    pub severity: Severity,
    /// Formatted message
    pub message: String,
    /// Declaration the diagnostic is attributed to, if any
    pub location: Option<DeclarationRef>,
}

impl Diagnostic {
    /// Whether this diagnostic fails the build
    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(location) => write!(
                f,
                "{} {}: {} (at {})",
                self.severity, self.code, self.message, location
            ),
            None => write!(f, "{} {}: {}", self.severity, self.code, self.message),
        }
    }
}

/// An ordered accumulator for diagnostics produced by one execution
///
/// Each driver execution owns its sink; the pipeline merges sinks after the
/// fan-out joins, so sinks themselves need no synchronization.
#[derive(Debug, Default, Clone)]
pub struct DiagnosticSink {
    diagnostics: Vec<Diagnostic>,
}

impl DiagnosticSink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Report one diagnostic
    pub fn report(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.push(diagnostic);
    }

    /// Absorb another sink's diagnostics, preserving order
    pub fn extend(&mut self, other: DiagnosticSink) {
        self.diagnostics.extend(other.diagnostics);
    }

    /// Whether any reported diagnostic is an error
    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(Diagnostic::is_error)
    }

    /// Number of reported diagnostics
    pub fn len(&self) -> usize {
        self.diagnostics.len()
    }

    /// Whether the sink is empty
    pub fn is_empty(&self) -> bool {
        self.diagnostics.is_empty()
    }

    /// View the reported diagnostics
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// Consume the sink, yielding the diagnostics in report order
    pub fn into_vec(self) -> Vec<Diagnostic> {
        self.diagnostics
    }
}
