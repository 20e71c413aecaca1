// Copyright 2025 Cowboy AI, LLC.

//! Aspect predecessors: why an instance exists
//!
//! Every aspect instance records the causes that created it. The edges form
//! a DAG (construction order makes cycles impossible) and feed both the
//! degree computation and the deterministic ordering. Constructors are typed
//! per kind so a kind/source mismatch cannot be built.

use crate::instance::AspectInstanceId;
use crate::manifest::InheritableAspectInstance;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// How a predecessor caused an instance
///
/// The discriminants double as the tie-break rank used by instance ordering:
/// attribute-created instances sort before fabric-created ones.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
pub enum PredecessorKind {
    /// A custom attribute in source code
    Attribute,
    /// A parent aspect added this one as a child
    ChildAspect,
    /// A parent aspect required this one to be present
    RequiredAspect,
    /// Inherited from a base declaration
    Inherited,
    /// Added by a fabric
    Fabric,
}

impl PredecessorKind {
    /// Tie-break rank; lower sorts first
    pub const fn rank(self) -> i8 {
        self as i8
    }
}

impl fmt::Display for PredecessorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PredecessorKind::Attribute => write!(f, "attribute"),
            PredecessorKind::ChildAspect => write!(f, "child aspect"),
            PredecessorKind::RequiredAspect => write!(f, "required aspect"),
            PredecessorKind::Inherited => write!(f, "inherited"),
            PredecessorKind::Fabric => write!(f, "fabric"),
        }
    }
}

/// A custom attribute acting as an aspect root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct AttributeRef {
    /// Declaration bearing the attribute
    pub declaration: crate::declaration::DeclarationRef,
    /// Containment depth of the bearing declaration
    pub declaration_depth: u32,
    /// Source file containing the attribute, when known
    pub source_file: Option<String>,
}

impl AttributeRef {
    /// Create an attribute reference
    pub fn new(declaration: impl Into<crate::declaration::DeclarationRef>, depth: u32) -> Self {
        AttributeRef {
            declaration: declaration.into(),
            declaration_depth: depth,
            source_file: None,
        }
    }

    /// Attach the declaring source file
    pub fn with_source_file(mut self, file: impl Into<String>) -> Self {
        self.source_file = Some(file.into());
        self
    }
}

/// A fabric acting as an aspect root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct FabricRef {
    /// Full name of the fabric type
    pub fabric_type: String,
    /// Containment depth the fabric amends at
    pub depth: u32,
    /// Source file declaring the fabric, when known
    pub source_file: Option<String>,
}

impl FabricRef {
    /// Create a fabric reference
    pub fn new(fabric_type: impl Into<String>, depth: u32) -> Self {
        FabricRef {
            fabric_type: fabric_type.into(),
            depth,
            source_file: None,
        }
    }

    /// Attach the declaring source file
    pub fn with_source_file(mut self, file: impl Into<String>) -> Self {
        self.source_file = Some(file.into());
        self
    }
}

/// What a predecessor edge points at
#[derive(Debug, Clone)]
pub enum PredecessorSource {
    /// An attribute in the current compilation
    Attribute(AttributeRef),
    /// Another instance in the current compilation's arena
    Instance(AspectInstanceId),
    /// An instance read from a referenced assembly's manifest
    Manifest(Arc<InheritableAspectInstance>),
    /// A fabric in the current compilation
    Fabric(FabricRef),
}

/// One provenance edge of an aspect instance
#[derive(Debug, Clone)]
pub struct AspectPredecessor {
    kind: PredecessorKind,
    source: PredecessorSource,
}

impl AspectPredecessor {
    /// Edge from a custom attribute
    pub fn from_attribute(attribute: AttributeRef) -> Self {
        AspectPredecessor {
            kind: PredecessorKind::Attribute,
            source: PredecessorSource::Attribute(attribute),
        }
    }

    /// Edge from a parent instance that added this one as a child
    pub fn child_of(parent: AspectInstanceId) -> Self {
        AspectPredecessor {
            kind: PredecessorKind::ChildAspect,
            source: PredecessorSource::Instance(parent),
        }
    }

    /// Edge from a parent instance that required this one
    pub fn required_by(parent: AspectInstanceId) -> Self {
        AspectPredecessor {
            kind: PredecessorKind::RequiredAspect,
            source: PredecessorSource::Instance(parent),
        }
    }

    /// Edge from a base-declaration instance in the same compilation
    pub fn inherited_from(base: AspectInstanceId) -> Self {
        AspectPredecessor {
            kind: PredecessorKind::Inherited,
            source: PredecessorSource::Instance(base),
        }
    }

    /// Edge from an instance deserialized out of a referenced assembly
    pub fn inherited_from_manifest(source: Arc<InheritableAspectInstance>) -> Self {
        AspectPredecessor {
            kind: PredecessorKind::Inherited,
            source: PredecessorSource::Manifest(source),
        }
    }

    /// Edge from a fabric
    pub fn from_fabric(fabric: FabricRef) -> Self {
        AspectPredecessor {
            kind: PredecessorKind::Fabric,
            source: PredecessorSource::Fabric(fabric),
        }
    }

    /// The edge kind
    pub fn kind(&self) -> PredecessorKind {
        self.kind
    }

    /// The edge source
    pub fn source(&self) -> &PredecessorSource {
        &self.source
    }

    /// Tie-break rank of the edge kind
    pub fn rank(&self) -> i8 {
        self.kind.rank()
    }
}
