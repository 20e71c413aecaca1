// Copyright 2025 Cowboy AI, LLC.

//! Declaration references, kinds, and resolved declaration views
//!
//! Aspect processing never holds live compiler symbols. Targets are durable
//! string references (`DeclarationRef`) that survive snapshot forks and are
//! re-resolved against whichever `CompilationSnapshot` a phase runs on. The
//! resolved view (`Declaration`) is a cheap immutable value object.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

/// The kind of a program declaration
///
/// This is a closed set. Dispatching code matches on it exhaustively, so an
/// unhandled kind is a compile error rather than a runtime probe.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
pub enum DeclarationKind {
    /// The whole compilation
    Compilation,
    /// A namespace
    Namespace,
    /// A named type (class, struct, interface, enum)
    Type,
    /// A method
    Method,
    /// A constructor
    Constructor,
    /// A field
    Field,
    /// A property
    Property,
    /// An event
    Event,
    /// A parameter of a method or constructor
    Parameter,
    /// A generic type parameter
    TypeParameter,
}

impl DeclarationKind {
    /// All kinds, in declaration order
    pub const ALL: [DeclarationKind; 10] = [
        DeclarationKind::Compilation,
        DeclarationKind::Namespace,
        DeclarationKind::Type,
        DeclarationKind::Method,
        DeclarationKind::Constructor,
        DeclarationKind::Field,
        DeclarationKind::Property,
        DeclarationKind::Event,
        DeclarationKind::Parameter,
        DeclarationKind::TypeParameter,
    ];

    const fn bit(self) -> u16 {
        1 << self as u16
    }

    /// Human-readable name, as used in diagnostics
    pub fn name(&self) -> &'static str {
        match self {
            DeclarationKind::Compilation => "compilation",
            DeclarationKind::Namespace => "namespace",
            DeclarationKind::Type => "type",
            DeclarationKind::Method => "method",
            DeclarationKind::Constructor => "constructor",
            DeclarationKind::Field => "field",
            DeclarationKind::Property => "property",
            DeclarationKind::Event => "event",
            DeclarationKind::Parameter => "parameter",
            DeclarationKind::TypeParameter => "type parameter",
        }
    }
}

impl fmt::Display for DeclarationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A set of declaration kinds, stored as a bitmask
///
/// Eligibility rules and aspect classes are scoped by kind sets. Membership
/// tests are a single AND.
///
/// # Examples
///
/// ```rust
/// use cim_aspects::{DeclarationKind, DeclarationKindSet};
///
/// let set = DeclarationKindSet::of(DeclarationKind::Method)
///     | DeclarationKindSet::of(DeclarationKind::Property);
/// assert!(set.contains(DeclarationKind::Method));
/// assert!(!set.contains(DeclarationKind::Field));
/// ```
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default,
)]
pub struct DeclarationKindSet(u16);

impl DeclarationKindSet {
    /// The empty set
    pub const NONE: DeclarationKindSet = DeclarationKindSet(0);

    /// Every declaration kind
    pub const ANY: DeclarationKindSet = DeclarationKindSet::from_kinds(&DeclarationKind::ALL);

    /// Type members: methods, constructors, fields, properties, events
    pub const MEMBERS: DeclarationKindSet = DeclarationKindSet::from_kinds(&[
        DeclarationKind::Method,
        DeclarationKind::Constructor,
        DeclarationKind::Field,
        DeclarationKind::Property,
        DeclarationKind::Event,
    ]);

    /// Types and their members
    pub const TYPES_AND_MEMBERS: DeclarationKindSet =
        DeclarationKindSet(DeclarationKind::Type.bit() | DeclarationKindSet::MEMBERS.0);

    /// Create a set containing a single kind
    pub const fn of(kind: DeclarationKind) -> Self {
        DeclarationKindSet(kind.bit())
    }

    /// Create a set from a slice of kinds
    pub const fn from_kinds(kinds: &[DeclarationKind]) -> Self {
        let mut bits = 0u16;
        let mut i = 0;
        while i < kinds.len() {
            bits |= kinds[i].bit();
            i += 1;
        }
        DeclarationKindSet(bits)
    }

    /// Check whether the set contains a kind
    pub const fn contains(&self, kind: DeclarationKind) -> bool {
        self.0 & kind.bit() != 0
    }

    /// Check whether the set is empty
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Union with another set
    pub const fn union(&self, other: DeclarationKindSet) -> Self {
        DeclarationKindSet(self.0 | other.0)
    }

    /// Intersection with another set
    pub const fn intersect(&self, other: DeclarationKindSet) -> Self {
        DeclarationKindSet(self.0 & other.0)
    }

    /// Iterate over the kinds in the set
    pub fn iter(&self) -> impl Iterator<Item = DeclarationKind> + '_ {
        DeclarationKind::ALL
            .into_iter()
            .filter(|kind| self.contains(*kind))
    }
}

impl BitOr for DeclarationKindSet {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl BitOrAssign for DeclarationKindSet {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for DeclarationKindSet {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        self.intersect(rhs)
    }
}

impl From<DeclarationKind> for DeclarationKindSet {
    fn from(kind: DeclarationKind) -> Self {
        DeclarationKindSet::of(kind)
    }
}

/// A durable reference to a declaration
///
/// Wraps a symbol-id string (e.g. `"T:Acme.Widget"`, `"M:Acme.Widget.Render"`)
/// that stays valid across compilation snapshots. Resolution back to a
/// `Declaration` goes through `CompilationSnapshot::resolve`.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
pub struct DeclarationRef(String);

impl DeclarationRef {
    /// Create a reference from a symbol id
    pub fn new(symbol_id: impl Into<String>) -> Self {
        DeclarationRef(symbol_id.into())
    }

    /// The underlying symbol id
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeclarationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DeclarationRef {
    fn from(s: &str) -> Self {
        DeclarationRef::new(s)
    }
}

impl From<String> for DeclarationRef {
    fn from(s: String) -> Self {
        DeclarationRef(s)
    }
}

/// A declaration resolved against a specific compilation snapshot
///
/// Value object, valid only relative to the snapshot that produced it.
/// Depth follows containment: top-level namespaces are 0, a type inside one
/// is 1, its members are 2, their parameters 3.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Declaration {
    /// Durable reference to this declaration
    pub reference: DeclarationRef,
    /// What kind of declaration this is
    pub kind: DeclarationKind,
    /// Short name (not fully qualified)
    pub name: String,
    /// Containment depth within the compilation
    pub depth: u32,
    /// Containing declaration, if any
    pub parent: Option<DeclarationRef>,
    /// Whether this declaration sits inside a function body
    pub is_local: bool,
    /// Whether this declaration is abstract
    pub is_abstract: bool,
    /// Source file that declares it, when it has one
    pub source_file: Option<String>,
}

impl Declaration {
    /// Create a declaration view with no parent and no flags set
    pub fn new(
        reference: impl Into<DeclarationRef>,
        kind: DeclarationKind,
        name: impl Into<String>,
        depth: u32,
    ) -> Self {
        Declaration {
            reference: reference.into(),
            kind,
            name: name.into(),
            depth,
            parent: None,
            is_local: false,
            is_abstract: false,
            source_file: None,
        }
    }

    /// Set the containing declaration
    pub fn with_parent(mut self, parent: impl Into<DeclarationRef>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    /// Set the declaring source file
    pub fn with_source_file(mut self, file: impl Into<String>) -> Self {
        self.source_file = Some(file.into());
        self
    }

    /// Mark the declaration as local to a function body
    pub fn as_local(mut self) -> Self {
        self.is_local = true;
        self
    }

    /// Mark the declaration as abstract
    pub fn as_abstract(mut self) -> Self {
        self.is_abstract = true;
        self
    }
}
