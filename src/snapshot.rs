// Copyright 2025 Cowboy AI, LLC.

//! Compilation snapshots
//!
//! The engine sees the program being compiled only through the
//! [`CompilationSnapshot`] trait: an immutable, versioned view that resolves
//! durable references and answers derivation queries. Hosts adapt their
//! compiler model to this trait; [`InMemoryCompilation`] is the reference
//! implementation used by tests and by hosts that already hold a flat model.

use crate::declaration::{Declaration, DeclarationKind, DeclarationRef};
use indexmap::IndexMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Identity of a compiled assembly
///
/// Used as the lookup key for transitive aspect manifests and recorded in
/// every manifest as its source.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
pub struct AssemblyIdentity {
    /// Simple assembly name (e.g. "Acme.Core")
    pub name: String,
    /// Version string (e.g. "1.2.0")
    pub version: String,
}

impl AssemblyIdentity {
    /// Create an assembly identity
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        AssemblyIdentity {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for AssemblyIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, Version={}", self.name, self.version)
    }
}

/// An immutable view of one compilation state
///
/// Snapshots are versioned: the driver re-resolves every target against the
/// snapshot it was handed, never against cached declarations, because a
/// reference created in an earlier phase may point at a declaration a later
/// snapshot has changed or removed.
pub trait CompilationSnapshot: Send + Sync {
    /// Unique id of this snapshot
    fn snapshot_id(&self) -> Uuid;

    /// Identity of the assembly being compiled
    fn assembly(&self) -> AssemblyIdentity;

    /// Resolve a durable reference, if it still names a declaration
    fn resolve(&self, reference: &DeclarationRef) -> Option<Declaration>;

    /// Declarations that directly derive from the given one
    ///
    /// For types this means direct subtypes; for virtual members, direct
    /// overrides. One hop only; transitive closure is the caller's loop.
    fn direct_derived(&self, base: &DeclarationRef) -> Vec<DeclarationRef>;

    /// Identities of the referenced, already-compiled assemblies
    fn references(&self) -> Vec<AssemblyIdentity>;

    /// Containment depth of a declaration, if it resolves
    fn depth(&self, reference: &DeclarationRef) -> Option<u32> {
        self.resolve(reference).map(|d| d.depth)
    }
}

/// Reference snapshot implementation over a flat declaration table
#[derive(Debug, Clone)]
pub struct InMemoryCompilation {
    id: Uuid,
    assembly: AssemblyIdentity,
    references: Vec<AssemblyIdentity>,
    declarations: IndexMap<DeclarationRef, Declaration>,
    derived: HashMap<DeclarationRef, Vec<DeclarationRef>>,
}

impl InMemoryCompilation {
    /// Start building a compilation for the given assembly
    pub fn builder(name: impl Into<String>, version: impl Into<String>) -> CompilationBuilder {
        CompilationBuilder::new(name, version)
    }

    /// Number of declarations in the compilation
    pub fn len(&self) -> usize {
        self.declarations.len()
    }

    /// Whether the compilation holds no declarations
    pub fn is_empty(&self) -> bool {
        self.declarations.is_empty()
    }

    /// Iterate over all declarations in insertion order
    pub fn declarations(&self) -> impl Iterator<Item = &Declaration> {
        self.declarations.values()
    }
}

impl CompilationSnapshot for InMemoryCompilation {
    fn snapshot_id(&self) -> Uuid {
        self.id
    }

    fn assembly(&self) -> AssemblyIdentity {
        self.assembly.clone()
    }

    fn resolve(&self, reference: &DeclarationRef) -> Option<Declaration> {
        self.declarations.get(reference).cloned()
    }

    fn direct_derived(&self, base: &DeclarationRef) -> Vec<DeclarationRef> {
        self.derived.get(base).cloned().unwrap_or_default()
    }

    fn references(&self) -> Vec<AssemblyIdentity> {
        self.references.clone()
    }
}

/// Fluent builder for [`InMemoryCompilation`]
///
/// Depth follows containment: namespaces sit at 0, each nesting level below
/// adds one. Builder misuse (declaring under an unknown parent, duplicate
/// references) panics; this is host setup code, not user aspect code.
///
/// # Examples
///
/// ```rust
/// use cim_aspects::{DeclarationKind, InMemoryCompilation};
///
/// let compilation = InMemoryCompilation::builder("Acme.Core", "1.0.0")
///     .namespace("N:Acme", "Acme")
///     .type_in("N:Acme", "T:Acme.Widget", "Widget")
///     .member(
///         "T:Acme.Widget",
///         DeclarationKind::Method,
///         "M:Acme.Widget.Render",
///         "Render",
///     )
///     .build();
/// assert_eq!(compilation.len(), 3);
/// ```
#[derive(Debug)]
pub struct CompilationBuilder {
    assembly: AssemblyIdentity,
    references: Vec<AssemblyIdentity>,
    declarations: IndexMap<DeclarationRef, Declaration>,
    derived: HashMap<DeclarationRef, Vec<DeclarationRef>>,
}

impl CompilationBuilder {
    /// Create a builder for the given assembly identity
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        CompilationBuilder {
            assembly: AssemblyIdentity::new(name, version),
            references: Vec::new(),
            declarations: IndexMap::new(),
            derived: HashMap::new(),
        }
    }

    /// Record a referenced assembly
    pub fn reference(mut self, identity: AssemblyIdentity) -> Self {
        self.references.push(identity);
        self
    }

    /// Declare a top-level namespace (depth 0)
    pub fn namespace(mut self, reference: impl Into<DeclarationRef>, name: impl Into<String>) -> Self {
        let reference = reference.into();
        let declaration = Declaration::new(reference.clone(), DeclarationKind::Namespace, name, 0);
        self.insert(reference, declaration);
        self
    }

    /// Declare a type under a parent namespace or type
    pub fn type_in(
        self,
        parent: impl Into<DeclarationRef>,
        reference: impl Into<DeclarationRef>,
        name: impl Into<String>,
    ) -> Self {
        self.child(parent.into(), DeclarationKind::Type, reference.into(), name)
    }

    /// Declare a member under a parent type
    pub fn member(
        self,
        parent: impl Into<DeclarationRef>,
        kind: DeclarationKind,
        reference: impl Into<DeclarationRef>,
        name: impl Into<String>,
    ) -> Self {
        self.child(parent.into(), kind, reference.into(), name)
    }

    /// Declare a prepared declaration as-is
    pub fn declare(mut self, declaration: Declaration) -> Self {
        self.insert(declaration.reference.clone(), declaration);
        self
    }

    /// Attach a source file to an already-declared declaration
    pub fn source_file(mut self, reference: impl Into<DeclarationRef>, file: impl Into<String>) -> Self {
        let reference = reference.into();
        self.existing(&reference).source_file = Some(file.into());
        self
    }

    /// Mark an already-declared declaration as local to a function body
    pub fn mark_local(mut self, reference: impl Into<DeclarationRef>) -> Self {
        let reference = reference.into();
        self.existing(&reference).is_local = true;
        self
    }

    /// Mark an already-declared declaration as abstract
    pub fn mark_abstract(mut self, reference: impl Into<DeclarationRef>) -> Self {
        let reference = reference.into();
        self.existing(&reference).is_abstract = true;
        self
    }

    /// Record that `derived` directly derives from (or overrides) `base`
    pub fn derives(
        mut self,
        base: impl Into<DeclarationRef>,
        derived: impl Into<DeclarationRef>,
    ) -> Self {
        self.derived
            .entry(base.into())
            .or_default()
            .push(derived.into());
        self
    }

    /// Finish, producing an immutable snapshot with a fresh id
    pub fn build(self) -> InMemoryCompilation {
        InMemoryCompilation {
            id: Uuid::new_v4(),
            assembly: self.assembly,
            references: self.references,
            declarations: self.declarations,
            derived: self.derived,
        }
    }

    fn child(
        mut self,
        parent: DeclarationRef,
        kind: DeclarationKind,
        reference: DeclarationRef,
        name: impl Into<String>,
    ) -> Self {
        let parent_depth = match self.declarations.get(&parent) {
            Some(declaration) => declaration.depth,
            None => panic!("parent declaration {parent} not declared"),
        };
        let declaration = Declaration::new(reference.clone(), kind, name, parent_depth + 1)
            .with_parent(parent);
        self.insert(reference, declaration);
        self
    }

    fn insert(&mut self, reference: DeclarationRef, declaration: Declaration) {
        if self.declarations.insert(reference.clone(), declaration).is_some() {
            panic!("declaration {reference} declared twice");
        }
    }

    fn existing(&mut self, reference: &DeclarationRef) -> &mut Declaration {
        match self.declarations.get_mut(reference) {
            Some(declaration) => declaration,
            None => panic!("declaration {reference} not declared"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> InMemoryCompilation {
        InMemoryCompilation::builder("Acme.Core", "1.0.0")
            .reference(AssemblyIdentity::new("Acme.Base", "0.9.0"))
            .namespace("N:Acme", "Acme")
            .type_in("N:Acme", "T:Acme.Widget", "Widget")
            .type_in("N:Acme", "T:Acme.Button", "Button")
            .member(
                "T:Acme.Widget",
                DeclarationKind::Method,
                "M:Acme.Widget.Render",
                "Render",
            )
            .member(
                "M:Acme.Widget.Render",
                DeclarationKind::Parameter,
                "P:Acme.Widget.Render.canvas",
                "canvas",
            )
            .source_file("T:Acme.Widget", "widget.cs")
            .derives("T:Acme.Widget", "T:Acme.Button")
            .build()
    }

    /// Test depth assignment through the containment chain
    ///
    /// ```mermaid
    /// graph TD
    ///     A[N:Acme depth 0] --> B[T:Acme.Widget depth 1]
    ///     B --> C[M:Render depth 2]
    ///     C --> D[P:canvas depth 3]
    /// ```
    #[test]
    fn test_containment_depth() {
        let compilation = sample();

        let depth = |r: &str| compilation.depth(&DeclarationRef::new(r)).unwrap();
        assert_eq!(depth("N:Acme"), 0);
        assert_eq!(depth("T:Acme.Widget"), 1);
        assert_eq!(depth("M:Acme.Widget.Render"), 2);
        assert_eq!(depth("P:Acme.Widget.Render.canvas"), 3);
    }

    /// Test resolve returns the declared view
    #[test]
    fn test_resolve() {
        let compilation = sample();

        let widget = compilation
            .resolve(&DeclarationRef::new("T:Acme.Widget"))
            .unwrap();
        assert_eq!(widget.kind, DeclarationKind::Type);
        assert_eq!(widget.name, "Widget");
        assert_eq!(widget.parent, Some(DeclarationRef::new("N:Acme")));
        assert_eq!(widget.source_file.as_deref(), Some("widget.cs"));

        assert!(compilation.resolve(&DeclarationRef::new("T:Gone")).is_none());
    }

    /// Test derivation edges are direct only
    #[test]
    fn test_direct_derived() {
        let compilation = sample();

        let derived = compilation.direct_derived(&DeclarationRef::new("T:Acme.Widget"));
        assert_eq!(derived, vec![DeclarationRef::new("T:Acme.Button")]);

        assert!(compilation
            .direct_derived(&DeclarationRef::new("T:Acme.Button"))
            .is_empty());
    }

    /// Test assembly identity and references
    #[test]
    fn test_identity_and_references() {
        let compilation = sample();

        assert_eq!(compilation.assembly(), AssemblyIdentity::new("Acme.Core", "1.0.0"));
        assert_eq!(
            compilation.references(),
            vec![AssemblyIdentity::new("Acme.Base", "0.9.0")]
        );
        assert_eq!(
            compilation.assembly().to_string(),
            "Acme.Core, Version=1.0.0"
        );
    }

    /// Test snapshot ids are unique per build
    #[test]
    fn test_snapshot_ids_unique() {
        let a = InMemoryCompilation::builder("A", "1").build();
        let b = InMemoryCompilation::builder("A", "1").build();

        assert_ne!(a.snapshot_id(), b.snapshot_id());
    }

    /// Test local marking drives the structural eligibility rules
    #[test]
    fn test_mark_local() {
        let compilation = InMemoryCompilation::builder("A", "1")
            .namespace("N:A", "A")
            .type_in("N:A", "T:A.C", "C")
            .member("T:A.C", DeclarationKind::Method, "M:A.C.Outer", "Outer")
            .member("M:A.C.Outer", DeclarationKind::Method, "M:A.C.Outer.Inner", "Inner")
            .mark_local("M:A.C.Outer.Inner")
            .build();

        let inner = compilation
            .resolve(&DeclarationRef::new("M:A.C.Outer.Inner"))
            .unwrap();
        assert!(inner.is_local);
    }

    /// Test builder panics on undeclared parent
    #[test]
    #[should_panic(expected = "not declared")]
    fn test_unknown_parent_panics() {
        let _ = InMemoryCompilation::builder("A", "1").type_in("N:Missing", "T:X", "X");
    }

    /// Test builder panics on duplicate declaration
    #[test]
    #[should_panic(expected = "declared twice")]
    fn test_duplicate_declaration_panics() {
        let _ = InMemoryCompilation::builder("A", "1")
            .namespace("N:A", "A")
            .namespace("N:A", "A");
    }
}
