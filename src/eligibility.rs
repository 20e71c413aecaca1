// Copyright 2025 Cowboy AI, LLC.

//! Eligibility rules and scenario masks
//!
//! Whether an aspect may apply to a declaration is not a boolean. It is a
//! set of scenarios (direct application, inheritance) that shrinks as rules
//! run. Rules compose by logical AND; evaluation stops as soon as the set is
//! empty because rules may run arbitrary user code and a rule that cannot
//! change the outcome must not run at all.

use crate::declaration::{Declaration, DeclarationKind, DeclarationKindSet};
use crate::errors::AspectResult;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitOr};
use std::sync::Arc;

/// Scenarios under which an aspect can apply to a declaration
///
/// A bitmask. `NONE` means fully ineligible. Note that "ineligible" is a
/// value, not an error: a failed rule evaluation surfaces as `Err`, never as
/// an empty mask.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default,
)]
pub struct EligibleScenarios(u8);

impl EligibleScenarios {
    /// Eligible for nothing
    pub const NONE: EligibleScenarios = EligibleScenarios(0);

    /// Eligible as a direct aspect target
    pub const ASPECT: EligibleScenarios = EligibleScenarios(1);

    /// Eligible as an inheritance source
    pub const INHERITANCE: EligibleScenarios = EligibleScenarios(1 << 1);

    /// Eligible for every scenario
    pub const ALL: EligibleScenarios = EligibleScenarios(0b11);

    /// Whether every scenario in `other` is present in `self`
    pub const fn contains(&self, other: EligibleScenarios) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether no scenario is eligible
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Remove the scenarios in `other`
    pub const fn without(&self, other: EligibleScenarios) -> Self {
        EligibleScenarios(self.0 & !other.0)
    }

    /// Intersection
    pub const fn intersect(&self, other: EligibleScenarios) -> Self {
        EligibleScenarios(self.0 & other.0)
    }

    /// Union
    pub const fn union(&self, other: EligibleScenarios) -> Self {
        EligibleScenarios(self.0 | other.0)
    }
}

impl BitAnd for EligibleScenarios {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        self.intersect(rhs)
    }
}

impl BitOr for EligibleScenarios {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl fmt::Display for EligibleScenarios {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        let mut first = true;
        for (mask, label) in [
            (EligibleScenarios::ASPECT, "aspect"),
            (EligibleScenarios::INHERITANCE, "inheritance"),
        ] {
            if self.contains(mask) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{label}")?;
                first = false;
            }
        }
        Ok(())
    }
}

/// One composable eligibility rule
///
/// A rule is scoped by declaration kinds; the engine never invokes it on a
/// declaration outside its scope. `eligibility` may run user code and may
/// fail; that failure propagates, it is never downgraded to "ineligible".
pub trait EligibilityRule: Send + Sync {
    /// Declaration kinds this rule applies to
    fn scope(&self) -> DeclarationKindSet;

    /// Scenarios still eligible after this rule
    fn eligibility(&self, declaration: &Declaration) -> AspectResult<EligibleScenarios>;

    /// Why this rule rejects the declaration, for diagnostics
    ///
    /// Only consulted after `eligibility` was observed to remove a requested
    /// scenario. The default has nothing to say.
    fn justification(&self, declaration: &Declaration) -> Option<String> {
        let _ = declaration;
        None
    }
}

/// A rule built from a closure, with an optional fixed rejection reason
pub struct FnRule<E> {
    scope: DeclarationKindSet,
    eval: E,
    reason: Option<String>,
}

impl<E> FnRule<E>
where
    E: Fn(&Declaration) -> EligibleScenarios + Send + Sync,
{
    /// Create a closure rule scoped to the given kinds
    pub fn new(scope: DeclarationKindSet, eval: E) -> Self {
        FnRule {
            scope,
            eval,
            reason: None,
        }
    }

    /// Attach the reason reported when this rule rejects a declaration
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

impl<E> EligibilityRule for FnRule<E>
where
    E: Fn(&Declaration) -> EligibleScenarios + Send + Sync,
{
    fn scope(&self) -> DeclarationKindSet {
        self.scope
    }

    fn eligibility(&self, declaration: &Declaration) -> AspectResult<EligibleScenarios> {
        Ok((self.eval)(declaration))
    }

    fn justification(&self, _declaration: &Declaration) -> Option<String> {
        self.reason.clone()
    }
}

/// Local functions cannot carry aspects
struct NotLocalFunction;

impl EligibilityRule for NotLocalFunction {
    fn scope(&self) -> DeclarationKindSet {
        DeclarationKindSet::of(DeclarationKind::Method)
    }

    fn eligibility(&self, declaration: &Declaration) -> AspectResult<EligibleScenarios> {
        Ok(if declaration.is_local {
            EligibleScenarios::NONE
        } else {
            EligibleScenarios::ALL
        })
    }

    fn justification(&self, declaration: &Declaration) -> Option<String> {
        Some(format!("'{}' is a local function", declaration.name))
    }
}

/// Parameters and type parameters of local functions cannot carry aspects
struct NotMemberOfLocalFunction;

impl EligibilityRule for NotMemberOfLocalFunction {
    fn scope(&self) -> DeclarationKindSet {
        DeclarationKindSet::from_kinds(&[
            DeclarationKind::Parameter,
            DeclarationKind::TypeParameter,
        ])
    }

    fn eligibility(&self, declaration: &Declaration) -> AspectResult<EligibleScenarios> {
        Ok(if declaration.is_local {
            EligibleScenarios::NONE
        } else {
            EligibleScenarios::ALL
        })
    }

    fn justification(&self, declaration: &Declaration) -> Option<String> {
        Some(format!(
            "'{}' belongs to a local function",
            declaration.name
        ))
    }
}

const BUILT_IN_RULES: [&(dyn EligibilityRule); 2] = [&NotLocalFunction, &NotMemberOfLocalFunction];

/// Evaluate the eligibility of a declaration against a rule list
///
/// Starts from the full mask, clears the inheritance scenario when the class
/// is not inheritable, then ANDs in every applicable rule. Built-in
/// structural rules run before `user_rules`; `user_rules` run in their
/// registration order. Returns as soon as the mask is empty so later rules
/// never execute.
pub fn evaluate(
    user_rules: &[Arc<dyn EligibilityRule>],
    declaration: &Declaration,
    is_inheritable: bool,
) -> AspectResult<EligibleScenarios> {
    let mut scenarios = EligibleScenarios::ALL;
    if !is_inheritable {
        scenarios = scenarios.without(EligibleScenarios::INHERITANCE);
    }

    for rule in built_in_then_user(user_rules) {
        if !rule.scope().contains(declaration.kind) {
            continue;
        }
        scenarios = scenarios & rule.eligibility(declaration)?;
        if scenarios.is_empty() {
            return Ok(scenarios);
        }
    }

    Ok(scenarios)
}

/// Explain why the requested scenarios are not all eligible
///
/// Re-runs the applicable rules and returns the first non-empty reason from
/// a rule that removed a requested scenario. `None` when every rule is
/// satisfied or none of the rejecting rules has a reason. Diagnostics only;
/// callers must not branch on this.
pub fn justify(
    user_rules: &[Arc<dyn EligibilityRule>],
    requested: EligibleScenarios,
    declaration: &Declaration,
) -> AspectResult<Option<String>> {
    for rule in built_in_then_user(user_rules) {
        if !rule.scope().contains(declaration.kind) {
            continue;
        }
        let result = rule.eligibility(declaration)?;
        if !result.contains(requested) {
            if let Some(reason) = rule.justification(declaration) {
                if !reason.is_empty() {
                    return Ok(Some(reason));
                }
            }
        }
    }

    Ok(None)
}

fn built_in_then_user<'a>(
    user_rules: &'a [Arc<dyn EligibilityRule>],
) -> impl Iterator<Item = &'a dyn EligibilityRule> {
    BUILT_IN_RULES
        .into_iter()
        .chain(user_rules.iter().map(|rule| rule.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AspectError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use test_case::test_case;

    fn method(name: &str) -> Declaration {
        Declaration::new(format!("M:T.{name}"), DeclarationKind::Method, name, 2)
    }

    fn local_method(name: &str) -> Declaration {
        method(name).as_local()
    }

    /// Test mask algebra
    #[test_case(EligibleScenarios::ALL, EligibleScenarios::ASPECT, true; "all contains aspect")]
    #[test_case(EligibleScenarios::ASPECT, EligibleScenarios::INHERITANCE, false; "aspect lacks inheritance")]
    #[test_case(EligibleScenarios::NONE, EligibleScenarios::NONE, true; "none contains none")]
    #[test_case(EligibleScenarios::INHERITANCE, EligibleScenarios::ALL, false; "inheritance lacks all")]
    fn test_contains(mask: EligibleScenarios, other: EligibleScenarios, expected: bool) {
        assert_eq!(mask.contains(other), expected);
    }

    /// Test the and/or operators
    #[test]
    fn test_operators() {
        assert_eq!(
            EligibleScenarios::ASPECT | EligibleScenarios::INHERITANCE,
            EligibleScenarios::ALL
        );
        assert_eq!(
            EligibleScenarios::ALL & EligibleScenarios::ASPECT,
            EligibleScenarios::ASPECT
        );
        assert_eq!(
            EligibleScenarios::ALL.without(EligibleScenarios::INHERITANCE),
            EligibleScenarios::ASPECT
        );
        assert!((EligibleScenarios::ASPECT & EligibleScenarios::INHERITANCE).is_empty());
    }

    /// Test display form
    #[test]
    fn test_display() {
        assert_eq!(EligibleScenarios::ALL.to_string(), "aspect|inheritance");
        assert_eq!(EligibleScenarios::ASPECT.to_string(), "aspect");
        assert_eq!(EligibleScenarios::NONE.to_string(), "none");
    }

    /// Test that a non-inheritable class never reports inheritance eligibility
    #[test]
    fn test_inheritance_cleared_when_not_inheritable() {
        let scenarios = evaluate(&[], &method("Render"), false).unwrap();

        assert!(scenarios.contains(EligibleScenarios::ASPECT));
        assert!(!scenarios.contains(EligibleScenarios::INHERITANCE));
    }

    /// Test the built-in local function rule
    #[test]
    fn test_local_function_ineligible() {
        let scenarios = evaluate(&[], &local_method("Inner"), true).unwrap();
        assert!(scenarios.is_empty());

        let scenarios = evaluate(&[], &method("Outer"), true).unwrap();
        assert_eq!(scenarios, EligibleScenarios::ALL);
    }

    /// Test rules compose by AND
    ///
    /// ```mermaid
    /// graph TD
    ///     A[ALL] -->|rule: aspect only| B[ASPECT]
    ///     B -->|rule: inheritance only| C[NONE]
    /// ```
    #[test]
    fn test_and_composition() {
        let aspect_only: Arc<dyn EligibilityRule> = Arc::new(FnRule::new(
            DeclarationKindSet::ANY,
            |_| EligibleScenarios::ASPECT,
        ));
        let inheritance_only: Arc<dyn EligibilityRule> = Arc::new(FnRule::new(
            DeclarationKindSet::ANY,
            |_| EligibleScenarios::INHERITANCE,
        ));

        let scenarios = evaluate(
            &[aspect_only.clone()],
            &method("Render"),
            true,
        )
        .unwrap();
        assert_eq!(scenarios, EligibleScenarios::ASPECT);

        let scenarios = evaluate(
            &[aspect_only, inheritance_only],
            &method("Render"),
            true,
        )
        .unwrap();
        assert!(scenarios.is_empty());
    }

    /// Test short-circuit: rules after an empty mask never run
    #[test]
    fn test_short_circuit() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);

        let rejects: Arc<dyn EligibilityRule> = Arc::new(FnRule::new(
            DeclarationKindSet::ANY,
            |_| EligibleScenarios::NONE,
        ));
        let counts: Arc<dyn EligibilityRule> = Arc::new(FnRule::new(
            DeclarationKindSet::ANY,
            |_| {
                CALLS.fetch_add(1, Ordering::SeqCst);
                EligibleScenarios::ALL
            },
        ));

        let scenarios = evaluate(&[rejects, counts], &method("Render"), true).unwrap();

        assert!(scenarios.is_empty());
        assert_eq!(CALLS.load(Ordering::SeqCst), 0);
    }

    /// Test rules outside their kind scope are skipped
    #[test]
    fn test_scope_respected() {
        let fields_only: Arc<dyn EligibilityRule> = Arc::new(FnRule::new(
            DeclarationKindSet::of(DeclarationKind::Field),
            |_| EligibleScenarios::NONE,
        ));

        let scenarios = evaluate(&[fields_only], &method("Render"), true).unwrap();
        assert_eq!(scenarios, EligibleScenarios::ALL);
    }

    /// Test a failing rule propagates as an error, not as "ineligible"
    #[test]
    fn test_rule_failure_propagates() {
        struct Failing;
        impl EligibilityRule for Failing {
            fn scope(&self) -> DeclarationKindSet {
                DeclarationKindSet::ANY
            }
            fn eligibility(&self, _d: &Declaration) -> AspectResult<EligibleScenarios> {
                Err(AspectError::user_code("Acme.A", "eligibility", "boom"))
            }
        }

        let failing: Arc<dyn EligibilityRule> = Arc::new(Failing);
        let result = evaluate(&[failing], &method("Render"), true);

        assert!(result.is_err());
        assert!(result.unwrap_err().is_user_code());
    }

    /// Test adding rules never widens the mask
    #[test]
    fn test_monotonic() {
        let loose: Arc<dyn EligibilityRule> = Arc::new(FnRule::new(
            DeclarationKindSet::ANY,
            |_| EligibleScenarios::ALL,
        ));
        let tight: Arc<dyn EligibilityRule> = Arc::new(FnRule::new(
            DeclarationKindSet::ANY,
            |_| EligibleScenarios::ASPECT,
        ));

        let with_one = evaluate(&[loose.clone()], &method("Render"), true).unwrap();
        let with_two = evaluate(&[loose, tight], &method("Render"), true).unwrap();

        assert!(with_one.contains(with_two));
    }

    /// Test justification returns the first rejecting rule's reason
    #[test]
    fn test_justification() {
        let allows: Arc<dyn EligibilityRule> = Arc::new(
            FnRule::new(DeclarationKindSet::ANY, |_| EligibleScenarios::ALL)
                .with_reason("never reported"),
        );
        let rejects: Arc<dyn EligibilityRule> = Arc::new(
            FnRule::new(DeclarationKindSet::ANY, |_| EligibleScenarios::NONE)
                .with_reason("the declaration is static"),
        );

        let reason = justify(
            &[allows, rejects],
            EligibleScenarios::ASPECT,
            &method("Render"),
        )
        .unwrap();

        assert_eq!(reason.as_deref(), Some("the declaration is static"));
    }

    /// Test justification is None when everything is eligible
    #[test]
    fn test_justification_none_when_eligible() {
        let reason = justify(&[], EligibleScenarios::ASPECT, &method("Render")).unwrap();
        assert!(reason.is_none());
    }

    /// Test built-in justification for local functions
    #[test]
    fn test_local_function_justification() {
        let reason = justify(&[], EligibleScenarios::ASPECT, &local_method("Inner")).unwrap();
        assert_eq!(reason.as_deref(), Some("'Inner' is a local function"));
    }
}
