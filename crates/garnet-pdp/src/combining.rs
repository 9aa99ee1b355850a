//! Combining algorithms: strategies reducing an ordered list of child
//! decisions into one.
//!
//! An algorithm consumes each child's result, routes the child's PEP
//! actions and applicable-policy metadata into the caller-supplied
//! collectors, and returns the combined [`ExtendedDecision`]. The
//! standard algorithms follow XACML 3.0 appendix C; the `ordered-*`
//! variants share their unordered siblings' implementation because this
//! engine always evaluates children in declaration order, which keeps
//! obligation accumulation deterministic.

use std::collections::HashMap;
use std::sync::Arc;

use garnet_types::{
    AttributeValue, Decision, DecisionResult, ExtendedDecision, ExtendedIndeterminate, PepAction,
    PolicyRefsMetadata, PrimaryPolicyMetadata, Status,
};
use tracing::debug;

use crate::context::EvaluationContext;
use crate::error::{EvalError, PolicyBuildError};
use crate::rule::RuleEvaluator;

/// Identifiers of the standard combining algorithms.
pub mod ids {
    pub const RULE_DENY_OVERRIDES: &str =
        "urn:oasis:names:tc:xacml:3.0:rule-combining-algorithm:deny-overrides";
    pub const RULE_ORDERED_DENY_OVERRIDES: &str =
        "urn:oasis:names:tc:xacml:3.0:rule-combining-algorithm:ordered-deny-overrides";
    pub const RULE_PERMIT_OVERRIDES: &str =
        "urn:oasis:names:tc:xacml:3.0:rule-combining-algorithm:permit-overrides";
    pub const RULE_ORDERED_PERMIT_OVERRIDES: &str =
        "urn:oasis:names:tc:xacml:3.0:rule-combining-algorithm:ordered-permit-overrides";
    pub const RULE_DENY_UNLESS_PERMIT: &str =
        "urn:oasis:names:tc:xacml:3.0:rule-combining-algorithm:deny-unless-permit";
    pub const RULE_PERMIT_UNLESS_DENY: &str =
        "urn:oasis:names:tc:xacml:3.0:rule-combining-algorithm:permit-unless-deny";
    pub const RULE_FIRST_APPLICABLE: &str =
        "urn:oasis:names:tc:xacml:1.0:rule-combining-algorithm:first-applicable";

    pub const POLICY_DENY_OVERRIDES: &str =
        "urn:oasis:names:tc:xacml:3.0:policy-combining-algorithm:deny-overrides";
    pub const POLICY_ORDERED_DENY_OVERRIDES: &str =
        "urn:oasis:names:tc:xacml:3.0:policy-combining-algorithm:ordered-deny-overrides";
    pub const POLICY_PERMIT_OVERRIDES: &str =
        "urn:oasis:names:tc:xacml:3.0:policy-combining-algorithm:permit-overrides";
    pub const POLICY_ORDERED_PERMIT_OVERRIDES: &str =
        "urn:oasis:names:tc:xacml:3.0:policy-combining-algorithm:ordered-permit-overrides";
    pub const POLICY_DENY_UNLESS_PERMIT: &str =
        "urn:oasis:names:tc:xacml:3.0:policy-combining-algorithm:deny-unless-permit";
    pub const POLICY_PERMIT_UNLESS_DENY: &str =
        "urn:oasis:names:tc:xacml:3.0:policy-combining-algorithm:permit-unless-deny";
    pub const POLICY_FIRST_APPLICABLE: &str =
        "urn:oasis:names:tc:xacml:1.0:policy-combining-algorithm:first-applicable";
    pub const POLICY_ONLY_ONE_APPLICABLE: &str =
        "urn:oasis:names:tc:xacml:1.0:policy-combining-algorithm:only-one-applicable";
}

// ============================================================================
// Collectors
// ============================================================================

/// Collector of applicable-policy metadata. Disabled unless the request
/// asked for the list, so hot paths allocate nothing.
#[derive(Debug)]
pub struct ApplicablePolicies {
    enabled: bool,
    items: Vec<PrimaryPolicyMetadata>,
}

impl ApplicablePolicies {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            items: Vec::new(),
        }
    }

    pub fn push(&mut self, meta: PrimaryPolicyMetadata) {
        if self.enabled {
            self.items.push(meta);
        }
    }

    pub fn extend_from(&mut self, metas: &[PrimaryPolicyMetadata]) {
        if self.enabled {
            self.items.extend_from_slice(metas);
        }
    }

    /// Snapshots the collected list; freezing it here prevents aliasing
    /// with a parent's in-progress list.
    pub fn into_vec(self) -> Vec<PrimaryPolicyMetadata> {
        self.items
    }
}

// ============================================================================
// Combinable children
// ============================================================================

/// A child element a combining algorithm can evaluate: a rule inside a
/// Policy, or a policy/policy set/reference inside a PolicySet.
pub trait Combinable {
    /// Full evaluation, target included.
    fn decide(&self, ctx: &mut EvaluationContext<'_>) -> DecisionResult;

    /// Evaluation with the target assumed matching; used by
    /// only-one-applicable after its separate applicability test.
    fn decide_skip_target(&self, ctx: &mut EvaluationContext<'_>) -> DecisionResult;

    /// The target applicability test alone.
    fn matches_target(&self, ctx: &mut EvaluationContext<'_>) -> Result<bool, EvalError>;

    /// Reference metadata reachable through this child, if any.
    fn refs_metadata(
        &self,
        ctx: &mut EvaluationContext<'_>,
    ) -> Result<Option<PolicyRefsMetadata>, EvalError>;

    /// Identities of the policies textually enclosed in this child.
    fn enclosed_policies(&self) -> &[PrimaryPolicyMetadata];
}

impl Combinable for RuleEvaluator {
    fn decide(&self, ctx: &mut EvaluationContext<'_>) -> DecisionResult {
        self.evaluate(ctx)
    }

    fn decide_skip_target(&self, ctx: &mut EvaluationContext<'_>) -> DecisionResult {
        // rules are never combined by only-one-applicable; full
        // evaluation is the safe interpretation
        self.evaluate(ctx)
    }

    fn matches_target(&self, ctx: &mut EvaluationContext<'_>) -> Result<bool, EvalError> {
        let _ = ctx;
        Err(EvalError::Internal(
            "target applicability test is not defined for rules".to_string(),
        ))
    }

    fn refs_metadata(
        &self,
        _ctx: &mut EvaluationContext<'_>,
    ) -> Result<Option<PolicyRefsMetadata>, EvalError> {
        Ok(None)
    }

    fn enclosed_policies(&self) -> &[PrimaryPolicyMetadata] {
        &[]
    }
}

// ============================================================================
// Combiner parameters
// ============================================================================

/// A compiled set of combiner parameters, optionally associated with one
/// combined child by id. The standard algorithms accept and ignore them;
/// extension algorithms interpret them at binding time.
#[derive(Debug, Clone, PartialEq)]
pub struct CombinerParametersAssignment {
    /// Id of the rule/policy the parameters apply to, or `None` for
    /// parameters addressed to the algorithm as a whole.
    pub combined_id: Option<String>,
    pub parameters: Vec<(String, AttributeValue)>,
}

// ============================================================================
// CombiningAlg
// ============================================================================

/// A combining algorithm over children of kind `C`.
pub trait CombiningAlg<C: Combinable>: Send + Sync {
    fn id(&self) -> &str;

    /// Validates combiner parameters at binding time. The standard
    /// algorithms accept anything and ignore it.
    fn check_parameters(
        &self,
        _params: &[CombinerParametersAssignment],
    ) -> Result<(), PolicyBuildError> {
        Ok(())
    }

    /// Reduces the children's decisions, accumulating PEP actions and
    /// applicable policies into the supplied collectors. `parameters`
    /// are the combiner parameters the policy bound to this algorithm;
    /// the standard algorithms ignore them.
    fn evaluate(
        &self,
        ctx: &mut EvaluationContext<'_>,
        children: &[C],
        parameters: &[CombinerParametersAssignment],
        pep: &mut Vec<PepAction>,
        applicable: &mut ApplicablePolicies,
    ) -> ExtendedDecision;
}

// ============================================================================
// deny-overrides / permit-overrides
// ============================================================================

/// Shared implementation of the two overrides algorithms; `overriding`
/// names the decision that wins outright (XACML 3.0 §C.2/C.3).
#[derive(Debug)]
struct Overrides {
    id: &'static str,
    overriding: Decision,
}

impl<C: Combinable> CombiningAlg<C> for Overrides {
    fn id(&self) -> &str {
        self.id
    }

    fn evaluate(
        &self,
        ctx: &mut EvaluationContext<'_>,
        children: &[C],
        _parameters: &[CombinerParametersAssignment],
        pep: &mut Vec<PepAction>,
        applicable: &mut ApplicablePolicies,
    ) -> ExtendedDecision {
        // bias matching the overriding decision (D for deny-overrides)
        let overriding_bias = match self.overriding {
            Decision::Deny => ExtendedIndeterminate::Deny,
            _ => ExtendedIndeterminate::Permit,
        };
        let overridden = match self.overriding {
            Decision::Deny => Decision::Permit,
            _ => Decision::Deny,
        };

        let mut saw_overridden = false;
        let mut overridden_pep: Vec<PepAction> = Vec::new();
        let mut first_error_overriding: Option<Status> = None;
        let mut first_error_overridden: Option<Status> = None;
        let mut first_error_both: Option<Status> = None;

        for child in children {
            let result = child.decide(ctx);
            debug!(algorithm = self.id, decision = %result.decision, "combined child decided");
            if result.decision != Decision::NotApplicable {
                applicable.extend_from(&result.applicable_policies);
            }
            match result.decision {
                d if d == self.overriding => {
                    pep.extend(result.pep_actions);
                    return ExtendedDecision {
                        decision: self.overriding,
                        status: None,
                    };
                }
                d if d == overridden => {
                    saw_overridden = true;
                    overridden_pep.extend(result.pep_actions);
                }
                Decision::NotApplicable => {}
                Decision::Indeterminate(ext) => {
                    let status = result
                        .status
                        .unwrap_or_else(|| Status::processing_error("cause unknown"));
                    let slot = if ext == ExtendedIndeterminate::DenyOrPermit {
                        &mut first_error_both
                    } else if ext == overriding_bias {
                        &mut first_error_overriding
                    } else {
                        &mut first_error_overridden
                    };
                    if slot.is_none() {
                        *slot = Some(status);
                    }
                }
                _ => unreachable!("decision variants are exhaustive"),
            }
        }

        if let Some(status) = first_error_both {
            return ExtendedDecision::indeterminate(ExtendedIndeterminate::DenyOrPermit, status);
        }
        if let Some(status) = first_error_overriding {
            return if saw_overridden || first_error_overridden.is_some() {
                ExtendedDecision::indeterminate(ExtendedIndeterminate::DenyOrPermit, status)
            } else {
                ExtendedDecision::indeterminate(overriding_bias, status)
            };
        }
        if saw_overridden {
            pep.append(&mut overridden_pep);
            return ExtendedDecision {
                decision: overridden,
                status: None,
            };
        }
        if let Some(status) = first_error_overridden {
            let bias = match overridden {
                Decision::Deny => ExtendedIndeterminate::Deny,
                _ => ExtendedIndeterminate::Permit,
            };
            return ExtendedDecision::indeterminate(bias, status);
        }
        ExtendedDecision::NOT_APPLICABLE
    }
}

// ============================================================================
// first-applicable
// ============================================================================

#[derive(Debug)]
struct FirstApplicable {
    id: &'static str,
}

impl<C: Combinable> CombiningAlg<C> for FirstApplicable {
    fn id(&self) -> &str {
        self.id
    }

    fn evaluate(
        &self,
        ctx: &mut EvaluationContext<'_>,
        children: &[C],
        _parameters: &[CombinerParametersAssignment],
        pep: &mut Vec<PepAction>,
        applicable: &mut ApplicablePolicies,
    ) -> ExtendedDecision {
        for child in children {
            let result = child.decide(ctx);
            match result.decision {
                Decision::NotApplicable => {}
                Decision::Permit | Decision::Deny => {
                    applicable.extend_from(&result.applicable_policies);
                    let extended = result.extended();
                    pep.extend(result.pep_actions);
                    return extended;
                }
                Decision::Indeterminate(_) => {
                    applicable.extend_from(&result.applicable_policies);
                    return result.extended();
                }
            }
        }
        ExtendedDecision::NOT_APPLICABLE
    }
}

// ============================================================================
// deny-unless-permit / permit-unless-deny
// ============================================================================

/// Collapses NotApplicable and Indeterminate into a default decision
/// (XACML 3.0 §C.4/C.5). `sought` short-circuits; anything else falls
/// back to `default`.
#[derive(Debug)]
struct UnlessDecided {
    id: &'static str,
    sought: Decision,
    default: Decision,
}

impl<C: Combinable> CombiningAlg<C> for UnlessDecided {
    fn id(&self) -> &str {
        self.id
    }

    fn evaluate(
        &self,
        ctx: &mut EvaluationContext<'_>,
        children: &[C],
        _parameters: &[CombinerParametersAssignment],
        pep: &mut Vec<PepAction>,
        applicable: &mut ApplicablePolicies,
    ) -> ExtendedDecision {
        let mut default_pep: Vec<PepAction> = Vec::new();

        for child in children {
            let result = child.decide(ctx);
            if result.decision != Decision::NotApplicable {
                applicable.extend_from(&result.applicable_policies);
            }
            match result.decision {
                d if d == self.sought => {
                    pep.extend(result.pep_actions);
                    return ExtendedDecision {
                        decision: self.sought,
                        status: None,
                    };
                }
                d if d == self.default => default_pep.extend(result.pep_actions),
                _ => {}
            }
        }

        pep.append(&mut default_pep);
        ExtendedDecision {
            decision: self.default,
            status: None,
        }
    }
}

// ============================================================================
// only-one-applicable
// ============================================================================

#[derive(Debug)]
struct OnlyOneApplicable {
    id: &'static str,
}

impl<C: Combinable> CombiningAlg<C> for OnlyOneApplicable {
    fn id(&self) -> &str {
        self.id
    }

    fn evaluate(
        &self,
        ctx: &mut EvaluationContext<'_>,
        children: &[C],
        _parameters: &[CombinerParametersAssignment],
        pep: &mut Vec<PepAction>,
        applicable: &mut ApplicablePolicies,
    ) -> ExtendedDecision {
        let mut selected: Option<&C> = None;

        for child in children {
            match child.matches_target(ctx) {
                Err(e) => {
                    let e = e.in_context("error checking a child policy's applicability");
                    return ExtendedDecision::indeterminate(
                        ExtendedIndeterminate::DenyOrPermit,
                        e.status(),
                    );
                }
                Ok(false) => {}
                Ok(true) => {
                    if selected.is_some() {
                        return ExtendedDecision::indeterminate(
                            ExtendedIndeterminate::DenyOrPermit,
                            Status::processing_error(
                                "more than one policy applicable to the request",
                            ),
                        );
                    }
                    selected = Some(child);
                }
            }
        }

        let Some(child) = selected else {
            return ExtendedDecision::NOT_APPLICABLE;
        };

        // the applicability test already ran; skip the target
        let result = child.decide_skip_target(ctx);
        if result.decision != Decision::NotApplicable {
            applicable.extend_from(&result.applicable_policies);
        }
        let extended = result.extended();
        pep.extend(result.pep_actions);
        extended
    }
}

// ============================================================================
// Registry
// ============================================================================

use crate::policy::PolicyChildEvaluator;

/// Registry of combining algorithms, keyed by id and child kind.
pub struct CombiningAlgRegistry {
    rule_algs: HashMap<String, Arc<dyn CombiningAlg<RuleEvaluator>>>,
    policy_algs: HashMap<String, Arc<dyn CombiningAlg<PolicyChildEvaluator>>>,
}

impl CombiningAlgRegistry {
    /// The registry of standard algorithms.
    pub fn standard() -> Self {
        let mut registry = Self {
            rule_algs: HashMap::new(),
            policy_algs: HashMap::new(),
        };

        for id in [ids::RULE_DENY_OVERRIDES, ids::RULE_ORDERED_DENY_OVERRIDES] {
            registry.register_rule(Arc::new(Overrides {
                id,
                overriding: Decision::Deny,
            }));
        }
        for id in [ids::RULE_PERMIT_OVERRIDES, ids::RULE_ORDERED_PERMIT_OVERRIDES] {
            registry.register_rule(Arc::new(Overrides {
                id,
                overriding: Decision::Permit,
            }));
        }
        registry.register_rule(Arc::new(UnlessDecided {
            id: ids::RULE_DENY_UNLESS_PERMIT,
            sought: Decision::Permit,
            default: Decision::Deny,
        }));
        registry.register_rule(Arc::new(UnlessDecided {
            id: ids::RULE_PERMIT_UNLESS_DENY,
            sought: Decision::Deny,
            default: Decision::Permit,
        }));
        registry.register_rule(Arc::new(FirstApplicable {
            id: ids::RULE_FIRST_APPLICABLE,
        }));

        for id in [
            ids::POLICY_DENY_OVERRIDES,
            ids::POLICY_ORDERED_DENY_OVERRIDES,
        ] {
            registry.register_policy(Arc::new(Overrides {
                id,
                overriding: Decision::Deny,
            }));
        }
        for id in [
            ids::POLICY_PERMIT_OVERRIDES,
            ids::POLICY_ORDERED_PERMIT_OVERRIDES,
        ] {
            registry.register_policy(Arc::new(Overrides {
                id,
                overriding: Decision::Permit,
            }));
        }
        registry.register_policy(Arc::new(UnlessDecided {
            id: ids::POLICY_DENY_UNLESS_PERMIT,
            sought: Decision::Permit,
            default: Decision::Deny,
        }));
        registry.register_policy(Arc::new(UnlessDecided {
            id: ids::POLICY_PERMIT_UNLESS_DENY,
            sought: Decision::Deny,
            default: Decision::Permit,
        }));
        registry.register_policy(Arc::new(FirstApplicable {
            id: ids::POLICY_FIRST_APPLICABLE,
        }));
        registry.register_policy(Arc::new(OnlyOneApplicable {
            id: ids::POLICY_ONLY_ONE_APPLICABLE,
        }));

        registry
    }

    /// Registers a rule-combining algorithm (extension point).
    pub fn register_rule(&mut self, alg: Arc<dyn CombiningAlg<RuleEvaluator>>) {
        self.rule_algs.insert(alg.id().to_string(), alg);
    }

    /// Registers a policy-combining algorithm (extension point).
    pub fn register_policy(&mut self, alg: Arc<dyn CombiningAlg<PolicyChildEvaluator>>) {
        self.policy_algs.insert(alg.id().to_string(), alg);
    }

    pub fn rule_algorithm(
        &self,
        id: &str,
    ) -> Result<Arc<dyn CombiningAlg<RuleEvaluator>>, PolicyBuildError> {
        self.rule_algs
            .get(id)
            .cloned()
            .ok_or_else(|| PolicyBuildError::UnknownCombiningAlgorithm {
                algorithm_id: id.to_string(),
                kind: "rule",
            })
    }

    pub fn policy_algorithm(
        &self,
        id: &str,
    ) -> Result<Arc<dyn CombiningAlg<PolicyChildEvaluator>>, PolicyBuildError> {
        self.policy_algs
            .get(id)
            .cloned()
            .ok_or_else(|| PolicyBuildError::UnknownCombiningAlgorithm {
                algorithm_id: id.to_string(),
                kind: "policy",
            })
    }
}

// ============================================================================
// Tests
// ============================================================================
