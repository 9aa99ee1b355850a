//! Policy reference resolution: static expansion, dynamic per-request
//! resolution, version matching, and the chain-based loop and depth
//! rules.

use std::sync::{Arc, RwLock};

use garnet_pdp::combining::ids as alg;
use garnet_pdp::compile::{compile_policy, compile_policy_set, ReferenceResolution};
use garnet_pdp::context::EvaluationContext;
use garnet_pdp::error::{EvalError, PolicyBuildError};
use garnet_pdp::expr::factory::ExpressionFactory;
use garnet_pdp::expr::functions::FunctionRegistry;
use garnet_pdp::model::{PolicyNode, PolicyRefNode, PolicySetNode, RuleNode};
use garnet_pdp::provider::{PolicyProvider, StaticPolicyProvider};
use garnet_pdp::{CombiningAlgRegistry, TopLevelPolicyEvaluator};
use garnet_types::{
    Bag, AttributeId, AttributeValue, Category, Decision, DecisionRequest, Effect,
    PolicyId, PolicyKind, PolicyVersionPatterns, StatusCode,
};

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

fn request() -> DecisionRequest {
    DecisionRequest::builder()
        .attribute(
            Category::access_subject(),
            AttributeId::new(AttributeId::SUBJECT_ID),
            Bag::of(AttributeValue::from("alice")),
        )
        .return_applicable_policies(true)
        .build()
}

fn leaf_policy(id: &str, version: &str, effect: Effect) -> PolicyNode {
    PolicyNode::new(id, version, alg::RULE_DENY_OVERRIDES)
        .with_rule(RuleNode::new("r", effect))
}

fn compile_leaf(node: &PolicyNode) -> TopLevelPolicyEvaluator {
    let mut factory = ExpressionFactory::new(FunctionRegistry::standard());
    let algorithms = CombiningAlgRegistry::standard();
    compile_policy(node, &mut factory, &algorithms).unwrap()
}

fn compile_set_with(
    node: &PolicySetNode,
    refs: &ReferenceResolution,
) -> Result<TopLevelPolicyEvaluator, PolicyBuildError> {
    let mut factory = ExpressionFactory::new(FunctionRegistry::standard());
    let algorithms = CombiningAlgRegistry::standard();
    compile_policy_set(node, &mut factory, &algorithms, refs)
}

/// Provider test double: a static provider that can be populated after
/// it has been handed out, so dynamically-compiled policies can
/// reference each other.
#[derive(Debug)]
struct SharedProvider {
    inner: RwLock<StaticPolicyProvider>,
}

impl SharedProvider {
    fn new(inner: StaticPolicyProvider) -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(inner),
        })
    }

    fn add(&self, policy: TopLevelPolicyEvaluator) {
        self.inner.write().unwrap().add(policy).unwrap();
    }
}

impl PolicyProvider for SharedProvider {
    fn get(
        &self,
        kind: PolicyKind,
        id: &PolicyId,
        constraints: &PolicyVersionPatterns,
        ref_chain_if_policy_set: Option<&[PolicyId]>,
        ctx: &mut EvaluationContext<'_>,
    ) -> Result<TopLevelPolicyEvaluator, EvalError> {
        self.inner
            .read()
            .unwrap()
            .get(kind, id, constraints, ref_chain_if_policy_set, ctx)
    }

    fn join_ref_chains(
        &self,
        head: &[PolicyId],
        tail: &[PolicyId],
    ) -> Result<Vec<PolicyId>, EvalError> {
        self.inner.read().unwrap().join_ref_chains(head, tail)
    }
}

// ----------------------------------------------------------------------------
// Reference transparency
// ----------------------------------------------------------------------------

#[test]
fn static_reference_decides_like_its_target() {
    let target = compile_leaf(&leaf_policy("P", "1.0", Effect::Permit));
    let direct = target.decide(&request());

    let mut provider = StaticPolicyProvider::new();
    provider.add(target).unwrap();
    let refs = ReferenceResolution::Static(Arc::new(provider));

    let set = PolicySetNode::new("PS", "1.0", alg::POLICY_FIRST_APPLICABLE)
        .with_policy_ref(PolicyRefNode::new("P"));
    let evaluator = compile_set_with(&set, &refs).unwrap();

    let through_ref = evaluator.decide(&request());
    assert_eq!(through_ref.decision, direct.decision);
    assert_eq!(through_ref.pep_actions, direct.pep_actions);
}

#[test]
fn dynamic_reference_decides_like_its_target() {
    let provider = SharedProvider::new(StaticPolicyProvider::new());
    provider.add(compile_leaf(&leaf_policy("P", "1.0", Effect::Deny)));
    let refs = ReferenceResolution::Dynamic(provider);

    let set = PolicySetNode::new("PS", "1.0", alg::POLICY_FIRST_APPLICABLE)
        .with_policy_ref(PolicyRefNode::new("P"));
    let evaluator = compile_set_with(&set, &refs).unwrap();

    assert_eq!(evaluator.decide(&request()).decision, Decision::Deny);
}

// ----------------------------------------------------------------------------
// Version matching
// ----------------------------------------------------------------------------

#[test]
fn reference_selects_latest_version_matching_constraints() {
    let mut provider = StaticPolicyProvider::new();
    provider
        .add(compile_leaf(&leaf_policy("P", "1.0", Effect::Deny)))
        .unwrap();
    provider
        .add(compile_leaf(&leaf_policy("P", "1.5", Effect::Permit)))
        .unwrap();
    provider
        .add(compile_leaf(&leaf_policy("P", "2.0", Effect::Deny)))
        .unwrap();
    let refs = ReferenceResolution::Static(Arc::new(provider));

    // "1.*" admits 1.0 and 1.5; latest wins
    let set = PolicySetNode::new("PS", "1.0", alg::POLICY_FIRST_APPLICABLE)
        .with_policy_ref(PolicyRefNode::new("P").with_version("1.*"));
    let evaluator = compile_set_with(&set, &refs).unwrap();
    assert_eq!(evaluator.decide(&request()).decision, Decision::Permit);

    // unconstrained: overall latest (2.0, Deny)
    let set = PolicySetNode::new("PS2", "1.0", alg::POLICY_FIRST_APPLICABLE)
        .with_policy_ref(PolicyRefNode::new("P"));
    let evaluator = compile_set_with(&set, &refs).unwrap();
    assert_eq!(evaluator.decide(&request()).decision, Decision::Deny);
}

#[test]
fn unresolved_static_reference_fails_compilation() {
    let refs = ReferenceResolution::Static(Arc::new(StaticPolicyProvider::new()));
    let set = PolicySetNode::new("PS", "1.0", alg::POLICY_FIRST_APPLICABLE)
        .with_policy_ref(PolicyRefNode::new("no-such-policy"));
    let err = compile_set_with(&set, &refs).unwrap_err();
    assert!(err.to_string().contains("no-such-policy"));
}

#[test]
fn unresolved_dynamic_reference_is_indeterminate_at_runtime() {
    let provider = SharedProvider::new(StaticPolicyProvider::new());
    let refs = ReferenceResolution::Dynamic(provider);

    let set = PolicySetNode::new("PS", "1.0", alg::POLICY_FIRST_APPLICABLE)
        .with_policy_ref(PolicyRefNode::new("no-such-policy"));
    let evaluator = compile_set_with(&set, &refs).unwrap();

    let result = evaluator.decide(&request());
    assert!(result.decision.is_indeterminate());
    assert_eq!(
        result.status.as_ref().unwrap().code,
        StatusCode::ProcessingError
    );
}

// ----------------------------------------------------------------------------
// Cycle prevention
// ----------------------------------------------------------------------------

#[test]
fn static_reference_cycle_fails_compilation() {
    // a policy set registered as "s1", then "s2" referencing "s1"
    let mut provider = StaticPolicyProvider::new();
    let s1 = PolicySetNode::new("s1", "1.0", alg::POLICY_FIRST_APPLICABLE)
        .with_policy(leaf_policy("P", "1.0", Effect::Permit));
    let refs = ReferenceResolution::Static(Arc::new(StaticPolicyProvider::new()));
    let s1_eval = compile_set_with(&s1, &refs).unwrap();
    provider.add(s1_eval).unwrap();

    let s2 = PolicySetNode::new("s2", "1.0", alg::POLICY_FIRST_APPLICABLE)
        .with_policy_set_ref(PolicyRefNode::new("s1"));
    let refs = ReferenceResolution::Static(Arc::new(provider));
    let s2_eval = compile_set_with(&s2, &refs).unwrap();

    let mut provider_with_s2 = StaticPolicyProvider::new();
    provider_with_s2.add(s2_eval).unwrap();

    // compiling a root named "s1" that references "s2" closes the loop:
    // join([s1, s2], [s1]) repeats "s1"
    let looping_root = PolicySetNode::new("s1", "1.0", alg::POLICY_FIRST_APPLICABLE)
        .with_policy_set_ref(PolicyRefNode::new("s2"));
    let refs = ReferenceResolution::Static(Arc::new(provider_with_s2));
    let err = compile_set_with(&looping_root, &refs).unwrap_err();
    assert!(
        err.to_string().contains("cycle"),
        "expected a cycle error, got: {err}"
    );
}

#[test]
fn dynamic_reference_cycle_is_indeterminate_and_terminates() {
    let provider = SharedProvider::new(StaticPolicyProvider::new());
    let refs = ReferenceResolution::Dynamic(Arc::clone(&provider) as Arc<dyn PolicyProvider>);

    // a references b, b references a; both resolvable only at runtime
    let a = PolicySetNode::new("a", "1.0", alg::POLICY_FIRST_APPLICABLE)
        .with_policy_set_ref(PolicyRefNode::new("b"));
    let a_eval = compile_set_with(&a, &refs).unwrap();
    provider.add(a_eval.clone());

    let b = PolicySetNode::new("b", "1.0", alg::POLICY_FIRST_APPLICABLE)
        .with_policy_set_ref(PolicyRefNode::new("a"));
    let b_eval = compile_set_with(&b, &refs).unwrap();
    provider.add(b_eval);

    let result = a_eval.decide(&request());
    assert!(result.decision.is_indeterminate());
    assert_eq!(
        result.status.as_ref().unwrap().code,
        StatusCode::ProcessingError
    );
}

// ----------------------------------------------------------------------------
// Depth enforcement
// ----------------------------------------------------------------------------

/// Builds root -> mid -> leaf out of dynamic references against a
/// provider capped at `max_depth` reference hops.
fn chained_sets(max_depth: usize) -> TopLevelPolicyEvaluator {
    let provider = SharedProvider::new(StaticPolicyProvider::new().with_max_ref_depth(max_depth));
    let refs = ReferenceResolution::Dynamic(Arc::clone(&provider) as Arc<dyn PolicyProvider>);

    let leaf = PolicySetNode::new("leaf", "1.0", alg::POLICY_FIRST_APPLICABLE)
        .with_policy(leaf_policy("P", "1.0", Effect::Permit));
    provider.add(compile_set_with(&leaf, &refs).unwrap());

    let mid = PolicySetNode::new("mid", "1.0", alg::POLICY_FIRST_APPLICABLE)
        .with_policy_set_ref(PolicyRefNode::new("leaf"));
    provider.add(compile_set_with(&mid, &refs).unwrap());

    let root = PolicySetNode::new("root", "1.0", alg::POLICY_FIRST_APPLICABLE)
        .with_policy_set_ref(PolicyRefNode::new("mid"));
    compile_set_with(&root, &refs).unwrap()
}

#[test]
fn chain_within_depth_limit_evaluates_normally() {
    let evaluator = chained_sets(2);
    assert_eq!(evaluator.decide(&request()).decision, Decision::Permit);
}

#[test]
fn chain_exceeding_depth_limit_is_indeterminate() {
    // root -> mid -> leaf is 2 hops; the provider allows 1
    let evaluator = chained_sets(1);
    let result = evaluator.decide(&request());
    assert!(result.decision.is_indeterminate());
    assert_eq!(
        result.status.as_ref().unwrap().code,
        StatusCode::ProcessingError
    );
    assert!(
        result
            .status
            .as_ref()
            .unwrap()
            .message
            .as_ref()
            .unwrap()
            .contains("depth"),
        "status should mention the depth violation"
    );
}

// ----------------------------------------------------------------------------
// Enclosed-policy uniqueness
// ----------------------------------------------------------------------------

#[test]
fn duplicate_enclosed_policy_fails_compilation() {
    let set = PolicySetNode::new("PS", "1.0", alg::POLICY_DENY_OVERRIDES)
        .with_policy_set(
            PolicySetNode::new("inner1", "1.0", alg::POLICY_DENY_OVERRIDES)
                .with_policy(leaf_policy("dup", "1.0", Effect::Permit)),
        )
        .with_policy_set(
            PolicySetNode::new("inner2", "1.0", alg::POLICY_DENY_OVERRIDES)
                .with_policy(leaf_policy("dup", "1.0", Effect::Deny)),
        );
    let err = compile_set_with(&set, &ReferenceResolution::Forbidden).unwrap_err();
    assert!(matches!(
        err,
        PolicyBuildError::DuplicateEnclosedPolicy { .. }
    ));
}

#[test]
fn reference_without_provider_fails_compilation() {
    let set = PolicySetNode::new("PS", "1.0", alg::POLICY_FIRST_APPLICABLE)
        .with_policy_ref(PolicyRefNode::new("P"));
    let err = compile_set_with(&set, &ReferenceResolution::Forbidden).unwrap_err();
    assert!(matches!(err, PolicyBuildError::NoPolicyProvider { .. }));
}
