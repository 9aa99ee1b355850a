//! End-to-end decision scenarios over compiled policies.

use garnet_pdp::combining::ids as alg;
use garnet_pdp::compile::{compile_policy, compile_policy_set, ReferenceResolution};
use garnet_pdp::expr::factory::ExpressionFactory;
use garnet_pdp::expr::functions::{ids as func, FunctionRegistry};
use garnet_pdp::model::{
    AttributeAssignmentNode, BagSourceNode, DesignatorNode, ExpressionNode, MatchNode,
    PepActionNode, PolicyNode, PolicySetNode, RuleNode, TargetNode,
};
use garnet_pdp::{CombiningAlgRegistry, EvaluationContext, TopLevelPolicyEvaluator};
use garnet_types::{
    AttributeId, AttributeValue, Bag, Category, Datatype, Decision, DecisionRequest, Effect,
    ExtendedIndeterminate, StatusCode,
};

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

fn compile(node: &PolicyNode) -> TopLevelPolicyEvaluator {
    let mut factory = ExpressionFactory::new(FunctionRegistry::standard());
    let algorithms = CombiningAlgRegistry::standard();
    compile_policy(node, &mut factory, &algorithms).expect("policy must compile")
}

fn compile_set(node: &PolicySetNode) -> TopLevelPolicyEvaluator {
    let mut factory = ExpressionFactory::new(FunctionRegistry::standard());
    let algorithms = CombiningAlgRegistry::standard();
    compile_policy_set(node, &mut factory, &algorithms, &ReferenceResolution::Forbidden)
        .expect("policy set must compile")
}

fn subject_target(name: &str) -> TargetNode {
    TargetNode::single_match(MatchNode::new(
        func::STRING_EQUAL,
        name,
        BagSourceNode::Designator(DesignatorNode::new(
            Category::access_subject(),
            AttributeId::new(AttributeId::SUBJECT_ID),
            Datatype::String,
        )),
    ))
}

fn subject_request(name: &str) -> DecisionRequest {
    DecisionRequest::builder()
        .attribute(
            Category::access_subject(),
            AttributeId::new(AttributeId::SUBJECT_ID),
            Bag::of(AttributeValue::from(name)),
        )
        .return_applicable_policies(true)
        .build()
}

/// A condition that always fails at evaluation (bag function applied to
/// an atomic value).
fn erroring_condition() -> ExpressionNode {
    ExpressionNode::apply(
        func::BOOLEAN_ONE_AND_ONLY,
        vec![ExpressionNode::literal(true)],
    )
}

fn obligation(id: &str, on: Effect, values: &[&str]) -> PepActionNode {
    let mut node = PepActionNode::new(id, on);
    for (i, v) in values.iter().enumerate() {
        node = node.with_assignment(AttributeAssignmentNode::new(
            AttributeId::new(format!("attr-{i}")),
            ExpressionNode::literal(*v),
        ));
    }
    node
}

// ----------------------------------------------------------------------------
// Scenario: simple Permit
// ----------------------------------------------------------------------------

#[test]
fn simple_permit() {
    let policy = PolicyNode::new("P1", "1.0", alg::RULE_DENY_OVERRIDES)
        .with_target(subject_target("alice"))
        .with_rule(RuleNode::new("r1", Effect::Permit).with_condition(ExpressionNode::literal(true)));
    let evaluator = compile(&policy);

    let result = evaluator.decide(&subject_request("alice"));
    assert_eq!(result.decision, Decision::Permit);
    assert!(result.pep_actions.is_empty());
    assert_eq!(result.applicable_policies.len(), 1);
    assert_eq!(result.applicable_policies[0].to_string(), "Policy[P1#v1.0]");
}

#[test]
fn target_no_match_yields_not_applicable_without_obligations() {
    let policy = PolicyNode::new("P1", "1.0", alg::RULE_DENY_OVERRIDES)
        .with_target(subject_target("alice"))
        .with_rule(RuleNode::new("r1", Effect::Permit))
        .with_obligation(obligation("ob", Effect::Permit, &["x"]));
    let evaluator = compile(&policy);

    let result = evaluator.decide(&subject_request("bob"));
    assert_eq!(result.decision, Decision::NotApplicable);
    assert!(result.pep_actions.is_empty());
    assert!(result.applicable_policies.is_empty());
}

// ----------------------------------------------------------------------------
// Scenario: deny-overrides with an indeterminate rule
// ----------------------------------------------------------------------------

#[test]
fn deny_overrides_with_indeterminate_deny_rule_and_permit() {
    let policy = PolicyNode::new("P1", "1.0", alg::RULE_DENY_OVERRIDES)
        .with_rule(RuleNode::new("a", Effect::Deny).with_condition(erroring_condition()))
        .with_rule(RuleNode::new("b", Effect::Permit));
    let evaluator = compile(&policy);

    let result = evaluator.decide(&subject_request("alice"));
    assert_eq!(
        result.decision,
        Decision::Indeterminate(ExtendedIndeterminate::DenyOrPermit)
    );
    // the policy contributed a decision, so it is applicable
    assert_eq!(result.applicable_policies.len(), 1);
}

// ----------------------------------------------------------------------------
// Scenario: obligation on Permit
// ----------------------------------------------------------------------------

#[test]
fn obligation_on_permit_keeps_assignment_order() {
    let policy = PolicyNode::new("P1", "1.0", alg::RULE_PERMIT_OVERRIDES)
        .with_rule(RuleNode::new("r1", Effect::Permit))
        .with_obligation(obligation("notify", Effect::Permit, &["first", "second"]));
    let evaluator = compile(&policy);

    let result = evaluator.decide(&subject_request("alice"));
    assert_eq!(result.decision, Decision::Permit);
    assert_eq!(result.pep_actions.len(), 1);

    let action = &result.pep_actions[0];
    assert_eq!(action.id, "notify");
    assert!(action.is_mandatory);
    assert_eq!(action.assignments.len(), 2);
    assert_eq!(action.assignments[0].value, AttributeValue::from("first"));
    assert_eq!(action.assignments[1].value, AttributeValue::from("second"));
}

#[test]
fn deny_bound_obligation_is_not_fulfilled_on_permit() {
    let policy = PolicyNode::new("P1", "1.0", alg::RULE_PERMIT_OVERRIDES)
        .with_rule(RuleNode::new("r1", Effect::Permit))
        .with_obligation(obligation("on-deny", Effect::Deny, &["x"]));
    let evaluator = compile(&policy);

    let result = evaluator.decide(&subject_request("alice"));
    assert_eq!(result.decision, Decision::Permit);
    assert!(result.pep_actions.is_empty());
}

// ----------------------------------------------------------------------------
// Scenario: only-one-applicable tie
// ----------------------------------------------------------------------------

#[test]
fn only_one_applicable_tie_is_indeterminate_processing_error() {
    let set = PolicySetNode::new("PS", "1.0", alg::POLICY_ONLY_ONE_APPLICABLE)
        .with_policy(
            PolicyNode::new("P1", "1.0", alg::RULE_DENY_OVERRIDES)
                .with_rule(RuleNode::new("r1", Effect::Permit)),
        )
        .with_policy(
            PolicyNode::new("P2", "1.0", alg::RULE_DENY_OVERRIDES)
                .with_rule(RuleNode::new("r2", Effect::Deny)),
        );
    let evaluator = compile_set(&set);

    let result = evaluator.decide(&subject_request("alice"));
    assert!(result.decision.is_indeterminate());
    assert_eq!(
        result.status.as_ref().unwrap().code,
        StatusCode::ProcessingError
    );
    // only the policy set itself is reported applicable
    assert_eq!(result.applicable_policies.len(), 1);
    assert_eq!(
        result.applicable_policies[0].to_string(),
        "PolicySet[PS#v1.0]"
    );
}

#[test]
fn only_one_applicable_selects_the_single_match() {
    let set = PolicySetNode::new("PS", "1.0", alg::POLICY_ONLY_ONE_APPLICABLE)
        .with_policy(
            PolicyNode::new("P1", "1.0", alg::RULE_DENY_OVERRIDES)
                .with_target(subject_target("alice"))
                .with_rule(RuleNode::new("r1", Effect::Permit)),
        )
        .with_policy(
            PolicyNode::new("P2", "1.0", alg::RULE_DENY_OVERRIDES)
                .with_target(subject_target("bob"))
                .with_rule(RuleNode::new("r2", Effect::Deny)),
        );
    let evaluator = compile_set(&set);

    assert_eq!(
        evaluator.decide(&subject_request("alice")).decision,
        Decision::Permit
    );
    assert_eq!(
        evaluator.decide(&subject_request("bob")).decision,
        Decision::Deny
    );
}

// ----------------------------------------------------------------------------
// Obligation accumulation order across the subtree
// ----------------------------------------------------------------------------

#[test]
fn obligations_accumulate_children_before_parent_left_to_right() {
    let set = PolicySetNode::new("PS", "1.0", alg::POLICY_DENY_OVERRIDES)
        .with_policy(
            PolicyNode::new("P1", "1.0", alg::RULE_PERMIT_OVERRIDES)
                .with_rule(
                    RuleNode::new("r1", Effect::Permit)
                        .with_obligation(obligation("rule-ob", Effect::Permit, &["r"])),
                )
                .with_obligation(obligation("p1-ob", Effect::Permit, &["a"])),
        )
        .with_policy(
            PolicyNode::new("P2", "1.0", alg::RULE_PERMIT_OVERRIDES)
                .with_rule(RuleNode::new("r2", Effect::Permit))
                .with_obligation(obligation("p2-ob", Effect::Permit, &["b"])),
        )
        .with_obligation(obligation("ps-ob", Effect::Permit, &["c"]));
    let evaluator = compile_set(&set);

    let result = evaluator.decide(&subject_request("alice"));
    assert_eq!(result.decision, Decision::Permit);

    let order: Vec<&str> = result.pep_actions.iter().map(|a| a.id.as_str()).collect();
    assert_eq!(order, ["rule-ob", "p1-ob", "p2-ob", "ps-ob"]);
}

#[test]
fn failing_policy_obligation_collapses_to_indeterminate_with_alg_bias() {
    let policy = PolicyNode::new("P1", "1.0", alg::RULE_PERMIT_OVERRIDES)
        .with_rule(RuleNode::new("r1", Effect::Permit))
        .with_obligation(
            PepActionNode::new("bad", Effect::Permit).with_assignment(
                AttributeAssignmentNode::new(AttributeId::new("x"), erroring_condition()),
            ),
        );
    let evaluator = compile(&policy);

    let result = evaluator.decide(&subject_request("alice"));
    assert_eq!(
        result.decision,
        Decision::Indeterminate(ExtendedIndeterminate::Permit)
    );
    assert!(result.pep_actions.is_empty());
    // it contributed a decision: still applicable
    assert_eq!(result.applicable_policies.len(), 1);
}

// ----------------------------------------------------------------------------
// Per-request memoization
// ----------------------------------------------------------------------------

#[test]
fn evaluation_is_idempotent_within_one_context() {
    let policy = PolicyNode::new("P1", "1.0", alg::RULE_PERMIT_OVERRIDES)
        .with_rule(RuleNode::new("r1", Effect::Permit))
        .with_obligation(obligation("ob", Effect::Permit, &["x", "y"]));
    let evaluator = compile(&policy);

    let request = subject_request("alice");
    let mut ctx = EvaluationContext::new(&request);
    let first = evaluator.evaluate(&mut ctx, false);
    let second = evaluator.evaluate(&mut ctx, false);
    assert_eq!(first, second);
    assert_eq!(first.pep_actions, second.pep_actions);
}

#[test]
fn evaluation_is_pure_across_contexts() {
    let policy = PolicyNode::new("P1", "1.0", alg::RULE_DENY_OVERRIDES)
        .with_target(subject_target("alice"))
        .with_rule(RuleNode::new("r1", Effect::Permit));
    let evaluator = compile(&policy);

    let request = subject_request("alice");
    assert_eq!(evaluator.decide(&request), evaluator.decide(&request));
}

// ----------------------------------------------------------------------------
// Boundary behaviors
// ----------------------------------------------------------------------------

#[test]
fn zero_children_units() {
    let empty_overrides = PolicyNode::new("P1", "1.0", alg::RULE_DENY_OVERRIDES);
    assert_eq!(
        compile(&empty_overrides)
            .decide(&subject_request("alice"))
            .decision,
        Decision::NotApplicable
    );

    let empty_deny_unless = PolicyNode::new("P2", "1.0", alg::RULE_DENY_UNLESS_PERMIT);
    assert_eq!(
        compile(&empty_deny_unless)
            .decide(&subject_request("alice"))
            .decision,
        Decision::Deny
    );

    let empty_permit_unless = PolicyNode::new("P3", "1.0", alg::RULE_PERMIT_UNLESS_DENY);
    assert_eq!(
        compile(&empty_permit_unless)
            .decide(&subject_request("alice"))
            .decision,
        Decision::Permit
    );
}

#[test]
fn constant_false_rule_contributes_nothing() {
    let policy = PolicyNode::new("P1", "1.0", alg::RULE_FIRST_APPLICABLE)
        .with_rule(
            RuleNode::new("dead", Effect::Deny)
                .with_condition(ExpressionNode::literal(false))
                .with_obligation(obligation("never", Effect::Deny, &["x"])),
        )
        .with_rule(RuleNode::new("live", Effect::Permit));
    let evaluator = compile(&policy);

    let result = evaluator.decide(&subject_request("alice"));
    assert_eq!(result.decision, Decision::Permit);
    assert!(result.pep_actions.is_empty());
}

// ----------------------------------------------------------------------------
// Variable scoping
// ----------------------------------------------------------------------------

#[test]
fn variables_are_scoped_to_their_policy() {
    // both policies define a variable with the same id; compiling them
    // into one policy set works because each scope is closed on exit
    let policy_with_var = |id: &str, subject: &str| {
        PolicyNode::new(id, "1.0", alg::RULE_DENY_OVERRIDES)
            .with_variable(
                "is-subject",
                ExpressionNode::apply(
                    func::STRING_EQUAL,
                    vec![
                        ExpressionNode::literal(subject),
                        ExpressionNode::apply(
                            func::STRING_ONE_AND_ONLY,
                            vec![ExpressionNode::Designator(DesignatorNode::new(
                                Category::access_subject(),
                                AttributeId::new(AttributeId::SUBJECT_ID),
                                Datatype::String,
                            ))],
                        ),
                    ],
                ),
            )
            .with_rule(
                RuleNode::new("r", Effect::Permit)
                    .with_condition(ExpressionNode::variable("is-subject")),
            )
    };

    let set = PolicySetNode::new("PS", "1.0", alg::POLICY_PERMIT_OVERRIDES)
        .with_policy(policy_with_var("P1", "alice"))
        .with_policy(policy_with_var("P2", "bob"));
    let evaluator = compile_set(&set);

    assert_eq!(
        evaluator.decide(&subject_request("alice")).decision,
        Decision::Permit
    );
    assert_eq!(
        evaluator.decide(&subject_request("carol")).decision,
        Decision::NotApplicable
    );
}

#[test]
fn selector_paths_can_use_policy_variables() {
    use garnet_pdp::model::SelectorNode;

    // variable "ward" names the record to inspect; the selector path
    // binds it as a path variable
    let policy = PolicyNode::new("P1", "1.0", alg::RULE_DENY_OVERRIDES)
        .with_variable("ward", ExpressionNode::literal("icu"))
        .with_rule(
            RuleNode::new("r", Effect::Permit).with_condition(ExpressionNode::apply(
                func::STRING_EQUAL,
                vec![
                    ExpressionNode::literal("open"),
                    ExpressionNode::apply(
                        func::STRING_ONE_AND_ONLY,
                        vec![ExpressionNode::Selector(SelectorNode::new(
                            Category::resource(),
                            "/wards/$ward/status",
                            Datatype::String,
                        ))],
                    ),
                ],
            )),
        );

    let mut factory = ExpressionFactory::new(FunctionRegistry::standard()).with_content_paths();
    let algorithms = CombiningAlgRegistry::standard();
    let evaluator = compile_policy(&policy, &mut factory, &algorithms).unwrap();

    let request = |status: &str| {
        DecisionRequest::builder()
            .content(
                Category::resource(),
                serde_json::json!({"wards": {"icu": {"status": status}}}),
            )
            .build()
    };
    assert_eq!(evaluator.decide(&request("open")).decision, Decision::Permit);
    assert_eq!(
        evaluator.decide(&request("closed")).decision,
        Decision::NotApplicable
    );

    // without content-path support the same policy must not compile
    let mut plain_factory = ExpressionFactory::new(FunctionRegistry::standard());
    assert!(compile_policy(&policy, &mut plain_factory, &algorithms).is_err());
}

#[test]
fn duplicate_variable_in_one_policy_is_a_compile_error() {
    let policy = PolicyNode::new("P1", "1.0", alg::RULE_DENY_OVERRIDES)
        .with_variable("v", ExpressionNode::literal(true))
        .with_variable("v", ExpressionNode::literal(false));

    let mut factory = ExpressionFactory::new(FunctionRegistry::standard());
    let algorithms = CombiningAlgRegistry::standard();
    assert!(compile_policy(&policy, &mut factory, &algorithms).is_err());
}

#[test]
fn duplicate_rule_id_is_a_compile_error() {
    let policy = PolicyNode::new("P1", "1.0", alg::RULE_DENY_OVERRIDES)
        .with_rule(RuleNode::new("r", Effect::Permit))
        .with_rule(RuleNode::new("r", Effect::Deny));

    let mut factory = ExpressionFactory::new(FunctionRegistry::standard());
    let algorithms = CombiningAlgRegistry::standard();
    assert!(compile_policy(&policy, &mut factory, &algorithms).is_err());
}

// ----------------------------------------------------------------------------
// Target Indeterminate and the extended-indeterminate table
// ----------------------------------------------------------------------------

#[test]
fn indeterminate_target_with_permit_children_biases_permit() {
    let erroring_target = TargetNode::single_match(MatchNode::new(
        func::STRING_EQUAL,
        "secret",
        BagSourceNode::Designator(
            DesignatorNode::new(
                Category::access_subject(),
                AttributeId::new("clearance-label"),
                Datatype::String,
            )
            .must_be_present(),
        ),
    ));
    let policy = PolicyNode::new("P1", "1.0", alg::RULE_PERMIT_OVERRIDES)
        .with_target(erroring_target.clone())
        .with_rule(RuleNode::new("r1", Effect::Permit));
    let evaluator = compile(&policy);

    let result = evaluator.decide(&subject_request("alice"));
    assert_eq!(
        result.decision,
        Decision::Indeterminate(ExtendedIndeterminate::Permit)
    );
    assert_eq!(
        result.status.as_ref().unwrap().code,
        StatusCode::MissingAttribute
    );
    assert_eq!(result.applicable_policies.len(), 1);

    // combining result NotApplicable + Indeterminate target stays
    // NotApplicable and the policy is not reported applicable
    let vacuous = PolicyNode::new("P2", "1.0", alg::RULE_PERMIT_OVERRIDES)
        .with_target(erroring_target)
        .with_rule(RuleNode::new("dead", Effect::Permit).with_condition(ExpressionNode::literal(false)));
    let evaluator = compile(&vacuous);
    let result = evaluator.decide(&subject_request("alice"));
    assert_eq!(result.decision, Decision::NotApplicable);
    assert!(result.applicable_policies.is_empty());
}
