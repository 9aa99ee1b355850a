//! The rule evaluator: the leaf decision maker.
//!
//! A rule renders its effect (Permit or Deny) when its target matches and
//! its condition holds; NotApplicable when either says no; and
//! Indeterminate biased by its effect when either fails. Rule-level
//! obligations and advice are evaluated as part of rendering the effect,
//! and any failure there also collapses the rule to Indeterminate.

use garnet_types::{Decision, DecisionResult, Effect};
use tracing::{debug, warn};

use crate::content::PathCompiler;
use crate::context::EvaluationContext;
use crate::error::{EvalError, PolicyBuildError};
use crate::expr::factory::ExpressionFactory;
use crate::expr::Expression;
use crate::model::RuleNode;
use crate::pep::PepActionExpressions;
use crate::target::TargetEvaluator;

// ============================================================================
// Condition
// ============================================================================

/// A rule condition: a boolean expression.
#[derive(Debug)]
pub struct Condition {
    expression: Expression,
}

impl Condition {
    pub fn new(expression: Expression) -> Result<Self, PolicyBuildError> {
        // a constant non-boolean can be rejected now; everything else is
        // type-checked at evaluation time
        if let Some(constant) = expression.constant() {
            if constant.as_boolean().is_err() {
                return Err(PolicyBuildError::InvalidFunctionArguments {
                    function_id: "condition".to_string(),
                    message: format!(
                        "condition must be boolean, got constant {}",
                        constant.datatype()
                    ),
                });
            }
        }
        Ok(Self { expression })
    }

    /// Whether this condition is the constant `false`.
    pub fn is_constant_false(&self) -> bool {
        self.expression
            .constant()
            .is_some_and(|v| v.as_boolean() == Ok(false))
    }

    pub fn evaluate(&self, ctx: &mut EvaluationContext<'_>) -> Result<bool, EvalError> {
        let value = self
            .expression
            .evaluate(ctx)
            .map_err(|e| e.in_context("error evaluating condition"))?;
        value.expect_boolean()
    }
}

// ============================================================================
// RuleEvaluator
// ============================================================================

#[derive(Debug)]
pub struct RuleEvaluator {
    id: String,
    effect: Effect,
    target: TargetEvaluator,
    condition: Option<Condition>,
    pep: PepActionExpressions,
    /// True when the condition is constant false, making the rule
    /// NotApplicable for every request. Such rules can be pruned from
    /// combining; they are kept only for diagnostics.
    always_not_applicable: bool,
}

impl RuleEvaluator {
    pub fn new(
        node: &RuleNode,
        factory: &ExpressionFactory,
        paths: Option<&PathCompiler>,
    ) -> Result<Self, PolicyBuildError> {
        let target = TargetEvaluator::new(node.target.as_ref(), factory, paths)
            .map_err(|e| e.in_context(format!("invalid target of rule '{}'", node.id)))?;

        let condition = node
            .condition
            .as_ref()
            .map(|c| {
                factory
                    .compile(c, paths)
                    .and_then(Condition::new)
                    .map_err(|e| e.in_context(format!("invalid condition of rule '{}'", node.id)))
            })
            .transpose()?;

        let pep = PepActionExpressions::compile(&node.obligations, &node.advice, factory, paths)
            .map_err(|e| e.in_context(format!("invalid PEP actions of rule '{}'", node.id)))?;

        let always_not_applicable = condition
            .as_ref()
            .is_some_and(Condition::is_constant_false);
        if always_not_applicable {
            warn!(
                rule_id = %node.id,
                "rule has a constant-false condition and is NotApplicable for every request"
            );
        }

        Ok(Self {
            id: node.id.clone(),
            effect: node.effect,
            target,
            condition,
            pep,
            always_not_applicable,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The rule's effect, or `None` when the rule can never apply
    /// (constant-false condition) and may be pruned from combining.
    pub fn effect(&self) -> Option<Effect> {
        if self.always_not_applicable {
            None
        } else {
            Some(self.effect)
        }
    }

    fn indeterminate(&self, error: &EvalError) -> DecisionResult {
        DecisionResult::indeterminate(self.effect.bias(), error.status(), Vec::new())
    }

    /// Evaluates the rule. Never fails; all errors fold into an
    /// Indeterminate biased by the rule's effect.
    pub fn evaluate(&self, ctx: &mut EvaluationContext<'_>) -> DecisionResult {
        match self.target.matches(ctx) {
            Ok(false) => {
                debug!(rule_id = %self.id, "rule target -> no-match");
                return DecisionResult::not_applicable();
            }
            Ok(true) => {}
            Err(e) => {
                debug!(rule_id = %self.id, "rule target -> Indeterminate");
                return self
                    .indeterminate(&e.in_context(format!("error in target of rule '{}'", self.id)));
            }
        }

        if let Some(condition) = &self.condition {
            match condition.evaluate(ctx) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(rule_id = %self.id, "rule condition -> false");
                    return DecisionResult::not_applicable();
                }
                Err(e) => {
                    debug!(rule_id = %self.id, "rule condition -> Indeterminate");
                    return self.indeterminate(
                        &e.in_context(format!("error in condition of rule '{}'", self.id)),
                    );
                }
            }
        }

        // the rule applies: render the effect with its PEP actions
        let mut actions = Vec::new();
        if let Err(e) = self.pep.evaluate_into(self.effect, ctx, &mut actions) {
            debug!(rule_id = %self.id, "rule PEP actions -> Indeterminate");
            return self
                .indeterminate(&e.in_context(format!("error in PEP actions of rule '{}'", self.id)));
        }

        debug!(rule_id = %self.id, effect = %self.effect, "rule applies");
        DecisionResult {
            decision: self.effect.decision(),
            status: None,
            pep_actions: actions,
            applicable_policies: Vec::new(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::functions::{ids, FunctionRegistry};
    use crate::model::{
        AttributeAssignmentNode, BagSourceNode, DesignatorNode, ExpressionNode, MatchNode,
        PepActionNode, TargetNode,
    };
    use garnet_types::{
        AttributeId, AttributeValue, Bag, Category, Datatype, DecisionRequest,
        ExtendedIndeterminate, StatusCode,
    };

    fn factory() -> ExpressionFactory {
        ExpressionFactory::new(FunctionRegistry::standard())
    }

    fn alice_request() -> DecisionRequest {
        DecisionRequest::builder()
            .attribute(
                Category::access_subject(),
                AttributeId::new(AttributeId::SUBJECT_ID),
                Bag::of(AttributeValue::from("alice")),
            )
            .build()
    }

    fn subject_target(value: &str) -> TargetNode {
        TargetNode::single_match(MatchNode::new(
            ids::STRING_EQUAL,
            value,
            BagSourceNode::Designator(DesignatorNode::new(
                Category::access_subject(),
                AttributeId::new(AttributeId::SUBJECT_ID),
                Datatype::String,
            )),
        ))
    }

    #[test]
    fn rule_without_condition_renders_effect_on_target_match() {
        let f = factory();
        let rule = RuleEvaluator::new(
            &RuleNode::new("r1", Effect::Permit).with_target(subject_target("alice")),
            &f,
            None,
        )
        .unwrap();

        let request = alice_request();
        let mut ctx = EvaluationContext::new(&request);
        let result = rule.evaluate(&mut ctx);
        assert_eq!(result.decision, Decision::Permit);
        assert!(result.pep_actions.is_empty());
    }

    #[test]
    fn rule_target_no_match_is_not_applicable() {
        let f = factory();
        let rule = RuleEvaluator::new(
            &RuleNode::new("r1", Effect::Permit).with_target(subject_target("bob")),
            &f,
            None,
        )
        .unwrap();

        let request = alice_request();
        let mut ctx = EvaluationContext::new(&request);
        assert_eq!(rule.evaluate(&mut ctx).decision, Decision::NotApplicable);
    }

    #[test]
    fn rule_target_error_biases_indeterminate_by_effect() {
        let f = factory();
        let erroring_target = TargetNode::single_match(MatchNode::new(
            ids::STRING_EQUAL,
            "x",
            BagSourceNode::Designator(
                DesignatorNode::new(
                    Category::access_subject(),
                    AttributeId::new("missing"),
                    Datatype::String,
                )
                .must_be_present(),
            ),
        ));
        let rule = RuleEvaluator::new(
            &RuleNode::new("r1", Effect::Deny).with_target(erroring_target),
            &f,
            None,
        )
        .unwrap();

        let request = alice_request();
        let mut ctx = EvaluationContext::new(&request);
        let result = rule.evaluate(&mut ctx);
        assert_eq!(
            result.decision,
            Decision::Indeterminate(ExtendedIndeterminate::Deny)
        );
        assert_eq!(
            result.status.as_ref().unwrap().code,
            StatusCode::MissingAttribute
        );
    }

    #[test]
    fn constant_false_condition_marks_rule_prunable() {
        let f = factory();
        let rule = RuleEvaluator::new(
            &RuleNode::new("dead", Effect::Permit)
                .with_condition(ExpressionNode::literal(false)),
            &f,
            None,
        )
        .unwrap();

        assert_eq!(rule.effect(), None);

        // kept for diagnostics, it still contributes NotApplicable
        let request = alice_request();
        let mut ctx = EvaluationContext::new(&request);
        let result = rule.evaluate(&mut ctx);
        assert_eq!(result.decision, Decision::NotApplicable);
        assert!(result.pep_actions.is_empty());
    }

    #[test]
    fn failing_obligation_collapses_rule_to_indeterminate() {
        let f = factory();
        let rule = RuleEvaluator::new(
            &RuleNode::new("r1", Effect::Permit)
                .with_obligation(
                    PepActionNode::new("bad", Effect::Permit).with_assignment(
                        AttributeAssignmentNode::new(
                            AttributeId::new("x"),
                            ExpressionNode::apply(
                                ids::STRING_ONE_AND_ONLY,
                                vec![ExpressionNode::literal("not-a-bag")],
                            ),
                        ),
                    ),
                ),
            &f,
            None,
        )
        .unwrap();

        let request = alice_request();
        let mut ctx = EvaluationContext::new(&request);
        let result = rule.evaluate(&mut ctx);
        assert_eq!(
            result.decision,
            Decision::Indeterminate(ExtendedIndeterminate::Permit)
        );
        assert!(result.pep_actions.is_empty());
    }

    #[test]
    fn condition_gates_the_effect() {
        let f = factory();
        let rule = RuleEvaluator::new(
            &RuleNode::new("r1", Effect::Deny).with_condition(ExpressionNode::apply(
                ids::BOOLEAN_EQUAL,
                vec![ExpressionNode::literal(true), ExpressionNode::literal(true)],
            )),
            &f,
            None,
        )
        .unwrap();

        let request = alice_request();
        let mut ctx = EvaluationContext::new(&request);
        assert_eq!(rule.evaluate(&mut ctx).decision, Decision::Deny);
    }
}
