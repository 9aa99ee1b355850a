//! Obligation and advice expressions.
//!
//! A [`PepActionExpression`] is a compiled ObligationExpression or
//! AdviceExpression. It applies to exactly one decision (FulfillOn /
//! AppliesTo) and, when evaluated, produces a concrete [`PepAction`] by
//! evaluating its attribute assignments in declaration order. Any
//! Indeterminate from an assignment makes the enclosing rule or policy
//! Indeterminate (XACML 3.0 §7.18); the caller handles that collapse.

use garnet_types::{AttributeAssignment, AttributeId, Category, Effect, PepAction};

use crate::content::PathCompiler;
use crate::context::EvaluationContext;
use crate::error::{EvalError, PolicyBuildError};
use crate::expr::factory::ExpressionFactory;
use crate::expr::{Expression, Value};
use crate::model::PepActionNode;

// ============================================================================
// AttributeAssignmentExpression
// ============================================================================

#[derive(Debug)]
struct AttributeAssignmentExpression {
    attribute_id: AttributeId,
    category: Option<Category>,
    expression: Expression,
}

impl AttributeAssignmentExpression {
    /// Evaluates to the concrete assignments: one per value when the
    /// expression yields a bag, a single one otherwise.
    fn evaluate(
        &self,
        ctx: &mut EvaluationContext<'_>,
        out: &mut Vec<AttributeAssignment>,
    ) -> Result<(), EvalError> {
        let value = self.expression.evaluate(ctx).map_err(|e| {
            e.in_context(format!(
                "error evaluating assignment of attribute '{}'",
                self.attribute_id
            ))
        })?;
        match value {
            Value::Atomic(v) => out.push(AttributeAssignment {
                attribute_id: self.attribute_id.clone(),
                category: self.category.clone(),
                value: v,
            }),
            Value::Bag(bag) => {
                for v in &bag {
                    out.push(AttributeAssignment {
                        attribute_id: self.attribute_id.clone(),
                        category: self.category.clone(),
                        value: v.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// PepActionExpression
// ============================================================================

/// A compiled obligation (`is_mandatory`) or advice expression.
#[derive(Debug)]
pub struct PepActionExpression {
    action_id: String,
    is_mandatory: bool,
    applies_to: Effect,
    assignments: Vec<AttributeAssignmentExpression>,
}

impl PepActionExpression {
    pub fn new(
        node: &PepActionNode,
        is_mandatory: bool,
        factory: &ExpressionFactory,
        paths: Option<&PathCompiler>,
    ) -> Result<Self, PolicyBuildError> {
        let assignments = node
            .assignments
            .iter()
            .enumerate()
            .map(|(index, a)| {
                let expression = factory.compile(&a.expression, paths).map_err(|e| {
                    e.in_context(format!(
                        "invalid assignment #{index} of {} '{}'",
                        if is_mandatory { "obligation" } else { "advice" },
                        node.id
                    ))
                })?;
                Ok(AttributeAssignmentExpression {
                    attribute_id: a.attribute_id.clone(),
                    category: a.category.clone(),
                    expression,
                })
            })
            .collect::<Result<Vec<_>, PolicyBuildError>>()?;

        Ok(Self {
            action_id: node.id.clone(),
            is_mandatory,
            applies_to: node.applies_to,
            assignments,
        })
    }

    /// The decision this action accompanies (FulfillOn / AppliesTo).
    pub fn applies_to(&self) -> Effect {
        self.applies_to
    }

    /// Evaluates the assignments into a concrete PEP action.
    pub fn evaluate(&self, ctx: &mut EvaluationContext<'_>) -> Result<PepAction, EvalError> {
        let mut assignments = Vec::with_capacity(self.assignments.len());
        for assignment in &self.assignments {
            assignment.evaluate(ctx, &mut assignments).map_err(|e| {
                e.in_context(format!(
                    "error evaluating {} '{}'",
                    if self.is_mandatory { "obligation" } else { "advice" },
                    self.action_id
                ))
            })?;
        }
        Ok(PepAction {
            id: self.action_id.clone(),
            is_mandatory: self.is_mandatory,
            assignments,
        })
    }
}

// ============================================================================
// PepActionExpressions
// ============================================================================

/// A policy's or rule's obligation and advice expressions, routed by the
/// decision they apply to. Declaration order is preserved within each
/// route: obligations first, then advice, each in document order.
#[derive(Debug, Default)]
pub struct PepActionExpressions {
    deny: Vec<PepActionExpression>,
    permit: Vec<PepActionExpression>,
}

impl PepActionExpressions {
    /// Compiles obligation and advice nodes into routed expressions.
    pub fn compile(
        obligations: &[PepActionNode],
        advice: &[PepActionNode],
        factory: &ExpressionFactory,
        paths: Option<&PathCompiler>,
    ) -> Result<Self, PolicyBuildError> {
        let mut routed = Self::default();
        for node in obligations {
            routed.push(PepActionExpression::new(node, true, factory, paths)?);
        }
        for node in advice {
            routed.push(PepActionExpression::new(node, false, factory, paths)?);
        }
        Ok(routed)
    }

    fn push(&mut self, expression: PepActionExpression) {
        match expression.applies_to() {
            Effect::Deny => self.deny.push(expression),
            Effect::Permit => self.permit.push(expression),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.deny.is_empty() && self.permit.is_empty()
    }

    /// The expressions applying to a Permit or Deny decision.
    pub fn matching(&self, effect: Effect) -> &[PepActionExpression] {
        match effect {
            Effect::Deny => &self.deny,
            Effect::Permit => &self.permit,
        }
    }

    /// Evaluates all matching expressions, appending the produced actions
    /// in declaration order. Stops at the first Indeterminate.
    pub fn evaluate_into(
        &self,
        effect: Effect,
        ctx: &mut EvaluationContext<'_>,
        out: &mut Vec<PepAction>,
    ) -> Result<(), EvalError> {
        for expression in self.matching(effect) {
            out.push(expression.evaluate(ctx)?);
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::functions::{ids, FunctionRegistry};
    use crate::model::{AttributeAssignmentNode, ExpressionNode};
    use garnet_types::DecisionRequest;

    fn factory() -> ExpressionFactory {
        ExpressionFactory::new(FunctionRegistry::standard())
    }

    #[test]
    fn assignments_evaluate_in_declaration_order() {
        let f = factory();
        let node = PepActionNode::new("urn:example:obligation:log", Effect::Permit)
            .with_assignment(AttributeAssignmentNode::new(
                AttributeId::new("first"),
                ExpressionNode::literal("a"),
            ))
            .with_assignment(AttributeAssignmentNode::new(
                AttributeId::new("second"),
                ExpressionNode::literal("b"),
            ));
        let expression = PepActionExpression::new(&node, true, &f, None).unwrap();

        let request = DecisionRequest::builder().build();
        let mut ctx = EvaluationContext::new(&request);
        let action = expression.evaluate(&mut ctx).unwrap();

        assert!(action.is_mandatory);
        assert_eq!(action.assignments.len(), 2);
        assert_eq!(action.assignments[0].attribute_id, AttributeId::new("first"));
        assert_eq!(action.assignments[1].attribute_id, AttributeId::new("second"));
    }

    #[test]
    fn failing_assignment_surfaces_indeterminate() {
        let f = factory();
        let node = PepActionNode::new("urn:example:obligation:bad", Effect::Permit)
            .with_assignment(AttributeAssignmentNode::new(
                AttributeId::new("x"),
                ExpressionNode::apply(
                    ids::STRING_ONE_AND_ONLY,
                    vec![ExpressionNode::literal("not-a-bag")],
                ),
            ));
        let expression = PepActionExpression::new(&node, true, &f, None).unwrap();

        let request = DecisionRequest::builder().build();
        let mut ctx = EvaluationContext::new(&request);
        let err = expression.evaluate(&mut ctx).unwrap_err();
        assert!(err.to_string().contains("obligation"));
    }

    #[test]
    fn routing_splits_by_applies_to() {
        let f = factory();
        let obligations = [
            PepActionNode::new("on-deny", Effect::Deny),
            PepActionNode::new("on-permit", Effect::Permit),
        ];
        let advice = [PepActionNode::new("advice-on-permit", Effect::Permit)];
        let routed = PepActionExpressions::compile(&obligations, &advice, &f, None).unwrap();

        assert_eq!(routed.matching(Effect::Deny).len(), 1);
        assert_eq!(routed.matching(Effect::Permit).len(), 2);
        assert!(!routed.is_empty());
    }
}
