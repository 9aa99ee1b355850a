//! The parsed policy document model.
//!
//! The engine does not own any serialization; callers hand it policy
//! documents already parsed into these nodes (from XML, JSON, or
//! anything else) and the compiler in [`crate::compile`] turns them into
//! immutable evaluators. Builder-style constructors keep hand-assembled
//! documents readable in tests and embedders.

use garnet_types::{AttributeId, AttributeValue, Category, Datatype, Effect};
use garnet_types::meta::VersionError;
use garnet_types::{PolicyVersionPatterns, VersionPattern};
use serde::{Deserialize, Serialize};

// ============================================================================
// Expressions
// ============================================================================

/// An attribute designator node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesignatorNode {
    pub category: Category,
    pub attribute_id: AttributeId,
    pub issuer: Option<String>,
    pub datatype: Datatype,
    pub must_be_present: bool,
}

impl DesignatorNode {
    pub fn new(category: Category, attribute_id: AttributeId, datatype: Datatype) -> Self {
        Self {
            category,
            attribute_id,
            issuer: None,
            datatype,
            must_be_present: false,
        }
    }

    pub fn must_be_present(mut self) -> Self {
        self.must_be_present = true;
        self
    }

    pub fn issued_by(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = Some(issuer.into());
        self
    }
}

/// An attribute selector node addressing request content with a path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectorNode {
    pub category: Category,
    pub path: String,
    pub datatype: Datatype,
    pub must_be_present: bool,
}

impl SelectorNode {
    pub fn new(category: Category, path: impl Into<String>, datatype: Datatype) -> Self {
        Self {
            category,
            path: path.into(),
            datatype,
            must_be_present: false,
        }
    }
}

/// An expression in the document model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExpressionNode {
    Literal(AttributeValue),
    Designator(DesignatorNode),
    Selector(SelectorNode),
    VariableRef(String),
    Apply {
        function_id: String,
        args: Vec<ExpressionNode>,
    },
    /// A function passed as an argument to a higher-order function.
    FunctionRef(String),
}

impl ExpressionNode {
    pub fn literal(value: impl Into<AttributeValue>) -> Self {
        Self::Literal(value.into())
    }

    pub fn apply(function_id: impl Into<String>, args: Vec<ExpressionNode>) -> Self {
        Self::Apply {
            function_id: function_id.into(),
            args,
        }
    }

    pub fn variable(id: impl Into<String>) -> Self {
        Self::VariableRef(id.into())
    }
}

// ============================================================================
// Target
// ============================================================================

/// The bag-producing half of a Match: a designator or selector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BagSourceNode {
    Designator(DesignatorNode),
    Selector(SelectorNode),
}

/// A Match: a binary match function applied between a literal and each
/// element of the bag the source produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchNode {
    pub match_function_id: String,
    pub literal: AttributeValue,
    pub source: BagSourceNode,
}

impl MatchNode {
    pub fn new(
        match_function_id: impl Into<String>,
        literal: impl Into<AttributeValue>,
        source: BagSourceNode,
    ) -> Self {
        Self {
            match_function_id: match_function_id.into(),
            literal: literal.into(),
            source,
        }
    }
}

/// Conjunction of matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllOfNode {
    pub matches: Vec<MatchNode>,
}

/// Disjunction of [`AllOfNode`]s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnyOfNode {
    pub all_ofs: Vec<AllOfNode>,
}

/// A target: conjunction of [`AnyOfNode`]s. No clauses means the target
/// matches every request.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TargetNode {
    pub any_ofs: Vec<AnyOfNode>,
}

impl TargetNode {
    /// The always-matching empty target.
    pub fn match_all() -> Self {
        Self::default()
    }

    /// A target of a single Match.
    pub fn single_match(match_node: MatchNode) -> Self {
        Self {
            any_ofs: vec![AnyOfNode {
                all_ofs: vec![AllOfNode {
                    matches: vec![match_node],
                }],
            }],
        }
    }
}

// ============================================================================
// PEP action expressions
// ============================================================================

/// One AttributeAssignmentExpression inside an obligation or advice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeAssignmentNode {
    pub attribute_id: AttributeId,
    pub category: Option<Category>,
    pub expression: ExpressionNode,
}

impl AttributeAssignmentNode {
    pub fn new(attribute_id: AttributeId, expression: ExpressionNode) -> Self {
        Self {
            attribute_id,
            category: None,
            expression,
        }
    }
}

/// An ObligationExpression or AdviceExpression; which one is decided by
/// where it is attached (obligations vs advice list).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PepActionNode {
    pub id: String,
    /// FulfillOn / AppliesTo: the decision this action accompanies.
    pub applies_to: Effect,
    pub assignments: Vec<AttributeAssignmentNode>,
}

impl PepActionNode {
    pub fn new(id: impl Into<String>, applies_to: Effect) -> Self {
        Self {
            id: id.into(),
            applies_to,
            assignments: Vec::new(),
        }
    }

    pub fn with_assignment(mut self, assignment: AttributeAssignmentNode) -> Self {
        self.assignments.push(assignment);
        self
    }
}

// ============================================================================
// Rule
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleNode {
    pub id: String,
    pub effect: Effect,
    pub target: Option<TargetNode>,
    pub condition: Option<ExpressionNode>,
    pub obligations: Vec<PepActionNode>,
    pub advice: Vec<PepActionNode>,
}

impl RuleNode {
    pub fn new(id: impl Into<String>, effect: Effect) -> Self {
        Self {
            id: id.into(),
            effect,
            target: None,
            condition: None,
            obligations: Vec::new(),
            advice: Vec::new(),
        }
    }

    pub fn with_target(mut self, target: TargetNode) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_condition(mut self, condition: ExpressionNode) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_obligation(mut self, obligation: PepActionNode) -> Self {
        self.obligations.push(obligation);
        self
    }
}

// ============================================================================
// Policy
// ============================================================================

/// A named combiner parameter (constant value).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinerParameterNode {
    pub name: String,
    pub value: AttributeValue,
}

/// Ordered children of a Policy, as the schema's choice group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PolicyChildNode {
    Rule(RuleNode),
    VariableDefinition {
        id: String,
        expression: ExpressionNode,
    },
    RuleCombinerParameters {
        rule_id: String,
        parameters: Vec<CombinerParameterNode>,
    },
    CombinerParameters(Vec<CombinerParameterNode>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyNode {
    pub id: String,
    pub version: String,
    pub rule_combining_alg_id: String,
    pub target: Option<TargetNode>,
    pub children: Vec<PolicyChildNode>,
    pub obligations: Vec<PepActionNode>,
    pub advice: Vec<PepActionNode>,
}

impl PolicyNode {
    pub fn new(
        id: impl Into<String>,
        version: impl Into<String>,
        rule_combining_alg_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
            rule_combining_alg_id: rule_combining_alg_id.into(),
            target: None,
            children: Vec::new(),
            obligations: Vec::new(),
            advice: Vec::new(),
        }
    }

    pub fn with_target(mut self, target: TargetNode) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_rule(mut self, rule: RuleNode) -> Self {
        self.children.push(PolicyChildNode::Rule(rule));
        self
    }

    pub fn with_variable(mut self, id: impl Into<String>, expression: ExpressionNode) -> Self {
        self.children.push(PolicyChildNode::VariableDefinition {
            id: id.into(),
            expression,
        });
        self
    }

    pub fn with_obligation(mut self, obligation: PepActionNode) -> Self {
        self.obligations.push(obligation);
        self
    }

    pub fn with_advice(mut self, advice: PepActionNode) -> Self {
        self.advice.push(advice);
        self
    }
}

// ============================================================================
// PolicySet
// ============================================================================

/// A Policy(Set)IdReference with optional version constraints, each an
/// XACML version match pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRefNode {
    pub id: String,
    pub version: Option<String>,
    pub earliest_version: Option<String>,
    pub latest_version: Option<String>,
}

impl PolicyRefNode {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: None,
            earliest_version: None,
            latest_version: None,
        }
    }

    pub fn with_version(mut self, pattern: impl Into<String>) -> Self {
        self.version = Some(pattern.into());
        self
    }

    /// Parses the constraint patterns.
    pub fn patterns(&self) -> Result<PolicyVersionPatterns, VersionError> {
        let parse = |s: &Option<String>| -> Result<Option<VersionPattern>, VersionError> {
            s.as_deref().map(str::parse).transpose()
        };
        Ok(PolicyVersionPatterns {
            exact: parse(&self.version)?,
            earliest: parse(&self.earliest_version)?,
            latest: parse(&self.latest_version)?,
        })
    }
}

/// Ordered children of a PolicySet, as the schema's choice group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PolicySetChildNode {
    Policy(PolicyNode),
    PolicySet(PolicySetNode),
    PolicyRef(PolicyRefNode),
    PolicySetRef(PolicyRefNode),
    PolicyCombinerParameters {
        policy_id: String,
        parameters: Vec<CombinerParameterNode>,
    },
    PolicySetCombinerParameters {
        policy_set_id: String,
        parameters: Vec<CombinerParameterNode>,
    },
    CombinerParameters(Vec<CombinerParameterNode>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySetNode {
    pub id: String,
    pub version: String,
    pub policy_combining_alg_id: String,
    pub target: Option<TargetNode>,
    pub children: Vec<PolicySetChildNode>,
    pub obligations: Vec<PepActionNode>,
    pub advice: Vec<PepActionNode>,
}

impl PolicySetNode {
    pub fn new(
        id: impl Into<String>,
        version: impl Into<String>,
        policy_combining_alg_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
            policy_combining_alg_id: policy_combining_alg_id.into(),
            target: None,
            children: Vec::new(),
            obligations: Vec::new(),
            advice: Vec::new(),
        }
    }

    pub fn with_target(mut self, target: TargetNode) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_policy(mut self, policy: PolicyNode) -> Self {
        self.children.push(PolicySetChildNode::Policy(policy));
        self
    }

    pub fn with_policy_set(mut self, policy_set: PolicySetNode) -> Self {
        self.children.push(PolicySetChildNode::PolicySet(policy_set));
        self
    }

    pub fn with_policy_ref(mut self, reference: PolicyRefNode) -> Self {
        self.children.push(PolicySetChildNode::PolicyRef(reference));
        self
    }

    pub fn with_policy_set_ref(mut self, reference: PolicyRefNode) -> Self {
        self.children
            .push(PolicySetChildNode::PolicySetRef(reference));
        self
    }

    pub fn with_obligation(mut self, obligation: PepActionNode) -> Self {
        self.obligations.push(obligation);
        self
    }
}
