//! The expression layer: evaluable expressions producing values or bags.
//!
//! Expressions are compiled once from the document model by the
//! [`ExpressionFactory`] and evaluated against a per-request
//! [`EvaluationContext`]. The variants mirror the XACML expression kinds:
//! attribute-value literals, designators, selectors, variable references,
//! and function applications.

pub mod factory;
pub mod functions;

use std::fmt::{self, Display};
use std::sync::Arc;

use garnet_types::{AttributeId, AttributeValue, Bag, Category, Datatype};

use crate::content::ContentPath;
use crate::context::EvaluationContext;
use crate::error::EvalError;
use functions::FunctionDef;

// ============================================================================
// VariableId
// ============================================================================

/// Identifier of a policy `VariableDefinition`, lexically scoped to its
/// enclosing policy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VariableId(String);

impl VariableId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for VariableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for VariableId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

// ============================================================================
// Value
// ============================================================================

/// The result of evaluating an expression: a single value or a bag.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Atomic(AttributeValue),
    Bag(Bag),
}

impl Value {
    /// Unwraps an atomic boolean, the type conditions and match functions
    /// return.
    pub fn expect_boolean(&self) -> Result<bool, EvalError> {
        match self {
            Self::Atomic(v) => v.as_boolean().map_err(EvalError::from),
            Self::Bag(bag) => Err(EvalError::Internal(format!(
                "expected a boolean value, got a bag of {}",
                bag.datatype()
            ))),
        }
    }

    /// Unwraps an atomic value of the given datatype.
    pub fn expect_atomic(&self, datatype: Datatype) -> Result<&AttributeValue, EvalError> {
        match self {
            Self::Atomic(v) if v.datatype() == datatype => Ok(v),
            Self::Atomic(v) => Err(EvalError::Value(garnet_types::ValueError::TypeMismatch {
                expected: datatype,
                actual: v.datatype(),
            })),
            Self::Bag(bag) => Err(EvalError::Internal(format!(
                "expected an atomic {datatype}, got a bag of {}",
                bag.datatype()
            ))),
        }
    }

    /// Unwraps a bag.
    pub fn expect_bag(&self) -> Result<&Bag, EvalError> {
        match self {
            Self::Bag(bag) => Ok(bag),
            Self::Atomic(v) => Err(EvalError::Internal(format!(
                "expected a bag, got an atomic {}",
                v.datatype()
            ))),
        }
    }
}

// ============================================================================
// Expression
// ============================================================================

/// A compiled, immutable expression.
#[derive(Debug, Clone)]
pub enum Expression {
    /// A constant attribute value.
    Literal(AttributeValue),
    /// An attribute designator producing a bag from request attributes.
    Designator(AttributeDesignator),
    /// An attribute selector producing a bag from request content.
    Selector(AttributeSelector),
    /// A reference to a policy variable.
    Variable(Arc<VariableReference>),
    /// A function application.
    Apply(FunctionCall),
    /// A reference to a function itself, as passed to higher-order
    /// functions such as `any-of`. Not evaluable to a value.
    FunctionRef(Arc<dyn FunctionDef>),
}

impl Expression {
    /// Evaluates this expression in the given context.
    pub fn evaluate(&self, ctx: &mut EvaluationContext<'_>) -> Result<Value, EvalError> {
        match self {
            Self::Literal(v) => Ok(Value::Atomic(v.clone())),
            Self::Designator(d) => d.evaluate(ctx).map(Value::Bag),
            Self::Selector(s) => s.evaluate(ctx).map(Value::Bag),
            Self::Variable(var) => var.evaluate(ctx),
            Self::Apply(call) => call.evaluate(ctx),
            Self::FunctionRef(f) => Err(EvalError::Internal(format!(
                "function reference '{}' is not evaluable to a value",
                f.id()
            ))),
        }
    }

    /// The constant value of this expression, if statically known.
    ///
    /// Only literals are folded; this is what constant-false condition
    /// pruning keys off.
    pub fn constant(&self) -> Option<&AttributeValue> {
        match self {
            Self::Literal(v) => Some(v),
            _ => None,
        }
    }
}

// ============================================================================
// AttributeDesignator
// ============================================================================

/// Selects request attribute values by (category, id, optional issuer)
/// and datatype, producing a bag.
#[derive(Debug, Clone)]
pub struct AttributeDesignator {
    pub category: Category,
    pub attribute_id: AttributeId,
    pub issuer: Option<String>,
    pub datatype: Datatype,
    /// When true, an empty result is a missing-attribute error instead of
    /// an empty bag.
    pub must_be_present: bool,
}

impl AttributeDesignator {
    pub fn evaluate(&self, ctx: &EvaluationContext<'_>) -> Result<Bag, EvalError> {
        let mut values = Vec::new();
        for (key, bag) in ctx
            .request()
            .attributes_matching(&self.category, &self.attribute_id)
        {
            if let Some(issuer) = &self.issuer {
                if key.issuer.as_deref() != Some(issuer.as_str()) {
                    continue;
                }
            }
            if bag.datatype() == self.datatype {
                values.extend(bag.iter().cloned());
            }
        }

        if values.is_empty() && self.must_be_present {
            return Err(EvalError::MissingAttribute {
                category: self.category.clone(),
                attribute_id: self.attribute_id.clone(),
            });
        }

        Bag::new(self.datatype, values).map_err(EvalError::from)
    }
}

// ============================================================================
// AttributeSelector
// ============================================================================

/// Selects values from a category's structured content with a compiled
/// content path, producing a bag.
#[derive(Debug, Clone)]
pub struct AttributeSelector {
    pub category: Category,
    pub path: ContentPath,
    pub datatype: Datatype,
    pub must_be_present: bool,
}

impl AttributeSelector {
    pub fn evaluate(&self, ctx: &mut EvaluationContext<'_>) -> Result<Bag, EvalError> {
        let Some(content) = ctx.request().content(&self.category) else {
            if self.must_be_present {
                return Err(EvalError::MissingContent {
                    category: self.category.clone(),
                });
            }
            return Ok(Bag::empty(self.datatype));
        };

        // Path variables read the values the enclosing policy assigned
        // eagerly before evaluating its children.
        let mut resolve = |id: &VariableId| match ctx.variable(id) {
            Some(Value::Atomic(v)) => Ok(v.clone()),
            Some(Value::Bag(bag)) => bag.single().cloned().map_err(EvalError::from),
            None => Err(EvalError::UndefinedVariable(id.clone())),
        };

        let bag = self
            .path
            .select_values(content, self.datatype, &mut resolve)?;

        if bag.is_empty() && self.must_be_present {
            return Err(EvalError::MissingContent {
                category: self.category.clone(),
            });
        }
        Ok(bag)
    }
}

// ============================================================================
// VariableReference
// ============================================================================

/// A compiled variable: its id plus the defining expression.
///
/// Evaluation memoizes the value in the context, so a variable referenced
/// from several places in a policy is computed at most once per request.
#[derive(Debug)]
pub struct VariableReference {
    id: VariableId,
    expression: Expression,
}

impl VariableReference {
    pub fn new(id: VariableId, expression: Expression) -> Self {
        Self { id, expression }
    }

    pub fn id(&self) -> &VariableId {
        &self.id
    }

    pub fn expression(&self) -> &Expression {
        &self.expression
    }

    pub fn evaluate(&self, ctx: &mut EvaluationContext<'_>) -> Result<Value, EvalError> {
        if let Some(value) = ctx.variable(&self.id) {
            return Ok(value.clone());
        }
        let value = self
            .expression
            .evaluate(ctx)
            .map_err(|e| e.in_context(format!("error evaluating variable '{}'", self.id)))?;
        ctx.set_variable_if_absent(self.id.clone(), value.clone());
        Ok(value)
    }
}

// ============================================================================
// FunctionCall
// ============================================================================

/// A validated application of a function to argument expressions.
#[derive(Debug, Clone)]
pub struct FunctionCall {
    function: Arc<dyn FunctionDef>,
    args: Vec<Expression>,
}

impl FunctionCall {
    /// Builds a call after validating the argument list against the
    /// function's signature.
    pub fn new(
        function: Arc<dyn FunctionDef>,
        args: Vec<Expression>,
    ) -> Result<Self, crate::error::PolicyBuildError> {
        function.validate(&args)?;
        Ok(Self { function, args })
    }

    pub fn function_id(&self) -> &str {
        self.function.id()
    }

    pub fn args(&self) -> &[Expression] {
        &self.args
    }

    pub fn evaluate(&self, ctx: &mut EvaluationContext<'_>) -> Result<Value, EvalError> {
        self.function.invoke(ctx, &self.args)
    }
}

// ============================================================================
// Tests
// ============================================================================
