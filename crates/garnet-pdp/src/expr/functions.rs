//! Function registry and the standard functions the engine requires.
//!
//! The full XACML function library is out of scope; this module provides
//! the registry contract plus the equality, comparison, logical, bag, and
//! higher-order functions that targets, conditions, and the engine's own
//! Match compilation depend on. Extensions register additional
//! [`FunctionDef`] implementations.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use garnet_types::{AttributeValue, Datatype};

use crate::context::EvaluationContext;
use crate::error::{EvalError, PolicyBuildError};
use crate::expr::{Expression, Value};

/// Identifiers of the standard functions this registry provides.
pub mod ids {
    pub const STRING_EQUAL: &str = "urn:oasis:names:tc:xacml:1.0:function:string-equal";
    pub const BOOLEAN_EQUAL: &str = "urn:oasis:names:tc:xacml:1.0:function:boolean-equal";
    pub const INTEGER_EQUAL: &str = "urn:oasis:names:tc:xacml:1.0:function:integer-equal";
    pub const DOUBLE_EQUAL: &str = "urn:oasis:names:tc:xacml:1.0:function:double-equal";
    pub const ANYURI_EQUAL: &str = "urn:oasis:names:tc:xacml:1.0:function:anyURI-equal";

    pub const INTEGER_GREATER_THAN: &str =
        "urn:oasis:names:tc:xacml:1.0:function:integer-greater-than";
    pub const INTEGER_GREATER_THAN_OR_EQUAL: &str =
        "urn:oasis:names:tc:xacml:1.0:function:integer-greater-than-or-equal";
    pub const INTEGER_LESS_THAN: &str = "urn:oasis:names:tc:xacml:1.0:function:integer-less-than";
    pub const INTEGER_LESS_THAN_OR_EQUAL: &str =
        "urn:oasis:names:tc:xacml:1.0:function:integer-less-than-or-equal";

    pub const AND: &str = "urn:oasis:names:tc:xacml:1.0:function:and";
    pub const OR: &str = "urn:oasis:names:tc:xacml:1.0:function:or";
    pub const NOT: &str = "urn:oasis:names:tc:xacml:1.0:function:not";

    pub const ANY_OF: &str = "urn:oasis:names:tc:xacml:3.0:function:any-of";

    pub const STRING_ONE_AND_ONLY: &str =
        "urn:oasis:names:tc:xacml:1.0:function:string-one-and-only";
    pub const INTEGER_ONE_AND_ONLY: &str =
        "urn:oasis:names:tc:xacml:1.0:function:integer-one-and-only";
    pub const BOOLEAN_ONE_AND_ONLY: &str =
        "urn:oasis:names:tc:xacml:1.0:function:boolean-one-and-only";

    pub const STRING_IS_IN: &str = "urn:oasis:names:tc:xacml:1.0:function:string-is-in";
    pub const INTEGER_IS_IN: &str = "urn:oasis:names:tc:xacml:1.0:function:integer-is-in";

    pub const STRING_STARTS_WITH: &str =
        "urn:oasis:names:tc:xacml:3.0:function:string-starts-with";
}

// ============================================================================
// FunctionDef and registry
// ============================================================================

/// A function usable in policy expressions.
///
/// `validate` runs once at compilation against the argument expressions;
/// `invoke` runs per evaluation and must type-check its runtime inputs,
/// since bag contents are only known then.
pub trait FunctionDef: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;

    fn validate(&self, args: &[Expression]) -> Result<(), PolicyBuildError>;

    fn invoke(
        &self,
        ctx: &mut EvaluationContext<'_>,
        args: &[Expression],
    ) -> Result<Value, EvalError>;
}

/// Registry of functions by identifier.
#[derive(Debug, Clone)]
pub struct FunctionRegistry {
    by_id: HashMap<String, Arc<dyn FunctionDef>>,
}

impl FunctionRegistry {
    /// An empty registry.
    pub fn empty() -> Self {
        Self {
            by_id: HashMap::new(),
        }
    }

    /// The registry of standard functions.
    pub fn standard() -> Self {
        let mut registry = Self::empty();

        for (id, datatype) in [
            (ids::STRING_EQUAL, Datatype::String),
            (ids::BOOLEAN_EQUAL, Datatype::Boolean),
            (ids::INTEGER_EQUAL, Datatype::Integer),
            (ids::DOUBLE_EQUAL, Datatype::Double),
            (ids::ANYURI_EQUAL, Datatype::AnyUri),
        ] {
            registry.register(Arc::new(EqualFn { id, datatype }));
        }

        for (id, op) in [
            (ids::INTEGER_GREATER_THAN, IntegerOp::Gt),
            (ids::INTEGER_GREATER_THAN_OR_EQUAL, IntegerOp::Ge),
            (ids::INTEGER_LESS_THAN, IntegerOp::Lt),
            (ids::INTEGER_LESS_THAN_OR_EQUAL, IntegerOp::Le),
        ] {
            registry.register(Arc::new(IntegerCompareFn { id, op }));
        }

        registry.register(Arc::new(LogicalFn {
            id: ids::AND,
            kind: LogicalKind::And,
        }));
        registry.register(Arc::new(LogicalFn {
            id: ids::OR,
            kind: LogicalKind::Or,
        }));
        registry.register(Arc::new(NotFn));
        registry.register(Arc::new(AnyOfFn));

        for (id, datatype) in [
            (ids::STRING_ONE_AND_ONLY, Datatype::String),
            (ids::INTEGER_ONE_AND_ONLY, Datatype::Integer),
            (ids::BOOLEAN_ONE_AND_ONLY, Datatype::Boolean),
        ] {
            registry.register(Arc::new(OneAndOnlyFn { id, datatype }));
        }

        for (id, datatype) in [
            (ids::STRING_IS_IN, Datatype::String),
            (ids::INTEGER_IS_IN, Datatype::Integer),
        ] {
            registry.register(Arc::new(IsInFn { id, datatype }));
        }

        registry.register(Arc::new(StringStartsWithFn));

        registry
    }

    /// Registers a function, replacing any previous one with the same id.
    pub fn register(&mut self, function: Arc<dyn FunctionDef>) {
        self.by_id.insert(function.id().to_string(), function);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn FunctionDef>> {
        self.by_id.get(id).cloned()
    }
}

// ============================================================================
// Shared helpers
// ============================================================================

fn check_arity(
    function_id: &str,
    args: &[Expression],
    expected: usize,
) -> Result<(), PolicyBuildError> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(PolicyBuildError::InvalidFunctionArguments {
            function_id: function_id.to_string(),
            message: format!("expected {expected} arguments, got {}", args.len()),
        })
    }
}

fn no_function_refs(function_id: &str, args: &[Expression]) -> Result<(), PolicyBuildError> {
    if args.iter().any(|a| matches!(a, Expression::FunctionRef(_))) {
        return Err(PolicyBuildError::InvalidFunctionArguments {
            function_id: function_id.to_string(),
            message: "function references are only valid as the first argument of a higher-order function".to_string(),
        });
    }
    Ok(())
}

fn in_function(function_id: &str, e: EvalError) -> EvalError {
    e.in_context(format!("error in function '{function_id}'"))
}

fn eval_atomic(
    ctx: &mut EvaluationContext<'_>,
    expr: &Expression,
    datatype: Datatype,
    function_id: &str,
) -> Result<AttributeValue, EvalError> {
    let value = expr
        .evaluate(ctx)
        .map_err(|e| in_function(function_id, e))?;
    value
        .expect_atomic(datatype)
        .cloned()
        .map_err(|e| in_function(function_id, e))
}

fn eval_boolean(
    ctx: &mut EvaluationContext<'_>,
    expr: &Expression,
    function_id: &str,
) -> Result<bool, EvalError> {
    let value = expr
        .evaluate(ctx)
        .map_err(|e| in_function(function_id, e))?;
    value.expect_boolean().map_err(|e| in_function(function_id, e))
}

fn boolean(b: bool) -> Value {
    Value::Atomic(AttributeValue::Boolean(b))
}

// ============================================================================
// Equality and comparison
// ============================================================================

#[derive(Debug)]
struct EqualFn {
    id: &'static str,
    datatype: Datatype,
}

impl FunctionDef for EqualFn {
    fn id(&self) -> &str {
        self.id
    }

    fn validate(&self, args: &[Expression]) -> Result<(), PolicyBuildError> {
        check_arity(self.id, args, 2)?;
        no_function_refs(self.id, args)
    }

    fn invoke(
        &self,
        ctx: &mut EvaluationContext<'_>,
        args: &[Expression],
    ) -> Result<Value, EvalError> {
        let a = eval_atomic(ctx, &args[0], self.datatype, self.id)?;
        let b = eval_atomic(ctx, &args[1], self.datatype, self.id)?;
        Ok(boolean(a == b))
    }
}

#[derive(Debug, Clone, Copy)]
enum IntegerOp {
    Gt,
    Ge,
    Lt,
    Le,
}

#[derive(Debug)]
struct IntegerCompareFn {
    id: &'static str,
    op: IntegerOp,
}

impl FunctionDef for IntegerCompareFn {
    fn id(&self) -> &str {
        self.id
    }

    fn validate(&self, args: &[Expression]) -> Result<(), PolicyBuildError> {
        check_arity(self.id, args, 2)?;
        no_function_refs(self.id, args)
    }

    fn invoke(
        &self,
        ctx: &mut EvaluationContext<'_>,
        args: &[Expression],
    ) -> Result<Value, EvalError> {
        let a = eval_atomic(ctx, &args[0], Datatype::Integer, self.id)?
            .as_integer()
            .map_err(|e| in_function(self.id, e.into()))?;
        let b = eval_atomic(ctx, &args[1], Datatype::Integer, self.id)?
            .as_integer()
            .map_err(|e| in_function(self.id, e.into()))?;
        let result = match self.op {
            IntegerOp::Gt => a > b,
            IntegerOp::Ge => a >= b,
            IntegerOp::Lt => a < b,
            IntegerOp::Le => a <= b,
        };
        Ok(boolean(result))
    }
}

// ============================================================================
// Logical functions
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum LogicalKind {
    And,
    Or,
}

/// Variadic `and`/`or` with XACML error semantics: a determinate
/// short-circuit value wins over an earlier argument error; an error is
/// reported only when no argument decides the result.
#[derive(Debug)]
struct LogicalFn {
    id: &'static str,
    kind: LogicalKind,
}

impl FunctionDef for LogicalFn {
    fn id(&self) -> &str {
        self.id
    }

    fn validate(&self, args: &[Expression]) -> Result<(), PolicyBuildError> {
        no_function_refs(self.id, args)
    }

    fn invoke(
        &self,
        ctx: &mut EvaluationContext<'_>,
        args: &[Expression],
    ) -> Result<Value, EvalError> {
        let deciding = matches!(self.kind, LogicalKind::Or);
        let mut first_error: Option<EvalError> = None;
        for arg in args {
            match eval_boolean(ctx, arg, self.id) {
                Ok(b) if b == deciding => return Ok(boolean(deciding)),
                Ok(_) => {}
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(boolean(!deciding)),
        }
    }
}

#[derive(Debug)]
struct NotFn;

impl FunctionDef for NotFn {
    fn id(&self) -> &str {
        ids::NOT
    }

    fn validate(&self, args: &[Expression]) -> Result<(), PolicyBuildError> {
        check_arity(ids::NOT, args, 1)?;
        no_function_refs(ids::NOT, args)
    }

    fn invoke(
        &self,
        ctx: &mut EvaluationContext<'_>,
        args: &[Expression],
    ) -> Result<Value, EvalError> {
        let b = eval_boolean(ctx, &args[0], ids::NOT)?;
        Ok(boolean(!b))
    }
}

// ============================================================================
// any-of
// ============================================================================

/// Higher-order `any-of(f, value, bag)`: true iff `f(value, element)` is
/// true for some element of the bag. This is the form Match elements
/// compile to; the general n-ary form is not needed by the engine.
#[derive(Debug)]
struct AnyOfFn;

impl FunctionDef for AnyOfFn {
    fn id(&self) -> &str {
        ids::ANY_OF
    }

    fn validate(&self, args: &[Expression]) -> Result<(), PolicyBuildError> {
        check_arity(ids::ANY_OF, args, 3)?;
        if !matches!(args[0], Expression::FunctionRef(_)) {
            return Err(PolicyBuildError::InvalidFunctionArguments {
                function_id: ids::ANY_OF.to_string(),
                message: "first argument must be a function".to_string(),
            });
        }
        no_function_refs(ids::ANY_OF, &args[1..])
    }

    fn invoke(
        &self,
        ctx: &mut EvaluationContext<'_>,
        args: &[Expression],
    ) -> Result<Value, EvalError> {
        let Expression::FunctionRef(function) = &args[0] else {
            return Err(EvalError::Internal(
                "any-of: first argument is not a function".to_string(),
            ));
        };

        let value = args[1]
            .evaluate(ctx)
            .map_err(|e| in_function(ids::ANY_OF, e))?;
        let Value::Atomic(value) = value else {
            return Err(EvalError::Function {
                function_id: ids::ANY_OF.to_string(),
                message: "second argument must be an atomic value".to_string(),
            });
        };

        let bag = args[2]
            .evaluate(ctx)
            .map_err(|e| in_function(ids::ANY_OF, e))?;
        let bag = bag.expect_bag().map_err(|e| in_function(ids::ANY_OF, e))?.clone();

        // A determinate true wins over an earlier element error; an error
        // is reported only when no element matched.
        let mut first_error: Option<EvalError> = None;
        for element in &bag {
            let call_args = [
                Expression::Literal(value.clone()),
                Expression::Literal(element.clone()),
            ];
            match function.invoke(ctx, &call_args) {
                Ok(result) => match result.expect_boolean() {
                    Ok(true) => return Ok(boolean(true)),
                    Ok(false) => {}
                    Err(e) => {
                        if first_error.is_none() {
                            first_error = Some(in_function(ids::ANY_OF, e));
                        }
                    }
                },
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(in_function(ids::ANY_OF, e));
                    }
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(boolean(false)),
        }
    }
}

// ============================================================================
// Bag functions
// ============================================================================

#[derive(Debug)]
struct OneAndOnlyFn {
    id: &'static str,
    datatype: Datatype,
}

impl FunctionDef for OneAndOnlyFn {
    fn id(&self) -> &str {
        self.id
    }

    fn validate(&self, args: &[Expression]) -> Result<(), PolicyBuildError> {
        check_arity(self.id, args, 1)?;
        no_function_refs(self.id, args)
    }

    fn invoke(
        &self,
        ctx: &mut EvaluationContext<'_>,
        args: &[Expression],
    ) -> Result<Value, EvalError> {
        let value = args[0]
            .evaluate(ctx)
            .map_err(|e| in_function(self.id, e))?;
        let bag = value.expect_bag().map_err(|e| in_function(self.id, e))?;
        if bag.datatype() != self.datatype {
            return Err(EvalError::Function {
                function_id: self.id.to_string(),
                message: format!("expected a bag of {}, got {}", self.datatype, bag.datatype()),
            });
        }
        let single = bag.single().map_err(|e| in_function(self.id, e.into()))?;
        Ok(Value::Atomic(single.clone()))
    }
}

#[derive(Debug)]
struct IsInFn {
    id: &'static str,
    datatype: Datatype,
}

impl FunctionDef for IsInFn {
    fn id(&self) -> &str {
        self.id
    }

    fn validate(&self, args: &[Expression]) -> Result<(), PolicyBuildError> {
        check_arity(self.id, args, 2)?;
        no_function_refs(self.id, args)
    }

    fn invoke(
        &self,
        ctx: &mut EvaluationContext<'_>,
        args: &[Expression],
    ) -> Result<Value, EvalError> {
        let value = eval_atomic(ctx, &args[0], self.datatype, self.id)?;
        let bag_value = args[1]
            .evaluate(ctx)
            .map_err(|e| in_function(self.id, e))?;
        let bag = bag_value.expect_bag().map_err(|e| in_function(self.id, e))?;
        Ok(boolean(bag.contains(&value)))
    }
}

#[derive(Debug)]
struct StringStartsWithFn;

impl FunctionDef for StringStartsWithFn {
    fn id(&self) -> &str {
        ids::STRING_STARTS_WITH
    }

    fn validate(&self, args: &[Expression]) -> Result<(), PolicyBuildError> {
        check_arity(ids::STRING_STARTS_WITH, args, 2)?;
        no_function_refs(ids::STRING_STARTS_WITH, args)
    }

    fn invoke(
        &self,
        ctx: &mut EvaluationContext<'_>,
        args: &[Expression],
    ) -> Result<Value, EvalError> {
        let prefix = eval_atomic(ctx, &args[0], Datatype::String, ids::STRING_STARTS_WITH)?;
        let text = eval_atomic(ctx, &args[1], Datatype::String, ids::STRING_STARTS_WITH)?;
        let (prefix, text) = (
            prefix.as_string().map_err(EvalError::from)?,
            text.as_string().map_err(EvalError::from)?,
        );
        Ok(boolean(text.starts_with(prefix)))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use garnet_types::{Bag, DecisionRequest};

    fn ctx_fixture() -> DecisionRequest {
        DecisionRequest::builder().build()
    }

    fn lit(v: impl Into<AttributeValue>) -> Expression {
        Expression::Literal(v.into())
    }

    #[test]
    fn string_equal_compares_values() {
        let registry = FunctionRegistry::standard();
        let f = registry.get(ids::STRING_EQUAL).unwrap();
        let request = ctx_fixture();
        let mut ctx = EvaluationContext::new(&request);

        let result = f.invoke(&mut ctx, &[lit("a"), lit("a")]).unwrap();
        assert_eq!(result, boolean(true));
        let result = f.invoke(&mut ctx, &[lit("a"), lit("b")]).unwrap();
        assert_eq!(result, boolean(false));
    }

    #[test]
    fn equal_rejects_wrong_arity_at_validation() {
        let registry = FunctionRegistry::standard();
        let f = registry.get(ids::INTEGER_EQUAL).unwrap();
        assert!(f.validate(&[lit(1i64)]).is_err());
        assert!(f.validate(&[lit(1i64), lit(2i64)]).is_ok());
    }

    #[test]
    fn and_short_circuits_over_errors() {
        let registry = FunctionRegistry::standard();
        let and = registry.get(ids::AND).unwrap();
        let request = ctx_fixture();
        let mut ctx = EvaluationContext::new(&request);

        // a false argument decides the result even after an error
        let erroring = Expression::Apply(
            crate::expr::FunctionCall::new(
                registry.get(ids::STRING_ONE_AND_ONLY).unwrap(),
                vec![Expression::Literal(AttributeValue::from("not-a-bag"))],
            )
            .unwrap(),
        );
        let result = and
            .invoke(&mut ctx, &[erroring.clone(), lit(false)])
            .unwrap();
        assert_eq!(result, boolean(false));

        // with no deciding argument the error surfaces
        assert!(and.invoke(&mut ctx, &[erroring, lit(true)]).is_err());

        // zero arguments: neutral element
        assert_eq!(and.invoke(&mut ctx, &[]).unwrap(), boolean(true));
        let or = registry.get(ids::OR).unwrap();
        assert_eq!(or.invoke(&mut ctx, &[]).unwrap(), boolean(false));
    }

    #[test]
    fn any_of_matches_bag_elements() {
        let registry = FunctionRegistry::standard();
        let any_of = registry.get(ids::ANY_OF).unwrap();
        let equal = registry.get(ids::STRING_EQUAL).unwrap();
        let request = ctx_fixture();
        let mut ctx = EvaluationContext::new(&request);

        let bag = Bag::new(
            Datatype::String,
            vec![AttributeValue::from("alice"), AttributeValue::from("bob")],
        )
        .unwrap();
        let args = [
            Expression::FunctionRef(equal),
            lit("bob"),
            bag_literal(bag.clone()),
        ];
        assert_eq!(any_of.invoke(&mut ctx, &args).unwrap(), boolean(true));

        let args = [Expression::FunctionRef(registry.get(ids::STRING_EQUAL).unwrap()), lit("zed"), bag_literal(bag)];
        assert_eq!(any_of.invoke(&mut ctx, &args).unwrap(), boolean(false));
    }

    /// Test helper: an expression evaluating to a constant bag.
    fn bag_literal(bag: Bag) -> Expression {
        #[derive(Debug)]
        struct BagConst(Bag);
        impl FunctionDef for BagConst {
            fn id(&self) -> &str {
                "test:bag-const"
            }
            fn validate(&self, _: &[Expression]) -> Result<(), PolicyBuildError> {
                Ok(())
            }
            fn invoke(
                &self,
                _: &mut EvaluationContext<'_>,
                _: &[Expression],
            ) -> Result<Value, EvalError> {
                Ok(Value::Bag(self.0.clone()))
            }
        }
        Expression::Apply(
            crate::expr::FunctionCall::new(Arc::new(BagConst(bag)), Vec::new()).unwrap(),
        )
    }

    #[test]
    fn one_and_only_unwraps_singletons() {
        let registry = FunctionRegistry::standard();
        let f = registry.get(ids::INTEGER_ONE_AND_ONLY).unwrap();
        let request = ctx_fixture();
        let mut ctx = EvaluationContext::new(&request);

        let singleton = bag_literal(Bag::of(AttributeValue::from(7)));
        assert_eq!(
            f.invoke(&mut ctx, &[singleton]).unwrap(),
            Value::Atomic(AttributeValue::from(7))
        );

        let empty = bag_literal(Bag::empty(Datatype::Integer));
        assert!(f.invoke(&mut ctx, &[empty]).is_err());
    }

    #[test]
    fn is_in_checks_membership() {
        let registry = FunctionRegistry::standard();
        let f = registry.get(ids::STRING_IS_IN).unwrap();
        let request = ctx_fixture();
        let mut ctx = EvaluationContext::new(&request);

        let bag = bag_literal(
            Bag::new(
                Datatype::String,
                vec![AttributeValue::from("a"), AttributeValue::from("b")],
            )
            .unwrap(),
        );
        assert_eq!(
            f.invoke(&mut ctx, &[lit("a"), bag.clone()]).unwrap(),
            boolean(true)
        );
        assert_eq!(
            f.invoke(&mut ctx, &[lit("z"), bag]).unwrap(),
            boolean(false)
        );
    }

    #[test]
    fn starts_with_checks_prefix() {
        let registry = FunctionRegistry::standard();
        let f = registry.get(ids::STRING_STARTS_WITH).unwrap();
        let request = ctx_fixture();
        let mut ctx = EvaluationContext::new(&request);

        assert_eq!(
            f.invoke(&mut ctx, &[lit("pat"), lit("patient")]).unwrap(),
            boolean(true)
        );
        assert_eq!(
            f.invoke(&mut ctx, &[lit("doc"), lit("patient")]).unwrap(),
            boolean(false)
        );
    }
}
