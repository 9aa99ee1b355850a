//! Target applicability predicates: Match, AllOf, AnyOf, Target.
//!
//! A Match is compiled to its functional equivalent
//! `any-of(match-function, literal, bag-expression)` and evaluates to a
//! boolean or fails Indeterminate. AllOf conjoins matches, AnyOf disjoins
//! AllOfs, and a Target conjoins AnyOfs; an empty Target always matches.

use std::sync::Arc;

use tracing::debug;

use crate::content::PathCompiler;
use crate::context::EvaluationContext;
use crate::error::{EvalError, PolicyBuildError};
use crate::expr::factory::ExpressionFactory;
use crate::expr::functions::ids;
use crate::expr::{Expression, FunctionCall};
use crate::model::{AllOfNode, AnyOfNode, BagSourceNode, MatchNode, TargetNode};

// ============================================================================
// Match
// ============================================================================

/// A compiled Match, held as the equivalent `any-of` call.
#[derive(Debug)]
pub struct MatchEvaluator {
    call: FunctionCall,
}

impl MatchEvaluator {
    pub fn new(
        node: &MatchNode,
        factory: &ExpressionFactory,
        paths: Option<&PathCompiler>,
    ) -> Result<Self, PolicyBuildError> {
        let match_function = factory
            .function(&node.match_function_id)
            .ok_or_else(|| PolicyBuildError::UnknownFunction(node.match_function_id.clone()))?;

        let bag_expression = match &node.source {
            BagSourceNode::Designator(d) => Expression::Designator(factory.compile_designator(d)),
            BagSourceNode::Selector(s) => {
                Expression::Selector(factory.compile_selector(s, paths)?)
            }
        };

        let any_of = factory
            .function(ids::ANY_OF)
            .ok_or_else(|| PolicyBuildError::UnknownFunction(ids::ANY_OF.to_string()))?;

        // Match(f, literal, bag) = any-of(f, literal, bag); building the
        // call validates the inputs against the any-of signature.
        let call = FunctionCall::new(
            any_of,
            vec![
                Expression::FunctionRef(Arc::clone(&match_function)),
                Expression::Literal(node.literal.clone()),
                bag_expression,
            ],
        )
        .map_err(|e| e.in_context("invalid match (validated as the equivalent 'any-of' call)"))?;

        Ok(Self { call })
    }

    /// Whether this match holds in the given context.
    pub fn matches(&self, ctx: &mut EvaluationContext<'_>) -> Result<bool, EvalError> {
        let result = self
            .call
            .evaluate(ctx)
            .map_err(|e| e.in_context("error evaluating match (as equivalent 'any-of')"))?;
        result.expect_boolean()
    }
}

// ============================================================================
// AllOf
// ============================================================================

/// Conjunction of matches. Must contain at least one.
///
/// All true is a match; any false is a no-match (short-circuit); no false
/// with at least one Indeterminate is Indeterminate, reported with the
/// index of the last indeterminate match for diagnostics.
#[derive(Debug)]
pub struct AllOfEvaluator {
    matches: Vec<MatchEvaluator>,
}

impl AllOfEvaluator {
    pub fn new(
        node: &AllOfNode,
        factory: &ExpressionFactory,
        paths: Option<&PathCompiler>,
    ) -> Result<Self, PolicyBuildError> {
        if node.matches.is_empty() {
            return Err(PolicyBuildError::EmptyAllOf);
        }
        let matches = node
            .matches
            .iter()
            .enumerate()
            .map(|(index, m)| {
                MatchEvaluator::new(m, factory, paths)
                    .map_err(|e| e.in_context(format!("invalid <AllOf> match #{index}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { matches })
    }

    pub fn matches(&self, ctx: &mut EvaluationContext<'_>) -> Result<bool, EvalError> {
        let mut last_indeterminate: Option<(usize, EvalError)> = None;

        for (index, m) in self.matches.iter().enumerate() {
            match m.matches(ctx) {
                Ok(false) => return Ok(false),
                Ok(true) => {
                    debug!(match_index = index, "AllOf match -> true");
                }
                Err(e) => {
                    debug!(match_index = index, "AllOf match -> Indeterminate");
                    last_indeterminate = Some((index, e));
                }
            }
        }

        match last_indeterminate {
            None => Ok(true),
            Some((index, e)) => {
                Err(e.in_context(format!("error evaluating <AllOf> match #{index}")))
            }
        }
    }
}

// ============================================================================
// AnyOf
// ============================================================================

/// Disjunction of AllOfs, dual to [`AllOfEvaluator`]: any true is a match
/// (short-circuit); all false is a no-match; otherwise Indeterminate.
#[derive(Debug)]
pub struct AnyOfEvaluator {
    all_ofs: Vec<AllOfEvaluator>,
}

impl AnyOfEvaluator {
    pub fn new(
        node: &AnyOfNode,
        factory: &ExpressionFactory,
        paths: Option<&PathCompiler>,
    ) -> Result<Self, PolicyBuildError> {
        if node.all_ofs.is_empty() {
            return Err(PolicyBuildError::EmptyAnyOf);
        }
        let all_ofs = node
            .all_ofs
            .iter()
            .enumerate()
            .map(|(index, a)| {
                AllOfEvaluator::new(a, factory, paths)
                    .map_err(|e| e.in_context(format!("invalid <AnyOf> alternative #{index}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { all_ofs })
    }

    pub fn matches(&self, ctx: &mut EvaluationContext<'_>) -> Result<bool, EvalError> {
        let mut last_indeterminate: Option<(usize, EvalError)> = None;

        for (index, all_of) in self.all_ofs.iter().enumerate() {
            match all_of.matches(ctx) {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(e) => {
                    debug!(all_of_index = index, "AnyOf alternative -> Indeterminate");
                    last_indeterminate = Some((index, e));
                }
            }
        }

        match last_indeterminate {
            None => Ok(false),
            Some((index, e)) => {
                Err(e.in_context(format!("error evaluating <AnyOf> alternative #{index}")))
            }
        }
    }
}

// ============================================================================
// Target
// ============================================================================

/// A target: conjunction of AnyOfs. A missing or empty target always
/// matches.
#[derive(Debug)]
pub struct TargetEvaluator {
    any_ofs: Vec<AnyOfEvaluator>,
}

impl TargetEvaluator {
    /// Compiles a target; `None` and an empty node both produce the
    /// always-matching target.
    pub fn new(
        node: Option<&TargetNode>,
        factory: &ExpressionFactory,
        paths: Option<&PathCompiler>,
    ) -> Result<Self, PolicyBuildError> {
        let any_ofs = match node {
            None => Vec::new(),
            Some(target) => target
                .any_ofs
                .iter()
                .enumerate()
                .map(|(index, a)| {
                    AnyOfEvaluator::new(a, factory, paths)
                        .map_err(|e| e.in_context(format!("invalid target <AnyOf> #{index}")))
                })
                .collect::<Result<Vec<_>, _>>()?,
        };
        Ok(Self { any_ofs })
    }

    /// The always-matching target.
    pub fn match_all() -> Self {
        Self {
            any_ofs: Vec::new(),
        }
    }

    pub fn matches(&self, ctx: &mut EvaluationContext<'_>) -> Result<bool, EvalError> {
        let mut last_indeterminate: Option<EvalError> = None;

        for any_of in &self.any_ofs {
            match any_of.matches(ctx) {
                Ok(true) => {}
                Ok(false) => return Ok(false),
                Err(e) => last_indeterminate = Some(e),
            }
        }

        match last_indeterminate {
            None => Ok(true),
            Some(e) => Err(e.in_context("error evaluating target")),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
