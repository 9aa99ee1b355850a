//! The expression factory: compiles document-model expressions and owns
//! the construction-time variable namespace.
//!
//! Variable definitions are lexically scoped to their enclosing policy.
//! The policy compiler adds each definition as it is encountered and
//! removes the policy's definitions again when it leaves the policy's
//! construction scope, so sibling policies cannot see each other's
//! variables. Conflicting ids, locally or with an ancestor policy, are
//! construction-time errors.

use std::collections::HashMap;
use std::sync::Arc;

use crate::content::PathCompiler;
use crate::error::PolicyBuildError;
use crate::expr::functions::{FunctionDef, FunctionRegistry};
use crate::expr::{
    AttributeDesignator, AttributeSelector, Expression, FunctionCall, VariableId,
    VariableReference,
};
use crate::model::{DesignatorNode, ExpressionNode, SelectorNode};

#[derive(Debug)]
struct FactoryVariable {
    reference: Arc<VariableReference>,
    /// Longest chain of variable references starting at this variable
    /// (itself included); used for depth enforcement.
    ref_chain: Vec<VariableId>,
}

/// Compiles expressions against a function registry and the variables
/// currently in scope.
#[derive(Debug)]
pub struct ExpressionFactory {
    functions: FunctionRegistry,
    variables: HashMap<VariableId, FactoryVariable>,
    path_support: bool,
    max_variable_ref_depth: Option<usize>,
}

impl ExpressionFactory {
    pub fn new(functions: FunctionRegistry) -> Self {
        Self {
            functions,
            variables: HashMap::new(),
            path_support: false,
            max_variable_ref_depth: None,
        }
    }

    /// Enables attribute selectors (content-path expressions).
    pub fn with_content_paths(mut self) -> Self {
        self.path_support = true;
        self
    }

    /// Caps the depth of variable-reference chains.
    pub fn with_max_variable_ref_depth(mut self, max: usize) -> Self {
        self.max_variable_ref_depth = Some(max);
        self
    }

    pub fn is_path_enabled(&self) -> bool {
        self.path_support
    }

    /// Looks up a function by id.
    pub fn function(&self, id: &str) -> Option<Arc<dyn FunctionDef>> {
        self.functions.get(id)
    }

    /// A fresh path compiler over the variables currently in scope, or
    /// `None` when path support is disabled.
    ///
    /// Compilers are immutable; the policy compiler requests a new one
    /// after every variable definition so subsequent children see the
    /// grown variable set.
    pub fn path_compiler(&self) -> Option<PathCompiler> {
        self.path_support
            .then(|| PathCompiler::new(self.variables.keys().cloned()))
    }

    // ------------------------------------------------------------------
    // Variable namespace
    // ------------------------------------------------------------------

    /// Adds a variable definition to the namespace, compiling its
    /// expression against the variables already in scope.
    ///
    /// Returns the compiled reference. Fails on id conflicts (local or
    /// with an ancestor policy) and on reference chains exceeding the
    /// configured maximum.
    pub fn add_variable(
        &mut self,
        id: VariableId,
        node: &ExpressionNode,
        paths: Option<&PathCompiler>,
    ) -> Result<Arc<VariableReference>, PolicyBuildError> {
        if self.variables.contains_key(&id) {
            return Err(PolicyBuildError::DuplicateVariable(id));
        }

        let expression = self.compile(node, paths)?;

        let mut ref_chain = vec![id.clone()];
        ref_chain.extend(self.longest_subchain(&expression));
        if let Some(max) = self.max_variable_ref_depth {
            if ref_chain.len() > max {
                return Err(PolicyBuildError::VariableChainTooDeep {
                    id,
                    depth: ref_chain.len(),
                    max,
                });
            }
        }

        let reference = Arc::new(VariableReference::new(id.clone(), expression));
        self.variables.insert(
            id,
            FactoryVariable {
                reference: Arc::clone(&reference),
                ref_chain,
            },
        );
        Ok(reference)
    }

    /// Removes a variable on exit from its policy's construction scope.
    pub fn remove_variable(&mut self, id: &VariableId) {
        self.variables.remove(id);
    }

    /// The compiled reference for a variable currently in scope.
    pub fn variable_reference(&self, id: &VariableId) -> Option<Arc<VariableReference>> {
        self.variables.get(id).map(|v| Arc::clone(&v.reference))
    }

    /// Longest variable-reference chain among the variables an expression
    /// mentions.
    fn longest_subchain(&self, expression: &Expression) -> Vec<VariableId> {
        match expression {
            Expression::Variable(var) => self
                .variables
                .get(var.id())
                .map(|v| v.ref_chain.clone())
                .unwrap_or_default(),
            Expression::Apply(call) => call
                .args()
                .iter()
                .map(|arg| self.longest_subchain(arg))
                .max_by_key(Vec::len)
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // Compilation
    // ------------------------------------------------------------------

    /// Compiles a document-model expression.
    pub fn compile(
        &self,
        node: &ExpressionNode,
        paths: Option<&PathCompiler>,
    ) -> Result<Expression, PolicyBuildError> {
        match node {
            ExpressionNode::Literal(value) => Ok(Expression::Literal(value.clone())),
            ExpressionNode::Designator(d) => Ok(Expression::Designator(self.compile_designator(d))),
            ExpressionNode::Selector(s) => {
                Ok(Expression::Selector(self.compile_selector(s, paths)?))
            }
            ExpressionNode::VariableRef(id) => {
                let id = VariableId::new(id.as_str());
                self.variables
                    .get(&id)
                    .map(|v| Expression::Variable(Arc::clone(&v.reference)))
                    .ok_or(PolicyBuildError::UndefinedVariable(id))
            }
            ExpressionNode::Apply { function_id, args } => {
                let function = self
                    .function(function_id)
                    .ok_or_else(|| PolicyBuildError::UnknownFunction(function_id.clone()))?;
                let args = args
                    .iter()
                    .map(|arg| self.compile(arg, paths))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Expression::Apply(FunctionCall::new(function, args)?))
            }
            ExpressionNode::FunctionRef(function_id) => self
                .function(function_id)
                .map(Expression::FunctionRef)
                .ok_or_else(|| PolicyBuildError::UnknownFunction(function_id.clone())),
        }
    }

    pub(crate) fn compile_designator(&self, node: &DesignatorNode) -> AttributeDesignator {
        AttributeDesignator {
            category: node.category.clone(),
            attribute_id: node.attribute_id.clone(),
            issuer: node.issuer.clone(),
            datatype: node.datatype,
            must_be_present: node.must_be_present,
        }
    }

    pub(crate) fn compile_selector(
        &self,
        node: &SelectorNode,
        paths: Option<&PathCompiler>,
    ) -> Result<AttributeSelector, PolicyBuildError> {
        let compiler = paths.ok_or(PolicyBuildError::PathSupportDisabled)?;
        Ok(AttributeSelector {
            category: node.category.clone(),
            path: compiler.compile(&node.path)?,
            datatype: node.datatype,
            must_be_present: node.must_be_present,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
