//! Error taxonomy of the evaluation engine.
//!
//! Two surfaces, per the propagation policy:
//! - [`PolicyBuildError`]: fatal construction-time failures. A malformed
//!   document is rejected; nothing is evaluated.
//! - [`EvalError`]: recoverable evaluation-time failures. These never
//!   escape `evaluate`; they are folded into Indeterminate decisions
//!   carrying the matching [`Status`].

use garnet_types::{
    AttributeId, Category, PolicyId, PolicyKind, PolicyVersionPatterns, PrimaryPolicyMetadata,
    Status, StatusCode, ValueError,
};
use garnet_types::meta::VersionError;
use thiserror::Error;

use crate::expr::VariableId;

// ============================================================================
// Construction-time errors
// ============================================================================

/// Fatal errors raised while compiling policy documents into evaluators.
#[derive(Debug, Error)]
pub enum PolicyBuildError {
    #[error("empty <AllOf>: must contain at least one match")]
    EmptyAllOf,

    #[error("empty <AnyOf>: must contain at least one <AllOf>")]
    EmptyAnyOf,

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("function '{function_id}': {message}")]
    InvalidFunctionArguments { function_id: String, message: String },

    #[error("unknown {kind} combining algorithm '{algorithm_id}'")]
    UnknownCombiningAlgorithm {
        algorithm_id: String,
        /// "rule" or "policy", matching the child kind requested.
        kind: &'static str,
    },

    #[error("{policy}: duplicate rule id '{rule_id}'")]
    DuplicateRuleId {
        policy: PrimaryPolicyMetadata,
        rule_id: String,
    },

    #[error("{policy}: duplicate child policy id '{child_id}'")]
    DuplicateChildPolicy {
        policy: PrimaryPolicyMetadata,
        child_id: PolicyId,
    },

    #[error("{policy}: policy {duplicate} enclosed more than once")]
    DuplicateEnclosedPolicy {
        policy: PrimaryPolicyMetadata,
        duplicate: PrimaryPolicyMetadata,
    },

    #[error("{policy}: combiner parameters reference undefined child '{child_id}' (no such element defined before them)")]
    UndefinedCombinedChild {
        policy: PrimaryPolicyMetadata,
        child_id: String,
    },

    #[error("duplicate variable id '{0}' (conflicts locally or with an ancestor policy)")]
    DuplicateVariable(VariableId),

    #[error("undefined variable '{0}'")]
    UndefinedVariable(VariableId),

    #[error("variable '{id}': reference chain depth {depth} exceeds maximum {max}")]
    VariableChainTooDeep {
        id: VariableId,
        depth: usize,
        max: usize,
    },

    #[error("content path '{path}': {message}")]
    InvalidPath { path: String, message: String },

    #[error("attribute selector used but content-path support is disabled")]
    PathSupportDisabled,

    #[error("no {kind} matching reference id '{id}' ({constraints})")]
    UnresolvedReference {
        kind: PolicyKind,
        id: PolicyId,
        constraints: PolicyVersionPatterns,
    },

    #[error("policy reference cycle: '{id}' already appears in chain {chain:?}")]
    ReferenceCycle { id: PolicyId, chain: Vec<String> },

    #[error("policy reference chain depth {depth} exceeds maximum {max}")]
    RefDepthExceeded { depth: usize, max: usize },

    #[error("{policy}: policy references present but no policy provider configured")]
    NoPolicyProvider { policy: PrimaryPolicyMetadata },

    #[error("reference to '{id}' resolved to a dynamically-provided policy set; static references require statically resolvable targets")]
    DynamicTargetOfStaticRef { id: PolicyId },

    #[error("duplicate policy {0} registered in provider")]
    DuplicateProviderPolicy(PrimaryPolicyMetadata),

    #[error("policy provider error: {0}")]
    ProviderFailure(String),

    #[error(transparent)]
    Version(#[from] VersionError),

    #[error(transparent)]
    Value(#[from] ValueError),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<PolicyBuildError>,
    },
}

impl PolicyBuildError {
    /// Wraps this error with positional context, e.g. which child element
    /// of a policy was being compiled.
    pub fn in_context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }
}

// ============================================================================
// Evaluation-time errors
// ============================================================================

/// Recoverable evaluation failures, each mapping onto an XACML status
/// code. `Clone` because dynamic reference resolution caches failures
/// per request (sticky Indeterminate).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("missing attribute '{attribute_id}' in category '{category}'")]
    MissingAttribute {
        category: Category,
        attribute_id: AttributeId,
    },

    #[error("missing content for category '{category}'")]
    MissingContent { category: Category },

    #[error(transparent)]
    Value(#[from] ValueError),

    #[error("function '{function_id}': {message}")]
    Function {
        function_id: String,
        message: String,
    },

    #[error("undefined variable '{0}' in this evaluation context")]
    UndefinedVariable(VariableId),

    #[error("content path '{path}': {message}")]
    Path { path: String, message: String },

    #[error("could not resolve {reference}: {message}")]
    UnresolvedReference { reference: String, message: String },

    #[error("policy reference cycle: '{id}' already appears in chain {chain:?}")]
    ReferenceCycle { id: PolicyId, chain: Vec<String> },

    #[error("policy reference chain depth {depth} exceeds maximum {max}")]
    RefDepthExceeded { depth: usize, max: usize },

    #[error("internal error: {0}")]
    Internal(String),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<EvalError>,
    },
}

impl EvalError {
    /// Wraps this error with evaluation context (which element failed).
    pub fn in_context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The XACML status code this error surfaces as.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingAttribute { .. } | Self::MissingContent { .. } => {
                StatusCode::MissingAttribute
            }
            Self::Path { .. } => StatusCode::SyntaxError,
            Self::Context { source, .. } => source.status_code(),
            _ => StatusCode::ProcessingError,
        }
    }

    /// Converts this error into a decision status.
    pub fn status(&self) -> Status {
        Status::new(self.status_code(), self.to_string())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_code_follows_error_kind() {
        let missing = EvalError::MissingAttribute {
            category: Category::access_subject(),
            attribute_id: AttributeId::new("subject-id"),
        };
        assert_eq!(missing.status_code(), StatusCode::MissingAttribute);

        let cycle = EvalError::ReferenceCycle {
            id: PolicyId::from("s1"),
            chain: vec!["root".to_string(), "s1".to_string()],
        };
        assert_eq!(cycle.status_code(), StatusCode::ProcessingError);
    }

    #[test]
    fn context_wrapping_preserves_status_code() {
        let inner = EvalError::MissingAttribute {
            category: Category::resource(),
            attribute_id: AttributeId::new("owner"),
        };
        let wrapped = inner.in_context("error evaluating <AllOf> match #1");
        assert_eq!(wrapped.status_code(), StatusCode::MissingAttribute);
        assert!(wrapped.to_string().contains("match #1"));
    }
}
