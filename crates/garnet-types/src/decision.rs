//! Authorization decisions, statuses, and PEP actions.
//!
//! A [`Decision`] is the four-valued outcome of evaluating a rule, policy,
//! or policy set. An Indeterminate decision carries an
//! [`ExtendedIndeterminate`] bias recording which determinate decisions it
//! could have been, per XACML 3.0 §7.14. [`ExtendedDecision`] pairs a
//! decision with its status and is what combining algorithms exchange;
//! [`DecisionResult`] is the full policy-level result including fulfilled
//! PEP actions and the applicable-policy list.

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

use crate::meta::PrimaryPolicyMetadata;
use crate::request::{AttributeId, Category};
use crate::value::AttributeValue;

// ============================================================================
// Effect
// ============================================================================

/// The effect of a rule: the decision it renders when it applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Effect {
    Permit,
    Deny,
}

impl Effect {
    /// The decision corresponding to this effect.
    pub fn decision(self) -> Decision {
        match self {
            Self::Permit => Decision::Permit,
            Self::Deny => Decision::Deny,
        }
    }

    /// The extended-indeterminate bias corresponding to this effect.
    pub fn bias(self) -> ExtendedIndeterminate {
        match self {
            Self::Permit => ExtendedIndeterminate::Permit,
            Self::Deny => ExtendedIndeterminate::Deny,
        }
    }
}

impl Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Permit => write!(f, "Permit"),
            Self::Deny => write!(f, "Deny"),
        }
    }
}

// ============================================================================
// Decision
// ============================================================================

/// Which determinate decisions an Indeterminate outcome could have been.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExtendedIndeterminate {
    /// Could only have been Permit (Indeterminate{P}).
    Permit,
    /// Could only have been Deny (Indeterminate{D}).
    Deny,
    /// Could have been either (Indeterminate{DP}).
    DenyOrPermit,
}

impl Display for ExtendedIndeterminate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Permit => write!(f, "P"),
            Self::Deny => write!(f, "D"),
            Self::DenyOrPermit => write!(f, "DP"),
        }
    }
}

/// The outcome of evaluating a rule, policy, or policy set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Decision {
    Permit,
    Deny,
    NotApplicable,
    Indeterminate(ExtendedIndeterminate),
}

impl Decision {
    pub fn is_indeterminate(self) -> bool {
        matches!(self, Self::Indeterminate(_))
    }

    /// Returns the extended-indeterminate bias, if this is Indeterminate.
    pub fn extended_indeterminate(self) -> Option<ExtendedIndeterminate> {
        match self {
            Self::Indeterminate(ext) => Some(ext),
            _ => None,
        }
    }
}

impl Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Permit => write!(f, "Permit"),
            Self::Deny => write!(f, "Deny"),
            Self::NotApplicable => write!(f, "NotApplicable"),
            Self::Indeterminate(ext) => write!(f, "Indeterminate{{{ext}}}"),
        }
    }
}

// ============================================================================
// Status
// ============================================================================

/// Machine-readable status codes attached to non-success decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatusCode {
    /// urn:oasis:names:tc:xacml:1.0:status:processing-error
    ProcessingError,
    /// urn:oasis:names:tc:xacml:1.0:status:syntax-error
    SyntaxError,
    /// urn:oasis:names:tc:xacml:1.0:status:missing-attribute
    MissingAttribute,
}

impl Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ProcessingError => "processing-error",
            Self::SyntaxError => "syntax-error",
            Self::MissingAttribute => "missing-attribute",
        };
        write!(f, "{name}")
    }
}

/// A status: a machine-readable code plus an optional diagnostic message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: StatusCode,
    pub message: Option<String>,
}

impl Status {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
        }
    }

    /// A generic processing-error status, used when an extension produced
    /// an Indeterminate without a root cause.
    pub fn processing_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::ProcessingError, message)
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(msg) => write!(f, "{}: {msg}", self.code),
            None => write!(f, "{}", self.code),
        }
    }
}

// ============================================================================
// ExtendedDecision
// ============================================================================

/// A decision plus its status, as exchanged between a combining algorithm
/// and its caller. PEP actions and applicable policies travel separately
/// in the caller-supplied collectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtendedDecision {
    pub decision: Decision,
    pub status: Option<Status>,
}

impl ExtendedDecision {
    pub const PERMIT: Self = Self {
        decision: Decision::Permit,
        status: None,
    };
    pub const DENY: Self = Self {
        decision: Decision::Deny,
        status: None,
    };
    pub const NOT_APPLICABLE: Self = Self {
        decision: Decision::NotApplicable,
        status: None,
    };

    pub fn indeterminate(ext: ExtendedIndeterminate, status: Status) -> Self {
        Self {
            decision: Decision::Indeterminate(ext),
            status: Some(status),
        }
    }

    pub fn not_applicable_with(status: Option<Status>) -> Self {
        Self {
            decision: Decision::NotApplicable,
            status,
        }
    }
}

impl Display for ExtendedDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.decision)
    }
}

// ============================================================================
// PEP actions
// ============================================================================

/// One attribute assignment inside a fulfilled obligation or advice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeAssignment {
    pub attribute_id: AttributeId,
    pub category: Option<Category>,
    pub value: AttributeValue,
}

/// A fulfilled obligation (`is_mandatory`) or advice, returned to the PEP
/// alongside a Permit or Deny decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PepAction {
    pub id: String,
    /// Obligations are mandatory for the PEP; advice is informational.
    pub is_mandatory: bool,
    /// Assignments in declaration order.
    pub assignments: Vec<AttributeAssignment>,
}

// ============================================================================
// DecisionResult
// ============================================================================

/// The full result of evaluating a policy, policy set, or rule.
///
/// `pep_actions` is non-empty only for determinate Permit/Deny decisions.
/// `applicable_policies` lists the policies that contributed a decision
/// other than NotApplicable, children before parents in document order; it
/// is populated only when the request asked for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionResult {
    pub decision: Decision,
    pub status: Option<Status>,
    pub pep_actions: Vec<PepAction>,
    pub applicable_policies: Vec<PrimaryPolicyMetadata>,
}

impl DecisionResult {
    /// The constant NotApplicable result with no status.
    pub fn not_applicable() -> Self {
        Self {
            decision: Decision::NotApplicable,
            status: None,
            pep_actions: Vec::new(),
            applicable_policies: Vec::new(),
        }
    }

    pub fn not_applicable_with(status: Option<Status>) -> Self {
        Self {
            decision: Decision::NotApplicable,
            status,
            pep_actions: Vec::new(),
            applicable_policies: Vec::new(),
        }
    }

    pub fn indeterminate(
        ext: ExtendedIndeterminate,
        status: Status,
        applicable_policies: Vec<PrimaryPolicyMetadata>,
    ) -> Self {
        Self {
            decision: Decision::Indeterminate(ext),
            status: Some(status),
            pep_actions: Vec::new(),
            applicable_policies,
        }
    }

    /// Builds a determinate Permit/Deny result from a combining-algorithm
    /// outcome plus the accumulated PEP actions and applicable policies.
    pub fn determinate(
        extended: ExtendedDecision,
        pep_actions: Vec<PepAction>,
        applicable_policies: Vec<PrimaryPolicyMetadata>,
    ) -> Self {
        debug_assert!(matches!(
            extended.decision,
            Decision::Permit | Decision::Deny
        ));
        Self {
            decision: extended.decision,
            status: extended.status,
            pep_actions,
            applicable_policies,
        }
    }

    /// The decision and status without the PEP-action payload.
    pub fn extended(&self) -> ExtendedDecision {
        ExtendedDecision {
            decision: self.decision,
            status: self.status.clone(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
