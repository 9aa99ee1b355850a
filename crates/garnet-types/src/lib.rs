//! # garnet-types: Core types for `Garnet`
//!
//! This crate contains the shared data model used across the `Garnet`
//! policy decision engine:
//! - Typed attribute values and bags ([`AttributeValue`], [`Bag`], [`Datatype`])
//! - Authorization decisions ([`Decision`], [`ExtendedIndeterminate`], [`Status`])
//! - Decision results and PEP actions ([`DecisionResult`], [`PepAction`])
//! - Policy identity and versioning ([`PrimaryPolicyMetadata`], [`PolicyVersion`],
//!   [`VersionPattern`], [`PolicyVersionPatterns`])
//! - Policy reference metadata ([`PolicyRefsMetadata`])
//! - The read-only decision request ([`DecisionRequest`], [`Category`], [`AttributeId`])
//!
//! The evaluation engine itself lives in `garnet-pdp`; everything here is
//! plain data with no evaluation logic.

pub mod decision;
pub mod meta;
pub mod request;
pub mod value;

pub use decision::{
    AttributeAssignment, Decision, DecisionResult, Effect, ExtendedDecision,
    ExtendedIndeterminate, PepAction, Status, StatusCode,
};
pub use meta::{
    PolicyId, PolicyKind, PolicyRefsMetadata, PolicyVersion, PolicyVersionPatterns,
    PrimaryPolicyMetadata, VersionPattern,
};
pub use request::{AttributeId, AttributeKey, Category, DecisionRequest, DecisionRequestBuilder};
pub use value::{AttributeValue, Bag, Datatype, ValueError};
