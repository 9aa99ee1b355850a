//! # garnet-pdp: Attribute-Based Access Control decision engine
//!
//! The core policy evaluator of an XACML 3.0 policy decision point.
//! Given a decision request (attribute bags organized by category) and a
//! compiled forest of policies, it produces Permit / Deny /
//! NotApplicable / Indeterminate together with fulfilled obligations and
//! advice.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │  Decision Request                                 │
//! │  (category, attribute-id, issuer) → bag of values │
//! └────────────────────┬─────────────────────────────┘
//!                      │  EvaluationContext (per request)
//!                      ▼
//! ┌──────────────────────────────────────────────────┐
//! │  Policy(Set) evaluator                            │
//! │  ├─ Target (AnyOf / AllOf / Match)                │
//! │  ├─ Local variable assignment                     │
//! │  ├─ Combining algorithm over children             │
//! │  │    rules │ policies │ policy references        │
//! │  └─ Obligation / advice expressions               │
//! └────────────────────┬─────────────────────────────┘
//!                      ▼
//! ┌──────────────────────────────────────────────────┐
//! │  DecisionResult                                   │
//! │  decision + status + PEP actions + applicable     │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! Compiled evaluators are immutable and safe to share across threads;
//! each request owns one mutable [`EvaluationContext`] carrying variable
//! values, per-request result memos, and cached dynamic-reference
//! resolutions. `evaluate` never fails: every evaluation-time error folds
//! into an Indeterminate decision carrying a machine-readable status.
//!
//! ## Example
//!
//! ```
//! use garnet_pdp::combining::{ids as alg, CombiningAlgRegistry};
//! use garnet_pdp::compile::compile_policy;
//! use garnet_pdp::expr::factory::ExpressionFactory;
//! use garnet_pdp::expr::functions::{ids as func, FunctionRegistry};
//! use garnet_pdp::model::{
//!     BagSourceNode, DesignatorNode, MatchNode, PolicyNode, RuleNode, TargetNode,
//! };
//! use garnet_types::{
//!     AttributeId, AttributeValue, Bag, Category, Datatype, Decision, DecisionRequest, Effect,
//! };
//!
//! let policy = PolicyNode::new("example", "1.0", alg::RULE_DENY_OVERRIDES)
//!     .with_target(TargetNode::single_match(MatchNode::new(
//!         func::STRING_EQUAL,
//!         "alice",
//!         BagSourceNode::Designator(DesignatorNode::new(
//!             Category::access_subject(),
//!             AttributeId::new(AttributeId::SUBJECT_ID),
//!             Datatype::String,
//!         )),
//!     )))
//!     .with_rule(RuleNode::new("permit-alice", Effect::Permit));
//!
//! let mut factory = ExpressionFactory::new(FunctionRegistry::standard());
//! let algorithms = CombiningAlgRegistry::standard();
//! let evaluator = compile_policy(&policy, &mut factory, &algorithms).unwrap();
//!
//! let request = DecisionRequest::builder()
//!     .attribute(
//!         Category::access_subject(),
//!         AttributeId::new(AttributeId::SUBJECT_ID),
//!         Bag::of(AttributeValue::from("alice")),
//!     )
//!     .build();
//! assert_eq!(evaluator.decide(&request).decision, Decision::Permit);
//! ```

pub mod combining;
pub mod compile;
pub mod content;
pub mod context;
pub mod error;
pub mod expr;
pub mod model;
pub mod pep;
pub mod policy;
pub mod provider;
pub mod reference;
pub mod rule;
pub mod target;

pub use combining::{ApplicablePolicies, Combinable, CombiningAlg, CombiningAlgRegistry};
pub use compile::{compile_policy, compile_policy_set, PolicyCompiler, ReferenceResolution};
pub use context::{CacheKey, EvaluationContext};
pub use error::{EvalError, PolicyBuildError};
pub use expr::factory::ExpressionFactory;
pub use expr::functions::{FunctionDef, FunctionRegistry};
pub use policy::{
    PolicyChildEvaluator, PolicyEvaluator, PolicySetEvaluator, TopLevelPolicyEvaluator,
};
pub use provider::{PolicyProvider, StaticPolicyProvider};
pub use reference::{DynamicPolicyRef, StaticPolicyRef};
pub use rule::RuleEvaluator;
pub use target::TargetEvaluator;
