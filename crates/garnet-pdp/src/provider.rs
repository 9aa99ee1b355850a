//! Policy providers: resolvers of policy references.
//!
//! The engine consumes the [`PolicyProvider`] contract for per-request
//! (dynamic) resolution and ships [`StaticPolicyProvider`], an in-memory
//! provider whose resolution is pure: the same (kind, id, constraints)
//! always yields the same policy for the process lifetime, which is what
//! lets the compiler expand references at construction.
//!
//! Providers also own the reference-chain rules: joining two chains must
//! fail on a repeated policy id (cycle) or when the joined chain exceeds
//! the configured maximum depth.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use garnet_types::{
    PolicyId, PolicyKind, PolicyVersion, PolicyVersionPatterns, PrimaryPolicyMetadata,
};

use crate::context::EvaluationContext;
use crate::error::{EvalError, PolicyBuildError};
use crate::policy::TopLevelPolicyEvaluator;

// ============================================================================
// Chain joining
// ============================================================================

/// A reference-chain violation, convertible to either error surface.
#[derive(Debug)]
pub(crate) enum ChainViolation {
    Cycle { id: PolicyId, chain: Vec<PolicyId> },
    Depth { depth: usize, max: usize },
}

impl ChainViolation {
    pub(crate) fn into_eval_error(self) -> EvalError {
        match self {
            Self::Cycle { id, chain } => EvalError::ReferenceCycle {
                id,
                chain: chain.iter().map(ToString::to_string).collect(),
            },
            Self::Depth { depth, max } => EvalError::RefDepthExceeded { depth, max },
        }
    }

    pub(crate) fn into_build_error(self) -> PolicyBuildError {
        match self {
            Self::Cycle { id, chain } => PolicyBuildError::ReferenceCycle {
                id,
                chain: chain.iter().map(ToString::to_string).collect(),
            },
            Self::Depth { depth, max } => PolicyBuildError::RefDepthExceeded { depth, max },
        }
    }
}

/// Joins two reference chains as head followed by tail.
///
/// Fails when an id of `tail` already appears in `head` (a cycle), or
/// when the joined chain's reference depth (ids minus one) exceeds
/// `max_depth`.
pub(crate) fn join_chains(
    head: &[PolicyId],
    tail: &[PolicyId],
    max_depth: Option<usize>,
) -> Result<Vec<PolicyId>, ChainViolation> {
    let mut joined = Vec::with_capacity(head.len() + tail.len());
    joined.extend_from_slice(head);
    for id in tail {
        if joined.contains(id) {
            return Err(ChainViolation::Cycle {
                id: id.clone(),
                chain: joined,
            });
        }
        joined.push(id.clone());
    }

    let depth = joined.len().saturating_sub(1);
    if let Some(max) = max_depth {
        if depth > max {
            return Err(ChainViolation::Depth { depth, max });
        }
    }
    Ok(joined)
}

// ============================================================================
// PolicyProvider
// ============================================================================

/// External resolver of policy references.
pub trait PolicyProvider: Send + Sync + fmt::Debug {
    /// Resolves a reference to the best-matching policy: the latest
    /// version satisfying all constraints. `ref_chain_if_policy_set` is
    /// the chain of policy-set ids from the root down to (and including)
    /// the requested target, for loop and depth control; `None` for
    /// Policy references.
    fn get(
        &self,
        kind: PolicyKind,
        id: &PolicyId,
        constraints: &PolicyVersionPatterns,
        ref_chain_if_policy_set: Option<&[PolicyId]>,
        ctx: &mut EvaluationContext<'_>,
    ) -> Result<TopLevelPolicyEvaluator, EvalError>;

    /// Joins two reference chains, enforcing the cycle and depth rules.
    fn join_ref_chains(
        &self,
        head: &[PolicyId],
        tail: &[PolicyId],
    ) -> Result<Vec<PolicyId>, EvalError>;
}

// ============================================================================
// StaticPolicyProvider
// ============================================================================

/// In-memory provider over a fixed set of compiled policies, keyed by
/// (kind, id) with all registered versions.
#[derive(Debug, Default)]
pub struct StaticPolicyProvider {
    policies: HashMap<(PolicyKind, PolicyId), BTreeMap<PolicyVersion, TopLevelPolicyEvaluator>>,
    max_ref_depth: Option<usize>,
}

impl StaticPolicyProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps the reference depth this provider allows when joining chains.
    pub fn with_max_ref_depth(mut self, max: usize) -> Self {
        self.max_ref_depth = Some(max);
        self
    }

    pub fn max_ref_depth(&self) -> Option<usize> {
        self.max_ref_depth
    }

    /// Registers a compiled policy. Duplicate (kind, id, version) is an
    /// error: no two policies visible to the engine may share identity.
    pub fn add(&mut self, policy: TopLevelPolicyEvaluator) -> Result<(), PolicyBuildError> {
        let meta = policy.metadata().clone();
        let versions = self
            .policies
            .entry((meta.kind, meta.id.clone()))
            .or_default();
        if versions.contains_key(&meta.version) {
            return Err(PolicyBuildError::DuplicateProviderPolicy(meta));
        }
        versions.insert(meta.version, policy);
        Ok(())
    }

    /// All registered policy identities, for diagnostics.
    pub fn policy_identities(&self) -> impl Iterator<Item = PrimaryPolicyMetadata> + '_ {
        self.policies
            .values()
            .flat_map(|versions| versions.values())
            .map(|p| p.metadata().clone())
    }

    /// Static resolution: the latest registered version satisfying the
    /// constraints. For PolicySet targets with a chain, the target's
    /// onward references are checked against the chain.
    pub fn get_static(
        &self,
        kind: PolicyKind,
        id: &PolicyId,
        constraints: &PolicyVersionPatterns,
        ref_chain_if_policy_set: Option<&[PolicyId]>,
    ) -> Result<TopLevelPolicyEvaluator, PolicyBuildError> {
        fn unresolved(
            kind: PolicyKind,
            id: &PolicyId,
            constraints: &PolicyVersionPatterns,
        ) -> PolicyBuildError {
            PolicyBuildError::UnresolvedReference {
                kind,
                id: id.clone(),
                constraints: constraints.clone(),
            }
        }

        let versions = self
            .policies
            .get(&(kind, id.clone()))
            .ok_or_else(|| unresolved(kind, id, constraints))?;
        let policy = versions
            .iter()
            .rev()
            .find(|(version, _)| constraints.matches(version))
            .map(|(_, policy)| policy.clone())
            .ok_or_else(|| unresolved(kind, id, constraints))?;

        if let Some(chain) = ref_chain_if_policy_set {
            // check against the target's onward references when they are
            // statically known; dynamically-resolved targets are checked
            // again at resolution time by the reference evaluator
            let tail = policy
                .known_refs_metadata()
                .flatten()
                .map_or(Vec::new(), |m| m.longest_ref_chain().to_vec());
            join_chains(chain, &tail, self.max_ref_depth)
                .map_err(ChainViolation::into_build_error)?;
        }

        Ok(policy)
    }

    /// Compile-time chain joining with the provider's depth limit.
    pub fn join_static(
        &self,
        head: &[PolicyId],
        tail: &[PolicyId],
    ) -> Result<Vec<PolicyId>, PolicyBuildError> {
        join_chains(head, tail, self.max_ref_depth).map_err(ChainViolation::into_build_error)
    }
}

impl PolicyProvider for StaticPolicyProvider {
    fn get(
        &self,
        kind: PolicyKind,
        id: &PolicyId,
        constraints: &PolicyVersionPatterns,
        ref_chain_if_policy_set: Option<&[PolicyId]>,
        _ctx: &mut EvaluationContext<'_>,
    ) -> Result<TopLevelPolicyEvaluator, EvalError> {
        self.get_static(kind, id, constraints, ref_chain_if_policy_set)
            .map_err(|e| EvalError::UnresolvedReference {
                reference: format!("{kind}IdReference[id={id}, {constraints}]"),
                message: e.to_string(),
            })
    }

    fn join_ref_chains(
        &self,
        head: &[PolicyId],
        tail: &[PolicyId],
    ) -> Result<Vec<PolicyId>, EvalError> {
        join_chains(head, tail, self.max_ref_depth).map_err(ChainViolation::into_eval_error)
    }
}

// ============================================================================
// Tests
// ============================================================================
