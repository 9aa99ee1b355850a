//! Policy reference evaluators.
//!
//! A static reference is resolved at construction and delegates to a
//! fixed target. A dynamic reference holds a [`PolicyProvider`] and
//! resolves per request, caching the outcome (success or failure) in the
//! context so resolution is consistent within one request. PolicySet
//! reference chains are re-checked for cycles and depth even on cache
//! hits, because the same target can be reached through a different
//! chain.

use std::sync::Arc;

use garnet_types::{
    DecisionResult, ExtendedIndeterminate, PolicyId, PolicyKind, PolicyRefsMetadata,
    PolicyVersion, PolicyVersionPatterns, PrimaryPolicyMetadata,
};
use tracing::info;

use crate::context::{CacheKey, EvaluationContext};
use crate::error::{EvalError, PolicyBuildError};
use crate::policy::TopLevelPolicyEvaluator;
use crate::provider::PolicyProvider;

// ============================================================================
// Reference metadata
// ============================================================================

/// Reference metadata as seen through a reference to `policy`: the
/// target itself plus everything the target references, with the chain
/// extended by the target's id.
pub(crate) fn ref_extra_metadata(
    policy: &TopLevelPolicyEvaluator,
    target_refs: Option<&PolicyRefsMetadata>,
) -> PolicyRefsMetadata {
    let mut refs = PolicyRefsMetadata::default();
    let mut chain = vec![policy.metadata().id.clone()];
    if let Some(target_refs) = target_refs {
        for meta in target_refs.ref_policies() {
            refs.add_ref_policy(meta.clone());
        }
        chain.extend(target_refs.longest_ref_chain().iter().cloned());
    }
    refs.add_ref_policy(policy.metadata().clone());
    refs.update_longest_chain(&chain);
    refs
}

// ============================================================================
// StaticPolicyRef
// ============================================================================

/// A reference resolved once, at construction.
#[derive(Debug)]
pub struct StaticPolicyRef {
    kind: PolicyKind,
    id: PolicyId,
    constraints: PolicyVersionPatterns,
    referred: TopLevelPolicyEvaluator,
    refs_metadata: PolicyRefsMetadata,
}

impl StaticPolicyRef {
    /// Wraps a statically resolved target. The target's own reference
    /// metadata must be statically known.
    pub fn new(
        referred: TopLevelPolicyEvaluator,
        constraints: PolicyVersionPatterns,
    ) -> Result<Self, PolicyBuildError> {
        let Some(target_refs) = referred.known_refs_metadata() else {
            return Err(PolicyBuildError::DynamicTargetOfStaticRef {
                id: referred.metadata().id.clone(),
            });
        };
        let refs_metadata = ref_extra_metadata(&referred, target_refs);
        Ok(Self {
            kind: referred.metadata().kind,
            id: referred.metadata().id.clone(),
            constraints,
            referred,
            refs_metadata,
        })
    }

    pub fn policy_id(&self) -> &PolicyId {
        &self.id
    }

    pub fn policy_version(&self) -> &PolicyVersion {
        &self.referred.metadata().version
    }

    pub fn refs_metadata(&self) -> &PolicyRefsMetadata {
        &self.refs_metadata
    }

    pub fn evaluate(&self, ctx: &mut EvaluationContext<'_>, skip_target: bool) -> DecisionResult {
        self.referred.evaluate(ctx, skip_target)
    }

    pub fn is_applicable_by_target(
        &self,
        ctx: &mut EvaluationContext<'_>,
    ) -> Result<bool, EvalError> {
        self.referred.is_applicable_by_target(ctx).map_err(|e| {
            e.in_context(format!(
                "error checking whether the {} referenced as '{}' is applicable",
                self.kind, self.id
            ))
        })
    }
}

impl PartialEq for StaticPolicyRef {
    /// Reference equality is over (kind, id, version constraints).
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.id == other.id && self.constraints == other.constraints
    }
}

// ============================================================================
// DynamicPolicyRef
// ============================================================================

/// A successful per-request resolution: the target policy, its own
/// reference metadata, and the metadata seen through this reference.
#[derive(Debug, Clone)]
pub struct ResolvedRef {
    pub policy: TopLevelPolicyEvaluator,
    /// The target's own reference metadata (what the target references).
    target_refs: Option<PolicyRefsMetadata>,
    /// Metadata seen through this reference: target included, chain
    /// extended by the target's id.
    pub refs_metadata: PolicyRefsMetadata,
}

/// A reference resolved through a provider on each request.
#[derive(Debug)]
pub struct DynamicPolicyRef {
    kind: PolicyKind,
    id: PolicyId,
    constraints: PolicyVersionPatterns,
    provider: Arc<dyn PolicyProvider>,
    /// For PolicySet references: the chain of policy-set ids from the
    /// root down to (and including) this reference's target. Empty for
    /// Policy references, which cannot nest further references.
    chain_to_target: Vec<PolicyId>,
    cache_key: CacheKey,
}

impl DynamicPolicyRef {
    pub fn new(
        kind: PolicyKind,
        id: PolicyId,
        constraints: PolicyVersionPatterns,
        provider: Arc<dyn PolicyProvider>,
        chain_to_target: Vec<PolicyId>,
    ) -> Self {
        debug_assert!(
            kind == PolicyKind::PolicySet || chain_to_target.is_empty(),
            "policy references carry no reference chain"
        );
        Self {
            kind,
            id,
            constraints,
            provider,
            chain_to_target,
            cache_key: CacheKey::next(),
        }
    }

    pub fn policy_id(&self) -> &PolicyId {
        &self.id
    }

    fn describe(&self) -> String {
        format!("{}IdReference[id={}, {}]", self.kind, self.id, self.constraints)
    }

    /// Re-checks the joined reference chain. Runs on fresh resolutions
    /// and on cache hits alike: a cached target may be reached again via
    /// a chain that would now form a cycle or exceed the depth limit.
    fn check_chain(&self, resolved: &ResolvedRef) -> Result<(), EvalError> {
        if self.kind != PolicyKind::PolicySet {
            return Ok(());
        }
        // chain_to_target already ends with the target id; the tail is
        // what the target itself references onward
        let tail = resolved
            .target_refs
            .as_ref()
            .map_or(&[] as &[PolicyId], |m| m.longest_ref_chain());
        self.provider.join_ref_chains(&self.chain_to_target, tail)?;
        Ok(())
    }

    /// Resolves this reference in the context, consulting and updating
    /// the per-request cache. Failures are sticky within a request.
    fn resolve(&self, ctx: &mut EvaluationContext<'_>) -> Result<ResolvedRef, EvalError> {
        if let Some(cached) = ctx.cached_ref_resolution(self.cache_key) {
            let resolved = cached?;
            self.check_chain(&resolved)?;
            return Ok(resolved);
        }

        // re-entering the same unresolved reference means the target
        // reaches back to itself: a cycle the chain rules did not stop
        if !ctx.begin_ref_resolution(self.cache_key) {
            let error = EvalError::ReferenceCycle {
                id: self.id.clone(),
                chain: self
                    .chain_to_target
                    .iter()
                    .map(ToString::to_string)
                    .collect(),
            };
            ctx.store_ref_resolution(self.cache_key, Err(error.clone()));
            return Err(error);
        }

        let resolution = self.resolve_uncached(ctx);
        ctx.end_ref_resolution(self.cache_key);
        ctx.store_ref_resolution(self.cache_key, resolution.clone());
        resolution
    }

    fn resolve_uncached(&self, ctx: &mut EvaluationContext<'_>) -> Result<ResolvedRef, EvalError> {
        let chain = (self.kind == PolicyKind::PolicySet).then_some(self.chain_to_target.as_slice());
        let policy = self
            .provider
            .get(self.kind, &self.id, &self.constraints, chain, ctx)
            .map_err(|e| {
                e.in_context(format!(
                    "error resolving {} to the policy to evaluate",
                    self.describe()
                ))
            })?;

        let target_refs = policy.refs_metadata(ctx)?;
        let resolved = ResolvedRef {
            refs_metadata: ref_extra_metadata(&policy, target_refs.as_ref()),
            target_refs,
            policy,
        };
        self.check_chain(&resolved)?;
        Ok(resolved)
    }

    /// Evaluates the referenced policy. Resolution failures surface as
    /// Indeterminate{DP} with the resolution error's status.
    pub fn evaluate(&self, ctx: &mut EvaluationContext<'_>, skip_target: bool) -> DecisionResult {
        match self.resolve(ctx) {
            Ok(resolved) => resolved.policy.evaluate(ctx, skip_target),
            Err(e) => {
                info!(reference = %self.describe(), error = %e, "dynamic policy reference unresolved");
                DecisionResult::indeterminate(
                    ExtendedIndeterminate::DenyOrPermit,
                    e.status(),
                    Vec::new(),
                )
            }
        }
    }

    pub fn is_applicable_by_target(
        &self,
        ctx: &mut EvaluationContext<'_>,
    ) -> Result<bool, EvalError> {
        let resolved = self.resolve(ctx)?;
        resolved.policy.is_applicable_by_target(ctx)
    }

    /// The referenced policy's version, as resolved in this context.
    pub fn policy_version(
        &self,
        ctx: &mut EvaluationContext<'_>,
    ) -> Result<PolicyVersion, EvalError> {
        let resolved = self.resolve(ctx)?;
        Ok(resolved.policy.metadata().version.clone())
    }

    /// The reference metadata seen through this reference, as resolved
    /// in this context.
    pub fn refs_metadata(
        &self,
        ctx: &mut EvaluationContext<'_>,
    ) -> Result<PolicyRefsMetadata, EvalError> {
        let resolved = self.resolve(ctx)?;
        Ok(resolved.refs_metadata)
    }

    /// The identity of the policy this reference resolves to in `ctx`.
    pub fn resolved_metadata(
        &self,
        ctx: &mut EvaluationContext<'_>,
    ) -> Result<PrimaryPolicyMetadata, EvalError> {
        let resolved = self.resolve(ctx)?;
        Ok(resolved.policy.metadata().clone())
    }
}

impl PartialEq for DynamicPolicyRef {
    /// Reference equality is over (kind, id, version constraints).
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.id == other.id && self.constraints == other.constraints
    }
}
