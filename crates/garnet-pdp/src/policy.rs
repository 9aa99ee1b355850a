//! Policy and PolicySet evaluators.
//!
//! [`TopLevelPolicyElement`] is the generic evaluator over combinable
//! children: rules for a Policy, policies/policy sets/references for a
//! PolicySet. Its evaluation protocol implements the XACML 3.0 §7.12/7.13
//! semantics with the §7.14 extended-indeterminate combination for
//! Indeterminate targets, memoizes results per request in a two-slot
//! cache, and scopes local variable assignments to the policy's
//! evaluation.

use std::sync::Arc;

use garnet_types::{
    Decision, DecisionResult, Effect, ExtendedIndeterminate, PolicyRefsMetadata,
    PrimaryPolicyMetadata, Status,
};
use tracing::{debug, error, info};

use crate::combining::{ApplicablePolicies, Combinable, CombinerParametersAssignment, CombiningAlg};
use crate::context::{CacheKey, EvaluationContext};
use crate::error::{EvalError, PolicyBuildError};
use crate::expr::VariableReference;
use crate::pep::PepActionExpressions;
use crate::reference::{DynamicPolicyRef, StaticPolicyRef};
use crate::rule::RuleEvaluator;
use crate::target::TargetEvaluator;

// ============================================================================
// Refs metadata source
// ============================================================================

/// Where a policy element's reference metadata comes from.
#[derive(Debug)]
pub enum RefsMetadataSource {
    /// Policies have no nested references.
    None,
    /// Statically resolved at construction (static provider, or a policy
    /// set without references).
    Static(Option<PolicyRefsMetadata>),
    /// Computed per request from the children and cached in the context
    /// (policy set compiled against a dynamic provider).
    Dynamic { cache_key: CacheKey },
}

impl RefsMetadataSource {
    pub fn dynamic() -> Self {
        Self::Dynamic {
            cache_key: CacheKey::next(),
        }
    }
}

// ============================================================================
// TopLevelPolicyElement
// ============================================================================

/// Generic Policy(Set) evaluator; `C` is the combined child kind.
pub struct TopLevelPolicyElement<C: Combinable> {
    metadata: PrimaryPolicyMetadata,
    target: TargetEvaluator,
    /// Local variable definitions in declaration order, assigned eagerly
    /// before the combining algorithm runs.
    local_variables: Vec<Arc<VariableReference>>,
    algorithm: Arc<dyn CombiningAlg<C>>,
    children: Vec<C>,
    /// Combiner parameters bound to the algorithm, in declaration order.
    combiner_parameters: Vec<CombinerParametersAssignment>,
    pep: PepActionExpressions,
    refs_source: RefsMetadataSource,
    /// This element plus every policy textually enclosed beneath it;
    /// unique by (kind, id, version).
    enclosed_policies: Vec<PrimaryPolicyMetadata>,
    cache_key: CacheKey,
}

/// Evaluator of an XACML Policy (combines rules).
pub type PolicyEvaluator = TopLevelPolicyElement<RuleEvaluator>;

/// Evaluator of an XACML PolicySet (combines policies and references).
pub type PolicySetEvaluator = TopLevelPolicyElement<PolicyChildEvaluator>;

impl<C: Combinable> TopLevelPolicyElement<C> {
    /// Assembles an evaluator, checking combiner parameters and the
    /// uniqueness of enclosed policy identities.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        metadata: PrimaryPolicyMetadata,
        target: TargetEvaluator,
        local_variables: Vec<Arc<VariableReference>>,
        algorithm: Arc<dyn CombiningAlg<C>>,
        children: Vec<C>,
        combiner_parameters: Vec<CombinerParametersAssignment>,
        pep: PepActionExpressions,
        refs_source: RefsMetadataSource,
    ) -> Result<Self, PolicyBuildError> {
        algorithm.check_parameters(&combiner_parameters)?;

        let mut enclosed_policies = vec![metadata.clone()];
        for child in &children {
            for enclosed in child.enclosed_policies() {
                if enclosed_policies.contains(enclosed) {
                    return Err(PolicyBuildError::DuplicateEnclosedPolicy {
                        policy: metadata,
                        duplicate: enclosed.clone(),
                    });
                }
                enclosed_policies.push(enclosed.clone());
            }
        }

        Ok(Self {
            metadata,
            target,
            local_variables,
            algorithm,
            children,
            combiner_parameters,
            pep,
            refs_source,
            enclosed_policies,
            cache_key: CacheKey::next(),
        })
    }

    pub fn metadata(&self) -> &PrimaryPolicyMetadata {
        &self.metadata
    }

    /// This element and every policy enclosed beneath it.
    pub fn enclosed_policies(&self) -> &[PrimaryPolicyMetadata] {
        &self.enclosed_policies
    }

    /// The statically known reference metadata: `Some(None)` for no
    /// references, `None` when only resolvable per request.
    pub fn known_refs_metadata(&self) -> Option<Option<&PolicyRefsMetadata>> {
        match &self.refs_source {
            RefsMetadataSource::None => Some(None),
            RefsMetadataSource::Static(meta) => Some(meta.as_ref()),
            RefsMetadataSource::Dynamic { .. } => None,
        }
    }

    /// Reference metadata in a request context; computed from the
    /// children and memoized for dynamic policy sets.
    pub fn refs_metadata(
        &self,
        ctx: &mut EvaluationContext<'_>,
    ) -> Result<Option<PolicyRefsMetadata>, EvalError> {
        let cache_key = match &self.refs_source {
            RefsMetadataSource::None => return Ok(None),
            RefsMetadataSource::Static(meta) => return Ok(meta.clone()),
            RefsMetadataSource::Dynamic { cache_key } => *cache_key,
        };

        if let Some(cached) = ctx.cached_refs_metadata(cache_key) {
            return Ok(cached);
        }

        let mut merged = PolicyRefsMetadata::default();
        for child in &self.children {
            if let Some(child_meta) = child.refs_metadata(ctx)? {
                merged.absorb(&child_meta);
            }
        }
        let metadata = if merged.is_empty() { None } else { Some(merged) };
        ctx.store_refs_metadata(cache_key, metadata.clone());
        Ok(metadata)
    }

    /// The target applicability test alone, for only-one-applicable.
    pub fn is_applicable_by_target(
        &self,
        ctx: &mut EvaluationContext<'_>,
    ) -> Result<bool, EvalError> {
        self.target.matches(ctx)
    }

    /// Evaluates this policy element. `skip_target` is used by the
    /// only-one-applicable algorithm after its separate applicability
    /// test. Never fails; failures fold into Indeterminate results.
    pub fn evaluate(&self, ctx: &mut EvaluationContext<'_>, skip_target: bool) -> DecisionResult {
        if let Some(cached) = ctx.cached_policy_result(self.cache_key, skip_target) {
            debug!(policy = %self.metadata, skip_target, "returning per-request cached result");
            return cached;
        }

        let result = self.evaluate_fresh(ctx, skip_target);

        // local variables leave the context on every exit path
        for variable in &self.local_variables {
            ctx.remove_variable(variable.id());
        }

        ctx.store_policy_result(self.cache_key, skip_target, result.clone());
        result
    }

    /// Assigns local variables eagerly, in declaration order, so child
    /// evaluation (and extensions reading the context) see them.
    fn assign_variables(&self, ctx: &mut EvaluationContext<'_>) -> Result<(), EvalError> {
        for variable in &self.local_variables {
            let value = variable.evaluate(ctx)?;
            ctx.set_variable_if_absent(variable.id().clone(), value);
        }
        Ok(())
    }

    fn evaluate_fresh(&self, ctx: &mut EvaluationContext<'_>, skip_target: bool) -> DecisionResult {
        // 1. Target, unless the caller already tested it.
        let mut target_error: Option<EvalError> = None;
        if !skip_target {
            match self.target.matches(ctx) {
                Ok(false) => {
                    debug!(policy = %self.metadata, "target -> no-match");
                    return DecisionResult::not_applicable();
                }
                Ok(true) => {
                    debug!(policy = %self.metadata, "target -> match");
                }
                Err(e) => {
                    // remembered; the combining algorithm still runs and
                    // its outcome picks the extended-indeterminate bias
                    info!(policy = %self.metadata, error = %e, "target -> Indeterminate");
                    target_error = Some(e);
                }
            }
        }

        // 2. Local variables, before the combining algorithm.
        if let Err(e) = self.assign_variables(ctx) {
            error!(policy = %self.metadata, error = %e, "failed to evaluate a local variable");
            return DecisionResult::indeterminate(
                ExtendedIndeterminate::DenyOrPermit,
                e.status(),
                Vec::new(),
            );
        }

        // 3. Combining algorithm over the children.
        let mut pep_actions = Vec::new();
        let mut applicable = ApplicablePolicies::new(ctx.applicable_policies_requested());
        let combined = self.algorithm.evaluate(
            ctx,
            &self.children,
            &self.combiner_parameters,
            &mut pep_actions,
            &mut applicable,
        );
        debug!(policy = %self.metadata, algorithm = self.algorithm.id(), result = %combined, "combining algorithm finished");

        // 4. An Indeterminate target combines with the algorithm result
        //    per the §7.14 extended-indeterminate table.
        if let Some(te) = target_error {
            return match combined.decision {
                Decision::NotApplicable => DecisionResult::not_applicable_with(combined.status),
                Decision::Permit => {
                    applicable.push(self.metadata.clone());
                    DecisionResult::indeterminate(
                        ExtendedIndeterminate::Permit,
                        te.status(),
                        applicable.into_vec(),
                    )
                }
                Decision::Deny => {
                    applicable.push(self.metadata.clone());
                    DecisionResult::indeterminate(
                        ExtendedIndeterminate::Deny,
                        te.status(),
                        applicable.into_vec(),
                    )
                }
                Decision::Indeterminate(ext) => {
                    applicable.push(self.metadata.clone());
                    DecisionResult::indeterminate(ext, te.status(), applicable.into_vec())
                }
            };
        }

        // 5. Target matched (or was skipped): the decision is the
        //    algorithm's. Applicable means: contributed != NotApplicable.
        match combined.decision {
            Decision::NotApplicable => DecisionResult::not_applicable_with(combined.status),
            Decision::Indeterminate(ext) => {
                applicable.push(self.metadata.clone());
                let status = combined.status.unwrap_or_else(|| {
                    error!(
                        policy = %self.metadata,
                        "combining algorithm returned Indeterminate without a cause"
                    );
                    Status::processing_error("cause unknown")
                });
                DecisionResult::indeterminate(ext, status, applicable.into_vec())
            }
            Decision::Permit | Decision::Deny => {
                applicable.push(self.metadata.clone());
                let effect = if combined.decision == Decision::Permit {
                    Effect::Permit
                } else {
                    Effect::Deny
                };
                // 6. This element's own obligations/advice; a failing
                //    assignment collapses the whole element (§7.18).
                if let Err(e) = self.pep.evaluate_into(effect, ctx, &mut pep_actions) {
                    info!(policy = %self.metadata, error = %e, "PEP action expressions -> Indeterminate");
                    return DecisionResult::indeterminate(
                        effect.bias(),
                        e.status(),
                        applicable.into_vec(),
                    );
                }
                DecisionResult::determinate(combined, pep_actions, applicable.into_vec())
            }
        }
    }
}

impl<C: Combinable> std::fmt::Debug for TopLevelPolicyElement<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopLevelPolicyElement")
            .field("metadata", &self.metadata)
            .field("algorithm", &self.algorithm.id())
            .field("children", &self.children.len())
            .finish_non_exhaustive()
    }
}

impl<C: Combinable> PartialEq for TopLevelPolicyElement<C> {
    /// Policy equality is identity equality: (kind, id, version).
    fn eq(&self, other: &Self) -> bool {
        self.metadata == other.metadata
    }
}

// ============================================================================
// PolicyChildEvaluator
// ============================================================================

/// A PolicySet child: an inline policy or policy set, or a reference.
#[derive(Debug)]
pub enum PolicyChildEvaluator {
    Policy(Arc<PolicyEvaluator>),
    PolicySet(Arc<PolicySetEvaluator>),
    StaticRef(StaticPolicyRef),
    DynamicRef(DynamicPolicyRef),
}

impl Combinable for PolicyChildEvaluator {
    fn decide(&self, ctx: &mut EvaluationContext<'_>) -> DecisionResult {
        match self {
            Self::Policy(p) => p.evaluate(ctx, false),
            Self::PolicySet(p) => p.evaluate(ctx, false),
            Self::StaticRef(r) => r.evaluate(ctx, false),
            Self::DynamicRef(r) => r.evaluate(ctx, false),
        }
    }

    fn decide_skip_target(&self, ctx: &mut EvaluationContext<'_>) -> DecisionResult {
        match self {
            Self::Policy(p) => p.evaluate(ctx, true),
            Self::PolicySet(p) => p.evaluate(ctx, true),
            Self::StaticRef(r) => r.evaluate(ctx, true),
            Self::DynamicRef(r) => r.evaluate(ctx, true),
        }
    }

    fn matches_target(&self, ctx: &mut EvaluationContext<'_>) -> Result<bool, EvalError> {
        match self {
            Self::Policy(p) => p.is_applicable_by_target(ctx),
            Self::PolicySet(p) => p.is_applicable_by_target(ctx),
            Self::StaticRef(r) => r.is_applicable_by_target(ctx),
            Self::DynamicRef(r) => r.is_applicable_by_target(ctx),
        }
    }

    fn refs_metadata(
        &self,
        ctx: &mut EvaluationContext<'_>,
    ) -> Result<Option<PolicyRefsMetadata>, EvalError> {
        match self {
            Self::Policy(p) => p.refs_metadata(ctx),
            Self::PolicySet(p) => p.refs_metadata(ctx),
            Self::StaticRef(r) => Ok(Some(r.refs_metadata().clone())),
            Self::DynamicRef(r) => r.refs_metadata(ctx).map(Some),
        }
    }

    fn enclosed_policies(&self) -> &[PrimaryPolicyMetadata] {
        match self {
            Self::Policy(p) => p.enclosed_policies(),
            Self::PolicySet(p) => p.enclosed_policies(),
            // references enclose nothing textually
            Self::StaticRef(_) | Self::DynamicRef(_) => &[],
        }
    }
}

impl PolicyChildEvaluator {
    /// The child's policy id, for duplicate detection and combiner
    /// parameter resolution at construction.
    pub fn policy_id(&self) -> &garnet_types::PolicyId {
        match self {
            Self::Policy(p) => &p.metadata().id,
            Self::PolicySet(p) => &p.metadata().id,
            Self::StaticRef(r) => r.policy_id(),
            Self::DynamicRef(r) => r.policy_id(),
        }
    }
}

// ============================================================================
// TopLevelPolicyEvaluator
// ============================================================================

/// A shareable handle to a compiled root-level Policy or PolicySet, as
/// returned by the compiler and by policy providers.
#[derive(Debug, Clone)]
pub enum TopLevelPolicyEvaluator {
    Policy(Arc<PolicyEvaluator>),
    PolicySet(Arc<PolicySetEvaluator>),
}

impl TopLevelPolicyEvaluator {
    pub fn metadata(&self) -> &PrimaryPolicyMetadata {
        match self {
            Self::Policy(p) => p.metadata(),
            Self::PolicySet(p) => p.metadata(),
        }
    }

    pub fn evaluate(&self, ctx: &mut EvaluationContext<'_>, skip_target: bool) -> DecisionResult {
        match self {
            Self::Policy(p) => p.evaluate(ctx, skip_target),
            Self::PolicySet(p) => p.evaluate(ctx, skip_target),
        }
    }

    /// Evaluates a request end to end with a fresh context.
    pub fn decide(&self, request: &garnet_types::DecisionRequest) -> DecisionResult {
        let mut ctx = EvaluationContext::new(request);
        self.evaluate(&mut ctx, false)
    }

    pub fn is_applicable_by_target(
        &self,
        ctx: &mut EvaluationContext<'_>,
    ) -> Result<bool, EvalError> {
        match self {
            Self::Policy(p) => p.is_applicable_by_target(ctx),
            Self::PolicySet(p) => p.is_applicable_by_target(ctx),
        }
    }

    pub fn refs_metadata(
        &self,
        ctx: &mut EvaluationContext<'_>,
    ) -> Result<Option<PolicyRefsMetadata>, EvalError> {
        match self {
            Self::Policy(p) => p.refs_metadata(ctx),
            Self::PolicySet(p) => p.refs_metadata(ctx),
        }
    }

    /// Statically known reference metadata, when available.
    pub fn known_refs_metadata(&self) -> Option<Option<&PolicyRefsMetadata>> {
        match self {
            Self::Policy(p) => p.known_refs_metadata(),
            Self::PolicySet(p) => p.known_refs_metadata(),
        }
    }
}
