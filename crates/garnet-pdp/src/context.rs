//! The per-request evaluation context.
//!
//! One context is created per individual decision request, mutated only
//! by the evaluating thread, and dropped at response time. It carries the
//! read-only request plus the request-scoped mutable state: variable
//! values, memoized policy results, and cached dynamic-reference
//! resolutions. Compiled evaluators themselves stay immutable and
//! shareable across threads.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use garnet_types::{DecisionRequest, DecisionResult, PolicyRefsMetadata};
use tracing::error;

use crate::error::EvalError;
use crate::expr::{Value, VariableId};
use crate::reference::ResolvedRef;

// ============================================================================
// CacheKey
// ============================================================================

/// Opaque request-scoped cache key. Each caching evaluator draws one at
/// construction, giving it a stable identity across requests without any
/// global registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey(u64);

impl CacheKey {
    /// Allocates a fresh, process-unique key.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

// ============================================================================
// EvaluationContext
// ============================================================================

/// Two-slot memo for a policy's evaluation results: one slot for the
/// normal call, one for `skip_target = true` (used by only-one-applicable
/// after its separate target applicability test).
#[derive(Debug, Default)]
struct PolicyResultSlots {
    with_target: Option<DecisionResult>,
    without_target: Option<DecisionResult>,
}

/// Mutable per-request state threaded through evaluation.
#[derive(Debug)]
pub struct EvaluationContext<'r> {
    request: &'r DecisionRequest,
    variables: HashMap<VariableId, Value>,
    policy_results: HashMap<CacheKey, PolicyResultSlots>,
    ref_resolutions: HashMap<CacheKey, Result<ResolvedRef, EvalError>>,
    refs_in_resolution: HashSet<CacheKey>,
    refs_metadata: HashMap<CacheKey, Option<PolicyRefsMetadata>>,
}

impl<'r> EvaluationContext<'r> {
    pub fn new(request: &'r DecisionRequest) -> Self {
        Self {
            request,
            variables: HashMap::new(),
            policy_results: HashMap::new(),
            ref_resolutions: HashMap::new(),
            refs_in_resolution: HashSet::new(),
            refs_metadata: HashMap::new(),
        }
    }

    pub fn request(&self) -> &'r DecisionRequest {
        self.request
    }

    /// Whether results should carry the applicable-policy list.
    pub fn applicable_policies_requested(&self) -> bool {
        self.request.applicable_policies_requested()
    }

    // ------------------------------------------------------------------
    // Variables
    // ------------------------------------------------------------------

    /// The current value of a variable, if assigned in this context.
    pub fn variable(&self, id: &VariableId) -> Option<&Value> {
        self.variables.get(id)
    }

    /// Publishes a variable value unless one is already present.
    pub fn set_variable_if_absent(&mut self, id: VariableId, value: Value) {
        self.variables.entry(id).or_insert(value);
    }

    /// Removes a variable on exit from its defining policy's evaluation.
    pub fn remove_variable(&mut self, id: &VariableId) {
        self.variables.remove(id);
    }

    // ------------------------------------------------------------------
    // Policy result memo
    // ------------------------------------------------------------------

    pub(crate) fn cached_policy_result(
        &self,
        key: CacheKey,
        skip_target: bool,
    ) -> Option<DecisionResult> {
        let slots = self.policy_results.get(&key)?;
        let slot = if skip_target {
            &slots.without_target
        } else {
            &slots.with_target
        };
        slot.clone()
    }

    /// Stores a policy evaluation result. Each slot is written at most
    /// once per request; a second write indicates a recursion the engine
    /// must not permit, so it is rejected (and flagged in debug builds).
    pub(crate) fn store_policy_result(
        &mut self,
        key: CacheKey,
        skip_target: bool,
        result: DecisionResult,
    ) {
        let slots = self.policy_results.entry(key).or_default();
        let slot = if skip_target {
            &mut slots.without_target
        } else {
            &mut slots.with_target
        };
        if slot.is_some() {
            debug_assert!(false, "policy evaluation result already cached for this request");
            error!(skip_target, "policy evaluation result already cached; keeping first");
            return;
        }
        *slot = Some(result);
    }

    // ------------------------------------------------------------------
    // Dynamic reference resolution memo
    // ------------------------------------------------------------------

    pub(crate) fn cached_ref_resolution(
        &self,
        key: CacheKey,
    ) -> Option<Result<ResolvedRef, EvalError>> {
        self.ref_resolutions.get(&key).cloned()
    }

    pub(crate) fn store_ref_resolution(
        &mut self,
        key: CacheKey,
        resolution: Result<ResolvedRef, EvalError>,
    ) {
        self.ref_resolutions.insert(key, resolution);
    }

    /// Marks a dynamic reference as being resolved. Returns false when
    /// the same reference is already resolving higher up the stack: a
    /// reference cycle the provider's chain rules did not reach.
    pub(crate) fn begin_ref_resolution(&mut self, key: CacheKey) -> bool {
        self.refs_in_resolution.insert(key)
    }

    pub(crate) fn end_ref_resolution(&mut self, key: CacheKey) {
        self.refs_in_resolution.remove(&key);
    }

    // ------------------------------------------------------------------
    // Dynamic policy-set refs metadata memo
    // ------------------------------------------------------------------

    pub(crate) fn cached_refs_metadata(
        &self,
        key: CacheKey,
    ) -> Option<Option<PolicyRefsMetadata>> {
        self.refs_metadata.get(&key).cloned()
    }

    pub(crate) fn store_refs_metadata(
        &mut self,
        key: CacheKey,
        metadata: Option<PolicyRefsMetadata>,
    ) {
        self.refs_metadata.insert(key, metadata);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use garnet_types::AttributeValue;

    #[test]
    fn cache_keys_are_unique() {
        let a = CacheKey::next();
        let b = CacheKey::next();
        assert_ne!(a, b);
    }

    #[test]
    fn variables_assign_once_and_remove() {
        let request = DecisionRequest::builder().build();
        let mut ctx = EvaluationContext::new(&request);
        let id = VariableId::new("who");

        ctx.set_variable_if_absent(id.clone(), Value::Atomic(AttributeValue::from("alice")));
        ctx.set_variable_if_absent(id.clone(), Value::Atomic(AttributeValue::from("bob")));
        match ctx.variable(&id) {
            Some(Value::Atomic(AttributeValue::String(s))) => assert_eq!(s, "alice"),
            other => panic!("unexpected variable value: {other:?}"),
        }

        ctx.remove_variable(&id);
        assert!(ctx.variable(&id).is_none());
    }

    #[test]
    fn policy_result_slots_are_independent() {
        let request = DecisionRequest::builder().build();
        let mut ctx = EvaluationContext::new(&request);
        let key = CacheKey::next();

        assert!(ctx.cached_policy_result(key, false).is_none());
        ctx.store_policy_result(key, false, DecisionResult::not_applicable());
        assert!(ctx.cached_policy_result(key, false).is_some());
        assert!(ctx.cached_policy_result(key, true).is_none());
    }
}
