//! Compilation of policy documents into immutable evaluators.
//!
//! The compiler walks the document model bottom-up, producing the
//! evaluator tree once; evaluators are immutable afterwards and safe to
//! share across threads. References are expanded at compilation when a
//! static provider is supplied, or compiled into per-request dynamic
//! reference evaluators otherwise.

use std::collections::HashSet;
use std::sync::Arc;

use garnet_types::{PolicyId, PolicyKind, PolicyRefsMetadata, PolicyVersion, PrimaryPolicyMetadata};
use tracing::warn;

use crate::combining::{CombinerParametersAssignment, CombiningAlgRegistry};
use crate::error::{EvalError, PolicyBuildError};
use crate::expr::factory::ExpressionFactory;
use crate::expr::VariableId;
use crate::model::{
    CombinerParameterNode, PolicyChildNode, PolicyNode, PolicySetChildNode, PolicySetNode,
};
use crate::pep::PepActionExpressions;
use crate::policy::{
    PolicyChildEvaluator, PolicyEvaluator, PolicySetEvaluator, RefsMetadataSource,
    TopLevelPolicyElement, TopLevelPolicyEvaluator,
};
use crate::provider::{PolicyProvider, StaticPolicyProvider};
use crate::reference::{DynamicPolicyRef, StaticPolicyRef};
use crate::rule::RuleEvaluator;
use crate::target::TargetEvaluator;

// ============================================================================
// Reference resolution mode
// ============================================================================

/// How Policy(Set)IdReferences are resolved during compilation.
#[derive(Debug, Clone)]
pub enum ReferenceResolution {
    /// References are construction-time errors.
    Forbidden,
    /// References resolve now, against a pure static provider.
    Static(Arc<StaticPolicyProvider>),
    /// References compile into dynamic evaluators resolving per request.
    Dynamic(Arc<dyn PolicyProvider>),
}

// ============================================================================
// PolicyCompiler
// ============================================================================

/// Compiles policy documents against an expression factory and a
/// combining-algorithm registry.
pub struct PolicyCompiler<'a> {
    factory: &'a mut ExpressionFactory,
    algorithms: &'a CombiningAlgRegistry,
}

impl<'a> PolicyCompiler<'a> {
    pub fn new(factory: &'a mut ExpressionFactory, algorithms: &'a CombiningAlgRegistry) -> Self {
        Self {
            factory,
            algorithms,
        }
    }

    fn parse_metadata(
        kind: PolicyKind,
        id: &str,
        version: &str,
    ) -> Result<PrimaryPolicyMetadata, PolicyBuildError> {
        let version: PolicyVersion = version.parse()?;
        Ok(PrimaryPolicyMetadata::new(kind, PolicyId::new(id), version))
    }

    fn parameters(
        combined_id: Option<&str>,
        nodes: &[CombinerParameterNode],
    ) -> CombinerParametersAssignment {
        CombinerParametersAssignment {
            combined_id: combined_id.map(ToString::to_string),
            parameters: nodes
                .iter()
                .map(|p| (p.name.clone(), p.value.clone()))
                .collect(),
        }
    }

    // ------------------------------------------------------------------
    // Policy
    // ------------------------------------------------------------------

    /// Compiles a Policy. Local variable definitions are published to the
    /// factory while the policy's children compile and removed again on
    /// every exit from the construction scope.
    pub fn compile_policy(
        &mut self,
        node: &PolicyNode,
    ) -> Result<Arc<PolicyEvaluator>, PolicyBuildError> {
        let metadata = Self::parse_metadata(PolicyKind::Policy, &node.id, &node.version)?;

        let mut added_variables: Vec<VariableId> = Vec::new();
        let result = self.compile_policy_scoped(node, &metadata, &mut added_variables);

        // leave the construction scope: this policy's variables must not
        // be visible to siblings, on success or failure
        for id in &added_variables {
            self.factory.remove_variable(id);
        }
        result
    }

    fn compile_policy_scoped(
        &mut self,
        node: &PolicyNode,
        metadata: &PrimaryPolicyMetadata,
        added_variables: &mut Vec<VariableId>,
    ) -> Result<Arc<PolicyEvaluator>, PolicyBuildError> {
        let mut paths = self.factory.path_compiler();
        let mut paths_stale = false;

        let target = TargetEvaluator::new(node.target.as_ref(), self.factory, paths.as_ref())
            .map_err(|e| e.in_context(format!("{metadata}: invalid target")))?;

        let mut local_variables = Vec::new();
        let mut rules: Vec<RuleEvaluator> = Vec::new();
        let mut rule_ids: HashSet<String> = HashSet::new();
        let mut parameters: Vec<CombinerParametersAssignment> = Vec::new();

        for (index, child) in node.children.iter().enumerate() {
            // new variables since the last compiler instance: subsequent
            // children need a fresh one carrying the grown variable set
            if paths_stale {
                paths = self.factory.path_compiler();
                paths_stale = false;
            }

            match child {
                PolicyChildNode::VariableDefinition { id, expression } => {
                    let variable = self
                        .factory
                        .add_variable(VariableId::new(id.as_str()), expression, paths.as_ref())
                        .map_err(|e| {
                            e.in_context(format!(
                                "{metadata}: invalid child #{index} (variable definition)"
                            ))
                        })?;
                    added_variables.push(variable.id().clone());
                    local_variables.push(variable);
                    paths_stale = true;
                }

                PolicyChildNode::Rule(rule_node) => {
                    let rule =
                        RuleEvaluator::new(rule_node, self.factory, paths.as_ref()).map_err(|e| {
                            e.in_context(format!("{metadata}: invalid child #{index} (rule)"))
                        })?;

                    if rule.effect().is_none() && !tracing::enabled!(tracing::Level::DEBUG) {
                        // constant-false condition: the rule decides
                        // nothing; keep it out of combining unless debug
                        // diagnostics are on
                        warn!(
                            policy = %metadata,
                            rule_id = rule.id(),
                            "pruning rule with constant-false condition from combining"
                        );
                        continue;
                    }

                    if !rule_ids.insert(rule.id().to_string()) {
                        return Err(PolicyBuildError::DuplicateRuleId {
                            policy: metadata.clone(),
                            rule_id: rule.id().to_string(),
                        });
                    }
                    rules.push(rule);
                }

                PolicyChildNode::RuleCombinerParameters {
                    rule_id,
                    parameters: nodes,
                } => {
                    if !rule_ids.contains(rule_id) {
                        return Err(PolicyBuildError::UndefinedCombinedChild {
                            policy: metadata.clone(),
                            child_id: rule_id.clone(),
                        });
                    }
                    parameters.push(Self::parameters(Some(rule_id.as_str()), nodes));
                }

                PolicyChildNode::CombinerParameters(nodes) => {
                    parameters.push(Self::parameters(None, nodes));
                }
            }
        }

        let pep =
            PepActionExpressions::compile(&node.obligations, &node.advice, self.factory, paths.as_ref())
                .map_err(|e| e.in_context(format!("{metadata}: invalid PEP action expressions")))?;

        let algorithm = self
            .algorithms
            .rule_algorithm(&node.rule_combining_alg_id)
            .map_err(|e| e.in_context(metadata.to_string()))?;

        TopLevelPolicyElement::new(
            metadata.clone(),
            target,
            local_variables,
            algorithm,
            rules,
            parameters,
            pep,
            RefsMetadataSource::None,
        )
        .map(Arc::new)
    }

    // ------------------------------------------------------------------
    // PolicySet
    // ------------------------------------------------------------------

    /// Compiles a root PolicySet.
    pub fn compile_policy_set(
        &mut self,
        node: &PolicySetNode,
        refs: &ReferenceResolution,
    ) -> Result<Arc<PolicySetEvaluator>, PolicyBuildError> {
        self.compile_policy_set_in_chain(node, refs, &[])
    }

    /// Compiles a PolicySet reached through `ancestor_chain`: the chain
    /// of policy-set ids from the root down to the top-level PolicySet
    /// enclosing (or being) this one; empty for the root.
    fn compile_policy_set_in_chain(
        &mut self,
        node: &PolicySetNode,
        refs: &ReferenceResolution,
        ancestor_chain: &[PolicyId],
    ) -> Result<Arc<PolicySetEvaluator>, PolicyBuildError> {
        let metadata = Self::parse_metadata(PolicyKind::PolicySet, &node.id, &node.version)?;
        let paths = self.factory.path_compiler();

        let target = TargetEvaluator::new(node.target.as_ref(), self.factory, paths.as_ref())
            .map_err(|e| e.in_context(format!("{metadata}: invalid target")))?;

        let mut children: Vec<PolicyChildEvaluator> = Vec::new();
        let mut child_policy_ids: HashSet<PolicyId> = HashSet::new();
        let mut child_policy_set_ids: HashSet<PolicyId> = HashSet::new();
        let mut parameters: Vec<CombinerParametersAssignment> = Vec::new();
        // folded bottom-up when references resolve statically
        let mut static_refs = PolicyRefsMetadata::default();

        for (index, child) in node.children.iter().enumerate() {
            match child {
                PolicySetChildNode::Policy(policy_node) => {
                    let child_eval = self.compile_policy(policy_node).map_err(|e| {
                        e.in_context(format!("{metadata}: invalid child #{index} (policy)"))
                    })?;
                    Self::check_unique(&metadata, &mut child_policy_ids, &child_eval.metadata().id)?;
                    children.push(PolicyChildEvaluator::Policy(child_eval));
                }

                PolicySetChildNode::PolicySet(policy_set_node) => {
                    // the chain tracks top-level (reference-target)
                    // policy sets; a nested inline one inherits it, and
                    // the root starts a chain with its own id
                    let chain: Vec<PolicyId> = if ancestor_chain.is_empty() {
                        vec![metadata.id.clone()]
                    } else {
                        ancestor_chain.to_vec()
                    };
                    let child_eval = self
                        .compile_policy_set_in_chain(policy_set_node, refs, &chain)
                        .map_err(|e| {
                            e.in_context(format!("{metadata}: invalid child #{index} (policy set)"))
                        })?;
                    Self::check_unique(
                        &metadata,
                        &mut child_policy_set_ids,
                        &child_eval.metadata().id,
                    )?;
                    if let Some(Some(child_refs)) = child_eval.known_refs_metadata() {
                        static_refs.absorb(child_refs);
                    }
                    children.push(PolicyChildEvaluator::PolicySet(child_eval));
                }

                PolicySetChildNode::PolicyRef(ref_node) => {
                    let target_id = PolicyId::new(ref_node.id.as_str());
                    let constraints = ref_node.patterns()?;
                    Self::check_unique(&metadata, &mut child_policy_ids, &target_id)?;
                    let child_eval = match refs {
                        ReferenceResolution::Forbidden => {
                            return Err(PolicyBuildError::NoPolicyProvider { policy: metadata });
                        }
                        ReferenceResolution::Static(provider) => {
                            let referred = provider
                                .get_static(PolicyKind::Policy, &target_id, &constraints, None)
                                .map_err(|e| {
                                    e.in_context(format!(
                                        "{metadata}: invalid child #{index} (policy reference)"
                                    ))
                                })?;
                            let static_ref = StaticPolicyRef::new(referred, constraints)?;
                            static_refs.absorb(static_ref.refs_metadata());
                            PolicyChildEvaluator::StaticRef(static_ref)
                        }
                        ReferenceResolution::Dynamic(provider) => {
                            PolicyChildEvaluator::DynamicRef(DynamicPolicyRef::new(
                                PolicyKind::Policy,
                                target_id,
                                constraints,
                                Arc::clone(provider),
                                Vec::new(),
                            ))
                        }
                    };
                    children.push(child_eval);
                }

                PolicySetChildNode::PolicySetRef(ref_node) => {
                    let target_id = PolicyId::new(ref_node.id.as_str());
                    let constraints = ref_node.patterns()?;
                    Self::check_unique(&metadata, &mut child_policy_set_ids, &target_id)?;

                    // extend the chain with this reference's target
                    let chain = if ancestor_chain.is_empty() {
                        vec![metadata.id.clone(), target_id.clone()]
                    } else {
                        match refs {
                            ReferenceResolution::Forbidden => {
                                return Err(PolicyBuildError::NoPolicyProvider {
                                    policy: metadata,
                                });
                            }
                            ReferenceResolution::Static(provider) => provider
                                .join_static(ancestor_chain, std::slice::from_ref(&target_id))?,
                            ReferenceResolution::Dynamic(provider) => provider
                                .join_ref_chains(ancestor_chain, std::slice::from_ref(&target_id))
                                .map_err(chain_error_to_build_error)?,
                        }
                    };

                    let child_eval = match refs {
                        ReferenceResolution::Forbidden => {
                            return Err(PolicyBuildError::NoPolicyProvider { policy: metadata });
                        }
                        ReferenceResolution::Static(provider) => {
                            let referred = provider
                                .get_static(
                                    PolicyKind::PolicySet,
                                    &target_id,
                                    &constraints,
                                    Some(&chain),
                                )
                                .map_err(|e| {
                                    e.in_context(format!(
                                        "{metadata}: invalid child #{index} (policy set reference)"
                                    ))
                                })?;
                            let static_ref = StaticPolicyRef::new(referred, constraints)?;
                            static_refs.absorb(static_ref.refs_metadata());
                            PolicyChildEvaluator::StaticRef(static_ref)
                        }
                        ReferenceResolution::Dynamic(provider) => {
                            PolicyChildEvaluator::DynamicRef(DynamicPolicyRef::new(
                                PolicyKind::PolicySet,
                                target_id,
                                constraints,
                                Arc::clone(provider),
                                chain,
                            ))
                        }
                    };
                    children.push(child_eval);
                }

                PolicySetChildNode::PolicyCombinerParameters {
                    policy_id,
                    parameters: nodes,
                } => {
                    if !child_policy_ids.contains(&PolicyId::new(policy_id.as_str())) {
                        return Err(PolicyBuildError::UndefinedCombinedChild {
                            policy: metadata.clone(),
                            child_id: policy_id.clone(),
                        });
                    }
                    parameters.push(Self::parameters(Some(policy_id.as_str()), nodes));
                }

                PolicySetChildNode::PolicySetCombinerParameters {
                    policy_set_id,
                    parameters: nodes,
                } => {
                    if !child_policy_set_ids.contains(&PolicyId::new(policy_set_id.as_str())) {
                        return Err(PolicyBuildError::UndefinedCombinedChild {
                            policy: metadata.clone(),
                            child_id: policy_set_id.clone(),
                        });
                    }
                    parameters.push(Self::parameters(Some(policy_set_id.as_str()), nodes));
                }

                PolicySetChildNode::CombinerParameters(nodes) => {
                    parameters.push(Self::parameters(None, nodes));
                }
            }
        }

        let pep =
            PepActionExpressions::compile(&node.obligations, &node.advice, self.factory, paths.as_ref())
                .map_err(|e| e.in_context(format!("{metadata}: invalid PEP action expressions")))?;

        let algorithm = self
            .algorithms
            .policy_algorithm(&node.policy_combining_alg_id)
            .map_err(|e| e.in_context(metadata.to_string()))?;

        let refs_source = match refs {
            ReferenceResolution::Dynamic(_) => RefsMetadataSource::dynamic(),
            _ => RefsMetadataSource::Static(if static_refs.is_empty() {
                None
            } else {
                Some(static_refs)
            }),
        };

        TopLevelPolicyElement::new(
            metadata,
            target,
            Vec::new(),
            algorithm,
            children,
            parameters,
            pep,
            refs_source,
        )
        .map(Arc::new)
    }

    fn check_unique(
        metadata: &PrimaryPolicyMetadata,
        seen: &mut HashSet<PolicyId>,
        id: &PolicyId,
    ) -> Result<(), PolicyBuildError> {
        if !seen.insert(id.clone()) {
            return Err(PolicyBuildError::DuplicateChildPolicy {
                policy: metadata.clone(),
                child_id: id.clone(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// Convenience entry points
// ============================================================================

/// Compiles a root Policy into a shareable evaluator handle.
pub fn compile_policy(
    node: &PolicyNode,
    factory: &mut ExpressionFactory,
    algorithms: &CombiningAlgRegistry,
) -> Result<TopLevelPolicyEvaluator, PolicyBuildError> {
    PolicyCompiler::new(factory, algorithms)
        .compile_policy(node)
        .map(TopLevelPolicyEvaluator::Policy)
}

/// Compiles a root PolicySet into a shareable evaluator handle.
pub fn compile_policy_set(
    node: &PolicySetNode,
    factory: &mut ExpressionFactory,
    algorithms: &CombiningAlgRegistry,
    refs: &ReferenceResolution,
) -> Result<TopLevelPolicyEvaluator, PolicyBuildError> {
    PolicyCompiler::new(factory, algorithms)
        .compile_policy_set(node, refs)
        .map(TopLevelPolicyEvaluator::PolicySet)
}

/// Maps a provider's chain-rule failure onto the construction-time
/// error surface.
fn chain_error_to_build_error(e: EvalError) -> PolicyBuildError {
    match e {
        EvalError::ReferenceCycle { id, chain } => PolicyBuildError::ReferenceCycle { id, chain },
        EvalError::RefDepthExceeded { depth, max } => {
            PolicyBuildError::RefDepthExceeded { depth, max }
        }
        other => PolicyBuildError::ProviderFailure(other.to_string()),
    }
}
