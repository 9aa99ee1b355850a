//! Content paths: the engine's stand-in for XPath over request content.
//!
//! Attribute selectors address structured request content with compiled
//! path expressions such as `/record/owner` or `/records/$patient-id/ward`.
//! A `$name` segment is a path variable bound to a policy
//! `VariableDefinition` of the same name.
//!
//! A [`PathCompiler`] is immutable once configured: it carries the set of
//! variables visible at the point of compilation. Whenever a policy
//! defines a new variable, subsequent children compile against a new
//! compiler instance carrying the grown set.

use std::collections::BTreeSet;

use garnet_types::{AttributeValue, Bag, Datatype};
use serde_json::Value as Content;

use crate::error::{EvalError, PolicyBuildError};
use crate::expr::VariableId;

// ============================================================================
// PathCompiler
// ============================================================================

/// Compiles path expressions, validating path variables against the set
/// of policy variables visible at the compilation point.
#[derive(Debug, Clone, Default)]
pub struct PathCompiler {
    declared: BTreeSet<VariableId>,
}

impl PathCompiler {
    /// A compiler with the given visible variable set.
    pub fn new(declared: impl IntoIterator<Item = VariableId>) -> Self {
        Self {
            declared: declared.into_iter().collect(),
        }
    }

    /// The variables visible to expressions compiled by this instance.
    pub fn declared_variables(&self) -> impl Iterator<Item = &VariableId> {
        self.declared.iter()
    }

    /// Compiles a path expression.
    pub fn compile(&self, source: &str) -> Result<ContentPath, PolicyBuildError> {
        let invalid = |message: &str| PolicyBuildError::InvalidPath {
            path: source.to_string(),
            message: message.to_string(),
        };

        let Some(rest) = source.strip_prefix('/') else {
            return Err(invalid("path must start with '/'"));
        };
        if rest.is_empty() {
            return Err(invalid("path must contain at least one segment"));
        }

        let mut steps = Vec::new();
        for segment in rest.split('/') {
            if segment.is_empty() {
                return Err(invalid("empty path segment"));
            }
            if let Some(name) = segment.strip_prefix('$') {
                let id = VariableId::new(name);
                if self.declared.is_empty() {
                    return Err(invalid(&format!(
                        "path variable '${name}' used but no variable definitions are in scope"
                    )));
                }
                if !self.declared.contains(&id) {
                    return Err(invalid(&format!(
                        "path variable '${name}' has no matching variable definition in scope"
                    )));
                }
                steps.push(PathStep::Variable(id));
            } else if let Ok(index) = segment.parse::<usize>() {
                steps.push(PathStep::Index(index));
            } else {
                steps.push(PathStep::Key(segment.to_string()));
            }
        }

        Ok(ContentPath {
            source: source.to_string(),
            steps,
        })
    }
}

// ============================================================================
// ContentPath
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum PathStep {
    /// Object field access; over an array, maps across the elements.
    Key(String),
    /// Array index access.
    Index(usize),
    /// A step whose key or index is a policy variable's value.
    Variable(VariableId),
}

/// A compiled content path, evaluable against a category's content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentPath {
    source: String,
    steps: Vec<PathStep>,
}

impl ContentPath {
    pub fn source(&self) -> &str {
        &self.source
    }

    fn error(&self, message: impl Into<String>) -> EvalError {
        EvalError::Path {
            path: self.source.clone(),
            message: message.into(),
        }
    }

    /// Selects the nodes this path addresses, resolving path variables
    /// through `resolve`. Nodes the path does not reach select nothing;
    /// only variable-resolution failures are errors.
    pub fn select<'c>(
        &self,
        root: &'c Content,
        resolve: &mut dyn FnMut(&VariableId) -> Result<AttributeValue, EvalError>,
    ) -> Result<Vec<&'c Content>, EvalError> {
        let mut nodes: Vec<&Content> = vec![root];
        for step in &self.steps {
            let mut next = Vec::new();
            match step {
                PathStep::Key(key) => Self::descend_key(&nodes, key, &mut next),
                PathStep::Index(index) => Self::descend_index(&nodes, *index, &mut next),
                PathStep::Variable(id) => {
                    let value = resolve(id)?;
                    match value {
                        AttributeValue::String(key) => Self::descend_key(&nodes, &key, &mut next),
                        AttributeValue::Integer(i) => {
                            let index = usize::try_from(i).map_err(|_| {
                                self.error(format!("variable '${id}' is not a valid index: {i}"))
                            })?;
                            Self::descend_index(&nodes, index, &mut next);
                        }
                        other => {
                            return Err(self.error(format!(
                                "variable '${id}' must be a string or integer, got {}",
                                other.datatype()
                            )));
                        }
                    }
                }
            }
            nodes = next;
            if nodes.is_empty() {
                break;
            }
        }

        // a terminal array selects its elements
        let mut selected = Vec::new();
        for node in nodes {
            match node {
                Content::Array(items) => selected.extend(items.iter()),
                other => selected.push(other),
            }
        }
        Ok(selected)
    }

    fn descend_key<'c>(nodes: &[&'c Content], key: &str, out: &mut Vec<&'c Content>) {
        for node in nodes {
            match node {
                Content::Object(map) => {
                    if let Some(child) = map.get(key) {
                        out.push(child);
                    }
                }
                Content::Array(items) => {
                    for item in items {
                        if let Content::Object(map) = item {
                            if let Some(child) = map.get(key) {
                                out.push(child);
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }

    fn descend_index<'c>(nodes: &[&'c Content], index: usize, out: &mut Vec<&'c Content>) {
        for node in nodes {
            if let Content::Array(items) = node {
                if let Some(child) = items.get(index) {
                    out.push(child);
                }
            }
        }
    }

    /// Selects and converts the addressed nodes into a bag of `datatype`.
    pub fn select_values(
        &self,
        root: &Content,
        datatype: Datatype,
        resolve: &mut dyn FnMut(&VariableId) -> Result<AttributeValue, EvalError>,
    ) -> Result<Bag, EvalError> {
        let nodes = self.select(root, resolve)?;
        let mut values = Vec::with_capacity(nodes.len());
        for node in nodes {
            values.push(self.convert(node, datatype)?);
        }
        Bag::new(datatype, values).map_err(EvalError::from)
    }

    fn convert(&self, node: &Content, datatype: Datatype) -> Result<AttributeValue, EvalError> {
        let mismatch =
            || self.error(format!("selected node is not convertible to {datatype}: {node}"));
        match (datatype, node) {
            (Datatype::String, Content::String(s)) => Ok(AttributeValue::String(s.clone())),
            (Datatype::AnyUri, Content::String(s)) => Ok(AttributeValue::AnyUri(s.clone())),
            (Datatype::Boolean, Content::Bool(b)) => Ok(AttributeValue::Boolean(*b)),
            (Datatype::Integer, Content::Number(n)) => {
                n.as_i64().map(AttributeValue::Integer).ok_or_else(mismatch)
            }
            (Datatype::Double, Content::Number(n)) => {
                n.as_f64().map(AttributeValue::Double).ok_or_else(mismatch)
            }
            _ => Err(mismatch()),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
