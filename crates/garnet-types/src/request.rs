//! The decision request: attributes organized by category, plus optional
//! structured content per category.
//!
//! The engine treats a request as read-only. Attributes are keyed by
//! (category, attribute id, optional issuer) and hold bags of typed
//! values; content is a structured document that attribute selectors
//! evaluate path expressions against.

use std::collections::HashMap;
use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

use crate::value::Bag;

// ============================================================================
// Category and attribute identifiers
// ============================================================================

/// An attribute category URI, e.g. the access-subject category.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Category(String);

impl Category {
    pub const ACCESS_SUBJECT: &'static str =
        "urn:oasis:names:tc:xacml:1.0:subject-category:access-subject";
    pub const RESOURCE: &'static str =
        "urn:oasis:names:tc:xacml:3.0:attribute-category:resource";
    pub const ACTION: &'static str = "urn:oasis:names:tc:xacml:3.0:attribute-category:action";
    pub const ENVIRONMENT: &'static str =
        "urn:oasis:names:tc:xacml:3.0:attribute-category:environment";

    pub fn new(uri: impl Into<String>) -> Self {
        Self(uri.into())
    }

    /// The standard access-subject category.
    pub fn access_subject() -> Self {
        Self::new(Self::ACCESS_SUBJECT)
    }

    /// The standard resource category.
    pub fn resource() -> Self {
        Self::new(Self::RESOURCE)
    }

    /// The standard action category.
    pub fn action() -> Self {
        Self::new(Self::ACTION)
    }

    /// The standard environment category.
    pub fn environment() -> Self {
        Self::new(Self::ENVIRONMENT)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Category {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// An attribute identifier URI, e.g. `subject-id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttributeId(String);

impl AttributeId {
    pub const SUBJECT_ID: &'static str = "urn:oasis:names:tc:xacml:1.0:subject:subject-id";
    pub const RESOURCE_ID: &'static str = "urn:oasis:names:tc:xacml:1.0:resource:resource-id";
    pub const ACTION_ID: &'static str = "urn:oasis:names:tc:xacml:1.0:action:action-id";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for AttributeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AttributeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Full key of a request attribute: category, id, and optional issuer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttributeKey {
    pub category: Category,
    pub attribute_id: AttributeId,
    pub issuer: Option<String>,
}

// ============================================================================
// DecisionRequest
// ============================================================================

/// An individual decision request: a read-only bundle of attribute bags
/// and per-category structured content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRequest {
    attributes: HashMap<AttributeKey, Bag>,
    content: HashMap<Category, serde_json::Value>,
    return_applicable_policies: bool,
}

impl DecisionRequest {
    pub fn builder() -> DecisionRequestBuilder {
        DecisionRequestBuilder::default()
    }

    /// Looks up the bag for an exact (category, id, issuer) key.
    pub fn attribute(&self, key: &AttributeKey) -> Option<&Bag> {
        self.attributes.get(key)
    }

    /// Iterates all attribute entries matching category and id.
    ///
    /// A designator without an issuer matches entries with any issuer, so
    /// callers filter on issuer themselves when one is specified.
    pub fn attributes_matching<'a>(
        &'a self,
        category: &'a Category,
        attribute_id: &'a AttributeId,
    ) -> impl Iterator<Item = (&'a AttributeKey, &'a Bag)> {
        self.attributes.iter().filter(move |(key, _)| {
            key.category == *category && key.attribute_id == *attribute_id
        })
    }

    /// The structured content of a category, if the request carried any.
    pub fn content(&self, category: &Category) -> Option<&serde_json::Value> {
        self.content.get(category)
    }

    /// Whether the caller asked for the applicable-policy list in results.
    pub fn applicable_policies_requested(&self) -> bool {
        self.return_applicable_policies
    }
}

/// Builder for [`DecisionRequest`].
#[derive(Debug, Default)]
pub struct DecisionRequestBuilder {
    attributes: HashMap<AttributeKey, Bag>,
    content: HashMap<Category, serde_json::Value>,
    return_applicable_policies: bool,
}

impl DecisionRequestBuilder {
    /// Adds an attribute bag without an issuer. An existing bag under the
    /// same key is replaced.
    pub fn attribute(
        mut self,
        category: Category,
        attribute_id: AttributeId,
        bag: Bag,
    ) -> Self {
        self.attributes.insert(
            AttributeKey {
                category,
                attribute_id,
                issuer: None,
            },
            bag,
        );
        self
    }

    /// Adds an attribute bag with an explicit issuer.
    pub fn issued_attribute(
        mut self,
        category: Category,
        attribute_id: AttributeId,
        issuer: impl Into<String>,
        bag: Bag,
    ) -> Self {
        self.attributes.insert(
            AttributeKey {
                category,
                attribute_id,
                issuer: Some(issuer.into()),
            },
            bag,
        );
        self
    }

    /// Attaches structured content to a category.
    pub fn content(mut self, category: Category, content: serde_json::Value) -> Self {
        self.content.insert(category, content);
        self
    }

    /// Requests the applicable-policy list in the decision result.
    pub fn return_applicable_policies(mut self, enabled: bool) -> Self {
        self.return_applicable_policies = enabled;
        self
    }

    pub fn build(self) -> DecisionRequest {
        DecisionRequest {
            attributes: self.attributes,
            content: self.content,
            return_applicable_policies: self.return_applicable_policies,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{AttributeValue, Datatype};

    #[test]
    fn builder_collects_attributes_by_key() {
        let request = DecisionRequest::builder()
            .attribute(
                Category::access_subject(),
                AttributeId::new(AttributeId::SUBJECT_ID),
                Bag::of(AttributeValue::from("alice")),
            )
            .issued_attribute(
                Category::access_subject(),
                AttributeId::new("clearance"),
                "hr-system",
                Bag::of(AttributeValue::from(3)),
            )
            .build();

        let category = Category::access_subject();
        let subject_id = AttributeId::new(AttributeId::SUBJECT_ID);
        let matches: Vec<_> = request
            .attributes_matching(&category, &subject_id)
            .collect();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].1.datatype(), Datatype::String);

        let clearance = AttributeId::new("clearance");
        let issued: Vec<_> = request
            .attributes_matching(&category, &clearance)
            .collect();
        assert_eq!(issued[0].0.issuer.as_deref(), Some("hr-system"));
    }

    #[test]
    fn applicable_policies_flag_defaults_off() {
        let request = DecisionRequest::builder().build();
        assert!(!request.applicable_policies_requested());

        let request = DecisionRequest::builder()
            .return_applicable_policies(true)
            .build();
        assert!(request.applicable_policies_requested());
    }

    #[test]
    fn content_is_per_category() {
        let request = DecisionRequest::builder()
            .content(
                Category::resource(),
                serde_json::json!({"record": {"owner": "alice"}}),
            )
            .build();
        assert!(request.content(&Category::resource()).is_some());
        assert!(request.content(&Category::action()).is_none());
    }
}
