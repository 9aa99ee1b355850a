//! Typed attribute values and bags.
//!
//! An attribute value is a single typed datum taken from a decision request
//! or a policy literal. A [`Bag`] is an unordered collection (multiset) of
//! values sharing one [`Datatype`]; designators and selectors always
//! produce bags, possibly empty.

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Datatype
// ============================================================================

/// The primitive datatypes the engine evaluates over.
///
/// This is the subset of XACML 3.0 datatypes the core engine and its
/// standard match functions require. Extension datatypes are out of scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Datatype {
    String,
    Boolean,
    Integer,
    Double,
    AnyUri,
}

impl Display for Datatype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::String => "string",
            Self::Boolean => "boolean",
            Self::Integer => "integer",
            Self::Double => "double",
            Self::AnyUri => "anyURI",
        };
        write!(f, "{name}")
    }
}

// ============================================================================
// AttributeValue
// ============================================================================

/// A single typed attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "kebab-case")]
pub enum AttributeValue {
    String(String),
    Boolean(bool),
    Integer(i64),
    Double(f64),
    AnyUri(String),
}

impl AttributeValue {
    /// Returns the datatype of this value.
    pub fn datatype(&self) -> Datatype {
        match self {
            Self::String(_) => Datatype::String,
            Self::Boolean(_) => Datatype::Boolean,
            Self::Integer(_) => Datatype::Integer,
            Self::Double(_) => Datatype::Double,
            Self::AnyUri(_) => Datatype::AnyUri,
        }
    }

    /// Returns the boolean payload, or a type error.
    pub fn as_boolean(&self) -> Result<bool, ValueError> {
        match self {
            Self::Boolean(b) => Ok(*b),
            other => Err(ValueError::TypeMismatch {
                expected: Datatype::Boolean,
                actual: other.datatype(),
            }),
        }
    }

    /// Returns the string payload, or a type error.
    pub fn as_string(&self) -> Result<&str, ValueError> {
        match self {
            Self::String(s) => Ok(s),
            other => Err(ValueError::TypeMismatch {
                expected: Datatype::String,
                actual: other.datatype(),
            }),
        }
    }

    /// Returns the integer payload, or a type error.
    pub fn as_integer(&self) -> Result<i64, ValueError> {
        match self {
            Self::Integer(i) => Ok(*i),
            other => Err(ValueError::TypeMismatch {
                expected: Datatype::Integer,
                actual: other.datatype(),
            }),
        }
    }
}

impl Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) | Self::AnyUri(s) => write!(f, "{s}"),
            Self::Boolean(b) => write!(f, "{b}"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Double(d) => write!(f, "{d}"),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

// ============================================================================
// Bag
// ============================================================================

/// An unordered multiset of attribute values sharing one datatype.
///
/// Bags are the result type of attribute designators and selectors. An
/// empty bag still carries a datatype so type checking stays total.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bag {
    datatype: Datatype,
    values: Vec<AttributeValue>,
}

impl Bag {
    /// Creates a bag from values, checking that every value matches
    /// `datatype`.
    pub fn new(datatype: Datatype, values: Vec<AttributeValue>) -> Result<Self, ValueError> {
        for v in &values {
            if v.datatype() != datatype {
                return Err(ValueError::MixedBag {
                    expected: datatype,
                    actual: v.datatype(),
                });
            }
        }
        Ok(Self { datatype, values })
    }

    /// Creates an empty bag of the given datatype.
    pub fn empty(datatype: Datatype) -> Self {
        Self {
            datatype,
            values: Vec::new(),
        }
    }

    /// Creates a singleton bag from one value.
    pub fn of(value: AttributeValue) -> Self {
        Self {
            datatype: value.datatype(),
            values: vec![value],
        }
    }

    pub fn datatype(&self) -> Datatype {
        self.datatype
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, AttributeValue> {
        self.values.iter()
    }

    /// Returns the sole element of a singleton bag.
    ///
    /// Functions with single-value parameters use this to unwrap implicit
    /// bag-to-value coercions; any other arity is an error.
    pub fn single(&self) -> Result<&AttributeValue, ValueError> {
        match self.values.as_slice() {
            [v] => Ok(v),
            _ => Err(ValueError::NotSingleton { len: self.len() }),
        }
    }

    pub fn contains(&self, value: &AttributeValue) -> bool {
        self.values.iter().any(|v| v == value)
    }
}

impl<'a> IntoIterator for &'a Bag {
    type Item = &'a AttributeValue;
    type IntoIter = std::slice::Iter<'a, AttributeValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.iter()
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors raised by value and bag typing rules.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValueError {
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: Datatype, actual: Datatype },

    #[error("bag of {expected} may not contain a {actual} value")]
    MixedBag { expected: Datatype, actual: Datatype },

    #[error("expected a singleton bag, got {len} values")]
    NotSingleton { len: usize },
}

// ============================================================================
// Tests
// ============================================================================
