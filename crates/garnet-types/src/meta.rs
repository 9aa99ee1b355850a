//! Policy identity, versioning, and reference metadata.
//!
//! Policies are identified by kind (Policy vs PolicySet), id, and a dotted
//! numeric [`PolicyVersion`]. References select versions through
//! [`PolicyVersionPatterns`], whose patterns support the XACML wildcards
//! `*` (any single number) and `+` (any number sequence).

use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Policy identity
// ============================================================================

/// Unique identifier of a policy or policy set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PolicyId(String);

impl PolicyId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PolicyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PolicyId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Whether a top-level policy element is a Policy or a PolicySet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PolicyKind {
    Policy,
    PolicySet,
}

impl Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Policy => write!(f, "Policy"),
            Self::PolicySet => write!(f, "PolicySet"),
        }
    }
}

// ============================================================================
// PolicyVersion
// ============================================================================

/// A dotted numeric policy version, totally ordered component-wise.
///
/// # Examples
///
/// ```
/// # use garnet_types::PolicyVersion;
/// let a: PolicyVersion = "1.2".parse().unwrap();
/// let b: PolicyVersion = "1.10".parse().unwrap();
/// assert!(a < b);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PolicyVersion(Vec<u64>);

impl PolicyVersion {
    /// Returns the version components.
    pub fn components(&self) -> &[u64] {
        &self.0
    }
}

impl FromStr for PolicyVersion {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(VersionError::Invalid(s.to_string()));
        }
        let components = s
            .split('.')
            .map(|part| {
                part.parse::<u64>()
                    .map_err(|_| VersionError::Invalid(s.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self(components))
    }
}

impl Display for PolicyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for c in &self.0 {
            if !first {
                write!(f, ".")?;
            }
            write!(f, "{c}")?;
            first = false;
        }
        Ok(())
    }
}

/// Errors parsing versions and version patterns.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VersionError {
    #[error("invalid policy version '{0}'")]
    Invalid(String),

    #[error("invalid version match pattern '{0}'")]
    InvalidPattern(String),
}

// ============================================================================
// VersionPattern
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
enum PatternSegment {
    Literal(u64),
    /// `*`: any single number at this position.
    AnyOne,
    /// `+`: any sequence of numbers, including the empty sequence.
    AnySeq,
}

/// An XACML version match pattern, e.g. `1.2.*` or `1.+`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionPattern(Vec<PatternSegment>);

impl VersionPattern {
    /// Whether `version` matches this pattern exactly.
    pub fn matches(&self, version: &PolicyVersion) -> bool {
        Self::match_segments(&self.0, version.components())
    }

    fn match_segments(pattern: &[PatternSegment], version: &[u64]) -> bool {
        match pattern.first() {
            None => version.is_empty(),
            Some(PatternSegment::Literal(n)) => {
                version.first() == Some(n) && Self::match_segments(&pattern[1..], &version[1..])
            }
            Some(PatternSegment::AnyOne) => {
                !version.is_empty() && Self::match_segments(&pattern[1..], &version[1..])
            }
            Some(PatternSegment::AnySeq) => {
                (0..=version.len()).any(|k| Self::match_segments(&pattern[1..], &version[k..]))
            }
        }
    }

    /// Whether `version` is equal to or later than the earliest version
    /// this pattern can match (EarliestVersion constraint).
    pub fn matches_earliest(&self, version: &PolicyVersion) -> bool {
        let v = version.components();
        for (i, seg) in self.0.iter().enumerate() {
            match seg {
                // wildcard sequence: minimal instantiation is empty
                PatternSegment::AnySeq => return true,
                // wildcard number: minimal instantiation is 0; a greater
                // component decides, zero ties and the comparison moves
                // on to the remaining segments
                PatternSegment::AnyOne => match v.get(i) {
                    None => return false,
                    Some(0) => {}
                    Some(_) => return true,
                },
                PatternSegment::Literal(n) => match v.get(i) {
                    None => return false,
                    Some(x) if x > n => return true,
                    Some(x) if x < n => return false,
                    _ => {}
                },
            }
        }
        // equal prefix; equal-or-longer version is later-or-equal
        true
    }

    /// Whether `version` is equal to or earlier than the latest version
    /// this pattern can match (LatestVersion constraint).
    pub fn matches_latest(&self, version: &PolicyVersion) -> bool {
        let v = version.components();
        for (i, seg) in self.0.iter().enumerate() {
            match seg {
                // wildcards are unbounded from here on
                PatternSegment::AnySeq | PatternSegment::AnyOne => return true,
                PatternSegment::Literal(n) => match v.get(i) {
                    // shorter version orders before its extensions
                    None => return true,
                    Some(x) if x < n => return true,
                    Some(x) if x > n => return false,
                    _ => {}
                },
            }
        }
        v.len() <= self.0.len()
    }
}

impl FromStr for VersionPattern {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(VersionError::InvalidPattern(s.to_string()));
        }
        let segments = s
            .split('.')
            .map(|part| match part {
                "*" => Ok(PatternSegment::AnyOne),
                "+" => Ok(PatternSegment::AnySeq),
                _ => part
                    .parse::<u64>()
                    .map(PatternSegment::Literal)
                    .map_err(|_| VersionError::InvalidPattern(s.to_string())),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self(segments))
    }
}

impl Display for VersionPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for seg in &self.0 {
            if !first {
                write!(f, ".")?;
            }
            match seg {
                PatternSegment::Literal(n) => write!(f, "{n}")?,
                PatternSegment::AnyOne => write!(f, "*")?,
                PatternSegment::AnySeq => write!(f, "+")?,
            }
            first = false;
        }
        Ok(())
    }
}

// ============================================================================
// PolicyVersionPatterns
// ============================================================================

/// Version constraints on a policy reference: optional exact, earliest,
/// and latest patterns. An absent constraint always matches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PolicyVersionPatterns {
    pub exact: Option<VersionPattern>,
    pub earliest: Option<VersionPattern>,
    pub latest: Option<VersionPattern>,
}

impl PolicyVersionPatterns {
    /// The unconstrained pattern set (matches every version).
    pub fn any() -> Self {
        Self::default()
    }

    /// Constrains to an exact pattern.
    pub fn exact(pattern: VersionPattern) -> Self {
        Self {
            exact: Some(pattern),
            ..Self::default()
        }
    }

    /// Whether `version` satisfies every present constraint.
    pub fn matches(&self, version: &PolicyVersion) -> bool {
        self.exact.as_ref().is_none_or(|p| p.matches(version))
            && self
                .earliest
                .as_ref()
                .is_none_or(|p| p.matches_earliest(version))
            && self
                .latest
                .as_ref()
                .is_none_or(|p| p.matches_latest(version))
    }
}

impl Display for PolicyVersionPatterns {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut wrote = false;
        if let Some(p) = &self.exact {
            write!(f, "Version={p}")?;
            wrote = true;
        }
        if let Some(p) = &self.earliest {
            if wrote {
                write!(f, ", ")?;
            }
            write!(f, "EarliestVersion={p}")?;
            wrote = true;
        }
        if let Some(p) = &self.latest {
            if wrote {
                write!(f, ", ")?;
            }
            write!(f, "LatestVersion={p}")?;
            wrote = true;
        }
        if !wrote {
            write!(f, "Version=any")?;
        }
        Ok(())
    }
}

// ============================================================================
// PrimaryPolicyMetadata
// ============================================================================

/// The identity of a compiled policy: kind, id, and version.
///
/// The display form is stable and used as a cache discriminator and in
/// logs: `Policy[id#v1.0]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrimaryPolicyMetadata {
    pub kind: PolicyKind,
    pub id: PolicyId,
    pub version: PolicyVersion,
}

impl PrimaryPolicyMetadata {
    pub fn new(kind: PolicyKind, id: PolicyId, version: PolicyVersion) -> Self {
        Self { kind, id, version }
    }
}

impl Display for PrimaryPolicyMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}#v{}]", self.kind, self.id, self.version)
    }
}

// ============================================================================
// PolicyRefsMetadata
// ============================================================================

/// Metadata about the references reachable from a policy set: the set of
/// referenced policies (insertion-ordered, unique by identity) and the
/// longest chain of policy ids traversed through references, used for
/// depth enforcement.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PolicyRefsMetadata {
    ref_policies: Vec<PrimaryPolicyMetadata>,
    longest_ref_chain: Vec<PolicyId>,
}

impl PolicyRefsMetadata {
    pub fn new(
        ref_policies: Vec<PrimaryPolicyMetadata>,
        longest_ref_chain: Vec<PolicyId>,
    ) -> Self {
        Self {
            ref_policies,
            longest_ref_chain,
        }
    }

    pub fn ref_policies(&self) -> &[PrimaryPolicyMetadata] {
        &self.ref_policies
    }

    pub fn longest_ref_chain(&self) -> &[PolicyId] {
        &self.longest_ref_chain
    }

    pub fn is_empty(&self) -> bool {
        self.ref_policies.is_empty() && self.longest_ref_chain.is_empty()
    }

    /// Adds a referenced policy, preserving insertion order and uniqueness.
    pub fn add_ref_policy(&mut self, meta: PrimaryPolicyMetadata) {
        if !self.ref_policies.contains(&meta) {
            self.ref_policies.push(meta);
        }
    }

    /// Merges a child's reference metadata into this one: unions the
    /// referenced-policy set and keeps the longer of the two chains.
    pub fn absorb(&mut self, child: &PolicyRefsMetadata) {
        for meta in &child.ref_policies {
            self.add_ref_policy(meta.clone());
        }
        if child.longest_ref_chain.len() > self.longest_ref_chain.len() {
            self.longest_ref_chain = child.longest_ref_chain.clone();
        }
    }

    /// Replaces the longest chain if `chain` is longer.
    pub fn update_longest_chain(&mut self, chain: &[PolicyId]) {
        if chain.len() > self.longest_ref_chain.len() {
            self.longest_ref_chain = chain.to_vec();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
