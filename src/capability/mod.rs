//! Capability tokens and their resource constraints.
//!
//! A token is an immutable grant of one named permission, optionally scoped
//! to a set of resource patterns. Tokens are handed to the kernel by a trusted
//! issuer and never change afterwards.

mod pattern;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

pub use pattern::ResourcePattern;

/// Permission class such as `file.read` or `net.http`.
///
/// The dotted convention has no structural meaning to the kernel.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilityType(String);

impl CapabilityType {
    /// Wildcard type held by the universal token.
    pub const UNIVERSAL: &'static str = "*";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Validated constructor for names coming from configuration.
    pub fn parse(name: &str) -> Result<Self> {
        static NAME_RE: OnceLock<regex::Regex> = OnceLock::new();
        let re = NAME_RE.get_or_init(|| {
            regex::Regex::new(r"^[a-z0-9_]{1,64}(\.[a-z0-9_]{1,64}){0,7}$")
                .expect("capability name regex is valid")
        });
        let name = name.trim();
        if name == Self::UNIVERSAL || re.is_match(name) {
            return Ok(Self(name.to_string()));
        }
        Err(anyhow!(
            "capability name '{}' must be dotted lowercase segments (e.g. file.read)",
            name
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_universal(&self) -> bool {
        self.0 == Self::UNIVERSAL
    }
}

impl std::fmt::Display for CapabilityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CapabilityType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Ordered set of resource patterns. Empty means unconstrained.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityConstraint {
    patterns: Vec<ResourcePattern>,
}

impl CapabilityConstraint {
    pub fn new(patterns: Vec<ResourcePattern>) -> Self {
        let mut unique: Vec<ResourcePattern> = Vec::with_capacity(patterns.len());
        for p in patterns {
            if !unique.contains(&p) {
                unique.push(p);
            }
        }
        Self { patterns: unique }
    }

    pub fn parse<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let compiled = patterns
            .iter()
            .map(|p| ResourcePattern::new(p.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(compiled))
    }

    pub fn patterns(&self) -> &[ResourcePattern] {
        &self.patterns
    }

    pub fn is_unconstrained(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn is_satisfied_by(&self, resource: &str) -> bool {
        self.is_unconstrained() || self.patterns.iter().any(|p| p.matches(resource))
    }
}

/// Immutable grant of a named permission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapabilityToken {
    capability_type: CapabilityType,
    constraint: Option<CapabilityConstraint>,
}

impl CapabilityToken {
    pub fn new(capability_type: CapabilityType, constraint: Option<CapabilityConstraint>) -> Self {
        Self {
            capability_type,
            constraint,
        }
    }

    pub fn unconstrained(capability_type: impl Into<CapabilityType>) -> Self {
        Self::new(capability_type.into(), None)
    }

    /// Token restricted to the given glob patterns.
    pub fn scoped<S: AsRef<str>>(
        capability_type: impl Into<CapabilityType>,
        patterns: &[S],
    ) -> Result<Self> {
        Ok(Self::new(
            capability_type.into(),
            Some(CapabilityConstraint::parse(patterns)?),
        ))
    }

    /// Token satisfying every capability type. Only for explicitly
    /// unrestricted (trusted or test) environments.
    pub fn universal() -> Self {
        Self::unconstrained(CapabilityType::new(CapabilityType::UNIVERSAL))
    }

    pub fn capability_type(&self) -> &CapabilityType {
        &self.capability_type
    }

    pub fn constraint(&self) -> Option<&CapabilityConstraint> {
        self.constraint.as_ref()
    }

    pub fn is_unconstrained(&self) -> bool {
        self.constraint
            .as_ref()
            .map_or(true, CapabilityConstraint::is_unconstrained)
    }

    /// With no resource, only an unconstrained token matches. With a
    /// resource, it must satisfy at least one pattern.
    pub fn matches(&self, resource: Option<&str>) -> bool {
        match (resource, &self.constraint) {
            (None, _) => self.is_unconstrained(),
            (Some(_), None) => true,
            (Some(resource), Some(constraint)) => constraint.is_satisfied_by(resource),
        }
    }
}
