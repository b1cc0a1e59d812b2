//! ---
//! dbr_section: "02-tuple-space"
//! dbr_subsection: "module"
//! dbr_type: "source"
//! dbr_scope: "code"
//! dbr_description: "Namespace, group, and tuple vocabulary."
//! dbr_version: "v0.0.0-prealpha"
//! dbr_owner: "tbd"
//! ---
use std::fmt;

use bitflags::bitflags;
use dbr_common::{ClusterPhase, MAX_KEY_LEN};
use serde::{Deserialize, Serialize};

use crate::error::{DbrError, Result};
use crate::matching::MatchTemplate;

/// Durability and fault-tolerance tier fixed at namespace creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PersistenceLevel {
    VolatileSimple,
    VolatileFaultTolerant,
    TemporarySimple,
    TemporaryFaultTolerant,
    PermanentSimple,
    PermanentFaultTolerant,
}

impl PersistenceLevel {
    pub fn is_fault_tolerant(self) -> bool {
        matches!(
            self,
            PersistenceLevel::VolatileFaultTolerant
                | PersistenceLevel::TemporaryFaultTolerant
                | PersistenceLevel::PermanentFaultTolerant
        )
    }

    /// Whether tuples survive a backend snapshot/restore cycle.
    pub fn is_permanent(self) -> bool {
        matches!(
            self,
            PersistenceLevel::PermanentSimple | PersistenceLevel::PermanentFaultTolerant
        )
    }
}

/// Sub-partition of a namespace; the empty group is the default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Group(String);

impl Group {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_default(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_default() {
            f.write_str("<default>")
        } else {
            f.write_str(&self.0)
        }
    }
}

impl From<&str> for Group {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

bitflags! {
    /// Per-call behaviour flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct OpFlags: u32 {
        /// Fail immediately instead of blocking when nothing matches.
        const NOWAIT = 0b0000_0001;
    }
}

bitflags! {
    /// Observable namespace state returned by `query`, also used as the filter mask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct NamespaceState: u32 {
        /// The namespace exists in the backend.
        const EXISTS = 0b0000_0001;
        /// More than one handle is attached.
        const SHARED = 0b0000_0010;
        /// At least one tuple is stored.
        const POPULATED = 0b0000_0100;
        /// The persistence level is fault tolerant.
        const FAULT_TOLERANT = 0b0000_1000;
        /// The persistence level is permanent.
        const PERSISTENT = 0b0001_0000;
        /// The cluster beneath the backend accepts client traffic.
        const CLUSTER_READY = 0b0010_0000;
    }
}

bitflags! {
    /// Optional features a backend advertises.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Capabilities: u32 {
        /// Server-side evaluation of submitted tuples.
        const EVAL = 0b0000_0001;
        /// Adding or removing storage units at runtime.
        const UNITS = 0b0000_0010;
        /// Durable snapshots of permanent namespaces.
        const SNAPSHOT = 0b0000_0100;
    }
}

/// Backend-level identity of a namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NamespaceId(pub u64);

impl fmt::Display for NamespaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ns-{}", self.0)
    }
}

/// Client handle issued by one successful `create` or `attach`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NamespaceHandle(pub(crate) u64);

impl fmt::Display for NamespaceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

/// How a tuple is selected: by exact name, by template, or exact name first then template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TupleSelector {
    name: Option<String>,
    template: Option<MatchTemplate>,
}

impl TupleSelector {
    /// Select tuples carrying exactly `name`.
    pub fn exact(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            template: None,
        }
    }

    /// Select any tuple whose name matches `template`.
    pub fn template(template: MatchTemplate) -> Self {
        Self {
            name: None,
            template: Some(template),
        }
    }

    /// Build a selector from the wire form: an optional name and a possibly empty template.
    pub fn from_parts(name: &str, template: &str) -> Result<Self> {
        let name = (!name.is_empty()).then(|| name.to_owned());
        let template = MatchTemplate::parse_optional(template)?;
        let selector = Self { name, template };
        selector.validate()?;
        Ok(selector)
    }

    /// Fall back to `template` when no tuple carries the exact name.
    pub fn or_template(mut self, template: MatchTemplate) -> Self {
        self.template = Some(template);
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn template_ref(&self) -> Option<&MatchTemplate> {
        self.template.as_ref()
    }

    pub fn validate(&self) -> Result<()> {
        match (&self.name, &self.template) {
            (None, None) => Err(DbrError::Invalid(
                "either a tuple name or a match template is required".into(),
            )),
            (Some(name), _) => validate_key(name, "tuple name"),
            (None, Some(_)) => Ok(()),
        }
    }
}

impl fmt::Display for TupleSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.name, &self.template) {
            (Some(name), Some(template)) => write!(f, "{name}|{template}"),
            (Some(name), None) => f.write_str(name),
            (None, Some(template)) => write!(f, "{template}"),
            (None, None) => f.write_str("<none>"),
        }
    }
}

/// Snapshot of backend-side namespace bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceInfo {
    pub id: NamespaceId,
    pub name: String,
    pub level: PersistenceLevel,
    pub groups: Vec<Group>,
    pub references: usize,
    pub tuples: usize,
}

/// Cluster state as seen from the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterStatus {
    pub phase: ClusterPhase,
    pub nodes: usize,
}

impl ClusterStatus {
    pub fn is_ready(&self) -> bool {
        self.phase.serves_clients()
    }
}

/// Result of a `directory` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Directory {
    pub names: Vec<String>,
    /// Bytes of the caller buffer used by the newline-delimited listing.
    pub bytes_used: usize,
}

impl Directory {
    /// Newline-delimited form written into the caller buffer.
    pub fn to_listing(&self) -> String {
        let mut listing = String::with_capacity(self.bytes_used);
        for name in &self.names {
            listing.push_str(name);
            listing.push('\n');
        }
        listing
    }
}

/// Reject empty and oversized keys.
pub fn validate_key(key: &str, what: &str) -> Result<()> {
    if key.is_empty() {
        return Err(DbrError::Invalid(format!("{what} must not be empty")));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(DbrError::Invalid(format!(
            "{what} exceeds {MAX_KEY_LEN} bytes ({} bytes)",
            key.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_requires_name_or_template() {
        assert!(TupleSelector::from_parts("", "").is_err());
        let selector = TupleSelector::from_parts("k1", "").expect("exact selector");
        assert_eq!(selector.name(), Some("k1"));
        assert!(selector.template_ref().is_none());
        let selector = TupleSelector::from_parts("", "k*").expect("template selector");
        assert!(selector.name().is_none());
        assert!(selector.template_ref().is_some());
    }

    #[test]
    fn oversized_keys_are_invalid() {
        let long = "x".repeat(MAX_KEY_LEN + 1);
        assert!(matches!(
            validate_key(&long, "tuple name"),
            Err(DbrError::Invalid(_))
        ));
        assert!(validate_key(&"x".repeat(MAX_KEY_LEN), "tuple name").is_ok());
    }

    #[test]
    fn directory_listing_is_newline_delimited() {
        let dir = Directory {
            names: vec!["k1".into(), "k2".into()],
            bytes_used: 6,
        };
        assert_eq!(dir.to_listing(), "k1\nk2\n");
    }

    #[test]
    fn persistence_tiers() {
        assert!(PersistenceLevel::PermanentFaultTolerant.is_permanent());
        assert!(PersistenceLevel::PermanentFaultTolerant.is_fault_tolerant());
        assert!(!PersistenceLevel::VolatileSimple.is_permanent());
        assert!(!PersistenceLevel::TemporarySimple.is_fault_tolerant());
    }
}
