//! ---
//! dbr_section: "02-tuple-space"
//! dbr_subsection: "module"
//! dbr_type: "source"
//! dbr_scope: "code"
//! dbr_description: "Storage backend interface and implementations."
//! dbr_version: "v0.0.0-prealpha"
//! dbr_owner: "tbd"
//! ---
//! Storage backends are reached only through the traits in this module.
//! One implementation exists per storage technology; the client never
//! depends on a concrete backend.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;

use crate::error::{DbrError, Result};
use crate::matching::MatchTemplate;
use crate::types::{
    Capabilities, ClusterStatus, Group, NamespaceId, NamespaceInfo, PersistenceLevel,
    TupleSelector,
};

pub mod memory;

pub use memory::{MemoryBackend, MemoryLimits};

/// Whether a fetch removes the matched tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    Consume,
    Peek,
}

/// Tuple returned by a fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedTuple {
    pub name: String,
    pub payload: Bytes,
}

/// Namespace lifecycle operations.
#[async_trait]
pub trait NamespaceOps: Send + Sync {
    /// Create a namespace holding one reference for the creator.
    async fn create_namespace(
        &self,
        name: &str,
        level: PersistenceLevel,
        groups: &[Group],
    ) -> Result<NamespaceId>;

    /// Add a reference to an existing namespace.
    async fn attach_namespace(&self, name: &str) -> Result<NamespaceId>;

    /// Drop one reference.
    async fn detach_namespace(&self, id: NamespaceId) -> Result<()>;

    /// Destroy a namespace that at most one handle still references.
    async fn delete_namespace(&self, name: &str) -> Result<NamespaceId>;

    async fn describe_namespace(&self, id: NamespaceId) -> Result<NamespaceInfo>;
}

/// Tuple storage operations. All of them are atomic with respect to each other.
#[async_trait]
pub trait TupleOps: Send + Sync {
    async fn insert(&self, ns: NamespaceId, group: &Group, name: &str, payload: Bytes)
        -> Result<()>;

    /// Return one matching tuple, failing UNAVAIL when none matches and UBUFFER
    /// (leaving the tuple in place) when it exceeds `capacity`.
    async fn fetch(
        &self,
        ns: NamespaceId,
        group: &Group,
        selector: &TupleSelector,
        capacity: usize,
        mode: FetchMode,
    ) -> Result<FetchedTuple>;

    async fn contains(&self, ns: NamespaceId, group: &Group, name: &str) -> Result<bool>;

    /// Distinct matching names; `limit == 0` means unlimited.
    async fn list(
        &self,
        ns: NamespaceId,
        group: &Group,
        template: &MatchTemplate,
        limit: usize,
    ) -> Result<Vec<String>>;

    /// Move one matching tuple, all-or-nothing.
    async fn relocate(
        &self,
        src: NamespaceId,
        src_group: &Group,
        selector: &TupleSelector,
        dst: NamespaceId,
        dst_group: &Group,
    ) -> Result<()>;

    async fn discard(&self, ns: NamespaceId, group: &Group, selector: &TupleSelector)
        -> Result<()>;

    /// Change feed for the namespace; the value advances on every insert.
    /// The sender closes when the namespace is deleted.
    fn watch(&self, ns: NamespaceId) -> Result<watch::Receiver<u64>>;
}

/// View of the cluster beneath the backend.
pub trait ClusterControl: Send + Sync {
    fn cluster_status(&self) -> ClusterStatus;
}

/// A complete storage backend.
#[async_trait]
pub trait Backend: NamespaceOps + TupleOps + ClusterControl + fmt::Debug {
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities {
        Capabilities::empty()
    }

    /// Server-side evaluation of a tuple with a remote function reference.
    async fn evaluate(
        &self,
        _ns: NamespaceId,
        _group: &Group,
        _name: &str,
        _payload: Bytes,
        _function: &str,
    ) -> Result<()> {
        Err(DbrError::NotImplemented("eval"))
    }

    async fn add_units(&self, _ns: NamespaceId, _units: &[String]) -> Result<()> {
        Err(DbrError::NotImplemented("add_units"))
    }

    async fn remove_units(&self, _ns: NamespaceId, _units: &[String]) -> Result<()> {
        Err(DbrError::NotImplemented("remove_units"))
    }
}
