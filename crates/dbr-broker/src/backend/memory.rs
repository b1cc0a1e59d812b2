//! ---
//! dbr_section: "02-tuple-space"
//! dbr_subsection: "module"
//! dbr_type: "source"
//! dbr_scope: "code"
//! dbr_description: "In-process tuple storage backend."
//! dbr_version: "v0.0.0-prealpha"
//! dbr_owner: "tbd"
//! ---
use std::collections::{HashMap, VecDeque};
use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use dbr_common::ClusterPhase;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info};

use super::{Backend, ClusterControl, FetchMode, FetchedTuple, NamespaceOps, TupleOps};
use crate::error::{DbrError, Result};
use crate::matching::MatchTemplate;
use crate::snapshot::{self, NamespaceImage, TupleImage};
use crate::types::{
    Capabilities, ClusterStatus, Group, NamespaceId, NamespaceInfo, PersistenceLevel,
    TupleSelector,
};

/// Resource ceilings enforced by [`MemoryBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryLimits {
    pub max_namespaces: usize,
    /// Total payload bytes across all namespaces; `None` means unbounded.
    pub max_bytes: Option<usize>,
}

impl Default for MemoryLimits {
    fn default() -> Self {
        Self {
            max_namespaces: 1024,
            max_bytes: None,
        }
    }
}

type GroupTuples = IndexMap<String, VecDeque<Bytes>>;

#[derive(Debug)]
struct NamespaceRecord {
    name: String,
    level: PersistenceLevel,
    groups: Vec<Group>,
    references: usize,
    tuples: HashMap<Group, GroupTuples>,
    changes: watch::Sender<u64>,
}

impl NamespaceRecord {
    fn new(name: &str, level: PersistenceLevel, groups: &[Group]) -> Self {
        let (changes, _) = watch::channel(0);
        let mut declared = vec![Group::default()];
        for group in groups {
            if !declared.contains(group) {
                declared.push(group.clone());
            }
        }
        Self {
            name: name.to_owned(),
            level,
            groups: declared,
            references: 1,
            tuples: HashMap::new(),
            changes,
        }
    }

    fn tuple_count(&self) -> usize {
        self.tuples
            .values()
            .flat_map(|group| group.values())
            .map(VecDeque::len)
            .sum()
    }

    fn payload_bytes(&self) -> usize {
        self.tuples
            .values()
            .flat_map(|group| group.values())
            .flat_map(|queue| queue.iter())
            .map(Bytes::len)
            .sum()
    }

    fn push(&mut self, group: &Group, name: &str, payload: Bytes) {
        if !self.groups.contains(group) {
            self.groups.push(group.clone());
        }
        self.tuples
            .entry(group.clone())
            .or_default()
            .entry(name.to_owned())
            .or_default()
            .push_back(payload);
        self.changes.send_modify(|version| *version = version.wrapping_add(1));
    }

    /// Name of the first stored tuple the selector picks.
    fn select(&self, group: &Group, selector: &TupleSelector) -> Option<String> {
        let tuples = self.tuples.get(group)?;
        if let Some(name) = selector.name() {
            if tuples.get(name).is_some_and(|queue| !queue.is_empty()) {
                return Some(name.to_owned());
            }
        }
        let template = selector.template_ref()?;
        tuples
            .iter()
            .find(|(name, queue)| !queue.is_empty() && template.matches(name))
            .map(|(name, _)| name.clone())
    }

    fn front(&self, group: &Group, name: &str) -> Option<&Bytes> {
        self.tuples.get(group)?.get(name)?.front()
    }

    fn pop(&mut self, group: &Group, name: &str) -> Option<Bytes> {
        let tuples = self.tuples.get_mut(group)?;
        let queue = tuples.get_mut(name)?;
        let payload = queue.pop_front();
        if queue.is_empty() {
            tuples.shift_remove(name);
        }
        payload
    }

    fn image(&self) -> NamespaceImage {
        let mut groups: Vec<&Group> = self.tuples.keys().collect();
        groups.sort();
        let tuples = groups
            .into_iter()
            .flat_map(|group| {
                self.tuples[group].iter().flat_map(move |(name, queue)| {
                    queue.iter().map(move |payload| TupleImage {
                        group: group.clone(),
                        name: name.clone(),
                        payload: payload.clone(),
                    })
                })
            })
            .collect();
        NamespaceImage {
            name: self.name.clone(),
            level: self.level,
            groups: self.groups.clone(),
            tuples,
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: u64,
    names: HashMap<String, NamespaceId>,
    spaces: HashMap<NamespaceId, NamespaceRecord>,
    bytes: usize,
}

impl MemoryState {
    fn record(&self, id: NamespaceId) -> Result<&NamespaceRecord> {
        self.spaces
            .get(&id)
            .ok_or_else(|| DbrError::NamespaceInvalid(id.to_string()))
    }

    fn record_mut(&mut self, id: NamespaceId) -> Result<&mut NamespaceRecord> {
        self.spaces
            .get_mut(&id)
            .ok_or_else(|| DbrError::NamespaceInvalid(id.to_string()))
    }

    fn allocate_id(&mut self) -> NamespaceId {
        self.next_id += 1;
        NamespaceId(self.next_id)
    }
}

#[derive(Debug, Clone)]
struct ClusterBinding {
    phase: watch::Receiver<ClusterPhase>,
    nodes: usize,
}

/// Tuple storage held entirely in process memory.
///
/// Every operation runs under one lock, so moves and destructive reads are
/// atomic with respect to concurrent clients. When bound to a cluster phase
/// feed, operations fail with NOCONNECT unless the cluster serves clients.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    limits: MemoryLimits,
    cluster: Option<ClusterBinding>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(limits: MemoryLimits) -> Self {
        Self {
            limits,
            ..Self::default()
        }
    }

    /// Gate client traffic on the phase published by a cluster orchestrator.
    pub fn bind_cluster(mut self, phase: watch::Receiver<ClusterPhase>, nodes: usize) -> Self {
        self.cluster = Some(ClusterBinding { phase, nodes });
        self
    }

    pub fn limits(&self) -> &MemoryLimits {
        &self.limits
    }

    /// Total payload bytes currently stored.
    pub fn bytes_used(&self) -> usize {
        self.state.lock().bytes
    }

    fn ensure_reachable(&self) -> Result<()> {
        match &self.cluster {
            Some(binding) => {
                let phase = *binding.phase.borrow();
                if phase.serves_clients() {
                    Ok(())
                } else {
                    Err(DbrError::NoConnect(format!("cluster is {phase}")))
                }
            }
            None => Ok(()),
        }
    }

    fn reserve(&self, state: &MemoryState, additional: usize) -> Result<()> {
        match self.limits.max_bytes {
            Some(max) if state.bytes + additional > max => Err(DbrError::NoMemory(format!(
                "storing {additional} bytes would exceed the {max} byte ceiling ({} in use)",
                state.bytes
            ))),
            _ => Ok(()),
        }
    }

    /// Write every permanent namespace to `path`. Returns the number of namespaces saved.
    pub fn save_snapshot(&self, path: &Path) -> Result<usize> {
        let images: Vec<NamespaceImage> = {
            let state = self.state.lock();
            let mut records: Vec<&NamespaceRecord> = state
                .spaces
                .values()
                .filter(|record| record.level.is_permanent())
                .collect();
            records.sort_by(|a, b| a.name.cmp(&b.name));
            records.into_iter().map(NamespaceRecord::image).collect()
        };
        snapshot::save_snapshot(&images, path)?;
        info!(path = %path.display(), namespaces = images.len(), "snapshot written");
        Ok(images.len())
    }

    /// Recreate namespaces from a snapshot. Fails without changes when any of
    /// them already exists or the ceilings would be exceeded.
    pub fn load_snapshot(&self, path: &Path) -> Result<usize> {
        let images = snapshot::load_snapshot(path)?;
        let mut state = self.state.lock();

        if let Some(clash) = images.iter().find(|image| state.names.contains_key(&image.name)) {
            return Err(DbrError::Exists(clash.name.clone()));
        }
        if state.names.len() + images.len() > self.limits.max_namespaces {
            return Err(DbrError::NoMemory(format!(
                "restoring {} namespaces would exceed the limit of {}",
                images.len(),
                self.limits.max_namespaces
            )));
        }
        let incoming: usize = images
            .iter()
            .flat_map(|image| image.tuples.iter())
            .map(|tuple| tuple.payload.len())
            .sum();
        self.reserve(&state, incoming)?;

        for image in &images {
            let id = state.allocate_id();
            let mut record = NamespaceRecord::new(&image.name, image.level, &image.groups);
            record.references = 0;
            for tuple in &image.tuples {
                record.push(&tuple.group, &tuple.name, tuple.payload.clone());
            }
            state.names.insert(image.name.clone(), id);
            state.spaces.insert(id, record);
        }
        state.bytes += incoming;
        info!(path = %path.display(), namespaces = images.len(), "snapshot restored");
        Ok(images.len())
    }
}

#[async_trait]
impl NamespaceOps for MemoryBackend {
    async fn create_namespace(
        &self,
        name: &str,
        level: PersistenceLevel,
        groups: &[Group],
    ) -> Result<NamespaceId> {
        self.ensure_reachable()?;
        let mut state = self.state.lock();
        if state.names.contains_key(name) {
            return Err(DbrError::Exists(name.to_owned()));
        }
        if state.names.len() >= self.limits.max_namespaces {
            return Err(DbrError::NoMemory(format!(
                "namespace limit of {} reached",
                self.limits.max_namespaces
            )));
        }
        let id = state.allocate_id();
        state.names.insert(name.to_owned(), id);
        state
            .spaces
            .insert(id, NamespaceRecord::new(name, level, groups));
        debug!(namespace = name, %id, ?level, "namespace created");
        Ok(id)
    }

    async fn attach_namespace(&self, name: &str) -> Result<NamespaceId> {
        self.ensure_reachable()?;
        let mut state = self.state.lock();
        let id = *state.names.get(name).ok_or(DbrError::Unavailable)?;
        let record = state.record_mut(id)?;
        record.references += 1;
        debug!(namespace = name, %id, references = record.references, "namespace attached");
        Ok(id)
    }

    async fn detach_namespace(&self, id: NamespaceId) -> Result<()> {
        let mut state = self.state.lock();
        let record = state.record_mut(id)?;
        record.references = record.references.saturating_sub(1);
        debug!(namespace = %record.name, %id, references = record.references, "namespace detached");
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<NamespaceId> {
        self.ensure_reachable()?;
        let mut state = self.state.lock();
        let id = *state.names.get(name).ok_or(DbrError::Unavailable)?;
        let references = state.record(id)?.references;
        if references > 1 {
            return Err(DbrError::NamespaceBusy {
                name: name.to_owned(),
                references,
            });
        }
        state.names.remove(name);
        if let Some(record) = state.spaces.remove(&id) {
            state.bytes = state.bytes.saturating_sub(record.payload_bytes());
        }
        debug!(namespace = name, %id, "namespace deleted");
        Ok(id)
    }

    async fn describe_namespace(&self, id: NamespaceId) -> Result<NamespaceInfo> {
        let state = self.state.lock();
        let record = state.record(id)?;
        Ok(NamespaceInfo {
            id,
            name: record.name.clone(),
            level: record.level,
            groups: record.groups.clone(),
            references: record.references,
            tuples: record.tuple_count(),
        })
    }
}

#[async_trait]
impl TupleOps for MemoryBackend {
    async fn insert(
        &self,
        ns: NamespaceId,
        group: &Group,
        name: &str,
        payload: Bytes,
    ) -> Result<()> {
        self.ensure_reachable()?;
        let mut state = self.state.lock();
        state.record(ns)?;
        self.reserve(&state, payload.len())?;
        state.bytes += payload.len();
        state.record_mut(ns)?.push(group, name, payload);
        Ok(())
    }

    async fn fetch(
        &self,
        ns: NamespaceId,
        group: &Group,
        selector: &TupleSelector,
        capacity: usize,
        mode: FetchMode,
    ) -> Result<FetchedTuple> {
        self.ensure_reachable()?;
        let mut state = self.state.lock();
        let record = state.record_mut(ns)?;
        let name = record
            .select(group, selector)
            .ok_or(DbrError::Unavailable)?;
        let size = record.front(group, &name).map(Bytes::len).unwrap_or(0);
        if size > capacity {
            return Err(DbrError::UserBuffer {
                provided: capacity,
                required: size,
            });
        }
        let payload = match mode {
            FetchMode::Peek => record.front(group, &name).cloned(),
            FetchMode::Consume => record.pop(group, &name),
        }
        .ok_or(DbrError::Unavailable)?;
        if mode == FetchMode::Consume {
            state.bytes = state.bytes.saturating_sub(payload.len());
        }
        Ok(FetchedTuple { name, payload })
    }

    async fn contains(&self, ns: NamespaceId, group: &Group, name: &str) -> Result<bool> {
        self.ensure_reachable()?;
        let state = self.state.lock();
        Ok(state
            .record(ns)?
            .front(group, name)
            .is_some())
    }

    async fn list(
        &self,
        ns: NamespaceId,
        group: &Group,
        template: &MatchTemplate,
        limit: usize,
    ) -> Result<Vec<String>> {
        self.ensure_reachable()?;
        let state = self.state.lock();
        let record = state.record(ns)?;
        let Some(tuples) = record.tuples.get(group) else {
            return Ok(Vec::new());
        };
        let matching = tuples
            .iter()
            .filter(|(name, queue)| !queue.is_empty() && template.matches(name))
            .map(|(name, _)| name.clone());
        Ok(if limit == 0 {
            matching.collect()
        } else {
            matching.take(limit).collect()
        })
    }

    async fn relocate(
        &self,
        src: NamespaceId,
        src_group: &Group,
        selector: &TupleSelector,
        dst: NamespaceId,
        dst_group: &Group,
    ) -> Result<()> {
        self.ensure_reachable()?;
        let mut state = self.state.lock();
        state.record(dst)?;
        let source = state.record_mut(src)?;
        let name = source
            .select(src_group, selector)
            .ok_or(DbrError::Unavailable)?;
        let payload = source
            .pop(src_group, &name)
            .ok_or(DbrError::Unavailable)?;
        state.record_mut(dst)?.push(dst_group, &name, payload);
        debug!(tuple = %name, %src, %dst, "tuple moved");
        Ok(())
    }

    async fn discard(
        &self,
        ns: NamespaceId,
        group: &Group,
        selector: &TupleSelector,
    ) -> Result<()> {
        self.ensure_reachable()?;
        let mut state = self.state.lock();
        let record = state.record_mut(ns)?;
        let name = record
            .select(group, selector)
            .ok_or(DbrError::Unavailable)?;
        let payload = record.pop(group, &name).ok_or(DbrError::Unavailable)?;
        state.bytes = state.bytes.saturating_sub(payload.len());
        Ok(())
    }

    fn watch(&self, ns: NamespaceId) -> Result<watch::Receiver<u64>> {
        Ok(self.state.lock().record(ns)?.changes.subscribe())
    }
}

impl ClusterControl for MemoryBackend {
    fn cluster_status(&self) -> ClusterStatus {
        match &self.cluster {
            Some(binding) => ClusterStatus {
                phase: *binding.phase.borrow(),
                nodes: binding.nodes,
            },
            None => ClusterStatus {
                phase: ClusterPhase::Ready,
                nodes: 1,
            },
        }
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::SNAPSHOT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exact(name: &str) -> TupleSelector {
        TupleSelector::exact(name)
    }

    #[tokio::test]
    async fn same_name_tuples_are_fifo() {
        let backend = MemoryBackend::new();
        let ns = backend
            .create_namespace("fifo", PersistenceLevel::VolatileSimple, &[])
            .await
            .unwrap();
        let g = Group::default();
        backend.insert(ns, &g, "k", Bytes::from_static(b"one")).await.unwrap();
        backend.insert(ns, &g, "k", Bytes::from_static(b"two")).await.unwrap();

        let first = backend.fetch(ns, &g, &exact("k"), 64, FetchMode::Consume).await.unwrap();
        let second = backend.fetch(ns, &g, &exact("k"), 64, FetchMode::Consume).await.unwrap();
        assert_eq!(first.payload, Bytes::from_static(b"one"));
        assert_eq!(second.payload, Bytes::from_static(b"two"));
        assert_eq!(
            backend.fetch(ns, &g, &exact("k"), 64, FetchMode::Consume).await,
            Err(DbrError::Unavailable)
        );
        assert_eq!(backend.bytes_used(), 0);
    }

    #[tokio::test]
    async fn oversized_fetch_leaves_tuple_in_place() {
        let backend = MemoryBackend::new();
        let ns = backend
            .create_namespace("buf", PersistenceLevel::VolatileSimple, &[])
            .await
            .unwrap();
        let g = Group::default();
        backend.insert(ns, &g, "k", Bytes::from_static(b"0123456789")).await.unwrap();
        assert_eq!(
            backend.fetch(ns, &g, &exact("k"), 4, FetchMode::Consume).await,
            Err(DbrError::UserBuffer {
                provided: 4,
                required: 10
            })
        );
        assert!(backend.contains(ns, &g, "k").await.unwrap());
    }

    #[tokio::test]
    async fn byte_ceiling_rejects_insert() {
        let backend = MemoryBackend::with_limits(MemoryLimits {
            max_namespaces: 4,
            max_bytes: Some(8),
        });
        let ns = backend
            .create_namespace("small", PersistenceLevel::VolatileSimple, &[])
            .await
            .unwrap();
        let g = Group::default();
        backend.insert(ns, &g, "a", Bytes::from_static(b"12345")).await.unwrap();
        let err = backend
            .insert(ns, &g, "b", Bytes::from_static(b"12345"))
            .await
            .unwrap_err();
        assert!(matches!(err, DbrError::NoMemory(_)));
        assert_eq!(backend.bytes_used(), 5);
    }

    #[tokio::test]
    async fn namespace_ceiling_rejects_create() {
        let backend = MemoryBackend::with_limits(MemoryLimits {
            max_namespaces: 1,
            max_bytes: None,
        });
        backend
            .create_namespace("one", PersistenceLevel::VolatileSimple, &[])
            .await
            .unwrap();
        let err = backend
            .create_namespace("two", PersistenceLevel::VolatileSimple, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, DbrError::NoMemory(_)));
    }

    #[tokio::test]
    async fn unready_cluster_phase_blocks_traffic() {
        let (phase_tx, phase_rx) = watch::channel(ClusterPhase::Launching);
        let backend = MemoryBackend::new().bind_cluster(phase_rx, 3);
        let err = backend
            .create_namespace("early", PersistenceLevel::VolatileSimple, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, DbrError::NoConnect(_)));
        assert!(!backend.cluster_status().is_ready());

        phase_tx.send_replace(ClusterPhase::Ready);
        backend
            .create_namespace("early", PersistenceLevel::VolatileSimple, &[])
            .await
            .unwrap();
        assert_eq!(backend.cluster_status().nodes, 3);
    }

    #[tokio::test]
    async fn watch_closes_when_namespace_deleted() {
        let backend = MemoryBackend::new();
        let ns = backend
            .create_namespace("gone", PersistenceLevel::VolatileSimple, &[])
            .await
            .unwrap();
        let mut changes = backend.watch(ns).unwrap();
        backend.delete_namespace("gone").await.unwrap();
        assert!(changes.changed().await.is_err());
    }
}
