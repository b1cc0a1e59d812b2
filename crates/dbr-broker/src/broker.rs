//! ---
//! dbr_section: "02-tuple-space"
//! dbr_subsection: "module"
//! dbr_type: "source"
//! dbr_scope: "code"
//! dbr_description: "Client-facing tuple-space operations over a storage backend."
//! dbr_version: "v0.0.0-prealpha"
//! dbr_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use dbr_common::{ClientConfig, ErrorCode};
use dbr_metrics::BrokerMetrics;
use parking_lot::Mutex;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::backend::{Backend, FetchMode, FetchedTuple};
use crate::error::{DbrError, Result};
use crate::matching::MatchTemplate;
use crate::tag::{RequestKind, Tag, TagPoll, TagState, TagTracker};
use crate::types::{
    validate_key, Capabilities, Directory, Group, NamespaceHandle, NamespaceId, NamespaceInfo,
    NamespaceState, OpFlags, PersistenceLevel, TupleSelector,
};

#[derive(Debug, Clone)]
struct Attachment {
    id: NamespaceId,
    name: String,
}

struct Shared {
    backend: Arc<dyn Backend>,
    config: ClientConfig,
    handles: Mutex<HashMap<NamespaceHandle, Attachment>>,
    next_handle: AtomicU64,
    tags: TagTracker,
    metrics: Option<BrokerMetrics>,
}

/// Entry point for tuple-space clients.
///
/// Cloning is cheap; clones share handles, outstanding tags, and the backend.
#[derive(Clone)]
pub struct DataBroker {
    shared: Arc<Shared>,
}

impl fmt::Debug for DataBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataBroker")
            .field("backend", &self.shared.backend.name())
            .field("handles", &self.shared.handles.lock().len())
            .field("outstanding_tags", &self.shared.tags.outstanding())
            .finish()
    }
}

impl DataBroker {
    pub fn new(
        backend: Arc<dyn Backend>,
        config: ClientConfig,
        metrics: Option<BrokerMetrics>,
    ) -> Self {
        let tags = TagTracker::new(config.max_outstanding_tags);
        Self {
            shared: Arc::new(Shared {
                backend,
                config,
                handles: Mutex::new(HashMap::new()),
                next_handle: AtomicU64::new(1),
                tags,
                metrics,
            }),
        }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.shared.backend
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Create a namespace and return a handle to it.
    pub async fn create(
        &self,
        name: &str,
        level: PersistenceLevel,
        groups: &[Group],
    ) -> Result<NamespaceHandle> {
        let result: Result<NamespaceHandle> = async {
            validate_key(name, "namespace name")?;
            let id = self
                .shared
                .backend
                .create_namespace(name, level, groups)
                .await?;
            Ok(self.shared.register(id, name))
        }
        .await;
        if let Ok(handle) = &result {
            info!(namespace = name, %handle, ?level, "namespace created");
        }
        self.shared.record("create", result)
    }

    /// Attach to an existing namespace. Every successful attach issues a new handle.
    pub async fn attach(&self, name: &str) -> Result<NamespaceHandle> {
        let result: Result<NamespaceHandle> = async {
            validate_key(name, "namespace name")?;
            let id = self.shared.backend.attach_namespace(name).await?;
            Ok(self.shared.register(id, name))
        }
        .await;
        self.shared.record("attach", result)
    }

    /// Release a handle. The namespace itself persists.
    pub async fn detach(&self, handle: NamespaceHandle) -> Result<()> {
        let result: Result<()> = async {
            let attachment = self
                .shared
                .handles
                .lock()
                .remove(&handle)
                .ok_or(DbrError::Handle(handle))?;
            debug!(namespace = %attachment.name, %handle, "detaching");
            self.shared.backend.detach_namespace(attachment.id).await
        }
        .await;
        self.shared.record("detach", result)
    }

    /// Destroy a namespace. Fails NSBUSY while more than one handle references it;
    /// afterwards every handle to it is invalid.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let result: Result<()> = async {
            validate_key(name, "namespace name")?;
            let id = self.shared.backend.delete_namespace(name).await?;
            let mut handles = self.shared.handles.lock();
            handles.retain(|_, attachment| attachment.id != id);
            Ok(())
        }
        .await;
        if result.is_ok() {
            info!(namespace = name, "namespace deleted");
        }
        self.shared.record("delete", result)
    }

    /// Report namespace state bits filtered by `mask`.
    pub async fn query(&self, handle: NamespaceHandle, mask: NamespaceState) -> Result<NamespaceState> {
        let result: Result<NamespaceState> = async {
            let info = self.describe(handle).await?;
            let mut state = NamespaceState::EXISTS;
            state.set(NamespaceState::SHARED, info.references > 1);
            state.set(NamespaceState::POPULATED, info.tuples > 0);
            state.set(NamespaceState::FAULT_TOLERANT, info.level.is_fault_tolerant());
            state.set(NamespaceState::PERSISTENT, info.level.is_permanent());
            state.set(
                NamespaceState::CLUSTER_READY,
                self.shared.backend.cluster_status().is_ready(),
            );
            Ok(state & mask)
        }
        .await;
        self.shared.record("query", result)
    }

    /// Backend-side bookkeeping for the namespace behind `handle`.
    pub async fn describe(&self, handle: NamespaceHandle) -> Result<NamespaceInfo> {
        let attachment = self.shared.attachment(handle)?;
        self.shared
            .backend
            .describe_namespace(attachment.id)
            .await
            .map_err(|err| attachment.invalid_if_gone(err))
    }

    pub async fn add_units(&self, handle: NamespaceHandle, units: &[String]) -> Result<()> {
        let result: Result<()> = async {
            let attachment = self.shared.attachment(handle)?;
            self.shared.backend.add_units(attachment.id, units).await
        }
        .await;
        self.shared.record("add_units", result)
    }

    pub async fn remove_units(&self, handle: NamespaceHandle, units: &[String]) -> Result<()> {
        let result: Result<()> = async {
            let attachment = self.shared.attachment(handle)?;
            self.shared.backend.remove_units(attachment.id, units).await
        }
        .await;
        self.shared.record("remove_units", result)
    }

    /// Store one tuple.
    pub async fn put(
        &self,
        handle: NamespaceHandle,
        payload: impl Into<Bytes>,
        name: &str,
        group: &Group,
    ) -> Result<()> {
        let payload = payload.into();
        let result = self.shared.put(handle, payload, name, group).await;
        self.shared.record("put", result)
    }

    /// Store one tuple assembled from several buffers.
    pub async fn put_gather(
        &self,
        handle: NamespaceHandle,
        parts: &[Bytes],
        name: &str,
        group: &Group,
    ) -> Result<()> {
        let mut payload = BytesMut::with_capacity(parts.iter().map(Bytes::len).sum());
        for part in parts {
            payload.extend_from_slice(part);
        }
        let result = self.shared.put(handle, payload.freeze(), name, group).await;
        self.shared.record("put_gather", result)
    }

    /// Remove one matching tuple into `buf`, returning the payload length.
    ///
    /// Blocks until a tuple arrives unless `flags` carries NOWAIT.
    pub async fn get(
        &self,
        handle: NamespaceHandle,
        selector: &TupleSelector,
        group: &Group,
        buf: &mut [u8],
        flags: OpFlags,
    ) -> Result<usize> {
        let result = self
            .fetch_into(handle, selector, group, buf, flags, FetchMode::Consume)
            .await;
        self.shared.record("get", result)
    }

    /// Copy one matching tuple into `buf` without removing it.
    pub async fn read(
        &self,
        handle: NamespaceHandle,
        selector: &TupleSelector,
        group: &Group,
        buf: &mut [u8],
        flags: OpFlags,
    ) -> Result<usize> {
        let result = self
            .fetch_into(handle, selector, group, buf, flags, FetchMode::Peek)
            .await;
        self.shared.record("read", result)
    }

    async fn fetch_into(
        &self,
        handle: NamespaceHandle,
        selector: &TupleSelector,
        group: &Group,
        buf: &mut [u8],
        flags: OpFlags,
        mode: FetchMode,
    ) -> Result<usize> {
        selector.validate()?;
        let attachment = self.shared.attachment(handle)?;
        let tuple = self
            .shared
            .fetch_blocking(&attachment, group, selector, buf.len(), mode, flags)
            .await?;
        let len = tuple.payload.len();
        buf[..len].copy_from_slice(&tuple.payload);
        Ok(len)
    }

    /// Succeeds when a tuple named `name` exists in the default group; UNAVAIL otherwise.
    pub async fn test_key(&self, handle: NamespaceHandle, name: &str) -> Result<()> {
        let result: Result<()> = async {
            validate_key(name, "tuple name")?;
            let attachment = self.shared.attachment(handle)?;
            let present = self
                .shared
                .backend
                .contains(attachment.id, &Group::default(), name)
                .await
                .map_err(|err| attachment.invalid_if_gone(err))?;
            if present {
                Ok(())
            } else {
                Err(DbrError::Unavailable)
            }
        }
        .await;
        self.shared.record("test_key", result)
    }

    /// List distinct tuple names matching `template`, at most `count` of them
    /// (`0` for no limit), as a newline-delimited listing of at most `buffer_size` bytes.
    ///
    /// Names are listed while they fit; UBUFFER only when not even one fits.
    pub async fn directory(
        &self,
        handle: NamespaceHandle,
        template: &MatchTemplate,
        group: &Group,
        count: usize,
        buffer_size: usize,
    ) -> Result<Directory> {
        let result: Result<Directory> = async {
            let attachment = self.shared.attachment(handle)?;
            let names = self
                .shared
                .backend
                .list(attachment.id, group, template, count)
                .await
                .map_err(|err| attachment.invalid_if_gone(err))?;
            let mut listed = Vec::with_capacity(names.len());
            let mut bytes_used = 0;
            for name in names {
                let entry = name.len() + 1;
                if bytes_used + entry > buffer_size {
                    if listed.is_empty() {
                        return Err(DbrError::UserBuffer {
                            provided: buffer_size,
                            required: entry,
                        });
                    }
                    break;
                }
                bytes_used += entry;
                listed.push(name);
            }
            Ok(Directory {
                names: listed,
                bytes_used,
            })
        }
        .await;
        self.shared.record("directory", result)
    }

    /// Atomically move one matching tuple between namespaces or groups.
    pub async fn move_tuple(
        &self,
        src: NamespaceHandle,
        src_group: &Group,
        selector: &TupleSelector,
        dst: NamespaceHandle,
        dst_group: &Group,
    ) -> Result<()> {
        let result: Result<()> = async {
            selector.validate()?;
            let source = self.shared.attachment(src)?;
            let destination = self.shared.attachment(dst)?;
            self.shared
                .backend
                .relocate(source.id, src_group, selector, destination.id, dst_group)
                .await
        }
        .await;
        self.shared.record("move", result)
    }

    /// Delete one matching tuple.
    pub async fn remove(
        &self,
        handle: NamespaceHandle,
        group: &Group,
        selector: &TupleSelector,
    ) -> Result<()> {
        let result: Result<()> = async {
            selector.validate()?;
            let attachment = self.shared.attachment(handle)?;
            self.shared
                .backend
                .discard(attachment.id, group, selector)
                .await
                .map_err(|err| attachment.invalid_if_gone(err))
        }
        .await;
        self.shared.record("remove", result)
    }

    /// Asynchronous put; resolve the returned tag with [`DataBroker::test`].
    pub fn put_a(
        &self,
        handle: NamespaceHandle,
        payload: impl Into<Bytes>,
        name: &str,
        group: &Group,
    ) -> Result<Tag> {
        let result = self.put_a_inner(handle, payload.into(), name, group);
        self.shared.record("put_a", result)
    }

    fn put_a_inner(
        &self,
        handle: NamespaceHandle,
        payload: Bytes,
        name: &str,
        group: &Group,
    ) -> Result<Tag> {
        validate_key(name, "tuple name")?;
        self.shared.attachment(handle)?;
        let name = name.to_owned();
        let group = group.clone();
        self.spawn_request(RequestKind::Put, move |shared| async move {
            shared.put(handle, payload, &name, &group).await.map(|_| None)
        })
    }

    /// Asynchronous get. The payload is delivered through the resolved tag and must
    /// fit in `capacity` bytes.
    pub fn get_a(
        &self,
        handle: NamespaceHandle,
        selector: &TupleSelector,
        group: &Group,
        capacity: usize,
        flags: OpFlags,
    ) -> Result<Tag> {
        let result = self.fetch_a(handle, selector, group, capacity, flags, FetchMode::Consume);
        self.shared.record("get_a", result)
    }

    /// Asynchronous read.
    pub fn read_a(
        &self,
        handle: NamespaceHandle,
        selector: &TupleSelector,
        group: &Group,
        capacity: usize,
        flags: OpFlags,
    ) -> Result<Tag> {
        let result = self.fetch_a(handle, selector, group, capacity, flags, FetchMode::Peek);
        self.shared.record("read_a", result)
    }

    fn fetch_a(
        &self,
        handle: NamespaceHandle,
        selector: &TupleSelector,
        group: &Group,
        capacity: usize,
        flags: OpFlags,
        mode: FetchMode,
    ) -> Result<Tag> {
        selector.validate()?;
        let attachment = self.shared.attachment(handle)?;
        let kind = match mode {
            FetchMode::Consume => RequestKind::Get,
            FetchMode::Peek => RequestKind::Read,
        };
        let selector = selector.clone();
        let group = group.clone();
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|err| DbrError::BackendPost(err.to_string()))?;
        let tag = self.shared.tags.issue(kind)?;
        let shared = Arc::clone(&self.shared);
        let task = runtime.spawn(async move {
            if !shared.tags.begin(tag) {
                return;
            }
            let outcome = shared
                .fetch_blocking(&attachment, &group, &selector, capacity, mode, flags)
                .await;
            match outcome {
                Ok(tuple) => {
                    let FetchedTuple { name, payload } = tuple;
                    if !shared.tags.resolve(tag, Ok(Some(payload.clone()))) && mode == FetchMode::Consume {
                        // cancelled after the tuple was taken
                        if let Err(err) = shared.backend.insert(attachment.id, &group, &name, payload).await {
                            warn!(%tag, tuple = %name, error = %err, "failed to restore tuple of cancelled get");
                        }
                    }
                }
                Err(err) => {
                    shared.tags.resolve(tag, Err(err));
                }
            }
        });
        self.shared.tags.bind_task(tag, task.abort_handle());
        self.shared.publish_outstanding();
        Ok(tag)
    }

    /// Submit a tuple for server-side evaluation by `function`.
    ///
    /// Fails NOTIMPL up front when the backend does not advertise evaluation.
    pub fn eval(
        &self,
        handle: NamespaceHandle,
        payload: impl Into<Bytes>,
        name: &str,
        group: &Group,
        function: &str,
    ) -> Result<Tag> {
        let payload = payload.into();
        let result: Result<Tag> = (|| {
            if !self.shared.backend.capabilities().contains(Capabilities::EVAL) {
                return Err(DbrError::NotImplemented("eval"));
            }
            validate_key(name, "tuple name")?;
            validate_key(function, "function name")?;
            let attachment = self.shared.attachment(handle)?;
            let name = name.to_owned();
            let group = group.clone();
            let function = function.to_owned();
            self.spawn_request(
                RequestKind::Eval {
                    function: function.clone(),
                },
                move |shared| async move {
                    shared
                        .backend
                        .evaluate(attachment.id, &group, &name, payload, &function)
                        .await
                        .map(|_| None)
                },
            )
        })();
        self.shared.record("eval", result)
    }

    fn spawn_request<F, Fut>(&self, kind: RequestKind, request: F) -> Result<Tag>
    where
        F: FnOnce(Arc<Shared>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<Option<Bytes>>> + Send + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|err| DbrError::BackendPost(err.to_string()))?;
        let tag = self.shared.tags.issue(kind)?;
        let shared = Arc::clone(&self.shared);
        let task = runtime.spawn(async move {
            if !shared.tags.begin(tag) {
                return;
            }
            let outcome = request(Arc::clone(&shared)).await;
            shared.tags.resolve(tag, outcome);
        });
        self.shared.tags.bind_task(tag, task.abort_handle());
        self.shared.publish_outstanding();
        Ok(tag)
    }

    /// Non-blocking status of an asynchronous request. A resolved answer collects the tag.
    pub fn test(&self, tag: Tag) -> Result<TagPoll> {
        let poll = self.shared.tags.test(tag);
        if matches!(poll, Ok(TagPoll::Resolved(_))) {
            self.shared.publish_outstanding();
        }
        poll
    }

    /// Cancel an outstanding request. A get whose tuple was already taken puts it back.
    pub fn cancel(&self, tag: Tag) -> Result<TagState> {
        let state = self.shared.tags.cancel(tag)?;
        debug!(%tag, ?state, "cancel requested");
        Ok(state)
    }

    /// State of a tag without collecting it.
    pub fn tag_state(&self, tag: Tag) -> Result<TagState> {
        self.shared.tags.state(tag).ok_or(DbrError::Tag(tag))
    }

    /// Tags issued and not yet collected.
    pub fn outstanding_tags(&self) -> usize {
        self.shared.tags.outstanding()
    }
}

impl Attachment {
    fn invalid_if_gone(&self, err: DbrError) -> DbrError {
        match err {
            DbrError::NamespaceInvalid(_) => DbrError::NamespaceInvalid(self.name.clone()),
            other => other,
        }
    }
}

impl Shared {
    fn register(&self, id: NamespaceId, name: &str) -> NamespaceHandle {
        let handle = NamespaceHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.handles.lock().insert(
            handle,
            Attachment {
                id,
                name: name.to_owned(),
            },
        );
        handle
    }

    fn attachment(&self, handle: NamespaceHandle) -> Result<Attachment> {
        self.handles
            .lock()
            .get(&handle)
            .cloned()
            .ok_or(DbrError::Handle(handle))
    }

    async fn put(
        &self,
        handle: NamespaceHandle,
        payload: Bytes,
        name: &str,
        group: &Group,
    ) -> Result<()> {
        validate_key(name, "tuple name")?;
        let attachment = self.attachment(handle)?;
        self.backend
            .insert(attachment.id, group, name, payload)
            .await
            .map_err(|err| attachment.invalid_if_gone(err))
    }

    /// Fetch, waiting on the namespace change feed until a tuple matches or the
    /// configured timeout elapses.
    async fn fetch_blocking(
        &self,
        attachment: &Attachment,
        group: &Group,
        selector: &TupleSelector,
        capacity: usize,
        mode: FetchMode,
        flags: OpFlags,
    ) -> Result<FetchedTuple> {
        let mut changes = self
            .backend
            .watch(attachment.id)
            .map_err(|err| attachment.invalid_if_gone(err))?;
        let deadline = self
            .config
            .effective_timeout()
            .map(|limit| (Instant::now() + limit, limit));
        loop {
            changes.borrow_and_update();
            match self
                .backend
                .fetch(attachment.id, group, selector, capacity, mode)
                .await
            {
                Err(DbrError::Unavailable) if !flags.contains(OpFlags::NOWAIT) => {}
                other => return other.map_err(|err| attachment.invalid_if_gone(err)),
            }
            let changed = match deadline {
                Some((at, limit)) => timeout_at(at, changes.changed())
                    .await
                    .map_err(|_| DbrError::Timeout(limit))?,
                None => changes.changed().await,
            };
            if changed.is_err() {
                return Err(DbrError::NamespaceInvalid(attachment.name.clone()));
            }
        }
    }

    fn record<T>(&self, operation: &'static str, result: Result<T>) -> Result<T> {
        if let Some(metrics) = &self.metrics {
            let code = match &result {
                Ok(_) => ErrorCode::Success,
                Err(err) => err.code(),
            };
            metrics.record(operation, &code.to_string());
        }
        if let Err(err) = &result {
            debug!(operation, code = %err.code(), error = %err, "operation failed");
        }
        result
    }

    fn publish_outstanding(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.set_outstanding_tags(self.tags.outstanding());
        }
    }
}
