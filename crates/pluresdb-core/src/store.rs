//! The authoritative local view of every record.
//!
//! The store serializes concurrent local and remote writes, performs the
//! CRDT merge, keeps the vector index coherent, triggers rules, notifies
//! subscribers, and publishes outbound replication events. It is the sole
//! mutator of the persistence backend and the index; the mesh replicator
//! routes everything through it.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use serde_json::{Map, Value as JsonValue};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::embedding::{embeddable_text, EmbedText, HashEmbedder};
use crate::error::{StoreError, StoreResult};
use crate::index::{cosine_similarity, VectorIndex};
use crate::record::{NodeId, NodeRecord, PeerId, TimestampMs};
use crate::rules::{Rule, RuleContext};
use pluresdb_storage::{StorageEngine, StoredNode};

/// Upper bound on a single embedding computation.
const EMBED_TIMEOUT: Duration = Duration::from_secs(5);

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Outbound replication events, published after successful local writes.
///
/// The mesh replicator subscribes via [`Store::events`]; remote merges do
/// not publish here because the replicator relays those itself, excluding
/// the source link.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    Put { node: NodeRecord },
    Delete { id: NodeId },
}

/// A similarity hit from [`Store::vector_search`].
#[derive(Debug, Clone)]
pub struct VectorSearchResult {
    pub record: NodeRecord,
    /// Cosine similarity; higher is more similar.
    pub score: f32,
}

/// Construction-time configuration, read once; there is no process-global
/// mutable state.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Stable peer identity; freshly minted when absent.
    pub peer_id: Option<PeerId>,
    /// Persistence location; `None` or empty selects the in-memory backend.
    pub path: Option<PathBuf>,
    /// Emit diagnostic log entries on merges and network events. Defaults
    /// from the `PLURESDB_DEBUG` environment variable.
    pub debug: bool,
    /// Text-embedding backend; defaults to the hash embedder.
    pub embedder: Option<Arc<dyn EmbedText>>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            peer_id: None,
            path: None,
            debug: std::env::var_os("PLURESDB_DEBUG").is_some(),
            embedder: None,
        }
    }
}

impl StoreOptions {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Default::default()
        }
    }

    pub fn peer_id(mut self, peer_id: impl Into<PeerId>) -> Self {
        self.peer_id = Some(peer_id.into());
        self
    }

    pub fn debug(mut self, flag: bool) -> Self {
        self.debug = flag;
        self
    }

    pub fn embedder(mut self, embedder: Arc<dyn EmbedText>) -> Self {
        self.embedder = Some(embedder);
        self
    }
}

/// Handle returned by [`Store::subscribe`] / [`Store::subscribe_all`];
/// pass it to [`Store::unsubscribe`] to stop deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

type SubscriberFn = Arc<dyn Fn(Option<NodeRecord>) + Send + Sync>;

struct Subscriber {
    scope: Option<NodeId>,
    callback: SubscriberFn,
}

enum Notification {
    Merge {
        id: NodeId,
        record: Option<NodeRecord>,
    },
    Shutdown,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum RuleGate {
    Evaluate,
    Suppress,
}

struct StoreInner {
    peer_id: PeerId,
    debug: bool,
    storage: Arc<dyn StorageEngine>,
    index: VectorIndex,
    embedder: Arc<dyn EmbedText>,
    rules: RwLock<Vec<Arc<dyn Rule>>>,
    subscribers: Arc<RwLock<HashMap<u64, Subscriber>>>,
    next_subscriber: AtomicU64,
    notify_tx: mpsc::UnboundedSender<Notification>,
    events_tx: broadcast::Sender<StoreEvent>,
    /// Serializes local and remote writes at operation granularity.
    write_lock: Mutex<()>,
    closed: AtomicBool,
}

/// Cheaply cloneable handle to one database instance.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("peer_id", &self.inner.peer_id)
            .field("index", &self.inner.index)
            .finish()
    }
}

impl Store {
    /// Opens a store backed by the location in `options`.
    pub async fn open(options: StoreOptions) -> StoreResult<Self> {
        let storage = pluresdb_storage::open(options.path.clone())?;
        Self::open_with_storage(storage, options).await
    }

    /// Opens a store over an injected backend; the vector index is rebuilt
    /// from whatever the backend already holds.
    pub async fn open_with_storage(
        storage: Arc<dyn StorageEngine>,
        options: StoreOptions,
    ) -> StoreResult<Self> {
        let peer_id = options
            .peer_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let embedder = options
            .embedder
            .unwrap_or_else(|| Arc::new(HashEmbedder));

        let index = VectorIndex::new();
        for stored in storage.list_nodes().await? {
            match decode_record(&stored) {
                Ok(record) => {
                    if let Some(vector) = record.vector.filter(|v| !v.is_empty()) {
                        index.upsert(&record.id, vector);
                    }
                }
                Err(err) => warn!(id = %stored.id, "skipping undecodable record: {err}"),
            }
        }

        let subscribers: Arc<RwLock<HashMap<u64, Subscriber>>> =
            Arc::new(RwLock::new(HashMap::new()));
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        spawn_dispatcher(subscribers.clone(), notify_rx);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            inner: Arc::new(StoreInner {
                peer_id,
                debug: options.debug,
                storage,
                index,
                embedder,
                rules: RwLock::new(Vec::new()),
                subscribers,
                next_subscriber: AtomicU64::new(1),
                notify_tx,
                events_tx,
                write_lock: Mutex::new(()),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn peer_id(&self) -> &str {
        &self.inner.peer_id
    }

    pub fn debug_enabled(&self) -> bool {
        self.inner.debug
    }

    /// Subscribes to the outbound replication event stream.
    pub fn events(&self) -> broadcast::Receiver<StoreEvent> {
        self.inner.events_tx.subscribe()
    }

    // -- writes -------------------------------------------------------------

    /// Local write: merges `data` into the record under `id`, persists the
    /// result, and broadcasts it to mesh peers. Completes once persisted.
    pub async fn put(&self, id: impl Into<NodeId>, data: JsonValue) -> StoreResult<()> {
        let id = id.into();
        self.ensure_open()?;
        let _guard = self.inner.write_lock.lock().await;
        self.ensure_not_closed_while_waiting()?;
        self.local_put(&id, data, RuleGate::Evaluate).await
    }

    /// Write issued from a rule context; the write lock is already held by
    /// the merge that triggered the rule, and rules stay suppressed.
    pub(crate) async fn rule_put(&self, id: NodeId, data: JsonValue) -> StoreResult<()> {
        self.ensure_not_closed_while_waiting()?;
        self.local_put(&id, data, RuleGate::Suppress).await
    }

    /// Removes the record locally and broadcasts the delete.
    ///
    /// Deletes are not versioned: a delete observed before a concurrent
    /// put can be undone when that put arrives (resurrection). Peers still
    /// agree on the outcome because the surviving put replicates to all of
    /// them.
    pub async fn delete(&self, id: &str) -> StoreResult<()> {
        self.ensure_open()?;
        let _guard = self.inner.write_lock.lock().await;
        self.ensure_not_closed_while_waiting()?;
        if self.read_record(id).await?.is_none() {
            return Err(StoreError::NotFound(id.to_string()));
        }
        self.inner.storage.delete_node(id).await?;
        self.inner.index.remove(id);
        if self.inner.debug {
            debug!(id, "record deleted locally");
        }
        self.notify(id.to_string(), None);
        self.publish(StoreEvent::Delete { id: id.to_string() });
        Ok(())
    }

    /// Feeds a record received from the mesh into the merge flow. Returns
    /// `false` when the merge changed nothing — the caller must not relay
    /// a no-op, which is what bounds rebroadcast flooding.
    pub async fn apply_remote(&self, node: NodeRecord) -> StoreResult<bool> {
        self.ensure_open()?;
        if node.id.is_empty() {
            return Err(StoreError::MalformedInput("empty record id".into()));
        }
        let _guard = self.inner.write_lock.lock().await;
        self.ensure_not_closed_while_waiting()?;

        let existing = self.read_record(&node.id).await?;
        let merged = NodeRecord::merge(existing.as_ref(), &node);
        if existing.as_ref() == Some(&merged) {
            if self.inner.debug {
                debug!(id = %node.id, "remote put merged to a no-op");
            }
            return Ok(false);
        }
        self.commit(merged, RuleGate::Evaluate).await?;
        Ok(true)
    }

    /// Applies a delete received from the mesh. Returns `false` when the
    /// record was already absent.
    pub async fn apply_remote_delete(&self, id: &str) -> StoreResult<bool> {
        self.ensure_open()?;
        let _guard = self.inner.write_lock.lock().await;
        self.ensure_not_closed_while_waiting()?;
        if self.read_record(id).await?.is_none() {
            return Ok(false);
        }
        self.inner.storage.delete_node(id).await?;
        self.inner.index.remove(id);
        if self.inner.debug {
            debug!(id, "record deleted by remote peer");
        }
        self.notify(id.to_string(), None);
        Ok(true)
    }

    // -- reads --------------------------------------------------------------

    /// Current record under `id`, or `None`.
    pub async fn get(&self, id: &str) -> StoreResult<Option<NodeRecord>> {
        self.ensure_open()?;
        self.read_record(id).await
    }

    /// All records currently stored. Order is unspecified but stable
    /// within one call.
    pub async fn list(&self) -> StoreResult<Vec<NodeRecord>> {
        self.ensure_open()?;
        let mut records = Vec::new();
        for stored in self.inner.storage.list_nodes().await? {
            records.push(decode_record(&stored)?);
        }
        Ok(records)
    }

    /// All records whose `type` equals `node_type`.
    pub async fn instances_of(&self, node_type: &str) -> StoreResult<Vec<NodeRecord>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|record| record.node_type.as_deref() == Some(node_type))
            .collect())
    }

    /// Prior versions of `id`, newest first, as far back as the backend
    /// retains them.
    pub async fn history(&self, id: &str) -> StoreResult<Vec<NodeRecord>> {
        self.ensure_open()?;
        let mut versions = Vec::new();
        for stored in self.inner.storage.node_history(id).await? {
            versions.push(decode_record(&stored)?);
        }
        Ok(versions)
    }

    /// Restores the version of `id` written at `timestamp` by issuing an
    /// equivalent local put of its payload.
    pub async fn restore(&self, id: &str, timestamp: TimestampMs) -> StoreResult<()> {
        self.ensure_open()?;
        let version = self
            .history(id)
            .await?
            .into_iter()
            .find(|record| record.timestamp == timestamp)
            .ok_or_else(|| StoreError::NotFound(format!("{id}@{timestamp}")))?;
        self.put(id.to_string(), JsonValue::Object(version.data)).await
    }

    // -- similarity search --------------------------------------------------

    /// Top-`k` records most similar to `query` text.
    pub async fn vector_search(&self, query: &str, k: usize) -> StoreResult<Vec<VectorSearchResult>> {
        self.ensure_open()?;
        let embedding = self.embed(query.to_string()).await?;
        self.vector_search_embedding(&embedding, k).await
    }

    /// Top-`k` records most similar to a raw query vector. Falls back to
    /// scanning the persistence backend when the index is empty; slow but
    /// correct.
    pub async fn vector_search_embedding(
        &self,
        query: &[f32],
        k: usize,
    ) -> StoreResult<Vec<VectorSearchResult>> {
        self.ensure_open()?;
        if k == 0 || query.is_empty() {
            return Ok(Vec::new());
        }

        if !self.inner.index.is_empty() {
            let mut results = Vec::new();
            for (id, score) in self.inner.index.search(query, k) {
                if let Some(record) = self.read_record(&id).await? {
                    results.push(VectorSearchResult { record, score });
                }
            }
            if !results.is_empty() {
                return Ok(results);
            }
        }

        let mut scored = Vec::new();
        for record in self.list().await? {
            let Some(vector) = record.vector.as_ref() else {
                continue;
            };
            if let Some(score) = cosine_similarity(query, vector) {
                scored.push(VectorSearchResult { record, score });
            }
        }
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.record.id.cmp(&b.record.id))
        });
        scored.truncate(k);
        Ok(scored)
    }

    // -- subscriptions ------------------------------------------------------

    /// Registers a callback invoked after every merge affecting `id`;
    /// deletes deliver `None`. Callbacks run on a dispatch task in merge
    /// order and must not block; panics are logged and isolated.
    pub fn subscribe(
        &self,
        id: impl Into<NodeId>,
        callback: impl Fn(Option<NodeRecord>) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        self.register(Some(id.into()), Arc::new(callback))
    }

    /// As [`Store::subscribe`], across all ids.
    pub fn subscribe_all(
        &self,
        callback: impl Fn(Option<NodeRecord>) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        self.register(None, Arc::new(callback))
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.inner.subscribers.write().remove(&handle.0).is_some()
    }

    fn register(&self, scope: Option<NodeId>, callback: SubscriberFn) -> SubscriptionHandle {
        let key = self.inner.next_subscriber.fetch_add(1, Ordering::SeqCst);
        self.inner
            .subscribers
            .write()
            .insert(key, Subscriber { scope, callback });
        SubscriptionHandle(key)
    }

    // -- rules --------------------------------------------------------------

    /// Registers a named rule; a rule with the same name is replaced.
    /// Rules run sequentially in registration order.
    pub fn add_rule(&self, rule: Arc<dyn Rule>) {
        let mut rules = self.inner.rules.write();
        rules.retain(|existing| existing.name() != rule.name());
        rules.push(rule);
    }

    pub fn remove_rule(&self, name: &str) -> bool {
        let mut rules = self.inner.rules.write();
        let before = rules.len();
        rules.retain(|rule| rule.name() != name);
        rules.len() != before
    }

    // -- lifecycle ----------------------------------------------------------

    /// Waits for the in-flight merge (if any), then closes the backend.
    /// Subsequent operations fail; operations that were waiting on the
    /// write lock fail with the closed kind.
    pub async fn close(&self) -> StoreResult<()> {
        let _guard = self.inner.write_lock.lock().await;
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.inner.notify_tx.send(Notification::Shutdown);
        self.inner.storage.close().await?;
        Ok(())
    }

    // -- internals ----------------------------------------------------------

    fn ensure_open(&self) -> StoreResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(StoreError::NotOpen);
        }
        Ok(())
    }

    fn ensure_not_closed_while_waiting(&self) -> StoreResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    pub(crate) async fn read_record(&self, id: &str) -> StoreResult<Option<NodeRecord>> {
        match self.inner.storage.get_node(id).await? {
            Some(stored) => Ok(Some(decode_record(&stored)?)),
            None => Ok(None),
        }
    }

    async fn local_put(&self, id: &NodeId, data: JsonValue, gate: RuleGate) -> StoreResult<()> {
        if id.is_empty() {
            return Err(StoreError::MalformedInput("empty record id".into()));
        }
        let JsonValue::Object(fields) = data else {
            return Err(StoreError::MalformedInput(
                "record data must be a JSON object".into(),
            ));
        };

        let existing = self.read_record(id).await?;
        let timestamp = Utc::now().timestamp_millis();

        let mut clock = existing
            .as_ref()
            .map(|record| record.vector_clock.clone())
            .unwrap_or_default();
        clock.increment(&self.inner.peer_id);

        let vector = self.derive_vector(&fields, existing.as_ref()).await?;
        let node_type = match fields.get("type") {
            Some(JsonValue::String(t)) => Some(t.clone()),
            _ => existing.as_ref().and_then(|record| record.node_type.clone()),
        };

        let provisional = NodeRecord::local_write(
            id.clone(),
            fields,
            node_type,
            vector,
            timestamp,
            clock,
            &self.inner.peer_id,
        );
        let merged = NodeRecord::merge(existing.as_ref(), &provisional);

        self.commit(merged.clone(), gate).await?;
        self.publish(StoreEvent::Put { node: merged });
        Ok(())
    }

    /// Persists a merged record, refreshes the index, runs rules when the
    /// gate allows, and queues subscriber notifications.
    async fn commit(&self, merged: NodeRecord, gate: RuleGate) -> StoreResult<()> {
        self.inner.storage.set_node(encode_record(&merged)?).await?;
        match merged.vector.as_ref().filter(|v| !v.is_empty()) {
            Some(vector) => self.inner.index.upsert(&merged.id, vector.clone()),
            None => self.inner.index.remove(&merged.id),
        }
        if self.inner.debug {
            debug!(
                id = %merged.id,
                timestamp = merged.timestamp,
                clock = ?merged.vector_clock,
                "record merged"
            );
        }
        if gate == RuleGate::Evaluate {
            self.run_rules(&merged).await;
        }
        self.notify(merged.id.clone(), Some(merged));
        Ok(())
    }

    async fn run_rules(&self, record: &NodeRecord) {
        let rules: Vec<Arc<dyn Rule>> = self.inner.rules.read().clone();
        if rules.is_empty() {
            return;
        }
        let ctx = RuleContext::new(self);
        for rule in rules {
            if let Err(err) = rule.evaluate(record, &ctx).await {
                warn!(rule = rule.name(), id = %record.id, "rule failed: {err}");
            }
        }
    }

    async fn derive_vector(
        &self,
        fields: &Map<String, JsonValue>,
        existing: Option<&NodeRecord>,
    ) -> StoreResult<Option<Vec<f32>>> {
        if let Some(JsonValue::Array(values)) = fields.get("vector") {
            let mut vector = Vec::with_capacity(values.len());
            for value in values {
                let number = value.as_f64().ok_or_else(|| {
                    StoreError::MalformedInput("non-numeric vector element".into())
                })?;
                vector.push(number as f32);
            }
            return Ok(Some(vector));
        }
        if let Some(text) = embeddable_text(fields) {
            return Ok(Some(self.embed(text.to_string()).await?));
        }
        Ok(existing.and_then(|record| record.vector.clone()))
    }

    async fn embed(&self, text: String) -> StoreResult<Vec<f32>> {
        let embedder = self.inner.embedder.clone();
        let task = tokio::task::spawn_blocking(move || embedder.embed(&text));
        match tokio::time::timeout(EMBED_TIMEOUT, task).await {
            Ok(Ok(Ok(vector))) => Ok(vector),
            Ok(Ok(Err(err))) => Err(StoreError::Io(format!("embedding failed: {err}"))),
            Ok(Err(join)) => Err(StoreError::Io(format!("embedding worker failed: {join}"))),
            Err(_) => Err(StoreError::Io("embedding timed out".into())),
        }
    }

    fn notify(&self, id: NodeId, record: Option<NodeRecord>) {
        let _ = self.inner.notify_tx.send(Notification::Merge { id, record });
    }

    fn publish(&self, event: StoreEvent) {
        // No receivers just means no mesh is attached.
        let _ = self.inner.events_tx.send(event);
    }
}

/// Drains the notification queue on its own task, preserving merge order;
/// a panicking callback is logged and does not stop later deliveries.
fn spawn_dispatcher(
    subscribers: Arc<RwLock<HashMap<u64, Subscriber>>>,
    mut notify_rx: mpsc::UnboundedReceiver<Notification>,
) {
    tokio::spawn(async move {
        while let Some(notification) = notify_rx.recv().await {
            let (id, record) = match notification {
                Notification::Shutdown => break,
                Notification::Merge { id, record } => (id, record),
            };
            let callbacks: Vec<SubscriberFn> = subscribers
                .read()
                .values()
                .filter(|sub| sub.scope.as_deref().map_or(true, |scope| scope == id))
                .map(|sub| sub.callback.clone())
                .collect();
            for callback in callbacks {
                let payload = record.clone();
                if catch_unwind(AssertUnwindSafe(|| callback(payload))).is_err() {
                    warn!(id = %id, "subscriber callback panicked");
                }
            }
        }
    });
}

fn encode_record(record: &NodeRecord) -> StoreResult<StoredNode> {
    Ok(StoredNode {
        id: record.id.clone(),
        payload: serde_json::to_value(record)
            .map_err(|err| StoreError::Io(err.to_string()))?,
    })
}

fn decode_record(stored: &StoredNode) -> StoreResult<NodeRecord> {
    serde_json::from_value(stored.payload.clone())
        .map_err(|err| StoreError::Io(err.to_string()))
}
