//! Debounced, batched write-back of local edits.
//!
//! Edits are merged per node into a pending map and written after the input has
//! been quiet for `debounce_ms`, or immediately on [`PersistenceQueue::flush`].
//!
//! # Invariants
//!
//! - At most one flush runs at a time; a second caller waits for the first.
//!   Structural calls share the same gate, so they never interleave with a batch.
//! - A flush drains the pending map in one step. Edits that arrive while it is
//!   running go to the next cycle, so writes for one node are never reordered.
//! - Structural calls the store rejected are replayed, oldest first, before any
//!   batch. Patches for a node whose structural call is still unsaved wait.
//! - While held, nothing reaches the store. Batches not yet sent go back to the
//!   pending map.
//! - A batch that keeps failing is retried with exponential backoff, then kept
//!   as unsaved. Exactly one failure event is raised per flush.
//! - Unsaved entries are never dropped; they ride along with the next flush.

mod store;
pub use store::*;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::config::PersistenceConfig;
use crate::error::StoreError;
use crate::ir::{NodeId, NodePatch, NodeSpec};

const EVENT_CAPACITY: usize = 64;

/// Snapshot for UI indicators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    /// Queued, in-flight, unsaved and backlogged entries.
    pub pending_count: usize,
    pub is_flushing: bool,
    pub unsaved: Vec<NodeId>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    Saved { node_ids: Vec<NodeId> },
    Failed { node_ids: Vec<NodeId>, error: StoreError },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushReport {
    pub saved: Vec<NodeId>,
    pub failed: Vec<NodeId>,
    pub batches: usize,
}

impl FlushReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// A create, delete or reattach call. These are sent one at a time rather than
/// batched.
#[derive(Debug, Clone, PartialEq)]
pub enum StructuralOp {
    Create(NodeSpec),
    Delete(NodeId),
    Reattach { id: NodeId, parent: Option<NodeId> },
}

impl StructuralOp {
    pub fn node_id(&self) -> &NodeId {
        match self {
            Self::Create(spec) => &spec.id,
            Self::Delete(id) => id,
            Self::Reattach { id, .. } => id,
        }
    }
}

enum Attempt {
    Saved,
    Failed(StoreError),
    Held,
}

#[derive(Default)]
struct QueueState {
    pending: BTreeMap<NodeId, NodePatch>,
    unsaved: BTreeMap<NodeId, NodePatch>,
    in_flight: BTreeSet<NodeId>,
    backlog: Vec<StructuralOp>,
    flushing: bool,
    held: bool,
    timer: Option<JoinHandle<()>>,
    timer_generation: u64,
}

impl QueueState {
    fn status(&self) -> QueueStatus {
        let mut unsaved: BTreeSet<&NodeId> = self.unsaved.keys().collect();
        unsaved.extend(self.backlog.iter().map(StructuralOp::node_id));
        let mut ids: BTreeSet<&NodeId> = self.pending.keys().collect();
        ids.extend(self.in_flight.iter());
        ids.extend(unsaved.iter().copied());
        QueueStatus {
            pending_count: ids.len(),
            is_flushing: self.flushing,
            unsaved: unsaved.into_iter().cloned().collect(),
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(handle) = self.timer.take() {
            handle.abort();
        }
        self.timer_generation += 1;
    }

    /// Takes everything that should be written now. Unsaved entries go first so
    /// newer pending fields override them. Entries for nodes with a backlogged
    /// structural call stay behind as unsaved.
    fn drain(&mut self) -> Vec<PendingUpdate> {
        let blocked: BTreeSet<NodeId> = self.backlog.iter().map(|op| op.node_id().clone()).collect();
        let mut merged = std::mem::take(&mut self.unsaved);
        for (id, patch) in std::mem::take(&mut self.pending) {
            merged.entry(id).or_default().merge(patch);
        }
        let (waiting, ready): (BTreeMap<_, _>, BTreeMap<_, _>) =
            merged.into_iter().partition(|(id, _)| blocked.contains(id));
        self.unsaved = waiting;
        self.in_flight = ready.keys().cloned().collect();
        ready
            .into_iter()
            .filter(|(_, patch)| !patch.is_empty())
            .map(|(node_id, patch)| PendingUpdate { node_id, patch })
            .collect()
    }

    /// Puts unsent updates back in front of anything queued since the drain.
    fn requeue(&mut self, updates: &[PendingUpdate]) {
        for update in updates {
            self.in_flight.remove(&update.node_id);
            let mut patch = update.patch.clone();
            if let Some(newer) = self.pending.remove(&update.node_id) {
                patch.merge(newer);
            }
            self.pending.insert(update.node_id.clone(), patch);
        }
    }
}

struct Inner<S> {
    store: Arc<S>,
    config: PersistenceConfig,
    state: Mutex<QueueState>,
    flush_gate: tokio::sync::Mutex<()>,
    status: watch::Sender<QueueStatus>,
    events: broadcast::Sender<QueueEvent>,
}

pub struct PersistenceQueue<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for PersistenceQueue<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: PersistenceCollaborator> PersistenceQueue<S> {
    pub fn new(store: Arc<S>, config: PersistenceConfig) -> Self {
        let (status, _) = watch::channel(QueueStatus::default());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                store,
                config,
                state: Mutex::new(QueueState::default()),
                flush_gate: tokio::sync::Mutex::new(()),
                status,
                events,
            }),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.inner.store
    }

    pub fn config(&self) -> &PersistenceConfig {
        &self.inner.config
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // The state holds plain data; a panic elsewhere cannot leave it half-written.
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish_status(&self) {
        let status = self.lock().status();
        self.inner.status.send_replace(status);
    }

    pub fn status(&self) -> QueueStatus {
        self.lock().status()
    }

    pub fn pending_count(&self) -> usize {
        self.lock().status().pending_count
    }

    pub fn is_flushing(&self) -> bool {
        self.lock().flushing
    }

    pub fn is_held(&self) -> bool {
        self.lock().held
    }

    pub fn is_unsaved(&self, id: &NodeId) -> bool {
        let state = self.lock();
        state.unsaved.contains_key(id) || state.backlog.iter().any(|op| op.node_id() == id)
    }

    /// True while the node has a queued, in-flight or unsaved local write.
    pub fn has_local_write(&self, id: &NodeId) -> bool {
        let state = self.lock();
        state.pending.contains_key(id)
            || state.in_flight.contains(id)
            || state.unsaved.contains_key(id)
            || state.backlog.iter().any(|op| op.node_id() == id)
    }

    pub fn queued_patch(&self, id: &NodeId) -> Option<NodePatch> {
        self.lock().pending.get(id).cloned()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<QueueStatus> {
        self.inner.status.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    /// Merges `patch` into the pending entry for `node_id` and restarts the
    /// debounce timer.
    pub fn enqueue(&self, node_id: NodeId, patch: NodePatch) {
        if patch.is_empty() {
            return;
        }
        {
            let mut state = self.lock();
            state.pending.entry(node_id.clone()).or_default().merge(patch);
            self.schedule(&mut state);
        }
        tracing::trace!(node = %node_id, "queued node patch");
        self.publish_status();
    }

    /// Drops queued and unsaved writes for nodes that no longer exist.
    pub fn forget(&self, ids: &[NodeId]) {
        {
            let mut state = self.lock();
            for id in ids {
                state.pending.remove(id);
                state.unsaved.remove(id);
            }
        }
        self.publish_status();
    }

    /// Keeps every call away from the store until [`release`](Self::release).
    /// Edits keep queueing meanwhile.
    pub fn hold(&self) {
        {
            let mut state = self.lock();
            state.held = true;
            state.cancel_timer();
        }
        tracing::debug!("write-back held");
    }

    /// Lifts a hold and restarts the debounce for whatever queued up under it.
    pub fn release(&self) {
        {
            let mut state = self.lock();
            if !state.held {
                return;
            }
            state.held = false;
            if !state.pending.is_empty() || !state.backlog.is_empty() {
                self.schedule(&mut state);
            }
        }
        tracing::debug!("write-back released");
    }

    fn schedule(&self, state: &mut QueueState) {
        state.cancel_timer();
        if state.held {
            return;
        }
        let generation = state.timer_generation;
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!("no async runtime; pending writes wait for an explicit flush");
            return;
        };
        let queue = self.clone();
        let delay = self.inner.config.debounce();
        state.timer = Some(runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            queue.flush_from_timer(generation).await;
        }));
    }

    async fn flush_from_timer(&self, generation: u64) {
        {
            let mut state = self.lock();
            if state.timer_generation != generation {
                return;
            }
            // Detach without aborting: this task is the timer.
            state.timer = None;
        }
        self.run_cycle().await;
    }

    /// Cancels the debounce timer and writes everything pending now. Waits for an
    /// in-flight flush first; returns once this cycle has completed. Does nothing
    /// while held.
    pub async fn flush(&self) -> FlushReport {
        self.lock().cancel_timer();
        self.run_cycle().await
    }

    /// Re-submits unsaved entries immediately.
    pub async fn retry_failed(&self) -> FlushReport {
        tracing::info!(unsaved = self.status().unsaved.len(), "retrying unsaved writes");
        self.flush().await
    }

    /// Sends a create, delete or reattach to the store. While held, or while an
    /// earlier structural call is still unsaved, the call joins the backlog and
    /// `Ok(None)` is returned. On success a create yields the id the store
    /// assigned. A rejected call is backlogged and reported once.
    pub async fn submit_structural(&self, op: StructuralOp) -> Result<Option<NodeId>, StoreError> {
        let _gate = self.inner.flush_gate.lock().await;
        {
            let mut state = self.lock();
            if state.held || !state.backlog.is_empty() {
                tracing::debug!(node = %op.node_id(), "structural write deferred");
                state.backlog.push(op);
                drop(state);
                self.publish_status();
                return Ok(None);
            }
        }
        match self.apply_structural(&op).await {
            Ok(assigned) => Ok(assigned),
            Err(err) => {
                self.notify_failure(vec![op.node_id().clone()], err.clone());
                self.lock().backlog.push(op);
                self.publish_status();
                Err(err)
            }
        }
    }

    async fn apply_structural(&self, op: &StructuralOp) -> Result<Option<NodeId>, StoreError> {
        let store = &self.inner.store;
        match op {
            StructuralOp::Create(spec) => store.create_node(spec).await.map(Some),
            StructuralOp::Delete(id) => store.delete_node(id).await.map(|()| None),
            StructuralOp::Reattach { id, parent } => {
                store.reattach(id, parent.as_ref()).await.map(|()| None)
            }
        }
    }

    fn notify_failure(&self, node_ids: Vec<NodeId>, error: StoreError) {
        tracing::error!(nodes = node_ids.len(), error = %error, "write failed; kept as unsaved");
        let _ = self.inner.events.send(QueueEvent::Failed { node_ids, error });
    }

    /// Replays backlogged structural calls oldest first. Stops at the first
    /// rejection so later calls keep their order.
    async fn replay_backlog(&self, report: &mut FlushReport) -> Option<StoreError> {
        loop {
            let next = self.lock().backlog.first().cloned();
            let Some(op) = next else {
                return None;
            };
            match self.apply_structural(&op).await {
                Ok(_) => {
                    self.lock().backlog.remove(0);
                    tracing::debug!(node = %op.node_id(), "structural write replayed");
                    report.saved.push(op.node_id().clone());
                    self.publish_status();
                }
                Err(err) => {
                    tracing::warn!(node = %op.node_id(), error = %err, "structural write rejected again");
                    let waiting: BTreeSet<NodeId> =
                        self.lock().backlog.iter().map(|op| op.node_id().clone()).collect();
                    report.failed.extend(waiting);
                    return Some(err);
                }
            }
        }
    }

    async fn run_cycle(&self) -> FlushReport {
        let _gate = self.inner.flush_gate.lock().await;
        let mut report = FlushReport::default();
        let held = self.lock().held;
        if held {
            tracing::debug!("flush skipped; writes are held");
            return report;
        }

        let mut last_error = self.replay_backlog(&mut report).await;
        let updates = {
            let mut state = self.lock();
            let updates = state.drain();
            state.flushing = !updates.is_empty();
            updates
        };
        if !updates.is_empty() {
            self.publish_status();
            let batch_size = self.inner.config.batch_size.max(1);
            let total = updates.len().div_ceil(batch_size);
            tracing::debug!(entries = updates.len(), batches = total, "flushing pending writes");

            for (index, batch) in updates.chunks(batch_size).enumerate() {
                if index > 0 {
                    tokio::time::sleep(self.inner.config.inter_batch_pause()).await;
                }
                let ids: Vec<NodeId> = batch.iter().map(|u| u.node_id.clone()).collect();
                let held = self.lock().held;
                let attempt = if held {
                    Attempt::Held
                } else {
                    report.batches += 1;
                    self.submit_with_retry(batch).await
                };
                match attempt {
                    Attempt::Saved => {
                        {
                            let mut state = self.lock();
                            for id in &ids {
                                state.in_flight.remove(id);
                            }
                        }
                        tracing::debug!(batch = index + 1, of = total, "batch saved");
                        report.saved.extend(ids.iter().cloned());
                        let _ = self.inner.events.send(QueueEvent::Saved { node_ids: ids });
                    }
                    Attempt::Failed(err) => {
                        {
                            let mut state = self.lock();
                            for update in batch {
                                state.in_flight.remove(&update.node_id);
                                state
                                    .unsaved
                                    .entry(update.node_id.clone())
                                    .or_default()
                                    .merge(update.patch.clone());
                            }
                        }
                        report.failed.extend(ids);
                        last_error = Some(err);
                    }
                    Attempt::Held => {
                        let rest = &updates[index * batch_size..];
                        self.lock().requeue(rest);
                        tracing::debug!(entries = rest.len(), "writes held mid-flush; requeued");
                        self.publish_status();
                        break;
                    }
                }
                self.publish_status();
            }
        }

        if let Some(error) = last_error {
            self.notify_failure(report.failed.clone(), error);
        }
        {
            let mut state = self.lock();
            state.flushing = false;
            state.in_flight.clear();
        }
        self.publish_status();
        report
    }

    async fn submit_with_retry(&self, batch: &[PendingUpdate]) -> Attempt {
        let config = &self.inner.config;
        let mut attempt = 0;
        loop {
            match self.inner.store.batch_update(batch).await {
                Ok(()) => return Attempt::Saved,
                Err(err) => {
                    attempt += 1;
                    if attempt > config.max_retries {
                        return Attempt::Failed(err);
                    }
                    let delay = config.backoff(attempt);
                    tracing::warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "batch write failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    let held = self.lock().held;
                    if held {
                        return Attempt::Held;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn queue_with(store: Arc<MemoryStore>) -> PersistenceQueue<MemoryStore> {
        PersistenceQueue::new(store, PersistenceConfig::default())
    }

    fn title(value: &str) -> NodePatch {
        NodePatch {
            title: Some(value.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn edits_within_window_coalesce_into_one_entry() {
        let store = Arc::new(MemoryStore::new());
        let mut config = PersistenceConfig::default();
        config.debounce_ms = 500;
        let queue = PersistenceQueue::new(store.clone(), config);

        queue.enqueue(NodeId::new("A"), title("first"));
        tokio::time::sleep(Duration::from_millis(200)).await;
        queue.enqueue(NodeId::new("A"), title("final"));
        assert_eq!(store.batch_call_count(), 0);

        tokio::time::sleep(Duration::from_millis(600)).await;
        let batches = store.committed_batches().await;
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 1);
        assert_eq!(batches[0][0].patch.title.as_deref(), Some("final"));
        assert_eq!(queue.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_restarts_on_every_edit() {
        let store = Arc::new(MemoryStore::new());
        let queue = queue_with(store.clone());
        for step in 0..5 {
            queue.enqueue(NodeId::new("A"), title(&format!("t{step}")));
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        assert_eq!(store.batch_call_count(), 0);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(store.batch_call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_flush_cancels_timer_and_writes_once() {
        let store = Arc::new(MemoryStore::new());
        let queue = queue_with(store.clone());
        queue.enqueue(NodeId::new("A"), title("x"));
        let report = queue.flush().await;
        assert_eq!(report.saved, vec![NodeId::new("A")]);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(store.batch_call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn splits_into_sequential_batches() {
        let store = Arc::new(MemoryStore::new());
        let mut config = PersistenceConfig::default();
        config.batch_size = 2;
        let queue = PersistenceQueue::new(store.clone(), config);
        for name in ["A", "B", "C", "D", "E"] {
            queue.enqueue(NodeId::new(name), title(name));
        }
        let report = queue.flush().await;
        assert_eq!(report.batches, 3);
        let sizes: Vec<usize> = store
            .committed_batches()
            .await
            .iter()
            .map(Vec::len)
            .collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_flushes_never_double_submit() {
        let store = Arc::new(MemoryStore::with_latency(Duration::from_millis(100)));
        let queue = queue_with(store.clone());
        queue.enqueue(NodeId::new("A"), title("x"));
        let (first, second) = tokio::join!(queue.flush(), queue.flush());
        assert_eq!(first.saved.len() + second.saved.len(), 1);
        assert_eq!(store.batch_call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn edits_during_flight_wait_for_next_cycle() {
        let store = Arc::new(MemoryStore::with_latency(Duration::from_millis(100)));
        let queue = queue_with(store.clone());
        queue.enqueue(NodeId::new("A"), title("one"));
        let flusher = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.flush().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(queue.is_flushing());
        queue.enqueue(NodeId::new("A"), title("two"));
        flusher.await.unwrap();

        let batches = store.committed_batches().await;
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0][0].patch.title.as_deref(), Some("one"));
        assert_eq!(queue.queued_patch(&NodeId::new("A")), Some(title("two")));

        tokio::time::sleep(Duration::from_secs(1)).await;
        let batches = store.committed_batches().await;
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1][0].patch.title.as_deref(), Some("two"));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_is_retried() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next_batches(2);
        let queue = queue_with(store.clone());
        queue.enqueue(NodeId::new("A"), title("x"));
        let report = queue.flush().await;
        assert!(report.is_clean());
        assert_eq!(store.batch_call_count(), 3);
        assert_eq!(queue.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_raise_one_failure_and_keep_item() {
        let store = Arc::new(MemoryStore::new());
        store.set_fail_always(true);
        let queue = queue_with(store.clone());
        let mut events = queue.subscribe();
        queue.enqueue(NodeId::new("A"), title("x"));
        let report = queue.flush().await;

        assert_eq!(report.failed, vec![NodeId::new("A")]);
        assert_eq!(store.batch_call_count(), 4);
        assert_eq!(queue.pending_count(), 1);
        assert!(queue.is_unsaved(&NodeId::new("A")));

        let mut failures = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, QueueEvent::Failed { .. }) {
                failures += 1;
            }
        }
        assert_eq!(failures, 1);

        // Not retried on its own.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(store.batch_call_count(), 4);

        store.set_fail_always(false);
        let report = queue.retry_failed().await;
        assert_eq!(report.saved, vec![NodeId::new("A")]);
        assert_eq!(queue.pending_count(), 0);
        assert_eq!(store.committed_batches().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn newer_edit_overrides_unsaved_fields() {
        let store = Arc::new(MemoryStore::new());
        store.set_fail_always(true);
        let queue = queue_with(store.clone());
        queue.enqueue(
            NodeId::new("A"),
            NodePatch {
                title: Some("old".to_string()),
                description: Some("kept".to_string()),
                ..Default::default()
            },
        );
        queue.flush().await;
        store.set_fail_always(false);
        queue.enqueue(NodeId::new("A"), title("new"));
        queue.flush().await;
        let record = store.record(&NodeId::new("A")).await.unwrap();
        assert_eq!(record.title.as_deref(), Some("new"));
        assert_eq!(record.description.as_deref(), Some("kept"));
        assert_eq!(store.committed_batches().await[0].len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn status_channel_tracks_flush() {
        let store = Arc::new(MemoryStore::new());
        let queue = queue_with(store.clone());
        let status = queue.subscribe_status();
        queue.enqueue(NodeId::new("A"), title("x"));
        assert_eq!(status.borrow().pending_count, 1);
        queue.flush().await;
        assert_eq!(*status.borrow(), QueueStatus::default());
    }

    #[tokio::test(start_paused = true)]
    async fn forgotten_nodes_are_not_written() {
        let store = Arc::new(MemoryStore::new());
        let queue = queue_with(store.clone());
        queue.enqueue(NodeId::new("A"), title("x"));
        queue.forget(&[NodeId::new("A")]);
        let report = queue.flush().await;
        assert_eq!(report, FlushReport::default());
        assert_eq!(store.batch_call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn held_queue_writes_nothing_until_released() {
        let store = Arc::new(MemoryStore::new());
        let queue = queue_with(store.clone());
        queue.enqueue(NodeId::new("A"), title("x"));
        queue.hold();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(queue.flush().await, FlushReport::default());
        queue.enqueue(NodeId::new("A"), title("y"));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(store.batch_call_count(), 0);
        assert_eq!(queue.pending_count(), 1);

        queue.release();
        tokio::time::sleep(Duration::from_secs(1)).await;
        let batches = store.committed_batches().await;
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0][0].patch.title.as_deref(), Some("y"));
    }

    #[tokio::test(start_paused = true)]
    async fn hold_during_backoff_requeues_the_batch() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next_batches(1);
        let queue = queue_with(store.clone());
        queue.enqueue(NodeId::new("A"), title("x"));
        let flusher = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.flush().await })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;
        queue.hold();
        let report = flusher.await.unwrap();
        assert!(report.saved.is_empty() && report.failed.is_empty());
        assert_eq!(store.batch_call_count(), 1);
        assert_eq!(queue.queued_patch(&NodeId::new("A")), Some(title("x")));

        queue.release();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(store.committed_batches().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_create_is_replayed_before_patches() {
        let store = Arc::new(MemoryStore::new());
        let queue = queue_with(store.clone());
        let spec = NodeSpec::from(&crate::ir::Node::new(
            NodeId::new("A"),
            crate::ir::NodeKind::Objective,
            crate::ir::Position::default(),
        ));
        store.set_fail_structural(true);
        assert!(queue.submit_structural(StructuralOp::Create(spec)).await.is_err());
        assert!(queue.is_unsaved(&NodeId::new("A")));

        // Still rejected: the patch waits behind the create.
        queue.enqueue(NodeId::new("A"), title("x"));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(store.batch_call_count(), 0);
        assert_eq!(queue.pending_count(), 1);

        store.set_fail_structural(false);
        let report = queue.retry_failed().await;
        assert!(report.is_clean());
        assert!(store.specs.lock().await.contains_key(&NodeId::new("A")));
        assert_eq!(store.committed_batches().await.len(), 1);
        assert_eq!(queue.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn structural_calls_queue_behind_a_backlog() {
        let store = Arc::new(MemoryStore::new());
        let queue = queue_with(store.clone());
        store.set_fail_structural(true);
        let first = StructuralOp::Reattach {
            id: NodeId::new("B"),
            parent: Some(NodeId::new("A")),
        };
        assert!(queue.submit_structural(first).await.is_err());
        store.set_fail_structural(false);

        let second = queue.submit_structural(StructuralOp::Delete(NodeId::new("B"))).await;
        assert_eq!(second, Ok(None));
        assert!(store.deleted.lock().await.is_empty());

        queue.flush().await;
        assert_eq!(
            *store.reattachments.lock().await,
            vec![(NodeId::new("B"), Some(NodeId::new("A")))]
        );
        assert_eq!(*store.deleted.lock().await, vec![NodeId::new("B")]);
        assert_eq!(queue.status(), QueueStatus::default());
    }
}
