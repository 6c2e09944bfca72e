use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::ir::{NodeId, NodePatch, NodeSpec};

/// One entry of a batched write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingUpdate {
    pub node_id: NodeId,
    pub patch: NodePatch,
}

/// Durable store the canvas writes through. Every call may fail; callers treat
/// failures as retryable.
#[async_trait]
pub trait PersistenceCollaborator: Send + Sync + 'static {
    async fn create_node(&self, spec: &NodeSpec) -> Result<NodeId, StoreError>;
    async fn batch_update(&self, updates: &[PendingUpdate]) -> Result<(), StoreError>;
    async fn delete_node(&self, id: &NodeId) -> Result<(), StoreError>;
    async fn reattach(&self, id: &NodeId, new_parent: Option<&NodeId>) -> Result<(), StoreError>;
}

/// In-memory store that records every call. Failures can be injected for the
/// next N batch writes or for all of them.
#[derive(Default)]
pub struct MemoryStore {
    pub records: Mutex<BTreeMap<NodeId, NodePatch>>,
    pub specs: Mutex<BTreeMap<NodeId, NodeSpec>>,
    pub batches: Mutex<Vec<Vec<PendingUpdate>>>,
    pub reattachments: Mutex<Vec<(NodeId, Option<NodeId>)>>,
    pub deleted: Mutex<Vec<NodeId>>,
    pub batch_calls: AtomicUsize,
    pub create_calls: AtomicUsize,
    pub fail_batches: AtomicUsize,
    pub fail_always: AtomicBool,
    pub fail_structural: AtomicBool,
    pub latency: Option<Duration>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    pub fn fail_next_batches(&self, count: usize) {
        self.fail_batches.store(count, Ordering::SeqCst);
    }

    pub fn set_fail_always(&self, fail: bool) {
        self.fail_always.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_structural(&self, fail: bool) {
        self.fail_structural.store(fail, Ordering::SeqCst);
    }

    pub fn batch_call_count(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    pub async fn committed_batches(&self) -> Vec<Vec<PendingUpdate>> {
        self.batches.lock().await.clone()
    }

    pub async fn record(&self, id: &NodeId) -> Option<NodePatch> {
        self.records.lock().await.get(id).cloned()
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn structural_failure(&self) -> Result<(), StoreError> {
        if self.fail_structural.load(Ordering::SeqCst) {
            return Err(StoreError::new("structural write rejected"));
        }
        Ok(())
    }
}

#[async_trait]
impl PersistenceCollaborator for MemoryStore {
    async fn create_node(&self, spec: &NodeSpec) -> Result<NodeId, StoreError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        self.structural_failure()?;
        self.specs.lock().await.insert(spec.id.clone(), spec.clone());
        Ok(spec.id.clone())
    }

    async fn batch_update(&self, updates: &[PendingUpdate]) -> Result<(), StoreError> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        if self.fail_always.load(Ordering::SeqCst) {
            return Err(StoreError::new("store unavailable"));
        }
        let remaining = self.fail_batches.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_batches.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::new("transient write failure"));
        }
        let mut records = self.records.lock().await;
        for update in updates {
            records
                .entry(update.node_id.clone())
                .or_default()
                .merge(update.patch.clone());
        }
        self.batches.lock().await.push(updates.to_vec());
        Ok(())
    }

    async fn delete_node(&self, id: &NodeId) -> Result<(), StoreError> {
        self.simulate_latency().await;
        self.structural_failure()?;
        self.records.lock().await.remove(id);
        self.specs.lock().await.remove(id);
        self.deleted.lock().await.push(id.clone());
        Ok(())
    }

    async fn reattach(&self, id: &NodeId, new_parent: Option<&NodeId>) -> Result<(), StoreError> {
        self.simulate_latency().await;
        self.structural_failure()?;
        self.reattachments
            .lock()
            .await
            .push((id.clone(), new_parent.cloned()));
        Ok(())
    }
}
