//! Sink boundary for atomic batch commits.
//!
//! The write stream never talks to a storage engine directly; it hands each
//! drained batch to a [`BatchSink`] and treats the outcome as opaque.
//! Commit futures are boxed so the trait stays object-safe and
//! implementations are free to borrow from `self`.
//!
//! Implementations:
//! - [`MemorySink`]: for unit tests, with failure injection and commit
//!   gating hooks
//! - anything wrapping a real store's batch/write-batch API

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::types::{BatchOp, OperationKind};

/// Error type for sink commits.
///
/// Variants carry rendered messages rather than source errors so the value
/// stays cheap to clone when it is broadcast to every observer of the
/// stream's terminal outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// The sink refused the batch (validation, capacity, fencing).
    Rejected(String),
    /// The sink is gone (closed connection, dropped store).
    Unavailable(String),
    /// Underlying storage failure.
    Storage(String),
}

impl std::fmt::Display for SinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkError::Rejected(msg) => write!(f, "batch rejected: {}", msg),
            SinkError::Unavailable(msg) => write!(f, "sink unavailable: {}", msg),
            SinkError::Storage(msg) => write!(f, "storage error: {}", msg),
        }
    }
}

impl std::error::Error for SinkError {}

/// Atomic multi-operation commit capability.
///
/// `commit` must apply `ops` in the order given, as one unit: either every
/// operation takes effect or none do. A single stream submits at most one
/// commit at a time, so implementations never see overlapping calls from
/// it; each call is independent of the others.
pub trait BatchSink: Send + Sync + 'static {
    fn commit<'a>(
        &'a self,
        ops: Vec<BatchOp>,
    ) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + 'a>>;
}

// ============================================================================
// MemorySink - for unit tests
// ============================================================================

#[derive(Debug, Default)]
struct MemorySinkState {
    /// Committed batches, in submission order.
    batches: Vec<Vec<BatchOp>>,
    /// Commits currently inside `commit`.
    active: usize,
    /// High-water mark of concurrently active commits.
    max_active: usize,
    /// When set, every subsequent commit fails with this message.
    fail_message: Option<String>,
}

/// In-memory sink for unit tests.
///
/// Records every committed batch in order and keeps a high-water mark of
/// concurrently active commits. Two fault hooks: [`MemorySink::fail_with`]
/// makes every later commit fail, and [`MemorySink::gated`] blocks commits
/// until the matching [`SinkGate`] releases a permit, for staging
/// flush-in-flight races.
///
/// Clones share state, so a test can keep one handle for assertions while
/// the stream owns another.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    state: Arc<Mutex<MemorySinkState>>,
    gate: Option<Arc<Semaphore>>,
}

impl MemorySink {
    pub fn new() -> Self {
        MemorySink::default()
    }

    /// Sink whose commits block until the returned gate releases a permit.
    pub fn gated() -> (Self, SinkGate) {
        let permits = Arc::new(Semaphore::new(0));
        let sink = MemorySink {
            state: Arc::new(Mutex::new(MemorySinkState::default())),
            gate: Some(permits.clone()),
        };
        (sink, SinkGate { permits })
    }

    /// Make every subsequent commit fail with `message`.
    pub fn fail_with(&self, message: &str) {
        self.state.lock().fail_message = Some(message.to_string());
    }

    /// Committed batches, in submission order.
    pub fn batches(&self) -> Vec<Vec<BatchOp>> {
        self.state.lock().batches.clone()
    }

    /// All committed operations flattened into one ordered sequence.
    pub fn committed_ops(&self) -> Vec<BatchOp> {
        self.state.lock().batches.iter().flatten().cloned().collect()
    }

    /// Highest number of commits that were ever in flight at once.
    pub fn max_concurrent_commits(&self) -> usize {
        self.state.lock().max_active
    }

    /// Apply all committed batches to an empty map, honoring deletes.
    pub fn materialize(&self) -> BTreeMap<Bytes, Bytes> {
        let state = self.state.lock();
        let mut map = BTreeMap::new();
        for batch in &state.batches {
            for op in batch {
                match op.kind {
                    OperationKind::Put => {
                        map.insert(op.key.clone(), op.value.clone().unwrap_or_default());
                    }
                    OperationKind::Delete => {
                        map.remove(&op.key);
                    }
                }
            }
        }
        map
    }
}

impl BatchSink for MemorySink {
    fn commit<'a>(
        &'a self,
        ops: Vec<BatchOp>,
    ) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + 'a>> {
        Box::pin(async move {
            {
                let mut state = self.state.lock();
                state.active += 1;
                state.max_active = state.max_active.max(state.active);
            }

            if let Some(gate) = &self.gate {
                match gate.acquire().await {
                    Ok(permit) => permit.forget(),
                    Err(_) => {
                        self.state.lock().active -= 1;
                        return Err(SinkError::Unavailable(
                            "commit gate closed".to_string(),
                        ));
                    }
                }
            }

            let mut state = self.state.lock();
            state.active -= 1;
            if let Some(message) = state.fail_message.clone() {
                return Err(SinkError::Storage(message));
            }
            state.batches.push(ops);
            Ok(())
        })
    }
}

/// Releases commits held by a gated [`MemorySink`].
#[derive(Debug, Clone)]
pub struct SinkGate {
    permits: Arc<Semaphore>,
}

impl SinkGate {
    /// Allow `n` held or future commits to proceed.
    pub fn release(&self, n: usize) {
        self.permits.add_permits(n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_sink_records_batches_in_order() {
        let sink = MemorySink::new();
        sink.commit(vec![BatchOp::put("a", "1")]).await.unwrap();
        sink.commit(vec![BatchOp::put("b", "2"), BatchOp::delete("a")])
            .await
            .unwrap();

        let batches = sink.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0], vec![BatchOp::put("a", "1")]);
        assert_eq!(
            batches[1],
            vec![BatchOp::put("b", "2"), BatchOp::delete("a")]
        );
    }

    #[tokio::test]
    async fn test_memory_sink_materialize_honors_deletes() {
        let sink = MemorySink::new();
        sink.commit(vec![BatchOp::put("a", "1"), BatchOp::put("b", "2")])
            .await
            .unwrap();
        sink.commit(vec![BatchOp::delete("a")]).await.unwrap();

        let map = sink.materialize();
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(&Bytes::from("b")), Some(&Bytes::from("2")));
    }

    #[tokio::test]
    async fn test_memory_sink_failure_injection() {
        let sink = MemorySink::new();
        sink.commit(vec![BatchOp::put("a", "1")]).await.unwrap();
        sink.fail_with("disk full");

        let err = sink.commit(vec![BatchOp::put("b", "2")]).await.unwrap_err();
        assert_eq!(err, SinkError::Storage("disk full".to_string()));
        // The failed batch is not recorded.
        assert_eq!(sink.batches().len(), 1);
    }

    #[tokio::test]
    async fn test_gated_sink_blocks_until_released() {
        let (sink, gate) = MemorySink::gated();
        let worker = sink.clone();
        let task = tokio::spawn(async move {
            worker.commit(vec![BatchOp::put("a", "1")]).await
        });

        tokio::task::yield_now().await;
        assert!(sink.batches().is_empty(), "commit should be held at the gate");

        gate.release(1);
        task.await.unwrap().unwrap();
        assert_eq!(sink.batches().len(), 1);
    }
}
