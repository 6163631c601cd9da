pub mod transport;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::SyncError;
use crate::models::operation::{OperationPayload, PendingOperation};
use crate::observability::metrics::Metrics;
use crate::store::{keys, KvStore};

use self::transport::{DispatchOutcome, OperationTransport};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushSummary {
    pub sent: usize,
    pub failed: usize,
    pub superseded: usize,
    pub newly_stuck: usize,
    /// Set when another flush was already running and this call did nothing.
    pub skipped: bool,
}

/// Durable FIFO of writes that could not be delivered immediately. Every
/// mutation is persisted before it is acknowledged, so a killed process
/// picks up exactly where it left off.
pub struct OperationQueue {
    store: Arc<dyn KvStore>,
    transport: Arc<dyn OperationTransport>,
    max_attempts: u32,
    entries: Mutex<Vec<PendingOperation>>,
    flushing: AtomicBool,
    depth_tx: watch::Sender<usize>,
    stuck_tx: watch::Sender<Vec<PendingOperation>>,
    metrics: Arc<Metrics>,
}

impl OperationQueue {
    pub async fn open(
        store: Arc<dyn KvStore>,
        transport: Arc<dyn OperationTransport>,
        max_attempts: u32,
        metrics: Arc<Metrics>,
    ) -> Result<Self, SyncError> {
        let entries: Vec<PendingOperation> = match store.get(keys::PENDING_OPERATIONS).await? {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(error = %err, "discarding unreadable pending queue");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        if !entries.is_empty() {
            info!(pending = entries.len(), "restored pending operations");
        }

        let (depth_tx, _) = watch::channel(entries.len());
        let stuck: Vec<PendingOperation> =
            entries.iter().filter(|op| op.stuck).cloned().collect();
        let (stuck_tx, _) = watch::channel(stuck);
        metrics.pending_operations.set(entries.len() as i64);

        Ok(Self {
            store,
            transport,
            max_attempts,
            entries: Mutex::new(entries),
            flushing: AtomicBool::new(false),
            depth_tx,
            stuck_tx,
            metrics,
        })
    }

    /// Appends an operation and persists the queue before returning. The
    /// operation stays queued in memory even when persistence fails, so a
    /// storage error costs durability but not the operation itself.
    pub async fn enqueue(&self, payload: OperationPayload) -> Result<Uuid, SyncError> {
        let operation = PendingOperation::new(payload);
        let id = operation.id;
        let kind = operation.kind();

        let mut entries = self.entries.lock().await;
        entries.push(operation);
        let result = self.persist(&entries).await;
        self.publish(&entries);
        info!(operation = %id, kind = kind, pending = entries.len(), "operation queued");

        result.map(|()| id)
    }

    /// Attempts every queued operation once, oldest first. Returns
    /// immediately if a flush is already in progress.
    pub async fn flush(&self) -> FlushSummary {
        if self.flushing.swap(true, Ordering::SeqCst) {
            debug!("flush already in progress");
            return FlushSummary {
                skipped: true,
                ..FlushSummary::default()
            };
        }
        let summary = self.flush_inner().await;
        self.flushing.store(false, Ordering::SeqCst);
        summary
    }

    async fn flush_inner(&self) -> FlushSummary {
        let snapshot: Vec<PendingOperation> = {
            let entries = self.entries.lock().await;
            entries.iter().filter(|op| !op.stuck).cloned().collect()
        };
        if snapshot.is_empty() {
            return FlushSummary::default();
        }

        let mut sent = Vec::new();
        let mut superseded = Vec::new();
        let mut failed = Vec::new();
        for operation in &snapshot {
            let outcome = self.transport.dispatch(operation).await;
            self.metrics
                .operations_flushed_total
                .with_label_values(&[outcome.as_str()])
                .inc();
            match outcome {
                DispatchOutcome::Sent => sent.push(operation.id),
                DispatchOutcome::Superseded => {
                    debug!(operation = %operation.id, "dropping superseded operation");
                    superseded.push(operation.id);
                }
                DispatchOutcome::Failed => failed.push(operation.id),
            }
        }

        let mut entries = self.entries.lock().await;
        entries.retain(|op| !sent.contains(&op.id) && !superseded.contains(&op.id));

        let mut newly_stuck = 0;
        for op in entries.iter_mut() {
            if !failed.contains(&op.id) {
                continue;
            }
            op.attempts += 1;
            if op.attempts >= self.max_attempts && !op.stuck {
                op.stuck = true;
                newly_stuck += 1;
                self.metrics
                    .operations_flushed_total
                    .with_label_values(&["stuck"])
                    .inc();
                warn!(
                    operation = %op.id,
                    kind = op.kind(),
                    attempts = op.attempts,
                    "operation exhausted its retry budget"
                );
            }
        }

        if let Err(err) = self.persist(&entries).await {
            error!(error = %err, "failed to persist queue after flush");
        }
        self.publish(&entries);

        let summary = FlushSummary {
            sent: sent.len(),
            failed: failed.len(),
            superseded: superseded.len(),
            newly_stuck,
            skipped: false,
        };
        info!(
            sent = summary.sent,
            failed = summary.failed,
            superseded = summary.superseded,
            pending = entries.len(),
            "flush finished"
        );
        summary
    }

    /// Puts a stuck operation back into rotation with a fresh retry budget.
    pub async fn retry_stuck(&self, id: Uuid) -> Result<(), SyncError> {
        let mut entries = self.entries.lock().await;
        let op = entries
            .iter_mut()
            .find(|op| op.id == id && op.stuck)
            .ok_or_else(|| SyncError::NotFound(format!("stuck operation {id}")))?;
        op.stuck = false;
        op.attempts = 0;
        info!(operation = %id, "stuck operation requeued");

        let result = self.persist(&entries).await;
        self.publish(&entries);
        result
    }

    pub async fn discard(&self, id: Uuid) -> Result<(), SyncError> {
        let mut entries = self.entries.lock().await;
        let position = entries
            .iter()
            .position(|op| op.id == id)
            .ok_or_else(|| SyncError::NotFound(format!("operation {id}")))?;
        let op = entries.remove(position);
        info!(operation = %id, kind = op.kind(), "operation discarded");

        let result = self.persist(&entries).await;
        self.publish(&entries);
        result
    }

    pub fn count(&self) -> usize {
        *self.depth_tx.borrow()
    }

    pub fn depth_watch(&self) -> watch::Receiver<usize> {
        self.depth_tx.subscribe()
    }

    pub fn stuck_watch(&self) -> watch::Receiver<Vec<PendingOperation>> {
        self.stuck_tx.subscribe()
    }

    pub async fn pending(&self) -> Vec<PendingOperation> {
        self.entries.lock().await.clone()
    }

    async fn persist(&self, entries: &[PendingOperation]) -> Result<(), SyncError> {
        let raw = serde_json::to_string(entries)
            .map_err(|err| SyncError::Storage(format!("serialize queue: {err}")))?;
        self.store.put(keys::PENDING_OPERATIONS, raw).await
    }

    fn publish(&self, entries: &[PendingOperation]) {
        self.metrics.pending_operations.set(entries.len() as i64);
        self.depth_tx.send_replace(entries.len());
        self.stuck_tx
            .send_replace(entries.iter().filter(|op| op.stuck).cloned().collect());
    }
}
