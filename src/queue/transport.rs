use async_trait::async_trait;

use crate::models::operation::PendingOperation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Accepted by the backend; the operation is done.
    Sent,
    /// Delivery failed; the operation stays queued for a later flush.
    Failed,
    /// Overtaken by newer authoritative state; dropping it is correct.
    Superseded,
}

impl DispatchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchOutcome::Sent => "sent",
            DispatchOutcome::Failed => "failed",
            DispatchOutcome::Superseded => "superseded",
        }
    }
}

/// Where flushed operations go. Failure is an outcome here, not an error:
/// the queue owns the retry bookkeeping.
#[async_trait]
pub trait OperationTransport: Send + Sync {
    async fn dispatch(&self, operation: &PendingOperation) -> DispatchOutcome;
}
