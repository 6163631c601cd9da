use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::channel::ChannelMux;
use crate::models::delivery::DeliveryStatus;
use crate::models::operation::OperationPayload;
use crate::observability::metrics::Metrics;
use crate::queue::OperationQueue;
use crate::wire::{topic, EventPayload, Frame};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOrigin {
    Local,
    Remote,
}

impl TransitionOrigin {
    fn as_str(&self) -> &'static str {
        match self {
            TransitionOrigin::Local => "local",
            TransitionOrigin::Remote => "remote",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    /// The request named an edge the lifecycle does not allow. Nothing
    /// changed; this is an expected answer, not an error.
    Ignored,
}

struct MachineState {
    current: DeliveryStatus,
    /// Highest status the server has confirmed, used to recognize queued
    /// local updates that remote progress has already overtaken.
    remote_floor: Option<DeliveryStatus>,
}

/// Serializes status changes for one delivery and enforces the forward-only
/// lifecycle. Local changes are submitted durably; remote ones only move the
/// machine.
pub struct StatusMachine {
    delivery_id: Uuid,
    mux: ChannelMux,
    queue: Arc<OperationQueue>,
    state: Mutex<MachineState>,
    status_tx: watch::Sender<DeliveryStatus>,
    metrics: Arc<Metrics>,
}

impl StatusMachine {
    pub fn new(
        delivery_id: Uuid,
        initial: DeliveryStatus,
        mux: ChannelMux,
        queue: Arc<OperationQueue>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (status_tx, _) = watch::channel(initial);
        Self {
            delivery_id,
            mux,
            queue,
            state: Mutex::new(MachineState {
                current: initial,
                remote_floor: None,
            }),
            status_tx,
            metrics,
        }
    }

    pub fn delivery_id(&self) -> Uuid {
        self.delivery_id
    }

    pub fn current(&self) -> DeliveryStatus {
        *self.status_tx.borrow()
    }

    pub fn observer(&self) -> watch::Receiver<DeliveryStatus> {
        self.status_tx.subscribe()
    }

    /// Evaluates one transition request. The internal lock holds until the
    /// request fully resolves, so overlapping requests are applied one at a
    /// time in arrival order.
    pub async fn request_transition(
        &self,
        to: DeliveryStatus,
        origin: TransitionOrigin,
    ) -> TransitionOutcome {
        let mut state = self.state.lock().await;

        if origin == TransitionOrigin::Remote {
            // Even a duplicate confirmation raises the floor.
            state.remote_floor = match state.remote_floor {
                Some(floor) if floor.rank() >= to.rank() => Some(floor),
                _ => Some(to),
            };
        }

        let from = state.current;
        if !from.can_transition_to(to) {
            debug!(
                delivery = %self.delivery_id,
                from = ?from,
                to = ?to,
                origin = origin.as_str(),
                "ignoring illegal status transition"
            );
            self.metrics
                .status_transitions_total
                .with_label_values(&[origin.as_str(), "ignored"])
                .inc();
            return TransitionOutcome::Ignored;
        }

        state.current = to;

        if origin == TransitionOrigin::Local {
            let frame = Frame::Publish {
                channel: topic::status(self.delivery_id),
                event: EventPayload::Status {
                    delivery_id: self.delivery_id,
                    status: to,
                },
            };
            if !self.mux.send(&frame).await {
                if let Err(err) = self
                    .queue
                    .enqueue(OperationPayload::StatusUpdate {
                        delivery_id: self.delivery_id,
                        status: to,
                    })
                    .await
                {
                    error!(error = %err, "failed to queue status update");
                }
            }
        }

        self.status_tx.send_replace(to);
        self.metrics
            .status_transitions_total
            .with_label_values(&[origin.as_str(), "applied"])
            .inc();
        info!(
            delivery = %self.delivery_id,
            from = ?from,
            to = ?to,
            origin = origin.as_str(),
            "delivery status advanced"
        );
        TransitionOutcome::Applied
    }

    /// True when remote progress has made a queued update for this status
    /// pointless: the floor has reached or passed it, or the delivery is
    /// already in a terminal state.
    pub async fn is_superseded(&self, status: DeliveryStatus) -> bool {
        let state = self.state.lock().await;
        match state.remote_floor {
            Some(floor) => floor.rank() >= status.rank() || floor.is_terminal(),
            None => false,
        }
    }
}
