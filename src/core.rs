use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::api::{DeliveryApi, RouteEta};
use crate::channel::transport::Connector;
use crate::channel::{ChannelMux, ConnectionState, ReconnectPolicy};
use crate::config::Config;
use crate::error::SyncError;
use crate::models::delivery::Delivery;
use crate::models::geofence::{GeofenceRegion, Leg};
use crate::models::operation::{OperationPayload, PendingOperation};
use crate::observability::metrics::Metrics;
use crate::queue::transport::{DispatchOutcome, OperationTransport};
use crate::queue::{FlushSummary, OperationQueue};
use crate::status::{StatusMachine, TransitionOrigin, TransitionOutcome};
use crate::store::KvStore;
use crate::tracker::source::LocationSource;
use crate::tracker::PositionTracker;
use crate::wire::{topic, EventPayload};

struct DeliveryRuntime {
    delivery: Delivery,
    machine: Arc<StatusMachine>,
    stop_tx: watch::Sender<bool>,
}

/// Composition root. Owns the channel, the queue, the tracker and one status
/// machine per active delivery, and wires the edges between them: remote
/// events feed the machines, status changes rotate geofence legs, and
/// restored connectivity drains the queue.
pub struct SyncCore {
    config: Config,
    metrics: Arc<Metrics>,
    mux: ChannelMux,
    queue: Arc<OperationQueue>,
    tracker: PositionTracker,
    api: Arc<dyn DeliveryApi>,
    deliveries: Arc<DashMap<Uuid, DeliveryRuntime>>,
    flush_watcher: JoinHandle<()>,
}

impl SyncCore {
    pub async fn new(
        config: Config,
        connector: Box<dyn Connector>,
        source: Arc<dyn LocationSource>,
        api: Arc<dyn DeliveryApi>,
        store: Arc<dyn KvStore>,
    ) -> Result<Self, SyncError> {
        let metrics = Arc::new(Metrics::new());

        let base = Duration::from_millis(config.reconnect_delay_ms);
        let max = Duration::from_millis(config.reconnect_max_delay_ms);
        let policy = if max > base {
            ReconnectPolicy::exponential(base, max)
        } else {
            ReconnectPolicy::fixed(base)
        };
        let mux = ChannelMux::new(config.ws_url.clone(), connector, policy, metrics.clone());

        let deliveries: Arc<DashMap<Uuid, DeliveryRuntime>> = Arc::new(DashMap::new());
        let transport = Arc::new(RestTransport {
            api: api.clone(),
            deliveries: deliveries.clone(),
        });
        let queue = Arc::new(
            OperationQueue::open(store.clone(), transport, config.max_attempts, metrics.clone())
                .await?,
        );
        let tracker = PositionTracker::open(
            source,
            mux.clone(),
            queue.clone(),
            store,
            &config,
            metrics.clone(),
        )
        .await?;

        let flush_watcher = spawn_flush_watcher(queue.clone(), mux.state_watch());

        Ok(Self {
            config,
            metrics,
            mux,
            queue,
            tracker,
            api,
            deliveries,
            flush_watcher,
        })
    }

    pub fn connect(&self, credential: &str) {
        self.mux.connect(credential);
    }

    pub async fn disconnect(&self) {
        self.mux.disconnect().await;
    }

    pub fn mux(&self) -> &ChannelMux {
        &self.mux
    }

    pub fn queue(&self) -> &Arc<OperationQueue> {
        &self.queue
    }

    pub fn tracker(&self) -> &PositionTracker {
        &self.tracker
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Fetches the delivery, builds its status machine and wires it into the
    /// live channel and the tracker. Returns the machine for UI use.
    pub async fn begin_delivery(&self, delivery_id: Uuid) -> Result<Arc<StatusMachine>, SyncError> {
        if let Some((_, old)) = self.deliveries.remove(&delivery_id) {
            old.stop_tx.send_replace(true);
        }

        let delivery = self.api.fetch_delivery(delivery_id).await?;
        let machine = Arc::new(StatusMachine::new(
            delivery.id,
            delivery.status,
            self.mux.clone(),
            self.queue.clone(),
            self.metrics.clone(),
        ));
        let (stop_tx, _) = watch::channel(false);

        self.tracker.set_delivery(Some(delivery.id)).await;
        self.tracker
            .set_regions(regions_for(
                &delivery,
                delivery.status.active_leg(),
                self.config.geofence_radius_m,
            ))
            .await;

        spawn_remote_status_task(
            self.mux.clone(),
            machine.clone(),
            delivery.id,
            stop_tx.subscribe(),
        );
        spawn_leg_rotation_task(
            self.tracker.clone(),
            machine.clone(),
            delivery.clone(),
            self.config.geofence_radius_m,
            stop_tx.subscribe(),
        );

        info!(delivery = %delivery.id, status = ?delivery.status, "delivery activated");
        self.deliveries.insert(
            delivery.id,
            DeliveryRuntime {
                delivery,
                machine: machine.clone(),
                stop_tx,
            },
        );
        Ok(machine)
    }

    /// Tears down the runtime for a delivery: the status subscription is
    /// released and the tracker stops attributing points to it.
    pub async fn end_delivery(&self, delivery_id: Uuid) {
        let Some((_, runtime)) = self.deliveries.remove(&delivery_id) else {
            return;
        };
        runtime.stop_tx.send_replace(true);
        self.tracker.set_regions(Vec::new()).await;
        self.tracker.set_delivery(None).await;
        info!(delivery = %delivery_id, "delivery deactivated");
    }

    pub fn machine(&self, delivery_id: Uuid) -> Option<Arc<StatusMachine>> {
        self.deliveries
            .get(&delivery_id)
            .map(|runtime| runtime.machine.clone())
    }

    pub fn delivery(&self, delivery_id: Uuid) -> Option<Delivery> {
        self.deliveries
            .get(&delivery_id)
            .map(|runtime| runtime.delivery.clone())
    }

    /// Applies the status change a confirmed arrival prompt implies:
    /// reaching the pickup means the package was collected, reaching the
    /// drop-off means it was handed over.
    pub async fn confirm_arrival(
        &self,
        delivery_id: Uuid,
        leg: Leg,
    ) -> Result<TransitionOutcome, SyncError> {
        let machine = self
            .machine(delivery_id)
            .ok_or_else(|| SyncError::NotFound(format!("delivery {delivery_id}")))?;
        let next = match leg {
            Leg::Pickup => crate::models::delivery::DeliveryStatus::PickedUp,
            Leg::Dropoff => crate::models::delivery::DeliveryStatus::Delivered,
        };
        Ok(machine.request_transition(next, TransitionOrigin::Local).await)
    }

    /// Queues a support ticket durably and drains the queue right away when
    /// the channel is up.
    pub async fn report_issue(
        &self,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Result<Uuid, SyncError> {
        let id = self
            .queue
            .enqueue(OperationPayload::Ticket {
                subject: subject.into(),
                body: body.into(),
            })
            .await?;
        if self.mux.state() == ConnectionState::Connected {
            self.queue.flush().await;
        }
        Ok(id)
    }

    pub async fn sync_now(&self) -> FlushSummary {
        self.queue.flush().await
    }

    /// ETA from the courier's last known position to the end of the current
    /// leg.
    pub async fn route_eta(&self, delivery_id: Uuid) -> Result<RouteEta, SyncError> {
        let (delivery, machine) = {
            let runtime = self
                .deliveries
                .get(&delivery_id)
                .ok_or_else(|| SyncError::NotFound(format!("delivery {delivery_id}")))?;
            (runtime.delivery.clone(), runtime.machine.clone())
        };

        let target = match machine.current().active_leg() {
            Some(Leg::Pickup) => delivery.pickup,
            _ => delivery.dropoff,
        };
        let from = match self.tracker.last_known().await {
            Some(point) => point.position,
            None => delivery.pickup,
        };
        self.api.fetch_route(&from, &target).await
    }

    /// The platform keeps sampling alive in the background, so nothing to do
    /// here; the hook exists so app shells can wire both directions.
    pub fn on_app_background(&self) {}

    pub async fn on_app_foreground(&self) -> Result<(), SyncError> {
        self.tracker.restart().await
    }

    pub async fn shutdown(&self) {
        self.tracker.stop().await;
        self.mux.disconnect().await;
        for runtime in self.deliveries.iter() {
            runtime.stop_tx.send_replace(true);
        }
        self.deliveries.clear();
        self.flush_watcher.abort();
        info!("sync core stopped");
    }
}

fn regions_for(delivery: &Delivery, leg: Option<Leg>, radius_m: f64) -> Vec<GeofenceRegion> {
    match leg {
        Some(Leg::Pickup) => vec![GeofenceRegion {
            delivery_id: delivery.id,
            leg: Leg::Pickup,
            center: delivery.pickup,
            radius_m,
        }],
        Some(Leg::Dropoff) => vec![GeofenceRegion {
            delivery_id: delivery.id,
            leg: Leg::Dropoff,
            center: delivery.dropoff,
            radius_m,
        }],
        None => Vec::new(),
    }
}

fn spawn_flush_watcher(
    queue: Arc<OperationQueue>,
    mut state_rx: watch::Receiver<ConnectionState>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut previous = *state_rx.borrow();
        while state_rx.changed().await.is_ok() {
            let current = *state_rx.borrow_and_update();
            if previous != ConnectionState::Connected && current == ConnectionState::Connected {
                info!("connectivity restored, draining pending operations");
                queue.flush().await;
            }
            previous = current;
        }
    })
}

fn spawn_remote_status_task(
    mux: ChannelMux,
    machine: Arc<StatusMachine>,
    delivery_id: Uuid,
    mut stop_rx: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut subscription = mux.subscribe(topic::status(delivery_id)).await;
        loop {
            tokio::select! {
                event = subscription.recv() => match event {
                    Some(EventPayload::Status { status, .. }) => {
                        machine
                            .request_transition(status, TransitionOrigin::Remote)
                            .await;
                    }
                    Some(_) => {}
                    None => break,
                },
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        mux.unsubscribe(subscription).await;
                        break;
                    }
                }
            }
        }
    });
}

fn spawn_leg_rotation_task(
    tracker: PositionTracker,
    machine: Arc<StatusMachine>,
    delivery: Delivery,
    radius_m: f64,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut status_rx = machine.observer();
    tokio::spawn(async move {
        let mut active_leg = delivery.status.active_leg();
        loop {
            tokio::select! {
                changed = status_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let status = *status_rx.borrow_and_update();
                    if status.is_terminal() {
                        tracker.set_regions(Vec::new()).await;
                        tracker.set_delivery(None).await;
                        break;
                    }
                    let leg = status.active_leg();
                    if leg != active_leg {
                        tracker
                            .set_regions(regions_for(&delivery, leg, radius_m))
                            .await;
                        active_leg = leg;
                    }
                }
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }
    });
}

struct RestTransport {
    api: Arc<dyn DeliveryApi>,
    deliveries: Arc<DashMap<Uuid, DeliveryRuntime>>,
}

#[async_trait]
impl OperationTransport for RestTransport {
    async fn dispatch(&self, operation: &PendingOperation) -> DispatchOutcome {
        let result = match &operation.payload {
            OperationPayload::Tracking { delivery_id, point } => {
                self.api.submit_tracking_point(*delivery_id, point).await
            }
            OperationPayload::StatusUpdate {
                delivery_id,
                status,
            } => {
                let machine = self
                    .deliveries
                    .get(delivery_id)
                    .map(|runtime| runtime.machine.clone());
                if let Some(machine) = machine {
                    if machine.is_superseded(*status).await {
                        return DispatchOutcome::Superseded;
                    }
                }
                self.api.submit_status_update(*delivery_id, *status).await
            }
            OperationPayload::Ticket { subject, body } => {
                self.api.submit_ticket(subject, body).await
            }
        };

        match result {
            Ok(()) => DispatchOutcome::Sent,
            Err(err) => {
                warn!(operation = %operation.id, error = %err, "dispatch failed");
                DispatchOutcome::Failed
            }
        }
    }
}
