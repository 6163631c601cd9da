pub mod source;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::channel::ChannelMux;
use crate::config::Config;
use crate::error::SyncError;
use crate::geo;
use crate::models::geofence::{GeofenceRegion, Leg};
use crate::models::operation::OperationPayload;
use crate::models::point::{GeoPoint, TrackingPoint};
use crate::observability::metrics::Metrics;
use crate::queue::OperationQueue;
use crate::store::{keys, KvStore};
use crate::wire::{topic, EventPayload, Frame};

use self::source::LocationSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrivalEvent {
    pub delivery_id: Uuid,
    pub leg: Leg,
}

struct ActiveRegion {
    region: GeofenceRegion,
    fired: bool,
}

/// Samples the location source on a fixed cadence, keeps the recent route,
/// evaluates geofences and submits accepted points upstream. Points go out
/// over the live channel when possible and into the offline queue otherwise.
#[derive(Clone)]
pub struct PositionTracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    source: Arc<dyn LocationSource>,
    mux: ChannelMux,
    queue: Arc<OperationQueue>,
    store: Arc<dyn KvStore>,
    sample_interval: Duration,
    min_distance_m: f64,
    history_capacity: usize,
    delivery: Mutex<Option<Uuid>>,
    regions: Mutex<Vec<ActiveRegion>>,
    history: Mutex<VecDeque<TrackingPoint>>,
    last_recorded: Mutex<Option<GeoPoint>>,
    preloaded: Mutex<Option<TrackingPoint>>,
    running_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    updates_tx: broadcast::Sender<TrackingPoint>,
    arrivals_tx: broadcast::Sender<ArrivalEvent>,
    metrics: Arc<Metrics>,
}

impl PositionTracker {
    pub async fn open(
        source: Arc<dyn LocationSource>,
        mux: ChannelMux,
        queue: Arc<OperationQueue>,
        store: Arc<dyn KvStore>,
        config: &Config,
        metrics: Arc<Metrics>,
    ) -> Result<Self, SyncError> {
        let preloaded = match store.get(keys::LAST_POSITION).await? {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(point) => Some(point),
                Err(err) => {
                    warn!(error = %err, "discarding unreadable last position");
                    None
                }
            },
            None => None,
        };

        let (updates_tx, _) = broadcast::channel(config.event_buffer_size);
        let (arrivals_tx, _) = broadcast::channel(config.event_buffer_size);
        let (running_tx, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(TrackerInner {
                source,
                mux,
                queue,
                store,
                sample_interval: Duration::from_millis(config.sample_interval_ms),
                min_distance_m: config.min_distance_m,
                history_capacity: config.history_capacity,
                delivery: Mutex::new(None),
                regions: Mutex::new(Vec::new()),
                history: Mutex::new(VecDeque::new()),
                last_recorded: Mutex::new(None),
                preloaded: Mutex::new(preloaded),
                running_tx,
                task: Mutex::new(None),
                updates_tx,
                arrivals_tx,
                metrics,
            }),
        })
    }

    /// Requests platform permission and starts the sampling loop. Calling
    /// it while already running is a no-op.
    pub async fn start(&self) -> Result<(), SyncError> {
        self.inner.source.request_permission().await?;

        let mut task = self.inner.task.lock().await;
        if task.is_some() {
            return Ok(());
        }

        *self.inner.last_recorded.lock().await = None;
        self.inner.running_tx.send_replace(true);
        *task = Some(tokio::spawn(run_sampler(self.inner.clone())));
        info!(
            interval_ms = self.inner.sample_interval.as_millis() as u64,
            "position sampling started"
        );
        Ok(())
    }

    pub async fn stop(&self) {
        let handle = self.inner.task.lock().await.take();
        if let Some(handle) = handle {
            self.inner.running_tx.send_replace(false);
            let _ = handle.await;
            info!("position sampling stopped");
        }
    }

    /// Full stop/start cycle. Used when the app returns to the foreground so
    /// the timer and the distance filter begin from a clean slate.
    pub async fn restart(&self) -> Result<(), SyncError> {
        self.stop().await;
        self.start().await
    }

    pub async fn set_delivery(&self, delivery: Option<Uuid>) {
        *self.inner.delivery.lock().await = delivery;
    }

    /// Replaces the armed geofence regions. Arrival latches reset, so this
    /// is only called when the active leg actually changes.
    pub async fn set_regions(&self, regions: Vec<GeofenceRegion>) {
        let mut armed = self.inner.regions.lock().await;
        *armed = regions
            .into_iter()
            .map(|region| ActiveRegion {
                region,
                fired: false,
            })
            .collect();
        debug!(regions = armed.len(), "geofence regions replaced");
    }

    pub async fn active_regions(&self) -> Vec<GeofenceRegion> {
        self.inner
            .regions
            .lock()
            .await
            .iter()
            .map(|active| active.region.clone())
            .collect()
    }

    pub async fn history(&self) -> Vec<TrackingPoint> {
        self.inner.history.lock().await.iter().cloned().collect()
    }

    /// Most recent accepted point, falling back to the position persisted by
    /// a previous run. Lets the map render before the first fresh fix.
    pub async fn last_known(&self) -> Option<TrackingPoint> {
        if let Some(point) = self.inner.history.lock().await.back() {
            return Some(point.clone());
        }
        self.inner.preloaded.lock().await.clone()
    }

    pub fn updates(&self) -> broadcast::Receiver<TrackingPoint> {
        self.inner.updates_tx.subscribe()
    }

    pub fn update_stream(&self) -> BroadcastStream<TrackingPoint> {
        BroadcastStream::new(self.inner.updates_tx.subscribe())
    }

    pub fn arrivals(&self) -> broadcast::Receiver<ArrivalEvent> {
        self.inner.arrivals_tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        *self.inner.running_tx.borrow()
    }
}

async fn run_sampler(inner: Arc<TrackerInner>) {
    let mut running_rx = inner.running_tx.subscribe();
    let mut ticker = tokio::time::interval(inner.sample_interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => sample_once(&inner).await,
            changed = running_rx.changed() => {
                if changed.is_err() || !*running_rx.borrow() {
                    return;
                }
            }
        }
    }
}

async fn sample_once(inner: &Arc<TrackerInner>) {
    let fix = match inner.source.current_fix().await {
        Ok(fix) => fix,
        Err(err) => {
            warn!(error = %err, "location fix unavailable");
            return;
        }
    };

    {
        let mut anchor = inner.last_recorded.lock().await;
        if let Some(previous) = anchor.as_ref() {
            let moved = geo::haversine_m(previous, &fix.position);
            if moved < inner.min_distance_m {
                debug!(moved_m = moved, "sample below distance threshold");
                return;
            }
        }
        *anchor = Some(fix.position);
    }

    let point = TrackingPoint {
        position: fix.position,
        accuracy_m: fix.accuracy_m,
        speed_mps: fix.speed_mps,
        recorded_at: Utc::now(),
    };

    {
        let mut history = inner.history.lock().await;
        if history.len() >= inner.history_capacity {
            history.pop_front();
        }
        history.push_back(point.clone());
    }

    inner.metrics.tracking_points_total.inc();
    let _ = inner.updates_tx.send(point.clone());

    match serde_json::to_string(&point) {
        Ok(raw) => {
            if let Err(err) = inner.store.put(keys::LAST_POSITION, raw).await {
                warn!(error = %err, "failed to persist last position");
            }
        }
        Err(err) => warn!(error = %err, "failed to serialize last position"),
    }

    evaluate_geofences(inner, &point.position).await;
    submit_point(inner, point).await;
}

async fn evaluate_geofences(inner: &Arc<TrackerInner>, position: &GeoPoint) {
    let mut regions = inner.regions.lock().await;
    for active in regions.iter_mut() {
        if active.fired || !active.region.contains(position) {
            continue;
        }
        // Latched until the regions are replaced for the next leg.
        active.fired = true;
        inner.metrics.geofence_arrivals_total.inc();
        info!(
            delivery = %active.region.delivery_id,
            leg = ?active.region.leg,
            "arrived at geofence"
        );
        let _ = inner.arrivals_tx.send(ArrivalEvent {
            delivery_id: active.region.delivery_id,
            leg: active.region.leg,
        });
    }
}

async fn submit_point(inner: &Arc<TrackerInner>, point: TrackingPoint) {
    let Some(delivery_id) = *inner.delivery.lock().await else {
        return;
    };

    let frame = Frame::Publish {
        channel: topic::location(delivery_id),
        event: EventPayload::Tracking(point.clone()),
    };
    if inner.mux.send(&frame).await {
        debug!(delivery = %delivery_id, "tracking point published");
        return;
    }

    if let Err(err) = inner
        .queue
        .enqueue(OperationPayload::Tracking { delivery_id, point })
        .await
    {
        error!(error = %err, "failed to queue tracking point");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ConnectionState, ReconnectPolicy};
    use crate::store::MemoryKvStore;
    use crate::testing::{test_config, RecordingTransport, ScriptedConnector, ScriptedLocationSource};

    fn fix_at(lat: f64, lng: f64) -> source::Fix {
        source::Fix {
            position: GeoPoint { lat, lng },
            accuracy_m: 5.0,
            speed_mps: 8.0,
        }
    }

    struct Setup {
        tracker: PositionTracker,
        queue: Arc<OperationQueue>,
        mux: ChannelMux,
        store: Arc<dyn KvStore>,
        links: tokio::sync::mpsc::UnboundedReceiver<crate::testing::TestLink>,
    }

    async fn setup(source: ScriptedLocationSource, config: Config) -> Setup {
        let metrics = Arc::new(Metrics::new());
        let connector = ScriptedConnector::new();
        let links = connector.links();
        let mux = ChannelMux::new(
            "wss://gateway.test/ws".to_string(),
            Box::new(connector.clone()),
            ReconnectPolicy::fixed(Duration::from_secs(5)),
            metrics.clone(),
        );
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let queue = Arc::new(
            OperationQueue::open(
                store.clone(),
                Arc::new(RecordingTransport::new()),
                config.max_attempts,
                metrics.clone(),
            )
            .await
            .unwrap(),
        );
        let tracker = PositionTracker::open(
            Arc::new(source),
            mux.clone(),
            queue.clone(),
            store.clone(),
            &config,
            metrics,
        )
        .await
        .unwrap();

        Setup {
            tracker,
            queue,
            mux,
            store,
            links,
        }
    }

    async fn wait_for_connected(mux: &ChannelMux) {
        let mut rx = mux.state_watch();
        while *rx.borrow() != ConnectionState::Connected {
            rx.changed().await.unwrap();
        }
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn permission_denial_blocks_sampling() {
        let setup = setup(ScriptedLocationSource::denied(), test_config()).await;
        let err = setup.tracker.start().await.unwrap_err();
        assert!(matches!(err, SyncError::PermissionDenied));
        assert!(!setup.tracker.is_running());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn nearby_samples_are_dropped_by_the_distance_filter() {
        // ~0m, ~5m and ~50m from the first point.
        let source = ScriptedLocationSource::with_fixes(vec![
            fix_at(53.551100, 9.9937),
            fix_at(53.551145, 9.9937),
            fix_at(53.551550, 9.9937),
        ]);
        let setup = setup(source, test_config()).await;

        setup.tracker.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(31)).await;
        setup.tracker.stop().await;

        let history = setup.tracker.history().await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].position.lat, 53.551100);
        assert_eq!(history[1].position.lat, 53.551550);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn history_keeps_only_the_newest_points() {
        let fixes: Vec<_> = (0..6)
            .map(|i| fix_at(53.5511 + i as f64 * 0.001, 9.9937))
            .collect();
        let source = ScriptedLocationSource::with_fixes(fixes);
        let mut config = test_config();
        config.history_capacity = 3;
        let setup = setup(source, config).await;

        setup.tracker.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(80)).await;
        setup.tracker.stop().await;

        let history = setup.tracker.history().await;
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].position.lat, 53.5541);
        assert_eq!(history[2].position.lat, 53.5561);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn zero_capacity_history_keeps_at_most_the_newest_point() {
        let source = ScriptedLocationSource::with_fixes(vec![
            fix_at(53.5511, 9.9937),
            fix_at(53.5521, 9.9937),
            fix_at(53.5531, 9.9937),
            fix_at(53.5541, 9.9937),
        ]);
        let mut config = test_config();
        config.history_capacity = 0;
        let setup = setup(source, config).await;

        setup.tracker.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(50)).await;
        setup.tracker.stop().await;

        let history = setup.tracker.history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].position.lat, 53.5541);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn update_subscribers_see_only_accepted_points() {
        // ~0m, ~5m and ~50m from the first point.
        let source = ScriptedLocationSource::with_fixes(vec![
            fix_at(53.551100, 9.9937),
            fix_at(53.551145, 9.9937),
            fix_at(53.551550, 9.9937),
        ]);
        let setup = setup(source, test_config()).await;
        let mut updates = setup.tracker.updates();

        setup.tracker.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(31)).await;
        setup.tracker.stop().await;

        assert_eq!(updates.recv().await.unwrap().position.lat, 53.551100);
        assert_eq!(updates.recv().await.unwrap().position.lat, 53.551550);
        assert!(updates.try_recv().is_err());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn geofence_arrival_fires_once_per_leg() {
        let delivery_id = Uuid::new_v4();
        let target = GeoPoint {
            lat: 53.5600,
            lng: 9.9937,
        };
        // Approach, enter, then keep moving inside the region.
        let source = ScriptedLocationSource::with_fixes(vec![
            fix_at(53.5511, 9.9937),
            fix_at(53.5599, 9.9937),
            fix_at(53.5600, 9.9937),
            fix_at(53.5601, 9.9937),
        ]);
        let setup = setup(source, test_config()).await;
        let mut arrivals = setup.tracker.arrivals();

        setup
            .tracker
            .set_regions(vec![GeofenceRegion {
                delivery_id,
                leg: Leg::Pickup,
                center: target,
                radius_m: 75.0,
            }])
            .await;

        setup.tracker.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(61)).await;
        setup.tracker.stop().await;

        let event = arrivals.recv().await.unwrap();
        assert_eq!(event.delivery_id, delivery_id);
        assert_eq!(event.leg, Leg::Pickup);
        assert!(arrivals.try_recv().is_err());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn points_are_queued_while_offline() {
        let source = ScriptedLocationSource::with_fixes(vec![
            fix_at(53.5511, 9.9937),
            fix_at(53.5520, 9.9937),
        ]);
        let setup = setup(source, test_config()).await;
        let delivery_id = Uuid::new_v4();
        setup.tracker.set_delivery(Some(delivery_id)).await;

        setup.tracker.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(16)).await;
        setup.tracker.stop().await;

        assert_eq!(setup.queue.count(), 2);
        let pending = setup.queue.pending().await;
        assert!(matches!(
            &pending[0].payload,
            OperationPayload::Tracking { delivery_id: id, .. } if *id == delivery_id
        ));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn points_are_published_while_online() {
        let source = ScriptedLocationSource::with_fixes(vec![fix_at(53.5511, 9.9937)]);
        let mut setup = setup(source, test_config()).await;
        let delivery_id = Uuid::new_v4();
        setup.tracker.set_delivery(Some(delivery_id)).await;

        setup.mux.connect("token");
        let mut link = setup.links.recv().await.unwrap();
        wait_for_connected(&setup.mux).await;

        setup.tracker.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        setup.tracker.stop().await;

        assert_eq!(setup.queue.count(), 0);
        match link.next_sent().await {
            Some(Frame::Publish { channel, event }) => {
                assert_eq!(channel, topic::location(delivery_id));
                assert!(matches!(event, EventPayload::Tracking(_)));
            }
            other => panic!("expected a publish frame, got {other:?}"),
        }
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn restart_resets_the_distance_filter() {
        let source = ScriptedLocationSource::with_fixes(vec![fix_at(53.5511, 9.9937)]);
        let setup = setup(source, test_config()).await;

        setup.tracker.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        setup.tracker.restart().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        setup.tracker.stop().await;

        // The same coordinate passes the filter again after a restart.
        assert_eq!(setup.tracker.history().await.len(), 2);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn last_known_position_survives_a_restart() {
        let source = ScriptedLocationSource::with_fixes(vec![fix_at(53.5511, 9.9937)]);
        let setup = setup(source, test_config()).await;

        setup.tracker.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        setup.tracker.stop().await;

        let config = test_config();
        let fresh = PositionTracker::open(
            Arc::new(ScriptedLocationSource::with_fixes(Vec::new())),
            setup.mux.clone(),
            setup.queue.clone(),
            setup.store.clone(),
            &config,
            Arc::new(Metrics::new()),
        )
        .await
        .unwrap();

        let last = fresh.last_known().await.unwrap();
        assert_eq!(last.position.lat, 53.5511);
    }
}
