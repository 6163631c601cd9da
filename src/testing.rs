//! Deterministic fakes for exercising the sync stack without sockets, GPS
//! hardware or a live backend.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::api::{DeliveryApi, RouteEta};
use crate::channel::transport::{Connector, FrameSink, FrameStream};
use crate::config::Config;
use crate::error::SyncError;
use crate::geo;
use crate::models::delivery::{Delivery, DeliveryStatus};
use crate::models::point::{GeoPoint, TrackingPoint};
use crate::queue::transport::{DispatchOutcome, OperationTransport};
use crate::tracker::source::{Fix, LocationSource};
use crate::wire::{self, Frame};

/// The server end of one dialed connection: frames the client wrote arrive
/// on `next_sent`, `push` injects frames towards the client, `push_text`
/// injects raw text for traffic that must not decode, and `close` simulates
/// the server dropping the socket.
pub struct TestLink {
    sent: mpsc::UnboundedReceiver<String>,
    push_tx: Option<mpsc::UnboundedSender<String>>,
}

impl TestLink {
    pub fn push(&self, frame: &Frame) {
        self.push_text(wire::encode(frame).expect("encodable frame"));
    }

    pub fn push_text(&self, text: impl Into<String>) {
        if let Some(tx) = &self.push_tx {
            let _ = tx.send(text.into());
        }
    }

    pub async fn next_sent(&mut self) -> Option<Frame> {
        let text = self.sent.recv().await?;
        Some(wire::decode(&text).expect("decodable frame"))
    }

    pub fn no_pending_sent(&mut self) -> bool {
        self.sent.try_recv().is_err()
    }

    pub fn close(&mut self) {
        self.push_tx = None;
    }
}

/// Connector whose dials hand out in-memory links. Dial failures can be
/// scripted; every produced [`TestLink`] shows up on the `links` receiver.
#[derive(Clone)]
pub struct ScriptedConnector {
    inner: Arc<ConnectorInner>,
}

struct ConnectorInner {
    failures: std::sync::Mutex<VecDeque<String>>,
    links_tx: mpsc::UnboundedSender<TestLink>,
    links_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<TestLink>>>,
    dials: AtomicUsize,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        let (links_tx, links_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(ConnectorInner {
                failures: std::sync::Mutex::new(VecDeque::new()),
                links_tx,
                links_rx: std::sync::Mutex::new(Some(links_rx)),
                dials: AtomicUsize::new(0),
            }),
        }
    }

    pub fn links(&self) -> mpsc::UnboundedReceiver<TestLink> {
        self.inner
            .links_rx
            .lock()
            .expect("links lock")
            .take()
            .expect("links receiver already taken")
    }

    pub fn fail_next(&self, count: usize) {
        let mut failures = self.inner.failures.lock().expect("failures lock");
        for _ in 0..count {
            failures.push_back("scripted dial failure".to_string());
        }
    }

    pub fn dials(&self) -> usize {
        self.inner.dials.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn dial(
        &self,
        _url: &str,
    ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>), SyncError> {
        self.inner.dials.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.inner.failures.lock().expect("failures lock").pop_front() {
            return Err(SyncError::Connectivity(message));
        }

        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let (push_tx, push_rx) = mpsc::unbounded_channel();
        let _ = self.inner.links_tx.send(TestLink {
            sent: sent_rx,
            push_tx: Some(push_tx),
        });
        Ok((
            Box::new(ChanSink { tx: sent_tx }),
            Box::new(ChanStream { rx: push_rx }),
        ))
    }
}

struct ChanSink {
    tx: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl FrameSink for ChanSink {
    async fn send(&mut self, text: String) -> Result<(), SyncError> {
        self.tx
            .send(text)
            .map_err(|_| SyncError::Connectivity("test link closed".to_string()))
    }

    async fn close(&mut self) {}
}

struct ChanStream {
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl FrameStream for ChanStream {
    async fn next(&mut self) -> Option<Result<String, SyncError>> {
        self.rx.recv().await.map(Ok)
    }
}

/// Location source that replays a scripted list of fixes, then keeps
/// repeating the final one.
pub struct ScriptedLocationSource {
    denied: bool,
    fixes: Mutex<VecDeque<Fix>>,
    last: Mutex<Option<Fix>>,
}

impl ScriptedLocationSource {
    pub fn with_fixes(fixes: Vec<Fix>) -> Self {
        Self {
            denied: false,
            fixes: Mutex::new(fixes.into()),
            last: Mutex::new(None),
        }
    }

    pub fn denied() -> Self {
        Self {
            denied: true,
            fixes: Mutex::new(VecDeque::new()),
            last: Mutex::new(None),
        }
    }
}

#[async_trait]
impl LocationSource for ScriptedLocationSource {
    async fn request_permission(&self) -> Result<(), SyncError> {
        if self.denied {
            return Err(SyncError::PermissionDenied);
        }
        Ok(())
    }

    async fn current_fix(&self) -> Result<Fix, SyncError> {
        if let Some(fix) = self.fixes.lock().await.pop_front() {
            *self.last.lock().await = Some(fix.clone());
            return Ok(fix);
        }
        match self.last.lock().await.clone() {
            Some(fix) => Ok(fix),
            None => Err(SyncError::Connectivity("no scripted fix".to_string())),
        }
    }
}

/// Transport that records dispatched operation ids and answers with scripted
/// outcomes, falling back to a default once the script runs out.
#[derive(Clone)]
pub struct RecordingTransport {
    inner: Arc<TransportInner>,
}

struct TransportInner {
    script: std::sync::Mutex<VecDeque<DispatchOutcome>>,
    default_outcome: DispatchOutcome,
    delay: std::sync::Mutex<Option<Duration>>,
    dispatched: std::sync::Mutex<Vec<Uuid>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::always(DispatchOutcome::Sent)
    }

    pub fn always(outcome: DispatchOutcome) -> Self {
        Self {
            inner: Arc::new(TransportInner {
                script: std::sync::Mutex::new(VecDeque::new()),
                default_outcome: outcome,
                delay: std::sync::Mutex::new(None),
                dispatched: std::sync::Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn scripted(outcomes: impl IntoIterator<Item = DispatchOutcome>) -> Self {
        let transport = Self::new();
        transport
            .inner
            .script
            .lock()
            .expect("script lock")
            .extend(outcomes);
        transport
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.inner.delay.lock().expect("delay lock") = Some(delay);
    }

    pub fn dispatched(&self) -> Vec<Uuid> {
        self.inner.dispatched.lock().expect("dispatched lock").clone()
    }
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OperationTransport for RecordingTransport {
    async fn dispatch(&self, operation: &crate::models::operation::PendingOperation) -> DispatchOutcome {
        let delay = *self.inner.delay.lock().expect("delay lock");
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.inner
            .dispatched
            .lock()
            .expect("dispatched lock")
            .push(operation.id);
        self.inner
            .script
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or(self.inner.default_outcome)
    }
}

/// In-memory stand-in for the dispatch backend. Flip `set_offline` to make
/// every call fail the way an unreachable network does.
pub struct FakeDeliveryApi {
    deliveries: DashMap<Uuid, Delivery>,
    offline: AtomicBool,
    tracking: std::sync::Mutex<Vec<(Uuid, TrackingPoint)>>,
    statuses: std::sync::Mutex<Vec<(Uuid, DeliveryStatus)>>,
    tickets: std::sync::Mutex<Vec<(String, String)>>,
}

impl FakeDeliveryApi {
    pub fn new() -> Self {
        Self {
            deliveries: DashMap::new(),
            offline: AtomicBool::new(false),
            tracking: std::sync::Mutex::new(Vec::new()),
            statuses: std::sync::Mutex::new(Vec::new()),
            tickets: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn insert_delivery(&self, delivery: Delivery) {
        self.deliveries.insert(delivery.id, delivery);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn tracking_submissions(&self) -> Vec<(Uuid, TrackingPoint)> {
        self.tracking.lock().expect("tracking lock").clone()
    }

    pub fn status_submissions(&self) -> Vec<(Uuid, DeliveryStatus)> {
        self.statuses.lock().expect("statuses lock").clone()
    }

    pub fn tickets(&self) -> Vec<(String, String)> {
        self.tickets.lock().expect("tickets lock").clone()
    }

    fn check_online(&self) -> Result<(), SyncError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(SyncError::Connectivity("backend unreachable".to_string()));
        }
        Ok(())
    }
}

impl Default for FakeDeliveryApi {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeliveryApi for FakeDeliveryApi {
    async fn fetch_delivery(&self, delivery_id: Uuid) -> Result<Delivery, SyncError> {
        self.check_online()?;
        self.deliveries
            .get(&delivery_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| SyncError::NotFound(format!("delivery {delivery_id}")))
    }

    async fn submit_tracking_point(
        &self,
        delivery_id: Uuid,
        point: &TrackingPoint,
    ) -> Result<(), SyncError> {
        self.check_online()?;
        self.tracking
            .lock()
            .expect("tracking lock")
            .push((delivery_id, point.clone()));
        Ok(())
    }

    async fn submit_status_update(
        &self,
        delivery_id: Uuid,
        status: DeliveryStatus,
    ) -> Result<(), SyncError> {
        self.check_online()?;
        self.statuses
            .lock()
            .expect("statuses lock")
            .push((delivery_id, status));
        Ok(())
    }

    async fn submit_ticket(&self, subject: &str, body: &str) -> Result<(), SyncError> {
        self.check_online()?;
        self.tickets
            .lock()
            .expect("tickets lock")
            .push((subject.to_string(), body.to_string()));
        Ok(())
    }

    async fn fetch_route(&self, from: &GeoPoint, to: &GeoPoint) -> Result<RouteEta, SyncError> {
        self.check_online()?;
        let distance_m = geo::haversine_m(from, to);
        Ok(RouteEta {
            distance_m,
            duration_s: distance_m / 8.0,
        })
    }
}

pub fn sample_delivery(status: DeliveryStatus) -> Delivery {
    Delivery {
        id: Uuid::new_v4(),
        pickup: GeoPoint {
            lat: 53.5511,
            lng: 9.9937,
        },
        dropoff: GeoPoint {
            lat: 53.5600,
            lng: 10.0030,
        },
        status,
        created_at: Utc::now(),
    }
}

pub fn test_config() -> Config {
    Config {
        ws_url: "wss://gateway.test/ws".to_string(),
        ws_token: "test-token".to_string(),
        log_level: "debug".to_string(),
        store_path: "unused".to_string(),
        connect_timeout_ms: 1_000,
        reconnect_delay_ms: 5_000,
        reconnect_max_delay_ms: 5_000,
        sample_interval_ms: 15_000,
        min_distance_m: 10.0,
        history_capacity: 120,
        geofence_radius_m: 75.0,
        max_attempts: 5,
        event_buffer_size: 64,
    }
}
