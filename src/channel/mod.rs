pub mod transport;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use crate::observability::metrics::Metrics;
use crate::wire::{self, EventPayload, Frame};

use self::transport::{Connector, FrameSink, FrameStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelError {
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Delay schedule for reconnect attempts. A fixed policy retries on a
/// constant cadence; the exponential one doubles per consecutive failure up
/// to a cap. The streak resets once a connection is established.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    base: Duration,
    max: Duration,
}

impl ReconnectPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base: delay,
            max: delay,
        }
    }

    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return self.base;
        }
        let shift = (attempt - 1).min(16);
        self.base.saturating_mul(1u32 << shift).min(self.max)
    }
}

/// A registered interest in one topic. Dropping the subscription without
/// calling [`ChannelMux::unsubscribe`] leaves the topic registered.
pub struct Subscription {
    id: u64,
    topic: String,
    receiver: mpsc::UnboundedReceiver<EventPayload>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn recv(&mut self) -> Option<EventPayload> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<EventPayload> {
        self.receiver.try_recv().ok()
    }
}

#[derive(Default)]
struct TopicEntry {
    subscribers: Vec<(u64, mpsc::UnboundedSender<EventPayload>)>,
}

/// Multiplexes every realtime topic over one socket. Server interest is
/// reference counted per topic: the first subscriber triggers a subscribe
/// control frame, the last departing one an unsubscribe.
#[derive(Clone)]
pub struct ChannelMux {
    inner: Arc<MuxInner>,
}

struct MuxInner {
    url: String,
    connector: Box<dyn Connector>,
    policy: ReconnectPolicy,
    topics: DashMap<String, TopicEntry>,
    next_subscription: AtomicU64,
    epoch: AtomicU64,
    desired_tx: watch::Sender<bool>,
    writer: Mutex<Option<Box<dyn FrameSink>>>,
    state_tx: watch::Sender<ConnectionState>,
    last_error_tx: watch::Sender<Option<ChannelError>>,
    metrics: Arc<Metrics>,
}

impl ChannelMux {
    pub fn new(
        url: String,
        connector: Box<dyn Connector>,
        policy: ReconnectPolicy,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (desired_tx, _) = watch::channel(false);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (last_error_tx, _) = watch::channel(None);

        Self {
            inner: Arc::new(MuxInner {
                url,
                connector,
                policy,
                topics: DashMap::new(),
                next_subscription: AtomicU64::new(1),
                epoch: AtomicU64::new(0),
                desired_tx,
                writer: Mutex::new(None),
                state_tx,
                last_error_tx,
                metrics,
            }),
        }
    }

    /// Opens the socket and keeps it open until [`disconnect`] is called.
    /// A second call while already open or opening is a no-op.
    ///
    /// [`disconnect`]: ChannelMux::disconnect
    pub fn connect(&self, credential: &str) {
        // A notification without a value change would wake a supervisor out
        // of its backoff sleep and cut the reconnect delay short, so only an
        // actual flip gets sent.
        let switched = self.inner.desired_tx.send_if_modified(|desired| {
            if *desired {
                return false;
            }
            *desired = true;
            true
        });
        if !switched {
            return;
        }
        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let url = format!("{}?token={}", self.inner.url, credential);
        tokio::spawn(run_supervisor(self.inner.clone(), url, epoch));
    }

    /// Closes the socket, cancels any pending reconnect and discards every
    /// registered subscription.
    pub async fn disconnect(&self) {
        self.inner.desired_tx.send_replace(false);
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        {
            // State changes ride the writer lock; a supervisor that lost the
            // epoch race cannot flip the state back afterwards.
            let mut writer = self.inner.writer.lock().await;
            if let Some(mut sink) = writer.take() {
                sink.close().await;
            }
            self.inner.set_state(ConnectionState::Disconnected);
        }
        self.inner.topics.clear();
        info!("channel disconnected");
    }

    pub async fn subscribe(&self, topic: impl Into<String>) -> Subscription {
        let topic = topic.into();
        let id = self.inner.next_subscription.fetch_add(1, Ordering::Relaxed);
        let (tx, receiver) = mpsc::unbounded_channel();

        let first = {
            let mut entry = self.inner.topics.entry(topic.clone()).or_default();
            let first = entry.subscribers.is_empty();
            entry.subscribers.push((id, tx));
            first
        };

        if first {
            debug!(topic = %topic, "first subscriber, announcing interest");
            let _ = self
                .send(&Frame::Subscribe {
                    channel: topic.clone(),
                })
                .await;
        }

        Subscription {
            id,
            topic,
            receiver,
        }
    }

    pub async fn unsubscribe(&self, subscription: Subscription) {
        let Subscription { id, topic, .. } = subscription;
        let removed = self.inner.topics.remove_if_mut(&topic, |_, entry| {
            entry.subscribers.retain(|(sid, _)| *sid != id);
            entry.subscribers.is_empty()
        });

        if removed.is_some() {
            debug!(topic = %topic, "last subscriber left, dropping interest");
            let _ = self.send(&Frame::Unsubscribe { channel: topic }).await;
        }
    }

    /// Writes one frame to the socket. Returns false when there is no open
    /// connection or the write fails, so callers can fall back to the queue.
    pub async fn send(&self, frame: &Frame) -> bool {
        let text = match wire::encode(frame) {
            Ok(text) => text,
            Err(err) => {
                self.inner.record_error(err.to_string());
                return false;
            }
        };

        let mut writer = self.inner.writer.lock().await;
        match writer.as_mut() {
            Some(sink) => match sink.send(text).await {
                Ok(()) => true,
                Err(err) => {
                    // The read loop will notice the dead socket as well; the
                    // supervisor owns the reconnect from there.
                    *writer = None;
                    self.inner.record_error(err.to_string());
                    false
                }
            },
            None => false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn last_error(&self) -> Option<ChannelError> {
        self.inner.last_error_tx.borrow().clone()
    }

    pub fn last_error_watch(&self) -> watch::Receiver<Option<ChannelError>> {
        self.inner.last_error_tx.subscribe()
    }

    pub fn subscribed_topics(&self) -> usize {
        self.inner.topics.len()
    }
}

impl MuxInner {
    fn set_state(&self, state: ConnectionState) {
        self.metrics
            .channel_connected
            .set((state == ConnectionState::Connected) as i64);
        self.state_tx.send_replace(state);
    }

    fn record_error(&self, message: String) {
        self.last_error_tx.send_replace(Some(ChannelError {
            message,
            at: Utc::now(),
        }));
    }

    fn dispatch(&self, channel: &str, event: EventPayload) {
        match self.topics.get(channel) {
            Some(entry) => {
                for (_, tx) in &entry.subscribers {
                    let _ = tx.send(event.clone());
                }
            }
            None => debug!(channel = %channel, "event for unregistered topic"),
        }
    }

    async fn resubscribe(&self) {
        let topics: Vec<String> = self.topics.iter().map(|entry| entry.key().clone()).collect();
        for topic in topics {
            debug!(topic = %topic, "restoring topic interest");
            self.send_text(&Frame::Subscribe { channel: topic }).await;
        }
    }

    async fn send_text(&self, frame: &Frame) {
        let Ok(text) = wire::encode(frame) else {
            return;
        };
        let mut writer = self.writer.lock().await;
        if let Some(sink) = writer.as_mut() {
            if let Err(err) = sink.send(text).await {
                *writer = None;
                self.record_error(err.to_string());
            }
        }
    }
}

async fn run_supervisor(inner: Arc<MuxInner>, url: String, epoch: u64) {
    let mut desired_rx = inner.desired_tx.subscribe();
    let mut failure_streak: u32 = 0;

    loop {
        {
            let _writer = inner.writer.lock().await;
            if !current(&inner, epoch) || !*desired_rx.borrow() {
                break;
            }
            inner.set_state(ConnectionState::Connecting);
        }

        match inner.connector.dial(&url).await {
            Ok((mut sink, stream)) => {
                {
                    let mut writer = inner.writer.lock().await;
                    if !current(&inner, epoch) || !*desired_rx.borrow() {
                        sink.close().await;
                        break;
                    }
                    failure_streak = 0;
                    *writer = Some(sink);
                    inner.set_state(ConnectionState::Connected);
                }
                info!("channel connected");

                inner.resubscribe().await;
                read_loop(&inner, stream, &mut desired_rx).await;

                {
                    let mut writer = inner.writer.lock().await;
                    if !current(&inner, epoch) {
                        break;
                    }
                    if let Some(mut sink) = writer.take() {
                        sink.close().await;
                    }
                    inner.set_state(ConnectionState::Disconnected);
                }
                info!("channel closed");
            }
            Err(err) => {
                failure_streak += 1;
                warn!(error = %err, attempt = failure_streak, "connect attempt failed");
                inner.record_error(err.to_string());
                if current(&inner, epoch) {
                    inner.set_state(ConnectionState::Disconnected);
                }
            }
        }

        if !current(&inner, epoch) || !*desired_rx.borrow() {
            break;
        }
        let delay = inner.policy.delay(failure_streak.max(1));
        inner.metrics.channel_reconnects_total.inc();
        debug!(delay_ms = delay.as_millis() as u64, "scheduling reconnect");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = desired_rx.changed() => {}
        }
    }
}

fn current(inner: &MuxInner, epoch: u64) -> bool {
    inner.epoch.load(Ordering::SeqCst) == epoch
}

async fn read_loop(
    inner: &Arc<MuxInner>,
    mut stream: Box<dyn FrameStream>,
    desired_rx: &mut watch::Receiver<bool>,
) {
    loop {
        let item = tokio::select! {
            item = stream.next() => item,
            _ = desired_rx.changed() => {
                if !*desired_rx.borrow() {
                    return;
                }
                continue;
            }
        };

        match item {
            Some(Ok(text)) => match wire::decode(&text) {
                Ok(Frame::Ping) => {
                    inner.send_text(&Frame::Pong).await;
                }
                Ok(Frame::Publish { channel, event }) => inner.dispatch(&channel, event),
                Ok(frame) => debug!(frame = ?frame, "ignoring unexpected frame"),
                Err(err) => {
                    // A garbled frame is not fatal to the connection.
                    warn!(error = %err, "dropping malformed frame");
                    inner.record_error(err.to_string());
                }
            },
            Some(Err(err)) => {
                warn!(error = %err, "socket read failed");
                inner.record_error(err.to_string());
                return;
            }
            None => return,
        }
    }
}
