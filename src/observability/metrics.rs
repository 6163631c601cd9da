use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub pending_operations: IntGauge,
    pub operations_flushed_total: IntCounterVec,
    pub channel_connected: IntGauge,
    pub channel_reconnects_total: IntCounter,
    pub tracking_points_total: IntCounter,
    pub geofence_arrivals_total: IntCounter,
    pub status_transitions_total: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let pending_operations =
            IntGauge::new("pending_operations", "Current depth of the offline queue")
                .expect("valid pending_operations metric");

        let operations_flushed_total = IntCounterVec::new(
            Opts::new(
                "operations_flushed_total",
                "Flush attempts per dispatch outcome",
            ),
            &["outcome"],
        )
        .expect("valid operations_flushed_total metric");

        let channel_connected = IntGauge::new(
            "channel_connected",
            "1 while the realtime socket is connected",
        )
        .expect("valid channel_connected metric");

        let channel_reconnects_total = IntCounter::new(
            "channel_reconnects_total",
            "Reconnect attempts scheduled after a drop or failed dial",
        )
        .expect("valid channel_reconnects_total metric");

        let tracking_points_total = IntCounter::new(
            "tracking_points_total",
            "Position samples accepted by the distance filter",
        )
        .expect("valid tracking_points_total metric");

        let geofence_arrivals_total =
            IntCounter::new("geofence_arrivals_total", "Geofence arrival events fired")
                .expect("valid geofence_arrivals_total metric");

        let status_transitions_total = IntCounterVec::new(
            Opts::new(
                "status_transitions_total",
                "Status transition requests by origin and outcome",
            ),
            &["origin", "outcome"],
        )
        .expect("valid status_transitions_total metric");

        registry
            .register(Box::new(pending_operations.clone()))
            .expect("register pending_operations");
        registry
            .register(Box::new(operations_flushed_total.clone()))
            .expect("register operations_flushed_total");
        registry
            .register(Box::new(channel_connected.clone()))
            .expect("register channel_connected");
        registry
            .register(Box::new(channel_reconnects_total.clone()))
            .expect("register channel_reconnects_total");
        registry
            .register(Box::new(tracking_points_total.clone()))
            .expect("register tracking_points_total");
        registry
            .register(Box::new(geofence_arrivals_total.clone()))
            .expect("register geofence_arrivals_total");
        registry
            .register(Box::new(status_transitions_total.clone()))
            .expect("register status_transitions_total");

        Self {
            registry,
            pending_operations,
            operations_flushed_total,
            channel_connected,
            channel_reconnects_total,
            tracking_points_total,
            geofence_arrivals_total,
            status_transitions_total,
        }
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}
