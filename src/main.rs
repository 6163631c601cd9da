use std::sync::Arc;
use std::time::Duration;

use tokio_stream::StreamExt;
use tracing_subscriber::EnvFilter;

use dispatch_tracker::channel::transport::WsConnector;
use dispatch_tracker::config::Config;
use dispatch_tracker::core::SyncCore;
use dispatch_tracker::error::SyncError;
use dispatch_tracker::models::delivery::DeliveryStatus;
use dispatch_tracker::status::TransitionOrigin;
use dispatch_tracker::store::FileKvStore;
use dispatch_tracker::testing::{sample_delivery, FakeDeliveryApi};
use dispatch_tracker::tracker::source::SimulatedLocationSource;

/// Demo run: one simulated courier walks a delivery from pickup to drop-off,
/// confirming each geofence arrival as it happens. Points and status updates
/// go over the websocket when `WS_URL` is reachable and pile up in the
/// offline queue otherwise.
#[tokio::main]
async fn main() -> Result<(), SyncError> {
    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_level.clone()))
        .with_target(false)
        .compact()
        .init();

    let store = Arc::new(FileKvStore::open(&config.store_path).await?);
    let api = Arc::new(FakeDeliveryApi::new());
    let delivery = sample_delivery(DeliveryStatus::Pending);
    let delivery_id = delivery.id;
    api.insert_delivery(delivery.clone());

    let source = Arc::new(SimulatedLocationSource::walk(
        delivery.pickup,
        delivery.dropoff,
        40.0,
    ));
    let connector = Box::new(WsConnector::new(Duration::from_millis(
        config.connect_timeout_ms,
    )));

    let core = SyncCore::new(config.clone(), connector, source, api, store).await?;
    core.connect(&config.ws_token);

    let machine = core.begin_delivery(delivery_id).await?;
    machine
        .request_transition(DeliveryStatus::Accepted, TransitionOrigin::Local)
        .await;

    let positions = core.tracker().update_stream();
    tokio::spawn(async move {
        let mut positions = positions.filter_map(|item| item.ok());
        while let Some(point) = positions.next().await {
            tracing::info!(
                lat = point.position.lat,
                lng = point.position.lng,
                "position sampled"
            );
        }
    });

    core.tracker().start().await?;

    let mut arrivals = core.tracker().arrivals();
    let mut depth = core.queue().depth_watch();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            arrival = arrivals.recv() => {
                let Ok(arrival) = arrival else { break };
                let _ = core.confirm_arrival(arrival.delivery_id, arrival.leg).await;
                if machine.current() == DeliveryStatus::PickedUp {
                    // Departing with the package right away.
                    machine
                        .request_transition(DeliveryStatus::InProgress, TransitionOrigin::Local)
                        .await;
                }
                if machine.current().is_terminal() {
                    tracing::info!(delivery = %delivery_id, "delivery finished");
                    break;
                }
            }
            changed = depth.changed() => {
                if changed.is_err() {
                    break;
                }
                tracing::info!(pending = *depth.borrow_and_update(), "queue depth changed");
            }
            _ = &mut shutdown => break,
        }
    }

    core.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}
