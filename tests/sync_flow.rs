use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use dispatch_tracker::channel::ConnectionState;
use dispatch_tracker::core::SyncCore;
use dispatch_tracker::geo;
use dispatch_tracker::models::delivery::DeliveryStatus;
use dispatch_tracker::models::geofence::Leg;
use dispatch_tracker::models::operation::OperationPayload;
use dispatch_tracker::models::point::GeoPoint;
use dispatch_tracker::status::{TransitionOrigin, TransitionOutcome};
use dispatch_tracker::store::{KvStore, MemoryKvStore};
use dispatch_tracker::testing::{
    sample_delivery, test_config, FakeDeliveryApi, ScriptedConnector, ScriptedLocationSource,
    TestLink,
};
use dispatch_tracker::tracker::source::Fix;
use dispatch_tracker::wire::{topic, EventPayload, Frame};

struct Harness {
    core: SyncCore,
    api: Arc<FakeDeliveryApi>,
    links: mpsc::UnboundedReceiver<TestLink>,
}

async fn harness() -> Harness {
    harness_with_fixes(Vec::new()).await
}

async fn harness_with_fixes(fixes: Vec<Fix>) -> Harness {
    let api = Arc::new(FakeDeliveryApi::new());
    let connector = ScriptedConnector::new();
    let links = connector.links();
    let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
    let core = SyncCore::new(
        test_config(),
        Box::new(connector),
        Arc::new(ScriptedLocationSource::with_fixes(fixes)),
        api.clone(),
        store,
    )
    .await
    .unwrap();

    Harness { core, api, links }
}

fn fix_at(position: GeoPoint) -> Fix {
    Fix {
        position,
        accuracy_m: 5.0,
        speed_mps: 8.0,
    }
}

async fn wait_for_state(core: &SyncCore, target: ConnectionState) {
    let mut rx = core.mux().state_watch();
    while *rx.borrow() != target {
        rx.changed().await.unwrap();
    }
}

async fn wait_for_empty_queue(core: &SyncCore) {
    let mut depth = core.queue().depth_watch();
    while *depth.borrow_and_update() != 0 {
        depth.changed().await.unwrap();
    }
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn offline_confirmation_applies_locally_and_flushes_later() {
    let harness = harness().await;
    let delivery = sample_delivery(DeliveryStatus::Accepted);
    let delivery_id = delivery.id;
    harness.api.insert_delivery(delivery);

    let machine = harness.core.begin_delivery(delivery_id).await.unwrap();

    // Never connected: the confirmation still lands immediately.
    let outcome = harness
        .core
        .confirm_arrival(delivery_id, Leg::Pickup)
        .await
        .unwrap();
    assert_eq!(outcome, TransitionOutcome::Applied);
    assert_eq!(machine.current(), DeliveryStatus::PickedUp);
    assert_eq!(harness.core.queue().count(), 1);
    assert!(harness.api.status_submissions().is_empty());

    // Backend still unreachable when the socket comes up, so the first
    // automatic flush fails and the operation is retained.
    harness.api.set_offline(true);
    harness.core.connect("token");
    wait_for_state(&harness.core, ConnectionState::Connected).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.core.queue().count(), 1);
    let pending = harness.core.queue().pending().await;
    assert_eq!(pending[0].attempts, 1);

    harness.api.set_offline(false);
    let summary = harness.core.sync_now().await;
    assert_eq!(summary.sent, 1);
    assert_eq!(
        harness.api.status_submissions(),
        vec![(delivery_id, DeliveryStatus::PickedUp)]
    );
    assert_eq!(harness.core.queue().count(), 0);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn offline_points_flush_oldest_first_on_reconnect() {
    let first = GeoPoint {
        lat: 53.5511,
        lng: 9.9937,
    };
    let second = GeoPoint {
        lat: 53.5520,
        lng: 9.9937,
    };
    let harness = harness_with_fixes(vec![fix_at(first), fix_at(second)]).await;
    let delivery = sample_delivery(DeliveryStatus::Accepted);
    let delivery_id = delivery.id;
    harness.api.insert_delivery(delivery);

    harness.core.begin_delivery(delivery_id).await.unwrap();
    harness.core.tracker().start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(16)).await;
    harness.core.tracker().stop().await;
    assert_eq!(harness.core.queue().count(), 2);

    harness.core.connect("token");
    wait_for_empty_queue(&harness.core).await;

    let submitted = harness.api.tracking_submissions();
    assert_eq!(submitted.len(), 2);
    assert_eq!(submitted[0].1.position.lat, first.lat);
    assert_eq!(submitted[1].1.position.lat, second.lat);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn remote_delivered_supersedes_a_queued_local_update() {
    let mut harness = harness().await;
    let delivery = sample_delivery(DeliveryStatus::PickedUp);
    let delivery_id = delivery.id;
    harness.api.insert_delivery(delivery);

    let machine = harness.core.begin_delivery(delivery_id).await.unwrap();

    // Local progress while fully offline.
    machine
        .request_transition(DeliveryStatus::InProgress, TransitionOrigin::Local)
        .await;
    assert_eq!(harness.core.queue().count(), 1);

    // Socket returns but the REST side stays down, so the automatic flush
    // cannot drain the queue yet.
    harness.api.set_offline(true);
    harness.core.connect("token");
    let link = harness.links.recv().await.unwrap();
    wait_for_state(&harness.core, ConnectionState::Connected).await;

    link.push(&Frame::Publish {
        channel: topic::status(delivery_id),
        event: EventPayload::Status {
            delivery_id,
            status: DeliveryStatus::Delivered,
        },
    });
    let mut observer = machine.observer();
    while *observer.borrow_and_update() != DeliveryStatus::Delivered {
        observer.changed().await.unwrap();
    }

    // Backend back up: the queued in_progress update must be dropped as
    // superseded, never submitted behind the terminal remote status.
    harness.api.set_offline(false);
    while harness.core.queue().count() != 0 {
        harness.core.sync_now().await;
        tokio::task::yield_now().await;
    }

    assert!(harness.api.status_submissions().is_empty());
    assert_eq!(machine.current(), DeliveryStatus::Delivered);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn arrivals_fire_once_per_leg_and_rotate_regions() {
    let pickup = GeoPoint {
        lat: 53.5511,
        lng: 9.9937,
    };
    let midway = GeoPoint {
        lat: 53.5555,
        lng: 9.9985,
    };
    let dropoff = GeoPoint {
        lat: 53.5600,
        lng: 10.0030,
    };
    let harness =
        harness_with_fixes(vec![fix_at(pickup), fix_at(midway), fix_at(dropoff)]).await;
    let mut delivery = sample_delivery(DeliveryStatus::Accepted);
    delivery.pickup = pickup;
    delivery.dropoff = dropoff;
    let delivery_id = delivery.id;
    harness.api.insert_delivery(delivery);

    let machine = harness.core.begin_delivery(delivery_id).await.unwrap();
    let mut arrivals = harness.core.tracker().arrivals();
    harness.core.tracker().start().await.unwrap();

    let first = arrivals.recv().await.unwrap();
    assert_eq!(first.leg, Leg::Pickup);
    harness
        .core
        .confirm_arrival(delivery_id, first.leg)
        .await
        .unwrap();
    assert_eq!(machine.current(), DeliveryStatus::PickedUp);

    // Heading out does not change the leg, so the armed drop-off region and
    // its latch survive this transition.
    machine
        .request_transition(DeliveryStatus::InProgress, TransitionOrigin::Local)
        .await;

    let second = arrivals.recv().await.unwrap();
    assert_eq!(second.leg, Leg::Dropoff);
    harness
        .core
        .confirm_arrival(delivery_id, second.leg)
        .await
        .unwrap();
    assert_eq!(machine.current(), DeliveryStatus::Delivered);

    harness.core.tracker().stop().await;
    tokio::task::yield_now().await;
    assert!(harness.core.tracker().active_regions().await.is_empty());
    assert!(arrivals.try_recv().is_err());
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn reconnect_restores_interest_and_drains_the_queue() {
    let mut harness = harness().await;
    let delivery = sample_delivery(DeliveryStatus::Accepted);
    let delivery_id = delivery.id;
    harness.api.insert_delivery(delivery);

    harness.core.connect("token");
    let mut link = harness.links.recv().await.unwrap();
    wait_for_state(&harness.core, ConnectionState::Connected).await;

    harness.core.begin_delivery(delivery_id).await.unwrap();
    assert_eq!(
        link.next_sent().await,
        Some(Frame::Subscribe {
            channel: topic::status(delivery_id),
        })
    );

    let dropped_at = tokio::time::Instant::now();
    link.close();
    wait_for_state(&harness.core, ConnectionState::Disconnected).await;

    // Confirmation while the socket is down goes to the queue.
    harness
        .core
        .confirm_arrival(delivery_id, Leg::Pickup)
        .await
        .unwrap();
    assert_eq!(harness.core.queue().count(), 1);

    let mut new_link = harness.links.recv().await.unwrap();
    wait_for_state(&harness.core, ConnectionState::Connected).await;
    assert!(tokio::time::Instant::now() - dropped_at >= Duration::from_secs(5));

    assert_eq!(
        new_link.next_sent().await,
        Some(Frame::Subscribe {
            channel: topic::status(delivery_id),
        })
    );

    wait_for_empty_queue(&harness.core).await;
    assert_eq!(
        harness.api.status_submissions(),
        vec![(delivery_id, DeliveryStatus::PickedUp)]
    );
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn support_tickets_queue_offline_and_deliver_later() {
    let harness = harness().await;

    let id = harness
        .core
        .report_issue("damaged package", "customer refused the handover")
        .await
        .unwrap();
    assert_eq!(harness.core.queue().count(), 1);
    let pending = harness.core.queue().pending().await;
    assert_eq!(pending[0].id, id);
    assert!(matches!(
        pending[0].payload,
        OperationPayload::Ticket { .. }
    ));

    let summary = harness.core.sync_now().await;
    assert_eq!(summary.sent, 1);
    assert_eq!(
        harness.api.tickets(),
        vec![(
            "damaged package".to_string(),
            "customer refused the handover".to_string()
        )]
    );
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn route_eta_spans_the_current_leg() {
    let harness = harness().await;
    let delivery = sample_delivery(DeliveryStatus::PickedUp);
    let delivery_id = delivery.id;
    let pickup = delivery.pickup;
    let dropoff = delivery.dropoff;
    harness.api.insert_delivery(delivery);

    harness.core.begin_delivery(delivery_id).await.unwrap();

    // No fix yet, so the estimate starts from the pickup.
    let eta = harness.core.route_eta(delivery_id).await.unwrap();
    let expected = geo::haversine_m(&pickup, &dropoff);
    assert!((eta.distance_m - expected).abs() < 1.0);
    assert!(eta.duration_s > 0.0);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn begin_delivery_needs_the_backend() {
    let harness = harness().await;
    harness.api.set_offline(true);
    assert!(matches!(
        harness.core.begin_delivery(uuid::Uuid::new_v4()).await,
        Err(dispatch_tracker::error::SyncError::Connectivity(_))
    ));
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn returning_to_the_foreground_resets_the_distance_filter() {
    let here = GeoPoint {
        lat: 53.5511,
        lng: 9.9937,
    };
    let harness = harness_with_fixes(vec![fix_at(here)]).await;

    harness.core.tracker().start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    // Sampling survives backgrounding; the foreground restart clears the
    // distance anchor so the repeated coordinate is accepted again.
    harness.core.on_app_background();
    assert!(harness.core.tracker().is_running());
    harness.core.on_app_foreground().await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    harness.core.tracker().stop().await;

    assert_eq!(harness.core.tracker().history().await.len(), 2);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn metrics_reflect_queue_and_channel_activity() {
    let harness = harness().await;

    harness
        .core
        .report_issue("cold food", "customer complaint")
        .await
        .unwrap();
    harness.core.connect("token");
    wait_for_empty_queue(&harness.core).await;

    let body = harness.core.metrics().encode().unwrap();
    assert!(body.contains("pending_operations 0"));
    assert!(body.contains("channel_connected 1"));
    assert!(body.contains("operations_flushed_total{outcome=\"sent\"} 1"));
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn ending_a_delivery_releases_the_status_topic() {
    let mut harness = harness().await;
    let delivery = sample_delivery(DeliveryStatus::Accepted);
    let delivery_id = delivery.id;
    harness.api.insert_delivery(delivery);

    harness.core.connect("token");
    let mut link = harness.links.recv().await.unwrap();
    wait_for_state(&harness.core, ConnectionState::Connected).await;

    harness.core.begin_delivery(delivery_id).await.unwrap();
    let _ = link.next_sent().await;
    assert_eq!(harness.core.mux().subscribed_topics(), 1);

    harness.core.end_delivery(delivery_id).await;
    assert_eq!(
        link.next_sent().await,
        Some(Frame::Unsubscribe {
            channel: topic::status(delivery_id),
        })
    );
    assert_eq!(harness.core.mux().subscribed_topics(), 0);
    assert!(harness.core.machine(delivery_id).is_none());
}
