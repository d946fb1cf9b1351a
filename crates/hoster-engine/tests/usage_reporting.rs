//! Usage events: emission on lifecycle transitions and batch reporting.

mod common;

use common::{auth, create_deployment, harness, online_node, published_template};
use hoster_core::resources::ResourceSpec;
use hoster_engine::workers::UsageReporterWorker;
use hoster_store::{Store, StoreError, StoreTx};

#[tokio::test]
async fn start_and_stop_emit_events_reported_in_order() {
    let h = harness().await;
    let operator = auth(1);
    let customer = auth(2);
    let template = published_template(&h, &operator, "web").await;
    online_node(&h, &operator, "n1", ResourceSpec::new(4.0, 8192, 100_000)).await;

    let deployment = create_deployment(&h, &customer, &template, "shop").await;
    h.engine
        .start_deployment(&customer, &deployment.reference_id)
        .await
        .unwrap();
    h.engine
        .stop_deployment(&customer, &deployment.reference_id)
        .await
        .unwrap();

    let worker = UsageReporterWorker::new(h.engine.clone(), std::time::Duration::from_secs(60));
    worker.tick().await.expect("report tick");

    let reported = h.sink.reported();
    assert_eq!(reported.len(), 2);
    assert_eq!(reported[0].event_type, "deployment.start");
    assert_eq!(reported[1].event_type, "deployment.stop");
    assert!(reported[0].timestamp <= reported[1].timestamp);
    assert_eq!(reported[0].resource_id, deployment.reference_id);

    // Everything acked is marked; nothing rides into the next batch.
    let unreported: usize = h
        .engine
        .store()
        .with_tx(|tx| Ok::<_, StoreError>(tx.unreported_events(100)?.len()))
        .await
        .unwrap();
    assert_eq!(unreported, 0);
}

#[tokio::test]
async fn sink_failure_leaves_events_for_the_next_tick() {
    let h = harness().await;
    let operator = auth(1);
    let customer = auth(2);
    let template = published_template(&h, &operator, "web").await;
    online_node(&h, &operator, "n1", ResourceSpec::new(4.0, 8192, 100_000)).await;

    let deployment = create_deployment(&h, &customer, &template, "shop").await;
    h.engine
        .start_deployment(&customer, &deployment.reference_id)
        .await
        .unwrap();

    let worker = UsageReporterWorker::new(h.engine.clone(), std::time::Duration::from_secs(60));

    h.sink.fail_next_report();
    worker.tick().await.expect("tick survives sink failure");
    let pending: usize = h
        .engine
        .store()
        .with_tx(|tx| Ok::<_, StoreError>(tx.unreported_events(100)?.len()))
        .await
        .unwrap();
    assert_eq!(pending, 1, "nothing marked without an ack");

    worker.tick().await.unwrap();
    let pending: usize = h
        .engine
        .store()
        .with_tx(|tx| Ok::<_, StoreError>(tx.unreported_events(100)?.len()))
        .await
        .unwrap();
    assert_eq!(pending, 0, "retry drains the backlog");
}
