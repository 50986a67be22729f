//! Send Pipeline Tests
//!
//! Trigger handling and worker lifecycle:
//! - Rapid triggers coalesce and the last send carries the last write
//! - Transport errors do not stop the worker
//! - The worker exits on shutdown or when every trigger handle is gone

use artmq_bridge::{shutdown_channel, SendPipeline, SendPipelineConfig};
use artmq_core::{Channel, LightingAddress, UniverseStore};
use artmq_test_utils::{
    wait_for, wait_for_count, MockTransport, DEFAULT_CHECK_INTERVAL, DEFAULT_TIMEOUT,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

fn ch(i: u16) -> Channel {
    Channel::new(i).unwrap()
}

fn config(queue_capacity: usize, min_frame_interval: Duration) -> SendPipelineConfig {
    SendPipelineConfig {
        queue_capacity,
        min_frame_interval,
    }
}

#[tokio::test]
async fn test_trigger_sends_every_universe() {
    let store = Arc::new(UniverseStore::new());
    let transport = Arc::new(MockTransport::new());
    let pipeline = SendPipeline::new(store.clone(), transport.clone(), config(10, Duration::ZERO));
    let (_trigger, shutdown) = shutdown_channel();
    pipeline.start(shutdown).unwrap();

    store.set_channel(0x0102, ch(5), 200);
    store.set_channel(3, ch(0), 1);
    assert!(pipeline.trigger_send());

    assert!(wait_for_count(&transport.send_count, 2, DEFAULT_TIMEOUT).await);
    let data = transport.last_sent(LightingAddress::new(1, 2)).unwrap();
    assert_eq!(data[5], 200);
    assert_eq!(transport.last_sent(LightingAddress::new(0, 3)).unwrap()[0], 1);
}

#[tokio::test]
async fn test_rapid_triggers_coalesce_to_latest_state() {
    let store = Arc::new(UniverseStore::new());
    let transport = Arc::new(MockTransport::new());
    let pipeline = SendPipeline::new(
        store.clone(),
        transport.clone(),
        config(4, Duration::from_millis(20)),
    );
    let (_trigger, shutdown) = shutdown_channel();
    pipeline.start(shutdown).unwrap();

    let address = LightingAddress::new(0, 1);
    let trigger = pipeline.trigger();
    for level in 1..=100u8 {
        store.set_channel(1, ch(0), level);
        trigger.trigger_send();
    }

    assert!(
        wait_for(
            || async { transport.last_sent(address).map(|d| d[0]) == Some(100) },
            DEFAULT_CHECK_INTERVAL,
            DEFAULT_TIMEOUT,
        )
        .await
    );
    assert!(transport.send_count.load(Ordering::SeqCst) < 100);
}

#[tokio::test]
async fn test_full_queue_drops_trigger() {
    let store = Arc::new(UniverseStore::new());
    let transport = Arc::new(MockTransport::new());
    let pipeline = SendPipeline::new(store, transport, config(2, Duration::ZERO));

    // Worker not started, so nothing drains the queue
    assert!(pipeline.trigger_send());
    assert!(pipeline.trigger_send());
    assert!(!pipeline.trigger_send());
}

#[tokio::test]
async fn test_send_errors_keep_worker_alive() {
    let store = Arc::new(UniverseStore::new());
    let transport = Arc::new(MockTransport::new());
    let pipeline = SendPipeline::new(store.clone(), transport.clone(), config(10, Duration::ZERO));
    let (_trigger, shutdown) = shutdown_channel();
    let handle = pipeline.start(shutdown).unwrap();

    store.set_channel(7, ch(1), 9);
    transport.fail_send(true);
    pipeline.trigger_send();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.send_count.load(Ordering::SeqCst), 0);
    assert!(!handle.is_finished());

    transport.fail_send(false);
    pipeline.trigger_send();
    assert!(wait_for_count(&transport.send_count, 1, DEFAULT_TIMEOUT).await);
}

#[tokio::test]
async fn test_worker_stops_on_shutdown() {
    let store = Arc::new(UniverseStore::new());
    let transport = Arc::new(MockTransport::new());
    let pipeline = SendPipeline::new(store, transport, config(10, Duration::from_secs(60)));
    let (trigger, shutdown) = shutdown_channel();
    let handle = pipeline.start(shutdown).unwrap();

    // Worker is now parked in its frame-interval wait
    pipeline.trigger_send();
    tokio::time::sleep(Duration::from_millis(20)).await;

    trigger.fire();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("worker did not stop")
        .unwrap();
}

#[tokio::test]
async fn test_worker_stops_when_triggers_dropped() {
    let store = Arc::new(UniverseStore::new());
    let transport = Arc::new(MockTransport::new());
    let pipeline = SendPipeline::new(store, transport, config(10, Duration::ZERO));
    let (_trigger, shutdown) = shutdown_channel();
    let handle = pipeline.start(shutdown).unwrap();

    let extra = pipeline.trigger();
    drop(pipeline);
    assert!(!handle.is_finished());
    drop(extra);

    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("worker did not stop")
        .unwrap();
}

#[tokio::test]
async fn test_start_twice_fails() {
    let pipeline = SendPipeline::new(
        Arc::new(UniverseStore::new()),
        Arc::new(MockTransport::new()),
        SendPipelineConfig::default(),
    );
    let (_trigger, shutdown) = shutdown_channel();

    assert!(pipeline.start(shutdown.clone()).is_ok());
    assert!(pipeline.start(shutdown).is_err());
}
