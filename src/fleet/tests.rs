use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use super::*;
use crate::config::FleetConfig;
use crate::device::{DeviceReport, PublisherStats};
use crate::error::FleetError;
use crate::mqtt::{Connector, LoopbackBroker};

/// Worker that needs `stop_delay` to wind down, or never does when `None`
fn synthetic(name: &str, stop_delay: Option<Duration>) -> Worker {
    let cancel = CancellationToken::new();
    let (state_tx, state_rx) = watch::channel(ComponentState::Running);
    let token = cancel.clone();
    let topic = name.to_string();

    let handle = tokio::spawn(async move {
        match stop_delay {
            Some(delay) => {
                token.cancelled().await;
                time::sleep(delay).await;
            }
            None => std::future::pending::<()>().await,
        }
        state_tx.send_replace(ComponentState::Stopped);
        WorkerReport::Device(DeviceReport {
            client_id: format!("simulator-{}", topic),
            topic,
            stats: PublisherStats::default(),
            failure: None,
        })
    });
    Worker::new(name, WorkerKind::Device, cancel, state_rx, handle)
}

fn connector(broker: &LoopbackBroker) -> Arc<dyn Connector> {
    Arc::new(broker.clone())
}

const FINITE_FLEET: &str = r#"
    [runtime]
    seed = 7
    stagger_ms = 10

    [[topics]]
    kind = "range"
    prefix = "yard/lamp"
    end = 3
    interval_secs = 1
    [[topics.data]]
    name = "level"
    type = "raw_values"
    values = [10, 20]
"#;

const ENDLESS_FLEET: &str = r#"
    [runtime]
    seed = 7
    stagger_ms = 10
    listener_grace_ms = 1000

    [listener]
    id = "warden"
    topics = ["prison/control"]
    trigger = "GET_FLAG"
    response = "FLAG{fleet}"
    response_topic = "prison/flag"

    [[topics]]
    kind = "list"
    prefix = "prison/cell"
    items = ["a", "b"]
    interval_secs = 1
    [[topics.data]]
    name = "occupied"
    type = "bool"
    initial = true
"#;

#[tokio::test(start_paused = true)]
async fn cooperative_workers_stop_within_budget() {
    let workers: Vec<Worker> = (0..5)
        .map(|n| synthetic(&format!("w{}", n), Some(Duration::from_secs(1))))
        .collect();

    let started = Instant::now();
    let report = stop_workers(workers, Duration::from_secs(10)).await;

    assert!(report.is_clean());
    assert_eq!(report.reports.len(), 5);
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn hung_worker_is_reported_stuck() {
    let mut workers: Vec<Worker> = (0..4)
        .map(|n| synthetic(&format!("w{}", n), Some(Duration::from_millis(200))))
        .collect();
    workers.insert(2, synthetic("hung", None));

    let started = Instant::now();
    let report = stop_workers(workers, Duration::from_secs(10)).await;

    assert_eq!(report.stuck, vec!["hung".to_string()]);
    assert_eq!(report.reports.len(), 4);
    assert!(started.elapsed() <= Duration::from_secs(10));
}

#[tokio::test]
async fn empty_fleet_is_rejected() {
    let config = FleetConfig::from_toml_str("").unwrap();
    let result = FleetOrchestrator::new(config, connector(&LoopbackBroker::new()));
    assert!(matches!(result, Err(FleetError::NoDevices)));
}

#[tokio::test(start_paused = true)]
async fn finite_devices_drain_the_fleet() {
    let broker = LoopbackBroker::new();
    let config = FleetConfig::from_toml_str(FINITE_FLEET).unwrap();
    let fleet = FleetOrchestrator::new(config, connector(&broker))
        .unwrap()
        .start()
        .await
        .unwrap();
    assert_eq!(fleet.device_count(), 3);

    assert_eq!(fleet.wait().await, FleetExit::Drained);
    let report = fleet.stop(Duration::from_secs(10)).await;

    assert!(report.is_clean());
    assert_eq!(report.failures().count(), 0);
    for lamp in ["yard/lamp/1", "yard/lamp/2", "yard/lamp/3"] {
        assert_eq!(broker.published_on(lamp).len(), 2);
    }
    assert!(broker.connected_clients().is_empty());
}

#[tokio::test(start_paused = true)]
async fn unreachable_listener_aborts_before_any_device() {
    let broker = LoopbackBroker::new();
    broker.refuse_connections("listener not allowed");
    let config = FleetConfig::from_toml_str(ENDLESS_FLEET).unwrap();

    let result = FleetOrchestrator::new(config, connector(&broker))
        .unwrap()
        .start()
        .await;

    match result {
        Err(FleetError::ListenerUnavailable { id, reason }) => {
            assert_eq!(id, "warden");
            assert!(reason.contains("listener not allowed"));
        }
        _ => panic!("listener refusal must abort the start"),
    }
    assert!(broker.published().is_empty());
}

#[tokio::test(start_paused = true)]
async fn listener_answers_while_devices_publish() {
    let broker = LoopbackBroker::new();
    let config = FleetConfig::from_toml_str(ENDLESS_FLEET).unwrap();
    let orchestrator = FleetOrchestrator::new(config, connector(&broker)).unwrap();
    let interrupt = orchestrator.interrupt_token();
    let fleet = orchestrator.start().await.unwrap();

    time::sleep(Duration::from_millis(2500)).await;
    broker.inject("prison/control", "GET_FLAG");
    time::sleep(Duration::from_millis(100)).await;
    interrupt.cancel();

    assert_eq!(fleet.wait().await, FleetExit::Interrupted);
    let report = fleet.stop(Duration::from_secs(10)).await;

    assert!(report.is_clean());
    assert_eq!(broker.published_on("prison/flag").len(), 1);
    assert!(broker.published_on("prison/cell/a").len() >= 2);
    assert!(broker.published_on("prison/cell/b").len() >= 2);
    assert!(broker.connected_clients().is_empty());
}

#[tokio::test(start_paused = true)]
async fn losing_the_listener_ends_the_simulation() {
    let broker = LoopbackBroker::new();
    let config = FleetConfig::from_toml_str(ENDLESS_FLEET).unwrap();
    let fleet = FleetOrchestrator::new(config, connector(&broker))
        .unwrap()
        .start()
        .await
        .unwrap();

    time::sleep(Duration::from_secs(1)).await;
    assert!(broker.drop_client("warden"));

    assert_eq!(fleet.wait().await, FleetExit::ListenerLost);
    let report = fleet.stop(Duration::from_secs(10)).await;
    assert!(report.is_clean());
    assert_eq!(report.failures().count(), 1);
    assert!(broker.connected_clients().is_empty());
}
