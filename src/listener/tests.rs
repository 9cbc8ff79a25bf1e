use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;

use super::{CommandListener, ListenerReport, ListenerSpec};
use crate::config::RetryPolicy;
use crate::fleet::ComponentState;
use crate::mqtt::{Connector, LoopbackBroker};

fn spec() -> ListenerSpec {
    ListenerSpec {
        id: "warden".to_string(),
        topics: vec!["prison/control".to_string(), "prison/backdoor".to_string()],
        trigger: "GET_FLAG".to_string(),
        response: "FLAG{loopback}".to_string(),
        response_topic: "prison/system/flag_channel".to_string(),
    }
}

async fn start(
    broker: &LoopbackBroker,
    cancel: CancellationToken,
) -> (JoinHandle<ListenerReport>, watch::Receiver<ComponentState>) {
    let connector: Arc<dyn Connector> = Arc::new(broker.clone());
    let listener = CommandListener::create(spec(), connector, RetryPolicy::None, cancel);
    let mut status = listener.subscribe();
    let handle = tokio::spawn(listener.run());
    status
        .wait_for(|state| *state == ComponentState::Running)
        .await
        .unwrap();
    (handle, status)
}

async fn settle() {
    time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn trigger_is_answered_once() {
    let broker = LoopbackBroker::new();
    let cancel = CancellationToken::new();
    let (handle, _) = start(&broker, cancel.clone()).await;

    assert_eq!(
        broker.subscriptions_of("warden"),
        vec!["prison/backdoor".to_string(), "prison/control".to_string()]
    );

    broker.inject("prison/control", "GET_FLAG");
    settle().await;

    let answers = broker.published_on("prison/system/flag_channel");
    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0].payload, b"FLAG{loopback}".to_vec());
    assert!(!answers[0].retain);

    cancel.cancel();
    let report = handle.await.unwrap();
    assert_eq!(report.answered, 1);
    assert!(report.failure.is_none());
    assert!(broker.connected_clients().is_empty());
}

#[tokio::test]
async fn near_misses_are_ignored() {
    let broker = LoopbackBroker::new();
    let cancel = CancellationToken::new();
    let (handle, _) = start(&broker, cancel.clone()).await;

    broker.inject("prison/control", "get_flag");
    broker.inject("prison/control", "GET_FLAG\n");
    broker.inject("prison/elsewhere", "GET_FLAG");
    broker.inject("prison/control", vec![0xff, 0xfe, 0x00]);
    settle().await;

    assert!(broker.published_on("prison/system/flag_channel").is_empty());

    cancel.cancel();
    let report = handle.await.unwrap();
    assert_eq!(report.answered, 0);
    // the unsubscribed topic never reaches the listener
    assert_eq!(report.ignored, 3);
}

#[tokio::test]
async fn every_control_topic_triggers() {
    let broker = LoopbackBroker::new();
    let cancel = CancellationToken::new();
    let (handle, _) = start(&broker, cancel.clone()).await;

    broker.inject("prison/control", "GET_FLAG");
    broker.inject("prison/backdoor", "GET_FLAG");
    settle().await;

    cancel.cancel();
    assert_eq!(handle.await.unwrap().answered, 2);
    assert_eq!(broker.published_on("prison/system/flag_channel").len(), 2);
}

#[tokio::test]
async fn lost_connection_is_fatal() {
    let broker = LoopbackBroker::new();
    let (handle, status) = start(&broker, CancellationToken::new()).await;

    assert!(broker.drop_client("warden"));
    let report = handle.await.unwrap();

    assert!(report.failure.is_some());
    assert_eq!(*status.borrow(), ComponentState::Stopped);
}

#[tokio::test]
async fn refused_connection_never_reaches_running() {
    let broker = LoopbackBroker::new();
    broker.refuse_connections("not authorised");
    let connector: Arc<dyn Connector> = Arc::new(broker.clone());
    let listener = CommandListener::create(
        spec(),
        connector,
        RetryPolicy::None,
        CancellationToken::new(),
    );

    let report = listener.run().await;
    assert!(report.failure.unwrap().contains("not authorised"));
    assert_eq!(report.answered, 0);
}
