//! In-process broker
//!
//! Serves `--dry-run` and the test-suite. Topics are matched exactly, the
//! same way trigger and control topics are matched by the listener.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::config::QualityOfService;
use super::link::{BrokerLink, Connector, SessionRequest};
use super::message_manager::{InboundMessage, PublishedMessage};
use crate::error::{ConnectError, TransportError};

struct Session {
    id: u64,
    inbox: mpsc::UnboundedSender<InboundMessage>,
    alive: watch::Sender<bool>,
    subscriptions: HashSet<String>,
}

impl Session {
    fn close(&self) {
        self.alive.send_replace(false);
    }
}

#[derive(Default)]
struct BrokerState {
    sessions: HashMap<String, Session>,
    next_session: u64,
    log: VecDeque<PublishedMessage>,
    log_capacity: Option<usize>,
    refusal: Option<String>,
    echo: bool,
}

impl BrokerState {
    fn route(&mut self, message: PublishedMessage) {
        if self.echo {
            info!("{}", message.render());
        }

        for session in self.sessions.values() {
            if session.subscriptions.contains(&message.topic) {
                let inbound = InboundMessage::from_topic(message.topic.clone(), message.payload.clone());
                if session.inbox.send(inbound).is_err() {
                    debug!("Loopback subscriber on {} is gone", message.topic);
                }
            }
        }

        self.log.push_back(message);
        if let Some(capacity) = self.log_capacity {
            while self.log.len() > capacity {
                self.log.pop_front();
            }
        }
    }
}

/// Broker living inside the process
///
/// Cloning yields another handle to the same broker.
#[derive(Clone, Default)]
pub struct LoopbackBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl LoopbackBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Broker that logs every publish and keeps only the last `capacity`
    pub fn echoing(capacity: usize) -> Self {
        let broker = Self::default();
        {
            let mut state = broker.lock();
            state.echo = true;
            state.log_capacity = Some(capacity);
        }
        broker
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Refuses every following CONNECT with the given reason
    pub fn refuse_connections(&self, reason: impl Into<String>) {
        self.lock().refusal = Some(reason.into());
    }

    pub fn accept_connections(&self) {
        self.lock().refusal = None;
    }

    /// Severs the session of `client_id` as if the network dropped
    pub fn drop_client(&self, client_id: &str) -> bool {
        let mut state = self.lock();
        match state.sessions.remove(client_id) {
            Some(session) => {
                warn!("Loopback broker dropping client {}", client_id);
                session.close();
                true
            }
            None => false,
        }
    }

    /// Publishes from outside any session
    pub fn inject(&self, topic: &str, payload: impl Into<Vec<u8>>) {
        let message = PublishedMessage {
            client_id: "loopback".to_string(),
            topic: topic.to_string(),
            payload: payload.into(),
            qos: QualityOfService::AtLeastOnce,
            retain: false,
            timestamp: chrono::Local::now().naive_local(),
        };
        self.lock().route(message);
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().log.iter().cloned().collect()
    }

    pub fn published_on(&self, topic: &str) -> Vec<PublishedMessage> {
        self.lock()
            .log
            .iter()
            .filter(|message| message.topic == topic)
            .cloned()
            .collect()
    }

    pub fn connected_clients(&self) -> Vec<String> {
        let mut clients: Vec<String> = self.lock().sessions.keys().cloned().collect();
        clients.sort();
        clients
    }

    pub fn is_connected(&self, client_id: &str) -> bool {
        self.lock().sessions.contains_key(client_id)
    }

    pub fn subscriptions_of(&self, client_id: &str) -> Vec<String> {
        let mut topics: Vec<String> = self
            .lock()
            .sessions
            .get(client_id)
            .map(|session| session.subscriptions.iter().cloned().collect())
            .unwrap_or_default();
        topics.sort();
        topics
    }
}

#[async_trait]
impl Connector for LoopbackBroker {
    async fn connect(&self, request: &SessionRequest) -> Result<Box<dyn BrokerLink>, ConnectError> {
        let mut state = self.lock();
        if let Some(reason) = &state.refusal {
            return Err(ConnectError::Refused(reason.clone()));
        }

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (alive_tx, alive_rx) = watch::channel(true);
        state.next_session += 1;
        let session = Session {
            id: state.next_session,
            inbox: inbox_tx,
            alive: alive_tx,
            subscriptions: HashSet::new(),
        };
        let session_id = session.id;

        if let Some(previous) = state.sessions.insert(request.client_id.clone(), session) {
            warn!(
                "Loopback broker: client id {} taken over by a new session",
                request.client_id
            );
            previous.close();
        }
        debug!("Loopback broker: {} connected", request.client_id);

        Ok(Box::new(LoopbackLink {
            broker: self.clone(),
            client_id: request.client_id.clone(),
            session_id,
            inbox: inbox_rx,
            alive: alive_rx,
        }))
    }

    fn describe(&self) -> String {
        "loopback broker".to_string()
    }
}

struct LoopbackLink {
    broker: LoopbackBroker,
    client_id: String,
    session_id: u64,
    inbox: mpsc::UnboundedReceiver<InboundMessage>,
    alive: watch::Receiver<bool>,
}

#[async_trait]
impl BrokerLink for LoopbackLink {
    async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        qos: QualityOfService,
        retain: bool,
    ) -> Result<(), TransportError> {
        if !self.is_alive() {
            return Err(TransportError::Disconnected);
        }

        let message = PublishedMessage {
            client_id: self.client_id.clone(),
            topic: topic.to_string(),
            payload,
            qos,
            retain,
            timestamp: chrono::Local::now().naive_local(),
        };
        self.broker.lock().route(message);
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str, _qos: QualityOfService) -> Result<(), TransportError> {
        if !self.is_alive() {
            return Err(TransportError::Disconnected);
        }

        let mut state = self.broker.lock();
        match state.sessions.get_mut(&self.client_id) {
            Some(session) if session.id == self.session_id => {
                session.subscriptions.insert(topic.to_string());
                Ok(())
            }
            _ => Err(TransportError::Disconnected),
        }
    }

    async fn next_message(&mut self) -> Option<InboundMessage> {
        if !self.is_alive() {
            return None;
        }
        self.inbox.recv().await
    }

    fn is_alive(&self) -> bool {
        *self.alive.borrow()
    }

    async fn disconnect(&mut self) {
        let mut state = self.broker.lock();
        let owned = state
            .sessions
            .get(&self.client_id)
            .is_some_and(|session| session.id == self.session_id);
        if owned {
            if let Some(session) = state.sessions.remove(&self.client_id) {
                session.close();
            }
            debug!("Loopback broker: {} disconnected", self.client_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exact_topic_fan_out() {
        let broker = LoopbackBroker::new();
        let mut subscriber = broker
            .connect(&SessionRequest::new("sub", None))
            .await
            .unwrap();
        subscriber
            .subscribe("plant/door", QualityOfService::AtLeastOnce)
            .await
            .unwrap();

        broker.inject("plant/door/extra", "ignored");
        broker.inject("plant/door", "open");

        let message = subscriber.next_message().await.unwrap();
        assert_eq!(message.topic(), "plant/door");
        assert_eq!(message.text(), Ok("open"));
        assert_eq!(broker.published().len(), 2);
    }

    #[tokio::test]
    async fn duplicate_client_id_takes_over() {
        let broker = LoopbackBroker::new();
        let first = broker.connect(&SessionRequest::new("dup", None)).await.unwrap();
        let mut second = broker.connect(&SessionRequest::new("dup", None)).await.unwrap();

        assert!(!first.is_alive());
        assert!(second.is_alive());
        second
            .publish("t", b"1".to_vec(), QualityOfService::AtMostOnce, false)
            .await
            .unwrap();
        assert_eq!(broker.connected_clients(), vec!["dup".to_string()]);
    }

    #[tokio::test]
    async fn dropped_client_sees_disconnect() {
        let broker = LoopbackBroker::new();
        let mut link = broker.connect(&SessionRequest::new("c", None)).await.unwrap();
        assert!(broker.drop_client("c"));
        assert!(!link.is_alive());
        assert!(link.next_message().await.is_none());
        assert!(matches!(
            link.publish("t", Vec::new(), QualityOfService::AtMostOnce, false).await,
            Err(TransportError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn refusal_and_bounded_log() {
        let broker = LoopbackBroker::echoing(2);
        broker.refuse_connections("not authorised");
        assert!(matches!(
            broker.connect(&SessionRequest::new("c", None)).await,
            Err(ConnectError::Refused(_))
        ));

        broker.accept_connections();
        assert!(broker.connect(&SessionRequest::new("c", None)).await.is_ok());

        for n in 0..5 {
            broker.inject("t", n.to_string());
        }
        let kept: Vec<String> = broker
            .published()
            .iter()
            .map(|m| String::from_utf8_lossy(&m.payload).into_owned())
            .collect();
        assert_eq!(kept, vec!["3".to_string(), "4".to_string()]);
    }
}
