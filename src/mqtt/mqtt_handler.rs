use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::v5::mqttbytes::v5::Packet as PacketV5;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::{BrokerEndpoint, ProtocolVersion, QualityOfService};
use super::link::{BrokerLink, Connector, SessionRequest};
use super::message_manager::InboundMessage;
use crate::error::{ConnectError, TransportError};

const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ConnectionState {
    Connected,
    Disconnected,
    Failed,
}

/// [`Connector`] talking to a real broker through `rumqttc`
///
/// MQTT 3.1 is served by the 3.1.1 client; brokers accepting 3.1 accept
/// 3.1.1 CONNECTs as well.
pub struct MqttConnector {
    endpoint: Arc<BrokerEndpoint>,
    connect_timeout: Duration,
    keep_alive: Duration,
    channel_capacity: usize,
}

impl MqttConnector {
    pub fn new(endpoint: Arc<BrokerEndpoint>) -> Self {
        if endpoint.protocol == ProtocolVersion::V31 {
            warn!(
                "MQTT 3.1 requested for {}, sessions will speak 3.1.1",
                endpoint.address()
            );
        }
        if endpoint.allow_anonymous == Some(false) && endpoint.username.is_none() {
            warn!(
                "Broker {} does not allow anonymous clients but no username is configured",
                endpoint.address()
            );
        }

        Self {
            endpoint,
            connect_timeout: Duration::from_secs(10),
            keep_alive: Duration::from_secs(60),
            channel_capacity: 100,
        }
    }

    pub fn with_timeouts(mut self, connect_timeout: Duration, keep_alive: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_capacity(mut self, channel_capacity: usize) -> Self {
        self.channel_capacity = channel_capacity.max(1);
        self
    }

    async fn connect_v4(&self, request: &SessionRequest) -> Result<MqttLink, ConnectError> {
        let mut options = MqttOptions::new(
            request.client_id.clone(),
            self.endpoint.host.clone(),
            self.endpoint.port,
        );
        options
            .set_keep_alive(self.keep_alive)
            .set_clean_session(request.clean_session.unwrap_or(true));
        if let Some((user, password)) = self.endpoint.credentials() {
            options.set_credentials(user, password);
        }

        let (client, mut eventloop) = AsyncClient::new(options, self.channel_capacity);
        match time::timeout(self.connect_timeout, await_connack_v4(&mut eventloop)).await {
            Err(_) => return Err(ConnectError::Timeout(self.connect_timeout)),
            Ok(result) => result?,
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(self.channel_capacity);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connected);
        let cancel = CancellationToken::new();
        let pump = tokio::spawn(pump_v4(
            request.client_id.clone(),
            eventloop,
            inbound_tx,
            state_tx,
            cancel.clone(),
        ));

        Ok(MqttLink {
            client_id: request.client_id.clone(),
            client: LinkClient::V4(client),
            inbound: inbound_rx,
            state: state_rx,
            cancel,
            pump: Some(pump),
        })
    }

    async fn connect_v5(&self, request: &SessionRequest) -> Result<MqttLink, ConnectError> {
        use rumqttc::v5::{AsyncClient, MqttOptions};

        if request.clean_session.is_some() {
            debug!(
                "{}: clean session flag not sent, MQTT 5 negotiates session expiry instead",
                request.client_id
            );
        }

        let mut options = MqttOptions::new(
            request.client_id.clone(),
            self.endpoint.host.clone(),
            self.endpoint.port,
        );
        options.set_keep_alive(self.keep_alive);
        if let Some((user, password)) = self.endpoint.credentials() {
            options.set_credentials(user, password);
        }

        let (client, mut eventloop) = AsyncClient::new(options, self.channel_capacity);
        match time::timeout(self.connect_timeout, await_connack_v5(&mut eventloop)).await {
            Err(_) => return Err(ConnectError::Timeout(self.connect_timeout)),
            Ok(result) => result?,
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(self.channel_capacity);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connected);
        let cancel = CancellationToken::new();
        let pump = tokio::spawn(pump_v5(
            request.client_id.clone(),
            eventloop,
            inbound_tx,
            state_tx,
            cancel.clone(),
        ));

        Ok(MqttLink {
            client_id: request.client_id.clone(),
            client: LinkClient::V5(client),
            inbound: inbound_rx,
            state: state_rx,
            cancel,
            pump: Some(pump),
        })
    }
}

#[async_trait]
impl Connector for MqttConnector {
    async fn connect(&self, request: &SessionRequest) -> Result<Box<dyn BrokerLink>, ConnectError> {
        debug!(
            "{}: connecting to {} with MQTT {}",
            request.client_id,
            self.endpoint.address(),
            self.endpoint.protocol
        );

        let link = match self.endpoint.protocol {
            ProtocolVersion::V31 | ProtocolVersion::V311 => self.connect_v4(request).await?,
            ProtocolVersion::V5 => self.connect_v5(request).await?,
        };

        info!("{}: connected to {}", request.client_id, self.endpoint.address());
        Ok(Box::new(link))
    }

    fn describe(&self) -> String {
        format!("mqtt://{} (MQTT {})", self.endpoint.address(), self.endpoint.protocol)
    }
}

async fn await_connack_v4(eventloop: &mut EventLoop) -> Result<(), ConnectError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                debug!("CONNACK received, session present: {}", ack.session_present);
                return Ok(());
            }
            Ok(event) => debug!("Event before CONNACK: {:?}", event),
            Err(rumqttc::ConnectionError::ConnectionRefused(code)) => {
                return Err(ConnectError::Refused(format!("{:?}", code)))
            }
            Err(e) => return Err(ConnectError::Transport(e.to_string())),
        }
    }
}

async fn await_connack_v5(eventloop: &mut rumqttc::v5::EventLoop) -> Result<(), ConnectError> {
    use rumqttc::v5::{ConnectionError, Event};

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(PacketV5::ConnAck(ack))) => {
                debug!("CONNACK received, session present: {}", ack.session_present);
                return Ok(());
            }
            Ok(event) => debug!("Event before CONNACK: {:?}", event),
            Err(ConnectionError::ConnectionRefused(code)) => {
                return Err(ConnectError::Refused(format!("{:?}", code)))
            }
            Err(e) => return Err(ConnectError::Transport(e.to_string())),
        }
    }
}

// The pumps own the event loop for the lifetime of the session. They never
// reconnect: a dropped session ends the pump and flips the liveness flag.

async fn pump_v4(
    client_id: String,
    mut eventloop: EventLoop,
    inbound: mpsc::Sender<InboundMessage>,
    state: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
) {
    let final_state = loop {
        let event = select! {
            _ = cancel.cancelled() => break ConnectionState::Disconnected,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = InboundMessage::from_topic(publish.topic, publish.payload.to_vec());
                select! {
                    _ = cancel.cancelled() => break ConnectionState::Disconnected,
                    sent = inbound.send(message) => {
                        if sent.is_err() {
                            debug!("{}: inbound receiver gone, dropping message", client_id);
                        }
                    }
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("{}: broker closed the session", client_id);
                break ConnectionState::Disconnected;
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("{}: DISCONNECT sent", client_id);
                break ConnectionState::Disconnected;
            }
            Ok(event) => debug!("{}: {:?}", client_id, event),
            Err(e) => {
                error!("{}: connection lost: {}", client_id, e);
                break ConnectionState::Failed;
            }
        }
    };

    state.send_replace(final_state);
    debug!("{}: network pump stopped ({:?})", client_id, final_state);
}

async fn pump_v5(
    client_id: String,
    mut eventloop: rumqttc::v5::EventLoop,
    inbound: mpsc::Sender<InboundMessage>,
    state: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
) {
    use rumqttc::v5::Event;

    let final_state = loop {
        let event = select! {
            _ = cancel.cancelled() => break ConnectionState::Disconnected,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(PacketV5::Publish(publish))) => {
                let topic = String::from_utf8_lossy(&publish.topic).into_owned();
                let message = InboundMessage::from_topic(topic, publish.payload.to_vec());
                select! {
                    _ = cancel.cancelled() => break ConnectionState::Disconnected,
                    sent = inbound.send(message) => {
                        if sent.is_err() {
                            debug!("{}: inbound receiver gone, dropping message", client_id);
                        }
                    }
                }
            }
            Ok(Event::Incoming(PacketV5::Disconnect(disconnect))) => {
                warn!(
                    "{}: broker closed the session: {:?}",
                    client_id, disconnect.reason_code
                );
                break ConnectionState::Disconnected;
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("{}: DISCONNECT sent", client_id);
                break ConnectionState::Disconnected;
            }
            Ok(event) => debug!("{}: {:?}", client_id, event),
            Err(e) => {
                error!("{}: connection lost: {}", client_id, e);
                break ConnectionState::Failed;
            }
        }
    };

    state.send_replace(final_state);
    debug!("{}: network pump stopped ({:?})", client_id, final_state);
}

enum LinkClient {
    V4(AsyncClient),
    V5(rumqttc::v5::AsyncClient),
}

/// Session established by [`MqttConnector`]
pub struct MqttLink {
    client_id: String,
    client: LinkClient,
    inbound: mpsc::Receiver<InboundMessage>,
    state: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
    pump: Option<JoinHandle<()>>,
}

#[async_trait]
impl BrokerLink for MqttLink {
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

        match &self.client {
            LinkClient::V4(client) => client
                .publish(topic, qos.into(), retain, payload)
                .await
                .map_err(|e| TransportError::Client(e.to_string())),
            LinkClient::V5(client) => client
                .publish(topic, qos.into(), retain, payload)
                .await
                .map_err(|e| TransportError::Client(e.to_string())),
        }
    }

    async fn subscribe(&mut self, topic: &str, qos: QualityOfService) -> Result<(), TransportError> {
        if !self.is_alive() {
            return Err(TransportError::Disconnected);
        }

        match &self.client {
            LinkClient::V4(client) => client
                .subscribe(topic, qos.into())
                .await
                .map_err(|e| TransportError::Client(e.to_string())),
            LinkClient::V5(client) => client
                .subscribe(topic, qos.into())
                .await
                .map_err(|e| TransportError::Client(e.to_string())),
        }
    }

    async fn next_message(&mut self) -> Option<InboundMessage> {
        self.inbound.recv().await
    }

    fn is_alive(&self) -> bool {
        *self.state.borrow() == ConnectionState::Connected
    }

    async fn disconnect(&mut self) {
        if self.is_alive() {
            let result = match &self.client {
                LinkClient::V4(client) => client.disconnect().await.map_err(|e| e.to_string()),
                LinkClient::V5(client) => client.disconnect().await.map_err(|e| e.to_string()),
            };
            if let Err(e) = result {
                debug!("{}: disconnect request failed: {}", self.client_id, e);
            }
        }

        if let Some(mut pump) = self.pump.take() {
            if time::timeout(DISCONNECT_GRACE, &mut pump).await.is_err() {
                self.cancel.cancel();
                let _ = pump.await;
            }
        }
        debug!("{}: session closed", self.client_id);
    }
}

impl Drop for MqttLink {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
