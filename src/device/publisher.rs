use rand::rngs::StdRng;
use statum::{machine, state};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::topic::DeviceTopic;
use crate::config::RetryPolicy;
use crate::error::{ConnectError, TransportError};
use crate::fleet::ComponentState;
use crate::mqtt::link::open_session;
use crate::mqtt::{BrokerLink, Connector, SessionRequest};

/// Lifecycle of one Device Publisher
#[state]
#[derive(Debug, Clone)]
pub enum DeviceState {
    Created,    // Topic resolved, nothing touched yet
    Connecting, // Establishing the broker session
    Running,    // Generate / publish / sleep loop
    Draining,   // Releasing the session
    Failed,     // Connect or transport failure, on its way to Draining
    Stopped,    // Done
}

/// Counters kept by a publisher and logged when it stops
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublisherStats {
    pub published: u64,
    pub retained: u64,
    pub failed_publishes: u64,
    pub reconnects: u32,
}

/// What a finished publisher leaves behind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceReport {
    pub topic: String,
    pub client_id: String,
    pub stats: PublisherStats,
    pub failure: Option<String>,
}

pub enum RunOutcome {
    Drained(DevicePublisher<Draining>),
    Failed(DevicePublisher<Failed>),
}

/// One simulated device publishing to one topic
///
/// Owns its generators and its broker session exclusively. The only
/// things it shares are the stop token (read) and its lifecycle state
/// (written).
#[machine]
pub struct DevicePublisher<S: DeviceState> {
    topic: DeviceTopic,
    client_id: String,
    connector: Arc<dyn Connector>,
    link: Option<Box<dyn BrokerLink>>,
    retry: RetryPolicy,
    cancel: CancellationToken,
    status: watch::Sender<ComponentState>,
    rng: StdRng,
    stats: PublisherStats,
    failure: Option<String>,
}

impl<S: DeviceState> DevicePublisher<S> {
    pub fn topic_url(&self) -> &str {
        self.topic.url()
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn subscribe(&self) -> watch::Receiver<ComponentState> {
        self.status.subscribe()
    }

    fn set_status(&self, state: ComponentState) {
        self.status.send_replace(state);
    }

    async fn connect_with_retry(&mut self) -> Result<(), ConnectError> {
        let request = SessionRequest::new(self.client_id.clone(), self.topic.delivery().clean_session);
        let link = open_session(self.connector.as_ref(), &request, self.retry, &self.cancel).await?;
        self.link = Some(link);
        Ok(())
    }
}

impl DevicePublisher<Created> {
    pub fn create(
        topic: DeviceTopic,
        connector: Arc<dyn Connector>,
        retry: RetryPolicy,
        cancel: CancellationToken,
        mut rng: StdRng,
    ) -> Self {
        let client_id = topic.client_id(&mut rng);
        let (status, _) = watch::channel(ComponentState::Created);
        debug!(
            "{}: publisher created as {} with {} generator(s)",
            topic.url(),
            client_id,
            topic.generators().len()
        );

        Self::new(
            topic,
            client_id,
            connector,
            None, // link
            retry,
            cancel,
            status,
            rng,
            PublisherStats::default(),
            None, // failure
        )
    }

    /// Drives the publisher through its whole lifecycle
    pub async fn run(self) -> DeviceReport {
        let connecting = self.begin_connect();
        let draining = match connecting.establish().await {
            Ok(running) => match running.publish_loop().await {
                RunOutcome::Drained(draining) => draining,
                RunOutcome::Failed(failed) => failed.drain(),
            },
            Err(failed) => failed.drain(),
        };
        draining.shutdown().await.into_report()
    }

    pub fn begin_connect(self) -> DevicePublisher<Connecting> {
        info!("{}: connecting as {}", self.topic.url(), self.client_id);
        self.set_status(ComponentState::Connecting);
        self.transition()
    }
}

impl DevicePublisher<Connecting> {
    pub async fn establish(mut self) -> Result<DevicePublisher<Running>, DevicePublisher<Failed>> {
        match self.connect_with_retry().await {
            Ok(()) => {
                info!(
                    "{}: connected, publishing every {:?}",
                    self.topic.url(),
                    self.topic.delivery().interval
                );
                self.set_status(ComponentState::Running);
                Ok(self.transition())
            }
            Err(ConnectError::Cancelled) => {
                info!("{}: stop requested while connecting", self.topic.url());
                self.set_status(ComponentState::Failed);
                Err(self.transition())
            }
            Err(e) => {
                error!("{}: initial connection failed: {}", self.topic.url(), e);
                self.failure = Some(e.to_string());
                self.set_status(ComponentState::Failed);
                Err(self.transition())
            }
        }
    }
}

impl DevicePublisher<Running> {
    /// Generate, publish, sleep until stopped, drained or failed
    pub async fn publish_loop(mut self) -> RunOutcome {
        loop {
            if self.cancel.is_cancelled() {
                info!("{}: stop requested", self.topic.url());
                return RunOutcome::Drained(self.finish());
            }

            let alive = self.link.as_ref().is_some_and(|link| link.is_alive());
            if !alive {
                warn!("{}: connection to broker lost", self.topic.url());
                match self.reconnect().await {
                    Ok(()) => continue,
                    Err(ConnectError::Cancelled) => return RunOutcome::Drained(self.finish()),
                    Err(e) => return RunOutcome::Failed(self.fail(e.to_string())),
                }
            }

            let Some(payload) = self.topic.compose(&mut self.rng) else {
                info!("{}: no active data left to publish", self.topic.url());
                return RunOutcome::Drained(self.finish());
            };

            let bytes = match payload.to_json() {
                Ok(bytes) => bytes,
                Err(e) => {
                    let e = TransportError::from(e);
                    error!("{}: {}", self.topic.url(), e);
                    return RunOutcome::Failed(self.fail(e.to_string()));
                }
            };

            let delivery = self.topic.delivery().clone();
            if let Some(link) = self.link.as_mut() {
                match link
                    .publish(self.topic.url(), bytes, delivery.qos, payload.retain)
                    .await
                {
                    Ok(()) => {
                        self.stats.published += 1;
                        if payload.retain {
                            self.stats.retained += 1;
                        }
                        debug!(
                            "{}: published {} field(s){}",
                            self.topic.url(),
                            payload.fields.len(),
                            if payload.retain { " (retained)" } else { "" }
                        );
                    }
                    Err(TransportError::Disconnected) => {
                        self.stats.failed_publishes += 1;
                        continue;
                    }
                    Err(e) => {
                        self.stats.failed_publishes += 1;
                        warn!("{}: publish failed: {}", self.topic.url(), e);
                    }
                }
            }

            select! {
                _ = self.cancel.cancelled() => {}
                _ = time::sleep(delivery.interval) => {}
            }
        }
    }

    async fn reconnect(&mut self) -> Result<(), ConnectError> {
        if let Some(mut stale) = self.link.take() {
            stale.disconnect().await;
        }
        if self.retry == RetryPolicy::None {
            return Err(ConnectError::Transport("connection lost".to_string()));
        }

        info!("{}: reconnecting as {}", self.topic.url(), self.client_id);
        self.connect_with_retry().await?;
        self.stats.reconnects += 1;
        info!("{}: reconnected", self.topic.url());
        Ok(())
    }

    fn finish(self) -> DevicePublisher<Draining> {
        self.set_status(ComponentState::Draining);
        self.transition()
    }

    fn fail(mut self, reason: String) -> DevicePublisher<Failed> {
        error!("{}: giving up: {}", self.topic.url(), reason);
        self.failure = Some(reason);
        self.set_status(ComponentState::Failed);
        self.transition()
    }
}

impl DevicePublisher<Failed> {
    pub fn drain(self) -> DevicePublisher<Draining> {
        debug!("{}: draining after failure", self.topic.url());
        self.set_status(ComponentState::Draining);
        self.transition()
    }
}

impl DevicePublisher<Draining> {
    /// Best-effort teardown of the session
    pub async fn shutdown(mut self) -> DevicePublisher<Stopped> {
        if let Some(mut link) = self.link.take() {
            link.disconnect().await;
        }

        info!(
            "{}: stopped after {} publish(es), {} retained, {} failed",
            self.topic.url(),
            self.stats.published,
            self.stats.retained,
            self.stats.failed_publishes
        );
        self.set_status(ComponentState::Stopped);
        self.transition()
    }
}

impl DevicePublisher<Stopped> {
    pub fn into_report(self) -> DeviceReport {
        DeviceReport {
            topic: self.topic.url().to_string(),
            client_id: self.client_id.clone(),
            stats: self.stats.clone(),
            failure: self.failure.clone(),
        }
    }
}
