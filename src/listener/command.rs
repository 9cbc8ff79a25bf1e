use statum::{machine, state};
use std::sync::Arc;
use tokio::select;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::rule::{ListenerSpec, TriggerRule};
use crate::config::RetryPolicy;
use crate::error::ConnectError;
use crate::fleet::ComponentState;
use crate::mqtt::link::open_session;
use crate::mqtt::{BrokerLink, Connector, InboundMessage, QualityOfService, SessionRequest};

/// Lifecycle of the Command Listener
#[state]
#[derive(Debug, Clone)]
pub enum ListenerState {
    Created,
    Connecting,
    Running,
    Draining,
    Failed,
    Stopped,
}

/// What a finished listener leaves behind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerReport {
    pub id: String,
    pub answered: u64,
    pub ignored: u64,
    pub failure: Option<String>,
}

pub enum ListenOutcome {
    Drained(CommandListener<Draining>),
    Failed(CommandListener<Failed>),
}

enum Wake {
    Stop,
    Message(Option<InboundMessage>),
}

/// Subscriber answering one exact trigger with one fixed response
#[machine]
pub struct CommandListener<S: ListenerState> {
    spec: ListenerSpec,
    rule: TriggerRule,
    connector: Arc<dyn Connector>,
    link: Option<Box<dyn BrokerLink>>,
    retry: RetryPolicy,
    cancel: CancellationToken,
    status: watch::Sender<ComponentState>,
    answered: u64,
    ignored: u64,
    failure: Option<String>,
}

impl<S: ListenerState> CommandListener<S> {
    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn subscribe(&self) -> watch::Receiver<ComponentState> {
        self.status.subscribe()
    }

    fn set_status(&self, state: ComponentState) {
        self.status.send_replace(state);
    }
}

impl CommandListener<Created> {
    pub fn create(
        spec: ListenerSpec,
        connector: Arc<dyn Connector>,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        let rule = spec.rule();
        let (status, _) = watch::channel(ComponentState::Created);
        debug!(
            "{}: listener created for {} control topic(s)",
            spec.id,
            spec.topics.len()
        );

        Self::new(
            spec,
            rule,
            connector,
            None, // link
            retry,
            cancel,
            status,
            0, // answered
            0, // ignored
            None,
        )
    }

    pub async fn run(self) -> ListenerReport {
        let connecting = self.begin_connect();
        let draining = match connecting.establish().await {
            Ok(running) => match running.listen().await {
                ListenOutcome::Drained(draining) => draining,
                ListenOutcome::Failed(failed) => failed.drain(),
            },
            Err(failed) => failed.drain(),
        };
        draining.shutdown().await.into_report()
    }

    pub fn begin_connect(self) -> CommandListener<Connecting> {
        info!("{}: connecting", self.spec.id);
        self.set_status(ComponentState::Connecting);
        self.transition()
    }
}

impl CommandListener<Connecting> {
    /// Connects and subscribes to every control topic at QoS 1
    pub async fn establish(mut self) -> Result<CommandListener<Running>, CommandListener<Failed>> {
        let request = SessionRequest::new(self.spec.id.clone(), None);
        let mut link = match open_session(self.connector.as_ref(), &request, self.retry, &self.cancel).await {
            Ok(link) => link,
            Err(ConnectError::Cancelled) => {
                info!("{}: stop requested while connecting", self.spec.id);
                self.set_status(ComponentState::Failed);
                return Err(self.transition());
            }
            Err(e) => {
                error!("{}: connection failed: {}", self.spec.id, e);
                self.failure = Some(e.to_string());
                self.set_status(ComponentState::Failed);
                return Err(self.transition());
            }
        };

        for topic in self.rule.topics() {
            if let Err(e) = link.subscribe(topic, QualityOfService::AtLeastOnce).await {
                error!("{}: subscribing to {} failed: {}", self.spec.id, topic, e);
                self.failure = Some(e.to_string());
                self.link = Some(link);
                self.set_status(ComponentState::Failed);
                return Err(self.transition());
            }
            info!("{}: subscribed to {}", self.spec.id, topic);
        }

        self.link = Some(link);
        info!(
            "{}: waiting for trigger, responses go to {}",
            self.spec.id, self.spec.response_topic
        );
        self.set_status(ComponentState::Running);
        Ok(self.transition())
    }
}

impl CommandListener<Running> {
    pub async fn listen(mut self) -> ListenOutcome {
        loop {
            let Some(link) = self.link.as_mut() else {
                return ListenOutcome::Failed(self.fail("no broker session".to_string()));
            };

            let wake = select! {
                _ = self.cancel.cancelled() => Wake::Stop,
                message = link.next_message() => Wake::Message(message),
            };

            match wake {
                Wake::Stop => {
                    info!("{}: stop requested", self.spec.id);
                    self.set_status(ComponentState::Draining);
                    return ListenOutcome::Drained(self.transition());
                }
                Wake::Message(None) => {
                    error!(
                        "{}: connection to broker lost, trigger path is gone",
                        self.spec.id
                    );
                    return ListenOutcome::Failed(self.fail("connection lost".to_string()));
                }
                Wake::Message(Some(message)) => self.handle(message).await,
            }
        }
    }

    async fn handle(&mut self, message: InboundMessage) {
        let text = match message.text() {
            Ok(text) => text,
            Err(e) => {
                warn!(
                    "{}: discarding non-UTF-8 payload on {}: {}",
                    self.spec.id,
                    message.topic(),
                    e
                );
                self.ignored += 1;
                return;
            }
        };

        if !self.rule.matches(message.topic(), text) {
            debug!("{}: ignoring message on {}", self.spec.id, message.topic());
            self.ignored += 1;
            return;
        }

        info!(
            "{}: trigger received on {}, answering on {}",
            self.spec.id,
            message.topic(),
            self.spec.response_topic
        );
        let Some(link) = self.link.as_mut() else {
            return;
        };
        match link
            .publish(
                &self.spec.response_topic,
                self.spec.response.clone().into_bytes(),
                QualityOfService::AtLeastOnce,
                false,
            )
            .await
        {
            Ok(()) => self.answered += 1,
            Err(e) => warn!("{}: response publish failed: {}", self.spec.id, e),
        }
    }

    fn fail(mut self, reason: String) -> CommandListener<Failed> {
        self.failure = Some(reason);
        self.set_status(ComponentState::Failed);
        self.transition()
    }
}

impl CommandListener<Failed> {
    pub fn drain(self) -> CommandListener<Draining> {
        self.set_status(ComponentState::Draining);
        self.transition()
    }
}

impl CommandListener<Draining> {
    pub async fn shutdown(mut self) -> CommandListener<Stopped> {
        if let Some(mut link) = self.link.take() {
            link.disconnect().await;
        }
        info!(
            "{}: stopped after answering {} trigger(s)",
            self.spec.id, self.answered
        );
        self.set_status(ComponentState::Stopped);
        self.transition()
    }
}

impl CommandListener<Stopped> {
    pub fn into_report(self) -> ListenerReport {
        ListenerReport {
            id: self.spec.id.clone(),
            answered: self.answered,
            ignored: self.ignored,
            failure: self.failure.clone(),
        }
    }
}
