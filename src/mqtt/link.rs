//! Seam between workers and whatever carries their messages

use async_trait::async_trait;
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::config::QualityOfService;
use super::message_manager::InboundMessage;
use crate::config::RetryPolicy;
use crate::error::{ConnectError, TransportError};

/// Parameters of one broker session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    pub client_id: String,
    /// `None` defers to the protocol default
    pub clean_session: Option<bool>,
}

impl SessionRequest {
    pub fn new(client_id: impl Into<String>, clean_session: Option<bool>) -> Self {
        Self {
            client_id: client_id.into(),
            clean_session,
        }
    }
}

/// Builds one exclusively owned broker session per worker
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, request: &SessionRequest) -> Result<Box<dyn BrokerLink>, ConnectError>;

    /// Short label for logs
    fn describe(&self) -> String;
}

/// An established broker session
#[async_trait]
pub trait BrokerLink: Send {
    async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        qos: QualityOfService,
        retain: bool,
    ) -> Result<(), TransportError>;

    async fn subscribe(&mut self, topic: &str, qos: QualityOfService) -> Result<(), TransportError>;

    /// Waits for the next inbound message; `None` once the session ended
    async fn next_message(&mut self) -> Option<InboundMessage>;

    fn is_alive(&self) -> bool;

    /// Best-effort teardown, never fails
    async fn disconnect(&mut self);
}

/// Opens a session, retrying as `retry` allows
///
/// Every wait, including the connect attempt itself, yields to `cancel`.
pub async fn open_session(
    connector: &dyn Connector,
    request: &SessionRequest,
    retry: RetryPolicy,
    cancel: &CancellationToken,
) -> Result<Box<dyn BrokerLink>, ConnectError> {
    let mut attempts_left = retry.attempts();

    loop {
        let attempt = select! {
            _ = cancel.cancelled() => Err(ConnectError::Cancelled),
            result = connector.connect(request) => result,
        };

        match attempt {
            Ok(link) => return Ok(link),
            Err(ConnectError::Cancelled) => return Err(ConnectError::Cancelled),
            Err(e) if attempts_left > 0 => {
                attempts_left -= 1;
                warn!(
                    "{}: connect failed ({}), retrying in {:?} ({} attempt(s) left)",
                    request.client_id,
                    e,
                    retry.delay(),
                    attempts_left
                );
                select! {
                    _ = cancel.cancelled() => return Err(ConnectError::Cancelled),
                    _ = time::sleep(retry.delay()) => {}
                }
            }
            Err(e) => return Err(e),
        }
    }
}
