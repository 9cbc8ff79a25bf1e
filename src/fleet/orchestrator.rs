use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, MissedTickBehavior};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::shutdown::{stop_workers, ShutdownReport};
use super::worker::{ComponentState, Worker, WorkerKind, WorkerReport};
use crate::config::{FleetConfig, RuntimeSettings};
use crate::device::DevicePublisher;
use crate::error::FleetError;
use crate::listener::{CommandListener, ListenerSpec};
use crate::mqtt::Connector;

/// Why a running fleet stopped on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FleetExit {
    /// The interrupt token fired
    Interrupted,
    /// The command listener went away mid-run
    ListenerLost,
    /// Every device finished or failed
    Drained,
}

/// Starts the listener and the devices of one [`FleetConfig`]
pub struct FleetOrchestrator {
    config: FleetConfig,
    connector: Arc<dyn Connector>,
    interrupt: CancellationToken,
}

impl FleetOrchestrator {
    pub fn new(config: FleetConfig, connector: Arc<dyn Connector>) -> Result<Self, FleetError> {
        if config.devices.is_empty() {
            return Err(FleetError::NoDevices);
        }
        Ok(Self {
            config,
            connector,
            interrupt: CancellationToken::new(),
        })
    }

    /// Token whose cancellation stops the fleet, e.g. from a signal handler
    pub fn interrupt_token(&self) -> CancellationToken {
        self.interrupt.clone()
    }

    /// Listener first, then every device, staggered
    pub async fn start(self) -> Result<FleetHandle, FleetError> {
        let FleetOrchestrator {
            config,
            connector,
            interrupt,
        } = self;
        info!(
            "Starting fleet of {} device(s) against {}",
            config.devices.len(),
            connector.describe()
        );

        let listener = match config.listener {
            Some(spec) => Some(
                start_listener(spec, connector.clone(), &config.runtime, &interrupt).await?,
            ),
            None => {
                debug!("No command listener configured");
                None
            }
        };

        let mut devices = Vec::with_capacity(config.devices.len());
        let total = config.devices.len();
        for (index, topic) in config.devices.into_iter().enumerate() {
            if index > 0 {
                select! {
                    _ = interrupt.cancelled() => {
                        warn!("Interrupted during start-up, {} device(s) never started", total - index);
                        break;
                    }
                    _ = time::sleep(config.runtime.stagger()) => {}
                }
            }

            let rng = match config.runtime.seed {
                Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(index as u64 + 1)),
                None => StdRng::from_entropy(),
            };
            let cancel = interrupt.child_token();
            let publisher = DevicePublisher::create(
                topic,
                connector.clone(),
                config.runtime.retry,
                cancel.clone(),
                rng,
            );
            let name = format!("{} ({})", publisher.topic_url(), publisher.client_id());
            let state = publisher.subscribe();
            let handle = tokio::spawn(async move { WorkerReport::Device(publisher.run().await) });
            debug!("Spawned device {}", name);
            devices.push(Worker::new(name, WorkerKind::Device, cancel, state, handle));
        }

        info!("Fleet started with {} device(s)", devices.len());
        Ok(FleetHandle {
            devices,
            listener,
            interrupt,
            monitor_interval: config.runtime.monitor_interval(),
            shutdown_timeout: config.runtime.shutdown_timeout(),
        })
    }
}

async fn start_listener(
    spec: ListenerSpec,
    connector: Arc<dyn Connector>,
    runtime: &RuntimeSettings,
    interrupt: &CancellationToken,
) -> Result<Worker, FleetError> {
    let id = spec.id.clone();
    let cancel = interrupt.child_token();
    let listener = CommandListener::create(spec, connector, runtime.retry, cancel.clone());
    let mut state = listener.subscribe();
    let handle = tokio::spawn(async move { WorkerReport::Listener(listener.run().await) });
    let worker = Worker::new(id.clone(), WorkerKind::Listener, cancel, state.clone(), handle);

    let outcome = time::timeout(
        runtime.listener_grace(),
        state.wait_for(|s| *s == ComponentState::Running || s.is_winding_down()),
    )
    .await
    .map(|seen| seen.map(|s| *s));
    let reason = match outcome {
        Ok(Ok(ComponentState::Running)) => {
            info!("Command listener {} is up", id);
            return Ok(worker);
        }
        Ok(_) => "listener stopped before subscribing".to_string(),
        Err(_) => format!("not subscribed within {:?}", runtime.listener_grace()),
    };

    let report = stop_workers(vec![worker], runtime.shutdown_timeout()).await;
    let reason = report
        .failures()
        .next()
        .map(str::to_string)
        .unwrap_or(reason);
    error!("Command listener {} unavailable: {}", id, reason);
    Err(FleetError::ListenerUnavailable { id, reason })
}

/// A started fleet
pub struct FleetHandle {
    devices: Vec<Worker>,
    listener: Option<Worker>,
    interrupt: CancellationToken,
    monitor_interval: Duration,
    shutdown_timeout: Duration,
}

impl FleetHandle {
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn live_devices(&self) -> usize {
        self.devices.iter().filter(|w| !w.is_done()).count()
    }

    pub fn states(&self) -> Vec<(String, ComponentState)> {
        self.devices
            .iter()
            .chain(self.listener.iter())
            .map(|w| (w.name().to_string(), w.state()))
            .collect()
    }

    pub fn interrupt_token(&self) -> CancellationToken {
        self.interrupt.clone()
    }

    /// Polls the workers until the fleet has a reason to stop
    pub async fn wait(&self) -> FleetExit {
        let mut ticker = time::interval(self.monitor_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_live = None;

        loop {
            select! {
                biased;
                _ = self.interrupt.cancelled() => {
                    info!("Interrupt received, stopping fleet");
                    return FleetExit::Interrupted;
                }
                _ = ticker.tick() => {}
            }

            if let Some(listener) = &self.listener {
                if listener.is_done() {
                    error!(
                        "Command listener {} is gone ({}), ending the simulation",
                        listener.name(),
                        listener.state()
                    );
                    return FleetExit::ListenerLost;
                }
            }

            let live = self.live_devices();
            if last_live != Some(live) {
                info!("{}/{} device(s) publishing", live, self.devices.len());
                last_live = Some(live);
            }
            if live == 0 {
                info!("All devices have finished");
                return FleetExit::Drained;
            }
        }
    }

    /// Budget configured under `runtime.shutdown_timeout_secs`
    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    /// Signals every worker and joins them, all within `budget`
    pub async fn stop(self, budget: Duration) -> ShutdownReport {
        self.interrupt.cancel();
        let mut workers = self.devices;
        workers.extend(self.listener);
        stop_workers(workers, budget).await
    }
}
