use std::fmt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::device::DeviceReport;
use crate::listener::ListenerReport;

/// Externally visible lifecycle state shared by publishers and the listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentState {
    Created,
    Connecting,
    Running,
    Draining,
    Failed,
    Stopped,
}

impl ComponentState {
    /// The worker no longer does useful work
    pub fn is_winding_down(self) -> bool {
        matches!(
            self,
            ComponentState::Draining | ComponentState::Failed | ComponentState::Stopped
        )
    }
}

impl fmt::Display for ComponentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ComponentState::Created => "created",
            ComponentState::Connecting => "connecting",
            ComponentState::Running => "running",
            ComponentState::Draining => "draining",
            ComponentState::Failed => "failed",
            ComponentState::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    Device,
    Listener,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerReport {
    Device(DeviceReport),
    Listener(ListenerReport),
}

impl WorkerReport {
    pub fn failure(&self) -> Option<&str> {
        match self {
            WorkerReport::Device(report) => report.failure.as_deref(),
            WorkerReport::Listener(report) => report.failure.as_deref(),
        }
    }
}

/// A spawned publisher or listener as seen by the orchestrator
pub struct Worker {
    name: String,
    kind: WorkerKind,
    cancel: CancellationToken,
    state: watch::Receiver<ComponentState>,
    handle: JoinHandle<WorkerReport>,
}

impl Worker {
    pub fn new(
        name: impl Into<String>,
        kind: WorkerKind,
        cancel: CancellationToken,
        state: watch::Receiver<ComponentState>,
        handle: JoinHandle<WorkerReport>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            cancel,
            state,
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> WorkerKind {
        self.kind
    }

    pub fn state(&self) -> ComponentState {
        *self.state.borrow()
    }

    /// Winding down or its task already ended, panics included
    pub fn is_done(&self) -> bool {
        self.state().is_winding_down() || self.handle.is_finished()
    }

    pub fn request_stop(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn into_parts(self) -> (String, JoinHandle<WorkerReport>) {
        (self.name, self.handle)
    }
}
