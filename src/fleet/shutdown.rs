use std::time::Duration;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use super::worker::{Worker, WorkerReport};

/// Outcome of stopping a set of workers
#[derive(Debug, Default)]
pub struct ShutdownReport {
    pub reports: Vec<WorkerReport>,
    /// Still running when the budget ran out, aborted
    pub stuck: Vec<String>,
    pub panicked: Vec<String>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.stuck.is_empty() && self.panicked.is_empty()
    }

    pub fn failures(&self) -> impl Iterator<Item = &str> {
        self.reports.iter().filter_map(WorkerReport::failure)
    }
}

/// Signals every worker, then joins them against one shared deadline
///
/// The whole call returns within `budget` no matter how many workers hang.
pub async fn stop_workers(workers: Vec<Worker>, budget: Duration) -> ShutdownReport {
    info!("Stopping {} worker(s) within {:?}", workers.len(), budget);
    for worker in &workers {
        worker.request_stop();
    }

    let deadline = Instant::now() + budget;
    let mut report = ShutdownReport::default();

    for worker in workers {
        let (name, mut handle) = worker.into_parts();
        match time::timeout_at(deadline, &mut handle).await {
            Ok(Ok(worker_report)) => {
                debug!("{} stopped", name);
                report.reports.push(worker_report);
            }
            Ok(Err(e)) if e.is_panic() => {
                error!("{} panicked: {}", name, e);
                report.panicked.push(name);
            }
            Ok(Err(e)) => {
                warn!("{} was cancelled: {}", name, e);
                report.stuck.push(name);
            }
            Err(_) => {
                warn!("{} did not stop in time, aborting it", name);
                handle.abort();
                report.stuck.push(name);
            }
        }
    }

    info!(
        "Shutdown finished: {} stopped, {} stuck, {} panicked",
        report.reports.len(),
        report.stuck.len(),
        report.panicked.len()
    );
    report
}
