//! Background watcher for a running operation
//!
//! Warns once an operation has been running past the configured threshold
//! and probes record-store connectivity on every tick. It never cancels the
//! operation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::records::RecordStoreClient;

/// Counters collected while the operation ran
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorSummary {
    pub ticks: usize,
    pub long_running_warnings: usize,
    pub connectivity_failures: usize,
}

#[derive(Default)]
struct Counters {
    ticks: AtomicUsize,
    long_running_warnings: AtomicUsize,
    connectivity_failures: AtomicUsize,
}

impl Counters {
    fn summary(&self) -> MonitorSummary {
        MonitorSummary {
            ticks: self.ticks.load(Ordering::SeqCst),
            long_running_warnings: self.long_running_warnings.load(Ordering::SeqCst),
            connectivity_failures: self.connectivity_failures.load(Ordering::SeqCst),
        }
    }
}

/// Handle to a running monitor. Dropping it stops the task.
pub struct OperationMonitor {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    counters: Arc<Counters>,
}

impl OperationMonitor {
    pub fn spawn(
        operation: String,
        client: Arc<dyn RecordStoreClient>,
        interval: Duration,
        long_running_after: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        let counters = Arc::new(Counters::default());

        let task = tokio::spawn(run(
            operation,
            client,
            interval,
            long_running_after,
            cancel.clone(),
            counters.clone(),
        ));

        Self {
            cancel,
            task: Some(task),
            counters,
        }
    }

    pub async fn stop(mut self) -> MonitorSummary {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.counters.summary()
    }
}

impl Drop for OperationMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(
    operation: String,
    client: Arc<dyn RecordStoreClient>,
    interval: Duration,
    long_running_after: Duration,
    cancel: CancellationToken,
    counters: Arc<Counters>,
) {
    let started = Instant::now();
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    // Skip the first immediate tick
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                counters.ticks.fetch_add(1, Ordering::SeqCst);

                let elapsed = started.elapsed();
                if elapsed >= long_running_after {
                    counters.long_running_warnings.fetch_add(1, Ordering::SeqCst);
                    tracing::warn!(
                        operation = %operation,
                        elapsed_secs = elapsed.as_secs(),
                        "Operation is running long"
                    );
                }

                let status = tokio::select! {
                    _ = cancel.cancelled() => break,
                    status = client.test_connection() => status,
                };
                if !status.success {
                    counters.connectivity_failures.fetch_add(1, Ordering::SeqCst);
                    tracing::warn!(
                        operation = %operation,
                        error = status.error.as_deref().unwrap_or("unknown"),
                        "Record store unreachable during operation"
                    );
                }
            }
        }
    }
}
