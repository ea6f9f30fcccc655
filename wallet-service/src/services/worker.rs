//! Background execution of consumption requests and periodic settlement.

use crate::config::WorkerConfig;
use crate::services::error::BillingError;
use crate::services::orchestrator::ConsumptionOrchestrator;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

pub struct ConsumptionWorkerPool {
    job_tx: mpsc::Sender<Uuid>,
    shutdown_token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Jobs handed to a worker.
    jobs: TaskTracker,
    drain_timeout: Duration,
}

impl ConsumptionWorkerPool {
    /// Spawn the dispatcher and the settlement loop.
    pub fn start(orchestrator: Arc<ConsumptionOrchestrator>, config: &WorkerConfig) -> Self {
        let (job_tx, job_rx) = mpsc::channel(config.queue_size);
        let shutdown_token = CancellationToken::new();
        let jobs = TaskTracker::new();

        tracing::info!(
            worker_count = config.count,
            queue_size = config.queue_size,
            "Starting worker pool"
        );

        let dispatcher = tokio::spawn(dispatch(
            Arc::clone(&orchestrator),
            job_rx,
            Arc::new(Semaphore::new(config.count)),
            jobs.clone(),
            shutdown_token.clone(),
        ));

        let settlement = tokio::spawn(settle_periodically(
            orchestrator,
            Duration::from_secs(config.reconcile_interval_secs.max(1)),
            config.reconcile_batch,
            shutdown_token.clone(),
        ));

        Self {
            job_tx,
            shutdown_token,
            tasks: Mutex::new(vec![dispatcher, settlement]),
            jobs,
            drain_timeout: Duration::from_secs(config.drain_timeout_secs),
        }
    }

    /// Queue a pending request. A full queue leaves the request pending.
    pub fn enqueue(&self, request_id: Uuid) -> Result<(), BillingError> {
        self.job_tx.try_send(request_id).map_err(|e| {
            tracing::warn!(request_id = %request_id, error = %e, "Job queue rejected request");
            BillingError::QueueFull
        })
    }

    /// Stop dispatching, wait for the background loops, then wait up to the
    /// drain timeout for jobs already handed to a worker. Queued jobs that
    /// were never dispatched stay pending.
    pub async fn shutdown(&self) {
        tracing::info!("Initiating worker pool shutdown");
        self.shutdown_token.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            let _ = task.await;
        }

        self.jobs.close();
        let in_flight = self.jobs.len();
        if in_flight > 0 {
            tracing::info!(in_flight, "Waiting for in-flight jobs");
        }
        if tokio::time::timeout(self.drain_timeout, self.jobs.wait())
            .await
            .is_err()
        {
            tracing::error!(
                target: "wallet::reconciliation",
                remaining = self.jobs.len(),
                timeout_secs = self.drain_timeout.as_secs(),
                "In-flight jobs did not finish before shutdown; they stay in_progress"
            );
        }
    }
}

async fn dispatch(
    orchestrator: Arc<ConsumptionOrchestrator>,
    mut job_rx: mpsc::Receiver<Uuid>,
    permits: Arc<Semaphore>,
    jobs: TaskTracker,
    shutdown: CancellationToken,
) {
    loop {
        let request_id = tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("Job dispatcher shutting down");
                break;
            }
            job = job_rx.recv() => match job {
                Some(request_id) => request_id,
                None => {
                    tracing::info!("Channel closed, job dispatcher exiting");
                    break;
                }
            },
        };

        let permit = tokio::select! {
            _ = shutdown.cancelled() => break,
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let orchestrator = Arc::clone(&orchestrator);
        jobs.spawn(async move {
            let _permit = permit;
            if let Err(e) = orchestrator.run(request_id).await {
                tracing::warn!(request_id = %request_id, error = %e, "Consumption job did not run");
            }
        });
    }
}

async fn settle_periodically(
    orchestrator: Arc<ConsumptionOrchestrator>,
    every: Duration,
    batch: i64,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("Settlement loop shutting down");
                break;
            }
            _ = interval.tick() => {
                match orchestrator.settle_unsettled(batch).await {
                    Ok(report) if report.attempted > 0 => {
                        tracing::info!(
                            target: "wallet::reconciliation",
                            attempted = report.attempted,
                            settled = report.settled,
                            failed = report.failed,
                            "Settlement sweep finished"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "Settlement sweep failed"),
                }
            }
        }
    }
}
