//! Voucher job worker pool
//!
//! A fixed number of tasks poll the job queue. Redemption jobs run under
//! the transaction lock; transient failures go back to the queue with
//! exponential backoff until the attempt budget is spent.

use crate::config::QueueConfig;
use crate::errors::{GatewayServiceError, Result};
use crate::lock::{keys, LockManager};
use crate::metrics::VOUCHER_JOBS;
use crate::models::EncryptedPayload;
use crate::queue::{backoff_delay, Job, JobKind, JobQueue, JobRecord, JobStatus};
use crate::services::{Sealed, VoucherService};
use gateway_core::Rejection;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// Run a redemption while holding `lock:redeem:<transactionNo>`.
///
/// Fails with [`GatewayServiceError::InFlight`] when someone else holds it.
pub async fn redeem_exclusive(
    locks: &dyn LockManager,
    vouchers: &VoucherService,
    body: &EncryptedPayload,
    transaction_no: &str,
    ttl: Duration,
) -> Result<Sealed> {
    let key = keys::redeem(transaction_no);
    let Some(guard) = locks.acquire(&key, ttl).await? else {
        return Err(GatewayServiceError::InFlight(transaction_no.to_string()));
    };

    let result = vouchers.redeem(body).await;

    if let Err(e) = locks.release(&guard).await {
        warn!(key = %guard.key, error = %e, "Failed to release redemption lock");
    }
    result
}

/// Stored job result, `{statusCode, data}`
pub fn job_result(sealed: &Sealed) -> Value {
    json!({
        "statusCode": sealed.status.as_u16(),
        "data": sealed.payload.ciphertext(),
    })
}

enum Attempt {
    Answered(Sealed),
    /// Worth another try
    Transient { error: String, sealed: Option<Sealed> },
    Broken(String),
}

pub struct VoucherWorker {
    queue: Arc<dyn JobQueue>,
    locks: Arc<dyn LockManager>,
    vouchers: VoucherService,
    settings: QueueConfig,
}

impl VoucherWorker {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        locks: Arc<dyn LockManager>,
        vouchers: VoucherService,
        settings: QueueConfig,
    ) -> Self {
        Self {
            queue,
            locks,
            vouchers,
            settings,
        }
    }

    /// Start `concurrency` polling tasks
    pub fn spawn(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let concurrency = self.settings.concurrency.max(1);
        info!(concurrency, queue = %self.settings.name, "Starting voucher workers");

        (0..concurrency)
            .map(|slot| {
                let worker = Arc::clone(&self);
                tokio::spawn(async move { worker.run(slot).await })
            })
            .collect()
    }

    async fn run(&self, slot: usize) {
        let mut ticker = interval(Duration::from_millis(self.settings.poll_interval_ms.max(1)));

        loop {
            ticker.tick().await;

            // Drain whatever is runnable before sleeping again
            loop {
                match self.run_once().await {
                    Ok(true) => continue,
                    Ok(false) => break,
                    Err(e) => {
                        error!(slot, error = %e, "Voucher worker poll failed");
                        break;
                    }
                }
            }
        }
    }

    /// Process at most one job; `false` when the queue was empty
    pub async fn run_once(&self) -> Result<bool> {
        let Some(job) = self.queue.dequeue().await? else {
            return Ok(false);
        };
        self.process(job).await?;
        Ok(true)
    }

    async fn process(&self, mut job: Job) -> Result<()> {
        job.attempts += 1;
        debug!(job_id = %job.id, attempt = job.attempts, "Processing voucher job");

        match self.attempt(&job).await {
            Attempt::Answered(sealed) => {
                let mut record = JobRecord::new(&job, JobStatus::Completed);
                record.result = Some(job_result(&sealed));
                self.count(&job, "completed");
                info!(job_id = %job.id, response_code = %sealed.response_code, "Voucher job completed");
                self.queue.finish(record).await
            }
            Attempt::Transient { error, .. } if job.attempts < self.settings.attempts => {
                let delay = backoff_delay(Duration::from_millis(self.settings.backoff_base_ms), job.attempts);
                warn!(job_id = %job.id, attempt = job.attempts, delay_ms = delay.as_millis() as u64, %error, "Voucher job will retry");
                self.count(&job, "retried");
                self.queue.schedule_retry(job, delay, &error).await
            }
            Attempt::Transient { error, sealed } => {
                let mut record = JobRecord::new(&job, JobStatus::Failed);
                record.result = sealed.as_ref().map(job_result);
                record.error = Some(error);
                self.count(&job, "failed");
                error!(job_id = %job.id, attempts = job.attempts, "Voucher job exhausted its attempts");
                self.queue.finish(record).await
            }
            Attempt::Broken(error) => {
                let mut record = JobRecord::new(&job, JobStatus::Failed);
                record.error = Some(error);
                self.count(&job, "failed");
                error!(job_id = %job.id, "Voucher job failed permanently");
                self.queue.finish(record).await
            }
        }
    }

    async fn attempt(&self, job: &Job) -> Attempt {
        let result = match (job.kind, job.transaction_no.as_deref()) {
            (JobKind::Redemption, Some(tx)) => {
                let ttl = Duration::from_millis(self.settings.lock_ttl_ms);
                redeem_exclusive(self.locks.as_ref(), &self.vouchers, &job.payload, tx, ttl).await
            }
            (JobKind::Redemption, None) => self.vouchers.redeem(&job.payload).await,
            (JobKind::Inquiry, _) => self.vouchers.inquiry(&job.payload).await,
        };

        match result {
            Ok(sealed) if sealed.rejection == Some(Rejection::DownstreamUnavailable) => Attempt::Transient {
                error: Rejection::DownstreamUnavailable.to_string(),
                sealed: Some(sealed),
            },
            Ok(sealed) => Attempt::Answered(sealed),
            Err(e) if e.is_transient() => Attempt::Transient {
                error: e.to_string(),
                sealed: None,
            },
            Err(e) => Attempt::Broken(e.to_string()),
        }
    }

    fn count(&self, job: &Job, outcome: &str) {
        VOUCHER_JOBS
            .with_label_values(&[job.kind.as_str(), outcome])
            .inc();
    }
}
