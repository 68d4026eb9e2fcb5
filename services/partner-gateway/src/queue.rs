//! Voucher job queue
//!
//! Jobs are delivered at least once: a dequeued job is leased and comes back
//! to the wait list if its lease expires before `finish` or `schedule_retry`.

use crate::errors::{GatewayServiceError, Result};
use crate::models::EncryptedPayload;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gateway_core::Clock;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Queue key suffixes, prefixed by the queue name
pub mod keys {
    pub fn waiting(queue: &str) -> String {
        format!("{queue}:wait")
    }

    pub fn delayed(queue: &str) -> String {
        format!("{queue}:delayed")
    }

    /// Leased job ids scored by lease deadline (ms)
    pub fn active(queue: &str) -> String {
        format!("{queue}:active")
    }

    /// Payloads of leased jobs, by job id
    pub fn inflight(queue: &str) -> String {
        format!("{queue}:inflight")
    }

    pub fn dead(queue: &str) -> String {
        format!("{queue}:dead")
    }

    pub fn record(queue: &str, job_id: &str) -> String {
        format!("{queue}:job:{job_id}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobKind {
    Inquiry,
    Redemption,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Inquiry => "INQUIRY",
            JobKind::Redemption => "REDEMPTION",
        }
    }

    /// Kind implied by a job id prefix
    pub fn of_job_id(job_id: &str) -> Self {
        if job_id.starts_with("redeem:") {
            JobKind::Redemption
        } else {
            JobKind::Inquiry
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub payload: EncryptedPayload,
    /// Transaction the job is about, when known
    #[serde(default)]
    pub transaction_no: Option<String>,
    /// Attempts already made
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl Job {
    /// One redemption job per transaction; re-submissions collapse onto it
    pub fn redemption(transaction_no: &str, payload: EncryptedPayload) -> Self {
        Self {
            id: format!("redeem:{transaction_no}"),
            kind: JobKind::Redemption,
            payload,
            transaction_no: Some(transaction_no.to_string()),
            attempts: 0,
            enqueued_at: Utc::now(),
        }
    }

    pub fn inquiry(payload: EncryptedPayload) -> Self {
        Self {
            id: format!("inquiry:{}", Uuid::new_v4()),
            kind: JobKind::Inquiry,
            payload,
            transaction_no: None,
            attempts: 0,
            enqueued_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Delayed,
    Active,
    Completed,
    Failed,
}

/// Job state as reported by `GET /vouchers/jobs/{id}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub job_id: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(job: &Job, status: JobStatus) -> Self {
        Self {
            job_id: job.id.clone(),
            kind: job.kind,
            status,
            attempts: job.attempts,
            result: None,
            error: None,
            updated_at: Utc::now(),
        }
    }

    /// FAILED record for a job whose payload could not be decoded
    pub fn unreadable(job_id: &str, reason: &str, at: DateTime<Utc>) -> Self {
        Self {
            job_id: job_id.to_string(),
            kind: JobKind::of_job_id(job_id),
            status: JobStatus::Failed,
            attempts: 0,
            result: None,
            error: Some(reason.to_string()),
            updated_at: at,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.status, JobStatus::Completed | JobStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Enqueued {
    Added(String),
    /// A job with the same id is already pending or running
    Existing(JobRecord),
}

/// Exponential backoff before attempt `attempt + 1`, i.e. base, 2*base, 4*base...
pub fn backoff_delay(base: Duration, attempts_made: u32) -> Duration {
    let exponent = attempts_made.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent)
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: Job) -> Result<Enqueued>;

    /// Next runnable job, leased to the caller until `finish` or
    /// `schedule_retry`. Delayed jobs that are due and jobs whose lease
    /// expired become runnable again.
    async fn dequeue(&self) -> Result<Option<Job>>;

    async fn schedule_retry(&self, job: Job, delay: Duration, error: &str) -> Result<()>;

    async fn finish(&self, record: JobRecord) -> Result<()>;

    async fn record(&self, job_id: &str) -> Result<Option<JobRecord>>;
}

/// Pop the next job and lease it in one step; unreadable entries go to the dead list
const CLAIM_SCRIPT: &str = r#"
local raw = redis.call('RPOP', KEYS[1])
if not raw then
    return false
end
local ok, job = pcall(cjson.decode, raw)
if not ok or type(job) ~= 'table' or type(job.id) ~= 'string' then
    redis.call('LPUSH', KEYS[4], raw)
    return {'', raw}
end
redis.call('ZADD', KEYS[2], ARGV[1], job.id)
redis.call('HSET', KEYS[3], job.id, raw)
return {job.id, raw}
"#;

/// Put jobs whose lease ran out back at the head of the wait list
const REAP_SCRIPT: &str = r#"
local expired = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
for _, id in ipairs(expired) do
    redis.call('ZREM', KEYS[1], id)
    local raw = redis.call('HGET', KEYS[2], id)
    redis.call('HDEL', KEYS[2], id)
    if raw then
        redis.call('RPUSH', KEYS[3], raw)
    end
end
return expired
"#;

const DEAD_LETTER_LIMIT: isize = 1000;

/// Redis-backed queue with at-least-once delivery.
///
/// A dequeued job stays leased in `<queue>:active` until the worker finishes
/// or reschedules it. If the lease expires first, the next poll puts the job
/// back on the wait list.
#[derive(Clone)]
pub struct RedisJobQueue {
    redis: ConnectionManager,
    name: String,
    result_ttl: Duration,
    lease: Duration,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RedisJobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisJobQueue")
            .field("name", &self.name)
            .field("lease", &self.lease)
            .finish_non_exhaustive()
    }
}

impl RedisJobQueue {
    pub fn new(
        redis: ConnectionManager,
        name: impl Into<String>,
        result_ttl: Duration,
        lease: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            redis,
            name: name.into(),
            result_ttl,
            lease,
            clock,
        }
    }

    fn now_ms(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }

    fn ttl_secs(&self) -> u64 {
        self.result_ttl.as_secs().max(1)
    }

    async fn write_record(&self, record: &JobRecord) -> Result<()> {
        let mut conn = self.redis.clone();
        let json = serde_json::to_string(record)?;
        let _: () = redis::cmd("SET")
            .arg(keys::record(&self.name, &record.job_id))
            .arg(json)
            .arg("EX")
            .arg(self.ttl_secs())
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn promote_due(&self) -> Result<()> {
        let mut conn = self.redis.clone();
        let due: Vec<String> = conn
            .zrangebyscore_limit(keys::delayed(&self.name), 0, self.now_ms(), 0, 16)
            .await?;

        for member in due {
            // Only the worker whose ZREM wins moves the job
            let removed: i64 = conn.zrem(keys::delayed(&self.name), &member).await?;
            if removed == 1 {
                let _: () = conn.lpush(keys::waiting(&self.name), &member).await?;
            }
        }
        Ok(())
    }

    /// Requeue jobs whose lease expired; returns their ids
    pub async fn reclaim_expired(&self) -> Result<Vec<String>> {
        let mut conn = self.redis.clone();
        let reclaimed: Vec<String> = redis::Script::new(REAP_SCRIPT)
            .key(keys::active(&self.name))
            .key(keys::inflight(&self.name))
            .key(keys::waiting(&self.name))
            .arg(self.now_ms())
            .arg(16)
            .invoke_async(&mut conn)
            .await?;

        for job_id in &reclaimed {
            warn!(job_id = %job_id, "Job lease expired, requeueing");
            if let Some(mut record) = self.record(job_id).await? {
                record.status = JobStatus::Queued;
                record.error = Some("lease expired".to_string());
                record.updated_at = self.clock.now();
                self.write_record(&record).await?;
            }
        }
        Ok(reclaimed)
    }

    /// Drop the lease of a job the worker is done with
    fn release_lease(&self, pipe: &mut redis::Pipeline, job_id: &str) {
        pipe.zrem(keys::active(&self.name), job_id)
            .ignore()
            .hdel(keys::inflight(&self.name), job_id)
            .ignore();
    }

    /// Park an undecodable job in the dead list with a FAILED record
    async fn bury(&self, job_id: &str, raw: &str, reason: &str) -> Result<()> {
        error!(job_id, reason, "Unreadable job payload moved to dead letters");
        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        if !job_id.is_empty() {
            self.release_lease(&mut pipe, job_id);
            pipe.lpush(keys::dead(&self.name), raw).ignore();

            let record = JobRecord::unreadable(job_id, reason, self.clock.now());
            pipe.cmd("SET")
                .arg(keys::record(&self.name, job_id))
                .arg(serde_json::to_string(&record)?)
                .arg("EX")
                .arg(self.ttl_secs())
                .ignore();
        }
        pipe.ltrim(keys::dead(&self.name), 0, DEAD_LETTER_LIMIT - 1).ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, job: Job) -> Result<Enqueued> {
        let mut conn = self.redis.clone();
        let record = JobRecord::new(&job, JobStatus::Queued);
        let record_json = serde_json::to_string(&record)?;

        let claimed: Option<String> = redis::cmd("SET")
            .arg(keys::record(&self.name, &job.id))
            .arg(&record_json)
            .arg("NX")
            .arg("EX")
            .arg(self.ttl_secs())
            .query_async(&mut conn)
            .await?;

        if claimed.is_none() {
            if let Some(existing) = self.record(&job.id).await? {
                if !existing.is_finished() {
                    debug!(job_id = %job.id, "Job already pending");
                    return Ok(Enqueued::Existing(existing));
                }
            }
            // A finished job with the same id may run again
            self.write_record(&record).await?;
        }

        let job_json = serde_json::to_string(&job)?;
        let _: () = conn.lpush(keys::waiting(&self.name), job_json).await?;
        info!(job_id = %job.id, kind = job.kind.as_str(), "Job queued");
        Ok(Enqueued::Added(job.id))
    }

    async fn dequeue(&self) -> Result<Option<Job>> {
        self.reclaim_expired().await?;
        self.promote_due().await?;

        let lease_ms = i64::try_from(self.lease.as_millis()).unwrap_or(i64::MAX / 2);
        loop {
            let mut conn = self.redis.clone();
            let claimed: Option<(String, String)> = redis::Script::new(CLAIM_SCRIPT)
                .key(keys::waiting(&self.name))
                .key(keys::active(&self.name))
                .key(keys::inflight(&self.name))
                .key(keys::dead(&self.name))
                .arg(self.now_ms() + lease_ms)
                .invoke_async(&mut conn)
                .await?;
            let Some((job_id, raw)) = claimed else {
                return Ok(None);
            };

            match serde_json::from_str::<Job>(&raw) {
                Ok(job) => {
                    self.write_record(&JobRecord::new(&job, JobStatus::Active)).await?;
                    return Ok(Some(job));
                }
                Err(e) => self.bury(&job_id, &raw, &format!("corrupt job payload: {e}")).await?,
            }
        }
    }

    async fn schedule_retry(&self, job: Job, delay: Duration, error: &str) -> Result<()> {
        let mut conn = self.redis.clone();
        let due_ms = self.now_ms() + i64::try_from(delay.as_millis()).unwrap_or(i64::MAX / 2);

        let mut record = JobRecord::new(&job, JobStatus::Delayed);
        record.error = Some(error.to_string());

        let mut pipe = redis::pipe();
        pipe.atomic();
        self.release_lease(&mut pipe, &job.id);
        pipe.zadd(keys::delayed(&self.name), serde_json::to_string(&job)?, due_ms)
            .ignore()
            .cmd("SET")
            .arg(keys::record(&self.name, &job.id))
            .arg(serde_json::to_string(&record)?)
            .arg("EX")
            .arg(self.ttl_secs())
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn finish(&self, record: JobRecord) -> Result<()> {
        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        self.release_lease(&mut pipe, &record.job_id);
        pipe.cmd("SET")
            .arg(keys::record(&self.name, &record.job_id))
            .arg(serde_json::to_string(&record)?)
            .arg("EX")
            .arg(self.ttl_secs())
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn record(&self, job_id: &str) -> Result<Option<JobRecord>> {
        let mut conn = self.redis.clone();
        let raw: Option<String> = conn.get(keys::record(&self.name, job_id)).await?;
        raw.map(|r| serde_json::from_str(&r).map_err(GatewayServiceError::from))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff() {
        let base = Duration::from_millis(5000);
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(5000));
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(10_000));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(20_000));
    }

    #[test]
    fn test_redemption_job_id_is_per_transaction() {
        let a = Job::redemption("T1", EncryptedPayload::new("x"));
        let b = Job::redemption("T1", EncryptedPayload::new("y"));
        assert_eq!(a.id, "redeem:T1");
        assert_eq!(a.id, b.id);
        assert_ne!(Job::inquiry(EncryptedPayload::default()).id, Job::inquiry(EncryptedPayload::default()).id);
    }

    #[test]
    fn test_keys() {
        assert_eq!(keys::record("VoucherQueue", "redeem:T1"), "VoucherQueue:job:redeem:T1");
        assert_eq!(keys::delayed("VoucherQueue"), "VoucherQueue:delayed");
        assert_eq!(keys::active("VoucherQueue"), "VoucherQueue:active");
        assert_eq!(keys::dead("VoucherQueue"), "VoucherQueue:dead");
    }

    #[test]
    fn test_unreadable_record_is_failed() {
        let record = JobRecord::unreadable("redeem:T1", "corrupt job payload", Utc::now());
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.kind, JobKind::Redemption);
        assert_eq!(JobKind::of_job_id("inquiry:abc"), JobKind::Inquiry);
        assert!(record.is_finished());
    }

    async fn live_queue(name: &str, clock: Arc<dyn Clock>) -> RedisJobQueue {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let client = redis::Client::open(url).unwrap();
        let mut conn = ConnectionManager::new(client).await.unwrap();
        let _: () = redis::cmd("DEL")
            .arg(keys::waiting(name))
            .arg(keys::delayed(name))
            .arg(keys::active(name))
            .arg(keys::inflight(name))
            .arg(keys::dead(name))
            .arg(keys::record(name, "redeem:T1"))
            .query_async(&mut conn)
            .await
            .unwrap();
        RedisJobQueue::new(conn, name, Duration::from_secs(60), Duration::from_secs(30), clock)
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_abandoned_job_is_delivered_again_after_lease() {
        let clock = Arc::new(gateway_core::ManualClock::new(Utc::now()));
        let queue = live_queue("LeaseTestQueue", clock.clone()).await;
        queue
            .enqueue(Job::redemption("T1", EncryptedPayload::new("x")))
            .await
            .unwrap();

        // taken by a worker that never reports back
        let taken = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(taken.id, "redeem:T1");
        assert!(queue.dequeue().await.unwrap().is_none());
        assert!(matches!(
            queue.enqueue(Job::redemption("T1", EncryptedPayload::new("x"))).await.unwrap(),
            Enqueued::Existing(_)
        ));

        clock.advance(chrono::Duration::seconds(31));
        let again = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(again.id, "redeem:T1");

        queue.finish(JobRecord::new(&again, JobStatus::Completed)).await.unwrap();
        clock.advance(chrono::Duration::seconds(31));
        assert!(queue.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_corrupt_payload_gets_failed_record() {
        let clock = Arc::new(gateway_core::ManualClock::new(Utc::now()));
        let queue = live_queue("CorruptTestQueue", clock).await;
        let mut conn = queue.redis.clone();
        let _: () = conn
            .lpush(keys::waiting("CorruptTestQueue"), r#"{"id":"redeem:T1","kind":"BOGUS"}"#)
            .await
            .unwrap();

        assert!(queue.dequeue().await.unwrap().is_none());

        let record = queue.record("redeem:T1").await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        let dead: Vec<String> = conn.lrange(keys::dead("CorruptTestQueue"), 0, -1).await.unwrap();
        assert_eq!(dead.len(), 1);
    }

    #[test]
    fn test_record_serialization() {
        let job = Job::redemption("T1", EncryptedPayload::new("x"));
        let record = JobRecord::new(&job, JobStatus::Completed);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["jobId"], "redeem:T1");
        assert_eq!(json["status"], "COMPLETED");
        assert_eq!(json["kind"], "REDEMPTION");
        assert!(record.is_finished());
    }
}
