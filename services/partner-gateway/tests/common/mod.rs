// Shared fixtures for the partner gateway integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use gateway_core::{
    AccessType, BreakerConfig, CircuitBreaker, Clock, ManualClock, PartnerRole, RoleName, Ticket,
};
use parking_lot::Mutex;
use partner_gateway::crypto::CryptoService;
use partner_gateway::errors::{GatewayServiceError, Result};
use partner_gateway::lock::{LockGuard, LockManager};
use partner_gateway::models::{
    EncryptedPayload, InquiryLog, Location, LocationLot, MembershipCheckLog, NewVoucherRedemption,
    NewVoucherUsage, PartnerCredential, PaymentConfirmationLog, VoucherRedemptionRow,
};
use partner_gateway::partner_client::{PartnerClient, RetryPolicy};
use partner_gateway::queue::{Enqueued, Job, JobQueue, JobRecord, JobStatus};
use partner_gateway::repository::{
    AuditLog, HealthProbe, LocationDirectory, PartnerDirectory, RedemptionInsert, Store,
    TicketRepository, VoucherLedger,
};
use partner_gateway::services::ServiceContext;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const PARTNER_KEY: &str = "shared-partner-key";

pub const PAYER_LOGIN: &str = "payco";
pub const PAYER_PASSWORD: &str = "paypass";
pub const PAYER_SECRET: &str = "pay-secret";
pub const PAYER_GIBBERISH: &str = "pay-gibberish";

pub const LOCATION_NMID: &str = "ID2023262331937";
pub const LOCATION_STORE_CODE: &str = "007SK";
pub const LOCATION_LOGIN: &str = "post";
pub const LOCATION_PASSWORD: &str = "postpass";
pub const LOCATION_SECRET: &str = "loc-secret";
pub const LOCATION_GIBBERISH: &str = "loc-gibberish";

pub fn start_of_test() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 3, 0, 0).unwrap()
}

pub fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(start_of_test()))
}

pub fn payment_partner() -> PartnerCredential {
    PartnerCredential {
        id: 1,
        company_name: "PayCo".to_string(),
        merchant_code: "MPAN-PAYCO".to_string(),
        nmid: "ID0000PAYCO".to_string(),
        store_code: "PAYCO".to_string(),
        login: PAYER_LOGIN.to_string(),
        password: PAYER_PASSWORD.to_string(),
        secret_key: PAYER_SECRET.to_string(),
        gibberish_key: PAYER_GIBBERISH.to_string(),
    }
}

pub fn parking_location() -> PartnerCredential {
    PartnerCredential {
        id: 2,
        company_name: "Mall Parking".to_string(),
        merchant_code: "MPAN-MALL".to_string(),
        nmid: LOCATION_NMID.to_string(),
        store_code: LOCATION_STORE_CODE.to_string(),
        login: LOCATION_LOGIN.to_string(),
        password: LOCATION_PASSWORD.to_string(),
        secret_key: LOCATION_SECRET.to_string(),
        gibberish_key: LOCATION_GIBBERISH.to_string(),
    }
}

/// Downstream routes of the parking location, rooted at `base`
pub fn location_roles(base: &str) -> Vec<PartnerRole> {
    vec![
        PartnerRole::new(RoleName::Post, AccessType::Inquiry, Some(&format!("{base}/post/inquiry"))),
        PartnerRole::new(RoleName::Post, AccessType::Payment, Some(&format!("{base}/post/payment"))),
        PartnerRole::new(
            RoleName::Post,
            AccessType::Redemption,
            Some(&format!("{base}/post/redemption")),
        ),
        PartnerRole::new(
            RoleName::MerchantPartner,
            AccessType::Usage,
            Some(&format!("{base}/merchant/usage")),
        ),
    ]
}

pub fn payer_roles() -> Vec<PartnerRole> {
    vec![
        PartnerRole::new(RoleName::PaymentPartner, AccessType::Inquiry, None),
        PartnerRole::new(RoleName::PaymentPartner, AccessType::Payment, None),
    ]
}

/// In-memory store with the same contracts as the Postgres one
#[derive(Debug, Default)]
pub struct MemoryStore {
    partners: Mutex<Vec<PartnerCredential>>,
    roles: Mutex<HashMap<i64, Vec<PartnerRole>>>,
    clients: Mutex<HashMap<String, String>>,
    tickets: Mutex<HashMap<String, Ticket>>,
    pub inquiry_logs: Mutex<Vec<InquiryLog>>,
    pub payment_logs: Mutex<Vec<PaymentConfirmationLog>>,
    pub membership_logs: Mutex<Vec<MembershipCheckLog>>,
    pub redemptions: Mutex<Vec<VoucherRedemptionRow>>,
    pub usages: Mutex<Vec<NewVoucherUsage>>,
    locations: Mutex<Vec<Location>>,
    lots: Mutex<HashMap<String, Vec<LocationLot>>>,
    next_id: AtomicI64,
    unhealthy: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            ..Default::default()
        }
    }

    /// Payment partner and parking location, routed to `base`
    pub fn seeded(base: &str) -> Self {
        let store = Self::new();
        store.add_partner(payment_partner(), payer_roles());
        store.add_partner(parking_location(), location_roles(base));
        store
    }

    pub fn add_partner(&self, partner: PartnerCredential, roles: Vec<PartnerRole>) {
        self.roles.lock().insert(partner.id, roles);
        self.partners.lock().push(partner);
    }

    pub fn add_client(&self, client_id: &str, secret: &str) {
        self.clients.lock().insert(client_id.to_string(), secret.to_string());
    }

    pub fn add_location(&self, location: Location, lots: Vec<LocationLot>) {
        self.lots.lock().insert(location.location_code.clone(), lots);
        self.locations.lock().push(location);
    }

    pub fn put_ticket(&self, ticket: Ticket) {
        self.tickets.lock().insert(ticket.transaction_no.clone(), ticket);
    }

    pub fn ticket(&self, transaction_no: &str) -> Option<Ticket> {
        self.tickets.lock().get(transaction_no).cloned()
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.unhealthy.store(!healthy, Ordering::SeqCst);
    }

    fn find_partner(&self, matches: impl Fn(&PartnerCredential) -> bool) -> Option<PartnerCredential> {
        self.partners.lock().iter().find(|p| matches(p)).cloned()
    }
}

#[async_trait]
impl PartnerDirectory for MemoryStore {
    async fn find_by_credentials(&self, login: &str, password: &str) -> Result<Option<PartnerCredential>> {
        Ok(self.find_partner(|p| p.login == login && p.password == password))
    }

    async fn find_by_nmid(&self, nmid: &str) -> Result<Option<PartnerCredential>> {
        Ok(self.find_partner(|p| p.nmid == nmid))
    }

    async fn find_by_store_code(&self, store_code: &str) -> Result<Option<PartnerCredential>> {
        Ok(self.find_partner(|p| p.store_code == store_code))
    }

    async fn find_by_merchant_code(&self, merchant_code: &str) -> Result<Option<PartnerCredential>> {
        Ok(self.find_partner(|p| p.merchant_code == merchant_code))
    }

    async fn roles(&self, partner_id: i64) -> Result<Vec<PartnerRole>> {
        Ok(self.roles.lock().get(&partner_id).cloned().unwrap_or_default())
    }

    async fn client_secret(&self, client_id: &str) -> Result<Option<String>> {
        Ok(self.clients.lock().get(client_id).cloned())
    }
}

#[async_trait]
impl TicketRepository for MemoryStore {
    async fn insert_ticket(&self, ticket: &Ticket) -> Result<()> {
        let mut tickets = self.tickets.lock();
        if tickets.contains_key(&ticket.transaction_no) {
            return Err(GatewayServiceError::Conflict(ticket.transaction_no.clone()));
        }
        tickets.insert(ticket.transaction_no.clone(), ticket.clone());
        Ok(())
    }

    async fn find_ticket(&self, transaction_no: &str) -> Result<Option<Ticket>> {
        Ok(self.ticket(transaction_no))
    }

    async fn update_ticket(&self, ticket: &Ticket) -> Result<bool> {
        let mut tickets = self.tickets.lock();
        match tickets.get_mut(&ticket.transaction_no) {
            Some(stored) if stored.version == ticket.version => {
                *stored = Ticket {
                    version: ticket.version + 1,
                    ..ticket.clone()
                };
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl AuditLog for MemoryStore {
    async fn log_inquiry(&self, entry: &InquiryLog) -> Result<()> {
        self.inquiry_logs.lock().push(entry.clone());
        Ok(())
    }

    async fn log_payment(&self, entry: &PaymentConfirmationLog) -> Result<()> {
        self.payment_logs.lock().push(entry.clone());
        Ok(())
    }

    async fn log_membership_check(&self, entry: &MembershipCheckLog) -> Result<()> {
        self.membership_logs.lock().push(entry.clone());
        Ok(())
    }
}

#[async_trait]
impl VoucherLedger for MemoryStore {
    async fn find_redemption_by_refs(
        &self,
        transaction_reference_no: &str,
        transaction_receipt_no: &str,
    ) -> Result<Option<VoucherRedemptionRow>> {
        Ok(self
            .redemptions
            .lock()
            .iter()
            .find(|r| {
                r.transaction_reference_no == transaction_reference_no
                    || r.transaction_receipt_no == transaction_receipt_no
            })
            .cloned())
    }

    async fn find_redemption_by_transaction(
        &self,
        location_code: &str,
        transaction_no: &str,
    ) -> Result<Option<VoucherRedemptionRow>> {
        Ok(self
            .redemptions
            .lock()
            .iter()
            .rev()
            .find(|r| r.location_code == location_code && r.transaction_no == transaction_no)
            .cloned())
    }

    async fn insert_redemption(&self, redemption: &NewVoucherRedemption) -> Result<RedemptionInsert> {
        let mut rows = self.redemptions.lock();
        let taken = rows.iter().any(|r| {
            r.transaction_reference_no == redemption.transaction_reference_no
                || r.transaction_receipt_no == redemption.transaction_receipt_no
        });
        if taken {
            return Ok(RedemptionInsert::Duplicate);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        rows.push(VoucherRedemptionRow {
            id,
            merchant_id: redemption.merchant_id.clone(),
            location_code: redemption.location_code.clone(),
            transaction_no: redemption.transaction_no.clone(),
            transaction_reference_no: redemption.transaction_reference_no.clone(),
            transaction_receipt_no: redemption.transaction_receipt_no.clone(),
            transaction_receipt_amount: redemption.transaction_receipt_amount,
            voucher_type: redemption.voucher_type.clone(),
            voucher_value: redemption.voucher_value.clone(),
            status: redemption.status.as_str().to_string(),
            created_on: Utc::now(),
        });
        Ok(RedemptionInsert::Inserted(id))
    }

    async fn insert_usage(&self, usage: &NewVoucherUsage) -> Result<i64> {
        self.usages.lock().push(usage.clone());
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl LocationDirectory for MemoryStore {
    async fn find_location(&self, location_code: &str) -> Result<Option<Location>> {
        Ok(self
            .locations
            .lock()
            .iter()
            .find(|l| l.location_code == location_code)
            .cloned())
    }

    async fn location_lots(&self, location_code: &str) -> Result<Vec<LocationLot>> {
        Ok(self.lots.lock().get(location_code).cloned().unwrap_or_default())
    }

    async fn all_locations(&self) -> Result<Vec<Location>> {
        Ok(self.locations.lock().clone())
    }
}

#[async_trait]
impl HealthProbe for MemoryStore {
    async fn ping(&self) -> Result<()> {
        if self.unhealthy.load(Ordering::SeqCst) {
            return Err(GatewayServiceError::Internal("database unreachable".to_string()));
        }
        Ok(())
    }
}

/// Token-checked in-memory lock; TTLs are ignored
#[derive(Debug, Default)]
pub struct MemoryLock {
    held: Mutex<HashMap<String, String>>,
}

impl MemoryLock {
    pub fn is_held(&self, key: &str) -> bool {
        self.held.lock().contains_key(key)
    }
}

#[async_trait]
impl LockManager for MemoryLock {
    async fn acquire(&self, key: &str, _ttl: Duration) -> Result<Option<LockGuard>> {
        let mut held = self.held.lock();
        if held.contains_key(key) {
            return Ok(None);
        }
        let token = Uuid::new_v4().to_string();
        held.insert(key.to_string(), token.clone());
        Ok(Some(LockGuard {
            key: key.to_string(),
            token,
        }))
    }

    async fn release(&self, guard: &LockGuard) -> Result<bool> {
        let mut held = self.held.lock();
        if held.get(&guard.key) == Some(&guard.token) {
            held.remove(&guard.key);
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

/// FIFO queue; retries go straight back to the tail and their delays are recorded.
/// With a lease, a dequeued job that is never finished comes back once the
/// lease runs out on the given clock.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    waiting: Mutex<VecDeque<Job>>,
    records: Mutex<HashMap<String, JobRecord>>,
    leased: Mutex<HashMap<String, (DateTime<Utc>, Job)>>,
    lease: Option<(Arc<dyn Clock>, chrono::Duration)>,
    pub retry_delays: Mutex<Vec<Duration>>,
}

impl MemoryQueue {
    pub fn with_lease(clock: Arc<dyn Clock>, lease: chrono::Duration) -> Self {
        Self {
            lease: Some((clock, lease)),
            ..Default::default()
        }
    }

    fn reclaim_expired(&self) {
        let Some((clock, _)) = &self.lease else {
            return;
        };
        let now = clock.now();
        let mut leased = self.leased.lock();
        let expired: Vec<String> = leased
            .iter()
            .filter(|(_, (deadline, _))| *deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some((_, job)) = leased.remove(&id) {
                self.records
                    .lock()
                    .insert(id, JobRecord::new(&job, JobStatus::Queued));
                self.waiting.lock().push_front(job);
            }
        }
    }

    fn release(&self, job_id: &str) {
        self.leased.lock().remove(job_id);
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, job: Job) -> Result<Enqueued> {
        let mut records = self.records.lock();
        if let Some(existing) = records.get(&job.id) {
            if !existing.is_finished() {
                return Ok(Enqueued::Existing(existing.clone()));
            }
        }
        records.insert(job.id.clone(), JobRecord::new(&job, JobStatus::Queued));
        let id = job.id.clone();
        self.waiting.lock().push_back(job);
        Ok(Enqueued::Added(id))
    }

    async fn dequeue(&self) -> Result<Option<Job>> {
        self.reclaim_expired();
        let job = self.waiting.lock().pop_front();
        if let Some(job) = &job {
            self.records
                .lock()
                .insert(job.id.clone(), JobRecord::new(job, JobStatus::Active));
            if let Some((clock, lease)) = &self.lease {
                self.leased
                    .lock()
                    .insert(job.id.clone(), (clock.now() + *lease, job.clone()));
            }
        }
        Ok(job)
    }

    async fn schedule_retry(&self, job: Job, delay: Duration, error: &str) -> Result<()> {
        self.release(&job.id);
        let mut record = JobRecord::new(&job, JobStatus::Delayed);
        record.error = Some(error.to_string());
        self.records.lock().insert(job.id.clone(), record);
        self.retry_delays.lock().push(delay);
        self.waiting.lock().push_back(job);
        Ok(())
    }

    async fn finish(&self, record: JobRecord) -> Result<()> {
        self.release(&record.job_id);
        self.records.lock().insert(record.job_id.clone(), record);
        Ok(())
    }

    async fn record(&self, job_id: &str) -> Result<Option<JobRecord>> {
        Ok(self.records.lock().get(job_id).cloned())
    }
}

pub fn context(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> ServiceContext {
    ServiceContext::new(store, CryptoService::new(clock.clone(), 2), clock, PARTNER_KEY.to_string())
}

/// Client that opens its circuit on the second consecutive failure
pub fn test_client(name: &str, clock: Arc<dyn Clock>) -> PartnerClient {
    let breaker = Arc::new(CircuitBreaker::new(
        name,
        BreakerConfig {
            failure_threshold: 1,
            cool_down: Duration::from_secs(60),
            request_timeout: Duration::from_secs(5),
        },
        clock,
    ));
    PartnerClient::new(breaker, RetryPolicy::none(), Duration::from_secs(2))
}

pub async fn seal<T: Serialize + ?Sized>(ctx: &ServiceContext, value: &T, secret: &str) -> EncryptedPayload {
    let data = ctx.crypto.seal_json(value, secret).await.unwrap();
    EncryptedPayload::new(data)
}

pub async fn open<T: DeserializeOwned>(ctx: &ServiceContext, payload: &EncryptedPayload, secret: &str) -> T {
    let cipher = payload.ciphertext().expect("payload carries ciphertext");
    ctx.crypto
        .open_json(cipher, secret)
        .await
        .expect("payload opens with the given secret")
}
