use crate::errors::Result;
use crate::models::{
    InquiryLog, Location, LocationLot, MembershipCheckLog, NewVoucherRedemption, NewVoucherUsage,
    PartnerCredential, PaymentConfirmationLog, VoucherRedemptionRow,
};
use async_trait::async_trait;
use gateway_core::{PartnerRole, Ticket};

/// Partner and location credentials.
///
/// Locations live in the same table as partners; the lookup key decides
/// which role a row is playing.
#[async_trait]
pub trait PartnerDirectory: Send + Sync {
    async fn find_by_credentials(&self, login: &str, password: &str) -> Result<Option<PartnerCredential>>;

    async fn find_by_nmid(&self, nmid: &str) -> Result<Option<PartnerCredential>>;

    async fn find_by_store_code(&self, store_code: &str) -> Result<Option<PartnerCredential>>;

    async fn find_by_merchant_code(&self, merchant_code: &str) -> Result<Option<PartnerCredential>>;

    async fn roles(&self, partner_id: i64) -> Result<Vec<PartnerRole>>;

    /// Header-auth secret for a client id
    async fn client_secret(&self, client_id: &str) -> Result<Option<String>>;
}

#[async_trait]
pub trait TicketRepository: Send + Sync {
    async fn insert_ticket(&self, ticket: &Ticket) -> Result<()>;

    async fn find_ticket(&self, transaction_no: &str) -> Result<Option<Ticket>>;

    /// Persist `ticket` if the stored version still equals `ticket.version`.
    ///
    /// Returns `false` when another writer got there first; the stored
    /// version is bumped on success.
    async fn update_ticket(&self, ticket: &Ticket) -> Result<bool>;
}

#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn log_inquiry(&self, entry: &InquiryLog) -> Result<()>;

    async fn log_payment(&self, entry: &PaymentConfirmationLog) -> Result<()>;

    async fn log_membership_check(&self, entry: &MembershipCheckLog) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedemptionInsert {
    Inserted(i64),
    /// A unique index on reference or receipt number rejected the row
    Duplicate,
}

#[async_trait]
pub trait VoucherLedger: Send + Sync {
    /// Any redemption carrying either the reference or the receipt number
    async fn find_redemption_by_refs(
        &self,
        reference_no: &str,
        receipt_no: &str,
    ) -> Result<Option<VoucherRedemptionRow>>;

    async fn find_redemption_by_transaction(
        &self,
        location_code: &str,
        transaction_no: &str,
    ) -> Result<Option<VoucherRedemptionRow>>;

    async fn insert_redemption(&self, redemption: &NewVoucherRedemption) -> Result<RedemptionInsert>;

    async fn insert_usage(&self, usage: &NewVoucherUsage) -> Result<i64>;
}

#[async_trait]
pub trait LocationDirectory: Send + Sync {
    async fn find_location(&self, location_code: &str) -> Result<Option<Location>>;

    async fn location_lots(&self, location_code: &str) -> Result<Vec<LocationLot>>;

    async fn all_locations(&self) -> Result<Vec<Location>>;
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn ping(&self) -> Result<()>;
}

/// Everything the services need from persistence
pub trait Store:
    PartnerDirectory + TicketRepository + AuditLog + VoucherLedger + LocationDirectory + HealthProbe
{
}

impl<T> Store for T where
    T: PartnerDirectory + TicketRepository + AuditLog + VoucherLedger + LocationDirectory + HealthProbe
{
}
