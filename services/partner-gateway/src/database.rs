use crate::errors::{GatewayServiceError, Result};
use crate::models::{
    InquiryLog, Location, LocationLot, MembershipCheckLog, NewVoucherRedemption, NewVoucherUsage,
    PartnerCredential, PartnerRoleRow, PaymentConfirmationLog, TicketRow, VoucherRedemptionRow,
};
use crate::repository::{
    AuditLog, HealthProbe, LocationDirectory, PartnerDirectory, RedemptionInsert, TicketRepository,
    VoucherLedger,
};
use async_trait::async_trait;
use gateway_core::{PartnerRole, Ticket};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Pool, Postgres};
use std::time::Duration;
use tracing::warn;

const PARTNER_COLUMNS: &str = r#"
    id,
    COALESCE(company_name, '') AS company_name,
    COALESCE(mpan, '') AS merchant_code,
    COALESCE(nmid, '') AS nmid,
    COALESCE(store_code, '') AS store_code,
    COALESCE(login, '') AS login,
    COALESCE(password, '') AS password,
    COALESCE(secret_key, '') AS secret_key,
    COALESCE(gibberish_key, '') AS gibberish_key
"#;

const TICKET_COLUMNS: &str = r#"
    transaction_no, tariff, grace_period, vehicle_type, status,
    in_time, out_time, paid_at, ticket_close, reference_no, version
"#;

const LOCATION_COLUMNS: &str = r#"
    location_code,
    location_name,
    address,
    (coordinate->>'latitude')::float8 AS latitude,
    (coordinate->>'longitude')::float8 AS longitude
"#;

#[derive(Debug, Clone)]
pub struct Database {
    pool: Pool<Postgres>,
}

impl Database {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;

        Ok(Database { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn partner_where(&self, predicate: &str, value: &str) -> Result<Option<PartnerCredential>> {
        let sql = format!(
            "SELECT {PARTNER_COLUMNS} FROM partner_mapping WHERE {predicate} = $1 AND record_status = 1 LIMIT 1"
        );
        let partner = sqlx::query_as::<_, PartnerCredential>(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;

        Ok(partner)
    }
}

#[async_trait]
impl PartnerDirectory for Database {
    async fn find_by_credentials(&self, login: &str, password: &str) -> Result<Option<PartnerCredential>> {
        let sql = format!(
            "SELECT {PARTNER_COLUMNS} FROM partner_mapping \
             WHERE login = $1 AND password = $2 AND record_status = 1 LIMIT 1"
        );
        let partner = sqlx::query_as::<_, PartnerCredential>(&sql)
            .bind(login)
            .bind(password)
            .fetch_optional(&self.pool)
            .await?;

        Ok(partner)
    }

    async fn find_by_nmid(&self, nmid: &str) -> Result<Option<PartnerCredential>> {
        self.partner_where("nmid", nmid).await
    }

    async fn find_by_store_code(&self, store_code: &str) -> Result<Option<PartnerCredential>> {
        self.partner_where("store_code", store_code).await
    }

    async fn find_by_merchant_code(&self, merchant_code: &str) -> Result<Option<PartnerCredential>> {
        self.partner_where("mpan", merchant_code).await
    }

    async fn roles(&self, partner_id: i64) -> Result<Vec<PartnerRole>> {
        let rows = sqlx::query_as::<_, PartnerRoleRow>(
            r#"
            SELECT partner_id, role_name, access_type, url_access
            FROM partner_role_mapping
            WHERE partner_id = $1
            "#,
        )
        .bind(partner_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let label = format!("{}/{}", row.role_name, row.access_type);
                let role = row.into_role();
                if role.is_none() {
                    warn!(partner_id, role = %label, "Ignoring unknown partner role");
                }
                role
            })
            .collect())
    }

    async fn client_secret(&self, client_id: &str) -> Result<Option<String>> {
        let secret: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT secret_key FROM partner WHERE client_id = $1
            "#,
        )
        .bind(client_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(secret.map(|(s,)| s))
    }
}

#[async_trait]
impl TicketRepository for Database {
    async fn insert_ticket(&self, ticket: &Ticket) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ticket_generator (
                transaction_no, tariff, grace_period, vehicle_type, status,
                in_time, out_time, paid_at, ticket_close, reference_no, version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(&ticket.transaction_no)
        .bind(ticket.tariff)
        .bind(ticket.grace_period)
        .bind(ticket.vehicle_type.as_str())
        .bind(ticket.status.as_str())
        .bind(ticket.in_time)
        .bind(ticket.out_time)
        .bind(ticket.paid_at)
        .bind(ticket.closed)
        .bind(&ticket.reference_no)
        .bind(ticket.version)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_ticket(&self, transaction_no: &str) -> Result<Option<Ticket>> {
        let sql = format!("SELECT {TICKET_COLUMNS} FROM ticket_generator WHERE transaction_no = $1");
        let row = sqlx::query_as::<_, TicketRow>(&sql)
            .bind(transaction_no)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Ticket::try_from).transpose().map_err(GatewayServiceError::from)
    }

    async fn update_ticket(&self, ticket: &Ticket) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE ticket_generator
            SET tariff = $3, status = $4, out_time = $5, paid_at = $6,
                ticket_close = $7, reference_no = $8, version = version + 1,
                updated_at = NOW()
            WHERE transaction_no = $1 AND version = $2
            "#,
        )
        .bind(&ticket.transaction_no)
        .bind(ticket.version)
        .bind(ticket.tariff)
        .bind(ticket.status.as_str())
        .bind(ticket.out_time)
        .bind(ticket.paid_at)
        .bind(ticket.closed)
        .bind(&ticket.reference_no)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl AuditLog for Database {
    async fn log_inquiry(&self, entry: &InquiryLog) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO inquiry_transaction (
                company_name, nmid, store_code, transaction_no,
                project_category_id, project_category_name,
                data_send, data_response, data_detail_response,
                created_on, created_by
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW(), $10)
            "#,
        )
        .bind(&entry.company_name)
        .bind(&entry.nmid)
        .bind(&entry.store_code)
        .bind(&entry.transaction_no)
        .bind(entry.project_category_id)
        .bind(&entry.project_category_name)
        .bind(&entry.data_send)
        .bind(&entry.data_response)
        .bind(&entry.data_detail_response)
        .bind(&entry.created_by)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn log_payment(&self, entry: &PaymentConfirmationLog) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO payment_confirmation (
                company_name, nmid, store_code, transaction_no, reference_no,
                amount, payment_status,
                merchant_data_request, merchant_data_response,
                post_data_request, post_data_response,
                created_on, created_by
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW(), $12)
            "#,
        )
        .bind(&entry.company_name)
        .bind(&entry.nmid)
        .bind(&entry.store_code)
        .bind(&entry.transaction_no)
        .bind(&entry.reference_no)
        .bind(&entry.amount)
        .bind(&entry.payment_status)
        .bind(&entry.merchant_data_request)
        .bind(&entry.merchant_data_response)
        .bind(&entry.post_data_request)
        .bind(&entry.post_data_response)
        .bind(&entry.created_by)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn log_membership_check(&self, entry: &MembershipCheckLog) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO styles_check_membership (
                company_name, nmid, location_code, transaction_no, license_plate_no,
                qr_ticket, response_code, response_status,
                merchant_data_request, merchant_data_response, post_data_request,
                record_status, created_on, created_by
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, 1, NOW(), $12)
            "#,
        )
        .bind(&entry.company_name)
        .bind(&entry.nmid)
        .bind(&entry.location_code)
        .bind(&entry.transaction_no)
        .bind(&entry.license_plate_no)
        .bind(&entry.qr_ticket)
        .bind(&entry.response_code)
        .bind(entry.response_status)
        .bind(&entry.merchant_data_request)
        .bind(&entry.merchant_data_response)
        .bind(&entry.post_data_request)
        .bind(&entry.created_by)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl VoucherLedger for Database {
    async fn find_redemption_by_refs(
        &self,
        reference_no: &str,
        receipt_no: &str,
    ) -> Result<Option<VoucherRedemptionRow>> {
        let row = sqlx::query_as::<_, VoucherRedemptionRow>(
            r#"
            SELECT id, merchant_id, location_code, transaction_no,
                   transaction_reference_no, transaction_receipt_no,
                   transaction_receipt_amount, voucher_type, voucher_value,
                   status, created_on
            FROM voucher_redemption
            WHERE transaction_reference_no = $1 OR transaction_receipt_no = $2
            LIMIT 1
            "#,
        )
        .bind(reference_no)
        .bind(receipt_no)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn find_redemption_by_transaction(
        &self,
        location_code: &str,
        transaction_no: &str,
    ) -> Result<Option<VoucherRedemptionRow>> {
        let row = sqlx::query_as::<_, VoucherRedemptionRow>(
            r#"
            SELECT id, merchant_id, location_code, transaction_no,
                   transaction_reference_no, transaction_receipt_no,
                   transaction_receipt_amount, voucher_type, voucher_value,
                   status, created_on
            FROM voucher_redemption
            WHERE location_code = $1 AND transaction_no = $2
            ORDER BY created_on DESC
            LIMIT 1
            "#,
        )
        .bind(location_code)
        .bind(transaction_no)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn insert_redemption(&self, redemption: &NewVoucherRedemption) -> Result<RedemptionInsert> {
        let inserted: std::result::Result<(i64,), sqlx::Error> = sqlx::query_as(
            r#"
            INSERT INTO voucher_redemption (
                company_name, merchant_id, tenant_id, location_code, transaction_no,
                transaction_reference_no, transaction_receipt_no, transaction_receipt_amount,
                voucher_type, voucher_value, voucher_expiry_date,
                customer_vehicle_type, customer_vehicle_plate_no, customer_mobile_no, customer_email,
                status, merchant_data_request, merchant_data_response,
                post_data_request, post_data_response, created_on, created_by
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                    $16, $17, $18, $19, $20, NOW(), $21)
            RETURNING id
            "#,
        )
        .bind(&redemption.company_name)
        .bind(&redemption.merchant_id)
        .bind(&redemption.tenant_id)
        .bind(&redemption.location_code)
        .bind(&redemption.transaction_no)
        .bind(&redemption.transaction_reference_no)
        .bind(&redemption.transaction_receipt_no)
        .bind(redemption.transaction_receipt_amount)
        .bind(&redemption.voucher_type)
        .bind(&redemption.voucher_value)
        .bind(redemption.voucher_expiry_date)
        .bind(&redemption.customer_vehicle_type)
        .bind(&redemption.customer_vehicle_plate_no)
        .bind(&redemption.customer_mobile_no)
        .bind(&redemption.customer_email)
        .bind(redemption.status.as_str())
        .bind(&redemption.merchant_data_request)
        .bind(&redemption.merchant_data_response)
        .bind(&redemption.post_data_request)
        .bind(&redemption.post_data_response)
        .bind(&redemption.created_by)
        .fetch_one(&self.pool)
        .await;

        match inserted.map_err(GatewayServiceError::from) {
            Ok((id,)) => Ok(RedemptionInsert::Inserted(id)),
            Err(e) if e.is_unique_violation() => Ok(RedemptionInsert::Duplicate),
            Err(e) => Err(e),
        }
    }

    async fn insert_usage(&self, usage: &NewVoucherUsage) -> Result<i64> {
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO voucher_usage (
                redemption_id, company_name, location_code, transaction_no, license_plate_no,
                in_time, gate_in_code, vehicle_type, total_tariff, out_time, gate_out_code,
                merchant_data_request, merchant_data_response, post_data_request,
                created_on, created_by
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, NOW(), $15)
            RETURNING id
            "#,
        )
        .bind(usage.redemption_id)
        .bind(&usage.company_name)
        .bind(&usage.location_code)
        .bind(&usage.transaction_no)
        .bind(&usage.license_plate_no)
        .bind(&usage.in_time)
        .bind(&usage.gate_in_code)
        .bind(&usage.vehicle_type)
        .bind(usage.total_tariff)
        .bind(&usage.out_time)
        .bind(&usage.gate_out_code)
        .bind(&usage.merchant_data_request)
        .bind(&usage.merchant_data_response)
        .bind(&usage.post_data_request)
        .bind(&usage.created_by)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }
}

#[async_trait]
impl LocationDirectory for Database {
    async fn find_location(&self, location_code: &str) -> Result<Option<Location>> {
        let sql = format!("SELECT {LOCATION_COLUMNS} FROM location_area WHERE location_code = $1");
        let location = sqlx::query_as::<_, Location>(&sql)
            .bind(location_code)
            .fetch_optional(&self.pool)
            .await?;

        Ok(location)
    }

    async fn location_lots(&self, location_code: &str) -> Result<Vec<LocationLot>> {
        let lots = sqlx::query_as::<_, LocationLot>(
            r#"
            SELECT lot_name, vehicle_type, max_lot, used_lot, available_lot
            FROM location_lot
            WHERE location_code = $1
            ORDER BY vehicle_type, lot_name
            "#,
        )
        .bind(location_code)
        .fetch_all(&self.pool)
        .await?;

        Ok(lots)
    }

    async fn all_locations(&self) -> Result<Vec<Location>> {
        let sql = format!("SELECT {LOCATION_COLUMNS} FROM location_area ORDER BY location_code");
        let locations = sqlx::query_as::<_, Location>(&sql).fetch_all(&self.pool).await?;

        Ok(locations)
    }
}

#[async_trait]
impl HealthProbe for Database {
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
