#![deny(clippy::print_stdout, clippy::print_stderr)]

use std::fmt::Display;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

mod memory;
mod money;

pub use crate::memory::InMemoryLedgerService;
pub use crate::money::Money;

pub type TenantId = Uuid;
pub type LegalEntityId = Uuid;
pub type AccountId = Uuid;
pub type EntryId = Uuid;
pub type ReservationId = Uuid;
pub type CorrelationId = Uuid;

pub type LedgerResult<T> = Result<T, LedgerError>;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("invalid amount: {0}")]
    InvalidAmount(String),
    #[error("debit and credit accounts must differ")]
    SameAccount,
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("operation rejected: {0}")]
    Rejected(String),
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("invariant violation: {0}")]
    Invariant(String),
}

/// Closed set of PSP ledger account types. Accounts are created lazily on
/// first use and never deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerAccountType {
    ClientFundingClearing,
    ClientNetPayPayable,
    ClientTaxImpoundPayable,
    ClientThirdPartyPayable,
    PspFeesRevenue,
    PspSettlementClearing,
}

impl LedgerAccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerAccountType::ClientFundingClearing => "client_funding_clearing",
            LedgerAccountType::ClientNetPayPayable => "client_net_pay_payable",
            LedgerAccountType::ClientTaxImpoundPayable => "client_tax_impound_payable",
            LedgerAccountType::ClientThirdPartyPayable => "client_third_party_payable",
            LedgerAccountType::PspFeesRevenue => "psp_fees_revenue",
            LedgerAccountType::PspSettlementClearing => "psp_settlement_clearing",
        }
    }
}

impl Display for LedgerAccountType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerAccount {
    pub id: AccountId,
    pub tenant_id: TenantId,
    pub legal_entity_id: LegalEntityId,
    pub account_type: LedgerAccountType,
    pub currency: String,
    pub status: AccountStatus,
    pub created_at: DateTime<Utc>,
}

/// Closed set of posting types for the double-entry ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    FundingReceived,
    FundingReturned,
    ReserveCreated,
    ReserveReleased,
    EmployeePaymentInitiated,
    EmployeePaymentSettled,
    EmployeePaymentFailed,
    TaxPaymentInitiated,
    TaxPaymentSettled,
    ThirdPartyPaymentInitiated,
    ThirdPartyPaymentSettled,
    FeeAssessed,
    Reversal,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::FundingReceived => "funding_received",
            EntryType::FundingReturned => "funding_returned",
            EntryType::ReserveCreated => "reserve_created",
            EntryType::ReserveReleased => "reserve_released",
            EntryType::EmployeePaymentInitiated => "employee_payment_initiated",
            EntryType::EmployeePaymentSettled => "employee_payment_settled",
            EntryType::EmployeePaymentFailed => "employee_payment_failed",
            EntryType::TaxPaymentInitiated => "tax_payment_initiated",
            EntryType::TaxPaymentSettled => "tax_payment_settled",
            EntryType::ThirdPartyPaymentInitiated => "third_party_payment_initiated",
            EntryType::ThirdPartyPaymentSettled => "third_party_payment_settled",
            EntryType::FeeAssessed => "fee_assessed",
            EntryType::Reversal => "reversal",
        }
    }
}

impl Display for EntryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A committed double-entry posting. Entries are immutable once stored; the
/// only correction mechanism is a compensating `Reversal` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: EntryId,
    pub tenant_id: TenantId,
    pub legal_entity_id: LegalEntityId,
    pub posted_at: DateTime<Utc>,
    pub entry_type: EntryType,
    pub debit_account_id: AccountId,
    pub credit_account_id: AccountId,
    pub amount: Money,
    pub source_type: String,
    pub source_id: Uuid,
    pub correlation_id: Option<CorrelationId>,
    pub idempotency_key: String,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReserveType {
    NetPay,
    Tax,
    ThirdParty,
    Fees,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Active,
    Released,
    Consumed,
}

/// A named hold on a legal entity's funds. Reservations never move ledger
/// money; they only shrink the unreserved view of availability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub tenant_id: TenantId,
    pub legal_entity_id: LegalEntityId,
    pub reserve_type: ReserveType,
    pub amount: Money,
    pub currency: String,
    pub status: ReservationStatus,
    pub source_type: String,
    pub source_id: Uuid,
    pub correlation_id: Option<CorrelationId>,
    pub created_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub available: Money,
    pub reserved: Money,
}

impl Balance {
    pub fn unreserved(&self) -> Money {
        self.available - self.reserved
    }
}

/// Result of a posting operation. Check `is_new`: `false` means the request
/// was an idempotent duplicate and the pre-existing entry was returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostResult {
    pub entry_id: EntryId,
    pub is_new: bool,
    pub entry_type: EntryType,
}

impl PostResult {
    pub fn was_duplicate(&self) -> bool {
        !self.is_new
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PostEntryRequest {
    pub tenant_id: TenantId,
    pub legal_entity_id: LegalEntityId,
    pub idempotency_key: String,
    pub entry_type: EntryType,
    pub debit_account_id: AccountId,
    pub credit_account_id: AccountId,
    pub amount: Money,
    pub source_type: String,
    pub source_id: Uuid,
    pub correlation_id: Option<CorrelationId>,
    pub metadata: serde_json::Value,
}

impl PostEntryRequest {
    pub fn validate(&self) -> LedgerResult<()> {
        if !self.amount.is_positive() {
            return Err(LedgerError::InvalidAmount(format!(
                "ledger amounts must be strictly positive, got {}",
                self.amount
            )));
        }
        if self.debit_account_id == self.credit_account_id {
            return Err(LedgerError::SameAccount);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateReservationRequest {
    pub tenant_id: TenantId,
    pub legal_entity_id: LegalEntityId,
    pub reserve_type: ReserveType,
    pub amount: Money,
    pub currency: String,
    pub source_type: String,
    pub source_id: Uuid,
    pub correlation_id: Option<CorrelationId>,
}

#[async_trait]
pub trait LedgerService: Send + Sync {
    /// Returns the account id for `(tenant, legal_entity, type, currency)`,
    /// creating the account lazily on first use.
    async fn get_or_create_account(
        &self,
        tenant_id: TenantId,
        legal_entity_id: LegalEntityId,
        account_type: LedgerAccountType,
        currency: &str,
    ) -> LedgerResult<AccountId>;

    /// Posts a double-entry. Idempotent on `(tenant, idempotency_key)`.
    async fn post_entry(&self, request: PostEntryRequest) -> LedgerResult<PostResult>;

    /// Posts a `Reversal` of an existing entry with debit/credit swapped.
    async fn reverse_entry(
        &self,
        tenant_id: TenantId,
        legal_entity_id: LegalEntityId,
        original_entry_id: EntryId,
        idempotency_key: &str,
        reason: &str,
    ) -> LedgerResult<PostResult>;

    /// Balance aggregated on demand: available = credits - debits, reserved =
    /// active reservations of the account's legal entity.
    async fn get_balance(&self, tenant_id: TenantId, account_id: AccountId)
    -> LedgerResult<Balance>;

    async fn create_reservation(
        &self,
        request: CreateReservationRequest,
    ) -> LedgerResult<ReservationId>;

    /// Transitions an active reservation to released (or consumed). Returns
    /// `false` when the reservation is missing or no longer active.
    async fn release_reservation(
        &self,
        tenant_id: TenantId,
        reservation_id: ReservationId,
        consumed: bool,
    ) -> LedgerResult<bool>;

    async fn entry(&self, tenant_id: TenantId, entry_id: EntryId) -> LedgerResult<LedgerEntry>;

    async fn accounts(&self, tenant_id: TenantId) -> LedgerResult<Vec<LedgerAccount>>;

    async fn active_reservations(
        &self,
        tenant_id: TenantId,
        legal_entity_id: LegalEntityId,
    ) -> LedgerResult<Vec<Reservation>>;
}
