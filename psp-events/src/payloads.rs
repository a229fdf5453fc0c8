//! Typed payloads for every event the core emits. The envelope around them is
//! [`crate::DomainEvent`]; amounts serialize as decimal strings and dates as
//! ISO-8601.

use chrono::NaiveDate;
use psp_ledger::Money;
use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

use crate::EventCategory;
use crate::EventPayload;

macro_rules! event_payload {
    ($payload:ty, $event_type:literal, $category:ident) => {
        impl EventPayload for $payload {
            const EVENT_TYPE: &'static str = $event_type;
            const CATEGORY: EventCategory = EventCategory::$category;
        }
    };
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingRequested {
    pub funding_request_id: Uuid,
    pub legal_entity_id: Uuid,
    pub pay_period_id: Uuid,
    pub requested_amount: Money,
    pub currency: String,
    pub requested_date: NaiveDate,
}
event_payload!(FundingRequested, "FundingRequested", Funding);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingApproved {
    pub funding_request_id: Uuid,
    pub legal_entity_id: Uuid,
    pub approved_amount: Money,
    pub available_balance: Money,
    pub gate_evaluation_id: Uuid,
}
event_payload!(FundingApproved, "FundingApproved", Funding);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingBlocked {
    pub funding_request_id: Uuid,
    pub legal_entity_id: Uuid,
    pub requested_amount: Money,
    pub available_balance: Money,
    pub block_reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_violated: Option<String>,
    pub gate_evaluation_id: Uuid,
}
event_payload!(FundingBlocked, "FundingBlocked", Funding);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingInsufficientFunds {
    pub funding_request_id: Uuid,
    pub legal_entity_id: Uuid,
    pub requested_amount: Money,
    pub available_balance: Money,
    pub shortfall: Money,
    pub gate_evaluation_id: Uuid,
}
event_payload!(
    FundingInsufficientFunds,
    "FundingInsufficientFunds",
    Funding
);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentInstructionCreated {
    pub payment_instruction_id: Uuid,
    pub legal_entity_id: Uuid,
    pub purpose: String,
    pub direction: String,
    pub amount: Money,
    pub currency: String,
    pub payee_type: String,
    pub payee_ref_id: Uuid,
    pub source_type: String,
    pub source_id: Uuid,
}
event_payload!(
    PaymentInstructionCreated,
    "PaymentInstructionCreated",
    Payment
);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentSubmitted {
    pub payment_instruction_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_attempt_id: Option<Uuid>,
    pub rail: String,
    pub provider: String,
    pub provider_request_id: String,
}
event_payload!(PaymentSubmitted, "PaymentSubmitted", Payment);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentSettled {
    pub payment_instruction_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settlement_event_id: Option<Uuid>,
    pub amount: Money,
    pub currency: String,
    pub effective_date: NaiveDate,
    pub external_trace_id: String,
}
event_payload!(PaymentSettled, "PaymentSettled", Payment);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentFailed {
    pub payment_instruction_id: Uuid,
    pub provider: String,
    pub failure_reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_code: Option<String>,
    pub error_origin: String,
}
event_payload!(PaymentFailed, "PaymentFailed", Payment);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentReturned {
    pub payment_instruction_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settlement_event_id: Option<Uuid>,
    pub amount: Money,
    pub return_code: String,
    pub return_reason: String,
    pub return_date: NaiveDate,
    pub liability_party: String,
}
event_payload!(PaymentReturned, "PaymentReturned", Payment);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntryPosted {
    pub ledger_entry_id: Uuid,
    pub legal_entity_id: Uuid,
    pub entry_type: String,
    pub debit_account_id: Uuid,
    pub credit_account_id: Uuid,
    pub amount: Money,
}
event_payload!(LedgerEntryPosted, "LedgerEntryPosted", Ledger);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntryReversed {
    pub ledger_entry_id: Uuid,
    pub reversal_entry_id: Uuid,
    pub amount: Money,
    pub reason: String,
}
event_payload!(LedgerEntryReversed, "LedgerEntryReversed", Ledger);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementReceived {
    pub bank_account_id: Uuid,
    pub rail: String,
    pub amount: Money,
    pub currency: String,
    pub external_trace_id: String,
    pub effective_date: NaiveDate,
    pub status: String,
}
event_payload!(SettlementReceived, "SettlementReceived", Settlement);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementStatusChanged {
    pub settlement_event_id: Uuid,
    pub external_trace_id: String,
    pub old_status: String,
    pub new_status: String,
}
event_payload!(
    SettlementStatusChanged,
    "SettlementStatusChanged",
    Settlement
);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiabilityClassified {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub liability_event_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_instruction_id: Option<Uuid>,
    pub error_origin: String,
    pub liability_party: String,
    pub recovery_path: String,
    pub amount: Money,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_code: Option<String>,
    pub classification_reason: String,
}
event_payload!(LiabilityClassified, "LiabilityClassified", Liability);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationStarted {
    pub reconciliation_id: Uuid,
    pub reconciliation_date: NaiveDate,
    pub bank_account_id: Uuid,
    pub provider: String,
}
event_payload!(
    ReconciliationStarted,
    "ReconciliationStarted",
    Reconciliation
);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationCompleted {
    pub reconciliation_id: Uuid,
    pub reconciliation_date: NaiveDate,
    pub records_processed: usize,
    pub records_matched: usize,
    pub records_created: usize,
    pub records_failed: usize,
    pub unmatched_count: usize,
}
event_payload!(
    ReconciliationCompleted,
    "ReconciliationCompleted",
    Reconciliation
);
