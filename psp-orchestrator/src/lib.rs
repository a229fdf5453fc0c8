#![deny(clippy::print_stdout, clippy::print_stderr)]

use std::fmt::Display;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::NaiveDate;
use chrono::Utc;
use psp_ledger::EntryType;
use psp_ledger::LedgerAccountType;
use psp_ledger::LedgerService;
use psp_ledger::LegalEntityId;
use psp_ledger::Money;
use psp_ledger::PostEntryRequest;
use psp_ledger::TenantId;
use psp_rails::Direction;
use psp_rails::InstructionPayload;
use psp_rails::PaymentRailProvider;
use psp_rails::Rail;
use serde::Deserialize;
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

mod memory;

pub use crate::memory::InMemoryInstructionStore;

pub type InstructionId = Uuid;
pub type AttemptId = Uuid;

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("operation rejected: {0}")]
    Rejected(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("storage failure: {0}")]
    Storage(String),
    #[error(transparent)]
    Ledger(#[from] psp_ledger::LedgerError),
}

/// What the money movement is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentPurpose {
    EmployeeNet,
    TaxRemit,
    ThirdParty,
    FundingDebit,
}

impl PaymentPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentPurpose::EmployeeNet => "employee_net",
            PaymentPurpose::TaxRemit => "tax_remit",
            PaymentPurpose::ThirdParty => "third_party",
            PaymentPurpose::FundingDebit => "funding_debit",
        }
    }
}

impl Display for PaymentPurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayeeType {
    Employee,
    Agency,
    Vendor,
    Client,
}

impl PayeeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayeeType::Employee => "employee",
            PayeeType::Agency => "agency",
            PayeeType::Vendor => "vendor",
            PayeeType::Client => "client",
        }
    }
}

/// Instruction lifecycle. Transitions only move forward:
/// `created -> queued -> submitted -> accepted -> settled`, any non-terminal
/// state may fail, and a settled payment may later be reversed by a return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstructionStatus {
    Created,
    Queued,
    Submitted,
    Accepted,
    Settled,
    Failed,
    Reversed,
}

impl InstructionStatus {
    fn rank(&self) -> u8 {
        match self {
            InstructionStatus::Created => 0,
            InstructionStatus::Queued => 1,
            InstructionStatus::Submitted => 2,
            InstructionStatus::Accepted => 3,
            InstructionStatus::Settled => 4,
            InstructionStatus::Failed | InstructionStatus::Reversed => 5,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstructionStatus::Settled | InstructionStatus::Failed | InstructionStatus::Reversed
        )
    }

    pub fn can_transition_to(&self, next: InstructionStatus) -> bool {
        if *self == next {
            return false;
        }
        match (self, next) {
            // A settled payment has exactly one exit: a later return.
            (InstructionStatus::Settled, InstructionStatus::Reversed) => true,
            (InstructionStatus::Settled, _) => false,
            (_, InstructionStatus::Failed) => !self.is_terminal(),
            (_, InstructionStatus::Reversed) => false,
            _ => !self.is_terminal() && next.rank() > self.rank(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstructionStatus::Created => "created",
            InstructionStatus::Queued => "queued",
            InstructionStatus::Submitted => "submitted",
            InstructionStatus::Accepted => "accepted",
            InstructionStatus::Settled => "settled",
            InstructionStatus::Failed => "failed",
            InstructionStatus::Reversed => "reversed",
        }
    }
}

impl Display for InstructionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Intent to move money for one payee.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentInstruction {
    pub id: InstructionId,
    pub tenant_id: TenantId,
    pub legal_entity_id: LegalEntityId,
    pub purpose: PaymentPurpose,
    pub direction: Direction,
    pub amount: Money,
    pub currency: String,
    pub payee_type: PayeeType,
    pub payee_ref_id: Uuid,
    pub requested_settlement_date: Option<NaiveDate>,
    pub status: InstructionStatus,
    pub idempotency_key: String,
    pub source_type: String,
    pub source_id: Uuid,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Accepted,
    Failed,
}

/// One submission to a provider. `(provider, provider_request_id)` is unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentAttempt {
    pub id: AttemptId,
    pub instruction_id: InstructionId,
    pub rail: Rail,
    pub provider: String,
    pub provider_request_id: String,
    pub status: AttemptStatus,
    pub request_payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateInstructionRequest {
    pub tenant_id: TenantId,
    pub legal_entity_id: LegalEntityId,
    pub purpose: PaymentPurpose,
    pub direction: Direction,
    pub amount: Money,
    pub currency: String,
    pub payee_type: PayeeType,
    pub payee_ref_id: Uuid,
    pub requested_settlement_date: Option<NaiveDate>,
    pub idempotency_key: String,
    pub source_type: String,
    pub source_id: Uuid,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstructionResult {
    pub instruction_id: InstructionId,
    pub was_duplicate: bool,
    pub status: InstructionStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionResult {
    pub instruction_id: InstructionId,
    pub attempt_id: Option<AttemptId>,
    pub provider_request_id: Option<String>,
    pub accepted: bool,
    pub message: String,
}

/// Persistence seam for instructions and attempts. The store owns the unique
/// keys and the forward-only state machine; services stay policy-only.
#[async_trait]
pub trait InstructionStore: Send + Sync {
    /// Idempotent insert on `(tenant, idempotency_key)`. Dedup considers the
    /// key alone: a second call with different fields returns the original.
    async fn create(
        &self,
        instruction: PaymentInstruction,
    ) -> OrchestratorResult<(PaymentInstruction, bool)>;

    async fn get(
        &self,
        tenant_id: TenantId,
        instruction_id: InstructionId,
    ) -> OrchestratorResult<PaymentInstruction>;

    /// Forward-only status advance.
    async fn update_status(
        &self,
        tenant_id: TenantId,
        instruction_id: InstructionId,
        new_status: InstructionStatus,
    ) -> OrchestratorResult<PaymentInstruction>;

    /// Idempotent insert on `(provider, provider_request_id)`. Returns `None`
    /// when that submission was already recorded.
    async fn record_attempt(
        &self,
        attempt: PaymentAttempt,
    ) -> OrchestratorResult<Option<AttemptId>>;

    async fn find_attempt_by_provider_request_id(
        &self,
        provider_request_id: &str,
    ) -> OrchestratorResult<Option<PaymentAttempt>>;

    /// The instruction whose attempt carries this provider request id.
    async fn instruction_for_provider_request_id(
        &self,
        provider_request_id: &str,
    ) -> OrchestratorResult<Option<PaymentInstruction>>;

    async fn attempts_for_instruction(
        &self,
        instruction_id: InstructionId,
    ) -> OrchestratorResult<Vec<PaymentAttempt>>;

    /// Instructions still in `created`/`queued`, oldest first.
    async fn ready_for_submission(
        &self,
        tenant_id: TenantId,
        legal_entity_id: Option<LegalEntityId>,
        limit: usize,
    ) -> OrchestratorResult<Vec<PaymentInstruction>>;

    /// Non-terminal instructions created before the cutoff (stuck payments).
    async fn non_terminal_older_than(
        &self,
        tenant_id: TenantId,
        cutoff: DateTime<Utc>,
    ) -> OrchestratorResult<Vec<PaymentInstruction>>;

    async fn status_counts(
        &self,
        tenant_id: TenantId,
    ) -> OrchestratorResult<Vec<(InstructionStatus, usize)>>;
}

/// Drives the instruction lifecycle: idempotent creation, provider
/// submission with attempt tracking, and the companion ledger entries that
/// mirror state transitions.
pub struct PaymentOrchestrator {
    store: Arc<dyn InstructionStore>,
    ledger: Arc<dyn LedgerService>,
    provider: Arc<dyn PaymentRailProvider>,
}

impl PaymentOrchestrator {
    pub fn new(
        store: Arc<dyn InstructionStore>,
        ledger: Arc<dyn LedgerService>,
        provider: Arc<dyn PaymentRailProvider>,
    ) -> Self {
        Self {
            store,
            ledger,
            provider,
        }
    }

    pub async fn create_instruction(
        &self,
        request: CreateInstructionRequest,
    ) -> OrchestratorResult<InstructionResult> {
        if !request.amount.is_positive() {
            return Err(OrchestratorError::Validation(format!(
                "instruction amounts must be strictly positive, got {}",
                request.amount
            )));
        }

        let instruction = PaymentInstruction {
            id: Uuid::new_v4(),
            tenant_id: request.tenant_id,
            legal_entity_id: request.legal_entity_id,
            purpose: request.purpose,
            direction: request.direction,
            amount: request.amount,
            currency: request.currency,
            payee_type: request.payee_type,
            payee_ref_id: request.payee_ref_id,
            requested_settlement_date: request.requested_settlement_date,
            status: InstructionStatus::Created,
            idempotency_key: request.idempotency_key,
            source_type: request.source_type,
            source_id: request.source_id,
            metadata: request.metadata,
            created_at: Utc::now(),
        };

        let (stored, was_duplicate) = self.store.create(instruction).await?;
        Ok(InstructionResult {
            instruction_id: stored.id,
            was_duplicate,
            status: stored.status,
        })
    }

    pub async fn create_employee_net_instruction(
        &self,
        tenant_id: TenantId,
        legal_entity_id: LegalEntityId,
        employee_id: Uuid,
        pay_statement_id: Uuid,
        amount: Money,
        idempotency_key: String,
    ) -> OrchestratorResult<InstructionResult> {
        self.create_instruction(CreateInstructionRequest {
            tenant_id,
            legal_entity_id,
            purpose: PaymentPurpose::EmployeeNet,
            direction: Direction::Outbound,
            amount,
            currency: "USD".into(),
            payee_type: PayeeType::Employee,
            payee_ref_id: employee_id,
            requested_settlement_date: None,
            idempotency_key,
            source_type: "pay_statement".into(),
            source_id: pay_statement_id,
            metadata: serde_json::json!({}),
        })
        .await
    }

    pub async fn create_tax_instruction(
        &self,
        tenant_id: TenantId,
        legal_entity_id: LegalEntityId,
        tax_agency_id: Uuid,
        tax_liability_id: Uuid,
        amount: Money,
        idempotency_key: String,
    ) -> OrchestratorResult<InstructionResult> {
        self.create_instruction(CreateInstructionRequest {
            tenant_id,
            legal_entity_id,
            purpose: PaymentPurpose::TaxRemit,
            direction: Direction::Outbound,
            amount,
            currency: "USD".into(),
            payee_type: PayeeType::Agency,
            payee_ref_id: tax_agency_id,
            requested_settlement_date: None,
            idempotency_key,
            source_type: "tax_liability".into(),
            source_id: tax_liability_id,
            metadata: serde_json::json!({}),
        })
        .await
    }

    pub async fn create_third_party_instruction(
        &self,
        tenant_id: TenantId,
        legal_entity_id: LegalEntityId,
        vendor_id: Uuid,
        obligation_id: Uuid,
        amount: Money,
        idempotency_key: String,
    ) -> OrchestratorResult<InstructionResult> {
        self.create_instruction(CreateInstructionRequest {
            tenant_id,
            legal_entity_id,
            purpose: PaymentPurpose::ThirdParty,
            direction: Direction::Outbound,
            amount,
            currency: "USD".into(),
            payee_type: PayeeType::Vendor,
            payee_ref_id: vendor_id,
            requested_settlement_date: None,
            idempotency_key,
            source_type: "third_party_obligation".into(),
            source_id: obligation_id,
            metadata: serde_json::json!({}),
        })
        .await
    }

    pub async fn create_funding_debit_instruction(
        &self,
        tenant_id: TenantId,
        legal_entity_id: LegalEntityId,
        client_id: Uuid,
        funding_request_id: Uuid,
        amount: Money,
        idempotency_key: String,
    ) -> OrchestratorResult<InstructionResult> {
        self.create_instruction(CreateInstructionRequest {
            tenant_id,
            legal_entity_id,
            purpose: PaymentPurpose::FundingDebit,
            direction: Direction::Inbound,
            amount,
            currency: "USD".into(),
            payee_type: PayeeType::Client,
            payee_ref_id: client_id,
            requested_settlement_date: None,
            idempotency_key,
            source_type: "funding_request".into(),
            source_id: funding_request_id,
            metadata: serde_json::json!({}),
        })
        .await
    }

    /// Submits an instruction to the provider.
    ///
    /// A definitive provider rejection records a failed attempt and fails
    /// the instruction. A transport-level provider error leaves the
    /// instruction untouched so the caller's retry re-enters cleanly; the
    /// provider contract makes that retry idempotent.
    pub async fn submit(
        &self,
        tenant_id: TenantId,
        instruction_id: InstructionId,
    ) -> OrchestratorResult<SubmissionResult> {
        let instruction = self.store.get(tenant_id, instruction_id).await?;
        if !matches!(
            instruction.status,
            InstructionStatus::Created | InstructionStatus::Queued
        ) {
            return Err(OrchestratorError::Rejected(format!(
                "cannot submit instruction in status {}",
                instruction.status
            )));
        }

        let payload = InstructionPayload {
            instruction_id: instruction.id,
            amount: instruction.amount,
            idempotency_key: instruction.idempotency_key.clone(),
            purpose: instruction.purpose.as_str().into(),
            payee_type: instruction.payee_type.as_str().into(),
            payee_ref_id: instruction.payee_ref_id,
            direction: instruction.direction,
            metadata: instruction.metadata.clone(),
        };

        let outcome = match self.provider.submit(&payload).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(
                    instruction_id = %instruction.id,
                    provider = self.provider.name(),
                    error = %err,
                    "provider submission errored; instruction left retriable"
                );
                return Ok(SubmissionResult {
                    instruction_id: instruction.id,
                    attempt_id: None,
                    provider_request_id: None,
                    accepted: false,
                    message: err.to_string(),
                });
            }
        };

        let rail = self
            .provider
            .capabilities()
            .preferred_rail(instruction.direction);
        let attempt_id = self
            .store
            .record_attempt(PaymentAttempt {
                id: Uuid::new_v4(),
                instruction_id: instruction.id,
                rail,
                provider: self.provider.name().to_string(),
                provider_request_id: outcome.provider_request_id.clone(),
                status: if outcome.accepted {
                    AttemptStatus::Accepted
                } else {
                    AttemptStatus::Failed
                },
                request_payload: serde_json::to_value(&payload)
                    .map_err(|err| OrchestratorError::Storage(err.to_string()))?,
                created_at: Utc::now(),
            })
            .await?;

        let new_status = if outcome.accepted {
            InstructionStatus::Submitted
        } else {
            InstructionStatus::Failed
        };
        self.store
            .update_status(tenant_id, instruction.id, new_status)
            .await?;

        if outcome.accepted && instruction.purpose == PaymentPurpose::EmployeeNet {
            self.post_payment_initiated_entry(&instruction).await?;
        }

        Ok(SubmissionResult {
            instruction_id: instruction.id,
            attempt_id,
            provider_request_id: Some(outcome.provider_request_id),
            accepted: outcome.accepted,
            message: outcome.message,
        })
    }

    /// Forward-only status advance from callbacks or polling. Settling an
    /// employee-net instruction posts its companion ledger entry.
    pub async fn update_status(
        &self,
        tenant_id: TenantId,
        instruction_id: InstructionId,
        new_status: InstructionStatus,
    ) -> OrchestratorResult<PaymentInstruction> {
        let updated = self
            .store
            .update_status(tenant_id, instruction_id, new_status)
            .await?;

        if new_status == InstructionStatus::Settled
            && updated.purpose == PaymentPurpose::EmployeeNet
        {
            self.post_payment_settled_entry(&updated).await?;
        }

        Ok(updated)
    }

    async fn post_payment_initiated_entry(
        &self,
        instruction: &PaymentInstruction,
    ) -> OrchestratorResult<()> {
        let net_pay_account = self
            .ledger
            .get_or_create_account(
                instruction.tenant_id,
                instruction.legal_entity_id,
                LedgerAccountType::ClientNetPayPayable,
                &instruction.currency,
            )
            .await?;
        let settlement_account = self
            .ledger
            .get_or_create_account(
                instruction.tenant_id,
                instruction.legal_entity_id,
                LedgerAccountType::PspSettlementClearing,
                &instruction.currency,
            )
            .await?;

        // Deterministic key: a resubmitted instruction never double-posts.
        self.ledger
            .post_entry(PostEntryRequest {
                tenant_id: instruction.tenant_id,
                legal_entity_id: instruction.legal_entity_id,
                idempotency_key: format!("payment_init_{}", instruction.id),
                entry_type: EntryType::EmployeePaymentInitiated,
                debit_account_id: net_pay_account,
                credit_account_id: settlement_account,
                amount: instruction.amount,
                source_type: "payment_instruction".into(),
                source_id: instruction.id,
                correlation_id: None,
                metadata: serde_json::json!({}),
            })
            .await?;
        Ok(())
    }

    async fn post_payment_settled_entry(
        &self,
        instruction: &PaymentInstruction,
    ) -> OrchestratorResult<()> {
        let funding_account = self
            .ledger
            .get_or_create_account(
                instruction.tenant_id,
                instruction.legal_entity_id,
                LedgerAccountType::ClientFundingClearing,
                &instruction.currency,
            )
            .await?;
        let settlement_account = self
            .ledger
            .get_or_create_account(
                instruction.tenant_id,
                instruction.legal_entity_id,
                LedgerAccountType::PspSettlementClearing,
                &instruction.currency,
            )
            .await?;

        // Settlement is when the employer's funds actually leave the
        // funding balance.
        self.ledger
            .post_entry(PostEntryRequest {
                tenant_id: instruction.tenant_id,
                legal_entity_id: instruction.legal_entity_id,
                idempotency_key: format!("payment_settled_{}", instruction.id),
                entry_type: EntryType::EmployeePaymentSettled,
                debit_account_id: funding_account,
                credit_account_id: settlement_account,
                amount: instruction.amount,
                source_type: "payment_instruction".into(),
                source_id: instruction.id,
                correlation_id: None,
                metadata: serde_json::json!({}),
            })
            .await?;
        Ok(())
    }
}
