#![deny(clippy::print_stdout, clippy::print_stderr)]

use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::NaiveDate;
use chrono::Utc;
use psp_ledger::EntryId;
use psp_ledger::EntryType;
use psp_ledger::LedgerAccountType;
use psp_ledger::LedgerService;
use psp_ledger::LegalEntityId;
use psp_ledger::Money;
use psp_ledger::PostEntryRequest;
use psp_ledger::TenantId;
use psp_orchestrator::InstructionStatus;
use psp_orchestrator::InstructionStore;
use psp_rails::Direction;
use psp_rails::PaymentRailProvider;
use psp_rails::Rail;
use psp_rails::SettlementRecord;
use psp_rails::SettlementStatus;
use serde::Deserialize;
use serde::Serialize;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

mod memory;

pub use crate::memory::InMemorySettlementStore;

pub type SettlementEventId = Uuid;
pub type BankAccountId = Uuid;

pub type ReconcileResult<T> = Result<T, ReconcileError>;

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("storage failure: {0}")]
    Storage(String),
    #[error(transparent)]
    Ledger(#[from] psp_ledger::LedgerError),
    #[error(transparent)]
    Orchestrator(#[from] psp_orchestrator::OrchestratorError),
    #[error(transparent)]
    Rail(#[from] psp_rails::RailError),
}

pub const ISSUE_PROVIDER_ERROR: &str = "PROVIDER_ERROR";
pub const ISSUE_RECORD_ERROR: &str = "RECORD_ERROR";

/// Truth from the rail, materialized once per `(bank_account, trace_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementEvent {
    pub id: SettlementEventId,
    pub bank_account_id: BankAccountId,
    pub rail: Rail,
    pub direction: Direction,
    pub amount: Money,
    pub currency: String,
    pub status: SettlementStatus,
    pub external_trace_id: String,
    pub effective_date: NaiveDate,
    pub raw_payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Join row between a settlement event and the ledger entry it caused. The
/// tenant scope rides along so reversals can resolve the entry later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementLink {
    pub id: Uuid,
    pub settlement_event_id: SettlementEventId,
    pub ledger_entry_id: EntryId,
    pub tenant_id: TenantId,
    pub legal_entity_id: LegalEntityId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileIssue {
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    pub message: String,
}

/// Aggregate result of one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationOutcome {
    pub reconciliation_date: NaiveDate,
    pub records_processed: usize,
    pub records_matched: usize,
    pub records_created: usize,
    pub records_failed: usize,
    pub errors: Vec<ReconcileIssue>,
    pub unmatched_trace_ids: Vec<String>,
}

impl ReconciliationOutcome {
    fn new(reconciliation_date: NaiveDate) -> Self {
        Self {
            reconciliation_date,
            records_processed: 0,
            records_matched: 0,
            records_created: 0,
            records_failed: 0,
            errors: Vec::new(),
            unmatched_trace_ids: Vec::new(),
        }
    }

    pub fn success(&self) -> bool {
        self.records_failed == 0 && self.errors.is_empty()
    }
}

/// Persistence seam for settlement events and their ledger links.
#[async_trait]
pub trait SettlementStore: Send + Sync {
    async fn find_by_trace(
        &self,
        bank_account_id: BankAccountId,
        external_trace_id: &str,
    ) -> ReconcileResult<Option<SettlementEvent>>;

    /// Idempotent insert on `(bank_account, external_trace_id)`. Returns
    /// `None` when the trace was already materialized.
    async fn insert(&self, event: SettlementEvent)
    -> ReconcileResult<Option<SettlementEvent>>;

    /// Advance-only status update; `Settled -> Returned/Reversed` is the one
    /// allowed late regression.
    async fn update_status(
        &self,
        settlement_event_id: SettlementEventId,
        new_status: SettlementStatus,
        effective_date: NaiveDate,
    ) -> ReconcileResult<SettlementEvent>;

    /// Idempotent link row per (settlement, ledger entry).
    async fn add_link(&self, link: SettlementLink) -> ReconcileResult<bool>;

    async fn links_for_settlement(
        &self,
        settlement_event_id: SettlementEventId,
    ) -> ReconcileResult<Vec<SettlementLink>>;

    /// Settlement events with no ledger link, for operator triage.
    async fn unmatched(
        &self,
        bank_account_id: BankAccountId,
        start: NaiveDate,
        end: NaiveDate,
        limit: usize,
    ) -> ReconcileResult<Vec<SettlementEvent>>;
}

fn instruction_status_for(settlement: SettlementStatus) -> Option<InstructionStatus> {
    match settlement {
        SettlementStatus::Accepted => Some(InstructionStatus::Accepted),
        SettlementStatus::Settled => Some(InstructionStatus::Settled),
        SettlementStatus::Failed => Some(InstructionStatus::Failed),
        SettlementStatus::Returned | SettlementStatus::Reversed => {
            Some(InstructionStatus::Reversed)
        }
        SettlementStatus::Created | SettlementStatus::Submitted => None,
    }
}

/// Ingests settlement feeds: materializes settlement events idempotently,
/// matches them to payment attempts, advances instruction state, and posts
/// the settle/reverse ledger entries. Re-running a feed is a no-op.
pub struct ReconciliationService {
    store: Arc<dyn SettlementStore>,
    ledger: Arc<dyn LedgerService>,
    instructions: Arc<dyn InstructionStore>,
    provider: Arc<dyn PaymentRailProvider>,
    bank_account_id: BankAccountId,
}

impl ReconciliationService {
    pub fn new(
        store: Arc<dyn SettlementStore>,
        ledger: Arc<dyn LedgerService>,
        instructions: Arc<dyn InstructionStore>,
        provider: Arc<dyn PaymentRailProvider>,
        bank_account_id: BankAccountId,
    ) -> Self {
        Self {
            store,
            ledger,
            instructions,
            provider,
            bank_account_id,
        }
    }

    /// Pulls the provider's feed for a date and processes it. A provider
    /// fetch failure is reported in `errors` without failing the run.
    pub async fn run(
        &self,
        reconciliation_date: NaiveDate,
        tenant_id: Option<TenantId>,
    ) -> ReconciliationOutcome {
        let records = match self.provider.reconcile(reconciliation_date).await {
            Ok(records) => records,
            Err(err) => {
                warn!(
                    provider = self.provider.name(),
                    error = %err,
                    "settlement feed fetch failed"
                );
                let mut outcome = ReconciliationOutcome::new(reconciliation_date);
                outcome.errors.push(ReconcileIssue {
                    code: ISSUE_PROVIDER_ERROR.into(),
                    trace_id: None,
                    message: format!("failed to fetch records from provider: {err}"),
                });
                return outcome;
            }
        };

        self.process_records(reconciliation_date, &records, tenant_id)
            .await
    }

    /// Processes an already-fetched batch of records (the facade's ingest
    /// path). Per-record failures are recorded and do not abort the rest.
    pub async fn process_records(
        &self,
        reconciliation_date: NaiveDate,
        records: &[SettlementRecord],
        tenant_id: Option<TenantId>,
    ) -> ReconciliationOutcome {
        let mut outcome = ReconciliationOutcome::new(reconciliation_date);
        outcome.records_processed = records.len();

        for record in records {
            match self.process_record(record, tenant_id).await {
                Ok(disposition) => {
                    if disposition.already_existed {
                        outcome.records_matched += 1;
                    } else {
                        outcome.records_created += 1;
                    }
                    if !disposition.matched_instruction {
                        outcome
                            .unmatched_trace_ids
                            .push(record.external_trace_id.clone());
                    }
                }
                Err(err) => {
                    outcome.records_failed += 1;
                    outcome.errors.push(ReconcileIssue {
                        code: ISSUE_RECORD_ERROR.into(),
                        trace_id: Some(record.external_trace_id.clone()),
                        message: err.to_string(),
                    });
                }
            }
        }

        info!(
            date = %reconciliation_date,
            processed = outcome.records_processed,
            matched = outcome.records_matched,
            created = outcome.records_created,
            failed = outcome.records_failed,
            unmatched = outcome.unmatched_trace_ids.len(),
            "reconciliation pass complete"
        );
        outcome
    }

    pub async fn unmatched_settlements(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        limit: usize,
    ) -> ReconcileResult<Vec<SettlementEvent>> {
        self.store
            .unmatched(self.bank_account_id, start, end, limit)
            .await
    }

    async fn process_record(
        &self,
        record: &SettlementRecord,
        tenant_id: Option<TenantId>,
    ) -> ReconcileResult<RecordDisposition> {
        if let Some(existing) = self
            .store
            .find_by_trace(self.bank_account_id, &record.external_trace_id)
            .await?
        {
            if existing.status != record.status {
                self.store
                    .update_status(existing.id, record.status, record.effective_date)
                    .await?;
                self.handle_status_change(&existing, record, tenant_id).await?;
            }
            return Ok(RecordDisposition {
                already_existed: true,
                matched_instruction: true,
            });
        }

        // Match before materializing so the event can carry the
        // instruction's direction; unmatched feeds default to outbound.
        let matched = self
            .matching_instruction(&record.external_trace_id, tenant_id)
            .await?;
        let direction = matched
            .as_ref()
            .map(|instruction| instruction.direction)
            .unwrap_or(Direction::Outbound);

        let event = SettlementEvent {
            id: Uuid::new_v4(),
            bank_account_id: self.bank_account_id,
            rail: self.provider.capabilities().feed_rail(),
            direction,
            amount: record.amount,
            currency: record.currency.clone(),
            status: record.status,
            external_trace_id: record.external_trace_id.clone(),
            effective_date: record.effective_date,
            raw_payload: record.raw_payload.clone(),
            created_at: Utc::now(),
        };
        let Some(stored) = self.store.insert(event).await? else {
            // Lost a race with another ingest of the same trace.
            return Ok(RecordDisposition {
                already_existed: true,
                matched_instruction: true,
            });
        };

        let Some(instruction) = matched else {
            return Ok(RecordDisposition {
                already_existed: false,
                matched_instruction: false,
            });
        };

        self.advance_instruction(&instruction, record.status).await?;

        if record.status == SettlementStatus::Settled {
            self.post_settlement_entry(&stored, &instruction).await?;
        }

        Ok(RecordDisposition {
            already_existed: false,
            matched_instruction: true,
        })
    }

    async fn matching_instruction(
        &self,
        external_trace_id: &str,
        tenant_id: Option<TenantId>,
    ) -> ReconcileResult<Option<psp_orchestrator::PaymentInstruction>> {
        let Some(instruction) = self
            .instructions
            .instruction_for_provider_request_id(external_trace_id)
            .await?
        else {
            return Ok(None);
        };
        if let Some(tenant) = tenant_id
            && instruction.tenant_id != tenant
        {
            return Ok(None);
        }
        Ok(Some(instruction))
    }

    async fn advance_instruction(
        &self,
        instruction: &psp_orchestrator::PaymentInstruction,
        settlement_status: SettlementStatus,
    ) -> ReconcileResult<()> {
        let Some(target) = instruction_status_for(settlement_status) else {
            return Ok(());
        };
        // A replayed feed finds the instruction already advanced; skipping
        // keeps the rerun a no-op.
        if instruction.status == target || !instruction.status.can_transition_to(target) {
            return Ok(());
        }
        self.instructions
            .update_status(instruction.tenant_id, instruction.id, target)
            .await?;
        Ok(())
    }

    async fn handle_status_change(
        &self,
        existing: &SettlementEvent,
        record: &SettlementRecord,
        tenant_id: Option<TenantId>,
    ) -> ReconcileResult<()> {
        if let Some(instruction) = self
            .matching_instruction(&record.external_trace_id, tenant_id)
            .await?
        {
            self.advance_instruction(&instruction, record.status).await?;
        }

        let returned = matches!(
            record.status,
            SettlementStatus::Returned | SettlementStatus::Reversed
        );
        if existing.status == SettlementStatus::Settled && returned {
            let links = self.store.links_for_settlement(existing.id).await?;
            for link in links {
                self.ledger
                    .reverse_entry(
                        link.tenant_id,
                        link.legal_entity_id,
                        link.ledger_entry_id,
                        &format!("settlement_reversal_{}", existing.id),
                        &format!(
                            "Settlement status changed from {} to {}",
                            existing.status, record.status
                        ),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn post_settlement_entry(
        &self,
        settlement: &SettlementEvent,
        instruction: &psp_orchestrator::PaymentInstruction,
    ) -> ReconcileResult<()> {
        let funding_account = self
            .ledger
            .get_or_create_account(
                instruction.tenant_id,
                instruction.legal_entity_id,
                LedgerAccountType::ClientFundingClearing,
                &settlement.currency,
            )
            .await?;
        let settlement_account = self
            .ledger
            .get_or_create_account(
                instruction.tenant_id,
                instruction.legal_entity_id,
                LedgerAccountType::PspSettlementClearing,
                &settlement.currency,
            )
            .await?;

        let posted = self
            .ledger
            .post_entry(PostEntryRequest {
                tenant_id: instruction.tenant_id,
                legal_entity_id: instruction.legal_entity_id,
                idempotency_key: format!("settlement_{}", settlement.id),
                entry_type: EntryType::EmployeePaymentSettled,
                debit_account_id: funding_account,
                credit_account_id: settlement_account,
                amount: settlement.amount,
                source_type: "settlement_event".into(),
                source_id: settlement.id,
                correlation_id: None,
                metadata: serde_json::json!({}),
            })
            .await?;

        if posted.is_new {
            self.store
                .add_link(SettlementLink {
                    id: Uuid::new_v4(),
                    settlement_event_id: settlement.id,
                    ledger_entry_id: posted.entry_id,
                    tenant_id: instruction.tenant_id,
                    legal_entity_id: instruction.legal_entity_id,
                    created_at: Utc::now(),
                })
                .await?;
        }
        Ok(())
    }
}

struct RecordDisposition {
    already_existed: bool,
    matched_instruction: bool,
}
