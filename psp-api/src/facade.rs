use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDate;
use chrono::Utc;
use psp_events::DomainEvent;
use psp_events::EventEmitter;
use psp_events::EventPayload;
use psp_events::EventStore;
use psp_events::InMemoryEventStore;
use psp_events::payloads::FundingApproved;
use psp_events::payloads::FundingBlocked;
use psp_events::payloads::FundingInsufficientFunds;
use psp_events::payloads::FundingRequested;
use psp_events::payloads::LiabilityClassified;
use psp_events::payloads::PaymentFailed;
use psp_events::payloads::PaymentInstructionCreated;
use psp_events::payloads::PaymentReturned;
use psp_events::payloads::PaymentSettled;
use psp_events::payloads::PaymentSubmitted;
use psp_events::payloads::ReconciliationCompleted;
use psp_events::payloads::ReconciliationStarted;
use psp_events::payloads::SettlementReceived;
use psp_funding_gate::FundingGateService;
use psp_funding_gate::FundingModel;
use psp_funding_gate::FundingRequirement;
use psp_funding_gate::GateReason;
use psp_funding_gate::InMemoryPayRunProjections;
use psp_funding_gate::REASON_INSUFFICIENT_FUNDS;
use psp_ledger::CorrelationId;
use psp_ledger::CreateReservationRequest;
use psp_ledger::InMemoryLedgerService;
use psp_ledger::LedgerAccountType;
use psp_ledger::LedgerService;
use psp_ledger::LegalEntityId;
use psp_ledger::Money;
use psp_ledger::ReservationId;
use psp_ledger::ReserveType;
use psp_ledger::TenantId;
use psp_liability::ClassificationContext;
use psp_liability::LiabilityService;
use psp_liability::RecordLiabilityRequest;
use psp_orchestrator::CreateInstructionRequest;
use psp_orchestrator::InMemoryInstructionStore;
use psp_orchestrator::InstructionId;
use psp_orchestrator::InstructionStatus;
use psp_orchestrator::InstructionStore;
use psp_orchestrator::PaymentOrchestrator;
use psp_orchestrator::PaymentPurpose;
use psp_orchestrator::PayeeType;
use psp_rails::Direction;
use psp_rails::PaymentRailProvider;
use psp_rails::SettlementRecord;
use psp_reconcile::InMemorySettlementStore;
use psp_reconcile::ReconciliationService;
use psp_reconcile::SettlementStore;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::telemetry::PspTelemetry;

pub type PspResult<T> = Result<T, PspError>;

#[derive(Debug, thiserror::Error)]
pub enum PspError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Ledger(#[from] psp_ledger::LedgerError),
    #[error(transparent)]
    Gate(#[from] psp_funding_gate::GateError),
    #[error(transparent)]
    Orchestrator(#[from] psp_orchestrator::OrchestratorError),
    #[error(transparent)]
    Reconcile(#[from] psp_reconcile::ReconcileError),
    #[error(transparent)]
    Liability(#[from] psp_liability::LiabilityError),
    #[error(transparent)]
    Events(#[from] psp_events::EventStoreError),
}

/// Policy knobs for the facade. The pay gate default is deliberately
/// non-negotiable-looking: turning it off is an explicit, visible act.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PspConfig {
    pub commit_gate_strict: bool,
    pub pay_gate_always_enforced: bool,
    pub reservation_ttl_hours: i64,
    pub default_rail: String,
    pub emit_events: bool,
}

impl Default for PspConfig {
    fn default() -> Self {
        Self {
            commit_gate_strict: false,
            pay_gate_always_enforced: true,
            reservation_ttl_hours: 24,
            default_rail: "ach".into(),
            emit_events: true,
        }
    }
}

/// One payment in a payroll batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayrollItem {
    pub payee_type: PayeeType,
    pub payee_ref_id: Uuid,
    pub amount: Money,
    pub purpose: PaymentPurpose,
    pub metadata: serde_json::Value,
}

/// A batch of payments to commit and later execute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayrollBatch {
    pub batch_id: Uuid,
    pub tenant_id: TenantId,
    pub legal_entity_id: LegalEntityId,
    pub pay_period_id: Uuid,
    pub items: Vec<PayrollItem>,
    pub effective_date: NaiveDate,
    pub idempotency_key: String,
}

impl PayrollBatch {
    fn total_amount(&self) -> Money {
        self.items.iter().map(|item| item.amount).sum()
    }

    fn funding_requirement(&self) -> FundingRequirement {
        requirement_for_items(&self.items)
    }
}

fn requirement_for_items(items: &[PayrollItem]) -> FundingRequirement {
    let mut requirement = FundingRequirement::default();
    for item in items {
        match item.purpose {
            PaymentPurpose::EmployeeNet => requirement.net_pay += item.amount,
            PaymentPurpose::TaxRemit => requirement.taxes += item.amount,
            PaymentPurpose::ThirdParty => requirement.third_party += item.amount,
            PaymentPurpose::FundingDebit => {}
        }
    }
    requirement
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitStatus {
    Approved,
    BlockedPolicy,
    BlockedFunds,
    Partial,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitResult {
    pub status: CommitStatus,
    pub batch_id: Uuid,
    pub reservation_id: Option<ReservationId>,
    pub total_amount: Money,
    pub approved_count: usize,
    pub blocked_count: usize,
    pub block_reason: Option<String>,
    pub warnings: Vec<GateReason>,
    pub correlation_id: CorrelationId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecuteStatus {
    Success,
    Partial,
    Failed,
    Blocked,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionFailure {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payee_ref_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<Money>,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteResult {
    pub status: ExecuteStatus,
    pub batch_id: Uuid,
    pub submitted_count: usize,
    pub failed_count: usize,
    pub failures: Vec<ExecutionFailure>,
    pub correlation_id: CorrelationId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutePaymentsRequest {
    pub tenant_id: TenantId,
    pub legal_entity_id: LegalEntityId,
    pub batch_id: Uuid,
    pub items: Vec<PayrollItem>,
    pub reservation_id: Option<ReservationId>,
    pub rail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    Success,
    Partial,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestResult {
    pub status: IngestStatus,
    pub records_processed: usize,
    pub records_matched: usize,
    pub records_created: usize,
    pub records_failed: usize,
    pub unmatched_trace_ids: Vec<String>,
    pub correlation_id: CorrelationId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackStatus {
    Processed,
    Duplicate,
    Invalid,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackResult {
    pub status: CallbackStatus,
    pub payment_instruction_id: Option<InstructionId>,
    pub previous_status: Option<InstructionStatus>,
    pub new_status: Option<InstructionStatus>,
    pub correlation_id: CorrelationId,
}

/// The single blessed path through the PSP core.
///
/// The facade wires the components together in the right order, mints one
/// correlation id per operation, and keeps every write idempotent so callers
/// can retry any operation wholesale.
pub struct Psp {
    config: PspConfig,
    ledger: Arc<dyn LedgerService>,
    projections: Arc<InMemoryPayRunProjections>,
    gate: Arc<FundingGateService>,
    instructions: Arc<dyn InstructionStore>,
    settlements: Arc<dyn SettlementStore>,
    liability: Arc<LiabilityService>,
    emitter: Arc<EventEmitter>,
    providers: RwLock<HashMap<String, Arc<dyn PaymentRailProvider>>>,
    telemetry: PspTelemetry,
}

impl Psp {
    /// A fully wired in-memory core. Storage-backed deployments swap the
    /// stores via [`Psp::with_components`].
    pub fn new(config: PspConfig) -> Self {
        let ledger: Arc<dyn LedgerService> = Arc::new(InMemoryLedgerService::new());
        let projections = Arc::new(InMemoryPayRunProjections::new());
        let instructions: Arc<dyn InstructionStore> = Arc::new(InMemoryInstructionStore::new());
        let settlements: Arc<dyn SettlementStore> = Arc::new(InMemorySettlementStore::new());
        let event_store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
        Self::with_components(
            config,
            ledger,
            projections,
            instructions,
            settlements,
            Arc::new(LiabilityService::default()),
            event_store,
        )
    }

    pub fn with_components(
        config: PspConfig,
        ledger: Arc<dyn LedgerService>,
        projections: Arc<InMemoryPayRunProjections>,
        instructions: Arc<dyn InstructionStore>,
        settlements: Arc<dyn SettlementStore>,
        liability: Arc<LiabilityService>,
        event_store: Arc<dyn EventStore>,
    ) -> Self {
        let gate = Arc::new(FundingGateService::new(
            ledger.clone(),
            projections.clone(),
        ));
        Self {
            config,
            ledger,
            projections,
            gate,
            instructions,
            settlements,
            liability,
            emitter: Arc::new(EventEmitter::new(event_store)),
            providers: RwLock::new(HashMap::new()),
            telemetry: PspTelemetry::new(),
        }
    }

    pub fn config(&self) -> &PspConfig {
        &self.config
    }

    pub fn ledger(&self) -> Arc<dyn LedgerService> {
        self.ledger.clone()
    }

    pub fn projections(&self) -> Arc<InMemoryPayRunProjections> {
        self.projections.clone()
    }

    pub fn instructions(&self) -> Arc<dyn InstructionStore> {
        self.instructions.clone()
    }

    pub fn settlements(&self) -> Arc<dyn SettlementStore> {
        self.settlements.clone()
    }

    pub fn liability(&self) -> Arc<LiabilityService> {
        self.liability.clone()
    }

    pub fn events(&self) -> Arc<dyn EventStore> {
        self.emitter.store()
    }

    pub fn emitter(&self) -> Arc<EventEmitter> {
        self.emitter.clone()
    }

    pub fn telemetry(&self) -> PspTelemetry {
        self.telemetry.clone()
    }

    pub async fn register_provider(&self, name: &str, provider: Arc<dyn PaymentRailProvider>) {
        let mut providers = self.providers.write().await;
        providers.insert(name.to_string(), provider);
    }

    async fn provider(&self, name: &str) -> Option<Arc<dyn PaymentRailProvider>> {
        let providers = self.providers.read().await;
        providers.get(name).cloned()
    }

    async fn emit<P: EventPayload>(
        &self,
        tenant_id: TenantId,
        correlation_id: CorrelationId,
        payload: &P,
    ) -> PspResult<()> {
        if !self.config.emit_events {
            return Ok(());
        }
        let event = DomainEvent::new(tenant_id, correlation_id, payload)?;
        self.emitter.emit(event).await?;
        Ok(())
    }

    /// Step 1 of a payroll cycle: evaluate the commit gate and reserve the
    /// batch total. The batch is not paid yet; funds are only held.
    pub async fn commit_payroll_batch(&self, batch: &PayrollBatch) -> PspResult<CommitResult> {
        let correlation_id = Uuid::new_v4();
        let total_amount = batch.total_amount();
        if batch.items.is_empty() || !total_amount.is_positive() {
            return Err(PspError::Validation(
                "payroll batch must contain at least one positive-amount item".into(),
            ));
        }

        self.emit(
            batch.tenant_id,
            correlation_id,
            &FundingRequested {
                funding_request_id: batch.batch_id,
                legal_entity_id: batch.legal_entity_id,
                pay_period_id: batch.pay_period_id,
                requested_amount: total_amount,
                currency: "USD".into(),
                requested_date: batch.effective_date,
            },
        )
        .await?;

        // Materialize the batch's aggregates where the gate reads pay-run
        // projections; the batch id doubles as the pay-run key.
        self.projections
            .set_funding_requirement(
                batch.tenant_id,
                batch.batch_id,
                batch.funding_requirement(),
            )
            .await;

        let evaluation = self
            .gate
            .evaluate_commit(
                batch.tenant_id,
                batch.legal_entity_id,
                batch.batch_id,
                FundingModel::PrefundAll,
                &format!("commit_gate:{}", batch.idempotency_key),
                self.config.commit_gate_strict,
            )
            .await?;

        if evaluation.blocked() {
            let insufficient = evaluation
                .reasons
                .iter()
                .find(|reason| reason.code == REASON_INSUFFICIENT_FUNDS);
            let block_reason = evaluation
                .reasons
                .first()
                .map(|reason| reason.message.clone());

            if let Some(reason) = insufficient {
                self.emit(
                    batch.tenant_id,
                    correlation_id,
                    &FundingInsufficientFunds {
                        funding_request_id: batch.batch_id,
                        legal_entity_id: batch.legal_entity_id,
                        requested_amount: total_amount,
                        available_balance: evaluation.available,
                        shortfall: reason.shortfall.unwrap_or_else(|| evaluation.shortfall()),
                        gate_evaluation_id: evaluation.evaluation_id,
                    },
                )
                .await?;
            } else {
                self.emit(
                    batch.tenant_id,
                    correlation_id,
                    &FundingBlocked {
                        funding_request_id: batch.batch_id,
                        legal_entity_id: batch.legal_entity_id,
                        requested_amount: total_amount,
                        available_balance: evaluation.available,
                        block_reason: block_reason.clone().unwrap_or_default(),
                        policy_violated: evaluation
                            .reasons
                            .first()
                            .map(|reason| reason.code.clone()),
                        gate_evaluation_id: evaluation.evaluation_id,
                    },
                )
                .await?;
            }

            self.telemetry.record_batch_blocked();
            let status = if insufficient.is_some() {
                CommitStatus::BlockedFunds
            } else {
                CommitStatus::BlockedPolicy
            };
            info!(
                batch_id = %batch.batch_id,
                ?status,
                "payroll batch blocked at commit gate"
            );
            return Ok(CommitResult {
                status,
                batch_id: batch.batch_id,
                reservation_id: None,
                total_amount,
                approved_count: 0,
                blocked_count: batch.items.len(),
                block_reason,
                warnings: evaluation.warnings(),
                correlation_id,
            });
        }

        let reservation_id = self
            .ledger
            .create_reservation(CreateReservationRequest {
                tenant_id: batch.tenant_id,
                legal_entity_id: batch.legal_entity_id,
                reserve_type: ReserveType::NetPay,
                amount: total_amount,
                currency: "USD".into(),
                source_type: "payroll_batch".into(),
                source_id: batch.batch_id,
                correlation_id: Some(correlation_id),
            })
            .await?;

        let funding_account = self
            .ledger
            .get_or_create_account(
                batch.tenant_id,
                batch.legal_entity_id,
                LedgerAccountType::ClientFundingClearing,
                "USD",
            )
            .await?;
        let balance = self
            .ledger
            .get_balance(batch.tenant_id, funding_account)
            .await?;
        self.emit(
            batch.tenant_id,
            correlation_id,
            &FundingApproved {
                funding_request_id: batch.batch_id,
                legal_entity_id: batch.legal_entity_id,
                approved_amount: total_amount,
                available_balance: balance.available,
                gate_evaluation_id: evaluation.evaluation_id,
            },
        )
        .await?;

        self.telemetry.record_batch_committed();
        info!(
            batch_id = %batch.batch_id,
            total = %total_amount,
            reservation_id = %reservation_id,
            "payroll batch committed"
        );
        Ok(CommitResult {
            status: CommitStatus::Approved,
            batch_id: batch.batch_id,
            reservation_id: Some(reservation_id),
            total_amount,
            approved_count: batch.items.len(),
            blocked_count: 0,
            block_reason: None,
            warnings: evaluation.warnings(),
            correlation_id,
        })
    }

    /// Step 2: run the pay gate, then create and submit one instruction per
    /// item. The reservation is consumed only when every item goes out.
    pub async fn execute_payments(
        &self,
        request: ExecutePaymentsRequest,
    ) -> PspResult<ExecuteResult> {
        let correlation_id = Uuid::new_v4();
        let rail_name = request
            .rail
            .clone()
            .unwrap_or_else(|| self.config.default_rail.clone());

        let Some(provider) = self.provider(&rail_name).await else {
            return Ok(ExecuteResult {
                status: ExecuteStatus::Failed,
                batch_id: request.batch_id,
                submitted_count: 0,
                failed_count: request.items.len(),
                failures: vec![ExecutionFailure {
                    payee_ref_id: None,
                    amount: None,
                    error: format!("no provider registered for rail: {rail_name}"),
                }],
                correlation_id,
            });
        };

        if self.config.pay_gate_always_enforced {
            self.projections
                .set_funding_requirement(
                    request.tenant_id,
                    request.batch_id,
                    requirement_for_items(&request.items),
                )
                .await;
            let evaluation = self
                .gate
                .evaluate_pay(
                    request.tenant_id,
                    request.legal_entity_id,
                    request.batch_id,
                    &format!("pay_gate:{}", request.batch_id),
                )
                .await?;
            if !evaluation.passed() {
                info!(batch_id = %request.batch_id, "pay gate blocked execution");
                return Ok(ExecuteResult {
                    status: ExecuteStatus::Blocked,
                    batch_id: request.batch_id,
                    submitted_count: 0,
                    failed_count: request.items.len(),
                    failures: evaluation
                        .reasons
                        .iter()
                        .map(|reason| ExecutionFailure {
                            payee_ref_id: None,
                            amount: None,
                            error: reason.message.clone(),
                        })
                        .collect(),
                    correlation_id,
                });
            }
        }

        let orchestrator = PaymentOrchestrator::new(
            self.instructions.clone(),
            self.ledger.clone(),
            provider.clone(),
        );

        let mut submitted_count = 0;
        let mut failed_count = 0;
        let mut failures = Vec::new();

        for item in &request.items {
            let idempotency_key = format!(
                "{}:{}:{}",
                request.batch_id, item.payee_ref_id, item.purpose
            );
            let created = orchestrator
                .create_instruction(CreateInstructionRequest {
                    tenant_id: request.tenant_id,
                    legal_entity_id: request.legal_entity_id,
                    purpose: item.purpose,
                    direction: Direction::Outbound,
                    amount: item.amount,
                    currency: "USD".into(),
                    payee_type: item.payee_type,
                    payee_ref_id: item.payee_ref_id,
                    requested_settlement_date: None,
                    idempotency_key,
                    source_type: "payroll_batch".into(),
                    source_id: request.batch_id,
                    metadata: item.metadata.clone(),
                })
                .await?;

            if !created.was_duplicate {
                self.emit(
                    request.tenant_id,
                    correlation_id,
                    &PaymentInstructionCreated {
                        payment_instruction_id: created.instruction_id,
                        legal_entity_id: request.legal_entity_id,
                        purpose: item.purpose.as_str().into(),
                        direction: Direction::Outbound.as_str().into(),
                        amount: item.amount,
                        currency: "USD".into(),
                        payee_type: item.payee_type.as_str().into(),
                        payee_ref_id: item.payee_ref_id,
                        source_type: "payroll_batch".into(),
                        source_id: request.batch_id,
                    },
                )
                .await?;
            }

            // A duplicate that already moved past the submittable states was
            // handled by an earlier run of this same batch.
            if created.was_duplicate
                && !matches!(
                    created.status,
                    InstructionStatus::Created | InstructionStatus::Queued
                )
            {
                if created.status == InstructionStatus::Failed {
                    failed_count += 1;
                    failures.push(ExecutionFailure {
                        payee_ref_id: Some(item.payee_ref_id),
                        amount: Some(item.amount),
                        error: "instruction previously failed".into(),
                    });
                } else {
                    submitted_count += 1;
                }
                continue;
            }

            let submission = orchestrator
                .submit(request.tenant_id, created.instruction_id)
                .await?;

            if submission.accepted {
                submitted_count += 1;
                self.telemetry.record_payment_submitted();
                self.emit(
                    request.tenant_id,
                    correlation_id,
                    &PaymentSubmitted {
                        payment_instruction_id: created.instruction_id,
                        payment_attempt_id: submission.attempt_id,
                        rail: provider
                            .capabilities()
                            .preferred_rail(Direction::Outbound)
                            .as_str()
                            .into(),
                        provider: provider.name().into(),
                        provider_request_id: submission
                            .provider_request_id
                            .clone()
                            .unwrap_or_default(),
                    },
                )
                .await?;
            } else {
                failed_count += 1;
                self.telemetry.record_payment_failed();
                failures.push(ExecutionFailure {
                    payee_ref_id: Some(item.payee_ref_id),
                    amount: Some(item.amount),
                    error: submission.message.clone(),
                });
                self.emit(
                    request.tenant_id,
                    correlation_id,
                    &PaymentFailed {
                        payment_instruction_id: created.instruction_id,
                        provider: provider.name().into(),
                        failure_reason: submission.message,
                        failure_code: None,
                        error_origin: "provider".into(),
                    },
                )
                .await?;
            }
        }

        if let Some(reservation_id) = request.reservation_id
            && failed_count == 0
        {
            self.ledger
                .release_reservation(request.tenant_id, reservation_id, true)
                .await?;
        }

        let status = if failed_count == 0 {
            ExecuteStatus::Success
        } else if submitted_count == 0 {
            ExecuteStatus::Failed
        } else {
            ExecuteStatus::Partial
        };
        info!(
            batch_id = %request.batch_id,
            submitted = submitted_count,
            failed = failed_count,
            "payment execution finished"
        );
        Ok(ExecuteResult {
            status,
            batch_id: request.batch_id,
            submitted_count,
            failed_count,
            failures,
            correlation_id,
        })
    }

    /// Step 3: ingest a settlement feed and reconcile it against
    /// instructions and the ledger.
    pub async fn ingest_settlement_feed(
        &self,
        tenant_id: TenantId,
        bank_account_id: Uuid,
        provider_name: &str,
        records: Vec<SettlementRecord>,
    ) -> PspResult<IngestResult> {
        let correlation_id = Uuid::new_v4();
        let reconciliation_date = Utc::now().date_naive();

        let Some(provider) = self.provider(provider_name).await else {
            return Ok(IngestResult {
                status: IngestStatus::Failed,
                records_processed: 0,
                records_matched: 0,
                records_created: 0,
                records_failed: 0,
                unmatched_trace_ids: Vec::new(),
                correlation_id,
            });
        };

        self.emit(
            tenant_id,
            correlation_id,
            &ReconciliationStarted {
                reconciliation_id: correlation_id,
                reconciliation_date,
                bank_account_id,
                provider: provider_name.into(),
            },
        )
        .await?;

        for record in &records {
            self.emit(
                tenant_id,
                correlation_id,
                &SettlementReceived {
                    bank_account_id,
                    rail: provider.capabilities().feed_rail().as_str().into(),
                    amount: record.amount,
                    currency: record.currency.clone(),
                    external_trace_id: record.external_trace_id.clone(),
                    effective_date: record.effective_date,
                    status: record.status.as_str().into(),
                },
            )
            .await?;
        }

        let reconciler = ReconciliationService::new(
            self.settlements.clone(),
            self.ledger.clone(),
            self.instructions.clone(),
            provider.clone(),
            bank_account_id,
        );
        let outcome = reconciler
            .process_records(reconciliation_date, &records, Some(tenant_id))
            .await;

        // Returned records carry a liability decision with them.
        for record in &records {
            if !matches!(
                record.status,
                psp_rails::SettlementStatus::Returned | psp_rails::SettlementStatus::Reversed
            ) {
                continue;
            }
            let Some(instruction) = self
                .instructions
                .instruction_for_provider_request_id(&record.external_trace_id)
                .await?
                .filter(|instruction| instruction.tenant_id == tenant_id)
            else {
                continue;
            };
            let return_code = record
                .raw_payload
                .get("return_code")
                .and_then(|v| v.as_str())
                .unwrap_or("UNKNOWN");
            let return_reason = record
                .raw_payload
                .get("return_reason")
                .and_then(|v| v.as_str())
                .unwrap_or("Unknown");

            let classification = self.liability.classify_return(
                provider.capabilities().feed_rail().as_str(),
                return_code,
                record.amount,
                None,
            );
            let liability_event_id = self
                .liability
                .record_liability_event(RecordLiabilityRequest {
                    tenant_id,
                    legal_entity_id: instruction.legal_entity_id,
                    source_type: "payment_instruction".into(),
                    source_id: instruction.id,
                    classification: classification.clone(),
                    evidence: record.raw_payload.clone(),
                    idempotency_key: Some(format!(
                        "return:{}:{return_code}",
                        record.external_trace_id
                    )),
                })
                .await?;

            self.emit(
                tenant_id,
                correlation_id,
                &PaymentReturned {
                    payment_instruction_id: instruction.id,
                    settlement_event_id: None,
                    amount: record.amount,
                    return_code: return_code.into(),
                    return_reason: return_reason.into(),
                    return_date: record.effective_date,
                    liability_party: classification.liability_party.to_string(),
                },
            )
            .await?;
            self.emit(
                tenant_id,
                correlation_id,
                &LiabilityClassified {
                    liability_event_id: Some(liability_event_id),
                    payment_instruction_id: Some(instruction.id),
                    error_origin: classification.error_origin.as_str().into(),
                    liability_party: classification.liability_party.as_str().into(),
                    recovery_path: classification.recovery_path.as_str().into(),
                    amount: record.amount,
                    return_code: Some(return_code.into()),
                    classification_reason: classification.determination_reason,
                },
            )
            .await?;
            self.telemetry.record_payment_returned();
        }

        self.emit(
            tenant_id,
            correlation_id,
            &ReconciliationCompleted {
                reconciliation_id: correlation_id,
                reconciliation_date,
                records_processed: outcome.records_processed,
                records_matched: outcome.records_matched,
                records_created: outcome.records_created,
                records_failed: outcome.records_failed,
                unmatched_count: outcome.unmatched_trace_ids.len(),
            },
        )
        .await?;

        self.telemetry.record_settlements(
            outcome.records_processed,
            outcome.records_processed
                - outcome.records_failed
                - outcome.unmatched_trace_ids.len(),
        );

        let status = if outcome.records_failed == 0 && outcome.unmatched_trace_ids.is_empty() {
            IngestStatus::Success
        } else if outcome.records_processed > outcome.records_failed {
            IngestStatus::Partial
        } else {
            IngestStatus::Failed
        };
        Ok(IngestResult {
            status,
            records_processed: outcome.records_processed,
            records_matched: outcome.records_matched,
            records_created: outcome.records_created,
            records_failed: outcome.records_failed,
            unmatched_trace_ids: outcome.unmatched_trace_ids,
            correlation_id,
        })
    }

    /// Step 4: apply an asynchronous status update from a provider,
    /// idempotently. Replays come back as `Duplicate` with no writes.
    pub async fn handle_provider_callback(
        &self,
        tenant_id: TenantId,
        provider_name: &str,
        callback_type: &str,
        payload: &serde_json::Value,
    ) -> PspResult<CallbackResult> {
        let correlation_id = Uuid::new_v4();

        let invalid = CallbackResult {
            status: CallbackStatus::Invalid,
            payment_instruction_id: None,
            previous_status: None,
            new_status: None,
            correlation_id,
        };

        let Some(provider) = self.provider(provider_name).await else {
            return Ok(invalid);
        };
        let Some(provider_request_id) =
            payload.get("provider_request_id").and_then(|v| v.as_str())
        else {
            return Ok(invalid);
        };

        let Some(instruction) = self
            .instructions
            .instruction_for_provider_request_id(provider_request_id)
            .await?
            .filter(|instruction| instruction.tenant_id == tenant_id)
        else {
            return Ok(CallbackResult {
                status: CallbackStatus::Unknown,
                payment_instruction_id: None,
                previous_status: None,
                new_status: None,
                correlation_id,
            });
        };

        let status_field = payload.get("status").and_then(|v| v.as_str());
        let Some(new_status) = parse_callback_status(callback_type, status_field) else {
            return Ok(invalid);
        };

        let previous_status = instruction.status;
        if previous_status == new_status {
            self.telemetry.record_callback_deduplicated();
            return Ok(CallbackResult {
                status: CallbackStatus::Duplicate,
                payment_instruction_id: Some(instruction.id),
                previous_status: Some(previous_status),
                new_status: Some(new_status),
                correlation_id,
            });
        }
        if !previous_status.can_transition_to(new_status) {
            return Ok(CallbackResult {
                status: CallbackStatus::Invalid,
                payment_instruction_id: Some(instruction.id),
                previous_status: Some(previous_status),
                new_status: Some(new_status),
                correlation_id,
            });
        }

        let amount = payload
            .get("amount")
            .and_then(|v| v.as_str())
            .and_then(|raw| raw.parse::<Money>().ok())
            .unwrap_or(instruction.amount);

        if new_status == InstructionStatus::Reversed {
            let return_code = payload
                .get("return_code")
                .and_then(|v| v.as_str())
                .unwrap_or("UNKNOWN");
            let return_reason = payload
                .get("return_reason")
                .and_then(|v| v.as_str())
                .unwrap_or("Unknown");
            let repeat_failure_count = payload
                .get("repeat_failure_count")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as u32;
            let context = ClassificationContext {
                repeat_failure_count,
                ..ClassificationContext::default()
            };

            let rail = provider.capabilities().feed_rail();
            let classification = self.liability.classify_return(
                rail.as_str(),
                return_code,
                amount,
                Some(&context),
            );
            let liability_event_id = self
                .liability
                .record_liability_event(RecordLiabilityRequest {
                    tenant_id,
                    legal_entity_id: instruction.legal_entity_id,
                    source_type: "payment_instruction".into(),
                    source_id: instruction.id,
                    classification: classification.clone(),
                    evidence: payload.clone(),
                    idempotency_key: Some(format!(
                        "return:{provider_request_id}:{return_code}"
                    )),
                })
                .await?;

            self.emit(
                tenant_id,
                correlation_id,
                &PaymentReturned {
                    payment_instruction_id: instruction.id,
                    settlement_event_id: None,
                    amount,
                    return_code: return_code.into(),
                    return_reason: return_reason.into(),
                    return_date: Utc::now().date_naive(),
                    liability_party: classification.liability_party.to_string(),
                },
            )
            .await?;
            self.emit(
                tenant_id,
                correlation_id,
                &LiabilityClassified {
                    liability_event_id: Some(liability_event_id),
                    payment_instruction_id: Some(instruction.id),
                    error_origin: classification.error_origin.as_str().into(),
                    liability_party: classification.liability_party.as_str().into(),
                    recovery_path: classification.recovery_path.as_str().into(),
                    amount,
                    return_code: Some(return_code.into()),
                    classification_reason: classification.determination_reason,
                },
            )
            .await?;
            self.telemetry.record_payment_returned();
        } else if new_status == InstructionStatus::Settled {
            self.emit(
                tenant_id,
                correlation_id,
                &PaymentSettled {
                    payment_instruction_id: instruction.id,
                    settlement_event_id: None,
                    amount,
                    currency: instruction.currency.clone(),
                    effective_date: Utc::now().date_naive(),
                    external_trace_id: provider_request_id.into(),
                },
            )
            .await?;
        }

        let orchestrator = PaymentOrchestrator::new(
            self.instructions.clone(),
            self.ledger.clone(),
            provider,
        );
        orchestrator
            .update_status(tenant_id, instruction.id, new_status)
            .await?;

        self.telemetry.record_callback_processed();
        info!(
            instruction_id = %instruction.id,
            from = %previous_status,
            to = %new_status,
            "provider callback applied"
        );
        Ok(CallbackResult {
            status: CallbackStatus::Processed,
            payment_instruction_id: Some(instruction.id),
            previous_status: Some(previous_status),
            new_status: Some(new_status),
            correlation_id,
        })
    }
}

fn parse_callback_status(
    callback_type: &str,
    status_field: Option<&str>,
) -> Option<InstructionStatus> {
    let raw = match status_field {
        Some(raw) => raw,
        None => match callback_type {
            "return" => "returned",
            "settlement" => "settled",
            _ => return None,
        },
    };
    match raw {
        "created" => Some(InstructionStatus::Created),
        "queued" => Some(InstructionStatus::Queued),
        "submitted" => Some(InstructionStatus::Submitted),
        "accepted" => Some(InstructionStatus::Accepted),
        "settled" => Some(InstructionStatus::Settled),
        "failed" => Some(InstructionStatus::Failed),
        "returned" | "reversed" => Some(InstructionStatus::Reversed),
        _ => None,
    }
}
