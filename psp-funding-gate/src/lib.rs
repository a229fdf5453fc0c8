#![deny(clippy::print_stdout, clippy::print_stderr)]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use psp_ledger::LedgerAccountType;
use psp_ledger::LedgerService;
use psp_ledger::LegalEntityId;
use psp_ledger::Money;
use psp_ledger::TenantId;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

pub type PayRunId = Uuid;
pub type EvaluationId = Uuid;

pub type GateResult<T> = Result<T, GateError>;

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("storage failure: {0}")]
    Storage(String),
    #[error(transparent)]
    Ledger(#[from] psp_ledger::LedgerError),
}

pub const REASON_INSUFFICIENT_FUNDS: &str = "INSUFFICIENT_FUNDS";
pub const REASON_INSUFFICIENT_FUNDS_FOR_PAY: &str = "INSUFFICIENT_FUNDS_FOR_PAY";
pub const REASON_SPIKE_DETECTED: &str = "SPIKE_DETECTED";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FundingModel {
    PrefundAll,
    NetAndThirdParty,
    NetOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateKind {
    Commit,
    Pay,
}

impl GateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateKind::Commit => "commit_gate",
            GateKind::Pay => "pay_gate",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateOutcome {
    Pass,
    SoftFail,
    HardFail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonSeverity {
    Blocking,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateReason {
    pub code: String,
    pub message: String,
    pub severity: ReasonSeverity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shortfall: Option<Money>,
}

impl GateReason {
    fn insufficient_funds(code: &str, required: Money, available: Money) -> Self {
        let message = if code == REASON_INSUFFICIENT_FUNDS_FOR_PAY {
            format!("Cannot disburse. Required {required} USD, available {available} USD.")
        } else {
            format!("Funding not received. Required {required} USD, available {available} USD.")
        };
        Self {
            code: code.to_string(),
            message,
            severity: ReasonSeverity::Blocking,
            shortfall: Some(required - available),
        }
    }

    fn spike_detected(current_net: Money, trailing_average: Money) -> Self {
        Self {
            code: REASON_SPIKE_DETECTED.to_string(),
            message: format!(
                "Payroll amount {current_net} is 50%+ above recent average {trailing_average}."
            ),
            severity: ReasonSeverity::Warning,
            shortfall: None,
        }
    }
}

/// Funding requirements aggregated from a pay run's statements.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FundingRequirement {
    pub net_pay: Money,
    pub taxes: Money,
    pub third_party: Money,
    pub fees: Money,
}

impl FundingRequirement {
    pub fn total(&self) -> Money {
        self.net_pay + self.taxes + self.third_party + self.fees
    }

    /// Narrows the requirement to what the funding model actually prefunds.
    pub fn apply_model(mut self, model: FundingModel) -> Self {
        match model {
            FundingModel::PrefundAll => {}
            FundingModel::NetAndThirdParty => {
                self.taxes = Money::zero();
            }
            FundingModel::NetOnly => {
                self.taxes = Money::zero();
                self.third_party = Money::zero();
            }
        }
        self
    }
}

/// Read side of the wage-computation collaborator: aggregable projections of
/// pay-run amounts and the trailing history used for spike detection.
#[async_trait]
pub trait PayRunProjections: Send + Sync {
    async fn funding_requirement(
        &self,
        tenant_id: TenantId,
        pay_run_id: PayRunId,
    ) -> GateResult<FundingRequirement>;

    /// Net totals of the most recent paid runs, newest first, at most
    /// `window` entries.
    async fn recent_paid_net(
        &self,
        tenant_id: TenantId,
        legal_entity_id: LegalEntityId,
        window: usize,
    ) -> GateResult<Vec<Money>>;
}

#[derive(Default)]
pub struct InMemoryPayRunProjections {
    state: RwLock<ProjectionState>,
}

#[derive(Default)]
struct ProjectionState {
    requirements: HashMap<(TenantId, PayRunId), FundingRequirement>,
    paid_net: HashMap<(TenantId, LegalEntityId), Vec<Money>>,
}

impl InMemoryPayRunProjections {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_funding_requirement(
        &self,
        tenant_id: TenantId,
        pay_run_id: PayRunId,
        requirement: FundingRequirement,
    ) {
        let mut state = self.state.write().await;
        state.requirements.insert((tenant_id, pay_run_id), requirement);
    }

    /// Records the net total of a run that reached `paid`.
    pub async fn record_paid_net(
        &self,
        tenant_id: TenantId,
        legal_entity_id: LegalEntityId,
        net: Money,
    ) {
        let mut state = self.state.write().await;
        state
            .paid_net
            .entry((tenant_id, legal_entity_id))
            .or_default()
            .push(net);
    }
}

#[async_trait]
impl PayRunProjections for InMemoryPayRunProjections {
    async fn funding_requirement(
        &self,
        tenant_id: TenantId,
        pay_run_id: PayRunId,
    ) -> GateResult<FundingRequirement> {
        let state = self.state.read().await;
        // An unknown run aggregates to zero, same as summing no statements.
        Ok(state
            .requirements
            .get(&(tenant_id, pay_run_id))
            .copied()
            .unwrap_or_default())
    }

    async fn recent_paid_net(
        &self,
        tenant_id: TenantId,
        legal_entity_id: LegalEntityId,
        window: usize,
    ) -> GateResult<Vec<Money>> {
        let state = self.state.read().await;
        Ok(state
            .paid_net
            .get(&(tenant_id, legal_entity_id))
            .map(|history| history.iter().rev().take(window).copied().collect())
            .unwrap_or_default())
    }
}

/// Spike detection knobs. The 150%-over-six-runs default mirrors long-standing
/// production behavior; both values are configuration, not constants.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpikePolicy {
    pub ratio: Decimal,
    pub window: usize,
}

impl Default for SpikePolicy {
    fn default() -> Self {
        Self {
            ratio: Decimal::new(15, 1),
            window: 6,
        }
    }
}

/// A persisted gate decision. The same idempotency key always maps to the
/// same evaluation, bit for bit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateEvaluation {
    pub evaluation_id: EvaluationId,
    pub gate: GateKind,
    pub outcome: GateOutcome,
    pub required: Money,
    pub available: Money,
    pub reasons: Vec<GateReason>,
}

impl GateEvaluation {
    pub fn passed(&self) -> bool {
        self.outcome == GateOutcome::Pass
    }

    pub fn blocked(&self) -> bool {
        self.outcome == GateOutcome::HardFail
    }

    pub fn shortfall(&self) -> Money {
        let diff = self.required - self.available;
        if diff.is_positive() { diff } else { Money::zero() }
    }

    pub fn warnings(&self) -> Vec<GateReason> {
        self.reasons
            .iter()
            .filter(|reason| reason.severity == ReasonSeverity::Warning)
            .cloned()
            .collect()
    }
}

pub struct FundingGateService {
    ledger: Arc<dyn LedgerService>,
    projections: Arc<dyn PayRunProjections>,
    spike_policy: SpikePolicy,
    evaluations: RwLock<HashMap<(TenantId, String), GateEvaluation>>,
}

impl FundingGateService {
    pub fn new(ledger: Arc<dyn LedgerService>, projections: Arc<dyn PayRunProjections>) -> Self {
        Self::with_spike_policy(ledger, projections, SpikePolicy::default())
    }

    pub fn with_spike_policy(
        ledger: Arc<dyn LedgerService>,
        projections: Arc<dyn PayRunProjections>,
        spike_policy: SpikePolicy,
    ) -> Self {
        Self {
            ledger,
            projections,
            spike_policy,
            evaluations: RwLock::new(HashMap::new()),
        }
    }

    /// Evaluates whether a pay run may be committed. Strict mode blocks on
    /// any reason; hybrid mode records the reasons and soft-fails instead.
    pub async fn evaluate_commit(
        &self,
        tenant_id: TenantId,
        legal_entity_id: LegalEntityId,
        pay_run_id: PayRunId,
        funding_model: FundingModel,
        idempotency_key: &str,
        strict: bool,
    ) -> GateResult<GateEvaluation> {
        if let Some(existing) = self.existing_evaluation(tenant_id, idempotency_key).await {
            return Ok(existing);
        }

        let requirement = self
            .projections
            .funding_requirement(tenant_id, pay_run_id)
            .await?
            .apply_model(funding_model);
        let required = requirement.total();
        let available = self.available_balance(tenant_id, legal_entity_id, false).await?;

        let mut reasons = Vec::new();
        if available < required {
            reasons.push(GateReason::insufficient_funds(
                REASON_INSUFFICIENT_FUNDS,
                required,
                available,
            ));
        }
        if let Some(spike) = self
            .check_spike(tenant_id, legal_entity_id, requirement.net_pay)
            .await?
        {
            reasons.push(spike);
        }

        let outcome = if reasons.is_empty() {
            GateOutcome::Pass
        } else if strict {
            GateOutcome::HardFail
        } else {
            GateOutcome::SoftFail
        };

        let evaluation = GateEvaluation {
            evaluation_id: Uuid::new_v4(),
            gate: GateKind::Commit,
            outcome,
            required,
            available,
            reasons,
        };
        Ok(self.persist(tenant_id, idempotency_key, evaluation).await)
    }

    /// Evaluates whether a pay run may disburse. Always strict, always
    /// against the full requirement, always net of active reservations.
    pub async fn evaluate_pay(
        &self,
        tenant_id: TenantId,
        legal_entity_id: LegalEntityId,
        pay_run_id: PayRunId,
        idempotency_key: &str,
    ) -> GateResult<GateEvaluation> {
        if let Some(existing) = self.existing_evaluation(tenant_id, idempotency_key).await {
            return Ok(existing);
        }

        let requirement = self
            .projections
            .funding_requirement(tenant_id, pay_run_id)
            .await?
            .apply_model(FundingModel::PrefundAll);
        let required = requirement.total();
        let available = self.available_balance(tenant_id, legal_entity_id, true).await?;

        let mut reasons = Vec::new();
        if available < required {
            reasons.push(GateReason::insufficient_funds(
                REASON_INSUFFICIENT_FUNDS_FOR_PAY,
                required,
                available,
            ));
        }

        let outcome = if reasons.is_empty() {
            GateOutcome::Pass
        } else {
            GateOutcome::HardFail
        };

        let evaluation = GateEvaluation {
            evaluation_id: Uuid::new_v4(),
            gate: GateKind::Pay,
            outcome,
            required,
            available,
            reasons,
        };
        Ok(self.persist(tenant_id, idempotency_key, evaluation).await)
    }

    async fn existing_evaluation(
        &self,
        tenant_id: TenantId,
        idempotency_key: &str,
    ) -> Option<GateEvaluation> {
        let evaluations = self.evaluations.read().await;
        evaluations
            .get(&(tenant_id, idempotency_key.to_string()))
            .cloned()
    }

    async fn persist(
        &self,
        tenant_id: TenantId,
        idempotency_key: &str,
        evaluation: GateEvaluation,
    ) -> GateEvaluation {
        let mut evaluations = self.evaluations.write().await;
        // Insert-if-absent: a concurrent evaluation with the same key wins
        // once and everyone sees that decision.
        evaluations
            .entry((tenant_id, idempotency_key.to_string()))
            .or_insert(evaluation)
            .clone()
    }

    async fn available_balance(
        &self,
        tenant_id: TenantId,
        legal_entity_id: LegalEntityId,
        net_of_reservations: bool,
    ) -> GateResult<Money> {
        let account_id = self
            .ledger
            .get_or_create_account(
                tenant_id,
                legal_entity_id,
                LedgerAccountType::ClientFundingClearing,
                "USD",
            )
            .await?;
        let balance = self.ledger.get_balance(tenant_id, account_id).await?;
        Ok(if net_of_reservations {
            balance.unreserved()
        } else {
            balance.available
        })
    }

    async fn check_spike(
        &self,
        tenant_id: TenantId,
        legal_entity_id: LegalEntityId,
        current_net: Money,
    ) -> GateResult<Option<GateReason>> {
        let history = self
            .projections
            .recent_paid_net(tenant_id, legal_entity_id, self.spike_policy.window)
            .await?;
        if history.is_empty() {
            return Ok(None);
        }

        let total: Money = history.iter().copied().sum();
        let Some(average) = total.divided_by(history.len() as u32) else {
            return Ok(None);
        };
        if average.is_positive() && current_net > average.scaled_by(self.spike_policy.ratio) {
            return Ok(Some(GateReason::spike_detected(current_net, average)));
        }
        Ok(None)
    }
}
