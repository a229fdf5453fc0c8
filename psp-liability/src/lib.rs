#![deny(clippy::print_stdout, clippy::print_stderr)]

use std::collections::HashMap;
use std::fmt::Display;

use chrono::DateTime;
use chrono::Utc;
use psp_ledger::LegalEntityId;
use psp_ledger::Money;
use psp_ledger::TenantId;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

pub type LiabilityEventId = Uuid;

pub type LiabilityResult<T> = Result<T, LiabilityError>;

#[derive(Debug, thiserror::Error)]
pub enum LiabilityError {
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("storage failure: {0}")]
    Storage(String),
}

/// Where a payment failure originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorOrigin {
    Client,
    PayrollEngine,
    Provider,
    Bank,
    Recipient,
}

impl ErrorOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorOrigin::Client => "client",
            ErrorOrigin::PayrollEngine => "payroll_engine",
            ErrorOrigin::Provider => "provider",
            ErrorOrigin::Bank => "bank",
            ErrorOrigin::Recipient => "recipient",
        }
    }
}

/// Who bears the financial responsibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiabilityParty {
    Employer,
    Psp,
    Processor,
    Shared,
    Pending,
}

impl LiabilityParty {
    pub fn as_str(&self) -> &'static str {
        match self {
            LiabilityParty::Employer => "employer",
            LiabilityParty::Psp => "psp",
            LiabilityParty::Processor => "processor",
            LiabilityParty::Shared => "shared",
            LiabilityParty::Pending => "pending",
        }
    }
}

impl Display for LiabilityParty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a loss will be recovered, if at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryPath {
    OffsetFuture,
    Clawback,
    WriteOff,
    Insurance,
    Dispute,
    None,
}

impl RecoveryPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryPath::OffsetFuture => "offset_future",
            RecoveryPath::Clawback => "clawback",
            RecoveryPath::WriteOff => "write_off",
            RecoveryPath::Insurance => "insurance",
            RecoveryPath::Dispute => "dispute",
            RecoveryPath::None => "none",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStatus {
    Pending,
    InProgress,
    Partial,
    Complete,
    Failed,
    WrittenOff,
}

impl RecoveryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RecoveryStatus::Complete | RecoveryStatus::Failed | RecoveryStatus::WrittenOff
        )
    }
}

/// Default attribution for a `(rail, return code)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReturnCodeReference {
    pub rail: String,
    pub code: String,
    pub error_origin: ErrorOrigin,
    pub liability_party: LiabilityParty,
    pub is_recoverable: bool,
    pub description: String,
}

/// Context that can override the table's default attribution.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ClassificationContext {
    pub repeat_failure_count: u32,
    pub our_data_error: bool,
    pub error_detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiabilityClassification {
    pub error_origin: ErrorOrigin,
    pub liability_party: LiabilityParty,
    pub recovery_path: RecoveryPath,
    pub loss_amount: Money,
    pub determination_reason: String,
    pub is_recoverable: bool,
    pub confidence: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiabilityEvent {
    pub id: LiabilityEventId,
    pub tenant_id: TenantId,
    pub legal_entity_id: LegalEntityId,
    pub source_type: String,
    pub source_id: Uuid,
    pub error_origin: ErrorOrigin,
    pub liability_party: LiabilityParty,
    pub loss_amount: Money,
    pub recovery_path: RecoveryPath,
    pub recovery_status: RecoveryStatus,
    pub recovery_amount: Money,
    pub determination_reason: String,
    pub evidence: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Reference table mapping return codes to default attributions.
#[derive(Debug, Clone, Default)]
pub struct ReturnCodeTable {
    rows: HashMap<(String, String), ReturnCodeReference>,
}

impl ReturnCodeTable {
    pub fn empty() -> Self {
        Self::default()
    }

    /// The standard ACH return codes the PSP handles day to day.
    pub fn standard() -> Self {
        let mut table = Self::default();
        let rows = [
            ("R01", ErrorOrigin::Recipient, LiabilityParty::Employer, true, "Insufficient funds"),
            ("R02", ErrorOrigin::Client, LiabilityParty::Employer, true, "Account closed"),
            ("R03", ErrorOrigin::Client, LiabilityParty::Employer, true, "No account / unable to locate account"),
            ("R04", ErrorOrigin::Client, LiabilityParty::Employer, true, "Invalid account number"),
            ("R08", ErrorOrigin::Recipient, LiabilityParty::Pending, false, "Payment stopped"),
            ("R10", ErrorOrigin::Recipient, LiabilityParty::Pending, false, "Customer advises not authorized"),
            ("R16", ErrorOrigin::Bank, LiabilityParty::Pending, false, "Account frozen"),
            ("R29", ErrorOrigin::Client, LiabilityParty::Employer, true, "Corporate customer advises not authorized"),
        ];
        for (code, error_origin, liability_party, is_recoverable, description) in rows {
            table.insert(ReturnCodeReference {
                rail: "ach".into(),
                code: code.into(),
                error_origin,
                liability_party,
                is_recoverable,
                description: description.into(),
            });
        }
        table
    }

    pub fn insert(&mut self, reference: ReturnCodeReference) {
        self.rows.insert(
            (reference.rail.clone(), reference.code.clone()),
            reference,
        );
    }

    pub fn lookup(&self, rail: &str, code: &str) -> Option<&ReturnCodeReference> {
        self.rows.get(&(rail.to_string(), code.to_string()))
    }

    /// Attribution is a pure function of its inputs: the same rail, code,
    /// amount and context always produce the same classification.
    pub fn classify(
        &self,
        rail: &str,
        return_code: &str,
        amount: Money,
        context: Option<&ClassificationContext>,
    ) -> LiabilityClassification {
        let (mut error_origin, mut liability_party, is_recoverable, mut reason) =
            match self.lookup(rail, return_code) {
                Some(reference) => (
                    reference.error_origin,
                    reference.liability_party,
                    reference.is_recoverable,
                    format!("Return code {return_code}: {}", reference.description),
                ),
                None => (
                    ErrorOrigin::Recipient,
                    LiabilityParty::Pending,
                    false,
                    format!("Unknown return code {return_code} - requires investigation"),
                ),
            };

        if let Some(context) = context {
            if context.repeat_failure_count >= 3 {
                liability_party = LiabilityParty::Employer;
                reason.push_str(" (repeated failures - employer must update payment info)");
            }
            if context.our_data_error {
                error_origin = ErrorOrigin::PayrollEngine;
                liability_party = LiabilityParty::Psp;
                reason = format!(
                    "PSP data handling error: {}",
                    context.error_detail.as_deref().unwrap_or_default()
                );
            }
        }

        let recovery_path = if liability_party == LiabilityParty::Employer && is_recoverable {
            RecoveryPath::OffsetFuture
        } else if liability_party == LiabilityParty::Psp {
            RecoveryPath::WriteOff
        } else if liability_party == LiabilityParty::Pending {
            RecoveryPath::Dispute
        } else {
            RecoveryPath::None
        };

        LiabilityClassification {
            error_origin,
            liability_party,
            recovery_path,
            loss_amount: amount,
            determination_reason: reason,
            is_recoverable,
            confidence: "high".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordLiabilityRequest {
    pub tenant_id: TenantId,
    pub legal_entity_id: LegalEntityId,
    pub source_type: String,
    pub source_id: Uuid,
    pub classification: LiabilityClassification,
    pub evidence: serde_json::Value,
    pub idempotency_key: Option<String>,
}

/// Totals of recorded losses, sliced by party and by recovery status.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LiabilitySummary {
    pub by_party: Vec<PartyTotals>,
    pub by_status: Vec<StatusTotals>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartyTotals {
    pub party: LiabilityParty,
    pub total_loss: Money,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusTotals {
    pub status: RecoveryStatus,
    pub total_loss: Money,
    pub total_recovered: Money,
    pub count: usize,
}

/// Records who eats each loss and tracks the recovery lifecycle.
pub struct LiabilityService {
    table: ReturnCodeTable,
    state: RwLock<State>,
}

#[derive(Default)]
struct State {
    events: HashMap<LiabilityEventId, LiabilityEvent>,
    index: HashMap<(TenantId, String), LiabilityEventId>,
}

impl Default for LiabilityService {
    fn default() -> Self {
        Self::new(ReturnCodeTable::standard())
    }
}

impl LiabilityService {
    pub fn new(table: ReturnCodeTable) -> Self {
        Self {
            table,
            state: RwLock::new(State::default()),
        }
    }

    pub fn classify_return(
        &self,
        rail: &str,
        return_code: &str,
        amount: Money,
        context: Option<&ClassificationContext>,
    ) -> LiabilityClassification {
        self.table.classify(rail, return_code, amount, context)
    }

    /// Persists a classification. Idempotent on `(tenant, idempotency_key)`
    /// when a key is supplied.
    pub async fn record_liability_event(
        &self,
        request: RecordLiabilityRequest,
    ) -> LiabilityResult<LiabilityEventId> {
        let mut state = self.state.write().await;

        if let Some(key) = &request.idempotency_key
            && let Some(existing) = state.index.get(&(request.tenant_id, key.clone()))
        {
            return Ok(*existing);
        }

        let event = LiabilityEvent {
            id: Uuid::new_v4(),
            tenant_id: request.tenant_id,
            legal_entity_id: request.legal_entity_id,
            source_type: request.source_type,
            source_id: request.source_id,
            error_origin: request.classification.error_origin,
            liability_party: request.classification.liability_party,
            loss_amount: request.classification.loss_amount,
            recovery_path: request.classification.recovery_path,
            recovery_status: RecoveryStatus::Pending,
            recovery_amount: Money::zero(),
            determination_reason: request.classification.determination_reason,
            evidence: request.evidence,
            created_at: Utc::now(),
            resolved_at: None,
        };
        let id = event.id;
        if let Some(key) = request.idempotency_key {
            state.index.insert((request.tenant_id, key), id);
        }
        state.events.insert(id, event);
        Ok(id)
    }

    /// Advances the recovery lifecycle. Terminal statuses stamp
    /// `resolved_at`. Returns `false` when the event is unknown.
    pub async fn update_recovery_status(
        &self,
        tenant_id: TenantId,
        liability_event_id: LiabilityEventId,
        new_status: RecoveryStatus,
        recovery_amount: Option<Money>,
    ) -> LiabilityResult<bool> {
        let mut state = self.state.write().await;
        let Some(event) = state
            .events
            .get_mut(&liability_event_id)
            .filter(|event| event.tenant_id == tenant_id)
        else {
            return Ok(false);
        };

        event.recovery_status = new_status;
        if let Some(amount) = recovery_amount {
            event.recovery_amount = amount;
        }
        if new_status.is_terminal() {
            event.resolved_at = Some(Utc::now());
        }
        Ok(true)
    }

    pub async fn get(
        &self,
        tenant_id: TenantId,
        liability_event_id: LiabilityEventId,
    ) -> LiabilityResult<LiabilityEvent> {
        let state = self.state.read().await;
        state
            .events
            .get(&liability_event_id)
            .filter(|event| event.tenant_id == tenant_id)
            .cloned()
            .ok_or_else(|| {
                LiabilityError::NotFound(format!("liability event {liability_event_id}"))
            })
    }

    /// Events still requiring attention, newest first.
    pub async fn pending_liabilities(
        &self,
        tenant_id: TenantId,
        legal_entity_id: Option<LegalEntityId>,
        limit: usize,
    ) -> LiabilityResult<Vec<LiabilityEvent>> {
        let state = self.state.read().await;
        let mut pending: Vec<LiabilityEvent> = state
            .events
            .values()
            .filter(|event| event.tenant_id == tenant_id)
            .filter(|event| legal_entity_id.is_none_or(|entity| event.legal_entity_id == entity))
            .filter(|event| !event.recovery_status.is_terminal())
            .cloned()
            .collect();
        pending.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        pending.truncate(limit);
        Ok(pending)
    }

    pub async fn summary(
        &self,
        tenant_id: TenantId,
        legal_entity_id: Option<LegalEntityId>,
    ) -> LiabilityResult<LiabilitySummary> {
        let state = self.state.read().await;
        let mut by_party: HashMap<LiabilityParty, (Money, usize)> = HashMap::new();
        let mut by_status: HashMap<RecoveryStatus, (Money, Money, usize)> = HashMap::new();

        for event in state.events.values() {
            if event.tenant_id != tenant_id {
                continue;
            }
            if let Some(entity) = legal_entity_id
                && event.legal_entity_id != entity
            {
                continue;
            }
            let party = by_party.entry(event.liability_party).or_default();
            party.0 += event.loss_amount;
            party.1 += 1;
            let status = by_status.entry(event.recovery_status).or_default();
            status.0 += event.loss_amount;
            status.1 += event.recovery_amount;
            status.2 += 1;
        }

        let mut by_party: Vec<PartyTotals> = by_party
            .into_iter()
            .map(|(party, (total_loss, count))| PartyTotals {
                party,
                total_loss,
                count,
            })
            .collect();
        by_party.sort_by_key(|totals| totals.party.as_str());

        let mut by_status: Vec<StatusTotals> = by_status
            .into_iter()
            .map(
                |(status, (total_loss, total_recovered, count))| StatusTotals {
                    status,
                    total_loss,
                    total_recovered,
                    count,
                },
            )
            .collect();
        by_status.sort_by_key(|totals| format!("{:?}", totals.status));

        Ok(LiabilitySummary {
            by_party,
            by_status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn money(input: &str) -> Money {
        input.parse().expect("money literal")
    }

    #[test]
    fn r01_classifies_as_recoverable_employer_liability() {
        let table = ReturnCodeTable::standard();
        let classification = table.classify("ach", "R01", money("5000"), None);

        assert_eq!(classification.error_origin, ErrorOrigin::Recipient);
        assert_eq!(classification.liability_party, LiabilityParty::Employer);
        assert_eq!(classification.recovery_path, RecoveryPath::OffsetFuture);
        assert!(classification.is_recoverable);
        assert_eq!(classification.loss_amount, money("5000"));
        assert!(classification.determination_reason.contains("R01"));
    }

    #[test]
    fn unknown_codes_default_to_pending_dispute() {
        let table = ReturnCodeTable::standard();
        let classification = table.classify("ach", "R99", money("100"), None);

        assert_eq!(classification.error_origin, ErrorOrigin::Recipient);
        assert_eq!(classification.liability_party, LiabilityParty::Pending);
        assert_eq!(classification.recovery_path, RecoveryPath::Dispute);
        assert!(!classification.is_recoverable);
        assert!(classification.determination_reason.contains("investigation"));
    }

    #[test]
    fn repeat_failures_escalate_to_the_employer() {
        let table = ReturnCodeTable::standard();
        let context = ClassificationContext {
            repeat_failure_count: 3,
            ..ClassificationContext::default()
        };
        let classification = table.classify("ach", "R10", money("100"), Some(&context));

        assert_eq!(classification.liability_party, LiabilityParty::Employer);
        assert!(classification.determination_reason.contains("repeated failures"));
        // R10 is not recoverable, so escalation does not grant an offset.
        assert_eq!(classification.recovery_path, RecoveryPath::None);
    }

    #[test]
    fn our_data_errors_are_psp_write_offs() {
        let table = ReturnCodeTable::standard();
        let context = ClassificationContext {
            our_data_error: true,
            error_detail: Some("mangled account token".into()),
            ..ClassificationContext::default()
        };
        let classification = table.classify("ach", "R01", money("100"), Some(&context));

        assert_eq!(classification.error_origin, ErrorOrigin::PayrollEngine);
        assert_eq!(classification.liability_party, LiabilityParty::Psp);
        assert_eq!(classification.recovery_path, RecoveryPath::WriteOff);
        assert!(
            classification
                .determination_reason
                .contains("mangled account token")
        );
    }

    #[test]
    fn classification_is_deterministic() {
        let table = ReturnCodeTable::standard();
        let first = table.classify("ach", "R02", money("250"), None);
        let second = table.classify("ach", "R02", money("250"), None);
        assert_eq!(first, second);
    }

    fn record_request(
        tenant_id: TenantId,
        classification: LiabilityClassification,
        key: Option<&str>,
    ) -> RecordLiabilityRequest {
        RecordLiabilityRequest {
            tenant_id,
            legal_entity_id: Uuid::new_v4(),
            source_type: "payment_instruction".into(),
            source_id: Uuid::new_v4(),
            classification,
            evidence: serde_json::json!({}),
            idempotency_key: key.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn recording_is_idempotent_on_the_key() {
        let service = LiabilityService::default();
        let tenant_id = Uuid::new_v4();
        let classification = service.classify_return("ach", "R01", money("5000"), None);

        let first = service
            .record_liability_event(record_request(
                tenant_id,
                classification.clone(),
                Some("return:req-1:R01"),
            ))
            .await
            .expect("record");
        let second = service
            .record_liability_event(record_request(
                tenant_id,
                classification,
                Some("return:req-1:R01"),
            ))
            .await
            .expect("record again");
        assert_eq!(first, second);

        let pending = service
            .pending_liabilities(tenant_id, None, 10)
            .await
            .expect("pending");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].recovery_status, RecoveryStatus::Pending);
        assert_eq!(pending[0].recovery_amount, Money::zero());
    }

    #[tokio::test]
    async fn terminal_recovery_statuses_stamp_resolved_at() {
        let service = LiabilityService::default();
        let tenant_id = Uuid::new_v4();
        let classification = service.classify_return("ach", "R01", money("5000"), None);
        let event_id = service
            .record_liability_event(record_request(tenant_id, classification, None))
            .await
            .expect("record");

        let updated = service
            .update_recovery_status(
                tenant_id,
                event_id,
                RecoveryStatus::InProgress,
                Some(money("1000")),
            )
            .await
            .expect("update");
        assert!(updated);
        let event = service.get(tenant_id, event_id).await.expect("event");
        assert_eq!(event.recovery_amount, money("1000"));
        assert!(event.resolved_at.is_none());

        service
            .update_recovery_status(
                tenant_id,
                event_id,
                RecoveryStatus::Complete,
                Some(money("5000")),
            )
            .await
            .expect("complete");
        let event = service.get(tenant_id, event_id).await.expect("event");
        assert_eq!(event.recovery_status, RecoveryStatus::Complete);
        assert!(event.resolved_at.is_some());

        // Resolved events drop out of the pending view.
        let pending = service
            .pending_liabilities(tenant_id, None, 10)
            .await
            .expect("pending");
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn updates_are_tenant_scoped() {
        let service = LiabilityService::default();
        let tenant_id = Uuid::new_v4();
        let classification = service.classify_return("ach", "R01", money("5000"), None);
        let event_id = service
            .record_liability_event(record_request(tenant_id, classification, None))
            .await
            .expect("record");

        let touched = service
            .update_recovery_status(Uuid::new_v4(), event_id, RecoveryStatus::Complete, None)
            .await
            .expect("cross-tenant update");
        assert!(!touched);
    }

    #[tokio::test]
    async fn summary_totals_by_party_and_status() {
        let service = LiabilityService::default();
        let tenant_id = Uuid::new_v4();
        let employer = service.classify_return("ach", "R01", money("5000"), None);
        let pending_party = service.classify_return("ach", "R10", money("300"), None);

        service
            .record_liability_event(record_request(tenant_id, employer.clone(), None))
            .await
            .expect("record");
        service
            .record_liability_event(record_request(tenant_id, employer, None))
            .await
            .expect("record");
        service
            .record_liability_event(record_request(tenant_id, pending_party, None))
            .await
            .expect("record");

        let summary = service.summary(tenant_id, None).await.expect("summary");
        let employer_totals = summary
            .by_party
            .iter()
            .find(|totals| totals.party == LiabilityParty::Employer)
            .expect("employer totals");
        assert_eq!(employer_totals.total_loss, money("10000"));
        assert_eq!(employer_totals.count, 2);

        let pending_totals = summary
            .by_status
            .iter()
            .find(|totals| totals.status == RecoveryStatus::Pending)
            .expect("pending totals");
        assert_eq!(pending_totals.count, 3);
        assert_eq!(pending_totals.total_loss, money("10300"));
    }
}
