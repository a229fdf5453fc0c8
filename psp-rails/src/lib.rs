#![deny(clippy::print_stdout, clippy::print_stderr)]

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::NaiveDate;
use psp_ledger::Money;
use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

pub type RailResult<T> = Result<T, RailError>;

#[derive(Debug, thiserror::Error)]
pub enum RailError {
    #[error("provider error: {0}")]
    Provider(String),
    #[error("validation error: {0}")]
    Validation(String),
}

/// A payment-network channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rail {
    Ach,
    Rtp,
    Fednow,
    Wire,
    Check,
    Internal,
}

impl Rail {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rail::Ach => "ach",
            Rail::Rtp => "rtp",
            Rail::Fednow => "fednow",
            Rail::Wire => "wire",
            Rail::Check => "check",
            Rail::Internal => "internal",
        }
    }
}

impl Display for Rail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

/// Capability flags advertised by a rail adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RailCapabilities {
    pub ach_credit: bool,
    pub ach_debit: bool,
    pub rtp: bool,
    pub fednow: bool,
    pub wire: bool,
    pub check: bool,
}

impl RailCapabilities {
    /// The rail a submission will ride, preferring the fastest capability the
    /// provider advertises: fednow, then rtp, then ach for the matching
    /// direction, then wire.
    pub fn preferred_rail(&self, direction: Direction) -> Rail {
        if self.fednow {
            return Rail::Fednow;
        }
        if self.rtp {
            return Rail::Rtp;
        }
        match direction {
            Direction::Inbound if self.ach_debit => return Rail::Ach,
            Direction::Outbound if self.ach_credit => return Rail::Ach,
            _ => {}
        }
        if self.wire {
            return Rail::Wire;
        }
        Rail::Ach
    }

    /// The rail used when materializing settlement events from this
    /// provider's reconcile feed.
    pub fn feed_rail(&self) -> Rail {
        if self.fednow {
            return Rail::Fednow;
        }
        if self.rtp {
            return Rail::Rtp;
        }
        if self.ach_credit || self.ach_debit {
            return Rail::Ach;
        }
        if self.wire {
            return Rail::Wire;
        }
        Rail::Internal
    }
}

/// Lifecycle of a settlement as reported by the rail. The status may only
/// advance; the single allowed regression is `Settled` turning into a later
/// `Returned`/`Reversed`, which is what triggers ledger reversals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementStatus {
    Created,
    Submitted,
    Accepted,
    Settled,
    Failed,
    Returned,
    Reversed,
}

impl SettlementStatus {
    fn rank(&self) -> u8 {
        match self {
            SettlementStatus::Created => 0,
            SettlementStatus::Submitted => 1,
            SettlementStatus::Accepted => 2,
            SettlementStatus::Settled => 3,
            SettlementStatus::Failed
            | SettlementStatus::Returned
            | SettlementStatus::Reversed => 4,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SettlementStatus::Failed | SettlementStatus::Returned | SettlementStatus::Reversed
        )
    }

    pub fn can_advance_to(&self, next: SettlementStatus) -> bool {
        if *self == next {
            return false;
        }
        match (self, next) {
            (SettlementStatus::Settled, SettlementStatus::Returned)
            | (SettlementStatus::Settled, SettlementStatus::Reversed) => true,
            (SettlementStatus::Settled, _) => false,
            _ => !self.is_terminal() && next.rank() > self.rank(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementStatus::Created => "created",
            SettlementStatus::Submitted => "submitted",
            SettlementStatus::Accepted => "accepted",
            SettlementStatus::Settled => "settled",
            SettlementStatus::Failed => "failed",
            SettlementStatus::Returned => "returned",
            SettlementStatus::Reversed => "reversed",
        }
    }
}

impl Display for SettlementStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Minimal submission payload handed to a rail adapter. Adapters must be
/// idempotent on `idempotency_key`: resubmitting yields the same
/// `provider_request_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstructionPayload {
    pub instruction_id: Uuid,
    pub amount: Money,
    pub idempotency_key: String,
    pub purpose: String,
    pub payee_type: String,
    pub payee_ref_id: Uuid,
    pub direction: Direction,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitOutcome {
    pub accepted: bool,
    pub provider_request_id: String,
    pub message: String,
}

/// One settled/returned item from the rail's daily feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementRecord {
    pub external_trace_id: String,
    pub effective_date: NaiveDate,
    pub status: SettlementStatus,
    pub amount: Money,
    pub currency: String,
    pub raw_payload: serde_json::Value,
}

/// Boundary to a payment rail. The core performs no network I/O itself;
/// adapters are the only place it happens.
#[async_trait]
pub trait PaymentRailProvider: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> RailCapabilities;

    async fn submit(&self, payload: &InstructionPayload) -> RailResult<SubmitOutcome>;

    /// All settled/returned items for the day. Safe to call repeatedly.
    async fn reconcile(&self, date: NaiveDate) -> RailResult<Vec<SettlementRecord>>;
}

#[derive(Default)]
struct ProviderState {
    submissions: HashMap<String, SubmitOutcome>,
    payloads: Vec<InstructionPayload>,
    rejections: HashMap<String, String>,
    transport_errors: HashMap<String, String>,
    outage: Option<String>,
    sequence: u64,
    feed: HashMap<NaiveDate, Vec<SettlementRecord>>,
}

/// Deterministic in-process rail adapter used for composition and tests.
///
/// Request ids are stable per idempotency key, rejections can be scripted per
/// key, and the reconcile feed replays whatever was loaded for a date.
pub struct InMemoryRailProvider {
    name: String,
    capabilities: RailCapabilities,
    state: Mutex<ProviderState>,
}

impl InMemoryRailProvider {
    pub fn new(name: impl Into<String>, capabilities: RailCapabilities) -> Self {
        Self {
            name: name.into(),
            capabilities,
            state: Mutex::new(ProviderState::default()),
        }
    }

    pub fn ach(name: impl Into<String>) -> Self {
        Self::new(
            name,
            RailCapabilities {
                ach_credit: true,
                ach_debit: true,
                ..RailCapabilities::default()
            },
        )
    }

    pub fn fednow(name: impl Into<String>) -> Self {
        Self::new(
            name,
            RailCapabilities {
                fednow: true,
                ..RailCapabilities::default()
            },
        )
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut ProviderState) -> T) -> RailResult<T> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| RailError::Provider("provider state poisoned".into()))?;
        Ok(f(&mut state))
    }

    /// Scripts a rejection for one idempotency key.
    pub fn reject_key(&self, idempotency_key: impl Into<String>, message: impl Into<String>) {
        if let Ok(mut state) = self.state.lock() {
            state.rejections.insert(idempotency_key.into(), message.into());
        }
    }

    pub fn clear_rejection(&self, idempotency_key: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.rejections.remove(idempotency_key);
            // A retried key gets a fresh decision.
            state.submissions.remove(idempotency_key);
        }
    }

    /// Scripts a transport-level error for one idempotency key: the
    /// submission never reaches the rail, so no decision is stored.
    pub fn error_key(&self, idempotency_key: impl Into<String>, message: impl Into<String>) {
        if let Ok(mut state) = self.state.lock() {
            state
                .transport_errors
                .insert(idempotency_key.into(), message.into());
        }
    }

    pub fn clear_error(&self, idempotency_key: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.transport_errors.remove(idempotency_key);
        }
    }

    /// Scripts a full outage: every new submission errors.
    pub fn set_outage(&self, message: impl Into<String>) {
        if let Ok(mut state) = self.state.lock() {
            state.outage = Some(message.into());
        }
    }

    pub fn clear_outage(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.outage = None;
        }
    }

    pub fn load_settlements(&self, date: NaiveDate, records: Vec<SettlementRecord>) {
        if let Ok(mut state) = self.state.lock() {
            state.feed.entry(date).or_default().extend(records);
        }
    }

    pub fn submitted_payloads(&self) -> Vec<InstructionPayload> {
        self.state
            .lock()
            .map(|state| state.payloads.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl PaymentRailProvider for InMemoryRailProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> RailCapabilities {
        self.capabilities
    }

    async fn submit(&self, payload: &InstructionPayload) -> RailResult<SubmitOutcome> {
        if payload.idempotency_key.trim().is_empty() {
            return Err(RailError::Validation(
                "submission requires an idempotency key".into(),
            ));
        }

        let name = self.name.clone();
        self.with_state(|state| {
            if let Some(existing) = state.submissions.get(&payload.idempotency_key) {
                return Ok(existing.clone());
            }
            if let Some(message) = &state.outage {
                return Err(RailError::Provider(message.clone()));
            }
            if let Some(message) = state.transport_errors.get(&payload.idempotency_key) {
                return Err(RailError::Provider(message.clone()));
            }

            state.sequence += 1;
            let outcome = match state.rejections.get(&payload.idempotency_key) {
                Some(message) => SubmitOutcome {
                    accepted: false,
                    provider_request_id: format!("{name}-req-{:06}", state.sequence),
                    message: message.clone(),
                },
                None => SubmitOutcome {
                    accepted: true,
                    provider_request_id: format!("{name}-req-{:06}", state.sequence),
                    message: "accepted".into(),
                },
            };
            state
                .submissions
                .insert(payload.idempotency_key.clone(), outcome.clone());
            state.payloads.push(payload.clone());
            Ok(outcome)
        })?
    }

    async fn reconcile(&self, date: NaiveDate) -> RailResult<Vec<SettlementRecord>> {
        self.with_state(|state| state.feed.get(&date).cloned().unwrap_or_default())
    }
}
