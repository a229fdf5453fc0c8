use std::collections::HashMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use psp_rails::SettlementStatus;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::BankAccountId;
use crate::ReconcileError;
use crate::ReconcileResult;
use crate::SettlementEvent;
use crate::SettlementEventId;
use crate::SettlementLink;
use crate::SettlementStore;

/// In-memory `SettlementStore`. Enforces the `(bank_account,
/// external_trace_id)` unique key, positive amounts, advance-only status
/// updates, and one link row per (settlement, ledger entry).
#[derive(Default)]
pub struct InMemorySettlementStore {
    state: RwLock<State>,
}

#[derive(Default)]
struct State {
    events: HashMap<SettlementEventId, SettlementEvent>,
    trace_index: HashMap<(BankAccountId, String), SettlementEventId>,
    links: Vec<SettlementLink>,
}

impl InMemorySettlementStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SettlementStore for InMemorySettlementStore {
    async fn find_by_trace(
        &self,
        bank_account_id: BankAccountId,
        external_trace_id: &str,
    ) -> ReconcileResult<Option<SettlementEvent>> {
        let state = self.state.read().await;
        Ok(state
            .trace_index
            .get(&(bank_account_id, external_trace_id.to_string()))
            .and_then(|id| state.events.get(id))
            .cloned())
    }

    async fn insert(
        &self,
        event: SettlementEvent,
    ) -> ReconcileResult<Option<SettlementEvent>> {
        if !event.amount.is_positive() {
            return Err(ReconcileError::Validation(format!(
                "settlement amounts must be strictly positive, got {}",
                event.amount
            )));
        }

        let mut state = self.state.write().await;
        let index_key = (event.bank_account_id, event.external_trace_id.clone());
        if state.trace_index.contains_key(&index_key) {
            return Ok(None);
        }
        state.trace_index.insert(index_key, event.id);
        state.events.insert(event.id, event.clone());
        Ok(Some(event))
    }

    async fn update_status(
        &self,
        settlement_event_id: SettlementEventId,
        new_status: SettlementStatus,
        effective_date: NaiveDate,
    ) -> ReconcileResult<SettlementEvent> {
        let mut state = self.state.write().await;
        let event = state
            .events
            .get_mut(&settlement_event_id)
            .ok_or_else(|| {
                ReconcileError::NotFound(format!("settlement event {settlement_event_id}"))
            })?;

        if !event.status.can_advance_to(new_status) {
            return Err(ReconcileError::InvalidTransition(format!(
                "settlement {settlement_event_id} cannot move from {} to {new_status}",
                event.status
            )));
        }

        event.status = new_status;
        event.effective_date = effective_date;
        Ok(event.clone())
    }

    async fn add_link(&self, link: SettlementLink) -> ReconcileResult<bool> {
        let mut state = self.state.write().await;
        let exists = state.links.iter().any(|existing| {
            existing.settlement_event_id == link.settlement_event_id
                && existing.ledger_entry_id == link.ledger_entry_id
        });
        if exists {
            return Ok(false);
        }
        state.links.push(link);
        Ok(true)
    }

    async fn links_for_settlement(
        &self,
        settlement_event_id: SettlementEventId,
    ) -> ReconcileResult<Vec<SettlementLink>> {
        let state = self.state.read().await;
        Ok(state
            .links
            .iter()
            .filter(|link| link.settlement_event_id == settlement_event_id)
            .cloned()
            .collect())
    }

    async fn unmatched(
        &self,
        bank_account_id: BankAccountId,
        start: NaiveDate,
        end: NaiveDate,
        limit: usize,
    ) -> ReconcileResult<Vec<SettlementEvent>> {
        let state = self.state.read().await;
        let linked: Vec<SettlementEventId> = state
            .links
            .iter()
            .map(|link| link.settlement_event_id)
            .collect();
        let mut unmatched: Vec<SettlementEvent> = state
            .events
            .values()
            .filter(|event| {
                event.bank_account_id == bank_account_id
                    && event.effective_date >= start
                    && event.effective_date <= end
                    && !linked.contains(&event.id)
            })
            .cloned()
            .collect();
        unmatched.sort_by(|a, b| b.effective_date.cmp(&a.effective_date));
        unmatched.truncate(limit);
        Ok(unmatched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use psp_ledger::Money;
    use psp_rails::Direction;
    use psp_rails::Rail;
    use pretty_assertions::assert_eq;

    fn event(bank_account_id: BankAccountId, trace: &str) -> SettlementEvent {
        SettlementEvent {
            id: Uuid::new_v4(),
            bank_account_id,
            rail: Rail::Ach,
            direction: Direction::Outbound,
            amount: "2500".parse().expect("amount"),
            currency: "USD".into(),
            status: SettlementStatus::Settled,
            external_trace_id: trace.into(),
            effective_date: NaiveDate::from_ymd_opt(2025, 3, 14).expect("date"),
            raw_payload: serde_json::json!({}),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn duplicate_traces_collapse_to_one_event() {
        let store = InMemorySettlementStore::new();
        let bank_account_id = Uuid::new_v4();

        let first = store
            .insert(event(bank_account_id, "trace-1"))
            .await
            .expect("insert");
        assert!(first.is_some());

        let duplicate = store
            .insert(event(bank_account_id, "trace-1"))
            .await
            .expect("duplicate insert");
        assert!(duplicate.is_none());

        // The same trace under another bank account is a distinct event.
        let other_account = store
            .insert(event(Uuid::new_v4(), "trace-1"))
            .await
            .expect("other account insert");
        assert!(other_account.is_some());
    }

    #[tokio::test]
    async fn non_positive_amounts_are_rejected() {
        let store = InMemorySettlementStore::new();
        let mut bad = event(Uuid::new_v4(), "trace-1");
        bad.amount = Money::zero();
        assert!(matches!(
            store.insert(bad).await,
            Err(ReconcileError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn status_cannot_go_backwards() {
        let store = InMemorySettlementStore::new();
        let bank_account_id = Uuid::new_v4();
        let stored = store
            .insert(event(bank_account_id, "trace-1"))
            .await
            .expect("insert")
            .expect("new event");
        let effective = stored.effective_date;

        let returned = store
            .update_status(stored.id, SettlementStatus::Returned, effective)
            .await
            .expect("settled to returned");
        assert_eq!(returned.status, SettlementStatus::Returned);

        let backwards = store
            .update_status(stored.id, SettlementStatus::Submitted, effective)
            .await;
        assert!(matches!(
            backwards,
            Err(ReconcileError::InvalidTransition(_))
        ));
    }

    #[tokio::test]
    async fn links_are_unique_and_drive_the_unmatched_view() {
        let store = InMemorySettlementStore::new();
        let bank_account_id = Uuid::new_v4();
        let linked = store
            .insert(event(bank_account_id, "trace-linked"))
            .await
            .expect("insert")
            .expect("new event");
        let orphan = store
            .insert(event(bank_account_id, "trace-orphan"))
            .await
            .expect("insert")
            .expect("new event");

        let ledger_entry_id = Uuid::new_v4();
        let link = SettlementLink {
            id: Uuid::new_v4(),
            settlement_event_id: linked.id,
            ledger_entry_id,
            tenant_id: Uuid::new_v4(),
            legal_entity_id: Uuid::new_v4(),
            created_at: Utc::now(),
        };
        assert!(store.add_link(link.clone()).await.expect("link"));
        assert!(!store
            .add_link(SettlementLink {
                id: Uuid::new_v4(),
                ..link
            })
            .await
            .expect("duplicate link"));

        let unmatched = store
            .unmatched(
                bank_account_id,
                NaiveDate::from_ymd_opt(2025, 3, 1).expect("date"),
                NaiveDate::from_ymd_opt(2025, 3, 31).expect("date"),
                10,
            )
            .await
            .expect("unmatched");
        assert_eq!(unmatched.len(), 1);
        assert_eq!(unmatched[0].id, orphan.id);
    }
}
