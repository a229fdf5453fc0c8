use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::AccountId;
use crate::AccountStatus;
use crate::Balance;
use crate::CreateReservationRequest;
use crate::EntryId;
use crate::EntryType;
use crate::LedgerAccount;
use crate::LedgerAccountType;
use crate::LedgerEntry;
use crate::LedgerError;
use crate::LedgerResult;
use crate::LedgerService;
use crate::LegalEntityId;
use crate::Money;
use crate::PostEntryRequest;
use crate::PostResult;
use crate::Reservation;
use crate::ReservationId;
use crate::ReservationStatus;
use crate::TenantId;

/// In-memory `LedgerService`.
///
/// The storage-layer invariants live here, not in callers: `(tenant,
/// idempotency_key)` is unique, amounts are strictly positive, debit and
/// credit accounts differ, and entries are append-only (the state offers no
/// update or delete path; reversals are the only correction mechanism).
#[derive(Default)]
pub struct InMemoryLedgerService {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    accounts: HashMap<AccountId, LedgerAccount>,
    account_index: HashMap<(TenantId, LegalEntityId, LedgerAccountType, String), AccountId>,
    entries: HashMap<EntryId, LedgerEntry>,
    entry_index: HashMap<(TenantId, String), EntryId>,
    reservations: HashMap<ReservationId, Reservation>,
}

impl State {
    fn account_for_tenant(
        &self,
        tenant_id: TenantId,
        account_id: AccountId,
    ) -> LedgerResult<&LedgerAccount> {
        self.accounts
            .get(&account_id)
            .filter(|account| account.tenant_id == tenant_id)
            .ok_or_else(|| LedgerError::NotFound(format!("ledger account {account_id}")))
    }
}

impl InMemoryLedgerService {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerService for InMemoryLedgerService {
    async fn get_or_create_account(
        &self,
        tenant_id: TenantId,
        legal_entity_id: LegalEntityId,
        account_type: LedgerAccountType,
        currency: &str,
    ) -> LedgerResult<AccountId> {
        let mut state = self.state.lock().await;
        let key = (tenant_id, legal_entity_id, account_type, currency.to_string());
        if let Some(existing) = state.account_index.get(&key) {
            return Ok(*existing);
        }

        let account = LedgerAccount {
            id: Uuid::new_v4(),
            tenant_id,
            legal_entity_id,
            account_type,
            currency: currency.to_string(),
            status: AccountStatus::Active,
            created_at: Utc::now(),
        };
        let id = account.id;
        state.account_index.insert(key, id);
        state.accounts.insert(id, account);
        Ok(id)
    }

    async fn post_entry(&self, request: PostEntryRequest) -> LedgerResult<PostResult> {
        request.validate()?;

        let mut state = self.state.lock().await;

        let index_key = (request.tenant_id, request.idempotency_key.clone());
        if let Some(existing_id) = state.entry_index.get(&index_key) {
            let existing = state.entries.get(existing_id).ok_or_else(|| {
                LedgerError::Storage(format!("indexed entry {existing_id} missing"))
            })?;
            return Ok(PostResult {
                entry_id: existing.id,
                is_new: false,
                entry_type: existing.entry_type,
            });
        }

        state.account_for_tenant(request.tenant_id, request.debit_account_id)?;
        state.account_for_tenant(request.tenant_id, request.credit_account_id)?;

        let entry = LedgerEntry {
            id: Uuid::new_v4(),
            tenant_id: request.tenant_id,
            legal_entity_id: request.legal_entity_id,
            posted_at: Utc::now(),
            entry_type: request.entry_type,
            debit_account_id: request.debit_account_id,
            credit_account_id: request.credit_account_id,
            amount: request.amount,
            source_type: request.source_type,
            source_id: request.source_id,
            correlation_id: request.correlation_id,
            idempotency_key: request.idempotency_key,
            metadata: request.metadata,
        };
        let result = PostResult {
            entry_id: entry.id,
            is_new: true,
            entry_type: entry.entry_type,
        };
        state.entry_index.insert(index_key, entry.id);
        state.entries.insert(entry.id, entry);
        Ok(result)
    }

    async fn reverse_entry(
        &self,
        tenant_id: TenantId,
        legal_entity_id: LegalEntityId,
        original_entry_id: EntryId,
        idempotency_key: &str,
        reason: &str,
    ) -> LedgerResult<PostResult> {
        let original = {
            let state = self.state.lock().await;
            state
                .entries
                .get(&original_entry_id)
                .filter(|entry| entry.tenant_id == tenant_id)
                .cloned()
                .ok_or_else(|| {
                    LedgerError::NotFound(format!("ledger entry {original_entry_id}"))
                })?
        };

        self.post_entry(PostEntryRequest {
            tenant_id,
            legal_entity_id,
            idempotency_key: idempotency_key.to_string(),
            entry_type: EntryType::Reversal,
            // Swapping debit and credit undoes the original movement.
            debit_account_id: original.credit_account_id,
            credit_account_id: original.debit_account_id,
            amount: original.amount,
            source_type: "ledger_entry".into(),
            source_id: original.id,
            correlation_id: original.correlation_id,
            metadata: serde_json::json!({
                "reason": reason,
                "reverses": original.id,
                "original_type": original.entry_type,
            }),
        })
        .await
    }

    async fn get_balance(
        &self,
        tenant_id: TenantId,
        account_id: AccountId,
    ) -> LedgerResult<Balance> {
        let state = self.state.lock().await;
        let account = state.account_for_tenant(tenant_id, account_id)?;
        let legal_entity_id = account.legal_entity_id;

        let mut available = Money::zero();
        for entry in state.entries.values() {
            if entry.tenant_id != tenant_id {
                continue;
            }
            if entry.credit_account_id == account_id {
                available += entry.amount;
            }
            if entry.debit_account_id == account_id {
                available = available - entry.amount;
            }
        }

        let reserved = state
            .reservations
            .values()
            .filter(|reservation| {
                reservation.tenant_id == tenant_id
                    && reservation.legal_entity_id == legal_entity_id
                    && reservation.status == ReservationStatus::Active
            })
            .map(|reservation| reservation.amount)
            .sum();

        Ok(Balance {
            available,
            reserved,
        })
    }

    async fn create_reservation(
        &self,
        request: CreateReservationRequest,
    ) -> LedgerResult<ReservationId> {
        if !request.amount.is_positive() {
            return Err(LedgerError::InvalidAmount(format!(
                "reservation amounts must be strictly positive, got {}",
                request.amount
            )));
        }

        let mut state = self.state.lock().await;
        let reservation = Reservation {
            id: Uuid::new_v4(),
            tenant_id: request.tenant_id,
            legal_entity_id: request.legal_entity_id,
            reserve_type: request.reserve_type,
            amount: request.amount,
            currency: request.currency,
            status: ReservationStatus::Active,
            source_type: request.source_type,
            source_id: request.source_id,
            correlation_id: request.correlation_id,
            created_at: Utc::now(),
            released_at: None,
        };
        let id = reservation.id;
        state.reservations.insert(id, reservation);
        Ok(id)
    }

    async fn release_reservation(
        &self,
        tenant_id: TenantId,
        reservation_id: ReservationId,
        consumed: bool,
    ) -> LedgerResult<bool> {
        let mut state = self.state.lock().await;
        let Some(reservation) = state
            .reservations
            .get_mut(&reservation_id)
            .filter(|reservation| reservation.tenant_id == tenant_id)
        else {
            return Ok(false);
        };

        if reservation.status != ReservationStatus::Active {
            return Ok(false);
        }

        reservation.status = if consumed {
            ReservationStatus::Consumed
        } else {
            ReservationStatus::Released
        };
        reservation.released_at = Some(Utc::now());
        Ok(true)
    }

    async fn entry(&self, tenant_id: TenantId, entry_id: EntryId) -> LedgerResult<LedgerEntry> {
        let state = self.state.lock().await;
        state
            .entries
            .get(&entry_id)
            .filter(|entry| entry.tenant_id == tenant_id)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("ledger entry {entry_id}")))
    }

    async fn accounts(&self, tenant_id: TenantId) -> LedgerResult<Vec<LedgerAccount>> {
        let state = self.state.lock().await;
        let mut accounts: Vec<LedgerAccount> = state
            .accounts
            .values()
            .filter(|account| account.tenant_id == tenant_id)
            .cloned()
            .collect();
        accounts.sort_by_key(|account| account.created_at);
        Ok(accounts)
    }

    async fn active_reservations(
        &self,
        tenant_id: TenantId,
        legal_entity_id: LegalEntityId,
    ) -> LedgerResult<Vec<Reservation>> {
        let state = self.state.lock().await;
        let mut reservations: Vec<Reservation> = state
            .reservations
            .values()
            .filter(|reservation| {
                reservation.tenant_id == tenant_id
                    && reservation.legal_entity_id == legal_entity_id
                    && reservation.status == ReservationStatus::Active
            })
            .cloned()
            .collect();
        reservations.sort_by_key(|reservation| reservation.created_at);
        Ok(reservations)
    }
}
