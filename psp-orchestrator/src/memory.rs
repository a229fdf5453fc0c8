use std::collections::HashMap;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use psp_ledger::LegalEntityId;
use psp_ledger::TenantId;
use tokio::sync::RwLock;

use crate::AttemptId;
use crate::InstructionId;
use crate::InstructionStatus;
use crate::InstructionStore;
use crate::OrchestratorError;
use crate::OrchestratorResult;
use crate::PaymentAttempt;
use crate::PaymentInstruction;

/// In-memory `InstructionStore`. Owns the unique keys — `(tenant,
/// idempotency_key)` for instructions, `(provider, provider_request_id)` for
/// attempts — and rejects backwards status transitions.
#[derive(Default)]
pub struct InMemoryInstructionStore {
    state: RwLock<State>,
}

#[derive(Default)]
struct State {
    instructions: HashMap<InstructionId, PaymentInstruction>,
    instruction_index: HashMap<(TenantId, String), InstructionId>,
    attempts: HashMap<AttemptId, PaymentAttempt>,
    attempt_index: HashMap<(String, String), AttemptId>,
}

impl InMemoryInstructionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InstructionStore for InMemoryInstructionStore {
    async fn create(
        &self,
        instruction: PaymentInstruction,
    ) -> OrchestratorResult<(PaymentInstruction, bool)> {
        let mut state = self.state.write().await;
        let index_key = (instruction.tenant_id, instruction.idempotency_key.clone());

        if let Some(existing_id) = state.instruction_index.get(&index_key) {
            let existing = state.instructions.get(existing_id).ok_or_else(|| {
                OrchestratorError::Storage(format!("indexed instruction {existing_id} missing"))
            })?;
            return Ok((existing.clone(), true));
        }

        state.instruction_index.insert(index_key, instruction.id);
        state
            .instructions
            .insert(instruction.id, instruction.clone());
        Ok((instruction, false))
    }

    async fn get(
        &self,
        tenant_id: TenantId,
        instruction_id: InstructionId,
    ) -> OrchestratorResult<PaymentInstruction> {
        let state = self.state.read().await;
        state
            .instructions
            .get(&instruction_id)
            .filter(|instruction| instruction.tenant_id == tenant_id)
            .cloned()
            .ok_or_else(|| {
                OrchestratorError::NotFound(format!("payment instruction {instruction_id}"))
            })
    }

    async fn update_status(
        &self,
        tenant_id: TenantId,
        instruction_id: InstructionId,
        new_status: InstructionStatus,
    ) -> OrchestratorResult<PaymentInstruction> {
        let mut state = self.state.write().await;
        let instruction = state
            .instructions
            .get_mut(&instruction_id)
            .filter(|instruction| instruction.tenant_id == tenant_id)
            .ok_or_else(|| {
                OrchestratorError::NotFound(format!("payment instruction {instruction_id}"))
            })?;

        if !instruction.status.can_transition_to(new_status) {
            return Err(OrchestratorError::Rejected(format!(
                "instruction {instruction_id} cannot move from {} to {new_status}",
                instruction.status
            )));
        }

        instruction.status = new_status;
        Ok(instruction.clone())
    }

    async fn record_attempt(
        &self,
        attempt: PaymentAttempt,
    ) -> OrchestratorResult<Option<AttemptId>> {
        let mut state = self.state.write().await;
        let index_key = (attempt.provider.clone(), attempt.provider_request_id.clone());
        if state.attempt_index.contains_key(&index_key) {
            return Ok(None);
        }
        let id = attempt.id;
        state.attempt_index.insert(index_key, id);
        state.attempts.insert(id, attempt);
        Ok(Some(id))
    }

    async fn find_attempt_by_provider_request_id(
        &self,
        provider_request_id: &str,
    ) -> OrchestratorResult<Option<PaymentAttempt>> {
        let state = self.state.read().await;
        Ok(state
            .attempts
            .values()
            .find(|attempt| attempt.provider_request_id == provider_request_id)
            .cloned())
    }

    async fn instruction_for_provider_request_id(
        &self,
        provider_request_id: &str,
    ) -> OrchestratorResult<Option<PaymentInstruction>> {
        let state = self.state.read().await;
        let Some(attempt) = state
            .attempts
            .values()
            .find(|attempt| attempt.provider_request_id == provider_request_id)
        else {
            return Ok(None);
        };
        Ok(state.instructions.get(&attempt.instruction_id).cloned())
    }

    async fn attempts_for_instruction(
        &self,
        instruction_id: InstructionId,
    ) -> OrchestratorResult<Vec<PaymentAttempt>> {
        let state = self.state.read().await;
        let mut attempts: Vec<PaymentAttempt> = state
            .attempts
            .values()
            .filter(|attempt| attempt.instruction_id == instruction_id)
            .cloned()
            .collect();
        attempts.sort_by_key(|attempt| attempt.created_at);
        Ok(attempts)
    }

    async fn ready_for_submission(
        &self,
        tenant_id: TenantId,
        legal_entity_id: Option<LegalEntityId>,
        limit: usize,
    ) -> OrchestratorResult<Vec<PaymentInstruction>> {
        let state = self.state.read().await;
        let mut ready: Vec<PaymentInstruction> = state
            .instructions
            .values()
            .filter(|instruction| instruction.tenant_id == tenant_id)
            .filter(|instruction| {
                legal_entity_id.is_none_or(|entity| instruction.legal_entity_id == entity)
            })
            .filter(|instruction| {
                matches!(
                    instruction.status,
                    InstructionStatus::Created | InstructionStatus::Queued
                )
            })
            .cloned()
            .collect();
        ready.sort_by_key(|instruction| instruction.created_at);
        ready.truncate(limit);
        Ok(ready)
    }

    async fn non_terminal_older_than(
        &self,
        tenant_id: TenantId,
        cutoff: DateTime<Utc>,
    ) -> OrchestratorResult<Vec<PaymentInstruction>> {
        let state = self.state.read().await;
        let mut stuck: Vec<PaymentInstruction> = state
            .instructions
            .values()
            .filter(|instruction| {
                instruction.tenant_id == tenant_id
                    && !instruction.status.is_terminal()
                    && instruction.created_at < cutoff
            })
            .cloned()
            .collect();
        stuck.sort_by_key(|instruction| instruction.created_at);
        Ok(stuck)
    }

    async fn status_counts(
        &self,
        tenant_id: TenantId,
    ) -> OrchestratorResult<Vec<(InstructionStatus, usize)>> {
        let state = self.state.read().await;
        let mut counts: HashMap<InstructionStatus, usize> = HashMap::new();
        for instruction in state.instructions.values() {
            if instruction.tenant_id == tenant_id {
                *counts.entry(instruction.status).or_default() += 1;
            }
        }
        let mut counts: Vec<(InstructionStatus, usize)> = counts.into_iter().collect();
        counts.sort_by_key(|(status, _)| status.as_str());
        Ok(counts)
    }
}
