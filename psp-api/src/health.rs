use chrono::Duration;
use chrono::NaiveDate;
use chrono::Utc;
use psp_ledger::LedgerAccount;
use psp_ledger::LedgerAccountType;
use psp_ledger::Money;
use psp_ledger::Reservation;
use psp_ledger::TenantId;
use psp_ledger::LedgerService;
use psp_liability::LiabilityEvent;
use psp_orchestrator::InstructionStatus;
use psp_orchestrator::InstructionStore;
use psp_orchestrator::PaymentInstruction;
use psp_reconcile::SettlementEvent;
use psp_reconcile::SettlementStore;
use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

use crate::facade::Psp;
use crate::facade::PspResult;

/// An account whose balance violates expectations (negative balances must
/// never happen; any hit here is an incident).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountBalanceIssue {
    pub account: LedgerAccount,
    pub available: Money,
}

/// The operator's daily triage view, assembled from the core's own queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyHealth {
    pub unmatched_settlements: Vec<SettlementEvent>,
    pub stuck_payments: Vec<PaymentInstruction>,
    pub negative_balances: Vec<AccountBalanceIssue>,
    pub pending_liabilities: Vec<LiabilityEvent>,
    pub expired_reservations: Vec<Reservation>,
    pub return_rate: f64,
}

impl Psp {
    /// Gathers the daily health report for one tenant and settlement
    /// account over a date window.
    pub async fn daily_health(
        &self,
        tenant_id: TenantId,
        bank_account_id: Uuid,
        window_start: NaiveDate,
        window_end: NaiveDate,
    ) -> PspResult<DailyHealth> {
        let now = Utc::now();

        let unmatched_settlements = self
            .settlements()
            .unmatched(bank_account_id, window_start, window_end, 100)
            .await?;

        // Anything non-terminal for more than a day needs a human.
        let stuck_payments = self
            .instructions()
            .non_terminal_older_than(tenant_id, now - Duration::hours(24))
            .await?;

        let ledger = self.ledger();
        let mut negative_balances = Vec::new();
        let mut expired_reservations = Vec::new();
        let reservation_ttl = Duration::hours(self.config().reservation_ttl_hours);
        let mut seen_entities = Vec::new();
        for account in ledger.accounts(tenant_id).await? {
            let balance = ledger.get_balance(tenant_id, account.id).await?;
            // Payable accounts run debit balances mid-cycle by design; a
            // negative funding clearing balance is the real incident.
            if account.account_type == LedgerAccountType::ClientFundingClearing
                && balance.available.is_negative()
            {
                negative_balances.push(AccountBalanceIssue {
                    account: account.clone(),
                    available: balance.available,
                });
            }
            if !seen_entities.contains(&account.legal_entity_id) {
                seen_entities.push(account.legal_entity_id);
                for reservation in ledger
                    .active_reservations(tenant_id, account.legal_entity_id)
                    .await?
                {
                    if reservation.created_at + reservation_ttl < now {
                        expired_reservations.push(reservation);
                    }
                }
            }
        }

        let pending_liabilities = self
            .liability()
            .pending_liabilities(tenant_id, None, 100)
            .await?;

        let mut settled = 0_usize;
        let mut reversed = 0_usize;
        for (status, count) in self.instructions().status_counts(tenant_id).await? {
            match status {
                InstructionStatus::Settled => settled += count,
                InstructionStatus::Reversed => reversed += count,
                _ => {}
            }
        }
        let terminal = settled + reversed;
        let return_rate = if terminal == 0 {
            0.0
        } else {
            reversed as f64 / terminal as f64
        };

        Ok(DailyHealth {
            unmatched_settlements,
            stuck_payments,
            negative_balances,
            pending_liabilities,
            expired_reservations,
            return_rate,
        })
    }
}
