//! End-to-end payroll cycle scenarios driven exclusively through the facade.

use std::sync::Arc;

use chrono::NaiveDate;
use psp_api::CallbackStatus;
use psp_api::CommitStatus;
use psp_api::ExecutePaymentsRequest;
use psp_api::ExecuteStatus;
use psp_api::IngestStatus;
use psp_api::PayrollBatch;
use psp_api::PayrollItem;
use psp_api::Psp;
use psp_api::PspConfig;
use psp_events::EventStore;
use psp_events::ReplayFilter;
use psp_funding_gate::REASON_SPIKE_DETECTED;
use psp_ledger::Balance;
use psp_ledger::EntryType;
use psp_ledger::LedgerAccountType;
use psp_ledger::LedgerService;
use psp_ledger::Money;
use psp_ledger::PostEntryRequest;
use psp_liability::ErrorOrigin;
use psp_liability::LiabilityParty;
use psp_liability::RecoveryPath;
use psp_orchestrator::InstructionStatus;
use psp_orchestrator::InstructionStore;
use psp_rails::InMemoryRailProvider;
use psp_rails::SettlementRecord;
use psp_rails::SettlementStatus;
use pretty_assertions::assert_eq;
use uuid::Uuid;

fn money(input: &str) -> Money {
    input.parse().expect("money literal")
}

fn effective_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 3, 14).expect("date")
}

struct World {
    psp: Psp,
    provider: Arc<InMemoryRailProvider>,
    tenant_id: Uuid,
    legal_entity_id: Uuid,
    bank_account_id: Uuid,
}

async fn world_with(config: PspConfig) -> World {
    let psp = Psp::new(config);
    let provider = Arc::new(InMemoryRailProvider::ach("first-national"));
    psp.register_provider("ach", provider.clone()).await;
    World {
        psp,
        provider,
        tenant_id: Uuid::new_v4(),
        legal_entity_id: Uuid::new_v4(),
        bank_account_id: Uuid::new_v4(),
    }
}

async fn world() -> World {
    world_with(PspConfig::default()).await
}

/// Seeds the employer's funding clearing account, the way a received
/// funding wire would.
async fn fund(world: &World, amount: &str) {
    let ledger = world.psp.ledger();
    let funding = ledger
        .get_or_create_account(
            world.tenant_id,
            world.legal_entity_id,
            LedgerAccountType::ClientFundingClearing,
            "USD",
        )
        .await
        .expect("funding account");
    let settlement = ledger
        .get_or_create_account(
            world.tenant_id,
            world.legal_entity_id,
            LedgerAccountType::PspSettlementClearing,
            "USD",
        )
        .await
        .expect("settlement account");
    ledger
        .post_entry(PostEntryRequest {
            tenant_id: world.tenant_id,
            legal_entity_id: world.legal_entity_id,
            idempotency_key: format!("funding-{amount}"),
            entry_type: EntryType::FundingReceived,
            debit_account_id: settlement,
            credit_account_id: funding,
            amount: money(amount),
            source_type: "funding_request".into(),
            source_id: Uuid::new_v4(),
            correlation_id: None,
            metadata: serde_json::json!({}),
        })
        .await
        .expect("funding entry");
}

async fn funding_balance(world: &World) -> Balance {
    let ledger = world.psp.ledger();
    let funding = ledger
        .get_or_create_account(
            world.tenant_id,
            world.legal_entity_id,
            LedgerAccountType::ClientFundingClearing,
            "USD",
        )
        .await
        .expect("funding account");
    ledger
        .get_balance(world.tenant_id, funding)
        .await
        .expect("balance")
}

fn employee_item(amount: &str) -> PayrollItem {
    PayrollItem {
        payee_type: psp_orchestrator::PayeeType::Employee,
        payee_ref_id: Uuid::new_v4(),
        amount: money(amount),
        purpose: psp_orchestrator::PaymentPurpose::EmployeeNet,
        metadata: serde_json::json!({}),
    }
}

fn batch_of(world: &World, items: Vec<PayrollItem>, key: &str) -> PayrollBatch {
    PayrollBatch {
        batch_id: Uuid::new_v4(),
        tenant_id: world.tenant_id,
        legal_entity_id: world.legal_entity_id,
        pay_period_id: Uuid::new_v4(),
        items,
        effective_date: effective_date(),
        idempotency_key: key.into(),
    }
}

fn execute_request(world: &World, batch: &PayrollBatch, reservation: Option<Uuid>) -> ExecutePaymentsRequest {
    ExecutePaymentsRequest {
        tenant_id: world.tenant_id,
        legal_entity_id: world.legal_entity_id,
        batch_id: batch.batch_id,
        items: batch.items.clone(),
        reservation_id: reservation,
        rail: None,
    }
}

/// The in-memory provider hands out request ids in submission order.
fn trace(n: usize) -> String {
    format!("first-national-req-{n:06}")
}

fn settled_record(trace_id: &str, amount: &str) -> SettlementRecord {
    SettlementRecord {
        external_trace_id: trace_id.into(),
        effective_date: effective_date(),
        status: SettlementStatus::Settled,
        amount: money(amount),
        currency: "USD".into(),
        raw_payload: serde_json::json!({}),
    }
}

fn returned_record(trace_id: &str, amount: &str, code: &str) -> SettlementRecord {
    SettlementRecord {
        external_trace_id: trace_id.into(),
        effective_date: effective_date(),
        status: SettlementStatus::Returned,
        amount: money(amount),
        currency: "USD".into(),
        raw_payload: serde_json::json!({
            "return_code": code,
            "return_reason": "Insufficient funds",
        }),
    }
}

async fn event_type_count(world: &World, event_type: &str) -> usize {
    let mut filter = ReplayFilter::for_tenant(world.tenant_id);
    filter.event_types = Some(vec![event_type.to_string()]);
    world
        .psp
        .events()
        .count(filter)
        .await
        .expect("event count")
}

#[tokio::test]
async fn happy_path_settles_a_three_payee_batch() {
    let world = world().await;
    fund(&world, "50000").await;

    let batch = batch_of(
        &world,
        vec![
            employee_item("5000"),
            employee_item("5000"),
            employee_item("5000"),
        ],
        "run-2025-03-14",
    );

    let commit = world
        .psp
        .commit_payroll_batch(&batch)
        .await
        .expect("commit");
    assert_eq!(commit.status, CommitStatus::Approved);
    assert_eq!(commit.total_amount, money("15000"));
    assert_eq!(commit.approved_count, 3);
    let reservation_id = commit.reservation_id.expect("reservation");

    let balance = funding_balance(&world).await;
    assert_eq!(balance.available, money("50000"));
    assert_eq!(balance.reserved, money("15000"));
    assert_eq!(balance.unreserved(), money("35000"));

    // Commit produced exactly its own correlated events.
    let commit_events = world
        .psp
        .events()
        .get_by_correlation(commit.correlation_id, Some(world.tenant_id))
        .await
        .expect("commit events");
    assert_eq!(commit_events.len(), 2);
    assert_eq!(commit_events[0].event_type, "FundingRequested");
    assert_eq!(commit_events[1].event_type, "FundingApproved");

    let execute = world
        .psp
        .execute_payments(execute_request(&world, &batch, Some(reservation_id)))
        .await
        .expect("execute");
    assert_eq!(execute.status, ExecuteStatus::Success);
    assert_eq!(execute.submitted_count, 3);
    assert_eq!(execute.failed_count, 0);

    // All submitted: the reservation is consumed.
    let balance = funding_balance(&world).await;
    assert_eq!(balance.reserved, Money::zero());

    let ingest = world
        .psp
        .ingest_settlement_feed(
            world.tenant_id,
            world.bank_account_id,
            "ach",
            vec![
                settled_record(&trace(1), "5000"),
                settled_record(&trace(2), "5000"),
                settled_record(&trace(3), "5000"),
            ],
        )
        .await
        .expect("ingest");
    assert_eq!(ingest.status, IngestStatus::Success);
    assert_eq!(ingest.records_processed, 3);
    assert_eq!(ingest.records_created, 3);
    assert!(ingest.unmatched_trace_ids.is_empty());

    // Money actually left the employer's funding balance.
    let balance = funding_balance(&world).await;
    assert_eq!(balance.available, money("35000"));

    for n in 1..=3 {
        let instruction = world
            .psp
            .instructions()
            .instruction_for_provider_request_id(&trace(n))
            .await
            .expect("lookup")
            .expect("instruction");
        assert_eq!(instruction.status, InstructionStatus::Settled);
    }

    assert_eq!(event_type_count(&world, "PaymentInstructionCreated").await, 3);
    assert_eq!(event_type_count(&world, "PaymentSubmitted").await, 3);
    assert_eq!(event_type_count(&world, "SettlementReceived").await, 3);
    assert_eq!(event_type_count(&world, "ReconciliationCompleted").await, 1);

    let telemetry = world.psp.telemetry().snapshot();
    assert_eq!(telemetry.batches_committed, 1);
    assert_eq!(telemetry.payments_submitted, 3);
}

#[tokio::test]
async fn strict_commit_gate_blocks_an_underfunded_batch() {
    let world = world_with(PspConfig {
        commit_gate_strict: true,
        ..PspConfig::default()
    })
    .await;
    fund(&world, "10000").await;

    let batch = batch_of(
        &world,
        vec![
            employee_item("5000"),
            employee_item("5000"),
            employee_item("5000"),
        ],
        "run-2025-03-14",
    );

    let commit = world
        .psp
        .commit_payroll_batch(&batch)
        .await
        .expect("commit");
    assert_eq!(commit.status, CommitStatus::BlockedFunds);
    assert_eq!(commit.reservation_id, None);
    assert_eq!(commit.approved_count, 0);
    assert_eq!(commit.blocked_count, 3);
    assert!(commit.block_reason.expect("reason").contains("Required"));

    // No reservation, no ledger movement.
    let balance = funding_balance(&world).await;
    assert_eq!(balance.available, money("10000"));
    assert_eq!(balance.reserved, Money::zero());

    assert_eq!(
        event_type_count(&world, "FundingInsufficientFunds").await,
        1
    );
    let events = world
        .psp
        .events()
        .get_by_correlation(commit.correlation_id, Some(world.tenant_id))
        .await
        .expect("events");
    let blocked = events
        .iter()
        .find(|event| event.event_type == "FundingInsufficientFunds")
        .expect("insufficient funds event");
    assert_eq!(blocked.payload["shortfall"], "5000.0000");
}

#[tokio::test]
async fn a_returned_settlement_reverses_and_classifies_liability() {
    let world = world().await;
    fund(&world, "50000").await;

    let batch = batch_of(
        &world,
        vec![
            employee_item("5000"),
            employee_item("5000"),
            employee_item("5000"),
        ],
        "run-2025-03-14",
    );
    let commit = world
        .psp
        .commit_payroll_batch(&batch)
        .await
        .expect("commit");
    world
        .psp
        .execute_payments(execute_request(&world, &batch, commit.reservation_id))
        .await
        .expect("execute");
    world
        .psp
        .ingest_settlement_feed(
            world.tenant_id,
            world.bank_account_id,
            "ach",
            vec![
                settled_record(&trace(1), "5000"),
                settled_record(&trace(2), "5000"),
                settled_record(&trace(3), "5000"),
            ],
        )
        .await
        .expect("ingest");
    assert_eq!(funding_balance(&world).await.available, money("35000"));

    // The third payment bounces days later with an R01.
    let ingest = world
        .psp
        .ingest_settlement_feed(
            world.tenant_id,
            world.bank_account_id,
            "ach",
            vec![returned_record(&trace(3), "5000", "R01")],
        )
        .await
        .expect("ingest return");
    assert_eq!(ingest.status, IngestStatus::Success);
    assert_eq!(ingest.records_matched, 1);

    // One reversal for exactly the settled amount.
    assert_eq!(funding_balance(&world).await.available, money("40000"));

    let instruction = world
        .psp
        .instructions()
        .instruction_for_provider_request_id(&trace(3))
        .await
        .expect("lookup")
        .expect("instruction");
    assert_eq!(instruction.status, InstructionStatus::Reversed);

    let pending = world
        .psp
        .liability()
        .pending_liabilities(world.tenant_id, None, 10)
        .await
        .expect("pending liabilities");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].error_origin, ErrorOrigin::Recipient);
    assert_eq!(pending[0].liability_party, LiabilityParty::Employer);
    assert_eq!(pending[0].recovery_path, RecoveryPath::OffsetFuture);
    assert_eq!(pending[0].loss_amount, money("5000"));

    assert_eq!(event_type_count(&world, "PaymentReturned").await, 1);
    assert_eq!(event_type_count(&world, "LiabilityClassified").await, 1);

    // Replaying the same return feed adds nothing.
    world
        .psp
        .ingest_settlement_feed(
            world.tenant_id,
            world.bank_account_id,
            "ach",
            vec![returned_record(&trace(3), "5000", "R01")],
        )
        .await
        .expect("replay ingest");
    assert_eq!(funding_balance(&world).await.available, money("40000"));
    let pending = world
        .psp
        .liability()
        .pending_liabilities(world.tenant_id, None, 10)
        .await
        .expect("pending liabilities");
    assert_eq!(pending.len(), 1);
}

#[tokio::test]
async fn retrying_a_partially_failed_batch_only_resubmits_the_failure() {
    let world = world().await;
    fund(&world, "50000").await;

    let batch = batch_of(
        &world,
        vec![
            employee_item("5000"),
            employee_item("5000"),
            employee_item("5000"),
        ],
        "run-2025-03-14",
    );
    let commit = world
        .psp
        .commit_payroll_batch(&batch)
        .await
        .expect("commit");
    let reservation_id = commit.reservation_id.expect("reservation");

    // The third item's submission dies in transit.
    let third_key = format!(
        "{}:{}:employee_net",
        batch.batch_id, batch.items[2].payee_ref_id
    );
    world.provider.error_key(&third_key, "rail timeout");

    let first_run = world
        .psp
        .execute_payments(execute_request(&world, &batch, Some(reservation_id)))
        .await
        .expect("first execute");
    assert_eq!(first_run.status, ExecuteStatus::Partial);
    assert_eq!(first_run.submitted_count, 2);
    assert_eq!(first_run.failed_count, 1);
    assert_eq!(
        first_run.failures[0].payee_ref_id,
        Some(batch.items[2].payee_ref_id)
    );

    // Partial success leaves the hold in place.
    assert_eq!(funding_balance(&world).await.reserved, money("15000"));

    world.provider.clear_error(&third_key);
    let retry = world
        .psp
        .execute_payments(execute_request(&world, &batch, Some(reservation_id)))
        .await
        .expect("retry execute");
    assert_eq!(retry.status, ExecuteStatus::Success);
    assert_eq!(retry.submitted_count, 3);
    assert_eq!(retry.failed_count, 0);

    // Items 1 and 2 were not re-created or re-submitted.
    assert_eq!(event_type_count(&world, "PaymentInstructionCreated").await, 3);
    assert_eq!(event_type_count(&world, "PaymentSubmitted").await, 3);

    // No duplicate companion entries: net pay payable carries exactly the
    // batch total.
    let ledger = world.psp.ledger();
    let net_pay = ledger
        .get_or_create_account(
            world.tenant_id,
            world.legal_entity_id,
            LedgerAccountType::ClientNetPayPayable,
            "USD",
        )
        .await
        .expect("net pay account");
    let balance = ledger
        .get_balance(world.tenant_id, net_pay)
        .await
        .expect("balance");
    assert_eq!(balance.available, Money::zero() - money("15000"));

    // Retry completed the batch, so the reservation is now consumed.
    assert_eq!(funding_balance(&world).await.reserved, Money::zero());
}

#[tokio::test]
async fn provider_callbacks_are_idempotent() {
    let world = world().await;
    fund(&world, "50000").await;

    let batch = batch_of(&world, vec![employee_item("5000")], "run-2025-03-14");
    let commit = world
        .psp
        .commit_payroll_batch(&batch)
        .await
        .expect("commit");
    world
        .psp
        .execute_payments(execute_request(&world, &batch, commit.reservation_id))
        .await
        .expect("execute");

    let settled_payload = serde_json::json!({
        "provider_request_id": trace(1),
        "status": "settled",
        "amount": "5000",
    });

    let first = world
        .psp
        .handle_provider_callback(world.tenant_id, "ach", "settlement", &settled_payload)
        .await
        .expect("first callback");
    assert_eq!(first.status, CallbackStatus::Processed);
    assert_eq!(first.previous_status, Some(InstructionStatus::Submitted));
    assert_eq!(first.new_status, Some(InstructionStatus::Settled));
    assert_eq!(funding_balance(&world).await.available, money("45000"));

    let replay = world
        .psp
        .handle_provider_callback(world.tenant_id, "ach", "settlement", &settled_payload)
        .await
        .expect("replayed callback");
    assert_eq!(replay.status, CallbackStatus::Duplicate);
    assert_eq!(funding_balance(&world).await.available, money("45000"));
    assert_eq!(event_type_count(&world, "PaymentSettled").await, 1);

    // A later return callback classifies liability exactly once.
    let return_payload = serde_json::json!({
        "provider_request_id": trace(1),
        "status": "returned",
        "return_code": "R01",
        "return_reason": "Insufficient funds",
        "amount": "5000",
    });
    let returned = world
        .psp
        .handle_provider_callback(world.tenant_id, "ach", "return", &return_payload)
        .await
        .expect("return callback");
    assert_eq!(returned.status, CallbackStatus::Processed);
    assert_eq!(returned.new_status, Some(InstructionStatus::Reversed));

    let return_replay = world
        .psp
        .handle_provider_callback(world.tenant_id, "ach", "return", &return_payload)
        .await
        .expect("replayed return");
    assert_eq!(return_replay.status, CallbackStatus::Duplicate);

    let pending = world
        .psp
        .liability()
        .pending_liabilities(world.tenant_id, None, 10)
        .await
        .expect("pending liabilities");
    assert_eq!(pending.len(), 1);
    assert_eq!(event_type_count(&world, "PaymentReturned").await, 1);

    let telemetry = world.psp.telemetry().snapshot();
    assert_eq!(telemetry.callbacks_processed, 2);
    assert_eq!(telemetry.callbacks_deduplicated, 2);
}

#[tokio::test]
async fn callbacks_reject_unknown_references_and_bad_payloads() {
    let world = world().await;
    fund(&world, "50000").await;

    let unknown = world
        .psp
        .handle_provider_callback(
            world.tenant_id,
            "ach",
            "settlement",
            &serde_json::json!({"provider_request_id": "nobody-knows", "status": "settled"}),
        )
        .await
        .expect("unknown callback");
    assert_eq!(unknown.status, CallbackStatus::Unknown);

    let missing_reference = world
        .psp
        .handle_provider_callback(
            world.tenant_id,
            "ach",
            "settlement",
            &serde_json::json!({"status": "settled"}),
        )
        .await
        .expect("invalid callback");
    assert_eq!(missing_reference.status, CallbackStatus::Invalid);

    let unknown_provider = world
        .psp
        .handle_provider_callback(
            world.tenant_id,
            "zelle",
            "settlement",
            &serde_json::json!({"provider_request_id": "x", "status": "settled"}),
        )
        .await
        .expect("unknown provider callback");
    assert_eq!(unknown_provider.status, CallbackStatus::Invalid);
}

#[tokio::test]
async fn spike_detection_warns_in_hybrid_mode_and_blocks_in_strict_mode() {
    let hybrid = world().await;
    fund(&hybrid, "100000").await;
    for _ in 0..6 {
        hybrid
            .psp
            .projections()
            .record_paid_net(hybrid.tenant_id, hybrid.legal_entity_id, money("10000"))
            .await;
    }

    let batch = batch_of(&hybrid, vec![employee_item("16000")], "run-2025-03-14");
    let commit = hybrid
        .psp
        .commit_payroll_batch(&batch)
        .await
        .expect("commit");
    assert_eq!(commit.status, CommitStatus::Approved);
    assert_eq!(commit.warnings.len(), 1);
    assert_eq!(commit.warnings[0].code, REASON_SPIKE_DETECTED);

    let strict = world_with(PspConfig {
        commit_gate_strict: true,
        ..PspConfig::default()
    })
    .await;
    fund(&strict, "100000").await;
    for _ in 0..6 {
        strict
            .psp
            .projections()
            .record_paid_net(strict.tenant_id, strict.legal_entity_id, money("10000"))
            .await;
    }

    let batch = batch_of(&strict, vec![employee_item("16000")], "run-2025-03-14");
    let commit = strict
        .psp
        .commit_payroll_batch(&batch)
        .await
        .expect("commit");
    assert_eq!(commit.status, CommitStatus::BlockedPolicy);
    assert!(
        commit
            .block_reason
            .expect("reason")
            .contains("above recent average")
    );
}

#[tokio::test]
async fn pay_gate_blocks_execution_when_the_hold_outgrows_the_balance() {
    // Hybrid commit lets an underfunded batch through; the pay gate is the
    // backstop that refuses to disburse.
    let world = world().await;
    fund(&world, "10000").await;

    let batch = batch_of(
        &world,
        vec![employee_item("9000"), employee_item("6000")],
        "run-2025-03-14",
    );
    let commit = world
        .psp
        .commit_payroll_batch(&batch)
        .await
        .expect("commit");
    assert_eq!(commit.status, CommitStatus::Approved);

    let execute = world
        .psp
        .execute_payments(execute_request(&world, &batch, commit.reservation_id))
        .await
        .expect("execute");
    assert_eq!(execute.status, ExecuteStatus::Blocked);
    assert_eq!(execute.submitted_count, 0);
    assert!(execute.failures[0].error.contains("Cannot disburse"));

    // Nothing was created or submitted.
    assert_eq!(event_type_count(&world, "PaymentInstructionCreated").await, 0);
}

#[tokio::test]
async fn daily_health_reports_unmatched_stuck_and_returns() {
    let world = world().await;
    fund(&world, "50000").await;

    let batch = batch_of(
        &world,
        vec![
            employee_item("5000"),
            employee_item("5000"),
            employee_item("5000"),
        ],
        "run-2025-03-14",
    );
    let commit = world
        .psp
        .commit_payroll_batch(&batch)
        .await
        .expect("commit");
    world
        .psp
        .execute_payments(execute_request(&world, &batch, commit.reservation_id))
        .await
        .expect("execute");
    world
        .psp
        .ingest_settlement_feed(
            world.tenant_id,
            world.bank_account_id,
            "ach",
            vec![
                settled_record(&trace(1), "5000"),
                settled_record(&trace(2), "5000"),
                settled_record(&trace(3), "5000"),
                // A feed line the PSP has no instruction for.
                settled_record("stray-trace", "123"),
            ],
        )
        .await
        .expect("ingest");
    world
        .psp
        .ingest_settlement_feed(
            world.tenant_id,
            world.bank_account_id,
            "ach",
            vec![returned_record(&trace(3), "5000", "R01")],
        )
        .await
        .expect("ingest return");

    let health = world
        .psp
        .daily_health(
            world.tenant_id,
            world.bank_account_id,
            effective_date(),
            effective_date(),
        )
        .await
        .expect("health");

    assert_eq!(health.unmatched_settlements.len(), 1);
    assert_eq!(
        health.unmatched_settlements[0].external_trace_id,
        "stray-trace"
    );
    assert!(health.stuck_payments.is_empty());
    assert!(health.negative_balances.is_empty());
    assert_eq!(health.pending_liabilities.len(), 1);
    // Two settled, one reversed.
    assert!((health.return_rate - (1.0 / 3.0)).abs() < 1e-9);
}

#[tokio::test]
async fn expired_reservations_surface_in_the_health_view() {
    let world = world_with(PspConfig {
        reservation_ttl_hours: 0,
        ..PspConfig::default()
    })
    .await;
    fund(&world, "50000").await;

    let batch = batch_of(&world, vec![employee_item("5000")], "run-2025-03-14");
    let commit = world
        .psp
        .commit_payroll_batch(&batch)
        .await
        .expect("commit");
    assert_eq!(commit.status, CommitStatus::Approved);

    // Committed but never executed: with a zero-hour TTL the hold is
    // immediately overdue.
    let health = world
        .psp
        .daily_health(
            world.tenant_id,
            world.bank_account_id,
            effective_date(),
            effective_date(),
        )
        .await
        .expect("health");
    assert_eq!(health.expired_reservations.len(), 1);
    assert_eq!(health.expired_reservations[0].amount, money("5000"));
}

#[tokio::test]
async fn execution_without_a_registered_rail_fails_cleanly() {
    let world = world().await;
    fund(&world, "50000").await;

    let batch = batch_of(&world, vec![employee_item("5000")], "run-2025-03-14");
    let commit = world
        .psp
        .commit_payroll_batch(&batch)
        .await
        .expect("commit");

    let mut request = execute_request(&world, &batch, commit.reservation_id);
    request.rail = Some("wire".into());
    let execute = world.psp.execute_payments(request).await.expect("execute");
    assert_eq!(execute.status, ExecuteStatus::Failed);
    assert!(execute.failures[0].error.contains("no provider registered"));
}

#[tokio::test]
async fn tenants_do_not_see_each_others_events_or_instructions() {
    let world = world().await;
    fund(&world, "50000").await;

    let batch = batch_of(&world, vec![employee_item("5000")], "run-2025-03-14");
    let commit = world
        .psp
        .commit_payroll_batch(&batch)
        .await
        .expect("commit");
    world
        .psp
        .execute_payments(execute_request(&world, &batch, commit.reservation_id))
        .await
        .expect("execute");

    let other_tenant = Uuid::new_v4();
    let count = world
        .psp
        .events()
        .count(ReplayFilter::for_tenant(other_tenant))
        .await
        .expect("count");
    assert_eq!(count, 0);

    // A callback from another tenant cannot touch this tenant's payment.
    let result = world
        .psp
        .handle_provider_callback(
            other_tenant,
            "ach",
            "settlement",
            &serde_json::json!({"provider_request_id": trace(1), "status": "settled"}),
        )
        .await
        .expect("cross-tenant callback");
    assert_eq!(result.status, CallbackStatus::Unknown);

    let instruction = world
        .psp
        .instructions()
        .instruction_for_provider_request_id(&trace(1))
        .await
        .expect("lookup")
        .expect("instruction");
    assert_eq!(instruction.status, InstructionStatus::Submitted);
}
