mod common;

use common::start_time;
use endorse::application::ledger::{Ledger, ReserveOutcome};
use endorse::config::LedgerSettings;
use endorse::domain::account::Amount;
use endorse::domain::endorsement::{Direction, RequestId};
use endorse::domain::events::{Event, TOPIC_BALANCE_INCREASED};
use endorse::error::{EndorseError, LedgerError};
use endorse::infrastructure::clock::ManualClock;
use endorse::infrastructure::in_memory::{
    InMemoryAdvisoryLock, InMemoryEventLog, InMemoryLedgerStore,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;

fn ledger() -> (Arc<Ledger>, Arc<InMemoryEventLog>) {
    let events = Arc::new(InMemoryEventLog::new(4));
    let ledger = Ledger::new(
        Arc::new(InMemoryLedgerStore::new()),
        Arc::new(InMemoryAdvisoryLock::new()),
        events.clone(),
        Arc::new(ManualClock::new(start_time())),
        LedgerSettings::default(),
    );
    (Arc::new(ledger), events)
}

fn amount(value: Decimal) -> Amount {
    Amount::new(value).unwrap()
}

#[tokio::test]
async fn test_commit_and_release_are_idempotent() {
    let (ledger, _) = ledger();
    ledger.top_up("emp-1", amount(dec!(100)), "pay-1").await.unwrap();

    let kept = RequestId::new("kept");
    let dropped = RequestId::new("dropped");
    ledger
        .try_reserve("emp-1", &kept, amount(dec!(30)), Direction::Debit)
        .await
        .unwrap();
    ledger
        .try_reserve("emp-1", &dropped, amount(dec!(20)), Direction::Debit)
        .await
        .unwrap();

    ledger.commit(&kept).await.unwrap();
    ledger.commit(&kept).await.unwrap();
    ledger.release(&dropped, "insurer rejected").await.unwrap();
    ledger.release(&dropped, "insurer rejected").await.unwrap();

    let account = ledger.account("emp-1").await.unwrap().unwrap();
    assert_eq!(account.balance.value(), dec!(70));
    assert_eq!(account.locked.value(), dec!(0));
    assert!(ledger.reconcile("emp-1").await.unwrap().is_balanced());
}

#[tokio::test]
async fn test_settled_reservation_cannot_change_outcome() {
    let (ledger, _) = ledger();
    ledger.top_up("emp-1", amount(dec!(100)), "pay-1").await.unwrap();
    let request = RequestId::new("req-1");
    ledger
        .try_reserve("emp-1", &request, amount(dec!(30)), Direction::Debit)
        .await
        .unwrap();
    ledger.commit(&request).await.unwrap();

    let err = ledger.release(&request, "late failure").await.unwrap_err();
    assert!(matches!(
        err,
        EndorseError::Ledger(LedgerError::InvalidReservationState { .. })
    ));
    assert_eq!(
        ledger.account("emp-1").await.unwrap().unwrap().balance.value(),
        dec!(70)
    );
}

#[tokio::test]
async fn test_unknown_reservation_is_reported() {
    let (ledger, _) = ledger();
    let err = ledger.commit(&RequestId::new("ghost")).await.unwrap_err();
    assert!(matches!(
        err,
        EndorseError::Ledger(LedgerError::UnknownReservation(_))
    ));
}

#[tokio::test]
async fn test_repeated_payment_credited_once() {
    let (ledger, _) = ledger();
    assert!(ledger.top_up("emp-1", amount(dec!(100)), "pay-1").await.unwrap());
    assert!(!ledger.top_up("emp-1", amount(dec!(100)), "pay-1").await.unwrap());
    assert!(ledger.top_up("emp-1", amount(dec!(5.5)), "pay-2").await.unwrap());

    let account = ledger.account("emp-1").await.unwrap().unwrap();
    assert_eq!(account.balance.value(), dec!(105.5));
    assert!(ledger.reconcile("emp-1").await.unwrap().is_balanced());
}

#[tokio::test]
async fn test_balance_signal_only_when_something_waits() {
    let (ledger, events) = ledger();
    ledger.top_up("emp-1", amount(dec!(10)), "pay-1").await.unwrap();
    assert!(events.records(TOPIC_BALANCE_INCREASED).await.unwrap().is_empty());

    let outcome = ledger
        .try_reserve("emp-1", &RequestId::new("big"), amount(dec!(50)), Direction::Debit)
        .await
        .unwrap();
    assert_eq!(outcome, ReserveOutcome::Parked(amount(dec!(50))));

    ledger.top_up("emp-1", amount(dec!(60)), "pay-2").await.unwrap();
    let signals = events.records(TOPIC_BALANCE_INCREASED).await.unwrap();
    assert_eq!(signals.len(), 1);
    match &signals[0].event {
        Event::BalanceIncreased(signal) => {
            assert_eq!(signal.employer_id, "emp-1");
            assert_eq!(signal.available.value(), dec!(70));
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_top_up_reports_credit_when_nothing_is_parked() {
    let (ledger, events) = ledger();
    assert!(ledger.top_up("emp-1", amount(dec!(25)), "pay-1").await.unwrap());
    assert!(events.records(TOPIC_BALANCE_INCREASED).await.unwrap().is_empty());
    assert_eq!(
        ledger.account("emp-1").await.unwrap().unwrap().balance.value(),
        dec!(25)
    );
    assert!(!ledger.top_up("emp-1", amount(dec!(25)), "pay-1").await.unwrap());
}

#[tokio::test]
async fn test_releasing_a_debit_wakes_parked_requests() {
    let (ledger, events) = ledger();
    ledger.top_up("emp-1", amount(dec!(50)), "pay-1").await.unwrap();
    let first = RequestId::new("a");
    let second = RequestId::new("b");
    assert_eq!(
        ledger
            .try_reserve("emp-1", &first, amount(dec!(50)), Direction::Debit)
            .await
            .unwrap(),
        ReserveOutcome::Reserved(amount(dec!(50)))
    );
    assert_eq!(
        ledger
            .try_reserve("emp-1", &second, amount(dec!(50)), Direction::Debit)
            .await
            .unwrap(),
        ReserveOutcome::Parked(amount(dec!(50)))
    );
    assert!(events.records(TOPIC_BALANCE_INCREASED).await.unwrap().is_empty());

    ledger.release(&first, "insurer rejected").await.unwrap();
    let signals = events.records(TOPIC_BALANCE_INCREASED).await.unwrap();
    assert_eq!(signals.len(), 1);
    match &signals[0].event {
        Event::BalanceIncreased(signal) => {
            assert_eq!(signal.employer_id, "emp-1");
            assert_eq!(signal.available.value(), dec!(50));
        }
        other => panic!("unexpected event {other:?}"),
    }

    // Releasing again frees nothing and signals nothing.
    ledger.release(&first, "insurer rejected").await.unwrap();
    assert_eq!(events.records(TOPIC_BALANCE_INCREASED).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_releasing_a_credit_signals_nothing() {
    let (ledger, events) = ledger();
    ledger.top_up("emp-1", amount(dec!(10)), "pay-1").await.unwrap();
    ledger
        .try_reserve("emp-1", &RequestId::new("big"), amount(dec!(50)), Direction::Debit)
        .await
        .unwrap();
    let refund = RequestId::new("refund");
    ledger
        .try_reserve("emp-1", &refund, amount(dec!(30)), Direction::Credit)
        .await
        .unwrap();

    ledger.release(&refund, "insurer rejected").await.unwrap();
    assert!(events.records(TOPIC_BALANCE_INCREASED).await.unwrap().is_empty());
    let account = ledger.account("emp-1").await.unwrap().unwrap();
    assert_eq!(account.balance.value(), dec!(10));
    assert_eq!(account.parked, vec![RequestId::new("big")]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reservations_never_overdraw() {
    let (ledger, _) = ledger();
    let employers = ["emp-1", "emp-2", "emp-3", "emp-4"];
    for (i, employer) in employers.iter().enumerate() {
        ledger
            .top_up(employer, amount(dec!(100)), &format!("pay-{i}"))
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for employer in employers {
        for n in 0..20 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                let request = RequestId::new(format!("{employer}-{n}"));
                let outcome = ledger
                    .try_reserve(employer, &request, amount(dec!(7)), Direction::Debit)
                    .await
                    .unwrap();
                if let ReserveOutcome::Reserved(_) = outcome {
                    ledger.commit(&request).await.unwrap();
                }
                outcome
            }));
        }
    }

    let mut reserved = 0;
    for handle in handles {
        if let ReserveOutcome::Reserved(_) = handle.await.unwrap() {
            reserved += 1;
        }
    }
    // 14 * 7 = 98 fits in 100 for each employer
    assert_eq!(reserved, 14 * employers.len());

    for employer in employers {
        let account = ledger.account(employer).await.unwrap().unwrap();
        assert_eq!(account.balance.value(), dec!(2));
        assert_eq!(account.locked.value(), dec!(0));
        assert!(account.available().value() >= Decimal::ZERO);
        assert_eq!(account.parked.len(), 6);
        assert!(ledger.reconcile(employer).await.unwrap().is_balanced());
    }
}
