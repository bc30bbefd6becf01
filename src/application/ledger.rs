//! Employer fund management: reserve, commit, release and top-up.
//!
//! Every mutation of an employer's account runs inside that employer's
//! authoritative row lock. A best-effort advisory lock is tried first to
//! keep contending workers off the row lock; failing to get it only costs
//! latency.

use crate::config::LedgerSettings;
use crate::domain::account::{Amount, Balance, LedgerAccount};
use crate::domain::endorsement::{Direction, EndorsementRequest, RequestId, partition_key};
use crate::domain::events::{
    BalanceIncreased, CheckFunds, Event, FundsChecked, FundsDecision, TOPIC_BALANCE_INCREASED,
    TOPIC_FUNDS_LOCKED,
};
use crate::domain::ports::{AdvisoryLockRef, ClockRef, EventLogRef, LedgerStoreRef};
use crate::domain::transaction::{EntryKind, EntryStatus, LedgerTransaction, current_state};
use crate::error::{EndorseError, LedgerError, Result};
use rust_decimal::Decimal;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

const ADVISORY_POLL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveOutcome {
    Reserved(Amount),
    /// Not enough available funds; nothing was written to the ledger.
    Parked(Amount),
}

/// Result of comparing the stored balance with the cleared entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    pub employer_id: String,
    pub balance: Balance,
    pub cleared_total: Balance,
}

impl Reconciliation {
    pub fn is_balanced(&self) -> bool {
        self.balance == self.cleared_total
    }
}

pub struct Ledger {
    store: LedgerStoreRef,
    advisory: AdvisoryLockRef,
    events: EventLogRef,
    clock: ClockRef,
    settings: LedgerSettings,
}

impl Ledger {
    pub fn new(
        store: LedgerStoreRef,
        advisory: AdvisoryLockRef,
        events: EventLogRef,
        clock: ClockRef,
        settings: LedgerSettings,
    ) -> Self {
        Self {
            store,
            advisory,
            events,
            clock,
            settings,
        }
    }

    /// Cost of a request: its quoted amount, or the configured default price
    /// for its type.
    pub fn price(&self, request: &EndorsementRequest) -> Result<Amount> {
        let value = request
            .amount
            .unwrap_or_else(|| self.settings.pricing.price(request.kind));
        Ok(Amount::new(value)?)
    }

    pub async fn account(&self, employer_id: &str) -> Result<Option<LedgerAccount>> {
        self.store.account(employer_id).await
    }

    pub async fn accounts(&self) -> Result<Vec<LedgerAccount>> {
        self.store.accounts().await
    }

    pub async fn open_account(&self, employer_id: &str) -> Result<LedgerAccount> {
        let _row = self
            .store
            .lock_account(employer_id, self.settings.row_lock_timeout())
            .await?;
        if let Some(account) = self.store.account(employer_id).await? {
            return Ok(account);
        }
        let account = LedgerAccount::new(employer_id);
        self.store.apply(account.clone(), Vec::new()).await?;
        info!(employer_id, "ledger account opened");
        Ok(account)
    }

    /// Reserves funds for a request.
    ///
    /// Debits lock `amount` when it fits in the available balance, and are
    /// parked otherwise. Credits are always reserved and never touch
    /// `locked`. Reserving an already reserved request returns the existing
    /// reservation.
    pub async fn try_reserve(
        &self,
        employer_id: &str,
        request_id: &RequestId,
        amount: Amount,
        direction: Direction,
    ) -> Result<ReserveOutcome> {
        let lease = self.enter(employer_id).await;
        let outcome = self.reserve_in_section(employer_id, request_id, amount, direction).await;
        self.leave(employer_id, lease).await;
        outcome
    }

    async fn reserve_in_section(
        &self,
        employer_id: &str,
        request_id: &RequestId,
        amount: Amount,
        direction: Direction,
    ) -> Result<ReserveOutcome> {
        let _row = self
            .store
            .lock_account(employer_id, self.settings.row_lock_timeout())
            .await?;

        let existing = self.store.entries_for_request(request_id).await?;
        if let Some(latest) = current_state(&existing) {
            return match latest.status {
                EntryStatus::Locked | EntryStatus::Cleared => {
                    debug!(%request_id, "reservation already recorded");
                    Ok(ReserveOutcome::Reserved(latest.amount))
                }
                EntryStatus::Released => Err(LedgerError::InvalidReservationState {
                    request_id: request_id.clone(),
                    state: latest.status.as_str(),
                    operation: "reserve",
                }
                .into()),
            };
        }

        let mut account = self
            .store
            .account(employer_id)
            .await?
            .unwrap_or_else(|| LedgerAccount::new(employer_id));
        let now = self.clock.now();

        let kind = match direction {
            Direction::Credit => EntryKind::Credit,
            Direction::Debit => {
                if !account.reserve(amount) {
                    account.park(request_id);
                    self.store.apply(account.clone(), Vec::new()).await?;
                    info!(
                        employer_id,
                        %request_id,
                        %amount,
                        available = %account.available(),
                        "insufficient funds, request parked"
                    );
                    return Ok(ReserveOutcome::Parked(amount));
                }
                EntryKind::Debit
            }
        };

        account.unpark(request_id);
        let entry = LedgerTransaction::reservation(employer_id, request_id, kind, amount, now);
        self.store.apply(account.clone(), vec![entry]).await?;
        info!(
            employer_id,
            %request_id,
            %amount,
            ?kind,
            locked = %account.locked,
            available = %account.available(),
            "funds reserved"
        );
        Ok(ReserveOutcome::Reserved(amount))
    }

    /// Settles a reservation. Committing an already cleared reservation is
    /// a no-op.
    pub async fn commit(&self, request_id: &RequestId) -> Result<()> {
        let employer_id = self.reservation_owner(request_id).await?;
        let lease = self.enter(&employer_id).await;
        let outcome = self.commit_in_section(&employer_id, request_id).await;
        self.leave(&employer_id, lease).await;

        if let Some(signal) = outcome? {
            self.publish_balance_increased(signal).await?;
        }
        Ok(())
    }

    async fn commit_in_section(
        &self,
        employer_id: &str,
        request_id: &RequestId,
    ) -> Result<Option<BalanceIncreased>> {
        let _row = self
            .store
            .lock_account(employer_id, self.settings.row_lock_timeout())
            .await?;
        let latest = self.latest_entry(request_id).await?;
        match latest.status {
            EntryStatus::Cleared => {
                debug!(%request_id, "commit already applied");
                return Ok(None);
            }
            EntryStatus::Released => {
                return Err(LedgerError::InvalidReservationState {
                    request_id: request_id.clone(),
                    state: latest.status.as_str(),
                    operation: "commit",
                }
                .into());
            }
            EntryStatus::Locked => {}
        }

        let mut account = self
            .store
            .account(employer_id)
            .await?
            .ok_or_else(|| LedgerError::AccountNotFound(employer_id.to_string()))?;
        match latest.kind {
            EntryKind::Debit => account.settle_debit(latest.amount)?,
            EntryKind::Credit => account.credit(latest.amount),
        }
        let cleared = latest.follow_up(EntryStatus::Cleared, None, self.clock.now());
        self.store.apply(account.clone(), vec![cleared]).await?;
        info!(
            employer_id,
            %request_id,
            amount = %latest.amount,
            balance = %account.balance,
            "reservation committed"
        );

        Ok(match latest.kind {
            EntryKind::Credit => wake_signal(&account, latest.amount, request_id.as_str()),
            EntryKind::Debit => None,
        })
    }

    /// Unwinds a reservation without touching the balance. Releasing an
    /// already released reservation is a no-op. Freed debit capacity wakes
    /// parked requests like a top-up does.
    pub async fn release(&self, request_id: &RequestId, reason: &str) -> Result<()> {
        let employer_id = self.reservation_owner(request_id).await?;
        let lease = self.enter(&employer_id).await;
        let outcome = self.release_in_section(&employer_id, request_id, reason).await;
        self.leave(&employer_id, lease).await;

        if let Some(signal) = outcome? {
            self.publish_balance_increased(signal).await?;
        }
        Ok(())
    }

    async fn release_in_section(
        &self,
        employer_id: &str,
        request_id: &RequestId,
        reason: &str,
    ) -> Result<Option<BalanceIncreased>> {
        let _row = self
            .store
            .lock_account(employer_id, self.settings.row_lock_timeout())
            .await?;
        let latest = self.latest_entry(request_id).await?;
        match latest.status {
            EntryStatus::Released => {
                debug!(%request_id, "release already applied");
                return Ok(None);
            }
            EntryStatus::Cleared => {
                return Err(LedgerError::InvalidReservationState {
                    request_id: request_id.clone(),
                    state: latest.status.as_str(),
                    operation: "release",
                }
                .into());
            }
            EntryStatus::Locked => {}
        }

        let mut account = self
            .store
            .account(employer_id)
            .await?
            .ok_or_else(|| LedgerError::AccountNotFound(employer_id.to_string()))?;
        if latest.kind == EntryKind::Debit {
            account.unlock(latest.amount)?;
        }
        let released = latest.follow_up(EntryStatus::Released, Some(reason), self.clock.now());
        self.store.apply(account.clone(), vec![released]).await?;
        info!(
            employer_id,
            %request_id,
            amount = %latest.amount,
            reason,
            available = %account.available(),
            "reservation released"
        );

        Ok(match latest.kind {
            EntryKind::Debit => wake_signal(&account, latest.amount, request_id.as_str()),
            EntryKind::Credit => None,
        })
    }

    /// Credits an external payment. Returns `false` when `external_ref` was
    /// already applied.
    pub async fn top_up(&self, employer_id: &str, amount: Amount, external_ref: &str) -> Result<bool> {
        let lease = self.enter(employer_id).await;
        let outcome = self.top_up_in_section(employer_id, amount, external_ref).await;
        self.leave(employer_id, lease).await;

        match outcome? {
            Some(Some(signal)) => {
                self.publish_balance_increased(signal).await?;
                Ok(true)
            }
            Some(None) => Ok(true),
            None => Ok(false),
        }
    }

    async fn top_up_in_section(
        &self,
        employer_id: &str,
        amount: Amount,
        external_ref: &str,
    ) -> Result<Option<Option<BalanceIncreased>>> {
        let _row = self
            .store
            .lock_account(employer_id, self.settings.row_lock_timeout())
            .await?;
        if self
            .store
            .entry_by_external_ref(employer_id, external_ref)
            .await?
            .is_some()
        {
            info!(employer_id, external_ref, "duplicate top-up ignored");
            return Ok(None);
        }

        let mut account = self
            .store
            .account(employer_id)
            .await?
            .unwrap_or_else(|| LedgerAccount::new(employer_id));
        account.credit(amount);
        let entry = LedgerTransaction::top_up(employer_id, amount, external_ref, self.clock.now());
        self.store.apply(account.clone(), vec![entry]).await?;
        info!(
            employer_id,
            external_ref,
            %amount,
            balance = %account.balance,
            parked = account.parked.len(),
            "top-up applied"
        );
        Ok(Some(wake_signal(&account, amount, external_ref)))
    }

    /// Checks that the cleared entries of an employer add up to its balance.
    pub async fn reconcile(&self, employer_id: &str) -> Result<Reconciliation> {
        let _row = self
            .store
            .lock_account(employer_id, self.settings.row_lock_timeout())
            .await?;
        let account = self
            .store
            .account(employer_id)
            .await?
            .ok_or_else(|| LedgerError::AccountNotFound(employer_id.to_string()))?;
        let cleared_total: Decimal = self
            .store
            .entries_for_employer(employer_id)
            .await?
            .iter()
            .map(LedgerTransaction::cleared_effect)
            .sum();
        let reconciliation = Reconciliation {
            employer_id: employer_id.to_string(),
            balance: account.balance,
            cleared_total: Balance::new(cleared_total),
        };
        if !reconciliation.is_balanced() {
            warn!(
                employer_id,
                balance = %reconciliation.balance,
                cleared_total = %reconciliation.cleared_total,
                "ledger out of balance"
            );
        }
        Ok(reconciliation)
    }

    /// Handles a funds check and publishes the decision. Row lock conflicts
    /// are retried here and never reach the caller.
    pub async fn handle_check_funds(&self, check: &CheckFunds) -> Result<FundsChecked> {
        let decision = loop {
            match self
                .try_reserve(&check.employer_id, &check.request_id, check.amount, check.direction)
                .await
            {
                Ok(ReserveOutcome::Reserved(amount)) => break FundsDecision::Reserved { amount },
                Ok(ReserveOutcome::Parked(amount)) => break FundsDecision::Parked { amount },
                Err(EndorseError::Ledger(LedgerError::ConcurrencyConflict(employer_id))) => {
                    debug!(%employer_id, request_id = %check.request_id, "row lock busy, retrying");
                    tokio::task::yield_now().await;
                }
                Err(EndorseError::Ledger(
                    err @ LedgerError::InvalidReservationState { .. },
                )) => break FundsDecision::Rejected { reason: err.to_string() },
                Err(e) => return Err(e),
            }
        };

        let checked = FundsChecked {
            request_id: check.request_id.clone(),
            employer_id: check.employer_id.clone(),
            insurer_id: check.insurer_id.clone(),
            decision,
        };
        self.events
            .publish(
                TOPIC_FUNDS_LOCKED,
                &partition_key(&check.employer_id, &check.insurer_id),
                &Event::FundsChecked(checked.clone()),
            )
            .await?;
        Ok(checked)
    }

    async fn reservation_owner(&self, request_id: &RequestId) -> Result<String> {
        Ok(self.latest_entry(request_id).await?.employer_id)
    }

    async fn latest_entry(&self, request_id: &RequestId) -> Result<LedgerTransaction> {
        let entries = self.store.entries_for_request(request_id).await?;
        current_state(&entries)
            .cloned()
            .ok_or_else(|| LedgerError::UnknownReservation(request_id.clone()).into())
    }

    async fn publish_balance_increased(&self, signal: BalanceIncreased) -> Result<()> {
        info!(
            employer_id = %signal.employer_id,
            available = %signal.available,
            source = %signal.source,
            "balance increased with requests parked"
        );
        let key = signal.employer_id.clone();
        self.events
            .publish(TOPIC_BALANCE_INCREASED, &key, &Event::BalanceIncreased(signal))
            .await?;
        Ok(())
    }

    /// Tries the advisory lock until `lock_wait` runs out. Returns the owner
    /// token when the lock was taken.
    async fn enter(&self, employer_id: &str) -> Option<String> {
        let key = advisory_key(employer_id);
        let owner = Uuid::new_v4().to_string();
        let deadline = tokio::time::Instant::now() + self.settings.lock_wait();
        loop {
            match self
                .advisory
                .try_acquire(&key, &owner, self.settings.advisory_ttl())
                .await
            {
                Ok(true) => return Some(owner),
                Ok(false) => {}
                Err(e) => {
                    warn!(employer_id, error = %e, "advisory lock unavailable");
                    return None;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                debug!(employer_id, "advisory lock busy, using row lock only");
                return None;
            }
            tokio::time::sleep(ADVISORY_POLL).await;
        }
    }

    async fn leave(&self, employer_id: &str, owner: Option<String>) {
        let Some(owner) = owner else {
            return;
        };
        if let Err(e) = self.advisory.release(&advisory_key(employer_id), &owner).await {
            warn!(employer_id, error = %e, "advisory lock release failed");
        }
    }
}

fn advisory_key(employer_id: &str) -> String {
    format!("ledger:{employer_id}")
}

/// A balance-increased signal, emitted only when parked requests exist and
/// there is capacity to wake some of them.
fn wake_signal(account: &LedgerAccount, change: Amount, source: &str) -> Option<BalanceIncreased> {
    if change.is_zero() || !account.has_parked() || account.available() <= Balance::ZERO {
        return None;
    }
    Some(BalanceIncreased {
        employer_id: account.employer_id.clone(),
        change,
        balance: account.balance,
        available: account.available(),
        source: source.to_string(),
    })
}
