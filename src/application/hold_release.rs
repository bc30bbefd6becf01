use crate::application::ledger::Ledger;
use crate::domain::account::Balance;
use crate::domain::endorsement::Status;
use crate::domain::events::{BalanceIncreased, Event, HoldReleased, TOPIC_HOLD_RELEASED};
use crate::domain::ports::{EventLogRef, RequestStoreRef};
use crate::error::Result;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Re-admits parked requests when an employer's balance grows.
pub struct HoldRelease {
    requests: RequestStoreRef,
    ledger: Arc<Ledger>,
    events: EventLogRef,
}

impl HoldRelease {
    pub fn new(requests: RequestStoreRef, ledger: Arc<Ledger>, events: EventLogRef) -> Self {
        Self {
            requests,
            ledger,
            events,
        }
    }

    /// Wakes the longest prefix of the employer's parked requests, in
    /// priority order, whose combined cost fits the available funds.
    /// Returns how many were woken.
    pub async fn on_balance_increased(&self, signal: &BalanceIncreased) -> Result<usize> {
        self.wake(&signal.employer_id, signal.available).await
    }

    /// Wakes parked requests of every employer that has some, as after a
    /// restart that lost balance signals. Returns how many were woken.
    pub async fn recover(&self) -> Result<usize> {
        let parked = self.requests.with_status(Status::OnHoldFunds, None).await?;
        let employers: BTreeSet<String> =
            parked.into_iter().map(|request| request.employer_id).collect();
        let mut woken = 0;
        for employer_id in employers {
            woken += self.wake(&employer_id, Balance::ZERO).await?;
        }
        Ok(woken)
    }

    /// `fallback` is used when the employer has no ledger account.
    async fn wake(&self, employer_id: &str, fallback: Balance) -> Result<usize> {
        let mut parked = self
            .requests
            .with_status(Status::OnHoldFunds, Some(employer_id))
            .await?;
        if parked.is_empty() {
            return Ok(0);
        }
        parked.sort_by_key(|request| request.priority_key());

        // The signal may be stale by the time it is consumed.
        let mut remaining = match self.ledger.account(employer_id).await? {
            Some(account) => account.available(),
            None => fallback,
        };

        let mut woken = 0;
        for request in &parked {
            let cost: Balance = self.ledger.price(request)?.into();
            if cost > remaining {
                debug!(
                    employer_id,
                    request_id = %request.request_id,
                    %cost,
                    %remaining,
                    "capacity exhausted, remaining requests stay parked"
                );
                break;
            }
            remaining -= cost;
            self.events
                .publish(
                    TOPIC_HOLD_RELEASED,
                    &request.partition_key(),
                    &Event::HoldReleased(HoldReleased {
                        request_id: request.request_id.clone(),
                        employer_id: request.employer_id.clone(),
                        insurer_id: request.insurer_id.clone(),
                    }),
                )
                .await?;
            woken += 1;
        }

        info!(
            employer_id,
            woken,
            still_parked = parked.len() - woken,
            "parked requests re-admitted"
        );
        Ok(woken)
    }
}
