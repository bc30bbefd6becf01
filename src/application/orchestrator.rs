//! Lifecycle state machine of an endorsement request.
//!
//! The orchestrator reacts to scheduler, ledger, hold/release and gateway
//! events. Each handler stores the new status together with the events it
//! must publish (the request's outbox) and clears the outbox once they are on
//! the log. A handler interrupted in between leaves the outbox behind; the
//! next event for that request, or `recover`, publishes it. Events that do
//! not match the request's current state are dropped, and a request left
//! half-way through failure handling is finished on the next event.

use crate::application::ledger::Ledger;
use crate::application::retry::RetryPolicy;
use crate::domain::endorsement::{
    AttemptResult, Confirmation, Coverage, EndorsementRequest, Outbound, RequestId, Status,
};
use crate::domain::events::{
    CheckFunds, Completed, DateMismatch, DeadLetter, Event, FundsChecked, FundsDecision,
    GatewayOutcome, GatewayReport, HoldReleased, Prioritized, RetryScheduled, SendCommand,
    TOPIC_CHECK_FUNDS, TOPIC_COMPLETED, TOPIC_DATE_MISMATCH, TOPIC_INSURER_DLQ,
    TOPIC_INSURER_REQUEST, TOPIC_INSURER_RETRY,
};
use crate::domain::ports::{ClockRef, EventLogRef, RequestStoreRef, ValidatorRef};
use crate::error::{EndorseError, LedgerError, Result};
use chrono::TimeDelta;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Deterministic per-request key, identical on every retry.
pub fn idempotency_key(request_id: &RequestId) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, request_id.as_str().as_bytes()).to_string()
}

/// The normalized insurer command for the request's current attempt.
pub fn send_command(request: &EndorsementRequest) -> SendCommand {
    SendCommand {
        request_id: request.request_id.clone(),
        employer_id: request.employer_id.clone(),
        insurer_id: request.insurer_id.clone(),
        idempotency_key: idempotency_key(&request.request_id),
        kind: request.kind,
        requested_effective_date: request.requested_effective_date,
        normalized_payload: request.payload.clone(),
        attempt: request.retry_count,
    }
}

fn send_outbound(request: &EndorsementRequest) -> Outbound {
    Outbound::new(TOPIC_INSURER_REQUEST, Event::InsurerRequest(send_command(request)))
}

pub struct Orchestrator {
    requests: RequestStoreRef,
    ledger: Arc<Ledger>,
    validator: ValidatorRef,
    events: EventLogRef,
    clock: ClockRef,
    retry: RetryPolicy,
}

impl Orchestrator {
    pub fn new(
        requests: RequestStoreRef,
        ledger: Arc<Ledger>,
        validator: ValidatorRef,
        events: EventLogRef,
        clock: ClockRef,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            requests,
            ledger,
            validator,
            events,
            clock,
            retry,
        }
    }

    pub async fn handle(&self, event: &Event) -> Result<()> {
        match event {
            Event::Prioritized(prioritized) => self.on_prioritized(prioritized).await,
            Event::FundsChecked(checked) => self.on_funds_checked(checked).await,
            Event::HoldReleased(released) => self.on_hold_released(released).await,
            Event::InsurerResult(report) => self.on_insurer_result(report).await,
            other => {
                debug!(event = other.name(), "event not handled by orchestrator");
                Ok(())
            }
        }
    }

    /// Re-issues the pending step of every request that is waiting on a
    /// message, as after a restart that lost the in-flight log. Requests
    /// waiting for their window or for funds are resumed by the scheduler
    /// and the hold/release service. Returns how many were resumed.
    pub async fn recover(&self) -> Result<usize> {
        let mut resumed = 0;
        for request in self.requests.all().await? {
            if self.resume(request).await? {
                resumed += 1;
            }
        }
        if resumed > 0 {
            info!(resumed, "in-flight requests resumed");
        }
        Ok(resumed)
    }

    async fn resume(&self, mut request: EndorsementRequest) -> Result<bool> {
        // A leftover outbox already holds the step that follows the stored status.
        if !request.outbox.is_empty() {
            self.flush(request).await?;
            return Ok(true);
        }
        match request.status {
            Status::Validated => {
                self.advance(&mut request, Status::FundsPending, None)?;
                let check = self.check_funds(&request)?;
                self.save_and_publish(request, vec![check]).await?;
            }
            Status::FundsPending => {
                let check = self.check_funds(&request)?;
                self.publish(&request, &check).await?;
            }
            Status::FundsLocked => {
                self.advance(&mut request, Status::SentToInsurer, None)?;
                request.next_retry_at = None;
                let send = send_outbound(&request);
                self.save_and_publish(request, vec![send]).await?;
            }
            Status::SentToInsurer if request.next_retry_at.is_none() => {
                self.publish(&request, &send_outbound(&request)).await?;
            }
            Status::Confirmed => self.activate(request).await?,
            Status::Failed => self.finish_failure(request).await?,
            _ => return Ok(false),
        }
        Ok(true)
    }

    async fn on_prioritized(&self, prioritized: &Prioritized) -> Result<()> {
        let Some(mut request) = self.load(&prioritized.request_id).await? else {
            return Ok(());
        };
        if request.status != Status::Received {
            return self.skip(request, "prioritized").await;
        }

        match self.validator.validate(&request).await {
            Ok(()) => {}
            Err(EndorseError::Validation(rejection)) => {
                let reason = rejection.to_string();
                warn!(request_id = %request.request_id, %reason, "validation rejected request");
                return self.fail(request, reason).await;
            }
            Err(e) => return Err(e),
        }

        self.advance(&mut request, Status::Validated, None)?;
        self.advance(&mut request, Status::FundsPending, None)?;
        let check = self.check_funds(&request)?;
        self.save_and_publish(request, vec![check]).await
    }

    async fn on_funds_checked(&self, checked: &FundsChecked) -> Result<()> {
        let Some(mut request) = self.load(&checked.request_id).await? else {
            return Ok(());
        };
        if request.status != Status::FundsPending {
            return self.skip(request, "funds_checked").await;
        }

        match &checked.decision {
            FundsDecision::Reserved { amount } => {
                request.amount_reserved = *amount;
                self.advance(&mut request, Status::FundsLocked, None)?;
                self.advance(&mut request, Status::SentToInsurer, None)?;
                request.next_retry_at = None;
                let send = send_outbound(&request);
                self.save_and_publish(request, vec![send]).await
            }
            FundsDecision::Parked { amount } => {
                self.advance(
                    &mut request,
                    Status::OnHoldFunds,
                    Some(format!("awaiting funds for {amount}")),
                )?;
                self.requests.update(request).await
            }
            FundsDecision::Rejected { reason } => {
                self.fail(request, reason.clone()).await
            }
        }
    }

    async fn on_hold_released(&self, released: &HoldReleased) -> Result<()> {
        let Some(mut request) = self.load(&released.request_id).await? else {
            return Ok(());
        };
        if request.status != Status::OnHoldFunds {
            return self.skip(request, "hold_released").await;
        }
        self.advance(&mut request, Status::FundsPending, Some("funds available".into()))?;
        let check = self.check_funds(&request)?;
        self.save_and_publish(request, vec![check]).await
    }

    async fn on_insurer_result(&self, report: &GatewayReport) -> Result<()> {
        let Some(mut request) = self.load(&report.request_id).await? else {
            return Ok(());
        };
        if report.attempt != request.retry_count {
            debug!(
                request_id = %request.request_id,
                attempt = report.attempt,
                retry_count = request.retry_count,
                "stale insurer result dropped"
            );
            return Ok(());
        }
        match request.status {
            Status::SentToInsurer => {}
            Status::Confirmed if report.outcome == GatewayOutcome::Success => {
                return self.activate(request).await;
            }
            _ => return self.skip(request, "insurer_result").await,
        }

        let now = self.clock.now();
        match &report.outcome {
            GatewayOutcome::Success => {
                request.record_attempt(AttemptResult::Success, None, now);
                request.next_retry_at = None;
                request.confirmation = Some(Confirmation {
                    insurer_reference: report.insurer_reference.clone(),
                    insurer_effective_date: report.insurer_confirmation_date,
                    confirmed_at: now,
                });
                self.advance(&mut request, Status::Confirmed, None)?;
                self.requests.update(request.clone()).await?;
                self.activate(request).await
            }
            GatewayOutcome::Failure {
                permanent: true,
                reason,
            } => {
                request.record_attempt(AttemptResult::Rejected, Some(reason.clone()), now);
                self.fail(request, format!("insurer rejected: {reason}"))
                    .await
            }
            GatewayOutcome::Failure {
                permanent: false,
                reason,
            } => {
                self.retry_or_fail(request, AttemptResult::Failure, reason.clone())
                    .await
            }
            GatewayOutcome::Timeout => {
                self.retry_or_fail(request, AttemptResult::Timeout, "insurer timed out".into())
                    .await
            }
        }
    }

    /// Commits the reservation of a `CONFIRMED` request and records coverage
    /// from the requested date.
    async fn activate(&self, mut request: EndorsementRequest) -> Result<()> {
        let confirmation = request.confirmation.clone().ok_or_else(|| {
            EndorseError::Internal(format!(
                "request {} confirmed without an insurer reply",
                request.request_id
            ))
        })?;
        self.ledger.commit(&request.request_id).await?;

        let requested = request.requested_effective_date;
        let mut outbound = Vec::new();
        if let Some(insurer_date) = confirmation.insurer_effective_date
            && insurer_date != requested
        {
            warn!(
                request_id = %request.request_id,
                %requested,
                %insurer_date,
                "insurer effective date differs from requested date"
            );
            outbound.push(Outbound::new(
                TOPIC_DATE_MISMATCH,
                Event::DateMismatch(DateMismatch {
                    request_id: request.request_id.clone(),
                    employer_id: request.employer_id.clone(),
                    insurer_id: request.insurer_id.clone(),
                    requested_effective_date: requested,
                    insurer_effective_date: insurer_date,
                }),
            ));
        }

        request.coverage = Some(Coverage {
            start_date: requested,
            insurer_reference: confirmation.insurer_reference.clone(),
            insurer_effective_date: confirmation.insurer_effective_date,
            activated_at: self.clock.now(),
        });
        self.advance(&mut request, Status::Active, None)?;
        outbound.push(Outbound::new(
            TOPIC_COMPLETED,
            Event::Completed(Completed {
                request_id: request.request_id.clone(),
                employer_id: request.employer_id.clone(),
                insurer_id: request.insurer_id.clone(),
                start_date: requested,
                insurer_reference: confirmation.insurer_reference,
                retry_count: request.retry_count,
            }),
        ));
        self.save_and_publish(request, outbound).await
    }

    async fn retry_or_fail(
        &self,
        mut request: EndorsementRequest,
        result: AttemptResult,
        reason: String,
    ) -> Result<()> {
        let now = self.clock.now();
        request.record_attempt(result, Some(reason.clone()), now);
        let failed_attempts = request.retry_count + 1;

        if !self.retry.allows_another(failed_attempts) {
            let reason = format!("retries exhausted after {failed_attempts} attempts: {reason}");
            return self.fail(request, reason).await;
        }

        let delay = self.retry.backoff.delay(failed_attempts, &mut rand::thread_rng());
        let delay = TimeDelta::from_std(delay)
            .map_err(|e| EndorseError::Internal(format!("backoff out of range: {e}")))?;
        let next_retry_at = now + delay;
        request.retry_count = failed_attempts;
        request.next_retry_at = Some(next_retry_at);
        self.advance(&mut request, Status::SentToInsurer, Some(reason))?;

        info!(
            request_id = %request.request_id,
            retry_count = request.retry_count,
            %next_retry_at,
            "insurer attempt failed, retry scheduled"
        );
        let retry = Outbound::new(
            TOPIC_INSURER_RETRY,
            Event::InsurerRetry(RetryScheduled {
                command: send_command(&request),
                retry_count: request.retry_count,
                next_retry_at,
            }),
        );
        self.save_and_publish(request, vec![retry]).await
    }

    /// Moves the request to `FAILED` and finishes the failure.
    async fn fail(&self, mut request: EndorsementRequest, reason: String) -> Result<()> {
        request.failure_reason = Some(reason.clone());
        request.next_retry_at = None;
        self.advance(&mut request, Status::Failed, Some(reason))?;
        self.requests.update(request.clone()).await?;
        self.finish_failure(request).await
    }

    /// Releases any reservation of a `FAILED` request and dead-letters it.
    /// Safe to repeat.
    async fn finish_failure(&self, mut request: EndorsementRequest) -> Result<()> {
        let reason = request
            .failure_reason
            .clone()
            .unwrap_or_else(|| "unknown failure".to_string());

        match self.ledger.release(&request.request_id, &reason).await {
            Ok(()) => {}
            Err(EndorseError::Ledger(LedgerError::UnknownReservation(_))) => {}
            Err(e) => return Err(e),
        }

        self.advance(&mut request, Status::Dlq, None)?;
        error!(
            request_id = %request.request_id,
            employer_id = %request.employer_id,
            retry_count = request.retry_count,
            %reason,
            "request dead-lettered"
        );
        let letter = Outbound::new(
            TOPIC_INSURER_DLQ,
            Event::DeadLettered(DeadLetter {
                request_id: request.request_id.clone(),
                employer_id: request.employer_id.clone(),
                insurer_id: request.insurer_id.clone(),
                kind: request.kind,
                reason,
                retry_count: request.retry_count,
                attempts: request.attempts.clone(),
                history: request.history.clone(),
                payload: request.payload.clone(),
                dead_lettered_at: self.clock.now(),
            }),
        );
        self.save_and_publish(request, vec![letter]).await
    }

    fn check_funds(&self, request: &EndorsementRequest) -> Result<Outbound> {
        let amount = self.ledger.price(request)?;
        Ok(Outbound::new(
            TOPIC_CHECK_FUNDS,
            Event::CheckFunds(CheckFunds {
                request_id: request.request_id.clone(),
                employer_id: request.employer_id.clone(),
                insurer_id: request.insurer_id.clone(),
                amount,
                direction: request.direction(),
            }),
        ))
    }

    /// Stores the request with `outbound` in its outbox, then publishes.
    async fn save_and_publish(
        &self,
        mut request: EndorsementRequest,
        outbound: Vec<Outbound>,
    ) -> Result<()> {
        request.outbox.extend(outbound);
        self.requests.update(request.clone()).await?;
        self.flush(request).await.map(|_| ())
    }

    /// Publishes whatever is left in the outbox and clears it.
    async fn flush(&self, mut request: EndorsementRequest) -> Result<EndorsementRequest> {
        if request.outbox.is_empty() {
            return Ok(request);
        }
        for outbound in &request.outbox {
            self.publish(&request, outbound).await?;
        }
        request.outbox.clear();
        self.requests.update(request.clone()).await?;
        Ok(request)
    }

    async fn publish(&self, request: &EndorsementRequest, outbound: &Outbound) -> Result<()> {
        self.events
            .publish(&outbound.topic, &request.partition_key(), &outbound.event)
            .await?;
        Ok(())
    }

    async fn skip(&self, request: EndorsementRequest, event: &str) -> Result<()> {
        if request.status == Status::Failed {
            info!(request_id = %request.request_id, "resuming interrupted failure handling");
            return self.finish_failure(request).await;
        }
        debug!(
            request_id = %request.request_id,
            status = %request.status,
            event,
            "event does not apply to current status"
        );
        Ok(())
    }

    /// Loads a request, first publishing events an interrupted handler left
    /// in its outbox.
    async fn load(&self, request_id: &RequestId) -> Result<Option<EndorsementRequest>> {
        let Some(request) = self.requests.get(request_id).await? else {
            warn!(%request_id, "event for unknown request");
            return Ok(None);
        };
        if !request.outbox.is_empty() {
            info!(
                %request_id,
                pending = request.outbox.len(),
                "publishing events left by an interrupted step"
            );
        }
        self.flush(request).await.map(Some)
    }

    fn advance(
        &self,
        request: &mut EndorsementRequest,
        to: Status,
        reason: Option<String>,
    ) -> Result<()> {
        let from = request.status;
        request.transition(to, self.clock.now(), reason)?;
        info!(
            request_id = %request.request_id,
            employer_id = %request.employer_id,
            %from,
            %to,
            "status changed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::retry::Backoff;
    use crate::application::validation::RuleValidator;
    use crate::config::LedgerSettings;
    use crate::domain::account::{Amount, Balance};
    use crate::domain::endorsement::{EndorsementType, NewEndorsement};
    use crate::domain::ports::RequestStore;
    use crate::infrastructure::clock::ManualClock;
    use crate::infrastructure::in_memory::{
        InMemoryAdvisoryLock, InMemoryEventLog, InMemoryLedgerStore, InMemoryRequestStore,
    };
    use chrono::{NaiveDate, Utc};
    use rust_decimal_macros::dec;
    use std::time::Duration;

    struct Fixture {
        orchestrator: Orchestrator,
        ledger: Arc<Ledger>,
        requests: Arc<InMemoryRequestStore>,
        events: Arc<InMemoryEventLog>,
    }

    fn fixture() -> Fixture {
        let requests = Arc::new(InMemoryRequestStore::new());
        let events = Arc::new(InMemoryEventLog::default());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let ledger = Arc::new(Ledger::new(
            Arc::new(InMemoryLedgerStore::new()),
            Arc::new(InMemoryAdvisoryLock::new()),
            events.clone(),
            clock.clone(),
            LedgerSettings::default(),
        ));
        let orchestrator = Orchestrator::new(
            requests.clone(),
            ledger.clone(),
            Arc::new(RuleValidator::new(requests.clone())),
            events.clone(),
            clock,
            RetryPolicy {
                max_retries: 3,
                backoff: Backoff {
                    base: Duration::from_secs(300),
                    cap: Duration::from_secs(3_600),
                    jitter_ratio: 0.0,
                },
            },
        );
        Fixture {
            orchestrator,
            ledger,
            requests,
            events,
        }
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
    }

    /// Stores a request already sitting in `SENT_TO_INSURER` with 50 reserved.
    async fn sent_request(fx: &Fixture) -> RequestId {
        let id = RequestId::new("req-1");
        fx.ledger
            .top_up("emp-1", Amount::new(dec!(100)).unwrap(), "pay-1")
            .await
            .unwrap();
        fx.ledger
            .try_reserve(
                "emp-1",
                &id,
                Amount::new(dec!(50)).unwrap(),
                crate::domain::endorsement::Direction::Debit,
            )
            .await
            .unwrap();
        let mut request = EndorsementRequest::received(
            NewEndorsement {
                request_id: id.clone(),
                employer_id: "emp-1".into(),
                insurer_id: "ins-1".into(),
                kind: EndorsementType::Addition,
                requested_effective_date: date(),
                amount: Some(dec!(50)),
                cost_direction: None,
                payload: serde_json::Value::Null,
            },
            1,
            Utc::now(),
        );
        for status in [
            Status::Validated,
            Status::FundsPending,
            Status::FundsLocked,
            Status::SentToInsurer,
        ] {
            request.transition(status, Utc::now(), None).unwrap();
        }
        fx.requests.insert(request).await.unwrap();
        id
    }

    fn report(id: &RequestId, attempt: u32, outcome: GatewayOutcome) -> Event {
        Event::InsurerResult(GatewayReport {
            request_id: id.clone(),
            employer_id: "emp-1".into(),
            insurer_id: "ins-1".into(),
            attempt,
            outcome,
            insurer_confirmation_date: None,
            insurer_reference: None,
        })
    }

    #[test]
    fn test_idempotency_key_is_stable() {
        let id = RequestId::new("req-1");
        assert_eq!(idempotency_key(&id), idempotency_key(&id));
        assert_ne!(idempotency_key(&id), idempotency_key(&RequestId::new("req-2")));
    }

    #[tokio::test]
    async fn test_timeouts_exhaust_retries_and_release_funds() {
        let fx = fixture();
        let id = sent_request(&fx).await;

        for attempt in 0..3 {
            fx.orchestrator
                .handle(&report(&id, attempt, GatewayOutcome::Timeout))
                .await
                .unwrap();
        }

        let request = fx.requests.get(&id).await.unwrap().unwrap();
        assert_eq!(request.status, Status::Dlq);
        assert_eq!(request.attempts.len(), 3);
        assert!(request.attempts.iter().all(|a| a.result == AttemptResult::Timeout));
        let account = fx.ledger.account("emp-1").await.unwrap().unwrap();
        assert_eq!(account.balance, Balance::new(dec!(100)));
        assert_eq!(account.locked, Balance::ZERO);
        assert_eq!(fx.events.records(TOPIC_INSURER_RETRY).await.unwrap().len(), 2);
        assert_eq!(fx.events.records(TOPIC_INSURER_DLQ).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_retry_schedules_backoff_and_keeps_status() {
        let fx = fixture();
        let id = sent_request(&fx).await;

        fx.orchestrator
            .handle(&report(
                &id,
                0,
                GatewayOutcome::Failure {
                    permanent: false,
                    reason: "502".into(),
                },
            ))
            .await
            .unwrap();

        let request = fx.requests.get(&id).await.unwrap().unwrap();
        assert_eq!(request.status, Status::SentToInsurer);
        assert_eq!(request.retry_count, 1);
        let last = request.last_attempt_at.unwrap();
        assert_eq!(request.next_retry_at.unwrap() - last, TimeDelta::seconds(300));

        let retries = fx.events.records(TOPIC_INSURER_RETRY).await.unwrap();
        match &retries[0].event {
            Event::InsurerRetry(retry) => {
                assert_eq!(retry.retry_count, 1);
                assert_eq!(retry.command.attempt, 1);
                assert_eq!(retry.command.idempotency_key, idempotency_key(&id));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stale_result_is_ignored() {
        let fx = fixture();
        let id = sent_request(&fx).await;
        fx.orchestrator
            .handle(&report(&id, 0, GatewayOutcome::Timeout))
            .await
            .unwrap();
        // Redelivery of the first timeout must not count twice.
        fx.orchestrator
            .handle(&report(&id, 0, GatewayOutcome::Timeout))
            .await
            .unwrap();

        let request = fx.requests.get(&id).await.unwrap().unwrap();
        assert_eq!(request.retry_count, 1);
        assert_eq!(request.attempts.len(), 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_goes_straight_to_dlq() {
        let fx = fixture();
        let id = sent_request(&fx).await;

        fx.orchestrator
            .handle(&report(
                &id,
                0,
                GatewayOutcome::Failure {
                    permanent: true,
                    reason: "member unknown".into(),
                },
            ))
            .await
            .unwrap();

        let request = fx.requests.get(&id).await.unwrap().unwrap();
        assert_eq!(request.status, Status::Dlq);
        assert_eq!(request.retry_count, 0);
        assert!(request.failure_reason.unwrap().contains("member unknown"));
        let account = fx.ledger.account("emp-1").await.unwrap().unwrap();
        assert_eq!(account.locked, Balance::ZERO);
    }

    #[tokio::test]
    async fn test_success_keeps_requested_date_and_flags_mismatch() {
        let fx = fixture();
        let id = sent_request(&fx).await;
        let insurer_date = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();

        fx.orchestrator
            .handle(&Event::InsurerResult(GatewayReport {
                request_id: id.clone(),
                employer_id: "emp-1".into(),
                insurer_id: "ins-1".into(),
                attempt: 0,
                outcome: GatewayOutcome::Success,
                insurer_confirmation_date: Some(insurer_date),
                insurer_reference: Some("POL-9".into()),
            }))
            .await
            .unwrap();

        let request = fx.requests.get(&id).await.unwrap().unwrap();
        assert_eq!(request.status, Status::Active);
        let coverage = request.coverage.unwrap();
        assert_eq!(coverage.start_date, date());
        assert_eq!(coverage.insurer_effective_date, Some(insurer_date));
        assert_eq!(fx.events.records(TOPIC_DATE_MISMATCH).await.unwrap().len(), 1);
        assert_eq!(fx.events.records(TOPIC_COMPLETED).await.unwrap().len(), 1);

        let account = fx.ledger.account("emp-1").await.unwrap().unwrap();
        assert_eq!(account.balance, Balance::new(dec!(50)));
        assert_eq!(account.locked, Balance::ZERO);
    }

    #[tokio::test]
    async fn test_validation_rejection_dead_letters_without_funds_check() {
        let fx = fixture();
        let mut request = EndorsementRequest::received(
            NewEndorsement {
                request_id: RequestId::new("bad-1"),
                employer_id: "emp-1".into(),
                insurer_id: "ins-1".into(),
                kind: EndorsementType::Modification,
                requested_effective_date: date(),
                amount: Some(dec!(10)),
                cost_direction: None,
                payload: serde_json::Value::Null,
            },
            1,
            Utc::now(),
        );
        request.payload = serde_json::json!({"employee": "E-7"});
        fx.requests.insert(request).await.unwrap();

        fx.orchestrator
            .handle(&Event::Prioritized(Prioritized {
                request_id: RequestId::new("bad-1"),
                employer_id: "emp-1".into(),
                insurer_id: "ins-1".into(),
                position: 0,
            }))
            .await
            .unwrap();

        let request = fx.requests.get(&RequestId::new("bad-1")).await.unwrap().unwrap();
        assert_eq!(
            request.statuses(),
            vec![Status::Received, Status::Failed, Status::Dlq]
        );
        assert!(fx.events.records(TOPIC_CHECK_FUNDS).await.unwrap().is_empty());
        assert_eq!(fx.events.records(TOPIC_INSURER_DLQ).await.unwrap().len(), 1);
    }

    async fn store_status(fx: &Fixture, id: &RequestId, status: Status) -> EndorsementRequest {
        let mut request = fx.requests.get(id).await.unwrap().unwrap();
        request.transition(status, Utc::now(), None).unwrap();
        fx.requests.update(request.clone()).await.unwrap();
        request
    }

    #[tokio::test]
    async fn test_recover_activates_confirmed_request() {
        let fx = fixture();
        let id = sent_request(&fx).await;
        let mut request = store_status(&fx, &id, Status::Confirmed).await;
        request.confirmation = Some(Confirmation {
            insurer_reference: Some("POL-1".into()),
            insurer_effective_date: Some(date()),
            confirmed_at: Utc::now(),
        });
        fx.requests.update(request).await.unwrap();

        assert_eq!(fx.orchestrator.recover().await.unwrap(), 1);

        let request = fx.requests.get(&id).await.unwrap().unwrap();
        assert_eq!(request.status, Status::Active);
        assert_eq!(
            request.coverage.unwrap().insurer_reference.as_deref(),
            Some("POL-1")
        );
        assert_eq!(fx.events.records(TOPIC_COMPLETED).await.unwrap().len(), 1);
        let account = fx.ledger.account("emp-1").await.unwrap().unwrap();
        assert_eq!(account.balance, Balance::new(dec!(50)));
        assert_eq!(account.locked, Balance::ZERO);
    }

    #[tokio::test]
    async fn test_recover_resends_when_no_retry_is_scheduled() {
        let fx = fixture();
        let id = sent_request(&fx).await;

        assert_eq!(fx.orchestrator.recover().await.unwrap(), 1);
        let sent = fx.events.records(TOPIC_INSURER_REQUEST).await.unwrap();
        assert_eq!(sent.len(), 1);
        match &sent[0].event {
            Event::InsurerRequest(command) => {
                assert_eq!(command.request_id, id);
                assert_eq!(command.attempt, 0);
            }
            other => panic!("unexpected event {other:?}"),
        }

        // A request waiting on a scheduled retry is left to the dispatcher.
        let mut request = fx.requests.get(&id).await.unwrap().unwrap();
        request.next_retry_at = Some(Utc::now());
        fx.requests.update(request).await.unwrap();
        assert_eq!(fx.orchestrator.recover().await.unwrap(), 0);
        assert_eq!(fx.events.records(TOPIC_INSURER_REQUEST).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_leftover_outbox_is_published_by_next_event() {
        let fx = fixture();
        let id = sent_request(&fx).await;
        let mut request = fx.requests.get(&id).await.unwrap().unwrap();
        request.outbox.push(send_outbound(&request));
        fx.requests.update(request).await.unwrap();

        // A redelivered funds decision no longer applies, but the send it
        // should have produced goes out.
        fx.orchestrator
            .handle(&Event::FundsChecked(FundsChecked {
                request_id: id.clone(),
                employer_id: "emp-1".into(),
                insurer_id: "ins-1".into(),
                decision: FundsDecision::Reserved {
                    amount: Amount::new(dec!(50)).unwrap(),
                },
            }))
            .await
            .unwrap();

        assert_eq!(fx.events.records(TOPIC_INSURER_REQUEST).await.unwrap().len(), 1);
        let request = fx.requests.get(&id).await.unwrap().unwrap();
        assert!(request.outbox.is_empty());
        assert_eq!(request.status, Status::SentToInsurer);

        // Nothing is left to send a second time.
        fx.orchestrator
            .handle(&report(&id, 7, GatewayOutcome::Timeout))
            .await
            .unwrap();
        assert_eq!(fx.events.records(TOPIC_INSURER_REQUEST).await.unwrap().len(), 1);
    }
}
