//! Wires the services to the event log as consumer groups.
//!
//! `step` runs one polling round over every group. A record is acknowledged
//! only after its handler succeeded; when a handler fails, the rest of that
//! partition is left for a later round so per-partition order holds.

use crate::application::gateway::GatewayWorker;
use crate::application::hold_release::HoldRelease;
use crate::application::intake::Intake;
use crate::application::ledger::Ledger;
use crate::application::orchestrator::Orchestrator;
use crate::application::retry::{RetryDispatcher, RetryPolicy};
use crate::application::scheduler::Scheduler;
use crate::application::validation::RuleValidator;
use crate::config::Settings;
use crate::domain::endorsement::{EndorsementRequest, NewEndorsement};
use crate::domain::events::{
    Event, TOPIC_BALANCE_INCREASED, TOPIC_CHECK_FUNDS, TOPIC_FUNDS_LOCKED, TOPIC_HOLD_RELEASED,
    TOPIC_INGESTED, TOPIC_INSURER_FAILURE, TOPIC_INSURER_REQUEST, TOPIC_INSURER_RETRY,
    TOPIC_INSURER_SUCCESS, TOPIC_PRIORITIZED,
};
use crate::domain::ports::{
    AdvisoryLockRef, ClockRef, EventLogRef, InsurerGatewayRef, LedgerStoreRef, RequestStoreRef,
    SchedulerBufferRef,
};
use crate::error::Result;
use crate::infrastructure::in_memory::{
    InMemoryAdvisoryLock, InMemoryEventLog, InMemoryLedgerStore, InMemoryRequestStore,
    InMemorySchedulerBuffer,
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Storage adapters behind the pipeline.
#[derive(Clone)]
pub struct Stores {
    pub requests: RequestStoreRef,
    pub ledger: LedgerStoreRef,
    pub buffer: SchedulerBufferRef,
    pub events: EventLogRef,
    pub advisory: AdvisoryLockRef,
}

impl Stores {
    pub fn in_memory(partitions: u32) -> Self {
        Self {
            requests: Arc::new(InMemoryRequestStore::new()),
            ledger: Arc::new(InMemoryLedgerStore::new()),
            buffer: Arc::new(InMemorySchedulerBuffer::new()),
            events: Arc::new(InMemoryEventLog::new(partitions)),
            advisory: Arc::new(InMemoryAdvisoryLock::new()),
        }
    }

    /// Requests, ledger and scheduler buffer in one RocksDB database.
    #[cfg(feature = "storage-rocksdb")]
    pub fn rocksdb(store: crate::infrastructure::rocksdb::RocksDBStore, partitions: u32) -> Self {
        let store = Arc::new(store);
        Self {
            requests: store.clone(),
            ledger: store.clone(),
            buffer: store,
            events: Arc::new(InMemoryEventLog::new(partitions)),
            advisory: Arc::new(InMemoryAdvisoryLock::new()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Consumer {
    Scheduler,
    Orchestrator,
    Ledger,
    HoldRelease,
    Gateway,
    RetryDispatcher,
}

impl Consumer {
    const ALL: [Consumer; 6] = [
        Consumer::Scheduler,
        Consumer::Orchestrator,
        Consumer::Ledger,
        Consumer::HoldRelease,
        Consumer::Gateway,
        Consumer::RetryDispatcher,
    ];

    fn group(self) -> &'static str {
        match self {
            Consumer::Scheduler => "scheduler",
            Consumer::Orchestrator => "orchestrator",
            Consumer::Ledger => "ledger",
            Consumer::HoldRelease => "hold-release",
            Consumer::Gateway => "gateway",
            Consumer::RetryDispatcher => "retry-dispatcher",
        }
    }

    fn topics(self) -> &'static [&'static str] {
        match self {
            Consumer::Scheduler => &[TOPIC_INGESTED],
            Consumer::Orchestrator => &[
                TOPIC_PRIORITIZED,
                TOPIC_FUNDS_LOCKED,
                TOPIC_HOLD_RELEASED,
                TOPIC_INSURER_SUCCESS,
                TOPIC_INSURER_FAILURE,
            ],
            Consumer::Ledger => &[TOPIC_CHECK_FUNDS],
            Consumer::HoldRelease => &[TOPIC_BALANCE_INCREASED],
            Consumer::Gateway => &[TOPIC_INSURER_REQUEST],
            Consumer::RetryDispatcher => &[TOPIC_INSURER_RETRY],
        }
    }
}

pub struct Pipeline {
    intake: Intake,
    scheduler: Scheduler,
    ledger: Arc<Ledger>,
    orchestrator: Orchestrator,
    hold_release: HoldRelease,
    gateway: GatewayWorker,
    retry: RetryDispatcher,
    requests: RequestStoreRef,
    events: EventLogRef,
    poll_batch: usize,
}

impl Pipeline {
    pub fn new(settings: &Settings, stores: Stores, gateway: InsurerGatewayRef, clock: ClockRef) -> Self {
        let Stores {
            requests,
            ledger,
            buffer,
            events,
            advisory,
        } = stores;

        let ledger = Arc::new(Ledger::new(
            ledger,
            advisory,
            events.clone(),
            clock.clone(),
            settings.ledger.clone(),
        ));
        Self {
            intake: Intake::new(requests.clone(), events.clone(), clock.clone()),
            scheduler: Scheduler::new(
                buffer,
                requests.clone(),
                events.clone(),
                clock.clone(),
                settings.scheduler.window(),
            ),
            orchestrator: Orchestrator::new(
                requests.clone(),
                ledger.clone(),
                Arc::new(RuleValidator::new(requests.clone())),
                events.clone(),
                clock.clone(),
                RetryPolicy::from(&settings.orchestrator),
            ),
            hold_release: HoldRelease::new(requests.clone(), ledger.clone(), events.clone()),
            gateway: GatewayWorker::new(gateway, events.clone(), settings.gateway.timeout()),
            retry: RetryDispatcher::new(requests.clone(), events.clone(), clock),
            ledger,
            requests,
            events,
            poll_batch: settings.event_log.poll_batch.max(1),
        }
    }

    pub fn intake(&self) -> &Intake {
        &self.intake
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn retries(&self) -> &RetryDispatcher {
        &self.retry
    }

    pub fn requests(&self) -> &RequestStoreRef {
        &self.requests
    }

    pub fn events(&self) -> &EventLogRef {
        &self.events
    }

    pub async fn submit(&self, new: NewEndorsement) -> Result<EndorsementRequest> {
        self.intake.ingest(new).await
    }

    /// Rebuilds in-process state and re-issues every pending step from the
    /// durable request state, as after a restart that lost the event log:
    /// `RECEIVED` requests are buffered again, in-flight requests get their
    /// next command, scheduled retries are queued and parked requests are
    /// offered the funds already available.
    pub async fn recover(&self) -> Result<()> {
        let buffered = self.scheduler.recover().await?;
        let resumed = self.orchestrator.recover().await?;
        let retries = self.retry.recover().await?;
        let woken = self.hold_release.recover().await?;
        info!(buffered, resumed, retries, woken, "pipeline recovered");
        Ok(())
    }

    /// One polling round over every consumer group, plus due windows and
    /// due retries. Returns the amount of work done.
    pub async fn step(&self) -> Result<usize> {
        let mut progress = 0;
        for consumer in Consumer::ALL {
            for topic in consumer.topics() {
                progress += self.consume(consumer, topic).await?;
            }
            if consumer == Consumer::Scheduler {
                progress += self.scheduler.tick().await?;
            }
        }
        progress += self.retry.dispatch_due().await?;
        Ok(progress)
    }

    /// Runs rounds until one makes no progress.
    pub async fn run_until_idle(&self) -> Result<usize> {
        let mut total = 0;
        loop {
            let progress = self.step().await?;
            if progress == 0 {
                return Ok(total);
            }
            total += progress;
        }
    }

    async fn consume(&self, consumer: Consumer, topic: &str) -> Result<usize> {
        let group = consumer.group();
        let records = self.events.poll(group, topic, self.poll_batch).await?;
        let mut blocked = HashSet::new();
        let mut handled = 0;
        for record in records {
            if blocked.contains(&record.partition) {
                continue;
            }
            match self.dispatch(consumer, &record.event).await {
                Ok(()) => {
                    self.events.ack(group, &record).await?;
                    handled += 1;
                }
                Err(e) => {
                    warn!(
                        group,
                        topic,
                        partition = record.partition,
                        offset = record.offset,
                        event = record.event.name(),
                        error = %e,
                        "handler failed, record left for redelivery"
                    );
                    blocked.insert(record.partition);
                }
            }
        }
        if handled > 0 {
            debug!(group, topic, handled, "records consumed");
        }
        Ok(handled)
    }

    async fn dispatch(&self, consumer: Consumer, event: &Event) -> Result<()> {
        match (consumer, event) {
            (Consumer::Scheduler, Event::Ingested(ingested)) => {
                self.scheduler.on_ingested(ingested).await
            }
            (Consumer::Orchestrator, event) => self.orchestrator.handle(event).await,
            (Consumer::Ledger, Event::CheckFunds(check)) => {
                self.ledger.handle_check_funds(check).await.map(|_| ())
            }
            (Consumer::HoldRelease, Event::BalanceIncreased(signal)) => {
                self.hold_release.on_balance_increased(signal).await.map(|_| ())
            }
            (Consumer::Gateway, Event::InsurerRequest(command)) => {
                self.gateway.handle(command).await.map(|_| ())
            }
            (Consumer::RetryDispatcher, Event::InsurerRetry(retry)) => {
                self.retry.schedule(retry.clone()).await;
                Ok(())
            }
            (consumer, event) => {
                debug!(group = consumer.group(), event = event.name(), "unexpected event skipped");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::account::{Amount, Balance};
    use crate::domain::endorsement::{EndorsementType, RequestId, Status};
    use crate::infrastructure::clock::SystemClock;
    use crate::infrastructure::insurer::SimulatedInsurer;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_single_request_runs_to_active() {
        let settings = Settings::default();
        let pipeline = Pipeline::new(
            &settings,
            Stores::in_memory(4),
            Arc::new(SimulatedInsurer::new()),
            Arc::new(SystemClock),
        );
        pipeline
            .ledger()
            .top_up("emp-1", Amount::new(dec!(100)).unwrap(), "pay-1")
            .await
            .unwrap();
        pipeline
            .submit(NewEndorsement {
                request_id: RequestId::new("req-1"),
                employer_id: "emp-1".into(),
                insurer_id: "ins-1".into(),
                kind: EndorsementType::Addition,
                requested_effective_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                amount: Some(dec!(80)),
                cost_direction: None,
                payload: serde_json::Value::Null,
            })
            .await
            .unwrap();

        pipeline.run_until_idle().await.unwrap();
        pipeline.scheduler().flush_all().await.unwrap();
        pipeline.run_until_idle().await.unwrap();

        let request = pipeline
            .requests()
            .get(&RequestId::new("req-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request.status, Status::Active);
        let account = pipeline.ledger().account("emp-1").await.unwrap().unwrap();
        assert_eq!(account.balance, Balance::new(dec!(20)));
        assert_eq!(account.locked, Balance::ZERO);
    }
}
