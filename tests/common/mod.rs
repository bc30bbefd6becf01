#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use endorse::application::pipeline::{Pipeline, Stores};
use endorse::config::Settings;
use endorse::domain::account::{Amount, LedgerAccount};
use endorse::domain::endorsement::{
    Direction, EndorsementRequest, EndorsementType, NewEndorsement, RequestId,
};
use endorse::domain::events::{Event, SendCommand};
use endorse::domain::ports::{EventLog, EventLogRef, InsurerAck, InsurerGateway, Record};
use endorse::error::{EndorseError, GatewayError};
use endorse::infrastructure::clock::ManualClock;
use endorse::infrastructure::in_memory::{
    InMemoryAdvisoryLock, InMemoryEventLog, InMemoryLedgerStore, InMemoryRequestStore,
    InMemorySchedulerBuffer,
};
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// What the scripted insurer does with the next call for a request.
#[derive(Debug, Clone)]
pub enum Reply {
    Accept { confirmation_date: Option<NaiveDate> },
    Transient,
    Reject,
    /// Never answers within the gateway timeout.
    Hang,
}

/// Insurer double answering from a per-request script. Unscripted calls are
/// accepted as of the requested date.
#[derive(Default)]
pub struct ScriptedInsurer {
    script: Mutex<HashMap<RequestId, VecDeque<Reply>>>,
    calls: Mutex<Vec<SendCommand>>,
}

impl ScriptedInsurer {
    pub async fn script(&self, request_id: &str, replies: impl IntoIterator<Item = Reply>) {
        self.script
            .lock()
            .await
            .entry(RequestId::new(request_id))
            .or_default()
            .extend(replies);
    }

    pub async fn calls(&self) -> Vec<SendCommand> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl InsurerGateway for ScriptedInsurer {
    async fn send(&self, command: &SendCommand) -> Result<InsurerAck, GatewayError> {
        self.calls.lock().await.push(command.clone());
        let reply = self
            .script
            .lock()
            .await
            .get_mut(&command.request_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Reply::Accept {
                confirmation_date: None,
            });
        match reply {
            Reply::Accept { confirmation_date } => Ok(InsurerAck {
                confirmation_date: confirmation_date.or(Some(command.requested_effective_date)),
                insurer_reference: Some(format!("POL-{}", command.request_id)),
            }),
            Reply::Transient => Err(GatewayError::Transient("503 from insurer".into())),
            Reply::Reject => Err(GatewayError::Permanent("member not eligible".into())),
            Reply::Hang => {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Err(GatewayError::Transient("late reply".into()))
            }
        }
    }
}

/// Event log that rejects a chosen number of publishes per topic, then
/// delegates to an in-memory log.
pub struct FlakyEventLog {
    inner: Arc<InMemoryEventLog>,
    failures: Mutex<HashMap<String, u32>>,
}

impl FlakyEventLog {
    pub fn new(inner: Arc<InMemoryEventLog>) -> Self {
        Self {
            inner,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Rejects the next `times` publishes to `topic`.
    pub async fn fail_next(&self, topic: &str, times: u32) {
        self.failures.lock().await.insert(topic.to_string(), times);
    }
}

#[async_trait]
impl EventLog for FlakyEventLog {
    async fn publish(&self, topic: &str, key: &str, event: &Event) -> endorse::error::Result<u64> {
        {
            let mut failures = self.failures.lock().await;
            if let Some(remaining) = failures.get_mut(topic)
                && *remaining > 0
            {
                *remaining -= 1;
                return Err(EndorseError::Internal(format!("broker refused {topic}")));
            }
        }
        self.inner.publish(topic, key, event).await
    }

    async fn poll(&self, group: &str, topic: &str, max: usize) -> endorse::error::Result<Vec<Record>> {
        self.inner.poll(group, topic, max).await
    }

    async fn ack(&self, group: &str, record: &Record) -> endorse::error::Result<()> {
        self.inner.ack(group, record).await
    }
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap()
}

pub fn date(text: &str) -> NaiveDate {
    NaiveDate::parse_from_str(text, "%Y-%m-%d").unwrap()
}

pub fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.gateway.timeout_ms = 20;
    settings
}

pub fn in_memory_stores(events: EventLogRef) -> Stores {
    Stores {
        requests: Arc::new(InMemoryRequestStore::new()),
        ledger: Arc::new(InMemoryLedgerStore::new()),
        buffer: Arc::new(InMemorySchedulerBuffer::new()),
        events,
        advisory: Arc::new(InMemoryAdvisoryLock::new()),
    }
}

/// A change for employer `emp-1` at insurer `ins-1` whose payload names the
/// request, so distinct ids never look like duplicates.
pub fn endorsement(
    id: &str,
    kind: EndorsementType,
    amount: Option<Decimal>,
    effective_date: &str,
) -> NewEndorsement {
    NewEndorsement {
        request_id: RequestId::new(id),
        employer_id: "emp-1".into(),
        insurer_id: "ins-1".into(),
        kind,
        requested_effective_date: date(effective_date),
        amount,
        cost_direction: (kind == EndorsementType::Modification).then_some(Direction::Debit),
        payload: serde_json::json!({ "employee": id }),
    }
}

pub struct Harness {
    pub pipeline: Pipeline,
    pub stores: Stores,
    pub clock: Arc<ManualClock>,
    pub insurer: Arc<ScriptedInsurer>,
    /// Everything published so far.
    pub events: Arc<InMemoryEventLog>,
    /// The log the pipeline publishes through.
    pub broker: Arc<FlakyEventLog>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(test_settings())
    }

    pub fn with_settings(settings: Settings) -> Self {
        let events = Arc::new(InMemoryEventLog::new(settings.event_log.partitions));
        let broker = Arc::new(FlakyEventLog::new(events.clone()));
        let stores = in_memory_stores(broker.clone());
        let clock = Arc::new(ManualClock::new(start_time()));
        let insurer = Arc::new(ScriptedInsurer::default());
        let pipeline = Pipeline::new(&settings, stores.clone(), insurer.clone(), clock.clone());
        Self {
            pipeline,
            stores,
            clock,
            insurer,
            events,
            broker,
        }
    }

    /// A second pipeline over the same stores, as after a process restart.
    pub fn restarted(&self, settings: &Settings) -> Pipeline {
        Pipeline::new(
            settings,
            self.stores.clone(),
            self.insurer.clone(),
            self.clock.clone(),
        )
    }

    /// A pipeline over the same durable stores but an empty event log, as
    /// after a crash that lost every message in flight.
    pub fn restarted_without_log(&self, settings: &Settings) -> (Pipeline, Arc<InMemoryEventLog>) {
        let events = Arc::new(InMemoryEventLog::new(settings.event_log.partitions));
        let stores = Stores {
            events: events.clone(),
            ..self.stores.clone()
        };
        let pipeline = Pipeline::new(settings, stores, self.insurer.clone(), self.clock.clone());
        (pipeline, events)
    }

    pub async fn top_up(&self, employer_id: &str, amount: Decimal, external_ref: &str) {
        self.pipeline
            .ledger()
            .top_up(employer_id, Amount::new(amount).unwrap(), external_ref)
            .await
            .unwrap();
    }

    pub async fn submit(&self, id: &str, kind: EndorsementType, amount: Option<Decimal>) {
        self.submit_dated(id, kind, amount, "2024-01-01").await;
    }

    pub async fn submit_dated(
        &self,
        id: &str,
        kind: EndorsementType,
        amount: Option<Decimal>,
        effective_date: &str,
    ) {
        self.pipeline
            .submit(endorsement(id, kind, amount, effective_date))
            .await
            .unwrap();
    }

    /// Closes every window and drains the pipeline.
    pub async fn settle(&self) {
        self.pipeline.run_until_idle().await.unwrap();
        self.pipeline.scheduler().flush_all().await.unwrap();
        self.pipeline.run_until_idle().await.unwrap();
    }

    /// Moves the clock to the next scheduled retry and drains the pipeline.
    /// Returns `false` when no retry is pending.
    pub async fn advance_to_next_retry(&self) -> bool {
        match self.pipeline.retries().next_due().await {
            Some(due) => {
                self.clock.set(due);
                self.pipeline.run_until_idle().await.unwrap();
                true
            }
            None => false,
        }
    }

    pub async fn request(&self, id: &str) -> EndorsementRequest {
        self.pipeline
            .requests()
            .get(&RequestId::new(id))
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("request {id} not stored"))
    }

    pub async fn account(&self, employer_id: &str) -> LedgerAccount {
        self.pipeline
            .ledger()
            .account(employer_id)
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("no account for {employer_id}"))
    }

    pub async fn published(&self, topic: &str) -> Vec<Event> {
        self.events
            .records(topic)
            .await
            .unwrap()
            .into_iter()
            .map(|record| record.event)
            .collect()
    }
}
