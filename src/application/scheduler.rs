//! Tumbling-window reordering of ingested requests.
//!
//! Requests are buffered per employer/insurer pair. When a window closes its
//! content is sorted credits first, then by effective date, then by ingestion
//! order, and emitted on the prioritized topic under the pair's key.

use crate::domain::endorsement::{EndorsementRequest, RequestId, Status};
use crate::domain::events::{Event, Ingested, Prioritized, TOPIC_PRIORITIZED};
use crate::domain::ports::{
    BufferedRequest, ClockRef, EventLogRef, RequestStoreRef, SchedulerBufferRef, WindowKey,
};
use crate::error::{EndorseError, Result};
use chrono::TimeDelta;
use std::time::Duration;
use tracing::{debug, info, warn};

/// The ordered content of one closed window.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerBatch {
    pub key: WindowKey,
    pub entries: Vec<BufferedRequest>,
}

impl SchedulerBatch {
    /// Sorting is a pure function of the buffered set, so replaying a window
    /// after a crash yields the same order.
    pub fn ordered(key: WindowKey, mut entries: Vec<BufferedRequest>) -> Self {
        entries.sort_by_key(|entry| entry.priority);
        Self { key, entries }
    }

    pub fn request_ids(&self) -> Vec<RequestId> {
        self.entries.iter().map(|e| e.request_id.clone()).collect()
    }
}

pub struct Scheduler {
    buffer: SchedulerBufferRef,
    requests: RequestStoreRef,
    events: EventLogRef,
    clock: ClockRef,
    window: Duration,
}

impl Scheduler {
    pub fn new(
        buffer: SchedulerBufferRef,
        requests: RequestStoreRef,
        events: EventLogRef,
        clock: ClockRef,
        window: Duration,
    ) -> Self {
        Self {
            buffer,
            requests,
            events,
            clock,
            window,
        }
    }

    pub async fn on_ingested(&self, ingested: &Ingested) -> Result<()> {
        let Some(request) = self.requests.get(&ingested.request_id).await? else {
            warn!(request_id = %ingested.request_id, "ingested request not found");
            return Ok(());
        };
        if request.status != Status::Received {
            debug!(request_id = %request.request_id, status = %request.status, "already scheduled");
            return Ok(());
        }
        self.buffer_request(&request).await
    }

    /// Buffers every `RECEIVED` request again, as after a restart that lost
    /// the ingestion log. Requests already buffered are not duplicated.
    pub async fn recover(&self) -> Result<usize> {
        let waiting = self.requests.with_status(Status::Received, None).await?;
        for request in &waiting {
            self.buffer_request(request).await?;
        }
        if !waiting.is_empty() {
            info!(recovered = waiting.len(), "unscheduled requests buffered again");
        }
        Ok(waiting.len())
    }

    async fn buffer_request(&self, request: &EndorsementRequest) -> Result<()> {
        let key = WindowKey::new(&request.employer_id, &request.insurer_id);
        self.buffer
            .push(
                &key,
                BufferedRequest {
                    request_id: request.request_id.clone(),
                    priority: request.priority_key(),
                },
                self.clock.now(),
            )
            .await?;
        debug!(request_id = %request.request_id, window = %key, "request buffered");
        Ok(())
    }

    /// Closes every window whose length has elapsed. Returns the number of
    /// requests emitted.
    pub async fn tick(&self) -> Result<usize> {
        let window = TimeDelta::from_std(self.window)
            .map_err(|e| EndorseError::Config(format!("scheduler window out of range: {e}")))?;
        let now = self.clock.now();
        let mut emitted = 0;
        for open in self.buffer.windows().await? {
            if open.opened_at + window <= now {
                emitted += self.close_window(&open.key).await?;
            }
        }
        Ok(emitted)
    }

    /// Closes one window immediately.
    pub async fn flush(&self, key: &WindowKey) -> Result<usize> {
        self.close_window(key).await
    }

    /// Closes every open window immediately.
    pub async fn flush_all(&self) -> Result<usize> {
        let mut emitted = 0;
        for open in self.buffer.windows().await? {
            emitted += self.close_window(&open.key).await?;
        }
        Ok(emitted)
    }

    async fn close_window(&self, key: &WindowKey) -> Result<usize> {
        let buffered = self.buffer.peek(key).await?;
        if buffered.is_empty() {
            return Ok(0);
        }
        let batch = SchedulerBatch::ordered(key.clone(), buffered);
        let partition_key = key.to_string();
        for (position, entry) in batch.entries.iter().enumerate() {
            self.events
                .publish(
                    TOPIC_PRIORITIZED,
                    &partition_key,
                    &Event::Prioritized(Prioritized {
                        request_id: entry.request_id.clone(),
                        employer_id: key.employer_id.clone(),
                        insurer_id: key.insurer_id.clone(),
                        position: u32::try_from(position).unwrap_or(u32::MAX),
                    }),
                )
                .await?;
        }
        // Removed only after every entry is on the log: a crash in between
        // re-emits the window, which consumers tolerate.
        self.buffer.remove(key, &batch.request_ids()).await?;
        info!(window = %key, size = batch.entries.len(), "scheduling window closed");
        Ok(batch.entries.len())
    }
}
