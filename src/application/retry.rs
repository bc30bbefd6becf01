//! Insurer retry policy and the time-aware dispatcher that re-emits
//! scheduled attempts.
//!
//! Backoff never blocks a worker: a failed attempt is published to the retry
//! topic with its `next_retry_at`, and the dispatcher re-publishes it to the
//! request topic once the clock passes that instant.

use crate::application::orchestrator::send_command;
use crate::config::OrchestratorSettings;
use crate::domain::endorsement::{RequestId, Status};
use crate::domain::events::{Event, RetryScheduled, SendCommand, TOPIC_INSURER_REQUEST};
use crate::domain::ports::{ClockRef, EventLogRef, RequestStoreRef};
use crate::error::Result;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Exponential backoff with symmetric jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
    pub jitter_ratio: f64,
}

impl Backoff {
    /// Un-jittered delay before retry number `retry` (1-based): `base`
    /// doubled per previous retry, capped at `cap`.
    pub fn nominal(&self, retry: u32) -> Duration {
        let doublings = retry.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << doublings)
            .unwrap_or(self.cap)
            .min(self.cap)
    }

    pub fn delay<R: Rng + ?Sized>(&self, retry: u32, rng: &mut R) -> Duration {
        let nominal = self.nominal(retry).as_secs_f64();
        let spread = self.jitter_ratio.abs();
        let factor = 1.0 + rng.gen_range(-spread..=spread);
        Duration::from_secs_f64((nominal * factor).max(0.0))
    }

    /// Longest delay `delay` can return for `retry`.
    pub fn max_delay(&self, retry: u32) -> Duration {
        self.nominal(retry).mul_f64(1.0 + self.jitter_ratio.abs())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Failed insurer attempts after which a request is dead-lettered.
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Whether another attempt is allowed after `failed_attempts` failures.
    pub fn allows_another(&self, failed_attempts: u32) -> bool {
        failed_attempts < self.max_retries
    }
}

impl From<&OrchestratorSettings> for RetryPolicy {
    fn from(settings: &OrchestratorSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            backoff: Backoff {
                base: Duration::from_secs(settings.backoff_base_secs),
                cap: Duration::from_secs(settings.backoff_cap_secs),
                jitter_ratio: settings.jitter_ratio,
            },
        }
    }
}

/// Holds scheduled retries until they are due.
///
/// The pending set is rebuilt from durable request state by `recover`, so a
/// restart does not drop retries whose messages were already consumed.
pub struct RetryDispatcher {
    requests: RequestStoreRef,
    events: EventLogRef,
    clock: ClockRef,
    pending: Mutex<BTreeMap<(DateTime<Utc>, RequestId), SendCommand>>,
}

impl RetryDispatcher {
    pub fn new(requests: RequestStoreRef, events: EventLogRef, clock: ClockRef) -> Self {
        Self {
            requests,
            events,
            clock,
            pending: Mutex::new(BTreeMap::new()),
        }
    }

    pub async fn schedule(&self, retry: RetryScheduled) {
        debug!(
            request_id = %retry.command.request_id,
            retry_count = retry.retry_count,
            next_retry_at = %retry.next_retry_at,
            "retry queued"
        );
        let mut pending = self.pending.lock().await;
        pending.retain(|(_, id), _| id != &retry.command.request_id);
        pending.insert((retry.next_retry_at, retry.command.request_id.clone()), retry.command);
    }

    /// Re-queues every request still waiting on a scheduled retry.
    pub async fn recover(&self) -> Result<usize> {
        let waiting = self.requests.with_status(Status::SentToInsurer, None).await?;
        let mut recovered = 0;
        for request in waiting {
            if let Some(next_retry_at) = request.next_retry_at {
                self.schedule(RetryScheduled {
                    command: send_command(&request),
                    retry_count: request.retry_count,
                    next_retry_at,
                })
                .await;
                recovered += 1;
            }
        }
        if recovered > 0 {
            info!(recovered, "scheduled retries recovered");
        }
        Ok(recovered)
    }

    /// Publishes every retry whose time has come. Retries whose request has
    /// moved on since they were scheduled are dropped. When a publish fails,
    /// that retry and the ones not yet tried go back to the pending set.
    pub async fn dispatch_due(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut due: VecDeque<(DateTime<Utc>, SendCommand)> = {
            let mut pending = self.pending.lock().await;
            let later = pending.split_off(&(now, RequestId::new("\u{10FFFF}")));
            std::mem::replace(&mut *pending, later)
                .into_iter()
                .map(|((at, _), command)| (at, command))
                .collect()
        };

        let mut dispatched = 0;
        while let Some((at, command)) = due.pop_front() {
            match self.dispatch(&command).await {
                Ok(true) => dispatched += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        request_id = %command.request_id,
                        error = %e,
                        "retry dispatch failed, kept for the next round"
                    );
                    let mut pending = self.pending.lock().await;
                    for (at, command) in std::iter::once((at, command)).chain(due) {
                        pending
                            .entry((at, command.request_id.clone()))
                            .or_insert(command);
                    }
                    return Err(e);
                }
            }
        }
        Ok(dispatched)
    }

    async fn dispatch(&self, command: &SendCommand) -> Result<bool> {
        let Some(request) = self.requests.get(&command.request_id).await? else {
            return Ok(false);
        };
        if request.status != Status::SentToInsurer || request.retry_count != command.attempt {
            debug!(request_id = %command.request_id, "stale retry dropped");
            return Ok(false);
        }
        self.events
            .publish(
                TOPIC_INSURER_REQUEST,
                &request.partition_key(),
                &Event::InsurerRequest(command.clone()),
            )
            .await?;
        info!(
            request_id = %request.request_id,
            retry_count = request.retry_count,
            "retry dispatched"
        );
        Ok(true)
    }

    pub async fn pending(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn next_due(&self) -> Option<DateTime<Utc>> {
        self.pending.lock().await.keys().next().map(|(at, _)| *at)
    }
}
