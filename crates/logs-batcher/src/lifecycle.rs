// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Flush orchestration: when to drain the store, and what to do with the result.
//!
//! ```text
//!            flush due
//!   Idle ───────────────> Sending ──── delivered ────> Idle
//!                            │
//!                            └──── exhausted ──┬─ requeue ──> Idle (batch restored)
//!                                              ├─ drop ─────> Idle (batch discarded)
//!                                              └─ terminate ─> Terminated
//! ```
//!
//! Both stimuli end up in [`BatchController::flush`]. Only one flush runs at a
//! time. A stimulus that arrives while a batch is being sent leaves the store
//! alone and marks a follow-up: once the send settles, the sending call checks
//! the live store size and flushes again if the size threshold was reached.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregator_service::AggregatorHandle;
use crate::errors::{ConfigError, DeliveryError, StoreError};
use crate::flusher::{BatchDelivery, DeliveryStats};
use crate::trigger::BatchTrigger;

/// What happens to a batch whose delivery attempts are all used up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Put the batch back into the store so the next flush retries it.
    #[default]
    Requeue,
    /// Discard the batch and keep serving.
    Drop,
    /// Stop the whole service.
    Terminate,
}

impl FromStr for FailurePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "requeue" => Ok(FailurePolicy::Requeue),
            "drop" => Ok(FailurePolicy::Drop),
            "terminate" => Ok(FailurePolicy::Terminate),
            other => Err(ConfigError::Invalid(format!(
                "Invalid ON_DELIVERY_FAILURE '{other}'. Must be one of: requeue, drop, terminate"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Sending,
    Terminated,
}

#[derive(Debug)]
pub enum FlushOutcome {
    /// The stimulus was not due.
    NotDue,
    /// Another flush is sending; the store was left untouched.
    InProgress,
    /// The store was already empty when drained.
    Empty,
    Sent { batch_size: usize, stats: DeliveryStats },
    /// Delivery exhausted; the batch was handled according to the policy.
    Failed {
        batch_size: usize,
        policy: FailurePolicy,
        error: DeliveryError,
    },
    /// The controller has terminated and no longer flushes.
    Terminated,
}

pub struct BatchController {
    aggregator: AggregatorHandle,
    delivery: Arc<dyn BatchDelivery + Send + Sync>,
    trigger: BatchTrigger,
    failure_policy: FailurePolicy,
    state: Mutex<LifecycleState>,
    /// Set when a flush is requested while another one is sending.
    follow_up: AtomicBool,
    shutdown: CancellationToken,
}

impl BatchController {
    #[must_use]
    pub fn new(
        aggregator: AggregatorHandle,
        delivery: Arc<dyn BatchDelivery + Send + Sync>,
        trigger: BatchTrigger,
        failure_policy: FailurePolicy,
        shutdown: CancellationToken,
    ) -> Self {
        BatchController {
            aggregator,
            delivery,
            trigger,
            failure_policy,
            state: Mutex::new(LifecycleState::Idle),
            follow_up: AtomicBool::new(false),
            shutdown,
        }
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        *self.lock_state()
    }

    #[must_use]
    pub fn trigger(&self) -> &BatchTrigger {
        &self.trigger
    }

    /// Size stimulus. Evaluated against the live store size, so a stimulus that
    /// runs after another flush already drained the store is a no-op.
    pub async fn on_ingest(&self) -> Result<FlushOutcome, StoreError> {
        let size = self.aggregator.size().await?;
        if !self.trigger.size_due(size) {
            return Ok(FlushOutcome::NotDue);
        }
        debug!("Batch size reached ({size} users), flushing");
        self.flush().await
    }

    /// Timer stimulus, one call per check period.
    pub async fn on_tick(&self) -> Result<FlushOutcome, StoreError> {
        let elapsed = self.trigger.tick();
        let size = self.aggregator.size().await?;
        if !self.trigger.timer_due(size, elapsed) {
            return Ok(FlushOutcome::NotDue);
        }
        debug!("Batch due on timer ({size} users, {elapsed}s elapsed), flushing");
        self.flush().await
    }

    /// Drives [`BatchController::on_tick`] every check period until `shutdown` is cancelled.
    pub async fn run_timer(&self) {
        let mut ticker = interval(self.trigger.check_period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // discard first tick, which is instantaneous

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => {
                    debug!("Batch timer stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.on_tick().await {
                        error!("Timer flush check failed: {e}");
                    }
                }
            }
        }
    }

    /// Captures the current batch, delivers it, and applies the failure policy.
    ///
    /// Returns the outcome of the first batch. Follow-up flushes requested
    /// while it was sending run before this call returns.
    pub async fn flush(&self) -> Result<FlushOutcome, StoreError> {
        let outcome = self.flush_once().await?;
        if matches!(outcome, FlushOutcome::InProgress | FlushOutcome::Terminated) {
            return Ok(outcome);
        }

        while self.follow_up.swap(false, Ordering::AcqRel) {
            let size = self.aggregator.size().await?;
            if !self.trigger.size_due(size) {
                break;
            }
            debug!("Batch size reached during send ({size} users), flushing again");
            if matches!(
                self.flush_once().await?,
                FlushOutcome::InProgress | FlushOutcome::Terminated
            ) {
                break;
            }
        }
        Ok(outcome)
    }

    async fn flush_once(&self) -> Result<FlushOutcome, StoreError> {
        {
            let mut state = self.lock_state();
            match *state {
                LifecycleState::Sending => {
                    // the sending call picks this up once it settles
                    self.follow_up.store(true, Ordering::Release);
                    return Ok(FlushOutcome::InProgress);
                }
                LifecycleState::Terminated => return Ok(FlushOutcome::Terminated),
                LifecycleState::Idle => *state = LifecycleState::Sending,
            }
        }

        self.trigger.reset();
        let batch = match self.aggregator.snapshot_and_clear().await {
            Ok(batch) => batch,
            Err(e) => {
                self.set_state(LifecycleState::Idle);
                return Err(e);
            }
        };
        let batch_size = batch.len();
        if batch.is_empty() {
            self.set_state(LifecycleState::Idle);
            return Ok(FlushOutcome::Empty);
        }

        match self.delivery.deliver(&batch).await {
            Ok(stats) => {
                info!(
                    batch_size,
                    status_code = stats.status_code.as_u16(),
                    duration = stats.duration.as_secs_f64(),
                    "Successfully sent log batch to endpoint"
                );
                self.set_state(LifecycleState::Idle);
                Ok(FlushOutcome::Sent { batch_size, stats })
            }
            Err(error) => {
                let policy = self.failure_policy;
                match policy {
                    FailurePolicy::Requeue => {
                        warn!("{error}, keeping {batch_size} records for the next flush");
                        let restored = self.aggregator.restore(batch);
                        self.set_state(LifecycleState::Idle);
                        restored?;
                    }
                    FailurePolicy::Drop => {
                        error!("{error}, dropping {batch_size} records");
                        self.set_state(LifecycleState::Idle);
                    }
                    FailurePolicy::Terminate => {
                        error!("{error}, remote endpoint is not available, terminating");
                        self.set_state(LifecycleState::Terminated);
                        self.shutdown.cancel();
                    }
                }
                Ok(FlushOutcome::Failed {
                    batch_size,
                    policy,
                    error,
                })
            }
        }
    }

    fn set_state(&self, next: LifecycleState) {
        *self.lock_state() = next;
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, LifecycleState> {
        // state is a plain enum, a poisoned guard still holds a valid value
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
