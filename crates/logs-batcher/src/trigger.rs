// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Flush predicates for the two stimuli.
//!
//! - **Size stimulus**, evaluated after every successful ingest: due once the
//!   store holds at least `batch_size` users.
//! - **Timer stimulus**, evaluated every `check_frequency` seconds: each tick
//!   adds `check_frequency` to the elapsed-interval counter, and a flush is due
//!   when the store is non-empty and either the counter reached
//!   `batch_interval` or the store holds at least `batch_size` users.
//!
//! Both size comparisons use `>=`.
//!
//! The counter is only reset by [`BatchTrigger::reset`], which the lifecycle
//! controller calls whenever a flush actually runs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug)]
pub struct BatchTrigger {
    batch_size: usize,
    /// seconds
    batch_interval: u64,
    /// seconds
    check_frequency: u64,
    elapsed: AtomicU64,
}

impl BatchTrigger {
    #[must_use]
    pub fn new(batch_size: usize, batch_interval: u64, check_frequency: u64) -> Self {
        BatchTrigger {
            batch_size,
            batch_interval,
            check_frequency,
            elapsed: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn check_period(&self) -> Duration {
        Duration::from_secs(self.check_frequency)
    }

    #[must_use]
    pub fn size_due(&self, size: usize) -> bool {
        size >= self.batch_size
    }

    /// Advances the elapsed-interval counter by one check period and returns the new value.
    pub fn tick(&self) -> u64 {
        self.elapsed
            .fetch_add(self.check_frequency, Ordering::SeqCst)
            .saturating_add(self.check_frequency)
    }

    #[must_use]
    pub fn timer_due(&self, size: usize, elapsed: u64) -> bool {
        size > 0 && (elapsed >= self.batch_interval || self.size_due(size))
    }

    #[must_use]
    pub fn elapsed(&self) -> u64 {
        self.elapsed.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.elapsed.store(0, Ordering::SeqCst);
    }
}
