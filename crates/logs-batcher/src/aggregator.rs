// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-user accumulation of activity records.
//!
//! The aggregator holds at most one [`LogRecord`] per user. A second record for
//! a user that is already present is merged into the existing entry (see
//! [`LogRecord::merge`]) instead of being stored next to it.
//!
//! The struct itself has no synchronization. It is owned by the
//! [`AggregatorService`](crate::aggregator_service::AggregatorService) task,
//! which serializes every access through its command channel.
//!
//! # Example
//!
//! ```rust
//! use logs_batcher::aggregator::Aggregator;
//! use logs_batcher::record::{validate, LogRecord};
//!
//! let mut aggregator = Aggregator::default();
//! let record = LogRecord::from_slice(br#"{"user_id": 1}"#).unwrap();
//! aggregator.put(validate(record).unwrap());
//!
//! let batch = aggregator.snapshot_and_clear();
//! assert_eq!(batch.len(), 1);
//! assert!(aggregator.is_empty());
//! ```

use std::collections::btree_map::Entry;

use crate::record::{Batch, ValidRecord};

#[derive(Debug, Clone, Default)]
pub struct Aggregator {
    records: Batch,
}

impl Aggregator {
    /// Inserts a record, or merges it into the user's existing entry.
    ///
    /// Returns the number of distinct users held after the insert, which is
    /// what the size trigger compares against the batch threshold.
    pub fn put(&mut self, record: ValidRecord) -> usize {
        let record = record.into_inner();
        match self.records.entry(record.user_id) {
            Entry::Vacant(slot) => {
                slot.insert(record);
            }
            Entry::Occupied(mut slot) => slot.get_mut().merge(record),
        }
        self.records.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Takes everything held and leaves the aggregator empty.
    pub fn snapshot_and_clear(&mut self) -> Batch {
        std::mem::take(&mut self.records)
    }

    /// Puts back a batch that could not be delivered.
    ///
    /// Records in `batch` were seen before anything currently held for the
    /// same user, so they become the base entry and the newer login events are
    /// appended after theirs.
    pub fn restore(&mut self, batch: Batch) {
        for (user_id, mut failed) in batch {
            if let Some(newer) = self.records.remove(&user_id) {
                failed.merge(newer);
            }
            self.records.insert(user_id, failed);
        }
    }
}
