// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Actor that owns the [`Aggregator`] and serializes access to it.
//!
//! Ingest requests and the periodic trigger run concurrently. Instead of
//! sharing the aggregator behind a lock, a single service task owns it and
//! applies commands one at a time, in the order they arrive on an unbounded
//! channel. Cloneable [`AggregatorHandle`]s are the only way to reach it.
//!
//! ```text
//!    ┌──────────────┐   ┌──────────────┐
//!    │ POST /log    │   │ timer tick   │
//!    │ (many tasks) │   │ (one task)   │
//!    └──────┬───────┘   └──────┬───────┘
//!           │  Put / Size /    │
//!           │  SnapshotAndClear│
//!           v                  v
//!         ┌──────────────────────┐
//!         │  AggregatorService   │ owns Aggregator
//!         └──────────────────────┘
//! ```
//!
//! Because commands are applied sequentially, `SnapshotAndClear` is a single
//! indivisible step: a `Put` processed before it is in the batch, a `Put`
//! processed after it is in the store for the next batch, and no `Put` can
//! fall between the read and the clear.

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::aggregator::Aggregator;
use crate::errors::StoreError;
use crate::record::{Batch, ValidRecord};

#[derive(Debug)]
pub enum AggregatorCommand {
    /// Insert or merge one record. Replies with the number of users held after the insert.
    Put(ValidRecord, oneshot::Sender<usize>),
    Size(oneshot::Sender<usize>),
    /// Drain the aggregator. Replies with everything it held.
    SnapshotAndClear(oneshot::Sender<Batch>),
    /// Put back a batch that failed delivery.
    Restore(Batch),
    Shutdown,
}

#[derive(Clone, Debug)]
pub struct AggregatorHandle {
    tx: mpsc::UnboundedSender<AggregatorCommand>,
}

impl AggregatorHandle {
    /// Stores a record and returns the number of distinct users held afterwards.
    pub async fn put(&self, record: ValidRecord) -> Result<usize, StoreError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(AggregatorCommand::Put(record, response_tx))
            .map_err(|_| StoreError::Send("put"))?;

        response_rx.await.map_err(|_| StoreError::Receive("put"))
    }

    pub async fn size(&self) -> Result<usize, StoreError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(AggregatorCommand::Size(response_tx))
            .map_err(|_| StoreError::Send("size"))?;

        response_rx.await.map_err(|_| StoreError::Receive("size"))
    }

    /// Captures the full content of the store and empties it in one step.
    pub async fn snapshot_and_clear(&self) -> Result<Batch, StoreError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(AggregatorCommand::SnapshotAndClear(response_tx))
            .map_err(|_| StoreError::Send("snapshot"))?;

        response_rx
            .await
            .map_err(|_| StoreError::Receive("snapshot"))
    }

    pub fn restore(&self, batch: Batch) -> Result<(), StoreError> {
        self.tx
            .send(AggregatorCommand::Restore(batch))
            .map_err(|_| StoreError::Send("restore"))
    }

    pub fn shutdown(&self) -> Result<(), StoreError> {
        self.tx
            .send(AggregatorCommand::Shutdown)
            .map_err(|_| StoreError::Send("shutdown"))
    }
}

pub struct AggregatorService {
    aggregator: Aggregator,
    rx: mpsc::UnboundedReceiver<AggregatorCommand>,
}

impl AggregatorService {
    /// Returns the service (to be spawned) and a handle to talk to it.
    #[must_use]
    pub fn new() -> (Self, AggregatorHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let service = Self {
            aggregator: Aggregator::default(),
            rx,
        };
        (service, AggregatorHandle { tx })
    }

    /// Processes commands until `Shutdown` is received or every handle is dropped.
    pub async fn run(mut self) {
        debug!("Logs aggregator service started");

        while let Some(command) = self.rx.recv().await {
            match command {
                AggregatorCommand::Put(record, response_tx) => {
                    let size = self.aggregator.put(record);
                    if response_tx.send(size).is_err() {
                        debug!("Put response dropped, record stored anyway");
                    }
                }
                AggregatorCommand::Size(response_tx) => {
                    let _ = response_tx.send(self.aggregator.len());
                }
                AggregatorCommand::SnapshotAndClear(response_tx) => {
                    let batch = self.aggregator.snapshot_and_clear();
                    if let Err(batch) = response_tx.send(batch) {
                        // nobody will ship it, keep it for the next flush
                        error!("Failed to send snapshot response - receiver dropped, restoring {} records", batch.len());
                        self.aggregator.restore(batch);
                    }
                }
                AggregatorCommand::Restore(batch) => {
                    debug!("Restoring {} undelivered records", batch.len());
                    self.aggregator.restore(batch);
                }
                AggregatorCommand::Shutdown => {
                    debug!("Logs aggregator service shutting down");
                    break;
                }
            }
        }

        debug!("Logs aggregator service stopped");
    }
}
