// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery of captured batches to the remote collector.
//!
//! ```text
//!   Batch
//!     │ serialize once
//!     v
//!   ┌─────────────┐   non-2xx / network error
//!   │ HTTP POST   │ ──────────────────────────┐
//!   └──────┬──────┘                           │
//!          │ 2xx                       wait retry_wait,
//!          v                           up to max_attempts
//!   DeliveryStats                             │
//!          ^                                  │
//!          └──────────────────────────────────┘
//! ```
//!
//! The flusher never touches the store. The caller captures the batch first
//! and decides what to do with it if delivery is exhausted.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::StatusCode;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::Config;
use crate::errors::{DeliveryError, TransportError};
use crate::record::Batch;

/// Fixed-backoff retry bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Pause between two attempts. Not applied after the last one.
    pub wait: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeliveryStats {
    /// From the start of the first attempt to the successful response.
    pub duration: Duration,
    pub status_code: StatusCode,
}

#[async_trait]
pub trait BatchDelivery {
    /// Ships `batch`, retrying as configured. Does not mutate anything but the network.
    async fn deliver(&self, batch: &Batch) -> Result<DeliveryStats, DeliveryError>;
}

/// Posts batches as JSON to a single collector endpoint.
#[derive(Debug, Clone)]
pub struct HttpFlusher {
    client: reqwest::Client,
    endpoint: String,
    retry_policy: RetryPolicy,
    timeout: Duration,
}

impl HttpFlusher {
    #[must_use]
    pub fn new(endpoint: String, retry_policy: RetryPolicy, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .default_headers(default_headers())
            .build()
            .unwrap_or_else(|e| {
                warn!("Unable to build HTTP client: {e}, falling back to defaults");
                reqwest::Client::new()
            });
        HttpFlusher {
            client,
            endpoint,
            retry_policy,
            timeout,
        }
    }

    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.post_endpoint.clone(),
            RetryPolicy {
                max_attempts: config.max_retries,
                wait: config.retry_wait,
            },
            config.request_timeout,
        )
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn send(&self, payload: Bytes) -> Result<StatusCode, TransportError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/json")
            .timeout(self.timeout)
            .body(payload)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(status)
        } else {
            Err(TransportError::Status(status))
        }
    }
}

#[async_trait]
impl BatchDelivery for HttpFlusher {
    async fn deliver(&self, batch: &Batch) -> Result<DeliveryStats, DeliveryError> {
        let payload = Bytes::from(serde_json::to_vec(batch)?);
        let max_attempts = self.retry_policy.max_attempts;
        let start = Instant::now();

        for attempt in 1..=max_attempts {
            debug!(
                "Sending {} records to {}. Attempt {attempt}/{max_attempts}",
                batch.len(),
                self.endpoint
            );
            match self.send(payload.clone()).await {
                Ok(status_code) => {
                    return Ok(DeliveryStats {
                        duration: start.elapsed(),
                        status_code,
                    });
                }
                Err(e) => {
                    warn!("Attempt {attempt}/{max_attempts} to {} failed: {e}", self.endpoint);
                    if attempt < max_attempts {
                        tokio::time::sleep(self.retry_policy.wait).await;
                    }
                }
            }
        }

        Err(DeliveryError::Exhausted {
            endpoint: self.endpoint.clone(),
            attempts: max_attempts,
        })
    }
}

fn default_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        "User-Agent",
        HeaderValue::from_static(concat!("logs-batcher/", env!("CARGO_PKG_VERSION"))),
    );
    headers
}
