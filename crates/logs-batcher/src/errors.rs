// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types, one enum per concern.

use reqwest::StatusCode;

/// A record that cannot enter the store. Reported to the producer, never retried.
#[derive(Debug, thiserror::Error)]
pub enum InvalidRecordError {
    #[error("UserID is required")]
    MissingUserId,

    #[error("Invalid log payload: {0}")]
    Malformed(String),
}

/// A single failed POST attempt. Retried until the policy runs out.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("endpoint responded with status {0}")]
    Status(StatusCode),
}

/// Final outcome of a delivery that did not succeed.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Failed to send logs to {endpoint} after {attempts} attempts")]
    Exhausted { endpoint: String, attempts: u32 },

    #[error("Failed to serialize batch: {0}")]
    Payload(#[from] serde_json::Error),
}

/// The aggregator service is no longer running.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to send {0} command: aggregator service stopped")]
    Send(&'static str),

    #[error("Failed to receive {0} response: aggregator service stopped")]
    Receive(&'static str),
}

/// Startup configuration problems. Fatal before serving, never raised afterwards.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is not set, and no default value is available")]
    Missing(&'static str),

    #[error("{name} is not a valid integer: {value:?}")]
    InvalidInteger { name: &'static str, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = DeliveryError::Exhausted {
            endpoint: "http://collector/logs".to_string(),
            attempts: 3,
        };
        assert_eq!(
            error.to_string(),
            "Failed to send logs to http://collector/logs after 3 attempts"
        );

        let error = ConfigError::InvalidInteger {
            name: "MAX_RETRIES",
            value: "three".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "MAX_RETRIES is not a valid integer: \"three\""
        );

        let error = TransportError::Status(StatusCode::BAD_GATEWAY);
        assert_eq!(
            error.to_string(),
            "endpoint responded with status 502 Bad Gateway"
        );
    }

    #[test]
    fn test_error_debug() {
        let error = StoreError::Send("put");
        let debug_str = format!("{:?}", error);
        assert!(debug_str.contains("Send"));
    }
}
