// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Activity log records and their merge rules.
//!
//! A [`LogRecord`] is one activity report for a user, decoded from the JSON body
//! of an ingest request. Decoding is lenient: every field is optional and a
//! field with the wrong type decodes to its zero value (per element for the
//! login list), so only a missing
//! `user_id` can make a record unusable. [`validate`] turns a decoded record into
//! a [`ValidRecord`], the only type the aggregation store accepts.
//!
//! # Wire format
//!
//! ```json
//! {
//!   "user_id": 42,
//!   "total": 1.5,
//!   "title": "title",
//!   "meta": {
//!     "logins": [{"time": "2020-08-08T01:52:50Z", "ip": "0.0.0.0"}],
//!     "phone_numbers": {"home": "555-1212", "mobile": "123-5555"}
//!   },
//!   "completed": false
//! }
//! ```

use serde::de::{DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::errors::InvalidRecordError;

/// Identifier records are aggregated by. Zero means "not set".
pub type UserId = i64;

/// All records captured for one delivery, keyed by user.
///
/// Serializes to a JSON object whose keys are the user ids as strings.
pub type Batch = BTreeMap<UserId, LogRecord>;

/// One login event. Opaque strings, never parsed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Login {
    #[serde(default, deserialize_with = "lenient")]
    pub time: String,
    #[serde(default, deserialize_with = "lenient")]
    pub ip: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhoneNumbers {
    #[serde(default, deserialize_with = "lenient")]
    pub home: String,
    #[serde(default, deserialize_with = "lenient")]
    pub mobile: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    /// Append-only across merges.
    #[serde(default, deserialize_with = "lenient_seq")]
    pub logins: Vec<Login>,
    #[serde(default, deserialize_with = "lenient")]
    pub phone_numbers: PhoneNumbers,
}

/// One activity report for a user.
///
/// Only `user_id` and `meta.logins` mean anything to the batcher. The other
/// fields are carried through to the collector untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    #[serde(default, deserialize_with = "lenient")]
    pub user_id: UserId,
    #[serde(default, deserialize_with = "lenient")]
    pub total: f64,
    #[serde(default, deserialize_with = "lenient")]
    pub title: String,
    #[serde(default, deserialize_with = "lenient")]
    pub meta: Meta,
    #[serde(default, deserialize_with = "lenient")]
    pub completed: bool,
}

impl LogRecord {
    /// Decodes a record from a request body.
    ///
    /// The body must be a JSON object; the fields inside it are decoded
    /// leniently.
    pub fn from_slice(body: &[u8]) -> Result<Self, InvalidRecordError> {
        serde_json::from_slice(body).map_err(|e| InvalidRecordError::Malformed(e.to_string()))
    }

    /// Folds a later record for the same user into this one.
    ///
    /// Login events are appended in arrival order. Every other field keeps the
    /// value it had when the user was first seen.
    pub fn merge(&mut self, later: LogRecord) {
        self.meta.logins.extend(later.meta.logins);
    }
}

/// A record that passed [`validate`]. Guaranteed to have a non-zero user id.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidRecord(LogRecord);

impl ValidRecord {
    #[must_use]
    pub fn user_id(&self) -> UserId {
        self.0.user_id
    }

    #[must_use]
    pub fn into_inner(self) -> LogRecord {
        self.0
    }
}

impl AsRef<LogRecord> for ValidRecord {
    fn as_ref(&self) -> &LogRecord {
        &self.0
    }
}

/// Checks the one required field of a record.
pub fn validate(record: LogRecord) -> Result<ValidRecord, InvalidRecordError> {
    if record.user_id == 0 {
        return Err(InvalidRecordError::MissingUserId);
    }
    Ok(ValidRecord(record))
}

// Falls back to the zero value when a present field has the wrong shape.
fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(T::deserialize(value).unwrap_or_default())
}

// Like `lenient`, per element: a malformed entry becomes a zero value and
// does not take its well-formed neighbours with it.
fn lenient_seq<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Array(items) => Ok(items
            .into_iter()
            .map(|item| T::deserialize(item).unwrap_or_default())
            .collect()),
        _ => Ok(Vec::new()),
    }
}
