//! Feed error types

use std::time::Duration;
use thiserror::Error;

/// Why an inbound payload was discarded
#[derive(Error, Debug)]
pub enum MalformedMessage {
    /// Payload is not JSON at all
    #[error("Payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Valid JSON, but not an object
    #[error("Payload is not a JSON object")]
    NotAnObject,

    #[error("Payload has no weight field")]
    MissingWeight,

    #[error("Weight field is not a number: {0}")]
    NonNumericWeight(serde_json::Value),
}

/// Failures surfaced by a pull-style fetch
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// No broker connection within the fetch budget
    #[error("Failed to establish broker connection within {0:?}")]
    ConnectionTimeout(Duration),

    /// Connected, but the sensor has not published a reading
    #[error("Connected but no weight reading received; check the sensor and broker")]
    NoDataReceived,
}
