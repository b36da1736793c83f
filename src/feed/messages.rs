//! Sensor Payload Types
//!
//! The scale publishes JSON objects shaped like `{"weight": 842}`. Only the
//! numeric `weight` property is read; every other property is ignored.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use super::error::MalformedMessage;

/// A weight observed on the feed
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WeightReading {
    /// Weight in grams as published by the sensor
    pub grams: f64,
    /// When this client received it
    pub received_at: DateTime<Utc>,
}

impl WeightReading {
    /// Reading received just now
    pub fn now(grams: f64) -> Self {
        Self {
            grams,
            received_at: Utc::now(),
        }
    }
}

/// Extract the weight from a raw payload
pub fn decode_weight(payload: &[u8]) -> Result<f64, MalformedMessage> {
    let value: Value = serde_json::from_slice(payload)?;
    let object = value.as_object().ok_or(MalformedMessage::NotAnObject)?;
    let weight = object.get("weight").ok_or(MalformedMessage::MissingWeight)?;

    weight
        .as_f64()
        .ok_or_else(|| MalformedMessage::NonNumericWeight(weight.clone()))
}
