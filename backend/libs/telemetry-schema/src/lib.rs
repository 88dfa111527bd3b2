//! Telemetry payload schema shared by the ingest and relay services
//!
//! Defines the typed sensor record persisted to PostgreSQL and the decode
//! step that turns raw transport payloads into it. Malformed payloads fail
//! with a typed [`DecodeError`] instead of leaking half-parsed data into the
//! pipeline.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while decoding an inbound payload
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Missing field in stream entry: {0}")]
    MissingField(&'static str),
}

/// A single sensor reading as published by a device
///
/// Wire format (JSON):
/// ```json
/// {
///   "device_id": "device-042",
///   "timestamp": 1718000000.25,
///   "temperature": 21.5,
///   "humidity": 48.0
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    /// Device that produced the reading
    pub device_id: String,
    /// Device-side epoch timestamp (seconds, fractional)
    pub timestamp: f64,
    /// Temperature in degrees Celsius
    pub temperature: f64,
    /// Relative humidity in percent
    pub humidity: f64,
}

impl SensorReading {
    /// Decode a reading from raw payload bytes.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// Decode a reading from a stream entry's string field.
    pub fn decode_str(payload: &str) -> Result<Self, DecodeError> {
        Ok(serde_json::from_str(payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_well_formed_payload() {
        let payload =
            br#"{"device_id":"device-001","timestamp":1718000000.5,"temperature":22.3,"humidity":51.0}"#;
        let reading = SensorReading::decode(payload).expect("payload should decode");
        assert_eq!(reading.device_id, "device-001");
        assert_eq!(reading.temperature, 22.3);
        assert_eq!(reading.humidity, 51.0);
    }

    #[test]
    fn rejects_truncated_payload() {
        let payload = br#"{"device_id":"device-001","timestamp":17"#;
        assert!(matches!(
            SensorReading::decode(payload),
            Err(DecodeError::Json(_))
        ));
    }

    #[test]
    fn rejects_missing_fields() {
        let payload = br#"{"device_id":"device-001","timestamp":1718000000.5}"#;
        assert!(SensorReading::decode(payload).is_err());
    }

    #[test]
    fn rejects_wrong_field_types() {
        let payload =
            br#"{"device_id":7,"timestamp":"yesterday","temperature":22.3,"humidity":51.0}"#;
        assert!(SensorReading::decode(payload).is_err());
    }

    #[test]
    fn roundtrips_through_json_string() {
        let reading = SensorReading {
            device_id: "device-009".to_string(),
            timestamp: 1718000123.0,
            temperature: -4.5,
            humidity: 80.2,
        };
        let encoded = serde_json::to_string(&reading).expect("reading should serialize");
        assert_eq!(
            SensorReading::decode_str(&encoded).expect("reading should decode"),
            reading
        );
    }
}
