//! Uplink payload → [`SensorRecord`] transform.
//!
//! Pure function, no logging: callers decide how loudly a rejected payload
//! should be reported. The identity fields (`received_at` and
//! `end_device_ids.device_id`) are mandatory; every sensor channel is read
//! on its own and simply left out when missing or not a finite number.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value};

use crate::error::DecodeError;
use crate::models::{Channel, SensorRecord, SourceTag};

// ---

pub fn normalize(raw: &[u8], source: SourceTag) -> Result<SensorRecord, DecodeError> {
    // ---
    let doc: Value =
        serde_json::from_slice(raw).map_err(|e| DecodeError::InvalidEncoding(e.to_string()))?;
    // Well-formed JSON of the wrong shape is a validation failure, not an
    // encoding one.
    let obj = doc
        .as_object()
        .ok_or(DecodeError::MissingField("received_at"))?;

    let received_at = obj
        .get("received_at")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingField("received_at"))?;
    let observed_at = parse_timestamp(received_at)?;

    let device_id = obj
        .get("end_device_ids")
        .and_then(|ids| ids.get("device_id"))
        .and_then(Value::as_str)
        .filter(|id| !id.trim().is_empty())
        .ok_or(DecodeError::MissingField("end_device_ids.device_id"))?;

    let decoded = obj
        .get("uplink_message")
        .and_then(|up| up.get("decoded_payload"))
        .and_then(Value::as_object)
        .ok_or(DecodeError::MissingField("uplink_message.decoded_payload"))?;

    Ok(SensorRecord::new(
        observed_at,
        device_id.to_string(),
        extract_channels(decoded),
        source,
        raw,
    ))
}

/// Parse an ISO-8601 instant; a value without an offset is taken as UTC.
fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, DecodeError> {
    // ---
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| DecodeError::BadTimestamp(format!("{text:?}: {e}")))
}

fn extract_channels(decoded: &Map<String, Value>) -> BTreeMap<Channel, f64> {
    // ---
    Channel::ALL
        .iter()
        .filter_map(|channel| {
            channel
                .aliases()
                .iter()
                .find_map(|key| decoded.get(*key).and_then(Value::as_f64))
                .filter(|v| v.is_finite())
                .map(|v| (*channel, v))
        })
        .collect()
}
