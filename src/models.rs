//! Canonical data model for plant-box telemetry.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;

// ---

/// Byte ceiling for the diagnostic copy of an inbound payload.
pub const RAW_PAYLOAD_LIMIT: usize = 500;

/// Appended to a diagnostic payload copy that hit [`RAW_PAYLOAD_LIMIT`].
pub const TRUNCATION_MARKER: &str = "...[truncated]";

/// Display format for record and server timestamps.
pub const DISPLAY_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Ingress path that produced a record. Diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceTag {
    Subscription,
    Push,
    Synthetic,
}

impl SourceTag {
    pub const ALL: [SourceTag; 3] = [Self::Subscription, Self::Push, Self::Synthetic];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Subscription => "subscription",
            Self::Push => "push",
            Self::Synthetic => "synthetic",
        }
    }
}

/// Sensor channels reported by the plant box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Channel {
    Temperature,
    Humidity,
    PlantHeight,
    Moisture1,
    Moisture2,
    Moisture3,
}

impl Channel {
    pub const ALL: [Channel; 6] = [
        Self::Temperature,
        Self::Humidity,
        Self::PlantHeight,
        Self::Moisture1,
        Self::Moisture2,
        Self::Moisture3,
    ];

    /// Canonical name used in serialized records.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Temperature => "temperature",
            Self::Humidity => "humidity",
            Self::PlantHeight => "plantheight",
            Self::Moisture1 => "moisture1",
            Self::Moisture2 => "moisture2",
            Self::Moisture3 => "moisture3",
        }
    }

    /// Keys under `decoded_payload` that carry this channel, in priority order.
    pub const fn aliases(self) -> &'static [&'static str] {
        match self {
            Self::Temperature => &["boxTemperature", "temperature", "temp"],
            Self::Humidity => &["boxHumidity", "humidity"],
            Self::PlantHeight => &["plantHeight", "plantheight", "height"],
            Self::Moisture1 => &["soilMoisture1", "moisture1"],
            Self::Moisture2 => &["soilMoisture2", "moisture2"],
            Self::Moisture3 => &["soilMoisture3", "moisture3"],
        }
    }
}

/// One normalized uplink. Immutable once built by the normalizer.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorRecord {
    // ---
    observed_at: DateTime<Utc>,
    device_id: String,
    fields: BTreeMap<Channel, f64>,
    source: SourceTag,
    raw: String,
}

impl SensorRecord {
    // ---
    pub(crate) fn new(
        observed_at: DateTime<Utc>,
        device_id: String,
        fields: BTreeMap<Channel, f64>,
        source: SourceTag,
        raw: &[u8],
    ) -> Self {
        Self {
            observed_at,
            device_id,
            fields,
            source,
            raw: truncate_raw(raw),
        }
    }

    pub fn observed_at(&self) -> DateTime<Utc> {
        self.observed_at
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Value of a channel, `None` when the uplink did not report it.
    pub fn field(&self, channel: Channel) -> Option<f64> {
        self.fields.get(&channel).copied()
    }

    pub fn source(&self) -> SourceTag {
        self.source
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Render for API consumers, formatting the timestamp in `tz`.
    pub fn view(&self, tz: Tz) -> RecordView {
        // ---
        let channels = Channel::ALL
            .iter()
            .map(|c| (c.name(), self.field(*c)))
            .collect();

        RecordView {
            time: self.observed_at().with_timezone(&tz).format(DISPLAY_FORMAT).to_string(),
            received_at: self.observed_at(),
            device_id: self.device_id.clone(),
            source: self.source,
            channels,
            raw_payload: self.raw().to_owned(),
        }
    }
}

/// Serialized shape of a record returned by the data endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct RecordView {
    pub time: String,
    pub received_at: DateTime<Utc>,
    pub device_id: String,
    pub source: SourceTag,
    #[serde(flatten)]
    pub channels: BTreeMap<&'static str, Option<f64>>,
    pub raw_payload: String,
}

/// Lossy UTF-8 copy of `raw`, cut at [`RAW_PAYLOAD_LIMIT`] bytes on a char boundary.
pub fn truncate_raw(raw: &[u8]) -> String {
    // ---
    let text = String::from_utf8_lossy(raw);
    if text.len() <= RAW_PAYLOAD_LIMIT {
        return text.into_owned();
    }

    let mut cut = RAW_PAYLOAD_LIMIT;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut out = String::with_capacity(cut + TRUNCATION_MARKER.len());
    out.push_str(&text[..cut]);
    out.push_str(TRUNCATION_MARKER);
    out
}
