//! Ingestion context shared by every ingress path.
//!
//! Owns the record store, the counters, the runtime enable flag and the
//! published connection status. The connection manager and the HTTP
//! handlers each hold an `Arc<IngestContext>`; nothing here is global.

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use chrono_tz::Tz;
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::broker::ConnectionSnapshot;
use crate::error::{ControlError, PushError};
use crate::models::{SensorRecord, SourceTag};
use crate::normalize::normalize;
use crate::store::RecordStore;
use crate::telemetry::Counters;

// ---

/// Device id carried by records built by [`IngestContext::inject_test_record`].
pub const TEST_DEVICE_ID: &str = "test-device";

#[derive(Debug)]
pub struct IngestContext {
    // ---
    store: RecordStore,
    counters: Counters,
    connection: watch::Sender<ConnectionSnapshot>,
    enabled: watch::Sender<bool>,
    has_credentials: bool,
    display_tz: Tz,
}

impl IngestContext {
    // ---
    pub fn new(capacity: usize, enabled: bool, display_tz: Tz) -> Self {
        let (connection, _) = watch::channel(ConnectionSnapshot::default());
        let (enabled, _) = watch::channel(enabled);
        Self {
            store: RecordStore::new(capacity),
            counters: Counters::new(),
            connection,
            enabled,
            has_credentials: true,
            display_tz,
        }
    }

    /// Record whether broker credentials were supplied. Without them the
    /// ingestion switch can be turned off but never on.
    pub fn with_broker_credentials(mut self, present: bool) -> Self {
        self.has_credentials = present;
        self
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn display_tz(&self) -> Tz {
        self.display_tz
    }

    /// Latest connection status published by the manager.
    pub fn connection(&self) -> ConnectionSnapshot {
        self.connection.borrow().clone()
    }

    pub(crate) fn update_connection(&self, update: impl FnOnce(&mut ConnectionSnapshot)) {
        self.connection.send_modify(update);
    }

    pub fn is_enabled(&self) -> bool {
        *self.enabled.borrow()
    }

    /// Flip the ingestion switch, returning the previous value.
    pub fn set_enabled(&self, enabled: bool) -> Result<bool, ControlError> {
        if enabled && !self.has_credentials {
            return Err(ControlError::MissingCredentials);
        }
        Ok(self.enabled.send_replace(enabled))
    }

    pub fn watch_enabled(&self) -> watch::Receiver<bool> {
        self.enabled.subscribe()
    }

    /// Entry point for uplinks delivered by the broker subscription.
    ///
    /// Fire-and-forget: failures are logged and counted, never returned.
    pub fn on_subscription_message(&self, raw: &[u8]) {
        self.counters.inc_received();
        // failures are logged and counted inside `ingest`
        let _ = self.ingest(raw, SourceTag::Subscription);
    }

    /// Entry point for uplinks pushed to us by the network server.
    pub fn on_external_push(&self, raw: &[u8]) -> Result<Arc<SensorRecord>, PushError> {
        self.ingest(raw, SourceTag::Push)
    }

    /// Run a fixed synthetic uplink, stamped now, through the push path.
    pub fn inject_test_record(&self) -> Result<Arc<SensorRecord>, PushError> {
        // ---
        let payload = json!({
            "received_at": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            "end_device_ids": { "device_id": TEST_DEVICE_ID },
            "uplink_message": {
                "decoded_payload": {
                    "boxTemperature": 22.5,
                    "boxHumidity": 55.0,
                    "plantHeight": 14.0,
                    "soilMoisture1": 41.0,
                    "soilMoisture2": 43.0,
                    "soilMoisture3": 45.0
                }
            }
        });
        self.ingest(payload.to_string().as_bytes(), SourceTag::Synthetic)
    }

    fn ingest(&self, raw: &[u8], source: SourceTag) -> Result<Arc<SensorRecord>, PushError> {
        // ---
        let record = match normalize(raw, source) {
            Ok(record) => Arc::new(record),
            Err(e) => {
                warn!(source = source.as_str(), kind = e.kind(), "Dropping uplink: {}", e);
                self.counters.record_decode_failure(source, &e, raw);
                return Err(e.into());
            }
        };

        if let Err(e) = self.store.append(Arc::clone(&record)) {
            self.counters.record_store_failure(source, &e, raw);
            return Err(e.into());
        }
        self.counters.inc_processed(source);

        debug!(
            source = source.as_str(),
            "New data received from {}",
            record.device_id()
        );
        Ok(record)
    }
}
