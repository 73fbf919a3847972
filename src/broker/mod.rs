//! Broker connectivity: connection state, transport seam and backoff.
//!
//! The transport library's callbacks are folded into [`TransportEvent`]s
//! pulled by the [`ConnectionManager`] control loop, so the state machine
//! never sees the shape of any particular client library.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::sleep;

use crate::error::ConnectionError;

mod manager;
mod mqtt;

pub use manager::{ConnectionManager, ManagerSettings};
pub use mqtt::{MqttBroker, MqttSettings};

// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    BackingOff,
}

/// Low-level carrier for the MQTT session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportVariant {
    Tcp,
    WebSocket,
}

impl TransportVariant {
    pub const fn alternate(self) -> Self {
        match self {
            Self::Tcp => Self::WebSocket,
            Self::WebSocket => Self::Tcp,
        }
    }
}

impl fmt::Display for TransportVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::WebSocket => f.write_str("websocket"),
        }
    }
}

/// Connection status as published to the diagnostics surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub transport: TransportVariant,
    pub consecutive_failures: u32,
    pub since: DateTime<Utc>,
}

impl Default for ConnectionSnapshot {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            transport: TransportVariant::Tcp,
            consecutive_failures: 0,
            since: Utc::now(),
        }
    }
}

/// Something that happened on a broker session.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Broker accepted the connect handshake.
    Connected,
    /// Broker acknowledged the topic subscription.
    Subscribed,
    /// Uplink published on the subscribed topic.
    Message(Vec<u8>),
    /// Session is gone; the manager must open a new one.
    Disconnected(ConnectionError),
}

/// Factory for broker sessions over a given transport.
pub trait Broker: Send + Sync + 'static {
    type Session: Session;

    /// Prepare a session. Network I/O starts on the first `next_event`.
    fn open(&self, variant: TransportVariant) -> Result<Self::Session, ConnectionError>;
}

/// One live (or connecting) broker session.
pub trait Session: Send {
    fn subscribe(&mut self, topic: &str) -> impl Future<Output = Result<(), ConnectionError>> + Send;

    /// Drive the session until the next event of interest.
    fn next_event(&mut self) -> impl Future<Output = TransportEvent> + Send;

    /// Tear down the session and its socket.
    fn close(self) -> impl Future<Output = ()> + Send;
}

/// Retry timer between failed connection attempts.
///
/// Doubles from `base` up to `cap`; with `cap == base` the interval is fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
}

impl Backoff {
    // ---
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap: cap.max(base),
        }
    }

    pub fn fixed(interval: Duration) -> Self {
        Self::new(interval, interval)
    }

    /// Delay to apply after `failures` consecutive failures.
    pub fn delay(&self, failures: u32) -> Duration {
        let doublings = failures.saturating_sub(1).min(16);
        self.base.saturating_mul(1 << doublings).min(self.cap)
    }

    /// Sleep for [`Self::delay`], or return early with `interrupt`'s output.
    pub async fn wait<F: Future>(&self, failures: u32, interrupt: F) -> Option<F::Output> {
        tokio::select! {
            _ = sleep(self.delay(failures)) => None,
            out = interrupt => Some(out),
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_fixed_backoff_never_grows() {
        // ---
        let backoff = Backoff::fixed(Duration::from_secs(10));
        for failures in 0..50 {
            assert_eq!(backoff.delay(failures), Duration::from_secs(10));
        }
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        // ---
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(2), Duration::from_secs(2));
        assert_eq!(backoff.delay(5), Duration::from_secs(16));
        assert_eq!(backoff.delay(6), Duration::from_secs(30));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_cap_below_base_is_raised() {
        // ---
        let backoff = Backoff::new(Duration::from_secs(10), Duration::from_secs(1));
        assert_eq!(backoff.delay(3), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_is_interruptible() {
        // ---
        let backoff = Backoff::fixed(Duration::from_secs(10));

        let started = tokio::time::Instant::now();
        assert_eq!(backoff.wait(1, std::future::pending::<()>()).await, None);
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(started.elapsed() < Duration::from_secs(11));

        let started = tokio::time::Instant::now();
        assert_eq!(backoff.wait(1, async { 7 }).await, Some(7));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_transport_alternates() {
        // ---
        assert_eq!(TransportVariant::Tcp.alternate(), TransportVariant::WebSocket);
        assert_eq!(TransportVariant::WebSocket.alternate().alternate(), TransportVariant::WebSocket);
        assert_eq!(TransportVariant::WebSocket.to_string(), "websocket");
    }
}
