//! `rumqttc`-backed broker sessions.
//!
//! Each session owns its own client/event loop pair, so switching transport
//! variant is a matter of opening the next session with different options.
//! Closing sends DISCONNECT on a live session; dropping the event loop then
//! closes the socket.

use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubscribeReasonCode, Transport,
};
use tokio::time::timeout;
use tracing::{debug, trace};

use super::{Broker, Session, TransportEvent, TransportVariant};
use crate::error::ConnectionError;

// ---

const REQUEST_CAPACITY: usize = 16;

/// Time allowed to flush DISCONNECT before the socket is dropped.
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct MqttSettings {
    // ---
    pub host: String,
    pub port: u16,
    /// Full `ws://` URL used by the websocket variant.
    pub ws_url: String,
    pub username: String,
    pub password: String,
    pub client_id: String,
    pub keep_alive: Duration,
}

#[derive(Debug, Clone)]
pub struct MqttBroker {
    settings: MqttSettings,
}

impl MqttBroker {
    pub fn new(settings: MqttSettings) -> Self {
        Self { settings }
    }

    fn options(&self, variant: TransportVariant) -> Result<MqttOptions, ConnectionError> {
        // ---
        let s = &self.settings;
        let mut options = match variant {
            TransportVariant::Tcp => MqttOptions::new(&s.client_id, &s.host, s.port),
            TransportVariant::WebSocket => {
                let port = ws_port(&s.ws_url)?;
                let mut options = MqttOptions::new(&s.client_id, &s.ws_url, port);
                options.set_transport(Transport::Ws);
                options
            }
        };
        options
            .set_credentials(&s.username, &s.password)
            .set_keep_alive(s.keep_alive)
            .set_clean_session(true);
        Ok(options)
    }
}

impl Broker for MqttBroker {
    type Session = MqttSession;

    fn open(&self, variant: TransportVariant) -> Result<MqttSession, ConnectionError> {
        // ---
        let options = self.options(variant)?;
        debug!(
            "Opening {} session to {:?} as {}",
            variant,
            options.broker_address(),
            self.settings.client_id
        );
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        Ok(MqttSession {
            client,
            eventloop,
            connected: false,
        })
    }
}

pub struct MqttSession {
    client: AsyncClient,
    eventloop: EventLoop,
    /// CONNACK accepted and no error since. Polling a failed event loop
    /// would reconnect, so `close` only flushes while this holds.
    connected: bool,
}

impl Session for MqttSession {
    async fn subscribe(&mut self, topic: &str) -> Result<(), ConnectionError> {
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| ConnectionError::TransportRejected(e.to_string()))
    }

    async fn next_event(&mut self) -> TransportEvent {
        // ---
        let event = self.poll_event().await;
        self.connected = match event {
            TransportEvent::Connected => true,
            TransportEvent::Disconnected(_) => false,
            _ => self.connected,
        };
        event
    }

    async fn close(mut self) {
        // ---
        if !self.connected || self.client.try_disconnect().is_err() {
            return;
        }
        let flushed = timeout(DISCONNECT_GRACE, async {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
        if flushed.is_err() {
            debug!("DISCONNECT not flushed within {:?}", DISCONNECT_GRACE);
        }
    }
}

impl MqttSession {
    async fn poll_event(&mut self) -> TransportEvent {
        // ---
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    return if ack.code == ConnectReturnCode::Success {
                        TransportEvent::Connected
                    } else {
                        TransportEvent::Disconnected(ConnectionError::HandshakeFailed(format!(
                            "{:?}",
                            ack.code
                        )))
                    };
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    let refused = ack
                        .return_codes
                        .iter()
                        .any(|code| matches!(code, SubscribeReasonCode::Failure));
                    return if refused {
                        TransportEvent::Disconnected(ConnectionError::TransportRejected(
                            "subscription refused by broker".into(),
                        ))
                    } else {
                        TransportEvent::Subscribed
                    };
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    trace!("Uplink on {} ({} bytes)", publish.topic, publish.payload.len());
                    return TransportEvent::Message(publish.payload.to_vec());
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    return TransportEvent::Disconnected(ConnectionError::TransportRejected(
                        "broker closed the session".into(),
                    ));
                }
                Ok(_) => continue,
                Err(e) => return TransportEvent::Disconnected(map_error(e)),
            }
        }
    }
}


fn map_error(err: rumqttc::ConnectionError) -> ConnectionError {
    match err {
        rumqttc::ConnectionError::ConnectionRefused(code) => {
            ConnectionError::HandshakeFailed(format!("{code:?}"))
        }
        rumqttc::ConnectionError::NotConnAck(packet) => {
            ConnectionError::HandshakeFailed(format!("expected CONNACK, got {packet:?}"))
        }
        other => ConnectionError::TransportRejected(other.to_string()),
    }
}

/// Port of a `ws://host[:port]/path` URL, 80 when omitted.
fn ws_port(url: &str) -> Result<u16, ConnectionError> {
    // ---
    let rest = url.strip_prefix("ws://").ok_or_else(|| {
        ConnectionError::TransportRejected(format!("websocket URL must start with ws://: {url}"))
    })?;
    let authority = rest.split('/').next().unwrap_or_default();
    match authority.rsplit_once(':') {
        Some((_, port)) => port.parse().map_err(|_| {
            ConnectionError::TransportRejected(format!("invalid port in websocket URL: {url}"))
        }),
        None => Ok(80),
    }
}
