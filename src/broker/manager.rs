//! Connection manager: keeps exactly one broker subscription alive.
//!
//! Runs as a single task for the lifetime of the process. Attempts are
//! strictly sequential, so at most one session exists at any time. Every
//! wait (handshake, live session, backoff) is raced against shutdown and
//! the runtime enable flag.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{Backoff, Broker, ConnectionState, Session, TransportEvent, TransportVariant};
use crate::error::ConnectionError;
use crate::ingest::IngestContext;

// ---

/// Consecutive failures on one transport before switching to the other.
const FAILURES_PER_TRANSPORT: u32 = 2;

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub topic: String,
    pub connect_timeout: Duration,
    pub backoff: Backoff,
    pub initial_transport: TransportVariant,
}

pub struct ConnectionManager<B: Broker> {
    // ---
    broker: B,
    ctx: Arc<IngestContext>,
    settings: ManagerSettings,
    enabled: watch::Receiver<bool>,
    cancel: CancellationToken,
    transport: TransportVariant,
    failures: u32,
}

enum Halt {
    Shutdown,
    Disabled,
}

enum Outcome {
    Halted(Halt),
    /// Never reached `connected`.
    Failed(ConnectionError),
    /// Was `connected`, then lost the session.
    Dropped(ConnectionError),
}

enum Step {
    Halted(Halt),
    Event(TransportEvent),
}

impl<B: Broker> ConnectionManager<B> {
    // ---
    pub fn new(
        broker: B,
        ctx: Arc<IngestContext>,
        settings: ManagerSettings,
        cancel: CancellationToken,
    ) -> Self {
        let enabled = ctx.watch_enabled();
        let transport = settings.initial_transport;
        Self {
            broker,
            ctx,
            settings,
            enabled,
            cancel,
            transport,
            failures: 0,
        }
    }

    /// Drive the state machine until `cancel` fires.
    pub async fn run(mut self) {
        // ---
        info!(topic = %self.settings.topic, "Connection manager started");
        let backoff = self.settings.backoff;

        while !self.cancel.is_cancelled() {
            if !*self.enabled.borrow_and_update() {
                self.set_state(ConnectionState::Disconnected);
                info!("Ingestion disabled, connection manager parked");
                if !wait_until_enabled(&self.cancel, &mut self.enabled).await {
                    break;
                }
                info!("Ingestion enabled, resuming");
                self.failures = 0;
                continue;
            }

            match self.attempt().await {
                Outcome::Halted(Halt::Shutdown) => break,
                Outcome::Halted(Halt::Disabled) => continue,
                Outcome::Failed(err) => self.on_failure(err),
                Outcome::Dropped(err) => {
                    warn!("Broker session lost: {}", err);
                    self.ctx.counters().record_connection_failure(&err);
                    self.set_state(ConnectionState::Disconnected);
                }
            }

            self.set_state(ConnectionState::BackingOff);
            let interrupt = halted(&self.cancel, &mut self.enabled);
            match backoff.wait(self.failures.max(1), interrupt).await {
                None | Some(Halt::Disabled) => {}
                Some(Halt::Shutdown) => break,
            }
        }

        self.set_state(ConnectionState::Disconnected);
        info!("Connection manager stopped");
    }

    async fn attempt(&mut self) -> Outcome {
        // ---
        self.set_state(ConnectionState::Connecting);
        info!(
            transport = %self.transport,
            failures = self.failures,
            "Connecting to broker"
        );

        let mut session = match self.broker.open(self.transport) {
            Ok(session) => session,
            Err(e) => return Outcome::Failed(e),
        };

        let timeout = self.settings.connect_timeout;
        let result = {
            let pending = tokio::time::timeout(
                timeout,
                handshake(&mut session, &self.settings.topic, &self.ctx),
            );
            tokio::select! {
                halt = halted(&self.cancel, &mut self.enabled) => Err(halt),
                res = pending => Ok(res),
            }
        };

        let failure = match result {
            Err(halt) => {
                session.close().await;
                return Outcome::Halted(halt);
            }
            Ok(Err(_elapsed)) => ConnectionError::Timeout(timeout),
            Ok(Ok(Err(e))) => e,
            Ok(Ok(Ok(()))) => {
                self.failures = 0;
                self.set_state(ConnectionState::Connected);
                info!(
                    transport = %self.transport,
                    "Connected to broker, subscribed to {}",
                    self.settings.topic
                );
                return self.pump(session).await;
            }
        };

        session.close().await;
        Outcome::Failed(failure)
    }

    /// Forward uplinks until the session drops or we are told to stop.
    async fn pump(&mut self, mut session: B::Session) -> Outcome {
        // ---
        loop {
            let step = tokio::select! {
                halt = halted(&self.cancel, &mut self.enabled) => Step::Halted(halt),
                event = session.next_event() => Step::Event(event),
            };

            match step {
                Step::Halted(halt) => {
                    session.close().await;
                    return Outcome::Halted(halt);
                }
                Step::Event(TransportEvent::Message(payload)) => {
                    self.ctx.on_subscription_message(&payload);
                }
                Step::Event(TransportEvent::Disconnected(err)) => {
                    session.close().await;
                    return Outcome::Dropped(err);
                }
                Step::Event(TransportEvent::Connected | TransportEvent::Subscribed) => {}
            }
        }
    }

    fn on_failure(&mut self, err: ConnectionError) {
        // ---
        self.failures = self.failures.saturating_add(1);
        warn!(
            transport = %self.transport,
            failures = self.failures,
            "Broker connection failed: {}",
            err
        );
        self.ctx.counters().record_connection_failure(&err);

        if self.failures % FAILURES_PER_TRANSPORT == 0 {
            let next = self.transport.alternate();
            info!("Switching transport {} -> {}", self.transport, next);
            self.transport = next;
        }
    }

    fn set_state(&self, state: ConnectionState) {
        // ---
        let transport = self.transport;
        let failures = self.failures;
        self.ctx.update_connection(|snap| {
            if snap.state != state {
                snap.since = Utc::now();
            }
            snap.state = state;
            snap.transport = transport;
            snap.consecutive_failures = failures;
        });
    }
}

/// Wait for CONNACK, subscribe, then wait for SUBACK.
async fn handshake<S: Session>(
    session: &mut S,
    topic: &str,
    ctx: &IngestContext,
) -> Result<(), ConnectionError> {
    // ---
    loop {
        match session.next_event().await {
            TransportEvent::Connected => break,
            TransportEvent::Disconnected(e) => return Err(e),
            TransportEvent::Subscribed => {}
            TransportEvent::Message(payload) => ctx.on_subscription_message(&payload),
        }
    }

    session.subscribe(topic).await?;

    loop {
        match session.next_event().await {
            TransportEvent::Subscribed => return Ok(()),
            TransportEvent::Disconnected(e) => return Err(e),
            TransportEvent::Connected => {}
            TransportEvent::Message(payload) => ctx.on_subscription_message(&payload),
        }
    }
}

/// Resolves when shutdown is requested or ingestion gets disabled.
async fn halted(cancel: &CancellationToken, enabled: &mut watch::Receiver<bool>) -> Halt {
    // ---
    let disabled = async { enabled.wait_for(|on| !*on).await.is_ok() };
    tokio::select! {
        _ = cancel.cancelled() => Halt::Shutdown,
        true = disabled => Halt::Disabled,
    }
}

/// Park until re-enabled. `false` means shutdown came first.
async fn wait_until_enabled(
    cancel: &CancellationToken,
    enabled: &mut watch::Receiver<bool>,
) -> bool {
    // ---
    let resumed = async { enabled.wait_for(|on| *on).await.is_ok() };
    tokio::select! {
        _ = cancel.cancelled() => false,
        true = resumed => true,
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::broker::ConnectionSnapshot;
    use crate::models::SourceTag;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::time::sleep;

    const TOPIC: &str = "v3/plant-data@ttn/devices/+/up";
    const UPLINK: &str = r#"{"received_at":"2025-05-15T18:55:49Z","end_device_ids":{"device_id":"d1"},"uplink_message":{"decoded_payload":{"boxTemperature":22}}}"#;

    /// What the next `open` call produces.
    enum Script {
        Refuse,
        Events(Vec<TransportEvent>),
    }

    #[derive(Default)]
    struct Probe {
        opens: Mutex<Vec<TransportVariant>>,
        subscriptions: Mutex<Vec<String>>,
        live: AtomicUsize,
        max_live: AtomicUsize,
    }

    struct ScriptedBroker {
        scripts: Mutex<VecDeque<Script>>,
        probe: Arc<Probe>,
    }

    impl ScriptedBroker {
        fn new(scripts: Vec<Script>) -> (Self, Arc<Probe>) {
            let probe = Arc::new(Probe::default());
            let broker = Self {
                scripts: Mutex::new(scripts.into()),
                probe: Arc::clone(&probe),
            };
            (broker, probe)
        }
    }

    impl Broker for ScriptedBroker {
        type Session = ScriptedSession;

        fn open(&self, variant: TransportVariant) -> Result<ScriptedSession, ConnectionError> {
            // ---
            self.probe.opens.lock().unwrap().push(variant);
            let script = self.scripts.lock().unwrap().pop_front();
            let events: VecDeque<TransportEvent> = match script {
                Some(Script::Events(events)) => events.into(),
                Some(Script::Refuse) | None => {
                    return Err(ConnectionError::TransportRejected("refused".into()))
                }
            };
            let live = self.probe.live.fetch_add(1, Ordering::SeqCst) + 1;
            self.probe.max_live.fetch_max(live, Ordering::SeqCst);
            Ok(ScriptedSession {
                events,
                probe: Arc::clone(&self.probe),
            })
        }
    }

    struct ScriptedSession {
        events: VecDeque<TransportEvent>,
        probe: Arc<Probe>,
    }

    impl Session for ScriptedSession {
        async fn subscribe(&mut self, topic: &str) -> Result<(), ConnectionError> {
            self.probe.subscriptions.lock().unwrap().push(topic.to_string());
            Ok(())
        }

        async fn next_event(&mut self) -> TransportEvent {
            match self.events.pop_front() {
                Some(event) => event,
                None => std::future::pending().await,
            }
        }

        async fn close(self) {}
    }

    impl Drop for ScriptedSession {
        fn drop(&mut self) {
            self.probe.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn settings() -> ManagerSettings {
        ManagerSettings {
            topic: TOPIC.to_string(),
            connect_timeout: Duration::from_secs(10),
            backoff: Backoff::fixed(Duration::from_secs(10)),
            initial_transport: TransportVariant::Tcp,
        }
    }

    fn healthy() -> Script {
        Script::Events(vec![TransportEvent::Connected, TransportEvent::Subscribed])
    }

    fn spawn_manager(
        scripts: Vec<Script>,
        enabled: bool,
    ) -> (
        Arc<IngestContext>,
        Arc<Probe>,
        CancellationToken,
        tokio::task::JoinHandle<()>,
    ) {
        // ---
        let ctx = Arc::new(IngestContext::new(100, enabled, chrono_tz::UTC));
        let (broker, probe) = ScriptedBroker::new(scripts);
        let cancel = CancellationToken::new();
        let manager = ConnectionManager::new(broker, Arc::clone(&ctx), settings(), cancel.clone());
        let handle = tokio::spawn(manager.run());
        (ctx, probe, cancel, handle)
    }

    fn state(ctx: &IngestContext) -> ConnectionSnapshot {
        ctx.connection()
    }

    #[tokio::test(start_paused = true)]
    async fn test_connects_subscribes_and_dispatches() {
        // ---
        let (ctx, probe, cancel, handle) = spawn_manager(
            vec![Script::Events(vec![
                TransportEvent::Connected,
                TransportEvent::Subscribed,
                TransportEvent::Message(UPLINK.as_bytes().to_vec()),
                TransportEvent::Message(b"garbage".to_vec()),
            ])],
            true,
        );

        sleep(Duration::from_secs(1)).await;

        assert_eq!(state(&ctx).state, ConnectionState::Connected);
        assert_eq!(*probe.subscriptions.lock().unwrap(), vec![TOPIC.to_string()]);
        assert_eq!(ctx.counters().received(), 2);
        assert_eq!(ctx.counters().processed(SourceTag::Subscription), 1);
        assert_eq!(ctx.store().len(), 1);

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(state(&ctx).state, ConnectionState::Disconnected);
        assert_eq!(probe.live.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_alternates_transport_every_two_failures() {
        // ---
        let (ctx, probe, cancel, handle) = spawn_manager(vec![], true);

        sleep(Duration::from_secs(75)).await;
        cancel.cancel();
        handle.await.unwrap();

        let opens = probe.opens.lock().unwrap().clone();
        assert!(opens.len() >= 6, "only {} attempts", opens.len());
        assert_eq!(
            &opens[..6],
            &[
                TransportVariant::Tcp,
                TransportVariant::Tcp,
                TransportVariant::WebSocket,
                TransportVariant::WebSocket,
                TransportVariant::Tcp,
                TransportVariant::Tcp,
            ]
        );
        assert!(ctx.counters().snapshot().connection_failures >= 6);
        assert_eq!(
            ctx.counters().last_failure().unwrap().error_kind,
            "transport_rejected"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout_backs_off() {
        // ---
        // session opens but the broker never acknowledges
        let (ctx, probe, cancel, handle) = spawn_manager(vec![Script::Events(vec![])], true);

        sleep(Duration::from_secs(11)).await;
        let snap = state(&ctx);
        assert_eq!(snap.state, ConnectionState::BackingOff);
        assert_eq!(snap.consecutive_failures, 1);
        assert_eq!(ctx.counters().last_failure().unwrap().error_kind, "timeout");
        assert_eq!(probe.live.load(Ordering::SeqCst), 0);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cuts_handshake_wait_short() {
        // ---
        let (ctx, probe, cancel, handle) = spawn_manager(
            vec![Script::Events(vec![
                TransportEvent::Connected,
                TransportEvent::Disconnected(ConnectionError::HandshakeFailed("bad auth".into())),
            ])],
            true,
        );

        // well inside the 10s connect timeout
        sleep(Duration::from_millis(100)).await;
        let snap = state(&ctx);
        assert_eq!(snap.state, ConnectionState::BackingOff);
        assert_eq!(snap.consecutive_failures, 1);
        assert_eq!(
            ctx.counters().last_failure().unwrap().error_kind,
            "handshake_failed"
        );
        assert_eq!(probe.live.load(Ordering::SeqCst), 0);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribes_after_reconnect() {
        // ---
        let (ctx, probe, cancel, handle) = spawn_manager(
            vec![
                Script::Events(vec![
                    TransportEvent::Connected,
                    TransportEvent::Subscribed,
                    TransportEvent::Disconnected(ConnectionError::TransportRejected(
                        "reset by peer".into(),
                    )),
                ]),
                healthy(),
            ],
            true,
        );

        sleep(Duration::from_secs(15)).await;

        assert_eq!(state(&ctx).state, ConnectionState::Connected);
        assert_eq!(probe.subscriptions.lock().unwrap().len(), 2);
        // a dropped session is not a failed attempt, so no transport switch
        assert_eq!(
            *probe.opens.lock().unwrap(),
            vec![TransportVariant::Tcp, TransportVariant::Tcp]
        );
        assert_eq!(probe.max_live.load(Ordering::SeqCst), 1);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_more_than_one_session() {
        // ---
        let scripts = (0..6)
            .map(|_| {
                Script::Events(vec![
                    TransportEvent::Connected,
                    TransportEvent::Disconnected(ConnectionError::HandshakeFailed("nope".into())),
                ])
            })
            .collect();
        let (_ctx, probe, cancel, handle) = spawn_manager(scripts, true);

        sleep(Duration::from_secs(120)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert!(probe.opens.lock().unwrap().len() >= 6);
        assert_eq!(probe.max_live.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_closes_session_and_parks() {
        // ---
        let (ctx, probe, cancel, handle) = spawn_manager(vec![healthy(), healthy()], true);

        sleep(Duration::from_secs(1)).await;
        assert_eq!(state(&ctx).state, ConnectionState::Connected);

        ctx.set_enabled(false).unwrap();
        sleep(Duration::from_secs(1)).await;
        assert_eq!(state(&ctx).state, ConnectionState::Disconnected);
        assert_eq!(probe.live.load(Ordering::SeqCst), 0);

        sleep(Duration::from_secs(120)).await;
        assert_eq!(probe.opens.lock().unwrap().len(), 1);

        ctx.set_enabled(true).unwrap();
        sleep(Duration::from_secs(1)).await;
        assert_eq!(state(&ctx).state, ConnectionState::Connected);
        assert_eq!(probe.opens.lock().unwrap().len(), 2);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_interrupts_backoff() {
        // ---
        let (ctx, probe, cancel, handle) = spawn_manager(vec![Script::Refuse], true);

        sleep(Duration::from_secs(1)).await;
        assert_eq!(state(&ctx).state, ConnectionState::BackingOff);

        ctx.set_enabled(false).unwrap();
        sleep(Duration::from_millis(10)).await;
        assert_eq!(state(&ctx).state, ConnectionState::Disconnected);

        sleep(Duration::from_secs(60)).await;
        assert_eq!(probe.opens.lock().unwrap().len(), 1);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_at_start_does_no_network_activity() {
        // ---
        let (ctx, probe, cancel, handle) = spawn_manager(vec![healthy()], false);

        sleep(Duration::from_secs(300)).await;
        assert!(probe.opens.lock().unwrap().is_empty());
        assert_eq!(state(&ctx).state, ConnectionState::Disconnected);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_abandons_inflight_connect() {
        // ---
        let (ctx, probe, cancel, handle) = spawn_manager(vec![Script::Events(vec![])], true);

        sleep(Duration::from_secs(2)).await;
        assert_eq!(state(&ctx).state, ConnectionState::Connecting);
        assert_eq!(probe.live.load(Ordering::SeqCst), 1);

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(probe.live.load(Ordering::SeqCst), 0);
        assert_eq!(state(&ctx).state, ConnectionState::Disconnected);
    }
}
