//! Connection driver
//!
//! Async half of the connection manager: runs connect attempts with a bounded
//! timeout, installs links, pumps inbound frames into the engine's dispatch
//! queue, keeps the link alive with pings, and reconnects with exponential
//! backoff after an unexpected loss.
//!
//! One pump task runs per link. It forwards every frame tagged with the link's
//! generation and always finishes with a single [`Inbound::Closed`], whether
//! the peer closed, the transport failed, or the liveness check gave up.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::{BackoffPolicy, ConnectionState};
use crate::client::Shared;
use crate::config::EngineConfig;
use crate::error::{EngineError, TransportError};
use crate::events::EngineEvent;
use crate::transport::liveness::encode_seq;
use crate::transport::{
    Connector, Link, LinkEvent, LinkHealth, LivenessCheck, LivenessConfig, LivenessMonitor,
    OutboundFrame,
};

/// Item on the engine's dispatch queue
#[derive(Debug)]
pub(crate) enum Inbound {
    /// Text frame read from the link of `generation`
    Frame { generation: u64, text: String },
    /// The link of `generation` is gone
    Closed { generation: u64, reason: String },
}

#[derive(Debug, Default)]
struct Tasks {
    reconnect: Option<AbortHandle>,
    pump: Option<AbortHandle>,
    health: Option<watch::Receiver<LinkHealth>>,
}

pub(crate) struct ConnectionManager {
    connector: Arc<dyn Connector>,
    policy: BackoffPolicy,
    connect_timeout: Duration,
    liveness: LivenessConfig,
    auto_reconnect: bool,
    tasks: Mutex<Tasks>,
}

impl ConnectionManager {
    pub(crate) fn new(connector: Arc<dyn Connector>, config: &EngineConfig) -> Self {
        Self {
            connector,
            policy: BackoffPolicy::from_config(&config.backoff, config.time_unit),
            connect_timeout: config.connection.connect_timeout,
            liveness: config.liveness.clone(),
            auto_reconnect: config.connection.auto_reconnect,
            tasks: Mutex::new(Tasks::default()),
        }
    }

    /// Connect now, superseding any scheduled reconnect
    ///
    /// Returns immediately if a link is already up.
    pub(crate) async fn connect(&self, shared: &Arc<Shared>) -> Result<(), EngineError> {
        self.cancel_reconnect();
        {
            let mut core = shared.core.lock();
            if core.connection.state().is_connected() {
                return Ok(());
            }
            shared.mutate(&mut core, |c| c.connection.begin_connect());
        }

        info!(endpoint = %self.connector.describe(), "Connecting");
        if let Err(e) = self.open(shared).await {
            warn!(error = %e, "Connect failed");
            let mut core = shared.core.lock();
            shared.mutate(&mut core, |c| c.connection.connect_failed());
            return Err(e);
        }
        Ok(())
    }

    /// Close the link and stop reconnecting
    pub(crate) fn disconnect(&self, shared: &Shared) {
        self.cancel_reconnect();
        self.abort_pump();
        let mut core = shared.core.lock();
        if core.connection.state() != ConnectionState::Disconnected {
            info!(link_id = ?core.connection.link_id(), "Disconnecting");
        }
        shared.mutate(&mut core, |c| c.connection.close());
    }

    /// Stop the pump of a link the engine has already marked lost
    pub(crate) fn abandon_link(&self) {
        self.abort_pump();
    }

    /// Ping/pong counters of the current link
    pub(crate) fn link_health(&self) -> Option<LinkHealth> {
        self.tasks
            .lock()
            .health
            .as_ref()
            .map(|rx| rx.borrow().clone())
    }

    /// Start the reconnect loop after an unexpected loss
    pub(crate) fn schedule_reconnect(&self, shared: &Arc<Shared>) {
        if !self.auto_reconnect {
            debug!("Auto-reconnect disabled, staying in Error");
            return;
        }
        let handle = tokio::spawn(reconnect_loop(Arc::downgrade(shared), self.policy.clone()));
        if let Some(old) = self.tasks.lock().reconnect.replace(handle.abort_handle()) {
            old.abort();
        }
    }

    /// Stop every background task
    pub(crate) fn shutdown(&self) {
        self.cancel_reconnect();
        self.abort_pump();
    }

    async fn open(&self, shared: &Arc<Shared>) -> Result<(), EngineError> {
        let link = match tokio::time::timeout(self.connect_timeout, self.connector.connect()).await {
            Ok(result) => result?,
            Err(_) => return Err(TransportError::Timeout(self.connect_timeout).into()),
        };
        self.install(shared, link)
    }

    fn install(&self, shared: &Arc<Shared>, link: Link) -> Result<(), EngineError> {
        let Link {
            id,
            outbound,
            inbound,
        } = link;
        let pump_outbound = outbound.clone();

        let generation = {
            let mut core = shared.core.lock();
            let state = core.connection.state();
            if state.is_connected() {
                debug!(link_id = %id, "Discarding link, a concurrent connect already won");
                return Ok(());
            }
            if state != ConnectionState::Connecting {
                debug!(link_id = %id, %state, "Discarding link, connect was superseded");
                return Err(EngineError::Connection("connect superseded".to_string()));
            }
            let link_id = id.clone();
            shared.mutate(&mut core, move |c| c.connection.established(link_id, outbound))
        };
        info!(link_id = %id, generation, "Connected");

        let (health_tx, health_rx) = watch::channel(LinkHealth::default());
        let pump = tokio::spawn(pump(
            generation,
            inbound,
            pump_outbound,
            self.liveness.clone(),
            shared.inbound_tx.clone(),
            health_tx,
        ));
        let mut tasks = self.tasks.lock();
        if let Some(old) = tasks.pump.replace(pump.abort_handle()) {
            old.abort();
        }
        tasks.health = Some(health_rx);
        Ok(())
    }

    fn cancel_reconnect(&self) {
        if let Some(handle) = self.tasks.lock().reconnect.take() {
            handle.abort();
        }
    }

    fn abort_pump(&self) {
        let mut tasks = self.tasks.lock();
        if let Some(handle) = tasks.pump.take() {
            handle.abort();
        }
        tasks.health = None;
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("endpoint", &self.connector.describe())
            .field("policy", &self.policy)
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

/// Forward link events to the dispatch queue and run liveness checks
async fn pump(
    generation: u64,
    mut inbound: mpsc::Receiver<LinkEvent>,
    outbound: mpsc::Sender<OutboundFrame>,
    liveness: LivenessConfig,
    tx: mpsc::UnboundedSender<Inbound>,
    health: watch::Sender<LinkHealth>,
) {
    let mut monitor = LivenessMonitor::new(liveness);
    let pinging = monitor.is_enabled();
    let mut ticker = tokio::time::interval(monitor.config().tick_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let reason = loop {
        tokio::select! {
            event = inbound.recv() => match event {
                Some(LinkEvent::Frame(text)) => {
                    if monitor.record_activity() {
                        health.send_replace(monitor.health().clone());
                    }
                    if tx.send(Inbound::Frame { generation, text }).is_err() {
                        return;
                    }
                }
                Some(LinkEvent::Pong(payload)) => {
                    if monitor.record_pong(&payload) {
                        health.send_replace(monitor.health().clone());
                    }
                }
                Some(LinkEvent::Closed { reason }) => break reason,
                None => break "link dropped".to_string(),
            },
            _ = ticker.tick(), if pinging => {
                let check = monitor.tick();
                if check != LivenessCheck::Idle {
                    health.send_replace(monitor.health().clone());
                }
                match check {
                    LivenessCheck::SendPing(seq) => {
                        if outbound.try_send(OutboundFrame::Ping(encode_seq(seq))).is_err() {
                            debug!(generation, seq, "Outbound queue busy, ping skipped");
                        }
                    }
                    LivenessCheck::Dead { missed } => {
                        break format!("no pong after {missed} pings");
                    }
                    LivenessCheck::Idle | LivenessCheck::PongMissed { .. } => {}
                }
            }
        }
    };

    debug!(generation, %reason, "Link pump finished");
    let _ = tx.send(Inbound::Closed { generation, reason });
}

async fn reconnect_loop(shared: Weak<Shared>, policy: BackoffPolicy) {
    let mut attempts = 0;

    while policy.allows(attempts) {
        attempts += 1;
        let delay = policy.delay_for(attempts);
        {
            let Some(s) = shared.upgrade() else { return };
            let mut core = s.core.lock();
            // A manual connect or disconnect took over
            if !matches!(
                core.connection.state(),
                ConnectionState::Error | ConnectionState::Backoff { .. }
            ) {
                return;
            }
            s.mutate(&mut core, |c| c.connection.enter_backoff(attempts));
            drop(core);
            s.emit(EngineEvent::ReconnectScheduled {
                attempt: attempts,
                delay,
            });
        }

        // Exponential backoff: initial * multiplier.powi(attempt - 1), capped and jittered
        warn!(
            attempt = attempts,
            max = policy.max_retries,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Reconnecting after backoff"
        );
        tokio::time::sleep(delay).await;

        let Some(s) = shared.upgrade() else { return };
        {
            let mut core = s.core.lock();
            if !matches!(core.connection.state(), ConnectionState::Backoff { .. }) {
                return;
            }
            s.mutate(&mut core, |c| c.connection.begin_connect());
        }

        match s.connection.open(&s).await {
            Ok(()) => {
                info!(attempt = attempts, "Reconnected");
                s.emit(EngineEvent::Reconnected { attempt: attempts });
                return;
            }
            Err(e) => {
                warn!(attempt = attempts, error = %e, "Reconnect attempt failed");
                let mut core = s.core.lock();
                s.mutate(&mut core, |c| c.connection.connect_failed());
            }
        }
    }

    let Some(s) = shared.upgrade() else { return };
    let mut core = s.core.lock();
    if core.connection.state() != ConnectionState::Error {
        return;
    }
    error!(attempts, "Reconnect attempts exhausted");
    s.mutate(&mut core, |c| c.connection.exhaust(attempts));
    drop(core);
    s.emit(EngineEvent::ConnectionExhausted { attempts });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::RealtimeClient;
    use crate::transport::{InProcessConnector, InProcessServer};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use tokio::time::Instant;

    /// Opens in-process links after a fixed delay
    struct Slow {
        inner: InProcessConnector,
        delay: Duration,
    }

    impl Slow {
        fn new(delay: Duration) -> (Self, InProcessServer) {
            let (inner, server) = InProcessConnector::new_pair();
            (Self { inner, delay }, server)
        }
    }

    #[async_trait]
    impl Connector for Slow {
        async fn connect(&self) -> Result<Link, TransportError> {
            tokio::time::sleep(self.delay).await;
            self.inner.connect().await
        }

        fn describe(&self) -> String {
            "slow in-process".to_string()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_times_out() {
        let mut config = EngineConfig::for_testing();
        config.connection.connect_timeout = Duration::from_secs(5);
        let (connector, _server) = Slow::new(Duration::from_secs(60));
        let client = RealtimeClient::new(config, connector);

        let started = Instant::now();
        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, EngineError::Connection(_)), "got {err:?}");
        assert_eq!(started.elapsed(), Duration::from_secs(5));
        assert_eq!(client.connection_state(), ConnectionState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_supersedes_slow_connect() {
        let (connector, _server) = Slow::new(Duration::from_secs(2));
        let client = RealtimeClient::new(EngineConfig::for_testing(), connector);

        let (result, ()) = tokio::join!(client.connect(), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            client.disconnect();
        });

        assert!(result.is_err());
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_connects_both_succeed() {
        let (connector, mut server) = Slow::new(Duration::from_secs(1));
        let client = RealtimeClient::new(EngineConfig::for_testing(), connector);

        let (first, second) = tokio::join!(client.connect(), client.connect());

        assert_eq!(first, Ok(()));
        assert_eq!(second, Ok(()));
        assert_eq!(client.connection_state(), ConnectionState::Connected);

        // The losing link is closed, the winner stays up
        let a = server.accept().await.unwrap();
        let b = server.accept().await.unwrap();
        tokio::task::yield_now().await;
        assert_eq!(
            [a.is_closed_by_client(), b.is_closed_by_client()]
                .iter()
                .filter(|closed| **closed)
                .count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_connect_does_not_schedule_reconnect() {
        let (connector, server) = InProcessConnector::new_pair();
        server.refuse_next(1);
        let client = RealtimeClient::new(EngineConfig::for_testing(), connector);

        assert!(client.connect().await.is_err());
        assert_eq!(client.connection_state(), ConnectionState::Error);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(server.connect_attempts(), 1);
    }
}
