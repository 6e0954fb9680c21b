//! Connection lifecycle: open, heartbeat handshake, ingest start, health
//! supervision with reconnect/backoff, and teardown.

use mavlink::common::{MavCmd, MavMessage};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::{CoreConfig, LinkConfig};
use crate::error::{CommandError, CommandResult, TransportError};
use crate::ingest::{is_autopilot_heartbeat, IngestEngine};
use crate::link::{gcs_heartbeat, Link, Target};
use crate::modes::{ModeTable, VehicleClass};
use crate::state::LinkState;
use crate::transport::{Connector, Endpoint, Frame, Transport};

/// Message ids and rates requested after connecting.
const MESSAGE_RATES: &[(u32, f32)] = &[
    (33, 10.0), // GLOBAL_POSITION_INT
    (30, 10.0), // ATTITUDE
    (74, 5.0),  // VFR_HUD
];

pub struct Connection {
    config: CoreConfig,
    link: Arc<Link>,
    connector: Arc<dyn Connector>,
    active: Mutex<Option<Active>>,
}

struct Active {
    session: Arc<Session>,
    supervisor: JoinHandle<()>,
}

/// One connected endpoint, possibly across several transports when the
/// link had to be re-established.
struct Session {
    link: Arc<Link>,
    connector: Arc<dyn Connector>,
    endpoint: Endpoint,
    runner: Mutex<Option<Runner>>,
    lost_tx: mpsc::UnboundedSender<String>,
}

struct Runner {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

struct Handshake {
    transport: Arc<dyn Transport>,
    target: Target,
    class: VehicleClass,
    first: Frame,
    elapsed_ms: u64,
}

impl Connection {
    pub fn new(config: CoreConfig, connector: Arc<dyn Connector>) -> Self {
        let link = Link::new(config.link.clone());
        Self { config, link, connector, active: Mutex::new(None) }
    }

    pub fn link(&self) -> Arc<Link> {
        self.link.clone()
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn endpoint(&self) -> Option<Endpoint> {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|a| a.session.endpoint.clone())
    }

    /// Opens `endpoint`, waits for the first vehicle heartbeat and starts
    /// ingest plus health supervision. An existing connection is closed first.
    pub async fn connect(&self, endpoint: &str, baud: u32) -> CommandResult<()> {
        self.disconnect().await;

        let endpoint = Endpoint::parse(endpoint, baud)?;
        self.link.set_state(LinkState::Connecting);
        info!("link: connecting to {}", endpoint);

        let hs = match handshake(self.connector.clone(), endpoint.clone(), self.config.link.clone()).await {
            Ok(hs) => hs,
            Err(e) => {
                warn!("link: connect to {} failed: {}", endpoint, e);
                self.link.set_state(LinkState::Disconnected);
                return Err(e);
            }
        };
        info!(
            "link: heartbeat from sys {} comp {} ({:?}) after {}ms",
            hs.target.system, hs.target.component, hs.class, hs.elapsed_ms
        );

        let (lost_tx, lost_rx) = mpsc::unbounded_channel();
        let session = Arc::new(Session {
            link: self.link.clone(),
            connector: self.connector.clone(),
            endpoint,
            runner: Mutex::new(None),
            lost_tx,
        });
        session.attach(hs);
        let supervisor = tokio::spawn(session.clone().supervise(lost_rx));
        *self.active.lock().unwrap_or_else(|e| e.into_inner()) = Some(Active { session, supervisor });
        Ok(())
    }

    /// Stops ingest and supervision, closes the transport and resets the
    /// snapshot. Safe to call when not connected.
    pub async fn disconnect(&self) {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(active) = active {
            active.supervisor.abort();
            if let Some(handle) = active.session.stop_runner() {
                let _ = handle.await;
            }
            info!("link: disconnected from {}", active.session.endpoint);
        }
        self.link.teardown(LinkState::Disconnected);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(active) = active {
            active.supervisor.abort();
            active.session.stop_runner();
            self.link.teardown(LinkState::Disconnected);
        }
    }
}

impl Session {
    fn attach(&self, hs: Handshake) {
        let Handshake { transport, target, class, first, .. } = hs;
        self.link.install(transport.clone(), target, ModeTable::for_class(class));
        self.link.set_state(LinkState::Connected);

        let engine = IngestEngine::new(self.link.clone(), transport);
        engine.process(&first.0, &first.1, Instant::now());

        if self.link.config().request_message_rates {
            self.request_rates();
        }

        let stop = Arc::new(AtomicBool::new(false));
        let lost = self.lost_tx.clone();
        let handle = tokio::task::spawn_blocking({
            let stop = stop.clone();
            move || engine.run(stop, lost)
        });
        *self.runner.lock().unwrap_or_else(|e| e.into_inner()) = Some(Runner { stop, handle });
    }

    fn request_rates(&self) {
        for (id, hz) in MESSAGE_RATES {
            let interval_us = 1_000_000.0 / hz;
            let msg = self
                .link
                .command_long(MavCmd::MAV_CMD_SET_MESSAGE_INTERVAL, [*id as f32, interval_us, 0.0, 0.0, 0.0, 0.0, 0.0]);
            if let Err(e) = self.link.send(&msg) {
                warn!("link: message rate request for {} failed: {}", id, e);
            }
        }
    }

    /// Signals the ingest engine to stop and closes its transport.
    fn stop_runner(&self) -> Option<JoinHandle<()>> {
        let runner = self.runner.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(r) = runner.as_ref() {
            r.stop.store(true, Ordering::Release);
        }
        self.link.drop_transport();
        runner.map(|r| r.handle)
    }

    async fn supervise(self: Arc<Self>, mut lost_rx: mpsc::UnboundedReceiver<String>) {
        let cfg = self.link.config().clone();
        let mut tick = tokio::time::interval(cfg.health_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let reason = tokio::select! {
                Some(reason) = lost_rx.recv() => reason,
                _ = tick.tick() => match self.link.health().silence(Instant::now()) {
                    Some(silence) if silence >= cfg.telemetry_grace() => {
                        format!("no telemetry for {}ms", silence.as_millis())
                    }
                    _ => continue,
                },
            };

            warn!("link: connection lost: {}", reason);
            self.link.set_state(LinkState::Reconnecting { attempt: 1 });
            if let Some(handle) = self.stop_runner() {
                let _ = handle.await;
            }

            match self.reconnect(&cfg).await {
                Ok(()) => {
                    while lost_rx.try_recv().is_ok() {}
                    tick.reset();
                }
                Err(reason) => {
                    error!("link: {}", reason);
                    self.link.teardown(LinkState::Failed { reason });
                    return;
                }
            }
        }
    }

    async fn reconnect(&self, cfg: &LinkConfig) -> Result<(), String> {
        for attempt in 1..=cfg.reconnect_max_attempts {
            self.link.set_state(LinkState::Reconnecting { attempt });
            let delay = cfg.reconnect_delay(attempt);
            let jitter = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 10);
            info!(
                "link: reconnect attempt {}/{} in {}ms",
                attempt,
                cfg.reconnect_max_attempts,
                delay.as_millis() as u64 + jitter
            );
            tokio::time::sleep(delay + Duration::from_millis(jitter)).await;

            match handshake(self.connector.clone(), self.endpoint.clone(), cfg.clone()).await {
                Ok(hs) => {
                    self.attach(hs);
                    info!("link: reconnected to {}", self.endpoint);
                    return Ok(());
                }
                Err(e) => warn!("link: reconnect attempt {} failed: {}", attempt, e),
            }
        }
        Err(format!("gave up after {} reconnect attempts", cfg.reconnect_max_attempts))
    }
}

async fn handshake(connector: Arc<dyn Connector>, endpoint: Endpoint, cfg: LinkConfig) -> CommandResult<Handshake> {
    tokio::task::spawn_blocking(move || handshake_blocking(connector.as_ref(), &endpoint, &cfg))
        .await
        .map_err(|e| CommandError::Transport(format!("handshake task failed: {}", e)))?
}

/// Opens the transport and waits for a vehicle heartbeat, announcing
/// ourselves meanwhile so outbound UDP/TCP peers learn our address.
fn handshake_blocking(connector: &dyn Connector, endpoint: &Endpoint, cfg: &LinkConfig) -> CommandResult<Handshake> {
    let start = Instant::now();
    let transport = connector.open(endpoint, cfg.sys_id, cfg.comp_id)?;
    let mut last_announce: Option<Instant> = None;

    while start.elapsed() < cfg.handshake_timeout() {
        if last_announce.map(|t| t.elapsed() >= cfg.gcs_heartbeat_interval()).unwrap_or(true) {
            last_announce = Some(Instant::now());
            if let Err(e) = transport.send(&gcs_heartbeat()) {
                debug!("link: handshake heartbeat send failed: {}", e);
            }
        }

        match transport.recv_timeout(cfg.poll_interval()) {
            Ok(Some((hdr, MavMessage::HEARTBEAT(hb)))) if is_autopilot_heartbeat(&hb) => {
                // Some autopilots leave ids at 0 before configuration.
                let target = Target {
                    system: if hdr.system_id == 0 { 1 } else { hdr.system_id },
                    component: if hdr.component_id == 0 { 1 } else { hdr.component_id },
                };
                let class = VehicleClass::from_mav_type(hb.mavtype);
                return Ok(Handshake {
                    transport,
                    target,
                    class,
                    first: (hdr, MavMessage::HEARTBEAT(hb)),
                    elapsed_ms: start.elapsed().as_millis() as u64,
                });
            }
            Ok(_) => {}
            Err(TransportError::Closed) => {
                return Err(CommandError::NotConnected("transport closed during handshake".into()));
            }
            Err(e) => debug!("link: handshake receive error: {}", e),
        }
    }

    transport.close();
    Err(CommandError::Timeout(format!(
        "no heartbeat from {} within {}ms",
        endpoint, cfg.handshake_timeout_ms
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, MockConnector, MockTransport};
    use mavlink::common::{MavAutopilot, MavType, HEARTBEAT_DATA};
    use mavlink::MavHeader;

    async fn wait_state(link: &Link, pred: impl Fn(&LinkState) -> bool) -> LinkState {
        let mut rx = link.subscribe_state();
        let res = tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                let state = rx.borrow_and_update().clone();
                if pred(&state) {
                    return state;
                }
                if rx.changed().await.is_err() {
                    return state;
                }
            }
        })
        .await;
        res.expect("link state not reached")
    }

    #[tokio::test]
    async fn connect_learns_vehicle_from_heartbeat() {
        let (conn, transport) = testing::connected(testing::fast_config(), 4).await;
        let link = conn.link();

        assert_eq!(link.state(), LinkState::Connected);
        assert_eq!(link.target(), Target { system: 1, component: 1 });
        assert_eq!(link.mode_table().class(), VehicleClass::Copter);
        assert_eq!(link.snapshot().mode.as_deref(), Some("GUIDED"));
        assert_eq!(transport.count_commands(MavCmd::MAV_CMD_SET_MESSAGE_INTERVAL), 3);
    }

    #[tokio::test]
    async fn handshake_skips_companion_heartbeats() {
        let transport = MockTransport::new();
        let companion = HEARTBEAT_DATA {
            mavtype: MavType::MAV_TYPE_ONBOARD_CONTROLLER,
            autopilot: MavAutopilot::MAV_AUTOPILOT_INVALID,
            mavlink_version: 3,
            ..Default::default()
        };
        transport.push_from(
            MavHeader { system_id: 1, component_id: 191, sequence: 0 },
            MavMessage::HEARTBEAT(companion),
        );
        transport.push(testing::heartbeat(4, false));
        let conn = Connection::new(testing::fast_config(), MockConnector::new(vec![transport]));
        conn.connect("udpin:0.0.0.0:14550", 57600).await.unwrap();

        let link = conn.link();
        assert_eq!(link.target(), Target { system: 1, component: 1 });
        assert_eq!(link.snapshot().mode.as_deref(), Some("GUIDED"));
    }

    #[tokio::test]
    async fn missing_heartbeat_times_out() {
        let mut cfg = testing::fast_config();
        cfg.link.handshake_timeout_ms = 100;
        let transport = MockTransport::new();
        let conn = Connection::new(cfg, MockConnector::new(vec![transport.clone()]));

        let err = conn.connect("udpin:0.0.0.0:14550", 57600).await.unwrap_err();
        assert!(matches!(err, CommandError::Timeout(_)), "{:?}", err);
        assert_eq!(conn.link().state(), LinkState::Disconnected);
        assert!(transport.is_closed());
    }

    #[tokio::test]
    async fn bad_endpoint_is_rejected_before_opening() {
        let connector = MockConnector::new(vec![]);
        let conn = Connection::new(testing::fast_config(), connector.clone());
        assert!(conn.connect("carrier-pigeon:nowhere", 57600).await.is_err());
        assert_eq!(connector.opens(), 0);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_resets_snapshot() {
        let (conn, transport) = testing::connected(testing::fast_config(), 5).await;
        let link = conn.link();
        transport.push(testing::position(1.0, 2.0, 3.0));
        testing::wait_for(&link, |s| s.position.is_some()).await;

        conn.disconnect().await;
        conn.disconnect().await;

        assert_eq!(link.state(), LinkState::Disconnected);
        assert_eq!(link.snapshot(), Default::default());
        assert!(transport.is_closed());
        assert!(conn.endpoint().is_none());
    }

    #[tokio::test]
    async fn reconnects_after_transport_loss() {
        let first = MockTransport::new();
        first.push(testing::heartbeat(0, false));
        let second = MockTransport::new();
        second.push(testing::heartbeat(4, false));
        let connector = MockConnector::new(vec![first.clone(), second.clone()]);
        let conn = Connection::new(testing::fast_config(), connector.clone());
        conn.connect("tcpout:127.0.0.1:5760", 57600).await.unwrap();
        let link = conn.link();

        first.close();
        wait_state(&link, |s| matches!(s, LinkState::Reconnecting { .. })).await;
        wait_state(&link, |s| s.is_connected()).await;

        assert_eq!(connector.opens(), 2);
        testing::wait_for(&link, |s| s.mode.as_deref() == Some("GUIDED")).await;
        conn.disconnect().await;
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let mut cfg = testing::fast_config();
        cfg.link.reconnect_max_attempts = 2;
        cfg.link.handshake_timeout_ms = 50;
        let only = MockTransport::new();
        only.push(testing::heartbeat(0, false));
        let connector = MockConnector::new(vec![only.clone()]);
        let conn = Connection::new(cfg, connector.clone());
        conn.connect("udpin:0.0.0.0:14550", 57600).await.unwrap();
        let link = conn.link();

        only.close();
        let state = wait_state(&link, |s| matches!(s, LinkState::Failed { .. })).await;
        assert!(matches!(state, LinkState::Failed { reason } if reason.contains("2 reconnect attempts")));
        assert_eq!(connector.opens(), 3);
        assert_eq!(link.snapshot(), Default::default());
    }

    #[tokio::test]
    async fn silent_vehicle_triggers_reconnect() {
        let mut cfg = testing::fast_config();
        cfg.link.health_interval_ms = 20;
        cfg.link.telemetry_grace_ms = 100;
        cfg.link.reconnect_max_attempts = 1;
        let quiet = MockTransport::new();
        quiet.push(testing::heartbeat(0, false));
        let conn = Connection::new(cfg, MockConnector::new(vec![quiet]));
        conn.connect("udpin:0.0.0.0:14550", 57600).await.unwrap();

        let state = wait_state(&conn.link(), |s| matches!(s, LinkState::Failed { .. })).await;
        assert!(matches!(state, LinkState::Failed { .. }));
    }
}
