//! Vehicle commands. Every operation has the same shape: precondition
//! check, send, then a bounded wait for the effect to show up in telemetry
//! or in a COMMAND_ACK.

use gcs_proto::telemetry::TelemetrySnapshot;
use mavlink::common::{MavCmd, MavMessage, MavResult};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::authority::{ModeChangeGate, ModeChangeTicket};
use crate::config::CommandConfig;
use crate::error::{CommandError, CommandResult};
use crate::link::{link_lost, Link, LinkEvent};

const GUIDED: &str = "GUIDED";

pub(crate) fn describe(result: MavResult) -> String {
    match result {
        MavResult::MAV_RESULT_TEMPORARILY_REJECTED => "temporarily rejected".into(),
        MavResult::MAV_RESULT_DENIED => "denied".into(),
        MavResult::MAV_RESULT_UNSUPPORTED => "unsupported".into(),
        MavResult::MAV_RESULT_FAILED => "failed".into(),
        other => format!("{:?}", other),
    }
}

/// One command exchange.
struct Exchange<'a> {
    what: &'a str,
    command: MavCmd,
    message: MavMessage,
    sends: u32,
    timeout: Duration,
    /// An accepted COMMAND_ACK completes the exchange.
    ack_completes: bool,
}

#[derive(Clone)]
pub struct Dispatcher {
    link: Arc<Link>,
    cfg: CommandConfig,
    gate: Arc<Mutex<ModeChangeGate>>,
}

impl Dispatcher {
    pub fn new(link: Arc<Link>, cfg: CommandConfig) -> Self {
        let gate = Arc::new(Mutex::new(ModeChangeGate::new(cfg.mode_cooldown())));
        Self { link, cfg, gate }
    }

    pub fn link(&self) -> &Arc<Link> {
        &self.link
    }

    pub async fn arm(&self) -> CommandResult<()> {
        self.set_armed(true, self.cfg.arm_timeout()).await
    }

    pub async fn disarm(&self) -> CommandResult<()> {
        self.set_armed(false, self.cfg.arm_timeout()).await
    }

    async fn set_armed(&self, arm: bool, timeout: Duration) -> CommandResult<()> {
        self.link.ensure_connected()?;
        let what = if arm { "arm" } else { "disarm" };
        if self.link.snapshot().armed == Some(arm) {
            info!("dispatch: already {}ed", what);
            return Ok(());
        }
        info!("dispatch: {} (burst of {})", what, self.cfg.burst_count);
        let message = self.link.command_long(
            MavCmd::MAV_CMD_COMPONENT_ARM_DISARM,
            [if arm { 1.0 } else { 0.0 }, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        );
        self.exchange(
            Exchange {
                what,
                command: MavCmd::MAV_CMD_COMPONENT_ARM_DISARM,
                message,
                sends: self.cfg.burst_count,
                timeout,
                ack_completes: true,
            },
            |s| (s.armed == Some(arm)).then_some(Ok(())),
        )
        .await
    }

    /// Changes flight mode by name and registers it with mode authority.
    pub async fn set_mode(&self, name: &str) -> CommandResult<()> {
        self.change_mode(name, true).await
    }

    async fn change_mode(&self, name: &str, respect_cooldown: bool) -> CommandResult<()> {
        self.link.ensure_connected()?;
        let wanted = name.trim().to_ascii_uppercase();
        let id = self
            .link
            .mode_table()
            .id(&wanted)
            .ok_or_else(|| CommandError::ProtocolViolation(format!("unknown mode {}", name.trim())))?;

        let _ticket = ModeChangeTicket::acquire(&self.gate, Instant::now(), respect_cooldown)?;
        let previous = self.link.authority().request(&wanted, Instant::now());

        if self.link.snapshot().reported_mode.as_deref() == Some(wanted.as_str()) {
            info!("dispatch: already in {}", wanted);
            return Ok(());
        }

        info!("dispatch: mode {} (id {})", wanted, id);
        let res = self
            .exchange(
                Exchange {
                    what: "mode change",
                    command: MavCmd::MAV_CMD_DO_SET_MODE,
                    message: self.link.set_mode_message(id),
                    sends: 1,
                    timeout: self.cfg.mode_timeout(),
                    ack_completes: false,
                },
                |s| (s.reported_mode.as_deref() == Some(wanted.as_str())).then_some(Ok(())),
            )
            .await;

        match &res {
            Ok(()) => info!("dispatch: vehicle in {}", wanted),
            Err(CommandError::Denied(reason)) => {
                warn!("dispatch: mode {} rejected: {}", wanted, reason);
                self.link.authority().restore(None);
            }
            Err(CommandError::Timeout(_)) => {
                warn!("dispatch: mode {} not confirmed", wanted);
                self.link.authority().restore(previous);
            }
            Err(_) => {}
        }
        res
    }

    /// GUIDED, arm, then NAV_TAKEOFF; succeeds once the vehicle has climbed.
    pub async fn takeoff(&self, altitude_m: f32) -> CommandResult<()> {
        self.link.ensure_connected()?;
        if !(altitude_m.is_finite() && altitude_m > 0.0) {
            return Err(CommandError::Precondition(format!("invalid takeoff altitude {}", altitude_m)));
        }
        if !self.link.snapshot().has_valid_position() {
            return Err(CommandError::Precondition("GPS position not available".into()));
        }

        if self.link.snapshot().reported_mode.as_deref() != Some(GUIDED) {
            self.change_mode(GUIDED, false).await?;
        }

        if !self.link.snapshot().is_armed() {
            match self.set_armed(true, self.cfg.takeoff_arm_wait()).await {
                Ok(()) => {}
                Err(CommandError::Timeout(reason)) if self.cfg.takeoff_without_arm_confirmation => {
                    warn!("dispatch: arming not confirmed ({}), sending takeoff anyway", reason);
                }
                Err(e) => return Err(e),
            }
        }

        let snap = self.link.snapshot();
        let Some(pos) = snap.position else {
            return Err(CommandError::Precondition("GPS position not available".into()));
        };
        let start_alt = pos.relative_alt;
        let climb_to = start_alt + self.cfg.takeoff_climb_m;
        let mut seen_armed = snap.is_armed();

        info!("dispatch: takeoff to {:.1}m from {:.1}m", altitude_m, start_alt);
        let message = self.link.command_long(
            MavCmd::MAV_CMD_NAV_TAKEOFF,
            [0.0, 0.0, 0.0, f32::NAN, pos.lat as f32, pos.lon as f32, altitude_m],
        );
        self.exchange(
            Exchange {
                what: "takeoff",
                command: MavCmd::MAV_CMD_NAV_TAKEOFF,
                message,
                sends: 1,
                timeout: self.cfg.takeoff_confirm(),
                ack_completes: false,
            },
            |s| {
                match s.armed {
                    Some(true) => seen_armed = true,
                    Some(false) if seen_armed => {
                        return Some(Err(CommandError::Denied("vehicle disarmed during takeoff".into())));
                    }
                    _ => {}
                }
                match s.relative_alt() {
                    Some(alt) if alt >= climb_to => Some(Ok(())),
                    _ => None,
                }
            },
        )
        .await
    }

    /// NAV_LAND at the current position, resolved by the acknowledgment.
    pub async fn land(&self) -> CommandResult<()> {
        self.link.ensure_connected()?;
        let snap = self.link.snapshot();
        let pos = match snap.position {
            Some(p) if snap.has_valid_position() => p,
            _ => return Err(CommandError::Precondition("GPS position not available".into())),
        };
        // The autopilot switches to its landing mode on its own; a mode still
        // held by authority would pull it straight back out.
        if let Some(held) = self.link.requested_mode() {
            info!("dispatch: releasing {} from mode authority for landing", held);
            self.link.authority().restore(None);
        }
        info!("dispatch: land at {:.7},{:.7}", pos.lat, pos.lon);
        let message = self.link.command_long(
            MavCmd::MAV_CMD_NAV_LAND,
            [0.0, 0.0, 0.0, f32::NAN, pos.lat as f32, pos.lon as f32, 0.0],
        );
        self.exchange(
            Exchange {
                what: "land",
                command: MavCmd::MAV_CMD_NAV_LAND,
                message,
                sends: 1,
                timeout: self.cfg.ack_timeout(),
                ack_completes: true,
            },
            |_| None,
        )
        .await
    }

    /// Land, then disarm automatically once the vehicle sits near the ground.
    pub async fn land_with_auto_disarm(&self) -> CommandResult<LandMonitor> {
        self.land().await?;
        Ok(LandMonitor::spawn(self.clone()))
    }

    pub async fn reboot(&self) -> CommandResult<()> {
        self.link.ensure_connected()?;
        if self.link.snapshot().is_armed() {
            return Err(CommandError::Precondition("refusing to reboot an armed vehicle".into()));
        }
        info!("dispatch: reboot autopilot");
        let message = self
            .link
            .command_long(MavCmd::MAV_CMD_PREFLIGHT_REBOOT_SHUTDOWN, [1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        self.exchange(
            Exchange {
                what: "reboot",
                command: MavCmd::MAV_CMD_PREFLIGHT_REBOOT_SHUTDOWN,
                message,
                sends: 1,
                timeout: self.cfg.ack_timeout(),
                ack_completes: true,
            },
            |_| None,
        )
        .await
    }

    pub fn enable_mode_authority(&self) {
        self.link.enable_mode_authority();
    }

    pub fn disable_mode_authority(&self) {
        self.link.disable_mode_authority();
    }

    /// Sends `ex.message` `ex.sends` times and waits for a conclusive signal:
    /// `check` on snapshot changes, or a COMMAND_ACK for `ex.command`.
    async fn exchange<F>(&self, ex: Exchange<'_>, mut check: F) -> CommandResult<()>
    where
        F: FnMut(&TelemetrySnapshot) -> Option<CommandResult<()>>,
    {
        // Subscribe before the first send so a fast reply is not missed.
        let mut events = self.link.subscribe_events();
        let mut telemetry = self.link.subscribe_telemetry();
        let mut state = self.link.subscribe_state();
        telemetry.borrow_and_update();

        let deadline = tokio::time::sleep(ex.timeout);
        tokio::pin!(deadline);
        let mut burst = tokio::time::interval(self.cfg.burst_spacing());
        let mut sent = 0;

        loop {
            tokio::select! {
                biased;
                _ = link_lost(&mut state) => {
                    return Err(CommandError::NotConnected(format!("connection lost during {}", ex.what)));
                }
                _ = burst.tick(), if sent < ex.sends => {
                    self.link.send(&ex.message)?;
                    sent += 1;
                }
                ev = events.recv() => match ev {
                    Ok(LinkEvent::CommandAck { command, result }) if command == ex.command => match result {
                        MavResult::MAV_RESULT_ACCEPTED => {
                            debug!("dispatch: {} accepted", ex.what);
                            if ex.ack_completes {
                                return Ok(());
                            }
                        }
                        MavResult::MAV_RESULT_IN_PROGRESS => {}
                        other => {
                            return Err(CommandError::Denied(format!("{} {}", ex.what, describe(other))));
                        }
                    },
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => debug!("dispatch: skipped {} link events", n),
                    Err(RecvError::Closed) => {
                        return Err(CommandError::NotConnected("link closed".into()));
                    }
                },
                changed = telemetry.changed() => {
                    if changed.is_err() {
                        return Err(CommandError::NotConnected("link closed".into()));
                    }
                    let snap = telemetry.borrow_and_update().clone();
                    if let Some(outcome) = check(&snap) {
                        return outcome;
                    }
                }
                _ = &mut deadline => {
                    return Err(CommandError::Timeout(format!(
                        "{} not confirmed within {}ms",
                        ex.what,
                        ex.timeout.as_millis()
                    )));
                }
            }
        }
    }
}

/// Near-ground dwell detection for auto-disarm.
#[derive(Debug, Clone)]
pub struct TouchdownDetector {
    threshold_m: f32,
    dwell: Duration,
    below_since: Option<Instant>,
}

impl TouchdownDetector {
    pub fn new(threshold_m: f32, dwell: Duration) -> Self {
        Self { threshold_m, dwell, below_since: None }
    }

    /// True once the altitude has stayed below the threshold for the dwell.
    pub fn observe(&mut self, relative_alt: Option<f32>, now: Instant) -> bool {
        match relative_alt {
            Some(alt) if alt < self.threshold_m => {
                let since = *self.below_since.get_or_insert(now);
                now.saturating_duration_since(since) >= self.dwell
            }
            _ => {
                self.below_since = None;
                false
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LandOutcome {
    /// We sent the disarm and it was confirmed.
    Disarmed,
    /// The autopilot disarmed on its own.
    AlreadyDisarmed,
    Cancelled,
    ConnectionLost,
    Failed(CommandError),
}

/// Background auto-disarm after landing. Cancel with [`LandMonitor::cancel`].
pub struct LandMonitor {
    handle: JoinHandle<LandOutcome>,
}

impl LandMonitor {
    fn spawn(dispatcher: Dispatcher) -> Self {
        Self { handle: tokio::spawn(watch_touchdown(dispatcher)) }
    }

    pub fn cancel(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub async fn wait(self) -> LandOutcome {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => LandOutcome::Cancelled,
            Err(e) => LandOutcome::Failed(CommandError::Transport(format!("land monitor failed: {}", e))),
        }
    }
}

async fn watch_touchdown(dispatcher: Dispatcher) -> LandOutcome {
    let link = dispatcher.link.clone();
    let cfg = dispatcher.cfg.clone();
    let mut state = link.subscribe_state();
    let mut detector = TouchdownDetector::new(cfg.auto_disarm_alt_m, cfg.auto_disarm_dwell());
    let mut tick = tokio::time::interval(cfg.poll_interval());
    info!("dispatch: auto-disarm armed (below {:.1}m for {}ms)", cfg.auto_disarm_alt_m, cfg.auto_disarm_dwell_ms);

    loop {
        tokio::select! {
            _ = link_lost(&mut state) => {
                warn!("dispatch: auto-disarm stopped, connection lost");
                return LandOutcome::ConnectionLost;
            }
            _ = tick.tick() => {
                let snap = link.snapshot();
                if snap.armed == Some(false) {
                    info!("dispatch: vehicle disarmed itself after landing");
                    return LandOutcome::AlreadyDisarmed;
                }
                if detector.observe(snap.relative_alt(), Instant::now()) {
                    info!("dispatch: on the ground, disarming");
                    return match dispatcher.disarm().await {
                        Ok(()) => LandOutcome::Disarmed,
                        Err(e) => {
                            warn!("dispatch: auto-disarm failed: {}", e);
                            LandOutcome::Failed(e)
                        }
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::connection::Connection;
    use crate::testing::{self, MockTransport};
    use mavlink::common::{GpsFixType, COMMAND_ACK_DATA};

    fn ack(command: MavCmd, result: MavResult) -> MavMessage {
        MavMessage::COMMAND_ACK(COMMAND_ACK_DATA { command, result, ..Default::default() })
    }

    async fn setup(cfg: CoreConfig, mode: u32) -> (Connection, Arc<MockTransport>, Dispatcher) {
        let (conn, transport) = testing::connected(cfg.clone(), mode).await;
        let dispatcher = Dispatcher::new(conn.link(), cfg.commands);
        (conn, transport, dispatcher)
    }

    async fn with_fix(conn: &Connection, transport: &MockTransport, alt: f32) {
        transport.push(testing::gps_fix(GpsFixType::GPS_FIX_TYPE_3D_FIX, 12));
        transport.push(testing::position(-35.3632621, 149.1652374, alt));
        testing::wait_for(&conn.link(), |s| s.has_valid_position()).await;
    }

    fn command(msg: &MavMessage) -> Option<(MavCmd, f32, f32)> {
        match msg {
            MavMessage::COMMAND_LONG(c) => Some((c.command, c.param1, c.param2)),
            _ => None,
        }
    }

    #[tokio::test]
    async fn arm_succeeds_on_ack() {
        let (_conn, transport, dispatcher) = setup(testing::fast_config(), 4).await;
        transport.respond_with(|m| match command(m) {
            Some((MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, _, _)) => {
                vec![ack(MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, MavResult::MAV_RESULT_ACCEPTED)]
            }
            _ => vec![],
        });
        dispatcher.arm().await.unwrap();
        assert!(transport.count_commands(MavCmd::MAV_CMD_COMPONENT_ARM_DISARM) >= 1);
    }

    #[tokio::test]
    async fn arm_succeeds_on_telemetry() {
        let (_conn, transport, dispatcher) = setup(testing::fast_config(), 4).await;
        transport.respond_with(|m| match command(m) {
            Some((MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, _, _)) => vec![testing::heartbeat(4, true)],
            _ => vec![],
        });
        dispatcher.arm().await.unwrap();
        assert_eq!(dispatcher.link().snapshot().armed, Some(true));
    }

    #[tokio::test]
    async fn silent_vehicle_arm_times_out_after_full_burst() {
        let (_conn, transport, dispatcher) = setup(testing::fast_config(), 4).await;
        let err = dispatcher.arm().await.unwrap_err();
        assert!(matches!(err, CommandError::Timeout(_)), "{:?}", err);
        assert!(err.is_retryable());
        assert_eq!(transport.count_commands(MavCmd::MAV_CMD_COMPONENT_ARM_DISARM), 5);
    }

    #[tokio::test]
    async fn arm_denial_short_circuits() {
        let (_conn, transport, dispatcher) = setup(testing::fast_config(), 4).await;
        transport.respond_with(|m| match command(m) {
            Some((MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, _, _)) => {
                vec![ack(MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, MavResult::MAV_RESULT_FAILED)]
            }
            _ => vec![],
        });
        let started = Instant::now();
        let err = dispatcher.arm().await.unwrap_err();
        assert!(matches!(err, CommandError::Denied(_)), "{:?}", err);
        assert!(started.elapsed() < Duration::from_millis(300));
    }

    #[tokio::test]
    async fn commands_require_connection() {
        let link = Link::new(Default::default());
        let dispatcher = Dispatcher::new(link, CommandConfig::default());
        assert!(matches!(dispatcher.arm().await, Err(CommandError::NotConnected(_))));
        assert!(matches!(dispatcher.set_mode("GUIDED").await, Err(CommandError::NotConnected(_))));
    }

    #[tokio::test]
    async fn unknown_mode_is_protocol_violation() {
        let (_conn, transport, dispatcher) = setup(testing::fast_config(), 0).await;
        let err = dispatcher.set_mode("WARP").await.unwrap_err();
        assert!(matches!(err, CommandError::ProtocolViolation(_)));
        assert_eq!(transport.count_commands(MavCmd::MAV_CMD_DO_SET_MODE), 0);
    }

    #[tokio::test]
    async fn set_mode_confirmed_by_heartbeat() {
        let (_conn, transport, dispatcher) = setup(testing::fast_config(), 0).await;
        transport.respond_with(|m| match command(m) {
            Some((MavCmd::MAV_CMD_DO_SET_MODE, _, id)) => vec![testing::heartbeat(id as u32, false)],
            _ => vec![],
        });
        dispatcher.set_mode("loiter").await.unwrap();
        let link = dispatcher.link();
        assert_eq!(link.requested_mode().as_deref(), Some("LOITER"));
        assert_eq!(link.snapshot().reported_mode.as_deref(), Some("LOITER"));
    }

    #[tokio::test]
    async fn already_in_mode_is_immediate_success() {
        let (_conn, transport, dispatcher) = setup(testing::fast_config(), 4).await;
        dispatcher.set_mode("GUIDED").await.unwrap();
        assert_eq!(transport.count_commands(MavCmd::MAV_CMD_DO_SET_MODE), 0);
    }

    #[tokio::test]
    async fn concurrent_mode_change_is_busy() {
        let (_conn, _transport, dispatcher) = setup(testing::fast_config(), 0).await;
        let (a, b) = tokio::join!(dispatcher.set_mode("GUIDED"), dispatcher.set_mode("LOITER"));
        let busy = [&a, &b].iter().filter(|r| matches!(r, Err(CommandError::Busy(_)))).count();
        assert_eq!(busy, 1, "{:?} {:?}", a, b);
        // The one that ran timed out and put back the previous request.
        assert!([&a, &b].iter().any(|r| matches!(r, Err(CommandError::Timeout(_)))));
        assert_eq!(dispatcher.link().requested_mode(), None);
    }

    #[tokio::test]
    async fn mode_cooldown_rejects_rapid_requests() {
        let mut cfg = testing::fast_config();
        cfg.commands.mode_cooldown_ms = 5_000;
        let (_conn, _transport, dispatcher) = setup(cfg, 4).await;
        dispatcher.set_mode("GUIDED").await.unwrap();
        assert!(matches!(dispatcher.set_mode("LOITER").await, Err(CommandError::Busy(_))));
    }

    #[tokio::test]
    async fn denied_mode_is_withdrawn_from_authority() {
        let (_conn, transport, dispatcher) = setup(testing::fast_config(), 0).await;
        transport.respond_with(|m| match command(m) {
            Some((MavCmd::MAV_CMD_DO_SET_MODE, _, _)) => {
                vec![ack(MavCmd::MAV_CMD_DO_SET_MODE, MavResult::MAV_RESULT_DENIED)]
            }
            _ => vec![],
        });
        let err = dispatcher.set_mode("AUTO").await.unwrap_err();
        assert!(matches!(err, CommandError::Denied(_)));
        assert_eq!(dispatcher.link().requested_mode(), None);
    }

    #[tokio::test]
    async fn takeoff_needs_gps() {
        let (_conn, _transport, dispatcher) = setup(testing::fast_config(), 4).await;
        let err = dispatcher.takeoff(10.0).await.unwrap_err();
        assert_eq!(err, CommandError::Precondition("GPS position not available".into()));
    }

    #[tokio::test]
    async fn takeoff_runs_mode_arm_and_climb() {
        let (conn, transport, dispatcher) = setup(testing::fast_config(), 0).await;
        with_fix(&conn, &transport, 0.0).await;
        transport.respond_with(|m| match command(m) {
            Some((MavCmd::MAV_CMD_DO_SET_MODE, _, id)) => vec![testing::heartbeat(id as u32, false)],
            Some((MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, _, _)) => vec![testing::heartbeat(4, true)],
            Some((MavCmd::MAV_CMD_NAV_TAKEOFF, _, _)) => vec![
                ack(MavCmd::MAV_CMD_NAV_TAKEOFF, MavResult::MAV_RESULT_ACCEPTED),
                testing::position(-35.3632621, 149.1652374, 1.2),
            ],
            _ => vec![],
        });

        dispatcher.takeoff(10.0).await.unwrap();
        let sent = transport.sent();
        let takeoff = sent
            .iter()
            .find_map(|m| match m {
                MavMessage::COMMAND_LONG(c) if c.command == MavCmd::MAV_CMD_NAV_TAKEOFF => Some(c.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(takeoff.param7, 10.0);
        assert!((takeoff.param5 - -35.36326).abs() < 1e-4);
    }

    #[tokio::test]
    async fn disarm_during_takeoff_fails() {
        let (conn, transport, dispatcher) = setup(testing::fast_config(), 4).await;
        transport.push(testing::heartbeat(4, true));
        with_fix(&conn, &transport, 0.0).await;
        testing::wait_for(&conn.link(), |s| s.is_armed()).await;
        transport.respond_with(|m| match command(m) {
            Some((MavCmd::MAV_CMD_NAV_TAKEOFF, _, _)) => vec![testing::heartbeat(4, false)],
            _ => vec![],
        });
        let err = dispatcher.takeoff(5.0).await.unwrap_err();
        assert!(matches!(err, CommandError::Denied(ref r) if r.contains("disarmed")), "{:?}", err);
    }

    #[tokio::test]
    async fn land_then_auto_disarm() {
        let (conn, transport, dispatcher) = setup(testing::fast_config(), 4).await;
        transport.push(testing::heartbeat(4, true));
        with_fix(&conn, &transport, 6.0).await;
        testing::wait_for(&conn.link(), |s| s.is_armed()).await;
        transport.respond_with(|m| match command(m) {
            Some((MavCmd::MAV_CMD_NAV_LAND, _, _)) => vec![
                ack(MavCmd::MAV_CMD_NAV_LAND, MavResult::MAV_RESULT_ACCEPTED),
                testing::heartbeat(9, true),
                testing::position(-35.3632621, 149.1652374, 0.1),
            ],
            Some((MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, p1, _)) if p1 == 0.0 => vec![testing::heartbeat(9, false)],
            _ => vec![],
        });

        let monitor = dispatcher.land_with_auto_disarm().await.unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(2), monitor.wait()).await.unwrap();
        assert_eq!(outcome, LandOutcome::Disarmed);
    }

    #[tokio::test]
    async fn land_after_takeoff_is_not_pulled_back_to_guided() {
        let (conn, transport, dispatcher) = setup(testing::fast_config(), 0).await;
        with_fix(&conn, &transport, 0.0).await;
        transport.respond_with(|m| match command(m) {
            Some((MavCmd::MAV_CMD_DO_SET_MODE, _, id)) => vec![testing::heartbeat(id as u32, false)],
            Some((MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, _, _)) => vec![testing::heartbeat(4, true)],
            Some((MavCmd::MAV_CMD_NAV_TAKEOFF, _, _)) => vec![
                ack(MavCmd::MAV_CMD_NAV_TAKEOFF, MavResult::MAV_RESULT_ACCEPTED),
                testing::position(-35.3632621, 149.1652374, 1.2),
            ],
            Some((MavCmd::MAV_CMD_NAV_LAND, _, _)) => vec![
                ack(MavCmd::MAV_CMD_NAV_LAND, MavResult::MAV_RESULT_ACCEPTED),
                testing::heartbeat(9, true),
            ],
            _ => vec![],
        });

        dispatcher.takeoff(10.0).await.unwrap();
        assert_eq!(conn.link().requested_mode().as_deref(), Some("GUIDED"));
        let mode_sets = transport.count_commands(MavCmd::MAV_CMD_DO_SET_MODE);

        dispatcher.land().await.unwrap();
        assert_eq!(conn.link().requested_mode(), None);
        // LAND heartbeats across more than one enforcement interval.
        for _ in 0..8 {
            transport.push(testing::heartbeat(9, true));
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        testing::wait_for(&conn.link(), |s| s.mode.as_deref() == Some("LAND")).await;
        assert_eq!(transport.count_commands(MavCmd::MAV_CMD_DO_SET_MODE), mode_sets);
    }

    #[tokio::test]
    async fn land_monitor_is_cancellable() {
        let (conn, transport, dispatcher) = setup(testing::fast_config(), 4).await;
        transport.push(testing::heartbeat(4, true));
        with_fix(&conn, &transport, 20.0).await;
        testing::wait_for(&conn.link(), |s| s.is_armed()).await;
        transport.respond_with(|m| match command(m) {
            Some((MavCmd::MAV_CMD_NAV_LAND, _, _)) => vec![ack(MavCmd::MAV_CMD_NAV_LAND, MavResult::MAV_RESULT_ACCEPTED)],
            _ => vec![],
        });
        let monitor = dispatcher.land_with_auto_disarm().await.unwrap();
        monitor.cancel();
        assert_eq!(monitor.wait().await, LandOutcome::Cancelled);
        assert_eq!(transport.count_commands(MavCmd::MAV_CMD_COMPONENT_ARM_DISARM), 0);
    }

    #[test]
    fn touchdown_needs_full_dwell_below_threshold() {
        let start = Instant::now();
        let mut d = TouchdownDetector::new(0.3, Duration::from_secs(3));
        assert!(!d.observe(Some(0.2), start));
        assert!(!d.observe(Some(0.2), start + Duration::from_millis(2_900)));
        // A bounce resets the dwell.
        assert!(!d.observe(Some(0.5), start + Duration::from_millis(2_950)));
        assert!(!d.observe(Some(0.1), start + Duration::from_millis(3_000)));
        assert!(d.observe(Some(0.1), start + Duration::from_millis(6_000)));
        assert!(!d.observe(None, start + Duration::from_millis(6_100)));
    }
}
