//! Sensor calibration: level, six-position accelerometer and compass.
//!
//! Orientation-dependent calibrations walk a [`PositionCheck`]: live attitude
//! must stay inside the tolerance of the required position for a full
//! stability window before the operator may advance.

use gcs_proto::telemetry::{Attitude, TelemetrySnapshot};
use mavlink::common::{MavCmd, MavResult};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::CalibrationConfig;
use crate::dispatcher::describe;
use crate::error::{CommandError, CommandResult};
use crate::link::{link_lost, Link, LinkEvent};
use crate::state::LinkState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalPosition {
    Level,
    Left,
    Right,
    NoseDown,
    NoseUp,
    Back,
}

pub const ACCEL_SEQUENCE: &[CalPosition] = &[
    CalPosition::Level,
    CalPosition::Left,
    CalPosition::Right,
    CalPosition::NoseDown,
    CalPosition::NoseUp,
    CalPosition::Back,
];

pub const LEVEL_SEQUENCE: &[CalPosition] = &[CalPosition::Level];

impl CalPosition {
    pub fn label(&self) -> &'static str {
        match self {
            CalPosition::Level => "Level",
            CalPosition::Left => "Left",
            CalPosition::Right => "Right",
            CalPosition::NoseDown => "Nose Down",
            CalPosition::NoseUp => "Nose Up",
            CalPosition::Back => "Back",
        }
    }

    fn hint(&self) -> &'static str {
        match self {
            CalPosition::Level => "roll and pitch near 0°",
            CalPosition::Left => "roll near -90°",
            CalPosition::Right => "roll near +90°",
            CalPosition::NoseDown => "pitch near -90°",
            CalPosition::NoseUp => "pitch near +90°",
            CalPosition::Back => "roll near ±180°",
        }
    }

    pub fn matches(&self, att: &Attitude, tolerance: f32) -> bool {
        let near = |value: f32, target: f32| (value - target).abs() <= tolerance;
        match self {
            CalPosition::Level => near(att.roll, 0.0) && near(att.pitch, 0.0),
            CalPosition::Left => near(att.roll, -90.0) && near(att.pitch, 0.0),
            CalPosition::Right => near(att.roll, 90.0) && near(att.pitch, 0.0),
            CalPosition::NoseDown => near(att.pitch, -90.0) && near(att.roll, 0.0),
            CalPosition::NoseUp => near(att.pitch, 90.0) && near(att.roll, 0.0),
            CalPosition::Back => near(att.roll.abs(), 180.0) && near(att.pitch, 0.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckState {
    Idle,
    /// Attitude outside tolerance.
    Checking,
    /// Inside tolerance, stability timer running.
    Holding { since: Instant },
    Stable,
    AllComplete,
}

#[derive(Debug, Clone)]
pub struct PositionCheck {
    sequence: &'static [CalPosition],
    step: usize,
    state: CheckState,
    tolerance: f32,
    window: Duration,
    last: Option<Attitude>,
}

impl PositionCheck {
    pub fn new(sequence: &'static [CalPosition], tolerance: f32, window: Duration) -> Self {
        Self { sequence, step: 0, state: CheckState::Idle, tolerance, window, last: None }
    }

    pub fn start(&mut self) {
        self.step = 0;
        self.state = CheckState::Checking;
    }

    pub fn stop(&mut self) {
        self.state = CheckState::Idle;
    }

    pub fn state(&self) -> CheckState {
        self.state
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn len(&self) -> usize {
        self.sequence.len()
    }

    pub fn current(&self) -> Option<CalPosition> {
        match self.state {
            CheckState::Idle | CheckState::AllComplete => None,
            _ => self.sequence.get(self.step).copied(),
        }
    }

    pub fn is_position_correct(&self) -> bool {
        self.state == CheckState::Stable
    }

    pub fn in_tolerance(&self, att: &Attitude) -> bool {
        self.current().map(|p| p.matches(att, self.tolerance)).unwrap_or(false)
    }

    pub fn update(&mut self, att: &Attitude, now: Instant) -> CheckState {
        let Some(position) = self.current() else {
            return self.state;
        };
        self.last = Some(*att);
        self.state = if !position.matches(att, self.tolerance) {
            CheckState::Checking
        } else {
            match self.state {
                CheckState::Checking => CheckState::Holding { since: now },
                other => other,
            }
        };
        self.tick(now)
    }

    /// Promotes a hold that has lasted the full window.
    pub fn tick(&mut self, now: Instant) -> CheckState {
        if let CheckState::Holding { since } = self.state {
            if now.saturating_duration_since(since) >= self.window {
                self.state = CheckState::Stable;
            }
        }
        self.state
    }

    /// Moves to the next position. `Ok(true)` once the last one is done.
    pub fn advance(&mut self) -> CommandResult<bool> {
        let Some(position) = self.current() else {
            return Err(CommandError::ProtocolViolation("no position check running".into()));
        };
        if !self.is_position_correct() {
            return Err(CommandError::Precondition(format!(
                "hold the vehicle {} until it is stable",
                position.label()
            )));
        }
        self.step += 1;
        if self.step >= self.sequence.len() {
            self.state = CheckState::AllComplete;
            Ok(true)
        } else {
            self.state = CheckState::Checking;
            Ok(false)
        }
    }

    pub fn feedback(&self, now: Instant) -> String {
        let Some(position) = self.current() else {
            return match self.state {
                CheckState::AllComplete => "All positions completed".into(),
                _ => "Position check not running".into(),
            };
        };
        match (self.state, self.last) {
            (_, None) => format!("Place vehicle {} (waiting for attitude)", position.label()),
            (CheckState::Checking, Some(att)) => format!(
                "Place vehicle {}: roll {:.1}°, pitch {:.1}° (need {})",
                position.label(),
                att.roll,
                att.pitch,
                position.hint()
            ),
            (CheckState::Holding { since }, _) => {
                let left = self.window.saturating_sub(now.saturating_duration_since(since));
                format!("Hold still in {} ({:.1}s)", position.label(), left.as_secs_f32())
            }
            _ => format!("{} confirmed, ready for next position", position.label()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationKind {
    Level,
    Accel,
    Compass,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CalPhase {
    Idle,
    Running,
    Complete,
    Failed { reason: String },
    Cancelled,
}

impl CalPhase {
    pub fn is_active(&self) -> bool {
        matches!(self, CalPhase::Running)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationStatus {
    pub kind: CalibrationKind,
    pub phase: CalPhase,
    pub position: Option<CalPosition>,
    /// (current step, total) for position-driven calibrations.
    pub step: Option<(usize, usize)>,
    pub position_correct: bool,
    pub feedback: String,
}

/// One calibration procedure. The manager drives every variant the same way.
pub trait Calibration: Send {
    fn kind(&self) -> CalibrationKind;

    /// Checks preconditions; returns the PREFLIGHT_CALIBRATION parameters.
    fn start(&mut self, attitude: Option<&Attitude>, now: Instant) -> CommandResult<[f32; 7]>;

    fn stop(&mut self);

    fn status(&self, now: Instant) -> CalibrationStatus;

    fn on_ack(&mut self, result: MavResult);

    fn on_attitude(&mut self, _attitude: &Attitude, _now: Instant) {}

    fn on_tick(&mut self, _now: Instant) {}

    fn advance(&mut self, _now: Instant) -> CommandResult<()> {
        Err(CommandError::ProtocolViolation(format!("{:?} calibration has no positions", self.kind())))
    }

    /// Operator declares the procedure finished.
    fn complete(&mut self) -> CommandResult<()> {
        Err(CommandError::ProtocolViolation(format!(
            "{:?} calibration cannot be completed manually",
            self.kind()
        )))
    }
}

fn fail_on_rejection(phase: &mut CalPhase, result: MavResult) -> bool {
    match result {
        MavResult::MAV_RESULT_ACCEPTED | MavResult::MAV_RESULT_IN_PROGRESS => false,
        other => {
            *phase = CalPhase::Failed { reason: format!("vehicle {} calibration", describe(other)) };
            true
        }
    }
}

/// Board level. Refused unless the vehicle is level; the vehicle must stay
/// level for the whole run.
pub struct LevelCalibration {
    check: PositionCheck,
    phase: CalPhase,
    started: Option<Instant>,
    duration: Duration,
}

impl LevelCalibration {
    pub fn new(cfg: &CalibrationConfig) -> Self {
        Self {
            check: PositionCheck::new(LEVEL_SEQUENCE, cfg.tolerance_deg, cfg.stability_window()),
            phase: CalPhase::Idle,
            started: None,
            duration: cfg.level_duration(),
        }
    }
}

impl Calibration for LevelCalibration {
    fn kind(&self) -> CalibrationKind {
        CalibrationKind::Level
    }

    fn start(&mut self, attitude: Option<&Attitude>, now: Instant) -> CommandResult<[f32; 7]> {
        let att = attitude.ok_or_else(|| CommandError::Precondition("no attitude telemetry yet".into()))?;
        self.check.start();
        if !self.check.in_tolerance(att) {
            self.check.stop();
            return Err(CommandError::Precondition(format!(
                "vehicle is not level (roll {:.1}°, pitch {:.1}°)",
                att.roll, att.pitch
            )));
        }
        self.check.update(att, now);
        self.phase = CalPhase::Running;
        self.started = Some(now);
        Ok([0.0, 0.0, 0.0, 0.0, 2.0, 0.0, 0.0])
    }

    fn stop(&mut self) {
        self.check.stop();
        if self.phase.is_active() {
            self.phase = CalPhase::Cancelled;
        }
    }

    fn status(&self, now: Instant) -> CalibrationStatus {
        let feedback = match &self.phase {
            CalPhase::Running => format!("Keep the vehicle level and still. {}", self.check.feedback(now)),
            CalPhase::Complete => "Level calibration complete".into(),
            CalPhase::Failed { reason } => format!("Level calibration failed: {}", reason),
            CalPhase::Cancelled => "Level calibration cancelled".into(),
            CalPhase::Idle => String::new(),
        };
        CalibrationStatus {
            kind: CalibrationKind::Level,
            phase: self.phase.clone(),
            position: self.check.current(),
            step: None,
            position_correct: self.check.is_position_correct(),
            feedback,
        }
    }

    fn on_ack(&mut self, result: MavResult) {
        if !self.phase.is_active() {
            return;
        }
        if result == MavResult::MAV_RESULT_ACCEPTED {
            self.phase = CalPhase::Complete;
            self.check.stop();
        } else if fail_on_rejection(&mut self.phase, result) {
            self.check.stop();
        }
    }

    fn on_attitude(&mut self, attitude: &Attitude, now: Instant) {
        if !self.phase.is_active() {
            return;
        }
        if self.check.update(attitude, now) == CheckState::Checking {
            self.phase = CalPhase::Failed { reason: "vehicle moved during level calibration".into() };
            self.check.stop();
        }
    }

    fn on_tick(&mut self, now: Instant) {
        if !self.phase.is_active() {
            return;
        }
        self.check.tick(now);
        if let Some(started) = self.started {
            if now.saturating_duration_since(started) >= self.duration {
                self.phase = CalPhase::Complete;
                self.check.stop();
            }
        }
    }
}

/// Six-position accelerometer calibration.
pub struct AccelCalibration {
    check: PositionCheck,
    phase: CalPhase,
}

impl AccelCalibration {
    pub fn new(cfg: &CalibrationConfig) -> Self {
        Self {
            check: PositionCheck::new(ACCEL_SEQUENCE, cfg.tolerance_deg, cfg.stability_window()),
            phase: CalPhase::Idle,
        }
    }
}

impl Calibration for AccelCalibration {
    fn kind(&self) -> CalibrationKind {
        CalibrationKind::Accel
    }

    fn start(&mut self, attitude: Option<&Attitude>, now: Instant) -> CommandResult<[f32; 7]> {
        self.check.start();
        if let Some(att) = attitude {
            self.check.update(att, now);
        }
        self.phase = CalPhase::Running;
        Ok([0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0])
    }

    fn stop(&mut self) {
        self.check.stop();
        if self.phase.is_active() {
            self.phase = CalPhase::Cancelled;
        }
    }

    fn status(&self, now: Instant) -> CalibrationStatus {
        let feedback = match &self.phase {
            CalPhase::Running => format!(
                "Position {}/{}: {}",
                self.check.step() + 1,
                self.check.len(),
                self.check.feedback(now)
            ),
            CalPhase::Complete => "Accelerometer calibration complete, all positions verified".into(),
            CalPhase::Failed { reason } => format!("Accelerometer calibration failed: {}", reason),
            CalPhase::Cancelled => "Accelerometer calibration cancelled".into(),
            CalPhase::Idle => String::new(),
        };
        CalibrationStatus {
            kind: CalibrationKind::Accel,
            phase: self.phase.clone(),
            position: self.check.current(),
            step: Some((self.check.step(), self.check.len())),
            position_correct: self.check.is_position_correct(),
            feedback,
        }
    }

    fn on_ack(&mut self, result: MavResult) {
        // Accepted only means the procedure started.
        if self.phase.is_active() && fail_on_rejection(&mut self.phase, result) {
            self.check.stop();
        }
    }

    fn on_attitude(&mut self, attitude: &Attitude, now: Instant) {
        if self.phase.is_active() {
            self.check.update(attitude, now);
        }
    }

    fn on_tick(&mut self, now: Instant) {
        if self.phase.is_active() {
            self.check.tick(now);
        }
    }

    fn advance(&mut self, _now: Instant) -> CommandResult<()> {
        if !self.phase.is_active() {
            return Err(CommandError::ProtocolViolation("accelerometer calibration not running".into()));
        }
        let label = self.check.current().map(|p| p.label()).unwrap_or_default();
        if self.check.advance()? {
            self.phase = CalPhase::Complete;
            info!("calibration: all accelerometer positions verified");
        } else {
            info!("calibration: position {} verified", label);
        }
        Ok(())
    }
}

/// Compass calibration; done on acknowledgment or when the operator says so.
pub struct CompassCalibration {
    phase: CalPhase,
}

impl CompassCalibration {
    pub fn new() -> Self {
        Self { phase: CalPhase::Idle }
    }
}

impl Default for CompassCalibration {
    fn default() -> Self {
        Self::new()
    }
}

impl Calibration for CompassCalibration {
    fn kind(&self) -> CalibrationKind {
        CalibrationKind::Compass
    }

    fn start(&mut self, _attitude: Option<&Attitude>, _now: Instant) -> CommandResult<[f32; 7]> {
        self.phase = CalPhase::Running;
        Ok([0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0])
    }

    fn stop(&mut self) {
        if self.phase.is_active() {
            self.phase = CalPhase::Cancelled;
        }
    }

    fn status(&self, _now: Instant) -> CalibrationStatus {
        let feedback = match &self.phase {
            CalPhase::Running => "Rotate the vehicle around all axes".into(),
            CalPhase::Complete => "Compass calibration complete".into(),
            CalPhase::Failed { reason } => format!("Compass calibration failed: {}", reason),
            CalPhase::Cancelled => "Compass calibration cancelled".into(),
            CalPhase::Idle => String::new(),
        };
        CalibrationStatus {
            kind: CalibrationKind::Compass,
            phase: self.phase.clone(),
            position: None,
            step: None,
            position_correct: false,
            feedback,
        }
    }

    fn on_ack(&mut self, result: MavResult) {
        if !self.phase.is_active() {
            return;
        }
        if result == MavResult::MAV_RESULT_ACCEPTED {
            self.phase = CalPhase::Complete;
        } else {
            fail_on_rejection(&mut self.phase, result);
        }
    }

    fn complete(&mut self) -> CommandResult<()> {
        if !self.phase.is_active() {
            return Err(CommandError::ProtocolViolation("compass calibration not running".into()));
        }
        self.phase = CalPhase::Complete;
        Ok(())
    }
}

type Active = Arc<Mutex<Option<Box<dyn Calibration>>>>;

fn lock(active: &Active) -> MutexGuard<'_, Option<Box<dyn Calibration>>> {
    active.lock().unwrap_or_else(|e| e.into_inner())
}

/// Runs at most one calibration and feeds it telemetry and acknowledgments.
pub struct CalibrationManager {
    link: Arc<Link>,
    cfg: CalibrationConfig,
    poll: Duration,
    active: Active,
    status: watch::Sender<Option<CalibrationStatus>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl CalibrationManager {
    pub fn new(link: Arc<Link>, cfg: CalibrationConfig, poll: Duration) -> Self {
        let (status, _) = watch::channel(None);
        Self { link, cfg, poll, active: Arc::new(Mutex::new(None)), status, driver: Mutex::new(None) }
    }

    pub fn status(&self) -> Option<CalibrationStatus> {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<CalibrationStatus>> {
        self.status.subscribe()
    }

    pub fn start(&self, kind: CalibrationKind) -> CommandResult<()> {
        self.link.ensure_connected()?;
        let mut active = lock(&self.active);
        if let Some(current) = active.as_ref() {
            let status = current.status(Instant::now());
            if status.phase.is_active() {
                return Err(CommandError::Busy(format!("{:?} calibration is running", status.kind)));
            }
        }

        let mut cal: Box<dyn Calibration> = match kind {
            CalibrationKind::Level => Box::new(LevelCalibration::new(&self.cfg)),
            CalibrationKind::Accel => Box::new(AccelCalibration::new(&self.cfg)),
            CalibrationKind::Compass => Box::new(CompassCalibration::new()),
        };
        let now = Instant::now();
        let attitude = self.link.snapshot().attitude;
        let params = cal.start(attitude.as_ref(), now)?;
        let feeds = Feeds {
            events: self.link.subscribe_events(),
            telemetry: self.link.subscribe_telemetry(),
            state: self.link.subscribe_state(),
        };
        self.link
            .send(&self.link.command_long(MavCmd::MAV_CMD_PREFLIGHT_CALIBRATION, params))?;
        info!("calibration: {:?} started", kind);

        self.status.send_replace(Some(cal.status(now)));
        *active = Some(cal);
        drop(active);

        let handle = tokio::spawn(drive(feeds, self.active.clone(), self.status.clone(), self.poll));
        if let Some(old) = self.driver.lock().unwrap_or_else(|e| e.into_inner()).replace(handle) {
            old.abort();
        }
        Ok(())
    }

    pub fn advance(&self) -> CommandResult<()> {
        self.with_active(|cal, now| cal.advance(now))
    }

    pub fn complete(&self) -> CommandResult<()> {
        self.with_active(|cal, _| cal.complete())
    }

    pub fn stop(&self) {
        if let Some(handle) = self.driver.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
        let mut active = lock(&self.active);
        if let Some(cal) = active.as_mut() {
            cal.stop();
            self.status.send_replace(Some(cal.status(Instant::now())));
            info!("calibration: {:?} stopped", cal.kind());
        }
    }

    fn with_active(&self, f: impl FnOnce(&mut dyn Calibration, Instant) -> CommandResult<()>) -> CommandResult<()> {
        let mut active = lock(&self.active);
        let cal = active
            .as_mut()
            .ok_or_else(|| CommandError::ProtocolViolation("no calibration running".into()))?;
        let now = Instant::now();
        let res = f(cal.as_mut(), now);
        self.status.send_replace(Some(cal.status(now)));
        res
    }
}

impl Drop for CalibrationManager {
    fn drop(&mut self) {
        if let Some(handle) = self.driver.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }
}

/// Subscriptions taken before the start command is sent.
struct Feeds {
    events: broadcast::Receiver<LinkEvent>,
    telemetry: watch::Receiver<TelemetrySnapshot>,
    state: watch::Receiver<LinkState>,
}

async fn drive(
    feeds: Feeds,
    active: Active,
    status: watch::Sender<Option<CalibrationStatus>>,
    poll: Duration,
) {
    let Feeds { mut events, mut telemetry, state: mut link_state } = feeds;
    let mut tick = tokio::time::interval(poll);

    loop {
        let lost = tokio::select! {
            _ = link_lost(&mut link_state) => true,
            ev = events.recv() => {
                match ev {
                    Ok(LinkEvent::CommandAck { command: MavCmd::MAV_CMD_PREFLIGHT_CALIBRATION, result }) => {
                        if let Some(cal) = lock(&active).as_mut() {
                            cal.on_ack(result);
                        }
                    }
                    Err(RecvError::Closed) => return,
                    _ => {}
                }
                false
            }
            changed = telemetry.changed() => {
                if changed.is_err() {
                    return;
                }
                let attitude = telemetry.borrow_and_update().attitude;
                if let (Some(att), Some(cal)) = (attitude, lock(&active).as_mut()) {
                    cal.on_attitude(&att, Instant::now());
                }
                false
            }
            _ = tick.tick() => {
                if let Some(cal) = lock(&active).as_mut() {
                    cal.on_tick(Instant::now());
                }
                false
            }
        };

        let mut guard = lock(&active);
        let Some(cal) = guard.as_mut() else {
            return;
        };
        if lost && cal.status(Instant::now()).phase.is_active() {
            warn!("calibration: connection lost, cancelling {:?}", cal.kind());
            cal.stop();
        }
        let current = cal.status(Instant::now());
        let done = !current.phase.is_active();
        status.send_if_modified(|s| {
            if s.as_ref() != Some(&current) {
                *s = Some(current);
                true
            } else {
                false
            }
        });
        if done {
            return;
        }
    }
}
