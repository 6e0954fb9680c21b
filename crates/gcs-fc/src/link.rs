//! Shared handle every component receives instead of reaching into globals.
//!
//! The ingest engine is the only writer of the telemetry snapshot; the
//! dispatcher only writes the mode-authority state.

use gcs_proto::params::ParamEntry;
use gcs_proto::telemetry::{StatusText, TelemetrySnapshot};
use mavlink::common::{
    MavAutopilot, MavCmd, MavMessage, MavMissionResult, MavModeFlag, MavResult, MavState,
    MavType, COMMAND_LONG_DATA, HEARTBEAT_DATA,
};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Instant;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use crate::authority::ModeAuthority;
use crate::config::LinkConfig;
use crate::error::{CommandError, CommandResult};
use crate::modes::ModeTable;
use crate::state::{LinkHealth, LinkState, StatusLog};
use crate::transport::Transport;

/// Protocol traffic the ingest engine republishes to waiting operations.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    CommandAck { command: MavCmd, result: MavResult },
    /// MISSION_REQUEST or MISSION_REQUEST_INT.
    MissionRequest { seq: u16 },
    MissionAck { result: MavMissionResult },
    ParamValue(ParamEntry),
    StatusText(StatusText),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub system: u8,
    pub component: u8,
}

impl Default for Target {
    fn default() -> Self {
        Self { system: 1, component: 1 }
    }
}

pub struct Link {
    config: LinkConfig,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    target: Mutex<Target>,
    modes: Mutex<ModeTable>,
    snapshot: watch::Sender<TelemetrySnapshot>,
    state: watch::Sender<LinkState>,
    authority: Mutex<ModeAuthority>,
    health: Mutex<LinkHealth>,
    events: broadcast::Sender<LinkEvent>,
    param_sink: Mutex<Option<mpsc::Sender<ParamEntry>>>,
    status_log: Mutex<StatusLog>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Link {
    pub fn new(config: LinkConfig) -> Arc<Self> {
        let (snapshot, _) = watch::channel(TelemetrySnapshot::default());
        let (state, _) = watch::channel(LinkState::Disconnected);
        let (events, _) = broadcast::channel(512);
        Arc::new(Self {
            authority: Mutex::new(ModeAuthority::new(config.mode_authority, config.enforcement_interval())),
            status_log: Mutex::new(StatusLog::new(config.status_log_capacity)),
            config,
            transport: RwLock::new(None),
            target: Mutex::new(Target::default()),
            modes: Mutex::new(ModeTable::default()),
            snapshot,
            state,
            health: Mutex::new(LinkHealth::default()),
            events,
            param_sink: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    // --- read side (UI and other components) ---

    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.snapshot.borrow().clone()
    }

    /// Fires only when a snapshot field actually changed value.
    pub fn subscribe_telemetry(&self) -> watch::Receiver<TelemetrySnapshot> {
        self.snapshot.subscribe()
    }

    pub fn state(&self) -> LinkState {
        self.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state.borrow().is_connected()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    pub fn status_texts(&self) -> Vec<StatusText> {
        lock(&self.status_log).entries()
    }

    pub fn health(&self) -> LinkHealth {
        lock(&self.health).clone()
    }

    pub fn target(&self) -> Target {
        *lock(&self.target)
    }

    pub fn mode_table(&self) -> ModeTable {
        *lock(&self.modes)
    }

    pub fn requested_mode(&self) -> Option<String> {
        lock(&self.authority).requested().map(str::to_string)
    }

    pub fn mode_authority_enabled(&self) -> bool {
        lock(&self.authority).is_enabled()
    }

    pub fn enable_mode_authority(&self) {
        lock(&self.authority).enable();
        info!("link: mode authority enabled, RC mode switch overridden");
    }

    pub fn disable_mode_authority(&self) {
        lock(&self.authority).disable();
        info!("link: mode authority disabled, RC mode switch works normally");
    }

    // --- write path ---

    /// Precondition check: connected and a transport is installed.
    pub fn ensure_connected(&self) -> CommandResult<()> {
        if !self.is_connected() {
            return Err(CommandError::NotConnected("vehicle not connected".into()));
        }
        Ok(())
    }

    pub fn send(&self, msg: &MavMessage) -> CommandResult<()> {
        self.ensure_connected()?;
        let transport = self
            .transport
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| CommandError::NotConnected("no transport".into()))?;
        transport.send(msg)?;
        Ok(())
    }

    pub fn command_long(&self, command: MavCmd, params: [f32; 7]) -> MavMessage {
        let target = self.target();
        MavMessage::COMMAND_LONG(COMMAND_LONG_DATA {
            target_system: target.system,
            target_component: target.component,
            command,
            confirmation: 0,
            param1: params[0],
            param2: params[1],
            param3: params[2],
            param4: params[3],
            param5: params[4],
            param6: params[5],
            param7: params[6],
        })
    }

    /// DO_SET_MODE with the custom-mode flag.
    pub fn set_mode_message(&self, mode_id: u32) -> MavMessage {
        let flag = MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED.bits() as f32;
        self.command_long(MavCmd::MAV_CMD_DO_SET_MODE, [flag, mode_id as f32, 0.0, 0.0, 0.0, 0.0, 0.0])
    }

    // --- crate internals ---

    pub(crate) fn authority(&self) -> MutexGuard<'_, ModeAuthority> {
        lock(&self.authority)
    }

    pub(crate) fn health_mut(&self) -> MutexGuard<'_, LinkHealth> {
        lock(&self.health)
    }

    pub(crate) fn update_snapshot(&self, f: impl FnOnce(&mut TelemetrySnapshot) -> bool) -> bool {
        self.snapshot.send_if_modified(f)
    }

    pub(crate) fn publish(&self, event: LinkEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub(crate) fn push_status_text(&self, entry: StatusText) {
        lock(&self.status_log).push(entry.clone());
        self.publish(LinkEvent::StatusText(entry));
    }

    /// Forwards a parameter to the active fetch, if any. Never blocks.
    pub(crate) fn forward_param(&self, entry: &ParamEntry) {
        let sink = lock(&self.param_sink);
        if let Some(tx) = sink.as_ref() {
            match tx.try_send(entry.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("link: parameter queue full, dropped {} (index {})", entry.name, entry.index);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("link: parameter fetch gone, dropped {}", entry.name);
                }
            }
        }
    }

    pub(crate) fn attach_param_sink(&self, tx: mpsc::Sender<ParamEntry>) -> CommandResult<()> {
        let mut sink = lock(&self.param_sink);
        if sink.as_ref().map(|s| !s.is_closed()).unwrap_or(false) {
            return Err(CommandError::Busy("a parameter fetch is already running".into()));
        }
        *sink = Some(tx);
        Ok(())
    }

    pub(crate) fn detach_param_sink(&self) {
        lock(&self.param_sink).take();
    }

    pub(crate) fn set_state(&self, state: LinkState) {
        self.state.send_if_modified(|s| {
            if *s != state {
                *s = state;
                true
            } else {
                false
            }
        });
    }

    pub(crate) fn install(&self, transport: Arc<dyn Transport>, target: Target, modes: ModeTable) {
        *self.transport.write().unwrap_or_else(|e| e.into_inner()) = Some(transport);
        *lock(&self.target) = target;
        *lock(&self.modes) = modes;
        *lock(&self.health) = LinkHealth { last_update: Some(Instant::now()), ..Default::default() };
    }

    /// Closes and forgets the transport.
    pub(crate) fn drop_transport(&self) {
        if let Some(t) = self.transport.write().unwrap_or_else(|e| e.into_inner()).take() {
            t.close();
        }
    }

    /// Full reset on disconnect: snapshot back to unknown, requested mode and
    /// parameter fetch dropped, state published last so waiters wake up.
    pub(crate) fn teardown(&self, state: LinkState) {
        self.drop_transport();
        self.detach_param_sink();
        self.authority().restore(None);
        lock(&self.status_log).clear();
        self.snapshot.send_if_modified(|s| {
            if *s != TelemetrySnapshot::default() {
                *s = TelemetrySnapshot::default();
                true
            } else {
                false
            }
        });
        self.set_state(state);
    }
}

/// Ground-station heartbeat.
pub fn gcs_heartbeat() -> MavMessage {
    MavMessage::HEARTBEAT(HEARTBEAT_DATA {
        custom_mode: 0,
        mavtype: MavType::MAV_TYPE_GCS,
        autopilot: MavAutopilot::MAV_AUTOPILOT_INVALID,
        base_mode: MavModeFlag::empty(),
        system_status: MavState::MAV_STATE_ACTIVE,
        mavlink_version: 3,
    })
}

/// Resolves once the link is no longer connected.
pub(crate) async fn link_lost(rx: &mut watch::Receiver<LinkState>) {
    loop {
        if !rx.borrow_and_update().is_connected() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}
