//! Parameter synchronization.
//!
//! A fetch runs as a background worker. The ingest engine forwards every
//! PARAM_VALUE into a queue the worker drains, so hundreds of parameters
//! never slow telemetry decoding. The finished set replaces the cached one
//! in a single swap.

use gcs_proto::params::ParamEntry;
use mavlink::common::{MavMessage, MavParamType, PARAM_REQUEST_LIST_DATA, PARAM_SET_DATA};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ParamConfig;
use crate::error::{CommandError, CommandResult};
use crate::link::{link_lost, Link, LinkEvent};

const PARAM_ID_LEN: usize = 16;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterSet {
    entries: BTreeMap<String, ParamEntry>,
}

impl ParameterSet {
    pub fn get(&self, name: &str) -> Option<&ParamEntry> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ParamEntry> {
        self.entries.values()
    }

    fn replace(&mut self, entry: ParamEntry) {
        self.entries.insert(entry.name.clone(), entry);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchState {
    Idle,
    Running { received: usize, declared: Option<u16> },
    /// `received < declared` when the vehicle went quiet early.
    Complete { received: usize, declared: u16 },
    Failed { reason: String },
}

impl FetchState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FetchState::Complete { .. } | FetchState::Failed { .. })
    }
}

/// Collects one fetch. Duplicate names are ignored.
#[derive(Debug)]
pub struct ParamAccumulator {
    set: ParameterSet,
    declared: Option<u16>,
    started: Instant,
    last_new: Option<Instant>,
    no_data_timeout: Duration,
    overall_timeout: Duration,
}

impl ParamAccumulator {
    pub fn new(cfg: &ParamConfig, now: Instant) -> Self {
        Self {
            set: ParameterSet::default(),
            declared: None,
            started: now,
            last_new: None,
            no_data_timeout: cfg.no_data_timeout(),
            overall_timeout: cfg.overall_timeout(),
        }
    }

    pub fn received(&self) -> usize {
        self.set.len()
    }

    pub fn declared(&self) -> Option<u16> {
        self.declared
    }

    /// True if `entry` was new.
    pub fn accept(&mut self, entry: ParamEntry, now: Instant) -> bool {
        if self.declared.is_none() && entry.declared_count > 0 {
            self.declared = Some(entry.declared_count);
        }
        if entry.name.is_empty() || self.set.entries.contains_key(&entry.name) {
            return false;
        }
        self.set.replace(entry);
        self.last_new = Some(now);
        true
    }

    /// Terminal state once one of the end conditions holds.
    pub fn verdict(&self, now: Instant) -> Option<FetchState> {
        let received = self.received();
        let declared = self.declared.unwrap_or(received as u16);
        if let Some(d) = self.declared {
            if received >= d as usize {
                return Some(FetchState::Complete { received, declared: d });
            }
        }
        if let Some(last) = self.last_new {
            if now.saturating_duration_since(last) >= self.no_data_timeout {
                return Some(FetchState::Complete { received, declared });
            }
        }
        if now.saturating_duration_since(self.started) >= self.overall_timeout {
            return Some(if received > 0 {
                FetchState::Complete { received, declared }
            } else {
                FetchState::Failed { reason: "no parameters received".into() }
            });
        }
        None
    }

    pub fn into_set(self) -> ParameterSet {
        self.set
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SetOutcome {
    Confirmed(ParamEntry),
    /// Vehicle applied a different value (clamped or rounded).
    Mismatch { requested: f32, applied: ParamEntry },
}

struct Inner {
    link: Arc<Link>,
    cfg: ParamConfig,
    params: watch::Sender<Arc<ParameterSet>>,
    state: watch::Sender<FetchState>,
}

#[derive(Clone)]
pub struct ParameterSync {
    inner: Arc<Inner>,
}

/// Running fetch. Dropping it does not cancel the worker.
pub struct FetchHandle {
    handle: JoinHandle<FetchState>,
}

impl FetchHandle {
    pub async fn wait(self) -> FetchState {
        match self.handle.await {
            Ok(state) => state,
            Err(e) => FetchState::Failed { reason: format!("fetch worker failed: {}", e) },
        }
    }
}

impl ParameterSync {
    pub fn new(link: Arc<Link>, cfg: ParamConfig) -> Self {
        let (params, _) = watch::channel(Arc::new(ParameterSet::default()));
        let (state, _) = watch::channel(FetchState::Idle);
        Self { inner: Arc::new(Inner { link, cfg, params, state }) }
    }

    pub fn parameters(&self) -> Arc<ParameterSet> {
        self.inner.params.borrow().clone()
    }

    /// Fires once per completed fetch and once per confirmed set.
    pub fn subscribe(&self) -> watch::Receiver<Arc<ParameterSet>> {
        self.inner.params.subscribe()
    }

    pub fn state(&self) -> FetchState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<FetchState> {
        self.inner.state.subscribe()
    }

    pub fn fetch_all(&self) -> CommandResult<FetchHandle> {
        let link = &self.inner.link;
        link.ensure_connected()?;
        let (tx, rx) = mpsc::channel(1024);
        link.attach_param_sink(tx)?;
        self.inner.state.send_replace(FetchState::Running { received: 0, declared: None });
        info!("params: fetching all parameters");
        let inner = self.inner.clone();
        Ok(FetchHandle { handle: tokio::spawn(run_fetch(inner, rx)) })
    }

    pub async fn set_param(&self, name: &str, value: f32) -> CommandResult<SetOutcome> {
        let link = &self.inner.link;
        link.ensure_connected()?;
        let name = name.trim().to_ascii_uppercase();
        if name.is_empty() || name.len() > PARAM_ID_LEN {
            return Err(CommandError::ProtocolViolation(format!("invalid parameter name {:?}", name)));
        }
        let param_type = self.parameters().get(&name).map(|p| p.param_type).unwrap_or(9);

        let mut events = link.subscribe_events();
        let mut link_state = link.subscribe_state();
        let target = link.target();
        link.send(&MavMessage::PARAM_SET(PARAM_SET_DATA {
            param_value: value,
            target_system: target.system,
            target_component: target.component,
            param_id: encode_param_id(&name),
            param_type: mav_param_type(param_type),
        }))?;
        info!("params: set {} = {}", name, value);

        let timeout = self.inner.cfg.set_timeout();
        let echo = tokio::time::timeout(timeout, async {
            loop {
                tokio::select! {
                    _ = link_lost(&mut link_state) => {
                        return Err(CommandError::NotConnected("connection lost during parameter set".into()));
                    }
                    ev = events.recv() => match ev {
                        Ok(LinkEvent::ParamValue(entry)) if entry.name == name => return Ok(entry),
                        Ok(_) => {}
                        Err(RecvError::Lagged(n)) => debug!("params: skipped {} link events", n),
                        Err(RecvError::Closed) => return Err(CommandError::NotConnected("link closed".into())),
                    },
                }
            }
        })
        .await
        .map_err(|_| CommandError::Timeout(format!("no echo for {} within {}ms", name, timeout.as_millis())))??;

        self.inner.params.send_modify(|set| Arc::make_mut(set).replace(echo.clone()));
        if values_match(echo.value, value) {
            Ok(SetOutcome::Confirmed(echo))
        } else {
            warn!("params: {} requested {} but vehicle applied {}", name, value, echo.value);
            Ok(SetOutcome::Mismatch { requested: value, applied: echo })
        }
    }
}

async fn run_fetch(inner: Arc<Inner>, mut rx: mpsc::Receiver<ParamEntry>) -> FetchState {
    let link = &inner.link;
    let cfg = &inner.cfg;
    let mut link_state = link.subscribe_state();
    let target = link.target();
    let request = MavMessage::PARAM_REQUEST_LIST(PARAM_REQUEST_LIST_DATA {
        target_system: target.system,
        target_component: target.component,
    });

    let mut acc = ParamAccumulator::new(cfg, Instant::now());
    let mut repeats = tokio::time::interval(cfg.repeat_spacing());
    let mut tick = tokio::time::interval(cfg.poll_interval());
    let mut sent = 0;

    let end = loop {
        tokio::select! {
            biased;
            _ = link_lost(&mut link_state) => {
                break FetchState::Failed { reason: "connection lost".into() };
            }
            _ = repeats.tick(), if sent < cfg.request_repeats => {
                if let Err(e) = link.send(&request) {
                    break FetchState::Failed { reason: e.to_string() };
                }
                sent += 1;
            }
            entry = rx.recv() => match entry {
                Some(entry) => {
                    let now = Instant::now();
                    if acc.accept(entry, now) {
                        inner.state.send_replace(FetchState::Running {
                            received: acc.received(),
                            declared: acc.declared(),
                        });
                    }
                    if let Some(end) = acc.verdict(now) {
                        break end;
                    }
                }
                None => break FetchState::Failed { reason: "fetch cancelled".into() },
            },
            _ = tick.tick() => {
                if let Some(end) = acc.verdict(Instant::now()) {
                    break end;
                }
            }
        }
    };
    link.detach_param_sink();

    match &end {
        FetchState::Complete { received, declared } => {
            if (*received as u16) < *declared {
                warn!("params: fetch ended with {}/{} parameters", received, declared);
            } else {
                info!("params: fetched {} parameters", received);
            }
            inner.params.send_replace(Arc::new(acc.into_set()));
        }
        FetchState::Failed { reason } => warn!("params: fetch failed: {}", reason),
        _ => {}
    }
    inner.state.send_replace(end.clone());
    end
}

fn encode_param_id(name: &str) -> [u8; PARAM_ID_LEN] {
    let mut id = [0u8; PARAM_ID_LEN];
    let bytes = name.as_bytes();
    let n = bytes.len().min(PARAM_ID_LEN);
    id[..n].copy_from_slice(&bytes[..n]);
    id
}

fn mav_param_type(code: u8) -> MavParamType {
    match code {
        1 => MavParamType::MAV_PARAM_TYPE_UINT8,
        2 => MavParamType::MAV_PARAM_TYPE_INT8,
        3 => MavParamType::MAV_PARAM_TYPE_UINT16,
        4 => MavParamType::MAV_PARAM_TYPE_INT16,
        5 => MavParamType::MAV_PARAM_TYPE_UINT32,
        6 => MavParamType::MAV_PARAM_TYPE_INT32,
        7 => MavParamType::MAV_PARAM_TYPE_UINT64,
        8 => MavParamType::MAV_PARAM_TYPE_INT64,
        10 => MavParamType::MAV_PARAM_TYPE_REAL64,
        _ => MavParamType::MAV_PARAM_TYPE_REAL32,
    }
}

fn values_match(applied: f32, requested: f32) -> bool {
    (applied - requested).abs() <= 1e-5 * requested.abs().max(1.0)
}
