//! Mode authority (ground station vs RC switch) and mode-change debouncing.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::CommandError;

/// What the ingest engine should do with a mode observed on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModeVerdict {
    /// Show the observed mode as is.
    Accept,
    /// The vehicle reports the requested mode.
    Confirmed,
    /// Observed mode violates the requested one. Display `displayed`; send a
    /// mode-set command when `reassert` is true.
    Override { displayed: String, reassert: bool },
}

#[derive(Debug, Clone)]
pub struct ModeAuthority {
    enabled: bool,
    requested: Option<String>,
    last_enforcement: Option<Instant>,
    interval: Duration,
}

impl ModeAuthority {
    pub fn new(enabled: bool, interval: Duration) -> Self {
        Self { enabled, requested: None, last_enforcement: None, interval }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn requested(&self) -> Option<&str> {
        self.requested.as_deref()
    }

    pub fn last_enforcement(&self) -> Option<Instant> {
        self.last_enforcement
    }

    /// Registers a ground-station mode and returns the one it replaces. The
    /// caller's own mode-set send counts as the first assertion.
    pub fn request(&mut self, mode: &str, now: Instant) -> Option<String> {
        self.last_enforcement = Some(now);
        self.requested.replace(mode.to_ascii_uppercase())
    }

    /// Puts back a previously requested mode (or none).
    pub fn restore(&mut self, previous: Option<String>) {
        self.requested = previous;
        self.last_enforcement = None;
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    /// RC mode switch works normally again; the requested mode is forgotten.
    pub fn disable(&mut self) {
        self.enabled = false;
        self.requested = None;
        self.last_enforcement = None;
    }

    pub fn observe(&mut self, observed: &str, now: Instant) -> ModeVerdict {
        let Some(requested) = self.requested.as_ref() else {
            return ModeVerdict::Accept;
        };
        if observed == requested {
            self.last_enforcement = None;
            return ModeVerdict::Confirmed;
        }
        if !self.enabled {
            return ModeVerdict::Accept;
        }
        let reassert = match self.last_enforcement {
            Some(t) => now.saturating_duration_since(t) >= self.interval,
            None => true,
        };
        if reassert {
            self.last_enforcement = Some(now);
        }
        ModeVerdict::Override { displayed: requested.clone(), reassert }
    }
}

/// Debounce for mode changes: one in flight, then a cooldown.
#[derive(Debug)]
pub struct ModeChangeGate {
    in_flight: bool,
    last_change: Option<Instant>,
    cooldown: Duration,
}

impl ModeChangeGate {
    pub fn new(cooldown: Duration) -> Self {
        Self { in_flight: false, last_change: None, cooldown }
    }

    fn begin(&mut self, now: Instant, respect_cooldown: bool) -> Result<(), CommandError> {
        if self.in_flight {
            return Err(CommandError::Busy("a mode change is already in progress".into()));
        }
        if respect_cooldown {
            if let Some(t) = self.last_change {
                let since = now.saturating_duration_since(t);
                if since < self.cooldown {
                    return Err(CommandError::Busy(format!(
                        "mode changed {}ms ago, wait {}ms",
                        since.as_millis(),
                        (self.cooldown - since).as_millis()
                    )));
                }
            }
        }
        self.in_flight = true;
        Ok(())
    }

    fn finish(&mut self, now: Instant) {
        self.in_flight = false;
        self.last_change = Some(now);
    }
}

/// Held for the duration of one mode change; releases the gate on drop, so a
/// cancelled request never leaves the gate stuck.
#[derive(Debug)]
pub struct ModeChangeTicket {
    gate: Arc<Mutex<ModeChangeGate>>,
}

impl ModeChangeTicket {
    pub fn acquire(gate: &Arc<Mutex<ModeChangeGate>>, now: Instant, respect_cooldown: bool) -> Result<Self, CommandError> {
        gate.lock()
            .unwrap_or_else(|e| e.into_inner())
            .begin(now, respect_cooldown)?;
        Ok(Self { gate: gate.clone() })
    }
}

impl Drop for ModeChangeTicket {
    fn drop(&mut self) {
        self.gate
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .finish(Instant::now());
    }
}
