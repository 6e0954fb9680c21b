use gcs_proto::telemetry::StatusText;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// Reconnection gave up.
    Failed { reason: String },
}

impl LinkState {
    pub fn is_connected(&self) -> bool {
        matches!(self, LinkState::Connected)
    }
}

/// Receive-side health counters, written by the ingest engine.
#[derive(Debug, Clone, Default)]
pub struct LinkHealth {
    pub last_heartbeat: Option<Instant>,
    pub last_update: Option<Instant>,
    pub messages: u64,
    pub decode_errors: u64,
    pub consecutive_failures: u32,
}

impl LinkHealth {
    pub fn hb_age(&self) -> Option<Duration> {
        self.last_heartbeat.map(|t| t.elapsed())
    }

    /// Time since anything from the vehicle was applied.
    pub fn silence(&self, now: Instant) -> Option<Duration> {
        self.last_update.map(|t| now.saturating_duration_since(t))
    }
}

/// Bounded STATUSTEXT history; the oldest entry is dropped first.
#[derive(Debug, Clone)]
pub struct StatusLog {
    entries: VecDeque<StatusText>,
    capacity: usize,
}

impl StatusLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { entries: VecDeque::with_capacity(capacity), capacity }
    }

    pub fn push(&mut self, entry: StatusText) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn entries(&self) -> Vec<StatusText> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
