//! Telemetry ingest: the only writer of the shared snapshot.
//!
//! Runs on a blocking thread, pulls frames from the transport and applies
//! each one to the snapshot, touching only the fields that message carries.
//! Protocol replies (acks, mission requests, parameters) are republished as
//! [`LinkEvent`]s for whichever operation is waiting on them.

use gcs_proto::params::ParamEntry;
use gcs_proto::telemetry::{Attitude, GpsStatus, Position, StatusText, TelemetrySnapshot};
use mavlink::common::{MavAutopilot, MavMessage, MavModeFlag, MavType, HEARTBEAT_DATA};
use mavlink::MavHeader;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::authority::ModeVerdict;
use crate::error::TransportError;
use crate::link::{gcs_heartbeat, Link, LinkEvent};
use crate::transport::Transport;

pub struct IngestEngine {
    link: Arc<Link>,
    transport: Arc<dyn Transport>,
    last_gcs_heartbeat: Option<Instant>,
}

fn set<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot != value {
        *slot = value;
        true
    } else {
        false
    }
}

/// Vehicle heartbeat from an autopilot, not a GCS or peripheral.
pub(crate) fn is_autopilot_heartbeat(hb: &HEARTBEAT_DATA) -> bool {
    hb.mavtype != MavType::MAV_TYPE_GCS && hb.autopilot != MavAutopilot::MAV_AUTOPILOT_INVALID
}

/// NUL-terminated char array to String.
pub(crate) fn c_str(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_string()
}

fn unix_ms() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

impl IngestEngine {
    pub fn new(link: Arc<Link>, transport: Arc<dyn Transport>) -> Self {
        Self { link, transport, last_gcs_heartbeat: None }
    }

    /// Blocking receive loop. Returns when `stop` is raised or the link is
    /// declared lost, in which case the reason goes to `lost`.
    pub fn run(mut self, stop: Arc<AtomicBool>, lost: mpsc::UnboundedSender<String>) {
        let cfg = self.link.config().clone();
        let poll = cfg.poll_interval();
        let mut failures: u32 = 0;
        info!("ingest: started");

        while !stop.load(Ordering::Acquire) {
            self.heartbeat_tick(Instant::now());

            match self.transport.recv_timeout(poll) {
                Ok(Some((hdr, msg))) => {
                    failures = 0;
                    self.link.health_mut().consecutive_failures = 0;
                    self.process(&hdr, &msg, Instant::now());
                }
                Ok(None) => {}
                Err(TransportError::Closed) => {
                    if !stop.load(Ordering::Acquire) {
                        let _ = lost.send("transport closed".to_string());
                    }
                    break;
                }
                Err(e) => {
                    failures += 1;
                    {
                        let mut health = self.link.health_mut();
                        health.decode_errors += 1;
                        health.consecutive_failures = failures;
                    }
                    debug!("ingest: receive failed ({}/{}): {}", failures, cfg.failure_ceiling, e);
                    if failures >= cfg.failure_ceiling {
                        warn!("ingest: {} consecutive receive failures, giving up", failures);
                        let _ = lost.send(format!("{} consecutive receive failures: {}", failures, e));
                        break;
                    }
                }
            }
        }
        info!("ingest: stopped");
    }

    fn heartbeat_tick(&mut self, now: Instant) {
        let interval = self.link.config().gcs_heartbeat_interval();
        let due = self
            .last_gcs_heartbeat
            .map(|t| now.saturating_duration_since(t) >= interval)
            .unwrap_or(true);
        if !due {
            return;
        }
        self.last_gcs_heartbeat = Some(now);
        if let Err(e) = self.transport.send(&gcs_heartbeat()) {
            debug!("ingest: heartbeat send failed: {}", e);
        }
    }

    /// Applies one frame. Returns true when the snapshot changed.
    pub fn process(&self, hdr: &MavHeader, msg: &MavMessage, now: Instant) -> bool {
        let target = self.link.target();
        if hdr.system_id != target.system {
            return false;
        }
        if let MavMessage::HEARTBEAT(hb) = msg {
            // Ground stations, companions and gimbals can share the system id;
            // only the autopilot's heartbeat carries the vehicle mode.
            let component = if hdr.component_id == 0 { 1 } else { hdr.component_id };
            if !is_autopilot_heartbeat(hb) || component != target.component {
                return false;
            }
        }

        {
            let mut health = self.link.health_mut();
            health.messages += 1;
            health.last_update = Some(now);
            if matches!(msg, MavMessage::HEARTBEAT(_)) {
                health.last_heartbeat = Some(now);
            }
        }

        match msg {
            MavMessage::HEARTBEAT(hb) => self.apply_heartbeat(hb, now),
            MavMessage::GLOBAL_POSITION_INT(p) => {
                let position = Position {
                    lat: p.lat as f64 / 1e7,
                    lon: p.lon as f64 / 1e7,
                    alt: p.alt as f32 / 1000.0,
                    relative_alt: p.relative_alt as f32 / 1000.0,
                };
                self.link.update_snapshot(|s| set(&mut s.position, Some(position)))
            }
            MavMessage::ATTITUDE(a) => {
                let attitude = Attitude {
                    roll: a.roll.to_degrees(),
                    pitch: a.pitch.to_degrees(),
                    yaw: a.yaw.to_degrees(),
                };
                self.link.update_snapshot(|s| set(&mut s.attitude, Some(attitude)))
            }
            MavMessage::GPS_RAW_INT(g) => self.link.update_snapshot(|s| {
                let prev = s.gps;
                // eph/epv are cm; u16::MAX means unknown, keep what we had.
                let hdop = if g.eph != u16::MAX { Some(g.eph as f32 / 100.0) } else { prev.and_then(|p| p.hdop) };
                let vdop = if g.epv != u16::MAX { Some(g.epv as f32 / 100.0) } else { prev.and_then(|p| p.vdop) };
                let gps = GpsStatus {
                    fix_type: g.fix_type as u8,
                    satellites_visible: g.satellites_visible,
                    hdop,
                    vdop,
                };
                set(&mut s.gps, Some(gps))
            }),
            MavMessage::VFR_HUD(v) => self.link.update_snapshot(|s| {
                let mut changed = set(&mut s.heading, Some(v.heading));
                changed |= set(&mut s.groundspeed, Some(v.groundspeed));
                changed |= set(&mut s.airspeed, Some(v.airspeed));
                changed
            }),
            MavMessage::SYS_STATUS(st) => self.link.update_snapshot(|s| {
                let mut battery = s.battery;
                // millivolts
                if st.voltage_battery != u16::MAX {
                    battery.voltage = Some(st.voltage_battery as f32 / 1000.0);
                }
                // centiamps, -1 invalid
                if st.current_battery != -1 {
                    battery.current = Some(st.current_battery as f32 / 100.0);
                }
                if (0..=100).contains(&st.battery_remaining) {
                    battery.remaining_pct = Some(st.battery_remaining as u8);
                }
                set(&mut s.battery, battery)
            }),
            MavMessage::STATUSTEXT(st) => {
                let entry = StatusText {
                    ts_unix_ms: unix_ms(),
                    severity: st.severity as u8,
                    text: c_str(&st.text),
                };
                info!("vehicle: [{}] {}", entry.severity, entry.text);
                self.link.push_status_text(entry);
                false
            }
            MavMessage::COMMAND_ACK(ack) => {
                debug!("ingest: COMMAND_ACK {:?} -> {:?}", ack.command, ack.result);
                self.link.publish(LinkEvent::CommandAck { command: ack.command, result: ack.result });
                false
            }
            MavMessage::MISSION_REQUEST(r) => {
                self.link.publish(LinkEvent::MissionRequest { seq: r.seq });
                false
            }
            MavMessage::MISSION_REQUEST_INT(r) => {
                self.link.publish(LinkEvent::MissionRequest { seq: r.seq });
                false
            }
            MavMessage::MISSION_ACK(a) => {
                self.link.publish(LinkEvent::MissionAck { result: a.mavtype });
                false
            }
            MavMessage::PARAM_VALUE(p) => {
                let entry = ParamEntry {
                    name: c_str(&p.param_id),
                    value: p.param_value,
                    param_type: p.param_type as u8,
                    index: p.param_index,
                    declared_count: p.param_count,
                };
                self.link.forward_param(&entry);
                self.link.publish(LinkEvent::ParamValue(entry));
                false
            }
            _ => false,
        }
    }

    fn apply_heartbeat(&self, hb: &HEARTBEAT_DATA, now: Instant) -> bool {
        let modes = self.link.mode_table();
        let reported = modes.name(hb.custom_mode);
        let armed = hb.base_mode.contains(MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED);

        let verdict = self.link.authority().observe(&reported, now);
        let displayed = match verdict {
            ModeVerdict::Override { displayed, reassert } => {
                if reassert {
                    self.reassert(&displayed, &reported);
                }
                displayed
            }
            ModeVerdict::Confirmed => {
                debug!("ingest: vehicle confirmed mode {}", reported);
                reported.clone()
            }
            ModeVerdict::Accept => reported.clone(),
        };

        self.link.update_snapshot(|s: &mut TelemetrySnapshot| {
            let mut changed = set(&mut s.mode, Some(displayed));
            changed |= set(&mut s.reported_mode, Some(reported));
            changed |= set(&mut s.armed, Some(armed));
            changed
        })
    }

    fn reassert(&self, wanted: &str, observed: &str) {
        let Some(id) = self.link.mode_table().id(wanted) else {
            warn!("ingest: cannot re-assert unknown mode {}", wanted);
            return;
        };
        info!("ingest: vehicle reports {}, re-asserting {}", observed, wanted);
        if let Err(e) = self.transport.send(&self.link.set_mode_message(id)) {
            warn!("ingest: mode re-assert send failed: {}", e);
        }
    }
}
