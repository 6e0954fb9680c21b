//! Scriptable vehicle double for unit tests.

use mavlink::common::{
    GpsFixType, MavAutopilot, MavCmd, MavMessage, MavModeFlag, MavSeverity, MavType,
    ATTITUDE_DATA, GLOBAL_POSITION_INT_DATA, GPS_RAW_INT_DATA, HEARTBEAT_DATA, STATUSTEXT_DATA,
};
use mavlink::MavHeader;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::config::CoreConfig;
use crate::connection::Connection;
use crate::error::TransportError;
use crate::transport::{Connector, Endpoint, Frame, Transport};

type Responder = Box<dyn Fn(&MavMessage) -> Vec<MavMessage> + Send + Sync>;

/// In-memory transport. Inbound frames are queued by the test or produced
/// by a responder reacting to what the core sends.
pub struct MockTransport {
    inbound: Mutex<VecDeque<Result<Frame, TransportError>>>,
    ready: Condvar,
    sent: Mutex<Vec<MavMessage>>,
    responder: Mutex<Option<Responder>>,
    closed: AtomicBool,
}

pub fn vehicle_header() -> MavHeader {
    MavHeader { system_id: 1, component_id: 1, sequence: 0 }
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inbound: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            sent: Mutex::new(Vec::new()),
            responder: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn push(&self, msg: MavMessage) {
        self.push_result(Ok((vehicle_header(), msg)));
    }

    /// Queues a frame from another component or system.
    pub fn push_from(&self, hdr: MavHeader, msg: MavMessage) {
        self.push_result(Ok((hdr, msg)));
    }

    pub fn push_error(&self, err: TransportError) {
        self.push_result(Err(err));
    }

    fn push_result(&self, item: Result<Frame, TransportError>) {
        self.inbound.lock().unwrap().push_back(item);
        self.ready.notify_all();
    }

    pub fn respond_with(&self, f: impl Fn(&MavMessage) -> Vec<MavMessage> + Send + Sync + 'static) {
        *self.responder.lock().unwrap() = Some(Box::new(f));
    }

    pub fn sent(&self) -> Vec<MavMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn count_commands(&self, command: MavCmd) -> usize {
        self.sent()
            .iter()
            .filter(|m| matches!(m, MavMessage::COMMAND_LONG(c) if c.command == command))
            .count()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Transport for MockTransport {
    fn send(&self, msg: &MavMessage) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.sent.lock().unwrap().push(msg.clone());
        let replies = match self.responder.lock().unwrap().as_ref() {
            Some(f) => f(msg),
            None => Vec::new(),
        };
        for reply in replies {
            self.push(reply);
        }
        Ok(())
    }

    fn recv_timeout(&self, timeout: Duration) -> Result<Option<Frame>, TransportError> {
        let mut queue = self.inbound.lock().unwrap();
        if queue.is_empty() && !self.is_closed() {
            queue = self.ready.wait_timeout(queue, timeout).unwrap().0;
        }
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        match queue.pop_front() {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.ready.notify_all();
    }
}

/// Hands out prepared transports in order; fails once they run out.
pub struct MockConnector {
    transports: Mutex<VecDeque<Arc<MockTransport>>>,
    opens: AtomicUsize,
}

impl MockConnector {
    pub fn new(transports: Vec<Arc<MockTransport>>) -> Arc<Self> {
        Arc::new(Self { transports: Mutex::new(transports.into()), opens: AtomicUsize::new(0) })
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::Acquire)
    }
}

impl Connector for MockConnector {
    fn open(&self, _endpoint: &Endpoint, _sys_id: u8, _comp_id: u8) -> Result<Arc<dyn Transport>, TransportError> {
        self.opens.fetch_add(1, Ordering::AcqRel);
        match self.transports.lock().unwrap().pop_front() {
            Some(t) => Ok(t),
            None => Err(TransportError::Io("connection refused".into())),
        }
    }
}

// --- canned vehicle messages ---

pub fn heartbeat(custom_mode: u32, armed: bool) -> MavMessage {
    let mut base_mode = MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED;
    if armed {
        base_mode |= MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED;
    }
    MavMessage::HEARTBEAT(HEARTBEAT_DATA {
        custom_mode,
        mavtype: MavType::MAV_TYPE_QUADROTOR,
        autopilot: MavAutopilot::MAV_AUTOPILOT_ARDUPILOTMEGA,
        base_mode,
        mavlink_version: 3,
        ..Default::default()
    })
}

pub fn position(lat: f64, lon: f64, relative_alt_m: f32) -> MavMessage {
    MavMessage::GLOBAL_POSITION_INT(GLOBAL_POSITION_INT_DATA {
        lat: (lat * 1e7) as i32,
        lon: (lon * 1e7) as i32,
        alt: ((relative_alt_m + 400.0) * 1000.0) as i32,
        relative_alt: (relative_alt_m * 1000.0) as i32,
        ..Default::default()
    })
}

pub fn attitude(roll_deg: f32, pitch_deg: f32) -> MavMessage {
    MavMessage::ATTITUDE(ATTITUDE_DATA {
        roll: roll_deg.to_radians(),
        pitch: pitch_deg.to_radians(),
        ..Default::default()
    })
}

pub fn gps_fix(fix_type: GpsFixType, satellites: u8) -> MavMessage {
    MavMessage::GPS_RAW_INT(GPS_RAW_INT_DATA {
        fix_type,
        satellites_visible: satellites,
        eph: 90,
        epv: 140,
        ..Default::default()
    })
}

pub fn statustext(text: &str) -> MavMessage {
    let mut raw = [0u8; 50];
    let n = text.len().min(50);
    raw[..n].copy_from_slice(&text.as_bytes()[..n]);
    MavMessage::STATUSTEXT(STATUSTEXT_DATA {
        severity: MavSeverity::MAV_SEVERITY_INFO,
        text: raw,
        ..Default::default()
    })
}

/// Short timeouts so failure paths finish quickly.
pub fn fast_config() -> CoreConfig {
    let mut cfg = CoreConfig::default();
    cfg.link.handshake_timeout_ms = 500;
    cfg.link.poll_ms = 5;
    cfg.link.telemetry_grace_ms = 60_000;
    cfg.link.reconnect_base_ms = 10;
    cfg.link.reconnect_max_ms = 20;
    cfg.commands.burst_spacing_ms = 5;
    cfg.commands.arm_timeout_ms = 300;
    cfg.commands.mode_timeout_ms = 300;
    cfg.commands.mode_cooldown_ms = 0;
    cfg.commands.takeoff_arm_wait_ms = 300;
    cfg.commands.takeoff_confirm_ms = 300;
    cfg.commands.ack_timeout_ms = 300;
    cfg.commands.auto_disarm_dwell_ms = 50;
    cfg.commands.poll_ms = 5;
    cfg.mission.clear_timeout_ms = 300;
    cfg.mission.first_request_timeout_ms = 300;
    cfg.mission.item_request_timeout_ms = 300;
    cfg.mission.final_ack_timeout_ms = 300;
    cfg.params.repeat_spacing_ms = 5;
    cfg.params.no_data_timeout_ms = 200;
    cfg.params.overall_timeout_ms = 2_000;
    cfg.params.set_timeout_ms = 300;
    cfg.params.poll_ms = 5;
    cfg
}

/// Connected core talking to a quadrotor in `custom_mode`.
pub async fn connected(cfg: CoreConfig, custom_mode: u32) -> (Connection, Arc<MockTransport>) {
    let transport = MockTransport::new();
    transport.push(heartbeat(custom_mode, false));
    let connector = MockConnector::new(vec![transport.clone()]);
    let conn = Connection::new(cfg, connector);
    conn.connect("udpin:0.0.0.0:14550", 57600).await.expect("connect");
    (conn, transport)
}

/// Waits until the snapshot satisfies `pred` or panics after two seconds.
pub async fn wait_for(link: &crate::link::Link, pred: impl Fn(&gcs_proto::telemetry::TelemetrySnapshot) -> bool) {
    let mut rx = link.subscribe_telemetry();
    let res = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if pred(&rx.borrow_and_update()) {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    })
    .await;
    assert!(res.is_ok(), "snapshot condition not reached");
}
