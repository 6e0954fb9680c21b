//! Mission upload: request-driven MISSION_COUNT / MISSION_REQUEST(_INT) /
//! MISSION_ITEM_INT / MISSION_ACK exchange.
//!
//! Sequence 0 is always a synthetic takeoff at the current position; the
//! operator's waypoints follow from sequence 1.

use gcs_proto::mission::MissionPlan;
use mavlink::common::{
    MavCmd, MavFrame, MavMessage, MavMissionResult, MISSION_CLEAR_ALL_DATA, MISSION_COUNT_DATA,
    MISSION_ITEM_INT_DATA,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::MissionConfig;
use crate::error::{CommandError, CommandResult};
use crate::link::{link_lost, Link, LinkEvent};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MissionItem {
    pub seq: u16,
    pub command: MavCmd,
    pub lat: f64,
    pub lon: f64,
    pub alt: f32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadState {
    Idle,
    AwaitingInitialRequest,
    Streaming { next: u16 },
    AwaitingAck,
    Complete,
    Failed { reason: String },
}

impl UploadState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadState::Complete | UploadState::Failed { .. })
    }
}

/// Caller waypoints that fit in a MISSION_COUNT alongside the takeoff item.
pub const MAX_WAYPOINTS: usize = u16::MAX as usize - 1;

/// Takeoff item followed by the plan's waypoints.
pub fn build_items(plan: &MissionPlan, here: Option<(f64, f64)>, default_takeoff_alt: f32) -> Vec<MissionItem> {
    let Some(first) = plan.waypoints.first() else {
        return Vec::new();
    };
    let (lat, lon) = here.unwrap_or((first.lat, first.lon));
    let alt = if first.alt > 0.0 { first.alt } else { default_takeoff_alt };

    let mut items = Vec::with_capacity(plan.waypoints.len() + 1);
    items.push(MissionItem { seq: 0, command: MavCmd::MAV_CMD_NAV_TAKEOFF, lat, lon, alt });
    for (i, wp) in plan.waypoints.iter().enumerate() {
        items.push(MissionItem {
            seq: (i + 1) as u16,
            command: MavCmd::MAV_CMD_NAV_WAYPOINT,
            lat: wp.lat,
            lon: wp.lon,
            alt: wp.alt,
        });
    }
    items
}

/// Upload handshake state machine. Time is passed in by the caller.
#[derive(Debug)]
pub struct MissionUploadSession {
    items: Vec<MissionItem>,
    state: UploadState,
    deadline: Option<Instant>,
    first_request_timeout: Duration,
    item_request_timeout: Duration,
    final_ack_timeout: Duration,
}

impl MissionUploadSession {
    pub fn new(items: Vec<MissionItem>, cfg: &MissionConfig) -> Self {
        Self {
            items,
            state: UploadState::Idle,
            deadline: None,
            first_request_timeout: cfg.first_request_timeout(),
            item_request_timeout: cfg.item_request_timeout(),
            final_ack_timeout: cfg.final_ack_timeout(),
        }
    }

    pub fn state(&self) -> &UploadState {
        &self.state
    }

    pub fn count(&self) -> u16 {
        u16::try_from(self.items.len()).unwrap_or(u16::MAX)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Count has been announced.
    pub fn begin(&mut self, now: Instant) {
        self.state = UploadState::AwaitingInitialRequest;
        self.deadline = Some(now + self.first_request_timeout);
    }

    /// Vehicle asked for `seq`. Returns the item to send.
    pub fn on_request(&mut self, seq: u16, now: Instant) -> CommandResult<MissionItem> {
        let expected = match self.state {
            UploadState::AwaitingInitialRequest => 0,
            UploadState::Streaming { next } => next,
            // Our last item got lost; the vehicle asks again.
            UploadState::AwaitingAck => self.count().saturating_sub(1),
            _ => {
                return Err(self.fail(CommandError::ProtocolViolation(format!(
                    "unexpected request for item {} in state {:?}",
                    seq, self.state
                ))));
            }
        };
        let Some(item) = self.items.get(seq as usize).copied() else {
            return Err(self.fail(CommandError::ProtocolViolation(format!(
                "vehicle requested item {} of {}",
                seq,
                self.count()
            ))));
        };
        if seq > expected {
            warn!("mission: vehicle skipped to item {} (expected {}), resyncing", seq, expected);
        } else if seq < expected {
            debug!("mission: vehicle re-requested item {}", seq);
        }

        if seq + 1 >= self.count() {
            self.state = UploadState::AwaitingAck;
            self.deadline = Some(now + self.final_ack_timeout);
        } else {
            self.state = UploadState::Streaming { next: seq + 1 };
            self.deadline = Some(now + self.item_request_timeout);
        }
        Ok(item)
    }

    /// `None` means the ack does not end the upload yet.
    pub fn on_ack(&mut self, result: MavMissionResult) -> Option<CommandResult<()>> {
        match (&self.state, result) {
            (UploadState::AwaitingAck | UploadState::Streaming { .. }, MavMissionResult::MAV_MISSION_ACCEPTED) => {
                self.state = UploadState::Complete;
                self.deadline = None;
                Some(Ok(()))
            }
            // Late acknowledgment of the clear; not ours.
            (UploadState::AwaitingInitialRequest, MavMissionResult::MAV_MISSION_ACCEPTED) => None,
            (UploadState::AwaitingInitialRequest | UploadState::Streaming { .. } | UploadState::AwaitingAck, other) => {
                Some(Err(self.fail(CommandError::Denied(format!("vehicle rejected mission: {:?}", other)))))
            }
            _ => None,
        }
    }

    pub fn on_timeout(&mut self) -> CommandError {
        let reason = match &self.state {
            UploadState::AwaitingInitialRequest => "no request for the first mission item".to_string(),
            UploadState::Streaming { next } => format!("no request for mission item {}", next),
            UploadState::AwaitingAck => "no final mission acknowledgment".to_string(),
            other => format!("timed out in state {:?}", other),
        };
        self.fail(CommandError::Timeout(reason))
    }

    pub fn fail(&mut self, err: CommandError) -> CommandError {
        self.state = UploadState::Failed { reason: err.to_string() };
        self.deadline = None;
        err
    }
}

/// Drives uploads over a link. One upload at a time.
pub struct MissionUploader {
    link: Arc<Link>,
    cfg: MissionConfig,
    state: watch::Sender<UploadState>,
    running: tokio::sync::Mutex<()>,
}

impl MissionUploader {
    pub fn new(link: Arc<Link>, cfg: MissionConfig) -> Self {
        let (state, _) = watch::channel(UploadState::Idle);
        Self { link, cfg, state, running: tokio::sync::Mutex::new(()) }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<UploadState> {
        self.state.subscribe()
    }

    pub async fn upload(&self, plan: &MissionPlan) -> CommandResult<()> {
        self.link.ensure_connected()?;
        if plan.waypoints.is_empty() {
            return Err(CommandError::Precondition("mission has no waypoints".into()));
        }
        if plan.waypoints.len() > MAX_WAYPOINTS {
            return Err(CommandError::Precondition(format!(
                "mission has {} waypoints, at most {} fit in one upload",
                plan.waypoints.len(),
                MAX_WAYPOINTS
            )));
        }
        let _guard = self
            .running
            .try_lock()
            .map_err(|_| CommandError::Busy("a mission upload is already running".into()))?;

        let here = self.link.snapshot().position.map(|p| (p.lat, p.lon));
        if here.is_none() {
            warn!("mission: no vehicle position, takeoff item uses the first waypoint");
        }
        let items = build_items(plan, here, self.cfg.default_takeoff_alt_m);
        let mut session = MissionUploadSession::new(items, &self.cfg);

        let res = self.run(&mut session).await;
        if let Err(e) = &res {
            if !session.state().is_terminal() {
                session.fail(e.clone());
            }
            warn!("mission: upload failed: {}", e);
        } else {
            info!("mission: {} items accepted", session.count());
        }
        self.state.send_replace(session.state().clone());
        res
    }

    async fn run(&self, session: &mut MissionUploadSession) -> CommandResult<()> {
        let mut events = self.link.subscribe_events();
        let mut link_state = self.link.subscribe_state();
        let target = self.link.target();

        if self.cfg.clear_before_upload {
            self.clear(&mut events).await?;
        }

        info!("mission: uploading {} items (takeoff + {})", session.count(), session.count() - 1);
        self.link.send(&MavMessage::MISSION_COUNT(MISSION_COUNT_DATA {
            count: session.count(),
            target_system: target.system,
            target_component: target.component,
            ..Default::default()
        }))?;
        session.begin(Instant::now());
        self.state.send_replace(session.state().clone());

        loop {
            let deadline = session.deadline().unwrap_or_else(Instant::now);
            tokio::select! {
                _ = link_lost(&mut link_state) => {
                    return Err(CommandError::NotConnected("connection lost during mission upload".into()));
                }
                _ = tokio::time::sleep_until(deadline.into()) => {
                    return Err(session.on_timeout());
                }
                ev = events.recv() => match ev {
                    Ok(LinkEvent::MissionRequest { seq }) => {
                        let item = session.on_request(seq, Instant::now())?;
                        debug!("mission: sending item {}", item.seq);
                        self.link.send(&self.item_message(&item))?;
                        self.state.send_replace(session.state().clone());
                    }
                    Ok(LinkEvent::MissionAck { result }) => {
                        if let Some(outcome) = session.on_ack(result) {
                            return outcome;
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => warn!("mission: skipped {} link events", n),
                    Err(RecvError::Closed) => {
                        return Err(CommandError::NotConnected("link closed".into()));
                    }
                },
            }
        }
    }

    /// MISSION_CLEAR_ALL; a missing or negative ack is logged, not fatal.
    async fn clear(&self, events: &mut tokio::sync::broadcast::Receiver<LinkEvent>) -> CommandResult<()> {
        let target = self.link.target();
        self.link.send(&MavMessage::MISSION_CLEAR_ALL(MISSION_CLEAR_ALL_DATA {
            target_system: target.system,
            target_component: target.component,
            ..Default::default()
        }))?;
        let wait = tokio::time::timeout(self.cfg.clear_timeout(), async {
            loop {
                match events.recv().await {
                    Ok(LinkEvent::MissionAck { result }) => return Some(result),
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => return None,
                }
            }
        })
        .await;
        match wait {
            Ok(Some(MavMissionResult::MAV_MISSION_ACCEPTED)) => debug!("mission: cleared"),
            Ok(Some(other)) => warn!("mission: clear answered {:?}, continuing", other),
            Ok(None) => return Err(CommandError::NotConnected("link closed".into())),
            Err(_) => warn!("mission: no acknowledgment for clear, continuing"),
        }
        Ok(())
    }

    fn item_message(&self, item: &MissionItem) -> MavMessage {
        let target = self.link.target();
        MavMessage::MISSION_ITEM_INT(MISSION_ITEM_INT_DATA {
            param1: 0.0,
            param2: 0.0,
            param3: 0.0,
            param4: 0.0,
            x: (item.lat * 1e7).round() as i32,
            y: (item.lon * 1e7).round() as i32,
            z: item.alt,
            seq: item.seq,
            command: item.command,
            target_system: target.system,
            target_component: target.component,
            frame: MavFrame::MAV_FRAME_GLOBAL_RELATIVE_ALT_INT,
            current: 0,
            autocontinue: 1,
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use gcs_proto::mission::Waypoint;
    use mavlink::common::{MISSION_ACK_DATA, MISSION_REQUEST_DATA, MISSION_REQUEST_INT_DATA};

    fn plan(n: usize) -> MissionPlan {
        MissionPlan {
            waypoints: (0..n)
                .map(|i| Waypoint { lat: 47.0 + i as f64 * 0.001, lon: 8.0, alt: 30.0 + i as f32 })
                .collect(),
        }
    }

    fn session(n: usize) -> MissionUploadSession {
        MissionUploadSession::new(build_items(&plan(n), Some((46.9, 7.9)), 10.0), &MissionConfig::default())
    }

    fn ack(result: MavMissionResult) -> MavMessage {
        MavMessage::MISSION_ACK(MISSION_ACK_DATA { mavtype: result, ..Default::default() })
    }

    #[test]
    fn takeoff_occupies_sequence_zero() {
        let items = build_items(&plan(3), Some((46.9, 7.9)), 10.0);
        assert_eq!(items.len(), 4);
        assert_eq!(items[0].command, MavCmd::MAV_CMD_NAV_TAKEOFF);
        assert_eq!((items[0].lat, items[0].lon, items[0].alt), (46.9, 7.9, 30.0));
        for (i, item) in items.iter().enumerate().skip(1) {
            assert_eq!(item.seq as usize, i);
            assert_eq!(item.command, MavCmd::MAV_CMD_NAV_WAYPOINT);
        }
    }

    #[test]
    fn in_order_requests_then_accept_completes() {
        let now = Instant::now();
        let mut s = session(3);
        s.begin(now);
        for seq in 0..4 {
            assert_eq!(s.on_request(seq, now).unwrap().seq, seq);
        }
        assert_eq!(s.state(), &UploadState::AwaitingAck);
        assert_eq!(s.on_ack(MavMissionResult::MAV_MISSION_ACCEPTED), Some(Ok(())));
        assert_eq!(s.state(), &UploadState::Complete);
    }

    #[test]
    fn skipped_sequence_resyncs_cursor() {
        let now = Instant::now();
        let mut s = session(3);
        s.begin(now);
        s.on_request(0, now).unwrap();
        assert_eq!(s.on_request(2, now).unwrap().seq, 2);
        assert_eq!(s.state(), &UploadState::Streaming { next: 3 });
    }

    #[test]
    fn out_of_range_request_fails() {
        let now = Instant::now();
        let mut s = session(2);
        s.begin(now);
        let err = s.on_request(7, now).unwrap_err();
        assert!(matches!(err, CommandError::ProtocolViolation(_)));
        assert!(matches!(s.state(), UploadState::Failed { .. }));
    }

    #[test]
    fn rejection_is_terminal() {
        let now = Instant::now();
        let mut s = session(1);
        s.begin(now);
        s.on_request(0, now).unwrap();
        let res = s.on_ack(MavMissionResult::MAV_MISSION_NO_SPACE).unwrap();
        assert!(matches!(res, Err(CommandError::Denied(_))));
        assert!(s.state().is_terminal());
    }

    #[test]
    fn each_step_has_its_own_deadline() {
        let cfg = MissionConfig::default();
        let now = Instant::now();
        let mut s = session(2);
        s.begin(now);
        assert_eq!(s.deadline(), Some(now + cfg.first_request_timeout()));
        s.on_request(0, now).unwrap();
        assert_eq!(s.deadline(), Some(now + cfg.item_request_timeout()));
        s.on_request(1, now).unwrap();
        s.on_request(2, now).unwrap();
        assert_eq!(s.deadline(), Some(now + cfg.final_ack_timeout()));
        assert!(matches!(s.on_timeout(), CommandError::Timeout(r) if r.contains("final")));
    }

    fn cooperative_vehicle(count: u16) -> impl Fn(&MavMessage) -> Vec<MavMessage> + Send + Sync {
        move |m| match m {
            MavMessage::MISSION_CLEAR_ALL(_) => vec![ack(MavMissionResult::MAV_MISSION_ACCEPTED)],
            MavMessage::MISSION_COUNT(_) => {
                vec![MavMessage::MISSION_REQUEST_INT(MISSION_REQUEST_INT_DATA { seq: 0, ..Default::default() })]
            }
            MavMessage::MISSION_ITEM_INT(item) if item.seq + 1 < count => {
                // Older firmware uses the float request.
                vec![MavMessage::MISSION_REQUEST(MISSION_REQUEST_DATA { seq: item.seq + 1, ..Default::default() })]
            }
            MavMessage::MISSION_ITEM_INT(_) => vec![ack(MavMissionResult::MAV_MISSION_ACCEPTED)],
            _ => vec![],
        }
    }

    fn sent_items(transport: &testing::MockTransport) -> Vec<MISSION_ITEM_INT_DATA> {
        transport
            .sent()
            .into_iter()
            .filter_map(|m| match m {
                MavMessage::MISSION_ITEM_INT(i) => Some(i),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn uploads_three_waypoints() {
        let cfg = testing::fast_config();
        let (conn, transport) = testing::connected(cfg.clone(), 4).await;
        transport.push(testing::position(46.9, 7.9, 0.0));
        testing::wait_for(&conn.link(), |s| s.position.is_some()).await;
        transport.respond_with(cooperative_vehicle(4));

        let uploader = MissionUploader::new(conn.link(), cfg.mission);
        uploader.upload(&plan(3)).await.unwrap();

        let items = sent_items(&transport);
        assert_eq!(items.iter().map(|i| i.seq).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert_eq!(items[0].command, MavCmd::MAV_CMD_NAV_TAKEOFF);
        assert_eq!(items[0].x, 469_000_000);
        assert_eq!(items[1].frame, MavFrame::MAV_FRAME_GLOBAL_RELATIVE_ALT_INT);
        assert_eq!(*uploader.subscribe_state().borrow(), UploadState::Complete);
    }

    #[tokio::test]
    async fn silent_vehicle_times_out_on_first_request() {
        let cfg = testing::fast_config();
        let (conn, _transport) = testing::connected(cfg.clone(), 4).await;
        let uploader = MissionUploader::new(conn.link(), cfg.mission);
        let err = uploader.upload(&plan(2)).await.unwrap_err();
        assert!(matches!(err, CommandError::Timeout(ref r) if r.contains("first")), "{:?}", err);
        assert!(matches!(*uploader.subscribe_state().borrow(), UploadState::Failed { .. }));
    }

    #[tokio::test]
    async fn rejected_mission_is_denied() {
        let cfg = testing::fast_config();
        let (conn, transport) = testing::connected(cfg.clone(), 4).await;
        transport.respond_with(|m| match m {
            MavMessage::MISSION_COUNT(_) => vec![ack(MavMissionResult::MAV_MISSION_NO_SPACE)],
            _ => vec![],
        });
        let mut mission_cfg = cfg.mission;
        mission_cfg.clear_before_upload = false;
        let uploader = MissionUploader::new(conn.link(), mission_cfg);
        let err = uploader.upload(&plan(2)).await.unwrap_err();
        assert!(matches!(err, CommandError::Denied(_)), "{:?}", err);
    }

    #[tokio::test]
    async fn empty_plan_is_rejected() {
        let cfg = testing::fast_config();
        let (conn, transport) = testing::connected(cfg.clone(), 4).await;
        let uploader = MissionUploader::new(conn.link(), cfg.mission);
        let err = uploader.upload(&MissionPlan::default()).await.unwrap_err();
        assert!(matches!(err, CommandError::Precondition(_)));
        assert!(!transport.sent().iter().any(|m| matches!(m, MavMessage::MISSION_COUNT(_))));
    }

    #[tokio::test]
    async fn oversized_plan_is_rejected() {
        let cfg = testing::fast_config();
        let (conn, transport) = testing::connected(cfg.clone(), 4).await;
        let uploader = MissionUploader::new(conn.link(), cfg.mission);
        let err = uploader.upload(&plan(MAX_WAYPOINTS + 1)).await.unwrap_err();
        assert!(matches!(err, CommandError::Precondition(ref r) if r.contains("at most")), "{:?}", err);
        assert!(!transport.sent().iter().any(|m| matches!(m, MavMessage::MISSION_COUNT(_) | MavMessage::MISSION_CLEAR_ALL(_))));
    }

    #[tokio::test]
    async fn disconnect_aborts_upload() {
        let cfg = testing::fast_config();
        let (conn, _transport) = testing::connected(cfg.clone(), 4).await;
        let mut mission_cfg = cfg.mission;
        mission_cfg.first_request_timeout_ms = 10_000;
        let uploader = MissionUploader::new(conn.link(), mission_cfg);

        let two = plan(2);
        let upload = uploader.upload(&two);
        let disconnect = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            conn.disconnect().await;
        };
        let (res, ()) = tokio::join!(upload, disconnect);
        assert!(matches!(res, Err(CommandError::NotConnected(_))), "{:?}", res);
    }
}
