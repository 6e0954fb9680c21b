use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};

use gcs_fc::calibration::CalPhase;
use gcs_fc::{
    CalibrationKind, CalibrationManager, Connection, CoreConfig, Dispatcher, Endpoint, FetchState,
    LandOutcome, LinkEvent, MavConnector, MissionUploader, ParameterSync, SetOutcome,
};
use gcs_proto::mission::MissionPlan;
use gcs_proto::telemetry::TelemetrySnapshot;

use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

#[derive(Debug, Parser)]
#[command(name = "gcs", version, about = "MAVLink ground-station command & telemetry core")]
struct Cli {
    #[arg(long)]
    config: String,

    /// Overrides `link.endpoint`.
    #[arg(long)]
    endpoint: Option<String>,

    /// Overrides `link.baud`.
    #[arg(long)]
    baud: Option<u32>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate the configuration and endpoint.
    Doctor,
    /// Print telemetry changes and status texts until Ctrl-C.
    Monitor,
    Arm,
    Disarm,
    Mode { name: String },
    Takeoff { altitude_m: f32 },
    Land {
        /// Keep watching and disarm once on the ground.
        #[arg(long)]
        auto_disarm: bool,
    },
    /// Reboot the autopilot. Refused while armed.
    Reboot,
    /// Upload a TOML mission (`[[waypoints]]` with lat, lon, alt).
    Mission { file: String },
    Params { #[command(subcommand)] cmd: ParamsCmd },
    Calibrate { kind: CalibrateKind },
}

#[derive(Debug, Subcommand)]
enum ParamsCmd {
    Fetch,
    Set { name: String, value: f32 },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CalibrateKind {
    Level,
    Accel,
    Compass,
}

impl From<CalibrateKind> for CalibrationKind {
    fn from(k: CalibrateKind) -> Self {
        match k {
            CalibrateKind::Level => CalibrationKind::Level,
            CalibrateKind::Accel => CalibrationKind::Accel,
            CalibrateKind::Compass => CalibrationKind::Compass,
        }
    }
}

fn load_config(path: &str, endpoint: Option<String>, baud: Option<u32>) -> Result<CoreConfig> {
    let mut cfg = CoreConfig::load(path).with_context(|| format!("load config {}", path))?;
    if let Some(e) = endpoint {
        cfg.link.endpoint = e;
    }
    if let Some(b) = baud {
        cfg.link.baud = b;
    }
    cfg.validate().context("validate overridden config")?;
    Ok(cfg)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli.config, cli.endpoint, cli.baud)?;

    if let Command::Doctor = cli.cmd {
        return doctor(&cfg);
    }

    let conn = Connection::new(cfg.clone(), Arc::new(MavConnector));
    conn.connect(&cfg.link.endpoint, cfg.link.baud)
        .await
        .with_context(|| format!("connect {}", cfg.link.endpoint))?;
    let link = conn.link();
    let target = link.target();
    info!("connected to system {} component {}", target.system, target.component);

    let dispatcher = Dispatcher::new(link.clone(), cfg.commands.clone());
    let res = match cli.cmd {
        Command::Doctor => Ok(()),
        Command::Monitor => monitor(&conn).await,
        Command::Arm => dispatcher.arm().await.context("arm"),
        Command::Disarm => dispatcher.disarm().await.context("disarm"),
        Command::Mode { name } => dispatcher.set_mode(&name).await.context("set mode"),
        Command::Takeoff { altitude_m } => dispatcher.takeoff(altitude_m).await.context("takeoff"),
        Command::Land { auto_disarm } => land(&dispatcher, auto_disarm).await,
        Command::Reboot => dispatcher.reboot().await.context("reboot"),
        Command::Mission { file } => mission(&conn, &file).await,
        Command::Params { cmd } => params(&conn, cmd).await,
        Command::Calibrate { kind } => calibrate(&conn, kind.into()).await,
    };

    conn.disconnect().await;
    if res.is_ok() {
        println!("OK");
    }
    res
}

fn doctor(cfg: &CoreConfig) -> Result<()> {
    info!("doctor: starting");
    let endpoint = Endpoint::parse(&cfg.link.endpoint, cfg.link.baud).context("link.endpoint")?;
    println!("endpoint: {}", endpoint);
    println!("gcs ids: sys={} comp={}", cfg.link.sys_id, cfg.link.comp_id);
    println!(
        "mode authority: {} (every {}ms)",
        if cfg.link.mode_authority { "on" } else { "off" },
        cfg.link.enforcement_interval_ms
    );
    if !cfg.link.request_message_rates {
        warn!("doctor: message rate requests disabled, telemetry may be sparse");
    }
    info!("doctor: OK");
    Ok(())
}

fn render(s: &TelemetrySnapshot) -> String {
    let mut out = format!(
        "mode={} armed={}",
        s.mode.as_deref().unwrap_or("-"),
        s.armed.map(|a| a.to_string()).unwrap_or_else(|| "-".into())
    );
    if let Some(p) = s.position {
        out.push_str(&format!(" pos={:.7},{:.7} rel_alt={:.1}m", p.lat, p.lon, p.relative_alt));
    }
    if let Some(a) = s.attitude {
        out.push_str(&format!(" roll={:.1} pitch={:.1} yaw={:.1}", a.roll, a.pitch, a.yaw));
    }
    if let Some(g) = s.gps {
        out.push_str(&format!(" fix={} sats={}", g.fix_type, g.satellites_visible));
    }
    if let Some(pct) = s.battery.remaining_pct {
        out.push_str(&format!(" batt={}%", pct));
    }
    if let Some(v) = s.battery.voltage {
        out.push_str(&format!(" {:.2}V", v));
    }
    out
}

async fn monitor(conn: &Connection) -> Result<()> {
    let link = conn.link();
    let mut telemetry = link.subscribe_telemetry();
    let mut events = link.subscribe_events();
    let mut state = link.subscribe_state();
    let mut last = String::new();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("monitor: interrupted");
                return Ok(());
            }
            changed = telemetry.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let line = render(&telemetry.borrow_and_update());
                if line != last {
                    println!("{}", line);
                    last = line;
                }
            }
            ev = events.recv() => match ev {
                Ok(LinkEvent::StatusText(t)) => println!("[sev {}] {}", t.severity, t.text),
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => warn!("monitor: skipped {} events", n),
                Err(RecvError::Closed) => return Ok(()),
            },
            changed = state.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let st = state.borrow_and_update().clone();
                match link.health().hb_age() {
                    Some(age) => println!("link: {:?} (last heartbeat {}ms ago)", st, age.as_millis()),
                    None => println!("link: {:?}", st),
                }
            }
        }
    }
}

async fn land(dispatcher: &Dispatcher, auto_disarm: bool) -> Result<()> {
    if !auto_disarm {
        return dispatcher.land().await.context("land");
    }
    let monitor = dispatcher.land_with_auto_disarm().await.context("land")?;
    println!("landing, waiting for touchdown (Ctrl-C to stop watching)");
    let outcome = tokio::select! {
        outcome = monitor.wait() => outcome,
        _ = tokio::signal::ctrl_c() => LandOutcome::Cancelled,
    };
    match outcome {
        LandOutcome::Disarmed => println!("touchdown, disarmed"),
        LandOutcome::AlreadyDisarmed => println!("vehicle disarmed itself"),
        LandOutcome::Cancelled => println!("auto-disarm cancelled"),
        LandOutcome::ConnectionLost => anyhow::bail!("connection lost while landing"),
        LandOutcome::Failed(e) => return Err(e).context("auto-disarm"),
    }
    Ok(())
}

fn read_mission(path: &str) -> Result<MissionPlan> {
    let s = std::fs::read_to_string(path).with_context(|| format!("read mission {}", path))?;
    toml::from_str(&s).context("parse mission toml")
}

async fn mission(conn: &Connection, path: &str) -> Result<()> {
    let plan = read_mission(path)?;
    let uploader = MissionUploader::new(conn.link(), conn.config().mission.clone());
    let mut state = uploader.subscribe_state();
    let progress = tokio::spawn(async move {
        while state.changed().await.is_ok() {
            let st = state.borrow_and_update().clone();
            info!("mission: {:?}", st);
            if st.is_terminal() {
                break;
            }
        }
    });
    let res = uploader.upload(&plan).await.context("mission upload");
    progress.abort();
    res?;
    println!("uploaded {} waypoints", plan.waypoints.len());
    Ok(())
}

async fn params(conn: &Connection, cmd: ParamsCmd) -> Result<()> {
    let sync = ParameterSync::new(conn.link(), conn.config().params.clone());
    match cmd {
        ParamsCmd::Fetch => {
            let handle = sync.fetch_all().context("fetch parameters")?;
            match handle.wait().await {
                FetchState::Complete { received, declared } => {
                    for p in sync.parameters().iter() {
                        println!("{:<16} {}", p.name, p.value);
                    }
                    if received < declared as usize {
                        warn!("params: partial list ({}/{})", received, declared);
                    }
                    Ok(())
                }
                FetchState::Failed { reason } => anyhow::bail!("parameter fetch failed: {}", reason),
                other => anyhow::bail!("parameter fetch ended in {:?}", other),
            }
        }
        ParamsCmd::Set { name, value } => match sync.set_param(&name, value).await.context("set parameter")? {
            SetOutcome::Confirmed(p) => {
                println!("{} = {}", p.name, p.value);
                Ok(())
            }
            SetOutcome::Mismatch { requested, applied } => {
                warn!("params: vehicle applied {} instead of {}", applied.value, requested);
                println!("{} = {}", applied.name, applied.value);
                Ok(())
            }
        },
    }
}

async fn calibrate(conn: &Connection, kind: CalibrationKind) -> Result<()> {
    let cfg = conn.config();
    let manager = CalibrationManager::new(conn.link(), cfg.calibration.clone(), cfg.commands.poll_interval());
    let mut status = manager.subscribe();
    manager.start(kind).context("start calibration")?;
    match kind {
        CalibrationKind::Accel => println!("press Enter to confirm each position"),
        CalibrationKind::Compass => println!("press Enter when done rotating"),
        CalibrationKind::Level => {}
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut last = String::new();
    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    anyhow::bail!("calibration status closed");
                }
                let Some(st) = status.borrow_and_update().clone() else { continue };
                if st.feedback != last {
                    println!("{}", st.feedback);
                    last = st.feedback.clone();
                }
                match st.phase {
                    CalPhase::Running | CalPhase::Idle => {}
                    CalPhase::Complete => return Ok(()),
                    CalPhase::Failed { reason } => anyhow::bail!("calibration failed: {}", reason),
                    CalPhase::Cancelled => anyhow::bail!("calibration cancelled"),
                }
            }
            line = lines.next_line(), if stdin_open => {
                match line {
                    Ok(Some(_)) => {
                        let res = match kind {
                            CalibrationKind::Compass => manager.complete(),
                            _ => manager.advance(),
                        };
                        if let Err(e) = res {
                            println!("{}", e);
                        }
                    }
                    _ => stdin_open = false,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                manager.stop();
                anyhow::bail!("calibration interrupted");
            }
        }
    }
}
