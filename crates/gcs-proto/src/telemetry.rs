use serde::{Deserialize, Serialize};

/// Global position as reported by GLOBAL_POSITION_INT.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub lat: f64,
    pub lon: f64,
    /// Metres above mean sea level.
    pub alt: f32,
    /// Metres above home.
    pub relative_alt: f32,
}

/// Vehicle attitude in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Attitude {
    pub roll: f32,
    pub pitch: f32,
    pub yaw: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Battery {
    pub remaining_pct: Option<u8>,
    pub voltage: Option<f32>,  // Volts
    pub current: Option<f32>,  // Amps
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsStatus {
    pub fix_type: u8,
    pub satellites_visible: u8,
    pub hdop: Option<f32>,
    pub vdop: Option<f32>,
}

impl GpsStatus {
    /// 3D fix or better (GPS_FIX_TYPE_3D_FIX and up).
    pub fn has_3d_fix(&self) -> bool {
        self.fix_type >= 3
    }
}

/// Last known value of every decoded field. `None` until first observed.
///
/// `mode` is what operators should see; it may carry the ground-station
/// requested mode while the vehicle is being pulled back into it.
/// `reported_mode` is always the mode last reported on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub mode: Option<String>,
    pub reported_mode: Option<String>,
    pub armed: Option<bool>,
    pub position: Option<Position>,
    pub attitude: Option<Attitude>,
    pub heading: Option<i16>,
    pub groundspeed: Option<f32>,
    pub airspeed: Option<f32>,
    pub battery: Battery,
    pub gps: Option<GpsStatus>,
}

impl TelemetrySnapshot {
    pub fn is_armed(&self) -> bool {
        self.armed.unwrap_or(false)
    }

    pub fn relative_alt(&self) -> Option<f32> {
        self.position.map(|p| p.relative_alt)
    }

    /// Position is known and, when GPS status has been seen, backed by a 3D fix.
    pub fn has_valid_position(&self) -> bool {
        match (self.position, self.gps) {
            (None, _) => false,
            (Some(_), Some(gps)) => gps.has_3d_fix(),
            (Some(_), None) => true,
        }
    }
}

/// Entry in the STATUSTEXT log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusText {
    pub ts_unix_ms: i64,
    pub severity: u8,
    pub text: String,
}
