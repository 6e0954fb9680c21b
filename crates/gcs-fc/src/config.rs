//! Tunables for the link core.
//!
//! Every timeout and retry count is overridable; the defaults follow what
//! ArduPilot vehicles tolerate over a 57600 baud telemetry radio.

use serde::Deserialize;
use std::time::Duration;

use crate::error::ConfigError;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CoreConfig {
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub commands: CommandConfig,
    #[serde(default)]
    pub mission: MissionConfig,
    #[serde(default)]
    pub params: ParamConfig,
    #[serde(default)]
    pub calibration: CalibrationConfig,
}

impl CoreConfig {
    pub fn from_toml(s: &str) -> Result<Self, ConfigError> {
        let cfg: CoreConfig = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        Self::from_toml(&std::fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.link.validate()?;
        self.commands.validate()?;
        self.mission.validate()?;
        self.params.validate()?;
        self.calibration.validate()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LinkConfig {
    /// `udpin:0.0.0.0:14550`, `tcpout:host:port`, `serial:/dev/ttyUSB0:57600`
    /// or a bare serial device path (uses `baud`).
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_baud")]
    pub baud: u32,

    /// MAVLink ids we use (ground station side)
    #[serde(default = "default_sys_id")]
    pub sys_id: u8,
    #[serde(default = "default_comp_id")]
    pub comp_id: u8,

    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,
    /// Consecutive receive failures before the link is declared lost.
    #[serde(default = "default_failure_ceiling")]
    pub failure_ceiling: u32,
    #[serde(default = "default_gcs_heartbeat_ms")]
    pub gcs_heartbeat_ms: u64,

    #[serde(default = "default_health_interval_ms")]
    pub health_interval_ms: u64,
    /// No telemetry for this long triggers reconnection.
    #[serde(default = "default_telemetry_grace_ms")]
    pub telemetry_grace_ms: u64,
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    #[serde(default = "default_reconnect_max_attempts")]
    pub reconnect_max_attempts: u32,

    /// RC mode switch cannot override the ground-station mode.
    #[serde(default = "default_true")]
    pub mode_authority: bool,
    #[serde(default = "default_enforcement_interval_ms")]
    pub enforcement_interval_ms: u64,

    #[serde(default = "default_status_log_capacity")]
    pub status_log_capacity: usize,
    #[serde(default = "default_true")]
    pub request_message_rates: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            baud: default_baud(),
            sys_id: default_sys_id(),
            comp_id: default_comp_id(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            poll_ms: default_poll_ms(),
            failure_ceiling: default_failure_ceiling(),
            gcs_heartbeat_ms: default_gcs_heartbeat_ms(),
            health_interval_ms: default_health_interval_ms(),
            telemetry_grace_ms: default_telemetry_grace_ms(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            reconnect_max_attempts: default_reconnect_max_attempts(),
            mode_authority: true,
            enforcement_interval_ms: default_enforcement_interval_ms(),
            status_log_capacity: default_status_log_capacity(),
            request_message_rates: true,
        }
    }
}

impl LinkConfig {
    pub fn handshake_timeout(&self) -> Duration {
        ms(self.handshake_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        ms(self.poll_ms)
    }

    pub fn gcs_heartbeat_interval(&self) -> Duration {
        ms(self.gcs_heartbeat_ms)
    }

    pub fn health_interval(&self) -> Duration {
        ms(self.health_interval_ms)
    }

    pub fn telemetry_grace(&self) -> Duration {
        ms(self.telemetry_grace_ms)
    }

    pub fn enforcement_interval(&self) -> Duration {
        ms(self.enforcement_interval_ms)
    }

    /// Delay before reconnect attempt `attempt` (1-based): base * 2^(n-1), capped.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let delay = self.reconnect_base_ms.saturating_mul(1u64 << shift);
        ms(delay.min(self.reconnect_max_ms))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.trim().is_empty() {
            return Err(ConfigError::Invalid("link.endpoint is empty".into()));
        }
        if self.baud == 0 {
            return Err(ConfigError::Invalid("link.baud must be > 0".into()));
        }
        if self.poll_ms == 0 || self.poll_ms > 500 {
            return Err(ConfigError::Invalid(format!(
                "link.poll_ms must be within 1..=500, got {}",
                self.poll_ms
            )));
        }
        if self.failure_ceiling == 0 {
            return Err(ConfigError::Invalid("link.failure_ceiling must be > 0".into()));
        }
        if self.reconnect_base_ms == 0 || self.reconnect_max_ms < self.reconnect_base_ms {
            return Err(ConfigError::Invalid(
                "link.reconnect_max_ms must be >= reconnect_base_ms > 0".into(),
            ));
        }
        if self.status_log_capacity == 0 {
            return Err(ConfigError::Invalid("link.status_log_capacity must be > 0".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandConfig {
    #[serde(default = "default_burst_count")]
    pub burst_count: u32,
    #[serde(default = "default_burst_spacing_ms")]
    pub burst_spacing_ms: u64,
    #[serde(default = "default_arm_timeout_ms")]
    pub arm_timeout_ms: u64,
    #[serde(default = "default_mode_timeout_ms")]
    pub mode_timeout_ms: u64,
    /// Mode requests closer together than this are rejected as busy.
    #[serde(default = "default_mode_cooldown_ms")]
    pub mode_cooldown_ms: u64,

    /// How long takeoff waits for arming to be confirmed.
    #[serde(default = "default_takeoff_arm_wait_ms")]
    pub takeoff_arm_wait_ms: u64,
    /// Send takeoff even if arming was not confirmed within the wait. Some
    /// firmware disarms again quickly when no takeoff follows.
    #[serde(default)]
    pub takeoff_without_arm_confirmation: bool,
    #[serde(default = "default_takeoff_climb_m")]
    pub takeoff_climb_m: f32,
    #[serde(default = "default_takeoff_confirm_ms")]
    pub takeoff_confirm_ms: u64,

    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    #[serde(default = "default_auto_disarm_alt_m")]
    pub auto_disarm_alt_m: f32,
    #[serde(default = "default_auto_disarm_dwell_ms")]
    pub auto_disarm_dwell_ms: u64,
    #[serde(default = "default_command_poll_ms")]
    pub poll_ms: u64,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            burst_count: default_burst_count(),
            burst_spacing_ms: default_burst_spacing_ms(),
            arm_timeout_ms: default_arm_timeout_ms(),
            mode_timeout_ms: default_mode_timeout_ms(),
            mode_cooldown_ms: default_mode_cooldown_ms(),
            takeoff_arm_wait_ms: default_takeoff_arm_wait_ms(),
            takeoff_without_arm_confirmation: false,
            takeoff_climb_m: default_takeoff_climb_m(),
            takeoff_confirm_ms: default_takeoff_confirm_ms(),
            ack_timeout_ms: default_ack_timeout_ms(),
            auto_disarm_alt_m: default_auto_disarm_alt_m(),
            auto_disarm_dwell_ms: default_auto_disarm_dwell_ms(),
            poll_ms: default_command_poll_ms(),
        }
    }
}

impl CommandConfig {
    pub fn burst_spacing(&self) -> Duration {
        ms(self.burst_spacing_ms)
    }

    pub fn arm_timeout(&self) -> Duration {
        ms(self.arm_timeout_ms)
    }

    pub fn mode_timeout(&self) -> Duration {
        ms(self.mode_timeout_ms)
    }

    pub fn mode_cooldown(&self) -> Duration {
        ms(self.mode_cooldown_ms)
    }

    pub fn takeoff_arm_wait(&self) -> Duration {
        ms(self.takeoff_arm_wait_ms)
    }

    pub fn takeoff_confirm(&self) -> Duration {
        ms(self.takeoff_confirm_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        ms(self.ack_timeout_ms)
    }

    pub fn auto_disarm_dwell(&self) -> Duration {
        ms(self.auto_disarm_dwell_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        ms(self.poll_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.burst_count == 0 {
            return Err(ConfigError::Invalid("commands.burst_count must be > 0".into()));
        }
        if self.arm_timeout_ms == 0 || self.mode_timeout_ms == 0 || self.ack_timeout_ms == 0 {
            return Err(ConfigError::Invalid("command timeouts must be > 0".into()));
        }
        if self.takeoff_climb_m <= 0.0 {
            return Err(ConfigError::Invalid("commands.takeoff_climb_m must be > 0".into()));
        }
        if self.poll_ms == 0 {
            return Err(ConfigError::Invalid("commands.poll_ms must be > 0".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MissionConfig {
    #[serde(default = "default_true")]
    pub clear_before_upload: bool,
    #[serde(default = "default_mission_clear_timeout_ms")]
    pub clear_timeout_ms: u64,
    /// Autopilots can be slow to open a cold mission session.
    #[serde(default = "default_first_request_timeout_ms")]
    pub first_request_timeout_ms: u64,
    #[serde(default = "default_item_request_timeout_ms")]
    pub item_request_timeout_ms: u64,
    #[serde(default = "default_final_ack_timeout_ms")]
    pub final_ack_timeout_ms: u64,
    #[serde(default = "default_takeoff_alt_m")]
    pub default_takeoff_alt_m: f32,
}

impl Default for MissionConfig {
    fn default() -> Self {
        Self {
            clear_before_upload: true,
            clear_timeout_ms: default_mission_clear_timeout_ms(),
            first_request_timeout_ms: default_first_request_timeout_ms(),
            item_request_timeout_ms: default_item_request_timeout_ms(),
            final_ack_timeout_ms: default_final_ack_timeout_ms(),
            default_takeoff_alt_m: default_takeoff_alt_m(),
        }
    }
}

impl MissionConfig {
    pub fn clear_timeout(&self) -> Duration {
        ms(self.clear_timeout_ms)
    }

    pub fn first_request_timeout(&self) -> Duration {
        ms(self.first_request_timeout_ms)
    }

    pub fn item_request_timeout(&self) -> Duration {
        ms(self.item_request_timeout_ms)
    }

    pub fn final_ack_timeout(&self) -> Duration {
        ms(self.final_ack_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.first_request_timeout_ms < self.item_request_timeout_ms {
            return Err(ConfigError::Invalid(
                "mission.first_request_timeout_ms must be >= item_request_timeout_ms".into(),
            ));
        }
        if self.item_request_timeout_ms == 0 || self.final_ack_timeout_ms == 0 {
            return Err(ConfigError::Invalid("mission timeouts must be > 0".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParamConfig {
    #[serde(default = "default_request_repeats")]
    pub request_repeats: u32,
    #[serde(default = "default_burst_spacing_ms")]
    pub repeat_spacing_ms: u64,
    #[serde(default = "default_no_data_timeout_ms")]
    pub no_data_timeout_ms: u64,
    #[serde(default = "default_overall_timeout_ms")]
    pub overall_timeout_ms: u64,
    #[serde(default = "default_ack_timeout_ms")]
    pub set_timeout_ms: u64,
    #[serde(default = "default_command_poll_ms")]
    pub poll_ms: u64,
}

impl Default for ParamConfig {
    fn default() -> Self {
        Self {
            request_repeats: default_request_repeats(),
            repeat_spacing_ms: default_burst_spacing_ms(),
            no_data_timeout_ms: default_no_data_timeout_ms(),
            overall_timeout_ms: default_overall_timeout_ms(),
            set_timeout_ms: default_ack_timeout_ms(),
            poll_ms: default_command_poll_ms(),
        }
    }
}

impl ParamConfig {
    pub fn repeat_spacing(&self) -> Duration {
        ms(self.repeat_spacing_ms)
    }

    pub fn no_data_timeout(&self) -> Duration {
        ms(self.no_data_timeout_ms)
    }

    pub fn overall_timeout(&self) -> Duration {
        ms(self.overall_timeout_ms)
    }

    pub fn set_timeout(&self) -> Duration {
        ms(self.set_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        ms(self.poll_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request_repeats == 0 {
            return Err(ConfigError::Invalid("params.request_repeats must be > 0".into()));
        }
        if self.overall_timeout_ms < self.no_data_timeout_ms {
            return Err(ConfigError::Invalid(
                "params.overall_timeout_ms must be >= no_data_timeout_ms".into(),
            ));
        }
        if self.poll_ms == 0 {
            return Err(ConfigError::Invalid("params.poll_ms must be > 0".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CalibrationConfig {
    #[serde(default = "default_tolerance_deg")]
    pub tolerance_deg: f32,
    #[serde(default = "default_stability_ms")]
    pub stability_ms: u64,
    #[serde(default = "default_level_duration_ms")]
    pub level_duration_ms: u64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            tolerance_deg: default_tolerance_deg(),
            stability_ms: default_stability_ms(),
            level_duration_ms: default_level_duration_ms(),
        }
    }
}

impl CalibrationConfig {
    pub fn stability_window(&self) -> Duration {
        ms(self.stability_ms)
    }

    pub fn level_duration(&self) -> Duration {
        ms(self.level_duration_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1.0..=45.0).contains(&self.tolerance_deg) {
            return Err(ConfigError::Invalid(format!(
                "calibration.tolerance_deg must be within 1..=45, got {}",
                self.tolerance_deg
            )));
        }
        Ok(())
    }
}

fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}

fn default_true() -> bool {
    true
}

fn default_endpoint() -> String {
    "udpin:0.0.0.0:14550".to_string()
}

fn default_baud() -> u32 {
    57600
}

fn default_sys_id() -> u8 {
    255
}

fn default_comp_id() -> u8 {
    190
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_poll_ms() -> u64 {
    20
}

fn default_failure_ceiling() -> u32 {
    10
}

fn default_gcs_heartbeat_ms() -> u64 {
    1000
}

fn default_health_interval_ms() -> u64 {
    1000
}

fn default_telemetry_grace_ms() -> u64 {
    5000
}

fn default_reconnect_base_ms() -> u64 {
    1000
}

fn default_reconnect_max_ms() -> u64 {
    16_000
}

fn default_reconnect_max_attempts() -> u32 {
    5
}

fn default_enforcement_interval_ms() -> u64 {
    500
}

fn default_status_log_capacity() -> usize {
    50
}

fn default_burst_count() -> u32 {
    5
}

fn default_burst_spacing_ms() -> u64 {
    100
}

fn default_arm_timeout_ms() -> u64 {
    5000
}

fn default_mode_timeout_ms() -> u64 {
    3000
}

fn default_mode_cooldown_ms() -> u64 {
    1000
}

fn default_takeoff_arm_wait_ms() -> u64 {
    5000
}

fn default_takeoff_climb_m() -> f32 {
    0.5
}

fn default_takeoff_confirm_ms() -> u64 {
    5000
}

fn default_ack_timeout_ms() -> u64 {
    5000
}

fn default_auto_disarm_alt_m() -> f32 {
    0.3
}

fn default_auto_disarm_dwell_ms() -> u64 {
    3000
}

fn default_command_poll_ms() -> u64 {
    100
}

fn default_mission_clear_timeout_ms() -> u64 {
    3000
}

fn default_first_request_timeout_ms() -> u64 {
    10_000
}

fn default_item_request_timeout_ms() -> u64 {
    5000
}

fn default_final_ack_timeout_ms() -> u64 {
    5000
}

fn default_takeoff_alt_m() -> f32 {
    10.0
}

fn default_request_repeats() -> u32 {
    3
}

fn default_no_data_timeout_ms() -> u64 {
    8000
}

fn default_overall_timeout_ms() -> u64 {
    60_000
}

fn default_tolerance_deg() -> f32 {
    15.0
}

fn default_stability_ms() -> u64 {
    2000
}

fn default_level_duration_ms() -> u64 {
    5000
}
