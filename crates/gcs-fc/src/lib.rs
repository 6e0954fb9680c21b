//! Ground-station command and telemetry core for MAVLink vehicles.
//!
//! [`Connection`] owns the link lifecycle; [`Dispatcher`], [`MissionUploader`],
//! [`ParameterSync`] and [`CalibrationManager`] drive operations over the
//! shared [`Link`].

pub mod authority;
pub mod calibration;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod ingest;
pub mod link;
pub mod mission;
pub mod modes;
pub mod params;
pub mod state;
pub mod transport;

#[cfg(test)]
mod testing;

pub use calibration::{CalibrationKind, CalibrationManager, CalibrationStatus};
pub use config::CoreConfig;
pub use connection::Connection;
pub use dispatcher::{Dispatcher, LandMonitor, LandOutcome};
pub use error::{CommandError, CommandResult, ConfigError, TransportError};
pub use link::{Link, LinkEvent};
pub use mission::{MissionUploader, UploadState};
pub use params::{FetchState, ParameterSync, SetOutcome};
pub use state::LinkState;
pub use transport::{Endpoint, MavConnector};
