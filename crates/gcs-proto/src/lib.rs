//! Plain data records shared between the link core and whatever renders them.

pub mod mission;
pub mod params;
pub mod telemetry;
