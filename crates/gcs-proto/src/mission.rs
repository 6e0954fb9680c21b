use serde::{Deserialize, Serialize};

/// Operator supplied navigation waypoint. Altitude is relative to home.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    pub lat: f64,
    pub lon: f64,
    #[serde(default = "default_alt")]
    pub alt: f32,
}

fn default_alt() -> f32 {
    10.0
}

/// Mission file layout: a list of `[[waypoints]]` tables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MissionPlan {
    #[serde(default)]
    pub waypoints: Vec<Waypoint>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_parses_with_default_altitude() {
        let plan: MissionPlan = toml::from_str(
            r#"
            [[waypoints]]
            lat = 17.1
            lon = 78.2
            alt = 25.0

            [[waypoints]]
            lat = 17.2
            lon = 78.3
            "#,
        )
        .unwrap();
        assert_eq!(plan.waypoints.len(), 2);
        assert_eq!(plan.waypoints[0].alt, 25.0);
        assert_eq!(plan.waypoints[1].alt, 10.0);
    }
}
