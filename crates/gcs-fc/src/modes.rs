//! Flight mode name <-> custom_mode id tables (ArduPilot numbering).

use mavlink::common::MavType;

const COPTER: &[(&str, u32)] = &[
    ("STABILIZE", 0),
    ("ACRO", 1),
    ("ALT_HOLD", 2),
    ("AUTO", 3),
    ("GUIDED", 4),
    ("LOITER", 5),
    ("RTL", 6),
    ("CIRCLE", 7),
    ("LAND", 9),
    ("DRIFT", 11),
    ("SPORT", 13),
    ("FLIP", 14),
    ("AUTOTUNE", 15),
    ("POSHOLD", 16),
    ("BRAKE", 17),
    ("THROW", 18),
    ("AVOID_ADSB", 19),
    ("GUIDED_NOGPS", 20),
    ("SMART_RTL", 21),
    ("FLOWHOLD", 22),
    ("FOLLOW", 23),
    ("ZIGZAG", 24),
    ("SYSTEMID", 25),
    ("AUTOROTATE", 26),
    ("AUTO_RTL", 27),
];

const PLANE: &[(&str, u32)] = &[
    ("MANUAL", 0),
    ("CIRCLE", 1),
    ("STABILIZE", 2),
    ("TRAINING", 3),
    ("ACRO", 4),
    ("FBWA", 5),
    ("FBWB", 6),
    ("CRUISE", 7),
    ("AUTOTUNE", 8),
    ("AUTO", 10),
    ("RTL", 11),
    ("LOITER", 12),
    ("TAKEOFF", 13),
    ("AVOID_ADSB", 14),
    ("GUIDED", 15),
    ("QSTABILIZE", 17),
    ("QHOVER", 18),
    ("QLOITER", 19),
    ("QLAND", 20),
    ("QRTL", 21),
    ("QAUTOTUNE", 22),
    ("QACRO", 23),
    ("THERMAL", 24),
];

const ROVER: &[(&str, u32)] = &[
    ("MANUAL", 0),
    ("ACRO", 1),
    ("STEERING", 3),
    ("HOLD", 4),
    ("LOITER", 5),
    ("FOLLOW", 6),
    ("SIMPLE", 7),
    ("AUTO", 10),
    ("RTL", 11),
    ("SMART_RTL", 12),
    ("GUIDED", 15),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VehicleClass {
    Copter,
    Plane,
    Rover,
}

impl VehicleClass {
    pub fn from_mav_type(t: MavType) -> Self {
        match t {
            MavType::MAV_TYPE_FIXED_WING => VehicleClass::Plane,
            MavType::MAV_TYPE_GROUND_ROVER | MavType::MAV_TYPE_SURFACE_BOAT => VehicleClass::Rover,
            _ => VehicleClass::Copter,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ModeTable {
    class: VehicleClass,
    entries: &'static [(&'static str, u32)],
}

impl Default for ModeTable {
    fn default() -> Self {
        Self::for_class(VehicleClass::Copter)
    }
}

impl ModeTable {
    pub fn for_class(class: VehicleClass) -> Self {
        let entries = match class {
            VehicleClass::Copter => COPTER,
            VehicleClass::Plane => PLANE,
            VehicleClass::Rover => ROVER,
        };
        Self { class, entries }
    }

    pub fn class(&self) -> VehicleClass {
        self.class
    }

    /// Case-insensitive lookup.
    pub fn id(&self, name: &str) -> Option<u32> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name.trim()))
            .map(|(_, id)| *id)
    }

    /// Unmapped ids are reported as `UNKNOWN(<id>)`.
    pub fn name(&self, id: u32) -> String {
        self.entries
            .iter()
            .find(|(_, i)| *i == id)
            .map(|(n, _)| (*n).to_string())
            .unwrap_or_else(|| format!("UNKNOWN({})", id))
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.iter().map(|(n, _)| *n)
    }
}
