use serde::{Deserialize, Serialize};

/// One autopilot parameter as echoed in PARAM_VALUE.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamEntry {
    pub name: String,
    pub value: f32,
    pub param_type: u8,
    pub index: u16,
    pub declared_count: u16,
}
