use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// One fully-populated instantaneous site reading.
///
/// Sign conventions: battery current/power negative = charging, grid power
/// positive = import. Sensor values that the inverter did not report are
/// `None`; aggregates decide per-field whether missing means zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub timestamp: DateTime<Utc>,
    pub battery: BatterySample,
    #[serde(alias = "photovoltaic")]
    pub pv: PvSample,
    pub grid: GridSample,
    #[serde(alias = "house_consumption")]
    pub consumption: ConsumptionSample,
    #[serde(alias = "system")]
    pub inverter: InverterInfo,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatterySample {
    pub soc_percent: Option<f64>,
    pub voltage_v: Option<f64>,
    /// Negative while charging.
    pub current_a: Option<f64>,
    /// Negative while charging.
    pub power_w: Option<f64>,
    pub temperature_c: Option<f64>,
    pub charging: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PvSample {
    pub power_w: Option<f64>,
    #[serde(default)]
    pub string_power_w: Vec<Option<f64>>,
    pub daily_energy_wh: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GridSample {
    /// Positive = import from grid.
    pub power_w: Option<f64>,
    pub voltage_v: Option<f64>,
    pub frequency_hz: Option<f64>,
    #[serde(default)]
    pub phase_current_a: [Option<f64>; 3],
    pub daily_import_wh: Option<f64>,
    pub daily_export_wh: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsumptionSample {
    pub power_w: Option<f64>,
    pub daily_energy_wh: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InverterState {
    Normal,
    Fault,
    Unknown,
}

impl Default for InverterState {
    fn default() -> Self {
        Self::Unknown
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InverterInfo {
    pub model: String,
    pub serial: String,
    #[serde(default)]
    pub state: InverterState,
    #[serde(default)]
    pub error_codes: BTreeSet<String>,
}

impl Snapshot {
    /// Net PV surplus after house consumption, if both sensors reported.
    pub fn net_pv_power_w(&self) -> Option<f64> {
        Some(self.pv.power_w? - self.consumption.power_w?)
    }

    pub fn has_fault(&self) -> bool {
        self.inverter.state == InverterState::Fault || !self.inverter.error_codes.is_empty()
    }
}
