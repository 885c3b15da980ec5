pub mod factory;
#[cfg(feature = "modbus")]
pub mod goodwe;
pub mod simulated;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::config::{EmergencyStopConfig, InverterConfig, SocThresholds};

#[derive(Debug, Error)]
pub enum InverterError {
    #[error("not connected")]
    NotConnected,
    #[error("connection failed after {attempts} attempts: {last_error}")]
    ConnectExhausted { attempts: u32, last_error: String },
    #[error("operation mode {0} not supported by this inverter")]
    UnsupportedMode(OperationMode),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("command timed out")]
    Timeout,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type InverterResult<T> = Result<T, InverterError>;

/// Vendor-neutral operation modes. Adapters map these to vendor opcodes and
/// fail explicitly on modes the hardware family cannot express.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
    strum_macros::Display, strum_macros::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OperationMode {
    General,
    OffGrid,
    Backup,
    Eco,
    EcoCharge,
    EcoDischarge,
}

/// Result of the connect handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub model: String,
    pub serial: String,
    pub firmware: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InverterWorkMode {
    Normal,
    Fault,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InverterStatus {
    pub work_mode: InverterWorkMode,
    pub error_codes: Vec<String>,
    pub read_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatteryStatus {
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
pub struct PvData {
    pub power_w: Option<f64>,
    pub string_power_w: Vec<Option<f64>>,
    pub daily_energy_wh: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GridData {
    /// Positive = import.
    pub power_w: Option<f64>,
    pub voltage_v: Option<f64>,
    pub frequency_hz: Option<f64>,
    pub phase_current_a: [Option<f64>; 3],
    pub daily_import_wh: Option<f64>,
    pub daily_export_wh: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsumptionData {
    pub power_w: Option<f64>,
    pub daily_energy_wh: Option<f64>,
}

/// Everything one poll can gather, plus the raw sensor map for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeData {
    pub read_at: DateTime<Utc>,
    pub battery: BatteryStatus,
    pub pv: PvData,
    pub grid: GridData,
    pub consumption: ConsumptionData,
    pub status: InverterStatus,
    pub sensors: HashMap<String, SensorReading>,
}

/// One raw sensor value. Vendors deliver a mix of numeric and text registers
/// and some sensors go missing mid-session; readings stay nullable instead of
/// being coerced to zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SensorReading {
    Float(f64),
    Int(i64),
    Text(String),
    Missing,
}

impl SensorReading {
    /// Best-effort numeric coercion; text parses when it holds a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SensorReading::Float(v) if v.is_finite() => Some(*v),
            SensorReading::Float(_) => None,
            SensorReading::Int(v) => Some(*v as f64),
            SensorReading::Text(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
            SensorReading::Missing => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SensorReading::Int(v) => Some(*v),
            SensorReading::Float(v) if v.is_finite() => Some(*v as i64),
            SensorReading::Float(_) => None,
            SensorReading::Text(s) => s.trim().parse::<i64>().ok(),
            SensorReading::Missing => None,
        }
    }
}

/// Safety envelope evaluated against live readings.
#[derive(Debug, Clone)]
pub struct SafetyLimits {
    pub battery_temp_min_c: f64,
    pub battery_temp_max_c: f64,
    pub battery_temp_warning_c: f64,
    pub battery_voltage_min_v: f64,
    pub battery_voltage_max_v: f64,
    pub battery_current_max_a: f64,
    pub grid_voltage_min_v: f64,
    pub grid_voltage_max_v: f64,
    pub grid_power_max_w: f64,
    pub soc_min_percent: f64,
    pub soc_max_percent: f64,
}

impl SafetyLimits {
    pub fn from_config(emergency: &EmergencyStopConfig, soc: &SocThresholds) -> Self {
        Self {
            battery_temp_min_c: emergency.battery_temp_min,
            battery_temp_max_c: emergency.battery_temp_max,
            battery_temp_warning_c: emergency.battery_temp_warning,
            battery_voltage_min_v: emergency.battery_voltage_min,
            battery_voltage_max_v: emergency.battery_voltage_max,
            battery_current_max_a: emergency.battery_current_max_a,
            grid_voltage_min_v: emergency.grid_voltage_min,
            grid_voltage_max_v: emergency.grid_voltage_max,
            grid_power_max_w: emergency.grid_power_max_w,
            soc_min_percent: soc.min,
            soc_max_percent: soc.max,
        }
    }
}

/// All violated envelopes from one check, not just the first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyCheck {
    pub ok: bool,
    pub issues: Vec<String>,
}

/// Vendor-agnostic inverter capability set.
///
/// The connection is exclusively owned by the adapter and guarded internally;
/// concurrent callers are serialized. Every command except `connect` fails
/// with `NotConnected` when no session exists.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InverterPort: Send + Sync {
    async fn connect(&self, cfg: &InverterConfig) -> InverterResult<DeviceInfo>;
    async fn disconnect(&self) -> InverterResult<()>;
    async fn is_connected(&self) -> bool;

    async fn read_status(&self) -> InverterResult<InverterStatus>;
    async fn read_battery(&self) -> InverterResult<BatteryStatus>;
    async fn read_runtime(&self) -> InverterResult<HashMap<String, SensorReading>>;
    async fn check_safety(&self, limits: &SafetyLimits) -> InverterResult<SafetyCheck>;

    async fn set_operation_mode(
        &self,
        mode: OperationMode,
        power_w: Option<u32>,
        min_soc: Option<u8>,
    ) -> InverterResult<()>;

    /// No-op success when already charging with identical parameters.
    async fn start_charging(&self, power_pct: u8, target_soc: u8) -> InverterResult<()>;
    /// No-op success when not charging.
    async fn stop_charging(&self) -> InverterResult<()>;

    async fn set_export_limit(&self, power_w: u32) -> InverterResult<()>;
    async fn set_battery_dod(&self, depth_pct: u8) -> InverterResult<()>;

    /// Always executed, never debounced.
    async fn emergency_stop(&self) -> InverterResult<()>;

    async fn collect_pv(&self) -> InverterResult<PvData>;
    async fn collect_grid(&self) -> InverterResult<GridData>;
    async fn collect_consumption(&self) -> InverterResult<ConsumptionData>;
    async fn collect_all(&self) -> InverterResult<RuntimeData>;
}

/// Evaluate the envelope against a battery + grid reading. Shared by the
/// adapters so vendor code only supplies the readings.
pub fn evaluate_safety(
    limits: &SafetyLimits,
    battery: &BatteryStatus,
    grid: &GridData,
) -> SafetyCheck {
    let mut issues = Vec::new();

    if let Some(temp) = battery.temperature_c {
        if temp < limits.battery_temp_min_c {
            issues.push(format!(
                "battery temperature {temp:.1}C below charging minimum {:.1}C",
                limits.battery_temp_min_c
            ));
        }
        if temp > limits.battery_temp_max_c {
            issues.push(format!(
                "battery temperature {temp:.1}C above charging maximum {:.1}C",
                limits.battery_temp_max_c
            ));
        }
    }
    if let Some(voltage) = battery.voltage_v {
        if voltage < limits.battery_voltage_min_v {
            issues.push(format!(
                "battery voltage {voltage:.1}V below minimum {:.1}V",
                limits.battery_voltage_min_v
            ));
        }
        if voltage > limits.battery_voltage_max_v {
            issues.push(format!(
                "battery voltage {voltage:.1}V above maximum {:.1}V",
                limits.battery_voltage_max_v
            ));
        }
    }
    if let Some(current) = battery.current_a {
        if current.abs() > limits.battery_current_max_a {
            issues.push(format!(
                "battery current {:.1}A above maximum {:.1}A",
                current.abs(),
                limits.battery_current_max_a
            ));
        }
    }
    if let Some(soc) = battery.soc_percent {
        if soc < limits.soc_min_percent {
            issues.push(format!(
                "battery SoC {soc:.1}% below minimum {:.1}%",
                limits.soc_min_percent
            ));
        }
        if soc > limits.soc_max_percent {
            issues.push(format!(
                "battery SoC {soc:.1}% above maximum {:.1}%",
                limits.soc_max_percent
            ));
        }
    }
    if let Some(voltage) = grid.voltage_v {
        if voltage < limits.grid_voltage_min_v {
            issues.push(format!(
                "grid voltage {voltage:.1}V below minimum {:.1}V",
                limits.grid_voltage_min_v
            ));
        }
        if voltage > limits.grid_voltage_max_v {
            issues.push(format!(
                "grid voltage {voltage:.1}V above maximum {:.1}V",
                limits.grid_voltage_max_v
            ));
        }
    }
    if let Some(power) = grid.power_w {
        if power.abs() > limits.grid_power_max_w {
            issues.push(format!(
                "grid power {:.0}W above maximum {:.0}W",
                power.abs(),
                limits.grid_power_max_w
            ));
        }
    }

    SafetyCheck {
        ok: issues.is_empty(),
        issues,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> SafetyLimits {
        SafetyLimits {
            battery_temp_min_c: 0.0,
            battery_temp_max_c: 53.0,
            battery_temp_warning_c: 50.0,
            battery_voltage_min_v: 320.0,
            battery_voltage_max_v: 480.0,
            battery_current_max_a: 25.0,
            grid_voltage_min_v: 195.0,
            grid_voltage_max_v: 253.0,
            grid_power_max_w: 14_000.0,
            soc_min_percent: 10.0,
            soc_max_percent: 100.0,
        }
    }

    fn healthy_battery() -> BatteryStatus {
        BatteryStatus {
            soc_percent: Some(60.0),
            voltage_v: Some(400.0),
            current_a: Some(-5.0),
            power_w: Some(-2000.0),
            temperature_c: Some(25.0),
            charging: true,
        }
    }

    #[test]
    fn sensor_reading_coercion() {
        assert_eq!(SensorReading::Float(1.5).as_f64(), Some(1.5));
        assert_eq!(SensorReading::Int(7).as_f64(), Some(7.0));
        assert_eq!(SensorReading::Text(" 3.25 ".into()).as_f64(), Some(3.25));
        assert_eq!(SensorReading::Text("n/a".into()).as_f64(), None);
        assert_eq!(SensorReading::Missing.as_f64(), None);
        assert_eq!(SensorReading::Float(f64::NAN).as_f64(), None);
    }

    #[test]
    fn safety_check_reports_all_violations() {
        let battery = BatteryStatus {
            voltage_v: Some(500.0),
            temperature_c: Some(60.0),
            ..healthy_battery()
        };
        let check = evaluate_safety(&limits(), &battery, &GridData::default());
        assert!(!check.ok);
        assert_eq!(check.issues.len(), 2, "voltage and temperature both reported");
    }

    #[test]
    fn safety_check_passes_clean_readings() {
        let grid = GridData {
            voltage_v: Some(230.0),
            power_w: Some(1200.0),
            ..GridData::default()
        };
        let check = evaluate_safety(&limits(), &healthy_battery(), &grid);
        assert!(check.ok);
        assert!(check.issues.is_empty());
    }

    #[test]
    fn missing_sensors_do_not_trip_safety() {
        let battery = BatteryStatus {
            soc_percent: None,
            voltage_v: None,
            current_a: None,
            power_w: None,
            temperature_c: None,
            charging: false,
        };
        let check = evaluate_safety(&limits(), &battery, &GridData::default());
        assert!(check.ok);
    }
}
