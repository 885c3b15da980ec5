use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use validator::Validate;

/// Top-level application configuration.
///
/// Loaded from layered YAML files merged in order (later overrides earlier):
/// baseline → local (hardware-specific) → override (operator). The merge is a
/// deep merge of mappings with scalar replacement. On first run with only a
/// baseline present, the local layer is bootstrapped as a copy of it.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct AppConfig {
    #[validate(nested)]
    pub inverter: InverterConfig,

    #[validate(nested)]
    pub battery_management: BatteryManagementConfig,

    #[validate(nested)]
    pub coordinator: CoordinatorConfig,

    #[validate(nested)]
    pub electricity_tariff: TariffConfig,

    #[serde(default)]
    pub pse_peak_hours: FeatureToggle,

    #[serde(default)]
    pub pse_price_forecast: FeatureToggle,

    #[serde(default)]
    pub weather_integration: FeatureToggle,

    #[validate(nested)]
    #[serde(default)]
    pub price_analysis: PriceAnalysisConfig,

    #[validate(nested)]
    #[serde(default)]
    pub pv_consumption_analysis: PvConsumptionConfig,

    #[validate(nested)]
    #[serde(default)]
    pub battery_selling: BatterySellingConfig,

    #[validate(nested)]
    pub data_storage: DataStorageConfig,

    #[validate(nested)]
    #[serde(default)]
    pub web_server: WebServerConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FeatureToggle {
    #[serde(default)]
    pub enabled: bool,
}

/// Inverter connection parameters.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct InverterConfig {
    #[validate(length(min = 1))]
    pub vendor: String,

    #[validate(length(min = 1))]
    pub ip_address: String,

    #[validate(range(min = 1, max = 65535))]
    pub port: u16,

    #[serde(default = "default_inverter_timeout_s")]
    #[validate(range(min = 1, max = 120))]
    pub timeout_s: u64,

    #[serde(default = "default_inverter_retries")]
    #[validate(range(min = 1, max = 20))]
    pub retries: u32,

    #[serde(default = "default_inverter_retry_delay_s")]
    pub retry_delay_s: u64,

    #[serde(default)]
    pub vendor_specific: VendorSpecificConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VendorSpecificConfig {
    #[serde(default = "default_family")]
    pub family: String,

    #[serde(default = "default_comm_addr")]
    pub comm_addr: u8,
}

impl Default for VendorSpecificConfig {
    fn default() -> Self {
        Self {
            family: default_family(),
            comm_addr: default_comm_addr(),
        }
    }
}

/// Battery envelope and compliance parameters.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[validate(schema(function = "validate_battery_management"))]
pub struct BatteryManagementConfig {
    #[validate(range(min = 0.1, max = 1000.0))]
    pub capacity_kwh: f64,

    #[serde(default = "default_battery_type")]
    pub battery_type: String,

    #[serde(default = "default_charge_rate_kw")]
    #[validate(range(min = 0.1, max = 100.0))]
    pub charge_rate_kw: f64,

    #[serde(default)]
    pub voltage_range: VoltageRange,

    #[serde(default)]
    pub temperature_thresholds: TemperatureThresholds,

    #[serde(default)]
    pub soc_thresholds: SocThresholds,

    #[serde(default)]
    pub bms_integration: bool,

    #[serde(default)]
    pub vde_2510_50_compliance: bool,

    #[serde(default)]
    pub auto_reboot_undervoltage: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct VoltageRange {
    pub min: f64,
    pub max: f64,
}

impl Default for VoltageRange {
    fn default() -> Self {
        // GoodWe Lynx-D operating range
        Self { min: 320.0, max: 480.0 }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TemperatureThresholds {
    pub charging_min: f64,
    pub charging_max: f64,
    pub warning: f64,
}

impl Default for TemperatureThresholds {
    fn default() -> Self {
        Self {
            charging_min: 0.0,
            charging_max: 53.0,
            warning: 50.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SocThresholds {
    pub emergency: f64,
    pub critical: f64,
    pub min: f64,
    pub max: f64,
}

impl Default for SocThresholds {
    fn default() -> Self {
        Self {
            emergency: 5.0,
            critical: 20.0,
            min: 10.0,
            max: 100.0,
        }
    }
}

fn validate_battery_management(
    config: &BatteryManagementConfig,
) -> Result<(), validator::ValidationError> {
    if config.voltage_range.min >= config.voltage_range.max {
        return Err(validator::ValidationError::new(
            "voltage_range.min must be less than voltage_range.max",
        ));
    }
    if config.temperature_thresholds.charging_min >= config.temperature_thresholds.charging_max {
        return Err(validator::ValidationError::new(
            "temperature_thresholds.charging_min must be less than charging_max",
        ));
    }
    if config.soc_thresholds.emergency > config.soc_thresholds.critical {
        return Err(validator::ValidationError::new(
            "soc_thresholds.emergency must not exceed soc_thresholds.critical",
        ));
    }
    Ok(())
}

/// Control loop cadence and emergency envelope.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct CoordinatorConfig {
    #[serde(default = "default_decision_interval_minutes")]
    #[validate(range(min = 1, max = 1440))]
    pub decision_interval_minutes: u64,

    #[serde(default = "default_sampling_interval_seconds")]
    #[validate(range(min = 1, max = 3600))]
    pub sampling_interval_seconds: u64,

    #[serde(default = "default_persist_every_samples")]
    #[validate(range(min = 1, max = 1000))]
    pub persist_every_samples: u32,

    #[serde(default = "default_health_check_interval_minutes")]
    pub health_check_interval_minutes: u64,

    #[serde(default = "default_data_retention_days")]
    #[validate(range(min = 1, max = 3650))]
    pub data_retention_days: u32,

    #[serde(default = "default_history_hours")]
    #[validate(range(min = 1, max = 168))]
    pub history_hours: u32,

    #[serde(default = "default_wait_cooldown_minutes")]
    pub wait_cooldown_minutes: i64,

    #[serde(default = "default_recovery_green_ticks")]
    #[validate(range(min = 1, max = 100))]
    pub recovery_green_ticks: u32,

    #[serde(default = "default_engine_mode")]
    pub decision_engine: DecisionEngineMode,

    #[serde(default)]
    pub emergency_stop_conditions: EmergencyStopConfig,

    #[serde(default)]
    #[validate(nested)]
    pub cheapest_price_aggressive_charging: AggressiveChargingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionEngineMode {
    Legacy,
    TimingAware,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EmergencyStopConfig {
    pub battery_temp_min: f64,
    pub battery_temp_max: f64,
    pub battery_temp_warning: f64,
    pub battery_voltage_min: f64,
    pub battery_voltage_max: f64,
    pub battery_current_max_a: f64,
    pub grid_voltage_min: f64,
    pub grid_voltage_max: f64,
    pub grid_power_max_w: f64,
    #[serde(default)]
    pub undervoltage_reboot: bool,
}

impl Default for EmergencyStopConfig {
    fn default() -> Self {
        Self {
            battery_temp_min: 0.0,
            battery_temp_max: 53.0,
            battery_temp_warning: 50.0,
            battery_voltage_min: 320.0,
            battery_voltage_max: 480.0,
            battery_current_max_a: 25.0,
            grid_voltage_min: 195.0,
            grid_voltage_max: 253.0,
            grid_power_max_w: 14_000.0,
            undervoltage_reboot: false,
        }
    }
}

/// Aggressive charging when the current price sits in the cheapest tail of
/// the day. Category thresholds are percent of the daily minimum-to-median
/// span; each tier maps to a target SoC.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct AggressiveChargingConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_aggressive_price_threshold_percent")]
    #[validate(range(min = 1.0, max = 100.0))]
    pub price_threshold_percent: f64,

    #[serde(default = "default_super_cheap_target_soc")]
    #[validate(range(min = 0.0, max = 100.0))]
    pub super_cheap_target_soc: f64,

    #[serde(default = "default_cheap_target_soc")]
    #[validate(range(min = 0.0, max = 100.0))]
    pub cheap_target_soc: f64,
}

impl Default for AggressiveChargingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            price_threshold_percent: default_aggressive_price_threshold_percent(),
            super_cheap_target_soc: default_super_cheap_target_soc(),
            cheap_target_soc: default_cheap_target_soc(),
        }
    }
}

/// Retail tariff selection.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct TariffConfig {
    pub tariff_type: TariffType,

    #[serde(default = "default_sc_component")]
    #[validate(range(min = 0.0, max = 10.0))]
    pub sc_component_pln_kwh: f64,

    /// G12W day-zone component; the SC component applies in night zones.
    #[serde(default = "default_g12w_day_component")]
    pub g12w_day_component_pln_kwh: f64,

    /// Base dynamic component for G14; scaled by the peak-label multiplier.
    #[serde(default = "default_g14_base_component")]
    pub g14_base_component_pln_kwh: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TariffType {
    Flat,
    G12w,
    G14dynamic,
}

/// Band thresholds in PLN/MWh, strictly monotonic.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[validate(schema(function = "validate_price_analysis"))]
pub struct PriceAnalysisConfig {
    pub very_low_price_threshold: f64,
    pub low_price_threshold: f64,
    pub medium_price_threshold: f64,
    pub high_price_threshold: f64,
    pub very_high_price_threshold: f64,

    #[serde(default = "default_min_charging_duration_hours")]
    pub min_charging_duration_hours: f64,

    #[serde(default = "default_max_gap_minutes")]
    pub max_gap_minutes: i64,

    #[serde(default = "default_reference_price")]
    pub reference_price_pln_mwh: f64,
}

impl Default for PriceAnalysisConfig {
    fn default() -> Self {
        Self {
            very_low_price_threshold: 150.0,
            low_price_threshold: 250.0,
            medium_price_threshold: 400.0,
            high_price_threshold: 600.0,
            very_high_price_threshold: 800.0,
            min_charging_duration_hours: default_min_charging_duration_hours(),
            max_gap_minutes: default_max_gap_minutes(),
            reference_price_pln_mwh: default_reference_price(),
        }
    }
}

fn validate_price_analysis(config: &PriceAnalysisConfig) -> Result<(), validator::ValidationError> {
    let thresholds = [
        config.very_low_price_threshold,
        config.low_price_threshold,
        config.medium_price_threshold,
        config.high_price_threshold,
        config.very_high_price_threshold,
    ];
    if !thresholds.windows(2).all(|pair| pair[0] < pair[1]) {
        return Err(validator::ValidationError::new(
            "price thresholds must be strictly increasing",
        ));
    }
    Ok(())
}

/// Hybrid-engine and night-charging knobs.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct PvConsumptionConfig {
    #[serde(default = "default_true")]
    pub night_charging_enabled: bool,

    #[serde(default = "default_night_hours")]
    pub night_hours: Vec<u32>,

    #[serde(default = "default_high_price_percentile")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub high_price_threshold_percentile: f64,

    #[serde(default = "default_poor_pv_threshold")]
    pub poor_pv_threshold_kwh_per_hour: f64,

    /// Night charging is only considered while SoC is at or below this.
    #[serde(default = "default_min_night_soc")]
    #[validate(range(min = 0.0, max = 100.0))]
    pub min_night_charging_soc: f64,

    #[serde(default = "default_max_night_soc")]
    #[validate(range(min = 0.0, max = 100.0))]
    pub max_night_charging_soc: f64,

    #[serde(default = "default_poor_pv_target_soc")]
    #[validate(range(min = 0.0, max = 100.0))]
    pub night_charging_target_soc_poor_pv: f64,

    #[serde(default = "default_true")]
    pub assume_poor_pv_on_api_failure: bool,

    #[serde(default = "default_overproduction_threshold_w")]
    pub pv_overproduction_threshold_w: f64,

    #[serde(default = "default_low_pv_override_w")]
    pub low_pv_override_w: f64,

    #[serde(default = "default_pv_capacity_kw")]
    #[validate(range(min = 0.1, max = 1000.0))]
    pub pv_capacity_kw: f64,
}

impl Default for PvConsumptionConfig {
    fn default() -> Self {
        Self {
            night_charging_enabled: true,
            night_hours: default_night_hours(),
            high_price_threshold_percentile: default_high_price_percentile(),
            poor_pv_threshold_kwh_per_hour: default_poor_pv_threshold(),
            min_night_charging_soc: default_min_night_soc(),
            max_night_charging_soc: default_max_night_soc(),
            night_charging_target_soc_poor_pv: default_poor_pv_target_soc(),
            assume_poor_pv_on_api_failure: true,
            pv_overproduction_threshold_w: default_overproduction_threshold_w(),
            low_pv_override_w: default_low_pv_override_w(),
            pv_capacity_kw: default_pv_capacity_kw(),
        }
    }
}

/// Battery selling feature with smart timing and dynamic SoC floors.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct BatterySellingConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_min_selling_soc")]
    #[validate(range(min = 0.0, max = 100.0))]
    pub min_battery_soc: f64,

    #[serde(default = "default_safety_margin_soc")]
    #[validate(range(min = 0.0, max = 100.0))]
    pub safety_margin_soc: f64,

    #[serde(default = "default_peak_hours")]
    pub peak_hours: Vec<u32>,

    #[serde(default = "default_min_selling_price")]
    pub min_selling_price_pln: f64,

    #[serde(default = "default_consumption_spike_w")]
    pub consumption_spike_threshold_w: f64,

    #[serde(default)]
    #[validate(nested)]
    pub smart_timing: SmartTimingConfig,

    #[serde(default)]
    pub dynamic_soc_thresholds: DynamicSocConfig,
}

impl Default for BatterySellingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_battery_soc: default_min_selling_soc(),
            safety_margin_soc: default_safety_margin_soc(),
            peak_hours: default_peak_hours(),
            min_selling_price_pln: default_min_selling_price(),
            consumption_spike_threshold_w: default_consumption_spike_w(),
            smart_timing: SmartTimingConfig::default(),
            dynamic_soc_thresholds: DynamicSocConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct SmartTimingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_lookahead_hours")]
    #[validate(range(min = 1, max = 48))]
    pub forecast_lookahead_hours: u32,

    #[serde(default = "default_near_peak_percent")]
    pub near_peak_threshold_percent: f64,

    #[serde(default = "default_min_peak_difference_percent")]
    pub min_peak_difference_percent: f64,

    #[serde(default = "default_max_wait_hours")]
    pub max_wait_time_hours: f64,

    #[serde(default = "default_min_forecast_confidence")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub min_forecast_confidence: f64,

    #[serde(default = "default_significant_savings_percent")]
    pub significant_savings_percent: f64,

    #[serde(default = "default_marginal_savings_percent")]
    pub marginal_savings_percent: f64,

    #[serde(default = "default_trend_window_hours")]
    pub trend_window_hours: f64,

    #[serde(default = "default_rising_threshold")]
    pub rising_threshold: f64,

    #[serde(default = "default_falling_threshold")]
    pub falling_threshold: f64,

    #[serde(default = "default_max_sessions_per_day")]
    pub max_sessions_per_day: u32,

    #[serde(default = "default_min_session_gap_hours")]
    pub min_session_gap_hours: f64,
}

impl Default for SmartTimingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            forecast_lookahead_hours: default_lookahead_hours(),
            near_peak_threshold_percent: default_near_peak_percent(),
            min_peak_difference_percent: default_min_peak_difference_percent(),
            max_wait_time_hours: default_max_wait_hours(),
            min_forecast_confidence: default_min_forecast_confidence(),
            significant_savings_percent: default_significant_savings_percent(),
            marginal_savings_percent: default_marginal_savings_percent(),
            trend_window_hours: default_trend_window_hours(),
            rising_threshold: default_rising_threshold(),
            falling_threshold: default_falling_threshold(),
            max_sessions_per_day: default_max_sessions_per_day(),
            min_session_gap_hours: default_min_session_gap_hours(),
        }
    }
}

/// Price-tiered minimum selling SoC. Premium tiers additionally require a
/// peak hour and a recharge opportunity in the forecast when so configured.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DynamicSocConfig {
    #[serde(default)]
    pub enabled: bool,
    pub super_premium_price_threshold: f64,
    pub super_premium_min_soc: f64,
    pub premium_price_threshold: f64,
    pub premium_min_soc: f64,
    pub very_high_price_threshold: f64,
    pub very_high_min_soc: f64,
    pub high_price_threshold: f64,
    pub high_min_soc: f64,
    #[serde(default = "default_true")]
    pub require_peak_hours: bool,
    #[serde(default = "default_true")]
    pub require_recharge_forecast: bool,
    #[serde(default = "default_recharge_price_ratio")]
    pub recharge_price_ratio: f64,
    #[serde(default = "default_absolute_floor_soc")]
    pub absolute_floor_soc: f64,
}

impl Default for DynamicSocConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            super_premium_price_threshold: 1.2,
            super_premium_min_soc: 50.0,
            premium_price_threshold: 0.9,
            premium_min_soc: 60.0,
            very_high_price_threshold: 0.8,
            very_high_min_soc: 70.0,
            high_price_threshold: 0.7,
            high_min_soc: 80.0,
            require_peak_hours: true,
            require_recharge_forecast: true,
            recharge_price_ratio: default_recharge_price_ratio(),
            absolute_floor_soc: default_absolute_floor_soc(),
        }
    }
}

/// Persistence back-end selection.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct DataStorageConfig {
    pub mode: StorageMode,

    #[serde(default)]
    pub file: FileStorageConfig,

    #[serde(default)]
    #[validate(nested)]
    pub database: DatabaseStorageConfig,

    #[serde(default = "default_true")]
    pub enable_fallback: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    File,
    Database,
    Composite,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FileStorageConfig {
    pub base_path: PathBuf,
}

impl Default for FileStorageConfig {
    fn default() -> Self {
        Self { base_path: PathBuf::from("out") }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct DatabaseStorageConfig {
    pub path: PathBuf,

    #[serde(default = "default_pool_size")]
    #[validate(range(min = 1, max = 64))]
    pub pool_size: u32,

    #[serde(default = "default_batch_size")]
    #[validate(range(min = 1, max = 10_000))]
    pub batch_size: usize,
}

impl Default for DatabaseStorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("out/energy.db"),
            pool_size: default_pool_size(),
            batch_size: default_batch_size(),
        }
    }
}

/// Read-only dashboard server; served by an external process, recognized here
/// so layered files validate and the log directory is created at boot.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct WebServerConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_web_host")]
    pub host: String,

    #[serde(default = "default_web_port")]
    pub port: u16,

    #[serde(default = "default_log_directory")]
    pub log_directory: PathBuf,
}

impl Default for WebServerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_web_host(),
            port: default_web_port(),
            log_directory: default_log_directory(),
        }
    }
}

// Default value functions
fn default_true() -> bool { true }
fn default_inverter_timeout_s() -> u64 { 10 }
fn default_inverter_retries() -> u32 { 3 }
fn default_inverter_retry_delay_s() -> u64 { 5 }
fn default_family() -> String { "ET".to_string() }
fn default_comm_addr() -> u8 { 247 }
fn default_battery_type() -> String { "LFP".to_string() }
fn default_charge_rate_kw() -> f64 { 5.0 }
fn default_decision_interval_minutes() -> u64 { 15 }
fn default_sampling_interval_seconds() -> u64 { 20 }
fn default_persist_every_samples() -> u32 { 15 }
fn default_health_check_interval_minutes() -> u64 { 5 }
fn default_data_retention_days() -> u32 { 90 }
fn default_history_hours() -> u32 { 24 }
fn default_wait_cooldown_minutes() -> i64 { 15 }
fn default_recovery_green_ticks() -> u32 { 3 }
fn default_engine_mode() -> DecisionEngineMode { DecisionEngineMode::TimingAware }
fn default_aggressive_price_threshold_percent() -> f64 { 25.0 }
fn default_super_cheap_target_soc() -> f64 { 100.0 }
fn default_cheap_target_soc() -> f64 { 90.0 }
fn default_sc_component() -> f64 { 0.0892 }
fn default_g12w_day_component() -> f64 { 0.3566 }
fn default_g14_base_component() -> f64 { 0.0892 }
fn default_min_charging_duration_hours() -> f64 { 0.25 }
fn default_max_gap_minutes() -> i64 { 30 }
fn default_reference_price() -> f64 { 400.0 }
fn default_night_hours() -> Vec<u32> { vec![22, 23, 0, 1, 2, 3, 4, 5] }
fn default_high_price_percentile() -> f64 { 0.75 }
fn default_poor_pv_threshold() -> f64 { 0.3 }
fn default_min_night_soc() -> f64 { 30.0 }
fn default_max_night_soc() -> f64 { 80.0 }
fn default_poor_pv_target_soc() -> f64 { 100.0 }
fn default_overproduction_threshold_w() -> f64 { 500.0 }
fn default_low_pv_override_w() -> f64 { 500.0 }
fn default_pv_capacity_kw() -> f64 { 10.0 }
fn default_min_selling_soc() -> f64 { 80.0 }
fn default_safety_margin_soc() -> f64 { 50.0 }
fn default_peak_hours() -> Vec<u32> { vec![17, 18, 19, 20, 21] }
fn default_min_selling_price() -> f64 { 0.50 }
fn default_consumption_spike_w() -> f64 { 5000.0 }
fn default_lookahead_hours() -> u32 { 6 }
fn default_near_peak_percent() -> f64 { 95.0 }
fn default_min_peak_difference_percent() -> f64 { 15.0 }
fn default_max_wait_hours() -> f64 { 4.0 }
fn default_min_forecast_confidence() -> f64 { 0.6 }
fn default_significant_savings_percent() -> f64 { 20.0 }
fn default_marginal_savings_percent() -> f64 { 5.0 }
fn default_trend_window_hours() -> f64 { 2.0 }
fn default_rising_threshold() -> f64 { 0.02 }
fn default_falling_threshold() -> f64 { -0.02 }
fn default_max_sessions_per_day() -> u32 { 3 }
fn default_min_session_gap_hours() -> f64 { 1.0 }
fn default_recharge_price_ratio() -> f64 { 0.7 }
fn default_absolute_floor_soc() -> f64 { 50.0 }
fn default_pool_size() -> u32 { 4 }
fn default_batch_size() -> usize { 100 }
fn default_web_host() -> String { "0.0.0.0".to_string() }
fn default_web_port() -> u16 { 8080 }
fn default_log_directory() -> PathBuf { PathBuf::from("logs") }

/// Deep-merge `overlay` into `base`: mappings merge recursively, everything
/// else (scalars, sequences) is replaced by the overlay value.
pub fn deep_merge(base: serde_yaml::Value, overlay: serde_yaml::Value) -> serde_yaml::Value {
    use serde_yaml::Value;
    match (base, overlay) {
        (Value::Mapping(mut base_map), Value::Mapping(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                let merged = match base_map.remove(&key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => overlay_value,
                };
                base_map.insert(key, merged);
            }
            Value::Mapping(base_map)
        }
        (_, overlay) => overlay,
    }
}

impl AppConfig {
    /// Load the layered configuration from `dir`.
    ///
    /// Layers, later overrides earlier: `baseline.yaml` (required) →
    /// `local.yaml` → `override.yaml`. A missing `local.yaml` is bootstrapped
    /// as a copy of the baseline on first run.
    pub fn load_layered(dir: &Path) -> Result<Self> {
        let baseline_path = dir.join("baseline.yaml");
        let local_path = dir.join("local.yaml");
        let override_path = dir.join("override.yaml");

        let baseline_text = std::fs::read_to_string(&baseline_path)
            .with_context(|| format!("missing baseline config: {}", baseline_path.display()))?;
        let mut merged: serde_yaml::Value = serde_yaml::from_str(&baseline_text)
            .with_context(|| format!("invalid YAML in {}", baseline_path.display()))?;

        if local_path.exists() {
            let local_text = std::fs::read_to_string(&local_path)
                .with_context(|| format!("unreadable local config: {}", local_path.display()))?;
            let local: serde_yaml::Value = serde_yaml::from_str(&local_text)
                .with_context(|| format!("invalid YAML in {}", local_path.display()))?;
            merged = deep_merge(merged, local);
        } else {
            std::fs::write(&local_path, &baseline_text).with_context(|| {
                format!("failed to bootstrap local config at {}", local_path.display())
            })?;
        }

        if override_path.exists() {
            let override_text = std::fs::read_to_string(&override_path)
                .with_context(|| format!("unreadable override config: {}", override_path.display()))?;
            let overlay: serde_yaml::Value = serde_yaml::from_str(&override_text)
                .with_context(|| format!("invalid YAML in {}", override_path.display()))?;
            merged = deep_merge(merged, overlay);
        }

        Self::from_value(merged)
    }

    pub fn from_value(value: serde_yaml::Value) -> Result<Self> {
        let config: AppConfig =
            serde_yaml::from_value(value).context("failed to parse configuration")?;
        config.validate_consistency()?;
        Ok(config)
    }

    /// Cross-section checks that validator attributes cannot express.
    fn validate_consistency(&self) -> Result<()> {
        self.validate().context("configuration validation failed")?;

        // G14-dynamic prices depend on the operator's hourly labels.
        if self.electricity_tariff.tariff_type == TariffType::G14dynamic
            && !self.pse_peak_hours.enabled
        {
            bail!(
                "electricity_tariff.tariff_type is g14dynamic but pse_peak_hours.enabled is false; \
                 the dynamic tariff requires the peak-hours feed"
            );
        }

        if self.battery_selling.enabled
            && self.battery_selling.safety_margin_soc > self.battery_selling.min_battery_soc
        {
            bail!(
                "battery_selling.safety_margin_soc ({}) must not exceed battery_selling.min_battery_soc ({})",
                self.battery_selling.safety_margin_soc,
                self.battery_selling.min_battery_soc
            );
        }

        for hour in &self.pv_consumption_analysis.night_hours {
            if *hour > 23 {
                bail!("pv_consumption_analysis.night_hours contains invalid hour {hour}");
            }
        }
        for hour in &self.battery_selling.peak_hours {
            if *hour > 23 {
                bail!("battery_selling.peak_hours contains invalid hour {hour}");
            }
        }

        Ok(())
    }
}
