use async_trait::async_trait;
use chrono::{Timelike, Utc};
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{
    evaluate_safety, BatteryStatus, ConsumptionData, DeviceInfo, GridData, InverterError,
    InverterPort, InverterResult, InverterStatus, InverterWorkMode, OperationMode, PvData,
    RuntimeData, SafetyCheck, SafetyLimits, SensorReading,
};
use crate::config::InverterConfig;

/// In-process inverter used in simulation mode and tests. Tracks SoC against
/// the commanded charge and produces a plausible diurnal PV curve.
pub struct SimulatedInverter {
    state: RwLock<SimState>,
    connected: AtomicBool,
    /// ±1% multiplicative noise on sensor readings when enabled.
    pub simulate_noise: bool,
}

#[derive(Debug, Clone)]
struct SimState {
    soc_percent: f64,
    battery_voltage_v: f64,
    battery_temp_c: f64,
    capacity_kwh: f64,
    charging: bool,
    charge_params: Option<(u8, u8)>,
    charge_power_kw: f64,
    operation_mode: OperationMode,
    export_limit_w: Option<u32>,
    dod_percent: Option<u8>,
    consumption_w: f64,
    last_tick: chrono::DateTime<Utc>,
    daily_pv_wh: f64,
    daily_import_wh: f64,
    daily_export_wh: f64,
    daily_consumption_wh: f64,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            soc_percent: 55.0,
            battery_voltage_v: 400.0,
            battery_temp_c: 24.0,
            capacity_kwh: 20.0,
            charging: false,
            charge_params: None,
            charge_power_kw: 5.0,
            operation_mode: OperationMode::General,
            export_limit_w: None,
            dod_percent: None,
            consumption_w: 1200.0,
            last_tick: Utc::now(),
            daily_pv_wh: 0.0,
            daily_import_wh: 0.0,
            daily_export_wh: 0.0,
            daily_consumption_wh: 0.0,
        }
    }
}

impl SimulatedInverter {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(SimState::default()),
            connected: AtomicBool::new(false),
            simulate_noise: false,
        }
    }

    pub fn with_soc(soc_percent: f64) -> Self {
        let mut state = SimState::default();
        state.soc_percent = soc_percent.clamp(0.0, 100.0);
        Self {
            state: RwLock::new(state),
            connected: AtomicBool::new(false),
            simulate_noise: false,
        }
    }

    fn noisy(&self, value: f64) -> f64 {
        if !self.simulate_noise {
            return value;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-0.01..0.01);
        value * factor
    }

    fn ensure_connected(&self) -> InverterResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(InverterError::NotConnected)
        }
    }

    /// Diurnal PV curve peaking at noon, zero at night.
    fn pv_power_w(hour: u32) -> f64 {
        if !(6..=20).contains(&hour) {
            return 0.0;
        }
        let phase = (hour as f64 - 6.0) / 14.0 * std::f64::consts::PI;
        (phase.sin() * 5200.0).max(0.0)
    }

    /// Advance SoC and daily counters by wall-clock time since the last read.
    async fn tick(&self) {
        let mut state = self.state.write().await;
        let now = Utc::now();
        let dt_h = (now - state.last_tick).num_milliseconds() as f64 / 3_600_000.0;
        state.last_tick = now;
        if dt_h <= 0.0 {
            return;
        }

        let pv_w = Self::pv_power_w(now.hour());
        state.daily_pv_wh += pv_w * dt_h;
        state.daily_consumption_wh += state.consumption_w * dt_h;

        if state.charging {
            let delta_kwh = state.charge_power_kw * dt_h * 0.95;
            state.soc_percent =
                (state.soc_percent + delta_kwh / state.capacity_kwh * 100.0).min(100.0);
            if let Some((_, target_soc)) = state.charge_params {
                if state.soc_percent >= target_soc as f64 {
                    state.charging = false;
                    state.charge_params = None;
                }
            }
        }

        let net_w = pv_w - state.consumption_w;
        if net_w >= 0.0 {
            state.daily_export_wh += net_w * dt_h;
        } else {
            state.daily_import_wh += -net_w * dt_h;
        }
    }

    async fn battery_status(&self) -> BatteryStatus {
        let state = self.state.read().await;
        let power_w = if state.charging {
            -state.charge_power_kw * 1000.0
        } else {
            0.0
        };
        BatteryStatus {
            soc_percent: Some(self.noisy(state.soc_percent).clamp(0.0, 100.0)),
            voltage_v: Some(self.noisy(state.battery_voltage_v)),
            current_a: Some(power_w / state.battery_voltage_v.max(1.0)),
            power_w: Some(power_w),
            temperature_c: Some(self.noisy(state.battery_temp_c)),
            charging: state.charging,
        }
    }

    async fn grid_data(&self) -> GridData {
        let state = self.state.read().await;
        let pv_w = Self::pv_power_w(Utc::now().hour());
        let battery_w = if state.charging {
            state.charge_power_kw * 1000.0
        } else {
            0.0
        };
        // import = consumption + battery charge - pv
        let net_import = state.consumption_w + battery_w - pv_w;
        GridData {
            power_w: Some(net_import),
            voltage_v: Some(self.noisy(231.0)),
            frequency_hz: Some(50.0),
            phase_current_a: [Some(net_import.abs() / 230.0), Some(0.0), Some(0.0)],
            daily_import_wh: Some(state.daily_import_wh),
            daily_export_wh: Some(state.daily_export_wh),
        }
    }
}

impl Default for SimulatedInverter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InverterPort for SimulatedInverter {
    async fn connect(&self, _cfg: &InverterConfig) -> InverterResult<DeviceInfo> {
        self.connected.store(true, Ordering::SeqCst);
        info!("simulated inverter connected");
        Ok(DeviceInfo {
            model: "SIM-10K-ET".to_string(),
            serial: "SIM0000001".to_string(),
            firmware: Some("sim-1.0".to_string()),
        })
    }

    async fn disconnect(&self) -> InverterResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn read_status(&self) -> InverterResult<InverterStatus> {
        self.ensure_connected()?;
        Ok(InverterStatus {
            work_mode: InverterWorkMode::Normal,
            error_codes: Vec::new(),
            read_at: Utc::now(),
        })
    }

    async fn read_battery(&self) -> InverterResult<BatteryStatus> {
        self.ensure_connected()?;
        self.tick().await;
        Ok(self.battery_status().await)
    }

    async fn read_runtime(&self) -> InverterResult<HashMap<String, SensorReading>> {
        self.ensure_connected()?;
        self.tick().await;
        let battery = self.battery_status().await;
        let grid = self.grid_data().await;
        let state = self.state.read().await;

        let mut sensors = HashMap::new();
        sensors.insert(
            "battery_soc".into(),
            battery
                .soc_percent
                .map_or(SensorReading::Missing, SensorReading::Float),
        );
        sensors.insert(
            "vbattery1".into(),
            battery
                .voltage_v
                .map_or(SensorReading::Missing, SensorReading::Float),
        );
        sensors.insert(
            "battery_temperature".into(),
            battery
                .temperature_c
                .map_or(SensorReading::Missing, SensorReading::Float),
        );
        sensors.insert(
            "ppv".into(),
            SensorReading::Float(Self::pv_power_w(Utc::now().hour())),
        );
        sensors.insert(
            "house_consumption".into(),
            SensorReading::Float(state.consumption_w),
        );
        sensors.insert(
            "active_power".into(),
            grid.power_w.map_or(SensorReading::Missing, SensorReading::Float),
        );
        Ok(sensors)
    }

    async fn check_safety(&self, limits: &SafetyLimits) -> InverterResult<SafetyCheck> {
        self.ensure_connected()?;
        let battery = self.battery_status().await;
        let grid = self.grid_data().await;
        Ok(evaluate_safety(limits, &battery, &grid))
    }

    async fn set_operation_mode(
        &self,
        mode: OperationMode,
        _power_w: Option<u32>,
        _min_soc: Option<u8>,
    ) -> InverterResult<()> {
        self.ensure_connected()?;
        self.state.write().await.operation_mode = mode;
        debug!(%mode, "simulated operation mode set");
        Ok(())
    }

    async fn start_charging(&self, power_pct: u8, target_soc: u8) -> InverterResult<()> {
        self.ensure_connected()?;
        if power_pct > 100 || target_soc > 100 {
            return Err(InverterError::InvalidArgument(format!(
                "power_pct {power_pct} / target_soc {target_soc} out of range"
            )));
        }
        let mut state = self.state.write().await;
        if state.charging && state.charge_params == Some((power_pct, target_soc)) {
            return Ok(());
        }
        state.charging = true;
        state.charge_params = Some((power_pct, target_soc));
        state.charge_power_kw = 5.0 * power_pct as f64 / 100.0;
        info!(power_pct, target_soc, "simulated charging started");
        Ok(())
    }

    async fn stop_charging(&self) -> InverterResult<()> {
        self.ensure_connected()?;
        let mut state = self.state.write().await;
        if !state.charging {
            return Ok(());
        }
        state.charging = false;
        state.charge_params = None;
        info!("simulated charging stopped");
        Ok(())
    }

    async fn set_export_limit(&self, power_w: u32) -> InverterResult<()> {
        self.ensure_connected()?;
        self.state.write().await.export_limit_w = Some(power_w);
        Ok(())
    }

    async fn set_battery_dod(&self, depth_pct: u8) -> InverterResult<()> {
        self.ensure_connected()?;
        if depth_pct > 100 {
            return Err(InverterError::InvalidArgument(format!(
                "depth_pct {depth_pct} out of range"
            )));
        }
        self.state.write().await.dod_percent = Some(depth_pct);
        Ok(())
    }

    async fn emergency_stop(&self) -> InverterResult<()> {
        // Deliberately skips the connection check: an emergency stop must be
        // attempted even when the session state is in doubt.
        let mut state = self.state.write().await;
        state.charging = false;
        state.charge_params = None;
        state.operation_mode = OperationMode::General;
        info!("simulated emergency stop executed");
        Ok(())
    }

    async fn collect_pv(&self) -> InverterResult<PvData> {
        self.ensure_connected()?;
        self.tick().await;
        let state = self.state.read().await;
        let pv_w = Self::pv_power_w(Utc::now().hour());
        Ok(PvData {
            power_w: Some(self.noisy(pv_w)),
            string_power_w: vec![Some(pv_w * 0.52), Some(pv_w * 0.48)],
            daily_energy_wh: Some(state.daily_pv_wh),
        })
    }

    async fn collect_grid(&self) -> InverterResult<GridData> {
        self.ensure_connected()?;
        self.tick().await;
        Ok(self.grid_data().await)
    }

    async fn collect_consumption(&self) -> InverterResult<ConsumptionData> {
        self.ensure_connected()?;
        self.tick().await;
        let state = self.state.read().await;
        Ok(ConsumptionData {
            power_w: Some(self.noisy(state.consumption_w)),
            daily_energy_wh: Some(state.daily_consumption_wh),
        })
    }

    async fn collect_all(&self) -> InverterResult<RuntimeData> {
        self.ensure_connected()?;
        self.tick().await;
        let battery = self.battery_status().await;
        let pv = self.collect_pv().await?;
        let grid = self.grid_data().await;
        let consumption = self.collect_consumption().await?;
        let sensors = self.read_runtime().await?;
        Ok(RuntimeData {
            read_at: Utc::now(),
            battery,
            pv,
            grid,
            consumption,
            status: InverterStatus {
                work_mode: InverterWorkMode::Normal,
                error_codes: Vec::new(),
                read_at: Utc::now(),
            },
            sensors,
        })
    }
}
