use async_trait::async_trait;
use byteorder::{BigEndian, ByteOrder};
use chrono::Utc;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_modbus::client::tcp;
use tokio_modbus::prelude::*;
use tracing::{debug, info, warn};

use super::{
    evaluate_safety, BatteryStatus, ConsumptionData, DeviceInfo, GridData, InverterError,
    InverterPort, InverterResult, InverterStatus, InverterWorkMode, OperationMode, PvData,
    RuntimeData, SafetyCheck, SafetyLimits, SensorReading,
};
use crate::config::InverterConfig;

/// GoodWe ET-family register map (Modbus TCP, unit id usually 247).
mod registers {
    // Device identity (ASCII packed two chars per register)
    pub const SERIAL_NUMBER: u16 = 35003;
    pub const SERIAL_NUMBER_LEN: u16 = 8;
    pub const MODEL_NAME: u16 = 35011;
    pub const MODEL_NAME_LEN: u16 = 5;

    // Running data
    pub const PV1_POWER: u16 = 35105; // u32, W
    pub const PV2_POWER: u16 = 35109; // u32, W
    pub const GRID_VOLTAGE: u16 = 35121; // u16, 0.1 V
    pub const GRID_FREQUENCY: u16 = 35123; // u16, 0.01 Hz
    pub const GRID_POWER: u16 = 35125; // s16, W, positive = export
    pub const PHASE_CURRENTS: u16 = 35126; // 3 × u16, 0.1 A
    pub const WORK_MODE: u16 = 35187; // u16
    pub const ERROR_CODES: u16 = 35189; // u32 bitmask
    pub const PV_ENERGY_DAY: u16 = 35199; // u16, 0.1 kWh
    pub const GRID_EXPORT_DAY: u16 = 35200; // u16, 0.1 kWh
    pub const GRID_IMPORT_DAY: u16 = 35201; // u16, 0.1 kWh
    pub const LOAD_ENERGY_DAY: u16 = 35202; // u16, 0.1 kWh

    // Battery block
    pub const BATTERY_VOLTAGE: u16 = 37001; // u16, 0.1 V
    pub const BATTERY_CURRENT: u16 = 37002; // s16, 0.1 A, positive = discharge
    pub const BATTERY_TEMPERATURE: u16 = 37003; // s16, 0.1 C
    pub const BATTERY_SOC: u16 = 37007; // u16, %

    // Settings
    pub const OPERATION_MODE: u16 = 47000; // u16 vendor opcode
    pub const EXPORT_LIMIT: u16 = 47509; // u16, W
    pub const ECO_MODE_POWER: u16 = 47512; // u16, % of rated power
    pub const ECO_MODE_SOC: u16 = 47513; // u16, %
    pub const FAST_CHARGING: u16 = 47545; // u16 bool
    pub const FAST_CHARGING_SOC: u16 = 47546; // u16, %
    pub const BATTERY_DOD: u16 = 47547; // u16, %
    pub const FAST_CHARGING_POWER: u16 = 47603; // u16, % of rated power
}

/// Vendor opcodes for `registers::OPERATION_MODE`.
fn vendor_opcode(mode: OperationMode) -> Option<u16> {
    match mode {
        OperationMode::General => Some(0),
        OperationMode::OffGrid => Some(1),
        OperationMode::Backup => Some(2),
        OperationMode::Eco => Some(3),
        // Eco charge/discharge are eco-mode variants configured through the
        // eco power/SoC group, not a standalone opcode.
        OperationMode::EcoCharge => Some(3),
        OperationMode::EcoDischarge => Some(3),
    }
}

struct Connection {
    ctx: tokio_modbus::client::Context,
    info: DeviceInfo,
}

/// Modbus TCP adapter for GoodWe ET hybrid inverters.
///
/// The TCP session is created once at connect and reused; the mutex
/// serializes concurrent callers onto the single socket.
pub struct GoodweInverter {
    connection: Mutex<Option<Connection>>,
    charge_state: Mutex<ChargeState>,
    timeout: Duration,
    unit_id: u8,
}

#[derive(Debug, Default, Clone, Copy)]
struct ChargeState {
    charging: bool,
    params: Option<(u8, u8)>,
}

impl GoodweInverter {
    pub fn new(cfg: &InverterConfig) -> Self {
        Self {
            connection: Mutex::new(None),
            charge_state: Mutex::new(ChargeState::default()),
            timeout: Duration::from_secs(cfg.timeout_s),
            unit_id: cfg.vendor_specific.comm_addr,
        }
    }

    async fn with_timeout<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, std::io::Error>>,
    ) -> InverterResult<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(InverterError::Protocol(e.to_string())),
            Err(_) => Err(InverterError::Timeout),
        }
    }

    async fn read_registers(&self, start: u16, count: u16) -> InverterResult<Vec<u16>> {
        let mut guard = self.connection.lock().await;
        let conn = guard.as_mut().ok_or(InverterError::NotConnected)?;
        conn.ctx.set_slave(Slave(self.unit_id));
        self.with_timeout(conn.ctx.read_holding_registers(start, count))
            .await
    }

    async fn write_register(&self, addr: u16, value: u16) -> InverterResult<()> {
        let mut guard = self.connection.lock().await;
        let conn = guard.as_mut().ok_or(InverterError::NotConnected)?;
        conn.ctx.set_slave(Slave(self.unit_id));
        self.with_timeout(conn.ctx.write_single_register(addr, value))
            .await
    }

    fn words_to_ascii(words: &[u16]) -> String {
        let mut out = String::with_capacity(words.len() * 2);
        for word in words {
            for byte in word.to_be_bytes() {
                if byte.is_ascii_graphic() {
                    out.push(byte as char);
                }
            }
        }
        out.trim().to_string()
    }

    fn u32_at(words: &[u16], offset: usize) -> Option<u32> {
        let high = words.get(offset)?.to_be_bytes();
        let low = words.get(offset + 1)?.to_be_bytes();
        Some(BigEndian::read_u32(&[high[0], high[1], low[0], low[1]]))
    }

    fn s16(word: u16) -> f64 {
        word as i16 as f64
    }

    async fn handshake(
        &self,
        ctx: &mut tokio_modbus::client::Context,
    ) -> InverterResult<DeviceInfo> {
        ctx.set_slave(Slave(self.unit_id));
        let serial_words = self
            .with_timeout(ctx.read_holding_registers(
                registers::SERIAL_NUMBER,
                registers::SERIAL_NUMBER_LEN,
            ))
            .await?;
        let model_words = self
            .with_timeout(
                ctx.read_holding_registers(registers::MODEL_NAME, registers::MODEL_NAME_LEN),
            )
            .await?;

        let serial = Self::words_to_ascii(&serial_words);
        let model = Self::words_to_ascii(&model_words);
        if serial.is_empty() || model.is_empty() {
            return Err(InverterError::Protocol(
                "handshake returned empty model/serial".to_string(),
            ));
        }
        Ok(DeviceInfo {
            model,
            serial,
            firmware: None,
        })
    }

    async fn battery_block(&self) -> InverterResult<BatteryStatus> {
        // 37001..=37007 covers voltage, current, temperature and SoC.
        let words = self.read_registers(registers::BATTERY_VOLTAGE, 7).await?;
        let voltage_v = words.first().map(|w| *w as f64 / 10.0);
        // Vendor convention: positive current = discharging, which matches
        // the site convention (negative = charging).
        let current_a = words.get(1).map(|w| Self::s16(*w) / 10.0);
        let temperature_c = words.get(2).map(|w| Self::s16(*w) / 10.0);
        let soc_percent = words.get(6).map(|w| *w as f64);
        let power_w = match (voltage_v, current_a) {
            (Some(v), Some(i)) => Some(v * i),
            _ => None,
        };
        let charging = self.charge_state.lock().await.charging
            || current_a.is_some_and(|i| i < -0.5);

        Ok(BatteryStatus {
            soc_percent,
            voltage_v,
            current_a,
            power_w,
            temperature_c,
            charging,
        })
    }

    async fn grid_block(&self) -> InverterResult<GridData> {
        // 35121..=35128: voltage, (current), frequency, (reserved), power,
        // three phase currents.
        let words = self.read_registers(registers::GRID_VOLTAGE, 9).await?;
        let voltage_v = words.first().map(|w| *w as f64 / 10.0);
        let frequency_hz = words.get(2).map(|w| *w as f64 / 100.0);
        // Vendor reports positive = export; the site convention is
        // positive = import.
        let power_w = words.get(4).map(|w| -Self::s16(*w));
        let phase_current_a = [
            words.get(5).map(|w| *w as f64 / 10.0),
            words.get(6).map(|w| *w as f64 / 10.0),
            words.get(7).map(|w| *w as f64 / 10.0),
        ];

        let day = self.read_registers(registers::GRID_EXPORT_DAY, 2).await?;
        let daily_export_wh = day.first().map(|w| *w as f64 * 100.0);
        let daily_import_wh = day.get(1).map(|w| *w as f64 * 100.0);

        Ok(GridData {
            power_w,
            voltage_v,
            frequency_hz,
            phase_current_a,
            daily_import_wh,
            daily_export_wh,
        })
    }
}

#[async_trait]
impl InverterPort for GoodweInverter {
    async fn connect(&self, cfg: &InverterConfig) -> InverterResult<DeviceInfo> {
        let addr: SocketAddr = format!("{}:{}", cfg.ip_address, cfg.port)
            .parse()
            .map_err(|e| InverterError::InvalidArgument(format!("inverter address: {e}")))?;

        let mut last_error = String::from("no attempts made");
        for attempt in 1..=cfg.retries {
            match tcp::connect(addr).await {
                Ok(mut ctx) => match self.handshake(&mut ctx).await {
                    Ok(info) => {
                        info!(model = %info.model, serial = %info.serial, "inverter connected");
                        *self.connection.lock().await = Some(Connection {
                            ctx,
                            info: info.clone(),
                        });
                        return Ok(info);
                    }
                    Err(e) => {
                        last_error = e.to_string();
                        warn!(attempt, error = %last_error, "inverter handshake failed");
                    }
                },
                Err(e) => {
                    last_error = e.to_string();
                    warn!(attempt, error = %last_error, "inverter TCP connect failed");
                }
            }
            if attempt < cfg.retries {
                // Capped linear backoff.
                let delay = (cfg.retry_delay_s * attempt as u64).min(60);
                tokio::time::sleep(Duration::from_secs(delay)).await;
            }
        }

        Err(InverterError::ConnectExhausted {
            attempts: cfg.retries,
            last_error,
        })
    }

    async fn disconnect(&self) -> InverterResult<()> {
        let mut guard = self.connection.lock().await;
        if guard.take().is_some() {
            debug!("inverter disconnected");
        }
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.connection.lock().await.is_some()
    }

    async fn read_status(&self) -> InverterResult<InverterStatus> {
        let words = self.read_registers(registers::WORK_MODE, 4).await?;
        let work_mode = match words.first().copied() {
            Some(0..=3) => InverterWorkMode::Normal,
            Some(_) => InverterWorkMode::Fault,
            None => InverterWorkMode::Unknown,
        };
        let error_bits = Self::u32_at(&words, 2).unwrap_or(0);
        let error_codes = (0..32)
            .filter(|bit| error_bits & (1 << bit) != 0)
            .map(|bit| format!("E{bit:02}"))
            .collect();

        Ok(InverterStatus {
            work_mode,
            error_codes,
            read_at: Utc::now(),
        })
    }

    async fn read_battery(&self) -> InverterResult<BatteryStatus> {
        self.battery_block().await
    }

    async fn read_runtime(&self) -> InverterResult<HashMap<String, SensorReading>> {
        let battery = self.battery_block().await?;
        let grid = self.grid_block().await?;
        let pv = self.collect_pv().await?;

        let mut sensors = HashMap::new();
        let mut put = |key: &str, value: Option<f64>| {
            sensors.insert(
                key.to_string(),
                value.map_or(SensorReading::Missing, SensorReading::Float),
            );
        };
        put("battery_soc", battery.soc_percent);
        put("vbattery1", battery.voltage_v);
        put("ibattery1", battery.current_a);
        put("battery_temperature", battery.temperature_c);
        put("ppv", pv.power_w);
        put("active_power", grid.power_w);
        put("vgrid", grid.voltage_v);
        put("fgrid", grid.frequency_hz);
        Ok(sensors)
    }

    async fn check_safety(&self, limits: &SafetyLimits) -> InverterResult<SafetyCheck> {
        let battery = self.battery_block().await?;
        let grid = self.grid_block().await?;
        Ok(evaluate_safety(limits, &battery, &grid))
    }

    async fn set_operation_mode(
        &self,
        mode: OperationMode,
        power_w: Option<u32>,
        min_soc: Option<u8>,
    ) -> InverterResult<()> {
        let opcode = vendor_opcode(mode).ok_or(InverterError::UnsupportedMode(mode))?;
        self.write_register(registers::OPERATION_MODE, opcode).await?;

        // Eco variants carry their power/SoC setpoints in the eco group.
        if matches!(mode, OperationMode::EcoCharge | OperationMode::EcoDischarge) {
            if let Some(power) = power_w {
                let pct = (power / 100).min(100) as u16;
                self.write_register(registers::ECO_MODE_POWER, pct).await?;
            }
            if let Some(soc) = min_soc {
                self.write_register(registers::ECO_MODE_SOC, soc as u16)
                    .await?;
            }
        }
        info!(%mode, "operation mode set");
        Ok(())
    }

    async fn start_charging(&self, power_pct: u8, target_soc: u8) -> InverterResult<()> {
        if power_pct > 100 || target_soc > 100 {
            return Err(InverterError::InvalidArgument(format!(
                "power_pct {power_pct} / target_soc {target_soc} out of range"
            )));
        }

        {
            let state = self.charge_state.lock().await;
            if state.charging && state.params == Some((power_pct, target_soc)) {
                debug!(power_pct, target_soc, "charging already active with same parameters");
                return Ok(());
            }
        }

        self.write_register(registers::FAST_CHARGING, 1).await?;
        self.write_register(registers::FAST_CHARGING_POWER, power_pct as u16)
            .await?;
        self.write_register(registers::FAST_CHARGING_SOC, target_soc as u16)
            .await?;

        let mut state = self.charge_state.lock().await;
        state.charging = true;
        state.params = Some((power_pct, target_soc));
        info!(power_pct, target_soc, "fast charging started");
        Ok(())
    }

    async fn stop_charging(&self) -> InverterResult<()> {
        {
            let state = self.charge_state.lock().await;
            if !state.charging {
                return Ok(());
            }
        }
        self.write_register(registers::FAST_CHARGING, 0).await?;
        let mut state = self.charge_state.lock().await;
        state.charging = false;
        state.params = None;
        info!("fast charging stopped");
        Ok(())
    }

    async fn set_export_limit(&self, power_w: u32) -> InverterResult<()> {
        let capped = power_w.min(u16::MAX as u32) as u16;
        self.write_register(registers::EXPORT_LIMIT, capped).await?;
        info!(power_w = capped, "grid export limit set");
        Ok(())
    }

    async fn set_battery_dod(&self, depth_pct: u8) -> InverterResult<()> {
        if depth_pct > 100 {
            return Err(InverterError::InvalidArgument(format!(
                "depth_pct {depth_pct} out of range"
            )));
        }
        self.write_register(registers::BATTERY_DOD, depth_pct as u16)
            .await?;
        Ok(())
    }

    async fn emergency_stop(&self) -> InverterResult<()> {
        // Best-effort, in order of importance; failures are reported but do
        // not short-circuit the remaining steps.
        let mut first_error: Option<InverterError> = None;

        if let Err(e) = self.write_register(registers::FAST_CHARGING, 0).await {
            warn!(error=%e, "emergency stop: failed to clear fast charging");
            first_error.get_or_insert(e);
        }
        if let Err(e) = self
            .write_register(registers::OPERATION_MODE, vendor_opcode(OperationMode::General).unwrap_or(0))
            .await
        {
            warn!(error=%e, "emergency stop: failed to restore general mode");
            first_error.get_or_insert(e);
        }

        let mut state = self.charge_state.lock().await;
        state.charging = false;
        state.params = None;

        match first_error {
            None => {
                info!("emergency stop executed");
                Ok(())
            }
            Some(e) => Err(e),
        }
    }

    async fn collect_pv(&self) -> InverterResult<PvData> {
        // 35105..=35110 covers both string power values.
        let words = self.read_registers(registers::PV1_POWER, 6).await?;
        let pv1 = Self::u32_at(&words, 0).map(|w| w as f64);
        let pv2 = Self::u32_at(&words, (registers::PV2_POWER - registers::PV1_POWER) as usize)
            .map(|w| w as f64);
        let power_w = match (pv1, pv2) {
            (Some(a), Some(b)) => Some(a + b),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        };

        let day = self.read_registers(registers::PV_ENERGY_DAY, 1).await?;
        let daily_energy_wh = day.first().map(|w| *w as f64 * 100.0);

        Ok(PvData {
            power_w,
            string_power_w: vec![pv1, pv2],
            daily_energy_wh,
        })
    }

    async fn collect_grid(&self) -> InverterResult<GridData> {
        self.grid_block().await
    }

    async fn collect_consumption(&self) -> InverterResult<ConsumptionData> {
        // The meter has no direct load channel; consumption is reconstructed
        // from the balance pv + battery_discharge + grid_import.
        let pv = self.collect_pv().await?;
        let battery = self.battery_block().await?;
        let grid = self.grid_block().await?;

        let power_w = match (pv.power_w, battery.power_w, grid.power_w) {
            (Some(pv_w), Some(battery_w), Some(grid_w)) => {
                Some((pv_w + battery_w + grid_w).max(0.0))
            }
            _ => None,
        };
        let day = self.read_registers(registers::LOAD_ENERGY_DAY, 1).await?;
        let daily_energy_wh = day.first().map(|w| *w as f64 * 100.0);

        Ok(ConsumptionData {
            power_w,
            daily_energy_wh,
        })
    }

    async fn collect_all(&self) -> InverterResult<RuntimeData> {
        let battery = self.battery_block().await?;
        let pv = self.collect_pv().await?;
        let grid = self.grid_block().await?;
        let consumption = self.collect_consumption().await?;
        let status = self.read_status().await?;
        let sensors = self.read_runtime().await?;
        Ok(RuntimeData {
            read_at: Utc::now(),
            battery,
            pv,
            grid,
            consumption,
            status,
            sensors,
        })
    }
}

impl std::fmt::Debug for GoodweInverter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoodweInverter")
            .field("unit_id", &self.unit_id)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_decoding_strips_padding() {
        // "GW10" packed big-endian two chars per word, padded with NULs.
        let words = [0x4757, 0x3130, 0x0000];
        assert_eq!(GoodweInverter::words_to_ascii(&words), "GW10");
    }

    #[test]
    fn u32_assembly_is_big_endian_word_order() {
        let words = [0x0001, 0x86A0]; // 100000
        assert_eq!(GoodweInverter::u32_at(&words, 0), Some(100_000));
        assert_eq!(GoodweInverter::u32_at(&words, 1), None);
    }

    #[test]
    fn signed_register_decoding() {
        assert_eq!(GoodweInverter::s16(0xFFFF), -1.0);
        assert_eq!(GoodweInverter::s16(0x8000), -32768.0);
        assert_eq!(GoodweInverter::s16(100), 100.0);
    }

    #[test]
    fn all_operation_modes_have_opcodes() {
        for mode in [
            OperationMode::General,
            OperationMode::OffGrid,
            OperationMode::Backup,
            OperationMode::Eco,
            OperationMode::EcoCharge,
            OperationMode::EcoDischarge,
        ] {
            assert!(vendor_opcode(mode).is_some(), "missing opcode for {mode}");
        }
    }
}
