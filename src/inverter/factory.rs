use std::sync::Arc;
use tracing::info;

use super::simulated::SimulatedInverter;
use super::{InverterError, InverterPort, InverterResult};
use crate::config::InverterConfig;

/// Build the inverter adapter selected by `inverter.vendor`.
///
/// `goodwe` requires the `modbus` feature; `simulated` is always available
/// and backs tests and dry runs.
pub fn build_inverter(cfg: &InverterConfig) -> InverterResult<Arc<dyn InverterPort>> {
    match cfg.vendor.to_lowercase().as_str() {
        "simulated" => {
            info!("using simulated inverter");
            Ok(Arc::new(SimulatedInverter::new()))
        }
        #[cfg(feature = "modbus")]
        "goodwe" => {
            info!(family = %cfg.vendor_specific.family, "using GoodWe Modbus adapter");
            Ok(Arc::new(super::goodwe::GoodweInverter::new(cfg)))
        }
        #[cfg(not(feature = "modbus"))]
        "goodwe" => Err(InverterError::InvalidArgument(
            "vendor 'goodwe' requires the 'modbus' feature".to_string(),
        )),
        other => Err(InverterError::InvalidArgument(format!(
            "unknown inverter vendor '{other}' (expected 'goodwe' or 'simulated')"
        ))),
    }
}
