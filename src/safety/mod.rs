use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::config::BatteryManagementConfig;
use crate::domain::Snapshot;
use crate::inverter::SafetyLimits;

/// Result of one envelope evaluation. Fatal breaches force an emergency
/// stop; warnings ride along on the next decision.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SafetyAssessment {
    pub fatal: Vec<String>,
    pub warnings: Vec<String>,
}

impl SafetyAssessment {
    pub fn is_safe(&self) -> bool {
        self.fatal.is_empty()
    }
}

/// Vendor compliance summary for the status payload (Lynx-D class battery:
/// 320–480 V, 0–53 °C charging window, LFP chemistry).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceReport {
    pub compliant: bool,
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
    pub features: ComplianceFeatures,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceFeatures {
    pub bms_integration: bool,
    pub vde_2510_50_compliance: bool,
    pub auto_reboot_undervoltage: bool,
}

/// Enforces the battery/grid envelope each tick, before any command goes
/// out. Recovery from the error state requires a run of consecutive green
/// ticks.
#[derive(Debug)]
pub struct SafetySupervisor {
    limits: SafetyLimits,
    battery_cfg: BatteryManagementConfig,
    recovery_green_ticks: u32,
    consecutive_green: u32,
    in_error: bool,
}

impl SafetySupervisor {
    pub fn new(
        limits: SafetyLimits,
        battery_cfg: BatteryManagementConfig,
        recovery_green_ticks: u32,
    ) -> Self {
        Self {
            limits,
            battery_cfg,
            recovery_green_ticks: recovery_green_ticks.max(1),
            consecutive_green: 0,
            in_error: false,
        }
    }

    pub fn in_error(&self) -> bool {
        self.in_error
    }

    /// Evaluate the snapshot against the envelope and update the error /
    /// recovery state machine. Returns the assessment; `in_error()` reflects
    /// the new state afterwards.
    pub fn assess(&mut self, snapshot: &Snapshot) -> SafetyAssessment {
        let assessment = self.evaluate(snapshot);

        if !assessment.is_safe() {
            for violation in &assessment.fatal {
                error!(%violation, "fatal safety envelope breach");
            }
            self.in_error = true;
            self.consecutive_green = 0;
        } else if self.in_error {
            self.consecutive_green += 1;
            if self.consecutive_green >= self.recovery_green_ticks {
                warn!(
                    green_ticks = self.consecutive_green,
                    "safety checks green, leaving error state"
                );
                self.in_error = false;
                self.consecutive_green = 0;
            }
        }

        assessment
    }

    fn evaluate(&self, snapshot: &Snapshot) -> SafetyAssessment {
        let mut assessment = SafetyAssessment::default();
        let battery = &snapshot.battery;
        let grid = &snapshot.grid;

        if let Some(temp) = battery.temperature_c {
            if temp < self.limits.battery_temp_min_c {
                assessment.fatal.push(format!(
                    "battery temperature {temp:.1}C below charging minimum {:.1}C",
                    self.limits.battery_temp_min_c
                ));
            } else if temp > self.limits.battery_temp_max_c {
                assessment.fatal.push(format!(
                    "battery temperature {temp:.1}C above maximum {:.1}C",
                    self.limits.battery_temp_max_c
                ));
            } else if temp >= self.limits.battery_temp_warning_c {
                assessment.warnings.push(format!(
                    "battery temperature {temp:.1}C approaching limit ({:.1}C warning threshold)",
                    self.limits.battery_temp_warning_c
                ));
            }
        }

        if let Some(voltage) = battery.voltage_v {
            if voltage < self.limits.battery_voltage_min_v {
                assessment.fatal.push(format!(
                    "battery voltage {voltage:.1}V below minimum {:.1}V",
                    self.limits.battery_voltage_min_v
                ));
            } else if voltage > self.limits.battery_voltage_max_v {
                assessment.fatal.push(format!(
                    "battery voltage {voltage:.1}V above maximum {:.1}V",
                    self.limits.battery_voltage_max_v
                ));
            }
        }

        if let Some(current) = battery.current_a {
            if current.abs() > self.limits.battery_current_max_a {
                assessment.fatal.push(format!(
                    "battery current {:.1}A above maximum {:.1}A",
                    current.abs(),
                    self.limits.battery_current_max_a
                ));
            }
        }

        if let Some(voltage) = grid.voltage_v {
            if voltage < self.limits.grid_voltage_min_v || voltage > self.limits.grid_voltage_max_v
            {
                assessment.fatal.push(format!(
                    "grid voltage {voltage:.1}V outside {:.0}-{:.0}V",
                    self.limits.grid_voltage_min_v, self.limits.grid_voltage_max_v
                ));
            }
        }

        if let Some(power) = grid.power_w {
            if power.abs() > self.limits.grid_power_max_w {
                assessment.fatal.push(format!(
                    "grid power {:.0}W above maximum {:.0}W",
                    power.abs(),
                    self.limits.grid_power_max_w
                ));
            }
        }

        if let Some(soc) = battery.soc_percent {
            if soc < self.limits.soc_min_percent {
                assessment.warnings.push(format!(
                    "battery SoC {soc:.1}% below configured floor {:.1}%",
                    self.limits.soc_min_percent
                ));
            }
        }

        if snapshot.has_fault() {
            assessment.fatal.push(format!(
                "inverter reports fault state (codes: {:?})",
                snapshot.inverter.error_codes
            ));
        }

        assessment
    }

    /// Human-readable incident record for a fatal breach.
    pub fn incident_record(&self, snapshot: &Snapshot, assessment: &SafetyAssessment) -> String {
        let battery = &snapshot.battery;
        let auto_reboot = self.battery_cfg.auto_reboot_undervoltage
            && battery
                .voltage_v
                .is_some_and(|v| v < self.limits.battery_voltage_min_v);
        format!(
            "EMERGENCY STOP at {}: {}; battery soc={:?}% voltage={:?}V temp={:?}C current={:?}A; \
             grid voltage={:?}V power={:?}W; vendor auto-reboot armed: {}",
            snapshot.timestamp.to_rfc3339(),
            assessment.fatal.join("; "),
            battery.soc_percent,
            battery.voltage_v,
            battery.temperature_c,
            battery.current_a,
            snapshot.grid.voltage_v,
            snapshot.grid.power_w,
            auto_reboot
        )
    }

    pub fn compliance_report(&self, snapshot: Option<&Snapshot>) -> ComplianceReport {
        let features = ComplianceFeatures {
            bms_integration: self.battery_cfg.bms_integration,
            vde_2510_50_compliance: self.battery_cfg.vde_2510_50_compliance,
            auto_reboot_undervoltage: self.battery_cfg.auto_reboot_undervoltage,
        };

        let Some(snapshot) = snapshot else {
            return ComplianceReport {
                compliant: false,
                issues: vec!["no data available".to_string()],
                warnings: Vec::new(),
                features,
            };
        };

        let mut issues = Vec::new();
        let mut warnings = Vec::new();
        let range = &self.battery_cfg.voltage_range;
        if let Some(voltage) = snapshot.battery.voltage_v {
            if voltage < range.min || voltage > range.max {
                issues.push(format!(
                    "battery voltage {voltage:.1}V outside range {:.0}-{:.0}V",
                    range.min, range.max
                ));
            }
        }
        let temps = &self.battery_cfg.temperature_thresholds;
        if let Some(temp) = snapshot.battery.temperature_c {
            if temp < temps.charging_min || temp > temps.charging_max {
                issues.push(format!(
                    "battery temperature {temp:.1}C outside charging range {:.0}-{:.0}C",
                    temps.charging_min, temps.charging_max
                ));
            }
        }
        if self.battery_cfg.battery_type != "LFP" {
            warnings.push(format!(
                "battery type {} configured; this battery class uses LFP chemistry",
                self.battery_cfg.battery_type
            ));
        }

        ComplianceReport {
            compliant: issues.is_empty(),
            issues,
            warnings,
            features,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EmergencyStopConfig, SocThresholds};
    use crate::domain::{
        BatterySample, ConsumptionSample, GridSample, InverterInfo, PvSample,
    };
    use chrono::Utc;

    fn supervisor() -> SafetySupervisor {
        let limits = SafetyLimits::from_config(
            &EmergencyStopConfig::default(),
            &SocThresholds::default(),
        );
        let battery_cfg = BatteryManagementConfig {
            capacity_kwh: 20.0,
            battery_type: "LFP".to_string(),
            charge_rate_kw: 5.0,
            voltage_range: Default::default(),
            temperature_thresholds: Default::default(),
            soc_thresholds: Default::default(),
            bms_integration: true,
            vde_2510_50_compliance: true,
            auto_reboot_undervoltage: true,
        };
        SafetySupervisor::new(limits, battery_cfg, 3)
    }

    fn snapshot(voltage: f64, temp: f64) -> Snapshot {
        Snapshot {
            timestamp: Utc::now(),
            battery: BatterySample {
                soc_percent: Some(60.0),
                voltage_v: Some(voltage),
                current_a: Some(-5.0),
                power_w: Some(-2000.0),
                temperature_c: Some(temp),
                charging: true,
            },
            pv: PvSample::default(),
            grid: GridSample {
                voltage_v: Some(230.0),
                power_w: Some(2000.0),
                ..GridSample::default()
            },
            consumption: ConsumptionSample::default(),
            inverter: InverterInfo::default(),
        }
    }

    #[test]
    fn clean_snapshot_is_safe() {
        let mut supervisor = supervisor();
        let assessment = supervisor.assess(&snapshot(400.0, 25.0));
        assert!(assessment.is_safe());
        assert!(assessment.warnings.is_empty());
        assert!(!supervisor.in_error());
    }

    #[test]
    fn voltage_breach_is_fatal_and_enters_error() {
        let mut supervisor = supervisor();
        let assessment = supervisor.assess(&snapshot(300.0, 25.0));
        assert!(!assessment.is_safe());
        assert!(supervisor.in_error());
    }

    #[test]
    fn warning_zone_temperature_is_not_fatal() {
        let mut supervisor = supervisor();
        let assessment = supervisor.assess(&snapshot(400.0, 51.0));
        assert!(assessment.is_safe());
        assert_eq!(assessment.warnings.len(), 1);
    }

    #[test]
    fn recovery_needs_consecutive_green_ticks() {
        let mut supervisor = supervisor();
        supervisor.assess(&snapshot(300.0, 25.0));
        assert!(supervisor.in_error());

        supervisor.assess(&snapshot(400.0, 25.0));
        supervisor.assess(&snapshot(400.0, 25.0));
        assert!(supervisor.in_error(), "two green ticks are not enough");
        supervisor.assess(&snapshot(400.0, 25.0));
        assert!(!supervisor.in_error(), "third green tick recovers");
    }

    #[test]
    fn breach_resets_the_green_streak() {
        let mut supervisor = supervisor();
        supervisor.assess(&snapshot(300.0, 25.0));
        supervisor.assess(&snapshot(400.0, 25.0));
        supervisor.assess(&snapshot(400.0, 25.0));
        supervisor.assess(&snapshot(300.0, 25.0)); // breach again
        supervisor.assess(&snapshot(400.0, 25.0));
        supervisor.assess(&snapshot(400.0, 25.0));
        assert!(supervisor.in_error());
    }

    #[test]
    fn incident_record_names_the_breach() {
        let mut supervisor = supervisor();
        let snap = snapshot(300.0, 25.0);
        let assessment = supervisor.assess(&snap);
        let record = supervisor.incident_record(&snap, &assessment);
        assert!(record.contains("EMERGENCY STOP"));
        assert!(record.contains("battery voltage"));
        assert!(record.contains("auto-reboot armed: true"));
    }

    #[test]
    fn compliance_report_flags_out_of_range_battery() {
        let supervisor = supervisor();
        let report = supervisor.compliance_report(Some(&snapshot(500.0, 25.0)));
        assert!(!report.compliant);
        assert_eq!(report.issues.len(), 1);
        assert!(report.features.bms_integration);
    }

    #[test]
    fn compliance_without_data_is_not_compliant() {
        let supervisor = supervisor();
        let report = supervisor.compliance_report(None);
        assert!(!report.compliant);
    }
}
