use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Inverter-facing action chosen by the decision or selling engine.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
    strum_macros::Display, strum_macros::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ChargingAction {
    ChargeGrid,
    ChargePv,
    ChargeHybrid,
    Wait,
    Discharge,
    Stop,
}

impl ChargingAction {
    pub fn starts_charge(self) -> bool {
        matches!(
            self,
            ChargingAction::ChargeGrid | ChargingAction::ChargePv | ChargingAction::ChargeHybrid
        )
    }

    pub fn draws_from_grid(self) -> bool {
        matches!(self, ChargingAction::ChargeGrid | ChargingAction::ChargeHybrid)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    strum_macros::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DecisionPriority {
    Low,
    Medium,
    High,
    Critical,
}

/// Per-factor scores from the legacy weighted engine, kept on every decision
/// for audit even when the timing-aware engine made the call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub price: f64,
    pub battery: f64,
    pub pv: f64,
    pub consumption: f64,
    pub total: f64,
}

impl ScoreBreakdown {
    /// Population variance across the four factor scores. Low variance means
    /// the signals agree, which feeds the confidence estimate.
    pub fn variance(&self) -> f64 {
        let scores = [self.price, self.battery, self.pv, self.consumption];
        let mean = scores.iter().sum::<f64>() / scores.len() as f64;
        scores.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / scores.len() as f64
    }
}

/// A single control decision, persisted for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub timestamp: DateTime<Utc>,
    pub action: ChargingAction,
    pub target_soc_percent: f64,
    pub power_w: f64,
    pub duration_hours: f64,
    pub energy_kwh: f64,
    pub estimated_cost_pln: f64,
    pub estimated_savings_pln: f64,
    pub priority: DecisionPriority,
    /// 0.0..=1.0
    pub confidence: f64,
    pub reason: String,
    pub scores: ScoreBreakdown,
    /// Non-fatal safety warnings attached by the supervisor.
    #[serde(default)]
    pub safety_warnings: Vec<String>,
}

impl Decision {
    pub fn wait(timestamp: DateTime<Utc>, reason: impl Into<String>) -> Self {
        Self {
            timestamp,
            action: ChargingAction::Wait,
            target_soc_percent: 0.0,
            power_w: 0.0,
            duration_hours: 0.0,
            energy_kwh: 0.0,
            estimated_cost_pln: 0.0,
            estimated_savings_pln: 0.0,
            priority: DecisionPriority::Low,
            confidence: 0.5,
            reason: reason.into(),
            scores: ScoreBreakdown::default(),
            safety_warnings: Vec::new(),
        }
    }

    /// `action != wait` implies a concrete plan was sized.
    pub fn is_well_formed(&self) -> bool {
        match self.action {
            ChargingAction::Wait | ChargingAction::Stop => true,
            _ => self.duration_hours > 0.0 && self.energy_kwh > 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering() {
        assert!(DecisionPriority::Critical > DecisionPriority::High);
        assert!(DecisionPriority::High > DecisionPriority::Medium);
        assert!(DecisionPriority::Medium > DecisionPriority::Low);
    }

    #[test]
    fn variance_is_zero_for_equal_scores() {
        let scores = ScoreBreakdown {
            price: 60.0,
            battery: 60.0,
            pv: 60.0,
            consumption: 60.0,
            total: 60.0,
        };
        assert_eq!(scores.variance(), 0.0);
    }

    #[test]
    fn wait_decisions_are_well_formed_without_energy() {
        let d = Decision::wait(Utc::now(), "cooldown");
        assert!(d.is_well_formed());
        assert_eq!(d.action, ChargingAction::Wait);
    }

    #[test]
    fn action_serializes_snake_case() {
        let json = serde_json::to_string(&ChargingAction::ChargeHybrid).unwrap();
        assert_eq!(json, r#""charge_hybrid""#);
    }
}
