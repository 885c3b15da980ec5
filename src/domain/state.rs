use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Coordinator lifecycle phase.
///
/// initializing → monitoring; monitoring ↔ charging/selling under coordinator
/// control; any phase → error on a fatal safety violation; error → monitoring
/// once checks stay green for the configured number of ticks.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
    strum_macros::Display, strum_macros::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CoordinatorPhase {
    Initializing,
    Monitoring,
    Charging,
    Selling,
    Optimizing,
    Error,
    Maintenance,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorState {
    pub phase: CoordinatorPhase,
    pub since: DateTime<Utc>,
    pub last_tick: DateTime<Utc>,
    pub last_decision_at: Option<DateTime<Utc>>,
    pub wait_cooldown_until: Option<DateTime<Utc>>,
}

impl CoordinatorState {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            phase: CoordinatorPhase::Initializing,
            since: now,
            last_tick: now,
            last_decision_at: None,
            wait_cooldown_until: None,
        }
    }

    pub fn transition(&mut self, phase: CoordinatorPhase, now: DateTime<Utc>) {
        if self.phase != phase {
            self.phase = phase;
            self.since = now;
        }
    }

    pub fn cooldown_active(&self, now: DateTime<Utc>) -> bool {
        self.wait_cooldown_until.is_some_and(|until| now < until)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_updates_since_only_on_change() {
        let t0 = Utc::now();
        let mut state = CoordinatorState::new(t0);
        let t1 = t0 + chrono::Duration::seconds(30);

        state.transition(CoordinatorPhase::Monitoring, t1);
        assert_eq!(state.since, t1);

        let t2 = t1 + chrono::Duration::seconds(30);
        state.transition(CoordinatorPhase::Monitoring, t2);
        assert_eq!(state.since, t1, "re-entering the same phase keeps since");
    }

    #[test]
    fn cooldown_window() {
        let now = Utc::now();
        let mut state = CoordinatorState::new(now);
        assert!(!state.cooldown_active(now));

        state.wait_cooldown_until = Some(now + chrono::Duration::minutes(15));
        assert!(state.cooldown_active(now + chrono::Duration::minutes(14)));
        assert!(!state.cooldown_active(now + chrono::Duration::minutes(16)));
    }
}
