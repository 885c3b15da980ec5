use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionKind {
    Charging,
    Selling,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionStatus {
    Planned,
    Active,
    Completed,
    Aborted,
}

/// A charging or selling session. At most one session of each kind is active
/// per site; the coordinator enforces that before creating a new one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub kind: SessionKind,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub planned_energy_kwh: f64,
    pub delivered_energy_kwh: f64,
    pub planned_cost_pln: f64,
    pub realized_cost_pln: f64,
    pub status: SessionStatus,
    pub abort_reason: Option<String>,
}

impl Session {
    pub fn begin(kind: SessionKind, now: DateTime<Utc>, planned_energy_kwh: f64, planned_cost_pln: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            started_at: now,
            ended_at: None,
            planned_energy_kwh,
            delivered_energy_kwh: 0.0,
            planned_cost_pln,
            realized_cost_pln: 0.0,
            status: SessionStatus::Active,
            abort_reason: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.status = SessionStatus::Completed;
        self.ended_at = Some(now);
    }

    pub fn abort(&mut self, now: DateTime<Utc>, reason: impl Into<String>) {
        self.status = SessionStatus::Aborted;
        self.ended_at = Some(now);
        self.abort_reason = Some(reason.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_lifecycle() {
        let now = Utc::now();
        let mut s = Session::begin(SessionKind::Charging, now, 5.0, 2.5);
        assert!(s.is_active());
        assert!(s.ended_at.is_none());

        s.complete(now + chrono::Duration::hours(2));
        assert_eq!(s.status, SessionStatus::Completed);
        assert!(s.ended_at.is_some());
    }

    #[test]
    fn abort_records_reason() {
        let now = Utc::now();
        let mut s = Session::begin(SessionKind::Selling, now, 3.0, 0.0);
        s.abort(now, "consumption spike");
        assert_eq!(s.status, SessionStatus::Aborted);
        assert_eq!(s.abort_reason.as_deref(), Some("consumption spike"));
    }
}
