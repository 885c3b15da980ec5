pub mod decision;
pub mod prices;
pub mod session;
pub mod snapshot;
pub mod state;

pub use decision::{ChargingAction, Decision, DecisionPriority, ScoreBreakdown};
pub use prices::{PeakLabel, PriceBand, PricePoint, PriceWindow, PvForecastPoint};
pub use session::{Session, SessionKind, SessionStatus};
pub use snapshot::{
    BatterySample, ConsumptionSample, GridSample, InverterInfo, InverterState, PvSample, Snapshot,
};
pub use state::{CoordinatorPhase, CoordinatorState};
