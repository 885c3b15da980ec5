pub mod tariff;
pub mod windows;

pub use tariff::Tariff;
pub use windows::{PriceAnalyzer, PriceStats, PriceTrend, Volatility};
