pub mod engine;
pub mod features;
pub mod metrics;
pub mod weather;

pub use engine::Forecaster;
pub use features::{ExogMatrix, ExogSignal, FeatureAssembler, FeatureSet};
pub use metrics::{ForecastMetrics, ForecastMetricsError};
pub use weather::{CalendarDay, CalendarTable, WeatherDay, WeatherTable};
