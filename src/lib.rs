//! Day-ahead, half-hourly demand forecasts for household clusters.
//!
//! Raw readings are aligned to a canonical local clock ([`align`]), summed
//! per cluster ([`aggregate`]), joined with weather and calendar regressors
//! ([`forecast::features`]) and modelled as a regression with seasonal ARIMA
//! errors ([`model`]). [`pipeline`] runs one target date end to end.

pub mod aggregate;
pub mod align;
pub mod config;
pub mod domain;
pub mod error;
pub mod evaluate;
pub mod forecast;
pub mod io;
pub mod model;
pub mod pipeline;
pub mod profiles;
pub mod repo;
pub mod telemetry;

pub use error::{PipelineError, Result, StoreError};
