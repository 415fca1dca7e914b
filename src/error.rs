//! Error taxonomy for the forecasting pipeline.
//!
//! Every per-cluster failure is expressed as a [`PipelineError`] so the
//! orchestrator can record it against the cluster and carry on with the rest
//! of the batch.

use thiserror::Error;

use crate::domain::ClusterId;

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PipelineError {
    /// Unusable or missing input for a household (or for a whole cluster).
    #[error("data quality error for {subject}: {reason}")]
    DataQuality { subject: String, reason: String },

    /// Empty cluster, conflicting assignment, inconsistent regressor schema.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// History below the absolute floor the model can be estimated from.
    #[error("insufficient history for cluster {cluster_id}: need {needed_days} days, have {available_days}")]
    InsufficientHistory {
        cluster_id: ClusterId,
        needed_days: usize,
        available_days: usize,
    },

    /// Estimation did not converge inside its iteration or time budget.
    #[error("fit did not converge for cluster {cluster_id}: {reason}")]
    FitConvergence { cluster_id: ClusterId, reason: String },

    /// A fitted model could not be applied (e.g. regressor shape mismatch).
    #[error("forecast error for cluster {cluster_id}: {reason}")]
    Forecast { cluster_id: ClusterId, reason: String },

    /// Persisted model store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PipelineError {
    pub fn data_quality(subject: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DataQuality {
            subject: subject.into(),
            reason: reason.into(),
        }
    }

    pub fn forecast(cluster_id: &ClusterId, reason: impl Into<String>) -> Self {
        Self::Forecast {
            cluster_id: cluster_id.clone(),
            reason: reason.into(),
        }
    }

    pub fn convergence(cluster_id: &ClusterId, reason: impl Into<String>) -> Self {
        Self::FitConvergence {
            cluster_id: cluster_id.clone(),
            reason: reason.into(),
        }
    }

    /// Short machine-readable kind, used in run summaries and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DataQuality { .. } => "data_quality",
            Self::Configuration(_) => "configuration",
            Self::InsufficientHistory { .. } => "insufficient_history",
            Self::FitConvergence { .. } => "fit_convergence",
            Self::Forecast { .. } => "forecast",
            Self::Store(_) => "store",
        }
    }
}

/// Errors raised by a [`crate::repo::ModelStore`] backend.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("no model stored for cluster {0}")]
    NotFound(ClusterId),

    #[error("model record for cluster {cluster_id} is corrupt: {reason}")]
    Corrupt { cluster_id: ClusterId, reason: String },

    #[error("model store io error: {0}")]
    Io(String),
}
