//! Bounded order search: fit each candidate, keep the lowest AIC.

use std::time::Instant;

use tracing::debug;

use super::sarima::{self, FitOptions, SarimaError, SarimaFit};
use crate::config::CandidateOrder;

#[derive(Debug, Clone)]
pub struct Selection {
    pub candidate: CandidateOrder,
    pub fit: SarimaFit,
    pub evaluated: usize,
}

/// Try at most `max_candidates` orders within the shared deadline in `opts`.
///
/// Candidates that fail are skipped; the last failure is returned when none fits.
pub fn select_order(
    y: &[f64],
    exog: Option<&[Vec<f64>]>,
    candidates: &[CandidateOrder],
    max_candidates: usize,
    opts: &FitOptions,
) -> Result<Selection, SarimaError> {
    let mut best: Option<(CandidateOrder, SarimaFit)> = None;
    let mut last_err = None;
    let mut evaluated = 0;

    for candidate in candidates.iter().take(max_candidates) {
        if opts.deadline.is_some_and(|d| Instant::now() >= d) {
            last_err.get_or_insert(SarimaError::TimedOut { iterations: 0 });
            break;
        }
        evaluated += 1;
        match sarima::fit(y, exog, &candidate.order, &candidate.seasonal_order, opts) {
            Ok(fit) => {
                debug!(order = ?candidate.order, seasonal = ?candidate.seasonal_order, aic = fit.aic, "candidate fitted");
                if best.as_ref().map_or(true, |(_, b)| fit.aic < b.aic) {
                    best = Some((*candidate, fit));
                }
            }
            Err(e) => {
                debug!(order = ?candidate.order, seasonal = ?candidate.seasonal_order, error = %e, "candidate rejected");
                last_err = Some(e);
            }
        }
    }

    match best {
        Some((candidate, fit)) => Ok(Selection {
            candidate,
            fit,
            evaluated,
        }),
        None => Err(last_err.unwrap_or(SarimaError::InsufficientData { needed: 1, got: 0 })),
    }
}
