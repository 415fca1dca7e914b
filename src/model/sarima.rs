//! Regression with multiplicative seasonal ARIMA errors.
//!
//! Estimation is two-step: ordinary least squares on the regressors, then
//! conditional sum of squares (CSS) on the regression residuals, minimised
//! with a bounded Nelder-Mead search. Forecasts re-filter the supplied
//! history with the stored parameters, so identical inputs always produce
//! identical outputs.

use std::time::Instant;

use thiserror::Error;

use super::optimization::{nelder_mead, NelderMeadConfig, Termination};
use super::stats::{mean, ols_fit, OlsFit};
use crate::domain::{ArimaOrder, FittedParams, RegressionParams, SeasonalOrder};

/// Effective residuals the CSS objective needs beyond the lag burn-in.
const MIN_EFFECTIVE_OBS: usize = 48;

/// Bound on every AR/MA coefficient during estimation.
const COEF_BOUND: f64 = 0.98;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SarimaError {
    #[error("insufficient data: need at least {needed} observations, got {got}")]
    InsufficientData { needed: usize, got: usize },

    #[error("regressor error: {0}")]
    Regressors(String),

    #[error("optimizer hit its iteration limit ({iterations}) before converging")]
    NotConverged { iterations: usize },

    #[error("fit exceeded its time budget after {iterations} iterations")]
    TimedOut { iterations: usize },

    #[error("non-finite value: {0}")]
    NonFinite(String),
}

#[derive(Debug, Clone)]
pub struct FitOptions {
    pub max_iterations: usize,
    pub tolerance: f64,
    pub deadline: Option<Instant>,
}

#[derive(Debug, Clone)]
pub struct SarimaFit {
    pub params: FittedParams,
    pub aic: f64,
    pub iterations: usize,
    pub effective_obs: usize,
}

/// Point forecasts and their one-sigma standard errors per horizon step.
#[derive(Debug, Clone, PartialEq)]
pub struct SarimaForecast {
    pub mean: Vec<f64>,
    pub std_err: Vec<f64>,
}

/// (P, D, Q, s) with zeros when the seasonal part is switched off.
fn seasonal_terms(seasonal: &SeasonalOrder) -> (usize, usize, usize, usize) {
    if seasonal.is_active() {
        (seasonal.p, seasonal.d, seasonal.q, seasonal.period)
    } else {
        (0, 0, 0, 0)
    }
}

/// Lags of the differencing operators in application order.
pub fn differencing_lags(order: &ArimaOrder, seasonal: &SeasonalOrder) -> Vec<usize> {
    let (_, sd, _, s) = seasonal_terms(seasonal);
    let mut lags = vec![1; order.d];
    lags.extend(std::iter::repeat(s).take(sd));
    lags
}

/// Shortest history (in observations) a model of this order can be estimated from.
pub fn min_observations(order: &ArimaOrder, seasonal: &SeasonalOrder) -> usize {
    let (sp, sd, _, s) = seasonal_terms(seasonal);
    order.d + s * sd + order.p + s * sp + MIN_EFFECTIVE_OBS
}

/// `y[t] - y[t - lag]`
pub fn difference(series: &[f64], lag: usize) -> Vec<f64> {
    if lag == 0 || series.len() <= lag {
        return Vec::new();
    }
    series[lag..]
        .iter()
        .zip(series)
        .map(|(curr, prev)| curr - prev)
        .collect()
}

fn poly_mul(a: &[f64], b: &[f64]) -> Vec<f64> {
    let mut out = vec![0.0; a.len() + b.len() - 1];
    for (i, x) in a.iter().enumerate() {
        if *x == 0.0 {
            continue;
        }
        for (j, y) in b.iter().enumerate() {
            out[i + j] += x * y;
        }
    }
    out
}

/// `1 + sign * (c_1 B^step + c_2 B^{2 step} + ...)`
fn lag_poly(coefs: &[f64], step: usize, sign: f64) -> Vec<f64> {
    let mut poly = vec![0.0; coefs.len() * step + 1];
    poly[0] = 1.0;
    for (i, c) in coefs.iter().enumerate() {
        poly[(i + 1) * step] = sign * c;
    }
    poly
}

/// Expanded AR operator φ(B)Φ(B^s) in `1 - Σ a_k B^k` form.
fn ar_operator(ar: &[f64], sar: &[f64], s: usize) -> Vec<f64> {
    poly_mul(&lag_poly(ar, 1, -1.0), &lag_poly(sar, s.max(1), -1.0))
}

/// Expanded MA operator θ(B)Θ(B^s) in `1 + Σ b_k B^k` form.
fn ma_operator(ma: &[f64], sma: &[f64], s: usize) -> Vec<f64> {
    poly_mul(&lag_poly(ma, 1, 1.0), &lag_poly(sma, s.max(1), 1.0))
}

/// Non-zero recursion terms `(lag, coefficient)` of an operator polynomial.
fn recursion_terms(poly: &[f64], sign: f64) -> Vec<(usize, f64)> {
    poly.iter()
        .enumerate()
        .skip(1)
        .filter(|(_, c)| **c != 0.0)
        .map(|(k, c)| (k, sign * c))
        .collect()
}

struct Operators {
    ar: Vec<(usize, f64)>,
    ma: Vec<(usize, f64)>,
    /// First index with a full AR history
    burn_in: usize,
}

impl Operators {
    fn new(ar: &[f64], ma: &[f64], sar: &[f64], sma: &[f64], s: usize) -> Self {
        let ar_poly = ar_operator(ar, sar, s);
        let burn_in = ar.len() + sar.len() * s;
        Self {
            ar: recursion_terms(&ar_poly, -1.0),
            ma: recursion_terms(&ma_operator(ma, sma, s), 1.0),
            burn_in,
        }
    }

    fn from_params(params: &FittedParams, s: usize) -> Self {
        Self::new(&params.ar, &params.ma, &params.seasonal_ar, &params.seasonal_ma, s)
    }

    /// One-step innovations; zero before the burn-in.
    fn residuals(&self, w: &[f64]) -> Vec<f64> {
        let mut e = vec![0.0; w.len()];
        for t in self.burn_in..w.len() {
            let mut v = w[t];
            for &(k, a) in &self.ar {
                v -= a * w[t - k];
            }
            for &(k, b) in &self.ma {
                if t >= k {
                    v -= b * e[t - k];
                }
            }
            e[t] = v;
        }
        e
    }

    fn css(&self, w: &[f64]) -> f64 {
        let e = self.residuals(w);
        let css: f64 = e[self.burn_in..].iter().map(|v| v * v).sum();
        if css.is_finite() {
            css
        } else {
            f64::INFINITY
        }
    }
}

struct ParamLayout {
    p: usize,
    q: usize,
    sp: usize,
    sq: usize,
    s: usize,
}

impl ParamLayout {
    fn new(order: &ArimaOrder, seasonal: &SeasonalOrder) -> Self {
        let (sp, _, sq, s) = seasonal_terms(seasonal);
        Self {
            p: order.p,
            q: order.q,
            sp,
            sq,
            s,
        }
    }

    fn len(&self) -> usize {
        self.p + self.q + self.sp + self.sq
    }

    /// Split a flat parameter vector into (ar, ma, seasonal ar, seasonal ma).
    fn split<'a>(&self, theta: &'a [f64]) -> (&'a [f64], &'a [f64], &'a [f64], &'a [f64]) {
        let (ar, rest) = theta.split_at(self.p);
        let (ma, rest) = rest.split_at(self.q);
        let (sar, sma) = rest.split_at(self.sp);
        (ar, ma, sar, sma)
    }

    fn operators(&self, theta: &[f64]) -> Operators {
        let (ar, ma, sar, sma) = self.split(theta);
        Operators::new(ar, ma, sar, sma, self.s)
    }

    fn initial_guess(&self, w: &[f64]) -> Vec<f64> {
        let mut theta = vec![0.0; self.len()];
        if self.p > 0 {
            theta[0] = 0.5 * autocorrelation(w, 1);
        }
        if self.sp > 0 {
            theta[self.p + self.q] = 0.5 * autocorrelation(w, self.s);
        }
        theta
    }
}

fn autocorrelation(w: &[f64], lag: usize) -> f64 {
    if lag == 0 || w.len() <= lag {
        return 0.0;
    }
    let denom: f64 = w.iter().map(|v| v * v).sum();
    if denom <= 0.0 {
        return 0.0;
    }
    let num: f64 = w[lag..].iter().zip(w).map(|(a, b)| a * b).sum();
    (num / denom).clamp(-0.9, 0.9)
}

fn check_regressors(rows: &[Vec<f64>], expected_rows: usize, width: usize) -> Result<(), SarimaError> {
    if rows.len() != expected_rows {
        return Err(SarimaError::Regressors(format!(
            "expected {expected_rows} regressor rows, got {}",
            rows.len()
        )));
    }
    if let Some(bad) = rows.iter().find(|r| r.len() != width) {
        return Err(SarimaError::Regressors(format!(
            "expected {width} regressor columns, got {}",
            bad.len()
        )));
    }
    if rows.iter().flatten().any(|v| !v.is_finite()) {
        return Err(SarimaError::Regressors("non-finite regressor value".to_string()));
    }
    Ok(())
}

/// Estimate a regression with SARIMA errors on `y`.
pub fn fit(
    y: &[f64],
    exog: Option<&[Vec<f64>]>,
    order: &ArimaOrder,
    seasonal: &SeasonalOrder,
    opts: &FitOptions,
) -> Result<SarimaFit, SarimaError> {
    let needed = min_observations(order, seasonal);
    if y.len() < needed {
        return Err(SarimaError::InsufficientData {
            needed,
            got: y.len(),
        });
    }
    if y.iter().any(|v| !v.is_finite()) {
        return Err(SarimaError::NonFinite("series contains NaN or infinity".to_string()));
    }

    let (regression, resid) = match exog {
        Some(rows) if !rows.is_empty() => {
            let width = rows[0].len();
            check_regressors(rows, y.len(), width)?;
            let ols = ols_fit(y, rows).ok_or_else(|| {
                SarimaError::Regressors("normal equations are singular".to_string())
            })?;
            let resid = y
                .iter()
                .zip(rows)
                .map(|(v, r)| v - ols.predict_row(r))
                .collect::<Vec<_>>();
            (
                Some(RegressionParams {
                    intercept: ols.intercept,
                    coefficients: ols.coefficients,
                }),
                resid,
            )
        }
        _ => (None, y.to_vec()),
    };

    let lags = differencing_lags(order, seasonal);
    let w = lags.iter().fold(resid, |acc, &lag| difference(&acc, lag));
    let intercept = if lags.is_empty() { mean(&w) } else { 0.0 };
    let centered: Vec<f64> = w.iter().map(|v| v - intercept).collect();

    let layout = ParamLayout::new(order, seasonal);
    let burn_in = layout.p + layout.sp * layout.s;
    let effective_obs = centered.len().saturating_sub(burn_in);
    if effective_obs == 0 {
        return Err(SarimaError::InsufficientData {
            needed,
            got: y.len(),
        });
    }

    let objective = |theta: &[f64]| {
        let css = layout.operators(theta).css(&centered);
        (css / effective_obs as f64).max(f64::MIN_POSITIVE).ln()
    };

    let (theta, iterations) = if layout.len() == 0 {
        (Vec::new(), 0)
    } else {
        let bounds = vec![(-COEF_BOUND, COEF_BOUND); layout.len()];
        let result = nelder_mead(
            objective,
            &layout.initial_guess(&centered),
            &bounds,
            &NelderMeadConfig {
                max_iter: opts.max_iterations,
                tolerance: opts.tolerance,
                deadline: opts.deadline,
                ..Default::default()
            },
        );
        match result.termination {
            Termination::Converged => {}
            Termination::MaxIterations => {
                return Err(SarimaError::NotConverged {
                    iterations: result.iterations,
                })
            }
            Termination::Deadline => {
                return Err(SarimaError::TimedOut {
                    iterations: result.iterations,
                })
            }
        }
        (result.optimal_point, result.iterations)
    };

    let sigma2 = layout.operators(&theta).css(&centered) / effective_obs as f64;
    if !sigma2.is_finite() {
        return Err(SarimaError::NonFinite("residual variance".to_string()));
    }

    let n_params = layout.len()
        + 1
        + regression
            .as_ref()
            .map_or(0, |r| r.coefficients.len() + 1);
    let aic = effective_obs as f64 * sigma2.max(f64::MIN_POSITIVE).ln() + 2.0 * n_params as f64;

    let (ar, ma, sar, sma) = layout.split(&theta);
    Ok(SarimaFit {
        params: FittedParams {
            intercept,
            ar: ar.to_vec(),
            ma: ma.to_vec(),
            seasonal_ar: sar.to_vec(),
            seasonal_ma: sma.to_vec(),
            regression,
            sigma2,
        },
        aic,
        iterations,
        effective_obs,
    })
}

/// Forecast `horizon` steps past the end of `y` with fixed parameters.
pub fn forecast(
    params: &FittedParams,
    order: &ArimaOrder,
    seasonal: &SeasonalOrder,
    y: &[f64],
    exog_history: Option<&[Vec<f64>]>,
    exog_future: Option<&[Vec<f64>]>,
    horizon: usize,
) -> Result<SarimaForecast, SarimaError> {
    let needed = min_observations(order, seasonal);
    if y.len() < needed {
        return Err(SarimaError::InsufficientData {
            needed,
            got: y.len(),
        });
    }

    let (resid, future_reg) = match &params.regression {
        Some(reg) => {
            let (Some(hist), Some(fut)) = (exog_history, exog_future) else {
                return Err(SarimaError::Regressors(
                    "model was fit with regressors but none were supplied".to_string(),
                ));
            };
            let width = reg.coefficients.len();
            check_regressors(hist, y.len(), width)?;
            check_regressors(fut, horizon, width)?;
            let ols = OlsFit {
                intercept: reg.intercept,
                coefficients: reg.coefficients.clone(),
            };
            let resid = y
                .iter()
                .zip(hist)
                .map(|(v, r)| v - ols.predict_row(r))
                .collect::<Vec<_>>();
            (resid, fut.iter().map(|r| ols.predict_row(r)).collect::<Vec<_>>())
        }
        None => (y.to_vec(), vec![0.0; horizon]),
    };

    let lags = differencing_lags(order, seasonal);
    let mut levels = vec![resid];
    for &lag in &lags {
        let next = difference(&levels[levels.len() - 1], lag);
        levels.push(next);
    }
    let c = params.intercept;
    let centered: Vec<f64> = levels[levels.len() - 1].iter().map(|v| v - c).collect();

    let (_, _, _, s) = seasonal_terms(seasonal);
    let ops = Operators::from_params(params, s);
    let mut ext = centered;
    let mut innovations = ops.residuals(&ext);
    let n = ext.len();
    for _ in 0..horizon {
        let t = ext.len();
        let mut v = 0.0;
        for &(k, a) in &ops.ar {
            v += a * ext[t - k];
        }
        for &(k, b) in &ops.ma {
            if t >= k {
                v += b * innovations[t - k];
            }
        }
        ext.push(v);
        innovations.push(0.0);
    }
    let mut future: Vec<f64> = ext[n..].iter().map(|v| v + c).collect();

    for (i, &lag) in lags.iter().enumerate().rev() {
        let mut hist = levels[i].clone();
        for v in future.iter_mut() {
            let x = *v + hist[hist.len() - lag];
            hist.push(x);
            *v = x;
        }
    }

    let mean: Vec<f64> = future.iter().zip(&future_reg).map(|(a, b)| a + b).collect();
    if mean.iter().any(|v| !v.is_finite()) {
        return Err(SarimaError::NonFinite("forecast".to_string()));
    }

    let psi = psi_weights(params, s, &lags, horizon);
    let mut acc = 0.0;
    let std_err = psi
        .iter()
        .map(|w| {
            acc += w * w;
            (params.sigma2 * acc).sqrt()
        })
        .collect();

    Ok(SarimaForecast { mean, std_err })
}

/// MA(∞) weights of the full integrated model, ψ_0 = 1.
fn psi_weights(params: &FittedParams, s: usize, lags: &[usize], horizon: usize) -> Vec<f64> {
    let mut ar_poly = ar_operator(&params.ar, &params.seasonal_ar, s);
    for &lag in lags {
        ar_poly = poly_mul(&ar_poly, &lag_poly(&[1.0], lag, -1.0));
    }
    let phi: Vec<f64> = ar_poly.iter().map(|c| -c).collect();
    let theta = ma_operator(&params.ma, &params.seasonal_ma, s);

    let mut psi = vec![0.0; horizon];
    for j in 0..horizon {
        if j == 0 {
            psi[0] = 1.0;
            continue;
        }
        let mut v = theta.get(j).copied().unwrap_or(0.0);
        for k in 1..=j.min(phi.len().saturating_sub(1)) {
            v += phi[k] * psi[j - k];
        }
        psi[j] = v;
    }
    psi
}
