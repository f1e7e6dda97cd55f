use std::time::{Duration, Instant};

use ndarray::{Array2, ArrayView2, ArrayView3, Axis};
use tracing::debug;

use domux_core::types::RewardKind;
use domux_core::{ControllerConfig, EstimationError, EstimationFailure, ModelError};

use crate::model::{with_mode, Criterion, EvalMode, HostModel};
use crate::types::Batch;

/// Reduces one forward pass (output distribution + target mask) to a scalar.
pub type TrialMetric =
    fn(ArrayView3<'_, f64>, ArrayView2<'_, bool>) -> Result<f64, EstimationError>;

/// Static dispatch table for the Monte Carlo metrics; `None` for `CriterionLoss`,
/// which goes through the host criterion instead.
pub fn trial_metric(kind: RewardKind) -> Option<TrialMetric> {
    let metric: TrialMetric = match kind {
        RewardKind::TokenEntropy | RewardKind::EosEntropy => metrics::masked_entropy,
        RewardKind::ConfidenceDeficit => metrics::confidence_deficit,
        RewardKind::NormalizedConfidenceDeficit => metrics::normalized_confidence_deficit,
        RewardKind::ConfidenceVariance => metrics::confidence_variance,
        RewardKind::Composite => metrics::composite,
        RewardKind::CriterionLoss => return None,
    };
    Some(metric)
}

/// Scores how uncertain the host model currently is on a domain's probe batch.
#[derive(Debug, Clone)]
pub struct RewardEstimator {
    kind: RewardKind,
    trials: usize,
    transient_retries: u32,
    trial_budget: Option<Duration>,
}

impl RewardEstimator {
    pub fn new(kind: RewardKind, trials: usize) -> Self {
        Self {
            kind,
            trials: trials.max(1),
            transient_retries: 0,
            trial_budget: None,
        }
    }

    pub fn from_config(cfg: &ControllerConfig) -> Self {
        Self::new(cfg.reward_type, cfg.k)
            .with_transient_retries(cfg.transient_retries)
            .with_trial_budget(cfg.reward_trial_budget_ms.map(Duration::from_millis))
    }

    pub fn with_transient_retries(mut self, retries: u32) -> Self {
        self.transient_retries = retries;
        self
    }

    pub fn with_trial_budget(mut self, budget: Option<Duration>) -> Self {
        self.trial_budget = budget;
        self
    }

    pub fn kind(&self) -> RewardKind {
        self.kind
    }

    pub fn estimate<M: HostModel>(
        &self,
        domain: &str,
        probe: &Batch,
        model: &mut M,
        criterion: &dyn Criterion<M>,
    ) -> Result<f64, EstimationFailure> {
        let result = match trial_metric(self.kind) {
            Some(metric) => self.monte_carlo(metric, probe, model),
            None => self.criterion_loss(probe, model, criterion),
        };
        let reward = result.and_then(|r| {
            if r.is_finite() {
                Ok(r)
            } else {
                Err(EstimationError::NonFinite(r))
            }
        });
        reward.map_err(|cause| EstimationFailure {
            domain: domain.to_string(),
            metric: self.kind,
            cause,
        })
    }

    fn monte_carlo<M: HostModel>(
        &self,
        metric: TrialMetric,
        probe: &Batch,
        model: &mut M,
    ) -> Result<f64, EstimationError> {
        let mask: Array2<bool> = match self.kind {
            RewardKind::EosEntropy => probe.eos_mask(),
            _ => probe.target_mask(),
        };
        if !mask.iter().any(|&m| m) {
            return Err(EstimationError::DegenerateMask);
        }
        let log_space = self.kind.log_space();
        let started = Instant::now();

        with_mode(model, EvalMode::Stochastic, |model| {
            let mut total = 0.0;
            for trial in 0..self.trials {
                let output = self.retry_transient(|| model.forward(probe))?;
                let probs = model.normalized_probabilities(&output, log_space);
                check_shape(probs.view(), mask.view())?;
                total += metric(probs.view(), mask.view())?;

                let completed = trial + 1;
                if let Some(budget) = self.trial_budget {
                    if completed < self.trials && started.elapsed() > budget {
                        return Err(EstimationError::BudgetExceeded {
                            completed,
                            trials: self.trials,
                            budget_ms: budget.as_millis().min(u64::MAX as u128) as u64,
                        });
                    }
                }
            }
            Ok(total / self.trials as f64)
        })
    }

    fn criterion_loss<M: HostModel>(
        &self,
        probe: &Batch,
        model: &mut M,
        criterion: &dyn Criterion<M>,
    ) -> Result<f64, EstimationError> {
        let out = with_mode(model, EvalMode::Deterministic, |model| {
            self.retry_transient(|| criterion.evaluate(model, probe))
        })?;
        if out.ntokens == 0 {
            return Err(EstimationError::DegenerateMask);
        }
        Ok(out.loss / out.ntokens as f64)
    }

    fn retry_transient<T>(
        &self,
        mut f: impl FnMut() -> Result<T, ModelError>,
    ) -> Result<T, EstimationError> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match f() {
                Ok(v) => return Ok(v),
                Err(err) if err.is_transient() && attempts <= self.transient_retries => {
                    debug!(attempt = attempts, error = %err, "retrying transient forward failure");
                }
                Err(source) => return Err(EstimationError::Forward { attempts, source }),
            }
        }
    }
}

fn check_shape(
    probs: ArrayView3<'_, f64>,
    mask: ArrayView2<'_, bool>,
) -> Result<(), EstimationError> {
    let (rows, cols, vocab) = probs.dim();
    if (rows, cols) != mask.dim() || vocab == 0 {
        return Err(EstimationError::ShapeMismatch {
            expected: mask.dim(),
            actual: (rows, cols),
        });
    }
    Ok(())
}

/// Per-trial metrics. Each is a pure function of the output distribution (`[rows, len, vocab]`)
/// and a target mask (`[rows, len]`).
pub mod metrics {
    use super::*;

    /// Mean categorical entropy (nats) over masked positions; expects plain probabilities.
    pub fn masked_entropy(
        probs: ArrayView3<'_, f64>,
        mask: ArrayView2<'_, bool>,
    ) -> Result<f64, EstimationError> {
        let mut total = 0.0;
        let mut count = 0usize;
        for ((row, col), &valid) in mask.indexed_iter() {
            if !valid {
                continue;
            }
            let dist = probs.index_axis(Axis(0), row);
            let h: f64 = dist
                .index_axis(Axis(0), col)
                .iter()
                .filter(|&&p| p > 0.0)
                .map(|&p| -p * p.ln())
                .sum();
            total += h;
            count += 1;
        }
        if count == 0 {
            return Err(EstimationError::DegenerateMask);
        }
        Ok(total / count as f64)
    }

    /// `1 - mean_over_rows(exp(sum of masked max log-probs))`; expects log-probabilities.
    pub fn confidence_deficit(
        log_probs: ArrayView3<'_, f64>,
        mask: ArrayView2<'_, bool>,
    ) -> Result<f64, EstimationError> {
        let rows = masked_max_log_probs(log_probs, mask);
        let confidences: Vec<f64> = rows
            .iter()
            .filter(|r| !r.is_empty())
            .map(|r| r.iter().sum::<f64>().exp())
            .collect();
        Ok(1.0 - mean(&confidences)?)
    }

    /// Same as [`confidence_deficit`] but each row's log-confidence is divided by its
    /// masked length before exponentiation.
    pub fn normalized_confidence_deficit(
        log_probs: ArrayView3<'_, f64>,
        mask: ArrayView2<'_, bool>,
    ) -> Result<f64, EstimationError> {
        let rows = masked_max_log_probs(log_probs, mask);
        let confidences: Vec<f64> = rows
            .iter()
            .filter(|r| !r.is_empty())
            .map(|r| mean_unchecked(r).exp())
            .collect();
        Ok(1.0 - mean(&confidences)?)
    }

    /// Mean over rows of the unbiased variance of masked max log-probs.
    ///
    /// Rows with fewer than two masked positions have no variance and are skipped.
    pub fn confidence_variance(
        log_probs: ArrayView3<'_, f64>,
        mask: ArrayView2<'_, bool>,
    ) -> Result<f64, EstimationError> {
        let rows = masked_max_log_probs(log_probs, mask);
        let variances: Vec<f64> = rows.iter().filter_map(|r| unbiased_variance(r)).collect();
        mean(&variances)
    }

    /// Mean over rows of `exp(variance / mean)` of masked max log-probs.
    pub fn composite(
        log_probs: ArrayView3<'_, f64>,
        mask: ArrayView2<'_, bool>,
    ) -> Result<f64, EstimationError> {
        let rows = masked_max_log_probs(log_probs, mask);
        let ratios: Vec<f64> = rows
            .iter()
            .filter_map(|r| unbiased_variance(r).map(|var| (var / mean_unchecked(r)).exp()))
            .collect();
        mean(&ratios)
    }

    /// Max log-probability at each masked position, grouped by row.
    fn masked_max_log_probs(
        log_probs: ArrayView3<'_, f64>,
        mask: ArrayView2<'_, bool>,
    ) -> Vec<Vec<f64>> {
        let mut rows = vec![Vec::new(); mask.nrows()];
        for ((row, col), &valid) in mask.indexed_iter() {
            if !valid {
                continue;
            }
            let best = log_probs
                .index_axis(Axis(0), row)
                .index_axis(Axis(0), col)
                .iter()
                .copied()
                .fold(f64::NEG_INFINITY, f64::max);
            rows[row].push(best);
        }
        rows
    }

    fn unbiased_variance(values: &[f64]) -> Option<f64> {
        if values.len() < 2 {
            return None;
        }
        let m = mean_unchecked(values);
        let ss: f64 = values.iter().map(|v| (v - m) * (v - m)).sum();
        Some(ss / (values.len() - 1) as f64)
    }

    fn mean(values: &[f64]) -> Result<f64, EstimationError> {
        if values.is_empty() {
            return Err(EstimationError::DegenerateMask);
        }
        Ok(mean_unchecked(values))
    }

    fn mean_unchecked(values: &[f64]) -> f64 {
        values.iter().sum::<f64>() / values.len() as f64
    }
}
