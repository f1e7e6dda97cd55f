use std::collections::BTreeMap;

use ndarray::Array3;

use domux_core::ModelError;

use crate::types::Batch;

/// Whether the host model evaluates deterministically or with its stochastic
/// components (e.g. dropout) active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalMode {
    Deterministic,
    Stochastic,
}

/// The model being trained, as seen by the controller.
///
/// The controller never updates the model's parameters; it only runs forward passes on
/// probe batches and reads the normalized output distribution.
pub trait HostModel {
    type Output;

    fn mode(&self) -> EvalMode;

    fn set_mode(&mut self, mode: EvalMode);

    fn forward(&mut self, batch: &Batch) -> Result<Self::Output, ModelError>;

    /// Per-position output distribution with shape `[rows, target_len, vocab]`,
    /// as natural-log probabilities when `log_space` is set.
    fn normalized_probabilities(&self, output: &Self::Output, log_space: bool) -> Array3<f64>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct CriterionOutput {
    pub loss: f64,
    pub ntokens: usize,
    pub metadata: BTreeMap<String, f64>,
}

/// The host training loss.
pub trait Criterion<M: HostModel> {
    fn evaluate(&self, model: &mut M, batch: &Batch) -> Result<CriterionOutput, ModelError>;
}

/// Runs `f` with the model switched to `mode`, restoring the previous mode afterwards
/// regardless of the outcome.
pub fn with_mode<M, T>(model: &mut M, mode: EvalMode, f: impl FnOnce(&mut M) -> T) -> T
where
    M: HostModel,
{
    let previous = model.mode();
    model.set_mode(mode);
    let out = f(model);
    model.set_mode(previous);
    out
}
