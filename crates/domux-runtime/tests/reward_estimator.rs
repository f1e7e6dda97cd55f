use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use ndarray::Array3;

use domux_core::types::RewardKind;
use domux_core::{EstimationError, ModelError};
use domux_runtime::model::{Criterion, CriterionOutput, EvalMode, HostModel};
use domux_runtime::reward::RewardEstimator;
use domux_runtime::types::{Batch, Example, SpecialSymbols};

/// Puts `confidence` on token 0 at every position and spreads the rest evenly.
struct ScriptedModel {
    vocab: usize,
    confidence: f64,
    mode: EvalMode,
    modes_seen: Vec<EvalMode>,
    failures: VecDeque<ModelError>,
    delay: Option<Duration>,
    wrong_shape: bool,
}

impl ScriptedModel {
    fn new(confidence: f64) -> Self {
        Self {
            vocab: 4,
            confidence,
            mode: EvalMode::Deterministic,
            modes_seen: Vec::new(),
            failures: VecDeque::new(),
            delay: None,
            wrong_shape: false,
        }
    }
}

impl HostModel for ScriptedModel {
    type Output = Array3<f64>;

    fn mode(&self) -> EvalMode {
        self.mode
    }

    fn set_mode(&mut self, mode: EvalMode) {
        self.mode = mode;
    }

    fn forward(&mut self, batch: &Batch) -> Result<Self::Output, ModelError> {
        self.modes_seen.push(self.mode);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if let Some(err) = self.failures.pop_front() {
            return Err(err);
        }
        let (rows, mut cols) = batch.target.dim();
        if self.wrong_shape {
            cols += 1;
        }
        let c = self.confidence;
        let rest = (1.0 - c) / (self.vocab - 1) as f64;
        Ok(Array3::from_shape_fn((rows, cols, self.vocab), |(_, _, v)| {
            if v == 0 {
                c
            } else {
                rest
            }
        }))
    }

    fn normalized_probabilities(&self, output: &Self::Output, log_space: bool) -> Array3<f64> {
        if log_space {
            output.mapv(f64::ln)
        } else {
            output.clone()
        }
    }
}

/// Reports `per_token * ntokens` after running one forward pass.
struct FixedLoss {
    per_token: f64,
}

impl Criterion<ScriptedModel> for FixedLoss {
    fn evaluate(
        &self,
        model: &mut ScriptedModel,
        batch: &Batch,
    ) -> Result<CriterionOutput, ModelError> {
        model.forward(batch)?;
        Ok(CriterionOutput {
            loss: self.per_token * batch.ntokens as f64,
            ntokens: batch.ntokens,
            metadata: BTreeMap::new(),
        })
    }
}

const NO_LOSS: FixedLoss = FixedLoss { per_token: 0.0 };

fn probe() -> Batch {
    let a = Example::new(vec![5, 6, 2], vec![5, 6, 7, 2]);
    let b = Example::new(vec![5, 2], vec![8, 2]);
    Batch::from_examples(0, &[&a, &b], SpecialSymbols::default())
}

fn entropy(c: f64, vocab: usize) -> f64 {
    let rest = (1.0 - c) / (vocab - 1) as f64;
    -c * c.ln() - (vocab - 1) as f64 * rest * rest.ln()
}

#[test]
fn token_entropy_matches_closed_form() {
    let estimator = RewardEstimator::new(RewardKind::TokenEntropy, 3);
    let mut model = ScriptedModel::new(0.7);
    let r = estimator.estimate("law", &probe(), &mut model, &NO_LOSS).unwrap();
    assert!((r - entropy(0.7, 4)).abs() < 1e-12);
    assert_eq!(model.modes_seen, vec![EvalMode::Stochastic; 3]);
    assert_eq!(model.mode, EvalMode::Deterministic);
}

#[test]
fn less_confident_model_earns_larger_reward() {
    for kind in [
        RewardKind::TokenEntropy,
        RewardKind::ConfidenceDeficit,
        RewardKind::NormalizedConfidenceDeficit,
    ] {
        let estimator = RewardEstimator::new(kind, 2);
        let confident = estimator
            .estimate("a", &probe(), &mut ScriptedModel::new(0.95), &NO_LOSS)
            .unwrap();
        let unsure = estimator
            .estimate("a", &probe(), &mut ScriptedModel::new(0.4), &NO_LOSS)
            .unwrap();
        assert!(unsure > confident, "{kind}: {unsure} <= {confident}");
    }
}

#[test]
fn constant_confidence_has_zero_variance() {
    let estimator = RewardEstimator::new(RewardKind::ConfidenceVariance, 2);
    let r = estimator
        .estimate("a", &probe(), &mut ScriptedModel::new(0.6), &NO_LOSS)
        .unwrap();
    assert!(r.abs() < 1e-12);

    let composite = RewardEstimator::new(RewardKind::Composite, 2)
        .estimate("a", &probe(), &mut ScriptedModel::new(0.6), &NO_LOSS)
        .unwrap();
    assert!((composite - 1.0).abs() < 1e-12);
}

#[test]
fn eos_entropy_without_eos_positions_is_degenerate() {
    let ex = Example::new(vec![5, 2], vec![5, 6]);
    let batch = Batch::from_examples(0, &[&ex], SpecialSymbols::default());
    let estimator = RewardEstimator::new(RewardKind::EosEntropy, 2);
    let mut model = ScriptedModel::new(0.5);

    let err = estimator.estimate("news", &batch, &mut model, &NO_LOSS).unwrap_err();
    assert_eq!(err.domain, "news");
    assert_eq!(err.metric, RewardKind::EosEntropy);
    assert_eq!(err.cause, EstimationError::DegenerateMask);
    assert!(model.modes_seen.is_empty());
}

#[test]
fn criterion_loss_is_per_token_and_deterministic() {
    let estimator = RewardEstimator::new(RewardKind::CriterionLoss, 10);
    let mut model = ScriptedModel::new(0.5);
    model.mode = EvalMode::Stochastic;

    let r = estimator
        .estimate("it", &probe(), &mut model, &FixedLoss { per_token: 1.25 })
        .unwrap();
    assert!((r - 1.25).abs() < 1e-12);
    assert_eq!(model.modes_seen, vec![EvalMode::Deterministic]);
    assert_eq!(model.mode, EvalMode::Stochastic);
}

#[test]
fn transient_failure_is_retried() {
    let estimator = RewardEstimator::new(RewardKind::TokenEntropy, 2).with_transient_retries(1);
    let mut model = ScriptedModel::new(0.7);
    model
        .failures
        .push_back(ModelError::Transient("device busy".into()));

    let r = estimator.estimate("a", &probe(), &mut model, &NO_LOSS).unwrap();
    assert!((r - entropy(0.7, 4)).abs() < 1e-12);
    assert_eq!(model.modes_seen.len(), 3);
}

#[test]
fn retries_are_bounded() {
    let estimator = RewardEstimator::new(RewardKind::TokenEntropy, 2).with_transient_retries(1);
    let mut model = ScriptedModel::new(0.7);
    model.failures.extend([
        ModelError::Transient("busy".into()),
        ModelError::Transient("busy".into()),
    ]);

    let err = estimator.estimate("a", &probe(), &mut model, &NO_LOSS).unwrap_err();
    assert_eq!(
        err.cause,
        EstimationError::Forward {
            attempts: 2,
            source: ModelError::Transient("busy".into()),
        }
    );
    assert_eq!(model.mode, EvalMode::Deterministic);
}

#[test]
fn fatal_failure_is_not_retried() {
    let estimator = RewardEstimator::new(RewardKind::TokenEntropy, 2).with_transient_retries(3);
    let mut model = ScriptedModel::new(0.7);
    model.failures.push_back(ModelError::Fatal("oom".into()));

    let err = estimator.estimate("a", &probe(), &mut model, &NO_LOSS).unwrap_err();
    assert!(matches!(err.cause, EstimationError::Forward { attempts: 1, .. }));
    assert_eq!(model.modes_seen.len(), 1);
}

#[test]
fn trial_budget_stops_the_loop() {
    let estimator = RewardEstimator::new(RewardKind::TokenEntropy, 5)
        .with_trial_budget(Some(Duration::from_millis(1)));
    let mut model = ScriptedModel::new(0.7);
    model.delay = Some(Duration::from_millis(5));

    let err = estimator.estimate("a", &probe(), &mut model, &NO_LOSS).unwrap_err();
    assert_eq!(
        err.cause,
        EstimationError::BudgetExceeded {
            completed: 1,
            trials: 5,
            budget_ms: 1,
        }
    );
}

#[test]
fn mismatched_output_shape_is_rejected() {
    let estimator = RewardEstimator::new(RewardKind::TokenEntropy, 1);
    let mut model = ScriptedModel::new(0.7);
    model.wrong_shape = true;

    let err = estimator.estimate("a", &probe(), &mut model, &NO_LOSS).unwrap_err();
    assert_eq!(
        err.cause,
        EstimationError::ShapeMismatch {
            expected: (2, 4),
            actual: (2, 5),
        }
    );
}
