use thiserror::Error;
use tracing::info;

use domux_core::types::{ProbabilityVector, RewardVector};
use domux_core::{OptimizerKind, ProbabilityError};

const ADAM_BETA1: f64 = 0.9;
const ADAM_BETA2: f64 = 0.999;
const ADAM_EPS: f64 = 1e-8;

/// Pretraining progress is logged every this many steps.
pub const PRETRAIN_LOG_INTERVAL: usize = 1000;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PolicyError {
    #[error("expected {expected} entries but got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("policy logits became non-finite after {steps} optimizer steps")]
    Diverged { steps: usize },
    #[error("policy produced an invalid distribution: {0}")]
    Probability(#[from] ProbabilityError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PretrainReport {
    pub steps: usize,
    pub final_loss: f64,
    pub converged: bool,
}

#[derive(Debug, Clone, PartialEq)]
struct AdamState {
    m: Vec<f64>,
    v: Vec<f64>,
    t: i32,
}

#[derive(Debug, Clone, PartialEq)]
enum PolicyOptimizer {
    Sgd,
    Adam(AdamState),
}

impl PolicyOptimizer {
    fn new(kind: OptimizerKind, len: usize) -> Self {
        match kind {
            OptimizerKind::Sgd => PolicyOptimizer::Sgd,
            OptimizerKind::Adam => PolicyOptimizer::Adam(AdamState {
                m: vec![0.0; len],
                v: vec![0.0; len],
                t: 0,
            }),
        }
    }

    fn step(&mut self, params: &mut [f64], grad: &[f64], lr: f64) {
        match self {
            PolicyOptimizer::Sgd => {
                for (p, g) in params.iter_mut().zip(grad) {
                    *p -= lr * g;
                }
            }
            PolicyOptimizer::Adam(state) => {
                state.t = state.t.saturating_add(1);
                let bias1 = 1.0 - ADAM_BETA1.powi(state.t);
                let bias2 = 1.0 - ADAM_BETA2.powi(state.t);
                for i in 0..params.len() {
                    state.m[i] = ADAM_BETA1 * state.m[i] + (1.0 - ADAM_BETA1) * grad[i];
                    state.v[i] = ADAM_BETA2 * state.v[i] + (1.0 - ADAM_BETA2) * grad[i] * grad[i];
                    let m_hat = state.m[i] / bias1;
                    let v_hat = state.v[i] / bias2;
                    params[i] -= lr * m_hat / (v_hat.sqrt() + ADAM_EPS);
                }
            }
        }
    }
}

/// Learnable state ready to be committed into a [`SamplingPolicy`].
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyCheckpoint {
    logits: Vec<f64>,
    optimizer: PolicyOptimizer,
}

impl PolicyCheckpoint {
    pub fn logits(&self) -> &[f64] {
        &self.logits
    }

    pub fn probabilities(&self) -> Result<ProbabilityVector, PolicyError> {
        Ok(ProbabilityVector::new(softmax(&self.logits))?)
    }
}

/// Directly parameterized categorical distribution over domains.
///
/// There is no per-example input, so the whole policy is one logit per domain read
/// through a softmax. Optimizer moments persist across fits. Every fit runs on a copy
/// of (logits, optimizer) and only replaces the committed state once its loop finished.
#[derive(Debug, Clone)]
pub struct SamplingPolicy {
    state: PolicyCheckpoint,
    pretrain_lr: f64,
}

impl SamplingPolicy {
    /// Uniform policy over `num_domains`; `pretrain_lr` is the step size of [`Self::pretrain`].
    pub fn new(num_domains: usize, optimizer: OptimizerKind, pretrain_lr: f64) -> Self {
        Self {
            state: PolicyCheckpoint {
                logits: vec![0.0; num_domains],
                optimizer: PolicyOptimizer::new(optimizer, num_domains),
            },
            pretrain_lr,
        }
    }

    pub fn num_domains(&self) -> usize {
        self.state.logits.len()
    }

    pub fn logits(&self) -> &[f64] {
        &self.state.logits
    }

    pub fn probabilities(&self) -> Result<ProbabilityVector, PolicyError> {
        self.state.probabilities()
    }

    /// Fits the softmax output to `target` by minimizing mean squared error, stopping once
    /// the loss drops below `epsilon` or after `step_cap` optimizer steps.
    pub fn pretrain(
        &mut self,
        target: &ProbabilityVector,
        step_cap: usize,
        epsilon: f64,
    ) -> Result<PretrainReport, PolicyError> {
        self.check_len(target.len())?;
        let target = target.as_slice();
        let n = target.len() as f64;
        let mut scratch = self.state.clone();
        let mut steps = 0usize;

        let (final_loss, converged) = loop {
            let p = softmax(&scratch.logits);
            let loss = p
                .iter()
                .zip(target)
                .map(|(pi, ti)| (pi - ti) * (pi - ti))
                .sum::<f64>()
                / n;
            if !loss.is_finite() {
                return Err(PolicyError::Diverged { steps });
            }
            if loss < epsilon {
                break (loss, true);
            }
            if steps >= step_cap {
                break (loss, false);
            }
            if steps % PRETRAIN_LOG_INTERVAL == 0 {
                info!(
                    target: "domux_controller",
                    loss = loss,
                    num_updates = steps,
                    "pretraining sampling policy"
                );
            }

            let upstream: Vec<f64> = p
                .iter()
                .zip(target)
                .map(|(pi, ti)| 2.0 * (pi - ti) / n)
                .collect();
            let grad = softmax_backward(&p, &upstream);
            scratch
                .optimizer
                .step(&mut scratch.logits, &grad, self.pretrain_lr);
            steps += 1;
        };

        self.commit(scratch)?;
        Ok(PretrainReport {
            steps,
            final_loss,
            converged,
        })
    }

    /// Runs `optim_steps` gradient steps on `sum_i reward_i * -log softmax(logits)_i`
    /// without touching the committed state.
    ///
    /// The fixed point of this objective is the reward-proportional distribution, so mass
    /// moves toward domains with larger reward.
    pub fn fit_rewards(
        &self,
        rewards: &RewardVector,
        optim_steps: usize,
        learning_rate: f64,
    ) -> Result<PolicyCheckpoint, PolicyError> {
        self.check_len(rewards.len())?;
        let rewards = rewards.as_slice();
        let total: f64 = rewards.iter().sum();
        let mut scratch = self.state.clone();

        for step in 0..optim_steps {
            let p = softmax(&scratch.logits);
            let grad: Vec<f64> = p
                .iter()
                .zip(rewards)
                .map(|(pj, rj)| pj * total - rj)
                .collect();
            scratch.optimizer.step(&mut scratch.logits, &grad, learning_rate);
            if scratch.logits.iter().any(|z| !z.is_finite()) {
                return Err(PolicyError::Diverged { steps: step + 1 });
            }
        }
        scratch.probabilities()?;
        Ok(scratch)
    }

    /// Checks that `checkpoint` could be committed into this policy.
    pub fn verify(&self, checkpoint: &PolicyCheckpoint) -> Result<(), PolicyError> {
        self.check_len(checkpoint.logits.len())?;
        if checkpoint.logits.iter().any(|z| !z.is_finite()) {
            return Err(PolicyError::Diverged { steps: 0 });
        }
        Ok(())
    }

    pub fn commit(&mut self, checkpoint: PolicyCheckpoint) -> Result<(), PolicyError> {
        self.verify(&checkpoint)?;
        self.state = checkpoint;
        Ok(())
    }

    /// [`Self::fit_rewards`] followed by [`Self::commit`]; returns the new distribution.
    pub fn update(
        &mut self,
        rewards: &RewardVector,
        optim_steps: usize,
        learning_rate: f64,
    ) -> Result<ProbabilityVector, PolicyError> {
        let checkpoint = self.fit_rewards(rewards, optim_steps, learning_rate)?;
        let probabilities = checkpoint.probabilities()?;
        self.commit(checkpoint)?;
        Ok(probabilities)
    }

    fn check_len(&self, actual: usize) -> Result<(), PolicyError> {
        let expected = self.num_domains();
        if actual != expected {
            return Err(PolicyError::LengthMismatch { expected, actual });
        }
        Ok(())
    }
}

fn softmax(logits: &[f64]) -> Vec<f64> {
    let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = logits.iter().map(|z| (z - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Chain rule through softmax: `dL/dz_j = p_j * (g_j - sum_i g_i p_i)`.
fn softmax_backward(p: &[f64], upstream: &[f64]) -> Vec<f64> {
    let dot: f64 = p.iter().zip(upstream).map(|(pi, gi)| pi * gi).sum();
    p.iter().zip(upstream).map(|(pj, gj)| pj * (gj - dot)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn softmax_of_equal_logits_is_uniform() {
        let p = softmax(&[3.0, 3.0, 3.0, 3.0]);
        for v in p {
            assert!((v - 0.25).abs() < 1e-15);
        }
    }

    #[test]
    fn softmax_is_shift_stable() {
        let p = softmax(&[1000.0, 1001.0]);
        assert!(p.iter().all(|v| v.is_finite()));
        assert!((p[0] + p[1] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn softmax_backward_sums_to_zero() {
        let p = softmax(&[0.1, -0.4, 0.9]);
        let g = softmax_backward(&p, &[0.3, -1.0, 2.0]);
        assert!(g.iter().sum::<f64>().abs() < 1e-12);
    }

    #[test]
    fn fit_does_not_touch_committed_state() {
        let policy = SamplingPolicy::new(3, OptimizerKind::Sgd, 1.0);
        let rewards = RewardVector::new(vec![0.0, 0.0, 1.0]).unwrap();
        let checkpoint = policy.fit_rewards(&rewards, 10, 0.5).unwrap();
        assert_eq!(policy.logits(), &[0.0, 0.0, 0.0]);
        assert!(checkpoint.logits()[2] > 0.0);
    }

    #[test]
    fn wrong_reward_length_is_rejected() {
        let mut policy = SamplingPolicy::new(3, OptimizerKind::Adam, 1e-3);
        let rewards = RewardVector::new(vec![1.0, 2.0]).unwrap();
        assert_eq!(
            policy.update(&rewards, 5, 1e-3),
            Err(PolicyError::LengthMismatch {
                expected: 3,
                actual: 2
            })
        );
    }

    #[test]
    fn diverging_fit_leaves_policy_untouched() {
        let mut policy = SamplingPolicy::new(2, OptimizerKind::Sgd, 1.0);
        let rewards = RewardVector::new(vec![1e300, -1e300]).unwrap();
        assert!(matches!(
            policy.update(&rewards, 50, 1e300),
            Err(PolicyError::Diverged { .. })
        ));
        assert_eq!(policy.logits(), &[0.0, 0.0]);
    }

    #[test]
    fn checkpoint_from_another_policy_is_refused() {
        let mut small = SamplingPolicy::new(2, OptimizerKind::Sgd, 1.0);
        let large = SamplingPolicy::new(3, OptimizerKind::Sgd, 1.0);
        let rewards = RewardVector::new(vec![0.2, 0.3, 0.5]).unwrap();
        let checkpoint = large.fit_rewards(&rewards, 5, 0.5).unwrap();

        let expected = PolicyError::LengthMismatch {
            expected: 2,
            actual: 3,
        };
        assert_eq!(small.verify(&checkpoint), Err(expected.clone()));
        assert_eq!(small.commit(checkpoint), Err(expected));
        assert_eq!(small.logits(), &[0.0, 0.0]);
    }
}
