use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::{RewardKind, Temperature};

/// Optimizer used to fit the sampling policy's logits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    #[default]
    Adam,
    Sgd,
}

impl FromStr for OptimizerKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "adam" => Ok(OptimizerKind::Adam),
            "sgd" => Ok(OptimizerKind::Sgd),
            _ => Err(ConfigError::UnknownOptimizer(s.to_string())),
        }
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizerKind::Adam => f.write_str("adam"),
            OptimizerKind::Sgd => f.write_str("sgd"),
        }
    }
}

/// Every knob of the sampling controller.
///
/// `temperature` and `reward_type` are typed, so unknown values are rejected when the
/// configuration is parsed rather than when a reweighting cycle first runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub temperature: Temperature,
    pub max_sample_tokens: usize,
    pub domain_file: PathBuf,
    pub reward_type: RewardKind,
    /// Monte Carlo trials per domain.
    #[serde(rename = "K")]
    pub k: usize,
    pub update_sampling_interval: u64,
    pub data_actor_optim_step: usize,
    pub data_actor_lr: f64,
    pub data_actor_optimizer: OptimizerKind,
    pub sample_prob_log: Option<PathBuf>,
    pub pretrain_step_cap: usize,
    pub pretrain_epsilon: f64,
    pub seed: u64,
    /// Wall-clock cap on one domain's K-trial loop; `None` is unbounded.
    pub reward_trial_budget_ms: Option<u64>,
    /// Extra attempts granted to a forward pass that fails transiently.
    pub transient_retries: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            temperature: Temperature::Finite(1.0),
            max_sample_tokens: 1024,
            domain_file: PathBuf::new(),
            reward_type: RewardKind::TokenEntropy,
            k: 10,
            update_sampling_interval: 2000,
            data_actor_optim_step: 200,
            data_actor_lr: 1e-4,
            data_actor_optimizer: OptimizerKind::Adam,
            sample_prob_log: None,
            pretrain_step_cap: 1_000_000,
            pretrain_epsilon: 1e-8,
            seed: 1,
            reward_trial_budget_ms: None,
            transient_retries: 1,
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_sample_tokens == 0 {
            return Err(invalid("max_sample_tokens", "must be >= 1"));
        }
        if self.k == 0 {
            return Err(invalid("K", "must be >= 1"));
        }
        if self.update_sampling_interval == 0 {
            return Err(invalid("update_sampling_interval", "must be >= 1"));
        }
        if self.data_actor_optim_step == 0 {
            return Err(invalid("data_actor_optim_step", "must be >= 1"));
        }
        if !(self.data_actor_lr.is_finite() && self.data_actor_lr > 0.0) {
            return Err(invalid(
                "data_actor_lr",
                format!("must be a positive finite number, got {}", self.data_actor_lr),
            ));
        }
        if self.pretrain_step_cap == 0 {
            return Err(invalid("pretrain_step_cap", "must be >= 1"));
        }
        if !(self.pretrain_epsilon.is_finite() && self.pretrain_epsilon > 0.0) {
            return Err(invalid(
                "pretrain_epsilon",
                format!("must be a positive finite number, got {}", self.pretrain_epsilon),
            ));
        }
        self.temperature.validate()?;
        if self.reward_trial_budget_ms == Some(0) {
            return Err(invalid("reward_trial_budget_ms", "must be >= 1 when set"));
        }
        Ok(())
    }
}

fn invalid(option: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidOption {
        option,
        reason: reason.into(),
    }
}
