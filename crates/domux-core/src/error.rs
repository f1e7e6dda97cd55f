use std::path::PathBuf;

use thiserror::Error;

use crate::types::RewardKind;

/// Raised while building a controller; always fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown reward_type {0:?}; expected one of entropy, xentropy, enttp, enteos, pretp, exptp, vartp, comtp")]
    UnknownRewardKind(String),
    #[error("unknown data_actor_optimizer {0:?}; expected adam or sgd")]
    UnknownOptimizer(String),
    #[error("invalid temperature {0:?}; expected a positive number or \"inf\"")]
    InvalidTemperature(String),
    #[error("invalid {option}: {reason}")]
    InvalidOption {
        option: &'static str,
        reason: String,
    },
    #[error("cannot read domain file {path}: {source}")]
    DomainFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("domain file {0} lists no domains")]
    EmptyDomainFile(PathBuf),
    #[error("domain {name:?} is listed more than once (second at line {line})")]
    DuplicateDomain { name: String, line: usize },
    #[error("cannot open sampling log {path}: {source}")]
    SamplingLog {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Raised while loading domain corpora; always fatal.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("corpus file not found: {0}")]
    MissingCorpus(PathBuf),
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path} line {line}: {reason}")]
    Malformed {
        path: PathBuf,
        line: usize,
        reason: String,
    },
    #[error("domain {domain:?}: source has {source_lines} examples but target has {target_lines}")]
    SizeMismatch {
        domain: String,
        source_lines: usize,
        target_lines: usize,
    },
    #[error("domain {0:?} has no training examples")]
    EmptyCorpus(String),
    #[error("no domains were loaded")]
    NoDomains,
    #[error("cannot shape the initial distribution: {0}")]
    Temperature(#[source] ConfigError),
    #[error("initial sampling distribution is invalid: {0}")]
    InitialDistribution(#[from] ProbabilityError),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProbabilityError {
    #[error("probability vector must be non-empty")]
    Empty,
    #[error("expected {expected} entries but got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("entry {index} is not finite")]
    NonFinite { index: usize },
    #[error("entry {index} is negative ({value})")]
    Negative { index: usize, value: f64 },
    #[error("entries sum to {sum}, expected 1")]
    Sum { sum: f64 },
}

/// Failure reported by a host model or criterion collaborator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("transient model failure: {0}")]
    Transient(String),
    #[error("model failure: {0}")]
    Fatal(String),
}

impl ModelError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ModelError::Transient(_))
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EstimationError {
    #[error("probe batch has no valid target positions")]
    DegenerateMask,
    #[error("forward pass failed after {attempts} attempt(s): {source}")]
    Forward {
        attempts: u32,
        #[source]
        source: ModelError,
    },
    #[error("reward is not finite ({0})")]
    NonFinite(f64),
    #[error("trial budget of {budget_ms}ms exceeded after {completed} of {trials} trials")]
    BudgetExceeded {
        completed: usize,
        trials: usize,
        budget_ms: u64,
    },
    #[error("model output shape {actual:?} does not match probe target shape {expected:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        actual: (usize, usize),
    },
}

/// A reward estimate that could not be produced for one domain.
///
/// One failure aborts the whole reweighting cycle it occurred in.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("reward estimation failed for domain {domain:?} ({metric}): {cause}")]
pub struct EstimationFailure {
    pub domain: String,
    pub metric: RewardKind,
    #[source]
    pub cause: EstimationError,
}
