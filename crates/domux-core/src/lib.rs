#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod config;
pub mod domain_list;
pub mod error;
pub mod types;

pub use config::{ControllerConfig, OptimizerKind};
pub use domain_list::{DomainEntry, DomainList};
pub use error::{
    ConfigError, DataError, EstimationError, EstimationFailure, ModelError, ProbabilityError,
};
pub use types::{
    DomainName, ProbabilityVector, RewardKind, RewardVector, Temperature, PROBABILITY_TOLERANCE,
};
