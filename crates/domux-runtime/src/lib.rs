#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod controller;
pub mod corpus;
pub mod model;
pub mod multiplexer;
pub mod policy;
pub mod reward;
pub mod sampling_log;
pub mod types;

pub use controller::{
    Controller, ControllerError, ControllerPhase, ReweightAbort, ReweightOutcome, StepOutcome,
    TrainingTask,
};
