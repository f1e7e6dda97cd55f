use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use domux_core::types::{ProbabilityVector, RewardVector};
use domux_core::{
    ConfigError, ControllerConfig, DataError, DomainList, EstimationFailure, ProbabilityError,
};
use domux_observe::metrics::{Counter, DurationAgg};

use crate::corpus::load_domain_corpora;
use crate::model::{Criterion, HostModel};
use crate::multiplexer::{Multiplexer, MultiplexerMetrics};
use crate::policy::{PolicyError, PretrainReport, SamplingPolicy};
use crate::reward::RewardEstimator;
use crate::sampling_log::SamplingLog;
use crate::types::{Batch, DomainCorpus, SpecialSymbols};

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("train_step called before a dataset was loaded")]
    NotLoaded,
    #[error("dataset is already loaded")]
    AlreadyLoaded,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Data(#[from] DataError),
    #[error("policy pretraining failed: {0}")]
    Pretrain(#[source] PolicyError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerPhase {
    Uninitialized,
    Pretraining,
    Steady,
}

/// Guarantees at most one reweighting per step id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateSchedule {
    interval: u64,
    last_fired: Option<u64>,
}

impl UpdateSchedule {
    pub fn new(interval: u64) -> Self {
        Self {
            interval: interval.max(1),
            last_fired: None,
        }
    }

    pub fn last_fired(&self) -> Option<u64> {
        self.last_fired
    }

    /// Reports whether a reweighting is due at `step`.
    pub fn observe(&self, step: u64) -> bool {
        step > 0 && step % self.interval == 0 && self.last_fired != Some(step)
    }

    pub fn mark_fired(&mut self, step: u64) {
        self.last_fired = Some(step);
    }
}

/// Why a reweighting cycle left the active distribution untouched.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReweightAbort {
    #[error(transparent)]
    Estimation(#[from] EstimationFailure),
    #[error("policy update failed: {0}")]
    Policy(#[from] PolicyError),
    #[error("multiplexer rejected the new distribution: {0}")]
    Rejected(#[from] ProbabilityError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReweightOutcome {
    Committed {
        rewards: RewardVector,
        probabilities: ProbabilityVector,
    },
    Aborted(ReweightAbort),
}

impl ReweightOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, ReweightOutcome::Committed { .. })
    }
}

/// What the controller did during one `train_step`.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub update_num: u64,
    pub batch: Batch,
    pub pretrain: Option<PretrainReport>,
    pub reweight: Option<ReweightOutcome>,
}

#[derive(Debug, Default)]
pub struct ControllerMetrics {
    pub steps_total: Counter,
    pub reweight_attempted_total: Counter,
    pub reweight_committed_total: Counter,
    pub reweight_aborted_total: Counter,
    pub reweight_duration: DurationAgg,
}

/// The narrow surface a training harness drives.
pub trait TrainingTask {
    /// Reads the configured domain file and loads every listed corpus.
    fn load_dataset(&mut self) -> Result<(), ControllerError>;

    /// Runs the controller's bookkeeping for `update_num` and returns the batch to train on.
    fn train_step<M: HostModel>(
        &mut self,
        update_num: u64,
        model: &mut M,
        criterion: &dyn Criterion<M>,
    ) -> Result<StepOutcome, ControllerError>;
}

struct Loaded {
    mux: Multiplexer,
    policy: SamplingPolicy,
}

/// Adaptive multi-domain sampling controller.
///
/// Lifecycle: built from a validated config, a dataset is loaded once, then `train_step`
/// is called once per training step. The first step pretrains the policy toward the
/// size-based distribution; every `update_sampling_interval` steps after that the
/// controller scores each domain, refits the policy and swaps the result into the
/// multiplexer. All of it runs synchronously inside the caller's step.
pub struct Controller {
    cfg: ControllerConfig,
    symbols: SpecialSymbols,
    phase: ControllerPhase,
    schedule: UpdateSchedule,
    estimator: RewardEstimator,
    loaded: Option<Loaded>,
    log: SamplingLog,
    metrics: Arc<ControllerMetrics>,
}

impl Controller {
    /// Validates `cfg` and opens (truncating) the sampling log.
    pub fn new(cfg: ControllerConfig, symbols: SpecialSymbols) -> Result<Self, ControllerError> {
        cfg.validate()?;
        let log = SamplingLog::create(cfg.sample_prob_log.as_deref()).map_err(|source| {
            ConfigError::SamplingLog {
                path: cfg.sample_prob_log.clone().unwrap_or_default(),
                source,
            }
        })?;
        info!(
            target: "domux_controller",
            temperature = %cfg.temperature,
            reward_type = %cfg.reward_type,
            trials = cfg.k,
            update_sampling_interval = cfg.update_sampling_interval,
            data_actor_optim_step = cfg.data_actor_optim_step,
            data_actor_lr = cfg.data_actor_lr,
            data_actor_optimizer = %cfg.data_actor_optimizer,
            "controller configured"
        );
        Ok(Self {
            schedule: UpdateSchedule::new(cfg.update_sampling_interval),
            estimator: RewardEstimator::from_config(&cfg),
            cfg,
            symbols,
            phase: ControllerPhase::Uninitialized,
            loaded: None,
            log,
            metrics: Arc::new(ControllerMetrics::default()),
        })
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.cfg
    }

    pub fn phase(&self) -> ControllerPhase {
        self.phase
    }

    pub fn schedule(&self) -> &UpdateSchedule {
        &self.schedule
    }

    pub fn metrics(&self) -> Arc<ControllerMetrics> {
        self.metrics.clone()
    }

    pub fn multiplexer(&self) -> Option<&Multiplexer> {
        self.loaded.as_ref().map(|l| &l.mux)
    }

    pub fn policy(&self) -> Option<&SamplingPolicy> {
        self.loaded.as_ref().map(|l| &l.policy)
    }

    /// Snapshot of the active sampling distribution.
    pub fn probabilities(&self) -> Option<ProbabilityVector> {
        self.multiplexer().map(Multiplexer::probabilities)
    }

    /// Installs already-loaded corpora and writes the log header and initial vector.
    pub fn load_corpora(&mut self, corpora: Vec<DomainCorpus>) -> Result<(), ControllerError> {
        if self.loaded.is_some() {
            return Err(ControllerError::AlreadyLoaded);
        }
        let mux = Multiplexer::initialize(
            corpora,
            self.cfg.temperature,
            self.symbols,
            self.cfg.max_sample_tokens,
            self.cfg.seed,
        )?;
        let policy = SamplingPolicy::new(
            mux.num_domains(),
            self.cfg.data_actor_optimizer,
            self.cfg.data_actor_lr,
        );

        if let Err(err) = self.log.append_header(mux.domain_names()) {
            warn!(target: "domux_controller", error = %err, "failed to write sampling log header");
        }
        self.append_snapshot(mux.initial_probabilities());

        self.loaded = Some(Loaded { mux, policy });
        Ok(())
    }

    /// Flushes and closes the sampling log.
    pub fn shutdown(&mut self) {
        if let Err(err) = self.log.close() {
            warn!(target: "domux_controller", error = %err, "failed to close sampling log");
        }
    }

    /// Logs every controller and multiplexer metric on target `domux_metrics`.
    pub fn emit_metrics_snapshot(&self) {
        let reweight = self.metrics.reweight_duration.snapshot();
        let mux = self.multiplexer().map(Multiplexer::metrics);
        let read = |f: fn(&MultiplexerMetrics) -> u64| mux.as_deref().map_or(0, f);
        let per_domain_batches = mux
            .as_deref()
            .map(|m| m.per_domain_batches.snapshot())
            .unwrap_or_default();
        info!(
            target: "domux_metrics",
            steps_total = self.metrics.steps_total.get(),
            sampled_batches_total = read(|m| m.sampled_batches_total.get()),
            sampled_examples_total = read(|m| m.sampled_examples_total.get()),
            reshuffles_total = read(|m| m.reshuffles_total.get()),
            probability_updates_total = read(|m| m.probability_updates_total.get()),
            batch_tokens_high_water = read(|m| m.batch_tokens_high_water.get()),
            per_domain_batches = ?per_domain_batches,
            reweight_attempted_total = self.metrics.reweight_attempted_total.get(),
            reweight_committed_total = self.metrics.reweight_committed_total.get(),
            reweight_aborted_total = self.metrics.reweight_aborted_total.get(),
            reweight_avg_ms = reweight.mean().as_millis() as u64,
            reweight_max_ms = reweight.max.as_millis() as u64,
            "metrics"
        );
    }

    fn pretrain(&mut self) -> Result<PretrainReport, ControllerError> {
        let loaded = self.loaded.as_mut().ok_or(ControllerError::NotLoaded)?;
        self.phase = ControllerPhase::Pretraining;
        info!(target: "domux_controller", "pretraining sampling policy");

        let target = loaded.mux.initial_probabilities().clone();
        let report = match loaded.policy.pretrain(
            &target,
            self.cfg.pretrain_step_cap,
            self.cfg.pretrain_epsilon,
        ) {
            Ok(report) => report,
            Err(err) => {
                self.phase = ControllerPhase::Uninitialized;
                return Err(ControllerError::Pretrain(err));
            }
        };

        if !report.converged {
            warn!(
                target: "domux_controller",
                steps = report.steps,
                loss = report.final_loss,
                epsilon = self.cfg.pretrain_epsilon,
                "policy pretraining hit its step cap before converging"
            );
        }
        let pretrained = loaded.policy.probabilities().map_err(ControllerError::Pretrain)?;
        for (i, name) in loaded.mux.domain_names().iter().enumerate() {
            info!(
                target: "domux_controller",
                domain = %name,
                size = loaded.mux.sizes()[i],
                probability = pretrained.as_slice()[i],
                "pretrained sampling policy"
            );
        }
        self.phase = ControllerPhase::Steady;
        Ok(report)
    }

    /// One full reweighting cycle. Any failure leaves the active distribution, the
    /// policy and the log exactly as they were.
    fn reweight<M: HostModel>(
        &mut self,
        update_num: u64,
        model: &mut M,
        criterion: &dyn Criterion<M>,
    ) -> Result<ReweightOutcome, ControllerError> {
        let metrics = self.metrics.clone();
        let _timer = metrics.reweight_duration.time();
        metrics.reweight_attempted_total.inc();

        let loaded = self.loaded.as_mut().ok_or(ControllerError::NotLoaded)?;
        info!(target: "domux_controller", step = update_num, "updating sampling probability");

        match Self::run_cycle(&self.cfg, &self.estimator, loaded, model, criterion) {
            Ok((rewards, probabilities)) => {
                info!(
                    target: "domux_controller",
                    step = update_num,
                    probabilities = ?probabilities.as_slice(),
                    "sampling probability updated"
                );
                self.append_snapshot(&probabilities);
                metrics.reweight_committed_total.inc();
                Ok(ReweightOutcome::Committed {
                    rewards,
                    probabilities,
                })
            }
            Err(abort) => {
                warn!(
                    target: "domux_controller",
                    step = update_num,
                    error = %abort,
                    "reweighting cycle aborted; keeping previous sampling probability"
                );
                metrics.reweight_aborted_total.inc();
                Ok(ReweightOutcome::Aborted(abort))
            }
        }
    }

    fn run_cycle<M: HostModel>(
        cfg: &ControllerConfig,
        estimator: &RewardEstimator,
        loaded: &mut Loaded,
        model: &mut M,
        criterion: &dyn Criterion<M>,
    ) -> Result<(RewardVector, ProbabilityVector), ReweightAbort> {
        let mut rewards = Vec::with_capacity(loaded.mux.num_domains());
        for (name, probe) in loaded.mux.probes() {
            rewards.push(estimator.estimate(&name.0, probe, model, criterion)?);
        }
        info!(
            target: "domux_controller",
            metric = %estimator.kind(),
            rewards = ?rewards,
            "rewards"
        );
        let rewards = RewardVector::new(rewards)?;

        let checkpoint =
            loaded
                .policy
                .fit_rewards(&rewards, cfg.data_actor_optim_step, cfg.data_actor_lr)?;
        loaded.policy.verify(&checkpoint)?;
        let probabilities = checkpoint.probabilities()?;
        loaded.mux.update_probabilities(probabilities.clone())?;
        loaded.policy.commit(checkpoint)?;
        Ok((rewards, probabilities))
    }

    fn append_snapshot(&mut self, probabilities: &ProbabilityVector) {
        if let Err(err) = self.log.append_snapshot(probabilities) {
            warn!(
                target: "domux_controller",
                error = %err,
                "failed to append sampling log snapshot"
            );
        }
    }
}

impl TrainingTask for Controller {
    fn load_dataset(&mut self) -> Result<(), ControllerError> {
        let list = DomainList::read(&self.cfg.domain_file)?;
        let corpora = load_domain_corpora(&list, self.symbols)?;
        self.load_corpora(corpora)
    }

    fn train_step<M: HostModel>(
        &mut self,
        update_num: u64,
        model: &mut M,
        criterion: &dyn Criterion<M>,
    ) -> Result<StepOutcome, ControllerError> {
        if self.loaded.is_none() {
            return Err(ControllerError::NotLoaded);
        }
        self.metrics.steps_total.inc();

        let pretrain = match self.phase {
            ControllerPhase::Uninitialized | ControllerPhase::Pretraining => Some(self.pretrain()?),
            ControllerPhase::Steady => None,
        };

        let reweight = if self.schedule.observe(update_num) {
            self.schedule.mark_fired(update_num);
            Some(self.reweight(update_num, model, criterion)?)
        } else {
            None
        };

        let loaded = self.loaded.as_mut().ok_or(ControllerError::NotLoaded)?;
        let batch = loaded.mux.sample_batch(self.cfg.max_sample_tokens);
        Ok(StepOutcome {
            update_num,
            batch,
            pretrain,
            reweight,
        })
    }
}
