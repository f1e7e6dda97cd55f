#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use ndarray::Array3;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::info;

use domux_core::types::{RewardKind, Temperature};
use domux_core::{ControllerConfig, ModelError, OptimizerKind};
use domux_runtime::model::{Criterion, CriterionOutput, EvalMode, HostModel};
use domux_runtime::types::{Batch, DomainCorpus, Example, SpecialSymbols};
use domux_runtime::{Controller, TrainingTask};

/// Drives the sampling controller against a toy model whose per-domain error shrinks as
/// it sees that domain's batches.
#[derive(Debug, Parser)]
#[command(name = "domux-sim")]
struct Args {
    #[arg(long, env = "DOMUX_STEPS", default_value_t = 20_000)]
    steps: u64,

    /// Domain list file; when unset, synthetic domains are generated instead.
    #[arg(long, env = "DOMUX_DOMAIN_FILE")]
    domain_file: Option<PathBuf>,

    /// Training examples per synthetic domain.
    #[arg(long, env = "DOMUX_SYNTHETIC_SIZES", value_delimiter = ',', default_value = "100,400,500")]
    synthetic_sizes: Vec<usize>,

    /// Starting error rate (0..1) per synthetic domain; the last value repeats.
    #[arg(long, env = "DOMUX_SYNTHETIC_DIFFICULTY", value_delimiter = ',', default_value = "0.9,0.5,0.2")]
    synthetic_difficulty: Vec<f64>,

    #[arg(long, env = "DOMUX_SYNTHETIC_MAX_LEN", default_value_t = 12)]
    synthetic_max_len: usize,

    #[arg(long, env = "DOMUX_VOCAB", default_value_t = 64)]
    vocab: usize,

    /// Multiplier applied to a domain's error rate each time it is trained on.
    #[arg(long, env = "DOMUX_LEARN_DECAY", default_value_t = 0.999)]
    learn_decay: f64,

    #[arg(long, env = "DOMUX_TEMPERATURE", default_value = "1")]
    temperature: Temperature,

    #[arg(long, env = "DOMUX_MAX_SAMPLE_TOKENS", default_value_t = 1024)]
    max_sample_tokens: usize,

    #[arg(long, env = "DOMUX_REWARD_TYPE", default_value = "enttp")]
    reward_type: RewardKind,

    #[arg(long = "K", env = "DOMUX_K", default_value_t = 10)]
    k: usize,

    #[arg(long, env = "DOMUX_UPDATE_SAMPLING_INTERVAL", default_value_t = 2000)]
    update_sampling_interval: u64,

    #[arg(long, env = "DOMUX_DATA_ACTOR_OPTIM_STEP", default_value_t = 200)]
    data_actor_optim_step: usize,

    #[arg(long, env = "DOMUX_DATA_ACTOR_LR", default_value_t = 1e-4)]
    data_actor_lr: f64,

    #[arg(long, env = "DOMUX_DATA_ACTOR_OPTIMIZER", default_value = "adam")]
    data_actor_optimizer: OptimizerKind,

    #[arg(long, env = "DOMUX_SAMPLE_PROB_LOG")]
    sample_prob_log: Option<PathBuf>,

    #[arg(long, env = "DOMUX_PRETRAIN_STEP_CAP", default_value_t = 1_000_000)]
    pretrain_step_cap: usize,

    #[arg(long, env = "DOMUX_PRETRAIN_EPSILON", default_value_t = 1e-8)]
    pretrain_epsilon: f64,

    #[arg(long, env = "DOMUX_REWARD_TRIAL_BUDGET_MS")]
    reward_trial_budget_ms: Option<u64>,

    #[arg(long, env = "DOMUX_TRANSIENT_RETRIES", default_value_t = 1)]
    transient_retries: u32,

    #[arg(long, env = "DOMUX_SEED", default_value_t = 1)]
    seed: u64,

    #[arg(long, env = "DOMUX_METRICS_EVERY_STEPS", default_value_t = 5000)]
    metrics_every_steps: u64,
}

impl Args {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            temperature: self.temperature,
            max_sample_tokens: self.max_sample_tokens,
            domain_file: self.domain_file.clone().unwrap_or_default(),
            reward_type: self.reward_type,
            k: self.k,
            update_sampling_interval: self.update_sampling_interval,
            data_actor_optim_step: self.data_actor_optim_step,
            data_actor_lr: self.data_actor_lr,
            data_actor_optimizer: self.data_actor_optimizer,
            sample_prob_log: self.sample_prob_log.clone(),
            pretrain_step_cap: self.pretrain_step_cap,
            pretrain_epsilon: self.pretrain_epsilon,
            seed: self.seed,
            reward_trial_budget_ms: self.reward_trial_budget_ms,
            transient_retries: self.transient_retries,
        }
    }
}

struct ToyModel {
    vocab: usize,
    error_rate: Vec<f64>,
    learn_decay: f64,
    mode: EvalMode,
    rng: ChaCha8Rng,
}

impl ToyModel {
    /// One "optimizer step" on `batch`: the domain it came from gets a little easier.
    fn learn(&mut self, batch: &Batch) {
        if let Some(rate) = self.error_rate.get_mut(batch.domain) {
            *rate *= self.learn_decay;
        }
    }
}

impl HostModel for ToyModel {
    type Output = Array3<f64>;

    fn mode(&self) -> EvalMode {
        self.mode
    }

    fn set_mode(&mut self, mode: EvalMode) {
        self.mode = mode;
    }

    fn forward(&mut self, batch: &Batch) -> Result<Self::Output, ModelError> {
        let base = self.error_rate.get(batch.domain).copied().ok_or_else(|| {
            ModelError::Fatal(format!("no such domain index {}", batch.domain))
        })?;
        let (rows, cols) = batch.target.dim();
        let floor = 1.0 / self.vocab as f64;
        let mut out = Array3::zeros((rows, cols, self.vocab));
        for ((r, c), &tok) in batch.target.indexed_iter() {
            let jitter = match self.mode {
                EvalMode::Stochastic => self.rng.gen_range(-0.5f64..0.5) * base,
                EvalMode::Deterministic => 0.0,
            };
            let confidence = (1.0 - base + jitter).clamp(floor, 0.999);
            let rest = (1.0 - confidence) / (self.vocab - 1) as f64;
            let hit = tok as usize % self.vocab;
            for v in 0..self.vocab {
                out[[r, c, v]] = if v == hit { confidence } else { rest };
            }
        }
        Ok(out)
    }

    fn normalized_probabilities(&self, output: &Self::Output, log_space: bool) -> Array3<f64> {
        if log_space {
            output.mapv(f64::ln)
        } else {
            output.clone()
        }
    }
}

struct ToyCriterion;

impl Criterion<ToyModel> for ToyCriterion {
    fn evaluate(&self, model: &mut ToyModel, batch: &Batch) -> Result<CriterionOutput, ModelError> {
        let probs = model.forward(batch)?;
        let mut loss = 0.0;
        for ((r, c), &tok) in batch.target.indexed_iter() {
            if tok != batch.pad {
                loss -= probs[[r, c, tok as usize % model.vocab]].ln();
            }
        }
        Ok(CriterionOutput {
            loss,
            ntokens: batch.ntokens,
            metadata: BTreeMap::new(),
        })
    }
}

fn synthetic_corpora(args: &Args, symbols: SpecialSymbols) -> Vec<DomainCorpus> {
    let mut rng = ChaCha8Rng::seed_from_u64(args.seed ^ 0x5eed);
    let first_token = symbols.pad.max(symbols.eos) + 1;
    let vocab = (args.vocab as u32).max(first_token + 1);
    let max_len = args.synthetic_max_len.max(2);

    let sequence = |rng: &mut ChaCha8Rng| -> Vec<u32> {
        let len = rng.gen_range(1..max_len);
        let mut tokens: Vec<u32> = (0..len).map(|_| rng.gen_range(first_token..vocab)).collect();
        tokens.push(symbols.eos);
        tokens
    };

    args.synthetic_sizes
        .iter()
        .enumerate()
        .map(|(i, &size)| {
            let train = (0..size)
                .map(|_| Example::new(sequence(&mut rng), sequence(&mut rng)))
                .collect();
            let probe = (0..size.clamp(1, 32))
                .map(|_| Example::new(sequence(&mut rng), sequence(&mut rng)))
                .collect();
            DomainCorpus::new(format!("synth{i}"), train, probe)
        })
        .collect()
}

fn main() -> Result<()> {
    domux_observe::logging::init_tracing();
    let args = Args::parse();
    let symbols = SpecialSymbols::default();

    if args.vocab < 2 {
        anyhow::bail!("--vocab must be at least 2");
    }

    let mut controller =
        Controller::new(args.controller_config(), symbols).context("configuring controller")?;
    if let Some(path) = &args.domain_file {
        controller
            .load_dataset()
            .with_context(|| format!("loading domains listed in {}", path.display()))?;
    } else {
        controller
            .load_corpora(synthetic_corpora(&args, symbols))
            .context("loading synthetic corpora")?;
    }

    let num_domains = controller
        .multiplexer()
        .map(|m| m.num_domains())
        .unwrap_or_default();
    let last = args.synthetic_difficulty.last().copied().unwrap_or(0.5);
    let error_rate = (0..num_domains)
        .map(|i| args.synthetic_difficulty.get(i).copied().unwrap_or(last).clamp(0.0, 1.0))
        .collect();
    let mut model = ToyModel {
        vocab: args.vocab,
        error_rate,
        learn_decay: args.learn_decay,
        mode: EvalMode::Deterministic,
        rng: ChaCha8Rng::seed_from_u64(args.seed),
    };
    let criterion = ToyCriterion;

    info!(
        steps = args.steps,
        domains = num_domains,
        reward_type = %args.reward_type,
        "starting simulation"
    );
    for step in 0..args.steps {
        let outcome = controller
            .train_step(step, &mut model, &criterion)
            .with_context(|| format!("train step {step}"))?;
        model.learn(&outcome.batch);
        if args.metrics_every_steps > 0 && step > 0 && step % args.metrics_every_steps == 0 {
            controller.emit_metrics_snapshot();
        }
    }

    if let (Some(mux), Some(p)) = (controller.multiplexer(), controller.probabilities()) {
        let batches = mux.metrics();
        for (i, name) in mux.domain_names().iter().enumerate() {
            info!(
                domain = %name,
                probability = p.as_slice()[i],
                batches = batches.per_domain_batches.get(i),
                error_rate = model.error_rate[i],
                "final sampling state"
            );
        }
    }
    controller.emit_metrics_snapshot();
    controller.shutdown();
    Ok(())
}
