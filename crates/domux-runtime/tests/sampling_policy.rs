use domux_core::types::{ProbabilityVector, RewardVector};
use domux_core::OptimizerKind;
use domux_runtime::policy::{PolicyError, SamplingPolicy};

fn target() -> ProbabilityVector {
    ProbabilityVector::new(vec![0.1, 0.4, 0.5]).unwrap()
}

fn assert_near(actual: &[f64], expected: &[f64], tol: f64) {
    for (a, e) in actual.iter().zip(expected) {
        assert!((a - e).abs() < tol, "{actual:?} vs {expected:?}");
    }
}

#[test]
fn starts_uniform() {
    let policy = SamplingPolicy::new(4, OptimizerKind::Adam, 1e-4);
    assert_near(policy.probabilities().unwrap().as_slice(), &[0.25; 4], 1e-15);
}

#[test]
fn pretraining_reaches_initial_distribution() {
    let mut policy = SamplingPolicy::new(3, OptimizerKind::Sgd, 5.0);
    let report = policy.pretrain(&target(), 100_000, 1e-8).unwrap();
    assert!(report.converged);
    assert!(report.final_loss < 1e-8);
    assert!(report.steps < 100_000);
    assert_near(policy.probabilities().unwrap().as_slice(), &[0.1, 0.4, 0.5], 1e-3);
}

#[test]
fn pretraining_with_adam_converges() {
    let mut policy = SamplingPolicy::new(3, OptimizerKind::Adam, 1e-2);
    let report = policy.pretrain(&target(), 1_000_000, 1e-8).unwrap();
    assert!(report.converged);
    assert_near(policy.probabilities().unwrap().as_slice(), &[0.1, 0.4, 0.5], 1e-3);
}

#[test]
fn pretraining_stops_at_step_cap() {
    let mut policy = SamplingPolicy::new(3, OptimizerKind::Adam, 1e-4);
    let report = policy.pretrain(&target(), 10, 1e-12).unwrap();
    assert!(!report.converged);
    assert_eq!(report.steps, 10);
    // Progress is still committed.
    assert!(policy.logits().iter().any(|&z| z != 0.0));
}

#[test]
fn pretraining_on_wrong_length_is_rejected() {
    let mut policy = SamplingPolicy::new(2, OptimizerKind::Sgd, 1.0);
    assert_eq!(
        policy.pretrain(&target(), 10, 1e-8),
        Err(PolicyError::LengthMismatch {
            expected: 2,
            actual: 3
        })
    );
}

#[test]
fn small_adam_update_moves_mass_toward_larger_rewards() {
    let mut policy = SamplingPolicy::new(3, OptimizerKind::Adam, 1e-4);
    let rewards = RewardVector::new(vec![0.1, 0.5, 0.9]).unwrap();
    let p = policy.update(&rewards, 200, 1e-4).unwrap();
    let p = p.as_slice();

    assert!(p[0] < p[1] && p[1] < p[2]);
    assert!(p[2] > 1.0 / 3.0);
    assert_near(p, &[0.3267, 0.3333, 0.3400], 1e-3);
}

#[test]
fn sgd_update_heads_for_reward_proportional_distribution() {
    let mut policy = SamplingPolicy::new(3, OptimizerKind::Sgd, 1.0);
    let rewards = RewardVector::new(vec![0.1, 0.5, 0.9]).unwrap();
    let p = policy.update(&rewards, 10, 0.5).unwrap();
    assert_near(p.as_slice(), &[0.1107, 0.3114, 0.5779], 5e-3);

    let p = policy.update(&rewards, 2_000, 0.5).unwrap();
    assert_near(p.as_slice(), &[0.1 / 1.5, 0.5 / 1.5, 0.9 / 1.5], 1e-3);
}

#[test]
fn equal_rewards_keep_uniform_policy_uniform() {
    let mut policy = SamplingPolicy::new(3, OptimizerKind::Sgd, 1.0);
    let rewards = RewardVector::new(vec![0.7, 0.7, 0.7]).unwrap();
    let p = policy.update(&rewards, 50, 0.5).unwrap();
    assert_near(p.as_slice(), &[1.0 / 3.0; 3], 1e-12);
}

#[test]
fn equal_rewards_barely_move_a_pretrained_policy() {
    let mut policy = SamplingPolicy::new(3, OptimizerKind::Sgd, 5.0);
    policy.pretrain(&target(), 100_000, 1e-8).unwrap();
    let before = policy.probabilities().unwrap();

    let rewards = RewardVector::new(vec![0.7, 0.7, 0.7]).unwrap();
    let after = policy.update(&rewards, 50, 1e-4).unwrap();
    // Equal rewards pull toward uniform, slowly at this learning rate.
    assert!(after.squared_error(&before) < 2e-6);
}

#[test]
fn update_after_pretraining_starts_from_pretrained_state() {
    let mut policy = SamplingPolicy::new(3, OptimizerKind::Sgd, 5.0);
    policy.pretrain(&target(), 100_000, 1e-8).unwrap();

    let rewards = RewardVector::new(vec![0.1, 0.5, 0.9]).unwrap();
    let p = policy.update(&rewards, 200, 1e-4).unwrap();
    assert_near(p.as_slice(), &[0.1, 0.4, 0.5], 2e-3);
}

#[test]
fn identical_inputs_give_bit_identical_policies() {
    let rewards = RewardVector::new(vec![0.3, 1.7, 0.2, 0.9]).unwrap();
    let run = || {
        let mut policy = SamplingPolicy::new(4, OptimizerKind::Adam, 1e-3);
        policy
            .pretrain(&ProbabilityVector::new(vec![0.1, 0.2, 0.3, 0.4]).unwrap(), 500, 1e-8)
            .unwrap();
        policy.update(&rewards, 200, 1e-3).unwrap();
        policy.logits().to_vec()
    };
    let a = run();
    let b = run();
    assert_eq!(
        a.iter().map(|z| z.to_bits()).collect::<Vec<_>>(),
        b.iter().map(|z| z.to_bits()).collect::<Vec<_>>()
    );
}
