use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ProbabilityError};

/// Allowed deviation of a probability vector's sum from 1.
pub const PROBABILITY_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DomainName(pub String);

impl fmt::Display for DomainName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Shaping exponent for the size-based sampling distribution.
///
/// `p_i = size_i^(1/T) / sum_j size_j^(1/T)`; `Infinite` is the uniform limit.
///
/// Serialized as a number when finite and as `"inf"` otherwise; numeric strings are
/// accepted too.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TemperatureRepr", into = "TemperatureRepr")]
pub enum Temperature {
    Finite(f64),
    Infinite,
}

impl Temperature {
    pub fn finite(value: f64) -> Result<Self, ConfigError> {
        if value.is_finite() && value > 0.0 {
            Ok(Temperature::Finite(value))
        } else {
            Err(ConfigError::InvalidTemperature(value.to_string()))
        }
    }

    /// Rejects a hand-built `Finite` value that is not a positive finite number.
    pub fn validate(self) -> Result<Self, ConfigError> {
        match self {
            Temperature::Finite(t) => Temperature::finite(t),
            Temperature::Infinite => Ok(self),
        }
    }

    /// The exponent applied to each domain size.
    pub fn exponent(&self) -> f64 {
        match self {
            Temperature::Finite(t) => 1.0 / t,
            Temperature::Infinite => 0.0,
        }
    }
}

impl Default for Temperature {
    fn default() -> Self {
        Temperature::Finite(1.0)
    }
}

impl FromStr for Temperature {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "inf" | "infinite" | "infinity" => return Ok(Temperature::Infinite),
            _ => {}
        }
        let value: f64 = trimmed
            .parse()
            .map_err(|_| ConfigError::InvalidTemperature(s.to_string()))?;
        if value.is_infinite() && value > 0.0 {
            return Ok(Temperature::Infinite);
        }
        Temperature::finite(value).map_err(|_| ConfigError::InvalidTemperature(s.to_string()))
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum TemperatureRepr {
    Number(f64),
    Text(String),
}

impl TryFrom<TemperatureRepr> for Temperature {
    type Error = ConfigError;

    fn try_from(value: TemperatureRepr) -> Result<Self, Self::Error> {
        match value {
            TemperatureRepr::Number(t) if t.is_infinite() && t > 0.0 => Ok(Temperature::Infinite),
            TemperatureRepr::Number(t) => Temperature::finite(t),
            TemperatureRepr::Text(s) => s.parse(),
        }
    }
}

impl From<Temperature> for TemperatureRepr {
    fn from(value: Temperature) -> Self {
        match value {
            Temperature::Finite(t) => TemperatureRepr::Number(t),
            Temperature::Infinite => TemperatureRepr::Text("inf".to_string()),
        }
    }
}

impl fmt::Display for Temperature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Temperature::Finite(t) => write!(f, "{t}"),
            Temperature::Infinite => f.write_str("inf"),
        }
    }
}

/// Per-domain reward metric.
///
/// Closed set; names are validated when the configuration is parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RewardKind {
    /// Mean token entropy over non-padding target positions (`enttp`, alias `entropy`).
    TokenEntropy,
    /// Token entropy restricted to end-of-sequence positions (`enteos`).
    EosEntropy,
    /// One minus the mean sequence confidence (`pretp`).
    ConfidenceDeficit,
    /// One minus the mean length-normalized sequence confidence (`exptp`).
    NormalizedConfidenceDeficit,
    /// Variance of the per-position max log-probability (`vartp`).
    ConfidenceVariance,
    /// Exponentiated ratio of confidence variance to mean confidence (`comtp`).
    Composite,
    /// Host criterion loss per target token, deterministic mode (`xentropy`).
    CriterionLoss,
}

impl RewardKind {
    pub const ALL: [RewardKind; 7] = [
        RewardKind::TokenEntropy,
        RewardKind::EosEntropy,
        RewardKind::ConfidenceDeficit,
        RewardKind::NormalizedConfidenceDeficit,
        RewardKind::ConfidenceVariance,
        RewardKind::Composite,
        RewardKind::CriterionLoss,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RewardKind::TokenEntropy => "enttp",
            RewardKind::EosEntropy => "enteos",
            RewardKind::ConfidenceDeficit => "pretp",
            RewardKind::NormalizedConfidenceDeficit => "exptp",
            RewardKind::ConfidenceVariance => "vartp",
            RewardKind::Composite => "comtp",
            RewardKind::CriterionLoss => "xentropy",
        }
    }

    /// Whether the metric reads log-space probabilities from the model.
    pub fn log_space(&self) -> bool {
        !matches!(self, RewardKind::TokenEntropy | RewardKind::EosEntropy)
    }

    /// Whether the metric averages K stochastic forward passes.
    pub fn is_monte_carlo(&self) -> bool {
        !matches!(self, RewardKind::CriterionLoss)
    }
}

impl FromStr for RewardKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "entropy" | "enttp" => Ok(RewardKind::TokenEntropy),
            "enteos" => Ok(RewardKind::EosEntropy),
            "pretp" => Ok(RewardKind::ConfidenceDeficit),
            "exptp" => Ok(RewardKind::NormalizedConfidenceDeficit),
            "vartp" => Ok(RewardKind::ConfidenceVariance),
            "comtp" => Ok(RewardKind::Composite),
            "xentropy" => Ok(RewardKind::CriterionLoss),
            other => Err(ConfigError::UnknownRewardKind(other.to_string())),
        }
    }
}

impl TryFrom<String> for RewardKind {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RewardKind> for String {
    fn from(value: RewardKind) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for RewardKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Categorical distribution over domains, index-aligned with the domain list.
///
/// Invariants (checked on construction):
/// - at least one entry
/// - every entry finite and >= 0
/// - entries sum to 1 within [`PROBABILITY_TOLERANCE`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbabilityVector(Vec<f64>);

impl ProbabilityVector {
    pub fn new(values: Vec<f64>) -> Result<Self, ProbabilityError> {
        if values.is_empty() {
            return Err(ProbabilityError::Empty);
        }
        for (index, &value) in values.iter().enumerate() {
            if !value.is_finite() {
                return Err(ProbabilityError::NonFinite { index });
            }
            if value < 0.0 {
                return Err(ProbabilityError::Negative { index, value });
            }
        }
        let sum: f64 = values.iter().sum();
        if (sum - 1.0).abs() > PROBABILITY_TOLERANCE {
            return Err(ProbabilityError::Sum { sum });
        }
        Ok(Self(values))
    }

    pub fn uniform(len: usize) -> Result<Self, ProbabilityError> {
        if len == 0 {
            return Err(ProbabilityError::Empty);
        }
        Ok(Self(vec![1.0 / len as f64; len]))
    }

    /// Size-based distribution shaped by `temperature`, which must already have passed
    /// [`Temperature::validate`].
    pub fn from_sizes(sizes: &[u64], temperature: Temperature) -> Result<Self, ProbabilityError> {
        if sizes.is_empty() {
            return Err(ProbabilityError::Empty);
        }
        let weights: Vec<f64> = match temperature {
            Temperature::Infinite => return Self::uniform(sizes.len()),
            Temperature::Finite(t) if t == 1.0 => sizes.iter().map(|&s| s as f64).collect(),
            Temperature::Finite(_) => {
                let exponent = temperature.exponent();
                sizes.iter().map(|&s| (s as f64).powf(exponent)).collect()
            }
        };
        let total: f64 = weights.iter().sum();
        if !(total.is_finite() && total > 0.0) {
            return Err(ProbabilityError::Sum { sum: total });
        }
        Self::new(weights.into_iter().map(|w| w / total).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn get(&self, index: usize) -> Option<f64> {
        self.0.get(index).copied()
    }

    pub fn into_inner(self) -> Vec<f64> {
        self.0
    }

    /// Sum of squared differences against another vector of the same length.
    pub fn squared_error(&self, other: &ProbabilityVector) -> f64 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum()
    }
}

/// One reward per domain; higher means "sample this domain more".
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RewardVector(Vec<f64>);

impl RewardVector {
    pub fn new(values: Vec<f64>) -> Result<Self, ProbabilityError> {
        if values.is_empty() {
            return Err(ProbabilityError::Empty);
        }
        if let Some(index) = values.iter().position(|v| !v.is_finite()) {
            return Err(ProbabilityError::NonFinite { index });
        }
        Ok(Self(values))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temperature_parses_sentinels_and_numbers() {
        assert_eq!("inf".parse::<Temperature>().unwrap(), Temperature::Infinite);
        assert_eq!(
            "Infinite".parse::<Temperature>().unwrap(),
            Temperature::Infinite
        );
        assert_eq!(
            "2.5".parse::<Temperature>().unwrap(),
            Temperature::Finite(2.5)
        );
    }

    #[test]
    fn temperature_rejects_non_positive() {
        for bad in ["0", "-1", "nan", "", "warm"] {
            assert!(
                matches!(
                    bad.parse::<Temperature>(),
                    Err(ConfigError::InvalidTemperature(_))
                ),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn reward_kind_accepts_entropy_alias() {
        assert_eq!(
            "entropy".parse::<RewardKind>().unwrap(),
            RewardKind::TokenEntropy
        );
        for kind in RewardKind::ALL {
            assert_eq!(kind.as_str().parse::<RewardKind>().unwrap(), kind);
        }
    }

    #[test]
    fn reward_kind_rejects_unknown_name() {
        let err = "bleu".parse::<RewardKind>().unwrap_err();
        assert!(matches!(err, ConfigError::UnknownRewardKind(name) if name == "bleu"));
    }
}
