//! Configuration options shared by all attention implementations.
//!
//! [`Config`] selects which aggregation path the block runs and how the
//! normaliser is stabilised. The defaults can be overridden at run time with
//! `NOVA_ATTENTION_PATH` and `NOVA_ATTENTION_PRECISION`.

use std::{env, fmt, str::FromStr};

use super::AttentionError;

/// Added to every normaliser so it never reaches exactly zero.
pub const DEFAULT_NORMALIZER_EPSILON: f64 = 1e-6;

pub const PATH_ENV: &str = "NOVA_ATTENTION_PATH";
pub const PRECISION_ENV: &str = "NOVA_ATTENTION_PRECISION";

/// Aggregation strategy used to turn kernel features into attention output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttentionPath {
    /// Causal linear attention via running prefix sums, `O(n)`.
    #[default]
    Causal,
    /// Causal attention through an explicit `n × n` kernel score matrix.
    CausalQuadratic,
    /// Unmasked linear attention; every query sees every key.
    Bidirectional,
}

impl AttentionPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttentionPath::Causal => "causal",
            AttentionPath::CausalQuadratic => "causal-quadratic",
            AttentionPath::Bidirectional => "bidirectional",
        }
    }

    /// Whether query `i` is restricted to keys `j <= i`.
    pub fn is_causal(&self) -> bool {
        !matches!(self, AttentionPath::Bidirectional)
    }
}

impl fmt::Display for AttentionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttentionPath {
    type Err = AttentionError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "causal" | "prefix" => Ok(AttentionPath::Causal),
            "causal-quadratic" | "causal_quadratic" | "masked" => {
                Ok(AttentionPath::CausalQuadratic)
            }
            "bidirectional" | "linear" => Ok(AttentionPath::Bidirectional),
            other => Err(AttentionError::InvalidConfig {
                message: format!("unknown attention path '{other}'"),
            }),
        }
    }
}

/// Dtype handling for the attention algebra.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrecisionPolicy {
    /// Promote inputs to `f32` and cast the result back.
    #[default]
    ForceF32,
    /// Compute in the input dtype. Host-side prefix kernels still accumulate
    /// in `f32`.
    Inherit,
}

impl FromStr for PrecisionPolicy {
    type Err = AttentionError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "f32" | "force-f32" | "force_f32" => Ok(PrecisionPolicy::ForceF32),
            "inherit" => Ok(PrecisionPolicy::Inherit),
            other => Err(AttentionError::InvalidConfig {
                message: format!("unknown precision policy '{other}'"),
            }),
        }
    }
}

/// Configuration driving attention behaviour.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub path: AttentionPath,
    /// ε in `1 / (Q′·ΣK′ + ε)`.
    pub normalizer_epsilon: f64,
    pub precision: PrecisionPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path: AttentionPath::default(),
            normalizer_epsilon: DEFAULT_NORMALIZER_EPSILON,
            precision: PrecisionPolicy::default(),
        }
    }
}

impl Config {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Applies `NOVA_ATTENTION_PATH` / `NOVA_ATTENTION_PRECISION` when set.
    /// Unparseable values are logged and ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(raw) = env::var(PATH_ENV) {
            match raw.parse() {
                Ok(path) => self.path = path,
                Err(err) => log::warn!("ignoring {PATH_ENV}={raw}: {err}"),
            }
        }
        if let Ok(raw) = env::var(PRECISION_ENV) {
            match raw.parse() {
                Ok(precision) => self.precision = precision,
                Err(err) => log::warn!("ignoring {PRECISION_ENV}={raw}: {err}"),
            }
        }
    }

    pub fn validate(&self) -> Result<(), AttentionError> {
        if !(self.normalizer_epsilon.is_finite() && self.normalizer_epsilon > 0.0) {
            return Err(AttentionError::InvalidConfig {
                message: format!(
                    "normalizer_epsilon must be positive and finite, got {}",
                    self.normalizer_epsilon
                ),
            });
        }
        Ok(())
    }
}
