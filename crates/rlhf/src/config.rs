//! PPO fine-tuning configuration.

use crate::{Result, RlhfError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Configuration for a PPO fine-tuning run.
///
/// Validated once with [`PpoConfig::validate`] before any round executes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PpoConfig {
    // Schedule
    /// Total number of rollouts to train on
    pub steps: usize,
    /// Rollouts per round
    pub batch_size: usize,
    /// Chunk limit for forward passes (must divide `batch_size`)
    pub forward_batch_size: usize,
    /// Rollouts per gradient step (must divide `batch_size`)
    pub mini_batch_size: usize,
    /// Passes over the round's rollouts
    pub ppo_epochs: usize,

    // Sequence lengths
    /// Prompt length in tokens
    pub txt_in_len: usize,
    /// Response length in tokens
    pub txt_out_len: usize,

    // Optimisation
    /// Learning rate
    pub lr: f64,

    // KL control
    /// Initial KL penalty coefficient
    pub init_kl_coef: f64,
    /// Whether the KL coefficient adapts toward `target`
    pub adap_kl_ctrl: bool,
    /// Target round KL
    pub target: f64,
    /// Adaptation horizon in rollouts
    pub horizon: f64,
    /// Optional `(min, max)` clamp on the adaptive coefficient
    pub kl_coef_bounds: Option<(f64, f64)>,

    // Advantage estimation
    /// Discount factor
    pub gamma: f64,
    /// GAE lambda
    pub lam: f64,

    // PPO
    /// Policy ratio clip width
    pub cliprange: f64,
    /// Value prediction clip width
    pub cliprange_value: f64,
    /// Value loss weight
    pub vf_coef: f64,

    // Sampling
    /// Keep only the `top_k` most likely tokens (0 disables)
    pub top_k: usize,
    /// Nucleus sampling mass (1.0 disables)
    pub top_p: f64,

    // Scoring
    /// Index of the scorer output used as reward
    pub reward_channel: usize,

    /// Random seed
    pub seed: u64,
}

impl Default for PpoConfig {
    fn default() -> Self {
        Self {
            steps: 25_600,
            batch_size: 256,
            forward_batch_size: 16,
            mini_batch_size: 1,
            ppo_epochs: 4,

            txt_in_len: 5,
            txt_out_len: 15,

            lr: 1.41e-5,

            init_kl_coef: 0.2,
            adap_kl_ctrl: true,
            target: 6.0,
            horizon: 10_000.0,
            kl_coef_bounds: None,

            gamma: 1.0,
            lam: 0.95,

            cliprange: 0.2,
            cliprange_value: 0.2,
            vf_coef: 0.1,

            top_k: 0,
            top_p: 1.0,

            reward_channel: 1,

            seed: 1,
        }
    }
}

impl PpoConfig {
    /// Load a configuration from a JSON file; missing fields take defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        let config: PpoConfig = serde_json::from_reader(std::io::BufReader::new(file))?;
        Ok(config)
    }

    /// Set total rollouts to train on
    pub fn with_steps(mut self, steps: usize) -> Self {
        self.steps = steps;
        self
    }

    /// Set round size and forward chunk limit
    pub fn with_batch_size(mut self, batch_size: usize, forward_batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self.forward_batch_size = forward_batch_size;
        self
    }

    /// Set mini-batch size for gradient steps
    pub fn with_mini_batch_size(mut self, mini_batch_size: usize) -> Self {
        self.mini_batch_size = mini_batch_size;
        self
    }

    /// Set prompt and response lengths
    pub fn with_lengths(mut self, txt_in_len: usize, txt_out_len: usize) -> Self {
        self.txt_in_len = txt_in_len;
        self.txt_out_len = txt_out_len;
        self
    }

    /// Set learning rate
    pub fn with_lr(mut self, lr: f64) -> Self {
        self.lr = lr;
        self
    }

    /// Set number of PPO epochs per round
    pub fn with_ppo_epochs(mut self, ppo_epochs: usize) -> Self {
        self.ppo_epochs = ppo_epochs;
        self
    }

    /// Set KL controller parameters
    pub fn with_kl(mut self, init_kl_coef: f64, target: f64, horizon: f64) -> Self {
        self.init_kl_coef = init_kl_coef;
        self.target = target;
        self.horizon = horizon;
        self
    }

    /// Set random seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Number of rounds needed to cover `steps` rollouts
    pub fn num_rounds(&self) -> usize {
        self.steps.div_ceil(self.batch_size.max(1))
    }

    /// Number of forward chunks per round
    pub fn forward_chunks(&self) -> usize {
        self.batch_size.div_ceil(self.forward_batch_size.max(1))
    }

    /// Gradient steps per epoch
    pub fn minibatches_per_epoch(&self) -> usize {
        self.batch_size / self.mini_batch_size.max(1)
    }

    /// Check divisibility and positivity constraints
    pub fn validate(&self) -> Result<()> {
        let positive_counts = [
            ("steps", self.steps),
            ("batch_size", self.batch_size),
            ("forward_batch_size", self.forward_batch_size),
            ("mini_batch_size", self.mini_batch_size),
            ("ppo_epochs", self.ppo_epochs),
            ("txt_in_len", self.txt_in_len),
            ("txt_out_len", self.txt_out_len),
        ];
        for (name, value) in positive_counts {
            if value == 0 {
                return Err(RlhfError::Config(format!("{name} must be positive")));
            }
        }

        if self.batch_size % self.forward_batch_size != 0 {
            return Err(RlhfError::Config(format!(
                "batch_size ({}) must be a multiple of forward_batch_size ({})",
                self.batch_size, self.forward_batch_size
            )));
        }
        if self.batch_size % self.mini_batch_size != 0 {
            return Err(RlhfError::Config(format!(
                "batch_size ({}) must be a multiple of mini_batch_size ({})",
                self.batch_size, self.mini_batch_size
            )));
        }

        let positive_reals = [
            ("lr", self.lr),
            ("target", self.target),
            ("horizon", self.horizon),
            ("cliprange", self.cliprange),
            ("cliprange_value", self.cliprange_value),
        ];
        for (name, value) in positive_reals {
            if !(value.is_finite() && value > 0.0) {
                return Err(RlhfError::Config(format!(
                    "{name} must be a positive finite number, got {value}"
                )));
            }
        }

        let non_negative = [("init_kl_coef", self.init_kl_coef), ("vf_coef", self.vf_coef)];
        for (name, value) in non_negative {
            if !(value.is_finite() && value >= 0.0) {
                return Err(RlhfError::Config(format!(
                    "{name} must be non-negative, got {value}"
                )));
            }
        }

        for (name, value) in [("gamma", self.gamma), ("lam", self.lam)] {
            if !(0.0..=1.0).contains(&value) {
                return Err(RlhfError::Config(format!(
                    "{name} must lie in [0, 1], got {value}"
                )));
            }
        }

        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(RlhfError::Config(format!(
                "top_p must lie in (0, 1], got {}",
                self.top_p
            )));
        }

        if let Some((lo, hi)) = self.kl_coef_bounds {
            if !(lo.is_finite() && hi.is_finite() && lo >= 0.0 && lo <= hi) {
                return Err(RlhfError::Config(format!(
                    "kl_coef_bounds must satisfy 0 <= min <= max, got ({lo}, {hi})"
                )));
            }
        }

        Ok(())
    }
}
