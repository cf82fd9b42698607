//! # rlhf
//!
//! Fine-tune a generative sequence policy against a reward scorer with
//! KL-penalised Proximal Policy Optimization.
//!
//! ## Overview
//!
//! Each round of training:
//! - samples fixed-length continuations from the trainable policy (`training::ResponseSampler`)
//! - scores `prompt ++ response` text with an external scorer (`reward::score_rollouts`)
//! - computes per-token log-probabilities, values, KL against a frozen
//!   reference policy, GAE advantages and returns (`training::stats`)
//! - runs several epochs of clipped PPO updates (`training::PpoTrainer`)
//! - adapts the KL penalty coefficient toward a target (`training::AdaptiveKlController`)
//!
//! The sequence model, scorer and tokenizer are collaborators behind the
//! `SequencePolicy`, `RewardScorer` and `Tokenizer` traits. Small reference
//! implementations (`TinyLm`, `KeywordScorer`, `WordTokenizer`) are bundled so
//! the loop can be run end to end; `HfTokenizer` loads any `tokenizer.json`.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use rlhf::prelude::*;
//!
//! let config = PpoConfig::default().with_batch_size(8, 4);
//! config.validate()?;
//!
//! let policy = TinyLm::new(TinyLmConfig::new(tokenizer.vocab_size()), &Device::Cpu)?;
//! let reference = policy.frozen_copy()?;
//! let trainer = PpoTrainer::new(policy, reference, config.clone())?;
//!
//! let prompts = PromptSource::from_texts(&tokenizer, corpus.iter().map(String::as_str), config.txt_in_len)?;
//! let summary = TrainingLoop::new(trainer, tokenizer, scorer, prompts)?
//!     .with_logger(Box::new(ConsoleLogger::new()))
//!     .run()?;
//! ```

pub mod config;
pub mod log;
pub mod policy;
pub mod reward;
pub mod tokenizer;
pub mod training;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::PpoConfig;
    pub use crate::log::{CompositeLogger, ConsoleLogger, MemoryLogger, MetricLogger, NoOpLogger};
    pub use crate::policy::{HasVarMap, PolicyOutput, SequencePolicy, TinyLm, TinyLmConfig};
    pub use crate::reward::{KeywordScorer, RewardScorer};
    pub use crate::tokenizer::{HfTokenizer, Tokenizer, WordTokenizer};
    pub use crate::training::{
        AdaptiveKlController, FixedKlController, KlController, PpoTrainer, PromptSource,
        RunSummary, StepStats, TrainingLoop,
    };
    pub use crate::{Result, RlhfError};

    #[cfg(feature = "tensorboard")]
    pub use crate::log::TensorBoardLogger;

    pub use candle_core::Device;
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Error types for the library
#[derive(Debug, thiserror::Error)]
pub enum RlhfError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Non-finite loss {loss} at epoch {epoch}, minibatch {minibatch}")]
    NonFiniteLoss {
        epoch: usize,
        minibatch: usize,
        loss: f64,
    },

    #[error("Sampling error: {0}")]
    Sampling(String),

    #[error("Scorer error: {0}")]
    Scorer(String),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RlhfError>;
