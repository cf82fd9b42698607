//! Training system for KL-penalised PPO.
//!
//! Provides:
//! - `ResponseSampler` - chunked, fixed-length stochastic generation
//! - `stats` - log-probabilities, values, KL-shaped rewards, GAE and whitening
//! - `KlController` - adaptive and fixed KL penalty coefficients
//! - `ppo` - clipped policy and value losses
//! - `RolloutBuffer` - one round of experience, split into mini-batches
//! - `PpoTrainer` - multi-epoch clipped updates for one round
//! - `TrainingLoop` - prompts, generation, scoring, update and logging per round

mod buffer;
mod kl;
pub mod ppo;
mod run;
mod sampler;
pub mod stats;
mod trainer;

pub use buffer::{MiniBatch, RolloutBuffer};
pub use kl::{from_config as kl_controller_from_config, AdaptiveKlController, FixedKlController, KlController};
pub use run::{PromptSource, RunSummary, TrainingLoop};
pub use sampler::ResponseSampler;
pub use trainer::{PpoTrainer, StepStats};
