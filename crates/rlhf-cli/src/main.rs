//! rlhf CLI
//!
//! Command-line driver for KL-penalised PPO fine-tuning on the bundled
//! toy collaborators.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use rlhf::prelude::*;

/// Built-in prompt corpus for demonstration runs
const CORPUS: &[&str] = &[
    "this movie was a story about a small town and its people",
    "the film opens with a long shot of the city at night",
    "i went to see this picture with my friends last week",
    "the acting in this movie is something you have to see",
    "from the first scene the director makes it clear that",
    "the plot of this film follows two brothers who travel",
    "my favourite part of the movie was the ending because",
    "the soundtrack and the camera work in this film are",
    "after watching this movie for the second time i think",
    "the story is great fun and the cast is wonderful",
    "the script is dull and the pacing is bad and boring",
    "this film is a wonderful and great piece of cinema",
    "the characters are awful and the dialogue is terrible",
    "a fun and brilliant movie with a great cast",
];

const POSITIVE_WORDS: &[&str] = &["great", "fun", "wonderful", "brilliant", "good", "love"];
const NEGATIVE_WORDS: &[&str] = &["bad", "dull", "awful", "terrible", "boring", "worst"];

#[derive(Parser)]
#[command(name = "rlhf-tune")]
#[command(version, about = "rlhf - KL-penalised PPO fine-tuning", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fine-tune the bundled toy policy against the keyword scorer
    Train {
        /// JSON configuration file (missing fields take defaults)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Total rollouts to train on
        #[arg(long)]
        steps: Option<usize>,

        /// Rollouts per round
        #[arg(long)]
        batch_size: Option<usize>,

        /// Chunk limit for forward passes
        #[arg(long)]
        forward_batch_size: Option<usize>,

        /// Rollouts per gradient step
        #[arg(long)]
        mini_batch_size: Option<usize>,

        /// PPO epochs per round
        #[arg(long)]
        ppo_epochs: Option<usize>,

        /// Prompt length in tokens
        #[arg(long)]
        txt_in_len: Option<usize>,

        /// Response length in tokens
        #[arg(long)]
        txt_out_len: Option<usize>,

        /// Learning rate
        #[arg(long)]
        lr: Option<f64>,

        /// Initial KL coefficient
        #[arg(long)]
        init_kl_coef: Option<f64>,

        /// Target round KL
        #[arg(long)]
        target: Option<f64>,

        /// Keep the KL coefficient fixed
        #[arg(long)]
        fixed_kl: bool,

        /// Random seed
        #[arg(long)]
        seed: Option<u64>,

        /// `tokenizer.json` to use instead of the built-in word vocabulary
        #[arg(long)]
        tokenizer: Option<PathBuf>,

        /// Hidden size of the toy policy
        #[arg(long, default_value = "32")]
        hidden_size: usize,

        /// Show a progress bar
        #[arg(long)]
        progress: bool,

        /// Directory for TensorBoard event files
        #[cfg(feature = "tensorboard")]
        #[arg(long)]
        tensorboard: Option<PathBuf>,
    },

    /// Print the default configuration as JSON
    Config,

    /// Load and validate a configuration file
    Validate {
        /// JSON configuration file
        file: PathBuf,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train {
            config,
            steps,
            batch_size,
            forward_batch_size,
            mini_batch_size,
            ppo_epochs,
            txt_in_len,
            txt_out_len,
            lr,
            init_kl_coef,
            target,
            fixed_kl,
            seed,
            tokenizer,
            hidden_size,
            progress,
            #[cfg(feature = "tensorboard")]
            tensorboard,
        } => {
            let mut config = match config {
                Some(path) => PpoConfig::from_json_file(&path)
                    .with_context(|| format!("failed to load {}", path.display()))?,
                None => PpoConfig::default(),
            };
            override_field(&mut config.steps, steps);
            override_field(&mut config.batch_size, batch_size);
            override_field(&mut config.forward_batch_size, forward_batch_size);
            override_field(&mut config.mini_batch_size, mini_batch_size);
            override_field(&mut config.ppo_epochs, ppo_epochs);
            override_field(&mut config.txt_in_len, txt_in_len);
            override_field(&mut config.txt_out_len, txt_out_len);
            override_field(&mut config.lr, lr);
            override_field(&mut config.init_kl_coef, init_kl_coef);
            override_field(&mut config.target, target);
            override_field(&mut config.seed, seed);
            if fixed_kl {
                config.adap_kl_ctrl = false;
            }

            #[allow(unused_mut)]
            let mut logger = CompositeLogger::new(vec![Box::new(ConsoleLogger::new())]);
            #[cfg(feature = "tensorboard")]
            {
                if let Some(dir) = tensorboard {
                    logger.add(Box::new(TensorBoardLogger::new(dir)));
                }
            }

            config.validate()?;
            let logger = Box::new(logger);
            match tokenizer {
                Some(path) => {
                    let tokenizer = HfTokenizer::from_file(&path)
                        .with_context(|| format!("failed to load {}", path.display()))?;
                    train(config, tokenizer, hidden_size, progress, logger)?;
                }
                None => {
                    let vocabulary = CORPUS
                        .iter()
                        .chain(POSITIVE_WORDS)
                        .chain(NEGATIVE_WORDS)
                        .copied();
                    let tokenizer = WordTokenizer::from_corpus(vocabulary);
                    train(config, tokenizer, hidden_size, progress, logger)?;
                }
            }
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&PpoConfig::default())?);
        }
        Commands::Validate { file } => {
            let config = PpoConfig::from_json_file(&file)
                .with_context(|| format!("failed to load {}", file.display()))?;
            config.validate()?;
            println!(
                "Configuration OK: {} rounds of {} rollouts",
                config.num_rounds(),
                config.batch_size
            );
        }
    }

    Ok(())
}

fn override_field<T>(field: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *field = value;
    }
}

fn train<T: Tokenizer>(
    config: PpoConfig,
    tokenizer: T,
    hidden_size: usize,
    progress: bool,
    logger: Box<dyn MetricLogger>,
) -> Result<()> {
    let prompts = PromptSource::from_texts(&tokenizer, CORPUS.iter().copied(), config.txt_in_len)?;
    let scorer = KeywordScorer::new(
        POSITIVE_WORDS.iter().copied(),
        NEGATIVE_WORDS.iter().copied(),
    );

    let device = Device::Cpu;
    let model_config = TinyLmConfig::new(tokenizer.vocab_size())
        .with_hidden_size(hidden_size)
        .with_max_positions((config.txt_in_len + config.txt_out_len).max(64));
    let policy = TinyLm::new(model_config, &device)?;
    let reference = policy.frozen_copy()?;

    tracing::info!(
        vocab = tokenizer.vocab_size(),
        prompts = prompts.len(),
        params = policy.num_parameters(),
        "Created toy policy"
    );

    let trainer = PpoTrainer::new(policy, reference, config)?;
    let summary = TrainingLoop::new(trainer, tokenizer, scorer, prompts)?
        .with_logger(logger)
        .with_progress(progress)
        .run()?;

    let report = serde_json::json!({
        "rounds": summary.rounds,
        "final_kl_coef": summary.final_kl_coef,
        "mean_rewards": summary.mean_rewards,
        "kl_means": summary.kl_means,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
