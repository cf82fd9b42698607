//! Round orchestration: prompts, generation, scoring, update, logging.

use super::trainer::{PpoTrainer, StepStats};
use crate::log::{MetricLogger, NoOpLogger, Table};
use crate::policy::{HasVarMap, SequencePolicy};
use crate::reward::{score_rollouts, RewardScorer};
use crate::tokenizer::Tokenizer;
use crate::{Result, RlhfError};
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::Array1;
use rand::seq::SliceRandom;
use rand::Rng;
use std::time::Instant;

/// Fixed-length tokenised prompts to draw rounds from.
#[derive(Clone, Debug)]
pub struct PromptSource {
    prompts: Vec<Vec<u32>>,
    txt_in_len: usize,
}

impl PromptSource {
    /// Wrap pre-tokenised prompts; every prompt must have exactly `txt_in_len` tokens.
    pub fn new(prompts: Vec<Vec<u32>>, txt_in_len: usize) -> Result<Self> {
        if prompts.is_empty() {
            return Err(RlhfError::Config("prompt source is empty".into()));
        }
        if let Some(bad) = prompts.iter().find(|p| p.len() != txt_in_len) {
            return Err(RlhfError::ShapeMismatch {
                expected: vec![txt_in_len],
                actual: vec![bad.len()],
            });
        }
        Ok(Self {
            prompts,
            txt_in_len,
        })
    }

    /// Tokenise `texts`, drop those shorter than `txt_in_len` and truncate the rest.
    pub fn from_texts<'a, T: Tokenizer + ?Sized>(
        tokenizer: &T,
        texts: impl IntoIterator<Item = &'a str>,
        txt_in_len: usize,
    ) -> Result<Self> {
        let mut prompts = Vec::new();
        for text in texts {
            let mut ids = tokenizer.encode(text)?;
            if ids.len() >= txt_in_len {
                ids.truncate(txt_in_len);
                prompts.push(ids);
            }
        }
        if prompts.is_empty() {
            return Err(RlhfError::Config(format!(
                "no text has at least {txt_in_len} tokens"
            )));
        }
        Self::new(prompts, txt_in_len)
    }

    pub fn len(&self) -> usize {
        self.prompts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }

    pub fn txt_in_len(&self) -> usize {
        self.txt_in_len
    }

    /// Draw `n` prompts uniformly; without replacement when the source is large enough.
    pub fn sample<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Vec<Vec<u32>> {
        if n <= self.prompts.len() {
            self.prompts.choose_multiple(rng, n).cloned().collect()
        } else {
            (0..n)
                .map(|_| self.prompts[rng.gen_range(0..self.prompts.len())].clone())
                .collect()
        }
    }
}

/// Result of a completed run.
#[derive(Clone, Debug, Default)]
pub struct RunSummary {
    /// Rounds executed
    pub rounds: usize,
    /// KL coefficient after the last update
    pub final_kl_coef: f64,
    /// Mean scorer reward per round
    pub mean_rewards: Vec<f64>,
    /// Round KL per round
    pub kl_means: Vec<f64>,
}

/// Sequential training loop over `ceil(steps / batch_size)` rounds.
pub struct TrainingLoop<P, R, T, S>
where
    P: SequencePolicy + HasVarMap,
    R: SequencePolicy,
    T: Tokenizer,
    S: RewardScorer,
{
    trainer: PpoTrainer<P, R>,
    tokenizer: T,
    scorer: S,
    prompts: PromptSource,
    logger: Box<dyn MetricLogger>,
    show_progress: bool,
}

impl<P, R, T, S> TrainingLoop<P, R, T, S>
where
    P: SequencePolicy + HasVarMap,
    R: SequencePolicy,
    T: Tokenizer,
    S: RewardScorer,
{
    pub fn new(
        trainer: PpoTrainer<P, R>,
        tokenizer: T,
        scorer: S,
        prompts: PromptSource,
    ) -> Result<Self> {
        let txt_in_len = trainer.config().txt_in_len;
        if prompts.txt_in_len() != txt_in_len {
            return Err(RlhfError::ShapeMismatch {
                expected: vec![txt_in_len],
                actual: vec![prompts.txt_in_len()],
            });
        }
        Ok(Self {
            trainer,
            tokenizer,
            scorer,
            prompts,
            logger: Box::new(NoOpLogger),
            show_progress: false,
        })
    }

    pub fn with_logger(mut self, logger: Box<dyn MetricLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    pub fn trainer(&self) -> &PpoTrainer<P, R> {
        &self.trainer
    }

    pub fn into_trainer(self) -> PpoTrainer<P, R> {
        self.trainer
    }

    /// Run every round, stopping at the first error.
    pub fn run(&mut self) -> Result<RunSummary> {
        let rounds = self.trainer.config().num_rounds();
        let progress = self.progress_bar(rounds as u64);
        let mut summary = RunSummary::default();

        tracing::info!(
            rounds,
            batch_size = self.trainer.config().batch_size,
            prompts = self.prompts.len(),
            "Starting PPO fine-tuning"
        );

        for round in 0..rounds {
            let (stats, reward_mean) = match self.run_round(round as u64) {
                Ok(result) => result,
                Err(err) => {
                    progress.abandon_with_message(format!("round {round} failed"));
                    self.logger.close();
                    return Err(err);
                }
            };

            summary.rounds += 1;
            summary.mean_rewards.push(reward_mean);
            summary.kl_means.push(stats.kl_mean);

            progress.inc(1);
            progress.set_message(format!(
                "Reward: {:.3} KL: {:.3} Coef: {:.4}",
                reward_mean,
                stats.kl_mean,
                self.trainer.kl_coef()
            ));
            if progress.is_hidden() {
                tracing::info!(
                    round,
                    reward = reward_mean,
                    kl = stats.kl_mean,
                    kl_coef = self.trainer.kl_coef(),
                    "Round complete"
                );
            }
        }

        summary.final_kl_coef = self.trainer.kl_coef();
        progress.finish_with_message("Training complete");
        self.logger.close();
        Ok(summary)
    }

    fn run_round(&mut self, round: u64) -> Result<(StepStats, f64)> {
        let round_start = Instant::now();
        let config = self.trainer.config().clone();

        let queries = self
            .prompts
            .sample(config.batch_size, self.trainer.rng_mut());

        let timer = Instant::now();
        let responses = self.trainer.generate(&queries)?;
        let time_get_response = timer.elapsed().as_secs_f64();

        let timer = Instant::now();
        let scored = score_rollouts(
            &self.tokenizer,
            &self.scorer,
            &queries,
            &responses,
            config.forward_batch_size,
            config.reward_channel,
        )?;
        let time_get_scores = timer.elapsed().as_secs_f64();

        let game_log = Table {
            columns: vec!["query".into(), "response".into(), "reward".into()],
            rows: scored
                .query_texts
                .iter()
                .zip(&scored.response_texts)
                .zip(&scored.rewards)
                .map(|((q, r), reward)| vec![q.clone(), r.clone(), format!("{reward:.4}")])
                .collect(),
        };
        let (reward_mean, reward_std) = mean_std(&scored.rewards);

        let timer = Instant::now();
        let stats = self.trainer.step(queries, responses, scored.rewards)?;
        let time_optimization = timer.elapsed().as_secs_f64();

        let mut metrics = stats.to_metrics();
        metrics.insert("env/reward_mean".into(), reward_mean);
        metrics.insert("env/reward_std".into(), reward_std);
        metrics.insert("time/get_response".into(), time_get_response);
        metrics.insert("time/get_scores".into(), time_get_scores);
        metrics.insert("time/optimization".into(), time_optimization);
        metrics.insert("time/round".into(), round_start.elapsed().as_secs_f64());

        self.logger.log_metrics(&metrics, round);
        self.logger.log_table("game_log", &game_log, round);

        Ok((stats, reward_mean))
    }

    fn progress_bar(&self, rounds: u64) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(rounds);
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");
        pb.set_style(style);
        pb
    }
}

/// Mean and population standard deviation
fn mean_std(values: &[f32]) -> (f64, f64) {
    let values = Array1::from_iter(values.iter().map(|&v| f64::from(v)));
    match values.mean() {
        Some(mean) => (mean, values.std(0.0)),
        None => (0.0, 0.0),
    }
}
