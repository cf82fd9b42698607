//! End-to-end runs of the PPO loop on the bundled collaborators.

use rlhf::prelude::*;
use rlhf::log::Table;
use std::collections::HashMap;
use std::sync::Arc;

const CORPUS: &[&str] = &[
    "the film was great fun",
    "the story was dull and bad",
    "a wonderful cast and a great script",
    "the ending was bad but the music was fun",
];

/// Lets the test keep a handle on what the loop logged.
struct Shared(Arc<MemoryLogger>);

impl MetricLogger for Shared {
    fn log_scalar(&self, name: &str, value: f64, step: u64) {
        self.0.log_scalar(name, value, step);
    }
    fn log_metrics(&self, metrics: &HashMap<String, f64>, step: u64) {
        self.0.log_metrics(metrics, step);
    }
    fn log_table(&self, name: &str, table: &Table, step: u64) {
        self.0.log_table(name, table, step);
    }
}

fn config() -> PpoConfig {
    PpoConfig::default()
        .with_steps(12)
        .with_batch_size(4, 2)
        .with_mini_batch_size(2)
        .with_lengths(3, 2)
        .with_ppo_epochs(2)
        .with_lr(1e-3)
        .with_seed(7)
}

fn build(config: PpoConfig) -> TrainingLoop<TinyLm, TinyLm, WordTokenizer, KeywordScorer> {
    let tokenizer = WordTokenizer::from_corpus(CORPUS.iter().copied());
    let prompts =
        PromptSource::from_texts(&tokenizer, CORPUS.iter().copied(), config.txt_in_len).unwrap();
    let scorer = KeywordScorer::new(["great", "fun", "wonderful"], ["bad", "dull"]);

    let policy = TinyLm::new(
        TinyLmConfig::new(tokenizer.vocab_size()).with_hidden_size(8),
        &Device::Cpu,
    )
    .unwrap();
    let reference = policy.frozen_copy().unwrap();
    let trainer = PpoTrainer::new(policy, reference, config).unwrap();

    TrainingLoop::new(trainer, tokenizer, scorer, prompts).unwrap()
}

#[test]
fn test_run_executes_every_round() {
    let memory = Arc::new(MemoryLogger::new());
    let mut run = build(config()).with_logger(Box::new(Shared(memory.clone())));

    let summary = run.run().unwrap();

    assert_eq!(summary.rounds, 3);
    assert_eq!(summary.mean_rewards.len(), 3);
    assert_eq!(summary.kl_means.len(), 3);
    assert!(summary.final_kl_coef > 0.0);
    assert_eq!(summary.final_kl_coef, run.trainer().kl_coef());
    assert_eq!(run.trainer().round(), 3);

    // Policy starts identical to the reference.
    assert!(summary.kl_means[0].abs() < 1e-5);

    let names = memory.names();
    for key in [
        "env/reward_mean",
        "env/reward_std",
        "objective/kl",
        "objective/kl_coef",
        "ppo/loss/total",
        "time/get_response",
        "time/get_scores",
        "time/optimization",
        "time/round",
    ] {
        assert!(names.contains(&key.to_string()), "missing {key}");
    }
    assert_eq!(
        memory
            .series("objective/kl_coef")
            .iter()
            .map(|(step, _)| *step)
            .collect::<Vec<_>>(),
        vec![0, 1, 2]
    );

    let tables = memory.tables("game_log");
    assert_eq!(tables.len(), 3);
    let (_, table) = &tables[0];
    assert_eq!(table.columns, vec!["query", "response", "reward"]);
    assert_eq!(table.rows.len(), 4);
}

#[test]
fn test_fixed_kl_keeps_coefficient() {
    let mut config = config();
    config.adap_kl_ctrl = false;
    let summary = build(config).run().unwrap();
    assert_eq!(summary.final_kl_coef, 0.2);
}

#[test]
fn test_prompt_length_must_match_config() {
    let tokenizer = WordTokenizer::from_corpus(CORPUS.iter().copied());
    let prompts = PromptSource::from_texts(&tokenizer, CORPUS.iter().copied(), 2).unwrap();
    let scorer = KeywordScorer::new(["great"], ["bad"]);
    let policy = TinyLm::new(TinyLmConfig::new(tokenizer.vocab_size()), &Device::Cpu).unwrap();
    let reference = policy.frozen_copy().unwrap();
    let trainer = PpoTrainer::new(policy, reference, config()).unwrap();

    assert!(matches!(
        TrainingLoop::new(trainer, tokenizer, scorer, prompts),
        Err(RlhfError::ShapeMismatch { .. })
    ));
}
