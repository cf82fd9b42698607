//! Reward scoring.
//!
//! The scorer itself is external; this module adapts it to rollouts:
//! decode, join prompt and response text, score in chunks, and pick the
//! designated output channel as the reward.

use crate::tokenizer::Tokenizer;
use crate::{Result, RlhfError};
use std::collections::HashSet;

/// Maps texts to per-channel scores (e.g. classifier logits).
pub trait RewardScorer {
    /// Score a batch of texts, returning one output vector per text.
    fn score(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Decoded texts and rewards for a round, index-aligned with the rollouts.
#[derive(Clone, Debug, Default)]
pub struct ScoredRollouts {
    pub query_texts: Vec<String>,
    pub response_texts: Vec<String>,
    pub rewards: Vec<f32>,
}

/// Join decoded prompt and response text into one scorer input.
///
/// A single space is inserted only when neither side supplies whitespace at the seam.
pub fn join_texts(query: &str, response: &str) -> String {
    let needs_space = !query.is_empty()
        && !response.is_empty()
        && !query.ends_with(char::is_whitespace)
        && !response.starts_with(char::is_whitespace);
    if needs_space {
        format!("{query} {response}")
    } else {
        format!("{query}{response}")
    }
}

/// Score each `(query, response)` pair.
///
/// Inputs go through the scorer in consecutive chunks of at most
/// `forward_batch_size`; the reward is output channel `channel`, unnormalised.
pub fn score_rollouts<T, S>(
    tokenizer: &T,
    scorer: &S,
    queries: &[Vec<u32>],
    responses: &[Vec<u32>],
    forward_batch_size: usize,
    channel: usize,
) -> Result<ScoredRollouts>
where
    T: Tokenizer + ?Sized,
    S: RewardScorer + ?Sized,
{
    if queries.len() != responses.len() {
        return Err(RlhfError::ShapeMismatch {
            expected: vec![queries.len()],
            actual: vec![responses.len()],
        });
    }
    if forward_batch_size == 0 {
        return Err(RlhfError::Config("forward_batch_size must be positive".into()));
    }

    let query_texts = queries
        .iter()
        .map(|q| tokenizer.decode(q))
        .collect::<Result<Vec<_>>>()?;
    let response_texts = responses
        .iter()
        .map(|r| tokenizer.decode(r))
        .collect::<Result<Vec<_>>>()?;
    let texts: Vec<String> = query_texts
        .iter()
        .zip(&response_texts)
        .map(|(q, r)| join_texts(q, r))
        .collect();

    let mut rewards = Vec::with_capacity(texts.len());
    for chunk in texts.chunks(forward_batch_size) {
        let outputs = scorer.score(chunk)?;
        if outputs.len() != chunk.len() {
            return Err(RlhfError::Scorer(format!(
                "scorer returned {} outputs for {} inputs",
                outputs.len(),
                chunk.len()
            )));
        }
        for output in outputs {
            let reward = *output.get(channel).ok_or_else(|| {
                RlhfError::Scorer(format!(
                    "scorer output has {} channels, reward channel is {channel}",
                    output.len()
                ))
            })?;
            if !reward.is_finite() {
                return Err(RlhfError::Scorer(format!("non-finite reward {reward}")));
            }
            rewards.push(reward);
        }
    }

    Ok(ScoredRollouts {
        query_texts,
        response_texts,
        rewards,
    })
}

/// Deterministic two-channel scorer: `[negative, positive]` from keyword counts.
///
/// The positive logit is `scale * (positive hits - negative hits)`, and the
/// negative logit is its negation.
#[derive(Clone, Debug)]
pub struct KeywordScorer {
    positive: HashSet<String>,
    negative: HashSet<String>,
    scale: f32,
}

impl KeywordScorer {
    pub fn new<'a>(
        positive: impl IntoIterator<Item = &'a str>,
        negative: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        Self {
            positive: positive.into_iter().map(str::to_lowercase).collect(),
            negative: negative.into_iter().map(str::to_lowercase).collect(),
            scale: 1.0,
        }
    }

    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale = scale;
        self
    }

    fn logits(&self, text: &str) -> Vec<f32> {
        let mut balance = 0i32;
        for word in text.split_whitespace() {
            let word = word
                .trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase();
            if self.positive.contains(&word) {
                balance += 1;
            } else if self.negative.contains(&word) {
                balance -= 1;
            }
        }
        let positive = self.scale * balance as f32;
        vec![-positive, positive]
    }
}

impl RewardScorer for KeywordScorer {
    fn score(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|text| self.logits(text)).collect())
    }
}
