//! Rollout buffer holding one round of generated experience.

use super::stats::sequence_tensor;
use crate::{Result, RlhfError};
use candle_core::{Device, Tensor};
use ndarray::{Array2, Axis};
use rand::seq::SliceRandom;
use rand::Rng;

/// One round of rollouts with per-token statistics.
///
/// Every `Array2` is `[batch, response_len]`, row-aligned with `queries`.
#[derive(Clone, Debug)]
pub struct RolloutBuffer {
    /// Prompt tokens, one row per rollout
    pub queries: Vec<Vec<u32>>,
    /// Response tokens, one row per rollout
    pub responses: Vec<Vec<u32>>,
    /// Scalar reward per rollout
    pub scores: Vec<f32>,
    /// Policy log-probabilities at collection time
    pub logprobs: Array2<f32>,
    /// Reference log-probabilities
    pub ref_logprobs: Array2<f32>,
    /// Value estimates at collection time
    pub values: Array2<f32>,
    /// Per-token `logprobs - ref_logprobs`
    pub kl: Array2<f32>,
    /// KL penalty plus the score on the final token
    pub rewards: Array2<f32>,
    /// KL penalty alone
    pub non_score_rewards: Array2<f32>,
    /// Whitened advantages
    pub advantages: Array2<f32>,
    /// Advantages before whitening
    pub raw_advantages: Array2<f32>,
    /// Returns (raw advantages + values)
    pub returns: Array2<f32>,
    /// Mean over rollouts of summed per-token KL
    pub kl_mean: f64,
}

impl RolloutBuffer {
    /// Number of rollouts
    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    /// Response length shared by every rollout
    pub fn response_len(&self) -> usize {
        self.logprobs.ncols()
    }

    /// Shuffled rollout indices split into consecutive mini-batches.
    ///
    /// A final partial mini-batch is kept when `len` is not a multiple of `mini_batch_size`.
    pub fn minibatch_indices<R: Rng + ?Sized>(
        &self,
        mini_batch_size: usize,
        rng: &mut R,
    ) -> Vec<Vec<usize>> {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.shuffle(rng);
        order
            .chunks(mini_batch_size.max(1))
            .map(<[usize]>::to_vec)
            .collect()
    }

    /// Gather the rows in `indices` into device tensors.
    pub fn minibatch(&self, indices: &[usize], device: &Device) -> Result<MiniBatch> {
        if let Some(&bad) = indices.iter().find(|&&i| i >= self.len()) {
            return Err(RlhfError::ShapeMismatch {
                expected: vec![self.len()],
                actual: vec![bad],
            });
        }

        let queries: Vec<Vec<u32>> = indices.iter().map(|&i| self.queries[i].clone()).collect();
        let responses: Vec<Vec<u32>> =
            indices.iter().map(|&i| self.responses[i].clone()).collect();

        Ok(MiniBatch {
            input_ids: sequence_tensor(&queries, &responses, device)?,
            query_len: queries.first().map(Vec::len).unwrap_or(0),
            old_logprobs: rows_tensor(&self.logprobs, indices, device)?,
            old_values: rows_tensor(&self.values, indices, device)?,
            advantages: rows_tensor(&self.advantages, indices, device)?,
            returns: rows_tensor(&self.returns, indices, device)?,
        })
    }
}

fn rows_tensor(array: &Array2<f32>, indices: &[usize], device: &Device) -> Result<Tensor> {
    let selected = array.select(Axis(0), indices);
    let shape = selected.dim();
    let data: Vec<f32> = selected.iter().copied().collect();
    Ok(Tensor::from_vec(data, shape, device)?)
}

/// A mini-batch of rollouts for one optimizer step
pub struct MiniBatch {
    /// `[m, query_len + response_len]`
    pub input_ids: Tensor,
    pub query_len: usize,
    /// `[m, response_len]`
    pub old_logprobs: Tensor,
    pub old_values: Tensor,
    pub advantages: Tensor,
    pub returns: Tensor,
}
