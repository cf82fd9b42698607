//! Per-token statistics for a round of rollouts.
//!
//! Log-probabilities and values come from policy forward passes; KL-shaped
//! rewards, GAE advantages, returns and whitening are computed on the host
//! over `[batch, response_len]` arrays.

use crate::policy::{logprobs_from_logits, SequencePolicy};
use crate::{Result, RlhfError};
use candle_core::{Device, Tensor};
use ndarray::{Array1, Array2, ArrayView1, Axis};

/// Epsilon added to the variance before whitening
pub const WHITEN_EPS: f32 = 1e-8;

/// Response-position slices of a policy forward pass.
pub struct ResponseForward {
    /// `[batch, response_len, vocab]`
    pub logits: Tensor,
    /// `[batch, response_len]`
    pub logprobs: Tensor,
    /// `[batch, response_len]`
    pub values: Tensor,
}

/// Stack `query ++ response` rows into a `[batch, query_len + response_len]` tensor.
pub fn sequence_tensor(
    queries: &[Vec<u32>],
    responses: &[Vec<u32>],
    device: &Device,
) -> Result<Tensor> {
    if queries.len() != responses.len() {
        return Err(RlhfError::ShapeMismatch {
            expected: vec![queries.len()],
            actual: vec![responses.len()],
        });
    }
    let query_len = queries.first().map(Vec::len).unwrap_or(0);
    let response_len = responses.first().map(Vec::len).unwrap_or(0);

    let mut flat = Vec::with_capacity(queries.len() * (query_len + response_len));
    for (query, response) in queries.iter().zip(responses) {
        if query.len() != query_len || response.len() != response_len {
            return Err(RlhfError::ShapeMismatch {
                expected: vec![query_len, response_len],
                actual: vec![query.len(), response.len()],
            });
        }
        flat.extend_from_slice(query);
        flat.extend_from_slice(response);
    }

    Ok(Tensor::from_vec(
        flat,
        (queries.len(), query_len + response_len),
        device,
    )?)
}

/// Run `policy` over `input_ids` and keep the positions that scored each response token.
///
/// Response token `t` sits at index `query_len + t` and was predicted by the
/// logits (and valued by the value head) at index `query_len + t - 1`.
pub fn response_forward<P: SequencePolicy + ?Sized>(
    policy: &P,
    input_ids: &Tensor,
    query_len: usize,
) -> candle_core::Result<ResponseForward> {
    let seq_len = input_ids.dim(1)?;
    if query_len == 0 || query_len >= seq_len {
        candle_core::bail!("query length {query_len} leaves no response in {seq_len} tokens");
    }
    let response_len = seq_len - query_len;

    let output = policy.forward(input_ids)?;
    let logits = output.logits.narrow(1, query_len - 1, response_len)?;
    let labels = input_ids.narrow(1, query_len, response_len)?;
    let logprobs = logprobs_from_logits(&logits, &labels)?;
    let values = output.values.narrow(1, query_len - 1, response_len)?;

    Ok(ResponseForward {
        logits,
        logprobs,
        values,
    })
}

/// Log-probabilities and values of every response token, computed in chunks.
///
/// Returns `(logprobs, values)`, each `[batch, response_len]`.
pub fn batched_forward_pass<P: SequencePolicy + ?Sized>(
    policy: &P,
    queries: &[Vec<u32>],
    responses: &[Vec<u32>],
    forward_batch_size: usize,
) -> Result<(Array2<f32>, Array2<f32>)> {
    if forward_batch_size == 0 {
        return Err(RlhfError::Config("forward_batch_size must be positive".into()));
    }
    let response_len = responses.first().map(Vec::len).unwrap_or(0);
    let mut logprobs = Array2::zeros((queries.len(), response_len));
    let mut values = Array2::zeros((queries.len(), response_len));

    let chunks = queries
        .chunks(forward_batch_size)
        .zip(responses.chunks(forward_batch_size));
    for (index, (query_chunk, response_chunk)) in chunks.enumerate() {
        let input_ids = sequence_tensor(query_chunk, response_chunk, policy.device())?;
        let query_len = query_chunk.first().map(Vec::len).unwrap_or(0);
        let forward = response_forward(policy, &input_ids, query_len)?;

        let offset = index * forward_batch_size;
        let chunk_logprobs = forward.logprobs.to_vec2::<f32>()?;
        let chunk_values = forward.values.to_vec2::<f32>()?;
        for (row, (lp, v)) in chunk_logprobs.iter().zip(&chunk_values).enumerate() {
            logprobs
                .row_mut(offset + row)
                .assign(&ArrayView1::from(lp.as_slice()));
            values
                .row_mut(offset + row)
                .assign(&ArrayView1::from(v.as_slice()));
        }
    }

    Ok((logprobs, values))
}

/// KL-shaped per-token rewards.
///
/// `kl = logprobs - ref_logprobs`; every position gets `-kl_coef * kl`, and the
/// final position additionally gets the scalar score.
///
/// Returns `(rewards, non_score_rewards, kl)`.
pub fn compute_rewards(
    scores: &[f32],
    logprobs: &Array2<f32>,
    ref_logprobs: &Array2<f32>,
    kl_coef: f64,
) -> Result<(Array2<f32>, Array2<f32>, Array2<f32>)> {
    if logprobs.dim() != ref_logprobs.dim() || logprobs.nrows() != scores.len() {
        return Err(RlhfError::ShapeMismatch {
            expected: vec![scores.len(), logprobs.ncols()],
            actual: vec![ref_logprobs.nrows(), ref_logprobs.ncols()],
        });
    }

    let kl = logprobs - ref_logprobs;
    let non_score_rewards = kl.mapv(|k| (-kl_coef * k as f64) as f32);
    let mut rewards = non_score_rewards.clone();

    if let Some(last) = rewards.ncols().checked_sub(1) {
        for (mut row, &score) in rewards.axis_iter_mut(Axis(0)).zip(scores) {
            row[last] += score;
        }
    }

    Ok((rewards, non_score_rewards, kl))
}

/// Generalized Advantage Estimation for one response.
///
/// `value[len]` and `advantage[len]` are taken as zero.
///
/// # Arguments
/// * `rewards` - Per-token rewards [L]
/// * `values` - Value estimates [L]
/// * `gamma` - Discount factor
/// * `lam` - GAE lambda
///
/// # Returns
/// `(advantages, returns)` with `returns = advantages + values`
pub fn compute_gae(
    rewards: ArrayView1<f32>,
    values: ArrayView1<f32>,
    gamma: f64,
    lam: f64,
) -> (Array1<f32>, Array1<f32>) {
    let len = rewards.len();
    let mut advantages = Array1::zeros(len);
    let mut last_gae = 0.0f64;

    for t in (0..len).rev() {
        let next_value = if t + 1 < len {
            values[t + 1] as f64
        } else {
            0.0
        };
        let delta = rewards[t] as f64 + gamma * next_value - values[t] as f64;
        last_gae = delta + gamma * lam * last_gae;
        advantages[t] = last_gae as f32;
    }

    let returns = &advantages + &values;
    (advantages, returns)
}

/// GAE over every row of a `[batch, response_len]` round.
pub fn compute_gae_batch(
    rewards: &Array2<f32>,
    values: &Array2<f32>,
    gamma: f64,
    lam: f64,
) -> (Array2<f32>, Array2<f32>) {
    let mut advantages = Array2::zeros(rewards.dim());
    let mut returns = Array2::zeros(rewards.dim());

    for (row, (r, v)) in rewards.outer_iter().zip(values.outer_iter()).enumerate() {
        let (adv, ret) = compute_gae(r, v, gamma, lam);
        advantages.row_mut(row).assign(&adv);
        returns.row_mut(row).assign(&ret);
    }

    (advantages, returns)
}

/// Mean and unbiased variance over every element.
pub fn mean_var(values: &Array2<f32>) -> (f64, f64) {
    let values = values.mapv(f64::from);
    let Some(mean) = values.mean() else {
        return (0.0, 0.0);
    };
    if values.len() < 2 {
        return (mean, 0.0);
    }
    (mean, values.var(1.0))
}

/// Shift to zero mean and scale by `1 / sqrt(var + eps)`.
pub fn whiten(values: &Array2<f32>) -> Array2<f32> {
    let (mean, var) = mean_var(values);
    let scale = 1.0 / (var + WHITEN_EPS as f64).sqrt();
    values.mapv(|v| ((v as f64 - mean) * scale) as f32)
}

/// Per-rollout sums over the response positions.
pub fn row_sums(values: &Array2<f32>) -> Array1<f64> {
    values.mapv(f64::from).sum_axis(Axis(1))
}

/// Round KL: the mean over rollouts of each rollout's summed per-token KL.
pub fn round_kl_mean(kl: &Array2<f32>) -> f64 {
    row_sums(kl).mean().unwrap_or(0.0)
}
