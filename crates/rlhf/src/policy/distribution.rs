//! Next-token distributions.

use crate::{Result, RlhfError};
use candle_core::{Tensor, D};
use rand::distributions::{Distribution as _, WeightedIndex};
use rand::Rng;

/// Categorical distribution over a vocabulary, held on the host.
#[derive(Clone, Debug)]
pub struct Categorical {
    probs: Vec<f32>,
}

impl Categorical {
    /// Softmax over raw logits. `-inf` entries get zero mass.
    pub fn from_logits(logits: &[f32]) -> Self {
        let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let exps: Vec<f32> = logits.iter().map(|&l| (l - max).exp()).collect();
        let total: f32 = exps.iter().sum();
        let probs = exps.into_iter().map(|e| e / total).collect();
        Self { probs }
    }

    /// Softmax after top-k / nucleus filtering.
    pub fn filtered(logits: &[f32], top_k: usize, top_p: f64) -> Self {
        let mut logits = logits.to_vec();
        top_k_top_p_filtering(&mut logits, top_k, top_p);
        Self::from_logits(&logits)
    }

    /// Draw a token id.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<u32> {
        let index = WeightedIndex::new(&self.probs)
            .map_err(|e| RlhfError::Sampling(format!("invalid token distribution: {e}")))?;
        Ok(index.sample(rng) as u32)
    }

    /// Probabilities, one per token id
    pub fn probs(&self) -> &[f32] {
        &self.probs
    }

    /// Log probability of a token id
    pub fn log_prob(&self, token: u32) -> f32 {
        self.probs
            .get(token as usize)
            .map(|p| p.ln())
            .unwrap_or(f32::NEG_INFINITY)
    }

    /// Entropy in nats
    pub fn entropy(&self) -> f32 {
        -self
            .probs
            .iter()
            .filter(|&&p| p > 0.0)
            .map(|&p| p * p.ln())
            .sum::<f32>()
    }
}

/// Mask logits outside the top-k set and outside the nucleus of mass `top_p`.
///
/// `top_k == 0` and `top_p >= 1.0` disable the respective filter. The most
/// likely token always survives.
pub fn top_k_top_p_filtering(logits: &mut [f32], top_k: usize, top_p: f64) {
    if logits.is_empty() {
        return;
    }

    let mut order: Vec<usize> = (0..logits.len()).collect();
    order.sort_by(|&a, &b| logits[b].total_cmp(&logits[a]));

    if top_k > 0 && top_k < logits.len() {
        let threshold = logits[order[top_k - 1]];
        for logit in logits.iter_mut() {
            if *logit < threshold {
                *logit = f32::NEG_INFINITY;
            }
        }
    }

    if top_p < 1.0 {
        let sorted: Vec<f32> = order.iter().map(|&i| logits[i]).collect();
        let probs = Categorical::from_logits(&sorted);

        // A token goes once the mass strictly before it already exceeds top_p.
        let mut cumulative = 0.0f64;
        for (rank, &index) in order.iter().enumerate() {
            if rank > 0 && cumulative > top_p {
                logits[index] = f32::NEG_INFINITY;
            }
            cumulative += probs.probs()[rank] as f64;
        }
    }
}

/// Log probability of each label under `logits`.
///
/// `logits` is `[batch, seq, vocab]`, `labels` is `[batch, seq]` (`u32`);
/// returns `[batch, seq]`.
pub fn logprobs_from_logits(logits: &Tensor, labels: &Tensor) -> candle_core::Result<Tensor> {
    let log_probs = candle_nn::ops::log_softmax(logits, D::Minus1)?;
    log_probs
        .gather(&labels.unsqueeze(D::Minus1)?.contiguous()?, D::Minus1)?
        .squeeze(D::Minus1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_categorical_probs_sum_to_one() {
        let dist = Categorical::from_logits(&[1.0, 2.0, 3.0]);
        let total: f32 = dist.probs().iter().sum();
        assert!((total - 1.0).abs() < 1e-6);
        assert!(dist.probs()[2] > dist.probs()[1]);
    }

    #[test]
    fn test_categorical_sample_in_range() {
        let dist = Categorical::from_logits(&[0.0; 5]);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            assert!(dist.sample(&mut rng).unwrap() < 5);
        }
    }

    #[test]
    fn test_sampling_is_stochastic() {
        let dist = Categorical::from_logits(&[0.0, 0.1]);
        let mut rng = StdRng::seed_from_u64(3);
        let draws: Vec<u32> = (0..200).map(|_| dist.sample(&mut rng).unwrap()).collect();
        assert!(draws.contains(&0));
        assert!(draws.contains(&1));
    }

    #[test]
    fn test_uniform_entropy() {
        let dist = Categorical::from_logits(&[0.0; 4]);
        assert!((dist.entropy() - 4f32.ln()).abs() < 1e-5);
        assert!((dist.log_prob(1) + 4f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn test_top_k_keeps_k_tokens() {
        let mut logits = vec![1.0, 4.0, 3.0, 2.0];
        top_k_top_p_filtering(&mut logits, 2, 1.0);
        assert_eq!(logits[0], f32::NEG_INFINITY);
        assert_eq!(logits[3], f32::NEG_INFINITY);
        assert_eq!(logits[1], 4.0);
        assert_eq!(logits[2], 3.0);
    }

    #[test]
    fn test_top_p_keeps_nucleus() {
        // probs ~ [0.665, 0.245, 0.090]
        let mut logits = vec![2.0, 1.0, 0.0];
        top_k_top_p_filtering(&mut logits, 0, 0.7);
        assert_eq!(logits[0], 2.0);
        assert_eq!(logits[1], 1.0);
        assert_eq!(logits[2], f32::NEG_INFINITY);

        let dist = Categorical::filtered(&[2.0, 1.0, 0.0], 0, 0.5);
        assert!((dist.probs()[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_filters_disabled_by_default() {
        let mut logits = vec![0.5, -1.0, 3.0];
        top_k_top_p_filtering(&mut logits, 0, 1.0);
        assert_eq!(logits, vec![0.5, -1.0, 3.0]);
    }

    #[test]
    fn test_logprobs_from_logits() {
        let logits = Tensor::new(&[[[0.0f32, 0.0], [10.0, 0.0]]], &Device::Cpu).unwrap();
        let labels = Tensor::new(&[[1u32, 0]], &Device::Cpu).unwrap();
        let lp = logprobs_from_logits(&logits, &labels)
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();
        assert!((lp[0][0] - 0.5f32.ln()).abs() < 1e-5);
        assert!(lp[0][1] > -1e-3);
    }
}
