//! Response generation.

use crate::config::PpoConfig;
use crate::policy::{Categorical, SequencePolicy};
use crate::{Result, RlhfError};
use candle_core::{IndexOp, Tensor};
use rand::Rng;

/// Samples fixed-length continuations from a policy.
///
/// Prompts are processed in consecutive chunks of at most `forward_batch_size`,
/// one chunk at a time; output order matches input order. Every response has
/// exactly `txt_out_len` tokens: generation never stops early.
#[derive(Clone, Debug)]
pub struct ResponseSampler {
    pub txt_out_len: usize,
    pub forward_batch_size: usize,
    pub top_k: usize,
    pub top_p: f64,
}

impl ResponseSampler {
    pub fn new(txt_out_len: usize, forward_batch_size: usize) -> Self {
        Self {
            txt_out_len,
            forward_batch_size,
            top_k: 0,
            top_p: 1.0,
        }
    }

    pub fn from_config(config: &PpoConfig) -> Self {
        Self {
            txt_out_len: config.txt_out_len,
            forward_batch_size: config.forward_batch_size,
            top_k: config.top_k,
            top_p: config.top_p,
        }
    }

    /// Generate one response per prompt.
    pub fn generate<P, R>(
        &self,
        policy: &P,
        queries: &[Vec<u32>],
        rng: &mut R,
    ) -> Result<Vec<Vec<u32>>>
    where
        P: SequencePolicy + ?Sized,
        R: Rng + ?Sized,
    {
        if self.forward_batch_size == 0 {
            return Err(RlhfError::Config("forward_batch_size must be positive".into()));
        }

        let mut responses = Vec::with_capacity(queries.len());
        for (index, chunk) in queries.chunks(self.forward_batch_size).enumerate() {
            tracing::debug!(chunk = index, size = chunk.len(), "Generating responses");
            responses.extend(self.generate_chunk(policy, chunk, rng)?);
        }
        Ok(responses)
    }

    fn generate_chunk<P, R>(
        &self,
        policy: &P,
        queries: &[Vec<u32>],
        rng: &mut R,
    ) -> Result<Vec<Vec<u32>>>
    where
        P: SequencePolicy + ?Sized,
        R: Rng + ?Sized,
    {
        let rows = queries.len();
        let query_len = queries.first().map(Vec::len).unwrap_or(0);
        if query_len == 0 {
            return Err(RlhfError::Sampling("prompts must be non-empty".into()));
        }
        if let Some(bad) = queries.iter().find(|q| q.len() != query_len) {
            return Err(RlhfError::ShapeMismatch {
                expected: vec![query_len],
                actual: vec![bad.len()],
            });
        }

        let device = policy.device();
        let flat: Vec<u32> = queries.iter().flatten().copied().collect();
        let mut input_ids = Tensor::from_vec(flat, (rows, query_len), device)?;
        let mut responses = vec![Vec::with_capacity(self.txt_out_len); rows];

        for _ in 0..self.txt_out_len {
            let seq_len = input_ids.dim(1)?;
            let output = policy.forward(&input_ids)?;
            let next_logits = output.logits.i((.., seq_len - 1, ..))?.to_vec2::<f32>()?;

            let mut next_tokens = Vec::with_capacity(rows);
            for (row, logits) in next_logits.iter().enumerate() {
                let token = Categorical::filtered(logits, self.top_k, self.top_p).sample(rng)?;
                responses[row].push(token);
                next_tokens.push(token);
            }

            let column = Tensor::from_vec(next_tokens, (rows, 1), device)?;
            input_ids = Tensor::cat(&[&input_ids, &column], 1)?;
        }

        Ok(responses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{PolicyOutput, TinyLm, TinyLmConfig};
    use candle_core::{DType, Device};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::cell::RefCell;

    /// Deterministic policy that always emits `last token + 1` and records batch sizes.
    struct CountingPolicy {
        vocab: usize,
        calls: RefCell<Vec<(usize, usize)>>,
        device: Device,
    }

    impl SequencePolicy for CountingPolicy {
        fn forward(&self, input_ids: &Tensor) -> candle_core::Result<PolicyOutput> {
            let (batch, seq) = input_ids.dims2()?;
            self.calls.borrow_mut().push((batch, seq));

            let ids = input_ids.to_vec2::<u32>()?;
            let mut logits = vec![-1e9f32; batch * seq * self.vocab];
            for (b, row) in ids.iter().enumerate() {
                for (t, &tok) in row.iter().enumerate() {
                    let next = (tok as usize + 1) % self.vocab;
                    logits[(b * seq + t) * self.vocab + next] = 0.0;
                }
            }
            Ok(PolicyOutput {
                logits: Tensor::from_vec(logits, (batch, seq, self.vocab), &self.device)?,
                values: Tensor::zeros((batch, seq), DType::F32, &self.device)?,
            })
        }

        fn device(&self) -> &Device {
            &self.device
        }
    }

    #[test]
    fn test_chunked_generation_preserves_order() {
        let policy = CountingPolicy {
            vocab: 100,
            calls: RefCell::new(Vec::new()),
            device: Device::Cpu,
        };
        let sampler = ResponseSampler::new(3, 2);
        let queries = vec![vec![0, 1], vec![10, 11], vec![20, 21], vec![30, 31]];
        let mut rng = StdRng::seed_from_u64(0);

        let responses = sampler.generate(&policy, &queries, &mut rng).unwrap();

        assert_eq!(
            responses,
            vec![
                vec![2, 3, 4],
                vec![12, 13, 14],
                vec![22, 23, 24],
                vec![32, 33, 34]
            ]
        );
        // Two sequential chunks of two, three steps each.
        assert_eq!(
            *policy.calls.borrow(),
            vec![(2, 2), (2, 3), (2, 4), (2, 2), (2, 3), (2, 4)]
        );
    }

    #[test]
    fn test_short_final_chunk_is_tolerated() {
        let policy = CountingPolicy {
            vocab: 50,
            calls: RefCell::new(Vec::new()),
            device: Device::Cpu,
        };
        let sampler = ResponseSampler::new(1, 2);
        let queries = vec![vec![1], vec![2], vec![3]];
        let mut rng = StdRng::seed_from_u64(0);

        let responses = sampler.generate(&policy, &queries, &mut rng).unwrap();
        assert_eq!(responses, vec![vec![2], vec![3], vec![4]]);
        assert_eq!(*policy.calls.borrow(), vec![(2, 1), (1, 1)]);
    }

    #[test]
    fn test_fixed_length_with_real_policy() {
        let policy = TinyLm::new(TinyLmConfig::new(13), &Device::Cpu).unwrap();
        let sampler = ResponseSampler::new(5, 3);
        let queries = vec![vec![1, 2, 3]; 6];
        let mut rng = StdRng::seed_from_u64(42);

        let responses = sampler.generate(&policy, &queries, &mut rng).unwrap();
        assert_eq!(responses.len(), 6);
        for response in &responses {
            assert_eq!(response.len(), 5);
            assert!(response.iter().all(|&t| t < 13));
        }
    }

    #[test]
    fn test_rejects_ragged_prompts() {
        let policy = TinyLm::new(TinyLmConfig::new(13), &Device::Cpu).unwrap();
        let sampler = ResponseSampler::new(2, 4);
        let mut rng = StdRng::seed_from_u64(1);
        let err = sampler
            .generate(&policy, &[vec![1, 2], vec![3]], &mut rng)
            .unwrap_err();
        assert!(matches!(err, RlhfError::ShapeMismatch { .. }));
    }
}
