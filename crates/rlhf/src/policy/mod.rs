//! Sequence policies.
//!
//! Provides the collaborator contract the PPO loop drives:
//! - `SequencePolicy` - next-token logits plus a value estimate per position
//! - `HasVarMap` - access to trainable parameters for the optimizer
//! - `Categorical` - host-side sampling distribution with top-k / top-p filtering
//! - `TinyLm` - a small causal language model with a value head

mod distribution;
mod tiny_lm;

pub use distribution::{logprobs_from_logits, top_k_top_p_filtering, Categorical};
pub use tiny_lm::{TinyLm, TinyLmConfig};

use candle_core::{Device, Tensor};
use candle_nn::VarMap;

/// Output of a policy forward pass over `[batch, seq]` token ids.
pub struct PolicyOutput {
    /// Next-token logits `[batch, seq, vocab]`; position `i` predicts token `i + 1`
    pub logits: Tensor,
    /// Value estimates `[batch, seq]`
    pub values: Tensor,
}

/// Trait for autoregressive policies with a value head.
///
/// The trainable policy and the frozen reference share this interface.
pub trait SequencePolicy {
    /// Forward pass over a batch of token id sequences (`u32`, `[batch, seq]`)
    fn forward(&self, input_ids: &Tensor) -> candle_core::Result<PolicyOutput>;

    /// Device the policy's parameters live on
    fn device(&self) -> &Device;
}

/// Trait for policies that expose a VarMap for optimization
pub trait HasVarMap {
    /// Get reference to the VarMap
    fn var_map(&self) -> &VarMap;

    /// Total number of trainable scalars
    fn num_parameters(&self) -> usize {
        self.var_map()
            .all_vars()
            .iter()
            .map(|var| var.elem_count())
            .sum()
    }
}
