//! Small causal language model with a value head.

use super::{HasVarMap, PolicyOutput, SequencePolicy};
use crate::{Result, RlhfError};
use candle_core::{DType, Device, Tensor, Var, D};
use candle_nn::{Embedding, Linear, Module, Sequential, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};

/// Configuration for [`TinyLm`]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TinyLmConfig {
    /// Vocabulary size
    pub vocab_size: usize,
    /// Hidden size
    pub hidden_size: usize,
    /// Number of hidden layers
    pub num_layers: usize,
    /// Longest sequence the position table covers
    pub max_positions: usize,
}

impl TinyLmConfig {
    pub fn new(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            hidden_size: 32,
            num_layers: 2,
            max_positions: 64,
        }
    }

    pub fn with_hidden_size(mut self, hidden_size: usize) -> Self {
        self.hidden_size = hidden_size;
        self
    }

    pub fn with_max_positions(mut self, max_positions: usize) -> Self {
        self.max_positions = max_positions;
        self
    }
}

/// Token and position embeddings, a causal running mean over the prefix, an
/// MLP, then a language-model head and a scalar value head.
pub struct TinyLm {
    var_map: VarMap,
    config: TinyLmConfig,
    wte: Embedding,
    wpe: Embedding,
    encoder: Sequential,
    lm_head: Linear,
    v_head: Linear,
    device: Device,
}

impl TinyLm {
    /// Create a freshly initialised model
    pub fn new(config: TinyLmConfig, device: &Device) -> Result<Self> {
        Self::build(config, VarMap::new(), device)
    }

    /// Parameter-identical copy backed by its own VarMap.
    ///
    /// Used for the frozen reference policy: updates to `self` never reach the copy.
    pub fn frozen_copy(&self) -> Result<Self> {
        let var_map = VarMap::new();
        {
            let source = self
                .var_map
                .data()
                .lock()
                .map_err(|_| candle_core::Error::Msg("policy VarMap lock poisoned".into()))?;
            let mut target = var_map
                .data()
                .lock()
                .map_err(|_| candle_core::Error::Msg("reference VarMap lock poisoned".into()))?;
            for (name, var) in source.iter() {
                target.insert(name.clone(), Var::from_tensor(&var.as_tensor().copy()?)?);
            }
        }
        Self::build(self.config.clone(), var_map, &self.device)
    }

    pub fn config(&self) -> &TinyLmConfig {
        &self.config
    }

    fn build(config: TinyLmConfig, var_map: VarMap, device: &Device) -> Result<Self> {
        if config.vocab_size == 0 || config.hidden_size == 0 || config.max_positions == 0 {
            return Err(RlhfError::Config(format!(
                "TinyLm dimensions must be positive: {config:?}"
            )));
        }

        let vb = VarBuilder::from_varmap(&var_map, DType::F32, device);
        let hidden = config.hidden_size;

        let wte = candle_nn::embedding(config.vocab_size, hidden, vb.pp("wte"))?;
        let wpe = candle_nn::embedding(config.max_positions, hidden, vb.pp("wpe"))?;

        let mut encoder = candle_nn::seq();
        for layer in 0..config.num_layers {
            encoder = encoder
                .add(candle_nn::linear(hidden, hidden, vb.pp(format!("h{layer}")))?)
                .add_fn(|x| x.gelu());
        }

        let lm_head = candle_nn::linear(hidden, config.vocab_size, vb.pp("lm_head"))?;
        let v_head = candle_nn::linear(hidden, 1, vb.pp("v_head"))?;

        Ok(Self {
            var_map,
            config,
            wte,
            wpe,
            encoder,
            lm_head,
            v_head,
            device: device.clone(),
        })
    }
}

impl SequencePolicy for TinyLm {
    fn forward(&self, input_ids: &Tensor) -> candle_core::Result<PolicyOutput> {
        let (_batch, seq_len) = input_ids.dims2()?;
        if seq_len > self.config.max_positions {
            candle_core::bail!(
                "sequence length {seq_len} exceeds max_positions {}",
                self.config.max_positions
            );
        }

        let positions = Tensor::arange(0u32, seq_len as u32, &self.device)?;
        let tokens = self.wte.forward(input_ids)?;
        let x = tokens.broadcast_add(&self.wpe.forward(&positions)?.unsqueeze(0)?)?;

        // Position i sees the mean of embeddings 0..=i.
        let counts = Tensor::arange(1u32, seq_len as u32 + 1, &self.device)?
            .to_dtype(DType::F32)?
            .reshape((1, seq_len, 1))?;
        let context = x.cumsum(1)?.broadcast_div(&counts)?;

        let hidden = self.encoder.forward(&(x + context)?)?;
        let logits = self.lm_head.forward(&hidden)?;
        let values = self.v_head.forward(&hidden)?.squeeze(D::Minus1)?;

        Ok(PolicyOutput { logits, values })
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

impl HasVarMap for TinyLm {
    fn var_map(&self) -> &VarMap {
        &self.var_map
    }
}
