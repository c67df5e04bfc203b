//! Text encoders: token IDs in, one vector per sequence out.
//!
//! [`TextEncoder`] is the seam a pretrained transformer plugs into. The crate
//! ships [`MeanPoolEncoder`], a small trainable encoder that averages token
//! embeddings under the attention mask, which is enough for tests and for
//! graphs whose descriptions are short.

use candle_core::{DType, Tensor};
use candle_nn::{embedding, linear, Embedding, Linear, Module, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Maps padded token batches to pooled sequence vectors.
pub trait TextEncoder: Send + Sync {
    /// `token_ids` and `attention_mask` are `[B, L]` u32; returns `[B, hidden_size]`.
    fn encode(&self, token_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor>;

    fn hidden_size(&self) -> usize;
}

impl<T: TextEncoder + ?Sized> TextEncoder for Box<T> {
    fn encode(&self, token_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
        (**self).encode(token_ids, attention_mask)
    }

    fn hidden_size(&self) -> usize {
        (**self).hidden_size()
    }
}

/// Size of a [`MeanPoolEncoder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderConfig {
    pub vocab_size: usize,
    /// Output width (default: 128).
    pub hidden_size: usize,
}

impl EncoderConfig {
    pub fn new(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            hidden_size: 128,
        }
    }

    pub fn with_hidden_size(mut self, hidden_size: usize) -> Self {
        self.hidden_size = hidden_size;
        self
    }
}

/// Masked mean of token embeddings followed by a tanh dense layer.
#[derive(Debug, Clone)]
pub struct MeanPoolEncoder {
    tokens: Embedding,
    dense: Linear,
    hidden_size: usize,
}

impl MeanPoolEncoder {
    pub fn new(config: EncoderConfig, vb: VarBuilder) -> Result<Self> {
        let tokens = embedding(config.vocab_size, config.hidden_size, vb.pp("tokens"))?;
        let dense = linear(config.hidden_size, config.hidden_size, vb.pp("dense"))?;
        Ok(Self {
            tokens,
            dense,
            hidden_size: config.hidden_size,
        })
    }
}

impl TextEncoder for MeanPoolEncoder {
    fn encode(&self, token_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
        let embedded = self.tokens.forward(token_ids)?; // [B, L, H]
        let mask = attention_mask.to_dtype(DType::F32)?.unsqueeze(2)?; // [B, L, 1]
        let summed = embedded.broadcast_mul(&mask)?.sum(1)?; // [B, H]
        // All-padding rows sum to zero and stay zero.
        let counts = (mask.sum(1)? + 1e-6)?; // [B, 1]
        let pooled = summed.broadcast_div(&counts)?;
        Ok(self.dense.forward(&pooled)?.tanh()?)
    }

    fn hidden_size(&self) -> usize {
        self.hidden_size
    }
}
