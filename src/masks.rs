//! Attention mask utilities for the encoder forward pass.
//!
//! UMT5 is a bidirectional encoder, so there is no causal mask here; the
//! only mask is the host-supplied padding mask, expanded into additive form
//! so it can be broadcast onto `[batch, heads, seq, seq]` attention scores.

use anyhow::Result;
use candle_core::{DType, Tensor};

/// Expand a `[batch, seq]` 1/0 padding mask into an additive
/// `[batch, 1, 1, seq]` mask.
///
/// Attended key positions become 0, padding key positions become `-inf`
/// (exactly 0 attention weight after softmax). Padding *query* rows stay
/// finite because only the key axis is masked.
pub fn expand_attention_mask(mask: &Tensor, dtype: DType) -> Result<Tensor> {
    let (batch, seq_len) = mask.dims2()?;

    // 0 * -inf is NaN, so select rather than scale.
    let keep = mask.to_dtype(DType::U32)?.ne(0u32)?;
    let zeros = Tensor::zeros((batch, seq_len), DType::F32, mask.device())?;
    let neg_inf = Tensor::full(f32::NEG_INFINITY, (batch, seq_len), mask.device())?;
    let additive = keep.where_cond(&zeros, &neg_inf)?;

    Ok(additive.reshape((batch, 1, 1, seq_len))?.to_dtype(dtype)?)
}
