//! Compare encoder outputs across skip depths.
//!
//! Downloads a UMT5 checkpoint, then encodes the same token ids with 0, 1,
//! 2, and 4 trailing blocks skipped and reports how far each truncated
//! forward drifts from the full one.
//!
//! Run with: cargo run --example skip_compare [-- <model-id>]

use std::sync::Arc;

use anyhow::Result;
use candle_core::{DType, Tensor};
use clip_skip_rs::{ClipHandle, Umt5Encoder};

fn main() -> Result<()> {
    let model_id = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "google/umt5-small".to_string());

    println!("=== CLIP skip comparison: {model_id} ===");
    let (encoder, device) = Umt5Encoder::from_pretrained(&model_id, false)?;
    let clip = ClipHandle::new(Arc::new(encoder));
    println!("Encoder blocks: {}", clip.num_blocks());

    let ids: Vec<u32> = vec![571, 1820, 4, 1902, 336, 5, 1];
    let seq_len = ids.len();
    let input_ids = Tensor::from_vec(ids, (1, seq_len), &device)?;
    let attention_mask = Tensor::ones((1, seq_len), DType::U32, &device)?;

    let full = clip
        .encode(&input_ids, Some(&attention_mask))?
        .last_hidden_state
        .to_dtype(DType::F32)?;

    println!("\n{:>6}  {:>12}  {:>12}", "skip", "mean", "mean |Δ|");
    for skip in [0i64, 1, 2, 4] {
        let output = clip
            .with_skipped_layers(skip)?
            .encode(&input_ids, Some(&attention_mask))?
            .last_hidden_state
            .to_dtype(DType::F32)?;

        let mean = output.mean_all()?.to_scalar::<f32>()?;
        let drift = (&output - &full)?.abs()?.mean_all()?.to_scalar::<f32>()?;
        println!("{skip:>6}  {mean:>+12.6}  {drift:>12.6}");
    }

    Ok(())
}
