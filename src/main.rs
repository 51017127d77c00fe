//! clip-skip-rs CLI: encode token ids with trailing encoder blocks skipped.
//!
//! Debugging aid for inspecting what CLIP skip does to a checkpoint; the
//! host application owns tokenization, so this takes raw token ids.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use clip_skip_rs::{descriptor, node, ClipHandle, Umt5Encoder};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "clip-skip-rs")]
#[command(about = "Run a UMT5 text encoder with trailing blocks skipped")]
#[command(version)]
struct Cli {
    /// Model ID from `HuggingFace` (e.g., "google/umt5-xxl")
    #[arg(short, long, default_value = "google/umt5-small")]
    model: String,

    /// Number of trailing encoder blocks to skip (0 = no skip)
    #[arg(short, long, default_value_t = 1)]
    skip: i64,

    /// Comma-separated token ids to encode
    #[arg(short, long, default_value = "0,1,2,3")]
    ids: String,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Force CPU mode (slower but avoids CUDA issues)
    #[arg(long)]
    cpu: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let node_info = descriptor();
    println!("=== {} ({}) ===", node_info.label, node_info.id);
    println!("Model: {}", cli.model);
    println!("Skip:  {} block(s)", cli.skip);
    if cli.cpu {
        println!("Mode:  CPU (forced)");
    }

    let ids: Vec<u32> = cli
        .ids
        .split(',')
        .map(|id| id.trim().parse::<u32>())
        .collect::<Result<_, _>>()
        .context("token ids must be comma-separated unsigned integers")?;

    info!("Loading encoder...");
    let (encoder, device) = Umt5Encoder::from_pretrained(&cli.model, cli.cpu)?;
    let clip = ClipHandle::new(Arc::new(encoder));
    info!("Encoder: {} blocks", clip.num_blocks());

    let skipped = node::apply(&clip, cli.skip)?;

    let seq_len = ids.len();
    let input_ids = candle_core::Tensor::from_vec(ids, (1, seq_len), &device)?;
    let attention_mask = candle_core::Tensor::ones((1, seq_len), candle_core::DType::U32, &device)?;

    let output = skipped.encode(&input_ids, Some(&attention_mask))?;
    let hidden = output
        .last_hidden_state
        .to_dtype(candle_core::DType::F32)?;

    println!("\n=== Result ===");
    println!("last_hidden_state: {:?}", hidden.dims());
    println!("mean: {:+.6}", hidden.mean_all()?.to_scalar::<f32>()?);
    println!(
        "abs max: {:.6}",
        hidden.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?
    );

    Ok(())
}
