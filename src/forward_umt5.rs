//! UMT5 encoder forward pass with a truncatable block stack.
//!
//! Runs block-by-block so the handle layer can stop early for CLIP skip.
//!
//! Architecture notes (T5 family, UMT5 variant):
//! - pre-norm RMS layer norms, no bias anywhere
//! - self-attention WITHOUT the 1/sqrt(d) scale (folded into trained weights)
//! - relative position bias per block. UMT5 gives every block its own
//!   bucket table, unlike T5 which shares block 0's
//! - gated-GELU feed-forward (`wi_0` gate, `wi_1` up, `wo` down)

use anyhow::{Context, Result};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{embedding, linear_no_bias, Embedding, Linear, RmsNorm, VarBuilder};
use hf_hub::{api::sync::Api, Repo, RepoType};
use tracing::{debug, info};

use crate::error::ClipSkipError;
use crate::model::TextEncoderStack;

/// Model configuration (matches HuggingFace config.json for UMT5)
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Umt5Config {
    pub d_model: usize,
    pub d_kv: usize,
    pub d_ff: usize,
    pub num_layers: usize,
    pub num_heads: usize,
    pub vocab_size: usize,
    #[serde(default = "default_num_buckets")]
    pub relative_attention_num_buckets: usize,
    #[serde(default = "default_max_distance")]
    pub relative_attention_max_distance: usize,
    #[serde(default = "default_layer_norm_epsilon")]
    pub layer_norm_epsilon: f64,
    /// Width of the optional output projection. Plain UMT5 checkpoints have
    /// none; CLIP-style wrappers that carry a `text_projection` tensor set
    /// this so the loader knows its shape.
    #[serde(default)]
    pub projection_dim: Option<usize>,
}

fn default_num_buckets() -> usize {
    32
}

fn default_max_distance() -> usize {
    128
}

fn default_layer_norm_epsilon() -> f64 {
    1e-6
}

/// Bidirectional relative-position bucketing, mirroring the reference T5
/// implementation: half the buckets per sign, exact up to `half / 2`,
/// log-spaced out to `max_distance` beyond that.
fn relative_position_bucket(relative_position: i64, num_buckets: usize, max_distance: usize) -> u32 {
    let half = num_buckets / 2;
    let mut bucket = if relative_position > 0 { half } else { 0 };
    let distance = relative_position.unsigned_abs() as usize;

    let max_exact = half / 2;
    if distance < max_exact {
        bucket += distance;
    } else {
        let log_ratio = ((distance as f64) / (max_exact as f64)).ln()
            / ((max_distance as f64) / (max_exact as f64)).ln();
        let large = max_exact + (log_ratio * (half - max_exact) as f64) as usize;
        bucket += large.min(half - 1);
    }

    bucket as u32
}

/// Bidirectional self-attention with a per-block relative position bias
struct SelfAttention {
    q: Linear,
    k: Linear,
    v: Linear,
    o: Linear,
    relative_attention_bias: Embedding,
    num_heads: usize,
    d_kv: usize,
    num_buckets: usize,
    max_distance: usize,
}

impl SelfAttention {
    fn load(vb: VarBuilder, config: &Umt5Config) -> Result<Self> {
        let inner = config.num_heads * config.d_kv;
        // T5 has no bias on any projection
        let q = linear_no_bias(config.d_model, inner, vb.pp("q"))?;
        let k = linear_no_bias(config.d_model, inner, vb.pp("k"))?;
        let v = linear_no_bias(config.d_model, inner, vb.pp("v"))?;
        let o = linear_no_bias(inner, config.d_model, vb.pp("o"))?;
        let relative_attention_bias = embedding(
            config.relative_attention_num_buckets,
            config.num_heads,
            vb.pp("relative_attention_bias"),
        )?;

        Ok(Self {
            q,
            k,
            v,
            o,
            relative_attention_bias,
            num_heads: config.num_heads,
            d_kv: config.d_kv,
            num_buckets: config.relative_attention_num_buckets,
            max_distance: config.relative_attention_max_distance,
        })
    }

    /// Additive `[1, heads, seq, seq]` bias from this block's bucket table.
    fn position_bias(&self, seq_len: usize, device: &Device) -> Result<Tensor> {
        let mut buckets = Vec::with_capacity(seq_len * seq_len);
        for query in 0..seq_len {
            for key in 0..seq_len {
                let relative = key as i64 - query as i64;
                buckets.push(relative_position_bucket(
                    relative,
                    self.num_buckets,
                    self.max_distance,
                ));
            }
        }
        let buckets = Tensor::from_vec(buckets, (seq_len, seq_len), device)?;

        // [seq, seq, heads] -> [1, heads, seq, seq]
        let bias = self.relative_attention_bias.forward(&buckets)?;
        Ok(bias.permute((2, 0, 1))?.contiguous()?.unsqueeze(0)?)
    }

    fn forward(&self, x: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let (b, seq_len, _) = x.dims3()?;

        let q = self.q.forward(x)?;
        let k = self.k.forward(x)?;
        let v = self.v.forward(x)?;

        // Reshape for multi-head attention
        let q = q
            .reshape((b, seq_len, self.num_heads, self.d_kv))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = k
            .reshape((b, seq_len, self.num_heads, self.d_kv))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = v
            .reshape((b, seq_len, self.num_heads, self.d_kv))?
            .transpose(1, 2)?
            .contiguous()?;

        // No 1/sqrt(d) scale in T5 attention
        let scores = q.matmul(&k.transpose(2, 3)?.contiguous()?)?;
        let scores = scores.broadcast_add(&self.position_bias(seq_len, x.device())?)?;
        let scores = match mask {
            Some(mask) => scores.broadcast_add(mask)?,
            None => scores,
        };

        let attn_weights = candle_nn::ops::softmax_last_dim(&scores)?;
        let attn_output = attn_weights.matmul(&v)?;

        // Reshape back
        let attn_output = attn_output.transpose(1, 2)?.reshape((b, seq_len, ()))?;
        Ok(self.o.forward(&attn_output)?)
    }
}

/// Gated-GELU feed-forward (T5 v1.1 style)
struct GatedFeedForward {
    wi_0: Linear,
    wi_1: Linear,
    wo: Linear,
}

impl GatedFeedForward {
    fn load(vb: VarBuilder, config: &Umt5Config) -> Result<Self> {
        let wi_0 = linear_no_bias(config.d_model, config.d_ff, vb.pp("wi_0"))?;
        let wi_1 = linear_no_bias(config.d_model, config.d_ff, vb.pp("wi_1"))?;
        let wo = linear_no_bias(config.d_ff, config.d_model, vb.pp("wo"))?;

        Ok(Self { wi_0, wi_1, wo })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        // wo(gelu(wi_0(x)) * wi_1(x))
        let gate = self.wi_0.forward(x)?.gelu()?;
        let up = self.wi_1.forward(x)?;
        let hidden = (gate * up)?;
        Ok(self.wo.forward(&hidden)?)
    }
}

/// One encoder block: pre-norm self-attention, pre-norm feed-forward
struct EncoderBlock {
    self_attn: SelfAttention,
    ff: GatedFeedForward,
    attn_layer_norm: RmsNorm,
    ff_layer_norm: RmsNorm,
}

impl EncoderBlock {
    fn load(vb: VarBuilder, config: &Umt5Config) -> Result<Self> {
        let self_attn = SelfAttention::load(vb.pp("layer.0.SelfAttention"), config)?;
        let attn_layer_norm = candle_nn::rms_norm(
            config.d_model,
            config.layer_norm_epsilon,
            vb.pp("layer.0.layer_norm"),
        )?;
        let ff = GatedFeedForward::load(vb.pp("layer.1.DenseReluDense"), config)?;
        let ff_layer_norm = candle_nn::rms_norm(
            config.d_model,
            config.layer_norm_epsilon,
            vb.pp("layer.1.layer_norm"),
        )?;

        Ok(Self {
            self_attn,
            ff,
            attn_layer_norm,
            ff_layer_norm,
        })
    }

    fn forward(&self, x: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let residual = x;
        let x = self.attn_layer_norm.forward(x)?;
        let x = self.self_attn.forward(&x, mask)?;
        let x = (residual + x)?;

        let residual = &x;
        let normed = self.ff_layer_norm.forward(&x)?;
        let x = (residual + self.ff.forward(&normed)?)?;
        Ok(x)
    }
}

/// Safetensors index for sharded models
#[derive(Debug, serde::Deserialize)]
struct SafetensorsIndex {
    weight_map: std::collections::HashMap<String, String>,
}

/// UMT5 encoder stack: shared embedding, encoder blocks, final layer norm,
/// optional output projection.
pub struct Umt5Encoder {
    shared: Embedding,
    blocks: Vec<EncoderBlock>,
    final_layer_norm: RmsNorm,
    text_projection: Option<Tensor>,
    d_model: usize,
}

impl std::fmt::Debug for Umt5Encoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Umt5Encoder")
            .field("num_blocks", &self.blocks.len())
            .field("d_model", &self.d_model)
            .field("has_projection", &self.text_projection.is_some())
            .finish_non_exhaustive()
    }
}

impl Umt5Encoder {
    /// Build from an already-opened weight store.
    ///
    /// Presence of the required weight paths is checked up front, so an
    /// incompatible checkpoint fails naming the expected path instead of
    /// erroring deep inside component construction.
    pub fn load(vb: VarBuilder, config: &Umt5Config) -> Result<Self> {
        for (probe, path) in [
            ("shared.weight", "shared"),
            (
                "encoder.block.0.layer.0.SelfAttention.q.weight",
                "encoder.block",
            ),
            ("encoder.final_layer_norm.weight", "encoder.final_layer_norm"),
        ] {
            if !vb.contains_tensor(probe) {
                return Err(ClipSkipError::MissingComponent {
                    path: path.to_string(),
                }
                .into());
            }
        }

        let shared = embedding(config.vocab_size, config.d_model, vb.pp("shared"))?;

        let vb_encoder = vb.pp("encoder");
        let mut blocks = Vec::with_capacity(config.num_layers);
        for i in 0..config.num_layers {
            if (i + 1) % 8 == 0 || i == 0 {
                debug!("loading encoder block {}/{}", i + 1, config.num_layers);
            }
            let block = EncoderBlock::load(vb_encoder.pp(format!("block.{i}")), config)?;
            blocks.push(block);
        }

        let final_layer_norm = candle_nn::rms_norm(
            config.d_model,
            config.layer_norm_epsilon,
            vb_encoder.pp("final_layer_norm"),
        )?;

        let text_projection = match config.projection_dim {
            Some(dim) if vb.contains_tensor("text_projection") => {
                info!("loading text_projection ({} -> {dim})", config.d_model);
                Some(vb.get((config.d_model, dim), "text_projection")?)
            }
            Some(_) => {
                debug!("config names projection_dim but checkpoint has no text_projection");
                None
            }
            None => None,
        };

        Ok(Self {
            shared,
            blocks,
            final_layer_norm,
            text_projection,
            d_model: config.d_model,
        })
    }

    /// Load from a HuggingFace model repo (tries CUDA/BF16, falls back to
    /// CPU/F32). Handles both single-file and sharded safetensors.
    pub fn from_pretrained(model_id: &str, force_cpu: bool) -> Result<(Self, Device)> {
        let (device, dtype) = if force_cpu {
            info!("Forcing CPU mode");
            (Device::Cpu, DType::F32)
        } else {
            match Device::cuda_if_available(0) {
                Ok(dev) if dev.is_cuda() => {
                    info!("Using CUDA device");
                    (dev, DType::BF16)
                }
                _ => {
                    info!("CUDA not available, using CPU");
                    (Device::Cpu, DType::F32)
                }
            }
        };

        info!("Loading UMT5 encoder from: {}", model_id);

        let api = Api::new()?;
        let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));

        let config_path = repo
            .get("config.json")
            .context("Failed to download config.json")?;
        let config_str = std::fs::read_to_string(&config_path).context("Failed to read config")?;
        let config: Umt5Config = serde_json::from_str(&config_str)?;
        info!(
            "Model config: {} blocks, {} d_model, {} vocab",
            config.num_layers, config.d_model, config.vocab_size
        );

        // Check for sharded vs single safetensors
        let weights_paths = if let Ok(index_path) = repo.get("model.safetensors.index.json") {
            info!("Model is sharded, loading index...");
            let index_str = std::fs::read_to_string(&index_path).context("Failed to read index")?;
            let index: SafetensorsIndex = serde_json::from_str(&index_str)?;

            let mut shard_names: Vec<String> = index.weight_map.values().cloned().collect();
            shard_names.sort();
            shard_names.dedup();

            info!("Downloading {} shard files...", shard_names.len());
            let mut paths = Vec::new();
            for shard_name in &shard_names {
                let path = repo
                    .get(shard_name)
                    .with_context(|| format!("Failed to download {shard_name}"))?;
                paths.push(path);
            }
            paths
        } else {
            let path = repo
                .get("model.safetensors")
                .context("Failed to download model.safetensors")?;
            vec![path]
        };

        info!("Loading weights from {} file(s)...", weights_paths.len());
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&weights_paths, dtype, &device)? };

        let encoder = Self::load(vb, &config)?;
        info!("Encoder loaded with {} blocks", encoder.blocks.len());
        Ok((encoder, device))
    }

    /// Hidden width of the encoder.
    pub fn d_model(&self) -> usize {
        self.d_model
    }
}

impl TextEncoderStack for Umt5Encoder {
    fn embed(&self, input_ids: &Tensor) -> Result<Tensor> {
        Ok(self.shared.forward(input_ids)?)
    }

    fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    fn forward_block(
        &self,
        index: usize,
        hidden: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let block = self
            .blocks
            .get(index)
            .with_context(|| format!("encoder block {index} out of range"))?;
        block.forward(hidden, mask)
    }

    fn final_norm(&self, hidden: &Tensor) -> Result<Tensor> {
        Ok(self.final_layer_norm.forward(hidden)?)
    }

    fn projection(&self) -> Option<&Tensor> {
        self.text_projection.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use candle_core::Device;

    use super::*;

    #[test]
    fn test_bucket_zero_and_adjacent() {
        // 32 buckets, max distance 128: the reference values
        assert_eq!(relative_position_bucket(0, 32, 128), 0);
        assert_eq!(relative_position_bucket(-1, 32, 128), 1);
        assert_eq!(relative_position_bucket(1, 32, 128), 17);
    }

    #[test]
    fn test_bucket_exact_range() {
        // Exact up to half/2 = 8 in each direction
        for distance in 1..8 {
            assert_eq!(relative_position_bucket(-distance, 32, 128) as i64, distance);
            assert_eq!(
                relative_position_bucket(distance, 32, 128) as i64,
                16 + distance
            );
        }
    }

    #[test]
    fn test_bucket_log_region_monotonic_and_capped() {
        let mut previous = 0;
        for distance in 8..=256 {
            let bucket = relative_position_bucket(-distance, 32, 128);
            assert!(bucket >= previous);
            assert!(bucket <= 15);
            previous = bucket;
        }
        // Far beyond max_distance clamps to the last bucket of the sign
        assert_eq!(relative_position_bucket(-10_000, 32, 128), 15);
        assert_eq!(relative_position_bucket(10_000, 32, 128), 31);
    }

    fn tiny_config(num_layers: usize, projection_dim: Option<usize>) -> Umt5Config {
        Umt5Config {
            d_model: 8,
            d_kv: 4,
            d_ff: 16,
            num_layers,
            num_heads: 2,
            vocab_size: 32,
            relative_attention_num_buckets: 8,
            relative_attention_max_distance: 16,
            layer_norm_epsilon: 1e-6,
            projection_dim,
        }
    }

    fn randn(dims: (usize, usize), device: &Device) -> Tensor {
        Tensor::randn(0f32, 0.05f32, dims, device).unwrap()
    }

    fn norm_weight(d_model: usize, device: &Device) -> Tensor {
        Tensor::ones(d_model, DType::F32, device).unwrap()
    }

    fn tiny_weights(
        config: &Umt5Config,
        with_projection: bool,
        device: &Device,
    ) -> HashMap<String, Tensor> {
        let mut weights = HashMap::new();
        let inner = config.num_heads * config.d_kv;

        weights.insert(
            "shared.weight".to_string(),
            randn((config.vocab_size, config.d_model), device),
        );
        for i in 0..config.num_layers {
            let block = format!("encoder.block.{i}");
            for (name, dims) in [
                ("layer.0.SelfAttention.q.weight", (inner, config.d_model)),
                ("layer.0.SelfAttention.k.weight", (inner, config.d_model)),
                ("layer.0.SelfAttention.v.weight", (inner, config.d_model)),
                ("layer.0.SelfAttention.o.weight", (config.d_model, inner)),
                (
                    "layer.0.SelfAttention.relative_attention_bias.weight",
                    (config.relative_attention_num_buckets, config.num_heads),
                ),
                (
                    "layer.1.DenseReluDense.wi_0.weight",
                    (config.d_ff, config.d_model),
                ),
                (
                    "layer.1.DenseReluDense.wi_1.weight",
                    (config.d_ff, config.d_model),
                ),
                (
                    "layer.1.DenseReluDense.wo.weight",
                    (config.d_model, config.d_ff),
                ),
            ] {
                weights.insert(format!("{block}.{name}"), randn(dims, device));
            }
            weights.insert(
                format!("{block}.layer.0.layer_norm.weight"),
                norm_weight(config.d_model, device),
            );
            weights.insert(
                format!("{block}.layer.1.layer_norm.weight"),
                norm_weight(config.d_model, device),
            );
        }
        weights.insert(
            "encoder.final_layer_norm.weight".to_string(),
            norm_weight(config.d_model, device),
        );
        if with_projection {
            let dim = config.projection_dim.unwrap_or(config.d_model);
            weights.insert(
                "text_projection".to_string(),
                randn((config.d_model, dim), device),
            );
        }

        weights
    }

    fn tiny_encoder(
        num_layers: usize,
        projection_dim: Option<usize>,
        device: &Device,
    ) -> Umt5Encoder {
        let config = tiny_config(num_layers, projection_dim);
        let weights = tiny_weights(&config, projection_dim.is_some(), device);
        let vb = VarBuilder::from_tensors(weights, DType::F32, device);
        Umt5Encoder::load(vb, &config).unwrap()
    }

    #[test]
    fn test_tiny_encoder_loads() {
        let device = Device::Cpu;
        let encoder = tiny_encoder(3, None, &device);
        assert_eq!(encoder.num_blocks(), 3);
        assert_eq!(encoder.d_model(), 8);
        assert!(encoder.projection().is_none());
    }

    #[test]
    fn test_block_forward_preserves_shape() {
        let device = Device::Cpu;
        let encoder = tiny_encoder(2, None, &device);

        let ids = Tensor::new(&[[1u32, 5, 9, 2]], &device).unwrap();
        let hidden = encoder.embed(&ids).unwrap();
        assert_eq!(hidden.dims(), &[1, 4, 8]);

        let hidden = encoder.forward_block(0, &hidden, None).unwrap();
        assert_eq!(hidden.dims(), &[1, 4, 8]);
    }

    #[test]
    fn test_loader_rejects_missing_shared() {
        let device = Device::Cpu;
        let config = tiny_config(2, None);
        let mut weights = tiny_weights(&config, false, &device);
        weights.remove("shared.weight");
        let vb = VarBuilder::from_tensors(weights, DType::F32, &device);

        let err = Umt5Encoder::load(vb, &config).unwrap_err();
        let err = err.downcast_ref::<ClipSkipError>().unwrap();
        assert_eq!(
            *err,
            ClipSkipError::MissingComponent {
                path: "shared".to_string()
            }
        );
    }

    #[test]
    fn test_loader_rejects_missing_final_layer_norm() {
        let device = Device::Cpu;
        let config = tiny_config(2, None);
        let mut weights = tiny_weights(&config, false, &device);
        weights.remove("encoder.final_layer_norm.weight");
        let vb = VarBuilder::from_tensors(weights, DType::F32, &device);

        let err = Umt5Encoder::load(vb, &config).unwrap_err();
        let err = err.downcast_ref::<ClipSkipError>().unwrap();
        assert_eq!(
            *err,
            ClipSkipError::MissingComponent {
                path: "encoder.final_layer_norm".to_string()
            }
        );
    }

    #[test]
    fn test_loader_rejects_missing_blocks() {
        let device = Device::Cpu;
        let config = tiny_config(2, None);
        let mut weights = tiny_weights(&config, false, &device);
        weights.retain(|name, _| !name.starts_with("encoder.block."));
        let vb = VarBuilder::from_tensors(weights, DType::F32, &device);

        let err = Umt5Encoder::load(vb, &config).unwrap_err();
        let err = err.downcast_ref::<ClipSkipError>().unwrap();
        assert_eq!(
            *err,
            ClipSkipError::MissingComponent {
                path: "encoder.block".to_string()
            }
        );
    }

    #[test]
    fn test_projection_loaded_when_configured() {
        let device = Device::Cpu;
        let encoder = tiny_encoder(2, Some(6), &device);
        let projection = encoder.projection().unwrap();
        assert_eq!(projection.dims(), &[8, 6]);
    }
}
