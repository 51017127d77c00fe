// Pedantic clippy configuration for ML/math code:
#![allow(clippy::cast_precision_loss)] // usize→f64 intentional in bucket math
#![allow(clippy::cast_possible_truncation)] // usize→u32 in tensor indexing
#![allow(clippy::cast_possible_wrap)] // usize→i64 in relative positions
#![allow(clippy::similar_names)] // wi_0/wi_1, q/k/v are the checkpoint names
#![allow(clippy::module_name_repetitions)] // ClipSkipError in error.rs is fine
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive

//! clip-skip-rs: CLIP skip for UMT5 text encoders
//!
//! Shortens a text encoder's forward pass by skipping a configurable number
//! of trailing transformer encoder blocks, trading conditioning depth for
//! speed. The handle you pass in is never modified: you get back a clone
//! whose forward plan runs only the first `total - skip` blocks, then the
//! final layer norm and (if the checkpoint carries one) the output
//! projection.
//!
//! ## Architecture
//!
//! - `model`: `ClipHandle` wrapper, the `TextEncoderStack` capability trait,
//!   and the two forward strategies (pass-through, truncated)
//! - `skip`: validation and the plan swap, the actual CLIP-skip operation
//! - `forward_umt5`: UMT5 encoder forward pass (per-block relative position
//!   bias, gated-GELU feed-forward, RMS norms)
//! - `masks`: padding mask expansion for the bidirectional encoder
//! - `node`: registration metadata for a node-graph host
//! - `error`: the typed error kinds a host can match on
//!
//! ## Example
//!
//! ```ignore
//! use clip_skip_rs::{ClipHandle, Umt5Encoder};
//! use std::sync::Arc;
//!
//! let (encoder, device) = Umt5Encoder::from_pretrained("google/umt5-small", false)?;
//! let clip = ClipHandle::new(Arc::new(encoder));
//!
//! // Skip the last 2 encoder blocks; `clip` itself is untouched.
//! let skipped = clip.with_skipped_layers(2)?;
//! let output = skipped.encode(&input_ids, Some(&attention_mask))?;
//! println!("{:?}", output.last_hidden_state.dims());
//! ```

pub mod error;
pub mod forward_umt5;
pub mod masks;
pub mod model;
pub mod node;
pub mod skip;

pub use error::ClipSkipError;
pub use forward_umt5::{Umt5Config, Umt5Encoder};
pub use masks::expand_attention_mask;
pub use model::{ClipHandle, EncoderOutput, ForwardPlan, TextEncoderStack};
pub use node::{descriptor, NodeDescriptor};
pub use skip::MAX_SKIP_LAYERS;
