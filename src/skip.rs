//! Trailing-block skipping ("CLIP skip") for text encoder handles.
//!
//! Validation order is part of the contract:
//!
//! 1. bound check against [`MAX_SKIP_LAYERS`] (before any clone)
//! 2. clone; `skip_layers == 0` returns the clone unchanged, no validation
//! 3. structural check on the clone's stack
//! 4. depth check against the actual block count
//! 5. swap the clone's plan to the truncated strategy

use anyhow::Result;
use tracing::info;

use crate::error::ClipSkipError;
use crate::model::{ClipHandle, ForwardPlan};

/// Fixed upper bound for `skip_layers`, matching the 24-block depth of the
/// UMT5-XXL encoder family.
///
/// Deliberately not derived from the handle: a deeper future model is capped
/// here until the constant is revisited.
pub const MAX_SKIP_LAYERS: usize = 24;

impl ClipHandle {
    /// Return a clone of this handle whose forward pass omits the last
    /// `skip_layers` encoder blocks.
    ///
    /// `self` is never modified; concurrent calls on the same handle each
    /// produce an independent clone. `skip_layers == 0` is a no-op fast
    /// path that returns the clone with the original pass-through plan.
    ///
    /// Fails with [`ClipSkipError::SkipOutOfRange`] outside `[0, 24]`, with
    /// [`ClipSkipError::MissingComponent`] when the stack reports a missing
    /// required component, and with [`ClipSkipError::SkipExceedsDepth`]
    /// when no blocks would remain.
    pub fn with_skipped_layers(&self, skip_layers: i64) -> Result<ClipHandle> {
        if skip_layers < 0 || skip_layers > MAX_SKIP_LAYERS as i64 {
            return Err(ClipSkipError::SkipOutOfRange {
                value: skip_layers,
                max: MAX_SKIP_LAYERS,
            }
            .into());
        }
        let skip_layers = skip_layers as usize;

        let mut modified = self.clone();
        if skip_layers == 0 {
            return Ok(modified);
        }

        if let Some(path) = modified.model().missing_component() {
            return Err(ClipSkipError::MissingComponent {
                path: path.to_string(),
            }
            .into());
        }
        let total_blocks = modified.num_blocks();
        if total_blocks == 0 {
            return Err(ClipSkipError::MissingComponent {
                path: "encoder.block".to_string(),
            }
            .into());
        }

        if skip_layers >= total_blocks {
            return Err(ClipSkipError::SkipExceedsDepth {
                skip_layers,
                total_blocks,
            }
            .into());
        }

        let keep_blocks = total_blocks - skip_layers;
        info!("skipping {skip_layers} of {total_blocks} encoder blocks, keeping {keep_blocks}");
        modified.set_plan(ForwardPlan::Truncated { keep_blocks });
        Ok(modified)
    }
}
