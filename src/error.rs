//! Typed errors for the CLIP-skip surface.
//!
//! The rest of the crate returns `anyhow::Result`; these variants exist so
//! the two failure kinds the host cares about stay machine-matchable via
//! `downcast_ref`: a bad `skip_layers` value versus an incompatible model
//! family.

use thiserror::Error;

/// Fatal validation failures of a single skip request.
///
/// None of these are retryable; they propagate to the host unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClipSkipError {
    /// `skip_layers` fell outside the fixed configuration bound.
    #[error("skip_layers must be between 0 and {max}, got {value}")]
    SkipOutOfRange { value: i64, max: usize },

    /// `skip_layers` would leave no encoder blocks to run.
    #[error("skip_layers ({skip_layers}) exceeds total encoder blocks ({total_blocks})")]
    SkipExceedsDepth {
        skip_layers: usize,
        total_blocks: usize,
    },

    /// A required component of the encoder stack is absent, named by the
    /// checkpoint weight path it was expected under.
    #[error("unsupported text encoder structure: expected '{path}'")]
    MissingComponent { path: String },
}
