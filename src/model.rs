//! Text encoder handle and the forward-strategy seam.
//!
//! The host hands around [`ClipHandle`]s: cheap clones sharing one immutable
//! weight stack behind an `Arc`, each clone carrying its own [`ForwardPlan`].
//! Swapping the plan on a clone is the statically typed rendition of
//! monkey-patching a `forward` method; the original handle is never touched.

use std::sync::Arc;

use anyhow::Result;
use candle_core::Tensor;
use tracing::debug;

use crate::masks::expand_attention_mask;

/// Capability interface a text encoder must implement to be skippable.
///
/// This replaces attribute-presence probing on an opaque model object: the
/// required components (embedding table, ordered block stack, final norm)
/// are methods, and the optional output projection is an `Option`.
pub trait TextEncoderStack: Send + Sync {
    /// Look up input embeddings for `[batch, seq]` token ids.
    fn embed(&self, input_ids: &Tensor) -> Result<Tensor>;

    /// Number of encoder blocks in the stack.
    fn num_blocks(&self) -> usize;

    /// Run one encoder block. `mask` is an additive `[batch, 1, 1, seq]`
    /// attention mask, already expanded.
    fn forward_block(&self, index: usize, hidden: &Tensor, mask: Option<&Tensor>)
        -> Result<Tensor>;

    /// Apply the final layer norm.
    fn final_norm(&self, hidden: &Tensor) -> Result<Tensor>;

    /// Optional output projection, multiplied into the normed hidden states.
    fn projection(&self) -> Option<&Tensor>;

    /// First missing required component, as a checkpoint weight path.
    ///
    /// `None` means the stack is structurally complete. Loaders that
    /// validate tensor presence up front can rely on the default.
    fn missing_component(&self) -> Option<&'static str> {
        None
    }
}

/// Which forward computation a handle runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardPlan {
    /// Pass-through: every encoder block, original behavior.
    Full,
    /// Only the first `keep_blocks` blocks, then final norm and projection.
    Truncated { keep_blocks: usize },
}

/// Output of the encoder forward pass.
///
/// A single named entry, matching what conditioning consumers read.
pub struct EncoderOutput {
    pub last_hidden_state: Tensor,
}

/// A cloneable text encoder handle with a swappable forward plan.
#[derive(Clone)]
pub struct ClipHandle {
    model: Arc<dyn TextEncoderStack>,
    plan: ForwardPlan,
}

impl std::fmt::Debug for ClipHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClipHandle")
            .field("plan", &self.plan)
            .finish_non_exhaustive()
    }
}

impl ClipHandle {
    /// Wrap an encoder stack with the pass-through plan.
    pub fn new(model: Arc<dyn TextEncoderStack>) -> Self {
        Self {
            model,
            plan: ForwardPlan::Full,
        }
    }

    /// The active forward plan.
    pub fn plan(&self) -> ForwardPlan {
        self.plan
    }

    /// Total encoder blocks in the underlying stack.
    pub fn num_blocks(&self) -> usize {
        self.model.num_blocks()
    }

    pub(crate) fn model(&self) -> &Arc<dyn TextEncoderStack> {
        &self.model
    }

    pub(crate) fn set_plan(&mut self, plan: ForwardPlan) {
        self.plan = plan;
    }

    /// Run the encoder forward according to the active plan.
    ///
    /// `input_ids` is `[batch, seq]` token ids; `attention_mask` is the
    /// host-style `[batch, seq]` 1/0 padding mask. Inference only; no
    /// gradient state is created.
    pub fn encode(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
    ) -> Result<EncoderOutput> {
        let total_blocks = self.model.num_blocks();
        let keep_blocks = match self.plan {
            ForwardPlan::Full => total_blocks,
            ForwardPlan::Truncated { keep_blocks } => keep_blocks,
        };
        debug!("encoding with {keep_blocks}/{total_blocks} encoder blocks");

        let mut hidden = self.model.embed(input_ids)?;
        let additive = match attention_mask {
            Some(mask) => Some(expand_attention_mask(mask, hidden.dtype())?),
            None => None,
        };

        for index in 0..keep_blocks {
            hidden = self.model.forward_block(index, &hidden, additive.as_ref())?;
        }

        let hidden = self.model.final_norm(&hidden)?;
        let hidden = match self.model.projection() {
            Some(projection) => hidden.broadcast_matmul(projection)?,
            None => hidden,
        };

        Ok(EncoderOutput {
            last_hidden_state: hidden,
        })
    }
}
