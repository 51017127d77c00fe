//! Host registration surface for the CLIP-skip node.
//!
//! Pure configuration plus one thin entry point. A node-graph host binding
//! layer serializes [`descriptor`] to advertise the node and routes the
//! wired inputs into [`apply`]; nothing here owns any logic beyond that.

use anyhow::Result;
use serde::Serialize;

use crate::model::ClipHandle;
use crate::skip::MAX_SKIP_LAYERS;

/// Stable node identifier.
pub const NODE_ID: &str = "CLIPSkip";

/// Human-readable node label.
pub const NODE_LABEL: &str = "CLIP Skip (WAN)";

/// Category the host files the node under.
pub const NODE_CATEGORY: &str = "conditioning";

/// A handle-typed node input.
#[derive(Debug, Clone, Serialize)]
pub struct HandleInput {
    pub name: &'static str,
    pub type_name: &'static str,
    pub tooltip: &'static str,
}

/// A bounded integer node input.
#[derive(Debug, Clone, Serialize)]
pub struct IntInput {
    pub name: &'static str,
    pub default: i64,
    pub min: i64,
    pub max: i64,
    pub step: i64,
    pub tooltip: &'static str,
}

/// Complete registration metadata for the node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeDescriptor {
    pub id: &'static str,
    pub label: &'static str,
    pub category: &'static str,
    pub description: &'static str,
    pub clip_input: HandleInput,
    pub skip_input: IntInput,
    pub output_types: &'static [&'static str],
}

/// Registration metadata for the CLIP-skip node.
pub fn descriptor() -> NodeDescriptor {
    NodeDescriptor {
        id: NODE_ID,
        label: NODE_LABEL,
        category: NODE_CATEGORY,
        description:
            "Modifies a WAN CLIP model (e.g., umt5_xxl) to skip a specified number of encoder layers.",
        clip_input: HandleInput {
            name: "clip",
            type_name: "CLIP",
            tooltip: "CLIP model (e.g., from CLIPLoader with type 'wan', like umt5_xxl)",
        },
        skip_input: IntInput {
            name: "skip_layers",
            default: 1,
            min: 0,
            max: MAX_SKIP_LAYERS as i64,
            step: 1,
            tooltip: "Number of CLIP layers to skip (0 = no skip)",
        },
        output_types: &["CLIP"],
    }
}

/// Node entry point: validate `skip_layers` and return the modified handle.
pub fn apply(clip: &ClipHandle, skip_layers: i64) -> Result<ClipHandle> {
    clip.with_skipped_layers(skip_layers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_identity() {
        let node = descriptor();
        assert_eq!(node.id, "CLIPSkip");
        assert_eq!(node.label, "CLIP Skip (WAN)");
        assert_eq!(node.category, "conditioning");
    }

    #[test]
    fn test_skip_input_bounds() {
        let skip = descriptor().skip_input;
        assert_eq!(skip.name, "skip_layers");
        assert_eq!(skip.default, 1);
        assert_eq!(skip.min, 0);
        assert_eq!(skip.max, 24);
        assert_eq!(skip.step, 1);
    }

    #[test]
    fn test_single_clip_output() {
        let node = descriptor();
        assert_eq!(node.output_types, &["CLIP"]);
        assert_eq!(node.clip_input.type_name, "CLIP");
    }

    #[test]
    fn test_descriptor_serializes() {
        let json = serde_json::to_string(&descriptor()).unwrap();
        assert!(json.contains("\"skip_layers\""));
        assert!(json.contains("\"CLIPSkip\""));
    }
}
