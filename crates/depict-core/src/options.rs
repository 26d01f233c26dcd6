//! Option bags for layout computation and image synthesis.
//!
//! Both structs serialize through serde; their canonical JSON form (keys
//! sorted by serde_json's object representation) is what the job
//! fingerprint hashes, so two requests differing only in field order of
//! construction always fingerprint identically.

use serde::{Deserialize, Serialize};

/// Options controlling 2D coordinate generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutOptions {
    /// Kekulize aromatic rings before coordinate generation.
    pub kekulize: bool,
    /// Prefer template-derived coordinates where a template matches.
    pub use_template_coords: bool,
    /// Straighten the depiction after layout.
    pub straighten: bool,
    /// Normalize bond lengths to the default scale.
    pub normalize: bool,
}

impl Default for LayoutOptions {
    fn default() -> Self {
        Self {
            kekulize: true,
            use_template_coords: true,
            straighten: true,
            normalize: true,
        }
    }
}

/// Options controlling image synthesis from a laid-out structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrawOptions {
    /// Canvas width in pixels.
    pub width: u32,
    /// Canvas height in pixels.
    pub height: u32,
    /// Reject structures whose aromatic perception is ambiguous.
    ///
    /// This is the feature flag the render retry clears: when a render
    /// fails with it set, the call is retried once with it cleared
    /// before the job gives up.
    pub strict_aromaticity: bool,
    /// Render on a transparent background instead of white.
    pub transparent_background: bool,
    /// Bond line width in pixels.
    pub bond_line_width: f32,
}

impl Default for DrawOptions {
    fn default() -> Self {
        Self {
            width: 300,
            height: 250,
            strict_aromaticity: true,
            transparent_background: false,
            bond_line_width: 2.0,
        }
    }
}

/// Canonical JSON form of an options bag.
///
/// serde_json's default object representation keeps keys sorted, so the
/// output is deterministic for a given set of field values.
pub(crate) fn canonical_json<T: Serialize>(options: &T) -> String {
    serde_json::to_value(options)
        .map(|value| value.to_string())
        .unwrap_or_default()
}
