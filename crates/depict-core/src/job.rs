//! Job request and result types.
//!
//! A job is one discrete unit of rendering work tied to a widget. Each
//! job type is a distinct [`JobRequest`] variant carrying only the fields
//! it needs, so the type system enforces what the options bags alone
//! cannot.

use serde::{Deserialize, Serialize};

use crate::options::{DrawOptions, LayoutOptions, canonical_json};

/// Unique identifier for an on-screen widget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WidgetId(u64);

impl WidgetId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for WidgetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "widget_{}", self.0)
    }
}

/// Discriminant of a [`JobRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    /// Generate coordinates from the molecule's own connectivity.
    LayoutNative,
    /// Generate coordinates aligned to one or more scaffolds.
    LayoutAligned,
    /// Discard existing coordinates and lay out from scratch.
    LayoutRebuild,
    /// Synthesize an image from an already laid-out structure.
    RenderImage,
    /// Compute the maximum common substructure overlap with scaffolds.
    ComputeOverlap,
}

impl JobKind {
    /// Stable name used in job fingerprints and log output.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LayoutNative => "layout_native",
            Self::LayoutAligned => "layout_aligned",
            Self::LayoutRebuild => "layout_rebuild",
            Self::RenderImage => "render_image",
            Self::ComputeOverlap => "compute_overlap",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rendering or computation request, one variant per job type.
#[derive(Debug, Clone, PartialEq)]
pub enum JobRequest {
    /// Lay out a molecule using its own connectivity.
    LayoutNative {
        /// Molecule descriptor (SMILES or serialized structure).
        molecule: String,
        options: LayoutOptions,
    },
    /// Lay out a molecule aligned to scaffold templates.
    LayoutAligned {
        molecule: String,
        /// Scaffold descriptors tried in order until one matches.
        scaffolds: Vec<String>,
        options: LayoutOptions,
    },
    /// Rebuild the layout, discarding any existing coordinates.
    LayoutRebuild {
        molecule: String,
        options: LayoutOptions,
    },
    /// Render a laid-out structure to an image.
    RenderImage {
        /// Serialized structure produced by a previous layout job.
        structure: String,
        options: DrawOptions,
    },
    /// Compute the scaffold overlap without generating a layout.
    ComputeOverlap {
        molecule: String,
        scaffolds: Vec<String>,
        options: LayoutOptions,
    },
}

impl JobRequest {
    pub fn kind(&self) -> JobKind {
        match self {
            Self::LayoutNative { .. } => JobKind::LayoutNative,
            Self::LayoutAligned { .. } => JobKind::LayoutAligned,
            Self::LayoutRebuild { .. } => JobKind::LayoutRebuild,
            Self::RenderImage { .. } => JobKind::RenderImage,
            Self::ComputeOverlap { .. } => JobKind::ComputeOverlap,
        }
    }

    /// The primary input: the molecule descriptor, or the serialized
    /// structure for render jobs.
    pub fn primary_input(&self) -> &str {
        match self {
            Self::LayoutNative { molecule, .. }
            | Self::LayoutAligned { molecule, .. }
            | Self::LayoutRebuild { molecule, .. }
            | Self::ComputeOverlap { molecule, .. } => molecule,
            Self::RenderImage { structure, .. } => structure,
        }
    }

    /// Scaffold descriptors, empty for job types without one.
    pub fn scaffolds(&self) -> &[String] {
        match self {
            Self::LayoutAligned { scaffolds, .. } | Self::ComputeOverlap { scaffolds, .. } => {
                scaffolds
            }
            _ => &[],
        }
    }

    fn options_canonical(&self) -> String {
        match self {
            Self::LayoutNative { options, .. }
            | Self::LayoutAligned { options, .. }
            | Self::LayoutRebuild { options, .. }
            | Self::ComputeOverlap { options, .. } => canonical_json(options),
            Self::RenderImage { options, .. } => canonical_json(options),
        }
    }
}

/// Deterministic fingerprint of a job.
///
/// Pipe-joined from the widget, job kind, primary input, scaffolds, and
/// the canonical option JSON. Two jobs with equal fingerprints are
/// redundant: within a child queue only the most recent survives.
pub fn fingerprint(widget: WidgetId, request: &JobRequest) -> String {
    format!(
        "{}|{}|{}|{}|{}",
        widget,
        request.kind(),
        request.primary_input(),
        request.scaffolds().join(","),
        request.options_canonical()
    )
}

/// One scaffold match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    /// Index of the matched scaffold in the request's scaffold list.
    pub scaffold_index: usize,
    /// Pairs of (molecule atom, scaffold atom) indices.
    pub atom_map: Vec<(u32, u32)>,
}

/// The computed payload of a finished job.
///
/// Failed computations surface as `None` payload fields, never as
/// errors; an absent payload means "answer unavailable", which is
/// distinct from the job being superseded before it ran.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutput {
    /// Result of a native layout.
    Layout {
        structure: Option<String>,
        has_own_coordinates: bool,
    },
    /// Result of a scaffold-aligned layout. `match_result` is `None`
    /// when alignment failed and the layout fell back to native.
    AlignedLayout {
        structure: Option<String>,
        match_result: Option<MatchResult>,
        has_own_coordinates: bool,
    },
    /// Result of a layout rebuild.
    RebuiltLayout { structure: Option<String> },
    /// Rendered image (SVG), `None` when all render attempts failed.
    Image { svg: Option<String> },
    /// Scaffold overlap, `None` when no scaffold matched.
    Overlap { match_result: Option<MatchResult> },
}
