//! The computation engine interface and its call wrapper.
//!
//! The engine itself is external and opaque; this module pins down its
//! contract as the [`StructureEngine`] trait and wraps every call in
//! [`run_request`], which turns engine failures into empty result
//! payloads after the documented fallback chain. The orchestration layer
//! never observes an engine error.

use crate::error::EngineResult;
use crate::job::{JobOutput, JobRequest, MatchResult};
use crate::options::{DrawOptions, LayoutOptions};

/// Result of a native layout computation.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeLayout {
    /// Serialized structure with generated coordinates.
    pub structure: String,
    /// Whether the input already carried usable coordinates.
    pub has_own_coordinates: bool,
}

/// Result of a scaffold-aligned layout computation.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignedLayout {
    pub structure: String,
    /// The scaffold match the layout was aligned to, `None` when
    /// alignment failed but a layout was still produced.
    pub match_result: Option<MatchResult>,
    pub has_own_coordinates: bool,
}

/// One heavyweight computation engine instance.
///
/// Implementations are expensive to construct (each worker hosts exactly
/// one) and need not be thread-safe: a worker owns its engine and calls
/// it from a single thread. `Send` is required so the instance can move
/// into the worker thread at startup.
pub trait StructureEngine: Send {
    /// Generate coordinates from the molecule's own connectivity.
    fn layout_native(
        &mut self,
        molecule: &str,
        options: &LayoutOptions,
    ) -> EngineResult<NativeLayout>;

    /// Generate coordinates aligned to the first matching scaffold.
    fn layout_aligned(
        &mut self,
        molecule: &str,
        scaffolds: &[String],
        options: &LayoutOptions,
    ) -> EngineResult<AlignedLayout>;

    /// Discard existing coordinates and lay out from scratch.
    /// Returns the serialized structure.
    fn layout_rebuild(&mut self, molecule: &str, options: &LayoutOptions) -> EngineResult<String>;

    /// Render a laid-out structure to SVG.
    fn render_image(&mut self, structure: &str, options: &DrawOptions) -> EngineResult<String>;

    /// Compute the maximum common substructure overlap with scaffolds.
    /// `Ok(None)` means no scaffold matched.
    fn compute_overlap(
        &mut self,
        molecule: &str,
        scaffolds: &[String],
        options: &LayoutOptions,
    ) -> EngineResult<Option<MatchResult>>;
}

/// Execute one request against an engine, absorbing failures.
///
/// Fallback chain:
/// - `RenderImage`: on failure with `strict_aromaticity` set, clear the
///   flag and retry once; a second failure yields an empty image.
/// - `LayoutAligned`: on failure, fall back to a native layout with no
///   match result; if that also fails, yield an empty layout.
/// - All other kinds: a failure yields an empty payload directly.
pub fn run_request(engine: &mut dyn StructureEngine, request: JobRequest) -> JobOutput {
    match request {
        JobRequest::LayoutNative { molecule, options } => {
            match engine.layout_native(&molecule, &options) {
                Ok(layout) => JobOutput::Layout {
                    structure: Some(layout.structure),
                    has_own_coordinates: layout.has_own_coordinates,
                },
                Err(e) => {
                    tracing::warn!("native layout failed: {}", e);
                    JobOutput::Layout {
                        structure: None,
                        has_own_coordinates: false,
                    }
                }
            }
        }
        JobRequest::LayoutAligned {
            molecule,
            scaffolds,
            options,
        } => match engine.layout_aligned(&molecule, &scaffolds, &options) {
            Ok(layout) => JobOutput::AlignedLayout {
                structure: Some(layout.structure),
                match_result: layout.match_result,
                has_own_coordinates: layout.has_own_coordinates,
            },
            Err(e) => {
                tracing::warn!("aligned layout failed, falling back to native: {}", e);
                match engine.layout_native(&molecule, &options) {
                    Ok(layout) => JobOutput::AlignedLayout {
                        structure: Some(layout.structure),
                        match_result: None,
                        has_own_coordinates: layout.has_own_coordinates,
                    },
                    Err(e) => {
                        tracing::warn!("native fallback failed: {}", e);
                        JobOutput::AlignedLayout {
                            structure: None,
                            match_result: None,
                            has_own_coordinates: false,
                        }
                    }
                }
            }
        },
        JobRequest::LayoutRebuild { molecule, options } => {
            match engine.layout_rebuild(&molecule, &options) {
                Ok(structure) => JobOutput::RebuiltLayout {
                    structure: Some(structure),
                },
                Err(e) => {
                    tracing::warn!("layout rebuild failed: {}", e);
                    JobOutput::RebuiltLayout { structure: None }
                }
            }
        }
        JobRequest::RenderImage { structure, options } => JobOutput::Image {
            svg: render_with_retry(engine, &structure, options),
        },
        JobRequest::ComputeOverlap {
            molecule,
            scaffolds,
            options,
        } => match engine.compute_overlap(&molecule, &scaffolds, &options) {
            Ok(match_result) => JobOutput::Overlap { match_result },
            Err(e) => {
                tracing::warn!("overlap computation failed: {}", e);
                JobOutput::Overlap { match_result: None }
            }
        },
    }
}

/// Render with the documented retry: one attempt with the options as
/// given, and if that fails with `strict_aromaticity` set, one more with
/// the flag cleared.
fn render_with_retry(
    engine: &mut dyn StructureEngine,
    structure: &str,
    options: DrawOptions,
) -> Option<String> {
    match engine.render_image(structure, &options) {
        Ok(svg) => Some(svg),
        Err(e) if options.strict_aromaticity => {
            tracing::warn!("render failed, retrying with relaxed aromaticity: {}", e);
            let relaxed = DrawOptions {
                strict_aromaticity: false,
                ..options
            };
            match engine.render_image(structure, &relaxed) {
                Ok(svg) => Some(svg),
                Err(e) => {
                    tracing::warn!("render retry failed: {}", e);
                    None
                }
            }
        }
        Err(e) => {
            tracing::warn!("render failed: {}", e);
            None
        }
    }
}
