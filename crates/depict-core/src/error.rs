//! Error types for depict-core.

use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Errors an engine implementation may report.
///
/// These never escape the orchestration layer: the engine-call wrapper in
/// [`crate::engine`] converts them into empty result payloads after the
/// documented fallback chain has been exhausted.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The molecule or scaffold descriptor could not be parsed.
    #[error("failed to parse structure input: {0}")]
    Parse(String),

    /// 2D coordinate generation failed.
    #[error("layout generation failed: {0}")]
    Layout(String),

    /// Scaffold alignment or substructure match failed.
    #[error("scaffold alignment failed: {0}")]
    Alignment(String),

    /// Image synthesis failed.
    #[error("rendering failed: {0}")]
    Render(String),

    /// The engine is in an unusable state.
    #[error("engine failure: {0}")]
    Internal(String),
}
