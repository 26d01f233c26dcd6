//! Domain model for the depict structure renderer.
//!
//! This crate provides:
//! - Widget identity and the job request/result unions
//! - Layout and draw option bags with canonical fingerprinting
//! - The `StructureEngine` trait abstracting the external engine
//! - The engine-call wrapper with the render retry fallback chain

pub mod engine;
pub mod error;
pub mod job;
pub mod options;

pub use engine::{AlignedLayout, NativeLayout, StructureEngine, run_request};
pub use error::{EngineError, EngineResult};
pub use job::{JobKind, JobOutput, JobRequest, MatchResult, WidgetId, fingerprint};
pub use options::{DrawOptions, LayoutOptions};
