//! Worker pool and job scheduling for structure rendering.
//!
//! Rendering requests are queued, deduplicated, and dispatched to a
//! fixed set of worker slots, each backed by a lazily-spawned engine
//! thread. Ordinary requests drain FIFO from a shared main queue;
//! widgets with an open session get a dedicated child queue that runs
//! one job at a time and coalesces redundant re-renders.
//!
//! The public surface is [`RenderPool`]; everything else supports it.

pub mod error;
pub mod pool;
pub mod queue;
pub mod scheduler;
pub mod worker;

pub use error::{PoolError, PoolResult};
pub use pool::{PoolConfig, RenderPool, SessionHook};
pub use queue::{JobId, JobOrigin};
pub use worker::EngineFactory;
