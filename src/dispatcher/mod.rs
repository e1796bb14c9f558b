//! Frame Dispatcher Module
//!
//! This module turns the segment traffic of each producer into complete
//! frames and applies the "freshest frame wins" delivery policy.
//!
//! ## Modules
//!
//! - `frame`: `Frame` and the per-stream reassembly state
//! - `dispatcher`: `FrameDispatcher`, the consumer-facing API

#[allow(clippy::module_inception)]
pub mod dispatcher;
pub mod frame;

// Re-export commonly used types
pub use dispatcher::{DispatcherStats, FrameDispatcher};
pub use frame::{DropReason, Frame, FrameState, IngestOutcome};
