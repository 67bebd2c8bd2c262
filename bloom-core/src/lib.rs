pub mod convert;
pub mod engine;
pub mod pipeline;
pub mod recognition;
pub mod runtime;
pub mod screen;
pub mod video;

// Re-export the top-level error type so callers only need `bloom_core::Error`
pub use anyhow::Error;
pub use anyhow::Result;
