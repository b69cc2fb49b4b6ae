#![forbid(unsafe_code)]
//! LSS public API facade.
//!
//! Re-exports the serializer front-end and the pieces a buffer cache
//! above it needs. This is the crate downstream consumers depend on.

pub use lss_core::*;
pub use lss_error::{LssError, Result};
pub use lss_file::{FileOpener, MemFileOpener, PathFileOpener};
pub use lss_types::{BlockId, BlockSequenceId, DynamicConfig, Recency, StaticConfig};
