#![forbid(unsafe_code)]
//! File layer for the LSS storage engine.
//!
//! One fixed-size database file, positional I/O with a direct-I/O
//! preference, the create/rename/unlink lifecycle, and the
//! conflict-resolving layer that orders overlapping requests so
//! callers observe single-writer, read-after-write semantics per byte
//! range.

mod conflict;
mod device;
mod opener;

pub use conflict::{ActionId, ActionKind, ConflictResolver, ConflictResolvingDevice, SubmitOutcome};
pub use device::{AlignedVec, ByteDevice, DirectIo, FileByteDevice, MemoryByteDevice};
pub use opener::{FileOpener, MemFileOpener, PathFileOpener};
