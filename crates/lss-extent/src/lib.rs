#![forbid(unsafe_code)]
//! Extent allocation over the database file.
//!
//! The file is a sequence of fixed-size extents. Extent 0 holds the
//! static header and extent 1 the metablock ring; everything after
//! that is handed out to the LBA index and the data-block manager on
//! demand. Allocation is visible immediately; release is deferred
//! through an [`ExtentTxn`] so a freed extent cannot be reused until
//! the metablock that stops referencing it is durable.

use asupersync::Cx;
use lss_error::{LssError, Result};
use lss_file::ByteDevice;
use lss_types::StaticConfig;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, trace};

/// What an extent is currently used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtentKind {
    StaticHeader,
    Metablock,
    Lba,
    Data,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    InUse(ExtentKind),
}

/// Root carried in the metablock: how far the file has grown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExtentRoot {
    pub extent_count: u64,
}

/// Batches extent releases for one index write.
///
/// Frees recorded here take effect only at [`ExtentManager::commit_transaction`],
/// after the corresponding metablock has landed.
#[derive(Debug, Default)]
pub struct ExtentTxn {
    freed: Vec<u64>,
}

/// Counters reported to the stats sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExtentReport {
    pub extent_count: u64,
    pub extents_in_use: u64,
}

#[derive(Debug)]
struct EmState {
    slots: Vec<SlotState>,
}

/// Allocates and reclaims fixed-size extents over the file.
#[derive(Debug)]
pub struct ExtentManager {
    config: StaticConfig,
    device: Arc<dyn ByteDevice>,
    state: Mutex<EmState>,
}

impl ExtentManager {
    /// Root for a freshly created store: the static header extent and
    /// the metablock extent exist, nothing else.
    #[must_use]
    pub fn initial_root() -> ExtentRoot {
        ExtentRoot { extent_count: 2 }
    }

    /// Attach to an existing file whose growth high-water mark is in `root`.
    ///
    /// All extents start out free; each subsystem re-reserves the extents
    /// it owns while the serializer reconstructs its state.
    pub fn start_existing(
        config: StaticConfig,
        device: Arc<dyn ByteDevice>,
        root: ExtentRoot,
    ) -> Result<Self> {
        let count = usize::try_from(root.extent_count)
            .map_err(|_| LssError::Format("extent count does not fit usize".to_owned()))?;
        if count < 2 {
            return Err(LssError::Format(format!(
                "extent count {count} is below the static header + metablock minimum"
            )));
        }
        let expected_len = root.extent_count * config.extent_size.get();
        if device.len_bytes() < expected_len {
            return Err(LssError::Format(format!(
                "file is shorter than its extent map: len={} expected>={expected_len}",
                device.len_bytes()
            )));
        }
        Ok(Self {
            config,
            device,
            state: Mutex::new(EmState {
                slots: vec![SlotState::Free; count],
            }),
        })
    }

    fn extent_index(&self, offset: u64) -> usize {
        debug_assert_eq!(offset % self.config.extent_size.get(), 0);
        usize::try_from(offset / self.config.extent_size.get()).unwrap_or(usize::MAX)
    }

    /// Claim a specific extent during recovery.
    ///
    /// # Panics
    /// If the extent is outside the file or already claimed; both are
    /// recovery-logic bugs.
    pub fn reserve_extent(&self, offset: u64, kind: ExtentKind) {
        let index = self.extent_index(offset);
        let mut state = self.state.lock();
        let slot = state
            .slots
            .get_mut(index)
            .unwrap_or_else(|| panic!("reserved extent {offset} beyond the file"));
        assert_eq!(
            *slot,
            SlotState::Free,
            "extent {offset} reserved twice during recovery"
        );
        *slot = SlotState::InUse(kind);
        trace!(target: "lss::extent", event = "reserve", offset, kind = ?kind);
    }

    /// Allocate an extent, growing the file if none are free.
    pub fn gen_extent(&self, cx: &Cx, kind: ExtentKind) -> Result<u64> {
        let extent_size = self.config.extent_size.get();
        let mut state = self.state.lock();

        let index = if let Some(free) = state
            .slots
            .iter()
            .position(|slot| *slot == SlotState::Free)
        {
            free
        } else {
            let index = state.slots.len();
            let new_len = (index as u64 + 1) * extent_size;
            self.device.set_len_bytes(cx, new_len)?;
            state.slots.push(SlotState::Free);
            debug!(target: "lss::extent", event = "file_grown", extents = index + 1);
            index
        };

        state.slots[index] = SlotState::InUse(kind);
        let offset = index as u64 * extent_size;
        trace!(target: "lss::extent", event = "gen", offset, kind = ?kind);
        Ok(offset)
    }

    /// Record a release; it takes effect when the transaction commits.
    ///
    /// # Panics
    /// If the extent is not currently in use.
    pub fn release_extent(&self, txn: &mut ExtentTxn, offset: u64) {
        let index = self.extent_index(offset);
        let state = self.state.lock();
        assert!(
            matches!(state.slots.get(index), Some(SlotState::InUse(_))),
            "released extent {offset} that is not in use"
        );
        drop(state);
        txn.freed.push(offset);
        trace!(target: "lss::extent", event = "release_queued", offset);
    }

    /// Begin the per-index-write transaction.
    #[must_use]
    pub fn begin_transaction(&self) -> ExtentTxn {
        ExtentTxn::default()
    }

    /// Apply the queued frees; the extents become reusable.
    pub fn commit_transaction(&self, txn: ExtentTxn) {
        if txn.freed.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        for offset in txn.freed {
            let index = usize::try_from(offset / self.config.extent_size.get()).unwrap_or(0);
            state.slots[index] = SlotState::Free;
            trace!(target: "lss::extent", event = "released", offset);
        }
    }

    /// Root to store in the next metablock.
    #[must_use]
    pub fn prepare_metablock(&self) -> ExtentRoot {
        ExtentRoot {
            extent_count: self.state.lock().slots.len() as u64,
        }
    }

    #[must_use]
    pub fn report(&self) -> ExtentReport {
        let state = self.state.lock();
        ExtentReport {
            extent_count: state.slots.len() as u64,
            extents_in_use: state
                .slots
                .iter()
                .filter(|slot| matches!(slot, SlotState::InUse(_)))
                .count() as u64,
        }
    }

    #[must_use]
    pub fn static_config(&self) -> StaticConfig {
        self.config
    }
}
