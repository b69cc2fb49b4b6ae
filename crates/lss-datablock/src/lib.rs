#![forbid(unsafe_code)]
//! Data-block manager: appends block versions into extents, tracks
//! which offsets are live, and garbage-collects mostly-dead extents.
//!
//! Liveness per written slot has two bits: referenced by the LBA index
//! (`index_live`) and referenced by at least one block token
//! (`token_live`). A slot is garbage when neither is set; an extent
//! whose written slots are all garbage is released, deferred through
//! an extent transaction so reuse waits for the next durable
//! metablock.

use asupersync::Cx;
use lss_error::{LssError, Result};
use lss_extent::{ExtentKind, ExtentManager, ExtentTxn};
use lss_file::{AlignedVec, ByteDevice};
use lss_types::{BLOCK_PREFIX_BYTES, BlockSequenceId, FlaggedOffset, StaticConfig};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, trace};

/// Root carried in the metablock: where appends resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataBlockRoot {
    pub active_extent: FlaggedOffset,
    pub active_next_slot: u64,
}

impl DataBlockRoot {
    #[must_use]
    pub fn initial() -> Self {
        Self {
            active_extent: FlaggedOffset::UNUSED,
            active_next_slot: 0,
        }
    }
}

/// Retargets every reference to a moved block during GC.
///
/// Implemented by the serializer front-end: the single implementation
/// updates block tokens, the LBA entry, and the liveness bits in one
/// critical section.
pub trait GcRemapHandler {
    fn remap_block_to_new_offset(
        &self,
        old_offset: u64,
        new_offset: u64,
        payload: &[u8],
        txn: &mut ExtentTxn,
    );
}

/// Garbage accounting across full data extents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DataBlockReport {
    pub data_extents: u64,
    pub old_total_blocks: u64,
    pub old_garbage_blocks: u64,
    pub extents_gced: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DataExtentState {
    Active,
    Full,
    Collecting,
}

#[derive(Debug)]
struct ExtentEntry {
    state: DataExtentState,
    index_live: Vec<bool>,
    token_live: Vec<bool>,
    /// Slots written so far; equals the slot count once the extent is full.
    written: u64,
}

impl ExtentEntry {
    fn new(state: DataExtentState, slots: usize, written: u64) -> Self {
        Self {
            state,
            index_live: vec![false; slots],
            token_live: vec![false; slots],
            written,
        }
    }

    fn live_slots(&self) -> u64 {
        self.index_live
            .iter()
            .zip(&self.token_live)
            .filter(|(index, token)| **index || **token)
            .count() as u64
    }

    fn garbage_slots(&self) -> u64 {
        self.written - self.live_slots()
    }

    fn fully_dead(&self) -> bool {
        self.written > 0 && self.live_slots() == 0
    }
}

#[derive(Debug)]
struct DbmState {
    extents: HashMap<u64, ExtentEntry>,
    active: Option<u64>,
    active_next: u64,
    reconstructing: bool,
    gc_enabled: bool,
    gc_running: bool,
    extents_gced: u64,
    /// Fully dead extents waiting for the next extent transaction.
    pending_release: Vec<u64>,
}

/// Manages the data extents of the file.
#[derive(Debug)]
pub struct DataBlockManager {
    config: StaticConfig,
    gc_high_ratio: f64,
    gc_low_ratio: f64,
    device: Arc<dyn ByteDevice>,
    extents: Arc<ExtentManager>,
    state: Mutex<DbmState>,
}

impl DataBlockManager {
    pub fn start_existing(
        config: StaticConfig,
        gc_high_ratio: f64,
        gc_low_ratio: f64,
        device: Arc<dyn ByteDevice>,
        extents: Arc<ExtentManager>,
        root: DataBlockRoot,
    ) -> Result<Self> {
        let slots = usize::try_from(config.blocks_per_extent())
            .map_err(|_| LssError::Format("extent slot count does not fit usize".to_owned()))?;
        let mut map = HashMap::new();
        let active = root.active_extent.value();
        if let Some(active) = active {
            if root.active_next_slot > slots as u64 {
                return Err(LssError::Format(format!(
                    "active extent fill position {} exceeds {slots} slots",
                    root.active_next_slot
                )));
            }
            extents.reserve_extent(active, ExtentKind::Data);
            map.insert(
                active,
                ExtentEntry::new(DataExtentState::Active, slots, root.active_next_slot),
            );
        }
        Ok(Self {
            config,
            gc_high_ratio,
            gc_low_ratio,
            device,
            extents,
            state: Mutex::new(DbmState {
                extents: map,
                active,
                active_next: root.active_next_slot,
                reconstructing: false,
                gc_enabled: true,
                gc_running: false,
                extents_gced: 0,
                pending_release: Vec::new(),
            }),
        })
    }

    fn slots(&self) -> usize {
        usize::try_from(self.config.blocks_per_extent()).unwrap_or(usize::MAX)
    }

    /// Begin rebuilding the liveness view from the LBA index.
    pub fn start_reconstruct(&self) {
        self.state.lock().reconstructing = true;
    }

    pub fn end_reconstruct(&self) {
        let mut state = self.state.lock();
        state.reconstructing = false;
        debug!(
            target: "lss::datablock",
            event = "reconstructed",
            extents = state.extents.len()
        );
    }

    /// Append one block; returns the byte offset it landed at.
    ///
    /// `payload` must be exactly the block payload size; the sequence id
    /// prefix is added here. The new slot starts out garbage until the
    /// caller registers a token or the LBA references it.
    pub fn write(&self, cx: &Cx, payload: &[u8], sequence_id: BlockSequenceId) -> Result<u64> {
        let block_bytes = self.config.block_size.bytes();
        if payload.len() != self.config.block_size.payload_bytes() {
            return Err(LssError::Format(format!(
                "block payload size mismatch: got {}, expected {}",
                payload.len(),
                self.config.block_size.payload_bytes()
            )));
        }

        let slots = self.slots();
        let offset = {
            let mut state = self.state.lock();
            let extent = match state.active {
                Some(extent) => extent,
                None => {
                    let extent = self.extents.gen_extent(cx, ExtentKind::Data)?;
                    state
                        .extents
                        .insert(extent, ExtentEntry::new(DataExtentState::Active, slots, 0));
                    state.active = Some(extent);
                    state.active_next = 0;
                    extent
                }
            };
            let slot = state.active_next;
            let offset = extent + slot * block_bytes as u64;
            state.active_next += 1;
            let written = state.active_next;
            let entry = state.extents.get_mut(&extent).expect("active extent entry");
            entry.written = written;
            if written == slots as u64 {
                entry.state = DataExtentState::Full;
                state.active = None;
                state.active_next = 0;
                trace!(target: "lss::datablock", event = "extent_full", extent);
            }
            offset
        };

        let mut block = AlignedVec::new(block_bytes);
        block.as_mut_slice()[..BLOCK_PREFIX_BYTES].copy_from_slice(&sequence_id.0.to_le_bytes());
        block.as_mut_slice()[BLOCK_PREFIX_BYTES..].copy_from_slice(payload);
        self.device.write_all_at(cx, offset, block.as_slice())?;

        trace!(
            target: "lss::datablock",
            event = "block_written",
            offset,
            sequence_id = sequence_id.0
        );
        Ok(offset)
    }

    /// Read the block at `offset` into `payload`, returning its
    /// sequence-id prefix.
    pub fn read(&self, cx: &Cx, offset: u64, payload: &mut [u8]) -> Result<BlockSequenceId> {
        let block_bytes = self.config.block_size.bytes();
        if payload.len() != self.config.block_size.payload_bytes() {
            return Err(LssError::Format(format!(
                "block payload size mismatch: got {}, expected {}",
                payload.len(),
                self.config.block_size.payload_bytes()
            )));
        }
        let mut block = AlignedVec::new(block_bytes);
        self.device.read_exact_at(cx, offset, block.as_mut_slice())?;
        let sequence_id = BlockSequenceId(u64::from_le_bytes(
            block.as_slice()[..BLOCK_PREFIX_BYTES]
                .try_into()
                .expect("8-byte prefix"),
        ));
        payload.copy_from_slice(&block.as_slice()[BLOCK_PREFIX_BYTES..]);
        Ok(sequence_id)
    }

    fn slot_of(&self, offset: u64) -> (u64, usize) {
        (self.config.extent_of(offset), self.config.slot_of(offset))
    }

    /// The LBA index now references `offset`.
    ///
    /// During reconstruction this also claims the containing extent.
    pub fn mark_live(&self, offset: u64) {
        let (extent, slot) = self.slot_of(offset);
        let slots = self.slots();
        let mut state = self.state.lock();
        if !state.extents.contains_key(&extent) {
            assert!(
                state.reconstructing,
                "mark_live for unknown extent {extent} outside reconstruction"
            );
            self.extents.reserve_extent(extent, ExtentKind::Data);
            state.extents.insert(
                extent,
                ExtentEntry::new(DataExtentState::Full, slots, slots as u64),
            );
        }
        let entry = state.extents.get_mut(&extent).expect("extent entry");
        entry.index_live[slot] = true;
    }

    /// The LBA index no longer references `offset`.
    pub fn mark_garbage(&self, offset: u64, txn: &mut ExtentTxn) {
        let (extent, slot) = self.slot_of(offset);
        let mut state = self.state.lock();
        let entry = state.extents.get_mut(&extent).expect("extent entry");
        entry.index_live[slot] = false;
        self.maybe_release_locked(&mut state, extent, Some(txn));
    }

    /// A first token now references `offset`.
    pub fn mark_token_live(&self, offset: u64) {
        let (extent, slot) = self.slot_of(offset);
        let mut state = self.state.lock();
        let entry = state.extents.get_mut(&extent).expect("extent entry");
        entry.token_live[slot] = true;
    }

    /// The last token referencing `offset` went away.
    ///
    /// Token drops happen outside any extent transaction, so a fully
    /// dead extent is queued and released with the next one.
    pub fn mark_token_garbage(&self, offset: u64) {
        let (extent, slot) = self.slot_of(offset);
        let mut state = self.state.lock();
        let entry = state.extents.get_mut(&extent).expect("extent entry");
        entry.token_live[slot] = false;
        self.maybe_release_locked(&mut state, extent, None);
    }

    /// Whether any token currently keeps `offset` alive.
    #[must_use]
    pub fn token_live(&self, offset: u64) -> bool {
        let (extent, slot) = self.slot_of(offset);
        let state = self.state.lock();
        state
            .extents
            .get(&extent)
            .is_some_and(|entry| entry.token_live[slot])
    }

    fn maybe_release_locked(&self, state: &mut DbmState, extent: u64, txn: Option<&mut ExtentTxn>) {
        let Some(entry) = state.extents.get(&extent) else {
            return;
        };
        if entry.state == DataExtentState::Active || !entry.fully_dead() {
            return;
        }
        state.extents.remove(&extent);
        match txn {
            Some(txn) => self.extents.release_extent(txn, extent),
            None => state.pending_release.push(extent),
        }
        debug!(target: "lss::datablock", event = "extent_reclaimed", extent);
    }

    /// Move queued releases into the current extent transaction.
    pub fn drain_pending_releases(&self, txn: &mut ExtentTxn) {
        let pending = std::mem::take(&mut self.state.lock().pending_release);
        for extent in pending {
            self.extents.release_extent(txn, extent);
        }
    }

    fn garbage_totals_locked(state: &DbmState) -> (u64, u64) {
        let mut garbage = 0;
        let mut total = 0;
        for entry in state.extents.values() {
            if entry.state == DataExtentState::Active {
                continue;
            }
            garbage += entry.garbage_slots();
            total += entry.written;
        }
        (garbage, total)
    }

    #[expect(clippy::cast_precision_loss)]
    fn garbage_ratio_locked(state: &DbmState) -> f64 {
        let (garbage, total) = Self::garbage_totals_locked(state);
        if total == 0 {
            0.0
        } else {
            garbage as f64 / total as f64
        }
    }

    /// Whether garbage across full extents warrants a GC pass.
    #[must_use]
    pub fn do_we_want_to_start_gcing(&self) -> bool {
        let state = self.state.lock();
        if !state.gc_enabled || state.gc_running {
            return false;
        }
        Self::garbage_ratio_locked(&state) > self.gc_high_ratio
            && state
                .extents
                .values()
                .any(|entry| entry.state == DataExtentState::Full && entry.garbage_slots() > 0)
    }

    pub fn disable_gc(&self) {
        self.state.lock().gc_enabled = false;
        info!(target: "lss::datablock", event = "gc_disabled");
    }

    pub fn enable_gc(&self) {
        self.state.lock().gc_enabled = true;
        info!(target: "lss::datablock", event = "gc_enabled");
    }

    /// Collect mostly-dead extents until garbage drops under the low
    /// watermark. Returns the number of extents collected.
    ///
    /// For each still-live block of a victim the raw block is read,
    /// re-appended to the active extent, and every reference is moved
    /// over through `handler` in one critical section.
    pub fn run_gc(
        &self,
        cx: &Cx,
        handler: &dyn GcRemapHandler,
        txn: &mut ExtentTxn,
    ) -> Result<u64> {
        {
            let mut state = self.state.lock();
            if !state.gc_enabled || state.gc_running {
                return Ok(0);
            }
            state.gc_running = true;
        }

        let mut collected = 0;
        loop {
            let victim = {
                let mut state = self.state.lock();
                if collected > 0 && Self::garbage_ratio_locked(&state) <= self.gc_low_ratio {
                    None
                } else {
                    let victim = state
                        .extents
                        .iter()
                        .filter(|(_, entry)| entry.state == DataExtentState::Full)
                        .filter(|(_, entry)| entry.garbage_slots() > 0)
                        .max_by_key(|(_, entry)| entry.garbage_slots())
                        .map(|(extent, _)| *extent);
                    if let Some(victim) = victim {
                        state.extents.get_mut(&victim).expect("victim entry").state =
                            DataExtentState::Collecting;
                    }
                    victim
                }
            };
            let Some(victim) = victim else { break };

            self.gc_one_extent(cx, victim, handler, txn)?;
            collected += 1;
            let mut state = self.state.lock();
            state.extents_gced += 1;
            // The extent should now be fully dead; reclaim it unless a
            // token transfer already queued the release.
            self.maybe_release_locked(&mut state, victim, Some(txn));
            drop(state);
            self.drain_pending_releases(txn);
        }

        self.state.lock().gc_running = false;
        if collected > 0 {
            info!(target: "lss::datablock", event = "gc_pass_done", extents = collected);
        }
        Ok(collected)
    }

    fn gc_one_extent(
        &self,
        cx: &Cx,
        victim: u64,
        handler: &dyn GcRemapHandler,
        txn: &mut ExtentTxn,
    ) -> Result<()> {
        let block_bytes = self.config.block_size.bytes() as u64;
        let live: Vec<u64> = {
            let state = self.state.lock();
            let entry = state.extents.get(&victim).expect("victim entry");
            (0..usize::try_from(entry.written).expect("slot count fits usize"))
                .filter(|slot| entry.index_live[*slot] || entry.token_live[*slot])
                .map(|slot| victim + slot as u64 * block_bytes)
                .collect()
        };

        debug!(
            target: "lss::datablock",
            event = "gc_extent",
            extent = victim,
            live_blocks = live.len()
        );

        let mut payload = vec![0_u8; self.config.block_size.payload_bytes()];
        for old_offset in live {
            let sequence_id = self.read(cx, old_offset, &mut payload)?;
            let new_offset = self.write(cx, &payload, sequence_id)?;
            handler.remap_block_to_new_offset(old_offset, new_offset, &payload, txn);
        }
        Ok(())
    }

    /// Root to store in the next metablock.
    #[must_use]
    pub fn prepare_metablock(&self) -> DataBlockRoot {
        let state = self.state.lock();
        DataBlockRoot {
            active_extent: state
                .active
                .map_or(FlaggedOffset::UNUSED, FlaggedOffset::live),
            active_next_slot: if state.active.is_some() {
                state.active_next
            } else {
                0
            },
        }
    }

    #[must_use]
    pub fn report(&self) -> DataBlockReport {
        let state = self.state.lock();
        let (garbage, total) = Self::garbage_totals_locked(&state);
        DataBlockReport {
            data_extents: state.extents.len() as u64,
            old_total_blocks: total,
            old_garbage_blocks: garbage,
            extents_gced: state.extents_gced,
        }
    }

    /// Quiesce GC for shutdown.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.gc_enabled = false;
        assert!(!state.gc_running, "shutdown during a GC pass");
    }
}
