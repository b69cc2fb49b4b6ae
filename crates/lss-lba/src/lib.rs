#![forbid(unsafe_code)]
//! The LBA index: a persistent `block_id -> (offset, recency)` map.
//!
//! The map is kept fully in memory and persisted as an append-only
//! journal of fixed-size records inside a dedicated LBA extent,
//! punctuated by superblocks that snapshot the whole map across a run
//! of fresh extents. A metablock root records exactly how many journal
//! bytes were durable; records past that boundary belong to index
//! writes whose metablock never landed and are ignored at recovery.

use asupersync::Cx;
use lss_error::{LssError, Result};
use lss_extent::{ExtentKind, ExtentManager, ExtentTxn};
use lss_file::ByteDevice;
use lss_types::{BlockId, FlaggedOffset, Recency, StaticConfig};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Size of one journal/superblock record on disk.
pub const LBA_RECORD_BYTES: usize = 32;

/// Upper bound on extents a superblock may span (bounded by the
/// metablock slot layout).
pub const LBA_SUPERBLOCK_MAX_EXTENTS: usize = 32;

/// Roots required to find the index again at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LbaRoot {
    pub end_block_id: u64,
    pub superblock_entries: u64,
    pub superblock_extents: Vec<u64>,
    pub journal_extent: FlaggedOffset,
    pub journal_used: u64,
}

impl LbaRoot {
    /// Root of an empty index (fresh store).
    #[must_use]
    pub fn initial() -> Self {
        Self {
            end_block_id: 0,
            superblock_entries: 0,
            superblock_extents: Vec::new(),
            journal_extent: FlaggedOffset::UNUSED,
            journal_used: 0,
        }
    }
}

/// Point-in-time accounting snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LbaReport {
    pub end_block_id: u64,
    pub records_on_disk: u64,
    pub dead_records: u64,
    pub journal_used: u64,
    pub compactions: u64,
}

#[derive(Debug, Clone, Copy)]
struct LbaEntry {
    offset: FlaggedOffset,
    recency: Recency,
}

impl LbaEntry {
    const EMPTY: Self = Self {
        offset: FlaggedOffset::UNUSED,
        recency: Recency::DISTANT_PAST,
    };
}

fn encode_record(id: u64, offset: FlaggedOffset, recency: Recency) -> [u8; LBA_RECORD_BYTES] {
    let mut record = [0_u8; LBA_RECORD_BYTES];
    record[0..8].copy_from_slice(&id.to_le_bytes());
    record[8..16].copy_from_slice(&offset.to_repr().to_le_bytes());
    record[16..24].copy_from_slice(&recency.0.to_le_bytes());
    let crc = crc32c::crc32c(&record[0..24]);
    record[24..28].copy_from_slice(&crc.to_le_bytes());
    record
}

fn decode_record(record: &[u8]) -> Result<(u64, FlaggedOffset, Recency)> {
    debug_assert_eq!(record.len(), LBA_RECORD_BYTES);
    let stored = u32::from_le_bytes([record[24], record[25], record[26], record[27]]);
    let actual = crc32c::crc32c(&record[0..24]);
    if stored != actual {
        return Err(LssError::Format(format!(
            "LBA record checksum mismatch: stored {stored:#010x}, computed {actual:#010x}"
        )));
    }
    let id = u64::from_le_bytes(record[0..8].try_into().expect("8-byte slice"));
    let offset = FlaggedOffset::from_repr(u64::from_le_bytes(
        record[8..16].try_into().expect("8-byte slice"),
    ));
    let recency = Recency(u64::from_le_bytes(
        record[16..24].try_into().expect("8-byte slice"),
    ));
    Ok((id, offset, recency))
}

#[derive(Debug)]
struct LbaState {
    entries: Vec<LbaEntry>,
    by_offset: HashMap<u64, BlockId>,
    superblock_extents: Vec<u64>,
    superblock_entries: u64,
    journal_extent: Option<u64>,
    /// Durable journal bytes, as recorded in the last metablock root.
    journal_used: u64,
    /// Image of the partially filled tail block of the journal.
    tail: Vec<u8>,
    pending: Vec<[u8; LBA_RECORD_BYTES]>,
    journal_records: u64,
    compactions: u64,
}

/// The in-memory index plus its on-disk journal.
#[derive(Debug)]
pub struct LbaIndex {
    config: StaticConfig,
    device: Arc<dyn ByteDevice>,
    extents: Arc<ExtentManager>,
    threshold: f64,
    state: Mutex<LbaState>,
}

impl LbaIndex {
    /// Open the index described by `root`, reserving its extents and
    /// replaying the superblock and the durable journal prefix.
    pub fn start_existing(
        cx: &Cx,
        config: StaticConfig,
        device: Arc<dyn ByteDevice>,
        extents: Arc<ExtentManager>,
        threshold: f64,
        root: &LbaRoot,
    ) -> Result<Self> {
        let mut entries = vec![LbaEntry::EMPTY; usize::try_from(root.end_block_id)
            .map_err(|_| LssError::Format("end_block_id does not fit usize".to_owned()))?];

        for extent in &root.superblock_extents {
            extents.reserve_extent(*extent, ExtentKind::Lba);
        }
        if let Some(journal) = root.journal_extent.value() {
            extents.reserve_extent(journal, ExtentKind::Lba);
        }

        // Superblock: a dense snapshot of ids [0, superblock_entries).
        let extent_size = config.extent_size.get();
        let records_per_extent = extent_size / LBA_RECORD_BYTES as u64;
        let mut remaining = root.superblock_entries;
        let mut next_id = 0_u64;
        for extent in &root.superblock_extents {
            if remaining == 0 {
                break;
            }
            let count = remaining.min(records_per_extent);
            let byte_len = usize::try_from(count * LBA_RECORD_BYTES as u64)
                .map_err(|_| LssError::Format("superblock length does not fit usize".to_owned()))?;
            let mut buf = vec![0_u8; byte_len];
            device.read_exact_at(cx, *extent, &mut buf)?;
            for record in buf.chunks_exact(LBA_RECORD_BYTES) {
                let (id, offset, recency) = decode_record(record).map_err(|_| {
                    LssError::Corruption {
                        offset: *extent,
                        detail: format!("torn LBA superblock record for block {next_id}"),
                    }
                })?;
                if id != next_id {
                    return Err(LssError::Corruption {
                        offset: *extent,
                        detail: format!("superblock record out of order: {id} != {next_id}"),
                    });
                }
                entries[usize::try_from(id).expect("id bounded by end_block_id")] =
                    LbaEntry { offset, recency };
                next_id += 1;
            }
            remaining -= count;
        }

        // Journal: replay exactly the durable prefix.
        let mut journal_records = 0_u64;
        let mut tail = vec![0_u8; config.block_size.bytes()];
        if let Some(journal) = root.journal_extent.value() {
            let used = usize::try_from(root.journal_used)
                .map_err(|_| LssError::Format("journal_used does not fit usize".to_owned()))?;
            let mut buf = vec![0_u8; used];
            device.read_exact_at(cx, journal, &mut buf)?;
            for record in buf.chunks_exact(LBA_RECORD_BYTES) {
                match decode_record(record) {
                    Ok((id, offset, recency)) => {
                        let index = usize::try_from(id)
                            .map_err(|_| LssError::Format("block id does not fit usize".to_owned()))?;
                        if index >= entries.len() {
                            entries.resize(index + 1, LbaEntry::EMPTY);
                        }
                        entries[index] = LbaEntry { offset, recency };
                        journal_records += 1;
                    }
                    Err(err) => {
                        // The durable prefix should be whole; stop at the
                        // last fully written record.
                        warn!(
                            target: "lss::lba",
                            event = "journal_truncated",
                            records_applied = journal_records,
                            error = %err
                        );
                        break;
                    }
                }
            }

            // Preserve the partial tail block so appends can rewrite it.
            let block_bytes = config.block_size.bytes();
            let tail_start = root.journal_used / block_bytes as u64 * block_bytes as u64;
            let tail_len = usize::try_from(root.journal_used - tail_start)
                .expect("tail fits one block");
            if tail_len > 0 {
                device.read_exact_at(cx, journal + tail_start, &mut tail[..tail_len])?;
            }
        }

        let mut by_offset = HashMap::new();
        for (index, entry) in entries.iter().enumerate() {
            if let Some(offset) = entry.offset.value() {
                by_offset.insert(offset, BlockId(index as u64));
            }
        }

        info!(
            target: "lss::lba",
            event = "started",
            end_block_id = entries.len(),
            superblock_entries = root.superblock_entries,
            journal_records
        );

        Ok(Self {
            config,
            device,
            extents,
            threshold,
            state: Mutex::new(LbaState {
                entries,
                by_offset,
                superblock_extents: root.superblock_extents.clone(),
                superblock_entries: root.superblock_entries,
                journal_extent: root.journal_extent.value(),
                journal_used: root.journal_used,
                tail,
                pending: Vec::new(),
                journal_records,
                compactions: 0,
            }),
        })
    }

    /// Current offset of `id`, `UNUSED` if absent or deleted.
    #[must_use]
    pub fn get_block_offset(&self, id: BlockId) -> FlaggedOffset {
        let state = self.state.lock();
        state
            .entries
            .get(usize::try_from(id.0).unwrap_or(usize::MAX))
            .map_or(FlaggedOffset::UNUSED, |entry| entry.offset)
    }

    #[must_use]
    pub fn get_block_recency(&self, id: BlockId) -> Recency {
        let state = self.state.lock();
        state
            .entries
            .get(usize::try_from(id.0).unwrap_or(usize::MAX))
            .map_or(Recency::DISTANT_PAST, |entry| entry.recency)
    }

    /// The block id currently mapped to `offset`, if any.
    #[must_use]
    pub fn block_at_offset(&self, offset: u64) -> Option<BlockId> {
        self.state.lock().by_offset.get(&offset).copied()
    }

    /// One past the highest block id ever written.
    #[must_use]
    pub fn end_block_id(&self) -> BlockId {
        BlockId(self.state.lock().entries.len() as u64)
    }

    /// Update one mapping in memory and queue its journal record.
    ///
    /// Called inside the serializer's atomic index-write section; does
    /// no I/O.
    pub fn set_block_info(&self, id: BlockId, recency: Recency, offset: FlaggedOffset) {
        assert!(!id.is_null(), "NULL_BLOCK_ID in an index write");
        let mut state = self.state.lock();
        let index = usize::try_from(id.0).expect("block id fits usize");
        if index >= state.entries.len() {
            state.entries.resize(index + 1, LbaEntry::EMPTY);
        }

        if let Some(old) = state.entries[index].offset.value() {
            state.by_offset.remove(&old);
        }
        if let Some(new) = offset.value() {
            state.by_offset.insert(new, id);
        }
        state.entries[index] = LbaEntry { offset, recency };
        state.pending.push(encode_record(id.0, offset, recency));
        trace!(
            target: "lss::lba",
            event = "set_block_info",
            id = id.0,
            offset = ?offset.value(),
            recency = recency.0
        );
    }

    /// Retarget the entry pointing at `old` to `new` (GC remap).
    ///
    /// Returns whether an entry was remapped; does no I/O.
    pub fn remap_offset(&self, old: u64, new: u64) -> bool {
        let mut state = self.state.lock();
        let Some(id) = state.by_offset.remove(&old) else {
            return false;
        };
        let index = usize::try_from(id.0).expect("block id fits usize");
        let recency = state.entries[index].recency;
        let offset = FlaggedOffset::live(new);
        state.entries[index].offset = offset;
        state.by_offset.insert(new, id);
        state.pending.push(encode_record(id.0, offset, recency));
        trace!(target: "lss::lba", event = "remap", id = id.0, old, new);
        true
    }

    /// Flush queued journal records and fsync.
    ///
    /// Returns `true` when nothing needed flushing.
    pub fn sync(&self, cx: &Cx, txn: &mut ExtentTxn) -> Result<bool> {
        let mut state = self.state.lock();
        if state.pending.is_empty() {
            return Ok(true);
        }

        let pending_bytes = state.pending.len() * LBA_RECORD_BYTES;
        let extent_size = usize::try_from(self.config.extent_size.get())
            .expect("extent size fits usize");
        if state.journal_extent.is_some()
            && usize::try_from(state.journal_used).expect("journal_used fits usize") + pending_bytes
                > extent_size
        {
            self.compact_locked(cx, &mut state, txn)?;
        }
        if state.pending.is_empty() {
            // Compaction folded the queued records into the superblock.
            self.device.sync(cx)?;
            return Ok(false);
        }
        if pending_bytes > extent_size {
            return Err(LssError::NoSpace("LBA journal"));
        }

        let journal = match state.journal_extent {
            Some(journal) => journal,
            None => {
                let journal = self.extents.gen_extent(cx, ExtentKind::Lba)?;
                state.journal_extent = Some(journal);
                state.journal_used = 0;
                state.tail.fill(0);
                journal
            }
        };

        // Compose block-aligned writes, rewriting the partial tail block.
        let block_bytes = self.config.block_size.bytes();
        let aligned_start = state.journal_used / block_bytes as u64 * block_bytes as u64;
        let tail_len = usize::try_from(state.journal_used - aligned_start)
            .expect("tail fits one block");
        let total = tail_len + pending_bytes;
        let padded = total.div_ceil(block_bytes) * block_bytes;
        let mut buf = vec![0_u8; padded];
        buf[..tail_len].copy_from_slice(&state.tail[..tail_len]);
        for (i, record) in state.pending.iter().enumerate() {
            let at = tail_len + i * LBA_RECORD_BYTES;
            buf[at..at + LBA_RECORD_BYTES].copy_from_slice(record);
        }

        self.device.write_all_at(cx, journal + aligned_start, &buf)?;
        self.device.sync(cx)?;

        let flushed = state.pending.len() as u64;
        state.journal_used += pending_bytes as u64;
        state.journal_records += flushed;
        state.pending.clear();
        let new_tail_start = state.journal_used / block_bytes as u64 * block_bytes as u64;
        let new_tail_len = usize::try_from(state.journal_used - new_tail_start)
            .expect("tail fits one block");
        let from = usize::try_from(new_tail_start - aligned_start).expect("within buffer");
        state.tail[..new_tail_len].copy_from_slice(&buf[from..from + new_tail_len]);
        state.tail[new_tail_len..].fill(0);

        debug!(
            target: "lss::lba",
            event = "synced",
            records = flushed,
            journal_used = state.journal_used
        );
        Ok(false)
    }

    /// Compact into a fresh superblock when too few records are live.
    pub fn consider_gc(&self, cx: &Cx, txn: &mut ExtentTxn) -> Result<()> {
        let mut state = self.state.lock();
        let live = state.entries.len() as u64;
        let total = state.superblock_entries + state.journal_records;
        if total == 0 || total <= live {
            return Ok(());
        }
        #[expect(clippy::cast_precision_loss)]
        let live_fraction = live as f64 / total as f64;
        if live_fraction >= self.threshold {
            return Ok(());
        }
        self.compact_locked(cx, &mut state, txn)
    }

    fn compact_locked(
        &self,
        cx: &Cx,
        state: &mut LbaState,
        txn: &mut ExtentTxn,
    ) -> Result<()> {
        let entry_count = state.entries.len() as u64;
        let extent_size = self.config.extent_size.get();
        let records_per_extent = extent_size / LBA_RECORD_BYTES as u64;
        let extents_needed = usize::try_from(entry_count.div_ceil(records_per_extent))
            .map_err(|_| LssError::Format("superblock extent count overflow".to_owned()))?;
        if extents_needed > LBA_SUPERBLOCK_MAX_EXTENTS {
            return Err(LssError::NoSpace("LBA superblock"));
        }

        let mut new_extents = Vec::with_capacity(extents_needed);
        let mut written = 0_u64;
        for _ in 0..extents_needed {
            let extent = self.extents.gen_extent(cx, ExtentKind::Lba)?;
            let count = (entry_count - written).min(records_per_extent);
            let byte_len = usize::try_from(count * LBA_RECORD_BYTES as u64)
                .expect("extent length fits usize");
            let padded = byte_len.div_ceil(self.config.block_size.bytes())
                * self.config.block_size.bytes();
            let mut buf = vec![0_u8; padded];
            for i in 0..count {
                let entry = state.entries[usize::try_from(written + i).expect("fits usize")];
                let at = usize::try_from(i).expect("fits usize") * LBA_RECORD_BYTES;
                buf[at..at + LBA_RECORD_BYTES].copy_from_slice(&encode_record(
                    written + i,
                    entry.offset,
                    entry.recency,
                ));
            }
            self.device.write_all_at(cx, extent, &buf)?;
            new_extents.push(extent);
            written += count;
        }

        for old in state.superblock_extents.drain(..) {
            self.extents.release_extent(txn, old);
        }
        if let Some(journal) = state.journal_extent.take() {
            self.extents.release_extent(txn, journal);
        }

        state.superblock_extents = new_extents;
        state.superblock_entries = entry_count;
        state.journal_used = 0;
        state.journal_records = 0;
        state.tail.fill(0);
        state.pending.clear();
        state.compactions += 1;

        info!(
            target: "lss::lba",
            event = "compacted",
            entries = entry_count,
            extents = extents_needed
        );
        Ok(())
    }

    /// Roots required to find the index on the next startup.
    #[must_use]
    pub fn prepare_metablock(&self) -> LbaRoot {
        let state = self.state.lock();
        LbaRoot {
            end_block_id: state.entries.len() as u64,
            superblock_entries: state.superblock_entries,
            superblock_extents: state.superblock_extents.clone(),
            journal_extent: state
                .journal_extent
                .map_or(FlaggedOffset::UNUSED, FlaggedOffset::live),
            journal_used: state.journal_used,
        }
    }

    #[must_use]
    pub fn report(&self) -> LbaReport {
        let state = self.state.lock();
        let live = state.entries.len() as u64;
        let total = state.superblock_entries + state.journal_records;
        LbaReport {
            end_block_id: live,
            records_on_disk: total,
            dead_records: total.saturating_sub(live),
            journal_used: state.journal_used,
            compactions: state.compactions,
        }
    }

    /// Final flush before teardown.
    pub fn shutdown(&self, cx: &Cx, txn: &mut ExtentTxn) -> Result<()> {
        let synced_nothing = self.sync(cx, txn)?;
        debug!(target: "lss::lba", event = "shutdown", flushed = !synced_nothing);
        Ok(())
    }
}
