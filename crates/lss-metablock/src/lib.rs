#![forbid(unsafe_code)]
//! Metablock manager: the durable root of the store.
//!
//! Small records carrying the roots of the extent manager, data-block
//! manager, and LBA index are written round-robin into a fixed ring of
//! slots in extent 1. Every write carries an incrementing sequence id
//! and a CRC; at startup the valid slot with the highest sequence wins.
//! One metablock write is in flight at a time, which is how index
//! writes obtain their global ordering.

use asupersync::Cx;
use lss_datablock::DataBlockRoot;
use lss_error::{LssError, Result};
use lss_extent::ExtentRoot;
use lss_file::{AlignedVec, ByteDevice};
use lss_lba::{LBA_SUPERBLOCK_MAX_EXTENTS, LbaRoot};
use lss_types::{BlockSequenceId, FlaggedOffset, StaticConfig, read_le_u16, read_le_u32, read_le_u64};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, trace};

const METABLOCK_MAGIC: u32 = 0x4C53_4D42; // "LSMB"
const METABLOCK_VERSION: u16 = 1;
const MAX_METABLOCK_SLOTS: u64 = 8;

/// Fixed slot layout offsets.
const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 4;
const OFF_SEQUENCE: usize = 8;
const OFF_BLOCK_SEQUENCE: usize = 16;
const OFF_EXTENT_COUNT: usize = 24;
const OFF_DB_ACTIVE: usize = 32;
const OFF_DB_NEXT: usize = 40;
const OFF_LBA_END: usize = 48;
const OFF_LBA_SB_ENTRIES: usize = 56;
const OFF_LBA_SB_COUNT: usize = 64;
const OFF_LBA_SB_EXTENTS: usize = 72;
const OFF_LBA_JOURNAL: usize = OFF_LBA_SB_EXTENTS + 8 * LBA_SUPERBLOCK_MAX_EXTENTS;
const OFF_LBA_JOURNAL_USED: usize = OFF_LBA_JOURNAL + 8;
const OFF_CRC: usize = OFF_LBA_JOURNAL_USED + 8;
const ENCODED_BYTES: usize = OFF_CRC + 4;

/// One metablock's payload: the roots of every subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metablock {
    pub block_sequence_id: BlockSequenceId,
    pub extent_root: ExtentRoot,
    pub datablock_root: DataBlockRoot,
    pub lba_root: LbaRoot,
}

impl Metablock {
    /// Contents written by `create`: every subsystem empty.
    #[must_use]
    pub fn initial() -> Self {
        Self {
            block_sequence_id: BlockSequenceId::NULL,
            extent_root: lss_extent::ExtentManager::initial_root(),
            datablock_root: DataBlockRoot::initial(),
            lba_root: LbaRoot::initial(),
        }
    }
}

fn put_u64(buf: &mut [u8], at: usize, value: u64) {
    buf[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

fn encode(metablock: &Metablock, sequence_id: u64, block_size: usize) -> Result<AlignedVec> {
    if metablock.lba_root.superblock_extents.len() > LBA_SUPERBLOCK_MAX_EXTENTS {
        return Err(LssError::Format(format!(
            "LBA superblock spans {} extents, limit is {LBA_SUPERBLOCK_MAX_EXTENTS}",
            metablock.lba_root.superblock_extents.len()
        )));
    }

    let mut block = AlignedVec::new(block_size);
    let buf = block.as_mut_slice();
    buf[OFF_MAGIC..OFF_MAGIC + 4].copy_from_slice(&METABLOCK_MAGIC.to_le_bytes());
    buf[OFF_VERSION..OFF_VERSION + 2].copy_from_slice(&METABLOCK_VERSION.to_le_bytes());
    put_u64(buf, OFF_SEQUENCE, sequence_id);
    put_u64(buf, OFF_BLOCK_SEQUENCE, metablock.block_sequence_id.0);
    put_u64(buf, OFF_EXTENT_COUNT, metablock.extent_root.extent_count);
    put_u64(buf, OFF_DB_ACTIVE, metablock.datablock_root.active_extent.to_repr());
    put_u64(buf, OFF_DB_NEXT, metablock.datablock_root.active_next_slot);
    put_u64(buf, OFF_LBA_END, metablock.lba_root.end_block_id);
    put_u64(buf, OFF_LBA_SB_ENTRIES, metablock.lba_root.superblock_entries);
    buf[OFF_LBA_SB_COUNT..OFF_LBA_SB_COUNT + 4].copy_from_slice(
        &u32::try_from(metablock.lba_root.superblock_extents.len())
            .expect("superblock extent count bounded")
            .to_le_bytes(),
    );
    for (i, extent) in metablock.lba_root.superblock_extents.iter().enumerate() {
        put_u64(buf, OFF_LBA_SB_EXTENTS + i * 8, *extent);
    }
    put_u64(buf, OFF_LBA_JOURNAL, metablock.lba_root.journal_extent.to_repr());
    put_u64(buf, OFF_LBA_JOURNAL_USED, metablock.lba_root.journal_used);
    let crc = crc32c::crc32c(&buf[..OFF_CRC]);
    buf[OFF_CRC..OFF_CRC + 4].copy_from_slice(&crc.to_le_bytes());
    Ok(block)
}

fn decode(buf: &[u8]) -> Option<(u64, Metablock)> {
    if buf.len() < ENCODED_BYTES {
        return None;
    }
    if read_le_u32(buf, OFF_MAGIC).ok()? != METABLOCK_MAGIC {
        return None;
    }
    if read_le_u16(buf, OFF_VERSION).ok()? != METABLOCK_VERSION {
        return None;
    }
    let stored_crc = read_le_u32(buf, OFF_CRC).ok()?;
    if stored_crc != crc32c::crc32c(&buf[..OFF_CRC]) {
        return None;
    }
    let sequence_id = read_le_u64(buf, OFF_SEQUENCE).ok()?;
    if sequence_id == 0 {
        return None;
    }

    let superblock_count =
        usize::try_from(read_le_u32(buf, OFF_LBA_SB_COUNT).ok()?).ok()?;
    if superblock_count > LBA_SUPERBLOCK_MAX_EXTENTS {
        return None;
    }
    let mut superblock_extents = Vec::with_capacity(superblock_count);
    for i in 0..superblock_count {
        superblock_extents.push(read_le_u64(buf, OFF_LBA_SB_EXTENTS + i * 8).ok()?);
    }

    Some((
        sequence_id,
        Metablock {
            block_sequence_id: BlockSequenceId(read_le_u64(buf, OFF_BLOCK_SEQUENCE).ok()?),
            extent_root: ExtentRoot {
                extent_count: read_le_u64(buf, OFF_EXTENT_COUNT).ok()?,
            },
            datablock_root: DataBlockRoot {
                active_extent: FlaggedOffset::from_repr(read_le_u64(buf, OFF_DB_ACTIVE).ok()?),
                active_next_slot: read_le_u64(buf, OFF_DB_NEXT).ok()?,
            },
            lba_root: LbaRoot {
                end_block_id: read_le_u64(buf, OFF_LBA_END).ok()?,
                superblock_entries: read_le_u64(buf, OFF_LBA_SB_ENTRIES).ok()?,
                superblock_extents,
                journal_extent: FlaggedOffset::from_repr(
                    read_le_u64(buf, OFF_LBA_JOURNAL).ok()?,
                ),
                journal_used: read_le_u64(buf, OFF_LBA_JOURNAL_USED).ok()?,
            },
        },
    ))
}

#[derive(Debug)]
struct MbState {
    next_slot: u64,
    next_sequence: u64,
}

/// Writes metablocks into the slot ring and finds the newest at startup.
#[derive(Debug)]
pub struct MetablockManager {
    config: StaticConfig,
    device: Arc<dyn ByteDevice>,
    state: Mutex<MbState>,
    /// Held across a slot write and its fsync: one write in flight.
    write_lock: Mutex<()>,
}

impl MetablockManager {
    #[must_use]
    pub fn slot_count(config: StaticConfig) -> u64 {
        config.blocks_per_extent().min(MAX_METABLOCK_SLOTS)
    }

    fn slot_offset(config: StaticConfig, slot: u64) -> u64 {
        config.extent_size.get() + slot * u64::from(config.block_size.get())
    }

    /// Initialize the metablock extent of a fresh store: zero the ring,
    /// then write `initial` with sequence 1.
    pub fn create(
        cx: &Cx,
        config: StaticConfig,
        device: &Arc<dyn ByteDevice>,
        initial: &Metablock,
    ) -> Result<()> {
        let zero = AlignedVec::new(config.block_size.bytes());
        for slot in 0..Self::slot_count(config) {
            device.write_all_at(cx, Self::slot_offset(config, slot), zero.as_slice())?;
        }
        let block = encode(initial, 1, config.block_size.bytes())?;
        device.write_all_at(cx, Self::slot_offset(config, 0), block.as_slice())?;
        device.sync(cx)?;
        debug!(target: "lss::metablock", event = "created", slots = Self::slot_count(config));
        Ok(())
    }

    /// Scan the ring and return the manager plus the newest valid
    /// metablock, or `NoValidMetablock`.
    pub fn start_existing(
        cx: &Cx,
        config: StaticConfig,
        device: Arc<dyn ByteDevice>,
    ) -> Result<(Self, Metablock)> {
        let mut best: Option<(u64, u64, Metablock)> = None;
        let mut block = AlignedVec::new(config.block_size.bytes());
        for slot in 0..Self::slot_count(config) {
            device.read_exact_at(cx, Self::slot_offset(config, slot), block.as_mut_slice())?;
            if let Some((sequence_id, metablock)) = decode(block.as_slice()) {
                trace!(
                    target: "lss::metablock",
                    event = "slot_valid",
                    slot,
                    sequence_id
                );
                if best.as_ref().is_none_or(|(_, seq, _)| sequence_id > *seq) {
                    best = Some((slot, sequence_id, metablock));
                }
            }
        }

        let (slot, sequence_id, metablock) = best.ok_or(LssError::NoValidMetablock)?;
        info!(
            target: "lss::metablock",
            event = "recovered",
            slot,
            sequence_id,
            block_sequence_id = metablock.block_sequence_id.0
        );
        Ok((
            Self {
                config,
                device,
                state: Mutex::new(MbState {
                    next_slot: (slot + 1) % Self::slot_count(config),
                    next_sequence: sequence_id + 1,
                }),
                write_lock: Mutex::new(()),
            },
            metablock,
        ))
    }

    /// Durably write `metablock` into the next ring slot.
    ///
    /// Callers are already ordered by the serializer's write pipeline;
    /// the internal lock additionally guarantees a single in-flight
    /// slot write.
    pub fn write_metablock(&self, cx: &Cx, metablock: &Metablock) -> Result<()> {
        let _in_flight = self.write_lock.lock();
        let (slot, sequence_id) = {
            let mut state = self.state.lock();
            let slot = state.next_slot;
            let sequence_id = state.next_sequence;
            state.next_slot = (slot + 1) % Self::slot_count(self.config);
            state.next_sequence += 1;
            (slot, sequence_id)
        };

        let block = encode(metablock, sequence_id, self.config.block_size.bytes())?;
        self.device
            .write_all_at(cx, Self::slot_offset(self.config, slot), block.as_slice())?;
        self.device.sync(cx)?;
        debug!(
            target: "lss::metablock",
            event = "written",
            slot,
            sequence_id
        );
        Ok(())
    }
}
