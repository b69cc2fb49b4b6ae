//! The serializer front-end: lifecycle, block I/O, and index writes.

use crate::buf::SerBuf;
use crate::header::{read_static_header, write_static_header};
use crate::token::{BlockToken, TokenRegistry};
use asupersync::Cx;
use lss_datablock::{DataBlockManager, GcRemapHandler};
use lss_error::{LssError, Result};
use lss_extent::{ExtentKind, ExtentManager, ExtentTxn};
use lss_file::{ByteDevice, ConflictResolvingDevice, FileOpener};
use lss_lba::LbaIndex;
use lss_metablock::{Metablock, MetablockManager};
use lss_types::{BlockId, BlockSequenceId, DynamicConfig, FlaggedOffset, Recency, StaticConfig};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info, trace};

/// Externally observable lifecycle of one serializer instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerializerState {
    Unstarted,
    StartingUp,
    Ready,
    ShuttingDown,
    ShutDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartupStep {
    ReadStaticHeader,
    WaitingForStaticHeader,
    FindMetablock,
    WaitingForMetablock,
    StartLba,
    WaitingForLba,
    Reconstruct,
    Finish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShutdownStep {
    WaitingOnSerializer,
    WaitingOnDatablockManager,
    WaitingOnBlockTokens,
    WaitingOnLba,
}

/// Accounting handle for a class of I/O issued by one caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoAccount {
    priority: i32,
    outstanding_limit: i32,
}

impl IoAccount {
    #[must_use]
    pub fn priority(&self) -> i32 {
        self.priority
    }

    #[must_use]
    pub fn outstanding_limit(&self) -> i32 {
        self.outstanding_limit
    }
}

/// How one index-write op changes the token for its block id.
#[derive(Debug)]
pub enum TokenUpdate {
    /// Leave the current offset alone (recency-only update).
    Retain,
    /// Remove the mapping: the block is deleted.
    Remove,
    /// Point the block id at the offset this token protects.
    Set(BlockToken),
}

/// One entry of an atomic index-write batch.
#[derive(Debug)]
pub struct IndexWriteOp {
    pub block_id: BlockId,
    pub token: TokenUpdate,
    pub recency: Option<Recency>,
}

impl IndexWriteOp {
    #[must_use]
    pub fn update(block_id: BlockId, token: BlockToken) -> Self {
        Self {
            block_id,
            token: TokenUpdate::Set(token),
            recency: None,
        }
    }

    #[must_use]
    pub fn update_with_recency(block_id: BlockId, token: BlockToken, recency: Recency) -> Self {
        Self {
            block_id,
            token: TokenUpdate::Set(token),
            recency: Some(recency),
        }
    }

    #[must_use]
    pub fn delete(block_id: BlockId) -> Self {
        Self {
            block_id,
            token: TokenUpdate::Remove,
            recency: None,
        }
    }

    #[must_use]
    pub fn touch_recency(block_id: BlockId, recency: Recency) -> Self {
        Self {
            block_id,
            token: TokenUpdate::Retain,
            recency: Some(recency),
        }
    }
}

/// Offered every block the engine reads on its own account (GC moves).
pub trait ReadAheadSink: Send + Sync {
    /// Return `true` to take the buffer; remaining sinks are skipped.
    fn offer_read_ahead_buf(
        &self,
        block_id: BlockId,
        payload: &[u8],
        token: &BlockToken,
        recency: Recency,
    ) -> bool;
}

/// Monotonic operation counters, shared with whoever wants to watch.
#[derive(Debug, Default)]
pub struct SerializerStats {
    pub block_reads: AtomicU64,
    pub block_writes: AtomicU64,
    pub index_reads: AtomicU64,
    pub index_writes: AtomicU64,
    pub index_write_ops: AtomicU64,
}

impl SerializerStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Snapshot across the front-end and every subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SerializerMetrics {
    pub block_reads: u64,
    pub block_writes: u64,
    pub index_reads: u64,
    pub index_writes: u64,
    pub index_write_ops: u64,
    pub extents_in_use: u64,
    pub bytes_in_use: u64,
    pub data_extents: u64,
    pub old_garbage_blocks: u64,
    pub old_total_blocks: u64,
    pub data_extents_gced: u64,
    pub lba_records_on_disk: u64,
    pub lba_dead_records: u64,
    pub lba_compactions: u64,
    pub live_tokens: u64,
    pub end_block_id: u64,
}

#[derive(Debug)]
struct Pipeline {
    next_ticket: u64,
    metablock_turn: u64,
    active_writes: u64,
}

/// A single-file, log-structured block storage engine instance.
///
/// All operations are thread-safe; conflicting file I/O is ordered by
/// the conflict-resolving device and index writes are published in
/// submission order.
pub struct LogSerializer {
    file_name: String,
    static_config: StaticConfig,
    dynamic_config: DynamicConfig,
    extents: Arc<ExtentManager>,
    metablocks: MetablockManager,
    lba: LbaIndex,
    datablocks: Arc<DataBlockManager>,
    tokens: Arc<TokenRegistry>,
    stats: Arc<SerializerStats>,
    latest_block_sequence_id: AtomicU64,
    lifecycle: Mutex<SerializerState>,
    /// Serializes the in-memory LBA/token/liveness updates of index
    /// writes and GC remaps; never held across device I/O.
    mutation: Mutex<()>,
    pipeline: Mutex<Pipeline>,
    pipeline_cond: Condvar,
    read_ahead: Mutex<Vec<Arc<dyn ReadAheadSink>>>,
}

impl std::fmt::Debug for LogSerializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSerializer")
            .field("file", &self.file_name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl LogSerializer {
    /// Create a new store behind `opener`'s temporary path.
    ///
    /// Writes the static header and an initial metablock with empty
    /// subsystem states, then syncs. The file is renamed to its
    /// permanent name by the first successful [`LogSerializer::start`].
    pub fn create(cx: &Cx, opener: &dyn FileOpener, static_config: StaticConfig) -> Result<()> {
        let device = opener.open_create_temporary()?;
        device.set_len_bytes(cx, 2 * static_config.extent_size.get())?;
        write_static_header(cx, &*device, static_config)?;
        MetablockManager::create(cx, static_config, &device, &Metablock::initial())?;
        device.sync(cx)?;
        info!(
            target: "lss::serializer",
            event = "created",
            file = %opener.file_name(),
            block_size = static_config.block_size.get(),
            extent_size = static_config.extent_size.get()
        );
        Ok(())
    }

    /// Open an existing store and run the recovery sequence.
    ///
    /// Fails with [`LssError::NoValidMetablock`] when the metablock
    /// ring holds nothing valid; any error from here is unrecoverable.
    pub fn start(
        cx: &Cx,
        opener: &dyn FileOpener,
        dynamic_config: DynamicConfig,
    ) -> Result<Arc<Self>> {
        let dynamic_config = dynamic_config.validate()?;
        let file_name = opener.file_name();
        info!(target: "lss::serializer", event = "starting", file = %file_name);

        let raw = opener.open_existing()?;

        let mut step = StartupStep::ReadStaticHeader;
        trace!(target: "lss::serializer", event = "startup_step", step = ?step);
        // The header read completes synchronously; the waiting state is
        // traversed for observability only.
        step = StartupStep::WaitingForStaticHeader;
        trace!(target: "lss::serializer", event = "startup_step", step = ?step);
        let static_config = read_static_header(cx, &*raw)?;
        // Conflict chunks must be at least as coarse as the direct-I/O
        // granule, or sub-granule read-modify-writes could race.
        let device: Arc<dyn ByteDevice> = Arc::new(ConflictResolvingDevice::new(
            raw,
            u64::from(static_config.block_size.get()).max(4096),
        ));

        step = StartupStep::FindMetablock;
        trace!(target: "lss::serializer", event = "startup_step", step = ?step);
        step = StartupStep::WaitingForMetablock;
        trace!(target: "lss::serializer", event = "startup_step", step = ?step);
        let (metablocks, metablock) =
            MetablockManager::start_existing(cx, static_config, device.clone())?;

        let extents = Arc::new(ExtentManager::start_existing(
            static_config,
            device.clone(),
            metablock.extent_root,
        )?);
        extents.reserve_extent(0, ExtentKind::StaticHeader);
        extents.reserve_extent(static_config.extent_size.get(), ExtentKind::Metablock);

        step = StartupStep::StartLba;
        trace!(target: "lss::serializer", event = "startup_step", step = ?step);
        step = StartupStep::WaitingForLba;
        trace!(target: "lss::serializer", event = "startup_step", step = ?step);
        let lba = LbaIndex::start_existing(
            cx,
            static_config,
            device.clone(),
            extents.clone(),
            dynamic_config.lba_gc_threshold,
            &metablock.lba_root,
        )?;

        let datablocks = Arc::new(DataBlockManager::start_existing(
            static_config,
            dynamic_config.gc_high_ratio,
            dynamic_config.gc_low_ratio,
            device.clone(),
            extents.clone(),
            metablock.datablock_root,
        )?);

        step = StartupStep::Reconstruct;
        trace!(target: "lss::serializer", event = "startup_step", step = ?step);
        datablocks.start_reconstruct();
        for id in 0..lba.end_block_id().0 {
            let offset = lba.get_block_offset(BlockId(id));
            if let Some(offset) = offset.value() {
                datablocks.mark_live(offset);
            }
        }
        datablocks.end_reconstruct();

        step = StartupStep::Finish;
        trace!(target: "lss::serializer", event = "startup_step", step = ?step);

        if opener.opened_temporary() {
            opener.move_to_permanent_location()?;
        }

        let serializer = Arc::new(Self {
            file_name,
            static_config,
            dynamic_config,
            extents,
            metablocks,
            lba,
            datablocks: datablocks.clone(),
            tokens: Arc::new(TokenRegistry::new(datablocks)),
            stats: Arc::new(SerializerStats::default()),
            latest_block_sequence_id: AtomicU64::new(metablock.block_sequence_id.0),
            lifecycle: Mutex::new(SerializerState::Ready),
            mutation: Mutex::new(()),
            pipeline: Mutex::new(Pipeline {
                next_ticket: 0,
                metablock_turn: 0,
                active_writes: 0,
            }),
            pipeline_cond: Condvar::new(),
            read_ahead: Mutex::new(Vec::new()),
        });
        info!(
            target: "lss::serializer",
            event = "ready",
            file = %serializer.file_name,
            end_block_id = serializer.lba.end_block_id().0
        );
        Ok(serializer)
    }

    fn fatal(&self, during: &'static str, err: &LssError) -> ! {
        error!(
            target: "lss::serializer",
            event = "fatal_io_error",
            file = %self.file_name,
            during,
            error = %err
        );
        panic!(
            "unrecoverable I/O failure on database file {} during {during}: {err}",
            self.file_name
        );
    }

    fn assert_ready(&self, operation: &'static str) {
        let state = *self.lifecycle.lock();
        assert_eq!(
            state,
            SerializerState::Ready,
            "{operation} on a serializer that is not ready"
        );
    }

    #[must_use]
    pub fn state(&self) -> SerializerState {
        *self.lifecycle.lock()
    }

    #[must_use]
    pub fn block_size(&self) -> lss_types::BlockSize {
        self.static_config.block_size
    }

    #[must_use]
    pub fn static_config(&self) -> StaticConfig {
        self.static_config
    }

    #[must_use]
    pub fn stats(&self) -> Arc<SerializerStats> {
        Arc::clone(&self.stats)
    }

    /// Allocate a block buffer suited to this store's geometry.
    #[must_use]
    pub fn malloc(&self) -> SerBuf {
        SerBuf::alloc(self.static_config.block_size)
    }

    /// Copy a block buffer, hidden prefix included.
    #[must_use]
    pub fn clone_buf(&self, buf: &SerBuf) -> SerBuf {
        buf.clone_buf()
    }

    #[must_use]
    pub fn make_io_account(&self, priority: i32, outstanding_limit: i32) -> IoAccount {
        IoAccount {
            priority,
            outstanding_limit,
        }
    }

    /// Write `buf` to a free data slot and return a token for it.
    ///
    /// The write is unpublished garbage until an index write references
    /// the token; aborts the process on I/O failure.
    pub fn block_write(
        &self,
        cx: &Cx,
        buf: &SerBuf,
        block_id: BlockId,
        account: &IoAccount,
    ) -> BlockToken {
        self.assert_ready("block_write");
        assert!(!block_id.is_null(), "block_write with NULL_BLOCK_ID");
        SerializerStats::bump(&self.stats.block_writes);

        let sequence_id =
            BlockSequenceId(self.latest_block_sequence_id.fetch_add(1, Ordering::Relaxed) + 1);
        let offset = match self.datablocks.write(cx, buf.payload(), sequence_id) {
            Ok(offset) => offset,
            Err(err) => self.fatal("block_write", &err),
        };
        trace!(
            target: "lss::serializer",
            event = "block_write",
            block_id = block_id.0,
            offset,
            priority = account.priority()
        );
        self.tokens.register(offset)
    }

    /// Read the block `token` protects into `buf`.
    ///
    /// Completes synchronously: the buffer is filled when this returns.
    /// The token must have been issued by this serializer; aborts the
    /// process on I/O failure.
    pub fn block_read(&self, cx: &Cx, token: &BlockToken, buf: &mut SerBuf, account: &IoAccount) {
        self.assert_ready("block_read");
        SerializerStats::bump(&self.stats.block_reads);

        let offset = self.tokens.token_offset(token);
        if let Err(err) = self.datablocks.read(cx, offset, buf.payload_mut()) {
            self.fatal("block_read", &err);
        }
        trace!(
            target: "lss::serializer",
            event = "block_read",
            offset,
            priority = account.priority()
        );
    }

    /// Token for the current offset of `block_id`, if it is mapped.
    #[must_use]
    pub fn index_read(&self, block_id: BlockId) -> Option<BlockToken> {
        self.assert_ready("index_read");
        SerializerStats::bump(&self.stats.index_reads);

        if block_id.0 >= self.lba.end_block_id().0 {
            return None;
        }
        // Hold the mutation lock so a concurrent GC remap cannot slip
        // between the lookup and the registration.
        let _atomic = self.mutation.lock();
        let offset = self.lba.get_block_offset(block_id).value()?;
        Some(self.tokens.register(offset))
    }

    #[must_use]
    pub fn get_recency(&self, block_id: BlockId) -> Recency {
        self.lba.get_block_recency(block_id)
    }

    /// Whether `block_id` is unmapped (deleted or never written).
    #[must_use]
    pub fn get_delete_bit(&self, block_id: BlockId) -> bool {
        !self.lba.get_block_offset(block_id).has_value()
    }

    /// One past the highest block id ever committed.
    #[must_use]
    pub fn max_block_id(&self) -> BlockId {
        self.assert_ready("max_block_id");
        self.lba.end_block_id()
    }

    /// Atomically apply `ops` to the LBA index and make them durable.
    ///
    /// The whole batch becomes visible in memory at once; on return the
    /// LBA journal and a fresh metablock are on disk. Batches issued
    /// concurrently land in ticket order. Aborts the process on I/O
    /// failure.
    pub fn index_write(&self, cx: &Cx, ops: Vec<IndexWriteOp>, account: &IoAccount) {
        self.assert_ready("index_write");
        SerializerStats::bump(&self.stats.index_writes);
        self.stats
            .index_write_ops
            .fetch_add(ops.len() as u64, Ordering::Relaxed);

        let (ticket, mut txn) = self.index_write_prepare(cx);
        trace!(
            target: "lss::serializer",
            event = "index_write",
            ticket,
            ops = ops.len(),
            priority = account.priority()
        );

        {
            // The in-memory LBA updates and the GC bookkeeping must be
            // mutually consistent at every observable point.
            let _atomic = self.mutation.lock();
            for op in &ops {
                let current = self.lba.get_block_offset(op.block_id);
                let new_offset = match &op.token {
                    TokenUpdate::Retain => current,
                    TokenUpdate::Remove => {
                        if let Some(old) = current.value() {
                            self.datablocks.mark_garbage(old, &mut txn);
                        }
                        FlaggedOffset::UNUSED
                    }
                    TokenUpdate::Set(token) => {
                        if let Some(old) = current.value() {
                            self.datablocks.mark_garbage(old, &mut txn);
                        }
                        let offset = self.tokens.token_offset(token);
                        self.datablocks.mark_live(offset);
                        FlaggedOffset::live(offset)
                    }
                };
                let recency = op
                    .recency
                    .unwrap_or_else(|| self.lba.get_block_recency(op.block_id));
                self.lba.set_block_info(op.block_id, recency, new_offset);
            }
        }
        // Tokens held by the batch may drop here, outside the critical
        // section.
        drop(ops);

        self.index_write_finish(cx, ticket, txn);
        self.consider_start_gc(cx);
    }

    fn index_write_prepare(&self, cx: &Cx) -> (u64, ExtentTxn) {
        let ticket = {
            let mut pipeline = self.pipeline.lock();
            let ticket = pipeline.next_ticket;
            pipeline.next_ticket += 1;
            pipeline.active_writes += 1;
            ticket
        };
        let mut txn = self.extents.begin_transaction();
        if let Err(err) = self.lba.consider_gc(cx, &mut txn) {
            self.fatal("LBA compaction", &err);
        }
        (ticket, txn)
    }

    fn index_write_finish(&self, cx: &Cx, ticket: u64, mut txn: ExtentTxn) {
        if let Err(err) = self.lba.sync(cx, &mut txn) {
            self.fatal("LBA sync", &err);
        }
        self.datablocks.drain_pending_releases(&mut txn);
        let metablock = self.prepare_metablock();

        // Queue behind the previous index write: metablock N lands
        // before metablock N+1 is issued.
        {
            let mut pipeline = self.pipeline.lock();
            while pipeline.metablock_turn != ticket {
                self.pipeline_cond.wait(&mut pipeline);
            }
        }
        if let Err(err) = self.metablocks.write_metablock(cx, &metablock) {
            self.fatal("metablock write", &err);
        }
        {
            let mut pipeline = self.pipeline.lock();
            pipeline.metablock_turn += 1;
            pipeline.active_writes -= 1;
            self.pipeline_cond.notify_all();
        }

        // Only now may freed extents be reused.
        self.extents.commit_transaction(txn);
        debug!(target: "lss::serializer", event = "index_write_done", ticket);
    }

    fn prepare_metablock(&self) -> Metablock {
        Metablock {
            block_sequence_id: BlockSequenceId(self.latest_block_sequence_id.load(Ordering::Relaxed)),
            extent_root: self.extents.prepare_metablock(),
            datablock_root: self.datablocks.prepare_metablock(),
            lba_root: self.lba.prepare_metablock(),
        }
    }

    fn consider_start_gc(&self, cx: &Cx) {
        if self.state() != SerializerState::Ready || !self.datablocks.do_we_want_to_start_gcing() {
            return;
        }
        let (ticket, mut txn) = self.index_write_prepare(cx);
        let collected = match self.datablocks.run_gc(cx, self, &mut txn) {
            Ok(collected) => collected,
            Err(err) => self.fatal("garbage collection", &err),
        };
        // Publish the remapped entries and the reclaimed extents even
        // when nothing was collected: the ticket must retire either way.
        self.index_write_finish(cx, ticket, txn);
        if collected > 0 {
            debug!(target: "lss::serializer", event = "gc_published", extents = collected);
        }
    }

    pub fn enable_gc(&self) {
        self.datablocks.enable_gc();
    }

    pub fn disable_gc(&self) {
        self.datablocks.disable_gc();
    }

    pub fn register_read_ahead_sink(&self, sink: Arc<dyn ReadAheadSink>) {
        self.read_ahead.lock().push(sink);
    }

    pub fn unregister_read_ahead_sink(&self, sink: &Arc<dyn ReadAheadSink>) {
        let mut sinks = self.read_ahead.lock();
        if let Some(position) = sinks.iter().position(|s| Arc::ptr_eq(s, sink)) {
            sinks.remove(position);
        }
    }

    #[must_use]
    pub fn should_perform_read_ahead(&self) -> bool {
        self.dynamic_config.read_ahead && !self.read_ahead.lock().is_empty()
    }

    fn offer_buf_to_read_ahead_sinks(
        &self,
        block_id: BlockId,
        payload: &[u8],
        token: &BlockToken,
        recency: Recency,
    ) -> bool {
        let sinks = self.read_ahead.lock().clone();
        sinks
            .iter()
            .any(|sink| sink.offer_read_ahead_buf(block_id, payload, token, recency))
    }

    #[must_use]
    pub fn metrics(&self) -> SerializerMetrics {
        let extent_report = self.extents.report();
        let data_report = self.datablocks.report();
        let lba_report = self.lba.report();
        SerializerMetrics {
            block_reads: self.stats.block_reads.load(Ordering::Relaxed),
            block_writes: self.stats.block_writes.load(Ordering::Relaxed),
            index_reads: self.stats.index_reads.load(Ordering::Relaxed),
            index_writes: self.stats.index_writes.load(Ordering::Relaxed),
            index_write_ops: self.stats.index_write_ops.load(Ordering::Relaxed),
            extents_in_use: extent_report.extents_in_use,
            bytes_in_use: extent_report.extents_in_use * self.static_config.extent_size.get(),
            data_extents: data_report.data_extents,
            old_garbage_blocks: data_report.old_garbage_blocks,
            old_total_blocks: data_report.old_total_blocks,
            data_extents_gced: data_report.extents_gced,
            lba_records_on_disk: lba_report.records_on_disk,
            lba_dead_records: lba_report.dead_records,
            lba_compactions: lba_report.compactions,
            live_tokens: self.tokens.live_tokens() as u64,
            end_block_id: self.lba.end_block_id().0,
        }
    }

    /// Drain in-flight work, wait for every token, flush the LBA, and
    /// tear down.
    ///
    /// Blocks until all outstanding index writes have retired and all
    /// block tokens have been dropped.
    pub fn shutdown(&self, cx: &Cx) {
        {
            let mut lifecycle = self.lifecycle.lock();
            assert_eq!(
                *lifecycle,
                SerializerState::Ready,
                "shutdown on a serializer that is not ready"
            );
            *lifecycle = SerializerState::ShuttingDown;
        }

        let mut step = ShutdownStep::WaitingOnSerializer;
        debug!(target: "lss::serializer", event = "shutdown_step", step = ?step);
        {
            let mut pipeline = self.pipeline.lock();
            while pipeline.active_writes > 0 {
                self.pipeline_cond.wait(&mut pipeline);
            }
        }

        step = ShutdownStep::WaitingOnDatablockManager;
        debug!(target: "lss::serializer", event = "shutdown_step", step = ?step);
        self.datablocks.shutdown();

        step = ShutdownStep::WaitingOnBlockTokens;
        debug!(target: "lss::serializer", event = "shutdown_step", step = ?step);
        self.tokens.wait_drained();

        step = ShutdownStep::WaitingOnLba;
        debug!(target: "lss::serializer", event = "shutdown_step", step = ?step);
        let mut txn = self.extents.begin_transaction();
        if let Err(err) = self.lba.shutdown(cx, &mut txn) {
            self.fatal("LBA shutdown", &err);
        }
        self.extents.commit_transaction(txn);

        *self.lifecycle.lock() = SerializerState::ShutDown;
        info!(target: "lss::serializer", event = "shut_down", file = %self.file_name);
    }
}

impl GcRemapHandler for LogSerializer {
    /// Move every reference to a relocated block in one critical
    /// section: tokens first, then the LBA entry and the liveness bits.
    fn remap_block_to_new_offset(
        &self,
        old_offset: u64,
        new_offset: u64,
        payload: &[u8],
        txn: &mut ExtentTxn,
    ) {
        let remapped_in_index = {
            let _atomic = self.mutation.lock();
            self.tokens.remap(old_offset, new_offset);
            let in_index = self.lba.remap_offset(old_offset, new_offset);
            if in_index {
                self.datablocks.mark_live(new_offset);
                self.datablocks.mark_garbage(old_offset, txn);
            }
            in_index
        };
        trace!(
            target: "lss::serializer",
            event = "gc_remap",
            old_offset,
            new_offset,
            in_index = remapped_in_index
        );

        if remapped_in_index && self.should_perform_read_ahead() {
            if let Some(block_id) = self.lba.block_at_offset(new_offset) {
                let token = self.tokens.register(new_offset);
                let recency = self.lba.get_block_recency(block_id);
                let taken = self.offer_buf_to_read_ahead_sinks(block_id, payload, &token, recency);
                trace!(
                    target: "lss::serializer",
                    event = "read_ahead_offer",
                    block_id = block_id.0,
                    taken
                );
            }
        }
    }
}
