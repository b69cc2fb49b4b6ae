#![forbid(unsafe_code)]
//! End-to-end serializer behavior on an in-memory store: round-trips,
//! restart durability, GC remaps, and the crash-prefix property.

use asupersync::Cx;
use lss_core::{IndexWriteOp, LogSerializer, ReadAheadSink, SerBuf, SerializerState};
use lss_file::{FileOpener, MemFileOpener, PathFileOpener};
use lss_types::{BlockId, DynamicConfig, Recency, StaticConfig};
use std::sync::Arc;

const BLOCK_SIZE: u32 = 1024;
const EXTENT_SIZE: u64 = 4096; // 4 blocks per extent, small enough to GC

fn config() -> StaticConfig {
    StaticConfig::new(BLOCK_SIZE, EXTENT_SIZE).unwrap()
}

fn new_store() -> (Cx, MemFileOpener) {
    let cx = Cx::for_testing();
    let opener = MemFileOpener::new();
    LogSerializer::create(&cx, &opener, config()).unwrap();
    (cx, opener)
}

fn start(cx: &Cx, opener: &MemFileOpener) -> Arc<LogSerializer> {
    LogSerializer::start(cx, opener, DynamicConfig::default()).unwrap()
}

fn payload(serializer: &LogSerializer, fill: u8) -> SerBuf {
    let mut buf = serializer.malloc();
    buf.payload_mut().fill(fill);
    buf
}

fn write_and_commit(
    cx: &Cx,
    serializer: &LogSerializer,
    id: u64,
    fill: u8,
    recency: Option<Recency>,
) {
    let account = serializer.make_io_account(0, 16);
    let buf = payload(serializer, fill);
    let token = serializer.block_write(cx, &buf, BlockId(id), &account);
    let op = match recency {
        Some(recency) => IndexWriteOp::update_with_recency(BlockId(id), token, recency),
        None => IndexWriteOp::update(BlockId(id), token),
    };
    serializer.index_write(cx, vec![op], &account);
}

fn read_block(cx: &Cx, serializer: &LogSerializer, id: u64) -> Option<Vec<u8>> {
    let token = serializer.index_read(BlockId(id))?;
    let account = serializer.make_io_account(0, 16);
    let mut buf = serializer.malloc();
    serializer.block_read(cx, &token, &mut buf, &account);
    Some(buf.payload().to_vec())
}

#[test]
fn write_index_read_roundtrip() {
    let (cx, opener) = new_store();
    let serializer = start(&cx, &opener);
    assert_eq!(serializer.state(), SerializerState::Ready);

    write_and_commit(&cx, &serializer, 0, 0xA1, None);
    write_and_commit(&cx, &serializer, 1, 0xB2, None);

    let got = read_block(&cx, &serializer, 0).unwrap();
    assert!(got.iter().all(|b| *b == 0xA1));
    let got = read_block(&cx, &serializer, 1).unwrap();
    assert!(got.iter().all(|b| *b == 0xB2));
    assert_eq!(serializer.max_block_id(), BlockId(2));

    serializer.shutdown(&cx);
    assert_eq!(serializer.state(), SerializerState::ShutDown);
}

#[test]
fn committed_writes_survive_restart() {
    let (cx, opener) = new_store();
    {
        let serializer = start(&cx, &opener);
        write_and_commit(&cx, &serializer, 0, 0x11, None);
        write_and_commit(&cx, &serializer, 3, 0x33, Some(Recency(77)));
        serializer.shutdown(&cx);
    }

    let serializer = start(&cx, &opener);
    assert_eq!(serializer.max_block_id(), BlockId(4));
    assert!(read_block(&cx, &serializer, 0).unwrap().iter().all(|b| *b == 0x11));
    assert!(read_block(&cx, &serializer, 3).unwrap().iter().all(|b| *b == 0x33));
    assert_eq!(serializer.get_recency(BlockId(3)), Recency(77));
    // Ids in the gap exist but are unmapped.
    assert!(serializer.get_delete_bit(BlockId(1)));
    assert!(serializer.index_read(BlockId(1)).is_none());
    serializer.shutdown(&cx);
}

#[test]
fn uncommitted_block_write_is_invisible_after_restart() {
    let (cx, opener) = new_store();
    {
        let serializer = start(&cx, &opener);
        write_and_commit(&cx, &serializer, 0, 0x42, None);
        // Written but never published by an index write.
        let account = serializer.make_io_account(0, 16);
        let buf = payload(&serializer, 0x99);
        let token = serializer.block_write(&cx, &buf, BlockId(1), &account);
        drop(token);
        serializer.shutdown(&cx);
    }

    let serializer = start(&cx, &opener);
    assert_eq!(serializer.max_block_id(), BlockId(1));
    assert!(serializer.index_read(BlockId(1)).is_none());
    assert!(read_block(&cx, &serializer, 0).unwrap().iter().all(|b| *b == 0x42));
    serializer.shutdown(&cx);
}

#[test]
fn deletion_roundtrip() {
    let (cx, opener) = new_store();
    {
        let serializer = start(&cx, &opener);
        write_and_commit(&cx, &serializer, 0, 0x10, None);
        write_and_commit(&cx, &serializer, 1, 0x20, None);
        let account = serializer.make_io_account(0, 16);
        serializer.index_write(&cx, vec![IndexWriteOp::delete(BlockId(0))], &account);
        assert!(serializer.get_delete_bit(BlockId(0)));
        assert!(!serializer.get_delete_bit(BlockId(1)));
        serializer.shutdown(&cx);
    }

    let serializer = start(&cx, &opener);
    assert!(serializer.get_delete_bit(BlockId(0)));
    assert!(serializer.index_read(BlockId(0)).is_none());
    assert!(read_block(&cx, &serializer, 1).unwrap().iter().all(|b| *b == 0x20));
    serializer.shutdown(&cx);
}

#[test]
fn batch_is_atomic_in_memory() {
    let (cx, opener) = new_store();
    let serializer = start(&cx, &opener);
    let account = serializer.make_io_account(0, 16);

    let buf_a = payload(&serializer, 0x0A);
    let buf_b = payload(&serializer, 0x0B);
    let token_a = serializer.block_write(&cx, &buf_a, BlockId(4), &account);
    let token_b = serializer.block_write(&cx, &buf_b, BlockId(9), &account);
    serializer.index_write(
        &cx,
        vec![
            IndexWriteOp::update(BlockId(4), token_a),
            IndexWriteOp::update(BlockId(9), token_b),
        ],
        &account,
    );

    assert_eq!(serializer.max_block_id(), BlockId(10));
    assert!(read_block(&cx, &serializer, 4).unwrap().iter().all(|b| *b == 0x0A));
    assert!(read_block(&cx, &serializer, 9).unwrap().iter().all(|b| *b == 0x0B));
    serializer.shutdown(&cx);
}

#[test]
fn recency_updates_without_token() {
    let (cx, opener) = new_store();
    let serializer = start(&cx, &opener);
    let account = serializer.make_io_account(0, 16);

    write_and_commit(&cx, &serializer, 2, 0x77, Some(Recency(5)));
    serializer.index_write(
        &cx,
        vec![IndexWriteOp::touch_recency(BlockId(2), Recency(42))],
        &account,
    );
    assert_eq!(serializer.get_recency(BlockId(2)), Recency(42));
    // The mapping itself is untouched.
    assert!(read_block(&cx, &serializer, 2).unwrap().iter().all(|b| *b == 0x77));
    serializer.shutdown(&cx);
}

#[test]
fn rewrites_preserve_recency_unless_replaced() {
    let (cx, opener) = new_store();
    let serializer = start(&cx, &opener);

    write_and_commit(&cx, &serializer, 0, 0x01, Some(Recency(9)));
    write_and_commit(&cx, &serializer, 0, 0x02, None);
    assert_eq!(serializer.get_recency(BlockId(0)), Recency(9));
    assert!(read_block(&cx, &serializer, 0).unwrap().iter().all(|b| *b == 0x02));
    serializer.shutdown(&cx);
}

#[test]
fn gc_remaps_live_tokens_and_preserves_contents() {
    let (cx, opener) = new_store();
    let serializer = start(&cx, &opener);
    let account = serializer.make_io_account(0, 16);

    // Fill several extents with rewrites of a handful of ids so most
    // slots become garbage and GC kicks in.
    for round in 0..8_u8 {
        for id in 0..4_u64 {
            write_and_commit(&cx, &serializer, id, round * 4 + id as u8 + 1, None);
        }
    }
    let metrics = serializer.metrics();
    assert!(metrics.data_extents_gced > 0, "workload never triggered GC");

    // Every id still reads back its latest committed contents.
    for id in 0..4_u64 {
        let expected = 7 * 4 + id as u8 + 1;
        assert!(read_block(&cx, &serializer, id).unwrap().iter().all(|b| *b == expected));
    }
    serializer.shutdown(&cx);
}

#[test]
fn token_follows_gc_to_the_new_offset() {
    let (cx, opener) = new_store();
    let serializer = start(&cx, &opener);
    let account = serializer.make_io_account(0, 16);

    write_and_commit(&cx, &serializer, 0, 0xEE, None);
    let token = serializer.index_read(BlockId(0)).unwrap();
    let offset_before = token.offset();

    // Churn other ids until the extent holding id 0 is collected.
    let mut moved = false;
    for round in 0..24_u8 {
        for id in 1..4_u64 {
            write_and_commit(&cx, &serializer, id, round + 1, None);
        }
        if token.offset() != offset_before {
            moved = true;
            break;
        }
    }
    assert!(moved, "GC never moved the pinned block");

    // The token still reads the original bytes at its new offset.
    let mut buf = serializer.malloc();
    serializer.block_read(&cx, &token, &mut buf, &account);
    assert!(buf.payload().iter().all(|b| *b == 0xEE));

    drop(token);
    serializer.shutdown(&cx);
}

#[test]
fn crash_after_metablock_n_recovers_exactly_n_writes() {
    let cx = Cx::for_testing();
    let opener = MemFileOpener::new();
    LogSerializer::create(&cx, &opener, config()).unwrap();

    // Apply writes one at a time, snapshotting the raw file after each
    // durable index write. Each snapshot is "a crash right after
    // metablock N".
    let mut snapshots = Vec::new();
    {
        let serializer = start(&cx, &opener);
        for n in 0..6_u64 {
            write_and_commit(&cx, &serializer, n % 3, 0x10 + n as u8, None);
            snapshots.push(opener.raw_device().snapshot());
        }
        serializer.shutdown(&cx);
    }

    for (n, snapshot) in snapshots.iter().enumerate() {
        // Materialize the snapshot as a permanent in-memory file.
        let crashed = MemFileOpener::new();
        let _ = crashed.open_create_temporary().unwrap();
        let device = crashed.raw_device();
        device.set_len_bytes(&cx, snapshot.len() as u64).unwrap();
        device.patch(0, snapshot);
        crashed.move_to_permanent_location().unwrap();

        let serializer = start(&cx, &crashed);
        // Replay the first n+1 writes against a model.
        let mut model: std::collections::HashMap<u64, u8> = std::collections::HashMap::new();
        for write in 0..=n as u64 {
            model.insert(write % 3, 0x10 + write as u8);
        }
        for (id, fill) in model {
            let got = read_block(&cx, &serializer, id).unwrap();
            assert!(
                got.iter().all(|b| *b == fill),
                "snapshot {n}: block {id} diverged"
            );
        }
        serializer.shutdown(&cx);
    }
}

#[test]
fn metrics_reflect_operations() {
    let (cx, opener) = new_store();
    let serializer = start(&cx, &opener);

    write_and_commit(&cx, &serializer, 0, 1, None);
    write_and_commit(&cx, &serializer, 1, 2, None);
    let _ = read_block(&cx, &serializer, 0);

    let metrics = serializer.metrics();
    assert_eq!(metrics.block_writes, 2);
    assert!(metrics.index_writes >= 2);
    assert_eq!(metrics.block_reads, 1);
    assert_eq!(metrics.index_reads, 1);
    assert_eq!(metrics.end_block_id, 2);
    assert!(metrics.extents_in_use >= 3);
    assert_eq!(metrics.live_tokens, 0);
    serializer.shutdown(&cx);
}

#[test]
fn disabled_gc_leaves_garbage_in_place() {
    let (cx, opener) = new_store();
    let serializer = start(&cx, &opener);
    serializer.disable_gc();

    // Fill one extent, then rewrite three of its four blocks so it is
    // mostly dead but pinned live by the fourth.
    for id in 0..4_u64 {
        write_and_commit(&cx, &serializer, id, 0x10 + id as u8, None);
    }
    for id in 0..3_u64 {
        write_and_commit(&cx, &serializer, id, 0x20 + id as u8, None);
    }
    let metrics = serializer.metrics();
    assert_eq!(metrics.data_extents_gced, 0);
    assert_eq!(metrics.old_garbage_blocks, 3);

    serializer.enable_gc();
    // Index writes after re-enabling notice the backlog.
    for id in 0..3_u64 {
        write_and_commit(&cx, &serializer, id, 0x30 + id as u8, None);
    }
    assert!(serializer.metrics().data_extents_gced > 0);
    serializer.shutdown(&cx);
}

#[derive(Default)]
struct CollectingSink {
    seen: std::sync::Mutex<Vec<(u64, u8)>>,
}

impl ReadAheadSink for CollectingSink {
    fn offer_read_ahead_buf(
        &self,
        block_id: BlockId,
        payload: &[u8],
        _token: &lss_core::BlockToken,
        _recency: Recency,
    ) -> bool {
        self.seen.lock().unwrap().push((block_id.0, payload[0]));
        true
    }
}

#[test]
fn gc_offers_moved_blocks_to_read_ahead_sinks() {
    let cx = Cx::for_testing();
    let opener = MemFileOpener::new();
    LogSerializer::create(&cx, &opener, config()).unwrap();
    let dynamic = DynamicConfig {
        read_ahead: true,
        ..DynamicConfig::default()
    };
    let serializer = LogSerializer::start(&cx, &opener, dynamic).unwrap();

    let sink = Arc::new(CollectingSink::default());
    let registered: Arc<dyn ReadAheadSink> = sink.clone();
    serializer.register_read_ahead_sink(registered.clone());
    assert!(serializer.should_perform_read_ahead());

    // Pin id 0, then churn the other ids until GC relocates it.
    write_and_commit(&cx, &serializer, 0, 0xEE, None);
    for round in 0..24_u8 {
        for id in 1..4_u64 {
            write_and_commit(&cx, &serializer, id, round + 1, None);
        }
        if serializer.metrics().data_extents_gced > 0 {
            break;
        }
    }

    let seen = sink.seen.lock().unwrap().clone();
    assert!(
        seen.iter().any(|(id, byte)| *id == 0 && *byte == 0xEE),
        "GC never offered the moved block to the read-ahead sink"
    );
    drop(seen);

    serializer.unregister_read_ahead_sink(&registered);
    assert!(!serializer.should_perform_read_ahead());
    serializer.shutdown(&cx);
}

#[test]
fn create_then_start_renames_to_permanent_path() {
    let cx = Cx::for_testing();
    let dir = tempfile::tempdir().unwrap();
    let permanent = dir.path().join("store.lss");
    let opener = PathFileOpener::new(&permanent);

    LogSerializer::create(&cx, &opener, config()).unwrap();
    assert!(!permanent.exists());
    assert!(dir.path().join("store.lss.create_temporary").exists());

    {
        let serializer = start_path(&cx, &opener);
        assert!(permanent.exists());
        assert!(!dir.path().join("store.lss.create_temporary").exists());
        write_and_commit(&cx, &serializer, 0, 0xCD, None);
        serializer.shutdown(&cx);
    }

    // And again from the permanent location.
    let serializer = start_path(&cx, &opener);
    assert!(read_block(&cx, &serializer, 0).unwrap().iter().all(|b| *b == 0xCD));
    serializer.shutdown(&cx);
}

fn start_path(cx: &Cx, opener: &PathFileOpener) -> Arc<LogSerializer> {
    LogSerializer::start(cx, opener, DynamicConfig::default()).unwrap()
}

#[test]
fn fresh_opener_recovers_store_created_but_never_started() {
    let cx = Cx::for_testing();
    let dir = tempfile::tempdir().unwrap();
    let permanent = dir.path().join("store.lss");

    {
        let opener = PathFileOpener::new(&permanent);
        LogSerializer::create(&cx, &opener, config()).unwrap();
        // The process dies before the first start; no rename happened.
    }
    assert!(!permanent.exists());
    assert!(dir.path().join("store.lss.create_temporary").exists());

    // A new process constructs a fresh opener and must still find the
    // store under its temporary name, then finish the rename.
    let opener = PathFileOpener::new(&permanent);
    let serializer = start_path(&cx, &opener);
    assert!(permanent.exists());
    assert!(!dir.path().join("store.lss.create_temporary").exists());

    write_and_commit(&cx, &serializer, 0, 0x6B, None);
    assert!(read_block(&cx, &serializer, 0).unwrap().iter().all(|b| *b == 0x6B));
    serializer.shutdown(&cx);
}

#[test]
fn start_without_valid_metablock_fails() {
    let cx = Cx::for_testing();
    let opener = MemFileOpener::new();
    LogSerializer::create(&cx, &opener, config()).unwrap();

    // Wipe the metablock extent.
    let device = opener.raw_device();
    let zeros = vec![0_u8; EXTENT_SIZE as usize];
    device.patch(EXTENT_SIZE as usize, &zeros);

    let result = LogSerializer::start(&cx, &opener, DynamicConfig::default());
    assert!(result.is_err());
}
