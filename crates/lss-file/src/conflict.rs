//! Conflict resolution for overlapping file I/O.
//!
//! The file is divided into fixed-size chunks; every chunk touched by
//! an in-flight or queued action carries a FIFO queue. An action may
//! be dispatched once no action ahead of it in any of its queues
//! conflicts with it, where two actions conflict unless both are
//! reads. Completions promote the next compatible batch: a run of
//! reads, or a single write.
//!
//! This gives the guarantees the serializer relies on: at most one
//! in-flight write overlaps any byte, overlapping reads proceed in
//! parallel, non-overlapping actions never wait on each other, and
//! conflicting actions complete in submission order.

use crate::device::ByteDevice;
use asupersync::Cx;
use lss_error::Result;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::trace;

/// Identifier of one submitted action, unique within a resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActionId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Read,
    Write,
}

impl ActionKind {
    fn conflicts_with_predecessor(self, predecessor: ActionKind) -> bool {
        !(self == Self::Read && predecessor == Self::Read)
    }
}

/// Result of submitting an action to the resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitOutcome {
    pub id: ActionId,
    /// Whether the action may run immediately.
    pub dispatched: bool,
}

#[derive(Debug)]
struct Action {
    kind: ActionKind,
    first_chunk: u64,
    last_chunk: u64,
    /// Per-chunk blocked flag; the action runs when none remain set.
    blocked_in: HashMap<u64, bool>,
    blocked_chunks: usize,
    dispatched: bool,
}

/// Pure queueing state machine; the caller performs the actual I/O.
#[derive(Debug)]
pub struct ConflictResolver {
    chunk_size: u64,
    queues: HashMap<u64, VecDeque<ActionId>>,
    actions: HashMap<ActionId, Action>,
    next_id: u64,
}

impl ConflictResolver {
    /// # Panics
    /// If `chunk_size` is zero.
    #[must_use]
    pub fn new(chunk_size: u64) -> Self {
        assert!(chunk_size > 0, "conflict chunk size must be nonzero");
        Self {
            chunk_size,
            queues: HashMap::new(),
            actions: HashMap::new(),
            next_id: 0,
        }
    }

    fn chunk_range(&self, offset: u64, len: usize) -> (u64, u64) {
        let first = offset / self.chunk_size;
        let last = offset.saturating_add(len.max(1) as u64 - 1) / self.chunk_size;
        (first, last)
    }

    /// Number of actions submitted but not yet completed.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.actions.len()
    }

    /// Submit an action over `[offset, offset + len)`.
    pub fn submit(&mut self, kind: ActionKind, offset: u64, len: usize) -> SubmitOutcome {
        let id = ActionId(self.next_id);
        self.next_id += 1;

        let (first_chunk, last_chunk) = self.chunk_range(offset, len);
        let mut blocked_in = HashMap::new();
        let mut blocked_chunks = 0;

        for chunk in first_chunk..=last_chunk {
            let queue = self.queues.entry(chunk).or_default();
            let blocked = match kind {
                ActionKind::Write => !queue.is_empty(),
                ActionKind::Read => queue
                    .iter()
                    .any(|prior| self.actions[prior].kind == ActionKind::Write),
            };
            queue.push_back(id);
            blocked_in.insert(chunk, blocked);
            if blocked {
                blocked_chunks += 1;
            }
        }

        let dispatched = blocked_chunks == 0;
        self.actions.insert(
            id,
            Action {
                kind,
                first_chunk,
                last_chunk,
                blocked_in,
                blocked_chunks,
                dispatched,
            },
        );

        trace!(
            target: "lss::file::conflict",
            event = "submit",
            id = id.0,
            kind = ?kind,
            offset,
            len,
            dispatched
        );
        SubmitOutcome { id, dispatched }
    }

    /// Record completion of a dispatched action and return the actions
    /// that become dispatchable as a result.
    ///
    /// # Panics
    /// If `id` was never submitted, was not dispatched, or already
    /// completed.
    pub fn done(&mut self, id: ActionId) -> Vec<ActionId> {
        let action = self.actions.remove(&id).expect("unknown action completed");
        assert!(action.dispatched, "completed an action that never ran");

        let mut promoted = Vec::new();
        for chunk in action.first_chunk..=action.last_chunk {
            let queue = self.queues.get_mut(&chunk).expect("queue for chunk");
            let pos = queue
                .iter()
                .position(|queued| *queued == id)
                .expect("action in its chunk queue");
            queue.remove(pos);
            if queue.is_empty() {
                self.queues.remove(&chunk);
                continue;
            }

            // Re-derive blocked flags for the survivors of this chunk.
            let order: Vec<ActionId> = queue.iter().copied().collect();
            let mut seen_any = false;
            let mut seen_write = false;
            for survivor_id in order {
                let survivor = self.actions.get_mut(&survivor_id).expect("queued action");
                let blocked_now = match survivor.kind {
                    ActionKind::Write => seen_any,
                    ActionKind::Read => seen_write,
                };
                let was_blocked = survivor
                    .blocked_in
                    .insert(chunk, blocked_now)
                    .expect("chunk tracked by queued action");
                if was_blocked && !blocked_now {
                    survivor.blocked_chunks -= 1;
                    if survivor.blocked_chunks == 0 && !survivor.dispatched {
                        survivor.dispatched = true;
                        promoted.push(survivor_id);
                    }
                }
                debug_assert!(was_blocked || !blocked_now, "an action cannot become blocked");
                seen_any = true;
                seen_write |= survivor.kind == ActionKind::Write;
            }
        }

        trace!(
            target: "lss::file::conflict",
            event = "done",
            id = id.0,
            promoted = promoted.len()
        );
        promoted
    }
}

#[derive(Debug)]
struct ResolvingState {
    resolver: ConflictResolver,
    ready: HashSet<ActionId>,
}

/// A [`ByteDevice`] that serializes conflicting requests.
///
/// Blocking reads and writes from multiple threads are admitted by the
/// resolver; a caller whose request conflicts parks on a condvar until
/// every earlier conflicting request has finished.
#[derive(Debug)]
pub struct ConflictResolvingDevice<D: ByteDevice> {
    inner: D,
    state: Mutex<ResolvingState>,
    promoted: Condvar,
}

impl<D: ByteDevice> ConflictResolvingDevice<D> {
    #[must_use]
    pub fn new(inner: D, chunk_size: u64) -> Self {
        Self {
            inner,
            state: Mutex::new(ResolvingState {
                resolver: ConflictResolver::new(chunk_size),
                ready: HashSet::new(),
            }),
            promoted: Condvar::new(),
        }
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }

    fn admit(&self, kind: ActionKind, offset: u64, len: usize) -> ActionId {
        let mut state = self.state.lock();
        let outcome = state.resolver.submit(kind, offset, len);
        if !outcome.dispatched {
            while !state.ready.remove(&outcome.id) {
                self.promoted.wait(&mut state);
            }
        }
        outcome.id
    }

    fn retire(&self, id: ActionId) {
        let mut state = self.state.lock();
        let promoted = state.resolver.done(id);
        if !promoted.is_empty() {
            state.ready.extend(promoted);
            self.promoted.notify_all();
        }
    }
}

impl<D: ByteDevice> ByteDevice for ConflictResolvingDevice<D> {
    fn len_bytes(&self) -> u64 {
        self.inner.len_bytes()
    }

    fn set_len_bytes(&self, cx: &Cx, len: u64) -> Result<()> {
        self.inner.set_len_bytes(cx, len)
    }

    fn read_exact_at(&self, cx: &Cx, offset: u64, buf: &mut [u8]) -> Result<()> {
        let id = self.admit(ActionKind::Read, offset, buf.len());
        let result = self.inner.read_exact_at(cx, offset, buf);
        self.retire(id);
        result
    }

    fn write_all_at(&self, cx: &Cx, offset: u64, buf: &[u8]) -> Result<()> {
        let id = self.admit(ActionKind::Write, offset, buf.len());
        let result = self.inner.write_all_at(cx, offset, buf);
        self.retire(id);
        result
    }

    fn sync(&self, cx: &Cx) -> Result<()> {
        self.inner.sync(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHUNK: u64 = 4096;

    /// Drives the resolver by hand against an in-memory byte vector,
    /// checking on every dispatch that nothing conflicting runs
    /// concurrently.
    struct TestDriver {
        resolver: ConflictResolver,
        data: Vec<u8>,
        running: Vec<ActionId>,
        actions: HashMap<ActionId, DriverAction>,
    }

    struct DriverAction {
        kind: ActionKind,
        offset: usize,
        len: usize,
        write_data: Vec<u8>,
        read_buf: Vec<u8>,
        expected: Option<Vec<u8>>,
        done: bool,
    }

    impl TestDriver {
        fn new() -> Self {
            Self {
                resolver: ConflictResolver::new(CHUNK),
                data: Vec::new(),
                running: Vec::new(),
                actions: HashMap::new(),
            }
        }

        fn check_no_running_conflict(&self, id: ActionId) {
            let new = &self.actions[&id];
            for other_id in &self.running {
                let other = &self.actions[other_id];
                let overlap = new.offset < other.offset + other.len
                    && other.offset < new.offset + new.len;
                if overlap {
                    assert!(
                        new.kind == ActionKind::Read && other.kind == ActionKind::Read,
                        "conflicting actions {id:?} and {other_id:?} dispatched together"
                    );
                }
            }
        }

        fn on_dispatch(&mut self, id: ActionId) {
            self.check_no_running_conflict(id);
            let data = &self.data;
            let action = self.actions.get_mut(&id).unwrap();
            if action.kind == ActionKind::Read {
                // The bytes a read observes are fixed at dispatch time:
                // no conflicting write may run until it completes.
                let mut expected = vec![0_u8; action.len];
                for (i, byte) in expected.iter_mut().enumerate() {
                    *byte = data.get(action.offset + i).copied().unwrap_or(0);
                }
                action.expected = Some(expected);
            }
            self.running.push(id);
        }

        fn write(&mut self, offset: usize, payload: &[u8]) -> ActionId {
            let outcome = self
                .resolver
                .submit(ActionKind::Write, offset as u64, payload.len());
            self.actions.insert(
                outcome.id,
                DriverAction {
                    kind: ActionKind::Write,
                    offset,
                    len: payload.len(),
                    write_data: payload.to_vec(),
                    read_buf: Vec::new(),
                    expected: None,
                    done: false,
                },
            );
            if outcome.dispatched {
                self.on_dispatch(outcome.id);
            }
            outcome.id
        }

        fn read(&mut self, offset: usize, len: usize) -> ActionId {
            let outcome = self.resolver.submit(ActionKind::Read, offset as u64, len);
            self.actions.insert(
                outcome.id,
                DriverAction {
                    kind: ActionKind::Read,
                    offset,
                    len,
                    write_data: Vec::new(),
                    read_buf: vec![0_u8; len],
                    expected: None,
                    done: false,
                },
            );
            if outcome.dispatched {
                self.on_dispatch(outcome.id);
            }
            outcome.id
        }

        fn was_sent(&self, id: ActionId) -> bool {
            self.running.contains(&id) || self.actions[&id].done
        }

        /// Let one running action touch the data and complete.
        fn permit(&mut self, id: ActionId) {
            let pos = self
                .running
                .iter()
                .position(|r| *r == id)
                .unwrap_or_else(|| panic!("{id:?} not running"));
            self.running.remove(pos);

            {
                let action = self.actions.get_mut(&id).unwrap();
                let end = action.offset + action.len;
                if self.data.len() < end {
                    self.data.resize(end, 0);
                }
                match action.kind {
                    ActionKind::Write => {
                        self.data[action.offset..end].copy_from_slice(&action.write_data);
                    }
                    ActionKind::Read => {
                        action.read_buf.copy_from_slice(&self.data[action.offset..end]);
                        assert_eq!(
                            Some(&action.read_buf),
                            action.expected.as_ref(),
                            "read observed bytes other than those current at dispatch"
                        );
                    }
                }
                action.done = true;
            }

            let promoted = self.resolver.done(id);
            for next in promoted {
                self.on_dispatch(next);
            }
        }

        fn read_result(&self, id: ActionId) -> &[u8] {
            let action = &self.actions[&id];
            assert!(action.done);
            &action.read_buf
        }

        fn assert_all_done(&self) {
            assert!(self.running.is_empty());
            assert_eq!(self.resolver.in_flight(), 0);
            assert!(self.actions.values().all(|a| a.done));
        }
    }

    #[test]
    fn write_write_conflict_runs_in_order() {
        let mut d = TestDriver::new();
        let w1 = d.write(0, b"foo");
        let w2 = d.write(0, b"bar");
        let r = d.read(0, 3);
        d.permit(w1);
        d.permit(w2);
        d.permit(r);
        assert_eq!(d.read_result(r), b"bar");
        d.assert_all_done();
    }

    #[test]
    fn write_read_conflict_read_sees_write() {
        let mut d = TestDriver::new();
        let initial = d.write(0, b"initial");
        let w = d.write(0, b"foo");
        let r = d.read(0, 3);
        d.permit(initial);
        d.permit(w);
        d.permit(r);
        assert_eq!(d.read_result(r), b"foo");
        d.assert_all_done();
    }

    #[test]
    fn read_write_conflict_read_goes_first() {
        let mut d = TestDriver::new();
        let initial = d.write(0, b"initial");
        let r = d.read(0, 4);
        let w = d.write(0, b"something_else");
        d.permit(initial);
        d.permit(r);
        d.permit(w);
        assert_eq!(d.read_result(r), b"init");
        d.assert_all_done();
    }

    #[test]
    fn no_spurious_conflicts_between_distant_writes() {
        let mut d = TestDriver::new();
        let w1 = d.write(0, b"foo");
        let w2 = d.write(4096, b"bar");
        assert!(d.was_sent(w1));
        assert!(d.was_sent(w2));
        d.permit(w1);
        d.permit(w2);
        d.assert_all_done();
    }

    #[test]
    fn reads_do_not_block_reads() {
        let mut d = TestDriver::new();
        let w = d.write(0, b"foo");
        let r1 = d.read(0, 3);
        let r2 = d.read(0, 3);
        d.permit(w);
        // Both reads must be promoted together once the write retires.
        assert!(d.was_sent(r1));
        assert!(d.was_sent(r2));
        d.permit(r1);
        d.permit(r2);
        assert_eq!(d.read_result(r1), b"foo");
        assert_eq!(d.read_result(r2), b"foo");
        d.assert_all_done();
    }

    #[test]
    fn read_of_subrange_sees_write() {
        let mut d = TestDriver::new();
        let w = d.write(0, b"abcdefghijklmnopqrstuvwxyz");
        let r = d.read(3, 9);
        d.permit(w);
        d.permit(r);
        assert_eq!(d.read_result(r), b"defghijkl");
        d.assert_all_done();
    }

    #[test]
    fn read_of_superrange_sees_both_writes() {
        let mut d = TestDriver::new();
        let initial = d.write(0, b"abc____________________xyz");
        let w = d.write(3, b"defghijklmnopqrstuvw");
        let r = d.read(0, 26);
        d.permit(initial);
        d.permit(w);
        d.permit(r);
        assert_eq!(d.read_result(r), b"abcdefghijklmnopqrstuvwxyz");
        d.assert_all_done();
    }

    #[test]
    fn write_behind_waiting_write_is_not_promoted_early() {
        let mut d = TestDriver::new();
        let w1 = d.write(0, b"one");
        let w2 = d.write(0, b"two");
        let w3 = d.write(0, b"three");
        assert!(d.was_sent(w1));
        assert!(!d.was_sent(w2));
        assert!(!d.was_sent(w3));
        d.permit(w1);
        assert!(d.was_sent(w2));
        assert!(!d.was_sent(w3));
        d.permit(w2);
        d.permit(w3);
        let r = d.read(0, 5);
        d.permit(r);
        assert_eq!(d.read_result(r), b"three");
        d.assert_all_done();
    }

    /// Deterministic xorshift so the randomized run is reproducible.
    struct XorShift(u64);

    impl XorShift {
        fn next(&mut self) -> u64 {
            let mut x = self.0;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            self.0 = x;
            x
        }

        fn below(&mut self, bound: u64) -> u64 {
            self.next() % bound
        }
    }

    #[test]
    fn randomized_workload_upholds_ordering_properties() {
        for seed in 1_u64..=8 {
            let mut rng = XorShift(seed.wrapping_mul(0x9E37_79B9_7F4A_7C15));
            let mut d = TestDriver::new();
            let mut submitted = Vec::new();

            for step in 0..200 {
                let submit = step < 120 && (d.running.is_empty() || rng.below(3) != 0);
                if submit {
                    let offset = (rng.below(4) * 4096 + rng.below(64)) as usize;
                    let len = (rng.below(200) + 1) as usize;
                    let id = if rng.below(2) == 0 {
                        let fill = (rng.next() & 0xFF) as u8;
                        let payload = vec![fill; len];
                        d.write(offset, &payload)
                    } else {
                        d.read(offset, len)
                    };
                    submitted.push(id);
                } else if !d.running.is_empty() {
                    let pick = rng.below(d.running.len() as u64) as usize;
                    let id = d.running[pick];
                    d.permit(id);
                }
            }
            while !d.running.is_empty() {
                let id = d.running[0];
                d.permit(id);
            }

            // Every submitted action completed.
            assert!(submitted.iter().all(|id| d.actions[id].done));
            d.assert_all_done();
        }
    }

    #[test]
    fn resolving_device_passes_data_through() {
        use crate::device::MemoryByteDevice;
        let cx = Cx::for_testing();
        let mem = MemoryByteDevice::new();
        let dev = ConflictResolvingDevice::new(mem, CHUNK);
        dev.set_len_bytes(&cx, 8192).unwrap();

        dev.write_all_at(&cx, 100, b"payload").unwrap();
        let mut buf = [0_u8; 7];
        dev.read_exact_at(&cx, 100, &mut buf).unwrap();
        assert_eq!(&buf, b"payload");
    }

    #[test]
    fn resolving_device_parallel_writers_land_in_order_per_range() {
        use crate::device::MemoryByteDevice;
        use std::sync::Arc;

        let cx = Cx::for_testing();
        let mem = MemoryByteDevice::new();
        let dev = Arc::new(ConflictResolvingDevice::new(mem, CHUNK));
        dev.set_len_bytes(&cx, 4096).unwrap();

        let mut handles = Vec::new();
        for fill in 0..4_u8 {
            let dev = Arc::clone(&dev);
            handles.push(std::thread::spawn(move || {
                let cx = Cx::for_testing();
                dev.write_all_at(&cx, 0, &[fill; 512]).unwrap();
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let mut buf = [0_u8; 512];
        dev.read_exact_at(&cx, 0, &mut buf).unwrap();
        // One of the writers was last; the range is not torn.
        assert!(buf.iter().all(|b| *b == buf[0]));
    }
}
