//! Block tokens and the registry that keeps their offsets live.
//!
//! A token is a cloneable handle; the registry maintains the two
//! indices the engine's invariants are stated over: `token -> offset`
//! (unique per token) and `offset -> tokens` (several tokens may name
//! the same offset, e.g. after a GC remap). The first token for an
//! offset marks it token-live in the data-block manager; dropping the
//! last one marks it token-garbage.

use lss_datablock::DataBlockManager;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct TokenId(u64);

#[derive(Debug, Default)]
struct RegistryState {
    token_offsets: HashMap<u64, u64>,
    offset_tokens: HashMap<u64, Vec<u64>>,
    next_id: u64,
}

impl RegistryState {
    fn assert_paired(&self) {
        debug_assert_eq!(
            self.token_offsets.is_empty(),
            self.offset_tokens.is_empty(),
            "token index maps must be empty together"
        );
    }
}

#[derive(Debug)]
pub(crate) struct TokenRegistry {
    datablocks: Arc<DataBlockManager>,
    state: Mutex<RegistryState>,
    drained: Condvar,
}

impl TokenRegistry {
    pub(crate) fn new(datablocks: Arc<DataBlockManager>) -> Self {
        Self {
            datablocks,
            state: Mutex::new(RegistryState::default()),
            drained: Condvar::new(),
        }
    }

    pub(crate) fn register(self: &Arc<Self>, offset: u64) -> BlockToken {
        let id = {
            let mut state = self.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.token_offsets.insert(id, offset);
            let tokens = state.offset_tokens.entry(offset).or_default();
            let first_token_for_offset = tokens.is_empty();
            tokens.push(id);
            if first_token_for_offset {
                self.datablocks.mark_token_live(offset);
            }
            state.assert_paired();
            id
        };
        trace!(target: "lss::token", event = "registered", id, offset);
        BlockToken {
            inner: Arc::new(TokenInner {
                id: TokenId(id),
                registry: Arc::clone(self),
            }),
        }
    }

    fn unregister(&self, id: TokenId) {
        let mut state = self.state.lock();
        let offset = state
            .token_offsets
            .remove(&id.0)
            .expect("unregistered a token twice");
        let tokens = state
            .offset_tokens
            .get_mut(&offset)
            .expect("offset entry for live token");
        let position = tokens
            .iter()
            .position(|t| *t == id.0)
            .expect("token listed under its offset");
        tokens.remove(position);
        let last_token_for_offset = tokens.is_empty();
        if last_token_for_offset {
            state.offset_tokens.remove(&offset);
            self.datablocks.mark_token_garbage(offset);
        }
        state.assert_paired();
        if state.token_offsets.is_empty() {
            self.drained.notify_all();
        }
        drop(state);
        trace!(target: "lss::token", event = "unregistered", id = id.0, offset);
    }

    /// Current offset of a registered token.
    ///
    /// # Panics
    /// If the token does not belong to this registry (protocol misuse).
    pub(crate) fn token_offset(&self, token: &BlockToken) -> u64 {
        let state = self.state.lock();
        *state
            .token_offsets
            .get(&token.inner.id.0)
            .expect("token is not registered with this serializer")
    }

    /// Retarget every token at `old_offset` to `new_offset`, moving the
    /// token-liveness bit along. No-op if no tokens point at `old_offset`.
    pub(crate) fn remap(&self, old_offset: u64, new_offset: u64) {
        assert_ne!(old_offset, new_offset);
        let mut state = self.state.lock();
        let Some(moved) = state.offset_tokens.remove(&old_offset) else {
            return;
        };
        for id in &moved {
            *state
                .token_offsets
                .get_mut(id)
                .expect("token entry for remapped offset") = new_offset;
        }
        let count = moved.len();
        let tokens = state.offset_tokens.entry(new_offset).or_default();
        let first_token_for_offset = tokens.is_empty();
        tokens.extend(moved);
        if first_token_for_offset {
            self.datablocks.mark_token_live(new_offset);
        }
        self.datablocks.mark_token_garbage(old_offset);
        state.assert_paired();
        drop(state);
        trace!(
            target: "lss::token",
            event = "remapped",
            old_offset,
            new_offset,
            tokens = count
        );
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.state.lock().token_offsets.is_empty()
    }

    pub(crate) fn live_tokens(&self) -> usize {
        self.state.lock().token_offsets.len()
    }

    /// Block until every outstanding token has been released.
    pub(crate) fn wait_drained(&self) {
        let mut state = self.state.lock();
        while !state.token_offsets.is_empty() {
            self.drained.wait(&mut state);
        }
    }
}

#[derive(Debug)]
struct TokenInner {
    id: TokenId,
    registry: Arc<TokenRegistry>,
}

impl Drop for TokenInner {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
    }
}

/// Reference-counted handle that keeps a block offset addressable.
///
/// While any clone is alive the offset cannot be reclaimed by GC; a GC
/// rewrite retargets the handle to the block's new offset instead.
#[derive(Debug, Clone)]
pub struct BlockToken {
    inner: Arc<TokenInner>,
}

impl BlockToken {
    /// The offset this token currently protects.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.inner.registry.token_offset(self)
    }
}

impl PartialEq for BlockToken {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for BlockToken {}
