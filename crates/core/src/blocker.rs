//! Database access blocker
//!
//! The blocker is a default-deny gate consulted by every connection
//! operation. It starts blocked; only explicit unblock calls lower it.
//!
//! Each `unblock`/`block` pushes the previous state onto a history stack and
//! each `restore` pops it, so balanced calls always end at the initial state.
//! While unblocked, access is confined to the thread that unblocked (the
//! owner) plus any threads explicitly shared with it.
//!
//! ## Usage
//!
//! ```
//! use isodb_core::AccessBlocker;
//! let blocker = AccessBlocker::new_shared();
//! assert!(blocker.check_access().is_err());
//! {
//!     let _guard = blocker.unblock();
//!     assert!(blocker.check_access().is_ok());
//! }
//! assert!(blocker.is_blocked());
//! ```

use crate::error::{IsoError, IsoResult};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::{debug, error};

/// Process-wide blocker used when a session is not given one
static GLOBAL_BLOCKER: Lazy<Arc<AccessBlocker>> = Lazy::new(AccessBlocker::new_shared);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct GateState {
    blocked: bool,
    owner: Option<ThreadId>,
}

#[derive(Debug)]
struct BlockerState {
    current: GateState,
    shared: HashSet<ThreadId>,
    history: Vec<GateState>,
}

/// Default-deny database access gate
#[derive(Debug)]
pub struct AccessBlocker {
    state: Mutex<BlockerState>,
}

impl Default for AccessBlocker {
    fn default() -> Self {
        Self::new()
    }
}

impl AccessBlocker {
    /// Create a blocked gate
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BlockerState {
                current: GateState {
                    blocked: true,
                    owner: None,
                },
                shared: HashSet::new(),
                history: Vec::new(),
            }),
        }
    }

    /// Create a blocked gate behind an `Arc`
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// The process-wide blocker
    pub fn global() -> Arc<Self> {
        Arc::clone(&GLOBAL_BLOCKER)
    }

    // ========================================================================
    // Scoped API
    // ========================================================================

    /// Unblock until the returned guard is dropped
    ///
    /// The calling thread becomes the owner of the gate.
    pub fn unblock(self: &Arc<Self>) -> BlockerGuard {
        let depth = self.unblock_raw();
        BlockerGuard::new(Arc::clone(self), depth)
    }

    /// Block until the returned guard is dropped
    pub fn block(self: &Arc<Self>) -> BlockerGuard {
        let depth = self.block_raw();
        BlockerGuard::new(Arc::clone(self), depth)
    }

    // ========================================================================
    // Raw API
    // ========================================================================

    /// Unblock without a guard; pair with [`restore`](Self::restore)
    ///
    /// Returns the history depth after the push.
    pub fn unblock_raw(&self) -> usize {
        self.push(GateState {
            blocked: false,
            owner: Some(thread::current().id()),
        })
    }

    /// Block without a guard; pair with [`restore`](Self::restore)
    pub fn block_raw(&self) -> usize {
        self.push(GateState {
            blocked: true,
            owner: None,
        })
    }

    /// Return to the state before the most recent unblock/block
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if there is nothing to restore.
    pub fn restore(&self) -> IsoResult<()> {
        let mut state = self.state.lock();
        match state.history.pop() {
            Some(previous) => {
                state.current = previous;
                Ok(())
            }
            None => Err(IsoError::invalid_operation(
                "restore called without a matching unblock or block",
            )),
        }
    }

    fn push(&self, next: GateState) -> usize {
        let mut state = self.state.lock();
        let previous = state.current;
        state.history.push(previous);
        state.current = next;
        let depth = state.history.len();
        debug!(target: "isodb::blocker", blocked = next.blocked, depth, "access gate changed");
        depth
    }

    fn restore_at(&self, depth: usize) -> IsoResult<()> {
        let mut state = self.state.lock();
        if state.history.len() != depth {
            return Err(IsoError::invalid_operation(format!(
                "blocker restored out of order (expected depth {}, found {})",
                depth,
                state.history.len()
            )));
        }
        if let Some(previous) = state.history.pop() {
            state.current = previous;
        }
        Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// True while the gate is closed
    pub fn is_blocked(&self) -> bool {
        self.state.lock().current.blocked
    }

    /// Number of unrestored unblock/block calls
    pub fn depth(&self) -> usize {
        self.state.lock().history.len()
    }

    /// Check whether the calling thread may touch the database
    ///
    /// # Errors
    ///
    /// - `AccessBlocked` while the gate is closed
    /// - `NotMainThread` when the gate is open for another thread
    pub fn check_access(&self) -> IsoResult<()> {
        let state = self.state.lock();
        if state.current.blocked {
            return Err(IsoError::AccessBlocked);
        }
        let current = thread::current();
        match state.current.owner {
            Some(owner) if owner != current.id() && !state.shared.contains(&current.id()) => {
                Err(IsoError::NotMainThread {
                    thread: current
                        .name()
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("{:?}", current.id())),
                })
            }
            _ => Ok(()),
        }
    }

    // ========================================================================
    // Thread sharing
    // ========================================================================

    /// Allow another thread to use the gate while it is open
    pub fn share_with_thread(&self, id: ThreadId) {
        self.state.lock().shared.insert(id);
    }

    /// Revoke a previous [`share_with_thread`](Self::share_with_thread)
    pub fn unshare_thread(&self, id: ThreadId) {
        self.state.lock().shared.remove(&id);
    }
}

/// Scoped unblock/block; restores the previous state on drop
#[must_use = "dropping the guard immediately restores the previous state"]
#[derive(Debug)]
pub struct BlockerGuard {
    blocker: Arc<AccessBlocker>,
    depth: usize,
    released: bool,
}

impl BlockerGuard {
    fn new(blocker: Arc<AccessBlocker>, depth: usize) -> Self {
        Self {
            blocker,
            depth,
            released: false,
        }
    }

    /// Restore now, reporting out-of-order restores
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if guards were restored out of order.
    pub fn release(mut self) -> IsoResult<()> {
        self.released = true;
        self.blocker.restore_at(self.depth)
    }
}

impl Drop for BlockerGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.blocker.restore_at(self.depth) {
            error!(target: "isodb::blocker", error = %e, "blocker guard dropped out of order");
        }
    }
}
