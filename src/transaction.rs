//! Transaction join/leave and commit (§4.F). Mirrors `fs/btrfs/transaction.c`'s
//! waitqueue-based join protocol one for one: a plain `Mutex` + `Condvar` pair, no
//! async runtime, because every writer here is a synchronous call into the library —
//! there is nothing to `.await`.

use crate::btree::Tree;
use crate::cache::Cache;
use crate::device::BlockDevice;
use crate::error::Result;
use crate::extent::ExtentAllocator;
use std::rc::Rc;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

struct State {
    generation: u64,
    num_writers: u32,
    committing: bool,
    last_commit: Instant,
}

pub struct TransactionManager {
    state: Mutex<State>,
    cond: Condvar,
}

impl TransactionManager {
    pub fn new(generation: u64) -> TransactionManager {
        TransactionManager {
            state: Mutex::new(State {
                generation,
                num_writers: 0,
                committing: false,
                last_commit: Instant::now(),
            }),
            cond: Condvar::new(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.state.lock().unwrap().generation
    }

    /// Joins the running transaction (or starts one), stamping every tree passed in
    /// with its generation, then bumps the writer count so a concurrent commit waits
    /// for this caller to `end_transaction` before it proceeds (§5).
    pub fn start_transaction(&self, trees: &[&Tree]) -> u64 {
        let mut state = self.state.lock().unwrap();
        while state.committing {
            state = self.cond.wait(state).unwrap();
        }
        state.num_writers += 1;
        let generation = state.generation;
        for tree in trees {
            tree.set_transaction(generation);
        }
        generation
    }

    pub fn end_transaction(&self) {
        let mut state = self.state.lock().unwrap();
        state.num_writers -= 1;
        self.cond.notify_all();
    }

    /// Runs the fixed-point commit: flushing dirty blocks can hand the extent
    /// allocator new bookkeeping to persist, and persisting that bookkeeping COWs the
    /// extent tree, which dirties more blocks — so loop until a pass changes nothing,
    /// then install the new super block atomically (§4.F.2). `persist_dirty_roots`
    /// (§4.F step 3) joins the same fixed point: rewriting a dirty root's `ROOT_ITEM`
    /// COWs the tree-of-roots, which can itself hand the extent allocator more
    /// bookkeeping to drain.
    pub fn commit_transaction(
        &self,
        cache: &Cache,
        alloc: &ExtentAllocator,
        device: &dyn BlockDevice,
        persist_dirty_roots: impl FnMut() -> Result<bool>,
        write_super: impl FnOnce(u64) -> Result<()>,
    ) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            while state.num_writers > 0 {
                state = self.cond.wait(state).unwrap();
            }
            state.committing = true;
        }

        let result = self.run_commit(cache, alloc, device, persist_dirty_roots, write_super);

        let mut state = self.state.lock().unwrap();
        state.committing = false;
        if result.is_ok() {
            state.generation += 1;
            state.last_commit = Instant::now();
        }
        self.cond.notify_all();
        result
    }

    fn run_commit(
        &self,
        cache: &Cache,
        alloc: &ExtentAllocator,
        device: &dyn BlockDevice,
        mut persist_dirty_roots: impl FnMut() -> Result<bool>,
        write_super: impl FnOnce(u64) -> Result<()>,
    ) -> Result<()> {
        loop {
            let wrote_roots = persist_dirty_roots()?;
            cache.write_dirty()?;
            let drained_pending = alloc.finish_pending()?;
            if !wrote_roots && !drained_pending {
                break;
            }
        }
        cache.write_dirty()?;
        device.sync()?;

        let generation = self.state.lock().unwrap().generation;
        write_super(generation)?;
        device.sync()?;

        alloc.unpin_all();
        Ok(())
    }

    /// Commits only if nothing has written to the filesystem for at least `idle_secs`
    /// — the embedder calls this periodically instead of this module spawning its own
    /// background thread (§4.F.3).
    pub fn maybe_commit_idle(
        &self,
        idle_secs: u64,
        cache: &Cache,
        alloc: &ExtentAllocator,
        device: &dyn BlockDevice,
        persist_dirty_roots: impl FnMut() -> Result<bool>,
        write_super: impl FnOnce(u64) -> Result<()>,
    ) -> Result<bool> {
        let idle = {
            let state = self.state.lock().unwrap();
            !state.committing
                && state.num_writers == 0
                && state.last_commit.elapsed().as_secs() >= idle_secs
        };
        if !idle {
            return Ok(false);
        }
        self.commit_transaction(cache, alloc, device, persist_dirty_roots, write_super)?;
        Ok(true)
    }
}

/// Convenience bundle so `Filesystem` doesn't need to juggle `Rc`s for every commit
/// call site.
pub struct TransactionContext {
    pub cache: Rc<Cache>,
    pub alloc: Rc<ExtentAllocator>,
    pub device: Arc<dyn BlockDevice>,
}
