//! Scoped network namespace entry.
//!
//! `setns(2)` changes the namespace of the calling thread only, so a guard is
//! pinned to the thread that created it and switches that thread back when it
//! is left or dropped.

use std::marker::PhantomData;
use tracing::{debug, error};

use crate::error::Result;
use crate::link::LinkOps;

/// Holds the calling thread inside a target namespace until left or dropped.
pub struct NetnsGuard<'a, L: LinkOps> {
    ops: &'a L,
    original: L::Netns,
    restored: bool,
    // setns is per-thread; the guard must not cross threads
    _not_send: PhantomData<*const ()>,
}

impl<'a, L: LinkOps> NetnsGuard<'a, L> {
    /// Remember the current namespace, then switch into `target`.
    pub fn enter(ops: &'a L, target: &L::Netns) -> Result<Self> {
        let original = ops.current_netns()?;
        ops.enter_netns(target)?;
        debug!("Entered target network namespace");
        Ok(Self {
            ops,
            original,
            restored: false,
            _not_send: PhantomData,
        })
    }

    /// The namespace the thread was in before entering.
    pub fn original(&self) -> &L::Netns {
        &self.original
    }

    /// Switch back, reporting a failed restore instead of only logging it.
    ///
    /// If switching back fails, dropping the guard tries once more.
    pub fn leave(mut self) -> Result<()> {
        self.ops.enter_netns(&self.original)?;
        self.restored = true;
        debug!("Restored original network namespace");
        Ok(())
    }
}

impl<L: LinkOps> Drop for NetnsGuard<'_, L> {
    fn drop(&mut self) {
        if self.restored {
            return;
        }
        if let Err(e) = self.ops.enter_netns(&self.original) {
            error!("Failed to restore original network namespace: {}", e);
        }
    }
}

/// Run `f` inside `target`, always returning to the current namespace.
///
/// An error from `f` wins over an error restoring the namespace.
pub fn with_netns<L, T, F>(ops: &L, target: &L::Netns, f: F) -> Result<T>
where
    L: LinkOps,
    F: FnOnce(&NetnsGuard<'_, L>) -> Result<T>,
{
    let guard = NetnsGuard::enter(ops, target)?;
    let out = f(&guard);
    match out {
        Ok(value) => {
            guard.leave()?;
            Ok(value)
        }
        Err(e) => {
            drop(guard);
            Err(e)
        }
    }
}
