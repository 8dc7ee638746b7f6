use core::fmt;
use std::cell::RefCell;
use std::sync::{Mutex, PoisonError};

use crate::{AnyhowResult, Flash, FlashAccess};

/// Mutual exclusion around block operations.
///
/// When installed, every block operation calls `lock()` before touching
/// the flash and `unlock()` on every exit path. If the consumer also calls
/// the block device's own `lock()` around its operations, the hooks must
/// tolerate recursive locking from the same thread.
pub trait LockHooks: Send + Sync {
    fn lock(&self) -> AnyhowResult<()>;
    fn unlock(&self) -> AnyhowResult<()>;
}

/// Receives the diagnostic messages of one instance.
pub trait LogSink: Send + Sync {
    fn log(&self, level: log::Level, args: fmt::Arguments<'_>);
}

/// Send a message to the `log` facade and to `sink` if one is installed.
pub(crate) fn emit(sink: Option<&dyn LogSink>, level: log::Level, args: fmt::Arguments<'_>) {
    log::log!(level, "{}", args);
    if let Some(sink) = sink {
        sink.log(level, args);
    }
}

/// A flash engine which can be reached through a shared reference.
///
/// Several block device instances may hold references to the same engine.
pub trait SharedFlash {
    type Access: FlashAccess;

    fn with_flash<R, F>(&self, f: F) -> R
        where F: FnOnce(&mut Flash<Self::Access>) -> R;
}

impl<A: FlashAccess> SharedFlash for RefCell<Flash<A>> {
    type Access = A;

    fn with_flash<R, F>(&self, f: F) -> R
        where F: FnOnce(&mut Flash<A>) -> R
    {
        f(&mut self.borrow_mut())
    }
}

impl<A: FlashAccess> SharedFlash for Mutex<Flash<A>> {
    type Access = A;

    fn with_flash<R, F>(&self, f: F) -> R
        where F: FnOnce(&mut Flash<A>) -> R
    {
        // Poisoning is ignored, the engine keeps no state a panic could tear.
        let mut flash = self.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut flash)
    }
}
