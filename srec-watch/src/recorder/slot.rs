//! Per-entry runtime slot.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::domain::{WatchEntry, WatchStatus};
use crate::supervisor::ProcessHandle;

/// One watched entry plus the runtime state that is never persisted.
pub(crate) struct WatchSlot {
    pub(crate) entry: Mutex<WatchEntry>,
    checking: AtomicBool,
    /// The running capture, if any. Cleared by the exit watcher.
    pub(crate) capture: Mutex<Option<ProcessHandle>>,
}

impl WatchSlot {
    pub(crate) fn new(entry: WatchEntry) -> Self {
        Self {
            entry: Mutex::new(entry),
            checking: AtomicBool::new(false),
            capture: Mutex::new(None),
        }
    }

    /// Claim the detect cycle for this entry. `None` if one is already running.
    pub(crate) fn try_begin_check(&self) -> Option<CheckGuard<'_>> {
        self.checking
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| CheckGuard { flag: &self.checking })
    }

    pub(crate) fn is_checking(&self) -> bool {
        self.checking.load(Ordering::Acquire)
    }

    pub(crate) fn status(&self) -> WatchStatus {
        self.entry.lock().status
    }

    pub(crate) fn snapshot(&self) -> WatchEntry {
        self.entry.lock().clone()
    }

    pub(crate) fn capture_handle(&self) -> Option<ProcessHandle> {
        self.capture.lock().clone()
    }
}

/// Releases the checking flag on drop.
pub(crate) struct CheckGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for CheckGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_guard_is_exclusive() {
        let slot = WatchSlot::new(WatchEntry::new("https://live.example.com/1", "One", 300));

        let guard = slot.try_begin_check().unwrap();
        assert!(slot.is_checking());
        assert!(slot.try_begin_check().is_none());

        drop(guard);
        assert!(!slot.is_checking());
        assert!(slot.try_begin_check().is_some());
    }
}
