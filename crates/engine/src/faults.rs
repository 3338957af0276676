//! Test-only fault injection for the write and flush paths.

use anyhow::{bail, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Default)]
pub(crate) struct Faults {
    /// WAL appends still allowed; `None` means unlimited.
    appends_left: Mutex<Option<usize>>,
    fail_flushes: AtomicBool,
}

impl Faults {
    /// Lets `n` more WAL appends through, then fails every later one.
    pub(crate) fn fail_appends_after(&self, n: usize) {
        *self.appends_left.lock() = Some(n);
    }

    pub(crate) fn fail_flushes(&self, fail: bool) {
        self.fail_flushes.store(fail, Ordering::Release);
    }

    pub(crate) fn clear(&self) {
        *self.appends_left.lock() = None;
        self.fail_flushes(false);
    }

    pub(crate) fn before_append(&self) -> Result<()> {
        let mut left = self.appends_left.lock();
        match left.as_mut() {
            Some(0) => bail!("injected WAL append failure"),
            Some(n) => *n -= 1,
            None => {}
        }
        Ok(())
    }

    pub(crate) fn before_flush(&self) -> Result<()> {
        if self.fail_flushes.load(Ordering::Acquire) {
            bail!("injected flush failure");
        }
        Ok(())
    }
}
