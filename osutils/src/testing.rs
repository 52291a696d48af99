//! Helpers for tests that drive the global mockup. The mockup store is
//! process-wide, so playback tests must not run concurrently.

use std::sync::{Mutex, MutexGuard};

use lazy_static::lazy_static;

lazy_static! {
    static ref PLAYBACK: Mutex<()> = Mutex::new(());
}

/// Serialize tests that change the mockup mode or contents. Hold the guard
/// for the whole test.
pub fn playback_lock() -> MutexGuard<'static, ()> {
    PLAYBACK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
