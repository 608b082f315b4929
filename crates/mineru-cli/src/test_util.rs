//! Test-only helpers shared across `mineru-cli`'s unit test modules.

use std::sync::{Mutex, MutexGuard, OnceLock};

static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

/// Serialize tests that mutate process environment variables.
///
/// `std::env::set_var`/`remove_var` affect the whole process, so tests
/// running concurrently on the same `MINERU_DATABASE_URL` (etc.) would
/// otherwise race. Hold the returned guard for the duration of the test.
pub fn lock_env() -> MutexGuard<'static, ()> {
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
