//! Test harness
//!
//! All runtime-backed unit tests share one process-wide runtime, started
//! on first use and never shut down.

use std::sync::Once;
use std::time::Duration;

use crate::config::RuntimeConfig;
use crate::runtime;

static START: Once = Once::new();

pub(crate) fn ensure_runtime() {
    START.call_once(|| {
        let config = RuntimeConfig::new()
            .scheduling_groups(2)
            .workers_per_group(2)
            .stack_size(256 * 1024)
            .max_fibers(64 * 1024)
            .park_timeout(Duration::from_millis(10))
            .timer_max_sleep(Duration::from_millis(10));
        if let Err(e) = runtime::start(config) {
            panic!("test runtime failed to start: {}", e);
        }
    });
}

/// Run `f` in a fiber of the shared runtime and wait for it. Panics in
/// `f` fail the calling test.
pub(crate) fn run_as_fiber<F, R>(f: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    ensure_runtime();
    match runtime::run_on_fiber(f) {
        Ok(value) => value,
        Err(e) => panic!("could not start test fiber: {}", e),
    }
}
