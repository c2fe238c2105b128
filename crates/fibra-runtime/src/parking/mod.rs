//! Thread parking
//!
//! One primitive serves two callers: idle workers of a scheduling group
//! share a parker, and a plain OS thread blocked in a fiber-aware primitive
//! gets a private one.
//!
//! An unpark is remembered as a single pending token, so an unpark that
//! races ahead of the matching park is never lost. Extra unparks collapse
//! into the one token.

use std::time::Duration;

pub trait Parking: Send + Sync {
    /// Block until unparked or `timeout` elapses.
    ///
    /// Returns `true` if a pending token was consumed. Callers must
    /// re-check their condition either way.
    fn park(&self, timeout: Option<Duration>) -> bool;

    /// Leave a token and wake one parked thread.
    fn unpark_one(&self);

    /// Leave a token and wake every parked thread.
    fn unpark_all(&self);

    /// Threads currently parked (hint, may be stale)
    fn parked_count(&self) -> usize;
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod futex_linux;
        pub use futex_linux::FutexParking as PlatformParking;
    } else {
        mod fallback;
        pub use fallback::FallbackParking as PlatformParking;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_park_timeout() {
        let parking = PlatformParking::new();
        let start = Instant::now();
        let woken = parking.park(Some(Duration::from_millis(50)));
        assert!(!woken);
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_unpark_before_park_is_kept() {
        let parking = PlatformParking::new();
        parking.unpark_one();
        let start = Instant::now();
        assert!(parking.park(Some(Duration::from_secs(10))));
        assert!(start.elapsed() < Duration::from_secs(1));
        // Token consumed
        assert!(!parking.park(Some(Duration::from_millis(10))));
    }

    #[test]
    fn test_unpark_one_wakes_parked_thread() {
        let parking = Arc::new(PlatformParking::new());
        let parking2 = Arc::clone(&parking);

        let handle = thread::spawn(move || {
            let start = Instant::now();
            while !parking2.park(Some(Duration::from_secs(10))) {}
            start.elapsed()
        });

        thread::sleep(Duration::from_millis(50));
        parking.unpark_one();
        assert!(handle.join().unwrap() < Duration::from_secs(5));
    }

    #[test]
    fn test_unpark_all() {
        let parking = Arc::new(PlatformParking::new());
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let p = Arc::clone(&parking);
                thread::spawn(move || {
                    p.park(Some(Duration::from_secs(10)));
                })
            })
            .collect();
        while parking.parked_count() < 3 {
            thread::sleep(Duration::from_millis(1));
        }
        let start = Instant::now();
        parking.unpark_all();
        for h in handles {
            h.join().unwrap();
        }
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
