//! Condvar parking for platforms without futex

use super::Parking;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

struct ParkState {
    token: bool,
    /// Bumped by `unpark_all` so every sleeper leaves, not just the one
    /// that takes the token
    epoch: u64,
}

pub struct FallbackParking {
    state: Mutex<ParkState>,
    condvar: Condvar,
    parked: AtomicUsize,
}

impl FallbackParking {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(ParkState { token: false, epoch: 0 }),
            condvar: Condvar::new(),
            parked: AtomicUsize::new(0),
        }
    }
}

impl Default for FallbackParking {
    fn default() -> Self {
        Self::new()
    }
}

impl Parking for FallbackParking {
    fn park(&self, timeout: Option<Duration>) -> bool {
        self.parked.fetch_add(1, Ordering::SeqCst);
        let deadline = timeout.map(|t| Instant::now() + t);

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let epoch = state.epoch;
        while !state.token && state.epoch == epoch {
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    state = self
                        .condvar
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(|e| e.into_inner())
                        .0;
                }
                None => {
                    state = self.condvar.wait(state).unwrap_or_else(|e| e.into_inner());
                }
            }
        }

        let consumed = std::mem::replace(&mut state.token, false);
        drop(state);
        self.parked.fetch_sub(1, Ordering::SeqCst);
        consumed
    }

    fn unpark_one(&self) {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).token = true;
        self.condvar.notify_one();
    }

    fn unpark_all(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.token = true;
            state.epoch = state.epoch.wrapping_add(1);
        }
        self.condvar.notify_all();
    }

    fn parked_count(&self) -> usize {
        self.parked.load(Ordering::Relaxed)
    }
}
