//! Linux futex parking
//!
//! Futex word:
//! - 0 = no token
//! - 1 = token pending
//!
//! `park` registers in `parked` before inspecting the word and `unpark_*`
//! publishes the token before reading `parked` (both SeqCst), so at least
//! one side always sees the other.

use super::Parking;
use nix::errno::Errno;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

pub struct FutexParking {
    futex: AtomicU32,
    parked: AtomicUsize,
}

impl FutexParking {
    pub const fn new() -> Self {
        Self {
            futex: AtomicU32::new(0),
            parked: AtomicUsize::new(0),
        }
    }

    fn wake(&self, count: i32) {
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.futex.as_ptr(),
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                count,
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                0u32,
            );
        }
    }
}

impl Default for FutexParking {
    fn default() -> Self {
        Self::new()
    }
}

impl Parking for FutexParking {
    fn park(&self, timeout: Option<Duration>) -> bool {
        self.parked.fetch_add(1, Ordering::SeqCst);

        if self.futex.swap(0, Ordering::SeqCst) == 1 {
            self.parked.fetch_sub(1, Ordering::SeqCst);
            return true;
        }

        let timespec = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs().min(i64::MAX as u64) as libc::time_t,
            tv_nsec: d.subsec_nanos() as libc::c_long,
        });
        let timespec_ptr = match &timespec {
            Some(ts) => ts as *const libc::timespec,
            None => std::ptr::null(),
        };

        // Sleeps only while the word is still 0
        let ret = unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.futex.as_ptr(),
                libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                0u32,
                timespec_ptr,
                std::ptr::null::<u32>(),
                0u32,
            )
        };
        if ret != 0 {
            match Errno::last() {
                Errno::ETIMEDOUT | Errno::EAGAIN | Errno::EINTR => {}
                e => fibra_core::kwarn!("futex wait failed: {}", e),
            }
        }

        self.parked.fetch_sub(1, Ordering::SeqCst);
        self.futex.swap(0, Ordering::SeqCst) == 1
    }

    fn unpark_one(&self) {
        self.futex.store(1, Ordering::SeqCst);
        if self.parked.load(Ordering::SeqCst) > 0 {
            self.wake(1);
        }
    }

    fn unpark_all(&self) {
        self.futex.store(1, Ordering::SeqCst);
        if self.parked.load(Ordering::SeqCst) > 0 {
            self.wake(i32::MAX);
        }
    }

    fn parked_count(&self) -> usize {
        self.parked.load(Ordering::Relaxed)
    }
}
