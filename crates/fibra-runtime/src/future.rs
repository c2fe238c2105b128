//! Driving futures from fibers
//!
//! `block_on` polls a future on the caller's stack and suspends the caller
//! (fiber or thread) between polls. Wakers may fire from any thread,
//! including runtime-owned ones.

use std::future::Future;
use std::pin::{pin, Pin};
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};
use std::time::{Duration, Instant};

use crate::sync::{ConditionVariable, Mutex};

/// Wake flag shared between the poller and its waker
struct Signal {
    woken: Mutex<bool>,
    cv: ConditionVariable,
}

impl Signal {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            woken: Mutex::new(false),
            cv: ConditionVariable::new(),
        })
    }

    /// Wait for a wake, consuming it. Returns false on timeout.
    fn wait(&self, deadline: Option<Instant>) -> bool {
        let mut woken = self.woken.lock();
        match deadline {
            None => woken = self.cv.wait_while(woken, |w| !*w),
            Some(d) => {
                let (guard, res) = self.cv.wait_until_while(woken, d, |w| !*w);
                if res.timed_out() {
                    return false;
                }
                woken = guard;
            }
        }
        *woken = false;
        true
    }
}

impl Wake for Signal {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        let mut woken = self.woken.lock();
        if !*woken {
            *woken = true;
            self.cv.notify_one();
        }
    }
}

fn poll_until<F: Future + ?Sized>(
    mut fut: Pin<&mut F>,
    deadline: Option<Instant>,
) -> Option<F::Output> {
    let signal = Signal::new();
    let waker = Waker::from(Arc::clone(&signal));
    let mut cx = Context::from_waker(&waker);
    loop {
        if let Poll::Ready(v) = fut.as_mut().poll(&mut cx) {
            return Some(v);
        }
        if !signal.wait(deadline) {
            return None;
        }
    }
}

/// Run `fut` to completion, suspending the caller while it is pending.
pub fn block_on<F: Future>(fut: F) -> F::Output {
    let fut = pin!(fut);
    match poll_until(fut, None) {
        Some(v) => v,
        None => unreachable!("unbounded wait timed out"),
    }
}

/// Poll `fut` until it completes or `deadline` passes. On timeout the
/// future is left intact and can be polled again.
pub fn block_on_until<F: Future + Unpin>(fut: &mut F, deadline: Instant) -> Option<F::Output> {
    poll_until(Pin::new(fut), Some(deadline))
}

pub fn block_on_for<F: Future + Unpin>(fut: &mut F, timeout: Duration) -> Option<F::Output> {
    block_on_until(fut, Instant::now() + timeout)
}
