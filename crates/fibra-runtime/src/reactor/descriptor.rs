//! Reactor-driven descriptors
//!
//! A `Descriptor` wraps a non-blocking fd and the handler that services
//! it. Readiness is edge-triggered and counted per direction: the event
//! that takes a counter from 0 to 1 starts a fiber which keeps calling the
//! handler until the counter drains; events arriving meanwhile only bump
//! the counter and are folded into the running fiber.
//!
//! # Teardown
//!
//! `kill` records a reason exactly once. The reactor thread then removes
//! the registration and marks the descriptor disabled. Once disabled, no
//! new events are counted, so when the read, write and error counters
//! have all drained `on_cleanup` runs exactly once, in a fiber, and
//! `wait_for_cleanup` returns.

use std::fmt;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use fibra_core::{kdebug, kwarn};

use crate::reactor::Reactor;
use crate::sync::Event;

/// Readiness a descriptor is armed for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u8);

impl Interest {
    pub const READ: Interest = Interest(0b01);
    pub const WRITE: Interest = Interest(0b10);
    pub const READ_WRITE: Interest = Interest(0b11);
    pub(crate) const NONE: Interest = Interest(0);

    #[inline]
    pub fn is_readable(self) -> bool {
        self.0 & Self::READ.0 != 0
    }

    #[inline]
    pub fn is_writable(self) -> bool {
        self.0 & Self::WRITE.0 != 0
    }

    fn bits(self) -> u8 {
        self.0
    }

    pub(crate) fn to_epoll(self) -> u32 {
        let mut events = (libc::EPOLLET | libc::EPOLLRDHUP) as u32;
        if self.is_readable() {
            events |= libc::EPOLLIN as u32;
        }
        if self.is_writable() {
            events |= libc::EPOLLOUT as u32;
        }
        events
    }
}

/// What a handler wants after servicing an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    /// Keep the interest armed
    Ready,
    /// Disarm this direction until `restart_read_in`/`restart_write_in`
    Suppress,
    /// The descriptor has been killed; stop servicing it
    Leaving,
}

/// Why a descriptor is being torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CleanupReason {
    /// Peer closed the connection
    Disconnect = 1,
    /// Owner asked for it
    UserInitiated = 2,
    /// Socket error reported by the poller
    Error = 3,
    /// Idle or handshake deadline passed
    Timeout = 4,
    /// Runtime is stopping
    Shutdown = 5,
}

impl CleanupReason {
    fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => CleanupReason::Disconnect,
            2 => CleanupReason::UserInitiated,
            3 => CleanupReason::Error,
            4 => CleanupReason::Timeout,
            5 => CleanupReason::Shutdown,
            _ => return None,
        })
    }
}

/// Callbacks of a reactor-driven descriptor. Each runs in a fiber.
pub trait DescriptorHandler: Send + Sync + 'static {
    /// The fd became readable (or the peer hung up). Read until
    /// `EAGAIN` before returning `Ready`; edge-triggered readiness does
    /// not repeat.
    fn on_readable(&self, desc: &Arc<Descriptor>) -> EventAction;

    fn on_writable(&self, desc: &Arc<Descriptor>) -> EventAction {
        let _ = desc;
        EventAction::Suppress
    }

    /// The poller reported an error condition. The descriptor is killed
    /// with `CleanupReason::Error` afterwards.
    fn on_error(&self, desc: &Arc<Descriptor>, errno: i32) {
        let _ = (desc, errno);
    }

    /// Last callback. Runs once all other callbacks have returned.
    fn on_cleanup(&self, desc: &Arc<Descriptor>, reason: CleanupReason);
}

pub struct Descriptor {
    fd: OwnedFd,
    name: String,
    handler: Box<dyn DescriptorHandler>,
    reactor: OnceLock<Arc<Reactor>>,
    /// Directions currently armed in the poller
    armed: AtomicU8,
    read_events: AtomicUsize,
    write_events: AtomicUsize,
    error_events: AtomicUsize,
    /// 0 until `kill`
    cleanup_reason: AtomicU8,
    /// Registration removed; no further events will be counted
    disabled: AtomicBool,
    cleanup_started: AtomicBool,
    cleanup_done: Event,
}

#[derive(Clone, Copy)]
enum Direction {
    Read,
    Write,
}

impl Descriptor {
    pub fn new<H>(fd: OwnedFd, interest: Interest, name: impl Into<String>, handler: H) -> Arc<Self>
    where
        H: DescriptorHandler,
    {
        Arc::new(Self {
            fd,
            name: name.into(),
            handler: Box::new(handler),
            reactor: OnceLock::new(),
            armed: AtomicU8::new(interest.bits()),
            read_events: AtomicUsize::new(0),
            write_events: AtomicUsize::new(0),
            error_events: AtomicUsize::new(0),
            cleanup_reason: AtomicU8::new(0),
            disabled: AtomicBool::new(false),
            cleanup_started: AtomicBool::new(false),
            cleanup_done: Event::new(),
        })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn reactor(&self) -> Option<&Arc<Reactor>> {
        self.reactor.get()
    }

    pub(crate) fn bind(&self, reactor: &Arc<Reactor>) -> bool {
        self.reactor.set(Arc::clone(reactor)).is_ok()
    }

    pub(crate) fn armed(&self) -> Interest {
        Interest(self.armed.load(Ordering::Acquire))
    }

    pub fn cleanup_reason(&self) -> Option<CleanupReason> {
        CleanupReason::from_u8(self.cleanup_reason.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_killed(&self) -> bool {
        self.cleanup_reason.load(Ordering::Acquire) != 0
    }

    /// Start tearing the descriptor down. Only the first call has any
    /// effect; returns whether this call was it.
    pub fn kill(self: &Arc<Self>, reason: CleanupReason) -> bool {
        if self
            .cleanup_reason
            .compare_exchange(0, reason as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        kdebug!("{} killed: {:?}", self.name, reason);
        match self.reactor.get() {
            Some(reactor) => reactor.detach(Arc::clone(self)),
            // Never attached: nothing can be in flight
            None => {
                self.disabled.store(true, Ordering::Release);
                self.check_cleanup();
            }
        }
        true
    }

    /// Block until `on_cleanup` has returned. May be called before or after
    /// `kill`.
    pub fn wait_for_cleanup(&self) {
        self.cleanup_done.wait();
    }

    pub fn wait_for_cleanup_until(&self, deadline: Instant) -> bool {
        self.cleanup_done.wait_until(deadline)
    }

    /// Re-arm read interest after a `Suppress`, now or after `delay`.
    pub fn restart_read_in(self: &Arc<Self>, delay: Duration) {
        self.restart_in(Interest::READ, delay);
    }

    pub fn restart_write_in(self: &Arc<Self>, delay: Duration) {
        self.restart_in(Interest::WRITE, delay);
    }

    fn restart_in(self: &Arc<Self>, interest: Interest, delay: Duration) {
        let Some(reactor) = self.reactor.get() else {
            return;
        };
        let desc = Arc::clone(self);
        if delay.is_zero() {
            reactor.submit_rearm(desc, interest);
        } else {
            reactor.rearm_after(desc, interest, Instant::now() + delay);
        }
    }

    // Reactor-thread side

    /// Update the armed set. Returns the new set.
    pub(crate) fn set_armed(&self, add: Interest, remove: Interest) -> Interest {
        let mut cur = self.armed.load(Ordering::Acquire);
        loop {
            let next = (cur | add.bits()) & !remove.bits();
            match self
                .armed
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Interest(next),
                Err(actual) => cur = actual,
            }
        }
    }

    pub(crate) fn mark_disabled(self: &Arc<Self>) {
        self.disabled.store(true, Ordering::Release);
        self.check_cleanup();
    }

    #[inline]
    pub(crate) fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    /// Suppress finished on the loop: drop whatever was counted meanwhile.
    pub(crate) fn clear_suppressed(self: &Arc<Self>, interest: Interest) {
        if interest.is_readable() {
            self.read_events.store(0, Ordering::Release);
        }
        if interest.is_writable() {
            self.write_events.store(0, Ordering::Release);
        }
        self.check_cleanup();
    }

    /// Translate one poller event. Runs on the reactor thread only.
    pub(crate) fn fire(self: &Arc<Self>, events: u32) {
        if self.is_disabled() {
            return;
        }
        let err = libc::EPOLLERR as u32;
        let readable = (libc::EPOLLIN | libc::EPOLLHUP | libc::EPOLLRDHUP) as u32;
        let writable = libc::EPOLLOUT as u32;

        if events & err != 0 {
            self.fire_error();
            return;
        }
        if events & readable != 0 {
            self.fire_direction(Direction::Read);
        }
        if events & writable != 0 {
            self.fire_direction(Direction::Write);
        }
    }

    fn counter(&self, dir: Direction) -> &AtomicUsize {
        match dir {
            Direction::Read => &self.read_events,
            Direction::Write => &self.write_events,
        }
    }

    fn fire_direction(self: &Arc<Self>, dir: Direction) {
        if self.counter(dir).fetch_add(1, Ordering::AcqRel) != 0 {
            // Folded into the fiber already draining this direction
            return;
        }
        let desc = Arc::clone(self);
        if !self.spawn(move || desc.drain(dir)) {
            self.counter(dir).store(0, Ordering::Release);
            self.check_cleanup();
        }
    }

    fn drain(self: &Arc<Self>, dir: Direction) {
        let counter = self.counter(dir);
        let mut pending = counter.load(Ordering::Acquire);
        loop {
            if self.is_killed() {
                counter.store(0, Ordering::Release);
                break;
            }
            let action = match dir {
                Direction::Read => self.handler.on_readable(self),
                Direction::Write => self.handler.on_writable(self),
            };
            match action {
                EventAction::Ready => {}
                EventAction::Suppress => {
                    let interest = match dir {
                        Direction::Read => Interest::READ,
                        Direction::Write => Interest::WRITE,
                    };
                    if let Some(reactor) = self.reactor.get() {
                        // The loop clears the counter once the interest is off
                        reactor.submit_suppress(Arc::clone(self), interest);
                        return;
                    }
                    counter.store(0, Ordering::Release);
                    break;
                }
                EventAction::Leaving => {
                    debug_assert!(self.is_killed(), "handler left a descriptor that was not killed");
                    counter.store(0, Ordering::Release);
                    break;
                }
            }
            let left = counter.fetch_sub(pending, Ordering::AcqRel) - pending;
            if left == 0 {
                break;
            }
            pending = left;
        }
        self.check_cleanup();
    }

    fn fire_error(self: &Arc<Self>) {
        if self.error_events.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        let errno = socket_error(self.fd());
        let desc = Arc::clone(self);
        let started = self.spawn(move || {
            desc.handler.on_error(&desc, errno);
            desc.kill(CleanupReason::Error);
            desc.error_events.store(0, Ordering::Release);
            desc.check_cleanup();
        });
        if !started {
            self.kill(CleanupReason::Error);
            self.error_events.store(0, Ordering::Release);
            self.check_cleanup();
        }
    }

    fn check_cleanup(self: &Arc<Self>) {
        if !self.is_disabled()
            || self.read_events.load(Ordering::Acquire) != 0
            || self.write_events.load(Ordering::Acquire) != 0
            || self.error_events.load(Ordering::Acquire) != 0
        {
            return;
        }
        if self.cleanup_started.swap(true, Ordering::AcqRel) {
            return;
        }
        let desc = Arc::clone(self);
        if !self.spawn(move || desc.run_cleanup()) {
            kwarn!("{}: running cleanup inline", self.name);
            self.run_cleanup();
        }
    }

    fn run_cleanup(self: &Arc<Self>) {
        let reason = self.cleanup_reason().unwrap_or(CleanupReason::UserInitiated);
        self.handler.on_cleanup(self, reason);
        self.cleanup_done.set();
    }

    fn spawn<F>(&self, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let started = match self.reactor.get() {
            Some(reactor) => reactor.spawn(f),
            None => crate::runtime::start_fiber_detached(f),
        };
        if !started {
            kwarn!("{}: could not start handler fiber", self.name);
        }
        started
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("name", &self.name)
            .field("fd", &self.fd())
            .field("armed", &self.armed())
            .field("cleanup_reason", &self.cleanup_reason())
            .finish()
    }
}

fn socket_error(fd: RawFd) -> i32 {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if ret < 0 {
        nix::errno::Errno::last() as i32
    } else {
        err
    }
}
