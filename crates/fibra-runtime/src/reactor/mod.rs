//! Reactor: readiness-driven I/O for fibers (Linux)
//!
//! One reactor per scheduling group, each on its own thread:
//!
//! ```text
//!  attach / kill / restart_*_in / run_in_loop
//!               │
//!               ▼  SegQueue<Task> + eventfd
//!        ┌─────────────┐   epoll_wait   ┌──────────────┐
//!        │ reactor loop│ ─────────────► │ Descriptor   │──► handler fiber
//!        └─────────────┘                └──────────────┘
//! ```
//!
//! The registry and every `epoll_ctl` call live on the reactor thread.
//! Other threads only queue tasks.

mod descriptor;
mod poller;

pub use descriptor::{CleanupReason, Descriptor, DescriptorHandler, EventAction, Interest};

use std::cell::Cell;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_queue::SegQueue;
use fibra_core::{kdebug, kerror, kprint, SchedError, SchedResult, SpinLock, WorkerError};

use crate::entity::FiberSpec;
use crate::group::{LaunchPolicy, SchedulingGroup};
use crate::runtime;
use crate::sync::Event;
use crate::tls;
use poller::{Poller, WAKE_TOKEN};

/// Upper bound on one `epoll_wait`
const LOOP_TIMEOUT_MS: i32 = 100;

type Reply = Arc<(SpinLock<Option<SchedResult<()>>>, Event)>;

enum Task {
    Run(Box<dyn FnOnce() + Send>),
    Register(Arc<Descriptor>, Reply),
    Detach(Arc<Descriptor>),
    Rearm(Arc<Descriptor>, Interest),
    Suppress(Arc<Descriptor>, Interest),
}

thread_local! {
    static LOOP_OF: Cell<*const Reactor> = const { Cell::new(ptr::null()) };
}

pub struct Reactor {
    group_index: usize,
    group: Weak<SchedulingGroup>,
    poller: Poller,
    tasks: SegQueue<Task>,
    registry: SpinLock<HashMap<u64, Arc<Descriptor>>>,
    stopping: AtomicBool,
    /// Set once the loop has exited and will pop no more tasks
    stopped: AtomicBool,
    max_events: usize,
}

fn token_of(desc: &Arc<Descriptor>) -> u64 {
    Arc::as_ptr(desc) as usize as u64
}

impl Reactor {
    pub(crate) fn start(
        group: &Arc<SchedulingGroup>,
        max_events: usize,
    ) -> SchedResult<(Arc<Reactor>, JoinHandle<()>)> {
        let reactor = Arc::new(Reactor {
            group_index: group.index(),
            group: Arc::downgrade(group),
            poller: Poller::new()?,
            tasks: SegQueue::new(),
            registry: SpinLock::new(HashMap::new()),
            stopping: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            max_events,
        });

        let name = format!("fibra-reactor-g{}", group.index());
        let tag = name.clone();
        let r = Arc::clone(&reactor);
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                kprint::set_thread_tag(tag);
                tls::set_home_group(r.group_index);
                LOOP_OF.with(|c| c.set(Arc::as_ptr(&r)));
                kdebug!("started");
                r.run();
                LOOP_OF.with(|c| c.set(ptr::null()));
                kdebug!("exiting");
                kprint::clear_thread_tag();
            })
            .map_err(|_| WorkerError::SpawnFailed(name))?;
        Ok((reactor, handle))
    }

    /// Reactor of the caller's nearest scheduling group.
    pub fn current() -> SchedResult<Arc<Reactor>> {
        runtime::nearest_group()?
            .reactor()
            .ok_or(SchedError::InvalidConfig("reactor disabled"))
    }

    pub fn for_group(index: usize) -> SchedResult<Arc<Reactor>> {
        runtime::group_by_index(index)
            .ok_or(SchedError::NoSuchGroup(index))?
            .reactor()
            .ok_or(SchedError::InvalidConfig("reactor disabled"))
    }

    #[inline]
    pub fn group(&self) -> usize {
        self.group_index
    }

    fn on_loop_thread(&self) -> bool {
        LOOP_OF.with(|c| ptr::eq(c.get(), self))
    }

    fn submit(&self, task: Task) {
        self.tasks.push(task);
        self.poller.notify();
    }

    /// Run `task` on the reactor thread.
    pub fn run_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Task::Run(Box::new(task)));
    }

    /// Register `desc` with this reactor. Waits until the reactor thread
    /// has armed it.
    pub fn attach(self: &Arc<Self>, desc: &Arc<Descriptor>) -> SchedResult<()> {
        if self.stopping.load(Ordering::Acquire) {
            return Err(SchedError::NotRunning);
        }
        if !desc.bind(self) {
            return Err(SchedError::AlreadyInitialized);
        }
        if self.on_loop_thread() {
            return self.register(desc);
        }
        let reply: Reply = Arc::new((SpinLock::new(None), Event::new()));
        self.submit(Task::Register(Arc::clone(desc), Arc::clone(&reply)));
        if self.stopped.load(Ordering::SeqCst) {
            // The loop is gone; whoever pops the task answers it
            self.fail_pending_tasks();
        }
        reply.1.wait();
        let result = reply.0.lock().take();
        result.unwrap_or(Err(SchedError::NotRunning))
    }

    pub(crate) fn detach(&self, desc: Arc<Descriptor>) {
        self.submit(Task::Detach(desc));
    }

    pub(crate) fn submit_rearm(&self, desc: Arc<Descriptor>, interest: Interest) {
        self.submit(Task::Rearm(desc, interest));
    }

    pub(crate) fn submit_suppress(&self, desc: Arc<Descriptor>, interest: Interest) {
        self.submit(Task::Suppress(desc, interest));
    }

    pub(crate) fn rearm_after(self: &Arc<Self>, desc: Arc<Descriptor>, interest: Interest, at: Instant) {
        let Some(group) = self.group.upgrade() else {
            return;
        };
        let reactor = Arc::clone(self);
        group
            .timers
            .add_internal(at, Box::new(move || reactor.submit_rearm(desc, interest)));
    }

    /// Start a detached fiber on this reactor's group.
    pub(crate) fn spawn<F>(&self, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(group) = self.group.upgrade() else {
            return false;
        };
        let spec = FiberSpec {
            body: Box::new(f),
            exit_barrier: None,
            local: false,
            exec_ctx: None,
        };
        group.start(spec, LaunchPolicy::Post).is_ok()
    }

    /// Descriptors currently registered.
    pub fn attached(&self) -> usize {
        self.registry.lock().len()
    }

    pub(crate) fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        self.poller.notify();
    }

    // Loop thread only below

    fn register(&self, desc: &Arc<Descriptor>) -> SchedResult<()> {
        if desc.is_killed() {
            return Err(SchedError::NotRunning);
        }
        let token = token_of(desc);
        self.poller.add(desc.fd(), desc.armed().to_epoll(), token)?;
        self.registry.lock().insert(token, Arc::clone(desc));
        Ok(())
    }

    fn run(&self) {
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; self.max_events.max(1)];
        loop {
            self.run_tasks();
            if self.stopping.load(Ordering::Acquire) {
                break;
            }
            let n = match self.poller.wait(&mut events, LOOP_TIMEOUT_MS) {
                Ok(n) => n,
                Err(e) => {
                    kerror!("epoll_wait failed: {}", e);
                    self.stopping.store(true, Ordering::Release);
                    break;
                }
            };
            for ev in &events[..n] {
                let token = ev.u64;
                let flags = ev.events;
                if token == WAKE_TOKEN {
                    self.poller.drain_wakeup();
                    continue;
                }
                let desc = self.registry.lock().get(&token).cloned();
                if let Some(desc) = desc {
                    desc.fire(flags);
                }
            }
        }
        self.release_all();
    }

    fn run_tasks(&self) {
        while let Some(task) = self.tasks.pop() {
            match task {
                Task::Run(f) => {
                    if panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
                        kerror!("reactor task panicked");
                    }
                }
                Task::Register(desc, reply) => {
                    let result = self.register(&desc);
                    *reply.0.lock() = Some(result);
                    reply.1.set();
                }
                Task::Detach(desc) => {
                    let token = token_of(&desc);
                    if self.registry.lock().remove(&token).is_some() {
                        if let Err(e) = self.poller.delete(desc.fd()) {
                            kdebug!("{}: epoll delete failed: {}", desc.name(), e);
                        }
                    }
                    desc.mark_disabled();
                }
                Task::Rearm(desc, interest) => {
                    let armed = desc.set_armed(interest, Interest::NONE);
                    self.update(&desc, armed);
                }
                Task::Suppress(desc, interest) => {
                    let armed = desc.set_armed(Interest::NONE, interest);
                    self.update(&desc, armed);
                    desc.clear_suppressed(interest);
                }
            }
        }
    }

    fn update(&self, desc: &Arc<Descriptor>, armed: Interest) {
        let token = token_of(desc);
        if desc.is_disabled() || !self.registry.lock().contains_key(&token) {
            return;
        }
        if let Err(e) = self.poller.modify(desc.fd(), armed.to_epoll(), token) {
            kerror!("{}: epoll modify failed: {}", desc.name(), e);
        }
    }

    /// Drop registrations and queued work left at shutdown.
    fn release_all(&self) {
        let left: Vec<_> = self.registry.lock().drain().map(|(_, d)| d).collect();
        if !left.is_empty() {
            kdebug!("{} descriptors still attached at shutdown", left.len());
        }
        for desc in &left {
            let _ = self.poller.delete(desc.fd());
        }
        self.stopped.store(true, Ordering::SeqCst);
        self.fail_pending_tasks();
    }

    /// Drop queued tasks, answering registrations with `NotRunning`.
    fn fail_pending_tasks(&self) {
        while let Some(task) = self.tasks.pop() {
            if let Task::Register(_, reply) = task {
                *reply.0.lock() = Some(Err(SchedError::NotRunning));
                reply.1.set();
            }
        }
    }
}
