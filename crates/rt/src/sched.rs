//! Per-core event scheduler and thread switching.
//!
//! A scheduler owns a FIFO of posted events. Posting is O(1) and safe from
//! interrupt handlers; running pops events in order and either calls their
//! callback or resumes the thread bound to them. Threads follow a
//! return-to-resumer model: a thread resumed from a context gives control
//! back to that same context when it blocks or finishes.

use core::cell::Cell;
use core::ptr::NonNull;

use log::{debug, error, trace, warn};

use crate::config::SchedulerConfig;
use crate::error::{RtError, RtResult};
use crate::event::{Callback, Event, Payload};
use crate::list::Fifo;
use crate::port::{Context, CoreId, Port, StackRegion};
use crate::thread::{Thread, ThreadEntry, ThreadQueue, ThreadState};
use crate::trace::{records, TraceHook};

/// How [`Scheduler::run`] treats an empty queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Return as soon as the queue is empty.
    Poll,
    /// Idle until at least one event has run, then drain the queue.
    Wait,
}

/// Error delivered to a scheduler's error callback.
#[derive(Debug)]
pub struct ErrorReport<'a> {
    /// Event the failed operation was attached to.
    pub event: Option<&'a Event>,
    pub error: RtError,
    /// Address of the offending object (copy, lock, ...).
    pub object: usize,
}

/// Error callback; receives the argument registered with it.
pub type ErrorCallback = fn(arg: usize, report: &ErrorReport<'_>);

/// Event scheduler for one core.
///
/// The scheduler must not move once events or threads reference it.
pub struct Scheduler {
    name: &'static str,
    core: CoreId,
    port: &'static dyn Port,
    queue: Fifo<Event>,
    free: Fifo<Event>,
    waiting: Cell<Option<NonNull<Thread>>>,
    error_handler: Cell<Option<(ErrorCallback, usize)>>,
    trace: Option<TraceHook>,
    current: Cell<Option<NonNull<Thread>>>,
    main: Context,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, port: &'static dyn Port) -> Self {
        Self {
            name: config.name,
            core: config.core,
            port,
            queue: Fifo::new(),
            free: Fifo::new(),
            waiting: Cell::new(None),
            error_handler: Cell::new(config.error_handler),
            trace: config.trace,
            current: Cell::new(None),
            main: Context::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn core(&self) -> CoreId {
        self.core
    }

    pub fn port(&self) -> &'static dyn Port {
        self.port
    }

    /// Thread currently running on this scheduler, `None` in the main context.
    pub fn current(&self) -> Option<&Thread> {
        // SAFETY: the current thread is alive while it runs.
        self.current.get().map(|t| unsafe { &*t.as_ptr() })
    }

    /// Number of events waiting to run.
    pub fn len(&self) -> usize {
        critical_section::with(|_| self.queue.len())
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn set_error_handler(&self, callback: ErrorCallback, arg: usize) {
        self.error_handler.set(Some((callback, arg)));
    }

    pub(crate) fn trace(&self, record: u8, object: usize) {
        if let Some(hook) = self.trace {
            hook(record, object);
        }
    }

    /// Makes `event` runnable.
    ///
    /// An event gated with [`Event::expect`] absorbs posts until its last
    /// source arrives. Safe to call from interrupt handlers of this core.
    ///
    /// # Safety
    ///
    /// `event` must stay valid and unmoved until it has run.
    pub unsafe fn post(&self, event: &Event) -> RtResult<()> {
        let me = NonNull::from(self);
        let queued = critical_section::with(|_| {
            if event.sched.get().is_some_and(|owner| owner != me) {
                return Err(RtError::WrongScheduler);
            }
            let pending = event.pending.get();
            if pending > 1 {
                event.pending.set(pending - 1);
                return Ok(false);
            }
            event.pending.set(0);
            if event.queued.get() {
                return Err(RtError::AlreadyQueued);
            }
            event.sched.set(Some(me));
            event.queued.set(true);
            self.queue.push_back(event);
            Ok(true)
        });

        match queued {
            Ok(true) => {
                trace!("{}: post {:#x}", self.name, event as *const Event as usize);
                self.trace(records::EVENT_POST, event as *const Event as usize);
                if let Some(idle) = self.waiting.take() {
                    if let Err(err) = self.wake(idle.as_ref()) {
                        let idle = idle.as_ptr() as usize;
                        warn!("{}: idle thread {:#x} not woken: {}", self.name, idle, err);
                    }
                }
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(err) => {
                warn!("{}: post {:#x} rejected: {}", self.name, event as *const Event as usize, err);
                Err(err)
            }
        }
    }

    /// Posts a callback using a spare event from the free list.
    pub fn post_callback(&self, callback: Callback, arg: usize, payload: Payload) -> RtResult<()> {
        let Some(slot) = critical_section::with(|_| self.free.pop_front()) else {
            self.signal_error(None, RtError::NoFreeEvent, self as *const Self as usize);
            return Err(RtError::NoFreeEvent);
        };
        // SAFETY: provisioned slots live as long as the scheduler.
        let event = unsafe { slot.as_ref() };
        event.set_callback(callback, arg);
        event.set_payload(payload);
        event.thread.set(None);
        event.pending.set(0);
        unsafe { self.post(event) }
    }

    /// Adds a spare event to the free list used by [`Scheduler::post_callback`].
    ///
    /// # Safety
    ///
    /// `event` must outlive the scheduler and must not be used elsewhere.
    pub unsafe fn provision(&self, event: &Event) {
        event.pooled.set(true);
        event.sched.set(Some(NonNull::from(self)));
        critical_section::with(|_| self.free.push_back(event));
    }

    pub fn free_slots(&self) -> usize {
        critical_section::with(|_| self.free.len())
    }

    /// Runs queued events in FIFO order and returns how many ran.
    pub fn run(&self, mode: RunMode) -> usize {
        let mut executed = 0;
        loop {
            let next = critical_section::with(|_| {
                let head = self.queue.pop_front();
                if let Some(event) = head {
                    // SAFETY: queued events are valid until they have run.
                    unsafe { event.as_ref() }.queued.set(false);
                }
                head
            });

            match next {
                Some(event) => {
                    unsafe { self.execute(event) };
                    executed += 1;
                }
                None if mode == RunMode::Wait && executed == 0 => self.port.wait_for_interrupt(),
                None => break,
            }
        }
        executed
    }

    /// # Safety
    ///
    /// `ptr` was just popped from the queue. It is not touched after its
    /// callback runs unless it belongs to the free list.
    unsafe fn execute(&self, ptr: NonNull<Event>) {
        let event = ptr.as_ref();
        let pooled = event.pooled.get();
        event.fired.set(event.fired.get().wrapping_add(1));
        self.trace(records::EVENT_RUN, ptr.as_ptr() as usize);

        if let Some(bound) = event.thread.get() {
            let thread = bound.as_ref();
            if !thread.event.is(event) {
                event.thread.set(None);
            }
            self.resume(thread);
        } else if let Some(callback) = event.callback() {
            callback(event);
        }

        if pooled && !event.queued.get() {
            critical_section::with(|_| self.free.push_back(event));
        }
    }

    /// Reports an error through the registered callback.
    ///
    /// A thread bound to `event` records the error as its last error. With no
    /// callback registered, fatal errors panic and the others are logged.
    pub fn signal_error(&self, event: Option<&Event>, error: RtError, object: usize) {
        self.trace(records::ERROR, object);
        if let Some(thread) = event.and_then(|e| e.thread.get()) {
            // SAFETY: a bound thread is alive while it waits on the event.
            unsafe { thread.as_ref() }.error.set(Some(error));
        }

        match self.error_handler.get() {
            Some((callback, arg)) => callback(arg, &ErrorReport { event, error, object }),
            None if error.is_fatal() => {
                panic!("{}: fatal error: {} (object {:#x})", self.name, error, object)
            }
            None => error!("{}: {} (object {:#x})", self.name, error, object),
        }
    }

    /// Prepares `thread` to run `entry(arg)` on `stack` and makes it ready.
    ///
    /// # Safety
    ///
    /// `thread` and `stack` must stay valid and unmoved until the thread has
    /// finished, and `thread` must not be running.
    pub unsafe fn spawn(
        &self,
        thread: &Thread,
        entry: ThreadEntry,
        arg: usize,
        stack: StackRegion,
    ) -> RtResult<()> {
        thread.reset(self, entry, arg);
        self.port
            .init_context(&thread.ctx, stack, thread_main, thread as *const Thread as usize)?;
        thread.state.set(ThreadState::Ready);
        thread.parked.set(true);
        debug!("{}: spawned thread {:#x}", self.name, thread as *const Thread as usize);
        self.post(&thread.event)
    }

    /// Suspends the running thread until `event` runs.
    ///
    /// From the main context this runs the scheduler until `event` has run.
    pub fn block_on(&self, event: &Event) {
        match self.current.get() {
            Some(ptr) => {
                // SAFETY: the current thread is alive while it runs.
                let thread = unsafe { ptr.as_ref() };
                event.thread.set(Some(ptr));
                self.suspend(thread);
            }
            None => {
                let fired = event.fired();
                while event.fired() == fired {
                    self.run(RunMode::Wait);
                }
            }
        }
    }

    /// Like [`Scheduler::block_on`], with the running thread linked in `queue`
    /// while it waits.
    pub fn block_in(&self, event: &Event, queue: &ThreadQueue) {
        if let Some(thread) = self.current() {
            // SAFETY: the thread stays linked only while it is suspended here.
            unsafe { queue.push(thread) };
            thread.wait_queue.set(Some(NonNull::from(queue)));
        }
        self.block_on(event);
        if let Some(thread) = self.current() {
            if thread.wait_queue.take().is_some() {
                queue.remove(thread);
            }
        }
    }

    /// Makes `thread` ready: unlinks it from its wait queue and posts its
    /// wake event. Waking an already woken thread is a no-op.
    pub fn wake(&self, thread: &Thread) -> RtResult<()> {
        if thread.sched.get() != Some(NonNull::from(self)) {
            return Err(RtError::WrongScheduler);
        }
        if let Some(queue) = thread.wait_queue.take() {
            // SAFETY: a wait queue outlives the threads blocked in it.
            unsafe { queue.as_ref() }.remove(thread);
        }
        if thread.finished.get() || thread.event.is_queued() {
            return Ok(());
        }
        thread.state.set(ThreadState::Ready);
        self.trace(records::THREAD_WAKE, thread as *const Thread as usize);
        // SAFETY: spawned threads outlive their wake event.
        unsafe { self.post(&thread.event) }
    }

    /// Waits for `thread` to finish and returns its status.
    pub fn join(&self, thread: &Thread) -> usize {
        while !thread.finished.get() {
            match self.current() {
                Some(me) if core::ptr::eq(me, thread) => break,
                Some(me) => self.block_in(&me.event, &thread.waiting),
                None => {
                    self.run(RunMode::Wait);
                }
            }
        }
        thread.status.get()
    }

    /// Parks the running thread until the next post. From the main context,
    /// idles the core until the queue is not empty.
    pub fn wait_for_work(&self) {
        match self.current() {
            Some(me) => {
                if !self.queue.is_empty() {
                    return;
                }
                self.waiting.set(Some(NonNull::from(me)));
                self.block_on(&me.event);
            }
            None => {
                while self.queue.is_empty() {
                    self.port.wait_for_interrupt();
                }
            }
        }
    }

    fn resume(&self, thread: &Thread) {
        if thread.finished.get() || !thread.parked.get() {
            return;
        }
        let previous = self.current.get();
        let from = match previous {
            // SAFETY: the current thread is alive while it runs.
            Some(t) => unsafe { &(*t.as_ptr()).ctx },
            None => &self.main,
        };
        thread.parked.set(false);
        thread.state.set(ThreadState::Ready);
        thread.resumer.set(Some(NonNull::from(from)));
        self.current.set(Some(NonNull::from(thread)));

        // SAFETY: `from` is the running context and `thread` was prepared by
        // `spawn` or saved by `suspend`.
        unsafe { self.port.switch(from, &thread.ctx) };

        self.current.set(previous);
    }

    fn suspend(&self, thread: &Thread) {
        let Some(resumer) = thread.resumer.get() else {
            return;
        };
        thread.state.set(ThreadState::Waiting);
        thread.parked.set(true);
        self.trace(records::THREAD_BLOCK, thread as *const Thread as usize);

        // SAFETY: the resumer is suspended in `resume` until we switch back.
        unsafe { self.port.switch(&thread.ctx, resumer.as_ref()) };
    }

    fn finish(&self, thread: &Thread, status: usize) {
        thread.status.set(status);
        thread.finished.set(true);
        thread.state.set(ThreadState::Other);
        debug!(
            "{}: thread {:#x} exited with {}",
            self.name, thread as *const Thread as usize, status
        );
        self.trace(records::THREAD_EXIT, thread as *const Thread as usize);

        while let Some(joiner) = thread.waiting.pop() {
            joiner.wait_queue.set(None);
            if let Some(sched) = joiner.scheduler() {
                if let Err(err) = sched.wake(joiner) {
                    warn!(
                        "{}: joiner {:#x} not woken: {}",
                        self.name, joiner as *const Thread as usize, err
                    );
                }
            }
        }

        if let Some(resumer) = thread.resumer.get() {
            // SAFETY: the resumer is suspended in `resume`; this context is
            // never switched to again.
            unsafe { self.port.exit(&thread.ctx, resumer.as_ref()) };
        }
    }
}

fn thread_main(arg: usize) {
    // SAFETY: `arg` is the thread handed to `spawn`, valid until it finishes.
    let thread = unsafe { &*(arg as *const Thread) };
    let status = match thread.entry.get() {
        Some(entry) => entry(thread.arg.get()),
        None => 0,
    };
    if let Some(sched) = thread.scheduler() {
        sched.finish(thread, status);
    }
}
