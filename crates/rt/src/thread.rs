//! Cooperative threads and thread wait queues.
//!
//! Threads are scheduled through their embedded wake event: a thread runs
//! when a scheduler executes an event bound to it, and gives the core back
//! when it blocks or finishes. See [`Scheduler::spawn`](crate::Scheduler::spawn).

use core::cell::Cell;
use core::ptr::NonNull;

use crate::error::RtError;
use crate::event::Event;
use crate::list::{Fifo, Link, Linked};
use crate::port::Context;
use crate::sched::Scheduler;

/// Thread body. The returned word becomes the join status.
pub type ThreadEntry = fn(usize) -> usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Ready,
    Waiting,
    /// Not spawned yet, or finished.
    Other,
}

#[cfg(feature = "defmt")]
impl defmt::Format for ThreadState {
    fn format(&self, fmt: defmt::Formatter) {
        match self {
            ThreadState::Ready => defmt::write!(fmt, "Ready"),
            ThreadState::Waiting => defmt::write!(fmt, "Waiting"),
            ThreadState::Other => defmt::write!(fmt, "Other"),
        }
    }
}

/// A cooperative thread. Storage, including its stack, is caller-owned.
pub struct Thread {
    pub(crate) ctx: Context,
    next: Link<Thread>,
    pub(crate) waiting: ThreadQueue,
    pub(crate) finished: Cell<bool>,
    pub(crate) status: Cell<usize>,
    pub(crate) event: Event,
    pub(crate) sched: Cell<Option<NonNull<Scheduler>>>,
    pub(crate) state: Cell<ThreadState>,
    pub(crate) error: Cell<Option<RtError>>,
    pub(crate) entry: Cell<Option<ThreadEntry>>,
    pub(crate) arg: Cell<usize>,
    pub(crate) wait_queue: Cell<Option<NonNull<ThreadQueue>>>,
    pub(crate) resumer: Cell<Option<NonNull<Context>>>,
    pub(crate) parked: Cell<bool>,
}

impl Linked for Thread {
    fn link(&self) -> &Link<Self> {
        &self.next
    }
}

impl Default for Thread {
    fn default() -> Self {
        Self::new()
    }
}

impl Thread {
    pub const fn new() -> Self {
        Self {
            ctx: Context::new(),
            next: Cell::new(None),
            waiting: ThreadQueue::new(),
            finished: Cell::new(false),
            status: Cell::new(0),
            event: Event::new(),
            sched: Cell::new(None),
            state: Cell::new(ThreadState::Other),
            error: Cell::new(None),
            entry: Cell::new(None),
            arg: Cell::new(0),
            wait_queue: Cell::new(None),
            resumer: Cell::new(None),
            parked: Cell::new(false),
        }
    }

    pub fn state(&self) -> ThreadState {
        self.state.get()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.get()
    }

    /// Join status; meaningful once finished.
    pub fn status(&self) -> usize {
        self.status.get()
    }

    /// Last error reported on an event this thread was blocked on.
    pub fn last_error(&self) -> Option<RtError> {
        self.error.get()
    }

    pub fn clear_error(&self) {
        self.error.set(None);
    }

    /// The embedded event that resumes this thread.
    pub fn wake_event(&self) -> &Event {
        &self.event
    }

    pub fn scheduler(&self) -> Option<&Scheduler> {
        // SAFETY: a scheduler outlives the threads spawned on it.
        self.sched.get().map(|s| unsafe { s.as_ref() })
    }

    pub(crate) fn reset(&self, sched: &Scheduler, entry: ThreadEntry, arg: usize) {
        self.finished.set(false);
        self.status.set(0);
        self.error.set(None);
        self.entry.set(Some(entry));
        self.arg.set(arg);
        self.wait_queue.set(None);
        self.resumer.set(None);
        self.sched.set(Some(NonNull::from(sched)));
        self.event.sched.set(Some(NonNull::from(sched)));
        self.event.thread.set(Some(NonNull::from(self)));
    }
}

/// FIFO of threads blocked on a common condition.
pub struct ThreadQueue {
    fifo: Fifo<Thread>,
}

impl Default for ThreadQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadQueue {
    pub const fn new() -> Self {
        Self { fifo: Fifo::new() }
    }

    /// Appends `thread`.
    ///
    /// # Safety
    ///
    /// `thread` must not be linked in another queue and must outlive its
    /// membership in this one.
    pub unsafe fn push(&self, thread: &Thread) {
        critical_section::with(|_| self.fifo.push_back(thread));
    }

    pub fn pop(&self) -> Option<&Thread> {
        // SAFETY: queued threads are valid until unlinked.
        critical_section::with(|_| self.fifo.pop_front()).map(|t| unsafe { &*t.as_ptr() })
    }

    pub fn remove(&self, thread: &Thread) -> bool {
        critical_section::with(|_| self.fifo.remove(thread))
    }

    pub fn first(&self) -> Option<&Thread> {
        self.fifo.first().map(|t| unsafe { &*t.as_ptr() })
    }

    pub fn len(&self) -> usize {
        critical_section::with(|_| self.fifo.len())
    }

    pub fn is_empty(&self) -> bool {
        self.fifo.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_is_fifo() {
        let (a, b, c) = (Thread::new(), Thread::new(), Thread::new());
        let queue = ThreadQueue::new();
        unsafe {
            queue.push(&a);
            queue.push(&b);
            queue.push(&c);
        }
        assert_eq!(queue.len(), 3);
        assert!(core::ptr::eq(queue.first().unwrap(), &a));

        assert!(queue.remove(&b));
        assert!(core::ptr::eq(queue.pop().unwrap(), &a));
        assert!(core::ptr::eq(queue.pop().unwrap(), &c));
        assert!(queue.pop().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn unspawned_thread() {
        let thread = Thread::new();
        assert_eq!(thread.state(), ThreadState::Other);
        assert!(!thread.is_finished());
        assert!(thread.scheduler().is_none());
        assert!(thread.last_error().is_none());
    }
}
