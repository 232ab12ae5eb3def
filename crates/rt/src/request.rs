//! Blocking wrappers over event-driven operations.
//!
//! Every asynchronous operation takes an event. Its blocking form embeds
//! that event in a [`Request`], starts the operation, and waits until the
//! request is done and its event has left every queue, so the stack frame
//! holding the request can be released safely.

use core::cell::Cell;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::event::Event;
use crate::port::{CoreId, FC_CORE_ID};
use crate::sched::Scheduler;

/// A completion slot with an embedded event.
pub struct Request<T: Copy> {
    event: Event,
    done: AtomicBool,
    cid: Cell<CoreId>,
    result: Cell<Option<T>>,
}

/// Request used by blocking I/O operations with no result.
pub type IoWaitRequest = Request<()>;

impl<T: Copy> Default for Request<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy> Request<T> {
    pub const fn new() -> Self {
        Self {
            event: Event::new(),
            done: AtomicBool::new(false),
            cid: Cell::new(FC_CORE_ID),
            result: Cell::new(None),
        }
    }

    /// Resets the request before it is handed to an operation issued by `cid`.
    pub fn arm(&self, cid: CoreId) {
        self.done.store(false, Ordering::Relaxed);
        self.result.set(None);
        self.cid.set(cid);
    }

    /// Records `result`, marks the request done and posts its event.
    ///
    /// # Safety
    ///
    /// The request must stay valid until its event has run; [`Request::wait`]
    /// guarantees this for the waiting side.
    pub unsafe fn complete(&self, sched: &Scheduler, result: T) {
        self.result.set(Some(result));
        self.done.store(true, Ordering::Release);
        if let Err(err) = sched.post(&self.event) {
            log::warn!("request {:#x}: completion not posted: {}", self as *const Self as usize, err);
        }
    }

    /// Blocks until the request is done and its event is no longer queued.
    pub fn wait(&self, sched: &Scheduler) -> Option<T> {
        while !self.is_done() || self.event.is_queued() {
            sched.block_on(&self.event);
        }
        self.result.get()
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub fn cid(&self) -> CoreId {
        self.cid.get()
    }

    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn result(&self) -> Option<T> {
        self.result.get()
    }

    pub(crate) fn mark_done(&self) {
        self.done.store(true, Ordering::Release);
    }
}
