//! Events: deferred callbacks and thread wake-ups.

use core::cell::Cell;
use core::fmt;
use core::ptr::{self, NonNull};

use crate::list::{Link, Linked};
use crate::periph::PeriphCopy;
use crate::sched::Scheduler;
use crate::thread::Thread;

/// Function run when an unbound event is executed.
pub type Callback = fn(&Event);

/// Request forwarded to a debug bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BridgeRequest {
    pub id: u32,
    pub args: [u32; 3],
}

/// Data carried by an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Payload {
    #[default]
    Empty,
    /// The peripheral copy whose completion this event reports.
    Copy(NonNull<PeriphCopy>),
    Data([u32; 3]),
    Time(u32),
    Bridge(BridgeRequest),
}

/// A unit of deferred work.
///
/// Storage is always owned by the caller. An event sits in at most one queue
/// at a time and must not move while queued.
pub struct Event {
    callback: Cell<Option<Callback>>,
    arg: Cell<usize>,
    pub(crate) next: Link<Event>,
    pub(crate) sched: Cell<Option<NonNull<Scheduler>>>,
    pub(crate) thread: Cell<Option<NonNull<Thread>>>,
    pub(crate) pending: Cell<u32>,
    payload: Cell<Payload>,
    pub(crate) queued: Cell<bool>,
    pub(crate) pooled: Cell<bool>,
    pub(crate) fired: Cell<u32>,
}

impl Linked for Event {
    fn link(&self) -> &Link<Self> {
        &self.next
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("arg", &self.arg.get())
            .field("pending", &self.pending.get())
            .field("queued", &self.queued.get())
            .field("fired", &self.fired.get())
            .field("payload", &self.payload.get())
            .finish()
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

impl Event {
    pub const fn new() -> Self {
        Self {
            callback: Cell::new(None),
            arg: Cell::new(0),
            next: Cell::new(None),
            sched: Cell::new(None),
            thread: Cell::new(None),
            pending: Cell::new(0),
            payload: Cell::new(Payload::Empty),
            queued: Cell::new(false),
            pooled: Cell::new(false),
            fired: Cell::new(0),
        }
    }

    pub const fn with_callback(callback: Callback, arg: usize) -> Self {
        Self {
            callback: Cell::new(Some(callback)),
            arg: Cell::new(arg),
            ..Self::new()
        }
    }

    pub fn set_callback(&self, callback: Callback, arg: usize) {
        self.callback.set(Some(callback));
        self.arg.set(arg);
    }

    pub fn callback(&self) -> Option<Callback> {
        self.callback.get()
    }

    pub fn arg(&self) -> usize {
        self.arg.get()
    }

    /// Gates the event on `sources` posts: the first `sources - 1` posts are
    /// absorbed and the last one enqueues it.
    pub fn expect(&self, sources: u32) {
        self.pending.set(sources);
    }

    pub fn pending(&self) -> u32 {
        self.pending.get()
    }

    pub fn payload(&self) -> Payload {
        self.payload.get()
    }

    pub fn set_payload(&self, payload: Payload) {
        self.payload.set(payload);
    }

    /// The data words, or zeros when the payload holds something else.
    pub fn data(&self) -> [u32; 3] {
        match self.payload.get() {
            Payload::Data(words) => words,
            _ => [0; 3],
        }
    }

    pub fn time(&self) -> Option<u32> {
        match self.payload.get() {
            Payload::Time(t) => Some(t),
            _ => None,
        }
    }

    pub fn is_queued(&self) -> bool {
        self.queued.get()
    }

    /// Number of times the event has been executed.
    pub fn fired(&self) -> u32 {
        self.fired.get()
    }

    /// The thread this event resumes when it runs, if any.
    pub fn bound_thread(&self) -> Option<NonNull<Thread>> {
        self.thread.get()
    }

    pub fn owner_is(&self, sched: &Scheduler) -> bool {
        self.sched.get() == Some(NonNull::from(sched))
    }

    /// Scheduler the event was first posted to.
    pub fn scheduler(&self) -> Option<&Scheduler> {
        // SAFETY: a scheduler outlives every event posted to it.
        self.sched.get().map(|s| unsafe { s.as_ref() })
    }

    pub(crate) fn is(&self, other: &Event) -> bool {
        ptr::eq(self, other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nop(_: &Event) {}

    #[test]
    fn fresh_event_is_idle() {
        let event = Event::with_callback(nop, 7);
        assert_eq!(event.arg(), 7);
        assert!(!event.is_queued());
        assert_eq!(event.fired(), 0);
        assert!(event.bound_thread().is_none());
        assert!(event.scheduler().is_none());
    }

    #[test]
    fn payload_accessors() {
        let event = Event::new();
        assert_eq!(event.data(), [0; 3]);
        event.set_payload(Payload::Data([1, 2, 3]));
        assert_eq!(event.data(), [1, 2, 3]);
        assert_eq!(event.time(), None);
        event.set_payload(Payload::Time(42));
        assert_eq!(event.time(), Some(42));
    }
}
