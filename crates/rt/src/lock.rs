//! Cross-core mutual exclusion.
//!
//! [`FcLock`] lives on the FC and is only ever mutated there. Cluster cores
//! go through a [`RemoteLock`] handle: they build a request on their own
//! stack, hand its event to the FC through the cluster mailbox, and sleep
//! until the FC marks it done. Releasing a contended lock hands it directly
//! to the oldest waiter; `locked` stays set across the hand-off.
//!
//! Chips without an FC use [`TasLock`], a spin lock on the hardware
//! test-and-set.

use core::cell::Cell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};

use log::debug;

use crate::cluster::ClusterMailbox;
use crate::error::{RtError, RtResult};
use crate::event::Event;
use crate::list::{Fifo, Link, Linked};
use crate::notif::evt;
use crate::port::{CoreId, Port, TriggerAddr};
use crate::request::Request;
use crate::sched::Scheduler;
use crate::thread::Thread;
use crate::trace::records;

/// A pending lock or unlock request.
pub struct LockRequest {
    lock: Cell<usize>,
    next: Link<LockRequest>,
    request: Request<()>,
    req_lock: Cell<bool>,
    waker: Cell<Option<TriggerAddr>>,
}

impl Linked for LockRequest {
    fn link(&self) -> &Link<Self> {
        &self.next
    }
}

impl Default for LockRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl LockRequest {
    pub const fn new() -> Self {
        Self {
            lock: Cell::new(0),
            next: Cell::new(None),
            request: Request::new(),
            req_lock: Cell::new(true),
            waker: Cell::new(None),
        }
    }

    /// Event posted when the request is granted.
    pub fn event(&self) -> &Event {
        self.request.event()
    }

    pub fn is_done(&self) -> bool {
        self.request.is_done()
    }

    pub fn cid(&self) -> CoreId {
        self.request.cid()
    }

    pub(crate) fn prepare(
        &self,
        lock: usize,
        req_lock: bool,
        cid: CoreId,
        waker: Option<TriggerAddr>,
    ) {
        self.lock.set(lock);
        self.req_lock.set(req_lock);
        self.waker.set(waker);
        self.request.arm(cid);
    }
}

/// Lock owned by the FC.
pub struct FcLock {
    locked: Cell<bool>,
    waiting: Fifo<LockRequest>,
    fc_wait: Cell<Option<NonNull<Thread>>>,
}

impl Default for FcLock {
    fn default() -> Self {
        Self::new()
    }
}

impl FcLock {
    pub const fn new() -> Self {
        Self {
            locked: Cell::new(false),
            waiting: Fifo::new(),
            fc_wait: Cell::new(None),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked.get()
    }

    /// Requests queued behind the holder.
    pub fn waiters(&self) -> usize {
        critical_section::with(|_| self.waiting.len())
    }

    /// FC thread currently parked on the lock.
    pub fn parked_fc_thread(&self) -> Option<NonNull<Thread>> {
        self.fc_wait.get()
    }

    /// Handle for cluster cores.
    pub fn remote(&self) -> RemoteLock {
        RemoteLock {
            addr: self as *const Self as usize,
        }
    }

    pub fn try_lock(&self) -> bool {
        critical_section::with(|_| !self.locked.replace(true))
    }

    /// Takes the lock, blocking the running thread (or running the scheduler
    /// from the main context) behind earlier requesters.
    pub fn lock(&self, sched: &Scheduler) {
        let req = LockRequest::new();
        // SAFETY: `req` is not released before it has been granted.
        if unsafe { self.acquire_async(sched, &req) } {
            return;
        }
        if let Some(thread) = sched.current() {
            self.fc_wait.set(Some(NonNull::from(thread)));
        }
        req.request.wait(sched);
    }

    /// Queues `req` for the lock. Returns `true` when the lock was free and is
    /// now held; otherwise `req`'s event is posted once it is granted.
    ///
    /// # Safety
    ///
    /// `req` must stay valid and unmoved until it is granted and its event
    /// has run.
    pub unsafe fn acquire_async(&self, sched: &Scheduler, req: &LockRequest) -> bool {
        req.prepare(self as *const Self as usize, true, sched.core(), None);
        let granted = critical_section::with(|_| {
            if self.locked.replace(true) {
                self.waiting.push_back(req);
                false
            } else {
                true
            }
        });
        if granted {
            req.request.mark_done();
        }
        granted
    }

    /// Releases the lock, handing it to the oldest waiter if any.
    ///
    /// Releasing a lock that is not held is fatal.
    pub fn unlock(&self, sched: &Scheduler) -> RtResult<()> {
        if !self.locked.get() {
            sched.signal_error(None, RtError::LockNotHeld, self as *const Self as usize);
            return Err(RtError::LockNotHeld);
        }
        self.release(sched);
        Ok(())
    }

    fn release(&self, sched: &Scheduler) {
        let next = critical_section::with(|_| {
            let next = self.waiting.pop_front();
            if next.is_none() {
                self.locked.set(false);
            }
            next
        });
        if let Some(next) = next {
            // SAFETY: queued requests are valid until granted.
            let req = unsafe { next.as_ref() };
            debug!("lock {:#x}: hand-off to core {}", self as *const Self as usize, req.cid());
            sched.trace(records::LOCK_HANDOFF, self as *const Self as usize);
            self.grant(sched, req);
        }
    }

    fn grant(&self, sched: &Scheduler, req: &LockRequest) {
        match req.waker.get() {
            Some(waker) => {
                // The requester may release `req` as soon as it sees `done`.
                req.request.mark_done();
                sched.port().trigger(waker, evt::CLUSTER_CALL);
            }
            None => {
                if let Some(thread) = req.event().bound_thread() {
                    if self.fc_wait.get() == Some(thread) {
                        self.fc_wait.set(None);
                    }
                }
                // SAFETY: the local requester waits until the event has run.
                unsafe { req.request.complete(sched, ()) };
            }
        }
    }
}

/// Runs on the FC for every request pushed by a cluster.
pub(crate) fn serve_remote(event: &Event) {
    // SAFETY: the requester spins on `done` and keeps `req` alive until then.
    let req = unsafe { &*(event.arg() as *const LockRequest) };
    let lock = unsafe { &*(req.lock.get() as *const FcLock) };
    let Some(sched) = event.scheduler() else {
        return;
    };

    if req.req_lock.get() {
        let granted = critical_section::with(|_| {
            if lock.locked.replace(true) {
                unsafe { lock.waiting.push_back(req) };
                false
            } else {
                true
            }
        });
        if granted {
            lock.grant(sched, req);
        }
    } else {
        if lock.is_locked() {
            lock.release(sched);
        } else {
            sched.signal_error(None, RtError::LockNotHeld, lock as *const FcLock as usize);
        }
        lock.grant(sched, req);
    }
}

/// Cluster-side handle to an [`FcLock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteLock {
    addr: usize,
}

impl RemoteLock {
    pub fn addr(&self) -> usize {
        self.addr
    }

    /// Takes the lock from a cluster core.
    pub fn lock(&self, mailbox: &ClusterMailbox, port: &dyn Port) {
        self.request(mailbox, port, true);
    }

    /// Releases the lock from a cluster core.
    pub fn unlock(&self, mailbox: &ClusterMailbox, port: &dyn Port) {
        self.request(mailbox, port, false);
    }

    fn request(&self, mailbox: &ClusterMailbox, port: &dyn Port, req_lock: bool) {
        let req = LockRequest::new();
        req.prepare(self.addr, req_lock, port.core_id(), Some(mailbox.trig_addr()));
        req.event()
            .set_callback(serve_remote, &req as *const LockRequest as usize);

        // SAFETY: `req` stays on this stack until the FC marks it done, and
        // the FC does not touch it afterwards.
        unsafe { mailbox.push_to_fc(req.event(), port) };
        while !req.is_done() {
            port.wait_event(evt::CLUSTER_CALL);
        }
    }
}

/// Spin lock on the hardware test-and-set word.
#[derive(Debug, Default)]
pub struct TasLock {
    word: AtomicU32,
}

impl TasLock {
    pub const fn new() -> Self {
        Self {
            word: AtomicU32::new(0),
        }
    }

    pub fn try_lock(&self, port: &dyn Port) -> bool {
        port.test_and_set(&self.word) == 0
    }

    pub fn lock(&self, port: &dyn Port) {
        while !self.try_lock(port) {
            core::hint::spin_loop();
        }
    }

    pub fn unlock(&self) {
        self.word.store(0, Ordering::Release);
    }

    pub fn is_locked(&self) -> bool {
        self.word.load(Ordering::Acquire) != 0
    }
}
