//! FC to cluster call dispatch and the cluster to FC return path.
//!
//! The FC pushes call descriptors into a small ring and raises `DISPATCH` on
//! the cluster. The cluster runs each call across its PEs, then hands the
//! call's completion event back through a single remote slot: it publishes
//! the event address, raises `FC_ENQUEUE` on the FC, and the FC moves the
//! event into its own scheduler before signalling `CLUSTER_CALL` so the slot
//! can be reused.

use core::cell::Cell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use heapless::mpmc::MpMcQueue;
use log::{debug, trace, warn};

use crate::config::ClusterConfig;
use crate::error::{RtError, RtResult};
use crate::event::Event;
use crate::notif::evt;
use crate::port::{CoreId, Port, StackRegion, TriggerAddr};
use crate::sched::Scheduler;
use crate::trace::records;

/// Depth of the call ring.
pub const CALL_RING: usize = 4;

/// Function run on every PE taking part in a call.
pub type ClusterEntry = fn(&PeContext);

/// What a PE sees of the call it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeContext {
    pub cid: CoreId,
    pub pe: u32,
    pub nb_pe: u32,
    pub arg: usize,
    pub stack: StackRegion,
}

/// A call descriptor. Storage is caller-owned and must stay valid until the
/// completion event has run.
pub struct ClusterCall {
    entry: ClusterEntry,
    arg: usize,
    config: ClusterConfig,
    stacks: Cell<StackRegion>,
    event: Event,
    ext_event: Cell<Option<NonNull<Event>>>,
}

impl ClusterCall {
    pub const fn new(entry: ClusterEntry, arg: usize, config: ClusterConfig) -> Self {
        Self {
            entry,
            arg,
            config,
            stacks: Cell::new(StackRegion::new(0, 0)),
            event: Event::new(),
            ext_event: Cell::new(None),
        }
    }

    pub fn config(&self) -> ClusterConfig {
        self.config
    }

    /// Stack memory for all PEs: the master stack first, then one slave stack
    /// per remaining PE.
    pub fn set_stacks(&self, stacks: StackRegion) {
        self.stacks.set(stacks);
    }

    /// Posts `event` on completion instead of the embedded one.
    ///
    /// # Safety
    ///
    /// `event` must stay valid until it has run after the call completes.
    pub unsafe fn set_event(&self, event: &Event) {
        self.ext_event.set(Some(NonNull::from(event)));
    }

    pub fn completion_event(&self) -> &Event {
        match self.ext_event.get() {
            // SAFETY: guaranteed by `set_event`.
            Some(event) => unsafe { &*event.as_ptr() },
            None => &self.event,
        }
    }

    pub fn stack_for(&self, pe: u32) -> StackRegion {
        carve_stack(self.stacks.get(), self.config, pe)
    }
}

fn carve_stack(stacks: StackRegion, config: ClusterConfig, pe: u32) -> StackRegion {
    if pe == 0 {
        return StackRegion::new(stacks.base, config.master_stack_size);
    }
    let offset = config.master_stack_size + (pe as usize - 1) * config.slave_stack_size;
    StackRegion::new(stacks.base + offset, config.slave_stack_size)
}

/// Shared FC/cluster state for one cluster.
pub struct ClusterMailbox {
    cid: CoreId,
    mount_count: AtomicU32,
    call_head: AtomicU32,
    pending: AtomicU32,
    calls: MpMcQueue<usize, CALL_RING>,
    call_stacks: StackRegion,
    trig_addr: TriggerAddr,
    fc_trig_addr: TriggerAddr,
    remote: AtomicUsize,
}

impl ClusterMailbox {
    pub const fn new(
        cid: CoreId,
        trig_addr: TriggerAddr,
        fc_trig_addr: TriggerAddr,
        call_stacks: StackRegion,
    ) -> Self {
        Self {
            cid,
            mount_count: AtomicU32::new(0),
            call_head: AtomicU32::new(0),
            pending: AtomicU32::new(0),
            calls: MpMcQueue::new(),
            call_stacks,
            trig_addr,
            fc_trig_addr,
            remote: AtomicUsize::new(0),
        }
    }

    pub fn cid(&self) -> CoreId {
        self.cid
    }

    pub fn trig_addr(&self) -> TriggerAddr {
        self.trig_addr
    }

    pub fn fc_trig_addr(&self) -> TriggerAddr {
        self.fc_trig_addr
    }

    pub fn call_stacks(&self) -> StackRegion {
        self.call_stacks
    }

    /// Powers the cluster up on the first mount. Returns the new count.
    pub fn mount(&self) -> u32 {
        let count = self.mount_count.fetch_add(1, Ordering::AcqRel) + 1;
        if count == 1 {
            debug!("cluster {}: mounted", self.cid);
        }
        count
    }

    /// Drops one mount reference. Returns the new count.
    pub fn unmount(&self) -> u32 {
        let previous = self
            .mount_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        let count = previous.saturating_sub(1);
        if previous == 1 {
            debug!("cluster {}: unmounted", self.cid);
        }
        count
    }

    pub fn is_mounted(&self) -> bool {
        self.mount_count() > 0
    }

    pub fn mount_count(&self) -> u32 {
        self.mount_count.load(Ordering::Acquire)
    }

    /// Number of calls dispatched so far.
    pub fn call_head(&self) -> u32 {
        self.call_head.load(Ordering::Acquire)
    }

    /// Calls in the ring not yet picked up by the cluster.
    pub fn pending_calls(&self) -> u32 {
        self.pending.load(Ordering::Acquire)
    }

    /// Pushes `call` to the cluster.
    ///
    /// # Safety
    ///
    /// `call` must stay valid and unmoved until its completion event has run.
    pub unsafe fn dispatch(&self, call: &ClusterCall, port: &dyn Port) -> RtResult<()> {
        if !self.is_mounted() {
            return Err(RtError::NotMounted);
        }
        if call.stacks.get().size == 0 {
            call.set_stacks(self.call_stacks);
        }
        if call.stacks.get().size < call.config.stack_bytes() {
            warn!("cluster {}: call stacks smaller than requested", self.cid);
        }

        self.pending.fetch_add(1, Ordering::AcqRel);
        if self.calls.enqueue(call as *const ClusterCall as usize).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            return Err(RtError::MailboxFull);
        }
        let head = self.call_head.fetch_add(1, Ordering::AcqRel) + 1;
        debug!("cluster {}: dispatch call #{} on {} PEs", self.cid, head, call.config.nb_pe);
        port.trigger(self.trig_addr, evt::DISPATCH);
        Ok(())
    }

    /// Dispatches `call` and waits for it to complete.
    pub fn call_sync(&self, sched: &Scheduler, call: &ClusterCall) -> RtResult<()> {
        let event = call.completion_event();
        let fired = event.fired();
        // SAFETY: we do not return before the completion event has run.
        unsafe { self.dispatch(call, sched.port())? };
        sched.trace(records::CLUSTER_DISPATCH, call as *const ClusterCall as usize);
        while event.fired() == fired || event.is_queued() {
            sched.block_on(event);
        }
        Ok(())
    }

    /// Cluster side: runs every queued call across its PEs and returns each
    /// completion event to the FC. Returns the number of calls served.
    pub fn serve(&self, port: &dyn Port) -> usize {
        let mut served = 0;
        while let Some(addr) = self.calls.dequeue() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            // SAFETY: dispatched calls stay valid until their event has run.
            let call = unsafe { &*(addr as *const ClusterCall) };
            let (entry, arg, config, stacks) = (call.entry, call.arg, call.config, call.stacks.get());
            let cid = self.cid;

            trace!("cluster {}: run call {:#x}", cid, addr);
            port.fork(config.nb_pe, &|pe: u32| {
                entry(&PeContext {
                    cid,
                    pe,
                    nb_pe: config.nb_pe,
                    arg,
                    stack: carve_stack(stacks, config, pe),
                })
            });

            let event = call.completion_event();
            // SAFETY: the FC keeps the call alive until this event has run.
            unsafe { self.push_to_fc(event, port) };
            served += 1;
        }
        served
    }

    /// Cluster side: hands `event` to the FC scheduler through the remote
    /// slot, waiting for the slot to drain if it is taken.
    ///
    /// # Safety
    ///
    /// `event` must stay valid until it has run on the FC.
    pub unsafe fn push_to_fc(&self, event: &Event, port: &dyn Port) {
        let addr = event as *const Event as usize;
        while self
            .remote
            .compare_exchange(0, addr, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            port.wait_event(evt::CLUSTER_CALL);
        }
        port.trigger(self.fc_trig_addr, evt::FC_ENQUEUE);
    }

    /// FC side: moves the event in the remote slot into `sched`. Meant to run
    /// from the `FC_ENQUEUE` handler.
    pub fn service(&self, sched: &Scheduler) -> bool {
        let addr = self.remote.swap(0, Ordering::AcqRel);
        if addr == 0 {
            return false;
        }
        // SAFETY: the pushing core keeps the event alive until it has run.
        let event = unsafe { &*(addr as *const Event) };
        sched.trace(records::CLUSTER_DONE, addr);
        if let Err(err) = unsafe { sched.post(event) } {
            warn!("cluster {}: remote event {:#x} dropped: {}", self.cid, addr, err);
        }
        sched.port().trigger(self.trig_addr, evt::CLUSTER_CALL);
        true
    }
}
