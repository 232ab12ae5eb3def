//! Hosted port for `pulp-rt`.
//!
//! Emulates a chip on a workstation so the kernel can run unmodified:
//!
//! * every execution context is an OS thread gated by a baton, so exactly
//!   one context of a core runs at a time and a context switch is a baton
//!   hand-over;
//! * every core has an event line (a pending mask plus a condvar) that
//!   any core can raise through its trigger address;
//! * emulated interrupt handlers registered with [`StdCore::on_event`] run
//!   inside [`Port::wait_for_interrupt`] on the core's running context;
//! * a cluster fork runs one scoped OS thread per PE.
//!
//! The critical section of `pulp-rt` is provided by `critical-section`'s
//! `std` implementation.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use pulp_rt::notif::evt;
use pulp_rt::port::{Context, ContextEntry, CoreId, EventId, Port, StackRegion, TriggerAddr};
use pulp_rt::{ClusterMailbox, RtError, RtResult, Scheduler, FC_CORE_ID};

/// Longest time an idle wait sleeps before returning spuriously.
pub const IDLE_TICK: Duration = Duration::from_millis(1);

/// Errors raised by the hosted port itself.
#[derive(Debug, Error)]
pub enum PortError {
    #[error("failed to spawn context thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("no core behind trigger address {0:#x}")]
    UnknownTrigger(usize),
}

impl From<PortError> for RtError {
    fn from(_: PortError) -> Self {
        RtError::Context
    }
}

/// Hand-over token of one context.
#[derive(Default)]
struct Baton {
    held: Mutex<bool>,
    cond: Condvar,
}

impl Baton {
    fn give(&self) {
        *self.held.lock() = true;
        self.cond.notify_one();
    }

    fn take(&self) {
        let mut held = self.held.lock();
        while !*held {
            self.cond.wait(&mut held);
        }
        *held = false;
    }
}

/// Pending event mask of one core.
#[derive(Default)]
struct EventLine {
    pending: Mutex<u32>,
    cond: Condvar,
}

impl EventLine {
    fn raise(&self, id: EventId) {
        *self.pending.lock() |= 1 << id;
        self.cond.notify_all();
    }

    /// Takes the pending bits in `mask`, sleeping up to `IDLE_TICK` for one.
    fn take(&self, mask: u32) -> u32 {
        let mut pending = self.pending.lock();
        if *pending & mask == 0 {
            self.cond.wait_for(&mut pending, IDLE_TICK);
        }
        let fired = *pending & mask;
        *pending &= !fired;
        fired
    }
}

type Handler = Arc<dyn Fn() + Send + Sync>;

/// One emulated core.
pub struct StdCore {
    id: CoreId,
    line: usize,
    lines: Arc<[EventLine]>,
    batons: Mutex<Vec<Arc<Baton>>>,
    handlers: Mutex<Vec<(EventId, Handler)>>,
}

impl StdCore {
    fn new(id: CoreId, line: usize, lines: Arc<[EventLine]>) -> Self {
        Self {
            id,
            line,
            lines,
            batons: Mutex::new(Vec::new()),
            handlers: Mutex::new(Vec::new()),
        }
    }

    /// Trigger address of this core.
    pub fn trigger_addr(&self) -> TriggerAddr {
        TriggerAddr(self.line)
    }

    /// Installs an emulated interrupt handler for event line `id`.
    pub fn on_event(&self, id: EventId, handler: impl Fn() + Send + Sync + 'static) {
        self.handlers.lock().push((id, Arc::new(handler)));
    }

    fn event_line(&self) -> &EventLine {
        &self.lines[self.line]
    }

    fn new_baton(&self, ctx: &Context) -> Arc<Baton> {
        let mut batons = self.batons.lock();
        let baton = Arc::new(Baton::default());
        batons.push(baton.clone());
        ctx.set_handle(batons.len());
        baton
    }

    /// Baton of `ctx`; a context never saved before is the calling thread.
    fn baton(&self, ctx: &Context) -> Arc<Baton> {
        match ctx.handle() {
            0 => self.new_baton(ctx),
            handle => self.batons.lock()[handle - 1].clone(),
        }
    }

    fn handler_mask(&self) -> u32 {
        self.handlers
            .lock()
            .iter()
            .fold(0, |mask, (id, _)| mask | 1 << id)
    }
}

impl Port for StdCore {
    fn core_id(&self) -> CoreId {
        self.id
    }

    /// The stack region is not used: contexts run on OS thread stacks.
    fn init_context(
        &self,
        ctx: &Context,
        _stack: StackRegion,
        entry: ContextEntry,
        arg: usize,
    ) -> RtResult<()> {
        let baton = self.new_baton(ctx);
        let name = format!("core{}-ctx{}", self.id, ctx.handle());
        thread::Builder::new()
            .name(name)
            .spawn(move || {
                baton.take();
                entry(arg);
            })
            .map_err(|err| {
                let err = PortError::from(err);
                warn!("core {}: {}", self.id, err);
                RtError::from(err)
            })?;
        Ok(())
    }

    unsafe fn switch(&self, from: &Context, to: &Context) {
        let from = self.baton(from);
        self.baton(to).give();
        from.take();
    }

    unsafe fn exit(&self, _from: &Context, to: &Context) {
        self.baton(to).give();
    }

    fn wait_for_interrupt(&self) {
        let fired = self.event_line().take(self.handler_mask());
        if fired == 0 {
            return;
        }
        let handlers: Vec<Handler> = self
            .handlers
            .lock()
            .iter()
            .filter(|(id, _)| fired & (1 << id) != 0)
            .map(|(_, handler)| handler.clone())
            .collect();
        trace!("core {}: servicing events {:#x}", self.id, fired);
        for handler in handlers {
            handler();
        }
    }

    fn wait_event(&self, id: EventId) {
        self.event_line().take(1 << id);
    }

    fn trigger(&self, addr: TriggerAddr, id: EventId) {
        match self.lines.get(addr.0) {
            Some(line) => line.raise(id),
            None => warn!("core {}: {}", self.id, PortError::UnknownTrigger(addr.0)),
        }
    }

    fn fork(&self, nb_pe: u32, body: &(dyn Fn(u32) + Sync)) {
        thread::scope(|scope| {
            for pe in 0..nb_pe {
                scope.spawn(move || body(pe));
            }
        });
    }
}

/// An emulated chip: one FC and `nb_clusters` clusters.
pub struct StdChip {
    fc: StdCore,
    clusters: Vec<StdCore>,
}

impl StdChip {
    /// Builds a chip that lives for the rest of the process.
    pub fn new(nb_clusters: usize) -> &'static StdChip {
        let lines: Arc<[EventLine]> = (0..=nb_clusters).map(|_| EventLine::default()).collect();
        let fc = StdCore::new(FC_CORE_ID, 0, lines.clone());
        let clusters = (0..nb_clusters)
            .map(|i| StdCore::new(i as CoreId, i + 1, lines.clone()))
            .collect();
        debug!("hosted chip with {} cluster(s)", nb_clusters);
        Box::leak(Box::new(StdChip { fc, clusters }))
    }

    pub fn fc(&self) -> &StdCore {
        &self.fc
    }

    /// Panics if `index` is not a cluster of this chip.
    pub fn cluster(&self, index: usize) -> &StdCore {
        &self.clusters[index]
    }

    pub fn nb_clusters(&self) -> usize {
        self.clusters.len()
    }

    pub fn fc_trigger(&self) -> TriggerAddr {
        self.fc.trigger_addr()
    }

    pub fn cluster_trigger(&self, index: usize) -> TriggerAddr {
        self.cluster(index).trigger_addr()
    }

    /// Mailbox wiring cluster `index` to the FC.
    pub fn mailbox(&self, index: usize) -> ClusterMailbox {
        ClusterMailbox::new(
            index as CoreId,
            self.cluster_trigger(index),
            self.fc_trigger(),
            StackRegion::default(),
        )
    }
}

/// Pointer to a core-local object handed to an emulated interrupt handler.
pub struct CoreRef<T>(NonNull<T>);

// SAFETY: the handler only dereferences the pointer on the owning core,
// serialized with the other contexts of that core by their batons.
unsafe impl<T> Send for CoreRef<T> {}
unsafe impl<T> Sync for CoreRef<T> {}

impl<T> Clone for CoreRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for CoreRef<T> {}

impl<T> CoreRef<T> {
    /// # Safety
    ///
    /// `target` must outlive every use of the reference, and must only be
    /// dereferenced from the core that owns it.
    pub unsafe fn new(target: &T) -> Self {
        Self(NonNull::from(target))
    }

    /// # Safety
    ///
    /// See [`CoreRef::new`].
    pub unsafe fn get(&self) -> &T {
        self.0.as_ref()
    }
}

/// Routes `FC_ENQUEUE` on the FC into `sched` for events pushed through
/// `mailbox`.
///
/// # Safety
///
/// `sched` must outlive the chip and run on the FC.
pub unsafe fn attach_mailbox(fc: &StdCore, mailbox: &'static ClusterMailbox, sched: &Scheduler) {
    let sched = CoreRef::new(sched);
    // Handlers run on the FC, serialized with its contexts.
    fc.on_event(evt::FC_ENQUEUE, move || while mailbox.service(sched.get()) {});
}

/// Background loop serving cluster calls until dropped.
pub struct ClusterRunner {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ClusterRunner {
    pub fn spawn(core: &'static StdCore, mailbox: &'static ClusterMailbox) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = thread::Builder::new()
            .name(format!("cluster{}", core.id))
            .spawn(move || {
                while !flag.load(Ordering::Acquire) {
                    if mailbox.serve(core) == 0 {
                        core.wait_event(evt::DISPATCH);
                    }
                }
            })
            .ok();
        if handle.is_none() {
            warn!("cluster {}: runner thread not started", core.id);
        }
        Self { stop, handle }
    }
}

impl Drop for ClusterRunner {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
