//! Platform port: the narrow interface between the kernel and a chip.
//!
//! Everything above this module is portable. A port supplies context
//! save/switch, idle and event-line waits, trigger delivery across cores,
//! the hardware test-and-set, and the cluster fork/join.

use core::cell::Cell;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::error::RtResult;

/// Hardware core identifier. Cluster cores are numbered from 0.
pub type CoreId = u8;

/// Core id of the fabric controller.
pub const FC_CORE_ID: CoreId = 32;

/// Event line identifier on a core.
pub type EventId = u8;

/// Address of a core's event trigger register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TriggerAddr(pub usize);

/// Caller-owned stack memory for a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StackRegion {
    pub base: usize,
    pub size: usize,
}

impl StackRegion {
    pub const fn new(base: usize, size: usize) -> Self {
        Self { base, size }
    }

    /// Region covering a static or leaked buffer.
    pub fn from_slice(buf: &mut [u8]) -> Self {
        Self {
            base: buf.as_mut_ptr() as usize,
            size: buf.len(),
        }
    }
}

/// Saved continuation of an execution context.
///
/// The handle is opaque to the kernel; `0` means no context has been saved.
#[derive(Debug, Default)]
pub struct Context {
    handle: Cell<usize>,
}

impl Context {
    pub const fn new() -> Self {
        Self {
            handle: Cell::new(0),
        }
    }

    pub fn handle(&self) -> usize {
        self.handle.get()
    }

    pub fn set_handle(&self, handle: usize) {
        self.handle.set(handle);
    }
}

/// First function run by a fresh context.
pub type ContextEntry = fn(usize);

/// Platform services consumed by the kernel.
pub trait Port: Sync {
    /// Identifier of the calling core.
    fn core_id(&self) -> CoreId;

    /// Prepares `ctx` so that switching to it runs `entry(arg)` on `stack`.
    fn init_context(
        &self,
        ctx: &Context,
        stack: StackRegion,
        entry: ContextEntry,
        arg: usize,
    ) -> RtResult<()>;

    /// Saves the running continuation in `from` and resumes `to`.
    ///
    /// # Safety
    ///
    /// `from` must describe the running context and `to` a context prepared by
    /// `init_context` or saved by an earlier switch, both on this core.
    unsafe fn switch(&self, from: &Context, to: &Context);

    /// Resumes `to` and abandons `from` for good.
    ///
    /// Ports that cannot abandon a context may return; the caller must then
    /// unwind without touching kernel state.
    ///
    /// # Safety
    ///
    /// Same requirements as [`Port::switch`]; `from` is never resumed again.
    unsafe fn exit(&self, from: &Context, to: &Context);

    /// Idles the core until an interrupt may have been serviced.
    ///
    /// May return spuriously.
    fn wait_for_interrupt(&self);

    /// Sleeps until event line `id` fires on this core and clears it.
    ///
    /// May return spuriously.
    fn wait_event(&self, id: EventId);

    /// Raises event line `id` at a trigger address.
    fn trigger(&self, addr: TriggerAddr, id: EventId);

    /// Hardware test-and-set: stores a non-zero value and returns the old one.
    fn test_and_set(&self, word: &AtomicU32) -> u32 {
        word.swap(1, Ordering::Acquire)
    }

    /// Runs `body(pe)` on `nb_pe` processing elements and joins them.
    fn fork(&self, nb_pe: u32, body: &(dyn Fn(u32) + Sync));
}
