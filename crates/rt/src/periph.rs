//! uDMA peripheral channels and copy descriptors.
//!
//! A channel keeps a FIFO of copies. The hardware holds one transfer at a
//! time: the head of the queue is in flight and `first_to_enqueue` points at
//! the next copy not handed to the hardware yet. On completion the next copy
//! is armed before the finished copy's event is posted, so the channel never
//! idles while software handles the completion.

use core::cell::Cell;
use core::ptr::NonNull;

use log::{trace, warn};

use crate::config::ErrorPolicy;
use crate::error::{RtError, RtResult};
use crate::event::{Event, Payload};
use crate::list::{Fifo, Link, Linked};
use crate::sched::Scheduler;
use crate::trace::records;

/// Bytes of inline scratch carried by each copy for driver use.
pub const PERIPH_DATA_SIZE: usize = 16;

/// Offset of the TX half of a duplex channel from its RX base.
pub const CHANNEL_TX_OFFSET: usize = 0x10;

/// Offset of the external address register of a HyperBus channel.
pub const HYPER_EXT_ADDR_OFFSET: usize = 0x20;

/// Copy type bits in `ctrl`.
pub const CTRL_TYPE_MASK: u32 = 0xF;

/// Set in `ctrl` for driver-defined copy types.
pub const CTRL_CUSTOM: u32 = 1 << 16;

/// Copy type decoded from `ctrl`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyType {
    Plain,
    SpimStep1,
    SpimStep2,
    Dual,
    Hyper,
    FcTcdm,
    SpiFlash,
    Custom(u32),
}

impl CopyType {
    pub fn from_ctrl(ctrl: u32) -> Self {
        let kind = ctrl & CTRL_TYPE_MASK;
        if ctrl & CTRL_CUSTOM != 0 {
            return CopyType::Custom(kind);
        }
        match kind {
            1 => CopyType::SpimStep1,
            2 => CopyType::SpimStep2,
            3 => CopyType::Dual,
            4 => CopyType::Hyper,
            5 => CopyType::FcTcdm,
            6 => CopyType::SpiFlash,
            0 => CopyType::Plain,
            other => CopyType::Custom(other),
        }
    }

    pub fn to_ctrl(self) -> u32 {
        match self {
            CopyType::Plain => 0,
            CopyType::SpimStep1 => 1,
            CopyType::SpimStep2 => 2,
            CopyType::Dual => 3,
            CopyType::Hyper => 4,
            CopyType::FcTcdm => 5,
            CopyType::SpiFlash => 6,
            CopyType::Custom(n) => CTRL_CUSTOM | (n & CTRL_TYPE_MASK),
        }
    }
}

/// Per-kind transfer parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CopyKind {
    #[default]
    Plain,
    /// Full-duplex: RX buffer programmed alongside the TX buffer.
    Dual { rx_addr: usize, rx_size: usize },
    /// External memory transfer moved `repeat_size` bytes at a time.
    /// `offset` counts the bytes already moved.
    Hyper {
        hyper_addr: usize,
        repeat_size: usize,
        offset: usize,
    },
    Raw([u32; 4]),
    I2c {
        data: usize,
        size: usize,
        base: u32,
        div: u16,
        xfer_pending: u16,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyStatus {
    Idle,
    Queued,
    Armed,
    Done,
    Failed,
}

#[cfg(feature = "defmt")]
impl defmt::Format for CopyStatus {
    fn format(&self, fmt: defmt::Formatter) {
        match self {
            CopyStatus::Idle => defmt::write!(fmt, "Idle"),
            CopyStatus::Queued => defmt::write!(fmt, "Queued"),
            CopyStatus::Armed => defmt::write!(fmt, "Armed"),
            CopyStatus::Done => defmt::write!(fmt, "Done"),
            CopyStatus::Failed => defmt::write!(fmt, "Failed"),
        }
    }
}

/// Driver hook replacing the default arming of a copy.
pub type EnqueueHook = fn(&PeriphChannel<'_>, &PeriphCopy);

/// uDMA register interface of a chip.
pub trait Udma {
    /// Programs one transfer on the channel at `base`.
    fn enqueue(&self, base: usize, addr: usize, size: usize, cfg: u32);

    /// Writes a channel register.
    fn write(&self, reg: usize, value: u32);
}

/// One transfer request. Storage is caller-owned.
pub struct PeriphCopy {
    addr: Cell<usize>,
    size: Cell<usize>,
    cfg: Cell<u32>,
    ctrl: Cell<u32>,
    hook: Cell<Option<EnqueueHook>>,
    next: Link<PeriphCopy>,
    event: Cell<Option<NonNull<Event>>>,
    kind: Cell<CopyKind>,
    periph_data: Cell<[u8; PERIPH_DATA_SIZE]>,
    status: Cell<CopyStatus>,
}

impl Linked for PeriphCopy {
    fn link(&self) -> &Link<Self> {
        &self.next
    }
}

impl PeriphCopy {
    pub const fn new(addr: usize, size: usize, cfg: u32) -> Self {
        Self {
            addr: Cell::new(addr),
            size: Cell::new(size),
            cfg: Cell::new(cfg),
            ctrl: Cell::new(0),
            hook: Cell::new(None),
            next: Cell::new(None),
            event: Cell::new(None),
            kind: Cell::new(CopyKind::Plain),
            periph_data: Cell::new([0; PERIPH_DATA_SIZE]),
            status: Cell::new(CopyStatus::Idle),
        }
    }

    pub fn dual(addr: usize, size: usize, cfg: u32, rx_addr: usize, rx_size: usize) -> Self {
        let copy = Self::new(addr, size, cfg);
        copy.ctrl.set(CopyType::Dual.to_ctrl());
        copy.kind.set(CopyKind::Dual { rx_addr, rx_size });
        copy
    }

    /// External memory copy of `size` bytes, moved `repeat_size` bytes at a time.
    pub fn hyper(addr: usize, size: usize, cfg: u32, hyper_addr: usize, repeat_size: usize) -> Self {
        let copy = Self::new(addr, size, cfg);
        copy.ctrl.set(CopyType::Hyper.to_ctrl());
        copy.kind.set(CopyKind::Hyper {
            hyper_addr,
            repeat_size: repeat_size.max(1),
            offset: 0,
        });
        copy
    }

    pub fn raw(addr: usize, size: usize, cfg: u32, ctrl: u32, words: [u32; 4]) -> Self {
        let copy = Self::new(addr, size, cfg);
        copy.ctrl.set(ctrl);
        copy.kind.set(CopyKind::Raw(words));
        copy
    }

    pub fn i2c(data: usize, size: usize, cfg: u32, base: u32, div: u16) -> Self {
        let copy = Self::new(data, size, cfg);
        copy.kind.set(CopyKind::I2c {
            data,
            size,
            base,
            div,
            xfer_pending: 0,
        });
        copy
    }

    /// Sets the event posted when the copy completes.
    ///
    /// # Safety
    ///
    /// `event` must outlive the copy's membership in a channel.
    pub unsafe fn set_event(&self, event: &Event) {
        self.event.set(Some(NonNull::from(event)));
    }

    pub fn set_enqueue_hook(&self, hook: EnqueueHook) {
        self.hook.set(Some(hook));
    }

    pub fn set_ctrl(&self, ctrl: u32) {
        self.ctrl.set(ctrl);
    }

    pub fn addr(&self) -> usize {
        self.addr.get()
    }

    pub fn size(&self) -> usize {
        self.size.get()
    }

    pub fn cfg(&self) -> u32 {
        self.cfg.get()
    }

    pub fn ctrl(&self) -> u32 {
        self.ctrl.get()
    }

    pub fn kind(&self) -> CopyKind {
        self.kind.get()
    }

    pub fn set_kind(&self, kind: CopyKind) {
        self.kind.set(kind);
    }

    pub fn copy_type(&self) -> CopyType {
        CopyType::from_ctrl(self.ctrl.get())
    }

    /// Types from `Dual` upwards are armed by a dedicated routine.
    pub fn needs_special_enqueue(&self) -> bool {
        (self.ctrl.get() & CTRL_TYPE_MASK) >= CopyType::Dual.to_ctrl()
            || self.ctrl.get() & CTRL_CUSTOM != 0
    }

    pub fn status(&self) -> CopyStatus {
        self.status.get()
    }

    pub fn periph_data(&self) -> [u8; PERIPH_DATA_SIZE] {
        self.periph_data.get()
    }

    pub fn set_periph_data(&self, data: [u8; PERIPH_DATA_SIZE]) {
        self.periph_data.set(data);
    }

    /// Little-endian word `index` of the scratch area, `None` past its end.
    pub fn periph_word(&self, index: usize) -> Option<u32> {
        let data = self.periph_data.get();
        let bytes = data.get(index.checked_mul(4)?..)?.get(..4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn set_periph_word(&self, index: usize, value: u32) -> RtResult<()> {
        let mut data = self.periph_data.get();
        let at = index.checked_mul(4).ok_or(RtError::OutOfRange)?;
        data.get_mut(at..)
            .and_then(|tail| tail.get_mut(..4))
            .ok_or(RtError::OutOfRange)?
            .copy_from_slice(&value.to_le_bytes());
        self.periph_data.set(data);
        Ok(())
    }

    /// Bytes of a chunked copy already handed to the hardware and completed.
    pub fn moved(&self) -> usize {
        match self.kind.get() {
            CopyKind::Hyper { offset, .. } => offset,
            _ => 0,
        }
    }

    /// Next chunk as (local address, external address, length).
    fn chunk(&self) -> (usize, usize, usize) {
        match self.kind.get() {
            CopyKind::Hyper {
                hyper_addr,
                repeat_size,
                offset,
            } => {
                let left = self.size.get().saturating_sub(offset);
                (self.addr.get() + offset, hyper_addr + offset, repeat_size.min(left))
            }
            _ => (self.addr.get(), 0, self.size.get()),
        }
    }

    /// Records the chunk in flight as moved; returns `true` while bytes remain.
    fn advance(&self) -> bool {
        let CopyKind::Hyper {
            hyper_addr,
            repeat_size,
            offset,
        } = self.kind.get()
        else {
            return false;
        };
        let size = self.size.get();
        let offset = (offset + repeat_size).min(size);
        self.kind.set(CopyKind::Hyper {
            hyper_addr,
            repeat_size,
            offset,
        });
        offset < size
    }

    fn rewind(&self) {
        if let CopyKind::Hyper {
            hyper_addr,
            repeat_size,
            ..
        } = self.kind.get()
        {
            self.kind.set(CopyKind::Hyper {
                hyper_addr,
                repeat_size,
                offset: 0,
            });
        }
    }
}

/// One uDMA channel and its copy queue.
pub struct PeriphChannel<'a> {
    queue: Fifo<PeriphCopy>,
    first_to_enqueue: Cell<Option<NonNull<PeriphCopy>>>,
    base: usize,
    data: Cell<[u32; 2]>,
    udma: &'a dyn Udma,
    policy: Cell<ErrorPolicy>,
    halted: Cell<bool>,
}

impl<'a> PeriphChannel<'a> {
    pub const fn new(base: usize, udma: &'a dyn Udma) -> Self {
        Self {
            queue: Fifo::new(),
            first_to_enqueue: Cell::new(None),
            base,
            data: Cell::new([0; 2]),
            udma,
            policy: Cell::new(ErrorPolicy::Continue),
            halted: Cell::new(false),
        }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn udma(&self) -> &'a dyn Udma {
        self.udma
    }

    /// Driver words kept with the channel.
    pub fn data(&self) -> [u32; 2] {
        self.data.get()
    }

    pub fn set_data(&self, data: [u32; 2]) {
        self.data.set(data);
    }

    pub fn set_error_policy(&self, policy: ErrorPolicy) {
        self.policy.set(policy);
    }

    pub fn is_halted(&self) -> bool {
        self.halted.get()
    }

    /// No copy is in flight.
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        critical_section::with(|_| self.queue.len())
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// The copy the hardware will receive next.
    pub fn first_to_enqueue(&self) -> Option<NonNull<PeriphCopy>> {
        self.first_to_enqueue.get()
    }

    /// Queues `copy`; arms it at once when the channel is idle.
    ///
    /// # Safety
    ///
    /// `copy` and its event must stay valid and unmoved until the copy
    /// completes, and `copy` must not be queued elsewhere.
    pub unsafe fn enqueue(&self, copy: &PeriphCopy) {
        let arm_now = critical_section::with(|_| {
            let idle = self.queue.is_empty();
            self.queue.push_back(copy);
            copy.rewind();
            copy.status.set(CopyStatus::Queued);
            if idle && !self.halted.get() {
                true
            } else {
                if self.first_to_enqueue.get().is_none() {
                    self.first_to_enqueue.set(Some(NonNull::from(copy)));
                }
                false
            }
        });
        if arm_now {
            self.arm(copy);
        }
    }

    /// Handles the end-of-transfer interrupt for the head copy.
    pub fn on_hardware_complete(&self, sched: &Scheduler, result: Result<(), RtError>) {
        let Some(head) = self.queue.first() else {
            warn!("channel {:#x}: completion with no copy in flight", self.base);
            return;
        };
        // SAFETY: queued copies are valid until they complete.
        let copy = unsafe { head.as_ref() };

        if result.is_ok() && copy.advance() {
            self.arm(copy);
            return;
        }

        critical_section::with(|_| self.queue.pop_front());
        let failed = match result {
            Ok(()) => {
                copy.status.set(CopyStatus::Done);
                None
            }
            Err(err) => {
                copy.status.set(CopyStatus::Failed);
                if self.policy.get() == ErrorPolicy::Halt {
                    self.halted.set(true);
                }
                Some(err)
            }
        };
        sched.trace(records::COPY_DONE, head.as_ptr() as usize);

        if !self.halted.get() {
            self.arm_next();
        }

        let Some(event) = copy.event.get() else {
            if let Some(err) = failed {
                sched.signal_error(None, err, head.as_ptr() as usize);
            }
            return;
        };
        // SAFETY: the completion event outlives the copy's queue membership.
        let event = unsafe { event.as_ref() };
        let target = event.scheduler().unwrap_or(sched);
        if let Some(err) = failed {
            target.signal_error(Some(event), err, head.as_ptr() as usize);
        }
        event.set_payload(Payload::Copy(head));
        if let Err(err) = unsafe { target.post(event) } {
            warn!("channel {:#x}: completion event not posted: {}", self.base, err);
        }
    }

    /// Restarts a halted channel.
    pub fn resume(&self) {
        if !self.halted.replace(false) {
            return;
        }
        self.arm_next();
    }

    fn arm_next(&self) {
        let next = critical_section::with(|_| {
            let next = self.first_to_enqueue.get()?;
            // SAFETY: queued copies are valid until they complete.
            let following = unsafe { next.as_ref() }.next.get();
            self.first_to_enqueue.set(following);
            Some(next)
        });
        if let Some(next) = next {
            self.arm(unsafe { next.as_ref() });
        }
    }

    fn arm(&self, copy: &PeriphCopy) {
        copy.status.set(CopyStatus::Armed);
        trace!("channel {:#x}: arm {:#x}", self.base, copy as *const PeriphCopy as usize);
        if let Some(hook) = copy.hook.get() {
            hook(self, copy);
            return;
        }

        let cfg = copy.cfg.get();
        match copy.kind.get() {
            CopyKind::Dual { rx_addr, rx_size } => {
                self.udma.enqueue(self.base, rx_addr, rx_size, cfg);
                self.udma
                    .enqueue(self.base + CHANNEL_TX_OFFSET, copy.addr.get(), copy.size.get(), cfg);
            }
            CopyKind::Hyper { .. } => {
                let (addr, ext_addr, len) = copy.chunk();
                self.udma.write(self.base + HYPER_EXT_ADDR_OFFSET, ext_addr as u32);
                self.udma.enqueue(self.base, addr, len, cfg);
            }
            CopyKind::I2c { data, size, .. } => {
                self.udma.enqueue(self.base, data, size, cfg);
            }
            CopyKind::Plain | CopyKind::Raw(_) => {
                self.udma.enqueue(self.base, copy.addr.get(), copy.size.get(), cfg);
            }
        }
    }
}
