//! Error kinds reported by the runtime.

use core::fmt;

/// Result type used throughout the runtime.
pub type RtResult<T> = Result<T, RtError>;

/// Error kinds surfaced either as `Err` at the call site or through a
/// scheduler's error callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtError {
    /// A peripheral transfer completed with an error.
    Transfer,
    /// A lock was released by a core that does not hold it.
    LockNotHeld,
    /// The scheduler free list has no spare event.
    NoFreeEvent,
    /// The event is already linked in a scheduler queue.
    AlreadyQueued,
    /// The cluster is not mounted.
    NotMounted,
    /// The cluster call ring is full.
    MailboxFull,
    /// An index fell outside a fixed-size area.
    OutOfRange,
    /// The object belongs to another scheduler.
    WrongScheduler,
    /// The port failed to create or switch an execution context.
    Context,
}

impl RtError {
    /// Fatal errors abort the system when no error callback is registered.
    pub const fn is_fatal(self) -> bool {
        matches!(self, RtError::LockNotHeld | RtError::NoFreeEvent)
    }
}

impl fmt::Display for RtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RtError::Transfer => write!(f, "Peripheral transfer failed"),
            RtError::LockNotHeld => write!(f, "Lock released while not held"),
            RtError::NoFreeEvent => write!(f, "No free event in scheduler pool"),
            RtError::AlreadyQueued => write!(f, "Event is already queued"),
            RtError::NotMounted => write!(f, "Cluster is not mounted"),
            RtError::MailboxFull => write!(f, "Cluster call ring is full"),
            RtError::OutOfRange => write!(f, "Index out of range"),
            RtError::WrongScheduler => write!(f, "Object belongs to another scheduler"),
            RtError::Context => write!(f, "Execution context error"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for RtError {}

#[cfg(feature = "defmt")]
impl defmt::Format for RtError {
    fn format(&self, fmt: defmt::Formatter) {
        match self {
            RtError::Transfer => defmt::write!(fmt, "Transfer"),
            RtError::LockNotHeld => defmt::write!(fmt, "LockNotHeld"),
            RtError::NoFreeEvent => defmt::write!(fmt, "NoFreeEvent"),
            RtError::AlreadyQueued => defmt::write!(fmt, "AlreadyQueued"),
            RtError::NotMounted => defmt::write!(fmt, "NotMounted"),
            RtError::MailboxFull => defmt::write!(fmt, "MailboxFull"),
            RtError::OutOfRange => defmt::write!(fmt, "OutOfRange"),
            RtError::WrongScheduler => defmt::write!(fmt, "WrongScheduler"),
            RtError::Context => defmt::write!(fmt, "Context"),
        }
    }
}
