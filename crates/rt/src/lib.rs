#![cfg_attr(not(any(test, feature = "std")), no_std)]

//! # PULP runtime core
//!
//! Event scheduling, cooperative threads, uDMA channel queues and FC/cluster
//! synchronization for chips built around a fabric controller (FC) and one
//! or more clusters of processing elements (PEs).
//!
//! Nothing here allocates: events, threads, copies, requests and locks all
//! live in storage owned by the caller, and kernel queues link them in place.
//! The chip is reached only through the [`Port`] trait; `pulp-rt-std`
//! provides a hosted port that runs the kernel on a workstation.

pub mod cluster;
pub mod config;
pub mod error;
pub mod event;
mod list;
pub mod lock;
pub mod notif;
pub mod periph;
pub mod port;
pub mod request;
pub mod sched;
pub mod thread;
pub mod trace;

pub use cluster::{ClusterCall, ClusterEntry, ClusterMailbox, PeContext, CALL_RING};
pub use config::{ClusterConfig, ErrorPolicy, SchedulerConfig};
pub use error::{RtError, RtResult};
pub use event::{BridgeRequest, Callback, Event, Payload};
pub use lock::{FcLock, LockRequest, RemoteLock, TasLock};
pub use notif::{evt, Notification};
pub use periph::{CopyKind, CopyStatus, CopyType, PeriphChannel, PeriphCopy, Udma};
pub use port::{Context, CoreId, EventId, Port, StackRegion, TriggerAddr, FC_CORE_ID};
pub use request::{IoWaitRequest, Request};
pub use sched::{ErrorReport, RunMode, Scheduler};
pub use thread::{Thread, ThreadEntry, ThreadQueue, ThreadState};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests;
