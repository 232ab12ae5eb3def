//! Trace hooks.
//!
//! A scheduler configured with a [`TraceHook`] reports each kernel
//! transition as a record id plus the address of the object involved.

/// Callback receiving a record id and an object address.
pub type TraceHook = fn(record: u8, object: usize);

/// Record identifiers.
pub mod records {
    pub const EVENT_POST: u8 = 1;
    pub const EVENT_RUN: u8 = 2;
    pub const THREAD_BLOCK: u8 = 3;
    pub const THREAD_WAKE: u8 = 4;
    pub const THREAD_EXIT: u8 = 5;
    pub const ERROR: u8 = 6;
    pub const COPY_DONE: u8 = 11;
    pub const LOCK_HANDOFF: u8 = 20;
    pub const CLUSTER_DISPATCH: u8 = 30;
    pub const CLUSTER_DONE: u8 = 31;
}
