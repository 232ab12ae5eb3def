use std::cell::RefCell;

use super::{fc_scheduler, record, recorded, TestPort};
use crate::cluster::ClusterMailbox;
use crate::error::RtError;
use crate::lock::{FcLock, LockRequest, TasLock};
use crate::notif::evt;
use crate::port::{StackRegion, TriggerAddr};
use crate::sched::{ErrorReport, RunMode};

thread_local! {
    static REPORTS: RefCell<Vec<RtError>> = const { RefCell::new(Vec::new()) };
}

fn collect(_arg: usize, report: &ErrorReport<'_>) {
    REPORTS.with(|r| r.borrow_mut().push(report.error));
}

const CLUSTER_TRIG: TriggerAddr = TriggerAddr(0x1000);
const FC_TRIG: TriggerAddr = TriggerAddr(0x2000);

#[test]
fn try_lock_and_unlock() {
    let (sched, _) = fc_scheduler();
    let lock = FcLock::new();

    assert!(lock.try_lock());
    assert!(!lock.try_lock());
    lock.unlock(&sched).unwrap();
    assert!(!lock.is_locked());
}

#[test]
fn contended_lock_is_handed_off_in_fifo_order() {
    let (sched, _) = fc_scheduler();
    let lock = FcLock::new();
    let (first, second) = (LockRequest::new(), LockRequest::new());
    first.event().set_callback(record, 1);
    second.event().set_callback(record, 2);

    assert!(lock.try_lock());
    unsafe {
        assert!(!lock.acquire_async(&sched, &first));
        assert!(!lock.acquire_async(&sched, &second));
    }
    assert_eq!(lock.waiters(), 2);

    lock.unlock(&sched).unwrap();
    assert!(lock.is_locked());
    assert!(first.is_done());
    assert!(!second.is_done());
    assert_eq!(lock.waiters(), 1);
    sched.run(RunMode::Poll);

    lock.unlock(&sched).unwrap();
    assert!(lock.is_locked());
    assert!(second.is_done());
    sched.run(RunMode::Poll);

    lock.unlock(&sched).unwrap();
    assert!(!lock.is_locked());
    assert_eq!(recorded(), [1, 2]);
}

#[test]
fn free_lock_is_granted_immediately() {
    let (sched, _) = fc_scheduler();
    let lock = FcLock::new();
    let req = LockRequest::new();

    assert!(unsafe { lock.acquire_async(&sched, &req) });
    assert!(req.is_done());
    assert!(!req.event().is_queued());
    assert!(lock.is_locked());
}

#[test]
fn blocking_lock_from_main_context_runs_until_granted() {
    let (sched, port) = fc_scheduler();
    let lock = Box::leak(Box::new(FcLock::new()));
    assert!(lock.try_lock());

    let sched_addr = &sched as *const _ as usize;
    let lock_addr = lock as *const FcLock as usize;
    port.on_idle(move || unsafe {
        let lock = &*(lock_addr as *const FcLock);
        if lock.waiters() > 0 {
            lock.unlock(&*(sched_addr as *const crate::sched::Scheduler)).unwrap();
        }
    });

    lock.lock(&sched);
    assert!(lock.is_locked());
    assert_eq!(lock.waiters(), 0);
    assert!(sched.is_empty());
}

#[test]
fn unlock_while_free_is_reported() {
    let (sched, _) = fc_scheduler();
    sched.set_error_handler(collect, 0);
    let lock = FcLock::new();

    assert_eq!(lock.unlock(&sched), Err(RtError::LockNotHeld));
    REPORTS.with(|r| assert_eq!(*r.borrow(), [RtError::LockNotHeld]));
}

#[test]
#[should_panic(expected = "Lock released while not held")]
fn unlock_while_free_without_handler_is_fatal() {
    let (sched, _) = fc_scheduler();
    let _ = FcLock::new().unlock(&sched);
}

#[test]
fn remote_requests_are_served_by_the_fc_scheduler() {
    let (sched, port) = fc_scheduler();
    let mailbox = ClusterMailbox::new(0, CLUSTER_TRIG, FC_TRIG, StackRegion::default());
    let lock = FcLock::new();
    let remote = lock.remote();
    assert_eq!(remote.addr(), &lock as *const FcLock as usize);

    assert!(lock.try_lock());
    let req = LockRequest::new();
    req.prepare(remote.addr(), true, 0, Some(CLUSTER_TRIG));
    req.event()
        .set_callback(crate::lock::serve_remote, &req as *const LockRequest as usize);

    unsafe { mailbox.push_to_fc(req.event(), port) };
    assert!(mailbox.service(&sched));
    sched.run(RunMode::Poll);
    assert!(!req.is_done());
    assert_eq!(lock.waiters(), 1);

    lock.unlock(&sched).unwrap();
    assert!(req.is_done());
    assert!(lock.is_locked());
    assert_eq!(
        port.triggers(),
        [
            (FC_TRIG, evt::FC_ENQUEUE),
            (CLUSTER_TRIG, evt::CLUSTER_CALL),
            (CLUSTER_TRIG, evt::CLUSTER_CALL),
        ]
    );
}

#[test]
fn remote_unlock_releases_and_acknowledges() {
    let (sched, port) = fc_scheduler();
    let mailbox = ClusterMailbox::new(0, CLUSTER_TRIG, FC_TRIG, StackRegion::default());
    let lock = FcLock::new();
    assert!(lock.try_lock());

    let req = LockRequest::new();
    req.prepare(lock.remote().addr(), false, 0, Some(CLUSTER_TRIG));
    req.event()
        .set_callback(crate::lock::serve_remote, &req as *const LockRequest as usize);

    unsafe { mailbox.push_to_fc(req.event(), port) };
    mailbox.service(&sched);
    sched.run(RunMode::Poll);

    assert!(req.is_done());
    assert!(!lock.is_locked());
}

#[test]
fn tas_lock() {
    let port = TestPort::leak(0);
    let lock = TasLock::new();

    assert!(lock.try_lock(port));
    assert!(!lock.try_lock(port));
    assert!(lock.is_locked());
    lock.unlock();
    lock.lock(port);
    assert!(lock.is_locked());
}
