//! Thread scheduling on the hosted port.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;

use pulp_rt::{
    CopyStatus, Event, PeriphChannel, PeriphCopy, Request, RunMode, Scheduler, SchedulerConfig,
    StackRegion, Thread, ThreadQueue, ThreadState, Udma,
};
use pulp_rt_std::StdChip;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn fc_scheduler() -> Scheduler {
    init_logging();
    let chip = StdChip::new(0);
    Scheduler::new(SchedulerConfig::default(), chip.fc())
}

struct Shared {
    sched: *const Scheduler,
    event: Event,
    queue: ThreadQueue,
    other: *const Thread,
    hits: AtomicU32,
    log: Mutex<Vec<usize>>,
}

impl Shared {
    fn new(sched: &Scheduler) -> Self {
        Self {
            sched,
            event: Event::new(),
            queue: ThreadQueue::new(),
            other: std::ptr::null(),
            hits: AtomicU32::new(0),
            log: Mutex::new(Vec::new()),
        }
    }

    fn addr(&self) -> usize {
        self as *const Self as usize
    }

    fn log(&self) -> Vec<usize> {
        self.log.lock().unwrap().clone()
    }
}

fn shared<'a>(arg: usize) -> (&'a Shared, &'a Scheduler) {
    let shared = unsafe { &*(arg as *const Shared) };
    (shared, unsafe { &*shared.sched })
}

fn spawn(sched: &Scheduler, thread: &Thread, entry: fn(usize) -> usize, arg: usize) {
    unsafe { sched.spawn(thread, entry, arg, StackRegion::default()).unwrap() };
}

fn log_event(event: &Event) {
    let (shared, _) = shared(event.arg());
    shared.log.lock().unwrap().push(1);
}

fn double(arg: usize) -> usize {
    arg * 2
}

#[test]
fn spawn_and_join() {
    let sched = fc_scheduler();
    let thread = Thread::new();
    spawn(&sched, &thread, double, 21);

    assert_eq!(sched.join(&thread), 42);
    assert!(thread.is_finished());
    assert_eq!(thread.state(), ThreadState::Other);
    assert!(sched.current().is_none());
}

fn block_twice(arg: usize) -> usize {
    let (shared, sched) = shared(arg);
    for _ in 0..2 {
        sched.block_on(&shared.event);
        shared.hits.fetch_add(1, Ordering::SeqCst);
    }
    7
}

#[test]
fn blocked_thread_resumes_once_per_fire() {
    let sched = fc_scheduler();
    let shared = Shared::new(&sched);
    let thread = Thread::new();
    spawn(&sched, &thread, block_twice, shared.addr());

    assert_eq!(sched.run(RunMode::Poll), 1);
    assert_eq!(thread.state(), ThreadState::Waiting);
    assert_eq!(shared.hits.load(Ordering::SeqCst), 0);

    unsafe { sched.post(&shared.event).unwrap() };
    sched.run(RunMode::Poll);
    assert_eq!(shared.hits.load(Ordering::SeqCst), 1);
    assert_eq!(thread.state(), ThreadState::Waiting);

    // Nothing posted: the thread stays parked.
    assert_eq!(sched.run(RunMode::Poll), 0);
    assert_eq!(shared.hits.load(Ordering::SeqCst), 1);

    unsafe { sched.post(&shared.event).unwrap() };
    sched.run(RunMode::Poll);
    assert_eq!(shared.hits.load(Ordering::SeqCst), 2);
    assert!(thread.is_finished());
    assert_eq!(sched.join(&thread), 7);
}

fn block_then_log(arg: usize) -> usize {
    let (shared, sched) = shared(arg);
    sched.block_on(&shared.event);
    shared.log.lock().unwrap().push(0);
    0
}

#[test]
fn resumed_thread_runs_before_later_events() {
    let sched = fc_scheduler();
    let shared = Shared::new(&sched);
    let thread = Thread::new();
    let later = Event::with_callback(log_event, shared.addr());
    spawn(&sched, &thread, block_then_log, shared.addr());
    sched.run(RunMode::Poll);

    unsafe {
        sched.post(&shared.event).unwrap();
        sched.post(&later).unwrap();
    }
    sched.run(RunMode::Poll);

    assert_eq!(shared.log(), [0, 1]);
}

fn queue_then_log(arg: usize) -> usize {
    let (shared, sched) = shared(arg);
    let me = sched.current().unwrap();
    sched.block_in(me.wake_event(), &shared.queue);
    let id = me as *const Thread as usize;
    shared.log.lock().unwrap().push(id);
    0
}

#[test]
fn woken_threads_leave_the_wait_queue() {
    let sched = fc_scheduler();
    let shared = Shared::new(&sched);
    let (a, b) = (Thread::new(), Thread::new());
    spawn(&sched, &a, queue_then_log, shared.addr());
    spawn(&sched, &b, queue_then_log, shared.addr());
    sched.run(RunMode::Poll);

    assert_eq!(shared.queue.len(), 2);
    assert_eq!(a.state(), ThreadState::Waiting);

    while let Some(first) = shared.queue.first() {
        sched.wake(first).unwrap();
    }
    assert!(shared.queue.is_empty());
    assert_eq!(b.state(), ThreadState::Ready);
    sched.run(RunMode::Poll);

    let ids = [&a as *const Thread as usize, &b as *const Thread as usize];
    assert_eq!(shared.log(), ids);
}

fn block_then_return_5(arg: usize) -> usize {
    let (shared, sched) = shared(arg);
    sched.block_on(&shared.event);
    5
}

fn join_other(arg: usize) -> usize {
    let (shared, sched) = shared(arg);
    let other = unsafe { &*shared.other };
    sched.join(other) + 1
}

#[test]
fn thread_joins_thread() {
    let sched = fc_scheduler();
    let (worker, joiner) = (Thread::new(), Thread::new());
    let mut shared = Shared::new(&sched);
    shared.other = &worker;

    spawn(&sched, &worker, block_then_return_5, shared.addr());
    spawn(&sched, &joiner, join_other, shared.addr());
    sched.run(RunMode::Poll);
    assert_eq!(joiner.state(), ThreadState::Waiting);

    unsafe { sched.post(&shared.event).unwrap() };
    assert_eq!(sched.join(&joiner), 6);
    assert_eq!(worker.status(), 5);
}

fn idle_worker(arg: usize) -> usize {
    let (shared, sched) = shared(arg);
    sched.wait_for_work();
    shared.log.lock().unwrap().push(100);
    0
}

#[test]
fn idle_thread_is_woken_by_next_post() {
    let sched = fc_scheduler();
    let shared = Shared::new(&sched);
    let worker = Thread::new();
    spawn(&sched, &worker, idle_worker, shared.addr());
    sched.run(RunMode::Poll);
    assert_eq!(worker.state(), ThreadState::Waiting);

    let work = Event::with_callback(log_event, shared.addr());
    unsafe { sched.post(&work).unwrap() };
    assert_eq!(worker.state(), ThreadState::Ready);
    sched.run(RunMode::Poll);

    assert_eq!(shared.log(), [1, 100]);
    assert!(worker.is_finished());
}

struct Io {
    sched: *const Scheduler,
    channel: *const PeriphChannel<'static>,
    request: Request<u32>,
}

#[derive(Default)]
struct CountingUdma {
    armed: AtomicUsize,
}

impl Udma for CountingUdma {
    fn enqueue(&self, _base: usize, _addr: usize, _size: usize, _cfg: u32) {
        self.armed.fetch_add(1, Ordering::SeqCst);
    }

    fn write(&self, _reg: usize, _value: u32) {}
}

fn read_blocking(arg: usize) -> usize {
    let io = unsafe { &*(arg as *const Io) };
    let (sched, channel) = unsafe { (&*io.sched, &*io.channel) };

    let copy = PeriphCopy::new(0x100, 32, 0);
    let done = Event::new();
    unsafe {
        copy.set_event(&done);
        channel.enqueue(&copy);
    }
    while !matches!(copy.status(), CopyStatus::Done | CopyStatus::Failed) || done.is_queued() {
        sched.block_on(&done);
    }
    (copy.status() == CopyStatus::Done) as usize
}

#[test]
fn copy_completion_wakes_blocked_reader() {
    let sched = fc_scheduler();
    let udma: &'static CountingUdma = Box::leak(Box::default());
    let channel: &'static PeriphChannel<'static> =
        Box::leak(Box::new(PeriphChannel::new(0x1A10_2000, udma)));
    let io = Io {
        sched: &sched,
        channel,
        request: Request::new(),
    };
    let reader = Thread::new();
    spawn(&sched, &reader, read_blocking, &io as *const Io as usize);

    sched.run(RunMode::Poll);
    assert_eq!(udma.armed.load(Ordering::SeqCst), 1);
    assert_eq!(reader.state(), ThreadState::Waiting);

    channel.on_hardware_complete(&sched, Ok(()));
    assert_eq!(sched.join(&reader), 1);
    assert!(channel.is_idle());
}

fn wait_request(arg: usize) -> usize {
    let io = unsafe { &*(arg as *const Io) };
    let sched = unsafe { &*io.sched };
    io.request.wait(sched).unwrap_or(0) as usize
}

#[test]
fn request_wait_blocks_the_thread() {
    let sched = fc_scheduler();
    let udma: &'static CountingUdma = Box::leak(Box::default());
    let channel: &'static PeriphChannel<'static> =
        Box::leak(Box::new(PeriphChannel::new(0, udma)));
    let io = Io {
        sched: &sched,
        channel,
        request: Request::new(),
    };
    io.request.arm(sched.core());
    let waiter = Thread::new();
    spawn(&sched, &waiter, wait_request, &io as *const Io as usize);
    sched.run(RunMode::Poll);
    assert_eq!(waiter.state(), ThreadState::Waiting);

    unsafe { io.request.complete(&sched, 33) };
    assert_eq!(sched.join(&waiter), 33);
    assert!(!io.request.event().is_queued());
}
