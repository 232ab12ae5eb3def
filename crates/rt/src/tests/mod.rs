mod lock;

use std::cell::RefCell;

use crate::config::SchedulerConfig;
use crate::event::Event;
use crate::sched::Scheduler;

pub(crate) use self::port::TestPort;

thread_local! {
    static LOG: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// Callback appending the event argument to the per-test log.
pub(crate) fn record(event: &Event) {
    LOG.with(|log| log.borrow_mut().push(event.arg()));
}

pub(crate) fn recorded() -> Vec<usize> {
    LOG.with(|log| log.borrow().clone())
}

pub(crate) fn fc_scheduler() -> (Scheduler, &'static TestPort) {
    let port = TestPort::leak(crate::port::FC_CORE_ID);
    (Scheduler::new(SchedulerConfig::default(), port), port)
}
