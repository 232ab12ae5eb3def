//! Inter-core notifications over hardware event lines.

use crate::cluster::ClusterMailbox;
use crate::port::{EventId, Port, TriggerAddr};

/// Event line assignment.
pub mod evt {
    use crate::port::EventId;

    /// Cluster: a call was pushed to the ring.
    pub const DISPATCH: EventId = 0;
    /// Cluster: the FC drained the remote slot or granted a remote request.
    pub const CLUSTER_CALL: EventId = 1;
    /// Cluster: user notification.
    pub const CLUSTER_TRIGGER: EventId = 2;
    /// FC: an event is waiting in a cluster's remote slot.
    pub const FC_ENQUEUE: EventId = 1;
    /// FC: user notification.
    pub const NOTIF: EventId = 3;
    /// FC: debug bridge request.
    pub const BRIDGE_ENQUEUE: EventId = 4;
}

/// A target core plus the line to raise on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Notification {
    trig_addr: TriggerAddr,
    event_id: EventId,
}

impl Notification {
    pub const fn new(trig_addr: TriggerAddr, event_id: EventId) -> Self {
        Self {
            trig_addr,
            event_id,
        }
    }

    /// User notification channel towards a cluster.
    pub fn for_cluster(mailbox: &ClusterMailbox) -> Self {
        Self::new(mailbox.trig_addr(), evt::CLUSTER_TRIGGER)
    }

    /// User notification channel towards the FC.
    pub fn for_fc(mailbox: &ClusterMailbox) -> Self {
        Self::new(mailbox.fc_trig_addr(), evt::NOTIF)
    }

    pub fn trig_addr(&self) -> TriggerAddr {
        self.trig_addr
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn notify(&self, port: &dyn Port) {
        port.trigger(self.trig_addr, self.event_id);
    }

    /// Sleeps the calling core until the line fires. May return spuriously.
    pub fn wait(&self, port: &dyn Port) {
        port.wait_event(self.event_id);
    }
}
