//! The host stack as seen from the shim.

use std::sync::Arc;

use crate::api::NativePacket;
use crate::capabilities::CapabilityTable;
use crate::netqueue::HostQueueId;
use crate::poll::PollId;

/// Where a batch of received packets came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RxSource {
    Poll(PollId),
    /// Received outside any poll context.
    Direct,
}

#[allow(unused_variables)]
pub trait HostStack: Send + Sync {
    /// Takes ownership of received packets, in arrival order.
    fn deliver(&self, source: RxSource, pkts: Vec<NativePacket>);

    /// A tx ring was stopped or woken by its driver.
    fn tx_queue_state(&self, queue: HostQueueId, stopped: bool) {}

    /// Called once per device with the negotiated capabilities.
    fn register_capabilities(&self, device: &str, caps: &CapabilityTable) {}
}

/// Per-context replacement for [`HostStack::deliver`].
pub type DeliveryFn = Arc<dyn Fn(PollId, Vec<NativePacket>) + Send + Sync>;
