//! The legacy driver contract.
//!
//! Every slot of the legacy operation table is a trait method. Slots a driver
//! leaves empty keep the default body, which answers
//! [`DriverError::NotSupported`].

use thiserror::Error;

use crate::api::{DescBox, Features, FilterClass, NetqFeatures, QueueFeatures};
use crate::device::NetDevice;
use crate::netqueue::{FilterId, QueueId, QueueType, RxFilter};
use crate::poll::{PollCtx, PollId};
use crate::xmit::TxQueue;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverError {
    #[error("operation not supported")]
    NotSupported,
    #[error("driver out of memory")]
    NoMemory,
    #[error("driver status {0}")]
    Status(i32),
}

pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Result of the transmit entry point. A refused descriptor is handed back.
#[derive(Debug)]
pub enum XmitStatus {
    Ok,
    /// Ring full; try again later.
    Busy(DescBox),
    Failed(DescBox),
}

/// Allocation attribute. At most [`MAX_QUEUE_ATTRS`] per request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueAttr {
    Priority(u8),
    Features(QueueFeatures),
}

pub const MAX_QUEUE_ATTRS: usize = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocatedQueue {
    pub id: QueueId,
    /// Poll context servicing an rx queue.
    pub poll: Option<PollId>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AppliedFilter {
    pub id: FilterId,
    pub pair_tx: Option<u16>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RssParams {
    pub num_queues: u16,
    pub key_len: u16,
    pub table_len: u16,
}

/// One reallocation transaction: drop `remove`, free `queue`, allocate a
/// replacement with `attrs`, then install `apply` on it.
#[derive(Clone, Copy, Debug)]
pub struct ReallocArgs<'a> {
    pub queue: QueueId,
    pub attrs: &'a [QueueAttr],
    pub remove: &'a [FilterId],
    pub apply: Option<&'a RxFilter>,
}

#[allow(unused_variables)]
pub trait QueueOps {
    fn netq_version(&self) -> DriverResult<(u16, u16)> {
        Err(DriverError::NotSupported)
    }

    fn netq_features(&self) -> DriverResult<NetqFeatures> {
        Err(DriverError::NotSupported)
    }

    fn queue_count(&self, ty: QueueType) -> DriverResult<u16> {
        Err(DriverError::NotSupported)
    }

    fn filter_count(&self, ty: QueueType) -> DriverResult<u16> {
        Err(DriverError::NotSupported)
    }

    fn alloc_queue(&self, ty: QueueType, attrs: &[QueueAttr]) -> DriverResult<AllocatedQueue> {
        Err(DriverError::NotSupported)
    }

    fn free_queue(&self, id: QueueId) -> DriverResult<()> {
        Err(DriverError::NotSupported)
    }

    fn realloc_queue(
        &self,
        args: &ReallocArgs<'_>,
    ) -> DriverResult<(AllocatedQueue, Option<AppliedFilter>)> {
        Err(DriverError::NotSupported)
    }

    fn queue_vector(&self, id: QueueId) -> DriverResult<u32> {
        Err(DriverError::NotSupported)
    }

    fn default_queue(&self, ty: QueueType) -> DriverResult<QueueId> {
        Err(DriverError::NotSupported)
    }

    fn apply_rx_filter(&self, id: QueueId, filter: &RxFilter) -> DriverResult<AppliedFilter> {
        Err(DriverError::NotSupported)
    }

    fn remove_rx_filter(&self, id: QueueId, filter: FilterId) -> DriverResult<()> {
        Err(DriverError::NotSupported)
    }

    fn set_tx_priority(&self, id: QueueId, priority: u8) -> DriverResult<()> {
        Err(DriverError::NotSupported)
    }

    fn enable_queue_features(&self, id: QueueId, features: QueueFeatures) -> DriverResult<()> {
        Err(DriverError::NotSupported)
    }

    fn disable_queue_features(&self, id: QueueId, features: QueueFeatures) -> DriverResult<()> {
        Err(DriverError::NotSupported)
    }

    fn supported_queue_features(&self, ty: QueueType) -> DriverResult<QueueFeatures> {
        Err(DriverError::NotSupported)
    }

    fn supported_filter_classes(&self, ty: QueueType) -> DriverResult<FilterClass> {
        Err(DriverError::NotSupported)
    }

    fn rss_params(&self) -> DriverResult<RssParams> {
        Err(DriverError::NotSupported)
    }

    fn rss_init(&self, key: &[u8], table: &[u8]) -> DriverResult<()> {
        Err(DriverError::NotSupported)
    }

    fn rss_update_table(&self, table: &[u8]) -> DriverResult<()> {
        Err(DriverError::NotSupported)
    }

    /// Fills `table` and returns the number of valid entries.
    fn rss_table(&self, table: &mut [u8]) -> DriverResult<usize> {
        Err(DriverError::NotSupported)
    }
}

/// Device operations of a legacy driver.
#[allow(unused_variables)]
pub trait NetDriver: QueueOps + Send + Sync {
    fn features(&self) -> Features;

    fn open(&self, dev: &NetDevice) -> DriverResult<()>;

    fn close(&self, dev: &NetDevice) -> DriverResult<()>;

    /// Takes ownership of `desc` unless it is handed back in the status.
    fn start_xmit(&self, desc: DescBox, txq: &TxQueue) -> XmitStatus;

    /// Processes up to `ctx.budget()` receive units and returns how many
    /// were done. Calls [`PollCtx::complete`] once the ring is empty.
    fn poll(&self, ctx: &mut PollCtx<'_>) -> usize;

    fn ioctl(&self, cmd: u32, data: &mut [u8]) -> DriverResult<i32> {
        Err(DriverError::NotSupported)
    }

    fn change_mtu(&self, mtu: u32) -> DriverResult<()> {
        Err(DriverError::NotSupported)
    }

    fn tx_timeout(&self, txq: &TxQueue) -> DriverResult<()> {
        Err(DriverError::NotSupported)
    }

    fn vlan_rx_add_vid(&self, vid: u16) -> DriverResult<()> {
        Err(DriverError::NotSupported)
    }

    fn vlan_rx_kill_vid(&self, vid: u16) -> DriverResult<()> {
        Err(DriverError::NotSupported)
    }
}
