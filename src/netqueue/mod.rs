//! Queue and filter management.
//!
//! The host allocates logical queues and installs receive filters through
//! [`Netqueue`], in its own identifier space. Calls are forwarded to whatever
//! subset of [`QueueOps`](crate::driver::QueueOps) the driver implements.
//! The allocation table and filter reference counts sit behind one lock,
//! separate from the transmit locks, held for the whole operation.

mod filter;
mod id;
pub mod rss;

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{debug, warn};

pub use filter::{FilterHandle, RxFilter};
pub use id::{FilterId, HostQueueId, QueueId, QueueType};

use crate::api::{Features, FilterClass, NetqFeatures, QueueFeatures, Result};
use crate::driver::{
    AllocatedQueue, AppliedFilter, MAX_QUEUE_ATTRS, NetDriver, QueueAttr, ReallocArgs, RssParams,
};
use crate::errors::Error;
use crate::poll::{PollId, PollScheduler};
use crate::xmit::TxQueue;
use filter::{FilterTable, Release};

/// Version of the queue operation interface the shim speaks.
pub const NETQ_VERSION: (u16, u16) = (2, 0);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueState {
    Allocated,
    Reallocated,
}

/// One ring known to the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogicalQueue {
    pub host_id: HostQueueId,
    pub driver_id: QueueId,
    pub active: bool,
    pub poll: Option<PollId>,
    pub state: QueueState,
}

impl LogicalQueue {
    pub fn queue_type(&self) -> QueueType {
        self.driver_id.queue_type()
    }
}

/// What an allocation returns to the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueAllocation {
    pub queue: HostQueueId,
    pub poll: Option<PollId>,
}

#[derive(Clone, Debug)]
pub struct ReallocRequest<'a> {
    pub queue: HostQueueId,
    pub attrs: &'a [QueueAttr],
    pub remove: &'a [FilterId],
    pub apply: Option<RxFilter>,
}

#[derive(Debug, Default)]
struct Tables {
    queues: HashMap<HostQueueId, LogicalQueue>,
    filters: FilterTable,
    generation: u32,
}

impl Tables {
    /// `None` once every generation has been handed out.
    fn next_generation(&mut self) -> Option<u32> {
        // generation 0 is reserved for default queues
        self.generation = self.generation.checked_add(1)?;
        Some(self.generation)
    }
}

/// Per-device allocation state.
#[derive(Debug, Default)]
pub struct QueueManager {
    tables: Mutex<Tables>,
}

impl QueueManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(&self, id: HostQueueId) -> Option<LogicalQueue> {
        self.tables.lock().queues.get(&id).copied()
    }

    pub fn queues(&self) -> Vec<LogicalQueue> {
        self.tables.lock().queues.values().copied().collect()
    }

    pub fn filter_refs(&self, queue: HostQueueId, id: FilterId) -> Option<u32> {
        self.tables.lock().filters.refs(queue, id)
    }
}

/// Host-side queue operations bound to one device.
pub struct Netqueue<'a> {
    mgr: &'a QueueManager,
    driver: &'a dyn NetDriver,
    txqs: &'a [TxQueue],
    polls: &'a PollScheduler,
}

impl<'a> Netqueue<'a> {
    pub(crate) fn new(
        mgr: &'a QueueManager,
        driver: &'a dyn NetDriver,
        txqs: &'a [TxQueue],
        polls: &'a PollScheduler,
    ) -> Self {
        Self {
            mgr,
            driver,
            txqs,
            polls,
        }
    }

    fn ops(&self) -> Result<&'a dyn NetDriver> {
        if self.driver.features().contains(Features::NETQUEUE) {
            Ok(self.driver)
        } else {
            Err(Error::NotSupported)
        }
    }

    pub fn version(&self) -> Result<(u16, u16)> {
        let driver = self.ops()?.netq_version()?;
        debug!(?driver, shim = ?NETQ_VERSION, "netqueue version");
        Ok(driver)
    }

    pub fn features(&self) -> Result<NetqFeatures> {
        Ok(self.ops()?.netq_features()?)
    }

    pub fn queue_count(&self, ty: QueueType) -> Result<u16> {
        Ok(self.ops()?.queue_count(ty)?)
    }

    pub fn filter_count(&self, ty: QueueType) -> Result<u16> {
        Ok(self.ops()?.filter_count(ty)?)
    }

    pub fn alloc_queue(&self, ty: QueueType) -> Result<QueueAllocation> {
        self.alloc_queue_with_attr(ty, &[])
    }

    pub fn alloc_queue_with_attr(
        &self,
        ty: QueueType,
        attrs: &[QueueAttr],
    ) -> Result<QueueAllocation> {
        let ops = self.ops()?;
        check_attrs(attrs)?;
        let mut tables = self.mgr.tables.lock();
        let allocated = ops.alloc_queue(ty, attrs)?;
        self.register(&mut tables, allocated, QueueState::Allocated)
    }

    /// Records a queue the driver just allocated. A queue the shim cannot
    /// track is handed back to the driver.
    fn register(
        &self,
        tables: &mut Tables,
        allocated: AllocatedQueue,
        state: QueueState,
    ) -> Result<QueueAllocation> {
        let id = allocated.id;
        let Some(generation) = tables.next_generation() else {
            warn!(queue = ?id, "host queue ids exhausted, releasing");
            self.release_untracked(id);
            return Err(Error::QueueIdsExhausted);
        };
        let host_id = HostQueueId::new(generation, id);
        if id.queue_type() == QueueType::Tx {
            let mapped = self
                .txqs
                .get(id.index() as usize)
                .is_some_and(|txq| txq.map_to(host_id));
            if !mapped {
                warn!(queue = ?id, "tx queue index unusable, releasing");
                self.release_untracked(id);
                return Err(Error::InvalidQueue(u64::from(id.raw())));
            }
        } else if let Some(poll) = allocated.poll {
            self.polls.bind_queue(poll, Some(host_id));
        }
        tables.queues.insert(
            host_id,
            LogicalQueue {
                host_id,
                driver_id: id,
                active: true,
                poll: allocated.poll,
                state,
            },
        );
        debug!(queue = ?host_id, ?state, "queue allocated");
        Ok(QueueAllocation {
            queue: host_id,
            poll: allocated.poll,
        })
    }

    fn release_untracked(&self, id: QueueId) {
        if let Err(err) = self.driver.free_queue(id) {
            warn!(queue = ?id, %err, "releasing driver queue failed");
        }
    }

    /// Reprovisions a queue. Removed filters are not restored if the new
    /// allocation fails.
    pub fn realloc_queue_with_attr(
        &self,
        req: &ReallocRequest<'_>,
    ) -> Result<(QueueAllocation, Option<FilterHandle>)> {
        let ops = self.ops()?;
        check_attrs(req.attrs)?;
        let mut tables = self.mgr.tables.lock();
        let old = *tables
            .queues
            .get(&req.queue)
            .ok_or(Error::InvalidQueue(req.queue.raw()))?;

        let args = ReallocArgs {
            queue: old.driver_id,
            attrs: req.attrs,
            remove: req.remove,
            apply: req.apply.as_ref(),
        };
        match ops.realloc_queue(&args) {
            Ok((allocated, applied)) => {
                for fid in req.remove {
                    tables.filters.evict(req.queue, *fid);
                }
                self.retire(&mut tables, &old);
                let alloc = self.register(&mut tables, allocated, QueueState::Reallocated)?;
                let handle = match (req.apply, applied) {
                    (Some(filter), Some(applied)) => {
                        Some(tables.filters.insert(alloc.queue, filter, applied.id, applied.pair_tx))
                    }
                    _ => None,
                };
                Ok((alloc, handle))
            }
            Err(crate::driver::DriverError::NotSupported) => {
                self.realloc_stepwise(&mut tables, &old, req)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn realloc_stepwise(
        &self,
        tables: &mut Tables,
        old: &LogicalQueue,
        req: &ReallocRequest<'_>,
    ) -> Result<(QueueAllocation, Option<FilterHandle>)> {
        for fid in req.remove {
            let Some(entry) = tables.filters.evict(old.host_id, *fid) else {
                continue;
            };
            if entry.installed() {
                if let Err(err) = self.driver.remove_rx_filter(old.driver_id, *fid) {
                    tables.filters.restore(entry);
                    return Err(err.into());
                }
            }
        }
        self.release_driver_queue(tables, old)?;
        let allocated = match self.driver.alloc_queue(old.queue_type(), req.attrs) {
            Ok(allocated) => allocated,
            Err(err) => {
                warn!(queue = ?old.host_id, %err, "reallocation failed, removed filters are lost");
                return Err(err.into());
            }
        };
        let alloc = self.register(tables, allocated, QueueState::Reallocated)?;
        let handle = match req.apply {
            Some(filter) => Some(self.install(tables, alloc.queue, allocated.id, filter)?),
            None => None,
        };
        Ok((alloc, handle))
    }

    pub fn free_queue(&self, id: HostQueueId) -> Result<()> {
        self.ops()?;
        let mut tables = self.mgr.tables.lock();
        let queue = *tables
            .queues
            .get(&id)
            .ok_or(Error::InvalidQueue(id.raw()))?;
        self.release_driver_queue(&mut tables, &queue)
    }

    /// Unmaps, frees in the driver, then forgets the queue.
    fn release_driver_queue(&self, tables: &mut Tables, queue: &LogicalQueue) -> Result<()> {
        let txq = self.tx_ring(queue);
        if let Some(txq) = txq {
            txq.unmap(queue.host_id);
        }
        if let Err(err) = self.driver.free_queue(queue.driver_id) {
            if let Some(txq) = txq {
                txq.map_to(queue.host_id);
            }
            return Err(err.into());
        }
        self.retire(tables, queue);
        Ok(())
    }

    fn tx_ring(&self, queue: &LogicalQueue) -> Option<&'a TxQueue> {
        match queue.queue_type() {
            QueueType::Tx => self.txqs.get(queue.driver_id.index() as usize),
            QueueType::Rx => None,
        }
    }

    fn retire(&self, tables: &mut Tables, queue: &LogicalQueue) {
        if let Some(txq) = self.tx_ring(queue) {
            txq.unmap(queue.host_id);
        }
        if let Some(poll) = queue.poll {
            self.polls.bind_queue(poll, None);
        }
        let dropped = tables.filters.purge(queue.host_id);
        tables.queues.remove(&queue.host_id);
        debug!(queue = ?queue.host_id, dropped, "queue freed");
    }

    /// Looks up a queue, admitting default queues that were never
    /// allocated explicitly.
    fn lookup(&self, tables: &mut Tables, id: HostQueueId) -> Result<LogicalQueue> {
        if let Some(queue) = tables.queues.get(&id) {
            return Ok(*queue);
        }
        if id.generation() == 0 && id.driver_id().is_default() {
            let queue = LogicalQueue {
                host_id: id,
                driver_id: id.driver_id(),
                active: true,
                poll: None,
                state: QueueState::Allocated,
            };
            tables.queues.insert(id, queue);
            return Ok(queue);
        }
        Err(Error::InvalidQueue(id.raw()))
    }

    pub fn default_queue(&self, ty: QueueType) -> Result<HostQueueId> {
        let id = self.ops()?.default_queue(ty)?;
        let host_id = HostQueueId::new(0, id);
        let mut tables = self.mgr.tables.lock();
        self.lookup(&mut tables, host_id)?;
        Ok(host_id)
    }

    pub fn queue_vector(&self, id: HostQueueId) -> Result<u32> {
        let ops = self.ops()?;
        let queue = self.lookup(&mut self.mgr.tables.lock(), id)?;
        Ok(ops.queue_vector(queue.driver_id)?)
    }

    pub fn apply_filter(&self, queue: HostQueueId, filter: RxFilter) -> Result<FilterHandle> {
        self.ops()?;
        let mut tables = self.mgr.tables.lock();
        let logical = self.lookup(&mut tables, queue)?;
        if logical.queue_type() != QueueType::Rx {
            return Err(Error::InvalidQueue(queue.raw()));
        }
        self.install(&mut tables, queue, logical.driver_id, filter)
    }

    fn install(
        &self,
        tables: &mut Tables,
        queue: HostQueueId,
        driver_id: QueueId,
        filter: RxFilter,
    ) -> Result<FilterHandle> {
        if let Some(handle) = tables.filters.share(queue, &filter) {
            return Ok(handle);
        }
        if driver_id.is_default() && !self.default_queue_filtering() {
            // the default queue gets unmatched traffic anyway
            return Ok(tables.filters.insert_local(queue, filter));
        }
        let AppliedFilter { id, pair_tx } = self.driver.apply_rx_filter(driver_id, &filter)?;
        debug!(?queue, ?filter, ?id, "filter applied");
        Ok(tables.filters.insert(queue, filter, id, pair_tx))
    }

    fn default_queue_filtering(&self) -> bool {
        self.driver
            .netq_features()
            .is_ok_and(|f| f.contains(NetqFeatures::DEFAULT_QUEUE_FILTER))
    }

    pub fn remove_filter(&self, queue: HostQueueId, id: FilterId) -> Result<()> {
        self.ops()?;
        let mut tables = self.mgr.tables.lock();
        let logical = self.lookup(&mut tables, queue)?;
        match tables.filters.release(queue, id) {
            None => Err(Error::InvalidFilter(id.0)),
            Some(Release::StillShared) => Ok(()),
            Some(Release::Removed(entry)) if !entry.installed() => Ok(()),
            Some(Release::Removed(entry)) => {
                if let Err(err) = self.driver.remove_rx_filter(logical.driver_id, id) {
                    warn!(?queue, ?id, %err, "driver kept the filter");
                    tables.filters.restore(entry);
                    return Err(err.into());
                }
                debug!(?queue, ?id, "filter removed");
                Ok(())
            }
        }
    }

    pub fn set_tx_priority(&self, queue: HostQueueId, priority: u8) -> Result<()> {
        let ops = self.ops()?;
        let logical = self.lookup(&mut self.mgr.tables.lock(), queue)?;
        Ok(ops.set_tx_priority(logical.driver_id, priority)?)
    }

    pub fn enable_queue_features(&self, queue: HostQueueId, features: QueueFeatures) -> Result<()> {
        let ops = self.ops()?;
        let logical = self.lookup(&mut self.mgr.tables.lock(), queue)?;
        Ok(ops.enable_queue_features(logical.driver_id, features)?)
    }

    pub fn disable_queue_features(&self, queue: HostQueueId, features: QueueFeatures) -> Result<()> {
        let ops = self.ops()?;
        let logical = self.lookup(&mut self.mgr.tables.lock(), queue)?;
        Ok(ops.disable_queue_features(logical.driver_id, features)?)
    }

    pub fn supported_queue_features(&self, ty: QueueType) -> Result<QueueFeatures> {
        Ok(self.ops()?.supported_queue_features(ty)?)
    }

    pub fn supported_filter_classes(&self, ty: QueueType) -> Result<FilterClass> {
        Ok(self.ops()?.supported_filter_classes(ty)?)
    }

    pub fn rss_params(&self) -> Result<RssParams> {
        let params = self.ops()?.rss_params()?;
        rss::check_params(&params)?;
        Ok(params)
    }

    pub fn rss_init(&self, key: &[u8], table: &[u8]) -> Result<()> {
        let ops = self.ops()?;
        rss::check_key(key)?;
        rss::check_table(table)?;
        Ok(ops.rss_init(key, table)?)
    }

    pub fn rss_update_table(&self, table: &[u8]) -> Result<()> {
        let ops = self.ops()?;
        rss::check_table(table)?;
        Ok(ops.rss_update_table(table)?)
    }

    pub fn rss_table(&self) -> Result<Vec<u8>> {
        let ops = self.ops()?;
        let mut table = vec![0u8; rss::MAX_IND_TABLE_LEN];
        let len = ops.rss_table(&mut table)?;
        table.truncate(len.min(rss::MAX_IND_TABLE_LEN));
        Ok(table)
    }
}

fn check_attrs(attrs: &[QueueAttr]) -> Result<()> {
    if attrs.len() > MAX_QUEUE_ATTRS {
        return Err(Error::LimitExceeded {
            what: "queue attributes",
            len: attrs.len(),
            max: MAX_QUEUE_ATTRS,
        });
    }
    Ok(())
}
