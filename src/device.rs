//! One legacy driver instance as the host sees it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::api::{DescBox, DescPool, Features, NativePacket, PageAllocator, Result, VlanTag};
use crate::capabilities::CapabilityTable;
use crate::config::ShimFlags;
use crate::driver::{DriverError, NetDriver};
use crate::errors::Error;
use crate::host::{DeliveryFn, HostStack, RxSource};
use crate::netqueue::{HostQueueId, Netqueue, QueueManager};
use crate::poll::{DisableOutcome, PollContext, PollCtx, PollScheduler, PollState, RxSink, RxStatus};
use crate::stats::{DeviceCounters, QueueCounters, QueueStats};
use crate::throttle::throttled;
use crate::translate::{self, RxEnv};
use crate::xmit::{self, TxOutcome, TxQueue};

pub struct NetDevice {
    name: String,
    driver: Arc<dyn NetDriver>,
    host: Arc<dyn HostStack>,
    flags: ShimFlags,
    features: Features,
    capabilities: CapabilityTable,
    mtu: AtomicU32,
    open: AtomicBool,
    blocked: AtomicBool,
    panic_mode: AtomicBool,
    panic_sender: AtomicBool,
    /// Serializes administrative operations. Never taken on the datapath.
    admin: Mutex<()>,
    txqs: Box<[TxQueue]>,
    netq: QueueManager,
    polls: PollScheduler,
    descs: DescPool,
    pages: PageAllocator,
    debug_rx: Mutex<Vec<NativePacket>>,
    rx_direct: QueueStats,
    rx_released: Arc<AtomicU64>,
    watchdog_hits: AtomicU64,
}

impl std::fmt::Debug for NetDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetDevice")
            .field("name", &self.name)
            .field("features", &self.features)
            .field("mtu", &self.mtu())
            .field("open", &self.is_open())
            .field("blocked", &self.is_blocked())
            .finish()
    }
}

impl NetDevice {
    /// Binds `driver` to the host and registers its capabilities. The
    /// device starts closed with every tx ring stopped.
    pub fn new(
        name: impl Into<String>,
        driver: Arc<dyn NetDriver>,
        host: Arc<dyn HostStack>,
        flags: ShimFlags,
    ) -> Arc<Self> {
        let name = name.into();
        let features = driver.features();
        let capabilities = CapabilityTable::negotiate(features);
        host.register_capabilities(&name, &capabilities);
        let txqs = (0..flags.num_tx_queues.max(1))
            .map(|i| TxQueue::new(i, host.clone()))
            .collect();
        let lro = (flags.lro_max_aggr > 1 && !features.contains(Features::SW_LRO))
            .then_some(flags.lro_max_aggr);
        debug!(%name, ?features, caps = capabilities.len(), ?lro, "device created");
        Arc::new(Self {
            name,
            driver,
            host,
            features,
            capabilities,
            mtu: AtomicU32::new(flags.mtu),
            open: AtomicBool::new(false),
            blocked: AtomicBool::new(false),
            panic_mode: AtomicBool::new(false),
            panic_sender: AtomicBool::new(false),
            admin: Mutex::new(()),
            txqs,
            netq: QueueManager::new(),
            polls: PollScheduler::new(flags.max_net_polls, lro),
            descs: DescPool::new(flags.desc_pool_size),
            pages: PageAllocator::new(flags.page_limit),
            debug_rx: Mutex::new(Vec::new()),
            rx_direct: QueueStats::default(),
            rx_released: Arc::new(AtomicU64::new(0)),
            watchdog_hits: AtomicU64::new(0),
            flags,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn features(&self) -> Features {
        self.features
    }

    pub fn capabilities(&self) -> &CapabilityTable {
        &self.capabilities
    }

    pub fn flags(&self) -> &ShimFlags {
        &self.flags
    }

    pub fn mtu(&self) -> u32 {
        self.mtu.load(Ordering::Acquire)
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::Acquire)
    }

    pub fn in_panic_mode(&self) -> bool {
        self.panic_mode.load(Ordering::Acquire)
    }

    pub(crate) fn driver(&self) -> &dyn NetDriver {
        self.driver.as_ref()
    }

    pub(crate) fn host(&self) -> &dyn HostStack {
        self.host.as_ref()
    }

    pub(crate) fn desc_pool(&self) -> &DescPool {
        &self.descs
    }

    pub(crate) fn released_counter(&self) -> &Arc<AtomicU64> {
        &self.rx_released
    }

    pub(crate) fn push_debug_rx(&self, pkt: NativePacket) {
        self.debug_rx.lock().push(pkt);
    }

    /// Pages for receive buffers.
    pub fn pages(&self) -> &PageAllocator {
        &self.pages
    }

    /// A fresh descriptor from the device pool.
    pub fn alloc_desc(&self) -> Option<DescBox> {
        self.descs.alloc()
    }

    pub fn free_descriptors(&self) -> usize {
        self.descs.available()
    }

    pub fn tx_queues(&self) -> &[TxQueue] {
        &self.txqs
    }

    pub fn tx_queue(&self, index: u16) -> Option<&TxQueue> {
        self.txqs.get(index as usize)
    }

    pub fn polls(&self) -> &PollScheduler {
        &self.polls
    }

    pub fn queue_manager(&self) -> &QueueManager {
        &self.netq
    }

    /// Queue and filter operations in the host's id space.
    pub fn netqueue(&self) -> Netqueue<'_> {
        Netqueue::new(&self.netq, self.driver(), &self.txqs, &self.polls)
    }

    // -------- administration ------------------------------------------------

    pub fn open(&self) -> Result<()> {
        let _admin = self.admin.lock();
        if self.is_open() {
            return Ok(());
        }
        self.driver.open(self)?;
        self.open.store(true, Ordering::Release);
        info!(dev = %self.name, "device opened");
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        let _admin = self.admin.lock();
        if !self.is_open() {
            return Ok(());
        }
        self.driver.close(self)?;
        self.open.store(false, Ordering::Release);
        info!(dev = %self.name, "device closed");
        Ok(())
    }

    /// Stops the datapath and quiesces every poll context that has been
    /// used. Returns how many contexts had to be forced idle.
    pub fn block(&self) -> usize {
        let _admin = self.admin.lock();
        if self.blocked.swap(true, Ordering::AcqRel) {
            return 0;
        }
        let mut forced = 0;
        for ctx in self.polls.contexts() {
            if matches!(ctx.state(), PollState::Unused | PollState::ForceIdle) {
                continue;
            }
            let outcome = ctx.disable(
                Some(self.flags.disable_timeout_ticks),
                self.flags.disable_tick,
            );
            ctx.flush(self);
            match outcome {
                DisableOutcome::Quiesced => {
                    ctx.enable();
                }
                DisableOutcome::TimedOut => {
                    warn!(dev = %self.name, poll = %ctx.id(), "poll context did not quiesce, forced idle");
                    forced += 1;
                }
            }
        }
        info!(dev = %self.name, forced, "device blocked");
        forced
    }

    pub fn unblock(&self) {
        let _admin = self.admin.lock();
        if self.blocked.swap(false, Ordering::AcqRel) {
            info!(dev = %self.name, "device unblocked");
        }
    }

    pub fn set_mtu(&self, mtu: u32) -> Result<()> {
        let _admin = self.admin.lock();
        match self.driver.change_mtu(mtu) {
            Ok(()) | Err(DriverError::NotSupported) => {
                self.mtu.store(mtu, Ordering::Release);
                debug!(dev = %self.name, mtu, "mtu changed");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Transmit watchdog fired for ring `index`.
    pub fn tx_timeout(&self, index: u16) -> Result<()> {
        let txq = self.tx_queue(index).ok_or(Error::Failure("no such tx queue"))?;
        let _admin = self.admin.lock();
        let hits = self.watchdog_hits.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(dev = %self.name, queue = index, hits, "transmit timeout");
        match self.driver.tx_timeout(txq) {
            Ok(()) | Err(DriverError::NotSupported) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn ioctl(&self, cmd: u32, data: &mut [u8]) -> Result<i32> {
        let _admin = self.admin.lock();
        Ok(self.driver.ioctl(cmd, data)?)
    }

    pub fn vlan_filter_add(&self, vid: u16) -> Result<()> {
        self.vlan_filter(vid, true)
    }

    pub fn vlan_filter_remove(&self, vid: u16) -> Result<()> {
        self.vlan_filter(vid, false)
    }

    fn vlan_filter(&self, vid: u16, add: bool) -> Result<()> {
        if !VlanTag::new(vid, 0).is_valid() {
            return Err(Error::LimitExceeded {
                what: "vlan id",
                len: vid.into(),
                max: VlanTag::MAX_VALID_ID.into(),
            });
        }
        if !self.features.contains(Features::HW_VLAN_FILTER) {
            return Err(Error::NotSupported);
        }
        let _admin = self.admin.lock();
        if add {
            self.driver.vlan_rx_add_vid(vid)?;
        } else {
            self.driver.vlan_rx_kill_vid(vid)?;
        }
        Ok(())
    }

    // -------- poll contexts -------------------------------------------------

    /// Creates a poll context delivering to the host stack.
    pub fn napi_add(&self, weight: u32, queue: Option<u16>) -> Arc<PollContext> {
        self.polls.add(weight, queue, None)
    }

    /// Creates a poll context whose packets go to `delivery` instead.
    pub fn napi_add_with_delivery(
        &self,
        weight: u32,
        queue: Option<u16>,
        delivery: DeliveryFn,
    ) -> Arc<PollContext> {
        self.polls.add(weight, queue, Some(delivery))
    }

    pub fn napi_enable(&self, ctx: &PollContext) -> bool {
        ctx.enable()
    }

    /// Waits for the context to quiesce, then delivers what it queued.
    pub fn napi_disable(&self, ctx: &PollContext) {
        ctx.disable(None, self.flags.disable_tick);
        ctx.flush(self);
    }

    pub fn napi_del(&self, ctx: &PollContext) {
        if !matches!(ctx.state(), PollState::Disabled | PollState::ForceIdle) {
            ctx.disable(
                Some(self.flags.disable_timeout_ticks),
                self.flags.disable_tick,
            );
        }
        ctx.flush(self);
        self.polls.remove(ctx.id());
    }

    /// One pass over every active poll primitive.
    pub fn run_polls(&self) -> usize {
        self.polls.service(self)
    }

    /// Services polls until nothing is scheduled or `max_rounds` passes ran.
    pub fn run_polls_until_idle(&self, max_rounds: usize) -> usize {
        let mut work = 0;
        for _ in 0..max_rounds {
            if !self.polls.has_work() {
                break;
            }
            work += self.polls.service(self);
        }
        work
    }

    // -------- receive outside polling -----------------------------------------

    /// Receives one descriptor outside any poll context and delivers it
    /// right away.
    pub fn netif_rx(&self, desc: DescBox) -> RxStatus {
        let env = RxEnv {
            blocked: self.is_blocked(),
            queue: None,
            released: &self.rx_released,
            cookie: 0,
        };
        let len = u64::from(desc.len());
        match translate::to_native(desc, &env) {
            Ok(pkt) => {
                self.rx_direct.record(len);
                if self.in_panic_mode() {
                    self.push_debug_rx(pkt);
                } else {
                    self.host.deliver(RxSource::Direct, vec![pkt]);
                }
                RxStatus::Accepted
            }
            Err(reason) => {
                self.rx_direct.drop_n(1);
                throttled!(debug, %reason, dev = %self.name, "dropping rx descriptor");
                RxStatus::Dropped
            }
        }
    }

    // -------- panic paths ---------------------------------------------------

    pub(crate) fn set_panic_mode(&self, on: bool) {
        self.panic_mode.store(on, Ordering::Release);
    }

    /// Runs every poll callback once with `budget`, without touching the
    /// context state machines. Received packets are kept for
    /// [`flush_rx_buffers`](Self::flush_rx_buffers).
    pub fn panic_poll(&self, budget: usize) -> usize {
        let mut work = 0;
        for napi in self.polls.contexts() {
            let mut ctx = PollCtx::new(self, &napi, RxSink::Debug, budget);
            work += self.driver.poll(&mut ctx).min(budget);
        }
        work
    }

    pub fn flush_rx_buffers(&self) -> Vec<NativePacket> {
        std::mem::take(&mut *self.debug_rx.lock())
    }

    // -------- transmit ------------------------------------------------------

    pub fn transmit(&self, queue: Option<HostQueueId>, pkts: Vec<NativePacket>) -> TxOutcome {
        xmit::dispatch(self, queue, pkts)
    }

    /// Transmit from the panic path. Only allowed in panic mode, with no
    /// other sender of either kind on the ring; it never waits for the lock.
    pub fn transmit_panic(
        &self,
        queue: Option<HostQueueId>,
        pkts: Vec<NativePacket>,
    ) -> Result<TxOutcome> {
        if !self.in_panic_mode() {
            return Err(Error::PanicPrecondition("device not in panic mode"));
        }
        if self
            .panic_sender
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::PanicPrecondition("another panic sender is active"));
        }
        let outcome = xmit::try_dispatch(self, queue, pkts);
        self.panic_sender.store(false, Ordering::Release);
        outcome.map_err(|_| Error::PanicPrecondition("ring held by a regular sender"))
    }

    // -------- counters ------------------------------------------------------

    pub fn counters(&self) -> DeviceCounters {
        let mut rx = self.rx_direct.snapshot();
        for ctx in self.polls.contexts() {
            rx += ctx.stats();
        }
        let mut tx = QueueCounters::default();
        for txq in self.txqs.iter() {
            tx += txq.stats();
        }
        DeviceCounters {
            rx,
            tx,
            rx_released: self.rx_released.load(Ordering::Relaxed),
            watchdog_hits: self.watchdog_hits.load(Ordering::Relaxed),
        }
    }
}
