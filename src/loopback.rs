//! A legacy-model driver that wires its transmit rings back into its own
//! receive rings.
//!
//! Frames are steered to an rx ring by destination MAC filter, falling back
//! to the RSS table and then to ring 0. Each rx ring is serviced by one poll
//! context created at open. Transmitted descriptors stay in flight until
//! [`Loopback::reap`], which also wakes stopped tx rings.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use eui48::MacAddress;
use parking_lot::Mutex;
use ringbuf::HeapRb;
use ringbuf::traits::{Consumer, Observer, Producer};
use tracing::{debug, trace};

use crate::api::{
    CsumState, DescBox, EncapOffload, Features, FilterClass, GsoKind, GsoParams, NativePacket,
    NetqFeatures, OffsetOffload, QueueFeatures, RssHash, RssHashType, VlanTag,
};
use crate::capabilities::CapabilityTable;
use crate::device::NetDevice;
use crate::driver::{
    AllocatedQueue, AppliedFilter, DriverError, DriverResult, NetDriver, QueueAttr, QueueOps,
    ReallocArgs, RssParams, XmitStatus,
};
use crate::host::{HostStack, RxSource};
use crate::netqueue::{FilterId, HostQueueId, QueueId, QueueType, RxFilter};
use crate::netqueue::rss::{MAX_IND_TABLE_LEN, MAX_KEY_LEN};
use crate::poll::{PollContext, PollCtx, PollId};
use crate::xmit::TxQueue;

/// Bytes of a received frame placed in the descriptor head.
const HEAD_LEN: usize = 128;
const FRAG_SIZE: usize = 4096;
const VECTOR_BASE: u32 = 0x20;

/// Reads the link state into `data[0]`.
pub const IOCTL_GET_LINK: u32 = 0x8946;

/// -------- Flags ------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct LoopbackFlags {
    /// Rx rings including the default ring 0.
    pub rx_queues: u16,
    /// Tx rings including the default ring 0. Match `ShimFlags::num_tx_queues`.
    pub tx_queues: u16,
    pub ring_size: usize,
    /// Descriptors in flight before a tx ring stops.
    pub tx_slots: usize,
    pub weight: u32,
    pub filters_per_queue: u16,
    pub features: Features,
    /// Implement queue reallocation natively instead of leaving it to the
    /// shim's stepwise fallback.
    pub native_realloc: bool,
}

impl Default for LoopbackFlags {
    fn default() -> Self {
        Self {
            rx_queues: 4,
            tx_queues: 1,
            ring_size: 256,
            tx_slots: 256,
            weight: 64,
            filters_per_queue: 8,
            features: Features::SG
                | Features::IP_CSUM
                | Features::IPV6_CSUM
                | Features::TSO
                | Features::HW_VLAN_TX
                | Features::HW_VLAN_RX
                | Features::HW_VLAN_FILTER
                | Features::RXHASH
                | Features::NETQUEUE,
            native_realloc: false,
        }
    }
}

/// Scripted outcome for the next transmit calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    Busy,
    Fail,
}

/// What the driver saw in one accepted descriptor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxRecord {
    pub queue: u16,
    pub len: u32,
    pub nr_frags: usize,
    pub gso: GsoParams,
    pub csum: CsumState,
    pub vlan: Option<VlanTag>,
    pub encap: Option<EncapOffload>,
    pub offset_offload: Option<OffsetOffload>,
}

#[derive(Debug)]
struct WireFrame {
    bytes: Vec<u8>,
    vlan: Option<VlanTag>,
    lro_mss: Option<u16>,
}

#[derive(Clone, Copy, Debug)]
struct SteerEntry {
    id: FilterId,
    queue: u16,
    mac: MacAddress,
    vlan: Option<u16>,
}

#[derive(Debug, Default)]
struct QueueSlot {
    used: bool,
    priority: u8,
    features: QueueFeatures,
}

#[derive(Debug, Default)]
struct Rss {
    key: Vec<u8>,
    table: Vec<u8>,
}

pub struct Loopback {
    flags: LoopbackFlags,
    rx_rings: Box<[Mutex<HeapRb<WireFrame>>]>,
    napis: Mutex<Vec<Arc<PollContext>>>,
    rx_table: Mutex<Vec<QueueSlot>>,
    tx_table: Mutex<Vec<QueueSlot>>,
    steer: Mutex<Vec<SteerEntry>>,
    next_filter: AtomicU32,
    rss: Mutex<Rss>,
    vlans: Mutex<Vec<u16>>,
    mtu: AtomicU32,
    faults: Mutex<VecDeque<Fault>>,
    failing_removals: AtomicUsize,
    inflight: Mutex<Vec<DescBox>>,
    records: Mutex<Vec<TxRecord>>,
    xmit_calls: AtomicUsize,
    wire_drops: AtomicUsize,
    timeouts: AtomicUsize,
}

impl Loopback {
    pub fn new(flags: LoopbackFlags) -> Self {
        let rx_queues = flags.rx_queues.max(1);
        let tx_queues = flags.tx_queues.max(1);
        let slots = |n: u16| (0..n).map(|_| QueueSlot::default()).collect::<Vec<_>>();
        Self {
            rx_rings: (0..rx_queues)
                .map(|_| Mutex::new(HeapRb::new(flags.ring_size.max(1))))
                .collect(),
            napis: Mutex::new(Vec::new()),
            rx_table: Mutex::new(slots(rx_queues)),
            tx_table: Mutex::new(slots(tx_queues)),
            steer: Mutex::new(Vec::new()),
            next_filter: AtomicU32::new(1),
            rss: Mutex::new(Rss::default()),
            vlans: Mutex::new(Vec::new()),
            mtu: AtomicU32::new(1500),
            faults: Mutex::new(VecDeque::new()),
            failing_removals: AtomicUsize::new(0),
            inflight: Mutex::new(Vec::new()),
            records: Mutex::new(Vec::new()),
            xmit_calls: AtomicUsize::new(0),
            wire_drops: AtomicUsize::new(0),
            timeouts: AtomicUsize::new(0),
            flags,
        }
    }

    fn rx_queues(&self) -> u16 {
        self.rx_rings.len() as u16
    }

    /// Queues outcomes for the next transmit calls, in order.
    pub fn inject(&self, fault: Fault) {
        self.faults.lock().push_back(fault);
    }

    /// Makes the next `n` filter removals fail with the filter left in place.
    pub fn fail_filter_removals(&self, n: usize) {
        self.failing_removals.store(n, Ordering::Relaxed);
    }

    pub fn xmit_calls(&self) -> usize {
        self.xmit_calls.load(Ordering::Relaxed)
    }

    pub fn records(&self) -> Vec<TxRecord> {
        self.records.lock().clone()
    }

    pub fn inflight(&self) -> usize {
        self.inflight.lock().len()
    }

    pub fn wire_drops(&self) -> usize {
        self.wire_drops.load(Ordering::Relaxed)
    }

    pub fn mtu(&self) -> u32 {
        self.mtu.load(Ordering::Relaxed)
    }

    pub fn timeouts(&self) -> usize {
        self.timeouts.load(Ordering::Relaxed)
    }

    pub fn poll_ids(&self) -> Vec<PollId> {
        self.napis.lock().iter().map(|n| n.id()).collect()
    }

    /// Transmit completion: releases every in-flight descriptor and wakes
    /// the tx rings.
    pub fn reap(&self, dev: &NetDevice) -> usize {
        let done: Vec<DescBox> = std::mem::take(&mut *self.inflight.lock());
        let n = done.len();
        drop(done);
        for txq in dev.tx_queues() {
            txq.wake();
        }
        n
    }

    /// A frame arriving from the wire.
    pub fn wire_in(&self, frame: &[u8], vlan: Option<VlanTag>) -> bool {
        self.deliver_to_ring(WireFrame {
            bytes: frame.to_vec(),
            vlan,
            lro_mss: None,
        })
    }

    fn steer(&self, frame: &WireFrame) -> u16 {
        let dst = frame
            .bytes
            .get(..6)
            .and_then(|b| MacAddress::from_bytes(b).ok());
        let vid = frame.vlan.map(|t| t.id);
        if let Some(dst) = dst {
            let steer = self.steer.lock();
            let hit = steer
                .iter()
                .find(|e| e.mac == dst && (e.vlan.is_none() || e.vlan == vid));
            if let Some(entry) = hit {
                return entry.queue;
            }
        }
        let rss = self.rss.lock();
        if rss.table.is_empty() {
            return 0;
        }
        let hash = flow_hash(&frame.bytes) as usize;
        u16::from(rss.table[hash % rss.table.len()]) % self.rx_queues()
    }

    fn deliver_to_ring(&self, frame: WireFrame) -> bool {
        if self.flags.features.contains(Features::HW_VLAN_FILTER) {
            if let Some(tag) = frame.vlan {
                let vlans = self.vlans.lock();
                if !vlans.is_empty() && !vlans.contains(&tag.id) {
                    self.wire_drops.fetch_add(1, Ordering::Relaxed);
                    return false;
                }
            }
        }
        let queue = self.steer(&frame);
        if self.rx_rings[queue as usize].lock().try_push(frame).is_err() {
            self.wire_drops.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        trace!(queue, "frame on the wire");
        if let Some(napi) = self.napis.lock().get(queue as usize) {
            napi.schedule_on(VECTOR_BASE + u32::from(queue));
        }
        true
    }

    fn build_rx(&self, ctx: &PollCtx<'_>, frame: &WireFrame) -> Option<DescBox> {
        let mut desc = ctx.alloc_desc()?;
        let head_len = frame.bytes.len().min(HEAD_LEN);
        desc.set_head(ctx.alloc_page(&frame.bytes[..head_len])?, head_len as u32);
        for chunk in frame.bytes[head_len..].chunks(FRAG_SIZE) {
            let page = ctx.alloc_page(chunk)?;
            desc.add_rx_frag(page, 0, chunk.len() as u32).ok()?;
        }
        let features = self.flags.features;
        if features.intersects(Features::IP_CSUM | Features::HW_CSUM) {
            desc.csum = CsumState::Unnecessary;
        }
        if features.contains(Features::RXHASH) {
            desc.rss = Some(RssHash {
                value: flow_hash(&frame.bytes),
                kind: RssHashType::Opaque,
            });
        }
        if let (Some(tag), true) = (frame.vlan, features.contains(Features::HW_VLAN_RX)) {
            desc.set_vlan_tci(tag.tci());
        }
        if let (Some(mss), true) = (frame.lro_mss, features.contains(Features::LRO)) {
            desc.set_rx_gso(GsoKind::TcpV4, mss);
        }
        desc.queue_mapping = ctx.queue().unwrap_or(0);
        Some(desc)
    }

    fn pick(&self, slots: &mut [QueueSlot], attrs: &[QueueAttr]) -> DriverResult<u16> {
        let index = slots
            .iter()
            .enumerate()
            .skip(1)
            .find(|(_, s)| !s.used)
            .map(|(i, _)| i)
            .ok_or(DriverError::NoMemory)?;
        let slot = &mut slots[index];
        *slot = QueueSlot {
            used: true,
            ..QueueSlot::default()
        };
        for attr in attrs {
            match *attr {
                QueueAttr::Priority(p) => slot.priority = p,
                QueueAttr::Features(f) => slot.features |= f,
            }
        }
        Ok(index as u16)
    }

    fn slot<R>(&self, id: QueueId, f: impl FnOnce(&mut QueueSlot) -> R) -> DriverResult<R> {
        let mut slots = match id.queue_type() {
            QueueType::Rx => self.rx_table.lock(),
            QueueType::Tx => self.tx_table.lock(),
        };
        slots
            .get_mut(id.index() as usize)
            .map(f)
            .ok_or(DriverError::Status(-22))
    }
}

/// FNV-1a over the first 64 bytes of the frame.
fn flow_hash(frame: &[u8]) -> u32 {
    frame
        .iter()
        .take(64)
        .fold(0x811c_9dc5u32, |h, b| (h ^ u32::from(*b)).wrapping_mul(0x0100_0193))
}

impl QueueOps for Loopback {
    fn netq_version(&self) -> DriverResult<(u16, u16)> {
        Ok((2, 0))
    }

    fn netq_features(&self) -> DriverResult<NetqFeatures> {
        Ok(NetqFeatures::RX_QUEUES | NetqFeatures::TX_QUEUES)
    }

    fn queue_count(&self, ty: QueueType) -> DriverResult<u16> {
        Ok(match ty {
            QueueType::Rx => self.rx_queues() - 1,
            QueueType::Tx => self.tx_table.lock().len() as u16 - 1,
        })
    }

    fn filter_count(&self, ty: QueueType) -> DriverResult<u16> {
        match ty {
            QueueType::Rx => Ok(self.flags.filters_per_queue),
            QueueType::Tx => Ok(0),
        }
    }

    fn alloc_queue(&self, ty: QueueType, attrs: &[QueueAttr]) -> DriverResult<AllocatedQueue> {
        let index = match ty {
            QueueType::Rx => self.pick(&mut self.rx_table.lock(), attrs)?,
            QueueType::Tx => self.pick(&mut self.tx_table.lock(), attrs)?,
        };
        let poll = match ty {
            QueueType::Rx => self.napis.lock().get(index as usize).map(|n| n.id()),
            QueueType::Tx => None,
        };
        debug!(?ty, index, ?poll, "loopback queue allocated");
        Ok(AllocatedQueue {
            id: QueueId::new(ty, index),
            poll,
        })
    }

    fn free_queue(&self, id: QueueId) -> DriverResult<()> {
        if id.is_default() {
            return Err(DriverError::Status(-22));
        }
        self.slot(id, |s| *s = QueueSlot::default())?;
        if id.queue_type() == QueueType::Rx {
            self.steer.lock().retain(|e| e.queue != id.index());
        }
        Ok(())
    }

    fn realloc_queue(
        &self,
        args: &ReallocArgs<'_>,
    ) -> DriverResult<(AllocatedQueue, Option<AppliedFilter>)> {
        if !self.flags.native_realloc {
            return Err(DriverError::NotSupported);
        }
        for fid in args.remove {
            self.remove_rx_filter(args.queue, *fid)?;
        }
        self.free_queue(args.queue)?;
        let allocated = self.alloc_queue(args.queue.queue_type(), args.attrs)?;
        let applied = match args.apply {
            Some(filter) => Some(self.apply_rx_filter(allocated.id, filter)?),
            None => None,
        };
        Ok((allocated, applied))
    }

    fn queue_vector(&self, id: QueueId) -> DriverResult<u32> {
        self.slot(id, |_| VECTOR_BASE + u32::from(id.index()))
    }

    fn default_queue(&self, ty: QueueType) -> DriverResult<QueueId> {
        Ok(QueueId::new(ty, 0))
    }

    fn apply_rx_filter(&self, id: QueueId, filter: &RxFilter) -> DriverResult<AppliedFilter> {
        let (mac, vlan) = match *filter {
            RxFilter::Mac(mac) => (mac, None),
            RxFilter::VlanMac { mac, vlan } => (mac, Some(vlan)),
            _ => return Err(DriverError::NotSupported),
        };
        let paired = self.slot(id, |s| s.features.contains(QueueFeatures::PAIR))?;
        let mut steer = self.steer.lock();
        let installed = steer.iter().filter(|e| e.queue == id.index()).count();
        if installed >= usize::from(self.flags.filters_per_queue) {
            return Err(DriverError::NoMemory);
        }
        let fid = FilterId(self.next_filter.fetch_add(1, Ordering::Relaxed));
        steer.push(SteerEntry {
            id: fid,
            queue: id.index(),
            mac,
            vlan,
        });
        let pair_tx = (paired && usize::from(id.index()) < self.tx_table.lock().len())
            .then_some(id.index());
        Ok(AppliedFilter { id: fid, pair_tx })
    }

    fn remove_rx_filter(&self, id: QueueId, filter: FilterId) -> DriverResult<()> {
        if self
            .failing_removals
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(DriverError::Status(-16));
        }
        let mut steer = self.steer.lock();
        let before = steer.len();
        steer.retain(|e| !(e.id == filter && e.queue == id.index()));
        if steer.len() == before {
            return Err(DriverError::Status(-2));
        }
        Ok(())
    }

    fn set_tx_priority(&self, id: QueueId, priority: u8) -> DriverResult<()> {
        if id.queue_type() != QueueType::Tx {
            return Err(DriverError::Status(-22));
        }
        self.slot(id, |s| s.priority = priority)
    }

    fn enable_queue_features(&self, id: QueueId, features: QueueFeatures) -> DriverResult<()> {
        self.slot(id, |s| s.features |= features)
    }

    fn disable_queue_features(&self, id: QueueId, features: QueueFeatures) -> DriverResult<()> {
        self.slot(id, |s| s.features -= features)
    }

    fn supported_queue_features(&self, ty: QueueType) -> DriverResult<QueueFeatures> {
        Ok(match ty {
            QueueType::Rx => QueueFeatures::LRO | QueueFeatures::PAIR | QueueFeatures::RSS,
            QueueType::Tx => QueueFeatures::empty(),
        })
    }

    fn supported_filter_classes(&self, ty: QueueType) -> DriverResult<FilterClass> {
        match ty {
            QueueType::Rx => Ok(FilterClass::MAC | FilterClass::VLAN_MAC),
            QueueType::Tx => Err(DriverError::NotSupported),
        }
    }

    fn rss_params(&self) -> DriverResult<RssParams> {
        Ok(RssParams {
            num_queues: self.rx_queues(),
            key_len: MAX_KEY_LEN as u16,
            table_len: MAX_IND_TABLE_LEN as u16,
        })
    }

    fn rss_init(&self, key: &[u8], table: &[u8]) -> DriverResult<()> {
        let mut rss = self.rss.lock();
        rss.key = key.to_vec();
        rss.table = table.to_vec();
        Ok(())
    }

    fn rss_update_table(&self, table: &[u8]) -> DriverResult<()> {
        let mut rss = self.rss.lock();
        if rss.key.is_empty() {
            return Err(DriverError::Status(-22));
        }
        rss.table = table.to_vec();
        Ok(())
    }

    fn rss_table(&self, table: &mut [u8]) -> DriverResult<usize> {
        let rss = self.rss.lock();
        let n = rss.table.len().min(table.len());
        table[..n].copy_from_slice(&rss.table[..n]);
        Ok(n)
    }
}

impl NetDriver for Loopback {
    fn features(&self) -> Features {
        self.flags.features
    }

    fn open(&self, dev: &NetDevice) -> DriverResult<()> {
        let mut napis = self.napis.lock();
        if napis.is_empty() {
            for queue in 0..self.rx_queues() {
                napis.push(dev.napi_add(self.flags.weight, Some(queue)));
            }
        } else {
            for napi in napis.iter() {
                dev.napi_enable(napi);
            }
        }
        for txq in dev.tx_queues() {
            txq.wake();
        }
        Ok(())
    }

    fn close(&self, dev: &NetDevice) -> DriverResult<()> {
        for txq in dev.tx_queues() {
            txq.stop();
        }
        for napi in self.napis.lock().iter() {
            dev.napi_disable(napi);
        }
        self.reap(dev);
        Ok(())
    }

    fn start_xmit(&self, desc: DescBox, txq: &TxQueue) -> XmitStatus {
        self.xmit_calls.fetch_add(1, Ordering::Relaxed);
        match self.faults.lock().pop_front() {
            Some(Fault::Busy) => return XmitStatus::Busy(desc),
            Some(Fault::Fail) => return XmitStatus::Failed(desc),
            None => {}
        }

        let mut inflight = self.inflight.lock();
        if inflight.len() >= self.flags.tx_slots {
            txq.stop();
            return XmitStatus::Busy(desc);
        }
        self.records.lock().push(TxRecord {
            queue: txq.index(),
            len: desc.len(),
            nr_frags: desc.nr_frags(),
            gso: desc.gso,
            csum: desc.csum,
            vlan: desc.vlan,
            encap: desc.encap,
            offset_offload: desc.offset_offload,
        });
        let frame = WireFrame {
            bytes: desc.linearize(),
            vlan: desc.vlan,
            lro_mss: (desc.gso.kind == GsoKind::TcpV4).then_some(desc.gso.size),
        };
        inflight.push(desc);
        if inflight.len() >= self.flags.tx_slots {
            txq.stop();
        }
        drop(inflight);
        self.deliver_to_ring(frame);
        XmitStatus::Ok
    }

    fn poll(&self, ctx: &mut PollCtx<'_>) -> usize {
        let queue = usize::from(ctx.queue().unwrap_or(0));
        let Some(ring) = self.rx_rings.get(queue) else {
            ctx.complete();
            return 0;
        };
        let mut work = 0;
        while work < ctx.budget() {
            let Some(frame) = ring.lock().try_pop() else {
                ctx.complete();
                break;
            };
            work += 1;
            match self.build_rx(ctx, &frame) {
                Some(desc) => {
                    ctx.receive(desc);
                }
                None => {
                    self.wire_drops.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        if work == ctx.budget() && ring.lock().is_empty() {
            ctx.complete();
        }
        work
    }

    fn ioctl(&self, cmd: u32, data: &mut [u8]) -> DriverResult<i32> {
        match (cmd, data.first_mut()) {
            (IOCTL_GET_LINK, Some(byte)) => {
                *byte = 1;
                Ok(0)
            }
            _ => Err(DriverError::NotSupported),
        }
    }

    fn change_mtu(&self, mtu: u32) -> DriverResult<()> {
        if !(68..=9000).contains(&mtu) {
            return Err(DriverError::Status(-22));
        }
        self.mtu.store(mtu, Ordering::Relaxed);
        Ok(())
    }

    fn tx_timeout(&self, txq: &TxQueue) -> DriverResult<()> {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
        self.inflight.lock().clear();
        txq.wake();
        Ok(())
    }

    fn vlan_rx_add_vid(&self, vid: u16) -> DriverResult<()> {
        let mut vlans = self.vlans.lock();
        if !vlans.contains(&vid) {
            vlans.push(vid);
        }
        Ok(())
    }

    fn vlan_rx_kill_vid(&self, vid: u16) -> DriverResult<()> {
        self.vlans.lock().retain(|v| *v != vid);
        Ok(())
    }
}

/// A host stack that keeps everything it is given.
#[derive(Default)]
pub struct SinkHost {
    delivered: Mutex<Vec<(RxSource, NativePacket)>>,
    tx_events: Mutex<Vec<(HostQueueId, bool)>>,
    capabilities: Mutex<Vec<(String, CapabilityTable)>>,
}

impl SinkHost {
    pub fn take(&self) -> Vec<NativePacket> {
        std::mem::take(&mut *self.delivered.lock())
            .into_iter()
            .map(|(_, pkt)| pkt)
            .collect()
    }

    pub fn take_with_source(&self) -> Vec<(RxSource, NativePacket)> {
        std::mem::take(&mut *self.delivered.lock())
    }

    pub fn delivered(&self) -> usize {
        self.delivered.lock().len()
    }

    pub fn tx_events(&self) -> Vec<(HostQueueId, bool)> {
        self.tx_events.lock().clone()
    }

    pub fn capabilities(&self, device: &str) -> Option<CapabilityTable> {
        self.capabilities
            .lock()
            .iter()
            .find(|(name, _)| name == device)
            .map(|(_, caps)| caps.clone())
    }
}

impl HostStack for SinkHost {
    fn deliver(&self, source: RxSource, pkts: Vec<NativePacket>) {
        self.delivered
            .lock()
            .extend(pkts.into_iter().map(|pkt| (source, pkt)));
    }

    fn tx_queue_state(&self, queue: HostQueueId, stopped: bool) {
        self.tx_events.lock().push((queue, stopped));
    }

    fn register_capabilities(&self, device: &str, caps: &CapabilityTable) {
        self.capabilities
            .lock()
            .push((device.to_string(), caps.clone()));
    }
}
