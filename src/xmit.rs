//! Transmit dispatch.
//!
//! A batch of host packets is pushed through one tx ring under that ring's
//! lock. Per packet: blocked check, stopped check, translation, driver
//! call. Packets the driver could not take yet come back as `retry`, in
//! order; packets that can never be sent are dropped and counted.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use crate::api::NativePacket;
use crate::api::hint::unlikely;
use crate::device::NetDevice;
use crate::driver::XmitStatus;
use crate::host::HostStack;
use crate::netqueue::{HostQueueId, QueueId, QueueType};
use crate::stats::{QueueCounters, QueueStats};
use crate::throttle::throttled;
use crate::translate::{self, TxDrop, TxEnv};

/// One transmit ring of a device.
pub struct TxQueue {
    index: u16,
    xmit_lock: Mutex<()>,
    stopped: AtomicBool,
    /// Raw host queue id mapped to this ring, 0 when unmapped.
    mapped: AtomicU64,
    stats: QueueStats,
    host: Arc<dyn HostStack>,
}

impl TxQueue {
    pub(crate) fn new(index: u16, host: Arc<dyn HostStack>) -> Self {
        Self {
            index,
            xmit_lock: Mutex::new(()),
            stopped: AtomicBool::new(true),
            mapped: AtomicU64::new(0),
            stats: QueueStats::default(),
            host,
        }
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Stops the ring. Called by the driver when it runs out of slots.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            self.notify(true);
        }
    }

    pub fn wake(&self) {
        if self.stopped.swap(false, Ordering::AcqRel) {
            self.notify(false);
        }
    }

    fn notify(&self, stopped: bool) {
        let queue = self
            .mapped()
            .or_else(|| (self.index == 0).then(|| HostQueueId::new(0, QueueId::tx(0))));
        if let Some(queue) = queue {
            self.host.tx_queue_state(queue, stopped);
        }
    }

    pub fn mapped(&self) -> Option<HostQueueId> {
        HostQueueId::from_raw(self.mapped.load(Ordering::Acquire))
    }

    pub(crate) fn map_to(&self, queue: HostQueueId) -> bool {
        self.mapped
            .compare_exchange(0, queue.raw(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn unmap(&self, queue: HostQueueId) {
        let _ = self
            .mapped
            .compare_exchange(queue.raw(), 0, Ordering::AcqRel, Ordering::Acquire);
    }

    pub fn stats(&self) -> QueueCounters {
        self.stats.snapshot()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxStatus {
    Ok,
    /// Ring stopped or driver busy; `retry` holds the remainder.
    Busy,
    /// The driver refused a packet; `retry` holds the remainder.
    Failure,
    /// The device is blocked; everything was dropped.
    Disabled,
}

#[derive(Debug)]
pub struct TxOutcome {
    pub status: TxStatus,
    pub sent: usize,
    pub dropped: usize,
    /// Untransmitted packets in their original order.
    pub retry: Vec<NativePacket>,
}

/// Maps a host queue id to a ring, falling back to ring 0.
pub(crate) fn select_queue(txqs: &[TxQueue], queue: Option<HostQueueId>) -> &TxQueue {
    let index = queue
        .filter(|q| q.queue_type() == QueueType::Tx)
        .and_then(|q| {
            let index = q.driver_id().index() as usize;
            (txqs.get(index)?.mapped() == Some(q)).then_some(index)
        })
        .unwrap_or(0);
    &txqs[index]
}

/// Runs one batch under the ring lock.
pub(crate) fn dispatch(
    dev: &NetDevice,
    queue: Option<HostQueueId>,
    pkts: Vec<NativePacket>,
) -> TxOutcome {
    let txq = select_queue(dev.tx_queues(), queue);
    let _guard = txq.xmit_lock.lock();
    run_batch(dev, txq, pkts)
}

/// Like [`dispatch`] but never waits: if another sender holds the ring the
/// batch is handed back untouched.
pub(crate) fn try_dispatch(
    dev: &NetDevice,
    queue: Option<HostQueueId>,
    pkts: Vec<NativePacket>,
) -> Result<TxOutcome, Vec<NativePacket>> {
    let txq = select_queue(dev.tx_queues(), queue);
    let Some(_guard) = txq.xmit_lock.try_lock() else {
        return Err(pkts);
    };
    Ok(run_batch(dev, txq, pkts))
}

fn run_batch(dev: &NetDevice, txq: &TxQueue, pkts: Vec<NativePacket>) -> TxOutcome {
    let env = TxEnv {
        pool: dev.desc_pool(),
        mtu: dev.mtu(),
        features: dev.features(),
    };

    let mut pending: VecDeque<NativePacket> = pkts.into();
    let mut freed = Vec::new();
    let mut status = TxStatus::Ok;
    let mut sent = 0;

    while let Some(pkt) = pending.pop_front() {
        if unlikely(dev.is_blocked()) {
            freed.push(pkt);
            freed.extend(pending.drain(..));
            status = TxStatus::Disabled;
            break;
        }
        if txq.is_stopped() {
            pending.push_front(pkt);
            status = TxStatus::Busy;
            break;
        }

        let len = u64::from(pkt.frame_len());
        let desc = match translate::to_desc(pkt, txq.index(), &env) {
            Ok(desc) => desc,
            Err(TxDrop { reason, pkt }) => {
                throttled!(debug, %reason, queue = txq.index(), "dropping tx packet");
                freed.push(pkt);
                continue;
            }
        };

        let (refused, outcome) = match dev.driver().start_xmit(desc, txq) {
            XmitStatus::Ok => {
                txq.stats.record(len);
                sent += 1;
                continue;
            }
            XmitStatus::Busy(desc) => (desc, TxStatus::Busy),
            XmitStatus::Failed(desc) => (desc, TxStatus::Failure),
        };
        let mut refused = refused;
        if let Some(pkt) = refused.take_packet() {
            pending.push_front(pkt);
        }
        debug!(queue = txq.index(), ?outcome, "driver refused packet");
        status = outcome;
        break;
    }

    let dropped = freed.len();
    if dropped > 0 {
        txq.stats.drop_n(dropped as u64);
    }
    TxOutcome {
        status,
        sent,
        dropped,
        retry: pending.into(),
    }
}
