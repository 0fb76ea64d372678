use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::lro::Lro;
use super::{NetPoll, PollCtx, PollId, RxSink};
use crate::api::NativePacket;
use crate::device::NetDevice;
use crate::host::{DeliveryFn, RxSource};
use crate::netqueue::HostQueueId;
use crate::stats::{QueueCounters, QueueStats};

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollState {
    /// Created, never run.
    Unused = 0,
    Idle,
    Scheduled,
    Running,
    /// Quiesced by a disable; can be enabled again.
    Disabled,
    /// Disable timed out while the callback was running. Terminal.
    ForceIdle,
}

impl PollState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => PollState::Unused,
            1 => PollState::Idle,
            2 => PollState::Scheduled,
            3 => PollState::Running,
            4 => PollState::Disabled,
            _ => PollState::ForceIdle,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisableOutcome {
    Quiesced,
    TimedOut,
}

/// One schedulable receive unit wrapping the driver's poll callback.
pub struct PollContext {
    id: PollId,
    weight: u32,
    queue: Option<u16>,
    state: AtomicU8,
    disabling: AtomicBool,
    /// Set when a schedule arrives while the callback runs.
    rearm: AtomicBool,
    vector: AtomicU32,
    host_queue: AtomicU64,
    net_poll: Arc<NetPoll>,
    pending: Mutex<Pending>,
    delivery: Option<DeliveryFn>,
    pub(crate) stats: QueueStats,
}

/// Packets received during the current callback.
#[derive(Debug)]
struct Pending {
    pkts: Vec<NativePacket>,
    lro: Option<Lro>,
}

impl std::fmt::Debug for PollContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollContext")
            .field("id", &self.id)
            .field("weight", &self.weight)
            .field("state", &self.state())
            .field("backup", &self.is_backup())
            .finish()
    }
}

impl PollContext {
    pub(super) fn new(
        id: PollId,
        weight: u32,
        queue: Option<u16>,
        net_poll: Arc<NetPoll>,
        delivery: Option<DeliveryFn>,
        lro: Option<Lro>,
    ) -> Self {
        Self {
            id,
            weight,
            queue,
            state: AtomicU8::new(PollState::Unused as u8),
            disabling: AtomicBool::new(false),
            rearm: AtomicBool::new(false),
            vector: AtomicU32::new(0),
            host_queue: AtomicU64::new(0),
            net_poll,
            pending: Mutex::new(Pending {
                pkts: Vec::new(),
                lro,
            }),
            delivery,
            stats: QueueStats::default(),
        }
    }

    pub fn id(&self) -> PollId {
        self.id
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    /// Driver rx ring this context drains.
    pub fn queue(&self) -> Option<u16> {
        self.queue
    }

    pub fn state(&self) -> PollState {
        PollState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_backup(&self) -> bool {
        self.net_poll.backup
    }

    /// Interrupt vector of the last schedule, 0 if none.
    pub fn vector(&self) -> u32 {
        self.vector.load(Ordering::Relaxed)
    }

    pub fn host_queue(&self) -> Option<HostQueueId> {
        HostQueueId::from_raw(self.host_queue.load(Ordering::Acquire))
    }

    pub(super) fn net_poll_active(&self) -> bool {
        !self.is_backup() && self.net_poll.is_active()
    }

    pub(super) fn take_net_poll(&self) -> bool {
        self.net_poll.take_active()
    }

    pub(crate) fn bind(&self, queue: Option<HostQueueId>) {
        self.host_queue
            .store(queue.map_or(0, |q| q.raw()), Ordering::Release);
    }

    pub fn stats(&self) -> QueueCounters {
        self.stats.snapshot()
    }

    fn transition(&self, from: PollState, to: PollState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::Acquire)
            .is_ok()
    }

    /// Marks the context runnable. Returns `true` only for the call that
    /// actually scheduled it; repeated calls before the run are no-ops.
    pub fn schedule(&self) -> bool {
        loop {
            if self.disabling.load(Ordering::Acquire) {
                return false;
            }
            if self.transition(PollState::Idle, PollState::Scheduled)
                || self.transition(PollState::Unused, PollState::Scheduled)
            {
                self.net_poll.activate();
                return true;
            }
            if self.state() != PollState::Running {
                return false;
            }
            self.rearm.store(true, Ordering::SeqCst);
            // still running: the callback's exit path sees the flag
            if self.state.load(Ordering::SeqCst) == PollState::Running as u8 {
                return false;
            }
        }
    }

    /// Schedules from an interrupt on `vector`.
    pub fn schedule_on(&self, vector: u32) -> bool {
        self.vector.store(vector, Ordering::Relaxed);
        self.schedule()
    }

    /// Runs the driver callback once if scheduled. Returns the work done.
    pub(crate) fn run(&self, dev: &NetDevice) -> usize {
        if !self.transition(PollState::Scheduled, PollState::Running) {
            return 0;
        }
        self.rearm.store(false, Ordering::SeqCst);

        let budget = self.weight as usize;
        let mut ctx = PollCtx::new(dev, self, RxSink::Context, budget);
        let work = dev.driver().poll(&mut ctx);
        let completed = ctx.completed();
        drop(ctx);
        if work > budget {
            warn!(poll = ?self.id, work, budget, "driver exceeded poll budget");
        }

        self.flush(dev);

        let next = if completed && !self.rearm.swap(false, Ordering::SeqCst) {
            PollState::Idle
        } else {
            PollState::Scheduled
        };
        if self.transition(PollState::Running, next) {
            if next == PollState::Scheduled {
                self.net_poll.activate();
            } else if self.rearm.swap(false, Ordering::SeqCst) {
                self.rearm_after_idle();
            }
        }
        work.min(budget)
    }

    /// A schedule raced with the exit from `Running`; run again.
    fn rearm_after_idle(&self) {
        if !self.disabling.load(Ordering::Acquire)
            && self.transition(PollState::Idle, PollState::Scheduled)
        {
            self.net_poll.activate();
        }
    }

    pub(crate) fn push_pending(&self, pkt: NativePacket, dev: &NetDevice) {
        let mut pending = self.pending.lock();
        let Pending { pkts, lro } = &mut *pending;
        match lro {
            Some(lro) => lro.receive(pkt, dev.mtu(), dev.pages(), pkts),
            None => pkts.push(pkt),
        }
    }

    /// Closes open aggregation sessions and hands everything received so
    /// far to the host.
    pub(crate) fn flush(&self, dev: &NetDevice) -> usize {
        let pkts = {
            let mut pending = self.pending.lock();
            let Pending { pkts, lro } = &mut *pending;
            if let Some(lro) = lro {
                lro.flush_all(dev.pages(), pkts);
            }
            mem::take(pkts)
        };
        let n = pkts.len();
        if n == 0 {
            return 0;
        }
        match &self.delivery {
            Some(deliver) => deliver(self.id, pkts),
            None => dev.host().deliver(RxSource::Poll(self.id), pkts),
        }
        n
    }

    /// Stops future scheduling and waits for a running callback to return.
    /// With `timeout_ticks` the wait is bounded; on expiry the context is
    /// forced into [`PollState::ForceIdle`].
    pub(crate) fn disable(&self, timeout_ticks: Option<u32>, tick: Duration) -> DisableOutcome {
        self.disabling.store(true, Ordering::Release);
        let mut left = timeout_ticks;
        let outcome = loop {
            let state = self.state();
            match state {
                PollState::Disabled | PollState::ForceIdle => break DisableOutcome::Quiesced,
                PollState::Running => {}
                _ => {
                    if self.transition(state, PollState::Disabled) {
                        break DisableOutcome::Quiesced;
                    }
                    continue;
                }
            }
            match left.as_mut() {
                Some(0) => {
                    self.state
                        .store(PollState::ForceIdle as u8, Ordering::Release);
                    break DisableOutcome::TimedOut;
                }
                Some(n) => *n -= 1,
                None => {}
            }
            thread::sleep(tick);
        };
        self.vector.store(0, Ordering::Relaxed);
        self.disabling.store(false, Ordering::Release);
        debug!(poll = ?self.id, ?outcome, "poll context disabled");
        outcome
    }

    /// Re-enables a quiesced context. A force-idled one stays off.
    pub(crate) fn enable(&self) -> bool {
        self.transition(PollState::Disabled, PollState::Idle)
    }
}
