//! Poll scheduling.
//!
//! Each receive context owns a dedicated host poll primitive ([`NetPoll`])
//! while the device has some left; later contexts share one backup
//! primitive and are drained one at a time under the backup lock.

mod context;
mod lro;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::{debug, warn};

pub use context::{DisableOutcome, PollContext, PollState};

use crate::api::{DescBox, PageRef};
use crate::device::NetDevice;
use crate::host::DeliveryFn;
use crate::netqueue::HostQueueId;
use crate::throttle::throttled;
use crate::translate::{self, RxEnv};
use lro::Lro;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PollId(pub u32);

impl fmt::Display for PollId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "poll{}", self.0)
    }
}

/// A host poll primitive. Activation is a level, taken by the runner.
#[derive(Debug)]
pub(crate) struct NetPoll {
    backup: bool,
    active: AtomicBool,
}

impl NetPoll {
    pub(crate) fn new(backup: bool) -> Self {
        Self {
            backup,
            active: AtomicBool::new(false),
        }
    }

    pub(crate) fn activate(&self) {
        self.active.store(true, Ordering::Release);
    }

    pub(crate) fn take_active(&self) -> bool {
        self.active.swap(false, Ordering::AcqRel)
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RxStatus {
    Accepted,
    Dropped,
}

/// Where translated packets go during a callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RxSink {
    /// Queued on the context, delivered once the callback returns.
    Context,
    /// Panic-time polling: kept on the device debug list.
    Debug,
}

/// Handle passed to the driver's poll callback.
pub struct PollCtx<'a> {
    dev: &'a NetDevice,
    napi: &'a PollContext,
    sink: RxSink,
    budget: usize,
    completed: bool,
}

impl<'a> PollCtx<'a> {
    pub(crate) fn new(
        dev: &'a NetDevice,
        napi: &'a PollContext,
        sink: RxSink,
        budget: usize,
    ) -> Self {
        Self {
            dev,
            napi,
            sink,
            budget,
            completed: false,
        }
    }

    /// Fixed at context creation.
    pub fn budget(&self) -> usize {
        self.budget
    }

    pub fn id(&self) -> PollId {
        self.napi.id()
    }

    pub fn queue(&self) -> Option<u16> {
        self.napi.queue()
    }

    pub fn device(&self) -> &'a NetDevice {
        self.dev
    }

    pub fn alloc_desc(&self) -> Option<DescBox> {
        self.dev.alloc_desc()
    }

    pub fn alloc_page(&self, data: &[u8]) -> Option<PageRef> {
        self.dev.pages().alloc(data)
    }

    /// Hands one received descriptor to the shim.
    pub fn receive(&mut self, desc: DescBox) -> RxStatus {
        let env = RxEnv {
            blocked: self.dev.is_blocked(),
            queue: self.napi.host_queue(),
            released: self.dev.released_counter(),
            cookie: u64::from(self.napi.id().0),
        };
        let len = u64::from(desc.len());
        match translate::to_native(desc, &env) {
            Ok(pkt) => {
                self.napi.stats.record(len);
                match self.sink {
                    RxSink::Context => self.napi.push_pending(pkt, self.dev),
                    RxSink::Debug => self.dev.push_debug_rx(pkt),
                }
                RxStatus::Accepted
            }
            Err(reason) => {
                self.napi.stats.drop_n(1);
                throttled!(debug, %reason, poll = %self.napi.id(), "dropping rx descriptor");
                RxStatus::Dropped
            }
        }
    }

    /// Ring drained; the context goes idle unless rescheduled meanwhile.
    pub fn complete(&mut self) {
        self.completed = true;
    }

    pub(crate) fn completed(&self) -> bool {
        self.completed
    }
}

/// Per-device set of poll contexts.
pub struct PollScheduler {
    contexts: Mutex<Vec<Arc<PollContext>>>,
    backup: Arc<NetPoll>,
    backup_lock: Mutex<()>,
    dedicated: AtomicUsize,
    capacity: usize,
    next_id: AtomicU32,
    /// Segments merged per frame by software aggregation, `None` when off.
    lro_max_aggr: Option<u32>,
}

impl PollScheduler {
    /// `capacity` dedicated host poll primitives are available.
    pub(crate) fn new(capacity: usize, lro_max_aggr: Option<u32>) -> Self {
        Self {
            contexts: Mutex::new(Vec::new()),
            backup: Arc::new(NetPoll::new(true)),
            backup_lock: Mutex::new(()),
            dedicated: AtomicUsize::new(0),
            capacity,
            next_id: AtomicU32::new(1),
            lro_max_aggr,
        }
    }

    fn claim_dedicated(&self) -> bool {
        self.dedicated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .is_ok()
    }

    pub(crate) fn add(
        &self,
        weight: u32,
        queue: Option<u16>,
        delivery: Option<DeliveryFn>,
    ) -> Arc<PollContext> {
        let id = PollId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let net_poll = if self.claim_dedicated() {
            Arc::new(NetPoll::new(false))
        } else {
            warn!(poll = %id, "out of poll primitives, falling back to backup poll");
            self.backup.clone()
        };
        let ctx = Arc::new(PollContext::new(
            id,
            weight.max(1),
            queue,
            net_poll,
            delivery,
            self.lro_max_aggr.map(Lro::new),
        ));
        self.contexts.lock().push(ctx.clone());
        debug!(poll = %id, weight, ?queue, backup = ctx.is_backup(), "poll context added");
        ctx
    }

    pub(crate) fn remove(&self, id: PollId) -> Option<Arc<PollContext>> {
        let mut contexts = self.contexts.lock();
        let pos = contexts.iter().position(|c| c.id() == id)?;
        let ctx = contexts.remove(pos);
        if !ctx.is_backup() {
            self.dedicated.fetch_sub(1, Ordering::AcqRel);
        }
        Some(ctx)
    }

    pub fn get(&self, id: PollId) -> Option<Arc<PollContext>> {
        self.contexts.lock().iter().find(|c| c.id() == id).cloned()
    }

    pub fn contexts(&self) -> Vec<Arc<PollContext>> {
        self.contexts.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.contexts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn bind_queue(&self, id: PollId, queue: Option<HostQueueId>) {
        match self.get(id) {
            Some(ctx) => ctx.bind(queue),
            None => warn!(poll = %id, "binding queue to unknown poll context"),
        }
    }

    /// Whether any primitive has pending work.
    pub fn has_work(&self) -> bool {
        self.backup.is_active() || self.contexts.lock().iter().any(|c| c.net_poll_active())
    }

    /// One pass of the host scheduler: every active dedicated primitive
    /// runs its context once, then the backup primitive drains its
    /// scheduled contexts one after another.
    pub(crate) fn service(&self, dev: &NetDevice) -> usize {
        let contexts = self.contexts();
        let mut work = 0;
        for ctx in contexts.iter().filter(|c| !c.is_backup()) {
            if ctx.take_net_poll() {
                work += ctx.run(dev);
            }
        }
        if self.backup.take_active() {
            let _serial = self.backup_lock.lock();
            for ctx in contexts.iter().filter(|c| c.is_backup()) {
                work += ctx.run(dev);
            }
        }
        work
    }
}
