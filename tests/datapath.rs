use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use eui48::MacAddress;
use etherparse::PacketBuilder;
use proptest::prelude::*;
use rand::Rng;
use rand::seq::SliceRandom;

use netshim::api::{CsumState, DescBox, Features, GsoKind, NativePacket, VlanTag};
use netshim::driver::{DriverResult, NetDriver, QueueOps, XmitStatus};
use netshim::loopback::{Fault, IOCTL_GET_LINK, Loopback, LoopbackFlags, SinkHost};
use netshim::netqueue::{HostQueueId, QueueId, QueueType, ReallocRequest, RxFilter};
use netshim::poll::{PollCtx, PollId, PollState, RxStatus};
use netshim::xmit::{TxQueue, TxStatus};
use netshim::{Error, NetDevice, Registry, RxSource, ShimFlags};

const SRC: [u8; 6] = [0x02, 0, 0, 0, 0, 0x01];
const DST: [u8; 6] = [0x02, 0, 0, 0, 0, 0x02];
const OTHER: [u8; 6] = [0x02, 0, 0, 0, 0, 0x03];

fn tcp_frame(dst: [u8; 6], payload: usize) -> Vec<u8> {
    let builder = PacketBuilder::ethernet2(SRC, dst)
        .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
        .tcp(40000, 80, 1, 65535);
    let mut out = Vec::new();
    builder.write(&mut out, &vec![0x5a; payload]).unwrap();
    out
}

fn icmp_frame() -> Vec<u8> {
    let builder = PacketBuilder::ethernet2(SRC, DST)
        .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
        .icmpv4_echo_request(7, 1);
    let mut out = Vec::new();
    builder.write(&mut out, &[0u8; 56]).unwrap();
    out
}

struct Rig {
    dev: Arc<NetDevice>,
    driver: Arc<Loopback>,
    host: Arc<SinkHost>,
}

impl Rig {
    fn new(lflags: LoopbackFlags, sflags: ShimFlags) -> Self {
        let driver = Arc::new(Loopback::new(lflags));
        let host = Arc::new(SinkHost::default());
        let dev = NetDevice::new("test0", driver.clone(), host.clone(), sflags);
        dev.open().unwrap();
        Self { dev, driver, host }
    }

    fn basic() -> Self {
        Self::new(LoopbackFlags::default(), ShimFlags::default())
    }

    fn packet(&self, frame: &[u8]) -> NativePacket {
        NativePacket::from_frame(self.dev.pages(), frame, 128, 4096).unwrap()
    }
}

#[test]
fn segmented_frame_crosses_as_one_descriptor() {
    let rig = Rig::new(
        LoopbackFlags {
            rx_queues: 2,
            ..LoopbackFlags::default()
        },
        ShimFlags::default(),
    );
    let netq = rig.dev.netqueue();
    let rxq = netq.alloc_queue(QueueType::Rx).unwrap();
    assert!(rxq.poll.is_some());
    netq.apply_filter(rxq.queue, RxFilter::Mac(MacAddress::new(DST)))
        .unwrap();

    let frame = tcp_frame(DST, 9000 - 54);
    assert_eq!(frame.len(), 9000);
    let mut pkt = rig.packet(&frame);
    pkt.set_must_csum(true);
    pkt.set_tso(Some(1460));

    let outcome = rig.dev.transmit(None, vec![pkt]);
    assert_eq!(outcome.status, TxStatus::Ok);
    assert_eq!(outcome.sent, 1);
    assert_eq!(rig.driver.xmit_calls(), 1);
    let records = rig.driver.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].len, 9000);
    assert_eq!(records[0].gso.kind, GsoKind::TcpV4);
    assert_eq!(records[0].gso.size, 1460);
    assert_eq!(records[0].gso.segs, 7);
    assert_eq!(
        records[0].csum,
        CsumState::Partial {
            start: 34,
            offset: 16
        }
    );

    rig.dev.run_polls_until_idle(8);
    let rx = rig.host.take_with_source();
    assert_eq!(rx.len(), 1);
    let (source, pkt) = &rx[0];
    assert_eq!(*source, RxSource::Poll(rxq.poll.unwrap()));
    assert_eq!(pkt.frame_len(), 9000);
    assert_eq!(pkt.queue(), Some(rxq.queue));
    assert_eq!(pkt.linearize(), frame);
    drop(rx);

    rig.driver.reap(&rig.dev);
    assert_eq!(rig.dev.pages().outstanding(), 0);
    let counters = rig.dev.counters();
    assert_eq!(counters.rx_released, 1);
    assert_eq!(counters.tx.packets, 1);
    assert_eq!(counters.rx.packets, 1);
}

#[test]
fn checksum_request_on_icmp_never_reaches_driver() {
    let rig = Rig::basic();
    let mut pkt = rig.packet(&icmp_frame());
    pkt.set_must_csum(true);
    let outcome = rig.dev.transmit(None, vec![pkt]);
    assert_eq!(outcome.status, TxStatus::Ok);
    assert_eq!(outcome.sent, 0);
    assert_eq!(outcome.dropped, 1);
    assert!(outcome.retry.is_empty());
    assert_eq!(rig.driver.xmit_calls(), 0);
    assert_eq!(rig.dev.counters().tx.dropped, 1);
    assert_eq!(rig.dev.pages().outstanding(), 0);
}

#[test]
fn stopped_ring_returns_remainder_in_order() {
    let rig = Rig::new(
        LoopbackFlags {
            tx_slots: 2,
            ..LoopbackFlags::default()
        },
        ShimFlags::default(),
    );
    let pkts: Vec<_> = (0..5)
        .map(|i| rig.packet(&tcp_frame(OTHER, 100 + i)))
        .collect();

    let outcome = rig.dev.transmit(None, pkts);
    assert_eq!(outcome.status, TxStatus::Busy);
    assert_eq!(outcome.sent, 2);
    assert_eq!(outcome.dropped, 0);
    let lens: Vec<u32> = outcome.retry.iter().map(|p| p.frame_len()).collect();
    assert_eq!(lens, vec![156, 157, 158]);

    let default_tx = HostQueueId::new(0, QueueId::tx(0));
    assert_eq!(rig.host.tx_events().last(), Some(&(default_tx, true)));

    rig.driver.reap(&rig.dev);
    assert_eq!(rig.host.tx_events().last(), Some(&(default_tx, false)));
    let outcome = rig.dev.transmit(None, outcome.retry);
    assert_eq!(outcome.sent, 2);
    assert_eq!(outcome.retry.len(), 1);
    let sent: Vec<u32> = rig.driver.records().iter().map(|r| r.len).collect();
    assert_eq!(sent, vec![154, 155, 156, 157]);
}

#[test]
fn busy_driver_requeues_refused_packet_first() {
    let rig = Rig::basic();
    rig.driver.inject(Fault::Busy);
    let pkts: Vec<_> = (0..3)
        .map(|i| rig.packet(&tcp_frame(OTHER, 200 + i)))
        .collect();
    let outcome = rig.dev.transmit(None, pkts);
    assert_eq!(outcome.status, TxStatus::Busy);
    assert_eq!(outcome.sent, 0);
    let lens: Vec<u32> = outcome.retry.iter().map(|p| p.frame_len()).collect();
    assert_eq!(lens, vec![254, 255, 256]);

    rig.driver.inject(Fault::Fail);
    let outcome = rig.dev.transmit(None, outcome.retry);
    assert_eq!(outcome.status, TxStatus::Failure);
    assert_eq!(outcome.retry.len(), 3);

    let outcome = rig.dev.transmit(None, outcome.retry);
    assert_eq!(outcome.status, TxStatus::Ok);
    assert_eq!(outcome.sent, 3);
    assert_eq!(rig.driver.xmit_calls(), 5);
}

#[test]
fn blocked_device_drops_transmits() {
    let rig = Rig::basic();
    assert_eq!(rig.dev.block(), 0);
    let outcome = rig
        .dev
        .transmit(None, vec![rig.packet(&tcp_frame(OTHER, 10)), rig.packet(&tcp_frame(OTHER, 20))]);
    assert_eq!(outcome.status, TxStatus::Disabled);
    assert_eq!(outcome.dropped, 2);
    assert_eq!(rig.driver.xmit_calls(), 0);

    rig.dev.unblock();
    let outcome = rig.dev.transmit(None, vec![rig.packet(&tcp_frame(OTHER, 10))]);
    assert_eq!(outcome.sent, 1);
}

#[test]
fn poll_budget_is_fixed_and_order_kept() {
    let rig = Rig::new(
        LoopbackFlags {
            rx_queues: 1,
            weight: 4,
            ..LoopbackFlags::default()
        },
        ShimFlags::default(),
    );
    for i in 0..10 {
        assert!(rig.driver.wire_in(&tcp_frame(OTHER, 300 + i), None));
    }
    assert_eq!(rig.dev.run_polls(), 4);
    let ctx = rig.dev.polls().contexts()[0].clone();
    assert_eq!(ctx.state(), PollState::Scheduled);
    assert_eq!(rig.host.delivered(), 4);

    assert_eq!(rig.dev.run_polls_until_idle(10), 6);
    assert_eq!(ctx.state(), PollState::Idle);
    let lens: Vec<u32> = rig.host.take().iter().map(|p| p.frame_len()).collect();
    assert_eq!(lens, (0..10).map(|i| 354 + i).collect::<Vec<_>>());
}

#[test]
fn received_metadata_reaches_host() {
    let rig = Rig::basic();
    rig.driver
        .wire_in(&tcp_frame(OTHER, 64), Some(VlanTag::new(42, 5)));
    rig.dev.run_polls_until_idle(4);
    let pkts = rig.host.take();
    assert_eq!(pkts.len(), 1);
    assert_eq!(pkts[0].vlan(), Some(VlanTag::new(42, 5)));
    assert!(pkts[0].rss().is_some());
    assert_eq!(pkts[0].completion_cookie(), Some(u64::from(rig.driver.poll_ids()[0].0)));
}

fn ack_segment(seq: u32, payload: usize) -> Vec<u8> {
    let builder = PacketBuilder::ethernet2(SRC, OTHER)
        .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
        .tcp(40000, 80, seq, 65535)
        .ack(1);
    let mut out = Vec::new();
    builder.write(&mut out, &vec![0x33; payload]).unwrap();
    out
}

/// Wires in `count` consecutive segments of one flow and returns the
/// (frame length, large receive mss) of what the host got.
fn receive_segments(lro_max_aggr: u32, count: u32) -> Vec<(u32, Option<u32>)> {
    let rig = Rig::new(
        LoopbackFlags {
            rx_queues: 1,
            ..LoopbackFlags::default()
        },
        ShimFlags {
            lro_max_aggr,
            ..ShimFlags::default()
        },
    );
    let mut payload = Vec::new();
    for i in 0..count {
        let frame = ack_segment(100 + i * 500, 500);
        payload.extend_from_slice(&frame[54..]);
        assert!(rig.driver.wire_in(&frame, None));
    }
    rig.dev.run_polls_until_idle(8);
    assert_eq!(rig.dev.polls().contexts()[0].state(), PollState::Idle);

    let pkts = rig.host.take();
    let received: Vec<u8> = pkts.iter().flat_map(|p| p.linearize()[54..].to_vec()).collect();
    assert_eq!(received, payload);
    let summary = pkts
        .iter()
        .map(|p| (p.frame_len(), p.large_rx_mss()))
        .collect();
    drop(pkts);
    assert_eq!(rig.dev.pages().outstanding(), 0);
    assert_eq!(rig.dev.counters().rx_released, u64::from(count));
    summary
}

#[test]
fn small_segments_arrive_as_one_large_receive() {
    assert_eq!(receive_segments(8, 5), vec![(54 + 2500, Some(500))]);
    assert_eq!(
        receive_segments(4, 6),
        vec![(54 + 2000, Some(500)), (54 + 1000, Some(500))]
    );
    assert_eq!(receive_segments(0, 3), vec![(554, None); 3]);
}

/// Driver whose poll and transmit callbacks can be held mid-call.
#[derive(Default)]
struct Scripted {
    polls: AtomicUsize,
    inside: AtomicBool,
    hold: AtomicBool,
    rx_on_poll: AtomicBool,
    in_xmit: AtomicBool,
    hold_xmit: AtomicBool,
}

impl QueueOps for Scripted {}

impl NetDriver for Scripted {
    fn features(&self) -> Features {
        Features::SG | Features::IP_CSUM | Features::TSO | Features::HW_VLAN_TX
    }

    fn open(&self, dev: &NetDevice) -> DriverResult<()> {
        for txq in dev.tx_queues() {
            txq.wake();
        }
        Ok(())
    }

    fn close(&self, _dev: &NetDevice) -> DriverResult<()> {
        Ok(())
    }

    fn start_xmit(&self, desc: DescBox, _txq: &TxQueue) -> XmitStatus {
        self.in_xmit.store(true, Ordering::SeqCst);
        let start = Instant::now();
        while self.hold_xmit.load(Ordering::SeqCst) && start.elapsed() < Duration::from_secs(5) {
            thread::sleep(Duration::from_millis(1));
        }
        self.in_xmit.store(false, Ordering::SeqCst);
        drop(desc);
        XmitStatus::Ok
    }

    fn poll(&self, ctx: &mut PollCtx<'_>) -> usize {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let mut work = 0;
        if self.rx_on_poll.load(Ordering::SeqCst) {
            let frame = tcp_frame(DST, 32);
            let mut desc = ctx.alloc_desc().unwrap();
            desc.set_head(ctx.alloc_page(&frame).unwrap(), frame.len() as u32);
            ctx.receive(desc);
            work = 1;
        }
        self.inside.store(true, Ordering::SeqCst);
        let start = Instant::now();
        while self.hold.load(Ordering::SeqCst) && start.elapsed() < Duration::from_secs(5) {
            thread::sleep(Duration::from_millis(1));
        }
        ctx.complete();
        work
    }
}

fn scripted(flags: ShimFlags) -> (Arc<NetDevice>, Arc<Scripted>, Arc<SinkHost>) {
    let driver = Arc::new(Scripted::default());
    let host = Arc::new(SinkHost::default());
    let dev = NetDevice::new("scripted", driver.clone(), host.clone(), flags);
    dev.open().unwrap();
    (dev, driver, host)
}

#[test]
fn repeated_schedule_runs_once() {
    let (dev, driver, _host) = scripted(ShimFlags::default());
    let ctx = dev.napi_add(16, None);
    assert!(ctx.schedule());
    for _ in 0..9 {
        assert!(!ctx.schedule());
    }
    dev.run_polls_until_idle(10);
    assert_eq!(driver.polls.load(Ordering::SeqCst), 1);
    assert_eq!(ctx.state(), PollState::Idle);
    assert!(!dev.polls().has_work());
}

#[test]
fn schedule_during_completion_is_never_lost() {
    let (dev, driver, _host) = scripted(ShimFlags::default());
    let ctx = dev.napi_add(16, None);
    let stop = Arc::new(AtomicBool::new(false));
    let runner = {
        let dev = dev.clone();
        let stop = stop.clone();
        thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                dev.run_polls();
            }
        })
    };
    for _ in 0..2000 {
        let before = driver.polls.load(Ordering::SeqCst);
        ctx.schedule();
        let start = Instant::now();
        while driver.polls.load(Ordering::SeqCst) == before {
            assert!(start.elapsed() < Duration::from_secs(5), "schedule went missing");
            thread::yield_now();
        }
    }
    stop.store(true, Ordering::SeqCst);
    runner.join().unwrap();
    dev.run_polls_until_idle(10);
    assert_eq!(ctx.state(), PollState::Idle);
}

#[test]
fn backup_poll_drains_shared_contexts() {
    let (dev, driver, _host) = scripted(ShimFlags {
        max_net_polls: 1,
        ..ShimFlags::default()
    });
    let dedicated = dev.napi_add(8, Some(0));
    let b1 = dev.napi_add(8, Some(1));
    let b2 = dev.napi_add(8, Some(2));
    assert!(!dedicated.is_backup());
    assert!(b1.is_backup() && b2.is_backup());
    b1.schedule();
    b2.schedule();
    dev.run_polls();
    assert_eq!(driver.polls.load(Ordering::SeqCst), 2);
    assert_eq!(b1.state(), PollState::Idle);
    assert_eq!(b2.state(), PollState::Idle);
}

#[test]
fn block_forces_idle_on_stuck_callback() {
    let (dev, driver, host) = scripted(ShimFlags {
        disable_timeout_ticks: 20,
        ..ShimFlags::default()
    });
    driver.rx_on_poll.store(true, Ordering::SeqCst);
    driver.hold.store(true, Ordering::SeqCst);
    let ctx = dev.napi_add(16, None);
    ctx.schedule();

    let runner = {
        let dev = dev.clone();
        thread::spawn(move || dev.run_polls())
    };
    while !driver.inside.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(ctx.state(), PollState::Running);

    let started = Instant::now();
    assert_eq!(dev.block(), 1);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(ctx.state(), PollState::ForceIdle);
    // what the callback queued before the block was flushed
    assert_eq!(host.delivered(), 1);

    driver.hold.store(false, Ordering::SeqCst);
    runner.join().unwrap();
    assert_eq!(ctx.state(), PollState::ForceIdle);
    dev.unblock();
    assert!(!ctx.schedule());
    assert!(!dev.napi_enable(&ctx));
}

#[test]
fn block_quiesces_idle_contexts() {
    let (dev, driver, _host) = scripted(ShimFlags::default());
    let ctx = dev.napi_add(16, None);
    ctx.schedule();
    dev.run_polls();
    assert_eq!(dev.block(), 0);
    assert_eq!(ctx.state(), PollState::Idle);
    dev.unblock();
    assert!(ctx.schedule());
    dev.run_polls();
    assert_eq!(driver.polls.load(Ordering::SeqCst), 2);
}

#[test]
fn custom_delivery_replaces_host() {
    let (dev, driver, host) = scripted(ShimFlags::default());
    driver.rx_on_poll.store(true, Ordering::SeqCst);
    let seen = Arc::new(AtomicUsize::new(0));
    let ctx = {
        let seen = seen.clone();
        dev.napi_add_with_delivery(
            4,
            None,
            Arc::new(move |_: PollId, pkts: Vec<NativePacket>| {
                seen.fetch_add(pkts.len(), Ordering::SeqCst);
            }),
        )
    };
    ctx.schedule();
    dev.run_polls();
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    assert_eq!(host.delivered(), 0);
    dev.napi_del(&ctx);
    assert!(dev.polls().is_empty());
}

#[test]
fn shared_filter_is_reference_counted() {
    let rig = Rig::basic();
    let netq = rig.dev.netqueue();
    let rxq = netq.alloc_queue(QueueType::Rx).unwrap();
    let filter = RxFilter::Mac(MacAddress::new(DST));
    let a = netq.apply_filter(rxq.queue, filter).unwrap();
    let b = netq.apply_filter(rxq.queue, filter).unwrap();
    assert_eq!(a.id, b.id);
    assert_eq!(rig.dev.queue_manager().filter_refs(rxq.queue, a.id), Some(2));

    netq.remove_filter(rxq.queue, a.id).unwrap();
    assert_eq!(rig.dev.queue_manager().filter_refs(rxq.queue, a.id), Some(1));
    rig.driver.wire_in(&tcp_frame(DST, 10), None);
    rig.dev.run_polls_until_idle(4);
    assert_eq!(rig.host.take()[0].queue(), Some(rxq.queue));

    netq.remove_filter(rxq.queue, b.id).unwrap();
    assert_eq!(rig.dev.queue_manager().filter_refs(rxq.queue, a.id), None);
    assert_eq!(
        netq.remove_filter(rxq.queue, a.id),
        Err(Error::InvalidFilter(a.id.0))
    );
    rig.driver.wire_in(&tcp_frame(DST, 10), None);
    rig.dev.run_polls_until_idle(4);
    assert_eq!(rig.host.take()[0].queue(), None);
}

#[test]
fn refused_filter_removal_can_be_retried() {
    let rig = Rig::basic();
    let netq = rig.dev.netqueue();
    let rxq = netq.alloc_queue(QueueType::Rx).unwrap();
    let f = netq
        .apply_filter(rxq.queue, RxFilter::Mac(MacAddress::new(DST)))
        .unwrap();

    rig.driver.fail_filter_removals(1);
    assert_eq!(netq.remove_filter(rxq.queue, f.id), Err(Error::Driver(-16)));
    assert_eq!(rig.dev.queue_manager().filter_refs(rxq.queue, f.id), Some(1));
    rig.driver.wire_in(&tcp_frame(DST, 10), None);
    rig.dev.run_polls_until_idle(4);
    assert_eq!(rig.host.take()[0].queue(), Some(rxq.queue));

    netq.remove_filter(rxq.queue, f.id).unwrap();
    assert_eq!(rig.dev.queue_manager().filter_refs(rxq.queue, f.id), None);

    // stepwise realloc keeps a filter the driver would not drop
    let f = netq
        .apply_filter(rxq.queue, RxFilter::Mac(MacAddress::new(DST)))
        .unwrap();
    rig.driver.fail_filter_removals(1);
    let req = ReallocRequest {
        queue: rxq.queue,
        attrs: &[],
        remove: &[f.id],
        apply: None,
    };
    assert!(netq.realloc_queue_with_attr(&req).is_err());
    assert_eq!(rig.dev.queue_manager().filter_refs(rxq.queue, f.id), Some(1));
    assert!(rig.dev.queue_manager().queue(rxq.queue).is_some());
    let (moved, _) = netq.realloc_queue_with_attr(&req).unwrap();
    assert_ne!(moved.queue, rxq.queue);
}

#[test]
fn filters_only_on_rx_queues() {
    let rig = Rig::new(
        LoopbackFlags {
            tx_queues: 2,
            ..LoopbackFlags::default()
        },
        ShimFlags {
            num_tx_queues: 2,
            ..ShimFlags::default()
        },
    );
    let netq = rig.dev.netqueue();
    let txq = netq.alloc_queue(QueueType::Tx).unwrap();
    assert!(matches!(
        netq.apply_filter(txq.queue, RxFilter::Mac(MacAddress::new(DST))),
        Err(Error::InvalidQueue(_))
    ));
}

fn realloc_moves_queue(native: bool) {
    let rig = Rig::new(
        LoopbackFlags {
            native_realloc: native,
            ..LoopbackFlags::default()
        },
        ShimFlags::default(),
    );
    let netq = rig.dev.netqueue();
    let old = netq.alloc_queue(QueueType::Rx).unwrap();
    let f1 = netq
        .apply_filter(old.queue, RxFilter::Mac(MacAddress::new(DST)))
        .unwrap();

    let req = ReallocRequest {
        queue: old.queue,
        attrs: &[],
        remove: &[f1.id],
        apply: Some(RxFilter::Mac(MacAddress::new(OTHER))),
    };
    let (new, handle) = netq.realloc_queue_with_attr(&req).unwrap();
    let handle = handle.unwrap();
    assert_ne!(new.queue, old.queue);
    assert_eq!(handle.queue, new.queue);
    assert!(rig.dev.queue_manager().queue(old.queue).is_none());
    assert_eq!(
        netq.free_queue(old.queue),
        Err(Error::InvalidQueue(old.queue.raw()))
    );

    rig.driver.wire_in(&tcp_frame(OTHER, 10), None);
    rig.driver.wire_in(&tcp_frame(DST, 10), None);
    rig.dev.run_polls_until_idle(8);
    let mut queues: Vec<_> = rig.host.take().iter().map(|p| p.queue()).collect();
    queues.sort();
    assert_eq!(queues, vec![None, Some(new.queue)]);
}

#[test]
fn realloc_stepwise() {
    realloc_moves_queue(false);
}

#[test]
fn realloc_native() {
    realloc_moves_queue(true);
}

#[test]
fn too_many_queue_attributes() {
    use netshim::driver::QueueAttr;
    let rig = Rig::basic();
    let attrs = [QueueAttr::Priority(1); 3];
    assert!(matches!(
        rig.dev
            .netqueue()
            .alloc_queue_with_attr(QueueType::Rx, &attrs),
        Err(Error::LimitExceeded { len: 3, max: 2, .. })
    ));
}

#[test]
fn tx_queue_mapping_follows_allocation() {
    let rig = Rig::new(
        LoopbackFlags {
            tx_queues: 2,
            ..LoopbackFlags::default()
        },
        ShimFlags {
            num_tx_queues: 2,
            ..ShimFlags::default()
        },
    );
    let netq = rig.dev.netqueue();
    let txq = netq.alloc_queue(QueueType::Tx).unwrap();
    assert_eq!(rig.dev.tx_queue(1).unwrap().mapped(), Some(txq.queue));

    rig.dev
        .transmit(Some(txq.queue), vec![rig.packet(&tcp_frame(OTHER, 10))]);
    netq.free_queue(txq.queue).unwrap();
    assert_eq!(rig.dev.tx_queue(1).unwrap().mapped(), None);
    rig.dev
        .transmit(Some(txq.queue), vec![rig.packet(&tcp_frame(OTHER, 10))]);

    let queues: Vec<u16> = rig.driver.records().iter().map(|r| r.queue).collect();
    assert_eq!(queues, vec![1, 0]);
}

#[test]
fn queue_ops_without_netqueue_support() {
    let (dev, _driver, _host) = scripted(ShimFlags::default());
    let netq = dev.netqueue();
    assert_eq!(netq.alloc_queue(QueueType::Rx), Err(Error::NotSupported));
    assert_eq!(netq.version(), Err(Error::NotSupported));
    assert_eq!(netq.rss_params(), Err(Error::NotSupported));
}

#[test]
fn rss_configuration() {
    let rig = Rig::basic();
    let netq = rig.dev.netqueue();
    let params = netq.rss_params().unwrap();
    assert_eq!(params.table_len, 128);
    assert!(matches!(
        netq.rss_init(&[0; 41], &[0; 16]),
        Err(Error::LimitExceeded { .. })
    ));
    let table: Vec<u8> = (0..128).map(|i| (i % 4) as u8).collect();
    netq.rss_init(&[7; 40], &table).unwrap();
    assert_eq!(netq.rss_table().unwrap(), table);
    netq.rss_update_table(&[1; 128]).unwrap();
    rig.driver.wire_in(&tcp_frame(OTHER, 10), None);
    rig.dev.run_polls_until_idle(4);
    assert_eq!(rig.host.delivered(), 1);
}

#[test]
fn queue_extras_pass_through() {
    let rig = Rig::basic();
    let netq = rig.dev.netqueue();
    assert_eq!(netq.version(), Ok((2, 0)));
    let rxq = netq.alloc_queue(QueueType::Rx).unwrap();
    assert_eq!(netq.queue_vector(rxq.queue), Ok(0x21));
    let default_rx = netq.default_queue(QueueType::Rx).unwrap();
    assert_eq!(default_rx.generation(), 0);
    assert!(default_rx.driver_id().is_default());
    assert!(
        netq.supported_queue_features(QueueType::Rx)
            .unwrap()
            .contains(netshim::api::QueueFeatures::LRO)
    );
    // the default queue takes unmatched traffic without a driver filter
    let h = netq
        .apply_filter(default_rx, RxFilter::Mac(MacAddress::new(OTHER)))
        .unwrap();
    netq.remove_filter(default_rx, h.id).unwrap();
}

#[test]
fn device_admin_operations() {
    let rig = Rig::basic();
    rig.dev.set_mtu(9000).unwrap();
    assert_eq!(rig.dev.mtu(), 9000);
    assert_eq!(rig.driver.mtu(), 9000);
    assert_eq!(rig.dev.set_mtu(10), Err(Error::Driver(-22)));
    assert_eq!(rig.dev.mtu(), 9000);

    let mut data = [0u8; 4];
    assert_eq!(rig.dev.ioctl(IOCTL_GET_LINK, &mut data), Ok(0));
    assert_eq!(data[0], 1);
    assert_eq!(rig.dev.ioctl(1, &mut data), Err(Error::NotSupported));

    rig.dev.tx_timeout(0).unwrap();
    assert!(rig.dev.tx_timeout(9).is_err());
    assert_eq!(rig.dev.counters().watchdog_hits, 1);
    assert_eq!(rig.driver.timeouts(), 1);

    assert!(matches!(
        rig.dev.vlan_filter_add(4095),
        Err(Error::LimitExceeded { .. })
    ));
    rig.dev.vlan_filter_add(10).unwrap();
    assert!(!rig.driver.wire_in(&tcp_frame(OTHER, 10), Some(VlanTag::new(20, 0))));
    assert!(rig.driver.wire_in(&tcp_frame(OTHER, 10), Some(VlanTag::new(10, 0))));
    rig.dev.vlan_filter_remove(10).unwrap();
    assert_eq!(rig.driver.wire_drops(), 1);

    let caps = rig.host.capabilities("test0").unwrap();
    assert!(caps.contains(netshim::capabilities::Capability::Tso));

    rig.dev.close().unwrap();
    assert!(!rig.dev.is_open());
    assert!(rig.dev.tx_queue(0).unwrap().is_stopped());
    rig.dev.open().unwrap();
    assert!(!rig.dev.tx_queue(0).unwrap().is_stopped());
}

#[test]
fn direct_receive_is_delivered_immediately() {
    let rig = Rig::basic();
    let frame = tcp_frame(DST, 500);
    let mut desc = rig.dev.alloc_desc().unwrap();
    desc.set_head(rig.dev.pages().alloc(&frame).unwrap(), frame.len() as u32);
    assert_eq!(rig.dev.netif_rx(desc), RxStatus::Accepted);
    let rx = rig.host.take_with_source();
    assert_eq!(rx.len(), 1);
    assert_eq!(rx[0].0, RxSource::Direct);

    rig.dev.block();
    let mut desc = rig.dev.alloc_desc().unwrap();
    desc.set_head(rig.dev.pages().alloc(&frame).unwrap(), frame.len() as u32);
    assert_eq!(rig.dev.netif_rx(desc), RxStatus::Dropped);
    drop(rx);
    assert_eq!(rig.dev.pages().outstanding(), 0);
}

#[test]
fn panic_paths() {
    let reg = Registry::new();
    let driver = Arc::new(Loopback::new(LoopbackFlags::default()));
    let host = Arc::new(SinkHost::default());
    let dev = reg
        .register(driver.clone(), host.clone(), ShimFlags::default())
        .unwrap();
    dev.open().unwrap();

    let pkt = NativePacket::from_frame(dev.pages(), &tcp_frame(OTHER, 10), 128, 4096).unwrap();
    assert!(matches!(
        dev.transmit_panic(None, vec![pkt]),
        Err(Error::PanicPrecondition(_))
    ));

    reg.enter_panic_mode();
    let pkt = NativePacket::from_frame(dev.pages(), &tcp_frame(OTHER, 10), 128, 4096).unwrap();
    let outcome = dev.transmit_panic(None, vec![pkt]).unwrap();
    assert_eq!(outcome.sent, 1);

    // the transmitted frame looped back onto rx ring 0
    assert_eq!(dev.panic_poll(8), 1);
    assert_eq!(host.delivered(), 0);
    let debug = dev.flush_rx_buffers();
    assert_eq!(debug.len(), 1);
    assert!(dev.flush_rx_buffers().is_empty());

    reg.leave_panic_mode();
    reg.unregister(dev.name()).unwrap();
    assert!(!dev.is_open());
}

#[test]
fn panic_transmit_refuses_ring_held_by_regular_sender() {
    let reg = Registry::new();
    let driver = Arc::new(Scripted::default());
    let host = Arc::new(SinkHost::default());
    let dev = reg
        .register(driver.clone(), host.clone(), ShimFlags::default())
        .unwrap();
    dev.open().unwrap();
    reg.enter_panic_mode();

    driver.hold_xmit.store(true, Ordering::SeqCst);
    let sender = {
        let dev = dev.clone();
        thread::spawn(move || {
            let pkt =
                NativePacket::from_frame(dev.pages(), &tcp_frame(DST, 10), 128, 4096).unwrap();
            dev.transmit(None, vec![pkt]).sent
        })
    };
    while !driver.in_xmit.load(Ordering::SeqCst) {
        thread::yield_now();
    }

    let pkt = NativePacket::from_frame(dev.pages(), &tcp_frame(DST, 10), 128, 4096).unwrap();
    assert!(matches!(
        dev.transmit_panic(None, vec![pkt]),
        Err(Error::PanicPrecondition(_))
    ));

    driver.hold_xmit.store(false, Ordering::SeqCst);
    assert_eq!(sender.join().unwrap(), 1);
    let pkt = NativePacket::from_frame(dev.pages(), &tcp_frame(DST, 10), 128, 4096).unwrap();
    assert_eq!(dev.transmit_panic(None, vec![pkt]).unwrap().sent, 1);
    assert_eq!(dev.pages().outstanding(), 0);

    reg.leave_panic_mode();
    reg.unregister(dev.name()).unwrap();
}

#[test]
fn concurrent_release_in_random_order() {
    let rig = Rig::new(
        LoopbackFlags {
            rx_queues: 1,
            ..LoopbackFlags::default()
        },
        ShimFlags::default(),
    );
    let mut rng = rand::rng();
    for _ in 0..64 {
        let len = rng.random_range(10..6000);
        assert!(rig.driver.wire_in(&tcp_frame(OTHER, len), None));
    }
    rig.dev.run_polls_until_idle(8);
    let mut pkts = rig.host.take();
    assert_eq!(pkts.len(), 64);
    pkts.shuffle(&mut rng);

    let mut handles = Vec::new();
    while !pkts.is_empty() {
        let chunk: Vec<NativePacket> = pkts.drain(..pkts.len().min(16)).collect();
        handles.push(thread::spawn(move || {
            let mut rng = rand::rng();
            for pkt in chunk {
                if rng.random_bool(0.3) {
                    thread::yield_now();
                }
                drop(pkt);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(rig.dev.counters().rx_released, 64);
    assert_eq!(rig.dev.pages().outstanding(), 0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn transmit_never_leaks(
        payload in 0usize..6000,
        head in 1usize..300,
        frag in 1usize..5000,
        mss in prop::option::of(prop_oneof![Just(0u32), 1u32..1600, Just(70_000u32)]),
        csum in any::<bool>(),
        vlan in prop::option::of(0u16..4095),
    ) {
        let (dev, _driver, _host) = scripted(ShimFlags::default());
        let frame = tcp_frame(DST, payload);
        let mut pkt = NativePacket::from_frame(dev.pages(), &frame, head, frag).unwrap();
        pkt.set_must_csum(csum);
        pkt.set_tso(mss);
        pkt.set_vlan(vlan.map(|id| VlanTag::new(id, 0)));
        let outcome = dev.transmit(None, vec![pkt]);
        prop_assert_eq!(outcome.sent + outcome.dropped + outcome.retry.len(), 1);
        drop(outcome);
        prop_assert_eq!(dev.pages().outstanding(), 0);
        prop_assert_eq!(dev.free_descriptors(), dev.flags().desc_pool_size);
    }

    #[test]
    fn receive_never_leaks(
        head in 0usize..200,
        frags in prop::collection::vec((0usize..3000, 0u32..64), 0..20),
        vlan in prop::option::of(0u16..=4095),
        lro in prop::option::of(0u16..2000),
        blocked in any::<bool>(),
    ) {
        let (dev, _driver, host) = scripted(ShimFlags::default());
        let mut desc = dev.alloc_desc().unwrap();
        if head > 0 {
            desc.set_head(dev.pages().alloc(&vec![1u8; head]).unwrap(), head as u32);
        }
        for (len, skew) in frags {
            let page = dev.pages().alloc(&vec![2u8; len]).unwrap();
            // a skewed fragment may run past its page
            if let Err(page) = desc.add_rx_frag(page, skew, len as u32) {
                page.put();
            }
        }
        desc.vlan = vlan.map(|id| VlanTag::new(id, 0));
        if let Some(size) = lro {
            desc.set_rx_gso(GsoKind::TcpV4, size);
        }
        if blocked {
            dev.block();
        }
        let status = dev.netif_rx(desc);
        prop_assert_eq!(status == RxStatus::Accepted, host.delivered() == 1);
        drop(host.take());
        prop_assert_eq!(dev.pages().outstanding(), 0);
        prop_assert_eq!(dev.counters().rx_released, u64::from(status == RxStatus::Accepted));
    }
}
