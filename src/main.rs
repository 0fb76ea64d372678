use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use eui48::MacAddress;
use etherparse::{NetHeaders, PacketBuilder, PacketHeaders};
use rand::Rng;
use tracing_subscriber::EnvFilter;

use netshim::api::NativePacket;
use netshim::loopback::{Loopback, LoopbackFlags, SinkHost};
use netshim::netqueue::{QueueType, RxFilter};
use netshim::xmit::TxStatus;
use netshim::{Registry, ShimFlags};

const SRC_MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 0x01];
const DST_MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 0x02];

/// Command line options.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Packets to send; runs until Ctrl-C when 0.
    #[clap(short, long, default_value_t = 10_000)]
    packets: u64,

    /// Largest TCP payload; larger than the MTU exercises segmentation.
    #[clap(short = 'l', long, default_value_t = 9000)]
    max_payload: usize,

    /// Segment size for oversized frames.
    #[clap(long, default_value_t = 1460)]
    mss: u32,

    #[clap(long, default_value_t = 1500)]
    mtu: u32,

    /// Segments merged per software large receive, 0 disables it.
    #[clap(long, default_value_t = 0)]
    lro_max_aggr: u32,

    /// Rx rings of the loopback device.
    #[clap(short, long, default_value_t = 4)]
    queues: u16,

    /// Print the addresses of received frames.
    #[clap(short, long)]
    debug: bool,
}

/// Try to parse Ethernet/IP headers using etherparse and return a formatted string.
fn print_addrs(frame: &[u8]) -> Result<String> {
    let headers = PacketHeaders::from_ethernet_slice(frame)?;
    match headers.net.ok_or(anyhow!("IP header not found"))? {
        NetHeaders::Ipv4(hdr, _) => Ok(format!(
            "IP: {} > {}",
            Ipv4Addr::from(hdr.source),
            Ipv4Addr::from(hdr.destination)
        )),
        NetHeaders::Ipv6(hdr, _) => Ok(format!(
            "IP: {} > {}",
            Ipv6Addr::from(hdr.source),
            Ipv6Addr::from(hdr.destination)
        )),
        _ => bail!("IP header not found"),
    }
}

fn tcp_frame(payload: usize) -> Result<Vec<u8>> {
    let builder = PacketBuilder::ethernet2(SRC_MAC, DST_MAC)
        .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
        .tcp(40000, 80, 1, 65535);
    let body = vec![0x5au8; payload];
    let mut out = Vec::with_capacity(builder.size(body.len()));
    builder.write(&mut out, &body)?;
    Ok(out)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let args = Args::parse();

    println!("Loopback demo started with parameters:");
    println!("* packets: {}", args.packets);
    println!("* max payload: {}", args.max_payload);
    println!("* mss: {}, mtu: {}", args.mss, args.mtu);
    println!("* rx queues: {}", args.queues);
    println!("* lro max aggr: {}", args.lro_max_aggr);
    println!("* debug: {}", if args.debug { "ON" } else { "OFF" });

    let term = Arc::new(AtomicBool::new(false));
    {
        let term = term.clone();
        ctrlc::set_handler(move || {
            term.store(true, Ordering::SeqCst);
        })
        .context("setting Ctrl-C handler")?;
    }

    let host = Arc::new(SinkHost::default());
    let driver = Arc::new(Loopback::new(LoopbackFlags {
        rx_queues: args.queues,
        ..LoopbackFlags::default()
    }));
    let flags = ShimFlags {
        mtu: args.mtu,
        lro_max_aggr: args.lro_max_aggr,
        ..ShimFlags::default()
    };
    let dev = Registry::global().register(driver.clone(), host.clone(), flags)?;
    dev.open()?;

    let netq = dev.netqueue();
    let rxq = netq.alloc_queue(QueueType::Rx)?;
    let filter = netq.apply_filter(rxq.queue, RxFilter::Mac(MacAddress::new(DST_MAC)))?;
    println!("rx queue {:?} filter {:?}", rxq.queue, filter.id);

    let stats_dev = dev.clone();
    let term_stats = term.clone();
    let stats_handle = thread::spawn(move || {
        let mut old = stats_dev.counters();
        while !term_stats.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_secs(1));
            let now = stats_dev.counters();
            println!(
                "tx pkt/sec: {} rx pkt/sec: {} dropped: {}",
                now.tx.packets.saturating_sub(old.tx.packets),
                now.rx.packets.saturating_sub(old.rx.packets),
                now.tx.dropped + now.rx.dropped
            );
            old = now;
        }
    });

    let mut rng = rand::rng();
    let mut sent = 0u64;
    let mut received = 0u64;
    while !term.load(Ordering::SeqCst) && (args.packets == 0 || sent < args.packets) {
        let payload = rng.random_range(64..=args.max_payload.max(64));
        let frame = tcp_frame(payload)?;
        let mut pkt = NativePacket::from_frame(dev.pages(), &frame, 128, 4096)
            .context("out of pages")?;
        if frame.len() as u32 > args.mtu + 14 {
            pkt.set_must_csum(true);
            pkt.set_tso(Some(args.mss));
        }

        let mut batch = vec![pkt];
        loop {
            let outcome = dev.transmit(None, batch);
            sent += outcome.sent as u64;
            match outcome.status {
                TxStatus::Busy if !outcome.retry.is_empty() => {
                    driver.reap(&dev);
                    batch = outcome.retry;
                }
                _ => break,
            }
        }

        dev.run_polls_until_idle(16);
        driver.reap(&dev);
        for pkt in host.take() {
            received += 1;
            if args.debug {
                if let Ok(info) = print_addrs(&pkt.linearize()) {
                    println!("rx {:?}: {}", pkt.queue(), info);
                }
            }
        }
    }
    term.store(true, Ordering::SeqCst);
    stats_handle.join().map_err(|_| anyhow!("stats thread panicked"))?;

    netq.remove_filter(filter.queue, filter.id)?;
    netq.free_queue(rxq.queue)?;
    Registry::global().unregister(dev.name())?;

    let counters = dev.counters();
    println!("sent {sent} received {received}");
    println!("{counters:#?}");
    Ok(())
}
