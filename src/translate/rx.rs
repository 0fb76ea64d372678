//! Receive direction: driver descriptor to host packet.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::api::hint::unlikely;
use crate::api::{Completion, CsumState, CsumVerified, DescBox, GsoKind, NativePacket};
use crate::errors::DropReason;
use crate::netqueue::HostQueueId;

pub(crate) struct RxEnv<'a> {
    pub blocked: bool,
    /// Host id of the queue the descriptor arrived on.
    pub queue: Option<HostQueueId>,
    /// Bumped when the host releases the packet.
    pub released: &'a Arc<AtomicU64>,
    pub cookie: u64,
}

fn check_layout(desc: &DescBox) -> Result<(), DropReason> {
    let head = desc.head().map_or(0, |h| h.bytes().len() as u32);
    let mut total = head;
    for frag in desc.frags() {
        if frag.offset() as usize + frag.len() as usize > frag.page().len() {
            return Err(DropReason::BadLayout);
        }
        total += frag.len();
    }
    if total != desc.len() || head != desc.head_len() {
        return Err(DropReason::BadLayout);
    }
    Ok(())
}

/// Converts a received descriptor. On success the descriptor's pages now
/// belong to the returned packet and the descriptor itself is recycled. On
/// a drop the descriptor is recycled together with its pages.
pub(crate) fn to_native(mut desc: DescBox, env: &RxEnv<'_>) -> Result<NativePacket, DropReason> {
    if unlikely(env.blocked) {
        return Err(DropReason::Blocked);
    }
    if unlikely(desc.is_empty()) {
        return Err(DropReason::ZeroLength);
    }
    check_layout(&desc)?;

    let large_rx = match desc.gso.kind {
        GsoKind::None => None,
        GsoKind::TcpV4 if desc.gso.size == 0 => return Err(DropReason::ZeroSegmentSize),
        GsoKind::TcpV4 => Some(u32::from(desc.gso.size)),
        GsoKind::TcpV6 => return Err(DropReason::UnsupportedGso),
    };

    if let Some(tag) = desc.vlan {
        if !tag.is_valid() {
            return Err(DropReason::InvalidVlan(tag.id));
        }
    }

    let csum = match desc.csum {
        CsumState::None => CsumVerified::None,
        CsumState::Unnecessary | CsumState::Partial { .. } => CsumVerified::Verified,
        CsumState::UnnecessaryEncap => CsumVerified::EncapVerified,
    };

    let sg = desc.transfer_to_host();
    let mut pkt = NativePacket::new(sg, desc.len());
    if let Some(mss) = large_rx {
        pkt.set_large_rx(mss);
    }
    pkt.set_vlan(desc.vlan);
    pkt.set_rss(desc.rss);
    pkt.set_csum_verified(csum);
    pkt.set_queue(env.queue);
    let released = env.released.clone();
    pkt.set_completion(Completion::new(env.cookie, move |_| {
        released.fetch_add(1, Ordering::Relaxed);
    }));
    Ok(pkt)
}
