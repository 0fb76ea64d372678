//! Transmit direction: host packet to driver descriptor.

use etherparse::{EtherType, IpNumber};

use super::headers::{self, Layout, LinkLayer, NetLayer};
use crate::api::{
    CsumState, DescBox, DescPool, EncapOffload, Features, GsoKind, NativePacket, OffsetOffload,
    OffsetWidth,
};
use crate::errors::DropReason;
use crate::throttle::throttled;

const TCP_CSUM_OFFSET: u16 = 16;
const UDP_CSUM_OFFSET: u16 = 6;

pub(crate) struct TxEnv<'a> {
    pub pool: &'a DescPool,
    pub mtu: u32,
    pub features: Features,
}

/// A packet the translation refused. The packet goes back to the host free
/// path when this is dropped.
#[derive(Debug)]
pub(crate) struct TxDrop {
    pub reason: DropReason,
    pub pkt: NativePacket,
}

/// Builds the descriptor for `pkt` on tx ring `queue`. The descriptor
/// carries the packet so that completing the descriptor releases it.
pub(crate) fn to_desc(pkt: NativePacket, queue: u16, env: &TxEnv<'_>) -> Result<DescBox, TxDrop> {
    match build(&pkt, queue, env) {
        Ok(mut desc) => {
            desc.attach_packet(pkt);
            Ok(desc)
        }
        Err(reason) => Err(TxDrop { reason, pkt }),
    }
}

fn build(pkt: &NativePacket, queue: u16, env: &TxEnv<'_>) -> Result<DescBox, DropReason> {
    let mut desc = env.pool.alloc().ok_or(DropReason::NoDescriptor)?;
    let frame_len = pkt.frame_len();
    let first = pkt.sg().first().ok_or(DropReason::BadLayout)?;
    let head_len = first.len.min(frame_len);
    desc.set_host_head(first, head_len);
    desc.queue_mapping = queue;

    let head = &first.bytes()[..head_len as usize];
    let link = headers::link_layer(head).ok_or(DropReason::BadLinkHeader)?;
    desc.protocol = link.ether_type.0;
    desc.offsets.mac_len = link.len as u16;

    let tso = pkt.tso_mss();
    if pkt.must_csum() || tso.is_some() {
        let l = locate(&mut desc, pkt, head, link, tso.is_some(), env.features)?;
        if let Some(mss) = tso {
            segment(&mut desc, &l, link, frame_len, mss, env.mtu)?;
        }
        desc.csum = partial_csum(&l)?;
    }
    if tso.is_none() {
        let len = frame_len.saturating_sub(link.len as u32);
        if len > env.mtu {
            return Err(DropReason::TooBig { len, mtu: env.mtu });
        }
    }

    let mut left = frame_len - head_len;
    for elem in pkt.sg().iter().skip(1) {
        if left == 0 {
            break;
        }
        let len = elem.len.min(left);
        if len == 0 {
            continue;
        }
        if !desc.push_host_frag(elem, len) {
            return Err(DropReason::TooManyFrags);
        }
        left -= len;
    }
    if left > 0 {
        return Err(DropReason::BadLayout);
    }

    if let Some(tag) = pkt.vlan() {
        if !env.features.contains(Features::HW_VLAN_TX) {
            return Err(DropReason::VlanUnsupported);
        }
        desc.vlan = Some(tag);
    }
    Ok(desc)
}

/// Finds the headers the offload works on: the inner ones for a tunneled
/// frame, after choosing how the device is told about them.
fn locate(
    desc: &mut DescBox,
    pkt: &NativePacket,
    head: &[u8],
    link: LinkLayer,
    tso: bool,
    features: Features,
) -> Result<Layout, DropReason> {
    let is_ip = link.ether_type == EtherType::IPV4 || link.ether_type == EtherType::IPV6;
    if !is_ip {
        return Err(if tso {
            DropReason::SegmentNotIp
        } else {
            DropReason::BadNetworkHeader
        });
    }
    let outer = headers::layout(head, 0).ok_or(DropReason::BadNetworkHeader)?;
    desc.offsets.network = Some(outer.net_offset as u16);
    desc.offsets.transport = Some(outer.transport_offset as u16);

    let Some(inner_off) = pkt.inner_offset() else {
        return Ok(outer);
    };
    let inner = headers::layout(head, inner_off as usize).ok_or(DropReason::BadNetworkHeader)?;
    let width = if features.contains(Features::ENCAP_OFFLOAD) {
        desc.encap = Some(EncapOffload {
            inner_mac: inner_off as u16,
            inner_network: inner.net_offset as u16,
            inner_transport: inner.transport_offset as u16,
            inner_protocol: inner.proto.map_or(0, |p| p.0),
        });
        return Ok(inner);
    } else if features.contains(Features::OFFSET_OFFLOAD_16) {
        OffsetWidth::W16
    } else if features.contains(Features::OFFSET_OFFLOAD_8) {
        OffsetWidth::W8
    } else {
        throttled!(warn, "device cannot offload encapsulated frames, dropping");
        return Err(DropReason::EncapUnsupported);
    };
    let furthest = inner.transport_offset as u32;
    if furthest > width.max() {
        return Err(DropReason::EncapOffsetOverflow(furthest));
    }
    desc.offset_offload = Some(OffsetOffload {
        width,
        inner_network: inner.net_offset as u16,
        inner_transport: inner.transport_offset as u16,
    });
    Ok(inner)
}

/// Validates a segmentation request and records it as metadata; the frame
/// stays whole on one descriptor.
fn segment(
    desc: &mut DescBox,
    l: &Layout,
    link: LinkLayer,
    frame_len: u32,
    mss: u32,
    mtu: u32,
) -> Result<(), DropReason> {
    if l.proto != Some(IpNumber::TCP) {
        return Err(DropReason::SegmentNotTcp);
    }
    if mss == 0 || mss > u32::from(u16::MAX) {
        return Err(DropReason::SegmentSizeInvalid(mss));
    }
    let tcp_len = l.tcp_len.ok_or(DropReason::BadNetworkHeader)?;
    let hdr_end = (l.transport_offset + tcp_len) as u32;
    let payload = frame_len.saturating_sub(hdr_end);
    if payload <= mss {
        return Err(DropReason::SegmentRunt { payload, mss });
    }
    let headers = hdr_end - link.len as u32;
    if mss + headers > mtu {
        return Err(DropReason::SegmentTooBig { mss, headers, mtu });
    }
    let segs = payload.div_ceil(mss);
    if segs > u32::from(u16::MAX) {
        return Err(DropReason::TooManySegments(segs));
    }
    desc.gso.kind = match l.net {
        NetLayer::Ipv4 => GsoKind::TcpV4,
        NetLayer::Ipv6 => GsoKind::TcpV6,
    };
    desc.gso.size = mss as u16;
    desc.gso.segs = segs as u16;
    desc.gso.ecn = l.tcp_cwr;
    Ok(())
}

fn partial_csum(l: &Layout) -> Result<CsumState, DropReason> {
    let start = l.transport_offset as u16;
    match l.proto {
        Some(p) if p == IpNumber::TCP => Ok(CsumState::Partial {
            start,
            offset: TCP_CSUM_OFFSET,
        }),
        Some(p) if p == IpNumber::UDP => Ok(CsumState::Partial {
            start,
            offset: UDP_CSUM_OFFSET,
        }),
        Some(p) => Err(DropReason::UnsupportedCsum(p.0)),
        None => Err(DropReason::UnsupportedCsum(headers::IPV6_FRAGMENT)),
    }
}
