//! Header boundary discovery on the mapped head of a frame.
//!
//! Only header parsers are used, the payload may live in fragments.

use etherparse::{
    EtherType, Ethernet2Header, IpNumber, Ipv4Header, Ipv6Header, SingleVlanHeader, TcpHeader,
};

const IPV6_HOP_BY_HOP: u8 = 0;
const IPV6_ROUTING: u8 = 43;
pub(crate) const IPV6_FRAGMENT: u8 = 44;
const IPV6_AUTH: u8 = 51;
const IPV6_DEST_OPTS: u8 = 60;

/// Ethernet header plus any VLAN tags.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct LinkLayer {
    pub len: usize,
    pub ether_type: EtherType,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum NetLayer {
    Ipv4,
    Ipv6,
}

/// Network and transport boundaries, offsets relative to `base`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Layout {
    pub link: LinkLayer,
    pub net: NetLayer,
    pub net_offset: usize,
    /// `None` when the transport header is hidden behind a fragment header.
    pub proto: Option<IpNumber>,
    pub transport_offset: usize,
    /// TCP header length when the transport is TCP and fits in the head.
    pub tcp_len: Option<usize>,
    pub tcp_cwr: bool,
}

pub(crate) fn link_layer(frame: &[u8]) -> Option<LinkLayer> {
    let (eth, mut rest) = Ethernet2Header::from_slice(frame).ok()?;
    let mut len = Ethernet2Header::LEN;
    let mut ether_type = eth.ether_type;
    while ether_type == EtherType::VLAN_TAGGED_FRAME
        || ether_type == EtherType::PROVIDER_BRIDGING
        || ether_type == EtherType::VLAN_DOUBLE_TAGGED_FRAME
    {
        let (vlan, next) = SingleVlanHeader::from_slice(rest).ok()?;
        len += SingleVlanHeader::LEN;
        ether_type = vlan.ether_type;
        rest = next;
    }
    Some(LinkLayer { len, ether_type })
}

/// Walks IPv6 extension headers. Returns the header chain length and the
/// upper protocol, or `None` for the protocol if a fragment header was hit.
fn ipv6_chain(mut next: u8, bytes: &[u8]) -> Option<(usize, Option<u8>)> {
    let mut off = 0usize;
    loop {
        let ext_len = match next {
            IPV6_HOP_BY_HOP | IPV6_ROUTING | IPV6_DEST_OPTS => {
                (usize::from(*bytes.get(off + 1)?) + 1) * 8
            }
            IPV6_AUTH => (usize::from(*bytes.get(off + 1)?) + 2) * 4,
            IPV6_FRAGMENT => return Some((off + 8, None)),
            proto => return Some((off, Some(proto))),
        };
        next = *bytes.get(off)?;
        off += ext_len;
    }
}

/// Locates the headers of the frame starting at `base` within `head`.
pub(crate) fn layout(head: &[u8], base: usize) -> Option<Layout> {
    let frame = head.get(base..)?;
    let link = link_layer(frame)?;
    let net_bytes = frame.get(link.len..)?;

    let (net, net_len, proto) = if link.ether_type == EtherType::IPV4 {
        let (ip, _) = Ipv4Header::from_slice(net_bytes).ok()?;
        (NetLayer::Ipv4, usize::from(ip.header_len()), Some(ip.protocol))
    } else if link.ether_type == EtherType::IPV6 {
        let (ip, rest) = Ipv6Header::from_slice(net_bytes).ok()?;
        let (ext_len, proto) = ipv6_chain(ip.next_header.0, rest)?;
        (NetLayer::Ipv6, Ipv6Header::LEN + ext_len, proto.map(IpNumber))
    } else {
        return None;
    };

    let net_offset = base + link.len;
    let transport_offset = net_offset + net_len;
    let (tcp_len, tcp_cwr) = match (proto, head.get(transport_offset..)) {
        (Some(p), Some(bytes)) if p == IpNumber::TCP => match TcpHeader::from_slice(bytes) {
            Ok((tcp, _)) => (Some(usize::from(tcp.header_len())), tcp.cwr),
            Err(_) => (None, false),
        },
        _ => (None, false),
    };

    Some(Layout {
        link,
        net,
        net_offset,
        proto,
        transport_offset,
        tcp_len,
        tcp_cwr,
    })
}
