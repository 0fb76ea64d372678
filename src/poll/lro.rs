//! Software large receive aggregation for TCP over IPv4.
//!
//! A poll context keeps a few sessions, one per flow. In-order segments of a
//! session are held back and merged into one frame with a rewritten header
//! when the session is flushed, at the latest when the callback returns.
//! Anything that cannot join a session passes straight through.

use arrayvec::ArrayVec;
use etherparse::{IpNumber, Ipv4Header};

use crate::api::{CsumVerified, NativePacket, PageAllocator};
use crate::throttle::throttled;
use crate::translate::headers::{self, NetLayer};

/// Sessions tracked per poll context.
pub(crate) const MAX_SESSIONS: usize = 8;

const IPV4_MIN_HEADER: usize = 20;
const TCP_MIN_HEADER: usize = 20;
const TCP_TIMESTAMP_HEADER: usize = 32;
/// NOP, NOP, kind 8, length 10.
const TIMESTAMP_PREAMBLE: [u8; 4] = [1, 1, 8, 10];
const TCP_ACK: u8 = 0x10;
const TCP_PSH: u8 = 0x08;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FlowKey {
    src: [u8; 4],
    dst: [u8; 4],
    sport: u16,
    dport: u16,
    vlan: Option<u16>,
}

/// Header fields of one candidate segment.
#[derive(Clone, Copy, Debug)]
struct Segment {
    key: FlowKey,
    net_offset: usize,
    tcp_offset: usize,
    hdr_len: usize,
    ip_tot_len: u32,
    payload: u32,
    seq: u32,
    ack: u32,
    window: u16,
    /// (tsval, tsecr) when the timestamp option is present.
    tstamp: Option<(u32, u32)>,
}

fn be16(b: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([b[at], b[at + 1]])
}

fn be32(b: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

/// Returns the segment fields when `pkt` may take part in aggregation:
/// checksum verified, plain IPv4 without options or fragmentation, no
/// congestion mark, a bare ACK (PSH allowed) with data, and at most the
/// timestamp option.
fn parse(pkt: &NativePacket) -> Option<Segment> {
    if pkt.large_rx_mss().is_some()
        || pkt.inner_offset().is_some()
        || pkt.csum_verified() == CsumVerified::None
    {
        return None;
    }
    let head = pkt.mapped();
    let l = headers::layout(head, 0)?;
    if l.net != NetLayer::Ipv4 || l.proto != Some(IpNumber::TCP) {
        return None;
    }
    let tcp_len = l.tcp_len?;
    let hdr_len = l.transport_offset + tcp_len;
    let ip = head.get(l.net_offset..l.net_offset + IPV4_MIN_HEADER)?;
    let tcp = head.get(l.transport_offset..hdr_len)?;

    if usize::from(ip[0] & 0x0f) * 4 != IPV4_MIN_HEADER {
        return None;
    }
    let ip_tot_len = u32::from(be16(ip, 2));
    // padded frames would carry trailer bytes into the merge
    if ip_tot_len + l.net_offset as u32 != pkt.frame_len() {
        return None;
    }
    if be16(ip, 6) & 0x3fff != 0 || ip[1] & 0x03 == 0x03 {
        return None;
    }
    if tcp[13] & !TCP_PSH != TCP_ACK {
        return None;
    }
    let payload = ip_tot_len.checked_sub((IPV4_MIN_HEADER + tcp_len) as u32)?;
    if payload == 0 {
        return None;
    }
    let tstamp = match tcp_len {
        TCP_MIN_HEADER => None,
        TCP_TIMESTAMP_HEADER if tcp[20..24] == TIMESTAMP_PREAMBLE => {
            let tsecr = be32(tcp, 28);
            if tsecr == 0 {
                return None;
            }
            Some((be32(tcp, 24), tsecr))
        }
        _ => return None,
    };

    Some(Segment {
        key: FlowKey {
            src: ip[12..16].try_into().ok()?,
            dst: ip[16..20].try_into().ok()?,
            sport: be16(tcp, 0),
            dport: be16(tcp, 2),
            vlan: pkt.vlan().map(|t| t.id),
        },
        net_offset: l.net_offset,
        tcp_offset: l.transport_offset,
        hdr_len,
        ip_tot_len,
        payload,
        seq: be32(tcp, 4),
        ack: be32(tcp, 8),
        window: be16(tcp, 14),
        tstamp,
    })
}

#[derive(Debug)]
struct Session {
    first: Segment,
    pkts: Vec<NativePacket>,
    next_seq: u32,
    ip_tot_len: u32,
    ack: u32,
    window: u16,
    tsval: Option<u32>,
    tsecr: u32,
    mss: u32,
}

impl Session {
    fn start(pkt: NativePacket, seg: Segment) -> Self {
        Self {
            first: seg,
            pkts: vec![pkt],
            next_seq: seg.seq.wrapping_add(seg.payload),
            ip_tot_len: seg.ip_tot_len,
            ack: seg.ack,
            window: seg.window,
            tsval: seg.tstamp.map(|(val, _)| val),
            tsecr: seg.tstamp.map_or(0, |(_, ecr)| ecr),
            mss: seg.payload,
        }
    }

    fn accepts(&self, seg: &Segment) -> bool {
        if seg.seq != self.next_seq || seg.hdr_len != self.first.hdr_len {
            return false;
        }
        if self.ip_tot_len + seg.payload > u32::from(u16::MAX) {
            return false;
        }
        match (self.tsval, seg.tstamp) {
            // timestamps must not go backwards
            (Some(old), Some((new, _))) => (new.wrapping_sub(old) as i32) >= 0,
            (None, None) => true,
            _ => false,
        }
    }

    fn add(&mut self, pkt: NativePacket, seg: &Segment) {
        self.pkts.push(pkt);
        self.next_seq = self.next_seq.wrapping_add(seg.payload);
        self.ip_tot_len += seg.payload;
        self.ack = seg.ack;
        self.window = seg.window;
        // tsval stays at the first segment's value
        if let Some((_, ecr)) = seg.tstamp {
            self.tsecr = ecr;
        }
        self.mss = self.mss.max(seg.payload);
    }

    /// Header of the merged frame: the first segment's, with the totals and
    /// the latest acknowledgment state written in.
    fn merged_header(&self) -> Option<Vec<u8>> {
        let seg = &self.first;
        let mut hdr = self.pkts.first()?.mapped().get(..seg.hdr_len)?.to_vec();

        let (mut ip, _) = Ipv4Header::from_slice(&hdr[seg.net_offset..]).ok()?;
        ip.total_len = u16::try_from(self.ip_tot_len).ok()?;
        ip.header_checksum = ip.calc_header_checksum();
        let mut slot = &mut hdr[seg.net_offset..seg.tcp_offset];
        ip.write(&mut slot).ok()?;

        let tcp = &mut hdr[seg.tcp_offset..];
        tcp[8..12].copy_from_slice(&self.ack.to_be_bytes());
        tcp[14..16].copy_from_slice(&self.window.to_be_bytes());
        if self.tsval.is_some() {
            tcp[28..32].copy_from_slice(&self.tsecr.to_be_bytes());
        }
        Some(hdr)
    }

    /// Emits the session. If the merged header cannot be built the segments
    /// go out one by one, unchanged.
    fn finish(mut self, pages: &PageAllocator, out: &mut Vec<NativePacket>) {
        if self.pkts.len() < 2 {
            out.append(&mut self.pkts);
            return;
        }
        let page = self.merged_header().and_then(|hdr| pages.alloc(&hdr));
        let Some(page) = page else {
            throttled!(
                debug,
                segs = self.pkts.len(),
                "cannot build merged header, delivering segments"
            );
            out.append(&mut self.pkts);
            return;
        };
        let hdr_len = self.first.hdr_len as u32;
        let mut segs = self.pkts.into_iter();
        let Some(mut merged) = segs.next() else {
            page.put();
            return;
        };
        for pkt in segs {
            merged.absorb(pkt, hdr_len);
        }
        merged.replace_header(page, hdr_len);
        merged.set_large_rx(self.mss);
        out.push(merged);
    }
}

/// Per poll context aggregation state.
#[derive(Debug)]
pub(crate) struct Lro {
    max_aggr: usize,
    sessions: ArrayVec<Session, MAX_SESSIONS>,
}

impl Lro {
    /// `max_aggr` segments at most are merged into one frame.
    pub(crate) fn new(max_aggr: u32) -> Self {
        Self {
            max_aggr: max_aggr.max(2) as usize,
            sessions: ArrayVec::new(),
        }
    }

    /// Offers one received packet. Whatever is ready for the host, this
    /// packet or flushed sessions, is appended to `out` in flow order.
    pub(crate) fn receive(
        &mut self,
        pkt: NativePacket,
        mtu: u32,
        pages: &PageAllocator,
        out: &mut Vec<NativePacket>,
    ) {
        let Some(seg) = parse(&pkt) else {
            out.push(pkt);
            return;
        };
        let Some(i) = self.sessions.iter().position(|s| s.first.key == seg.key) else {
            if self.sessions.is_full() {
                out.push(pkt);
            } else {
                self.sessions.push(Session::start(pkt, seg));
            }
            return;
        };

        if !self.sessions[i].accepts(&seg) {
            self.sessions.remove(i).finish(pages, out);
            out.push(pkt);
            return;
        }
        let session = &mut self.sessions[i];
        session.add(pkt, &seg);
        let frame_len = session.ip_tot_len + session.first.net_offset as u32;
        let limit = u32::from(u16::MAX).saturating_sub(mtu);
        if session.pkts.len() >= self.max_aggr || frame_len > limit {
            self.sessions.remove(i).finish(pages, out);
        }
    }

    /// Closes every session.
    pub(crate) fn flush_all(&mut self, pages: &PageAllocator, out: &mut Vec<NativePacket>) {
        for session in self.sessions.drain(..) {
            session.finish(pages, out);
        }
    }

    #[cfg(test)]
    fn sessions(&self) -> usize {
        self.sessions.len()
    }
}
