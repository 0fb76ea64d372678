//! The legacy driver-facing buffer descriptor.
//!
//! Every page referenced by a descriptor carries a [`FragOwner`] tag. Pages
//! tagged [`FragOwner::Shim`] are put when the descriptor is recycled; pages
//! tagged [`FragOwner::Host`] belong to a native packet and are left alone.

use std::fmt;

use arrayvec::ArrayVec;

use super::metadata::{RssHash, VlanTag};
use super::packet::{NativePacket, SgElem};
use super::page::PageRef;
use crate::buffer_pool::Recycle;

/// Fragment slots per descriptor: 64 KiB of 4 KiB pages plus two.
pub const MAX_FRAGS: usize = 65536 / 4096 + 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FragOwner {
    Shim,
    Host,
}

/// A page region referenced by a descriptor.
#[derive(Clone)]
pub struct Fragment {
    page: PageRef,
    offset: u32,
    len: u32,
    owner: FragOwner,
}

impl Fragment {
    pub fn page(&self) -> &PageRef {
        &self.page
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn owner(&self) -> FragOwner {
        self.owner
    }

    pub fn bytes(&self) -> &[u8] {
        let start = self.offset as usize;
        &self.page.bytes()[start..start + self.len as usize]
    }

    /// Moves the release obligation to the host. Happens once per fragment.
    fn hand_to_host(&mut self) -> SgElem {
        assert_eq!(
            self.owner,
            FragOwner::Shim,
            "fragment of page {} handed to the host twice",
            self.page.id()
        );
        self.owner = FragOwner::Host;
        SgElem {
            page: self.page.clone(),
            offset: self.offset,
            len: self.len,
        }
    }

    fn release(&self) {
        if self.owner == FragOwner::Shim {
            self.page.put();
        }
    }
}

impl fmt::Debug for Fragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fragment")
            .field("page", &self.page.id())
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("owner", &self.owner)
            .finish()
    }
}

/// Linear head of a descriptor: `data..tail` is valid, `end` is the room.
#[derive(Debug, Clone)]
pub struct HeadRegion {
    region: Fragment,
    end: u32,
}

impl HeadRegion {
    pub fn data(&self) -> u32 {
        self.region.offset
    }

    pub fn tail(&self) -> u32 {
        self.region.offset + self.region.len
    }

    pub fn end(&self) -> u32 {
        self.end
    }

    pub fn owner(&self) -> FragOwner {
        self.region.owner
    }

    pub fn bytes(&self) -> &[u8] {
        self.region.bytes()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CsumState {
    #[default]
    None,
    /// Receive: hardware verified the checksum.
    Unnecessary,
    /// Receive: hardware verified outer and inner checksums.
    UnnecessaryEncap,
    /// Transmit: checksum over `start..` stored at `start + offset`.
    Partial { start: u16, offset: u16 },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GsoKind {
    #[default]
    None,
    TcpV4,
    TcpV6,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GsoParams {
    pub kind: GsoKind,
    pub size: u16,
    pub segs: u16,
    /// Segments carry CWR and must be ECN-marked.
    pub ecn: bool,
}

/// Header offsets from the start of the frame. Only filled in when an
/// offload needs them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeaderOffsets {
    pub mac_len: u16,
    pub network: Option<u16>,
    pub transport: Option<u16>,
}

/// Inner header locations for devices with dedicated tunnel offload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EncapOffload {
    pub inner_mac: u16,
    pub inner_network: u16,
    pub inner_transport: u16,
    pub inner_protocol: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OffsetWidth {
    W8,
    W16,
}

impl OffsetWidth {
    pub fn max(&self) -> u32 {
        match self {
            OffsetWidth::W8 => u8::MAX as u32,
            OffsetWidth::W16 => u16::MAX as u32,
        }
    }
}

/// Generic offset offload: the device checksums/segments the inner frame
/// given only the inner header offsets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OffsetOffload {
    pub width: OffsetWidth,
    pub inner_network: u16,
    pub inner_transport: u16,
}

/// Packet as the legacy driver sees it.
#[derive(Debug, Default)]
pub struct BufferDesc {
    head: Option<HeadRegion>,
    frags: ArrayVec<Fragment, MAX_FRAGS>,
    len: u32,
    data_len: u32,
    /// Ethertype of the outermost network header.
    pub protocol: u16,
    pub offsets: HeaderOffsets,
    pub csum: CsumState,
    pub gso: GsoParams,
    pub vlan: Option<VlanTag>,
    pub encap: Option<EncapOffload>,
    pub offset_offload: Option<OffsetOffload>,
    pub rss: Option<RssHash>,
    /// Index of the queue that produced or must consume the descriptor.
    pub queue_mapping: u16,
    pkt: Option<NativePacket>,
}

impl BufferDesc {
    /// Total frame length, head plus fragments.
    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes held in fragments.
    pub fn data_len(&self) -> u32 {
        self.data_len
    }

    pub fn head_len(&self) -> u32 {
        self.len - self.data_len
    }

    pub fn head(&self) -> Option<&HeadRegion> {
        self.head.as_ref()
    }

    pub fn data(&self) -> &[u8] {
        self.head.as_ref().map(HeadRegion::bytes).unwrap_or(&[])
    }

    pub fn frags(&self) -> &[Fragment] {
        &self.frags
    }

    pub fn nr_frags(&self) -> usize {
        self.frags.len()
    }

    /// Attaches a driver-filled receive page as the linear head. The
    /// descriptor takes over the page's release obligation.
    pub fn set_head(&mut self, page: PageRef, len: u32) {
        assert!(self.head.is_none(), "descriptor head already set");
        let len = len.min(page.len() as u32);
        let end = page.len() as u32;
        self.head = Some(HeadRegion {
            region: Fragment {
                page,
                offset: 0,
                len,
                owner: FragOwner::Shim,
            },
            end,
        });
        self.len += len;
    }

    /// Appends a receive fragment. Gives the page back if the table is full.
    pub fn add_rx_frag(&mut self, page: PageRef, offset: u32, len: u32) -> Result<(), PageRef> {
        if self.frags.is_full() {
            return Err(page);
        }
        self.frags.push(Fragment {
            page,
            offset,
            len,
            owner: FragOwner::Shim,
        });
        self.len += len;
        self.data_len += len;
        Ok(())
    }

    pub fn set_rx_gso(&mut self, kind: GsoKind, size: u16) {
        self.gso.kind = kind;
        self.gso.size = size;
    }

    pub fn set_vlan_tci(&mut self, tci: u16) {
        self.vlan = Some(VlanTag::from_tci(tci));
    }

    /// Copies the frame into one buffer.
    pub fn linearize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len as usize);
        out.extend_from_slice(self.data());
        for frag in &self.frags {
            out.extend_from_slice(frag.bytes());
        }
        out
    }

    /// The native packet this transmit descriptor was built from.
    pub fn packet(&self) -> Option<&NativePacket> {
        self.pkt.as_ref()
    }

    pub(crate) fn attach_packet(&mut self, pkt: NativePacket) {
        self.pkt = Some(pkt);
    }

    pub(crate) fn take_packet(&mut self) -> Option<NativePacket> {
        self.pkt.take()
    }

    /// Points the head at host memory without taking an obligation.
    pub(crate) fn set_host_head(&mut self, elem: &SgElem, len: u32) {
        let len = len.min(elem.len);
        self.head = Some(HeadRegion {
            region: Fragment {
                page: elem.page.clone(),
                offset: elem.offset,
                len,
                owner: FragOwner::Host,
            },
            end: elem.offset + elem.len,
        });
        self.len += len;
    }

    pub(crate) fn push_host_frag(&mut self, elem: &SgElem, len: u32) -> bool {
        if self.frags.is_full() {
            return false;
        }
        self.frags.push(Fragment {
            page: elem.page.clone(),
            offset: elem.offset,
            len,
            owner: FragOwner::Host,
        });
        self.len += len;
        self.data_len += len;
        true
    }

    /// Flips every shim-owned region to host ownership and returns the
    /// matching scatter/gather list. An empty head stays with the shim.
    pub(crate) fn transfer_to_host(&mut self) -> Vec<SgElem> {
        let mut sg = Vec::with_capacity(self.frags.len() + 1);
        if let Some(head) = self.head.as_mut() {
            if !head.region.is_empty() {
                sg.push(head.region.hand_to_host());
            }
        }
        for frag in self.frags.iter_mut() {
            sg.push(frag.hand_to_host());
        }
        sg
    }
}

impl Recycle for BufferDesc {
    fn recycle(&mut self) {
        if let Some(head) = self.head.take() {
            head.region.release();
        }
        for frag in self.frags.drain(..) {
            frag.release();
        }
        // Anything still attached goes back to the host free path.
        self.pkt = None;
        self.len = 0;
        self.data_len = 0;
        self.protocol = 0;
        self.offsets = HeaderOffsets::default();
        self.csum = CsumState::None;
        self.gso = GsoParams::default();
        self.vlan = None;
        self.encap = None;
        self.offset_offload = None;
        self.rss = None;
        self.queue_mapping = 0;
    }
}

impl Drop for BufferDesc {
    fn drop(&mut self) {
        self.recycle();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::page::PageAllocator;

    #[test]
    fn recycle_puts_shim_pages_only() {
        let pages = PageAllocator::default();
        let mut desc = BufferDesc::default();
        desc.set_head(pages.alloc(&[0; 64]).unwrap(), 64);
        desc.add_rx_frag(pages.alloc(&[1; 100]).unwrap(), 0, 100)
            .unwrap();
        assert_eq!(desc.len(), 164);
        assert_eq!(desc.data_len(), 100);

        let sg = desc.transfer_to_host();
        assert_eq!(sg.len(), 2);
        assert!(desc.frags().iter().all(|f| f.owner() == FragOwner::Host));

        desc.recycle();
        assert_eq!(pages.outstanding(), 2);
        drop(NativePacket::new(sg, 164));
        assert_eq!(pages.outstanding(), 0);
    }

    #[test]
    #[should_panic(expected = "handed to the host twice")]
    fn second_transfer_is_fatal() {
        let pages = PageAllocator::default();
        let mut desc = BufferDesc::default();
        desc.set_head(pages.alloc(&[0; 64]).unwrap(), 64);
        let _first = desc.transfer_to_host();
        let _second = desc.transfer_to_host();
    }

    #[test]
    fn frag_table_is_capped() {
        let pages = PageAllocator::default();
        let mut desc = BufferDesc::default();
        for _ in 0..MAX_FRAGS {
            desc.add_rx_frag(pages.alloc(&[0; 8]).unwrap(), 0, 8).unwrap();
        }
        let extra = pages.alloc(&[0; 8]).unwrap();
        let back = desc.add_rx_frag(extra, 0, 8).unwrap_err();
        back.put();
        desc.recycle();
        assert_eq!(pages.outstanding(), 0);
    }
}
