//! The host stack's packet handle.

use std::fmt;

use super::metadata::{CsumVerified, RssHash, VlanTag};
use super::page::{PageAllocator, PageRef};
use crate::netqueue::HostQueueId;

/// One scatter/gather element. The packet holds one release obligation on
/// `page` for every element.
#[derive(Clone, Debug)]
pub struct SgElem {
    pub page: PageRef,
    pub offset: u32,
    pub len: u32,
}

impl SgElem {
    pub fn bytes(&self) -> &[u8] {
        let start = self.offset as usize;
        &self.page.bytes()[start..start + self.len as usize]
    }
}

/// Owner cleanup run when the host releases the packet.
pub struct Completion {
    cookie: u64,
    callback: Box<dyn FnOnce(u64) + Send>,
}

impl Completion {
    pub fn new(cookie: u64, callback: impl FnOnce(u64) + Send + 'static) -> Self {
        Self {
            cookie,
            callback: Box::new(callback),
        }
    }

    pub fn cookie(&self) -> u64 {
        self.cookie
    }
}

/// Opaque packet owned by the host stack.
///
/// The handle is move-only. Dropping it is the one and only release: the
/// completion (if any) runs and every scatter/gather page is put.
pub struct NativePacket {
    sg: Vec<SgElem>,
    frame_len: u32,
    must_csum: bool,
    tso_mss: Option<u32>,
    large_rx_mss: Option<u32>,
    vlan: Option<VlanTag>,
    inner_offset: Option<u32>,
    rss: Option<RssHash>,
    csum: CsumVerified,
    queue: Option<HostQueueId>,
    completion: Option<Completion>,
    /// Completions of packets merged into this one.
    absorbed: Vec<Completion>,
}

/// Keeps bytes `start..start + len` of `sg`, putting the pages of elements
/// that fall outside.
fn keep_range(sg: &mut Vec<SgElem>, start: u32, len: u32) {
    let mut skip = start;
    let mut left = len;
    sg.retain_mut(|elem| {
        if skip >= elem.len || left == 0 {
            skip = skip.saturating_sub(elem.len);
            elem.page.put();
            return false;
        }
        elem.offset += skip;
        elem.len -= skip;
        skip = 0;
        elem.len = elem.len.min(left);
        left -= elem.len;
        true
    });
}

impl NativePacket {
    /// Wraps `sg`, taking over one release obligation per element.
    pub fn new(sg: Vec<SgElem>, frame_len: u32) -> Self {
        Self {
            sg,
            frame_len,
            must_csum: false,
            tso_mss: None,
            large_rx_mss: None,
            vlan: None,
            inner_offset: None,
            rss: None,
            csum: CsumVerified::None,
            queue: None,
            completion: None,
            absorbed: Vec::new(),
        }
    }

    /// Copies `frame` into freshly allocated pages: `head_len` bytes in the
    /// first element, the rest split into `frag_len` sized elements.
    pub fn from_frame(
        pages: &PageAllocator,
        frame: &[u8],
        head_len: usize,
        frag_len: usize,
    ) -> Option<Self> {
        let head_len = head_len.min(frame.len());
        let mut sg = Vec::new();
        let page = pages.alloc(&frame[..head_len])?;
        sg.push(SgElem {
            page,
            offset: 0,
            len: head_len as u32,
        });
        for chunk in frame[head_len..].chunks(frag_len.max(1)) {
            let Some(page) = pages.alloc(chunk) else {
                // release what was built so far
                drop(Self::new(sg, 0));
                return None;
            };
            sg.push(SgElem {
                page,
                offset: 0,
                len: chunk.len() as u32,
            });
        }
        Some(Self::new(sg, frame.len() as u32))
    }

    pub fn sg(&self) -> &[SgElem] {
        &self.sg
    }

    pub fn frame_len(&self) -> u32 {
        self.frame_len
    }

    /// Bytes of the first scatter/gather element, where headers live.
    pub fn mapped(&self) -> &[u8] {
        self.sg.first().map(SgElem::bytes).unwrap_or(&[])
    }

    /// Copies the frame into one contiguous buffer.
    pub fn linearize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.frame_len as usize);
        for elem in &self.sg {
            out.extend_from_slice(elem.bytes());
        }
        out.truncate(self.frame_len as usize);
        out
    }

    pub fn must_csum(&self) -> bool {
        self.must_csum
    }

    pub fn set_must_csum(&mut self, on: bool) {
        self.must_csum = on;
    }

    /// Segment size when the host asks for segmentation offload.
    pub fn tso_mss(&self) -> Option<u32> {
        self.tso_mss
    }

    pub fn set_tso(&mut self, mss: Option<u32>) {
        self.tso_mss = mss;
    }

    /// Segment size of an aggregated receive.
    pub fn large_rx_mss(&self) -> Option<u32> {
        self.large_rx_mss
    }

    pub(crate) fn set_large_rx(&mut self, mss: u32) {
        self.large_rx_mss = Some(mss);
    }

    pub fn vlan(&self) -> Option<VlanTag> {
        self.vlan
    }

    pub fn set_vlan(&mut self, tag: Option<VlanTag>) {
        self.vlan = tag;
    }

    /// Offset of the inner link-layer header of a tunneled frame.
    pub fn inner_offset(&self) -> Option<u32> {
        self.inner_offset
    }

    pub fn set_encap(&mut self, inner_offset: Option<u32>) {
        self.inner_offset = inner_offset;
    }

    pub fn rss(&self) -> Option<RssHash> {
        self.rss
    }

    pub fn set_rss(&mut self, rss: Option<RssHash>) {
        self.rss = rss;
    }

    pub fn csum_verified(&self) -> CsumVerified {
        self.csum
    }

    pub(crate) fn set_csum_verified(&mut self, csum: CsumVerified) {
        self.csum = csum;
    }

    pub fn queue(&self) -> Option<HostQueueId> {
        self.queue
    }

    pub fn set_queue(&mut self, queue: Option<HostQueueId>) {
        self.queue = queue;
    }

    pub fn completion_cookie(&self) -> Option<u64> {
        self.completion.as_ref().map(Completion::cookie)
    }

    pub fn set_completion(&mut self, completion: Completion) {
        self.completion = Some(completion);
    }

    /// Swaps the first `hdr_len` bytes for the contents of `page`.
    pub(crate) fn replace_header(&mut self, page: PageRef, hdr_len: u32) {
        let rest = self.frame_len.saturating_sub(hdr_len);
        keep_range(&mut self.sg, hdr_len, rest);
        self.sg.insert(
            0,
            SgElem {
                page,
                offset: 0,
                len: hdr_len,
            },
        );
    }

    /// Appends `other` without its first `skip` bytes. Its pages and
    /// completions now travel with `self`.
    pub(crate) fn absorb(&mut self, mut other: NativePacket, skip: u32) {
        let payload = other.frame_len.saturating_sub(skip);
        let mut tail = std::mem::take(&mut other.sg);
        keep_range(&mut tail, skip, payload);
        self.absorbed.extend(other.completion.take());
        self.absorbed.append(&mut other.absorbed);
        keep_range(&mut self.sg, 0, self.frame_len);
        self.sg.append(&mut tail);
        self.frame_len += payload;
    }
}

impl Drop for NativePacket {
    fn drop(&mut self) {
        for done in self.completion.take().into_iter().chain(self.absorbed.drain(..)) {
            (done.callback)(done.cookie);
        }
        for elem in &self.sg {
            elem.page.put();
        }
    }
}

impl fmt::Debug for NativePacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativePacket")
            .field("frame_len", &self.frame_len)
            .field("nr_sg", &self.sg.len())
            .field("must_csum", &self.must_csum)
            .field("tso_mss", &self.tso_mss)
            .field("vlan", &self.vlan)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}
