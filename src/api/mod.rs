//! Types shared by the driver side and the host side of the shim.

pub mod buffer;
pub mod features;
pub(crate) mod hint;
pub mod metadata;
pub mod packet;
pub mod page;

pub use buffer::{
    BufferDesc, CsumState, EncapOffload, FragOwner, Fragment, GsoKind, GsoParams,
    HeaderOffsets, MAX_FRAGS, OffsetOffload, OffsetWidth,
};
pub use features::{Features, FilterClass, NetqFeatures, QueueFeatures};
pub use metadata::{CsumVerified, RssHash, RssHashType, VlanTag};
pub use packet::{Completion, NativePacket, SgElem};
pub use page::{Page, PageAllocator, PageRef};

pub type Result<T> = std::result::Result<T, crate::errors::Error>;

/// Descriptor allocated from a device pool.
pub type DescBox = crate::buffer_pool::PoolBox<BufferDesc>;
pub type DescPool = crate::buffer_pool::Pool<BufferDesc>;
