use thiserror::Error;

use crate::driver::DriverError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Can't allocate memory")]
    NoMemory,
    #[error("operation not supported by the driver")]
    NotSupported,
    #[error("driver failed: {0}")]
    Failure(&'static str),
    #[error("{what} too large: {len} > {max}")]
    LimitExceeded {
        what: &'static str,
        len: usize,
        max: usize,
    },
    #[error("invalid queue id {0:#x}")]
    InvalidQueue(u64),
    #[error("invalid filter id {0}")]
    InvalidFilter(u32),
    #[error("device name {0} already registered")]
    NameInUse(String),
    #[error("no such device: {0}")]
    NoDevice(String),
    #[error("host queue ids exhausted")]
    QueueIdsExhausted,
    #[error("panic transmit: {0}")]
    PanicPrecondition(&'static str),
    #[error("driver returned status {0}")]
    Driver(i32),
}

impl From<DriverError> for Error {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::NotSupported => Error::NotSupported,
            DriverError::NoMemory => Error::NoMemory,
            DriverError::Status(code) => Error::Driver(code),
        }
    }
}

/// Why the datapath dropped a packet. Drops are counted, never surfaced
/// to the caller as errors.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    #[error("device is blocked")]
    Blocked,
    #[error("zero length frame")]
    ZeroLength,
    #[error("descriptor layout does not match its length")]
    BadLayout,
    #[error("large receive without a segment size")]
    ZeroSegmentSize,
    #[error("unsupported segmentation type")]
    UnsupportedGso,
    #[error("vlan id {0} out of range")]
    InvalidVlan(u16),
    #[error("descriptor pool exhausted")]
    NoDescriptor,
    #[error("cannot locate link layer header")]
    BadLinkHeader,
    #[error("cannot locate network header")]
    BadNetworkHeader,
    #[error("segmentation requested for a non-IP frame")]
    SegmentNotIp,
    #[error("segmentation requested for a non-TCP frame")]
    SegmentNotTcp,
    #[error("runt segmentation request: payload {payload} <= mss {mss}")]
    SegmentRunt { payload: u32, mss: u32 },
    #[error("segment size {0} out of range")]
    SegmentSizeInvalid(u32),
    #[error("{0} segments do not fit one descriptor")]
    TooManySegments(u32),
    #[error("segment of {mss} + {headers} header bytes exceeds mtu {mtu}")]
    SegmentTooBig { mss: u32, headers: u32, mtu: u32 },
    #[error("frame payload {len} exceeds mtu {mtu}")]
    TooBig { len: u32, mtu: u32 },
    #[error("checksum offload requested for ip protocol {0}")]
    UnsupportedCsum(u8),
    #[error("encapsulated offload not supported by the device")]
    EncapUnsupported,
    #[error("inner header offset {0} does not fit the offload width")]
    EncapOffsetOverflow(u32),
    #[error("too many fragments")]
    TooManyFrags,
    #[error("vlan insertion not supported by the device")]
    VlanUnsupported,
}
