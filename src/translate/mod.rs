//! Conversion between driver descriptors and host packets.
//!
//! Nothing here fails a device: a packet that cannot be converted comes
//! back as a [`DropReason`](crate::errors::DropReason) for the caller to
//! count.

pub(crate) mod headers;
mod rx;
mod tx;

pub(crate) use rx::{RxEnv, to_native};
pub(crate) use tx::{TxDrop, TxEnv, to_desc};
