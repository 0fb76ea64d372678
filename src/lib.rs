pub mod api;
pub mod buffer_pool;
pub mod capabilities;
pub mod config;
pub mod device;
pub mod driver;
pub mod errors;
pub mod host;
pub mod loopback;
pub mod netqueue;
pub mod poll;
pub mod registry;
pub mod stats;
pub(crate) mod throttle;
mod translate;
pub mod xmit;

pub use config::ShimFlags;
pub use device::NetDevice;
pub use driver::{DriverError, NetDriver, QueueOps};
pub use errors::{DropReason, Error};
pub use host::{HostStack, RxSource};
pub use registry::Registry;
