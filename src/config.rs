use std::time::Duration;

/// -------- Flags ------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct ShimFlags {
    /// Initial MTU of the device.
    pub mtu: u32,
    /// Number of transmit rings exposed to the driver (at least one).
    pub num_tx_queues: u16,
    /// Buffer descriptors preallocated per device.
    pub desc_pool_size: usize,
    /// Dedicated host poll primitives per device; further poll contexts
    /// share the backup primitive.
    pub max_net_polls: usize,
    /// Ticks a blocking disable waits for a running poll callback.
    pub disable_timeout_ticks: u32,
    pub disable_tick: Duration,
    /// Cap on outstanding pages, `None` for unlimited.
    pub page_limit: Option<usize>,
    /// Segments merged per software large receive; 0 or 1 turns it off.
    pub lro_max_aggr: u32,
    /// Device name; a `%d` is replaced with the lowest free unit number.
    pub name: String,
}

impl Default for ShimFlags {
    fn default() -> Self {
        Self {
            mtu: 1500,
            num_tx_queues: 1,
            desc_pool_size: 1024,
            max_net_polls: 32,
            disable_timeout_ticks: 50,
            disable_tick: Duration::from_millis(1),
            page_limit: None,
            lro_max_aggr: 0,
            name: "vmnic%d".to_string(),
        }
    }
}
