//! Capability bitmasks exchanged with legacy drivers.

use bitflags::bitflags;

bitflags! {
    /// Offloads a driver advertises at registration time.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct Features: u64 {
        const SG = 1 << 0;
        const IP_CSUM = 1 << 1;
        const HW_CSUM = 1 << 2;
        const IPV6_CSUM = 1 << 3;
        const HW_VLAN_TX = 1 << 4;
        const HW_VLAN_RX = 1 << 5;
        const HW_VLAN_FILTER = 1 << 6;
        const TSO = 1 << 7;
        const TSO6 = 1 << 8;
        const TSO_ECN = 1 << 9;
        const LRO = 1 << 10;
        const RXHASH = 1 << 11;
        /// Dedicated inner-header fields for tunnel offload.
        const ENCAP_OFFLOAD = 1 << 12;
        /// Generic inner offsets, 8 bits wide.
        const OFFSET_OFFLOAD_8 = 1 << 13;
        /// Generic inner offsets, 16 bits wide.
        const OFFSET_OFFLOAD_16 = 1 << 14;
        const NETQUEUE = 1 << 15;
        /// The driver aggregates received TCP segments itself.
        const SW_LRO = 1 << 16;
    }
}

bitflags! {
    /// Global queue capabilities reported by the driver's queue operations.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct NetqFeatures: u32 {
        const RX_QUEUES = 0x1;
        const TX_QUEUES = 0x2;
        /// Filters may be installed on the default queue.
        const DEFAULT_QUEUE_FILTER = 0x4;
    }
}

bitflags! {
    /// Per-queue features, requested through allocation attributes.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct QueueFeatures: u32 {
        const LRO = 0x1;
        const PAIR = 0x2;
        const RSS = 0x4;
        const RSS_DYN = 0x8;
        const LATENCY = 0x10;
        const DYNAMIC = 0x20;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct FilterClass: u32 {
        const MAC = 0x1;
        const VLAN = 0x2;
        const VLAN_MAC = 0x4;
        const VXLAN = 0x8;
        const GENEVE = 0x10;
    }
}
