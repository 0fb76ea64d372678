//! Lock-free datapath counters.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct QueueStats {
    packets: AtomicU64,
    bytes: AtomicU64,
    dropped: AtomicU64,
}

impl QueueStats {
    pub fn record(&self, bytes: u64) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn drop_n(&self, n: u64) {
        self.dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> QueueCounters {
        QueueCounters {
            packets: self.packets.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueCounters {
    pub packets: u64,
    pub bytes: u64,
    pub dropped: u64,
}

impl std::ops::AddAssign for QueueCounters {
    fn add_assign(&mut self, rhs: Self) {
        self.packets += rhs.packets;
        self.bytes += rhs.bytes;
        self.dropped += rhs.dropped;
    }
}

/// Device-wide totals.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceCounters {
    pub rx: QueueCounters,
    pub tx: QueueCounters,
    /// Received packets the host has released.
    pub rx_released: u64,
    pub watchdog_hits: u64,
}
