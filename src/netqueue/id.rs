//! Queue and filter identifiers in the driver's and the host's numbering.

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueueType {
    Rx,
    Tx,
}

impl QueueType {
    const RX_BITS: u32 = 1;
    const TX_BITS: u32 = 2;

    fn bits(self) -> u32 {
        match self {
            QueueType::Rx => Self::RX_BITS,
            QueueType::Tx => Self::TX_BITS,
        }
    }

    fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            Self::RX_BITS => Some(QueueType::Rx),
            Self::TX_BITS => Some(QueueType::Tx),
            _ => None,
        }
    }
}

/// Driver queue id: type in bits 16..24, ring index in the low 16 bits.
/// The raw value 0 is never valid.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId(u32);

impl QueueId {
    const TYPE_SHIFT: u32 = 16;

    pub fn new(ty: QueueType, index: u16) -> Self {
        Self((ty.bits() << Self::TYPE_SHIFT) | u32::from(index))
    }

    pub fn rx(index: u16) -> Self {
        Self::new(QueueType::Rx, index)
    }

    pub fn tx(index: u16) -> Self {
        Self::new(QueueType::Tx, index)
    }

    pub fn from_raw(raw: u32) -> Option<Self> {
        QueueType::from_bits((raw >> Self::TYPE_SHIFT) & 0xff).map(|_| Self(raw))
    }

    pub fn raw(&self) -> u32 {
        self.0
    }

    pub fn index(&self) -> u16 {
        (self.0 & 0xffff) as u16
    }

    pub fn queue_type(&self) -> QueueType {
        // constructors only build valid type bits
        QueueType::from_bits((self.0 >> Self::TYPE_SHIFT) & 0xff).unwrap_or(QueueType::Rx)
    }

    /// The default queue of either direction has ring index zero.
    pub fn is_default(&self) -> bool {
        self.index() == 0
    }
}

impl fmt::Debug for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}#{}", self.queue_type(), self.index())
    }
}

/// Host queue id: a 32-bit generation above the driver id, so that a freed
/// queue's id is never handed out again.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostQueueId(u64);

impl HostQueueId {
    const GEN_SHIFT: u32 = 32;

    pub fn new(generation: u32, queue: QueueId) -> Self {
        Self((u64::from(generation) << Self::GEN_SHIFT) | u64::from(queue.raw()))
    }

    pub fn from_raw(raw: u64) -> Option<Self> {
        QueueId::from_raw(raw as u32).map(|_| Self(raw))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    pub fn generation(&self) -> u32 {
        (self.0 >> Self::GEN_SHIFT) as u32
    }

    pub fn driver_id(&self) -> QueueId {
        QueueId(self.0 as u32)
    }

    pub fn queue_type(&self) -> QueueType {
        self.driver_id().queue_type()
    }
}

impl fmt::Debug for HostQueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}@{}", self.driver_id(), self.generation())
    }
}

/// Filter id assigned by the driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FilterId(pub u32);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_id_encoding() {
        let q = QueueId::tx(3);
        assert_eq!(q.raw(), 0x0002_0003);
        assert_eq!(q.queue_type(), QueueType::Tx);
        assert_eq!(q.index(), 3);
        assert!(QueueId::from_raw(0).is_none());
        assert!(QueueId::from_raw(0x0005_0001).is_none());
    }

    #[test]
    fn host_id_carries_generation() {
        let a = HostQueueId::new(1, QueueId::rx(2));
        let b = HostQueueId::new(2, QueueId::rx(2));
        assert_ne!(a, b);
        assert_eq!(a.driver_id(), b.driver_id());
        assert_eq!(b.generation(), 2);
        assert_eq!(HostQueueId::from_raw(b.raw()), Some(b));

        let last = HostQueueId::new(u32::MAX, QueueId::tx(7));
        assert_eq!(last.generation(), u32::MAX);
        assert_eq!(last.driver_id(), QueueId::tx(7));
    }
}
