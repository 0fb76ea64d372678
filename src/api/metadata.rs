//! Offload metadata shared by both packet representations.

/// 802.1Q tag carried out of band.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VlanTag {
    /// VLAN identifier, 12 bits.
    pub id: u16,
    /// Priority code point, 3 bits.
    pub priority: u8,
}

impl VlanTag {
    /// Highest id a frame may carry; 4095 is reserved.
    pub const MAX_VALID_ID: u16 = 4094;
    const PRIO_SHIFT: u16 = 13;

    pub fn new(id: u16, priority: u8) -> Self {
        Self { id, priority }
    }

    /// Splits a tag control word. The drop-eligible bit is discarded.
    pub fn from_tci(tci: u16) -> Self {
        Self {
            id: tci & 0x0fff,
            priority: (tci >> Self::PRIO_SHIFT) as u8,
        }
    }

    pub fn tci(&self) -> u16 {
        (u16::from(self.priority & 0x7) << Self::PRIO_SHIFT) | (self.id & 0x0fff)
    }

    pub fn is_valid(&self) -> bool {
        self.id <= Self::MAX_VALID_ID
    }
}

/// Hash function that produced an RSS value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum RssHashType {
    #[default]
    Opaque,
    Ipv4,
    TcpIpv4,
    UdpIpv4,
    Ipv6,
    TcpIpv6,
    UdpIpv6,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RssHash {
    pub value: u32,
    pub kind: RssHashType,
}

/// Receive checksum state as reported to the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CsumVerified {
    #[default]
    None,
    Verified,
    /// Both outer and inner checksums of a tunneled frame were verified.
    EncapVerified,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tci_roundtrip_keeps_priority() {
        let tag = VlanTag::from_tci(0xa00c);
        assert_eq!(tag.id, 12);
        assert_eq!(tag.priority, 5);
        assert_eq!(tag.tci(), 0xa00c);
    }

    #[test]
    fn reserved_id_is_invalid() {
        assert!(VlanTag::new(4094, 0).is_valid());
        assert!(!VlanTag::new(4095, 0).is_valid());
    }
}
