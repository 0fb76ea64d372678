//! Capability negotiation with the host.
//!
//! Each offload the driver advertises becomes one host capability, either
//! unconditionally on or backed by an operation table the host calls into.

use crate::api::Features;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Capability {
    ScatterGather,
    Ipv4Csum,
    Ipv6Csum,
    Tso,
    Tso6,
    VlanTxInsert,
    VlanRxStrip,
    VlanFilter,
    EncapOffload,
    RxHash,
    Lro,
    Netqueue,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpsTable {
    VlanFilter,
    Netqueue,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Binding {
    Always,
    Ops(OpsTable),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CapabilityTable {
    entries: Vec<(Capability, Binding)>,
}

impl CapabilityTable {
    /// Derives the host capabilities from a driver's feature bits.
    ///
    /// Segmentation is only offered together with scatter/gather and a
    /// matching checksum offload, since the host hands segmentation frames
    /// with a partial checksum in fragments.
    pub fn negotiate(features: Features) -> Self {
        let mut table = Self::default();
        let v4_csum = features.intersects(Features::IP_CSUM | Features::HW_CSUM);
        let v6_csum = features.intersects(Features::IPV6_CSUM | Features::HW_CSUM);
        let sg = features.contains(Features::SG);

        let always = [
            (sg, Capability::ScatterGather),
            (v4_csum, Capability::Ipv4Csum),
            (v6_csum, Capability::Ipv6Csum),
            (
                sg && v4_csum && features.contains(Features::TSO),
                Capability::Tso,
            ),
            (
                sg && v6_csum && features.contains(Features::TSO6),
                Capability::Tso6,
            ),
            (features.contains(Features::HW_VLAN_TX), Capability::VlanTxInsert),
            (features.contains(Features::HW_VLAN_RX), Capability::VlanRxStrip),
            (
                features.intersects(
                    Features::ENCAP_OFFLOAD
                        | Features::OFFSET_OFFLOAD_8
                        | Features::OFFSET_OFFLOAD_16,
                ),
                Capability::EncapOffload,
            ),
            (features.contains(Features::RXHASH), Capability::RxHash),
            (features.contains(Features::LRO), Capability::Lro),
        ];
        for (on, cap) in always {
            if on {
                table.entries.push((cap, Binding::Always));
            }
        }
        if features.contains(Features::HW_VLAN_FILTER) {
            table
                .entries
                .push((Capability::VlanFilter, Binding::Ops(OpsTable::VlanFilter)));
        }
        if features.contains(Features::NETQUEUE) {
            table
                .entries
                .push((Capability::Netqueue, Binding::Ops(OpsTable::Netqueue)));
        }
        table
    }

    pub fn get(&self, cap: Capability) -> Option<Binding> {
        self.entries
            .iter()
            .find_map(|(c, b)| (*c == cap).then_some(*b))
    }

    pub fn contains(&self, cap: Capability) -> bool {
        self.get(cap).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Capability, Binding)> + '_ {
        self.entries.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
