//! Receive filters and their reference counts.

use eui48::MacAddress;

use super::id::{FilterId, HostQueueId};
use crate::api::FilterClass;

/// A receive match rule.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RxFilter {
    Mac(MacAddress),
    Vlan(u16),
    VlanMac { mac: MacAddress, vlan: u16 },
    Vxlan {
        inner_mac: MacAddress,
        outer_mac: MacAddress,
        vni: u32,
    },
    Geneve {
        inner_mac: MacAddress,
        outer_mac: MacAddress,
        vni: u32,
    },
}

impl RxFilter {
    pub fn class(&self) -> FilterClass {
        match self {
            RxFilter::Mac(_) => FilterClass::MAC,
            RxFilter::Vlan(_) => FilterClass::VLAN,
            RxFilter::VlanMac { .. } => FilterClass::VLAN_MAC,
            RxFilter::Vxlan { .. } => FilterClass::VXLAN,
            RxFilter::Geneve { .. } => FilterClass::GENEVE,
        }
    }

    /// Destination address the filter steers on, if any.
    pub fn mac(&self) -> Option<MacAddress> {
        match *self {
            RxFilter::Mac(mac) | RxFilter::VlanMac { mac, .. } => Some(mac),
            RxFilter::Vxlan { outer_mac, .. } | RxFilter::Geneve { outer_mac, .. } => {
                Some(outer_mac)
            }
            RxFilter::Vlan(_) => None,
        }
    }
}

/// What the host gets back from an apply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FilterHandle {
    pub queue: HostQueueId,
    pub id: FilterId,
    /// Tx ring paired with the rx queue, for drivers that pair them.
    pub pair_tx: Option<u16>,
}

#[derive(Debug)]
pub(crate) struct FilterEntry {
    queue: HostQueueId,
    filter: RxFilter,
    id: FilterId,
    pair_tx: Option<u16>,
    refs: u32,
    /// False for default-queue filters the driver never saw.
    installed: bool,
}

impl FilterEntry {
    /// Whether the driver holds this filter.
    pub(crate) fn installed(&self) -> bool {
        self.installed
    }
}

/// Outcome of dropping one reference.
#[derive(Debug)]
pub(crate) enum Release {
    StillShared,
    /// Last reference gone. The entry can be put back with
    /// [`FilterTable::restore`] if the driver refuses the removal.
    Removed(FilterEntry),
}

#[derive(Debug, Default)]
pub(crate) struct FilterTable {
    entries: Vec<FilterEntry>,
    next_local: u32,
}

impl FilterTable {
    const LOCAL_BASE: u32 = 0xffff_0000;

    /// Adds a reference to an existing identical filter.
    pub(crate) fn share(&mut self, queue: HostQueueId, filter: &RxFilter) -> Option<FilterHandle> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.queue == queue && e.filter == *filter)?;
        entry.refs += 1;
        Some(FilterHandle {
            queue,
            id: entry.id,
            pair_tx: entry.pair_tx,
        })
    }

    pub(crate) fn insert(
        &mut self,
        queue: HostQueueId,
        filter: RxFilter,
        id: FilterId,
        pair_tx: Option<u16>,
    ) -> FilterHandle {
        self.entries.push(FilterEntry {
            queue,
            filter,
            id,
            pair_tx,
            refs: 1,
            installed: true,
        });
        FilterHandle { queue, id, pair_tx }
    }

    /// Records a filter that is satisfied without a driver call.
    pub(crate) fn insert_local(&mut self, queue: HostQueueId, filter: RxFilter) -> FilterHandle {
        let id = FilterId(Self::LOCAL_BASE | self.next_local);
        self.next_local = (self.next_local + 1) & 0xffff;
        self.entries.push(FilterEntry {
            queue,
            filter,
            id,
            pair_tx: None,
            refs: 1,
            installed: false,
        });
        FilterHandle {
            queue,
            id,
            pair_tx: None,
        }
    }

    pub(crate) fn release(&mut self, queue: HostQueueId, id: FilterId) -> Option<Release> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.queue == queue && e.id == id)?;
        let entry = &mut self.entries[pos];
        if entry.refs > 1 {
            entry.refs -= 1;
            return Some(Release::StillShared);
        }
        Some(Release::Removed(self.entries.swap_remove(pos)))
    }

    /// Drops the entry regardless of its reference count.
    pub(crate) fn evict(&mut self, queue: HostQueueId, id: FilterId) -> Option<FilterEntry> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.queue == queue && e.id == id)?;
        Some(self.entries.swap_remove(pos))
    }

    /// Puts back an entry taken out by `release` or `evict`.
    pub(crate) fn restore(&mut self, entry: FilterEntry) {
        self.entries.push(entry);
    }

    /// Forgets every filter of a queue that is going away.
    pub(crate) fn purge(&mut self, queue: HostQueueId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.queue != queue);
        before - self.entries.len()
    }

    pub(crate) fn refs(&self, queue: HostQueueId, id: FilterId) -> Option<u32> {
        self.entries
            .iter()
            .find(|e| e.queue == queue && e.id == id)
            .map(|e| e.refs)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
