// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The packet and its component bag.
//!
//! Components are registered by name for a dense id and stored as shared,
//! type-erased values; a duplicate packet shallow-copies the original's
//! components, except those marked *unique*, which describe one physical
//! capture (signal levels) rather than the frame itself.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use rwcommon::{DeviceKey, MacAddr, MutexExt};
use uuid::Uuid;

use radiowatch_model::location::LocationFull;

/// Dense per-phy id, assigned by the device tracker as phys register.
pub type PhyId = u32;

/// Dense component id from the chain's component registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ComponentId(pub usize);

/// A packet component.  `unique` components belong to one capture event and
/// are not shared into duplicates.
pub trait PacketComponent: Any + Send + Sync {
    fn unique(&self) -> bool {
        false
    }
}

/// Raw link-layer frame plus its DLT.
#[derive(Debug, Clone, Default)]
pub struct LinkFrame {
    pub dlt: u32,
    pub data: Vec<u8>,
}

impl PacketComponent for LinkFrame {}

/// Layer-1 radio info for one capture of the frame.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SignalInfo {
    pub signal_dbm: i32,
    pub noise_dbm: i32,
    pub signal_rssi: i32,
    pub noise_rssi: i32,
    pub freq_khz: u64,
    pub datarate: f64,
    pub channel_width: u32,
}

impl PacketComponent for SignalInfo {
    fn unique(&self) -> bool {
        true
    }
}

/// Signal levels aggregated per capturing datasource, built when duplicates
/// of one frame arrive from several sources.
#[derive(Debug, Default)]
pub struct SignalAggregate {
    per_source: Mutex<BTreeMap<Uuid, SignalInfo>>,
}

impl SignalAggregate {
    pub fn record(&self, source: Uuid, signal: SignalInfo) {
        self.per_source.lock_or_panic().insert(source, signal);
    }

    pub fn snapshot(&self) -> BTreeMap<Uuid, SignalInfo> {
        self.per_source.lock_or_panic().clone()
    }
}

impl PacketComponent for SignalAggregate {}

/// GPS location for this capture.
#[derive(Debug, Clone, Default)]
pub struct GpsInfo {
    pub location: LocationFull,
    pub name: String,
    pub gps_type: String,
    pub uuid: String,
}

impl PacketComponent for GpsInfo {}

/// Marker: the source deliberately reports no location.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoGps;

impl PacketComponent for NoGps {}

/// Classified addressing, filled by the phy dissectors.
#[derive(Debug, Clone, Default)]
pub struct CommonInfo {
    pub source: MacAddr,
    pub dest: MacAddr,
    pub transmitter: MacAddr,
    pub network: MacAddr,
    pub device_key: DeviceKey,
    pub phy_id: PhyId,
    pub freq_khz: u64,
    pub channel: String,
    /// Phy-specific packet type string ("management", "data", ...).
    pub packet_type: String,
}

impl PacketComponent for CommonInfo {}

/// Snapshot of the datasource a packet arrived on.  A snapshot rather than
/// a handle: packets outlive sources that error and close.
#[derive(Debug, Clone, Default)]
pub struct DatasourceInfo {
    pub uuid: Uuid,
    pub name: String,
    pub definition: String,
}

impl PacketComponent for DatasourceInfo {}

/// JSON sidecar record riding with a capture.
#[derive(Debug, Clone, Default)]
pub struct JsonInfo {
    pub json_type: String,
    pub json: String,
}

impl PacketComponent for JsonInfo {}

/// Opaque metadata blob.
#[derive(Debug, Clone, Default)]
pub struct MetaBlob {
    pub blob: Vec<u8>,
}

impl PacketComponent for MetaBlob {}

/// Type-erased slot.  The unique flag is captured at insert time, before
/// erasure, so inheritance does not need the concrete type back.
#[derive(Clone)]
struct Slot {
    component: Arc<dyn Any + Send + Sync>,
    unique: bool,
}

pub type PacketRef = Arc<Mutex<Packet>>;

/// One captured packet moving through the chain.
#[derive(Default)]
pub struct Packet {
    pub ts_sec: u64,
    pub ts_usec: u32,
    /// Original length before any truncation by the capture source.
    pub original_len: usize,
    /// Monotonic number; duplicates share their original's.
    pub packet_no: u64,
    /// CRC32 of the link frame; zero when there is no frame.
    pub hash: u32,
    pub duplicate: bool,
    pub original: Option<PacketRef>,
    /// Pins the packet to one worker; zero means unpinned.
    pub assignment_id: u32,
    pub error: bool,
    pub filtered: bool,
    pub tags: BTreeMap<String, String>,

    components: Vec<Option<Slot>>,
}

impl Packet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_ref(self) -> PacketRef {
        Arc::new(Mutex::new(self))
    }

    pub fn insert<T: PacketComponent>(&mut self, id: ComponentId, component: Arc<T>) {
        let unique = component.unique();
        if self.components.len() <= id.0 {
            self.components.resize(id.0 + 1, None);
        }
        self.components[id.0] = Some(Slot { component, unique });
    }

    pub fn has(&self, id: ComponentId) -> bool {
        self.components
            .get(id.0)
            .map(|c| c.is_some())
            .unwrap_or(false)
    }

    pub fn remove(&mut self, id: ComponentId) {
        if let Some(slot) = self.components.get_mut(id.0) {
            *slot = None;
        }
    }

    /// Fetch and downcast a component.
    pub fn fetch<T: PacketComponent>(&self, id: ComponentId) -> Option<Arc<T>> {
        let slot = self.components.get(id.0)?.as_ref()?;
        slot.component.clone().downcast::<T>().ok()
    }

    /// Fetch from the first id that is populated; mirrors the decap-or-
    /// linkframe lookup in the dissectors.
    pub fn fetch_first<T: PacketComponent>(&self, ids: &[ComponentId]) -> Option<Arc<T>> {
        ids.iter().find_map(|id| self.fetch::<T>(*id))
    }

    pub fn fetch_or_insert<T, F>(&mut self, id: ComponentId, make: F) -> Arc<T>
    where
        T: PacketComponent,
        F: FnOnce() -> T,
    {
        if let Some(existing) = self.fetch::<T>(id) {
            return existing;
        }
        let fresh = Arc::new(make());
        self.insert(id, fresh.clone());
        fresh
    }

    /// Shallow-copy the shareable components of `original` into this
    /// packet.  Unique components stay behind.
    pub fn inherit_components(&mut self, original: &Packet) {
        for (idx, slot) in original.components.iter().enumerate() {
            if let Some(slot) = slot {
                if slot.unique {
                    continue;
                }
                if self.components.len() <= idx {
                    self.components.resize(idx + 1, None);
                }
                self.components[idx] = Some(slot.clone());
            }
        }
    }
}
