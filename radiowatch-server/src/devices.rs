// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Phy registry and the tracked-device store.
//!
//! Devices are keyed by [`DeviceKey`], which is stable across restarts for
//! the same server uuid, phy, and MAC, and updated from the tracker stage
//! of the packet chain.  The phy-specific sub-record slot stays unallocated until
//! a phy module first writes it, so a run that never sees an 802.11 EAPOL
//! exchange never pays for the handshake tree.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use rwcommon::{DeviceKey, MacAddr, MutexExt};
use tracing::debug;
use uuid::Uuid;

use radiowatch_eventbus::{channels, Event, EventBus};
use radiowatch_model::element::{scalar, Element, KeyedMap, TrackedElement};
use radiowatch_model::fields::ElementBuilder;
use radiowatch_model::location::{HistoricLocation, HistoricLocationRrd, LocationAggregate};
use radiowatch_model::rrd::MinuteRrd;
use radiowatch_model::{ElementError, ElementRef, ElementType, EntryTracker};
use radiowatch_packet::chain::CoreComponents;
use radiowatch_packet::filters::{ClassFilterMacAddr, NewPhyEvent};
use radiowatch_packet::packet::{
    CommonInfo, DatasourceInfo, GpsInfo, Packet, SignalInfo,
};
use radiowatch_packet::{ChainStage, HandlerId, PacketChain, PhyId};

/// 802.11 sub-record shapes.  The dissectors that populate these live in
/// the phy module; the tracker only provides the storage so the record
/// serializes with the rest of the device.
#[derive(Debug, Clone, Default)]
pub struct Dot11Device {
    pub advertised_ssids: BTreeMap<String, SsidRecord>,
    pub responded_ssids: BTreeMap<String, SsidRecord>,
    pub probed_ssids: BTreeMap<String, SsidRecord>,
    pub client_of: BTreeMap<MacAddr, u64>,
    pub associated_clients: BTreeMap<MacAddr, u64>,
    pub eapol_handshakes: Vec<Vec<u8>>,
    pub nonces: Vec<Vec<u8>>,
    pub wps_manufacturer: String,
    pub wps_model: String,
    pub wps_serial: String,
    pub last_beacon_json: Option<String>,
    pub last_pmkid: Option<Vec<u8>>,
    pub beacon_fingerprint: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct SsidRecord {
    pub ssid: String,
    pub first_time: u64,
    pub last_time: u64,
    pub crypt_string: String,
}

/// One tracked device.
#[derive(Debug, Default)]
pub struct DeviceRecord {
    pub key: DeviceKey,
    pub macaddr: MacAddr,
    pub phy_id: PhyId,
    pub phy_name: String,
    pub first_time: u64,
    pub last_time: u64,
    pub packets_total: u64,
    pub packets_error: u64,
    pub packets_data: u64,
    pub bytes_data: u64,
    pub best_signal_dbm: i32,
    pub best_signal_time: u64,
    pub last_signal: Option<SignalInfo>,
    pub frequency_khz: u64,
    pub freq_khz_map: BTreeMap<u64, u64>,
    pub channel: String,
    pub location: LocationAggregate,
    pub location_history: HistoricLocationRrd,
    pub packets_rrd: MinuteRrd,
    pub seen_by: BTreeMap<Uuid, u64>,
    /// Phy-specific sub-record; allocated on first phy write.
    pub dot11: Option<Dot11Device>,
}

impl DeviceRecord {
    fn new(key: DeviceKey, mac: MacAddr, phy_id: PhyId, phy_name: &str, now: u64) -> Self {
        DeviceRecord {
            key,
            macaddr: mac,
            phy_id,
            phy_name: phy_name.to_string(),
            first_time: now,
            last_time: now,
            ..Default::default()
        }
    }

    /// Lazy 802.11 sub-record, allocated on first use.
    pub fn dot11_mut(&mut self) -> &mut Dot11Device {
        self.dot11.get_or_insert_with(Dot11Device::default)
    }

    fn update(&mut self, pkt: &Packet, common: &CommonInfo, core: &CoreComponents) {
        self.last_time = pkt.ts_sec.max(self.last_time);
        if self.first_time == 0 {
            self.first_time = pkt.ts_sec;
        }
        self.packets_total += 1;
        if pkt.error {
            self.packets_error += 1;
        }
        if common.packet_type == "data" {
            self.packets_data += 1;
            self.bytes_data += pkt.original_len as u64;
        }
        self.packets_rrd.add_sample(1.0, pkt.ts_sec);

        if common.freq_khz != 0 {
            self.frequency_khz = common.freq_khz;
            *self.freq_khz_map.entry(common.freq_khz).or_insert(0) += 1;
        }
        if !common.channel.is_empty() {
            self.channel.clone_from(&common.channel);
        }

        if let Some(signal) = pkt.fetch::<SignalInfo>(core.radiodata) {
            // dbm of zero means "no reading", never a real signal
            if signal.signal_dbm != 0
                && (self.best_signal_dbm == 0 || signal.signal_dbm > self.best_signal_dbm)
            {
                self.best_signal_dbm = signal.signal_dbm;
                self.best_signal_time = pkt.ts_sec;
            }
            self.last_signal = Some(*signal);
        }

        if let Some(gps) = pkt.fetch::<GpsInfo>(core.gps) {
            if gps.location.triplet.valid() {
                self.location.add_loc(&gps.location);
                self.location_history.add_sample(HistoricLocation {
                    lat: gps.location.triplet.lat,
                    lon: gps.location.triplet.lon,
                    alt: gps.location.triplet.alt,
                    heading: gps.location.heading,
                    speed: gps.location.speed,
                    signal: self
                        .last_signal
                        .map(|s| s.signal_dbm as f64)
                        .unwrap_or(0.0),
                    frequency: common.freq_khz as f64,
                    time_sec: pkt.ts_sec,
                });
            }
        }

        if let Some(src) = pkt.fetch::<DatasourceInfo>(core.datasrc) {
            self.seen_by.insert(src.uuid, pkt.ts_sec);
        }
    }

    /// Snapshot into an element map.  Unpopulated dynamic children are
    /// simply absent.
    pub fn to_element(&self, registry: &EntryTracker) -> Result<ElementRef, ElementError> {
        let f_map = registry.register_field(
            "radiowatch.device.base",
            ElementBuilder::Type(ElementType::Map),
            "tracked device record",
        )?;

        let mut m = KeyedMap::new();
        let mut put = |name: &str, desc: &str, value: Element| -> Result<(), ElementError> {
            let ty = value.element_type();
            let id = registry.register_field(name, ElementBuilder::Type(ty), desc)?;
            m.entries.insert(id, scalar(id, value));
            Ok(())
        };

        put(
            "radiowatch.device.base.key",
            "device key",
            Element::Key(self.key),
        )?;
        put(
            "radiowatch.device.base.macaddr",
            "device mac",
            Element::Mac(self.macaddr),
        )?;
        put(
            "radiowatch.device.base.phyname",
            "phy name",
            Element::String(self.phy_name.clone()),
        )?;
        put(
            "radiowatch.device.base.first_time",
            "first seen",
            Element::U64(self.first_time),
        )?;
        put(
            "radiowatch.device.base.last_time",
            "last seen",
            Element::U64(self.last_time),
        )?;
        put(
            "radiowatch.device.base.packets_total",
            "total packets",
            Element::U64(self.packets_total),
        )?;
        put(
            "radiowatch.device.base.packets_error",
            "error packets",
            Element::U64(self.packets_error),
        )?;
        put(
            "radiowatch.device.base.packets_data",
            "data packets",
            Element::U64(self.packets_data),
        )?;
        put(
            "radiowatch.device.base.bytes_data",
            "data bytes",
            Element::U64(self.bytes_data),
        )?;
        put(
            "radiowatch.device.base.signal_dbm_best",
            "strongest seen signal",
            Element::I32(self.best_signal_dbm),
        )?;
        put(
            "radiowatch.device.base.frequency_khz",
            "last frequency",
            Element::U64(self.frequency_khz),
        )?;
        put(
            "radiowatch.device.base.channel",
            "last channel",
            Element::String(self.channel.clone()),
        )?;

        if !self.freq_khz_map.is_empty() {
            let f_freq = registry.register_field(
                "radiowatch.device.base.freq_khz_map",
                ElementBuilder::Type(ElementType::IntMap),
                "packets per frequency",
            )?;
            let f_count = registry.register_field(
                "radiowatch.device.base.freq_count",
                ElementBuilder::Type(ElementType::U64),
                "packets on frequency",
            )?;
            let mut freq_map = KeyedMap::new();
            for (freq, count) in &self.freq_khz_map {
                freq_map
                    .entries
                    .insert(*freq, scalar(f_count, Element::U64(*count)));
            }
            m.entries.insert(
                f_freq,
                TrackedElement::new(f_freq, Element::IntMap(freq_map)).into_ref(),
            );
        }

        if self.location.valid {
            let loc = self.location.to_element(registry)?;
            let id = match loc.read() {
                Ok(g) => g.id(),
                Err(p) => p.into_inner().id(),
            };
            m.entries.insert(id, loc);
        }

        if let Some(dot11) = &self.dot11 {
            let elem = dot11_element(dot11, registry)?;
            let id = match elem.read() {
                Ok(g) => g.id(),
                Err(p) => p.into_inner().id(),
            };
            m.entries.insert(id, elem);
        }

        Ok(TrackedElement::new(f_map, Element::Map(m)).into_ref())
    }
}

fn dot11_element(
    dot11: &Dot11Device,
    registry: &EntryTracker,
) -> Result<ElementRef, ElementError> {
    let f_map = registry.register_field(
        "radiowatch.device.dot11",
        ElementBuilder::Type(ElementType::Map),
        "802.11 device sub-record",
    )?;

    let mut m = KeyedMap::new();

    let mut put_ssid_map = |name: &str,
                            desc: &str,
                            ssids: &BTreeMap<String, SsidRecord>|
     -> Result<(), ElementError> {
        if ssids.is_empty() {
            return Ok(());
        }
        let f_outer =
            registry.register_field(name, ElementBuilder::Type(ElementType::Vector), desc)?;
        let f_ssid = registry.register_field(
            "radiowatch.device.dot11.ssid",
            ElementBuilder::Type(ElementType::String),
            "ssid",
        )?;
        let children = ssids
            .values()
            .map(|s| scalar(f_ssid, Element::String(s.ssid.clone())))
            .collect();
        m.entries.insert(
            f_outer,
            TrackedElement::new(f_outer, Element::Vector(children)).into_ref(),
        );
        Ok(())
    };

    put_ssid_map(
        "radiowatch.device.dot11.advertised_ssids",
        "beaconed ssids",
        &dot11.advertised_ssids,
    )?;
    put_ssid_map(
        "radiowatch.device.dot11.responded_ssids",
        "probe-response ssids",
        &dot11.responded_ssids,
    )?;
    put_ssid_map(
        "radiowatch.device.dot11.probed_ssids",
        "probed ssids",
        &dot11.probed_ssids,
    )?;

    if let Some(fp) = dot11.beacon_fingerprint {
        let f_fp = registry.register_field(
            "radiowatch.device.dot11.beacon_fingerprint",
            ElementBuilder::Type(ElementType::U32),
            "beacon ie fingerprint",
        )?;
        m.entries.insert(f_fp, scalar(f_fp, Element::U32(fp)));
    }

    Ok(TrackedElement::new(f_map, Element::Map(m)).into_ref())
}

#[derive(Default)]
struct PhyRegistry {
    by_name: BTreeMap<String, PhyId>,
    names: Vec<String>,
}

/// The device tracker.
pub struct DeviceTracker {
    registry: Arc<EntryTracker>,
    bus: Arc<EventBus>,
    server_uuid: Uuid,
    core: CoreComponents,
    phys: Mutex<PhyRegistry>,
    devices: Mutex<BTreeMap<DeviceKey, Arc<Mutex<DeviceRecord>>>>,
    device_filter: Arc<ClassFilterMacAddr>,
}

impl DeviceTracker {
    pub fn new(
        registry: Arc<EntryTracker>,
        bus: Arc<EventBus>,
        server_uuid: Uuid,
        core: CoreComponents,
        device_filter: Arc<ClassFilterMacAddr>,
    ) -> Arc<Self> {
        Arc::new(DeviceTracker {
            registry,
            bus,
            server_uuid,
            core,
            phys: Mutex::new(PhyRegistry::default()),
            devices: Mutex::new(BTreeMap::new()),
            device_filter,
        })
    }

    /// Register (or look up) a phy by name; announces new phys on the bus
    /// so filters configured before registration can migrate.
    pub fn register_phy(&self, name: &str) -> PhyId {
        let mut phys = self.phys.lock_or_panic();
        if let Some(&id) = phys.by_name.get(name) {
            return id;
        }
        let id = phys.names.len() as PhyId + 1;
        phys.names.push(name.to_string());
        phys.by_name.insert(name.to_string(), id);
        drop(phys);

        debug!(phy = name, id, "registered phy");
        self.bus.publish(Event::new(
            channels::NEW_PHY,
            NewPhyEvent {
                phy_name: name.to_string(),
                phy_id: id,
            },
        ));
        id
    }

    pub fn phy_name(&self, id: PhyId) -> Option<String> {
        let phys = self.phys.lock_or_panic();
        phys.names.get((id as usize).checked_sub(1)?).cloned()
    }

    /// Derive the stable key for a `(phy, mac)` pair on this server.
    pub fn device_key(&self, phy_name: &str, mac: &MacAddr) -> DeviceKey {
        DeviceKey::new(&self.server_uuid, phy_name, mac)
    }

    /// Register the tracker-stage chain handler.
    pub fn attach(self: &Arc<Self>, chain: &PacketChain) -> HandlerId {
        let tracker = self.clone();
        chain.register_handler(ChainStage::Tracker, 0, move |pkt| {
            tracker.handle_packet(pkt);
        })
    }

    /// Tracker stage: classify the packet's source into a device record.
    pub fn handle_packet(&self, pkt: &mut Packet) {
        let Some(common) = pkt.fetch::<CommonInfo>(self.core.common) else {
            return;
        };
        if common.source.is_zero() {
            return;
        }

        if self.device_filter.filter(&common.source, common.phy_id) {
            pkt.filtered = true;
            return;
        }

        let phy_name = self
            .phy_name(common.phy_id)
            .unwrap_or_else(|| "UNKNOWN".to_string());

        let key = if !common.device_key.is_zero() {
            common.device_key
        } else {
            self.device_key(&phy_name, &common.source)
        };

        let record = {
            let mut devices = self.devices.lock_or_panic();
            match devices.get(&key) {
                Some(record) => record.clone(),
                None => {
                    let record = Arc::new(Mutex::new(DeviceRecord::new(
                        key,
                        common.source,
                        common.phy_id,
                        &phy_name,
                        pkt.ts_sec,
                    )));
                    devices.insert(key, record.clone());
                    drop(devices);
                    self.bus.publish(Event::new(channels::NEW_DEVICE, key));
                    record
                }
            }
        };

        record.lock_or_panic().update(pkt, &common, &self.core);
    }

    pub fn device_count(&self) -> usize {
        self.devices.lock_or_panic().len()
    }

    pub fn device_by_key(&self, key: &DeviceKey) -> Option<Arc<Mutex<DeviceRecord>>> {
        self.devices.lock_or_panic().get(key).cloned()
    }

    pub fn devices(&self) -> Vec<Arc<Mutex<DeviceRecord>>> {
        self.devices.lock_or_panic().values().cloned().collect()
    }

    /// All devices as an element vector, for the serializers.
    pub fn devices_element(&self) -> Result<ElementRef, ElementError> {
        let f_vec = self.registry.register_field(
            "radiowatch.device.list",
            ElementBuilder::Type(ElementType::Vector),
            "tracked devices",
        )?;

        let mut children = Vec::new();
        for record in self.devices() {
            let guard = record.lock_or_panic();
            children.push(guard.to_element(&self.registry)?);
        }
        Ok(TrackedElement::new(f_vec, Element::Vector(children)).into_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use radiowatch_packet::PacketChainConfig;
    use std::sync::Arc;

    fn setup() -> (Arc<DeviceTracker>, PacketChain, Arc<EventBus>) {
        let registry = Arc::new(EntryTracker::new());
        radiowatch_model::serialize::register_default_serializers(&registry);
        let bus = EventBus::new();
        let chain = PacketChain::new(&PacketChainConfig {
            packet_threads: 1,
            backlog_limit: 0,
            warning_threshold: 0,
        });
        let filter = ClassFilterMacAddr::new("device", "device filter");
        let tracker = DeviceTracker::new(
            registry,
            bus.clone(),
            "11111111-1111-1111-1111-111111111111".parse().unwrap(),
            chain.core_components(),
            filter,
        );
        (tracker, chain, bus)
    }

    fn packet_for(
        chain: &PacketChain,
        mac: &str,
        phy_id: PhyId,
        ts: u64,
        signal: i32,
    ) -> Packet {
        let core = chain.core_components();
        let mut pkt = Packet::new();
        pkt.ts_sec = ts;
        pkt.original_len = 100;
        pkt.insert(
            core.common,
            Arc::new(CommonInfo {
                source: mac.parse().unwrap(),
                phy_id,
                freq_khz: 2412000,
                channel: "1".to_string(),
                packet_type: "data".to_string(),
                ..Default::default()
            }),
        );
        pkt.insert(
            core.radiodata,
            Arc::new(SignalInfo {
                signal_dbm: signal,
                ..Default::default()
            }),
        );
        pkt
    }

    #[test]
    fn test_device_created_and_updated() {
        let (tracker, chain, bus) = setup();
        let phy = tracker.register_phy("IEEE802.11");

        let mut pkt = packet_for(&chain, "aa:bb:cc:dd:ee:ff", phy, 1000, -60);
        tracker.handle_packet(&mut pkt);
        let mut pkt = packet_for(&chain, "aa:bb:cc:dd:ee:ff", phy, 1010, -50);
        tracker.handle_packet(&mut pkt);

        assert_eq!(tracker.device_count(), 1);

        let key = tracker.device_key("IEEE802.11", &"aa:bb:cc:dd:ee:ff".parse().unwrap());
        let device = tracker.device_by_key(&key).unwrap();
        let guard = device.lock().unwrap();
        assert_eq!(guard.first_time, 1000);
        assert_eq!(guard.last_time, 1010);
        assert_eq!(guard.packets_total, 2);
        assert_eq!(guard.packets_data, 2);
        assert_eq!(guard.bytes_data, 200);
        assert_eq!(guard.best_signal_dbm, -50);
        assert_eq!(guard.freq_khz_map.get(&2412000), Some(&2));
        assert!(guard.dot11.is_none(), "phy sub-record stays lazy");

        bus.shutdown();
    }

    #[test]
    fn test_key_stable_across_trackers() {
        let (tracker_a, _, bus_a) = setup();
        let (tracker_b, _, bus_b) = setup();
        let mac: MacAddr = "aa:bb:cc:dd:ee:ff".parse().unwrap();

        assert_eq!(
            tracker_a.device_key("IEEE802.11", &mac),
            tracker_b.device_key("IEEE802.11", &mac)
        );
        assert_ne!(
            tracker_a.device_key("IEEE802.11", &mac),
            tracker_a.device_key("Bluetooth", &mac)
        );

        bus_a.shutdown();
        bus_b.shutdown();
    }

    #[test]
    fn test_filtered_device_not_tracked() {
        let (tracker, chain, bus) = setup();
        let phy = tracker.register_phy("IEEE802.11");
        bus.flush();

        tracker.device_filter.update_phy_map(&NewPhyEvent {
            phy_name: "IEEE802.11".to_string(),
            phy_id: phy,
        });
        tracker
            .device_filter
            .set_filter("IEEE802.11", "aa:bb:cc:dd:ee:ff".parse().unwrap(), true);

        let mut pkt = packet_for(&chain, "aa:bb:cc:dd:ee:ff", phy, 1000, -60);
        tracker.handle_packet(&mut pkt);

        assert!(pkt.filtered);
        assert_eq!(tracker.device_count(), 0);
        bus.shutdown();
    }

    #[test]
    fn test_device_element_serializes() {
        let (tracker, chain, bus) = setup();
        let phy = tracker.register_phy("IEEE802.11");

        let mut pkt = packet_for(&chain, "aa:bb:cc:dd:ee:ff", phy, 1000, -60);
        tracker.handle_packet(&mut pkt);

        let key = tracker.device_key("IEEE802.11", &"aa:bb:cc:dd:ee:ff".parse().unwrap());
        let device = tracker.device_by_key(&key).unwrap();
        let elem = device.lock().unwrap().to_element(&tracker.registry).unwrap();

        let mut out = Vec::new();
        tracker
            .registry
            .serialize("json", &mut out, &elem, None)
            .unwrap();
        let json = String::from_utf8(out).unwrap();

        assert!(json.contains("\"radiowatch.device.base.macaddr\": \"AA:BB:CC:DD:EE:FF\""));
        assert!(json.contains(&format!(
            "\"radiowatch.device.base.key\": \"{key}\""
        )));
        // absent dynamic children stay absent
        assert!(!json.contains("dot11"));

        bus.shutdown();
    }

    #[test]
    fn test_dot11_subrecord_allocates_on_write() {
        let (tracker, chain, bus) = setup();
        let phy = tracker.register_phy("IEEE802.11");

        let mut pkt = packet_for(&chain, "aa:bb:cc:dd:ee:ff", phy, 1000, -60);
        tracker.handle_packet(&mut pkt);

        let key = tracker.device_key("IEEE802.11", &"aa:bb:cc:dd:ee:ff".parse().unwrap());
        let device = tracker.device_by_key(&key).unwrap();
        {
            let mut guard = device.lock().unwrap();
            let dot11 = guard.dot11_mut();
            dot11.advertised_ssids.insert(
                "corp-net".to_string(),
                SsidRecord {
                    ssid: "corp-net".to_string(),
                    first_time: 1000,
                    last_time: 1000,
                    crypt_string: "wpa2".to_string(),
                },
            );
        }

        let elem = device.lock().unwrap().to_element(&tracker.registry).unwrap();
        let mut out = Vec::new();
        tracker
            .registry
            .serialize("json", &mut out, &elem, None)
            .unwrap();
        let json = String::from_utf8(out).unwrap();
        assert!(json.contains("corp-net"));

        bus.shutdown();
    }
}
