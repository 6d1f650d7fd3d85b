// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-phy MAC allow/deny filters.
//!
//! Two flavors share the mechanics: the class filter answers "is this
//! device blocked" for a `(mac, phy)` pair, the packet filter additionally
//! scopes each entry to an address role within the packet (source, dest,
//! network, other, any).
//!
//! Entries are kept per phy *id*, but callers configure them by phy *name*,
//! usually before the phy has registered.  Those land in an unknown-phy
//! side table and migrate when the phy announcement arrives on the event
//! bus.  Filter state is REST-maintained at runtime; bulk updates validate
//! every MAC before applying any of them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rwcommon::{MacAddr, MutexExt};
use tracing::debug;

use crate::packet::{CommonInfo, PhyId};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum FilterError {
    #[error("invalid mac address {0:?}")]
    InvalidMac(String),
    #[error("invalid filter payload: {0}")]
    InvalidPayload(String),
}

/// Payload of a new-phy announcement on the event bus.
#[derive(Debug, Clone)]
pub struct NewPhyEvent {
    pub phy_name: String,
    pub phy_id: PhyId,
}

#[derive(Default)]
struct MacFilterState {
    by_phy: HashMap<PhyId, HashMap<MacAddr, bool>>,
    unknown_phy: HashMap<String, HashMap<MacAddr, bool>>,
    phy_ids: HashMap<String, PhyId>,
}

impl MacFilterState {
    fn set(&mut self, phy_name: &str, mac: MacAddr, block: bool) {
        match self.phy_ids.get(phy_name) {
            Some(&id) => {
                self.by_phy.entry(id).or_default().insert(mac, block);
            }
            None => {
                self.unknown_phy
                    .entry(phy_name.to_string())
                    .or_default()
                    .insert(mac, block);
            }
        }
    }

    fn remove(&mut self, phy_name: &str, mac: &MacAddr) {
        if let Some(&id) = self.phy_ids.get(phy_name) {
            if let Some(map) = self.by_phy.get_mut(&id) {
                map.remove(mac);
            }
        }
        if let Some(map) = self.unknown_phy.get_mut(phy_name) {
            map.remove(mac);
        }
    }

    fn migrate(&mut self, phy_name: &str, phy_id: PhyId) {
        self.phy_ids.insert(phy_name.to_string(), phy_id);
        if let Some(entries) = self.unknown_phy.remove(phy_name) {
            debug!(
                phy = phy_name,
                entries = entries.len(),
                "migrating filter entries to registered phy"
            );
            self.by_phy.entry(phy_id).or_default().extend(entries);
        }
    }

    fn lookup(&self, phy_id: PhyId, mac: &MacAddr) -> Option<bool> {
        let map = self.by_phy.get(&phy_id)?;
        if let Some(&v) = map.get(mac) {
            return Some(v);
        }
        // masked entries match by range
        map.iter()
            .find(|(entry, _)| entry.matches(mac))
            .map(|(_, &v)| v)
    }
}

/// Parse `{"filter": {"aa:bb:..": true, ...}}` or `{"filter": ["aa:bb:..",
/// ...]}` into validated entries.  Any bad MAC rejects the whole payload.
fn parse_filter_payload(json: &serde_json::Value) -> Result<Vec<(MacAddr, bool)>, FilterError> {
    let filter = json
        .get("filter")
        .ok_or_else(|| FilterError::InvalidPayload("missing 'filter' key".to_string()))?;

    let mut entries = Vec::new();
    match filter {
        serde_json::Value::Object(map) => {
            for (mac_str, val) in map {
                let mac: MacAddr = mac_str
                    .parse()
                    .map_err(|_| FilterError::InvalidMac(mac_str.clone()))?;
                let block = val.as_bool().ok_or_else(|| {
                    FilterError::InvalidPayload(format!("value for {mac_str} is not a bool"))
                })?;
                entries.push((mac, block));
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                let mac_str = item.as_str().ok_or_else(|| {
                    FilterError::InvalidPayload("filter list entries must be strings".to_string())
                })?;
                let mac: MacAddr = mac_str
                    .parse()
                    .map_err(|_| FilterError::InvalidMac(mac_str.to_string()))?;
                entries.push((mac, true));
            }
        }
        _ => {
            return Err(FilterError::InvalidPayload(
                "'filter' must be an object or list".to_string(),
            ))
        }
    }
    Ok(entries)
}

/// Device-level MAC filter: `true` means block.
pub struct ClassFilterMacAddr {
    id: String,
    description: String,
    default_block: AtomicBool,
    state: Mutex<MacFilterState>,
}

impl ClassFilterMacAddr {
    pub fn new(id: &str, description: &str) -> Arc<Self> {
        Arc::new(ClassFilterMacAddr {
            id: id.to_string(),
            description: description.to_string(),
            default_block: AtomicBool::new(false),
            state: Mutex::new(MacFilterState::default()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn default_block(&self) -> bool {
        self.default_block.load(Ordering::Relaxed)
    }

    pub fn set_default_block(&self, block: bool) {
        self.default_block.store(block, Ordering::Relaxed);
    }

    pub fn set_filter(&self, phy_name: &str, mac: MacAddr, block: bool) {
        self.state.lock_or_panic().set(phy_name, mac, block);
    }

    pub fn remove_filter(&self, phy_name: &str, mac: &MacAddr) {
        self.state.lock_or_panic().remove(phy_name, mac);
    }

    /// New-phy handler: record the id and adopt early entries.
    pub fn update_phy_map(&self, event: &NewPhyEvent) {
        self.state
            .lock_or_panic()
            .migrate(&event.phy_name, event.phy_id);
    }

    /// True = block.
    pub fn filter(&self, mac: &MacAddr, phy_id: PhyId) -> bool {
        self.state
            .lock_or_panic()
            .lookup(phy_id, mac)
            .unwrap_or_else(|| self.default_block())
    }

    /// REST set operation; validates the whole payload before applying.
    pub fn set_filter_json(
        &self,
        phy_name: &str,
        json: &serde_json::Value,
    ) -> Result<usize, FilterError> {
        let entries = parse_filter_payload(json)?;
        let mut state = self.state.lock_or_panic();
        let n = entries.len();
        for (mac, block) in entries {
            state.set(phy_name, mac, block);
        }
        Ok(n)
    }

    /// REST remove operation.
    pub fn remove_filter_json(
        &self,
        phy_name: &str,
        json: &serde_json::Value,
    ) -> Result<usize, FilterError> {
        let entries = parse_filter_payload(json)?;
        let mut state = self.state.lock_or_panic();
        let n = entries.len();
        for (mac, _) in entries {
            state.remove(phy_name, &mac);
        }
        Ok(n)
    }
}

/// Which address of the packet a packet-filter entry applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterBlock {
    Source,
    Dest,
    Network,
    Other,
    Any,
}

impl FilterBlock {
    pub fn parse(s: &str) -> Option<FilterBlock> {
        match s.to_ascii_lowercase().as_str() {
            "source" => Some(FilterBlock::Source),
            "dest" | "destination" => Some(FilterBlock::Dest),
            "network" => Some(FilterBlock::Network),
            "other" => Some(FilterBlock::Other),
            "any" => Some(FilterBlock::Any),
            _ => None,
        }
    }
}

/// Packet-level MAC filter: entries scoped by address role.
pub struct PacketFilterMacAddr {
    id: String,
    description: String,
    default_block: AtomicBool,
    blocks: Mutex<HashMap<FilterBlock, MacFilterState>>,
}

impl PacketFilterMacAddr {
    pub fn new(id: &str, description: &str) -> Arc<Self> {
        Arc::new(PacketFilterMacAddr {
            id: id.to_string(),
            description: description.to_string(),
            default_block: AtomicBool::new(false),
            blocks: Mutex::new(HashMap::new()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn default_block(&self) -> bool {
        self.default_block.load(Ordering::Relaxed)
    }

    pub fn set_default_block(&self, block: bool) {
        self.default_block.store(block, Ordering::Relaxed);
    }

    pub fn set_filter(&self, block_dim: FilterBlock, phy_name: &str, mac: MacAddr, block: bool) {
        self.blocks
            .lock_or_panic()
            .entry(block_dim)
            .or_default()
            .set(phy_name, mac, block);
    }

    pub fn remove_filter(&self, block_dim: FilterBlock, phy_name: &str, mac: &MacAddr) {
        if let Some(state) = self.blocks.lock_or_panic().get_mut(&block_dim) {
            state.remove(phy_name, mac);
        }
    }

    pub fn update_phy_map(&self, event: &NewPhyEvent) {
        for state in self.blocks.lock_or_panic().values_mut() {
            state.migrate(&event.phy_name, event.phy_id);
        }
    }

    /// Evaluate against the packet's classified addresses.  True = block.
    pub fn filter_packet(&self, common: &CommonInfo) -> bool {
        let blocks = self.blocks.lock_or_panic();

        let check = |dim: FilterBlock, mac: &MacAddr| -> Option<bool> {
            if mac.is_zero() {
                return None;
            }
            blocks.get(&dim)?.lookup(common.phy_id, mac)
        };

        for (dim, mac) in [
            (FilterBlock::Source, &common.source),
            (FilterBlock::Dest, &common.dest),
            (FilterBlock::Network, &common.network),
            (FilterBlock::Other, &common.transmitter),
        ] {
            if let Some(v) = check(dim, mac) {
                return v;
            }
            if let Some(v) = check(FilterBlock::Any, mac) {
                return v;
            }
        }

        self.default_block()
    }

    pub fn set_filter_json(
        &self,
        block_dim: FilterBlock,
        phy_name: &str,
        json: &serde_json::Value,
    ) -> Result<usize, FilterError> {
        let entries = parse_filter_payload(json)?;
        let mut blocks = self.blocks.lock_or_panic();
        let state = blocks.entry(block_dim).or_default();
        let n = entries.len();
        for (mac, block) in entries {
            state.set(phy_name, mac, block);
        }
        Ok(n)
    }

    pub fn remove_filter_json(
        &self,
        block_dim: FilterBlock,
        phy_name: &str,
        json: &serde_json::Value,
    ) -> Result<usize, FilterError> {
        let entries = parse_filter_payload(json)?;
        let mut blocks = self.blocks.lock_or_panic();
        let n = entries.len();
        if let Some(state) = blocks.get_mut(&block_dim) {
            for (mac, _) in entries {
                state.remove(phy_name, &mac);
            }
        }
        Ok(n)
    }
}
