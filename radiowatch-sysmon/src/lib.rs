// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! System monitor: once a second, sample process memory, battery, and
//! thermal state, feed the RRDs, and publish TIMESTAMP / BATTERY / STATS
//! events.
//!
//! Sensor access is plain sysfs reads (`/sys/class/power_supply`,
//! `/sys/class/thermal`, `/sys/class/hwmon`); a machine without a sensor
//! simply reports nothing for it.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rwcommon::config::Config;
use rwcommon::timer::{TimerId, TimerService};
use rwcommon::{unix_secs, MutexExt};
use tracing::debug;
use uuid::Uuid;

use radiowatch_eventbus::{channels, Event, EventBus};
use radiowatch_model::element::{scalar, Element, KeyedMap, OrderedF64, TrackedElement};
use radiowatch_model::fields::ElementBuilder;
use radiowatch_model::rrd::MinuteRrd;
use radiowatch_model::{ElementError, ElementRef, ElementType, EntryTracker};

/// Battery snapshot published on the BATTERY channel.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BatteryInfo {
    pub percentage: u32,
    pub charging: bool,
    pub ac_power: bool,
}

/// Timestamp payload for the TIMESTAMP channel.
#[derive(Debug, Clone, Copy)]
pub struct TimestampEvent {
    pub ts_sec: u64,
}

pub struct SystemMonitor {
    bus: Arc<EventBus>,
    server_uuid: Uuid,
    server_name: String,
    server_description: String,
    server_location: String,
    start_time: u64,
    timer_id: Mutex<Option<TimerId>>,
    last_rss: AtomicU64,
    memory_rrd: Mutex<MinuteRrd>,
    battery: Mutex<Option<BatteryInfo>>,
    sensors: Mutex<BTreeMap<String, f64>>,
}

impl SystemMonitor {
    pub fn new(bus: Arc<EventBus>, config: &Config) -> Arc<Self> {
        Arc::new(SystemMonitor {
            bus,
            server_uuid: config.server_uuid,
            server_name: config.server_name.clone(),
            server_description: config.server_description.clone(),
            server_location: config.server_location.clone(),
            start_time: unix_secs(),
            timer_id: Mutex::new(None),
            last_rss: AtomicU64::new(0),
            memory_rrd: Mutex::new(MinuteRrd::new()),
            battery: Mutex::new(None),
            sensors: Mutex::new(BTreeMap::new()),
        })
    }

    /// Begin the once-per-second sampling cycle: sample, then publish the
    /// STATS snapshot.
    pub fn start(self: &Arc<Self>, timer: &TimerService, registry: Arc<EntryTracker>) {
        let monitor = self.clone();
        let id = timer.register_repeating(Duration::from_secs(1), move || {
            monitor.sample();
            if let Err(e) = monitor.publish_stats(&registry) {
                debug!("stats snapshot failed: {e}");
            }
        });
        *self.timer_id.lock_or_panic() = Some(id);
    }

    pub fn stop(&self, timer: &TimerService) {
        if let Some(id) = self.timer_id.lock_or_panic().take() {
            timer.remove_timer(id);
        }
    }

    /// One sampling pass.  Public so the log-open snapshot can force a
    /// fresh read.
    pub fn sample(&self) {
        let now = unix_secs();

        if let Some(usage) = memory_stats::memory_stats() {
            let rss = usage.physical_mem as u64;
            self.last_rss.store(rss, Ordering::Relaxed);
            self.memory_rrd
                .lock_or_panic()
                .add_sample((rss / 1024) as f64, now);
        }

        let battery = read_battery(Path::new("/sys/class/power_supply"));
        *self.battery.lock_or_panic() = battery;

        let mut sensors = BTreeMap::new();
        if let Some(temp) = read_millidegree(Path::new("/sys/class/thermal/thermal_zone0/temp")) {
            sensors.insert("thermal_zone0".to_string(), temp);
        }
        scan_hwmon(Path::new("/sys/class/hwmon"), &mut sensors);
        *self.sensors.lock_or_panic() = sensors;

        self.bus.publish(Event::new(
            channels::TIMESTAMP,
            TimestampEvent { ts_sec: now },
        ));
        if let Some(battery) = battery {
            self.bus.publish(Event::new(channels::BATTERY, battery));
        }
        debug!(rss = self.last_rss.load(Ordering::Relaxed), "sysmon sample");
    }

    /// Publish the serializable status snapshot on the STATS channel.
    pub fn publish_stats(&self, registry: &EntryTracker) -> Result<(), ElementError> {
        let status = self.status_element(registry)?;
        self.bus
            .publish(Event::new(channels::SYSTEM_STATS, status));
        Ok(())
    }

    /// Full status record: identity tags, uptime, memory, battery, and the
    /// sensor map.
    pub fn status_element(&self, registry: &EntryTracker) -> Result<ElementRef, ElementError> {
        let f_map = registry.register_field(
            "radiowatch.system.status",
            ElementBuilder::Type(ElementType::Map),
            "system status snapshot",
        )?;

        let mut m = KeyedMap::new();
        let mut put = |name: &str, desc: &str, value: Element| -> Result<(), ElementError> {
            let ty = value.element_type();
            let id = registry.register_field(name, ElementBuilder::Type(ty), desc)?;
            m.entries.insert(id, scalar(id, value));
            Ok(())
        };

        put(
            "radiowatch.system.server_uuid",
            "server uuid",
            Element::Uuid(self.server_uuid),
        )?;
        put(
            "radiowatch.system.server_name",
            "server name",
            Element::String(self.server_name.clone()),
        )?;
        put(
            "radiowatch.system.server_description",
            "server description",
            Element::String(self.server_description.clone()),
        )?;
        put(
            "radiowatch.system.server_location",
            "server location",
            Element::String(self.server_location.clone()),
        )?;
        put(
            "radiowatch.system.timestamp_start_sec",
            "server start time",
            Element::U64(self.start_time),
        )?;
        put(
            "radiowatch.system.timestamp_sec",
            "snapshot time",
            Element::U64(unix_secs()),
        )?;
        put(
            "radiowatch.system.memory_rss",
            "process resident memory (bytes)",
            Element::U64(self.last_rss.load(Ordering::Relaxed)),
        )?;

        if let Some(battery) = *self.battery.lock_or_panic() {
            put(
                "radiowatch.system.battery_percentage",
                "battery charge percent",
                Element::U32(battery.percentage),
            )?;
            put(
                "radiowatch.system.battery_charging",
                "battery charging",
                Element::U8(battery.charging as u8),
            )?;
            put(
                "radiowatch.system.battery_ac",
                "on ac power",
                Element::U8(battery.ac_power as u8),
            )?;
        }

        {
            let sensors = self.sensors.lock_or_panic();
            if !sensors.is_empty() {
                let f_sensors = registry.register_field(
                    "radiowatch.system.sensors.temp",
                    ElementBuilder::Type(ElementType::DoubleMapDouble),
                    "temperature sensors (celsius)",
                )?;
                // sensor names are strings on the wire; index them densely
                // here and carry the names in a parallel vector
                let f_names = registry.register_field(
                    "radiowatch.system.sensors.names",
                    ElementBuilder::Type(ElementType::VectorString),
                    "sensor names",
                )?;

                let mut entries = BTreeMap::new();
                let mut names = Vec::new();
                for (idx, (name, value)) in sensors.iter().enumerate() {
                    entries.insert(OrderedF64(idx as f64), *value);
                    names.push(name.clone());
                }
                m.entries.insert(
                    f_names,
                    scalar(f_names, Element::VectorString(names)),
                );
                m.entries.insert(
                    f_sensors,
                    scalar(
                        f_sensors,
                        Element::DoubleMapDouble {
                            entries,
                            as_vector: false,
                            as_key_vector: false,
                        },
                    ),
                );
            }
        }

        {
            let mut rrd = self.memory_rrd.lock_or_panic();
            rrd.add_sample(0.0, unix_secs());
            let f_mem_vec = registry.register_field(
                "radiowatch.system.memory_rrd",
                ElementBuilder::Type(ElementType::VectorDouble),
                "past minute memory use (kb)",
            )?;
            m.entries.insert(
                f_mem_vec,
                scalar(f_mem_vec, Element::VectorDouble(rrd.minute_vec().to_vec())),
            );
        }

        Ok(TrackedElement::new(f_map, Element::Map(m)).into_ref())
    }
}

fn read_trimmed(path: &Path) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
}

fn read_millidegree(path: &Path) -> Option<f64> {
    read_trimmed(path)?.parse::<f64>().ok().map(|v| v / 1000.0)
}

fn read_battery(base: &Path) -> Option<BatteryInfo> {
    let entries = std::fs::read_dir(base).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        let type_s = read_trimmed(&path.join("type"))?;
        if type_s != "Battery" {
            continue;
        }

        let percentage = read_trimmed(&path.join("capacity"))
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let status = read_trimmed(&path.join("status")).unwrap_or_default();
        return Some(BatteryInfo {
            percentage,
            charging: status == "Charging",
            ac_power: status == "Charging" || status == "Full",
        });
    }
    None
}

fn scan_hwmon(base: &Path, sensors: &mut BTreeMap<String, f64>) {
    let Ok(entries) = std::fs::read_dir(base) else {
        return;
    };
    for entry in entries.flatten() {
        let dir = entry.path();
        let chip = read_trimmed(&dir.join("name")).unwrap_or_else(|| "hwmon".to_string());
        for n in 1..=8 {
            if let Some(temp) = read_millidegree(&dir.join(format!("temp{n}_input"))) {
                sensors.insert(format!("{chip}.temp{n}"), temp);
            }
            if let Some(fan) = read_trimmed(&dir.join(format!("fan{n}_input")))
                .and_then(|s| s.parse::<f64>().ok())
            {
                sensors.insert(format!("{chip}.fan{n}"), fan);
            }
        }
    }
}
