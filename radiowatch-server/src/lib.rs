// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Server assembly: constructs every subsystem once at startup and wires
//! them together.  No globals; everything flows through the [`Context`].
//!
//! The context owns the tokio reactor used by the capture sessions, the
//! timer service, the packet worker pool, and the registries; components
//! hold `Arc`s to their collaborators and nothing else.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

pub mod devices;

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use rwcommon::config::Config;
use rwcommon::timer::TimerService;
use rwcommon::{unix_timeval, MutexExt};
use tracing::{error, info, warn};

use radiowatch_alerts::{AlertInfo, AlertTracker, Severity};
use radiowatch_capture::DatasourceTracker;
use radiowatch_eventbus::{channels, EventBus, MessageEvent};
use radiowatch_logdb::{DatabaseLog, DatasourceRow, DeviceRow, PacketRow};
use radiowatch_model::serialize::register_default_serializers;
use radiowatch_model::EntryTracker;
use radiowatch_packet::filters::{ClassFilterMacAddr, NewPhyEvent, PacketFilterMacAddr};
use radiowatch_packet::packet::{CommonInfo, DatasourceInfo, GpsInfo, LinkFrame, SignalInfo};
use radiowatch_packet::{ChainStage, PacketChain, PacketChainConfig};
use radiowatch_sysmon::SystemMonitor;

pub use devices::{DeviceRecord, DeviceTracker, Dot11Device, SsidRecord};

const DEVICE_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// All core subsystems, constructed in dependency order.
pub struct Context {
    pub config: Config,
    pub registry: Arc<EntryTracker>,
    pub bus: Arc<EventBus>,
    pub timers: Arc<TimerService>,
    pub chain: PacketChain,
    pub device_filter: Arc<ClassFilterMacAddr>,
    pub packet_filter: Arc<PacketFilterMacAddr>,
    pub alerts: Arc<AlertTracker>,
    pub devices: Arc<DeviceTracker>,
    pub datasources: Arc<DatasourceTracker>,
    pub sysmon: Arc<SystemMonitor>,
    log: Mutex<Option<Arc<DatabaseLog>>>,
    runtime: tokio::runtime::Runtime,
}

impl Context {
    /// Build and wire the core.  The packet workers and timers are running
    /// when this returns; no capture sources are open yet.
    pub fn build(config: Config) -> Result<Arc<Self>> {
        let registry = Arc::new(EntryTracker::new());
        register_default_serializers(&registry);

        let bus = EventBus::new();
        let timers = TimerService::new();

        let chain = PacketChain::new(&PacketChainConfig {
            packet_threads: config.packet_threads,
            backlog_limit: config.packet_backlog_limit,
            warning_threshold: config.packet_log_warning,
        });
        chain.start();
        let core = chain.core_components();

        let device_filter = ClassFilterMacAddr::new("device", "device MAC filter");
        let packet_filter = PacketFilterMacAddr::new("packet", "packet MAC filter");
        {
            let df = device_filter.clone();
            let pf = packet_filter.clone();
            bus.register_listener(&[channels::NEW_PHY], move |evt| {
                if let Some(phy) = evt.payload::<NewPhyEvent>() {
                    df.update_phy_map(phy);
                    pf.update_phy_map(phy);
                }
            });
        }
        device_filter.set_default_block(config.log_device_filter_default);
        packet_filter.set_default_block(config.log_packet_filter_default);

        let alerts = AlertTracker::new(
            bus.clone(),
            config.alert_backlog,
            core.alert,
            core.gps,
            &config.parsed_alert_definitions()?,
        );

        {
            let alerts = alerts.clone();
            chain.set_overload_callback(move |kind, message| {
                let severity = if kind == "PACKETLOST" {
                    Severity::High
                } else {
                    Severity::Medium
                };
                if let Err(e) = alerts.raise_one_shot(kind, "SYSTEM", severity, message) {
                    error!("failed to raise {kind}: {e}");
                }
            });
        }

        let devices = DeviceTracker::new(
            registry.clone(),
            bus.clone(),
            config.server_uuid,
            core,
            device_filter.clone(),
        );
        devices.attach(&chain);

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("rw-io")
            .enable_all()
            .build()?;

        let datasources = DatasourceTracker::new(bus.clone(), chain.clone(), runtime.handle().clone());

        let sysmon = SystemMonitor::new(bus.clone(), &config);
        sysmon.start(&timers, registry.clone());

        info!(
            workers = chain.worker_count(),
            server = %config.server_name,
            "core assembled"
        );

        Ok(Arc::new(Context {
            config,
            registry,
            bus,
            timers,
            chain,
            device_filter,
            packet_filter,
            alerts,
            devices,
            datasources,
            sysmon,
            log: Mutex::new(None),
            runtime,
        }))
    }

    pub fn runtime(&self) -> tokio::runtime::Handle {
        self.runtime.handle().clone()
    }

    pub fn log(&self) -> Option<Arc<DatabaseLog>> {
        self.log.lock_or_panic().clone()
    }

    /// Open the run log and wire the logging paths: the logging chain
    /// stage, alert and message listeners, the device snapshot timer, and
    /// the one-shot SYSTEM snapshot triggered by the log-open event.
    pub fn open_log(self: &Arc<Self>, path: &Path) -> Result<Arc<DatabaseLog>> {
        let log = DatabaseLog::open(
            path,
            &self.config,
            &self.timers,
            self.bus.clone(),
            self.device_filter.clone(),
            self.packet_filter.clone(),
        )?;

        *self.log.lock_or_panic() = Some(log.clone());

        self.attach_packet_logging(&log);
        self.attach_event_logging(&log);

        // The open event is on the bus; the one-shot SYSTEM snapshot goes
        // in as soon as the log is wired.
        self.write_system_snapshot();

        {
            let ctx = self.clone();
            self.timers.register_repeating(DEVICE_LOG_INTERVAL, move || {
                ctx.log_devices();
            });
        }

        Ok(log)
    }

    /// Logging stage handler: flatten the packet into a row and hand it to
    /// the database, which applies the filters and duplicate policy.
    fn attach_packet_logging(self: &Arc<Self>, log: &Arc<DatabaseLog>) {
        let core = self.chain.core_components();
        let log = log.clone();
        let devices = self.devices.clone();

        self.chain
            .register_handler(ChainStage::Logging, 100, move |pkt| {
                if pkt.filtered {
                    return;
                }

                let common = pkt.fetch::<CommonInfo>(core.common);
                let frame = pkt.fetch::<LinkFrame>(core.linkframe);
                let signal = pkt.fetch::<SignalInfo>(core.radiodata);
                let gps = pkt.fetch::<GpsInfo>(core.gps);
                let datasrc = pkt.fetch::<DatasourceInfo>(core.datasrc);

                let mut row = PacketRow {
                    ts_sec: pkt.ts_sec,
                    ts_usec: pkt.ts_usec,
                    packet_len: frame.as_ref().map(|f| f.data.len()).unwrap_or(0),
                    packet_full_len: pkt.original_len,
                    dlt: frame.as_ref().map(|f| f.dlt).unwrap_or(0),
                    packet: frame.map(|f| f.data.clone()).unwrap_or_default(),
                    error: pkt.error,
                    hash: pkt.hash,
                    packetid: pkt.packet_no,
                    tags: pkt
                        .tags
                        .iter()
                        .map(|(k, v)| format!("{k}={v}"))
                        .collect::<Vec<_>>()
                        .join(","),
                    ..Default::default()
                };

                if let Some(common) = &common {
                    row.phyname = devices
                        .phy_name(common.phy_id)
                        .unwrap_or_default();
                    row.sourcemac = common.source.to_string();
                    row.destmac = common.dest.to_string();
                    row.transmac = common.transmitter.to_string();
                    row.frequency = common.freq_khz as f64;
                    if !common.device_key.is_zero() {
                        row.devkey = common.device_key.to_string();
                    }
                }
                if let Some(signal) = &signal {
                    row.signal = signal.signal_dbm;
                    row.datarate = signal.datarate;
                }
                if let Some(gps) = &gps {
                    row.lat = gps.location.triplet.lat;
                    row.lon = gps.location.triplet.lon;
                    row.alt = gps.location.triplet.alt;
                    row.speed = gps.location.speed;
                    row.heading = gps.location.heading;
                }
                if let Some(datasrc) = &datasrc {
                    row.datasource = datasrc.uuid.to_string();
                }

                match log.log_packet(&row, pkt.duplicate, common.as_deref()) {
                    Ok(_) | Err(radiowatch_logdb::LogError::Closed) => {}
                    Err(e) => {
                        // A real storage failure retires the log; capture
                        // keeps running.
                        error!("packet log write failed: {e}");
                        log.fail();
                    }
                }
            });
    }

    /// Mirror alerts and messages from the bus into the log.
    fn attach_event_logging(self: &Arc<Self>, log: &Arc<DatabaseLog>) {
        {
            let log = log.clone();
            let registry = self.registry.clone();
            let devices = self.devices.clone();
            self.bus.register_listener(&[channels::NEW_ALERT], move |evt| {
                let Some(alert) = evt.payload::<Arc<AlertInfo>>() else {
                    return;
                };
                let json = match alert.to_element(&registry) {
                    Ok(elem) => {
                        let mut buf = Vec::new();
                        if registry.serialize("json", &mut buf, &elem, None).is_ok() {
                            buf
                        } else {
                            Vec::new()
                        }
                    }
                    Err(_) => Vec::new(),
                };
                let phyname = devices.phy_name(alert.phy).unwrap_or_default();
                if let Err(e) = log.log_alert(alert, &phyname, &json) {
                    error!("alert log write failed: {e}");
                }
            });
        }

        {
            let log = log.clone();
            self.bus.register_listener(&[channels::MESSAGE], move |evt| {
                let Some(msg) = evt.payload::<MessageEvent>() else {
                    return;
                };
                if let Err(e) =
                    log.log_message(msg.ts_sec, 0.0, 0.0, &msg.msg_type, &msg.text)
                {
                    error!("message log write failed: {e}");
                }
            });
        }
    }

    /// One-shot SYSTEM snapshot, written when a log opens.
    fn write_system_snapshot(&self) {
        let Some(log) = self.log() else {
            return;
        };
        self.sysmon.sample();
        let snapshot = match self.sysmon.status_element(&self.registry) {
            Ok(elem) => {
                let mut buf = Vec::new();
                match self.registry.serialize("json", &mut buf, &elem, None) {
                    Ok(()) => buf,
                    Err(e) => {
                        error!("system snapshot serialize failed: {e}");
                        return;
                    }
                }
            }
            Err(e) => {
                error!("system snapshot failed: {e}");
                return;
            }
        };

        let (sec, usec) = unix_timeval();
        if let Err(e) = log.log_snapshot(sec, usec, 0.0, 0.0, "SYSTEM", &snapshot) {
            error!("system snapshot write failed: {e}");
        }
    }

    /// Write every tracked device into the log.
    pub fn log_devices(&self) {
        let Some(log) = self.log() else {
            return;
        };

        for record in self.devices.devices() {
            let guard = record.lock_or_panic();

            let json = match guard.to_element(&self.registry) {
                Ok(elem) => {
                    let mut buf = Vec::new();
                    if self
                        .registry
                        .serialize("json", &mut buf, &elem, None)
                        .is_ok()
                    {
                        buf
                    } else {
                        Vec::new()
                    }
                }
                Err(_) => Vec::new(),
            };

            let (min, max, avg) = (
                guard.location.min_loc.unwrap_or_default(),
                guard.location.max_loc.unwrap_or_default(),
                guard.location.avg_loc.unwrap_or_default(),
            );

            let row = DeviceRow {
                first_time: guard.first_time,
                last_time: guard.last_time,
                devkey: guard.key.to_string(),
                phyname: guard.phy_name.clone(),
                devmac: guard.macaddr.to_string(),
                strongest_signal: guard.best_signal_dbm,
                min_lat: min.lat,
                min_lon: min.lon,
                max_lat: max.lat,
                max_lon: max.lon,
                avg_lat: avg.lat,
                avg_lon: avg.lon,
                bytes_data: guard.bytes_data,
                type_string: guard.phy_name.clone(),
                device_json: json,
            };
            drop(guard);

            if let Err(e) = log.log_device(&row) {
                error!("device log write failed: {e}");
            }
        }
    }

    /// Write datasource rows for every known source.
    pub fn log_datasources(&self) {
        let Some(log) = self.log() else {
            return;
        };
        for source in self.datasources.sources() {
            let row = DatasourceRow {
                uuid: source.uuid().to_string(),
                typestring: source.source_type().to_string(),
                definition: source.definition().raw.clone(),
                name: source.name().to_string(),
                interface: source.definition().interface.clone(),
                json: Vec::new(),
            };
            if let Err(e) = log.log_datasource(&row) {
                error!("datasource log write failed: {e}");
            }
        }
    }

    /// Orderly shutdown: sources first so no new packets arrive, then the
    /// chain drains, then storage and plumbing.
    pub fn shutdown(&self) {
        self.datasources.close_all();
        self.chain.shutdown();
        if let Some(log) = self.log.lock_or_panic().take() {
            log.close(&self.timers);
        }
        self.sysmon.stop(&self.timers);
        self.timers.shutdown();
        self.bus.shutdown();
        warn!("core shut down");
    }
}
