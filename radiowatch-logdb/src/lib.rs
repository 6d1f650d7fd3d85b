// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The run log: one SQLite database per server run.
//!
//! All writes flow through prepared statements inside a rolling
//! transaction; a ten-second timer commits and reopens it, which is the
//! unit of durability.  Retention timers trim each table on its configured
//! timeout.  The journal runs in `PERSIST` while the log is open and flips
//! to `DELETE` on close; "ephemeral" mode unlinks the file right after
//! opening so the log lives only as long as the process.
//!
//! Packets pass the device and packet MAC filters before they are written;
//! duplicates are skipped unless explicitly enabled.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

pub mod pcapng;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::{params, Connection};
use rwcommon::config::Config;
use rwcommon::timer::{TimerId, TimerService};
use rwcommon::{unix_secs, MutexExt};
use tracing::{debug, error, info, warn};

use radiowatch_alerts::AlertInfo;
use radiowatch_eventbus::{channels, Event, EventBus};
use radiowatch_packet::filters::{ClassFilterMacAddr, PacketFilterMacAddr};
use radiowatch_packet::CommonInfo;

/// Schema version; the log refuses files newer than it understands.
pub const LOG_DB_VERSION: i64 = 8;

const COMMIT_INTERVAL: Duration = Duration::from_secs(10);
const PACKET_RETENTION_INTERVAL: Duration = Duration::from_secs(15);
const TABLE_RETENTION_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("log file {path} is version {found}, newer than supported {supported}")]
    VersionTooNew {
        path: String,
        found: i64,
        supported: i64,
    },
    #[error("log is closed")]
    Closed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// One packet row, as extracted by the logging-stage handler.
#[derive(Debug, Clone, Default)]
pub struct PacketRow {
    pub ts_sec: u64,
    pub ts_usec: u32,
    pub phyname: String,
    pub sourcemac: String,
    pub destmac: String,
    pub transmac: String,
    pub frequency: f64,
    pub devkey: String,
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
    pub speed: f64,
    pub heading: f64,
    pub packet_len: usize,
    pub packet_full_len: usize,
    pub signal: i32,
    pub datasource: String,
    pub dlt: u32,
    pub packet: Vec<u8>,
    pub error: bool,
    pub tags: String,
    pub datarate: f64,
    pub hash: u32,
    pub packetid: u64,
}

/// One device row; the JSON blob is the serialized device record.
#[derive(Debug, Clone, Default)]
pub struct DeviceRow {
    pub first_time: u64,
    pub last_time: u64,
    pub devkey: String,
    pub phyname: String,
    pub devmac: String,
    pub strongest_signal: i32,
    pub min_lat: f64,
    pub min_lon: f64,
    pub max_lat: f64,
    pub max_lon: f64,
    pub avg_lat: f64,
    pub avg_lon: f64,
    pub bytes_data: u64,
    pub type_string: String,
    pub device_json: Vec<u8>,
}

/// Arbitrary non-packet data record (GPS tracks, sensor JSON, ...).
#[derive(Debug, Clone, Default)]
pub struct DataRow {
    pub ts_sec: u64,
    pub ts_usec: u32,
    pub phyname: String,
    pub devmac: String,
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
    pub speed: f64,
    pub heading: f64,
    pub datasource: String,
    pub data_type: String,
    pub json: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct DatasourceRow {
    pub uuid: String,
    pub typestring: String,
    pub definition: String,
    pub name: String,
    pub interface: String,
    pub json: Vec<u8>,
}

/// Retention configuration distilled from the server config.
#[derive(Debug, Clone)]
struct Retention {
    packet_timeout: u64,
    device_timeout: u64,
    alert_timeout: u64,
    message_timeout: u64,
    snapshot_timeout: u64,
}

pub struct DatabaseLog {
    conn: Mutex<Connection>,
    path: PathBuf,
    log_packets: bool,
    log_duplicates: bool,
    log_data_packets: bool,
    retention: Retention,
    device_filter: Arc<ClassFilterMacAddr>,
    packet_filter: Arc<PacketFilterMacAddr>,
    timers: Mutex<Vec<TimerId>>,
    open: AtomicBool,
}

impl DatabaseLog {
    /// Open (or create) the run log, upgrade the schema, start the commit
    /// and retention timers, and announce the log on the event bus.
    pub fn open(
        path: &Path,
        config: &Config,
        timer: &TimerService,
        bus: Arc<EventBus>,
        device_filter: Arc<ClassFilterMacAddr>,
        packet_filter: Arc<PacketFilterMacAddr>,
    ) -> Result<Arc<Self>, LogError> {
        let conn = Connection::open(path)?;

        let found: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if found > LOG_DB_VERSION {
            return Err(LogError::VersionTooNew {
                path: path.to_string_lossy().into_owned(),
                found,
                supported: LOG_DB_VERSION,
            });
        }

        Self::create_schema(&conn)?;
        conn.execute_batch(&format!("PRAGMA user_version = {LOG_DB_VERSION};"))?;
        // journal_mode pragmas return the resulting mode as a row
        conn.query_row("PRAGMA journal_mode=PERSIST", [], |_| Ok(()))?;
        conn.execute_batch("BEGIN TRANSACTION;")?;

        if config.log_ephemeral {
            // The file stays usable through our open handle; nothing
            // outlives the process.
            warn!("ephemeral log: unlinking {} immediately", path.display());
            let _ = std::fs::remove_file(path);
        }

        let log = Arc::new(DatabaseLog {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
            log_packets: config.log_packets,
            log_duplicates: config.log_duplicate_packets,
            log_data_packets: config.log_data_packets,
            retention: Retention {
                packet_timeout: config.log_packet_timeout,
                device_timeout: config.log_device_timeout,
                alert_timeout: config.log_alert_timeout,
                message_timeout: config.log_message_timeout,
                snapshot_timeout: config.log_snapshot_timeout,
            },
            device_filter,
            packet_filter,
            timers: Mutex::new(Vec::new()),
            open: AtomicBool::new(true),
        });

        log.start_timers(timer);

        info!(path = %log.path.display(), "database log open");
        bus.publish(Event::new(channels::DB_LOG_OPEN, log.path.clone()));

        Ok(log)
    }

    fn create_schema(conn: &Connection) -> Result<(), LogError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS devices (
                first_time INT,
                last_time INT,
                devkey TEXT,
                phyname TEXT,
                devmac TEXT,
                strongest_signal INT,
                min_lat REAL,
                min_lon REAL,
                max_lat REAL,
                max_lon REAL,
                avg_lat REAL,
                avg_lon REAL,
                bytes_data INT,
                type TEXT,
                device BLOB,
                UNIQUE(phyname, devmac) ON CONFLICT REPLACE);

            CREATE TABLE IF NOT EXISTS packets (
                ts_sec INT,
                ts_usec INT,
                phyname TEXT,
                sourcemac TEXT,
                destmac TEXT,
                transmac TEXT,
                frequency REAL,
                devkey TEXT,
                lat REAL,
                lon REAL,
                alt REAL,
                speed REAL,
                heading REAL,
                packet_len INT,
                signal INT,
                datasource TEXT,
                dlt INT,
                packet BLOB,
                error INT,
                tags TEXT,
                datarate REAL,
                hash INT,
                packetid INT,
                packet_full_len INT);

            CREATE TABLE IF NOT EXISTS data (
                ts_sec INT,
                ts_usec INT,
                phyname TEXT,
                devmac TEXT,
                lat REAL,
                lon REAL,
                alt REAL,
                speed REAL,
                heading REAL,
                datasource TEXT,
                type TEXT,
                json BLOB);

            CREATE TABLE IF NOT EXISTS datasources (
                uuid TEXT,
                typestring TEXT,
                definition TEXT,
                name TEXT,
                interface TEXT,
                json BLOB,
                UNIQUE(uuid) ON CONFLICT REPLACE);

            CREATE TABLE IF NOT EXISTS alerts (
                ts_sec INT,
                ts_usec INT,
                phyname TEXT,
                devmac TEXT,
                lat REAL,
                lon REAL,
                header TEXT,
                json BLOB);

            CREATE TABLE IF NOT EXISTS messages (
                ts_sec INT,
                lat REAL,
                lon REAL,
                msgtype TEXT,
                message TEXT);

            CREATE TABLE IF NOT EXISTS snapshots (
                ts_sec INT,
                ts_usec INT,
                lat REAL,
                lon REAL,
                snaptype TEXT,
                json BLOB);",
        )?;
        Ok(())
    }

    fn start_timers(self: &Arc<Self>, timer: &TimerService) {
        let mut timers = self.timers.lock_or_panic();

        let log = self.clone();
        timers.push(timer.register_repeating(COMMIT_INTERVAL, move || {
            log.commit_cycle();
        }));

        if self.retention.packet_timeout != 0 {
            let log = self.clone();
            timers.push(
                timer.register_repeating(PACKET_RETENTION_INTERVAL, move || {
                    log.purge_packets();
                }),
            );
        }

        macro_rules! retention_timer {
            ($timeout:expr, $method:ident) => {
                if $timeout != 0 {
                    let log = self.clone();
                    timers.push(
                        timer.register_repeating(TABLE_RETENTION_INTERVAL, move || {
                            log.$method();
                        }),
                    );
                }
            };
        }

        retention_timer!(self.retention.device_timeout, purge_devices);
        retention_timer!(self.retention.alert_timeout, purge_alerts);
        retention_timer!(self.retention.message_timeout, purge_messages);
        retention_timer!(self.retention.snapshot_timeout, purge_snapshots);
    }

    fn commit_cycle(&self) {
        if !self.open.load(Ordering::Relaxed) {
            return;
        }
        let conn = self.conn.lock_or_panic();
        if let Err(e) = conn.execute_batch("END TRANSACTION; BEGIN TRANSACTION;") {
            error!("log commit cycle failed: {e}");
        }
    }

    fn purge(&self, sql: &str, cutoff: u64) {
        if !self.open.load(Ordering::Relaxed) {
            return;
        }
        let conn = self.conn.lock_or_panic();
        match conn.execute(sql, params![cutoff]) {
            Ok(rows) if rows > 0 => debug!(rows, "log retention purge"),
            Ok(_) => {}
            Err(e) => error!("log retention purge failed: {e}"),
        }
    }

    pub fn purge_packets(&self) {
        let cutoff = unix_secs().saturating_sub(self.retention.packet_timeout);
        self.purge("DELETE FROM packets WHERE ts_sec < ?1", cutoff);
        self.purge("DELETE FROM data WHERE ts_sec < ?1", cutoff);
    }

    pub fn purge_devices(&self) {
        let cutoff = unix_secs().saturating_sub(self.retention.device_timeout);
        self.purge("DELETE FROM devices WHERE last_time < ?1", cutoff);
    }

    pub fn purge_alerts(&self) {
        let cutoff = unix_secs().saturating_sub(self.retention.alert_timeout);
        self.purge("DELETE FROM alerts WHERE ts_sec < ?1", cutoff);
    }

    pub fn purge_messages(&self) {
        let cutoff = unix_secs().saturating_sub(self.retention.message_timeout);
        self.purge("DELETE FROM messages WHERE ts_sec < ?1", cutoff);
    }

    pub fn purge_snapshots(&self) {
        let cutoff = unix_secs().saturating_sub(self.retention.snapshot_timeout);
        self.purge("DELETE FROM snapshots WHERE ts_sec < ?1", cutoff);
    }

    fn check_open(&self) -> Result<(), LogError> {
        if self.open.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(LogError::Closed)
        }
    }

    /// Write a packet row, honoring the duplicate policy and both MAC
    /// filters.  Returns whether the row was written.
    pub fn log_packet(
        &self,
        row: &PacketRow,
        duplicate: bool,
        common: Option<&CommonInfo>,
    ) -> Result<bool, LogError> {
        self.check_open()?;

        if !self.log_packets {
            return Ok(false);
        }
        if duplicate && !self.log_duplicates {
            return Ok(false);
        }

        if let Some(common) = common {
            if !self.log_data_packets && common.packet_type == "data" {
                return Ok(false);
            }
            if self.device_filter.filter(&common.source, common.phy_id) {
                return Ok(false);
            }
            if self.packet_filter.filter_packet(common) {
                return Ok(false);
            }
        }

        let conn = self.conn.lock_or_panic();
        let mut stmt = conn.prepare_cached(
            "INSERT INTO packets (ts_sec, ts_usec, phyname, sourcemac, destmac, transmac, \
             frequency, devkey, lat, lon, alt, speed, heading, packet_len, signal, datasource, \
             dlt, packet, error, tags, datarate, hash, packetid, packet_full_len) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, \
             ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)",
        )?;
        stmt.execute(params![
            row.ts_sec,
            row.ts_usec,
            row.phyname,
            row.sourcemac,
            row.destmac,
            row.transmac,
            row.frequency,
            row.devkey,
            row.lat,
            row.lon,
            row.alt,
            row.speed,
            row.heading,
            row.packet_len as i64,
            row.signal,
            row.datasource,
            row.dlt,
            row.packet,
            row.error as i64,
            row.tags,
            row.datarate,
            row.hash,
            row.packetid as i64,
            row.packet_full_len as i64,
        ])?;
        Ok(true)
    }

    pub fn log_device(&self, row: &DeviceRow) -> Result<(), LogError> {
        self.check_open()?;
        let conn = self.conn.lock_or_panic();
        let mut stmt = conn.prepare_cached(
            "INSERT INTO devices (first_time, last_time, devkey, phyname, devmac, \
             strongest_signal, min_lat, min_lon, max_lat, max_lon, avg_lat, avg_lon, \
             bytes_data, type, device) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        )?;
        stmt.execute(params![
            row.first_time,
            row.last_time,
            row.devkey,
            row.phyname,
            row.devmac,
            row.strongest_signal,
            row.min_lat,
            row.min_lon,
            row.max_lat,
            row.max_lon,
            row.avg_lat,
            row.avg_lon,
            row.bytes_data as i64,
            row.type_string,
            row.device_json,
        ])?;
        Ok(())
    }

    pub fn log_data(&self, row: &DataRow) -> Result<(), LogError> {
        self.check_open()?;
        let conn = self.conn.lock_or_panic();
        let mut stmt = conn.prepare_cached(
            "INSERT INTO data (ts_sec, ts_usec, phyname, devmac, lat, lon, alt, speed, \
             heading, datasource, type, json) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        )?;
        stmt.execute(params![
            row.ts_sec,
            row.ts_usec,
            row.phyname,
            row.devmac,
            row.lat,
            row.lon,
            row.alt,
            row.speed,
            row.heading,
            row.datasource,
            row.data_type,
            row.json,
        ])?;
        Ok(())
    }

    pub fn log_datasource(&self, row: &DatasourceRow) -> Result<(), LogError> {
        self.check_open()?;
        let conn = self.conn.lock_or_panic();
        let mut stmt = conn.prepare_cached(
            "INSERT INTO datasources (uuid, typestring, definition, name, interface, json) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        stmt.execute(params![
            row.uuid,
            row.typestring,
            row.definition,
            row.name,
            row.interface,
            row.json,
        ])?;
        Ok(())
    }

    pub fn log_alert(
        &self,
        alert: &AlertInfo,
        phyname: &str,
        json: &[u8],
    ) -> Result<(), LogError> {
        self.check_open()?;
        let (lat, lon) = alert
            .location
            .map(|l| (l.lat, l.lon))
            .unwrap_or((0.0, 0.0));

        let conn = self.conn.lock_or_panic();
        let mut stmt = conn.prepare_cached(
            "INSERT INTO alerts (ts_sec, ts_usec, phyname, devmac, lat, lon, header, json) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?;
        stmt.execute(params![
            alert.ts_sec,
            alert.ts_usec,
            phyname,
            alert.bssid.to_string(),
            lat,
            lon,
            alert.header,
            json,
        ])?;
        Ok(())
    }

    pub fn log_message(
        &self,
        ts_sec: u64,
        lat: f64,
        lon: f64,
        msgtype: &str,
        message: &str,
    ) -> Result<(), LogError> {
        self.check_open()?;
        let conn = self.conn.lock_or_panic();
        let mut stmt = conn.prepare_cached(
            "INSERT INTO messages (ts_sec, lat, lon, msgtype, message) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        stmt.execute(params![ts_sec, lat, lon, msgtype, message])?;
        Ok(())
    }

    pub fn log_snapshot(
        &self,
        ts_sec: u64,
        ts_usec: u32,
        lat: f64,
        lon: f64,
        snaptype: &str,
        json: &[u8],
    ) -> Result<(), LogError> {
        self.check_open()?;
        let conn = self.conn.lock_or_panic();
        let mut stmt = conn.prepare_cached(
            "INSERT INTO snapshots (ts_sec, ts_usec, lat, lon, snaptype, json) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        stmt.execute(params![ts_sec, ts_usec, lat, lon, snaptype, json])?;
        Ok(())
    }

    /// Stream matching packets as pcapng.  See [`pcapng`].
    pub fn stream_pcapng(
        &self,
        query: &pcapng::PcapQuery,
        out: &mut dyn std::io::Write,
    ) -> Result<usize, LogError> {
        self.check_open()?;
        let conn = self.conn.lock_or_panic();
        pcapng::stream_pcapng(&conn, query, out)
    }

    pub fn count_rows(&self, table: &str) -> Result<i64, LogError> {
        self.check_open()?;
        let conn = self.conn.lock_or_panic();
        // Table names come from our own callers, never user input.
        let n = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
            row.get(0)
        })?;
        Ok(n)
    }

    /// Take the log out of service after a storage error: no more writes,
    /// timers become no-ops, capture continues without logging.  Best
    /// effort commit of whatever the transaction holds.
    pub fn fail(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        error!(path = %self.path.display(), "log failed; continuing without storage");
        let conn = self.conn.lock_or_panic();
        let _ = conn.execute_batch("END TRANSACTION;");
    }

    /// Stop the timers' work, close the rolling transaction, and flip the
    /// journal to DELETE.  Storage errors after this point are impossible
    /// because nothing writes anymore.
    pub fn close(&self, timer: &TimerService) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        for id in self.timers.lock_or_panic().drain(..) {
            timer.remove_timer(id);
        }

        let conn = self.conn.lock_or_panic();
        if let Err(e) = conn.execute_batch("END TRANSACTION;") {
            error!("log close commit failed: {e}");
        }
        if let Err(e) = conn.query_row("PRAGMA journal_mode=DELETE", [], |_| Ok(())) {
            error!("log close journal flip failed: {e}");
        }
        info!(path = %self.path.display(), "database log closed");
    }
}
