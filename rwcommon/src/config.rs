// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Core server configuration.
//!
//! The config is built once at startup and shared by reference; components
//! never re-read it.  Every field has a usable default so tests can run on
//! `Config::default()` and only override what they exercise.  `from_env`
//! applies `RW_`-prefixed environment overrides on top of defaults, in the
//! same spirit as the rest of our services.

use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid rate string: {0}")]
    InvalidRate(String),
    #[error("invalid alert definition: {0}")]
    InvalidAlertDefinition(String),
    #[error("invalid source definition: {0}")]
    InvalidSourceDefinition(String),
}

/// Time unit for alert rate limiting.  Ordered so that a finer unit compares
/// less than a coarser one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RateUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl RateUnit {
    pub fn window_secs(&self) -> u64 {
        match self {
            RateUnit::Second => 1,
            RateUnit::Minute => 60,
            RateUnit::Hour => 3600,
            RateUnit::Day => 86400,
        }
    }
}

/// Parse a `N/unit` rate string.  A missing unit means per-minute.
pub fn parse_rate(s: &str) -> Result<(u64, RateUnit), ConfigError> {
    let (num, unit) = match s.split_once('/') {
        Some((n, u)) => (n, Some(u)),
        None => (s, None),
    };

    let rate: u64 = num
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidRate(s.to_string()))?;

    let unit = match unit.map(|u| u.trim().to_ascii_lowercase()) {
        None => RateUnit::Minute,
        Some(u) => match u.as_str() {
            "sec" | "second" => RateUnit::Second,
            "min" | "minute" => RateUnit::Minute,
            "hr" | "hour" => RateUnit::Hour,
            "day" => RateUnit::Day,
            _ => return Err(ConfigError::InvalidRate(s.to_string())),
        },
    };

    Ok((rate, unit))
}

/// One `alert=name,limit,burst` config line, parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertDefinition {
    pub name: String,
    pub limit_rate: u64,
    pub limit_unit: RateUnit,
    pub burst_rate: u64,
    pub burst_unit: RateUnit,
}

impl FromStr for AlertDefinition {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(',').collect();
        if parts.len() != 3 {
            return Err(ConfigError::InvalidAlertDefinition(s.to_string()));
        }

        let (limit_rate, limit_unit) = parse_rate(parts[1])?;
        let (burst_rate, burst_unit) = parse_rate(parts[2])?;

        Ok(AlertDefinition {
            name: parts[0].trim().to_uppercase(),
            limit_rate,
            limit_unit,
            burst_rate,
            burst_unit,
        })
    }
}

/// A parsed `iface:opt=val,opt=val` capture source definition.  Options keep
/// their first occurrence; keys are case-insensitive.  List-valued options
/// are double-quoted so their commas survive the option split:
/// `wlan0:channels="1,6,11",name=office`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceDefinition {
    pub interface: String,
    pub options: HashMap<String, String>,
    pub raw: String,
}

/// Split on commas that are not inside double quotes.
fn split_options(s: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut quoted = false;

    for c in s.chars() {
        match c {
            '"' => quoted = !quoted,
            ',' if !quoted => {
                out.push(std::mem::take(&mut cur));
            }
            _ => cur.push(c),
        }
    }
    if !cur.is_empty() {
        out.push(cur);
    }
    out
}

impl SourceDefinition {
    pub fn opt(&self, key: &str) -> Option<&str> {
        self.options.get(&key.to_ascii_lowercase()).map(|s| s.as_str())
    }

    pub fn opt_bool(&self, key: &str, default: bool) -> bool {
        match self.opt(key) {
            Some(v) => matches!(v.to_ascii_lowercase().as_str(), "true" | "yes" | "1"),
            None => default,
        }
    }

    /// Comma-split list option, empty when the option is absent.
    pub fn opt_list(&self, key: &str) -> Vec<String> {
        match self.opt(key) {
            Some(v) if !v.is_empty() => v.split(',').map(|s| s.trim().to_string()).collect(),
            _ => Vec::new(),
        }
    }
}

impl FromStr for SourceDefinition {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ConfigError::InvalidSourceDefinition(s.to_string()));
        }

        let (interface, optstr) = match s.split_once(':') {
            Some((i, o)) => (i, o),
            None => (s, ""),
        };

        if interface.is_empty() {
            return Err(ConfigError::InvalidSourceDefinition(s.to_string()));
        }

        let mut options = HashMap::new();
        if !optstr.is_empty() {
            for opt in split_options(optstr) {
                let (k, v) = opt
                    .split_once('=')
                    .ok_or_else(|| ConfigError::InvalidSourceDefinition(s.to_string()))?;
                options
                    .entry(k.trim().to_ascii_lowercase())
                    .or_insert_with(|| v.trim().to_string());
            }
        }

        Ok(SourceDefinition {
            interface: interface.to_string(),
            options,
            raw: s.to_string(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Identifies this server in device keys and snapshots.
    pub server_uuid: Uuid,
    pub server_name: String,
    pub server_description: String,
    pub server_location: String,

    /// Retained alert ring size.
    pub alert_backlog: usize,
    /// `name,limit,burst` alert definitions, applied at startup.
    pub alert_definitions: Vec<String>,

    /// Packet worker count; 0 means one per hardware thread.
    pub packet_threads: usize,
    /// Per-worker queue depth beyond which packets are dropped.
    pub packet_backlog_limit: usize,
    /// Per-worker queue depth that triggers a backlog warning; 0 disables.
    pub packet_log_warning: usize,

    pub log_packets: bool,
    pub log_duplicate_packets: bool,
    pub log_data_packets: bool,
    /// Retention in seconds per table; 0 keeps rows forever.
    pub log_packet_timeout: u64,
    pub log_device_timeout: u64,
    pub log_alert_timeout: u64,
    pub log_message_timeout: u64,
    pub log_snapshot_timeout: u64,
    /// Unlink the database file right after opening it.
    pub log_ephemeral: bool,

    /// Device filter default (true = block) plus `phy,mac,block` entries.
    pub log_device_filter_default: bool,
    pub log_device_filter: Vec<String>,
    pub log_packet_filter_default: bool,
    pub log_packet_filter: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server_uuid: Uuid::new_v4(),
            server_name: "radiowatch".to_string(),
            server_description: String::new(),
            server_location: String::new(),

            alert_backlog: 50,
            alert_definitions: Vec::new(),

            packet_threads: 0,
            packet_backlog_limit: 8192,
            packet_log_warning: 0,

            log_packets: true,
            log_duplicate_packets: false,
            log_data_packets: true,
            log_packet_timeout: 0,
            log_device_timeout: 0,
            log_alert_timeout: 0,
            log_message_timeout: 0,
            log_snapshot_timeout: 0,
            log_ephemeral: false,

            log_device_filter_default: false,
            log_device_filter: Vec::new(),
            log_packet_filter_default: false,
            log_packet_filter: Vec::new(),
        }
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.to_ascii_lowercase().as_str(), "true" | "yes" | "1"),
        Err(_) => default,
    }
}

impl Config {
    /// Defaults with `RW_*` environment overrides for the knobs that matter
    /// in deployment.
    pub fn from_env() -> Self {
        let d = Config::default();
        Config {
            server_name: env_parse("RW_SERVER_NAME", d.server_name),
            server_description: env_parse("RW_SERVER_DESCRIPTION", d.server_description),
            server_location: env_parse("RW_SERVER_LOCATION", d.server_location),
            alert_backlog: env_parse("RW_ALERT_BACKLOG", d.alert_backlog),
            packet_threads: env_parse("RW_PACKET_THREADS", d.packet_threads),
            packet_backlog_limit: env_parse("RW_PACKET_BACKLOG_LIMIT", d.packet_backlog_limit),
            packet_log_warning: env_parse("RW_PACKET_LOG_WARNING", d.packet_log_warning),
            log_packets: env_bool("RW_LOG_PACKETS", d.log_packets),
            log_duplicate_packets: env_bool("RW_LOG_DUPLICATE_PACKETS", d.log_duplicate_packets),
            log_data_packets: env_bool("RW_LOG_DATA_PACKETS", d.log_data_packets),
            log_packet_timeout: env_parse("RW_LOG_PACKET_TIMEOUT", d.log_packet_timeout),
            log_device_timeout: env_parse("RW_LOG_DEVICE_TIMEOUT", d.log_device_timeout),
            log_alert_timeout: env_parse("RW_LOG_ALERT_TIMEOUT", d.log_alert_timeout),
            log_message_timeout: env_parse("RW_LOG_MESSAGE_TIMEOUT", d.log_message_timeout),
            log_snapshot_timeout: env_parse("RW_LOG_SNAPSHOT_TIMEOUT", d.log_snapshot_timeout),
            log_ephemeral: env_bool("RW_LOG_EPHEMERAL_DANGEROUS", d.log_ephemeral),
            ..d
        }
    }

    pub fn parsed_alert_definitions(&self) -> Result<Vec<AlertDefinition>, ConfigError> {
        self.alert_definitions.iter().map(|s| s.parse()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rate() {
        assert_eq!(parse_rate("10/min").unwrap(), (10, RateUnit::Minute));
        assert_eq!(parse_rate("5/sec").unwrap(), (5, RateUnit::Second));
        assert_eq!(parse_rate("2/hour").unwrap(), (2, RateUnit::Hour));
        assert_eq!(parse_rate("1/day").unwrap(), (1, RateUnit::Day));
        // missing unit defaults to minutes
        assert_eq!(parse_rate("7").unwrap(), (7, RateUnit::Minute));
        assert!(parse_rate("x/min").is_err());
        assert!(parse_rate("5/fortnight").is_err());
    }

    #[test]
    fn test_rate_unit_ordering() {
        assert!(RateUnit::Second < RateUnit::Minute);
        assert!(RateUnit::Minute < RateUnit::Hour);
        assert!(RateUnit::Hour < RateUnit::Day);
    }

    #[test]
    fn test_alert_definition() {
        let d: AlertDefinition = "probechan,10/min,2/sec".parse().unwrap();
        assert_eq!(d.name, "PROBECHAN");
        assert_eq!((d.limit_rate, d.limit_unit), (10, RateUnit::Minute));
        assert_eq!((d.burst_rate, d.burst_unit), (2, RateUnit::Second));

        assert!("justaname".parse::<AlertDefinition>().is_err());
        assert!("a,b,c,d".parse::<AlertDefinition>().is_err());
    }

    #[test]
    fn test_source_definition() {
        let def: SourceDefinition = "wlan0:name=office,channels=\"1,6,11\"".parse().unwrap();
        assert_eq!(def.interface, "wlan0");
        assert_eq!(def.opt("name"), Some("office"));
        assert_eq!(def.opt_list("channels"), vec!["1", "6", "11"]);

        let def: SourceDefinition = "wlan1".parse().unwrap();
        assert_eq!(def.interface, "wlan1");
        assert!(def.options.is_empty());

        let def: SourceDefinition = "wlan0:retry=TRUE,uuid=abc".parse().unwrap();
        assert!(def.opt_bool("retry", false));
        assert_eq!(def.opt("UUID"), Some("abc"));

        assert!("".parse::<SourceDefinition>().is_err());
        assert!(":opt=val".parse::<SourceDefinition>().is_err());
        // bare word in the option list
        assert!("wlan0:name=x,standalone".parse::<SourceDefinition>().is_err());
    }
}
