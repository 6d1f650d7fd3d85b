// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sub-block payload structures shared by the protocol generations.
//!
//! These are the plain data shapes; the integer-keyed MessagePack encoding
//! lives in [`crate::v3`], the protobuf encoding in [`crate::v2`].

/// One capturable interface, as reported by probe and list operations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InterfaceBlock {
    pub iface: String,
    pub flags: String,
    pub capiface: String,
    pub hw: String,
    pub chan_list: Vec<String>,
    pub channel: String,
}

/// Channel-hop parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChanHopBlock {
    pub rate: f32,
    pub shuffle: bool,
    pub skip: u16,
    pub offset: u16,
    pub chan_list: Vec<String>,
}

/// GPS sample attached to a data report.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GpsBlock {
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
    pub fix: u8,
    pub speed: f64,
    pub heading: f64,
    pub precision: f64,
    pub ts_s: u64,
    pub ts_us: u32,
    pub name: String,
    pub gps_type: String,
    pub uuid: String,
}

/// Radio layer-1 info attached to a data report.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SignalBlock {
    pub signal_dbm: i32,
    pub noise_dbm: i32,
    pub signal_rssi: i32,
    pub noise_rssi: i32,
    pub freq_khz: u64,
    pub datarate: f64,
    pub channel: String,
}

/// The captured frame itself.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PacketBlock {
    pub ts_s: u64,
    pub ts_us: u32,
    pub dlt: u32,
    /// Original (pre-truncation) length; zero means "same as content".
    pub length: u32,
    pub content: Vec<u8>,
}

/// Non-packet structured data riding alongside a capture (GPS meta, sensor
/// records, anything the helper chooses to report as JSON).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JsonBlock {
    pub ts_s: u64,
    pub ts_us: u32,
    pub json_type: String,
    pub json: String,
}

/// Human-readable message stanza carried by reports.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MsgBlock {
    pub msg_type: u8,
    pub text: String,
}

pub mod msg_type {
    pub const DEBUG: u8 = 1;
    pub const INFO: u8 = 2;
    pub const ERROR: u8 = 4;
    pub const ALERT: u8 = 8;
    pub const FATAL: u8 = 16;
}
