// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! v3 protocol: binary header plus integer-keyed MessagePack bodies.
//!
//! Header layout, bit-exact on the wire: `u16 command`, `u16 code`, `u32
//! seqno`, all big-endian, then the body.  `code` zero marks a failed
//! report; requests carry `CODE_OK`.  Reports additionally echo the seqno
//! of the request they answer inside the body, which is what the command
//! correlation layer keys on.
//!
//! Unknown map keys are skipped so helpers newer than the server keep
//! working; missing mandatory keys are decode errors.

use crate::blocks::{
    ChanHopBlock, GpsBlock, InterfaceBlock, JsonBlock, MsgBlock, PacketBlock, SignalBlock,
};
use crate::DecodeError;

use rmp::encode as mp;
use rmpv::Value;

pub const CODE_FAILURE: u16 = 0;
pub const CODE_OK: u16 = 1;

/// Command ids.  Values below 16 are session plumbing, the KDS block is the
/// datasource command set.
pub mod command {
    pub const PING: u16 = 1;
    pub const PONG: u16 = 2;
    pub const MESSAGE: u16 = 3;

    pub const KDS_PROBEREQ: u16 = 16;
    pub const KDS_PROBEREPORT: u16 = 17;
    pub const KDS_LISTREQ: u16 = 18;
    pub const KDS_LISTREPORT: u16 = 19;
    pub const KDS_OPENREQ: u16 = 20;
    pub const KDS_OPENREPORT: u16 = 21;
    pub const KDS_CONFIGREQ: u16 = 22;
    pub const KDS_CONFIGREPORT: u16 = 23;
    pub const KDS_PACKET: u16 = 24;
}

mod key {
    // interface sub-block
    pub const IFACE_IFACE: u64 = 1;
    pub const IFACE_FLAGS: u64 = 2;
    pub const IFACE_CAPIFACE: u64 = 3;
    pub const IFACE_HW: u64 = 4;
    pub const IFACE_CHAN_LIST: u64 = 5;
    pub const IFACE_CHANNEL: u64 = 6;

    // chanhop sub-block
    pub const HOP_RATE: u64 = 1;
    pub const HOP_SHUFFLE: u64 = 2;
    pub const HOP_SKIP: u64 = 3;
    pub const HOP_OFFSET: u64 = 4;
    pub const HOP_CHAN_LIST: u64 = 5;

    // gps sub-block
    pub const GPS_LAT: u64 = 1;
    pub const GPS_LON: u64 = 2;
    pub const GPS_ALT: u64 = 3;
    pub const GPS_FIX: u64 = 4;
    pub const GPS_SPEED: u64 = 5;
    pub const GPS_HEADING: u64 = 6;
    pub const GPS_PRECISION: u64 = 7;
    pub const GPS_TS_S: u64 = 8;
    pub const GPS_TS_US: u64 = 9;
    pub const GPS_NAME: u64 = 10;
    pub const GPS_TYPE: u64 = 11;
    pub const GPS_UUID: u64 = 12;

    // signal sub-block
    pub const SIG_SIGNAL_DBM: u64 = 1;
    pub const SIG_NOISE_DBM: u64 = 2;
    pub const SIG_SIGNAL_RSSI: u64 = 3;
    pub const SIG_NOISE_RSSI: u64 = 4;
    pub const SIG_FREQ_KHZ: u64 = 5;
    pub const SIG_DATARATE: u64 = 6;
    pub const SIG_CHANNEL: u64 = 7;

    // packet sub-block
    pub const PKT_TS_S: u64 = 1;
    pub const PKT_TS_US: u64 = 2;
    pub const PKT_DLT: u64 = 3;
    pub const PKT_LENGTH: u64 = 4;
    pub const PKT_CONTENT: u64 = 5;

    // json sub-block
    pub const JSON_TS_S: u64 = 1;
    pub const JSON_TS_US: u64 = 2;
    pub const JSON_TYPE: u64 = 3;
    pub const JSON_JSON: u64 = 4;

    // msg sub-block
    pub const MSG_TYPE: u64 = 1;
    pub const MSG_TEXT: u64 = 2;

    // request bodies
    pub const REQ_DEFINITION: u64 = 1;

    // report bodies
    pub const RPT_SEQNO: u64 = 1;
    pub const RPT_MSG: u64 = 2;
    pub const RPT_INTERFACE: u64 = 3;
    pub const RPT_IFLIST: u64 = 3;
    pub const RPT_UUID: u64 = 3;
    pub const RPT_DLT: u64 = 4;
    pub const RPT_CAPIFACE: u64 = 5;
    pub const RPT_CHAN_LIST: u64 = 6;
    pub const RPT_CHANHOP: u64 = 7;
    pub const RPT_CHANNEL: u64 = 8;

    // config request body
    pub const CFG_CHANNEL: u64 = 1;
    pub const CFG_CHANHOP: u64 = 2;

    // packet datagram body
    pub const DATA_GPS: u64 = 1;
    pub const DATA_SIGNAL: u64 = 2;
    pub const DATA_PACKET: u64 = 3;
    pub const DATA_JSON: u64 = 4;
}

/// A decoded v3 frame: header fields plus the raw body.
#[derive(Debug, Clone, PartialEq)]
pub struct V3Frame {
    pub command: u16,
    pub code: u16,
    pub seqno: u32,
    pub body: Vec<u8>,
}

impl V3Frame {
    pub const HEADER_LEN: usize = 8;

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.command.to_be_bytes());
        out.extend_from_slice(&self.code.to_be_bytes());
        out.extend_from_slice(&self.seqno.to_be_bytes());
        out.extend_from_slice(&self.body);
    }

    pub fn decode(buf: &[u8]) -> Result<V3Frame, DecodeError> {
        if buf.len() < Self::HEADER_LEN {
            return Err(DecodeError::Truncated);
        }
        Ok(V3Frame {
            command: u16::from_be_bytes([buf[0], buf[1]]),
            code: u16::from_be_bytes([buf[2], buf[3]]),
            seqno: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            body: buf[Self::HEADER_LEN..].to_vec(),
        })
    }

    pub fn is_success(&self) -> bool {
        self.code != CODE_FAILURE
    }
}

// ---- decode helpers -------------------------------------------------------

struct MapReader<'a> {
    context: &'static str,
    entries: &'a [(Value, Value)],
}

impl<'a> MapReader<'a> {
    fn from_value(context: &'static str, v: &'a Value) -> Result<Self, DecodeError> {
        match v {
            Value::Map(entries) => Ok(MapReader { context, entries }),
            _ => Err(DecodeError::WrongType { context, field: 0 }),
        }
    }

    fn get(&self, field: u64) -> Option<&'a Value> {
        self.entries.iter().find_map(|(k, v)| match k.as_u64() {
            Some(n) if n == field => Some(v),
            _ => None,
        })
    }

    fn require(&self, field: u64) -> Result<&'a Value, DecodeError> {
        self.get(field).ok_or(DecodeError::MissingField {
            context: self.context,
            field: field as u32,
        })
    }

    fn wrong(&self, field: u64) -> DecodeError {
        DecodeError::WrongType {
            context: self.context,
            field: field as u32,
        }
    }

    fn u64_opt(&self, field: u64) -> Result<Option<u64>, DecodeError> {
        match self.get(field) {
            None => Ok(None),
            Some(v) => v.as_u64().map(Some).ok_or_else(|| self.wrong(field)),
        }
    }

    fn u64_or(&self, field: u64, default: u64) -> Result<u64, DecodeError> {
        Ok(self.u64_opt(field)?.unwrap_or(default))
    }

    fn u64_req(&self, field: u64) -> Result<u64, DecodeError> {
        self.require(field)?
            .as_u64()
            .ok_or_else(|| self.wrong(field))
    }

    fn i64_or(&self, field: u64, default: i64) -> Result<i64, DecodeError> {
        match self.get(field) {
            None => Ok(default),
            Some(v) => v.as_i64().ok_or_else(|| self.wrong(field)),
        }
    }

    fn f64_or(&self, field: u64, default: f64) -> Result<f64, DecodeError> {
        match self.get(field) {
            None => Ok(default),
            Some(v) => match v {
                Value::F32(f) => Ok(*f as f64),
                Value::F64(f) => Ok(*f),
                Value::Integer(i) => i
                    .as_f64()
                    .ok_or_else(|| self.wrong(field)),
                _ => Err(self.wrong(field)),
            },
        }
    }

    fn bool_or(&self, field: u64, default: bool) -> Result<bool, DecodeError> {
        match self.get(field) {
            None => Ok(default),
            Some(Value::Boolean(b)) => Ok(*b),
            Some(_) => Err(self.wrong(field)),
        }
    }

    fn str_or(&self, field: u64, default: &str) -> Result<String, DecodeError> {
        match self.get(field) {
            None => Ok(default.to_string()),
            Some(v) => v
                .as_str()
                .map(|s| s.to_string())
                .ok_or_else(|| self.wrong(field)),
        }
    }

    fn str_req(&self, field: u64) -> Result<String, DecodeError> {
        self.require(field)?
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| self.wrong(field))
    }

    fn bin_req(&self, field: u64) -> Result<Vec<u8>, DecodeError> {
        match self.require(field)? {
            Value::Binary(b) => Ok(b.clone()),
            Value::String(s) => Ok(s.as_bytes().to_vec()),
            _ => Err(self.wrong(field)),
        }
    }

    fn str_array_or_empty(&self, field: u64) -> Result<Vec<String>, DecodeError> {
        match self.get(field) {
            None => Ok(Vec::new()),
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| {
                    v.as_str()
                        .map(|s| s.to_string())
                        .ok_or_else(|| self.wrong(field))
                })
                .collect(),
            Some(_) => Err(self.wrong(field)),
        }
    }
}

fn parse_body(context: &'static str, body: &[u8]) -> Result<Value, DecodeError> {
    let mut cursor = std::io::Cursor::new(body);
    rmpv::decode::read_value(&mut cursor)
        .map_err(|e| DecodeError::InvalidMsgpack(format!("{context}: {e}")))
}

// ---- encode helpers -------------------------------------------------------

fn emit_str(out: &mut Vec<u8>, key: u64, s: &str) {
    let _ = mp::write_uint(out, key);
    let _ = mp::write_str(out, s);
}

fn emit_uint(out: &mut Vec<u8>, key: u64, v: u64) {
    let _ = mp::write_uint(out, key);
    let _ = mp::write_uint(out, v);
}

fn emit_sint(out: &mut Vec<u8>, key: u64, v: i64) {
    let _ = mp::write_uint(out, key);
    let _ = mp::write_sint(out, v);
}

fn emit_f64(out: &mut Vec<u8>, key: u64, v: f64) {
    let _ = mp::write_uint(out, key);
    let _ = mp::write_f64(out, v);
}

fn emit_f32(out: &mut Vec<u8>, key: u64, v: f32) {
    let _ = mp::write_uint(out, key);
    let _ = mp::write_f32(out, v);
}

fn emit_bool(out: &mut Vec<u8>, key: u64, v: bool) {
    let _ = mp::write_uint(out, key);
    let _ = mp::write_bool(out, v);
}

fn emit_bin(out: &mut Vec<u8>, key: u64, v: &[u8]) {
    let _ = mp::write_uint(out, key);
    let _ = mp::write_bin(out, v);
}

fn emit_str_array(out: &mut Vec<u8>, key: u64, items: &[String]) {
    let _ = mp::write_uint(out, key);
    let _ = mp::write_array_len(out, items.len() as u32);
    for item in items {
        let _ = mp::write_str(out, item);
    }
}

fn map_header(out: &mut Vec<u8>, len: u32) {
    let _ = mp::write_map_len(out, len);
}

// ---- sub-block codecs -----------------------------------------------------

impl InterfaceBlock {
    fn emit(&self, out: &mut Vec<u8>) {
        map_header(out, 6);
        emit_str(out, key::IFACE_IFACE, &self.iface);
        emit_str(out, key::IFACE_FLAGS, &self.flags);
        emit_str(out, key::IFACE_CAPIFACE, &self.capiface);
        emit_str(out, key::IFACE_HW, &self.hw);
        emit_str_array(out, key::IFACE_CHAN_LIST, &self.chan_list);
        emit_str(out, key::IFACE_CHANNEL, &self.channel);
    }

    fn from_value(v: &Value) -> Result<Self, DecodeError> {
        let m = MapReader::from_value("interface", v)?;
        Ok(InterfaceBlock {
            iface: m.str_or(key::IFACE_IFACE, "")?,
            flags: m.str_or(key::IFACE_FLAGS, "")?,
            capiface: m.str_or(key::IFACE_CAPIFACE, "")?,
            hw: m.str_or(key::IFACE_HW, "")?,
            chan_list: m.str_array_or_empty(key::IFACE_CHAN_LIST)?,
            channel: m.str_or(key::IFACE_CHANNEL, "")?,
        })
    }
}

impl ChanHopBlock {
    fn emit(&self, out: &mut Vec<u8>) {
        map_header(out, 5);
        emit_f32(out, key::HOP_RATE, self.rate);
        emit_bool(out, key::HOP_SHUFFLE, self.shuffle);
        emit_uint(out, key::HOP_SKIP, self.skip as u64);
        emit_uint(out, key::HOP_OFFSET, self.offset as u64);
        emit_str_array(out, key::HOP_CHAN_LIST, &self.chan_list);
    }

    fn from_value(v: &Value) -> Result<Self, DecodeError> {
        let m = MapReader::from_value("chanhop", v)?;
        Ok(ChanHopBlock {
            rate: m.f64_or(key::HOP_RATE, 0.0)? as f32,
            shuffle: m.bool_or(key::HOP_SHUFFLE, false)?,
            skip: m.u64_or(key::HOP_SKIP, 0)? as u16,
            offset: m.u64_or(key::HOP_OFFSET, 0)? as u16,
            chan_list: m.str_array_or_empty(key::HOP_CHAN_LIST)?,
        })
    }
}

impl GpsBlock {
    fn emit(&self, out: &mut Vec<u8>) {
        map_header(out, 12);
        emit_f64(out, key::GPS_LAT, self.lat);
        emit_f64(out, key::GPS_LON, self.lon);
        emit_f64(out, key::GPS_ALT, self.alt);
        emit_uint(out, key::GPS_FIX, self.fix as u64);
        emit_f64(out, key::GPS_SPEED, self.speed);
        emit_f64(out, key::GPS_HEADING, self.heading);
        emit_f64(out, key::GPS_PRECISION, self.precision);
        emit_uint(out, key::GPS_TS_S, self.ts_s);
        emit_uint(out, key::GPS_TS_US, self.ts_us as u64);
        emit_str(out, key::GPS_NAME, &self.name);
        emit_str(out, key::GPS_TYPE, &self.gps_type);
        emit_str(out, key::GPS_UUID, &self.uuid);
    }

    fn from_value(v: &Value) -> Result<Self, DecodeError> {
        let m = MapReader::from_value("gps", v)?;
        Ok(GpsBlock {
            lat: m.f64_or(key::GPS_LAT, 0.0)?,
            lon: m.f64_or(key::GPS_LON, 0.0)?,
            alt: m.f64_or(key::GPS_ALT, 0.0)?,
            fix: m.u64_or(key::GPS_FIX, 0)? as u8,
            speed: m.f64_or(key::GPS_SPEED, 0.0)?,
            heading: m.f64_or(key::GPS_HEADING, 0.0)?,
            precision: m.f64_or(key::GPS_PRECISION, 0.0)?,
            ts_s: m.u64_or(key::GPS_TS_S, 0)?,
            ts_us: m.u64_or(key::GPS_TS_US, 0)? as u32,
            name: m.str_or(key::GPS_NAME, "")?,
            gps_type: m.str_or(key::GPS_TYPE, "")?,
            uuid: m.str_or(key::GPS_UUID, "")?,
        })
    }
}

impl SignalBlock {
    fn emit(&self, out: &mut Vec<u8>) {
        map_header(out, 7);
        emit_sint(out, key::SIG_SIGNAL_DBM, self.signal_dbm as i64);
        emit_sint(out, key::SIG_NOISE_DBM, self.noise_dbm as i64);
        emit_sint(out, key::SIG_SIGNAL_RSSI, self.signal_rssi as i64);
        emit_sint(out, key::SIG_NOISE_RSSI, self.noise_rssi as i64);
        emit_uint(out, key::SIG_FREQ_KHZ, self.freq_khz);
        emit_f64(out, key::SIG_DATARATE, self.datarate);
        emit_str(out, key::SIG_CHANNEL, &self.channel);
    }

    fn from_value(v: &Value) -> Result<Self, DecodeError> {
        let m = MapReader::from_value("signal", v)?;
        Ok(SignalBlock {
            signal_dbm: m.i64_or(key::SIG_SIGNAL_DBM, 0)? as i32,
            noise_dbm: m.i64_or(key::SIG_NOISE_DBM, 0)? as i32,
            signal_rssi: m.i64_or(key::SIG_SIGNAL_RSSI, 0)? as i32,
            noise_rssi: m.i64_or(key::SIG_NOISE_RSSI, 0)? as i32,
            freq_khz: m.u64_or(key::SIG_FREQ_KHZ, 0)?,
            datarate: m.f64_or(key::SIG_DATARATE, 0.0)?,
            channel: m.str_or(key::SIG_CHANNEL, "")?,
        })
    }
}

impl PacketBlock {
    fn emit(&self, out: &mut Vec<u8>) {
        map_header(out, 5);
        emit_uint(out, key::PKT_TS_S, self.ts_s);
        emit_uint(out, key::PKT_TS_US, self.ts_us as u64);
        emit_uint(out, key::PKT_DLT, self.dlt as u64);
        emit_uint(out, key::PKT_LENGTH, self.length as u64);
        emit_bin(out, key::PKT_CONTENT, &self.content);
    }

    fn from_value(v: &Value) -> Result<Self, DecodeError> {
        let m = MapReader::from_value("packet", v)?;
        let content = m.bin_req(key::PKT_CONTENT)?;
        let length = m.u64_or(key::PKT_LENGTH, content.len() as u64)? as u32;
        Ok(PacketBlock {
            ts_s: m.u64_or(key::PKT_TS_S, 0)?,
            ts_us: m.u64_or(key::PKT_TS_US, 0)? as u32,
            dlt: m.u64_or(key::PKT_DLT, 0)? as u32,
            length,
            content,
        })
    }
}

impl JsonBlock {
    fn emit(&self, out: &mut Vec<u8>) {
        map_header(out, 4);
        emit_uint(out, key::JSON_TS_S, self.ts_s);
        emit_uint(out, key::JSON_TS_US, self.ts_us as u64);
        emit_str(out, key::JSON_TYPE, &self.json_type);
        emit_str(out, key::JSON_JSON, &self.json);
    }

    fn from_value(v: &Value) -> Result<Self, DecodeError> {
        let m = MapReader::from_value("json", v)?;
        Ok(JsonBlock {
            ts_s: m.u64_or(key::JSON_TS_S, 0)?,
            ts_us: m.u64_or(key::JSON_TS_US, 0)? as u32,
            json_type: m.str_req(key::JSON_TYPE)?,
            json: m.str_req(key::JSON_JSON)?,
        })
    }
}

impl MsgBlock {
    fn emit(&self, out: &mut Vec<u8>) {
        map_header(out, 2);
        emit_uint(out, key::MSG_TYPE, self.msg_type as u64);
        emit_str(out, key::MSG_TEXT, &self.text);
    }

    fn from_value(v: &Value) -> Result<Self, DecodeError> {
        let m = MapReader::from_value("msg", v)?;
        Ok(MsgBlock {
            msg_type: m.u64_or(key::MSG_TYPE, 0)? as u8,
            text: m.str_or(key::MSG_TEXT, "")?,
        })
    }
}

// ---- message payloads -----------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeReport {
    pub seqno: u32,
    pub msg: Option<MsgBlock>,
    pub interface: Option<InterfaceBlock>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListReport {
    pub seqno: u32,
    pub msg: Option<MsgBlock>,
    pub interfaces: Vec<InterfaceBlock>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpenReport {
    pub seqno: u32,
    pub msg: Option<MsgBlock>,
    pub uuid: String,
    pub dlt: u32,
    pub capiface: String,
    pub chan_list: Vec<String>,
    pub chanhop: Option<ChanHopBlock>,
    pub channel: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigReq {
    pub channel: Option<String>,
    pub chanhop: Option<ChanHopBlock>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigReport {
    pub seqno: u32,
    pub msg: Option<MsgBlock>,
    pub channel: String,
    pub chanhop: Option<ChanHopBlock>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PacketReport {
    pub gps: Option<GpsBlock>,
    pub signal: Option<SignalBlock>,
    pub packet: Option<PacketBlock>,
    pub json: Option<JsonBlock>,
}

/// Every v3 message the server sends or understands.
#[derive(Debug, Clone, PartialEq)]
pub enum V3Payload {
    Ping,
    Pong,
    Message(MsgBlock),
    ProbeReq { definition: String },
    ProbeReport(ProbeReport),
    ListReq,
    ListReport(ListReport),
    OpenReq { definition: String },
    OpenReport(OpenReport),
    ConfigReq(ConfigReq),
    ConfigReport(ConfigReport),
    Packet(Box<PacketReport>),
}

impl V3Payload {
    pub fn command(&self) -> u16 {
        match self {
            V3Payload::Ping => command::PING,
            V3Payload::Pong => command::PONG,
            V3Payload::Message(_) => command::MESSAGE,
            V3Payload::ProbeReq { .. } => command::KDS_PROBEREQ,
            V3Payload::ProbeReport(_) => command::KDS_PROBEREPORT,
            V3Payload::ListReq => command::KDS_LISTREQ,
            V3Payload::ListReport(_) => command::KDS_LISTREPORT,
            V3Payload::OpenReq { .. } => command::KDS_OPENREQ,
            V3Payload::OpenReport(_) => command::KDS_OPENREPORT,
            V3Payload::ConfigReq(_) => command::KDS_CONFIGREQ,
            V3Payload::ConfigReport(_) => command::KDS_CONFIGREPORT,
            V3Payload::Packet(_) => command::KDS_PACKET,
        }
    }

    /// Build a wire frame.  `code` is meaningful for reports; requests and
    /// datagrams carry `CODE_OK`.
    pub fn into_frame(self, seqno: u32, code: u16) -> V3Frame {
        let command = self.command();
        let mut body = Vec::new();

        match self {
            V3Payload::Ping | V3Payload::Pong | V3Payload::ListReq => {
                map_header(&mut body, 0);
            }
            V3Payload::Message(msg) => msg.emit(&mut body),
            V3Payload::ProbeReq { definition } | V3Payload::OpenReq { definition } => {
                map_header(&mut body, 1);
                emit_str(&mut body, key::REQ_DEFINITION, &definition);
            }
            V3Payload::ProbeReport(r) => {
                let mut n = 1;
                if r.msg.is_some() {
                    n += 1;
                }
                if r.interface.is_some() {
                    n += 1;
                }
                map_header(&mut body, n);
                emit_uint(&mut body, key::RPT_SEQNO, r.seqno as u64);
                if let Some(msg) = &r.msg {
                    let _ = mp::write_uint(&mut body, key::RPT_MSG);
                    msg.emit(&mut body);
                }
                if let Some(iface) = &r.interface {
                    let _ = mp::write_uint(&mut body, key::RPT_INTERFACE);
                    iface.emit(&mut body);
                }
            }
            V3Payload::ListReport(r) => {
                let mut n = 2;
                if r.msg.is_some() {
                    n += 1;
                }
                map_header(&mut body, n);
                emit_uint(&mut body, key::RPT_SEQNO, r.seqno as u64);
                if let Some(msg) = &r.msg {
                    let _ = mp::write_uint(&mut body, key::RPT_MSG);
                    msg.emit(&mut body);
                }
                let _ = mp::write_uint(&mut body, key::RPT_IFLIST);
                let _ = mp::write_array_len(&mut body, r.interfaces.len() as u32);
                for iface in &r.interfaces {
                    iface.emit(&mut body);
                }
            }
            V3Payload::OpenReport(r) => {
                let mut n = 5;
                if r.msg.is_some() {
                    n += 1;
                }
                if r.chanhop.is_some() {
                    n += 1;
                }
                if !r.channel.is_empty() {
                    n += 1;
                }
                map_header(&mut body, n);
                emit_uint(&mut body, key::RPT_SEQNO, r.seqno as u64);
                if let Some(msg) = &r.msg {
                    let _ = mp::write_uint(&mut body, key::RPT_MSG);
                    msg.emit(&mut body);
                }
                emit_str(&mut body, key::RPT_UUID, &r.uuid);
                emit_uint(&mut body, key::RPT_DLT, r.dlt as u64);
                emit_str(&mut body, key::RPT_CAPIFACE, &r.capiface);
                emit_str_array(&mut body, key::RPT_CHAN_LIST, &r.chan_list);
                if let Some(hop) = &r.chanhop {
                    let _ = mp::write_uint(&mut body, key::RPT_CHANHOP);
                    hop.emit(&mut body);
                }
                if !r.channel.is_empty() {
                    emit_str(&mut body, key::RPT_CHANNEL, &r.channel);
                }
            }
            V3Payload::ConfigReq(r) => {
                let mut n = 0;
                if r.channel.is_some() {
                    n += 1;
                }
                if r.chanhop.is_some() {
                    n += 1;
                }
                map_header(&mut body, n);
                if let Some(channel) = &r.channel {
                    emit_str(&mut body, key::CFG_CHANNEL, channel);
                }
                if let Some(hop) = &r.chanhop {
                    let _ = mp::write_uint(&mut body, key::CFG_CHANHOP);
                    hop.emit(&mut body);
                }
            }
            V3Payload::ConfigReport(r) => {
                let mut n = 2;
                if r.msg.is_some() {
                    n += 1;
                }
                if r.chanhop.is_some() {
                    n += 1;
                }
                map_header(&mut body, n);
                emit_uint(&mut body, key::RPT_SEQNO, r.seqno as u64);
                if let Some(msg) = &r.msg {
                    let _ = mp::write_uint(&mut body, key::RPT_MSG);
                    msg.emit(&mut body);
                }
                emit_str(&mut body, key::RPT_CHANNEL, &r.channel);
                if let Some(hop) = &r.chanhop {
                    let _ = mp::write_uint(&mut body, key::RPT_CHANHOP);
                    hop.emit(&mut body);
                }
            }
            V3Payload::Packet(r) => {
                let mut n = 0;
                if r.gps.is_some() {
                    n += 1;
                }
                if r.signal.is_some() {
                    n += 1;
                }
                if r.packet.is_some() {
                    n += 1;
                }
                if r.json.is_some() {
                    n += 1;
                }
                map_header(&mut body, n);
                if let Some(gps) = &r.gps {
                    let _ = mp::write_uint(&mut body, key::DATA_GPS);
                    gps.emit(&mut body);
                }
                if let Some(signal) = &r.signal {
                    let _ = mp::write_uint(&mut body, key::DATA_SIGNAL);
                    signal.emit(&mut body);
                }
                if let Some(packet) = &r.packet {
                    let _ = mp::write_uint(&mut body, key::DATA_PACKET);
                    packet.emit(&mut body);
                }
                if let Some(json) = &r.json {
                    let _ = mp::write_uint(&mut body, key::DATA_JSON);
                    json.emit(&mut body);
                }
            }
        }

        V3Frame {
            command,
            code,
            seqno,
            body,
        }
    }

    pub fn decode(frame: &V3Frame) -> Result<V3Payload, DecodeError> {
        match frame.command {
            command::PING => Ok(V3Payload::Ping),
            command::PONG => Ok(V3Payload::Pong),
            command::MESSAGE => {
                let v = parse_body("message", &frame.body)?;
                Ok(V3Payload::Message(MsgBlock::from_value(&v)?))
            }
            command::KDS_PROBEREQ => {
                let v = parse_body("probereq", &frame.body)?;
                let m = MapReader::from_value("probereq", &v)?;
                Ok(V3Payload::ProbeReq {
                    definition: m.str_req(key::REQ_DEFINITION)?,
                })
            }
            command::KDS_LISTREQ => Ok(V3Payload::ListReq),
            command::KDS_OPENREQ => {
                let v = parse_body("openreq", &frame.body)?;
                let m = MapReader::from_value("openreq", &v)?;
                Ok(V3Payload::OpenReq {
                    definition: m.str_req(key::REQ_DEFINITION)?,
                })
            }
            command::KDS_PROBEREPORT => {
                let v = parse_body("probereport", &frame.body)?;
                let m = MapReader::from_value("probereport", &v)?;
                Ok(V3Payload::ProbeReport(ProbeReport {
                    seqno: m.u64_req(key::RPT_SEQNO)? as u32,
                    msg: m.get(key::RPT_MSG).map(MsgBlock::from_value).transpose()?,
                    interface: m
                        .get(key::RPT_INTERFACE)
                        .map(InterfaceBlock::from_value)
                        .transpose()?,
                }))
            }
            command::KDS_LISTREPORT => {
                let v = parse_body("listreport", &frame.body)?;
                let m = MapReader::from_value("listreport", &v)?;
                let interfaces = match m.get(key::RPT_IFLIST) {
                    None => Vec::new(),
                    Some(Value::Array(items)) => items
                        .iter()
                        .map(InterfaceBlock::from_value)
                        .collect::<Result<Vec<_>, _>>()?,
                    Some(_) => {
                        return Err(DecodeError::WrongType {
                            context: "listreport",
                            field: key::RPT_IFLIST as u32,
                        })
                    }
                };
                Ok(V3Payload::ListReport(ListReport {
                    seqno: m.u64_req(key::RPT_SEQNO)? as u32,
                    msg: m.get(key::RPT_MSG).map(MsgBlock::from_value).transpose()?,
                    interfaces,
                }))
            }
            command::KDS_OPENREPORT => {
                let v = parse_body("openreport", &frame.body)?;
                let m = MapReader::from_value("openreport", &v)?;
                Ok(V3Payload::OpenReport(OpenReport {
                    seqno: m.u64_req(key::RPT_SEQNO)? as u32,
                    msg: m.get(key::RPT_MSG).map(MsgBlock::from_value).transpose()?,
                    uuid: m.str_or(key::RPT_UUID, "")?,
                    dlt: m.u64_or(key::RPT_DLT, 0)? as u32,
                    capiface: m.str_or(key::RPT_CAPIFACE, "")?,
                    chan_list: m.str_array_or_empty(key::RPT_CHAN_LIST)?,
                    chanhop: m
                        .get(key::RPT_CHANHOP)
                        .map(ChanHopBlock::from_value)
                        .transpose()?,
                    channel: m.str_or(key::RPT_CHANNEL, "")?,
                }))
            }
            command::KDS_CONFIGREQ => {
                let v = parse_body("configreq", &frame.body)?;
                let m = MapReader::from_value("configreq", &v)?;
                Ok(V3Payload::ConfigReq(ConfigReq {
                    channel: m.get(key::CFG_CHANNEL).and_then(|v| v.as_str()).map(String::from),
                    chanhop: m
                        .get(key::CFG_CHANHOP)
                        .map(ChanHopBlock::from_value)
                        .transpose()?,
                }))
            }
            command::KDS_CONFIGREPORT => {
                let v = parse_body("configreport", &frame.body)?;
                let m = MapReader::from_value("configreport", &v)?;
                Ok(V3Payload::ConfigReport(ConfigReport {
                    seqno: m.u64_req(key::RPT_SEQNO)? as u32,
                    msg: m.get(key::RPT_MSG).map(MsgBlock::from_value).transpose()?,
                    channel: m.str_or(key::RPT_CHANNEL, "")?,
                    chanhop: m
                        .get(key::RPT_CHANHOP)
                        .map(ChanHopBlock::from_value)
                        .transpose()?,
                }))
            }
            command::KDS_PACKET => {
                let v = parse_body("packet", &frame.body)?;
                let m = MapReader::from_value("packet", &v)?;
                Ok(V3Payload::Packet(Box::new(PacketReport {
                    gps: m.get(key::DATA_GPS).map(GpsBlock::from_value).transpose()?,
                    signal: m
                        .get(key::DATA_SIGNAL)
                        .map(SignalBlock::from_value)
                        .transpose()?,
                    packet: m
                        .get(key::DATA_PACKET)
                        .map(PacketBlock::from_value)
                        .transpose()?,
                    json: m.get(key::DATA_JSON).map(JsonBlock::from_value).transpose()?,
                })))
            }
            other => Err(DecodeError::UnknownCommand(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(payload: V3Payload, seqno: u32, code: u16) -> V3Payload {
        let frame = payload.into_frame(seqno, code);
        let mut wire = Vec::new();
        frame.encode(&mut wire);
        let decoded = V3Frame::decode(&wire).unwrap();
        assert_eq!(decoded.seqno, seqno);
        assert_eq!(decoded.code, code);
        V3Payload::decode(&decoded).unwrap()
    }

    #[test]
    fn test_header_layout() {
        let frame = V3Payload::Ping.into_frame(0x01020304, CODE_OK);
        let mut wire = Vec::new();
        frame.encode(&mut wire);
        assert_eq!(&wire[..8], &[0, 1, 0, 1, 1, 2, 3, 4]);
    }

    #[test]
    fn test_ping_pong() {
        assert_eq!(roundtrip(V3Payload::Ping, 1, CODE_OK), V3Payload::Ping);
        assert_eq!(roundtrip(V3Payload::Pong, 1, CODE_OK), V3Payload::Pong);
    }

    #[test]
    fn test_open_req_report_roundtrip() {
        let req = V3Payload::OpenReq {
            definition: "wlan0:name=test".to_string(),
        };
        assert_eq!(roundtrip(req.clone(), 7, CODE_OK), req);

        let report = V3Payload::OpenReport(OpenReport {
            seqno: 7,
            msg: Some(MsgBlock {
                msg_type: crate::blocks::msg_type::INFO,
                text: "opened".to_string(),
            }),
            uuid: "adca5b82-0002-0000-0000-aabbccddeeff".to_string(),
            dlt: 127,
            capiface: "wlan0mon".to_string(),
            chan_list: vec!["1".into(), "6".into(), "11".into()],
            chanhop: Some(ChanHopBlock {
                rate: 5.0,
                shuffle: true,
                skip: 0,
                offset: 0,
                chan_list: vec!["1".into(), "6".into(), "11".into()],
            }),
            channel: String::new(),
        });
        assert_eq!(roundtrip(report.clone(), 2, CODE_OK), report);
    }

    #[test]
    fn test_failure_code() {
        let report = V3Payload::OpenReport(OpenReport {
            seqno: 9,
            ..Default::default()
        });
        let frame = report.into_frame(3, CODE_FAILURE);
        assert!(!frame.is_success());
    }

    #[test]
    fn test_packet_datagram_roundtrip() {
        let pkt = V3Payload::Packet(Box::new(PacketReport {
            gps: Some(GpsBlock {
                lat: 44.48,
                lon: -73.21,
                fix: 3,
                ts_s: 1700000000,
                ..Default::default()
            }),
            signal: Some(SignalBlock {
                signal_dbm: -61,
                freq_khz: 2412000,
                channel: "1".to_string(),
                ..Default::default()
            }),
            packet: Some(PacketBlock {
                ts_s: 1700000000,
                ts_us: 4242,
                dlt: 127,
                length: 64,
                content: vec![0xAA; 64],
            }),
            json: None,
        }));
        assert_eq!(roundtrip(pkt.clone(), 0, CODE_OK), pkt);
    }

    #[test]
    fn test_packet_length_defaults_to_content() {
        let pkt = V3Payload::Packet(Box::new(PacketReport {
            packet: Some(PacketBlock {
                content: vec![1, 2, 3],
                length: 3,
                ..Default::default()
            }),
            ..Default::default()
        }));
        let got = roundtrip(pkt, 0, CODE_OK);
        match got {
            V3Payload::Packet(r) => assert_eq!(r.packet.unwrap().length, 3),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_unknown_keys_are_skipped() {
        // handcraft a probe report with an extra unknown key
        let mut body = Vec::new();
        map_header(&mut body, 2);
        emit_uint(&mut body, key::RPT_SEQNO, 5);
        emit_str(&mut body, 99, "future field");

        let frame = V3Frame {
            command: command::KDS_PROBEREPORT,
            code: CODE_OK,
            seqno: 1,
            body,
        };
        let decoded = V3Payload::decode(&frame).unwrap();
        assert_eq!(
            decoded,
            V3Payload::ProbeReport(ProbeReport {
                seqno: 5,
                msg: None,
                interface: None,
            })
        );
    }

    #[test]
    fn test_missing_mandatory_field_errors() {
        let mut body = Vec::new();
        map_header(&mut body, 0);
        let frame = V3Frame {
            command: command::KDS_OPENREPORT,
            code: CODE_OK,
            seqno: 1,
            body,
        };
        assert!(matches!(
            V3Payload::decode(&frame),
            Err(DecodeError::MissingField { .. })
        ));
    }

    #[test]
    fn test_malformed_msgpack_errors() {
        let frame = V3Frame {
            command: command::KDS_OPENREPORT,
            code: CODE_OK,
            seqno: 1,
            body: vec![0xC1],
        };
        assert!(matches!(
            V3Payload::decode(&frame),
            Err(DecodeError::InvalidMsgpack(_))
        ));
    }

    #[test]
    fn test_unknown_command() {
        let frame = V3Frame {
            command: 999,
            code: CODE_OK,
            seqno: 1,
            body: Vec::new(),
        };
        assert_eq!(
            V3Payload::decode(&frame),
            Err(DecodeError::UnknownCommand(999))
        );
    }
}
