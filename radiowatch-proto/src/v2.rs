// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! v2 legacy protocol: framed protobuf `Command` envelopes.
//!
//! The envelope names its command as a string (`KDSOPENSOURCE`,
//! `KDSDATAREPORT`, ...) and carries the message as opaque bytes.  Every
//! request has a sequence number; every report replies with a
//! `success { seqno, success }` stanza and an optional `message` stanza.
//! Only the framing contract and the probe/open/list/data subset is
//! implemented; v2 exists as a compatibility fallback for old helpers.
//!
//! The codec is hand-written varint/wire-type handling.  The message set is
//! six small messages; a protobuf compiler and its build plumbing would
//! outweigh them.

use crate::DecodeError;

/// v2 command name strings.
pub mod command {
    pub const OPENSOURCE: &str = "KDSOPENSOURCE";
    pub const CONFIGURE: &str = "KDSCONFIGURE";
    pub const PROBESOURCE: &str = "KDSPROBESOURCE";
    pub const LISTINTERFACES: &str = "KDSLISTINTERFACES";
    pub const PING: &str = "PING";
    pub const PONG: &str = "PONG";

    pub const DATAREPORT: &str = "KDSDATAREPORT";
    pub const CONFIGUREREPORT: &str = "KDSCONFIGUREREPORT";
    pub const OPENSOURCEREPORT: &str = "KDSOPENSOURCEREPORT";
    pub const INTERFACESREPORT: &str = "KDSINTERFACESREPORT";
    pub const PROBESOURCEREPORT: &str = "KDSPROBESOURCEREPORT";
    pub const ERRORREPORT: &str = "KDSERRORREPORT";
    pub const WARNINGREPORT: &str = "KDSWARNINGREPORT";
}

// ---- wire primitives ------------------------------------------------------

const WIRE_VARINT: u8 = 0;
const WIRE_I64: u8 = 1;
const WIRE_LEN: u8 = 2;
const WIRE_I32: u8 = 5;

pub(crate) mod varint {
    use super::DecodeError;

    pub fn encode(mut value: u64, out: &mut Vec<u8>) {
        loop {
            let byte = (value & 0x7F) as u8;
            value >>= 7;
            if value == 0 {
                out.push(byte);
                return;
            }
            out.push(byte | 0x80);
        }
    }

    pub fn decode(buf: &[u8], pos: &mut usize) -> Result<u64, DecodeError> {
        let mut value: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = *buf
                .get(*pos)
                .ok_or(DecodeError::InvalidProtobuf("truncated varint"))?;
            *pos += 1;
            if shift >= 64 {
                return Err(DecodeError::InvalidProtobuf("varint overflow"));
            }
            value |= ((byte & 0x7F) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }
}

fn emit_tag(field: u32, wire: u8, out: &mut Vec<u8>) {
    varint::encode(((field as u64) << 3) | wire as u64, out);
}

fn emit_varint_field(field: u32, value: u64, out: &mut Vec<u8>) {
    emit_tag(field, WIRE_VARINT, out);
    varint::encode(value, out);
}

fn emit_bool_field(field: u32, value: bool, out: &mut Vec<u8>) {
    emit_varint_field(field, value as u64, out);
}

fn emit_len_field(field: u32, bytes: &[u8], out: &mut Vec<u8>) {
    emit_tag(field, WIRE_LEN, out);
    varint::encode(bytes.len() as u64, out);
    out.extend_from_slice(bytes);
}

fn emit_double_field(field: u32, value: f64, out: &mut Vec<u8>) {
    emit_tag(field, WIRE_I64, out);
    out.extend_from_slice(&value.to_le_bytes());
}

/// Iterate protobuf fields of one message body.
struct FieldWalker<'a> {
    buf: &'a [u8],
    pos: usize,
}

enum FieldValue<'a> {
    Varint(u64),
    Len(&'a [u8]),
    Fixed64([u8; 8]),
    Fixed32([u8; 4]),
}

impl<'a> FieldWalker<'a> {
    fn new(buf: &'a [u8]) -> Self {
        FieldWalker { buf, pos: 0 }
    }

    fn next(&mut self) -> Result<Option<(u32, FieldValue<'a>)>, DecodeError> {
        if self.pos >= self.buf.len() {
            return Ok(None);
        }

        let tag = varint::decode(self.buf, &mut self.pos)?;
        let field = (tag >> 3) as u32;
        let wire = (tag & 0x7) as u8;

        let value = match wire {
            WIRE_VARINT => FieldValue::Varint(varint::decode(self.buf, &mut self.pos)?),
            WIRE_LEN => {
                let len = varint::decode(self.buf, &mut self.pos)? as usize;
                let end = self
                    .pos
                    .checked_add(len)
                    .filter(|&e| e <= self.buf.len())
                    .ok_or(DecodeError::InvalidProtobuf("truncated length field"))?;
                let slice = &self.buf[self.pos..end];
                self.pos = end;
                FieldValue::Len(slice)
            }
            WIRE_I64 => {
                let end = self.pos + 8;
                if end > self.buf.len() {
                    return Err(DecodeError::InvalidProtobuf("truncated fixed64"));
                }
                let mut b = [0u8; 8];
                b.copy_from_slice(&self.buf[self.pos..end]);
                self.pos = end;
                FieldValue::Fixed64(b)
            }
            WIRE_I32 => {
                let end = self.pos + 4;
                if end > self.buf.len() {
                    return Err(DecodeError::InvalidProtobuf("truncated fixed32"));
                }
                let mut b = [0u8; 4];
                b.copy_from_slice(&self.buf[self.pos..end]);
                self.pos = end;
                FieldValue::Fixed32(b)
            }
            _ => return Err(DecodeError::InvalidProtobuf("unsupported wire type")),
        };

        Ok(Some((field, value)))
    }
}

fn len_to_string(v: FieldValue<'_>, context: &'static str) -> Result<String, DecodeError> {
    match v {
        FieldValue::Len(b) => String::from_utf8(b.to_vec())
            .map_err(|_| DecodeError::InvalidUtf8(context)),
        _ => Err(DecodeError::InvalidProtobuf("expected length field")),
    }
}

fn len_to_bytes(v: FieldValue<'_>) -> Result<Vec<u8>, DecodeError> {
    match v {
        FieldValue::Len(b) => Ok(b.to_vec()),
        _ => Err(DecodeError::InvalidProtobuf("expected length field")),
    }
}

fn to_u64(v: FieldValue<'_>) -> Result<u64, DecodeError> {
    match v {
        FieldValue::Varint(n) => Ok(n),
        _ => Err(DecodeError::InvalidProtobuf("expected varint field")),
    }
}

fn to_double(v: FieldValue<'_>) -> Result<f64, DecodeError> {
    match v {
        FieldValue::Fixed64(b) => Ok(f64::from_le_bytes(b)),
        _ => Err(DecodeError::InvalidProtobuf("expected double field")),
    }
}

// ---- messages -------------------------------------------------------------

/// `Command { 1: command, 2: content }`, the outer envelope of every v2
/// frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct V2Command {
    pub command: String,
    pub content: Vec<u8>,
}

impl V2Command {
    pub fn new(command: &str, content: Vec<u8>) -> Self {
        V2Command {
            command: command.to_string(),
            content,
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        emit_len_field(1, self.command.as_bytes(), out);
        emit_len_field(2, &self.content, out);
    }

    pub fn decode(buf: &[u8]) -> Result<V2Command, DecodeError> {
        let mut cmd = V2Command::default();
        let mut walker = FieldWalker::new(buf);
        while let Some((field, value)) = walker.next()? {
            match field {
                1 => cmd.command = len_to_string(value, "command name")?,
                2 => cmd.content = len_to_bytes(value)?,
                _ => {}
            }
        }
        if cmd.command.is_empty() {
            return Err(DecodeError::InvalidProtobuf("envelope without command"));
        }
        Ok(cmd)
    }
}

/// `success { 1: seqno, 2: success }` reply stanza.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct V2Success {
    pub seqno: u32,
    pub success: bool,
}

impl V2Success {
    fn encode(&self, out: &mut Vec<u8>) {
        emit_varint_field(1, self.seqno as u64, out);
        emit_bool_field(2, self.success, out);
    }

    fn decode(buf: &[u8]) -> Result<V2Success, DecodeError> {
        let mut s = V2Success::default();
        let mut walker = FieldWalker::new(buf);
        while let Some((field, value)) = walker.next()? {
            match field {
                1 => s.seqno = to_u64(value)? as u32,
                2 => s.success = to_u64(value)? != 0,
                _ => {}
            }
        }
        Ok(s)
    }
}

/// `message { 1: text, 2: type }` stanza.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct V2Message {
    pub text: String,
    pub msg_type: u32,
}

impl V2Message {
    fn encode(&self, out: &mut Vec<u8>) {
        emit_len_field(1, self.text.as_bytes(), out);
        emit_varint_field(2, self.msg_type as u64, out);
    }

    fn decode(buf: &[u8]) -> Result<V2Message, DecodeError> {
        let mut m = V2Message::default();
        let mut walker = FieldWalker::new(buf);
        while let Some((field, value)) = walker.next()? {
            match field {
                1 => m.text = len_to_string(value, "message text")?,
                2 => m.msg_type = to_u64(value)? as u32,
                _ => {}
            }
        }
        Ok(m)
    }
}

/// Request bodies: `{ 1: seqno, 2: definition }`.  List-interfaces carries
/// only the seqno.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct V2SourceRequest {
    pub seqno: u32,
    pub definition: String,
}

impl V2SourceRequest {
    pub fn encode(&self, out: &mut Vec<u8>) {
        emit_varint_field(1, self.seqno as u64, out);
        if !self.definition.is_empty() {
            emit_len_field(2, self.definition.as_bytes(), out);
        }
    }

    pub fn decode(buf: &[u8]) -> Result<V2SourceRequest, DecodeError> {
        let mut r = V2SourceRequest::default();
        let mut walker = FieldWalker::new(buf);
        while let Some((field, value)) = walker.next()? {
            match field {
                1 => r.seqno = to_u64(value)? as u32,
                2 => r.definition = len_to_string(value, "definition")?,
                _ => {}
            }
        }
        Ok(r)
    }
}

/// `opensourcereport { 1: success, 2: message, 3: dlt, 4: uuid,
/// 5: capture_interface, 6: channels }`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct V2OpenSourceReport {
    pub success: V2Success,
    pub message: Option<V2Message>,
    pub dlt: u32,
    pub uuid: String,
    pub capture_interface: String,
    pub channels: Vec<String>,
}

impl V2OpenSourceReport {
    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut sub = Vec::new();
        self.success.encode(&mut sub);
        emit_len_field(1, &sub, out);

        if let Some(msg) = &self.message {
            let mut sub = Vec::new();
            msg.encode(&mut sub);
            emit_len_field(2, &sub, out);
        }

        emit_varint_field(3, self.dlt as u64, out);
        emit_len_field(4, self.uuid.as_bytes(), out);
        emit_len_field(5, self.capture_interface.as_bytes(), out);
        for chan in &self.channels {
            emit_len_field(6, chan.as_bytes(), out);
        }
    }

    pub fn decode(buf: &[u8]) -> Result<V2OpenSourceReport, DecodeError> {
        let mut r = V2OpenSourceReport::default();
        let mut walker = FieldWalker::new(buf);
        while let Some((field, value)) = walker.next()? {
            match field {
                1 => r.success = V2Success::decode(&len_to_bytes(value)?)?,
                2 => r.message = Some(V2Message::decode(&len_to_bytes(value)?)?),
                3 => r.dlt = to_u64(value)? as u32,
                4 => r.uuid = len_to_string(value, "uuid")?,
                5 => r.capture_interface = len_to_string(value, "capture interface")?,
                6 => r.channels.push(len_to_string(value, "channel")?),
                _ => {}
            }
        }
        Ok(r)
    }
}

/// `probesourcereport { 1: success, 2: message, 3: channels }`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct V2ProbeSourceReport {
    pub success: V2Success,
    pub message: Option<V2Message>,
    pub channels: Vec<String>,
}

impl V2ProbeSourceReport {
    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut sub = Vec::new();
        self.success.encode(&mut sub);
        emit_len_field(1, &sub, out);

        if let Some(msg) = &self.message {
            let mut sub = Vec::new();
            msg.encode(&mut sub);
            emit_len_field(2, &sub, out);
        }
        for chan in &self.channels {
            emit_len_field(3, chan.as_bytes(), out);
        }
    }

    pub fn decode(buf: &[u8]) -> Result<V2ProbeSourceReport, DecodeError> {
        let mut r = V2ProbeSourceReport::default();
        let mut walker = FieldWalker::new(buf);
        while let Some((field, value)) = walker.next()? {
            match field {
                1 => r.success = V2Success::decode(&len_to_bytes(value)?)?,
                2 => r.message = Some(V2Message::decode(&len_to_bytes(value)?)?),
                3 => r.channels.push(len_to_string(value, "channel")?),
                _ => {}
            }
        }
        Ok(r)
    }
}

/// `interfacesreport { 1: success, 2: message, 3: interfaces }` where each
/// interface is `{ 1: interface, 2: flags, 3: hardware }`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct V2Interface {
    pub interface: String,
    pub flags: String,
    pub hardware: String,
}

impl V2Interface {
    fn encode(&self, out: &mut Vec<u8>) {
        emit_len_field(1, self.interface.as_bytes(), out);
        emit_len_field(2, self.flags.as_bytes(), out);
        emit_len_field(3, self.hardware.as_bytes(), out);
    }

    fn decode(buf: &[u8]) -> Result<V2Interface, DecodeError> {
        let mut i = V2Interface::default();
        let mut walker = FieldWalker::new(buf);
        while let Some((field, value)) = walker.next()? {
            match field {
                1 => i.interface = len_to_string(value, "interface")?,
                2 => i.flags = len_to_string(value, "flags")?,
                3 => i.hardware = len_to_string(value, "hardware")?,
                _ => {}
            }
        }
        Ok(i)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct V2InterfacesReport {
    pub success: V2Success,
    pub message: Option<V2Message>,
    pub interfaces: Vec<V2Interface>,
}

impl V2InterfacesReport {
    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut sub = Vec::new();
        self.success.encode(&mut sub);
        emit_len_field(1, &sub, out);

        if let Some(msg) = &self.message {
            let mut sub = Vec::new();
            msg.encode(&mut sub);
            emit_len_field(2, &sub, out);
        }
        for iface in &self.interfaces {
            let mut sub = Vec::new();
            iface.encode(&mut sub);
            emit_len_field(3, &sub, out);
        }
    }

    pub fn decode(buf: &[u8]) -> Result<V2InterfacesReport, DecodeError> {
        let mut r = V2InterfacesReport::default();
        let mut walker = FieldWalker::new(buf);
        while let Some((field, value)) = walker.next()? {
            match field {
                1 => r.success = V2Success::decode(&len_to_bytes(value)?)?,
                2 => r.message = Some(V2Message::decode(&len_to_bytes(value)?)?),
                3 => r.interfaces.push(V2Interface::decode(&len_to_bytes(value)?)?),
                _ => {}
            }
        }
        Ok(r)
    }
}

/// `datareport { 1: packet, 2: signal, 3: gps }` with
/// `packet { 1: ts_s, 2: ts_us, 3: dlt, 4: size, 5: data }`,
/// `signal { 1: signal_dbm, 2: noise_dbm, 3: freq_khz, 4: channel }`, and
/// `gps { 1: lat, 2: lon, 3: alt, 4: fix, 5: ts_s }`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct V2PacketData {
    pub ts_s: u64,
    pub ts_us: u32,
    pub dlt: u32,
    pub size: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct V2SignalData {
    pub signal_dbm: i32,
    pub noise_dbm: i32,
    pub freq_khz: u64,
    pub channel: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct V2GpsData {
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
    pub fix: u32,
    pub ts_s: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct V2DataReport {
    pub packet: Option<V2PacketData>,
    pub signal: Option<V2SignalData>,
    pub gps: Option<V2GpsData>,
}

impl V2DataReport {
    pub fn encode(&self, out: &mut Vec<u8>) {
        if let Some(p) = &self.packet {
            let mut sub = Vec::new();
            emit_varint_field(1, p.ts_s, &mut sub);
            emit_varint_field(2, p.ts_us as u64, &mut sub);
            emit_varint_field(3, p.dlt as u64, &mut sub);
            emit_varint_field(4, p.size as u64, &mut sub);
            emit_len_field(5, &p.data, &mut sub);
            emit_len_field(1, &sub, out);
        }
        if let Some(s) = &self.signal {
            let mut sub = Vec::new();
            emit_varint_field(1, s.signal_dbm as i64 as u64, &mut sub);
            emit_varint_field(2, s.noise_dbm as i64 as u64, &mut sub);
            emit_varint_field(3, s.freq_khz, &mut sub);
            emit_len_field(4, s.channel.as_bytes(), &mut sub);
            emit_len_field(2, &sub, out);
        }
        if let Some(g) = &self.gps {
            let mut sub = Vec::new();
            emit_double_field(1, g.lat, &mut sub);
            emit_double_field(2, g.lon, &mut sub);
            emit_double_field(3, g.alt, &mut sub);
            emit_varint_field(4, g.fix as u64, &mut sub);
            emit_varint_field(5, g.ts_s, &mut sub);
            emit_len_field(3, &sub, out);
        }
    }

    pub fn decode(buf: &[u8]) -> Result<V2DataReport, DecodeError> {
        let mut r = V2DataReport::default();
        let mut walker = FieldWalker::new(buf);
        while let Some((field, value)) = walker.next()? {
            match field {
                1 => {
                    let sub = len_to_bytes(value)?;
                    let mut p = V2PacketData::default();
                    let mut w = FieldWalker::new(&sub);
                    while let Some((f, v)) = w.next()? {
                        match f {
                            1 => p.ts_s = to_u64(v)?,
                            2 => p.ts_us = to_u64(v)? as u32,
                            3 => p.dlt = to_u64(v)? as u32,
                            4 => p.size = to_u64(v)? as u32,
                            5 => p.data = len_to_bytes(v)?,
                            _ => {}
                        }
                    }
                    r.packet = Some(p);
                }
                2 => {
                    let sub = len_to_bytes(value)?;
                    let mut s = V2SignalData::default();
                    let mut w = FieldWalker::new(&sub);
                    while let Some((f, v)) = w.next()? {
                        match f {
                            1 => s.signal_dbm = to_u64(v)? as i64 as i32,
                            2 => s.noise_dbm = to_u64(v)? as i64 as i32,
                            3 => s.freq_khz = to_u64(v)?,
                            4 => s.channel = len_to_string(v, "channel")?,
                            _ => {}
                        }
                    }
                    r.signal = Some(s);
                }
                3 => {
                    let sub = len_to_bytes(value)?;
                    let mut g = V2GpsData::default();
                    let mut w = FieldWalker::new(&sub);
                    while let Some((f, v)) = w.next()? {
                        match f {
                            1 => g.lat = to_double(v)?,
                            2 => g.lon = to_double(v)?,
                            3 => g.alt = to_double(v)?,
                            4 => g.fix = to_u64(v)? as u32,
                            5 => g.ts_s = to_u64(v)?,
                            _ => {}
                        }
                    }
                    r.gps = Some(g);
                }
                _ => {}
            }
        }
        Ok(r)
    }
}

/// `errorreport { 1: success, 2: message }`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct V2ErrorReport {
    pub success: V2Success,
    pub message: Option<V2Message>,
}

impl V2ErrorReport {
    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut sub = Vec::new();
        self.success.encode(&mut sub);
        emit_len_field(1, &sub, out);
        if let Some(msg) = &self.message {
            let mut sub = Vec::new();
            msg.encode(&mut sub);
            emit_len_field(2, &sub, out);
        }
    }

    pub fn decode(buf: &[u8]) -> Result<V2ErrorReport, DecodeError> {
        let mut r = V2ErrorReport::default();
        let mut walker = FieldWalker::new(buf);
        while let Some((field, value)) = walker.next()? {
            match field {
                1 => r.success = V2Success::decode(&len_to_bytes(value)?)?,
                2 => r.message = Some(V2Message::decode(&len_to_bytes(value)?)?),
                _ => {}
            }
        }
        Ok(r)
    }
}

/// `warningreport { 1: warning }`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct V2WarningReport {
    pub warning: String,
}

impl V2WarningReport {
    pub fn encode(&self, out: &mut Vec<u8>) {
        emit_len_field(1, self.warning.as_bytes(), out);
    }

    pub fn decode(buf: &[u8]) -> Result<V2WarningReport, DecodeError> {
        let mut r = V2WarningReport::default();
        let mut walker = FieldWalker::new(buf);
        while let Some((field, value)) = walker.next()? {
            if field == 1 {
                r.warning = len_to_string(value, "warning")?;
            }
        }
        Ok(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_roundtrip() {
        for v in [0u64, 1, 127, 128, 300, 16383, 16384, u64::MAX] {
            let mut buf = Vec::new();
            varint::encode(v, &mut buf);
            let mut pos = 0;
            assert_eq!(varint::decode(&buf, &mut pos).unwrap(), v);
            assert_eq!(pos, buf.len());
        }
    }

    #[test]
    fn test_varint_truncated() {
        let mut pos = 0;
        assert!(varint::decode(&[0x80], &mut pos).is_err());
    }

    #[test]
    fn test_envelope_starts_with_0x0a() {
        let cmd = V2Command::new(command::PING, Vec::new());
        let mut wire = Vec::new();
        cmd.encode(&mut wire);
        assert_eq!(wire[0], 0x0A);
        assert_eq!(V2Command::decode(&wire).unwrap(), cmd);
    }

    #[test]
    fn test_envelope_without_command_rejected() {
        let mut wire = Vec::new();
        emit_len_field(2, b"payload", &mut wire);
        assert!(V2Command::decode(&wire).is_err());
    }

    #[test]
    fn test_open_report_roundtrip() {
        let report = V2OpenSourceReport {
            success: V2Success {
                seqno: 31,
                success: true,
            },
            message: Some(V2Message {
                text: "ok".to_string(),
                msg_type: 2,
            }),
            dlt: 127,
            uuid: "adca5b82-0000-0000-0000-000000000001".to_string(),
            capture_interface: "wlan0mon".to_string(),
            channels: vec!["1".into(), "6".into(), "11".into()],
        };

        let mut wire = Vec::new();
        report.encode(&mut wire);
        assert_eq!(V2OpenSourceReport::decode(&wire).unwrap(), report);
    }

    #[test]
    fn test_interfaces_report_roundtrip() {
        let report = V2InterfacesReport {
            success: V2Success {
                seqno: 4,
                success: true,
            },
            message: None,
            interfaces: vec![
                V2Interface {
                    interface: "wlan0".into(),
                    flags: "".into(),
                    hardware: "iwlwifi".into(),
                },
                V2Interface {
                    interface: "wlan1".into(),
                    flags: "".into(),
                    hardware: "ath9k".into(),
                },
            ],
        };

        let mut wire = Vec::new();
        report.encode(&mut wire);
        assert_eq!(V2InterfacesReport::decode(&wire).unwrap(), report);
    }

    #[test]
    fn test_data_report_roundtrip() {
        let report = V2DataReport {
            packet: Some(V2PacketData {
                ts_s: 1700000000,
                ts_us: 123,
                dlt: 127,
                size: 4,
                data: vec![1, 2, 3, 4],
            }),
            signal: Some(V2SignalData {
                signal_dbm: -55,
                noise_dbm: -92,
                freq_khz: 2437000,
                channel: "6".into(),
            }),
            gps: Some(V2GpsData {
                lat: 44.5,
                lon: -73.2,
                alt: 120.0,
                fix: 3,
                ts_s: 1700000000,
            }),
        };

        let mut wire = Vec::new();
        report.encode(&mut wire);
        assert_eq!(V2DataReport::decode(&wire).unwrap(), report);
    }

    #[test]
    fn test_unknown_fields_skipped() {
        let mut wire = Vec::new();
        let mut sub = Vec::new();
        V2Success {
            seqno: 2,
            success: true,
        }
        .encode(&mut sub);
        emit_len_field(1, &sub, &mut wire);
        emit_varint_field(15, 99, &mut wire);

        let report = V2ErrorReport::decode(&wire).unwrap();
        assert_eq!(report.success.seqno, 2);
        assert!(report.success.success);
    }
}
