// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! pcapng streaming out of the packets table.
//!
//! A parameterized SELECT filters the rows; the stream opens with a Section
//! Header Block, one Interface Description Block per distinct source UUID
//! seen by the query plus a placeholder interface 0 for rows whose source
//! is unknown, then one Enhanced Packet Block per row in timestamp order.
//!
//! Block layout is the standard `u32 type || u32 total_len || body ||
//! u32 total_len`, 32-bit aligned, native endian writer (the pcapng magic
//! tells readers which).

use std::collections::HashMap;
use std::io::Write;

use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;

use crate::LogError;

const SHB_TYPE: u32 = 0x0A0D_0D0A;
const IDB_TYPE: u32 = 0x0000_0001;
const EPB_TYPE: u32 = 0x0000_0006;
const BYTE_ORDER_MAGIC: u32 = 0x1A2B_3C4D;
const OPT_ENDOFOPT: u16 = 0;
const OPT_IF_NAME: u16 = 2;

/// Filters for the packet SELECT.  Every field is optional; unset fields
/// do not constrain the query.
#[derive(Debug, Clone, Default)]
pub struct PcapQuery {
    pub start_time: Option<u64>,
    pub end_time: Option<u64>,
    pub datasource: Option<String>,
    pub devkey_like: Option<String>,
    pub dlt: Option<u32>,
    pub min_frequency: Option<f64>,
    pub max_frequency: Option<f64>,
    pub min_signal: Option<i64>,
    pub max_signal: Option<i64>,
    pub source_like: Option<String>,
    pub dest_like: Option<String>,
    pub trans_like: Option<String>,
    pub min_lat: Option<f64>,
    pub max_lat: Option<f64>,
    pub min_lon: Option<f64>,
    pub max_lon: Option<f64>,
    pub min_size: Option<usize>,
    pub max_size: Option<usize>,
    pub tag_like: Option<String>,
    pub limit: Option<usize>,
}

impl PcapQuery {
    fn build(&self) -> (String, Vec<SqlValue>) {
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<SqlValue> = Vec::new();

        let mut push = |clause: &str, value: SqlValue, clauses: &mut Vec<String>, values: &mut Vec<SqlValue>| {
            values.push(value);
            clauses.push(clause.replace("?N", &format!("?{}", values.len())));
        };

        if let Some(v) = self.start_time {
            push("ts_sec >= ?N", SqlValue::Integer(v as i64), &mut clauses, &mut values);
        }
        if let Some(v) = self.end_time {
            push("ts_sec <= ?N", SqlValue::Integer(v as i64), &mut clauses, &mut values);
        }
        if let Some(v) = &self.datasource {
            push("datasource = ?N", SqlValue::Text(v.clone()), &mut clauses, &mut values);
        }
        if let Some(v) = &self.devkey_like {
            push("devkey LIKE ?N", SqlValue::Text(v.clone()), &mut clauses, &mut values);
        }
        if let Some(v) = self.dlt {
            push("dlt = ?N", SqlValue::Integer(v as i64), &mut clauses, &mut values);
        }
        if let Some(v) = self.min_frequency {
            push("frequency >= ?N", SqlValue::Real(v), &mut clauses, &mut values);
        }
        if let Some(v) = self.max_frequency {
            push("frequency <= ?N", SqlValue::Real(v), &mut clauses, &mut values);
        }
        if let Some(v) = self.min_signal {
            push("signal >= ?N", SqlValue::Integer(v), &mut clauses, &mut values);
        }
        if let Some(v) = self.max_signal {
            push("signal <= ?N", SqlValue::Integer(v), &mut clauses, &mut values);
        }
        if let Some(v) = &self.source_like {
            push("sourcemac LIKE ?N", SqlValue::Text(v.clone()), &mut clauses, &mut values);
        }
        if let Some(v) = &self.dest_like {
            push("destmac LIKE ?N", SqlValue::Text(v.clone()), &mut clauses, &mut values);
        }
        if let Some(v) = &self.trans_like {
            push("transmac LIKE ?N", SqlValue::Text(v.clone()), &mut clauses, &mut values);
        }
        if let Some(v) = self.min_lat {
            push("lat >= ?N", SqlValue::Real(v), &mut clauses, &mut values);
        }
        if let Some(v) = self.max_lat {
            push("lat <= ?N", SqlValue::Real(v), &mut clauses, &mut values);
        }
        if let Some(v) = self.min_lon {
            push("lon >= ?N", SqlValue::Real(v), &mut clauses, &mut values);
        }
        if let Some(v) = self.max_lon {
            push("lon <= ?N", SqlValue::Real(v), &mut clauses, &mut values);
        }
        if let Some(v) = self.min_size {
            push("packet_len >= ?N", SqlValue::Integer(v as i64), &mut clauses, &mut values);
        }
        if let Some(v) = self.max_size {
            push("packet_len <= ?N", SqlValue::Integer(v as i64), &mut clauses, &mut values);
        }
        if let Some(v) = &self.tag_like {
            push("tags LIKE ?N", SqlValue::Text(v.clone()), &mut clauses, &mut values);
        }

        let mut sql = String::from(
            "SELECT ts_sec, ts_usec, datasource, dlt, packet, packet_full_len \
             FROM packets",
        );
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY ts_sec, ts_usec");
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        (sql, values)
    }
}

fn pad4(len: usize) -> usize {
    (4 - (len % 4)) % 4
}

fn write_block(out: &mut dyn Write, block_type: u32, body: &[u8]) -> std::io::Result<()> {
    let total = 12 + body.len() + pad4(body.len());
    out.write_all(&block_type.to_le_bytes())?;
    out.write_all(&(total as u32).to_le_bytes())?;
    out.write_all(body)?;
    out.write_all(&[0u8; 3][..pad4(body.len())])?;
    out.write_all(&(total as u32).to_le_bytes())?;
    Ok(())
}

fn write_shb(out: &mut dyn Write) -> std::io::Result<()> {
    let mut body = Vec::new();
    body.extend_from_slice(&BYTE_ORDER_MAGIC.to_le_bytes());
    body.extend_from_slice(&1u16.to_le_bytes()); // major
    body.extend_from_slice(&0u16.to_le_bytes()); // minor
    body.extend_from_slice(&u64::MAX.to_le_bytes()); // section length unknown
    write_block(out, SHB_TYPE, &body)
}

fn write_idb(out: &mut dyn Write, dlt: u32, name: &str) -> std::io::Result<()> {
    let mut body = Vec::new();
    body.extend_from_slice(&(dlt as u16).to_le_bytes());
    body.extend_from_slice(&0u16.to_le_bytes()); // reserved
    body.extend_from_slice(&0u32.to_le_bytes()); // snaplen unlimited

    if !name.is_empty() {
        body.extend_from_slice(&OPT_IF_NAME.to_le_bytes());
        body.extend_from_slice(&(name.len() as u16).to_le_bytes());
        body.extend_from_slice(name.as_bytes());
        body.extend(std::iter::repeat(0u8).take(pad4(name.len())));
        body.extend_from_slice(&OPT_ENDOFOPT.to_le_bytes());
        body.extend_from_slice(&0u16.to_le_bytes());
    }

    write_block(out, IDB_TYPE, &body)
}

fn write_epb(
    out: &mut dyn Write,
    interface_id: u32,
    ts_sec: u64,
    ts_usec: u32,
    data: &[u8],
    original_len: usize,
) -> std::io::Result<()> {
    let ts = ts_sec * 1_000_000 + ts_usec as u64;

    let mut body = Vec::new();
    body.extend_from_slice(&interface_id.to_le_bytes());
    body.extend_from_slice(&((ts >> 32) as u32).to_le_bytes());
    body.extend_from_slice(&(ts as u32).to_le_bytes());
    body.extend_from_slice(&(data.len() as u32).to_le_bytes());
    body.extend_from_slice(&(original_len.max(data.len()) as u32).to_le_bytes());
    body.extend_from_slice(data);
    body.extend(std::iter::repeat(0u8).take(pad4(data.len())));

    write_block(out, EPB_TYPE, &body)
}

struct PacketRowLite {
    ts_sec: u64,
    ts_usec: u32,
    datasource: String,
    dlt: u32,
    packet: Vec<u8>,
    full_len: i64,
}

/// Run the query and stream the result.  Returns the number of packet
/// blocks written.
pub fn stream_pcapng(
    conn: &Connection,
    query: &PcapQuery,
    out: &mut dyn Write,
) -> Result<usize, LogError> {
    let (sql, values) = query.build();

    let mut stmt = conn.prepare(&sql)?;
    let rows: Vec<PacketRowLite> = stmt
        .query_map(rusqlite::params_from_iter(values.iter()), |row| {
            Ok(PacketRowLite {
                ts_sec: row.get::<_, i64>(0)? as u64,
                ts_usec: row.get::<_, i64>(1)? as u32,
                datasource: row.get(2)?,
                dlt: row.get::<_, i64>(3)? as u32,
                packet: row.get(4).unwrap_or_default(),
                full_len: row.get(5).unwrap_or_default(),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    write_shb(out)?;

    // Placeholder interface 0 absorbs rows with an unknown source uuid.
    let first_dlt = rows.first().map(|r| r.dlt).unwrap_or(1);
    write_idb(out, first_dlt, "unknown")?;

    // One interface per distinct source, ids assigned in first-seen order.
    let mut interface_ids: HashMap<String, u32> = HashMap::new();
    let mut next_id = 1u32;
    for row in &rows {
        if row.datasource.is_empty() {
            continue;
        }
        if !interface_ids.contains_key(&row.datasource) {
            interface_ids.insert(row.datasource.clone(), next_id);
            write_idb(out, row.dlt, &row.datasource)?;
            next_id += 1;
        }
    }

    let mut written = 0;
    for row in &rows {
        let interface = interface_ids.get(&row.datasource).copied().unwrap_or(0);
        write_epb(
            out,
            interface,
            row.ts_sec,
            row.ts_usec,
            &row.packet,
            row.full_len.max(0) as usize,
        )?;
        written += 1;
    }

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DatabaseLog, PacketRow};
    use radiowatch_eventbus::EventBus;
    use radiowatch_packet::filters::{ClassFilterMacAddr, PacketFilterMacAddr};
    use rwcommon::config::Config;
    use rwcommon::timer::TimerService;

    const UUID_A: &str = "6ba7b810-9dad-11d1-80b4-00c04fd430c8";
    const UUID_B: &str = "11111111-2222-3333-4444-555555555555";

    fn pkt(n: u64, uuid: &str, dlt: u32, signal: i32) -> PacketRow {
        PacketRow {
            ts_sec: 1700000000 + n,
            ts_usec: n as u32,
            datasource: uuid.to_string(),
            dlt,
            packet: vec![n as u8; 16],
            packet_len: 16,
            packet_full_len: 16,
            signal,
            packetid: n,
            ..Default::default()
        }
    }

    struct Parsed {
        block_types: Vec<u32>,
        epb_interfaces: Vec<u32>,
        epb_timestamps: Vec<u64>,
        epb_payload_lens: Vec<u32>,
    }

    /// Walk the block stream the way any pcapng reader would.
    fn parse_blocks(data: &[u8]) -> Parsed {
        let mut parsed = Parsed {
            block_types: Vec::new(),
            epb_interfaces: Vec::new(),
            epb_timestamps: Vec::new(),
            epb_payload_lens: Vec::new(),
        };

        let mut pos = 0;
        while pos + 12 <= data.len() {
            let btype = u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap());
            let blen = u32::from_le_bytes(data[pos + 4..pos + 8].try_into().unwrap()) as usize;
            assert!(blen >= 12 && pos + blen <= data.len());
            // trailing length must match
            let tail =
                u32::from_le_bytes(data[pos + blen - 4..pos + blen].try_into().unwrap()) as usize;
            assert_eq!(tail, blen);

            parsed.block_types.push(btype);
            if btype == EPB_TYPE {
                let body = &data[pos + 8..pos + blen - 4];
                parsed
                    .epb_interfaces
                    .push(u32::from_le_bytes(body[0..4].try_into().unwrap()));
                let hi = u32::from_le_bytes(body[4..8].try_into().unwrap()) as u64;
                let lo = u32::from_le_bytes(body[8..12].try_into().unwrap()) as u64;
                parsed.epb_timestamps.push((hi << 32) | lo);
                parsed
                    .epb_payload_lens
                    .push(u32::from_le_bytes(body[12..16].try_into().unwrap()));
            }
            pos += blen;
        }
        assert_eq!(pos, data.len());
        parsed
    }

    fn setup() -> (std::sync::Arc<DatabaseLog>, std::sync::Arc<TimerService>, std::sync::Arc<EventBus>, tempfile::TempDir)
    {
        let dir = tempfile::tempdir().unwrap();
        let timer = TimerService::new();
        let bus = EventBus::new();
        let log = DatabaseLog::open(
            &dir.path().join("pcap.rwdb"),
            &Config::default(),
            &timer,
            bus.clone(),
            ClassFilterMacAddr::new("d", ""),
            PacketFilterMacAddr::new("p", ""),
        )
        .unwrap();
        (log, timer, bus, dir)
    }

    #[test]
    fn test_stream_structure() {
        let (log, timer, bus, _dir) = setup();

        // three packets over two sources, inserted out of ts order
        log.log_packet(&pkt(3, UUID_B, 127, -40), false, None).unwrap();
        log.log_packet(&pkt(1, UUID_A, 127, -50), false, None).unwrap();
        log.log_packet(&pkt(2, UUID_A, 127, -60), false, None).unwrap();

        let mut out = Vec::new();
        let n = log.stream_pcapng(&PcapQuery::default(), &mut out).unwrap();
        assert_eq!(n, 3);

        let parsed = parse_blocks(&out);
        // SHB, placeholder IDB, two source IDBs, three EPBs
        assert_eq!(parsed.block_types[0], SHB_TYPE);
        assert_eq!(
            parsed.block_types.iter().filter(|&&t| t == IDB_TYPE).count(),
            3
        );
        assert_eq!(
            parsed.block_types.iter().filter(|&&t| t == EPB_TYPE).count(),
            3
        );

        // ts order regardless of insertion order
        let ts = &parsed.epb_timestamps;
        assert!(ts[0] < ts[1] && ts[1] < ts[2]);

        // rows 1 and 2 share UUID_A's interface; row 3 is UUID_B's
        assert_eq!(parsed.epb_interfaces[0], parsed.epb_interfaces[1]);
        assert_ne!(parsed.epb_interfaces[0], parsed.epb_interfaces[2]);
        assert_eq!(parsed.epb_payload_lens, vec![16, 16, 16]);

        log.close(&timer);
        timer.shutdown();
        bus.shutdown();
    }

    #[test]
    fn test_unknown_source_uses_placeholder() {
        let (log, timer, bus, _dir) = setup();

        log.log_packet(&pkt(1, "", 127, -50), false, None).unwrap();

        let mut out = Vec::new();
        log.stream_pcapng(&PcapQuery::default(), &mut out).unwrap();
        let parsed = parse_blocks(&out);
        assert_eq!(parsed.epb_interfaces, vec![0]);

        log.close(&timer);
        timer.shutdown();
        bus.shutdown();
    }

    #[test]
    fn test_query_filters() {
        let (log, timer, bus, _dir) = setup();

        log.log_packet(&pkt(1, UUID_A, 127, -80), false, None).unwrap();
        log.log_packet(&pkt(2, UUID_A, 127, -40), false, None).unwrap();
        log.log_packet(&pkt(3, UUID_B, 105, -41), false, None).unwrap();

        // signal range
        let q = PcapQuery {
            min_signal: Some(-50),
            ..Default::default()
        };
        let mut out = Vec::new();
        assert_eq!(log.stream_pcapng(&q, &mut out).unwrap(), 2);

        // datasource
        let q = PcapQuery {
            datasource: Some(UUID_B.to_string()),
            ..Default::default()
        };
        let mut out = Vec::new();
        assert_eq!(log.stream_pcapng(&q, &mut out).unwrap(), 1);

        // dlt
        let q = PcapQuery {
            dlt: Some(105),
            ..Default::default()
        };
        let mut out = Vec::new();
        assert_eq!(log.stream_pcapng(&q, &mut out).unwrap(), 1);

        // time range
        let q = PcapQuery {
            start_time: Some(1700000002),
            end_time: Some(1700000002),
            ..Default::default()
        };
        let mut out = Vec::new();
        assert_eq!(log.stream_pcapng(&q, &mut out).unwrap(), 1);

        // limit
        let q = PcapQuery {
            limit: Some(2),
            ..Default::default()
        };
        let mut out = Vec::new();
        assert_eq!(log.stream_pcapng(&q, &mut out).unwrap(), 2);

        log.close(&timer);
        timer.shutdown();
        bus.shutdown();
    }
}
