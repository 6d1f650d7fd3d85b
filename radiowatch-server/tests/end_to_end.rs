// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Full-pipeline tests: packets in through the chain, devices tracked,
//! rows logged, pcapng back out.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rwcommon::config::Config;
use rwcommon::MacAddr;

use radiowatch_eventbus::channels;
use radiowatch_logdb::pcapng::PcapQuery;
use radiowatch_packet::packet::{CommonInfo, DatasourceInfo, LinkFrame, Packet, SignalInfo};
use radiowatch_packet::ChainStage;
use radiowatch_server::Context;

fn test_config() -> Config {
    let mut config = Config::default();
    config.server_uuid = "11111111-1111-1111-1111-111111111111".parse().unwrap();
    config.packet_threads = 1;
    config
}

fn inject_frame(
    ctx: &Context,
    data: &[u8],
    mac: &str,
    phy_id: u32,
    source_uuid: uuid::Uuid,
    ts: u64,
    assignment: u32,
) {
    let core = ctx.chain.core_components();
    let mut pkt = Packet::new();
    pkt.ts_sec = ts;
    pkt.ts_usec = (ts % 1000) as u32;
    pkt.original_len = data.len();
    pkt.assignment_id = assignment;
    pkt.insert(
        core.linkframe,
        Arc::new(LinkFrame {
            dlt: 127,
            data: data.to_vec(),
        }),
    );
    pkt.insert(
        core.common,
        Arc::new(CommonInfo {
            source: mac.parse().unwrap(),
            phy_id,
            freq_khz: 2412000,
            channel: "1".to_string(),
            packet_type: "management".to_string(),
            ..Default::default()
        }),
    );
    pkt.insert(
        core.radiodata,
        Arc::new(SignalInfo {
            signal_dbm: -55,
            freq_khz: 2412000,
            ..Default::default()
        }),
    );
    pkt.insert(
        core.datasrc,
        Arc::new(DatasourceInfo {
            uuid: source_uuid,
            name: "testsource".to_string(),
            definition: "test0".to_string(),
        }),
    );
    ctx.chain.process_packet(pkt.into_ref());
}

#[test]
fn test_dedup_and_worker_routing() {
    let ctx = Context::build(test_config()).unwrap();
    let phy = ctx.devices.register_phy("IEEE802.11");
    let uuid = uuid::Uuid::new_v4();

    let seen: Arc<Mutex<Vec<(u64, bool, std::thread::ThreadId)>>> =
        Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    ctx.chain.register_handler(ChainStage::Tracker, 50, move |pkt| {
        s.lock()
            .unwrap()
            .push((pkt.packet_no, pkt.duplicate, std::thread::current().id()));
    });

    inject_frame(&ctx, b"identical-frame", "aa:bb:cc:dd:ee:ff", phy, uuid, 1000, 9);
    inject_frame(&ctx, b"identical-frame", "aa:bb:cc:dd:ee:ff", phy, uuid, 1000, 9);

    ctx.chain.shutdown();

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 2, "both packets reach the tracker stage");
    let (no_a, dup_a, tid_a) = seen[0];
    let (no_b, dup_b, tid_b) = seen[1];
    assert!(!dup_a);
    assert!(dup_b);
    assert_eq!(no_a, no_b);
    assert_eq!(tid_a, tid_b);

    // both sightings landed on the same device
    assert_eq!(ctx.devices.device_count(), 1);
    ctx.shutdown();
}

#[test]
fn test_device_key_stability_and_tracking() {
    let ctx = Context::build(test_config()).unwrap();
    let phy = ctx.devices.register_phy("IEEE802.11");
    let uuid = uuid::Uuid::new_v4();

    inject_frame(&ctx, b"frame-a", "aa:bb:cc:dd:ee:ff", phy, uuid, 1000, 3);
    inject_frame(&ctx, b"frame-b", "aa:bb:cc:dd:ee:ff", phy, uuid, 1001, 3);
    ctx.chain.shutdown();

    let mac: MacAddr = "aa:bb:cc:dd:ee:ff".parse().unwrap();
    let key = ctx.devices.device_key("IEEE802.11", &mac);

    // the string form parses back to the identical key
    let reparsed: rwcommon::DeviceKey = key.to_string().parse().unwrap();
    assert_eq!(reparsed, key);

    let device = ctx.devices.device_by_key(&key).expect("device tracked");
    let guard = device.lock().unwrap();
    assert_eq!(guard.packets_total, 2);
    assert_eq!(guard.best_signal_dbm, -55);
    drop(guard);

    // same inputs on a fresh context (same server uuid) give the same key
    let ctx2 = Context::build(test_config()).unwrap();
    assert_eq!(ctx2.devices.device_key("IEEE802.11", &mac), key);
    ctx2.shutdown();
    ctx.shutdown();
}

#[test]
fn test_log_pipeline_and_pcapng_export() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = Context::build(test_config()).unwrap();
    let phy = ctx.devices.register_phy("IEEE802.11");

    let log = ctx.open_log(&dir.path().join("run.rwdb")).unwrap();
    ctx.bus.flush();

    let uuid_a = uuid::Uuid::new_v4();
    let uuid_b = uuid::Uuid::new_v4();

    inject_frame(&ctx, b"frame-one", "aa:bb:cc:00:00:01", phy, uuid_a, 1000, 1);
    inject_frame(&ctx, b"frame-two", "aa:bb:cc:00:00:02", phy, uuid_a, 1001, 1);
    inject_frame(&ctx, b"frame-three", "aa:bb:cc:00:00:03", phy, uuid_b, 1002, 2);
    ctx.chain.shutdown();

    assert_eq!(log.count_rows("packets").unwrap(), 3);

    // the one-shot SYSTEM snapshot arrived with the log-open event
    assert_eq!(log.count_rows("snapshots").unwrap(), 1);

    // device snapshots on demand
    ctx.log_devices();
    assert_eq!(log.count_rows("devices").unwrap(), 3);

    // pcapng export: SHB + placeholder IDB + one IDB per source + 3 EPBs
    let mut out = Vec::new();
    let written = log.stream_pcapng(&PcapQuery::default(), &mut out).unwrap();
    assert_eq!(written, 3);
    assert_eq!(&out[0..4], &0x0A0D_0D0Au32.to_le_bytes());

    let mut idb_count = 0;
    let mut epb_count = 0;
    let mut pos = 0;
    while pos + 12 <= out.len() {
        let btype = u32::from_le_bytes(out[pos..pos + 4].try_into().unwrap());
        let blen = u32::from_le_bytes(out[pos + 4..pos + 8].try_into().unwrap()) as usize;
        match btype {
            1 => idb_count += 1,
            6 => epb_count += 1,
            _ => {}
        }
        pos += blen;
    }
    assert_eq!(idb_count, 3);
    assert_eq!(epb_count, 3);

    ctx.shutdown();
}

#[test]
fn test_alert_pipeline_to_log() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = Context::build(test_config()).unwrap();
    ctx.devices.register_phy("IEEE802.11");
    let log = ctx.open_log(&dir.path().join("alerts.rwdb")).unwrap();

    let delivered = Arc::new(AtomicUsize::new(0));
    let d = delivered.clone();
    ctx.bus.register_listener(&[channels::NEW_ALERT], move |_| {
        d.fetch_add(1, Ordering::SeqCst);
    });

    let r = ctx
        .alerts
        .register_alert(
            "TESTALERT",
            "SYSTEM",
            radiowatch_alerts::Severity::Medium,
            "test alert",
            rwcommon::config::RateUnit::Minute,
            5,
            rwcommon::config::RateUnit::Second,
            2,
            radiowatch_alerts::PHY_ANY,
        )
        .unwrap();

    // ten raises in the same second: the 2/sec burst gates delivery
    let mut raised = 0;
    for _ in 0..10 {
        let outcome = ctx
            .alerts
            .raise_alert_at(
                r,
                None,
                MacAddr::ZERO,
                MacAddr::ZERO,
                MacAddr::ZERO,
                MacAddr::ZERO,
                "6",
                "suspicious frame".to_string(),
                5000,
                0,
            )
            .unwrap();
        if outcome.raised() {
            raised += 1;
        }
    }
    assert_eq!(raised, 2);

    ctx.bus.flush();
    assert_eq!(delivered.load(Ordering::SeqCst), 2);
    assert_eq!(log.count_rows("alerts").unwrap(), 2);
    assert_eq!(ctx.alerts.backlog().len(), 2);

    ctx.shutdown();
}

#[test]
fn test_packet_filter_blocks_logging() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = Context::build(test_config()).unwrap();
    let phy = ctx.devices.register_phy("IEEE802.11");
    ctx.bus.flush();

    let log = ctx.open_log(&dir.path().join("filtered.rwdb")).unwrap();

    // block one source mac through the REST-shaped payload
    let payload = serde_json::json!({"filter": {"aa:bb:cc:00:00:01": true}});
    ctx.device_filter
        .set_filter_json("IEEE802.11", &payload)
        .unwrap();

    let uuid = uuid::Uuid::new_v4();
    inject_frame(&ctx, b"blocked", "aa:bb:cc:00:00:01", phy, uuid, 1000, 1);
    inject_frame(&ctx, b"allowed", "aa:bb:cc:00:00:02", phy, uuid, 1001, 1);
    ctx.chain.shutdown();

    assert_eq!(log.count_rows("packets").unwrap(), 1);
    // the blocked mac also never became a device
    assert_eq!(ctx.devices.device_count(), 1);

    ctx.shutdown();
}

#[test]
fn test_datasource_rows_logged() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = Context::build(test_config()).unwrap();
    let log = ctx.open_log(&dir.path().join("sources.rwdb")).unwrap();

    ctx.datasources
        .register_builder(radiowatch_capture::SourceBuilder {
            source_type: "virtual".to_string(),
            binary: None,
            passive: true,
            interface_prefixes: vec!["virt".to_string()],
        });

    let (tx, rx) = std::sync::mpsc::channel();
    ctx.datasources
        .open_source(
            "virt0:name=logged",
            Box::new(move |ok, _| {
                let _ = tx.send(ok);
            }),
        )
        .unwrap();
    assert!(rx.recv().unwrap());

    ctx.log_datasources();
    assert_eq!(log.count_rows("datasources").unwrap(), 1);

    ctx.shutdown();
}
