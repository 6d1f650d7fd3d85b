// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! One datasource: the server side of a single capture helper.
//!
//! State machine: `idle → probing|listing|opening → running → erroring →
//! (retry|closed)`.  Probing and listing are transient paths that launch a
//! helper only for the query and tear it down quietly afterwards.
//!
//! Session flow: on connect we send a version probe ping; the pong releases
//! whichever request was queued (probe, list, or open).  Pings repeat every
//! five seconds; a pong older than fifteen declares the helper dead.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rwcommon::config::SourceDefinition;
use rwcommon::MutexExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use radiowatch_eventbus::{channels as bus_channels, Event, EventBus};
use radiowatch_model::location::LocationFull;
use radiowatch_model::rrd::MinuteRrd;
use radiowatch_packet::chain::CoreComponents;
use radiowatch_packet::packet::{
    DatasourceInfo, GpsInfo, JsonInfo, LinkFrame, NoGps, Packet, SignalInfo,
};
use radiowatch_packet::PacketChain;
use radiowatch_proto::blocks::{msg_type, ChanHopBlock, GpsBlock, InterfaceBlock};
use radiowatch_proto::frame::{FrameCodec, WireFrame};
use radiowatch_proto::v2::{self, V2Command, V2DataReport, V2OpenSourceReport, V2ProbeSourceReport};
use radiowatch_proto::v3::{ConfigReq, OpenReport, PacketReport, ProbeReport, V3Payload, CODE_OK};

use crate::channels::merge_channels;
use crate::command::{CommandCallback, CommandKind, CommandMap};

const PING_INTERVAL: Duration = Duration::from_secs(5);
const PONG_DEADLINE: Duration = Duration::from_secs(15);
const RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Idle,
    Probing,
    Listing,
    Opening,
    Running,
    Erroring,
    Retrying,
    Closed,
}

/// Resolved per-source options: the parsed definition plus the builder's
/// capabilities.
#[derive(Debug, Clone)]
pub struct SourceOptions {
    pub definition: SourceDefinition,
    pub name: String,
    pub interface: String,
    pub source_type: String,
    pub binary: Option<PathBuf>,
    pub passive: bool,
    pub remote: bool,
    pub retry: bool,
    pub clobber_timestamp: bool,
    pub suppress_gps: bool,
    pub dlt_override: Option<u32>,
    /// Pins all of this source's packets to one worker.
    pub assignment_id: u32,
}

impl SourceOptions {
    pub fn from_definition(
        definition: SourceDefinition,
        source_type: &str,
        binary: Option<PathBuf>,
        passive: bool,
        assignment_id: u32,
    ) -> Self {
        let name = definition
            .opt("name")
            .map(|s| s.to_string())
            .unwrap_or_else(|| definition.interface.clone());
        let interface = definition.interface.clone();
        let retry = definition.opt_bool("retry", true);
        let clobber_timestamp = definition.opt_bool("timestamp", false);
        let suppress_gps = definition.opt_bool("suppressgps", false);
        let dlt_override = definition.opt("dlt").and_then(|v| v.parse().ok());

        SourceOptions {
            definition,
            name,
            interface,
            source_type: source_type.to_string(),
            binary,
            passive,
            remote: false,
            retry,
            clobber_timestamp,
            suppress_gps,
            dlt_override,
            assignment_id,
        }
    }
}

/// Event payload for the datasource channels.
#[derive(Debug, Clone)]
pub struct DatasourceEvent {
    pub uuid: Uuid,
    pub name: String,
    pub definition: String,
    pub reason: String,
}

enum PendingAction {
    Probe(CommandCallback),
    List(CommandCallback),
    Open(CommandCallback),
}

struct Shared {
    state: SourceState,
    uuid: Uuid,
    dlt: u32,
    cap_interface: String,
    locked_channel: String,
    channels: Vec<String>,
    hop_channels: Vec<String>,
    hop_rate: f32,
    hop_shuffle: bool,
    error_reason: Option<String>,
    interfaces: Vec<InterfaceBlock>,
    pending: Option<PendingAction>,
    writer: Option<mpsc::UnboundedSender<WireFrame>>,
    child: Option<tokio::process::Child>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

struct SourceInner {
    opts: SourceOptions,
    bus: Arc<EventBus>,
    chain: PacketChain,
    core: CoreComponents,
    commands: CommandMap,
    runtime: tokio::runtime::Handle,
    shared: Mutex<Shared>,
    last_pong: Mutex<tokio::time::Instant>,
    paused: AtomicBool,
    cancelled: AtomicBool,
    /// Transient probe/list sessions suppress teardown error reporting.
    transient: AtomicBool,
    num_packets: AtomicU64,
    num_errors: AtomicU64,
    packet_size_rrd: Mutex<MinuteRrd>,
    device_gps: Mutex<Option<Arc<dyn Fn() -> Option<LocationFull> + Send + Sync>>>,
}

#[derive(Clone)]
pub struct Datasource {
    inner: Arc<SourceInner>,
}

impl Datasource {
    pub fn new(
        opts: SourceOptions,
        bus: Arc<EventBus>,
        chain: PacketChain,
        runtime: tokio::runtime::Handle,
    ) -> Self {
        let uuid = opts
            .definition
            .opt("uuid")
            .and_then(|u| u.parse().ok())
            .unwrap_or(Uuid::nil());
        let core = chain.core_components();

        Datasource {
            inner: Arc::new(SourceInner {
                opts,
                bus,
                chain,
                core,
                commands: CommandMap::new(),
                runtime,
                shared: Mutex::new(Shared {
                    state: SourceState::Idle,
                    uuid,
                    dlt: 0,
                    cap_interface: String::new(),
                    locked_channel: String::new(),
                    channels: Vec::new(),
                    hop_channels: Vec::new(),
                    hop_rate: 0.0,
                    hop_shuffle: false,
                    error_reason: None,
                    interfaces: Vec::new(),
                    pending: None,
                    writer: None,
                    child: None,
                    tasks: Vec::new(),
                }),
                last_pong: Mutex::new(tokio::time::Instant::now()),
                paused: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
                transient: AtomicBool::new(false),
                num_packets: AtomicU64::new(0),
                num_errors: AtomicU64::new(0),
                packet_size_rrd: Mutex::new(MinuteRrd::new()),
                device_gps: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.opts.name
    }

    pub fn definition(&self) -> &SourceDefinition {
        &self.inner.opts.definition
    }

    pub fn source_type(&self) -> &str {
        &self.inner.opts.source_type
    }

    pub fn state(&self) -> SourceState {
        self.inner.shared.lock_or_panic().state
    }

    pub fn uuid(&self) -> Uuid {
        self.inner.shared.lock_or_panic().uuid
    }

    pub fn error_reason(&self) -> Option<String> {
        self.inner.shared.lock_or_panic().error_reason.clone()
    }

    pub fn channels(&self) -> Vec<String> {
        self.inner.shared.lock_or_panic().channels.clone()
    }

    pub fn hop_channels(&self) -> Vec<String> {
        self.inner.shared.lock_or_panic().hop_channels.clone()
    }

    pub fn hopping(&self) -> bool {
        !self.inner.shared.lock_or_panic().hop_channels.is_empty()
    }

    pub fn interfaces(&self) -> Vec<InterfaceBlock> {
        self.inner.shared.lock_or_panic().interfaces.clone()
    }

    pub fn remote(&self) -> bool {
        self.inner.opts.remote
    }

    pub fn paused(&self) -> bool {
        self.inner.paused.load(Ordering::Relaxed)
    }

    pub fn packet_count(&self) -> u64 {
        self.inner.num_packets.load(Ordering::Relaxed)
    }

    /// Install the server-level location fallback used when a source has no
    /// GPS of its own.
    pub fn set_device_gps<F>(&self, f: F)
    where
        F: Fn() -> Option<LocationFull> + Send + Sync + 'static,
    {
        *self.inner.device_gps.lock_or_panic() = Some(Arc::new(f));
    }

    fn set_state(&self, state: SourceState) {
        self.inner.shared.lock_or_panic().state = state;
    }

    fn event_payload(&self, reason: &str) -> DatasourceEvent {
        let shared = self.inner.shared.lock_or_panic();
        DatasourceEvent {
            uuid: shared.uuid,
            name: self.inner.opts.name.clone(),
            definition: self.inner.opts.definition.raw.clone(),
            reason: reason.to_string(),
        }
    }

    /// Pause: data reports are dropped silently; pings continue.
    pub fn set_paused(&self, paused: bool) {
        self.inner.paused.store(paused, Ordering::Relaxed);
        let channel = if paused {
            bus_channels::DATASOURCE_PAUSED
        } else {
            bus_channels::DATASOURCE_RESUMED
        };
        self.inner
            .bus
            .publish(Event::new(channel, self.event_payload("")));
    }

    // ---- open / probe / list ---------------------------------------------

    /// Open the source.  Passive sources go straight to running; everything
    /// else launches the helper and negotiates.
    pub fn open(&self, callback: CommandCallback) {
        if self.inner.opts.passive {
            {
                let mut shared = self.inner.shared.lock_or_panic();
                if shared.uuid.is_nil() {
                    shared.uuid = Uuid::new_v4();
                }
                shared.state = SourceState::Running;
            }
            info!(source = %self.name(), "passive source running");
            self.inner.bus.publish(Event::new(
                bus_channels::DATASOURCE_OPENED,
                self.event_payload(""),
            ));
            callback(true, "passive source opened");
            return;
        }

        self.set_state(SourceState::Opening);
        self.inner.shared.lock_or_panic().pending = Some(PendingAction::Open(callback));
        self.launch_helper();
    }

    /// Probe whether the helper can drive this definition.  Transient: the
    /// helper is torn down after the report.
    pub fn probe(&self, callback: CommandCallback) {
        self.inner.transient.store(true, Ordering::Relaxed);
        self.set_state(SourceState::Probing);
        self.inner.shared.lock_or_panic().pending = Some(PendingAction::Probe(callback));
        self.launch_helper();
    }

    /// List capturable interfaces.  Transient like probe; results land in
    /// [`Self::interfaces`].
    pub fn list_interfaces(&self, callback: CommandCallback) {
        self.inner.transient.store(true, Ordering::Relaxed);
        self.set_state(SourceState::Listing);
        self.inner.shared.lock_or_panic().pending = Some(PendingAction::List(callback));
        self.launch_helper();
    }

    fn launch_helper(&self) {
        let Some(binary) = self.inner.opts.binary.clone() else {
            self.fail_pending("no capture helper binary for source type");
            return;
        };

        if !binary.exists() {
            self.fail_pending(&format!(
                "capture helper {} not found",
                binary.to_string_lossy()
            ));
            return;
        }

        let mut command = tokio::process::Command::new(&binary);
        command
            .arg("--source")
            .arg(&self.inner.opts.definition.raw)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);

        let this = self.clone();
        self.inner.runtime.spawn(async move {
            match command.spawn() {
                Ok(mut child) => {
                    let stdout = child.stdout.take();
                    let stdin = child.stdin.take();
                    match (stdout, stdin) {
                        (Some(stdout), Some(stdin)) => {
                            this.inner.shared.lock_or_panic().child = Some(child);
                            this.start_io(stdout, stdin);
                        }
                        _ => this.trigger_error("helper spawned without pipes"),
                    }
                }
                Err(e) => this.trigger_error(&format!("failed to launch capture helper: {e}")),
            }
        });
    }

    fn fail_pending(&self, reason: &str) {
        warn!(source = %self.name(), "{reason}");
        let pending = self.inner.shared.lock_or_panic().pending.take();
        if let Some(action) = pending {
            let cb = match action {
                PendingAction::Probe(cb) | PendingAction::List(cb) | PendingAction::Open(cb) => cb,
            };
            cb(false, reason);
        }
        self.trigger_error(reason);
    }

    /// Attach the session to an already-connected byte stream.  Used for
    /// remote sources and by tests; local helpers route their pipes here
    /// too.
    pub fn start_io<R, W>(&self, read: R, write: W)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<WireFrame>();
        {
            let mut shared = self.inner.shared.lock_or_panic();
            shared.writer = Some(tx);
        }
        *self.inner.last_pong.lock_or_panic() = tokio::time::Instant::now();

        // Single writer per socket.
        let writer_task = self.inner.runtime.spawn(async move {
            let mut framed = FramedWrite::new(write, FrameCodec::new());
            while let Some(frame) = rx.recv().await {
                if let Err(e) = framed.send(frame).await {
                    debug!("datasource write failed: {e}");
                    break;
                }
            }
        });

        let this = self.clone();
        let reader_task = self.inner.runtime.spawn(async move {
            let mut framed = FramedRead::new(read, FrameCodec::new());
            loop {
                match framed.next().await {
                    Some(Ok(frame)) => this.handle_frame(frame),
                    Some(Err(e)) => {
                        this.trigger_error(&format!("protocol error: {e}"));
                        return;
                    }
                    None => {
                        this.trigger_error("helper closed connection");
                        return;
                    }
                }
            }
        });

        let this = self.clone();
        let ping_task = self.inner.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(PING_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if this.inner.cancelled.load(Ordering::Relaxed) {
                    return;
                }
                let last = *this.inner.last_pong.lock_or_panic();
                if last.elapsed() > PONG_DEADLINE {
                    this.trigger_error("did not get a ping response from the capture helper");
                    return;
                }
                this.send_frame(WireFrame::V3(V3Payload::Ping.into_frame(0, CODE_OK)));
            }
        });

        let mut shared = self.inner.shared.lock_or_panic();
        shared.tasks.push(writer_task);
        shared.tasks.push(reader_task);
        shared.tasks.push(ping_task);
        drop(shared);

        // Version probe; the pong releases the queued request.
        self.send_frame(WireFrame::V3(V3Payload::Ping.into_frame(0, CODE_OK)));
    }

    fn send_frame(&self, frame: WireFrame) {
        let shared = self.inner.shared.lock_or_panic();
        if let Some(writer) = &shared.writer {
            if writer.send(frame).is_err() {
                debug!(source = %self.inner.opts.name, "writer task gone");
            }
        }
    }

    // ---- frame handling ---------------------------------------------------

    fn handle_frame(&self, frame: WireFrame) {
        match frame {
            WireFrame::V3(frame) => {
                let success = frame.is_success();
                match V3Payload::decode(&frame) {
                    Ok(payload) => self.handle_v3(payload, success),
                    Err(e) => {
                        self.trigger_error(&format!("malformed v3 frame: {e}"));
                    }
                }
            }
            WireFrame::V2(cmd) => self.handle_v2(cmd),
        }
    }

    fn handle_v3(&self, payload: V3Payload, success: bool) {
        match payload {
            V3Payload::Ping => {
                self.send_frame(WireFrame::V3(V3Payload::Pong.into_frame(0, CODE_OK)));
            }
            V3Payload::Pong => self.handle_pong(),
            V3Payload::Message(msg) => {
                match msg.msg_type {
                    msg_type::ERROR | msg_type::FATAL => {
                        warn!(source = %self.name(), "helper: {}", msg.text)
                    }
                    _ => info!(source = %self.name(), "helper: {}", msg.text),
                }
            }
            V3Payload::ProbeReport(report) => self.handle_probe_report(report, success),
            V3Payload::ListReport(report) => {
                {
                    let mut shared = self.inner.shared.lock_or_panic();
                    shared.interfaces = report.interfaces.clone();
                }
                self.complete_command(report.seqno, success, &report_msg(&report.msg));
                self.teardown_transient();
            }
            V3Payload::OpenReport(report) => self.handle_open_report(report, success),
            V3Payload::ConfigReport(report) => {
                {
                    let mut shared = self.inner.shared.lock_or_panic();
                    if !report.channel.is_empty() {
                        shared.locked_channel = report.channel.clone();
                        shared.hop_channels.clear();
                    }
                    if let Some(hop) = &report.chanhop {
                        shared.locked_channel.clear();
                        shared.hop_channels = hop.chan_list.clone();
                        shared.hop_rate = hop.rate;
                        shared.hop_shuffle = hop.shuffle;
                    }
                }
                self.complete_command(report.seqno, success, &report_msg(&report.msg));
            }
            V3Payload::Packet(report) => self.handle_packet_report(*report),
            // Requests only flow toward helpers; one arriving here is a
            // confused peer.
            V3Payload::ProbeReq { .. } | V3Payload::ListReq | V3Payload::OpenReq { .. }
            | V3Payload::ConfigReq(_) => {
                warn!(source = %self.name(), "helper sent a request frame; ignoring");
            }
        }
    }

    fn handle_pong(&self) {
        *self.inner.last_pong.lock_or_panic() = tokio::time::Instant::now();

        let pending = self.inner.shared.lock_or_panic().pending.take();
        match pending {
            Some(PendingAction::Open(cb)) => {
                let transaction = self.inner.commands.next_transaction();
                let seqno = self.inner.commands.track(CommandKind::Open, transaction, cb);
                self.send_frame(WireFrame::V3(
                    V3Payload::OpenReq {
                        definition: self.inner.opts.definition.raw.clone(),
                    }
                    .into_frame(seqno, CODE_OK),
                ));
            }
            Some(PendingAction::Probe(cb)) => {
                let transaction = self.inner.commands.next_transaction();
                let seqno = self.inner.commands.track(CommandKind::Probe, transaction, cb);
                self.send_frame(WireFrame::V3(
                    V3Payload::ProbeReq {
                        definition: self.inner.opts.definition.raw.clone(),
                    }
                    .into_frame(seqno, CODE_OK),
                ));
            }
            Some(PendingAction::List(cb)) => {
                let transaction = self.inner.commands.next_transaction();
                let seqno = self.inner.commands.track(CommandKind::List, transaction, cb);
                self.send_frame(WireFrame::V3(V3Payload::ListReq.into_frame(seqno, CODE_OK)));
            }
            None => {}
        }
    }

    fn handle_probe_report(&self, report: ProbeReport, success: bool) {
        if let Some(iface) = &report.interface {
            let mut shared = self.inner.shared.lock_or_panic();
            shared.interfaces = vec![iface.clone()];
            if !iface.chan_list.is_empty() {
                shared.channels = iface.chan_list.clone();
            }
        }
        self.complete_command(report.seqno, success, &report_msg(&report.msg));
        self.teardown_transient();
    }

    fn handle_open_report(&self, report: OpenReport, success: bool) {
        let msg = report_msg(&report.msg);

        if success {
            let plan = merge_channels(&report.chan_list, &self.inner.opts.definition);
            let mut shared = self.inner.shared.lock_or_panic();

            // A server-supplied uuid wins only when we have none.
            if shared.uuid.is_nil() {
                shared.uuid = report
                    .uuid
                    .parse()
                    .ok()
                    .filter(|u: &Uuid| !u.is_nil())
                    .unwrap_or_else(Uuid::new_v4);
            }

            shared.dlt = self.inner.opts.dlt_override.unwrap_or(report.dlt);
            shared.cap_interface = report.capiface.clone();
            shared.channels = plan.source_channels;
            shared.hop_channels = plan.hop_channels;
            if let Some(hop) = &report.chanhop {
                shared.hop_rate = hop.rate;
                shared.hop_shuffle = hop.shuffle;
                if !hop.chan_list.is_empty() && shared.hop_channels.is_empty() {
                    shared.hop_channels = hop.chan_list.clone();
                }
            }
            shared.state = SourceState::Running;
            shared.error_reason = None;
            drop(shared);

            info!(source = %self.name(), uuid = %self.uuid(), "datasource running");
            self.inner.bus.publish(Event::new(
                bus_channels::DATASOURCE_OPENED,
                self.event_payload(""),
            ));
            self.complete_command(report.seqno, true, &msg);
        } else {
            self.complete_command(report.seqno, false, &msg);
            self.trigger_error(&format!("open failed: {msg}"));
        }
    }

    fn complete_command(&self, seqno: u32, success: bool, message: &str) {
        if let Some(cmd) = self.inner.commands.complete(seqno) {
            (cmd.callback)(success, message);
        }
    }

    /// Transient probe/list sessions kill the helper after the report,
    /// without treating the teardown as an error.
    fn teardown_transient(&self) {
        if !self.inner.transient.load(Ordering::Relaxed) {
            return;
        }
        self.inner.cancelled.store(true, Ordering::Relaxed);
        self.close_io();
        self.set_state(SourceState::Idle);
    }

    // ---- v2 fallback ------------------------------------------------------

    fn handle_v2(&self, cmd: V2Command) {
        match cmd.command.as_str() {
            v2::command::PONG => self.handle_pong(),
            v2::command::PING => {
                self.send_frame(WireFrame::V2(V2Command::new(v2::command::PONG, Vec::new())));
            }
            v2::command::OPENSOURCEREPORT => match V2OpenSourceReport::decode(&cmd.content) {
                Ok(report) => {
                    let open = OpenReport {
                        seqno: report.success.seqno,
                        msg: None,
                        uuid: report.uuid,
                        dlt: report.dlt,
                        capiface: report.capture_interface,
                        chan_list: report.channels,
                        chanhop: None,
                        channel: String::new(),
                    };
                    self.handle_open_report(open, report.success.success);
                }
                Err(e) => self.trigger_error(&format!("malformed v2 open report: {e}")),
            },
            v2::command::PROBESOURCEREPORT => match V2ProbeSourceReport::decode(&cmd.content) {
                Ok(report) => {
                    {
                        let mut shared = self.inner.shared.lock_or_panic();
                        shared.channels = report.channels.clone();
                    }
                    self.complete_command(
                        report.success.seqno,
                        report.success.success,
                        &report.message.map(|m| m.text).unwrap_or_default(),
                    );
                    self.teardown_transient();
                }
                Err(e) => self.trigger_error(&format!("malformed v2 probe report: {e}")),
            },
            v2::command::DATAREPORT => match V2DataReport::decode(&cmd.content) {
                Ok(report) => self.handle_v2_data_report(report),
                Err(e) => self.trigger_error(&format!("malformed v2 data report: {e}")),
            },
            v2::command::ERRORREPORT => {
                self.trigger_error("helper reported an error");
            }
            v2::command::WARNINGREPORT => {
                warn!(source = %self.name(), "helper warning report");
            }
            other => {
                debug!(source = %self.name(), command = other, "unhandled v2 command");
            }
        }
    }

    fn handle_v2_data_report(&self, report: V2DataReport) {
        let converted = PacketReport {
            gps: report.gps.map(|g| GpsBlock {
                lat: g.lat,
                lon: g.lon,
                alt: g.alt,
                fix: g.fix as u8,
                ts_s: g.ts_s,
                ..Default::default()
            }),
            signal: report.signal.map(|s| radiowatch_proto::blocks::SignalBlock {
                signal_dbm: s.signal_dbm,
                noise_dbm: s.noise_dbm,
                freq_khz: s.freq_khz,
                channel: s.channel,
                ..Default::default()
            }),
            packet: report.packet.map(|p| radiowatch_proto::blocks::PacketBlock {
                ts_s: p.ts_s,
                ts_us: p.ts_us,
                dlt: p.dlt,
                length: p.size,
                content: p.data,
            }),
            json: None,
        };
        self.handle_packet_report(converted);
    }

    // ---- data path --------------------------------------------------------

    fn handle_packet_report(&self, report: PacketReport) {
        if self.paused() {
            return;
        }

        let mut packet = Packet::new();
        packet.assignment_id = self.inner.opts.assignment_id;

        let (uuid, dlt) = {
            let shared = self.inner.shared.lock_or_panic();
            (shared.uuid, shared.dlt)
        };

        packet.insert(
            self.inner.core.datasrc,
            Arc::new(DatasourceInfo {
                uuid,
                name: self.inner.opts.name.clone(),
                definition: self.inner.opts.definition.raw.clone(),
            }),
        );

        if let Some(gps) = &report.gps {
            packet.insert(
                self.inner.core.gps,
                Arc::new(GpsInfo {
                    location: LocationFull {
                        triplet: radiowatch_model::location::LocationTriplet {
                            lat: gps.lat,
                            lon: gps.lon,
                            alt: gps.alt,
                            fix: gps.fix,
                            time_sec: gps.ts_s,
                        },
                        speed: gps.speed,
                        heading: gps.heading,
                        magnetic_heading: 0.0,
                    },
                    name: gps.name.clone(),
                    gps_type: gps.gps_type.clone(),
                    uuid: gps.uuid.clone(),
                }),
            );
        } else if self.inner.opts.suppress_gps {
            packet.insert(self.inner.core.nogps, Arc::new(NoGps));
        } else if let Some(fallback) = self.inner.device_gps.lock_or_panic().as_ref() {
            if let Some(location) = fallback() {
                packet.insert(
                    self.inner.core.gps,
                    Arc::new(GpsInfo {
                        location,
                        ..Default::default()
                    }),
                );
            }
        }

        if let Some(signal) = &report.signal {
            packet.insert(
                self.inner.core.radiodata,
                Arc::new(SignalInfo {
                    signal_dbm: signal.signal_dbm,
                    noise_dbm: signal.noise_dbm,
                    signal_rssi: signal.signal_rssi,
                    noise_rssi: signal.noise_rssi,
                    freq_khz: signal.freq_khz,
                    datarate: signal.datarate,
                    channel_width: 0,
                }),
            );
        }

        if let Some(json) = &report.json {
            self.stamp_timestamp(&mut packet, json.ts_s, json.ts_us);
            packet.insert(
                self.inner.core.json,
                Arc::new(JsonInfo {
                    json_type: json.json_type.clone(),
                    json: json.json.clone(),
                }),
            );
        }

        if let Some(data) = &report.packet {
            self.stamp_timestamp(&mut packet, data.ts_s, data.ts_us);
            packet.original_len = if data.length != 0 {
                data.length as usize
            } else {
                data.content.len()
            };

            let frame_dlt = if dlt != 0 { dlt } else { data.dlt };
            self.inner
                .packet_size_rrd
                .lock_or_panic()
                .add_sample(data.content.len() as f64, rwcommon::unix_secs());
            packet.insert(
                self.inner.core.linkframe,
                Arc::new(LinkFrame {
                    dlt: frame_dlt,
                    data: data.content.clone(),
                }),
            );
        }

        self.inner.num_packets.fetch_add(1, Ordering::Relaxed);
        self.inner.chain.process_packet(packet.into_ref());
    }

    fn stamp_timestamp(&self, packet: &mut Packet, ts_s: u64, ts_us: u32) {
        if (self.inner.opts.clobber_timestamp && self.inner.opts.remote) || ts_s == 0 {
            let (s, us) = rwcommon::unix_timeval();
            packet.ts_sec = s;
            packet.ts_usec = us;
        } else {
            packet.ts_sec = ts_s;
            packet.ts_usec = ts_us;
        }
    }

    // ---- configure --------------------------------------------------------

    /// Lock the source to one channel.
    pub fn set_channel(&self, channel: &str, callback: CommandCallback) {
        let transaction = self.inner.commands.next_transaction();
        let seqno = self
            .inner
            .commands
            .track(CommandKind::Configure, transaction, callback);
        self.send_frame(WireFrame::V3(
            V3Payload::ConfigReq(ConfigReq {
                channel: Some(channel.to_string()),
                chanhop: None,
            })
            .into_frame(seqno, CODE_OK),
        ));
    }

    /// Configure hopping over the current hop list.
    pub fn set_channel_hop(
        &self,
        rate: f32,
        shuffle: bool,
        offset: u16,
        callback: CommandCallback,
    ) {
        let chan_list = self.hop_channels();
        if chan_list.is_empty() {
            callback(false, "source has no hoppable channels");
            return;
        }

        let transaction = self.inner.commands.next_transaction();
        let seqno = self
            .inner
            .commands
            .track(CommandKind::Configure, transaction, callback);
        self.send_frame(WireFrame::V3(
            V3Payload::ConfigReq(ConfigReq {
                channel: None,
                chanhop: Some(ChanHopBlock {
                    rate,
                    shuffle,
                    skip: 0,
                    offset,
                    chan_list,
                }),
            })
            .into_frame(seqno, CODE_OK),
        ));
    }

    // ---- error / close ----------------------------------------------------

    pub fn trigger_error(&self, reason: &str) {
        if self.inner.cancelled.load(Ordering::Relaxed) {
            return;
        }
        if self.inner.transient.load(Ordering::Relaxed) {
            // Probe/list teardown is noisy by nature; stay quiet.
            debug!(source = %self.name(), "transient session ended: {reason}");
            self.inner.cancelled.store(true, Ordering::Relaxed);
            self.close_io();
            return;
        }

        error!(source = %self.name(), "datasource error: {reason}");
        self.inner.num_errors.fetch_add(1, Ordering::Relaxed);

        {
            let mut shared = self.inner.shared.lock_or_panic();
            shared.state = SourceState::Erroring;
            shared.error_reason = Some(reason.to_string());
        }

        self.inner.commands.cancel_all(reason);
        self.close_io();

        self.inner.bus.publish(Event::new(
            bus_channels::DATASOURCE_ERROR,
            self.event_payload(reason),
        ));

        // Remote sources reconnect from their end; local sources reopen on
        // a timer when asked to.
        if self.inner.opts.retry && !self.inner.opts.remote {
            self.set_state(SourceState::Retrying);
            let this = self.clone();
            self.inner.runtime.spawn(async move {
                tokio::time::sleep(RETRY_DELAY).await;
                if this.inner.cancelled.load(Ordering::Relaxed) {
                    return;
                }
                info!(source = %this.name(), "retrying datasource");
                this.open(Box::new(|ok, msg| {
                    if !ok {
                        warn!("datasource retry failed: {msg}");
                    }
                }));
            });
        } else {
            self.set_state(SourceState::Closed);
        }
    }

    fn close_io(&self) {
        let mut shared = self.inner.shared.lock_or_panic();
        shared.writer = None;
        if let Some(mut child) = shared.child.take() {
            let _ = child.start_kill();
        }
        for task in shared.tasks.drain(..) {
            task.abort();
        }
    }

    /// Close for good: cancel outstanding commands, kill the helper,
    /// publish the closed event.
    pub fn close(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.commands.cancel_all("source closed");
        self.close_io();
        self.set_state(SourceState::Closed);
        self.inner.bus.publish(Event::new(
            bus_channels::DATASOURCE_CLOSED,
            self.event_payload(""),
        ));
    }
}

fn report_msg(msg: &Option<radiowatch_proto::blocks::MsgBlock>) -> String {
    msg.as_ref().map(|m| m.text.clone()).unwrap_or_default()
}

/// Remote variant constructor: inbound sources are never retried locally.
pub fn remote_options(definition: SourceDefinition, source_type: &str) -> SourceOptions {
    let mut opts = SourceOptions::from_definition(definition, source_type, None, false, 0);
    opts.remote = true;
    opts.retry = false;
    opts.clobber_timestamp = opts.definition.opt_bool("timestamp", true);
    opts
}

#[cfg(test)]
mod tests {
    use super::*;
    use radiowatch_packet::{ChainStage, PacketChainConfig};
    use radiowatch_proto::v3::{command, V3Frame};
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn test_chain() -> PacketChain {
        let chain = PacketChain::new(&PacketChainConfig {
            packet_threads: 1,
            backlog_limit: 0,
            warning_threshold: 0,
        });
        chain.start();
        chain
    }

    fn source(def: &str, chain: &PacketChain) -> (Datasource, Arc<EventBus>) {
        let bus = EventBus::new();
        let opts = SourceOptions::from_definition(
            def.parse().unwrap(),
            "testdrv",
            Some(PathBuf::from("/bin/true")),
            false,
            42,
        );
        let ds = Datasource::new(opts, bus.clone(), chain.clone(), tokio::runtime::Handle::current());
        (ds, bus)
    }

    /// Minimal scripted helper: answers the version ping, then answers one
    /// open request.
    async fn fake_helper(stream: DuplexStream, chan_list: Vec<String>) {
        let (read, write) = tokio::io::split(stream);
        let mut framed_r = FramedRead::new(read, FrameCodec::new());
        let mut framed_w = FramedWrite::new(write, FrameCodec::new());

        while let Some(Ok(frame)) = framed_r.next().await {
            let WireFrame::V3(frame) = frame else { continue };
            match frame.command {
                command::PING => {
                    framed_w
                        .send(WireFrame::V3(V3Payload::Pong.into_frame(0, CODE_OK)))
                        .await
                        .unwrap();
                }
                command::KDS_OPENREQ => {
                    let report = V3Payload::OpenReport(OpenReport {
                        seqno: frame.seqno,
                        msg: None,
                        uuid: "6ba7b810-9dad-11d1-80b4-00c04fd430c8".to_string(),
                        dlt: 127,
                        capiface: "wlan0mon".to_string(),
                        chan_list: chan_list.clone(),
                        chanhop: Some(ChanHopBlock {
                            rate: 5.0,
                            shuffle: true,
                            skip: 0,
                            offset: 0,
                            chan_list: chan_list.clone(),
                        }),
                        channel: String::new(),
                    });
                    framed_w
                        .send(WireFrame::V3(report.into_frame(0, CODE_OK)))
                        .await
                        .unwrap();
                }
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn test_open_negotiation_and_channel_merge() {
        let chain = test_chain();
        let (ds, bus) = source(
            "wlan0:name=office,add_channels=\"36,40\",block_channels=6",
            &chain,
        );

        let (server_side, helper_side) = duplex(65536);
        tokio::spawn(fake_helper(helper_side, vec![
            "1".to_string(),
            "6".to_string(),
            "11".to_string(),
        ]));

        let (tx, rx) = tokio::sync::oneshot::channel();
        ds.inner.shared.lock_or_panic().pending = Some(PendingAction::Open(Box::new(
            move |ok, msg| {
                let _ = tx.send((ok, msg.to_string()));
            },
        )));
        ds.set_state(SourceState::Opening);
        let (read, write) = tokio::io::split(server_side);
        ds.start_io(read, write);

        let (ok, _msg) = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();
        assert!(ok);
        assert_eq!(ds.state(), SourceState::Running);
        assert_eq!(
            ds.channels(),
            vec!["1", "6", "11", "36", "40"]
                .into_iter()
                .map(String::from)
                .collect::<Vec<_>>()
        );
        assert_eq!(
            ds.hop_channels(),
            vec!["1", "11", "36", "40"]
                .into_iter()
                .map(String::from)
                .collect::<Vec<_>>()
        );
        assert!(!ds.uuid().is_nil());

        ds.close();
        chain.shutdown();
        bus.shutdown();
    }

    #[tokio::test]
    async fn test_packet_report_builds_packet() {
        let chain = test_chain();
        let core = chain.core_components();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        chain.register_handler(ChainStage::Tracker, 0, move |pkt| {
            let frame = pkt.fetch::<LinkFrame>(core.linkframe).map(|f| f.data.clone());
            let sig = pkt.fetch::<SignalInfo>(core.radiodata).map(|s| s.signal_dbm);
            let src = pkt
                .fetch::<DatasourceInfo>(core.datasrc)
                .map(|d| d.name.clone());
            s.lock().unwrap().push((pkt.ts_sec, frame, sig, src));
        });

        let (ds, bus) = source("wlan0:name=office", &chain);
        {
            let mut shared = ds.inner.shared.lock_or_panic();
            shared.uuid = Uuid::new_v4();
            shared.state = SourceState::Running;
        }

        ds.handle_packet_report(PacketReport {
            gps: Some(GpsBlock {
                lat: 44.0,
                lon: -73.0,
                fix: 3,
                ts_s: 1700000000,
                ..Default::default()
            }),
            signal: Some(radiowatch_proto::blocks::SignalBlock {
                signal_dbm: -42,
                freq_khz: 2412000,
                ..Default::default()
            }),
            packet: Some(radiowatch_proto::blocks::PacketBlock {
                ts_s: 1700000000,
                ts_us: 55,
                dlt: 127,
                length: 0,
                content: vec![0xAB; 32],
            }),
            json: None,
        });

        chain.shutdown();
        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 1);
        let (ts, frame, sig, src) = &seen[0];
        assert_eq!(*ts, 1700000000);
        assert_eq!(frame.as_ref().unwrap().len(), 32);
        assert_eq!(sig.unwrap(), -42);
        assert_eq!(src.as_deref(), Some("office"));

        ds.close();
        bus.shutdown();
    }

    #[tokio::test]
    async fn test_paused_drops_reports() {
        let chain = test_chain();
        let (ds, bus) = source("wlan0", &chain);

        ds.set_paused(true);
        ds.handle_packet_report(PacketReport {
            packet: Some(radiowatch_proto::blocks::PacketBlock {
                content: vec![1, 2, 3],
                ..Default::default()
            }),
            ..Default::default()
        });
        assert_eq!(ds.packet_count(), 0);

        ds.set_paused(false);
        ds.handle_packet_report(PacketReport {
            packet: Some(radiowatch_proto::blocks::PacketBlock {
                content: vec![1, 2, 3],
                ..Default::default()
            }),
            ..Default::default()
        });
        assert_eq!(ds.packet_count(), 1);

        ds.close();
        chain.shutdown();
        bus.shutdown();
    }

    #[tokio::test]
    async fn test_close_cancels_outstanding_commands() {
        let chain = test_chain();
        let (ds, bus) = source("wlan0", &chain);

        let (tx, rx) = tokio::sync::oneshot::channel();
        ds.inner.commands.track(
            CommandKind::Configure,
            1,
            Box::new(move |ok, msg| {
                let _ = tx.send((ok, msg.to_string()));
            }),
        );

        ds.close();
        let (ok, msg) = rx.await.unwrap();
        assert!(!ok);
        assert_eq!(msg, "source closed");
        assert_eq!(ds.state(), SourceState::Closed);

        chain.shutdown();
        bus.shutdown();
    }

    #[tokio::test]
    async fn test_passive_source_runs_without_helper() {
        let chain = test_chain();
        let bus = EventBus::new();
        let opts = SourceOptions::from_definition(
            "virtual0".parse().unwrap(),
            "virtual",
            None,
            true,
            7,
        );
        let ds = Datasource::new(opts, bus.clone(), chain.clone(), tokio::runtime::Handle::current());

        let (tx, rx) = tokio::sync::oneshot::channel();
        ds.open(Box::new(move |ok, _| {
            let _ = tx.send(ok);
        }));
        assert!(rx.await.unwrap());
        assert_eq!(ds.state(), SourceState::Running);
        assert!(!ds.uuid().is_nil());

        ds.close();
        chain.shutdown();
        bus.shutdown();
    }

    #[test]
    fn test_source_options() {
        let opts = SourceOptions::from_definition(
            "wlan0:name=office,retry=false,dlt=105,suppressgps=true"
                .parse()
                .unwrap(),
            "linuxwifi",
            Some(PathBuf::from("/usr/bin/helper")),
            false,
            3,
        );
        assert_eq!(opts.name, "office");
        assert_eq!(opts.interface, "wlan0");
        assert!(!opts.retry);
        assert_eq!(opts.dlt_override, Some(105));
        assert!(opts.suppress_gps);

        let remote = remote_options("tcp0:name=r".parse().unwrap(), "remote");
        assert!(remote.remote);
        assert!(!remote.retry);
        assert!(remote.clobber_timestamp);
    }
}
