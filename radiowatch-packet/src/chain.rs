// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The packet chain: a pool of worker threads running ordered stage lists
//! over every captured packet.
//!
//! Stage handlers register into a *pending* copy of their stage list; each
//! worker promotes pending lists at the top of its loop, so a handler added
//! mid-stream never runs against a packet already in flight.  The packet's
//! own mutex is held for the whole stage walk; per-key ordering comes from
//! routing equal assignment ids to the same worker.
//!
//! Deduplication hashes the link frame into a 1024-slot ring.  A hit marks
//! the packet duplicate, adopts the original's packet number and shareable
//! components, and folds this capture's signal into the per-source
//! aggregate.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

use crc::{Crc, CRC_32_ISO_HDLC};
use crossbeam::channel::{unbounded, Receiver, Sender};
use rand::Rng;
use rwcommon::{unix_secs, MutexExt};
use tracing::{debug, error, warn};

use radiowatch_model::rrd::{
    DefaultAggregator, ExtremeAggregator, PrevPosExtremeAggregator, Rrd,
};
use radiowatch_model::{ElementError, ElementRef, EntryTracker};

use crate::packet::{ComponentId, Packet, PacketRef, SignalAggregate, SignalInfo};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);
const DEDUP_SLOTS: usize = 1024;
const OVERLOAD_WARN_INTERVAL: u64 = 30;

/// Stage order is processing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainStage {
    Postcap,
    LlcDissect,
    Decrypt,
    DataDissect,
    Classifier,
    Tracker,
    Logging,
}

impl ChainStage {
    const COUNT: usize = 7;

    fn index(&self) -> usize {
        match self {
            ChainStage::Postcap => 0,
            ChainStage::LlcDissect => 1,
            ChainStage::Decrypt => 2,
            ChainStage::DataDissect => 3,
            ChainStage::Classifier => 4,
            ChainStage::Tracker => 5,
            ChainStage::Logging => 6,
        }
    }
}

pub type HandlerId = u64;

type HandlerFn = Arc<dyn Fn(&mut Packet) + Send + Sync>;

#[derive(Clone)]
struct Link {
    id: HandlerId,
    priority: i32,
    handler: HandlerFn,
}

#[derive(Default)]
struct StageList {
    current: Vec<Link>,
    pending: Vec<Link>,
    update: bool,
}

impl StageList {
    fn begin_update(&mut self) {
        if !self.update {
            self.pending = self.current.clone();
            self.update = true;
        }
    }

    fn promote(&mut self) -> bool {
        if self.update {
            self.current = std::mem::take(&mut self.pending);
            self.update = false;
            true
        } else {
            false
        }
    }
}

#[derive(Default)]
struct ComponentRegistry {
    by_name: HashMap<String, ComponentId>,
    names: Vec<String>,
}

impl ComponentRegistry {
    fn register(&mut self, name: &str) -> ComponentId {
        let name = name.to_ascii_lowercase();
        if let Some(&id) = self.by_name.get(&name) {
            return id;
        }
        let id = ComponentId(self.names.len());
        self.names.push(name.clone());
        self.by_name.insert(name, id);
        id
    }

    fn name_of(&self, id: ComponentId) -> Option<&str> {
        self.names.get(id.0).map(|s| s.as_str())
    }
}

struct DedupSlot {
    hash: u32,
    packet_no: u64,
    original: Option<PacketRef>,
}

struct DedupRing {
    slots: Vec<DedupSlot>,
    pos: usize,
}

impl DedupRing {
    fn new() -> Self {
        DedupRing {
            slots: (0..DEDUP_SLOTS)
                .map(|_| DedupSlot {
                    hash: 0,
                    packet_no: 0,
                    original: None,
                })
                .collect(),
            pos: 0,
        }
    }
}

/// Chain-level rate statistics, all RRD-backed.
pub struct ChainStats {
    pub rate: Mutex<Rrd>,
    pub peak: Mutex<Rrd<DefaultAggregator, PrevPosExtremeAggregator, PrevPosExtremeAggregator>>,
    pub error: Mutex<Rrd>,
    pub dupe: Mutex<Rrd>,
    pub processed: Mutex<Rrd>,
    pub dropped: Mutex<Rrd>,
    pub queue_depth: Mutex<Rrd<ExtremeAggregator, ExtremeAggregator, ExtremeAggregator>>,
}

impl ChainStats {
    fn new() -> Self {
        ChainStats {
            rate: Mutex::new(Rrd::new()),
            peak: Mutex::new(Rrd::new()),
            error: Mutex::new(Rrd::new()),
            dupe: Mutex::new(Rrd::new()),
            processed: Mutex::new(Rrd::new()),
            dropped: Mutex::new(Rrd::new()),
            queue_depth: Mutex::new(Rrd::new()),
        }
    }
}

/// Ids of the components every part of the pipeline touches, registered at
/// chain construction.
#[derive(Debug, Clone, Copy)]
pub struct CoreComponents {
    pub linkframe: ComponentId,
    pub decap: ComponentId,
    pub radiodata: ComponentId,
    pub radiodata_agg: ComponentId,
    pub gps: ComponentId,
    pub nogps: ComponentId,
    pub common: ComponentId,
    pub datasrc: ComponentId,
    pub json: ComponentId,
    pub metablob: ComponentId,
    pub alert: ComponentId,
}

#[derive(Debug, Clone)]
pub struct PacketChainConfig {
    /// Worker count; zero means one per hardware thread.
    pub packet_threads: usize,
    /// Per-worker queue depth beyond which packets drop; zero disables.
    pub backlog_limit: usize,
    /// Per-worker queue depth that raises a warning; zero disables.
    pub warning_threshold: usize,
}

impl Default for PacketChainConfig {
    fn default() -> Self {
        PacketChainConfig {
            packet_threads: 0,
            backlog_limit: 8192,
            warning_threshold: 0,
        }
    }
}

type OverloadFn = Box<dyn Fn(&'static str, String) + Send + Sync>;

struct ChainInner {
    n_threads: usize,
    backlog_limit: usize,
    warning_threshold: usize,

    components: Mutex<ComponentRegistry>,
    stages: Mutex<[StageList; ChainStage::COUNT]>,
    next_handler_id: AtomicU64,

    dedup: RwLock<DedupRing>,
    unique_packet_no: AtomicU64,

    senders: Vec<Sender<Option<PacketRef>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: AtomicBool,

    stats: ChainStats,
    // Raises PACKETLOST / PACKETQUEUE through whatever alerting the server
    // wired in; the chain itself only rate-limits the calls.
    overload_cb: Mutex<Option<OverloadFn>>,
    last_drop_warning: AtomicU64,
    last_queue_warning: AtomicU64,

    core: CoreComponents,
}

/// The chain.  Construct once, `start`, share by clone.
#[derive(Clone)]
pub struct PacketChain {
    inner: Arc<ChainInner>,
    receivers: Arc<Vec<Receiver<Option<PacketRef>>>>,
}

impl PacketChain {
    pub fn new(config: &PacketChainConfig) -> Self {
        let n_threads = if config.packet_threads == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            config.packet_threads
        };

        let mut senders = Vec::with_capacity(n_threads);
        let mut receivers = Vec::with_capacity(n_threads);
        for _ in 0..n_threads {
            let (tx, rx) = unbounded();
            senders.push(tx);
            receivers.push(rx);
        }

        let mut registry = ComponentRegistry::default();
        let core = CoreComponents {
            linkframe: registry.register("linkframe"),
            decap: registry.register("decap"),
            radiodata: registry.register("radiodata"),
            radiodata_agg: registry.register("radiodata_agg"),
            gps: registry.register("gps"),
            nogps: registry.register("nogps"),
            common: registry.register("common"),
            datasrc: registry.register("datasrc"),
            json: registry.register("json"),
            metablob: registry.register("metablob"),
            alert: registry.register("alert"),
        };

        PacketChain {
            inner: Arc::new(ChainInner {
                n_threads,
                backlog_limit: config.backlog_limit,
                warning_threshold: config.warning_threshold,
                components: Mutex::new(registry),
                stages: Mutex::new(Default::default()),
                next_handler_id: AtomicU64::new(1),
                dedup: RwLock::new(DedupRing::new()),
                unique_packet_no: AtomicU64::new(1),
                senders,
                workers: Mutex::new(Vec::new()),
                shutdown: AtomicBool::new(false),
                stats: ChainStats::new(),
                overload_cb: Mutex::new(None),
                last_drop_warning: AtomicU64::new(0),
                last_queue_warning: AtomicU64::new(0),
                core,
            }),
            receivers: Arc::new(receivers),
        }
    }

    /// Spawn the worker pool.  Idempotent guard: calling twice would double
    /// the workers, so don't.
    pub fn start(&self) {
        let mut workers = self.inner.workers.lock_or_panic();
        for (n, rx) in self.receivers.iter().enumerate() {
            let chain = self.clone();
            let rx = rx.clone();
            let name = format!("rw-packet-{n}/{}", self.inner.n_threads);
            match std::thread::Builder::new()
                .name(name)
                .spawn(move || chain.worker_loop(rx))
            {
                Ok(handle) => workers.push(handle),
                Err(e) => error!("failed to spawn packet worker {n}: {e}"),
            }
        }
    }

    pub fn worker_count(&self) -> usize {
        self.inner.n_threads
    }

    pub fn core_components(&self) -> CoreComponents {
        self.inner.core
    }

    pub fn stats(&self) -> &ChainStats {
        &self.inner.stats
    }

    /// Install the callback used to surface queue overload conditions
    /// ("PACKETLOST" / "PACKETQUEUE").
    pub fn set_overload_callback<F>(&self, cb: F)
    where
        F: Fn(&'static str, String) + Send + Sync + 'static,
    {
        *self.inner.overload_cb.lock_or_panic() = Some(Box::new(cb));
    }

    pub fn register_packet_component(&self, name: &str) -> ComponentId {
        self.inner.components.lock_or_panic().register(name)
    }

    pub fn component_name(&self, id: ComponentId) -> Option<String> {
        self.inner
            .components
            .lock_or_panic()
            .name_of(id)
            .map(|s| s.to_string())
    }

    /// Register a stage handler.  Lower priority runs earlier; equal
    /// priorities keep registration order.
    pub fn register_handler<F>(&self, stage: ChainStage, priority: i32, handler: F) -> HandlerId
    where
        F: Fn(&mut Packet) + Send + Sync + 'static,
    {
        let id = self.inner.next_handler_id.fetch_add(1, Ordering::SeqCst);
        let mut stages = self.inner.stages.lock_or_panic();
        let list = &mut stages[stage.index()];
        list.begin_update();
        list.pending.push(Link {
            id,
            priority,
            handler: Arc::new(handler),
        });
        list.pending.sort_by_key(|l| l.priority);
        id
    }

    pub fn remove_handler(&self, stage: ChainStage, id: HandlerId) {
        let mut stages = self.inner.stages.lock_or_panic();
        let list = &mut stages[stage.index()];
        list.begin_update();
        list.pending.retain(|l| l.id != id);
    }

    fn snapshot_stage(&self, stage: ChainStage) -> Vec<Link> {
        self.inner.stages.lock_or_panic()[stage.index()]
            .current
            .clone()
    }

    fn promote_stages(&self, include_postcap: bool) {
        let mut stages = self.inner.stages.lock_or_panic();
        for (idx, list) in stages.iter_mut().enumerate() {
            if idx == ChainStage::Postcap.index() && !include_postcap {
                continue;
            }
            if list.promote() {
                debug!(stage = idx, "promoted pending stage handlers");
            }
        }
    }

    fn run_stage(&self, stage: ChainStage, packet: &mut Packet) {
        for link in self.snapshot_stage(stage) {
            let result = catch_unwind(AssertUnwindSafe(|| (link.handler)(packet)));
            if result.is_err() {
                error!(
                    stage = ?stage,
                    handler = link.id,
                    "stage handler panicked; packet continues"
                );
                packet.error = true;
            }
        }
    }

    /// Feed one packet into the chain.  Runs postcap inline, then assigns a
    /// worker and enqueues.  Returns false if the packet was dropped for
    /// backpressure.
    pub fn process_packet(&self, packet: PacketRef) -> bool {
        let now = unix_secs();

        // Total rate counts even what we subsequently drop.
        self.inner.stats.rate.lock_or_panic().add_sample(1.0, now);
        self.inner.stats.peak.lock_or_panic().add_sample(1.0, now);

        {
            let mut stages = self.inner.stages.lock_or_panic();
            stages[ChainStage::Postcap.index()].promote();
        }
        {
            let mut guard = packet.lock_or_panic();
            self.run_stage(ChainStage::Postcap, &mut guard);
        }

        let processing_id = {
            let guard = packet.lock_or_panic();
            if guard.assignment_id != 0 {
                guard.assignment_id as usize % self.inner.n_threads
            } else if let Some(original) = &guard.original {
                original.lock_or_panic().assignment_id as usize % self.inner.n_threads
            } else {
                rand::thread_rng().gen_range(0..self.inner.n_threads)
            }
        };

        let qsize = self.inner.senders[processing_id].len();

        if self.inner.backlog_limit != 0 && qsize > self.inner.backlog_limit {
            let last = self.inner.last_drop_warning.load(Ordering::Relaxed);
            if now.saturating_sub(last) > OVERLOAD_WARN_INTERVAL {
                self.inner.last_drop_warning.store(now, Ordering::Relaxed);
                self.fire_overload(
                    "PACKETLOST",
                    format!(
                        "The packet queue has exceeded the maximum size of {}; the server \
                         will start dropping packets.  The system may not have enough CPU \
                         for the packet rate in this environment.  The backlog can be \
                         raised with the packet_backlog_limit option.",
                        self.inner.backlog_limit
                    ),
                );
            }
            self.inner.stats.dropped.lock_or_panic().add_sample(1.0, now);
            return false;
        }

        if self.inner.warning_threshold != 0 && qsize > self.inner.warning_threshold {
            let last = self.inner.last_queue_warning.load(Ordering::Relaxed);
            if now.saturating_sub(last) > OVERLOAD_WARN_INTERVAL {
                self.inner.last_queue_warning.store(now, Ordering::Relaxed);
                self.fire_overload(
                    "PACKETQUEUE",
                    format!(
                        "The packet queue has a backlog of {qsize} packets; processing \
                         continues, this may be a momentary spike in packet load.",
                    ),
                );
            }
        }

        if self.inner.senders[processing_id].send(Some(packet)).is_err() {
            warn!("packet worker {processing_id} is gone; dropping packet");
            return false;
        }
        self.inner
            .stats
            .queue_depth
            .lock_or_panic()
            .add_sample(qsize as f64, now);
        true
    }

    fn fire_overload(&self, kind: &'static str, message: String) {
        warn!("{kind}: {message}");
        if let Some(cb) = self.inner.overload_cb.lock_or_panic().as_ref() {
            cb(kind, message);
        }
    }

    fn worker_loop(&self, rx: Receiver<Option<PacketRef>>) {
        while !self.inner.shutdown.load(Ordering::Relaxed) {
            let packet = match rx.recv() {
                Ok(Some(p)) => p,
                Ok(None) | Err(_) => break,
            };

            self.promote_stages(false);

            {
                let mut guard = packet.lock_or_panic();
                self.dedup(&packet, &mut guard);

                self.run_stage(ChainStage::LlcDissect, &mut guard);
                self.run_stage(ChainStage::Decrypt, &mut guard);
                self.run_stage(ChainStage::DataDissect, &mut guard);
                self.run_stage(ChainStage::Classifier, &mut guard);
                self.run_stage(ChainStage::Tracker, &mut guard);
                self.run_stage(ChainStage::Logging, &mut guard);
            }

            let now = unix_secs();
            let guard = packet.lock_or_panic();
            if guard.error {
                self.inner.stats.error.lock_or_panic().add_sample(1.0, now);
            }
            if guard.duplicate {
                self.inner.stats.dupe.lock_or_panic().add_sample(1.0, now);
            }
            drop(guard);
            self.inner
                .stats
                .processed
                .lock_or_panic()
                .add_sample(1.0, now);
        }
    }

    /// Hash the link frame and consult the dedup ring.  Caller holds the
    /// packet lock.
    fn dedup(&self, packet_ref: &PacketRef, packet: &mut Packet) {
        let core = self.inner.core;
        let Some(frame) = packet.fetch_first::<crate::packet::LinkFrame>(&[core.decap, core.linkframe])
        else {
            return;
        };
        if frame.data.is_empty() {
            return;
        }

        packet.hash = CRC32.checksum(&frame.data);

        let mut ring = match self.inner.dedup.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };

        for slot in ring.slots.iter() {
            if slot.packet_no != 0 && slot.hash == packet.hash {
                packet.duplicate = true;
                packet.packet_no = slot.packet_no;
                packet.original = slot.original.clone();

                // This capture's own signal survives inheritance (unique
                // component); fold it into the shared per-source aggregate
                // before the original's components arrive.
                let own_l1 = packet.fetch::<SignalInfo>(core.radiodata);

                if let Some(original) = &slot.original {
                    // Wait for the original to finish its own stage walk
                    // before sharing its decoded state.
                    let original_guard = original.lock_or_panic();
                    packet.inherit_components(&original_guard);
                    drop(original_guard);
                }

                if let (Some(l1), Some(src)) = (
                    own_l1,
                    packet.fetch::<crate::packet::DatasourceInfo>(core.datasrc),
                ) {
                    let agg =
                        packet.fetch_or_insert(core.radiodata_agg, SignalAggregate::default);
                    agg.record(src.uuid, *l1);
                }
                return;
            }
        }

        packet.packet_no = self.inner.unique_packet_no.fetch_add(1, Ordering::SeqCst);
        let pos = ring.pos % DEDUP_SLOTS;
        ring.pos = ring.pos.wrapping_add(1);
        ring.slots[pos] = DedupSlot {
            hash: packet.hash,
            packet_no: packet.packet_no,
            original: Some(packet_ref.clone()),
        };
    }

    /// Snapshot the chain statistics as an element map for serialization.
    pub fn stats_element(&self, registry: &EntryTracker) -> Result<ElementRef, ElementError> {
        use radiowatch_model::element::{Element, KeyedMap, TrackedElement};
        use radiowatch_model::fields::ElementBuilder;
        use radiowatch_model::ElementType;

        let now = unix_secs();
        let f_map = registry.register_field(
            "radiowatch.packetchain.stats",
            ElementBuilder::Type(ElementType::Map),
            "packet chain statistics",
        )?;

        let mut m = KeyedMap::new();

        macro_rules! insert_rrd {
            ($field:expr, $name:expr, $desc:expr) => {{
                let mut rrd = $field.lock_or_panic();
                rrd.pre_serialize(now);
                let elem = rrd.to_element(registry)?;
                drop(rrd);
                let id = registry.register_field(
                    $name,
                    ElementBuilder::Type(ElementType::Map),
                    $desc,
                )?;
                {
                    let mut guard = match elem.write() {
                        Ok(g) => g,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    guard.set_id(id);
                }
                m.entries.insert(id, elem);
            }};
        }

        insert_rrd!(
            self.inner.stats.rate,
            "radiowatch.packetchain.packets_rrd",
            "total packet rate rrd"
        );
        insert_rrd!(
            self.inner.stats.peak,
            "radiowatch.packetchain.peak_packets_rrd",
            "incoming packets peak rrd"
        );
        insert_rrd!(
            self.inner.stats.error,
            "radiowatch.packetchain.error_packets_rrd",
            "error packet rate rrd"
        );
        insert_rrd!(
            self.inner.stats.dupe,
            "radiowatch.packetchain.dupe_packets_rrd",
            "duplicate packet rate rrd"
        );
        insert_rrd!(
            self.inner.stats.processed,
            "radiowatch.packetchain.processed_packets_rrd",
            "processed packet rrd"
        );
        insert_rrd!(
            self.inner.stats.dropped,
            "radiowatch.packetchain.dropped_packets_rrd",
            "lost packet / queue overfull rrd"
        );
        insert_rrd!(
            self.inner.stats.queue_depth,
            "radiowatch.packetchain.queued_packets_rrd",
            "packet backlog queue rrd"
        );

        Ok(TrackedElement::new(f_map, Element::Map(m)).into_ref())
    }

    /// Stop every worker: one sentinel per queue, joined in order.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Relaxed);
        for tx in &self.inner.senders {
            let _ = tx.send(None);
        }
        let mut workers = self.inner.workers.lock_or_panic();
        for handle in workers.drain(..) {
            if handle.join().is_err() {
                error!("packet worker panicked during shutdown");
            }
        }
    }
}
