// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Alert registration, rate limiting, and delivery.
//!
//! Alert kinds are registered once for a dense reference id and carry two
//! token windows: a sustained `limit_rate / limit_unit` and a finer
//! `burst_limit / burst_unit`.  A raise that passes both windows becomes an
//! immutable [`AlertInfo`], lands in the bounded backlog, goes out on the
//! event bus, and is attached to the triggering packet when there is one.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use rwcommon::config::{AlertDefinition, RateUnit};
use rwcommon::{unix_timeval, MacAddr, MutexExt};
use tracing::{debug, info};

use radiowatch_eventbus::{channels, Event, EventBus};
use radiowatch_model::element::{scalar, Element, KeyedMap, TrackedElement};
use radiowatch_model::fields::ElementBuilder;
use radiowatch_model::location::LocationTriplet;
use radiowatch_model::{ElementError, ElementRef, ElementType, EntryTracker};
use radiowatch_packet::packet::{ComponentId, GpsInfo, Packet, PacketComponent};
use radiowatch_packet::PhyId;

/// Phy binding for alerts not tied to any phy.
pub const PHY_ANY: PhyId = u32::MAX;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum AlertError {
    #[error("alert header {0:?} is already registered")]
    HeaderExists(String),
    #[error("burst unit must be finer than or equal to the limit unit for {0:?}")]
    BurstExceedsLimit(String),
    #[error("unknown alert reference {0}")]
    UnknownRef(usize),
    #[error("unknown alert header {0:?}")]
    UnknownHeader(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info = 0,
    Low = 5,
    Medium = 10,
    High = 15,
    Critical = 20,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

/// Dense alert reference id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AlertRef(pub usize);

/// One raised alert.  Never mutated after construction.
#[derive(Debug, Clone)]
pub struct AlertInfo {
    pub header: String,
    pub class: String,
    pub severity: Severity,
    pub phy: PhyId,
    pub ts_sec: u64,
    pub ts_usec: u32,
    pub bssid: MacAddr,
    pub source: MacAddr,
    pub dest: MacAddr,
    pub other: MacAddr,
    pub channel: String,
    pub text: String,
    pub location: Option<LocationTriplet>,
}

impl AlertInfo {
    /// Snapshot into an element map for the serializers and the log.
    pub fn to_element(&self, registry: &EntryTracker) -> Result<ElementRef, ElementError> {
        let f_map = registry.register_field(
            "radiowatch.alert",
            ElementBuilder::Type(ElementType::Map),
            "alert record",
        )?;

        let mut m = KeyedMap::new();
        let mut put = |name: &str,
                       desc: &str,
                       value: Element|
         -> Result<(), ElementError> {
            let ty = value.element_type();
            let id = registry.register_field(name, ElementBuilder::Type(ty), desc)?;
            m.entries.insert(id, scalar(id, value));
            Ok(())
        };

        put(
            "radiowatch.alert.header",
            "alert type",
            Element::String(self.header.clone()),
        )?;
        put(
            "radiowatch.alert.class",
            "alert class",
            Element::String(self.class.clone()),
        )?;
        put(
            "radiowatch.alert.severity",
            "alert severity",
            Element::U8(self.severity as u8),
        )?;
        put(
            "radiowatch.alert.phy_id",
            "phy id of alert source",
            Element::U32(self.phy),
        )?;
        put(
            "radiowatch.alert.timestamp_sec",
            "alert timestamp (seconds)",
            Element::U64(self.ts_sec),
        )?;
        put(
            "radiowatch.alert.timestamp_usec",
            "alert timestamp (microseconds)",
            Element::U32(self.ts_usec),
        )?;
        put(
            "radiowatch.alert.bssid",
            "bssid",
            Element::Mac(self.bssid),
        )?;
        put(
            "radiowatch.alert.source_mac",
            "source mac",
            Element::Mac(self.source),
        )?;
        put(
            "radiowatch.alert.dest_mac",
            "destination mac",
            Element::Mac(self.dest),
        )?;
        put(
            "radiowatch.alert.other_mac",
            "other mac",
            Element::Mac(self.other),
        )?;
        put(
            "radiowatch.alert.channel",
            "channel",
            Element::String(self.channel.clone()),
        )?;
        put(
            "radiowatch.alert.text",
            "alert text",
            Element::String(self.text.clone()),
        )?;
        if let Some(loc) = &self.location {
            put(
                "radiowatch.alert.location",
                "location at alert time",
                Element::PairDouble(loc.lon, loc.lat),
            )?;
        }

        Ok(TrackedElement::new(f_map, Element::Map(m)).into_ref())
    }
}

/// Alerts raised against a packet, attached as a packet component.
#[derive(Debug, Default)]
pub struct AlertComponent {
    alerts: Mutex<Vec<Arc<AlertInfo>>>,
}

impl AlertComponent {
    pub fn push(&self, alert: Arc<AlertInfo>) {
        self.alerts.lock_or_panic().push(alert);
    }

    pub fn snapshot(&self) -> Vec<Arc<AlertInfo>> {
        self.alerts.lock_or_panic().clone()
    }
}

impl PacketComponent for AlertComponent {}

/// Registered alert definition plus its live counters.
#[derive(Debug, Clone)]
struct AlertDef {
    header: String,
    class: String,
    description: String,
    severity: Severity,
    phy: PhyId,
    limit_unit: RateUnit,
    limit_rate: u64,
    burst_unit: RateUnit,
    burst_limit: u64,
    burst_sent: u64,
    total_sent: u64,
    time_last: u64,
}

impl AlertDef {
    /// Window accounting.  Resets stale windows, then answers whether a
    /// fire is currently allowed.  Does not consume.
    fn check_times(&mut self, now: u64) -> bool {
        // Unlimited alerts short-circuit.
        if self.limit_rate == 0 {
            return true;
        }

        if self.time_last < now.saturating_sub(self.limit_unit.window_secs()) {
            self.total_sent = 0;
            self.burst_sent = 0;
            return true;
        }

        if self.time_last < now.saturating_sub(self.burst_unit.window_secs()) {
            self.burst_sent = 0;
        }

        self.burst_sent < self.burst_limit && self.total_sent < self.limit_rate
    }
}

/// Result of a raise attempt.
#[derive(Debug, Clone)]
pub enum RaiseOutcome {
    Raised(Arc<AlertInfo>),
    Suppressed,
}

impl RaiseOutcome {
    pub fn raised(&self) -> bool {
        matches!(self, RaiseOutcome::Raised(_))
    }
}

#[derive(Default)]
struct TrackerState {
    defs: Vec<AlertDef>,
    by_header: HashMap<String, AlertRef>,
    backlog: VecDeque<Arc<AlertInfo>>,
    // `alert=` config lines, applied when their header registers.
    configured: HashMap<String, AlertDefinition>,
}

/// The alert tracker.
pub struct AlertTracker {
    state: Mutex<TrackerState>,
    bus: Arc<EventBus>,
    backlog_size: usize,
    alert_component: ComponentId,
    gps_component: ComponentId,
}

impl AlertTracker {
    pub fn new(
        bus: Arc<EventBus>,
        backlog_size: usize,
        alert_component: ComponentId,
        gps_component: ComponentId,
        configured: &[AlertDefinition],
    ) -> Arc<Self> {
        let mut state = TrackerState::default();
        for def in configured {
            state.configured.insert(def.name.clone(), def.clone());
        }

        Arc::new(AlertTracker {
            state: Mutex::new(state),
            bus,
            backlog_size,
            alert_component,
            gps_component,
        })
    }

    /// Register an alert kind.  Config-file `alert=` lines override the
    /// supplied rates.  Fails on duplicate headers and on a burst window
    /// coarser than the sustained window.
    #[allow(clippy::too_many_arguments)]
    pub fn register_alert(
        &self,
        header: &str,
        class: &str,
        severity: Severity,
        description: &str,
        limit_unit: RateUnit,
        limit_rate: u64,
        burst_unit: RateUnit,
        burst_limit: u64,
        phy: PhyId,
    ) -> Result<AlertRef, AlertError> {
        let header = header.to_uppercase();
        let mut state = self.state.lock_or_panic();

        if state.by_header.contains_key(&header) {
            return Err(AlertError::HeaderExists(header));
        }

        let (limit_unit, limit_rate, burst_unit, burst_limit) =
            match state.configured.get(&header) {
                Some(cfg) => (
                    cfg.limit_unit,
                    cfg.limit_rate,
                    cfg.burst_unit,
                    cfg.burst_rate,
                ),
                None => (limit_unit, limit_rate, burst_unit, burst_limit),
            };

        if burst_unit > limit_unit {
            return Err(AlertError::BurstExceedsLimit(header));
        }

        let r = AlertRef(state.defs.len());
        state.defs.push(AlertDef {
            header: header.clone(),
            class: class.to_string(),
            description: description.to_string(),
            severity,
            phy,
            limit_unit,
            limit_rate,
            burst_unit,
            burst_limit,
            burst_sent: 0,
            total_sent: 0,
            time_last: 0,
        });
        state.by_header.insert(header.clone(), r);
        debug!(header, ref_id = r.0, "registered alert");
        Ok(r)
    }

    pub fn find_alert(&self, header: &str) -> Option<AlertRef> {
        self.state
            .lock_or_panic()
            .by_header
            .get(&header.to_uppercase())
            .copied()
    }

    /// Would a raise be allowed right now?
    pub fn potential_alert(&self, r: AlertRef) -> bool {
        let now = unix_timeval().0;
        let mut state = self.state.lock_or_panic();
        match state.defs.get_mut(r.0) {
            Some(def) => def.check_times(now),
            None => false,
        }
    }

    /// Raise an alert against an optional packet.
    #[allow(clippy::too_many_arguments)]
    pub fn raise_alert(
        &self,
        r: AlertRef,
        packet: Option<&mut Packet>,
        bssid: MacAddr,
        source: MacAddr,
        dest: MacAddr,
        other: MacAddr,
        channel: &str,
        text: String,
    ) -> Result<RaiseOutcome, AlertError> {
        let (now_sec, now_usec) = unix_timeval();
        self.raise_alert_at(
            r, packet, bssid, source, dest, other, channel, text, now_sec, now_usec,
        )
    }

    /// Raise with an explicit timestamp; the deterministic core of
    /// [`Self::raise_alert`].
    #[allow(clippy::too_many_arguments)]
    pub fn raise_alert_at(
        &self,
        r: AlertRef,
        packet: Option<&mut Packet>,
        bssid: MacAddr,
        source: MacAddr,
        dest: MacAddr,
        other: MacAddr,
        channel: &str,
        text: String,
        now_sec: u64,
        now_usec: u32,
    ) -> Result<RaiseOutcome, AlertError> {
        let info = {
            let mut state = self.state.lock_or_panic();
            let def = state.defs.get_mut(r.0).ok_or(AlertError::UnknownRef(r.0))?;

            if !def.check_times(now_sec) {
                return Ok(RaiseOutcome::Suppressed);
            }

            def.burst_sent += 1;
            def.total_sent += 1;
            def.time_last = now_sec;

            let location = packet.as_deref().and_then(|p| {
                p.fetch::<GpsInfo>(self.gps_component)
                    .map(|g| g.location.triplet)
            });

            let info = Arc::new(AlertInfo {
                header: def.header.clone(),
                class: def.class.clone(),
                severity: def.severity,
                phy: def.phy,
                ts_sec: now_sec,
                ts_usec: now_usec,
                bssid,
                source,
                dest,
                other,
                channel: channel.to_string(),
                text,
                location,
            });

            state.backlog.push_back(info.clone());
            while state.backlog.len() > self.backlog_size {
                state.backlog.pop_front();
            }

            info
        };

        if let Some(packet) = packet {
            let component =
                packet.fetch_or_insert(self.alert_component, AlertComponent::default);
            component.push(info.clone());
        }

        info!(header = %info.header, "{}", info.text);
        self.bus
            .publish(Event::new(channels::NEW_ALERT, info.clone()));

        Ok(RaiseOutcome::Raised(info))
    }

    /// Register-if-needed and raise an unlimited alert; used for system
    /// conditions like packet queue overload.
    pub fn raise_one_shot(
        &self,
        header: &str,
        class: &str,
        severity: Severity,
        text: String,
    ) -> Result<RaiseOutcome, AlertError> {
        let r = match self.find_alert(header) {
            Some(r) => r,
            None => self.register_alert(
                header,
                class,
                severity,
                "",
                RateUnit::Day,
                0,
                RateUnit::Second,
                0,
                PHY_ANY,
            )?,
        };
        self.raise_alert(
            r,
            None,
            MacAddr::ZERO,
            MacAddr::ZERO,
            MacAddr::ZERO,
            MacAddr::ZERO,
            "",
            text,
        )
    }

    /// Recent alerts, oldest first.
    pub fn backlog(&self) -> Vec<Arc<AlertInfo>> {
        self.state.lock_or_panic().backlog.iter().cloned().collect()
    }

    /// Definition counters for introspection.
    pub fn definition_stats(&self, r: AlertRef) -> Option<(u64, u64, u64)> {
        self.state
            .lock_or_panic()
            .defs
            .get(r.0)
            .map(|d| (d.burst_sent, d.total_sent, d.time_last))
    }

    /// Snapshot all definitions as an element vector.
    pub fn definitions_element(
        &self,
        registry: &EntryTracker,
    ) -> Result<ElementRef, ElementError> {
        let f_vec = registry.register_field(
            "radiowatch.alert.definition_list",
            ElementBuilder::Type(ElementType::Vector),
            "registered alert definitions",
        )?;
        let f_def = registry.register_field(
            "radiowatch.alert.definition",
            ElementBuilder::Type(ElementType::Map),
            "alert definition",
        )?;

        let state = self.state.lock_or_panic();
        let mut defs = Vec::with_capacity(state.defs.len());
        for def in &state.defs {
            let mut m = KeyedMap::new();
            let mut put = |name: &str, desc: &str, value: Element| -> Result<(), ElementError> {
                let ty = value.element_type();
                let id = registry.register_field(name, ElementBuilder::Type(ty), desc)?;
                m.entries.insert(id, scalar(id, value));
                Ok(())
            };

            put(
                "radiowatch.alert.definition.header",
                "alert type",
                Element::String(def.header.clone()),
            )?;
            put(
                "radiowatch.alert.definition.class",
                "alert class",
                Element::String(def.class.clone()),
            )?;
            put(
                "radiowatch.alert.definition.description",
                "alert description",
                Element::String(def.description.clone()),
            )?;
            put(
                "radiowatch.alert.definition.severity",
                "alert severity",
                Element::U8(def.severity as u8),
            )?;
            put(
                "radiowatch.alert.definition.phy_id",
                "phy binding",
                Element::U32(def.phy),
            )?;
            put(
                "radiowatch.alert.definition.burst_sent",
                "alerts sent in burst window",
                Element::U64(def.burst_sent),
            )?;
            put(
                "radiowatch.alert.definition.total_sent",
                "alerts sent in limit window",
                Element::U64(def.total_sent),
            )?;
            put(
                "radiowatch.alert.definition.time_last",
                "last fire time",
                Element::U64(def.time_last),
            )?;

            defs.push(TrackedElement::new(f_def, Element::Map(m)).into_ref());
        }

        Ok(TrackedElement::new(f_vec, Element::Vector(defs)).into_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> (Arc<AlertTracker>, Arc<EventBus>) {
        let bus = EventBus::new();
        let tracker = AlertTracker::new(bus.clone(), 50, ComponentId(10), ComponentId(11), &[]);
        (tracker, bus)
    }

    fn raise(t: &AlertTracker, r: AlertRef, now: u64) -> bool {
        t.raise_alert_at(
            r,
            None,
            MacAddr::ZERO,
            MacAddr::ZERO,
            MacAddr::ZERO,
            MacAddr::ZERO,
            "6",
            "test alert".to_string(),
            now,
            0,
        )
        .unwrap()
        .raised()
    }

    #[test]
    fn test_register_constraints() {
        let (t, bus) = tracker();

        let r = t
            .register_alert(
                "test",
                "SYSTEM",
                Severity::Medium,
                "d",
                RateUnit::Minute,
                5,
                RateUnit::Second,
                2,
                PHY_ANY,
            )
            .unwrap();
        assert_eq!(t.find_alert("TEST"), Some(r));

        // duplicate header
        assert!(matches!(
            t.register_alert(
                "TEST",
                "SYSTEM",
                Severity::Medium,
                "d",
                RateUnit::Minute,
                5,
                RateUnit::Second,
                2,
                PHY_ANY,
            ),
            Err(AlertError::HeaderExists(_))
        ));

        // burst window coarser than the limit window
        assert!(matches!(
            t.register_alert(
                "OTHER",
                "SYSTEM",
                Severity::Medium,
                "d",
                RateUnit::Second,
                5,
                RateUnit::Minute,
                2,
                PHY_ANY,
            ),
            Err(AlertError::BurstExceedsLimit(_))
        ));

        bus.shutdown();
    }

    #[test]
    fn test_rate_limit_windows() {
        let (t, bus) = tracker();
        let r = t
            .register_alert(
                "TEST",
                "SYSTEM",
                Severity::Medium,
                "d",
                RateUnit::Minute,
                5,
                RateUnit::Second,
                2,
                PHY_ANY,
            )
            .unwrap();

        // 10 raises within half a second: the burst of 2 passes
        let mut delivered = 0;
        for _ in 0..10 {
            if raise(&t, r, 1000) {
                delivered += 1;
            }
        }
        assert_eq!(delivered, 2);

        // burst window expired: one more fits, total now 3
        assert!(raise(&t, r, 1002));

        // a minute later the burst resets again but the sustained limit
        // keeps the total within the window at 5
        let mut late = 0;
        for _ in 0..10 {
            if raise(&t, r, 1061) {
                late += 1;
            }
        }
        assert_eq!(late, 2);
        let (_, total, _) = t.definition_stats(r).unwrap();
        assert_eq!(total, 5);

        // a fully idle limit window resets everything
        assert!(raise(&t, r, 2000));

        bus.shutdown();
    }

    #[test]
    fn test_unlimited_alert() {
        let (t, bus) = tracker();
        let r = t
            .register_alert(
                "LOUD",
                "SYSTEM",
                Severity::Info,
                "d",
                RateUnit::Day,
                0,
                RateUnit::Second,
                0,
                PHY_ANY,
            )
            .unwrap();
        for n in 0..100 {
            assert!(raise(&t, r, 1000 + n));
        }
        bus.shutdown();
    }

    #[test]
    fn test_degenerate_equal_windows() {
        let (t, bus) = tracker();
        // burst_unit == limit_unit degenerates to a single window
        let r = t
            .register_alert(
                "ONEWIN",
                "SYSTEM",
                Severity::Low,
                "d",
                RateUnit::Minute,
                5,
                RateUnit::Minute,
                2,
                PHY_ANY,
            )
            .unwrap();

        assert!(raise(&t, r, 1000));
        assert!(raise(&t, r, 1000));
        // the burst cap binds first within the shared window
        assert!(!raise(&t, r, 1000));
        bus.shutdown();
    }

    #[test]
    fn test_backlog_bounded() {
        let bus = EventBus::new();
        let t = AlertTracker::new(bus.clone(), 3, ComponentId(10), ComponentId(11), &[]);
        let r = t
            .register_alert(
                "RING",
                "SYSTEM",
                Severity::Info,
                "d",
                RateUnit::Day,
                0,
                RateUnit::Second,
                0,
                PHY_ANY,
            )
            .unwrap();

        for n in 0..10u64 {
            t.raise_alert_at(
                r,
                None,
                MacAddr::ZERO,
                MacAddr::ZERO,
                MacAddr::ZERO,
                MacAddr::ZERO,
                "",
                format!("alert {n}"),
                1000 + n,
                0,
            )
            .unwrap();
        }

        let backlog = t.backlog();
        assert_eq!(backlog.len(), 3);
        assert_eq!(backlog[0].text, "alert 7");
        assert_eq!(backlog[2].text, "alert 9");
        bus.shutdown();
    }

    #[test]
    fn test_event_publication_and_packet_attach() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let (t, bus) = tracker();
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        bus.register_listener(&[channels::NEW_ALERT], move |evt| {
            let alert: &Arc<AlertInfo> = evt.payload().unwrap();
            assert_eq!(alert.header, "ATTACH");
            s.fetch_add(1, Ordering::SeqCst);
        });

        let r = t
            .register_alert(
                "ATTACH",
                "SYSTEM",
                Severity::High,
                "d",
                RateUnit::Day,
                0,
                RateUnit::Second,
                0,
                PHY_ANY,
            )
            .unwrap();

        let mut pkt = Packet::new();
        t.raise_alert_at(
            r,
            Some(&mut pkt),
            MacAddr::ZERO,
            MacAddr::ZERO,
            MacAddr::ZERO,
            MacAddr::ZERO,
            "1",
            "attached".to_string(),
            1000,
            0,
        )
        .unwrap();

        let comp = pkt.fetch::<AlertComponent>(ComponentId(10)).unwrap();
        assert_eq!(comp.snapshot().len(), 1);

        bus.flush();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        bus.shutdown();
    }

    #[test]
    fn test_config_overrides_rates() {
        let bus = EventBus::new();
        let configured: AlertDefinition = "noisy,1/min,1/min".parse().unwrap();
        let t = AlertTracker::new(bus.clone(), 50, ComponentId(10), ComponentId(11), &[configured]);

        let r = t
            .register_alert(
                "NOISY",
                "SYSTEM",
                Severity::Info,
                "d",
                RateUnit::Day,
                0,
                RateUnit::Second,
                0,
                PHY_ANY,
            )
            .unwrap();

        assert!(raise(&t, r, 1000));
        assert!(!raise(&t, r, 1001), "configured 1/min rate must bind");
        bus.shutdown();
    }
}
