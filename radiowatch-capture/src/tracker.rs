// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The datasource tracker: owns every source, matches definitions to
//! source builders, and hands out worker assignment ids so one source's
//! packets stay ordered on one chain worker.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use rwcommon::config::SourceDefinition;
use rwcommon::MutexExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::info;
use uuid::Uuid;

use radiowatch_eventbus::EventBus;
use radiowatch_packet::PacketChain;

use crate::command::CommandCallback;
use crate::datasource::{remote_options, Datasource, SourceOptions, SourceState};

/// How to build sources of one type: the helper binary, whether the source
/// is passive (no helper), and which interface names it claims.
#[derive(Debug, Clone)]
pub struct SourceBuilder {
    pub source_type: String,
    pub binary: Option<PathBuf>,
    pub passive: bool,
    pub interface_prefixes: Vec<String>,
}

impl SourceBuilder {
    /// A definition names its type explicitly with `type=`, otherwise the
    /// interface prefix decides.
    pub fn claims(&self, definition: &SourceDefinition) -> bool {
        if let Some(t) = definition.opt("type") {
            return t.eq_ignore_ascii_case(&self.source_type);
        }
        self.interface_prefixes
            .iter()
            .any(|p| definition.interface.to_ascii_lowercase().starts_with(&p.to_ascii_lowercase()))
    }
}

pub struct DatasourceTracker {
    bus: Arc<EventBus>,
    chain: PacketChain,
    runtime: tokio::runtime::Handle,
    builders: Mutex<Vec<SourceBuilder>>,
    sources: Mutex<Vec<Datasource>>,
    next_assignment: AtomicU32,
}

impl DatasourceTracker {
    pub fn new(
        bus: Arc<EventBus>,
        chain: PacketChain,
        runtime: tokio::runtime::Handle,
    ) -> Arc<Self> {
        Arc::new(DatasourceTracker {
            bus,
            chain,
            runtime,
            builders: Mutex::new(Vec::new()),
            sources: Mutex::new(Vec::new()),
            next_assignment: AtomicU32::new(1),
        })
    }

    pub fn register_builder(&self, builder: SourceBuilder) {
        info!(source_type = %builder.source_type, "registered datasource type");
        self.builders.lock_or_panic().push(builder);
    }

    pub fn find_builder(&self, definition: &SourceDefinition) -> Option<SourceBuilder> {
        self.builders
            .lock_or_panic()
            .iter()
            .find(|b| b.claims(definition))
            .cloned()
    }

    /// Parse a definition, resolve its builder, and open the source.
    pub fn open_source(&self, definition: &str, callback: CommandCallback) -> Result<Datasource> {
        let definition: SourceDefinition = definition
            .parse()
            .map_err(|e| anyhow!("invalid source definition: {e}"))?;

        let builder = self
            .find_builder(&definition)
            .ok_or_else(|| anyhow!("no datasource driver claims {:?}", definition.raw))?;

        let opts = SourceOptions::from_definition(
            definition,
            &builder.source_type,
            builder.binary.clone(),
            builder.passive,
            self.next_assignment.fetch_add(1, Ordering::SeqCst),
        );

        let source = Datasource::new(
            opts,
            self.bus.clone(),
            self.chain.clone(),
            self.runtime.clone(),
        );
        self.sources.lock_or_panic().push(source.clone());
        source.open(callback);
        Ok(source)
    }

    /// Probe a definition without keeping the source: used by the REST
    /// surface to answer "would this work".
    pub fn probe_source(&self, definition: &str, callback: CommandCallback) -> Result<Datasource> {
        let definition: SourceDefinition = definition
            .parse()
            .map_err(|e| anyhow!("invalid source definition: {e}"))?;
        let builder = self
            .find_builder(&definition)
            .ok_or_else(|| anyhow!("no datasource driver claims {:?}", definition.raw))?;

        let opts = SourceOptions::from_definition(
            definition,
            &builder.source_type,
            builder.binary.clone(),
            builder.passive,
            0,
        );
        let source = Datasource::new(
            opts,
            self.bus.clone(),
            self.chain.clone(),
            self.runtime.clone(),
        );
        source.probe(callback);
        Ok(source)
    }

    /// Adopt an inbound remote helper connection.  Remote sources are never
    /// retried from this side; the remote reconnects on its own schedule.
    pub fn open_remote<R, W>(
        &self,
        definition: &str,
        read: R,
        write: W,
        callback: CommandCallback,
    ) -> Result<Datasource>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let definition: SourceDefinition = definition
            .parse()
            .map_err(|e| anyhow!("invalid source definition: {e}"))?;

        let mut opts = remote_options(definition, "remote");
        opts.assignment_id = self.next_assignment.fetch_add(1, Ordering::SeqCst);

        let source = Datasource::new(
            opts,
            self.bus.clone(),
            self.chain.clone(),
            self.runtime.clone(),
        );
        self.sources.lock_or_panic().push(source.clone());
        source.open(callback);
        source.start_io(read, write);
        Ok(source)
    }

    pub fn sources(&self) -> Vec<Datasource> {
        self.sources.lock_or_panic().clone()
    }

    pub fn source_by_uuid(&self, uuid: Uuid) -> Option<Datasource> {
        self.sources
            .lock_or_panic()
            .iter()
            .find(|s| s.uuid() == uuid)
            .cloned()
    }

    pub fn running_count(&self) -> usize {
        self.sources
            .lock_or_panic()
            .iter()
            .filter(|s| s.state() == SourceState::Running)
            .count()
    }

    pub fn close_all(&self) {
        for source in self.sources.lock_or_panic().drain(..) {
            source.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use radiowatch_packet::PacketChainConfig;

    fn builder(t: &str, prefixes: &[&str], passive: bool) -> SourceBuilder {
        SourceBuilder {
            source_type: t.to_string(),
            binary: None,
            passive,
            interface_prefixes: prefixes.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_builder_claims() {
        let b = builder("linuxwifi", &["wlan", "wlp"], false);

        assert!(b.claims(&"wlan0".parse().unwrap()));
        assert!(b.claims(&"wlp3s0:name=x".parse().unwrap()));
        assert!(!b.claims(&"hci0".parse().unwrap()));
        // explicit type= overrides prefix matching
        assert!(b.claims(&"weird0:type=linuxwifi".parse().unwrap()));
        assert!(!b.claims(&"wlan0:type=bluetooth".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_open_passive_source_and_lookup() {
        let bus = EventBus::new();
        let chain = PacketChain::new(&PacketChainConfig {
            packet_threads: 1,
            backlog_limit: 0,
            warning_threshold: 0,
        });
        let tracker =
            DatasourceTracker::new(bus.clone(), chain.clone(), tokio::runtime::Handle::current());
        tracker.register_builder(builder("virtual", &["virt"], true));

        let (tx, rx) = tokio::sync::oneshot::channel();
        let source = tracker
            .open_source(
                "virt0:name=testsource",
                Box::new(move |ok, _| {
                    let _ = tx.send(ok);
                }),
            )
            .unwrap();

        assert!(rx.await.unwrap());
        assert_eq!(tracker.running_count(), 1);
        assert_eq!(
            tracker.source_by_uuid(source.uuid()).unwrap().name(),
            "testsource"
        );

        tracker.close_all();
        assert_eq!(tracker.running_count(), 0);
        bus.shutdown();
    }

    #[test]
    fn test_unclaimed_definition_errors() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let _guard = rt.enter();

        let bus = EventBus::new();
        let chain = PacketChain::new(&PacketChainConfig {
            packet_threads: 1,
            backlog_limit: 0,
            warning_threshold: 0,
        });
        let tracker =
            DatasourceTracker::new(bus.clone(), chain.clone(), tokio::runtime::Handle::current());

        let result = tracker.open_source("mystery0", Box::new(|_, _| {}));
        assert!(result.is_err());
        bus.shutdown();
    }
}
