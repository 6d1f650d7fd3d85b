// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Packet model and processing pipeline.
//!
//! A packet is a bundle of typed components indexed by a dense component id;
//! the chain pushes every packet through ordered stage lists on a pool of
//! worker threads, deduplicating identical frames and keeping per-source
//! ordering by pinning packets with the same assignment id to one worker.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

pub mod chain;
pub mod filters;
pub mod packet;

pub use chain::{ChainStage, HandlerId, PacketChain, PacketChainConfig};
pub use packet::{
    CommonInfo, ComponentId, DatasourceInfo, GpsInfo, JsonInfo, LinkFrame, MetaBlob, NoGps,
    Packet, PacketComponent, PacketRef, PhyId, SignalAggregate, SignalInfo,
};
