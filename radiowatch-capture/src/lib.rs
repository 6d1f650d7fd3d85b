// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Datasource management: the server-side life of a capture helper.
//!
//! Each datasource owns one helper session, either a local child process
//! on a pipe pair or an inbound remote socket, and runs its state machine
//! (idle, probing, listing, opening, running, erroring) over the shared
//! tokio reactor.  Reads happen on a per-source reader task; writes go
//! through a single writer task per source so the socket never interleaves.
//!
//! Outstanding requests correlate replies by sequence number and fire their
//! callback exactly once, including cancellation on close.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

pub mod channels;
pub mod command;
pub mod datasource;
pub mod tracker;

pub use channels::merge_channels;
pub use command::{CommandCallback, CommandMap, TrackedCommand};
pub use datasource::{Datasource, DatasourceEvent, SourceOptions, SourceState};
pub use tracker::{DatasourceTracker, SourceBuilder};
