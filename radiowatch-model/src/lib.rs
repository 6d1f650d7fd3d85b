// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Tracked element model.
//!
//! Every long-lived record in the server (devices, SSIDs, alerts, RRDs,
//! datasource state) is a tree of typed, introspectable elements rooted in
//! a map.  Elements carry the field id they were registered under in the
//! [`fields::EntryTracker`], which maps ids to names and descriptions and
//! owns the serializer registry.
//!
//! The model deliberately separates *shape* from *storage*: map and vector
//! children are allocated lazily on first write, so a device record that
//! never sees an EAPOL handshake never pays for the handshake sub-tree.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

pub mod element;
pub mod fields;
pub mod location;
pub mod rrd;
pub mod serialize;
pub mod summary;

pub use element::{
    Element, ElementError, ElementRef, ElementType, KeyedMap, OrderedF64, SerializeHook,
    TrackedElement, WeakElementRef,
};
pub use fields::{ElementBuilder, EntryTracker, FieldId};
pub use serialize::{sanitize_string, RenameMap, Serializer};
pub use summary::{summarize, SummaryField};
