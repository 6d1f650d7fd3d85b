// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Capture-helper wire protocol.
//!
//! Two generations share one length-prefixed outer frame (`u32 BE length ||
//! body`):
//!
//! * **v3**: a fixed binary header (`u16 command`, `u16 code`, `u32 seqno`)
//!   followed by a MessagePack body whose maps are keyed by small integers.
//! * **v2** (legacy fallback): a protobuf `Command { command, content }`
//!   envelope, hand-coded; the message set is small and stable enough that
//!   generated code buys nothing.
//!
//! The first body byte discriminates: v3 command ids stay below 256 so a v3
//! body always opens with `0x00`, while a v2 envelope always opens with the
//! protobuf tag for field 1 (`0x0A`).

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

pub mod blocks;
pub mod frame;
pub mod v2;
pub mod v3;

/// Errors shared by both codec generations.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum DecodeError {
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),
    #[error("truncated frame")]
    Truncated,
    #[error("unknown protocol discriminator {0:#04x}")]
    UnknownProtocol(u8),
    #[error("unknown command {0}")]
    UnknownCommand(u16),
    #[error("invalid msgpack: {0}")]
    InvalidMsgpack(String),
    #[error("missing field {field} in {context}")]
    MissingField {
        context: &'static str,
        field: u32,
    },
    #[error("field {field} in {context} has the wrong type")]
    WrongType {
        context: &'static str,
        field: u32,
    },
    #[error("invalid protobuf: {0}")]
    InvalidProtobuf(&'static str),
    #[error("invalid utf8 in {0}")]
    InvalidUtf8(&'static str),
}
