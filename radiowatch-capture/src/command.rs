// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Outstanding-command correlation.
//!
//! Every request to a helper carries a sequence number; the matching report
//! echoes it.  The map holds one callback per outstanding seqno and
//! guarantees exactly-once invocation: a reply consumes the entry, close
//! cancels every remaining entry with `(false, reason)`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use rwcommon::MutexExt;
use tracing::debug;

/// Reply callback: `(success, message)`.
pub type CommandCallback = Box<dyn FnOnce(bool, &str) + Send>;

/// What kind of reply an outstanding command expects; used for sanity
/// logging when a helper answers with the wrong report type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Probe,
    List,
    Open,
    Configure,
}

pub struct TrackedCommand {
    pub transaction_id: u32,
    pub kind: CommandKind,
    pub callback: CommandCallback,
}

#[derive(Default)]
pub struct CommandMap {
    next_seqno: AtomicU32,
    next_transaction: AtomicU32,
    outstanding: Mutex<HashMap<u32, TrackedCommand>>,
}

impl CommandMap {
    pub fn new() -> Self {
        CommandMap {
            next_seqno: AtomicU32::new(1),
            next_transaction: AtomicU32::new(1),
            outstanding: Mutex::new(HashMap::new()),
        }
    }

    pub fn next_transaction(&self) -> u32 {
        self.next_transaction.fetch_add(1, Ordering::SeqCst)
    }

    /// Allocate a seqno and park the callback under it.
    pub fn track(&self, kind: CommandKind, transaction_id: u32, callback: CommandCallback) -> u32 {
        let seqno = self.next_seqno.fetch_add(1, Ordering::SeqCst);
        self.outstanding.lock_or_panic().insert(
            seqno,
            TrackedCommand {
                transaction_id,
                kind,
                callback,
            },
        );
        seqno
    }

    /// Consume the entry for a reply.  Returns the command so the caller
    /// can inspect its kind and fire the callback; `None` for unknown or
    /// already-answered seqnos.
    pub fn complete(&self, seqno: u32) -> Option<TrackedCommand> {
        let cmd = self.outstanding.lock_or_panic().remove(&seqno);
        if cmd.is_none() {
            debug!(seqno, "reply for unknown or already-completed command");
        }
        cmd
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.lock_or_panic().len()
    }

    /// Cancel everything, invoking each callback once with failure.
    pub fn cancel_all(&self, reason: &str) {
        let drained: Vec<TrackedCommand> = {
            let mut map = self.outstanding.lock_or_panic();
            map.drain().map(|(_, cmd)| cmd).collect()
        };
        for cmd in drained {
            (cmd.callback)(false, reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_reply_fires_exactly_once() {
        let map = CommandMap::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let f = fired.clone();
        let seqno = map.track(
            CommandKind::Open,
            map.next_transaction(),
            Box::new(move |ok, msg| {
                assert!(ok);
                assert_eq!(msg, "opened");
                f.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let cmd = map.complete(seqno).unwrap();
        (cmd.callback)(true, "opened");
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // second reply with the same seqno finds nothing
        assert!(map.complete(seqno).is_none());
    }

    #[test]
    fn test_seqnos_are_distinct() {
        let map = CommandMap::new();
        let a = map.track(CommandKind::Probe, 1, Box::new(|_, _| {}));
        let b = map.track(CommandKind::List, 2, Box::new(|_, _| {}));
        assert_ne!(a, b);
        assert_eq!(map.outstanding_count(), 2);
    }

    #[test]
    fn test_cancel_all_fails_everything_once() {
        let map = CommandMap::new();
        let fired = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let f = fired.clone();
            map.track(
                CommandKind::Configure,
                map.next_transaction(),
                Box::new(move |ok, msg| {
                    assert!(!ok);
                    assert_eq!(msg, "source closed");
                    f.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }

        map.cancel_all("source closed");
        assert_eq!(fired.load(Ordering::SeqCst), 5);
        assert_eq!(map.outstanding_count(), 0);

        // cancelling again is a no-op
        map.cancel_all("source closed");
        assert_eq!(fired.load(Ordering::SeqCst), 5);
    }
}
