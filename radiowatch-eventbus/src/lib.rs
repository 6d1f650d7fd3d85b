// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-process event bus.
//!
//! Components publish typed events onto named channels; one dispatcher
//! thread drains the FIFO queue and invokes every listener on the event's
//! channel plus every listener on the wildcard channel `*`.  Publishing
//! never blocks the publisher, delivery is in publish order per publisher,
//! and a panicking listener is logged and skipped, never fatal.
//!
//! Two locks on purpose: the queue mutex only covers enqueue/dequeue so
//! publishers stay fast, while the handler mutex serializes dispatch against
//! listener registration and removal.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use rwcommon::MutexExt;
use tracing::{error, trace};

/// Channel that receives every event regardless of its own channel.
pub const WILDCARD_CHANNEL: &str = "*";

/// Well-known channels published by the core components.
pub mod channels {
    pub const DATASOURCE_OPENED: &str = "DATASOURCE_OPENED";
    pub const DATASOURCE_CLOSED: &str = "DATASOURCE_CLOSED";
    pub const DATASOURCE_ERROR: &str = "DATASOURCE_ERROR";
    pub const DATASOURCE_PAUSED: &str = "DATASOURCE_PAUSED";
    pub const DATASOURCE_RESUMED: &str = "DATASOURCE_RESUMED";
    pub const NEW_PHY: &str = "NEW_PHY";
    pub const NEW_DEVICE: &str = "NEW_DEVICE";
    pub const NEW_ALERT: &str = "NEW_ALERT";
    pub const MESSAGE: &str = "MESSAGE";
    pub const TIMESTAMP: &str = "TIMESTAMP";
    pub const BATTERY: &str = "BATTERY";
    pub const SYSTEM_STATS: &str = "STATS";
    pub const PACKET_STATS: &str = "PACKET_STATS";
    pub const DB_LOG_OPEN: &str = "DB_LOG_OPEN";
}

/// Human-readable message published on the MESSAGE channel; mirrored into
/// the run log when one is open.
#[derive(Debug, Clone)]
pub struct MessageEvent {
    pub ts_sec: u64,
    pub msg_type: String,
    pub text: String,
}

/// One published event: a channel name plus a shared, type-erased payload.
/// Listeners downcast to the publisher's concrete payload type.
#[derive(Clone)]
pub struct Event {
    channel: String,
    payload: Arc<dyn Any + Send + Sync>,
}

impl Event {
    pub fn new<P: Any + Send + Sync>(channel: impl Into<String>, payload: P) -> Self {
        Event {
            channel: channel.into(),
            payload: Arc::new(payload),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn payload<P: Any + Send + Sync>(&self) -> Option<&P> {
        self.payload.downcast_ref()
    }
}

pub type ListenerId = u64;

type ListenerFn = Arc<dyn Fn(&Event) + Send + Sync>;

struct Listener {
    id: ListenerId,
    channels: Vec<String>,
    callback: ListenerFn,
}

#[derive(Default)]
struct HandlerTable {
    next_id: ListenerId,
    by_channel: HashMap<String, Vec<Arc<Listener>>>,
    by_id: HashMap<ListenerId, Arc<Listener>>,
}

enum QueueItem {
    Event(Event),
    Flush(Arc<(Mutex<bool>, Condvar)>),
}

struct EventQueue {
    items: VecDeque<QueueItem>,
    shutdown: bool,
}

/// The bus.  Create once, share by `Arc`.
pub struct EventBus {
    queue: Arc<Mutex<EventQueue>>,
    queue_cv: Arc<Condvar>,
    handlers: Arc<Mutex<HandlerTable>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        let queue = Arc::new(Mutex::new(EventQueue {
            items: VecDeque::new(),
            shutdown: false,
        }));
        let queue_cv = Arc::new(Condvar::new());
        let handlers = Arc::new(Mutex::new(HandlerTable {
            next_id: 1,
            ..Default::default()
        }));

        let bus = Arc::new(EventBus {
            queue: queue.clone(),
            queue_cv: queue_cv.clone(),
            handlers: handlers.clone(),
            dispatcher: Mutex::new(None),
        });

        let thread = std::thread::Builder::new()
            .name("rw-eventbus".to_string())
            .spawn(move || Self::dispatch_loop(queue, queue_cv, handlers));

        match thread {
            Ok(h) => *bus.dispatcher.lock_or_panic() = Some(h),
            Err(e) => error!("failed to spawn eventbus dispatcher: {e}"),
        }

        bus
    }

    fn dispatch_loop(
        queue: Arc<Mutex<EventQueue>>,
        queue_cv: Arc<Condvar>,
        handlers: Arc<Mutex<HandlerTable>>,
    ) {
        loop {
            let item = {
                let mut q = queue.lock_or_panic();
                loop {
                    if let Some(item) = q.items.pop_front() {
                        break item;
                    }
                    if q.shutdown {
                        return;
                    }
                    q = match queue_cv.wait(q) {
                        Ok(g) => g,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                }
            };

            match item {
                QueueItem::Flush(gate) => {
                    let (lock, cv) = &*gate;
                    *lock.lock_or_panic() = true;
                    cv.notify_all();
                }
                QueueItem::Event(event) => {
                    // Snapshot the listener lists under the handler mutex,
                    // invoke outside the queue lock.  A listener removed
                    // mid-dispatch may still see this event.
                    let targets: Vec<ListenerFn> = {
                        let table = handlers.lock_or_panic();
                        let mut targets = Vec::new();
                        if let Some(list) = table.by_channel.get(event.channel()) {
                            targets.extend(list.iter().map(|l| l.callback.clone()));
                        }
                        if let Some(list) = table.by_channel.get(WILDCARD_CHANNEL) {
                            targets.extend(list.iter().map(|l| l.callback.clone()));
                        }
                        targets
                    };

                    trace!(
                        channel = event.channel(),
                        listeners = targets.len(),
                        "dispatching event"
                    );

                    for cb in targets {
                        if catch_unwind(AssertUnwindSafe(|| cb(&event))).is_err() {
                            error!(
                                channel = event.channel(),
                                "event listener panicked; continuing"
                            );
                        }
                    }
                }
            }
        }
    }

    /// Enqueue an event.  Never blocks on listeners.
    pub fn publish(&self, event: Event) {
        let mut q = self.queue.lock_or_panic();
        if q.shutdown {
            return;
        }
        q.items.push_back(QueueItem::Event(event));
        drop(q);
        self.queue_cv.notify_one();
    }

    /// Block until everything queued before this call has dispatched.
    /// Test and shutdown aid; not for the hot path.
    pub fn flush(&self) {
        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        {
            let mut q = self.queue.lock_or_panic();
            if q.shutdown {
                return;
            }
            q.items.push_back(QueueItem::Flush(gate.clone()));
        }
        self.queue_cv.notify_one();

        let (lock, cv) = &*gate;
        let mut done = lock.lock_or_panic();
        while !*done {
            done = match cv.wait(done) {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    pub fn register_listener<F>(&self, channels: &[&str], callback: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let mut table = self.handlers.lock_or_panic();
        let id = table.next_id;
        table.next_id += 1;

        let listener = Arc::new(Listener {
            id,
            channels: channels.iter().map(|s| s.to_string()).collect(),
            callback: Arc::new(callback),
        });

        for channel in &listener.channels {
            table
                .by_channel
                .entry(channel.clone())
                .or_default()
                .push(listener.clone());
        }
        table.by_id.insert(id, listener);

        id
    }

    /// Remove a listener from every channel it subscribed to.
    pub fn remove_listener(&self, id: ListenerId) {
        let mut table = self.handlers.lock_or_panic();
        let Some(listener) = table.by_id.remove(&id) else {
            return;
        };
        for channel in &listener.channels {
            if let Some(list) = table.by_channel.get_mut(channel) {
                list.retain(|l| l.id != id);
                if list.is_empty() {
                    table.by_channel.remove(channel);
                }
            }
        }
    }

    /// Stop the dispatcher.  Queued events that have not dispatched yet are
    /// dropped.
    pub fn shutdown(&self) {
        {
            let mut q = self.queue.lock_or_panic();
            q.shutdown = true;
        }
        self.queue_cv.notify_all();

        if let Some(handle) = self.dispatcher.lock_or_panic().take() {
            if handle.join().is_err() {
                error!("eventbus dispatcher panicked during shutdown");
            }
        }
    }
}
