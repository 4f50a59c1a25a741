//! In-process publish/subscribe bus. The tunnel treats the bus as an
//! injected collaborator with a small contract: subscribe by channel regex
//! with a callback, publish `(channel, payload)` tuples, and stamp every
//! delivery with the publishing handle's source id so loop suppression can
//! recognize its own traffic. A broker-backed deployment would implement
//! the same surface.

use chassis::time::timestamp_now;
use hashbrown::HashMap;
use regex::Regex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// One delivered bus message.
#[derive(Debug, Clone)]
pub struct Message {
    pub channel: String,
    pub data: Vec<u8>,
    /// Receive timestamp in microseconds.
    pub recv_utime: i64,
    /// Source id of the publishing handle.
    pub source: u64,
}

pub type Subscription = u64;

type Handler = Arc<dyn Fn(&Message) + Send + Sync>;

struct SubscriptionEntry {
    pattern: Regex,
    handler: Handler,
}

struct BusInner {
    subscriptions: Mutex<HashMap<Subscription, SubscriptionEntry>>,
    next_subscription: AtomicU64,
    next_source: AtomicU64,
}

/// Shared bus state; clone handles off it with [`LocalBus::handle`].
#[derive(Clone)]
pub struct LocalBus {
    inner: Arc<BusInner>,
}

impl LocalBus {
    pub fn new() -> LocalBus {
        LocalBus {
            inner: Arc::new(BusInner {
                subscriptions: Mutex::new(HashMap::new()),
                next_subscription: AtomicU64::new(0),
                next_source: AtomicU64::new(1),
            }),
        }
    }

    /// Creates a handle with its own source id. Clones of a handle share the
    /// id; distinct calls get distinct ids.
    pub fn handle(&self) -> BusHandle {
        BusHandle {
            inner: self.inner.clone(),
            source: self.inner.next_source.fetch_add(1, Ordering::Relaxed),
        }
    }
}

#[derive(Clone)]
pub struct BusHandle {
    inner: Arc<BusInner>,
    source: u64,
}

impl BusHandle {
    pub fn source(&self) -> u64 {
        self.source
    }

    /// Subscribes a callback to every channel matching the anchored pattern
    /// (`^(?:channels)$`). The pattern compiles once, here; the callback
    /// runs on whichever thread publishes.
    pub fn subscribe<F>(&self, channels: &str, handler: F) -> Result<Subscription, regex::Error>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let pattern = Regex::new(&format!("^(?:{})$", channels))?;
        let id = self.inner.next_subscription.fetch_add(1, Ordering::Relaxed);

        self.inner
            .subscriptions
            .lock()
            .expect("bus poisoned")
            .insert(
                id,
                SubscriptionEntry {
                    pattern,
                    handler: Arc::new(handler),
                },
            );

        Ok(id)
    }

    pub fn unsubscribe(&self, subscription: Subscription) {
        self.inner
            .subscriptions
            .lock()
            .expect("bus poisoned")
            .remove(&subscription);
    }

    /// Delivers to every matching subscription, synchronously, on the
    /// calling thread. Matching handlers are snapshotted before invocation
    /// so a handler may publish or (un)subscribe without deadlocking.
    pub fn publish(&self, channel: &str, data: &[u8]) {
        let message = Message {
            channel: channel.to_owned(),
            data: data.to_vec(),
            recv_utime: timestamp_now(),
            source: self.source,
        };

        let handlers: Vec<Handler> = {
            let subscriptions = self.inner.subscriptions.lock().expect("bus poisoned");
            subscriptions
                .values()
                .filter(|entry| entry.pattern.is_match(channel))
                .map(|entry| entry.handler.clone())
                .collect()
        };

        for handler in handlers {
            handler(&message);
        }
    }
}
