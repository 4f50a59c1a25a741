//! Loop suppression. The tunnel republishes everything it receives, so its
//! own publishes come straight back through its bus subscriptions; without a
//! way to recognize them, two tunnelled processes would bounce every message
//! forever. `Introspect` publishes a random token on a dedicated channel,
//! watches for it on its own subscription and remembers the source id it
//! arrived with. Anything carrying that source afterwards is our own
//! traffic. Probes are re-sent periodically in case the identity under the
//! handle changes.

use crate::bus::{BusHandle, Message};
use byteorder::{BigEndian, ByteOrder};
use chassis::logging::{self, Logger};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Channel the identification probes travel on.
pub const INTROSPECT_CHANNEL: &str = "INTROSPECT";

/// Default re-probe period.
pub const DEFAULT_REFRESH: Duration = Duration::from_secs(30);

struct State {
    self_source: Option<u64>,
    last_probe: Option<Instant>,
}

#[derive(Clone)]
pub struct Introspect {
    token: u64,
    handle: BusHandle,
    state: Arc<Mutex<State>>,
    refresh: Duration,
    log: Logger,
}

impl Introspect {
    /// Subscribes to the probe channel and sends the first probe. With an
    /// in-process bus the round trip is synchronous, so the suppressor knows
    /// its own source before this returns.
    pub fn new(handle: BusHandle, refresh: Duration, log: Logger) -> Introspect {
        let token = rand::random::<u64>();
        let state = Arc::new(Mutex::new(State {
            self_source: None,
            last_probe: None,
        }));

        let callback_state = state.clone();
        let callback_log = log.clone();
        handle
            .subscribe(INTROSPECT_CHANNEL, move |msg: &Message| {
                if msg.data.len() == 8 && BigEndian::read_u64(&msg.data) == token {
                    let mut state = callback_state.lock().expect("introspect poisoned");
                    if state.self_source != Some(msg.source) {
                        logging::debug!(callback_log, "learned own bus source"; "source" => msg.source);
                        state.self_source = Some(msg.source);
                    }
                }
            })
            .expect("static probe pattern compiles");

        let introspect = Introspect {
            token,
            handle,
            state,
            refresh,
            log,
        };
        introspect.send_probe();
        introspect
    }

    /// Publishes one identification probe.
    pub fn send_probe(&self) {
        logging::trace!(self.log, "sending introspection probe");

        let mut payload = [0u8; 8];
        BigEndian::write_u64(&mut payload, self.token);
        self.handle.publish(INTROSPECT_CHANNEL, &payload);

        self.state.lock().expect("introspect poisoned").last_probe = Some(Instant::now());
    }

    /// Re-probes once the refresh period has elapsed.
    pub fn refresh(&self, now: Instant) {
        let due = {
            let state = self.state.lock().expect("introspect poisoned");
            match state.last_probe {
                Some(last) => now.duration_since(last) >= self.refresh,
                None => true,
            }
        };

        if due {
            self.send_probe();
        }
    }

    /// True when the message was published by this process.
    pub fn is_from_self(&self, msg: &Message) -> bool {
        let state = self.state.lock().expect("introspect poisoned");
        state.self_source.is_some() && state.self_source == Some(msg.source)
    }
}
