use crate::bus::BusHandle;
use crate::introspect::Introspect;
use crate::net::endpoint::{Delivery, Tunnel, TunnelAction};
use crate::net::frame::TunnelParams;
use crate::net::support::NetworkResult;
use chassis::logging::{self, Logger};
use chassis::time::timestamp_now;
use indexmap::IndexSet;
use mio::net::TcpListener;
use mio::{Events, Poll, PollOpt, Ready, Token};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

const LISTENER_TOKEN: Token = Token(0);
const TOKEN_BASE: usize = 2;

fn tcp_token(id: usize) -> Token {
    Token(TOKEN_BASE + id * 2)
}

fn udp_token(id: usize) -> Token {
    Token(TOKEN_BASE + id * 2 + 1)
}

fn token_slot(token: Token) -> (usize, bool) {
    let raw = token.0 - TOKEN_BASE;
    (raw / 2, raw % 2 == 1)
}

/// Accepts inbound tunnel connections, owns the set of endpoints and drives
/// every socket from a single-threaded reactor. Endpoints transmit from
/// their own send threads; the reactor only reads (and writes the small
/// handshake replies).
pub struct TunnelServer {
    listener: TcpListener,
    poll: Poll,
    events: Events,

    tunnels: Vec<Option<Tunnel>>,
    free: Vec<usize>,
    live: IndexSet<usize>,

    bus: BusHandle,
    introspect: Introspect,
    log: Logger,
}

impl TunnelServer {
    const POLL_INTERVAL: Duration = Duration::from_millis(250);
    const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);

    /// Binds the control port and registers the accept handler. Port 0
    /// picks an ephemeral port, observable via `local_port`.
    pub fn new(port: u16, bus: BusHandle, introspect: Introspect, log: &Logger) -> NetworkResult<TunnelServer> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let listener = TcpListener::bind(&addr)?;

        let poll = Poll::new()?;
        poll.register(&listener, LISTENER_TOKEN, Ready::readable(), PollOpt::edge())?;

        let log = log.new(logging::o!("port" => listener.local_addr()?.port()));
        logging::info!(log, "tunnel server listening");

        Ok(TunnelServer {
            listener,
            poll,
            events: Events::with_capacity(1024),
            tunnels: Vec::new(),
            free: Vec::new(),
            live: IndexSet::new(),
            bus,
            introspect,
            log,
        })
    }

    pub fn local_port(&self) -> u16 {
        self.listener.local_addr().expect("bound listener").port()
    }

    /// Number of live endpoints.
    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Opens a client-initiated tunnel to a remote server. `params.channels`
    /// is what we forward out; `channels_recv` is what we ask the remote end
    /// to send back.
    pub fn connect_to_peer(
        &mut self,
        addr: &SocketAddr,
        params: TunnelParams,
        channels_recv: &str,
    ) -> NetworkResult<()> {
        let tunnel = Tunnel::initiate(
            addr,
            params,
            channels_recv,
            self.bus.clone(),
            self.introspect.clone(),
            &self.log,
        )?;
        let id = self.insert(tunnel);

        let tunnel = self.tunnels[id].as_ref().expect("just inserted");
        self.poll.register(
            tunnel.tcp_stream().expect("fresh tunnel keeps its control stream"),
            tcp_token(id),
            Ready::readable(),
            PollOpt::edge(),
        )?;

        Ok(())
    }

    /// Drives the reactor until `stop` is raised. Housekeeping (introspect
    /// refresh) runs between poll rounds.
    pub fn run(&mut self, stop: &AtomicBool) -> io::Result<()> {
        let mut last_housekeeping = Instant::now();

        while !stop.load(Ordering::Relaxed) {
            self.poll.poll(&mut self.events, Some(Self::POLL_INTERVAL))?;

            let tokens: Vec<Token> = self.events.iter().map(|event| event.token()).collect();
            for token in tokens {
                self.dispatch(token);
            }

            let now = Instant::now();
            if now.duration_since(last_housekeeping) >= Self::HOUSEKEEPING_INTERVAL {
                self.introspect.refresh(now);
                last_housekeeping = now;
            }
        }

        Ok(())
    }

    /// Runs one non-blocking reactor round. Exposed so callers embedding
    /// the server in their own loop (and tests) can drive it manually.
    pub fn poll_once(&mut self) -> io::Result<()> {
        self.poll.poll(&mut self.events, Some(Duration::from_millis(0)))?;

        let tokens: Vec<Token> = self.events.iter().map(|event| event.token()).collect();
        for token in tokens {
            self.dispatch(token);
        }

        Ok(())
    }

    fn dispatch(&mut self, token: Token) {
        if token == LISTENER_TOKEN {
            self.accept_pending();
            return;
        }

        let (id, is_udp) = token_slot(token);
        if id >= self.tunnels.len() || self.tunnels[id].is_none() {
            // stale event for a slot already torn down
            return;
        }

        let mut deliveries = Vec::new();
        let action = {
            let tunnel = self.tunnels[id].as_mut().expect("checked above");
            if is_udp {
                tunnel.on_udp_readable(&mut deliveries)
            } else {
                tunnel.on_tcp_readable(&mut deliveries)
            }
        };

        self.fan_out(deliveries, id);

        match action {
            TunnelAction::Continue => (),
            TunnelAction::UdpReady => self.switch_to_udp(id),
            TunnelAction::Disconnect => self.disconnect(id),
        }
    }

    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    let tunnel = Tunnel::accepted(stream, self.bus.clone(), self.introspect.clone(), &self.log);
                    let id = self.insert(tunnel);

                    let register_result = {
                        let tunnel = self.tunnels[id].as_ref().expect("just inserted");
                        self.poll.register(
                            tunnel.tcp_stream().expect("accepted tunnel keeps its stream"),
                            tcp_token(id),
                            Ready::readable(),
                            PollOpt::edge(),
                        )
                    };

                    if let Err(err) = register_result {
                        logging::error!(self.log, "failed to register accepted connection"; "error" => %err);
                        self.disconnect(id);
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    logging::error!(self.log, "accept failed"; "error" => %err);
                    return;
                }
            }
        }
    }

    fn insert(&mut self, tunnel: Tunnel) -> usize {
        let id = match self.free.pop() {
            Some(id) => {
                self.tunnels[id] = Some(tunnel);
                id
            }
            None => {
                self.tunnels.push(Some(tunnel));
                self.tunnels.len() - 1
            }
        };
        self.live.insert(id);
        id
    }

    /// Publishes received messages on the local bus and relays them to every
    /// other matching endpoint. Besides the origin, endpoints whose own wire
    /// socket was the source of the message are skipped; without that, a
    /// tunnel connected to its own listener would relay each batch back out
    /// over the same connection forever.
    fn fan_out(&self, deliveries: Vec<Delivery>, origin: usize) {
        if deliveries.is_empty() {
            return;
        }

        let origin_peer = self.tunnels[origin].as_ref().and_then(|t| t.wire_peer_addr());

        for delivery in deliveries {
            let mut looped = false;

            for &id in self.live.iter() {
                if id == origin {
                    continue;
                }
                let tunnel = match &self.tunnels[id] {
                    Some(tunnel) => tunnel,
                    None => continue,
                };
                if !tunnel.matches(&delivery.channel) {
                    continue;
                }
                if let (Some(local), Some(peer)) = (tunnel.wire_local_addr(), origin_peer) {
                    if same_socket(local, peer) {
                        looped = true;
                        continue;
                    }
                }

                logging::trace!(self.log, "relaying to peer";
                                "channel" => %delivery.channel,
                                "peer" => tunnel.name());
                tunnel.enqueue(&delivery.channel, &delivery.data, timestamp_now());
            }

            if looped && self.matches_any(&delivery.channel) {
                logging::warn!(self.log, "loop scenario: own traffic came back on a forwarded channel";
                               "channel" => %delivery.channel);
            }

            logging::debug!(self.log, "publishing";
                            "channel" => %delivery.channel,
                            "len" => delivery.data.len());
            self.bus.publish(&delivery.channel, &delivery.data);
        }
    }

    /// True when any live endpoint forwards the channel.
    pub fn matches_any(&self, channel: &str) -> bool {
        self.live.iter().any(|&id| {
            self.tunnels[id]
                .as_ref()
                .map_or(false, |tunnel| tunnel.matches(channel))
        })
    }

    fn switch_to_udp(&mut self, id: usize) {
        let register_result = {
            let tunnel = self.tunnels[id].as_mut().expect("live tunnel");
            if let Some(stream) = tunnel.tcp_stream() {
                let _ = self.poll.deregister(stream);
            }
            tunnel.close_tcp();

            let sock = tunnel.udp_socket().expect("udp transport negotiated");
            self.poll.register(sock, udp_token(id), Ready::readable(), PollOpt::edge())
        };

        if let Err(err) = register_result {
            logging::error!(self.log, "failed to register datagram socket"; "error" => %err);
            self.disconnect(id);
        }
    }

    /// Removes and tears down one endpoint. Failures never cross endpoints:
    /// everything here is per-slot.
    pub fn disconnect(&mut self, id: usize) {
        if id >= self.tunnels.len() {
            return;
        }

        if let Some(mut tunnel) = self.tunnels[id].take() {
            if let Some(stream) = tunnel.tcp_stream() {
                let _ = self.poll.deregister(stream);
            }
            if let Some(sock) = tunnel.udp_socket() {
                let _ = self.poll.deregister(sock);
            }
            tunnel.shutdown();

            self.live.remove(&id);
            self.free.push(id);
        }
    }

    /// Tears down every endpoint, joining their send threads.
    pub fn shutdown_all(&mut self) {
        for id in 0..self.tunnels.len() {
            self.disconnect(id);
        }
    }
}

impl Drop for TunnelServer {
    fn drop(&mut self) {
        self.shutdown_all();
    }
}

fn same_socket(local: SocketAddr, peer: SocketAddr) -> bool {
    local.port() == peer.port()
        && (local.ip() == peer.ip() || (local.ip().is_unspecified() && peer.ip().is_loopback()))
}
