use crate::bus::{BusHandle, Subscription};
use crate::introspect::Introspect;
use crate::net::fragment::{Fragmenter, Reassembler};
use crate::net::frame::{self, TunnelParams, UdpHeader};
use crate::net::queue::{QueueEntry, SendQueue};
use crate::net::support::{self, ErrorType, NetworkError, NetworkResult};
use crate::net::UDP_DATAGRAM_MAX;
use byteorder::{BigEndian, WriteBytesExt};
use chassis::logging::{self, Logger};
use chassis::time::timestamp_now;
use mio::net::{TcpStream, UdpSocket};
use mio::{Events, Poll, PollOpt, Ready, Token};
use regex::Regex;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Shutdown, SocketAddr};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Receive-side phase of a tunnel. A server-accepted endpoint starts in
/// `ClientMsgSz` waiting for the peer's subscription request; a
/// client-initiated endpoint waits for the UDP port reply (`ServerMsgSz`)
/// or goes straight to streaming records (`RecvChanSz`). Each phase knows
/// how many bytes it needs before it can advance.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TunnelState {
    ClientMsgSz,
    ClientMsgData,
    ServerMsgSz,
    ServerMsgData,
    RecvChanSz,
    RecvChan,
    RecvDataSz,
    RecvData,
    Closed,
}

/// What the reactor must do after a readiness dispatch.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TunnelAction {
    Continue,
    /// The handshake switched to datagrams: close the control stream and
    /// start watching the UDP socket.
    UdpReady,
    Disconnect,
}

/// One message parsed off the wire, pending local publish and fan-out.
#[derive(Debug)]
pub struct Delivery {
    pub channel: String,
    pub data: Vec<u8>,
}

/// A single peer's tunnel session: the handshake state machine, the receive
/// decoder and the transmit side. The reactor owns the sockets for reading;
/// a dedicated send thread drains the queue and writes.
pub struct Tunnel {
    name: String,
    state: TunnelState,
    params: Option<TunnelParams>,
    matcher: Option<Regex>,

    tcp: Option<TcpStream>,
    udp: Option<UdpSocket>,
    wire_peer: Option<SocketAddr>,
    wire_local: Option<SocketAddr>,

    recv_buf: Vec<u8>,
    bytes_read: usize,
    bytes_to_read: usize,
    recv_channel: String,
    reassembler: Option<Reassembler>,
    last_recv_error_log: i64,

    queue: Arc<SendQueue>,
    send_thread: Option<JoinHandle<()>>,
    subscription: Option<Subscription>,

    bus: BusHandle,
    introspect: Introspect,
    log: Logger,
}

fn any_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
}

impl Tunnel {
    /// Endpoint for an accepted inbound connection. Stays passive until the
    /// peer's subscription request arrives.
    pub fn accepted(stream: TcpStream, bus: BusHandle, introspect: Introspect, log: &Logger) -> Tunnel {
        let name = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_owned());
        let log = log.new(logging::o!("peer" => name.clone()));
        logging::info!(log, "accepted tunnel connection");

        Tunnel {
            name,
            state: TunnelState::ClientMsgSz,
            params: None,
            matcher: None,
            tcp: Some(stream),
            udp: None,
            wire_peer: None,
            wire_local: None,
            recv_buf: Vec::new(),
            bytes_read: 0,
            bytes_to_read: 4,
            recv_channel: String::new(),
            reassembler: None,
            last_recv_error_log: -1,
            queue: Arc::new(SendQueue::new(log.clone())),
            send_thread: None,
            subscription: None,
            bus,
            introspect,
            log,
        }
    }

    /// Endpoint initiating a connection to a remote tunnel server. Sends the
    /// subscription request immediately; `params.channels` is what *we*
    /// forward out, `channels_recv` is what we ask the remote end to send
    /// back. In UDP mode the local datagram socket is bound first so its
    /// port can ride along in the request.
    pub fn initiate(
        addr: &SocketAddr,
        mut params: TunnelParams,
        channels_recv: &str,
        bus: BusHandle,
        introspect: Introspect,
        log: &Logger,
    ) -> NetworkResult<Tunnel> {
        let udp = if params.udp {
            let sock = UdpSocket::bind(&any_addr())?;
            params.udp_port = sock.local_addr()?.port();
            Some(sock)
        } else {
            None
        };

        let stream = std::net::TcpStream::connect(addr)?;
        let name = addr.to_string();
        let log = log.new(logging::o!("peer" => name.clone()));
        logging::info!(log, "connected to tunnel server";
                       "send_channels" => %params.channels,
                       "recv_channels" => channels_recv,
                       "udp" => params.udp);

        let mut request = params.clone();
        request.channels = channels_recv.to_owned();
        support::write_fully(&stream, &frame::encode_length_prefixed(&request.encode()))?;

        stream.set_nonblocking(true)?;
        let stream = TcpStream::from_stream(stream)?;

        let state = if params.udp {
            TunnelState::ServerMsgSz
        } else {
            TunnelState::RecvChanSz
        };

        let mut tunnel = Tunnel {
            name,
            state,
            params: Some(params.clone()),
            matcher: None,
            tcp: Some(stream),
            udp,
            wire_peer: None,
            wire_local: None,
            recv_buf: Vec::new(),
            bytes_read: 0,
            bytes_to_read: 4,
            recv_channel: String::new(),
            reassembler: None,
            last_recv_error_log: -1,
            queue: Arc::new(SendQueue::new(log.clone())),
            send_thread: None,
            subscription: None,
            bus,
            introspect,
            log,
        };

        if !params.udp {
            let (peer, local) = {
                let stream = tunnel.tcp.as_ref().expect("control stream just created");
                (stream.peer_addr()?, stream.local_addr()?)
            };
            tunnel.wire_peer = Some(peer);
            tunnel.wire_local = Some(local);
            tunnel.finish_handshake()?;
        }

        Ok(tunnel)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    pub fn tcp_stream(&self) -> Option<&TcpStream> {
        self.tcp.as_ref()
    }

    pub fn udp_socket(&self) -> Option<&UdpSocket> {
        self.udp.as_ref()
    }

    /// Peer address of the active transport, once the handshake settled it.
    pub fn wire_peer_addr(&self) -> Option<SocketAddr> {
        self.wire_peer
    }

    /// Local address of the active transport.
    pub fn wire_local_addr(&self) -> Option<SocketAddr> {
        self.wire_local
    }

    /// True when this endpoint forwards the given channel to its peer.
    pub fn matches(&self, channel: &str) -> bool {
        self.matcher
            .as_ref()
            .map_or(false, |matcher| matcher.is_match(channel))
    }

    /// Queues one message for transmission to the peer.
    pub fn enqueue(&self, channel: &str, data: &[u8], recv_utime: i64) {
        self.queue.enqueue(channel, data, recv_utime);
    }

    /// Drains the control stream. Parsed record deliveries land in `out`;
    /// the returned action tells the reactor whether the endpoint switched
    /// transports or died.
    pub fn on_tcp_readable(&mut self, out: &mut Vec<Delivery>) -> TunnelAction {
        loop {
            if self.bytes_read == self.bytes_to_read {
                match self.advance_state(out) {
                    Ok(TunnelAction::Continue) => continue,
                    Ok(action) => return action,
                    Err(err) => {
                        logging::error!(self.log, "protocol error on control stream"; "error" => ?err);
                        return TunnelAction::Disconnect;
                    }
                }
            }

            if self.recv_buf.len() < self.bytes_to_read {
                self.recv_buf.resize(self.bytes_to_read, 0);
            }

            let read_result = {
                let mut stream = match self.tcp.as_ref() {
                    Some(stream) => stream,
                    None => return TunnelAction::Continue,
                };
                let span = self.bytes_read..self.bytes_to_read;
                stream.read(&mut self.recv_buf[span])
            };

            match read_result {
                Ok(0) => {
                    logging::info!(self.log, "peer closed connection");
                    return TunnelAction::Disconnect;
                }
                Ok(count) => self.bytes_read += count,
                Err(err) => match err.kind() {
                    io::ErrorKind::WouldBlock => return TunnelAction::Continue,
                    io::ErrorKind::Interrupted => (),
                    _ => {
                        logging::error!(self.log, "tcp receive error"; "error" => %err);
                        return TunnelAction::Disconnect;
                    }
                },
            }
        }
    }

    /// Drains the datagram socket, feeding fragments to the reassembler.
    /// UDP is sessionless, so receive errors never kill the endpoint.
    pub fn on_udp_readable(&mut self, out: &mut Vec<Delivery>) -> TunnelAction {
        let mut datagram = [0u8; UDP_DATAGRAM_MAX];

        loop {
            let received = {
                let sock = match self.udp.as_ref() {
                    Some(sock) => sock,
                    None => return TunnelAction::Continue,
                };
                sock.recv(&mut datagram)
            };

            match received {
                Ok(len) => {
                    if len < UdpHeader::SIZE {
                        logging::debug!(self.log, "runt datagram"; "len" => len);
                        continue;
                    }
                    let header = match UdpHeader::read(&datagram[..UdpHeader::SIZE]) {
                        Ok(header) => header,
                        Err(err) => {
                            logging::debug!(self.log, "bad datagram header"; "error" => ?err);
                            continue;
                        }
                    };

                    // datagrams racing the handshake reply are dropped
                    let reassembler = match self.reassembler.as_mut() {
                        Some(reassembler) => reassembler,
                        None => continue,
                    };

                    if let Some(payload) = reassembler.process(&header, &datagram[UdpHeader::SIZE..len]) {
                        match frame::split_records(payload) {
                            Ok(records) => {
                                for (channel, data) in records {
                                    out.push(Delivery { channel, data });
                                }
                            }
                            Err(err) => {
                                logging::warn!(self.log, "malformed reassembled payload"; "error" => ?err)
                            }
                        }
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return TunnelAction::Continue,
                Err(err) => {
                    let now = timestamp_now();
                    if now - self.last_recv_error_log > 1_000_000 {
                        logging::warn!(self.log, "udp receive error"; "error" => %err);
                        self.last_recv_error_log = now;
                    }
                    return TunnelAction::Continue;
                }
            }
        }
    }

    /// Consumes the completed read run and moves the state machine along.
    fn advance_state(&mut self, out: &mut Vec<Delivery>) -> NetworkResult<TunnelAction> {
        let consumed = self.bytes_to_read;
        self.bytes_read = 0;

        match self.state {
            TunnelState::ClientMsgSz => {
                self.bytes_to_read = frame::decode_frame_len(&self.recv_buf[..consumed])?;
                self.state = TunnelState::ClientMsgData;
                Ok(TunnelAction::Continue)
            }
            TunnelState::ClientMsgData => self.finish_server_handshake(consumed),
            TunnelState::ServerMsgSz => {
                self.bytes_to_read = frame::decode_frame_len(&self.recv_buf[..consumed])?;
                self.state = TunnelState::ServerMsgData;
                Ok(TunnelAction::Continue)
            }
            TunnelState::ServerMsgData => self.finish_client_handshake(consumed),
            TunnelState::RecvChanSz => {
                self.bytes_to_read = frame::decode_frame_len(&self.recv_buf[..consumed])?;
                self.state = TunnelState::RecvChan;
                Ok(TunnelAction::Continue)
            }
            TunnelState::RecvChan => {
                self.recv_channel = std::str::from_utf8(&self.recv_buf[..consumed])
                    .map_err(|_| NetworkError::Fatal(ErrorType::BadChannel))?
                    .to_owned();
                self.state = TunnelState::RecvDataSz;
                self.bytes_to_read = 4;
                Ok(TunnelAction::Continue)
            }
            TunnelState::RecvDataSz => {
                self.bytes_to_read = frame::decode_frame_len(&self.recv_buf[..consumed])?;
                self.state = TunnelState::RecvData;
                Ok(TunnelAction::Continue)
            }
            TunnelState::RecvData => {
                logging::trace!(self.log, "received tcp record";
                                "channel" => %self.recv_channel,
                                "len" => consumed);
                out.push(Delivery {
                    channel: self.recv_channel.clone(),
                    data: self.recv_buf[..consumed].to_vec(),
                });
                self.state = TunnelState::RecvChanSz;
                self.bytes_to_read = 4;
                Ok(TunnelAction::Continue)
            }
            TunnelState::Closed => Ok(TunnelAction::Continue),
        }
    }

    /// Server side of the handshake: the peer's subscription request is in.
    fn finish_server_handshake(&mut self, consumed: usize) -> NetworkResult<TunnelAction> {
        let params = TunnelParams::decode(&self.recv_buf[..consumed])?;
        logging::info!(self.log, "peer subscription";
                       "channels" => %params.channels,
                       "udp" => params.udp,
                       "fec" => params.fec,
                       "max_delay_ms" => params.max_delay_ms,
                       "tcp_max_age_ms" => params.tcp_max_age_ms);

        let mut action = TunnelAction::Continue;

        if params.udp {
            let sock = UdpSocket::bind(&any_addr())?;
            let stream = self.tcp.as_ref().expect("handshake runs on the control stream");
            let peer = SocketAddr::new(stream.peer_addr()?.ip(), params.udp_port);
            sock.connect(peer)?;

            let mut reply = params.clone();
            reply.udp_port = sock.local_addr()?.port();
            reply.channels = String::new();
            support::write_fully(stream, &frame::encode_length_prefixed(&reply.encode()))?;

            self.wire_peer = Some(peer);
            self.wire_local = Some(sock.local_addr()?);
            self.udp = Some(sock);
            action = TunnelAction::UdpReady;
        } else {
            let stream = self.tcp.as_ref().expect("handshake runs on the control stream");
            self.wire_peer = Some(stream.peer_addr()?);
            self.wire_local = Some(stream.local_addr()?);
        }

        self.params = Some(params);
        self.finish_handshake()?;
        self.state = TunnelState::RecvChanSz;
        self.bytes_to_read = 4;

        Ok(action)
    }

    /// Client side of the handshake: the server's UDP port reply is in.
    fn finish_client_handshake(&mut self, consumed: usize) -> NetworkResult<TunnelAction> {
        let reply = TunnelParams::decode(&self.recv_buf[..consumed])?;

        let stream = self.tcp.as_ref().expect("handshake runs on the control stream");
        let peer = SocketAddr::new(stream.peer_addr()?.ip(), reply.udp_port);
        let sock = self.udp.as_ref().expect("datagram socket bound at initiate");
        sock.connect(peer)?;

        self.wire_peer = Some(peer);
        self.wire_local = Some(sock.local_addr()?);
        logging::info!(self.log, "udp tunnel established"; "peer_udp_port" => reply.udp_port);

        self.finish_handshake()?;
        self.state = TunnelState::RecvChanSz;
        self.bytes_to_read = 4;

        Ok(TunnelAction::UdpReady)
    }

    /// Subscribes to the bus and brings up the transmit path. Runs once the
    /// negotiated parameters are final; nothing can enqueue before this, so
    /// the send thread starts here rather than at construction.
    fn finish_handshake(&mut self) -> NetworkResult<()> {
        let params = self.params.clone().expect("parameters negotiated");

        let matcher = Regex::new(&format!("^(?:{})$", params.channels))
            .map_err(|_| NetworkError::Fatal(ErrorType::BadParams))?;

        let queue = self.queue.clone();
        let introspect = self.introspect.clone();
        let callback_log = self.log.clone();
        let subscription = self
            .bus
            .subscribe(&params.channels, move |msg| {
                if introspect.is_from_self(msg) {
                    logging::trace!(callback_log, "suppressing own message"; "channel" => %msg.channel);
                    return;
                }
                queue.enqueue(&msg.channel, &msg.data, msg.recv_utime);
            })
            .map_err(|_| NetworkError::Fatal(ErrorType::BadParams))?;
        self.subscription = Some(subscription);
        self.matcher = Some(matcher);

        let transmitter = if params.udp {
            self.reassembler = Some(Reassembler::new(params.fec, self.log.clone()));
            let sock = self.udp.as_ref().expect("datagram socket bound").try_clone()?;
            Transmitter::Udp(UdpTransmitter::new(sock, params.fec, self.log.clone()))
        } else {
            let stream = self.tcp.as_ref().expect("control stream present").try_clone()?;
            Transmitter::Tcp(TcpTransmitter::new(stream, params.tcp_max_age_ms, self.log.clone())?)
        };
        self.start_sender(transmitter, params.max_delay_ms)?;

        Ok(())
    }

    fn start_sender(&mut self, mut transmitter: Transmitter, max_delay_ms: u32) -> NetworkResult<()> {
        let queue = self.queue.clone();
        let handle = thread::Builder::new()
            .name(format!("send-{}", self.name))
            .spawn(move || {
                while let Some((batch, bytes)) = queue.next_batch(max_delay_ms) {
                    if !transmitter.send_batch(batch, bytes) {
                        break;
                    }
                }
            })?;
        self.send_thread = Some(handle);

        Ok(())
    }

    /// Drops the control stream once a UDP handshake has finished with it.
    pub fn close_tcp(&mut self) {
        if let Some(stream) = self.tcp.take() {
            logging::debug!(self.log, "closing control stream");
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    /// Tears the endpoint down: unsubscribes from the bus, stops and joins
    /// the send thread, closes the sockets.
    pub fn shutdown(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            self.bus.unsubscribe(subscription);
        }

        // shut the stream down before joining so a send thread blocked on a
        // stalled peer errors out instead of wedging the join
        if let Some(stream) = self.tcp.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }

        self.queue.shutdown();
        if let Some(handle) = self.send_thread.take() {
            let _ = handle.join();
        }

        self.udp = None;
        self.state = TunnelState::Closed;

        logging::info!(self.log, "tunnel closed");
    }
}

enum Transmitter {
    Udp(UdpTransmitter),
    Tcp(TcpTransmitter),
}

impl Transmitter {
    /// Ships one drained batch. Returns false when the endpoint should come
    /// down and the send thread exit.
    fn send_batch(&mut self, batch: VecDeque<QueueEntry>, bytes: usize) -> bool {
        match self {
            Transmitter::Udp(tx) => tx.send_batch(batch, bytes),
            Transmitter::Tcp(tx) => tx.send_batch(batch),
        }
    }
}

/// Datagram transmit path: coalesce, fragment, fire and forget. Send errors
/// are throttled to one log line per second and never fatal.
struct UdpTransmitter {
    sock: UdpSocket,
    fragmenter: Fragmenter,
    fec_rate: f32,
    error_since: i64,
    last_error_log: i64,
    log: Logger,
}

impl UdpTransmitter {
    fn new(sock: UdpSocket, fec_rate: f32, log: Logger) -> UdpTransmitter {
        UdpTransmitter {
            sock,
            fragmenter: Fragmenter::new(),
            fec_rate,
            error_since: -1,
            last_error_log: -1,
            log,
        }
    }

    fn send_batch(&mut self, mut batch: VecDeque<QueueEntry>, bytes: usize) -> bool {
        let bytes = Fragmenter::drop_to_fit(&mut batch, bytes, self.fec_rate, &self.log);
        logging::debug!(self.log, "sending batch"; "bytes" => bytes, "messages" => batch.len());

        let buf = Fragmenter::coalesce(batch, bytes);

        let UdpTransmitter {
            sock,
            fragmenter,
            fec_rate,
            error_since,
            last_error_log,
            log,
        } = self;

        fragmenter.fragment(&buf, *fec_rate, |packet| match sock.send(packet) {
            Ok(_) => {
                if *last_error_log > 0 {
                    logging::info!(log, "udp send path recovered";
                                   "down_secs" => (timestamp_now() - *error_since) as f64 * 1e-6);
                    *last_error_log = -1;
                    *error_since = -1;
                }
            }
            Err(err) => {
                let now = timestamp_now();
                if *error_since < 0 {
                    *error_since = now;
                }
                if now - *last_error_log > 1_000_000 {
                    logging::warn!(log, "udp send error"; "error" => %err);
                    *last_error_log = now;
                }
            }
        });

        true
    }
}

/// Stream transmit path: drop over-age messages, frame the rest, write
/// fully. Any write failure is fatal; the socket is shut down so the
/// reactor observes EOF and disconnects the endpoint.
struct TcpTransmitter {
    stream: TcpStream,
    poll: Poll,
    events: Events,
    max_age_ms: u32,
    log: Logger,
}

const WRITABLE_TOKEN: Token = Token(0);

impl TcpTransmitter {
    fn new(stream: TcpStream, max_age_ms: u32, log: Logger) -> NetworkResult<TcpTransmitter> {
        let poll = Poll::new()?;
        poll.register(&stream, WRITABLE_TOKEN, Ready::writable(), PollOpt::level())?;

        Ok(TcpTransmitter {
            stream,
            poll,
            events: Events::with_capacity(4),
            max_age_ms,
            log,
        })
    }

    fn send_batch(&mut self, batch: VecDeque<QueueEntry>) -> bool {
        for msg in batch {
            let age_ms = (timestamp_now() - msg.recv_utime) as f64 * 1e-3;
            if self.max_age_ms > 0 && age_ms > f64::from(self.max_age_ms) {
                logging::debug!(self.log, "dropping over-age message";
                                "channel" => %msg.channel,
                                "age_ms" => age_ms,
                                "max_age_ms" => self.max_age_ms);
                continue;
            }

            let mut frame = Vec::with_capacity(8 + msg.channel.len() + msg.data.len());
            frame
                .write_u32::<BigEndian>(msg.channel.len() as u32)
                .expect("vec write");
            frame.extend_from_slice(msg.channel.as_bytes());
            frame.write_u32::<BigEndian>(msg.data.len() as u32).expect("vec write");
            frame.extend_from_slice(&msg.data);

            if let Err(err) = self.write_fully(&frame) {
                logging::error!(self.log, "tcp send error, disconnecting"; "error" => %err);
                let _ = self.stream.shutdown(Shutdown::Both);
                return false;
            }

            logging::trace!(self.log, "sent tcp record"; "channel" => %msg.channel);
        }

        true
    }

    fn write_fully(&mut self, buf: &[u8]) -> io::Result<()> {
        let mut written = 0;

        while written < buf.len() {
            match (&self.stream).write(&buf[written..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(count) => written += count,
                Err(err) => match err.kind() {
                    io::ErrorKind::WouldBlock => {
                        self.poll.poll(&mut self.events, Some(Duration::from_millis(100)))?;
                    }
                    io::ErrorKind::Interrupted => (),
                    _ => return Err(err),
                },
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::ReadBytesExt;
    use chassis::logging::{o, Discard};
    use std::net::TcpListener;

    fn test_logger() -> Logger {
        Logger::root(Discard, o!())
    }

    fn entry(channel: &str, data: &[u8], recv_utime: i64) -> QueueEntry {
        QueueEntry {
            channel: channel.to_owned(),
            data: data.to_vec(),
            recv_utime,
        }
    }

    /// Connected (mio sender, std receiver) pair over loopback.
    fn stream_pair() -> (TcpStream, std::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let client = std::net::TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();

        client.set_nonblocking(true).unwrap();
        let client = TcpStream::from_stream(client).unwrap();

        (client, server)
    }

    fn read_record<R: Read>(stream: &mut R) -> (String, Vec<u8>) {
        let chan_len = stream.read_u32::<BigEndian>().unwrap() as usize;
        let mut channel = vec![0u8; chan_len];
        stream.read_exact(&mut channel).unwrap();
        let data_len = stream.read_u32::<BigEndian>().unwrap() as usize;
        let mut data = vec![0u8; data_len];
        stream.read_exact(&mut data).unwrap();
        (String::from_utf8(channel).unwrap(), data)
    }

    #[test]
    fn test_tcp_transmitter_frames_in_order() {
        let (client, mut server) = stream_pair();
        let mut tx = TcpTransmitter::new(client, 0, test_logger()).unwrap();

        let now = timestamp_now();
        let mut batch = VecDeque::new();
        batch.push_back(entry("POSE", b"first", now));
        batch.push_back(entry("IMAGES", &[7u8; 2000], now));

        assert!(tx.send_batch(batch));

        let (channel, data) = read_record(&mut server);
        assert_eq!(channel, "POSE");
        assert_eq!(data, b"first");

        let (channel, data) = read_record(&mut server);
        assert_eq!(channel, "IMAGES");
        assert_eq!(data, vec![7u8; 2000]);
    }

    #[test]
    fn test_tcp_transmitter_drops_over_age() {
        let (client, mut server) = stream_pair();
        let mut tx = TcpTransmitter::new(client, 50, test_logger()).unwrap();

        let now = timestamp_now();
        let mut batch = VecDeque::new();
        batch.push_back(entry("STALE", b"old", now - 200_000));
        batch.push_back(entry("FRESH", b"new", now));

        assert!(tx.send_batch(batch));

        // only the fresh message made it onto the wire
        let (channel, data) = read_record(&mut server);
        assert_eq!(channel, "FRESH");
        assert_eq!(data, b"new");

        server
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();
        let mut probe = [0u8; 1];
        assert!(server.read(&mut probe).is_err());
    }

    #[test]
    fn test_tcp_transmitter_zero_age_keeps_everything() {
        let (client, mut server) = stream_pair();
        let mut tx = TcpTransmitter::new(client, 0, test_logger()).unwrap();

        let mut batch = VecDeque::new();
        batch.push_back(entry("ANCIENT", b"still here", 0));

        assert!(tx.send_batch(batch));

        let (channel, data) = read_record(&mut server);
        assert_eq!(channel, "ANCIENT");
        assert_eq!(data, b"still here");
    }

    #[test]
    fn test_tcp_transmitter_fails_on_dead_peer() {
        let (client, server) = stream_pair();
        let mut tx = TcpTransmitter::new(client, 0, test_logger()).unwrap();
        drop(server);

        // the first writes may land in the socket buffer before the RST
        // surfaces, but the failure must show up within a few batches
        let mut failed = false;
        for _ in 0..20 {
            let mut batch = VecDeque::new();
            batch.push_back(entry("DOOMED", &[0u8; 1 << 20], timestamp_now()));
            if !tx.send_batch(batch) {
                failed = true;
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }

        assert!(failed);
    }

    #[test]
    fn test_udp_transmitter_fragments_batch() {
        let receiver = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_millis(500)))
            .unwrap();

        let sender = UdpSocket::bind(&any_addr()).unwrap();
        sender.connect(receiver.local_addr().unwrap()).unwrap();
        let mut tx = UdpTransmitter::new(sender, 0.0, test_logger());

        let mut batch = VecDeque::new();
        let payload = vec![3u8; 3000];
        batch.push_back(entry("BULK", &payload, timestamp_now()));
        let bytes: usize = batch.iter().map(|e| e.accounted_size()).sum();

        assert!(tx.send_batch(batch, bytes));

        let mut buf = [0u8; UDP_DATAGRAM_MAX];
        let mut reassembler = Reassembler::new(0.0, test_logger());
        let mut records = None;
        for _ in 0..3 {
            let len = receiver.recv(&mut buf).unwrap();
            let header = UdpHeader::read(&buf[..UdpHeader::SIZE]).unwrap();
            if let Some(payload) = reassembler.process(&header, &buf[UdpHeader::SIZE..len]) {
                records = Some(frame::split_records(payload).unwrap());
            }
        }

        let records = records.expect("three fragments complete the message");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0, "BULK");
        assert_eq!(records[0].1, payload);
    }
}
