//! The networking modules in `conduit` implement the tunnel wire protocol
//! and the machinery that drives it: framed codecs, fragmentation with
//! optional forward error correction, the bounded send queue, per-peer
//! endpoints and the accepting server.

pub mod endpoint;
pub mod fec;
pub mod fragment;
pub mod frame;
pub mod queue;
pub mod server;
pub mod support;

// Wire constants. Both ends of a tunnel must be built with identical values
// for fragmentation and sequence handling to interoperate.

/// Payload bytes carried by a single datagram after its header.
pub const MAX_FRAGMENT_PAYLOAD: usize = 1400;

/// Upper bound on the number of fragments a coalesced batch may occupy.
/// Larger batches drop their oldest messages until they fit.
pub const MAX_FRAGMENTS_PER_BATCH: usize = 64;

/// Batches below this fragment count skip the block code and fall back to
/// plain fragmentation (duplicated when the rate asks for redundancy).
pub const MIN_FRAGMENTS_FOR_FEC: u32 = 3;

/// Sequence numbers live in `[0, SEQNO_WRAP)`.
pub const SEQNO_WRAP: i32 = 1 << 30;

/// A sequence number this far behind the current one is a wrap-around, not
/// a stale packet.
pub const SEQNO_WRAP_GAP: i32 = 1 << 24;

/// Send queue byte budget; the oldest entries are dropped beyond it.
pub const MAX_QUEUE_BYTES: usize = 4 * 1024 * 1024;

/// A queue holding at least this many bytes bypasses the coalescing window.
pub const FLUSH_BYTES_THRESHOLD: usize = 64 * 1024;

/// Local cap on remote-supplied frame lengths.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Default control port of the tunnel server.
pub const DEFAULT_PORT: u16 = 6141;

/// Largest datagram the receive path accepts.
pub const UDP_DATAGRAM_MAX: usize = 65535;
