//! `conduit` bridges publish/subscribe bus traffic between machines. A
//! tunnel endpoint subscribes to a configurable set of channels on the local
//! bus, coalesces matching messages and ships them to a peer endpoint over
//! TCP or fragmented UDP (optionally with forward error correction); inbound
//! traffic is reassembled, republished locally and relayed to every other
//! connected peer.

pub mod bus;
pub mod introspect;
pub mod net;
