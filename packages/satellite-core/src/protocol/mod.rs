//! Wyoming protocol plumbing: framing (C1), message constants, and the
//! durable peer actor (C2).

pub mod framing;
pub mod messages;
pub mod peer;

pub use framing::Frame;
pub use peer::{Endpoint, HandshakeMode, Peer, PeerConfig, PeerEdge, PeerHandle};
