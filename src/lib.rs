//! Pure-userspace ICE (RFC 5245) connectivity over UDP.
//!
//! Two endpoints behind NATs of unknown kind gather candidate transport
//! addresses, probe every plausible pairing with STUN connectivity checks and
//! converge on a single bidirectional path: direct when the topology allows
//! it, relayed through a TURN server otherwise. Everything runs over plain
//! UDP sockets; no kernel or hardware assistance is required.
//!
//! The crate is layered bottom-up:
//!
//! - [`stun`]: bit-exact STUN/TURN message codec (RFC 5389) and the
//!   transaction [`stun::Agent`].
//! - [`turn`]: ChannelData framing (RFC 5766).
//! - [`socket`]: the bound UDP server-sockets. [`socket::StunSocket`] frames
//!   inbound datagrams, [`socket::TurnSocket`] owns a TURN allocation and
//!   makes the relayed address look like a local one.
//! - [`ice`]: candidate gathering and the connectivity-check state machine,
//!   driven by [`ice::IceSession`].

pub mod ice;
pub mod socket;
pub mod stun;
pub mod turn;

pub use ice::{
    Candidate, CandidateKind, GatherConfig, IceError, IceEvent, IceSession, RemoteDescription,
    Role, SessionConfig,
};
pub use socket::{SockMode, SocketError, TurnConfig};
pub use stun::{Message, MessageClass, Method, StunError, TransactionId};
