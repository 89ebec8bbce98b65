//! Bound UDP server-sockets.
//!
//! [`StunSocket`] frames everything arriving on one UDP endpoint as STUN
//! messages, ChannelData or raw payload. [`TurnSocket`] wraps one and makes a
//! TURN allocation's relayed address look like a directly bound one.

mod stun;
mod turn;

pub use stun::{SocketEvents, StunSocket, DEFAULT_SYNC_TIMEOUT, MAX_DATAGRAM};
pub use turn::{TurnConfig, TurnError, TurnSocket};

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use thiserror::Error;

use crate::stun::{AgentError, Message, StunError, TransactionError};

/// What the socket does with decoded traffic after the ICE negotiation
/// phases.
///
/// During `Negotiation` everything is expected to be STUN. `StunData` means
/// the nominated path is direct and non-STUN datagrams are user payload.
/// `TurnData` means the nominated path is relayed and payload arrives framed
/// as ChannelData.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockMode {
    Negotiation,
    StunData,
    TurnData,
}

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("timed out waiting for a response")]
    Timeout,
    #[error("waiter closed before a response arrived")]
    WaiterClosed,
    #[error("socket is closed")]
    Closed,
    #[error("{0} is not an address of this socket")]
    UnknownSource(SocketAddr),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Agent(#[from] AgentError),
    #[error(transparent)]
    Stun(#[from] StunError),
}

impl From<TransactionError> for SocketError {
    fn from(e: TransactionError) -> Self {
        match e {
            TransactionError::TimedOut => SocketError::Timeout,
            TransactionError::Stopped => SocketError::WaiterClosed,
            TransactionError::AgentClosed => SocketError::Closed,
        }
    }
}

/// Either flavor of server-socket, as held by an ICE session.
///
/// The session only ever sends through a socket and reads its candidate
/// addresses once during setup; everything inbound arrives via the
/// [`SocketEvents`] callback.
#[derive(Clone)]
pub enum NetSocket {
    Stun(Arc<StunSocket>),
    Turn(Arc<TurnSocket>),
}

impl NetSocket {
    /// The real bound address of the underlying UDP endpoint.
    pub fn local_addr(&self) -> SocketAddr {
        match self {
            NetSocket::Stun(s) => s.local_addr(),
            NetSocket::Turn(t) => t.local_addr(),
        }
    }

    /// The relayed address, when this socket owns a TURN allocation.
    pub fn relayed_addr(&self) -> Option<SocketAddr> {
        match self {
            NetSocket::Stun(_) => None,
            NetSocket::Turn(t) => t.relayed_addr(),
        }
    }

    /// Whether `addr` is an address this socket can send from.
    pub fn owns_addr(&self, addr: SocketAddr) -> bool {
        self.local_addr() == addr || self.relayed_addr() == Some(addr)
    }

    pub fn set_callback(&self, callback: Weak<dyn SocketEvents>) {
        match self {
            NetSocket::Stun(s) => s.set_callback(callback),
            NetSocket::Turn(t) => t.set_callback(callback),
        }
    }

    pub async fn send_stun_async(
        &self,
        message: &Message,
        from: SocketAddr,
        to: SocketAddr,
    ) -> Result<(), SocketError> {
        match self {
            NetSocket::Stun(s) => {
                if from != s.local_addr() {
                    return Err(SocketError::UnknownSource(from));
                }
                s.send_stun_async(message, to).await
            }
            NetSocket::Turn(t) => t.send_stun_async(message, from, to).await,
        }
    }

    pub async fn send_data(
        &self,
        from: SocketAddr,
        to: SocketAddr,
        data: &[u8],
    ) -> Result<(), SocketError> {
        match self {
            NetSocket::Stun(s) => {
                if from != s.local_addr() {
                    return Err(SocketError::UnknownSource(from));
                }
                s.send_data(data.to_vec(), to).await
            }
            NetSocket::Turn(t) => t.send(from, to, data).await,
        }
    }

    /// Switches the socket out of the negotiation phase once a pair is
    /// nominated.
    pub fn finish_negotiation(&self, mode: SockMode) {
        match self {
            NetSocket::Stun(s) => s.set_mode(mode),
            NetSocket::Turn(t) => t.finish_negotiation(mode),
        }
    }

    pub async fn close(&self) {
        match self {
            NetSocket::Stun(s) => s.close(),
            NetSocket::Turn(t) => t.close().await,
        }
    }
}
