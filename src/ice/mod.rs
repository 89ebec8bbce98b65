//! Candidate gathering and the ICE connectivity-check state machine.

mod candidate;
mod gather;
mod pair;
mod session;

pub use candidate::{Candidate, CandidateKind};
pub use gather::GatherConfig;
pub use session::{
    IceCredentials, IceEvent, IceSession, RemoteDescription, Role, SessionConfig,
};

use thiserror::Error;

use crate::socket::{SocketError, TurnError};

#[derive(Debug, Error)]
pub enum IceError {
    #[error("no usable local address to gather from")]
    NoLocalAddress,
    #[error("no candidate pair succeeded")]
    NoValidPair,
    #[error("connectivity checks timed out")]
    CheckTimeout,
    #[error("session is closed")]
    Closed,
    #[error(transparent)]
    Socket(#[from] SocketError),
    #[error(transparent)]
    Turn(#[from] TurnError),
}
