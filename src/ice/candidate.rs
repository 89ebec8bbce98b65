//! Candidate transport addresses (RFC 5245 §4.1.1).

use std::fmt;
use std::net::SocketAddr;

use crc::{Crc, CRC_32_ISO_HDLC};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateKind {
    Host,
    PeerReflexive,
    ServerReflexive,
    Relayed,
}

impl CandidateKind {
    /// RFC 5245 §4.1.2.2 type preferences.
    fn type_preference(self) -> u32 {
        match self {
            CandidateKind::Host => 126,
            CandidateKind::PeerReflexive => 110,
            CandidateKind::ServerReflexive => 100,
            CandidateKind::Relayed => 0,
        }
    }
}

impl fmt::Display for CandidateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CandidateKind::Host => "host",
            CandidateKind::PeerReflexive => "prflx",
            CandidateKind::ServerReflexive => "srflx",
            CandidateKind::Relayed => "relay",
        };
        f.write_str(s)
    }
}

/// A potential transport address a peer may reach us on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    kind: CandidateKind,
    addr: SocketAddr,
    base: SocketAddr,
    component: u16,
    foundation: String,
    local_preference: u16,
    priority: u32,
}

impl Candidate {
    pub fn host(addr: SocketAddr, component: u16) -> Self {
        Self::new(CandidateKind::Host, addr, addr, None, component)
    }

    pub fn server_reflexive(
        addr: SocketAddr,
        base: SocketAddr,
        server: SocketAddr,
        component: u16,
    ) -> Self {
        Self::new(CandidateKind::ServerReflexive, addr, base, Some(server), component)
    }

    /// A relayed candidate's base is the candidate itself.
    pub fn relayed(addr: SocketAddr, server: SocketAddr, component: u16) -> Self {
        Self::new(CandidateKind::Relayed, addr, addr, Some(server), component)
    }

    /// Peer-reflexive candidates carry the priority learned from the PRIORITY
    /// attribute (remote) or computed for the sending local candidate.
    pub fn peer_reflexive(
        addr: SocketAddr,
        base: SocketAddr,
        priority: u32,
        component: u16,
        foundation: String,
    ) -> Self {
        Candidate {
            kind: CandidateKind::PeerReflexive,
            addr,
            base,
            component,
            foundation,
            local_preference: 65535,
            priority,
        }
    }

    fn new(
        kind: CandidateKind,
        addr: SocketAddr,
        base: SocketAddr,
        server: Option<SocketAddr>,
        component: u16,
    ) -> Self {
        let mut candidate = Candidate {
            kind,
            addr,
            base,
            component,
            foundation: foundation(kind, base, server),
            local_preference: 65535,
            priority: 0,
        };
        candidate.priority = candidate.compute_priority(kind.type_preference());
        candidate
    }

    pub fn kind(&self) -> CandidateKind {
        self.kind
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn base(&self) -> SocketAddr {
        self.base
    }

    pub fn component(&self) -> u16 {
        self.component
    }

    /// Candidates share a foundation iff they have the same type, base and
    /// server; foundations group candidates for the freeze/unfreeze logic.
    pub fn foundation(&self) -> &str {
        &self.foundation
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    /// The priority this side would assign to a peer-reflexive candidate
    /// discovered via this candidate, carried in check PRIORITY attributes.
    pub fn peer_reflexive_priority(&self) -> u32 {
        self.compute_priority(CandidateKind::PeerReflexive.type_preference())
    }

    pub(crate) fn set_local_preference(&mut self, preference: u16) {
        self.local_preference = preference;
        self.priority = self.compute_priority(self.kind.type_preference());
    }

    /// `(2^24)·type_pref + (2^8)·local_pref + (256 − component)`.
    fn compute_priority(&self, type_preference: u32) -> u32 {
        (type_preference << 24)
            + ((self.local_preference as u32) << 8)
            + (256 - self.component as u32)
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} (base {})",
            self.foundation, self.kind, self.priority, self.addr, self.base
        )
    }
}

fn foundation(kind: CandidateKind, base: SocketAddr, server: Option<SocketAddr>) -> String {
    let input = match server {
        Some(server) => format!("{kind}|{}|{server}|udp", base.ip()),
        None => format!("{kind}|{}|udp", base.ip()),
    };
    format!("{:08x}", CRC32.checksum(input.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn priority_follows_the_formula() {
        let host = Candidate::host(addr("10.0.0.1:5000"), 1);
        assert_eq!(host.priority(), (126 << 24) + (65535 << 8) + 255);

        let relayed = Candidate::relayed(addr("198.51.100.1:6000"), addr("198.51.100.1:3478"), 1);
        assert_eq!(relayed.priority(), (65535 << 8) + 255);
    }

    #[test]
    fn higher_component_lowers_priority() {
        let rtp = Candidate::host(addr("10.0.0.1:5000"), 1);
        let rtcp = Candidate::host(addr("10.0.0.1:5001"), 2);
        assert!(rtp.priority() > rtcp.priority());
    }

    #[test]
    fn peer_reflexive_priority_sits_between_host_and_srflx() {
        let host = Candidate::host(addr("10.0.0.1:5000"), 1);
        let srflx = Candidate::server_reflexive(
            addr("203.0.113.1:40000"),
            addr("10.0.0.1:5000"),
            addr("192.0.2.1:3478"),
            1,
        );

        assert!(host.peer_reflexive_priority() < host.priority());
        assert!(host.peer_reflexive_priority() > srflx.priority());
    }

    #[test]
    fn foundations_group_by_type_base_and_server() {
        let server1 = addr("192.0.2.1:3478");
        let server2 = addr("192.0.2.2:3478");
        let base = addr("10.0.0.1:5000");

        let a = Candidate::server_reflexive(addr("203.0.113.1:40000"), base, server1, 1);
        let b = Candidate::server_reflexive(addr("203.0.113.1:40001"), base, server1, 1);
        let c = Candidate::server_reflexive(addr("203.0.113.1:40002"), base, server2, 1);
        let d = Candidate::host(base, 1);

        // Same type, base ip and server: same foundation, regardless of the
        // transport address.
        assert_eq!(a.foundation(), b.foundation());
        assert_ne!(a.foundation(), c.foundation());
        assert_ne!(a.foundation(), d.foundation());
    }

    #[test]
    fn local_preference_orders_same_kind_candidates() {
        let mut first = Candidate::host(addr("10.0.0.1:5000"), 1);
        let mut second = Candidate::host(addr("10.0.0.2:5000"), 1);
        first.set_local_preference(65535);
        second.set_local_preference(65534);

        assert!(first.priority() > second.priority());
    }
}
