//! Candidate gathering: host, server-reflexive and relayed candidates.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::ice::{Candidate, IceError};
use crate::socket::{NetSocket, StunSocket, TurnConfig, TurnSocket};
use crate::stun::{Message, MessageClass, Method, TransactionId};

#[derive(Debug, Clone, Default)]
pub struct GatherConfig {
    /// STUN server to learn a server-reflexive address from.
    pub stun_server: Option<SocketAddr>,
    /// TURN server to allocate a relayed address on.
    pub turn: Option<TurnConfig>,
    /// Explicit local addresses; when unset the interface addresses of this
    /// host are enumerated.
    pub local_addrs: Option<Vec<IpAddr>>,
    /// Keep loopback and link-local addresses instead of filtering them.
    pub allow_loopback: bool,
}

pub(crate) struct Gathered {
    pub candidates: Vec<Candidate>,
    pub sockets: Vec<NetSocket>,
    pub turn: Option<Arc<TurnSocket>>,
}

const COMPONENT_RTP: u16 = 1;

/// Produces the ordered local candidate list together with the sockets the
/// candidates live on.
pub(crate) async fn gather(config: &GatherConfig) -> Result<Gathered, IceError> {
    let ips: Vec<IpAddr> = match &config.local_addrs {
        Some(addrs) => addrs.clone(),
        None => enumerate_local_ips(),
    }
    .into_iter()
    .filter(|ip| config.allow_loopback || !(ip.is_loopback() || is_link_local(*ip)))
    .collect();

    if ips.is_empty() {
        return Err(IceError::NoLocalAddress);
    }

    let mut candidates = Vec::new();
    let mut sockets = Vec::new();

    for (i, ip) in ips.iter().enumerate() {
        let sock = StunSocket::bind(SocketAddr::new(*ip, 0)).await?;
        let host_addr = sock.local_addr();

        let mut host = Candidate::host(host_addr, COMPONENT_RTP);
        host.set_local_preference(65535 - i as u16);
        tracing::debug!(candidate = %host, "Gathered host candidate");
        candidates.push(host);

        if let Some(server) = config.stun_server {
            match binding_request(&sock, server).await {
                Some(mapped) if mapped != host_addr => {
                    let mut srflx = Candidate::server_reflexive(
                        mapped,
                        host_addr,
                        server,
                        COMPONENT_RTP,
                    );
                    srflx.set_local_preference(32767 - i as u16);
                    tracing::debug!(candidate = %srflx, "Gathered server-reflexive candidate");
                    candidates.push(srflx);
                }
                Some(_) => {
                    tracing::debug!(%host_addr, "Mapped address equals host address, no NAT in the path");
                }
                None => {}
            }
        }

        sockets.push(NetSocket::Stun(sock));
    }

    let mut turn_socket = None;
    if let Some(turn_config) = &config.turn {
        // Bind in the server's address family where possible.
        let bind_ip = ips
            .iter()
            .find(|ip| ip.is_ipv4() == turn_config.server.is_ipv4())
            .or_else(|| ips.first())
            .copied()
            .ok_or(IceError::NoLocalAddress)?;

        let turn = TurnSocket::bind(SocketAddr::new(bind_ip, 0), turn_config.clone()).await?;
        let relayed_addr = turn.allocate().await?;

        let relayed = Candidate::relayed(relayed_addr, turn_config.server, COMPONENT_RTP);
        tracing::debug!(candidate = %relayed, "Gathered relayed candidate");
        candidates.push(relayed);

        sockets.push(NetSocket::Turn(turn.clone()));
        turn_socket = Some(turn);
    }

    Ok(Gathered {
        candidates,
        sockets,
        turn: turn_socket,
    })
}

/// One synchronous STUN Binding against `server`. Errors are soft: gathering
/// continues with the candidates we have.
async fn binding_request(sock: &StunSocket, server: SocketAddr) -> Option<SocketAddr> {
    let request = Message::new(
        MessageClass::Request,
        Method::BINDING,
        TransactionId::new(),
    );

    let (response, _) = match sock.send_stun_sync(request, server).await {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(%server, "STUN binding failed: {e}");
            return None;
        }
    };

    let mapped = response.mapped_address();
    if mapped.is_none() {
        tracing::warn!(%server, "Binding response carries no mapped address");
    }
    mapped
}

fn enumerate_local_ips() -> Vec<IpAddr> {
    let mut ips = Vec::new();
    match local_ip_address::local_ip() {
        Ok(ip) => ips.push(ip),
        Err(e) => tracing::debug!("No local IPv4 address: {e}"),
    }
    match local_ip_address::local_ipv6() {
        Ok(ip) => ips.push(ip),
        Err(e) => tracing::debug!("No local IPv6 address: {e}"),
    }
    ips
}

fn is_link_local(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn loopback_config() -> GatherConfig {
        GatherConfig {
            local_addrs: Some(vec![IpAddr::from([127, 0, 0, 1])]),
            allow_loopback: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn host_only_gathering() {
        let gathered = gather(&loopback_config()).await.unwrap();

        assert_eq!(gathered.candidates.len(), 1);
        assert_eq!(gathered.sockets.len(), 1);

        let host = &gathered.candidates[0];
        assert_eq!(host.kind(), crate::ice::CandidateKind::Host);
        assert_eq!(host.addr(), gathered.sockets[0].local_addr());
        assert_eq!(host.base(), host.addr());
    }

    #[tokio::test]
    async fn loopback_is_filtered_unless_allowed() {
        let config = GatherConfig {
            local_addrs: Some(vec![IpAddr::from([127, 0, 0, 1])]),
            allow_loopback: false,
            ..Default::default()
        };

        assert!(matches!(
            gather(&config).await,
            Err(IceError::NoLocalAddress)
        ));
    }

    #[tokio::test]
    async fn server_reflexive_candidate_from_stun_server() {
        // A minimal STUN server that reports a translated mapped address,
        // as a NAT would produce.
        let server = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let mapped: SocketAddr = "127.0.0.1:4242".parse().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            let request = Message::parse(&buf[..len]).unwrap();
            let mut response = Message::new(
                MessageClass::SuccessResponse,
                Method::BINDING,
                request.transaction_id(),
            );
            response.add_attribute(crate::stun::Attribute::XorMappedAddress(mapped));
            server.send_to(&response.encode(), from).await.unwrap();
        });

        let config = GatherConfig {
            stun_server: Some(server_addr),
            ..loopback_config()
        };

        let gathered = tokio::time::timeout(Duration::from_secs(5), gather(&config))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(gathered.candidates.len(), 2);
        let srflx = &gathered.candidates[1];
        assert_eq!(srflx.kind(), crate::ice::CandidateKind::ServerReflexive);
        assert_eq!(srflx.addr(), mapped);
        assert_eq!(srflx.base(), gathered.candidates[0].addr());
    }
}
