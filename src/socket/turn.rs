//! The TURN client socket.
//!
//! Wraps a [`StunSocket`] and owns one allocation on a TURN server. To the
//! layers above it looks like a socket whose local address is the relayed
//! address: outbound traffic from that address is framed as ChannelData or a
//! Send indication, inbound Data indications and ChannelData are unwrapped
//! before they surface.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::task::JoinHandle;

use super::stun::{SocketEvents, StunSocket};
use super::{SockMode, SocketError};
use crate::stun::attr::{errors, TRANSPORT_UDP};
use crate::stun::{Attribute, IntegrityKey, Message, MessageClass, Method, TransactionId};
use crate::turn::{self, ChannelData, FIRST_CHANNEL, LAST_CHANNEL};

const SOFTWARE: &str = concat!("firn/", env!("CARGO_PKG_VERSION"));
const DEFAULT_LIFETIME: Duration = Duration::from_secs(600);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum TurnError {
    #[error(transparent)]
    Socket(#[from] SocketError),
    #[error("response is missing {0}")]
    MissingAttribute(&'static str),
    #[error("no allocation on this socket")]
    NoAllocation,
    #[error("{0} is not an address of this socket")]
    UnknownSource(SocketAddr),
    #[error("all channel numbers are bound")]
    ChannelsExhausted,
    #[error("unauthorized (401)")]
    Unauthorized,
    #[error("stale nonce (438)")]
    StaleNonce,
    #[error("forbidden (403)")]
    Forbidden,
    #[error("allocation mismatch (437)")]
    AllocMismatch,
    #[error("wrong credentials (441)")]
    WrongCredentials,
    #[error("unsupported transport protocol (442)")]
    UnsupportedTransport,
    #[error("allocation quota reached (486)")]
    QuotaReached,
    #[error("insufficient capacity (508)")]
    InsufficientCapacity,
    #[error("server rejected request: {code} {reason}")]
    ErrorResponse { code: u16, reason: String },
}

impl TurnError {
    fn from_code(code: u16, reason: &str) -> Self {
        match code {
            errors::UNAUTHORIZED => TurnError::Unauthorized,
            errors::STALE_NONCE => TurnError::StaleNonce,
            errors::FORBIDDEN => TurnError::Forbidden,
            errors::ALLOCATION_MISMATCH => TurnError::AllocMismatch,
            errors::WRONG_CREDENTIALS => TurnError::WrongCredentials,
            errors::UNSUPPORTED_TRANSPORT => TurnError::UnsupportedTransport,
            errors::ALLOCATION_QUOTA_REACHED => TurnError::QuotaReached,
            errors::INSUFFICIENT_CAPACITY => TurnError::InsufficientCapacity,
            code => TurnError::ErrorResponse {
                code,
                reason: reason.to_owned(),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct TurnConfig {
    pub server: SocketAddr,
    pub username: String,
    pub password: String,
}

#[derive(Clone)]
struct Auth {
    realm: String,
    nonce: String,
    key: IntegrityKey,
}

struct Allocation {
    relayed_addr: SocketAddr,
    mapped_addr: Option<SocketAddr>,
    lifetime: Duration,
    permissions: HashSet<IpAddr>,
}

pub struct TurnSocket {
    weak: Weak<TurnSocket>,
    sock: Arc<StunSocket>,
    config: TurnConfig,
    auth: Mutex<Option<Auth>>,
    allocation: Mutex<Option<Allocation>>,
    callback: Mutex<Option<Weak<dyn SocketEvents>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TurnSocket {
    /// Binds a UDP endpoint and prepares it as a TURN client socket. The
    /// allocation itself is made with [`TurnSocket::allocate`].
    pub async fn bind(
        bind_addr: SocketAddr,
        config: TurnConfig,
    ) -> Result<Arc<TurnSocket>, SocketError> {
        let sock = StunSocket::bind(bind_addr).await?;

        let this = Arc::new_cyclic(|weak| TurnSocket {
            weak: weak.clone(),
            sock,
            config,
            auth: Mutex::new(None),
            allocation: Mutex::new(None),
            callback: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        });

        let this_dyn: Arc<dyn SocketEvents> = this.clone();
        let weak: Weak<dyn SocketEvents> = Arc::downgrade(&this_dyn);
        this.sock.set_callback(weak);

        Ok(this)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.sock.local_addr()
    }

    pub fn server(&self) -> SocketAddr {
        self.config.server
    }

    pub fn relayed_addr(&self) -> Option<SocketAddr> {
        self.allocation
            .lock()
            .expect("allocation mutex poisoned")
            .as_ref()
            .map(|a| a.relayed_addr)
    }

    /// The server-reflexive address the TURN server observed for us.
    pub fn mapped_addr(&self) -> Option<SocketAddr> {
        self.allocation
            .lock()
            .expect("allocation mutex poisoned")
            .as_ref()
            .and_then(|a| a.mapped_addr)
    }

    pub fn set_callback(&self, callback: Weak<dyn SocketEvents>) {
        *self.callback.lock().expect("callback mutex poisoned") = Some(callback);
    }

    /// Obtains the allocation: an unauthenticated Allocate request, the
    /// expected 401 carrying REALM and NONCE, then the authenticated retry.
    /// Returns the relayed transport address.
    pub async fn allocate(&self) -> Result<SocketAddr, TurnError> {
        let mut request = self.new_request(Method::ALLOCATE);
        request.add_attribute(Attribute::RequestedTransport(TRANSPORT_UDP));
        request.add_fingerprint();

        let (response, _) = self.sock.send_stun_sync(request, self.config.server).await?;

        let response = match response.error_code() {
            Some((errors::UNAUTHORIZED, _)) => {
                let realm = response
                    .realm()
                    .ok_or(TurnError::MissingAttribute("REALM"))?
                    .to_owned();
                let nonce = response
                    .nonce()
                    .ok_or(TurnError::MissingAttribute("NONCE"))?
                    .to_owned();
                let key = IntegrityKey::long_term(&self.config.username, &realm, &self.config.password);
                *self.auth.lock().expect("auth mutex poisoned") = Some(Auth { realm, nonce, key });

                self.send_authenticated(
                    Method::ALLOCATE,
                    vec![Attribute::RequestedTransport(TRANSPORT_UDP)],
                )
                .await?
            }
            Some((code, reason)) => return Err(TurnError::from_code(code, reason)),
            // A server without authentication; nothing to retry.
            None => response,
        };

        let relayed_addr = response
            .xor_relayed_address()
            .ok_or(TurnError::MissingAttribute("XOR-RELAYED-ADDRESS"))?;
        let mapped_addr = response.mapped_address();
        let lifetime = response.lifetime().unwrap_or(DEFAULT_LIFETIME);

        tracing::info!(
            server = %self.config.server,
            %relayed_addr,
            ?mapped_addr,
            ?lifetime,
            "Obtained TURN allocation"
        );

        *self.allocation.lock().expect("allocation mutex poisoned") = Some(Allocation {
            relayed_addr,
            mapped_addr,
            lifetime,
            permissions: HashSet::new(),
        });

        self.spawn_refresh_task();

        Ok(relayed_addr)
    }

    /// Installs permissions for the given peers. The server only relays
    /// traffic from peer IPs a permission exists for.
    pub async fn create_permission(&self, peers: &[SocketAddr]) -> Result<(), TurnError> {
        let new_ips: Vec<IpAddr> = {
            let allocation = self.allocation.lock().expect("allocation mutex poisoned");
            let allocation = allocation.as_ref().ok_or(TurnError::NoAllocation)?;
            let mut ips: Vec<IpAddr> = peers
                .iter()
                .map(|p| p.ip())
                .filter(|ip| !allocation.permissions.contains(ip))
                .collect();
            ips.dedup();
            ips
        };
        if new_ips.is_empty() {
            return Ok(());
        }

        let attrs = new_ips
            .iter()
            .map(|ip| Attribute::XorPeerAddress(SocketAddr::new(*ip, 0)))
            .collect();
        self.send_authenticated(Method::CREATE_PERMISSION, attrs)
            .await?;

        let mut allocation = self.allocation.lock().expect("allocation mutex poisoned");
        if let Some(allocation) = allocation.as_mut() {
            allocation.permissions.extend(new_ips.iter().copied());
        }

        tracing::debug!(server = %self.config.server, peers = ?new_ips, "Created permissions");

        Ok(())
    }

    /// Binds a channel to `peer`, returning its number. Numbers are handed
    /// out monotonically from 0x4000; once 0x7FFF is reached the least
    /// recently used binding is evicted and its number reused.
    pub async fn channel_bind(&self, peer: SocketAddr) -> Result<u16, TurnError> {
        if self.relayed_addr().is_none() {
            return Err(TurnError::NoAllocation);
        }

        let now = Instant::now();
        {
            let mut channels = self.sock.channels().lock().expect("channel mutex poisoned");
            if let Some(number) = channels.channel_to_peer(peer, now) {
                tracing::debug!(server = %self.config.server, %peer, "Already got a channel");
                return Ok(number);
            }
        }

        let number = self
            .sock
            .channels()
            .lock()
            .expect("channel mutex poisoned")
            .new_channel_to_peer(peer, now)
            .ok_or(TurnError::ChannelsExhausted)?;

        let result = self
            .send_authenticated(
                Method::CHANNEL_BIND,
                vec![
                    Attribute::ChannelNumber(number),
                    Attribute::XorPeerAddress(peer),
                ],
            )
            .await;

        let mut channels = self.sock.channels().lock().expect("channel mutex poisoned");
        match result {
            Ok(_) => {
                channels.set_confirmed(number, Instant::now());
                tracing::info!(channel = %number, %peer, "Bound channel");
                Ok(number)
            }
            Err(e) => {
                channels.handle_failed_binding(number);
                Err(e)
            }
        }
    }

    /// Refreshes the allocation. `lifetime` defaults to the current one; a
    /// zero lifetime releases the allocation.
    pub async fn refresh(&self, lifetime: Option<Duration>) -> Result<Duration, TurnError> {
        let requested = lifetime
            .or_else(|| {
                self.allocation
                    .lock()
                    .expect("allocation mutex poisoned")
                    .as_ref()
                    .map(|a| a.lifetime)
            })
            .unwrap_or(DEFAULT_LIFETIME);

        let response = self
            .send_authenticated(Method::REFRESH, vec![Attribute::Lifetime(requested)])
            .await?;

        let granted = response.lifetime().unwrap_or(requested);

        let mut allocation = self.allocation.lock().expect("allocation mutex poisoned");
        if granted.is_zero() {
            *allocation = None;
            tracing::info!(server = %self.config.server, "Released TURN allocation");
        } else if let Some(allocation) = allocation.as_mut() {
            allocation.lifetime = granted;
        }

        Ok(granted)
    }

    /// Sends a STUN message on behalf of `from`.
    ///
    /// A message from the relayed address cannot leave this host directly; it
    /// is wrapped into a Send indication addressed to the TURN server, which
    /// unwraps and relays it to `to`.
    pub async fn send_stun_async(
        &self,
        message: &Message,
        from: SocketAddr,
        to: SocketAddr,
    ) -> Result<(), SocketError> {
        if from == self.sock.local_addr() {
            return self.sock.send_stun_async(message, to).await;
        }

        if Some(from) != self.relayed_addr() {
            return Err(SocketError::UnknownSource(from));
        }

        let mut indication = Message::new(
            MessageClass::Indication,
            Method::SEND,
            TransactionId::new(),
        );
        indication.add_attribute(Attribute::XorPeerAddress(to));
        indication.add_attribute(Attribute::Data(message.encode()));
        indication.add_fingerprint();

        self.sock
            .send_stun_async(&indication, self.config.server)
            .await
    }

    /// Sends application payload on behalf of `from`, choosing the direct
    /// path, a bound channel or a Send indication.
    pub async fn send(
        &self,
        from: SocketAddr,
        to: SocketAddr,
        data: &[u8],
    ) -> Result<(), SocketError> {
        if from == self.sock.local_addr() {
            return self.sock.send_data(data.to_vec(), to).await;
        }

        if Some(from) != self.relayed_addr() {
            return Err(SocketError::UnknownSource(from));
        }

        let channel = self
            .sock
            .channels()
            .lock()
            .expect("channel mutex poisoned")
            .channel_to_peer(to, Instant::now());

        match channel {
            Some(number) => {
                let frame = ChannelData::new(number, data).to_bytes();
                self.sock.send_data(frame, self.config.server).await
            }
            None => {
                let mut indication = Message::new(
                    MessageClass::Indication,
                    Method::SEND,
                    TransactionId::new(),
                );
                indication.add_attribute(Attribute::XorPeerAddress(to));
                indication.add_attribute(Attribute::Data(data.to_vec()));
                indication.add_fingerprint();
                self.sock
                    .send_stun_async(&indication, self.config.server)
                    .await
            }
        }
    }

    /// Leaves the negotiation phase.
    ///
    /// Keepalives towards the server start either way; they keep the
    /// server-reflexive mapping open. When the nominated pair is direct the
    /// allocation itself is released right away since nothing will be
    /// relayed anymore.
    pub fn finish_negotiation(&self, mode: SockMode) {
        self.sock.set_mode(mode);
        self.spawn_keepalive_task();

        if mode != SockMode::TurnData && self.relayed_addr().is_some() {
            tracing::debug!(server = %self.config.server, "Releasing unused allocation");
            let weak = self.weak.clone();
            tokio::spawn(async move {
                if let Some(this) = weak.upgrade() {
                    if let Err(e) = this.refresh(Some(Duration::ZERO)).await {
                        tracing::debug!("Failed to release allocation: {e}");
                    }
                }
            });
        }
    }

    pub async fn close(&self) {
        if self.relayed_addr().is_some() {
            if let Err(e) = self.refresh(Some(Duration::ZERO)).await {
                tracing::debug!("Failed to release allocation on close: {e}");
            }
        }
        for task in self.tasks.lock().expect("task mutex poisoned").drain(..) {
            task.abort();
        }
        self.sock.close();
    }

    fn new_request(&self, method: Method) -> Message {
        let mut request = Message::new(MessageClass::Request, method, TransactionId::new());
        request.add_attribute(Attribute::Software(SOFTWARE.to_owned()));
        request
    }

    /// Sends an authenticated request, retrying once with the fresh nonce on
    /// a 438 Stale Nonce (or a 401 carrying a new nonce).
    async fn send_authenticated(
        &self,
        method: Method,
        attrs: Vec<Attribute>,
    ) -> Result<Message, TurnError> {
        for attempt in 0.. {
            let auth = self
                .auth
                .lock()
                .expect("auth mutex poisoned")
                .clone()
                .ok_or(TurnError::Unauthorized)?;

            let mut request = self.new_request(method);
            for attr in &attrs {
                request.add_attribute(attr.clone());
            }
            request.add_attribute(Attribute::Username(self.config.username.clone()));
            request.add_attribute(Attribute::Realm(auth.realm));
            request.add_attribute(Attribute::Nonce(auth.nonce));
            request.add_message_integrity(&auth.key);
            request.add_fingerprint();

            let (response, _) = self.sock.send_stun_sync(request, self.config.server).await?;

            match response.error_code() {
                None => return Ok(response),
                Some((code @ (errors::STALE_NONCE | errors::UNAUTHORIZED), _)) if attempt == 0 => {
                    let Some(nonce) = response.nonce() else {
                        return Err(TurnError::from_code(code, ""));
                    };
                    tracing::debug!(%method, code, "Request failed, re-authenticating");
                    if let Some(auth) = self
                        .auth
                        .lock()
                        .expect("auth mutex poisoned")
                        .as_mut()
                    {
                        auth.nonce = nonce.to_owned();
                    }
                }
                Some((code, reason)) => return Err(TurnError::from_code(code, reason)),
            }
        }
        unreachable!("second stale nonce returns above")
    }

    fn spawn_refresh_task(&self) {
        let weak = self.weak.clone();
        let handle = tokio::spawn(async move {
            loop {
                let period = {
                    let Some(this) = weak.upgrade() else { return };
                    let allocation = this.allocation.lock().expect("allocation mutex poisoned");
                    let Some(allocation) = allocation.as_ref() else {
                        return;
                    };
                    allocation.lifetime / 2
                };

                tokio::time::sleep(period).await;

                let Some(this) = weak.upgrade() else { return };
                if this.relayed_addr().is_none() {
                    return;
                }
                match this.refresh(None).await {
                    Ok(lifetime) => {
                        tracing::debug!(server = %this.config.server, ?lifetime, "Refreshed allocation")
                    }
                    Err(e) => tracing::warn!(server = %this.config.server, "Allocation refresh failed: {e}"),
                }
            }
        });
        self.tasks.lock().expect("task mutex poisoned").push(handle);
    }

    fn spawn_keepalive_task(&self) {
        let weak = self.weak.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(KEEPALIVE_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(this) = weak.upgrade() else { return };
                let indication = Message::new(
                    MessageClass::Indication,
                    Method::BINDING,
                    TransactionId::new(),
                );
                if this
                    .sock
                    .send_stun_async(&indication, this.config.server)
                    .await
                    .is_err()
                {
                    return;
                }
            }
        });
        self.tasks.lock().expect("task mutex poisoned").push(handle);
    }

    fn forward_stun(&self, local: SocketAddr, from: SocketAddr, message: Message) {
        if let Some(callback) = self.callback() {
            callback.stun_message_received(local, from, message);
        }
    }

    fn forward_data(&self, local: SocketAddr, peer: SocketAddr, data: Vec<u8>) {
        if let Some(callback) = self.callback() {
            callback.data_received(local, peer, data);
        }
    }

    fn callback(&self) -> Option<Arc<dyn SocketEvents>> {
        self.callback
            .lock()
            .expect("callback mutex poisoned")
            .as_ref()
            .and_then(Weak::upgrade)
    }
}

impl SocketEvents for TurnSocket {
    fn stun_message_received(&self, local: SocketAddr, from: SocketAddr, message: Message) {
        // Data indications from the server carry peer traffic that must look
        // like it arrived on the relayed address.
        if message.method() == Method::DATA && message.class() == MessageClass::Indication {
            if from != self.config.server {
                tracing::warn!(%from, "Dropping data indication from unknown address");
                return;
            }
            let Some(peer) = message.xor_peer_address() else {
                tracing::warn!("Data indication without XOR-PEER-ADDRESS");
                return;
            };
            let Some(data) = message.data() else {
                tracing::warn!("Data indication without DATA");
                return;
            };
            let Some(relayed) = self.relayed_addr() else {
                tracing::warn!("Data indication without an allocation");
                return;
            };

            // A STUN message tunneled to our relayed address (a peer's
            // connectivity check or a response to ours) re-enters the
            // receive pipeline while negotiation is still running; after
            // promotion everything unwrapped here is application payload.
            if self.sock.mode() == SockMode::Negotiation && !turn::is_channel_data(data) {
                if let Ok(inner) = Message::parse(data) {
                    if inner.method() == Method::BINDING {
                        self.sock.inject_stun(relayed, peer, inner);
                        return;
                    }
                }
            }

            self.forward_data(relayed, peer, data.to_vec());
            return;
        }

        self.forward_stun(local, from, message);
    }

    fn data_received(&self, local: SocketAddr, peer: SocketAddr, data: Vec<u8>) {
        // Payloads that parse as STUN re-enter the receive pipeline only
        // while negotiation is still running.
        if self.sock.mode() == SockMode::Negotiation {
            if let Ok(inner) = Message::parse(&data) {
                if inner.method() == Method::BINDING {
                    if let Some(relayed) = self.relayed_addr() {
                        self.sock.inject_stun(relayed, peer, inner);
                        return;
                    }
                }
            }
        }

        let channel_bound = self
            .sock
            .channels()
            .lock()
            .expect("channel mutex poisoned")
            .channel_to_peer(peer, Instant::now())
            .is_some();
        let local = match (channel_bound, self.relayed_addr()) {
            (true, Some(relayed)) => relayed,
            _ => local,
        };

        self.forward_data(local, peer, data);
    }
}

/// Channel number bookkeeping for one socket.
///
/// A binding lives 10 minutes on the server and is restarted by a successful
/// ChannelBind refresh; we only treat confirmed, unexpired bindings as
/// usable.
pub(super) struct ChannelBindings {
    inner: HashMap<u16, Channel>,
    next: u16,
}

#[derive(Debug, Clone, Copy)]
struct Channel {
    peer: SocketAddr,
    bound: bool,
    bound_at: Instant,
    last_used: Instant,
}

impl Default for ChannelBindings {
    fn default() -> Self {
        ChannelBindings {
            inner: HashMap::new(),
            next: FIRST_CHANNEL,
        }
    }
}

impl ChannelBindings {
    const CHANNEL_LIFETIME: Duration = Duration::from_secs(10 * 60);

    pub(super) fn new_channel_to_peer(&mut self, peer: SocketAddr, now: Instant) -> Option<u16> {
        let number = if self.next <= LAST_CHANNEL {
            let n = self.next;
            self.next += 1;
            n
        } else {
            // Exhausted: evict the least recently used binding, reuse its
            // number.
            let lru = self
                .inner
                .iter()
                .min_by_key(|(_, c)| c.last_used)
                .map(|(n, _)| *n)?;
            self.inner.remove(&lru);
            lru
        };

        self.inner.insert(
            number,
            Channel {
                peer,
                bound: false,
                bound_at: now,
                last_used: now,
            },
        );

        Some(number)
    }

    pub(super) fn set_confirmed(&mut self, number: u16, now: Instant) -> bool {
        let Some(channel) = self.inner.get_mut(&number) else {
            return false;
        };
        channel.bound = true;
        channel.bound_at = now;
        channel.last_used = now;
        true
    }

    pub(super) fn handle_failed_binding(&mut self, number: u16) {
        self.inner.remove(&number);
    }

    /// The confirmed, unexpired channel bound to `peer`, if any.
    pub(super) fn channel_to_peer(&mut self, peer: SocketAddr, now: Instant) -> Option<u16> {
        let (number, channel) = self.inner.iter_mut().find(|(_, c)| {
            c.peer == peer && c.bound && now.duration_since(c.bound_at) < Self::CHANNEL_LIFETIME
        })?;
        channel.last_used = now;
        Some(*number)
    }

    /// Resolves an inbound channel number to its peer and records the
    /// activity.
    pub(super) fn record_received(&mut self, number: u16, now: Instant) -> Option<SocketAddr> {
        let channel = self.inner.get_mut(&number)?;
        channel.last_used = now;
        Some(channel.peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEER1: &str = "127.0.0.1:10000";
    const PEER2: &str = "127.0.0.1:20000";

    fn peer(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn hands_out_channels_monotonically() {
        let mut channels = ChannelBindings::default();
        let now = Instant::now();

        assert_eq!(channels.new_channel_to_peer(peer(PEER1), now), Some(0x4000));
        assert_eq!(channels.new_channel_to_peer(peer(PEER2), now), Some(0x4001));
    }

    #[test]
    fn unconfirmed_channel_is_not_usable() {
        let mut channels = ChannelBindings::default();
        let now = Instant::now();

        let number = channels.new_channel_to_peer(peer(PEER1), now).unwrap();
        assert_eq!(channels.channel_to_peer(peer(PEER1), now), None);

        channels.set_confirmed(number, now);
        assert_eq!(channels.channel_to_peer(peer(PEER1), now), Some(number));
    }

    #[test]
    fn expired_channel_is_not_usable() {
        let mut channels = ChannelBindings::default();
        let start = Instant::now();

        let number = channels.new_channel_to_peer(peer(PEER1), start).unwrap();
        channels.set_confirmed(number, start);

        let after_expiry = start + ChannelBindings::CHANNEL_LIFETIME + Duration::from_secs(1);
        assert_eq!(channels.channel_to_peer(peer(PEER1), after_expiry), None);
    }

    #[test]
    fn confirming_restarts_the_lifetime() {
        let mut channels = ChannelBindings::default();
        let start = Instant::now();

        let number = channels.new_channel_to_peer(peer(PEER1), start).unwrap();
        channels.set_confirmed(number, start);

        let later = start + Duration::from_secs(9 * 60);
        channels.set_confirmed(number, later);

        let past_original_expiry = start + ChannelBindings::CHANNEL_LIFETIME + Duration::from_secs(1);
        assert_eq!(
            channels.channel_to_peer(peer(PEER1), past_original_expiry),
            Some(number)
        );
    }

    #[test]
    fn exhaustion_reuses_least_recently_used_number() {
        let mut channels = ChannelBindings::default();
        let start = Instant::now();

        for i in 0..=(LAST_CHANNEL - FIRST_CHANNEL) {
            let addr: SocketAddr = format!("127.0.0.1:{}", 1000 + i).parse().unwrap();
            let number = channels.new_channel_to_peer(addr, start).unwrap();
            channels.set_confirmed(number, start);
        }

        // Touch every channel except 0x4005 so it becomes the LRU.
        let later = start + Duration::from_secs(30);
        for i in 0..=(LAST_CHANNEL - FIRST_CHANNEL) {
            if FIRST_CHANNEL + i != 0x4005 {
                let addr: SocketAddr = format!("127.0.0.1:{}", 1000 + i).parse().unwrap();
                channels.channel_to_peer(addr, later);
            }
        }

        let number = channels.new_channel_to_peer(peer(PEER1), later).unwrap();
        assert_eq!(number, 0x4005);
    }

    #[test]
    fn failed_binding_removes_state() {
        let mut channels = ChannelBindings::default();
        let now = Instant::now();

        let number = channels.new_channel_to_peer(peer(PEER1), now).unwrap();
        channels.handle_failed_binding(number);

        assert_eq!(channels.record_received(number, now), None);
    }
}
