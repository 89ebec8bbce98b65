//! The ICE session: checklist state machine, triggered checks, nomination.
//!
//! The session runs as one task owning all mutable state. Sockets deliver
//! inbound traffic as commands over a channel, a Ta-paced ticker drives
//! ordinary checks and retransmissions, and results flow out through the
//! event stream.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::mpsc;

use super::candidate::{Candidate, CandidateKind};
use super::gather::{self, GatherConfig, Gathered};
use super::pair::{CandidatePair, CheckState};
use super::IceError;
use crate::socket::{NetSocket, SockMode, SocketEvents, TurnSocket};
use crate::stun::attr::errors;
use crate::stun::{Attribute, IntegrityKey, Message, MessageClass, Method};

/// Default Ta: pacing between ordinary connectivity checks.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Controlling,
    Controlled,
}

impl Role {
    fn flipped(self) -> Role {
        match self {
            Role::Controlling => Role::Controlled,
            Role::Controlled => Role::Controlling,
        }
    }
}

/// Username fragment and password for connectivity checks. The remote side's
/// password keys our outbound checks; ours keys everything we receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCredentials {
    pub ufrag: String,
    pub pwd: String,
}

impl IceCredentials {
    /// At least 24 bits of randomness for the ufrag and 128 for the
    /// password.
    fn random() -> Self {
        IceCredentials {
            ufrag: random_string(8),
            pwd: random_string(24),
        }
    }
}

fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// What the signaling channel delivered about the remote side.
#[derive(Debug, Clone)]
pub struct RemoteDescription {
    pub ufrag: String,
    pub pwd: String,
    pub candidates: Vec<Candidate>,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub gather: GatherConfig,
    /// Ta, the pacing of scheduled checks.
    pub check_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            gather: GatherConfig::default(),
            check_interval: DEFAULT_CHECK_INTERVAL,
        }
    }
}

/// Session lifecycle and data events.
#[derive(Debug)]
pub enum IceEvent {
    GatheringComplete { candidates: Vec<Candidate> },
    Negotiating,
    Succeeded { local: Candidate, remote: Candidate },
    Failed(IceError),
    Data {
        local: SocketAddr,
        peer: SocketAddr,
        payload: Vec<u8>,
    },
}

enum Cmd {
    SetRole(Role),
    SetRemote(RemoteDescription),
    Send(Vec<u8>),
    Stun {
        local: SocketAddr,
        from: SocketAddr,
        message: Message,
    },
    Data {
        local: SocketAddr,
        peer: SocketAddr,
        data: Vec<u8>,
    },
    Close,
}

/// Handle to a running ICE session.
///
/// Dropping the handle closes the session; inbound traffic and state changes
/// arrive on the event receiver returned by [`IceSession::gather`].
pub struct IceSession {
    cmd_tx: mpsc::UnboundedSender<Cmd>,
    local_credentials: IceCredentials,
    local_candidates: Vec<Candidate>,
    // Keeps the sockets' weak callback handle alive.
    _adapter: Arc<CallbackAdapter>,
}

impl IceSession {
    /// Gathers candidates per the config and starts the session task.
    pub async fn gather(
        config: SessionConfig,
    ) -> Result<(IceSession, mpsc::UnboundedReceiver<IceEvent>), IceError> {
        let gathered = gather::gather(&config.gather).await?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let adapter = Arc::new(CallbackAdapter {
            cmd_tx: cmd_tx.clone(),
        });
        let adapter_dyn: Arc<dyn SocketEvents> = adapter.clone();
        for socket in &gathered.sockets {
            let weak: Weak<dyn SocketEvents> = Arc::downgrade(&adapter_dyn);
            socket.set_callback(weak);
        }

        let local_credentials = IceCredentials::random();
        let local_candidates = gathered.candidates.clone();

        let _ = event_tx.send(IceEvent::GatheringComplete {
            candidates: local_candidates.clone(),
        });

        let machine = Machine::new(&config, local_credentials.clone(), gathered, event_tx);
        tokio::spawn(machine.run(cmd_rx, config.check_interval));

        Ok((
            IceSession {
                cmd_tx,
                local_credentials,
                local_candidates,
                _adapter: adapter,
            },
            event_rx,
        ))
    }

    pub fn local_credentials(&self) -> &IceCredentials {
        &self.local_credentials
    }

    pub fn local_candidates(&self) -> &[Candidate] {
        &self.local_candidates
    }

    pub fn set_role(&self, role: Role) {
        let _ = self.cmd_tx.send(Cmd::SetRole(role));
    }

    /// Hands over the remote candidate batch received via signaling and
    /// starts connectivity checks.
    pub fn set_remote(&self, remote: RemoteDescription) {
        let _ = self.cmd_tx.send(Cmd::SetRemote(remote));
    }

    /// Forwards payload through the nominated pair.
    pub fn send(&self, payload: Vec<u8>) -> Result<(), IceError> {
        self.cmd_tx
            .send(Cmd::Send(payload))
            .map_err(|_| IceError::Closed)
    }

    pub fn close(&self) {
        let _ = self.cmd_tx.send(Cmd::Close);
    }
}

impl Drop for IceSession {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(Cmd::Close);
    }
}

struct CallbackAdapter {
    cmd_tx: mpsc::UnboundedSender<Cmd>,
}

impl SocketEvents for CallbackAdapter {
    fn stun_message_received(&self, local: SocketAddr, from: SocketAddr, message: Message) {
        let _ = self.cmd_tx.send(Cmd::Stun {
            local,
            from,
            message,
        });
    }

    fn data_received(&self, local: SocketAddr, peer: SocketAddr, data: Vec<u8>) {
        let _ = self.cmd_tx.send(Cmd::Data { local, peer, data });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChecklistState {
    Running,
    Completed,
    Failed,
}

struct Machine {
    role: Role,
    tie_breaker: u64,
    local_creds: IceCredentials,
    remote: Option<RemoteDescription>,

    local_candidates: Vec<Candidate>,
    remote_candidates: Vec<Candidate>,
    pairs: Vec<CandidatePair>,
    /// Triggered-check FIFO, consumed before ordinary priority order. Holds
    /// (local_idx, remote_idx) so entries survive pair mutation.
    triggered: VecDeque<(usize, usize)>,

    checklist: ChecklistState,
    nominated: Option<usize>,
    nominate_at_tick: Option<u64>,
    tick: u64,
    prflx_counter: u32,

    sockets: Vec<NetSocket>,
    turn: Option<Arc<TurnSocket>>,
    events: mpsc::UnboundedSender<IceEvent>,
}

impl Machine {
    fn new(
        _config: &SessionConfig,
        local_creds: IceCredentials,
        gathered: Gathered,
        events: mpsc::UnboundedSender<IceEvent>,
    ) -> Self {
        Machine {
            role: Role::Controlled,
            tie_breaker: rand::random(),
            local_creds,
            remote: None,
            local_candidates: gathered.candidates,
            remote_candidates: Vec::new(),
            pairs: Vec::new(),
            triggered: VecDeque::new(),
            checklist: ChecklistState::Running,
            nominated: None,
            nominate_at_tick: None,
            tick: 0,
            prflx_counter: 0,
            sockets: gathered.sockets,
            turn: gathered.turn,
            events,
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Cmd>, check_interval: Duration) {
        let mut ticker = tokio::time::interval(check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    None | Some(Cmd::Close) => break,
                    Some(cmd) => self.handle_cmd(cmd).await,
                },
                _ = ticker.tick() => self.on_tick(Instant::now()).await,
            }
        }

        self.shutdown().await;
    }

    async fn handle_cmd(&mut self, cmd: Cmd) {
        match cmd {
            Cmd::SetRole(role) => {
                if role != self.role {
                    self.role = role;
                    self.reprioritize();
                }
            }
            Cmd::SetRemote(remote) => self.handle_set_remote(remote),
            Cmd::Send(payload) => self.send_user_data(payload).await,
            Cmd::Stun {
                local,
                from,
                message,
            } => self.handle_stun(local, from, message).await,
            Cmd::Data { local, peer, data } => {
                let _ = self.events.send(IceEvent::Data {
                    local,
                    peer,
                    payload: data,
                });
            }
            Cmd::Close => {}
        }
    }

    fn handle_set_remote(&mut self, remote: RemoteDescription) {
        tracing::info!(
            ufrag = %remote.ufrag,
            candidates = remote.candidates.len(),
            "Received remote description"
        );

        for candidate in &remote.candidates {
            self.add_remote_candidate(candidate.clone());
        }
        self.remote = Some(remote);

        // The relay only forwards traffic from peers a permission exists
        // for, so install them before any check reaches the relayed path.
        if let Some(turn) = self.turn.clone() {
            let peers: Vec<SocketAddr> =
                self.remote_candidates.iter().map(|c| c.addr()).collect();
            tokio::spawn(async move {
                if let Err(e) = turn.create_permission(&peers).await {
                    tracing::warn!("CreatePermission failed: {e}");
                }
            });
        }

        self.set_initial_states();
        let _ = self.events.send(IceEvent::Negotiating);
    }

    fn add_remote_candidate(&mut self, candidate: Candidate) -> usize {
        let remote_idx = match self
            .remote_candidates
            .iter()
            .position(|c| c.addr() == candidate.addr())
        {
            Some(idx) => return idx,
            None => {
                self.remote_candidates.push(candidate);
                self.remote_candidates.len() - 1
            }
        };

        self.form_pairs_for_remote(remote_idx);
        remote_idx
    }

    /// Forms every pair of this remote with the local set: matching family
    /// and component, deduplicated by (local base, remote address) keeping
    /// the higher pair priority. The dedup is what replaces a
    /// server-reflexive local with its base.
    fn form_pairs_for_remote(&mut self, remote_idx: usize) {
        let controlling = self.role == Role::Controlling;

        for local_idx in 0..self.local_candidates.len() {
            let local = &self.local_candidates[local_idx];
            let remote = &self.remote_candidates[remote_idx];

            if local.addr().is_ipv4() != remote.addr().is_ipv4() {
                continue;
            }
            if local.component() != remote.component() {
                continue;
            }

            let priority =
                CandidatePair::calculate_priority(controlling, local.priority(), remote.priority());

            let redundant = self.pairs.iter_mut().find(|p| {
                self.local_candidates[p.local_idx].base() == local.base()
                    && self.remote_candidates[p.remote_idx].addr() == remote.addr()
            });

            if let Some(existing) = redundant {
                if existing.priority < priority {
                    tracing::debug!(
                        local = %self.local_candidates[local_idx],
                        "Replacing redundant pair with higher-priority local"
                    );
                    existing.local_idx = local_idx;
                    existing.priority = priority;
                }
                continue;
            }

            self.pairs
                .push(CandidatePair::new(local_idx, remote_idx, priority));
        }
    }

    /// The highest-priority pair per foundation goes to Waiting, all others
    /// stay Frozen.
    fn set_initial_states(&mut self) {
        let mut best: HashMap<String, usize> = HashMap::new();
        for (idx, pair) in self.pairs.iter().enumerate() {
            if pair.state != CheckState::Frozen {
                continue;
            }
            let key = self.foundation_key(pair);
            match best.get(&key) {
                Some(&other) if self.pairs[other].priority >= pair.priority => {}
                _ => {
                    best.insert(key, idx);
                }
            }
        }
        for idx in best.into_values() {
            self.pairs[idx].state = CheckState::Waiting;
        }
    }

    fn foundation_key(&self, pair: &CandidatePair) -> String {
        format!(
            "{}:{}",
            self.local_candidates[pair.local_idx].foundation(),
            self.remote_candidates[pair.remote_idx].foundation()
        )
    }

    async fn on_tick(&mut self, now: Instant) {
        self.tick += 1;

        if self.checklist != ChecklistState::Running || self.remote.is_none() {
            return;
        }

        // Retransmissions and check timeouts first.
        let mut retransmit = Vec::new();
        let mut any_failed = false;
        for (idx, pair) in self.pairs.iter_mut().enumerate() {
            if pair.timed_out(now) {
                tracing::debug!(pair = idx, "Check timed out");
                pair.state = CheckState::Failed;
                pair.finish_round();
                any_failed = true;
            } else if pair.retransmit_due(now) {
                retransmit.push(idx);
            }
        }
        for idx in retransmit {
            if let Some(id) = self.pairs[idx].record_retransmit(now) {
                self.transmit_check(idx, id).await;
            }
        }
        if any_failed {
            self.evaluate_failure();
            if self.checklist != ChecklistState::Running {
                return;
            }
        }

        self.maybe_schedule_nomination();

        if let Some(idx) = self.next_pair_to_check() {
            self.send_check(idx, now).await;
        }
    }

    /// Controlling side: once a valid pair exists, wait one additional check
    /// interval, then re-check the highest-priority valid pair with
    /// USE-CANDIDATE.
    fn maybe_schedule_nomination(&mut self) {
        if self.role != Role::Controlling || self.nominated.is_some() {
            return;
        }
        if self.pairs.iter().any(|p| p.nominating) {
            return;
        }
        if !self.pairs.iter().any(|p| p.state == CheckState::Succeeded) {
            self.nominate_at_tick = None;
            return;
        }

        match self.nominate_at_tick {
            None => self.nominate_at_tick = Some(self.tick + 1),
            Some(at) if self.tick >= at => {
                let best = self
                    .pairs
                    .iter_mut()
                    .enumerate()
                    .filter(|(_, p)| p.state == CheckState::Succeeded)
                    .max_by_key(|(_, p)| p.priority);
                if let Some((idx, pair)) = best {
                    tracing::debug!(pair = idx, "Nominating");
                    pair.nominating = true;
                    pair.reset_for_retry();
                    let entry = (pair.local_idx, pair.remote_idx);
                    self.push_triggered_front(entry);
                }
            }
            Some(_) => {}
        }
    }

    /// Triggered queue first, then the highest-priority Waiting pair, then
    /// unfreezing: promote the best Frozen pair whose foundation has no
    /// Waiting or InProgress pair.
    fn next_pair_to_check(&mut self) -> Option<usize> {
        while let Some((local_idx, remote_idx)) = self.triggered.pop_front() {
            if let Some(idx) = self
                .pairs
                .iter()
                .position(|p| p.local_idx == local_idx && p.remote_idx == remote_idx)
            {
                if self.pairs[idx].state == CheckState::Waiting {
                    return Some(idx);
                }
            }
        }

        if let Some((idx, _)) = self
            .pairs
            .iter()
            .enumerate()
            .filter(|(_, p)| p.state == CheckState::Waiting)
            .max_by_key(|(_, p)| p.priority)
        {
            return Some(idx);
        }

        let active: HashSet<String> = self
            .pairs
            .iter()
            .filter(|p| matches!(p.state, CheckState::Waiting | CheckState::InProgress))
            .map(|p| self.foundation_key(p))
            .collect();
        let promote = self
            .pairs
            .iter()
            .enumerate()
            .filter(|(_, p)| p.state == CheckState::Frozen)
            .filter(|(_, p)| !active.contains(&self.foundation_key(p)))
            .max_by_key(|(_, p)| p.priority)
            .map(|(idx, _)| idx);
        if let Some(idx) = promote {
            self.pairs[idx].state = CheckState::Waiting;
            return Some(idx);
        }

        None
    }

    fn push_triggered_front(&mut self, entry: (usize, usize)) {
        self.triggered.retain(|e| *e != entry);
        self.triggered.push_front(entry);
    }

    async fn send_check(&mut self, idx: usize, now: Instant) {
        let use_candidate = self.role == Role::Controlling && self.pairs[idx].nominating;
        let id = self.pairs[idx].begin_check(now, use_candidate);
        self.transmit_check(idx, id).await;
    }

    /// Sends (or retransmits) the current check round of a pair. Retransmits
    /// reuse the round's transaction id and attributes, so the datagram is
    /// byte-identical.
    async fn transmit_check(&mut self, idx: usize, id: crate::stun::TransactionId) {
        let Some(remote_desc) = &self.remote else {
            return;
        };
        let pair = &self.pairs[idx];
        let local = &self.local_candidates[pair.local_idx];
        let remote = &self.remote_candidates[pair.remote_idx];

        let mut message = Message::new(MessageClass::Request, Method::BINDING, id);
        message.add_attribute(Attribute::Username(format!(
            "{}:{}",
            remote_desc.ufrag, self.local_creds.ufrag
        )));
        message.add_attribute(Attribute::Priority(local.peer_reflexive_priority()));
        match self.role {
            Role::Controlling => {
                message.add_attribute(Attribute::IceControlling(self.tie_breaker))
            }
            Role::Controlled => message.add_attribute(Attribute::IceControlled(self.tie_breaker)),
        }
        if pair.use_candidate() {
            message.add_attribute(Attribute::UseCandidate);
        }
        message.add_message_integrity(&IntegrityKey::short_term(&remote_desc.pwd));
        message.add_fingerprint();

        let (from, to) = (self.check_source(local), remote.addr());
        tracing::trace!(pair = idx, %from, %to, ?id, "Sending connectivity check");

        let Some(socket) = self.socket_for_local(pair.local_idx) else {
            tracing::warn!(local = %local, "No socket for check, failing pair");
            self.pairs[idx].state = CheckState::Failed;
            self.pairs[idx].finish_round();
            self.evaluate_failure();
            return;
        };
        let socket = socket.clone();
        if let Err(e) = socket.send_stun_async(&message, from, to).await {
            // Socket write errors are non-fatal; the retransmit timer takes
            // another swing.
            tracing::debug!(pair = idx, "Failed to send check: {e}");
        }
    }

    fn check_source(&self, local: &Candidate) -> SocketAddr {
        if local.kind() == CandidateKind::Relayed {
            local.addr()
        } else {
            local.base()
        }
    }

    fn socket_for_local(&self, local_idx: usize) -> Option<&NetSocket> {
        let local = &self.local_candidates[local_idx];
        match local.kind() {
            CandidateKind::Relayed => self
                .sockets
                .iter()
                .find(|s| s.relayed_addr() == Some(local.addr())),
            _ => self.sockets.iter().find(|s| s.local_addr() == local.base()),
        }
    }

    fn socket_for_addr(&self, local: SocketAddr) -> Option<&NetSocket> {
        self.sockets.iter().find(|s| s.owns_addr(local))
    }

    async fn handle_stun(&mut self, local: SocketAddr, from: SocketAddr, message: Message) {
        match message.class() {
            MessageClass::Request if message.method() == Method::BINDING => {
                self.handle_binding_request(local, from, message).await;
            }
            MessageClass::SuccessResponse | MessageClass::ErrorResponse => {
                self.handle_check_response(from, message).await;
            }
            _ => {
                tracing::trace!(%from, %message, "Ignoring STUN message");
            }
        }
    }

    async fn handle_binding_request(
        &mut self,
        local: SocketAddr,
        from: SocketAddr,
        message: Message,
    ) {
        // Inbound checks are keyed with our password.
        if message
            .verify_integrity(&IntegrityKey::short_term(&self.local_creds.pwd))
            .is_err()
        {
            tracing::debug!(%from, "Check failed integrity, dropping");
            return;
        }

        match message.username().and_then(|u| u.split_once(':')) {
            Some((local_ufrag, remote_ufrag)) => {
                if local_ufrag != self.local_creds.ufrag {
                    tracing::debug!(%from, local_ufrag, "Check for another session, dropping");
                    return;
                }
                if let Some(remote) = &self.remote {
                    if remote_ufrag != remote.ufrag {
                        tracing::debug!(%from, remote_ufrag, "Remote ufrag mismatch, dropping");
                        return;
                    }
                }
            }
            None => {
                tracing::debug!(%from, "Check without USERNAME, dropping");
                return;
            }
        }

        // RFC 5245 §7.2.1.1 role conflict, both directions.
        match self.role {
            Role::Controlling => {
                if let Some(peer_tb) = message.ice_controlling() {
                    if self.tie_breaker >= peer_tb {
                        self.send_role_conflict(local, from, &message).await;
                        return;
                    }
                    self.switch_role(Role::Controlled);
                }
            }
            Role::Controlled => {
                if let Some(peer_tb) = message.ice_controlled() {
                    if self.tie_breaker >= peer_tb {
                        self.switch_role(Role::Controlling);
                    } else {
                        self.send_role_conflict(local, from, &message).await;
                        return;
                    }
                }
            }
        }

        let use_candidate = message.use_candidate();
        if use_candidate && self.role == Role::Controlling {
            tracing::debug!(%from, "USE-CANDIDATE from a controlled peer, dropping");
            return;
        }

        // Reply first: the success response carries the observed source so
        // the peer can discover its own reflexive address.
        let mut response = Message::new(
            MessageClass::SuccessResponse,
            Method::BINDING,
            message.transaction_id(),
        );
        response.add_attribute(Attribute::XorMappedAddress(from));
        response.add_message_integrity(&IntegrityKey::short_term(&self.local_creds.pwd));
        response.add_fingerprint();
        if let Some(socket) = self.socket_for_addr(local) {
            let socket = socket.clone();
            if let Err(e) = socket.send_stun_async(&response, local, from).await {
                tracing::debug!(%from, "Failed to send check response: {e}");
            }
        } else {
            tracing::warn!(%local, "Check arrived on an address without a socket");
        }

        // Identify or synthesize the pair for a triggered check.
        let remote_idx = match self
            .remote_candidates
            .iter()
            .position(|c| c.addr() == from)
        {
            Some(idx) => idx,
            None => {
                let Some(priority) = message.priority() else {
                    tracing::debug!(%from, "Check from unknown source without PRIORITY, dropping");
                    return;
                };
                self.prflx_counter += 1;
                let candidate = Candidate::peer_reflexive(
                    from,
                    from,
                    priority,
                    1,
                    format!("prflx{}", self.prflx_counter),
                );
                tracing::debug!(candidate = %candidate, "Synthesized remote peer-reflexive candidate");
                self.add_remote_candidate(candidate)
            }
        };

        let Some(local_idx) = self.local_candidates.iter().position(|c| {
            matches!(c.kind(), CandidateKind::Host | CandidateKind::Relayed) && c.addr() == local
        }) else {
            tracing::warn!(%local, "Check for an address that is neither host nor relayed");
            return;
        };

        let idx = match self
            .pairs
            .iter()
            .position(|p| p.local_idx == local_idx && p.remote_idx == remote_idx)
        {
            Some(idx) => idx,
            None => {
                let local_c = &self.local_candidates[local_idx];
                let remote_c = &self.remote_candidates[remote_idx];
                let priority = CandidatePair::calculate_priority(
                    self.role == Role::Controlling,
                    local_c.priority(),
                    remote_c.priority(),
                );
                self.pairs
                    .push(CandidatePair::new(local_idx, remote_idx, priority));
                self.pairs.len() - 1
            }
        };

        let entry = (local_idx, remote_idx);
        let pair = &mut self.pairs[idx];
        match pair.state {
            CheckState::Frozen | CheckState::Waiting => {
                pair.state = CheckState::Waiting;
                self.push_triggered_front(entry);
            }
            CheckState::InProgress => {}
            CheckState::Failed => {
                pair.reset_for_retry();
                self.push_triggered_front(entry);
            }
            CheckState::Succeeded => {
                if use_candidate && self.role == Role::Controlled {
                    self.pairs[idx].nominated = true;
                    self.complete(idx).await;
                    return;
                }
            }
        }

        if use_candidate && self.role == Role::Controlled {
            self.pairs[idx].remote_nominated = true;
        }
    }

    async fn send_role_conflict(&self, local: SocketAddr, from: SocketAddr, request: &Message) {
        tracing::debug!(%from, "Role conflict, responding 487");

        let mut response = Message::new(
            MessageClass::ErrorResponse,
            Method::BINDING,
            request.transaction_id(),
        );
        response.add_attribute(Attribute::ErrorCode {
            code: errors::ROLE_CONFLICT,
            reason: errors::reason(errors::ROLE_CONFLICT).to_owned(),
        });
        // Our role attribute lets the peer compare tie-breakers.
        match self.role {
            Role::Controlling => {
                response.add_attribute(Attribute::IceControlling(self.tie_breaker))
            }
            Role::Controlled => response.add_attribute(Attribute::IceControlled(self.tie_breaker)),
        }
        response.add_message_integrity(&IntegrityKey::short_term(&self.local_creds.pwd));
        response.add_fingerprint();

        if let Some(socket) = self.socket_for_addr(local) {
            let socket = socket.clone();
            if let Err(e) = socket.send_stun_async(&response, local, from).await {
                tracing::debug!(%from, "Failed to send 487: {e}");
            }
        }
    }

    async fn handle_check_response(&mut self, from: SocketAddr, message: Message) {
        let id = message.transaction_id();
        let Some(idx) = self.pairs.iter().position(|p| p.matches(id)) else {
            tracing::trace!(?id, %from, "Response matches no pair, dropping");
            return;
        };

        // Responses are keyed with the peer's password, i.e. our remote one.
        if let Some(remote) = &self.remote {
            if message
                .verify_integrity(&IntegrityKey::short_term(&remote.pwd))
                .is_err()
            {
                tracing::debug!(%from, "Check response failed integrity, dropping");
                return;
            }
        }

        if message.class() == MessageClass::ErrorResponse {
            match message.error_code() {
                Some((errors::ROLE_CONFLICT, _)) => self.handle_role_conflict_response(idx, &message),
                other => {
                    tracing::debug!(pair = idx, ?other, "Check rejected");
                    self.pairs[idx].state = CheckState::Failed;
                    self.pairs[idx].finish_round();
                    self.evaluate_failure();
                }
            }
            return;
        }

        let Some(mapped) = message.mapped_address() else {
            tracing::debug!(pair = idx, "Check response without mapped address");
            self.pairs[idx].state = CheckState::Failed;
            self.pairs[idx].finish_round();
            self.evaluate_failure();
            return;
        };

        // A mapped address we have no candidate for is a freshly discovered
        // peer-reflexive candidate; the valid pair uses it as its local.
        let valid_idx = match self
            .local_candidates
            .iter()
            .position(|c| c.addr() == mapped)
        {
            Some(existing) => existing,
            None => {
                let base_local = &self.local_candidates[self.pairs[idx].local_idx];
                self.prflx_counter += 1;
                let candidate = Candidate::peer_reflexive(
                    mapped,
                    base_local.base(),
                    base_local.peer_reflexive_priority(),
                    base_local.component(),
                    format!("prflx{}", self.prflx_counter),
                );
                tracing::debug!(candidate = %candidate, "Discovered local peer-reflexive candidate");
                self.local_candidates.push(candidate);
                self.local_candidates.len() - 1
            }
        };

        let pair = &mut self.pairs[idx];
        pair.finish_round();
        pair.valid_idx = Some(valid_idx);
        pair.state = CheckState::Succeeded;
        tracing::debug!(pair = idx, %mapped, "Check succeeded");

        if pair.nominating || pair.remote_nominated {
            pair.nominated = true;
        }
        if self.pairs[idx].nominated {
            self.complete(idx).await;
        }
    }

    /// 487: compare tie-breakers with the peer's role attribute. Keep the
    /// role when ours is larger, otherwise switch and re-prioritize; the
    /// pair goes back to Waiting either way.
    fn handle_role_conflict_response(&mut self, idx: usize, message: &Message) {
        let peer_tb = message
            .ice_controlling()
            .or_else(|| message.ice_controlled());

        let keep_role = matches!(peer_tb, Some(tb) if self.tie_breaker > tb);
        if !keep_role {
            self.switch_role(self.role.flipped());
        } else {
            tracing::debug!("Peer reported a role conflict but our tie-breaker wins, retrying");
        }

        let pair = &mut self.pairs[idx];
        pair.reset_for_retry();
        let entry = (pair.local_idx, pair.remote_idx);
        self.push_triggered_front(entry);
    }

    fn switch_role(&mut self, role: Role) {
        tracing::info!(?role, "Switching ICE role");
        self.role = role;
        self.reprioritize();
    }

    /// Recomputes every pair priority for the current role. No pair is
    /// dropped.
    fn reprioritize(&mut self) {
        let controlling = self.role == Role::Controlling;
        for pair in &mut self.pairs {
            pair.priority = CandidatePair::calculate_priority(
                controlling,
                self.local_candidates[pair.local_idx].priority(),
                self.remote_candidates[pair.remote_idx].priority(),
            );
        }
    }

    async fn complete(&mut self, idx: usize) {
        // At most one nominated pair per component.
        if self.nominated.is_some() {
            return;
        }
        self.nominated = Some(idx);
        self.checklist = ChecklistState::Completed;
        self.nominate_at_tick = None;

        let pair = &self.pairs[idx];
        let send_local = &self.local_candidates[pair.local_idx];
        let mode = if send_local.kind() == CandidateKind::Relayed {
            SockMode::TurnData
        } else {
            SockMode::StunData
        };

        for socket in &self.sockets {
            socket.finish_negotiation(mode);
        }

        let local = self.local_candidates[pair.valid_idx.unwrap_or(pair.local_idx)].clone();
        let remote = self.remote_candidates[pair.remote_idx].clone();

        // Relayed path: bind a channel to cut the per-datagram indication
        // overhead.
        if mode == SockMode::TurnData {
            if let Some(turn) = self.turn.clone() {
                let peer = remote.addr();
                tokio::spawn(async move {
                    if let Err(e) = turn.channel_bind(peer).await {
                        tracing::warn!(%peer, "Channel bind failed: {e}");
                    }
                });
            }
        }

        tracing::info!(local = %local, remote = %remote, "ICE negotiation succeeded");
        let _ = self.events.send(IceEvent::Succeeded { local, remote });
    }

    fn evaluate_failure(&mut self) {
        if self.checklist != ChecklistState::Running {
            return;
        }
        let all_failed =
            !self.pairs.is_empty() && self.pairs.iter().all(|p| p.state == CheckState::Failed);
        if all_failed {
            tracing::warn!("Every candidate pair failed");
            self.checklist = ChecklistState::Failed;
            let _ = self.events.send(IceEvent::Failed(IceError::NoValidPair));
        }
    }

    async fn send_user_data(&mut self, payload: Vec<u8>) {
        let Some(idx) = self.nominated else {
            tracing::warn!("No nominated pair yet, dropping outbound payload");
            return;
        };
        let pair = &self.pairs[idx];
        let local = &self.local_candidates[pair.local_idx];
        let remote = &self.remote_candidates[pair.remote_idx];
        let (from, to) = (self.check_source(local), remote.addr());

        let Some(socket) = self.socket_for_local(pair.local_idx) else {
            return;
        };
        let socket = socket.clone();
        if let Err(e) = socket.send_data(from, to, &payload).await {
            tracing::warn!(%to, "Failed to send payload: {e}");
        }
    }

    async fn shutdown(&mut self) {
        tracing::debug!("Shutting down ICE session");
        for socket in &self.sockets {
            socket.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stun::TransactionId;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn machine() -> Machine {
        let (events, _rx) = mpsc::unbounded_channel();
        Machine {
            role: Role::Controlling,
            tie_breaker: 1000,
            local_creds: IceCredentials {
                ufrag: "locF".into(),
                pwd: "local-password-eighteen+".into(),
            },
            remote: Some(RemoteDescription {
                ufrag: "remF".into(),
                pwd: "remote-password-eighteen".into(),
                candidates: Vec::new(),
            }),
            local_candidates: Vec::new(),
            remote_candidates: Vec::new(),
            pairs: Vec::new(),
            triggered: VecDeque::new(),
            checklist: ChecklistState::Running,
            nominated: None,
            nominate_at_tick: None,
            tick: 0,
            prflx_counter: 0,
            sockets: Vec::new(),
            turn: None,
            events,
        }
    }

    fn host(s: &str) -> Candidate {
        Candidate::host(addr(s), 1)
    }

    #[test]
    fn pair_formation_dedupes_srflx_by_base() {
        let mut m = machine();
        m.local_candidates.push(host("10.0.0.1:5000"));
        m.local_candidates.push(Candidate::server_reflexive(
            addr("203.0.113.9:40000"),
            addr("10.0.0.1:5000"),
            addr("192.0.2.1:3478"),
            1,
        ));

        m.add_remote_candidate(host("10.0.0.2:6000"));

        // One pair: the server-reflexive local shares its base with the host
        // candidate, and the host pair has the higher priority.
        assert_eq!(m.pairs.len(), 1);
        assert_eq!(m.pairs[0].local_idx, 0);
    }

    #[test]
    fn pair_formation_respects_family_boundaries() {
        let mut m = machine();
        m.local_candidates.push(host("10.0.0.1:5000"));

        m.add_remote_candidate(host("[2001:db8::1]:6000"));
        assert!(m.pairs.is_empty());

        m.add_remote_candidate(host("10.0.0.2:6000"));
        assert_eq!(m.pairs.len(), 1);
    }

    #[test]
    fn initial_states_unfreeze_one_pair_per_foundation() {
        let mut m = machine();
        m.local_candidates.push(host("10.0.0.1:5000"));
        m.add_remote_candidate(host("10.0.0.2:6000"));
        m.add_remote_candidate(host("10.0.0.2:6001"));

        m.set_initial_states();

        // Both remotes are host candidates on the same base, so both pairs
        // share a foundation key; only the best one unfreezes.
        let waiting = m
            .pairs
            .iter()
            .filter(|p| p.state == CheckState::Waiting)
            .count();
        assert_eq!(waiting, 1);
    }

    #[test]
    fn role_conflict_response_switches_when_tie_breaker_is_smaller() {
        let mut m = machine();
        m.tie_breaker = 10;
        m.local_candidates.push(host("10.0.0.1:5000"));
        m.add_remote_candidate(host("10.0.0.2:6000"));
        let before = m.pairs.len();

        let id = m.pairs[0].begin_check(Instant::now(), false);
        let mut response = Message::new(MessageClass::ErrorResponse, Method::BINDING, id);
        response.add_attribute(Attribute::ErrorCode {
            code: errors::ROLE_CONFLICT,
            reason: "Role Conflict".into(),
        });
        response.add_attribute(Attribute::IceControlling(999_999));

        m.handle_role_conflict_response(0, &response);

        assert_eq!(m.role, Role::Controlled);
        assert_eq!(m.pairs.len(), before, "no pair may be lost");
        assert_eq!(m.pairs[0].state, CheckState::Waiting);
        assert_eq!(m.triggered.len(), 1);
    }

    #[test]
    fn role_conflict_response_keeps_role_when_tie_breaker_is_larger() {
        let mut m = machine();
        m.tie_breaker = u64::MAX;
        m.local_candidates.push(host("10.0.0.1:5000"));
        m.add_remote_candidate(host("10.0.0.2:6000"));

        let id = m.pairs[0].begin_check(Instant::now(), false);
        let mut response = Message::new(MessageClass::ErrorResponse, Method::BINDING, id);
        response.add_attribute(Attribute::ErrorCode {
            code: errors::ROLE_CONFLICT,
            reason: "Role Conflict".into(),
        });
        response.add_attribute(Attribute::IceControlling(42));

        m.handle_role_conflict_response(0, &response);

        assert_eq!(m.role, Role::Controlling);
        assert_eq!(m.pairs[0].state, CheckState::Waiting);
    }

    #[tokio::test]
    async fn at_most_one_pair_is_nominated() {
        let mut m = machine();
        m.local_candidates.push(host("10.0.0.1:5000"));
        m.add_remote_candidate(host("10.0.0.2:6000"));
        m.add_remote_candidate(host("10.0.0.2:6001"));
        assert_eq!(m.pairs.len(), 2);

        m.pairs[0].state = CheckState::Succeeded;
        m.pairs[0].nominated = true;
        m.pairs[1].state = CheckState::Succeeded;
        m.pairs[1].nominated = true;

        m.complete(0).await;
        m.complete(1).await;

        assert_eq!(m.nominated, Some(0));
        assert_eq!(m.checklist, ChecklistState::Completed);
    }

    #[tokio::test]
    async fn inbound_check_from_unknown_source_synthesizes_peer_reflexive() {
        let mut m = machine();
        m.role = Role::Controlled;
        m.local_candidates.push(host("10.0.0.1:5000"));

        let source = addr("198.51.100.7:7000");
        let mut request = Message::new(MessageClass::Request, Method::BINDING, TransactionId::new());
        request.add_attribute(Attribute::Username("locF:remF".into()));
        request.add_attribute(Attribute::Priority(123_456));
        request.add_attribute(Attribute::IceControlling(7));
        request.add_message_integrity(&IntegrityKey::short_term(&m.local_creds.pwd));
        request.add_fingerprint();

        m.handle_binding_request(addr("10.0.0.1:5000"), source, request)
            .await;

        let prflx = m
            .remote_candidates
            .iter()
            .find(|c| c.addr() == source)
            .expect("peer-reflexive remote candidate");
        assert_eq!(prflx.kind(), CandidateKind::PeerReflexive);
        assert_eq!(prflx.priority(), 123_456);

        assert_eq!(m.pairs.len(), 1);
        assert_eq!(m.pairs[0].state, CheckState::Waiting);
        assert_eq!(m.triggered.len(), 1);
    }

    #[tokio::test]
    async fn inbound_check_with_bad_integrity_is_dropped() {
        let mut m = machine();
        m.role = Role::Controlled;
        m.local_candidates.push(host("10.0.0.1:5000"));

        let mut request = Message::new(MessageClass::Request, Method::BINDING, TransactionId::new());
        request.add_attribute(Attribute::Username("locF:remF".into()));
        request.add_attribute(Attribute::Priority(1));
        request.add_attribute(Attribute::IceControlling(7));
        request.add_message_integrity(&IntegrityKey::short_term("wrong-password"));
        request.add_fingerprint();

        m.handle_binding_request(addr("10.0.0.1:5000"), addr("198.51.100.7:7000"), request)
            .await;

        assert!(m.remote_candidates.is_empty());
        assert!(m.pairs.is_empty());
    }

    #[tokio::test]
    async fn successful_response_with_unknown_mapped_address_creates_valid_prflx() {
        let mut m = machine();
        m.local_candidates.push(host("10.0.0.1:5000"));
        m.add_remote_candidate(host("10.0.0.2:6000"));
        m.set_initial_states();

        let id = m.pairs[0].begin_check(Instant::now(), false);

        // The NAT rewrote our source; the peer reports an address we have no
        // candidate for.
        let mapped = addr("203.0.113.77:31000");
        let mut response = Message::new(MessageClass::SuccessResponse, Method::BINDING, id);
        response.add_attribute(Attribute::XorMappedAddress(mapped));
        response
            .add_message_integrity(&IntegrityKey::short_term(&m.remote.as_ref().unwrap().pwd));
        response.add_fingerprint();

        m.handle_check_response(addr("10.0.0.2:6000"), response).await;

        assert_eq!(m.pairs[0].state, CheckState::Succeeded);
        let valid_idx = m.pairs[0].valid_idx.unwrap();
        let valid = &m.local_candidates[valid_idx];
        assert_eq!(valid.kind(), CandidateKind::PeerReflexive);
        assert_eq!(valid.addr(), mapped);
        assert_eq!(valid.base(), addr("10.0.0.1:5000"));

        // A duplicate response must not produce a second valid entry.
        let count_before = m.local_candidates.len();
        let mut duplicate = Message::new(MessageClass::SuccessResponse, Method::BINDING, id);
        duplicate.add_attribute(Attribute::XorMappedAddress(mapped));
        m.handle_check_response(addr("10.0.0.2:6000"), duplicate).await;
        assert_eq!(m.local_candidates.len(), count_before);
    }
}
