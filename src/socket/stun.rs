//! The STUN server-socket: one bound UDP endpoint, framed.
//!
//! The read task classifies every datagram as a pending-transaction
//! response, a retransmitted request answered from the response cache, an
//! unsolicited STUN message surfaced to the callback, a ChannelData frame or
//! raw user payload. Keepalive indications are swallowed here.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::turn::ChannelBindings;
use super::{SockMode, SocketError};
use crate::stun::{Agent, Message, MessageClass, Method, TransactionId};
use crate::turn::{self, ChannelData};

pub const MAX_DATAGRAM: usize = 65536;
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(5);

const SEND_QUEUE_DEPTH: usize = 32;
const RESPONSE_CACHE_TTL: Duration = Duration::from_secs(5);
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);

/// Upward interface of a server-socket.
///
/// `local` is the address the traffic logically arrived on, which for
/// relayed traffic is the allocation's relayed address rather than the
/// bound one.
pub trait SocketEvents: Send + Sync {
    fn stun_message_received(&self, local: SocketAddr, from: SocketAddr, message: Message);
    fn data_received(&self, local: SocketAddr, peer: SocketAddr, data: Vec<u8>);
}

struct CachedResponse {
    cached_at: Instant,
    method: Method,
    raw: Vec<u8>,
}

pub struct StunSocket {
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

pub(super) struct Shared {
    socket: tokio::net::UdpSocket,
    local_addr: SocketAddr,
    agent: Agent,
    mode: Mutex<SockMode>,
    channels: Mutex<ChannelBindings>,
    response_cache: Mutex<HashMap<TransactionId, CachedResponse>>,
    send_tx: Mutex<Option<mpsc::Sender<(Vec<u8>, SocketAddr)>>>,
    callback: Mutex<Option<Weak<dyn SocketEvents>>>,
    sync_timeout: Duration,
    closed: AtomicBool,
}

impl StunSocket {
    pub async fn bind(addr: SocketAddr) -> Result<Arc<StunSocket>, SocketError> {
        Self::bind_with(addr, DEFAULT_SYNC_TIMEOUT).await
    }

    pub async fn bind_with(
        addr: SocketAddr,
        sync_timeout: Duration,
    ) -> Result<Arc<StunSocket>, SocketError> {
        let socket = tokio::net::UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;

        let (send_tx, send_rx) = mpsc::channel(SEND_QUEUE_DEPTH);

        let shared = Arc::new(Shared {
            socket,
            local_addr,
            agent: Agent::new(),
            mode: Mutex::new(SockMode::Negotiation),
            channels: Mutex::new(ChannelBindings::default()),
            response_cache: Mutex::new(HashMap::new()),
            send_tx: Mutex::new(Some(send_tx)),
            callback: Mutex::new(None),
            sync_timeout,
            closed: AtomicBool::new(false),
        });

        // The write task is not tracked: it drains the queue and exits on
        // its own once the last sender is dropped.
        tokio::spawn(write_loop(shared.clone(), send_rx));
        let tasks = vec![
            tokio::spawn(read_loop(shared.clone())),
            tokio::spawn(housekeeping_loop(shared.clone())),
        ];

        tracing::debug!(%local_addr, "Bound STUN server-socket");

        Ok(Arc::new(StunSocket {
            shared,
            tasks: Mutex::new(tasks),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn mode(&self) -> SockMode {
        *self.shared.mode.lock().expect("mode mutex poisoned")
    }

    pub fn set_mode(&self, mode: SockMode) {
        let mut current = self.shared.mode.lock().expect("mode mutex poisoned");
        tracing::debug!(local = %self.shared.local_addr, from = ?*current, to = ?mode, "Socket mode change");
        *current = mode;
    }

    pub fn set_callback(&self, callback: Weak<dyn SocketEvents>) {
        *self.shared.callback.lock().expect("callback mutex poisoned") = Some(callback);
    }

    pub(super) fn channels(&self) -> &Mutex<ChannelBindings> {
        &self.shared.channels
    }

    /// Enqueues one datagram. Blocks no longer than one bounded enqueue.
    pub async fn send_data(&self, data: Vec<u8>, to: SocketAddr) -> Result<(), SocketError> {
        let sender = self
            .shared
            .send_tx
            .lock()
            .expect("send mutex poisoned")
            .clone()
            .ok_or(SocketError::Closed)?;
        sender
            .send((data, to))
            .await
            .map_err(|_| SocketError::Closed)
    }

    /// Fire-and-forget STUN send. Responses are additionally stored in the
    /// response cache so retransmitted requests can be answered without
    /// involving the upper layer again.
    pub async fn send_stun_async(
        &self,
        message: &Message,
        to: SocketAddr,
    ) -> Result<(), SocketError> {
        let raw = message.encode();

        if message.class().is_response() {
            self.shared
                .response_cache
                .lock()
                .expect("cache mutex poisoned")
                .insert(
                    message.transaction_id(),
                    CachedResponse {
                        cached_at: Instant::now(),
                        method: message.method(),
                        raw: raw.clone(),
                    },
                );
        }

        self.send_data(raw, to).await
    }

    /// Sends a request and blocks until the matching response arrives or
    /// `sync_timeout` passes. Responses are matched strictly by transaction
    /// id; the response may come from a different address than `to`.
    pub async fn send_stun_sync(
        &self,
        message: Message,
        to: SocketAddr,
    ) -> Result<(Message, SocketAddr), SocketError> {
        let id = message.transaction_id();
        let timeout = self.shared.sync_timeout;

        let (tx, rx) = oneshot::channel();
        self.shared.agent.start(id, Instant::now() + timeout, move |result| {
            let _ = tx.send(result);
        })?;

        if let Err(e) = self.send_stun_async(&message, to).await {
            let _ = self.shared.agent.stop(id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok((response, from)))) => Ok((response, from)),
            Ok(Ok(Err(e))) => Err(e.into()),
            Ok(Err(_)) => Err(SocketError::WaiterClosed),
            Err(_) => {
                // The timeout path also removes the waiter, so no
                // registration can outlive the call.
                let _ = self
                    .shared
                    .agent
                    .stop_with_error(id, crate::stun::TransactionError::TimedOut);
                Err(SocketError::Timeout)
            }
        }
    }

    /// Re-feeds a STUN message into the receive pipeline with an overridden
    /// apparent local address. Used by the TURN wrapper for traffic unwrapped
    /// from Data indications and ChannelData.
    pub(super) fn inject_stun(&self, local: SocketAddr, from: SocketAddr, message: Message) {
        self.shared.stun_message_received(local, from, message);
    }

    /// Closes the connection, drains the send queue and fails every
    /// outstanding synchronous send.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(local = %self.shared.local_addr, "Closing STUN server-socket");

        // Dropping the sender lets the write task drain what is queued and
        // exit on its own.
        self.shared
            .send_tx
            .lock()
            .expect("send mutex poisoned")
            .take();
        self.shared.agent.close();

        let mut tasks = self.tasks.lock().expect("task mutex poisoned");
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for StunSocket {
    fn drop(&mut self) {
        self.close();
    }
}

impl Shared {
    fn handle_datagram(&self, packet: &[u8], from: SocketAddr) {
        if turn::is_channel_data(packet) {
            self.handle_channel_data(packet, from);
            return;
        }

        let message = match Message::parse(packet) {
            Ok(message) => message,
            Err(e) => {
                tracing::trace!(%from, len = packet.len(), "Datagram is not STUN ({e}), surfacing as data");
                self.deliver_data(self.local_addr, from, packet.to_vec());
                return;
            }
        };

        // Binding and Send indications are pure keepalives.
        if message.class() == MessageClass::Indication
            && matches!(message.method(), Method::BINDING | Method::SEND)
        {
            return;
        }

        self.stun_message_received(self.local_addr, from, message);
    }

    /// The shared tail of the receive path: pending transaction, then
    /// response cache, then the callback.
    fn stun_message_received(&self, local: SocketAddr, from: SocketAddr, message: Message) {
        tracing::trace!(%local, %from, %message, "Received STUN message");

        let message = match self.agent.process(message, from) {
            Ok(Some(message)) => message,
            Ok(None) | Err(_) => return,
        };

        if message.class() == MessageClass::Request && self.replay_cached_response(&message, from) {
            return;
        }

        if let Some(callback) = self.callback() {
            callback.stun_message_received(local, from, message);
        }
    }

    fn handle_channel_data(&self, packet: &[u8], from: SocketAddr) {
        let mode = *self.mode.lock().expect("mode mutex poisoned");
        match mode {
            SockMode::Negotiation => {
                tracing::warn!(%from, "Dropping channel-data received during negotiation");
            }
            SockMode::StunData => {
                // Plain payload whose first byte happens to land in the
                // channel range.
                self.deliver_data(self.local_addr, from, packet.to_vec());
            }
            SockMode::TurnData => {
                let frame = match ChannelData::parse(packet) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::warn!(%from, "Malformed channel-data: {e}");
                        return;
                    }
                };
                let peer = self
                    .channels
                    .lock()
                    .expect("channel mutex poisoned")
                    .record_received(frame.number(), Instant::now());
                let Some(peer) = peer else {
                    tracing::debug!(channel = frame.number(), "Data on unbound channel");
                    return;
                };
                self.deliver_data(self.local_addr, peer, frame.payload().to_vec());
            }
        }
    }

    /// Replays a cached response for a retransmitted request, keeping
    /// replies idempotent without re-running the upper layer.
    fn replay_cached_response(&self, request: &Message, from: SocketAddr) -> bool {
        let raw = {
            let mut cache = self.response_cache.lock().expect("cache mutex poisoned");
            let now = Instant::now();
            cache.retain(|_, c| now.duration_since(c.cached_at) < RESPONSE_CACHE_TTL);
            match cache.get(&request.transaction_id()) {
                Some(cached) if cached.method == request.method() => cached.raw.clone(),
                _ => return false,
            }
        };

        tracing::debug!(id = ?request.transaction_id(), %from, "Replaying cached response");
        self.try_send(raw, from);
        true
    }

    fn deliver_data(&self, local: SocketAddr, peer: SocketAddr, data: Vec<u8>) {
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

    fn try_send(&self, data: Vec<u8>, to: SocketAddr) {
        let sender = self
            .send_tx
            .lock()
            .expect("send mutex poisoned")
            .clone();
        if let Some(sender) = sender {
            if sender.try_send((data, to)).is_err() {
                tracing::warn!(%to, "Send queue full, dropping datagram");
            }
        }
    }
}

async fn read_loop(shared: Arc<Shared>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        match shared.socket.recv_from(&mut buf).await {
            Ok((len, from)) => shared.handle_datagram(&buf[..len], from),
            Err(e) => {
                if shared.closed.load(Ordering::SeqCst) {
                    return;
                }
                tracing::debug!("UDP receive error: {e}");
            }
        }
    }
}

async fn write_loop(shared: Arc<Shared>, mut rx: mpsc::Receiver<(Vec<u8>, SocketAddr)>) {
    while let Some((data, to)) = rx.recv().await {
        // Write errors are non-fatal for asynchronous sends.
        if let Err(e) = shared.socket.send_to(&data, to).await {
            tracing::debug!(%to, "UDP send error: {e}");
        }
    }
}

async fn housekeeping_loop(shared: Arc<Shared>) {
    let mut interval = tokio::time::interval(HOUSEKEEPING_INTERVAL);
    loop {
        interval.tick().await;
        if shared.agent.collect(Instant::now()).is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stun::Attribute;
    use std::sync::atomic::AtomicUsize;

    struct Responder {
        socket: Mutex<Option<Arc<StunSocket>>>,
        requests_seen: AtomicUsize,
    }

    impl Responder {
        fn new() -> Arc<Self> {
            Arc::new(Responder {
                socket: Mutex::new(None),
                requests_seen: AtomicUsize::new(0),
            })
        }
    }

    impl SocketEvents for Responder {
        fn stun_message_received(&self, _local: SocketAddr, from: SocketAddr, message: Message) {
            self.requests_seen.fetch_add(1, Ordering::SeqCst);

            let mut response = Message::new(
                MessageClass::SuccessResponse,
                message.method(),
                message.transaction_id(),
            );
            response.add_attribute(Attribute::XorMappedAddress(from));
            response.add_fingerprint();

            let socket = self.socket.lock().unwrap().clone().unwrap();
            tokio::spawn(async move {
                socket.send_stun_async(&response, from).await.unwrap();
            });
        }

        fn data_received(&self, _local: SocketAddr, _peer: SocketAddr, _data: Vec<u8>) {}
    }

    fn binding_request() -> Message {
        let mut request = Message::new(
            MessageClass::Request,
            Method::BINDING,
            TransactionId::new(),
        );
        request.add_fingerprint();
        request
    }

    fn any_addr() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn sync_send_receives_matching_response() {
        let responder = Responder::new();
        let server = StunSocket::bind(any_addr()).await.unwrap();
        *responder.socket.lock().unwrap() = Some(server.clone());
        let responder_dyn: Arc<dyn SocketEvents> = responder.clone();
        server.set_callback(Arc::downgrade(&responder_dyn));

        let client = StunSocket::bind(any_addr()).await.unwrap();

        let (response, from) = client
            .send_stun_sync(binding_request(), server.local_addr())
            .await
            .unwrap();

        assert_eq!(from, server.local_addr());
        assert_eq!(response.class(), MessageClass::SuccessResponse);
        assert_eq!(response.xor_mapped_address(), Some(client.local_addr()));
    }

    #[tokio::test]
    async fn sync_send_times_out_against_silence() {
        let client = StunSocket::bind_with(any_addr(), Duration::from_millis(100))
            .await
            .unwrap();
        let silent = tokio::net::UdpSocket::bind(any_addr()).await.unwrap();

        let result = client
            .send_stun_sync(binding_request(), silent.local_addr().unwrap())
            .await;

        assert!(matches!(result, Err(SocketError::Timeout)));
    }

    #[tokio::test]
    async fn retransmitted_request_is_answered_from_cache() {
        let responder = Responder::new();
        let server = StunSocket::bind(any_addr()).await.unwrap();
        *responder.socket.lock().unwrap() = Some(server.clone());
        let responder_dyn: Arc<dyn SocketEvents> = responder.clone();
        server.set_callback(Arc::downgrade(&responder_dyn));

        let client = tokio::net::UdpSocket::bind(any_addr()).await.unwrap();
        let request = binding_request().encode();

        let mut responses = Vec::new();
        let mut buf = [0u8; MAX_DATAGRAM];
        for _ in 0..2 {
            client.send_to(&request, server.local_addr()).await.unwrap();
            let (len, _) = tokio::time::timeout(
                Duration::from_secs(2),
                client.recv_from(&mut buf),
            )
            .await
            .unwrap()
            .unwrap();
            responses.push(buf[..len].to_vec());
        }

        // Identical responses, and the upper layer ran only once.
        assert_eq!(responses[0], responses[1]);
        assert_eq!(responder.requests_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_stun_datagrams_surface_as_data() {
        struct Sink {
            received: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
            notify: tokio::sync::Notify,
        }
        impl SocketEvents for Sink {
            fn stun_message_received(&self, _: SocketAddr, _: SocketAddr, _: Message) {}
            fn data_received(&self, _local: SocketAddr, peer: SocketAddr, data: Vec<u8>) {
                self.received.lock().unwrap().push((peer, data));
                self.notify.notify_one();
            }
        }

        let sink = Arc::new(Sink {
            received: Mutex::new(Vec::new()),
            notify: tokio::sync::Notify::new(),
        });
        let server = StunSocket::bind(any_addr()).await.unwrap();
        let sink_dyn: Arc<dyn SocketEvents> = sink.clone();
        server.set_callback(Arc::downgrade(&sink_dyn));

        let client = tokio::net::UdpSocket::bind(any_addr()).await.unwrap();
        client
            .send_to(b"definitely not stun", server.local_addr())
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), sink.notify.notified())
            .await
            .unwrap();

        let received = sink.received.lock().unwrap();
        assert_eq!(received[0].0, client.local_addr().unwrap());
        assert_eq!(received[0].1, b"definitely not stun");
    }

    #[tokio::test]
    async fn closed_socket_rejects_sends() {
        let socket = StunSocket::bind(any_addr()).await.unwrap();
        let target = socket.local_addr();
        socket.close();

        assert!(matches!(
            socket.send_data(b"x".to_vec(), target).await,
            Err(SocketError::Closed)
        ));
        assert!(matches!(
            socket.send_stun_sync(binding_request(), target).await,
            Err(SocketError::Closed | SocketError::Agent(_))
        ));
    }
}
