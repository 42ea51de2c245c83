//! Client-side exchange tracking: correlates everything we send with everything the peer
//! sends back, owns completion, and drives the per-request send tasks.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use coap_lite::{MessageClass, MessageType, Packet};
use hashbrown::HashMap;
use log::{debug, trace, warn};
use tokio::sync::futures::Notified;
use tokio::sync::{mpsc, oneshot, Notify};

use crate::client::error::ClientError;
use crate::client::orderer::ObserveOrderer;
use crate::client::retransmission::SendFailed;
use crate::client::u24::u24;
use crate::client::util::{new_empty_ack, new_reset_message};
use crate::endpoint::{EndpointInner, Outgoing};

pub(crate) type MessageId = u16;

/// Undelivered notifications one observe relation may buffer before the engine starts
/// shedding new arrivals.
const NOTIFICATION_BACKLOG: usize = 8;

/// Deduplication key; message IDs are scoped to a single peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct KeyId {
    pub message_id: MessageId,
    pub peer: SocketAddr,
}

impl KeyId {
    pub fn new(packet: &Packet, peer: SocketAddr) -> Self {
        Self {
            message_id: packet.header.message_id,
            peer,
        }
    }
}

/// Response correlation key, valid across message-ID boundaries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct TokenKey {
    pub token: Vec<u8>,
    pub peer: SocketAddr,
}

impl TokenKey {
    pub fn new(token: Vec<u8>, peer: SocketAddr) -> Self {
        Self { token, peer }
    }
}

/// Per-request send parameters resolved by the request builder.
#[derive(Debug, Clone)]
pub(crate) struct SendOptions {
    pub confirmable: bool,
    pub max_retransmit: Option<usize>,
    pub observe: bool,
}

/// State for one request and the responses correlated to it.  Created when the request
/// driver submits a send; retired on response, rejection, exhaustion, cancellation, or
/// sweep eviction.
pub(crate) struct Exchange {
    key_token: TokenKey,
    key_id: KeyId,
    request: Packet,
    completed: AtomicBool,
    timestamp: Mutex<Instant>,
    result_tx: Mutex<Option<oneshot::Sender<Result<Packet, ClientError>>>>,
    observe: Option<Mutex<ObserveState>>,
    last_ack: Mutex<Option<Packet>>,
    done: Notify,
}

struct ObserveState {
    orderer: ObserveOrderer,
    notify_tx: mpsc::Sender<Result<Packet, ClientError>>,
    canceled: bool,
}

/// What the engine should do with the exchange after a response was routed to it.
pub(crate) enum Delivery {
    /// Response consumed the exchange; unregister it.
    Completed,
    /// Notification handled (delivered or dropped as stale); the exchange stays live.
    Notified,
    /// The observation was canceled locally; the peer should see a Reset so it stops
    /// notifying us.
    RejectCanceled,
}

impl Exchange {
    fn new(
        key_token: TokenKey,
        key_id: KeyId,
        request: Packet,
        result_tx: oneshot::Sender<Result<Packet, ClientError>>,
        notify_tx: Option<mpsc::Sender<Result<Packet, ClientError>>>,
    ) -> Self {
        Self {
            key_token,
            key_id,
            request,
            completed: AtomicBool::new(false),
            timestamp: Mutex::new(Instant::now()),
            result_tx: Mutex::new(Some(result_tx)),
            observe: notify_tx.map(|notify_tx| {
                Mutex::new(ObserveState {
                    orderer: ObserveOrderer::new(),
                    notify_tx,
                    canceled: false,
                })
            }),
            last_ack: Mutex::new(None),
            done: Notify::new(),
        }
    }

    pub fn key_token(&self) -> &TokenKey {
        &self.key_token
    }

    pub fn key_id(&self) -> &KeyId {
        &self.key_id
    }

    pub fn request(&self) -> &Packet {
        &self.request
    }

    pub fn is_observe(&self) -> bool {
        self.observe.is_some()
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn touch(&self) {
        *self.timestamp.lock().unwrap() = Instant::now();
    }

    pub fn age(&self) -> Duration {
        self.timestamp.lock().unwrap().elapsed()
    }

    #[cfg(test)]
    pub fn backdate(&self, by: Duration) {
        *self.timestamp.lock().unwrap() = Instant::now() - by;
    }

    /// Future resolving once the exchange reaches a terminal state.
    pub fn done_signal(&self) -> Notified<'_> {
        self.done.notified()
    }

    pub fn record_ack(&self, ack: Packet) {
        *self.last_ack.lock().unwrap() = Some(ack);
    }

    pub fn last_ack(&self) -> Option<Packet> {
        self.last_ack.lock().unwrap().clone()
    }

    /// Suppress further notification delivery; subsequent notifications are answered with
    /// Reset so the peer tears the relation down (RFC 7641 reactive cancellation).
    pub fn mark_observe_canceled(&self) {
        if let Some(observe) = &self.observe {
            observe.lock().unwrap().canceled = true;
        }
    }

    fn take_result_tx(&self) -> Option<oneshot::Sender<Result<Packet, ClientError>>> {
        self.result_tx.lock().unwrap().take()
    }

    fn finish(&self) {
        self.completed.store(true, Ordering::SeqCst);
        self.done.notify_waiters();
    }

    /// Transition to a terminal failure exactly once; later calls are no-ops so a timer
    /// firing against an already-resolved exchange cannot double-report.
    pub fn fail(&self, error: ClientError) {
        if self.completed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(observe) = &self.observe {
            let mut state = observe.lock().unwrap();
            state.canceled = true;
            let _ = state.notify_tx.try_send(Err(error.clone()));
        }
        if let Some(result_tx) = self.take_result_tx() {
            let _ = result_tx.send(Err(error));
        }
        self.done.notify_waiters();
    }

    /// Route a token-matched response into the exchange.
    pub fn deliver(&self, response: Packet) -> Delivery {
        self.touch();
        let Some(observe) = &self.observe else {
            if let Some(result_tx) = self.take_result_tx() {
                let _ = result_tx.send(Ok(response));
            }
            self.finish();
            return Delivery::Completed;
        };

        let mut state = observe.lock().unwrap();
        match response.get_observe_value() {
            Some(value) => {
                if state.canceled {
                    return Delivery::RejectCanceled;
                }
                // Values that fit 24 bits go through the reordering filter; anything else
                // is malformed and delivered as-is rather than guessed about.
                let sequence = value.ok().and_then(|v| u24::try_from(v).ok());
                if let Some(sequence) = sequence {
                    if !state.orderer.accept(sequence, Instant::now()) {
                        debug!(
                            "Dropping stale notification (seq {sequence}) for {:?}",
                            self.key_token
                        );
                        return Delivery::Notified;
                    }
                }
                if let Some(result_tx) = self.take_result_tx() {
                    // First notification doubles as the registration response.
                    let _ = result_tx.send(Ok(response));
                } else if state.notify_tx.try_send(Ok(response)).is_err() {
                    warn!(
                        "Notification backlog full or relation gone for {:?}, dropping",
                        self.key_token
                    );
                }
                Delivery::Notified
            }
            None => {
                // A response without Observe ends the relation: either the server refused
                // the registration or this is the deregistration confirmation.
                drop(state);
                if let Some(result_tx) = self.take_result_tx() {
                    let _ = result_tx.send(Ok(response));
                }
                self.finish();
                Delivery::Completed
            }
        }
    }
}

#[derive(Default)]
struct StoreInner {
    by_token: HashMap<TokenKey, Arc<Exchange>>,
    by_id: HashMap<KeyId, Arc<Exchange>>,
}

/// All live exchanges on one endpoint, indexed both ways the protocol matches them.
#[derive(Default)]
pub(crate) struct ExchangeStore {
    inner: Mutex<StoreInner>,
}

impl ExchangeStore {
    pub fn register(&self, exchange: Arc<Exchange>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(old) = inner
            .by_token
            .insert(exchange.key_token().clone(), exchange.clone())
        {
            warn!("Token {:?} re-used by another send!", exchange.key_token());
            old.fail(ClientError::Canceled);
        }
        inner.by_id.insert(exchange.key_id().clone(), exchange);
    }

    pub fn find(&self, key: &TokenKey) -> Option<Arc<Exchange>> {
        self.inner.lock().unwrap().by_token.get(key).cloned()
    }

    pub fn find_by_id(&self, key: &KeyId) -> Option<Arc<Exchange>> {
        self.inner.lock().unwrap().by_id.get(key).cloned()
    }

    pub fn remove(&self, exchange: &Exchange) {
        let mut inner = self.inner.lock().unwrap();
        inner.by_token.remove(exchange.key_token());
        inner.by_id.remove(exchange.key_id());
    }

    pub fn fail_remove(&self, key: &TokenKey, error: ClientError) {
        let found = self.inner.lock().unwrap().by_token.get(key).cloned();
        if let Some(exchange) = found {
            exchange.fail(error);
            self.remove(&exchange);
        }
    }

    /// Evict exchanges that fell off the activity horizon.  Live observations are exempt:
    /// a healthy but quiet relation must not be garbage collected underneath the caller.
    pub fn sweep(&self, lifetime: Duration) {
        let mut stale = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            inner.by_token.retain(|_, exchange| {
                let keep = exchange.age() <= lifetime
                    || (exchange.is_observe() && !exchange.is_completed());
                if !keep {
                    stale.push(exchange.clone());
                }
                keep
            });
            for exchange in &stale {
                inner.by_id.remove(exchange.key_id());
            }
        }
        for exchange in stale {
            trace!("Sweeping exchange {:?}", exchange.key_token());
            exchange.fail(ClientError::TimedOut);
        }
    }

    pub fn fail_all(&self, error: ClientError) {
        let drained: Vec<_> = {
            let mut inner = self.inner.lock().unwrap();
            inner.by_id.clear();
            inner.by_token.drain().map(|(_, exchange)| exchange).collect()
        };
        for exchange in drained {
            exchange.fail(error.clone());
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().by_token.len()
    }
}

/// Assign identifiers, register the exchange, and start the send task.  Returns the
/// receivers the request driver resolves against.
#[allow(clippy::type_complexity)]
pub(crate) fn submit(
    inner: &Arc<EndpointInner>,
    mut packet: Packet,
    peer: SocketAddr,
    options: SendOptions,
) -> (
    Arc<Exchange>,
    oneshot::Receiver<Result<Packet, ClientError>>,
    Option<mpsc::Receiver<Result<Packet, ClientError>>>,
) {
    packet.header.message_id = inner.message_ids.next();
    packet.header.set_type(if options.confirmable {
        MessageType::Confirmable
    } else {
        MessageType::NonConfirmable
    });
    if packet.get_token().is_empty() {
        packet.set_token(inner.tokens.next());
    }

    let key_token = TokenKey::new(packet.get_token().to_vec(), peer);
    let key_id = KeyId::new(&packet, peer);
    let (result_tx, result_rx) = oneshot::channel();
    let (notify_tx, notify_rx) = if options.observe {
        let (tx, rx) = mpsc::channel(NOTIFICATION_BACKLOG);
        (Some(tx), Some(rx))
    } else {
        (None, None)
    };

    let exchange = Arc::new(Exchange::new(
        key_token,
        key_id,
        packet.clone(),
        result_tx,
        notify_tx,
    ));
    inner.exchanges.register(exchange.clone());
    spawn_request_driver(inner.clone(), exchange.clone(), packet, peer, options);
    (exchange, result_rx, notify_rx)
}

fn spawn_request_driver(
    inner: Arc<EndpointInner>,
    exchange: Arc<Exchange>,
    packet: Packet,
    peer: SocketAddr,
    options: SendOptions,
) {
    tokio::spawn(async move {
        if options.confirmable {
            drive_confirmable(&inner, &exchange, packet, peer, options.max_retransmit).await;
        } else {
            drive_non_confirmable(&inner, &exchange, packet, peer).await;
        }
    });
}

async fn drive_confirmable(
    inner: &Arc<EndpointInner>,
    exchange: &Arc<Exchange>,
    packet: Packet,
    peer: SocketAddr,
    max_retransmit: Option<usize>,
) {
    let handle = {
        let mut retransmissions = inner.retransmissions.lock().await;
        retransmissions.send_reliably(
            packet,
            peer,
            inner.outgoing_tx.clone(),
            Some(exchange.key_token().clone()),
            max_retransmit,
        )
    };
    let key = handle.key();
    match handle.into_future().await {
        // Acked; a piggybacked or separate response resolves the exchange by token.
        Ok(()) => {}
        Err(SendFailed::Reset) => {
            debug!("Exchange {:?} rejected by peer", exchange.key_token());
            exchange.fail(ClientError::Rejected);
            inner.exchanges.remove(exchange);
        }
        // Whoever canceled already resolved the exchange.
        Err(SendFailed::Canceled) => {}
        Err(SendFailed::NoReply(attempts)) => {
            inner.retransmissions.lock().await.forget(&key);
            if !exchange.is_completed() {
                debug!(
                    "Giving up on {:?} after {attempts} attempts",
                    exchange.key_token()
                );
                exchange.fail(ClientError::TimedOut);
                inner.exchanges.remove(exchange);
            }
        }
        Err(e) => {
            exchange.fail(ClientError::Transport(e.to_string()));
            inner.exchanges.remove(exchange);
        }
    }
}

async fn drive_non_confirmable(
    inner: &Arc<EndpointInner>,
    exchange: &Arc<Exchange>,
    packet: Packet,
    peer: SocketAddr,
) {
    let submitted = inner
        .outgoing_tx
        .send(Outgoing {
            packet,
            peer,
            origin: Some(exchange.key_token().clone()),
        })
        .is_ok();
    if !submitted {
        exchange.fail(ClientError::Canceled);
        inner.exchanges.remove(exchange);
        return;
    }

    // Non-confirmable sends never retransmit; they just wait out NON_LIFETIME.
    let done = exchange.done_signal();
    if exchange.is_completed() {
        return;
    }
    tokio::select! {
        _ = done => {}
        _ = tokio::time::sleep(inner.config.non_lifetime) => {
            if !exchange.is_completed() {
                exchange.fail(ClientError::TimedOut);
                inner.exchanges.remove(exchange);
            }
        }
    }
}

/// Entry point for every datagram the endpoint receives.  Errors never propagate back to
/// the receive loop; anything that goes wrong is routed to the affected exchange or logged.
pub(crate) async fn handle_datagram(inner: &Arc<EndpointInner>, packet: Packet, peer: SocketAddr) {
    trace!("Incoming packet from {peer:?}: {packet:?}");
    if packet.header.get_type() == MessageType::Reset {
        handle_reset(inner, packet, peer).await;
        return;
    }
    match packet.header.code {
        MessageClass::Empty => handle_empty(inner, packet, peer).await,
        MessageClass::Response(_) => handle_response(inner, packet, peer).await,
        MessageClass::Request(_) => {
            warn!("Unexpected request from {peer:?}, rejecting...");
            if packet.header.get_type() == MessageType::Confirmable {
                send(inner, new_reset_message(&packet), peer);
            }
        }
        code => warn!("Unhandled message code {code} from {peer:?}, ignoring..."),
    }
}

async fn handle_reset(inner: &Arc<EndpointInner>, packet: Packet, peer: SocketAddr) {
    let matched_send = inner
        .retransmissions
        .lock()
        .await
        .handle_reply(&packet, &peer);
    let key = KeyId::new(&packet, peer);
    if let Some(exchange) = inner.exchanges.find_by_id(&key) {
        debug!("Peer {peer:?} reset exchange {:?}", exchange.key_token());
        exchange.fail(ClientError::Rejected);
        inner.exchanges.remove(&exchange);
    } else if !matched_send {
        debug!(
            "Got Reset from {peer:?} for unrecognized message ID {}",
            key.message_id
        );
    }
}

async fn handle_empty(inner: &Arc<EndpointInner>, packet: Packet, peer: SocketAddr) {
    match packet.header.get_type() {
        MessageType::Acknowledgement => {
            if !inner
                .retransmissions
                .lock()
                .await
                .handle_reply(&packet, &peer)
            {
                debug!(
                    "Got Ack from {peer:?} for unrecognized message ID {}",
                    packet.header.message_id
                );
            }
            // Empty ack promises a separate response later; keep the exchange warm.
            if let Some(exchange) = inner.exchanges.find_by_id(&KeyId::new(&packet, peer)) {
                exchange.touch();
            }
        }
        MessageType::Confirmable => {
            // A common way in CoAP to trigger a cheap "ping" to make sure the peer is
            // alive; answer with the Reset "pong".
            send(inner, new_reset_message(&packet), peer);
        }
        _ => {
            debug!("Ignoring Non-confirmable Empty message from {peer:?}");
        }
    }
}

async fn handle_response(inner: &Arc<EndpointInner>, packet: Packet, peer: SocketAddr) {
    let message_type = packet.header.get_type();
    if message_type == MessageType::Acknowledgement {
        // Piggybacked response: the message layer ack stops the retransmission timer and
        // the token match below delivers the payload.
        inner
            .retransmissions
            .lock()
            .await
            .handle_reply(&packet, &peer);
    }

    let carries_own_id = matches!(
        message_type,
        MessageType::Confirmable | MessageType::NonConfirmable
    );
    let key_id = KeyId::new(&packet, peer);
    if carries_own_id {
        if let Some(previous) = inner.dedup.find(&key_id) {
            debug!("Duplicate message {key_id:?}; re-emitting prior reply");
            if let Some(ack) = previous.last_ack() {
                send(inner, ack, peer);
            }
            return;
        }
    }

    let token_key = TokenKey::new(packet.get_token().to_vec(), peer);
    let Some(exchange) = inner.exchanges.find(&token_key) else {
        if message_type == MessageType::Confirmable {
            debug!("Rejecting response with unclaimed token from {peer:?}");
            send(inner, new_reset_message(&packet), peer);
        } else {
            debug!("Ignoring response with unclaimed token from {peer:?}");
        }
        return;
    };

    if carries_own_id {
        // Insert-or-replace is atomic, so two racing copies of the same datagram agree on
        // which one was first.
        if let Some(previous) = inner.dedup.find_previous(key_id, &exchange) {
            debug!("Duplicate message for {token_key:?}; re-emitting prior reply");
            if let Some(ack) = previous.last_ack() {
                send(inner, ack, peer);
            }
            return;
        }
    }

    let ack_candidate =
        (message_type == MessageType::Confirmable).then(|| new_empty_ack(&packet));
    let reset_candidate = new_reset_message(&packet);
    match exchange.deliver(packet) {
        Delivery::Completed => {
            inner.exchanges.remove(&exchange);
            if let Some(ack) = ack_candidate {
                exchange.record_ack(ack.clone());
                send(inner, ack, peer);
            }
        }
        Delivery::Notified => {
            if let Some(ack) = ack_candidate {
                exchange.record_ack(ack.clone());
                send(inner, ack, peer);
            }
        }
        Delivery::RejectCanceled => {
            debug!("Rejecting notification for canceled observation {token_key:?}");
            exchange.record_ack(reset_candidate.clone());
            send(inner, reset_candidate, peer);
        }
    }
}

fn send(inner: &EndpointInner, packet: Packet, peer: SocketAddr) {
    let outgoing = Outgoing {
        packet,
        peer,
        origin: None,
    };
    if inner.outgoing_tx.send(outgoing).is_err() {
        debug!("Endpoint driver gone; dropping outgoing packet to {peer:?}");
    }
}
