//! The shared endpoint: one driver task multiplexing all exchanges over the bound sockets.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use coap_lite::Packet;
use futures::{SinkExt, StreamExt};
use log::{error, trace, warn};
use rand::Rng;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::client::config::ClientConfig;
use crate::client::dedup::Deduplicator;
use crate::client::error::ClientError;
use crate::client::exchange::{self, Exchange, ExchangeStore, TokenKey};
use crate::client::retransmission::RetransmissionManager;
use crate::transport::{BoxedFramedBinding, Transport, TransportError};
use crate::udp::UdpTransport;

/// Outbound datagram handed from the engine to the driver task.  `origin` names the
/// exchange to fail if the transport rejects the send.
pub(crate) struct Outgoing {
    pub packet: Packet,
    pub peer: SocketAddr,
    pub origin: Option<TokenKey>,
}

/// Engine state shared between the driver task, the request driver, and caller handles.
pub(crate) struct EndpointInner {
    pub(crate) config: ClientConfig,
    pub(crate) outgoing_tx: UnboundedSender<Outgoing>,
    pub(crate) exchanges: ExchangeStore,
    pub(crate) dedup: Deduplicator,
    pub(crate) retransmissions: Mutex<RetransmissionManager>,
    pub(crate) message_ids: MessageIdSource,
    pub(crate) tokens: TokenSource,
    local_addrs: Vec<SocketAddr>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl EndpointInner {
    /// Withdraw an exchange: stop its retransmission timer, resolve it with `error`, and
    /// unregister it so the identifiers become reusable.
    pub(crate) async fn cancel_exchange(&self, exchange: &Arc<Exchange>, error: ClientError) {
        self.retransmissions.lock().await.cancel(exchange.key_id());
        exchange.fail(error);
        self.exchanges.remove(exchange);
    }
}

/// A bound CoAP endpoint.  Cheap to clone; dropping clones does not stop the driver, use
/// [`shutdown`](Self::shutdown) for an orderly teardown.
#[derive(Clone)]
pub struct CoapEndpoint {
    inner: Arc<EndpointInner>,
}

impl CoapEndpoint {
    /// Bind the endpoint to a source of datagrams in a transport-agnostic way.  Most
    /// callers will wish to use [`crate::udp::UdpTransport`].
    pub async fn bind<T: Transport>(
        transport: T,
        config: ClientConfig,
    ) -> Result<Self, TransportError> {
        let binding = transport.bind().await?;
        let local_addrs = binding.local_addrs().to_vec();
        let (outgoing_tx, outgoing_rx) = tokio::sync::mpsc::unbounded_channel();

        let inner = Arc::new(EndpointInner {
            outgoing_tx,
            exchanges: ExchangeStore::default(),
            dedup: Deduplicator::new(),
            retransmissions: Mutex::new(RetransmissionManager::new(config.transmission)),
            message_ids: MessageIdSource::new(),
            tokens: TokenSource::new(),
            local_addrs,
            tasks: StdMutex::new(Vec::new()),
            config,
        });

        inner.dedup.start(
            inner.config.mark_and_sweep_interval,
            inner.config.exchange_lifetime,
        );
        let driver = tokio::spawn(drive(inner.clone(), binding, outgoing_rx));
        let sweeper = tokio::spawn(sweep_exchanges(inner.clone()));
        inner.tasks.lock().unwrap().extend([driver, sweeper]);

        Ok(Self { inner })
    }

    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.inner.local_addrs
    }

    /// Stop the driver and sweep tasks and fail every outstanding exchange with
    /// [`ClientError::Canceled`].  Safe to call more than once.
    pub fn shutdown(&self) {
        for task in self.inner.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        self.inner.dedup.stop();
        self.inner.dedup.clear();
        self.inner.exchanges.fail_all(ClientError::Canceled);
    }

    pub(crate) fn inner(&self) -> &Arc<EndpointInner> {
        &self.inner
    }
}

/// The endpoint's event loop: receive from the binding, relay outgoing packets into it.
/// Mirrors the suspension points the protocol allows: socket receive and send readiness.
async fn drive(
    inner: Arc<EndpointInner>,
    binding: BoxedFramedBinding,
    mut outgoing_rx: UnboundedReceiver<Outgoing>,
) {
    let mut binding = binding.fuse();
    loop {
        tokio::select! {
            event = binding.next() => match event {
                Some(Ok((packet, peer))) => {
                    exchange::handle_datagram(&inner, packet, peer).await;
                }
                Some(Err((e, peer))) => {
                    // Decode failures and per-socket teardowns are logged and dropped; no
                    // exchange can be identified from an undecodable datagram.
                    warn!("Error from {peer:?}: {e}");
                }
                None => {
                    error!("All sockets torn down; endpoint driver exiting");
                    inner
                        .exchanges
                        .fail_all(ClientError::Transport("endpoint closed".to_string()));
                    break;
                }
            },
            item = outgoing_rx.recv() => match item {
                Some(out) => {
                    trace!("Outgoing packet to {:?}: {:?}", out.peer, out.packet);
                    if let Err(e) = binding.send((out.packet, out.peer)).await {
                        error!("Error sending to {:?}: {e:?}", out.peer);
                        if let Some(origin) = out.origin {
                            inner
                                .exchanges
                                .fail_remove(&origin, ClientError::Transport(e.to_string()));
                        }
                    }
                }
                None => break,
            }
        }
    }
}

async fn sweep_exchanges(inner: Arc<EndpointInner>) {
    let mut ticker = tokio::time::interval(inner.config.mark_and_sweep_interval);
    loop {
        ticker.tick().await;
        inner.exchanges.sweep(inner.config.exchange_lifetime);
    }
}

/// Message-ID counter: monotonic with wraparound, randomly seeded, scoped to the endpoint.
pub(crate) struct MessageIdSource(AtomicU16);

impl MessageIdSource {
    pub fn new() -> Self {
        Self(AtomicU16::new(rand::thread_rng().gen()))
    }

    pub fn next(&self) -> u16 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// Token counter.  Eight bytes of a wrapping counter keeps tokens unique across all
/// outstanding exchanges without any coordination beyond the atomic increment.
pub(crate) struct TokenSource(AtomicU64);

impl TokenSource {
    pub fn new() -> Self {
        Self(AtomicU64::new(rand::thread_rng().gen()))
    }

    pub fn next(&self) -> Vec<u8> {
        self.0.fetch_add(1, Ordering::Relaxed).to_be_bytes().to_vec()
    }
}

/// Engine state without any bound sockets; lets the exchange machinery be driven with
/// hand-crafted packets.  Returns the receiving half of the outgoing relay so tests can
/// assert on everything the engine tries to put on the wire.
#[cfg(test)]
pub(crate) fn test_inner(
    config: ClientConfig,
) -> (Arc<EndpointInner>, UnboundedReceiver<Outgoing>) {
    let (outgoing_tx, outgoing_rx) = tokio::sync::mpsc::unbounded_channel();
    let inner = Arc::new(EndpointInner {
        retransmissions: Mutex::new(RetransmissionManager::new(config.transmission)),
        outgoing_tx,
        exchanges: ExchangeStore::default(),
        dedup: Deduplicator::new(),
        message_ids: MessageIdSource::new(),
        tokens: TokenSource::new(),
        local_addrs: Vec::new(),
        tasks: StdMutex::new(Vec::new()),
        config,
    });
    (inner, outgoing_rx)
}

static DEFAULT_ENDPOINT: StdMutex<Option<CoapEndpoint>> = StdMutex::new(None);

/// Lifecycle management for the process-wide default endpoint.  Nothing creates the default
/// implicitly: callers either inject their own [`CoapEndpoint`] or initialize this one and
/// own its teardown.
pub struct EndpointManager;

impl EndpointManager {
    /// Bind the default endpoint on ephemeral ports, dual-stack where the host allows it.
    pub async fn init(config: ClientConfig) -> Result<CoapEndpoint, TransportError> {
        let endpoint = match CoapEndpoint::bind(
            UdpTransport::dual_stack("0.0.0.0:0", "[::]:0"),
            config.clone(),
        )
        .await
        {
            Ok(endpoint) => endpoint,
            Err(_) => CoapEndpoint::bind(UdpTransport::new("0.0.0.0:0"), config).await?,
        };

        let mut slot = DEFAULT_ENDPOINT.lock().unwrap();
        if slot.is_some() {
            endpoint.shutdown();
            return Err(TransportError::Unspecified(
                "default endpoint already initialized".to_string(),
            ));
        }
        *slot = Some(endpoint.clone());
        Ok(endpoint)
    }

    pub fn default_endpoint() -> Option<CoapEndpoint> {
        DEFAULT_ENDPOINT.lock().unwrap().clone()
    }

    /// Tear the default endpoint down; a later [`init`](Self::init) may replace it.
    pub fn shutdown() {
        if let Some(endpoint) = DEFAULT_ENDPOINT.lock().unwrap().take() {
            endpoint.shutdown();
        }
    }
}
