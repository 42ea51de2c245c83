//! The request driver: builds requests, hands them to the exchange engine, and resolves
//! results back to the caller.

use std::sync::Arc;
use std::time::Duration;

use coap_lite::{ContentFormat, MessageClass, MessageType, Packet, RequestType, ResponseType};
use log::debug;
use tokio::sync::{mpsc, oneshot};

pub use config::{ClientConfig, TransmissionParameters};
pub use error::ClientError;
pub use observe::ObserveRelation;
pub use request::RequestBuilder;
pub use uri::CoapUri;
pub use web_link::{parse_link_format, WebLink};

use crate::client::exchange::Exchange;
use crate::client::retransmission::SendFailed;
use crate::endpoint::{CoapEndpoint, EndpointInner, EndpointManager};

pub mod config;
pub(crate) mod dedup;
pub mod error;
pub(crate) mod exchange;
pub mod observe;
mod orderer;
pub mod request;
pub(crate) mod retransmission;
mod u24;
pub mod uri;
mod util;
pub mod web_link;

/// CoAP client bound to one endpoint.  Cheap to clone; all clones multiplex over the same
/// socket pair and exchange engine.
#[derive(Clone)]
pub struct CoapClient {
    inner: Arc<EndpointInner>,
}

impl CoapClient {
    pub fn new(endpoint: &CoapEndpoint) -> Self {
        Self {
            inner: endpoint.inner().clone(),
        }
    }

    /// Use the process-wide default endpoint; requires a prior
    /// [`EndpointManager::init`](crate::endpoint::EndpointManager::init).
    pub fn from_default_endpoint() -> Result<Self, ClientError> {
        EndpointManager::default_endpoint()
            .map(|endpoint| Self::new(&endpoint))
            .ok_or_else(|| {
                ClientError::InvalidRequest(
                    "no default endpoint; call EndpointManager::init first".to_string(),
                )
            })
    }

    /// Submit a request and return the awaitable handle.  This is the primitive all the
    /// convenience methods resolve through.
    pub async fn send(&self, request: RequestBuilder) -> Result<PendingRequest, ClientError> {
        let (pending, _) = self.send_with_notifications(request).await?;
        Ok(pending)
    }

    /// Build, resolve and send, then wait for the response under the builder's timeout.
    pub async fn execute(&self, request: RequestBuilder) -> Result<Packet, ClientError> {
        let timeout = request.timeout_value();
        let pending = self.send(request).await?;
        await_response(pending, timeout).await
    }

    pub async fn get(&self, uri: &str) -> Result<Packet, ClientError> {
        self.execute(RequestBuilder::get(uri)?).await
    }

    pub async fn post(
        &self,
        uri: &str,
        payload: Vec<u8>,
        content_format: Option<ContentFormat>,
    ) -> Result<Packet, ClientError> {
        let mut request = RequestBuilder::post(uri)?.payload(payload);
        if let Some(content_format) = content_format {
            request = request.content_format(content_format);
        }
        self.execute(request).await
    }

    pub async fn put(
        &self,
        uri: &str,
        payload: Vec<u8>,
        content_format: Option<ContentFormat>,
    ) -> Result<Packet, ClientError> {
        let mut request = RequestBuilder::put(uri)?.payload(payload);
        if let Some(content_format) = content_format {
            request = request.content_format(content_format);
        }
        self.execute(request).await
    }

    pub async fn delete(&self, uri: &str) -> Result<Packet, ClientError> {
        self.execute(RequestBuilder::delete(uri)?).await
    }

    /// CoAP ping (RFC 7252 §4.3): an Empty Confirmable message the peer must Reset.  True
    /// iff the "pong" Reset arrives; timeouts and transport problems simply fail the ping.
    pub async fn ping(&self, uri: &str) -> bool {
        match self.try_ping(uri).await {
            Ok(alive) => alive,
            Err(e) => {
                debug!("Ping failed: {e}");
                false
            }
        }
    }

    async fn try_ping(&self, uri: &str) -> Result<bool, ClientError> {
        let uri = CoapUri::parse(uri)?;
        let peer = uri.resolve().await?;

        let mut packet = Packet::new();
        packet.header.set_type(MessageType::Confirmable);
        packet.header.code = MessageClass::Empty;
        packet.header.message_id = self.inner.message_ids.next();

        let handle = {
            let mut retransmissions = self.inner.retransmissions.lock().await;
            retransmissions.send_reliably(
                packet,
                peer,
                self.inner.outgoing_tx.clone(),
                None,
                None,
            )
        };
        let key = handle.key();
        match handle.into_future().await {
            Err(SendFailed::Reset) => Ok(true),
            // An ack to an Empty Confirmable is nonsense, but it isn't a pong.
            Ok(()) => Ok(false),
            Err(SendFailed::NoReply(_)) => {
                self.inner.retransmissions.lock().await.forget(&key);
                Ok(false)
            }
            Err(e) => Err(ClientError::Transport(e.to_string())),
        }
    }

    /// Resource discovery: GET `/.well-known/core` on the authority of `base_uri` and parse
    /// the link-format payload.  `None` means the peer never answered; a response of the
    /// wrong content format yields an empty list.
    pub async fn discover(
        &self,
        base_uri: &str,
        query: Option<&str>,
    ) -> Result<Option<Vec<WebLink>>, ClientError> {
        let base = CoapUri::parse(base_uri)?;
        let request = RequestBuilder::from_uri(RequestType::Get, base.discovery(query));
        let timeout = request.timeout_value();
        let pending = self.send(request).await?;
        let response = match await_response(pending, timeout).await {
            Ok(response) => response,
            Err(ClientError::TimedOut) => return Ok(None),
            Err(e) => return Err(e),
        };

        if !matches!(
            response.header.code,
            MessageClass::Response(ResponseType::Content)
        ) {
            return Ok(Some(Vec::new()));
        }
        match response.get_content_format() {
            Some(ContentFormat::ApplicationLinkFormat) | None => {}
            Some(_) => return Ok(Some(Vec::new())),
        }
        let payload = match std::str::from_utf8(&response.payload) {
            Ok(payload) => payload,
            Err(_) => return Ok(Some(Vec::new())),
        };
        Ok(Some(parse_link_format(payload)))
    }

    /// Register an observation: GET with Observe=0.  The returned relation starts with the
    /// registration response and then yields notifications in strictly fresher order.
    pub async fn observe(
        &self,
        uri: &str,
        accept: Option<ContentFormat>,
    ) -> Result<ObserveRelation, ClientError> {
        let mut request = RequestBuilder::get(uri)?.observe_register();
        if let Some(accept) = accept {
            request = request.accept(accept);
        }
        let timeout = request.timeout_value();
        let (pending, notifications) = self.send_with_notifications(request).await?;
        let notifications = notifications.expect("observe send always carries a stream");

        let exchange = pending.exchange.clone();
        let peer = exchange.key_token().peer;
        let first_response = await_response(pending, timeout).await?;
        Ok(ObserveRelation::new(
            self.inner.clone(),
            exchange,
            peer,
            first_response,
            notifications,
        ))
    }

    async fn send_with_notifications(
        &self,
        request: RequestBuilder,
    ) -> Result<
        (
            PendingRequest,
            Option<mpsc::Receiver<Result<Packet, ClientError>>>,
        ),
        ClientError,
    > {
        let (packet, uri, options) = request.into_parts(&self.inner.config);
        let peer = uri.resolve().await?;
        let (exchange, result_rx, notify_rx) =
            exchange::submit(&self.inner, packet, peer, options);
        let pending = PendingRequest {
            inner: self.inner.clone(),
            exchange,
            result_rx,
        };
        Ok((pending, notify_rx))
    }
}

/// Awaitable handle on one in-flight request.  Resolves exactly once with the response or a
/// [`ClientError`]; cancellation tears the exchange down and releases its identifiers.
pub struct PendingRequest {
    inner: Arc<EndpointInner>,
    exchange: Arc<Exchange>,
    result_rx: oneshot::Receiver<Result<Packet, ClientError>>,
}

impl PendingRequest {
    pub fn message_id(&self) -> u16 {
        self.exchange.key_id().message_id
    }

    pub fn token(&self) -> &[u8] {
        &self.exchange.key_token().token
    }

    /// Wait for the response as long as the engine keeps the exchange alive.
    pub async fn response(self) -> Result<Packet, ClientError> {
        match self.result_rx.await {
            Ok(result) => result,
            // The endpoint shut down underneath us.
            Err(_) => Err(ClientError::Canceled),
        }
    }

    /// Wait at most `limit`; expiry returns `None` and withdraws the request so the engine
    /// stops retransmitting and garbage-collects the exchange.
    pub async fn response_within(mut self, limit: Duration) -> Result<Option<Packet>, ClientError> {
        match tokio::time::timeout(limit, &mut self.result_rx).await {
            Ok(Ok(result)) => result.map(Some),
            Ok(Err(_)) => Err(ClientError::Canceled),
            Err(_elapsed) => {
                self.inner
                    .cancel_exchange(&self.exchange, ClientError::Canceled)
                    .await;
                Ok(None)
            }
        }
    }

    /// Withdraw the request: stops retransmission, releases the exchange, and resolves any
    /// concurrent waiter with [`ClientError::Canceled`].
    pub async fn cancel(self) {
        self.inner
            .cancel_exchange(&self.exchange, ClientError::Canceled)
            .await;
    }
}

async fn await_response(
    pending: PendingRequest,
    timeout: Option<Duration>,
) -> Result<Packet, ClientError> {
    match timeout {
        None => pending.response().await,
        Some(limit) => match pending.response_within(limit).await? {
            Some(response) => Ok(response),
            None => Err(ClientError::TimedOut),
        },
    }
}
