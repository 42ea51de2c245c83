use std::net::SocketAddr;
use std::pin::Pin;

use async_trait::async_trait;
use coap_lite::error::MessageError;
use coap_lite::Packet;
use futures::{Sink, Stream};
use thiserror::Error;

/// Generalization of the underlying CoAP transport, intended primarily to keep the exchange
/// engine independent of socket specifics and to let tests substitute scripted transports
/// for the real UDP sockets.
#[async_trait]
pub trait Transport {
    /// Perform the binding, that is, begin accepting new data from this transport even if
    /// there isn't yet an endpoint consuming it.  The result is a continuous async stream of
    /// `(Packet, SocketAddr)` pairs combined with a sink accepting outgoing packets addressed
    /// the same way.
    async fn bind(self) -> Result<BoxedFramedBinding, TransportError>;
}

pub type BoxedFramedBinding = Pin<Box<dyn FramedBinding>>;

/// Trait generalizing a common feature of async libraries like tokio where a socket is exposed
/// as both a stream and a sink.  Datagrams can arrive at any time from any source, so each
/// framed item carries the peer it came from or is destined to.
pub trait FramedBinding:
    Send
    + Stream<Item = Result<FramedItem, FramedReadError>>
    + Sink<FramedItem, Error = FramedWriteError>
{
    /// Access the link's MTU which can be used to determine things like the ideal block
    /// transfer size to recommend.  If it cannot be determined by the link, a suitable
    /// default one will be selected based on the CoAP specification.
    fn mtu(&self) -> Option<u32>;

    /// Local addresses this binding listens on, one per bound socket.
    fn local_addrs(&self) -> &[SocketAddr];
}

/// Parsed CoAP packet coming from (or going to) a remote peer.
pub type FramedItem = (Packet, SocketAddr);

/// Error when receiving from a remote peer.  The peer is optional as there may be a generic
/// read error unrelated to any remote peer, for example if the underlying bound socket is
/// closed.
pub type FramedReadError = (TransportError, Option<SocketAddr>);

/// Error when sending to a remote peer.  The peer is omitted in this case as the endpoint is
/// provided to the send APIs themselves so we can easily tell which peer generated the error.
pub type FramedWriteError = TransportError;

/// Generalized errors indicating a range of transport-related issues such as being unable to
/// bind, ICMP-driven send failures, malformed input, etc.  Most of these errors are non-fatal
/// and the endpoint can happily continue serving other exchanges.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("generic I/O error")]
    IoError(#[from] std::io::Error),

    #[error("packet was malformed")]
    MalformedPacket(#[from] MessageError),

    #[error("unspecified: {0}")]
    Unspecified(String),
}
