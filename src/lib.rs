//! Robust, ergonomic CoAP client runtime in Rust.
//!
//! Drives requests through the RFC 7252 reliability machinery over UDP: confirmable
//! retransmission, ack/reset correlation, token matching, duplicate suppression, and
//! RFC 7641 observation with strict notification ordering.
//!
//! # Examples
//! ```no_run
//! use coap_client::{ClientConfig, CoapClient, CoapEndpoint, UdpTransport};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let endpoint =
//!         CoapEndpoint::bind(UdpTransport::new("0.0.0.0:0"), ClientConfig::default()).await?;
//!     let client = CoapClient::new(&endpoint);
//!
//!     let response = client.get("coap://coap.me/hello").await?;
//!     println!("{}", String::from_utf8_lossy(&response.payload));
//!
//!     endpoint.shutdown();
//!     Ok(())
//! }
//! ```

pub use client::{
    ClientConfig, ClientError, CoapClient, CoapUri, ObserveRelation, PendingRequest,
    RequestBuilder, TransmissionParameters, WebLink,
};
pub use endpoint::{CoapEndpoint, EndpointManager};
pub use transport::TransportError;
pub use udp::UdpTransport;

pub mod client;
pub mod endpoint;
pub mod transport;
pub mod udp;
