use std::time::Duration;

use coap_lite::{CoapOption, ContentFormat, MessageClass, Packet, RequestType};

use crate::client::config::{block_size_exponent, round_block_size, ClientConfig};
use crate::client::error::ClientError;
use crate::client::exchange::SendOptions;
use crate::client::uri::CoapUri;

/// Builder assembling one outgoing request: method, destination, options and payload, plus
/// the per-request knobs the exchange engine honors (message type, retransmission budget,
/// response deadline).
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    uri: CoapUri,
    method: RequestType,
    confirmable: bool,
    payload: Vec<u8>,
    content_format: Option<ContentFormat>,
    accept: Option<ContentFormat>,
    if_match: Vec<Vec<u8>>,
    if_none_match: bool,
    observe_register: bool,
    early_block2: bool,
    block2_size: Option<usize>,
    max_retransmit: Option<usize>,
    timeout: Option<Duration>,
}

impl RequestBuilder {
    pub fn new(method: RequestType, uri: &str) -> Result<Self, ClientError> {
        Ok(Self::from_uri(method, CoapUri::parse(uri)?))
    }

    pub(crate) fn from_uri(method: RequestType, uri: CoapUri) -> Self {
        Self {
            uri,
            method,
            confirmable: true,
            payload: Vec::new(),
            content_format: None,
            accept: None,
            if_match: Vec::new(),
            if_none_match: false,
            observe_register: false,
            early_block2: false,
            block2_size: None,
            max_retransmit: None,
            timeout: None,
        }
    }

    pub fn get(uri: &str) -> Result<Self, ClientError> {
        Self::new(RequestType::Get, uri)
    }

    pub fn post(uri: &str) -> Result<Self, ClientError> {
        Self::new(RequestType::Post, uri)
    }

    pub fn put(uri: &str) -> Result<Self, ClientError> {
        Self::new(RequestType::Put, uri)
    }

    pub fn delete(uri: &str) -> Result<Self, ClientError> {
        Self::new(RequestType::Delete, uri)
    }

    /// Send as Non-confirmable; the engine then applies the NON lifetime instead of the
    /// retransmission schedule.
    pub fn non_confirmable(mut self) -> Self {
        self.confirmable = false;
        self
    }

    pub fn payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn content_format(mut self, content_format: ContentFormat) -> Self {
        self.content_format = Some(content_format);
        self
    }

    pub fn accept(mut self, accept: ContentFormat) -> Self {
        self.accept = Some(accept);
        self
    }

    /// Conditional request: at least one stored ETag must match (may be repeated).
    pub fn if_match(mut self, etag: Vec<u8>) -> Self {
        self.if_match.push(etag);
        self
    }

    /// Conditional request: only succeed if the resource does not exist yet.
    pub fn if_none_match(mut self) -> Self {
        self.if_none_match = true;
        self
    }

    pub(crate) fn observe_register(mut self) -> Self {
        self.observe_register = true;
        self
    }

    /// Offer the peer a Block2 size up front instead of waiting for it to choose one.
    /// `None` uses the endpoint's configured default; explicit sizes are rounded down to
    /// the nearest supported power of two.
    pub fn early_block2(mut self, size: Option<usize>) -> Self {
        self.early_block2 = true;
        self.block2_size = size;
        self
    }

    /// Override the endpoint's retransmission budget for this request only.
    pub fn max_retransmit(mut self, max_retransmit: usize) -> Self {
        self.max_retransmit = Some(max_retransmit);
        self
    }

    /// Cap how long the convenience callers wait for the response.  Without it they wait
    /// until the engine itself gives up.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub(crate) fn timeout_value(&self) -> Option<Duration> {
        self.timeout
    }

    /// Materialize the request packet and the engine-facing send options.  Identifiers
    /// (message ID, token) are assigned later by the engine.
    pub(crate) fn into_parts(self, config: &ClientConfig) -> (Packet, CoapUri, SendOptions) {
        let mut packet = Packet::new();
        packet.header.code = MessageClass::Request(self.method);
        if self.observe_register {
            packet.set_observe_value(0);
        }
        self.uri.apply_to(&mut packet);
        if let Some(content_format) = self.content_format {
            packet.set_content_format(content_format);
        }
        if let Some(accept) = self.accept {
            packet.add_option(CoapOption::Accept, encode_uint(usize::from(accept) as u32));
        }
        for etag in self.if_match {
            packet.add_option(CoapOption::IfMatch, etag);
        }
        if self.if_none_match {
            packet.add_option(CoapOption::IfNoneMatch, Vec::new());
        }
        if self.early_block2 {
            let size = round_block_size(self.block2_size.unwrap_or(config.default_block_size));
            if let Some(size) = size {
                // Seed value num=0, M=0: only the SZX bits survive minimal encoding.
                let szx = block_size_exponent(size);
                let value = if szx == 0 { Vec::new() } else { vec![szx] };
                packet.add_option(CoapOption::Block2, value);
            }
        }
        packet.payload = self.payload;

        let options = SendOptions {
            confirmable: self.confirmable,
            max_retransmit: self.max_retransmit,
            observe: self.observe_register,
        };
        (packet, self.uri, options)
    }
}

/// Minimal-length big-endian encoding for CoAP uint option values.
fn encode_uint(value: u32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    bytes[skip..].to_vec()
}
