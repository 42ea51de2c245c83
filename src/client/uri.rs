use std::net::SocketAddr;

use coap_lite::{CoapOption, Packet};
use tokio::net::lookup_host;

use crate::client::error::ClientError;

/// Default port from RFC 7252 when the URI authority does not name one.
pub const DEFAULT_PORT: u16 = 5683;

/// Parsed `coap://host[:port]/path[?query]` destination.  Path segments and query tokens map
/// 1:1 onto Uri-Path and Uri-Query options, one option instance per segment/token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapUri {
    host: String,
    port: u16,
    path_segments: Vec<String>,
    query_tokens: Vec<String>,
}

impl CoapUri {
    pub fn parse(uri: &str) -> Result<Self, ClientError> {
        let rest = uri
            .strip_prefix("coap://")
            .ok_or_else(|| ClientError::InvalidRequest(format!("not a coap:// URI: {uri}")))?;

        let (authority, path_and_query) = match rest.find('/') {
            Some(slash) => (&rest[..slash], &rest[slash..]),
            None => (rest, ""),
        };
        if authority.is_empty() {
            return Err(ClientError::InvalidRequest(format!("missing host: {uri}")));
        }

        let (host, port) = Self::split_authority(authority)?;

        let (path, query) = match path_and_query.find('?') {
            Some(q) => (&path_and_query[..q], Some(&path_and_query[q + 1..])),
            None => (path_and_query, None),
        };

        let path_segments = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        let query_tokens = query
            .map(|q| {
                q.split('&')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            host: host.to_string(),
            port,
            path_segments,
            query_tokens,
        })
    }

    fn split_authority(authority: &str) -> Result<(&str, u16), ClientError> {
        // IPv6 literals arrive bracketed, e.g. [::1]:5683.
        if let Some(rest) = authority.strip_prefix('[') {
            let close = rest.find(']').ok_or_else(|| {
                ClientError::InvalidRequest(format!("unterminated IPv6 literal: {authority}"))
            })?;
            let host = &rest[..close];
            let port = match rest[close + 1..].strip_prefix(':') {
                Some(p) => Self::parse_port(p)?,
                None => DEFAULT_PORT,
            };
            return Ok((host, port));
        }
        match authority.rsplit_once(':') {
            Some((host, port)) => Ok((host, Self::parse_port(port)?)),
            None => Ok((authority, DEFAULT_PORT)),
        }
    }

    fn parse_port(port: &str) -> Result<u16, ClientError> {
        port.parse()
            .map_err(|_| ClientError::InvalidRequest(format!("bad port: {port}")))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn path_segments(&self) -> &[String] {
        &self.path_segments
    }

    pub fn query_tokens(&self) -> &[String] {
        &self.query_tokens
    }

    /// Same authority, but pointed at `/.well-known/core` with an optional filter query.
    pub(crate) fn discovery(&self, query: Option<&str>) -> CoapUri {
        CoapUri {
            host: self.host.clone(),
            port: self.port,
            path_segments: vec![".well-known".to_string(), "core".to_string()],
            query_tokens: query
                .map(|q| {
                    q.split('&')
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    /// Resolve the authority to a single socket address, preferring the first result the
    /// resolver yields.  IP literals resolve without touching DNS.
    pub async fn resolve(&self) -> Result<SocketAddr, ClientError> {
        let host = if self.host.contains(':') {
            // Re-bracket the IPv6 literal for the resolver.
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        };
        let result = lookup_host(host.as_str())
            .await
            .map_err(|e| ClientError::InvalidRequest(format!("cannot resolve {host}: {e}")))?
            .next()
            .ok_or_else(|| ClientError::InvalidRequest(format!("no addresses for {host}")));
        result
    }

    /// Write the destination options into an outgoing request.
    pub(crate) fn apply_to(&self, packet: &mut Packet) {
        for segment in &self.path_segments {
            packet.add_option(CoapOption::UriPath, segment.clone().into_bytes());
        }
        for token in &self.query_tokens {
            packet.add_option(CoapOption::UriQuery, token.clone().into_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full() {
        let uri = CoapUri::parse("coap://example.com:5684/a/b/c?x=1&y=2").unwrap();
        assert_eq!(uri.host(), "example.com");
        assert_eq!(uri.port(), 5684);
        assert_eq!(uri.path_segments(), ["a", "b", "c"]);
        assert_eq!(uri.query_tokens(), ["x=1", "y=2"]);
    }

    #[test]
    fn test_parse_defaults() {
        let uri = CoapUri::parse("coap://example.com").unwrap();
        assert_eq!(uri.port(), DEFAULT_PORT);
        assert!(uri.path_segments().is_empty());
        assert!(uri.query_tokens().is_empty());
    }

    #[test]
    fn test_parse_ipv6_literal() {
        let uri = CoapUri::parse("coap://[::1]:9999/x").unwrap();
        assert_eq!(uri.host(), "::1");
        assert_eq!(uri.port(), 9999);
        assert_eq!(uri.path_segments(), ["x"]);

        let defaulted = CoapUri::parse("coap://[fe80::1]/x").unwrap();
        assert_eq!(defaulted.port(), DEFAULT_PORT);
    }

    #[test]
    fn test_rejects_other_schemes() {
        assert!(CoapUri::parse("http://example.com/").is_err());
        assert!(CoapUri::parse("coaps://example.com/").is_err());
    }

    #[test]
    fn test_options_mapping() {
        let uri = CoapUri::parse("coap://h/alpha/beta?q=1").unwrap();
        let mut packet = Packet::new();
        uri.apply_to(&mut packet);
        let paths: Vec<_> = packet
            .get_option(CoapOption::UriPath)
            .unwrap()
            .iter()
            .cloned()
            .collect();
        assert_eq!(paths, vec![b"alpha".to_vec(), b"beta".to_vec()]);
        let queries: Vec<_> = packet
            .get_option(CoapOption::UriQuery)
            .unwrap()
            .iter()
            .cloned()
            .collect();
        assert_eq!(queries, vec![b"q=1".to_vec()]);
    }
}
