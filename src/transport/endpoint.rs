//! Endpoint parsing and dialect selection
//!
//! Two appliance generations are supported and told apart by URL path:
//! `/websocket` (legacy, needs a connect handshake and `msg` envelopes) and
//! `/api/current` (JSON-RPC 2.0).

use crate::error::{Error, Result};
use tokio_tungstenite::tungstenite::http::Uri;

pub const LEGACY_PATH: &str = "/websocket";
pub const MODERN_PATH: &str = "/api/current";

/// Transport scheme of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Ws,
    Wss,
}

impl Scheme {
    pub fn is_tls(&self) -> bool {
        matches!(self, Scheme::Wss)
    }
}

/// Wire dialect spoken by the appliance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    /// `/websocket`: connect handshake, `"msg": "method"` requests
    Legacy,
    /// `/api/current`: `"jsonrpc": "2.0"` requests
    Modern,
}

/// A validated appliance endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    url: String,
    scheme: Scheme,
    dialect: Dialect,
    host: String,
}

impl Endpoint {
    /// Parse and validate an endpoint URL
    pub fn parse(url: &str) -> Result<Self> {
        let uri: Uri = url
            .parse()
            .map_err(|e| Error::InvalidArgument(format!("invalid appliance url {}: {}", url, e)))?;

        let scheme = match uri.scheme_str() {
            Some("ws") => Scheme::Ws,
            Some("wss") => Scheme::Wss,
            _ => {
                return Err(Error::InvalidArgument(format!(
                    "invalid appliance url scheme in {}, must be either 'ws' or 'wss'",
                    url
                )))
            }
        };

        let host = uri
            .host()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::InvalidArgument(format!("appliance url {} has no host", url)))?
            .to_string();

        let dialect = match uri.path() {
            LEGACY_PATH => Dialect::Legacy,
            MODERN_PATH => Dialect::Modern,
            other => {
                return Err(Error::InvalidArgument(format!(
                    "invalid appliance url path {}, must be either '{}' or '{}'",
                    other, LEGACY_PATH, MODERN_PATH
                )))
            }
        };

        Ok(Self {
            url: url.to_string(),
            scheme,
            dialect,
            host,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn host(&self) -> &str {
        &self.host
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Code;

    #[test]
    fn test_parse_dialects() {
        let legacy = Endpoint::parse("wss://nas.local/websocket").unwrap();
        assert_eq!(legacy.dialect(), Dialect::Legacy);
        assert!(legacy.scheme().is_tls());
        assert_eq!(legacy.host(), "nas.local");

        let modern = Endpoint::parse("ws://10.0.0.5:80/api/current").unwrap();
        assert_eq!(modern.dialect(), Dialect::Modern);
        assert_eq!(modern.scheme(), Scheme::Ws);
        assert_eq!(modern.to_string(), "ws://10.0.0.5:80/api/current");
    }

    #[test]
    fn test_parse_rejects_bad_urls() {
        for url in [
            "https://nas.local/websocket",
            "wss://nas.local/api/v2.0",
            "wss://nas.local",
            "not a url",
        ] {
            let err = Endpoint::parse(url).unwrap_err();
            assert_eq!(err.code(), Code::InvalidArgument, "{}", url);
        }
    }
}
