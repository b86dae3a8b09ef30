use std::str::FromStr;

use bincode::{Decode, Encode};
use url::Url;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// The only scheme the muddle transport accepts.
const TCP_SCHEME: &str = "tcp";

/// Network location of a peer, in the form `tcp://host:port`.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Decode, Encode)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Uri(String);

impl Uri {
    /// Parses and validates a uri.
    pub fn parse(s: &str) -> Result<Self> {
        let url = Url::parse(s)?;
        if url.scheme() != TCP_SCHEME {
            return Err(Error::InvalidUri(format!("unsupported scheme in {s}")));
        }
        if url.host_str().is_none() || url.port().is_none() {
            return Err(Error::InvalidUri(format!("missing host or port in {s}")));
        }
        Ok(Self(s.to_string()))
    }

    /// Builds a tcp uri from a host and a port.
    pub fn from_host_port(host: &str, port: u16) -> Result<Self> {
        if host.contains(':') && !host.starts_with('[') {
            Self::parse(&format!("{TCP_SCHEME}://[{host}]:{port}"))
        } else {
            Self::parse(&format!("{TCP_SCHEME}://{host}:{port}"))
        }
    }

    /// Checks the uri again; decoded uris are not validated on the way in.
    pub fn is_valid(&self) -> bool {
        Self::parse(&self.0).is_ok()
    }

    /// Returns the host part of the uri.
    pub fn host(&self) -> Option<String> {
        Url::parse(&self.0)
            .ok()
            .and_then(|url| url.host_str().map(|h| h.to_string()))
    }

    /// Returns the port part of the uri.
    pub fn port(&self) -> Option<u16> {
        Url::parse(&self.0).ok().and_then(|url| url.port())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Uri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl std::fmt::Display for Uri {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_uri() {
        let uri: Uri = "tcp://127.0.0.1:8000".parse().unwrap();
        assert_eq!(uri.host().as_deref(), Some("127.0.0.1"));
        assert_eq!(uri.port(), Some(8000));
        assert!(uri.is_valid());

        assert!(Uri::parse("udp://127.0.0.1:8000").is_err());
        assert!(Uri::parse("tcp://127.0.0.1").is_err());
        assert!(Uri::parse("not a uri").is_err());
    }

    #[test]
    fn test_from_host_port() {
        let uri = Uri::from_host_port("10.0.0.3", 9000).unwrap();
        assert_eq!(uri.as_str(), "tcp://10.0.0.3:9000");

        let uri = Uri::from_host_port("::1", 9000).unwrap();
        assert_eq!(uri.port(), Some(9000));
    }
}
