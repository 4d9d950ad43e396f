use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Network location of a storage node, written `host:port` on the wire and on disk.
///
/// Two addresses are the same node when host and port match exactly; no name
/// resolution is involved in the comparison.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StorageNodeAddress {
    pub host: String,
    pub port: u16,
}

impl StorageNodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Form accepted by `TcpStream::connect`.
    pub fn connect_target(&self) -> (&str, u16) {
        (self.host.as_str(), self.port)
    }
}

impl fmt::Display for StorageNodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for StorageNodeAddress {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| anyhow::anyhow!("'{}' is not in host:port form", s))?;
        if host.is_empty() {
            bail!("'{}' has an empty host", s);
        }
        let port: u16 = port
            .parse()
            .with_context(|| format!("'{}' has an invalid port", s))?;
        if port == 0 {
            bail!("'{}' has port 0", s);
        }
        Ok(Self::new(host, port))
    }
}

impl TryFrom<String> for StorageNodeAddress {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<StorageNodeAddress> for String {
    fn from(value: StorageNodeAddress) -> Self {
        value.to_string()
    }
}

impl From<std::net::SocketAddr> for StorageNodeAddress {
    fn from(addr: std::net::SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}
