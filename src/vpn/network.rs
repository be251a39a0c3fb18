//! CIDR network specifications

use crate::config::ConfigError;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// An address plus prefix length
///
/// Accepts `addr/prefix` or a bare address (full-length prefix). Host bits are
/// kept as written; [`NetworkSpec::network`] gives the truncated block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NetworkSpec(IpNet);

impl NetworkSpec {
    pub fn new(addr: IpAddr, prefix_len: u8) -> Result<Self, ConfigError> {
        IpNet::new(addr, prefix_len)
            .map(Self)
            .map_err(|_| ConfigError::InvalidNetwork(format!("{}/{}", addr, prefix_len)))
    }

    /// Single-address network
    pub fn host(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(v4) => Self(IpNet::V4(Ipv4Net::from(v4))),
            IpAddr::V6(v6) => Self(IpNet::V6(Ipv6Net::from(v6))),
        }
    }

    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let s = s.trim();
        let parsed = if s.contains('/') {
            s.parse::<IpNet>().ok()
        } else {
            s.parse::<IpAddr>().ok().map(|addr| Self::host(addr).0)
        };
        parsed
            .map(Self)
            .ok_or_else(|| ConfigError::InvalidNetwork(s.to_string()))
    }

    /// `0.0.0.0/0`
    pub fn default_v4() -> Self {
        Self(IpNet::V4(Ipv4Net::default()))
    }

    /// `::/0`
    pub fn default_v6() -> Self {
        Self(IpNet::V6(Ipv6Net::default()))
    }

    pub fn addr(&self) -> IpAddr {
        self.0.addr()
    }

    pub fn prefix_len(&self) -> u8 {
        self.0.prefix_len()
    }

    pub fn is_ipv4(&self) -> bool {
        matches!(self.0, IpNet::V4(_))
    }

    pub fn is_default_route(&self) -> bool {
        self.prefix_len() == 0
    }

    /// Same prefix with host bits cleared
    pub fn network(&self) -> Self {
        Self(self.0.trunc())
    }

    pub fn as_ipnet(&self) -> &IpNet {
        &self.0
    }
}

impl From<IpNet> for NetworkSpec {
    fn from(net: IpNet) -> Self {
        Self(net)
    }
}

impl From<NetworkSpec> for IpNet {
    fn from(spec: NetworkSpec) -> Self {
        spec.0
    }
}

impl FromStr for NetworkSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for NetworkSpec {
    type Error = ConfigError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<NetworkSpec> for String {
    fn from(spec: NetworkSpec) -> Self {
        spec.to_string()
    }
}

impl fmt::Display for NetworkSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
