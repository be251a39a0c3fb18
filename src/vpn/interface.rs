//! Tunnel interface configuration
//!
//! [`InterfaceConfig`] is the validated, immutable description of one
//! session's tunnel interface. [`TunnelInterfaceConfigurator`] turns it into
//! the ordered directive list handed to the platform's interface builder.
//!
//! # Directive order
//!
//! Session name, addresses, DNS servers (plus a host route per DNS server when
//! the platform needs one), search domain, routes, excluded routes, disallowed
//! applications, MTU, HTTP proxy, address families, blocking mode, metered
//! flag. Builders may be order-sensitive, so callers must apply the list as
//! emitted.

use crate::config::{ConfigError, TunnelProfile};
use crate::platform::Capabilities;
use crate::vpn::network::NetworkSpec;
use crate::vpn::routing::{RouteDirective, RouteMode, RouteResolver};
use std::fmt;
use std::net::IpAddr;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyAddress {
    pub host: String,
    pub port: u16,
}

impl ProxyAddress {
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let (host, port) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| ConfigError::InvalidProxy(s.to_string()))?;
        let port: u16 = port
            .parse()
            .map_err(|_| ConfigError::InvalidProxy(s.to_string()))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() || port == 0 {
            return Err(ConfigError::InvalidProxy(s.to_string()));
        }
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for ProxyAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    V4,
    V6,
}

/// One instruction for the external interface builder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterfaceDirective {
    SetSession(String),
    AddAddress(NetworkSpec),
    AddDnsServer(IpAddr),
    AddSearchDomain(String),
    AddRoute(NetworkSpec),
    ExcludeRoute(NetworkSpec),
    DisallowApplication(String),
    SetMtu(u32),
    SetHttpProxy(ProxyAddress),
    AllowFamily(AddressFamily),
    SetBlocking(bool),
    SetMetered(bool),
}

impl fmt::Display for InterfaceDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterfaceDirective::SetSession(name) => write!(f, "session {}", name),
            InterfaceDirective::AddAddress(addr) => write!(f, "address {}", addr),
            InterfaceDirective::AddDnsServer(ip) => write!(f, "dns {}", ip),
            InterfaceDirective::AddSearchDomain(domain) => write!(f, "search-domain {}", domain),
            InterfaceDirective::AddRoute(net) => write!(f, "route {}", net),
            InterfaceDirective::ExcludeRoute(net) => write!(f, "exclude-route {}", net),
            InterfaceDirective::DisallowApplication(app) => write!(f, "disallow-app {}", app),
            InterfaceDirective::SetMtu(mtu) => write!(f, "mtu {}", mtu),
            InterfaceDirective::SetHttpProxy(proxy) => write!(f, "http-proxy {}", proxy),
            InterfaceDirective::AllowFamily(AddressFamily::V4) => write!(f, "allow-family inet"),
            InterfaceDirective::AllowFamily(AddressFamily::V6) => write!(f, "allow-family inet6"),
            InterfaceDirective::SetBlocking(on) => write!(f, "blocking {}", on),
            InterfaceDirective::SetMetered(on) => write!(f, "metered {}", on),
        }
    }
}

/// Validated interface settings for one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceConfig {
    session_name: String,
    addresses: Vec<NetworkSpec>,
    dns_servers: Vec<IpAddr>,
    search_domain: Option<String>,
    routes: Vec<NetworkSpec>,
    excluded_routes: Vec<NetworkSpec>,
    excluded_applications: Vec<String>,
    mtu: u32,
    http_proxy: Option<ProxyAddress>,
    allow_all_families: bool,
    blocking: bool,
}

impl InterfaceConfig {
    /// Validate a profile and resolve its split-tunnel routes
    ///
    /// Resolver output is applied onto the profile's allowed routes: `Remove`
    /// drops equal routes, `Add` appends (a duplicate moves to the end), and
    /// `Exclude` goes to the excluded list.
    pub fn build(profile: &TunnelProfile, resolver: &RouteResolver) -> Result<Self, ConfigError> {
        let policy = profile.policy()?;
        let mtu = profile.validated_mtu()?;
        let http_proxy = profile
            .http_proxy
            .as_deref()
            .map(ProxyAddress::parse)
            .transpose()?;

        let mut config = Self {
            session_name: profile.name.clone(),
            addresses: profile.addresses.clone(),
            dns_servers: profile.dns_servers.clone(),
            search_domain: profile.search_domain.clone().filter(|d| !d.is_empty()),
            routes: profile.allowed_routes.iter().map(NetworkSpec::network).collect(),
            excluded_routes: Vec::new(),
            excluded_applications: profile.excluded_applications.clone(),
            mtu,
            http_proxy,
            allow_all_families: profile.allow_all_families,
            blocking: profile.blocking,
        };
        config.apply_routes(&resolver.resolve(&policy));
        Ok(config)
    }

    fn apply_routes(&mut self, directives: &[RouteDirective]) {
        for directive in directives {
            let network = directive.network;
            match directive.mode {
                RouteMode::Remove => self.routes.retain(|route| *route != network),
                RouteMode::Add => {
                    self.routes.retain(|route| *route != network);
                    self.routes.push(network);
                }
                RouteMode::Exclude => self.excluded_routes.push(network),
            }
        }
        debug!(
            "Interface routes: {} included, {} excluded",
            self.routes.len(),
            self.excluded_routes.len()
        );
    }

    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    pub fn addresses(&self) -> &[NetworkSpec] {
        &self.addresses
    }

    pub fn dns_servers(&self) -> &[IpAddr] {
        &self.dns_servers
    }

    pub fn routes(&self) -> &[NetworkSpec] {
        &self.routes
    }

    pub fn excluded_routes(&self) -> &[NetworkSpec] {
        &self.excluded_routes
    }

    pub fn mtu(&self) -> u32 {
        self.mtu
    }

    pub fn http_proxy(&self) -> Option<&ProxyAddress> {
        self.http_proxy.as_ref()
    }
}

/// Emits interface directives according to platform capabilities
#[derive(Debug, Clone, Copy)]
pub struct TunnelInterfaceConfigurator {
    capabilities: Capabilities,
}

impl TunnelInterfaceConfigurator {
    pub fn new(capabilities: Capabilities) -> Self {
        Self { capabilities }
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Resolver matching this configurator's exclude-route support
    pub fn resolver(&self) -> RouteResolver {
        RouteResolver::for_capabilities(&self.capabilities)
    }

    pub fn directives(&self, config: &InterfaceConfig) -> Vec<InterfaceDirective> {
        let caps = &self.capabilities;
        let mut out = vec![InterfaceDirective::SetSession(config.session_name.clone())];

        out.extend(config.addresses.iter().copied().map(InterfaceDirective::AddAddress));
        out.extend(config.dns_servers.iter().copied().map(InterfaceDirective::AddDnsServer));
        if caps.dns_requires_route {
            out.extend(
                config
                    .dns_servers
                    .iter()
                    .map(|ip| InterfaceDirective::AddRoute(NetworkSpec::host(*ip))),
            );
        }
        if let Some(domain) = &config.search_domain {
            out.push(InterfaceDirective::AddSearchDomain(domain.clone()));
        }

        out.extend(config.routes.iter().copied().map(InterfaceDirective::AddRoute));
        if caps.exclude_route {
            out.extend(config.excluded_routes.iter().copied().map(InterfaceDirective::ExcludeRoute));
        } else if !config.excluded_routes.is_empty() {
            debug!(
                "Dropping {} excluded routes, platform has no exclude primitive",
                config.excluded_routes.len()
            );
        }

        out.extend(
            config
                .excluded_applications
                .iter()
                .cloned()
                .map(InterfaceDirective::DisallowApplication),
        );
        out.push(InterfaceDirective::SetMtu(config.mtu));

        if caps.http_proxy {
            if let Some(proxy) = &config.http_proxy {
                out.push(InterfaceDirective::SetHttpProxy(proxy.clone()));
            }
        }

        if config.allow_all_families {
            out.push(InterfaceDirective::AllowFamily(AddressFamily::V4));
            out.push(InterfaceDirective::AllowFamily(AddressFamily::V6));
        }

        out.push(InterfaceDirective::SetBlocking(config.blocking));
        if caps.metered_flag {
            out.push(InterfaceDirective::SetMetered(false));
        }
        out
    }
}
