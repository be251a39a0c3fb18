//! Split-tunnel route resolution
//!
//! Turns a [`SplitTunnelPolicy`] into the ordered route directives that the
//! interface configurator applies on top of the tunnel's default routes.
//!
//! On platforms without a native "exclude route" primitive, exclusions are
//! expressed positively: the resolver computes the minimal set of CIDR blocks
//! covering the IPv4 space minus loopback and the excluded sites. IPv6 is
//! approximated by routing all of `2000::/3`, so IPv6 sites stay tunneled.

use crate::config::ConfigError;
use crate::platform::Capabilities;
use crate::vpn::network::NetworkSpec;
use ipnet::{IpNet, Ipv4Net, Ipv4Subnets, Ipv6Net, Ipv6Subnets};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use tracing::debug;

/// `127.0.0.0/8`, never routed into the tunnel in fallback mode
const LOOPBACK_V4: Ipv4Net = Ipv4Net::new_assert(Ipv4Addr::new(127, 0, 0, 0), 8);

/// `2000::/3`, the global unicast range restored after an exclusion
const GLOBAL_UNICAST_V6: Ipv6Net = Ipv6Net::new_assert(Ipv6Addr::new(0x2000, 0, 0, 0, 0, 0, 0, 0), 3);

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SplitTunnelPolicy {
    #[default]
    Disabled,
    Include(Vec<NetworkSpec>),
    Exclude(Vec<NetworkSpec>),
}

impl SplitTunnelPolicy {
    /// Build a policy from the profile's numeric type and raw site list
    ///
    /// `0` disables split tunneling, `1` includes, `2` excludes. Include and
    /// exclude require a site list; every site must parse.
    pub fn from_code(code: i64, sites: Option<&[String]>) -> Result<Self, ConfigError> {
        let parse_sites = |mode: &'static str| -> Result<Vec<NetworkSpec>, ConfigError> {
            sites
                .ok_or(ConfigError::MissingSites(mode))?
                .iter()
                .map(|site| NetworkSpec::parse(site))
                .collect()
        };

        match code {
            0 => Ok(SplitTunnelPolicy::Disabled),
            1 => Ok(SplitTunnelPolicy::Include(parse_sites("include")?)),
            2 => Ok(SplitTunnelPolicy::Exclude(parse_sites("exclude")?)),
            other => Err(ConfigError::InvalidSplitTunnelType(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteMode {
    /// Route the network into the tunnel
    Add,
    /// Drop an equal route established elsewhere (the default routes)
    Remove,
    /// Keep the network out of the tunnel (native exclude primitive)
    Exclude,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteDirective {
    pub network: NetworkSpec,
    pub mode: RouteMode,
}

impl RouteDirective {
    pub fn add(network: NetworkSpec) -> Self {
        Self { network, mode: RouteMode::Add }
    }

    pub fn remove(network: NetworkSpec) -> Self {
        Self { network, mode: RouteMode::Remove }
    }

    pub fn exclude(network: NetworkSpec) -> Self {
        Self { network, mode: RouteMode::Exclude }
    }
}

impl fmt::Display for RouteDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self.mode {
            RouteMode::Add => "add",
            RouteMode::Remove => "remove",
            RouteMode::Exclude => "exclude",
        };
        write!(f, "{} {}", verb, self.network)
    }
}

/// Computes route directives for a split-tunnel policy
#[derive(Debug, Clone, Copy)]
pub struct RouteResolver {
    native_exclude: bool,
}

impl RouteResolver {
    pub fn new(native_exclude: bool) -> Self {
        Self { native_exclude }
    }

    pub fn for_capabilities(capabilities: &Capabilities) -> Self {
        Self::new(capabilities.exclude_route)
    }

    pub fn native_exclude(&self) -> bool {
        self.native_exclude
    }

    pub fn resolve(&self, policy: &SplitTunnelPolicy) -> Vec<RouteDirective> {
        match policy {
            SplitTunnelPolicy::Disabled => Vec::new(),
            SplitTunnelPolicy::Include(sites) => {
                let mut directives = default_route_removals();
                directives.extend(sites.iter().map(|site| RouteDirective::add(site.network())));
                directives
            }
            SplitTunnelPolicy::Exclude(sites) if self.native_exclude => sites
                .iter()
                .map(|site| RouteDirective::exclude(site.network()))
                .collect(),
            SplitTunnelPolicy::Exclude(sites) => resolve_exclusion_fallback(sites),
        }
    }
}

fn default_route_removals() -> Vec<RouteDirective> {
    vec![
        RouteDirective::remove(NetworkSpec::default_v4()),
        RouteDirective::remove(NetworkSpec::default_v6()),
    ]
}

fn resolve_exclusion_fallback(sites: &[NetworkSpec]) -> Vec<RouteDirective> {
    let mut holes = vec![IpNet::V4(LOOPBACK_V4)];
    holes.extend(sites.iter().map(|site| *site.as_ipnet()));

    let covering = covering_set(IpNet::V4(Ipv4Net::default()), &holes);
    let ipv6_sites = sites.iter().filter(|site| !site.is_ipv4()).count();
    debug!(
        "Exclusion fallback: {} IPv4 covering blocks for {} sites",
        covering.len(),
        sites.len()
    );
    if ipv6_sites > 0 {
        debug!(
            "{} IPv6 sites stay inside {} in fallback mode",
            ipv6_sites, GLOBAL_UNICAST_V6
        );
    }

    let mut directives = default_route_removals();
    directives.extend(
        covering
            .into_iter()
            .map(|net| RouteDirective::add(NetworkSpec::from(net))),
    );
    directives.push(RouteDirective::add(NetworkSpec::from(IpNet::V6(
        GLOBAL_UNICAST_V6,
    ))));
    directives
}

/// Minimal CIDR blocks covering `scope` minus the union of `holes`
///
/// Holes of the other address family are ignored; holes reaching outside the
/// scope are clipped to it. Output is sorted by address and pairwise disjoint.
pub fn covering_set(scope: IpNet, holes: &[IpNet]) -> Vec<IpNet> {
    let (scope_start, scope_end) = bounds(&scope);
    let is_v4 = matches!(scope, IpNet::V4(_));

    let mut ranges: Vec<(u128, u128)> = holes
        .iter()
        .filter(|hole| matches!(hole, IpNet::V4(_)) == is_v4)
        .map(bounds)
        .filter(|&(start, end)| end >= scope_start && start <= scope_end)
        .map(|(start, end)| (start.max(scope_start), end.min(scope_end)))
        .collect();
    let merged = merge_ranges(&mut ranges);

    let mut gaps = Vec::new();
    let mut cursor = Some(scope_start);
    for (start, end) in merged {
        let Some(from) = cursor else { break };
        if start > from {
            gaps.push((from, start - 1));
        }
        cursor = if end >= scope_end { None } else { Some(end + 1) };
    }
    if let Some(from) = cursor {
        gaps.push((from, scope_end));
    }

    gaps.into_iter()
        .flat_map(|(start, end)| range_to_blocks(is_v4, start, end))
        .collect()
}

/// Sort and coalesce overlapping or adjacent inclusive ranges
fn merge_ranges(ranges: &mut [(u128, u128)]) -> Vec<(u128, u128)> {
    ranges.sort_unstable();
    let mut merged: Vec<(u128, u128)> = Vec::with_capacity(ranges.len());
    for &(start, end) in ranges.iter() {
        match merged.last_mut() {
            Some(last) if start <= last.1.saturating_add(1) => last.1 = last.1.max(end),
            _ => merged.push((start, end)),
        }
    }
    merged
}

/// Inclusive first and last address of a network, as integers
fn bounds(net: &IpNet) -> (u128, u128) {
    match net {
        IpNet::V4(v4) => (
            u32::from(v4.network()) as u128,
            u32::from(v4.broadcast()) as u128,
        ),
        IpNet::V6(v6) => (u128::from(v6.network()), u128::from(v6.broadcast())),
    }
}

fn range_to_blocks(is_v4: bool, start: u128, end: u128) -> Vec<IpNet> {
    if is_v4 {
        Ipv4Subnets::new(Ipv4Addr::from(start as u32), Ipv4Addr::from(end as u32), 0)
            .map(IpNet::V4)
            .collect()
    } else {
        Ipv6Subnets::new(Ipv6Addr::from(start), Ipv6Addr::from(end), 0)
            .map(IpNet::V6)
            .collect()
    }
}
