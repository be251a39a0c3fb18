//! Platform capability descriptor
//!
//! The interface configurator asks what the target platform's VPN interface
//! supports instead of branching on OS versions. The descriptor is resolved
//! once at startup and passed in.

use crate::config::CapabilityOverrides;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Interface accepts negative ("exclude") routes
    pub exclude_route: bool,
    /// Interface can carry an HTTP proxy setting
    pub http_proxy: bool,
    /// Interface has a metered-network flag
    pub metered_flag: bool,
    /// DNS servers are ignored unless a route covers them
    pub dns_requires_route: bool,
}

impl Capabilities {
    /// No optional features
    pub const fn minimal() -> Self {
        Self {
            exclude_route: false,
            http_proxy: false,
            metered_flag: false,
            dns_requires_route: false,
        }
    }

    /// Capabilities of the platform this binary was built for
    pub fn detect() -> Self {
        #[cfg(target_os = "linux")]
        {
            Self {
                exclude_route: true,
                ..Self::minimal()
            }
        }

        #[cfg(target_os = "macos")]
        {
            Self {
                exclude_route: true,
                http_proxy: true,
                ..Self::minimal()
            }
        }

        #[cfg(target_os = "windows")]
        {
            Self {
                http_proxy: true,
                ..Self::minimal()
            }
        }

        #[cfg(target_os = "android")]
        {
            Self {
                http_proxy: true,
                metered_flag: true,
                ..Self::minimal()
            }
        }

        #[cfg(not(any(
            target_os = "linux",
            target_os = "macos",
            target_os = "windows",
            target_os = "android"
        )))]
        {
            Self::minimal()
        }
    }

    pub fn with_overrides(self, overrides: &CapabilityOverrides) -> Self {
        Self {
            exclude_route: overrides.exclude_route.unwrap_or(self.exclude_route),
            http_proxy: overrides.http_proxy.unwrap_or(self.http_proxy),
            metered_flag: overrides.metered_flag.unwrap_or(self.metered_flag),
            dns_requires_route: overrides
                .dns_requires_route
                .unwrap_or(self.dns_requires_route),
        }
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::detect()
    }
}
