//! Split-tunnel routing and tunnel interface configuration

pub mod interface;
pub mod network;
pub mod routing;

pub use interface::{InterfaceConfig, InterfaceDirective, TunnelInterfaceConfigurator};
pub use network::NetworkSpec;
pub use routing::{RouteDirective, RouteMode, RouteResolver, SplitTunnelPolicy};
