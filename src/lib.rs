//! vpnctl - control plane for a split-tunnel VPN client
//!
//! This crate decides which traffic enters the tunnel and keeps a UI-side
//! controller in step with a background tunnel service. Packet transport is
//! left to a native engine behind the [`engine::TunnelEngine`] trait.
//!
//! # Architecture
//!
//! - `vpn`: split-tunnel route resolution and interface directives
//! - `platform`: capability descriptor for the target's VPN interface
//! - `ipc`: session messages and the multi-subscriber channel
//! - `session`: the coordinator state machine behind the on/off indicator
//! - `service`: the background service endpoint driving the engine
//! - `engine`: native engine collaborator
//! - `loader`: engine library loading with package-archive fallback
//! - `config`: configuration file (TOML) and tunnel profiles (JSON)
//! - `notify`: desktop notifications
//!
//! # Usage
//!
//! ```bash
//! vpnctl init
//! vpnctl routes --fallback
//! vpnctl simulate
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod loader;
pub mod notify;
pub mod platform;
pub mod service;
pub mod session;
pub mod vpn;

pub use config::{Config, ConfigError, TunnelProfile};
pub use error::VpnError;
pub use platform::Capabilities;
pub use session::{SessionCoordinator, SessionSettings};
pub use vpn::{RouteResolver, SplitTunnelPolicy, TunnelInterfaceConfigurator};
