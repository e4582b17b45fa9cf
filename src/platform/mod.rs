//! Platform effectors
//!
//! Capability contracts for the OS-level side effects (routing table,
//! firewall, DNS, adapter probing) with Windows implementations and
//! "unsupported" stand-ins for other platforms, selected at composition
//! time. The state machine and scenarios only ever see the traits.

pub mod command;
pub mod dns;
pub mod firewall;
pub mod gateway;
pub mod routes;

use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::state::{GatewayInfo, RouteKind, RouteRecord};

/// Firewall rule group label for every rule this client installs.
pub const KILL_SWITCH_GROUP: &str = "CustomVPN KillSwitch";

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("cidr {cidr}: {message}")]
    InvalidCidr { cidr: String, message: String },

    #[error("gateway is not defined")]
    MissingGateway,

    #[error("refusing to delete default route without gateway")]
    DefaultRouteGuard,

    #[error("route {command} failed: {message}")]
    Command { command: String, message: String },

    #[error("route operation timed out")]
    Timeout,

    #[error("canceled")]
    Canceled,

    #[error("routing is not supported on this platform")]
    Unsupported,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("default gateway not found")]
    NotFound,

    #[error("multiple default gateways detected")]
    MultipleDefaultGateways,

    #[error("no interface found for {0}")]
    NoInterfaceForIp(Ipv4Addr),

    #[error("multiple interfaces match target ip")]
    MultipleInterfacesForIp,

    #[error("{0}")]
    Os(String),

    #[error("gateway detection is not supported on this platform")]
    Unsupported,
}

/// A failed firewall operation; `created` lists rules this call managed to
/// install before failing (already best-effort reversed by the callee, and
/// reported so the caller can log them).
#[derive(Debug, Error)]
#[error("{message}")]
pub struct FirewallError {
    pub message: String,
    pub created: Vec<String>,
}

impl FirewallError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            created: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum DnsError {
    #[error("interface alias is empty")]
    EmptyInterface,

    #[error("dns servers are empty")]
    EmptyServers,

    #[error("{0}")]
    Command(String),

    #[error("dns configuration is not supported on this platform")]
    Unsupported,
}

/// OS routing table operations.
#[async_trait]
pub trait Routes: Send + Sync {
    /// Adds a route for `cidr` via `gateway` and returns the registry record
    /// for it.
    async fn add_cidr_route(
        &self,
        cidr: &str,
        gateway: &GatewayInfo,
        kind: RouteKind,
    ) -> Result<RouteRecord, RoutingError>;

    /// Removes a previously added route. Refuses to delete `0.0.0.0/0`
    /// without an explicit gateway.
    async fn remove_route(&self, record: &RouteRecord) -> Result<(), RoutingError>;
}

/// Adapter probing.
#[async_trait]
pub trait GatewayProbe: Send + Sync {
    /// Finds the single IPv4 default gateway among operational adapters.
    async fn detect_default_gateway(&self) -> Result<GatewayInfo, GatewayError>;

    /// Finds the adapter whose on-link prefix contains `ip` (used to discover
    /// the tunnel adapter the core creates after launch).
    async fn detect_gateway_for_ip(&self, ip: Ipv4Addr) -> Result<GatewayInfo, GatewayError>;
}

/// Kill-switch firewall rules.
#[async_trait]
pub trait Firewall: Send + Sync {
    /// Installs outbound UDP+TCP blocks of remote port 53 on the interface
    /// and returns the created rule names.
    async fn block_dns_on_interface(
        &self,
        interface_alias: &str,
    ) -> Result<Vec<String>, FirewallError>;

    /// Removes rules by name; missing rules are not an error.
    async fn remove_rules(&self, names: &[String]) -> Result<(), FirewallError>;

    /// Removes every rule in the kill-switch group.
    async fn remove_kill_switch_group(&self) -> Result<(), FirewallError>;
}

/// Interface DNS configuration.
#[async_trait]
pub trait Dns: Send + Sync {
    async fn set_interface_dns(
        &self,
        interface_alias: &str,
        servers: &[String],
    ) -> Result<(), DnsError>;
}

/// The effector set wired into the application.
#[derive(Clone)]
pub struct Effectors {
    pub routes: Arc<dyn Routes>,
    pub gateway: Arc<dyn GatewayProbe>,
    pub firewall: Arc<dyn Firewall>,
    pub dns: Arc<dyn Dns>,
}

/// Platform-default effectors: real implementations on Windows, stand-ins
/// returning "unsupported" errors elsewhere (the FSM is unchanged either
/// way).
pub fn default_effectors() -> Effectors {
    #[cfg(windows)]
    {
        Effectors {
            routes: Arc::new(routes::WindowsRoutes::new()),
            gateway: Arc::new(gateway::WindowsGatewayProbe),
            firewall: Arc::new(firewall::WindowsFirewall::new()),
            dns: Arc::new(dns::WindowsDns),
        }
    }
    #[cfg(not(windows))]
    {
        Effectors {
            routes: Arc::new(UnsupportedEffectors),
            gateway: Arc::new(UnsupportedEffectors),
            firewall: Arc::new(UnsupportedEffectors),
            dns: Arc::new(UnsupportedEffectors),
        }
    }
}

/// Stand-in effector for platforms without an implementation.
pub struct UnsupportedEffectors;

#[async_trait]
impl Routes for UnsupportedEffectors {
    async fn add_cidr_route(
        &self,
        _cidr: &str,
        _gateway: &GatewayInfo,
        _kind: RouteKind,
    ) -> Result<RouteRecord, RoutingError> {
        Err(RoutingError::Unsupported)
    }

    async fn remove_route(&self, _record: &RouteRecord) -> Result<(), RoutingError> {
        Err(RoutingError::Unsupported)
    }
}

#[async_trait]
impl GatewayProbe for UnsupportedEffectors {
    async fn detect_default_gateway(&self) -> Result<GatewayInfo, GatewayError> {
        Err(GatewayError::Unsupported)
    }

    async fn detect_gateway_for_ip(&self, _ip: Ipv4Addr) -> Result<GatewayInfo, GatewayError> {
        Err(GatewayError::Unsupported)
    }
}

#[async_trait]
impl Firewall for UnsupportedEffectors {
    async fn block_dns_on_interface(
        &self,
        _interface_alias: &str,
    ) -> Result<Vec<String>, FirewallError> {
        Err(FirewallError::new("firewall is not supported on this platform"))
    }

    async fn remove_rules(&self, _names: &[String]) -> Result<(), FirewallError> {
        Err(FirewallError::new("firewall is not supported on this platform"))
    }

    async fn remove_kill_switch_group(&self) -> Result<(), FirewallError> {
        Err(FirewallError::new("firewall is not supported on this platform"))
    }
}

#[async_trait]
impl Dns for UnsupportedEffectors {
    async fn set_interface_dns(
        &self,
        _interface_alias: &str,
        _servers: &[String],
    ) -> Result<(), DnsError> {
        Err(DnsError::Unsupported)
    }
}
