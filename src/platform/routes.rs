//! Routing table effector (Windows: `route.exe`)
//!
//! Routes are added and removed through the system routing utility with
//! hidden windows and a 5 s deadline. Netmasks are rendered dotted-decimal;
//! a gateway metric of zero is coerced to 1.

use std::net::Ipv4Addr;

use super::RoutingError;
use crate::state::{GatewayInfo, RouteKind, RouteRecord};

/// Parses an IPv4 CIDR string into its network address and prefix length.
/// Host bits are masked off, matching what the routing utility expects.
pub fn parse_ipv4_cidr(cidr: &str) -> Result<(Ipv4Addr, u8), RoutingError> {
    let invalid = |message: &str| RoutingError::InvalidCidr {
        cidr: cidr.to_string(),
        message: message.to_string(),
    };
    let (addr_part, prefix_part) = cidr.split_once('/').ok_or_else(|| invalid("missing prefix"))?;
    let addr: Ipv4Addr = addr_part
        .trim()
        .parse()
        .map_err(|_| invalid("invalid address"))?;
    let prefix: u8 = prefix_part
        .trim()
        .parse()
        .map_err(|_| invalid("invalid prefix length"))?;
    if prefix > 32 {
        return Err(invalid("prefix length exceeds 32"));
    }
    let mask = prefix_bits(prefix);
    let network = Ipv4Addr::from(u32::from(addr) & mask);
    Ok((network, prefix))
}

/// Dotted-decimal netmask for a prefix length.
pub fn prefix_to_mask(prefix: u8) -> Ipv4Addr {
    Ipv4Addr::from(prefix_bits(prefix))
}

fn prefix_bits(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix.min(32)))
    }
}

/// Builds the registry record for a successfully added route.
pub fn route_record(
    cidr: &str,
    gateway: &GatewayInfo,
    kind: RouteKind,
) -> RouteRecord {
    RouteRecord {
        id: RouteRecord::make_id(kind, cidr),
        destination: cidr.to_string(),
        gateway: gateway.ip.clone(),
        interface_index: gateway.interface_index,
        metric: gateway.route_metric(),
        kind,
        created_at: None,
        active: true,
    }
}

/// Guard shared by every implementation: never delete the default route
/// without an explicit gateway.
pub fn check_remove_allowed(record: &RouteRecord) -> Result<(), RoutingError> {
    if record.destination.is_empty() {
        return Err(RoutingError::InvalidCidr {
            cidr: String::new(),
            message: "route destination is empty".to_string(),
        });
    }
    let is_default = record.destination == "0.0.0.0" || record.destination == "0.0.0.0/0";
    if is_default && record.gateway.is_empty() {
        return Err(RoutingError::DefaultRouteGuard);
    }
    Ok(())
}

#[cfg(windows)]
pub use windows_impl::WindowsRoutes;

#[cfg(windows)]
mod windows_impl {
    use async_trait::async_trait;

    use super::*;
    use crate::platform::command::{
        combined_output, hidden_command, run_with_timeout, CommandError, COMMAND_TIMEOUT,
    };
    use crate::platform::Routes;

    /// `route.exe`-backed implementation.
    pub struct WindowsRoutes {
        route_exe: String,
    }

    impl WindowsRoutes {
        pub fn new() -> Self {
            Self {
                route_exe: "route.exe".to_string(),
            }
        }

        async fn run_route(&self, args: &[String]) -> Result<(), RoutingError> {
            let mut command = hidden_command(&self.route_exe);
            command.args(args);
            let rendered = args.join(" ");
            match run_with_timeout(command, COMMAND_TIMEOUT).await {
                Ok(output) if output.status.success() => {
                    let text = combined_output(&output);
                    if !text.is_empty() {
                        log::debug!("route {} -> {}", rendered, text);
                    }
                    Ok(())
                }
                Ok(output) => {
                    let text = combined_output(&output);
                    Err(RoutingError::Command {
                        command: rendered,
                        message: if text.is_empty() {
                            format!("exit {:?}", output.status.code())
                        } else {
                            text
                        },
                    })
                }
                Err(CommandError::Timeout) => Err(RoutingError::Timeout),
                Err(CommandError::Io(error)) => Err(RoutingError::Command {
                    command: rendered,
                    message: error.to_string(),
                }),
            }
        }
    }

    impl Default for WindowsRoutes {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl Routes for WindowsRoutes {
        async fn add_cidr_route(
            &self,
            cidr: &str,
            gateway: &GatewayInfo,
            kind: RouteKind,
        ) -> Result<RouteRecord, RoutingError> {
            if gateway.ip.is_empty() {
                return Err(RoutingError::MissingGateway);
            }
            let (network, prefix) = parse_ipv4_cidr(cidr)?;
            let mask = prefix_to_mask(prefix);
            let metric = gateway.route_metric();
            let mut args = vec![
                "ADD".to_string(),
                network.to_string(),
                "MASK".to_string(),
                mask.to_string(),
                gateway.ip.clone(),
                "METRIC".to_string(),
                metric.to_string(),
            ];
            if gateway.interface_index > 0 {
                args.push("IF".to_string());
                args.push(gateway.interface_index.to_string());
            }
            self.run_route(&args).await?;
            Ok(route_record(cidr, gateway, kind))
        }

        async fn remove_route(&self, record: &RouteRecord) -> Result<(), RoutingError> {
            check_remove_allowed(record)?;
            let destination = record
                .destination
                .split('/')
                .next()
                .unwrap_or(&record.destination)
                .to_string();
            let mut args = vec!["DELETE".to_string(), destination];
            if let Ok((_, prefix)) = parse_ipv4_cidr(&record.destination) {
                args.push("MASK".to_string());
                args.push(prefix_to_mask(prefix).to_string());
            }
            if !record.gateway.is_empty() {
                args.push(record.gateway.clone());
            }
            if record.interface_index > 0 {
                args.push("IF".to_string());
                args.push(record.interface_index.to_string());
            }
            self.run_route(&args).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cidr_and_masks_host_bits() {
        let (network, prefix) = parse_ipv4_cidr("10.1.2.3/8").unwrap();
        assert_eq!(network, Ipv4Addr::new(10, 0, 0, 0));
        assert_eq!(prefix, 8);
        assert_eq!(prefix_to_mask(prefix), Ipv4Addr::new(255, 0, 0, 0));
    }

    #[test]
    fn default_route_parses_to_zero_mask() {
        let (network, prefix) = parse_ipv4_cidr("0.0.0.0/0").unwrap();
        assert_eq!(network, Ipv4Addr::UNSPECIFIED);
        assert_eq!(prefix_to_mask(prefix), Ipv4Addr::UNSPECIFIED);
    }

    #[test]
    fn netmask_rendering_is_dotted_decimal() {
        assert_eq!(prefix_to_mask(32), Ipv4Addr::new(255, 255, 255, 255));
        assert_eq!(prefix_to_mask(12), Ipv4Addr::new(255, 240, 0, 0));
        assert_eq!(prefix_to_mask(24), Ipv4Addr::new(255, 255, 255, 0));
    }

    #[test]
    fn rejects_malformed_cidrs() {
        assert!(parse_ipv4_cidr("bad-cidr").is_err());
        assert!(parse_ipv4_cidr("10.0.0.0").is_err());
        assert!(parse_ipv4_cidr("10.0.0.0/33").is_err());
        assert!(parse_ipv4_cidr("example.com/8").is_err());
    }

    #[test]
    fn refuses_default_route_delete_without_gateway() {
        let record = RouteRecord {
            id: "t".to_string(),
            destination: "0.0.0.0/0".to_string(),
            gateway: String::new(),
            interface_index: 0,
            metric: 1,
            kind: RouteKind::Tunnel,
            created_at: None,
            active: true,
        };
        assert!(matches!(
            check_remove_allowed(&record),
            Err(RoutingError::DefaultRouteGuard)
        ));

        let mut with_gateway = record;
        with_gateway.gateway = "100.64.127.1".to_string();
        assert!(check_remove_allowed(&with_gateway).is_ok());
    }

    #[test]
    fn record_carries_gateway_and_metric() {
        let gateway = GatewayInfo {
            ip: "192.168.1.1".to_string(),
            interface_index: 12,
            interface_name: "Ethernet".to_string(),
            metric: 0,
        };
        let record = route_record("10.0.0.0/8", &gateway, RouteKind::Direct);
        assert_eq!(record.destination, "10.0.0.0/8");
        assert_eq!(record.gateway, "192.168.1.1");
        assert_eq!(record.metric, 1);
        assert!(record.id.starts_with("Direct-10.0.0.0/8-"));
    }
}
