//! Adapter probing (Windows: `GetAdaptersAddresses`)
//!
//! Finds the IPv4 default gateway among operational adapters and, after the
//! core launches, the tunnel adapter whose on-link prefix contains the probe
//! address.

#[cfg(windows)]
pub use windows_impl::WindowsGatewayProbe;

#[cfg(windows)]
mod windows_impl {
    use std::net::Ipv4Addr;

    use async_trait::async_trait;
    use windows::Win32::Foundation::ERROR_BUFFER_OVERFLOW;
    use windows::Win32::NetworkManagement::IpHelper::{
        GetAdaptersAddresses, GAA_FLAG_INCLUDE_GATEWAYS, IP_ADAPTER_ADDRESSES_LH,
    };
    use windows::Win32::NetworkManagement::Ndis::IfOperStatusUp;
    use windows::Win32::Networking::WinSock::{AF_INET, SOCKADDR, SOCKADDR_IN};

    use crate::platform::{GatewayError, GatewayProbe};
    use crate::state::GatewayInfo;

    /// Adapter-addresses based probe.
    pub struct WindowsGatewayProbe;

    struct AdapterView {
        interface_index: u32,
        interface_name: String,
        metric: u32,
        gateways: Vec<Ipv4Addr>,
        unicast: Vec<(Ipv4Addr, u8)>,
    }

    fn sockaddr_ipv4(sockaddr: *const SOCKADDR) -> Option<Ipv4Addr> {
        if sockaddr.is_null() {
            return None;
        }
        unsafe {
            if (*sockaddr).sa_family != AF_INET {
                return None;
            }
            let sockaddr4 = sockaddr as *const SOCKADDR_IN;
            let raw = (*sockaddr4).sin_addr.S_un.S_addr;
            Some(Ipv4Addr::from(raw.to_ne_bytes()))
        }
    }

    /// Snapshots every operational adapter with its IPv4 gateways and
    /// on-link unicast prefixes.
    fn enumerate_adapters() -> Result<Vec<AdapterView>, GatewayError> {
        let flags = GAA_FLAG_INCLUDE_GATEWAYS;
        let family = AF_INET.0 as u32;
        let mut size: u32 = 0;
        unsafe {
            let sizing = GetAdaptersAddresses(family, flags, None, None, &mut size);
            if sizing != ERROR_BUFFER_OVERFLOW.0 {
                return Err(GatewayError::Os(format!(
                    "GetAdaptersAddresses sizing failed: {}",
                    sizing
                )));
            }
            let mut buffer = vec![0u8; size as usize];
            let addresses = buffer.as_mut_ptr() as *mut IP_ADAPTER_ADDRESSES_LH;
            let status = GetAdaptersAddresses(family, flags, None, Some(addresses), &mut size);
            if status != 0 {
                return Err(GatewayError::Os(format!(
                    "GetAdaptersAddresses failed: {}",
                    status
                )));
            }

            let mut views = Vec::new();
            let mut adapter = addresses;
            while !adapter.is_null() {
                let entry = &*adapter;
                if entry.OperStatus != IfOperStatusUp {
                    adapter = entry.Next;
                    continue;
                }
                let mut view = AdapterView {
                    interface_index: entry.Anonymous1.Anonymous.IfIndex,
                    interface_name: entry.FriendlyName.to_string().unwrap_or_default(),
                    metric: entry.Ipv4Metric,
                    gateways: Vec::new(),
                    unicast: Vec::new(),
                };
                let mut gateway = entry.FirstGatewayAddress;
                while !gateway.is_null() {
                    if let Some(ip) = sockaddr_ipv4((*gateway).Address.lpSockaddr as *const SOCKADDR)
                    {
                        view.gateways.push(ip);
                    }
                    gateway = (*gateway).Next;
                }
                let mut unicast = entry.FirstUnicastAddress;
                while !unicast.is_null() {
                    if let Some(ip) = sockaddr_ipv4((*unicast).Address.lpSockaddr as *const SOCKADDR)
                    {
                        view.unicast.push((ip, (*unicast).OnLinkPrefixLength));
                    }
                    unicast = (*unicast).Next;
                }
                views.push(view);
                adapter = entry.Next;
            }
            Ok(views)
        }
    }

    fn prefix_contains(addr: Ipv4Addr, prefix: u8, target: Ipv4Addr) -> bool {
        if prefix == 0 || prefix > 32 {
            return false;
        }
        let mask = u32::MAX << (32 - u32::from(prefix));
        (u32::from(addr) & mask) == (u32::from(target) & mask)
    }

    #[async_trait]
    impl GatewayProbe for WindowsGatewayProbe {
        async fn detect_default_gateway(&self) -> Result<GatewayInfo, GatewayError> {
            let views = tokio::task::spawn_blocking(enumerate_adapters)
                .await
                .map_err(|error| GatewayError::Os(error.to_string()))??;

            let mut found: Option<GatewayInfo> = None;
            for view in &views {
                for gateway_ip in &view.gateways {
                    if *gateway_ip == Ipv4Addr::UNSPECIFIED {
                        continue;
                    }
                    let info = GatewayInfo {
                        ip: gateway_ip.to_string(),
                        interface_index: view.interface_index,
                        interface_name: view.interface_name.clone(),
                        metric: view.metric.max(1),
                    };
                    match &found {
                        None => found = Some(info),
                        Some(existing)
                            if existing.ip != info.ip
                                || existing.interface_index != info.interface_index =>
                        {
                            return Err(GatewayError::MultipleDefaultGateways)
                        }
                        Some(_) => {}
                    }
                }
            }
            found.ok_or(GatewayError::NotFound)
        }

        async fn detect_gateway_for_ip(&self, ip: Ipv4Addr) -> Result<GatewayInfo, GatewayError> {
            let views = tokio::task::spawn_blocking(enumerate_adapters)
                .await
                .map_err(|error| GatewayError::Os(error.to_string()))??;

            let mut found: Option<GatewayInfo> = None;
            for view in &views {
                for (addr, prefix) in &view.unicast {
                    if !prefix_contains(*addr, *prefix, ip) {
                        continue;
                    }
                    let info = GatewayInfo {
                        ip: ip.to_string(),
                        interface_index: view.interface_index,
                        interface_name: view.interface_name.clone(),
                        metric: view.metric.max(1),
                    };
                    match &found {
                        None => found = Some(info),
                        Some(existing) if existing.interface_index != info.interface_index => {
                            return Err(GatewayError::MultipleInterfacesForIp)
                        }
                        Some(_) => {}
                    }
                }
            }
            found.ok_or(GatewayError::NoInterfaceForIp(ip))
        }
    }
}
