//! Interface DNS effector (Windows: `Set-DnsClientServerAddress`)

#[cfg(windows)]
pub use windows_impl::WindowsDns;

/// Builds the PowerShell script that sets the IPv4 DNS server list of an
/// interface. Kept separate so the quoting rules are testable everywhere.
pub fn set_dns_script(interface_alias: &str, servers: &[String]) -> String {
    use crate::platform::command::escape_single_quotes;

    let server_list = servers
        .iter()
        .map(|server| format!("'{}'", escape_single_quotes(server)))
        .collect::<Vec<_>>()
        .join(",");
    format!(
        "Set-DnsClientServerAddress -InterfaceAlias '{}' -ServerAddresses @({}) -ErrorAction Stop | Out-Null",
        escape_single_quotes(interface_alias),
        server_list,
    )
}

#[cfg(windows)]
mod windows_impl {
    use async_trait::async_trait;

    use super::set_dns_script;
    use crate::platform::command::{run_powershell, COMMAND_TIMEOUT};
    use crate::platform::{Dns, DnsError};

    pub struct WindowsDns;

    #[async_trait]
    impl Dns for WindowsDns {
        async fn set_interface_dns(
            &self,
            interface_alias: &str,
            servers: &[String],
        ) -> Result<(), DnsError> {
            if interface_alias.trim().is_empty() {
                return Err(DnsError::EmptyInterface);
            }
            let servers: Vec<String> = servers
                .iter()
                .map(|server| server.trim().to_string())
                .filter(|server| !server.is_empty())
                .collect();
            if servers.is_empty() {
                return Err(DnsError::EmptyServers);
            }
            let script = set_dns_script(interface_alias.trim(), &servers);
            run_powershell(&script, COMMAND_TIMEOUT)
                .await
                .map_err(DnsError::Command)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_quotes_alias_and_servers() {
        let script = set_dns_script("Tunnel 1", &["100.64.127.2".to_string()]);
        assert_eq!(
            script,
            "Set-DnsClientServerAddress -InterfaceAlias 'Tunnel 1' -ServerAddresses @('100.64.127.2') -ErrorAction Stop | Out-Null"
        );
    }

    #[test]
    fn script_escapes_embedded_quotes() {
        let script = set_dns_script("Bob's adapter", &["1.1.1.1".to_string()]);
        assert!(script.contains("'Bob''s adapter'"));
    }
}
