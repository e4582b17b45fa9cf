//! Kill-switch firewall effector
//!
//! Installs outbound DNS-block rules (UDP and TCP, remote port 53) on the
//! physical interface so DNS cannot leak around the tunnel. All rules carry
//! the `CustomVPN KillSwitch` group label, which is also the handle for the
//! force-cleanup sweep. The Windows implementation talks to the Windows
//! Firewall COM surface (`INetFwPolicy2`).

use super::KILL_SWITCH_GROUP;

/// Names of the UDP and TCP block rules for an interface alias.
pub fn dns_block_rule_names(interface_alias: &str) -> (String, String) {
    (
        format!("CustomVPN DNS Block ({}) UDP", interface_alias),
        format!("CustomVPN DNS Block ({}) TCP", interface_alias),
    )
}

/// The group label every rule is tagged with.
pub fn kill_switch_group() -> &'static str {
    KILL_SWITCH_GROUP
}

#[cfg(windows)]
pub use windows_impl::WindowsFirewall;

#[cfg(windows)]
mod windows_impl {
    use async_trait::async_trait;
    use windows::core::{BSTR, Interface, VARIANT};
    use windows::Win32::NetworkManagement::WindowsFirewall::{
        INetFwPolicy2, INetFwRule, INetFwRules, NetFwPolicy2, NetFwRule, NET_FW_ACTION_BLOCK,
        NET_FW_RULE_DIR_OUT,
    };
    use windows::Win32::System::Com::{
        CoCreateInstance, CoInitializeEx, CoUninitialize, IDispatch, IEnumVARIANT,
        CLSCTX_INPROC_SERVER, COINIT_MULTITHREADED,
    };
    use windows::Win32::System::Ole::{SafeArrayCreateVector, SafeArrayPutElement};
    use windows::Win32::System::Variant::{VT_ARRAY, VT_VARIANT};

    use super::{dns_block_rule_names, KILL_SWITCH_GROUP};
    use crate::platform::{Firewall, FirewallError};

    const PROTOCOL_TCP: i32 = 6;
    const PROTOCOL_UDP: i32 = 17;

    /// COM-backed implementation of the kill-switch firewall.
    pub struct WindowsFirewall;

    impl WindowsFirewall {
        pub fn new() -> Self {
            Self
        }
    }

    impl Default for WindowsFirewall {
        fn default() -> Self {
            Self::new()
        }
    }

    /// Runs `f` with COM initialized on the current (blocking) thread.
    fn with_firewall_rules<T>(
        f: impl FnOnce(&INetFwRules) -> Result<T, String>,
    ) -> Result<T, String> {
        unsafe {
            let init = CoInitializeEx(None, COINIT_MULTITHREADED);
            let initialized = init.is_ok();
            let result = (|| {
                let policy: INetFwPolicy2 =
                    CoCreateInstance(&NetFwPolicy2, None, CLSCTX_INPROC_SERVER)
                        .map_err(|error| format!("create firewall policy: {}", error))?;
                let rules = policy
                    .Rules()
                    .map_err(|error| format!("read firewall rules: {}", error))?;
                f(&rules)
            })();
            if initialized {
                CoUninitialize();
            }
            result
        }
    }

    /// Wraps a single interface alias in the `VARIANT(SAFEARRAY(VARIANT))`
    /// shape the Interfaces rule property requires.
    unsafe fn interfaces_variant(alias: &str) -> Result<VARIANT, String> {
        let array = SafeArrayCreateVector(VT_VARIANT, 0, 1);
        if array.is_null() {
            return Err("allocate interface list".to_string());
        }
        let element = VARIANT::from(BSTR::from(alias));
        let index: i32 = 0;
        SafeArrayPutElement(
            array,
            &index,
            element.as_raw() as *const _ as *const core::ffi::c_void,
        )
        .map_err(|error| format!("fill interface list: {}", error))?;

        let mut raw: windows::Win32::System::Variant::VARIANT = std::mem::zeroed();
        raw.Anonymous.Anonymous.vt =
            windows::Win32::System::Variant::VARENUM(VT_ARRAY.0 | VT_VARIANT.0);
        raw.Anonymous.Anonymous.Anonymous.parray = array;
        Ok(std::mem::transmute::<
            windows::Win32::System::Variant::VARIANT,
            VARIANT,
        >(raw))
    }

    /// Removes a rule by display name; missing rules are fine.
    fn remove_rule(rules: &INetFwRules, name: &str) {
        unsafe {
            if let Err(error) = rules.Remove(&BSTR::from(name)) {
                log::debug!("firewall rule {:?} not removed: {}", name, error);
            }
        }
    }

    fn add_block_rule(rules: &INetFwRules, name: &str, protocol: i32, alias: &str) -> Result<(), String> {
        unsafe {
            let rule: INetFwRule = CoCreateInstance(&NetFwRule, None, CLSCTX_INPROC_SERVER)
                .map_err(|error| format!("create rule {:?}: {}", name, error))?;
            rule.SetName(&BSTR::from(name))
                .map_err(|error| format!("rule {:?} name: {}", name, error))?;
            rule.SetGrouping(&BSTR::from(KILL_SWITCH_GROUP))
                .map_err(|error| format!("rule {:?} group: {}", name, error))?;
            rule.SetDirection(NET_FW_RULE_DIR_OUT)
                .map_err(|error| format!("rule {:?} direction: {}", name, error))?;
            rule.SetAction(NET_FW_ACTION_BLOCK)
                .map_err(|error| format!("rule {:?} action: {}", name, error))?;
            rule.SetProtocol(protocol)
                .map_err(|error| format!("rule {:?} protocol: {}", name, error))?;
            rule.SetRemotePorts(&BSTR::from("53"))
                .map_err(|error| format!("rule {:?} ports: {}", name, error))?;
            let interfaces = interfaces_variant(alias)?;
            rule.SetInterfaces(&interfaces)
                .map_err(|error| format!("rule {:?} interfaces: {}", name, error))?;
            rule.SetEnabled(windows::Win32::Foundation::VARIANT_TRUE)
                .map_err(|error| format!("rule {:?} enable: {}", name, error))?;
            rules
                .Add(&rule)
                .map_err(|error| format!("add rule {:?}: {}", name, error))
        }
    }

    /// Display names of every rule carrying the kill-switch group label.
    fn rules_in_group(rules: &INetFwRules) -> Result<Vec<String>, String> {
        unsafe {
            let enumerator = rules
                ._NewEnum()
                .map_err(|error| format!("enumerate rules: {}", error))?;
            let enumerator: IEnumVARIANT = enumerator
                .cast()
                .map_err(|error| format!("enumerate rules: {}", error))?;
            let mut names = Vec::new();
            loop {
                let mut slot = [VARIANT::default()];
                let mut fetched = 0u32;
                let hr = enumerator.Next(&mut slot, &mut fetched);
                if hr.is_err() || fetched == 0 {
                    break;
                }
                let dispatch: IDispatch = match IDispatch::try_from(&slot[0]) {
                    Ok(dispatch) => dispatch,
                    Err(_) => continue,
                };
                let rule: INetFwRule = match dispatch.cast() {
                    Ok(rule) => rule,
                    Err(_) => continue,
                };
                let grouping = rule.Grouping().unwrap_or_default().to_string();
                if grouping == KILL_SWITCH_GROUP {
                    names.push(rule.Name().unwrap_or_default().to_string());
                }
            }
            Ok(names)
        }
    }

    #[async_trait]
    impl Firewall for WindowsFirewall {
        async fn block_dns_on_interface(
            &self,
            interface_alias: &str,
        ) -> Result<Vec<String>, FirewallError> {
            let alias = interface_alias.trim().to_string();
            if alias.is_empty() {
                return Err(FirewallError::new("interface alias is empty"));
            }
            tokio::task::spawn_blocking(move || {
                let (udp_rule, tcp_rule) = dns_block_rule_names(&alias);
                with_firewall_rules(|rules| {
                    let mut created: Vec<String> = Vec::new();
                    for (name, protocol) in
                        [(&udp_rule, PROTOCOL_UDP), (&tcp_rule, PROTOCOL_TCP)]
                    {
                        // Same-named leftovers from a crashed session are
                        // removed first so repeated installs stay idempotent.
                        remove_rule(rules, name);
                        if let Err(message) = add_block_rule(rules, name, protocol, &alias) {
                            for rolled_back in &created {
                                remove_rule(rules, rolled_back);
                            }
                            return Err(message);
                        }
                        created.push(name.clone());
                    }
                    Ok(created)
                })
            })
            .await
            .map_err(|error| FirewallError::new(error.to_string()))?
            .map_err(FirewallError::new)
        }

        async fn remove_rules(&self, names: &[String]) -> Result<(), FirewallError> {
            let names: Vec<String> = names
                .iter()
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .collect();
            tokio::task::spawn_blocking(move || {
                with_firewall_rules(|rules| {
                    for name in &names {
                        remove_rule(rules, name);
                    }
                    Ok(())
                })
            })
            .await
            .map_err(|error| FirewallError::new(error.to_string()))?
            .map_err(FirewallError::new)
        }

        async fn remove_kill_switch_group(&self) -> Result<(), FirewallError> {
            tokio::task::spawn_blocking(move || {
                with_firewall_rules(|rules| {
                    for name in rules_in_group(rules)? {
                        remove_rule(rules, &name);
                    }
                    Ok(())
                })
            })
            .await
            .map_err(|error| FirewallError::new(error.to_string()))?
            .map_err(FirewallError::new)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_names_embed_interface_alias() {
        let (udp, tcp) = dns_block_rule_names("Ethernet 2");
        assert_eq!(udp, "CustomVPN DNS Block (Ethernet 2) UDP");
        assert_eq!(tcp, "CustomVPN DNS Block (Ethernet 2) TCP");
    }

    #[test]
    fn group_label_is_stable() {
        assert_eq!(kill_switch_group(), "CustomVPN KillSwitch");
    }
}
