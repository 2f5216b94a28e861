//! Configuration snapshot and command-line parsing.
//!
//! Unlike the rest of the `hr-*` family this daemon has no config file: the
//! command line *is* the configuration source (SPEC_FULL §6). `Config` is
//! still `Serialize`/`Deserialize` so it can be dumped at `-vv` for
//! debugging, matching the `Ipv6Config`/`DhcpConfig` convention.

use std::net::Ipv6Addr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::RelayError;

/// A downstream interface name, optionally tilde-prefixed to mark it
/// "external" (host-ND is not proxied for external slaves).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaveSpec {
    pub name: String,
    pub external: bool,
}

/// Read-only configuration snapshot, built once at startup and shared via
/// `Arc` with every engine. Never mutated after `Config::from_args` returns
/// (SPEC_FULL §9, "Singleton configuration").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub master: String,
    pub slaves: Vec<SlaveSpec>,

    pub rd_relay: bool,
    pub rd_server: bool,
    pub dhcpv6_relay: bool,
    pub dhcpv6_server: bool,
    pub dhcpv6_broken: bool,
    pub ndp_relay: bool,
    pub route_learning: bool,
    pub force_address_assignment: bool,
    pub always_rewrite_dns: bool,
    pub send_initial_rs: bool,
    pub forwarding: bool,

    /// RFC 8106 RDNSS addresses configured explicitly; takes priority over
    /// addresses discovered on the slave (SPEC_FULL §4.3).
    pub dns_servers: Vec<Ipv6Addr>,

    pub always_announce_default_router: bool,
    pub deprecate_ula_if_public_avail: bool,

    pub pidfile: Option<PathBuf>,
    pub daemonize: bool,
    pub verbosity: u8,
}

impl Config {
    /// Parse `argv[1..]` into a `Config`. Mirrors the `daemon [options]
    /// <master> [[~]<slave> …]` surface in SPEC_FULL §6.
    pub fn from_args<I: IntoIterator<Item = String>>(args: I) -> Result<Self, RelayError> {
        let mut rd_relay = false;
        let mut rd_server = false;
        let mut dhcpv6_relay = false;
        let mut dhcpv6_server = false;
        let mut dhcpv6_broken = false;
        let mut ndp_relay = false;
        let mut route_learning = false;
        let mut force_address_assignment = false;
        let mut always_rewrite_dns = false;
        let mut send_initial_rs = false;
        let mut forwarding = false;
        let mut pidfile = None;
        let mut daemonize = false;
        let mut verbosity = 0u8;
        let mut positional = Vec::new();

        let mut it = args.into_iter().peekable();
        while let Some(arg) = it.next() {
            match arg.as_str() {
                "-A" => {
                    rd_relay = true;
                    dhcpv6_relay = true;
                    ndp_relay = true;
                    forwarding = true;
                    send_initial_rs = true;
                    route_learning = true;
                    force_address_assignment = true;
                }
                "-S" => {
                    rd_server = true;
                    dhcpv6_server = true;
                }
                "-R" => match it.next().as_deref() {
                    Some("relay") => rd_relay = true,
                    Some("server") => rd_server = true,
                    other => {
                        return Err(RelayError::Usage(format!(
                            "-R expects 'relay' or 'server', got {:?}",
                            other
                        )))
                    }
                },
                "-D" => match it.next().as_deref() {
                    Some("relay") => dhcpv6_relay = true,
                    Some("server") => dhcpv6_server = true,
                    Some("transparent") => {
                        dhcpv6_relay = true;
                        dhcpv6_broken = true;
                    }
                    other => {
                        return Err(RelayError::Usage(format!(
                            "-D expects 'relay', 'server' or 'transparent', got {:?}",
                            other
                        )))
                    }
                },
                "-N" => ndp_relay = true,
                "-F" => forwarding = true,
                "-s" => send_initial_rs = true,
                "-l" => route_learning = true,
                "-n" => always_rewrite_dns = true,
                "-r" => force_address_assignment = true,
                "-p" => {
                    let path = it
                        .next()
                        .ok_or_else(|| RelayError::Usage("-p requires a path".into()))?;
                    pidfile = Some(PathBuf::from(path));
                }
                "-d" => daemonize = true,
                "-v" => verbosity = verbosity.saturating_add(1),
                "-h" => return Err(RelayError::Usage("usage requested".into())),
                _ if arg.starts_with('-') && arg.len() > 1 => {
                    return Err(RelayError::Usage(format!("unknown option {}", arg)))
                }
                _ => positional.push(arg),
            }
        }

        if positional.is_empty() {
            return Err(RelayError::Usage("missing <master> interface".into()));
        }
        let master = positional.remove(0);
        let slaves = positional
            .into_iter()
            .map(|name| {
                if let Some(stripped) = name.strip_prefix('~') {
                    SlaveSpec {
                        name: stripped.to_string(),
                        external: true,
                    }
                } else {
                    SlaveSpec {
                        name,
                        external: false,
                    }
                }
            })
            .collect();

        if !(rd_relay || rd_server || dhcpv6_relay || dhcpv6_server || ndp_relay) {
            return Err(RelayError::NothingEnabled);
        }

        Ok(Config {
            master,
            slaves,
            rd_relay,
            rd_server,
            dhcpv6_relay,
            dhcpv6_server,
            dhcpv6_broken,
            ndp_relay,
            route_learning,
            force_address_assignment,
            always_rewrite_dns,
            send_initial_rs,
            forwarding,
            dns_servers: Vec::new(),
            always_announce_default_router: false,
            deprecate_ula_if_public_avail: true,
            pidfile,
            daemonize,
            verbosity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(s: &[&str]) -> Vec<String> {
        s.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_master_and_slaves() {
        let cfg = Config::from_args(args(&["-A", "eth0", "eth1", "~eth2"])).unwrap();
        assert_eq!(cfg.master, "eth0");
        assert_eq!(cfg.slaves.len(), 2);
        assert!(!cfg.slaves[0].external);
        assert_eq!(cfg.slaves[1].name, "eth2");
        assert!(cfg.slaves[1].external);
    }

    #[test]
    fn all_bundle_enables_expected_flags() {
        let cfg = Config::from_args(args(&["-A", "eth0", "eth1"])).unwrap();
        assert!(cfg.rd_relay);
        assert!(cfg.dhcpv6_relay);
        assert!(cfg.ndp_relay);
        assert!(cfg.forwarding);
        assert!(cfg.send_initial_rs);
        assert!(cfg.route_learning);
        assert!(cfg.force_address_assignment);
        assert!(!cfg.rd_server);
    }

    #[test]
    fn transparent_dhcp_sets_broken_and_relay() {
        let cfg = Config::from_args(args(&["-D", "transparent", "-R", "relay", "eth0", "eth1"]))
            .unwrap();
        assert!(cfg.dhcpv6_relay);
        assert!(cfg.dhcpv6_broken);
    }

    #[test]
    fn no_function_enabled_is_rejected() {
        let err = Config::from_args(args(&["eth0", "eth1"])).unwrap_err();
        assert!(matches!(err, RelayError::NothingEnabled));
    }

    #[test]
    fn missing_master_is_usage_error() {
        let err = Config::from_args(args(&["-A"])).unwrap_err();
        assert!(matches!(err, RelayError::Usage(_)));
    }
}
