//! Address and route discovery from the kernel's `/proc` text interfaces
//! (SPEC_FULL §6: "Kernel interfaces"). No netlink dependency — this mirrors
//! the rest of the daemon's posture of reading small, stable `/proc` text
//! formats rather than holding an async netlink connection open.

use std::net::Ipv6Addr;
use std::time::Duration;

use tracing::{trace, warn};

/// `IFA_F_*` flags as they appear in `/proc/net/if_inet6`'s flags column.
const IFA_F_DEPRECATED: u32 = 0x20;
const IFA_F_TENTATIVE: u32 = 0x40;
const IFA_F_DADFAILED: u32 = 0x08;

pub const MAX_VALID_TIME: Duration = Duration::from_secs(2 * 365 * 24 * 3600);

#[derive(Debug, Clone, Copy)]
pub struct LearnedAddress {
    pub address: Ipv6Addr,
    pub prefix_len: u8,
    /// `/proc/net/if_inet6` carries no lifetime information — the kernel's
    /// SLAAC lifetimes live in netlink only. We report the maximum and let
    /// the RA synthesis step clamp it (SPEC_FULL §4.3 step 3).
    pub preferred: Duration,
    pub valid: Duration,
}

impl LearnedAddress {
    pub fn is_ula(&self) -> bool {
        (self.address.segments()[0] & 0xfe00) == 0xfc00
    }

    pub fn is_global(&self) -> bool {
        !self.address.is_loopback()
            && !self.address.is_unspecified()
            && (self.address.segments()[0] & 0xffc0) != 0xfe80 // not link-local
    }
}

/// Enumerate up to `limit` usable global addresses (public or ULA) on the
/// named interface, from `/proc/net/if_inet6`.
pub fn global_addresses(ifname: &str, limit: usize) -> Vec<LearnedAddress> {
    let content = match std::fs::read_to_string("/proc/net/if_inet6") {
        Ok(c) => c,
        Err(e) => {
            warn!("failed to read /proc/net/if_inet6: {}", e);
            return Vec::new();
        }
    };

    let mut out = Vec::new();
    for line in content.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 6 {
            continue;
        }
        let [addr_hex, _idx_hex, plen_hex, scope_hex, flags_hex, name] = [
            fields[0], fields[1], fields[2], fields[3], fields[4], fields[5],
        ];
        if name != ifname {
            continue;
        }
        let Some(address) = parse_if_inet6_addr(addr_hex) else {
            continue;
        };
        let prefix_len = u8::from_str_radix(plen_hex, 16).unwrap_or(64);
        let scope = u32::from_str_radix(scope_hex, 16).unwrap_or(0);
        let flags = u32::from_str_radix(flags_hex, 16).unwrap_or(0);

        // scope 0x00 == global (includes ULA, which the kernel still scopes
        // as global for addrconf purposes).
        if scope != 0x00 {
            continue;
        }
        if flags & (IFA_F_DEPRECATED | IFA_F_TENTATIVE | IFA_F_DADFAILED) != 0 {
            continue;
        }

        out.push(LearnedAddress {
            address,
            prefix_len,
            preferred: MAX_VALID_TIME,
            valid: MAX_VALID_TIME,
        });
        if out.len() >= limit {
            break;
        }
    }
    trace!(iface = ifname, count = out.len(), "enumerated global addresses");
    out
}

/// Convenience: first global (non-ULA) address, falling back to any global
/// address including ULA. Used wherever SPEC_FULL calls for "a global
/// address of the interface" without further qualification.
pub fn first_global_address(ifname: &str) -> Option<Ipv6Addr> {
    let addrs = global_addresses(ifname, 16);
    addrs
        .iter()
        .find(|a| !a.is_ula())
        .or_else(|| addrs.first())
        .map(|a| a.address)
}

fn parse_if_inet6_addr(hex: &str) -> Option<Ipv6Addr> {
    if hex.len() != 32 {
        return None;
    }
    let mut segments = [0u16; 8];
    for (i, seg) in segments.iter_mut().enumerate() {
        *seg = u16::from_str_radix(&hex[i * 4..i * 4 + 4], 16).ok()?;
    }
    Some(Ipv6Addr::new(
        segments[0],
        segments[1],
        segments[2],
        segments[3],
        segments[4],
        segments[5],
        segments[6],
        segments[7],
    ))
}

/// Scan `/proc/net/ipv6_route` for a `::/0` entry not on `lo`
/// (SPEC_FULL §4.3 step 2).
pub fn has_default_route() -> bool {
    let content = match std::fs::read_to_string("/proc/net/ipv6_route") {
        Ok(c) => c,
        Err(e) => {
            warn!("failed to read /proc/net/ipv6_route: {}", e);
            return false;
        }
    };
    for line in content.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 {
            continue;
        }
        let dest_hex = fields[0];
        let dest_plen = fields[1];
        let devname = fields[9];
        if devname == "lo" {
            continue;
        }
        if dest_plen == "00" && dest_hex.chars().all(|c| c == '0') {
            return true;
        }
    }
    false
}

/// First `search`/`domain` entry from `/etc/resolv.conf`, used for the DNSSL
/// option (SPEC_FULL §4.3 step 4).
pub fn resolver_search_domain() -> Option<String> {
    let content = std::fs::read_to_string("/etc/resolv.conf").ok()?;
    search_domain_from_resolv_conf(&content)
}

fn search_domain_from_resolv_conf(content: &str) -> Option<String> {
    for line in content.lines() {
        let line = line.trim();
        let Some(rest) = line.strip_prefix("search ").or_else(|| line.strip_prefix("domain ")) else {
            continue;
        };
        if let Some(first) = rest.split_whitespace().next() {
            return Some(first.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_if_inet6_address() {
        let addr =
            parse_if_inet6_addr("fe800000000000000000000000000001").unwrap();
        assert_eq!(addr, "fe80::1".parse::<Ipv6Addr>().unwrap());
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(parse_if_inet6_addr("fe8000").is_none());
    }

    #[test]
    fn ula_detection() {
        let a = LearnedAddress {
            address: "fd00::1".parse().unwrap(),
            prefix_len: 64,
            preferred: MAX_VALID_TIME,
            valid: MAX_VALID_TIME,
        };
        assert!(a.is_ula());
        let b = LearnedAddress {
            address: "2001:db8::1".parse().unwrap(),
            prefix_len: 64,
            preferred: MAX_VALID_TIME,
            valid: MAX_VALID_TIME,
        };
        assert!(!b.is_ula());
    }

    #[test]
    fn search_domain_skips_nameserver_lines() {
        let content = "\
nameserver 2001:db8::53
nameserver fe80::1%eth0
search example.com local
";
        assert_eq!(
            search_domain_from_resolv_conf(content),
            Some("example.com".to_string())
        );
    }

    #[test]
    fn search_domain_none_without_search_or_domain() {
        let content = "nameserver 2001:db8::53\n";
        assert_eq!(search_domain_from_resolv_conf(content), None);
    }
}
