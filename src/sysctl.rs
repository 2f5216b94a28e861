//! `/proc/sys/net/ipv6/conf/*` toggles (SPEC_FULL §6).

use tracing::{debug, warn};

fn path(ifname: &str, key: &str) -> String {
    format!("/proc/sys/net/ipv6/conf/{ifname}/{key}")
}

/// Write a sysctl value, logging (not failing) on error — sysctl writes are
/// never on the hot path and a failure here should not stop the daemon
/// (SPEC_FULL §7: transient I/O is logged and swallowed).
pub fn write(ifname: &str, key: &str, value: &str) {
    let p = path(ifname, key);
    match std::fs::write(&p, value) {
        Ok(()) => debug!(path = %p, value, "sysctl write"),
        Err(e) => warn!(path = %p, value, error = %e, "sysctl write failed"),
    }
}

pub fn set_forwarding(ifname: &str, enabled: bool) {
    write(ifname, "forwarding", if enabled { "1" } else { "0" });
}

/// `accept_ra=2` makes the kernel accept RAs even with forwarding enabled
/// (SPEC_FULL §4.3, relay-mode RS forwarding, `force-address-assignment`).
pub fn force_accept_ra(ifname: &str) {
    write(ifname, "accept_ra", "2");
}

pub fn set_proxy_ndp(ifname: &str, enabled: bool) {
    write(ifname, "proxy_ndp", if enabled { "1" } else { "0" });
}
