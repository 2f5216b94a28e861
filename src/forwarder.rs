//! The single send primitive every engine uses to put a datagram out a
//! specific interface (SPEC_FULL §4.2). Grounded in the same `nix::sendmsg`
//! + `ControlMessage::Ipv6PacketInfo` mechanism `microsoft-openvmm` pulls
//! `nix` in for — `socket2` has no ancillary-data API, so pinning egress
//! interface for a wildcard-bound socket needs this escape hatch.

use std::net::Ipv6Addr;
use std::os::fd::RawFd;

use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags, SockaddrIn6};
use tracing::warn;

/// Send `payload` to `dest` (port 0 meaning "raw ICMPv6, no port"), pinning
/// the egress interface to `out_ifindex`. Link-local and link-local
/// multicast destinations get their scope id set to `out_ifindex` — the
/// kernel requires a scope id to route a link-local send correctly when the
/// socket isn't bound to one interface.
///
/// For raw-socket destinations (`dest.port() == 0`) the PKTINFO control
/// message is omitted: some kernels silently ignore it on `SOCK_RAW`
/// sockets and it's simpler to rely on `IPV6_MULTICAST_IF`/explicit scope
/// id there instead (SPEC_FULL §4.2).
pub fn send_on(fd: RawFd, dest: Ipv6Addr, port: u16, out_ifindex: u32, payload: &[u8]) -> std::io::Result<usize> {
    let needs_scope = is_link_local(dest) || is_link_local_multicast(dest);
    let scope_id = if needs_scope { out_ifindex } else { 0 };
    let addr = SockaddrIn6::from(std::net::SocketAddrV6::new(dest, port, 0, scope_id));

    let iov = [std::io::IoSlice::new(payload)];

    let result = if port == 0 {
        sendmsg(fd, &iov, &[], MsgFlags::empty(), Some(&addr))
    } else {
        let pktinfo = libc::in6_pktinfo {
            ipi6_addr: libc::in6_addr { s6_addr: [0; 16] },
            ipi6_ifindex: out_ifindex as _,
        };
        let cmsgs = [ControlMessage::Ipv6PacketInfo(&pktinfo)];
        sendmsg(fd, &iov, &cmsgs, MsgFlags::empty(), Some(&addr))
    };

    match result {
        Ok(n) => Ok(n),
        Err(e) => {
            warn!(%dest, out_ifindex, error = %e, "send failed");
            Err(std::io::Error::from_raw_os_error(e as i32))
        }
    }
}

fn is_link_local(addr: Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xffc0) == 0xfe80
}

fn is_link_local_multicast(addr: Ipv6Addr) -> bool {
    addr.is_multicast() && (addr.segments()[0] & 0x000f) == 0x0002
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_link_local() {
        assert!(is_link_local("fe80::1".parse().unwrap()));
        assert!(!is_link_local("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn classifies_link_local_multicast() {
        assert!(is_link_local_multicast("ff02::1".parse().unwrap()));
        assert!(is_link_local_multicast("ff02::2".parse().unwrap()));
        assert!(!is_link_local_multicast("ff05::1:3".parse().unwrap()));
    }
}
