//! Neighbor Discovery Proxy engine: cross-link ND proxy with learned
//! neighbor state (SPEC_FULL §4.5). RFC 4389 compliance is intentionally
//! partial — only the PROXY bit is ever set, per the spec's Non-goals.

use std::net::Ipv6Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::iface::Registry;
use crate::mux::Shutdown;
use crate::packet::icmpv6::{
    NdOption, NeighborAdvertisement, NeighborSolicitation, ICMPV6_NEIGHBOR_ADVERT,
    ICMPV6_NEIGHBOR_SOLICIT, NA_FLAG_OVERRIDE, NA_FLAG_SOLICITED,
};
use crate::socket_io::PacketSocket;

const NDP_STALE_TIMEOUT: Duration = Duration::from_secs(600);
const MAINTENANCE_TICK: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeighborState {
    Tentative,
    Reachable,
    Stale,
}

#[derive(Debug, Clone)]
struct NeighborEntry {
    address: Ipv6Addr,
    ifindex: u32,
    last_seen: Instant,
    state: NeighborState,
}

pub struct NdpEngine {
    config: Arc<Config>,
    registry: Arc<Registry>,
    packet_socket: Arc<PacketSocket>,
    neighbors: Vec<NeighborEntry>,
}

impl NdpEngine {
    pub fn new(config: Arc<Config>, registry: Arc<Registry>, packet_socket: Arc<PacketSocket>) -> Self {
        NdpEngine {
            config,
            registry,
            packet_socket,
            neighbors: Vec::new(),
        }
    }

    pub async fn run(mut self, shutdown: Arc<Shutdown>) {
        let mut maintenance = tokio::time::interval(MAINTENANCE_TICK);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait() => return,
                _ = maintenance.tick() => self.evict_stale(),
                result = self.packet_socket.recv() => {
                    match result {
                        Ok((frame, ifindex)) => self.handle_frame(&frame, ifindex).await,
                        Err(e) => warn!(error = %e, "packet socket recv failed"),
                    }
                }
            }
        }
    }

    /// Two-phase mark-then-sweep: an entry idle past `NDP_STALE_TIMEOUT` is
    /// marked `Stale` on one tick and evicted on the next, rather than
    /// dropped outright the moment it goes quiet.
    fn evict_stale(&mut self) {
        let now = Instant::now();
        let mut evicted = 0;
        self.neighbors.retain_mut(|n| {
            if n.state == NeighborState::Stale {
                evicted += 1;
                return false;
            }
            if now.duration_since(n.last_seen) >= NDP_STALE_TIMEOUT {
                n.state = NeighborState::Stale;
            }
            true
        });
        if evicted > 0 {
            trace!(evicted, "swept stale neighbor entries");
        }
    }

    async fn handle_frame(&mut self, frame: &[u8], ifindex: u32) {
        let Some((src, icmp_payload)) = parse_ipv6_icmp(frame) else {
            return;
        };
        if icmp_payload.is_empty() {
            return;
        }
        match icmp_payload[0] {
            ICMPV6_NEIGHBOR_SOLICIT => self.handle_solicit(icmp_payload, src, ifindex).await,
            ICMPV6_NEIGHBOR_ADVERT => self.handle_advert(icmp_payload, ifindex),
            _ => {}
        }
    }

    async fn handle_solicit(&mut self, payload: &[u8], src: Ipv6Addr, ingress_ifindex: u32) {
        let ns = match NeighborSolicitation::parse(payload) {
            Ok(ns) => ns,
            Err(e) => {
                debug!(error = %e, "dropping malformed NS");
                return;
            }
        };

        if self.registry.slave_by_index(ingress_ifindex).map(|s| s.external).unwrap_or(false) {
            // External slaves only ever get DAD handled, never proxied
            // toward other links (SPEC_FULL §4.5).
            return;
        }

        if self.known_on(ns.target, ingress_ifindex) {
            return;
        }
        let Some(owner_ifindex) = self.find_owner(ns.target, ingress_ifindex) else {
            return;
        };
        let Some(owner_iface) = self.registry.by_index(owner_ifindex) else {
            return;
        };
        let Some(ingress_iface) = self.registry.by_index(ingress_ifindex) else {
            return;
        };

        let Some(requester_mac) = ns.source_link_layer() else {
            return;
        };

        let na = NeighborAdvertisement {
            flags: NA_FLAG_SOLICITED | NA_FLAG_OVERRIDE,
            target: ns.target,
            options: vec![NdOption::TargetLinkLayer(owner_iface.mac)],
        };
        let bytes = na.to_bytes();
        let frame = build_ipv6_icmp_frame(ingress_iface.mac, requester_mac, src, ns.target, &bytes);
        if let Err(e) = self.packet_socket.send_on(&frame, ingress_ifindex, requester_mac).await {
            warn!(error = %e, "failed to send proxy NA");
        } else {
            debug!(target = %ns.target, via = %owner_iface.name, on = %ingress_iface.name, "sent proxy NA");
        }
    }

    fn handle_advert(&mut self, payload: &[u8], ifindex: u32) {
        let na = match NeighborAdvertisement::parse(payload) {
            Ok(na) => na,
            Err(e) => {
                debug!(error = %e, "dropping malformed NA");
                return;
            }
        };
        let solicited_override = na.flag(NA_FLAG_SOLICITED) && na.flag(NA_FLAG_OVERRIDE);
        self.learn(na.target, ifindex, solicited_override);

        if self.config.route_learning {
            if let Some(iface) = self.registry.by_index(ifindex) {
                info!(
                    neighbor = %na.target,
                    via = %iface.name,
                    "would install /128 host route (route-learning is best-effort, logged only)"
                );
            }
        }
    }

    fn known_on(&self, address: Ipv6Addr, ifindex: u32) -> bool {
        self.neighbors.iter().any(|n| n.address == address && n.ifindex == ifindex)
    }

    fn find_owner(&self, address: Ipv6Addr, exclude_ifindex: u32) -> Option<u32> {
        self.neighbors
            .iter()
            .find(|n| n.address == address && n.ifindex != exclude_ifindex)
            .map(|n| n.ifindex)
    }

    fn learn(&mut self, address: Ipv6Addr, ifindex: u32, solicited_override: bool) {
        let now = Instant::now();
        if let Some(existing) = self
            .neighbors
            .iter_mut()
            .find(|n| n.address == address && n.ifindex == ifindex)
        {
            existing.last_seen = now;
            if solicited_override {
                existing.state = NeighborState::Reachable;
            } else if existing.state == NeighborState::Stale {
                existing.state = NeighborState::Tentative;
            }
            return;
        }
        self.neighbors.push(NeighborEntry {
            address,
            ifindex,
            last_seen: now,
            state: if solicited_override {
                NeighborState::Reachable
            } else {
                NeighborState::Tentative
            },
        });
    }
}

/// Parse the fixed 40-byte IPv6 header off an `AF_PACKET`/`ETH_P_IPV6`
/// cooked frame and return (source address, ICMPv6 payload) if the next
/// header is ICMPv6 (58).
fn parse_ipv6_icmp(frame: &[u8]) -> Option<(Ipv6Addr, &[u8])> {
    if frame.len() < 40 {
        return None;
    }
    let next_header = frame[6];
    if next_header != 58 {
        return None;
    }
    let src = Ipv6Addr::from(<[u8; 16]>::try_from(&frame[8..24]).ok()?);
    Some((src, &frame[40..]))
}

/// Build a minimal IPv6 packet (no extension headers) carrying an ICMPv6
/// payload, destined to `dest` (the NS's source), for a cooked
/// `SOCK_DGRAM` packet-socket send (the kernel fills in the Ethernet
/// header itself from the `sockaddr_ll` passed to `sendto`, but IP is ours
/// to build).
fn build_ipv6_icmp_frame(
    _src_mac: [u8; 6],
    _dest_mac: [u8; 6],
    dest: Ipv6Addr,
    src: Ipv6Addr,
    icmp_payload: &[u8],
) -> Vec<u8> {
    let mut w = crate::packet::writer::Writer::with_capacity(40 + icmp_payload.len());
    let version_and_flow = 6u32 << 28;
    w.u32(version_and_flow);
    w.u16(icmp_payload.len() as u16);
    w.u8(58); // next header: ICMPv6
    w.u8(255); // hop limit
    w.ipv6(&src);
    w.ipv6(&dest);
    w.bytes(icmp_payload);
    w.into_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ipv6_icmp_header() {
        let src: Ipv6Addr = "fe80::1".parse().unwrap();
        let dest: Ipv6Addr = "fe80::2".parse().unwrap();
        let frame = build_ipv6_icmp_frame([0; 6], [0; 6], dest, src, &[135, 0, 0, 0]);
        let (parsed_src, payload) = parse_ipv6_icmp(&frame).unwrap();
        assert_eq!(parsed_src, src);
        assert_eq!(payload, &[135, 0, 0, 0]);
    }

    #[test]
    fn rejects_non_icmpv6_next_header() {
        let mut frame = build_ipv6_icmp_frame([0; 6], [0; 6], "::1".parse().unwrap(), "::2".parse().unwrap(), &[]);
        frame[6] = 17; // UDP
        assert!(parse_ipv6_icmp(&frame).is_none());
    }
}
