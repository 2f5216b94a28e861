//! Router Discovery engine: RA/RS relay between master and slaves, or local
//! RA synthesis when no upstream prefix delegation is available
//! (SPEC_FULL §4.3).

use std::collections::HashMap;
use std::net::Ipv6Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, info, trace, warn};

use crate::addr;
use crate::config::Config;
use crate::forwarder;
use crate::iface::Registry;
use crate::mux::{RaRefresh, Shutdown};
use crate::packet::icmpv6::{
    Dnssl, NdOption, PrefixInformation, Rdnss, RouterAdvertisement, RouterSolicitation,
    FLAG_MANAGED, FLAG_OTHER, FLAG_PROXY,
};
use crate::socket_io::{IcmpSocket, ALL_NODES, ALL_ROUTERS};
use crate::sysctl;

const MIN_RTR_ADV_INTERVAL: Duration = Duration::from_secs(200);
const MAX_RTR_ADV_INTERVAL: Duration = Duration::from_secs(600);
const MAX_PREFIXES: usize = 16;

pub struct RdEngine {
    config: Arc<Config>,
    registry: Arc<Registry>,
    icmp: Arc<IcmpSocket>,
    /// Next RA deadline per slave (server mode only; empty in relay mode).
    next_deadline: HashMap<u32, Instant>,
}

impl RdEngine {
    pub fn new(config: Arc<Config>, registry: Arc<Registry>, icmp: Arc<IcmpSocket>) -> std::io::Result<Self> {
        if config.rd_relay {
            icmp.join_multicast(ALL_ROUTERS, registry.master.index)?;
            icmp.join_multicast(ALL_NODES, registry.master.index)?;
        }
        if config.rd_server {
            for slave in &registry.slaves {
                icmp.join_multicast(ALL_ROUTERS, slave.index)?;
            }
        }

        let mut next_deadline = HashMap::new();
        if config.rd_server {
            let now = Instant::now();
            for slave in &registry.slaves {
                next_deadline.insert(slave.index, now);
            }
        }

        Ok(RdEngine {
            config,
            registry,
            icmp,
            next_deadline,
        })
    }

    /// The earliest pending RA deadline across every slave, or far in the
    /// future if nothing is scheduled (relay mode has no timers at all).
    fn earliest_deadline(&self) -> Instant {
        self.next_deadline
            .values()
            .copied()
            .min()
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600))
    }

    pub async fn run(mut self, shutdown: Arc<Shutdown>, ra_refresh: Arc<RaRefresh>) {
        loop {
            let deadline = self.earliest_deadline();
            tokio::select! {
                biased;
                _ = shutdown.wait() => {
                    self.send_shutdown_ras().await;
                    return;
                }
                _ = ra_refresh.wait() => {
                    if self.config.rd_server {
                        let now = Instant::now();
                        for slave in &self.registry.slaves {
                            self.next_deadline.insert(slave.index, now);
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline.into()) => {
                    if self.config.rd_server {
                        self.fire_due_timers().await;
                    }
                }
                result = self.icmp.recv() => {
                    match result {
                        Ok((payload, _peer, ifindex)) => self.handle_datagram(&payload, ifindex).await,
                        Err(e) => warn!(error = %e, "icmpv6 recv failed"),
                    }
                }
            }
        }
    }

    async fn fire_due_timers(&mut self) {
        let now = Instant::now();
        let due: Vec<u32> = self
            .next_deadline
            .iter()
            .filter(|(_, t)| **t <= now)
            .map(|(idx, _)| *idx)
            .collect();
        for ifindex in due {
            self.synthesize_ra(ifindex).await;
            self.rearm_timer(ifindex);
        }
    }

    fn rearm_timer(&mut self, ifindex: u32) {
        let jitter = rand::rng().random_range(MIN_RTR_ADV_INTERVAL..MAX_RTR_ADV_INTERVAL);
        self.next_deadline.insert(ifindex, Instant::now() + jitter);
    }

    async fn handle_datagram(&mut self, payload: &[u8], ifindex: u32) {
        if payload.is_empty() {
            return;
        }
        match payload[0] {
            crate::packet::icmpv6::ICMPV6_ROUTER_ADVERT => {
                if self.config.rd_relay && ifindex == self.registry.master.index {
                    self.relay_ra(payload).await;
                }
            }
            crate::packet::icmpv6::ICMPV6_ROUTER_SOLICIT => {
                if self.config.rd_relay && self.registry.slave_by_index(ifindex).is_some() {
                    self.relay_rs().await;
                } else if self.config.rd_server {
                    if let Some(_slave) = self.registry.slave_by_index(ifindex) {
                        self.next_deadline.insert(ifindex, Instant::now());
                    }
                }
            }
            _ => {}
        }
    }

    /// Relay-mode RA rewriting (SPEC_FULL §4.3).
    async fn relay_ra(&self, payload: &[u8]) {
        let ra = match RouterAdvertisement::parse(payload) {
            Ok(ra) => ra,
            Err(e) => {
                debug!(error = %e, "dropping malformed RA");
                return;
            }
        };

        for slave in &self.registry.slaves {
            let mut out = ra.clone();
            out.set_source_link_layer(slave.mac);
            out.set_flag(FLAG_PROXY, true);
            if self.config.dhcpv6_server {
                out.set_flag(FLAG_OTHER, true);
            }

            if self.config.always_rewrite_dns {
                self.rewrite_rdnss(&mut out, slave.index, &slave.name);
            }

            let bytes = out.to_bytes();
            self.send_ra(&bytes, slave.index, ALL_NODES).await;
        }
    }

    fn rewrite_rdnss(&self, ra: &mut RouterAdvertisement, _slave_index: u32, slave_name: &str) {
        let replacement: Option<Ipv6Addr> = self
            .config
            .dns_servers
            .first()
            .copied()
            .or_else(|| addr::first_global_address(slave_name));
        let Some(addr) = replacement else {
            debug!(iface = slave_name, "no address available for DNS rewrite, skipping");
            return;
        };
        for opt in ra.options.iter_mut() {
            if let NdOption::Rdnss(r) = opt {
                for a in r.addrs.iter_mut() {
                    *a = addr;
                }
            }
        }
    }

    /// Relay-mode RS forwarding (SPEC_FULL §4.3).
    async fn relay_rs(&self) {
        if self.config.force_address_assignment {
            for slave in &self.registry.slaves {
                sysctl::force_accept_ra(&slave.name);
            }
        }
        let bytes = RouterSolicitation::bare();
        self.send_ra(&bytes, self.registry.master.index, ALL_ROUTERS).await;
    }

    /// Server-mode RA synthesis for one slave (SPEC_FULL §4.3 step 1-4).
    async fn synthesize_ra(&self, ifindex: u32) {
        let Some(slave) = self.registry.slave_by_index(ifindex) else {
            return;
        };

        let has_default_route = addr::has_default_route();
        let learned = addr::global_addresses(&slave.name, MAX_PREFIXES);
        let any_public_preferred = learned
            .iter()
            .any(|a| !a.is_ula() && a.preferred > Duration::ZERO);

        let router_lifetime: u16 = if has_default_route && any_public_preferred {
            (3 * MAX_RTR_ADV_INTERVAL.as_secs()).min(u16::MAX as u64) as u16
        } else if self.config.always_announce_default_router {
            MAX_RTR_ADV_INTERVAL.as_secs() as u16
        } else {
            0
        };

        let mut options = vec![NdOption::SourceLinkLayer(slave.mac), NdOption::Mtu(slave.mtu)];

        let has_public = learned.iter().any(|a| !a.is_ula());
        let mut merged: Vec<&addr::LearnedAddress> = Vec::new();
        'outer: for a in &learned {
            for m in &merged {
                if m.address.segments()[..4] == a.address.segments()[..4] {
                    continue 'outer;
                }
            }
            merged.push(a);
        }

        let mut best_dns_source: Option<(Ipv6Addr, Duration)> = None;
        for a in &merged {
            let mut preferred = a.preferred.min(addr::MAX_VALID_TIME);
            let valid = a.valid.min(addr::MAX_VALID_TIME);
            if a.is_ula() && has_public && self.config.deprecate_ula_if_public_avail {
                preferred = Duration::ZERO;
            }
            if best_dns_source.map(|(_, p)| preferred > p).unwrap_or(true) {
                best_dns_source = Some((a.address, preferred));
            }
            options.push(NdOption::Prefix(PrefixInformation {
                prefix_len: 64,
                on_link: true,
                autonomous: true,
                valid_lifetime: valid.as_secs() as u32,
                preferred_lifetime: preferred.as_secs() as u32,
                prefix: a.address,
            }));
        }

        let dns_addr = self.config.dns_servers.first().copied().or(best_dns_source.map(|(a, _)| a));
        if let Some(dns_addr) = dns_addr {
            let lifetime = best_dns_source.map(|(_, p)| p.as_secs() as u32).unwrap_or(0);
            options.push(NdOption::Rdnss(Rdnss {
                lifetime,
                addrs: vec![dns_addr],
            }));
        }

        if let Some(domain) = addr::resolver_search_domain() {
            options.push(NdOption::Dnssl(Dnssl {
                lifetime: router_lifetime as u32,
                encoded: crate::packet::icmpv6::encode_search_domain(&domain),
            }));
        }

        let ra = RouterAdvertisement {
            cur_hop_limit: 64,
            flags: FLAG_OTHER,
            router_lifetime,
            reachable_time: 0,
            retrans_timer: 0,
            options,
        };
        let bytes = ra.to_bytes();
        self.send_ra(&bytes, slave.index, ALL_NODES).await;
    }

    async fn send_shutdown_ras(&self) {
        if !self.config.rd_server {
            return;
        }
        info!("sending shutdown RAs (router_lifetime = 0) to every slave");
        for slave in &self.registry.slaves {
            let ra = RouterAdvertisement {
                cur_hop_limit: 64,
                flags: 0,
                router_lifetime: 0,
                reachable_time: 0,
                retrans_timer: 0,
                options: vec![NdOption::SourceLinkLayer(slave.mac)],
            };
            let bytes = ra.to_bytes();
            self.send_ra(&bytes, slave.index, ALL_NODES).await;
        }
    }

    async fn send_ra(&self, bytes: &[u8], out_ifindex: u32, dest: Ipv6Addr) {
        let fd = self.icmp.as_raw_fd();
        if let Err(e) = forwarder::send_on(fd, dest, 0, out_ifindex, bytes) {
            trace!(error = %e, out_ifindex, "RA/RS send failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deprecates_ula_when_public_available() {
        // Logic is exercised in full via synthesize_ra's integration with
        // real /proc state, which unit tests can't control — covered here
        // only at the predicate level the merge loop relies on.
        let ula: Ipv6Addr = "fd00::1".parse().unwrap();
        let public: Ipv6Addr = "2001:db8::1".parse().unwrap();
        assert!((ula.segments()[0] & 0xfe00) == 0xfc00);
        assert!((public.segments()[0] & 0xfe00) != 0xfc00);
    }
}
