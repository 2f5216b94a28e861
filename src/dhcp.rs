//! DHCPv6 engine: standards-compliant relay, "broken-server" compatibility
//! relay, and a stateless mini-server (SPEC_FULL §4.4).

use std::net::{Ipv6Addr, SocketAddrV6};
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::addr;
use crate::config::Config;
use crate::iface::{Interface, Registry};
use crate::mux::Shutdown;
use crate::packet::dhcpv6::{
    self, BrokenDuidTag, ClientMessage, RelayMessage, ADVERTISE, HOP_COUNT_LIMIT,
    INFORMATION_REQUEST, OPT_AUTH, OPT_CLIENTID, OPT_DNS_SERVERS, OPT_IA_NA, OPT_RELAY_MSG,
    OPT_SERVERID, REBIND, RELAY_FORW, RELAY_REPL, REPLY, REQUEST, SOLICIT,
};
use crate::packet::writer::Writer;
use crate::socket_io::{
    DhcpSocket, ALL_DHCP_RELAY_AGENTS_AND_SERVERS, ALL_DHCP_SERVERS, DHCPV6_CLIENT_PORT,
    DHCPV6_SERVER_PORT,
};

pub struct DhcpEngine {
    config: Arc<Config>,
    registry: Arc<Registry>,
    relay_socket: Arc<DhcpSocket>,
    broken_socket: Option<Arc<DhcpSocket>>,
}

impl DhcpEngine {
    pub fn new(config: Arc<Config>, registry: Arc<Registry>) -> std::io::Result<Self> {
        let relay_socket = Arc::new(DhcpSocket::bind(DHCPV6_SERVER_PORT, None)?);
        for slave in &registry.slaves {
            relay_socket.join_multicast(ALL_DHCP_RELAY_AGENTS_AND_SERVERS, slave.index)?;
        }

        let broken_socket = if config.dhcpv6_broken {
            let sock = DhcpSocket::bind(DHCPV6_CLIENT_PORT, Some(&registry.master.name))?;
            Some(Arc::new(sock))
        } else {
            None
        };

        Ok(DhcpEngine {
            config,
            registry,
            relay_socket,
            broken_socket,
        })
    }

    pub async fn run(self, shutdown: Arc<Shutdown>) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait() => return,
                result = self.relay_socket.recv() => {
                    match result {
                        Ok((payload, peer, ifindex)) => self.handle(&payload, peer, ifindex).await,
                        Err(e) => warn!(error = %e, "dhcpv6 relay socket recv failed"),
                    }
                }
                result = recv_broken(&self.broken_socket) => {
                    match result {
                        Ok((payload, peer, _ifindex)) => self.handle_broken_reply(&payload, peer).await,
                        Err(e) => warn!(error = %e, "dhcpv6 broken-mode socket recv failed"),
                    }
                }
            }
        }
    }

    async fn handle(&self, payload: &[u8], peer: SocketAddrV6, ifindex: u32) {
        if ifindex == self.registry.master.index {
            if self.config.dhcpv6_relay {
                self.relay_server_response(payload).await;
            }
            return;
        }
        let Some(slave) = self.registry.slave_by_index(ifindex) else {
            return;
        };
        if self.config.dhcpv6_server {
            self.handle_client_request(payload, peer, slave).await;
        } else if self.config.dhcpv6_broken {
            self.relay_client_request_broken(payload, peer, slave).await;
        } else if self.config.dhcpv6_relay {
            self.relay_client_request(payload, peer, slave).await;
        }
    }

    /// SPEC_FULL §4.4 "Standard-mode client-to-server relay".
    async fn relay_client_request(&self, payload: &[u8], peer: SocketAddrV6, slave: &Interface) {
        let hop_count = if payload.first() == Some(&RELAY_FORW) {
            match RelayMessage::parse(payload) {
                Ok(existing) => match dhcpv6::next_hop_count(existing.hop_count) {
                    Ok(n) => n,
                    Err(e) => {
                        debug!(error = %e, "dropping relay chain at hop limit");
                        return;
                    }
                },
                Err(e) => {
                    debug!(error = %e, "dropping malformed relay-forw");
                    return;
                }
            }
        } else {
            0
        };

        let link_address = addr::first_global_address(&slave.name)
            .or_else(|| addr::first_global_address(&self.registry.master.name));
        let Some(link_address) = link_address else {
            debug!(iface = %slave.name, "no global address for relay link-address, dropping");
            return;
        };

        let mut options = Writer::with_capacity(payload.len() + 16);
        dhcpv6::write_option(&mut options, dhcpv6::OPT_INTERFACE_ID, &dhcpv6::encode_interface_id(slave.index));
        dhcpv6::write_option(&mut options, dhcpv6::OPT_RELAY_MSG, payload);

        let frame = RelayMessage::build(RELAY_FORW, hop_count, link_address, *peer.ip(), &options.into_vec());
        self.send_relay(&frame, ALL_DHCP_SERVERS, DHCPV6_SERVER_PORT).await;
    }

    /// SPEC_FULL §4.4 "Standard-mode server-to-client reply".
    async fn relay_server_response(&self, payload: &[u8]) {
        let relay = match RelayMessage::parse(payload) {
            Ok(r) if r.msg_type == RELAY_REPL => r,
            Ok(r) => {
                debug!(msg_type = r.msg_type, "expected RELAY-REPL at top level, dropping");
                return;
            }
            Err(e) => {
                debug!(error = %e, "dropping malformed relay-repl");
                return;
            }
        };

        let Some(ifindex) = relay.interface_id_option().and_then(dhcpv6::decode_interface_id) else {
            debug!("relay-repl missing Interface-ID, dropping");
            return;
        };
        let Some(slave) = self.registry.slave_by_index(ifindex) else {
            debug!(ifindex, "relay-repl references unknown interface, dropping");
            return;
        };
        let Some(inner) = relay.relay_message_option() else {
            debug!("relay-repl missing Relay-Message, dropping");
            return;
        };

        if inner.first() == Some(&RELAY_REPL) {
            self.send_relay(inner, relay.peer_address, DHCPV6_SERVER_PORT).await;
            return;
        }

        let rewritten = self.rewrite_reply_dns(inner, &slave.name);
        self.send_on_slave(&rewritten, slave.index, relay.peer_address, DHCPV6_CLIENT_PORT).await;
    }

    fn rewrite_reply_dns(&self, inner: &[u8], slave_name: &str) -> Vec<u8> {
        let Ok(msg) = ClientMessage::parse(inner) else {
            return inner.to_vec();
        };
        if msg.option(OPT_AUTH).is_some() {
            return inner.to_vec();
        }
        let Some(dns_opt) = msg.option(OPT_DNS_SERVERS) else {
            return inner.to_vec();
        };
        let servers = dhcpv6::parse_dns_servers_option(dns_opt);
        let any_link_local = servers.iter().any(|a| (a.segments()[0] & 0xffc0) == 0xfe80);
        if !(self.config.always_rewrite_dns || any_link_local) {
            return inner.to_vec();
        }
        let Some(replacement) = addr::first_global_address(slave_name) else {
            debug!(iface = slave_name, "no address available for reply DNS rewrite, leaving as-is");
            return inner.to_vec();
        };
        let new_value = dhcpv6::build_dns_servers_option(&[replacement]);
        let new_options = dhcpv6::replace_option(msg.options, OPT_DNS_SERVERS, &new_value);
        ClientMessage::build(msg.msg_type, msg.transaction_id, &new_options)
    }

    /// SPEC_FULL §4.4 "Broken-server mode", client→unrelayed-server path.
    async fn relay_client_request_broken(&self, payload: &[u8], peer: SocketAddrV6, slave: &Interface) {
        let Ok(msg) = ClientMessage::parse(payload) else {
            debug!("dropping malformed client message in broken mode");
            return;
        };
        if msg.option(OPT_AUTH).is_some() {
            debug!("refusing broken-mode DUID rewrite: Auth option present");
            return;
        }
        let Some(client_id) = msg.option(OPT_CLIENTID) else {
            debug!("client message has no Client-ID, cannot tag for broken mode");
            return;
        };

        let tag = BrokenDuidTag {
            ifindex: slave.index,
            client_link_local: *peer.ip(),
        };
        let rewritten_id = dhcpv6::rewrite_client_id(client_id, tag);
        let new_options = dhcpv6::replace_option(msg.options, OPT_CLIENTID, &rewritten_id);
        let new_payload = ClientMessage::build(msg.msg_type, msg.transaction_id, &new_options);

        // Preserved as-is per SPEC_FULL §9 Open Questions: targets the
        // all-relays group, not all-servers, matching the source's behavior.
        self.send_relay(&new_payload, ALL_DHCP_RELAY_AGENTS_AND_SERVERS, DHCPV6_SERVER_PORT)
            .await;
    }

    /// SPEC_FULL §4.4 "Broken-server mode", unrelayed-server→client path.
    async fn handle_broken_reply(&self, payload: &[u8], _peer: SocketAddrV6) {
        let Ok(msg) = ClientMessage::parse(payload) else {
            debug!("dropping malformed broken-mode reply");
            return;
        };
        let Some(client_id) = msg.option(OPT_CLIENTID) else {
            return;
        };
        let Some((tag, original)) = dhcpv6::unrewrite_client_id(client_id) else {
            trace!("broken-mode reply carries no recognizable tag, ignoring");
            return;
        };
        let new_options = dhcpv6::replace_option(msg.options, OPT_CLIENTID, original);
        let new_payload = ClientMessage::build(msg.msg_type, msg.transaction_id, &new_options);
        self.send_on_slave(&new_payload, tag.ifindex, tag.client_link_local, DHCPV6_CLIENT_PORT)
            .await;
    }

    /// SPEC_FULL §4.4 "Stateless mini-server", including "Nested relay
    /// handling": a downstream relay agent may hand us a client message
    /// already wrapped in one or more RELAY-FORW envelopes before it ever
    /// reaches the mini-server. Descend through all of them to find the
    /// actual client message, then rewrap the reply the same number of
    /// levels deep on the way back out.
    async fn handle_client_request(&self, payload: &[u8], peer: SocketAddrV6, slave: &Interface) {
        let (levels, innermost) = descend_relay_forw(payload);
        let Ok(msg) = ClientMessage::parse(innermost) else {
            debug!("dropping malformed client message");
            return;
        };

        let reply_type = match msg.msg_type {
            SOLICIT => ADVERTISE,
            INFORMATION_REQUEST | REQUEST => REPLY,
            REBIND => {
                debug!("rebind requested, no state to rebind, dropping");
                return;
            }
            other => {
                debug!(msg_type = other, "unsupported message type for mini-server, dropping");
                return;
            }
        };

        let our_duid = dhcpv6::server_duid(&slave.mac);
        if let Some(requested_server_id) = msg.option(OPT_SERVERID) {
            if requested_server_id != our_duid.as_slice() {
                debug!("request addressed to a different Server-ID, dropping");
                return;
            }
        }

        let mut options = Writer::with_capacity(64);
        if let Some(client_id) = msg.option(OPT_CLIENTID) {
            dhcpv6::write_option(&mut options, OPT_CLIENTID, client_id);
        }
        dhcpv6::write_option(&mut options, OPT_SERVERID, &our_duid);

        if let Some(ia_na) = msg.option(OPT_IA_NA) {
            if let Some(iaid) = dhcpv6::iaid_of(ia_na) {
                let reply_ia = dhcpv6::build_ia_na_no_addrs_available(iaid);
                dhcpv6::write_option(&mut options, OPT_IA_NA, &reply_ia);
            }
        }

        if let Some(dns_addr) = addr::first_global_address(&slave.name) {
            let dns_opt = dhcpv6::build_dns_servers_option(&[dns_addr]);
            dhcpv6::write_option(&mut options, OPT_DNS_SERVERS, &dns_opt);
        }

        let reply = ClientMessage::build(reply_type, msg.transaction_id, &options.into_vec());
        if levels.is_empty() {
            self.send_on_slave(&reply, slave.index, *peer.ip(), DHCPV6_CLIENT_PORT).await;
        } else {
            let wrapped = rewrap_reply(&levels, &reply);
            self.send_on_slave(&wrapped, slave.index, *peer.ip(), DHCPV6_SERVER_PORT).await;
        }
    }

    async fn send_relay(&self, payload: &[u8], dest: Ipv6Addr, port: u16) {
        let addr = SocketAddrV6::new(dest, port, 0, self.registry.master.index);
        if let Err(e) = self.relay_socket.send_to(payload, addr).await {
            warn!(error = %e, %dest, "dhcpv6 relay send failed");
        }
    }

    async fn send_on_slave(&self, payload: &[u8], slave_index: u32, dest: Ipv6Addr, port: u16) {
        let scope = if (dest.segments()[0] & 0xffc0) == 0xfe80 { slave_index } else { 0 };
        let addr = SocketAddrV6::new(dest, port, 0, scope);
        if let Err(e) = self.relay_socket.send_to(payload, addr).await {
            warn!(error = %e, %dest, slave_index, "dhcpv6 client-facing send failed");
        }
    }
}

/// One RELAY-FORW envelope peeled off by [`descend_relay_forw`], kept around
/// so the reply can be rewrapped at the same depth (SPEC_FULL §4.4 "Nested
/// relay handling").
struct RelayLevel {
    hop_count: u8,
    link_address: Ipv6Addr,
    peer_address: Ipv6Addr,
    /// The envelope's options verbatim, minus Relay-Message — every other
    /// option (Interface-ID, vendor options from a foreign relay, etc.) is
    /// echoed back unchanged on the reply per RFC 3315 §7.2.
    echo_options: Vec<u8>,
}

/// Peel off nested RELAY-FORW wrappers until the innermost client message is
/// reached. Returns the peeled levels, outermost first, and a slice into
/// `payload` holding the innermost message. A malformed or truncated
/// envelope simply stops the descent; the caller treats whatever's left as
/// the message and its own parsing rejects it if it still isn't one.
fn descend_relay_forw(payload: &[u8]) -> (Vec<RelayLevel>, &[u8]) {
    let mut levels = Vec::new();
    let mut current = payload;
    while current.first() == Some(&RELAY_FORW) && levels.len() < HOP_COUNT_LIMIT as usize {
        let Ok(relay) = RelayMessage::parse(current) else {
            break;
        };
        let Some(inner) = relay.relay_message_option() else {
            break;
        };
        levels.push(RelayLevel {
            hop_count: relay.hop_count,
            link_address: relay.link_address,
            peer_address: relay.peer_address,
            echo_options: dhcpv6::remove_option(relay.options, OPT_RELAY_MSG),
        });
        current = inner;
    }
    (levels, current)
}

/// Rewrap `innermost_reply` back through `levels`, innermost level first,
/// flipping each envelope to RELAY-REPL and patching its nested
/// Relay-Message length prefix once the (possibly different-sized) reply
/// body is known.
fn rewrap_reply(levels: &[RelayLevel], innermost_reply: &[u8]) -> Vec<u8> {
    let mut body = innermost_reply.to_vec();
    for level in levels.iter().rev() {
        let mut w = Writer::with_capacity(34 + level.echo_options.len() + body.len() + 4);
        w.u8(RELAY_REPL)
            .u8(level.hop_count)
            .ipv6(&level.link_address)
            .ipv6(&level.peer_address)
            .bytes(&level.echo_options);
        w.u16(OPT_RELAY_MSG);
        w.u16(0);
        let len_offset = w.len() - 2;
        w.bytes(&body);
        w.patch_u16(len_offset, body.len() as u16);
        body = w.into_vec();
    }
    body
}

async fn recv_broken(sock: &Option<Arc<DhcpSocket>>) -> std::io::Result<(Vec<u8>, SocketAddrV6, u32)> {
    match sock {
        Some(s) => s.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_and_recovers_broken_duid() {
        let original: [u8; 4] = [9, 8, 7, 6];
        let tag = BrokenDuidTag {
            ifindex: 5,
            client_link_local: "fe80::1".parse().unwrap(),
        };
        let rewritten = dhcpv6::rewrite_client_id(&original, tag);
        let (recovered_tag, recovered) = dhcpv6::unrewrite_client_id(&rewritten).unwrap();
        assert_eq!(recovered_tag, tag);
        assert_eq!(recovered, &original);
    }

    fn wrap_relay_forw(hop_count: u8, interface_id: u32, inner: &[u8]) -> Vec<u8> {
        let mut options = Writer::with_capacity(inner.len() + 16);
        dhcpv6::write_option(&mut options, dhcpv6::OPT_INTERFACE_ID, &dhcpv6::encode_interface_id(interface_id));
        dhcpv6::write_option(&mut options, OPT_RELAY_MSG, inner);
        RelayMessage::build(
            RELAY_FORW,
            hop_count,
            "fe80::a".parse().unwrap(),
            "fe80::b".parse().unwrap(),
            &options.into_vec(),
        )
    }

    #[test]
    fn descend_relay_forw_finds_unwrapped_message() {
        let client = ClientMessage::build(SOLICIT, [1, 2, 3], &[]);
        let (levels, innermost) = descend_relay_forw(&client);
        assert!(levels.is_empty());
        assert_eq!(innermost, client.as_slice());
    }

    #[test]
    fn descend_relay_forw_peels_nested_envelopes() {
        let client = ClientMessage::build(SOLICIT, [1, 2, 3], &[]);
        let once = wrap_relay_forw(0, 7, &client);
        let twice = wrap_relay_forw(1, 9, &once);

        let (levels, innermost) = descend_relay_forw(&twice);
        assert_eq!(levels.len(), 2);
        assert_eq!(levels[0].hop_count, 1);
        assert_eq!(levels[1].hop_count, 0);
        assert_eq!(innermost, client.as_slice());
    }

    #[test]
    fn rewrap_reply_flips_to_relay_repl_and_patches_length() {
        let client = ClientMessage::build(SOLICIT, [1, 2, 3], &[]);
        let wrapped = wrap_relay_forw(0, 7, &client);
        let (levels, _) = descend_relay_forw(&wrapped);

        let reply = ClientMessage::build(ADVERTISE, [1, 2, 3], &[9, 9, 9, 9, 9]);
        let rewrapped = rewrap_reply(&levels, &reply);

        let relay = RelayMessage::parse(&rewrapped).unwrap();
        assert_eq!(relay.msg_type, RELAY_REPL);
        assert_eq!(
            dhcpv6::decode_interface_id(relay.interface_id_option().unwrap()),
            Some(7)
        );
        let inner = relay.relay_message_option().unwrap();
        assert_eq!(inner, reply.as_slice());
    }
}
