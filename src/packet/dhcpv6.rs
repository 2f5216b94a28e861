//! RFC 3315 DHCPv6 message/option parsing and building, generalized from
//! `hr-dhcp::packet`'s DHCPv4 TLV walker (`type:u8, length:u8`) to DHCPv6's
//! wider `type:u16, length:u16` option header (SPEC_FULL §4.4 "Option
//! iteration").

use std::net::Ipv6Addr;

use super::writer::{Reader, Writer};
use crate::error::WireError;

pub const SOLICIT: u8 = 1;
pub const ADVERTISE: u8 = 2;
pub const REQUEST: u8 = 3;
pub const CONFIRM: u8 = 4;
pub const RENEW: u8 = 5;
pub const REBIND: u8 = 6;
pub const REPLY: u8 = 7;
pub const RELEASE: u8 = 8;
pub const DECLINE: u8 = 9;
pub const RECONFIGURE: u8 = 10;
pub const INFORMATION_REQUEST: u8 = 11;
pub const RELAY_FORW: u8 = 12;
pub const RELAY_REPL: u8 = 13;

pub const OPT_CLIENTID: u16 = 1;
pub const OPT_SERVERID: u16 = 2;
pub const OPT_IA_NA: u16 = 3;
pub const OPT_IAADDR: u16 = 5;
pub const OPT_ORO: u16 = 6;
pub const OPT_ELAPSED_TIME: u16 = 8;
pub const OPT_RELAY_MSG: u16 = 9;
pub const OPT_AUTH: u16 = 11;
pub const OPT_STATUS_CODE: u16 = 13;
pub const OPT_INTERFACE_ID: u16 = 18;
pub const OPT_DNS_SERVERS: u16 = 23;
pub const OPT_DOMAIN_LIST: u16 = 24;

pub const STATUS_SUCCESS: u16 = 0;
pub const STATUS_NO_ADDRS_AVAIL: u16 = 2;

pub const DUID_TYPE_LL: u16 = 3;
pub const DUID_TYPE_EN: u16 = 2;
pub const HW_TYPE_ETHERNET: u16 = 1;

/// Private enterprise number used for this daemon's own Enterprise-DUIDs.
/// Not an IANA-registered number — it only ever needs to be self-consistent
/// between this process's own requests and replies.
pub const RELAY_ENTERPRISE_NUMBER: u32 = 54321;

pub const HOP_COUNT_LIMIT: u8 = 32;

/// One raw option as found by [`walk_options`] — value bytes only, no
/// header. Preserved verbatim by anything that doesn't specifically
/// recognize `code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawOption<'a> {
    pub code: u16,
    pub data: &'a [u8],
}

/// Walk a DHCPv6 options area. Per SPEC_FULL §4.4 and the boundary tests in
/// §8: an option whose declared length would overrun the buffer ends
/// iteration silently (no error returned to the caller); a declared length
/// of zero is valid and yields one empty option.
pub fn walk_options(buf: &[u8]) -> Vec<RawOption<'_>> {
    let mut r = Reader::new(buf);
    let mut out = Vec::new();
    loop {
        let start = r.pos();
        let Some(code) = r.u16() else { break };
        let Some(len) = r.u16() else { break };
        let Some(data) = r.take(len as usize) else { break };
        out.push(RawOption { code, data });
        if r.pos() <= start {
            break;
        }
    }
    out
}

pub fn find_option<'a>(buf: &'a [u8], code: u16) -> Option<&'a [u8]> {
    walk_options(buf).into_iter().find(|o| o.code == code).map(|o| o.data)
}

pub fn write_option(w: &mut Writer, code: u16, data: &[u8]) {
    w.u16(code);
    w.u16(data.len() as u16);
    w.bytes(data);
}

/// Rebuild an options buffer with `code`'s value replaced by `new_value`,
/// preserving every other option's identity and order. If `code` wasn't
/// present, it is appended. Mirrors `icmpv6::RouterAdvertisement::
/// set_source_link_layer`'s option-preserving rewrite at the DHCPv6 TLV
/// layer (used for both Client-ID rewriting in broken-server mode and
/// DNS-Servers rewriting on the relay reply path).
pub fn replace_option(options_buf: &[u8], code: u16, new_value: &[u8]) -> Vec<u8> {
    let mut w = Writer::with_capacity(options_buf.len() + new_value.len() + 4);
    let mut replaced = false;
    for opt in walk_options(options_buf) {
        if opt.code == code {
            write_option(&mut w, code, new_value);
            replaced = true;
        } else {
            write_option(&mut w, opt.code, opt.data);
        }
    }
    if !replaced {
        write_option(&mut w, code, new_value);
    }
    w.into_vec()
}

/// Drop `code` entirely if present, otherwise pass options through
/// unchanged. Used when a DNS-Servers rewrite has nowhere to source an
/// address from and the option must simply not appear (rather than be
/// rewritten to something wrong).
pub fn remove_option(options_buf: &[u8], code: u16) -> Vec<u8> {
    let mut w = Writer::with_capacity(options_buf.len());
    for opt in walk_options(options_buf) {
        if opt.code != code {
            write_option(&mut w, opt.code, opt.data);
        }
    }
    w.into_vec()
}

/// `hop_count` if the message is re-wrapped as a relay, or `Err` if the
/// chain is already at the RFC 3315 limit (SPEC_FULL §8 boundary: 31 → 32
/// ok, 32 → rejected).
pub fn next_hop_count(current: u8) -> Result<u8, WireError> {
    if current >= HOP_COUNT_LIMIT {
        Err(WireError::HopCountExceeded)
    } else {
        Ok(current + 1)
    }
}

/// A non-relay client/server message: `msg-type(1) transaction-id(3)
/// options`.
#[derive(Debug, Clone, Copy)]
pub struct ClientMessage<'a> {
    pub msg_type: u8,
    pub transaction_id: [u8; 3],
    pub options: &'a [u8],
}

impl<'a> ClientMessage<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, WireError> {
        if data.len() < 4 {
            return Err(WireError::TooShort(data.len()));
        }
        Ok(ClientMessage {
            msg_type: data[0],
            transaction_id: [data[1], data[2], data[3]],
            options: &data[4..],
        })
    }

    pub fn option(&self, code: u16) -> Option<&'a [u8]> {
        find_option(self.options, code)
    }

    pub fn build(msg_type: u8, transaction_id: [u8; 3], options: &[u8]) -> Vec<u8> {
        let mut w = Writer::with_capacity(4 + options.len());
        w.u8(msg_type);
        w.bytes(&transaction_id);
        w.bytes(options);
        w.into_vec()
    }
}

/// A `RELAY-FORW`/`RELAY-REPL` envelope: `msg-type(1) hop-count(1)
/// link-address(16) peer-address(16) options`.
#[derive(Debug, Clone, Copy)]
pub struct RelayMessage<'a> {
    pub msg_type: u8,
    pub hop_count: u8,
    pub link_address: Ipv6Addr,
    pub peer_address: Ipv6Addr,
    pub options: &'a [u8],
}

impl<'a> RelayMessage<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, WireError> {
        if data.len() < 34 {
            return Err(WireError::TooShort(data.len()));
        }
        if data[0] != RELAY_FORW && data[0] != RELAY_REPL {
            return Err(WireError::UnexpectedType(data[0]));
        }
        let link_address = Ipv6Addr::from(<[u8; 16]>::try_from(&data[2..18]).unwrap());
        let peer_address = Ipv6Addr::from(<[u8; 16]>::try_from(&data[18..34]).unwrap());
        Ok(RelayMessage {
            msg_type: data[0],
            hop_count: data[1],
            link_address,
            peer_address,
            options: &data[34..],
        })
    }

    pub fn relay_message_option(&self) -> Option<&'a [u8]> {
        find_option(self.options, OPT_RELAY_MSG)
    }

    pub fn interface_id_option(&self) -> Option<&'a [u8]> {
        find_option(self.options, OPT_INTERFACE_ID)
    }

    pub fn build(
        msg_type: u8,
        hop_count: u8,
        link_address: Ipv6Addr,
        peer_address: Ipv6Addr,
        options: &[u8],
    ) -> Vec<u8> {
        let mut w = Writer::with_capacity(34 + options.len());
        w.u8(msg_type)
            .u8(hop_count)
            .ipv6(&link_address)
            .ipv6(&peer_address)
            .bytes(options);
        w.into_vec()
    }
}

/// Encode an interface index as the opaque Interface-ID option value
/// (native byte order — SPEC_FULL §9 Open Questions: opaque to the server,
/// decoded identically on replay since this process wrote it).
pub fn encode_interface_id(ifindex: u32) -> [u8; 4] {
    ifindex.to_ne_bytes()
}

pub fn decode_interface_id(data: &[u8]) -> Option<u32> {
    Some(u32::from_ne_bytes(data.get(..4)?.try_into().ok()?))
}

/// Build a DUID-EN (Enterprise-DUID, type 2) carrying `identifier` as the
/// enterprise-specific identifier (SPEC_FULL §4.4: "server DUID as an
/// Enterprise-DUID with the interface MAC").
pub fn build_enterprise_duid(identifier: &[u8]) -> Vec<u8> {
    let mut w = Writer::with_capacity(6 + identifier.len());
    w.u16(DUID_TYPE_EN).u32(RELAY_ENTERPRISE_NUMBER).bytes(identifier);
    w.into_vec()
}

pub fn server_duid(mac: &[u8; 6]) -> Vec<u8> {
    build_enterprise_duid(mac)
}

pub fn build_status_code_option(code: u16, message: &str) -> Vec<u8> {
    let mut w = Writer::with_capacity(2 + message.len());
    w.u16(code).bytes(message.as_bytes());
    w.into_vec()
}

/// Build an IA_NA option (IAID + T1 + T2 + sub-options) replying
/// Status=NoAddrsAvail, per SPEC_FULL §4.4's stateless mini-server ("always
/// carrying Status=NoAddrsAvail when an IA_NA is requested").
pub fn build_ia_na_no_addrs_available(iaid: u32) -> Vec<u8> {
    let status = build_status_code_option(STATUS_NO_ADDRS_AVAIL, "no addresses available");
    let mut sub = Writer::with_capacity(4 + status.len());
    write_option(&mut sub, OPT_STATUS_CODE, &status);
    let sub = sub.into_vec();

    let mut w = Writer::with_capacity(12 + sub.len());
    w.u32(iaid).u32(0).u32(0).bytes(&sub);
    w.into_vec()
}

pub fn iaid_of(ia_na_option: &[u8]) -> Option<u32> {
    Some(u32::from_be_bytes(ia_na_option.get(..4)?.try_into().ok()?))
}

pub fn build_dns_servers_option(servers: &[Ipv6Addr]) -> Vec<u8> {
    let mut w = Writer::with_capacity(servers.len() * 16);
    for s in servers {
        w.ipv6(s);
    }
    w.into_vec()
}

pub fn parse_dns_servers_option(data: &[u8]) -> Vec<Ipv6Addr> {
    data.chunks_exact(16)
        .map(|c| Ipv6Addr::from(<[u8; 16]>::try_from(c).unwrap()))
        .collect()
}

const BROKEN_DUID_PREFIX_LEN: usize = 24;
const BROKEN_DUID_SUBTYPE: u16 = 0xB0D6;

/// The daemon's own tag prepended to a client's DUID in broken-server mode,
/// so the reply can be routed back to the right slave and client despite
/// never having been wrapped in a proper RELAY-FORW envelope the upstream
/// server would echo back (SPEC_FULL §4.4 "Broken-server mode"). Only the
/// low 64 bits of the client's link-local address are carried — the high 64
/// bits of any link-local address are always the fixed `fe80::/64` prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokenDuidTag {
    pub ifindex: u32,
    pub client_link_local: Ipv6Addr,
}

/// Prepend the 24-byte broken-DUID tag to `original_client_id` (the
/// client's real Client-ID option value).
pub fn rewrite_client_id(original_client_id: &[u8], tag: BrokenDuidTag) -> Vec<u8> {
    let suffix = u64::from_be_bytes(tag.client_link_local.octets()[8..16].try_into().unwrap());
    let mut w = Writer::with_capacity(BROKEN_DUID_PREFIX_LEN + original_client_id.len());
    w.u16(DUID_TYPE_EN)
        .u32(RELAY_ENTERPRISE_NUMBER)
        .u16(BROKEN_DUID_SUBTYPE)
        .u32(tag.ifindex)
        .u32((suffix >> 32) as u32)
        .u32(suffix as u32)
        .u32(0);
    w.bytes(original_client_id);
    w.into_vec()
}

/// Recognize and strip a broken-DUID tag, returning the tag and the
/// original Client-ID value. Returns `None` (pass the Client-ID through
/// unmodified) for any value that isn't our own tag — in particular, a
/// legitimate Enterprise-DUID from some other enterprise, or one shorter
/// than the tag.
pub fn unrewrite_client_id(value: &[u8]) -> Option<(BrokenDuidTag, &[u8])> {
    if value.len() < BROKEN_DUID_PREFIX_LEN {
        return None;
    }
    let mut r = Reader::new(&value[..BROKEN_DUID_PREFIX_LEN]);
    if r.u16()? != DUID_TYPE_EN {
        return None;
    }
    if r.u32()? != RELAY_ENTERPRISE_NUMBER {
        return None;
    }
    if r.u16()? != BROKEN_DUID_SUBTYPE {
        return None;
    }
    let ifindex = r.u32()?;
    let hi = r.u32()? as u64;
    let lo = r.u32()? as u64;
    let _reserved = r.u32()?;
    let suffix = (hi << 32) | lo;
    let mut octets = [0u8; 16];
    octets[0] = 0xfe;
    octets[1] = 0x80;
    octets[8..16].copy_from_slice(&suffix.to_be_bytes());
    let client_link_local = Ipv6Addr::from(octets);
    Some((
        BrokenDuidTag {
            ifindex,
            client_link_local,
        },
        &value[BROKEN_DUID_PREFIX_LEN..],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walks_options_in_order() {
        let mut w = Writer::with_capacity(16);
        write_option(&mut w, OPT_CLIENTID, &[1, 2, 3]);
        write_option(&mut w, OPT_SERVERID, &[4, 5]);
        let buf = w.into_vec();
        let opts = walk_options(&buf);
        assert_eq!(opts.len(), 2);
        assert_eq!(opts[0].code, OPT_CLIENTID);
        assert_eq!(opts[0].data, &[1, 2, 3]);
        assert_eq!(opts[1].data, &[4, 5]);
    }

    #[test]
    fn zero_length_option_is_one_empty_option() {
        let buf = [0u8, OPT_CLIENTID as u8, 0, 0];
        let opts = walk_options(&buf);
        assert_eq!(opts.len(), 1);
        assert!(opts[0].data.is_empty());
    }

    #[test]
    fn overrunning_length_truncates_without_emitting() {
        let buf = [0u8, OPT_CLIENTID as u8, 0xFF, 0xFF, 1, 2, 3];
        let opts = walk_options(&buf);
        assert!(opts.is_empty());
    }

    #[test]
    fn replace_option_preserves_others_and_order() {
        let mut w = Writer::with_capacity(16);
        write_option(&mut w, OPT_CLIENTID, &[1, 2, 3]);
        write_option(&mut w, OPT_SERVERID, &[9]);
        let buf = w.into_vec();
        let replaced = replace_option(&buf, OPT_CLIENTID, &[7, 7]);
        let opts = walk_options(&replaced);
        assert_eq!(opts[0].data, &[7, 7]);
        assert_eq!(opts[1].code, OPT_SERVERID);
        assert_eq!(opts[1].data, &[9]);
    }

    #[test]
    fn hop_count_boundary() {
        assert_eq!(next_hop_count(31), Ok(32));
        assert_eq!(next_hop_count(32), Err(WireError::HopCountExceeded));
    }

    #[test]
    fn relay_message_round_trips() {
        let inner = ClientMessage::build(SOLICIT, [1, 2, 3], &[]);
        let mut opts = Writer::with_capacity(8);
        write_option(&mut opts, OPT_RELAY_MSG, &inner);
        write_option(&mut opts, OPT_INTERFACE_ID, &encode_interface_id(7));
        let frame = RelayMessage::build(
            RELAY_FORW,
            0,
            "fe80::1".parse().unwrap(),
            "fe80::2".parse().unwrap(),
            &opts.into_vec(),
        );
        let parsed = RelayMessage::parse(&frame).unwrap();
        assert_eq!(parsed.msg_type, RELAY_FORW);
        assert_eq!(parsed.hop_count, 0);
        let relay_msg = parsed.relay_message_option().unwrap();
        let client = ClientMessage::parse(relay_msg).unwrap();
        assert_eq!(client.msg_type, SOLICIT);
        assert_eq!(
            decode_interface_id(parsed.interface_id_option().unwrap()),
            Some(7)
        );
    }

    #[test]
    fn broken_duid_rewrite_round_trips() {
        let original: [u8; 8] = [1, 2, 3, 4, 5, 6, 7, 8];
        let tag = BrokenDuidTag {
            ifindex: 3,
            client_link_local: "fe80::aabb:ccdd:eeff:1122".parse().unwrap(),
        };
        let rewritten = rewrite_client_id(&original, tag);
        assert_eq!(rewritten.len(), BROKEN_DUID_PREFIX_LEN + original.len());

        let (recovered_tag, recovered_original) = unrewrite_client_id(&rewritten).unwrap();
        assert_eq!(recovered_tag, tag);
        assert_eq!(recovered_original, &original);
    }

    #[test]
    fn unrewrite_rejects_foreign_duid() {
        let foreign = build_enterprise_duid(&[9, 9, 9, 9]);
        assert!(unrewrite_client_id(&foreign).is_none());
    }

    #[test]
    fn ia_na_reply_carries_no_addrs_available() {
        let reply = build_ia_na_no_addrs_available(42);
        assert_eq!(iaid_of(&reply), Some(42));
        let subs = walk_options(&reply[12..]);
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].code, OPT_STATUS_CODE);
        assert_eq!(u16::from_be_bytes([subs[0].data[0], subs[0].data[1]]), STATUS_NO_ADDRS_AVAIL);
    }
}
