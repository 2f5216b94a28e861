//! RFC 4861 Router Solicitation / Router Advertisement parsing and building,
//! plus the RFC 8106 RDNSS/DNSSL options. Grounded in `hr-ipv6::ra`'s option
//! layout, generalized into a typed, order-preserving option list so a
//! relayed RA can be rewritten option-by-option without losing any option
//! the daemon doesn't understand (SPEC_FULL §4.3, testable property:
//! "S does not appear anywhere in the outgoing packet's options" while every
//! *other* option is passed through byte-for-byte).

use std::net::Ipv6Addr;

use super::writer::{Reader, Writer};
use crate::error::WireError;

pub const ICMPV6_ROUTER_SOLICIT: u8 = 133;
pub const ICMPV6_ROUTER_ADVERT: u8 = 134;
pub const ICMPV6_NEIGHBOR_SOLICIT: u8 = 135;
pub const ICMPV6_NEIGHBOR_ADVERT: u8 = 136;

const OPT_SOURCE_LINKADDR: u8 = 1;
const OPT_TARGET_LINKADDR: u8 = 2;
const OPT_PREFIX_INFORMATION: u8 = 3;
const OPT_MTU: u8 = 5;
const OPT_RDNSS: u8 = 25;
const OPT_DNSSL: u8 = 31;

pub const FLAG_MANAGED: u8 = 0x80;
pub const FLAG_OTHER: u8 = 0x40;
pub const FLAG_PROXY: u8 = 0x04;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixInformation {
    pub prefix_len: u8,
    pub on_link: bool,
    pub autonomous: bool,
    pub valid_lifetime: u32,
    pub preferred_lifetime: u32,
    pub prefix: Ipv6Addr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rdnss {
    pub lifetime: u32,
    pub addrs: Vec<Ipv6Addr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dnssl {
    pub lifetime: u32,
    /// DNS-name-compressed domain labels, already zero-padded to an 8-byte
    /// multiple as read off the wire (or as built by `encode_search_domain`).
    pub encoded: Vec<u8>,
}

/// An ND option. `Other` preserves anything this daemon doesn't special-case
/// so relayed packets can pass it through verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NdOption {
    SourceLinkLayer([u8; 6]),
    TargetLinkLayer([u8; 6]),
    Mtu(u32),
    Prefix(PrefixInformation),
    Rdnss(Rdnss),
    Dnssl(Dnssl),
    Other { kind: u8, data: Vec<u8> },
}

fn parse_options(mut r: Reader<'_>) -> Vec<NdOption> {
    let mut options = Vec::new();
    loop {
        let start = r.pos();
        let Some(kind) = r.u8() else { break };
        let Some(len_units) = r.u8() else { break };
        if len_units == 0 {
            // RFC 4861 §4.6: a zero-length option is invalid; stop without
            // emitting it (mirrors the DHCPv6 walker's truncation behavior).
            break;
        }
        let total_bytes = len_units as usize * 8;
        let data_len = total_bytes.saturating_sub(2);
        let Some(data) = r.take(data_len) else { break };

        let option = match kind {
            OPT_SOURCE_LINKADDR if data.len() >= 6 => {
                NdOption::SourceLinkLayer(data[..6].try_into().unwrap())
            }
            OPT_TARGET_LINKADDR if data.len() >= 6 => {
                NdOption::TargetLinkLayer(data[..6].try_into().unwrap())
            }
            OPT_MTU if data.len() >= 6 => {
                NdOption::Mtu(u32::from_be_bytes(data[2..6].try_into().unwrap()))
            }
            OPT_PREFIX_INFORMATION if data.len() >= 30 => NdOption::Prefix(PrefixInformation {
                prefix_len: data[0],
                on_link: data[1] & 0x80 != 0,
                autonomous: data[1] & 0x40 != 0,
                valid_lifetime: u32::from_be_bytes(data[2..6].try_into().unwrap()),
                preferred_lifetime: u32::from_be_bytes(data[6..10].try_into().unwrap()),
                prefix: Ipv6Addr::from(<[u8; 16]>::try_from(&data[14..30]).unwrap()),
            }),
            OPT_RDNSS if data.len() >= 6 => {
                let lifetime = u32::from_be_bytes(data[2..6].try_into().unwrap());
                let addrs = data[6..]
                    .chunks_exact(16)
                    .map(|c| Ipv6Addr::from(<[u8; 16]>::try_from(c).unwrap()))
                    .collect();
                NdOption::Rdnss(Rdnss { lifetime, addrs })
            }
            OPT_DNSSL if data.len() >= 6 => NdOption::Dnssl(Dnssl {
                lifetime: u32::from_be_bytes(data[2..6].try_into().unwrap()),
                encoded: data[6..].to_vec(),
            }),
            _ => NdOption::Other {
                kind,
                data: data.to_vec(),
            },
        };
        options.push(option);
        // Guard against an option claiming a length that didn't actually
        // advance the reader (shouldn't happen given len_units > 0, but
        // keep parsing strictly forward regardless).
        if r.pos() <= start {
            break;
        }
    }
    options
}

fn write_option(w: &mut Writer, kind: u8, body: impl FnOnce(&mut Writer)) {
    let header_at = w.len();
    w.u8(kind).u8(0); // length patched below
    body(w);
    w.pad_to(8);
    let total_units = (w.len() - header_at) / 8;
    debug_assert!(total_units <= u8::MAX as usize);
    w.patch_u8(header_at + 1, total_units as u8);
}

fn write_options(w: &mut Writer, options: &[NdOption]) {
    for opt in options {
        match opt {
            NdOption::SourceLinkLayer(mac) => {
                write_option(w, OPT_SOURCE_LINKADDR, |w| {
                    w.bytes(mac);
                });
            }
            NdOption::TargetLinkLayer(mac) => {
                write_option(w, OPT_TARGET_LINKADDR, |w| {
                    w.bytes(mac);
                });
            }
            NdOption::Mtu(mtu) => {
                write_option(w, OPT_MTU, |w| {
                    w.u16(0).u32(*mtu);
                });
            }
            NdOption::Prefix(pio) => {
                write_option(w, OPT_PREFIX_INFORMATION, |w| {
                    let flags =
                        (if pio.on_link { 0x80 } else { 0 }) | (if pio.autonomous { 0x40 } else { 0 });
                    w.u8(pio.prefix_len)
                        .u8(flags)
                        .u32(pio.valid_lifetime)
                        .u32(pio.preferred_lifetime)
                        .u32(0)
                        .ipv6(&pio.prefix);
                });
            }
            NdOption::Rdnss(r) => {
                write_option(w, OPT_RDNSS, |w| {
                    w.u16(0).u32(r.lifetime);
                    for a in &r.addrs {
                        w.ipv6(a);
                    }
                });
            }
            NdOption::Dnssl(d) => {
                write_option(w, OPT_DNSSL, |w| {
                    w.u16(0).u32(d.lifetime).bytes(&d.encoded);
                });
            }
            NdOption::Other { kind, data } => {
                write_option(w, *kind, |w| {
                    w.bytes(data);
                });
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RouterSolicitation {
    pub options: Vec<NdOption>,
}

#[derive(Debug, Clone)]
pub struct RouterAdvertisement {
    pub cur_hop_limit: u8,
    pub flags: u8,
    pub router_lifetime: u16,
    pub reachable_time: u32,
    pub retrans_timer: u32,
    pub options: Vec<NdOption>,
}

impl RouterAdvertisement {
    pub fn flag(&self, bit: u8) -> bool {
        self.flags & bit != 0
    }

    pub fn set_flag(&mut self, bit: u8, on: bool) {
        if on {
            self.flags |= bit;
        } else {
            self.flags &= !bit;
        }
    }

    pub fn source_link_layer(&self) -> Option<[u8; 6]> {
        self.options.iter().find_map(|o| match o {
            NdOption::SourceLinkLayer(mac) => Some(*mac),
            _ => None,
        })
    }

    /// Replace (or insert) the Source Link-Layer Address option with `mac`,
    /// preserving the position/order of every other option
    /// (SPEC_FULL §4.3, relay-mode RA rewriting).
    pub fn set_source_link_layer(&mut self, mac: [u8; 6]) {
        if let Some(existing) = self
            .options
            .iter_mut()
            .find(|o| matches!(o, NdOption::SourceLinkLayer(_)))
        {
            *existing = NdOption::SourceLinkLayer(mac);
        } else {
            self.options.push(NdOption::SourceLinkLayer(mac));
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(64);
        w.u8(ICMPV6_ROUTER_ADVERT)
            .u8(0)
            .u16(0) // checksum: raw ICMPv6 sockets have the kernel fill this in
            .u8(self.cur_hop_limit)
            .u8(self.flags)
            .u16(self.router_lifetime)
            .u32(self.reachable_time)
            .u32(self.retrans_timer);
        write_options(&mut w, &self.options);
        w.into_vec()
    }

    pub fn parse(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < 16 {
            return Err(WireError::TooShort(data.len()));
        }
        if data[0] != ICMPV6_ROUTER_ADVERT {
            return Err(WireError::UnexpectedType(data[0]));
        }
        let cur_hop_limit = data[4];
        let flags = data[5];
        let router_lifetime = u16::from_be_bytes([data[6], data[7]]);
        let reachable_time = u32::from_be_bytes(data[8..12].try_into().unwrap());
        let retrans_timer = u32::from_be_bytes(data[12..16].try_into().unwrap());
        let options = parse_options(Reader::new(&data[16..]));
        Ok(RouterAdvertisement {
            cur_hop_limit,
            flags,
            router_lifetime,
            reachable_time,
            retrans_timer,
            options,
        })
    }
}

impl RouterSolicitation {
    pub fn parse(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < 8 {
            return Err(WireError::TooShort(data.len()));
        }
        if data[0] != ICMPV6_ROUTER_SOLICIT {
            return Err(WireError::UnexpectedType(data[0]));
        }
        let options = parse_options(Reader::new(&data[8..]));
        Ok(RouterSolicitation { options })
    }

    /// A bare RS with no options (SPEC_FULL §4.3, relay-mode RS forwarding).
    pub fn bare() -> Vec<u8> {
        let mut w = Writer::with_capacity(8);
        w.u8(ICMPV6_ROUTER_SOLICIT).u8(0).u16(0).u32(0);
        w.into_vec()
    }
}

pub const NA_FLAG_ROUTER: u8 = 0x80;
pub const NA_FLAG_SOLICITED: u8 = 0x40;
pub const NA_FLAG_OVERRIDE: u8 = 0x20;

/// Neighbor Solicitation (SPEC_FULL §4.5): `type(135) code(0) checksum(2)
/// reserved(4) target-address(16) options`.
#[derive(Debug, Clone)]
pub struct NeighborSolicitation {
    pub target: Ipv6Addr,
    pub options: Vec<NdOption>,
}

impl NeighborSolicitation {
    pub fn parse(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < 24 {
            return Err(WireError::TooShort(data.len()));
        }
        if data[0] != ICMPV6_NEIGHBOR_SOLICIT {
            return Err(WireError::UnexpectedType(data[0]));
        }
        let target = Ipv6Addr::from(<[u8; 16]>::try_from(&data[8..24]).unwrap());
        let options = parse_options(Reader::new(&data[24..]));
        Ok(NeighborSolicitation { target, options })
    }

    pub fn source_link_layer(&self) -> Option<[u8; 6]> {
        self.options.iter().find_map(|o| match o {
            NdOption::SourceLinkLayer(mac) => Some(*mac),
            _ => None,
        })
    }
}

/// Neighbor Advertisement (SPEC_FULL §4.5): `type(136) code(0) checksum(2)
/// flags+reserved(4) target-address(16) options`. The proxy sets this with
/// the router flag cleared (RFC 4389 §3).
#[derive(Debug, Clone)]
pub struct NeighborAdvertisement {
    pub flags: u8,
    pub target: Ipv6Addr,
    pub options: Vec<NdOption>,
}

impl NeighborAdvertisement {
    pub fn parse(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < 24 {
            return Err(WireError::TooShort(data.len()));
        }
        if data[0] != ICMPV6_NEIGHBOR_ADVERT {
            return Err(WireError::UnexpectedType(data[0]));
        }
        let flags = data[4];
        let target = Ipv6Addr::from(<[u8; 16]>::try_from(&data[8..24]).unwrap());
        let options = parse_options(Reader::new(&data[24..]));
        Ok(NeighborAdvertisement { flags, target, options })
    }

    pub fn flag(&self, bit: u8) -> bool {
        self.flags & bit != 0
    }

    pub fn target_link_layer(&self) -> Option<[u8; 6]> {
        self.options.iter().find_map(|o| match o {
            NdOption::TargetLinkLayer(mac) => Some(*mac),
            _ => None,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(32);
        w.u8(ICMPV6_NEIGHBOR_ADVERT).u8(0).u16(0).u8(self.flags).u8(0).u16(0);
        w.ipv6(&self.target);
        write_options(&mut w, &self.options);
        w.into_vec()
    }
}

/// DNS-name-compress a single search domain and zero-pad it to an 8-byte
/// multiple, as DNSSL requires (SPEC_FULL §4.3 step 4).
pub fn encode_search_domain(domain: &str) -> Vec<u8> {
    let mut out = Vec::new();
    for label in domain.split('.').filter(|l| !l.is_empty()) {
        let bytes = label.as_bytes();
        out.push(bytes.len().min(63) as u8);
        out.extend_from_slice(&bytes[..bytes.len().min(63)]);
    }
    out.push(0); // root label
    while out.len() % 8 != 0 {
        out.push(0);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ra() -> RouterAdvertisement {
        RouterAdvertisement {
            cur_hop_limit: 64,
            flags: 0,
            router_lifetime: 1800,
            reachable_time: 0,
            retrans_timer: 0,
            options: vec![
                NdOption::Prefix(PrefixInformation {
                    prefix_len: 64,
                    on_link: true,
                    autonomous: true,
                    valid_lifetime: 86400,
                    preferred_lifetime: 14400,
                    prefix: "2001:db8:1::".parse().unwrap(),
                }),
                NdOption::Rdnss(Rdnss {
                    lifetime: 3600,
                    addrs: vec!["2001:db8:1::1".parse().unwrap()],
                }),
                NdOption::SourceLinkLayer([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]),
            ],
        }
    }

    #[test]
    fn round_trips_ra() {
        let ra = sample_ra();
        let bytes = ra.to_bytes();
        let parsed = RouterAdvertisement::parse(&bytes).unwrap();
        assert_eq!(parsed.router_lifetime, 1800);
        assert_eq!(parsed.options.len(), 3);
        assert_eq!(
            parsed.source_link_layer(),
            Some([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF])
        );
    }

    #[test]
    fn rewriting_source_link_layer_preserves_other_options() {
        let mut ra = sample_ra();
        ra.set_source_link_layer([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
        assert_eq!(
            ra.source_link_layer(),
            Some([0x11, 0x22, 0x33, 0x44, 0x55, 0x66])
        );
        // the old MAC must not appear anywhere in the re-serialized packet
        let bytes = ra.to_bytes();
        assert!(!bytes
            .windows(6)
            .any(|w| w == [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]));
        // PIO and RDNSS survive untouched
        let parsed = RouterAdvertisement::parse(&bytes).unwrap();
        assert!(matches!(parsed.options[0], NdOption::Prefix(_)));
        assert!(matches!(parsed.options[1], NdOption::Rdnss(_)));
    }

    #[test]
    fn zero_length_option_terminates_parsing() {
        let mut data = vec![ICMPV6_ROUTER_ADVERT, 0, 0, 0, 64, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        data.extend_from_slice(&[1, 0, 0, 0, 0, 0, 0, 0]); // option type=1, length=0
        let ra = RouterAdvertisement::parse(&data).unwrap();
        assert!(ra.options.is_empty());
    }

    #[test]
    fn bare_rs_has_no_options() {
        let bytes = RouterSolicitation::bare();
        let rs = RouterSolicitation::parse(&bytes).unwrap();
        assert!(rs.options.is_empty());
    }

    #[test]
    fn search_domain_is_padded_to_8_bytes() {
        let encoded = encode_search_domain("lan");
        assert_eq!(encoded.len() % 8, 0);
        assert_eq!(encoded[0], 3);
        assert_eq!(&encoded[1..4], b"lan");
    }
}
