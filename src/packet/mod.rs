//! Wire-format parsing and building: explicit big-endian readers/writers and
//! the two protocol layers the daemon speaks, ND (RFC 4861/4389/8106) and
//! DHCPv6 relay/client-server (RFC 3315).

pub mod dhcpv6;
pub mod icmpv6;
pub mod writer;
