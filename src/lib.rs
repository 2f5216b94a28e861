//! `relayd6`: an IPv6 edge-network relay daemon — Router Discovery,
//! DHCPv6, and Neighbor Discovery proxying between one upstream "master"
//! interface and N downstream "slave" interfaces (SPEC_FULL §1-§5).

pub mod addr;
pub mod config;
pub mod dhcp;
pub mod error;
pub mod forwarder;
pub mod iface;
pub mod mux;
pub mod ndp;
pub mod packet;
pub mod rd;
pub mod socket_io;
pub mod sysctl;

pub use config::Config;
pub use error::RelayError;
pub use iface::Registry;
