//! Interface registry: one master plus N slave records, discovered once at
//! startup from `/sys/class/net/<name>/*` and never mutated afterwards
//! (SPEC_FULL §3, §9).

use std::fs;

use tracing::debug;

use crate::config::Config;
use crate::error::RelayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Slave,
}

#[derive(Debug, Clone)]
pub struct Interface {
    pub index: u32,
    pub name: String,
    pub mtu: u32,
    pub mac: [u8; 6],
    pub role: Role,
    /// Suppress host-ND proxying for this slave (SPEC_FULL §4.5). Always
    /// `false` for the master.
    pub external: bool,
}

impl Interface {
    fn discover(name: &str, role: Role, external: bool) -> Result<Self, RelayError> {
        let sys = format!("/sys/class/net/{name}");
        let io_err = |source: std::io::Error| RelayError::Socket {
            iface: name.to_string(),
            source,
        };

        let index: u32 = fs::read_to_string(format!("{sys}/ifindex"))
            .map_err(io_err)?
            .trim()
            .parse()
            .map_err(|_| RelayError::InterfaceNotFound(name.to_string()))?;

        let mtu: u32 = fs::read_to_string(format!("{sys}/mtu"))
            .map_err(io_err)?
            .trim()
            .parse()
            .unwrap_or(1500);

        let mac_str = fs::read_to_string(format!("{sys}/address")).map_err(io_err)?;
        let mac = parse_mac(mac_str.trim())
            .ok_or_else(|| RelayError::InterfaceNotFound(format!("{name} (bad MAC)")))?;

        debug!(iface = name, index, mtu, mac = %mac_str.trim(), ?role, "discovered interface");

        Ok(Interface {
            index,
            name: name.to_string(),
            mtu,
            mac,
            role,
            external,
        })
    }

    pub fn is_master(&self) -> bool {
        self.role == Role::Master
    }
}

fn parse_mac(s: &str) -> Option<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = s.split(':');
    for b in mac.iter_mut() {
        *b = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(mac)
}

/// One master plus N slaves, indexed by kernel interface index.
pub struct Registry {
    pub master: Interface,
    pub slaves: Vec<Interface>,
}

impl Registry {
    pub fn discover(config: &Config) -> Result<Self, RelayError> {
        let master = Interface::discover(&config.master, Role::Master, false)?;
        let mut slaves = Vec::with_capacity(config.slaves.len());
        for spec in &config.slaves {
            slaves.push(Interface::discover(&spec.name, Role::Slave, spec.external)?);
        }
        Ok(Registry { master, slaves })
    }

    pub fn by_index(&self, index: u32) -> Option<&Interface> {
        if self.master.index == index {
            return Some(&self.master);
        }
        self.slaves.iter().find(|s| s.index == index)
    }

    pub fn slave_by_index(&self, index: u32) -> Option<&Interface> {
        self.slaves.iter().find(|s| s.index == index)
    }

    pub fn all(&self) -> impl Iterator<Item = &Interface> {
        std::iter::once(&self.master).chain(self.slaves.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mac() {
        assert_eq!(
            parse_mac("aa:bb:cc:dd:ee:ff"),
            Some([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff])
        );
        assert_eq!(parse_mac("aa:bb:cc"), None);
        assert_eq!(parse_mac("not-a-mac-at-all"), None);
    }
}
