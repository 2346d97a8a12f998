//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use holo_utils::mac_addr::MacAddr;
use ipnetwork::{Ipv4Network, Ipv6Network};

// One IPv4 address together with the network it was declared in.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Ipv4Entry {
    pub addr: Ipv4Addr,
    pub network: Ipv4Network,
}

// One IPv6 address together with the network it was declared in.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Ipv6Entry {
    pub addr: Ipv6Addr,
    pub network: Ipv6Network,
}

// Parsed form of a logical-port address declaration: an Ethernet address
// followed by any number of IPv4/IPv6 addresses, each optionally carrying a
// prefix length.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LportAddresses {
    pub ea: MacAddr,
    pub ipv4: Vec<Ipv4Entry>,
    pub ipv6: Vec<Ipv6Entry>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AddressParseError {
    BadMac(String),
    BadAddress(String),
    MissingPrefixLen(String),
}

// ===== impl Ipv4Entry =====

impl Ipv4Entry {
    pub fn new(addr: Ipv4Addr, plen: u8) -> Option<Ipv4Entry> {
        let network = Ipv4Network::new(addr, plen).ok()?;
        Some(Ipv4Entry { addr, network })
    }

    pub fn plen(&self) -> u8 {
        self.network.prefix()
    }

    // Network address in textual form, with prefix length.
    pub fn network_str(&self) -> String {
        format!("{}/{}", self.network.network(), self.network.prefix())
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        self.network.broadcast()
    }
}

// ===== impl Ipv6Entry =====

impl Ipv6Entry {
    pub fn new(addr: Ipv6Addr, plen: u8) -> Option<Ipv6Entry> {
        let network = Ipv6Network::new(addr, plen).ok()?;
        Some(Ipv6Entry { addr, network })
    }

    pub fn plen(&self) -> u8 {
        self.network.prefix()
    }

    pub fn network_str(&self) -> String {
        format!("{}/{}", self.network.network(), self.network.prefix())
    }

    // Solicited-node multicast address for this address (RFC 4291).
    pub fn solicited_node(&self) -> Ipv6Addr {
        use holo_utils::ip::Ipv6AddrExt;
        self.addr.solicited_node_multicast()
    }
}

// ===== impl LportAddresses =====

impl LportAddresses {
    // Parses an "<eth> [<ip> ...]" address declaration. Addresses without an
    // explicit prefix length default to host prefixes.
    pub fn parse(entry: &str) -> Result<LportAddresses, AddressParseError> {
        let mut tokens = entry.split_whitespace();
        let mac = tokens
            .next()
            .ok_or_else(|| AddressParseError::BadMac(entry.to_owned()))?;
        let ea = MacAddr::from_str(mac)
            .map_err(|_| AddressParseError::BadMac(mac.to_owned()))?;

        let mut addresses = LportAddresses {
            ea,
            ..Default::default()
        };
        for token in tokens {
            addresses.add_ip(token, false)?;
        }

        Ok(addresses)
    }

    // Parses a router-port address declaration: the MAC comes from its own
    // column and every network must carry an explicit prefix length.
    pub fn from_lrp(
        mac: &str,
        networks: &[String],
    ) -> Result<LportAddresses, AddressParseError> {
        let ea = MacAddr::from_str(mac)
            .map_err(|_| AddressParseError::BadMac(mac.to_owned()))?;

        let mut addresses = LportAddresses {
            ea,
            ..Default::default()
        };
        for network in networks {
            if !network.contains('/') {
                return Err(AddressParseError::MissingPrefixLen(
                    network.clone(),
                ));
            }
            addresses.add_ip(network, true)?;
        }

        Ok(addresses)
    }

    fn add_ip(
        &mut self,
        token: &str,
        require_plen: bool,
    ) -> Result<(), AddressParseError> {
        let (addr, plen) = match token.split_once('/') {
            Some((addr, plen)) => {
                let plen = plen.parse::<u8>().map_err(|_| {
                    AddressParseError::BadAddress(token.to_owned())
                })?;
                (addr, Some(plen))
            }
            None if require_plen => {
                return Err(AddressParseError::MissingPrefixLen(
                    token.to_owned(),
                ));
            }
            None => (token, None),
        };

        match IpAddr::from_str(addr) {
            Ok(IpAddr::V4(addr)) => {
                let entry = Ipv4Entry::new(addr, plen.unwrap_or(32))
                    .ok_or_else(|| {
                        AddressParseError::BadAddress(token.to_owned())
                    })?;
                self.ipv4.push(entry);
            }
            Ok(IpAddr::V6(addr)) => {
                let entry = Ipv6Entry::new(addr, plen.unwrap_or(128))
                    .ok_or_else(|| {
                        AddressParseError::BadAddress(token.to_owned())
                    })?;
                self.ipv6.push(entry);
            }
            Err(_) => {
                return Err(AddressParseError::BadAddress(token.to_owned()));
            }
        }

        Ok(())
    }

    // Textual form used for router-port bindings: the MAC followed by every
    // network with its prefix length.
    pub fn to_lrp_string(&self) -> String {
        let mut out = self.ea.to_string();
        for entry in &self.ipv4 {
            out.push_str(&format!(" {}/{}", entry.addr, entry.plen()));
        }
        for entry in &self.ipv6 {
            out.push_str(&format!(" {}/{}", entry.addr, entry.plen()));
        }
        out
    }

    // Returns all addresses, both families.
    pub fn all_ips(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.ipv4
            .iter()
            .map(|entry| IpAddr::V4(entry.addr))
            .chain(self.ipv6.iter().map(|entry| IpAddr::V6(entry.addr)))
    }
}

impl std::fmt::Display for LportAddresses {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.ea)?;
        for entry in &self.ipv4 {
            write!(f, " {}", entry.addr)?;
        }
        for entry in &self.ipv6 {
            write!(f, " {}", entry.addr)?;
        }
        Ok(())
    }
}

// ===== impl AddressParseError =====

impl std::fmt::Display for AddressParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddressParseError::BadMac(value) => {
                write!(f, "invalid Ethernet address: {value}")
            }
            AddressParseError::BadAddress(value) => {
                write!(f, "invalid IP address: {value}")
            }
            AddressParseError::MissingPrefixLen(value) => {
                write!(f, "missing prefix length: {value}")
            }
        }
    }
}

impl std::error::Error for AddressParseError {}
