//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnetwork::{Ipv4Network, Ipv6Network};
use serde::{Deserialize, Serialize};

// Address Family identifier.
//
// IANA registry:
// http://www.iana.org/assignments/address-family-numbers
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub enum AddressFamily {
    Ipv4 = 1,
    Ipv6 = 2,
}

// Extension methods for IpAddr.
pub trait IpAddrExt {
    // Returns true if this is an usable address.
    fn is_usable(&self) -> bool;

    // Returns an unspecified address of the given address family.
    fn unspecified(af: AddressFamily) -> IpAddr;
}

// Extension methods for Ipv4Addr.
pub trait Ipv4AddrExt {
    const LENGTH: usize;

    // Returns true if this is an usable address.
    fn is_usable(&self) -> bool;
}

// Extension methods for Ipv6Addr.
pub trait Ipv6AddrExt {
    const LENGTH: usize;

    // Returns true if this is an usable address.
    fn is_usable(&self) -> bool;

    // Returns true if this is a link-local unicast address.
    fn is_unicast_link_local(&self) -> bool;

    // Returns the solicited-node multicast address corresponding to this
    // address (RFC 4291, section 2.7.1).
    fn solicited_node_multicast(&self) -> Ipv6Addr;
}

// Extension methods for Ipv4Network.
pub trait Ipv4NetworkExt {
    const MAX_PREFIXLEN: u8;

    // Returns true if this is a host prefix.
    fn is_host_prefix(&self) -> bool;

    // Returns the number of assignable host addresses in the network,
    // excluding the network address and the broadcast address.
    fn host_count(&self) -> u32;
}

// Extension methods for Ipv6Network.
pub trait Ipv6NetworkExt {
    const MAX_PREFIXLEN: u8;

    // Returns true if this is a host prefix.
    fn is_host_prefix(&self) -> bool;
}

// ===== impl IpAddr =====

impl IpAddrExt for IpAddr {
    fn is_usable(&self) -> bool {
        match self {
            IpAddr::V4(addr) => addr.is_usable(),
            IpAddr::V6(addr) => addr.is_usable(),
        }
    }

    fn unspecified(af: AddressFamily) -> IpAddr {
        match af {
            AddressFamily::Ipv4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            AddressFamily::Ipv6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }
}

// ===== impl Ipv4Addr =====

impl Ipv4AddrExt for Ipv4Addr {
    const LENGTH: usize = 4;

    fn is_usable(&self) -> bool {
        !(self.is_loopback() || self.is_broadcast() || self.is_unspecified())
    }
}

// ===== impl Ipv6Addr =====

impl Ipv6AddrExt for Ipv6Addr {
    const LENGTH: usize = 16;

    fn is_usable(&self) -> bool {
        !(self.is_loopback() || self.is_unspecified())
    }

    fn is_unicast_link_local(&self) -> bool {
        (self.segments()[0] & 0xffc0) == 0xfe80
    }

    fn solicited_node_multicast(&self) -> Ipv6Addr {
        let octets = self.octets();
        Ipv6Addr::new(
            0xff02,
            0,
            0,
            0,
            0,
            0x0001,
            0xff00 | octets[13] as u16,
            ((octets[14] as u16) << 8) | octets[15] as u16,
        )
    }
}

// ===== impl Ipv4Network =====

impl Ipv4NetworkExt for Ipv4Network {
    const MAX_PREFIXLEN: u8 = 32;

    fn is_host_prefix(&self) -> bool {
        self.prefix() == Self::MAX_PREFIXLEN
    }

    fn host_count(&self) -> u32 {
        match self.prefix() {
            31 | 32 => 0,
            plen => (1u32 << (32 - plen)) - 2,
        }
    }
}

// ===== impl Ipv6Network =====

impl Ipv6NetworkExt for Ipv6Network {
    const MAX_PREFIXLEN: u8 = 128;

    fn is_host_prefix(&self) -> bool {
        self.prefix() == Self::MAX_PREFIXLEN
    }
}
