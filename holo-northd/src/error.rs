//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::time::{Duration, Instant};

use tracing::warn;
use uuid::Uuid;

// Translation errors.
//
// None of these abort a reconciliation pass: the offending object is skipped
// and the pass continues. Allocation failures additionally return a sentinel
// zero to their caller.
#[derive(Debug)]
pub enum Error {
    // Configuration errors
    BadCidr(String, String),
    BadMacAddr(String, String),
    BadIpAddr(String, String),
    BadAddressEntry(String, String),
    BadExcludeIp(String, String),
    BadPeer(String, String),
    GatewayConflict(String),
    MultipleGatewayPorts(String, String),
    BadRouteNexthop(String, String),
    BadRoutePrefix(String, String),
    BadNatRule(String, String),
    BadVip(String, String),
    // Duplicate identity
    DuplicateNbUuid(Uuid),
    DuplicateSbDatapathKey(u32),
    DuplicatePortName(String),
    DuplicateDynamicRequest(String),
    DuplicateIpAddr(String, String),
    DuplicateMacAddr(String, String),
    // Missing references
    MissingRouterPort(String, String),
    MissingPortGroupPort(String, String),
    MissingVirtualParent(String, String),
    MissingRouteOutputPort(String, String),
    PolicyNexthopUnreachable(String, String),
    // Allocation exhaustion
    TnlKeyExhaustion(&'static str),
    QueueIdExhaustion(String),
    TagExhaustion(String),
    MacExhaustion,
    Ipv4Exhaustion(String),
    IgmpGroupKeyExhaustion(String),
}

// ===== impl Error =====

impl Error {
    pub(crate) fn log(&self) {
        match self {
            Error::BadCidr(object, value) => {
                warn!(%object, %value, "{}", self);
            }
            Error::BadMacAddr(object, value) => {
                warn!(%object, %value, "{}", self);
            }
            Error::BadIpAddr(object, value) => {
                warn!(%object, %value, "{}", self);
            }
            Error::BadAddressEntry(object, value) => {
                warn!(%object, %value, "{}", self);
            }
            Error::BadExcludeIp(object, value) => {
                warn!(%object, %value, "{}", self);
            }
            Error::BadPeer(object, peer) => {
                warn!(%object, %peer, "{}", self);
            }
            Error::GatewayConflict(port) => {
                warn!(%port, "{}", self);
            }
            Error::MultipleGatewayPorts(router, port) => {
                warn!(%router, %port, "{}", self);
            }
            Error::BadRouteNexthop(router, nexthop) => {
                warn!(%router, %nexthop, "{}", self);
            }
            Error::BadRoutePrefix(router, prefix) => {
                warn!(%router, %prefix, "{}", self);
            }
            Error::BadNatRule(router, detail) => {
                warn!(%router, %detail, "{}", self);
            }
            Error::BadVip(lb, vip) => {
                warn!(%lb, %vip, "{}", self);
            }
            Error::DuplicateNbUuid(uuid) => {
                warn!(%uuid, "{}", self);
            }
            Error::DuplicateSbDatapathKey(key) => {
                warn!(%key, "{}", self);
            }
            Error::DuplicatePortName(name) => {
                warn!(%name, "{}", self);
            }
            Error::DuplicateDynamicRequest(port) => {
                warn!(%port, "{}", self);
            }
            Error::DuplicateIpAddr(port, ip) => {
                warn!(%port, %ip, "{}", self);
            }
            Error::DuplicateMacAddr(port, mac) => {
                warn!(%port, %mac, "{}", self);
            }
            Error::MissingRouterPort(port, peer) => {
                warn!(%port, %peer, "{}", self);
            }
            Error::MissingPortGroupPort(group, port) => {
                warn!(%group, %port, "{}", self);
            }
            Error::MissingVirtualParent(port, parent) => {
                warn!(%port, %parent, "{}", self);
            }
            Error::MissingRouteOutputPort(router, port) => {
                warn!(%router, %port, "{}", self);
            }
            Error::PolicyNexthopUnreachable(router, nexthop) => {
                warn!(%router, %nexthop, "{}", self);
            }
            Error::TnlKeyExhaustion(space) => {
                warn!(%space, "{}", self);
            }
            Error::QueueIdExhaustion(chassis) => {
                warn!(%chassis, "{}", self);
            }
            Error::TagExhaustion(parent) => {
                warn!(%parent, "{}", self);
            }
            Error::MacExhaustion => {
                warn!("{}", self);
            }
            Error::Ipv4Exhaustion(switch) => {
                warn!(%switch, "{}", self);
            }
            Error::IgmpGroupKeyExhaustion(datapath) => {
                warn!(%datapath, "{}", self);
            }
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::BadCidr(..) => {
                write!(f, "invalid CIDR")
            }
            Error::BadMacAddr(..) => {
                write!(f, "invalid MAC address")
            }
            Error::BadIpAddr(..) => {
                write!(f, "invalid IP address")
            }
            Error::BadAddressEntry(..) => {
                write!(f, "invalid address entry")
            }
            Error::BadExcludeIp(..) => {
                write!(f, "excluded address outside subnet")
            }
            Error::BadPeer(..) => {
                write!(f, "invalid peer reference")
            }
            Error::GatewayConflict(..) => {
                write!(f, "conflicting gateway chassis declarations")
            }
            Error::MultipleGatewayPorts(..) => {
                write!(f, "router has multiple distributed gateway ports")
            }
            Error::BadRouteNexthop(..) => {
                write!(f, "invalid route nexthop")
            }
            Error::BadRoutePrefix(..) => {
                write!(f, "invalid route prefix")
            }
            Error::BadNatRule(..) => {
                write!(f, "invalid NAT rule")
            }
            Error::BadVip(..) => {
                write!(f, "invalid load-balancer VIP")
            }
            Error::DuplicateNbUuid(..) => {
                write!(f, "logical switch and router with the same identity")
            }
            Error::DuplicateSbDatapathKey(..) => {
                write!(f, "duplicate southbound datapath tunnel key")
            }
            Error::DuplicatePortName(..) => {
                write!(f, "duplicate logical port name")
            }
            Error::DuplicateDynamicRequest(..) => {
                write!(f, "duplicate dynamic address request")
            }
            Error::DuplicateIpAddr(..) => {
                write!(f, "duplicate IP address")
            }
            Error::DuplicateMacAddr(..) => {
                write!(f, "duplicate MAC address")
            }
            Error::MissingRouterPort(..) => {
                write!(f, "unknown router port")
            }
            Error::MissingPortGroupPort(..) => {
                write!(f, "port group references unknown port")
            }
            Error::MissingVirtualParent(..) => {
                write!(f, "unknown virtual parent port")
            }
            Error::MissingRouteOutputPort(..) => {
                write!(f, "unknown route output port")
            }
            Error::PolicyNexthopUnreachable(..) => {
                write!(f, "policy nexthop not reachable from any router port")
            }
            Error::TnlKeyExhaustion(..) => {
                write!(f, "tunnel key space exhausted")
            }
            Error::QueueIdExhaustion(..) => {
                write!(f, "queue id space exhausted")
            }
            Error::TagExhaustion(..) => {
                write!(f, "tag space exhausted")
            }
            Error::MacExhaustion => {
                write!(f, "MAC address space exhausted")
            }
            Error::Ipv4Exhaustion(..) => {
                write!(f, "IPv4 subnet exhausted")
            }
            Error::IgmpGroupKeyExhaustion(..) => {
                write!(f, "multicast group key range exhausted")
            }
        }
    }
}

impl std::error::Error for Error {}

// ===== RateLimit =====

// Token for rate-limiting repeated warnings.
//
// Malformed inputs show up again on every reconciliation pass; without a
// limiter they would flood the log at the pass frequency.
#[derive(Debug)]
pub struct RateLimit {
    interval: Duration,
    last: Option<Instant>,
}

impl Default for RateLimit {
    fn default() -> RateLimit {
        RateLimit::per_5s()
    }
}

impl RateLimit {
    // Default limiter used by the allocators (one warning per 5 seconds).
    pub fn per_5s() -> RateLimit {
        RateLimit::new(Duration::from_secs(5))
    }

    // Limiter used for per-object configuration warnings.
    pub fn per_1s() -> RateLimit {
        RateLimit::new(Duration::from_secs(1))
    }

    pub fn new(interval: Duration) -> RateLimit {
        RateLimit {
            interval,
            last: None,
        }
    }

    // Returns true if a warning may be emitted now.
    pub fn check(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}
