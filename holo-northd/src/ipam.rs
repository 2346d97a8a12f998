//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::{Ipv4Addr, Ipv6Addr};

use holo_utils::mac_addr::MacAddr;

use crate::addresses::LportAddresses;
use crate::allocator::MacSet;
use crate::datapath::DatapathKind;
use crate::debug::Debug;
use crate::engine::Model;
use crate::error::Error;
use crate::port::{PortIndex, PortKind};
use crate::sb::{NbOp, Transaction};

// A port whose dynamic assignment must (re)allocate at least one component.
// Components already settled carry their value; the rest are allocated in a
// second pass, IPv4 first since the MAC probe is seeded from it.
#[derive(Debug)]
struct PendingPort {
    port: PortIndex,
    mac: Option<MacAddr>,
    ipv4: Option<Ipv4Addr>,
    needs_mac: bool,
    needs_ipv4: bool,
    wants_ipv6: bool,
}

// Runs dynamic address management. Must run only after all port peering has
// been resolved: peered ports never receive dynamic addresses, and router
// port networks reserve addresses in their peer switch's pool.
pub(crate) fn run(model: &mut Model, macs: &mut MacSet, txn: &mut Transaction) {
    seed_static_addresses(model, macs);

    // Classify every dynamic request, seeding unchanged components into the
    // allocation state immediately so reallocations avoid them.
    let mut pending = Vec::new();
    for index in 0..model.ports.len() {
        if let Some(entry) = classify_port(model, macs, index) {
            pending.push(entry);
        }
    }

    // Allocation pass over the queued ports.
    for mut entry in pending {
        let dp_index = model.ports[entry.port].dp;
        let name = model.ports[entry.port].name.clone();
        let (ipv6_prefix, ipam) = match &mut model.datapaths[dp_index].kind {
            DatapathKind::Switch(switch) => {
                (switch.ipv6_prefix, switch.ipam.as_mut())
            }
            _ => continue,
        };

        if entry.needs_ipv4 {
            if let Some(ipam) = ipam {
                entry.ipv4 = ipam.allocate(&name);
            }
        }
        if entry.needs_mac {
            if let Some(mac) = macs.allocate(entry.ipv4) {
                macs.add(mac, false, &name);
                entry.mac = Some(mac);
            }
        }

        // Without an Ethernet address there is nothing to assign.
        let Some(mac) = entry.mac else {
            set_dynamic(model, txn, entry.port, None);
            continue;
        };

        let ipv6 = entry
            .wants_ipv6
            .then(|| ipv6_prefix.map(|prefix| mac.to_eui64(&prefix)))
            .flatten();
        let addresses = dynamic_string(mac, entry.ipv4, ipv6);
        Debug::DynamicAddressAssign(&name, &addresses).log();
        set_dynamic(model, txn, entry.port, Some(addresses));
    }
}

// Registers every statically declared address so dynamic allocation avoids
// them: switch-port addresses in their own switch's pool, router-port
// networks in the peer switch's pool.
fn seed_static_addresses(model: &mut Model, macs: &mut MacSet) {
    for index in 0..model.ports.len() {
        let port = &model.ports[index];
        match &port.kind {
            PortKind::Lsp(lsp) => {
                let dp_index = port.dp;
                let entries: Vec<_> = lsp.addresses.clone();
                let name = port.name.clone();
                for entry in entries {
                    macs.add(entry.ea, true, &name);
                    if let DatapathKind::Switch(switch) =
                        &mut model.datapaths[dp_index].kind
                    {
                        if let Some(ipam) = switch.ipam.as_mut() {
                            for ipv4 in &entry.ipv4 {
                                ipam.mark(ipv4.addr);
                            }
                        }
                    }
                }
            }
            PortKind::Lrp(lrp) => {
                macs.add(lrp.mac, true, &port.name);
                let Some(peer) = port.peer else {
                    continue;
                };
                let peer_dp = model.ports[peer].dp;
                let networks = lrp.networks.clone();
                if let DatapathKind::Switch(switch) =
                    &mut model.datapaths[peer_dp].kind
                {
                    if let Some(ipam) = switch.ipam.as_mut() {
                        for ipv4 in &networks.ipv4 {
                            ipam.mark(ipv4.addr);
                        }
                    }
                }
            }
            PortKind::LrpRedirect(_) => {}
        }
    }
}

// Decides what, if anything, must change for one port. Returns None when
// the port has no dynamic request or the current assignment is still valid
// (unchanged components are seeded into the allocators either way).
fn classify_port(
    model: &mut Model,
    macs: &mut MacSet,
    index: PortIndex,
) -> Option<PendingPort> {
    let port = &model.ports[index];
    let lsp = port.kind.as_lsp()?;
    let request = lsp.dynamic_request.clone()?;
    // Peered ports take their addresses from the peer.
    if port.peer.is_some() {
        return None;
    }

    let dp_index = port.dp;
    let name = port.name.clone();
    let current = lsp.dynamic.clone();
    let current_string = current.as_ref().map(|cur| cur.to_string());

    let DatapathKind::Switch(switch) = &mut model.datapaths[dp_index].kind
    else {
        return None;
    };
    let wants_ipv4 = switch.ipam.is_some() && !switch.mac_only;
    let wants_ipv6 = switch.ipv6_prefix.is_some() && !switch.mac_only;
    let ipv6_prefix = switch.ipv6_prefix;

    let mut entry = PendingPort {
        port: index,
        mac: None,
        ipv4: None,
        needs_mac: false,
        needs_ipv4: false,
        wants_ipv6,
    };

    // IPv4: a specifically requested address wins if it is inside the
    // subnet and free; otherwise the request degrades to a fresh dynamic
    // allocation. An unchanged previous assignment is kept and re-marked.
    if let Some(ipam) = switch.ipam.as_mut().filter(|_| wants_ipv4) {
        if let Some(requested) = request.ipv4 {
            if ipam.mark(requested) {
                entry.ipv4 = Some(requested);
            } else {
                Error::DuplicateIpAddr(name.clone(), requested.to_string())
                    .log();
                entry.needs_ipv4 = true;
            }
        } else if let Some(cur) =
            current.as_ref().and_then(|cur| cur.ipv4.first())
        {
            if !ipam.contains(cur.addr) {
                // The subnet changed under the port.
                entry.needs_ipv4 = true;
            } else if ipam.mark(cur.addr) {
                entry.ipv4 = Some(cur.addr);
            } else {
                // Someone else owns it now.
                entry.needs_ipv4 = true;
            }
        } else {
            entry.needs_ipv4 = true;
        }
    }

    // MAC: static requests are honored as-is; an existing assignment under
    // the configured prefix is kept.
    if let Some(requested) = request.mac {
        macs.add(requested, false, &name);
        entry.mac = Some(requested);
    } else if let Some(cur) = current.as_ref().map(|cur| cur.ea) {
        if cur.prefix() == macs.prefix() {
            macs.add(cur, false, &name);
            entry.mac = Some(cur);
        } else {
            entry.needs_mac = true;
        }
    } else {
        entry.needs_mac = true;
    }

    // Nothing left to allocate: the port still goes through the second pass
    // unless the canonical string matches what is stored already. EUI-64
    // addresses are a pure function of MAC and prefix, so an unchanged MAC
    // keeps its IPv6 address.
    if !entry.needs_mac && !entry.needs_ipv4 {
        if let Some(mac) = entry.mac {
            let ipv6 = ipv6_prefix
                .filter(|_| wants_ipv6)
                .map(|prefix| mac.to_eui64(&prefix));
            let addresses = dynamic_string(mac, entry.ipv4, ipv6);
            if Some(&addresses) == current_string.as_ref() {
                return None;
            }
        }
    }

    Some(entry)
}

fn dynamic_string(
    mac: MacAddr,
    ipv4: Option<Ipv4Addr>,
    ipv6: Option<Ipv6Addr>,
) -> String {
    let mut out = mac.to_string();
    if let Some(ipv4) = ipv4 {
        out.push_str(&format!(" {ipv4}"));
    }
    if let Some(ipv6) = ipv6 {
        out.push_str(&format!(" {ipv6}"));
    }
    out
}

// Writes the assignment back: into the model so flow generation sees it,
// and into the northbound row via the transaction.
fn set_dynamic(
    model: &mut Model,
    txn: &mut Transaction,
    index: PortIndex,
    addresses: Option<String>,
) {
    let nb_uuid = model.ports[index].nb_uuid;
    let parsed = addresses
        .as_ref()
        .and_then(|addresses| LportAddresses::parse(addresses).ok());

    if let PortKind::Lsp(lsp) = &mut model.ports[index].kind {
        let existing = lsp.dynamic.as_ref().map(ToString::to_string);
        if existing == addresses {
            return;
        }
        lsp.dynamic = parsed;
    }
    txn.nb_ops.push(NbOp::SetDynamicAddresses {
        port: nb_uuid,
        addresses,
    });
}
