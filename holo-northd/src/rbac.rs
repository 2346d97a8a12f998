//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::sb::{RbacPermission, RbacRole, SbOp, SbSnapshot, Transaction};

// The role granted to the downstream agents.
pub const RBAC_ROLE_NAME: &str = "ovn-controller";

// The exact permission matrix of the downstream agent role: which tables it
// may touch, how rows are authorized, and which columns it may update.
struct PermissionSpec {
    table: &'static str,
    authorization: &'static [&'static str],
    insert_delete: bool,
    update: &'static [&'static str],
}

const PERMISSIONS: &[PermissionSpec] = &[
    PermissionSpec {
        table: "Chassis",
        authorization: &["name"],
        insert_delete: true,
        update: &["nb_cfg", "external_ids", "encaps", "vtep_logical_switches"],
    },
    PermissionSpec {
        table: "Encap",
        authorization: &["chassis_name"],
        insert_delete: true,
        update: &["type", "options", "ip"],
    },
    PermissionSpec {
        table: "Port_Binding",
        authorization: &[""],
        insert_delete: false,
        update: &["chassis"],
    },
    PermissionSpec {
        table: "MAC_Binding",
        authorization: &[""],
        insert_delete: true,
        update: &["logical_port", "ip", "mac", "datapath"],
    },
];

impl PermissionSpec {
    fn matches(&self, row: &RbacPermission) -> bool {
        row.table == self.table
            && row.authorization == self.authorization
            && row.insert_delete == self.insert_delete
            && row.update == self.update
    }

    fn to_row(&self) -> RbacPermission {
        RbacPermission {
            uuid: Uuid::new_v4(),
            table: self.table.to_owned(),
            authorization: self
                .authorization
                .iter()
                .map(|s| (*s).to_owned())
                .collect(),
            insert_delete: self.insert_delete,
            update: self.update.iter().map(|s| (*s).to_owned()).collect(),
        }
    }
}

// ===== global functions =====

// Ensures the downstream agent role exposes exactly the permission matrix
// above. Drifted rows are deleted and recreated; stray rows are removed.
pub(crate) fn check(sb: &SbSnapshot, txn: &mut Transaction) {
    let role = sb
        .rbac_roles
        .values()
        .find(|role| role.name == RBAC_ROLE_NAME);

    let mut permissions: BTreeMap<String, Uuid> = BTreeMap::new();
    let mut changed = false;

    for spec in PERMISSIONS {
        let current = role
            .and_then(|role| role.permissions.get(spec.table))
            .and_then(|uuid| sb.rbac_permissions.get(uuid));
        match current {
            Some(row) if spec.matches(row) => {
                permissions.insert(spec.table.to_owned(), row.uuid);
            }
            Some(row) => {
                txn.sb_ops.push(SbOp::DeleteRbacPermission(row.uuid));
                let row = spec.to_row();
                permissions.insert(spec.table.to_owned(), row.uuid);
                txn.sb_ops.push(SbOp::InsertRbacPermission(row));
                changed = true;
            }
            None => {
                let row = spec.to_row();
                permissions.insert(spec.table.to_owned(), row.uuid);
                txn.sb_ops.push(SbOp::InsertRbacPermission(row));
                changed = true;
            }
        }
    }

    // Stray permissions under the role.
    if let Some(role) = role {
        for (table, uuid) in &role.permissions {
            if !PERMISSIONS.iter().any(|spec| spec.table == *table) {
                txn.sb_ops.push(SbOp::DeleteRbacPermission(*uuid));
                changed = true;
            }
        }
    }

    match role {
        Some(role) => {
            if changed {
                txn.sb_ops.push(SbOp::UpdateRbacRole(RbacRole {
                    uuid: role.uuid,
                    name: RBAC_ROLE_NAME.to_owned(),
                    permissions,
                }));
            }
        }
        None => {
            txn.sb_ops.push(SbOp::InsertRbacRole(RbacRole {
                uuid: Uuid::new_v4(),
                name: RBAC_ROLE_NAME.to_owned(),
                permissions,
            }));
        }
    }
}
