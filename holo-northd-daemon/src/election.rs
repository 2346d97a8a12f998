//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//
// Leader election state. The election itself is a named lock on the
// southbound connection, owned by the database client; the daemon only
// tracks its status. Standby instances keep consuming change notifications
// so their in-memory mirrors stay warm, but never open write transactions.

use tracing::info;

#[derive(Debug)]
pub struct Leadership {
    active: bool,
}

// Lock status notifications from the southbound connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LockEvent {
    Acquired,
    Lost,
}

// ===== impl Leadership =====

impl Leadership {
    pub(crate) fn new() -> Leadership {
        Leadership { active: false }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active
    }

    pub(crate) fn update(&mut self, event: LockEvent) {
        let active = event == LockEvent::Acquired;
        if active == self.active {
            return;
        }
        self.active = active;
        if active {
            info!("active");
        } else {
            info!("standby");
        }
    }
}
