//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//
// The main event loop. Forward progress is driven by change notifications
// from the two database mirrors, the control socket and a periodic timer;
// a reconciliation pass runs only when this instance holds the write lock
// and is not paused.

use holo_northd::engine::Engine;
use holo_northd::nb::NbSnapshot;
use holo_northd::sb::{SbSnapshot, Transaction};
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};
use tracing::{info, warn};

use crate::control::{ControlCommand, ControlRequest};
use crate::election::{Leadership, LockEvent};

// Change notifications delivered by the database client.
#[derive(Debug)]
pub enum DbEvent {
    NbUpdate(NbSnapshot),
    SbUpdate(SbSnapshot),
    Lock(LockEvent),
}

#[derive(Debug)]
pub struct CommitError;

// The commit boundary. A pass produces one transaction; the committer
// either applies it atomically or fails, in which case the daemon discards
// all derived state and the next pass recomputes it from scratch.
pub trait Committer {
    fn commit(&mut self, txn: &Transaction) -> Result<(), CommitError>;
}

// Commit sink used when running without a database connection; the local
// mirrors remain the only copy of the southbound state.
#[derive(Debug, Default)]
pub struct AckCommitter;

pub struct Daemon {
    engine: Engine,
    nb: Option<NbSnapshot>,
    sb: Option<SbSnapshot>,
    leadership: Leadership,
    paused: bool,
    committer: Box<dyn Committer>,
}

// ===== impl AckCommitter =====

impl Committer for AckCommitter {
    fn commit(&mut self, _txn: &Transaction) -> Result<(), CommitError> {
        Ok(())
    }
}

// ===== impl CommitError =====

impl std::fmt::Display for CommitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "southbound transaction failed")
    }
}

impl std::error::Error for CommitError {}

// ===== impl Daemon =====

impl Daemon {
    pub fn new(committer: Box<dyn Committer>) -> Daemon {
        Daemon {
            engine: Engine::new(),
            nb: None,
            sb: None,
            leadership: Leadership::new(),
            paused: false,
            committer,
        }
    }

    pub async fn run(
        mut self,
        mut db_rx: mpsc::Receiver<DbEvent>,
        mut control_rx: mpsc::Receiver<ControlRequest>,
        probe_interval: Duration,
    ) {
        let mut probe = interval(probe_interval);
        let mut dirty = false;

        loop {
            tokio::select! {
                event = db_rx.recv() => {
                    let Some(event) = event else {
                        break;
                    };
                    self.process_db_event(event);
                    // Drain whatever else is already queued so one pass
                    // covers a burst of notifications.
                    while let Ok(event) = db_rx.try_recv() {
                        self.process_db_event(event);
                    }
                    dirty = true;
                }
                request = control_rx.recv() => {
                    let Some(request) = request else {
                        break;
                    };
                    if self.process_control_request(request) {
                        info!("exiting");
                        return;
                    }
                    dirty = true;
                }
                _ = probe.tick() => {
                    dirty = true;
                }
            }

            if dirty {
                dirty = false;
                self.reconcile();
            }
        }
    }

    fn process_db_event(&mut self, event: DbEvent) {
        match event {
            DbEvent::NbUpdate(nb) => self.nb = Some(nb),
            DbEvent::SbUpdate(sb) => self.sb = Some(sb),
            DbEvent::Lock(event) => self.leadership.update(event),
        }
    }

    // Returns true when the daemon should exit.
    fn process_control_request(&mut self, request: ControlRequest) -> bool {
        let reply = match request.command {
            ControlCommand::Exit => {
                let _ = request.reply.send(String::new());
                return true;
            }
            ControlCommand::Pause => {
                // Notifications keep flowing while paused so the mirrors
                // stay warm; only writes stop.
                self.paused = true;
                String::new()
            }
            ControlCommand::Resume => {
                self.paused = false;
                String::new()
            }
            ControlCommand::IsPaused => self.paused.to_string(),
        };
        let _ = request.reply.send(reply);
        false
    }

    fn reconcile(&mut self) {
        if !self.leadership.is_active() || self.paused {
            return;
        }
        let (Some(nb), Some(sb)) = (&self.nb, &self.sb) else {
            return;
        };

        let txn = self.engine.run_pass(nb, sb);
        if txn.is_empty() {
            return;
        }

        match self.committer.commit(&txn) {
            Ok(()) => {
                if let Some(nb) = &mut self.nb {
                    nb.apply(&txn);
                }
                if let Some(sb) = &mut self.sb {
                    sb.apply(&txn);
                }
            }
            Err(error) => {
                // Derived state is discarded wholesale; the next wakeup
                // rebuilds from the snapshots.
                warn!(%error, "discarding transaction");
            }
        }
    }
}
