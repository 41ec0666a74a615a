//! Single-flight processor for state-mutating operations.
//!
//! RPC handlers and protocol drivers run on many concurrent tasks, but the
//! replica's state tolerates exactly one mutation at a time. Everything
//! funnels through a bounded hand-off channel into one applier task, which
//! applies operations strictly in admission order and fires a completion
//! signal per submission. Submitters block on their signal before replying
//! to their caller, so no reply ever races its own mutation.

use std::sync::{Arc, Mutex};

use crate::replica::messages::{
    PrepareArgs, PrepareReply, RecoveryArgs, RecoveryReply, StartViewArgs,
    ViewChangeArgs, ViewChangeReply,
};
use crate::replica::state::ReplicaState;
use crate::replica::{Command, Replica, ReplicaId};
use crate::utils::ViewstampedError;

use tokio::sync::{mpsc, oneshot, watch};

/// A state-mutating operation to be applied by the applier task.
#[derive(Debug)]
pub(crate) enum StateOp {
    /// Primary-side local append of a newly proposed command.
    Append { entry: Command },

    /// Primary-side commit advancement after a Prepare quorum.
    AdvanceCommit { view: u64, index: usize },

    /// Join a higher view learned from a peer's reply.
    AdoptView { view: u64 },

    /// Initiator-side start of a view-change round.
    BeginViewChange,

    /// Initiator-side installation of a decided view's log.
    InstallView { view: u64, log: Vec<Command> },

    /// Mark this replica as catching up (explicit recovery trigger).
    BeginRecovery,

    /// Requester-side installation of a successful Recovery reply.
    InstallRecovered {
        view: u64,
        entries: Vec<Command>,
        primary_commit: usize,
    },

    /// Inbound Prepare request.
    Prepare { args: PrepareArgs },

    /// Inbound Recovery request.
    Recovery { args: RecoveryArgs },

    /// Inbound ViewChange request.
    ViewChange { args: ViewChangeArgs },

    /// Inbound StartView announcement.
    StartView { args: StartViewArgs },
}

/// Completion value of an applied `StateOp`.
#[derive(Debug)]
pub(crate) enum OpOutcome {
    /// Append admitted at `index` under `view`, with the commit watermark
    /// to piggyback on the Prepare broadcast.
    Appended {
        view: u64,
        index: usize,
        primary_commit: usize,
    },

    /// The operation was refused by the current state (not an error).
    Refused,

    /// Commit watermark advanced (or already covered the index).
    Committed,

    /// Higher view adopted.
    Adopted,

    /// View-change round started; carries the candidate view and my own
    /// contribution to the log quorum.
    ViewChangeBegun {
        candidate: u64,
        last_normal_view: u64,
        log: Vec<Command>,
    },

    /// New view's log installed.
    Installed,

    /// Recovering status entered.
    RecoveryBegun,

    /// Prepare handled.
    Prepared {
        reply: PrepareReply,
        needs_recovery: bool,
    },

    /// Recovery request served (or refused) by this primary.
    RecoveryServed { reply: RecoveryReply },

    /// ViewChange request voted on.
    ViewChangeVoted { reply: ViewChangeReply },

    /// StartView announcement processed.
    StartViewDone,
}

/// One queued submission: the operation plus its completion signal.
pub(crate) struct Submission {
    op: StateOp,
    done: oneshot::Sender<OpOutcome>,
}

// Replica applier-side logic
impl Replica {
    /// Hands an operation to the applier task and blocks until its
    /// completion signal fires. Fails once the replica has shut down.
    pub(crate) async fn submit(
        &self,
        op: StateOp,
    ) -> Result<OpOutcome, ViewstampedError> {
        let (tx_done, rx_done) = oneshot::channel();
        self.tx_apply
            .send(Submission { op, done: tx_done })
            .await
            .map_err(|_| {
                ViewstampedError::msg("replica has been shut down")
            })?;
        Ok(rx_done.await?)
    }

    /// Applier task body: one operation at a time, in admission order. On
    /// the termination signal it stops admitting, drains what was already
    /// queued, and exits.
    pub(crate) async fn applier_task(
        id: ReplicaId,
        state: Arc<Mutex<ReplicaState>>,
        mut rx_apply: mpsc::Receiver<Submission>,
        mut rx_term: watch::Receiver<bool>,
    ) {
        pf_debug!(id; "applier task spawned");
        loop {
            tokio::select! {
                sub = rx_apply.recv() => match sub {
                    Some(sub) => Self::apply_one(&state, sub),
                    None => break,
                },

                _ = rx_term.changed() => {
                    rx_apply.close();
                    while let Some(sub) = rx_apply.recv().await {
                        Self::apply_one(&state, sub);
                    }
                    break;
                },
            }
        }
        pf_debug!(id; "applier task exited");
    }

    // Must stay synchronous: an await point here would let another
    // operation interleave with a half-applied one.
    fn apply_one(state: &Arc<Mutex<ReplicaState>>, sub: Submission) {
        let mut state = state.lock().expect("replica state lock poisoned");
        let outcome = match sub.op {
            StateOp::Append { entry } => match state.append(entry) {
                Some((view, index, primary_commit)) => OpOutcome::Appended {
                    view,
                    index,
                    primary_commit,
                },
                None => OpOutcome::Refused,
            },
            StateOp::AdvanceCommit { view, index } => {
                if state.advance_commit(view, index) {
                    OpOutcome::Committed
                } else {
                    OpOutcome::Refused
                }
            }
            StateOp::AdoptView { view } => {
                if state.adopt_higher_view(view) {
                    OpOutcome::Adopted
                } else {
                    OpOutcome::Refused
                }
            }
            StateOp::BeginViewChange => {
                let (candidate, last_normal_view, log) =
                    state.begin_view_change();
                OpOutcome::ViewChangeBegun {
                    candidate,
                    last_normal_view,
                    log,
                }
            }
            StateOp::InstallView { view, log } => {
                if state.install_view(view, log) {
                    OpOutcome::Installed
                } else {
                    OpOutcome::Refused
                }
            }
            StateOp::BeginRecovery => {
                state.begin_recovering();
                OpOutcome::RecoveryBegun
            }
            StateOp::InstallRecovered {
                view,
                entries,
                primary_commit,
            } => {
                if state.install_recovered(view, entries, primary_commit) {
                    OpOutcome::Installed
                } else {
                    OpOutcome::Refused
                }
            }
            StateOp::Prepare { args } => {
                let (reply, needs_recovery) = state.handle_prepare(args);
                OpOutcome::Prepared {
                    reply,
                    needs_recovery,
                }
            }
            StateOp::Recovery { args } => OpOutcome::RecoveryServed {
                reply: state.handle_recovery(args),
            },
            StateOp::ViewChange { args } => OpOutcome::ViewChangeVoted {
                reply: state.handle_view_change(args),
            },
            StateOp::StartView { args } => {
                state.handle_start_view(args);
                OpOutcome::StartViewDone
            }
        };
        // the submitter may have been abandoned by its caller; that's fine,
        // the operation itself has landed
        let _ = sub.done.send(outcome);
    }
}
