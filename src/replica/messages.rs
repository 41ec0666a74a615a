//! Peer-to-peer RPC message types and inbound handler entry points.
//!
//! The transport layer may invoke these handlers concurrently from many
//! in-flight calls; every state mutation is funneled through the applier so
//! that exactly one lands at a time, in admission order. A handler blocks
//! until its operation's completion signal fires, then replies.

use std::sync::Arc;

use crate::replica::applier::{OpOutcome, StateOp};
use crate::replica::{Command, Replica, ReplicaId};
use crate::utils::ViewstampedError;

use serde::{Deserialize, Serialize};

/// Arguments for the Prepare RPC, replicating one log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareArgs {
    /// The primary's current view.
    pub view: u64,
    /// The primary's commit index, piggybacked so backups learn commits.
    pub primary_commit: usize,
    /// The index position at which the entry is to be replicated.
    pub index: usize,
    /// The log entry to be replicated.
    pub entry: Command,
}

/// Reply for the Prepare RPC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareReply {
    /// The backup's current view.
    pub view: u64,
    /// Whether the Prepare request has been accepted.
    pub success: bool,
}

/// Arguments for the Recovery RPC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryArgs {
    /// The view the requester would like to synchronize with.
    pub view: u64,
    /// The requesting replica's ID.
    pub requester: ReplicaId,
}

/// Reply for the Recovery RPC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReply {
    /// The primary's current view.
    pub view: u64,
    /// The primary's full log; empty on refusal.
    pub entries: Vec<Command>,
    /// The primary's commit index.
    pub primary_commit: usize,
    /// Whether the Recovery request has been accepted.
    pub success: bool,
}

/// Arguments for the ViewChange RPC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewChangeArgs {
    /// The new view to be changed into.
    pub view: u64,
}

/// Reply for the ViewChange RPC, surrendering this replica's log for the
/// initiator to consider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewChangeReply {
    /// The latest view in which this replica had Normal status.
    pub last_normal_view: u64,
    /// This replica's full log; empty on refusal.
    pub log: Vec<Command>,
    /// Whether the ViewChange request has been accepted.
    pub success: bool,
}

/// Arguments for the StartView RPC, announcing a decided view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartViewArgs {
    /// The new view which has completed its view change.
    pub view: u64,
    /// The authoritative log of the new view.
    pub log: Vec<Command>,
}

/// Envelope over all peer-to-peer request types, for transports to carry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerRequest {
    Prepare(PrepareArgs),
    Recovery(RecoveryArgs),
    ViewChange(ViewChangeArgs),
    StartView(StartViewArgs),
}

/// Envelope over all peer-to-peer reply types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerReply {
    Prepare(PrepareReply),
    Recovery(RecoveryReply),
    ViewChange(ViewChangeReply),
    StartView,
}

// Replica inbound RPC handlers
impl Replica {
    /// Dispatches an inbound peer request to its handler. This is the sole
    /// entry point a transport implementation needs.
    pub async fn handle_request(
        self: &Arc<Self>,
        req: PeerRequest,
    ) -> Result<PeerReply, ViewstampedError> {
        match req {
            PeerRequest::Prepare(args) => {
                Ok(PeerReply::Prepare(self.handle_prepare(args).await?))
            }
            PeerRequest::Recovery(args) => {
                Ok(PeerReply::Recovery(self.handle_recovery(args).await?))
            }
            PeerRequest::ViewChange(args) => {
                Ok(PeerReply::ViewChange(self.handle_view_change(args).await?))
            }
            PeerRequest::StartView(args) => {
                self.handle_start_view(args).await?;
                Ok(PeerReply::StartView)
            }
        }
    }

    /// Handler of Prepare request from the primary. A rejection that left
    /// this replica Recovering also kicks off a background catch-up round.
    pub async fn handle_prepare(
        self: &Arc<Self>,
        args: PrepareArgs,
    ) -> Result<PrepareReply, ViewstampedError> {
        pf_trace!(self.id; "received Prepare for idx {} in view {}",
                           args.index, args.view);
        match self.submit(StateOp::Prepare { args }).await? {
            OpOutcome::Prepared {
                reply,
                needs_recovery,
            } => {
                if needs_recovery {
                    self.spawn_recovery();
                }
                Ok(reply)
            }
            _ => logged_err!(self.id; "unexpected outcome for Prepare op"),
        }
    }

    /// Handler of Recovery request from a replica that fell behind.
    pub async fn handle_recovery(
        self: &Arc<Self>,
        args: RecoveryArgs,
    ) -> Result<RecoveryReply, ViewstampedError> {
        pf_trace!(self.id; "received Recovery <- {} for view {}",
                           args.requester, args.view);
        match self.submit(StateOp::Recovery { args }).await? {
            OpOutcome::RecoveryServed { reply } => Ok(reply),
            _ => logged_err!(self.id; "unexpected outcome for Recovery op"),
        }
    }

    /// Handler of ViewChange request from a view-change initiator.
    pub async fn handle_view_change(
        self: &Arc<Self>,
        args: ViewChangeArgs,
    ) -> Result<ViewChangeReply, ViewstampedError> {
        pf_trace!(self.id; "received ViewChange for view {}", args.view);
        match self.submit(StateOp::ViewChange { args }).await? {
            OpOutcome::ViewChangeVoted { reply } => Ok(reply),
            _ => logged_err!(self.id; "unexpected outcome for ViewChange op"),
        }
    }

    /// Handler of StartView announcement from the new view's primary.
    pub async fn handle_start_view(
        self: &Arc<Self>,
        args: StartViewArgs,
    ) -> Result<(), ViewstampedError> {
        pf_trace!(self.id; "received StartView for view {}", args.view);
        match self.submit(StateOp::StartView { args }).await? {
            OpOutcome::StartViewDone => Ok(()),
            _ => logged_err!(self.id; "unexpected outcome for StartView op"),
        }
    }
}
