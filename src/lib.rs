//! Viewstamped: primary-backup state machine replication.
//!
//! A cluster of replicas maintains an identical ordered log of opaque
//! commands. The primary of the current view orders new entries and
//! commits them on majority quorum; backups acknowledge entries consistent
//! with their view. The cluster survives primary failure through the
//! ViewChange/StartView protocol and brings lagging replicas back up to
//! date through the Recovery protocol.
//!
//! The transport is an external collaborator: anything implementing
//! [`PeerTransport`] can carry the (serde-ready) peer messages. The
//! in-process [`LocalNetwork`] implementation connects a cluster within
//! one process and supports crash and partition injection.

#[macro_use]
mod utils;

mod replica;
mod transport;

pub use crate::replica::{
    primary_of, quorum_size, Command, PeerReply, PeerRequest, PrepareArgs,
    PrepareReply, RecoveryArgs, RecoveryReply, Replica, ReplicaConfig,
    ReplicaId, StartViewArgs, Status, ViewChangeArgs, ViewChangeReply,
};
pub use crate::transport::{LocalEndpoint, LocalNetwork, PeerTransport};
pub use crate::utils::{logger_init, Bitmap, ViewstampedError};
