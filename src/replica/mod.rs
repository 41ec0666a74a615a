//! Replication protocol: primary-backup Viewstamped Replication.
//!
//! The primary of the current view (`view mod population`) assigns log
//! indices to proposed commands and replicates them to backups through the
//! Prepare protocol, committing on majority quorum. Suspected primary
//! failure is survived through the ViewChange/StartView protocol, which
//! elects the next view's primary and reconciles divergent logs. Replicas
//! that fell behind catch up through the Recovery protocol. References:
//!   - <https://pmg.csail.mit.edu/papers/vr-revisited.pdf>
//!   - <https://dl.acm.org/doi/10.1145/62546.62549>

mod applier;
mod leadership;
mod messages;
mod recovery;
mod request;
mod state;

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use crate::transport::PeerTransport;
use crate::utils::ViewstampedError;

pub use crate::replica::messages::{
    PeerReply, PeerRequest, PrepareArgs, PrepareReply, RecoveryArgs,
    RecoveryReply, StartViewArgs, ViewChangeArgs, ViewChangeReply,
};

use crate::replica::applier::Submission;
use crate::replica::state::ReplicaState;

use bytes::Bytes;

use serde::{Deserialize, Serialize};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Server replica ID type.
pub type ReplicaId = u8;

/// Opaque command payload carried in log entries. The replication layer
/// never inspects its content, only indices and views.
pub type Command = Bytes;

/// Replica lifecycle status.
#[derive(
    Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize,
)]
pub enum Status {
    /// Actively replicating in the current view.
    Normal,
    /// Participating in an in-progress view change.
    ViewChange,
    /// Catching up the log through the Recovery protocol.
    Recovering,
}

/// Returns the ID of the designated primary of given view (given the total
/// number of replica servers).
#[inline]
pub fn primary_of(view: u64, population: u8) -> ReplicaId {
    (view % population as u64) as ReplicaId
}

/// Majority quorum size for a cluster of given population.
#[inline]
pub fn quorum_size(population: u8) -> u8 {
    (population / 2) + 1
}

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicaConfig {
    /// Capacity of the state-op hand-off channel.
    pub chan_apply_cap: usize,

    /// Max number of view-change rounds per initiation before giving up.
    pub max_view_change_rounds: usize,

    /// Min backoff between view-change rounds in millisecs.
    pub view_change_backoff_min_ms: u64,
    /// Max backoff between view-change rounds in millisecs.
    pub view_change_backoff_max_ms: u64,

    /// Max number of recovery rounds per trigger before giving up.
    pub max_recovery_rounds: usize,

    /// Backoff between recovery rounds in millisecs.
    pub recovery_backoff_ms: u64,
}

#[allow(clippy::derivable_impls)]
impl Default for ReplicaConfig {
    fn default() -> Self {
        ReplicaConfig {
            chan_apply_cap: 4096,
            max_view_change_rounds: 8,
            view_change_backoff_min_ms: 20,
            view_change_backoff_max_ms: 150,
            max_recovery_rounds: 8,
            recovery_backoff_ms: 20,
        }
    }
}

/// Viewstamped replication server replica module.
pub struct Replica {
    /// My replica ID in cluster.
    id: ReplicaId,

    /// Total number of replicas in cluster.
    population: u8,

    /// Majority quorum size.
    quorum_cnt: u8,

    /// Configuration parameters struct.
    config: ReplicaConfig,

    /// Point-to-point call primitive to peers.
    transport: Arc<dyn PeerTransport>,

    /// Protocol state; mutated only by the applier task, read directly by
    /// the query surface.
    state: Arc<Mutex<ReplicaState>>,

    /// Sender side of the state-op hand-off channel.
    tx_apply: mpsc::Sender<Submission>,

    /// Termination signal to the applier task.
    tx_term: watch::Sender<bool>,

    /// Join handle of the applier task, taken at shutdown.
    applier_handle: Mutex<Option<JoinHandle<()>>>,

    /// Whether a recovery task is currently in flight.
    recovering: AtomicBool,
}

impl Replica {
    /// Creates a new replica module and spawns its applier task. The
    /// replica starts Normal in `starting_view` with a sentinel-only log.
    pub async fn new_and_setup(
        id: ReplicaId,
        population: u8,
        starting_view: u64,
        transport: Arc<dyn PeerTransport>,
        config_str: Option<&str>,
    ) -> Result<Arc<Self>, ViewstampedError> {
        if population == 0 || id >= population {
            return logged_err!(id; "invalid replica ID {} in population {}",
                                   id, population);
        }

        // parse protocol-specific configs
        let config = parsed_config!(config_str => ReplicaConfig;
                                    chan_apply_cap, max_view_change_rounds,
                                    view_change_backoff_min_ms,
                                    view_change_backoff_max_ms,
                                    max_recovery_rounds,
                                    recovery_backoff_ms)?;
        if config.chan_apply_cap == 0 {
            return logged_err!(id; "invalid config.chan_apply_cap '{}'",
                                   config.chan_apply_cap);
        }
        if config.view_change_backoff_min_ms
            > config.view_change_backoff_max_ms
        {
            return logged_err!(id; "invalid view-change backoff range {}-{}",
                                   config.view_change_backoff_min_ms,
                                   config.view_change_backoff_max_ms);
        }

        let state = Arc::new(Mutex::new(ReplicaState::new(
            id,
            population,
            starting_view,
        )));

        let (tx_apply, rx_apply) = mpsc::channel(config.chan_apply_cap);
        let (tx_term, rx_term) = watch::channel(false);
        let applier_handle = tokio::spawn(Self::applier_task(
            id,
            state.clone(),
            rx_apply,
            rx_term,
        ));

        Ok(Arc::new(Replica {
            id,
            population,
            quorum_cnt: quorum_size(population),
            config,
            transport,
            state,
            tx_apply,
            tx_term,
            applier_handle: Mutex::new(Some(applier_handle)),
            recovering: AtomicBool::new(false),
        }))
    }

    /// My replica ID.
    pub fn id(&self) -> ReplicaId {
        self.id
    }

    /// Total number of replicas in cluster.
    pub fn population(&self) -> u8 {
        self.population
    }

    /// Returns my current view and whether my status is Normal in it.
    pub fn view_status(&self) -> (u64, bool) {
        let state = self.state.lock().expect("replica state lock poisoned");
        (state.view(), state.status() == Status::Normal)
    }

    /// Whether the given log index is considered committed by this replica.
    pub fn is_committed(&self, index: usize) -> bool {
        let state = self.state.lock().expect("replica state lock poisoned");
        state.commit_idx() >= index
    }

    /// Returns the command replicated at given log index, or `None` if my
    /// log is shorter than that.
    pub fn entry_at(&self, index: usize) -> Option<Command> {
        let state = self.state.lock().expect("replica state lock poisoned");
        state.entry_at(index)
    }

    /// Halts background processing: stops admitting new operations, drains
    /// those already queued, and waits for the applier task to exit.
    pub async fn shutdown(&self) -> Result<(), ViewstampedError> {
        self.tx_term.send(true)?;
        let handle = self
            .applier_handle
            .lock()
            .expect("applier handle lock poisoned")
            .take();
        if let Some(handle) = handle {
            handle.await?;
            pf_info!(self.id; "replica shut down");
        }
        Ok(())
    }
}

#[cfg(test)]
mod replica_tests {
    use super::*;
    use crate::transport::LocalNetwork;

    use tokio::time::Duration;

    #[test]
    fn primary_designation() {
        assert_eq!(primary_of(0, 3), 0);
        assert_eq!(primary_of(1, 3), 1);
        assert_eq!(primary_of(3, 3), 0);
        assert_eq!(primary_of(7, 5), 2);
    }

    #[test]
    fn quorum_thresholds() {
        assert_eq!(quorum_size(3), 2);
        assert_eq!(quorum_size(4), 3);
        assert_eq!(quorum_size(5), 3);
        assert_eq!(quorum_size(7), 4);
    }

    #[tokio::test]
    async fn setup_and_query_surface() -> Result<(), ViewstampedError> {
        let net = LocalNetwork::new(3, Duration::from_millis(100));
        let replica = Replica::new_and_setup(
            0,
            3,
            0,
            net.endpoint(0),
            Some("max_recovery_rounds = 3"),
        )
        .await?;
        assert_eq!(replica.id(), 0);
        assert_eq!(replica.view_status(), (0, true));
        assert!(replica.is_committed(0));
        assert!(!replica.is_committed(1));
        assert_eq!(replica.entry_at(0), Some(Command::new()));
        assert_eq!(replica.entry_at(1), None);
        replica.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn setup_rejects_bad_args() {
        let net = LocalNetwork::new(3, Duration::from_millis(100));
        assert!(Replica::new_and_setup(3, 3, 0, net.endpoint(0), None)
            .await
            .is_err());
        assert!(Replica::new_and_setup(
            0,
            3,
            0,
            net.endpoint(0),
            Some("chan_apply_cap = 0")
        )
        .await
        .is_err());
        assert!(Replica::new_and_setup(
            0,
            3,
            0,
            net.endpoint(0),
            Some("no_such_field = 1")
        )
        .await
        .is_err());
    }

    #[tokio::test]
    async fn shutdown_refuses_new_work() -> Result<(), ViewstampedError> {
        let net = LocalNetwork::new(3, Duration::from_millis(100));
        let replica =
            Replica::new_and_setup(0, 3, 0, net.endpoint(0), None).await?;
        replica.shutdown().await?;
        assert!(replica.propose(Command::from("x")).await.is_err());
        Ok(())
    }
}
