//! Recovery (catch-up) requester logic.
//!
//! A replica lands here when it notices it is missing entries (a Prepare
//! for an index beyond its log), when it missed a completed view change,
//! or when freshly (re)joining the cluster.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::replica::applier::{OpOutcome, StateOp};
use crate::replica::messages::{PeerReply, PeerRequest, RecoveryArgs};
use crate::replica::{primary_of, Replica};
use crate::utils::ViewstampedError;

use tokio::time::{sleep, Duration};

// Replica recovery requester logic
impl Replica {
    /// Explicitly enters Recovering status and kicks off catch-up in the
    /// background. Meant for replicas that (re)joined with a stale log;
    /// the Prepare handler triggers the same machinery on its own when it
    /// detects a gap.
    pub async fn start_recovery(
        self: &Arc<Self>,
    ) -> Result<(), ViewstampedError> {
        self.submit(StateOp::BeginRecovery).await?;
        self.spawn_recovery();
        Ok(())
    }

    /// Spawns the catch-up task unless one is already in flight.
    pub(crate) fn spawn_recovery(self: &Arc<Self>) {
        if self.recovering.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.run_recovery().await {
                pf_warn!(this.id; "recovery gave up: {}", e);
            }
            this.recovering.store(false, Ordering::SeqCst);
        });
    }

    /// Pulls the authoritative log from the believed-current primary,
    /// retrying with backoff up to `max_recovery_rounds` times. The
    /// believed primary is re-read every round, since concurrent view
    /// changes may move it while we retry.
    async fn run_recovery(
        self: &Arc<Self>,
    ) -> Result<(), ViewstampedError> {
        for round in 0..self.config.max_recovery_rounds {
            if round > 0 {
                sleep(Duration::from_millis(
                    self.config.recovery_backoff_ms,
                ))
                .await;
            }

            let (view, normal) = self.view_status();
            if normal {
                // a StartView installed a fresh log while we were waiting
                return Ok(());
            }
            let primary = primary_of(view, self.population);
            if primary == self.id {
                // cannot pull from myself; a view change must intervene
                continue;
            }

            let req = PeerRequest::Recovery(RecoveryArgs {
                view,
                requester: self.id,
            });
            let reply = match self.transport.call(primary, req).await {
                Ok(PeerReply::Recovery(reply)) if reply.success => reply,
                _ => continue, // refused or delivery failure; re-target
            };

            match self
                .submit(StateOp::InstallRecovered {
                    view: reply.view,
                    entries: reply.entries,
                    primary_commit: reply.primary_commit,
                })
                .await?
            {
                OpOutcome::Installed => {
                    pf_info!(self.id; "recovered into view {}", reply.view);
                    return Ok(());
                }
                _ => continue, // reply went stale in flight
            }
        }

        logged_err!(self.id; "recovery exhausted {} rounds",
                             self.config.max_recovery_rounds)
    }
}
