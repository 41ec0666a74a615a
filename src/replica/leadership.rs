//! View-change initiator logic.
//!
//! Detection of a failed primary (e.g. by heartbeat timeout) is the
//! caller's concern; this module takes over once suspicion is raised.

use std::sync::Arc;

use crate::replica::applier::{OpOutcome, StateOp};
use crate::replica::messages::{
    PeerReply, PeerRequest, StartViewArgs, ViewChangeArgs,
};
use crate::replica::{Command, Replica};
use crate::utils::{Bitmap, ViewstampedError};

use futures::stream::{FuturesUnordered, StreamExt};

use rand::Rng;

use tokio::time::{sleep, Duration};

// Replica view-change initiator logic
impl Replica {
    /// Drives a view change until some view above the current one reaches
    /// Normal status here, retrying with escalating candidate views up to
    /// `max_view_change_rounds` times. Returns the view settled into.
    ///
    /// Each round: adopt the next candidate view, solicit peers' logs with
    /// ViewChange, and once a quorum (counting myself) has joined, announce
    /// the most authoritative of their logs with StartView. I install the
    /// new view locally only after a quorum has received the announcement;
    /// until then my status stays ViewChange and `propose` refuses, so no
    /// client proposal can slip in under an unacknowledged primacy.
    pub async fn start_view_change(
        self: &Arc<Self>,
    ) -> Result<u64, ViewstampedError> {
        for round in 0..self.config.max_view_change_rounds {
            if round > 0 {
                self.backoff().await;
                // a competing initiator may have completed a view change
                // for us in the meantime
                let (view, normal) = self.view_status();
                if normal {
                    return Ok(view);
                }
            }

            let (candidate, last_normal_view, log) =
                match self.submit(StateOp::BeginViewChange).await? {
                    OpOutcome::ViewChangeBegun {
                        candidate,
                        last_normal_view,
                        log,
                    } => (candidate, last_normal_view, log),
                    _ => {
                        return logged_err!(self.id; "unexpected outcome \
                                                     for BeginViewChange \
                                                     op");
                    }
                };
            pf_info!(self.id; "initiating view change into view {}",
                              candidate);

            let Some((best_log, joined)) = self
                .collect_view_change_quorum(candidate, last_normal_view, log)
                .await?
            else {
                pf_debug!(self.id; "view change round for view {} failed \
                                    to gather quorum", candidate);
                continue;
            };
            pf_debug!(self.id; "view {} quorum joined: {:?}",
                               candidate, joined);

            if !self.announce_start_view(candidate, best_log.clone()).await?
            {
                pf_debug!(self.id; "StartView for view {} failed to reach \
                                    quorum", candidate);
                continue;
            }

            match self
                .submit(StateOp::InstallView {
                    view: candidate,
                    log: best_log,
                })
                .await?
            {
                OpOutcome::Installed => {
                    pf_info!(self.id; "started view {}", candidate);
                    return Ok(candidate);
                }
                // an even higher view won the race; let its primary lead
                _ => continue,
            }
        }

        logged_err!(self.id; "view change failed after {} rounds",
                             self.config.max_view_change_rounds)
    }

    /// Broadcasts ViewChange for the candidate view and collects replies
    /// until a quorum (counting myself) has joined. Returns the most
    /// authoritative log seen, or `None` on insufficient quorum.
    async fn collect_view_change_quorum(
        self: &Arc<Self>,
        candidate: u64,
        my_last_normal_view: u64,
        my_log: Vec<Command>,
    ) -> Result<Option<(Vec<Command>, Bitmap)>, ViewstampedError> {
        let mut calls = FuturesUnordered::new();
        for peer in (0..self.population).filter(|&p| p != self.id) {
            let transport = self.transport.clone();
            let req = PeerRequest::ViewChange(ViewChangeArgs {
                view: candidate,
            });
            calls.push(async move { (peer, transport.call(peer, req).await) });
        }

        let mut joined = Bitmap::new(self.population);
        joined.set(self.id, true)?;
        let mut contributions = vec![(my_last_normal_view, my_log)];
        while joined.count() < self.quorum_cnt {
            let Some((peer, result)) = calls.next().await else {
                break;
            };
            if let Ok(PeerReply::ViewChange(reply)) = result {
                if reply.success {
                    joined.set(peer, true)?;
                    contributions.push((reply.last_normal_view, reply.log));
                }
            }
        }

        if joined.count() < self.quorum_cnt {
            return Ok(None);
        }
        Ok(Some((select_authoritative(contributions), joined)))
    }

    /// Broadcasts StartView carrying the new view's log; true once a
    /// quorum of replicas (counting myself) has received it.
    async fn announce_start_view(
        self: &Arc<Self>,
        view: u64,
        log: Vec<Command>,
    ) -> Result<bool, ViewstampedError> {
        let mut calls = FuturesUnordered::new();
        for peer in (0..self.population).filter(|&p| p != self.id) {
            let transport = self.transport.clone();
            let req = PeerRequest::StartView(StartViewArgs {
                view,
                log: log.clone(),
            });
            calls.push(async move { transport.call(peer, req).await });
        }

        let mut delivered: u8 = 1; // myself
        while delivered < self.quorum_cnt {
            let Some(result) = calls.next().await else {
                break;
            };
            if let Ok(PeerReply::StartView) = result {
                delivered += 1;
            }
        }
        Ok(delivered >= self.quorum_cnt)
    }

    /// Sleeps a randomized duration between view-change rounds so that
    /// competing initiators desynchronize.
    async fn backoff(&self) {
        let ms = rand::thread_rng().gen_range(
            self.config.view_change_backoff_min_ms
                ..=self.config.view_change_backoff_max_ms,
        );
        sleep(Duration::from_millis(ms)).await;
    }
}

/// Picks the new view's log from the quorum's contributions: the log of the
/// replica that was Normal most recently reflects the most fully-prepared
/// state and is guaranteed to contain every previously committed entry.
/// Ties are broken arbitrarily, as equal `last_normal_view`s imply logs
/// that agree up to the commit point.
fn select_authoritative(
    contributions: Vec<(u64, Vec<Command>)>,
) -> Vec<Command> {
    debug_assert!(!contributions.is_empty());
    let mut best_last_normal = 0;
    let mut best_log = vec![];
    for (last_normal_view, log) in contributions {
        if best_log.is_empty() || last_normal_view > best_last_normal {
            best_last_normal = last_normal_view;
            best_log = log;
        }
    }
    best_log
}

#[cfg(test)]
mod leadership_tests {
    use super::*;

    fn entry(s: &str) -> Command {
        Command::from(s.as_bytes().to_vec())
    }

    #[test]
    fn most_recently_normal_log_wins() {
        // the replica that stayed Normal into view 2 holds the only log
        // guaranteed to contain everything committed; a regression to
        // picking the least recently Normal log would lose entry "y"
        let stale = vec![Command::new(), entry("x")];
        let fresh = vec![Command::new(), entry("x"), entry("y")];
        let picked = select_authoritative(vec![
            (0, stale.clone()),
            (2, fresh.clone()),
            (1, stale.clone()),
        ]);
        assert_eq!(picked, fresh);
    }

    #[test]
    fn tie_keeps_some_candidate() {
        let log_a = vec![Command::new(), entry("x")];
        let log_b = vec![Command::new(), entry("x")];
        let picked =
            select_authoritative(vec![(1, log_a.clone()), (1, log_b)]);
        assert_eq!(picked, log_a);
    }
}

