//! Primary-side client proposal path.

use std::sync::Arc;

use crate::replica::applier::{OpOutcome, StateOp};
use crate::replica::messages::{PeerReply, PeerRequest, PrepareArgs};
use crate::replica::{Command, Replica};
use crate::utils::{Bitmap, ViewstampedError};

use futures::stream::{FuturesUnordered, StreamExt};

// Replica client request handling
impl Replica {
    /// Proposes a new command for replication. Assigns the next log index,
    /// broadcasts Prepare to all backups in parallel, and returns the index
    /// once a majority quorum (counting myself) has acknowledged, without
    /// waiting for stragglers. Fails if I am not the Normal primary, if the
    /// view moves on mid-flight, or if quorum cannot be gathered; the
    /// caller retries with updated parameters.
    pub async fn propose(
        self: &Arc<Self>,
        entry: Command,
    ) -> Result<usize, ViewstampedError> {
        let (view, index, primary_commit) =
            match self.submit(StateOp::Append {
                entry: entry.clone(),
            })
            .await?
            {
                OpOutcome::Appended {
                    view,
                    index,
                    primary_commit,
                } => (view, index, primary_commit),
                _ => {
                    return logged_err!(self.id; "cannot propose: not the \
                                                 Normal primary");
                }
            };
        pf_debug!(self.id; "proposing entry at idx {} in view {}",
                           index, view);

        let args = PrepareArgs {
            view,
            primary_commit,
            index,
            entry,
        };
        let mut calls = FuturesUnordered::new();
        for peer in (0..self.population).filter(|&p| p != self.id) {
            let transport = self.transport.clone();
            let req = PeerRequest::Prepare(args.clone());
            calls.push(async move { (peer, transport.call(peer, req).await) });
        }

        // my own log already holds the entry, so I count as one vote
        let mut acks = Bitmap::new(self.population);
        acks.set(self.id, true)?;
        while acks.count() < self.quorum_cnt {
            let Some((peer, result)) = calls.next().await else {
                break;
            };
            match result {
                Ok(PeerReply::Prepare(reply)) if reply.success => {
                    if reply.view == view {
                        acks.set(peer, true)?;
                    }
                }
                Ok(PeerReply::Prepare(reply)) if reply.view > view => {
                    // a newer view exists; abandon the proposal and join it
                    // rather than committing under a dead primacy
                    self.submit(StateOp::AdoptView { view: reply.view })
                        .await?;
                    return logged_err!(self.id; "proposal for idx {} \
                                                 abandoned: view {} \
                                                 supersedes {}",
                                                index, reply.view, view);
                }
                _ => {} // rejection or delivery failure: no vote
            }
        }

        if acks.count() < self.quorum_cnt {
            return logged_err!(self.id; "proposal for idx {} got {} acks, \
                                         quorum is {}",
                                        index, acks.count(),
                                        self.quorum_cnt);
        }

        match self.submit(StateOp::AdvanceCommit { view, index }).await? {
            OpOutcome::Committed => {
                pf_debug!(self.id; "committed idx {} in view {}",
                                   index, view);
                Ok(index)
            }
            _ => logged_err!(self.id; "view moved past {} before idx {} \
                                       could commit", view, index),
        }
    }
}
