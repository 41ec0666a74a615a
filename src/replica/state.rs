//! Replicated state core: the command log plus view/status tracking.
//!
//! All transitions here are synchronous and infallible; a transition that is
//! illegal in the current state (e.g. adopting a stale view) is refused as a
//! no-op, since staleness is an expected condition between replicas. Callers
//! inspect the returned outcome to decide what to do next. The applier task
//! is the only writer, so no method ever observes a half-applied transition.

use crate::replica::messages::{
    PrepareArgs, PrepareReply, RecoveryArgs, RecoveryReply, StartViewArgs,
    ViewChangeArgs, ViewChangeReply,
};
use crate::replica::{primary_of, Command, ReplicaId, Status};

/// Per-replica protocol state. Owned behind a mutex; mutated only through
/// the single-flight applier, read directly by the query surface.
pub(crate) struct ReplicaState {
    /// My replica ID.
    id: ReplicaId,

    /// Total number of replicas in cluster.
    population: u8,

    /// What this replica believes to be the current active view.
    view: u64,

    /// Current lifecycle status.
    status: Status,

    /// The latest view in which this replica had Normal status. Serves as
    /// the authority signal during view changes.
    last_normal_view: u64,

    /// The log of commands. Index 0 holds a sentinel entry so that real
    /// commands start at index 1 and "no entries yet" never needs a flag.
    log: Vec<Command>,

    /// All log entries at or below this index are considered committed.
    commit_idx: usize,
}

impl ReplicaState {
    /// Creates the state a replica boots with: Normal in the starting view,
    /// a sentinel-only log, and nothing committed beyond the sentinel.
    pub(crate) fn new(
        id: ReplicaId,
        population: u8,
        starting_view: u64,
    ) -> Self {
        ReplicaState {
            id,
            population,
            view: starting_view,
            status: Status::Normal,
            last_normal_view: starting_view,
            log: vec![Command::new()],
            commit_idx: 0,
        }
    }

    /// Whether I am the designated primary of my current view.
    #[inline]
    pub(crate) fn is_primary(&self) -> bool {
        primary_of(self.view, self.population) == self.id
    }

    #[inline]
    pub(crate) fn view(&self) -> u64 {
        self.view
    }

    #[inline]
    pub(crate) fn status(&self) -> Status {
        self.status
    }

    #[inline]
    pub(crate) fn commit_idx(&self) -> usize {
        self.commit_idx
    }

    /// Returns the command at given log index, or `None` if the log is
    /// shorter than that.
    pub(crate) fn entry_at(&self, index: usize) -> Option<Command> {
        self.log.get(index).cloned()
    }

    /// Adopts a strictly higher view and joins its view change. Refused
    /// (returning false) for any view at or below the current one.
    pub(crate) fn adopt_higher_view(&mut self, view: u64) -> bool {
        if view <= self.view {
            return false;
        }
        self.view = view;
        self.status = Status::ViewChange;
        true
    }

    /// Settles into the given view with Normal status, remembering it as
    /// the latest normally-operating view.
    fn enter_normal(&mut self, view: u64) {
        debug_assert!(view >= self.view);
        self.view = view;
        self.status = Status::Normal;
        self.last_normal_view = view;
    }

    /// Marks this replica as catching up. View is left untouched; recovery
    /// adopts the primary's view once a reply arrives.
    pub(crate) fn begin_recovering(&mut self) {
        self.status = Status::Recovering;
    }

    /// Primary-side admission of a new command: assigns the next log index
    /// and appends locally. Refused unless I am the Normal primary. Returns
    /// the view, the assigned index, and my commit index for the Prepare
    /// broadcast.
    pub(crate) fn append(
        &mut self,
        entry: Command,
    ) -> Option<(u64, usize, usize)> {
        if self.status != Status::Normal || !self.is_primary() {
            return None;
        }
        let index = self.log.len();
        self.log.push(entry);
        Some((self.view, index, self.commit_idx))
    }

    /// Primary-side commit advancement after a quorum of Prepare acks.
    /// Backups accept entries only in index order, so an ack for `index`
    /// vouches for every lower index as well; the watermark moves straight
    /// to `index`. Refused if the view moved on in the meantime.
    pub(crate) fn advance_commit(&mut self, view: u64, index: usize) -> bool {
        if view != self.view
            || self.status != Status::Normal
            || index >= self.log.len()
        {
            return false;
        }
        if index > self.commit_idx {
            self.commit_idx = index;
        }
        true
    }

    /// Backup-side handling of a Prepare request. Returns the reply plus
    /// whether this replica must now catch up via the Recovery protocol.
    pub(crate) fn handle_prepare(
        &mut self,
        args: PrepareArgs,
    ) -> (PrepareReply, bool) {
        if args.view < self.view {
            // stale primary
            return (self.prepare_reject(), false);
        }
        if args.view > self.view {
            // a view change completed without me; my log may have diverged
            // in the dead view, so catch up before accepting anything
            self.view = args.view;
            self.status = Status::Recovering;
            return (self.prepare_reject(), true);
        }
        if self.status != Status::Normal {
            return (self.prepare_reject(), false);
        }
        if args.index != self.log.len() {
            if args.index > self.log.len() {
                // missing earlier entries
                self.status = Status::Recovering;
                return (self.prepare_reject(), true);
            }
            // duplicate or out-of-date index
            return (self.prepare_reject(), false);
        }

        self.log.push(args.entry);
        let bound = args.primary_commit.min(self.log.len() - 1);
        if bound > self.commit_idx {
            self.commit_idx = bound;
        }
        (
            PrepareReply {
                view: self.view,
                success: true,
            },
            false,
        )
    }

    fn prepare_reject(&self) -> PrepareReply {
        PrepareReply {
            view: self.view,
            success: false,
        }
    }

    /// Starts a view change on my side: picks the candidate view right
    /// after my current one, adopts it, and hands back my log and latest
    /// normal view as my own contribution to the quorum.
    pub(crate) fn begin_view_change(&mut self) -> (u64, u64, Vec<Command>) {
        let candidate = self.view + 1;
        self.adopt_higher_view(candidate);
        (candidate, self.last_normal_view, self.log.clone())
    }

    /// Handling of a ViewChange request from an initiator. Joining a higher
    /// view surrenders my whole log for the initiator to consider.
    pub(crate) fn handle_view_change(
        &mut self,
        args: ViewChangeArgs,
    ) -> ViewChangeReply {
        if self.adopt_higher_view(args.view) {
            ViewChangeReply {
                last_normal_view: self.last_normal_view,
                log: self.log.clone(),
                success: true,
            }
        } else {
            ViewChangeReply {
                last_normal_view: 0,
                log: vec![],
                success: false,
            }
        }
    }

    /// Handling of a StartView announcement carrying the new view's log.
    pub(crate) fn handle_start_view(&mut self, args: StartViewArgs) {
        self.install_view(args.view, args.log);
    }

    /// Installs the authoritative log of a newly-decided view and becomes
    /// Normal in it. Ignored for stale views, and for the current view once
    /// already Normal in it (a re-delivered announcement must not truncate
    /// entries prepared since installation).
    pub(crate) fn install_view(
        &mut self,
        view: u64,
        log: Vec<Command>,
    ) -> bool {
        if view < self.view
            || (view == self.view && self.status == Status::Normal)
        {
            return false;
        }
        self.check_covers_commit(log.len());
        self.log = log;
        self.enter_normal(view);
        true
    }

    /// Primary-side handling of a Recovery request: hand over the full log
    /// and commit watermark, provided I am actually the Normal primary and
    /// the requester is not ahead of me.
    pub(crate) fn handle_recovery(
        &mut self,
        args: RecoveryArgs,
    ) -> RecoveryReply {
        if self.status == Status::Normal
            && self.is_primary()
            && args.view <= self.view
        {
            RecoveryReply {
                view: self.view,
                entries: self.log.clone(),
                primary_commit: self.commit_idx,
                success: true,
            }
        } else {
            RecoveryReply {
                view: self.view,
                entries: vec![],
                primary_commit: 0,
                success: false,
            }
        }
    }

    /// Requester-side installation of a successful Recovery reply: adopt
    /// the primary's log, commit watermark, and view. Refused when the
    /// reply is older than what I have since learned.
    pub(crate) fn install_recovered(
        &mut self,
        view: u64,
        entries: Vec<Command>,
        primary_commit: usize,
    ) -> bool {
        if entries.is_empty()
            || view < self.view
            || (view == self.view && self.status == Status::Normal)
        {
            return false;
        }
        self.check_covers_commit(entries.len());
        self.log = entries;
        let bound = primary_commit.min(self.log.len() - 1);
        if bound > self.commit_idx {
            self.commit_idx = bound;
        }
        self.enter_normal(view);
        true
    }

    /// Committed entries are immutable for the lifetime of the process; an
    /// incoming log that does not even reach my commit watermark can only
    /// mean protocol corruption, so fail loudly instead of repairing.
    fn check_covers_commit(&self, incoming_len: usize) {
        if incoming_len <= self.commit_idx {
            pf_error!(self.id; "incoming log of length {} drops committed \
                                entries at or below {}",
                               incoming_len, self.commit_idx);
            panic!(
                "incoming log of length {} drops committed entries at or \
                 below {}",
                incoming_len, self.commit_idx
            );
        }
    }
}

#[cfg(test)]
mod state_tests {
    use super::*;

    fn entry(s: &str) -> Command {
        Command::from(s.as_bytes().to_vec())
    }

    fn prepare(view: u64, primary_commit: usize, index: usize, s: &str) -> PrepareArgs {
        PrepareArgs {
            view,
            primary_commit,
            index,
            entry: entry(s),
        }
    }

    #[test]
    fn boot_state() {
        let state = ReplicaState::new(1, 3, 0);
        assert_eq!(state.view(), 0);
        assert_eq!(state.status(), Status::Normal);
        assert_eq!(state.commit_idx(), 0);
        assert_eq!(state.entry_at(0), Some(Command::new()));
        assert_eq!(state.entry_at(1), None);
        assert!(!state.is_primary());
        assert!(ReplicaState::new(0, 3, 0).is_primary());
    }

    #[test]
    fn view_adoption() {
        let mut state = ReplicaState::new(0, 3, 0);
        assert!(!state.adopt_higher_view(0));
        assert!(state.adopt_higher_view(2));
        assert_eq!(state.view(), 2);
        assert_eq!(state.status(), Status::ViewChange);
        assert!(!state.adopt_higher_view(1));
        assert_eq!(state.view(), 2);
    }

    #[test]
    fn primary_append() {
        let mut state = ReplicaState::new(0, 3, 0);
        assert_eq!(state.append(entry("x")), Some((0, 1, 0)));
        assert_eq!(state.append(entry("y")), Some((0, 2, 0)));
        // backups refuse to self-assign indices
        let mut backup = ReplicaState::new(1, 3, 0);
        assert_eq!(backup.append(entry("x")), None);
        // so does a primary mid view change
        state.adopt_higher_view(5);
        assert_eq!(state.append(entry("z")), None);
    }

    #[test]
    fn commit_advance_in_view() {
        let mut state = ReplicaState::new(0, 3, 0);
        state.append(entry("x"));
        state.append(entry("y"));
        assert!(state.advance_commit(0, 2));
        assert_eq!(state.commit_idx(), 2);
        // later quorum completion for a lower index is fine, and does not
        // move the watermark backwards
        assert!(state.advance_commit(0, 1));
        assert_eq!(state.commit_idx(), 2);
        // different view or out-of-log index refused
        assert!(!state.advance_commit(1, 2));
        assert!(!state.advance_commit(0, 7));
    }

    #[test]
    fn backup_accepts_in_order() {
        let mut state = ReplicaState::new(1, 3, 0);
        let (reply, recover) = state.handle_prepare(prepare(0, 0, 1, "x"));
        assert!(reply.success);
        assert!(!recover);
        assert_eq!(state.commit_idx(), 0);
        // primary's commit watermark piggybacks onto the next Prepare
        let (reply, _) = state.handle_prepare(prepare(0, 1, 2, "y"));
        assert!(reply.success);
        assert_eq!(state.commit_idx(), 1);
        assert_eq!(state.entry_at(1), Some(entry("x")));
        assert_eq!(state.entry_at(2), Some(entry("y")));
    }

    #[test]
    fn backup_commit_bounded_by_log() {
        let mut state = ReplicaState::new(1, 3, 0);
        // primary claims commit 5 but I only hold up to index 1
        let (reply, _) = state.handle_prepare(prepare(0, 5, 1, "x"));
        assert!(reply.success);
        assert_eq!(state.commit_idx(), 1);
    }

    #[test]
    fn backup_rejects_stale_view() {
        let mut state = ReplicaState::new(1, 3, 3);
        let (reply, recover) = state.handle_prepare(prepare(2, 0, 1, "x"));
        assert!(!reply.success);
        assert!(!recover);
        assert_eq!(reply.view, 3);
    }

    #[test]
    fn backup_gap_goes_recovering() {
        let mut state = ReplicaState::new(1, 3, 0);
        let (reply, recover) = state.handle_prepare(prepare(0, 0, 5, "x"));
        assert!(!reply.success);
        assert!(recover);
        assert_eq!(state.status(), Status::Recovering);
    }

    #[test]
    fn backup_duplicate_index_rejected_quietly() {
        let mut state = ReplicaState::new(1, 3, 0);
        state.handle_prepare(prepare(0, 0, 1, "x"));
        let (reply, recover) = state.handle_prepare(prepare(0, 0, 1, "x"));
        assert!(!reply.success);
        assert!(!recover);
        assert_eq!(state.status(), Status::Normal);
    }

    #[test]
    fn backup_future_view_goes_recovering() {
        let mut state = ReplicaState::new(1, 3, 0);
        let (reply, recover) = state.handle_prepare(prepare(4, 0, 1, "x"));
        assert!(!reply.success);
        assert!(recover);
        assert_eq!(state.view(), 4);
        assert_eq!(state.status(), Status::Recovering);
    }

    #[test]
    fn view_change_surrenders_log() {
        let mut state = ReplicaState::new(1, 3, 0);
        state.handle_prepare(prepare(0, 0, 1, "x"));
        let reply = state.handle_view_change(ViewChangeArgs { view: 1 });
        assert!(reply.success);
        assert_eq!(reply.last_normal_view, 0);
        assert_eq!(reply.log.len(), 2);
        assert_eq!(state.status(), Status::ViewChange);
        // an equal-or-lower view is a stale request
        let reply = state.handle_view_change(ViewChangeArgs { view: 1 });
        assert!(!reply.success);
    }

    #[test]
    fn start_view_installs_and_redelivery_is_inert() {
        let mut state = ReplicaState::new(2, 3, 0);
        state.handle_view_change(ViewChangeArgs { view: 1 });
        let log = vec![Command::new(), entry("x")];
        state.handle_start_view(StartViewArgs {
            view: 1,
            log: log.clone(),
        });
        assert_eq!(state.view(), 1);
        assert_eq!(state.status(), Status::Normal);
        // entries prepared after installation survive a re-delivery
        state.handle_prepare(prepare(1, 1, 2, "y"));
        state.handle_start_view(StartViewArgs { view: 1, log });
        assert_eq!(state.entry_at(2), Some(entry("y")));
    }

    #[test]
    #[should_panic]
    fn start_view_dropping_committed_is_fatal() {
        let mut state = ReplicaState::new(1, 3, 0);
        state.handle_prepare(prepare(0, 0, 1, "x"));
        state.handle_prepare(prepare(0, 2, 2, "y"));
        assert_eq!(state.commit_idx(), 2);
        state.handle_start_view(StartViewArgs {
            view: 3,
            log: vec![Command::new(), entry("x")],
        });
    }

    #[test]
    fn recovery_served_by_normal_primary_only() {
        let mut primary = ReplicaState::new(0, 3, 0);
        primary.append(entry("x"));
        primary.advance_commit(0, 1);
        let reply = primary.handle_recovery(RecoveryArgs {
            view: 0,
            requester: 2,
        });
        assert!(reply.success);
        assert_eq!(reply.entries.len(), 2);
        assert_eq!(reply.primary_commit, 1);
        // a requester claiming a future view is refused
        let reply = primary.handle_recovery(RecoveryArgs {
            view: 9,
            requester: 2,
        });
        assert!(!reply.success);
        // backups do not serve recovery
        let mut backup = ReplicaState::new(1, 3, 0);
        let reply = backup.handle_recovery(RecoveryArgs {
            view: 0,
            requester: 2,
        });
        assert!(!reply.success);
    }

    #[test]
    fn recovery_install_catches_up() {
        let mut state = ReplicaState::new(2, 3, 0);
        state.begin_recovering();
        let installed = state.install_recovered(
            1,
            vec![Command::new(), entry("x"), entry("y")],
            2,
        );
        assert!(installed);
        assert_eq!(state.view(), 1);
        assert_eq!(state.status(), Status::Normal);
        assert_eq!(state.commit_idx(), 2);
        assert_eq!(state.entry_at(2), Some(entry("y")));
        // a stale reply arriving late changes nothing
        assert!(!state.install_recovered(0, vec![Command::new()], 0));
    }

    #[test]
    fn view_change_candidates_escalate() {
        let mut state = ReplicaState::new(1, 3, 0);
        let (candidate, last_normal, log) = state.begin_view_change();
        assert_eq!(candidate, 1);
        assert_eq!(last_normal, 0);
        assert_eq!(log.len(), 1);
        let (candidate, _, _) = state.begin_view_change();
        assert_eq!(candidate, 2);
        assert_eq!(state.status(), Status::ViewChange);
    }
}
