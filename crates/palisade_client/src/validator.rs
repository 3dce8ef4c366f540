//! Phase1 vote aggregation state machine.
//!
//! Folds one group's Phase1 votes into a decision state. A committed
//! conflict is terminal immediately (the conflict proof alone justifies a
//! fast abort); unanimous prefixes resolve fast; mixed vote sets go
//! tentative and wait for either the full reply set or the decision timer.

use palisade_engine::engine::{CcResult, Config};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase1ValidationState {
    NotEnough,
    FastCommit,
    FastAbort,
    FastAbstain,
    SlowCommitTentative,
    SlowAbortTentative,
    SlowCommitFinal,
    SlowAbortFinal,
    Equivocate,
}

impl Phase1ValidationState {
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            Self::NotEnough | Self::SlowCommitTentative | Self::SlowAbortTentative
        )
    }
}

/// Vote counter for one (request, group) pair.
#[derive(Debug)]
pub struct Phase1Validator {
    n: usize,
    fast_quorum: usize,
    /// Both commit-and-abort slow proofs reachable means a byzantine client
    /// could equivocate; only reported when the simulation asks for it.
    equivocation_enabled: bool,
    commits: usize,
    /// ABSTAIN plus ABORT votes without a conflict proof.
    abstains: usize,
    conflict_abort: bool,
    state: Phase1ValidationState,
}

impl Phase1Validator {
    pub fn new(config: &Config, equivocation_enabled: bool) -> Self {
        Self {
            n: config.n() as usize,
            fast_quorum: config.fast_quorum(),
            equivocation_enabled,
            commits: 0,
            abstains: 0,
            conflict_abort: false,
            state: Phase1ValidationState::NotEnough,
        }
    }

    pub fn state(&self) -> Phase1ValidationState {
        self.state
    }

    pub fn commits(&self) -> usize {
        self.commits
    }

    pub fn abstains(&self) -> usize {
        self.abstains
    }

    /// The decision this vote set currently leans toward.
    pub fn tentative_decision(&self) -> bool {
        self.commits >= self.fast_quorum
    }

    /// Fold in one vote; returns the updated state.
    pub fn process_vote(
        &mut self,
        result: CcResult,
        has_conflict: bool,
    ) -> Phase1ValidationState {
        if self.state.is_terminal() {
            return self.state;
        }
        match result {
            CcResult::Commit => self.commits += 1,
            CcResult::Abstain => self.abstains += 1,
            CcResult::Abort => {
                if has_conflict {
                    self.conflict_abort = true;
                } else {
                    self.abstains += 1;
                }
            }
            // WAIT votes are never sent; treat one as an abstain if a
            // byzantine replica emits it anyway.
            CcResult::Wait => self.abstains += 1,
        }
        self.state = self.evaluate();
        self.state
    }

    fn evaluate(&self) -> Phase1ValidationState {
        use Phase1ValidationState::*;

        if self.conflict_abort {
            return FastAbort;
        }
        let received = self.commits + self.abstains;
        let fq = self.fast_quorum;

        if self.equivocation_enabled && self.commits >= fq && self.abstains >= fq {
            return Equivocate;
        }
        if received >= self.n {
            // With n = 5f+1 one side always clears f+1.
            return if self.commits >= fq {
                SlowCommitFinal
            } else {
                SlowAbortFinal
            };
        }
        if self.commits >= fq && self.abstains == 0 {
            return FastCommit;
        }
        if self.abstains >= fq && self.commits == 0 {
            return FastAbstain;
        }
        if self.commits >= fq {
            return SlowCommitTentative;
        }
        if self.abstains >= fq {
            return SlowAbortTentative;
        }
        NotEnough
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            f: 1,
            ..Config::default()
        }
    }

    #[test]
    fn unanimous_commit_prefix_resolves_fast() {
        let mut v = Phase1Validator::new(&config(), false);
        assert_eq!(
            v.process_vote(CcResult::Commit, false),
            Phase1ValidationState::NotEnough
        );
        assert_eq!(
            v.process_vote(CcResult::Commit, false),
            Phase1ValidationState::FastCommit
        );
        // Terminal state latches.
        assert_eq!(
            v.process_vote(CcResult::Abstain, false),
            Phase1ValidationState::FastCommit
        );
    }

    #[test]
    fn conflict_abort_is_immediately_terminal() {
        let mut v = Phase1Validator::new(&config(), false);
        v.process_vote(CcResult::Commit, false);
        assert_eq!(
            v.process_vote(CcResult::Abort, true),
            Phase1ValidationState::FastAbort
        );
    }

    #[test]
    fn mixed_votes_go_tentative_then_final() {
        let mut v = Phase1Validator::new(&config(), false);
        v.process_vote(CcResult::Abstain, false);
        v.process_vote(CcResult::Commit, false);
        assert_eq!(
            v.process_vote(CcResult::Commit, false),
            Phase1ValidationState::SlowCommitTentative
        );
        v.process_vote(CcResult::Commit, false);
        v.process_vote(CcResult::Commit, false);
        // Sixth reply completes the set: final slow commit.
        assert_eq!(
            v.process_vote(CcResult::Commit, false),
            Phase1ValidationState::SlowCommitFinal
        );
    }

    #[test]
    fn abstain_only_prefix_resolves_fast_abstain() {
        let mut v = Phase1Validator::new(&config(), false);
        v.process_vote(CcResult::Abstain, false);
        assert_eq!(
            v.process_vote(CcResult::Abstain, false),
            Phase1ValidationState::FastAbstain
        );
    }

    #[test]
    fn equivocation_surface_requires_both_quorums() {
        let mut v = Phase1Validator::new(&config(), true);
        v.process_vote(CcResult::Commit, false);
        v.process_vote(CcResult::Commit, false);
        v.process_vote(CcResult::Abstain, false);
        assert_eq!(
            v.process_vote(CcResult::Abstain, false),
            Phase1ValidationState::Equivocate
        );
    }
}
