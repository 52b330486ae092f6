/// Floor for the leader heartbeat period derived from the election
/// timeout (`election_timeout / 10`, but never below this).
pub(crate) const MIN_HEARTBEAT_PERIOD_MS: u64 = 10;

/// Floor for the candidate vote-retry timer base.
pub(crate) const MIN_VOTE_TIMEOUT_MS: u64 = 1;
