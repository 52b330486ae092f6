//! Election ballot and in-flight configuration-change bookkeeping.

use std::collections::HashSet;

use crate::membership::PeerId;

/// Tracks the votes collected during the current election round.
#[derive(Debug, Default)]
pub(crate) struct VoteContext {
    num_peers: usize,
    granted: HashSet<PeerId>,
}

impl VoteContext {
    /// Starts a fresh ballot over `num_peers` voting members.
    pub(crate) fn reset(
        &mut self,
        num_peers: usize,
    ) {
        self.num_peers = num_peers;
        self.granted.clear();
    }

    /// Records `peer`'s grant. Duplicate grants from retried responses
    /// count once.
    pub(crate) fn grant(
        &mut self,
        peer: PeerId,
    ) {
        self.granted.insert(peer);
    }

    /// True once a majority of the ballot's peer set granted.
    pub(crate) fn quorum(&self) -> bool {
        self.granted.len() >= self.num_peers / 2 + 1
    }
}

/// Snapshot of the peer set taken when a configuration change starts;
/// empty whenever no change is in flight.
#[derive(Debug, Default)]
pub(crate) struct ConfigurationCtx {
    peers: Vec<PeerId>,
}

impl ConfigurationCtx {
    pub(crate) fn set(
        &mut self,
        peers: Vec<PeerId>,
    ) {
        self.peers = peers;
    }

    pub(crate) fn reset(&mut self) {
        self.peers.clear();
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub(crate) fn peers(&self) -> &[PeerId] {
        &self.peers
    }
}

#[cfg(test)]
mod vote_context_test {
    use super::*;

    fn peer(port: u16) -> PeerId {
        format!("127.0.0.1:{port}:0").parse().unwrap()
    }

    /// # Case 1: quorum arithmetic over a three-peer ballot, duplicate
    /// grants counted once
    #[test]
    fn test_vote_quorum() {
        let mut ctx = VoteContext::default();
        ctx.reset(3);
        assert!(!ctx.quorum());

        ctx.grant(peer(1));
        assert!(!ctx.quorum());

        ctx.grant(peer(1));
        assert!(!ctx.quorum(), "duplicate grant must not reach quorum");

        ctx.grant(peer(2));
        assert!(ctx.quorum());
    }

    /// # Case 2: reset starts a clean ballot
    #[test]
    fn test_vote_reset_clears_grants() {
        let mut ctx = VoteContext::default();
        ctx.reset(1);
        ctx.grant(peer(1));
        assert!(ctx.quorum());

        ctx.reset(3);
        assert!(!ctx.quorum());
    }

    /// # Case 3: configuration ctx set/reset round-trip
    #[test]
    fn test_configuration_ctx() {
        let mut ctx = ConfigurationCtx::default();
        assert!(ctx.is_empty());

        ctx.set(vec![peer(1), peer(2)]);
        assert!(!ctx.is_empty());
        assert_eq!(ctx.peers().len(), 2);

        ctx.reset();
        assert!(ctx.is_empty());
    }
}
