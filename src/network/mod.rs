//! Outbound transport contract.
//!
//! The node only originates one RPC itself, `RequestVote`, during
//! elections. Replication and snapshot traffic is originated by the
//! replicator group, and inbound routing belongs to the embedding RPC
//! server.

#[cfg(test)]
use mockall::automock;

use tonic::async_trait;

use crate::membership::PeerId;
use crate::proto::RequestVoteRequest;
use crate::proto::RequestVoteResponse;
use crate::Result;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send_request_vote(
        &self,
        peer: PeerId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse>;
}
