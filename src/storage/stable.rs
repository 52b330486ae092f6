//! Stable storage contract: the crash-safe pair `(current_term, voted_for)`.

#[cfg(test)]
use mockall::automock;

use crate::membership::PeerId;
use crate::Result;

/// Contract of the stable storage collaborator.
///
/// Writes must be durable before returning: the node treats a vote as
/// granted on the wire only after the corresponding write came back `Ok`.
#[cfg_attr(test, automock)]
pub trait StableStorage: Send + Sync + 'static {
    fn init(&self) -> Result<()>;

    fn get_term(&self) -> Result<i64>;

    fn get_votedfor(&self) -> Result<Option<PeerId>>;

    fn set_term_and_votedfor(
        &self,
        term: i64,
        peer: Option<PeerId>,
    ) -> Result<()>;

    fn set_votedfor(
        &self,
        peer: Option<PeerId>,
    ) -> Result<()>;
}
