use bytes::Bytes;

use crate::{error::TransportError, link::Rank};

mod local;
pub(crate) mod transport;
pub(crate) mod wire;

pub use local::{LocalComm, LocalRequest, LocalWorld};
pub use wire::Tag;

/// What a peek found: the next message waiting to be received.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Status {
    pub source: Rank,
    pub tag: Tag,
    pub count: usize,
}

/// An outstanding non-blocking send.
pub trait Request: Send {
    /// Returns true once the transport no longer needs the send buffer.
    fn test(&mut self) -> bool;
}

/// Blocking collective operations. Every rank of the communicator has to call
/// them the same number of times and in the same order.
pub trait Collectives {
    fn rank(&self) -> Rank;
    fn size(&self) -> usize;

    /// Returns every rank's contribution, indexed by rank.
    fn all_gather(&mut self, contribution: Vec<u8>) -> Result<Vec<Vec<u8>>, TransportError>;

    fn barrier(&mut self) -> Result<(), TransportError>;
}

/// Point-to-point message passing in the style of MPI. Messages between one
/// pair of ranks are never reordered or dropped.
pub trait Communicator: Collectives + Send {
    type Request: Request;

    /// Starts sending `payload` to `dest`. The payload is shared with the
    /// caller, who keeps it alive until the returned request completes.
    fn isend(&mut self, dest: Rank, tag: Tag, payload: Bytes)
        -> Result<Self::Request, TransportError>;

    /// Looks for a message from any source with any tag, without receiving it.
    fn peek(&mut self) -> Option<Status>;

    /// Receives the message described by a status previously returned from
    /// [`peek`](Communicator::peek).
    fn recv(&mut self, status: &Status) -> Result<Bytes, TransportError>;
}
