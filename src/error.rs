use std::io;

use thiserror::Error;

use crate::{
    link::{Gid, Lid, Rank},
    storage::Handle,
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// More blocks are resident than the configured limit allows after a
    /// scheduling pass. The run cannot continue.
    #[error("fatal: {in_memory} blocks in memory, with limit {limit}")]
    ResidencyLimitExceeded { in_memory: usize, limit: usize },
    #[error("no external storage configured, cannot move block {0} out of core")]
    NoStorage(Gid),
    #[error("no local block with lid {0}")]
    UnknownBlock(Lid),
    #[error("block {0} has been released")]
    Released(Gid),
    #[error("no incoming queue from block {from} for block {to}")]
    NoIncomingQueue { from: Gid, to: Gid },
    #[error(
        "block {gid} registered {found} collectives but block {first} registered {expected}"
    )]
    CollectiveMismatch {
        first: Gid,
        gid: Gid,
        expected: usize,
        found: usize,
    },
    #[error("rank {rank} registered {found} collectives, other ranks registered {expected}")]
    CollectiveRankMismatch {
        rank: Rank,
        expected: usize,
        found: usize,
    },
    #[error("could not spawn worker thread: {0}")]
    Spawn(io::Error),
    #[error("worker thread panicked while processing blocks")]
    WorkerPanicked,
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Wire(#[from] WireError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("tried to read {needed} bytes with only {available} remaining")]
    UnexpectedEnd { needed: usize, available: usize },
    #[error("string is not valid utf-8")]
    InvalidUtf8,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("unknown storage handle {0:?}")]
    UnknownHandle(Handle),
    #[error("checksum mismatch reading {0:?}")]
    ChecksumMismatch(Handle),
    #[error("stored object {0:?} is truncated")]
    Truncated(Handle),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("rank {0} is not part of this communicator")]
    UnknownRank(Rank),
    #[error("rank {0} hung up")]
    Disconnected(Rank),
    #[error("no message from rank {0} is waiting to be received")]
    NothingToReceive(Rank),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("message of {0} bytes is too short to carry its trailing (from, to) pair")]
    MissingTail(usize),
    #[error("head record of {0} bytes is too short")]
    ShortHead(usize),
    #[error("reassembled {received} bytes from rank {rank}, head announced {announced}")]
    SizeMismatch {
        rank: Rank,
        announced: u64,
        received: usize,
    },
    #[error("received a queue for block {0}, which is not local")]
    NotLocal(Gid),
}
