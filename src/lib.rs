// strata runs computations over a problem split into blocks, many blocks per
// process and many processes per run. Each process holds a `Master` that owns
// its blocks, runs callbacks on them from a pool of worker threads, moves
// blocks it cannot keep in memory out to storage, and carries the messages
// blocks address to one another, within the process or across the
// communicator.

pub mod assigner;
pub mod comm;
pub mod config;
pub mod error;
pub mod hex;
pub mod link;
pub mod master;
pub mod reduce;
pub mod serialization;
pub mod storage;

pub use assigner::{Assigner, ContiguousAssigner, RoundRobinAssigner};
pub use comm::{Collectives, Communicator, LocalComm, LocalWorld, Request};
pub use config::MasterConfig;
pub use error::{Error, Result};
pub use link::{BlockID, Gid, Lid, Link, Rank};
pub use master::{
    AllReduce, Block, BlockStatus, Callback, CollectiveOp, IProxyWithLink, Master,
    NeverSkip, Proxy, ProxyWithLink, QueuePolicy, QueueSizePolicy, Skip,
    SkipNoIncoming,
};
pub use reduce::{reduce, Partners, ReduceProxy, RegularMergePartners};
pub use serialization::{Load, MemoryBuffer, Save};
pub use storage::{ExternalStorage, FileStorage, Handle, MemoryStorage};
