use std::fmt;

use hashbrown::HashSet;

use crate::{
    error::BufferError,
    serialization::{Load, MemoryBuffer, Save},
};

/// Global block identifier, unique across all processes.
pub type Gid = i32;
/// Process rank inside a communicator.
pub type Rank = i32;
/// Process-local index into the block registry.
pub type Lid = usize;

/// Identifies a block for routing: its global id and the rank that owns it.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct BlockID {
    pub gid: Gid,
    pub proc: Rank,
}

impl BlockID {
    pub fn new(gid: Gid, proc: Rank) -> Self {
        Self { gid, proc }
    }
}

impl fmt::Display for BlockID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.gid, self.proc)
    }
}

impl Save for BlockID {
    fn save_to(&self, bb: &mut MemoryBuffer) {
        self.gid.save_to(bb);
        self.proc.save_to(bb);
    }
}

impl Load for BlockID {
    fn load(bb: &mut MemoryBuffer) -> Result<Self, BufferError> {
        Ok(Self {
            gid: Gid::load(bb)?,
            proc: Rank::load(bb)?,
        })
    }
}

/// The neighbourhood of one block. Every unique neighbour is expected to send
/// this block exactly one message per blocking exchange.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Link {
    neighbors: Vec<BlockID>,
}

impl Link {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_neighbors(neighbors: impl IntoIterator<Item = BlockID>) -> Self {
        Self {
            neighbors: neighbors.into_iter().collect(),
        }
    }

    pub fn add_neighbor(&mut self, neighbor: BlockID) {
        self.neighbors.push(neighbor);
    }

    pub fn size(&self) -> usize {
        self.neighbors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.neighbors.is_empty()
    }

    /// Number of distinct neighbours. A neighbour listed twice (periodic
    /// boundaries) still only sends one message per exchange.
    pub fn size_unique(&self) -> usize {
        self.neighbors.iter().collect::<HashSet<_>>().len()
    }

    pub fn target(&self, i: usize) -> BlockID {
        self.neighbors[i]
    }

    pub fn neighbors(&self) -> &[BlockID] {
        &self.neighbors
    }

    /// Position of the first neighbour with the given gid.
    pub fn find(&self, gid: Gid) -> Option<usize> {
        self.neighbors.iter().position(|n| n.gid == gid)
    }
}

impl Save for Link {
    fn save_to(&self, bb: &mut MemoryBuffer) {
        self.neighbors.save_to(bb);
    }
}

impl Load for Link {
    fn load(bb: &mut MemoryBuffer) -> Result<Self, BufferError> {
        Ok(Self {
            neighbors: Vec::load(bb)?,
        })
    }
}
