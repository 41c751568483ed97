use crate::link::{Gid, Rank};

/// Maps global block ids to the ranks that own them.
pub trait Assigner: Send + Sync {
    /// Total number of processes.
    fn size(&self) -> usize;
    /// Total number of blocks across all processes.
    fn nblocks(&self) -> usize;
    /// Rank owning the block `gid`.
    fn rank(&self, gid: Gid) -> Rank;

    /// Gids of the blocks owned by `rank`, in increasing order.
    fn local_gids(&self, rank: Rank) -> Vec<Gid> {
        (0..self.nblocks() as Gid)
            .filter(|gid| self.rank(*gid) == rank)
            .collect()
    }
}

/// Deals blocks out to ranks like cards: block `gid` lives on `gid % size`.
#[derive(Clone, Copy, Debug)]
pub struct RoundRobinAssigner {
    size: usize,
    nblocks: usize,
}

impl RoundRobinAssigner {
    pub fn new(size: usize, nblocks: usize) -> Self {
        Self { size, nblocks }
    }
}

impl Assigner for RoundRobinAssigner {
    fn size(&self) -> usize {
        self.size
    }

    fn nblocks(&self) -> usize {
        self.nblocks
    }

    fn rank(&self, gid: Gid) -> Rank {
        (gid as usize % self.size) as Rank
    }

    fn local_gids(&self, rank: Rank) -> Vec<Gid> {
        (rank as usize..self.nblocks)
            .step_by(self.size)
            .map(|gid| gid as Gid)
            .collect()
    }
}

/// Gives every rank a contiguous run of gids. The first `nblocks % size`
/// ranks get one block more than the rest.
#[derive(Clone, Copy, Debug)]
pub struct ContiguousAssigner {
    size: usize,
    nblocks: usize,
}

impl ContiguousAssigner {
    pub fn new(size: usize, nblocks: usize) -> Self {
        Self { size, nblocks }
    }

    fn first_gid(&self, rank: usize) -> usize {
        let div = self.nblocks / self.size;
        let rem = self.nblocks % self.size;
        rank * div + rank.min(rem)
    }
}

impl Assigner for ContiguousAssigner {
    fn size(&self) -> usize {
        self.size
    }

    fn nblocks(&self) -> usize {
        self.nblocks
    }

    fn rank(&self, gid: Gid) -> Rank {
        let gid = gid as usize;
        let div = self.nblocks / self.size;
        let rem = self.nblocks % self.size;
        // the first `rem` ranks own `div + 1` blocks each
        let big = rem * (div + 1);
        if gid < big {
            (gid / (div + 1)) as Rank
        } else {
            (rem + (gid - big) / div.max(1)) as Rank
        }
    }

    fn local_gids(&self, rank: Rank) -> Vec<Gid> {
        let rank = rank as usize;
        (self.first_gid(rank)..self.first_gid(rank + 1))
            .map(|gid| gid as Gid)
            .collect()
    }
}
