#![allow(dead_code)]

use std::{sync::Arc, thread};

use strata::{
    error::BufferError, Assigner, Block, BlockID, Gid, Link, LocalComm, LocalWorld,
    MemoryBuffer,
};
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Runs `f` once per rank of an in-process world, each on its own thread, and
/// returns the results by rank.
pub fn run_world<T, F>(size: usize, f: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(LocalComm) -> T + Send + Sync + 'static,
{
    init_tracing();
    let f = Arc::new(f);
    let handles: Vec<_> = LocalWorld::new(size)
        .into_iter()
        .map(|comm| {
            let f = f.clone();
            thread::spawn(move || f(comm))
        })
        .collect();
    handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect()
}

/// Neighbours of `gid` on a ring of `nblocks` blocks.
pub fn ring_link<A: Assigner>(assigner: &A, gid: Gid, nblocks: usize) -> Link {
    let n = nblocks as Gid;
    Link::from_neighbors(
        [(gid + n - 1) % n, (gid + 1) % n]
            .into_iter()
            .map(|nbr| BlockID::new(nbr, assigner.rank(nbr))),
    )
}

/// Neighbours of `gid` on a path of `nblocks` blocks.
pub fn chain_link<A: Assigner>(assigner: &A, gid: Gid, nblocks: usize) -> Link {
    Link::from_neighbors(
        [gid - 1, gid + 1]
            .into_iter()
            .filter(|nbr| (0..nblocks as Gid).contains(nbr))
            .map(|nbr| BlockID::new(nbr, assigner.rank(nbr))),
    )
}

/// A block holding a vector of numbers and the gids it has heard from.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Values {
    pub gid: Gid,
    pub values: Vec<u64>,
    pub seen: Vec<Gid>,
}

impl Values {
    pub fn new(gid: Gid, values: Vec<u64>) -> Self {
        Self {
            gid,
            values,
            seen: Vec::new(),
        }
    }
}

impl Block for Values {
    fn create() -> Self {
        Self::default()
    }

    fn save(&self, bb: &mut MemoryBuffer) {
        bb.save(&self.gid);
        bb.save(&self.values);
        bb.save(&self.seen);
    }

    fn load(&mut self, bb: &mut MemoryBuffer) -> Result<(), BufferError> {
        self.gid = bb.load()?;
        self.values = bb.load()?;
        self.seen = bb.load()?;
        Ok(())
    }
}
