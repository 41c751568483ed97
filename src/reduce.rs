// Round-based reductions. A partner topology says, for every round, which
// blocks take part, whom they receive from and whom they send to. The driver
// runs one scheduling pass and one blocking exchange per round, then a final
// pass in which the last receivers read what was sent to them.

use std::{
    ops::{Deref, DerefMut},
    sync::Arc,
};

use tracing::debug;

use crate::{
    assigner::Assigner,
    comm::Communicator,
    error::Result,
    link::{BlockID, Gid, Link},
    master::{Block, BlockStatus, Master, ProxyWithLink},
};

/// The communication pattern of a round-based reduction.
pub trait Partners: Send + Sync {
    fn rounds(&self) -> usize;
    /// Whether `gid` takes part in `round`.
    fn active(&self, round: usize, gid: Gid) -> bool;
    /// Blocks `gid` receives from at the start of `round`.
    fn incoming(&self, round: usize, gid: Gid) -> Vec<Gid>;
    /// Blocks `gid` sends to at the end of `round`.
    fn outgoing(&self, round: usize, gid: Gid) -> Vec<Gid>;
}

/// A k-ary merge over the gids `0..nblocks`. In round `r` the blocks whose gid
/// is a multiple of `k^r` are active; each sends to the first block of its
/// group of `k` and drops out, so after the last round block 0 holds the
/// merged result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegularMergePartners {
    nblocks: usize,
    k: usize,
    rounds: usize,
}

impl RegularMergePartners {
    /// `k` below 2 is treated as 2.
    pub fn new(nblocks: usize, k: usize) -> Self {
        let k = k.max(2);
        let mut rounds = 0;
        let mut span = 1;
        while span < nblocks {
            span *= k;
            rounds += 1;
        }
        Self { nblocks, k, rounds }
    }

    pub fn nblocks(&self) -> usize {
        self.nblocks
    }

    pub fn k(&self) -> usize {
        self.k
    }

    fn step(&self, round: usize) -> usize {
        self.k.pow(round as u32)
    }
}

impl Partners for RegularMergePartners {
    fn rounds(&self) -> usize {
        self.rounds
    }

    fn active(&self, round: usize, gid: Gid) -> bool {
        round <= self.rounds && gid as usize % self.step(round) == 0
    }

    fn incoming(&self, round: usize, gid: Gid) -> Vec<Gid> {
        if round == 0 || !self.active(round, gid) {
            return Vec::new();
        }
        let step = self.step(round - 1);
        (1..self.k)
            .map(|j| gid as usize + j * step)
            .filter(|&other| other < self.nblocks)
            .map(|other| other as Gid)
            .collect()
    }

    fn outgoing(&self, round: usize, gid: Gid) -> Vec<Gid> {
        if round >= self.rounds || !self.active(round, gid) {
            return Vec::new();
        }
        let gid = gid as usize;
        let root = gid - gid % self.step(round + 1);
        if root == gid {
            Vec::new()
        } else {
            vec![root as Gid]
        }
    }
}

/// What a reduction callback sees: the block's proxy, plus the blocks it
/// receives from and sends to in the current round.
pub struct ReduceProxy<'p, 'a> {
    proxy: &'p mut ProxyWithLink<'a>,
    round: usize,
    in_link: Link,
    out_link: Link,
}

impl<'p, 'a> ReduceProxy<'p, 'a> {
    pub fn round(&self) -> usize {
        self.round
    }

    pub fn in_link(&self) -> &Link {
        &self.in_link
    }

    pub fn out_link(&self) -> &Link {
        &self.out_link
    }
}

impl<'p, 'a> Deref for ReduceProxy<'p, 'a> {
    type Target = ProxyWithLink<'a>;

    fn deref(&self) -> &Self::Target {
        &*self.proxy
    }
}

impl<'p, 'a> DerefMut for ReduceProxy<'p, 'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.proxy
    }
}

fn link_to<A: Assigner>(assigner: &A, gids: Vec<Gid>) -> Link {
    Link::from_neighbors(
        gids.into_iter()
            .map(|gid| BlockID::new(gid, assigner.rank(gid))),
    )
}

/// Runs a reduction over every local block. `f` is called once per round on
/// every block active in that round, and once more after the last round.
/// Blocks that are not active are skipped. The expected message count is
/// restored when the reduction ends.
pub fn reduce<B, C, A, P, F>(
    master: &mut Master<B, C>,
    assigner: A,
    partners: P,
    f: F,
) -> Result<()>
where
    B: Block,
    C: Communicator,
    A: Assigner + Clone + 'static,
    P: Partners + Clone + 'static,
    F: Fn(&mut B, &mut ReduceProxy<'_, '_>, &P) + Send + Sync + 'static,
{
    let original_expected = master.expected();
    let f = Arc::new(f);

    let rounds = partners.rounds();
    for round in 0..=rounds {
        debug!("reduction round {}", round);
        schedule(master, &assigner, &partners, &f, round)?;
        master.execute()?;
        if round == rounds {
            break;
        }

        let expected = (0..master.size())
            .map(|lid| master.gid(lid))
            .filter(|gid| master.local(*gid))
            .map(|gid| partners.incoming(round + 1, gid).len())
            .sum();
        master.set_expected(expected);
        master.flush()?;
    }

    master.set_expected(original_expected);
    Ok(())
}

fn schedule<B, C, A, P, F>(
    master: &mut Master<B, C>,
    assigner: &A,
    partners: &P,
    f: &Arc<F>,
    round: usize,
) -> Result<()>
where
    B: Block,
    C: Communicator,
    A: Assigner + Clone + 'static,
    P: Partners + Clone + 'static,
    F: Fn(&mut B, &mut ReduceProxy<'_, '_>, &P) + Send + Sync + 'static,
{
    let skip = {
        let partners = partners.clone();
        move |status: &BlockStatus| !partners.active(round, status.gid)
    };
    let assigner = assigner.clone();
    let partners = partners.clone();
    let f = f.clone();
    master.foreach_with_skip(
        move |block: Option<&mut B>, proxy: &mut ProxyWithLink<'_>| {
            let Some(block) = block else {
                return;
            };
            let gid = proxy.gid();
            let in_link = link_to(&assigner, partners.incoming(round, gid));
            let out_link = link_to(&assigner, partners.outgoing(round, gid));
            let mut rp = ReduceProxy {
                proxy,
                round,
                in_link,
                out_link,
            };
            (*f)(block, &mut rp, &partners);

            // every target gets a queue, even if the callback wrote nothing
            let targets = rp.out_link.neighbors().to_vec();
            for target in targets {
                rp.touch_outgoing(target);
            }
        },
        skip,
    )
}
