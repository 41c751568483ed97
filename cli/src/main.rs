use futures::future::join_all;
use strata::{
    error::BufferError, reduce, Assigner, Block, BlockID, Collectives, ContiguousAssigner,
    Gid, IProxyWithLink, Link, LocalComm, LocalWorld, Master, MasterConfig, MemoryBuffer,
    ReduceProxy, RegularMergePartners,
};
use tracing::{error, info};

const RANKS: usize = 3;
const CHAIN_BLOCKS: usize = 9;
const MERGE_BLOCKS: usize = 12;
const MERGE_K: usize = 3;

#[derive(Default)]
struct Cell {
    gid: Gid,
    hops: Vec<u64>,
    values: Vec<u64>,
}

impl Block for Cell {
    fn create() -> Self {
        Self::default()
    }

    fn save(&self, bb: &mut MemoryBuffer) {
        bb.save(&self.gid);
        bb.save(&self.hops);
        bb.save(&self.values);
    }

    fn load(&mut self, bb: &mut MemoryBuffer) -> Result<(), BufferError> {
        self.gid = bb.load()?;
        self.hops = bb.load()?;
        self.values = bb.load()?;
        Ok(())
    }
}

fn chain_link(assigner: &ContiguousAssigner, gid: Gid) -> Link {
    Link::from_neighbors(
        [gid - 1, gid + 1]
            .into_iter()
            .filter(|nbr| (0..CHAIN_BLOCKS as Gid).contains(nbr))
            .map(|nbr| BlockID::new(nbr, assigner.rank(nbr))),
    )
}

// Passes a token from the first block of the chain to the last and back.
fn bounce(block: &mut Cell, cp: &mut IProxyWithLink<'_>) -> bool {
    let gid = cp.gid();
    let last = CHAIN_BLOCKS as Gid - 1;
    if gid == 0 && block.hops.is_empty() {
        block.hops.push(0);
        let to = cp.link().target(0);
        cp.enqueue(to, &1u64);
    }

    for from in cp.incoming_gids() {
        while cp.incoming(from).map_or(0, |q| q.remaining()) > 0 {
            let Ok(hops) = cp.dequeue::<u64>(from) else {
                break;
            };
            block.hops.push(hops);
            let next = if from < gid && gid < last {
                gid + 1
            } else if gid > 0 {
                gid - 1
            } else {
                continue;
            };
            if let Some(i) = cp.link().find(next) {
                let to = cp.link().target(i);
                cp.enqueue(to, &(hops + 1));
            }
        }
    }
    true
}

fn merge(block: &mut Cell, rp: &mut ReduceProxy<'_, '_>, _: &RegularMergePartners) {
    for from in rp.in_link().neighbors().to_vec() {
        if let Ok(theirs) = rp.dequeue::<Vec<u64>>(from.gid) {
            for (mine, theirs) in block.values.iter_mut().zip(theirs) {
                *mine += theirs;
            }
        }
    }
    for to in rp.out_link().neighbors().to_vec() {
        let values = block.values.clone();
        rp.enqueue(to, &values);
    }
}

fn run_rank(comm: LocalComm, merge_comm: LocalComm) -> strata::Result<()> {
    let rank = comm.rank();
    let size = comm.size();

    let chain = ContiguousAssigner::new(size, CHAIN_BLOCKS);
    let mut master = Master::new(comm, MasterConfig::builder().threads(2).build());
    for gid in chain.local_gids(rank) {
        master.add(gid, Cell { gid, ..Default::default() }, chain_link(&chain, gid))?;
    }
    master.iexchange(bounce)?;
    for lid in 0..master.size() {
        let cell = master.get(lid)?;
        info!("rank {} block {} saw hops {:?}", rank, cell.gid, cell.hops);
    }

    let assigner = ContiguousAssigner::new(size, MERGE_BLOCKS);
    let mut master = Master::new(merge_comm, MasterConfig::builder().threads(2).build());
    for gid in assigner.local_gids(rank) {
        let values = (0..4).map(|j| j * (gid as u64 + 1)).collect();
        master.add(gid, Cell { gid, values, ..Default::default() }, Link::new())?;
    }
    reduce(
        &mut master,
        assigner,
        RegularMergePartners::new(MERGE_BLOCKS, MERGE_K),
        merge,
    )?;
    if let Some(lid) = master.lid(0) {
        info!("merged values at block 0: {:?}", master.get(lid)?.values);
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    // one world per demo, so each master owns its communicator
    let ranks = LocalWorld::new(RANKS)
        .into_iter()
        .zip(LocalWorld::new(RANKS))
        .map(|(chain, merge)| tokio::task::spawn_blocking(move || run_rank(chain, merge)));

    for (rank, outcome) in join_all(ranks).await.into_iter().enumerate() {
        match outcome {
            Ok(Ok(())) => info!("rank {} finished", rank),
            Ok(Err(e)) => error!("rank {} failed: {}", rank, e),
            Err(e) => error!("rank {} panicked: {}", rank, e),
        }
    }
}
