mod common;

use common::{run_world, Values};
use strata::{
    reduce, Assigner, Collectives, ContiguousAssigner, LocalComm, Master, MasterConfig,
    ReduceProxy, RegularMergePartners, RoundRobinAssigner,
};

const WIDTH: u64 = 5;

fn merge(block: &mut Values, rp: &mut ReduceProxy<'_, '_>, _: &RegularMergePartners) {
    for from in rp.in_link().neighbors().to_vec() {
        let values: Vec<u64> = rp.dequeue(from.gid).unwrap();
        for (mine, theirs) in block.values.iter_mut().zip(values) {
            *mine += theirs;
        }
        block.seen.push(from.gid);
    }
    for to in rp.out_link().neighbors().to_vec() {
        let values = block.values.clone();
        rp.enqueue(to, &values);
    }
}

fn run_merge<A>(
    comm: LocalComm,
    assigner: A,
    nblocks: usize,
    k: usize,
    threads: usize,
) -> Vec<Values>
where
    A: Assigner + Clone + 'static,
{
    let rank = comm.rank();
    let mut master = Master::new(comm, MasterConfig::builder().threads(threads).build());
    for gid in assigner.local_gids(rank) {
        master
            .add(gid, Values::new(gid, (0..WIDTH).collect()), Default::default())
            .unwrap();
    }
    master.set_expected(3);

    reduce(&mut master, assigner, RegularMergePartners::new(nblocks, k), merge).unwrap();
    assert_eq!(master.expected(), 3);

    (0..master.size())
        .map(|lid| master.get(lid).unwrap().clone())
        .collect()
}

fn check(mut blocks: Vec<Values>, nblocks: usize) {
    blocks.sort_by_key(|b| b.gid);
    assert_eq!(blocks.len(), nblocks);

    let root = &blocks[0];
    let expected: Vec<u64> = (0..WIDTH).map(|j| nblocks as u64 * j).collect();
    assert_eq!(root.values, expected);

    for block in &blocks[1..] {
        if block.gid % 2 == 1 {
            assert_eq!(block.values, (0..WIDTH).collect::<Vec<_>>());
            assert!(block.seen.is_empty());
        }
    }
}

#[test]
fn binary_merge_across_ranks() {
    let nblocks = 8;
    let blocks = run_world(2, move |comm| {
        let assigner = ContiguousAssigner::new(comm.size(), nblocks);
        run_merge(comm, assigner, nblocks, 2, 1)
    });
    let blocks = blocks.concat();
    let root = blocks.iter().find(|b| b.gid == 0).unwrap();
    assert_eq!(root.seen, vec![1, 2, 4]);
    check(blocks, nblocks);
}

#[test]
fn four_way_merge_on_one_rank() {
    let nblocks = 16;
    let blocks = run_world(1, move |comm| {
        let assigner = RoundRobinAssigner::new(comm.size(), nblocks);
        run_merge(comm, assigner, nblocks, 4, 3)
    });
    let blocks = blocks.concat();
    let root = blocks.iter().find(|b| b.gid == 0).unwrap();
    assert_eq!(root.seen, vec![1, 2, 3, 4, 8, 12]);
    check(blocks, nblocks);
}

#[test]
fn ragged_merge_round_robin() {
    let nblocks = 7;
    let blocks = run_world(3, move |comm| {
        let assigner = RoundRobinAssigner::new(comm.size(), nblocks);
        run_merge(comm, assigner, nblocks, 2, 2)
    });
    check(blocks.concat(), nblocks);
}
