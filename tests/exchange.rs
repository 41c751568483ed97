mod common;

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use common::{ring_link, run_world, Values};
use strata::{
    Assigner, BlockStatus, Collectives, ContiguousAssigner, Error, Gid, LocalComm, Master,
    MasterConfig, MemoryStorage, ProxyWithLink, QueueSizePolicy, SkipNoIncoming,
};

const STEPS: u64 = 4;

fn ring_master(comm: LocalComm, nblocks: usize, threads: usize) -> Master<Values, LocalComm> {
    let assigner = ContiguousAssigner::new(comm.size(), nblocks);
    let rank = comm.rank();
    let mut master = Master::new(comm, MasterConfig::builder().threads(threads).build());
    for gid in assigner.local_gids(rank) {
        let link = ring_link(&assigner, gid, nblocks);
        master.add(gid, Values::new(gid, Vec::new()), link).unwrap();
    }
    master
}

// Every step each block reads what its neighbours sent in the previous step
// and sends them its gid and the step number.
fn ring_steps(comm: LocalComm, nblocks: usize) -> Vec<Values> {
    let mut master = ring_master(comm, nblocks, 2);
    assert_eq!(master.expected(), 2 * master.size());

    for step in 0..=STEPS {
        master
            .foreach(move |block: Option<&mut Values>, cp: &mut ProxyWithLink<'_>| {
                let block = block.unwrap();
                let neighbors = cp.link().neighbors().to_vec();
                if step > 0 {
                    for nbr in &neighbors {
                        let (gid, sent): (Gid, u64) = cp.dequeue(nbr.gid).unwrap();
                        assert_eq!(gid, nbr.gid);
                        assert_eq!(sent, step - 1);
                        block.seen.push(gid);
                    }
                }
                if step < STEPS {
                    let gid = cp.gid();
                    for nbr in neighbors {
                        cp.enqueue(nbr, &(gid, step));
                    }
                }
            })
            .unwrap();
        if step < STEPS {
            master.exchange().unwrap();
        }
    }

    (0..master.size())
        .map(|lid| master.get(lid).unwrap().clone())
        .collect()
}

#[test]
fn every_block_hears_from_every_neighbour_each_step() {
    let nblocks = 12;
    let mut blocks = run_world(3, move |comm| ring_steps(comm, nblocks)).concat();
    blocks.sort_by_key(|b| b.gid);
    assert_eq!(blocks.len(), nblocks);

    let n = nblocks as Gid;
    for block in blocks {
        let left = (block.gid + n - 1) % n;
        let right = (block.gid + 1) % n;
        let mut seen = block.seen.clone();
        seen.sort();
        let mut expected: Vec<Gid> = (0..STEPS).flat_map(|_| [left, right]).collect();
        expected.sort();
        assert_eq!(seen, expected, "block {}", block.gid);
    }
}

#[test]
fn all_reduce_reaches_every_block() {
    let nblocks = 9;
    let sums = run_world(3, move |comm| {
        let mut master = ring_master(comm, nblocks, 1);
        master
            .foreach(|block: Option<&mut Values>, cp: &mut ProxyWithLink<'_>| {
                let gid = block.unwrap().gid as u64;
                cp.all_reduce(gid, |a: &u64, b: &u64| a + b);
                cp.all_reduce(gid, |a: &u64, b: &u64| *a.max(b));
            })
            .unwrap();
        master.exchange().unwrap();

        let results = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = results.clone();
        master
            .foreach(move |_: Option<&mut Values>, cp: &mut ProxyWithLink<'_>| {
                let sum = cp.get::<u64>().unwrap();
                let max = cp.get::<u64>().unwrap();
                assert_eq!(cp.get::<u64>(), None);
                sink.lock().push((sum, max));
            })
            .unwrap();
        let results = results.lock().clone();
        results
    });
    for results in sums {
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| *r == (36, 8)));
    }
}

#[test]
fn ranks_without_blocks_still_take_part_in_collectives() {
    let products = run_world(2, |comm| {
        let rank = comm.rank();
        let mut master: Master<Values, _> =
            Master::new(comm, MasterConfig::builder().threads(1).build());
        if rank == 0 {
            for gid in 0..3 {
                master
                    .add(gid, Values::new(gid, Vec::new()), Default::default())
                    .unwrap();
            }
        }
        master
            .foreach(|block: Option<&mut Values>, cp: &mut ProxyWithLink<'_>| {
                let gid = block.unwrap().gid as u64;
                cp.all_reduce(gid + 1, |a: &u64, b: &u64| a * b);
            })
            .unwrap();
        master.exchange().unwrap();

        let products = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = products.clone();
        master
            .foreach(move |_: Option<&mut Values>, cp: &mut ProxyWithLink<'_>| {
                sink.lock().push(cp.get::<u64>().unwrap());
            })
            .unwrap();
        let products = products.lock().clone();
        products
    });
    assert_eq!(products, vec![vec![6, 6, 6], vec![]]);
}

#[test]
fn misaligned_collectives_are_rejected() {
    let outcomes = run_world(1, |comm| {
        let mut master: Master<Values, _> =
            Master::new(comm, MasterConfig::builder().threads(1).build());
        for gid in 0..2 {
            master
                .add(gid, Values::new(gid, Vec::new()), Default::default())
                .unwrap();
        }
        master
            .foreach(|block: Option<&mut Values>, cp: &mut ProxyWithLink<'_>| {
                if block.unwrap().gid == 0 {
                    cp.all_reduce(1u64, |a: &u64, b: &u64| a + b);
                }
            })
            .unwrap();
        master.exchange()
    });
    assert!(matches!(
        outcomes[0],
        Err(Error::CollectiveMismatch {
            expected: 1,
            found: 0,
            ..
        })
    ));
}

#[test]
fn deferred_commands_run_together() {
    run_world(1, |comm| {
        let mut master = ring_master(comm, 4, 2);
        master.set_immediate(false).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let calls = calls.clone();
            master
                .foreach(move |block: Option<&mut Values>, _: &mut ProxyWithLink<'_>| {
                    block.unwrap().values.push(1);
                    calls.fetch_add(1, Ordering::Relaxed);
                })
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::Relaxed), 0);

        master.set_immediate(true).unwrap();
        assert_eq!(calls.load(Ordering::Relaxed), 12);
        for lid in 0..master.size() {
            assert_eq!(master.get(lid).unwrap().values, vec![1, 1, 1]);
        }
    });
}

#[test]
fn skipped_blocks_get_no_block() {
    run_world(1, |comm| {
        let mut master = ring_master(comm, 4, 1);

        // only block 0 sends, to its right neighbour
        master
            .foreach(|_: Option<&mut Values>, cp: &mut ProxyWithLink<'_>| {
                if cp.gid() == 0 {
                    let right = cp.link().target(1);
                    cp.enqueue(right, &7u64);
                }
            })
            .unwrap();
        master.set_expected(1);
        master.flush().unwrap();
        assert!(master.has_incoming(1));
        assert!(!master.has_incoming(2));

        let visited = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = visited.clone();
        master
            .foreach_with_skip(
                move |block: Option<&mut Values>, cp: &mut ProxyWithLink<'_>| {
                    sink.lock().push((cp.gid(), block.is_some()));
                },
                SkipNoIncoming,
            )
            .unwrap();
        let mut visited = visited.lock().clone();
        visited.sort();
        assert_eq!(visited, vec![(0, false), (1, true), (2, false), (3, false)]);

        let skip_odd = |status: &BlockStatus| status.gid % 2 == 1;
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        master
            .foreach_with_skip(
                move |block: Option<&mut Values>, _: &mut ProxyWithLink<'_>| {
                    if block.is_some() {
                        counter.fetch_add(1, Ordering::Relaxed);
                    }
                },
                skip_odd,
            )
            .unwrap();
        assert_eq!(hits.load(Ordering::Relaxed), 2);
    });
}

#[test]
fn released_blocks_leave_the_exchange() {
    run_world(1, |comm| {
        let mut master = ring_master(comm, 3, 1);
        assert_eq!(master.expected(), 6);

        let block = master.release(2).unwrap();
        assert_eq!(block.gid, 2);
        assert_eq!(master.expected(), 4);
        assert!(!master.local(2));
        assert_eq!(master.lid(1), Some(1));
        assert!(matches!(master.get(2), Err(Error::Released(2))));
        assert!(master.block(2).is_none());
    });
}

fn send_gid(_: Option<&mut Values>, cp: &mut ProxyWithLink<'_>) {
    let gid = cp.gid();
    for nbr in cp.link().neighbors().to_vec() {
        cp.enqueue(nbr, &gid);
    }
}

#[test]
fn destroyed_blocks_keep_their_place_in_the_exchange() {
    let mut blocks = run_world(2, |comm| {
        let mut master = ring_master(comm, 4, 1);
        let expected = master.expected();
        if let Some(lid) = master.lid(3) {
            master.destroy(lid).unwrap();
            assert!(master.block(lid).is_none());
        }
        assert_eq!(master.expected(), expected);

        for _ in 0..2 {
            master.foreach(send_gid).unwrap();
            master.exchange().unwrap();
            master
                .foreach(|block: Option<&mut Values>, cp: &mut ProxyWithLink<'_>| {
                    let block = block.unwrap();
                    for from in cp.incoming_gids() {
                        if let Ok(gid) = cp.dequeue::<Gid>(from) {
                            block.seen.push(gid);
                        }
                    }
                })
                .unwrap();
        }

        (0..master.size())
            .filter_map(|lid| master.block(lid).map(|b| b.clone()))
            .collect::<Vec<_>>()
    })
    .concat();
    blocks.sort_by_key(|b| b.gid);

    let seen: Vec<(Gid, Vec<Gid>)> = blocks.into_iter().map(|b| (b.gid, b.seen)).collect();
    assert_eq!(
        seen,
        vec![(0, vec![1, 1]), (1, vec![0, 2, 0, 2]), (2, vec![1, 1])]
    );
}

fn spilling_master(comm: LocalComm, storage: Arc<MemoryStorage>) -> Master<Values, LocalComm> {
    let assigner = ContiguousAssigner::new(comm.size(), 4);
    let rank = comm.rank();
    let mut master = Master::new(comm, MasterConfig::builder().threads(1).build())
        .with_storage(storage)
        .with_queue_policy(QueueSizePolicy::new(0));
    for gid in assigner.local_gids(rank) {
        let link = ring_link(&assigner, gid, 4);
        master.add(gid, Values::new(gid, vec![7; 16]), link).unwrap();
    }
    master
}

#[test]
fn releasing_blocks_frees_their_spilled_queues() {
    run_world(2, |comm| {
        let storage = Arc::new(MemoryStorage::new());
        let mut master = spilling_master(comm, storage.clone());

        // received queues, spilled along with their blocks
        master.foreach(send_gid).unwrap();
        master.exchange().unwrap();
        master.unload_all().unwrap();
        assert!(storage.len() > master.size());

        for lid in 0..master.size() {
            master.release(lid).unwrap();
        }
        assert!(storage.is_empty());
    });
}

#[test]
fn releasing_blocks_frees_their_spilled_outgoing_queues() {
    let leftovers = run_world(2, |comm| {
        let storage = Arc::new(MemoryStorage::new());
        let mut master = spilling_master(comm, storage.clone());

        // queues written but never sent, spilled along with their blocks
        master.foreach(send_gid).unwrap();
        master.unload_all().unwrap();
        assert!(storage.len() > master.size());

        for lid in 0..master.size() {
            master.release(lid).unwrap();
        }
        storage.len()
    });
    assert_eq!(leftovers, vec![0, 0]);
}

#[test]
fn clearing_frees_everything_in_storage() {
    run_world(1, |comm| {
        let storage = Arc::new(MemoryStorage::new());
        let mut master = spilling_master(comm, storage.clone());
        master.foreach(send_gid).unwrap();
        master.exchange().unwrap();
        master.unload_all().unwrap();
        assert!(!storage.is_empty());

        master.clear().unwrap();
        assert_eq!(master.size(), 0);
        assert!(storage.is_empty());
    });
}
