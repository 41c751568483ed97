mod common;

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use common::{init_tracing, ring_link, Values};
use strata::{
    error::BufferError, Block, Error, Gid, LocalWorld, Master, MasterConfig, MemoryBuffer,
    MemoryStorage, ProxyWithLink, QueueSizePolicy, RoundRobinAssigner,
};

static LIVE: AtomicUsize = AtomicUsize::new(0);
static PEAK: AtomicUsize = AtomicUsize::new(0);

/// Counts its live instances, so a test can see how many blocks exist at once.
struct Tracked {
    gid: Gid,
    value: u64,
}

impl Tracked {
    fn new(gid: Gid, value: u64) -> Self {
        LIVE.fetch_add(1, Ordering::SeqCst);
        Self { gid, value }
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        LIVE.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Block for Tracked {
    fn create() -> Self {
        Tracked::new(-1, 0)
    }

    fn save(&self, bb: &mut MemoryBuffer) {
        bb.save(&self.gid);
        bb.save(&self.value);
    }

    fn load(&mut self, bb: &mut MemoryBuffer) -> Result<(), BufferError> {
        self.gid = bb.load()?;
        self.value = bb.load()?;
        Ok(())
    }
}

const NBLOCKS: usize = 3;
const STEPS: u64 = 4;

fn ring(limit: Option<usize>) -> Vec<u64> {
    init_tracing();
    let comm = LocalWorld::new(1).remove(0);
    let config = match limit {
        Some(limit) => MasterConfig::builder().threads(2).limit(limit).build(),
        None => MasterConfig::builder().threads(2).build(),
    };
    let mut master = Master::new(comm, config)
        .with_storage(Arc::new(MemoryStorage::new()))
        .with_queue_policy(QueueSizePolicy::new(0));

    let assigner = RoundRobinAssigner::new(1, NBLOCKS);
    for gid in 0..NBLOCKS as Gid {
        let link = ring_link(&assigner, gid, NBLOCKS);
        master.add(gid, Tracked::new(gid, gid as u64 + 1), link).unwrap();
        if let Some(limit) = limit {
            assert!(master.in_memory() <= limit);
        }
    }

    for step in 0..=STEPS {
        master
            .foreach(move |block: Option<&mut Tracked>, cp: &mut ProxyWithLink<'_>| {
                PEAK.fetch_max(LIVE.load(Ordering::SeqCst), Ordering::SeqCst);
                let block = block.unwrap();
                let neighbors = cp.link().neighbors().to_vec();
                if step > 0 {
                    let mut sum = 0;
                    for nbr in &neighbors {
                        sum += cp.dequeue::<u64>(nbr.gid).unwrap();
                    }
                    block.value = block.value * 3 + sum;
                }
                if step < STEPS {
                    for nbr in neighbors {
                        cp.enqueue(nbr, &block.value);
                    }
                }
            })
            .unwrap();
        if let Some(limit) = limit {
            assert!(master.in_memory() <= limit);
        }
        if step < STEPS {
            master.exchange().unwrap();
        }
    }

    (0..master.size())
        .map(|lid| master.get(lid).unwrap().value)
        .collect()
}

#[test]
fn one_block_in_memory_gives_the_same_answer() {
    PEAK.store(0, Ordering::SeqCst);
    let limited = ring(Some(1));
    assert_eq!(PEAK.load(Ordering::SeqCst), 1);

    let unlimited = ring(None);
    assert_eq!(limited, unlimited);
    assert_eq!(LIVE.load(Ordering::SeqCst), 0);
}

#[test]
fn limit_without_storage_is_an_error() {
    let comm = LocalWorld::new(1).remove(0);
    let mut master: Master<Values, _> =
        Master::new(comm, MasterConfig::builder().limit(1).build());
    master.add(0, Values::default(), Default::default()).unwrap();
    let err = master
        .add(1, Values::default(), Default::default())
        .unwrap_err();
    assert!(matches!(err, Error::NoStorage(0)));
}
