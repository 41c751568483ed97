// The master owns every local block and drives their computation and their
// communication. Blocks live in an arena indexed by lid; each entry carries
// the block (or the handle it was spilled under), its link, and the queues
// and collectives belonging to it. Worker threads only ever touch the entry
// of the block they are processing. Moving queues between blocks happens on
// the calling thread, during `flush` and `iexchange`.

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::{MappedMutexGuard, MutexGuard};
use tracing::{debug, warn};

use crate::{
    comm::{transport::Transport, Communicator},
    config::MasterConfig,
    error::{Error, Result},
    link::{Gid, Lid, Link, Rank},
    storage::ExternalStorage,
};

mod collectives;
mod exchange;
mod proxy;
mod queues;
mod registry;
mod scheduler;

pub use collectives::{AllReduce, CollectiveOp};
pub use proxy::{IProxyWithLink, Proxy, ProxyWithLink};
pub use queues::{QueuePolicy, QueueSizePolicy};
pub use registry::Block;
pub use scheduler::{BlockStatus, Callback, NeverSkip, Skip, SkipNoIncoming};

use registry::{Registry, Residency};
use scheduler::Command;

pub struct Master<B: Block, C: Communicator> {
    comm: C,
    registry: Registry<B>,
    gids: Vec<Gid>,
    lids: HashMap<Gid, Lid>,
    transport: Transport<C::Request>,
    commands: Vec<Command<B>>,
    threads: usize,
    limit: Option<usize>,
    max_recv_tries: usize,
    immediate: bool,
    // messages each block expects per blocking exchange, and how many have
    // arrived in the current one
    expected: usize,
    received: usize,
    // lifetime totals, compared across ranks to detect quiescence
    sent_total: u64,
    received_total: u64,
}

impl<B: Block, C: Communicator> Master<B, C> {
    pub fn new(comm: C, config: MasterConfig) -> Self {
        let rank = comm.rank();
        Self {
            registry: Registry::new(rank, Box::new(QueueSizePolicy::default())),
            gids: Vec::new(),
            lids: HashMap::new(),
            transport: Transport::new(config.max_message_size),
            commands: Vec::new(),
            threads: config.worker_threads(),
            limit: config.limit,
            max_recv_tries: config.max_recv_tries.max(1),
            immediate: config.immediate,
            expected: 0,
            received: 0,
            sent_total: 0,
            received_total: 0,
            comm,
        }
    }

    /// Storage for blocks and queues moved out of core. Required whenever a
    /// limit is set.
    pub fn with_storage(mut self, storage: Arc<dyn ExternalStorage>) -> Self {
        self.registry.set_storage(storage);
        self
    }

    pub fn with_queue_policy<P: QueuePolicy + 'static>(mut self, policy: P) -> Self {
        self.registry.set_policy(Box::new(policy));
        self
    }

    pub fn rank(&self) -> Rank {
        self.comm.rank()
    }

    pub fn communicator(&self) -> &C {
        &self.comm
    }

    pub fn communicator_mut(&mut self) -> &mut C {
        &mut self.comm
    }

    /// Takes ownership of a block and returns its lid. If the limit of blocks
    /// in memory has been reached, the least recently used block is unloaded
    /// first. Every unique neighbour in `link` is expected to send the block
    /// one message per exchange.
    pub fn add(&mut self, gid: Gid, block: B, link: Link) -> Result<Lid> {
        self.registry.make_room(self.limit, None)?;
        self.expected += link.size_unique();
        let lid = self.registry.push(gid, block, link);
        self.gids.push(gid);
        self.lids.insert(gid, lid);
        debug!("added block {} as {}", gid, lid);
        Ok(lid)
    }

    /// Hands the block back to the caller and forgets about it. The lid stays
    /// taken.
    pub fn release(&mut self, lid: Lid) -> Result<B> {
        let mut cell = self.registry.cell(lid)?.lock();
        let block = self.registry.take(&mut cell)?;
        let link = std::mem::take(&mut cell.link);
        self.registry.discard_queues(&mut cell)?;
        cell.collectives.clear();
        let gid = cell.gid;
        drop(cell);

        self.expected = self.expected.saturating_sub(link.size_unique());
        self.lids.remove(&gid);
        Ok(block)
    }

    /// Drops the block, keeping its link and gid. The block stays part of
    /// every exchange: queues it wrote are still delivered, its neighbours
    /// keep getting a queue from it, and queues sent to it are dropped.
    pub fn destroy(&mut self, lid: Lid) -> Result<()> {
        let mut cell = self.registry.cell(lid)?.lock();
        drop(self.registry.take(&mut cell)?);
        let gid = cell.gid;
        cell.incoming.discard(gid, self.registry.storage())?;
        cell.collectives.clear();
        Ok(())
    }

    /// Drops every block.
    pub fn clear(&mut self) -> Result<()> {
        self.registry.clear()?;
        self.gids.clear();
        self.lids.clear();
        self.expected = 0;
        Ok(())
    }

    pub fn create(&self) -> B {
        B::create()
    }

    /// The block, loading it first if it is out of core.
    pub fn get(&mut self, lid: Lid) -> Result<MappedMutexGuard<'_, B>> {
        self.ensure_resident(lid)?;
        let cell = self.registry.cell(lid)?.lock();
        MutexGuard::try_map(cell, |cell| cell.block_mut())
            .map_err(|cell| Error::Released(cell.gid))
    }

    /// The block, if it is in memory.
    pub fn block(&self, lid: Lid) -> Option<MappedMutexGuard<'_, B>> {
        let cell = self.registry.cell(lid).ok()?.lock();
        MutexGuard::try_map(cell, |cell| cell.block_mut()).ok()
    }

    pub fn link(&self, lid: Lid) -> Result<Link> {
        Ok(self.registry.cell(lid)?.lock().link.clone())
    }

    /// Replaces the block's link, adjusting the expected message count.
    pub fn replace_link(&mut self, lid: Lid, link: Link) -> Result<()> {
        let mut cell = self.registry.cell(lid)?.lock();
        let old = std::mem::replace(&mut cell.link, link);
        self.expected = (self.expected + cell.link.size_unique())
            .saturating_sub(old.size_unique());
        Ok(())
    }

    pub fn load(&mut self, lid: Lid) -> Result<()> {
        self.registry.load(&mut self.registry.cell(lid)?.lock())
    }

    pub fn unload(&mut self, lid: Lid) -> Result<()> {
        self.registry.unload(&mut self.registry.cell(lid)?.lock())
    }

    pub fn unload_all(&mut self) -> Result<()> {
        for (_, cell) in self.registry.cells() {
            self.registry.unload(&mut cell.lock())?;
        }
        Ok(())
    }

    /// Loads the block if needed, unloading others to stay within the limit.
    fn ensure_resident(&mut self, lid: Lid) -> Result<()> {
        {
            let mut cell = self.registry.cell(lid)?.lock();
            match cell.residency {
                Residency::Resident(_) => {
                    self.registry.touch(&mut cell);
                    return Ok(());
                }
                Residency::Released => return Err(Error::Released(cell.gid)),
                Residency::External(_) => {}
            }
        }
        self.registry.make_room(self.limit, Some(lid))?;
        self.registry.load(&mut self.registry.cell(lid)?.lock())
    }

    /// Gid of the block with the given lid.
    ///
    /// Panics if `lid` is not a local id.
    pub fn gid(&self, lid: Lid) -> Gid {
        self.gids[lid]
    }

    pub fn lid(&self, gid: Gid) -> Option<Lid> {
        self.lids.get(&gid).copied()
    }

    /// Whether the block `gid` lives on this rank.
    pub fn local(&self, gid: Gid) -> bool {
        self.lids.contains_key(&gid)
    }

    /// Number of lids handed out.
    pub fn size(&self) -> usize {
        self.registry.len()
    }

    pub fn in_memory(&self) -> usize {
        self.registry.in_memory()
    }

    /// Lid of some block that is in memory.
    pub fn loaded_block(&self) -> Option<Lid> {
        self.registry
            .cells()
            .find(|(_, cell)| cell.lock().is_resident())
            .map(|(lid, _)| lid)
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn set_threads(&mut self, threads: usize) {
        self.threads = threads;
    }

    pub fn immediate(&self) -> bool {
        self.immediate
    }

    /// Switching back to immediate mode runs the commands batched so far.
    pub fn set_immediate(&mut self, immediate: bool) -> Result<()> {
        if immediate && !self.immediate {
            self.execute()?;
        }
        self.immediate = immediate;
        Ok(())
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn set_expected(&mut self, expected: usize) {
        self.expected = expected;
    }

    pub fn add_expected(&mut self, count: usize) {
        self.expected += count;
    }

    /// Whether the block has unread incoming messages.
    pub fn has_incoming(&self, lid: Lid) -> bool {
        self.registry
            .cell(lid)
            .map_or(false, |cell| cell.lock().incoming.has_pending())
    }

    pub fn incoming_count(&self, lid: Lid) -> usize {
        self.registry
            .cell(lid)
            .map_or(0, |cell| cell.lock().incoming.len())
    }

    pub fn outgoing_count(&self, lid: Lid) -> usize {
        self.registry
            .cell(lid)
            .map_or(0, |cell| cell.lock().outgoing.count())
    }

    /// Logs every incoming queue record.
    pub fn show_incoming_records(&self) {
        for (_, cell) in self.registry.cells() {
            let cell = cell.lock();
            cell.incoming.show(cell.gid);
        }
    }
}

impl<B: Block, C: Communicator> Drop for Master<B, C> {
    fn drop(&mut self) {
        if self.commands.is_empty() {
            return;
        }
        debug!("running {} batched commands before shutdown", self.commands.len());
        if let Err(e) = self.execute() {
            warn!("batched commands failed at shutdown: {}", e);
        }
    }
}
