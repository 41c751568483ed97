use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tracing::debug;

use super::{
    collectives::CollectiveQueue,
    queues::{require, IncomingQueues, OutgoingQueues, QueuePolicy},
};
use crate::{
    error::{BufferError, Error, Result},
    link::{Gid, Lid, Link, Rank},
    serialization::MemoryBuffer,
    storage::{ExternalStorage, Handle},
};

/// A unit of user data the engine can move between memory and storage.
/// Dropping a block destroys it.
pub trait Block: Send + 'static {
    /// An empty block, to be filled by [`load`](Block::load).
    fn create() -> Self
    where
        Self: Sized;
    fn save(&self, bb: &mut MemoryBuffer);
    fn load(&mut self, bb: &mut MemoryBuffer) -> Result<(), BufferError>;
}

pub(crate) enum Residency<B> {
    Resident(B),
    External(Handle),
    Released,
}

/// Everything the engine keeps for one local block. Each cell sits behind its
/// own lock, so workers processing different blocks never contend.
pub(crate) struct BlockCell<B> {
    pub gid: Gid,
    pub residency: Residency<B>,
    pub link: Link,
    pub incoming: IncomingQueues,
    pub outgoing: OutgoingQueues,
    pub collectives: CollectiveQueue,
    touched: u64,
}

impl<B> BlockCell<B> {
    pub fn is_resident(&self) -> bool {
        matches!(self.residency, Residency::Resident(_))
    }

    pub fn is_released(&self) -> bool {
        matches!(self.residency, Residency::Released)
    }

    pub fn block_mut(&mut self) -> Option<&mut B> {
        match &mut self.residency {
            Residency::Resident(block) => Some(block),
            _ => None,
        }
    }
}

/// The arena of local blocks, indexed by lid.
pub(crate) struct Registry<B> {
    cells: Vec<Mutex<BlockCell<B>>>,
    in_memory: AtomicUsize,
    clock: AtomicU64,
    storage: Option<Arc<dyn ExternalStorage>>,
    policy: Box<dyn QueuePolicy>,
    rank: Rank,
}

impl<B: Block> Registry<B> {
    pub fn new(rank: Rank, policy: Box<dyn QueuePolicy>) -> Self {
        Self {
            cells: Vec::new(),
            in_memory: AtomicUsize::new(0),
            clock: AtomicU64::new(0),
            storage: None,
            policy,
            rank,
        }
    }

    pub fn set_storage(&mut self, storage: Arc<dyn ExternalStorage>) {
        self.storage = Some(storage);
    }

    pub fn set_policy(&mut self, policy: Box<dyn QueuePolicy>) {
        self.policy = policy;
    }

    pub fn storage(&self) -> Option<&dyn ExternalStorage> {
        self.storage.as_deref()
    }

    pub fn policy(&self) -> &dyn QueuePolicy {
        self.policy.as_ref()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn in_memory(&self) -> usize {
        self.in_memory.load(Ordering::Acquire)
    }

    pub fn cell(&self, lid: Lid) -> Result<&Mutex<BlockCell<B>>> {
        self.cells.get(lid).ok_or(Error::UnknownBlock(lid))
    }

    pub fn cells(&self) -> impl Iterator<Item = (Lid, &Mutex<BlockCell<B>>)> {
        self.cells.iter().enumerate()
    }

    pub fn push(&mut self, gid: Gid, block: B, link: Link) -> Lid {
        let touched = self.clock.fetch_add(1, Ordering::Relaxed);
        self.cells.push(Mutex::new(BlockCell {
            gid,
            residency: Residency::Resident(block),
            link,
            incoming: IncomingQueues::default(),
            outgoing: OutgoingQueues::default(),
            collectives: CollectiveQueue::default(),
            touched,
        }));
        self.in_memory.fetch_add(1, Ordering::AcqRel);
        self.cells.len() - 1
    }

    /// Drops every block, releasing whatever they hold in storage.
    pub fn clear(&mut self) -> Result<()> {
        for cell in self.cells.iter_mut() {
            let cell = cell.get_mut();
            if let Residency::External(handle) = cell.residency {
                require(self.storage.as_deref(), cell.gid)?.discard(handle)?;
                cell.residency = Residency::Released;
            }
            cell.incoming.discard(cell.gid, self.storage.as_deref())?;
            cell.outgoing.discard(cell.gid, self.storage.as_deref())?;
        }
        self.cells.clear();
        self.in_memory.store(0, Ordering::Release);
        Ok(())
    }

    /// Marks the block as most recently used.
    pub fn touch(&self, cell: &mut BlockCell<B>) {
        cell.touched = self.clock.fetch_add(1, Ordering::Relaxed);
    }

    /// Takes the block out of the cell, leaving a tombstone.
    pub fn take(&self, cell: &mut BlockCell<B>) -> Result<B> {
        match std::mem::replace(&mut cell.residency, Residency::Released) {
            Residency::Resident(block) => {
                self.in_memory.fetch_sub(1, Ordering::AcqRel);
                Ok(block)
            }
            Residency::External(handle) => {
                let mut bb = MemoryBuffer::new();
                require(self.storage(), cell.gid)?.get(handle, &mut bb)?;
                let mut block = B::create();
                block.load(&mut bb)?;
                Ok(block)
            }
            Residency::Released => Err(Error::Released(cell.gid)),
        }
    }

    /// Moves a resident block and its queues to storage.
    pub fn unload(&self, cell: &mut BlockCell<B>) -> Result<()> {
        let Residency::Resident(block) = &cell.residency else {
            return Ok(());
        };
        debug!("unloading block {}", cell.gid);
        let storage = require(self.storage(), cell.gid)?;
        let mut bb = MemoryBuffer::new();
        block.save(&mut bb);
        let handle = storage.put(&bb)?;
        cell.residency = Residency::External(handle);
        self.in_memory.fetch_sub(1, Ordering::AcqRel);
        self.unload_queues(cell)
    }

    /// Brings a stored block and its queues back into memory.
    pub fn load(&self, cell: &mut BlockCell<B>) -> Result<()> {
        let handle = match cell.residency {
            Residency::External(handle) => handle,
            Residency::Resident(_) => return Ok(()),
            Residency::Released => return Err(Error::Released(cell.gid)),
        };
        debug!("loading block {}", cell.gid);
        let mut bb = MemoryBuffer::new();
        require(self.storage(), cell.gid)?.get(handle, &mut bb)?;
        let mut block = B::create();
        block.load(&mut bb)?;
        cell.residency = Residency::Resident(block);
        self.in_memory.fetch_add(1, Ordering::AcqRel);
        self.touch(cell);
        self.load_queues(cell)
    }

    /// Drops the queues of a block, releasing those held in storage.
    pub fn discard_queues(&self, cell: &mut BlockCell<B>) -> Result<()> {
        cell.incoming.discard(cell.gid, self.storage())?;
        cell.outgoing.discard(cell.gid, self.storage())
    }

    pub fn unload_queues(&self, cell: &mut BlockCell<B>) -> Result<()> {
        cell.incoming
            .unload(cell.gid, self.storage(), self.policy())?;
        cell.outgoing
            .unload(cell.gid, self.rank, self.storage(), self.policy())
    }

    pub fn load_queues(&self, cell: &mut BlockCell<B>) -> Result<()> {
        cell.incoming.load(cell.gid, self.storage())?;
        cell.outgoing.load(cell.gid, self.storage())
    }

    /// Unloads the least recently used resident block other than `keep`.
    /// Returns false if there was nothing to unload.
    pub fn evict_lru(&self, keep: Option<Lid>) -> Result<bool> {
        let victim = self
            .cells()
            .filter(|(lid, _)| Some(*lid) != keep)
            .filter_map(|(lid, cell)| {
                let cell = cell.lock();
                cell.is_resident().then_some((cell.touched, lid))
            })
            .min();
        let Some((_, lid)) = victim else {
            return Ok(false);
        };
        self.unload(&mut self.cell(lid)?.lock())?;
        Ok(true)
    }

    /// Unloads blocks until fewer than `limit` are resident.
    pub fn make_room(&self, limit: Option<usize>, keep: Option<Lid>) -> Result<()> {
        let Some(limit) = limit else {
            return Ok(());
        };
        while self.in_memory() >= limit {
            if !self.evict_lru(keep)? {
                break;
            }
        }
        Ok(())
    }
}
