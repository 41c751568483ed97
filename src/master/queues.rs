// Every block owns its incoming and outgoing queues. A queue is either held in
// memory or spilled to external storage, and a `QueuePolicy` decides which,
// looking only at sizes. Incoming queues are spilled one sender at a time.
// Outgoing queues are spilled as a set: queues bound for other ranks go into a
// single stored object, while queues bound for blocks on this rank are stored
// one by one so they can later be handed to their target as incoming queues
// without being read back.

use hashbrown::{hash_map::Entry, HashMap};
use tracing::{debug, info};

use crate::{
    config::DEFAULT_QUEUE_THRESHOLD,
    error::{Error, Result},
    link::{BlockID, Gid, Rank},
    serialization::MemoryBuffer,
    storage::{ExternalStorage, Handle},
};

/// Decides which queues move out of core. Both predicates look only at
/// sizes, so implementations should be pure.
pub trait QueuePolicy: Send + Sync {
    /// Whether a queue of `size` bytes sent from `from` to `to` should be
    /// stored externally.
    fn should_unload_incoming(&self, from: Gid, to: Gid, size: usize) -> bool;

    /// Whether the outgoing queues of `from` should be stored externally.
    /// `size` is the serialized size of its queues for other ranks, `count`
    /// the number of its queues in memory.
    fn should_unload_outgoing(&self, from: Gid, size: usize, count: usize) -> bool;
}

/// Moves queues out of core once they are larger than a threshold.
#[derive(Clone, Copy, Debug)]
pub struct QueueSizePolicy {
    threshold: usize,
}

impl QueueSizePolicy {
    pub fn new(threshold: usize) -> Self {
        Self { threshold }
    }
}

impl Default for QueueSizePolicy {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_THRESHOLD)
    }
}

impl QueuePolicy for QueueSizePolicy {
    fn should_unload_incoming(&self, _from: Gid, _to: Gid, size: usize) -> bool {
        size > self.threshold
    }

    fn should_unload_outgoing(&self, _from: Gid, size: usize, count: usize) -> bool {
        size > self.threshold * count
    }
}

pub(crate) fn require(
    storage: Option<&dyn ExternalStorage>,
    gid: Gid,
) -> Result<&dyn ExternalStorage> {
    storage.ok_or(Error::NoStorage(gid))
}

#[derive(Debug)]
pub(crate) enum Queue {
    Memory(MemoryBuffer),
    External { handle: Handle, size: usize },
}

impl Queue {
    /// Bytes still to be read.
    pub fn size(&self) -> usize {
        match self {
            Queue::Memory(bb) => bb.remaining(),
            Queue::External { size, .. } => *size,
        }
    }
}

/// Queues received by one block, keyed by the sending gid.
#[derive(Debug, Default)]
pub(crate) struct IncomingQueues {
    queues: HashMap<Gid, Queue>,
}

impl IncomingQueues {
    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn clear(&mut self) {
        self.queues.clear();
    }

    /// Whether any sender has left unread bytes.
    pub fn has_pending(&self) -> bool {
        self.queues.values().any(|q| q.size() != 0)
    }

    pub fn is_vacant(&self, from: Gid) -> bool {
        !self.queues.contains_key(&from)
    }

    pub fn memory_mut(&mut self, from: Gid) -> Option<&mut MemoryBuffer> {
        match self.queues.get_mut(&from) {
            Some(Queue::Memory(bb)) => Some(bb),
            _ => None,
        }
    }

    pub fn gids(&self) -> Vec<Gid> {
        let mut gids: Vec<_> = self.queues.keys().copied().collect();
        gids.sort_unstable();
        gids
    }

    pub fn unload(
        &mut self,
        to: Gid,
        storage: Option<&dyn ExternalStorage>,
        policy: &dyn QueuePolicy,
    ) -> Result<()> {
        for (from, queue) in self.queues.iter_mut() {
            if let Queue::Memory(bb) = queue {
                bb.compact();
                let size = bb.len();
                if policy.should_unload_incoming(*from, to, size) {
                    debug!("unloading queue {} <- {}", to, from);
                    let handle = require(storage, to)?.put(bb)?;
                    *queue = Queue::External { handle, size };
                }
            }
        }
        Ok(())
    }

    pub fn load(
        &mut self,
        to: Gid,
        storage: Option<&dyn ExternalStorage>,
    ) -> Result<()> {
        for (from, queue) in self.queues.iter_mut() {
            if let Queue::External { handle, .. } = *queue {
                debug!("loading queue {} <- {}", to, from);
                let mut bb = MemoryBuffer::new();
                require(storage, to)?.get(handle, &mut bb)?;
                *queue = Queue::Memory(bb);
            }
        }
        Ok(())
    }

    /// Adds a queue from `from`. Bytes that are still unread in an earlier
    /// queue from the same sender stay in front of the new ones. Unless the
    /// target is in memory, the result is spilled if the policy asks for it.
    pub fn deliver(
        &mut self,
        from: Gid,
        to: Gid,
        queue: MemoryBuffer,
        resident: bool,
        storage: Option<&dyn ExternalStorage>,
        policy: &dyn QueuePolicy,
    ) -> Result<()> {
        let queue = match self.queues.remove(&from) {
            None => queue,
            Some(Queue::Memory(mut old)) => {
                old.compact();
                old.extend_from_slice(queue.as_slice());
                old
            }
            Some(Queue::External { handle, .. }) => {
                let mut old = MemoryBuffer::new();
                require(storage, to)?.get(handle, &mut old)?;
                old.extend_from_slice(queue.as_slice());
                old
            }
        };

        let size = queue.len();
        if resident || !policy.should_unload_incoming(from, to, size) {
            self.queues.insert(from, Queue::Memory(queue));
        } else {
            debug!("directly unloading queue {} <- {}", to, from);
            let handle = require(storage, to)?.put(&queue)?;
            self.queues.insert(from, Queue::External { handle, size });
        }
        Ok(())
    }

    /// Drops every queue, releasing the ones held in storage.
    pub fn discard(&mut self, to: Gid, storage: Option<&dyn ExternalStorage>) -> Result<()> {
        for (_, queue) in self.queues.drain() {
            if let Queue::External { handle, .. } = queue {
                require(storage, to)?.discard(handle)?;
            }
        }
        Ok(())
    }

    /// Takes over a queue that is already in storage.
    pub fn adopt(&mut self, from: Gid, handle: Handle, size: usize) {
        self.queues.insert(from, Queue::External { handle, size });
    }

    pub fn show(&self, to: Gid) {
        for (from, queue) in &self.queues {
            match queue {
                Queue::Memory(bb) => info!(
                    "{} <- {}: {} bytes in memory, {} unread",
                    to,
                    from,
                    bb.len(),
                    bb.remaining()
                ),
                Queue::External { handle, size } => {
                    info!("{} <- {}: {} bytes in {:?}", to, from, size, handle)
                }
            }
        }
    }
}

/// A queue on its way out of a block.
#[derive(Debug)]
pub(crate) enum Outbound {
    Memory(MemoryBuffer),
    /// A queue for a block on this rank, still in storage.
    Spilled { handle: Handle, size: usize },
}

/// Queues written by one block, keyed by destination.
#[derive(Debug, Default)]
pub(crate) struct OutgoingQueues {
    queues: HashMap<BlockID, MemoryBuffer>,
    external: Option<Handle>,
    external_local: HashMap<BlockID, (Handle, usize)>,
}

impl OutgoingQueues {
    pub fn queue(&mut self, to: BlockID) -> &mut MemoryBuffer {
        self.queues.entry(to).or_default()
    }

    /// Number of queues in memory.
    pub fn count(&self) -> usize {
        self.queues.len()
    }

    pub fn is_external(&self) -> bool {
        self.external.is_some()
    }

    /// Whether a queue for `to` was spilled as a local incoming queue.
    pub fn has_external_local(&self, to: &BlockID) -> bool {
        self.external_local.contains_key(to)
    }

    /// Whether anything is waiting to be sent.
    pub fn has_pending(&self) -> bool {
        self.external.is_some()
            || !self.external_local.is_empty()
            || self.queues.values().any(|q| !q.is_empty())
    }

    pub fn clear(&mut self) {
        self.queues.clear();
        self.external = None;
        self.external_local.clear();
    }

    /// Drops every queue, releasing the ones held in storage.
    pub fn discard(
        &mut self,
        from: Gid,
        storage: Option<&dyn ExternalStorage>,
    ) -> Result<()> {
        self.queues.clear();
        if let Some(handle) = self.external.take() {
            require(storage, from)?.discard(handle)?;
        }
        for (_, (handle, _)) in self.external_local.drain() {
            require(storage, from)?.discard(handle)?;
        }
        Ok(())
    }

    pub fn unload(
        &mut self,
        from: Gid,
        rank: Rank,
        storage: Option<&dyn ExternalStorage>,
        policy: &dyn QueuePolicy,
    ) -> Result<()> {
        self.load(from, storage)?;

        // target, length prefix, contents
        let size: usize = self
            .queues
            .iter()
            .filter(|(to, _)| to.proc != rank)
            .map(|(_, q)| 8 + 8 + q.len())
            .sum();
        if !policy.should_unload_outgoing(from, size, self.queues.len()) {
            return Ok(());
        }
        let storage = require(storage, from)?;
        debug!("unloading outgoing queues {} -> ..., size = {}", from, size);

        let (remote, local): (Vec<BlockID>, Vec<BlockID>) =
            self.queues.keys().partition(|to| to.proc != rank);

        for to in local {
            let len = self.queues.get(&to).map_or(0, |q| q.len());
            if !policy.should_unload_incoming(from, to.gid, len) {
                continue;
            }
            let Some(mut queue) = self.queues.remove(&to) else {
                continue;
            };
            if let Some((handle, _)) = self.external_local.remove(&to) {
                let mut earlier = MemoryBuffer::new();
                storage.get(handle, &mut earlier)?;
                earlier.extend_from_slice(queue.as_slice());
                queue = earlier;
            }
            let handle = storage.put(&queue)?;
            self.external_local.insert(to, (handle, queue.len()));
        }

        if !remote.is_empty() {
            let mut bb = MemoryBuffer::with_capacity(8 + size);
            bb.save(&remote.len());
            for to in remote {
                if let Some(queue) = self.queues.remove(&to) {
                    bb.save(&to);
                    bb.save(&queue);
                }
            }
            self.external = Some(storage.put(&bb)?);
        }
        Ok(())
    }

    /// Reads the queues for other ranks back from storage. Anything written
    /// to the same destination since they were spilled goes after them.
    pub fn load(
        &mut self,
        from: Gid,
        storage: Option<&dyn ExternalStorage>,
    ) -> Result<()> {
        let Some(handle) = self.external.take() else {
            return Ok(());
        };
        debug!("loading outgoing queues {} -> ...", from);
        let mut bb = MemoryBuffer::new();
        require(storage, from)?.get(handle, &mut bb)?;
        let count: usize = bb.load()?;
        for _ in 0..count {
            let to: BlockID = bb.load()?;
            let mut spilled: MemoryBuffer = bb.load()?;
            match self.queues.entry(to) {
                Entry::Occupied(mut e) => {
                    spilled.extend_from_slice(e.get().as_slice());
                    e.insert(spilled);
                }
                Entry::Vacant(e) => {
                    e.insert(spilled);
                }
            }
        }
        Ok(())
    }

    /// Empties the record, returning every queue to be delivered.
    pub fn take(
        &mut self,
        from: Gid,
        storage: Option<&dyn ExternalStorage>,
    ) -> Result<Vec<(BlockID, Outbound)>> {
        self.load(from, storage)?;

        let mut outbound =
            Vec::with_capacity(self.queues.len() + self.external_local.len());
        for (to, (handle, size)) in self.external_local.drain() {
            match self.queues.remove(&to) {
                Some(later) => {
                    let mut queue = MemoryBuffer::new();
                    require(storage, from)?.get(handle, &mut queue)?;
                    queue.extend_from_slice(later.as_slice());
                    outbound.push((to, Outbound::Memory(queue)));
                }
                None => outbound.push((to, Outbound::Spilled { handle, size })),
            }
        }
        outbound.extend(
            self.queues
                .drain()
                .map(|(to, queue)| (to, Outbound::Memory(queue))),
        );
        Ok(outbound)
    }
}
