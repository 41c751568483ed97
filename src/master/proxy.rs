use std::ops::{Deref, DerefMut};

use super::{
    collectives::{AllReduce, CollectiveQueue},
    queues::{IncomingQueues, OutgoingQueues},
};
use crate::{
    error::{Error, Result},
    link::{BlockID, Gid, Link},
    serialization::{Load, MemoryBuffer, Save},
};

/// A block's view of the engine while one of its callbacks runs: its own
/// incoming and outgoing queues and its collectives.
pub struct Proxy<'a> {
    gid: Gid,
    incoming: &'a mut IncomingQueues,
    outgoing: &'a mut OutgoingQueues,
    collectives: &'a mut CollectiveQueue,
}

impl<'a> Proxy<'a> {
    pub(crate) fn new(
        gid: Gid,
        incoming: &'a mut IncomingQueues,
        outgoing: &'a mut OutgoingQueues,
        collectives: &'a mut CollectiveQueue,
    ) -> Self {
        Self {
            gid,
            incoming,
            outgoing,
            collectives,
        }
    }

    pub fn gid(&self) -> Gid {
        self.gid
    }

    /// Appends `value` to the queue for `to`.
    pub fn enqueue<T: Save + ?Sized>(&mut self, to: BlockID, value: &T) {
        self.outgoing.queue(to).save(value);
    }

    /// Reads the next value from the queue received from `from`.
    pub fn dequeue<T: Load>(&mut self, from: Gid) -> Result<T> {
        let to = self.gid;
        let queue = self
            .incoming
            .memory_mut(from)
            .ok_or(Error::NoIncomingQueue { from, to })?;
        Ok(queue.load()?)
    }

    /// The queue received from `from`, if there is one.
    pub fn incoming(&mut self, from: Gid) -> Option<&mut MemoryBuffer> {
        self.incoming.memory_mut(from)
    }

    /// Gids of the blocks this block has received queues from, in order.
    pub fn incoming_gids(&self) -> Vec<Gid> {
        self.incoming.gids()
    }

    pub fn outgoing(&mut self, to: BlockID) -> &mut MemoryBuffer {
        self.outgoing.queue(to)
    }

    /// Makes sure a (possibly empty) queue for `to` exists, so `to` gets a
    /// message at the next exchange.
    pub fn touch_outgoing(&mut self, to: BlockID) {
        self.outgoing.queue(to);
    }

    pub fn outgoing_count(&self) -> usize {
        self.outgoing.count()
    }

    /// Registers `value` for a reduction with `op` across all blocks. The
    /// result is available through [`get`](Self::get) after the next blocking
    /// exchange.
    pub fn all_reduce<T, F>(&mut self, value: T, op: F)
    where
        T: Save + Load + Clone + Send + 'static,
        F: Fn(&T, &T) -> T + Send + 'static,
    {
        self.collectives.push(Box::new(AllReduce::new(value, op)));
    }

    /// Takes the oldest unread collective result.
    pub fn get<T: Clone + 'static>(&mut self) -> Option<T> {
        self.collectives.pop()
    }
}

/// A [`Proxy`] that also knows the block's neighbourhood.
pub struct ProxyWithLink<'a> {
    proxy: Proxy<'a>,
    link: &'a Link,
}

/// What the callback of a non-blocking exchange sees.
pub type IProxyWithLink<'a> = ProxyWithLink<'a>;

impl<'a> ProxyWithLink<'a> {
    pub(crate) fn new(proxy: Proxy<'a>, link: &'a Link) -> Self {
        Self { proxy, link }
    }

    pub fn link(&self) -> &Link {
        self.link
    }
}

impl<'a> Deref for ProxyWithLink<'a> {
    type Target = Proxy<'a>;

    fn deref(&self) -> &Self::Target {
        &self.proxy
    }
}

impl<'a> DerefMut for ProxyWithLink<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.proxy
    }
}
