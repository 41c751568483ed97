use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Barrier,
    },
};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use super::{Collectives, Communicator, Request, Status, Tag};
use crate::{error::TransportError, link::Rank};

/// An in-process communicator world: every rank is an endpoint that lives on
/// its own thread and talks to the others through channels. Each rank gets a
/// single inbox, so messages from one source arrive in the order they were
/// sent.
pub struct LocalWorld;

impl LocalWorld {
    /// Creates the endpoints of a world with `size` ranks, indexed by rank.
    pub fn new(size: usize) -> Vec<LocalComm> {
        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..size).map(|_| mpsc::unbounded_channel()).unzip();
        let rendezvous = Arc::new(Rendezvous {
            barrier: Barrier::new(size),
            slots: Mutex::new(vec![Vec::new(); size]),
        });
        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| LocalComm {
                rank: rank as Rank,
                outboxes: senders.clone(),
                inbox,
                pending: VecDeque::new(),
                rendezvous: rendezvous.clone(),
            })
            .collect()
    }
}

struct Envelope {
    source: Rank,
    tag: Tag,
    payload: Bytes,
    delivered: Arc<AtomicBool>,
}

struct Rendezvous {
    barrier: Barrier,
    slots: Mutex<Vec<Vec<u8>>>,
}

pub struct LocalComm {
    rank: Rank,
    outboxes: Vec<mpsc::UnboundedSender<Envelope>>,
    inbox: mpsc::UnboundedReceiver<Envelope>,
    // envelopes taken off the channel but not yet received
    pending: VecDeque<Envelope>,
    rendezvous: Arc<Rendezvous>,
}

/// Completes once the destination has received the message.
pub struct LocalRequest {
    delivered: Arc<AtomicBool>,
}

impl Request for LocalRequest {
    fn test(&mut self) -> bool {
        self.delivered.load(Ordering::Acquire)
    }
}

impl Collectives for LocalComm {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.outboxes.len()
    }

    fn all_gather(&mut self, contribution: Vec<u8>) -> Result<Vec<Vec<u8>>, TransportError> {
        self.rendezvous.slots.lock()[self.rank as usize] = contribution;
        self.rendezvous.barrier.wait();
        let all = self.rendezvous.slots.lock().clone();
        // nobody may overwrite a slot before everyone has read it
        self.rendezvous.barrier.wait();
        Ok(all)
    }

    fn barrier(&mut self) -> Result<(), TransportError> {
        self.rendezvous.barrier.wait();
        Ok(())
    }
}

impl Communicator for LocalComm {
    type Request = LocalRequest;

    fn isend(
        &mut self,
        dest: Rank,
        tag: Tag,
        payload: Bytes,
    ) -> Result<LocalRequest, TransportError> {
        let outbox = self
            .outboxes
            .get(dest as usize)
            .ok_or(TransportError::UnknownRank(dest))?;
        let delivered = Arc::new(AtomicBool::new(false));
        trace!(
            "isend {} -> {} tag={:?} bytes={}",
            self.rank,
            dest,
            tag,
            payload.len()
        );
        outbox
            .send(Envelope {
                source: self.rank,
                tag,
                payload,
                delivered: delivered.clone(),
            })
            .map_err(|_| TransportError::Disconnected(dest))?;
        Ok(LocalRequest { delivered })
    }

    fn peek(&mut self) -> Option<Status> {
        while let Ok(envelope) = self.inbox.try_recv() {
            self.pending.push_back(envelope);
        }
        self.pending.front().map(|e| Status {
            source: e.source,
            tag: e.tag,
            count: e.payload.len(),
        })
    }

    fn recv(&mut self, status: &Status) -> Result<Bytes, TransportError> {
        let pos = self
            .pending
            .iter()
            .position(|e| e.source == status.source && e.tag == status.tag)
            .ok_or(TransportError::NothingToReceive(status.source))?;
        // position() found it, so remove() can't miss
        let envelope = self
            .pending
            .remove(pos)
            .ok_or(TransportError::NothingToReceive(status.source))?;
        envelope.delivered.store(true, Ordering::Release);
        Ok(envelope.payload)
    }
}
