use std::collections::VecDeque;

use bytes::Bytes;
use tracing::trace;

use super::{
    wire::{fragment, Reassembler, ReceivedQueue, Tag},
    Communicator, Request,
};
use crate::{
    error::Result,
    hex::HexDisplayExt,
    link::{BlockID, Gid},
    serialization::MemoryBuffer,
};

/// One transfer the communicator has not finished with yet. The payload is
/// held here until the request completes.
struct InFlightSend<R> {
    #[allow(dead_code)]
    message: Bytes,
    request: R,
}

/// The point-to-point primitive shared by both exchange protocols: send a
/// queue, retire completed sends, and drain whatever has arrived. Nothing
/// here blocks or retries; callers loop until the state they need is reached.
pub(crate) struct Transport<R> {
    inflight_sends: VecDeque<InFlightSend<R>>,
    reassembler: Reassembler,
    max_message_size: usize,
}

impl<R: Request> Transport<R> {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            inflight_sends: VecDeque::new(),
            reassembler: Reassembler::default(),
            max_message_size,
        }
    }

    /// Starts sending one queue to a block on another rank.
    pub fn send_queue<C>(
        &mut self,
        comm: &mut C,
        from: Gid,
        to: BlockID,
        queue: MemoryBuffer,
    ) -> Result<()>
    where
        C: Communicator<Request = R>,
    {
        trace!(
            "sending queue {} -> {}: {}",
            from,
            to,
            queue.as_slice().hex_preview()
        );
        for (tag, message) in fragment(from, to.gid, queue, self.max_message_size)
        {
            let request = comm.isend(to.proc, tag, message.clone())?;
            self.inflight_sends.push_back(InFlightSend { message, request });
        }
        Ok(())
    }

    /// Retires every completed send. Returns true if any were retired.
    pub fn nudge(&mut self) -> bool {
        let before = self.inflight_sends.len();
        self.inflight_sends.retain_mut(|send| !send.request.test());
        before != self.inflight_sends.len()
    }

    /// Receives every message currently available and returns the queues it
    /// completed.
    pub fn receive_available<C>(
        &mut self,
        comm: &mut C,
    ) -> Result<Vec<ReceivedQueue>>
    where
        C: Communicator<Request = R>,
    {
        let mut completed = Vec::new();
        while let Some(status) = comm.peek() {
            let bytes = comm.recv(&status)?;
            if status.tag == Tag::Piece {
                trace!("piece of {} bytes from rank {}", bytes.len(), status.source);
            }
            if let Some(queue) =
                self.reassembler.accept(status.source, status.tag, bytes)?
            {
                completed.push(queue);
            }
        }
        Ok(completed)
    }

    /// Number of transfers still outstanding.
    pub fn inflight(&self) -> usize {
        self.inflight_sends.len()
    }

    /// Number of sources with a partially received message.
    pub fn partial_receives(&self) -> usize {
        self.reassembler.in_progress()
    }
}
