// Two exchange protocols share one set of moves: hand every block's outgoing
// queues to the transport (or straight to the target block when it lives on
// this rank), retire finished sends, and deliver whatever has arrived.
//
// `flush` repeats those moves until every queue is out and every expected
// queue is in, then runs the collectives and waits for all ranks. `iexchange`
// interleaves them with the block callbacks and stops once every rank agrees
// that every block is done and no message is left anywhere. The second part
// is decided by counting: all ranks sum what they have sent and received, and
// the run is quiet when the sums match and did not move over a whole wave.

use std::{
    collections::VecDeque,
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, debug_span, info, trace};

use super::{
    collectives,
    proxy::{IProxyWithLink, Proxy, ProxyWithLink},
    queues::{require, Outbound},
    registry::{Block, BlockCell, Residency},
    Master,
};
use crate::{
    comm::{wire::ReceivedQueue, Communicator},
    error::{Error, Result, WireError},
    link::{Gid, Lid},
    serialization::MemoryBuffer,
    storage::Handle,
};

impl<B: Block, C: Communicator> Master<B, C> {
    /// Runs the pending commands, then delivers every block's outgoing queues
    /// and waits for the queues each block expects. Every neighbour in a
    /// block's link gets a queue, empty or not.
    pub fn exchange(&mut self) -> Result<()> {
        self.execute()?;

        debug!("starting exchange");
        // destroyed blocks keep their link and still owe their neighbours a
        // queue, released ones have no link left
        for (_, cell) in self.registry.cells() {
            let mut cell = cell.lock();
            let BlockCell { link, outgoing, .. } = &mut *cell;
            for target in link.neighbors() {
                if !outgoing.has_external_local(target) {
                    outgoing.queue(*target);
                }
            }
        }

        self.flush()?;
        debug!("finished exchange");
        Ok(())
    }

    /// Delivers every outgoing queue, receives until the expected number of
    /// queues has arrived, and then processes collectives. Ends in a barrier.
    pub fn flush(&mut self) -> Result<()> {
        let span = debug_span!("flush", rank = self.rank());
        let _enter = span.enter();

        let mut to_send = self.prep_out();
        let out_limit = self.limit_out(to_send.len());
        debug!("{} blocks with outgoing queues", to_send.len());

        let start = Instant::now();
        let mut wait = 1;
        loop {
            self.send_outgoing(&mut to_send, out_limit, false)?;
            while self.transport.nudge() {}
            self.receive_incoming()?;

            if self.transport.inflight() == 0
                && self.received >= self.expected
                && to_send.is_empty()
            {
                break;
            }

            if start.elapsed() > Duration::from_secs(wait) {
                debug!(
                    "waiting in flush: {} in flight, {} partial, received {} of {}",
                    self.transport.inflight(),
                    self.transport.partial_receives(),
                    self.received,
                    self.expected
                );
                wait *= 2;
            }
            thread::yield_now();
        }

        for (_, cell) in self.registry.cells() {
            cell.lock().outgoing.clear();
        }
        debug!("done in flush");

        self.process_collectives()?;
        self.comm.barrier()?;
        self.received = 0;
        Ok(())
    }

    /// Non-blocking exchange. Calls `f` on every block over and over, moving
    /// messages between calls, until every block on every rank has returned
    /// true and no message is in flight anywhere. A block that returned true
    /// is still called again if others are not done.
    pub fn iexchange<F>(&mut self, mut f: F) -> Result<()>
    where
        F: FnMut(&mut B, &mut IProxyWithLink<'_>) -> bool,
    {
        let span = debug_span!("iexchange", rank = self.rank());
        let _enter = span.enter();

        self.execute()?;
        self.communicate()?;

        let mut previous = None;
        let mut wave = 0usize;
        loop {
            wave += 1;
            let mut all_done = true;
            for lid in 0..self.registry.len() {
                if self.registry.cell(lid)?.lock().is_released() {
                    continue;
                }
                self.ensure_resident(lid)?;
                let done = {
                    let mut cell = self.registry.cell(lid)?.lock();
                    self.registry.touch(&mut cell);
                    let BlockCell {
                        gid,
                        residency,
                        link,
                        incoming,
                        outgoing,
                        collectives,
                        ..
                    } = &mut *cell;
                    let Residency::Resident(block) = residency else {
                        return Err(Error::Released(*gid));
                    };
                    let proxy = Proxy::new(*gid, incoming, outgoing, collectives);
                    f(block, &mut ProxyWithLink::new(proxy, link))
                };
                all_done &= done;
                self.communicate()?;
            }

            let local_done = all_done && !self.has_pending_outgoing();
            let (done, sent, received) = self.agree(local_done)?;
            trace!(
                "wave {}: done={} sent={} received={}",
                wave,
                done,
                sent,
                received
            );
            if done && sent == received && previous == Some((sent, received)) {
                break;
            }
            previous = Some((sent, received));
        }
        debug!("iexchange finished after {} waves", wave);
        Ok(())
    }

    /// Sums the done flags and the message counters of all ranks.
    fn agree(&mut self, local_done: bool) -> Result<(bool, u64, u64)> {
        let mut bb = MemoryBuffer::new();
        bb.save(&local_done);
        bb.save(&self.sent_total);
        bb.save(&self.received_total);

        let (mut done, mut sent, mut received) = (true, 0u64, 0u64);
        for vote in self.comm.all_gather(bb.into_vec())? {
            let mut bb = MemoryBuffer::from_vec(vote);
            done &= bb.load::<bool>()?;
            sent += bb.load::<u64>()?;
            received += bb.load::<u64>()?;
        }
        Ok((done, sent, received))
    }

    /// One round of non-blocking progress, with at most `max_recv_tries`
    /// attempts at receiving.
    fn communicate(&mut self) -> Result<()> {
        let mut to_send = self.prep_out();
        let out_limit = self.limit_out(to_send.len());

        let mut tries = 0;
        loop {
            self.send_outgoing(&mut to_send, out_limit, true)?;
            while self.transport.nudge() {}
            self.receive_incoming()?;
            tries += 1;

            let finished = self.transport.inflight() == 0
                && self.received >= self.expected
                && to_send.is_empty();
            if finished || tries >= self.max_recv_tries {
                break;
            }
        }
        self.received = 0;
        Ok(())
    }

    /// Lids of the blocks whose queues go out, those with queues still in
    /// memory first.
    fn prep_out(&self) -> VecDeque<Lid> {
        let mut to_send = VecDeque::with_capacity(self.registry.len());
        for (lid, cell) in self.registry.cells() {
            let cell = cell.lock();
            if cell.outgoing.is_external() {
                to_send.push_back(lid);
            } else {
                to_send.push_front(lid);
            }
        }
        to_send
    }

    /// How many transfers may be in flight at once. With a limit on blocks
    /// in memory, the queues in flight are limited in proportion.
    fn limit_out(&self, to_send: usize) -> usize {
        match self.limit {
            Some(limit) if self.size() > 0 => (to_send / self.size() * limit).max(1),
            _ => to_send,
        }
    }

    fn has_pending_outgoing(&self) -> bool {
        self.registry
            .cells()
            .any(|(_, cell)| cell.lock().outgoing.has_pending())
    }

    fn send_outgoing(
        &mut self,
        to_send: &mut VecDeque<Lid>,
        out_limit: usize,
        skip_empty: bool,
    ) -> Result<()> {
        let rank = self.rank();
        while self.transport.inflight() < out_limit {
            let Some(lid) = to_send.pop_front() else {
                break;
            };
            let (from, outbound) = {
                let mut cell = self.registry.cell(lid)?.lock();
                let from = cell.gid;
                (from, cell.outgoing.take(from, self.registry.storage())?)
            };

            for (to, queue) in outbound {
                match queue {
                    Outbound::Spilled { handle, size } => {
                        debug!("moving spilled queue {} <- {}", to.gid, from);
                        self.sent_total += 1;
                        self.deliver_spilled(from, to.gid, handle, size)?;
                    }
                    Outbound::Memory(queue) if skip_empty && queue.is_empty() => {
                        trace!("skipping empty queue {} <- {}", to.gid, from);
                    }
                    Outbound::Memory(queue) if to.proc == rank => {
                        trace!("moving queue in place {} <- {}", to.gid, from);
                        self.sent_total += 1;
                        self.deliver(from, to.gid, queue)?;
                    }
                    Outbound::Memory(queue) => {
                        self.transport.send_queue(&mut self.comm, from, to, queue)?;
                        self.sent_total += 1;
                    }
                }
            }
        }
        Ok(())
    }

    fn receive_incoming(&mut self) -> Result<()> {
        for ReceivedQueue { from, to, queue } in
            self.transport.receive_available(&mut self.comm)?
        {
            self.deliver(from, to, queue)?;
        }
        Ok(())
    }

    fn local_cell(&self, to: Gid) -> Result<Lid> {
        Ok(*self.lids.get(&to).ok_or(WireError::NotLocal(to))?)
    }

    fn delivered(&mut self) {
        self.received += 1;
        self.received_total += 1;
    }

    fn deliver(&mut self, from: Gid, to: Gid, queue: MemoryBuffer) -> Result<()> {
        let lid = self.local_cell(to)?;
        {
            let mut cell = self.registry.cell(lid)?.lock();
            if cell.is_released() {
                trace!("dropping queue {} <- {} for a destroyed block", to, from);
            } else {
                let resident = cell.is_resident();
                cell.incoming.deliver(
                    from,
                    to,
                    queue,
                    resident,
                    self.registry.storage(),
                    self.registry.policy(),
                )?;
            }
        }
        self.delivered();
        Ok(())
    }

    /// A queue between two blocks of this rank that is already in storage.
    /// Unless the target needs it in memory, only the handle moves.
    fn deliver_spilled(
        &mut self,
        from: Gid,
        to: Gid,
        handle: Handle,
        size: usize,
    ) -> Result<()> {
        let lid = self.local_cell(to)?;
        {
            let mut cell = self.registry.cell(lid)?.lock();
            let resident = cell.is_resident();
            if cell.is_released() {
                trace!("dropping queue {} <- {} for a destroyed block", to, from);
                require(self.registry.storage(), from)?.discard(handle)?;
            } else if !resident && cell.incoming.is_vacant(from) {
                cell.incoming.adopt(from, handle, size);
            } else {
                let mut queue = MemoryBuffer::new();
                require(self.registry.storage(), from)?.get(handle, &mut queue)?;
                cell.incoming.deliver(
                    from,
                    to,
                    queue,
                    resident,
                    self.registry.storage(),
                    self.registry.policy(),
                )?;
            }
        }
        self.delivered();
        Ok(())
    }

    /// Carries out the collectives registered since the last exchange. All
    /// local blocks must have registered the same number of them, and so must
    /// every rank that has blocks.
    fn process_collectives(&mut self) -> Result<()> {
        let mut lids = Vec::new();
        let mut gids = Vec::new();
        let mut columns = Vec::new();
        for (lid, cell) in self.registry.cells() {
            let mut cell = cell.lock();
            if cell.is_released() {
                continue;
            }
            lids.push(lid);
            gids.push(cell.gid);
            columns.push(cell.collectives.take_pending());
        }

        let count = columns.first().map_or(0, Vec::len);
        let mismatch = gids
            .iter()
            .zip(&columns)
            .find(|(_, ops)| ops.len() != count)
            .map(|(gid, ops)| Error::CollectiveMismatch {
                first: gids[0],
                gid: *gid,
                expected: count,
                found: ops.len(),
            });

        // ranks must agree on the count before anyone starts reducing, or
        // some would wait in a reduction the others never join
        let mut bb = MemoryBuffer::new();
        bb.save(&!columns.is_empty());
        bb.save(&mismatch.is_none());
        bb.save(&count);
        let votes = self.comm.all_gather(bb.into_vec())?;
        if let Some(e) = mismatch {
            return Err(e);
        }

        let rank = self.rank();
        let mut agreed = columns.first().map(|_| count);
        for (other, vote) in votes.into_iter().enumerate() {
            let mut bb = MemoryBuffer::from_vec(vote);
            let has_blocks = bb.load::<bool>()?;
            let aligned = bb.load::<bool>()?;
            let found = bb.load::<usize>()?;
            if !has_blocks || other as i32 == rank {
                continue;
            }
            match agreed {
                Some(expected) if !aligned || expected != found => {
                    return Err(Error::CollectiveRankMismatch {
                        rank: other as i32,
                        expected,
                        found,
                    });
                }
                None if !aligned => {
                    return Err(Error::CollectiveRankMismatch {
                        rank: other as i32,
                        expected: found,
                        found,
                    });
                }
                None => agreed = Some(found),
                Some(_) => {}
            }
        }

        let count = agreed.unwrap_or(0);
        if count == 0 {
            return Ok(());
        }
        debug!("processing {} collectives", count);
        collectives::process(&mut columns, count, &mut self.comm)?;

        for (lid, ops) in lids.into_iter().zip(columns) {
            self.registry.cell(lid)?.lock().collectives.finish(ops);
        }
        Ok(())
    }

    /// Logs what is still waiting to be sent or received.
    pub fn show_pending(&self) {
        info!(
            "{} transfers in flight, {} partial receives, outgoing pending: {}",
            self.transport.inflight(),
            self.transport.partial_receives(),
            self.has_pending_outgoing()
        );
    }
}
