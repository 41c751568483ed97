// Blocks are processed fork-join: `execute` spawns up to `min(threads, limit)`
// scoped workers, and each claims the next block off a shared cursor until
// none are left. A worker keeps a short list of the blocks it brought into
// memory and unloads all of them once the list reaches its share of the
// limit, so the blocks resident at the end of a pass never exceed the limit.
// A worker only ever holds the lock of the block it is working on.

use std::{
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    thread,
};

use tracing::{debug, debug_span, error};

use super::{
    proxy::{Proxy, ProxyWithLink},
    registry::{Block, BlockCell, Registry, Residency},
    Master,
};
use crate::{
    comm::Communicator,
    error::{Error, Result},
    link::{Gid, Lid},
};

/// What a skip predicate gets to look at.
#[derive(Clone, Copy, Debug)]
pub struct BlockStatus {
    pub lid: Lid,
    pub gid: Gid,
    /// Whether any queue received by the block has unread bytes.
    pub has_incoming: bool,
}

/// Decides whether a block can be skipped. A block is skipped only when every
/// pending command agrees; its callbacks then run without the block.
pub trait Skip: Send + Sync {
    fn skip(&self, status: &BlockStatus) -> bool;
}

impl<F> Skip for F
where
    F: Fn(&BlockStatus) -> bool + Send + Sync,
{
    fn skip(&self, status: &BlockStatus) -> bool {
        self(status)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NeverSkip;

impl Skip for NeverSkip {
    fn skip(&self, _status: &BlockStatus) -> bool {
        false
    }
}

/// Skips blocks that have received nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct SkipNoIncoming;

impl Skip for SkipNoIncoming {
    fn skip(&self, status: &BlockStatus) -> bool {
        !status.has_incoming
    }
}

/// A block callback. It gets `None` when the block is skipped.
pub type Callback<B> =
    Box<dyn Fn(Option<&mut B>, &mut ProxyWithLink<'_>) + Send + Sync + 'static>;

pub(crate) struct Command<B> {
    callback: Callback<B>,
    skip: Box<dyn Skip>,
}

impl<B> Command<B> {
    pub fn new(callback: Callback<B>, skip: Box<dyn Skip>) -> Self {
        Self { callback, skip }
    }
}

/// Runs one command against a locked cell.
fn run<B: Block>(command: &Command<B>, cell: &mut BlockCell<B>, skipped: bool) {
    let BlockCell {
        gid,
        residency,
        link,
        incoming,
        outgoing,
        collectives,
        ..
    } = cell;
    let block = match residency {
        Residency::Resident(block) if !skipped => Some(block),
        _ => None,
    };
    let proxy = Proxy::new(*gid, incoming, outgoing, collectives);
    let mut proxy = ProxyWithLink::new(proxy, link);
    (command.callback)(block, &mut proxy);
}

struct Pass<'m, B> {
    registry: &'m Registry<B>,
    commands: &'m [Command<B>],
    order: &'m [Lid],
    cursor: AtomicUsize,
    abort: AtomicBool,
    local_limit: usize,
}

impl<'m, B: Block> Pass<'m, B> {
    fn work(&self) -> Result<()> {
        debug!("processing with thread {:?}", thread::current().id());
        let mut local: Vec<Lid> = Vec::new();
        while !self.abort.load(Ordering::Relaxed) {
            let cur = self.cursor.fetch_add(1, Ordering::Relaxed);
            let Some(&lid) = self.order.get(cur) else {
                break;
            };
            if let Err(e) = self.process(lid, &mut local) {
                self.abort.store(true, Ordering::Relaxed);
                return Err(e);
            }
        }
        Ok(())
    }

    fn unload_local(&self, local: &mut Vec<Lid>) -> Result<()> {
        if local.len() < self.local_limit {
            return Ok(());
        }
        for lid in local.drain(..) {
            self.registry.unload(&mut self.registry.cell(lid)?.lock())?;
        }
        Ok(())
    }

    fn process(&self, lid: Lid, local: &mut Vec<Lid>) -> Result<()> {
        let (resident, status) = {
            let cell = self.registry.cell(lid)?.lock();
            let status = BlockStatus {
                lid,
                gid: cell.gid,
                has_incoming: cell.incoming.has_pending(),
            };
            (cell.is_resident(), status)
        };
        if resident {
            self.unload_local(local)?;
            local.push(lid);
        }

        debug!("processing block {}", status.gid);
        let skip = self.commands.iter().all(|c| c.skip.skip(&status));
        if skip {
            let mut cell = self.registry.cell(lid)?.lock();
            // a skipped block may still need its queues
            if !resident {
                self.registry.load_queues(&mut cell)?;
            }
            for command in self.commands {
                run(command, &mut cell, true);
                cell.incoming.clear();
            }
            if !resident {
                self.registry.unload_queues(&mut cell)?;
            }
            return Ok(());
        }

        if !resident {
            self.unload_local(local)?;
            self.registry.load(&mut self.registry.cell(lid)?.lock())?;
            local.push(lid);
        }
        let mut cell = self.registry.cell(lid)?.lock();
        self.registry.touch(&mut cell);
        for command in self.commands {
            run(command, &mut cell, false);
            cell.incoming.clear();
        }
        Ok(())
    }
}

impl<B: Block, C: Communicator> Master<B, C> {
    /// Registers a callback to run on every block.
    pub fn foreach<F>(&mut self, f: F) -> Result<()>
    where
        F: Fn(Option<&mut B>, &mut ProxyWithLink<'_>) + Send + Sync + 'static,
    {
        self.foreach_with_skip(f, NeverSkip)
    }

    /// Registers a callback that runs without the block wherever `skip` says
    /// so. Runs right away in immediate mode, otherwise at the next
    /// [`execute`](Self::execute).
    pub fn foreach_with_skip<F, S>(&mut self, f: F, skip: S) -> Result<()>
    where
        F: Fn(Option<&mut B>, &mut ProxyWithLink<'_>) + Send + Sync + 'static,
        S: Skip + 'static,
    {
        self.commands
            .push(Command::new(Box::new(f), Box::new(skip)));
        if self.immediate {
            self.execute()?;
        }
        Ok(())
    }

    /// Runs every pending command on every block.
    pub fn execute(&mut self) -> Result<()> {
        let span = debug_span!("execute", rank = self.rank());
        let _enter = span.enter();
        if self.commands.is_empty() {
            return Ok(());
        }

        // resident blocks go first
        let mut order = Vec::with_capacity(self.registry.len());
        let mut external = Vec::new();
        for (lid, cell) in self.registry.cells() {
            let cell = cell.lock();
            if cell.is_released() {
                continue;
            }
            if cell.is_resident() {
                order.push(lid);
            } else {
                external.push(lid);
            }
        }
        order.extend(external);

        // no more threads than blocks allowed in memory
        let (num_threads, local_limit) = match self.limit {
            None => (self.threads.max(1), order.len().max(1)),
            Some(limit) => {
                let num_threads = self.threads.min(limit).max(1);
                (num_threads, (limit / num_threads).max(1))
            }
        };
        debug!(
            "executing {} commands on {} blocks with {} threads",
            self.commands.len(),
            order.len(),
            num_threads
        );

        let pass = Pass {
            registry: &self.registry,
            commands: &self.commands,
            order: &order,
            cursor: AtomicUsize::new(0),
            abort: AtomicBool::new(false),
            local_limit,
        };
        let result = if num_threads > 1 {
            thread::scope(|s| {
                let mut workers = Vec::with_capacity(num_threads);
                for i in 0..num_threads {
                    let worker = thread::Builder::new()
                        .name(format!("strata-worker-{}", i))
                        .spawn_scoped(s, || pass.work())
                        .map_err(Error::Spawn)?;
                    workers.push(worker);
                }
                let mut result = Ok(());
                for worker in workers {
                    let outcome = worker.join().unwrap_or_else(|_| {
                        error!("worker thread panicked");
                        Err(Error::WorkerPanicked)
                    });
                    if result.is_ok() {
                        result = outcome;
                    }
                }
                result
            })
        } else {
            pass.work()
        };
        self.commands.clear();
        result?;

        for (_, cell) in self.registry.cells() {
            cell.lock().incoming.clear();
        }

        if let Some(limit) = self.limit {
            let in_memory = self.registry.in_memory();
            if in_memory > limit {
                error!("{} blocks in memory, with limit {}", in_memory, limit);
                return Err(Error::ResidencyLimitExceeded { in_memory, limit });
            }
        }
        Ok(())
    }
}
