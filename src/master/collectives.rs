use std::{any::Any, collections::VecDeque};

use crate::{
    comm::Collectives,
    error::Result,
    serialization::{Load, MemoryBuffer, Save},
};

/// A reduction registered by one block and carried out across all blocks of
/// all ranks at the end of the next blocking exchange. Every local block
/// registers the same sequence of operations; they are matched by position.
pub trait CollectiveOp: Send {
    /// Resets the running result to this block's own contribution.
    fn init(&mut self);
    /// Folds another block's contribution into the running result.
    fn update(&mut self, other: &dyn CollectiveOp);
    /// Combines the running results of all ranks. Ranks without blocks take
    /// part with an empty contribution.
    fn global(&mut self, comm: &mut dyn Collectives) -> Result<()>;
    /// Takes the final result from the operation that computed it.
    fn copy_from(&mut self, other: &dyn CollectiveOp);
    fn as_any(&self) -> &dyn Any;
    /// The result, once the operation has been processed.
    fn output(&self) -> &dyn Any;
}

/// Reduces one value per block with a commutative, associative operation.
pub struct AllReduce<T, F> {
    input: T,
    output: T,
    op: F,
}

impl<T: Clone, F> AllReduce<T, F> {
    pub fn new(value: T, op: F) -> Self {
        Self {
            input: value.clone(),
            output: value,
            op,
        }
    }
}

impl<T, F> CollectiveOp for AllReduce<T, F>
where
    T: Save + Load + Clone + Send + 'static,
    F: Fn(&T, &T) -> T + Send + 'static,
{
    fn init(&mut self) {
        self.output = self.input.clone();
    }

    fn update(&mut self, other: &dyn CollectiveOp) {
        if let Some(other) = other.as_any().downcast_ref::<Self>() {
            self.output = (self.op)(&self.output, &other.input);
        }
    }

    fn global(&mut self, comm: &mut dyn Collectives) -> Result<()> {
        let mut bb = MemoryBuffer::new();
        bb.save(&Some(self.output.clone()));
        let contributions = comm.all_gather(bb.into_vec())?;

        let mut total: Option<T> = None;
        for contribution in contributions {
            if contribution.is_empty() {
                continue;
            }
            let mut bb = MemoryBuffer::from_vec(contribution);
            if let Some(value) = bb.load::<Option<T>>()? {
                total = Some(match total {
                    Some(total) => (self.op)(&total, &value),
                    None => value,
                });
            }
        }
        if let Some(total) = total {
            self.output = total;
        }
        Ok(())
    }

    fn copy_from(&mut self, other: &dyn CollectiveOp) {
        if let Some(other) = other.as_any().downcast_ref::<Self>() {
            self.output = other.output.clone();
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn output(&self) -> &dyn Any {
        &self.output
    }
}

/// The collectives of one block: those waiting for the next exchange and
/// those whose results have not been read yet.
#[derive(Default)]
pub(crate) struct CollectiveQueue {
    pending: Vec<Box<dyn CollectiveOp>>,
    finished: VecDeque<Box<dyn CollectiveOp>>,
}

impl CollectiveQueue {
    pub fn push(&mut self, op: Box<dyn CollectiveOp>) {
        self.pending.push(op);
    }

    pub fn take_pending(&mut self) -> Vec<Box<dyn CollectiveOp>> {
        std::mem::take(&mut self.pending)
    }

    pub fn finish(&mut self, ops: Vec<Box<dyn CollectiveOp>>) {
        self.finished.extend(ops);
    }

    /// Pops the oldest finished result. `None` if there is none, or if it is
    /// not a `T`, in which case it stays queued.
    pub fn pop<T: Clone + 'static>(&mut self) -> Option<T> {
        let value = self.finished.front()?.output().downcast_ref::<T>()?.clone();
        self.finished.pop_front();
        Some(value)
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.finished.clear();
    }
}

/// Runs one round of collectives over the given per-block columns. Every
/// column holds the same number of operations.
pub(crate) fn process(
    columns: &mut [Vec<Box<dyn CollectiveOp>>],
    count: usize,
    comm: &mut dyn Collectives,
) -> Result<()> {
    for k in 0..count {
        let Some((first, rest)) = columns.split_first_mut() else {
            comm.all_gather(Vec::new())?;
            continue;
        };
        let root = &mut first[k];
        root.init();
        for ops in rest.iter() {
            root.update(&*ops[k]);
        }
        root.global(comm)?;
        for ops in rest.iter_mut() {
            ops[k].copy_from(&**root);
        }
    }
    Ok(())
}
