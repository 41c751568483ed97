use arrayref::{array_ref, array_refs};
use byteorder::{ByteOrder, LittleEndian};
use bytes::Bytes;
use hashbrown::HashMap;
use tracing::trace;

use crate::{
    error::WireError,
    hex::HexDisplayExt,
    link::{Gid, Rank},
    serialization::MemoryBuffer,
};

/// Length of the `(from, to)` pair closing a single-transfer queue message.
pub const TAIL_LEN: usize = 4 + 4;
/// total_size: u64 | from: i32 | to: i32
pub const HEAD_LEN: usize = 8 + 4 + 4;

/// A queue message travels either as one transfer tagged `Queue`, carrying
/// `payload | from | to`, or, when it is larger than the transport's maximum
/// transfer size, as a `Piece`-tagged head record followed by slices of the
/// payload. All slices but the last are tagged `Piece`; the last is tagged
/// `Queue`, which is what closes a message on the receiving side.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum Tag {
    Queue = 0,
    Piece = 1,
}

/// Splits one outgoing queue into the transfers that carry it. Slices of a
/// fragmented message share the queue's allocation.
pub(crate) fn fragment(
    from: Gid,
    to: Gid,
    mut queue: MemoryBuffer,
    max_message_size: usize,
) -> Vec<(Tag, Bytes)> {
    let max = max_message_size.max(1);
    if queue.len() <= max.saturating_sub(TAIL_LEN) {
        queue.save(&(from, to));
        return vec![(Tag::Queue, Bytes::from(queue.into_vec()))];
    }

    let body = Bytes::from(queue.into_vec());
    let mut head = [0u8; HEAD_LEN];
    LittleEndian::write_u64(&mut head[0..8], body.len() as u64);
    LittleEndian::write_i32(&mut head[8..12], from);
    LittleEndian::write_i32(&mut head[12..16], to);

    let npieces = (body.len() + max - 1) / max;
    let mut transfers = Vec::with_capacity(npieces + 1);
    transfers.push((Tag::Piece, Bytes::copy_from_slice(&head)));
    for i in 0..npieces {
        let start = i * max;
        let end = (start + max).min(body.len());
        let tag = if i == npieces - 1 { Tag::Queue } else { Tag::Piece };
        transfers.push((tag, body.slice(start..end)));
    }
    trace!(
        "fragmented {} -> {} into {} pieces of up to {} bytes",
        from,
        to,
        npieces,
        max
    );
    transfers
}

/// A queue message that has been fully received.
#[derive(Debug)]
pub(crate) struct ReceivedQueue {
    pub from: Gid,
    pub to: Gid,
    pub queue: MemoryBuffer,
}

/// Partial receive state for one source rank.
#[derive(Default)]
struct InFlightRecv {
    message: MemoryBuffer,
    from: Gid,
    to: Gid,
    announced: u64,
}

/// Puts fragmented messages back together. Fragments of concurrent messages
/// from different ranks may interleave arbitrarily; a single rank never
/// interleaves two of its own messages, so partial state is keyed by source.
#[derive(Default)]
pub(crate) struct Reassembler {
    inflight: HashMap<Rank, InFlightRecv>,
}

impl Reassembler {
    pub fn accept(
        &mut self,
        source: Rank,
        tag: Tag,
        bytes: Bytes,
    ) -> Result<Option<ReceivedQueue>, WireError> {
        let Some(mut ir) = self.inflight.remove(&source) else {
            return self.accept_first(source, tag, bytes);
        };

        ir.message.extend_from_slice(&bytes);
        if tag == Tag::Piece {
            self.inflight.insert(source, ir);
            return Ok(None);
        }

        if ir.message.len() as u64 != ir.announced {
            Err(WireError::SizeMismatch {
                rank: source,
                announced: ir.announced,
                received: ir.message.len(),
            })?
        }
        trace!(
            "reassembled {} -> {} from rank {}: {} bytes",
            ir.from,
            ir.to,
            source,
            ir.message.len()
        );
        Ok(Some(ReceivedQueue {
            from: ir.from,
            to: ir.to,
            queue: ir.message,
        }))
    }

    fn accept_first(
        &mut self,
        source: Rank,
        tag: Tag,
        bytes: Bytes,
    ) -> Result<Option<ReceivedQueue>, WireError> {
        match tag {
            Tag::Piece => {
                if bytes.len() < HEAD_LEN {
                    Err(WireError::ShortHead(bytes.len()))?
                }
                let head = array_ref![bytes, 0, HEAD_LEN];
                let (size, from, to) = array_refs![head, 8, 4, 4];
                let announced = LittleEndian::read_u64(size);
                let mut message = MemoryBuffer::new();
                message.reserve(announced as usize);
                trace!("head from rank {}: {}", source, head.hex());
                self.inflight.insert(
                    source,
                    InFlightRecv {
                        message,
                        from: LittleEndian::read_i32(from),
                        to: LittleEndian::read_i32(to),
                        announced,
                    },
                );
                Ok(None)
            }
            Tag::Queue => {
                let len = bytes.len();
                let mut queue = MemoryBuffer::from_vec(bytes.to_vec());
                let (from, to) = queue
                    .load_back_pair()
                    .map_err(|_| WireError::MissingTail(len))?;
                trace!(
                    "queue {} -> {} from rank {}: {}",
                    from,
                    to,
                    source,
                    queue.as_slice().hex_preview()
                );
                Ok(Some(ReceivedQueue { from, to, queue }))
            }
        }
    }

    /// Number of sources with a partially received message.
    pub fn in_progress(&self) -> usize {
        self.inflight.len()
    }
}
