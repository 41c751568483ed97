use std::{fmt, io, mem};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::{error::BufferError, hex::HexDisplayExt};

/// A growable byte buffer with a read cursor. Writes always append, reads
/// start at `position` and advance it.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct MemoryBuffer {
    buffer: Vec<u8>,
    position: usize,
}

impl MemoryBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
            position: 0,
        }
    }

    pub fn from_vec(buffer: Vec<u8>) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Number of bytes not yet read.
    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.position
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.position = 0;
    }

    pub fn reserve(&mut self, additional: usize) {
        self.buffer.reserve(additional);
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buffer
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Drops the bytes that have already been read.
    pub fn compact(&mut self) {
        if self.position > 0 {
            self.buffer.drain(..self.position);
            self.position = 0;
        }
    }

    pub fn save<T: Save + ?Sized>(&mut self, value: &T) {
        value.save_to(self);
    }

    pub fn load<T: Load>(&mut self) -> Result<T, BufferError> {
        T::load(self)
    }

    /// Strips a `(from, to)` pair of little-endian `i32`s off the end of the
    /// buffer.
    pub fn load_back_pair(&mut self) -> Result<(i32, i32), BufferError> {
        let len = self.buffer.len();
        if len - self.position < 8 {
            return Err(BufferError::UnexpectedEnd {
                needed: 8,
                available: len - self.position,
            });
        }
        let from = LittleEndian::read_i32(&self.buffer[len - 8..len - 4]);
        let to = LittleEndian::read_i32(&self.buffer[len - 4..]);
        self.buffer.truncate(len - 8);
        Ok((from, to))
    }

    fn take_slice(&mut self, needed: usize) -> Result<&[u8], BufferError> {
        let available = self.remaining();
        if needed > available {
            return Err(BufferError::UnexpectedEnd { needed, available });
        }
        let start = self.position;
        self.position += needed;
        Ok(&self.buffer[start..start + needed])
    }
}

impl fmt::Debug for MemoryBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBuffer")
            .field("len", &self.buffer.len())
            .field("position", &self.position)
            .field("head", &self.buffer.hex_preview())
            .finish()
    }
}

impl From<Vec<u8>> for MemoryBuffer {
    fn from(buffer: Vec<u8>) -> Self {
        Self::from_vec(buffer)
    }
}

impl io::Write for MemoryBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Read for MemoryBuffer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.remaining());
        buf[..n].copy_from_slice(&self.buffer[self.position..self.position + n]);
        self.position += n;
        Ok(n)
    }
}

/// Binary serialization into a [`MemoryBuffer`]. All integers are written
/// little-endian.
pub trait Save {
    fn save_to(&self, bb: &mut MemoryBuffer);
}

/// Binary deserialization out of a [`MemoryBuffer`], reading from its cursor.
pub trait Load: Sized {
    fn load(bb: &mut MemoryBuffer) -> Result<Self, BufferError>;
}

fn short(bb: &MemoryBuffer, needed: usize) -> BufferError {
    BufferError::UnexpectedEnd {
        needed,
        available: bb.remaining(),
    }
}

macro_rules! impl_primitive {
    ($($t:ty => $write:ident, $read:ident;)*) => {
        $(
            impl Save for $t {
                fn save_to(&self, bb: &mut MemoryBuffer) {
                    // writes into a Vec never fail
                    let _ = bb.$write::<LittleEndian>(*self);
                }
            }

            impl Load for $t {
                fn load(bb: &mut MemoryBuffer) -> Result<Self, BufferError> {
                    let needed = mem::size_of::<$t>();
                    if bb.remaining() < needed {
                        return Err(short(bb, needed));
                    }
                    bb.$read::<LittleEndian>().map_err(|_| short(bb, needed))
                }
            }
        )*
    };
}

impl_primitive! {
    u16 => write_u16, read_u16;
    u32 => write_u32, read_u32;
    u64 => write_u64, read_u64;
    i16 => write_i16, read_i16;
    i32 => write_i32, read_i32;
    i64 => write_i64, read_i64;
    f32 => write_f32, read_f32;
    f64 => write_f64, read_f64;
}

impl Save for u8 {
    fn save_to(&self, bb: &mut MemoryBuffer) {
        let _ = bb.write_u8(*self);
    }
}

impl Load for u8 {
    fn load(bb: &mut MemoryBuffer) -> Result<Self, BufferError> {
        if bb.remaining() < 1 {
            return Err(short(bb, 1));
        }
        bb.read_u8().map_err(|_| short(bb, 1))
    }
}

impl Save for bool {
    fn save_to(&self, bb: &mut MemoryBuffer) {
        (*self as u8).save_to(bb);
    }
}

impl Load for bool {
    fn load(bb: &mut MemoryBuffer) -> Result<Self, BufferError> {
        Ok(u8::load(bb)? != 0)
    }
}

impl Save for usize {
    fn save_to(&self, bb: &mut MemoryBuffer) {
        (*self as u64).save_to(bb);
    }
}

impl Load for usize {
    fn load(bb: &mut MemoryBuffer) -> Result<Self, BufferError> {
        Ok(u64::load(bb)? as usize)
    }
}

impl<T: Save> Save for [T] {
    fn save_to(&self, bb: &mut MemoryBuffer) {
        self.len().save_to(bb);
        for item in self {
            item.save_to(bb);
        }
    }
}

impl<T: Save> Save for Vec<T> {
    fn save_to(&self, bb: &mut MemoryBuffer) {
        self.as_slice().save_to(bb);
    }
}

impl<T: Load> Load for Vec<T> {
    fn load(bb: &mut MemoryBuffer) -> Result<Self, BufferError> {
        let len = usize::load(bb)?;
        // don't trust the length prefix for the allocation size
        let mut items = Vec::with_capacity(len.min(bb.remaining()));
        for _ in 0..len {
            items.push(T::load(bb)?);
        }
        Ok(items)
    }
}

impl Save for str {
    fn save_to(&self, bb: &mut MemoryBuffer) {
        self.len().save_to(bb);
        bb.extend_from_slice(self.as_bytes());
    }
}

impl Save for String {
    fn save_to(&self, bb: &mut MemoryBuffer) {
        self.as_str().save_to(bb);
    }
}

impl Load for String {
    fn load(bb: &mut MemoryBuffer) -> Result<Self, BufferError> {
        let len = usize::load(bb)?;
        let bytes = bb.take_slice(len)?.to_vec();
        String::from_utf8(bytes).map_err(|_| BufferError::InvalidUtf8)
    }
}

impl Save for MemoryBuffer {
    fn save_to(&self, bb: &mut MemoryBuffer) {
        self.buffer.len().save_to(bb);
        bb.extend_from_slice(&self.buffer);
    }
}

impl Load for MemoryBuffer {
    fn load(bb: &mut MemoryBuffer) -> Result<Self, BufferError> {
        let len = usize::load(bb)?;
        Ok(MemoryBuffer::from_vec(bb.take_slice(len)?.to_vec()))
    }
}

impl<A: Save, B: Save> Save for (A, B) {
    fn save_to(&self, bb: &mut MemoryBuffer) {
        self.0.save_to(bb);
        self.1.save_to(bb);
    }
}

impl<A: Load, B: Load> Load for (A, B) {
    fn load(bb: &mut MemoryBuffer) -> Result<Self, BufferError> {
        Ok((A::load(bb)?, B::load(bb)?))
    }
}

impl<T: Save> Save for Option<T> {
    fn save_to(&self, bb: &mut MemoryBuffer) {
        match self {
            Some(value) => {
                true.save_to(bb);
                value.save_to(bb);
            }
            None => false.save_to(bb),
        }
    }
}

impl<T: Load> Load for Option<T> {
    fn load(bb: &mut MemoryBuffer) -> Result<Self, BufferError> {
        if bool::load(bb)? {
            Ok(Some(T::load(bb)?))
        } else {
            Ok(None)
        }
    }
}
