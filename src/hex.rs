use core::fmt;

/// Bytes shown by [`HexDisplayExt::hex_preview`] before eliding the rest.
const PREVIEW_BYTES: usize = 16;

/// Hex rendering of a byte slice for log lines, optionally cut short.
pub struct HexSlice<'a> {
    data: &'a [u8],
    limit: Option<usize>,
}

impl fmt::Display for HexSlice<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown = match self.limit {
            Some(limit) => &self.data[..self.data.len().min(limit)],
            None => self.data,
        };
        for byte in shown {
            write!(f, "{:02X}", byte)?;
        }
        if shown.len() < self.data.len() {
            write!(f, "..(+{}B)", self.data.len() - shown.len())?;
        }
        Ok(())
    }
}

impl fmt::Debug for HexSlice<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

pub trait HexDisplayExt {
    fn hex(&self) -> HexSlice<'_>;
    /// Like [`hex`](HexDisplayExt::hex), but only the first few bytes. Queue
    /// payloads can be gigabytes, so trace logs use this.
    fn hex_preview(&self) -> HexSlice<'_>;
}

impl<T> HexDisplayExt for T
where
    T: ?Sized + AsRef<[u8]>,
{
    fn hex(&self) -> HexSlice<'_> {
        HexSlice {
            data: self.as_ref(),
            limit: None,
        }
    }

    fn hex_preview(&self) -> HexSlice<'_> {
        HexSlice {
            data: self.as_ref(),
            limit: Some(PREVIEW_BYTES),
        }
    }
}
