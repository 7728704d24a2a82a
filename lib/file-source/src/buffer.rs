use std::{
    cmp,
    io::{self, BufRead},
};

use bstr::Finder;
use bytes::{Bytes, BytesMut};

use crate::FilePosition;

/// A unit of bytes cut out of a file by [`read_until_with_max_size`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    /// The bytes before a delimiter. The delimiter itself is consumed and
    /// dropped.
    Delimited(Bytes),
    /// Exactly `max_size` bytes with no delimiter among them. The rest of the
    /// line is returned by subsequent calls.
    Oversized(Bytes),
}

/// Read the next chunk of at most `max_size` bytes from `reader`, splitting by
/// `delim`.
///
/// `buf` carries bytes between calls: whatever was read past the last
/// delimiter stays in `buf` and is scanned first on the next call. `position`
/// is advanced by every byte moved out of `reader`, so it always points just
/// past the bytes held in `buf`.
///
/// The return is `Ok(None)` when the reader is exhausted before a complete
/// chunk was found. This happens when we observe an incomplete write; the
/// partial bytes stay in `buf` and the caller should retry once more data is
/// available. Lines longer than `max_size` are never discarded, they are
/// returned as a sequence of [`Chunk::Oversized`] pieces followed by the
/// [`Chunk::Delimited`] tail.
///
/// `delim` is a single code unit of the file's encoding. Matches only count
/// at offsets that are a multiple of its width, and oversized pieces are cut
/// to a multiple of it, so a two byte UTF-16 newline is never found straddling
/// two code units.
///
/// Tweak of
/// <https://github.com/rust-lang/rust/blob/bf843eb9c2d48a80a5992a5d60858e27269f9575/src/libstd/io/mod.rs#L1471>.
pub fn read_until_with_max_size<R: BufRead + ?Sized>(
    reader: &mut R,
    position: &mut FilePosition,
    delim: &[u8],
    buf: &mut BytesMut,
    max_size: usize,
) -> io::Result<Option<Chunk>> {
    debug_assert!(!delim.is_empty() && max_size > 0);
    let delim_finder = Finder::new(delim);
    let delim_len = delim.len();
    let max_size = align_max_size(max_size, delim_len);
    let mut search_from = 0;
    loop {
        if let Some(end) = find_aligned(&delim_finder, buf, search_from, delim_len) {
            if end <= max_size {
                let mut line = buf.split_to(end + delim_len);
                line.truncate(end);
                return Ok(Some(Chunk::Delimited(line.freeze())));
            }
        }
        if buf.len() >= max_size + delim_len {
            return Ok(Some(Chunk::Oversized(buf.split_to(max_size).freeze())));
        }
        // The last, possibly incomplete, code unit is scanned again once more
        // bytes arrive.
        search_from = buf.len() - buf.len() % delim_len;

        let available: &[u8] = match reader.fill_buf() {
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        if available.is_empty() {
            return Ok(None);
        }

        let used = cmp::min(available.len(), max_size + delim_len - buf.len());
        buf.extend_from_slice(&available[..used]);
        reader.consume(used);
        *position += used as u64; // do this at exactly same time
    }
}

/// The largest chunk size not above `max_size` that is a whole number of
/// `unit` sized code units.
pub fn align_max_size(max_size: usize, unit: usize) -> usize {
    cmp::max(max_size - max_size % unit, unit)
}

/// Position of the first match of `finder` in `buf` at or after `from` that
/// starts on a `unit` boundary.
fn find_aligned(finder: &Finder<'_>, buf: &[u8], mut from: usize, unit: usize) -> Option<usize> {
    while from < buf.len() {
        let end = from + finder.find(&buf[from..])?;
        if end % unit == 0 {
            return Some(end);
        }
        from = end + 1;
    }
    None
}
