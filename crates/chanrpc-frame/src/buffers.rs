use std::collections::VecDeque;
use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// Ordered sequence of byte chunks viewed as one logical buffer.
///
/// Pushing a chunk never copies it. Operations that cross chunk boundaries
/// walk the chunk list instead of concatenating, so repeated partial receives
/// stay linear in the amount of data. Empty chunks are never stored.
#[derive(Clone, Default)]
pub struct Buffers {
    chunks: VecDeque<Bytes>,
    len: usize,
}

impl Buffers {
    /// Create an empty aggregator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of buffered bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no bytes are buffered.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of chunks currently held.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Iterate the underlying chunks in order.
    pub fn chunks(&self) -> impl Iterator<Item = &Bytes> {
        self.chunks.iter()
    }

    /// Append a chunk.
    pub fn push(&mut self, chunk: impl Into<Bytes>) {
        let chunk = chunk.into();
        if chunk.is_empty() {
            return;
        }
        self.len += chunk.len();
        self.chunks.push_back(chunk);
    }

    /// Prepend a chunk.
    pub fn unshift(&mut self, chunk: impl Into<Bytes>) {
        let chunk = chunk.into();
        if chunk.is_empty() {
            return;
        }
        self.len += chunk.len();
        self.chunks.push_front(chunk);
    }

    /// Locate byte `index` as `(chunk index, offset within chunk)`.
    pub fn pos(&self, index: usize) -> Result<(usize, usize)> {
        if index >= self.len {
            return Err(FrameError::OutOfRange {
                index,
                len: self.len,
            });
        }
        let mut remaining = index;
        for (chunk_index, chunk) in self.chunks.iter().enumerate() {
            if remaining < chunk.len() {
                return Ok((chunk_index, remaining));
            }
            remaining -= chunk.len();
        }
        Err(FrameError::OutOfRange {
            index,
            len: self.len,
        })
    }

    /// Read the byte at `index`.
    pub fn get(&self, index: usize) -> Result<u8> {
        let (chunk, offset) = self.pos(index)?;
        Ok(self.chunks[chunk][offset])
    }

    /// Overwrite the byte at `index`.
    ///
    /// Chunks are shared and immutable, so the containing chunk is copied
    /// once before the write.
    pub fn set(&mut self, index: usize, value: u8) -> Result<()> {
        let (chunk, offset) = self.pos(index)?;
        let mut owned = BytesMut::from(self.chunks[chunk].as_ref());
        owned[offset] = value;
        self.chunks[chunk] = owned.freeze();
        Ok(())
    }

    /// Contiguous bytes for `start..end`.
    ///
    /// A range inside a single chunk shares that chunk's storage; a range
    /// spanning chunks is copied, touching only the chunks it covers.
    pub fn slice(&self, start: usize, end: usize) -> Result<Bytes> {
        self.check_range(start, end)?;
        if start == end {
            return Ok(Bytes::new());
        }
        let mut cursor = self.cursor(start)?;
        cursor.read(end - start)
    }

    /// Remove `delete_count` bytes at `start` and insert `replacements` there.
    ///
    /// Follows array splice semantics: `delete_count` is clamped to the bytes
    /// available after `start`. The removed bytes are returned as a new
    /// aggregator that shares storage with the original chunks.
    pub fn splice<I>(&mut self, start: usize, delete_count: usize, replacements: I) -> Result<Buffers>
    where
        I: IntoIterator,
        I::Item: Into<Bytes>,
    {
        if start > self.len {
            return Err(FrameError::OutOfRange {
                index: start,
                len: self.len,
            });
        }
        let delete_count = delete_count.min(self.len - start);
        let mut removed = self.split_off(start)?;
        let rest = removed.split_off(delete_count)?;
        for replacement in replacements {
            self.push(replacement);
        }
        self.append(rest);
        Ok(removed)
    }

    /// Split off everything from `at` onward, leaving `..at` in place.
    pub fn split_off(&mut self, at: usize) -> Result<Buffers> {
        if at > self.len {
            return Err(FrameError::OutOfRange {
                index: at,
                len: self.len,
            });
        }
        if at == self.len {
            return Ok(Buffers::new());
        }
        let (chunk, offset) = self.pos(at)?;
        let mut tail = self.chunks.split_off(chunk);
        if offset > 0 {
            if let Some(first) = tail.pop_front() {
                self.chunks.push_back(first.slice(..offset));
                tail.push_front(first.slice(offset..));
            }
        }
        let tail_len = self.len - at;
        self.len = at;
        Ok(Buffers {
            chunks: tail,
            len: tail_len,
        })
    }

    /// Split off `..at`, leaving `at..` in place.
    pub fn split_to(&mut self, at: usize) -> Result<Buffers> {
        let tail = self.split_off(at)?;
        Ok(std::mem::replace(self, tail))
    }

    /// Drop the first `count` bytes.
    pub fn advance(&mut self, count: usize) -> Result<()> {
        self.split_to(count).map(drop)
    }

    /// Move every chunk of `other` to the end of this aggregator.
    pub fn append(&mut self, other: Buffers) {
        for chunk in other.chunks {
            self.push(chunk);
        }
    }

    /// Remove all bytes.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.len = 0;
    }

    /// Position object starting at `offset`.
    ///
    /// The cursor borrows the aggregator, so it cannot outlive a mutation.
    pub fn cursor(&self, offset: usize) -> Result<Cursor<'_>> {
        Cursor::new(self, offset)
    }

    /// The whole buffer as contiguous bytes.
    pub fn to_bytes(&self) -> Bytes {
        match self.chunks.len() {
            0 => Bytes::new(),
            1 => self.chunks[0].clone(),
            _ => {
                let mut out = BytesMut::with_capacity(self.len);
                for chunk in &self.chunks {
                    out.put_slice(chunk);
                }
                out.freeze()
            }
        }
    }

    fn check_range(&self, start: usize, end: usize) -> Result<()> {
        if end > self.len {
            return Err(FrameError::OutOfRange {
                index: end,
                len: self.len,
            });
        }
        if start > end {
            return Err(FrameError::OutOfRange {
                index: start,
                len: self.len,
            });
        }
        Ok(())
    }
}

impl fmt::Debug for Buffers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffers")
            .field("len", &self.len)
            .field("chunks", &self.chunks.len())
            .finish()
    }
}

impl From<Bytes> for Buffers {
    fn from(chunk: Bytes) -> Self {
        let mut buffers = Buffers::new();
        buffers.push(chunk);
        buffers
    }
}

impl From<Vec<u8>> for Buffers {
    fn from(chunk: Vec<u8>) -> Self {
        Bytes::from(chunk).into()
    }
}

impl<B: Into<Bytes>> FromIterator<B> for Buffers {
    fn from_iter<T: IntoIterator<Item = B>>(iter: T) -> Self {
        let mut buffers = Buffers::new();
        for chunk in iter {
            buffers.push(chunk);
        }
        buffers
    }
}

/// Read position inside a [`Buffers`].
///
/// Iterating yields bytes lazily; [`Cursor::reset`] restarts from the offset
/// the cursor was created at.
#[derive(Clone)]
pub struct Cursor<'a> {
    buffers: &'a Buffers,
    origin: usize,
    offset: usize,
    chunk: usize,
    chunk_offset: usize,
}

impl<'a> Cursor<'a> {
    fn new(buffers: &'a Buffers, offset: usize) -> Result<Self> {
        let mut cursor = Self {
            buffers,
            origin: offset,
            offset: 0,
            chunk: 0,
            chunk_offset: 0,
        };
        cursor.seek(offset)?;
        Ok(cursor)
    }

    /// Absolute offset of the next byte.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Bytes left after the current position.
    pub fn remaining(&self) -> usize {
        self.buffers.len - self.offset
    }

    /// The next byte without consuming it.
    pub fn peek(&self) -> Option<u8> {
        self.buffers
            .chunks
            .get(self.chunk)
            .map(|chunk| chunk[self.chunk_offset])
    }

    /// Consume `count` bytes.
    ///
    /// Bytes inside the current chunk are returned without copying.
    pub fn read(&mut self, count: usize) -> Result<Bytes> {
        self.ensure_available(count)?;
        if count == 0 {
            return Ok(Bytes::new());
        }
        let current = &self.buffers.chunks[self.chunk];
        if self.chunk_offset + count <= current.len() {
            let out = current.slice(self.chunk_offset..self.chunk_offset + count);
            self.step(count);
            return Ok(out);
        }

        let mut out = BytesMut::with_capacity(count);
        let mut left = count;
        while left > 0 {
            let chunk = &self.buffers.chunks[self.chunk];
            let take = left.min(chunk.len() - self.chunk_offset);
            out.put_slice(&chunk[self.chunk_offset..self.chunk_offset + take]);
            self.step(take);
            left -= take;
        }
        Ok(out.freeze())
    }

    /// Skip `count` bytes.
    pub fn skip(&mut self, count: usize) -> Result<()> {
        self.ensure_available(count)?;
        let mut left = count;
        while left > 0 {
            let chunk_len = self.buffers.chunks[self.chunk].len();
            let take = left.min(chunk_len - self.chunk_offset);
            self.step(take);
            left -= take;
        }
        Ok(())
    }

    /// Move to absolute `offset`. `offset == len` positions at the end.
    pub fn seek(&mut self, offset: usize) -> Result<()> {
        if offset == self.buffers.len {
            self.offset = offset;
            self.chunk = self.buffers.chunks.len();
            self.chunk_offset = 0;
            return Ok(());
        }
        let (chunk, chunk_offset) = self.buffers.pos(offset)?;
        self.offset = offset;
        self.chunk = chunk;
        self.chunk_offset = chunk_offset;
        Ok(())
    }

    /// Return to the offset the cursor was created at.
    pub fn reset(&mut self) {
        let origin = self.origin;
        if self.seek(origin).is_err() {
            self.offset = self.buffers.len;
            self.chunk = self.buffers.chunks.len();
            self.chunk_offset = 0;
        }
    }

    fn ensure_available(&self, count: usize) -> Result<()> {
        if count > self.remaining() {
            return Err(FrameError::OutOfRange {
                index: self.offset + count,
                len: self.buffers.len,
            });
        }
        Ok(())
    }

    // Advance within the current chunk; `count` never crosses its end.
    fn step(&mut self, count: usize) {
        self.offset += count;
        self.chunk_offset += count;
        if self.chunk_offset == self.buffers.chunks[self.chunk].len() {
            self.chunk += 1;
            self.chunk_offset = 0;
        }
    }
}

impl Iterator for Cursor<'_> {
    type Item = u8;

    fn next(&mut self) -> Option<u8> {
        let byte = self.peek()?;
        self.step(1);
        Some(byte)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.remaining();
        (remaining, Some(remaining))
    }
}

impl fmt::Debug for Cursor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("offset", &self.offset)
            .field("chunk", &self.chunk)
            .field("chunk_offset", &self.chunk_offset)
            .finish()
    }
}
