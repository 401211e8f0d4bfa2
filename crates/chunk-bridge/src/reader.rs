//! Chunk reader bridge: host stream → engine loader.
//!
//! The engine pulls fragments through [`ChunkSource::next_fragment`]; each
//! pull asks the host reader to fill one fixed-size read buffer.
//!
//! # End of input
//!
//! A reader that fails is reported to the engine exactly like a reader at
//! end of stream: the engine sees "no more data" and finishes with whatever
//! it has. The failure is logged, never retried, and not surfaced as a
//! separate error. A failed read partway through a chunk therefore shows up
//! as a truncated (and usually rejected) chunk.

use std::io;

use crate::alloc::{Allocator, Block};
use crate::engine::{ChunkSource, CompiledChunk, Engine};
use crate::{Error, Result};

/// Result of one host read.
#[derive(Debug)]
pub enum ReadOutcome {
    /// `n` bytes were written to the front of the buffer.
    Data(usize),
    Eof,
    Error(io::Error),
}

/// Host-side byte source. `buf.len()` is the maximum to read.
pub trait HostReader {
    fn read(&mut self, buf: &mut [u8]) -> ReadOutcome;
}

impl<R: HostReader + ?Sized> HostReader for &mut R {
    fn read(&mut self, buf: &mut [u8]) -> ReadOutcome {
        (**self).read(buf)
    }
}

/// Adapts any [`io::Read`]. One host read is exactly one `read` call.
#[derive(Debug)]
pub struct IoReader<R>(pub R);

impl<R: io::Read> HostReader for IoReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> ReadOutcome {
        match self.0.read(buf) {
            Ok(0) => ReadOutcome::Eof,
            Ok(n) => ReadOutcome::Data(n),
            Err(e) => ReadOutcome::Error(e),
        }
    }
}

/// Reads from an in-memory byte slice.
#[derive(Debug, Clone)]
pub struct SliceReader<'a> {
    bytes: &'a [u8],
}

impl<'a> SliceReader<'a> {
    #[must_use]
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.bytes.len()
    }
}

impl HostReader for SliceReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> ReadOutcome {
        if self.bytes.is_empty() {
            return ReadOutcome::Eof;
        }
        let n = buf.len().min(self.bytes.len());
        let (head, tail) = self.bytes.split_at(n);
        buf[..n].copy_from_slice(head);
        self.bytes = tail;
        ReadOutcome::Data(n)
    }
}

/// The per-load read buffer. Released through the allocator exactly once:
/// at end of input, or on drop if the engine stopped pulling earlier.
struct ReadBuffer<'a> {
    allocator: &'a Allocator,
    block: Option<Block>,
}

impl<'a> ReadBuffer<'a> {
    fn acquire(allocator: &'a Allocator, capacity: usize) -> Result<Self> {
        let block = allocator.allocate(capacity)?;
        Ok(Self {
            allocator,
            block: Some(block),
        })
    }

    fn release(&mut self) {
        if let Some(block) = self.block.take() {
            self.allocator.release(block);
        }
    }

    fn is_live(&self) -> bool {
        self.block.is_some()
    }
}

impl Drop for ReadBuffer<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

/// [`ChunkSource`] over a host reader and a fixed-capacity read buffer.
pub struct ChunkReader<'a, R: HostReader + ?Sized> {
    reader: &'a mut R,
    buffer: ReadBuffer<'a>,
    capacity: usize,
    fragments: usize,
    bytes: usize,
}

impl<'a, R: HostReader + ?Sized> ChunkReader<'a, R> {
    /// Allocate a `capacity`-byte buffer through `allocator`.
    pub fn new(allocator: &'a Allocator, reader: &'a mut R, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::InvalidArgument(
                "read buffer size must be non-zero".to_string(),
            ));
        }
        let buffer = ReadBuffer::acquire(allocator, capacity)?;
        Ok(Self {
            reader,
            buffer,
            capacity,
            fragments: 0,
            bytes: 0,
        })
    }

    /// Fragments handed to the engine so far.
    #[must_use]
    pub fn fragments(&self) -> usize {
        self.fragments
    }

    /// Bytes handed to the engine so far.
    #[must_use]
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// `false` once end of input has been signalled and the buffer released.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.buffer.is_live()
    }
}

impl<R: HostReader + ?Sized> ChunkSource for ChunkReader<'_, R> {
    fn next_fragment(&mut self) -> Option<&[u8]> {
        let outcome = {
            let block = self.buffer.block.as_mut()?;
            let buf = block.as_mut_slice();
            buf.fill(0);
            self.reader.read(buf)
        };

        let n = match outcome {
            ReadOutcome::Data(0) | ReadOutcome::Eof => {
                self.buffer.release();
                return None;
            }
            ReadOutcome::Error(e) => {
                tracing::debug!(error = %e, "host read failed, treating as end of input");
                self.buffer.release();
                return None;
            }
            ReadOutcome::Data(n) if n > self.capacity => {
                tracing::warn!(
                    claimed = n,
                    capacity = self.capacity,
                    "reader claimed more bytes than the buffer holds, clamping"
                );
                self.capacity
            }
            ReadOutcome::Data(n) => n,
        };

        self.fragments += 1;
        self.bytes += n;
        tracing::trace!(fragment = self.fragments, len = n, "fragment");
        self.buffer.block.as_ref().map(|block| &block.as_slice()[..n])
    }
}

/// Load one chunk from `reader` into `engine`, reading up to `buffer_size`
/// bytes per fragment.
pub(crate) fn load_chunk<R: HostReader + ?Sized>(
    engine: &mut dyn Engine,
    allocator: &Allocator,
    reader: &mut R,
    buffer_size: usize,
    chunk_name: &str,
) -> Result<CompiledChunk> {
    let mut source = ChunkReader::new(allocator, reader, buffer_size)?;
    tracing::debug!(chunk_name, buffer_size, "loading chunk");

    let result = engine.load(allocator, &mut source, chunk_name);
    let (fragments, bytes) = (source.fragments(), source.bytes());
    drop(source);

    match result {
        Ok(chunk) => {
            tracing::debug!(chunk_name, fragments, bytes, len = chunk.len(), "chunk loaded");
            Ok(chunk)
        }
        Err(failure) => {
            tracing::debug!(chunk_name, fragments, bytes, ?failure, "chunk rejected");
            Err(failure.into())
        }
    }
}
