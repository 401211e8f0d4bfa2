//! Chunk writer bridge: engine dumper → host stream.
//!
//! Every segment the engine produces is forwarded to the host writer in a
//! single `write` call. A writer that accepts fewer bytes than offered, or
//! fails outright, aborts the dump on the spot. Segments already written
//! stay written.

use std::io;
use std::ops::ControlFlow;

use crate::engine::{ChunkSink, DumpFailure, Engine};
use crate::{Error, Result};

/// Host-side byte sink. Returns how many bytes of `bytes` were written.
pub trait HostWriter {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize>;
}

impl<W: HostWriter + ?Sized> HostWriter for &mut W {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        (**self).write(bytes)
    }
}

/// Adapts any [`io::Write`]. One host write is exactly one `write` call, so
/// a short write from the underlying writer fails the dump.
#[derive(Debug)]
pub struct IoWriter<W>(pub W);

impl<W: io::Write> HostWriter for IoWriter<W> {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.0.write(bytes)
    }
}

/// [`ChunkSink`] over a host writer.
pub struct ChunkWriter<'a, W: HostWriter + ?Sized> {
    writer: &'a mut W,
    segments: usize,
    bytes: usize,
    failure: Option<Error>,
}

impl<'a, W: HostWriter + ?Sized> ChunkWriter<'a, W> {
    pub fn new(writer: &'a mut W) -> Self {
        Self {
            writer,
            segments: 0,
            bytes: 0,
            failure: None,
        }
    }

    /// Segments fully written so far.
    #[must_use]
    pub fn segments(&self) -> usize {
        self.segments
    }

    #[must_use]
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Why the last segment was refused, if it was.
    pub fn take_failure(&mut self) -> Option<Error> {
        self.failure.take()
    }
}

impl<W: HostWriter + ?Sized> ChunkSink for ChunkWriter<'_, W> {
    fn accept_segment(&mut self, segment: &[u8]) -> ControlFlow<()> {
        match self.writer.write(segment) {
            Ok(written) if written == segment.len() => {
                self.segments += 1;
                self.bytes += written;
                ControlFlow::Continue(())
            }
            Ok(written) => {
                self.bytes += written;
                self.failure = Some(Error::PartialWrite {
                    written,
                    expected: segment.len(),
                });
                ControlFlow::Break(())
            }
            Err(e) => {
                self.failure = Some(Error::HostIo(e));
                ControlFlow::Break(())
            }
        }
    }
}

/// Serialize the engine's top chunk into `writer`.
pub(crate) fn dump_chunk<W: HostWriter + ?Sized>(engine: &dyn Engine, writer: &mut W) -> Result<()> {
    let mut sink = ChunkWriter::new(writer);
    tracing::debug!(depth = engine.depth(), "dumping chunk");

    match engine.dump(&mut sink) {
        Ok(()) => {
            tracing::debug!(segments = sink.segments(), bytes = sink.bytes(), "chunk dumped");
            Ok(())
        }
        Err(DumpFailure::NotSerializable(reason)) => Err(Error::Serialization(reason)),
        Err(DumpFailure::Aborted) => {
            let err = sink.take_failure().unwrap_or_else(|| {
                Error::Internal("engine aborted dump without a writer failure".to_string())
            });
            tracing::debug!(segments = sink.segments(), bytes = sink.bytes(), %err, "dump aborted");
            Err(err)
        }
    }
}
