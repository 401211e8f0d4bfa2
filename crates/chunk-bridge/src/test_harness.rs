//! Test harness for chunk-bridge unit and integration tests
//!
//! Scripted host collaborators that record how the bridges drive them.
//!
//! # Example
//!
//! ```rust
//! use chunk_bridge::State;
//! use chunk_bridge::test_harness::*;
//!
//! let chunk = sample_chunk(20);
//! let mut state = State::new();
//! let mut reader = FragmentReader::new(split_at_sizes(&chunk, &[3, 9]));
//! state.load(&mut reader, 16, "example").expect("load");
//!
//! let mut writer = ScriptedWriter::new();
//! state.dump(&mut writer).expect("dump");
//! assert_eq!(writer.written(), chunk);
//! ```

#![allow(
    clippy::must_use_candidate,
    clippy::missing_panics_doc,
    clippy::cast_possible_truncation
)]

use std::collections::VecDeque;
use std::io;

use crate::abi::HEADER;
use crate::reader::{HostReader, ReadOutcome};
use crate::writer::HostWriter;

/// A well-formed chunk: the header followed by `body_len` patterned bytes.
pub fn sample_chunk(body_len: usize) -> Vec<u8> {
    let mut bytes = HEADER.to_vec();
    bytes.extend((0..body_len).map(|i| (i * 31 + 7) as u8));
    bytes
}

/// Split `bytes` into consecutive pieces of the given sizes, cycling through
/// `sizes`. Zero sizes are skipped.
pub fn split_at_sizes(bytes: &[u8], sizes: &[usize]) -> Vec<Vec<u8>> {
    let sizes: Vec<usize> = sizes.iter().copied().filter(|&s| s > 0).collect();
    if sizes.is_empty() {
        return vec![bytes.to_vec()];
    }
    let mut pieces = Vec::new();
    let mut rest = bytes;
    for &size in sizes.iter().cycle() {
        if rest.is_empty() {
            break;
        }
        let (head, tail) = rest.split_at(size.min(rest.len()));
        pieces.push(head.to_vec());
        rest = tail;
    }
    pieces
}

/// Yields scripted fragments, then end of stream.
///
/// A fragment longer than the requested maximum is split across calls.
#[derive(Debug, Default)]
pub struct FragmentReader {
    fragments: VecDeque<Vec<u8>>,
    calls: usize,
    requested: Vec<usize>,
}

impl FragmentReader {
    pub fn new(fragments: Vec<Vec<u8>>) -> Self {
        Self {
            fragments: fragments.into(),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls
    }

    /// The `maxBytes` of each call, in order.
    pub fn requested(&self) -> &[usize] {
        &self.requested
    }

    fn serve(&mut self, buf: &mut [u8]) -> Option<usize> {
        self.calls += 1;
        self.requested.push(buf.len());
        let mut fragment = self.fragments.pop_front()?;
        if fragment.len() > buf.len() {
            let rest = fragment.split_off(buf.len());
            self.fragments.push_front(rest);
        }
        buf[..fragment.len()].copy_from_slice(&fragment);
        Some(fragment.len())
    }
}

impl HostReader for FragmentReader {
    fn read(&mut self, buf: &mut [u8]) -> ReadOutcome {
        match self.serve(buf) {
            Some(n) => ReadOutcome::Data(n),
            None => ReadOutcome::Eof,
        }
    }
}

/// Yields scripted fragments, then fails on every later call.
#[derive(Debug, Default)]
pub struct FailingReader {
    inner: FragmentReader,
}

impl FailingReader {
    pub fn new(fragments: Vec<Vec<u8>>) -> Self {
        Self {
            inner: FragmentReader::new(fragments),
        }
    }

    pub fn calls(&self) -> usize {
        self.inner.calls()
    }
}

impl HostReader for FailingReader {
    fn read(&mut self, buf: &mut [u8]) -> ReadOutcome {
        match self.inner.serve(buf) {
            Some(n) => ReadOutcome::Data(n),
            None => ReadOutcome::Error(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "scripted read failure",
            )),
        }
    }
}

/// Records every segment; optionally under-writes on one call.
#[derive(Debug, Default)]
pub struct ScriptedWriter {
    segments: Vec<Vec<u8>>,
    calls: usize,
    short: Option<(usize, usize)>,
}

impl ScriptedWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// On the `call`-th invocation (1-based), accept only `accept` bytes.
    #[must_use]
    pub fn short_on(mut self, call: usize, accept: usize) -> Self {
        self.short = Some((call, accept));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls
    }

    /// Segments as received (accepted prefixes only).
    pub fn segments(&self) -> &[Vec<u8>] {
        &self.segments
    }

    /// Everything accepted so far, concatenated.
    pub fn written(&self) -> Vec<u8> {
        self.segments.concat()
    }
}

impl HostWriter for ScriptedWriter {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.calls += 1;
        let accepted = match self.short {
            Some((call, accept)) if call == self.calls => accept.min(bytes.len()),
            _ => bytes.len(),
        };
        self.segments.push(bytes[..accepted].to_vec());
        Ok(accepted)
    }
}

/// Accepts `ok_calls` segments, then reports an I/O error.
#[derive(Debug, Default)]
pub struct FailingWriter {
    ok_calls: usize,
    calls: usize,
}

impl FailingWriter {
    pub fn new(ok_calls: usize) -> Self {
        Self { ok_calls, calls: 0 }
    }

    pub fn calls(&self) -> usize {
        self.calls
    }
}

impl HostWriter for FailingWriter {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.calls += 1;
        if self.calls > self.ok_calls {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "scripted write failure"));
        }
        Ok(bytes.len())
    }
}
