//! The engine side of the bridge.
//!
//! The scripting engine is opaque to the bridge: all it exposes is a
//! pull-based loader and a push-based dumper. Both are expressed as narrow
//! callback traits, [`ChunkSource`] and [`ChunkSink`], which the reader and
//! writer bridges implement over host streams.

mod bytecode;

use std::ops::ControlFlow;

use crate::alloc::Allocator;

pub use bytecode::BytecodeEngine;

/// Pull side of the loader callback.
pub trait ChunkSource {
    /// Next fragment of the chunk, or `None` once input is exhausted.
    ///
    /// A returned fragment is only valid until the next call.
    fn next_fragment(&mut self) -> Option<&[u8]>;
}

/// Push side of the dumper callback.
pub trait ChunkSink {
    /// Accept one serialized segment. `Break` aborts the dump.
    fn accept_segment(&mut self, segment: &[u8]) -> ControlFlow<()>;
}

/// Descriptor of a chunk the engine accepted and pushed on its stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledChunk {
    name: String,
    len: usize,
}

impl CompiledChunk {
    #[must_use]
    pub fn new(name: impl Into<String>, len: usize) -> Self {
        Self {
            name: name.into(),
            len,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Size of the chunk in bytes, header included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Why the engine's load routine rejected its input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadFailure {
    Syntax(String),
    Memory,
}

/// Why the engine's dump routine stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DumpFailure {
    /// The sink returned `Break`.
    Aborted,
    /// Nothing dumpable is on top of the stack.
    NotSerializable(String),
}

impl From<LoadFailure> for crate::Error {
    fn from(failure: LoadFailure) -> Self {
        match failure {
            LoadFailure::Syntax(message) => crate::Error::Syntax(message),
            LoadFailure::Memory => crate::Error::OutOfMemory,
        }
    }
}

/// The opaque engine capability a [`crate::State`] drives.
///
/// Engine memory must only be obtained through the `Allocator` passed in.
pub trait Engine {
    /// Pull fragments from `source` until it is exhausted and push the
    /// resulting chunk on the stack.
    fn load(
        &mut self,
        allocator: &Allocator,
        source: &mut dyn ChunkSource,
        chunk_name: &str,
    ) -> Result<CompiledChunk, LoadFailure>;

    /// Serialize the chunk on top of the stack into `sink`.
    fn dump(&self, sink: &mut dyn ChunkSink) -> Result<(), DumpFailure>;

    fn depth(&self) -> usize;

    fn top(&self) -> Option<CompiledChunk>;

    /// Pop the top chunk, releasing its memory. Returns `false` when empty.
    fn pop(&mut self, allocator: &Allocator) -> bool;

    /// Release everything the engine owns.
    fn close(&mut self, allocator: &Allocator) {
        while self.pop(allocator) {}
    }
}
