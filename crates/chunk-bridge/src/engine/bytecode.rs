use std::fmt;

use super::{ChunkSink, ChunkSource, CompiledChunk, DumpFailure, Engine, LoadFailure};
use crate::abi::{DEFAULT_SEGMENT_SIZE, HEADER, SIGNATURE};
use crate::alloc::{Allocator, Block};

/// Smallest block the loader asks for when a chunk starts arriving.
const MIN_CODE_CAPACITY: usize = 32;

struct Prototype {
    name: String,
    code: Option<Block>,
    len: usize,
}

impl Prototype {
    fn bytes(&self) -> &[u8] {
        self.code.as_ref().map_or(&[][..], |block| &block.as_slice()[..self.len])
    }

    fn describe(&self) -> CompiledChunk {
        CompiledChunk::new(self.name.clone(), self.len)
    }
}

/// Reference engine: a stack of precompiled chunks held in allocator memory.
///
/// Loading validates the chunk header and copies the bytes verbatim; dumping
/// replays the top chunk in segments of at most `segment_size` bytes. The
/// body is never interpreted.
pub struct BytecodeEngine {
    stack: Vec<Prototype>,
    segment_size: usize,
}

impl BytecodeEngine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            stack: Vec::new(),
            segment_size: DEFAULT_SEGMENT_SIZE,
        }
    }

    /// Cap the size of each segment handed to a sink (minimum 1).
    #[must_use]
    pub fn with_segment_size(mut self, size: usize) -> Self {
        self.segment_size = size.max(1);
        self
    }

    #[must_use]
    pub fn segment_size(&self) -> usize {
        self.segment_size
    }
}

impl Default for BytecodeEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BytecodeEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BytecodeEngine")
            .field("depth", &self.stack.len())
            .field("segment_size", &self.segment_size)
            .finish()
    }
}

/// Check as much of the header as has arrived so far.
fn check_header(prefix: &[u8], chunk_name: &str) -> Result<(), LoadFailure> {
    let n = prefix.len().min(HEADER.len());
    let sig = n.min(SIGNATURE.len());
    if prefix[..sig] != SIGNATURE[..sig] {
        return Err(LoadFailure::Syntax(format!(
            "{chunk_name}: bad header in precompiled chunk"
        )));
    }
    if n == HEADER.len() && prefix[SIGNATURE.len()] != HEADER[SIGNATURE.len()] {
        return Err(LoadFailure::Syntax(format!(
            "{chunk_name}: version mismatch in precompiled chunk (got {}, expected {})",
            prefix[SIGNATURE.len()],
            HEADER[SIGNATURE.len()]
        )));
    }
    Ok(())
}

/// Chunk bytes being accumulated from fragments.
struct Accumulator<'a> {
    allocator: &'a Allocator,
    block: Option<Block>,
    len: usize,
}

impl<'a> Accumulator<'a> {
    fn new(allocator: &'a Allocator) -> Self {
        Self {
            allocator,
            block: None,
            len: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.block.as_ref().map_or(0, Block::len)
    }

    fn append(&mut self, fragment: &[u8]) -> Result<(), LoadFailure> {
        let needed = self.len + fragment.len();
        let capacity = self.capacity();
        if needed > capacity {
            let grown = needed.max(capacity * 2).max(MIN_CODE_CAPACITY);
            tracing::trace!(capacity, grown, "growing chunk storage");
            match self.allocator.realloc(self.block.take(), capacity, grown) {
                Ok(block) => self.block = block,
                Err(oom) => {
                    self.block = oom.into_original();
                    return Err(LoadFailure::Memory);
                }
            }
        }
        if let Some(block) = self.block.as_mut() {
            block.as_mut_slice()[self.len..needed].copy_from_slice(fragment);
        }
        self.len = needed;
        Ok(())
    }

    fn bytes(&self) -> &[u8] {
        self.block
            .as_ref()
            .map_or(&[][..], |block| &block.as_slice()[..self.len])
    }

    /// Shrink storage to the exact chunk size and hand it over.
    fn finish(mut self) -> (Option<Block>, usize) {
        let capacity = self.capacity();
        if let Some(block) = self.block.take() {
            if capacity > self.len {
                self.block = match self.allocator.realloc(Some(block), capacity, self.len) {
                    Ok(block) => block,
                    // Only `len` bytes are ever read back.
                    Err(oom) => oom.into_original(),
                };
            } else {
                self.block = Some(block);
            }
        }
        (self.block.take(), self.len)
    }
}

impl Drop for Accumulator<'_> {
    fn drop(&mut self) {
        if let Some(block) = self.block.take() {
            self.allocator.release(block);
        }
    }
}

impl Engine for BytecodeEngine {
    fn load(
        &mut self,
        allocator: &Allocator,
        source: &mut dyn ChunkSource,
        chunk_name: &str,
    ) -> Result<CompiledChunk, LoadFailure> {
        let mut acc = Accumulator::new(allocator);
        let mut header_checked = false;

        while let Some(fragment) = source.next_fragment() {
            if fragment.is_empty() {
                break;
            }
            acc.append(fragment)?;
            if !header_checked {
                check_header(acc.bytes(), chunk_name)?;
                header_checked = acc.len >= HEADER.len();
            }
        }

        if acc.len > 0 && acc.len < HEADER.len() {
            return Err(LoadFailure::Syntax(format!(
                "{chunk_name}: truncated precompiled chunk"
            )));
        }

        let (code, len) = acc.finish();
        let proto = Prototype {
            name: chunk_name.to_string(),
            code,
            len,
        };
        let chunk = proto.describe();
        self.stack.push(proto);
        Ok(chunk)
    }

    fn dump(&self, sink: &mut dyn ChunkSink) -> Result<(), DumpFailure> {
        let Some(top) = self.stack.last() else {
            return Err(DumpFailure::NotSerializable(
                "no chunk on top of the stack".to_string(),
            ));
        };
        for segment in top.bytes().chunks(self.segment_size) {
            if sink.accept_segment(segment).is_break() {
                return Err(DumpFailure::Aborted);
            }
        }
        Ok(())
    }

    fn depth(&self) -> usize {
        self.stack.len()
    }

    fn top(&self) -> Option<CompiledChunk> {
        self.stack.last().map(Prototype::describe)
    }

    fn pop(&mut self, allocator: &Allocator) -> bool {
        let Some(proto) = self.stack.pop() else {
            return false;
        };
        if let Some(block) = proto.code {
            allocator.release(block);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::ops::ControlFlow;

    use super::*;
    use crate::alloc::{MemoryUsage, TrackedMemory};

    struct Fragments(Vec<Vec<u8>>, Vec<u8>);

    impl Fragments {
        fn new(parts: &[&[u8]]) -> Self {
            Self(parts.iter().rev().map(|p| p.to_vec()).collect(), Vec::new())
        }
    }

    impl ChunkSource for Fragments {
        fn next_fragment(&mut self) -> Option<&[u8]> {
            self.1 = self.0.pop()?;
            Some(&self.1)
        }
    }

    #[derive(Default)]
    struct Collect(Vec<Vec<u8>>);

    impl ChunkSink for Collect {
        fn accept_segment(&mut self, segment: &[u8]) -> ControlFlow<()> {
            self.0.push(segment.to_vec());
            ControlFlow::Continue(())
        }
    }

    fn setup(limit: Option<usize>) -> (Allocator, MemoryUsage) {
        let mut memory = TrackedMemory::new();
        if let Some(limit) = limit {
            memory = memory.with_limit(limit);
        }
        let usage = memory.usage();
        (Allocator::new(memory), usage)
    }

    fn chunk(body: &[u8]) -> Vec<u8> {
        let mut bytes = HEADER.to_vec();
        bytes.extend_from_slice(body);
        bytes
    }

    #[test]
    fn test_load_accumulates_fragments() {
        let (alloc, usage) = setup(None);
        let mut engine = BytecodeEngine::new();
        let bytes = chunk(b"hello world");
        let mut src = Fragments::new(&[&bytes[..2], &bytes[2..7], &bytes[7..]]);

        let loaded = engine.load(&alloc, &mut src, "frag").unwrap();
        assert_eq!(loaded.name(), "frag");
        assert_eq!(loaded.len(), bytes.len());
        assert_eq!(engine.depth(), 1);
        assert_eq!(usage.outstanding(), bytes.len());

        engine.close(&alloc);
        assert_eq!(usage.outstanding(), 0);
    }

    #[test]
    fn test_empty_input_is_empty_chunk() {
        let (alloc, usage) = setup(None);
        let mut engine = BytecodeEngine::new();
        let loaded = engine.load(&alloc, &mut Fragments::new(&[]), "empty").unwrap();
        assert!(loaded.is_empty());
        assert_eq!(usage.allocations(), 0);

        let mut sink = Collect::default();
        engine.dump(&mut sink).unwrap();
        assert!(sink.0.is_empty());
    }

    #[test]
    fn test_bad_signature_is_syntax_error() {
        let (alloc, usage) = setup(None);
        let mut engine = BytecodeEngine::new();
        let err = engine
            .load(&alloc, &mut Fragments::new(&[b"print('hi')".as_slice()]), "src")
            .unwrap_err();
        let LoadFailure::Syntax(message) = err else {
            panic!("expected syntax error, got {err:?}");
        };
        assert!(message.starts_with("src:"), "{message}");
        assert!(message.contains("bad header"), "{message}");
        assert_eq!(engine.depth(), 0);
        assert_eq!(usage.outstanding(), 0);
    }

    #[test]
    fn test_bad_signature_stops_pulling() {
        let (alloc, _) = setup(None);
        let mut engine = BytecodeEngine::new();
        let mut src = Fragments::new(&[b"xx".as_slice(), b"more".as_slice(), b"and more".as_slice()]);
        assert!(engine.load(&alloc, &mut src, "src").is_err());
        assert_eq!(src.0.len(), 2, "loader must stop at the first bad fragment");
    }

    #[test]
    fn test_version_mismatch() {
        let (alloc, _) = setup(None);
        let mut engine = BytecodeEngine::new();
        let bytes = [SIGNATURE[0], SIGNATURE[1], SIGNATURE[2], 9, 0];
        let err = engine
            .load(&alloc, &mut Fragments::new(&[&bytes[..]]), "v")
            .unwrap_err();
        assert!(matches!(err, LoadFailure::Syntax(ref m) if m.contains("version mismatch")));
    }

    #[test]
    fn test_truncated_header() {
        let (alloc, usage) = setup(None);
        let mut engine = BytecodeEngine::new();
        let err = engine
            .load(&alloc, &mut Fragments::new(&[&HEADER[..2]]), "t")
            .unwrap_err();
        assert!(matches!(err, LoadFailure::Syntax(ref m) if m.contains("truncated")));
        assert_eq!(usage.outstanding(), 0);
    }

    #[test]
    fn test_growth_failure_is_memory_error() {
        let (alloc, usage) = setup(Some(40));
        let mut engine = BytecodeEngine::new();
        let bytes = chunk(&[7u8; 60]);
        let err = engine
            .load(&alloc, &mut Fragments::new(&[&bytes[..20], &bytes[20..]]), "big")
            .unwrap_err();
        assert_eq!(err, LoadFailure::Memory);
        assert_eq!(engine.depth(), 0);
        assert_eq!(usage.outstanding(), 0);
    }

    #[test]
    fn test_dump_segments_in_order() {
        let (alloc, _) = setup(None);
        let mut engine = BytecodeEngine::new().with_segment_size(5);
        let bytes = chunk(b"0123456789ab");
        engine
            .load(&alloc, &mut Fragments::new(&[&bytes[..]]), "seg")
            .unwrap();

        let mut sink = Collect::default();
        engine.dump(&mut sink).unwrap();
        assert_eq!(sink.0.len(), 4);
        assert!(sink.0.iter().all(|s| s.len() <= 5));
        assert_eq!(sink.0.concat(), bytes);
        engine.close(&alloc);
    }

    #[test]
    fn test_dump_without_chunk() {
        let engine = BytecodeEngine::new();
        let err = engine.dump(&mut Collect::default()).unwrap_err();
        assert!(matches!(err, DumpFailure::NotSerializable(_)));
    }

    #[test]
    fn test_dump_aborts_on_break() {
        struct Refuse(usize);
        impl ChunkSink for Refuse {
            fn accept_segment(&mut self, _: &[u8]) -> ControlFlow<()> {
                self.0 += 1;
                ControlFlow::Break(())
            }
        }

        let (alloc, _) = setup(None);
        let mut engine = BytecodeEngine::new().with_segment_size(2);
        engine
            .load(&alloc, &mut Fragments::new(&[chunk(b"abcdef").as_slice()]), "a")
            .unwrap();
        let mut sink = Refuse(0);
        assert_eq!(engine.dump(&mut sink), Err(DumpFailure::Aborted));
        assert_eq!(sink.0, 1);
        engine.close(&alloc);
    }

    #[test]
    fn test_pop_releases_memory() {
        let (alloc, usage) = setup(None);
        let mut engine = BytecodeEngine::new();
        engine
            .load(&alloc, &mut Fragments::new(&[chunk(b"one").as_slice()]), "one")
            .unwrap();
        engine
            .load(&alloc, &mut Fragments::new(&[chunk(b"second").as_slice()]), "two")
            .unwrap();
        assert_eq!(engine.top().unwrap().name(), "two");

        assert!(engine.pop(&alloc));
        assert_eq!(engine.top().unwrap().name(), "one");
        assert_eq!(usage.outstanding(), HEADER.len() + 3);

        assert!(engine.pop(&alloc));
        assert!(!engine.pop(&alloc));
        assert_eq!(usage.outstanding(), 0);
    }
}
