//! Engine ABI constants (version, chunk signature, thread status codes).
//!
//! Everything the host and the engine have to agree on byte-for-byte lives
//! here so the reader bridge, the writer bridge and the reference engine
//! cannot drift apart.

// ── Version ──

pub const VERSION: &str = "Lua 5.1";
pub const VERSION_NUM: u32 = 501;

// ── Precompiled Chunks ──

/// Mark for precompiled code (`<esc>LJ`).
pub const SIGNATURE: [u8; 3] = [0x1b, b'L', b'J'];

/// Bytecode format version emitted right after [`SIGNATURE`].
pub const BYTECODE_VERSION: u8 = 1;

/// Full chunk header: signature followed by the bytecode version.
pub const HEADER: [u8; 4] = [SIGNATURE[0], SIGNATURE[1], SIGNATURE[2], BYTECODE_VERSION];

// ── Bridge Defaults ──

/// Read buffer capacity used when the host does not pick one.
pub const DEFAULT_BUFFER_SIZE: usize = 256;

/// Largest segment the reference engine hands to a writer in one call.
pub const DEFAULT_SEGMENT_SIZE: usize = 256;

// ── Thread Status ──

/// Thread status codes reported by engine entry points; 0 is OK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Status {
    Ok = 0,
    Yield = 1,
    ErrRun = 2,
    ErrSyntax = 3,
    ErrMem = 4,
    ErrErr = 5,
}

impl Status {
    #[must_use]
    pub const fn code(self) -> i32 {
        self as i32
    }

    #[must_use]
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Ok),
            1 => Some(Self::Yield),
            2 => Some(Self::ErrRun),
            3 => Some(Self::ErrSyntax),
            4 => Some(Self::ErrMem),
            5 => Some(Self::ErrErr),
            _ => None,
        }
    }

    /// Human-readable message for error statuses; `None` for `Ok` and `Yield`.
    #[must_use]
    pub const fn message(self) -> Option<&'static str> {
        match self {
            Self::Ok | Self::Yield => None,
            Self::ErrRun => Some("run time error"),
            Self::ErrSyntax => Some("syntax error"),
            Self::ErrMem => Some("out of memory"),
            Self::ErrErr => Some("error in error handling"),
        }
    }

    #[must_use]
    pub const fn is_error(self) -> bool {
        self.code() >= Self::ErrRun.code()
    }
}
