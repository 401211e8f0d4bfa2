use crate::abi::Status;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("out of memory")]
    OutOfMemory,

    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("host I/O failure: {0}")]
    HostIo(#[from] std::io::Error),

    #[error("partial write: writer accepted {written} of {expected} bytes")]
    PartialWrite { written: usize, expected: usize },

    #[error("cannot serialize chunk: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Closest engine thread status for this error.
    #[must_use]
    pub fn status(&self) -> Status {
        match self {
            Error::OutOfMemory => Status::ErrMem,
            Error::Syntax(_) => Status::ErrSyntax,
            Error::Internal(_) => Status::ErrErr,
            Error::InvalidArgument(_)
            | Error::HostIo(_)
            | Error::PartialWrite { .. }
            | Error::Serialization(_) => Status::ErrRun,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
