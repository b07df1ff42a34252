use std::io;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to allocate {size} bytes aligned to {align}")]
    Allocation { size: usize, align: usize },

    #[error("failed to open {}: {source}", path.display())]
    Open { path: PathBuf, source: io::Error },

    #[error("failed to write {}: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },

    /// The in-memory effect of `op` happened, the durable write did not.
    #[error("{op} applied in memory but not persisted: {source}")]
    Unpersisted {
        op: &'static str,
        #[source]
        source: Box<Error>,
    },

    #[error("corrupted segment {} at line {line}: {reason}", path.display())]
    CorruptSegment {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn unpersisted(op: &'static str, source: Error) -> Self {
        Error::Unpersisted {
            op,
            source: Box::new(source),
        }
    }

    /// True when the operation's in-memory effect is in place despite the error.
    pub fn is_unpersisted(&self) -> bool {
        matches!(self, Error::Unpersisted { .. })
    }
}
