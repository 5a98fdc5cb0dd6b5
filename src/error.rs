use std::fmt;

/// Errors returned by the durability core.
///
/// Every fallible operation returns one of these instead of panicking; the
/// only error the core recovers from internally is a torn tail, which never
/// reaches the caller as an `Err` (see `wal::manager::OpenReport`).
#[derive(Debug)]
pub enum Error {
    /// A filesystem call failed (open/read/write/fsync/unlink/rename).
    Io(std::io::Error),
    /// A non-terminal frame had a bad CRC or an inconsistent length.
    /// Fatal to recovery; the caller must intervene.
    CorruptSegment(&'static str),
    /// An entry could not be encoded or decoded.
    SerializationError(&'static str),
    /// Operation attempted on a closed segment or manager.
    Closed,
    /// Operation attempted on a sealed memtable.
    Immutable,
    /// Memtable refused a `put` because it would exceed `max_bytes`.
    Full,
    /// Requested sequence/version/key was not found.
    NotFound,
    /// `has_conflict` returned true at commit time.
    VersionConflict,
    /// Caller-requested cancellation was observed.
    Cancelled,
    /// A `Config` value was internally inconsistent.
    InvalidConfig(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "io error: {err}"),
            Error::CorruptSegment(msg) => write!(f, "corrupt segment: {msg}"),
            Error::SerializationError(msg) => write!(f, "serialization error: {msg}"),
            Error::Closed => write!(f, "operation on closed resource"),
            Error::Immutable => write!(f, "operation on sealed memtable"),
            Error::Full => write!(f, "memtable full"),
            Error::NotFound => write!(f, "not found"),
            Error::VersionConflict => write!(f, "version conflict"),
            Error::Cancelled => write!(f, "cancelled"),
            Error::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Io(value)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
