use std::fmt;

/// Error taxonomy raised by the core.
///
/// Validation errors surface synchronously to the caller. Non-recoverable
/// errors (`Io`, `ChecksumMismatch`, `Corrupt`) close the database; every
/// subsequent operation then raises `Closed`.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("argument out of bounds: {0}")]
    OutOfBounds(String),

    #[error("database or stream is closed")]
    Closed,

    #[error("fragmented value read is truncated")]
    NoSuchValue,

    #[error("lock request timed out after {nanos}ns")]
    LockTimeout { nanos: i64, attachment: Option<String> },

    #[error("lock could not be acquired: {0}")]
    LockFailure(String),

    #[error("deadlock detected: {0}")]
    Deadlock(DeadlockSet),

    #[error("write attempted on a replica")]
    UnmodifiableReplica,

    #[error("replication could not confirm position {position}")]
    ConfirmationFailure { position: u64 },

    #[error("checksum mismatch reading {what}")]
    ChecksumMismatch { what: &'static str },

    #[error("database is corrupt: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn out_of_bounds(msg: impl Into<String>) -> Error {
        Error::OutOfBounds(msg.into())
    }

    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Error::Io(_) | Error::ChecksumMismatch { .. } | Error::Corrupt(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Lightweight identifying info about one lock participating in a detected
/// cycle, carried by `Error::Deadlock`.
#[derive(Debug, Clone)]
pub struct LockInfo {
    pub index_id: u64,
    pub key: Vec<u8>,
    pub owner_attachment: Option<String>,
}

impl fmt::Display for LockInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "index={} key={:?} owner={:?}",
            self.index_id, self.key, self.owner_attachment
        )
    }
}

/// Participants of a detected lock cycle, in wait order starting from the
/// thread that performed the detection.
#[derive(Debug, Clone)]
pub struct DeadlockSet {
    pub participants: Vec<LockInfo>,
    pub surviving_owner_attachment: Option<String>,
}

impl fmt::Display for DeadlockSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cycle of {} lock(s): [", self.participants.len())?;
        for (i, p) in self.participants.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", p)?;
        }
        write!(f, "]")
    }
}
