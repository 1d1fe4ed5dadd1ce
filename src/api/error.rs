//! Error and integrity types.

use std::error::Error;
use std::fmt;

/// Errors returned by the `try_*` entry points and the instance directory.
///
/// The C-style entry points collapse all of these into a null pointer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ArenaError {
    /// The request can never fit in a single region.
    TooLarge {
        /// Bytes requested.
        requested: usize,
        /// Largest request one region can hold.
        limit: usize,
    },
    /// Growth and one retry both failed to place the request.
    OutOfMemory {
        /// Bytes requested.
        requested: usize,
    },
    /// The OS refused to map a new span.
    MapFailed {
        /// Bytes asked of the OS.
        bytes: usize,
    },
    /// The instance already holds its maximum number of regions.
    RegionTableFull {
        /// Configured region limit.
        limit: usize,
    },
    /// Too many instances are alive at once.
    InstanceLimit {
        /// Directory capacity.
        limit: usize,
    },
    /// The configuration was rejected.
    InvalidConfig(&'static str),
    /// Alignments must be non-zero powers of two.
    InvalidAlignment {
        /// Alignment requested.
        align: usize,
    },
    /// The handle does not name a live instance.
    UnknownInstance,
    /// The instance is active on the calling thread; rebase first.
    ActiveInstance,
    /// The base instance can only be torn down by shutdown.
    BaseInstance,
    /// The pointer does not belong to any region of this instance.
    ForeignPointer,
}

impl fmt::Display for ArenaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooLarge { requested, limit } => {
                write!(f, "request of {requested} bytes exceeds region capacity of {limit} bytes")
            }
            Self::OutOfMemory { requested } => {
                write!(f, "out of memory: {requested} bytes could not be placed after growing")
            }
            Self::MapFailed { bytes } => write!(f, "OS refused to map {bytes} bytes"),
            Self::RegionTableFull { limit } => write!(f, "region limit of {limit} reached"),
            Self::InstanceLimit { limit } => write!(f, "instance limit of {limit} reached"),
            Self::InvalidConfig(reason) => write!(f, "invalid arena config: {reason}"),
            Self::InvalidAlignment { align } => write!(f, "alignment {align} is not a power of two"),
            Self::UnknownInstance => write!(f, "handle does not name a live instance"),
            Self::ActiveInstance => write!(f, "instance is active on this thread"),
            Self::BaseInstance => write!(f, "the base instance is only destroyed at shutdown"),
            Self::ForeignPointer => write!(f, "pointer is not owned by this instance"),
        }
    }
}

impl Error for ArenaError {}

/// Where and why an integrity check failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Corruption {
    /// Region the fault was found in; `None` for free-list or counter faults.
    pub region: Option<u64>,
    /// What was wrong.
    pub reason: &'static str,
    /// Address of the offending block header, or 0 for counter faults.
    pub address: usize,
}

impl fmt::Display for Corruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.region {
            Some(id) => write!(f, "region {id}: {} at {:#x}", self.reason, self.address),
            None => write!(f, "{} at {:#x}", self.reason, self.address),
        }
    }
}

/// Result of [`Arena::integrity_check`](crate::Arena::integrity_check).
///
/// A corrupted instance cannot be repaired; tear it down and build a new one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Integrity {
    Ok,
    Corrupted(Corruption),
}

impl Integrity {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl fmt::Display for Integrity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Corrupted(c) => write!(f, "corrupted: {c}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ArenaError::TooLarge {
            requested: 10,
            limit: 4,
        };
        assert_eq!(err.to_string(), "request of 10 bytes exceeds region capacity of 4 bytes");
        assert_eq!(
            ArenaError::MapFailed { bytes: 4096 }.to_string(),
            "OS refused to map 4096 bytes"
        );
    }

    #[test]
    fn test_integrity_display() {
        assert_eq!(Integrity::Ok.to_string(), "ok");
        let bad = Integrity::Corrupted(Corruption {
            region: Some(3),
            reason: "block size invalid",
            address: 0x40,
        });
        assert!(!bad.is_ok());
        assert_eq!(bad.to_string(), "corrupted: region 3: block size invalid at 0x40");
    }
}
