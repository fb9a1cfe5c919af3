//! The error vocabulary handed back to the block layer, the passthrough
//! path and the reporting collaborators.
//!
//! Firmware-level status codes never leave the engine raw: the classifier
//! translates them into an [`IoError`]. Control-plane failures (attach,
//! initialization, malformed wire data) use `color_eyre` instead.

use thiserror::Error;

/// OS error numbers used by [`IoError::errno`] and friends.
pub mod errno {
    pub const EPERM: i32 = 1;
    pub const ENXIO: i32 = 6;
    pub const EIO: i32 = 5;
    pub const ENOMEM: i32 = 12;
    pub const EBUSY: i32 = 16;
    pub const EINVAL: i32 = 22;
    pub const ETIMEDOUT: i32 = 110;
    pub const ECANCELED: i32 = 125;
}

/// Why a command failed, as seen by the caller.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum IoError {
    #[error("target reported sense key {sense_key:#x} (asc {asc:#04x}, ascq {ascq:#04x})")]
    Sense { sense_key: u8, asc: u8, ascq: u8 },
    #[error("target returned scsi status {0:#04x}")]
    ScsiStatus(u8),
    #[error("logical unit failed, administrative action required")]
    LunFailed,
    #[error("controller rejected the command as invalid")]
    InvalidCommand,
    #[error("protocol error")]
    Protocol,
    #[error("hardware error")]
    Hardware,
    #[error("connection to the target was lost")]
    ConnectionLost,
    #[error("command was aborted")]
    Aborted,
    #[error("abort request failed")]
    AbortFailed,
    #[error("command timed out")]
    TimedOut,
    #[error("command cannot be aborted")]
    Unabortable,
    #[error("command failed after exhausting its retries")]
    RetriesExhausted,
    #[error("unknown command status {0:#x}")]
    UnknownStatus(u16),
    #[error("request is malformed")]
    Invalid,
    #[error("out of command or DMA memory")]
    OutOfMemory,
    #[error("controller has failed")]
    ControllerFailed,
}

impl IoError {
    /// Positive OS error number for this failure.
    pub fn errno(&self) -> i32 {
        match self {
            Self::ConnectionLost => errno::ENXIO,
            Self::TimedOut => errno::ETIMEDOUT,
            Self::Aborted | Self::AbortFailed => errno::ECANCELED,
            Self::Invalid => errno::EINVAL,
            Self::OutOfMemory => errno::ENOMEM,
            _ => errno::EIO,
        }
    }
}

/// Every pool slot is claimed. Not a failure: the caller backs off until a
/// completion releases a slot.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("command arena exhausted")]
pub struct Exhausted;

/// Refusals from the logical drive table.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DriveError {
    #[error("no logical drive at index {0}")]
    NoSuchDrive(usize),
    #[error("logical drive {index} is in use ({usage} openers)")]
    InUse { index: usize, usage: u32 },
    #[error("configuration change in progress")]
    Busy,
    #[error("administrative access required")]
    PermissionDenied,
}

impl DriveError {
    pub fn errno(&self) -> i32 {
        match self {
            Self::NoSuchDrive(_) => errno::ENXIO,
            Self::InUse { .. } | Self::Busy => errno::EBUSY,
            Self::PermissionDenied => errno::EPERM,
        }
    }
}

/// Refusal to produce a status snapshot.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StatusError {
    #[error("controller is busy configuring")]
    Busy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(IoError::Hardware.errno(), errno::EIO);
        assert_eq!(IoError::OutOfMemory.errno(), errno::ENOMEM);
        assert_eq!(DriveError::InUse { index: 2, usage: 1 }.errno(), errno::EBUSY);
    }
}
