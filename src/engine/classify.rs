//! Turns a firmware error info block into a decision about the command.

use crate::ciss::command_list::{CommandStatus, ErrorInfo};
use crate::error::IoError;
use crate::scsi::{Sense, asc, sense_key, status};

/// What kind of request a completed command belongs to. Only changes how
/// benign conditions are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
    /// Ordinary block read or write.
    Filesystem,
    /// INQUIRY, REPORT LUNS and friends, where short transfers are normal.
    Probe,
    /// A caller-built command; the caller interprets sense data itself.
    Passthrough,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Success,
    /// Completed, but `residual` bytes were not transferred.
    Benign { residual: u32 },
    /// Resend the same command without telling anyone.
    RetryTransparent,
    /// Resend, and have the controller's topology rescanned.
    RetryAndRescan,
    Fatal(IoError),
}

impl Decision {
    /// Converts a retry into a failure once `retry_count` resends have
    /// already been spent.
    pub fn bounded(self, retry_count: u8, max_retries: u8) -> Self {
        match self {
            Self::RetryTransparent | Self::RetryAndRescan if retry_count >= max_retries => {
                Self::Fatal(IoError::RetriesExhausted)
            }
            other => other,
        }
    }

    pub fn is_retry(&self) -> bool {
        matches!(self, Self::RetryTransparent | Self::RetryAndRescan)
    }
}

/// Classifies a command that completed with its error bit set.
pub fn classify(info: &ErrorInfo, class: RequestClass) -> Decision {
    match info.command_status {
        CommandStatus::Success => Decision::Success,
        CommandStatus::TargetStatus => target_status(info, class),
        CommandStatus::DataUnderrun | CommandStatus::DataOverrun => Decision::Benign {
            residual: info.residual,
        },
        CommandStatus::UnsolicitedAbort => Decision::RetryTransparent,
        CommandStatus::Invalid => Decision::Fatal(IoError::InvalidCommand),
        CommandStatus::ProtocolError => Decision::Fatal(IoError::Protocol),
        CommandStatus::HardwareError => Decision::Fatal(IoError::Hardware),
        CommandStatus::ConnectionLost => Decision::Fatal(IoError::ConnectionLost),
        CommandStatus::Aborted => Decision::Fatal(IoError::Aborted),
        CommandStatus::AbortFailed => Decision::Fatal(IoError::AbortFailed),
        CommandStatus::Timeout => Decision::Fatal(IoError::TimedOut),
        CommandStatus::Unabortable => Decision::Fatal(IoError::Unabortable),
        CommandStatus::Unknown(raw) => Decision::Fatal(IoError::UnknownStatus(raw)),
    }
}

fn target_status(info: &ErrorInfo, class: RequestClass) -> Decision {
    if info.scsi_status != status::CHECK_CONDITION {
        return Decision::Fatal(IoError::ScsiStatus(info.scsi_status));
    }
    let sense = Sense::from_fixed(info.sense_data());
    match sense.key {
        sense_key::NO_SENSE | sense_key::RECOVERED_ERROR if class == RequestClass::Filesystem => {
            Decision::Success
        }
        sense_key::UNIT_ATTENTION => match sense.asc {
            asc::REPORT_LUNS_CHANGED => Decision::RetryAndRescan,
            asc::LUN_FAILED => Decision::Fatal(IoError::LunFailed),
            // state changed, power on or reset, unit attention cleared, and
            // anything the firmware adds later
            _ => Decision::RetryTransparent,
        },
        _ => Decision::Fatal(sense_error(sense)),
    }
}

pub fn sense_error(sense: Sense) -> IoError {
    IoError::Sense {
        sense_key: sense.key,
        asc: sense.asc,
        ascq: sense.ascq,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_condition(key: u8, asc: u8) -> ErrorInfo {
        let fixed = Sense { key, asc, ascq: 0 }.to_fixed();
        let mut info = ErrorInfo {
            command_status: CommandStatus::TargetStatus,
            scsi_status: status::CHECK_CONDITION,
            sense_len: fixed.len() as u8,
            ..Default::default()
        };
        info.sense[..fixed.len()].copy_from_slice(&fixed);
        info
    }

    fn with_status(command_status: CommandStatus) -> ErrorInfo {
        ErrorInfo {
            command_status,
            residual: 512,
            ..Default::default()
        }
    }

    #[test]
    fn unit_attentions() {
        let fs = RequestClass::Filesystem;
        for code in [asc::STATE_CHANGED, asc::POWER_OR_RESET, asc::UNIT_ATTENTION_CLEARED] {
            assert_eq!(
                classify(&check_condition(sense_key::UNIT_ATTENTION, code), fs),
                Decision::RetryTransparent
            );
        }
        assert_eq!(
            classify(&check_condition(sense_key::UNIT_ATTENTION, asc::REPORT_LUNS_CHANGED), fs),
            Decision::RetryAndRescan
        );
        assert_eq!(
            classify(&check_condition(sense_key::UNIT_ATTENTION, asc::LUN_FAILED), fs),
            Decision::Fatal(IoError::LunFailed)
        );
    }

    #[test]
    fn recovered_error_only_succeeds_for_filesystem_requests() {
        let info = check_condition(sense_key::RECOVERED_ERROR, 0);
        assert_eq!(classify(&info, RequestClass::Filesystem), Decision::Success);
        assert_eq!(
            classify(&info, RequestClass::Passthrough),
            Decision::Fatal(IoError::Sense {
                sense_key: sense_key::RECOVERED_ERROR,
                asc: 0,
                ascq: 0
            })
        );
    }

    #[test]
    fn medium_error_is_fatal() {
        let info = check_condition(sense_key::MEDIUM_ERROR, 0x11);
        assert!(matches!(
            classify(&info, RequestClass::Filesystem),
            Decision::Fatal(IoError::Sense { asc: 0x11, .. })
        ));
    }

    #[test]
    fn non_check_condition_status_is_fatal() {
        let info = ErrorInfo {
            command_status: CommandStatus::TargetStatus,
            scsi_status: status::BUSY,
            ..Default::default()
        };
        assert_eq!(
            classify(&info, RequestClass::Filesystem),
            Decision::Fatal(IoError::ScsiStatus(status::BUSY))
        );
    }

    #[test]
    fn underrun_carries_residual() {
        for class in [RequestClass::Filesystem, RequestClass::Probe] {
            assert_eq!(
                classify(&with_status(CommandStatus::DataUnderrun), class),
                Decision::Benign { residual: 512 }
            );
        }
    }

    #[test]
    fn fatal_statuses_map_to_io_errors() {
        let cases = [
            (CommandStatus::Invalid, IoError::InvalidCommand),
            (CommandStatus::ProtocolError, IoError::Protocol),
            (CommandStatus::HardwareError, IoError::Hardware),
            (CommandStatus::ConnectionLost, IoError::ConnectionLost),
            (CommandStatus::Aborted, IoError::Aborted),
            (CommandStatus::AbortFailed, IoError::AbortFailed),
            (CommandStatus::Timeout, IoError::TimedOut),
            (CommandStatus::Unabortable, IoError::Unabortable),
            (CommandStatus::Unknown(0x77), IoError::UnknownStatus(0x77)),
        ];
        for (status, error) in cases {
            assert_eq!(
                classify(&with_status(status), RequestClass::Filesystem),
                Decision::Fatal(error)
            );
        }
    }

    #[test]
    fn retry_bound_is_shared() {
        let abort = classify(
            &with_status(CommandStatus::UnsolicitedAbort),
            RequestClass::Filesystem,
        );
        assert_eq!(abort, Decision::RetryTransparent);
        for count in 0..3 {
            assert!(abort.bounded(count, 3).is_retry());
        }
        assert_eq!(
            abort.bounded(3, 3),
            Decision::Fatal(IoError::RetriesExhausted)
        );
        assert_eq!(
            Decision::RetryAndRescan.bounded(3, 3),
            Decision::Fatal(IoError::RetriesExhausted)
        );
        assert_eq!(Decision::Success.bounded(9, 3), Decision::Success);
    }
}
