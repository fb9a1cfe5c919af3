//! SCSI protocol and format implementation as described in:
//! - SCSI Primary Commands – 2 (SPC-2):
//!   <https://www.rockbox.org/wiki/pub/Main/DataSheets/spc2r20.pdf>
//!   Status bytes, sense data and the INQUIRY family live here.
//! - SCSI Block Commands – 2 (SBC-2)
//!   <https://raw.githubusercontent.com/carmark/papers/master/storage/scsi/sbc2r16.pdf>
//!   READ/WRITE and READ CAPACITY.
//!
//! Smart Array firmware layers a few vendor commands (REPORT LOGICAL LUNS,
//! BMIC) on top of these; their CDBs are built in [`command`] as well.

pub mod command;
mod command_descriptor;
pub mod response;

pub use command_descriptor::OpCode;

/// Size of the logical block the block layer addresses requests in.
pub const SECTOR_SIZE: u32 = 512;

/// Status byte returned by the target, SAM-2 5.3.1.
pub mod status {
    pub const CHECK_CONDITION: u8 = 0x02;
    pub const BUSY: u8 = 0x08;
}

/// SPC-2 table 107.
pub mod sense_key {
    pub const NO_SENSE: u8 = 0x0;
    pub const RECOVERED_ERROR: u8 = 0x1;
    pub const MEDIUM_ERROR: u8 = 0x3;
    pub const ILLEGAL_REQUEST: u8 = 0x5;
    pub const UNIT_ATTENTION: u8 = 0x6;
}

/// Additional sense codes reported alongside UNIT ATTENTION.
pub mod asc {
    pub const POWER_OR_RESET: u8 = 0x29;
    pub const STATE_CHANGED: u8 = 0x2a;
    pub const UNIT_ATTENTION_CLEARED: u8 = 0x2f;
    pub const LUN_FAILED: u8 = 0x3e;
    pub const REPORT_LUNS_CHANGED: u8 = 0x3f;
}

/// The three fields of fixed-format sense data (SPC-2 7.20.2) the engine
/// cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Sense {
    pub key: u8,
    pub asc: u8,
    pub ascq: u8,
}

impl Sense {
    /// Pulls the sense key, ASC and ASCQ out of fixed-format sense data.
    ///
    /// Truncated sense data yields zeroes for the missing fields, which reads
    /// as NO SENSE.
    pub fn from_fixed(buf: &[u8]) -> Self {
        let byte = |i: usize| buf.get(i).copied().unwrap_or(0);
        Self {
            key: byte(2) & 0x0f,
            asc: byte(12),
            ascq: byte(13),
        }
    }

    /// Builds 18 bytes of fixed-format sense data.
    pub fn to_fixed(self) -> [u8; 18] {
        let mut buf = [0u8; 18];
        // current error, fixed format
        buf[0] = 0x70;
        buf[2] = self.key & 0x0f;
        // additional sense length
        buf[7] = 10;
        buf[12] = self.asc;
        buf[13] = self.ascq;
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sense_survives_fixed_format() {
        let sense = Sense {
            key: sense_key::UNIT_ATTENTION,
            asc: asc::REPORT_LUNS_CHANGED,
            ascq: 0x0e,
        };
        assert_eq!(Sense::from_fixed(&sense.to_fixed()), sense);
    }

    #[test]
    fn truncated_sense_reads_as_no_sense() {
        let sense = Sense::from_fixed(&[0x70, 0x00]);
        assert_eq!(sense.key, sense_key::NO_SENSE);
        assert_eq!(sense.asc, 0);
    }
}
