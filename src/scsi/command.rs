//! Representations for SCSI commands and Smart Array messages.
//!
//! This module uses the term "command descriptor" to describe a struct and implementation specific
//! details behind a CDB, and uses the term "command block" to describe a "black box" containing
//! a valid CDB.
//!
//! Commands are exposed as a function that returns a [`CommandBlock`]. These functions wrap
//! the more granular `X6`/`X10`/`X12`/`X16` descriptor structs.

use super::command_descriptor::*;
use crate::ciss::command_list::{MAX_CDB_SIZE, RequestType, XferDirection};

/// Vital product data page carrying the volume's unique identifier.
pub const VPD_DEVICE_ID: u8 = 0x83;
/// Smart Array vendor page carrying geometry and RAID level.
pub const VPD_GEOMETRY: u8 = 0xc1;

/// BMIC sub-command that flushes the controller's write cache.
const BMIC_CACHE_FLUSH: u8 = 0xc2;
/// Length of the (zeroed) parameter buffer sent with a cache flush.
pub const CACHE_FLUSH_LEN: u32 = 4;

/// Message codes carried in byte 0 of a message CDB.
const MSG_ABORT: u8 = 0x00;
const MSG_RESET: u8 = 0x01;
const MSG_NOOP: u8 = 0x03;
const RESET_TYPE_TARGET: u8 = 0x03;

/// A serialized command block ready to be placed in a command list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandBlock {
    command: [u8; MAX_CDB_SIZE],
    len: u8,
    pub request_type: RequestType,
    pub direction: XferDirection,
    pub data_transfer_len: u32,
}

impl CommandBlock {
    fn from_descriptor(
        descriptor: &impl CommandDescriptor,
        direction: XferDirection,
        data_transfer_len: u32,
    ) -> Self {
        Self::from_bytes(
            descriptor.as_slice(),
            RequestType::Command,
            direction,
            data_transfer_len,
        )
    }

    /// Wraps raw CDB bytes, as handed over by a passthrough caller.
    ///
    /// Bytes past [`MAX_CDB_SIZE`] are dropped.
    pub fn from_bytes(
        cdb: &[u8],
        request_type: RequestType,
        direction: XferDirection,
        data_transfer_len: u32,
    ) -> Self {
        let len = cdb.len().min(MAX_CDB_SIZE);
        let mut command = [0u8; MAX_CDB_SIZE];
        command[..len].copy_from_slice(&cdb[..len]);
        Self {
            command,
            len: len as u8,
            request_type,
            direction,
            data_transfer_len,
        }
    }

    /// Returns the length of the underlying command block.
    ///
    /// Will always be at most 16 bytes.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn opcode(&self) -> u8 {
        self.command[0]
    }

    /// Returns the CDB padded with zeroes to the full 16 bytes of the
    /// request block.
    pub fn get(&self) -> [u8; MAX_CDB_SIZE] {
        self.command
    }
}

/// "The TEST UNIT READY command provides a means to check if the logical unit is ready."
///
/// Defined in SPC2 7.25
pub fn test_unit_ready() -> CommandBlock {
    CommandBlock::from_descriptor(
        &X6CommandDescriptor {
            operation_code: OpCode::TestUnitReady,
            logical_block_address: [0, 0, 0],
            misc_len: 0,
            control: 0,
        },
        XferDirection::None,
        0,
    )
}

/// "The INQUIRY command requests that information regarding parameters
/// of the target and a component logical unit be sent to the application client."
///
/// Defined in SPC2 7.3.1 table 45
pub fn inquiry(allocation_len: u8) -> CommandBlock {
    CommandBlock::from_descriptor(
        &X6CommandDescriptor {
            operation_code: OpCode::Inquiry,
            logical_block_address: [0, 0, 0],
            misc_len: allocation_len,
            control: 0,
        },
        XferDirection::Read,
        allocation_len as u32,
    )
}

/// INQUIRY with the EVPD bit set, asking for one vital product data page.
pub fn inquiry_vpd(page: u8, allocation_len: u8) -> CommandBlock {
    CommandBlock::from_descriptor(
        &X6CommandDescriptor {
            operation_code: OpCode::Inquiry,
            logical_block_address: [0x01, page, 0],
            misc_len: allocation_len,
            control: 0,
        },
        XferDirection::Read,
        allocation_len as u32,
    )
}

/// "The `READ CAPACITY` command provides a means for the application client
/// to request information regarding the capacity of the block device."
///
/// SBC-2 5.1.10
pub fn read_capacity_10() -> CommandBlock {
    CommandBlock::from_descriptor(
        &X10CommandDescriptor {
            operation_code: OpCode::ReadCapacity10,
            service_action: 0,
            logical_block_address: [0; 4],
            group_number: 0,
            misc_len: [0; 2],
            control: 0,
        },
        XferDirection::Read,
        8,
    )
}

/// READ CAPACITY(16), for volumes whose last LBA does not fit in 32 bits.
///
/// SBC-2 5.1.11
pub fn read_capacity_16() -> CommandBlock {
    const SERVICE_ACTION_READ_CAPACITY: u8 = 0x10;
    const LEN: u32 = 32;
    CommandBlock::from_descriptor(
        &X16CommandDescriptor {
            operation_code: OpCode::ServiceActionIn16,
            misc_info: SERVICE_ACTION_READ_CAPACITY,
            logical_block_address: [0; 8],
            param: LEN.to_be_bytes(),
            _reserved: 0,
            control: 0,
        },
        XferDirection::Read,
        LEN,
    )
}

/// READ or WRITE of `blocks` sectors starting at `lba`.
///
/// The 10 byte form is used whenever the request fits in it.
pub fn read_write(
    direction: XferDirection,
    lba: u64,
    blocks: u32,
    block_size: u32,
) -> CommandBlock {
    let write = direction == XferDirection::Write;
    let data_transfer_len = blocks.saturating_mul(block_size);
    let end = lba + blocks as u64;
    match (u32::try_from(end), u16::try_from(blocks)) {
        (Ok(_), Ok(short_blocks)) => CommandBlock::from_descriptor(
            &X10CommandDescriptor {
                operation_code: if write { OpCode::Write10 } else { OpCode::Read10 },
                service_action: 0,
                logical_block_address: (lba as u32).to_be_bytes(),
                group_number: 0,
                misc_len: short_blocks.to_be_bytes(),
                control: 0,
            },
            direction,
            data_transfer_len,
        ),
        _ => CommandBlock::from_descriptor(
            &X16CommandDescriptor {
                operation_code: if write { OpCode::Write16 } else { OpCode::Read16 },
                misc_info: 0,
                logical_block_address: lba.to_be_bytes(),
                param: blocks.to_be_bytes(),
                _reserved: 0,
                control: 0,
            },
            direction,
            data_transfer_len,
        ),
    }
}

/// Smart Array REPORT LOGICAL LUNS.
///
/// The response is a 4 byte big endian list length, 4 reserved bytes and
/// then one 8 byte LUN address per configured volume.
pub fn report_logical_luns(allocation_len: u32) -> CommandBlock {
    CommandBlock::from_descriptor(
        &X12CommandDescriptor {
            operation_code: OpCode::ReportLogicalLuns,
            misc_info: 0,
            logical_block_address: [0; 4],
            misc_len: allocation_len.to_be_bytes(),
            _reserved: 0,
            control: 0,
        },
        XferDirection::Read,
        allocation_len,
    )
}

/// BMIC cache flush, sent before the controller is detached.
pub fn bmic_cache_flush() -> CommandBlock {
    CommandBlock::from_descriptor(
        &X10CommandDescriptor {
            operation_code: OpCode::BmicWrite,
            service_action: 0,
            logical_block_address: [0; 4],
            group_number: BMIC_CACHE_FLUSH,
            misc_len: (CACHE_FLUSH_LEN as u16).to_be_bytes(),
            control: 0,
        },
        XferDirection::Write,
        CACHE_FLUSH_LEN,
    )
}

/// Returns true for the BMIC sub-command [`bmic_cache_flush`] builds.
pub fn is_cache_flush(cdb: &[u8]) -> bool {
    cdb.first() == Some(&(OpCode::BmicWrite as u8)) && cdb.get(6) == Some(&BMIC_CACHE_FLUSH)
}

/// A no-op message, used to check that the firmware is alive.
pub fn noop_message() -> CommandBlock {
    CommandBlock::from_bytes(&[MSG_NOOP], RequestType::Message, XferDirection::None, 0)
}

/// Resets the addressed logical unit.
pub fn reset_message() -> CommandBlock {
    let mut cdb = [0u8; MAX_CDB_SIZE];
    cdb[0] = MSG_RESET;
    cdb[1] = RESET_TYPE_TARGET;
    CommandBlock::from_bytes(&cdb, RequestType::Message, XferDirection::None, 0)
}

/// Asks the firmware to abort the command carrying `tag`.
pub fn abort_message(tag: u64) -> CommandBlock {
    let mut cdb = [0u8; MAX_CDB_SIZE];
    cdb[0] = MSG_ABORT;
    cdb[4..12].copy_from_slice(&tag.to_le_bytes());
    CommandBlock::from_bytes(&cdb, RequestType::Message, XferDirection::None, 0)
}

/// Message code of a message CDB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    Abort { tag: u64 },
    Reset,
    Noop,
}

impl Message {
    pub fn parse(cdb: &[u8; MAX_CDB_SIZE]) -> Option<Self> {
        match cdb[0] {
            MSG_ABORT => {
                let mut tag = [0u8; 8];
                tag.copy_from_slice(&cdb[4..12]);
                Some(Self::Abort {
                    tag: u64::from_le_bytes(tag),
                })
            }
            MSG_RESET => Some(Self::Reset),
            MSG_NOOP => Some(Self::Noop),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_command_block() {
        // Ensures that a single byte is packed successfully
        let cb = CommandBlock::from_bytes(&[1], RequestType::Command, XferDirection::None, 0);
        let mut serialized_cb = cb.get().into_iter();
        assert!(serialized_cb.next() == Some(1));
        assert!(serialized_cb.all(|b| b == 0));
        assert_eq!(cb.len(), 1);
    }

    #[test]
    fn small_reads_use_ten_byte_cdb() {
        let cb = read_write(XferDirection::Read, 100, 8, 512);
        let cdb = cb.get();
        assert_eq!(cb.len(), 10);
        assert_eq!(cdb[0], OpCode::Read10 as u8);
        assert_eq!(&cdb[2..6], &100u32.to_be_bytes());
        assert_eq!(&cdb[7..9], &8u16.to_be_bytes());
        assert_eq!(cb.data_transfer_len, 4096);
    }

    #[test]
    fn reads_past_32_bits_use_sixteen_byte_cdb() {
        let lba = u32::MAX as u64;
        let cb = read_write(XferDirection::Write, lba, 2, 512);
        let cdb = cb.get();
        assert_eq!(cb.len(), 16);
        assert_eq!(cdb[0], OpCode::Write16 as u8);
        assert_eq!(&cdb[2..10], &lba.to_be_bytes());
        assert_eq!(&cdb[10..14], &2u32.to_be_bytes());
    }

    #[test]
    fn report_luns_length_is_big_endian() {
        let cb = report_logical_luns(0x0102_0304);
        assert_eq!(cb.len(), 12);
        assert_eq!(&cb.get()[6..10], &[1, 2, 3, 4]);
    }

    #[test]
    fn abort_message_carries_tag() {
        let cb = abort_message(0xdead_beef_0000_0004);
        assert_eq!(cb.request_type, RequestType::Message);
        assert_eq!(
            Message::parse(&cb.get()),
            Some(Message::Abort {
                tag: 0xdead_beef_0000_0004
            })
        );
    }

    #[test]
    fn cache_flush_is_recognised() {
        assert!(is_cache_flush(&bmic_cache_flush().get()));
        assert!(!is_cache_flush(&test_unit_ready().get()));
    }
}
