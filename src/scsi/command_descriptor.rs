//! Underlying structures that commands are issued in

/// Operation codes for a Command Descriptor Block, specifying what operation you want
/// to do as described in 7.1 of SPC-2.
///
/// This enum is not complete, and is intended to grow
/// as needed
#[repr(u8)]
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    /// SPC-2 7.25
    TestUnitReady = 0x0,
    /// SPC-2 7.3
    Inquiry = 0x12,
    /// SBC-2 5.1.10, table 27
    ReadCapacity10 = 0x25,
    /// Smart Array BMIC write, used for controller housekeeping such as
    /// flushing the write cache.
    BmicWrite = 0x27,
    /// SBC-2 5.1.6
    Read10 = 0x28,
    /// SBC-2 5.1.19
    Write10 = 0x2a,
    /// SBC-2 5.1.8
    Read16 = 0x88,
    /// SBC-2 5.1.21
    Write16 = 0x8a,
    /// SERVICE ACTION IN(16), carrying READ CAPACITY(16), SBC-2 5.1.11
    ServiceActionIn16 = 0x9e,
    /// Smart Array REPORT LOGICAL LUNS
    ReportLogicalLuns = 0xc2,
}

impl OpCode {
    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0x00 => Self::TestUnitReady,
            0x12 => Self::Inquiry,
            0x25 => Self::ReadCapacity10,
            0x27 => Self::BmicWrite,
            0x28 => Self::Read10,
            0x2a => Self::Write10,
            0x88 => Self::Read16,
            0x8a => Self::Write16,
            0x9e => Self::ServiceActionIn16,
            0xc2 => Self::ReportLogicalLuns,
            _ => return None,
        })
    }
}

/// As described in SPC-2 4.3.2 table 1, a typical CDB for 6 byte commands.
#[repr(C, packed)]
pub struct X6CommandDescriptor {
    /// This field specifies what command is being issued by the host
    /// to the drive.
    pub operation_code: OpCode,
    /// "A six-byte CDB contains a 21-bit `LOGICAL BLOCK ADDRESS` field."
    ///
    /// INQUIRY reuses these bytes for the EVPD flag, the page code and the
    /// high byte of the allocation length.
    pub logical_block_address: [u8; 3],
    /// Depending on the opcode, this field is one of `TRANSFER LENGTH`,
    /// `PARAMETER LIST LENGTH` or `ALLOCATION LENGTH`.
    ///
    ///More info can be found in SCSI SPC2 4.3
    pub misc_len: u8,
    /// As far as I can tell, this value is set to zero by most modern implementations.
    pub control: u8,
}

impl CommandDescriptor for X6CommandDescriptor {}

/// As described in SPC-2 4.3.2 table 2, a typical CDB for 10 byte commands.
#[repr(C, packed)]
pub struct X10CommandDescriptor {
    pub operation_code: OpCode,
    /// (if required) the lower 5 bits identify a function to be performed under the
    /// more general command specified in the `OPERATION CODE` field
    pub service_action: u8,
    /// Big endian.
    pub logical_block_address: [u8; 4],
    /// Group number for standard commands, the BMIC sub-command for
    /// [`OpCode::BmicWrite`].
    pub group_number: u8,
    /// `TRANSFER LENGTH`, `PARAMETER LIST LENGTH` or `ALLOCATION LENGTH`, big endian.
    pub misc_len: [u8; 2],
    pub control: u8,
}

impl CommandDescriptor for X10CommandDescriptor {}

/// A 12 byte CDB, the shape of the Smart Array REPORT LOGICAL LUNS command.
#[repr(C, packed)]
pub struct X12CommandDescriptor {
    pub operation_code: OpCode,
    pub misc_info: u8,
    pub logical_block_address: [u8; 4],
    /// Big endian allocation length.
    pub misc_len: [u8; 4],
    pub _reserved: u8,
    pub control: u8,
}

impl CommandDescriptor for X12CommandDescriptor {}

/// "A command is communicated by sending a command descriptor block
/// to the device ...."
///
/// This struct implements the format described in
/// "SCSI Primary Commands - 2 (SPC-2)" 4.3.2 The fixed length CDB formats
/// Table 4 -- Typical CDB for 16-byte commands
#[repr(C, packed)]
pub struct X16CommandDescriptor {
    pub operation_code: OpCode,
    /// "Miscellaneous CDB information" (last 5 bits), or the service action
    /// for [`OpCode::ServiceActionIn16`].
    pub misc_info: u8,
    /// "The logical block addresses on a logical unit or within a volume partition
    /// shall begin with block zero and be contiguous up to the last logical
    /// block of that logical unit or within that partition."
    ///
    /// Big endian.
    pub logical_block_address: [u8; 8],
    /// `TRANSFER_LENGTH` or `PARAMETER_LIST_LENGTH`
    /// or `ALLOCATION LENGTH`, big endian.
    pub param: [u8; 4],
    pub _reserved: u8,
    pub control: u8,
}

impl CommandDescriptor for X16CommandDescriptor {}

pub trait CommandDescriptor: Sized {
    fn as_slice(&'_ self) -> &[u8] {
        // SAFETY: A struct is the size of itself
        let slice: &'_ [u8] = unsafe {
            let ptr = self as *const Self as *const u8;
            std::slice::from_raw_parts(ptr, std::mem::size_of::<Self>())
        };
        slice
    }
}

const _: () = {
    assert!(std::mem::size_of::<X6CommandDescriptor>() == 6);
    assert!(std::mem::size_of::<X10CommandDescriptor>() == 10);
    assert!(std::mem::size_of::<X12CommandDescriptor>() == 12);
    assert!(std::mem::size_of::<X16CommandDescriptor>() == 16);
};
