//! The command list the controller fetches over DMA, the error info block
//! it writes back, and the tag values that travel through the FIFOs.
//!
//! All multi-byte fields are little endian, matching what the firmware
//! reads on the bus.

use color_eyre::eyre::ensure;

/// The request block always reserves 16 CDB bytes.
pub const MAX_CDB_SIZE: usize = 16;

/// Scatter-gather entries embedded in every command list.
pub const MAX_SG_ENTRIES: usize = 32;

/// Bytes of sense data the error info block can carry.
pub const SENSE_INFO_LEN: usize = 32;

/// Commands are placed on this alignment so the low tag bits stay free for
/// the direct-lookup and error flags.
pub const COMMAND_ALIGN: usize = 32;

/// Tag bit 2: the rest of the tag is a pool slot index.
pub const DIRECT_LOOKUP_BIT: u32 = 0x04;
/// Shift that recovers the slot index from a direct-lookup tag.
pub const DIRECT_LOOKUP_SHIFT: u32 = 3;
/// Completion bit 0: the firmware filled in the error info block.
pub const ERROR_BIT: u32 = 0x01;
/// Tag bits that never belong to an address.
const TAG_FLAG_MASK: u32 = 0x03;

const ATTR_SIMPLE: u8 = 4;

/// 8 byte address of a logical unit as the firmware understands it.
///
/// The all-zero address targets the controller itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LunAddress(pub [u8; 8]);

impl LunAddress {
    pub const CONTROLLER: LunAddress = LunAddress([0; 8]);
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    /// A CDB for the addressed logical unit.
    Command = 0,
    /// A message to the controller (abort, reset, no-op).
    Message = 1,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XferDirection {
    None = 0,
    /// Host to controller
    Write = 1,
    /// Controller to host
    Read = 2,
}

/// Packs the request type, the simple queue attribute and the transfer
/// direction into one byte.
fn type_attr_dir(request_type: RequestType, direction: XferDirection) -> u8 {
    request_type as u8 | (ATTR_SIMPLE << 3) | ((direction as u8) << 6)
}

/// One scatter-gather element as the host sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SgEntry {
    pub addr: u64,
    pub len: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct WireSgEntry {
    addr: [u8; 8],
    len: [u8; 4],
    ext: [u8; 4],
}

/// The command list read by the firmware.
#[repr(C, packed)]
pub struct CommandList {
    reply_queue: u8,
    /// Scatter-gather entries embedded in this command list.
    sg_in_cmd: u8,
    sg_total: [u8; 2],
    /// Echoed back through the reply FIFO when the command completes.
    tag: [u8; 8],
    lun: [u8; 8],
    cdb_len: u8,
    type_attr_dir: u8,
    /// Seconds; zero means no firmware timeout.
    timeout: [u8; 2],
    cdb: [u8; MAX_CDB_SIZE],
    /// Where the firmware writes the error info block.
    err_addr: [u8; 8],
    err_len: [u8; 4],
    sg: [WireSgEntry; MAX_SG_ENTRIES],
}

/// Size of a command list on the bus.
pub const COMMAND_LIST_SIZE: usize = std::mem::size_of::<CommandList>();

/// Distance between pool commands, rounded up to [`COMMAND_ALIGN`].
pub const COMMAND_STRIDE: usize = COMMAND_LIST_SIZE.div_ceil(COMMAND_ALIGN) * COMMAND_ALIGN;

const _: () = assert!(COMMAND_LIST_SIZE == 20 + 20 + 12 + 16 * MAX_SG_ENTRIES);

/// Field values for [`CommandList::new`].
#[derive(Debug, Clone)]
pub struct CommandListFields<'a> {
    pub tag: u64,
    pub lun: LunAddress,
    pub cdb: &'a [u8; MAX_CDB_SIZE],
    pub cdb_len: u8,
    pub request_type: RequestType,
    pub direction: XferDirection,
    pub timeout: u16,
    pub err_addr: u64,
    pub sg: &'a [SgEntry],
}

impl CommandList {
    /// Creates a new [`CommandList`]. SG entries past [`MAX_SG_ENTRIES`] are
    /// rejected by the caller before this point.
    pub fn new(fields: CommandListFields<'_>) -> Self {
        let mut sg = [WireSgEntry {
            addr: [0; 8],
            len: [0; 4],
            ext: [0; 4],
        }; MAX_SG_ENTRIES];
        for (wire, entry) in sg.iter_mut().zip(fields.sg) {
            wire.addr = entry.addr.to_le_bytes();
            wire.len = entry.len.to_le_bytes();
        }
        let count = fields.sg.len().min(MAX_SG_ENTRIES);
        Self {
            reply_queue: 0,
            sg_in_cmd: count as u8,
            sg_total: (count as u16).to_le_bytes(),
            tag: fields.tag.to_le_bytes(),
            lun: fields.lun.0,
            cdb_len: fields.cdb_len,
            type_attr_dir: type_attr_dir(fields.request_type, fields.direction),
            timeout: fields.timeout.to_le_bytes(),
            cdb: *fields.cdb,
            err_addr: fields.err_addr.to_le_bytes(),
            err_len: (ERROR_INFO_SIZE as u32).to_le_bytes(),
            sg,
        }
    }

    /// Returns a slice containing the entirety of `self` that is exactly
    /// [`COMMAND_LIST_SIZE`] bytes in length
    pub fn as_slice(&'_ self) -> &[u8] {
        // SAFETY: the struct is packed plain bytes of exactly
        // COMMAND_LIST_SIZE, and we know the lifetime of `self` is valid.
        unsafe {
            let ptr = self as *const CommandList as *const u8;
            std::slice::from_raw_parts(ptr, COMMAND_LIST_SIZE)
        }
    }

    /// Cast the provided slice into a command list.
    ///
    /// This function validates the request byte and the SG count, the two
    /// fields the firmware would reject a command for.
    pub fn from_slice(buf: &[u8]) -> color_eyre::Result<&CommandList> {
        ensure!(
            buf.len() == COMMAND_LIST_SIZE,
            "provided buffer *must* be COMMAND_LIST_SIZE bytes, was instead {}",
            buf.len()
        );
        // SAFETY: The buffer is the same size as the struct, every field is
        // a byte array and the struct is packed.
        let list: &'_ CommandList = unsafe { &*(buf.as_ptr() as *const CommandList) };
        ensure!(
            list.type_attr_dir & 0x07 <= RequestType::Message as u8,
            "invalid request type {:#x}",
            list.type_attr_dir & 0x07
        );
        ensure!(
            list.type_attr_dir >> 6 <= XferDirection::Read as u8,
            "invalid transfer direction {:#x}",
            list.type_attr_dir >> 6
        );
        ensure!(
            list.sg_in_cmd as usize <= MAX_SG_ENTRIES,
            "command claims {} SG entries, at most {MAX_SG_ENTRIES} fit",
            list.sg_in_cmd
        );
        Ok(list)
    }

    pub fn tag(&self) -> u64 {
        u64::from_le_bytes(self.tag)
    }

    pub fn lun(&self) -> LunAddress {
        LunAddress(self.lun)
    }

    pub fn cdb(&self) -> &[u8; MAX_CDB_SIZE] {
        &self.cdb
    }

    pub fn request_type(&self) -> RequestType {
        if self.type_attr_dir & 0x07 == RequestType::Message as u8 {
            RequestType::Message
        } else {
            RequestType::Command
        }
    }

    pub fn direction(&self) -> XferDirection {
        match self.type_attr_dir >> 6 {
            1 => XferDirection::Write,
            2 => XferDirection::Read,
            _ => XferDirection::None,
        }
    }

    pub fn err_addr(&self) -> u64 {
        u64::from_le_bytes(self.err_addr)
    }

    pub fn sg(&self) -> Vec<SgEntry> {
        self.sg[..self.sg_in_cmd as usize]
            .iter()
            .map(|wire| SgEntry {
                addr: u64::from_le_bytes(wire.addr),
                len: u32::from_le_bytes(wire.len),
            })
            .collect()
    }
}

/// Command status written by the firmware into the error info block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandStatus {
    #[default]
    Success,
    /// The target returned a SCSI status other than GOOD.
    TargetStatus,
    DataUnderrun,
    DataOverrun,
    Invalid,
    ProtocolError,
    HardwareError,
    ConnectionLost,
    Aborted,
    AbortFailed,
    UnsolicitedAbort,
    Timeout,
    Unabortable,
    Unknown(u16),
}

impl CommandStatus {
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            0x0 => Self::Success,
            0x1 => Self::TargetStatus,
            0x2 => Self::DataUnderrun,
            0x3 => Self::DataOverrun,
            0x4 => Self::Invalid,
            0x5 => Self::ProtocolError,
            0x6 => Self::HardwareError,
            0x7 => Self::ConnectionLost,
            0x8 => Self::Aborted,
            0x9 => Self::AbortFailed,
            0xa => Self::UnsolicitedAbort,
            0xb => Self::Timeout,
            0xc => Self::Unabortable,
            other => Self::Unknown(other),
        }
    }

    pub fn raw(self) -> u16 {
        match self {
            Self::Success => 0x0,
            Self::TargetStatus => 0x1,
            Self::DataUnderrun => 0x2,
            Self::DataOverrun => 0x3,
            Self::Invalid => 0x4,
            Self::ProtocolError => 0x5,
            Self::HardwareError => 0x6,
            Self::ConnectionLost => 0x7,
            Self::Aborted => 0x8,
            Self::AbortFailed => 0x9,
            Self::UnsolicitedAbort => 0xa,
            Self::Timeout => 0xb,
            Self::Unabortable => 0xc,
            Self::Unknown(other) => other,
        }
    }
}

/// Size of the error info block on the bus.
pub const ERROR_INFO_SIZE: usize = 48;

/// The error info block, decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ErrorInfo {
    pub scsi_status: u8,
    pub sense_len: u8,
    pub command_status: CommandStatus,
    /// Bytes not transferred.
    pub residual: u32,
    pub more_err_info: [u8; 8],
    pub sense: [u8; SENSE_INFO_LEN],
}

impl ErrorInfo {
    /// The sense bytes the firmware declared valid.
    pub fn sense_data(&self) -> &[u8] {
        &self.sense[..(self.sense_len as usize).min(SENSE_INFO_LEN)]
    }

    pub fn to_bytes(&self) -> [u8; ERROR_INFO_SIZE] {
        let mut buf = [0u8; ERROR_INFO_SIZE];
        buf[0] = self.scsi_status;
        buf[1] = self.sense_len;
        buf[2..4].copy_from_slice(&self.command_status.raw().to_le_bytes());
        buf[4..8].copy_from_slice(&self.residual.to_le_bytes());
        buf[8..16].copy_from_slice(&self.more_err_info);
        buf[16..48].copy_from_slice(&self.sense);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> color_eyre::Result<Self> {
        ensure!(
            buf.len() == ERROR_INFO_SIZE,
            "error info block must be {ERROR_INFO_SIZE} bytes, was {}",
            buf.len()
        );
        let mut more_err_info = [0u8; 8];
        more_err_info.copy_from_slice(&buf[8..16]);
        let mut sense = [0u8; SENSE_INFO_LEN];
        sense.copy_from_slice(&buf[16..48]);
        Ok(Self {
            scsi_status: buf[0],
            sense_len: buf[1],
            command_status: CommandStatus::from_raw(u16::from_le_bytes([buf[2], buf[3]])),
            residual: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            more_err_info,
            sense,
        })
    }
}

/// Tag for a pool command, encoding its slot directly.
pub fn direct_tag(slot: usize) -> u32 {
    ((slot as u32) << DIRECT_LOOKUP_SHIFT) | DIRECT_LOOKUP_BIT
}

/// A value popped from the reply FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionTag {
    /// Pool slot, straight from a direct-lookup tag. Not yet bounds checked.
    Direct { slot: usize, error: bool },
    /// Bus address of the command list, to be matched against in-flight
    /// commands.
    BusAddress { addr: u32, error: bool },
}

impl CompletionTag {
    pub fn decode(raw: u32) -> Self {
        let error = raw & ERROR_BIT != 0;
        if raw & DIRECT_LOOKUP_BIT != 0 {
            Self::Direct {
                slot: (raw >> DIRECT_LOOKUP_SHIFT) as usize,
                error,
            }
        } else {
            Self::BusAddress {
                addr: raw & !TAG_FLAG_MASK,
                error,
            }
        }
    }

    pub fn error(&self) -> bool {
        match *self {
            Self::Direct { error, .. } | Self::BusAddress { error, .. } => error,
        }
    }
}
