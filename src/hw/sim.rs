//! A software model of a Smart Array board: the SA5 register file, the
//! firmware that executes command lists out of [`DmaMemory`], and a set of
//! logical volumes backed by host memory.
//!
//! The engine cannot tell it apart from BAR0 of a real controller: it only
//! sees [`Mmio`] reads and writes and the interrupt line. Tests and the demo
//! binary use the extra knobs (volume hot-plug, fault injection, holding
//! completions back) to drive the engine through its error paths.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use super::Mmio;
use super::dma::DmaMemory;
use super::sa5::{FIFO_EMPTY, SA5_INTR_OFF, SA5_INTR_PENDING, SA5B_INTR_PENDING, offsets};
use crate::ciss::command_list::{
    COMMAND_LIST_SIZE, CommandList, CommandStatus, ERROR_BIT, ErrorInfo, LunAddress, MAX_CDB_SIZE,
    RequestType, SENSE_INFO_LEN, SgEntry,
};
use crate::config::RegisterGeneration;
use crate::scsi::command::{Message, VPD_DEVICE_ID, VPD_GEOMETRY, is_cache_flush};
use crate::scsi::{OpCode, Sense, sense_key, status};

/// Sense codes the firmware raises on its own.
const ASC_INVALID_OPCODE: u8 = 0x20;
const ASC_LBA_OUT_OF_RANGE: u8 = 0x21;
const ASC_INVALID_FIELD: u8 = 0x24;
const ASC_LUN_NOT_SUPPORTED: u8 = 0x25;

/// Geometry the firmware reports for every volume that supports it.
const SIM_HEADS: u32 = 255;
const SIM_SECTORS: u32 = 32;

/// One logical volume exported by the simulated firmware.
#[derive(Debug, Clone)]
pub struct SimVolume {
    pub lun: LunAddress,
    pub blocks: u64,
    pub block_size: u32,
    /// `None` models a volume that cannot report geometry.
    pub raid_level: Option<u8>,
    pub serial: [u8; 16],
    data: HashMap<u64, Vec<u8>>,
}

impl SimVolume {
    /// A RAID 5 volume with volume-set addressing for `index`.
    pub fn new(index: u8, blocks: u64) -> Self {
        let mut serial = *b"SIMVOL0000000000";
        serial[15] = b'0' + index % 10;
        serial[14] = b'0' + (index / 10) % 10;
        Self {
            lun: LunAddress([index, 0, 0, 0x40, 0, 0, 0, 0]),
            blocks,
            block_size: crate::scsi::SECTOR_SIZE,
            raid_level: Some(5),
            serial,
            data: HashMap::new(),
        }
    }

    pub fn without_geometry(mut self) -> Self {
        self.raid_level = None;
        self
    }

    fn read_blocks(&self, lba: u64, blocks: u64) -> Vec<u8> {
        let bs = self.block_size as usize;
        let mut out = Vec::with_capacity(blocks as usize * bs);
        for block in lba..lba + blocks {
            match self.data.get(&block) {
                Some(data) => out.extend_from_slice(data),
                None => out.resize(out.len() + bs, 0),
            }
        }
        out
    }

    fn write_blocks(&mut self, lba: u64, data: &[u8]) {
        for (i, chunk) in data.chunks(self.block_size as usize).enumerate() {
            self.data.insert(lba + i as u64, chunk.to_vec());
        }
    }
}

/// An outcome the firmware reports instead of executing a command.
#[derive(Debug, Clone)]
pub struct Fault {
    /// Only commands with this opcode trigger the fault; `None` matches
    /// any command.
    pub opcode: Option<u8>,
    /// Narrows an INQUIRY fault to one vital product data page.
    pub page: Option<u8>,
    pub error: ErrorInfo,
}

impl Fault {
    pub fn status(command_status: CommandStatus) -> Self {
        Self {
            opcode: None,
            page: None,
            error: ErrorInfo {
                command_status,
                ..Default::default()
            },
        }
    }

    pub fn check_condition(sense: Sense) -> Self {
        Self {
            opcode: None,
            page: None,
            error: check_condition(sense),
        }
    }

    pub fn unit_attention(asc: u8) -> Self {
        Self::check_condition(Sense {
            key: sense_key::UNIT_ATTENTION,
            asc,
            ascq: 0,
        })
    }

    pub fn on_opcode(mut self, opcode: OpCode) -> Self {
        self.opcode = Some(opcode as u8);
        self
    }

    pub fn on_vpd_page(mut self, page: u8) -> Self {
        self.opcode = Some(OpCode::Inquiry as u8);
        self.page = Some(page);
        self
    }

    /// Reports a short transfer of `residual` bytes.
    pub fn with_residual(mut self, residual: u32) -> Self {
        self.error.residual = residual;
        self
    }

    fn matches(&self, cdb: &[u8], request_type: RequestType) -> bool {
        request_type == RequestType::Command
            && self.opcode.is_none_or(|op| op == cdb[0])
            && self.page.is_none_or(|page| cdb[1] & 1 == 1 && cdb[2] == page)
    }
}

fn check_condition(sense: Sense) -> ErrorInfo {
    let fixed = sense.to_fixed();
    let mut info = ErrorInfo {
        command_status: CommandStatus::TargetStatus,
        scsi_status: status::CHECK_CONDITION,
        sense_len: fixed.len() as u8,
        ..Default::default()
    };
    info.sense[..fixed.len().min(SENSE_INFO_LEN)].copy_from_slice(&fixed);
    info
}

fn illegal_request(asc: u8) -> ErrorInfo {
    check_condition(Sense {
        key: sense_key::ILLEGAL_REQUEST,
        asc,
        ascq: 0,
    })
}

/// Counters of housekeeping commands the firmware has seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SimCounters {
    pub resets: u32,
    pub aborts: u32,
    pub noops: u32,
    pub cache_flushes: u32,
}

struct BoardState {
    /// Submissions waiting for [`SimulatedBoard::process`] while completions
    /// are held back.
    inbound: VecDeque<u32>,
    replies: VecDeque<u32>,
    mask: u32,
    hold: bool,
    volumes: Vec<SimVolume>,
    faults: VecDeque<Fault>,
    submitted: Vec<u32>,
    counters: SimCounters,
}

pub struct SimulatedBoard {
    generation: RegisterGeneration,
    dma: Arc<DmaMemory>,
    irq: Arc<Notify>,
    firmware_revision: [u8; 4],
    state: Mutex<BoardState>,
}

impl SimulatedBoard {
    pub fn new(generation: RegisterGeneration, dma: Arc<DmaMemory>) -> Arc<Self> {
        Arc::new(Self {
            generation,
            dma,
            irq: Arc::new(Notify::new()),
            firmware_revision: *b"7.22",
            state: Mutex::new(BoardState {
                inbound: VecDeque::new(),
                replies: VecDeque::new(),
                // out of reset with the reply interrupt masked
                mask: SA5_INTR_OFF,
                hold: false,
                volumes: Vec::new(),
                faults: VecDeque::new(),
                submitted: Vec::new(),
                counters: SimCounters::default(),
            }),
        })
    }

    /// The line the board pulses whenever a reply is posted while the
    /// interrupt is unmasked.
    pub fn irq_line(&self) -> Arc<Notify> {
        Arc::clone(&self.irq)
    }

    /// Exports a new volume and returns its LUN address.
    pub fn add_volume(&self, volume: SimVolume) -> LunAddress {
        let lun = volume.lun;
        self.state.lock().volumes.push(volume);
        lun
    }

    pub fn remove_volume(&self, lun: LunAddress) -> bool {
        let mut state = self.state.lock();
        let before = state.volumes.len();
        state.volumes.retain(|v| v.lun != lun);
        state.volumes.len() != before
    }

    /// Queues a fault for the next matching command.
    pub fn inject(&self, fault: Fault) {
        self.state.lock().faults.push_back(fault);
    }

    /// While held, submissions sit in the firmware until [`Self::process`].
    pub fn hold_completions(&self, hold: bool) {
        self.state.lock().hold = hold;
    }

    /// Executes every held submission. Returns how many ran.
    pub fn process(&self) -> usize {
        let mut state = self.state.lock();
        let mut ran = 0;
        while let Some(bus) = state.inbound.pop_front() {
            self.execute(&mut state, bus);
            ran += 1;
        }
        self.raise(&state);
        ran
    }

    /// Every bus address written to the request port, oldest first.
    pub fn submitted(&self) -> Vec<u32> {
        self.state.lock().submitted.clone()
    }

    pub fn counters(&self) -> SimCounters {
        self.state.lock().counters
    }

    fn pending_bit(&self) -> u32 {
        match self.generation {
            RegisterGeneration::Sa5 => SA5_INTR_PENDING,
            RegisterGeneration::Sa5b => SA5B_INTR_PENDING,
        }
    }

    fn raise(&self, state: &BoardState) {
        if state.mask == 0 && !state.replies.is_empty() {
            self.irq.notify_one();
        }
    }

    fn execute(&self, state: &mut BoardState, bus: u32) {
        let mut raw = vec![0u8; COMMAND_LIST_SIZE];
        if let Err(e) = self.dma.read(bus as u64, &mut raw) {
            warn!("firmware could not fetch command at {bus:#x}: {e}");
            return;
        }
        let list = match CommandList::from_slice(&raw) {
            Ok(list) => list,
            Err(e) => {
                warn!("firmware rejected command at {bus:#x}: {e}");
                return;
            }
        };
        let tag = list.tag() as u32;
        match self.run(state, list) {
            Ok(()) => state.replies.push_back(tag),
            Err(info) => {
                if let Err(e) = self.dma.write(list.err_addr(), &info.to_bytes()) {
                    warn!("firmware could not write error info: {e}");
                }
                state.replies.push_back(tag | ERROR_BIT);
            }
        }
    }

    fn run(&self, state: &mut BoardState, list: &CommandList) -> Result<(), ErrorInfo> {
        let cdb = list.cdb();
        if let Some(pos) = state
            .faults
            .iter()
            .position(|f| f.matches(cdb, list.request_type()))
        {
            if let Some(fault) = state.faults.remove(pos) {
                debug!("firmware injecting {:?}", fault.error.command_status);
                return Err(fault.error);
            }
        }
        let sg = list.sg();
        match list.request_type() {
            RequestType::Message => {
                match Message::parse(cdb) {
                    Some(Message::Reset) => state.counters.resets += 1,
                    Some(Message::Abort { tag }) => {
                        trace!("abort requested for tag {tag:#x}");
                        state.counters.aborts += 1;
                    }
                    Some(Message::Noop) => state.counters.noops += 1,
                    None => return Err(Fault::status(CommandStatus::Invalid).error),
                }
                Ok(())
            }
            RequestType::Command if list.lun() == LunAddress::CONTROLLER => {
                self.controller_command(state, cdb, &sg)
            }
            RequestType::Command => {
                let lun = list.lun();
                let Some(volume) = state.volumes.iter_mut().find(|v| v.lun == lun) else {
                    return Err(illegal_request(ASC_LUN_NOT_SUPPORTED));
                };
                self.volume_command(volume, cdb, &sg)
            }
        }
    }

    fn controller_command(
        &self,
        state: &mut BoardState,
        cdb: &[u8; MAX_CDB_SIZE],
        sg: &[SgEntry],
    ) -> Result<(), ErrorInfo> {
        match OpCode::from_byte(cdb[0]) {
            Some(OpCode::ReportLogicalLuns) => {
                let list_len = (state.volumes.len() * 8) as u32;
                let mut data = Vec::with_capacity(8 + list_len as usize);
                data.extend_from_slice(&list_len.to_be_bytes());
                data.extend_from_slice(&[0; 4]);
                for volume in &state.volumes {
                    data.extend_from_slice(&volume.lun.0);
                }
                self.deliver(sg, &data)
            }
            Some(OpCode::Inquiry) if cdb[1] & 1 == 0 => {
                let data = standard_inquiry(0x0c, b"SIM SMART ARRAY", &self.firmware_revision);
                self.deliver(sg, &data[..(cdb[4] as usize).min(data.len())])
            }
            Some(OpCode::TestUnitReady) => Ok(()),
            Some(OpCode::BmicWrite) if is_cache_flush(cdb) => {
                state.counters.cache_flushes += 1;
                Ok(())
            }
            _ => Err(illegal_request(ASC_INVALID_OPCODE)),
        }
    }

    fn volume_command(
        &self,
        volume: &mut SimVolume,
        cdb: &[u8; MAX_CDB_SIZE],
        sg: &[SgEntry],
    ) -> Result<(), ErrorInfo> {
        match OpCode::from_byte(cdb[0]) {
            Some(OpCode::TestUnitReady) => Ok(()),
            Some(OpCode::Inquiry) => {
                let allocation = cdb[4] as usize;
                let data = if cdb[1] & 1 == 0 {
                    standard_inquiry(0x00, b"LOGICAL VOLUME", b"OK  ").to_vec()
                } else {
                    match cdb[2] {
                        VPD_DEVICE_ID => {
                            let mut page = vec![0u8; 24];
                            page[1] = VPD_DEVICE_ID;
                            page[3] = 20;
                            page[8..24].copy_from_slice(&volume.serial);
                            page
                        }
                        VPD_GEOMETRY => geometry_page(volume),
                        _ => return Err(illegal_request(ASC_INVALID_FIELD)),
                    }
                };
                self.deliver(sg, &data[..allocation.min(data.len())])
            }
            Some(OpCode::ReadCapacity10) => {
                let last = u32::try_from(volume.blocks - 1).unwrap_or(u32::MAX);
                let mut data = [0u8; 8];
                data[..4].copy_from_slice(&last.to_be_bytes());
                data[4..].copy_from_slice(&volume.block_size.to_be_bytes());
                self.deliver(sg, &data)
            }
            Some(OpCode::ServiceActionIn16) if cdb[1] & 0x1f == 0x10 => {
                let mut data = [0u8; 32];
                data[..8].copy_from_slice(&(volume.blocks - 1).to_be_bytes());
                data[8..12].copy_from_slice(&volume.block_size.to_be_bytes());
                self.deliver(sg, &data)
            }
            Some(op @ (OpCode::Read10 | OpCode::Write10 | OpCode::Read16 | OpCode::Write16)) => {
                let (lba, blocks) = match op {
                    OpCode::Read10 | OpCode::Write10 => (
                        u32::from_be_bytes([cdb[2], cdb[3], cdb[4], cdb[5]]) as u64,
                        u16::from_be_bytes([cdb[7], cdb[8]]) as u64,
                    ),
                    _ => (
                        u64::from_be_bytes([
                            cdb[2], cdb[3], cdb[4], cdb[5], cdb[6], cdb[7], cdb[8], cdb[9],
                        ]),
                        u32::from_be_bytes([cdb[10], cdb[11], cdb[12], cdb[13]]) as u64,
                    ),
                };
                if lba.saturating_add(blocks) > volume.blocks {
                    return Err(illegal_request(ASC_LBA_OUT_OF_RANGE));
                }
                if matches!(op, OpCode::Read10 | OpCode::Read16) {
                    let data = volume.read_blocks(lba, blocks);
                    self.deliver(sg, &data)
                } else {
                    let data = self.gather(sg)?;
                    let len = (blocks * volume.block_size as u64) as usize;
                    volume.write_blocks(lba, &data[..len.min(data.len())]);
                    Ok(())
                }
            }
            _ => Err(illegal_request(ASC_INVALID_OPCODE)),
        }
    }

    /// Scatters `data` over the SG list, reporting an underrun when the
    /// host offered more room than there was data.
    fn deliver(&self, sg: &[SgEntry], data: &[u8]) -> Result<(), ErrorInfo> {
        let mut written = 0;
        for entry in sg {
            if written == data.len() {
                break;
            }
            let n = (entry.len as usize).min(data.len() - written);
            if self.dma.write(entry.addr, &data[written..written + n]).is_err() {
                return Err(Fault::status(CommandStatus::ProtocolError).error);
            }
            written += n;
        }
        let capacity: u64 = sg.iter().map(|e| e.len as u64).sum();
        if (written as u64) < capacity {
            return Err(ErrorInfo {
                command_status: CommandStatus::DataUnderrun,
                residual: (capacity - written as u64) as u32,
                ..Default::default()
            });
        }
        if written < data.len() {
            return Err(Fault::status(CommandStatus::DataOverrun).error);
        }
        Ok(())
    }

    fn gather(&self, sg: &[SgEntry]) -> Result<Vec<u8>, ErrorInfo> {
        let mut data = Vec::new();
        for entry in sg {
            let mut chunk = vec![0u8; entry.len as usize];
            if self.dma.read(entry.addr, &mut chunk).is_err() {
                return Err(Fault::status(CommandStatus::ProtocolError).error);
            }
            data.extend_from_slice(&chunk);
        }
        Ok(data)
    }
}

fn standard_inquiry(device_type: u8, product: &[u8], revision: &[u8; 4]) -> [u8; 36] {
    let mut data = [b' '; 36];
    data[..8].fill(0);
    data[0] = device_type;
    // SPC-2
    data[2] = 0x04;
    data[3] = 0x02;
    data[4] = 31;
    data[8..10].copy_from_slice(b"HP");
    let n = product.len().min(16);
    data[16..16 + n].copy_from_slice(&product[..n]);
    data[32..36].copy_from_slice(revision);
    data
}

fn geometry_page(volume: &SimVolume) -> Vec<u8> {
    let mut page = vec![0u8; 16];
    page[1] = VPD_GEOMETRY;
    match volume.raid_level {
        Some(level) => {
            let cylinders = volume.blocks / (SIM_HEADS * SIM_SECTORS) as u64;
            let cylinders = u16::try_from(cylinders).unwrap_or(u16::MAX);
            page[4..6].copy_from_slice(&cylinders.to_be_bytes());
            page[6] = SIM_HEADS as u8;
            page[7] = SIM_SECTORS as u8;
            page[8] = level;
        }
        None => page[8] = 0xff,
    }
    page
}

impl Mmio for SimulatedBoard {
    fn read32(&self, offset: usize) -> u32 {
        let mut state = self.state.lock();
        match offset {
            offsets::REPLY_PORT => state.replies.pop_front().unwrap_or(FIFO_EMPTY),
            offsets::INTR_STATUS if !state.replies.is_empty() => self.pending_bit(),
            offsets::REPLY_INTR_MASK => state.mask,
            _ => 0,
        }
    }

    fn write32(&self, offset: usize, value: u32) {
        let mut state = self.state.lock();
        match offset {
            offsets::REQUEST_PORT => {
                state.submitted.push(value);
                if state.hold {
                    state.inbound.push_back(value);
                } else {
                    self.execute(&mut state, value);
                }
            }
            offsets::REPLY_INTR_MASK => state.mask = value,
            _ => trace!("ignored register write {offset:#x} = {value:#x}"),
        }
        self.raise(&state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ciss::command_list::{CommandListFields, XferDirection, direct_tag};
    use crate::hw::dma::{DEFAULT_BASE, DmaBuffer};
    use crate::scsi::command;

    fn place(
        dma: &Arc<DmaMemory>,
        tag: u64,
        lun: LunAddress,
        cb: command::CommandBlock,
        data: &DmaBuffer,
    ) -> (DmaBuffer, DmaBuffer) {
        let cmd = dma.alloc_coherent(COMMAND_LIST_SIZE).unwrap();
        let err = dma.alloc_coherent(crate::ciss::command_list::ERROR_INFO_SIZE).unwrap();
        let sg = [SgEntry {
            addr: data.bus(),
            len: data.len() as u32,
        }];
        let list = CommandList::new(CommandListFields {
            tag,
            lun,
            cdb: &cb.get(),
            cdb_len: cb.len() as u8,
            request_type: cb.request_type,
            direction: cb.direction,
            timeout: 0,
            err_addr: err.bus(),
            sg: if data.is_empty() { &[] } else { &sg },
        });
        cmd.write_at(0, list.as_slice()).unwrap();
        (cmd, err)
    }

    #[test]
    fn report_luns_underruns_into_a_large_buffer() {
        let dma = DmaMemory::new(DEFAULT_BASE, 1 << 20);
        let board = SimulatedBoard::new(RegisterGeneration::Sa5, dma.clone());
        board.add_volume(SimVolume::new(0, 1 << 16));

        let data = dma.alloc_coherent(64).unwrap();
        let (cmd, err) = place(
            &dma,
            direct_tag(0) as u64,
            LunAddress::CONTROLLER,
            command::report_logical_luns(64),
            &data,
        );
        board.write32(offsets::REQUEST_PORT, cmd.bus() as u32);

        assert_eq!(board.read32(offsets::REPLY_PORT), direct_tag(0) | ERROR_BIT);
        let mut raw = [0u8; 48];
        dma.read(err.bus(), &mut raw).unwrap();
        let info = ErrorInfo::from_bytes(&raw).unwrap();
        assert_eq!(info.command_status, CommandStatus::DataUnderrun);
        assert_eq!(info.residual, 64 - 16);
        assert_eq!(&data.to_vec().unwrap()[..4], &8u32.to_be_bytes());
    }

    #[test]
    fn writes_are_read_back() {
        let dma = DmaMemory::new(DEFAULT_BASE, 1 << 20);
        let board = SimulatedBoard::new(RegisterGeneration::Sa5b, dma.clone());
        let lun = board.add_volume(SimVolume::new(1, 1024));

        let data = dma.alloc_coherent(512).unwrap();
        data.write_at(0, &[0xab; 512]).unwrap();
        let write = command::read_write(XferDirection::Write, 7, 1, 512);
        let (cmd, _err) = place(&dma, 0x40, lun, write, &data);
        board.write32(offsets::REQUEST_PORT, cmd.bus() as u32);
        assert_eq!(board.read32(offsets::REPLY_PORT), 0x40);

        let back = dma.alloc_coherent(512).unwrap();
        let read = command::read_write(XferDirection::Read, 7, 1, 512);
        let (cmd, _err) = place(&dma, 0x80, lun, read, &back);
        board.write32(offsets::REQUEST_PORT, cmd.bus() as u32);
        assert_eq!(board.read32(offsets::REPLY_PORT), 0x80);
        assert_eq!(back.to_vec().unwrap(), vec![0xab; 512]);
    }

    #[test]
    fn held_completions_wait_for_process() {
        let dma = DmaMemory::new(DEFAULT_BASE, 1 << 20);
        let board = SimulatedBoard::new(RegisterGeneration::Sa5, dma.clone());
        board.hold_completions(true);
        let none = dma.alloc_coherent(0).unwrap();
        let (cmd, _err) = place(&dma, 0x40, LunAddress::CONTROLLER, command::noop_message(), &none);
        board.write32(offsets::REQUEST_PORT, cmd.bus() as u32);

        assert_eq!(board.read32(offsets::INTR_STATUS), 0);
        assert_eq!(board.process(), 1);
        assert_eq!(board.read32(offsets::INTR_STATUS), SA5_INTR_PENDING);
        assert_eq!(board.read32(offsets::REPLY_PORT), 0x40);
        assert_eq!(board.counters().noops, 1);
    }

    #[test]
    fn injected_fault_replaces_execution() {
        let dma = DmaMemory::new(DEFAULT_BASE, 1 << 20);
        let board = SimulatedBoard::new(RegisterGeneration::Sa5, dma.clone());
        let lun = board.add_volume(SimVolume::new(0, 1024));
        board.inject(Fault::status(CommandStatus::HardwareError).on_opcode(OpCode::TestUnitReady));

        let none = dma.alloc_coherent(0).unwrap();
        let (cmd, err) = place(&dma, 0x40, lun, command::test_unit_ready(), &none);
        board.write32(offsets::REQUEST_PORT, cmd.bus() as u32);
        assert_eq!(board.read32(offsets::REPLY_PORT), 0x40 | ERROR_BIT);
        let mut raw = [0u8; 48];
        dma.read(err.bus(), &mut raw).unwrap();
        assert_eq!(
            ErrorInfo::from_bytes(&raw).unwrap().command_status,
            CommandStatus::HardwareError
        );
    }
}
