//! Shared fixtures for the engine's unit tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use super::arena::{CommandHandle, Membership};
use super::block::{BlockCompletion, BlockRequest};
use super::topology::LogicalDrive;
use super::{Controller, service_interrupts};
use crate::ciss::command_list::{COMMAND_LIST_SIZE, ERROR_BIT, ErrorInfo, LunAddress, XferDirection};
use crate::config::ControllerConfig;
use crate::hw::dma::{DEFAULT_BASE, DEFAULT_SIZE, DmaMemory};
use crate::hw::sim::SimulatedBoard;
use crate::hw::{RegisterInterface, access_for};
use crate::scsi::{SECTOR_SIZE, Sense, sense_key, status};

/// Registers that never execute anything: tests post completions by hand.
#[derive(Default)]
pub struct FakeRegisters {
    full: AtomicBool,
    capacity: Mutex<Option<u32>>,
    submitted: Mutex<Vec<u32>>,
    replies: Mutex<VecDeque<u32>>,
    outstanding: AtomicU32,
    enabled: AtomicBool,
}

impl FakeRegisters {
    pub fn set_full(&self, full: bool) {
        self.full.store(full, Ordering::SeqCst);
    }

    /// Reports a full FIFO once this many commands are outstanding.
    pub fn set_capacity(&self, capacity: Option<u32>) {
        *self.capacity.lock() = capacity;
    }

    pub fn submitted(&self) -> Vec<u32> {
        self.submitted.lock().clone()
    }

    pub fn post(&self, value: u32) {
        self.replies.lock().push_back(value);
    }

    pub fn replies_left(&self) -> usize {
        self.replies.lock().len()
    }
}

impl RegisterInterface for FakeRegisters {
    fn submit_command(&self, bus_addr: u32) {
        self.submitted.lock().push(bus_addr);
        self.outstanding.fetch_add(1, Ordering::SeqCst);
    }

    fn fifo_full(&self) -> bool {
        if self.full.load(Ordering::SeqCst) {
            return true;
        }
        self.capacity
            .lock()
            .is_some_and(|cap| self.outstanding.load(Ordering::SeqCst) >= cap)
    }

    fn command_completed(&self) -> Option<u32> {
        let value = self.replies.lock().pop_front()?;
        let _ = self
            .outstanding
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        Some(value)
    }

    fn intr_pending(&self) -> bool {
        !self.replies.lock().is_empty()
    }

    fn set_intr_mask(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn commands_outstanding(&self) -> u32 {
        self.outstanding.load(Ordering::SeqCst)
    }
}

fn dma() -> Arc<DmaMemory> {
    DmaMemory::new(DEFAULT_BASE, DEFAULT_SIZE)
}

/// A controller on fake registers with interrupts already enabled and no
/// drives configured.
pub fn controller(nr_cmds: usize) -> (Arc<Controller>, Arc<FakeRegisters>) {
    let regs = Arc::new(FakeRegisters::default());
    let config = ControllerConfig {
        nr_cmds,
        ..Default::default()
    };
    let controller = Controller::new("test0", config, regs.clone(), dma()).unwrap();
    controller.set_interrupts(true);
    (controller, regs)
}

/// Configures a drive as if a rescan had found it.
pub fn add_drive(controller: &Controller, index: usize, blocks: u64) {
    let lun = LunAddress([index as u8, 0, 0, 0x40, 0, 0, 0, 0]);
    let drive = LogicalDrive {
        lun_id: Some(lun),
        heads: 255,
        sectors: 32,
        cylinders: blocks.div_ceil(255 * 32) as u32,
        block_size: SECTOR_SIZE,
        nr_blocks: blocks,
        raid_level: Some(5),
        ..LogicalDrive::default()
    };
    controller.state.lock().drives.install(index, drive);
}

/// A single-segment request of `blocks` sectors.
pub fn request(
    drive: usize,
    direction: XferDirection,
    sector: u64,
    blocks: u64,
    done: impl FnOnce(BlockCompletion) + Send + 'static,
) -> BlockRequest {
    BlockRequest {
        drive,
        direction,
        sector,
        segments: vec![vec![0; (blocks * SECTOR_SIZE as u64) as usize]],
        done: Box::new(done),
    }
}

/// The command list the controller wrote at `bus`.
pub fn command_bytes(controller: &Controller, bus: u32) -> Vec<u8> {
    let mut raw = vec![0u8; COMMAND_LIST_SIZE];
    controller.dma.read(bus as u64, &mut raw).unwrap();
    raw
}

/// Plays the firmware: writes `error` into the command's error info block
/// and posts its tag.
pub fn complete_with(
    controller: &Controller,
    regs: &FakeRegisters,
    handle: CommandHandle,
    error: Option<ErrorInfo>,
) {
    let (tag, err_addr) = {
        let state = controller.state.lock();
        let desc = state.arena.get(handle).unwrap();
        (desc.tag, desc.err_addr)
    };
    match error {
        Some(info) => {
            controller.dma.write(err_addr, &info.to_bytes()).unwrap();
            regs.post(tag | ERROR_BIT);
        }
        None => regs.post(tag),
    }
}

pub fn unit_attention(asc: u8) -> ErrorInfo {
    let fixed = Sense {
        key: sense_key::UNIT_ATTENTION,
        asc,
        ascq: 0,
    }
    .to_fixed();
    let mut info = ErrorInfo {
        command_status: crate::ciss::command_list::CommandStatus::TargetStatus,
        scsi_status: status::CHECK_CONDITION,
        sense_len: fixed.len() as u8,
        ..Default::default()
    };
    info.sense[..fixed.len()].copy_from_slice(&fixed);
    info
}

/// Every pool command is on exactly the queue its membership says.
pub fn assert_conservation(controller: &Controller) {
    let state = controller.state.lock();
    for slot in 0..state.arena.slot_count() {
        let handle = CommandHandle::Pool(slot);
        let membership = state.arena.get(handle).unwrap().membership;
        let pending = state.pending.iter().filter(|&&h| h == handle).count();
        let in_flight = state.in_flight.iter().filter(|&&h| h == handle).count();
        let (want_pending, want_in_flight) = match membership {
            Membership::Pending => (1, 0),
            Membership::InFlight => (0, 1),
            Membership::Free | Membership::Allocated | Membership::Stale => (0, 0),
        };
        assert_eq!(
            (pending, in_flight),
            (want_pending, want_in_flight),
            "{handle:?} is {membership:?}"
        );
    }
}

/// A controller attached to a simulated board and initialized.
pub struct SimRig {
    pub controller: Arc<Controller>,
    pub board: Arc<SimulatedBoard>,
}

impl SimRig {
    /// Starts servicing the board's interrupt line. Needs a runtime.
    pub fn spawn_service(&self) -> JoinHandle<()> {
        tokio::spawn(service_interrupts(
            Arc::downgrade(&self.controller),
            self.board.irq_line(),
        ))
    }
}

pub fn sim_controller(config: ControllerConfig) -> SimRig {
    let dma = dma();
    let board = SimulatedBoard::new(config.generation, Arc::clone(&dma));
    let access = access_for(config.generation, board.clone(), config.nr_cmds as u32);
    let controller = Controller::new("sim0", config, access, dma).unwrap();
    controller.init().unwrap();
    SimRig { controller, board }
}
