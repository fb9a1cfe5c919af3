//! Command descriptors and the memory they live in.
//!
//! Pool commands sit in one coherent DMA block, one [`COMMAND_STRIDE`] apart,
//! and are claimed through a bitmap that never blocks. Heap commands get an
//! allocation of their own and may only be used by callers allowed to wait.
//! A [`CommandHandle`] records which of the two a command came from, so the
//! free path always matches the allocation path.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use color_eyre::{
    Result,
    eyre::{OptionExt, eyre},
};
use tracing::warn;

use crate::ciss::command_list::{
    COMMAND_LIST_SIZE, COMMAND_STRIDE, CommandList, CommandListFields, ERROR_INFO_SIZE,
    ErrorInfo, LunAddress, SgEntry, direct_tag,
};
use crate::error::{Exhausted, IoError};
use crate::hw::dma::{DmaBuffer, DmaMapping, DmaMemory};
use crate::scsi::command::{CommandBlock, test_unit_ready};

use super::Waiter;
use super::block::BlockIo;

/// Claim bits for the pool, one per slot.
pub struct SlotBitmap {
    words: Box<[AtomicU64]>,
    len: usize,
}

impl SlotBitmap {
    pub fn new(len: usize) -> Self {
        let words = (0..len.div_ceil(64)).map(|_| AtomicU64::new(0)).collect();
        Self { words, len }
    }

    pub fn capacity(&self) -> usize {
        self.len
    }

    /// Claims the lowest clear bit.
    pub fn claim(&self) -> Option<usize> {
        for (w, word) in self.words.iter().enumerate() {
            let valid = if (w + 1) * 64 <= self.len {
                u64::MAX
            } else {
                (1u64 << (self.len - w * 64)) - 1
            };
            let mut current = word.load(Ordering::Acquire);
            loop {
                let free = !current & valid;
                if free == 0 {
                    break;
                }
                let bit = 1u64 << free.trailing_zeros();
                let previous = word.fetch_or(bit, Ordering::AcqRel);
                if previous & bit == 0 {
                    return Some(w * 64 + bit.trailing_zeros() as usize);
                }
                // lost the race for this bit, try the next one
                current = previous;
            }
        }
        None
    }

    /// Clears `slot`, returning whether it was claimed.
    pub fn release(&self, slot: usize) -> bool {
        let bit = 1u64 << (slot % 64);
        self.words[slot / 64].fetch_and(!bit, Ordering::AcqRel) & bit != 0
    }

    pub fn is_claimed(&self, slot: usize) -> bool {
        self.words[slot / 64].load(Ordering::Acquire) & (1u64 << (slot % 64)) != 0
    }

    pub fn claimed(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Acquire).count_ones() as usize)
            .sum()
    }
}

/// Which allocator a command came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandHandle {
    /// Index into the pool.
    Pool(usize),
    /// A one-off allocation, keyed by its bus address.
    Heap(u32),
}

/// Where a command currently sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    Free,
    /// Owned by a caller, on neither queue.
    Allocated,
    Pending,
    InFlight,
    /// Abandoned while the firmware may still reference it. Never reused.
    Stale,
}

/// What to do with a command once the firmware hands it back.
pub enum CommandKind {
    Idle,
    Block(Box<BlockIo>),
    /// A task is waiting on the other end.
    Waiting(Waiter),
    /// Collected by the poll path.
    Polled,
}

pub struct CommandDescriptor {
    pub handle: CommandHandle,
    pub bus_addr: u32,
    pub err_addr: u64,
    pub tag: u32,
    pub lun: LunAddress,
    pub cdb: CommandBlock,
    pub sg: Vec<SgEntry>,
    /// Data buffers the scatter-gather list points at that the command
    /// itself keeps alive. Stale commands hold on to theirs for good.
    pub buffers: Vec<DmaMapping>,
    /// Firmware timeout in seconds, zero for none.
    pub timeout: u16,
    pub retry_count: u8,
    pub membership: Membership,
    pub kind: CommandKind,
}

impl CommandDescriptor {
    fn new(handle: CommandHandle, bus_addr: u32, err_addr: u64, tag: u32) -> Self {
        Self {
            handle,
            bus_addr,
            err_addr,
            tag,
            lun: LunAddress::CONTROLLER,
            cdb: test_unit_ready(),
            sg: Vec::new(),
            buffers: Vec::new(),
            timeout: 0,
            retry_count: 0,
            membership: Membership::Free,
            kind: CommandKind::Idle,
        }
    }

    fn reset(&mut self) {
        self.lun = LunAddress::CONTROLLER;
        self.cdb = test_unit_ready();
        self.sg.clear();
        self.buffers.clear();
        self.timeout = 0;
        self.retry_count = 0;
        self.kind = CommandKind::Idle;
    }
}

struct HeapCommand {
    desc: CommandDescriptor,
    _command: DmaBuffer,
    _error: DmaBuffer,
}

pub struct CommandArena {
    bitmap: SlotBitmap,
    slots: Vec<CommandDescriptor>,
    heap: HashMap<u32, HeapCommand>,
    _pool: DmaBuffer,
    _errors: DmaBuffer,
    dma: Arc<DmaMemory>,
}

impl CommandArena {
    pub fn new(dma: Arc<DmaMemory>, nr_cmds: usize) -> Result<Self> {
        let pool = dma
            .alloc_coherent(nr_cmds * COMMAND_STRIDE)
            .ok_or_eyre("no DMA memory for the command pool")?;
        let errors = dma
            .alloc_coherent(nr_cmds * ERROR_INFO_SIZE)
            .ok_or_eyre("no DMA memory for the error info pool")?;
        let slots = (0..nr_cmds)
            .map(|i| {
                let bus = pool.bus() + (i * COMMAND_STRIDE) as u64;
                let bus = u32::try_from(bus)
                    .map_err(|_| eyre!("command pool at {bus:#x} is above 4 GiB"))?;
                let err_addr = errors.bus() + (i * ERROR_INFO_SIZE) as u64;
                Ok(CommandDescriptor::new(
                    CommandHandle::Pool(i),
                    bus,
                    err_addr,
                    direct_tag(i),
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            bitmap: SlotBitmap::new(nr_cmds),
            slots,
            heap: HashMap::new(),
            _pool: pool,
            _errors: errors,
            dma,
        })
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Commands currently allocated from either source, stale ones included.
    pub fn in_use(&self) -> usize {
        self.bitmap.claimed() + self.heap.len()
    }

    /// Claims a pool slot. Never blocks.
    pub fn allocate_pooled(&mut self) -> Result<CommandHandle, Exhausted> {
        let slot = self.bitmap.claim().ok_or(Exhausted)?;
        let desc = &mut self.slots[slot];
        desc.reset();
        desc.membership = Membership::Allocated;
        Ok(desc.handle)
    }

    /// Allocates a one-off command from DMA memory.
    pub fn allocate_heap(&mut self) -> Result<CommandHandle, IoError> {
        let command = self
            .dma
            .alloc_coherent(COMMAND_LIST_SIZE)
            .ok_or(IoError::OutOfMemory)?;
        let error = self
            .dma
            .alloc_coherent(ERROR_INFO_SIZE)
            .ok_or(IoError::OutOfMemory)?;
        let bus = u32::try_from(command.bus()).map_err(|_| IoError::OutOfMemory)?;
        let handle = CommandHandle::Heap(bus);
        let mut desc = CommandDescriptor::new(handle, bus, error.bus(), bus);
        desc.membership = Membership::Allocated;
        self.heap.insert(
            bus,
            HeapCommand {
                desc,
                _command: command,
                _error: error,
            },
        );
        Ok(handle)
    }

    /// Returns a command to the allocator it came from.
    ///
    /// Stale commands stay allocated for the lifetime of the arena.
    pub fn release(&mut self, handle: CommandHandle) {
        let Some(desc) = self.get_mut(handle) else {
            warn!("releasing unknown command {handle:?}");
            return;
        };
        match desc.membership {
            Membership::Stale => return,
            Membership::Free => {
                warn!("double release of {handle:?}");
                return;
            }
            Membership::Pending | Membership::InFlight => {
                warn!("releasing {handle:?} while it is {:?}", desc.membership);
            }
            Membership::Allocated => {}
        }
        match handle {
            CommandHandle::Pool(slot) => {
                let desc = &mut self.slots[slot];
                desc.reset();
                desc.membership = Membership::Free;
                self.bitmap.release(slot);
            }
            CommandHandle::Heap(bus) => {
                self.heap.remove(&bus);
            }
        }
    }

    pub fn mark_stale(&mut self, handle: CommandHandle) {
        if let Some(desc) = self.get_mut(handle) {
            desc.membership = Membership::Stale;
        }
    }

    pub fn get(&self, handle: CommandHandle) -> Option<&CommandDescriptor> {
        match handle {
            CommandHandle::Pool(slot) => self.slots.get(slot),
            CommandHandle::Heap(bus) => self.heap.get(&bus).map(|h| &h.desc),
        }
    }

    pub fn get_mut(&mut self, handle: CommandHandle) -> Option<&mut CommandDescriptor> {
        match handle {
            CommandHandle::Pool(slot) => self.slots.get_mut(slot),
            CommandHandle::Heap(bus) => self.heap.get_mut(&bus).map(|h| &mut h.desc),
        }
    }

    /// Serializes the descriptor into its command list and clears its error
    /// info block, ready for (re)submission.
    pub fn write_command(&self, handle: CommandHandle) -> Result<()> {
        let desc = self
            .get(handle)
            .ok_or_else(|| eyre!("no command for {handle:?}"))?;
        let cdb = desc.cdb.get();
        let list = CommandList::new(CommandListFields {
            tag: desc.tag as u64,
            lun: desc.lun,
            cdb: &cdb,
            cdb_len: desc.cdb.len() as u8,
            request_type: desc.cdb.request_type,
            direction: desc.cdb.direction,
            timeout: desc.timeout,
            err_addr: desc.err_addr,
            sg: &desc.sg,
        });
        self.dma.write(desc.bus_addr as u64, list.as_slice())?;
        self.dma.zero(desc.err_addr, ERROR_INFO_SIZE)
    }

    pub fn read_error_info(&self, handle: CommandHandle) -> Result<ErrorInfo> {
        let desc = self
            .get(handle)
            .ok_or_else(|| eyre!("no command for {handle:?}"))?;
        let mut raw = [0u8; ERROR_INFO_SIZE];
        self.dma.read(desc.err_addr, &mut raw)?;
        ErrorInfo::from_bytes(&raw)
    }
}
