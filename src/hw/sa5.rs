//! Register access for the SA5 family of controllers.
//!
//! Both generations share the request/reply ports and the software FIFO
//! accounting; they differ in which interrupt status bit signals a pending
//! reply and which mask value turns the interrupt off.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tracing::trace;

use super::{Mmio, RegisterInterface};

/// Register offsets from the start of BAR0.
pub mod offsets {
    pub const INTR_STATUS: usize = 0x30;
    pub const REPLY_INTR_MASK: usize = 0x34;
    pub const REQUEST_PORT: usize = 0x40;
    pub const REPLY_PORT: usize = 0x44;
}

/// Read from the reply port when no command has completed.
pub const FIFO_EMPTY: u32 = 0xffff_ffff;

pub const SA5_INTR_PENDING: u32 = 0x08;
pub const SA5_INTR_OFF: u32 = 0x08;
pub const SA5B_INTR_PENDING: u32 = 0x04;
pub const SA5B_INTR_OFF: u32 = 0x04;

/// Request/reply ports plus the outstanding command count the SA5 uses in
/// place of a hardware "FIFO full" flag.
struct Ports {
    mmio: Arc<dyn Mmio>,
    max_commands: u32,
    outstanding: AtomicU32,
}

impl Ports {
    fn new(mmio: Arc<dyn Mmio>, max_commands: u32) -> Self {
        Self {
            mmio,
            max_commands,
            outstanding: AtomicU32::new(0),
        }
    }

    fn submit(&self, bus_addr: u32) {
        trace!("request port write {bus_addr:#x}");
        // counted first: the reply may be popped before the write returns
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        self.mmio.write32(offsets::REQUEST_PORT, bus_addr);
    }

    fn full(&self) -> bool {
        self.outstanding.load(Ordering::Acquire) >= self.max_commands
    }

    fn completed(&self) -> Option<u32> {
        let value = self.mmio.read32(offsets::REPLY_PORT);
        if value == FIFO_EMPTY {
            return None;
        }
        // a reply for a command we never counted must not wrap the counter
        let _ = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        Some(value)
    }

    fn intr_status(&self) -> u32 {
        self.mmio.read32(offsets::INTR_STATUS)
    }

    fn mask(&self, enabled: bool, off_value: u32) {
        let value = if enabled { 0 } else { off_value };
        self.mmio.write32(offsets::REPLY_INTR_MASK, value);
    }

    fn outstanding(&self) -> u32 {
        self.outstanding.load(Ordering::Acquire)
    }
}

/// Original Smart Array 5xxx register behaviour.
pub struct Sa5Access {
    ports: Ports,
}

impl Sa5Access {
    pub fn new(mmio: Arc<dyn Mmio>, max_commands: u32) -> Self {
        Self {
            ports: Ports::new(mmio, max_commands),
        }
    }
}

impl RegisterInterface for Sa5Access {
    fn submit_command(&self, bus_addr: u32) {
        self.ports.submit(bus_addr)
    }

    fn fifo_full(&self) -> bool {
        self.ports.full()
    }

    fn command_completed(&self) -> Option<u32> {
        self.ports.completed()
    }

    fn intr_pending(&self) -> bool {
        self.ports.intr_status() & SA5_INTR_PENDING != 0
    }

    fn set_intr_mask(&self, enabled: bool) {
        self.ports.mask(enabled, SA5_INTR_OFF)
    }

    fn commands_outstanding(&self) -> u32 {
        self.ports.outstanding()
    }
}

/// Later boards, which report pending replies on a different status bit.
pub struct Sa5bAccess {
    ports: Ports,
}

impl Sa5bAccess {
    pub fn new(mmio: Arc<dyn Mmio>, max_commands: u32) -> Self {
        Self {
            ports: Ports::new(mmio, max_commands),
        }
    }
}

impl RegisterInterface for Sa5bAccess {
    fn submit_command(&self, bus_addr: u32) {
        self.ports.submit(bus_addr)
    }

    fn fifo_full(&self) -> bool {
        self.ports.full()
    }

    fn command_completed(&self) -> Option<u32> {
        self.ports.completed()
    }

    fn intr_pending(&self) -> bool {
        self.ports.intr_status() & SA5B_INTR_PENDING != 0
    }

    fn set_intr_mask(&self, enabled: bool) {
        self.ports.mask(enabled, SA5B_INTR_OFF)
    }

    fn commands_outstanding(&self) -> u32 {
        self.ports.outstanding()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use parking_lot::Mutex;

    use super::*;

    /// Bare register file: writes to the request port are recorded, reads
    /// of the reply port drain a queue.
    #[derive(Default)]
    struct Registers {
        requests: Mutex<Vec<u32>>,
        replies: Mutex<VecDeque<u32>>,
        mask: Mutex<u32>,
        status: Mutex<u32>,
    }

    impl Mmio for Registers {
        fn read32(&self, offset: usize) -> u32 {
            match offset {
                offsets::REPLY_PORT => self.replies.lock().pop_front().unwrap_or(FIFO_EMPTY),
                offsets::INTR_STATUS => *self.status.lock(),
                offsets::REPLY_INTR_MASK => *self.mask.lock(),
                _ => 0,
            }
        }

        fn write32(&self, offset: usize, value: u32) {
            match offset {
                offsets::REQUEST_PORT => self.requests.lock().push(value),
                offsets::REPLY_INTR_MASK => *self.mask.lock() = value,
                _ => {}
            }
        }
    }

    #[test]
    fn fifo_full_tracks_outstanding_commands() {
        let regs = Arc::new(Registers::default());
        let access = Sa5Access::new(regs.clone(), 2);
        access.submit_command(0x1000);
        assert!(!access.fifo_full());
        access.submit_command(0x1040);
        assert!(access.fifo_full());

        regs.replies.lock().push_back(0x1000);
        assert_eq!(access.command_completed(), Some(0x1000));
        assert!(!access.fifo_full());
        assert_eq!(access.command_completed(), None);
        assert_eq!(access.commands_outstanding(), 1);
        assert_eq!(*regs.requests.lock(), vec![0x1000, 0x1040]);
    }

    #[test]
    fn generations_use_different_interrupt_bits() {
        let regs = Arc::new(Registers::default());
        let sa5 = Sa5Access::new(regs.clone(), 8);
        let sa5b = Sa5bAccess::new(regs.clone(), 8);

        *regs.status.lock() = SA5_INTR_PENDING;
        assert!(sa5.intr_pending());
        assert!(!sa5b.intr_pending());

        *regs.status.lock() = SA5B_INTR_PENDING;
        assert!(!sa5.intr_pending());
        assert!(sa5b.intr_pending());

        sa5b.set_intr_mask(false);
        assert_eq!(*regs.mask.lock(), SA5B_INTR_OFF);
        sa5.set_intr_mask(false);
        assert_eq!(*regs.mask.lock(), SA5_INTR_OFF);
        sa5.set_intr_mask(true);
        assert_eq!(*regs.mask.lock(), 0);
    }
}
