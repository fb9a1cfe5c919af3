//! Interactions with the controller's registers and DMA memory.
//!
//! The engine never touches a register directly: it goes through a
//! [`RegisterInterface`], chosen at attach time for the board's register
//! generation, which in turn reads and writes an [`Mmio`] window.

pub mod dma;
pub mod sa5;
pub mod sim;

use std::sync::Arc;

use crate::config::RegisterGeneration;

/// A 32 bit register window, as exposed by BAR0 of the controller.
pub trait Mmio: Send + Sync {
    fn read32(&self, offset: usize) -> u32;
    fn write32(&self, offset: usize, value: u32);
}

/// Doorbell, FIFO and interrupt control of one controller.
///
/// Every method is a handful of register accesses and never sleeps.
pub trait RegisterInterface: Send + Sync {
    /// Hands the command list at `bus_addr` to the controller.
    ///
    /// Must not be called while [`RegisterInterface::fifo_full`] is true.
    fn submit_command(&self, bus_addr: u32);

    /// True when the controller cannot take another command.
    fn fifo_full(&self) -> bool;

    /// Pops one value from the reply FIFO, or `None` if it is empty.
    fn command_completed(&self) -> Option<u32>;

    /// True when the controller is asserting its interrupt.
    fn intr_pending(&self) -> bool;

    /// Unmasks (`true`) or masks (`false`) the reply interrupt.
    fn set_intr_mask(&self, enabled: bool);

    /// Commands submitted and not yet popped from the reply FIFO.
    fn commands_outstanding(&self) -> u32;
}

/// Picks the register interface for `generation`.
pub fn access_for(
    generation: RegisterGeneration,
    mmio: Arc<dyn Mmio>,
    max_commands: u32,
) -> Arc<dyn RegisterInterface> {
    match generation {
        RegisterGeneration::Sa5 => Arc::new(sa5::Sa5Access::new(mmio, max_commands)),
        RegisterGeneration::Sa5b => Arc::new(sa5::Sa5bAccess::new(mmio, max_commands)),
    }
}
