//! The pending queue and the submission loop that feeds the hardware FIFO.

use color_eyre::{Result, eyre::eyre};
use tracing::trace;

use super::arena::{CommandHandle, Membership};
use super::{Controller, ControllerState};

impl Controller {
    /// Writes the command out to DMA memory and appends it to the pending
    /// queue. Nothing reaches the hardware until [`Controller::start_io`].
    pub(super) fn enqueue(&self, state: &mut ControllerState, handle: CommandHandle) -> Result<()> {
        state.arena.write_command(handle)?;
        let desc = state
            .arena
            .get_mut(handle)
            .ok_or_else(|| eyre!("no command for {handle:?}"))?;
        desc.membership = Membership::Pending;
        state.pending.push_back(handle);
        Ok(())
    }

    /// Moves pending commands to the hardware, oldest first, until either
    /// the queue is empty or the FIFO is full.
    pub fn start_io(&self) {
        let mut state = self.state.lock();
        self.start_io_locked(&mut state);
    }

    pub(super) fn start_io_locked(&self, state: &mut ControllerState) {
        if state.failed {
            return;
        }
        while !state.pending.is_empty() && !self.access.fifo_full() {
            let Some(handle) = state.pending.pop_front() else {
                break;
            };
            let Some(desc) = state.arena.get_mut(handle) else {
                continue;
            };
            trace!("{}: submitting {handle:?} tag {:#x}", self.name, desc.tag);
            desc.membership = Membership::InFlight;
            let bus_addr = desc.bus_addr;
            state.in_flight.push_back(handle);
            self.access.submit_command(bus_addr);
            state.max_outstanding = state
                .max_outstanding
                .max(self.access.commands_outstanding());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing;
    use super::*;
    use crate::ciss::command_list::XferDirection;

    #[test]
    fn submission_follows_pending_order() {
        let (controller, regs) = testing::controller(8);
        testing::add_drive(&controller, 0, 1 << 20);
        regs.set_full(true);

        let mut expected = Vec::new();
        for i in 0..3 {
            controller.submit_block(testing::request(0, XferDirection::Read, i * 8, 1, |_| {}));
            expected.push(
                controller
                    .state
                    .lock()
                    .arena
                    .get(CommandHandle::Pool(i as usize))
                    .unwrap()
                    .bus_addr,
            );
        }
        assert!(regs.submitted().is_empty());
        assert_eq!(controller.state.lock().pending.len(), 3);

        regs.set_full(false);
        controller.start_io();
        assert_eq!(regs.submitted(), expected);
        testing::assert_conservation(&controller);
    }

    #[test]
    fn stops_when_fifo_fills() {
        let (controller, regs) = testing::controller(8);
        testing::add_drive(&controller, 0, 1 << 20);
        regs.set_capacity(Some(2));

        for i in 0..5 {
            controller.submit_block(testing::request(0, XferDirection::Write, i * 8, 1, |_| {}));
        }
        assert_eq!(regs.submitted().len(), 2);
        {
            let state = controller.state.lock();
            assert_eq!(state.in_flight.len(), 2);
            assert_eq!(state.pending.len(), 3);
            assert_eq!(state.max_outstanding, 2);
        }
        testing::assert_conservation(&controller);
    }
}
