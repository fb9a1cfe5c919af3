//! Matching completed tags back to commands, on the interrupt path and on
//! the poll path.

use std::sync::{Arc, Weak};
use std::time::Instant;

use color_eyre::{
    Result,
    eyre::{OptionExt, bail},
};
use tokio::sync::Notify;
use tracing::{debug, error, trace, warn};

use super::arena::{CommandHandle, CommandKind, Membership};
use super::{Controller, ControllerState, Deferred, run_deferred};
use crate::ciss::command_list::{CommandStatus, CompletionTag, ErrorInfo, LunAddress, SgEntry};
use crate::error::IoError;
use crate::scsi::command::CommandBlock;

/// Result of a command sent on the poll path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolledReply {
    /// The error info block, when the firmware flagged one.
    pub error: Option<ErrorInfo>,
    /// Whatever the firmware transferred into the data buffer.
    pub data: Vec<u8>,
}

impl Controller {
    /// Runs the interrupt path: drains the reply FIFO, completes every
    /// command found there, then refills the hardware from the pending and
    /// block queues.
    ///
    /// Returns false if the interrupt was not ours.
    pub fn handle_interrupt(&self) -> bool {
        let mut deferred = Vec::new();
        {
            let mut state = self.state.lock();
            if !state.interrupts_enabled || !self.access.intr_pending() {
                return false;
            }
            while let Some(raw) = self.access.command_completed() {
                if !self.complete_value(&mut state, raw, &mut deferred) {
                    break;
                }
            }
            if !state.failed {
                self.do_request(&mut state, &mut deferred);
                self.start_io_locked(&mut state);
            }
        }
        run_deferred(deferred);
        true
    }

    /// Completes the command a reply FIFO value refers to. Returns false
    /// when the value showed that the controller can no longer be trusted.
    fn complete_value(
        &self,
        state: &mut ControllerState,
        raw: u32,
        deferred: &mut Deferred,
    ) -> bool {
        let tag = CompletionTag::decode(raw);
        let handle = match tag {
            CompletionTag::Direct { slot, .. } => {
                if slot >= state.arena.slot_count() {
                    error!(
                        "{}: firmware completed tag {raw:#x} for slot {slot}, only {} exist",
                        self.name,
                        state.arena.slot_count()
                    );
                    self.fail_all(state, deferred);
                    return false;
                }
                CommandHandle::Pool(slot)
            }
            CompletionTag::BusAddress { addr, .. } => {
                let found = state.in_flight.iter().copied().find(|&h| {
                    state
                        .arena
                        .get(h)
                        .is_some_and(|desc| desc.bus_addr == addr)
                });
                match found {
                    Some(handle) => handle,
                    None => {
                        warn!("{}: completion {raw:#x} matches no command in flight", self.name);
                        return true;
                    }
                }
            }
        };
        let Some(position) = state.in_flight.iter().position(|&h| h == handle) else {
            warn!("{}: completion {raw:#x} for {handle:?}, which is not in flight", self.name);
            return true;
        };
        state.in_flight.remove(position);

        let info = if tag.error() {
            match state.arena.read_error_info(handle) {
                Ok(info) => Some(info),
                Err(e) => {
                    warn!("{}: unreadable error info for {handle:?}: {e}", self.name);
                    Some(ErrorInfo {
                        command_status: CommandStatus::ProtocolError,
                        ..Default::default()
                    })
                }
            }
        } else {
            None
        };
        trace!(
            "{}: completed {handle:?} status {:?}",
            self.name,
            info.map(|i| i.command_status)
        );
        self.dispatch(state, handle, info, deferred);
        true
    }

    fn dispatch(
        &self,
        state: &mut ControllerState,
        handle: CommandHandle,
        info: Option<ErrorInfo>,
        deferred: &mut Deferred,
    ) {
        let Some(desc) = state.arena.get_mut(handle) else {
            return;
        };
        desc.membership = Membership::Allocated;
        match std::mem::replace(&mut desc.kind, CommandKind::Idle) {
            CommandKind::Waiting(waiter) => {
                if waiter.send(Ok(info)).is_err() {
                    // the waiting task is gone, nobody else will free it
                    state.arena.release(handle);
                }
            }
            CommandKind::Polled => {
                state.polled.insert(handle, Ok(info));
            }
            CommandKind::Block(io) => self.complete_block(state, handle, *io, info, deferred),
            CommandKind::Idle => {
                warn!("{}: completion for idle command {handle:?}", self.name);
                state.arena.release(handle);
            }
        }
    }

    /// The controller has failed: nothing it holds will ever complete.
    pub(super) fn fail_all(&self, state: &mut ControllerState, deferred: &mut Deferred) {
        error!(
            "{}: failing {} in-flight and {} pending commands",
            self.name,
            state.in_flight.len(),
            state.pending.len()
        );
        self.abandon(state, deferred);
    }

    /// Stops all traffic and fails every outstanding request with
    /// [`IoError::ControllerFailed`]. Commands the firmware may still touch
    /// are marked stale instead of being freed.
    pub(super) fn abandon(&self, state: &mut ControllerState, deferred: &mut Deferred) {
        state.failed = true;
        self.access.set_intr_mask(false);
        state.interrupts_enabled = false;

        let in_flight: Vec<_> = state.in_flight.drain(..).collect();
        for handle in in_flight {
            self.cancel(state, handle, true, deferred);
        }
        let pending: Vec<_> = state.pending.drain(..).collect();
        for handle in pending {
            self.cancel(state, handle, false, deferred);
        }
        for request in state.block.waiting.drain(..) {
            deferred.push(request.fail(IoError::ControllerFailed));
        }
    }

    fn cancel(
        &self,
        state: &mut ControllerState,
        handle: CommandHandle,
        stale: bool,
        deferred: &mut Deferred,
    ) {
        let Some(desc) = state.arena.get_mut(handle) else {
            return;
        };
        let kind = std::mem::replace(&mut desc.kind, CommandKind::Idle);
        desc.membership = Membership::Allocated;
        if stale {
            state.arena.mark_stale(handle);
        }
        let mut release = !stale;
        match kind {
            CommandKind::Waiting(waiter) => {
                // a live waiter frees the command through its lease
                release &= waiter.send(Err(IoError::ControllerFailed)).is_err();
            }
            CommandKind::Polled => {
                state.polled.insert(handle, Err(IoError::ControllerFailed));
                release = false;
            }
            CommandKind::Block(io) => {
                let (mappings, callback) = io.abandon(IoError::ControllerFailed);
                if let Some(desc) = state.arena.get_mut(handle) {
                    desc.buffers.extend(mappings);
                }
                deferred.push(callback);
            }
            CommandKind::Idle => {}
        }
        if release {
            state.arena.release(handle);
        }
    }

    /// Sends one command with interrupts masked and busy-waits for its
    /// completion. Other completions popped meanwhile are handled normally.
    /// Concurrent callers take turns; only one polled command is ever
    /// outstanding.
    ///
    /// A command that does not complete within the poll timeout fails the
    /// whole controller.
    pub fn send_polled(&self, lun: LunAddress, cdb: CommandBlock) -> Result<PolledReply> {
        let _turn = self.poll.lock();
        let mapping = match cdb.data_transfer_len {
            0 => None,
            len => Some(
                self.dma
                    .map(&vec![0; len as usize], cdb.direction)
                    .ok_or_eyre("no DMA memory for a polled command")?,
            ),
        };
        let (handle, restore) = {
            let mut state = self.state.lock();
            if state.failed {
                bail!("{} has failed", self.name);
            }
            let handle = state.arena.allocate_heap()?;
            if let Some(desc) = state.arena.get_mut(handle) {
                desc.lun = lun;
                desc.cdb = cdb;
                desc.kind = CommandKind::Polled;
                desc.sg = mapping
                    .iter()
                    .map(|m| SgEntry {
                        addr: m.bus(),
                        len: m.len() as u32,
                    })
                    .collect();
                desc.buffers.extend(mapping);
            }
            if let Err(e) = state.arena.write_command(handle) {
                state.arena.release(handle);
                return Err(e);
            }
            let restore = state.interrupts_enabled;
            self.access.set_intr_mask(false);
            state.interrupts_enabled = false;
            (handle, restore)
        };

        let outcome = self.poll_for(handle);

        let mapping = {
            let mut state = self.state.lock();
            if restore && !state.failed {
                self.access.set_intr_mask(true);
                state.interrupts_enabled = true;
            }
            state.polled.remove(&handle);
            // a stale command keeps its buffer, the firmware may still write it
            let mapping = state
                .arena
                .get_mut(handle)
                .filter(|desc| desc.membership == Membership::Allocated)
                .and_then(|desc| desc.buffers.pop());
            state.arena.release(handle);
            mapping
        };
        let error = outcome?;
        let data = match &mapping {
            Some(mapping) => mapping.contents()?,
            None => Vec::new(),
        };
        Ok(PolledReply { error, data })
    }

    fn poll_for(&self, handle: CommandHandle) -> Result<Option<ErrorInfo>> {
        let deadline = Instant::now() + self.config.poll_timeout;
        let mut submitted = false;
        loop {
            let mut deferred = Vec::new();
            let done = {
                let mut state = self.state.lock();
                if !submitted && state.failed {
                    bail!("{} failed before the polled command was sent", self.name);
                }
                if !submitted && !self.access.fifo_full() {
                    if let Some(desc) = state.arena.get_mut(handle) {
                        desc.membership = Membership::InFlight;
                        let bus_addr = desc.bus_addr;
                        state.in_flight.push_back(handle);
                        self.access.submit_command(bus_addr);
                        submitted = true;
                    }
                }
                while let Some(raw) = self.access.command_completed() {
                    if !self.complete_value(&mut state, raw, &mut deferred) {
                        break;
                    }
                }
                if !state.failed {
                    self.do_request(&mut state, &mut deferred);
                    self.start_io_locked(&mut state);
                }
                state.polled.remove(&handle)
            };
            run_deferred(deferred);
            if let Some(outcome) = done {
                return Ok(outcome?);
            }
            if Instant::now() >= deadline {
                let mut deferred = Vec::new();
                {
                    let mut state = self.state.lock();
                    error!(
                        "{}: polled command {handle:?} got no reply in {:?}",
                        self.name, self.config.poll_timeout
                    );
                    self.fail_all(&mut state, &mut deferred);
                }
                run_deferred(deferred);
                bail!(
                    "{}: polled command timed out after {:?}",
                    self.name,
                    self.config.poll_timeout
                );
            }
            std::thread::sleep(self.config.poll_interval);
        }
    }
}

/// Services the board's interrupt line until the controller goes away.
pub async fn service_interrupts(controller: Weak<Controller>, irq: Arc<Notify>) {
    loop {
        irq.notified().await;
        let Some(controller) = controller.upgrade() else {
            break;
        };
        if !controller.handle_interrupt() {
            trace!("{}: interrupt not for us", controller.name);
        }
    }
    debug!("interrupt service task exiting");
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use super::super::testing;
    use super::*;
    use crate::ciss::command_list::{XferDirection, direct_tag};
    use crate::config::ControllerConfig;
    use crate::hw::sim::Fault;
    use crate::scsi::command::{inquiry, noop_message, test_unit_ready};
    use crate::scsi::response::INQUIRY_LEN;

    #[test]
    fn out_of_range_direct_tag_fails_the_controller() {
        let (controller, regs) = testing::controller(4);
        testing::add_drive(&controller, 0, 1 << 20);
        let (tx, rx) = mpsc::channel();
        controller.submit_block(testing::request(0, XferDirection::Read, 0, 1, move |c| {
            tx.send(c.result).unwrap()
        }));

        regs.post(direct_tag(99));
        regs.post(direct_tag(0));
        assert!(controller.handle_interrupt());

        assert_eq!(rx.try_recv().unwrap(), Err(IoError::ControllerFailed));
        assert!(controller.is_failed());
        // processing stopped at the bad tag
        assert_eq!(regs.replies_left(), 1);
        let state = controller.state.lock();
        let desc = state.arena.get(CommandHandle::Pool(0)).unwrap();
        assert_eq!(desc.membership, Membership::Stale);
        // the read buffer stays mapped while the firmware may still fill it
        assert_eq!(desc.buffers.len(), 1);
    }

    #[test]
    fn unknown_bus_address_is_ignored() {
        let (controller, regs) = testing::controller(4);
        regs.post(0x7000_0040);
        assert!(controller.handle_interrupt());
        assert!(!controller.is_failed());
    }

    #[test]
    fn masked_interrupts_are_not_ours() {
        let (controller, regs) = testing::controller(4);
        controller.set_interrupts(false);
        regs.post(direct_tag(0));
        assert!(!controller.handle_interrupt());
        assert_eq!(regs.replies_left(), 1);
    }

    #[test]
    fn polled_command_against_the_board() {
        let rig = testing::sim_controller(ControllerConfig::default());
        let reply = rig
            .controller
            .send_polled(LunAddress::CONTROLLER, test_unit_ready())
            .unwrap();
        assert_eq!(reply.error, None);

        rig.board.inject(Fault::status(CommandStatus::HardwareError));
        let reply = rig
            .controller
            .send_polled(LunAddress::CONTROLLER, test_unit_ready())
            .unwrap();
        assert_eq!(
            reply.error.map(|e| e.command_status),
            Some(CommandStatus::HardwareError)
        );
        // interrupts are back on and no command leaked
        assert!(rig.controller.state.lock().interrupts_enabled);
        assert_eq!(rig.controller.state.lock().arena.in_use(), 0);
    }

    #[test]
    fn concurrent_pollers_take_turns() {
        let rig = testing::sim_controller(ControllerConfig::default());
        let controller = &rig.controller;
        let before = rig.board.counters().noops;
        std::thread::scope(|s| {
            for _ in 0..2 {
                s.spawn(|| {
                    for _ in 0..20 {
                        let reply = controller
                            .send_polled(LunAddress::CONTROLLER, noop_message())
                            .unwrap();
                        assert_eq!(reply.error, None);
                    }
                });
            }
        });
        assert_eq!(rig.board.counters().noops, before + 40);
        assert!(controller.state.lock().interrupts_enabled);
        assert_eq!(controller.state.lock().arena.in_use(), 0);
    }

    #[test]
    fn polled_timeout_fails_the_controller() {
        let rig = testing::sim_controller(ControllerConfig {
            poll_timeout: Duration::from_millis(20),
            ..Default::default()
        });
        rig.board.hold_completions(true);
        let e = rig
            .controller
            .send_polled(LunAddress::CONTROLLER, inquiry(INQUIRY_LEN))
            .expect_err("no reply");
        assert!(e.to_string().contains("timed out"));
        assert!(rig.controller.is_failed());

        // a late reply lands in the stale command's buffer, not in new memory
        let other = rig
            .controller
            .dma
            .alloc_coherent(INQUIRY_LEN as usize)
            .unwrap();
        other.write_at(0, &vec![0xaa; INQUIRY_LEN as usize]).unwrap();
        assert_eq!(rig.board.process(), 1);
        assert_eq!(other.to_vec().unwrap(), vec![0xaa; INQUIRY_LEN as usize]);
        assert!(
            rig.controller
                .send_polled(LunAddress::CONTROLLER, test_unit_ready())
                .is_err()
        );
    }
}
