//! The block layer's view of the controller: sector reads and writes that
//! come back through a completion callback.

use std::collections::VecDeque;

use tracing::{debug, error, warn};

use super::arena::{CommandHandle, CommandKind};
use super::classify::{Decision, RequestClass, classify};
use super::{Controller, ControllerState, Deferred, run_deferred};
use crate::ciss::command_list::{ErrorInfo, LunAddress, SgEntry, XferDirection};
use crate::error::{Exhausted, IoError};
use crate::hw::dma::DmaMapping;
use crate::scsi::command::read_write;

/// A read or write of whole sectors on one logical drive.
pub struct BlockRequest {
    /// Index into the logical drive table.
    pub drive: usize,
    pub direction: XferDirection,
    pub sector: u64,
    /// One scatter-gather element per segment. Reads are filled in place.
    pub segments: Vec<Vec<u8>>,
    pub done: Box<dyn FnOnce(BlockCompletion) + Send>,
}

impl BlockRequest {
    pub fn bytes(&self) -> usize {
        self.segments.iter().map(Vec::len).sum()
    }

    pub(super) fn fail(self, error: IoError) -> Box<dyn FnOnce() + Send> {
        let residual = self.bytes() as u32;
        let BlockRequest { segments, done, .. } = self;
        Box::new(move || {
            done(BlockCompletion {
                result: Err(error),
                residual,
                segments,
            })
        })
    }
}

#[derive(Debug)]
pub struct BlockCompletion {
    pub result: Result<(), IoError>,
    /// Bytes not transferred.
    pub residual: u32,
    /// The request's buffers, handed back.
    pub segments: Vec<Vec<u8>>,
}

/// A block request while the controller owns it.
pub struct BlockIo {
    request: BlockRequest,
    mappings: Vec<DmaMapping>,
}

impl BlockIo {
    /// Tears down the DMA mappings and packages the callback.
    fn finish(self, result: Result<(), IoError>, residual: u32) -> Box<dyn FnOnce() + Send> {
        let BlockIo {
            mut request,
            mappings,
        } = self;
        for (mapping, segment) in mappings.into_iter().zip(request.segments.iter_mut()) {
            if let Err(e) = mapping.unmap(segment) {
                warn!("unmapping block segment: {e}");
            }
        }
        let BlockRequest { segments, done, .. } = request;
        Box::new(move || {
            done(BlockCompletion {
                result,
                residual,
                segments,
            })
        })
    }

    pub(super) fn fail(self, error: IoError) -> Box<dyn FnOnce() + Send> {
        self.request.fail(error)
    }

    /// Fails the request without unmapping: the returned mappings must stay
    /// alive for as long as the firmware may still write through them.
    pub(super) fn abandon(self, error: IoError) -> (Vec<DmaMapping>, Box<dyn FnOnce() + Send>) {
        (self.mappings, self.request.fail(error))
    }
}

/// Requests waiting for a pool command.
#[derive(Default)]
pub(super) struct BlockQueue {
    pub(super) waiting: VecDeque<BlockRequest>,
    /// Set when the arena ran dry; cleared whenever a block command is
    /// released.
    pub(super) stopped: bool,
}

impl Controller {
    /// Queues a block request. Its callback runs exactly once, possibly
    /// before this returns.
    pub fn submit_block(&self, request: BlockRequest) {
        let mut deferred = Vec::new();
        {
            let mut state = self.state.lock();
            if state.failed {
                deferred.push(request.fail(IoError::ControllerFailed));
            } else {
                state.block.waiting.push_back(request);
                self.do_request(&mut state, &mut deferred);
                self.start_io_locked(&mut state);
            }
        }
        run_deferred(deferred);
    }

    /// Whether the block queue is waiting for a command slot.
    pub fn block_queue_stopped(&self) -> bool {
        self.state.lock().block.stopped
    }

    /// Turns waiting block requests into pending commands until the queue
    /// empties or the arena runs out.
    pub(super) fn do_request(&self, state: &mut ControllerState, deferred: &mut Deferred) {
        while !state.block.stopped {
            let Some(request) = state.block.waiting.pop_front() else {
                break;
            };
            let (lun, block_size) = match self.check_request(state, &request) {
                Ok(target) => target,
                Err(e) => {
                    debug!("{}: rejecting block request: {e}", self.name);
                    deferred.push(request.fail(e));
                    continue;
                }
            };
            let handle = match state.arena.allocate_pooled() {
                Ok(handle) => handle,
                Err(Exhausted) => {
                    debug!("{}: command pool exhausted, stopping block queue", self.name);
                    state.block.waiting.push_front(request);
                    state.block.stopped = true;
                    break;
                }
            };

            let mappings: Option<Vec<_>> = request
                .segments
                .iter()
                .map(|segment| self.dma.map(segment, request.direction))
                .collect();
            let Some(mappings) = mappings else {
                state.arena.release(handle);
                deferred.push(request.fail(IoError::OutOfMemory));
                continue;
            };
            let sg: Vec<_> = mappings
                .iter()
                .map(|m| SgEntry {
                    addr: m.bus(),
                    len: m.len() as u32,
                })
                .collect();
            let blocks = (request.bytes() / block_size as usize) as u32;
            state.max_sg_seen = state.max_sg_seen.max(sg.len());

            let Some(desc) = state.arena.get_mut(handle) else {
                deferred.push(request.fail(IoError::OutOfMemory));
                continue;
            };
            desc.lun = lun;
            desc.cdb = read_write(request.direction, request.sector, blocks, block_size);
            desc.sg = sg;
            desc.kind = CommandKind::Block(Box::new(BlockIo { request, mappings }));
            if let Err(e) = self.enqueue(state, handle) {
                warn!("{}: could not queue block command: {e}", self.name);
                self.drop_block_command(state, handle, IoError::Protocol, deferred);
            }
        }
    }

    fn check_request(
        &self,
        state: &ControllerState,
        request: &BlockRequest,
    ) -> Result<(LunAddress, u32), IoError> {
        if request.direction == XferDirection::None
            || request.segments.is_empty()
            || request.segments.len() > self.config.max_sg
        {
            return Err(IoError::Invalid);
        }
        let drive = state
            .drives
            .get(request.drive)
            .filter(|d| d.heads != 0)
            .ok_or(IoError::ConnectionLost)?;
        let lun = drive.lun_id.ok_or(IoError::ConnectionLost)?;
        let block_size = drive.block_size;
        if block_size == 0
            || request
                .segments
                .iter()
                .any(|s| s.is_empty() || s.len() % block_size as usize != 0)
        {
            return Err(IoError::Invalid);
        }
        let blocks = (request.bytes() / block_size as usize) as u64;
        if request.sector.saturating_add(blocks) > drive.nr_blocks || blocks > u32::MAX as u64 {
            return Err(IoError::Invalid);
        }
        Ok((lun, block_size))
    }

    /// Classifies a finished block command and either completes it or puts
    /// it back on the pending queue.
    pub(super) fn complete_block(
        &self,
        state: &mut ControllerState,
        handle: CommandHandle,
        io: BlockIo,
        info: Option<ErrorInfo>,
        deferred: &mut Deferred,
    ) {
        let retry_count = state.arena.get(handle).map_or(0, |d| d.retry_count);
        let decision = match &info {
            None => Decision::Success,
            Some(info) => classify(info, RequestClass::Filesystem)
                .bounded(retry_count, self.config.max_retries),
        };
        let (result, residual) = match decision {
            Decision::Success => (Ok(()), 0),
            Decision::Benign { residual } => {
                warn!(
                    "{}: block request on drive {} transferred short by {residual} bytes",
                    self.name, io.request.drive
                );
                (Ok(()), residual)
            }
            Decision::RetryTransparent | Decision::RetryAndRescan => {
                if decision == Decision::RetryAndRescan {
                    self.request_rescan();
                }
                self.retry_block(state, handle, io, deferred);
                return;
            }
            Decision::Fatal(e) => {
                if e == IoError::LunFailed {
                    error!(
                        "{}: logical drive {} has failed, administrative action required",
                        self.name, io.request.drive
                    );
                } else {
                    warn!("{}: block request on drive {} failed: {e}", self.name, io.request.drive);
                }
                let residual = info.map_or(0, |i| i.residual);
                (Err(e), residual)
            }
        };
        deferred.push(io.finish(result, residual));
        state.arena.release(handle);
        state.block.stopped = false;
    }

    fn retry_block(
        &self,
        state: &mut ControllerState,
        handle: CommandHandle,
        io: BlockIo,
        deferred: &mut Deferred,
    ) {
        let Some(desc) = state.arena.get_mut(handle) else {
            deferred.push(io.fail(IoError::Protocol));
            return;
        };
        desc.retry_count += 1;
        debug!("{}: retrying {handle:?}, attempt {}", self.name, desc.retry_count);
        desc.kind = CommandKind::Block(Box::new(io));
        if let Err(e) = self.enqueue(state, handle) {
            warn!("{}: could not requeue block command: {e}", self.name);
            self.drop_block_command(state, handle, IoError::Protocol, deferred);
        }
    }

    fn drop_block_command(
        &self,
        state: &mut ControllerState,
        handle: CommandHandle,
        error: IoError,
        deferred: &mut Deferred,
    ) {
        if let Some(desc) = state.arena.get_mut(handle) {
            if let CommandKind::Block(io) = std::mem::replace(&mut desc.kind, CommandKind::Idle) {
                deferred.push(io.fail(error));
            }
        }
        state.arena.release(handle);
        state.block.stopped = false;
    }
}
