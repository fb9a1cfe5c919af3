//! Synchronous commands: caller-built passthrough CDBs, the probes the
//! topology rescan sends, and the error-recovery messages.
//!
//! These paths may sleep, so they use heap commands rather than the pool.

use color_eyre::{Result, eyre::bail};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::arena::{CommandHandle, CommandKind, Membership};
use super::classify::{Decision, RequestClass, classify, sense_error};
use super::{CommandOutcome, Controller};
use crate::ciss::command_list::{CommandStatus, ErrorInfo, LunAddress, SgEntry};
use crate::error::IoError;
use crate::hw::dma::DmaMapping;
use crate::scsi::Sense;
use crate::scsi::command::{CommandBlock, abort_message, reset_message};

/// A fully formed command from a privileged caller. Permission checks are
/// the caller's business.
#[derive(Debug, Clone)]
pub struct PassthroughRequest {
    pub lun: LunAddress,
    pub cdb: CommandBlock,
    /// Sent to the target for writes; sized to the expected transfer and
    /// filled in for reads.
    pub data: Vec<u8>,
    /// Firmware timeout in seconds, zero for none.
    pub timeout: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassthroughReply {
    pub result: Result<(), IoError>,
    /// Verbatim error info block, all zeroes when the firmware reported none.
    pub error_info: ErrorInfo,
    pub data: Vec<u8>,
}

/// Owns a heap command while its submitter waits on it.
///
/// Dropping the lease frees the command, unless it is still queued; the
/// completion path frees those once it finds the waiter gone. The data
/// mapping travels with the command, so a submitter that gives up early
/// never frees memory the firmware is about to write.
struct CommandLease<'a> {
    controller: &'a Controller,
    handle: CommandHandle,
}

impl CommandLease<'_> {
    /// Takes the data mapping back once the firmware has finished with it.
    fn take_mapping(&self) -> Option<DmaMapping> {
        let mut state = self.controller.state.lock();
        let desc = state.arena.get_mut(self.handle)?;
        if desc.membership != Membership::Allocated {
            return None;
        }
        desc.buffers.pop()
    }
}

impl Drop for CommandLease<'_> {
    fn drop(&mut self) {
        let mut state = self.controller.state.lock();
        let membership = state.arena.get(self.handle).map(|d| d.membership);
        if membership == Some(Membership::Allocated) {
            state.arena.release(self.handle);
        }
    }
}

fn map_data(
    controller: &Controller,
    data: &[u8],
    cdb: &CommandBlock,
) -> Result<Option<DmaMapping>, IoError> {
    if data.is_empty() {
        return Ok(None);
    }
    controller
        .dma
        .map(data, cdb.direction)
        .map(Some)
        .ok_or(IoError::OutOfMemory)
}

fn unmap_data(mapping: Option<DmaMapping>, data: &mut [u8]) -> Result<(), IoError> {
    if let Some(mapping) = mapping {
        mapping.unmap(data).map_err(|e| {
            warn!("unmapping passthrough buffer: {e}");
            IoError::Protocol
        })?;
    }
    Ok(())
}

impl Controller {
    /// Queues a heap command on the interrupt path and returns the handle
    /// its completion will arrive on.
    fn submit_waiting(
        &self,
        lun: LunAddress,
        cdb: CommandBlock,
        mapping: Option<DmaMapping>,
        timeout: u16,
    ) -> Result<(CommandLease<'_>, oneshot::Receiver<CommandOutcome>), IoError> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock();
        if state.failed {
            return Err(IoError::ControllerFailed);
        }
        let handle = state.arena.allocate_heap()?;
        if let Some(desc) = state.arena.get_mut(handle) {
            desc.lun = lun;
            desc.cdb = cdb;
            desc.timeout = timeout;
            desc.sg = mapping
                .as_ref()
                .map(|m| SgEntry {
                    addr: m.bus(),
                    len: m.len() as u32,
                })
                .into_iter()
                .collect();
            desc.buffers.extend(mapping);
            desc.kind = CommandKind::Waiting(tx);
        }
        if let Err(e) = self.enqueue(&mut state, handle) {
            warn!("{}: could not queue command: {e}", self.name);
            if let Some(desc) = state.arena.get_mut(handle) {
                desc.kind = CommandKind::Idle;
            }
            state.arena.release(handle);
            return Err(IoError::Protocol);
        }
        self.start_io_locked(&mut state);
        drop(state);
        Ok((
            CommandLease {
                controller: self,
                handle,
            },
            rx,
        ))
    }

    /// Sends one command and waits for the firmware's answer. The mapping
    /// comes back only once the firmware is done with it.
    async fn execute(
        &self,
        lun: LunAddress,
        cdb: CommandBlock,
        mapping: Option<DmaMapping>,
        timeout: u16,
    ) -> Result<(Option<ErrorInfo>, Option<DmaMapping>), IoError> {
        let (lease, done) = self.submit_waiting(lun, cdb, mapping, timeout)?;
        let error = done.await.map_err(|_| IoError::ControllerFailed)??;
        Ok((error, lease.take_mapping()))
    }

    /// Runs a caller-built command and hands back the raw error info along
    /// with the translated status. Nothing is retried.
    pub async fn passthrough(
        &self,
        request: PassthroughRequest,
    ) -> Result<PassthroughReply, IoError> {
        let PassthroughRequest {
            lun,
            cdb,
            mut data,
            timeout,
        } = request;
        let mapping = map_data(self, &data, &cdb)?;
        let (error, mapping) = self.execute(lun, cdb, mapping, timeout).await?;
        unmap_data(mapping, &mut data)?;

        let Some(info) = error else {
            return Ok(PassthroughReply {
                result: Ok(()),
                error_info: ErrorInfo::default(),
                data,
            });
        };
        let result = match classify(&info, RequestClass::Passthrough) {
            Decision::Success | Decision::Benign { .. } => Ok(()),
            Decision::Fatal(e) => Err(e),
            decision => {
                if decision == Decision::RetryAndRescan {
                    self.request_rescan();
                }
                Err(match info.command_status {
                    CommandStatus::TargetStatus => {
                        sense_error(Sense::from_fixed(info.sense_data()))
                    }
                    _ => IoError::Aborted,
                })
            }
        };
        Ok(PassthroughReply {
            result,
            error_info: info,
            data,
        })
    }

    /// Sends an internal probe, retrying transient failures, and returns
    /// the bytes actually transferred.
    pub(crate) async fn execute_internal(
        &self,
        lun: LunAddress,
        cdb: CommandBlock,
    ) -> Result<Vec<u8>, IoError> {
        let mut retries = 0;
        loop {
            let mut data = vec![0u8; cdb.data_transfer_len as usize];
            let mapping = map_data(self, &data, &cdb)?;
            let (error, mapping) = self.execute(lun, cdb, mapping, 0).await?;
            unmap_data(mapping, &mut data)?;
            let decision = match &error {
                None => Decision::Success,
                Some(info) => {
                    classify(info, RequestClass::Probe).bounded(retries, self.config.max_retries)
                }
            };
            match decision {
                Decision::Success => return Ok(data),
                Decision::Benign { residual } => {
                    data.truncate(data.len().saturating_sub(residual as usize));
                    return Ok(data);
                }
                Decision::RetryTransparent | Decision::RetryAndRescan => {
                    if decision == Decision::RetryAndRescan {
                        self.request_rescan();
                    }
                    retries += 1;
                    debug!(
                        "{}: retrying opcode {:#04x} on {lun:?}, attempt {retries}",
                        self.name,
                        cdb.opcode()
                    );
                }
                Decision::Fatal(e) => return Err(e),
            }
        }
    }

    /// Resets a logical unit through the poll path.
    pub fn reset_lun(&self, lun: LunAddress) -> Result<()> {
        let reply = self.send_polled(lun, reset_message())?;
        if let Some(info) = reply.error {
            bail!(
                "{}: reset of {lun:?} failed: {:?}",
                self.name,
                info.command_status
            );
        }
        info!("{}: reset {lun:?}", self.name);
        Ok(())
    }

    /// Asks the firmware to abort the command carrying `tag`.
    pub fn abort_tag(&self, tag: u64) -> Result<()> {
        let reply = self.send_polled(LunAddress::CONTROLLER, abort_message(tag))?;
        if let Some(info) = reply.error {
            bail!(
                "{}: abort of tag {tag:#x} failed: {:?}",
                self.name,
                info.command_status
            );
        }
        info!("{}: aborted tag {tag:#x}", self.name);
        Ok(())
    }
}
