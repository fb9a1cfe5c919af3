//! The command engine of one controller.
//!
//! Every piece of mutable controller state (the command arena, the pending
//! and in-flight queues, the block request queue and the logical drive
//! table) lives in one [`ControllerState`] behind a single lock. The lock is
//! only held for short sections that never sleep: submission, completion and
//! enqueueing. Callbacks to the block layer and wakeups of waiting tasks are
//! collected while it is held and run after it is dropped.

pub mod arena;
pub mod block;
pub mod classify;
mod completion;
pub mod passthrough;
mod submit;
pub mod topology;

#[cfg(test)]
mod testing;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use color_eyre::{Result, eyre::ensure};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::ciss::command_list::{ErrorInfo, LunAddress};
use crate::config::ControllerConfig;
use crate::error::{IoError, StatusError};
use crate::hw::RegisterInterface;
use crate::hw::dma::DmaMemory;
use crate::rescan::{RescanLink, RescanSender, RescanState};
use crate::scsi::command::{bmic_cache_flush, inquiry, noop_message};
use crate::scsi::response::{INQUIRY_LEN, inquiry_response};

use arena::{CommandArena, CommandHandle};
use block::BlockQueue;
use classify::{Decision, RequestClass, classify};
use topology::{DriveTable, LogicalDrive};

pub use completion::{PolledReply, service_interrupts};

/// What a waiting task receives: the error info block when the firmware
/// flagged one, or why the command never completed.
pub type CommandOutcome = Result<Option<ErrorInfo>, IoError>;
pub type Waiter = oneshot::Sender<CommandOutcome>;

/// Work to run once the controller lock is released.
type Deferred = Vec<Box<dyn FnOnce() + Send>>;

fn run_deferred(deferred: Deferred) {
    for f in deferred {
        f();
    }
}

struct ControllerState {
    arena: CommandArena,
    pending: VecDeque<CommandHandle>,
    in_flight: VecDeque<CommandHandle>,
    block: BlockQueue,
    drives: DriveTable,
    /// Completions picked up for the poll path.
    polled: HashMap<CommandHandle, CommandOutcome>,
    max_outstanding: u32,
    max_sg_seen: usize,
    interrupts_enabled: bool,
    /// Set once the controller can no longer be trusted with commands.
    failed: bool,
    busy_configuring: bool,
    firmware_version: String,
}

/// Read-only snapshot for reporting.
#[derive(Debug, Clone)]
pub struct ControllerStatus {
    pub name: String,
    pub firmware_version: String,
    pub queue_depth: usize,
    pub outstanding: u32,
    pub max_outstanding: u32,
    pub max_sg_seen: usize,
    pub highest_lun: Option<usize>,
    /// Configured logical drives by table index.
    pub drives: Vec<(usize, LogicalDrive)>,
}

pub struct Controller {
    name: String,
    config: ControllerConfig,
    access: Arc<dyn RegisterInterface>,
    dma: Arc<DmaMemory>,
    state: Mutex<ControllerState>,
    /// Held across a whole poll-path exchange; taken before `state`.
    poll: Mutex<()>,
    rescan: RescanLink,
    removing: AtomicBool,
    rescan_tx: OnceLock<RescanSender>,
    me: Weak<Controller>,
}

impl Controller {
    pub fn new(
        name: impl Into<String>,
        config: ControllerConfig,
        access: Arc<dyn RegisterInterface>,
        dma: Arc<DmaMemory>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let arena = CommandArena::new(Arc::clone(&dma), config.nr_cmds)?;
        let drives = DriveTable::new(config.max_luns);
        Ok(Arc::new_cyclic(|me| Self {
            name: name.into(),
            config,
            access,
            dma,
            state: Mutex::new(ControllerState {
                arena,
                pending: VecDeque::new(),
                in_flight: VecDeque::new(),
                block: BlockQueue::default(),
                drives,
                polled: HashMap::new(),
                max_outstanding: 0,
                max_sg_seen: 0,
                interrupts_enabled: false,
                failed: false,
                busy_configuring: false,
                firmware_version: String::new(),
            }),
            poll: Mutex::new(()),
            rescan: RescanLink::default(),
            removing: AtomicBool::new(false),
            rescan_tx: OnceLock::new(),
            me: me.clone(),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Brings the firmware up with interrupts masked: a NO-OP to prove it
    /// answers, then a controller INQUIRY for the firmware revision.
    ///
    /// Uses the poll path and may block for up to the poll timeout.
    #[tracing::instrument(skip(self), fields(controller = %self.name))]
    pub fn init(&self) -> Result<()> {
        self.set_interrupts(false);

        let reply = self.send_polled(LunAddress::CONTROLLER, noop_message())?;
        ensure!(
            reply.error.is_none(),
            "{}: firmware rejected NO-OP: {:?}",
            self.name,
            reply.error.map(|e| e.command_status)
        );

        let reply = self.send_polled(LunAddress::CONTROLLER, inquiry(INQUIRY_LEN))?;
        if let Some(error) = &reply.error {
            let decision = classify(error, RequestClass::Probe);
            ensure!(
                matches!(decision, Decision::Success | Decision::Benign { .. }),
                "{}: controller INQUIRY failed: {decision:?}",
                self.name
            );
        }
        let version = inquiry_response(&reply.data)?.revision();
        info!(firmware = %version, "controller ready");
        self.state.lock().firmware_version = version;

        self.set_interrupts(true);
        Ok(())
    }

    fn set_interrupts(&self, enabled: bool) {
        let mut state = self.state.lock();
        self.access.set_intr_mask(enabled);
        state.interrupts_enabled = enabled;
    }

    pub fn status(&self) -> Result<ControllerStatus, StatusError> {
        let state = self.state.lock();
        if state.busy_configuring {
            return Err(StatusError::Busy);
        }
        Ok(ControllerStatus {
            name: self.name.clone(),
            firmware_version: state.firmware_version.clone(),
            queue_depth: self.config.nr_cmds,
            outstanding: self.access.commands_outstanding(),
            max_outstanding: state.max_outstanding,
            max_sg_seen: state.max_sg_seen,
            highest_lun: state.drives.highest_lun(),
            drives: state.drives.configured(),
        })
    }

    pub fn is_failed(&self) -> bool {
        self.state.lock().failed
    }

    /// Hands the rescan coordinator's queue to this controller. Only the
    /// first call has any effect.
    pub fn set_rescan_sender(&self, sender: RescanSender) {
        if self.rescan_tx.set(sender).is_err() {
            debug!("{}: rescan sender already set", self.name);
        }
    }

    pub fn rescan_state(&self) -> RescanState {
        self.rescan.state()
    }

    /// Completed topology rescans.
    pub fn rescans(&self) -> u64 {
        self.rescan.scans()
    }

    /// Queues this controller for a topology rescan.
    ///
    /// Returns false when the controller is being removed, or when it is
    /// already queued or being scanned.
    pub fn request_rescan(&self) -> bool {
        if self.removing.load(Ordering::Acquire) {
            debug!("{}: rescan rejected, controller is going away", self.name);
            return false;
        }
        let Some(tx) = self.rescan_tx.get() else {
            warn!("{}: no rescan coordinator attached", self.name);
            return false;
        };
        if !self.rescan.try_queue() {
            return false;
        }
        if !tx.send(self.me.clone()) {
            warn!("{}: rescan worker has exited", self.name);
            self.rescan.cancel();
            return false;
        }
        debug!("{}: queued for rescan", self.name);
        true
    }

    /// Requests a rescan and waits until the controller is idle again.
    /// Returns false if the request was rejected.
    pub async fn rescan_and_wait(&self) -> bool {
        if !self.request_rescan() && self.rescan.state() == RescanState::Idle {
            return false;
        }
        self.rescan.wait_idle().await;
        true
    }

    /// Takes the controller off the rescan queue. If the worker is scanning
    /// it right now, waits for that pass to finish.
    pub async fn remove_from_rescan_queue(&self) {
        self.rescan.remove().await;
    }

    /// Runs the rescan this controller was queued for, unless it was taken
    /// off the queue in the meantime.
    pub(crate) async fn run_queued_rescan(&self) {
        if !self.rescan.begin() {
            return;
        }
        if let Err(e) = self.rescan_topology().await {
            warn!("{}: rescan failed: {e:#}", self.name);
        }
        self.rescan.finish();
    }

    fn flush_cache(&self) -> Result<()> {
        let reply = self.send_polled(LunAddress::CONTROLLER, bmic_cache_flush())?;
        ensure!(
            reply.error.is_none(),
            "cache flush failed: {:?}",
            reply.error.map(|e| e.command_status)
        );
        Ok(())
    }

    /// Detaches from the board: leaves the rescan queue, flushes the write
    /// cache, masks interrupts and abandons whatever is still queued.
    ///
    /// Commands still held by the firmware are marked stale and their
    /// owners see [`IoError::ControllerFailed`].
    #[tracing::instrument(skip(self), fields(controller = %self.name))]
    pub async fn shutdown(self: &Arc<Self>) {
        if self.removing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.remove_from_rescan_queue().await;

        if !self.is_failed() {
            let controller = Arc::clone(self);
            match tokio::task::spawn_blocking(move || controller.flush_cache()).await {
                Ok(Ok(())) => debug!("write cache flushed"),
                Ok(Err(e)) => warn!("{e:#}"),
                Err(e) => warn!("cache flush task failed: {e}"),
            }
        }

        let mut deferred = Vec::new();
        {
            let mut state = self.state.lock();
            self.abandon(&mut state, &mut deferred);
            state.drives.clear();
        }
        run_deferred(deferred);
        info!("controller detached");
    }
}
