//! The rescan coordinator: one worker task, shared by every controller,
//! that runs topology rescans one at a time in the order they were asked
//! for.
//!
//! Each controller carries a [`RescanLink`] recording whether it is idle,
//! queued or being scanned. Queueing is a compare-and-swap on that state
//! followed by a send on the worker's channel, so a controller is never
//! queued twice.

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::engine::Controller;

const IDLE: u8 = 0;
const QUEUED: u8 = 1;
const SCANNING: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RescanState {
    Idle,
    Queued,
    Scanning,
}

/// Per-controller rescan bookkeeping.
#[derive(Debug, Default)]
pub struct RescanLink {
    state: AtomicU8,
    /// Signalled whenever the controller goes back to idle.
    finished: Notify,
    scans: AtomicU64,
}

impl RescanLink {
    pub fn state(&self) -> RescanState {
        match self.state.load(Ordering::Acquire) {
            QUEUED => RescanState::Queued,
            SCANNING => RescanState::Scanning,
            _ => RescanState::Idle,
        }
    }

    pub fn scans(&self) -> u64 {
        self.scans.load(Ordering::Acquire)
    }

    pub(crate) fn try_queue(&self) -> bool {
        self.transition(IDLE, QUEUED)
    }

    /// Called by the worker when it pops the controller. False means the
    /// controller was taken off the queue after it was sent.
    pub(crate) fn begin(&self) -> bool {
        self.transition(QUEUED, SCANNING)
    }

    pub(crate) fn finish(&self) {
        self.scans.fetch_add(1, Ordering::AcqRel);
        self.state.store(IDLE, Ordering::Release);
        self.finished.notify_waiters();
    }

    /// Backs out of a queue attempt whose send failed.
    pub(crate) fn cancel(&self) {
        if self.transition(QUEUED, IDLE) {
            self.finished.notify_waiters();
        }
    }

    pub(crate) async fn remove(&self) {
        loop {
            let mut finished = std::pin::pin!(self.finished.notified());
            finished.as_mut().enable();
            if self.transition(QUEUED, IDLE) {
                self.finished.notify_waiters();
                return;
            }
            if self.state() != RescanState::Scanning {
                return;
            }
            finished.await;
        }
    }

    pub(crate) async fn wait_idle(&self) {
        loop {
            let mut finished = std::pin::pin!(self.finished.notified());
            finished.as_mut().enable();
            if self.state() == RescanState::Idle {
                return;
            }
            finished.await;
        }
    }

    fn transition(&self, from: u8, to: u8) -> bool {
        self.state
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// The sending half of the worker's queue.
#[derive(Debug, Clone)]
pub struct RescanSender(mpsc::UnboundedSender<Weak<Controller>>);

impl RescanSender {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Weak<Controller>>) -> Self {
        Self(tx)
    }

    pub(crate) fn send(&self, controller: Weak<Controller>) -> bool {
        self.0.send(controller).is_ok()
    }
}

pub struct RescanCoordinator {
    tx: RescanSender,
    stop: Arc<Notify>,
    worker: JoinHandle<()>,
}

impl RescanCoordinator {
    /// Spawns the worker on the current runtime.
    pub fn start() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let stop = Arc::new(Notify::new());
        let worker = tokio::spawn(run_worker(rx, Arc::clone(&stop)));
        Self {
            tx: RescanSender::new(tx),
            stop,
            worker,
        }
    }

    pub fn sender(&self) -> RescanSender {
        self.tx.clone()
    }

    /// Stops the worker once any rescan in progress has finished.
    pub async fn shutdown(self) {
        self.stop.notify_one();
        if let Err(e) = self.worker.await {
            debug!("rescan worker ended abnormally: {e}");
        }
    }
}

async fn run_worker(mut queue: mpsc::UnboundedReceiver<Weak<Controller>>, stop: Arc<Notify>) {
    info!("rescan worker started");
    loop {
        let next = tokio::select! {
            _ = stop.notified() => break,
            next = queue.recv() => next,
        };
        let Some(controller) = next else {
            break;
        };
        // the controller may have been dropped while queued
        let Some(controller) = controller.upgrade() else {
            continue;
        };
        controller.run_queued_rescan().await;
    }
    info!("rescan worker stopped");
}
