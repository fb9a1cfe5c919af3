//! The set of attached controllers.
//!
//! A fixed number of slots, each either empty, reserved by an attach in
//! progress, or holding a live controller together with the task servicing
//! its interrupt line. All controllers share one rescan worker.

use std::sync::Arc;

use color_eyre::{
    Result,
    eyre::{OptionExt, WrapErr, bail},
};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::ControllerConfig;
use crate::engine::{Controller, service_interrupts};
use crate::hw::dma::DmaMemory;
use crate::hw::{Mmio, access_for};
use crate::rescan::RescanCoordinator;

pub const MAX_CONTROLLERS: usize = 32;

enum Slot {
    Empty,
    Reserved,
    Attached {
        controller: Arc<Controller>,
        irq_task: JoinHandle<()>,
    },
}

pub struct ControllerRegistry {
    slots: Mutex<Vec<Slot>>,
    rescan: RescanCoordinator,
}

impl ControllerRegistry {
    /// Creates an empty registry and starts the rescan worker on the
    /// current runtime.
    pub fn new() -> Self {
        Self {
            slots: Mutex::new((0..MAX_CONTROLLERS).map(|_| Slot::Empty).collect()),
            rescan: RescanCoordinator::start(),
        }
    }

    fn reserve(&self) -> Option<usize> {
        let mut slots = self.slots.lock();
        let index = slots.iter().position(|s| matches!(s, Slot::Empty))?;
        slots[index] = Slot::Reserved;
        Some(index)
    }

    /// Brings up the board behind `mmio`: initializes the firmware, starts
    /// servicing `irq` and runs the first topology rescan.
    ///
    /// The controller is named `cciss<slot>`.
    pub async fn attach(
        &self,
        mmio: Arc<dyn Mmio>,
        irq: Arc<Notify>,
        dma: Arc<DmaMemory>,
        config: ControllerConfig,
    ) -> Result<Arc<Controller>> {
        config.validate()?;
        let index = self
            .reserve()
            .ok_or_eyre("every controller slot is in use")?;
        match self.bring_up(index, mmio, irq, dma, config).await {
            Ok((controller, irq_task)) => {
                self.slots.lock()[index] = Slot::Attached {
                    controller: Arc::clone(&controller),
                    irq_task,
                };
                Ok(controller)
            }
            Err(e) => {
                self.slots.lock()[index] = Slot::Empty;
                Err(e)
            }
        }
    }

    async fn bring_up(
        &self,
        index: usize,
        mmio: Arc<dyn Mmio>,
        irq: Arc<Notify>,
        dma: Arc<DmaMemory>,
        config: ControllerConfig,
    ) -> Result<(Arc<Controller>, JoinHandle<()>)> {
        let access = access_for(config.generation, mmio, config.nr_cmds as u32);
        let controller = Controller::new(format!("cciss{index}"), config, access, dma)?;
        controller.set_rescan_sender(self.rescan.sender());

        let init = Arc::clone(&controller);
        tokio::task::spawn_blocking(move || init.init())
            .await
            .wrap_err("controller init task panicked")?
            .wrap_err_with(|| format!("cciss{index}: initialization failed"))?;

        let irq_task = tokio::spawn(service_interrupts(Arc::downgrade(&controller), irq));
        if !controller.rescan_and_wait().await {
            warn!("{}: initial rescan was not queued", controller.name());
        }
        info!(
            controller = controller.name(),
            drives = controller.highest_lun().map_or(0, |h| h + 1),
            "controller attached"
        );
        Ok((controller, irq_task))
    }

    /// Shuts down and forgets the controller in slot `index`.
    pub async fn detach(&self, index: usize) -> Result<()> {
        let (controller, irq_task) = {
            let mut slots = self.slots.lock();
            let slot = slots
                .get_mut(index)
                .ok_or_eyre("controller index out of range")?;
            match std::mem::replace(slot, Slot::Reserved) {
                Slot::Attached {
                    controller,
                    irq_task,
                } => (controller, irq_task),
                other => {
                    *slot = other;
                    bail!("no controller attached in slot {index}");
                }
            }
        };
        controller.shutdown().await;
        irq_task.abort();
        self.slots.lock()[index] = Slot::Empty;
        Ok(())
    }

    pub fn get(&self, index: usize) -> Option<Arc<Controller>> {
        match self.slots.lock().get(index)? {
            Slot::Attached { controller, .. } => Some(Arc::clone(controller)),
            _ => None,
        }
    }

    /// Attached controllers by slot.
    pub fn controllers(&self) -> Vec<(usize, Arc<Controller>)> {
        self.slots
            .lock()
            .iter()
            .enumerate()
            .filter_map(|(i, s)| match s {
                Slot::Attached { controller, .. } => Some((i, Arc::clone(controller))),
                _ => None,
            })
            .collect()
    }

    /// Detaches every controller, then stops the rescan worker.
    pub async fn shutdown(self) {
        for (index, _) in self.controllers() {
            if let Err(e) = self.detach(index).await {
                warn!("detaching cciss{index}: {e:#}");
            }
        }
        self.rescan.shutdown().await;
    }
}

impl Default for ControllerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
