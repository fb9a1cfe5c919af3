//! Per-controller tunables.

use std::time::Duration;

use color_eyre::{Result, eyre::ensure};

use crate::ciss::command_list::MAX_SG_ENTRIES;

/// Register layout generation of the board, chosen at attach time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegisterGeneration {
    /// Original Smart Array 5xxx interrupt bits.
    #[default]
    Sa5,
    /// Later boards that moved the interrupt-pending bit.
    Sa5b,
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Number of pool command slots, which is also the queue depth
    /// advertised to the block layer.
    pub nr_cmds: usize,
    /// Scatter-gather entries per command, capped at [`MAX_SG_ENTRIES`].
    pub max_sg: usize,
    /// How long the poll path waits for a single synchronous command.
    pub poll_timeout: Duration,
    /// Delay between empty polls of the completion FIFO.
    pub poll_interval: Duration,
    /// Resends allowed per command before it is failed.
    pub max_retries: u8,
    /// Size of the logical drive table.
    pub max_luns: usize,
    pub generation: RegisterGeneration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            nr_cmds: 64,
            max_sg: MAX_SG_ENTRIES,
            poll_timeout: Duration::from_secs(20),
            poll_interval: Duration::from_millis(1),
            max_retries: 3,
            max_luns: 64,
            generation: RegisterGeneration::default(),
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.nr_cmds > 0, "controller needs at least one command slot");
        ensure!(
            self.max_sg > 0 && self.max_sg <= MAX_SG_ENTRIES,
            "max_sg must be in 1..={MAX_SG_ENTRIES}, was {}",
            self.max_sg
        );
        ensure!(self.max_luns > 0, "logical drive table cannot be empty");
        ensure!(!self.poll_timeout.is_zero(), "poll timeout must be non-zero");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        ControllerConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_oversized_sg_list() {
        let config = ControllerConfig {
            max_sg: MAX_SG_ENTRIES + 1,
            ..Default::default()
        };
        let e = config.validate().expect_err("sg count above the hardware cap");
        assert!(e.root_cause().to_string().contains("max_sg"));
    }
}
