//! Command submission, completion and retry engine for Smart Array (CISS)
//! RAID controllers.

pub mod ciss;
pub mod config;
pub mod engine;
pub mod error;
pub mod hw;
pub mod registry;
pub mod rescan;
pub mod scsi;
