//! The Command Interface for SCSI-3 Support (CISS) wire format spoken by
//! Smart Array controllers.
//!
//! The host builds a command list in DMA memory, writes its bus address to
//! the request port, and later pops the command's tag from the reply port.
//! Everything the firmware reads or writes over the bus is defined in
//! [`command_list`].

pub mod command_list;
