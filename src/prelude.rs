//! Imports the traits needed to use the driver.
//!
//! ```
//! use serial_flash::prelude::*;
//! ```

pub use crate::BlockDevice as _serial_flash_BlockDevice;
pub use crate::Program as _serial_flash_Program;
pub use crate::Read as _serial_flash_Read;
pub use crate::Transport as _serial_flash_Transport;
