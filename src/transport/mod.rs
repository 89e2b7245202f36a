//! Buses that can carry serial flash commands.
//!
//! All of them implement [`Transport`](crate::Transport) and can be handed to
//! [`Flash::new`](crate::flash::Flash::new).

pub mod bitbang;
pub mod mapped;
pub mod spi;

pub use self::bitbang::BitBangTransport;
pub use self::mapped::{MappedError, MappedFlash, MappedTransport};
pub use self::spi::SpiTransport;

/// Opcode and 24-bit big-endian address, as sent ahead of every addressed
/// command.
fn command_header(opcode: u8, addr: u32) -> [u8; 4] {
    [opcode, (addr >> 16) as u8, (addr >> 8) as u8, addr as u8]
}
