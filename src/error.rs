use crate::device::JedecId;
use core::fmt::{self, Debug, Display};

/// The error type used by this library.
///
/// This wraps the error of the [`Transport`](crate::Transport) in use and adds
/// the driver's own protocol errors on top of that.
#[non_exhaustive]
pub enum Error<E> {
    /// A bus transfer failed.
    Transport(E),

    /// The JEDEC ID read from the chip matched no known device.
    ///
    /// The driver stays unusable until a later detection succeeds.
    UnknownDevice(JedecId),

    /// An operation was attempted before a device was detected.
    NotDetected,

    /// A multi-page write failed part way through.
    ///
    /// `written` bytes at the start of the request were programmed before
    /// the chunk that failed.
    PartialWrite {
        /// Number of bytes programmed successfully.
        written: usize,
        /// The failure of the first unsuccessful chunk.
        source: E,
    },

    /// The device's erase sector does not match the cache buffer.
    UnsupportedGeometry {
        /// Sector size reported by the device.
        sector_size: u32,
    },
}

impl<E> Error<E> {
    /// Number of bytes that reached the chip before a write failed.
    pub fn written(&self) -> usize {
        match self {
            Error::PartialWrite { written, .. } => *written,
            _ => 0,
        }
    }
}

impl<E> From<E> for Error<E> {
    fn from(e: E) -> Self {
        Error::Transport(e)
    }
}

impl<E: Debug> Debug for Error<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Transport(e) => write!(f, "Error::Transport({:?})", e),
            Error::UnknownDevice(id) => write!(f, "Error::UnknownDevice({:?})", id),
            Error::NotDetected => f.write_str("Error::NotDetected"),
            Error::PartialWrite { written, source } => write!(
                f,
                "Error::PartialWrite {{ written: {}, source: {:?} }}",
                written, source
            ),
            Error::UnsupportedGeometry { sector_size } => {
                write!(f, "Error::UnsupportedGeometry {{ sector_size: {} }}", sector_size)
            }
        }
    }
}

impl<E: Display> Display for Error<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Transport(e) => write!(f, "transport error: {}", e),
            Error::UnknownDevice(id) => write!(f, "unknown flash device {}", id),
            Error::NotDetected => f.write_str("no flash device detected"),
            Error::PartialWrite { written, source } => {
                write!(f, "write failed after {} bytes: {}", written, source)
            }
            Error::UnsupportedGeometry { sector_size } => {
                write!(f, "unsupported sector size of {} bytes", sector_size)
            }
        }
    }
}

#[cfg(feature = "std")]
impl<E: Debug + Display> std::error::Error for Error<E> {}

/// Errors of the GPIO-driven transports.
///
/// This can encapsulate an SPI or a chip-select GPIO error.
pub enum BusError<S, P> {
    /// An SPI transfer failed.
    Spi(S),

    /// A GPIO could not be set.
    Gpio(P),
}

impl<S: Debug, P: Debug> Debug for BusError<S, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusError::Spi(spi) => write!(f, "BusError::Spi({:?})", spi),
            BusError::Gpio(gpio) => write!(f, "BusError::Gpio({:?})", gpio),
        }
    }
}

impl<S: Display, P: Display> Display for BusError<S, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusError::Spi(spi) => write!(f, "SPI error: {}", spi),
            BusError::Gpio(gpio) => write!(f, "GPIO error: {}", gpio),
        }
    }
}

#[cfg(feature = "std")]
impl<S: Debug + Display, P: Debug + Display> std::error::Error for BusError<S, P> {}
