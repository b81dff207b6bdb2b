use std::io;

use thiserror::Error;

/// Errors raised by the host-side plumbing around the bootloader core.
///
/// The protocol itself never surfaces these; its failures are status bytes
/// on the wire.
#[derive(Error, Debug)]
pub enum Error {
    #[error("The AES key must be 16 bytes, got {0}")]
    /// A provisioning key of the wrong length was supplied
    KeyLength(usize),

    #[error("'{0}' is not a valid hex string")]
    /// A hex-encoded argument could not be parsed
    InvalidHex(String),

    #[error("An image of {size} bytes does not fit the {fw_size} byte flashable area")]
    /// A preloaded application image is larger than the application region
    ImageTooLarge { size: usize, fw_size: u32 },

    #[error("There was an error when trying to open the serial port: {0}")]
    SerialOpenError(#[from] serialport::Error),

    /// An I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
