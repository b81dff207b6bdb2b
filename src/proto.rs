//! Wire-level definitions for the serial flash-update protocol, revision 7.
//!
//! Command format:
//!
//! ```text
//! <opcode:1>[<command_data>]<EOC>
//! ```
//!
//! Reply format:
//!
//! ```text
//! [<reply_data>]<INSYNC><status>
//! ```
//!
//! All multi-byte integers on the wire are little-endian. The expected
//! workflow is `GET_SYNC`, `GET_DEVICE`, `CHIP_ERASE`, a `PROG_MULTI` loop,
//! `GET_CRC` and finally `BOOT`; encrypted uploads replace the programming
//! loop with `SET_IV` + `PROG_MULTI_ENCRYPTED` and verify with `CHECK_CRC`.

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// The protocol revision reported by `GET_DEVICE`/[`DeviceInfo::BlRev`].
pub const BL_PROTOCOL_VERSION: u32 = 7;

/// 'in sync' byte sent before every status byte.
pub const INSYNC: u8 = 0x12;
/// End-of-command framing byte.
pub const EOC: u8 = 0x20;

/// Maximum payload size of a single `PROG_MULTI`/`PROG_MULTI_ENCRYPTED`.
pub const PROG_MULTI_MAX: usize = 255;

/// Upper bound for the ASCII MCU description returned by `GET_CHIP_DES`.
pub const MAX_DES_LENGTH: usize = 20;

/// First word of the boot-delay signature region.
pub const BOOT_DELAY_SIGNATURE1: u32 = 0x92c2_ecea;
/// Second word of the boot-delay signature region.
pub const BOOT_DELAY_SIGNATURE2: u32 = 0xc505_7d5d;
/// Largest boot delay, in seconds, accepted by `SET_DELAY`.
pub const BOOT_DELAY_MAX: u8 = 30;

/// Status byte sent after [`INSYNC`] in a reply.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, IntoPrimitive)]
pub enum Status {
    /// The command was executed.
    Ok = 0x10,
    /// The command was understood but the device failed to execute it.
    Failed = 0x11,
    /// The command or its framing was malformed.
    Invalid = 0x13,
    /// Programming was refused because the silicon revision is unsupported.
    BadSilicon = 0x14,
    /// An encrypted operation was requested with a zeroed-out key.
    BadKey = 0x15,
}

/// Command opcodes.
///
/// Bytes that do not map to an opcode are ignored without a reply, so a
/// failed `TryFrom` conversion is not an error path in the interpreter.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive)]
pub enum Opcode {
    /// NOP for re-establishing sync.
    GetSync = 0x21,
    /// Get device identity words.
    GetDevice = 0x22,
    /// Erase the program area and reset the program address.
    ChipErase = 0x23,
    /// Write bytes at the program address and advance it.
    ProgMulti = 0x27,
    /// Compute and return a CRC over the whole flashable area.
    GetCrc = 0x29,
    /// Read a word from the OTP area.
    GetOtp = 0x2a,
    /// Read a word from the serial-number area.
    GetSn = 0x2b,
    /// Read the MCU identity code.
    GetChip = 0x2c,
    /// Set the minimum boot delay.
    SetDelay = 0x2d,
    /// Read the MCU description in ASCII.
    GetChipDes = 0x2e,
    /// Finalise programming and boot the application.
    Boot = 0x30,
    /// Reserved for ad-hoc debugging.
    Debug = 0x31,
    /// Send the initialisation vector for encrypted programming.
    SetIv = 0x36,
    /// Like `PROG_MULTI` but AES-128-CBC encrypted.
    ProgMultiEncrypted = 0x37,
    /// Compare the programmed area against the CRC sent in the stream header.
    CheckCrc = 0x38,
    /// Check that the key region has not been zeroed.
    CheckKey = 0x39,
}

/// Argument values for `GET_DEVICE`.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive)]
pub enum DeviceInfo {
    /// Bootloader protocol revision.
    BlRev = 1,
    /// Board type.
    BoardId = 2,
    /// Board revision.
    BoardRev = 3,
    /// Size of the flashable area in bytes.
    FwSize = 4,
    /// Contents of reserved vector entries 7-10.
    VecArea = 5,
}

// Read deadlines, in milliseconds. Host retry logic observes these, so they
// are part of the wire contract.

/// Waiting for the EOC of a command with no payload.
pub const EOC_SHORT_MS: u32 = 2;
/// Waiting for the EOC after a `PROG_MULTI*` or `SET_IV` payload.
pub const EOC_DATA_MS: u32 = 200;
/// Waiting for the EOC of `BOOT`.
pub const EOC_BOOT_MS: u32 = 1000;
/// Waiting for a single argument byte or word byte.
pub const ARG_MS: u32 = 1000;
/// Waiting for the length byte of a `PROG_MULTI*`.
pub const PROG_LEN_MS: u32 = 50;
/// Waiting for each payload byte.
pub const DATA_MS: u32 = 1000;

#[cfg(test)]
mod tests {
    use std::convert::TryFrom;

    use super::*;

    #[test]
    fn it_should_map_opcode_bytes() {
        assert_eq!(Opcode::try_from(0x21).ok(), Some(Opcode::GetSync));
        assert_eq!(Opcode::try_from(0x27).ok(), Some(Opcode::ProgMulti));
        assert_eq!(Opcode::try_from(0x37).ok(), Some(Opcode::ProgMultiEncrypted));
        assert_eq!(Opcode::try_from(0x39).ok(), Some(Opcode::CheckKey));
    }

    #[test]
    fn it_should_reject_unknown_opcode_bytes() {
        assert!(Opcode::try_from(0x00).is_err());
        assert!(Opcode::try_from(0x20).is_err());
        assert!(Opcode::try_from(0xff).is_err());
    }

    #[test]
    fn it_should_encode_status_bytes() {
        assert_eq!(u8::from(Status::Ok), 0x10);
        assert_eq!(u8::from(Status::Failed), 0x11);
        assert_eq!(u8::from(Status::Invalid), 0x13);
        assert_eq!(u8::from(Status::BadSilicon), 0x14);
        assert_eq!(u8::from(Status::BadKey), 0x15);
    }

    #[test]
    fn it_should_map_device_info_arguments() {
        assert_eq!(DeviceInfo::try_from(1).ok(), Some(DeviceInfo::BlRev));
        assert_eq!(DeviceInfo::try_from(5).ok(), Some(DeviceInfo::VecArea));
        assert!(DeviceInfo::try_from(0).is_err());
        assert!(DeviceInfo::try_from(6).is_err());
    }
}
