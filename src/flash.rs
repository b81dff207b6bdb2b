//! Flash programming: the driver contract and the engine that enforces the
//! upload invariants on top of it.
//!
//! The engine owns the two pieces of state that make an interrupted upload
//! safe: the program `address` and the deferred first word. The first 32-bit
//! word of the application image is its boot gate; it is held back in RAM
//! until `BOOT` is accepted, so a session that dies halfway leaves the gate
//! word erased and the application unbootable.

use log::debug;
use thiserror::Error;

use crate::board::BoardInfo;
use crate::crc::crc32;
use crate::crypto::KeyState;
use crate::proto::{BOOT_DELAY_SIGNATURE1, BOOT_DELAY_SIGNATURE2};

/// Value of an erased flash word.
pub const ERASED_WORD: u32 = 0xffff_ffff;

/// Number of words in the key region.
pub const KEY_WORDS: usize = 4;

/// Largest number of words a single programming packet can carry.
pub const FLASH_BUFFER_WORDS: usize = 64;

/// The flash driver contract.
///
/// `read_word`/`write_word` take offsets within the application region;
/// `phy_write_word` takes a physical address and exists so the engine can
/// reach the key region, which lives outside the application area.
pub trait FlashDriver {
    fn unlock(&mut self);
    fn lock(&mut self);

    /// Size in bytes of sector `index`; returning 0 ends the table.
    fn sector_size(&self, index: usize) -> u32;
    fn erase_sector(&mut self, index: usize);

    fn read_word(&self, offset: u32) -> u32;
    fn write_word(&mut self, offset: u32, word: u32);

    fn read_otp(&self, index: u32) -> u32;
    fn read_sn(&self, index: u32) -> u32;

    fn phy_write_word(&mut self, address: u32, word: u32);

    /// Words of the 16-byte key region. Boards without a key region read as
    /// zero, which the engine treats as an invalidated key.
    fn key_word(&self, index: usize) -> u32 {
        let _ = index;
        0
    }

    /// Physical address of key word `index`.
    fn key_phys_addr(&self, index: usize) -> u32 {
        let _ = index;
        0
    }
}

/// Device-level failures of a flash operation.
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
pub enum FlashFault {
    #[error("erase verification failed at offset {0:#x}")]
    EraseVerify(u32),
    #[error("write verification failed at offset {0:#x}")]
    WriteVerify(u32),
    #[error("the boot-delay signature is not present")]
    MissingSignature,
}

/// Programming engine over a [`FlashDriver`].
pub struct FlashEngine<F> {
    flash: F,
    fw_size: u32,
    app_load_address: u32,
    address: u32,
    first_word: Option<u32>,
}

impl<F: FlashDriver> FlashEngine<F> {
    /// Creates an engine for the application region described by `info`.
    ///
    /// The program address starts at the end of the region, so programming
    /// is rejected until a `CHIP_ERASE` has reset it.
    pub fn new(flash: F, info: &BoardInfo) -> FlashEngine<F> {
        FlashEngine {
            flash,
            fw_size: info.fw_size,
            app_load_address: info.app_load_address,
            address: info.fw_size,
            first_word: None,
        }
    }

    /// The next offset a programming packet would be written to.
    pub fn address(&self) -> u32 {
        self.address
    }

    /// The deferred first word, while one is pending.
    pub fn first_word(&self) -> Option<u32> {
        self.first_word
    }

    /// Size of the flashable area in bytes.
    pub fn fw_size(&self) -> u32 {
        self.fw_size
    }

    pub fn driver(&self) -> &F {
        &self.flash
    }

    pub fn driver_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    /// Rewinds the per-session programming state: the address back past the
    /// end of the region (forcing an erase before the next upload) and no
    /// pending first word.
    pub fn reset(&mut self) {
        self.address = self.fw_size;
        self.first_word = None;
    }

    /// Unlocks the part and erases every sector in the table.
    pub fn erase_sectors(&mut self) {
        self.flash.unlock();

        let mut index = 0;
        while self.flash.sector_size(index) != 0 {
            self.flash.erase_sector(index);
            index += 1;
        }

        debug!("erased {} sectors", index);
    }

    /// Sweeps the application region checking every word reads erased; on
    /// success the program address is rewound and any pending first word is
    /// dropped.
    pub fn verify_erased(&mut self) -> Result<(), FlashFault> {
        let mut offset = 0;

        while offset < self.fw_size {
            if self.flash.read_word(offset) != ERASED_WORD {
                return Err(FlashFault::EraseVerify(offset));
            }

            offset += 4;
        }

        self.address = 0;
        self.first_word = None;

        Ok(())
    }

    /// Programs `words` at the current address, read-back-verifying each
    /// word.
    ///
    /// A packet landing on offset 0 has its first word captured and an
    /// erased word programmed in its place; the captured word is not
    /// committed to flash until [`FlashEngine::finalize`]. The address and
    /// the captured word only advance when the whole packet verified, so a
    /// failed packet can be retried wholesale.
    pub fn program(&mut self, words: &[u32]) -> Result<(), FlashFault> {
        debug_assert!(words.len() <= FLASH_BUFFER_WORDS);

        let count = words.len();
        let mut staged = [ERASED_WORD; FLASH_BUFFER_WORDS];
        staged[..count].copy_from_slice(words);

        let pending = if self.address == 0 && count > 0 {
            let first = staged[0];
            staged[0] = ERASED_WORD;
            Some(first)
        } else {
            None
        };

        let mut address = self.address;

        for &word in &staged[..count] {
            self.flash.write_word(address, word);

            if self.flash.read_word(address) != word {
                return Err(FlashFault::WriteVerify(address));
            }

            address += 4;
        }

        if let Some(word) = pending {
            self.first_word = Some(word);
        }

        self.address = address;

        Ok(())
    }

    /// Commits the deferred first word, arming the image for boot.
    ///
    /// The pending word is consumed either way; if the write does not
    /// verify, the gate stays open and the image remains unbootable.
    pub fn finalize(&mut self) -> Result<(), FlashFault> {
        if let Some(word) = self.first_word.take() {
            self.flash.write_word(0, word);

            if self.flash.read_word(0) != word {
                return Err(FlashFault::WriteVerify(0));
            }

            debug!("committed first word {:#010x}", word);
        }

        Ok(())
    }

    /// CRC-32 over the first `len` bytes of the region, reading whole words
    /// and substituting the pending first word at offset 0.
    ///
    /// Without the substitution a fully-uploaded-but-not-yet-booted image
    /// could never match the checksum the host computed.
    pub fn crc(&self, len: u32) -> u32 {
        let mut sum = 0;
        let mut offset = 0;

        while offset < len {
            let word = match (offset, self.first_word) {
                (0, Some(first)) => first,
                _ => self.flash.read_word(offset),
            };

            sum = crc32(&word.to_le_bytes(), sum);
            offset += 4;
        }

        sum
    }

    /// State of the key region: invalidated iff every byte reads zero.
    pub fn key_state(&self) -> KeyState {
        for index in 0..KEY_WORDS {
            if self.flash.key_word(index) != 0 {
                return KeyState::Intact;
            }
        }

        KeyState::Invalid
    }

    /// The key material, read fresh from flash.
    pub fn key_bytes(&self) -> [u8; 16] {
        let mut bytes = [0; 16];

        for index in 0..KEY_WORDS {
            let word = self.flash.key_word(index).to_le_bytes();
            bytes[index * 4..index * 4 + 4].copy_from_slice(&word);
        }

        bytes
    }

    /// Invalidates the key region. The transition is one-way; nothing in
    /// the bootloader can provision a key.
    pub fn zero_key(&mut self) {
        for index in 0..KEY_WORDS {
            if self.flash.key_word(index) != 0 {
                let address = self.flash.key_phys_addr(index);
                self.flash.phy_write_word(address, 0);
            }
        }

        debug!("key region invalidated");
    }

    /// Writes the requested boot delay into the signature region at `addr`.
    pub fn set_boot_delay(&mut self, addr: u32, seconds: u8) -> Result<(), FlashFault> {
        let sig1 = self.flash.read_word(addr);
        let sig2 = self.flash.read_word(addr + 4);

        if sig1 != BOOT_DELAY_SIGNATURE1 || sig2 != BOOT_DELAY_SIGNATURE2 {
            return Err(FlashFault::MissingSignature);
        }

        let value = (BOOT_DELAY_SIGNATURE1 & 0xffff_ff00) | seconds as u32;
        self.flash.write_word(addr, value);

        if self.flash.read_word(addr) != value {
            return Err(FlashFault::WriteVerify(addr));
        }

        Ok(())
    }

    /// The boot preconditions: a programmed gate word and a reset vector
    /// pointing into the application region.
    pub fn bootable(&self) -> bool {
        let stack_top = self.flash.read_word(0);
        let entry = self.flash.read_word(4);

        stack_top != ERASED_WORD
            && entry >= self.app_load_address
            && entry < self.app_load_address + self.fw_size
    }

    /// Relocks the part during the boot hand-off.
    pub fn lock(&mut self) {
        self.flash.lock();
    }
}
