//! In-memory stand-ins for the hardware the bootloader drives.
//!
//! These back both the test suite and the `fmuboot-sim` binary: a NOR-like
//! flash array behind a sector table, a board with countable LEDs, the
//! software AES block primitive and a scripted transport.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, NewBlockCipher};
use aes::Aes128 as Aes128Cipher;
use byteorder::{ByteOrder, LittleEndian};
use log::warn;

use crate::board::{Board, BoardInfo, Led};
use crate::crypto::Aes128;
use crate::error::Error;
use crate::flash::{FlashDriver, ERASED_WORD, KEY_WORDS};
use crate::transport::{Transport, TransportKind};

/// Physical address the simulated application region is mapped at.
pub const APP_LOAD_ADDRESS: u32 = 0x0800_4000;

/// Physical address of the simulated key region, at the top of the sector
/// the bootloader itself occupies.
pub const KEY_BASE: u32 = 0x0800_3ff0;

/// Application-area sector table of an STM32F405 with the first 16 KiB
/// sector held back for the bootloader: 1008 KiB flashable.
pub const DEFAULT_SECTORS: [u32; 11] = [
    16 * 1024,
    16 * 1024,
    16 * 1024,
    64 * 1024,
    128 * 1024,
    128 * 1024,
    128 * 1024,
    128 * 1024,
    128 * 1024,
    128 * 1024,
    128 * 1024,
];

/// A NOR-like flash array: erasing a sector sets it to `0xFFFFFFFF`,
/// programming can only clear bits, and writes while locked are dropped.
pub struct MemFlash {
    words: Vec<u32>,
    sectors: Vec<u32>,
    otp: Vec<u32>,
    sn: Vec<u32>,
    key: [u32; KEY_WORDS],
    locked: bool,
    poisoned: Vec<u32>,
    stuck: Vec<(u32, u32)>,
}

impl MemFlash {
    /// Creates a locked, fully-erased flash with the given sector sizes.
    pub fn new(sectors: &[u32]) -> MemFlash {
        let fw_size: u32 = sectors.iter().sum();

        MemFlash {
            words: vec![ERASED_WORD; (fw_size / 4) as usize],
            sectors: sectors.to_vec(),
            otp: (0..32).map(|index| 0x0070_4f54 | index << 16).collect(),
            sn: vec![0x3035_3532, 0x3531_3132, 0x3130_3533],
            key: [0; KEY_WORDS],
            locked: true,
            poisoned: Vec::new(),
            stuck: Vec::new(),
        }
    }

    /// Provisions the key region, as manufacturing would.
    pub fn with_key(mut self, key: [u8; 16]) -> MemFlash {
        for (index, chunk) in key.chunks_exact(4).enumerate() {
            self.key[index] = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }

        self
    }

    pub fn fw_size(&self) -> u32 {
        (self.words.len() * 4) as u32
    }

    /// Reads a word without going through the driver surface.
    pub fn word(&self, offset: u32) -> u32 {
        self.words[(offset / 4) as usize]
    }

    /// Writes a word directly, bypassing the lock and the NOR rules; this
    /// is factory preload, not programming.
    pub fn preload_word(&mut self, offset: u32, value: u32) {
        let index = (offset / 4) as usize;
        self.words[index] = value;
    }

    /// Makes the cell at `offset` ignore writes, like a worn-out cell.
    pub fn poison_word(&mut self, offset: u32) {
        self.poisoned.push(offset);
    }

    /// Makes the cell at `offset` come back from every erase holding
    /// `value`.
    pub fn stick_word(&mut self, offset: u32, value: u32) {
        self.stuck.push((offset, value));
        self.preload_word(offset, value);
    }

    /// The whole application region as bytes.
    pub fn image(&self) -> Vec<u8> {
        let mut bytes = vec![0; self.words.len() * 4];
        LittleEndian::write_u32_into(&self.words, &mut bytes);
        bytes
    }

    /// Preloads an application image at offset 0, padding the remainder of
    /// the region with erased bytes.
    pub fn load_image(&mut self, bytes: &[u8]) -> Result<(), Error> {
        if bytes.len() > self.fw_size() as usize {
            return Err(Error::ImageTooLarge {
                size: bytes.len(),
                fw_size: self.fw_size(),
            });
        }

        let mut padded = bytes.to_vec();
        padded.resize((padded.len() + 3) / 4 * 4, 0xff);

        for word in self.words.iter_mut() {
            *word = ERASED_WORD;
        }

        LittleEndian::read_u32_into(&padded, &mut self.words[..padded.len() / 4]);

        Ok(())
    }

    fn sector_range(&self, index: usize) -> std::ops::Range<usize> {
        let start: u32 = self.sectors[..index].iter().sum();
        let end = start + self.sectors[index];

        (start / 4) as usize..(end / 4) as usize
    }
}

impl FlashDriver for MemFlash {
    fn unlock(&mut self) {
        self.locked = false;
    }

    fn lock(&mut self) {
        self.locked = true;
    }

    fn sector_size(&self, index: usize) -> u32 {
        self.sectors.get(index).copied().unwrap_or(0)
    }

    fn erase_sector(&mut self, index: usize) {
        if self.locked {
            warn!("erase of sector {} while locked, dropped", index);
            return;
        }

        let range = self.sector_range(index);

        for word in &mut self.words[range.clone()] {
            *word = ERASED_WORD;
        }

        for (offset, value) in self.stuck.clone() {
            if range.contains(&((offset / 4) as usize)) {
                self.words[(offset / 4) as usize] = value;
            }
        }
    }

    fn read_word(&self, offset: u32) -> u32 {
        self.word(offset)
    }

    fn write_word(&mut self, offset: u32, word: u32) {
        if self.locked {
            warn!("write to {:#x} while locked, dropped", offset);
            return;
        }

        if self.poisoned.contains(&offset) {
            return;
        }

        // Programming NOR flash can only clear bits.
        let index = (offset / 4) as usize;
        self.words[index] &= word;
    }

    fn read_otp(&self, index: u32) -> u32 {
        self.otp.get(index as usize).copied().unwrap_or(ERASED_WORD)
    }

    fn read_sn(&self, index: u32) -> u32 {
        self.sn.get(index as usize).copied().unwrap_or(ERASED_WORD)
    }

    fn phy_write_word(&mut self, address: u32, word: u32) {
        if address >= KEY_BASE && address < KEY_BASE + (KEY_WORDS as u32) * 4 {
            let index = ((address - KEY_BASE) / 4) as usize;
            self.key[index] &= word;
            return;
        }

        if address >= APP_LOAD_ADDRESS && address < APP_LOAD_ADDRESS + self.fw_size() {
            self.write_word(address - APP_LOAD_ADDRESS, word);
        }
    }

    fn key_word(&self, index: usize) -> u32 {
        self.key.get(index).copied().unwrap_or(0)
    }

    fn key_phys_addr(&self, index: usize) -> u32 {
        KEY_BASE + (index as u32) * 4
    }
}

/// A board with countable LEDs and switchable silicon health.
pub struct MemBoard {
    info: BoardInfo,
    mcu_id: u32,
    desc: String,
    bad_silicon: AtomicBool,
    led_on: [AtomicBool; 2],
    led_toggles: [AtomicUsize; 2],
}

impl MemBoard {
    pub fn new() -> MemBoard {
        MemBoard {
            info: BoardInfo {
                board_type: 9,
                board_rev: 0,
                fw_size: DEFAULT_SECTORS.iter().sum(),
                systick_mhz: 168,
                app_load_address: APP_LOAD_ADDRESS,
                boot_delay_addr: None,
            },
            mcu_id: 0x1000_6413,
            desc: "STM32F40x,rev C".to_string(),
            bad_silicon: AtomicBool::new(false),
            led_on: Default::default(),
            led_toggles: Default::default(),
        }
    }

    pub fn with_fw_size(mut self, fw_size: u32) -> MemBoard {
        self.info.fw_size = fw_size;
        self
    }

    pub fn with_board_type(mut self, board_type: u32) -> MemBoard {
        self.info.board_type = board_type;
        self
    }

    pub fn with_board_rev(mut self, board_rev: u32) -> MemBoard {
        self.info.board_rev = board_rev;
        self
    }

    pub fn with_boot_delay_addr(mut self, addr: u32) -> MemBoard {
        self.info.boot_delay_addr = Some(addr);
        self
    }

    /// Marks the silicon as unsafe to program.
    pub fn set_bad_silicon(&self, bad: bool) {
        self.bad_silicon.store(bad, Ordering::SeqCst);
    }

    pub fn led_is_on(&self, led: Led) -> bool {
        self.led_on[led as usize].load(Ordering::SeqCst)
    }

    pub fn led_toggles(&self, led: Led) -> usize {
        self.led_toggles[led as usize].load(Ordering::SeqCst)
    }
}

impl Default for MemBoard {
    fn default() -> MemBoard {
        MemBoard::new()
    }
}

impl Board for MemBoard {
    fn info(&self) -> &BoardInfo {
        &self.info
    }

    fn mcu_id(&self) -> u32 {
        self.mcu_id
    }

    fn mcu_desc(&self, buf: &mut [u8]) -> usize {
        let bytes = self.desc.as_bytes();
        let len = bytes.len().min(buf.len());

        buf[..len].copy_from_slice(&bytes[..len]);
        len
    }

    fn check_silicon(&self) -> bool {
        self.bad_silicon.load(Ordering::SeqCst)
    }

    fn led_on(&self, led: Led) {
        self.led_on[led as usize].store(true, Ordering::SeqCst);
    }

    fn led_off(&self, led: Led) {
        self.led_on[led as usize].store(false, Ordering::SeqCst);
    }

    fn led_toggle(&self, led: Led) {
        self.led_on[led as usize].fetch_xor(true, Ordering::SeqCst);
        self.led_toggles[led as usize].fetch_add(1, Ordering::SeqCst);
    }
}

/// The AES-128 block primitive over the pure-software `aes` implementation.
pub struct SoftAes;

impl Aes128 for SoftAes {
    fn decrypt_block(&self, key: &[u8; 16], block: &mut [u8; 16]) {
        let cipher = Aes128Cipher::new(GenericArray::from_slice(key));
        let mut scratch = GenericArray::clone_from_slice(block);

        cipher.decrypt_block(&mut scratch);
        block.copy_from_slice(&scratch);
    }
}

impl SoftAes {
    /// CBC-encrypts `plaintext` (length a multiple of 16) under `key` and
    /// `iv`: the inverse of what the bootloader computes, used to prepare
    /// encrypted streams.
    pub fn cbc_encrypt(key: &[u8; 16], iv: &[u8; 16], plaintext: &[u8]) -> Vec<u8> {
        assert_eq!(plaintext.len() % 16, 0);

        let cipher = Aes128Cipher::new(GenericArray::from_slice(key));
        let mut ciphertext = Vec::with_capacity(plaintext.len());
        let mut chain = *iv;

        for chunk in plaintext.chunks_exact(16) {
            let mut block = GenericArray::clone_from_slice(chunk);

            for (byte, prev) in block.iter_mut().zip(chain.iter()) {
                *byte ^= prev;
            }

            cipher.encrypt_block(&mut block);
            chain.copy_from_slice(&block);
            ciphertext.extend_from_slice(&block);
        }

        ciphertext
    }
}

/// A scripted transport: input is queued through the handle, output is
/// captured for inspection. Drives the interpreter byte-for-byte in tests.
pub struct ScriptPort {
    kind: TransportKind,
    input: Arc<Mutex<VecDeque<u8>>>,
    sent: Arc<Mutex<Vec<u8>>>,
}

/// The host's end of a [`ScriptPort`].
#[derive(Clone)]
pub struct ScriptHandle {
    input: Arc<Mutex<VecDeque<u8>>>,
    sent: Arc<Mutex<Vec<u8>>>,
}

impl ScriptPort {
    pub fn new(kind: TransportKind) -> (ScriptPort, ScriptHandle) {
        let input = Arc::new(Mutex::new(VecDeque::new()));
        let sent = Arc::new(Mutex::new(Vec::new()));

        let handle = ScriptHandle {
            input: input.clone(),
            sent: sent.clone(),
        };

        (ScriptPort { kind, input, sent }, handle)
    }
}

impl ScriptHandle {
    /// Queues bytes for the bootloader to read.
    pub fn feed(&self, bytes: &[u8]) {
        self.input.lock().unwrap().extend(bytes.iter().copied());
    }

    /// Takes everything the bootloader has transmitted so far.
    pub fn take_sent(&self) -> Vec<u8> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    /// Bytes queued but not yet consumed.
    pub fn pending(&self) -> usize {
        self.input.lock().unwrap().len()
    }
}

impl Transport for ScriptPort {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn poll_byte(&mut self) -> Option<u8> {
        self.input.lock().unwrap().pop_front()
    }

    fn write(&mut self, buf: &[u8]) {
        self.sent.lock().unwrap().extend_from_slice(buf);
    }
}
