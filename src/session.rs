//! The protocol interpreter and the session loop driving it.
//!
//! Each call to [`Bootloader::run`] is one session: it is entered from the
//! reset path with an inactivity timeout, interprets commands until the
//! host either goes quiet or sends `BOOT`, and returns an [`Exit`] telling
//! the caller whether to try booting the application. Entry resets all
//! per-session state (transport pinning, program address, pending first
//! word, IV), so a failed boot attempt drops back into a fresh session.
//!
//! Every wait in the interpreter funnels through [`Bootloader::cin_wait`],
//! the single suspension point, which is what makes the whole protocol
//! drivable from a scripted byte stream in tests.

use std::convert::TryFrom;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info};

use crate::board::{Board, Led};
use crate::crypto::{self, Aes128, KeyState, StreamHeader, STREAM_HEADER_LEN};
use crate::flash::{FlashDriver, FlashEngine, FLASH_BUFFER_WORDS};
use crate::proto::{self, DeviceInfo, Opcode, Status};
use crate::timer::{LedState, SysTick, Timer};
use crate::transport::Multiplexer;

/// How a session ended.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Exit {
    /// No command was accepted within the inactivity timeout; the caller
    /// should try booting whatever application is present.
    Timeout,
    /// `BOOT` was accepted and acknowledged; the caller performs the
    /// hand-off.
    Boot,
}

/// What a handled command owes the host.
enum Reply {
    /// The command was executed; also locks the transport and disarms the
    /// inactivity return.
    Ok,
    /// Malformed framing or arguments.
    Invalid,
    /// The device rejected the operation.
    Failed,
    /// The silicon revision cannot be programmed.
    BadSilicon,
    /// Encrypted programming with an invalidated key.
    BadKey,
    /// Not a command on this build; no reply at all.
    None,
    /// `BOOT` went through: acknowledge and leave the session.
    Boot,
}

/// A bootloader session over a flash driver, a board and any number of
/// transports.
pub struct Bootloader<F, B> {
    mux: Multiplexer,
    engine: FlashEngine<F>,
    board: B,
    tick: Arc<SysTick>,
    cipher: Option<Box<dyn Aes128>>,
    key_state: KeyState,
    iv: [u8; 16],
    num_to_flash: u32,
    crc32_expected: u32,
}

impl<F: FlashDriver, B: Board> Bootloader<F, B> {
    pub fn new(mux: Multiplexer, flash: F, board: B, tick: Arc<SysTick>) -> Bootloader<F, B> {
        let engine = FlashEngine::new(flash, board.info());

        Bootloader {
            mux,
            engine,
            board,
            tick,
            cipher: None,
            key_state: KeyState::Invalid,
            iv: [0; 16],
            num_to_flash: 0,
            crc32_expected: 0,
        }
    }

    /// Enables encrypted programming with the given block primitive. A
    /// session without a cipher treats the encrypted opcodes as unknown
    /// bytes and answers `CHECK_KEY` with `BAD_KEY`.
    pub fn with_cipher(mut self, cipher: Box<dyn Aes128>) -> Bootloader<F, B> {
        self.cipher = Some(cipher);
        self
    }

    pub fn engine(&self) -> &FlashEngine<F> {
        &self.engine
    }

    /// Runs the session until it times out or `BOOT` is accepted.
    ///
    /// With `timeout_ms == 0` the session never returns on inactivity.
    /// Accepting any command disarms the timeout for the rest of the
    /// session.
    pub fn run(&mut self, timeout_ms: u32) -> Exit {
        let mut timeout = self.start(timeout_ms);

        loop {
            if let Some(exit) = self.next_command(&mut timeout) {
                return exit;
            }
        }
    }

    /// Deinitialises the transports and relocks flash ahead of the jump to
    /// the application.
    pub fn quiesce(&mut self) {
        self.mux.shutdown();
        self.engine.lock();
    }

    fn start(&mut self, timeout_ms: u32) -> u32 {
        // Every entry is a fresh session: no pinned transport, programming
        // state rewound, encrypted-stream bookkeeping cleared. The caller
        // re-enters `run` after a failed boot attempt, and the retrying
        // host may well show up on the other transport.
        self.mux.reset();
        self.engine.reset();
        self.iv = [0; 16];
        self.num_to_flash = 0;
        self.crc32_expected = 0;

        self.key_state = if self.cipher.is_some() {
            self.engine.key_state()
        } else {
            KeyState::Invalid
        };

        if timeout_ms > 0 {
            self.tick.set(Timer::BlWait, timeout_ms);
        }

        self.tick.led_set(LedState::Blink, &self.board);

        debug!(
            "session start: key {:?}, inactivity timeout {} ms",
            self.key_state, timeout_ms
        );

        timeout_ms
    }

    /// Waits for one opcode byte and handles it. Returns the session exit
    /// when one is due, `None` to keep going.
    fn next_command(&mut self, timeout: &mut u32) -> Option<Exit> {
        self.board.led_off(Led::Activity);

        let byte = loop {
            if *timeout != 0 && self.tick.expired(Timer::BlWait) {
                debug!("no command within the inactivity timeout");
                return Some(Exit::Timeout);
            }

            if let Some(byte) = self.cin_wait(0) {
                break byte;
            }
        };

        // Bytes that are not opcodes could be anything - line noise, a host
        // probing at the wrong baud rate - and get no reply at all.
        let opcode = match Opcode::try_from(byte) {
            Ok(opcode) => opcode,
            Err(_) => return None,
        };

        match self.handle(opcode) {
            Reply::Ok => {
                // A command worth syncing: we are talking to a real
                // uploader, so kill the inactivity return and pin the
                // session to the transport that carried it.
                *timeout = 0;
                self.mux.lock();
                self.sync(Status::Ok);
                None
            }
            Reply::Invalid => {
                // Could still be garbage; the timeout stays armed.
                self.sync(Status::Invalid);
                None
            }
            Reply::Failed => {
                self.sync(Status::Failed);
                None
            }
            Reply::BadSilicon => {
                self.sync(Status::BadSilicon);
                None
            }
            Reply::BadKey => {
                self.sync(Status::BadKey);
                None
            }
            Reply::None => None,
            Reply::Boot => {
                self.sync(Status::Ok);
                // Let the host drain the reply before the interface dies.
                self.tick.delay(100);
                Some(Exit::Boot)
            }
        }
    }

    fn handle(&mut self, opcode: Opcode) -> Reply {
        match opcode {
            Opcode::GetSync => self.handle_get_sync(),
            Opcode::GetDevice => self.handle_get_device(),
            Opcode::ChipErase => self.handle_chip_erase(),
            Opcode::ProgMulti => self.handle_prog_multi(),
            Opcode::GetCrc => self.handle_get_crc(),
            Opcode::GetOtp => self.handle_get_otp(),
            Opcode::GetSn => self.handle_get_sn(),
            Opcode::GetChip => self.handle_get_chip(),
            Opcode::SetDelay => self.handle_set_delay(),
            Opcode::GetChipDes => self.handle_get_chip_des(),
            Opcode::Boot => self.handle_boot(),
            // Reserved for ad-hoc debugging; acknowledged, nothing else.
            Opcode::Debug => Reply::Ok,
            Opcode::SetIv => self.handle_set_iv(),
            Opcode::ProgMultiEncrypted => self.handle_prog_multi_encrypted(),
            Opcode::CheckCrc => self.handle_check_crc(),
            Opcode::CheckKey => self.handle_check_key(),
        }
    }

    fn handle_get_sync(&mut self) -> Reply {
        if !self.wait_for_eoc(proto::EOC_SHORT_MS) {
            return Reply::Invalid;
        }

        Reply::Ok
    }

    fn handle_get_device(&mut self) -> Reply {
        let arg = match self.cin_wait(proto::ARG_MS) {
            Some(arg) => arg,
            None => return Reply::Invalid,
        };

        if !self.wait_for_eoc(proto::EOC_SHORT_MS) {
            return Reply::Invalid;
        }

        match DeviceInfo::try_from(arg) {
            Ok(DeviceInfo::BlRev) => self.cout_word(proto::BL_PROTOCOL_VERSION),
            Ok(DeviceInfo::BoardId) => {
                let board_type = self.board.info().board_type;
                self.cout_word(board_type);
            }
            Ok(DeviceInfo::BoardRev) => {
                let board_rev = self.board.info().board_rev;
                self.cout_word(board_rev);
            }
            Ok(DeviceInfo::FwSize) => {
                let fw_size = self.engine.fw_size();
                self.cout_word(fw_size);
            }
            Ok(DeviceInfo::VecArea) => {
                for entry in 7..=10 {
                    let word = self.engine.driver().read_word(entry * 4);
                    self.cout_word(word);
                }
            }
            Err(_) => return Reply::Invalid,
        }

        Reply::Ok
    }

    fn handle_chip_erase(&mut self) -> Reply {
        if !self.wait_for_eoc(proto::EOC_SHORT_MS) {
            return Reply::Invalid;
        }

        if self.board.check_silicon() {
            return Reply::BadSilicon;
        }

        info!("erasing program area");

        // Hold the LED solid while erasing; a blink frozen at a random
        // phase looks like a hang.
        self.tick.led_set(LedState::On, &self.board);
        self.engine.erase_sectors();
        self.tick.led_set(LedState::Off, &self.board);

        if let Err(fault) = self.engine.verify_erased() {
            debug!("erase verify: {}", fault);
            return Reply::Failed;
        }

        self.tick.led_set(LedState::Blink, &self.board);

        Reply::Ok
    }

    fn handle_prog_multi(&mut self) -> Reply {
        let len = match self.cin_wait(proto::PROG_LEN_MS) {
            Some(len) => len as usize,
            None => return Reply::Invalid,
        };

        if len == 0 || len % 4 != 0 {
            return Reply::Invalid;
        }

        if self.engine.address() + len as u32 > self.engine.fw_size() {
            return Reply::Invalid;
        }

        let mut buffer = [0; proto::PROG_MULTI_MAX + 1];

        for byte in buffer[..len].iter_mut() {
            *byte = match self.cin_wait(proto::DATA_MS) {
                Some(byte) => byte,
                None => return Reply::Invalid,
            };
        }

        if !self.wait_for_eoc(proto::EOC_DATA_MS) {
            return Reply::Invalid;
        }

        if self.engine.address() == 0 {
            if self.board.check_silicon() {
                return Reply::BadSilicon;
            }

            // An unencrypted upload is allowed, but it costs the key: the
            // unit can never again prove it runs only encrypted firmware.
            if self.cipher.is_some() {
                self.engine.zero_key();
            }
        }

        let count = len / 4;
        let mut words = [0; FLASH_BUFFER_WORDS];
        LittleEndian::read_u32_into(&buffer[..len], &mut words[..count]);

        match self.engine.program(&words[..count]) {
            Ok(()) => Reply::Ok,
            Err(fault) => {
                debug!("program: {}", fault);
                Reply::Failed
            }
        }
    }

    fn handle_get_crc(&mut self) -> Reply {
        if !self.wait_for_eoc(proto::EOC_SHORT_MS) {
            return Reply::Invalid;
        }

        let sum = self.engine.crc(self.engine.fw_size());
        self.cout_word(sum);

        Reply::Ok
    }

    fn handle_get_otp(&mut self) -> Reply {
        let index = match self.cin_word(proto::ARG_MS) {
            Some(index) => index,
            None => return Reply::Invalid,
        };

        if !self.wait_for_eoc(proto::EOC_SHORT_MS) {
            return Reply::Invalid;
        }

        let word = self.engine.driver().read_otp(index);
        self.cout_word(word);

        Reply::Ok
    }

    fn handle_get_sn(&mut self) -> Reply {
        let index = match self.cin_word(proto::ARG_MS) {
            Some(index) => index,
            None => return Reply::Invalid,
        };

        if !self.wait_for_eoc(proto::EOC_SHORT_MS) {
            return Reply::Invalid;
        }

        let word = self.engine.driver().read_sn(index);
        self.cout_word(word);

        Reply::Ok
    }

    fn handle_get_chip(&mut self) -> Reply {
        if !self.wait_for_eoc(proto::EOC_SHORT_MS) {
            return Reply::Invalid;
        }

        let id = self.board.mcu_id();
        self.cout_word(id);

        Reply::Ok
    }

    fn handle_set_delay(&mut self) -> Reply {
        // Boards without a delay-signature region never had this command;
        // the opcode byte falls through unanswered, like any unknown byte.
        let addr = match self.board.info().boot_delay_addr {
            Some(addr) => addr,
            None => return Reply::None,
        };

        let delay = match self.cin_wait(proto::ARG_MS) {
            Some(delay) => delay,
            None => return Reply::Invalid,
        };

        if delay > proto::BOOT_DELAY_MAX {
            return Reply::Invalid;
        }

        if !self.wait_for_eoc(proto::EOC_SHORT_MS) {
            return Reply::Invalid;
        }

        match self.engine.set_boot_delay(addr, delay) {
            Ok(()) => Reply::Ok,
            Err(fault) => {
                debug!("boot delay: {}", fault);
                Reply::Failed
            }
        }
    }

    fn handle_get_chip_des(&mut self) -> Reply {
        if !self.wait_for_eoc(proto::EOC_SHORT_MS) {
            return Reply::Invalid;
        }

        let mut desc = [0; proto::MAX_DES_LENGTH];
        let len = self.board.mcu_desc(&mut desc).min(desc.len());

        self.cout_word(len as u32);
        self.cout(&desc[..len]);

        Reply::Ok
    }

    fn handle_boot(&mut self) -> Reply {
        if !self.wait_for_eoc(proto::EOC_BOOT_MS) {
            return Reply::Invalid;
        }

        if let Err(fault) = self.engine.finalize() {
            debug!("finalize: {}", fault);
            return Reply::Failed;
        }

        info!("image finalised, leaving the session");

        Reply::Boot
    }

    fn handle_set_iv(&mut self) -> Reply {
        if self.cipher.is_none() {
            return Reply::None;
        }

        let mut iv = [0; 16];

        for byte in iv.iter_mut() {
            *byte = match self.cin_wait(proto::DATA_MS) {
                Some(byte) => byte,
                None => return Reply::Invalid,
            };
        }

        if !self.wait_for_eoc(proto::EOC_DATA_MS) {
            return Reply::Invalid;
        }

        self.iv = iv;

        Reply::Ok
    }

    fn handle_prog_multi_encrypted(&mut self) -> Reply {
        if self.cipher.is_none() {
            return Reply::None;
        }

        let len = match self.cin_wait(proto::PROG_LEN_MS) {
            Some(len) => len as usize,
            None => return Reply::Invalid,
        };

        if len == 0 || len % 4 != 0 {
            return Reply::Invalid;
        }

        if self.engine.address() + len as u32 > self.engine.fw_size() {
            return Reply::Invalid;
        }

        let mut encrypted = [0; proto::PROG_MULTI_MAX + 1];

        for byte in encrypted[..len].iter_mut() {
            *byte = match self.cin_wait(proto::DATA_MS) {
                Some(byte) => byte,
                None => return Reply::Invalid,
            };
        }

        if !self.wait_for_eoc(proto::EOC_DATA_MS) {
            return Reply::Invalid;
        }

        // A unit that ever took an unencrypted upload has had its key
        // zeroed and cannot take encrypted ones again.
        if self.key_state != KeyState::Intact {
            return Reply::BadKey;
        }

        // Decryption works on whole blocks.
        if len % 16 != 0 || len >= proto::PROG_MULTI_MAX {
            return Reply::Invalid;
        }

        // The key is read back out of flash at the moment of use.
        let key = self.engine.key_bytes();
        let mut plain = [0; proto::PROG_MULTI_MAX + 1];

        if let Some(cipher) = &self.cipher {
            crypto::cbc_decrypt(
                &**cipher,
                &key,
                &mut self.iv,
                &encrypted[..len],
                &mut plain[..len],
            );
        }

        let mut start = 0;

        if self.engine.address() == 0 {
            if self.board.check_silicon() {
                return Reply::BadSilicon;
            }

            // The first decrypted block is the stream header, not flash
            // content; programming starts right after it.
            let header = StreamHeader::parse(&plain);
            self.num_to_flash = header.num_to_flash;
            self.crc32_expected = header.crc32_expected;
            start = STREAM_HEADER_LEN;

            debug!(
                "encrypted stream: {} bytes, crc {:#010x}",
                self.num_to_flash, self.crc32_expected
            );
        }

        if self.num_to_flash > self.engine.fw_size() {
            // A nonsense length means the decryption went wrong; give up
            // before running off the end of the region.
            return Reply::Failed;
        }

        let count = (len - start) / 4;
        let mut words = [0; FLASH_BUFFER_WORDS];
        LittleEndian::read_u32_into(&plain[start..len], &mut words[..count]);

        match self.engine.program(&words[..count]) {
            Ok(()) => Reply::Ok,
            Err(fault) => {
                debug!("program: {}", fault);
                Reply::Failed
            }
        }
    }

    fn handle_check_crc(&mut self) -> Reply {
        if self.cipher.is_none() {
            return Reply::None;
        }

        if !self.wait_for_eoc(proto::EOC_SHORT_MS) {
            return Reply::Invalid;
        }

        if self.num_to_flash > self.engine.fw_size() {
            return Reply::Failed;
        }

        let sum = self.engine.crc(self.num_to_flash);

        if sum != self.crc32_expected {
            debug!(
                "crc mismatch: computed {:#010x}, expected {:#010x}",
                sum, self.crc32_expected
            );
            return Reply::Failed;
        }

        Reply::Ok
    }

    fn handle_check_key(&mut self) -> Reply {
        if !self.wait_for_eoc(proto::EOC_SHORT_MS) {
            return Reply::Invalid;
        }

        match (&self.cipher, self.key_state) {
            (Some(_), KeyState::Intact) => Reply::Ok,
            _ => Reply::BadKey,
        }
    }

    /// The single suspension point: polls the multiplexer until a byte
    /// arrives or `timeout_ms` elapses. A timeout of zero polls exactly
    /// once.
    fn cin_wait(&mut self, timeout_ms: u32) -> Option<u8> {
        self.tick.set(Timer::Cin, timeout_ms);

        loop {
            if let Some(byte) = self.mux.poll_byte() {
                self.board.led_on(Led::Activity);
                return Some(byte);
            }

            if self.tick.expired(Timer::Cin) {
                return None;
            }
        }
    }

    /// Reads a little-endian word with a per-byte deadline.
    fn cin_word(&mut self, timeout_ms: u32) -> Option<u32> {
        let mut bytes = [0; 4];

        for byte in bytes.iter_mut() {
            *byte = self.cin_wait(timeout_ms)?;
        }

        Some(LittleEndian::read_u32(&bytes))
    }

    fn wait_for_eoc(&mut self, timeout_ms: u32) -> bool {
        self.cin_wait(timeout_ms) == Some(proto::EOC)
    }

    fn cout(&mut self, buf: &[u8]) {
        self.mux.write(buf);
    }

    fn cout_word(&mut self, word: u32) {
        let mut bytes = [0; 4];
        LittleEndian::write_u32(&mut bytes, word);
        self.cout(&bytes);
    }

    fn sync(&mut self, status: Status) {
        self.cout(&[proto::INSYNC, status.into()]);
    }
}

#[cfg(test)]
mod tests {
    use assert_hex::assert_eq_hex;
    use hex_literal::hex;

    use super::*;
    use crate::crc::crc32;
    use crate::flash::ERASED_WORD;
    use crate::sim::{MemBoard, MemFlash, ScriptHandle, ScriptPort, SoftAes};
    use crate::transport::TransportKind;

    const KEY: [u8; 16] = hex!("2b7e151628aed2a6abf7158809cf4f3c");
    const IV: [u8; 16] = hex!("000102030405060708090a0b0c0d0e0f");

    /// A bootloader wired to scripted transports and a self-clocked tick.
    struct Rig {
        bl: Bootloader<MemFlash, MemBoard>,
        host: ScriptHandle,
        usb: Option<ScriptHandle>,
    }

    fn rig(flash: MemFlash, board: MemBoard, cipher: bool) -> Rig {
        let board = board.with_fw_size(flash.fw_size());
        let (port, host) = ScriptPort::new(TransportKind::Uart);

        let mut mux = Multiplexer::new();
        mux.add(Box::new(port));

        let mut bl = Bootloader::new(mux, flash, board, Arc::new(SysTick::self_clocked()));

        if cipher {
            bl = bl.with_cipher(Box::new(SoftAes));
        }

        bl.start(0);

        Rig { bl, host, usb: None }
    }

    fn plain_rig(sectors: &[u32]) -> Rig {
        rig(MemFlash::new(sectors), MemBoard::new(), false)
    }

    fn dual_rig() -> Rig {
        let flash = MemFlash::new(&[64]);
        let board = MemBoard::new().with_fw_size(flash.fw_size());

        let (usb_port, usb) = ScriptPort::new(TransportKind::Usb);
        let (uart_port, uart) = ScriptPort::new(TransportKind::Uart);

        let mut mux = Multiplexer::new();
        mux.add(Box::new(usb_port));
        mux.add(Box::new(uart_port));

        let mut bl = Bootloader::new(mux, flash, board, Arc::new(SysTick::self_clocked()));
        bl.start(0);

        Rig {
            bl,
            host: uart,
            usb: Some(usb),
        }
    }

    impl Rig {
        /// Feeds a byte stream and interprets commands until it runs dry;
        /// returns everything the device transmitted.
        fn exchange(&mut self, stream: &[u8]) -> Vec<u8> {
            assert_eq!(self.pump(stream), None);
            self.host.take_sent()
        }

        /// Like `exchange` but expects the stream to end the session.
        fn exchange_boot(&mut self, stream: &[u8]) -> Vec<u8> {
            assert_eq!(self.pump(stream), Some(Exit::Boot));
            self.host.take_sent()
        }

        fn pump(&mut self, stream: &[u8]) -> Option<Exit> {
            self.host.feed(stream);

            loop {
                // Keep an inactivity return armed regardless of accepted
                // commands, so the pump stops once the stream runs dry;
                // the real disarming rules are asserted separately.
                let mut timeout = 1000;
                self.bl.tick.set(Timer::BlWait, 1000);

                match self.bl.next_command(&mut timeout) {
                    Some(Exit::Timeout) => return None,
                    Some(Exit::Boot) => return Some(Exit::Boot),
                    None => {}
                }
            }
        }

        fn flash(&self) -> &MemFlash {
            self.bl.engine().driver()
        }
    }

    #[test]
    fn it_should_ack_a_handshake() {
        let mut rig = plain_rig(&[64]);

        assert_eq_hex!(rig.exchange(&hex!("21 20")), hex!("12 10"));
    }

    #[test]
    fn it_should_keep_get_sync_idempotent() {
        let mut rig = plain_rig(&[64]);

        let out = rig.exchange(&hex!("21 20 21 20 21 20"));

        assert_eq_hex!(out, hex!("12 10 12 10 12 10"));
        assert_eq!(rig.bl.engine().address(), 64);
        assert_eq!(rig.bl.engine().first_word(), None);
    }

    #[test]
    fn it_should_report_device_info() {
        let flash = MemFlash::new(&[64]);
        let board = MemBoard::new().with_board_type(0x2a).with_board_rev(3);
        let mut rig = rig(flash, board, false);

        // Lock the transport first; a data reply to the very first command
        // would be suppressed along with everything else.
        rig.exchange(&hex!("21 20"));

        assert_eq_hex!(rig.exchange(&hex!("22 01 20")), hex!("07 00 00 00 12 10"));
        assert_eq_hex!(rig.exchange(&hex!("22 02 20")), hex!("2a 00 00 00 12 10"));
        assert_eq_hex!(rig.exchange(&hex!("22 03 20")), hex!("03 00 00 00 12 10"));
        assert_eq_hex!(rig.exchange(&hex!("22 04 20")), hex!("40 00 00 00 12 10"));
    }

    #[test]
    fn it_should_reject_an_unknown_device_info_argument() {
        let mut rig = plain_rig(&[64]);

        let out = rig.exchange(&hex!("21 20 22 06 20"));

        assert_eq_hex!(out, hex!("12 10 12 13"));
    }

    #[test]
    fn it_should_return_the_vector_area() {
        let mut rig = plain_rig(&[64]);

        rig.exchange(&hex!("23 20"));
        let out = rig.exchange(&hex!("22 05 20"));

        assert_eq!(out.len(), 18);
        assert!(out[..16].iter().all(|&byte| byte == 0xff));
        assert_eq!(&out[16..], &[0x12, 0x10]);
    }

    #[test]
    fn it_should_silently_ignore_unknown_opcodes() {
        let mut rig = plain_rig(&[64]);

        let out = rig.exchange(&hex!("21 20 00 01 02 ff"));

        assert_eq_hex!(out, hex!("12 10"));
    }

    #[test]
    fn it_should_stay_silent_before_the_first_accepted_command() {
        let mut rig = plain_rig(&[64]);

        // A malformed GET_DEVICE earns an INVALID, but nothing may go out
        // before a first success has pinned the transport.
        assert!(rig.exchange(&hex!("22")).is_empty());

        assert_eq_hex!(rig.exchange(&hex!("21 20")), hex!("12 10"));
    }

    #[test]
    fn it_should_lock_the_transport_before_the_first_reply() {
        let mut rig = plain_rig(&[64]);

        // DEBUG is acceptable as the very first command and its own OK
        // must already make it out.
        assert_eq_hex!(rig.exchange(&hex!("31")), hex!("12 10"));
    }

    #[test]
    fn it_should_reply_invalid_on_a_missing_eoc() {
        let mut rig = plain_rig(&[64]);

        let out = rig.exchange(&hex!("21 20 21 21"));

        assert_eq_hex!(out, hex!("12 10 12 13"));
    }

    #[test]
    fn it_should_reject_zero_length_programs() {
        let mut rig = plain_rig(&[64]);

        let out = rig.exchange(&hex!("21 20 27 00 20"));

        assert_eq_hex!(out, hex!("12 10 12 13"));
    }

    #[test]
    fn it_should_reject_programming_before_an_erase() {
        let mut rig = plain_rig(&[64]);

        let out = rig.exchange(&hex!("21 20 27 04 ee ee ee ee 20"));

        assert_eq_hex!(out, hex!("12 10 12 13"));
    }

    #[test]
    fn it_should_not_move_the_address_on_a_rejected_program() {
        let mut rig = plain_rig(&[64]);

        rig.exchange(&hex!("21 20 23 20"));
        assert_eq!(rig.bl.engine().address(), 0);

        // Length is not a multiple of four.
        let out = rig.exchange(&hex!("27 06 aa bb cc dd ee ff 20"));

        assert_eq_hex!(out, hex!("12 13"));
        assert_eq!(rig.bl.engine().address(), 0);
        assert_eq!(rig.bl.engine().first_word(), None);
    }

    #[test]
    fn it_should_reply_invalid_when_a_payload_byte_times_out() {
        let mut rig = plain_rig(&[64]);

        rig.exchange(&hex!("21 20 23 20"));
        let out = rig.exchange(&hex!("27 04 aa"));

        assert_eq_hex!(out, hex!("12 13"));
        assert_eq!(rig.bl.engine().address(), 0);
    }

    #[test]
    fn it_should_erase_program_and_boot() {
        let mut rig = plain_rig(&[64]);

        rig.host.feed(&hex!("23 20"));
        rig.host.feed(&hex!("27 08 aa bb cc dd 11 22 33 44 20"));
        rig.host.feed(&hex!("30 20"));

        assert_eq!(rig.bl.run(0), Exit::Boot);
        assert_eq_hex!(rig.host.take_sent(), hex!("12 10 12 10 12 10"));

        assert_eq!(rig.flash().word(0), 0xddcc_bbaa);
        assert_eq!(rig.flash().word(4), 0x4433_2211);
    }

    #[test]
    fn it_should_keep_the_boot_gate_erased_until_boot() {
        let mut rig = plain_rig(&[64]);

        rig.exchange(&hex!("21 20 23 20"));
        rig.exchange(&hex!("27 08 aa bb cc dd 11 22 33 44 20"));

        assert_eq!(rig.flash().word(0), ERASED_WORD);
        assert_eq!(rig.bl.engine().first_word(), Some(0xddcc_bbaa));

        let out = rig.exchange_boot(&hex!("30 20"));

        assert_eq_hex!(out, hex!("12 10"));
        assert_eq!(rig.flash().word(0), 0xddcc_bbaa);
        assert_eq!(rig.bl.engine().first_word(), None);
    }

    #[test]
    fn it_should_substitute_the_first_word_in_get_crc() {
        let mut rig = plain_rig(&[64]);

        rig.exchange(&hex!("21 20 23 20"));
        rig.exchange(&hex!("27 08 aa bb cc dd 11 22 33 44 20"));

        let out = rig.exchange(&hex!("29 20"));

        let mut image = hex!("aa bb cc dd 11 22 33 44").to_vec();
        image.resize(64, 0xff);

        assert_eq!(&out[..4], &crc32(&image, 0).to_le_bytes());
        assert_eq!(&out[4..], &[0x12, 0x10]);
    }

    #[test]
    fn it_should_fail_on_a_write_verify_error_and_keep_running() {
        let mut rig = plain_rig(&[64]);

        rig.exchange(&hex!("21 20 23 20"));
        rig.bl.engine.driver_mut().poison_word(4);

        let out = rig.exchange(&hex!("27 08 aa bb cc dd 11 22 33 44 20"));

        assert_eq_hex!(out, hex!("12 11"));
        assert_eq!(rig.bl.engine().address(), 0);
        assert_eq!(rig.bl.engine().first_word(), None);

        // The session keeps answering afterwards.
        assert_eq_hex!(rig.exchange(&hex!("22 04 20")), hex!("40 00 00 00 12 10"));
    }

    #[test]
    fn it_should_report_bad_silicon() {
        let mut rig = plain_rig(&[64]);

        rig.exchange(&hex!("21 20"));
        rig.bl.board.set_bad_silicon(true);

        assert_eq_hex!(rig.exchange(&hex!("23 20")), hex!("12 14"));
    }

    #[test]
    fn it_should_refuse_encrypted_programming_with_a_zeroed_key() {
        let flash = MemFlash::new(&[64]).with_key([0; 16]);
        let mut rig = rig(flash, MemBoard::new(), true);

        rig.exchange(&hex!("21 20 23 20"));

        let mut stream = vec![0x36];
        stream.extend_from_slice(&IV);
        stream.push(0x20);
        assert_eq_hex!(rig.exchange(&stream), hex!("12 10"));

        let mut stream = vec![0x37, 16];
        stream.extend_from_slice(&[0; 16]);
        stream.push(0x20);
        assert_eq_hex!(rig.exchange(&stream), hex!("12 15"));
    }

    #[test]
    fn it_should_reject_an_encrypted_payload_that_is_not_block_aligned() {
        let flash = MemFlash::new(&[64]).with_key(KEY);
        let mut rig = rig(flash, MemBoard::new(), true);

        rig.exchange(&hex!("21 20 23 20"));

        let out = rig.exchange(&hex!("37 04 ee ee ee ee 20"));

        assert_eq_hex!(out, hex!("12 13"));
        assert_eq!(rig.bl.engine().address(), 0);
    }

    #[test]
    fn it_should_program_an_encrypted_stream_end_to_end() {
        let flash = MemFlash::new(&[64]).with_key(KEY);
        let mut rig = rig(flash, MemBoard::new(), true);

        let image = hex!("aa bb cc dd 11 22 33 44");
        let mut plaintext = Vec::new();
        plaintext.extend_from_slice(&(image.len() as u32).to_le_bytes());
        plaintext.extend_from_slice(&crc32(&image, 0).to_le_bytes());
        plaintext.extend_from_slice(&[0; 8]);
        plaintext.extend_from_slice(&image);
        plaintext.extend_from_slice(&[0xff; 8]);

        let ciphertext = SoftAes::cbc_encrypt(&KEY, &IV, &plaintext);
        assert_eq!(ciphertext.len(), 32);

        rig.exchange(&hex!("21 20 23 20"));

        let mut stream = vec![0x36];
        stream.extend_from_slice(&IV);
        stream.push(0x20);
        stream.push(0x37);
        stream.push(32);
        stream.extend_from_slice(&ciphertext);
        stream.push(0x20);
        stream.extend_from_slice(&hex!("38 20"));

        assert_eq_hex!(rig.exchange(&stream), hex!("12 10 12 10 12 10"));

        // The image is in place with the gate word still deferred.
        assert_eq!(rig.flash().word(0), ERASED_WORD);
        assert_eq!(rig.bl.engine().first_word(), Some(0xddcc_bbaa));
        assert_eq!(rig.flash().word(4), 0x4433_2211);
        assert_eq!(rig.flash().word(8), ERASED_WORD);

        assert_eq_hex!(rig.exchange_boot(&hex!("30 20")), hex!("12 10"));
        assert_eq!(rig.flash().word(0), 0xddcc_bbaa);
    }

    #[test]
    fn it_should_zero_the_key_on_an_unencrypted_program() {
        let flash = MemFlash::new(&[64]).with_key(KEY);
        let mut rig = rig(flash, MemBoard::new(), true);

        rig.exchange(&hex!("21 20 23 20"));
        assert_eq!(rig.bl.engine().key_state(), KeyState::Intact);

        rig.exchange(&hex!("27 04 ee ee ee ee 20"));

        assert_eq!(rig.bl.engine().key_state(), KeyState::Invalid);
    }

    #[test]
    fn it_should_vouch_for_an_intact_key() {
        let flash = MemFlash::new(&[64]).with_key(KEY);
        let mut rig = rig(flash, MemBoard::new(), true);

        assert_eq_hex!(rig.exchange(&hex!("21 20 39 20")), hex!("12 10 12 10"));
    }

    #[test]
    fn it_should_report_bad_key_for_a_zeroed_key() {
        let flash = MemFlash::new(&[64]).with_key([0; 16]);
        let mut rig = rig(flash, MemBoard::new(), true);

        assert_eq_hex!(rig.exchange(&hex!("21 20 39 20")), hex!("12 10 12 15"));
    }

    #[test]
    fn it_should_report_bad_key_without_encryption_support() {
        let mut rig = plain_rig(&[64]);

        assert_eq_hex!(rig.exchange(&hex!("21 20 39 20")), hex!("12 10 12 15"));
    }

    #[test]
    fn it_should_ignore_encrypted_opcodes_without_encryption_support() {
        let mut rig = plain_rig(&[64]);

        let out = rig.exchange(&hex!("21 20 36 20 37 20 38 20"));

        assert_eq_hex!(out, hex!("12 10"));
    }

    #[test]
    fn it_should_ignore_set_delay_without_a_signature_region() {
        let mut rig = plain_rig(&[64]);

        let out = rig.exchange(&hex!("21 20 2d 05 20"));

        assert_eq_hex!(out, hex!("12 10"));
    }

    #[test]
    fn it_should_fail_set_delay_without_the_signature() {
        let flash = MemFlash::new(&[64]);
        let board = MemBoard::new().with_boot_delay_addr(32);
        let mut rig = rig(flash, board, false);

        rig.exchange(&hex!("21 20 23 20"));

        assert_eq_hex!(rig.exchange(&hex!("2d 05 20")), hex!("12 11"));
    }

    #[test]
    fn it_should_write_the_boot_delay() {
        let flash = MemFlash::new(&[64]);
        let board = MemBoard::new().with_boot_delay_addr(32);
        let mut rig = rig(flash, board, false);

        rig.exchange(&hex!("21 20 23 20"));
        rig.bl.engine.driver_mut().preload_word(32, proto::BOOT_DELAY_SIGNATURE1);
        rig.bl.engine.driver_mut().preload_word(36, proto::BOOT_DELAY_SIGNATURE2);

        assert_eq_hex!(rig.exchange(&hex!("2d 0a 20")), hex!("12 10"));
        assert_eq!(
            rig.flash().word(32),
            (proto::BOOT_DELAY_SIGNATURE1 & 0xffff_ff00) | 10
        );
    }

    #[test]
    fn it_should_reject_an_out_of_range_boot_delay() {
        let flash = MemFlash::new(&[64]);
        let board = MemBoard::new().with_boot_delay_addr(32);
        let mut rig = rig(flash, board, false);

        rig.exchange(&hex!("21 20"));

        assert_eq_hex!(rig.exchange(&hex!("2d 1f 20")), hex!("12 13"));
    }

    #[test]
    fn it_should_report_chip_identity() {
        let mut rig = plain_rig(&[64]);

        let out = rig.exchange(&hex!("21 20 2c 20"));

        assert_eq!(&out[..2], &[0x12, 0x10]);
        assert_eq!(&out[2..6], &0x1000_6413u32.to_le_bytes());
        assert_eq!(&out[6..], &[0x12, 0x10]);
    }

    #[test]
    fn it_should_describe_the_chip_in_ascii() {
        let mut rig = plain_rig(&[64]);

        rig.exchange(&hex!("21 20"));
        let out = rig.exchange(&hex!("2e 20"));

        let len = u32::from_le_bytes([out[0], out[1], out[2], out[3]]) as usize;

        assert_eq!(&out[4..4 + len], b"STM32F40x,rev C");
        assert_eq!(&out[4 + len..], &[0x12, 0x10]);
    }

    #[test]
    fn it_should_read_otp_and_serial_words() {
        let mut rig = plain_rig(&[64]);

        rig.exchange(&hex!("21 20"));

        let out = rig.exchange(&hex!("2a 02 00 00 00 20"));
        assert_eq!(&out[..4], &0x0072_4f54u32.to_le_bytes());
        assert_eq!(&out[4..], &[0x12, 0x10]);

        let out = rig.exchange(&hex!("2b 01 00 00 00 20"));
        assert_eq!(&out[..4], &0x3531_3132u32.to_le_bytes());
        assert_eq!(&out[4..], &[0x12, 0x10]);
    }

    #[test]
    fn it_should_return_on_inactivity() {
        let mut rig = plain_rig(&[64]);

        assert_eq!(rig.bl.run(1000), Exit::Timeout);
    }

    #[test]
    fn it_should_disarm_the_inactivity_return_after_a_command() {
        let mut rig = plain_rig(&[64]);
        let mut timeout = rig.bl.start(1000);

        rig.host.feed(&hex!("21 20"));

        assert_eq!(rig.bl.next_command(&mut timeout), None);
        assert_eq!(timeout, 0);
    }

    #[test]
    fn it_should_keep_the_inactivity_return_armed_after_an_invalid_command() {
        let mut rig = plain_rig(&[64]);
        let mut timeout = rig.bl.start(1000);

        rig.host.feed(&hex!("21 21"));

        assert_eq!(rig.bl.next_command(&mut timeout), None);
        assert_eq!(timeout, 1000);
    }

    #[test]
    fn it_should_reset_session_state_on_re_entry() {
        let mut rig = plain_rig(&[64]);

        rig.exchange(&hex!("21 20 23 20"));
        rig.exchange(&hex!("27 04 ee ee ee ee 20"));

        assert_eq!(rig.bl.mux.locked(), Some(TransportKind::Uart));
        assert_eq!(rig.bl.engine().address(), 4);

        // Re-entering behaves like a power cycle: nothing pinned, nothing
        // pending, and programming requires a fresh erase.
        assert_eq!(rig.bl.run(50), Exit::Timeout);

        assert_eq!(rig.bl.mux.locked(), None);
        assert_eq!(rig.bl.engine().address(), 64);
        assert_eq!(rig.bl.engine().first_word(), None);
    }

    #[test]
    fn it_should_never_write_to_the_unlocked_transport() {
        let mut rig = dual_rig();

        assert_eq_hex!(rig.exchange(&hex!("21 20")), hex!("12 10"));
        assert_eq!(rig.bl.mux.locked(), Some(TransportKind::Uart));

        // A host retrying on the USB port gets drained, never answered.
        let usb = rig.usb.take().unwrap();
        usb.feed(&hex!("21 20"));
        rig.pump(&[]);

        assert!(usb.take_sent().is_empty());
        assert_eq!(usb.pending(), 0);
        assert!(rig.host.take_sent().is_empty());
    }
}
