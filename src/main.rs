//! `fmuboot-sim`: presents the bootloader on a real serial device, backed
//! by an in-memory flash, so host-side uploaders can be exercised against
//! it end to end.

use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use std::{fs, thread};

use anyhow::Context;
use log::{debug, info, warn};
use structopt::StructOpt;

use fmuboot::sim::{MemBoard, MemFlash, SoftAes, DEFAULT_SECTORS};
use fmuboot::timer::SysTick;
use fmuboot::transport::{Multiplexer, RingBuffer, Transport, TransportKind};
use fmuboot::{Bootloader, Error};

#[derive(StructOpt, Debug)]
pub struct Opts {
    /// The serial device to present the bootloader on
    #[structopt(
        env = "SERIAL_PORT",
        short = "p",
        long = "port",
        default_value = "/dev/ttyUSB0"
    )]
    serial_port: String,

    /// The serial baud rate to use
    #[structopt(
        env = "BAUD_RATE",
        short = "b",
        long = "baud-rate",
        default_value = "115200"
    )]
    baud_rate: u32,

    /// Inactivity timeout in milliseconds before trying to boot the
    /// existing application; 0 stays in the bootloader forever
    #[structopt(long = "timeout", default_value = "5000")]
    timeout: u32,

    /// The board type reported to the host
    #[structopt(long = "board-id", default_value = "9")]
    board_id: u32,

    /// The board revision reported to the host
    #[structopt(long = "board-rev", default_value = "0")]
    board_rev: u32,

    /// Hex-encoded 16-byte AES key to provision the key region with
    #[structopt(long = "key")]
    key: Option<String>,

    /// Run without encryption support, like a bootloader built without it
    #[structopt(long = "no-encryption")]
    no_encryption: bool,

    /// An application image to preload into the simulated flash
    #[structopt(long = "image")]
    image: Option<PathBuf>,

    /// Where to save the flash contents after the boot hand-off
    #[structopt(long = "save")]
    save: Option<PathBuf>,
}

/// The UART transport of the simulator: a reader thread stands in for the
/// receive interrupt and fills the ring, replies go straight out the port.
struct SerialLink {
    rx: Arc<RingBuffer>,
    port: Box<dyn serialport::SerialPort>,
}

impl Transport for SerialLink {
    fn kind(&self) -> TransportKind {
        TransportKind::Uart
    }

    fn poll_byte(&mut self) -> Option<u8> {
        self.rx.pop()
    }

    fn write(&mut self, buf: &[u8]) {
        if let Err(err) = self.port.write_all(buf) {
            warn!("serial write failed: {}", err);
        }
    }
}

fn reader_thread(mut port: Box<dyn serialport::SerialPort>, rx: Arc<RingBuffer>, run: Arc<AtomicBool>) {
    let mut buf = [0; 64];

    while run.load(Ordering::SeqCst) {
        match port.read(&mut buf) {
            Ok(count) => {
                for &byte in &buf[..count] {
                    if !rx.push(byte) {
                        warn!("receive ring overrun, byte dropped");
                    }
                }
            }
            Err(ref err) if err.kind() == io::ErrorKind::TimedOut => {}
            Err(err) => {
                warn!("serial read failed: {}", err);
                break;
            }
        }
    }
}

/// Parses a hex-encoded 16-byte key.
fn parse_key(hex: &str) -> Result<[u8; 16], Error> {
    let hex: String = hex.chars().filter(|c| !c.is_whitespace()).collect();

    if hex.len() != 32 {
        return Err(Error::KeyLength(hex.len() / 2));
    }

    let mut key = [0; 16];

    for (index, byte) in key.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[index * 2..index * 2 + 2], 16)
            .map_err(|_| Error::InvalidHex(hex.clone()))?;
    }

    Ok(key)
}

fn main() -> Result<(), anyhow::Error> {
    pretty_env_logger::init();

    let opts = Opts::from_args();

    let mut flash = MemFlash::new(&DEFAULT_SECTORS);

    if let Some(key) = &opts.key {
        flash = flash.with_key(parse_key(key)?);
    }

    if let Some(path) = &opts.image {
        let image = fs::read(path)
            .with_context(|| format!("Failed to read image '{}'", path.display()))?;

        flash.load_image(&image)?;
        info!("preloaded {} byte image from '{}'", image.len(), path.display());
    }

    let fw_size = flash.fw_size();
    let board = Arc::new(
        MemBoard::new()
            .with_fw_size(fw_size)
            .with_board_type(opts.board_id)
            .with_board_rev(opts.board_rev),
    );

    let settings = serialport::SerialPortSettings {
        baud_rate: opts.baud_rate,
        timeout: Duration::from_millis(10),
        ..Default::default()
    };
    let port = serialport::open_with_settings(&opts.serial_port, &settings)
        .with_context(|| format!("Failed to open serial port '{}'", opts.serial_port))?;

    let run = Arc::new(AtomicBool::new(true));
    let rx = Arc::new(RingBuffer::new());
    let tick = Arc::new(SysTick::new());

    {
        let reader_port = port.try_clone().context("Failed to clone the serial port")?;
        let rx = rx.clone();
        let run = run.clone();

        thread::spawn(move || reader_thread(reader_port, rx, run));
    }

    {
        let tick = tick.clone();
        let board = board.clone();
        let run = run.clone();

        thread::spawn(move || {
            while run.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(1));
                tick.tick(&board);
            }
        });
    }

    let mut mux = Multiplexer::new();
    mux.add(Box::new(SerialLink { rx, port }));

    let mut bootloader = Bootloader::new(mux, flash, board, tick);

    if !opts.no_encryption {
        bootloader = bootloader.with_cipher(Box::new(SoftAes));
    }

    info!(
        "bootloader on {} at {} baud, {} byte flashable area",
        opts.serial_port, opts.baud_rate, fw_size
    );

    // The reset handler's loop: run a session, then try to boot whatever
    // application is present; an unbootable image drops us straight back
    // into the bootloader.
    let exit = loop {
        let exit = bootloader.run(opts.timeout);
        debug!("session ended: {:?}", exit);

        if bootloader.engine().bootable() {
            break exit;
        }

        info!("no bootable application, staying in the bootloader");
    };

    // Quiesce like the jump would: interface down, tick off, flash locked.
    bootloader.quiesce();
    run.store(false, Ordering::SeqCst);

    let stack_top = bootloader.engine().driver().word(0);
    let entry = bootloader.engine().driver().word(4);

    info!(
        "hand-off after {:?}: sp={:#010x} entry={:#010x}",
        exit, stack_top, entry
    );

    if let Some(path) = &opts.save {
        fs::write(path, bootloader.engine().driver().image())
            .with_context(|| format!("Failed to save flash image to '{}'", path.display()))?;

        info!("saved flash image to '{}'", path.display());
    }

    Ok(())
}
