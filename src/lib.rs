//! Device-side implementation of the PX4 serial flash-update protocol,
//! revision 7.
//!
//! The crate is split the way the hardware is: [`session`] holds the
//! protocol interpreter and the session loop, [`flash`] the programming
//! engine, [`transport`] the byte streams it talks over, and every hardware
//! dependency is a trait ([`flash::FlashDriver`], [`transport::Transport`],
//! [`board::Board`], [`crypto::Aes128`]) so the whole protocol can be
//! driven from a scripted byte stream. The [`sim`] module provides the
//! in-memory implementations backing the test suite and the `fmuboot-sim`
//! binary.

pub mod board;
pub mod crc;
pub mod crypto;
mod error;
pub mod flash;
pub mod proto;
pub mod session;
pub mod sim;
pub mod timer;
pub mod transport;

pub use error::Error;

pub use board::{Board, BoardInfo};
pub use session::{Bootloader, Exit};
