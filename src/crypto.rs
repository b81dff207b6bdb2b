//! AES-128-CBC decryption of encrypted upload streams.
//!
//! Only the single-block primitive is abstracted; the CBC chaining lives
//! here so the IV handling is explicit and identical on every platform. The
//! key is passed per call because it is read out of the flash key region at
//! the moment of use - a key that was zeroed mid-session decrypts to
//! garbage rather than silently using stale material.

use byteorder::{ByteOrder, LittleEndian};

/// Whether the key region still holds key material.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum KeyState {
    /// At least one key byte is nonzero.
    Intact,
    /// Every key byte is zero; encrypted programming is refused.
    Invalid,
}

/// The AES-128 single-block primitive.
pub trait Aes128 {
    /// Decrypts one 16-byte block in place with `key` (plain ECB; the CBC
    /// whitening is applied by the caller).
    fn decrypt_block(&self, key: &[u8; 16], block: &mut [u8; 16]);
}

/// Size of the header carried in the first decrypted block of a stream.
pub const STREAM_HEADER_LEN: usize = 16;

/// The first 16 decrypted bytes of an encrypted upload.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct StreamHeader {
    /// Number of bytes that will be flashed and checksummed.
    pub num_to_flash: u32,
    /// CRC-32 the flashed bytes must sum to.
    pub crc32_expected: u32,
    pub reserved1: u32,
    pub reserved2: u32,
}

impl StreamHeader {
    /// Reads a header from the start of a decrypted buffer.
    pub fn parse(buf: &[u8]) -> StreamHeader {
        StreamHeader {
            num_to_flash: LittleEndian::read_u32(&buf[0..4]),
            crc32_expected: LittleEndian::read_u32(&buf[4..8]),
            reserved1: LittleEndian::read_u32(&buf[8..12]),
            reserved2: LittleEndian::read_u32(&buf[12..16]),
        }
    }
}

/// Decrypts `ciphertext` into `plaintext`, advancing `iv` as it goes.
///
/// Per 16-byte block: `P = AES_DECRYPT(C) xor IV`, then `IV <- C`, so a
/// stream may be split across packets at any block boundary and chaining
/// carries over.
pub fn cbc_decrypt(
    cipher: &dyn Aes128,
    key: &[u8; 16],
    iv: &mut [u8; 16],
    ciphertext: &[u8],
    plaintext: &mut [u8],
) {
    debug_assert!(ciphertext.len() % 16 == 0);
    debug_assert!(plaintext.len() >= ciphertext.len());

    for (index, chunk) in ciphertext.chunks_exact(16).enumerate() {
        let mut block = [0; 16];
        block.copy_from_slice(chunk);

        cipher.decrypt_block(key, &mut block);

        for (byte, prev) in block.iter_mut().zip(iv.iter()) {
            *byte ^= prev;
        }

        iv.copy_from_slice(chunk);
        plaintext[index * 16..index * 16 + 16].copy_from_slice(&block);
    }
}
