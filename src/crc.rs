//! CRC-32 over flash contents.
//!
//! This is the IEEE 802.3 checksum in its reflected form (polynomial
//! `0xEDB88320`), but seeded with zero and without the final complement so
//! that a sum can be resumed word by word while sweeping flash.

use std::sync::OnceLock;

fn table() -> &'static [u32; 256] {
    static TABLE: OnceLock<[u32; 256]> = OnceLock::new();

    TABLE.get_or_init(|| {
        let mut table = [0u32; 256];

        for (i, entry) in table.iter_mut().enumerate() {
            let mut c = i as u32;

            for _ in 0..8 {
                if c & 1 != 0 {
                    c = 0xedb8_8320 ^ (c >> 1);
                } else {
                    c >>= 1;
                }
            }

            *entry = c;
        }

        table
    })
}

/// Folds `bytes` into the running sum `state` and returns the new sum.
///
/// Passing the result back in as `state` continues the same checksum, so
/// `crc32(b, crc32(a, 0))` equals `crc32(ab, 0)`.
pub fn crc32(bytes: &[u8], state: u32) -> u32 {
    let table = table();

    bytes.iter().fold(state, |state, &byte| {
        table[((state ^ byte as u32) & 0xff) as usize] ^ (state >> 8)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Bit-by-bit reference implementation used as the oracle for the
    /// table-driven version.
    fn crc32_bitwise(bytes: &[u8], state: u32) -> u32 {
        let mut crc = state;

        for byte in bytes {
            crc ^= *byte as u32;

            for _ in 0..8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xedb8_8320;
                } else {
                    crc >>= 1;
                }
            }
        }

        crc
    }

    #[test]
    fn it_should_leave_the_state_unchanged_for_empty_input() {
        assert_eq!(crc32(&[], 0), 0);
        assert_eq!(crc32(&[], 0xdead_beef), 0xdead_beef);
    }

    #[test]
    fn it_should_match_the_bitwise_reference() {
        let samples: &[&[u8]] = &[
            b"123456789",
            &[0x00],
            &[0xff; 16],
            b"\xaa\xbb\xcc\xdd\x11\x22\x33\x44",
        ];

        for sample in samples {
            assert_eq!(crc32(sample, 0), crc32_bitwise(sample, 0));
        }
    }

    #[test]
    fn it_should_resume_a_running_sum() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let (head, tail) = data.split_at(17);

        assert_eq!(crc32(tail, crc32(head, 0)), crc32(data, 0));
    }

    #[test]
    fn it_should_depend_on_the_seed() {
        assert_ne!(crc32(b"123456789", 0), crc32(b"123456789", 1));
    }
}
