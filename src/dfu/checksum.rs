//! CRC-32 helpers shared by the object state machine and the settings store.

use crc::{Crc, CRC_32_ISO_HDLC};

/// CRC-32 as used by the DFU protocol (ISO-HDLC, same as zlib).
pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// CRC-32 of `data`.
pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// Extend a finished CRC-32 with more bytes.
///
/// `crc32_continue(crc32(a), b) == crc32(a ++ b)`, and a previous value of 0
/// stands for "no bytes yet".
pub fn crc32_continue(previous: u32, data: &[u8]) -> u32 {
    // Undo the final xor and hand the register back in unreflected form.
    let mut digest = CRC32.digest_with_initial((!previous).reverse_bits());
    digest.update(data);
    digest.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_check_value() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32(&[]), 0);
    }

    #[test]
    fn test_crc32_continue_from_zero() {
        assert_eq!(crc32_continue(0, b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn test_crc32_continue_is_chunking_independent() {
        let data: Vec<u8> = (0..1000u32).map(|i| (i * 7 % 251) as u8).collect();
        let whole = crc32(&data);

        for chunk_size in [1, 3, 64, 333, 1000] {
            let crc = data
                .chunks(chunk_size)
                .fold(0, |crc, chunk| crc32_continue(crc, chunk));
            assert_eq!(crc, whole, "chunk size {}", chunk_size);
        }
    }
}
