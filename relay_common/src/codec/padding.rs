//! Constant-time PKCS#7 unpadding.
//!
//! The block-padding crate rejects bad padding as soon as it sees a wrong
//! byte, which leaks the padding length through timing. Here every byte of the
//! final block is inspected regardless of the outcome.

use subtle::{Choice, ConstantTimeEq, ConstantTimeGreater, ConstantTimeLess};

/// Validates the PKCS#7 padding of a decrypted buffer and returns the
/// plaintext without it.
///
/// `block_len` must be between 1 and 255. Returns `None` when the buffer is
/// empty, not a whole number of blocks, or carries invalid padding.
pub fn strip_pkcs7(buf: &[u8], block_len: usize) -> Option<&[u8]> {
    if block_len == 0 || block_len > u8::MAX as usize {
        return None;
    }
    let len = buf.len();
    if len == 0 || len % block_len != 0 {
        return None;
    }

    let pad = buf[len - 1];
    let mut valid: Choice = pad.ct_gt(&0u8) & !pad.ct_gt(&(block_len as u8));

    for i in 0..block_len {
        let byte = buf[len - 1 - i];
        let inside_padding = (i as u8).ct_lt(&pad);
        valid &= !inside_padding | byte.ct_eq(&pad);
    }

    if bool::from(valid) {
        Some(&buf[..len - pad as usize])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_full_block_of_padding() {
        let mut buf = b"0123456789abcdef".to_vec();
        buf.extend_from_slice(&[16u8; 16]);
        assert_eq!(strip_pkcs7(&buf, 16), Some(&b"0123456789abcdef"[..]));
    }

    #[test]
    fn test_strip_partial_padding() {
        let mut buf = b"hello".to_vec();
        buf.extend_from_slice(&[11u8; 11]);
        assert_eq!(strip_pkcs7(&buf, 16), Some(&b"hello"[..]));
    }

    #[test]
    fn test_rejects_zero_pad_byte() {
        let mut buf = vec![7u8; 15];
        buf.push(0);
        assert_eq!(strip_pkcs7(&buf, 16), None);
    }

    #[test]
    fn test_rejects_pad_larger_than_block() {
        let buf = vec![17u8; 16];
        assert_eq!(strip_pkcs7(&buf, 16), None);
    }

    #[test]
    fn test_rejects_inconsistent_padding() {
        let mut buf = b"hello world!".to_vec();
        buf.extend_from_slice(&[4, 4, 3, 4]);
        assert_eq!(strip_pkcs7(&buf, 16), None);
    }

    #[test]
    fn test_rejects_partial_block() {
        assert_eq!(strip_pkcs7(&[1u8; 15], 16), None);
        assert_eq!(strip_pkcs7(&[], 16), None);
    }
}
