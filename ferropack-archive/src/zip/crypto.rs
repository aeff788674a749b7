//! Traditional PKWARE (ZipCrypto) encryption.
//!
//! A weak three-key stream cipher kept for legacy compatibility only. The
//! 12-byte encryption header carries eleven random bytes plus one check byte;
//! on decryption the check byte is compared against the high byte of the
//! entry CRC-32 (or of the DOS time when a data descriptor is in use).

use ferropack_core::error::{ArchiveError, ErrorCode, Result};
use rand::RngCore;

/// CRC-32 table for the key-update function (same polynomial as the file CRC).
const CRC32_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0usize;
    while i < 256 {
        let mut crc = i as u32;
        let mut j = 0;
        while j < 8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB88320;
            } else {
                crc >>= 1;
            }
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
};

#[inline]
fn crc32_update(crc: u32, byte: u8) -> u32 {
    CRC32_TABLE[((crc ^ u32::from(byte)) & 0xFF) as usize] ^ (crc >> 8)
}

/// Size of the encryption header.
pub const ENCRYPTION_HEADER_SIZE: usize = 12;

/// The ZipCrypto stream cipher state.
#[derive(Debug, Clone)]
pub struct ZipCrypto {
    key0: u32,
    key1: u32,
    key2: u32,
}

impl ZipCrypto {
    /// Initialize the key state from a password.
    #[must_use]
    pub fn new(password: &[u8]) -> Self {
        let mut cipher = Self {
            key0: 0x12345678,
            key1: 0x23456789,
            key2: 0x34567890,
        };
        for &byte in password {
            cipher.update_keys(byte);
        }
        cipher
    }

    #[inline]
    fn update_keys(&mut self, byte: u8) {
        self.key0 = crc32_update(self.key0, byte);
        self.key1 = self
            .key1
            .wrapping_add(self.key0 & 0xFF)
            .wrapping_mul(134_775_813)
            .wrapping_add(1);
        self.key2 = crc32_update(self.key2, (self.key1 >> 24) as u8);
    }

    #[inline]
    fn stream_byte(&self) -> u8 {
        let temp = (self.key2 | 2) as u16;
        (temp.wrapping_mul(temp ^ 1) >> 8) as u8
    }

    /// Encrypt one byte.
    #[inline]
    pub fn encrypt_byte(&mut self, byte: u8) -> u8 {
        let cipher_byte = byte ^ self.stream_byte();
        self.update_keys(byte);
        cipher_byte
    }

    /// Decrypt one byte.
    #[inline]
    pub fn decrypt_byte(&mut self, byte: u8) -> u8 {
        let plain = byte ^ self.stream_byte();
        self.update_keys(plain);
        plain
    }

    /// Decrypt a buffer in place.
    pub fn decrypt_buffer(&mut self, buffer: &mut [u8]) {
        for byte in buffer.iter_mut() {
            *byte = self.decrypt_byte(*byte);
        }
    }

    /// Encrypt a buffer in place.
    pub fn encrypt_buffer(&mut self, buffer: &mut [u8]) {
        for byte in buffer.iter_mut() {
            *byte = self.encrypt_byte(*byte);
        }
    }

    /// Produce the 12-byte encrypted header for writing.
    ///
    /// `check_word` is the value whose high byte the reader will verify:
    /// the CRC-32 of the plaintext, or `dos_time << 16` when a data
    /// descriptor is used.
    pub fn generate_header(&mut self, check_word: u32) -> [u8; ENCRYPTION_HEADER_SIZE] {
        let mut header = [0u8; ENCRYPTION_HEADER_SIZE];
        let mut random = [0u8; ENCRYPTION_HEADER_SIZE - 1];
        rand::rngs::OsRng.fill_bytes(&mut random);
        for (slot, &byte) in header.iter_mut().zip(random.iter()) {
            *slot = self.encrypt_byte(byte);
        }
        header[11] = self.encrypt_byte((check_word >> 24) as u8);
        header
    }

    /// Decrypt and verify the 12-byte header against the check word.
    pub fn consume_header(
        &mut self,
        header: &[u8; ENCRYPTION_HEADER_SIZE],
        check_word: u32,
    ) -> Result<()> {
        let mut last = 0u8;
        for &byte in header.iter() {
            last = self.decrypt_byte(byte);
        }
        if last != (check_word >> 24) as u8 {
            return Err(ArchiveError::security(
                ErrorCode::ZipBadPassword,
                "password check byte mismatch",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_roundtrip() {
        let mut enc = ZipCrypto::new(b"secret");
        let mut dec = ZipCrypto::new(b"secret");
        let plaintext = b"Attack at dawn.";
        let encrypted: Vec<u8> = plaintext.iter().map(|&b| enc.encrypt_byte(b)).collect();
        assert_ne!(&encrypted[..], plaintext);
        let decrypted: Vec<u8> = encrypted.iter().map(|&b| dec.decrypt_byte(b)).collect();
        assert_eq!(&decrypted, plaintext);
    }

    #[test]
    fn test_header_roundtrip() {
        let crc = 0xDEADBEEFu32;
        let mut writer = ZipCrypto::new(b"pw");
        let header = writer.generate_header(crc);

        let mut reader = ZipCrypto::new(b"pw");
        reader.consume_header(&header, crc).unwrap();

        // After the header, both sides are in the same key state.
        let mut data = *b"synchronized";
        writer.encrypt_buffer(&mut data);
        reader.decrypt_buffer(&mut data);
        assert_eq!(&data, b"synchronized");
    }

    #[test]
    fn test_wrong_password_rejected() {
        // The check byte is a 1-in-256 filter, so sample several headers to
        // keep this deterministic in practice.
        let crc = 0x11223344u32;
        let mut rejections = 0;
        for _ in 0..8 {
            let mut writer = ZipCrypto::new(b"right");
            let header = writer.generate_header(crc);
            let mut reader = ZipCrypto::new(b"wrong");
            if let Err(err) = reader.consume_header(&header, crc) {
                assert_eq!(err.code(), ErrorCode::ZipBadPassword);
                rejections += 1;
            }
        }
        assert!(rejections >= 7);
    }

    #[test]
    fn test_known_key_schedule() {
        // Key state after an empty password is the documented initial state.
        let cipher = ZipCrypto::new(b"");
        assert_eq!(cipher.key0, 0x12345678);
        assert_eq!(cipher.key1, 0x23456789);
        assert_eq!(cipher.key2, 0x34567890);
    }
}
