//! WinZip AES encryption (AE-1 / AE-2).
//!
//! Keys come from PBKDF2-HMAC-SHA1 with 1000 iterations, producing
//! `encKey || authKey || verifier` sized by the AES strength. Payloads are
//! AES-CTR with a little-endian 128-bit counter starting at one, and the
//! ciphertext is authenticated by the first ten bytes of an HMAC-SHA1.
//! The password verifier and the authentication code are both compared in
//! constant time.

use aes::cipher::{KeyIvInit, StreamCipher};
use ferropack_core::error::{ArchiveError, ErrorCode, Result};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

/// PBKDF2 iteration count fixed by the WinZip AE specification.
const PBKDF2_ROUNDS: u32 = 1000;

/// Length of the truncated HMAC-SHA1 authentication code.
pub const AUTH_CODE_LEN: usize = 10;

/// Length of the password verifier.
pub const VERIFIER_LEN: usize = 2;

/// AES key strength from the 0x9901 extra field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AesStrength {
    /// AES-128.
    Aes128,
    /// AES-192.
    Aes192,
    /// AES-256.
    Aes256,
}

impl AesStrength {
    /// Decode the strength byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Aes128),
            2 => Some(Self::Aes192),
            3 => Some(Self::Aes256),
            _ => None,
        }
    }

    /// The strength byte.
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Aes128 => 1,
            Self::Aes192 => 2,
            Self::Aes256 => 3,
        }
    }

    /// AES key length in bytes.
    pub fn key_len(self) -> usize {
        match self {
            Self::Aes128 => 16,
            Self::Aes192 => 24,
            Self::Aes256 => 32,
        }
    }

    /// Salt length in bytes (half the key length).
    pub fn salt_len(self) -> usize {
        self.key_len() / 2
    }

    /// Total PBKDF2 output: encryption key, auth key, verifier.
    pub fn derived_len(self) -> usize {
        self.key_len() * 2 + VERIFIER_LEN
    }
}

/// Compare two byte strings without early exit.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

enum AnyCtr {
    Aes128(ctr::Ctr128LE<aes::Aes128>),
    Aes192(ctr::Ctr128LE<aes::Aes192>),
    Aes256(ctr::Ctr128LE<aes::Aes256>),
}

impl AnyCtr {
    fn new(strength: AesStrength, key: &[u8]) -> Self {
        // Counter starts at 1, little-endian, per the WinZip specification.
        let iv = 1u128.to_le_bytes();
        match strength {
            AesStrength::Aes128 => Self::Aes128(ctr::Ctr128LE::<aes::Aes128>::new(
                key.into(),
                iv.as_slice().into(),
            )),
            AesStrength::Aes192 => Self::Aes192(ctr::Ctr128LE::<aes::Aes192>::new(
                key.into(),
                iv.as_slice().into(),
            )),
            AesStrength::Aes256 => Self::Aes256(ctr::Ctr128LE::<aes::Aes256>::new(
                key.into(),
                iv.as_slice().into(),
            )),
        }
    }

    fn apply_keystream(&mut self, data: &mut [u8]) {
        match self {
            Self::Aes128(cipher) => cipher.apply_keystream(data),
            Self::Aes192(cipher) => cipher.apply_keystream(data),
            Self::Aes256(cipher) => cipher.apply_keystream(data),
        }
    }
}

/// One derived encryption context (per entry and direction).
pub struct AesContext {
    cipher: AnyCtr,
    mac: HmacSha1,
    verifier: [u8; VERIFIER_LEN],
}

impl AesContext {
    /// Derive keys for an entry from its password, salt, and strength.
    pub fn new(password: &[u8], salt: &[u8], strength: AesStrength) -> Result<Self> {
        let mut derived = vec![0u8; strength.derived_len()];
        pbkdf2::pbkdf2_hmac::<Sha1>(password, salt, PBKDF2_ROUNDS, &mut derived);
        let key_len = strength.key_len();
        let mac = HmacSha1::new_from_slice(&derived[key_len..key_len * 2]).map_err(|_| {
            ArchiveError::structural(ErrorCode::ZipBadHeader, "HMAC key derivation failed")
        })?;
        let mut verifier = [0u8; VERIFIER_LEN];
        verifier.copy_from_slice(&derived[key_len * 2..]);
        Ok(Self {
            cipher: AnyCtr::new(strength, &derived[..key_len]),
            mac,
            verifier,
        })
    }

    /// Generate a fresh random salt for writing.
    pub fn generate_salt(strength: AesStrength) -> Vec<u8> {
        let mut salt = vec![0u8; strength.salt_len()];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        salt
    }

    /// The two-byte password verifier derived from the password.
    pub fn verifier(&self) -> [u8; VERIFIER_LEN] {
        self.verifier
    }

    /// Check a stored verifier in constant time.
    pub fn verifier_matches(&self, stored: &[u8]) -> bool {
        constant_time_eq(&self.verifier, stored)
    }

    /// Decrypt ciphertext in place, feeding the HMAC first.
    pub fn decrypt(&mut self, data: &mut [u8]) {
        self.mac.update(data);
        self.cipher.apply_keystream(data);
    }

    /// Encrypt plaintext in place, feeding the HMAC with the ciphertext.
    pub fn encrypt(&mut self, data: &mut [u8]) {
        self.cipher.apply_keystream(data);
        self.mac.update(data);
    }

    /// Finalize the truncated authentication code.
    pub fn finalize_auth(self) -> [u8; AUTH_CODE_LEN] {
        let digest = self.mac.finalize().into_bytes();
        let mut code = [0u8; AUTH_CODE_LEN];
        code.copy_from_slice(&digest[..AUTH_CODE_LEN]);
        code
    }

    /// Verify a stored authentication code in constant time.
    pub fn verify_auth(self, stored: &[u8]) -> Result<()> {
        let code = self.finalize_auth();
        if !constant_time_eq(&code, stored) {
            return Err(ArchiveError::integrity(
                ErrorCode::ZipAuthFailed,
                "AES authentication code mismatch",
            ));
        }
        Ok(())
    }
}
