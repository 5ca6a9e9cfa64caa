//! miIO payload encryption and decryption.
//! AES-128-CBC with a key and IV derived from the 16-byte device token.

use crate::error::{MiioError, Result};
use aes::Aes128;
use cbc::{Decryptor, Encryptor};
use cipher::block_padding::Pkcs7;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use md5::{Digest, Md5};

const BLOCK_LEN: usize = 16;

/// TokenCipher encrypts and decrypts miIO payloads for one device token.
///
/// `key = MD5(token)` and `iv = MD5(key || token)`.
pub struct TokenCipher {
    /// Raw 16-byte device token
    token: [u8; 16],
    /// AES key, MD5(token)
    key: [u8; 16],
    /// Initialization vector shared by every message
    iv: [u8; 16],
}

impl TokenCipher {
    /// Create a new TokenCipher from a 16-byte token.
    pub fn new(token: &[u8]) -> Result<Self> {
        if token.len() != 16 {
            return Err(MiioError::Config(format!(
                "token must be 16 bytes, got {}",
                token.len()
            )));
        }
        let mut t = [0u8; 16];
        t.copy_from_slice(token);

        let mut key = [0u8; 16];
        key.copy_from_slice(&Md5::digest(t));
        let mut hasher = Md5::new();
        hasher.update(key);
        hasher.update(t);
        let mut iv = [0u8; 16];
        iv.copy_from_slice(&hasher.finalize());

        Ok(Self { token: t, key, iv })
    }

    /// Raw token bytes, needed for the packet checksum.
    pub fn token(&self) -> &[u8; 16] {
        &self.token
    }

    /// Encrypt data, applying PKCS7 padding.
    pub fn encrypt(&self, data: &[u8]) -> Vec<u8> {
        Encryptor::<Aes128>::new(&self.key.into(), &self.iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(data)
    }

    /// Decrypt data and strip PKCS7 padding.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.is_empty() || !data.len().is_multiple_of(BLOCK_LEN) {
            return Err(MiioError::Protocol(format!(
                "ciphertext length {} is not a positive multiple of {}",
                data.len(),
                BLOCK_LEN
            )));
        }
        Decryptor::<Aes128>::new(&self.key.into(), &self.iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(data)
            .map_err(|_| MiioError::Protocol("invalid padding".into()))
    }
}
