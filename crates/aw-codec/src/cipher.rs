//! Symmetric payload encryption: AES-CBC with PKCS7 padding.
//!
//! The IV is generated per message and prepended to the ciphertext, so the
//! decrypting side needs only the key. A fixed IV can be configured for
//! deterministic output in tests; production paths leave it unset.

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use rand::RngCore;

use crate::CodecError;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const IV_LENGTH: usize = 16;

/// Parameters for channel payload encryption.
///
/// Only AES-CBC is supported; the key length (128 or 256 bits) is implied by
/// the key material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherParams {
    pub algorithm: String,
    pub mode: String,
    pub key: Vec<u8>,
    /// Fixed IV for deterministic test vectors; None means a fresh random IV
    /// per message.
    pub iv: Option<Vec<u8>>,
}

impl CipherParams {
    /// AES-CBC params from raw key material (16 or 32 bytes).
    pub fn aes_cbc(key: Vec<u8>) -> Result<Self, CodecError> {
        if key.len() != 16 && key.len() != 32 {
            return Err(CodecError::CipherFailure(format!(
                "AES key must be 16 or 32 bytes, got {}",
                key.len()
            )));
        }
        Ok(CipherParams {
            algorithm: "aes".to_owned(),
            mode: "cbc".to_owned(),
            key,
            iv: None,
        })
    }

    /// Fix the IV (tests only; reusing an IV in production weakens CBC).
    pub fn with_iv(mut self, iv: Vec<u8>) -> Self {
        self.iv = Some(iv);
        self
    }

    /// Fresh random key material of the given bit length (128 or 256).
    pub fn generate_key(bits: usize) -> Result<Vec<u8>, CodecError> {
        if bits != 128 && bits != 256 {
            return Err(CodecError::CipherFailure(format!(
                "unsupported key length {bits}"
            )));
        }
        let mut key = vec![0u8; bits / 8];
        rand::thread_rng().fill_bytes(&mut key);
        Ok(key)
    }

    pub fn key_length_bits(&self) -> usize {
        self.key.len() * 8
    }

    /// The `<algorithm>-<keybits>-<mode>` part of the encoding label,
    /// e.g. `aes-128-cbc`.
    pub fn cipher_spec(&self) -> String {
        format!("{}-{}-{}", self.algorithm, self.key_length_bits(), self.mode)
    }
}

/// A configured cipher: encrypts to `iv || ciphertext`, decrypts the same.
#[derive(Debug, Clone)]
pub struct AesCbcCipher {
    params: CipherParams,
}

impl AesCbcCipher {
    pub fn new(params: CipherParams) -> Result<Self, CodecError> {
        if params.algorithm != "aes" || params.mode != "cbc" {
            return Err(CodecError::CipherFailure(format!(
                "unsupported cipher {}-{}",
                params.algorithm, params.mode
            )));
        }
        if params.key.len() != 16 && params.key.len() != 32 {
            return Err(CodecError::CipherFailure(format!(
                "AES key must be 16 or 32 bytes, got {}",
                params.key.len()
            )));
        }
        if let Some(iv) = &params.iv {
            if iv.len() != IV_LENGTH {
                return Err(CodecError::CipherFailure(format!(
                    "IV must be {IV_LENGTH} bytes, got {}",
                    iv.len()
                )));
            }
        }
        Ok(AesCbcCipher { params })
    }

    pub fn cipher_spec(&self) -> String {
        self.params.cipher_spec()
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CodecError> {
        let iv = match &self.params.iv {
            Some(iv) => iv.clone(),
            None => {
                let mut iv = vec![0u8; IV_LENGTH];
                rand::thread_rng().fill_bytes(&mut iv);
                iv
            }
        };

        let ciphertext = match self.params.key.len() {
            16 => Aes128CbcEnc::new_from_slices(&self.params.key, &iv)
                .map_err(|e| CodecError::CipherFailure(e.to_string()))?
                .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
            _ => Aes256CbcEnc::new_from_slices(&self.params.key, &iv)
                .map_err(|e| CodecError::CipherFailure(e.to_string()))?
                .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        };

        let mut out = iv;
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn decrypt(&self, payload: &[u8]) -> Result<Vec<u8>, CodecError> {
        if payload.len() < IV_LENGTH || (payload.len() - IV_LENGTH) % IV_LENGTH != 0 {
            return Err(CodecError::CipherFailure(format!(
                "ciphertext length {} is not iv + whole blocks",
                payload.len()
            )));
        }
        let (iv, ciphertext) = payload.split_at(IV_LENGTH);

        let plaintext = match self.params.key.len() {
            16 => Aes128CbcDec::new_from_slices(&self.params.key, iv)
                .map_err(|e| CodecError::CipherFailure(e.to_string()))?
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                .map_err(|e| CodecError::CipherFailure(e.to_string()))?,
            _ => Aes256CbcDec::new_from_slices(&self.params.key, iv)
                .map_err(|e| CodecError::CipherFailure(e.to_string()))?
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                .map_err(|e| CodecError::CipherFailure(e.to_string()))?,
        };
        Ok(plaintext)
    }
}
