use std::{
    cmp,
    convert::TryInto,
};

use aes::{Aes128, Aes256};
use block_padding::{NoPadding, Padding, Pkcs7};
use cbc::{Decryptor, Encryptor};
use cipher::{BlockDecrypt, BlockDecryptMut, BlockEncryptMut, KeyInit, KeyIvInit};
use cipher::generic_array::{ArrayLength, GenericArray, typenum::{U16, U32, Unsigned}};
use thiserror::Error;

/// Block size for FUS protocol payloads (nonces, signatures)
pub type BlockSize = U32;
/// Key size for FUS protocol payloads
pub type KeySize = U32;
/// Block size of encrypted firmware files
pub type FileBlockSize = U16;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Fixed key has incorrect length")]
    IncorrectFixedKeyLength,
    #[error("Flexible key suffix has incorrect length")]
    IncorrectFlexibleKeySuffixLength,
    #[error("Ciphertext is not a multiple of the block size")]
    CiphertextNotAligned,
}

/// Key material needed to talk to FUS. Neither key ships with this crate; the
/// caller supplies both.
#[derive(Clone, Debug)]
pub struct FusKeys {
    pub fixed_key: [u8; 32],
    pub flexible_key_suffix: [u8; 16],
}

impl FusKeys {
    /// Load keys from the specified byte slices. The fixed key should be 32
    /// bytes and the flexible key suffix should be 16 bytes.
    pub fn new(
        fixed_key: &[u8],
        flexible_key_suffix: &[u8],
    ) -> Result<Self, CryptoError> {
        Ok(Self {
            fixed_key: fixed_key.try_into()
                .map_err(|_| CryptoError::IncorrectFixedKeyLength)?,
            flexible_key_suffix: flexible_key_suffix.try_into()
                .map_err(|_| CryptoError::IncorrectFlexibleKeySuffixLength)?,
        })
    }

    /// Derive the "flexible key" used to sign a nonce: each byte of the base
    /// selects `fixed_key[byte % 16]`, followed by the hardcoded suffix.
    pub fn get_flexible_key(&self, key_base: &[u8]) -> Vec<u8> {
        key_base.iter()
            .map(|x| self.fixed_key[(x % 16) as usize])
            .chain(self.flexible_key_suffix.iter().copied())
            .collect()
    }
}

/// Scramble `data` using the 16-byte `seed`: each seed byte picks
/// `data[(byte & 0xf) % data.len()]`. FUS uses this both for the
/// `<LOGIC_CHECK>` request field and for the V4 firmware key.
pub fn logic_check(seed: &[u8], data: &[u8]) -> String {
    if data.is_empty() {
        return String::new();
    }

    seed.iter()
        .map(|c| data[(*c as usize & 0xf) % data.len()] as char)
        .collect()
}

/// Pad byte array to specified block size and optionally truncate to one block.
fn pad<B: ArrayLength<u8>>(mut data: &[u8], truncate_to_block_size: bool) -> Vec<u8> {
    let block_size = B::USIZE;

    if truncate_to_block_size {
        data = &data[..cmp::min(data.len(), block_size)];
    }
    let mut buf = data.to_vec();

    if data.is_empty() || data.len() % block_size != 0 {
        buf.resize((data.len() / block_size + 1) * block_size, 0);

        let last_block_offset = buf.len() - block_size;
        let last_block = &mut buf[last_block_offset..];
        let ga_last_block = GenericArray::<u8, B>::from_mut_slice(last_block);
        Pkcs7::pad(ga_last_block, data.len() % block_size);
    }

    buf
}

/// AES-256-CBC the way FUS expects it for session payloads:
/// * The key is PKCS#7 padded to 32 bytes if it is too short or truncated to
///   32 bytes if it is too long. The IV is the first 16 bytes of that key.
/// * The data uses a 32-byte block size and is PKCS#7 padded to the next
///   32-byte boundary. On decryption, trailing bytes that look like padding
///   are removed; genuine data that happens to look like padding cannot be
///   told apart.
pub struct FusAes256 {
    dec: Decryptor<Aes256>,
    enc: Encryptor<Aes256>,
}

impl FusAes256 {
    pub fn new(key: &[u8]) -> Self {
        let padded_key = pad::<KeySize>(key, true);
        let key = GenericArray::from_slice(&padded_key);
        let iv = GenericArray::from_slice(&padded_key[..16]);

        Self {
            dec: Decryptor::<Aes256>::new(key, iv),
            enc: Encryptor::<Aes256>::new(key, iv),
        }
    }

    /// Encrypt the provided plaintext data. The data will be PKCS#7 padded to
    /// the next 32-byte boundary.
    pub fn encrypt(self, data: &[u8]) -> Vec<u8> {
        let mut buf = pad::<BlockSize>(data, false);
        let buf_size = buf.len();

        self.enc.encrypt_padded_mut::<NoPadding>(&mut buf, buf_size)
            .expect("buffer is padded to a whole number of blocks");

        buf
    }

    /// Decrypt the provided FUS ciphertext. The returned plain text will be
    /// PKCS#7 unpadded.
    pub fn decrypt(self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut plaintext = self.dec.decrypt_padded_vec_mut::<NoPadding>(data)
            .map_err(|_| CryptoError::CiphertextNotAligned)?;

        if plaintext.len() % BlockSize::USIZE != 0 {
            return Err(CryptoError::CiphertextNotAligned);
        }

        if !plaintext.is_empty() {
            let last_block_offset = plaintext.len() - BlockSize::USIZE;
            let last_block = &mut plaintext[last_block_offset..];
            let ga_last_block = GenericArray::<u8, BlockSize>::from_mut_slice(last_block);

            let plaintext_len = match Pkcs7::unpad(ga_last_block) {
                Ok(s) => last_block_offset + s.len(),
                Err(_) => plaintext.len(), // Assume unpadded
            };

            plaintext.truncate(plaintext_len);
        }
        Ok(plaintext)
    }
}

/// Cipher for encrypted firmware files: plain AES-128-ECB without padding.
#[derive(Clone)]
pub struct FileCipher(Aes128);

impl FileCipher {
    pub fn new(key: &[u8; 16]) -> Self {
        Self(Aes128::new(GenericArray::from_slice(key)))
    }

    /// Decrypt whole blocks in place. The buffer length must be a multiple of
    /// [`FileBlockSize`].
    pub fn decrypt_in_place(&self, buf: &mut [u8]) -> Result<(), CryptoError> {
        if buf.len() % FileBlockSize::USIZE != 0 {
            return Err(CryptoError::CiphertextNotAligned);
        }

        for block in buf.chunks_exact_mut(FileBlockSize::USIZE) {
            self.0.decrypt_block(GenericArray::from_mut_slice(block));
        }

        Ok(())
    }
}
