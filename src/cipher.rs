//! Block cipher providers backed by the RustCrypto crates.
//!
//! One provider exists per cipher family and is selected by [`KeyType`].
use aes::cipher::block_padding::NoPadding;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipher, StreamCipherSeek};

use crate::error::{Error, Result};
use crate::scheme::{KeyType, BLOCK_SIZE};

/// Cipher primitives used by the sample pipeline.
///
/// CBC calls process whole blocks only and return the IV that continues the
/// chain (the last ciphertext block).
pub trait CipherProvider: Send + Sync {
    /// Cipher family implemented by this provider.
    fn key_type(&self) -> KeyType;

    /// XOR `data` with the CTR keystream starting `offset` bytes into the
    /// stream seeded by `iv`. Encryption and decryption are the same call.
    fn ctr_apply(&self, key: &[u8], iv: &[u8; 16], offset: u64, data: &mut [u8]) -> Result<()>;

    /// Decrypt whole blocks in place.
    fn cbc_decrypt(&self, key: &[u8], iv: &[u8; 16], data: &mut [u8]) -> Result<[u8; 16]>;

    /// Encrypt whole blocks in place. Only packagers and fixtures need this.
    fn cbc_encrypt(&self, key: &[u8], iv: &[u8; 16], data: &mut [u8]) -> Result<[u8; 16]>;
}

/// Provider for the given cipher family.
pub fn provider_for(key_type: KeyType) -> &'static dyn CipherProvider {
    match key_type {
        KeyType::Aes128 => &Aes128Provider,
        KeyType::Sm4 => &Sm4Provider,
    }
}

fn check_blocks(data: &[u8]) -> Result<()> {
    if data.len() % BLOCK_SIZE != 0 {
        return Err(Error::CipherFailure(format!(
            "CBC input length {} is not a multiple of {}",
            data.len(),
            BLOCK_SIZE
        )));
    }
    Ok(())
}

fn last_block(data: &[u8]) -> [u8; 16] {
    let mut block = [0u8; 16];
    block.copy_from_slice(&data[data.len() - BLOCK_SIZE..]);
    block
}

fn invalid_length(key_type: KeyType, key: &[u8]) -> Error {
    Error::CipherFailure(format!(
        "invalid {:?} key length {} (expected 16) or IV length",
        key_type,
        key.len()
    ))
}

macro_rules! block_cipher_provider {
    ($(#[$meta:meta])* $name:ident, $cipher:ty, $key_type:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default)]
        pub struct $name;

        impl CipherProvider for $name {
            fn key_type(&self) -> KeyType {
                $key_type
            }

            fn ctr_apply(
                &self,
                key: &[u8],
                iv: &[u8; 16],
                offset: u64,
                data: &mut [u8],
            ) -> Result<()> {
                let mut cipher = ctr::Ctr128BE::<$cipher>::new_from_slices(key, iv)
                    .map_err(|_| invalid_length($key_type, key))?;
                if data.is_empty() {
                    return Ok(());
                }
                cipher
                    .try_seek(offset)
                    .map_err(|e| Error::CipherFailure(format!("CTR seek failed: {}", e)))?;
                cipher
                    .try_apply_keystream(data)
                    .map_err(|e| Error::CipherFailure(format!("CTR keystream exhausted: {}", e)))
            }

            fn cbc_decrypt(&self, key: &[u8], iv: &[u8; 16], data: &mut [u8]) -> Result<[u8; 16]> {
                check_blocks(data)?;
                let decryptor = cbc::Decryptor::<$cipher>::new_from_slices(key, iv)
                    .map_err(|_| invalid_length($key_type, key))?;
                if data.is_empty() {
                    return Ok(*iv);
                }
                // The chain continues from the last ciphertext block.
                let next_iv = last_block(data);
                decryptor
                    .decrypt_padded_mut::<NoPadding>(data)
                    .map_err(|e| Error::CipherFailure(format!("CBC decrypt failed: {:?}", e)))?;
                Ok(next_iv)
            }

            fn cbc_encrypt(&self, key: &[u8], iv: &[u8; 16], data: &mut [u8]) -> Result<[u8; 16]> {
                check_blocks(data)?;
                let encryptor = cbc::Encryptor::<$cipher>::new_from_slices(key, iv)
                    .map_err(|_| invalid_length($key_type, key))?;
                if data.is_empty() {
                    return Ok(*iv);
                }
                let len = data.len();
                encryptor
                    .encrypt_padded_mut::<NoPadding>(data, len)
                    .map_err(|e| Error::CipherFailure(format!("CBC encrypt failed: {:?}", e)))?;
                Ok(last_block(data))
            }
        }
    };
}

block_cipher_provider!(
    /// AES-128 in CTR and CBC modes.
    Aes128Provider,
    aes::Aes128,
    KeyType::Aes128
);

block_cipher_provider!(
    /// SM4 in CTR and CBC modes.
    Sm4Provider,
    sm4::Sm4,
    KeyType::Sm4
);
