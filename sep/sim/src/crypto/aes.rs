// Copyright (C) Microsoft Corporation. All rights reserved.

//! AES block cipher and the ECB, CBC and CTR modes.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::BlockDecrypt;
use aes::cipher::BlockEncrypt;
use aes::cipher::KeyInit;
use aes::Aes128;
use aes::Aes192;
use aes::Aes256;
use sep_interface::CipherMode;
use sep_interface::CryptoDirection;
use sep_interface::DeviceStatus;
use sep_interface::AES_BLOCK_SIZE;

/// One AES block.
pub type Block = [u8; AES_BLOCK_SIZE];

/// AES keyed for any of the three key sizes.
pub enum AesKey {
    /// AES-128
    Aes128(Aes128),

    /// AES-192
    Aes192(Aes192),

    /// AES-256
    Aes256(Aes256),
}

impl AesKey {
    /// Expands a key.
    ///
    /// # Error
    /// * `DeviceStatus::BadCtx` - The key size is not 16, 24 or 32 bytes
    pub fn new(key: &[u8]) -> Result<Self, DeviceStatus> {
        let key = match key.len() {
            16 => Aes128::new_from_slice(key).map(AesKey::Aes128),
            24 => Aes192::new_from_slice(key).map(AesKey::Aes192),
            32 => Aes256::new_from_slice(key).map(AesKey::Aes256),
            _ => Err(DeviceStatus::BadCtx)?,
        };
        key.map_err(|_| DeviceStatus::BadCtx)
    }

    /// Encrypts one block.
    pub fn encrypt(&self, block: &Block) -> Block {
        let mut buf = GenericArray::clone_from_slice(block);
        match self {
            AesKey::Aes128(c) => c.encrypt_block(&mut buf),
            AesKey::Aes192(c) => c.encrypt_block(&mut buf),
            AesKey::Aes256(c) => c.encrypt_block(&mut buf),
        }
        let mut out = [0; AES_BLOCK_SIZE];
        out.copy_from_slice(&buf);
        out
    }

    /// Decrypts one block.
    pub fn decrypt(&self, block: &Block) -> Block {
        let mut buf = GenericArray::clone_from_slice(block);
        match self {
            AesKey::Aes128(c) => c.decrypt_block(&mut buf),
            AesKey::Aes192(c) => c.decrypt_block(&mut buf),
            AesKey::Aes256(c) => c.decrypt_block(&mut buf),
        }
        let mut out = [0; AES_BLOCK_SIZE];
        out.copy_from_slice(&buf);
        out
    }
}

/// XORs `b` into `a`.
pub fn xor_block(a: &mut Block, b: &[u8]) {
    a.iter_mut().zip(b).for_each(|(x, y)| *x ^= y);
}

/// Increments a big-endian counter held in the last `width` bytes of `block`.
pub fn increment_counter(block: &mut Block, width: usize) {
    for byte in block.iter_mut().rev().take(width) {
        let (next, carry) = byte.overflowing_add(1);
        *byte = next;
        if !carry {
            break;
        }
    }
}

fn to_block(chunk: &[u8]) -> Block {
    let mut block = [0; AES_BLOCK_SIZE];
    block[..chunk.len()].copy_from_slice(chunk);
    block
}

/// Runs a cipher mode over `data`, chaining through `iv`.
///
/// # Arguments
/// * `key` - Expanded key
/// * `mode` - ECB, CBC or CTR
/// * `direction` - Encrypt or decrypt
/// * `iv` - Chaining value or counter, updated in place
/// * `data` - Input; must be whole blocks unless `last` is set in CTR mode
/// * `last` - This is the final call for the context
///
/// # Error
/// * `DeviceStatus::InvalDataSize` - The input is not block aligned
pub fn cipher(
    key: &AesKey,
    mode: CipherMode,
    direction: CryptoDirection,
    iv: &mut Block,
    data: &[u8],
    last: bool,
) -> Result<Vec<u8>, DeviceStatus> {
    let partial_ok = last && mode == CipherMode::Ctr;
    if data.len() % AES_BLOCK_SIZE != 0 && !partial_ok {
        tracing::debug!(len = data.len(), ?mode, "Input not block aligned");
        Err(DeviceStatus::InvalDataSize)?
    }

    let mut out = Vec::with_capacity(data.len());
    for chunk in data.chunks(AES_BLOCK_SIZE) {
        let block = to_block(chunk);
        let result = match (mode, direction) {
            (CipherMode::Ecb, CryptoDirection::Encrypt) => key.encrypt(&block),
            (CipherMode::Ecb, CryptoDirection::Decrypt) => key.decrypt(&block),
            (CipherMode::Cbc, CryptoDirection::Encrypt) => {
                let mut x = block;
                xor_block(&mut x, iv);
                let c = key.encrypt(&x);
                *iv = c;
                c
            }
            (CipherMode::Cbc, CryptoDirection::Decrypt) => {
                let mut p = key.decrypt(&block);
                xor_block(&mut p, iv);
                *iv = block;
                p
            }
            (CipherMode::Ctr, _) => {
                let mut ks = key.encrypt(iv);
                increment_counter(iv, AES_BLOCK_SIZE);
                xor_block(&mut ks, &block);
                ks
            }
        };
        out.extend_from_slice(&result[..chunk.len()]);
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use test_with_tracing::test;

    use super::*;

    // FIPS-197 C.1
    #[test]
    fn test_aes128_known_answer() {
        let key: Vec<u8> = (0u8..16).collect();
        let pt: Block = [
            0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd,
            0xee, 0xff,
        ];
        let ct: Block = [
            0x69, 0xc4, 0xe0, 0xd8, 0x6a, 0x7b, 0x04, 0x30, 0xd8, 0xcd, 0xb7, 0x80, 0x70, 0xb4,
            0xc5, 0x5a,
        ];

        let key = AesKey::new(&key).unwrap();
        assert_eq!(key.encrypt(&pt), ct);
        assert_eq!(key.decrypt(&ct), pt);
    }

    #[test]
    fn test_bad_key_size() {
        assert!(matches!(AesKey::new(&[0; 20]), Err(DeviceStatus::BadCtx)));
    }

    #[test]
    fn test_counter_wraps_within_width() {
        let mut block = [0xff; AES_BLOCK_SIZE];
        block[13] = 0x01;
        increment_counter(&mut block, 2);
        assert_eq!(&block[13..], &[0x01, 0x00, 0x00]);
    }

    #[test]
    fn test_cbc_split_matches_single_pass() {
        let key = AesKey::new(&[7; 32]).unwrap();
        let data = [0x5a; 64];

        let mut iv1 = [1; AES_BLOCK_SIZE];
        let whole = cipher(&key, CipherMode::Cbc, CryptoDirection::Encrypt, &mut iv1, &data, true).unwrap();

        let mut iv2 = [1; AES_BLOCK_SIZE];
        let mut split = cipher(&key, CipherMode::Cbc, CryptoDirection::Encrypt, &mut iv2, &data[..32], false).unwrap();
        split.extend(cipher(&key, CipherMode::Cbc, CryptoDirection::Encrypt, &mut iv2, &data[32..], true).unwrap());

        assert_eq!(whole, split);
        assert_eq!(iv1, iv2);
    }

    #[test]
    fn test_partial_block_only_on_last_ctr() {
        let key = AesKey::new(&[7; 16]).unwrap();
        let mut iv = [0; AES_BLOCK_SIZE];
        assert_eq!(
            cipher(&key, CipherMode::Ctr, CryptoDirection::Encrypt, &mut iv, &[0; 5], false),
            Err(DeviceStatus::InvalDataSize)
        );
        assert_eq!(
            cipher(&key, CipherMode::Cbc, CryptoDirection::Encrypt, &mut iv, &[0; 5], true),
            Err(DeviceStatus::InvalDataSize)
        );
        assert_eq!(
            cipher(&key, CipherMode::Ctr, CryptoDirection::Encrypt, &mut iv, &[0; 5], true)
                .unwrap()
                .len(),
            5
        );
    }
}
