// Copyright (C) Microsoft Corporation. All rights reserved.

//! AES-CMAC (NIST SP 800-38B).

use sep_interface::DeviceStatus;
use sep_interface::AES_BLOCK_SIZE;

use super::aes::xor_block;
use super::aes::AesKey;
use super::aes::Block;

fn dbl(block: &Block) -> Block {
    let mut out = [0; AES_BLOCK_SIZE];
    let mut carry = 0;
    for i in (0..AES_BLOCK_SIZE).rev() {
        out[i] = (block[i] << 1) | carry;
        carry = block[i] >> 7;
    }
    if block[0] & 0x80 != 0 {
        out[AES_BLOCK_SIZE - 1] ^= 0x87;
    }
    out
}

/// Derives the two CMAC subkeys.
pub fn subkeys(key: &AesKey) -> (Block, Block) {
    let l = key.encrypt(&[0; AES_BLOCK_SIZE]);
    let k1 = dbl(&l);
    let k2 = dbl(&k1);
    (k1, k2)
}

/// Chains whole blocks into `chain`.
///
/// # Error
/// * `DeviceStatus::InvalDataSize` - `data` is not block aligned
pub fn update(key: &AesKey, chain: &mut Block, data: &[u8]) -> Result<(), DeviceStatus> {
    if data.len() % AES_BLOCK_SIZE != 0 {
        Err(DeviceStatus::InvalDataSize)?
    }

    for block in data.chunks_exact(AES_BLOCK_SIZE) {
        xor_block(chain, block);
        *chain = key.encrypt(chain);
    }
    Ok(())
}

/// Processes the final bytes and returns the tag.
///
/// Everything except the last (possibly partial) block of `tail` is chained
/// first, so `tail` may be of any length.
pub fn finish(key: &AesKey, chain: &mut Block, k1: &Block, k2: &Block, tail: &[u8]) -> Block {
    let split = tail.len().saturating_sub(1) / AES_BLOCK_SIZE * AES_BLOCK_SIZE;
    let (body, last) = tail.split_at(split);
    for block in body.chunks_exact(AES_BLOCK_SIZE) {
        xor_block(chain, block);
        *chain = key.encrypt(chain);
    }

    let mut m = [0; AES_BLOCK_SIZE];
    m[..last.len()].copy_from_slice(last);
    if last.len() == AES_BLOCK_SIZE {
        xor_block(&mut m, k1);
    } else {
        m[last.len()] = 0x80;
        xor_block(&mut m, k2);
    }

    xor_block(chain, &m);
    key.encrypt(chain)
}
