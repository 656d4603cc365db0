// Copyright (C) Microsoft Corporation. All rights reserved.

//! HMAC (RFC 2104) on top of the resumable SHA state.

use sep_interface::HashMode;

use super::sha;
use super::sha::ShaState;

const IPAD: u8 = 0x36;
const OPAD: u8 = 0x5c;

/// Precomputes the inner and outer states for `key`.
///
/// Keys longer than the block size are hashed first.
pub fn init(mode: HashMode, key: &[u8]) -> (ShaState, ShaState) {
    let block = mode.block_size();
    let mut padded = if key.len() > block {
        sha::digest(mode, key)
    } else {
        key.to_vec()
    };
    padded.resize(block, 0);

    let ipad: Vec<u8> = padded.iter().map(|b| b ^ IPAD).collect();
    let opad: Vec<u8> = padded.iter().map(|b| b ^ OPAD).collect();

    let mut inner = ShaState::new(mode);
    let mut outer = ShaState::new(mode);
    inner.absorb(&ipad);
    outer.absorb(&opad);
    (inner, outer)
}

/// Completes the MAC.
///
/// # Arguments
/// * `inner` - Inner state after the absorbed message blocks
/// * `outer` - Outer state from [`init`]
/// * `tail` - Unabsorbed message bytes
/// * `inner_len` - Bytes absorbed by `inner` so far, including the key block
pub fn finish(
    mode: HashMode,
    inner: ShaState,
    outer: ShaState,
    tail: &[u8],
    inner_len: u64,
) -> Vec<u8> {
    let inner_digest = inner.finish(mode, tail, inner_len + tail.len() as u64);
    let outer_len = (mode.block_size() + inner_digest.len()) as u64;
    outer.finish(mode, &inner_digest, outer_len)
}
