// Copyright (C) Microsoft Corporation. All rights reserved.

//! Module for SHA.
//!
//! Exposes the raw compression functions so a partially hashed message can be
//! stored in a context blob and resumed later.

use sep_interface::HashMode;
use sep_interface::DeviceStatus;
use sha2::digest::generic_array::GenericArray;

/// Largest block size of the supported algorithms.
pub const MAX_BLOCK_SIZE: usize = 128;

/// Size of a serialized chaining state.
pub const STATE_SIZE: usize = 64;

const SHA1_IV: [u32; 5] = [0x67452301, 0xefcdab89, 0x98badcfe, 0x10325476, 0xc3d2e1f0];

const SHA224_IV: [u32; 8] = [
    0xc1059ed8, 0x367cd507, 0x3070dd17, 0xf70e5939, 0xffc00b31, 0x68581511, 0x64f98fa7, 0xbefa4fa4,
];

const SHA256_IV: [u32; 8] = [
    0x6a09e667, 0xbb67ae85, 0x3c6ef372, 0xa54ff53a, 0x510e527f, 0x9b05688c, 0x1f83d9ab, 0x5be0cd19,
];

const SHA384_IV: [u64; 8] = [
    0xcbbb9d5dc1059ed8,
    0x629a292a367cd507,
    0x9159015a3070dd17,
    0x152fecd8f70e5939,
    0x67332667ffc00b31,
    0x8eb44a8768581511,
    0xdb0c2e0d64f98fa7,
    0x47b5481dbefa4fa4,
];

const SHA512_IV: [u64; 8] = [
    0x6a09e667f3bcc908,
    0xbb67ae8584caa73b,
    0x3c6ef372fe94f82b,
    0xa54ff53a5f1d36f1,
    0x510e527fade682d1,
    0x9b05688c2b3e6c1f,
    0x1f83d9abfb41bd6b,
    0x5be0cd19137e2179,
];

/// Chaining state of a SHA computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShaState {
    /// SHA-1
    Sha1([u32; 5]),

    /// SHA-224 and SHA-256
    Sha256([u32; 8]),

    /// SHA-384 and SHA-512
    Sha512([u64; 8]),
}

impl ShaState {
    /// Returns the initial state of `mode`.
    pub fn new(mode: HashMode) -> Self {
        match mode {
            HashMode::Sha1 => ShaState::Sha1(SHA1_IV),
            HashMode::Sha224 => ShaState::Sha256(SHA224_IV),
            HashMode::Sha256 => ShaState::Sha256(SHA256_IV),
            HashMode::Sha384 => ShaState::Sha512(SHA384_IV),
            HashMode::Sha512 => ShaState::Sha512(SHA512_IV),
        }
    }

    /// Restores a state written by [`ShaState::store`].
    pub fn load(mode: HashMode, raw: &[u8; STATE_SIZE]) -> Self {
        let mut state = Self::new(mode);
        match &mut state {
            ShaState::Sha1(words) => words
                .iter_mut()
                .zip(raw.chunks_exact(4))
                .for_each(|(w, b)| *w = u32::from_be_bytes([b[0], b[1], b[2], b[3]])),
            ShaState::Sha256(words) => words
                .iter_mut()
                .zip(raw.chunks_exact(4))
                .for_each(|(w, b)| *w = u32::from_be_bytes([b[0], b[1], b[2], b[3]])),
            ShaState::Sha512(words) => words.iter_mut().zip(raw.chunks_exact(8)).for_each(|(w, b)| {
                let mut be = [0; 8];
                be.copy_from_slice(b);
                *w = u64::from_be_bytes(be)
            }),
        }
        state
    }

    /// Serializes the state.
    pub fn store(&self) -> [u8; STATE_SIZE] {
        let mut raw = [0; STATE_SIZE];
        let bytes: Vec<u8> = match self {
            ShaState::Sha1(words) => words.iter().flat_map(|w| w.to_be_bytes()).collect(),
            ShaState::Sha256(words) => words.iter().flat_map(|w| w.to_be_bytes()).collect(),
            ShaState::Sha512(words) => words.iter().flat_map(|w| w.to_be_bytes()).collect(),
        };
        raw[..bytes.len()].copy_from_slice(&bytes);
        raw
    }

    /// Returns the block size of the compression function.
    pub fn block_size(&self) -> usize {
        match self {
            ShaState::Sha512(_) => 128,
            _ => 64,
        }
    }

    /// Absorbs whole blocks.
    ///
    /// # Error
    /// * `DeviceStatus::InvalDataSize` - `data` is not a multiple of the block size
    pub fn compress(&mut self, data: &[u8]) -> Result<(), DeviceStatus> {
        if data.len() % self.block_size() != 0 {
            Err(DeviceStatus::InvalDataSize)?
        }

        self.absorb(data);
        Ok(())
    }

    pub(crate) fn absorb(&mut self, data: &[u8]) {
        match self {
            ShaState::Sha1(state) => data
                .chunks_exact(64)
                .for_each(|b| sha1::compress(state, std::slice::from_ref(GenericArray::from_slice(b)))),
            ShaState::Sha256(state) => data
                .chunks_exact(64)
                .for_each(|b| sha2::compress256(state, std::slice::from_ref(GenericArray::from_slice(b)))),
            ShaState::Sha512(state) => data
                .chunks_exact(128)
                .for_each(|b| sha2::compress512(state, std::slice::from_ref(GenericArray::from_slice(b)))),
        }
    }

    /// Pads and absorbs the trailing bytes and returns the digest.
    ///
    /// # Arguments
    /// * `mode` - Algorithm, selects the digest truncation
    /// * `tail` - Bytes not yet absorbed, any length
    /// * `total_len` - Message length in bytes including everything absorbed earlier
    pub fn finish(mut self, mode: HashMode, tail: &[u8], total_len: u64) -> Vec<u8> {
        let block = self.block_size();
        let whole = tail.len() - tail.len() % block;
        let (body, rest) = tail.split_at(whole);

        let mut last = rest.to_vec();
        last.push(0x80);
        let len_field = if block == 128 { 16 } else { 8 };
        while (last.len() + len_field) % block != 0 {
            last.push(0);
        }
        let bits = u128::from(total_len) * 8;
        last.extend_from_slice(&bits.to_be_bytes()[16 - len_field..]);

        self.absorb(body);
        self.absorb(&last);

        let mut digest = self.store().to_vec();
        digest.truncate(mode.digest_size());
        digest
    }
}

/// Hashes a complete message.
pub fn digest(mode: HashMode, data: &[u8]) -> Vec<u8> {
    ShaState::new(mode).finish(mode, data, data.len() as u64)
}

#[cfg(test)]
mod tests {
    use sha2::Digest;
    use test_with_tracing::test;

    use super::*;

    const MODES: [HashMode; 5] = [
        HashMode::Sha1,
        HashMode::Sha224,
        HashMode::Sha256,
        HashMode::Sha384,
        HashMode::Sha512,
    ];

    fn reference(mode: HashMode, data: &[u8]) -> Vec<u8> {
        match mode {
            HashMode::Sha1 => sha1::Sha1::digest(data).to_vec(),
            HashMode::Sha224 => sha2::Sha224::digest(data).to_vec(),
            HashMode::Sha256 => sha2::Sha256::digest(data).to_vec(),
            HashMode::Sha384 => sha2::Sha384::digest(data).to_vec(),
            HashMode::Sha512 => sha2::Sha512::digest(data).to_vec(),
        }
    }

    #[test]
    fn test_digest_matches_reference() {
        for len in [0usize, 1, 55, 56, 64, 111, 112, 128, 300] {
            let data: Vec<u8> = (0..len).map(|i| i as u8).collect();
            for mode in MODES {
                assert_eq!(digest(mode, &data), reference(mode, &data), "{mode:?} len {len}");
            }
        }
    }

    #[test]
    fn test_resume_from_stored_state() {
        let data = [0xa5u8; 300];
        for mode in MODES {
            let block = mode.block_size();
            let mut state = ShaState::new(mode);
            state.compress(&data[..block]).unwrap();

            let resumed = ShaState::load(mode, &state.store());
            assert_eq!(resumed, state);
            assert_eq!(
                resumed.finish(mode, &data[block..], data.len() as u64),
                reference(mode, &data)
            );
        }
    }

    #[test]
    fn test_partial_block_rejected() {
        let mut state = ShaState::new(HashMode::Sha256);
        assert_eq!(state.compress(&[0; 63]), Err(DeviceStatus::InvalDataSize));
    }
}
