// Copyright (C) Microsoft Corporation. All rights reserved.

//! AES-CCM (NIST SP 800-38C), processed incrementally.

use sep_interface::DeviceStatus;
use sep_interface::AES_BLOCK_SIZE;

use super::aes::increment_counter;
use super::aes::xor_block;
use super::aes::AesKey;
use super::aes::Block;

/// Running CCM computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CcmState {
    /// CBC-MAC chaining value
    pub mac: Block,

    /// Next counter block
    pub ctr: Block,

    /// Width of the counter field (15 - nonce length)
    pub q: usize,
}

fn counter_block(nonce: &[u8], q: usize, index: u64) -> Block {
    let mut block = [0; AES_BLOCK_SIZE];
    block[0] = (q - 1) as u8;
    block[1..1 + nonce.len()].copy_from_slice(nonce);
    let be = index.to_be_bytes();
    let width = q.min(8);
    block[AES_BLOCK_SIZE - width..].copy_from_slice(&be[8 - width..]);
    block
}

impl CcmState {
    /// Starts a computation and absorbs the formatted associated data.
    ///
    /// # Arguments
    /// * `key` - Expanded key
    /// * `nonce` - Nonce, 7 to 13 bytes
    /// * `tag_len` - Tag length, even, 4 to 16 bytes
    /// * `text_len` - Total payload length
    /// * `adata` - Length prefix followed by the associated data; empty when there is none
    ///
    /// # Error
    /// * `DeviceStatus::BadCtx` - Nonce or tag size out of range
    pub fn start(
        key: &AesKey,
        nonce: &[u8],
        tag_len: usize,
        text_len: u64,
        adata: &[u8],
    ) -> Result<Self, DeviceStatus> {
        if !(7..=13).contains(&nonce.len()) || !(4..=16).contains(&tag_len) || tag_len % 2 != 0 {
            Err(DeviceStatus::BadCtx)?
        }

        let q = 15 - nonce.len();
        let mut b0 = counter_block(nonce, q, text_len);
        b0[0] = (((tag_len - 2) / 2) as u8) << 3 | (q - 1) as u8;
        if !adata.is_empty() {
            b0[0] |= 0x40;
        }

        let mut mac = key.encrypt(&b0);
        for chunk in adata.chunks(AES_BLOCK_SIZE) {
            xor_block(&mut mac, chunk);
            mac = key.encrypt(&mac);
        }

        Ok(Self {
            mac,
            ctr: counter_block(nonce, q, 1),
            q,
        })
    }

    /// Encrypts or decrypts payload bytes and folds the plaintext into the MAC.
    ///
    /// Only the last call of a computation may pass a partial block.
    pub fn process(&mut self, key: &AesKey, encrypt: bool, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len());
        for chunk in data.chunks(AES_BLOCK_SIZE) {
            let ks = key.encrypt(&self.ctr);
            increment_counter(&mut self.ctr, self.q);

            let mut result = [0; AES_BLOCK_SIZE];
            result[..chunk.len()].copy_from_slice(chunk);
            xor_block(&mut result, &ks[..chunk.len()]);

            let plain = if encrypt { chunk } else { &result[..chunk.len()] };
            xor_block(&mut self.mac, plain);
            self.mac = key.encrypt(&self.mac);

            out.extend_from_slice(&result[..chunk.len()]);
        }
        out
    }

    /// Returns the authentication tag.
    pub fn tag(&self, key: &AesKey, nonce: &[u8], tag_len: usize) -> Vec<u8> {
        let mut tag = key.encrypt(&counter_block(nonce, self.q, 0));
        xor_block(&mut tag, &self.mac);
        tag[..tag_len].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use ccm::aead::generic_array::GenericArray;
    use ccm::aead::Aead;
    use ccm::aead::KeyInit;
    use ccm::aead::Payload;
    use ccm::aead::consts::U13;
    use ccm::aead::consts::U16;
    use ccm::Ccm;
    use sep_interface::ccm_adata_prefix;
    use test_with_tracing::test;

    use super::*;

    type Reference = Ccm<aes::Aes128, U16, U13>;

    #[test]
    fn test_ccm_matches_reference() {
        let key_bytes = [0x40u8; 16];
        let nonce = [0x10u8; 13];
        let adata = [0xaau8; 20];
        let text: Vec<u8> = (0..37u8).collect();

        let key = AesKey::new(&key_bytes).unwrap();
        let mut formatted = ccm_adata_prefix(adata.len());
        formatted.extend_from_slice(&adata);

        let mut state = CcmState::start(&key, &nonce, 16, text.len() as u64, &formatted).unwrap();
        let mut out = state.process(&key, true, &text[..32]);
        out.extend(state.process(&key, true, &text[32..]));
        out.extend(state.tag(&key, &nonce, 16));

        let cipher = Reference::new(GenericArray::from_slice(&key_bytes));
        let expected = cipher
            .encrypt(
                GenericArray::from_slice(&nonce),
                Payload {
                    msg: &text,
                    aad: &adata,
                },
            )
            .unwrap();
        assert_eq!(out, expected);

        let mut state = CcmState::start(&key, &nonce, 16, text.len() as u64, &formatted).unwrap();
        let plain = state.process(&key, false, &out[..text.len()]);
        assert_eq!(plain, text);
        assert_eq!(state.tag(&key, &nonce, 16), out[text.len()..].to_vec());
    }

    #[test]
    fn test_bad_sizes() {
        let key = AesKey::new(&[0; 16]).unwrap();
        assert_eq!(
            CcmState::start(&key, &[0; 6], 16, 0, &[]),
            Err(DeviceStatus::BadCtx)
        );
        assert_eq!(
            CcmState::start(&key, &[0; 13], 5, 0, &[]),
            Err(DeviceStatus::BadCtx)
        );
    }
}
