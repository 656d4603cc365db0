// Copyright (C) Microsoft Corporation. All rights reserved.

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use sep_driver::*;
use sep_sim::SimConfig;
use sep_sim::SimDevice;

/// A driver attached to a simulated SeP.
pub struct Harness {
    pub sim: Arc<SimDevice>,
    pub dev: SepDevice,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(SimConfig::default())
    }

    pub fn with(config: SimConfig) -> Self {
        let sim = Arc::new(SimDevice::new(config).unwrap());
        let dev = SepDevice::attach(sim.clone(), DriverConfig::default()).unwrap();
        Self { sim, dev }
    }

    pub fn client(&self) -> Client {
        self.dev.open_client()
    }

    /// Blocks until the simulator holds `len` queued descriptors.
    pub fn wait_ring_len(&self, len: usize) {
        for _ in 0..2000 {
            if self.sim.ring_len() == len {
                return;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        panic!("ring never reached {len} entries");
    }
}

/// Deterministic test data.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

pub fn key16() -> Vec<u8> {
    pattern(16, 0x2b)
}

/// A completion channel for asynchronous calls.
pub fn completion<T: Send + 'static>() -> (
    impl FnOnce(SepResult<T>) + Send + 'static,
    mpsc::Receiver<SepResult<T>>,
) {
    let (tx, rx) = mpsc::channel();
    let callback = move |result| {
        let _ = tx.send(result);
    };
    (callback, rx)
}

pub fn recv<T>(rx: &mpsc::Receiver<SepResult<T>>) -> SepResult<T> {
    rx.recv_timeout(Duration::from_secs(10)).unwrap()
}

/// Reference implementations the device output is compared against.
pub mod reference {
    use aes::cipher::generic_array::GenericArray;
    use aes::Aes128;
    use sep_driver::HashMode;

    pub fn sha(mode: HashMode, data: &[u8]) -> Vec<u8> {
        use sha2::Digest;

        match mode {
            HashMode::Sha1 => sha1::Sha1::digest(data).to_vec(),
            HashMode::Sha224 => sha2::Sha224::digest(data).to_vec(),
            HashMode::Sha256 => sha2::Sha256::digest(data).to_vec(),
            HashMode::Sha384 => sha2::Sha384::digest(data).to_vec(),
            HashMode::Sha512 => sha2::Sha512::digest(data).to_vec(),
        }
    }

    pub fn hmac(mode: HashMode, key: &[u8], data: &[u8]) -> Vec<u8> {
        use hmac::Mac;

        macro_rules! mac {
            ($d:ty) => {{
                let mut m = <hmac::Hmac<$d> as Mac>::new_from_slice(key).unwrap();
                m.update(data);
                m.finalize().into_bytes().to_vec()
            }};
        }
        match mode {
            HashMode::Sha1 => mac!(sha1::Sha1),
            HashMode::Sha224 => mac!(sha2::Sha224),
            HashMode::Sha256 => mac!(sha2::Sha256),
            HashMode::Sha384 => mac!(sha2::Sha384),
            HashMode::Sha512 => mac!(sha2::Sha512),
        }
    }

    pub fn cmac(key: &[u8], data: &[u8]) -> Vec<u8> {
        use cmac::Mac;

        let mut m = <cmac::Cmac<Aes128> as Mac>::new_from_slice(key).unwrap();
        m.update(data);
        m.finalize().into_bytes().to_vec()
    }

    pub fn ecb_encrypt(key: &[u8], data: &[u8]) -> Vec<u8> {
        use aes::cipher::BlockEncrypt;
        use aes::cipher::KeyInit;

        let cipher = Aes128::new(GenericArray::from_slice(key));
        let mut out = data.to_vec();
        for block in out.chunks_mut(16) {
            cipher.encrypt_block(GenericArray::from_mut_slice(block));
        }
        out
    }

    pub fn cbc_encrypt(key: &[u8], iv: &[u8; 16], data: &[u8]) -> Vec<u8> {
        use cbc::cipher::block_padding::NoPadding;
        use cbc::cipher::BlockEncryptMut;
        use cbc::cipher::KeyIvInit;

        cbc::Encryptor::<Aes128>::new(GenericArray::from_slice(key), GenericArray::from_slice(iv))
            .encrypt_padded_vec_mut::<NoPadding>(data)
    }

    pub fn cbc_decrypt(key: &[u8], iv: &[u8; 16], data: &[u8]) -> Vec<u8> {
        use cbc::cipher::block_padding::NoPadding;
        use cbc::cipher::BlockDecryptMut;
        use cbc::cipher::KeyIvInit;

        cbc::Decryptor::<Aes128>::new(GenericArray::from_slice(key), GenericArray::from_slice(iv))
            .decrypt_padded_vec_mut::<NoPadding>(data)
            .unwrap()
    }

    pub fn ctr(key: &[u8], iv: &[u8; 16], data: &[u8]) -> Vec<u8> {
        use ctr::cipher::KeyIvInit;
        use ctr::cipher::StreamCipher;

        let mut out = data.to_vec();
        let mut cipher = ctr::Ctr128BE::<Aes128>::new(GenericArray::from_slice(key), GenericArray::from_slice(iv));
        cipher.apply_keystream(&mut out);
        out
    }

    /// AES-128-CCM with a 13 byte nonce and a 16 byte tag: ciphertext || tag.
    pub fn ccm_seal(key: &[u8], nonce: &[u8], adata: &[u8], text: &[u8]) -> Vec<u8> {
        use ccm::aead::consts::U13;
        use ccm::aead::consts::U16;
        use ccm::aead::Aead;
        use ccm::aead::KeyInit;
        use ccm::aead::Payload;

        let cipher = ccm::Ccm::<Aes128, U16, U13>::new(GenericArray::from_slice(key));
        cipher
            .encrypt(
                GenericArray::from_slice(nonce),
                Payload {
                    msg: text,
                    aad: adata,
                },
            )
            .unwrap()
    }
}
