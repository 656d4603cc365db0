// Copyright (C) Microsoft Corporation. All rights reserved.

mod common;

use common::reference;
use common::*;
use sep_driver::*;
use test_with_tracing::test;

fn cipher_props(mode: CipherMode, direction: CryptoDirection) -> SymCipherProps {
    SymCipherProps {
        mode,
        direction,
        key: key16(),
        iv: [0x5a; AES_BLOCK_SIZE],
    }
}

fn ccm_props(direction: CryptoDirection, adata_len: usize, text_len: usize) -> AuthEncProps {
    AuthEncProps {
        mode: AuthEncMode::Ccm,
        direction,
        key: key16(),
        nonce: pattern(13, 0x77),
        tag_len: 16,
        adata_len,
        text_len,
    }
}

#[test]
fn test_ecb_encrypt_matches_reference() {
    let harness = Harness::new();
    let client = harness.client();
    let ctx = client.new_context(AlgClass::SymCipher);
    let plain = pattern(64, 1);
    let din = HostBuffer::from_slice(&plain);
    let dout = HostBuffer::new(64);

    client
        .sym_cipher_init(&ctx, &cipher_props(CipherMode::Ecb, CryptoDirection::Encrypt))
        .unwrap();
    assert_eq!(ctx.state(), CtxState::Initialized);
    client
        .sym_cipher_finalize(&ctx, (&din).into(), (&dout).into())
        .unwrap();

    assert_eq!(dout.to_vec(), reference::ecb_encrypt(&key16(), &plain));
    assert_eq!(ctx.state(), CtxState::Uninitialized);
}

#[test]
fn test_cbc_streaming_round_trip() {
    let harness = Harness::new();
    let client = harness.client();
    let props = cipher_props(CipherMode::Cbc, CryptoDirection::Encrypt);
    let plain = pattern(96, 9);
    let expected = reference::cbc_encrypt(&props.key, &props.iv, &plain);

    let ctx = client.new_context(AlgClass::SymCipher);
    let din = HostBuffer::from_slice(&plain);
    let dout = HostBuffer::new(96);
    client.sym_cipher_init(&ctx, &props).unwrap();
    client
        .sym_cipher_process(&ctx, BufRange::new(&din, 0, 32), BufRange::new(&dout, 0, 32))
        .unwrap();
    client
        .sym_cipher_process(&ctx, BufRange::new(&din, 32, 48), BufRange::new(&dout, 32, 48))
        .unwrap();
    client
        .sym_cipher_finalize(&ctx, BufRange::new(&din, 80, 16), BufRange::new(&dout, 80, 16))
        .unwrap();
    assert_eq!(dout.to_vec(), expected);

    let decrypt = cipher_props(CipherMode::Cbc, CryptoDirection::Decrypt);
    let back = HostBuffer::new(96);
    client
        .sym_cipher_integrated(&ctx, &decrypt, (&dout).into(), (&back).into())
        .unwrap();
    assert_eq!(back.to_vec(), plain);
    assert_eq!(reference::cbc_decrypt(&decrypt.key, &decrypt.iv, &expected), plain);
}

#[test]
fn test_ctr_partial_final_block() {
    let harness = Harness::new();
    let client = harness.client();
    let props = cipher_props(CipherMode::Ctr, CryptoDirection::Encrypt);
    let plain = pattern(45, 3);
    let din = HostBuffer::from_slice(&plain);
    let dout = HostBuffer::new(45);

    let ctx = client.new_context(AlgClass::SymCipher);
    client.sym_cipher_init(&ctx, &props).unwrap();
    client
        .sym_cipher_process(&ctx, BufRange::new(&din, 0, 32), BufRange::new(&dout, 0, 32))
        .unwrap();
    client
        .sym_cipher_finalize(&ctx, BufRange::new(&din, 32, 13), BufRange::new(&dout, 32, 13))
        .unwrap();

    assert_eq!(dout.to_vec(), reference::ctr(&props.key, &props.iv, &plain));
}

#[test]
fn test_ecb_partial_block_rejected() {
    let harness = Harness::new();
    let client = harness.client();
    let ctx = client.new_context(AlgClass::SymCipher);
    let din = HostBuffer::from_slice(&pattern(20, 0));
    let dout = HostBuffer::new(20);

    client
        .sym_cipher_init(&ctx, &cipher_props(CipherMode::Ecb, CryptoDirection::Encrypt))
        .unwrap();
    let result = client.sym_cipher_process(&ctx, (&din).into(), (&dout).into());
    assert_eq!(result, Err(SepError::Device(DeviceStatus::InvalDataSize)));
    assert_eq!(ctx.state(), CtxState::Uninitialized);
    assert!(harness.dev.cache_residents().is_empty());
}

#[test]
fn test_in_place_cipher() {
    let harness = Harness::new();
    let client = harness.client();
    let props = cipher_props(CipherMode::Cbc, CryptoDirection::Encrypt);
    let plain = pattern(5000, 4);
    let buf = HostBuffer::from_slice(&plain);

    let ctx = client.new_context(AlgClass::SymCipher);
    client
        .sym_cipher_integrated(&ctx, &props, (&buf).into(), (&buf).into())
        .unwrap();

    assert_eq!(buf.to_vec(), reference::cbc_encrypt(&props.key, &props.iv, &plain));
}

#[test]
fn test_partial_overlap_rejected() {
    let harness = Harness::new();
    let client = harness.client();
    let buf = HostBuffer::from_slice(&pattern(64, 4));

    let ctx = client.new_context(AlgClass::SymCipher);
    let result = client.sym_cipher_integrated(
        &ctx,
        &cipher_props(CipherMode::Ecb, CryptoDirection::Encrypt),
        BufRange::new(&buf, 0, 32),
        BufRange::new(&buf, 16, 32),
    );
    assert_eq!(result, Err(SepError::Device(DeviceStatus::DinDoutOverlap)));
}

#[test]
fn test_short_output_rejected() {
    let harness = Harness::new();
    let client = harness.client();
    let din = HostBuffer::from_slice(&pattern(32, 0));
    let dout = HostBuffer::new(16);

    let ctx = client.new_context(AlgClass::SymCipher);
    client
        .sym_cipher_init(&ctx, &cipher_props(CipherMode::Ecb, CryptoDirection::Encrypt))
        .unwrap();
    let result = client.sym_cipher_process(&ctx, (&din).into(), (&dout).into());
    assert_eq!(result, Err(SepError::Host(HostError::InvalidArgument)));
}

#[test]
fn test_hash_streaming_odd_chunks() {
    let harness = Harness::new();
    let client = harness.client();
    let data = pattern(1000, 17);
    let buf = HostBuffer::from_slice(&data);

    for mode in [
        HashMode::Sha1,
        HashMode::Sha224,
        HashMode::Sha256,
        HashMode::Sha384,
        HashMode::Sha512,
    ] {
        let ctx = client.new_context(AlgClass::Hash);
        client.hash_init(&ctx, mode).unwrap();
        let mut offset = 0;
        for chunk in [1, 63, 200, 7, 129, 300] {
            client.hash_process(&ctx, BufRange::new(&buf, offset, chunk)).unwrap();
            offset += chunk;
        }
        let digest = client
            .hash_finalize(&ctx, BufRange::new(&buf, offset, data.len() - offset))
            .unwrap();
        assert_eq!(digest, reference::sha(mode, &data), "{mode:?}");
    }
}

#[test]
fn test_hash_empty_process_then_short_finalize() {
    let harness = Harness::new();
    let client = harness.client();
    let data = pattern(55, 2);
    let buf = HostBuffer::from_slice(&data);

    let ctx = client.new_context(AlgClass::Hash);
    client.hash_init(&ctx, HashMode::Sha256).unwrap();
    client.hash_process(&ctx, BufRange::empty(&buf)).unwrap();
    let digest = client.hash_finalize(&ctx, (&buf).into()).unwrap();

    assert_eq!(digest, reference::sha(HashMode::Sha256, &data));
}

#[test]
fn test_hash_of_nothing() {
    let harness = Harness::new();
    let client = harness.client();
    let buf = HostBuffer::new(0);

    let ctx = client.new_context(AlgClass::Hash);
    let digest = client
        .hash_integrated(&ctx, HashMode::Sha1, BufRange::empty(&buf))
        .unwrap();
    assert_eq!(digest, reference::sha(HashMode::Sha1, &[]));
}

#[test]
fn test_hash_async_chunks() {
    let harness = Harness::new();
    let client = harness.client();
    let data = pattern(640, 8);
    let buf = HostBuffer::from_slice(&data);

    let ctx = client.new_context(AlgClass::Hash);
    client.hash_init(&ctx, HashMode::Sha512).unwrap();
    let (callback, rx) = completion();
    client
        .hash_process_async(&ctx, BufRange::new(&buf, 0, 300), true, callback)
        .unwrap();
    recv(&rx).unwrap();

    let digest = client.hash_finalize(&ctx, BufRange::new(&buf, 300, 340)).unwrap();
    assert_eq!(digest, reference::sha(HashMode::Sha512, &data));
}

#[test]
fn test_hmac_modes() {
    let harness = Harness::new();
    let client = harness.client();
    let data = pattern(300, 12);
    let buf = HostBuffer::from_slice(&data);

    for (mode, key_len) in [
        (HashMode::Sha1, 20),
        (HashMode::Sha256, 32),
        (HashMode::Sha256, 100),
        (HashMode::Sha384, 48),
        (HashMode::Sha512, 128),
    ] {
        let props = MacProps {
            mode: MacMode::Hmac(mode),
            key: pattern(key_len, 0x40),
        };
        let ctx = client.new_context(AlgClass::Mac);
        client.mac_init(&ctx, &props).unwrap();
        client.mac_process(&ctx, BufRange::new(&buf, 0, 150)).unwrap();
        let mac = client.mac_finalize(&ctx, BufRange::new(&buf, 150, 150)).unwrap();
        assert_eq!(mac, reference::hmac(mode, &props.key, &data), "{mode:?} key {key_len}");
    }
}

#[test]
fn test_cmac_aligned_and_unaligned() {
    let harness = Harness::new();
    let client = harness.client();
    let props = MacProps {
        mode: MacMode::AesCmac,
        key: key16(),
    };

    for len in [0, 16, 64, 70] {
        let data = pattern(len, 21);
        let buf = HostBuffer::from_slice(&data);
        let ctx = client.new_context(AlgClass::Mac);
        let mac = client.mac_integrated(&ctx, &props, (&buf).into()).unwrap();
        assert_eq!(mac, reference::cmac(&props.key, &data), "len {len}");
    }

    // Streaming a block-aligned message keeps the last block for finalize.
    let data = pattern(64, 22);
    let buf = HostBuffer::from_slice(&data);
    let ctx = client.new_context(AlgClass::Mac);
    client.mac_init(&ctx, &props).unwrap();
    client.mac_process(&ctx, (&buf).into()).unwrap();
    let mac = client.mac_finalize(&ctx, BufRange::empty(&buf)).unwrap();
    assert_eq!(mac, reference::cmac(&props.key, &data));
}

#[test]
fn test_hmac_key_too_long_rejected() {
    let harness = Harness::new();
    let client = harness.client();
    let ctx = client.new_context(AlgClass::Mac);
    let props = MacProps {
        mode: MacMode::Hmac(HashMode::Sha256),
        key: vec![1; MAX_HMAC_KEY_SIZE + 1],
    };

    assert_eq!(
        client.mac_init(&ctx, &props),
        Err(SepError::Host(HostError::InvalidArgument))
    );
    assert_eq!(ctx.state(), CtxState::Uninitialized);
}

#[test]
fn test_ccm_postponed_init_then_stream() {
    let harness = Harness::new();
    let client = harness.client();
    let adata = pattern(20, 0x61);
    let text = pattern(40, 0x62);
    let props = ccm_props(CryptoDirection::Encrypt, adata.len(), text.len());

    let ctx = client.new_context(AlgClass::AuthEnc);
    client.auth_enc_init(&ctx, &props).unwrap();
    assert_eq!(ctx.state(), CtxState::PartialInit);
    assert!(harness.dev.cache_residents().is_empty());

    let abuf = HostBuffer::from_slice(&adata);
    let tbuf = HostBuffer::from_slice(&text);
    let out = HostBuffer::new(text.len() + props.tag_len);
    client
        .auth_enc_process(&ctx, (&abuf).into(), BufRange::empty(&out))
        .unwrap();
    assert_eq!(ctx.state(), CtxState::Initialized);

    client
        .auth_enc_process(&ctx, BufRange::new(&tbuf, 0, 32), BufRange::new(&out, 0, 32))
        .unwrap();
    let written = client
        .auth_enc_finalize(&ctx, BufRange::new(&tbuf, 32, 8), BufRange::new(&out, 32, 24))
        .unwrap();

    assert_eq!(written, 24);
    assert_eq!(out.to_vec(), reference::ccm_seal(&props.key, &props.nonce, &adata, &text));
    assert_eq!(ctx.state(), CtxState::Uninitialized);
}

#[test]
fn test_ccm_postponed_init_wrong_adata_size() {
    let harness = Harness::new();
    let client = harness.client();
    let props = ccm_props(CryptoDirection::Encrypt, 20, 16);
    let abuf = HostBuffer::from_slice(&pattern(19, 0));

    let ctx = client.new_context(AlgClass::AuthEnc);
    client.auth_enc_init(&ctx, &props).unwrap();
    let result = client.auth_enc_process(&ctx, (&abuf).into(), BufRange::empty(&abuf));
    assert_eq!(result, Err(SepError::Host(HostError::InvalidArgument)));
}

#[test]
fn test_ccm_decrypt_and_tamper() {
    let harness = Harness::new();
    let client = harness.client();
    let adata = pattern(5, 0x31);
    let text = pattern(33, 0x32);
    let props = ccm_props(CryptoDirection::Decrypt, adata.len(), text.len());
    let sealed = reference::ccm_seal(&props.key, &props.nonce, &adata, &text);

    let abuf = HostBuffer::from_slice(&adata);
    let sbuf = HostBuffer::from_slice(&sealed);
    let out = HostBuffer::new(text.len());
    let ctx = client.new_context(AlgClass::AuthEnc);
    let written = client
        .auth_enc_integrated(&ctx, &props, (&abuf).into(), (&sbuf).into(), (&out).into())
        .unwrap();
    assert_eq!(written, text.len());
    assert_eq!(out.to_vec(), text);

    let mut tampered = sealed.clone();
    let last = tampered.len() - 1;
    tampered[last] ^= 1;
    let tbuf = HostBuffer::from_slice(&tampered);
    let result = client.auth_enc_integrated(&ctx, &props, (&abuf).into(), (&tbuf).into(), (&out).into());
    assert_eq!(result, Err(SepError::Device(DeviceStatus::AuthFailed)));
    assert_eq!(ctx.state(), CtxState::Uninitialized);
}

#[test]
fn test_ccm_integrated_encrypt_without_adata() {
    let harness = Harness::new();
    let client = harness.client();
    let text = pattern(48, 0x10);
    let props = ccm_props(CryptoDirection::Encrypt, 0, text.len());

    let abuf = HostBuffer::new(0);
    let tbuf = HostBuffer::from_slice(&text);
    let out = HostBuffer::new(text.len() + props.tag_len);
    let ctx = client.new_context(AlgClass::AuthEnc);
    client
        .auth_enc_integrated(&ctx, &props, BufRange::empty(&abuf), (&tbuf).into(), (&out).into())
        .unwrap();

    assert_eq!(out.to_vec(), reference::ccm_seal(&props.key, &props.nonce, &[], &text));
}

#[test]
fn test_combined_cipher_then_hash() {
    let harness = Harness::new();
    let client = harness.client();
    let props = cipher_props(CipherMode::Cbc, CryptoDirection::Encrypt);
    let plain = pattern(256, 0x44);
    let din = HostBuffer::from_slice(&plain);
    let dout = HostBuffer::new(plain.len());

    let aes = client.new_context(AlgClass::SymCipher);
    let hash = client.new_context(AlgClass::Hash);
    client.sym_cipher_init(&aes, &props).unwrap();
    client.hash_init(&hash, HashMode::Sha256).unwrap();

    let nodes = [
        ChainNode {
            engine: EngineType::Aes,
            source: EngineSource::Din,
        },
        ChainNode {
            engine: EngineType::Hash,
            source: EngineSource::PrevOutput,
        },
    ];
    let chain = client.combined_init(&nodes, &[&aes, &hash]).unwrap();
    client
        .combined_process(&chain, BufRange::new(&din, 0, 128), BufRange::new(&dout, 0, 128))
        .unwrap();
    let results = client
        .combined_finalize(&chain, BufRange::new(&din, 128, 128), BufRange::new(&dout, 128, 128))
        .unwrap();

    let cipher = reference::cbc_encrypt(&props.key, &props.iv, &plain);
    assert_eq!(dout.to_vec(), cipher);
    assert_eq!(results.len(), 2);
    assert!(results[0].is_empty());
    assert_eq!(results[1], reference::sha(HashMode::Sha256, &cipher));
    assert_eq!(aes.state(), CtxState::Uninitialized);
    assert_eq!(hash.state(), CtxState::Uninitialized);
}

#[test]
fn test_combined_cmac_takes_input_at_finalize() {
    let harness = Harness::new();
    let client = harness.client();
    let props = MacProps {
        mode: MacMode::AesCmac,
        key: key16(),
    };
    let data = pattern(32, 0x51);
    let buf = HostBuffer::from_slice(&data);
    let none = HostBuffer::new(0);

    let mac = client.new_context(AlgClass::Mac);
    client.mac_init(&mac, &props).unwrap();
    let nodes = [ChainNode {
        engine: EngineType::Mac,
        source: EngineSource::Din,
    }];
    let chain = client.combined_init(&nodes, &[&mac]).unwrap();

    let result = client.combined_process(&chain, (&buf).into(), BufRange::empty(&none));
    assert_eq!(result, Err(SepError::Host(HostError::InvalidArgument)));
    assert_eq!(mac.state(), CtxState::Initialized);

    let results = client
        .combined_finalize(&chain, (&buf).into(), BufRange::empty(&none))
        .unwrap();
    assert_eq!(results, vec![reference::cmac(&props.key, &data)]);
    assert_eq!(mac.state(), CtxState::Uninitialized);
}

#[test]
fn test_combined_hash_and_mac_in_parallel() {
    let harness = Harness::new();
    let client = harness.client();
    let data = pattern(192, 0x13);
    let buf = HostBuffer::from_slice(&data);
    let props = MacProps {
        mode: MacMode::Hmac(HashMode::Sha256),
        key: pattern(32, 0x14),
    };

    let hash = client.new_context(AlgClass::Hash);
    let mac = client.new_context(AlgClass::Mac);
    client.hash_init(&hash, HashMode::Sha1).unwrap();
    client.mac_init(&mac, &props).unwrap();

    let nodes = [
        ChainNode {
            engine: EngineType::Hash,
            source: EngineSource::Din,
        },
        ChainNode {
            engine: EngineType::Mac,
            source: EngineSource::Din,
        },
    ];
    let chain = client.combined_init(&nodes, &[&hash, &mac]).unwrap();
    let results = client
        .combined_finalize(&chain, (&buf).into(), BufRange::empty(&buf))
        .unwrap();

    assert_eq!(results[0], reference::sha(HashMode::Sha1, &data));
    assert_eq!(results[1], reference::hmac(HashMode::Sha256, &props.key, &data));
}

#[test]
fn test_combined_init_rejects_bad_members() {
    let harness = Harness::new();
    let client = harness.client();
    let hash = client.new_context(AlgClass::Hash);
    let other = client.new_context(AlgClass::Hash);
    let nodes = [ChainNode {
        engine: EngineType::Aes,
        source: EngineSource::Din,
    }];

    client.hash_init(&hash, HashMode::Sha256).unwrap();
    assert_eq!(
        client.combined_init(&nodes, &[&hash]).unwrap_err(),
        SepError::Device(DeviceStatus::BadCtx)
    );

    let hash_nodes = [
        ChainNode {
            engine: EngineType::Hash,
            source: EngineSource::Din,
        },
        ChainNode {
            engine: EngineType::Hash,
            source: EngineSource::Din,
        },
    ];
    assert_eq!(
        client.combined_init(&hash_nodes, &[&hash, &hash]).unwrap_err(),
        SepError::Host(HostError::InvalidArgument)
    );
    assert_eq!(
        client.combined_init(&hash_nodes, &[&hash, &other]).unwrap_err(),
        SepError::Device(DeviceStatus::BadCtx)
    );
    assert_eq!(
        client.combined_init(&hash_nodes[..1], &[&hash, &other]).unwrap_err(),
        SepError::Host(HostError::InvalidArgument)
    );
}

#[test]
fn test_context_size_query() {
    let harness = Harness::new();
    for class in [AlgClass::SymCipher, AlgClass::AuthEnc, AlgClass::Mac, AlgClass::Hash] {
        let size = harness.dev.context_size(class as u32).unwrap();
        assert!(size > 0);
    }
    assert_eq!(harness.dev.context_size(42), Err(HostError::InvalidArgument));
    assert_eq!(harness.dev.context_size(0), Err(HostError::InvalidArgument));
}
