// Copyright (C) Microsoft Corporation. All rights reserved.

mod common;

use common::reference;
use common::*;
use sep_driver::*;
use sep_sim::SimConfig;
use test_with_tracing::test;

fn cbc_props() -> SymCipherProps {
    SymCipherProps {
        mode: CipherMode::Cbc,
        direction: CryptoDirection::Encrypt,
        key: key16(),
        iv: [7; AES_BLOCK_SIZE],
    }
}

fn resident(harness: &Harness, ctx: &CryptoContext) -> bool {
    match ctx.uid() {
        Some(uid) => harness.dev.cache_residents().iter().any(|(_, r)| *r == uid),
        None => false,
    }
}

#[test]
fn test_context_residency_follows_lifetime() {
    let harness = Harness::new();
    let client = harness.client();
    let buf = HostBuffer::from_slice(&pattern(64, 0));
    let ctx = client.new_context(AlgClass::Hash);
    assert_eq!(ctx.uid(), None);

    client.hash_init(&ctx, HashMode::Sha256).unwrap();
    let first = ctx.uid().unwrap();
    assert!(resident(&harness, &ctx));

    client.hash_process(&ctx, (&buf).into()).unwrap();
    assert_eq!(ctx.uid(), Some(first));
    client.hash_finalize(&ctx, BufRange::empty(&buf)).unwrap();
    assert_eq!(ctx.uid(), None);
    assert!(harness.dev.cache_residents().is_empty());

    // A new lifetime gets a new identity.
    client.hash_init(&ctx, HashMode::Sha256).unwrap();
    assert_ne!(ctx.uid(), Some(first));
}

#[test]
fn test_eviction_keeps_streams_correct() {
    let harness = Harness::with(SimConfig {
        ring_depth: 16,
        cache_slots: 2,
    });
    let client = harness.client();
    let data = pattern(512, 5);
    let buf = HostBuffer::from_slice(&data);

    let ctxs: Vec<CryptoContext> = (0..5).map(|_| client.new_context(AlgClass::Hash)).collect();
    for ctx in &ctxs {
        client.hash_init(ctx, HashMode::Sha256).unwrap();
    }
    for chunk in 0..4 {
        for ctx in &ctxs {
            client
                .hash_process(ctx, BufRange::new(&buf, chunk * 128, 128))
                .unwrap();
        }
    }
    assert!(harness.dev.cache_residents().len() <= 2);

    for ctx in &ctxs {
        let digest = client.hash_finalize(ctx, BufRange::empty(&buf)).unwrap();
        assert_eq!(digest, reference::sha(HashMode::Sha256, &data));
    }
}

#[test]
fn test_device_failure_resets_context() {
    let harness = Harness::new();
    let client = harness.client();
    let buf = HostBuffer::from_slice(&pattern(64, 1));
    let ctx = client.new_context(AlgClass::Hash);
    client.hash_init(&ctx, HashMode::Sha1).unwrap();

    harness.sim.fail_next(DeviceStatus::Fatal);
    let result = client.hash_process(&ctx, (&buf).into());
    assert_eq!(result, Err(SepError::Device(DeviceStatus::Fatal)));
    assert_eq!(OpStatus::from(&result).device, DeviceStatus::Fatal);
    assert_eq!(ctx.state(), CtxState::Uninitialized);
    assert!(harness.dev.cache_residents().is_empty());

    assert_eq!(
        client.hash_process(&ctx, (&buf).into()),
        Err(SepError::Device(DeviceStatus::BadCtx))
    );

    // Re-init recovers the context.
    client.hash_init(&ctx, HashMode::Sha1).unwrap();
    let digest = client.hash_finalize(&ctx, (&buf).into()).unwrap();
    assert_eq!(digest, reference::sha(HashMode::Sha1, &pattern(64, 1)));
}

#[test]
fn test_wrong_class_is_bad_ctx() {
    let harness = Harness::new();
    let client = harness.client();
    let ctx = client.new_context(AlgClass::Hash);

    assert_eq!(
        client.sym_cipher_init(&ctx, &cbc_props()),
        Err(SepError::Device(DeviceStatus::BadCtx))
    );
}

#[test]
fn test_foreign_context_rejected() {
    let harness = Harness::new();
    let owner = harness.client();
    let other = harness.client();
    assert_ne!(owner.id(), other.id());

    let ctx = owner.new_context(AlgClass::Hash);
    owner.hash_init(&ctx, HashMode::Sha256).unwrap();
    let buf = HostBuffer::from_slice(&pattern(64, 0));
    assert!(other.hash_process(&ctx, (&buf).into()).is_err());
}

#[test]
fn test_async_cipher_continuation() {
    let harness = Harness::new();
    let client = harness.client();
    let props = cbc_props();
    let plain = pattern(64, 2);
    let din = HostBuffer::from_slice(&plain);
    let dout = HostBuffer::new(64);

    let ctx = client.new_context(AlgClass::SymCipher);
    client.sym_cipher_init(&ctx, &props).unwrap();
    let (callback, rx) = completion();
    client
        .sym_cipher_process_async(&ctx, (&din).into(), (&dout).into(), false, callback)
        .unwrap();
    recv(&rx).unwrap();
    assert_eq!(dout.to_vec(), reference::cbc_encrypt(&props.key, &props.iv, &plain));

    // Nothing to process still completes through the callback.
    let (callback, rx) = completion();
    client
        .sym_cipher_process_async(&ctx, BufRange::empty(&din), BufRange::empty(&dout), false, callback)
        .unwrap();
    recv(&rx).unwrap();
}

#[test]
fn test_async_failure_reaches_callback() {
    let harness = Harness::new();
    let client = harness.client();
    let buf = HostBuffer::from_slice(&pattern(128, 3));
    let ctx = client.new_context(AlgClass::Hash);
    client.hash_init(&ctx, HashMode::Sha256).unwrap();

    harness.sim.fail_next(DeviceStatus::InvalDinPtr);
    let (callback, rx) = completion();
    client
        .hash_process_async(&ctx, (&buf).into(), true, callback)
        .unwrap();
    assert_eq!(recv(&rx), Err(SepError::Device(DeviceStatus::InvalDinPtr)));
    assert_eq!(ctx.state(), CtxState::Uninitialized);
}

#[test]
fn test_backlog_absorbs_full_ring() {
    let harness = Harness::with(SimConfig {
        ring_depth: 2,
        cache_slots: 4,
    });
    let client = harness.client();
    let data = pattern(64, 4);
    let buf = HostBuffer::from_slice(&data);
    let ctxs: Vec<CryptoContext> = (0..5).map(|_| client.new_context(AlgClass::Hash)).collect();
    for ctx in &ctxs {
        client.hash_init(ctx, HashMode::Sha256).unwrap();
    }

    harness.sim.pause();
    let mut receivers = Vec::new();
    for ctx in &ctxs[..4] {
        let (callback, rx) = completion();
        client
            .hash_process_async(ctx, (&buf).into(), true, callback)
            .unwrap();
        receivers.push(rx);
    }
    harness.wait_ring_len(2);

    let (callback, _rx) = completion();
    assert_eq!(
        client.hash_process_async(&ctxs[4], (&buf).into(), false, callback),
        Err(SepError::Host(HostError::NoResource))
    );
    assert_eq!(
        client.hash_process(&ctxs[0], (&buf).into()),
        Err(SepError::Host(HostError::Busy))
    );

    harness.sim.resume();
    for rx in &receivers {
        recv(rx).unwrap();
    }
    for ctx in &ctxs[..4] {
        let digest = client.hash_finalize(ctx, BufRange::empty(&buf)).unwrap();
        assert_eq!(digest, reference::sha(HashMode::Sha256, &data));
    }
}

#[test]
fn test_combined_rollback_on_full_ring() {
    let harness = Harness::with(SimConfig {
        ring_depth: 4,
        cache_slots: 2,
    });
    let client = harness.client();
    let block = HostBuffer::from_slice(&pattern(64, 6));
    let plain = pattern(128, 7);
    let din = HostBuffer::from_slice(&plain);
    let dout = HostBuffer::new(128);

    let fillers: Vec<CryptoContext> = (0..3).map(|_| client.new_context(AlgClass::Hash)).collect();
    for ctx in &fillers {
        client.hash_init(ctx, HashMode::Sha256).unwrap();
    }
    let aes = client.new_context(AlgClass::SymCipher);
    let hash = client.new_context(AlgClass::Hash);
    client.sym_cipher_init(&aes, &cbc_props()).unwrap();
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

    harness.sim.pause();
    let mut receivers = Vec::new();
    for ctx in &fillers {
        let (callback, rx) = completion();
        client
            .hash_process_async(ctx, (&block).into(), false, callback)
            .unwrap();
        receivers.push(rx);
    }
    harness.wait_ring_len(3);

    // The load descriptor fits, the chain does not: the whole pass is undone.
    let (callback, _rx) = completion();
    let result = client.combined_process_async(&chain, (&din).into(), (&dout).into(), false, callback);
    assert_eq!(result, Err(SepError::Host(HostError::NoResource)));
    assert!(!resident(&harness, &aes));
    assert!(!resident(&harness, &hash));
    assert_eq!(aes.state(), CtxState::Initialized);
    assert_eq!(hash.state(), CtxState::Initialized);

    harness.sim.resume();
    harness.dev.drain();
    for rx in &receivers {
        recv(rx).unwrap();
    }

    client
        .combined_process(&chain, (&din).into(), (&dout).into())
        .unwrap();
    let results = client
        .combined_finalize(&chain, BufRange::empty(&din), BufRange::empty(&dout))
        .unwrap();
    let cipher = reference::cbc_encrypt(&key16(), &[7; AES_BLOCK_SIZE], &plain);
    assert_eq!(dout.to_vec(), cipher);
    assert_eq!(results[1], reference::sha(HashMode::Sha256, &cipher));
}

#[test]
fn test_memref_reference_counting() {
    let harness = Harness::new();
    let client = harness.client();
    let buf = HostBuffer::new(8192);
    let baseline = harness.dev.dma_mappings();

    let id = client
        .register_memref(BufRange::new(&buf, 100, 5000), DmaDirection::Bidirectional)
        .unwrap();
    assert_eq!(client.memrefs_in_use(), 1);
    assert!(harness.dev.dma_mappings() > baseline);

    client.memref_acquire(id).unwrap();
    assert_eq!(client.free_memref(id), Err(SepError::Host(HostError::Busy)));
    client.memref_release(id);
    client.free_memref(id).unwrap();

    assert_eq!(client.memrefs_in_use(), 0);
    assert_eq!(harness.dev.dma_mappings(), baseline);
    assert_eq!(client.free_memref(id), Err(SepError::Host(HostError::BadPointer)));
    assert_eq!(client.memref_acquire(id), Err(SepError::Host(HostError::BadPointer)));
}

#[test]
fn test_memref_registry_full() {
    let harness = Harness::new();
    let client = harness.client();
    let buf = HostBuffer::new(64);
    let slots = DriverConfig::default().memref_slots;

    for _ in 0..slots {
        client
            .register_memref((&buf).into(), DmaDirection::ToDevice)
            .unwrap();
    }
    assert_eq!(
        client.register_memref((&buf).into(), DmaDirection::ToDevice),
        Err(SepError::Host(HostError::NoResource))
    );
}

#[test]
fn test_operations_release_mappings() {
    let harness = Harness::new();
    let client = harness.client();
    let baseline = harness.dev.dma_mappings();
    let data = HostBuffer::from_slice(&pattern(10000, 9));
    let out = HostBuffer::new(10000);

    let ctx = client.new_context(AlgClass::SymCipher);
    client
        .sym_cipher_integrated(&ctx, &cbc_props(), (&data).into(), (&out).into())
        .unwrap();
    let hash = client.new_context(AlgClass::Hash);
    client
        .hash_integrated(&hash, HashMode::Sha384, (&data).into())
        .unwrap();

    assert_eq!(harness.dev.dma_mappings(), baseline);
}

#[test]
fn test_concurrent_clients() {
    let harness = Harness::with(SimConfig {
        ring_depth: 4,
        cache_slots: 3,
    });
    let data = pattern(4096, 11);

    std::thread::scope(|scope| {
        for worker in 0..6 {
            let dev = &harness.dev;
            let data = &data;
            scope.spawn(move || {
                let client = dev.open_client();
                let buf = HostBuffer::from_slice(data);
                let mode = if worker % 2 == 0 {
                    HashMode::Sha256
                } else {
                    HashMode::Sha512
                };
                for _ in 0..10 {
                    let ctx = client.new_context(AlgClass::Hash);
                    client.hash_init(&ctx, mode).unwrap();
                    for chunk in data.chunks(1000).scan(0, |offset, chunk| {
                        let start = *offset;
                        *offset += chunk.len();
                        Some((start, chunk.len()))
                    }) {
                        client.hash_process(&ctx, BufRange::new(&buf, chunk.0, chunk.1)).unwrap();
                    }
                    let digest = client.hash_finalize(&ctx, BufRange::empty(&buf)).unwrap();
                    assert_eq!(digest, reference::sha(mode, data));
                }
            });
        }
    });

    harness.dev.drain();
    assert!(harness.dev.cache_residents().is_empty());
}

#[test]
fn test_close_reclaims_client_state() {
    let harness = Harness::new();
    let client = harness.client();
    let buf = HostBuffer::new(256);
    let baseline = harness.dev.dma_mappings();

    client
        .register_memref((&buf).into(), DmaDirection::FromDevice)
        .unwrap();
    let ctx = client.new_context(AlgClass::Hash);
    client.hash_init(&ctx, HashMode::Sha224).unwrap();
    assert!(resident(&harness, &ctx));

    client.close();
    assert_eq!(client.memrefs_in_use(), 0);
    assert_eq!(harness.dev.dma_mappings(), baseline);
    assert!(harness.dev.cache_residents().is_empty());
    assert_eq!(
        client.hash_init(&ctx, HashMode::Sha224),
        Err(SepError::Host(HostError::BadPointer))
    );
    assert_eq!(
        client.register_memref((&buf).into(), DmaDirection::FromDevice),
        Err(SepError::Host(HostError::BadPointer))
    );

    // Closing twice is harmless.
    client.close();
}
