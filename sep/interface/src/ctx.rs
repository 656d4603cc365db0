// Copyright (C) Microsoft Corporation. All rights reserved.

//! Device-format crypto context blobs.
//!
//! A blob is a [`SepCtxHeader`] followed by the class body. The host writes
//! the initialization properties into the body, the device loads the blob into
//! a cache slot and writes the updated blob back after every descriptor.

use std::fmt;
use std::mem::size_of;

use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

use crate::AlgClass;

/// Process-unique identity of one initialized context.
///
/// A new UID is drawn on every init, so a UID that left the cache is never
/// confused with a live one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextUid {
    /// Client session that owns the context
    pub owner: u32,

    /// Device-wide monotonically increasing counter
    pub seq: u64,
}

impl fmt::Display for ContextUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}:{}", self.owner, self.seq)
    }
}

/// Common blob header.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct SepCtxHeader {
    /// [`AlgClass`] as raw value
    pub alg: u32,

    /// Class specific mode word
    pub mode: u32,

    /// Owner half of the [`ContextUid`]
    pub uid_owner: u32,

    /// Host lifecycle state, written back when the host unmaps the context
    pub host_state: u32,

    /// Counter half of the [`ContextUid`]
    pub uid_seq: u64,
}

/// Size of [`SepCtxHeader`] in bytes.
pub const SEP_CTX_HEADER_SIZE: usize = size_of::<SepCtxHeader>();

impl SepCtxHeader {
    /// Reads the header from the start of a blob.
    pub fn read(blob: &[u8]) -> Option<Self> {
        Self::read_from_prefix(blob).ok().map(|(hdr, _)| hdr)
    }

    /// Writes the header to the start of a blob.
    pub fn write(&self, blob: &mut [u8]) -> bool {
        self.write_to_prefix(blob).is_ok()
    }

    /// Returns the UID recorded in the header.
    pub fn uid(&self) -> ContextUid {
        ContextUid {
            owner: self.uid_owner,
            seq: self.uid_seq,
        }
    }
}

/// Symmetric cipher context body.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct CipherCtx {
    /// AES key, `key_len` bytes used
    pub key: [u8; 32],

    /// Chaining value: IV for CBC, next counter block for CTR
    pub iv: [u8; 16],

    /// Key size in bytes
    pub key_len: u32,

    /// [`crate::CryptoDirection`] as raw value
    pub direction: u32,
}

/// AES-CCM context body.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct AuthEncCtx {
    /// AES key, `key_len` bytes used
    pub key: [u8; 32],

    /// Nonce, `nonce_len` bytes used
    pub nonce: [u8; 16],

    /// Running CBC-MAC
    pub mac: [u8; 16],

    /// Next counter block
    pub ctr: [u8; 16],

    /// Computed tag (encrypt) or expected tag (decrypt)
    pub tag: [u8; 16],

    /// Total associated data size
    pub adata_len: u64,

    /// Total payload size
    pub text_len: u64,

    /// Payload bytes processed so far
    pub processed: u64,

    /// Key size in bytes
    pub key_len: u32,

    /// [`crate::CryptoDirection`] as raw value
    pub direction: u32,

    /// Nonce size in bytes
    pub nonce_len: u32,

    /// Tag size in bytes
    pub tag_len: u32,
}

/// Hash context body.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct HashCtx {
    /// Chaining state, big-endian words
    pub state: [u8; 64],

    /// Digest, valid after finalize
    pub digest: [u8; 64],

    /// Bytes compressed so far
    pub byte_count: u64,
}

/// MAC context body (HMAC or CMAC).
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct MacCtx {
    /// Key, `key_len` bytes used
    pub key: [u8; 128],

    /// HMAC inner chaining state
    pub inner: [u8; 64],

    /// HMAC outer chaining state
    pub outer: [u8; 64],

    /// CMAC subkey K1
    pub subkey1: [u8; 16],

    /// CMAC subkey K2
    pub subkey2: [u8; 16],

    /// CMAC chaining value
    pub chain: [u8; 16],

    /// MAC, valid after finalize
    pub mac: [u8; 64],

    /// HMAC inner bytes compressed so far, including the key block
    pub byte_count: u64,

    /// Key size in bytes
    pub key_len: u32,

    /// Reserved
    pub rsvd: u32,
}

/// A context body stored after the header.
pub trait CtxBody: FromBytes + IntoBytes + KnownLayout + Immutable + Sized {
    /// Class the body belongs to.
    const CLASS: AlgClass;

    /// Reads the body out of a blob.
    fn read(blob: &[u8]) -> Option<Self> {
        let body = blob.get(SEP_CTX_HEADER_SIZE..)?;
        Self::read_from_prefix(body).ok().map(|(body, _)| body)
    }

    /// Writes the body into a blob.
    fn write(&self, blob: &mut [u8]) -> bool {
        match blob.get_mut(SEP_CTX_HEADER_SIZE..) {
            Some(body) => self.write_to_prefix(body).is_ok(),
            None => false,
        }
    }
}

impl CtxBody for CipherCtx {
    const CLASS: AlgClass = AlgClass::SymCipher;
}

impl CtxBody for AuthEncCtx {
    const CLASS: AlgClass = AlgClass::AuthEnc;
}

impl CtxBody for HashCtx {
    const CLASS: AlgClass = AlgClass::Hash;
}

impl CtxBody for MacCtx {
    const CLASS: AlgClass = AlgClass::Mac;
}

/// Returns the blob size for an algorithm class.
pub fn ctx_blob_size(class: AlgClass) -> usize {
    SEP_CTX_HEADER_SIZE
        + match class {
            AlgClass::SymCipher => size_of::<CipherCtx>(),
            AlgClass::AuthEnc => size_of::<AuthEncCtx>(),
            AlgClass::Mac => size_of::<MacCtx>(),
            AlgClass::Hash => size_of::<HashCtx>(),
        }
}

#[cfg(test)]
mod tests {
    use test_with_tracing::test;
    use zerocopy::FromZeros;

    use super::*;

    #[test]
    fn test_blob_sizes_are_fixed_per_class() {
        assert_eq!(SEP_CTX_HEADER_SIZE, 24);
        assert_eq!(ctx_blob_size(AlgClass::SymCipher), 24 + 56);
        assert_eq!(ctx_blob_size(AlgClass::Hash), 24 + 136);
        assert!(ctx_blob_size(AlgClass::Mac) > ctx_blob_size(AlgClass::AuthEnc));
    }

    #[test]
    fn test_body_follows_header() {
        let mut blob = vec![0u8; ctx_blob_size(AlgClass::SymCipher)];
        let hdr = SepCtxHeader {
            alg: AlgClass::SymCipher as u32,
            mode: 2,
            uid_owner: 7,
            host_state: 0,
            uid_seq: 42,
        };
        assert!(hdr.write(&mut blob));

        let mut body = CipherCtx::new_zeroed();
        body.key_len = 16;
        body.iv = [0xa5; 16];
        assert!(body.write(&mut blob));

        let read_hdr = SepCtxHeader::read(&blob).unwrap();
        assert_eq!(read_hdr.uid(), ContextUid { owner: 7, seq: 42 });

        let read_body = CipherCtx::read(&blob).unwrap();
        assert_eq!({ read_body.key_len }, 16);
        assert_eq!(read_body.iv, [0xa5; 16]);
    }

    #[test]
    fn test_short_blob_is_rejected() {
        let blob = vec![0u8; SEP_CTX_HEADER_SIZE + 4];
        assert!(HashCtx::read(&blob).is_none());
    }
}
