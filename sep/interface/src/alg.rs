// Copyright (C) Microsoft Corporation. All rights reserved.

//! Algorithm catalogue and initialization properties.

use crate::HostError;

/// AES block size in bytes.
pub const AES_BLOCK_SIZE: usize = 16;

/// Largest HMAC key the context blob can carry (one SHA-512 block).
pub const MAX_HMAC_KEY_SIZE: usize = 128;

/// Algorithm class of a crypto context.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlgClass {
    /// Block/stream ciphers
    SymCipher = 1,

    /// Authenticated encryption
    AuthEnc = 2,

    /// Message authentication codes
    Mac = 3,

    /// Message digests
    Hash = 4,
}

impl TryFrom<u32> for AlgClass {
    type Error = HostError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(AlgClass::SymCipher),
            2 => Ok(AlgClass::AuthEnc),
            3 => Ok(AlgClass::Mac),
            4 => Ok(AlgClass::Hash),
            _ => Err(HostError::InvalidArgument),
        }
    }
}

/// Direction of a cipher operation.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoDirection {
    /// Encrypt
    Encrypt = 0,

    /// Decrypt
    Decrypt = 1,
}

impl TryFrom<u32> for CryptoDirection {
    type Error = HostError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(CryptoDirection::Encrypt),
            1 => Ok(CryptoDirection::Decrypt),
            _ => Err(HostError::InvalidArgument),
        }
    }
}

/// AES chaining mode.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherMode {
    /// Electronic codebook
    Ecb = 1,

    /// Cipher block chaining
    Cbc = 2,

    /// Counter mode, 128-bit big-endian counter
    Ctr = 3,
}

impl TryFrom<u32> for CipherMode {
    type Error = HostError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(CipherMode::Ecb),
            2 => Ok(CipherMode::Cbc),
            3 => Ok(CipherMode::Ctr),
            _ => Err(HostError::InvalidArgument),
        }
    }
}

/// Hash algorithm.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashMode {
    /// SHA-1
    Sha1 = 1,

    /// SHA-224
    Sha224 = 2,

    /// SHA-256
    Sha256 = 3,

    /// SHA-384
    Sha384 = 4,

    /// SHA-512
    Sha512 = 5,
}

impl HashMode {
    /// Returns the size of the digest in bytes.
    pub fn digest_size(&self) -> usize {
        match self {
            HashMode::Sha1 => 20,
            HashMode::Sha224 => 28,
            HashMode::Sha256 => 32,
            HashMode::Sha384 => 48,
            HashMode::Sha512 => 64,
        }
    }

    /// Returns the block size of the hash algorithm.
    pub fn block_size(&self) -> usize {
        match self {
            HashMode::Sha1 | HashMode::Sha224 | HashMode::Sha256 => 64,
            HashMode::Sha384 | HashMode::Sha512 => 128,
        }
    }
}

impl TryFrom<u32> for HashMode {
    type Error = HostError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(HashMode::Sha1),
            2 => Ok(HashMode::Sha224),
            3 => Ok(HashMode::Sha256),
            4 => Ok(HashMode::Sha384),
            5 => Ok(HashMode::Sha512),
            _ => Err(HostError::InvalidArgument),
        }
    }
}

/// MAC algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacMode {
    /// HMAC over the given hash
    Hmac(HashMode),

    /// AES-CMAC (NIST SP 800-38B)
    AesCmac,
}

impl MacMode {
    const RAW_CMAC: u32 = 0x100;

    /// Encodes the mode into the context header word.
    pub fn to_raw(self) -> u32 {
        match self {
            MacMode::Hmac(hash) => hash as u32,
            MacMode::AesCmac => Self::RAW_CMAC,
        }
    }

    /// Decodes the context header word.
    pub fn from_raw(raw: u32) -> Result<Self, HostError> {
        if raw == Self::RAW_CMAC {
            Ok(MacMode::AesCmac)
        } else {
            Ok(MacMode::Hmac(HashMode::try_from(raw)?))
        }
    }

    /// Returns the size of the MAC in bytes.
    pub fn mac_size(&self) -> usize {
        match self {
            MacMode::Hmac(hash) => hash.digest_size(),
            MacMode::AesCmac => AES_BLOCK_SIZE,
        }
    }

    /// Returns the processing block size.
    pub fn block_size(&self) -> usize {
        match self {
            MacMode::Hmac(hash) => hash.block_size(),
            MacMode::AesCmac => AES_BLOCK_SIZE,
        }
    }
}

/// Authenticated-encryption algorithm.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthEncMode {
    /// AES-CCM (NIST SP 800-38C)
    Ccm = 1,
}

impl TryFrom<u32> for AuthEncMode {
    type Error = HostError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(AuthEncMode::Ccm),
            _ => Err(HostError::InvalidArgument),
        }
    }
}

/// Symmetric cipher initialization properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymCipherProps {
    /// Chaining mode
    pub mode: CipherMode,

    /// Encrypt or decrypt
    pub direction: CryptoDirection,

    /// AES key, 16, 24 or 32 bytes
    pub key: Vec<u8>,

    /// IV (CBC) or initial counter block (CTR); ignored for ECB
    pub iv: [u8; AES_BLOCK_SIZE],
}

/// Authenticated-encryption initialization properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthEncProps {
    /// Algorithm
    pub mode: AuthEncMode,

    /// Encrypt or decrypt
    pub direction: CryptoDirection,

    /// AES key, 16, 24 or 32 bytes
    pub key: Vec<u8>,

    /// Nonce, 7 to 13 bytes
    pub nonce: Vec<u8>,

    /// Tag size, even number of bytes from 4 to 16
    pub tag_len: usize,

    /// Total associated data size
    pub adata_len: usize,

    /// Total payload size
    pub text_len: usize,
}

/// MAC initialization properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacProps {
    /// Algorithm
    pub mode: MacMode,

    /// Key
    pub key: Vec<u8>,
}

/// Encodes the associated-data length the way CCM prepends it to the data.
///
/// # Returns
/// An empty vector for `adata_len == 0`, else the 2, 6 or 10 byte encoding.
pub fn ccm_adata_prefix(adata_len: usize) -> Vec<u8> {
    let len = adata_len as u64;
    if len == 0 {
        Vec::new()
    } else if len < 0xff00 {
        (len as u16).to_be_bytes().to_vec()
    } else if len <= u32::MAX as u64 {
        let mut out = vec![0xff, 0xfe];
        out.extend_from_slice(&(len as u32).to_be_bytes());
        out
    } else {
        let mut out = vec![0xff, 0xff];
        out.extend_from_slice(&len.to_be_bytes());
        out
    }
}

/// Initialization properties for any algorithm class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlgProps {
    /// Symmetric cipher
    SymCipher(SymCipherProps),

    /// Authenticated encryption
    AuthEnc(AuthEncProps),

    /// MAC
    Mac(MacProps),

    /// Hash
    Hash(HashMode),
}

fn validate_aes_key(key: &[u8]) -> Result<(), HostError> {
    match key.len() {
        16 | 24 | 32 => Ok(()),
        len => {
            tracing::error!(key_len = len, "Invalid AES key size");
            Err(HostError::InvalidArgument)
        }
    }
}

impl AlgProps {
    /// Returns the algorithm class the properties belong to.
    pub fn class(&self) -> AlgClass {
        match self {
            AlgProps::SymCipher(_) => AlgClass::SymCipher,
            AlgProps::AuthEnc(_) => AlgClass::AuthEnc,
            AlgProps::Mac(_) => AlgClass::Mac,
            AlgProps::Hash(_) => AlgClass::Hash,
        }
    }

    /// Checks the properties for sizes the device cannot accept.
    ///
    /// # Error
    /// * `HostError::InvalidArgument` - A key, nonce or length is out of range
    pub fn validate(&self) -> Result<(), HostError> {
        match self {
            AlgProps::SymCipher(props) => validate_aes_key(&props.key),
            AlgProps::AuthEnc(props) => {
                validate_aes_key(&props.key)?;

                if !(7..=13).contains(&props.nonce.len()) {
                    tracing::error!(nonce_len = props.nonce.len(), "Invalid CCM nonce size");
                    Err(HostError::InvalidArgument)?
                }

                if !(4..=16).contains(&props.tag_len) || props.tag_len % 2 != 0 {
                    tracing::error!(tag_len = props.tag_len, "Invalid CCM tag size");
                    Err(HostError::InvalidArgument)?
                }

                // The payload length must fit in the q-byte length field of B0.
                let q = 15 - props.nonce.len();
                if q < 8 && (props.text_len as u64) >> (8 * q) != 0 {
                    tracing::error!(
                        text_len = props.text_len,
                        q,
                        "CCM payload does not fit the length field"
                    );
                    Err(HostError::InvalidArgument)?
                }

                Ok(())
            }
            AlgProps::Mac(props) => match props.mode {
                MacMode::AesCmac => validate_aes_key(&props.key),
                MacMode::Hmac(_) => {
                    if props.key.is_empty() || props.key.len() > MAX_HMAC_KEY_SIZE {
                        tracing::error!(key_len = props.key.len(), "Invalid HMAC key size");
                        Err(HostError::InvalidArgument)?
                    }
                    Ok(())
                }
            },
            AlgProps::Hash(_) => Ok(()),
        }
    }
}
