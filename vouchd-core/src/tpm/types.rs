use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};

use crate::error::{Error, Result};

/// Highest PCR index a selection may name.
pub const MAX_PCR_INDEX: u8 = 23;

/// Size of the largest TPM hash digest (sha512); upper bound for nonces.
pub const MAX_DIGEST_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HashAlgorithm {
    Sha1 = 0x0004,
    Sha256 = 0x000B,
    Sha384 = 0x000C,
    Sha512 = 0x000D,
}

impl HashAlgorithm {
    pub fn tpm_alg_id(self) -> u16 {
        self as u16
    }

    pub fn from_tpm_alg_id(id: u16) -> Option<Self> {
        match id {
            0x0004 => Some(HashAlgorithm::Sha1),
            0x000B => Some(HashAlgorithm::Sha256),
            0x000C => Some(HashAlgorithm::Sha384),
            0x000D => Some(HashAlgorithm::Sha512),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "sha1" => Some(HashAlgorithm::Sha1),
            "sha256" => Some(HashAlgorithm::Sha256),
            "sha384" => Some(HashAlgorithm::Sha384),
            "sha512" => Some(HashAlgorithm::Sha512),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            HashAlgorithm::Sha1 => "sha1",
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha384 => "sha384",
            HashAlgorithm::Sha512 => "sha512",
        }
    }

    pub fn digest_len(self) -> usize {
        match self {
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha384 => 48,
            HashAlgorithm::Sha512 => 64,
        }
    }

    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            HashAlgorithm::Sha1 => Sha1::digest(data).to_vec(),
            HashAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
            HashAlgorithm::Sha384 => Sha384::digest(data).to_vec(),
            HashAlgorithm::Sha512 => Sha512::digest(data).to_vec(),
        }
    }
}

/// A PCR bank selection: one hash algorithm plus the indices to quote.
///
/// Index lists are kept sorted ascending without duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcrSelection {
    pub hash: HashAlgorithm,
    pub pcrs: Vec<u8>,
}

impl PcrSelection {
    pub fn new(hash: HashAlgorithm, mut pcrs: Vec<u8>) -> Result<Self> {
        if let Some(&bad) = pcrs.iter().find(|&&p| p > MAX_PCR_INDEX) {
            return Err(Error::MalformedMessage(format!(
                "PCR index {bad} out of range"
            )));
        }
        pcrs.sort_unstable();
        pcrs.dedup();
        Ok(Self { hash, pcrs })
    }

    pub fn is_empty(&self) -> bool {
        self.pcrs.is_empty()
    }
}

/// Where the attester's signing key comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySpec {
    /// A serialized TPM key context blob, read from disk.
    Context(Vec<u8>),
    /// A persistent handle already resident in the TPM.
    Persistent(u32),
}

/// Opaque gateway-local handle for a loaded TPM object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyHandle(pub(crate) u64);
