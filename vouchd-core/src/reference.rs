//! Reference PCR store.
//!
//! Trusted platform states are described in a YAML file mapping a hash
//! algorithm name to a list of candidate states; each candidate maps PCR
//! index to the hex value expected in that register:
//!
//! ```yaml
//! sha256:
//!   - 0: "66687aadf862bd776c8fc18b8e9f8e20089714856ee233b3902a591d0d5f2925"
//!     1: "0000000000000000000000000000000000000000000000000000000000000000"
//! ```
//!
//! A quote's PCR composite digest is accepted if it equals the composite
//! of *any* candidate over the requested indices, so a file can describe
//! several acceptable system states at once.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::tpm::{HashAlgorithm, MAX_PCR_INDEX};

#[derive(Debug, Deserialize)]
#[serde(transparent)]
struct RawReferenceFile(HashMap<String, Vec<BTreeMap<u8, String>>>);

/// One trusted platform state: the expected value of each listed PCR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceState {
    values: BTreeMap<u8, Vec<u8>>,
}

impl ReferenceState {
    /// Composite digest over the requested indices, ascending.
    /// `None` if the state does not cover every requested index.
    fn composite(&self, hash: HashAlgorithm, indices: &[u8]) -> Option<Vec<u8>> {
        let mut concat = Vec::with_capacity(indices.len() * hash.digest_len());
        for idx in indices {
            concat.extend_from_slice(self.values.get(idx)?);
        }
        Some(hash.digest(&concat))
    }
}

/// In-memory index of the reference PCR file.
#[derive(Debug, Clone, Default)]
pub struct ReferencePcrStore {
    banks: HashMap<HashAlgorithm, Vec<ReferenceState>>,
}

impl ReferencePcrStore {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            Error::ReferenceInvalid(format!("cannot read '{}': {e}", path.display()))
        })?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let raw: RawReferenceFile = serde_yaml::from_str(text)
            .map_err(|e| Error::ReferenceInvalid(format!("YAML parse error: {e}")))?;

        let mut banks = HashMap::new();
        for (bank_name, candidates) in raw.0 {
            let hash = HashAlgorithm::from_name(&bank_name).ok_or_else(|| {
                Error::ReferenceInvalid(format!("unknown PCR bank '{bank_name}'"))
            })?;
            let mut states = Vec::with_capacity(candidates.len());
            for candidate in candidates {
                let mut values = BTreeMap::new();
                for (idx, hex_value) in candidate {
                    if idx > MAX_PCR_INDEX {
                        return Err(Error::ReferenceInvalid(format!(
                            "PCR index {idx} out of range in bank '{bank_name}'"
                        )));
                    }
                    let stripped = hex_value
                        .strip_prefix("0x")
                        .unwrap_or(hex_value.as_str());
                    let value = hex::decode(stripped).map_err(|e| {
                        Error::ReferenceInvalid(format!(
                            "bad hex for PCR {idx} in bank '{bank_name}': {e}"
                        ))
                    })?;
                    if value.len() != hash.digest_len() {
                        return Err(Error::ReferenceInvalid(format!(
                            "PCR {idx} in bank '{bank_name}' is {} bytes, expected {}",
                            value.len(),
                            hash.digest_len()
                        )));
                    }
                    values.insert(idx, value);
                }
                states.push(ReferenceState { values });
            }
            banks.insert(hash, states);
        }
        Ok(Self { banks })
    }

    /// Check an observed PCR composite digest against every candidate state
    /// of the given bank. `Ok(true)` iff any candidate composite matches.
    pub fn check_pcr_digest(
        &self,
        hash: HashAlgorithm,
        indices: &[u8],
        observed: &[u8],
    ) -> Result<bool> {
        let states = self.banks.get(&hash).ok_or_else(|| {
            Error::ReferenceInvalid(format!("no reference candidates for bank '{}'", hash.name()))
        })?;
        for (i, state) in states.iter().enumerate() {
            match state.composite(hash, indices) {
                Some(expected) if expected == observed => {
                    log::debug!(
                        "PCR digest matches reference candidate {i} of bank '{}'",
                        hash.name()
                    );
                    return Ok(true);
                }
                Some(_) => {}
                None => {
                    return Err(Error::ReferenceInvalid(format!(
                        "reference candidate {i} of bank '{}' does not cover all requested PCRs",
                        hash.name()
                    )));
                }
            }
        }
        Ok(false)
    }
}
