//! In-process software TPM gateway.
//!
//! Used on hosts without TPM hardware and throughout the test suite. It
//! keeps a full set of PCR banks, produces byte-exact marshalled
//! attestation structures and RSA-PSS signatures, and tracks loaded
//! handles so tests can assert handle hygiene.

use std::collections::HashMap;
use std::sync::Mutex;

use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs8::EncodePublicKey;
use rsa::pss::Pss;
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

use crate::crypto;
use crate::error::{Error, Result};
use crate::quote::{ClockInfo, QuoteAttestation, TpmtSignature, TPM_ALG_RSAPSS};
use crate::quote::{TPM_GENERATED_MAGIC, TPM_ST_ATTEST_QUOTE};

use super::{HashAlgorithm, KeyHandle, KeySpec, PcrSelection, TpmGateway, MAX_DIGEST_SIZE};

const PCR_COUNT: usize = 24;
const SOFTWARE_FIRMWARE_VERSION: u64 = 0x0001_0000_0000_0000;

enum LoadedObject {
    SigningKey,
    ExternalKey(RsaPublicKey),
}

struct State {
    signing_key: RsaPrivateKey,
    public_key: RsaPublicKey,
    qualified_signer: Vec<u8>,
    banks: HashMap<HashAlgorithm, Vec<Vec<u8>>>,
    loaded: HashMap<u64, LoadedObject>,
    next_handle: u64,
    flushes: u64,
    clock: u64,
}

impl State {
    fn bank(&mut self, hash: HashAlgorithm) -> &mut Vec<Vec<u8>> {
        self.banks
            .entry(hash)
            .or_insert_with(|| vec![vec![0u8; hash.digest_len()]; PCR_COUNT])
    }
}

pub struct SoftwareTpm {
    inner: Mutex<State>,
}

impl Default for SoftwareTpm {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftwareTpm {
    pub fn new() -> Self {
        let signing_key = RsaPrivateKey::new(&mut OsRng, 2048).expect("RSA key generation");
        let public_key = signing_key.to_public_key();
        let qualified_signer = Sha256::digest(
            public_key
                .to_public_key_der()
                .expect("public key encoding")
                .as_bytes(),
        )
        .to_vec();
        Self {
            inner: Mutex::new(State {
                signing_key,
                public_key,
                qualified_signer,
                banks: HashMap::new(),
                loaded: HashMap::new(),
                next_handle: 1,
                flushes: 0,
                clock: 0,
            }),
        }
    }

    /// DER (SubjectPublicKeyInfo) encoding of the attestation public key,
    /// suitable for the verifier's attestation-public-key file.
    pub fn public_key_der(&self) -> Vec<u8> {
        self.inner
            .lock()
            .expect("software TPM state")
            .public_key
            .to_public_key_der()
            .expect("public key encoding")
            .as_bytes()
            .to_vec()
    }

    /// Extend a PCR with a measurement, TPM-style:
    /// `new = H(old || H(measurement))`.
    pub fn extend_pcr(&self, hash: HashAlgorithm, index: u8, measurement: &[u8]) {
        let mut state = self.inner.lock().expect("software TPM state");
        let digest = hash.digest(measurement);
        let bank = state.bank(hash);
        let old = bank[index as usize].clone();
        let mut concat = old;
        concat.extend_from_slice(&digest);
        bank[index as usize] = hash.digest(&concat);
    }

    pub fn pcr_value(&self, hash: HashAlgorithm, index: u8) -> Vec<u8> {
        let mut state = self.inner.lock().expect("software TPM state");
        state.bank(hash)[index as usize].clone()
    }

    pub fn outstanding_handles(&self) -> usize {
        self.inner.lock().expect("software TPM state").loaded.len()
    }

    pub fn flush_count(&self) -> u64 {
        self.inner.lock().expect("software TPM state").flushes
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>> {
        self.inner.try_lock().map_err(|_| Error::Busy)
    }
}

impl TpmGateway for SoftwareTpm {
    fn load_signing_key(&self, spec: &KeySpec) -> Result<KeyHandle> {
        let mut state = self.lock()?;
        match spec {
            KeySpec::Context(blob) if blob.is_empty() => {
                return Err(Error::TpmLoad("empty key context blob".into()));
            }
            KeySpec::Context(_) => {}
            KeySpec::Persistent(handle) => {
                if !(0x8100_0000..=0x81FF_FFFF).contains(handle) {
                    return Err(Error::TpmLoad(format!(
                        "persistent handle {handle:#010x} out of range"
                    )));
                }
            }
        }
        let id = state.next_handle;
        state.next_handle += 1;
        state.loaded.insert(id, LoadedObject::SigningKey);
        Ok(KeyHandle(id))
    }

    fn load_external_public_key(&self, blob: &[u8]) -> Result<KeyHandle> {
        let mut state = self.lock()?;
        let key =
            crypto::attestation_key_from_blob(blob).map_err(|e| Error::TpmLoad(e.to_string()))?;
        let id = state.next_handle;
        state.next_handle += 1;
        state.loaded.insert(id, LoadedObject::ExternalKey(key));
        Ok(KeyHandle(id))
    }

    fn quote(
        &self,
        key: KeyHandle,
        selections: &[PcrSelection],
        qualifying_data: &[u8],
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut state = self.lock()?;
        match state.loaded.get(&key.0) {
            Some(LoadedObject::SigningKey) => {}
            Some(LoadedObject::ExternalKey(_)) => {
                return Err(Error::TpmQuote("handle is not a signing key".into()));
            }
            None => return Err(Error::TpmQuote(format!("unknown handle {}", key.0))),
        }
        if qualifying_data.len() > MAX_DIGEST_SIZE {
            return Err(Error::TpmQuote("qualifying data too long".into()));
        }
        let selected: Vec<&PcrSelection> =
            selections.iter().filter(|sel| !sel.is_empty()).collect();
        if selected.is_empty() {
            return Err(Error::TpmQuote("empty PCR selection".into()));
        }

        let mut concat = Vec::new();
        for sel in &selected {
            let bank = state.bank(sel.hash).clone();
            for &idx in &sel.pcrs {
                concat.extend_from_slice(&bank[idx as usize]);
            }
        }
        let pcr_digest = Sha256::digest(&concat).to_vec();

        state.clock += 1;
        let attest = QuoteAttestation {
            magic: TPM_GENERATED_MAGIC,
            attest_type: TPM_ST_ATTEST_QUOTE,
            qualified_signer: state.qualified_signer.clone(),
            extra_data: qualifying_data.to_vec(),
            clock_info: ClockInfo {
                clock: state.clock,
                reset_count: 0,
                restart_count: 0,
                safe: true,
            },
            firmware_version: SOFTWARE_FIRMWARE_VERSION,
            pcr_select: selected.iter().map(|sel| (*sel).clone()).collect(),
            pcr_digest,
        };
        let attest_bytes = attest.encode();

        let digest = Sha256::digest(&attest_bytes);
        let raw = state
            .signing_key
            .sign_with_rng(&mut OsRng, Pss::new::<Sha256>(), &digest)
            .map_err(|e| Error::TpmQuote(format!("signing failed: {e}")))?;
        let signature = TpmtSignature {
            scheme: TPM_ALG_RSAPSS,
            hash_alg: HashAlgorithm::Sha256.tpm_alg_id(),
            raw,
        }
        .encode();

        Ok((attest_bytes, signature))
    }

    fn verify_signature(
        &self,
        key: KeyHandle,
        hash: HashAlgorithm,
        message: &[u8],
        signature: &[u8],
    ) -> Result<bool> {
        let state = self.lock()?;
        let public = match state.loaded.get(&key.0) {
            Some(LoadedObject::ExternalKey(k)) => k.clone(),
            Some(LoadedObject::SigningKey) => state.public_key.clone(),
            None => return Err(Error::TpmLoad(format!("unknown handle {}", key.0))),
        };
        let parsed = match TpmtSignature::parse(signature) {
            Ok(sig) => sig,
            Err(e) => {
                log::debug!("unparsable signature structure: {e}");
                return Ok(false);
            }
        };
        Ok(crypto::verify_rsa_pss(&public, hash, message, &parsed.raw))
    }

    fn random_bytes(&self, n: usize) -> Result<Vec<u8>> {
        let _state = self.lock()?;
        let mut out = vec![0u8; n];
        OsRng.fill_bytes(&mut out);
        Ok(out)
    }

    fn flush(&self, key: KeyHandle) {
        let mut state = match self.inner.lock() {
            Ok(state) => state,
            Err(_) => return,
        };
        state.flushes += 1;
        if state.loaded.remove(&key.0).is_none() {
            log::debug!("flush of handle {} with nothing loaded", key.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quote::QuoteAttestation;

    fn loaded_tpm() -> (SoftwareTpm, KeyHandle) {
        let tpm = SoftwareTpm::new();
        let handle = tpm
            .load_signing_key(&KeySpec::Context(b"ctx".to_vec()))
            .expect("load");
        (tpm, handle)
    }

    fn sha256_selection(pcrs: &[u8]) -> PcrSelection {
        PcrSelection::new(HashAlgorithm::Sha256, pcrs.to_vec()).expect("selection")
    }

    #[test]
    fn test_quote_binds_nonce_and_pcrs() {
        let (tpm, handle) = loaded_tpm();
        let nonce = vec![0x42; 20];
        let (attest, signature) = tpm
            .quote(handle, &[sha256_selection(&[0, 1, 7])], &nonce)
            .expect("quote");

        let parsed = QuoteAttestation::parse(&attest).expect("parse");
        assert!(parsed.is_genuine_quote());
        assert_eq!(parsed.extra_data, nonce);
        assert_eq!(parsed.pcr_select, vec![sha256_selection(&[0, 1, 7])]);

        assert!(tpm
            .verify_signature(handle, HashAlgorithm::Sha256, &attest, &signature)
            .expect("verify"));
        tpm.flush(handle);
    }

    #[test]
    fn test_quote_changes_after_pcr_extend() {
        let (tpm, handle) = loaded_tpm();
        let sel = [sha256_selection(&[10])];
        let (attest_before, _) = tpm.quote(handle, &sel, &[1; 20]).expect("quote");
        tpm.extend_pcr(HashAlgorithm::Sha256, 10, b"event");
        let (attest_after, _) = tpm.quote(handle, &sel, &[1; 20]).expect("quote");

        let before = QuoteAttestation::parse(&attest_before).expect("parse");
        let after = QuoteAttestation::parse(&attest_after).expect("parse");
        assert_ne!(before.pcr_digest, after.pcr_digest);
        tpm.flush(handle);
    }

    #[test]
    fn test_empty_selection_rejected() {
        let (tpm, handle) = loaded_tpm();
        let err = tpm
            .quote(handle, &[sha256_selection(&[])], &[1; 20])
            .expect_err("empty selection");
        assert!(matches!(err, Error::TpmQuote(_)));
        tpm.flush(handle);
    }

    #[test]
    fn test_oversized_qualifying_data_rejected() {
        let (tpm, handle) = loaded_tpm();
        let err = tpm
            .quote(handle, &[sha256_selection(&[0])], &[0; MAX_DIGEST_SIZE + 1])
            .expect_err("oversized nonce");
        assert!(matches!(err, Error::TpmQuote(_)));
        tpm.flush(handle);
    }

    #[test]
    fn test_persistent_handle_range_checked() {
        let tpm = SoftwareTpm::new();
        assert!(tpm.load_signing_key(&KeySpec::Persistent(0x8100_0010)).is_ok());
        assert!(matches!(
            tpm.load_signing_key(&KeySpec::Persistent(0x0100_0010)),
            Err(Error::TpmLoad(_))
        ));
    }

    #[test]
    fn test_flush_is_idempotent() {
        let (tpm, handle) = loaded_tpm();
        tpm.flush(handle);
        tpm.flush(handle);
        assert_eq!(tpm.outstanding_handles(), 0);
        assert_eq!(tpm.flush_count(), 2);
    }

    #[test]
    fn test_random_bytes_lengths() {
        let tpm = SoftwareTpm::new();
        assert_eq!(tpm.random_bytes(20).expect("random").len(), 20);
        assert_ne!(
            tpm.random_bytes(20).expect("random"),
            tpm.random_bytes(20).expect("random")
        );
    }

    #[test]
    fn test_external_key_verification_path() {
        let (tpm, signing) = loaded_tpm();
        let (attest, signature) = tpm
            .quote(signing, &[sha256_selection(&[0])], &[7; 20])
            .expect("quote");

        let external = tpm
            .load_external_public_key(&tpm.public_key_der())
            .expect("load external");
        assert!(tpm
            .verify_signature(external, HashAlgorithm::Sha256, &attest, &signature)
            .expect("verify"));

        // A tampered blob must not verify.
        let mut tampered = attest.clone();
        tampered[10] ^= 1;
        assert!(!tpm
            .verify_signature(external, HashAlgorithm::Sha256, &tampered, &signature)
            .expect("verify"));

        tpm.flush(signing);
        tpm.flush(external);
        assert_eq!(tpm.outstanding_handles(), 0);
    }
}
