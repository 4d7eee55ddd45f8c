#![cfg(target_os = "linux")]

//! Hardware TPM gateway over the TSS enhanced system API.
//!
//! One ESAPI context, serialized behind a mutex; a caller arriving while
//! another operation holds the context gets [`Error::Busy`]. All TSS return
//! codes are collapsed into the crate error kinds with the underlying code
//! kept in the message.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;

use tss_esapi::attributes::ObjectAttributesBuilder;
use tss_esapi::handles::{KeyHandle as TssKeyHandle, PersistentTpmHandle, TpmHandle};
use tss_esapi::interface_types::algorithm::{
    HashingAlgorithm, PublicAlgorithm, RsaSchemeAlgorithm,
};
use tss_esapi::interface_types::key_bits::RsaKeyBits;
use tss_esapi::interface_types::resource_handles::Hierarchy;
use tss_esapi::structures::{
    Data, Digest as TssDigest, PcrSelectionListBuilder, PcrSlot, Public, PublicBuilder,
    PublicKeyRsa, PublicRsaParametersBuilder, RsaExponent, RsaScheme, Signature, SignatureScheme,
    SymmetricDefinitionObject, TpmsContext,
};
use tss_esapi::tcti_ldr::TctiNameConf;
use tss_esapi::traits::{Marshall, UnMarshall};
use tss_esapi::Context;

use rsa::traits::PublicKeyParts;

use crate::crypto;
use crate::error::{Error, Result};

use super::{HashAlgorithm, KeyHandle, KeySpec, PcrSelection, TpmGateway, MAX_DIGEST_SIZE};

struct EsysState {
    context: Context,
    handles: HashMap<u64, TssKeyHandle>,
    next_handle: u64,
}

pub struct EsysGateway {
    inner: Mutex<EsysState>,
}

impl EsysGateway {
    /// Connect via the given TCTI string, or probe the default device
    /// nodes when none is configured.
    pub fn connect(tcti: Option<&str>) -> Result<Self> {
        let open = |spec: &str| -> Result<Context> {
            let conf = TctiNameConf::from_str(spec)
                .map_err(|e| Error::TpmLoad(format!("bad TCTI '{spec}': {e}")))?;
            Context::new(conf).map_err(|e| Error::TpmLoad(format!("TCTI '{spec}': {e}")))
        };
        let context = match tcti {
            Some(spec) => open(spec)?,
            None => open("device:/dev/tpmrm0").or_else(|_| open("device:/dev/tpm0"))?,
        };
        Ok(Self {
            inner: Mutex::new(EsysState {
                context,
                handles: HashMap::new(),
                next_handle: 1,
            }),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, EsysState>> {
        self.inner.try_lock().map_err(|_| Error::Busy)
    }
}

fn hashing_algorithm(hash: HashAlgorithm) -> HashingAlgorithm {
    match hash {
        HashAlgorithm::Sha1 => HashingAlgorithm::Sha1,
        HashAlgorithm::Sha256 => HashingAlgorithm::Sha256,
        HashAlgorithm::Sha384 => HashingAlgorithm::Sha384,
        HashAlgorithm::Sha512 => HashingAlgorithm::Sha512,
    }
}

fn pcr_slot(pcr: u8) -> Result<PcrSlot> {
    let slot = match pcr {
        0 => PcrSlot::Slot0,
        1 => PcrSlot::Slot1,
        2 => PcrSlot::Slot2,
        3 => PcrSlot::Slot3,
        4 => PcrSlot::Slot4,
        5 => PcrSlot::Slot5,
        6 => PcrSlot::Slot6,
        7 => PcrSlot::Slot7,
        8 => PcrSlot::Slot8,
        9 => PcrSlot::Slot9,
        10 => PcrSlot::Slot10,
        11 => PcrSlot::Slot11,
        12 => PcrSlot::Slot12,
        13 => PcrSlot::Slot13,
        14 => PcrSlot::Slot14,
        15 => PcrSlot::Slot15,
        16 => PcrSlot::Slot16,
        17 => PcrSlot::Slot17,
        18 => PcrSlot::Slot18,
        19 => PcrSlot::Slot19,
        20 => PcrSlot::Slot20,
        21 => PcrSlot::Slot21,
        22 => PcrSlot::Slot22,
        23 => PcrSlot::Slot23,
        _ => return Err(Error::TpmQuote(format!("PCR slot {pcr} out of range"))),
    };
    Ok(slot)
}

fn pcr_selection_list(
    selections: &[PcrSelection],
) -> Result<tss_esapi::structures::PcrSelectionList> {
    let mut builder = PcrSelectionListBuilder::new();
    for sel in selections {
        if sel.is_empty() {
            continue;
        }
        let slots = sel
            .pcrs
            .iter()
            .map(|&pcr| pcr_slot(pcr))
            .collect::<Result<Vec<_>>>()?;
        builder = builder.with_selection(hashing_algorithm(sel.hash), &slots);
    }
    builder
        .build()
        .map_err(|e| Error::TpmQuote(format!("PCR selection: {e}")))
}

fn rsa_exponent_u32(key: &rsa::RsaPublicKey) -> Result<u32> {
    let bytes = key.e().to_bytes_be();
    if bytes.len() > 4 {
        return Err(Error::TpmLoad("RSA exponent wider than 32 bits".into()));
    }
    Ok(bytes.iter().fold(0u32, |acc, &b| (acc << 8) | u32::from(b)))
}

/// Build a TPM public area for an external RSA verification key.
fn external_rsa_public(key: &rsa::RsaPublicKey) -> Result<Public> {
    let key_bits = match key.n().bits() {
        bits if bits <= 1024 => RsaKeyBits::Rsa1024,
        bits if bits <= 2048 => RsaKeyBits::Rsa2048,
        bits if bits <= 3072 => RsaKeyBits::Rsa3072,
        _ => RsaKeyBits::Rsa4096,
    };
    let object_attributes = ObjectAttributesBuilder::new()
        .with_user_with_auth(true)
        .with_sign_encrypt(true)
        .build()
        .map_err(|e| Error::TpmLoad(format!("object attributes: {e}")))?;
    let rsa_params = PublicRsaParametersBuilder::new()
        .with_symmetric(SymmetricDefinitionObject::Null)
        .with_scheme(
            RsaScheme::create(RsaSchemeAlgorithm::RsaPss, Some(HashingAlgorithm::Sha256))
                .map_err(|e| Error::TpmLoad(format!("scheme: {e}")))?,
        )
        .with_key_bits(key_bits)
        .with_exponent(
            RsaExponent::create(rsa_exponent_u32(key)?)
                .map_err(|e| Error::TpmLoad(format!("exponent: {e}")))?,
        )
        .build()
        .map_err(|e| Error::TpmLoad(format!("RSA parameters: {e}")))?;
    PublicBuilder::new()
        .with_public_algorithm(PublicAlgorithm::Rsa)
        .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
        .with_object_attributes(object_attributes)
        .with_rsa_parameters(rsa_params)
        .with_rsa_unique_identifier(
            PublicKeyRsa::try_from(key.n().to_bytes_be())
                .map_err(|e| Error::TpmLoad(format!("modulus: {e}")))?,
        )
        .build()
        .map_err(|e| Error::TpmLoad(format!("public area: {e}")))
}

impl EsysGateway {
    fn register(state: &mut EsysState, handle: TssKeyHandle) -> KeyHandle {
        let id = state.next_handle;
        state.next_handle += 1;
        state.handles.insert(id, handle);
        KeyHandle(id)
    }

    fn resolve(state: &EsysState, key: KeyHandle) -> Result<TssKeyHandle> {
        state
            .handles
            .get(&key.0)
            .copied()
            .ok_or_else(|| Error::TpmLoad(format!("unknown handle {}", key.0)))
    }
}

impl TpmGateway for EsysGateway {
    fn load_signing_key(&self, spec: &KeySpec) -> Result<KeyHandle> {
        let mut state = self.lock()?;
        let handle = match spec {
            KeySpec::Context(blob) => {
                let tpms_context = TpmsContext::unmarshall(blob)
                    .map_err(|e| Error::TpmLoad(format!("key context blob: {e}")))?;
                state
                    .context
                    .context_load(tpms_context)
                    .map_err(|e| Error::TpmLoad(format!("context load: {e}")))?
                    .into()
            }
            KeySpec::Persistent(raw) => {
                let persistent = PersistentTpmHandle::new(*raw)
                    .map_err(|e| Error::TpmLoad(format!("persistent handle: {e}")))?;
                state
                    .context
                    .tr_from_tpm_public(TpmHandle::Persistent(persistent))
                    .map_err(|e| Error::TpmLoad(format!("persistent handle lookup: {e}")))?
                    .into()
            }
        };
        Ok(Self::register(&mut state, handle))
    }

    fn load_external_public_key(&self, blob: &[u8]) -> Result<KeyHandle> {
        let mut state = self.lock()?;
        // Raw TPM public areas load as-is; DER key material is rebuilt
        // into a public area first.
        let public = match Public::unmarshall(blob) {
            Ok(public) => public,
            Err(_) => {
                let key = crypto::attestation_key_from_blob(blob)
                    .map_err(|e| Error::TpmLoad(e.to_string()))?;
                external_rsa_public(&key)?
            }
        };
        let handle = state
            .context
            .load_external_public(public, Hierarchy::Owner)
            .map_err(|e| Error::TpmLoad(format!("load external public: {e}")))?;
        Ok(Self::register(&mut state, handle))
    }

    fn quote(
        &self,
        key: KeyHandle,
        selections: &[PcrSelection],
        qualifying_data: &[u8],
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut state = self.lock()?;
        if qualifying_data.len() > MAX_DIGEST_SIZE {
            return Err(Error::TpmQuote("qualifying data too long".into()));
        }
        let handle = Self::resolve(&state, key)?;
        let selection_list = pcr_selection_list(selections)?;
        let qualifying = Data::try_from(qualifying_data.to_vec())
            .map_err(|e| Error::TpmQuote(format!("qualifying data: {e}")))?;

        let (attest, signature) = state
            .context
            .execute_with_nullauth_session(|ctx| {
                ctx.quote(handle, qualifying, SignatureScheme::Null, selection_list)
            })
            .map_err(|e| Error::TpmQuote(format!("quote: {e}")))?;

        let attest_bytes = attest
            .marshall()
            .map_err(|e| Error::TpmQuote(format!("attest marshal: {e}")))?;
        let signature_bytes = signature
            .marshall()
            .map_err(|e| Error::TpmQuote(format!("signature marshal: {e}")))?;
        Ok((attest_bytes, signature_bytes))
    }

    fn verify_signature(
        &self,
        key: KeyHandle,
        hash: HashAlgorithm,
        message: &[u8],
        signature: &[u8],
    ) -> Result<bool> {
        let mut state = self.lock()?;
        let handle = Self::resolve(&state, key)?;
        let signature = match Signature::unmarshall(signature) {
            Ok(sig) => sig,
            Err(e) => {
                log::debug!("unparsable signature structure: {e}");
                return Ok(false);
            }
        };
        let digest = TssDigest::try_from(hash.digest(message))
            .map_err(|e| Error::TpmQuote(format!("digest: {e}")))?;

        match state
            .context
            .execute_without_session(|ctx| ctx.verify_signature(handle, digest, signature))
        {
            Ok(_ticket) => Ok(true),
            Err(e) => {
                log::debug!("TPM signature verification failed: {e}");
                Ok(false)
            }
        }
    }

    fn random_bytes(&self, n: usize) -> Result<Vec<u8>> {
        let mut state = self.lock()?;
        let digest = state
            .context
            .get_random(n)
            .map_err(|e| Error::TpmRandom(format!("get random: {e}")))?;
        Ok(digest.value().to_vec())
    }

    fn flush(&self, key: KeyHandle) {
        let mut state = match self.inner.lock() {
            Ok(state) => state,
            Err(_) => return,
        };
        let Some(handle) = state.handles.remove(&key.0) else {
            log::debug!("flush of handle {} with nothing loaded", key.0);
            return;
        };
        if let Err(e) = state.context.flush_context(handle.into()) {
            log::error!("TSS cleanup of handle {} failed: {e}", key.0);
        }
    }
}
