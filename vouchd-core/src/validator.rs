//! Quote verification pipeline.
//!
//! Four predicates decide the verdict: the TPM-path signature check, the
//! TPM magic, the nonce binding, and the PCR composite digest. A fifth,
//! advisory check re-verifies the signature in software; by default its
//! failure only logs a warning, but the policy can require both paths to
//! agree. Every predicate is evaluated and logged even after an earlier
//! one fails, so one run yields a complete diagnostic picture.

use crate::crypto;
use crate::error::{Error, FailureKind, Result};
use crate::quote::{QuoteAttestation, TpmtSignature};
use crate::reference::ReferencePcrStore;
use crate::tpm::{HashAlgorithm, ScopedKey, TpmGateway};
use crate::wire::{AttestationRequest, AttestationResponse};

#[derive(Debug, Clone, Copy)]
pub struct ValidationPolicy {
    /// Hash algorithm for signature digests and PCR composition.
    pub hash: HashAlgorithm,
    /// When set, the software signature path must agree with the TPM path
    /// for the verdict to hold.
    pub require_software_signature: bool,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self {
            hash: HashAlgorithm::Sha256,
            require_software_signature: false,
        }
    }
}

/// Outcome of every predicate, evaluated unconditionally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerificationReport {
    pub tpm_signature_valid: bool,
    pub software_signature_valid: bool,
    pub magic_valid: bool,
    pub nonce_valid: bool,
    pub pcr_digest_valid: bool,
}

impl VerificationReport {
    /// Combine the predicates under the given policy. On failure, names
    /// the first failing predicate in evaluation order.
    pub fn verdict(&self, policy: &ValidationPolicy) -> std::result::Result<(), FailureKind> {
        let signature_ok = self.tpm_signature_valid
            && (!policy.require_software_signature || self.software_signature_valid);
        if !signature_ok {
            return Err(FailureKind::SignatureInvalid);
        }
        if !self.magic_valid {
            return Err(FailureKind::MagicMismatch);
        }
        if !self.nonce_valid {
            return Err(FailureKind::NonceMismatch);
        }
        if !self.pcr_digest_valid {
            return Err(FailureKind::NoReferenceMatch);
        }
        Ok(())
    }
}

/// Run the full verification pipeline over a decoded response.
///
/// Infrastructure failures (key material, reference file, unparsable
/// attestation structure) surface as errors; predicate outcomes land in
/// the report.
pub fn verify_quote(
    gateway: &dyn TpmGateway,
    policy: &ValidationPolicy,
    reference: &ReferencePcrStore,
    attestation_key_blob: &[u8],
    request: &AttestationRequest,
    response: &AttestationResponse,
) -> Result<VerificationReport> {
    let attest_bytes = &response.tpm_quote.attestation_data;
    let signature_bytes = &response.tpm_quote.signature;

    // Predicate 1: signature, TPM path. The external key handle is scoped
    // so it is flushed however this function exits.
    let external = ScopedKey::new(
        gateway,
        gateway.load_external_public_key(attestation_key_blob)?,
    );
    let tpm_signature_valid = match gateway.verify_signature(
        external.handle(),
        policy.hash,
        attest_bytes,
        signature_bytes,
    ) {
        Ok(valid) => valid,
        Err(e) => {
            log::error!("TPM signature verification errored: {e}");
            false
        }
    };
    if tpm_signature_valid {
        log::info!("quote signature is valid (TPM path)");
    } else {
        log::error!("quote signature is NOT valid (TPM path)");
    }

    // Advisory cross-check: signature, software path.
    let software_signature_valid = match software_signature_check(
        policy.hash,
        attestation_key_blob,
        attest_bytes,
        signature_bytes,
    ) {
        Ok(valid) => valid,
        Err(e) => {
            log::warn!("software signature path unavailable: {e}");
            false
        }
    };
    if software_signature_valid {
        log::info!("quote signature is valid (software path)");
    } else {
        log::warn!("quote signature is NOT valid (software path)");
    }
    if tpm_signature_valid != software_signature_valid {
        log::warn!(
            "signature verification paths disagree (TPM: {tpm_signature_valid}, software: {software_signature_valid})"
        );
    }

    let attest = QuoteAttestation::parse(attest_bytes)?;

    // Predicate 3: TPM magic and attestation type.
    let magic_valid = attest.is_genuine_quote();
    if magic_valid {
        log::info!("TPM magic is valid");
    } else {
        log::error!(
            "TPM magic is NOT valid (magic {:#010x}, type {:#06x}); this may be a bogus quote",
            attest.magic,
            attest.attest_type
        );
    }

    // Predicate 4: nonce binding.
    let nonce_valid = attest.extra_data == request.nonce;
    if nonce_valid {
        log::info!("qualifying data matches the challenge nonce");
    } else {
        log::error!("qualifying data does NOT match the challenge nonce");
    }

    // Predicate 5: PCR composite digest against the reference candidates.
    log::info!(
        "attested PCR composite digest: 0x{}",
        hex::encode(&attest.pcr_digest)
    );
    let pcr_digest_valid = check_reference(policy, reference, request, &attest);
    if pcr_digest_valid {
        log::info!("PCR composite digest is valid");
    } else {
        log::error!("PCR composite digest matches no reference candidate");
    }

    if response.pcr_logs.is_empty() {
        log::info!("no PCR logs received");
    }
    for log_entry in &response.pcr_logs {
        log::info!(
            "received PCR log '{}' [{} bytes]",
            log_entry.identifier.as_str(),
            log_entry.content.len()
        );
    }

    Ok(VerificationReport {
        tpm_signature_valid,
        software_signature_valid,
        magic_valid,
        nonce_valid,
        pcr_digest_valid,
    })
}

fn software_signature_check(
    hash: HashAlgorithm,
    attestation_key_blob: &[u8],
    attest_bytes: &[u8],
    signature_bytes: &[u8],
) -> Result<bool> {
    let key = crypto::attestation_key_from_blob(attestation_key_blob)?;
    let signature = TpmtSignature::parse(signature_bytes)?;
    Ok(crypto::verify_rsa_pss(
        &key,
        hash,
        attest_bytes,
        &signature.raw,
    ))
}

fn check_reference(
    policy: &ValidationPolicy,
    reference: &ReferencePcrStore,
    request: &AttestationRequest,
    attest: &QuoteAttestation,
) -> bool {
    let Some(selection) = request
        .pcr_selections
        .iter()
        .find(|sel| sel.hash == policy.hash && !sel.is_empty())
    else {
        log::warn!(
            "request carries no PCR selection for bank '{}'",
            policy.hash.name()
        );
        return false;
    };
    match reference.check_pcr_digest(policy.hash, &selection.pcrs, &attest.pcr_digest) {
        Ok(matched) => matched,
        Err(e) => {
            log::error!("reference check failed: {e}");
            false
        }
    }
}

/// Map a failed verdict into the crate error for exit-code purposes.
pub fn verdict_error(kind: FailureKind) -> Error {
    Error::AttestationFailed(kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tpm::{KeySpec, PcrSelection, SoftwareTpm};
    use crate::wire::{AttestationRequest, AttestationResponse, TpmQuote, TAP_SPEC_VERSION};

    fn sha256_selection(pcrs: &[u8]) -> PcrSelection {
        PcrSelection::new(HashAlgorithm::Sha256, pcrs.to_vec()).expect("selection")
    }

    fn request_with_nonce(nonce: &[u8]) -> AttestationRequest {
        AttestationRequest {
            tap_spec_version: TAP_SPEC_VERSION,
            hello: false,
            sig_key_id: b"PK.RSA.default".to_vec(),
            nonce: nonce.to_vec(),
            pcr_selections: vec![sha256_selection(&[0, 1, 7])],
            pcr_logs: Vec::new(),
        }
    }

    fn reference_for(tpm: &SoftwareTpm, pcrs: &[u8]) -> ReferencePcrStore {
        let mut yaml = String::from("sha256:\n  - ");
        for (i, &pcr) in pcrs.iter().enumerate() {
            let value = hex::encode(tpm.pcr_value(HashAlgorithm::Sha256, pcr));
            if i > 0 {
                yaml.push_str("    ");
            }
            yaml.push_str(&format!("{pcr}: \"{value}\"\n"));
        }
        ReferencePcrStore::from_yaml(&yaml).expect("reference")
    }

    fn quote_response(tpm: &SoftwareTpm, request: &AttestationRequest) -> AttestationResponse {
        let handle = tpm
            .load_signing_key(&KeySpec::Context(b"ctx".to_vec()))
            .expect("load");
        let scoped = ScopedKey::new(tpm, handle);
        let (attestation_data, signature) = tpm
            .quote(scoped.handle(), &request.pcr_selections, &request.nonce)
            .expect("quote");
        AttestationResponse {
            tpm_quote: TpmQuote {
                attestation_data,
                signature,
            },
            pcr_logs: Vec::new(),
        }
    }

    #[test]
    fn test_happy_path_verdict() {
        let tpm = SoftwareTpm::new();
        let request = request_with_nonce(&[0x11; 20]);
        let response = quote_response(&tpm, &request);
        let reference = reference_for(&tpm, &[0, 1, 7]);
        let policy = ValidationPolicy::default();

        let report = verify_quote(
            &tpm,
            &policy,
            &reference,
            &tpm.public_key_der(),
            &request,
            &response,
        )
        .expect("verify");
        assert!(report.tpm_signature_valid);
        assert!(report.software_signature_valid);
        assert!(report.magic_valid);
        assert!(report.nonce_valid);
        assert!(report.pcr_digest_valid);
        assert!(report.verdict(&policy).is_ok());
        assert_eq!(tpm.outstanding_handles(), 0);
    }

    #[test]
    fn test_tampered_nonce_fails_nonce_predicate() {
        let tpm = SoftwareTpm::new();
        let request = request_with_nonce(&[0x22; 20]);
        // The attester quotes over a different nonce than the challenge.
        let mut tampered = request.clone();
        tampered.nonce = vec![0x33; 20];
        let response = quote_response(&tpm, &tampered);
        let reference = reference_for(&tpm, &[0, 1, 7]);
        let policy = ValidationPolicy::default();

        let report = verify_quote(
            &tpm,
            &policy,
            &reference,
            &tpm.public_key_der(),
            &request,
            &response,
        )
        .expect("verify");
        assert!(report.tpm_signature_valid);
        assert!(report.magic_valid);
        assert!(!report.nonce_valid);
        assert_eq!(report.verdict(&policy), Err(FailureKind::NonceMismatch));
    }

    #[test]
    fn test_wrong_pcr_state_fails_reference_predicate() {
        let tpm = SoftwareTpm::new();
        let request = request_with_nonce(&[0x44; 20]);
        let reference = reference_for(&tpm, &[0, 1, 7]);
        // Platform state drifts after the reference was recorded.
        tpm.extend_pcr(HashAlgorithm::Sha256, 7, b"rogue kernel module");
        let response = quote_response(&tpm, &request);
        let policy = ValidationPolicy::default();

        let report = verify_quote(
            &tpm,
            &policy,
            &reference,
            &tpm.public_key_der(),
            &request,
            &response,
        )
        .expect("verify");
        assert!(report.tpm_signature_valid);
        assert!(report.nonce_valid);
        assert!(!report.pcr_digest_valid);
        assert_eq!(report.verdict(&policy), Err(FailureKind::NoReferenceMatch));
    }

    #[test]
    fn test_forged_signature_fails_signature_predicate() {
        let attester_tpm = SoftwareTpm::new();
        let verifier_tpm = SoftwareTpm::new();
        let request = request_with_nonce(&[0x55; 20]);
        let response = quote_response(&attester_tpm, &request);
        let reference = reference_for(&attester_tpm, &[0, 1, 7]);
        let policy = ValidationPolicy::default();

        // The verifier trusts its own key, not the forger's.
        let report = verify_quote(
            &verifier_tpm,
            &policy,
            &reference,
            &verifier_tpm.public_key_der(),
            &request,
            &response,
        )
        .expect("verify");
        assert!(!report.tpm_signature_valid);
        assert!(!report.software_signature_valid);
        // Remaining predicates are still evaluated for diagnostics.
        assert!(report.magic_valid);
        assert!(report.nonce_valid);
        assert_eq!(report.verdict(&policy), Err(FailureKind::SignatureInvalid));
        // The external key handle was flushed despite the failure.
        assert_eq!(verifier_tpm.outstanding_handles(), 0);
    }

    #[test]
    fn test_garbage_attestation_blob_is_malformed() {
        let tpm = SoftwareTpm::new();
        let request = request_with_nonce(&[0x66; 20]);
        let reference = reference_for(&tpm, &[0, 1, 7]);
        let response = AttestationResponse {
            tpm_quote: TpmQuote {
                attestation_data: vec![0xFF; 10],
                signature: vec![0x00; 16],
            },
            pcr_logs: Vec::new(),
        };

        let result = verify_quote(
            &tpm,
            &ValidationPolicy::default(),
            &reference,
            &tpm.public_key_der(),
            &request,
            &response,
        );
        assert!(matches!(result, Err(Error::MalformedMessage(_))));
        assert_eq!(tpm.outstanding_handles(), 0);
    }

    #[test]
    fn test_required_software_agreement() {
        let report = VerificationReport {
            tpm_signature_valid: true,
            software_signature_valid: false,
            magic_valid: true,
            nonce_valid: true,
            pcr_digest_valid: true,
        };
        let lenient = ValidationPolicy::default();
        assert!(report.verdict(&lenient).is_ok());

        let strict = ValidationPolicy {
            require_software_signature: true,
            ..lenient
        };
        assert_eq!(report.verdict(&strict), Err(FailureKind::SignatureInvalid));
    }
}
