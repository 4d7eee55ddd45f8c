//! Software signature verification, independent of the TPM.
//!
//! This is the second of the two verification paths: the quote signature is
//! checked here with the `rsa` crate against the attestation public key,
//! while the authoritative check runs through the TPM gateway. The module
//! also converts attestation-key material (DER or marshalled TPM form) into
//! an [`RsaPublicKey`] usable by either path.

use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::pss::Pss;
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, RsaPublicKey};
use sha1::Sha1;
use sha2::digest::DynDigest;
use sha2::{Digest, Sha256, Sha384, Sha512};

use crate::error::{Error, Result};
use crate::quote::Reader;
use crate::tpm::HashAlgorithm;

const TPM_ALG_RSA: u16 = 0x0001;
const TPM_ALG_NULL: u16 = 0x0010;
const DEFAULT_RSA_EXPONENT: u32 = 65537;

/// Verify an RSA-PSS signature over `message` with the given hash.
///
/// Returns plain `bool`: a failed verification is an expected outcome for
/// the validator, not an error. TPMs pad PSS with the maximum salt the
/// key allows, other signers with a digest-sized salt; both are accepted.
pub fn verify_rsa_pss(
    key: &RsaPublicKey,
    hash: HashAlgorithm,
    message: &[u8],
    signature: &[u8],
) -> bool {
    match hash {
        HashAlgorithm::Sha1 => verify_pss::<Sha1>(key, &Sha1::digest(message), signature),
        HashAlgorithm::Sha256 => verify_pss::<Sha256>(key, &Sha256::digest(message), signature),
        HashAlgorithm::Sha384 => verify_pss::<Sha384>(key, &Sha384::digest(message), signature),
        HashAlgorithm::Sha512 => verify_pss::<Sha512>(key, &Sha512::digest(message), signature),
    }
}

fn verify_pss<D>(key: &RsaPublicKey, digest: &[u8], signature: &[u8]) -> bool
where
    D: 'static + Digest + DynDigest + Send + Sync,
{
    if key.verify(Pss::new::<D>(), digest, signature).is_ok() {
        return true;
    }
    let max_salt = key.size().saturating_sub(digest.len() + 2);
    key.verify(Pss::new_with_salt::<D>(max_salt), digest, signature)
        .is_ok()
}

/// Load the attestation public key from an on-disk blob.
///
/// Accepts DER (SubjectPublicKeyInfo or PKCS#1) and falls back to the
/// marshalled TPM public-area form, with or without the two-byte size
/// prefix of the TPM2B wrapper.
pub fn attestation_key_from_blob(blob: &[u8]) -> Result<RsaPublicKey> {
    if let Ok(key) =
        RsaPublicKey::from_public_key_der(blob).or_else(|_| RsaPublicKey::from_pkcs1_der(blob))
    {
        return Ok(key);
    }
    rsa_key_from_tpm_public(blob)
}

/// Convert a marshalled TPM RSA public area (TPMT_PUBLIC, optionally inside
/// its TPM2B wrapper) into a generic RSA public key.
pub fn rsa_key_from_tpm_public(blob: &[u8]) -> Result<RsaPublicKey> {
    parse_tpmt_public(blob).or_else(|first_err| {
        // Retry past a TPM2B size prefix.
        if blob.len() > 2 {
            let claimed = u16::from_be_bytes([blob[0], blob[1]]) as usize;
            if claimed == blob.len() - 2 {
                return parse_tpmt_public(&blob[2..]);
            }
        }
        Err(first_err)
    })
}

fn parse_tpmt_public(buf: &[u8]) -> Result<RsaPublicKey> {
    parse_tpmt_public_inner(buf).map_err(|e| Error::KeyFormat(e.to_string()))
}

fn parse_tpmt_public_inner(buf: &[u8]) -> Result<RsaPublicKey> {
    let mut r = Reader::new(buf);
    let key_type = r.u16("public area type")?;
    if key_type != TPM_ALG_RSA {
        return Err(Error::KeyFormat(format!(
            "unsupported public area type {key_type:#06x}"
        )));
    }
    let _name_alg = r.u16("name algorithm")?;
    let _object_attributes = r.u32("object attributes")?;
    let _auth_policy = r.sized_buffer("auth policy")?;

    let symmetric = r.u16("symmetric algorithm")?;
    if symmetric != TPM_ALG_NULL {
        let _key_bits = r.u16("symmetric key bits")?;
        let _mode = r.u16("symmetric mode")?;
    }
    let scheme = r.u16("signing scheme")?;
    if scheme != TPM_ALG_NULL {
        let _scheme_hash = r.u16("scheme hash algorithm")?;
    }
    let _key_bits = r.u16("RSA key bits")?;
    let exponent = r.u32("RSA exponent")?;
    let modulus = r.sized_buffer("RSA modulus")?;
    if modulus.is_empty() {
        return Err(Error::MalformedMessage("empty RSA modulus".into()));
    }

    let e = if exponent == 0 {
        DEFAULT_RSA_EXPONENT
    } else {
        exponent
    };
    RsaPublicKey::new(BigUint::from_bytes_be(&modulus), BigUint::from(e))
        .map_err(|e| Error::MalformedMessage(format!("invalid RSA key: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;
    use rsa::pkcs8::EncodePublicKey;
    use rsa::RsaPrivateKey;

    fn test_keypair() -> (RsaPrivateKey, RsaPublicKey) {
        let private = RsaPrivateKey::new(&mut OsRng, 2048).expect("keygen");
        let public = private.to_public_key();
        (private, public)
    }

    /// Build a marshalled TPMT_PUBLIC around the given modulus.
    fn tpmt_public_for(key: &RsaPublicKey) -> Vec<u8> {
        use rsa::traits::PublicKeyParts;
        let modulus = key.n().to_bytes_be();
        let mut buf = Vec::new();
        buf.extend_from_slice(&TPM_ALG_RSA.to_be_bytes());
        buf.extend_from_slice(&HashAlgorithm::Sha256.tpm_alg_id().to_be_bytes());
        buf.extend_from_slice(&0x0004_0072u32.to_be_bytes()); // attributes
        buf.extend_from_slice(&0u16.to_be_bytes()); // empty auth policy
        buf.extend_from_slice(&TPM_ALG_NULL.to_be_bytes()); // symmetric
        buf.extend_from_slice(&crate::quote::TPM_ALG_RSAPSS.to_be_bytes()); // scheme
        buf.extend_from_slice(&HashAlgorithm::Sha256.tpm_alg_id().to_be_bytes());
        buf.extend_from_slice(&2048u16.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes()); // default exponent
        buf.extend_from_slice(&(modulus.len() as u16).to_be_bytes());
        buf.extend_from_slice(&modulus);
        buf
    }

    #[test]
    fn test_pss_verify_roundtrip() {
        let (private, public) = test_keypair();
        let message = b"quoted attestation bytes";
        let digest = Sha256::digest(message);
        let signature = private
            .sign_with_rng(&mut OsRng, Pss::new::<Sha256>(), &digest)
            .expect("sign");
        assert!(verify_rsa_pss(
            &public,
            HashAlgorithm::Sha256,
            message,
            &signature
        ));
        assert!(!verify_rsa_pss(
            &public,
            HashAlgorithm::Sha256,
            b"different message",
            &signature
        ));
        // Wrong hash algorithm must not verify either.
        assert!(!verify_rsa_pss(
            &public,
            HashAlgorithm::Sha384,
            message,
            &signature
        ));
    }

    #[test]
    fn test_key_from_spki_der() {
        let (_, public) = test_keypair();
        let der = public.to_public_key_der().expect("der");
        let loaded = attestation_key_from_blob(der.as_bytes()).expect("load");
        assert_eq!(loaded, public);
    }

    #[test]
    fn test_key_from_tpm_public_area() {
        let (_, public) = test_keypair();
        let tpmt = tpmt_public_for(&public);
        assert_eq!(attestation_key_from_blob(&tpmt).expect("load"), public);

        // The same blob behind a TPM2B size prefix.
        let mut tpm2b = Vec::new();
        tpm2b.extend_from_slice(&(tpmt.len() as u16).to_be_bytes());
        tpm2b.extend_from_slice(&tpmt);
        assert_eq!(attestation_key_from_blob(&tpm2b).expect("load"), public);
    }

    #[test]
    fn test_garbage_key_rejected() {
        assert!(matches!(
            attestation_key_from_blob(&[0xDE, 0xAD, 0xBE, 0xEF]),
            Err(Error::KeyFormat(_))
        ));
    }
}
