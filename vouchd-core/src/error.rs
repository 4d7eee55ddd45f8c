use std::fmt;

/// Which verification predicate sank the attestation verdict.
///
/// Every predicate is evaluated and logged regardless of earlier failures;
/// the kind names the first one that failed, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The response or the embedded attestation structure did not parse.
    Malformed,
    /// The quote signature did not verify against the attestation key.
    SignatureInvalid,
    /// The attestation structure does not carry the TPM-generated magic
    /// or is not of type QUOTE.
    MagicMismatch,
    /// The qualifying data in the quote differs from the challenge nonce.
    NonceMismatch,
    /// The attested PCR composite digest matches no reference candidate.
    NoReferenceMatch,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::Malformed => "malformed quote",
            FailureKind::SignatureInvalid => "signature invalid",
            FailureKind::MagicMismatch => "TPM magic mismatch",
            FailureKind::NonceMismatch => "nonce mismatch",
            FailureKind::NoReferenceMatch => "no reference PCR match",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("wire: malformed message: {0}")]
    MalformedMessage(String),
    #[error("attester: nonce of {0} bytes exceeds the largest TPM digest")]
    NonceTooLong(usize),
    #[error("invalid nonce length {0}")]
    InvalidNonce(usize),
    #[error("tpm: key load failed: {0}")]
    TpmLoad(String),
    #[error("tpm: quote failed: {0}")]
    TpmQuote(String),
    #[error("tpm: random bytes failed: {0}")]
    TpmRandom(String),
    #[error("tpm: context is busy")]
    Busy,
    #[error("crypto: unsupported or malformed key material: {0}")]
    KeyFormat(String),
    #[error("crypto: signature verification failed")]
    SignatureInvalid,
    #[error("reference: invalid reference PCR file: {0}")]
    ReferenceInvalid(String),
    #[error("reference: digest matches no reference candidate")]
    NoReferenceMatch,
    #[error("verifier: no attestation response within {0} s")]
    Timeout(u64),
    #[error("transport: {0}")]
    Transport(String),
    #[error("attestation failed: {0}")]
    AttestationFailed(FailureKind),
    #[error("cli: {0}")]
    Cli(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
