//! TPM gateway: a thin, serialized adapter over one TPM command channel.
//!
//! The gateway collapses all vendor error codes into the crate error kinds,
//! preserving the underlying numeric code in the message for logging.
//! Access to the single TPM context is serialized; a second caller arriving
//! while an operation is in flight is rejected with [`Error::Busy`].

pub mod software;
mod types;

#[cfg(target_os = "linux")]
pub mod esys;

pub use software::SoftwareTpm;
pub use types::*;

use std::sync::Arc;

use crate::error::Result;

pub trait TpmGateway: Send + Sync {
    /// Load the attester's signing key from a context blob or a persistent
    /// handle. The returned handle must eventually be [`flush`]ed.
    ///
    /// [`flush`]: TpmGateway::flush
    fn load_signing_key(&self, spec: &KeySpec) -> Result<KeyHandle>;

    /// Load an external public key for the TPM-side verification path.
    /// Accepts DER or marshalled TPM public-area blobs.
    fn load_external_public_key(&self, blob: &[u8]) -> Result<KeyHandle>;

    /// Produce a quote over the selected PCR banks, bound to the given
    /// qualifying data. Returns the raw attestation blob and the marshalled
    /// signature structure, binary-exact as the TPM emitted them.
    fn quote(
        &self,
        key: KeyHandle,
        selections: &[PcrSelection],
        qualifying_data: &[u8],
    ) -> Result<(Vec<u8>, Vec<u8>)>;

    /// Verify a quote signature inside the TPM against a loaded key.
    fn verify_signature(
        &self,
        key: KeyHandle,
        hash: HashAlgorithm,
        message: &[u8],
        signature: &[u8],
    ) -> Result<bool>;

    /// Draw cryptographically strong random bytes from the TPM.
    fn random_bytes(&self, n: usize) -> Result<Vec<u8>>;

    /// Release a loaded object. Idempotent; failures are logged, never
    /// propagated.
    fn flush(&self, key: KeyHandle);
}

/// Release-on-drop wrapper for a loaded TPM handle.
///
/// Every handler that loads a key holds it through one of these so the
/// handle is flushed on every exit path.
pub struct ScopedKey<'g> {
    gateway: &'g dyn TpmGateway,
    handle: KeyHandle,
}

impl<'g> ScopedKey<'g> {
    pub fn new(gateway: &'g dyn TpmGateway, handle: KeyHandle) -> Self {
        Self { gateway, handle }
    }

    pub fn handle(&self) -> KeyHandle {
        self.handle
    }
}

impl Drop for ScopedKey<'_> {
    fn drop(&mut self) {
        self.gateway.flush(self.handle);
    }
}

/// Pick the best available gateway: hardware when a TPM is reachable,
/// otherwise the in-process software implementation.
pub fn detect(tcti: Option<&str>) -> Arc<dyn TpmGateway> {
    #[cfg(target_os = "linux")]
    match esys::EsysGateway::connect(tcti) {
        Ok(gateway) => {
            log::info!("connected to hardware TPM 2.0");
            return Arc::new(gateway);
        }
        Err(e) => log::warn!("hardware TPM unavailable: {e}"),
    }
    #[cfg(not(target_os = "linux"))]
    let _ = tcti;

    log::warn!("no hardware TPM available, using software gateway");
    Arc::new(SoftwareTpm::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scoped_key_flushes_on_drop() {
        let tpm = SoftwareTpm::new();
        let handle = tpm
            .load_signing_key(&KeySpec::Persistent(0x8100_0001))
            .expect("load");
        assert_eq!(tpm.outstanding_handles(), 1);
        {
            let _scoped = ScopedKey::new(&tpm, handle);
        }
        assert_eq!(tpm.outstanding_handles(), 0);
        assert_eq!(tpm.flush_count(), 1);
    }
}
