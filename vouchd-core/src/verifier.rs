//! Verifier endpoint: issues one challenge, awaits one response, judges it.
//!
//! A session keeps at most one request in flight; the transport layer
//! drops responses that do not correlate with it. The response timeout is
//! accumulated across bounded I/O waits, so a silent attester surfaces as
//! [`Error::Timeout`] rather than a hung process.

use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;

use crate::error::{Error, Result};
use crate::reference::ReferencePcrStore;
use crate::shutdown::QuitToken;
use crate::tpm::{PcrSelection, TpmGateway};
use crate::transport::{CoapClient, TransportConfig, ATTEST_RESOURCE};
use crate::validator::{self, ValidationPolicy, VerificationReport};
use crate::wire::{self, AttestationRequest, CodecLimits, PcrLogRequest, TAP_SPEC_VERSION};

/// Nonce length drawn for every challenge.
pub const NONCE_LEN: usize = 20;

/// Default signing-key identifier sent to the attester.
pub const DEFAULT_SIG_KEY_ID: &[u8] = b"PK.RSA.default";

/// Default window for the attestation response.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Where challenge nonces come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NonceSource {
    #[default]
    PlatformRng,
    Tpm,
}

#[derive(Debug, Clone)]
pub struct VerifierConfig {
    pub sig_key_id: Vec<u8>,
    pub pcr_selections: Vec<PcrSelection>,
    pub pcr_logs: Vec<PcrLogRequest>,
    pub response_timeout: Duration,
    pub policy: ValidationPolicy,
    pub nonce_source: NonceSource,
    pub limits: CodecLimits,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            sig_key_id: DEFAULT_SIG_KEY_ID.to_vec(),
            pcr_selections: Vec::new(),
            pcr_logs: Vec::new(),
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            policy: ValidationPolicy::default(),
            nonce_source: NonceSource::default(),
            limits: CodecLimits::default(),
        }
    }
}

pub struct Verifier {
    gateway: Arc<dyn TpmGateway>,
    config: VerifierConfig,
}

impl Verifier {
    pub fn new(gateway: Arc<dyn TpmGateway>, config: VerifierConfig) -> Self {
        Self { gateway, config }
    }

    fn draw_nonce(&self) -> Result<Vec<u8>> {
        let nonce = match self.config.nonce_source {
            NonceSource::Tpm => self.gateway.random_bytes(NONCE_LEN)?,
            NonceSource::PlatformRng => {
                let mut nonce = vec![0u8; NONCE_LEN];
                rand::thread_rng().fill_bytes(&mut nonce);
                nonce
            }
        };
        if nonce.is_empty() {
            return Err(Error::InvalidNonce(0));
        }
        log::info!(
            "generated qualifying data (nonce) of length {}: 0x{}",
            nonce.len(),
            hex::encode(&nonce)
        );
        Ok(nonce)
    }

    /// Construct the challenge for one attestation round.
    pub fn build_request(&self) -> Result<AttestationRequest> {
        if !self.config.pcr_selections.iter().any(|sel| !sel.is_empty()) {
            return Err(Error::Cli(
                "at least one PCR bank must be selected".into(),
            ));
        }
        Ok(AttestationRequest {
            tap_spec_version: TAP_SPEC_VERSION,
            hello: false,
            sig_key_id: self.config.sig_key_id.clone(),
            nonce: self.draw_nonce()?,
            pcr_selections: self.config.pcr_selections.clone(),
            pcr_logs: self.config.pcr_logs.clone(),
        })
    }

    /// Run one attestation round: challenge, await, validate.
    ///
    /// `Ok(report)` means every required predicate held; a failed verdict
    /// comes back as [`Error::AttestationFailed`] naming the first failing
    /// predicate, after all of them were evaluated and logged.
    pub fn attest(
        &self,
        transport: &TransportConfig,
        reference: &ReferencePcrStore,
        attestation_key_blob: &[u8],
        quit: &QuitToken,
    ) -> Result<VerificationReport> {
        let request = self.build_request()?;
        let payload = wire::encode_request(&request, &self.config.limits)?;

        let mut client = CoapClient::connect(transport)?;
        log::info!(
            "sending attestation request to {}:{}",
            transport.host,
            transport.port
        );
        let body = client.fetch(
            ATTEST_RESOURCE,
            &payload,
            self.config.response_timeout,
            quit,
        )?;
        // The request is done once its response arrived; transient buffers
        // (payload above, response body below) drop with this scope.

        let response = wire::decode_response(&body, &self.config.limits)?;
        log::info!("starting verification");
        let report = validator::verify_quote(
            self.gateway.as_ref(),
            &self.config.policy,
            reference,
            attestation_key_blob,
            &request,
            &response,
        )?;

        match report.verdict(&self.config.policy) {
            Ok(()) => {
                log::info!("+----------------------------+");
                log::info!("|   ATTESTATION SUCCESSFUL   |");
                log::info!("+----------------------------+");
                Ok(report)
            }
            Err(kind) => {
                log::error!("+----------------------------+");
                log::error!("|     ATTESTATION FAILED     |");
                log::error!("+----------------------------+");
                Err(validator::verdict_error(kind))
            }
        }
    }
}
