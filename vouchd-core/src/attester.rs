//! Attester endpoint: serves the `attest` resource.
//!
//! One request at a time flows through receive → decode → quote → encode →
//! send. The signing-key handle is loaded lazily inside the handler and
//! held in a scoped guard, so it is flushed on every exit path, success or
//! failure. Client-side problems answer `4.00 Bad Request`; everything
//! that goes wrong on this side answers `5.00 Internal Server Error`,
//! with details kept in the local log rather than leaked to the peer.

use std::sync::Arc;

use crate::error::Error;
use crate::shutdown::QuitToken;
use crate::tpm::{KeySpec, ScopedKey, TpmGateway, MAX_DIGEST_SIZE};
use crate::transport::{
    CoapServer, ResourceOutcome, TransportConfig, ATTEST_RESOURCE, IO_PROCESS_BOUND,
};
use crate::wire::{self, AttestationResponse, CodecLimits, PcrLog, PcrLogRequest, TpmQuote};

const PLACEHOLDER_EVENT_LOG: &[u8] = b"--- BEGIN VOUCHD EVENT LOG ----------------\n\
This is a placeholder event log.\n\
It stands in until a log collector is configured.\n\
--- END VOUCHD EVENT LOG ------------------\n";

#[derive(Debug, Clone)]
pub struct AttesterConfig {
    pub key_spec: KeySpec,
    pub limits: CodecLimits,
}

pub struct Attester {
    gateway: Arc<dyn TpmGateway>,
    config: AttesterConfig,
}

impl Attester {
    pub fn new(gateway: Arc<dyn TpmGateway>, config: AttesterConfig) -> Self {
        Self { gateway, config }
    }

    /// Handle one attestation request payload end to end.
    pub fn handle_attest(&self, payload: &[u8]) -> ResourceOutcome {
        log::info!("received attestation request of {} bytes", payload.len());

        let request = match wire::decode_request(payload, &self.config.limits) {
            Ok(request) => request,
            Err(e) => {
                log::error!("could not parse request: {e}");
                return ResourceOutcome::BadRequest;
            }
        };

        if request.hello {
            log::info!("hello probe, answering without a quote");
            return self.encode_outcome(AttestationResponse {
                tpm_quote: TpmQuote {
                    attestation_data: Vec::new(),
                    signature: Vec::new(),
                },
                pcr_logs: Vec::new(),
            });
        }

        if request.nonce.is_empty() {
            log::error!("{}", Error::InvalidNonce(0));
            return ResourceOutcome::BadRequest;
        }
        if request.nonce.len() > MAX_DIGEST_SIZE {
            log::error!("{}", Error::NonceTooLong(request.nonce.len()));
            return ResourceOutcome::BadRequest;
        }
        log::info!(
            "received nonce of length {}: 0x{}",
            request.nonce.len(),
            hex::encode(&request.nonce)
        );

        // Banks with an empty index list are omitted from the quote.
        let selections: Vec<_> = request
            .pcr_selections
            .iter()
            .filter(|sel| !sel.is_empty())
            .cloned()
            .collect();

        let key = match self.gateway.load_signing_key(&self.config.key_spec) {
            Ok(handle) => ScopedKey::new(self.gateway.as_ref(), handle),
            Err(e) => {
                log::error!("could not load signing key: {e}");
                return ResourceOutcome::ServerError;
            }
        };

        log::info!("producing TPM quote");
        let (attestation_data, signature) =
            match self
                .gateway
                .quote(key.handle(), &selections, &request.nonce)
            {
                Ok(quote) => quote,
                Err(e) => {
                    log::error!("TPM quote failed: {e}");
                    return ResourceOutcome::ServerError;
                }
            };

        let pcr_logs = request
            .pcr_logs
            .iter()
            .map(|log_request| collect_log(log_request))
            .collect();

        self.encode_outcome(AttestationResponse {
            tpm_quote: TpmQuote {
                attestation_data,
                signature,
            },
            pcr_logs,
        })
        // `key` drops here: the signing handle is flushed on every path
        // that reached the load.
    }

    fn encode_outcome(&self, response: AttestationResponse) -> ResourceOutcome {
        match wire::encode_response(&response, &self.config.limits) {
            Ok(encoded) => {
                log::info!("sending response of {} bytes", encoded.len());
                ResourceOutcome::Content(encoded)
            }
            Err(e) => {
                log::error!("could not encode response: {e}");
                ResourceOutcome::ServerError
            }
        }
    }

    /// Serve the `attest` resource until the quit token fires.
    pub fn serve(self, transport: &TransportConfig, quit: &QuitToken) -> crate::error::Result<()> {
        let mut server = CoapServer::bind(transport)?;
        let attester = Arc::new(self);
        let handler = {
            let attester = attester.clone();
            Box::new(move |payload: &[u8]| attester.handle_attest(payload))
        };
        server.register(ATTEST_RESOURCE, handler);

        log::debug!("entering main loop");
        while !quit.is_triggered() {
            server.poll_io(IO_PROCESS_BOUND)?;
        }
        log::info!("quit signal observed, shutting down");
        Ok(())
    }
}

fn collect_log(request: &PcrLogRequest) -> PcrLog {
    // start == 0 asks for an empty log; a real collector is not wired in,
    // so everything else gets the placeholder.
    let content = if request.start == 0 {
        Vec::new()
    } else {
        PLACEHOLDER_EVENT_LOG.to_vec()
    };
    log::info!(
        "attaching PCR log '{}' [{} bytes]",
        request.identifier.as_str(),
        content.len()
    );
    PcrLog {
        identifier: request.identifier,
        content,
    }
}
