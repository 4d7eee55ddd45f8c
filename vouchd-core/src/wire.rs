//! Wire codec for the attestation request/response messages.
//!
//! Both messages travel as compact tagged binary (CBOR). Encoding is
//! deterministic: the same logical message always serializes to the same
//! bytes. Decoding is strict; any deviation from the documented layout is
//! rejected as [`Error::MalformedMessage`] so that no two peers can read
//! the same bytes differently.
//!
//! Request (outer array, arity 7):
//! `[version, hello, sig_key_id, nonce, selection_count, selections, log_requests]`
//! where each selection is `[hash_alg_id, [index...]]` and each log request
//! is `[identifier, start, count]`.
//!
//! Response (outer array, arity 2):
//! `[[attestation_data, signature], [[identifier, content]...]]`

use ciborium::value::Value;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::tpm::{HashAlgorithm, PcrSelection};

/// Protocol version carried in every request; both sides reject others.
pub const TAP_SPEC_VERSION: u64 = 1;

/// Upper bound for the signing-key identifier field.
pub const MAX_SIG_KEY_ID_LEN: usize = 256;

/// Wire-level bound for the nonce field. The semantic bound (largest TPM
/// digest) is enforced by the attester so that oversized nonces surface as
/// `NonceTooLong` rather than a decode failure.
pub const MAX_NONCE_WIRE_LEN: usize = 256;

/// Upper bound for the raw attestation blob (marshalled TPM2B_ATTEST body).
pub const MAX_ATTEST_DATA_LEN: usize = 2048;

/// Upper bound for a marshalled TPM signature structure.
pub const MAX_SIGNATURE_LEN: usize = 1024;

/// Default ceiling for one encoded message; the codec never buffers more.
pub const DEFAULT_MESSAGE_CEILING: usize = 20 * 1024;

/// Configurable codec buffering limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecLimits {
    pub max_message_len: usize,
}

impl Default for CodecLimits {
    fn default() -> Self {
        Self {
            max_message_len: DEFAULT_MESSAGE_CEILING,
        }
    }
}

/// Measurement-log kinds a verifier may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogIdentifier {
    Ima,
    TcgBoot,
}

impl LogIdentifier {
    pub fn as_str(self) -> &'static str {
        match self {
            LogIdentifier::Ima => "ima",
            LogIdentifier::TcgBoot => "tcg-boot",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "ima" => Some(LogIdentifier::Ima),
            "tcg-boot" => Some(LogIdentifier::TcgBoot),
            _ => None,
        }
    }
}

/// One requested measurement log. `start == 0` asks for an empty log,
/// `count == 0` asks for every entry from `start` onward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcrLogRequest {
    pub identifier: LogIdentifier,
    pub start: u64,
    pub count: u64,
}

/// One delivered measurement log; content is opaque to the protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcrLog {
    pub identifier: LogIdentifier,
    pub content: Vec<u8>,
}

/// The challenge sent by the verifier. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationRequest {
    pub tap_spec_version: u64,
    pub hello: bool,
    pub sig_key_id: Vec<u8>,
    pub nonce: Vec<u8>,
    pub pcr_selections: Vec<PcrSelection>,
    pub pcr_logs: Vec<PcrLogRequest>,
}

/// The TPM-produced quote, echoed binary-exact from the TPM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TpmQuote {
    pub attestation_data: Vec<u8>,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationResponse {
    pub tpm_quote: TpmQuote,
    pub pcr_logs: Vec<PcrLog>,
}

fn malformed(what: impl Into<String>) -> Error {
    Error::MalformedMessage(what.into())
}

fn as_array(value: &Value, what: &str) -> Result<&[Value]> {
    match value {
        Value::Array(items) => Ok(items),
        _ => Err(malformed(format!("{what}: expected array"))),
    }
}

fn as_fixed_array<'a>(value: &'a Value, arity: usize, what: &str) -> Result<&'a [Value]> {
    let items = as_array(value, what)?;
    if items.len() != arity {
        return Err(malformed(format!(
            "{what}: expected array of {arity} elements, got {}",
            items.len()
        )));
    }
    Ok(items)
}

fn as_uint(value: &Value, what: &str) -> Result<u64> {
    match value {
        Value::Integer(i) => u64::try_from(i128::from(*i))
            .map_err(|_| malformed(format!("{what}: expected unsigned integer"))),
        _ => Err(malformed(format!("{what}: expected unsigned integer"))),
    }
}

fn as_bool(value: &Value, what: &str) -> Result<bool> {
    match value {
        Value::Bool(b) => Ok(*b),
        _ => Err(malformed(format!("{what}: expected bool"))),
    }
}

fn as_bytes(value: &Value, max: usize, what: &str) -> Result<Vec<u8>> {
    match value {
        Value::Bytes(b) if b.len() <= max => Ok(b.clone()),
        Value::Bytes(b) => Err(malformed(format!(
            "{what}: {} bytes exceeds bound of {max}",
            b.len()
        ))),
        _ => Err(malformed(format!("{what}: expected byte string"))),
    }
}

fn as_text<'a>(value: &'a Value, what: &str) -> Result<&'a str> {
    match value {
        Value::Text(s) => Ok(s),
        _ => Err(malformed(format!("{what}: expected text string"))),
    }
}

fn to_bytes(root: &Value, limits: &CodecLimits) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(root, &mut buf)
        .map_err(|e| malformed(format!("encode: {e}")))?;
    if buf.len() > limits.max_message_len {
        return Err(malformed(format!(
            "encoded message of {} bytes exceeds ceiling of {}",
            buf.len(),
            limits.max_message_len
        )));
    }
    Ok(buf)
}

fn from_bytes(buf: &[u8], limits: &CodecLimits) -> Result<Value> {
    if buf.len() > limits.max_message_len {
        return Err(malformed(format!(
            "message of {} bytes exceeds ceiling of {}",
            buf.len(),
            limits.max_message_len
        )));
    }
    ciborium::de::from_reader(buf).map_err(|e| malformed(format!("decode: {e}")))
}

pub fn encode_request(req: &AttestationRequest, limits: &CodecLimits) -> Result<Vec<u8>> {
    let selections: Vec<Value> = req
        .pcr_selections
        .iter()
        .map(|sel| {
            Value::Array(vec![
                Value::Integer(u64::from(sel.hash.tpm_alg_id()).into()),
                Value::Array(
                    sel.pcrs
                        .iter()
                        .map(|&p| Value::Integer(u64::from(p).into()))
                        .collect(),
                ),
            ])
        })
        .collect();
    let logs: Vec<Value> = req
        .pcr_logs
        .iter()
        .map(|log| {
            Value::Array(vec![
                Value::Text(log.identifier.as_str().to_string()),
                Value::Integer(log.start.into()),
                Value::Integer(log.count.into()),
            ])
        })
        .collect();
    let root = Value::Array(vec![
        Value::Integer(req.tap_spec_version.into()),
        Value::Bool(req.hello),
        Value::Bytes(req.sig_key_id.clone()),
        Value::Bytes(req.nonce.clone()),
        Value::Integer((req.pcr_selections.len() as u64).into()),
        Value::Array(selections),
        Value::Array(logs),
    ]);
    to_bytes(&root, limits)
}

pub fn decode_request(buf: &[u8], limits: &CodecLimits) -> Result<AttestationRequest> {
    let root = from_bytes(buf, limits)?;
    let items = as_fixed_array(&root, 7, "request")?;

    let tap_spec_version = as_uint(&items[0], "request version")?;
    if tap_spec_version != TAP_SPEC_VERSION {
        return Err(malformed(format!(
            "unsupported spec version {tap_spec_version}"
        )));
    }
    let hello = as_bool(&items[1], "request hello flag")?;
    let sig_key_id = as_bytes(&items[2], MAX_SIG_KEY_ID_LEN, "signing key id")?;
    let nonce = as_bytes(&items[3], MAX_NONCE_WIRE_LEN, "nonce")?;
    let selection_count = as_uint(&items[4], "selection count")?;

    let raw_selections = as_array(&items[5], "PCR selections")?;
    if selection_count != raw_selections.len() as u64 {
        return Err(malformed(format!(
            "selection count {selection_count} disagrees with {} selections",
            raw_selections.len()
        )));
    }
    let mut pcr_selections = Vec::with_capacity(raw_selections.len());
    for raw in raw_selections {
        let pair = as_fixed_array(raw, 2, "PCR selection")?;
        let alg_id = as_uint(&pair[0], "hash algorithm id")?;
        let alg_id = u16::try_from(alg_id)
            .ok()
            .and_then(HashAlgorithm::from_tpm_alg_id)
            .ok_or_else(|| malformed(format!("unknown hash algorithm id {alg_id}")))?;
        let raw_pcrs = as_array(&pair[1], "PCR index list")?;
        let mut pcrs = Vec::with_capacity(raw_pcrs.len());
        for raw_pcr in raw_pcrs {
            let idx = as_uint(raw_pcr, "PCR index")?;
            let idx = u8::try_from(idx)
                .map_err(|_| malformed(format!("PCR index {idx} out of range")))?;
            pcrs.push(idx);
        }
        if pcrs.windows(2).any(|w| w[0] >= w[1]) {
            return Err(malformed("PCR index list not sorted or has duplicates"));
        }
        pcr_selections.push(PcrSelection::new(alg_id, pcrs)?);
    }

    let raw_logs = as_array(&items[6], "PCR log requests")?;
    let mut pcr_logs = Vec::with_capacity(raw_logs.len());
    for raw in raw_logs {
        let triple = as_fixed_array(raw, 3, "PCR log request")?;
        let name = as_text(&triple[0], "log identifier")?;
        let identifier = LogIdentifier::from_str(name)
            .ok_or_else(|| malformed(format!("unknown log identifier '{name}'")))?;
        let start = as_uint(&triple[1], "log start")?;
        let count = as_uint(&triple[2], "log count")?;
        pcr_logs.push(PcrLogRequest {
            identifier,
            start,
            count,
        });
    }

    Ok(AttestationRequest {
        tap_spec_version,
        hello,
        sig_key_id,
        nonce,
        pcr_selections,
        pcr_logs,
    })
}

pub fn encode_response(res: &AttestationResponse, limits: &CodecLimits) -> Result<Vec<u8>> {
    let logs: Vec<Value> = res
        .pcr_logs
        .iter()
        .map(|log| {
            Value::Array(vec![
                Value::Text(log.identifier.as_str().to_string()),
                Value::Bytes(log.content.clone()),
            ])
        })
        .collect();
    let root = Value::Array(vec![
        Value::Array(vec![
            Value::Bytes(res.tpm_quote.attestation_data.clone()),
            Value::Bytes(res.tpm_quote.signature.clone()),
        ]),
        Value::Array(logs),
    ]);
    to_bytes(&root, limits)
}

pub fn decode_response(buf: &[u8], limits: &CodecLimits) -> Result<AttestationResponse> {
    let root = from_bytes(buf, limits)?;
    let items = as_fixed_array(&root, 2, "response")?;

    let quote = as_fixed_array(&items[0], 2, "TPM quote")?;
    let attestation_data = as_bytes(&quote[0], MAX_ATTEST_DATA_LEN, "attestation data")?;
    let signature = as_bytes(&quote[1], MAX_SIGNATURE_LEN, "signature")?;

    let raw_logs = as_array(&items[1], "PCR logs")?;
    let mut pcr_logs = Vec::with_capacity(raw_logs.len());
    for raw in raw_logs {
        let pair = as_fixed_array(raw, 2, "PCR log")?;
        let name = as_text(&pair[0], "log identifier")?;
        let identifier = LogIdentifier::from_str(name)
            .ok_or_else(|| malformed(format!("unknown log identifier '{name}'")))?;
        let content = as_bytes(&pair[1], limits.max_message_len, "log content")?;
        pcr_logs.push(PcrLog {
            identifier,
            content,
        });
    }

    Ok(AttestationResponse {
        tpm_quote: TpmQuote {
            attestation_data,
            signature,
        },
        pcr_logs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_request() -> AttestationRequest {
        AttestationRequest {
            tap_spec_version: TAP_SPEC_VERSION,
            hello: false,
            sig_key_id: b"PK.RSA.default".to_vec(),
            nonce: vec![0xAB; 20],
            pcr_selections: vec![PcrSelection::new(
                HashAlgorithm::Sha256,
                vec![0, 1, 2, 3, 4, 5, 6, 7, 10],
            )
            .expect("selection")],
            pcr_logs: vec![PcrLogRequest {
                identifier: LogIdentifier::Ima,
                start: 1,
                count: 0,
            }],
        }
    }

    fn sample_response() -> AttestationResponse {
        AttestationResponse {
            tpm_quote: TpmQuote {
                attestation_data: vec![0x11; 145],
                signature: vec![0x22; 256],
            },
            pcr_logs: vec![PcrLog {
                identifier: LogIdentifier::TcgBoot,
                content: b"entry".to_vec(),
            }],
        }
    }

    #[test]
    fn test_request_roundtrip() {
        let limits = CodecLimits::default();
        let req = sample_request();
        let buf = encode_request(&req, &limits).expect("encode");
        let back = decode_request(&buf, &limits).expect("decode");
        assert_eq!(req, back);
    }

    #[test]
    fn test_response_roundtrip() {
        let limits = CodecLimits::default();
        let res = sample_response();
        let buf = encode_response(&res, &limits).expect("encode");
        let back = decode_response(&buf, &limits).expect("decode");
        assert_eq!(res, back);
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let limits = CodecLimits::default();
        let req = sample_request();
        assert_eq!(
            encode_request(&req, &limits).expect("encode"),
            encode_request(&req, &limits).expect("encode again")
        );
    }

    #[test]
    fn test_truncated_request_is_malformed() {
        let limits = CodecLimits::default();
        let mut buf = encode_request(&sample_request(), &limits).expect("encode");
        buf.truncate(buf.len() - 3);
        assert!(matches!(
            decode_request(&buf, &limits),
            Err(Error::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_wrong_arity_is_malformed() {
        let limits = CodecLimits::default();
        let root = Value::Array(vec![Value::Integer(1.into()), Value::Bool(false)]);
        let mut buf = Vec::new();
        ciborium::ser::into_writer(&root, &mut buf).expect("encode");
        assert!(decode_request(&buf, &limits).is_err());
    }

    #[test]
    fn test_unknown_log_identifier_is_malformed() {
        let limits = CodecLimits::default();
        let buf = encode_request(&sample_request(), &limits).expect("encode");
        // Patch the identifier text in place: "ima" -> "imq".
        let patched: Vec<u8> = {
            let mut b = buf.clone();
            let pos = b
                .windows(3)
                .position(|w| w == b"ima")
                .expect("identifier in encoding");
            b[pos + 2] = b'q';
            b
        };
        assert!(matches!(
            decode_request(&patched, &limits),
            Err(Error::MalformedMessage(_))
        ));
        // The untouched buffer still decodes.
        assert!(decode_request(&buf, &limits).is_ok());
    }

    #[test]
    fn test_version_mismatch_is_malformed() {
        let limits = CodecLimits::default();
        let mut req = sample_request();
        req.tap_spec_version = TAP_SPEC_VERSION + 1;
        let buf = encode_request(&req, &limits).expect("encode");
        assert!(decode_request(&buf, &limits).is_err());
    }

    #[test]
    fn test_selection_count_mismatch_is_malformed() {
        let limits = CodecLimits::default();
        let root = Value::Array(vec![
            Value::Integer(TAP_SPEC_VERSION.into()),
            Value::Bool(false),
            Value::Bytes(b"key".to_vec()),
            Value::Bytes(vec![1; 20]),
            Value::Integer(2.into()),
            Value::Array(vec![]),
            Value::Array(vec![]),
        ]);
        let mut buf = Vec::new();
        ciborium::ser::into_writer(&root, &mut buf).expect("encode");
        assert!(decode_request(&buf, &limits).is_err());
    }

    #[test]
    fn test_unsorted_pcr_list_is_malformed() {
        let limits = CodecLimits::default();
        let root = Value::Array(vec![
            Value::Integer(TAP_SPEC_VERSION.into()),
            Value::Bool(false),
            Value::Bytes(b"key".to_vec()),
            Value::Bytes(vec![1; 20]),
            Value::Integer(1.into()),
            Value::Array(vec![Value::Array(vec![
                Value::Integer(0x000Bu64.into()),
                Value::Array(vec![Value::Integer(7.into()), Value::Integer(3.into())]),
            ])]),
            Value::Array(vec![]),
        ]);
        let mut buf = Vec::new();
        ciborium::ser::into_writer(&root, &mut buf).expect("encode");
        assert!(decode_request(&buf, &limits).is_err());
    }

    #[test]
    fn test_oversized_signature_is_malformed() {
        let limits = CodecLimits::default();
        let mut res = sample_response();
        res.tpm_quote.signature = vec![0; MAX_SIGNATURE_LEN + 1];
        let buf = encode_response(&res, &limits).expect("encode");
        assert!(decode_response(&buf, &limits).is_err());
    }

    #[test]
    fn test_message_ceiling_enforced() {
        let limits = CodecLimits {
            max_message_len: 64,
        };
        let res = sample_response();
        assert!(encode_response(&res, &limits).is_err());
    }

    prop_compose! {
        fn arb_selection()(
            alg in prop::sample::select(vec![
                HashAlgorithm::Sha1,
                HashAlgorithm::Sha256,
                HashAlgorithm::Sha384,
                HashAlgorithm::Sha512,
            ]),
            pcrs in prop::collection::btree_set(0u8..=23, 0..12),
        ) -> PcrSelection {
            PcrSelection::new(alg, pcrs.into_iter().collect()).expect("selection")
        }
    }

    prop_compose! {
        fn arb_request()(
            hello in any::<bool>(),
            sig_key_id in prop::collection::vec(any::<u8>(), 1..64),
            nonce in prop::collection::vec(any::<u8>(), 1..64),
            selections in prop::collection::vec(arb_selection(), 0..4),
            starts in prop::collection::vec((0u64..1000, 0u64..1000), 0..2),
        ) -> AttestationRequest {
            let pcr_logs = starts
                .into_iter()
                .enumerate()
                .map(|(i, (start, count))| PcrLogRequest {
                    identifier: if i % 2 == 0 { LogIdentifier::Ima } else { LogIdentifier::TcgBoot },
                    start,
                    count,
                })
                .collect();
            AttestationRequest {
                tap_spec_version: TAP_SPEC_VERSION,
                hello,
                sig_key_id,
                nonce,
                pcr_selections: selections,
                pcr_logs,
            }
        }
    }

    proptest! {
        #[test]
        fn prop_request_roundtrip(req in arb_request()) {
            let limits = CodecLimits::default();
            let buf = encode_request(&req, &limits).unwrap();
            let back = decode_request(&buf, &limits).unwrap();
            prop_assert_eq!(req, back);
        }

        #[test]
        fn prop_request_encoding_deterministic(req in arb_request()) {
            let limits = CodecLimits::default();
            prop_assert_eq!(
                encode_request(&req, &limits).unwrap(),
                encode_request(&req, &limits).unwrap()
            );
        }
    }
}
