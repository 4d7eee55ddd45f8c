//! Parsing and construction of the marshalled TPM attestation structures
//! carried inside a quote response: the TPMS_ATTEST body and the
//! TPMT_SIGNATURE wrapper. All fields are big-endian per the TPM
//! marshalling rules.

use crate::error::{Error, Result};
use crate::tpm::{HashAlgorithm, PcrSelection, MAX_PCR_INDEX};

/// The constant every genuine TPM places at the head of attestation output.
pub const TPM_GENERATED_MAGIC: u32 = 0xFF54_4347;

/// Attestation structure type tag for quotes.
pub const TPM_ST_ATTEST_QUOTE: u16 = 0x8018;

pub const TPM_ALG_RSASSA: u16 = 0x0014;
pub const TPM_ALG_RSAPSS: u16 = 0x0016;

const PCR_SELECT_BYTES: usize = 3;

pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8]> {
        if self.buf.len() - self.pos < n {
            return Err(Error::MalformedMessage(format!(
                "attestation structure truncated in {what}"
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub(crate) fn u8(&mut self, what: &str) -> Result<u8> {
        Ok(self.take(1, what)?[0])
    }

    pub(crate) fn u16(&mut self, what: &str) -> Result<u16> {
        let b = self.take(2, what)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub(crate) fn u32(&mut self, what: &str) -> Result<u32> {
        let b = self.take(4, what)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn u64(&mut self, what: &str) -> Result<u64> {
        let b = self.take(8, what)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_be_bytes(raw))
    }

    pub(crate) fn sized_buffer(&mut self, what: &str) -> Result<Vec<u8>> {
        let len = self.u16(what)? as usize;
        Ok(self.take(len, what)?.to_vec())
    }

    pub(crate) fn done(&self) -> bool {
        self.pos == self.buf.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockInfo {
    pub clock: u64,
    pub reset_count: u32,
    pub restart_count: u32,
    pub safe: bool,
}

/// The decoded TPMS_ATTEST body of a quote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuoteAttestation {
    pub magic: u32,
    pub attest_type: u16,
    pub qualified_signer: Vec<u8>,
    /// Qualifying data: the challenge nonce the TPM bound into this quote.
    pub extra_data: Vec<u8>,
    pub clock_info: ClockInfo,
    pub firmware_version: u64,
    pub pcr_select: Vec<PcrSelection>,
    pub pcr_digest: Vec<u8>,
}

impl QuoteAttestation {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let mut r = Reader::new(buf);
        let magic = r.u32("magic")?;
        let attest_type = r.u16("type")?;
        let qualified_signer = r.sized_buffer("qualified signer")?;
        let extra_data = r.sized_buffer("qualifying data")?;
        let clock_info = ClockInfo {
            clock: r.u64("clock")?,
            reset_count: r.u32("reset count")?,
            restart_count: r.u32("restart count")?,
            safe: r.u8("safe flag")? != 0,
        };
        let firmware_version = r.u64("firmware version")?;

        let bank_count = r.u32("PCR selection count")?;
        if bank_count > 16 {
            return Err(Error::MalformedMessage(format!(
                "implausible PCR bank count {bank_count}"
            )));
        }
        let mut pcr_select = Vec::with_capacity(bank_count as usize);
        for _ in 0..bank_count {
            let alg_id = r.u16("selection hash algorithm")?;
            let hash = HashAlgorithm::from_tpm_alg_id(alg_id).ok_or_else(|| {
                Error::MalformedMessage(format!("unknown hash algorithm id {alg_id:#06x}"))
            })?;
            let select_len = r.u8("selection bitmap size")? as usize;
            let bitmap = r.take(select_len, "selection bitmap")?;
            let mut pcrs = Vec::new();
            for (byte_idx, byte) in bitmap.iter().enumerate() {
                for bit in 0..8 {
                    if byte & (1 << bit) != 0 {
                        let idx = byte_idx * 8 + bit;
                        if idx > MAX_PCR_INDEX as usize {
                            return Err(Error::MalformedMessage(format!(
                                "PCR index {idx} out of range in selection bitmap"
                            )));
                        }
                        pcrs.push(idx as u8);
                    }
                }
            }
            pcr_select.push(PcrSelection::new(hash, pcrs)?);
        }
        let pcr_digest = r.sized_buffer("PCR digest")?;
        if !r.done() {
            return Err(Error::MalformedMessage(
                "trailing bytes after attestation structure".into(),
            ));
        }

        Ok(Self {
            magic,
            attest_type,
            qualified_signer,
            extra_data,
            clock_info,
            firmware_version,
            pcr_select,
            pcr_digest,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);
        out.extend_from_slice(&self.magic.to_be_bytes());
        out.extend_from_slice(&self.attest_type.to_be_bytes());
        out.extend_from_slice(&(self.qualified_signer.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.qualified_signer);
        out.extend_from_slice(&(self.extra_data.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.extra_data);
        out.extend_from_slice(&self.clock_info.clock.to_be_bytes());
        out.extend_from_slice(&self.clock_info.reset_count.to_be_bytes());
        out.extend_from_slice(&self.clock_info.restart_count.to_be_bytes());
        out.push(self.clock_info.safe as u8);
        out.extend_from_slice(&self.firmware_version.to_be_bytes());
        out.extend_from_slice(&(self.pcr_select.len() as u32).to_be_bytes());
        for sel in &self.pcr_select {
            out.extend_from_slice(&sel.hash.tpm_alg_id().to_be_bytes());
            out.push(PCR_SELECT_BYTES as u8);
            let mut bitmap = [0u8; PCR_SELECT_BYTES];
            for &pcr in &sel.pcrs {
                bitmap[pcr as usize / 8] |= 1 << (pcr % 8);
            }
            out.extend_from_slice(&bitmap);
        }
        out.extend_from_slice(&(self.pcr_digest.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.pcr_digest);
        out
    }

    /// True iff the structure carries the TPM magic and the QUOTE type tag.
    pub fn is_genuine_quote(&self) -> bool {
        self.magic == TPM_GENERATED_MAGIC && self.attest_type == TPM_ST_ATTEST_QUOTE
    }
}

/// A marshalled TPMT_SIGNATURE: scheme tag, hash algorithm, raw signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmtSignature {
    pub scheme: u16,
    pub hash_alg: u16,
    pub raw: Vec<u8>,
}

impl TpmtSignature {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let mut r = Reader::new(buf);
        let scheme = r.u16("signature scheme")?;
        if scheme != TPM_ALG_RSAPSS && scheme != TPM_ALG_RSASSA {
            return Err(Error::MalformedMessage(format!(
                "unsupported signature scheme {scheme:#06x}"
            )));
        }
        let hash_alg = r.u16("signature hash algorithm")?;
        let raw = r.sized_buffer("signature buffer")?;
        if !r.done() {
            return Err(Error::MalformedMessage(
                "trailing bytes after signature structure".into(),
            ));
        }
        Ok(Self {
            scheme,
            hash_alg,
            raw,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(6 + self.raw.len());
        out.extend_from_slice(&self.scheme.to_be_bytes());
        out.extend_from_slice(&self.hash_alg.to_be_bytes());
        out.extend_from_slice(&(self.raw.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.raw);
        out
    }
}
