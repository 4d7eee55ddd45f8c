//! Verifier: challenges an attester, validates the quote against trusted
//! reference PCRs, and reports the verdict in its exit code.

mod common;

use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use vouchd_core::config;
use vouchd_core::transport::{TransportConfig, DEFAULT_PORT};
use vouchd_core::wire::{LogIdentifier, PcrLogRequest};
use vouchd_core::{
    tpm, HashAlgorithm, NonceSource, PcrSelection, QuitToken, ReferencePcrStore,
    ValidationPolicy, Verifier, VerifierConfig,
};

use common::{LogArgs, SecurityArgs};

const DEFAULT_PSK_IDENTITY: &str = "Vouchd Verifier";
const DEFAULT_PCR_SELECTION: &str = "sha256:0,1,2,3,4,5,6,7,10";

#[derive(Parser, Debug)]
#[command(
    name = "vouchd-verifier",
    version,
    about = "TPM 2.0 remote-attestation verifier"
)]
struct Cli {
    #[command(flatten)]
    log: LogArgs,

    /// Attester host to connect to
    #[arg(long = "ip", value_name = "HOST", default_value = "127.0.0.1")]
    host: String,

    /// Attester port to connect to
    #[arg(short = 'b', long = "port", value_name = "PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Seconds to wait for the attestation response
    #[arg(short = 't', long = "timeout", value_name = "SECONDS", default_value_t = 30)]
    timeout: u64,

    /// Path to the public portion of the attestation key
    #[arg(long = "attestation-public-key", value_name = "PATH")]
    attestation_public_key: PathBuf,

    /// Reference PCR file as FORMAT:PATH; available format: yaml
    #[arg(short = 'f', long = "pcr-file", value_name = "FORMAT:PATH")]
    pcr_file: String,

    /// PCR banks to check, e.g. "sha256:0,1,2+sha1:all"
    #[arg(short = 's', long = "pcr-selection", value_name = "SELECTION", default_value = DEFAULT_PCR_SELECTION)]
    pcr_selection: String,

    /// Hash algorithm used to digest the quote: sha1|sha256|sha384|sha512
    #[arg(short = 'g', long = "hash-algorithm", value_name = "ALGORITHM", default_value = "sha256")]
    hash_algorithm: String,

    /// Request a PCR log as FORMAT:START,COUNT (ima or tcg-boot); repeatable
    #[arg(long = "pcr-log", value_name = "FORMAT:START,COUNT")]
    pcr_log: Vec<String>,

    /// Draw the challenge nonce from the TPM instead of the platform RNG
    #[arg(long = "nonce-from-tpm")]
    nonce_from_tpm: bool,

    /// Require the software signature path to agree with the TPM path
    #[arg(long = "require-software-signature")]
    require_software_signature: bool,

    /// PSK identity presented to the attester; implicitly enables --psk
    #[arg(short = 'i', long = "psk-identity", value_name = "IDENTITY")]
    psk_identity: Option<String>,

    #[command(flatten)]
    security: SecurityArgs,
}

/// Parse "bank:idx,idx+bank:idx" into selections; "all" selects every PCR.
fn parse_pcr_selection(expr: &str) -> Result<Vec<PcrSelection>> {
    let mut selections = Vec::new();
    for bank_expr in expr.split('+') {
        let (bank_name, pcr_list) = bank_expr
            .split_once(':')
            .ok_or_else(|| anyhow!("no bank defined in '{bank_expr}'"))?;
        let hash = HashAlgorithm::from_name(bank_name)
            .ok_or_else(|| anyhow!("invalid PCR bank '{bank_name}'"))?;
        let pcrs: Vec<u8> = if pcr_list == "all" {
            (0..=vouchd_core::tpm::MAX_PCR_INDEX).collect()
        } else {
            pcr_list
                .split(',')
                .map(|token| {
                    token
                        .parse::<u8>()
                        .with_context(|| format!("could not parse PCR index '{token}'"))
                })
                .collect::<Result<_>>()?
        };
        let selection = PcrSelection::new(hash, pcrs)
            .map_err(|e| anyhow!("invalid selection for bank '{bank_name}': {e}"))?;
        if selections
            .iter()
            .any(|existing: &PcrSelection| existing.hash == hash)
        {
            bail!("bank '{bank_name}' selected twice");
        }
        selections.push(selection);
    }
    Ok(selections)
}

/// Parse "FORMAT:PATH"; the only supported format is yaml.
fn parse_pcr_file(expr: &str) -> Result<PathBuf> {
    let (format, path) = expr
        .split_once(':')
        .ok_or_else(|| anyhow!("argument syntax error: use 'FORMAT:PATH'"))?;
    if format != "yaml" {
        bail!("file format '{format}' is not supported");
    }
    let path = Path::new(path);
    if !path.exists() {
        bail!("reference PCR file '{}' does not exist", path.display());
    }
    Ok(path.to_path_buf())
}

/// Parse one "FORMAT:START,COUNT" log request.
fn parse_pcr_log(expr: &str) -> Result<PcrLogRequest> {
    let (format, rest) = expr
        .split_once(':')
        .ok_or_else(|| anyhow!("argument syntax error: use 'FORMAT:START,COUNT'"))?;
    let identifier =
        LogIdentifier::from_str(format).ok_or_else(|| anyhow!("unknown format '{format}'"))?;
    let (start, count) = rest
        .split_once(',')
        .ok_or_else(|| anyhow!("argument syntax error: use 'FORMAT:START,COUNT'"))?;
    Ok(PcrLogRequest {
        identifier,
        start: start
            .parse()
            .with_context(|| format!("could not parse start '{start}'"))?,
        count: count
            .parse()
            .with_context(|| format!("could not parse count '{count}'"))?,
    })
}

/// Later occurrences of the same log format override earlier ones.
fn collect_pcr_logs(exprs: &[String]) -> Result<Vec<PcrLogRequest>> {
    let mut logs: Vec<PcrLogRequest> = Vec::new();
    for expr in exprs {
        let request = parse_pcr_log(expr)?;
        if let Some(existing) = logs
            .iter_mut()
            .find(|l| l.identifier == request.identifier)
        {
            *existing = request;
        } else {
            logs.push(request);
        }
    }
    Ok(logs)
}

fn run(cli: Cli) -> Result<()> {
    let hash = HashAlgorithm::from_name(&cli.hash_algorithm)
        .ok_or_else(|| anyhow!("unsupported hash algorithm: '{}'", cli.hash_algorithm))?;
    let pcr_selections = parse_pcr_selection(&cli.pcr_selection)?;
    let pcr_logs = collect_pcr_logs(&cli.pcr_log)?;
    let reference_path = parse_pcr_file(&cli.pcr_file)?;
    if cli.timeout == 0 {
        bail!("timeout must be positive");
    }

    let mut security = cli.security;
    if cli.psk_identity.is_some() {
        security.psk = true;
    }
    let identity = cli
        .psk_identity
        .clone()
        .unwrap_or_else(|| DEFAULT_PSK_IDENTITY.into());
    let mut transport = TransportConfig::new(cli.host.clone(), cli.port);
    transport.security = common::security_mode(&security, "verifier", "attester", &identity)?;

    log::debug!("verifier configuration:");
    log::debug!("    destination: {}:{}", cli.host, cli.port);
    log::debug!("    response timeout: {} s", cli.timeout);
    log::debug!("    reference PCR file: '{}'", reference_path.display());
    log::debug!("    hash algorithm: {}", hash.name());
    for sel in &pcr_selections {
        log::debug!("    bank {}: {:?}", sel.hash.name(), sel.pcrs);
    }

    let attestation_key_blob = fs::read(&cli.attestation_public_key).with_context(|| {
        format!(
            "cannot read attestation public key '{}'",
            cli.attestation_public_key.display()
        )
    })?;
    let reference = ReferencePcrStore::load(&reference_path)?;

    let gateway = tpm::detect(config::tcti_from_env().as_deref());
    let verifier = Verifier::new(
        gateway,
        VerifierConfig {
            pcr_selections,
            pcr_logs,
            response_timeout: Duration::from_secs(cli.timeout),
            policy: ValidationPolicy {
                hash,
                require_software_signature: cli.require_software_signature,
            },
            nonce_source: if cli.nonce_from_tpm {
                NonceSource::Tpm
            } else {
                NonceSource::PlatformRng
            },
            ..VerifierConfig::default()
        },
    );

    let quit = QuitToken::new();
    let signal_token = quit.clone();
    ctrlc::set_handler(move || signal_token.trigger())
        .map_err(|e| anyhow!("cannot install signal handler: {e}"))?;

    verifier.attest(&transport, &reference, &attestation_key_blob, &quit)?;
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    common::init_logging(&cli.log);
    if let Err(err) = run(cli) {
        log::error!("{err:#}");
        process::exit(common::resolve_exit(&err));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pcr_selection_multi_bank() {
        let selections = parse_pcr_selection("sha256:7,0,1+sha1:all").expect("parse");
        assert_eq!(selections.len(), 2);
        assert_eq!(selections[0].hash, HashAlgorithm::Sha256);
        assert_eq!(selections[0].pcrs, vec![0, 1, 7]);
        assert_eq!(selections[1].hash, HashAlgorithm::Sha1);
        assert_eq!(selections[1].pcrs.len(), 24);
    }

    #[test]
    fn test_parse_pcr_selection_rejects_garbage() {
        assert!(parse_pcr_selection("sha256").is_err());
        assert!(parse_pcr_selection("sm3:0,1").is_err());
        assert!(parse_pcr_selection("sha256:0,99").is_err());
        assert!(parse_pcr_selection("sha256:0+sha256:1").is_err());
    }

    #[test]
    fn test_parse_pcr_file_requires_yaml() {
        let file = tempfile::NamedTempFile::new().expect("tempfile");
        let expr = format!("yaml:{}", file.path().display());
        assert_eq!(parse_pcr_file(&expr).expect("parse"), file.path());
        assert!(parse_pcr_file(&format!("json:{}", file.path().display())).is_err());
        assert!(parse_pcr_file("yaml:/does/not/exist.yaml").is_err());
        assert!(parse_pcr_file("no-colon").is_err());
    }

    #[test]
    fn test_parse_pcr_log_expressions() {
        let request = parse_pcr_log("ima:4,10").expect("parse");
        assert_eq!(request.identifier, LogIdentifier::Ima);
        assert_eq!(request.start, 4);
        assert_eq!(request.count, 10);
        assert!(parse_pcr_log("ima:4").is_err());
        assert!(parse_pcr_log("swtpm:0,0").is_err());
    }

    #[test]
    fn test_collect_pcr_logs_overrides_duplicates() {
        let logs = collect_pcr_logs(&[
            "ima:1,0".to_string(),
            "tcg-boot:0,0".to_string(),
            "ima:5,2".to_string(),
        ])
        .expect("collect");
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].identifier, LogIdentifier::Ima);
        assert_eq!(logs[0].start, 5);
        assert_eq!(logs[0].count, 2);
    }

    #[test]
    fn test_unknown_hash_algorithm_is_rejected() {
        assert!(HashAlgorithm::from_name("sha3_256").is_none());
    }
}
