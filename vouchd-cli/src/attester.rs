//! Attester daemon: answers attestation challenges on the `attest`
//! resource with TPM quotes over the selected PCR banks.

mod common;

use std::fs;
use std::path::PathBuf;
use std::process;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use vouchd_core::config;
use vouchd_core::transport::{TransportConfig, DEFAULT_PORT};
use vouchd_core::{tpm, Attester, AttesterConfig, CodecLimits, KeySpec, QuitToken};

use common::{LogArgs, SecurityArgs};

const DEFAULT_KEY_CONTEXT: &str = "vouchd.ctx";
const DEFAULT_PSK_HINT: &str = "Vouchd Attester";

#[derive(Parser, Debug)]
#[command(
    name = "vouchd-attester",
    version,
    about = "TPM 2.0 remote-attestation attester"
)]
struct Cli {
    #[command(flatten)]
    log: LogArgs,

    /// Listen on this UDP port
    #[arg(short = 'b', long = "port", value_name = "PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Listen address
    #[arg(long = "listen", value_name = "ADDR", default_value = "0.0.0.0")]
    listen: String,

    /// Path to the serialized signing-key context
    #[arg(
        long = "key-context",
        value_name = "PATH",
        conflicts_with = "key_handle"
    )]
    key_context: Option<PathBuf>,

    /// Persistent TPM handle of the signing key (hex, e.g. 0x81000002)
    #[arg(long = "key-handle", value_name = "HANDLE")]
    key_handle: Option<String>,

    /// PSK hint presented to connecting verifiers; implicitly enables --psk
    #[arg(long = "psk-hint", value_name = "HINT")]
    psk_hint: Option<String>,

    #[command(flatten)]
    security: SecurityArgs,
}

fn key_spec(cli: &Cli) -> Result<KeySpec> {
    if let Some(raw) = &cli.key_handle {
        let digits = raw.strip_prefix("0x").unwrap_or(raw);
        let handle = u32::from_str_radix(digits, 16)
            .with_context(|| format!("cannot parse key handle '{raw}'"))?;
        return Ok(KeySpec::Persistent(handle));
    }
    let path = cli
        .key_context
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_KEY_CONTEXT));
    let blob = fs::read(&path)
        .with_context(|| format!("cannot read key context '{}'", path.display()))?;
    Ok(KeySpec::Context(blob))
}

fn run(cli: Cli) -> Result<()> {
    let key_spec = key_spec(&cli)?;

    let mut security = cli.security;
    if cli.psk_hint.is_some() {
        security.psk = true;
    }
    let hint = cli.psk_hint.clone().unwrap_or_else(|| DEFAULT_PSK_HINT.into());
    let mut transport = TransportConfig::new(cli.listen.clone(), cli.port);
    transport.security = common::security_mode(&security, "attester", "verifier", &hint)?;
    let gateway = tpm::detect(config::tcti_from_env().as_deref());
    let attester = Attester::new(
        gateway,
        AttesterConfig {
            key_spec,
            limits: CodecLimits::default(),
        },
    );

    let quit = QuitToken::new();
    let signal_token = quit.clone();
    ctrlc::set_handler(move || signal_token.trigger())
        .map_err(|e| anyhow!("cannot install signal handler: {e}"))?;

    log::info!("initializing transport in block-wise mode");
    attester.serve(&transport, &quit)?;
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
