//! Flag groups and glue shared by the attester and verifier binaries.

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Args;
use log::LevelFilter;
use vouchd_core::config;
use vouchd_core::transport::{PskConfig, RpkConfig, SecurityMode};
use vouchd_core::{Error, FailureKind};

/// Default pre-shared key used when PSK mode is enabled without a key.
pub const DEFAULT_PSK_KEY: &str = "Vouchd DTLS Key";

#[derive(Args, Debug)]
pub struct LogArgs {
    /// Force debug output on every log channel
    #[arg(short, long)]
    pub verbose: bool,

    /// Log level: trace|debug|info|warn|error
    #[arg(short = 'l', long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Transport log level: trace|debug|info|warn|error
    #[arg(short = 'c', long = "transport-log-level", value_name = "LEVEL")]
    pub transport_log_level: Option<String>,
}

/// Initialize logging from flags and the environment; flags win.
pub fn init_logging(args: &LogArgs) {
    let mut level = config::log_level(
        args.log_level.as_deref(),
        config::log_level_from_env(config::ENV_LOG_LEVEL, LevelFilter::Info),
    );
    let mut transport_level = config::log_level(
        args.transport_log_level.as_deref(),
        config::log_level_from_env(config::ENV_TRANSPORT_LOG_LEVEL, level),
    );
    if args.verbose {
        level = LevelFilter::Debug;
        transport_level = LevelFilter::Debug;
    }
    env_logger::Builder::new()
        .filter_level(level)
        .filter_module("vouchd_core::transport", transport_level)
        .init();
}

#[derive(Args, Debug)]
pub struct SecurityArgs {
    /// Enable DTLS with a pre-shared key
    #[arg(short = 'p', long = "psk")]
    pub psk: bool,

    /// Pre-shared key for DTLS-PSK; implicitly enables --psk
    #[arg(short = 'k', long = "psk-key", value_name = "KEY")]
    pub psk_key: Option<String>,

    /// Enable DTLS with raw public keys
    #[arg(short = 'r', long = "rpk")]
    pub rpk: bool,

    /// Path to this endpoint's raw private key
    #[arg(long = "rpk-private-key", value_name = "PATH")]
    pub rpk_private_key: Option<PathBuf>,

    /// Path to this endpoint's raw public key
    #[arg(long = "rpk-public-key", value_name = "PATH")]
    pub rpk_public_key: Option<PathBuf>,

    /// Path to the peer's raw public key
    #[arg(long = "rpk-peer-public-key", value_name = "PATH")]
    pub rpk_peer_public_key: Option<PathBuf>,

    /// Verify the peer's raw public key
    #[arg(
        long = "rpk-verify-peer",
        value_name = "BOOL",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub rpk_verify_peer: bool,
}

/// Resolve the security mode for one endpoint role. `role` and `peer` name
/// the endpoints ("attester"/"verifier") for the RPK default key paths;
/// `identity` is the PSK identity or hint.
pub fn security_mode(args: &SecurityArgs, role: &str, peer: &str, identity: &str) -> Result<SecurityMode> {
    let use_psk = args.psk || args.psk_key.is_some();
    if use_psk && args.rpk {
        bail!("configuration enables both DTLS-PSK and DTLS-RPK; pick one");
    }
    if use_psk {
        let key = args
            .psk_key
            .clone()
            .unwrap_or_else(|| DEFAULT_PSK_KEY.to_string());
        return Ok(SecurityMode::Psk(PskConfig {
            identity: identity.to_string(),
            key: key.into_bytes(),
        }));
    }
    if args.rpk {
        return Ok(SecurityMode::Rpk(RpkConfig {
            private_key_path: args
                .rpk_private_key
                .clone()
                .unwrap_or_else(|| PathBuf::from(format!("keys/{role}.der"))),
            public_key_path: args
                .rpk_public_key
                .clone()
                .unwrap_or_else(|| PathBuf::from(format!("keys/{role}.pub.der"))),
            peer_public_key_path: args
                .rpk_peer_public_key
                .clone()
                .unwrap_or_else(|| PathBuf::from(format!("keys/{peer}.pub.der"))),
            verify_peer: args.rpk_verify_peer,
        }));
    }
    Ok(SecurityMode::NoSec)
}

/// Map a core error onto the process exit code. Distinct codes let test
/// harnesses assert precise outcomes.
pub fn exit_code(err: &Error) -> i32 {
    match err {
        Error::Cli(_) => 2,
        Error::Timeout(_) => 3,
        Error::Transport(_) => 4,
        Error::MalformedMessage(_) => 5,
        Error::AttestationFailed(kind) => match kind {
            FailureKind::Malformed => 5,
            FailureKind::SignatureInvalid => 10,
            FailureKind::MagicMismatch => 11,
            FailureKind::NonceMismatch => 12,
            FailureKind::NoReferenceMatch => 13,
        },
        _ => 1,
    }
}

/// Exit-code resolution for an anyhow error chain: core errors get their
/// mapped code, plain configuration problems exit 2.
pub fn resolve_exit(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<Error>().map(exit_code).unwrap_or(2)
}
