//! Environment-variable plumbing shared by the binaries.

use std::env;

use log::LevelFilter;

/// TPM command-channel selector (TCTI string). Absent means the default
/// device nodes are probed.
pub const ENV_TCTI: &str = "VOUCHD_TCTI";

/// Global log-level selector.
pub const ENV_LOG_LEVEL: &str = "LOG_LEVEL_VOUCHD";

/// Log-level override for the transport module.
pub const ENV_TRANSPORT_LOG_LEVEL: &str = "LOG_LEVEL_TRANSPORT";

pub fn tcti_from_env() -> Option<String> {
    env::var(ENV_TCTI).ok().filter(|s| !s.is_empty())
}

/// Parse a `trace|debug|info|warn|error` selector, falling back to the
/// given default on absence or garbage.
pub fn log_level(value: Option<&str>, default: LevelFilter) -> LevelFilter {
    match value {
        Some(s) => s.parse().unwrap_or(default),
        None => default,
    }
}

pub fn log_level_from_env(var: &str, default: LevelFilter) -> LevelFilter {
    log_level(env::var(var).ok().as_deref(), default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_parsing() {
        assert_eq!(log_level(Some("debug"), LevelFilter::Info), LevelFilter::Debug);
        assert_eq!(log_level(Some("TRACE"), LevelFilter::Info), LevelFilter::Trace);
        assert_eq!(log_level(Some("bogus"), LevelFilter::Warn), LevelFilter::Warn);
        assert_eq!(log_level(None, LevelFilter::Info), LevelFilter::Info);
    }
}
