//! Command-line configuration.
//!
//! The service has no file-based configuration layer: every knob it exposes
//! is a CLI flag, parsed with `clap`'s derive API and resolved once at
//! startup into a plain [`ServerConfig`] that the rest of the crate reads.

use std::path::PathBuf;

use clap::Parser;
use tracing::level_filters::LevelFilter;

use crate::err::ConfigError;

/// `rendezvous-relay` — pairs a sender with N receivers on a shared path and
/// pipes bytes through without persisting them.
#[derive(Debug, Parser)]
#[command(name = "rendezvous-relay", version, about)]
pub(crate) struct Cli {
    /// HTTP port to listen on.
    #[arg(long, default_value_t = 8080)]
    http_port: u16,

    /// HTTPS port to listen on. Requires --tls-cert and --tls-key.
    #[arg(long)]
    https_port: Option<u16>,

    /// PEM certificate chain for HTTPS.
    #[arg(long)]
    tls_cert: Option<PathBuf>,

    /// PEM private key for HTTPS.
    #[arg(long)]
    tls_key: Option<PathBuf>,

    /// Fallback Host value used when a request carries no Host header.
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Disable logging entirely.
    #[arg(long)]
    quiet: bool,
}

/// HTTPS-specific configuration, present only when all three of
/// `--https-port`, `--tls-cert` and `--tls-key` were given together.
#[derive(Debug, Clone)]
pub(crate) struct HttpsConfig {
    pub(crate) port: u16,
    pub(crate) cert: PathBuf,
    pub(crate) key: PathBuf,
}

/// The fully resolved configuration the rest of the crate runs from.
#[derive(Debug, Clone)]
pub(crate) struct ServerConfig {
    pub(crate) http_port: u16,
    pub(crate) https: Option<HttpsConfig>,
    pub(crate) host_header_fallback: String,
    pub(crate) log_level: Option<LevelFilter>,
}

impl ServerConfig {
    /// Resolves a parsed [`Cli`] into a [`ServerConfig`], validating the TLS
    /// flag combination.
    pub(crate) fn from_cli(cli: Cli) -> Result<Self, ConfigError> {
        let https = match (cli.https_port, cli.tls_cert, cli.tls_key) {
            (None, None, None) => None,
            (Some(port), Some(cert), Some(key)) => Some(HttpsConfig { port, cert, key }),
            _ => return Err(ConfigError::IncompleteTlsConfig),
        };

        Ok(Self {
            http_port: cli.http_port,
            https,
            host_header_fallback: cli.host,
            log_level: if cli.quiet {
                None
            } else {
                Some(LevelFilter::INFO)
            },
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rejects_partial_tls_config() {
        let cli = Cli {
            http_port: 8080,
            https_port: Some(8443),
            tls_cert: None,
            tls_key: None,
            host: "localhost".into(),
            quiet: false,
        };
        assert!(matches!(
            ServerConfig::from_cli(cli),
            Err(ConfigError::IncompleteTlsConfig)
        ));
    }

    #[test]
    fn accepts_full_tls_config() {
        let cli = Cli {
            http_port: 8080,
            https_port: Some(8443),
            tls_cert: Some(PathBuf::from("cert.pem")),
            tls_key: Some(PathBuf::from("key.pem")),
            host: "localhost".into(),
            quiet: false,
        };
        let config = ServerConfig::from_cli(cli).expect("valid config");
        assert_eq!(config.https.unwrap().port, 8443);
    }

    #[test]
    fn plain_http_needs_no_tls_fields() {
        let cli = Cli {
            http_port: 8080,
            https_port: None,
            tls_cert: None,
            tls_key: None,
            host: "localhost".into(),
            quiet: false,
        };
        let config = ServerConfig::from_cli(cli).expect("valid config");
        assert!(config.https.is_none());
    }
}
