//! Error types for `rendezvous-relay`.
//!
//! Mirroring the rest of this crate, errors are split by concern rather than
//! collected into one large enum: registration errors need to become HTTP
//! responses with precise wording, while configuration/TLS errors are fatal
//! start-up failures that never reach a client.

use std::path::PathBuf;

use thiserror::Error;

/// An error while registering a sender or receiver on the [`PathRegistry`](crate::registry::PathRegistry).
///
/// Every variant here is surfaced synchronously as an HTTP response body
/// before any participant is added to a pending rendezvous; none of them can
/// leave the registry in a partially-mutated state.
#[derive(Debug, Error)]
pub enum RegistrationError {
    /// The `n` query parameter resolved to zero or a negative number.
    #[error("the number of receivers must be a positive integer")]
    NotPositive,

    /// The path already has a fully established rendezvous in progress.
    #[error("the path '{path}' is already in use")]
    AlreadyEstablished {
        /// The path that was requested.
        path: String,
    },

    /// A sender already registered for this path while it was pending.
    #[error("another sender is already registered for path '{path}'")]
    SenderAlreadyRegistered {
        /// The path that was requested.
        path: String,
    },

    /// The declared `n` does not match the one fixed by the first arrival on
    /// this path.
    #[error("the number of receivers must be {expected}, but you specified {offered}")]
    ReceiverCountMismatch {
        /// The `n` fixed by whichever party arrived first.
        expected: u32,
        /// The `n` carried by the request that lost the mismatch.
        offered: u32,
    },

    /// `receivers.len()` already equals the declared `n`.
    #[error("the receiver limit ({limit}) for path '{path}' has already been reached")]
    ReceiverLimitReached {
        /// The path that was requested.
        path: String,
        /// The declared receiver target.
        limit: u32,
    },
}

/// An error while building a [`HttpServer`](crate::http::HttpServer) or
/// similar builder-style type.
#[derive(Debug, Error)]
pub enum BuilderError {
    /// A mandatory field was never set before `.build()` was called.
    #[error("missing field: {0}")]
    MissingField(&'static str),
}

/// An error while resolving the command-line configuration into a
/// [`ServerConfig`](crate::cfg::ServerConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    /// `--https-port` was given without both `--tls-cert` and `--tls-key`.
    #[error("--https-port requires both --tls-cert and --tls-key")]
    IncompleteTlsConfig,
}

/// An error while loading the certificate chain and private key for HTTPS.
#[derive(Debug, Error)]
pub enum TlsError {
    /// The certificate or key file could not be read from disk.
    #[error("failed to read '{path}': {source}")]
    Io {
        /// The file that failed to open.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The PEM certificate chain was empty or malformed.
    #[error("no certificates found in '{path}'")]
    NoCertificates {
        /// The file that was parsed.
        path: PathBuf,
    },

    /// The PEM private key was empty or malformed.
    #[error("no private key found in '{path}'")]
    NoPrivateKey {
        /// The file that was parsed.
        path: PathBuf,
    },

    /// `rustls` rejected the certificate/key pair.
    #[error("rustls rejected the certificate/key pair: {0}")]
    Rustls(#[from] tokio_rustls::rustls::Error),
}
