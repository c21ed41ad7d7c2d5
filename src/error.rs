//! Error types shared across the crate.

use std::path::PathBuf;

use thiserror::Error;

/// Errors from the local certificate authority.
#[derive(Debug, Error)]
pub enum CaError {
    /// Reading or writing a CA file failed.
    #[error("CA file I/O failed at {path}: {source}")]
    Io {
        /// Path of the file involved.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Exactly one of the two root files is present. Minting a new root here
    /// would silently invalidate previously trusted deployments, so the
    /// operation fails instead.
    #[error("CA root material incomplete: {present} exists but {missing} is missing")]
    IncompleteRoot {
        /// The file that was found.
        present: PathBuf,
        /// The file that was not.
        missing: PathBuf,
    },

    /// RSA key generation or encoding failed.
    #[error("Key generation failed: {reason}")]
    KeyGeneration {
        /// Reason for failure.
        reason: String,
    },

    /// Building or signing an X.509 certificate failed.
    #[error("Certificate build failed: {reason}")]
    CertificateBuild {
        /// Reason for failure.
        reason: String,
    },

    /// No home directory to anchor the per-user CA store.
    #[error("Could not determine a home directory for the CA store")]
    NoHomeDir,
}

/// Errors from rule document ingestion and compilation.
#[derive(Debug, Error)]
pub enum RuleError {
    /// The YAML document did not match the rule schema.
    #[error("Invalid rule document: {0}")]
    Yaml(#[from] serde_yml::Error),

    /// The JSON document did not match the rule schema.
    #[error("Invalid rule document: {0}")]
    Json(#[from] serde_json::Error),

    /// A rule's `url_regex` failed to compile.
    #[error("Rule '{rule}' has an invalid url_regex: {source}")]
    InvalidRegex {
        /// Name of the offending rule.
        rule: String,
        /// Underlying regex error.
        #[source]
        source: regex::Error,
    },
}

/// Errors from the proxy server and its upstream client.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Binding the listening socket failed.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        /// The address that could not be bound.
        addr: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Building the upstream HTTP client failed.
    #[error("Failed to build upstream client: {source}")]
    Client {
        /// Underlying client error.
        #[source]
        source: reqwest::Error,
    },

    /// The (possibly rewritten) target URL could not be parsed.
    #[error("Invalid upstream URL '{url}': {source}")]
    UpstreamUrl {
        /// The offending URL.
        url: String,
        /// Underlying parse error.
        #[source]
        source: url::ParseError,
    },

    /// The upstream fetch itself failed (DNS, TCP, TLS, or protocol error).
    #[error("Upstream request failed: {source}")]
    Upstream {
        /// Underlying client error.
        #[source]
        source: reqwest::Error,
    },
}
