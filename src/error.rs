//! Error types.

use crate::test_id::TestId;
use axum::extract::rejection::JsonRejection;
use trust_dns_server::proto::error::ProtoError;

/// Error enumerates the possible dcvtrace error states.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Returned when a string that should name a test is not 32 hex characters.
    #[error("\"{0}\" is not a valid test identifier")]
    InvalidTestId(String),

    /// Returned for operations against a test identifier the registry has
    /// never seen.
    #[error("test {0} not found")]
    TestNotFound(TestId),

    /// Returned when an operator tries to provision records or files for a
    /// test that has already been stopped.
    #[error("test {0} is not running")]
    TestNotRunning(TestId),

    /// Returned when a provisioned HTTP file path is outside the well-known
    /// validation locations.
    #[error(
        "path must start with /.well-known/pki-validation/ or /.well-known/acme-challenge/"
    )]
    InvalidFilePath,

    /// Returned when provisioned HTTP file content exceeds the size cap.
    #[error("content must not be longer than {0} bytes")]
    FileTooLarge(usize),

    /// Returned when a file already exists for the same scheme, subdomain
    /// and path of a test.
    #[error("there is already a file at this scheme, subdomain and path")]
    DuplicateFile,

    /// Returned when an operator-provided DNS record can't be turned into
    /// wire data (oversized TXT, unsupported CAA tag, bad value).
    #[error("invalid DNS record: {0}")]
    InvalidDnsRecord(String),

    /// Returned by every certificate mint after the one-time generation of
    /// the self-signed key has failed.
    #[error("generating the self-signed key failed")]
    SelfSignedKey,

    /// Returned when building or signing an on-demand certificate fails.
    #[error("certificate generation failed: {0}")]
    CertificateGeneration(String),

    /// Returned when the system random source can't be read (test
    /// identifiers, certificate serial numbers).
    #[error("reading from the system random source failed")]
    Random(#[from] rand::Error),

    /// Returned when a PEM file contains no certificates.
    #[error("no certificates found in {0}")]
    NoCertificates(String),

    /// Returned when a PEM file contains no usable private key.
    #[error("no private key found in {0}")]
    NoPrivateKey(String),

    /// Returned when an attribution feed answers with a non-success status.
    #[error("{url} returned HTTP {status}")]
    FeedStatus { url: String, status: u16 },

    /// Returned when fetching an attribution feed fails at the transport
    /// level.
    #[error("error fetching attribution feed")]
    FeedFetch(#[from] reqwest::Error),

    /// Returned when an attribution feed record doesn't have the expected
    /// shape.
    #[error("invalid attribution feed record: {0}")]
    FeedFormat(String),

    /// Returned when the AS name table isn't valid CSV.
    #[error("invalid CSV")]
    InvalidCsv(#[from] csv::Error),

    /// Returned when clients `POST` invalid JSON to the operator API.
    #[error(transparent)]
    JsonExtractorRejection(#[from] JsonRejection),

    /// Returned when the config file is structurally valid but unusable.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Returned when a generic IO error occurs.
    #[error("an IO error occurred")]
    IO(#[from] std::io::Error),

    /// Returned when processing JSON (config file, feed records) fails.
    #[error("invalid JSON")]
    InvalidJSON(#[from] serde_json::Error),

    /// Returned when the DNS responder encounters a generic protocol error.
    #[error("DNS error")]
    DNSError(#[from] ProtoError),

    /// Returned when a TLS handshake or TLS setup step fails.
    #[error("TLS error")]
    Tls(#[from] rustls::Error),
}
