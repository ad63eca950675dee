//! Session registry and evidence store.
//!
//! The capture handlers never talk to a database directly; they go through
//! the [`Store`] trait, which models the external relational store at its
//! interface boundary: is a test running, what has the operator provisioned
//! for it, and append-only evidence rows for everything a probe sends.
//!
//! [`memory::InMemoryStore`] is the in-tree implementation, suitable for
//! tests and single-process deployments. Deployments with a real database
//! implement [`Store`] against it; the capture handlers don't care.
//!
//! Evidence rows are created by the capture handlers while the owning test
//! is running and are never updated. A test stopping concurrently with an
//! in-flight capture may still record one last row; that race is accepted.

use crate::error::Error;
use crate::test_id::TestId;
use serde::{Deserialize, Serialize};
use serde_with::base64::Base64;
use serde_with::serde_as;
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use trust_dns_proto::rr::rdata::caa::KeyValue;
use trust_dns_proto::rr::rdata::{CAA, TXT};
use trust_dns_server::client::rr::{Name, RData, RecordType};
use url::Url;

pub mod memory;

#[allow(clippy::module_name_repetitions)]
pub use memory::InMemoryStore;

/// `DynStore` is a type alias for a [`Store`] shared between the capture
/// handlers, the operator API and housekeeping, coordinated through an
/// [`Arc`] and a [`RwLock`].
#[allow(clippy::module_name_repetitions)]
pub type DynStore = Arc<RwLock<dyn Store + Send + Sync>>;

/// One operator-initiated capture session.
#[derive(Clone, Debug, Serialize)]
pub struct TestSession {
    pub test_id: TestId,
    pub started_at: OffsetDateTime,
    /// Monotonic: once set it is never cleared.
    pub stopped_at: Option<OffsetDateTime>,
}

impl TestSession {
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.stopped_at.is_none()
    }
}

/// The request scheme an HTTP file is provisioned for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Http,
    Https,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Http => f.write_str("http"),
            Scheme::Https => f.write_str("https"),
        }
    }
}

/// CAA tags the DNS responder can serve. Unknown tags are rejected when the
/// record is provisioned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaaTag {
    Issue,
    IssueWild,
    Iodef,
}

/// Structured data of an operator-provisioned DNS record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum DnsRecordData {
    Txt {
        txt: String,
    },
    Caa {
        #[serde(default)]
        critical: bool,
        tag: CaaTag,
        value: String,
    },
}

impl DnsRecordData {
    #[must_use]
    pub fn record_type(&self) -> RecordType {
        match self {
            DnsRecordData::Txt { .. } => RecordType::TXT,
            DnsRecordData::Caa { .. } => RecordType::CAA,
        }
    }

    /// Validate the data the way the write path must: oversized TXT values
    /// and unusable CAA values are rejected before they reach the store.
    pub fn validate(&self) -> Result<(), Error> {
        self.to_rdata().map(|_| ())
    }

    /// Build the wire data served for this record.
    pub fn to_rdata(&self) -> Result<RData, Error> {
        match self {
            DnsRecordData::Txt { txt } => {
                if txt.len() > 255 {
                    return Err(Error::InvalidDnsRecord("TXT value is too long".to_string()));
                }
                Ok(RData::TXT(TXT::new(vec![txt.clone()])))
            }
            DnsRecordData::Caa {
                critical,
                tag,
                value,
            } => match tag {
                CaaTag::Issue => Ok(RData::CAA(CAA::new_issue(
                    *critical,
                    Some(caa_issuer_name(value)?),
                    Vec::<KeyValue>::new(),
                ))),
                CaaTag::IssueWild => Ok(RData::CAA(CAA::new_issuewild(
                    *critical,
                    Some(caa_issuer_name(value)?),
                    Vec::<KeyValue>::new(),
                ))),
                CaaTag::Iodef => {
                    let url = Url::parse(value).map_err(|err| {
                        Error::InvalidDnsRecord(format!("bad iodef URL: {err}"))
                    })?;
                    Ok(RData::CAA(CAA::new_iodef(*critical, url)))
                }
            },
        }
    }
}

fn caa_issuer_name(value: &str) -> Result<Name, Error> {
    Name::from_ascii(value)
        .map_err(|err| Error::InvalidDnsRecord(format!("bad issuer name: {err}")))
}

/// An operator-provisioned DNS record served for a test at TTL 15. Multiple
/// records may exist for the same (subdomain, type).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsRecordOverride {
    pub subdomain: String,
    #[serde(flatten)]
    pub data: DnsRecordData,
}

/// Operator-provisioned static content, unique per
/// (test, scheme, subdomain, path).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpFile {
    pub scheme: Scheme,
    pub subdomain: String,
    pub path: String,
    pub content: String,
}

/// Evidence row for one captured DNS query.
#[serde_as]
#[derive(Clone, Debug, Serialize)]
pub struct CapturedDnsRequest {
    pub test_id: TestId,
    pub received_at: OffsetDateTime,
    pub remote_addr: SocketAddr,
    pub fqdn: String,
    pub qtype: RecordType,
    /// The query in wire format.
    #[serde_as(as = "Base64")]
    pub message: Vec<u8>,
}

/// Evidence row for one captured HTTP request.
#[derive(Clone, Debug, Serialize)]
pub struct CapturedHttpRequest {
    pub test_id: TestId,
    pub received_at: OffsetDateTime,
    pub remote_addr: SocketAddr,
    pub host: String,
    pub method: String,
    pub url: String,
    pub version: String,
    pub headers: BTreeMap<String, Vec<String>>,
    pub https: bool,
}

/// Evidence row for one captured SMTP message, one per distinct test named
/// by the accepted recipients.
#[serde_as]
#[derive(Clone, Debug, Serialize)]
pub struct CapturedSmtpRequest {
    pub test_id: TestId,
    pub received_at: OffsetDateTime,
    pub remote_addr: SocketAddr,
    pub helo: String,
    pub starttls: bool,
    pub mail_from: String,
    /// Every accepted recipient of the message, not just the ones naming
    /// this test.
    pub rcpt_to: Vec<String>,
    #[serde_as(as = "Base64")]
    pub message: Vec<u8>,
}

/// The session registry and evidence store the capture handlers depend on.
#[async_trait::async_trait]
pub trait Store {
    /// Register a new running test.
    async fn start_test(&mut self, id: TestId) -> Result<(), Error>;

    /// Stop a test. Idempotent; a stop time, once set, is never changed.
    async fn stop_test(&mut self, id: TestId) -> Result<(), Error>;

    /// Stop every running test started before the cutoff, returning how
    /// many were stopped.
    async fn stop_stale_tests(&mut self, started_before: OffsetDateTime) -> Result<u64, Error>;

    async fn test_session(&self, id: TestId) -> Result<Option<TestSession>, Error>;

    async fn is_running_test(&self, id: TestId) -> Result<bool, Error>;

    async fn add_dns_record(&mut self, id: TestId, record: DnsRecordOverride)
        -> Result<(), Error>;

    /// Records for (test, subdomain), optionally narrowed to one type.
    async fn dns_records(
        &self,
        id: TestId,
        subdomain: &str,
        record_type: Option<RecordType>,
    ) -> Result<Vec<DnsRecordOverride>, Error>;

    /// Every record provisioned for a test, for the operator report.
    async fn all_dns_records(&self, id: TestId) -> Result<Vec<DnsRecordOverride>, Error>;

    /// Add a file; (scheme, subdomain, path) must be unique per test.
    async fn add_http_file(&mut self, id: TestId, file: HttpFile) -> Result<(), Error>;

    async fn http_files(&self, id: TestId) -> Result<Vec<HttpFile>, Error>;

    async fn http_file_content(
        &self,
        id: TestId,
        scheme: Scheme,
        subdomain: &str,
        path: &str,
    ) -> Result<Option<String>, Error>;

    async fn record_dns_request(&mut self, request: CapturedDnsRequest) -> Result<(), Error>;

    async fn record_http_request(&mut self, request: CapturedHttpRequest) -> Result<(), Error>;

    async fn record_smtp_request(&mut self, request: CapturedSmtpRequest) -> Result<(), Error>;

    async fn dns_requests(&self, id: TestId) -> Result<Vec<CapturedDnsRequest>, Error>;

    async fn http_requests(&self, id: TestId) -> Result<Vec<CapturedHttpRequest>, Error>;

    async fn smtp_requests(&self, id: TestId) -> Result<Vec<CapturedSmtpRequest>, Error>;
}
