use crate::attribution::{AutonomousSystem, DelegatedThirdParty};
use crate::error::Error;
use crate::store::{
    CapturedDnsRequest, CapturedHttpRequest, CapturedSmtpRequest, DnsRecordData,
    DnsRecordOverride, HttpFile, Scheme,
};
use crate::test_id::TestId;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub(super) const MAX_FILE_CONTENT_BYTES: usize = 512;

const ALLOWED_PATH_PREFIXES: [&str; 2] = [
    "/.well-known/pki-validation/",
    "/.well-known/acme-challenge/",
];

#[derive(Serialize, Debug)]
pub(super) struct TestStarted {
    pub test_id: TestId,
    pub test_domain: String,
}

#[derive(Deserialize, Debug)]
pub(super) struct AddDnsRecordRequest {
    pub subdomain: String,
    #[serde(flatten)]
    pub data: DnsRecordData,
}

impl AddDnsRecordRequest {
    /// Subdomains are matched lowercased; validation also proves the data
    /// can be rendered as wire format later.
    pub fn into_record(self) -> Result<DnsRecordOverride, Error> {
        self.data.validate()?;
        Ok(DnsRecordOverride {
            subdomain: self.subdomain.to_ascii_lowercase(),
            data: self.data,
        })
    }
}

#[derive(Deserialize, Debug)]
pub(super) struct AddHttpFileRequest {
    pub scheme: Scheme,
    pub subdomain: String,
    pub path: String,
    pub content: String,
}

impl AddHttpFileRequest {
    pub fn into_file(self) -> Result<HttpFile, Error> {
        if !ALLOWED_PATH_PREFIXES
            .iter()
            .any(|prefix| self.path.starts_with(prefix))
        {
            return Err(Error::InvalidFilePath);
        }
        if self.content.len() > MAX_FILE_CONTENT_BYTES {
            return Err(Error::FileTooLarge(MAX_FILE_CONTENT_BYTES));
        }
        Ok(HttpFile {
            scheme: self.scheme,
            subdomain: self.subdomain.to_ascii_lowercase(),
            path: self.path,
            content: self.content,
        })
    }
}

/// Everything known about one test, with each evidence row annotated by
/// the attribution engine.
#[derive(Serialize, Debug)]
pub(super) struct TestReport {
    pub test_id: TestId,
    pub test_domain: String,
    pub started_at: OffsetDateTime,
    pub stopped_at: Option<OffsetDateTime>,
    pub running: bool,
    pub dns_records: Vec<DnsRecordOverride>,
    pub http_files: Vec<HttpFile>,
    pub dns_requests: Vec<AnnotatedDnsRequest>,
    pub http_requests: Vec<AnnotatedHttpRequest>,
    pub smtp_requests: Vec<AnnotatedSmtpRequest>,
}

#[derive(Serialize, Debug)]
pub(super) struct AnnotatedDnsRequest {
    #[serde(flatten)]
    pub request: CapturedDnsRequest,
    pub autonomous_systems: Vec<AutonomousSystem>,
    pub delegated_third_party: Option<DelegatedThirdParty>,
}

#[derive(Serialize, Debug)]
pub(super) struct AnnotatedHttpRequest {
    #[serde(flatten)]
    pub request: CapturedHttpRequest,
    pub autonomous_systems: Vec<AutonomousSystem>,
}

#[derive(Serialize, Debug)]
pub(super) struct AnnotatedSmtpRequest {
    #[serde(flatten)]
    pub request: CapturedSmtpRequest,
    pub autonomous_systems: Vec<AutonomousSystem>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CaaTag;

    #[test]
    fn file_paths_are_restricted_to_validation_locations() {
        let request = AddHttpFileRequest {
            scheme: Scheme::Http,
            subdomain: String::new(),
            path: "/index.html".to_string(),
            content: String::new(),
        };
        assert!(matches!(request.into_file(), Err(Error::InvalidFilePath)));

        let request = AddHttpFileRequest {
            scheme: Scheme::Http,
            subdomain: "WWW".to_string(),
            path: "/.well-known/pki-validation/fileauth.txt".to_string(),
            content: "ok".to_string(),
        };
        let file = request.into_file().unwrap();
        assert_eq!(file.subdomain, "www");
    }

    #[test]
    fn file_content_is_capped() {
        let request = AddHttpFileRequest {
            scheme: Scheme::Https,
            subdomain: String::new(),
            path: "/.well-known/acme-challenge/token".to_string(),
            content: "x".repeat(MAX_FILE_CONTENT_BYTES + 1),
        };
        assert!(matches!(
            request.into_file(),
            Err(Error::FileTooLarge(MAX_FILE_CONTENT_BYTES))
        ));
    }

    #[test]
    fn dns_record_requests_deserialize_flattened() {
        let request: AddDnsRecordRequest = serde_json::from_str(
            r#"{"subdomain": "_ACME-Challenge", "type": "TXT", "txt": "token"}"#,
        )
        .unwrap();
        let record = request.into_record().unwrap();
        assert_eq!(record.subdomain, "_acme-challenge");
        assert_eq!(
            record.data,
            DnsRecordData::Txt {
                txt: "token".to_string()
            }
        );

        let request: AddDnsRecordRequest = serde_json::from_str(
            r#"{"subdomain": "", "type": "CAA", "tag": "iodef", "value": "not a url"}"#,
        )
        .unwrap();
        assert!(matches!(
            request.into_record(),
            Err(Error::InvalidDnsRecord(_))
        ));
        assert!(matches!(
            serde_json::from_str::<AddDnsRecordRequest>(
                r#"{"subdomain": "", "type": "CAA", "tag": "contactemail", "value": "x"}"#,
            ),
            Err(_)
        ));
    }

    #[test]
    fn oversized_txt_records_are_rejected() {
        let record = DnsRecordData::Txt {
            txt: "x".repeat(256),
        };
        assert!(record.validate().is_err());
        let record = DnsRecordData::Caa {
            critical: true,
            tag: CaaTag::Issue,
            value: "ca.example.net".to_string(),
        };
        assert!(record.validate().is_ok());
    }
}
