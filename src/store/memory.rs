use crate::error::Error;
use crate::store::{
    CapturedDnsRequest, CapturedHttpRequest, CapturedSmtpRequest, DnsRecordOverride, HttpFile,
    Scheme, Store, TestSession,
};
use crate::test_id::TestId;
use std::collections::HashMap;
use time::OffsetDateTime;
use trust_dns_server::client::rr::RecordType;

/// An in-memory implementation of the session registry and evidence store.
/// Not durable across restarts.
#[derive(Default, Debug)]
pub struct InMemoryStore {
    tests: HashMap<TestId, TestState>,
}

#[derive(Debug)]
struct TestState {
    session: TestSession,
    dns_records: Vec<DnsRecordOverride>,
    http_files: Vec<HttpFile>,
    dns_requests: Vec<CapturedDnsRequest>,
    http_requests: Vec<CapturedHttpRequest>,
    smtp_requests: Vec<CapturedSmtpRequest>,
}

impl InMemoryStore {
    fn test(&self, id: TestId) -> Result<&TestState, Error> {
        self.tests.get(&id).ok_or(Error::TestNotFound(id))
    }

    fn test_mut(&mut self, id: TestId) -> Result<&mut TestState, Error> {
        self.tests.get_mut(&id).ok_or(Error::TestNotFound(id))
    }
}

#[async_trait::async_trait]
impl Store for InMemoryStore {
    async fn start_test(&mut self, id: TestId) -> Result<(), Error> {
        self.tests.insert(
            id,
            TestState {
                session: TestSession {
                    test_id: id,
                    started_at: OffsetDateTime::now_utc(),
                    stopped_at: None,
                },
                dns_records: Vec::new(),
                http_files: Vec::new(),
                dns_requests: Vec::new(),
                http_requests: Vec::new(),
                smtp_requests: Vec::new(),
            },
        );
        Ok(())
    }

    async fn stop_test(&mut self, id: TestId) -> Result<(), Error> {
        let state = self.test_mut(id)?;
        if state.session.stopped_at.is_none() {
            state.session.stopped_at = Some(OffsetDateTime::now_utc());
        }
        Ok(())
    }

    async fn stop_stale_tests(&mut self, started_before: OffsetDateTime) -> Result<u64, Error> {
        let now = OffsetDateTime::now_utc();
        let mut stopped = 0;
        for state in self.tests.values_mut() {
            if state.session.stopped_at.is_none() && state.session.started_at < started_before {
                state.session.stopped_at = Some(now);
                stopped += 1;
            }
        }
        Ok(stopped)
    }

    async fn test_session(&self, id: TestId) -> Result<Option<TestSession>, Error> {
        Ok(self.tests.get(&id).map(|state| state.session.clone()))
    }

    async fn is_running_test(&self, id: TestId) -> Result<bool, Error> {
        Ok(self
            .tests
            .get(&id)
            .map_or(false, |state| state.session.is_running()))
    }

    async fn add_dns_record(
        &mut self,
        id: TestId,
        record: DnsRecordOverride,
    ) -> Result<(), Error> {
        self.test_mut(id)?.dns_records.push(record);
        Ok(())
    }

    async fn dns_records(
        &self,
        id: TestId,
        subdomain: &str,
        record_type: Option<RecordType>,
    ) -> Result<Vec<DnsRecordOverride>, Error> {
        Ok(self
            .test(id)?
            .dns_records
            .iter()
            .filter(|record| record.subdomain == subdomain)
            .filter(|record| record_type.map_or(true, |t| record.data.record_type() == t))
            .cloned()
            .collect())
    }

    async fn all_dns_records(&self, id: TestId) -> Result<Vec<DnsRecordOverride>, Error> {
        Ok(self.test(id)?.dns_records.clone())
    }

    async fn add_http_file(&mut self, id: TestId, file: HttpFile) -> Result<(), Error> {
        let state = self.test_mut(id)?;
        let duplicate = state.http_files.iter().any(|existing| {
            existing.scheme == file.scheme
                && existing.subdomain == file.subdomain
                && existing.path == file.path
        });
        if duplicate {
            return Err(Error::DuplicateFile);
        }
        state.http_files.push(file);
        Ok(())
    }

    async fn http_files(&self, id: TestId) -> Result<Vec<HttpFile>, Error> {
        Ok(self.test(id)?.http_files.clone())
    }

    async fn http_file_content(
        &self,
        id: TestId,
        scheme: Scheme,
        subdomain: &str,
        path: &str,
    ) -> Result<Option<String>, Error> {
        Ok(self
            .test(id)?
            .http_files
            .iter()
            .find(|file| {
                file.scheme == scheme && file.subdomain == subdomain && file.path == path
            })
            .map(|file| file.content.clone()))
    }

    async fn record_dns_request(&mut self, request: CapturedDnsRequest) -> Result<(), Error> {
        self.test_mut(request.test_id)?.dns_requests.push(request);
        Ok(())
    }

    async fn record_http_request(&mut self, request: CapturedHttpRequest) -> Result<(), Error> {
        self.test_mut(request.test_id)?.http_requests.push(request);
        Ok(())
    }

    async fn record_smtp_request(&mut self, request: CapturedSmtpRequest) -> Result<(), Error> {
        self.test_mut(request.test_id)?.smtp_requests.push(request);
        Ok(())
    }

    async fn dns_requests(&self, id: TestId) -> Result<Vec<CapturedDnsRequest>, Error> {
        Ok(self.test(id)?.dns_requests.clone())
    }

    async fn http_requests(&self, id: TestId) -> Result<Vec<CapturedHttpRequest>, Error> {
        Ok(self.test(id)?.http_requests.clone())
    }

    async fn smtp_requests(&self, id: TestId) -> Result<Vec<CapturedSmtpRequest>, Error> {
        Ok(self.test(id)?.smtp_requests.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CaaTag, DnsRecordData};
    use time::Duration;

    fn file(scheme: Scheme, subdomain: &str, path: &str) -> HttpFile {
        HttpFile {
            scheme,
            subdomain: subdomain.to_string(),
            path: path.to_string(),
            content: "token".to_string(),
        }
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_monotonic() {
        let mut store = InMemoryStore::default();
        let id = TestId::generate().unwrap();
        store.start_test(id).await.unwrap();
        assert!(store.is_running_test(id).await.unwrap());

        store.stop_test(id).await.unwrap();
        let stopped_at = store.test_session(id).await.unwrap().unwrap().stopped_at;
        assert!(stopped_at.is_some());
        assert!(!store.is_running_test(id).await.unwrap());

        store.stop_test(id).await.unwrap();
        let second = store.test_session(id).await.unwrap().unwrap().stopped_at;
        assert_eq!(stopped_at, second);
    }

    #[tokio::test]
    async fn unknown_tests_are_not_running() {
        let store = InMemoryStore::default();
        let id = TestId::generate().unwrap();
        assert!(!store.is_running_test(id).await.unwrap());
        assert!(store.test_session(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_http_files_conflict() {
        let mut store = InMemoryStore::default();
        let id = TestId::generate().unwrap();
        store.start_test(id).await.unwrap();

        let path = "/.well-known/acme-challenge/token";
        store
            .add_http_file(id, file(Scheme::Https, "www", path))
            .await
            .unwrap();
        assert!(matches!(
            store.add_http_file(id, file(Scheme::Https, "www", path)).await,
            Err(Error::DuplicateFile)
        ));
        // Same path under a different scheme or subdomain is a new key.
        store
            .add_http_file(id, file(Scheme::Http, "www", path))
            .await
            .unwrap();
        store
            .add_http_file(id, file(Scheme::Https, "", path))
            .await
            .unwrap();

        assert_eq!(
            store
                .http_file_content(id, Scheme::Https, "www", path)
                .await
                .unwrap()
                .as_deref(),
            Some("token")
        );
        assert_eq!(
            store
                .http_file_content(id, Scheme::Https, "www", "/other")
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn dns_records_filter_by_subdomain_and_type() {
        let mut store = InMemoryStore::default();
        let id = TestId::generate().unwrap();
        store.start_test(id).await.unwrap();

        let txt = DnsRecordOverride {
            subdomain: "_acme-challenge".to_string(),
            data: DnsRecordData::Txt {
                txt: "challenge-value".to_string(),
            },
        };
        let caa = DnsRecordOverride {
            subdomain: String::new(),
            data: DnsRecordData::Caa {
                critical: false,
                tag: CaaTag::Issue,
                value: "ca.example.net".to_string(),
            },
        };
        store.add_dns_record(id, txt.clone()).await.unwrap();
        store.add_dns_record(id, caa.clone()).await.unwrap();

        assert_eq!(
            store
                .dns_records(id, "_acme-challenge", Some(RecordType::TXT))
                .await
                .unwrap(),
            vec![txt.clone()]
        );
        assert_eq!(
            store
                .dns_records(id, "_acme-challenge", Some(RecordType::CAA))
                .await
                .unwrap(),
            vec![]
        );
        assert_eq!(store.dns_records(id, "", None).await.unwrap(), vec![caa]);
    }

    #[tokio::test]
    async fn stale_tests_are_stopped_once() {
        let mut store = InMemoryStore::default();
        let old = TestId::generate().unwrap();
        let fresh = TestId::generate().unwrap();
        store.start_test(old).await.unwrap();
        store.start_test(fresh).await.unwrap();
        // Backdate one session past the cutoff.
        store.tests.get_mut(&old).unwrap().session.started_at -= Duration::hours(7);

        let cutoff = OffsetDateTime::now_utc() - Duration::hours(6);
        assert_eq!(store.stop_stale_tests(cutoff).await.unwrap(), 1);
        assert!(!store.is_running_test(old).await.unwrap());
        assert!(store.is_running_test(fresh).await.unwrap());
        assert_eq!(store.stop_stale_tests(cutoff).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn evidence_for_unknown_tests_is_rejected() {
        let mut store = InMemoryStore::default();
        let id = TestId::generate().unwrap();
        let result = store
            .record_http_request(CapturedHttpRequest {
                test_id: id,
                received_at: OffsetDateTime::now_utc(),
                remote_addr: "192.0.2.1:9999".parse().unwrap(),
                host: "example.com".to_string(),
                method: "GET".to_string(),
                url: "/".to_string(),
                version: "HTTP/1.1".to_string(),
                headers: Default::default(),
                https: false,
            })
            .await;
        assert!(matches!(result, Err(Error::TestNotFound(_))));
    }
}
