use crate::config::SharedConfig;
use crate::error::Error;
use crate::store::{CapturedDnsRequest, DynStore};
use crate::test_id::{self, TestId};
use std::net::SocketAddr;
use time::OffsetDateTime;
use tracing::error;
use trust_dns_proto::rr::rdata::{MX, SOA};
use trust_dns_proto::serialize::binary::BinEncodable;
use trust_dns_server::authority::MessageResponseBuilder;
use trust_dns_server::client::op::{Header, Message, MessageType, OpCode, Query, ResponseCode};
use trust_dns_server::client::rr::{DNSClass, LowerName, Name, RData, Record, RecordType};
use trust_dns_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};

const APEX_TTL: u32 = 86_400;
const ADDRESS_TTL: u32 = 3_600;
const MX_PREFERENCE: u16 = 10;
const OVERRIDE_TTL: u32 = 15;
// Negative-caching TTL; deliberately short so record changes made while a
// test is being set up take effect quickly.
const SOA_MINIMUM_TTL: u32 = 15;

#[derive(Clone)]
pub struct Handler {
    config: SharedConfig,
    store: DynStore,
    /// `test.<domain>.`
    zone: LowerName,
    zone_name: Name,
    /// `<domain>.` — the NS/MX target and SOA primary.
    root_name: Name,
    hostmaster: Name,
}

/// What the handler decided for a query. The response code is chosen here,
/// explicitly; it is never derived from whether the answer set happens to
/// be empty.
#[derive(Debug, PartialEq, Eq)]
enum QueryOutcome {
    Refused,
    Zone(ZoneAnswer),
}

#[derive(Debug, PartialEq, Eq)]
struct ZoneAnswer {
    code: AnswerCode,
    answers: Vec<Record>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AnswerCode {
    /// The name matched something we serve (even if no records apply).
    NoError,
    /// Nothing is known under this name.
    NxDomain,
}

impl ZoneAnswer {
    fn nxdomain() -> Self {
        ZoneAnswer {
            code: AnswerCode::NxDomain,
            answers: Vec::new(),
        }
    }
}

impl Handler {
    pub fn new(config: SharedConfig, store: DynStore) -> Result<Self, Error> {
        let zone_name = Name::from_ascii(format!("{}.", config.test_zone()))?;
        let root_name = Name::from_ascii(format!("{}.", config.domain))?;
        let hostmaster = Name::from_ascii(format!("hostmaster.{}.", config.domain))?;
        Ok(Handler {
            zone: LowerName::from(&zone_name),
            zone_name,
            root_name,
            hostmaster,
            config,
            store,
        })
    }

    async fn dispatch_request<R: ResponseHandler>(
        &self,
        request: &Request,
        response: R,
    ) -> Result<ResponseInfo, Error> {
        if request.op_code() != OpCode::Query || request.message_type() != MessageType::Query {
            return self.send_refused(request, response).await;
        }

        let raw_query = repack_query(request).unwrap_or_default();
        let outcome = self
            .answer_query(
                request.src(),
                request.query().name(),
                request.query().query_type(),
                request.query().query_class(),
                &raw_query,
            )
            .await;

        match outcome {
            QueryOutcome::Refused => self.send_refused(request, response).await,
            QueryOutcome::Zone(answer) => self.send_zone_answer(request, response, answer).await,
        }
    }

    /// Decide how to answer one query, recording evidence as a side effect
    /// when the query names a running test. Storage failures are logged and
    /// never change the answer.
    async fn answer_query(
        &self,
        src: SocketAddr,
        query_name: &LowerName,
        qtype: RecordType,
        qclass: DNSClass,
        raw_query: &[u8],
    ) -> QueryOutcome {
        if qclass != DNSClass::IN
            || matches!(qtype, RecordType::AXFR | RecordType::IXFR)
            || !self.zone.zone_of(query_name)
        {
            return QueryOutcome::Refused;
        }

        if *query_name == self.zone {
            return QueryOutcome::Zone(self.apex_answer(qtype));
        }

        // LowerName renders lowercased with a trailing dot, which is
        // exactly the form the codec expects.
        let fqdn = query_name.to_string();
        let Some((id, subdomain)) = test_id::parse_hostname(&fqdn, &self.config.domain) else {
            return QueryOutcome::Zone(ZoneAnswer::nxdomain());
        };

        let owner = Name::from(query_name);
        // Labels reserved for validation (e.g. `_acme-challenge`) never get
        // address or MX answers; only provisioned records can match them.
        let underscore = fqdn.starts_with('_');
        let mut matched = !underscore;
        let mut answers = Vec::new();

        if !underscore {
            if matches!(qtype, RecordType::A | RecordType::ANY) {
                for addr in &self.config.v4_addrs {
                    answers.push(Record::from_rdata(owner.clone(), ADDRESS_TTL, RData::A(*addr)));
                }
            }
            if matches!(qtype, RecordType::AAAA | RecordType::ANY) {
                for addr in &self.config.v6_addrs {
                    answers.push(Record::from_rdata(
                        owner.clone(),
                        ADDRESS_TTL,
                        RData::AAAA(*addr),
                    ));
                }
            }
            if matches!(qtype, RecordType::MX | RecordType::ANY) {
                answers.push(Record::from_rdata(
                    owner.clone(),
                    APEX_TTL,
                    RData::MX(MX::new(MX_PREFERENCE, self.root_name.clone())),
                ));
            }
        }

        if self.is_running(id).await {
            let qtype_filter = (qtype != RecordType::ANY).then_some(qtype);
            match self
                .store
                .read()
                .await
                .dns_records(id, &subdomain, qtype_filter)
                .await
            {
                Ok(records) => {
                    for record in records {
                        match record.data.to_rdata() {
                            Ok(rdata) => {
                                matched = true;
                                answers.push(Record::from_rdata(
                                    owner.clone(),
                                    OVERRIDE_TTL,
                                    rdata,
                                ));
                            }
                            Err(err) => error!("stored DNS record for {id} is unusable: {err}"),
                        }
                    }
                }
                Err(err) => error!("error looking up DNS records for {id}: {err}"),
            }

            let captured = CapturedDnsRequest {
                test_id: id,
                received_at: OffsetDateTime::now_utc(),
                remote_addr: src,
                fqdn: fqdn.clone(),
                qtype,
                message: raw_query.to_vec(),
            };
            if let Err(err) = self.store.write().await.record_dns_request(captured).await {
                error!("error recording DNS request for {id}: {err}");
            }
        }

        QueryOutcome::Zone(ZoneAnswer {
            code: if matched {
                AnswerCode::NoError
            } else {
                AnswerCode::NxDomain
            },
            answers,
        })
    }

    fn apex_answer(&self, qtype: RecordType) -> ZoneAnswer {
        let mut answers = Vec::new();
        if matches!(qtype, RecordType::NS | RecordType::ANY) {
            answers.push(Record::from_rdata(
                self.zone_name.clone(),
                APEX_TTL,
                RData::NS(self.root_name.clone()),
            ));
        }
        if matches!(qtype, RecordType::SOA | RecordType::ANY) {
            answers.push(self.soa_record());
        }
        ZoneAnswer {
            code: AnswerCode::NoError,
            answers,
        }
    }

    fn soa_record(&self) -> Record {
        Record::from_rdata(
            self.zone_name.clone(),
            APEX_TTL,
            RData::SOA(SOA::new(
                self.root_name.clone(),
                self.hostmaster.clone(),
                1,
                86_400,
                86_400,
                86_400,
                SOA_MINIMUM_TTL,
            )),
        )
    }

    async fn is_running(&self, id: TestId) -> bool {
        match self.store.read().await.is_running_test(id).await {
            Ok(running) => running,
            Err(err) => {
                error!("error checking if {id} is a running test: {err}");
                false
            }
        }
    }

    async fn send_zone_answer<R: ResponseHandler>(
        &self,
        request: &Request,
        mut response_handle: R,
        answer: ZoneAnswer,
    ) -> Result<ResponseInfo, Error> {
        let mut header = Header::response_from_request(request.header());
        header.set_authoritative(true);
        let mut authority = Vec::new();
        if answer.answers.is_empty() {
            if answer.code == AnswerCode::NxDomain {
                header.set_response_code(ResponseCode::NXDomain);
            }
            authority.push(self.soa_record());
        }
        let builder = MessageResponseBuilder::from_message_request(request);
        let response = builder.build(header, answer.answers.iter(), &[], authority.iter(), &[]);
        Ok(response_handle.send_response(response).await?)
    }

    async fn send_refused<R: ResponseHandler>(
        &self,
        request: &Request,
        mut response_handle: R,
    ) -> Result<ResponseInfo, Error> {
        let response = MessageResponseBuilder::from_message_request(request);
        Ok(response_handle
            .send_response(response.error_msg(request.header(), ResponseCode::Refused))
            .await?)
    }
}

/// Rebuild the query in wire format for the evidence row. trust-dns doesn't
/// hand the handler the original datagram, so the message is re-packed from
/// the parsed header and question.
fn repack_query(request: &Request) -> Result<Vec<u8>, trust_dns_proto::error::ProtoError> {
    let mut message = Message::new();
    message
        .set_id(request.header().id())
        .set_message_type(MessageType::Query)
        .set_op_code(request.header().op_code())
        .set_recursion_desired(request.header().recursion_desired());
    let mut query = Query::query(
        Name::from(request.query().name()),
        request.query().query_type(),
    );
    query.set_query_class(request.query().query_class());
    message.add_query(query);
    message.to_bytes()
}

#[async_trait::async_trait]
impl RequestHandler for Handler {
    async fn handle_request<R: ResponseHandler>(
        &self,
        request: &Request,
        response_handle: R,
    ) -> ResponseInfo {
        match self.dispatch_request(request, response_handle).await {
            Ok(info) => info,
            Err(err) => {
                error!("error in RequestHandler: {err:?}");
                let mut header = Header::new();
                header.set_response_code(ResponseCode::ServFail);
                header.into()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_support;
    use crate::store::{CaaTag, DnsRecordData, DnsRecordOverride, InMemoryStore, Store};
    use std::sync::Arc;
    use tokio::sync::RwLock;

    const SRC: &str = "198.51.100.7:53000";

    fn handler() -> (Handler, DynStore) {
        let store: DynStore = Arc::new(RwLock::new(InMemoryStore::default()));
        let handler = Handler::new(test_support::config(), store.clone()).unwrap();
        (handler, store)
    }

    fn lower(name: &str) -> LowerName {
        LowerName::from(Name::from_ascii(name).unwrap())
    }

    async fn answer(handler: &Handler, name: &str, qtype: RecordType) -> QueryOutcome {
        handler
            .answer_query(SRC.parse().unwrap(), &lower(name), qtype, DNSClass::IN, b"q")
            .await
    }

    fn zone(outcome: QueryOutcome) -> ZoneAnswer {
        match outcome {
            QueryOutcome::Zone(answer) => answer,
            QueryOutcome::Refused => panic!("query was refused"),
        }
    }

    async fn start_test(store: &DynStore) -> TestId {
        let id = TestId::generate().unwrap();
        store.write().await.start_test(id).await.unwrap();
        id
    }

    #[tokio::test]
    async fn refuses_foreign_names_classes_and_transfers() {
        let (handler, _) = handler();
        assert_eq!(
            answer(&handler, "example.org.", RecordType::A).await,
            QueryOutcome::Refused
        );
        assert_eq!(
            answer(&handler, "example.com.", RecordType::A).await,
            QueryOutcome::Refused
        );
        assert_eq!(
            answer(&handler, "test.example.com.", RecordType::AXFR).await,
            QueryOutcome::Refused
        );
        assert_eq!(
            handler
                .answer_query(
                    SRC.parse().unwrap(),
                    &lower("test.example.com."),
                    RecordType::SOA,
                    DNSClass::CH,
                    b"q",
                )
                .await,
            QueryOutcome::Refused
        );
    }

    #[tokio::test]
    async fn apex_soa_is_a_single_record() {
        let (handler, _) = handler();
        let answer = zone(answer(&handler, "test.example.com.", RecordType::SOA).await);
        assert_eq!(answer.code, AnswerCode::NoError);
        assert_eq!(answer.answers.len(), 1);
        match answer.answers[0].data() {
            Some(RData::SOA(soa)) => {
                assert_eq!(soa.serial(), 1);
                assert_eq!(soa.minimum(), SOA_MINIMUM_TTL);
            }
            other => panic!("expected SOA rdata, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn apex_any_returns_ns_and_soa() {
        let (handler, _) = handler();
        let answer = zone(answer(&handler, "test.example.com.", RecordType::ANY).await);
        let types: Vec<_> = answer.answers.iter().map(Record::record_type).collect();
        assert_eq!(types, vec![RecordType::NS, RecordType::SOA]);
    }

    #[tokio::test]
    async fn unknown_names_in_zone_are_nxdomain() {
        let (handler, _) = handler();
        let answer = zone(answer(&handler, "not-a-test.test.example.com.", RecordType::A).await);
        assert_eq!(answer.code, AnswerCode::NxDomain);
        assert!(answer.answers.is_empty());
    }

    #[tokio::test]
    async fn test_names_answer_the_address_pool_even_when_stopped() {
        let (handler, store) = handler();
        let id = start_test(&store).await;
        store.write().await.stop_test(id).await.unwrap();

        let name = format!("{id}.test.example.com.");
        let answer = zone(answer(&handler, &name, RecordType::A).await);
        assert_eq!(answer.code, AnswerCode::NoError);
        assert_eq!(answer.answers.len(), 1);
        assert_eq!(answer.answers[0].record_type(), RecordType::A);
        assert_eq!(answer.answers[0].ttl(), ADDRESS_TTL);
        // No evidence for a stopped test.
        assert!(store.read().await.dns_requests(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn any_queries_combine_addresses_and_mx() {
        let (handler, store) = handler();
        let id = start_test(&store).await;
        let name = format!("{id}.test.example.com.");
        let answer = zone(answer(&handler, &name, RecordType::ANY).await);
        let types: Vec<_> = answer.answers.iter().map(Record::record_type).collect();
        assert_eq!(types, vec![RecordType::A, RecordType::AAAA, RecordType::MX]);
    }

    #[tokio::test]
    async fn txt_queries_are_nodata_not_nxdomain() {
        let (handler, store) = handler();
        let id = start_test(&store).await;
        let name = format!("{id}.test.example.com.");
        let answer = zone(answer(&handler, &name, RecordType::TXT).await);
        assert_eq!(answer.code, AnswerCode::NoError);
        assert!(answer.answers.is_empty());
    }

    #[tokio::test]
    async fn underscore_labels_get_no_addresses_and_nxdomain_without_records() {
        let (handler, store) = handler();
        let id = start_test(&store).await;
        let name = format!("_acme-challenge.{id}.test.example.com.");
        let answer = zone(answer(&handler, &name, RecordType::A).await);
        assert_eq!(answer.code, AnswerCode::NxDomain);
        assert!(answer.answers.is_empty());
    }

    #[tokio::test]
    async fn provisioned_records_are_served_for_running_tests() {
        let (handler, store) = handler();
        let id = start_test(&store).await;
        store
            .write()
            .await
            .add_dns_record(
                id,
                DnsRecordOverride {
                    subdomain: "_acme-challenge".to_string(),
                    data: DnsRecordData::Txt {
                        txt: "challenge-token".to_string(),
                    },
                },
            )
            .await
            .unwrap();

        let name = format!("_acme-challenge.{id}.test.example.com.");
        let answer = zone(answer(&handler, &name, RecordType::TXT).await);
        assert_eq!(answer.code, AnswerCode::NoError);
        assert_eq!(answer.answers.len(), 1);
        assert_eq!(answer.answers[0].ttl(), OVERRIDE_TTL);
        assert_eq!(answer.answers[0].record_type(), RecordType::TXT);

        // The query was captured.
        let requests = store.read().await.dns_requests(id).await.unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].fqdn, name);
        assert_eq!(requests[0].qtype, RecordType::TXT);
        assert_eq!(requests[0].remote_addr, SRC.parse().unwrap());
    }

    #[tokio::test]
    async fn provisioned_records_respect_the_qtype_filter() {
        let (handler, store) = handler();
        let id = start_test(&store).await;
        store
            .write()
            .await
            .add_dns_record(
                id,
                DnsRecordOverride {
                    subdomain: String::new(),
                    data: DnsRecordData::Caa {
                        critical: false,
                        tag: CaaTag::Issue,
                        value: "ca.example.net".to_string(),
                    },
                },
            )
            .await
            .unwrap();

        let name = format!("{id}.test.example.com.");
        let caa = zone(answer(&handler, &name, RecordType::CAA).await);
        assert_eq!(caa.answers.len(), 1);
        assert_eq!(caa.answers[0].record_type(), RecordType::CAA);

        let txt = zone(answer(&handler, &name, RecordType::TXT).await);
        assert!(txt.answers.is_empty());
        assert_eq!(txt.code, AnswerCode::NoError);
    }

    #[tokio::test]
    async fn queries_for_stopped_tests_serve_no_overrides() {
        let (handler, store) = handler();
        let id = start_test(&store).await;
        store
            .write()
            .await
            .add_dns_record(
                id,
                DnsRecordOverride {
                    subdomain: String::new(),
                    data: DnsRecordData::Txt {
                        txt: "value".to_string(),
                    },
                },
            )
            .await
            .unwrap();
        store.write().await.stop_test(id).await.unwrap();

        let name = format!("{id}.test.example.com.");
        let answer = zone(answer(&handler, &name, RecordType::TXT).await);
        assert!(answer.answers.is_empty());
        assert!(store.read().await.dns_requests(id).await.unwrap().is_empty());
    }
}
