//! External attribution feeds and their refresh tasks.
//!
//! Three feeds, three independent cadences: the BGP prefix table (JSONL),
//! the AS-name table (CSV) and the Google Public DNS resolver ranges
//! (JSON). Each refresher fetches and parses off-lock, installs the result
//! wholesale on success, and on failure logs, keeps serving the previous
//! dataset, and retries on a much shorter interval. A refresher failing
//! forever only means attribution stays stale; capture is never affected.

use crate::attribution::{Attribution, CidrSet, PrefixTables};
use crate::config::SharedConfig;
use crate::error::Error;
use ipnetwork::IpNetwork;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

const PREFIXES_REFRESH: Duration = Duration::from_secs(2 * 3600);
const PREFIXES_RETRY: Duration = Duration::from_secs(30 * 60);
const AS_NAMES_REFRESH: Duration = Duration::from_secs(24 * 3600);
const AS_NAMES_RETRY: Duration = Duration::from_secs(3600);
const RESOLVER_RANGES_REFRESH: Duration = Duration::from_secs(24 * 3600);
const RESOLVER_RANGES_RETRY: Duration = Duration::from_secs(3600);

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client for the attribution feeds.
pub struct FeedClient {
    config: SharedConfig,
    http: reqwest::Client,
}

impl FeedClient {
    pub fn new(config: SharedConfig) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent())
            .timeout(FETCH_TIMEOUT)
            .build()?;
        Ok(FeedClient { config, http })
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>, Error> {
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            return Err(Error::FeedStatus {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }

    pub async fn fetch_prefix_tables(&self) -> Result<PrefixTables, Error> {
        parse_prefix_table(&self.fetch(&self.config.prefix_table_url).await?)
    }

    pub async fn fetch_as_names(&self) -> Result<HashMap<u32, String>, Error> {
        parse_as_names(&self.fetch(&self.config.as_names_url).await?)
    }

    pub async fn fetch_resolver_ranges(&self) -> Result<CidrSet, Error> {
        parse_resolver_ranges(&self.fetch(&self.config.resolver_ranges_url).await?)
    }
}

#[derive(Deserialize)]
struct PrefixRecord {
    #[serde(rename = "CIDR")]
    cidr: IpNetwork,
    #[serde(rename = "ASN")]
    asn: u32,
}

/// Parse the newline-delimited JSON prefix-to-ASN table.
pub fn parse_prefix_table(data: &[u8]) -> Result<PrefixTables, Error> {
    let text = std::str::from_utf8(data)
        .map_err(|err| Error::FeedFormat(format!("prefix table is not UTF-8: {err}")))?;
    let mut tables = PrefixTables::default();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let record: PrefixRecord = serde_json::from_str(line)?;
        tables.add(record.cidr, record.asn);
    }
    Ok(tables)
}

/// Parse the CSV AS-number-to-name table (`asn,name,class`, numbers written
/// with an `AS` prefix).
pub fn parse_as_names(data: &[u8]) -> Result<HashMap<u32, String>, Error> {
    let mut reader = csv::Reader::from_reader(data);
    let mut names = HashMap::new();
    for record in reader.records() {
        let record = record?;
        let asn = record
            .get(0)
            .ok_or_else(|| Error::FeedFormat("AS name row is missing the ASN".to_string()))?;
        let asn: u32 = asn
            .trim_start_matches("AS")
            .parse()
            .map_err(|_| Error::FeedFormat(format!("bad ASN \"{asn}\"")))?;
        let name = record
            .get(1)
            .ok_or_else(|| Error::FeedFormat("AS name row is missing the name".to_string()))?;
        names.insert(asn, name.to_string());
    }
    Ok(names)
}

#[derive(Deserialize)]
struct ResolverRanges {
    prefixes: Vec<ResolverPrefix>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResolverPrefix {
    #[serde(default)]
    ipv4_prefix: Option<IpNetwork>,
    #[serde(default)]
    ipv6_prefix: Option<IpNetwork>,
}

/// Parse the delegated-third-party resolver range list.
pub fn parse_resolver_ranges(data: &[u8]) -> Result<CidrSet, Error> {
    let ranges: ResolverRanges = serde_json::from_slice(data)?;
    let mut set = CidrSet::default();
    for prefix in ranges.prefixes {
        if let Some(v4) = prefix.ipv4_prefix {
            set.add(v4);
        } else if let Some(v6) = prefix.ipv6_prefix {
            set.add(v6);
        }
    }
    Ok(set)
}

pub async fn refresh_prefixes_periodically(client: Arc<FeedClient>, attribution: Arc<Attribution>) {
    loop {
        match client.fetch_prefix_tables().await {
            Ok(tables) => {
                attribution.install_prefixes(tables).await;
                tracing::info!("refreshed BGP prefix tables");
                sleep(PREFIXES_REFRESH).await;
            }
            Err(err) => {
                tracing::warn!("refreshing BGP prefix tables failed: {err}");
                sleep(PREFIXES_RETRY).await;
            }
        }
    }
}

pub async fn refresh_as_names_periodically(client: Arc<FeedClient>, attribution: Arc<Attribution>) {
    loop {
        match client.fetch_as_names().await {
            Ok(names) => {
                attribution.install_as_names(names).await;
                tracing::info!("refreshed autonomous system names");
                sleep(AS_NAMES_REFRESH).await;
            }
            Err(err) => {
                tracing::warn!("refreshing autonomous system names failed: {err}");
                sleep(AS_NAMES_RETRY).await;
            }
        }
    }
}

pub async fn refresh_resolver_ranges_periodically(
    client: Arc<FeedClient>,
    attribution: Arc<Attribution>,
) {
    loop {
        match client.fetch_resolver_ranges().await {
            Ok(ranges) => {
                attribution.install_resolver_ranges(ranges).await;
                tracing::info!("refreshed delegated third party resolver ranges");
                sleep(RESOLVER_RANGES_REFRESH).await;
            }
            Err(err) => {
                tracing::warn!("refreshing delegated third party resolver ranges failed: {err}");
                sleep(RESOLVER_RANGES_RETRY).await;
            }
        }
    }
}
