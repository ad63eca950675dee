use crate::error::Error;
use serde::Deserialize;
use serde_with::{serde_as, DurationSeconds};
use std::fs::File;
use std::io::BufReader;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub type SharedConfig = Arc<Config>;

/// Static configuration, loaded once at startup from a JSON file and passed
/// by [`SharedConfig`] into every component at construction.
#[serde_as]
#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    /// The operator's root domain. Tests live under `test.<domain>`, the
    /// dashboard is served for `Host: <domain>`, and mail is accepted for
    /// recipients under `*.test.<domain>`.
    pub domain: String,
    /// Addresses served as `A` records for every test hostname.
    #[serde(default)]
    pub v4_addrs: Vec<Ipv4Addr>,
    /// Addresses served as `AAAA` records for every test hostname.
    #[serde(default)]
    pub v6_addrs: Vec<Ipv6Addr>,
    pub http_bind_addr: SocketAddr,
    pub https_bind_addr: SocketAddr,
    pub smtp_bind_addr: SocketAddr,
    pub dns_udp_bind_addr: SocketAddr,
    pub dns_tcp_bind_addr: SocketAddr,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_dns_tcp_timeout")]
    pub dns_tcp_timeout: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_http_timeout")]
    pub http_timeout: Duration,
    /// PEM certificate chain and key for the root domain's HTTPS identity.
    /// When unset, root-domain TLS handshakes are refused; capture for test
    /// hostnames is unaffected (those use on-demand self-signed identities).
    pub https_cert_path: Option<String>,
    pub https_key_path: Option<String>,
    /// Tests still running after this long are stopped by housekeeping.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_test_max_age")]
    pub test_max_age: Duration,
    #[serde(default = "default_prefix_table_url")]
    pub prefix_table_url: String,
    #[serde(default = "default_as_names_url")]
    pub as_names_url: String,
    #[serde(default = "default_resolver_ranges_url")]
    pub resolver_ranges_url: String,
}

fn default_dns_tcp_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_test_max_age() -> Duration {
    Duration::from_secs(6 * 3600)
}

fn default_prefix_table_url() -> String {
    "https://bgp.tools/table.jsonl".to_string()
}

fn default_as_names_url() -> String {
    "https://bgp.tools/asns.csv".to_string()
}

fn default_resolver_ranges_url() -> String {
    "https://www.gstatic.com/ipranges/publicdns.json".to_string()
}

impl Config {
    pub fn try_from_file(p: impl AsRef<Path>) -> Result<Self, Error> {
        let f = File::open(p)?;
        let reader = BufReader::new(f);
        let conf: Config = serde_json::from_reader(reader)?;
        if conf.domain.is_empty() {
            return Err(Error::InvalidConfig("domain must not be empty".to_string()));
        }
        if conf.domain.ends_with('.') {
            return Err(Error::InvalidConfig(
                "domain must be written without a trailing dot".to_string(),
            ));
        }
        Ok(conf)
    }

    /// The DNS zone tests live under, without a trailing dot.
    #[must_use]
    pub fn test_zone(&self) -> String {
        format!("test.{}", self.domain)
    }

    #[must_use]
    pub fn is_root_domain(&self, host: &str) -> bool {
        let host = host.strip_suffix('.').unwrap_or(host);
        host.eq_ignore_ascii_case(&self.domain)
    }

    /// User-Agent sent to the attribution feeds.
    #[must_use]
    pub fn user_agent(&self) -> String {
        format!(
            "{}/{} running on {}",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            self.domain
        )
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::{Config, SharedConfig};
    use std::sync::Arc;
    use std::time::Duration;

    /// A config fixture for handler tests; nothing is actually bound.
    pub(crate) fn config() -> SharedConfig {
        Arc::new(Config {
            domain: "example.com".to_string(),
            v4_addrs: vec!["192.0.2.10".parse().unwrap()],
            v6_addrs: vec!["2001:db8::10".parse().unwrap()],
            http_bind_addr: "127.0.0.1:0".parse().unwrap(),
            https_bind_addr: "127.0.0.1:0".parse().unwrap(),
            smtp_bind_addr: "127.0.0.1:0".parse().unwrap(),
            dns_udp_bind_addr: "127.0.0.1:0".parse().unwrap(),
            dns_tcp_bind_addr: "127.0.0.1:0".parse().unwrap(),
            dns_tcp_timeout: Duration::from_secs(5),
            http_timeout: Duration::from_secs(15),
            https_cert_path: None,
            https_key_path: None,
            test_max_age: Duration::from_secs(6 * 3600),
            prefix_table_url: super::default_prefix_table_url(),
            as_names_url: super::default_as_names_url(),
            resolver_ranges_url: super::default_resolver_ranges_url(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn config_file(domain: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(
            f,
            r#"{{
                "domain": "{domain}",
                "http_bind_addr": "0.0.0.0:80",
                "https_bind_addr": "0.0.0.0:443",
                "smtp_bind_addr": "0.0.0.0:25",
                "dns_udp_bind_addr": "0.0.0.0:53",
                "dns_tcp_bind_addr": "0.0.0.0:53"
            }}"#
        )
        .unwrap();
        f
    }

    #[test]
    fn loads_a_minimal_config_with_defaults() {
        let f = config_file("example.com");
        let conf = Config::try_from_file(f.path()).unwrap();
        assert_eq!(conf.test_zone(), "test.example.com");
        assert_eq!(conf.dns_tcp_timeout, Duration::from_secs(5));
        assert_eq!(conf.test_max_age, Duration::from_secs(6 * 3600));
        assert!(conf.v4_addrs.is_empty());
        assert!(conf.prefix_table_url.starts_with("https://"));
    }

    #[test]
    fn rejects_a_trailing_dot_domain() {
        let f = config_file("example.com.");
        assert!(matches!(
            Config::try_from_file(f.path()),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn matches_root_domain_case_insensitively() {
        let conf = test_support::config();
        assert!(conf.is_root_domain("Example.COM"));
        assert!(conf.is_root_domain("example.com."));
        assert!(!conf.is_root_domain("test.example.com"));
    }
}
