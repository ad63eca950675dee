//! IP attribution.
//!
//! Annotates captured evidence with the origin of a probe: the autonomous
//! system(s) announcing the most specific BGP prefix covering the source
//! address, and whether the address belongs to a known delegated third
//! party (currently Google Public DNS, whose resolvers issue DNS lookups on
//! behalf of validating CAs).
//!
//! The three datasets — prefix tables, AS-name table, resolver ranges —
//! are refreshed independently from external feeds by the tasks in
//! [`feeds`]. Each dataset sits behind its own lock holding an `Arc`;
//! lookups clone the `Arc` under the lock and search off-lock, refreshers
//! build a complete replacement off-lock and swap it in, so readers never
//! observe a partially rebuilt structure and a failed refresh never
//! disturbs the last good data. Attribution is consulted out-of-band by
//! the operator API, never on the capture hot path.

use ipnetwork::IpNetwork;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::RwLock;

pub mod feeds;
mod trie;

pub use trie::{CidrSet, PrefixTrie};

/// The v4/v6 pair of prefix-to-ASN tables, rebuilt wholesale per refresh.
#[derive(Debug, Default)]
pub struct PrefixTables {
    v4: PrefixTrie<Vec<u32>>,
    v6: PrefixTrie<Vec<u32>>,
}

impl PrefixTables {
    pub fn add(&mut self, prefix: IpNetwork, asn: u32) {
        let slot = match prefix {
            IpNetwork::V4(p) => self.v4.entry(trie::v4_key(p.network()), p.prefix()),
            IpNetwork::V6(p) => self.v6.entry(trie::v6_key(p.network()), p.prefix()),
        };
        slot.get_or_insert_with(Vec::new).push(asn);
    }

    /// ASNs announcing the most specific prefix covering `addr`. More than
    /// one for multi-origin prefixes.
    #[must_use]
    pub fn origins(&self, addr: IpAddr) -> &[u32] {
        let found = match addr {
            IpAddr::V4(addr) => self.v4.lookup(trie::v4_key(addr)),
            IpAddr::V6(addr) => self.v6.lookup(trie::v6_key(addr)),
        };
        found.map_or(&[], Vec::as_slice)
    }
}

/// One autonomous system, as shown to the operator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AutonomousSystem {
    pub number: u32,
    pub name: Option<String>,
}

impl fmt::Display for AutonomousSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AS{}", self.number)?;
        if let Some(name) = &self.name {
            write!(f, " ({name})")?;
        }
        Ok(())
    }
}

/// An infrastructure operator that issues DCV-relevant requests on behalf
/// of another party, identified by CIDR membership.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct DelegatedThirdParty {
    pub name: &'static str,
    pub info_url: &'static str,
}

pub const GOOGLE_PUBLIC_DNS: DelegatedThirdParty = DelegatedThirdParty {
    name: "Google Public DNS",
    info_url: "https://developers.google.com/speed/public-dns/faq#locations",
};

/// Shared attribution state. Empty until the first successful refresh of
/// each dataset; lookups against empty data return empty results.
#[derive(Default)]
pub struct Attribution {
    prefixes: RwLock<Arc<PrefixTables>>,
    as_names: RwLock<Arc<HashMap<u32, String>>>,
    resolver_ranges: RwLock<Arc<CidrSet>>,
}

impl Attribution {
    #[must_use]
    pub fn new() -> Self {
        Attribution::default()
    }

    pub async fn autonomous_systems(&self, addr: IpAddr) -> Vec<AutonomousSystem> {
        let tables = self.prefixes.read().await.clone();
        let names = self.as_names.read().await.clone();
        tables
            .origins(addr)
            .iter()
            .map(|&number| AutonomousSystem {
                number,
                name: names.get(&number).cloned(),
            })
            .collect()
    }

    pub async fn delegated_third_party(&self, addr: IpAddr) -> Option<DelegatedThirdParty> {
        let ranges = self.resolver_ranges.read().await.clone();
        ranges.contains(addr).then_some(GOOGLE_PUBLIC_DNS)
    }

    pub async fn install_prefixes(&self, tables: PrefixTables) {
        *self.prefixes.write().await = Arc::new(tables);
    }

    pub async fn install_as_names(&self, names: HashMap<u32, String>) {
        *self.as_names.write().await = Arc::new(names);
    }

    pub async fn install_resolver_ranges(&self, ranges: CidrSet) {
        *self.resolver_ranges.write().await = Arc::new(ranges);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn longest_prefix_determines_the_origin() {
        let attribution = Attribution::new();
        let mut tables = PrefixTables::default();
        tables.add("10.0.0.0/8".parse().unwrap(), 1);
        tables.add("10.1.0.0/16".parse().unwrap(), 2);
        attribution.install_prefixes(tables).await;
        attribution
            .install_as_names(HashMap::from([(2, "More Specific Net".to_string())]))
            .await;

        assert_eq!(
            attribution.autonomous_systems(addr("10.1.2.3")).await,
            vec![AutonomousSystem {
                number: 2,
                name: Some("More Specific Net".to_string()),
            }]
        );
        assert_eq!(
            attribution.autonomous_systems(addr("10.2.0.0")).await,
            vec![AutonomousSystem {
                number: 1,
                name: None,
            }]
        );
        assert!(attribution
            .autonomous_systems(addr("192.0.2.1"))
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn multi_origin_prefixes_keep_every_asn() {
        let attribution = Attribution::new();
        let mut tables = PrefixTables::default();
        tables.add("198.51.100.0/24".parse().unwrap(), 64496);
        tables.add("198.51.100.0/24".parse().unwrap(), 64497);
        attribution.install_prefixes(tables).await;

        let found = attribution.autonomous_systems(addr("198.51.100.7")).await;
        assert_eq!(
            found.iter().map(|a| a.number).collect::<Vec<_>>(),
            vec![64496, 64497]
        );
    }

    #[tokio::test]
    async fn lookups_are_empty_before_the_first_refresh() {
        let attribution = Attribution::new();
        assert!(attribution
            .autonomous_systems(addr("8.8.8.8"))
            .await
            .is_empty());
        assert_eq!(attribution.delegated_third_party(addr("8.8.8.8")).await, None);
    }

    #[tokio::test]
    async fn delegated_third_party_by_membership() {
        let attribution = Attribution::new();
        let mut ranges = CidrSet::default();
        ranges.add("8.8.8.0/24".parse().unwrap());
        attribution.install_resolver_ranges(ranges).await;

        assert_eq!(
            attribution.delegated_third_party(addr("8.8.8.8")).await,
            Some(GOOGLE_PUBLIC_DNS)
        );
        assert_eq!(
            attribution.delegated_third_party(addr("9.9.9.9")).await,
            None
        );
    }

    #[test]
    fn autonomous_system_display() {
        let with_name = AutonomousSystem {
            number: 64496,
            name: Some("Example Net".to_string()),
        };
        assert_eq!(with_name.to_string(), "AS64496 (Example Net)");
        let bare = AutonomousSystem {
            number: 64496,
            name: None,
        };
        assert_eq!(bare.to_string(), "AS64496");
    }
}
