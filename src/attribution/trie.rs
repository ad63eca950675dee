//! Longest-prefix-match structures.
//!
//! A binary trie over a 128-bit key space backs both the prefix-to-ASN
//! tables and the CIDR membership sets. IPv4 prefixes occupy the top 32
//! bits of the key. Tries are built wholesale by the feed refreshers and
//! swapped in atomically; nothing ever mutates one in place after that.

use ipnetwork::IpNetwork;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// A binary longest-prefix-match trie. `insert` registers a value for a
/// prefix; `lookup` walks a full-length key and returns the value of the
/// deepest prefix that has one (the most specific match).
#[derive(Debug)]
pub struct PrefixTrie<T> {
    root: Node<T>,
}

#[derive(Debug)]
struct Node<T> {
    value: Option<T>,
    children: [Option<Box<Node<T>>>; 2],
}

impl<T> Node<T> {
    fn empty() -> Self {
        Node {
            value: None,
            children: [None, None],
        }
    }
}

impl<T> Default for PrefixTrie<T> {
    fn default() -> Self {
        PrefixTrie {
            root: Node::empty(),
        }
    }
}

impl<T> PrefixTrie<T> {
    /// The value slot for a prefix of `bits` leading bits of `key`,
    /// creating the path if needed. Host bits beyond the prefix length are
    /// ignored.
    pub fn entry(&mut self, key: u128, bits: u8) -> &mut Option<T> {
        let bits = bits.min(128);
        let mut node = &mut self.root;
        for i in 0..bits {
            let bit = usize::from((key >> (127 - i)) & 1 == 1);
            node = node.children[bit].get_or_insert_with(|| Box::new(Node::empty()));
        }
        &mut node.value
    }

    /// The value of the longest prefix containing `key`, if any.
    pub fn lookup(&self, key: u128) -> Option<&T> {
        let mut best = self.root.value.as_ref();
        let mut node = &self.root;
        for i in 0..128 {
            let bit = usize::from((key >> (127 - i)) & 1 == 1);
            match &node.children[bit] {
                Some(child) => node = child,
                None => break,
            }
            if let Some(value) = &node.value {
                best = Some(value);
            }
        }
        best
    }
}

#[must_use]
pub fn v4_key(addr: Ipv4Addr) -> u128 {
    u128::from(u32::from(addr)) << 96
}

#[must_use]
pub fn v6_key(addr: Ipv6Addr) -> u128 {
    u128::from(addr)
}

/// A set of CIDR ranges answering membership queries for single addresses.
#[derive(Debug, Default)]
pub struct CidrSet {
    v4: PrefixTrie<()>,
    v6: PrefixTrie<()>,
}

impl CidrSet {
    pub fn add(&mut self, prefix: IpNetwork) {
        match prefix {
            IpNetwork::V4(p) => {
                *self.v4.entry(v4_key(p.network()), p.prefix()) = Some(());
            }
            IpNetwork::V6(p) => {
                *self.v6.entry(v6_key(p.network()), p.prefix()) = Some(());
            }
        }
    }

    #[must_use]
    pub fn contains(&self, addr: IpAddr) -> bool {
        match addr {
            IpAddr::V4(addr) => self.v4.lookup(v4_key(addr)).is_some(),
            IpAddr::V6(addr) => self.v6.lookup(v6_key(addr)).is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn net(s: &str) -> IpNetwork {
        s.parse().unwrap()
    }

    #[test]
    fn most_specific_prefix_wins() {
        let mut trie = PrefixTrie::default();
        *trie.entry(v4_key(v4("10.0.0.0")), 8) = Some(1_u32);
        *trie.entry(v4_key(v4("10.1.0.0")), 16) = Some(2_u32);

        assert_eq!(trie.lookup(v4_key(v4("10.1.2.3"))), Some(&2));
        assert_eq!(trie.lookup(v4_key(v4("10.2.0.0"))), Some(&1));
        assert_eq!(trie.lookup(v4_key(v4("11.0.0.1"))), None);
    }

    #[test]
    fn host_bits_are_masked_on_insert() {
        let mut trie = PrefixTrie::default();
        // 10.1.2.3/16 registers the same prefix as 10.1.0.0/16.
        *trie.entry(v4_key(v4("10.1.2.3")), 16) = Some(7_u32);
        assert_eq!(trie.lookup(v4_key(v4("10.1.200.200"))), Some(&7));
    }

    #[test]
    fn zero_length_prefix_matches_everything() {
        let mut trie = PrefixTrie::default();
        *trie.entry(0, 0) = Some(42_u32);
        assert_eq!(trie.lookup(v4_key(v4("203.0.113.9"))), Some(&42));
    }

    #[test]
    fn cidr_set_membership() {
        let mut set = CidrSet::default();
        set.add(net("8.8.8.0/24"));
        set.add(net("2001:4860:4860::/48"));

        assert!(set.contains("8.8.8.8".parse().unwrap()));
        assert!(!set.contains("8.8.9.1".parse().unwrap()));
        assert!(set.contains("2001:4860:4860::8888".parse().unwrap()));
        assert!(!set.contains("2001:4860:4861::1".parse().unwrap()));
        // Address families never bleed into each other.
        assert!(!set.contains("::8.8.8.8".parse::<IpAddr>().unwrap()));
    }
}
