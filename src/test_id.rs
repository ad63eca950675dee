//! Test identifiers and the hostname/mail-address forms that embed them.
//!
//! Every capture session is named by a 128-bit identifier rendered as 32
//! lowercase hex characters. Probes reach a test through hostnames of the
//! form `[<subdomain>.]<testid>.test.<domain>` and mail addresses whose
//! domain part follows the same rule. The parsers here are shared by the
//! DNS, HTTP and SMTP responders; they are pure, case-insensitive, tolerate
//! a trailing dot, and reject malformed input instead of panicking.

use crate::error::Error;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A 128-bit test identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TestId([u8; 16]);

impl TestId {
    /// Generate a fresh identifier from the OS random source.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Random`] if the random source can't be read. No
    /// uniqueness check is performed; 128 random bits are unique with
    /// overwhelming probability.
    pub fn generate() -> Result<Self, Error> {
        let mut bytes = [0_u8; 16];
        OsRng.try_fill_bytes(&mut bytes)?;
        Ok(TestId(bytes))
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TestId({self})")
    }
}

impl FromStr for TestId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !s.is_ascii() || s.len() != 32 {
            return Err(Error::InvalidTestId(s.to_string()));
        }
        let mut bytes = [0_u8; 16];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[2 * i..2 * i + 2], 16)
                .map_err(|_| Error::InvalidTestId(s.to_string()))?;
        }
        Ok(TestId(bytes))
    }
}

impl Serialize for TestId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TestId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(|_| {
            D::Error::custom(format!("\"{s}\" is not a valid test identifier"))
        })
    }
}

/// Decode a hostname of the form `[<subdomain>.]<testid>.test.<domain>`.
///
/// Returns the embedded identifier and the (possibly empty) subdomain, or
/// `None` when the name doesn't end in `.test.<domain>` or the label before
/// that suffix isn't a test identifier.
#[must_use]
pub fn parse_hostname(hostname: &str, domain: &str) -> Option<(TestId, String)> {
    let hostname = hostname.strip_suffix('.').unwrap_or(hostname);
    let hostname = hostname.to_ascii_lowercase();
    let suffix = format!(".test.{}", domain.to_ascii_lowercase());
    let prefix = hostname.strip_suffix(&suffix)?;
    let (subdomain, label) = match prefix.rsplit_once('.') {
        Some((subdomain, label)) => (subdomain, label),
        None => ("", prefix),
    };
    let id = label.parse().ok()?;
    Some((id, subdomain.to_string()))
}

/// Decode the domain part of a mail address (the text after the last `@`)
/// via the hostname rule. Mail domains aren't subdomain-scoped, so any
/// leading labels are accepted and ignored.
#[must_use]
pub fn parse_mail_address(addr: &str, domain: &str) -> Option<TestId> {
    let (_, host) = addr.rsplit_once('@')?;
    parse_hostname(host, domain).map(|(id, _)| id)
}

/// The hostname a probe would use to reach `id` under `domain`; inverse of
/// [`parse_hostname`] for well-formed input.
#[must_use]
pub fn test_hostname(id: TestId, subdomain: &str, domain: &str) -> String {
    if subdomain.is_empty() {
        format!("{id}.test.{domain}")
    } else {
        format!("{subdomain}.{id}.test.{domain}")
    }
}
