//! dcvtrace
//!
//! A diagnostic harness for Domain Control Validation. Start a test, point
//! a certificate authority at hostnames or mail addresses that embed the
//! test's identifier, and inspect exactly what its DCV implementation does
//! over the wire: every DNS query, HTTP(S) request and SMTP message sent
//! to `*.test.<your-domain>` is captured verbatim and attributed to the
//! network it came from.
//!
//! The moving parts:
//!
//! * [`test_id`] — the identifier codec shared by all three protocols.
//! * [`dns`], [`web`], [`smtp`] — the capture responders.
//! * [`cert`] — on-demand self-signed TLS identities for test hostnames.
//! * [`attribution`] — longest-prefix ASN lookup and delegated-third-party
//!   detection, refreshed from external feeds.
//! * [`store`] — the session registry / evidence store boundary.
//! * [`api`] — the operator JSON surface, served on the root domain.
#![warn(clippy::pedantic)]

pub mod api;
pub mod attribution;
#[doc(hidden)]
pub mod banner;
pub mod cert;
pub mod config;
pub mod dns;
pub mod error;
pub mod smtp;
pub mod store;
pub mod test_id;
pub mod web;

pub use config::{Config, SharedConfig};
pub use error::Error;
pub use store::{DynStore, InMemoryStore};
pub use test_id::TestId;
