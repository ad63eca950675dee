//! Operator JSON API, served for the root domain.
//!
//! This is the control surface an operator (or the dashboard frontend)
//! drives a test with; probes never see it. Reached through the web
//! responder's Host dispatch — there is no separate port.
//!
//! # Endpoints
//!
//! ## `GET /healthcheck`
//!
//! Returns HTTP 200 (OK) and `{"ok":"healthy"}` when the service is
//! operational.
//!
//! ## `POST /test`
//!
//! Start a new test. Returns the generated identifier and the hostname
//! probes should be pointed at:
//!
//! ```json
//! { "test_id": "00112233445566778899aabbccddeeff",
//!   "test_domain": "00112233445566778899aabbccddeeff.test.example.com" }
//! ```
//!
//! ## `POST /test/:test_id/stop`
//!
//! Stop a running test. Idempotent; stopping a stopped test changes
//! nothing.
//!
//! ## `GET /test/:test_id`
//!
//! The full session report: provisioned records and files, plus every
//! captured DNS/HTTP/SMTP request, each annotated with the autonomous
//! systems announcing the source address and (for DNS) whether it came
//! from a known delegated third party such as a public resolver.
//!
//! ## `POST /test/:test_id/dns_record`
//!
//! Provision a record served at TTL 15 for the test, e.g.
//!
//! ```json
//! { "subdomain": "_acme-challenge", "type": "TXT", "txt": "token" }
//! { "subdomain": "", "type": "CAA", "tag": "issue", "value": "ca.example.net" }
//! ```
//!
//! ## `POST /test/:test_id/http_file`
//!
//! Provision validation file content, e.g.
//!
//! ```json
//! { "scheme": "https", "subdomain": "",
//!   "path": "/.well-known/acme-challenge/token", "content": "..." }
//! ```
//!
//! Paths must live under `/.well-known/pki-validation/` or
//! `/.well-known/acme-challenge/`, content is capped at 512 bytes, and a
//! duplicate (scheme, subdomain, path) is a conflict.

mod api_error;
mod model;
mod routes;

pub use routes::{router, AppState};
