//! HTTP and HTTPS capture responder.
//!
//! A single router dispatches on the Host header: the root domain is
//! delegated to the operator API, hostnames that decode to a test are
//! captured, anything else is 404. Capture serves whatever file the
//! operator provisioned for (test, scheme, subdomain, path) — or an empty
//! 200 — and records the full request as evidence while the test runs.
//!
//! Both listeners run their own accept loop so every connection can carry
//! its remote address and scheme into the handler. The HTTPS listener
//! picks its certificate by SNI: the operator-provided identity for the
//! root domain, a freshly minted self-signed identity for test hostnames,
//! and a refused handshake for anything else.

mod handlers;
pub mod server;
mod tls;

pub use handlers::{router, AppState};
pub use server::{serve_http, serve_https, ConnMeta};
pub use tls::{https_server_config, CaptureCertResolver};
