//! Authoritative-style DNS responder for the test zone.
//!
//! Everything under `test.<domain>` is answered here; everything else is
//! REFUSED (as are non-INET classes and zone transfers). Behavior by name:
//!
//! * `test.<domain>` itself answers `NS` (pointing at the root domain) and
//!   a synthesized `SOA`.
//! * `[<subdomain>.]<testid>.test.<domain>` answers `A`/`AAAA` from the
//!   configured address pool and a single `MX` pointing at the root domain,
//!   unless the queried name starts with `_` (validation-only labels such
//!   as ACME challenge names get no address records). Operator-provisioned
//!   records for (test, subdomain, qtype) are appended at TTL 15, and —
//!   when the test is running — the query is captured verbatim as
//!   evidence.
//! * Anything else in the zone is authoritative NXDOMAIN.
//!
//! Negative and empty responses both carry the synthesized SOA in the
//! authority section; the difference between "name unknown" (NXDOMAIN) and
//! "name known, no data" (NOERROR) is chosen explicitly by the handler,
//! never inferred from an empty answer set.

mod handlers;
pub mod server;

pub use handlers::Handler;
pub use server::new;
