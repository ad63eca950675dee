//! SMTP capture responder.
//!
//! Accepts mail only for recipients whose domain decodes to a test
//! (`<anything>@[<labels>.]<testid>.test.<domain>`); every other recipient
//! is refused with a permanent relay-denied error, which is what keeps this
//! from being an open relay. One message may name several tests; after
//! `DATA`, evidence (envelope, full recipient list, raw body, HELO name,
//! STARTTLS flag) is recorded once per distinct test that is still running.
//!
//! The engine speaks just enough ESMTP for the traffic CA validation
//! senders produce: EHLO/HELO, opportunistic STARTTLS with an on-demand
//! self-signed identity, MAIL/RCPT/DATA with a 20-recipient and 1 MiB cap,
//! RSET, NOOP, QUIT. Authentication is never offered.

pub mod server;
mod session;

pub use server::serve;
pub use session::Session;
