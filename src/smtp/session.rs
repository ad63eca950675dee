use crate::config::SharedConfig;
use crate::error::Error;
use crate::store::{CapturedSmtpRequest, DynStore};
use crate::test_id::{self, TestId};
use std::net::SocketAddr;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::time::timeout;
use tracing::error;

pub(super) const MAX_RECIPIENTS: usize = 20;
pub(super) const MAX_MESSAGE_BYTES: usize = 1024 * 1024;
const MAX_LINE_BYTES: usize = 4096;
const READ_TIMEOUT: Duration = Duration::from_secs(5);
const WRITE_TIMEOUT: Duration = Duration::from_secs(15);

/// Per-connection facts shared by every transaction on it.
pub(super) struct ConnContext {
    pub config: SharedConfig,
    pub store: DynStore,
    pub remote_addr: SocketAddr,
}

/// The state one SMTP connection accumulates.
///
/// `helo` and the TLS flag describe the connection and survive between
/// transactions; the envelope sender, recipient list and accepted test
/// identifiers belong to the current mail transaction and are cleared by
/// [`Session::reset`] — which runs after every completed `DATA`, on `RSET`,
/// and on a fresh `EHLO`/`HELO`. STARTTLS discards the session entirely;
/// the TLS phase starts with a new one.
pub struct Session {
    helo: Option<String>,
    mail_from: Option<String>,
    rcpt_to: Vec<String>,
    test_ids: Vec<TestId>,
    starttls: bool,
}

impl Session {
    #[must_use]
    pub fn new(starttls: bool) -> Self {
        Session {
            helo: None,
            mail_from: None,
            rcpt_to: Vec::new(),
            test_ids: Vec::new(),
            starttls,
        }
    }

    /// Clear the current mail transaction. The HELO name and TLS state are
    /// connection properties and survive.
    pub fn reset(&mut self) {
        self.mail_from = None;
        self.rcpt_to.clear();
        self.test_ids.clear();
    }
}

pub(super) enum LoopExit {
    /// QUIT, EOF, timeout, or a protocol violation that closed the
    /// connection.
    Done,
    /// A `220` has been sent; the caller must now run the TLS handshake.
    StartTls,
}

/// Drive one command phase of a connection: the plaintext phase (with
/// STARTTLS on offer) or the post-handshake TLS phase.
pub(super) async fn run_command_loop<S>(
    io: &mut BufStream<S>,
    session: &mut Session,
    ctx: &ConnContext,
    starttls_available: bool,
) -> Result<LoopExit, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let Some(line) = next_line(io).await? else {
            return Ok(LoopExit::Done);
        };
        let (verb, args) = split_command(&line);
        match verb.as_str() {
            "EHLO" => {
                session.helo = Some(args.to_string());
                session.reset();
                reply_ehlo(io, ctx, starttls_available).await?;
            }
            "HELO" => {
                session.helo = Some(args.to_string());
                session.reset();
                reply(io, &format!("250 {}", ctx.config.domain)).await?;
            }
            "STARTTLS" => {
                if starttls_available {
                    reply(io, "220 2.0.0 ready to start TLS").await?;
                    return Ok(LoopExit::StartTls);
                }
                if session.starttls {
                    reply(io, "503 5.5.1 TLS already active").await?;
                } else {
                    reply(io, "502 5.5.1 command not implemented").await?;
                }
            }
            "MAIL" => handle_mail(io, session, args).await?,
            "RCPT" => handle_rcpt(io, session, ctx, args).await?,
            "DATA" => {
                if session.rcpt_to.is_empty() {
                    reply(io, "503 5.5.1 need RCPT before DATA").await?;
                    continue;
                }
                reply(io, "354 start mail input; end with <CRLF>.<CRLF>").await?;
                match read_message(io).await? {
                    MessageRead::Closed => return Ok(LoopExit::Done),
                    MessageRead::TooBig => {
                        session.reset();
                        reply(
                            io,
                            &format!("552 5.3.4 message exceeds the {MAX_MESSAGE_BYTES} byte limit"),
                        )
                        .await?;
                    }
                    MessageRead::Complete(data) => {
                        record_message(ctx, session, &data).await;
                        session.reset();
                        reply(io, "250 2.0.0 OK").await?;
                    }
                }
            }
            "RSET" => {
                session.reset();
                reply(io, "250 2.0.0 OK").await?;
            }
            "NOOP" => reply(io, "250 2.0.0 OK").await?,
            "QUIT" => {
                reply(io, &format!("221 2.0.0 {} closing connection", ctx.config.domain)).await?;
                return Ok(LoopExit::Done);
            }
            "AUTH" => reply(io, "502 5.7.0 authentication not enabled").await?,
            "VRFY" => reply(io, "252 2.5.2 cannot VRFY, but will accept message").await?,
            "" => reply(io, "500 5.5.2 empty command").await?,
            _ => reply(io, "502 5.5.1 command not implemented").await?,
        }
    }
}

async fn handle_mail<S>(
    io: &mut BufStream<S>,
    session: &mut Session,
    args: &str,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Some(rest) = strip_keyword(args, "FROM:") else {
        return reply(io, "501 5.5.4 syntax: MAIL FROM:<address>").await;
    };
    if session.mail_from.is_some() {
        return reply(io, "503 5.5.1 nested MAIL command").await;
    }
    // The reverse path is recorded verbatim; anything syntactically present
    // is accepted, including the null sender.
    session.mail_from = Some(extract_path(rest));
    reply(io, "250 2.0.0 OK").await
}

async fn handle_rcpt<S>(
    io: &mut BufStream<S>,
    session: &mut Session,
    ctx: &ConnContext,
    args: &str,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if session.mail_from.is_none() {
        return reply(io, "503 5.5.1 need MAIL before RCPT").await;
    }
    let Some(rest) = strip_keyword(args, "TO:") else {
        return reply(io, "501 5.5.4 syntax: RCPT TO:<address>").await;
    };
    if session.rcpt_to.len() >= MAX_RECIPIENTS {
        return reply(io, "452 4.5.3 too many recipients").await;
    }
    let addr = extract_path(rest);
    match test_id::parse_mail_address(&addr, &ctx.config.domain) {
        None => reply(io, "554 5.7.1 Relay access denied").await,
        Some(id) => {
            session.test_ids.push(id);
            session.rcpt_to.push(addr);
            reply(io, "250 2.1.5 OK").await
        }
    }
}

/// Record the finished message once per distinct test the recipients
/// named, skipping tests that are no longer running. Failures are logged
/// per test; the sender still gets its 250.
async fn record_message(ctx: &ConnContext, session: &Session, data: &[u8]) {
    let mut seen: Vec<TestId> = Vec::new();
    for &id in &session.test_ids {
        if seen.contains(&id) {
            continue;
        }
        seen.push(id);
        if let Err(err) = record_for_test(ctx, session, id, data).await {
            error!("smtp: error recording message for test {id}: {err}");
        }
    }
}

async fn record_for_test(
    ctx: &ConnContext,
    session: &Session,
    id: TestId,
    data: &[u8],
) -> Result<(), Error> {
    if !ctx.store.read().await.is_running_test(id).await? {
        return Ok(());
    }
    ctx.store
        .write()
        .await
        .record_smtp_request(CapturedSmtpRequest {
            test_id: id,
            received_at: OffsetDateTime::now_utc(),
            remote_addr: ctx.remote_addr,
            helo: session.helo.clone().unwrap_or_default(),
            starttls: session.starttls,
            mail_from: session.mail_from.clone().unwrap_or_default(),
            rcpt_to: session.rcpt_to.clone(),
            message: data.to_vec(),
        })
        .await
}

enum MessageRead {
    Complete(Vec<u8>),
    TooBig,
    Closed,
}

/// Read the message body up to the `<CRLF>.<CRLF>` terminator, undoing dot
/// stuffing. An oversized message is still consumed to the terminator so
/// the 552 lands in the right place of the dialogue.
async fn read_message<S>(io: &mut BufStream<S>) -> Result<MessageRead, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut data = Vec::new();
    let mut too_big = false;
    loop {
        let Some(line) = next_line(io).await? else {
            return Ok(MessageRead::Closed);
        };
        if line == "." {
            break;
        }
        let line = line.strip_prefix('.').unwrap_or(&line);
        if data.len() + line.len() + 2 > MAX_MESSAGE_BYTES {
            too_big = true;
        }
        if !too_big {
            data.extend_from_slice(line.as_bytes());
            data.extend_from_slice(b"\r\n");
        }
    }
    Ok(if too_big {
        MessageRead::TooBig
    } else {
        MessageRead::Complete(data)
    })
}

enum FillStatus {
    Eof,
    IdleTimeout,
    /// Consumed this many buffered bytes; the newline was found.
    Complete(usize),
    /// Consumed this many buffered bytes; still waiting for the newline.
    Partial(usize),
}

/// Read one CRLF-terminated line, bounded by [`MAX_LINE_BYTES`]. Returns
/// `None` when the connection should close: EOF, idle timeout (a 421 is
/// sent first) or an oversized line (500 sent first).
async fn next_line<S>(io: &mut BufStream<S>) -> Result<Option<String>, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut line: Vec<u8> = Vec::new();
    loop {
        let status = match timeout(READ_TIMEOUT, io.fill_buf()).await {
            Err(_) => FillStatus::IdleTimeout,
            Ok(Err(err)) => return Err(err.into()),
            Ok(Ok(available)) => {
                if available.is_empty() {
                    FillStatus::Eof
                } else {
                    match available.iter().position(|&b| b == b'\n') {
                        Some(pos) => {
                            line.extend_from_slice(&available[..pos]);
                            FillStatus::Complete(pos + 1)
                        }
                        None => {
                            line.extend_from_slice(available);
                            FillStatus::Partial(available.len())
                        }
                    }
                }
            }
        };
        match status {
            FillStatus::Eof => return Ok(None),
            FillStatus::IdleTimeout => {
                let _ = reply(io, "421 4.4.2 idle timeout, closing connection").await;
                return Ok(None);
            }
            FillStatus::Complete(consumed) | FillStatus::Partial(consumed) => {
                io.consume(consumed);
                if line.len() > MAX_LINE_BYTES {
                    let _ = reply(io, "500 5.5.2 line too long").await;
                    return Ok(None);
                }
                if matches!(status, FillStatus::Complete(_)) {
                    break;
                }
            }
        }
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(Some(String::from_utf8_lossy(&line).into_owned()))
}

pub(super) async fn reply<S>(io: &mut BufStream<S>, text: &str) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let write = async {
        io.write_all(text.as_bytes()).await?;
        io.write_all(b"\r\n").await?;
        io.flush().await
    };
    match timeout(WRITE_TIMEOUT, write).await {
        Err(_) => Err(Error::IO(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "SMTP write timed out",
        ))),
        Ok(result) => Ok(result?),
    }
}

async fn reply_ehlo<S>(
    io: &mut BufStream<S>,
    ctx: &ConnContext,
    starttls_available: bool,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut out = format!(
        "250-{}\r\n250-SIZE {MAX_MESSAGE_BYTES}\r\n250-8BITMIME\r\n",
        ctx.config.domain
    );
    if starttls_available {
        out.push_str("250-STARTTLS\r\n");
    }
    out.push_str("250 SMTPUTF8");
    reply(io, &out).await
}

fn split_command(line: &str) -> (String, &str) {
    let line = line.trim_start();
    match line.find(' ') {
        Some(i) => (line[..i].to_ascii_uppercase(), line[i + 1..].trim()),
        None => (line.to_ascii_uppercase(), ""),
    }
}

fn strip_keyword<'a>(args: &'a str, keyword: &str) -> Option<&'a str> {
    if args.len() >= keyword.len() && args[..keyword.len()].eq_ignore_ascii_case(keyword) {
        Some(&args[keyword.len()..])
    } else {
        None
    }
}

/// The address inside an angle-bracketed path, ignoring trailing ESMTP
/// parameters (`SIZE=`, `BODY=8BITMIME`, ...).
fn extract_path(raw: &str) -> String {
    let raw = raw.trim();
    let path = raw.split_whitespace().next().unwrap_or("");
    let path = path.strip_prefix('<').unwrap_or(path);
    let path = path.strip_suffix('>').unwrap_or(path);
    path.to_string()
}
