use crate::cert::{DefaultNameResolver, SelfSignedIdentity};
use crate::config::SharedConfig;
use crate::error::Error;
use crate::smtp::session::{reply, run_command_loop, ConnContext, LoopExit, Session};
use crate::store::DynStore;
use rustls::ServerConfig;
use std::sync::Arc;
use tokio::io::BufStream;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

/// Accept loop for the SMTP listener. STARTTLS uses the on-demand
/// self-signed identity with the root domain as the default server name,
/// since mail senders frequently omit SNI.
pub async fn serve(
    listener: TcpListener,
    config: SharedConfig,
    store: DynStore,
    identity: Arc<SelfSignedIdentity>,
) {
    let resolver = DefaultNameResolver::new(identity, config.domain.clone());
    let tls_config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(resolver));
    let acceptor = TlsAcceptor::from(Arc::new(tls_config));

    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(err) => {
                tracing::warn!("accepting an SMTP connection failed: {err}");
                continue;
            }
        };
        let ctx = ConnContext {
            config: config.clone(),
            store: store.clone(),
            remote_addr,
        };
        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_connection(stream, &ctx, acceptor).await {
                tracing::debug!("SMTP connection from {remote_addr} ended: {err}");
            }
        });
    }
}

async fn serve_connection(
    stream: TcpStream,
    ctx: &ConnContext,
    acceptor: TlsAcceptor,
) -> Result<(), Error> {
    let mut io = BufStream::new(stream);
    reply(&mut io, &format!("220 {} ESMTP ready", ctx.config.domain)).await?;

    let mut session = Session::new(false);
    match run_command_loop(&mut io, &mut session, ctx, true).await? {
        LoopExit::Done => Ok(()),
        LoopExit::StartTls => {
            let tls_stream = acceptor.accept(io.into_inner()).await?;
            let mut io = BufStream::new(tls_stream);
            // RFC 3207: the pre-handshake state is discarded; the client
            // greets again on the now-encrypted channel.
            let mut session = Session::new(true);
            run_command_loop(&mut io, &mut session, ctx, false).await?;
            Ok(())
        }
    }
}
