use axum::{Extension, Router};
use hyper::server::conn::Http;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

/// Per-connection facts the dispatch handler needs: who connected, and
/// whether they did so over TLS.
#[derive(Clone, Copy, Debug)]
pub struct ConnMeta {
    pub remote_addr: SocketAddr,
    pub https: bool,
}

/// Accept loop for the plaintext HTTP listener. Accept errors are logged
/// and the loop keeps going; they never take the other listeners down.
pub async fn serve_http(listener: TcpListener, router: Router) {
    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(err) => {
                tracing::warn!("accepting an HTTP connection failed: {err}");
                continue;
            }
        };
        let service = router.clone().layer(Extension(ConnMeta {
            remote_addr,
            https: false,
        }));
        tokio::spawn(async move {
            if let Err(err) = Http::new().serve_connection(stream, service).await {
                tracing::debug!("HTTP connection from {remote_addr} ended: {err}");
            }
        });
    }
}

/// Accept loop for the HTTPS listener. The TLS handshake happens inside
/// the per-connection task; a failed handshake (including an SNI name the
/// certificate resolver rejected) only ends that connection.
pub async fn serve_https(listener: TcpListener, acceptor: TlsAcceptor, router: Router) {
    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(err) => {
                tracing::warn!("accepting an HTTPS connection failed: {err}");
                continue;
            }
        };
        let acceptor = acceptor.clone();
        let service = router.clone().layer(Extension(ConnMeta {
            remote_addr,
            https: true,
        }));
        tokio::spawn(async move {
            let stream = match acceptor.accept(stream).await {
                Ok(stream) => stream,
                Err(err) => {
                    tracing::debug!("TLS handshake with {remote_addr} failed: {err}");
                    return;
                }
            };
            if let Err(err) = Http::new().serve_connection(stream, service).await {
                tracing::debug!("HTTPS connection from {remote_addr} ended: {err}");
            }
        });
    }
}
