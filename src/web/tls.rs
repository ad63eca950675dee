use crate::cert::SelfSignedIdentity;
use crate::config::Config;
use crate::error::Error;
use crate::test_id;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::{any_supported_type, CertifiedKey};
use rustls::ServerConfig;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

/// Chooses the HTTPS certificate by SNI name: the operator-provided
/// identity for the root domain, an on-demand self-signed identity for any
/// valid test hostname, and `None` (handshake refused) for everything
/// else — including `_`-prefixed names, which exist for DNS validation
/// only.
pub struct CaptureCertResolver {
    domain: String,
    root: Option<Arc<CertifiedKey>>,
    identity: Arc<SelfSignedIdentity>,
}

impl CaptureCertResolver {
    pub fn new(config: &Config, identity: Arc<SelfSignedIdentity>) -> Result<Self, Error> {
        let root = match (&config.https_cert_path, &config.https_key_path) {
            (Some(cert_path), Some(key_path)) => {
                Some(Arc::new(load_certified_key(cert_path, key_path)?))
            }
            _ => {
                tracing::warn!(
                    "no HTTPS certificate configured; root domain handshakes will be refused"
                );
                None
            }
        };
        Ok(CaptureCertResolver {
            domain: config.domain.to_ascii_lowercase(),
            root,
            identity,
        })
    }
}

impl ResolvesServerCert for CaptureCertResolver {
    fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        let name = client_hello.server_name()?;
        if name.eq_ignore_ascii_case(&self.domain) {
            return self.root.clone();
        }
        if test_id::parse_hostname(name, &self.domain).is_some() && !name.starts_with('_') {
            return match self.identity.certified_key(name) {
                Ok(key) => Some(Arc::new(key)),
                Err(err) => {
                    tracing::warn!("minting a certificate for {name:?} failed: {err}");
                    None
                }
            };
        }
        None
    }
}

pub fn https_server_config(resolver: CaptureCertResolver) -> ServerConfig {
    let mut config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(resolver));
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    config
}

fn load_certified_key(cert_path: &str, key_path: &str) -> Result<CertifiedKey, Error> {
    let certs: Vec<rustls::Certificate> =
        rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))?
            .into_iter()
            .map(rustls::Certificate)
            .collect();
    if certs.is_empty() {
        return Err(Error::NoCertificates(cert_path.to_string()));
    }
    let key = read_private_key(key_path)?;
    let key = any_supported_type(&rustls::PrivateKey(key))
        .map_err(|_| Error::NoPrivateKey(key_path.to_string()))?;
    Ok(CertifiedKey::new(certs, key))
}

fn read_private_key(key_path: &str) -> Result<Vec<u8>, Error> {
    for item in rustls_pemfile::read_all(&mut BufReader::new(File::open(key_path)?))? {
        match item {
            rustls_pemfile::Item::PKCS8Key(key)
            | rustls_pemfile::Item::RSAKey(key)
            | rustls_pemfile::Item::ECKey(key) => return Ok(key),
            _ => {}
        }
    }
    Err(Error::NoPrivateKey(key_path.to_string()))
}
