//! On-demand self-signed TLS identities.
//!
//! Validation probes connect to test hostnames that no CA would ever issue
//! for, so the HTTPS and SMTP responders complete those handshakes with a
//! certificate minted on the spot: subject and SAN set to whatever server
//! name the client asked for, signed by a single process-lifetime RSA-2048
//! key. The certificate is deliberately not cached; a fresh one (with a
//! fresh random serial) is built per handshake, which is fine at diagnostic
//! traffic volumes. The wide ±12 hour validity window tolerates badly
//! skewed clocks on the validating side.

use crate::error::Error;
use rand::rngs::OsRng;
use rand::RngCore;
use rcgen::{
    Certificate, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair,
    KeyUsagePurpose, SanType, SerialNumber,
};
use rsa::pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::{any_supported_type, CertifiedKey, SigningKey};
use std::sync::{Arc, OnceLock};
use time::{Duration, OffsetDateTime};

const VALIDITY_SKEW: Duration = Duration::hours(12);

/// Mints self-signed server certificates for arbitrary hostnames.
pub struct SelfSignedIdentity {
    /// Initialized at most once. `Some` holds the generated key; `None`
    /// records that generation failed, permanently — key generation failure
    /// is treated as unrecoverable for the rest of the process lifetime and
    /// is not retried per handshake.
    key: OnceLock<Option<SelfSignedKey>>,
}

struct SelfSignedKey {
    pkcs8_der: Vec<u8>,
    signing_key: Arc<dyn SigningKey>,
}

impl SelfSignedIdentity {
    #[must_use]
    pub fn new() -> Self {
        SelfSignedIdentity {
            key: OnceLock::new(),
        }
    }

    fn key(&self) -> Result<&SelfSignedKey, Error> {
        self.key
            .get_or_init(generate_signing_key)
            .as_ref()
            .ok_or(Error::SelfSignedKey)
    }

    /// Build a fresh self-signed certificate for `server_name`, ready to be
    /// handed to rustls.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SelfSignedKey`] if the one-time key generation
    /// failed, [`Error::Random`] if no serial number could be drawn, or
    /// [`Error::CertificateGeneration`] if certificate construction fails.
    pub fn certified_key(&self, server_name: &str) -> Result<CertifiedKey, Error> {
        let key = self.key()?;

        let mut serial = [0_u8; 16];
        OsRng.try_fill_bytes(&mut serial)?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, server_name);
        params.distinguished_name = dn;
        params.subject_alt_names = vec![SanType::DnsName(server_name.to_string())];
        params.serial_number = Some(SerialNumber::from(serial.to_vec()));
        let now = OffsetDateTime::now_utc();
        params.not_before = now - VALIDITY_SKEW;
        params.not_after = now + VALIDITY_SKEW;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.alg = &rcgen::PKCS_RSA_SHA256;
        params.key_pair = Some(
            KeyPair::from_der(&key.pkcs8_der)
                .map_err(|err| Error::CertificateGeneration(err.to_string()))?,
        );

        let cert = Certificate::from_params(params)
            .map_err(|err| Error::CertificateGeneration(err.to_string()))?;
        let cert_der = cert
            .serialize_der()
            .map_err(|err| Error::CertificateGeneration(err.to_string()))?;

        Ok(CertifiedKey::new(
            vec![rustls::Certificate(cert_der)],
            key.signing_key.clone(),
        ))
    }
}

impl Default for SelfSignedIdentity {
    fn default() -> Self {
        Self::new()
    }
}

fn generate_signing_key() -> Option<SelfSignedKey> {
    let key = match RsaPrivateKey::new(&mut OsRng, 2048) {
        Ok(key) => key,
        Err(err) => {
            tracing::error!("generating the self-signed RSA key failed: {err}");
            return None;
        }
    };
    let pkcs8 = match key.to_pkcs8_der() {
        Ok(doc) => doc.as_bytes().to_vec(),
        Err(err) => {
            tracing::error!("encoding the self-signed key failed: {err}");
            return None;
        }
    };
    let signing_key = match any_supported_type(&rustls::PrivateKey(pkcs8.clone())) {
        Ok(signing_key) => signing_key,
        Err(err) => {
            tracing::error!("the generated self-signed key is unusable: {err}");
            return None;
        }
    };
    Some(SelfSignedKey {
        pkcs8_der: pkcs8,
        signing_key,
    })
}

/// A [`ResolvesServerCert`] that mints a self-signed identity for the
/// requested SNI name, or for a fixed default name when the client sends
/// none. Used for SMTP STARTTLS, where probes routinely omit SNI.
pub struct DefaultNameResolver {
    identity: Arc<SelfSignedIdentity>,
    default_name: String,
}

impl DefaultNameResolver {
    #[must_use]
    pub fn new(identity: Arc<SelfSignedIdentity>, default_name: String) -> Self {
        DefaultNameResolver {
            identity,
            default_name,
        }
    }
}

impl ResolvesServerCert for DefaultNameResolver {
    fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        let name = client_hello.server_name().unwrap_or(&self.default_name);
        match self.identity.certified_key(name) {
            Ok(key) => Some(Arc::new(key)),
            Err(err) => {
                tracing::warn!("minting a certificate for {name:?} failed: {err}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mints_certificates_for_arbitrary_names() {
        let identity = SelfSignedIdentity::new();
        let key = identity
            .certified_key("00112233445566778899aabbccddeeff.test.example.com")
            .unwrap();
        assert_eq!(key.cert.len(), 1);
        assert!(!key.cert[0].0.is_empty());

        // A second handshake gets a distinct certificate (fresh serial)
        // signed by the same key.
        let again = identity
            .certified_key("00112233445566778899aabbccddeeff.test.example.com")
            .unwrap();
        assert_ne!(key.cert[0].0, again.cert[0].0);
    }
}
