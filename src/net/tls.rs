//! TLS configuration for the client transport.
//!
//! The configuration is opaque to the session engine: it is consumed
//! here to build a `rustls::ClientConfig` and never inspected again.
//! Trust anchors come from the web PKI roots or a caller-supplied CA
//! bundle; an optional client identity enables mutual TLS.

use crate::error::MqttError;
use rustls::{Certificate, ClientConfig, OwnedTrustAnchor, PrivateKey, RootCertStore};
use std::fmt;
use std::sync::Arc;

/// Where server certificate trust comes from.
#[derive(Debug, Clone)]
pub enum TrustAnchors {
    /// The bundled web PKI root set.
    System,
    /// A PEM bundle of CA certificates.
    CustomPem(Vec<u8>),
}

/// Client certificate and key for mutual TLS, both PEM-encoded.
#[derive(Clone)]
pub struct ClientIdentity {
    pub cert_chain_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

impl fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientIdentity")
            .field(
                "cert_chain_pem",
                &format!("<{} bytes>", self.cert_chain_pem.len()),
            )
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

/// TLS settings for [`ClientConfig`](crate::config::ClientConfig).
#[derive(Clone)]
pub struct TlsConfig {
    pub trust: TrustAnchors,
    /// SNI override; the broker host is used when absent.
    pub server_name: Option<String>,
    /// Client identity for mutual TLS.
    pub identity: Option<ClientIdentity>,
    /// Escape hatch: a fully prepared rustls configuration that takes
    /// precedence over every other field.
    pub prebuilt: Option<Arc<ClientConfig>>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            trust: TrustAnchors::System,
            server_name: None,
            identity: None,
            prebuilt: None,
        }
    }
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig")
            .field("trust", &self.trust)
            .field("server_name", &self.server_name)
            .field("identity", &self.identity)
            .field("prebuilt", &self.prebuilt.is_some())
            .finish()
    }
}

impl TlsConfig {
    /// Trust a custom CA bundle instead of the web PKI roots.
    pub fn with_custom_ca(ca_pem: impl Into<Vec<u8>>) -> Self {
        Self {
            trust: TrustAnchors::CustomPem(ca_pem.into()),
            ..Default::default()
        }
    }

    /// Wrap a prepared rustls configuration.
    pub fn from_rustls(config: Arc<ClientConfig>) -> Self {
        Self {
            prebuilt: Some(config),
            ..Default::default()
        }
    }
}

/// Build the rustls client configuration for a connection attempt.
pub(crate) fn build_client_config(cfg: &TlsConfig) -> Result<Arc<ClientConfig>, MqttError> {
    if let Some(prebuilt) = &cfg.prebuilt {
        return Ok(Arc::clone(prebuilt));
    }

    let mut roots = RootCertStore::empty();
    match &cfg.trust {
        TrustAnchors::System => {
            roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
                OwnedTrustAnchor::from_subject_spki_name_constraints(
                    ta.subject,
                    ta.spki,
                    ta.name_constraints,
                )
            }));
        }
        TrustAnchors::CustomPem(pem) => {
            let mut reader: &[u8] = pem;
            let ders = rustls_pemfile::certs(&mut reader)
                .map_err(|e| MqttError::Connection(format!("parse CA bundle: {e}")))?;
            let (added, _) = roots.add_parsable_certificates(&ders);
            if added == 0 {
                return Err(MqttError::Connection(
                    "no usable CA certificates in custom trust bundle".into(),
                ));
            }
        }
    }

    let builder = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots);

    let config = match &cfg.identity {
        Some(identity) => {
            let mut reader: &[u8] = &identity.cert_chain_pem;
            let chain: Vec<Certificate> = rustls_pemfile::certs(&mut reader)
                .map_err(|e| MqttError::Connection(format!("parse client chain: {e}")))?
                .into_iter()
                .map(Certificate)
                .collect();
            if chain.is_empty() {
                return Err(MqttError::Connection(
                    "client certificate chain contains no certificates".into(),
                ));
            }
            let key = load_private_key(&identity.key_pem)?;
            builder
                .with_client_auth_cert(chain, key)
                .map_err(|e| MqttError::Connection(format!("build TLS client config: {e}")))?
        }
        None => builder.with_no_client_auth(),
    };

    Ok(Arc::new(config))
}

/// Accept PKCS#8, RSA and SEC1 private keys.
fn load_private_key(pem: &[u8]) -> Result<PrivateKey, MqttError> {
    let mut reader: &[u8] = pem;
    if let Some(key) = rustls_pemfile::pkcs8_private_keys(&mut reader)
        .map_err(|e| MqttError::Connection(format!("parse pkcs8 key: {e}")))?
        .into_iter()
        .next()
    {
        return Ok(PrivateKey(key));
    }
    let mut reader: &[u8] = pem;
    if let Some(key) = rustls_pemfile::rsa_private_keys(&mut reader)
        .map_err(|e| MqttError::Connection(format!("parse rsa key: {e}")))?
        .into_iter()
        .next()
    {
        return Ok(PrivateKey(key));
    }
    let mut reader: &[u8] = pem;
    if let Some(key) = rustls_pemfile::ec_private_keys(&mut reader)
        .map_err(|e| MqttError::Connection(format!("parse sec1 key: {e}")))?
        .into_iter()
        .next()
    {
        return Ok(PrivateKey(key));
    }
    Err(MqttError::Connection(
        "no supported private key found in PEM".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, KeyPair};

    fn self_signed_pem() -> (String, String) {
        let key = KeyPair::generate().expect("generate key");
        let params = CertificateParams::new(vec!["localhost".into()]).expect("cert params");
        let cert = params.self_signed(&key).expect("self-sign");
        (cert.pem(), key.serialize_pem())
    }

    #[test]
    fn test_system_roots_config_builds() {
        let config = build_client_config(&TlsConfig::default()).unwrap();
        assert!(config.alpn_protocols.is_empty());
    }

    #[test]
    fn test_custom_ca_config_builds() {
        let (ca_pem, _) = self_signed_pem();
        let config = build_client_config(&TlsConfig::with_custom_ca(ca_pem.into_bytes()));
        assert!(config.is_ok());
    }

    #[test]
    fn test_empty_ca_bundle_rejected() {
        let result = build_client_config(&TlsConfig::with_custom_ca(b"not a pem".to_vec()));
        assert!(matches!(result, Err(MqttError::Connection(_))));
    }

    #[test]
    fn test_mutual_tls_identity_builds() {
        let (ca_pem, _) = self_signed_pem();
        let (leaf_pem, leaf_key) = self_signed_pem();
        let cfg = TlsConfig {
            trust: TrustAnchors::CustomPem(ca_pem.into_bytes()),
            identity: Some(ClientIdentity {
                cert_chain_pem: leaf_pem.into_bytes(),
                key_pem: leaf_key.into_bytes(),
            }),
            ..Default::default()
        };
        assert!(build_client_config(&cfg).is_ok());
    }

    #[test]
    fn test_garbage_private_key_rejected() {
        assert!(load_private_key(b"garbage").is_err());
    }
}
