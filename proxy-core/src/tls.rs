//! TLS glue between the certificate authority and rustls.

use crate::ca::{LeafCertificate, RootAuthority};
use crate::error::ProxyError;
use crate::Result;
use dashmap::DashMap;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tracing::{debug, warn};

const HTTP11_ALPN: &[u8] = b"http/1.1";

/// Anything that can mint a certificate for a TLS server name.
pub trait CertificateProvider: Send + Sync {
    fn issue_for(&self, server_name: &str) -> Result<LeafCertificate>;
}

impl CertificateProvider for RootAuthority {
    fn issue_for(&self, server_name: &str) -> Result<LeafCertificate> {
        self.issue_leaf(server_name)
    }
}

/// Reuses leaves per host until `margin` before they expire. Stale entries
/// are evicted whenever a new leaf is issued.
pub struct CachedCertificateProvider {
    inner: Arc<dyn CertificateProvider>,
    leaves: DashMap<String, LeafCertificate>,
    margin: Duration,
}

impl CachedCertificateProvider {
    pub fn new(inner: Arc<dyn CertificateProvider>) -> Self {
        Self::with_margin(inner, Duration::minutes(5))
    }

    pub fn with_margin(inner: Arc<dyn CertificateProvider>, margin: Duration) -> Self {
        Self {
            inner,
            leaves: DashMap::new(),
            margin,
        }
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }
}

impl CertificateProvider for CachedCertificateProvider {
    fn issue_for(&self, server_name: &str) -> Result<LeafCertificate> {
        let key = server_name.to_ascii_lowercase();
        let fresh_until = OffsetDateTime::now_utc() + self.margin;

        if let Some(leaf) = self.leaves.get(&key) {
            if leaf.not_after > fresh_until {
                return Ok(leaf.clone());
            }
        }

        let leaf = self.inner.issue_for(server_name)?;
        self.leaves.retain(|_, cached| cached.not_after > fresh_until);
        self.leaves.insert(key, leaf.clone());
        Ok(leaf)
    }
}

/// Turn an issued leaf into the chain-plus-key rustls serves.
pub fn certified_key(leaf: &LeafCertificate) -> Result<Arc<CertifiedKey>> {
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf.key_der.clone()));
    let signing_key = ring::sign::any_supported_type(&key)
        .map_err(|e| ProxyError::Crypto(format!("load leaf key for {}: {}", leaf.host, e)))?;
    let chain = vec![
        CertificateDer::from(leaf.cert_der.clone()),
        CertificateDer::from(leaf.issuer_der.clone()),
    ];
    Ok(Arc::new(CertifiedKey::new(chain, signing_key)))
}

/// Serves the session's leaf, or a freshly issued one when the client's SNI
/// names a different host.
pub struct DynamicCertResolver {
    provider: Arc<dyn CertificateProvider>,
    default_host: String,
    default_key: Arc<CertifiedKey>,
}

impl DynamicCertResolver {
    pub fn new(provider: Arc<dyn CertificateProvider>, leaf: &LeafCertificate) -> Result<Self> {
        Ok(Self {
            provider,
            default_host: leaf.host.clone(),
            default_key: certified_key(leaf)?,
        })
    }
}

impl std::fmt::Debug for DynamicCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicCertResolver")
            .field("default_host", &self.default_host)
            .finish_non_exhaustive()
    }
}

impl ResolvesServerCert for DynamicCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let server_name = match client_hello.server_name() {
            Some(name) if !name.eq_ignore_ascii_case(&self.default_host) => name,
            _ => return Some(self.default_key.clone()),
        };

        debug!(sni = %server_name, "Issuing certificate for SNI");
        match self
            .provider
            .issue_for(server_name)
            .and_then(|leaf| certified_key(&leaf))
        {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(sni = %server_name, error = %e, "SNI issuance failed, serving session leaf");
                Some(self.default_key.clone())
            }
        }
    }
}

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

/// Server side of an intercepted tunnel.
pub fn server_config(resolver: Arc<DynamicCertResolver>) -> Result<ServerConfig> {
    let mut config = ServerConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| ProxyError::Crypto(e.to_string()))?
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    config.alpn_protocols = vec![HTTP11_ALPN.to_vec()];
    Ok(config)
}

/// Client side toward the real origin. Without verification any peer
/// certificate is accepted.
pub fn client_config(verify_upstream: bool) -> Result<ClientConfig> {
    let builder = ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| ProxyError::Crypto(e.to_string()))?;

    let mut config = if verify_upstream {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots).with_no_client_auth()
    } else {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertVerifier))
            .with_no_client_auth()
    };
    config.alpn_protocols = vec![HTTP11_ALPN.to_vec()];
    Ok(config)
}

/// Accepts any server certificate.
#[derive(Debug)]
pub struct NoCertVerifier;

impl ServerCertVerifier for NoCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Convert a host string into a rustls server name.
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|e| ProxyError::Dial(format!("invalid server name {}: {}", host, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    struct CountingProvider {
        authority: RootAuthority,
        issued: AtomicUsize,
    }

    impl CertificateProvider for CountingProvider {
        fn issue_for(&self, server_name: &str) -> Result<LeafCertificate> {
            self.issued.fetch_add(1, Ordering::SeqCst);
            self.authority.issue_leaf(server_name)
        }
    }

    fn counting_provider() -> (tempfile::TempDir, Arc<CountingProvider>) {
        let dir = tempdir().unwrap();
        let authority =
            RootAuthority::bootstrap(&dir.path().join("ca.crt"), &dir.path().join("ca.key"))
                .unwrap();
        let provider = Arc::new(CountingProvider {
            authority,
            issued: AtomicUsize::new(0),
        });
        (dir, provider)
    }

    #[test]
    fn cache_reuses_fresh_leaves() {
        let (_dir, counting) = counting_provider();
        let cache = CachedCertificateProvider::new(counting.clone());

        let first = cache.issue_for("Example.com").unwrap();
        let second = cache.issue_for("example.com").unwrap();
        assert_eq!(first.serial, second.serial);
        assert_eq!(counting.issued.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn cache_reissues_near_expiry() {
        let (_dir, counting) = counting_provider();
        // Margin beyond the leaf lifetime: every cached entry is already stale.
        let cache = CachedCertificateProvider::with_margin(counting.clone(), Duration::hours(48));

        cache.issue_for("example.com").unwrap();
        cache.issue_for("example.com").unwrap();
        assert_eq!(counting.issued.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn stale_leaves_are_evicted() {
        let (_dir, counting) = counting_provider();
        let cache = CachedCertificateProvider::with_margin(counting.clone(), Duration::hours(48));

        for host in ["a.test", "b.test", "c.test"] {
            cache.issue_for(host).unwrap();
        }
        // Each issuance drops the previous, already stale, entry.
        assert_eq!(cache.len(), 1);

        let fresh = CachedCertificateProvider::new(counting);
        for host in ["a.test", "b.test", "c.test"] {
            fresh.issue_for(host).unwrap();
        }
        assert_eq!(fresh.len(), 3);
    }

    #[test]
    fn leaf_converts_to_certified_key() {
        let (_dir, counting) = counting_provider();
        let leaf = counting.issue_for("example.com").unwrap();
        let key = certified_key(&leaf).unwrap();
        assert_eq!(key.cert.len(), 2);
        assert_eq!(key.cert[0].as_ref(), leaf.cert_der.as_slice());
    }

    #[test]
    fn configs_advertise_http11() {
        let (_dir, counting) = counting_provider();
        let leaf = counting.issue_for("example.com").unwrap();
        let resolver = Arc::new(DynamicCertResolver::new(counting, &leaf).unwrap());

        let server = server_config(resolver).unwrap();
        assert_eq!(server.alpn_protocols, vec![b"http/1.1".to_vec()]);
        let client = client_config(false).unwrap();
        assert_eq!(client.alpn_protocols, vec![b"http/1.1".to_vec()]);
        assert!(client_config(true).is_ok());
    }
}
