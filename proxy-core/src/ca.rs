use crate::error::ProxyError;
use crate::Result;
use rand::Rng;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
    PKCS_ECDSA_P256_SHA256,
};
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};

/// Validity of a freshly generated root certificate.
const ROOT_VALIDITY: Duration = Duration::days(5 * 365);
/// Leaves are backdated to tolerate client clock skew.
const LEAF_BACKDATE: Duration = Duration::hours(1);
const LEAF_VALIDITY: Duration = Duration::hours(24);
const ROOT_PATH_LEN: u8 = 2;

/// Root certificate authority used to sign intercepted hosts' certificates.
///
/// Loaded (or generated) once per process and shared behind an `Arc`. The
/// persisted certificate bytes are kept verbatim so that every leaf chain
/// presents exactly what clients were told to trust.
pub struct RootAuthority {
    signer: Certificate,
    cert_der: Vec<u8>,
    cert_pem: String,
    common_name: String,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
    is_ca: bool,
}

/// A per-host certificate signed by the root authority.
#[derive(Clone)]
pub struct LeafCertificate {
    pub host: String,
    pub serial: u64,
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
    /// DER of the leaf itself
    pub cert_der: Vec<u8>,
    /// PKCS#8 DER of the leaf's private key
    pub key_der: Vec<u8>,
    /// DER of the signing root, appended to the served chain
    pub issuer_der: Vec<u8>,
}

impl std::fmt::Debug for LeafCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafCertificate")
            .field("host", &self.host)
            .field("serial", &self.serial)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

impl RootAuthority {
    /// Load the root pair from `cert_path`/`key_path`, generating and persisting
    /// a new one when either file is missing.
    pub fn bootstrap(cert_path: &Path, key_path: &Path) -> Result<Self> {
        if cert_path.exists() && key_path.exists() {
            debug!(cert = %cert_path.display(), "Loading root certificate");
            return Self::load(cert_path, key_path);
        }

        // A lone leftover file would make the next start load a mismatched pair.
        for stale in [cert_path, key_path] {
            if stale.exists() {
                fs::remove_file(stale).map_err(|e| {
                    ProxyError::Persistence(format!("remove {}: {}", stale.display(), e))
                })?;
            }
        }

        let authority = Self::generate()?;
        authority.persist(cert_path, key_path)?;
        info!(
            cert = %cert_path.display(),
            common_name = %authority.common_name,
            "Generated new root certificate"
        );
        Ok(authority)
    }

    fn load(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let cert_pem = fs::read_to_string(cert_path)
            .map_err(|e| ProxyError::Persistence(format!("read {}: {}", cert_path.display(), e)))?;
        let key_pem = fs::read_to_string(key_path)
            .map_err(|e| ProxyError::Persistence(format!("read {}: {}", key_path.display(), e)))?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    /// Build an authority from PEM strings without touching the filesystem.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let key_pair = KeyPair::from_pem(key_pem)
            .map_err(|e| ProxyError::Crypto(format!("parse root key: {}", e)))?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem, key_pair)
            .map_err(|e| ProxyError::Crypto(format!("parse root certificate: {}", e)))?;
        let signer = Certificate::from_params(params)
            .map_err(|e| ProxyError::Crypto(format!("rebuild root signer: {}", e)))?;
        Self::assemble(signer, cert_pem.to_string())
    }

    fn generate() -> Result<Self> {
        let common_name = hostname::get()
            .ok()
            .and_then(|name| name.into_string().ok())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "localhost".to_string());

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        params.distinguished_name = dn;
        params.alg = &PKCS_ECDSA_P256_SHA256;
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(ROOT_PATH_LEN));
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.serial_number = Some(SerialNumber::from(random_serial()));
        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + ROOT_VALIDITY;
        params.key_pair = Some(
            KeyPair::generate(&PKCS_ECDSA_P256_SHA256)
                .map_err(|e| ProxyError::Crypto(format!("generate root key: {}", e)))?,
        );

        let signer = Certificate::from_params(params)
            .map_err(|e| ProxyError::Crypto(format!("build root certificate: {}", e)))?;
        // ECDSA signatures are randomized: serialize exactly once and keep the bytes.
        let cert_pem = signer
            .serialize_pem()
            .map_err(|e| ProxyError::Crypto(format!("sign root certificate: {}", e)))?;
        Self::assemble(signer, cert_pem)
    }

    fn assemble(signer: Certificate, cert_pem: String) -> Result<Self> {
        let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes())
            .map_err(|e| ProxyError::Crypto(format!("decode root PEM: {}", e)))?;
        let cert_der = pem.contents;
        let (_, parsed) = x509_parser::parse_x509_certificate(&cert_der)
            .map_err(|e| ProxyError::Crypto(format!("parse root DER: {}", e)))?;

        let is_ca = parsed
            .basic_constraints()
            .ok()
            .flatten()
            .map(|ext| ext.value.ca)
            .unwrap_or(false);
        let common_name = parsed
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or_default()
            .to_string();
        let not_before = parsed.validity().not_before.to_datetime();
        let not_after = parsed.validity().not_after.to_datetime();

        Ok(Self {
            signer,
            cert_der,
            cert_pem,
            common_name,
            not_before,
            not_after,
            is_ca,
        })
    }

    fn persist(&self, cert_path: &Path, key_path: &Path) -> Result<()> {
        write_read_only(cert_path, self.cert_pem.as_bytes())?;
        write_read_only(key_path, self.signer.serialize_private_key_pem().as_bytes())
    }

    /// Mint a certificate for `host`, signed by this authority.
    pub fn issue_leaf(&self, host: &str) -> Result<LeafCertificate> {
        if !self.is_ca {
            return Err(ProxyError::NotACertificateAuthority);
        }

        let serial = random_serial();
        let now = OffsetDateTime::now_utc();
        let not_before = now - LEAF_BACKDATE;
        let not_after = now + LEAF_VALIDITY;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;
        params.alg = &PKCS_ECDSA_P256_SHA256;
        params.subject_alt_names = vec![match host.parse::<IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(host.to_string()),
        }];
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.serial_number = Some(SerialNumber::from(serial));
        params.not_before = not_before;
        params.not_after = not_after;

        let leaf = Certificate::from_params(params)
            .map_err(|e| ProxyError::Crypto(format!("build leaf for {}: {}", host, e)))?;
        let cert_der = leaf
            .serialize_der_with_signer(&self.signer)
            .map_err(|e| ProxyError::Crypto(format!("sign leaf for {}: {}", host, e)))?;

        Ok(LeafCertificate {
            host: host.to_string(),
            serial,
            not_before,
            not_after,
            cert_der,
            key_der: leaf.serialize_private_key_der(),
            issuer_der: self.cert_der.clone(),
        })
    }

    pub fn cert_der(&self) -> &[u8] {
        &self.cert_der
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn common_name(&self) -> &str {
        &self.common_name
    }

    pub fn not_before(&self) -> OffsetDateTime {
        self.not_before
    }

    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }

    pub fn is_ca(&self) -> bool {
        self.is_ca
    }
}

/// Serial numbers stay below `i64::MAX` so they fit a signed 64-bit integer.
fn random_serial() -> u64 {
    rand::thread_rng().gen_range(1..i64::MAX as u64)
}

fn write_read_only(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|e| ProxyError::Persistence(format!("create {}: {}", parent.display(), e)))?;
    }
    fs::write(path, contents)
        .map_err(|e| ProxyError::Persistence(format!("write {}: {}", path.display(), e)))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o444))
            .map_err(|e| ProxyError::Persistence(format!("chmod {}: {}", path.display(), e)))?;
    }
    Ok(())
}
