//! Certificate Authority - per-host leaf certificates for interception
//!
//! [`RootAuthority`] signs leaf certificates with `rcgen`. [`CertificateStore`]
//! sits in front of any [`CertificateProvider`], caching issued leaves by host
//! and running generation on the blocking pool behind a fixed number of
//! worker permits.

use super::cert_cache::CertCache;
use crate::error::{ProxyError, Result};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tracing::{debug, info};

/// Host identifier for certificate generation
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub enum HostIdentifier {
    /// Regular domain (e.g., example.com)
    Domain(String),

    /// IP address (e.g., 192.168.1.1)
    IpAddress(IpAddr),
}

impl HostIdentifier {
    /// Parse from hostname string
    pub fn from_hostname(hostname: &str) -> Self {
        let trimmed = hostname.trim_start_matches('[').trim_end_matches(']');
        match trimmed.parse::<IpAddr>() {
            Ok(ip) => Self::IpAddress(ip),
            Err(_) => Self::Domain(hostname.to_ascii_lowercase()),
        }
    }
}

/// Leaf certificate chain plus its private key
pub struct IssuedCertificate {
    host: String,
    /// Leaf first, then the issuing root
    cert_chain: Vec<CertificateDer<'static>>,
    key_der: Vec<u8>,
}

impl IssuedCertificate {
    pub fn new(
        host: impl Into<String>,
        cert_chain: Vec<CertificateDer<'static>>,
        key_der: Vec<u8>,
    ) -> Self {
        Self {
            host: host.into(),
            cert_chain,
            key_der,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn cert_chain(&self) -> &[CertificateDer<'static>] {
        &self.cert_chain
    }

    pub fn leaf(&self) -> Option<&CertificateDer<'static>> {
        self.cert_chain.first()
    }

    /// PKCS#8 private key for the leaf
    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.clone()))
    }
}

impl std::fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("host", &self.host)
            .field("chain_len", &self.cert_chain.len())
            .finish()
    }
}

/// Issues leaf certificates chained to a root
///
/// Implementations are CPU-bound and called from the blocking pool.
pub trait CertificateProvider: Send + Sync + 'static {
    fn issue(&self, host: &str) -> Result<IssuedCertificate>;
}

/// Signing root backed by `rcgen`
pub struct RootAuthority {
    cert: Certificate,
    key: KeyPair,
}

impl RootAuthority {
    /// Generate an ephemeral self-signed root
    pub fn generate(common_name: &str) -> Result<Self> {
        let key = KeyPair::generate()
            .map_err(|e| ProxyError::cert_generation(common_name, e.to_string()))?;
        let params = root_params(common_name);
        let cert = params
            .self_signed(&key)
            .map_err(|e| ProxyError::cert_generation(common_name, e.to_string()))?;
        info!(common_name, "Generated ephemeral root CA");
        Ok(Self { cert, key })
    }

    /// Load a root from PEM-encoded certificate and private key
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let key = KeyPair::from_pem(key_pem)
            .map_err(|e| ProxyError::cert_generation("root", format!("invalid CA key: {}", e)))?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem).map_err(|e| {
            ProxyError::cert_generation("root", format!("invalid CA certificate: {}", e))
        })?;
        // Re-sign with the same subject and key so rcgen can use it as issuer
        let cert = params
            .self_signed(&key)
            .map_err(|e| ProxyError::cert_generation("root", e.to_string()))?;
        Ok(Self { cert, key })
    }

    pub fn cert_der(&self) -> &CertificateDer<'static> {
        self.cert.der()
    }

    pub fn cert_pem(&self) -> String {
        self.cert.pem()
    }

    pub fn key_pem(&self) -> String {
        self.key.serialize_pem()
    }
}

impl CertificateProvider for RootAuthority {
    fn issue(&self, host: &str) -> Result<IssuedCertificate> {
        let identifier = HostIdentifier::from_hostname(host);
        let mut params = CertificateParams::default();

        match &identifier {
            HostIdentifier::Domain(domain) => {
                params
                    .distinguished_name
                    .push(DnType::CommonName, domain.clone());
                let san = domain
                    .as_str()
                    .try_into()
                    .map_err(|e: rcgen::Error| ProxyError::cert_generation(host, e.to_string()))?;
                params.subject_alt_names = vec![SanType::DnsName(san)];
            }
            HostIdentifier::IpAddress(ip) => {
                params
                    .distinguished_name
                    .push(DnType::CommonName, ip.to_string());
                params.subject_alt_names = vec![SanType::IpAddress(*ip)];
            }
        }

        // Backdated one day to tolerate client clock skew
        params.not_before = time::OffsetDateTime::now_utc() - time::Duration::days(1);
        params.not_after = time::OffsetDateTime::now_utc() + time::Duration::days(90);
        params.serial_number = Some(generate_serial_number().into());
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let leaf_key =
            KeyPair::generate().map_err(|e| ProxyError::cert_generation(host, e.to_string()))?;
        let leaf = params
            .signed_by(&leaf_key, &self.cert, &self.key)
            .map_err(|e| ProxyError::cert_generation(host, e.to_string()))?;

        debug!(host, "Issued leaf certificate");

        Ok(IssuedCertificate::new(
            host,
            vec![leaf.der().clone(), self.cert.der().clone()],
            leaf_key.serialize_der(),
        ))
    }
}

fn root_params(common_name: &str) -> CertificateParams {
    let mut params = CertificateParams::default();
    params
        .distinguished_name
        .push(DnType::CommonName, common_name.to_string());
    params
        .distinguished_name
        .push(DnType::OrganizationName, "tapwire".to_string());
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.not_before = time::OffsetDateTime::now_utc() - time::Duration::days(1);
    params.not_after = time::OffsetDateTime::now_utc() + time::Duration::days(3650);
    params.serial_number = Some(generate_serial_number().into());
    params
}

/// Unique serial number from crypto RNG + timestamp
fn generate_serial_number() -> u64 {
    use rand::Rng;
    let random_part: u32 = rand::thread_rng().gen();
    let timestamp_part = chrono::Utc::now().timestamp() as u32;
    ((timestamp_part as u64) << 32) | (random_part as u64)
}

/// Caching front for a [`CertificateProvider`]
pub struct CertificateStore {
    provider: RwLock<Arc<dyn CertificateProvider>>,
    /// Bumped whenever the provider (and so the root) changes
    root_generation: AtomicU64,
    cache: Mutex<CertCache>,
    workers: Arc<Semaphore>,
}

impl CertificateStore {
    pub fn new(
        provider: Arc<dyn CertificateProvider>,
        cache_size: usize,
        ttl: Duration,
        workers: usize,
    ) -> Self {
        Self {
            provider: RwLock::new(provider),
            root_generation: AtomicU64::new(0),
            cache: Mutex::new(CertCache::new(cache_size, ttl)),
            workers: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    /// Return the cached certificate for `host` or issue a new one
    ///
    /// Generation runs on the blocking pool. The result is cached only once
    /// this future resumes, so a dropped session never populates the cache.
    pub async fn get_or_issue(&self, host: &str) -> Result<Arc<IssuedCertificate>> {
        let generation = self.root_generation.load(Ordering::Acquire);
        if let Some(cert) = self.cache.lock().await.get(host, generation) {
            debug!(host, "Certificate cache hit");
            return Ok(cert);
        }

        let provider = Arc::clone(&*self.provider.read().await);
        let permit = Arc::clone(&self.workers)
            .acquire_owned()
            .await
            .map_err(|_| ProxyError::cert_generation(host, "certificate workers shut down"))?;

        let owned_host = host.to_string();
        let issued = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            provider.issue(&owned_host)
        })
        .await
        .map_err(|e| ProxyError::cert_generation(host, e.to_string()))??;
        let issued = Arc::new(issued);

        if self.root_generation.load(Ordering::Acquire) == generation {
            let evicted =
                self.cache
                    .lock()
                    .await
                    .insert(host.to_string(), Arc::clone(&issued), generation);
            if let Some(evicted) = evicted {
                debug!(host, evicted = %evicted, "Certificate cache full, evicted LRU host");
            }
        }

        Ok(issued)
    }

    /// Swap the signing root; every cached leaf becomes stale
    pub async fn replace_provider(&self, provider: Arc<dyn CertificateProvider>) {
        let mut current = self.provider.write().await;
        *current = provider;
        self.root_generation.fetch_add(1, Ordering::AcqRel);
        self.cache.lock().await.clear();
        info!("Certificate root replaced, cache invalidated");
    }

    pub fn root_generation(&self) -> u64 {
        self.root_generation.load(Ordering::Acquire)
    }

    /// `(entries, capacity)`
    pub async fn cache_stats(&self) -> (usize, usize) {
        let cache = self.cache.lock().await;
        (cache.len(), cache.capacity())
    }

    pub async fn is_cached(&self, host: &str) -> bool {
        self.cache.lock().await.contains(host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_identifier_parsing() {
        assert!(matches!(
            HostIdentifier::from_hostname("192.168.1.1"),
            HostIdentifier::IpAddress(_)
        ));
        assert!(matches!(
            HostIdentifier::from_hostname("::1"),
            HostIdentifier::IpAddress(_)
        ));
        assert_eq!(
            HostIdentifier::from_hostname("Example.COM"),
            HostIdentifier::Domain("example.com".to_string())
        );
    }

    #[test]
    fn test_issue_chains_to_root() {
        let root = RootAuthority::generate("test root").unwrap();
        let issued = root.issue("example.com").unwrap();

        assert_eq!(issued.host(), "example.com");
        assert_eq!(issued.cert_chain().len(), 2);
        assert_eq!(&issued.cert_chain()[1], root.cert_der());
        assert!(matches!(issued.private_key(), PrivateKeyDer::Pkcs8(_)));
    }

    #[test]
    fn test_issue_for_ip_address() {
        let root = RootAuthority::generate("test root").unwrap();
        assert!(root.issue("127.0.0.1").is_ok());
    }

    #[test]
    fn test_root_pem_roundtrip() {
        let root = RootAuthority::generate("pem root").unwrap();
        let loaded = RootAuthority::from_pem(&root.cert_pem(), &root.key_pem()).unwrap();
        assert!(loaded.issue("example.com").is_ok());
    }

    #[test]
    fn test_serial_numbers_differ() {
        assert_ne!(generate_serial_number(), generate_serial_number());
    }
}
