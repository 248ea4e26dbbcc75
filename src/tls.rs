//! TLS certificate store with SNI selection (spec §3 "SSLCertificate",
//! §4.6). Grounded on `webdavd.c`'s `loadSSLCertificate`/
//! `findCertificateForHost`/`sslSNICallback`: certificates are sorted by
//! hostname (taken from the certificate's subject alternative names), and
//! the SNI hook picks by exact match, falling back to the first entry.

use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::crypto::ring::sign::any_supported_type;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls_pemfile::{certs, private_key};

use crate::config::SslCertConfig;
use crate::errors::ConfigError;

struct Entry {
    hostname: String,
    key: Arc<CertifiedKey>,
}

/// Holds every loaded `<ssl-cert>` entry, sorted by hostname for a
/// deterministic lookup order (exact match wins; first entry is the
/// fallback when nothing matches or SNI supplied no hostname at all).
pub struct CertStore {
    entries: Vec<Entry>,
}

impl CertStore {
    pub fn load(configs: &[SslCertConfig]) -> Result<CertStore, ConfigError> {
        let mut entries = Vec::new();
        for cfg in configs {
            let key = load_certified_key(cfg)?;
            let hostname = primary_hostname(&key, cfg)?;
            entries.push(Entry { hostname, key: Arc::new(key) });
        }
        entries.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        Ok(CertStore { entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for CertStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertStore")
            .field("hostnames", &self.entries.iter().map(|e| &e.hostname).collect::<Vec<_>>())
            .finish()
    }
}

impl ResolvesServerCert for CertStore {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        if self.entries.is_empty() {
            return None;
        }
        if let Some(name) = client_hello.server_name() {
            if let Ok(idx) = self.entries.binary_search_by(|e| e.hostname.as_str().cmp(name)) {
                return Some(self.entries[idx].key.clone());
            }
        }
        Some(self.entries[0].key.clone())
    }
}

fn load_certified_key(cfg: &SslCertConfig) -> Result<CertifiedKey, ConfigError> {
    let mut chain = load_certs(&cfg.certificate)?;
    for extra in &cfg.chain {
        chain.extend(load_certs(extra)?);
    }
    let key = load_private_key(&cfg.key)?;
    let signing_key = any_supported_type(&key)
        .map_err(|e| ConfigError::Malformed(format!("unsupported key in {}: {e}", cfg.key.display())))?;
    Ok(CertifiedKey::new(chain, signing_key))
}

fn load_certs(path: &Path) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>, ConfigError> {
    let file = std::fs::File::open(path)?;
    let mut reader = BufReader::new(file);
    certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConfigError::Malformed(format!("could not load {}: {e}", path.display())))
}

fn load_private_key(path: &Path) -> Result<rustls::pki_types::PrivateKeyDer<'static>, ConfigError> {
    let file = std::fs::File::open(path)?;
    let mut reader = BufReader::new(file);
    private_key(&mut reader)
        .map_err(|e| ConfigError::Malformed(format!("could not load {}: {e}", path.display())))?
        .ok_or_else(|| ConfigError::Malformed(format!("no private key found in {}", path.display())))
}

/// Extract the hostname to index this certificate under, from its subject
/// alternative names (mirrors `loadSSLCertificate`'s SAN scan). Falls back
/// to the certificate file's stem if no SAN can be parsed, rather than
/// failing outright -- a self-signed test cert without a SAN should still load.
fn primary_hostname(key: &CertifiedKey, cfg: &SslCertConfig) -> Result<String, ConfigError> {
    if let Some(leaf) = key.cert.first() {
        if let Ok((_, parsed)) = x509_parser::parse_x509_certificate(leaf.as_ref()) {
            if let Ok(Some(san)) = parsed.subject_alternative_name() {
                for name in &san.value.general_names {
                    if let x509_parser::extensions::GeneralName::DNSName(dns) = name {
                        return Ok(dns.to_string());
                    }
                }
            }
        }
    }
    log::warn!(
        "no subject alternative name found in {}, indexing by file stem",
        cfg.certificate.display()
    );
    Ok(cfg
        .certificate
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string())
}
