use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::CaError;

const CA_DIR: &str = "ca";
const LEAF_DIR: &str = "certs";
const CA_CERT_FILE: &str = "ca.crt";
const CA_KEY_FILE: &str = "ca.key";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaStoreConfig {
    pub state_dir: PathBuf,
    pub common_name: String,
    pub organization: String,
    pub ca_validity_days: i64,
    pub leaf_validity_days: i64,
}

impl CaStoreConfig {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            common_name: "rpctap Root CA".to_string(),
            organization: "rpctap Proxy CA".to_string(),
            // The root is essentially permanent; leaves get a sanity bound.
            ca_validity_days: 365 * 100,
            leaf_validity_days: 3650,
        }
    }
}

/// A minted server credential: leaf + CA chain and the leaf private key.
pub struct LeafCredential {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
    pub chain_pem: String,
    pub key_pem: String,
}

struct CaMaterial {
    issuer: Issuer<'static, KeyPair>,
    cert_pem: String,
    cert_der: CertificateDer<'static>,
    key_pem: String,
}

/// Durable certificate authority. The root key pair lives under
/// `<state_dir>/ca/`, minted leaves under `<state_dir>/certs/`, so restarts
/// neither re-mint leaves nor invalidate the trust anchor the client
/// installed.
///
/// The root material and the leaf map sit behind separate locks, and signing
/// happens outside both, so concurrent handshakes for cached hosts never
/// queue behind an in-flight mint for a new one.
pub struct CaStore {
    config: CaStoreConfig,
    ca: Mutex<Arc<CaMaterial>>,
    leaves: Mutex<HashMap<String, Arc<LeafCredential>>>,
}

impl CaStore {
    /// Idempotently creates the on-disk layout and loads or generates the
    /// root CA. Calling this twice leaves the CA bytes on disk unchanged.
    pub fn ensure(config: CaStoreConfig) -> Result<Self, CaError> {
        fs::create_dir_all(config.state_dir.join(CA_DIR))?;
        fs::create_dir_all(config.state_dir.join(LEAF_DIR))?;

        let ca = load_or_generate_ca(&config)?;
        Ok(Self {
            config,
            ca: Mutex::new(Arc::new(ca)),
            leaves: Mutex::new(HashMap::new()),
        })
    }

    pub fn ca_cert_path(&self) -> PathBuf {
        self.config.state_dir.join(CA_DIR).join(CA_CERT_FILE)
    }

    pub fn ca_cert_pem(&self) -> Result<String, CaError> {
        let ca = self.ca.lock().map_err(|_| CaError::LockPoisoned)?;
        Ok(ca.cert_pem.clone())
    }

    /// Returns a credential for `host`, minting and persisting one if neither
    /// the in-memory cache nor the disk cache has it. A `host:port` input is
    /// reduced to the host. The leaf map lock is only held for the lookup and
    /// the insert; two racing first-time callers may both mint, the first
    /// insert wins, and both leaves chain to the same root.
    pub fn get_or_mint(&self, host: &str) -> Result<Arc<LeafCredential>, CaError> {
        let host = normalize_host(host);

        {
            let leaves = self.leaves.lock().map_err(|_| CaError::LockPoisoned)?;
            if let Some(cached) = leaves.get(&host) {
                return Ok(Arc::clone(cached));
            }
        }

        let (leaf, minted_with) = match self.load_leaf_from_disk(&host) {
            Some(loaded) => (Arc::new(loaded), None),
            None => {
                let ca = {
                    let ca = self.ca.lock().map_err(|_| CaError::LockPoisoned)?;
                    Arc::clone(&ca)
                };
                let minted = mint_leaf(&ca, &host, self.config.leaf_validity_days)?;
                self.persist_leaf(&host, &minted)?;
                (Arc::new(minted), Some(ca))
            }
        };

        // Same ca-then-leaves order as regenerate().
        let current_ca = self.ca.lock().map_err(|_| CaError::LockPoisoned)?;
        let mut leaves = self.leaves.lock().map_err(|_| CaError::LockPoisoned)?;
        if let Some(used) = &minted_with {
            if !Arc::ptr_eq(used, &current_ca) {
                // The root rotated mid-mint. Serve this connection with the
                // leaf it asked for, but keep it out of the invalidated cache.
                return Ok(leaf);
            }
        }
        Ok(Arc::clone(leaves.entry(host).or_insert(leaf)))
    }

    /// Removes every minted leaf, on disk and in memory. The root survives.
    pub fn clean_leaves(&self) -> Result<(), CaError> {
        let mut leaves = self.leaves.lock().map_err(|_| CaError::LockPoisoned)?;
        remove_dir_entries(&self.config.state_dir.join(LEAF_DIR))?;
        leaves.clear();
        Ok(())
    }

    /// Wipes leaves and the root, then generates a fresh CA. Both locks are
    /// held across the swap so no caller sees the new root alongside a stale
    /// leaf. `get_or_mint` never holds the two locks at once, so the nesting
    /// here cannot deadlock.
    pub fn regenerate(&self) -> Result<(), CaError> {
        let mut ca = self.ca.lock().map_err(|_| CaError::LockPoisoned)?;
        let mut leaves = self.leaves.lock().map_err(|_| CaError::LockPoisoned)?;
        remove_dir_entries(&self.config.state_dir.join(LEAF_DIR))?;
        remove_dir_entries(&self.config.state_dir.join(CA_DIR))?;

        let next = generate_ca(&self.config)?;
        persist_ca(&self.config, &next)?;
        *ca = Arc::new(next);
        leaves.clear();
        Ok(())
    }

    pub fn leaf_count(&self) -> usize {
        let dir = self.config.state_dir.join(LEAF_DIR);
        let Ok(entries) = fs::read_dir(dir) else {
            return 0;
        };
        entries
            .flatten()
            .filter(|entry| {
                entry
                    .path()
                    .extension()
                    .map(|ext| ext == "crt")
                    .unwrap_or(false)
            })
            .count()
    }

    fn leaf_paths(&self, host: &str) -> (PathBuf, PathBuf) {
        let dir = self.config.state_dir.join(LEAF_DIR);
        (
            dir.join(format!("{host}.crt")),
            dir.join(format!("{host}.key")),
        )
    }

    fn load_leaf_from_disk(&self, host: &str) -> Option<LeafCredential> {
        let (cert_path, key_path) = self.leaf_paths(host);
        let chain_pem = fs::read_to_string(cert_path).ok()?;
        let key_pem = fs::read_to_string(key_path).ok()?;

        let chain: Vec<CertificateDer<'static>> =
            CertificateDer::pem_slice_iter(chain_pem.as_bytes())
                .collect::<Result<_, _>>()
                .ok()?;
        if chain.is_empty() {
            return None;
        }
        let key = PrivateKeyDer::from_pem_slice(key_pem.as_bytes()).ok()?;

        Some(LeafCredential {
            chain,
            key,
            chain_pem,
            key_pem,
        })
    }

    fn persist_leaf(&self, host: &str, leaf: &LeafCredential) -> Result<(), CaError> {
        let (cert_path, key_path) = self.leaf_paths(host);
        fs::write(cert_path, leaf.chain_pem.as_bytes())?;
        write_key_file(&key_path, leaf.key_pem.as_bytes())?;
        Ok(())
    }
}

fn load_or_generate_ca(config: &CaStoreConfig) -> Result<CaMaterial, CaError> {
    let cert_path = config.state_dir.join(CA_DIR).join(CA_CERT_FILE);
    let key_path = config.state_dir.join(CA_DIR).join(CA_KEY_FILE);

    if cert_path.exists() && key_path.exists() {
        return load_ca(&cert_path, &key_path);
    }

    let generated = generate_ca(config)?;
    persist_ca(config, &generated)?;
    Ok(generated)
}

fn load_ca(cert_path: &Path, key_path: &Path) -> Result<CaMaterial, CaError> {
    let cert_pem = fs::read_to_string(cert_path)?;
    let key_pem = fs::read_to_string(key_path)?;

    let cert_der = CertificateDer::from_pem_slice(cert_pem.as_bytes()).map_err(|error| {
        CaError::InvalidMaterial(format!(
            "failed to parse CA certificate PEM from {}: {error}",
            cert_path.display()
        ))
    })?;
    let key = KeyPair::from_pem(&key_pem)?;
    let issuer = Issuer::from_ca_cert_der(&cert_der, key).map_err(|error| {
        CaError::InvalidMaterial(format!(
            "failed to rebuild issuer from {}: {error}",
            cert_path.display()
        ))
    })?;

    Ok(CaMaterial {
        issuer,
        cert_pem,
        cert_der,
        key_pem,
    })
}

fn generate_ca(config: &CaStoreConfig) -> Result<CaMaterial, CaError> {
    let key = KeyPair::generate()?;
    let key_pem = key.serialize_pem();

    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
    params.serial_number = Some(random_serial());
    params.not_before = OffsetDateTime::now_utc() - Duration::hours(24);
    params.not_after = OffsetDateTime::now_utc() + Duration::days(config.ca_validity_days);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
    ];

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, config.common_name.clone());
    dn.push(DnType::OrganizationName, config.organization.clone());
    params.distinguished_name = dn;

    let cert = params.self_signed(&key)?;
    let cert_pem = cert.pem();
    let cert_der = cert.der().clone();
    let issuer = Issuer::new(params, key);

    Ok(CaMaterial {
        issuer,
        cert_pem,
        cert_der,
        key_pem,
    })
}

fn persist_ca(config: &CaStoreConfig, ca: &CaMaterial) -> Result<(), CaError> {
    let dir = config.state_dir.join(CA_DIR);
    fs::create_dir_all(&dir)?;
    fs::write(dir.join(CA_CERT_FILE), ca.cert_pem.as_bytes())?;
    write_key_file(&dir.join(CA_KEY_FILE), ca.key_pem.as_bytes())?;
    Ok(())
}

fn mint_leaf(ca: &CaMaterial, host: &str, validity_days: i64) -> Result<LeafCredential, CaError> {
    let mut params = CertificateParams::new(Vec::<String>::new())?;
    params.is_ca = IsCa::NoCa;
    params.use_authority_key_identifier_extension = true;
    params.serial_number = Some(random_serial());
    // 24h of backdating tolerates client clock skew.
    params.not_before = OffsetDateTime::now_utc() - Duration::hours(24);
    params.not_after = OffsetDateTime::now_utc() + Duration::days(validity_days);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host.to_string());
    params.distinguished_name = dn;

    if let Ok(ip) = host.parse::<IpAddr>() {
        params.subject_alt_names.push(SanType::IpAddress(ip));
    } else {
        params
            .subject_alt_names
            .push(SanType::DnsName(host.try_into()?));
    }

    let leaf_key = KeyPair::generate()?;
    let cert = params.signed_by(&leaf_key, &ca.issuer)?;

    let chain_pem = format!("{}{}", cert.pem(), ca.cert_pem);
    let key_pem = leaf_key.serialize_pem();
    let chain = vec![cert.der().clone(), ca.cert_der.clone()];
    let key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));

    Ok(LeafCredential {
        chain,
        key,
        chain_pem,
        key_pem,
    })
}

fn random_serial() -> SerialNumber {
    SerialNumber::from_slice(Uuid::new_v4().as_bytes())
}

fn normalize_host(host: &str) -> String {
    let trimmed = strip_port(host);
    match trimmed.parse::<IpAddr>() {
        Ok(_) => trimmed.to_string(),
        Err(_) => trimmed.to_ascii_lowercase(),
    }
}

fn strip_port(host: &str) -> &str {
    if let Some(stripped) = host.strip_prefix('[') {
        // bracketed IPv6, with or without port
        if let Some(end) = stripped.find(']') {
            return &stripped[..end];
        }
    }
    match host.rsplit_once(':') {
        // a second colon means bare IPv6, not host:port
        Some((head, tail)) if !head.contains(':') && tail.parse::<u16>().is_ok() => head,
        _ => host,
    }
}

fn remove_dir_entries(dir: &Path) -> Result<(), CaError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(error) => return Err(error.into()),
    };
    for entry in entries.flatten() {
        fs::remove_file(entry.path())?;
    }
    Ok(())
}

#[cfg(unix)]
fn write_key_file(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(bytes)
}

#[cfg(not(unix))]
fn write_key_file(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    fs::write(path, bytes)
}
