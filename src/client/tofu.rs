//! Trust-on-first-use certificate pinning.
//!
//! The first certificate a host presents is pinned by its SHA-256
//! fingerprint. Later connections must present the same certificate until the
//! pinned one expires, at which point a new certificate is accepted silently.
//!
//! The store is a JSON Lines file. Each change appends one record and later
//! records override earlier ones, so an update never rewrites the file:
//!
//! ```text
//! {"op":"trust","host":"example.org","fingerprint":"3f1c…","first_seen":"2025-06-01T12:00:00Z","expires":"2026-06-01T12:00:00Z"}
//! {"op":"forget","host":"example.org"}
//! ```

use chrono::{DateTime, Utc};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, DigitallySignedStruct, SignatureScheme};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, info, warn};
use x509_cert::der::Decode;

/// The SHA-256 fingerprint of a DER-encoded certificate, as lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint a DER-encoded certificate.
    pub fn of(der: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(der)))
    }

    /// The fingerprint as hex.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the trust manager needs to know about a certificate a peer presented.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCertificate {
    /// Fingerprint of the leaf certificate.
    pub fingerprint: Fingerprint,
    /// The certificate's NotAfter, when it could be decoded.
    pub not_after: Option<DateTime<Utc>>,
}

impl PeerCertificate {
    /// Fingerprint a DER-encoded certificate and read its expiry.
    pub fn from_der(der: &[u8]) -> Self {
        let not_after = x509_cert::Certificate::from_der(der).ok().and_then(|certificate| {
            let expiry = certificate.tbs_certificate.validity.not_after.to_unix_duration();
            DateTime::from_timestamp(i64::try_from(expiry.as_secs()).ok()?, 0)
        });

        Self { fingerprint: Fingerprint::of(der), not_after }
    }
}

/// A pinned certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedCertificate {
    /// The host the certificate is pinned for.
    pub host: String,
    /// Fingerprint of the pinned certificate.
    pub fingerprint: Fingerprint,
    /// When the certificate was first accepted.
    pub first_seen: DateTime<Utc>,
    /// When the pinned certificate stops being valid. `None` pins it forever.
    pub expires: Option<DateTime<Utc>>,
}

impl TrustedCertificate {
    /// Whether the pinned certificate's validity window has elapsed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|expires| expires <= now)
    }
}

/// One line of the trust store file.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum TrustRecord {
    Trust(TrustedCertificate),
    Forget { host: String },
}

/// The result of a successful TOFU verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TofuResult {
    /// The host is known and the certificate matches.
    Match,
    /// The host was unknown and has just been learned.
    New,
    /// The pinned certificate had expired and has been replaced.
    Renewed,
}

impl fmt::Display for TofuResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Match => "match",
            Self::New => "new",
            Self::Renewed => "renewed",
        })
    }
}

/// An error reading or writing the trust store file.
#[derive(Debug, Error)]
pub enum TrustStoreError {
    /// The file could not be read or written.
    #[error("trust store I/O error on {}: {source}", .path.display())]
    Io {
        /// The file involved.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: io::Error,
    },
    /// A line of the file is not a valid record.
    #[error("invalid trust store record at {}:{line}: {source}", .path.display())]
    Parse {
        /// The file involved.
        path: PathBuf,
        /// One-based line number.
        line: usize,
        /// The underlying error.
        #[source]
        source: serde_json::Error,
    },
    /// A record could not be encoded.
    #[error("failed to encode trust store record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Why a certificate was refused.
#[derive(Debug, Error)]
pub enum TrustError {
    /// The host is pinned to a different, unexpired certificate.
    #[error("certificate for {host} does not match the pinned fingerprint (pinned {expected}, presented {presented})")]
    Mismatch {
        /// The host that was contacted.
        host: String,
        /// The pinned fingerprint.
        expected: Fingerprint,
        /// The fingerprint that was presented.
        presented: Fingerprint,
    },
    /// The decision could not be persisted.
    #[error(transparent)]
    Store(#[from] TrustStoreError),
}

/// A trust-on-first-use (TOFU) store for hostnames and their certificate fingerprints.
///
/// Hosts are compared case-insensitively. The store is shared between
/// concurrent transactions. Each decision holds the store lock from lookup
/// until the new record is on disk, so two first connections to the same
/// host cannot pin different certificates.
///
/// Methods that change the store write and `fsync` the backing file on the
/// calling thread. Async callers should run them on a blocking thread, as
/// [`Client`](crate::Client) does with `spawn_blocking`, or a slow disk
/// stalls the runtime worker and the transaction deadline with it.
#[derive(Debug)]
pub struct TrustStore {
    path: Option<PathBuf>,
    known_hosts: Mutex<HashMap<String, TrustedCertificate>>,
}

impl TrustStore {
    /// A store that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self { path: None, known_hosts: Mutex::new(HashMap::new()) }
    }

    /// Open a store backed by `path`, loading it if the file exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, TrustStoreError> {
        let path = path.into();
        let known_hosts = load_records(&path)?;
        info!(path = %path.display(), hosts = known_hosts.len(), "loaded trust store");

        Ok(Self { path: Some(path), known_hosts: Mutex::new(known_hosts) })
    }

    /// The backing file, `None` for an in-memory store.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, TrustedCertificate>> {
        self.known_hosts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The pinned certificate for `host`.
    pub fn get(&self, host: &str) -> Option<TrustedCertificate> {
        self.lock().get(&host_key(host)).cloned()
    }

    /// Every pinned certificate, sorted by host.
    pub fn entries(&self) -> Vec<TrustedCertificate> {
        let mut entries: Vec<_> = self.lock().values().cloned().collect();
        entries.sort_by(|a, b| a.host.cmp(&b.host));
        entries
    }

    /// Number of pinned hosts.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no host is pinned.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Decide whether `certificate` is acceptable for `host` without changing the store.
    ///
    /// `New` and `Renewed` here mean the certificate would be learned by
    /// [`verify_or_learn`](Self::verify_or_learn).
    pub fn check(
        &self,
        host: &str,
        certificate: &PeerCertificate,
        now: DateTime<Utc>,
    ) -> Result<TofuResult, TrustError> {
        decide(&self.lock(), &host_key(host), certificate, now)
    }

    /// Check `certificate` against the pin for `host`, learning it if the host is unknown
    /// or its pinned certificate has expired.
    ///
    /// A new pin is written to disk before this returns.
    pub fn verify_or_learn(
        &self,
        host: &str,
        certificate: &PeerCertificate,
        now: DateTime<Utc>,
    ) -> Result<TofuResult, TrustError> {
        let host = host_key(host);
        let mut known_hosts = self.lock();

        let result = decide(&known_hosts, &host, certificate, now)?;
        if result == TofuResult::Match {
            return Ok(result);
        }

        let entry = TrustedCertificate {
            host: host.clone(),
            fingerprint: certificate.fingerprint.clone(),
            first_seen: now,
            expires: certificate.not_after,
        };
        self.append(&TrustRecord::Trust(entry.clone()))?;
        known_hosts.insert(host.clone(), entry);

        info!(host = %host, fingerprint = %certificate.fingerprint, %result, "pinned certificate");
        Ok(result)
    }

    /// Remove the pin for `host`. Returns whether there was one.
    pub fn forget(&self, host: &str) -> Result<bool, TrustStoreError> {
        let host = host_key(host);
        let mut known_hosts = self.lock();

        if !known_hosts.contains_key(&host) {
            return Ok(false);
        }

        self.append(&TrustRecord::Forget { host: host.clone() })?;
        known_hosts.remove(&host);
        info!(host = %host, "forgot pinned certificate");

        Ok(true)
    }

    /// Rewrite the backing file with one record per pinned host.
    ///
    /// Writes a temporary file and renames it over the store, so a crash
    /// leaves either the old or the new file.
    pub fn compact(&self) -> Result<(), TrustStoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let known_hosts = self.lock();

        let mut temp_path = path.clone().into_os_string();
        temp_path.push(".tmp");
        let temp_path = PathBuf::from(temp_path);

        let mut contents = String::new();
        let mut entries: Vec<_> = known_hosts.values().collect();
        entries.sort_by(|a, b| a.host.cmp(&b.host));
        for entry in entries {
            contents.push_str(&serde_json::to_string(&TrustRecord::Trust(entry.clone()))?);
            contents.push('\n');
        }

        let io_error = |source| TrustStoreError::Io { path: path.clone(), source };
        fs::write(&temp_path, contents).map_err(io_error)?;
        fs::rename(&temp_path, path).map_err(io_error)?;
        debug!(path = %path.display(), hosts = known_hosts.len(), "compacted trust store");

        Ok(())
    }

    fn append(&self, record: &TrustRecord) -> Result<(), TrustStoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let line = serde_json::to_string(record)?;
        let io_error = |source| TrustStoreError::Io { path: path.clone(), source };

        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_error)?;
        }

        let mut file = OpenOptions::new().create(true).append(true).open(path).map_err(io_error)?;
        writeln!(file, "{line}").map_err(io_error)?;
        file.sync_data().map_err(io_error)?;

        Ok(())
    }
}

fn host_key(host: &str) -> String {
    host.to_ascii_lowercase()
}

fn decide(
    known_hosts: &HashMap<String, TrustedCertificate>,
    host: &str,
    certificate: &PeerCertificate,
    now: DateTime<Utc>,
) -> Result<TofuResult, TrustError> {
    match known_hosts.get(host) {
        None => Ok(TofuResult::New),
        Some(known) if known.fingerprint == certificate.fingerprint => Ok(TofuResult::Match),
        Some(known) if known.is_expired(now) => Ok(TofuResult::Renewed),
        Some(known) => {
            warn!(
                host,
                expected = %known.fingerprint,
                presented = %certificate.fingerprint,
                "certificate does not match the pinned fingerprint"
            );
            Err(TrustError::Mismatch {
                host: host.to_string(),
                expected: known.fingerprint.clone(),
                presented: certificate.fingerprint.clone(),
            })
        }
    }
}

fn load_records(path: &Path) -> Result<HashMap<String, TrustedCertificate>, TrustStoreError> {
    let mut known_hosts = HashMap::new();
    let io_error = |source| TrustStoreError::Io { path: path.to_path_buf(), source };

    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(known_hosts),
        Err(e) => return Err(io_error(e)),
    };

    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(io_error)?;
        if line.trim().is_empty() {
            continue;
        }

        let record = serde_json::from_str(&line).map_err(|source| TrustStoreError::Parse {
            path: path.to_path_buf(),
            line: index + 1,
            source,
        })?;

        match record {
            TrustRecord::Trust(entry) => {
                known_hosts.insert(host_key(&entry.host), entry);
            }
            TrustRecord::Forget { host } => {
                known_hosts.remove(&host_key(&host));
            }
        }
    }

    Ok(known_hosts)
}

/// A TOFU `ServerCertVerifier` for TLS connections.
///
/// One verifier is built per connection. It is the only certificate check:
/// no CA roots are consulted. Handshake signatures are still verified, so the
/// peer must hold the private key of the certificate it presents.
///
/// The verifier only decides. A certificate that would be learned is kept
/// aside until the handshake has finished; see [`take_pending`](Self::take_pending).
#[derive(Debug)]
pub struct TofuVerifier {
    host: String,
    store: Arc<TrustStore>,
    provider: Arc<CryptoProvider>,
    failure: Mutex<Option<TrustError>>,
    pending: Mutex<Option<(PeerCertificate, DateTime<Utc>)>>,
}

impl TofuVerifier {
    /// Create a verifier that checks certificates for `host` against `store`.
    pub fn new(host: impl Into<String>, store: Arc<TrustStore>, provider: Arc<CryptoProvider>) -> Self {
        Self {
            host: host.into(),
            store,
            provider,
            failure: Mutex::new(None),
            pending: Mutex::new(None),
        }
    }

    /// The trust failure behind a rejected handshake, if there was one.
    pub fn take_failure(&self) -> Option<TrustError> {
        self.failure.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// The accepted certificate and the time it was seen, when it still has to be pinned.
    ///
    /// Pass it to [`TrustStore::verify_or_learn`] once the handshake has
    /// succeeded, so a peer that cannot prove it owns the key is never pinned.
    pub fn take_pending(&self) -> Option<(PeerCertificate, DateTime<Utc>)> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

impl ServerCertVerifier for TofuVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let certificate = PeerCertificate::from_der(end_entity.as_ref());
        let now = i64::try_from(now.as_secs())
            .ok()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .unwrap_or_else(Utc::now);

        match self.store.check(&self.host, &certificate, now) {
            Ok(result) => {
                debug!(host = %self.host, %result, "accepted certificate");
                if result != TofuResult::Match {
                    *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = Some((certificate, now));
                }
                Ok(ServerCertVerified::assertion())
            }
            Err(error) => {
                let rustls_error = match &error {
                    TrustError::Mismatch { .. } => {
                        rustls::Error::InvalidCertificate(CertificateError::ApplicationVerificationFailure)
                    }
                    TrustError::Store(e) => rustls::Error::General(e.to_string()),
                };
                *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(error);
                Err(rustls_error)
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}
