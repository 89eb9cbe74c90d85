//! The in-memory certificate registry: single authority for certificate
//! state, reconciling persisted metadata (authoritative configuration) with
//! the filesystem (authoritative content).
//!
//! Locking: one exclusive lock guards the map; parsing and crypto run
//! outside it. Per-fingerprint mutexes serialize lifecycle operations on the
//! same certificate.

use chrono::{DateTime, Utc};
use ck_common::{EngineError, EngineResult, fs as ckfs};
use ck_crypto::parse::CERT_EXTENSIONS;
use ck_crypto::{CryptoProvider, ParsedCertificate};
use ck_vault::PassphraseVault;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::SystemTime;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock, broadcast};
use tracing::{debug, info, warn};

use crate::entity::{ApiCertificateView, CertificateEntity};
use crate::metadata::{MetadataStore, RegistryFile};
use crate::resolver;
use crate::types::{ChangeEvent, ChangeKind, normalize_fingerprint};

struct RegistryCache {
    certificates: BTreeMap<String, CertificateEntity>,
    /// Millis of the last successful full load; 0 = cache invalid.
    last_refresh_at: u64,
    /// Fingerprints flagged dirty, refreshed lazily.
    pending_changes: BTreeSet<String>,
    /// mtime of the metadata file at last load.
    config_mtime: Option<SystemTime>,
}

pub struct CertificateRegistry {
    certs_dir: PathBuf,
    store: MetadataStore,
    crypto: CryptoProvider,
    vault: Arc<PassphraseVault>,
    inner: RwLock<RegistryCache>,
    cert_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    events: broadcast::Sender<ChangeEvent>,
}

impl CertificateRegistry {
    pub fn new(
        certs_dir: impl Into<PathBuf>,
        config_dir: &Path,
        crypto: CryptoProvider,
        vault: Arc<PassphraseVault>,
    ) -> EngineResult<Self> {
        let certs_dir = certs_dir.into();
        fs::create_dir_all(&certs_dir)?;
        fs::create_dir_all(config_dir)?;

        Ok(Self {
            certs_dir,
            store: MetadataStore::new(config_dir),
            crypto,
            vault,
            inner: RwLock::new(RegistryCache {
                certificates: BTreeMap::new(),
                last_refresh_at: 0,
                pending_changes: BTreeSet::new(),
                config_mtime: None,
            }),
            cert_locks: StdMutex::new(HashMap::new()),
            events: broadcast::channel(64).0,
        })
    }

    pub fn certs_dir(&self) -> &Path {
        &self.certs_dir
    }

    pub fn crypto(&self) -> CryptoProvider {
        self.crypto
    }

    pub fn vault(&self) -> Arc<PassphraseVault> {
        Arc::clone(&self.vault)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events.subscribe()
    }

    // ── Cache protocol ──────────────────────────────────────────

    pub async fn is_cache_valid(&self) -> bool {
        let cache = self.inner.read().await;
        cache.last_refresh_at > 0 && self.store.mtime() == cache.config_mtime
    }

    /// `None` drops the whole cache; a fingerprint marks one entry dirty.
    pub async fn invalidate(&self, fingerprint: Option<&str>) {
        let mut cache = self.inner.write().await;
        match fingerprint {
            None => {
                cache.last_refresh_at = 0;
                cache.pending_changes.clear();
            }
            Some(fp) => {
                cache.pending_changes.insert(normalize_fingerprint(fp));
            }
        }
    }

    /// Record an external or internal change. Creations and deletions make
    /// the on-disk file set suspect, so they drop the whole cache.
    pub async fn notify_changed(&self, fingerprint: &str, kind: ChangeKind) {
        let fp = normalize_fingerprint(fingerprint);
        {
            let mut cache = self.inner.write().await;
            cache.pending_changes.insert(fp.clone());
            if matches!(kind, ChangeKind::Create | ChangeKind::Delete) {
                cache.last_refresh_at = 0;
            }
        }
        let _ = self.events.send(ChangeEvent {
            fingerprint: fp,
            kind,
        });
    }

    // ── Load / reconcile ────────────────────────────────────────

    /// Bring the registry in sync with metadata and filesystem.
    ///
    /// With a valid cache and `force=false` only the pending fingerprints
    /// are re-parsed. Otherwise: load metadata, scan `certs_dir`, merge,
    /// refresh key-encryption flags, resolve CA links and persist when the
    /// effective state differs from what was stored.
    pub async fn load_all(&self, force: bool) -> EngineResult<()> {
        if !force && self.is_cache_valid().await {
            return self.refresh_pending().await;
        }

        let stored = self.store.load()?;
        let discovered = discover(&self.certs_dir, &self.crypto);

        // Which fingerprint now owns each discovered cert file: a stale
        // entry whose path was re-claimed by different content must go.
        let claimed: HashMap<PathBuf, String> = discovered
            .iter()
            .filter_map(|d| {
                d.paths
                    .get("crt")
                    .map(|p| (p.clone(), d.parsed.fingerprint.clone()))
            })
            .collect();

        // Merge under the exclusive lock; parsing already happened.
        let key_files: Vec<(String, PathBuf)> = {
            let mut cache = self.inner.write().await;

            for (fp, entity) in &stored.certificates {
                // Preserve existing in-memory instances; they are at least
                // as fresh as the stored record.
                cache
                    .certificates
                    .entry(fp.clone())
                    .or_insert_with(|| entity.clone());
            }

            for found in discovered {
                match cache.certificates.get_mut(&found.parsed.fingerprint) {
                    Some(existing) => {
                        existing.refresh_from_parsed(&found.parsed);
                        for (role, path) in found.paths {
                            existing.paths.insert(role, path);
                        }
                    }
                    None => {
                        let entity = CertificateEntity::from_parsed(
                            found.name,
                            &found.parsed,
                            found.paths,
                        );
                        cache
                            .certificates
                            .insert(entity.fingerprint.clone(), entity);
                    }
                }
            }

            cache.certificates.retain(|fp, entity| {
                let replaced = entity
                    .cert_path()
                    .and_then(|p| claimed.get(&p))
                    .is_some_and(|owner| owner != fp);
                if replaced {
                    info!(fingerprint = %fp, name = %entity.name, "certificate file replaced, dropping stale entry");
                }
                !replaced
            });

            cache
                .certificates
                .values()
                .filter_map(|c| c.key_path().map(|p| (c.fingerprint.clone(), p)))
                .collect()
        };

        // Key-encryption probing touches the filesystem: outside the lock.
        let mut encrypted = HashMap::new();
        for (fp, key_path) in key_files {
            if !key_path.exists() {
                continue;
            }
            match self.crypto.is_key_encrypted(&key_path) {
                Ok(flag) => {
                    encrypted.insert(fp, flag);
                }
                Err(e) => warn!(key = %key_path.display(), error = %e, "cannot probe key encryption"),
            }
        }

        let file_model = {
            let mut cache = self.inner.write().await;
            for (fp, flag) in encrypted {
                if let Some(entity) = cache.certificates.get_mut(&fp) {
                    entity.needs_passphrase = flag;
                }
            }
            resolver::resolve_all(&mut cache.certificates);
            RegistryFile {
                certificates: cache.certificates.clone(),
                ..RegistryFile::default()
            }
        };

        if file_model.certificates != stored.certificates {
            let bytes = MetadataStore::serialize(&file_model)?;
            self.store.commit(&bytes)?;
        }

        let mut cache = self.inner.write().await;
        cache.config_mtime = self.store.mtime();
        cache.last_refresh_at = ckfs::now_millis();
        cache.pending_changes.clear();
        info!(
            certificates = cache.certificates.len(),
            "registry loaded"
        );
        Ok(())
    }

    /// Lazily re-parse only the entries flagged dirty.
    async fn refresh_pending(&self) -> EngineResult<()> {
        let targets: Vec<(String, Option<PathBuf>)> = {
            let cache = self.inner.read().await;
            cache
                .pending_changes
                .iter()
                .map(|fp| {
                    (
                        fp.clone(),
                        cache.certificates.get(fp).and_then(|c| c.cert_path()),
                    )
                })
                .collect()
        };
        if targets.is_empty() {
            return Ok(());
        }

        let mut parsed_results: Vec<(String, ParsedCertificate, Option<bool>)> = Vec::new();
        for (fp, cert_path) in targets {
            let Some(path) = cert_path else {
                debug!(fingerprint = %fp, "pending entry has no file, keeping metadata");
                continue;
            };
            if !path.exists() {
                // Files vanished: the entity keeps its prior metadata until
                // explicitly deleted.
                debug!(fingerprint = %fp, "certificate file missing, keeping metadata");
                continue;
            }
            match self.crypto.parse(&path) {
                Ok(parsed) => {
                    let key_encrypted = self
                        .inner
                        .read()
                        .await
                        .certificates
                        .get(&fp)
                        .and_then(|c| c.key_path())
                        .filter(|p| p.exists())
                        .and_then(|p| self.crypto.is_key_encrypted(&p).ok());
                    parsed_results.push((fp, parsed, key_encrypted));
                }
                Err(e) => warn!(fingerprint = %fp, error = %e, "refresh parse failed, skipping"),
            }
        }

        {
            let mut cache = self.inner.write().await;
            for (fp, parsed, key_encrypted) in parsed_results {
                let Some(mut entity) = cache.certificates.remove(&fp) else {
                    continue;
                };
                entity.refresh_from_parsed(&parsed);
                if let Some(flag) = key_encrypted {
                    entity.needs_passphrase = flag;
                }
                // The file may have been replaced: re-key the map entry.
                cache
                    .certificates
                    .insert(entity.fingerprint.clone(), entity);
            }
            resolver::resolve_all(&mut cache.certificates);
            cache.pending_changes.clear();
        }

        self.persist().await
    }

    // ── Accessors ───────────────────────────────────────────────

    /// Look up by fingerprint (prefix/case tolerant) or by name.
    pub async fn get(&self, key: &str) -> Option<CertificateEntity> {
        let cache = self.inner.read().await;
        resolve_key(&cache.certificates, key)
            .and_then(|fp| cache.certificates.get(&fp))
            .cloned()
    }

    pub async fn get_all(&self) -> Vec<CertificateEntity> {
        self.inner.read().await.certificates.values().cloned().collect()
    }

    pub async fn get_cas(&self) -> Vec<CertificateEntity> {
        self.inner
            .read()
            .await
            .certificates
            .values()
            .filter(|c| c.is_ca)
            .cloned()
            .collect()
    }

    pub async fn due_for_renewal(&self) -> Vec<CertificateEntity> {
        let now = Utc::now();
        self.inner
            .read()
            .await
            .certificates
            .values()
            .filter(|c| c.is_due_for_renewal(now))
            .cloned()
            .collect()
    }

    pub async fn get_view(&self, key: &str) -> Option<ApiCertificateView> {
        let entity = self.get(key).await?;
        Some(self.build_view(&entity))
    }

    pub async fn get_all_views(&self) -> Vec<ApiCertificateView> {
        self.get_all()
            .await
            .iter()
            .map(|e| self.build_view(e))
            .collect()
    }

    fn build_view(&self, entity: &CertificateEntity) -> ApiCertificateView {
        let days = entity.days_until_expiry();
        ApiCertificateView {
            common_name: entity.common_name(),
            issuer_common_name: entity.issuer_common_name(),
            days_until_expiry: days,
            expired: days < 0,
            expiring_soon: days >= 0
                && days < i64::from(entity.config.renew_days_before_expiry),
            has_passphrase: self.vault.has(&entity.fingerprint),
            modification_time: entity
                .cert_path()
                .and_then(|p| fs::metadata(p).and_then(|m| m.modified()).ok())
                .map(DateTime::<Utc>::from),
            certificate: entity.clone(),
        }
    }

    /// Reverse lookup for the filesystem watcher.
    pub async fn fingerprint_for_path(&self, path: &Path) -> Option<String> {
        let cache = self.inner.read().await;
        cache
            .certificates
            .values()
            .find(|c| c.paths.values().any(|p| p == path))
            .map(|c| c.fingerprint.clone())
    }

    // ── Mutations ───────────────────────────────────────────────

    /// Insert or replace an entity under its fingerprint, then persist.
    pub async fn upsert(&self, entity: CertificateEntity) -> EngineResult<()> {
        {
            let mut cache = self.inner.write().await;
            cache
                .certificates
                .insert(entity.fingerprint.clone(), entity);
        }
        self.persist().await
    }

    /// Apply a closure to one entity under the exclusive lock, then persist.
    pub async fn update_entity<F>(&self, key: &str, mutate: F) -> EngineResult<CertificateEntity>
    where
        F: FnOnce(&mut CertificateEntity),
    {
        let updated = {
            let mut cache = self.inner.write().await;
            let fp = resolve_key(&cache.certificates, key)
                .ok_or_else(|| EngineError::NotFound(format!("certificate {key}")))?;
            let entity = cache
                .certificates
                .get_mut(&fp)
                .ok_or_else(|| EngineError::NotFound(format!("certificate {key}")))?;
            mutate(entity);
            entity.clone()
        };
        self.persist().await?;
        Ok(updated)
    }

    /// Swap the registry key after a renewal changed the fingerprint: the
    /// old entry goes and the new one lands in one critical section.
    pub async fn replace(
        &self,
        old_fingerprint: &str,
        entity: CertificateEntity,
    ) -> EngineResult<()> {
        {
            let mut cache = self.inner.write().await;
            cache
                .certificates
                .remove(&normalize_fingerprint(old_fingerprint));
            cache
                .certificates
                .insert(entity.fingerprint.clone(), entity);
        }
        self.persist().await
    }

    /// Remove a certificate from the registry, optionally deleting its live
    /// files. Returns the removed entity.
    pub async fn remove(&self, key: &str, delete_files: bool) -> EngineResult<CertificateEntity> {
        let removed = {
            let mut cache = self.inner.write().await;
            let fp = resolve_key(&cache.certificates, key)
                .ok_or_else(|| EngineError::NotFound(format!("certificate {key}")))?;
            cache.certificates.remove(&fp).ok_or_else(|| {
                EngineError::NotFound(format!("certificate {key}"))
            })?
        };

        if delete_files {
            for path in removed.paths.values() {
                if path.exists() {
                    if let Err(e) = fs::remove_file(path) {
                        warn!(path = %path.display(), error = %e, "could not delete certificate file");
                    }
                }
            }
        }

        self.persist().await?;
        Ok(removed)
    }

    /// Persist current state: serialize outside any lock, commit (the
    /// rename) under the exclusive lock.
    pub async fn persist(&self) -> EngineResult<()> {
        let file_model = {
            let cache = self.inner.read().await;
            RegistryFile {
                certificates: cache.certificates.clone(),
                ..RegistryFile::default()
            }
        };
        let bytes = MetadataStore::serialize(&file_model)?;

        let mut cache = self.inner.write().await;
        if let Err(e) = self.store.commit(&bytes) {
            // In-memory state is now ahead of disk; the next successful
            // save reconciles.
            warn!(error = %e, "metadata save failed, registry state not persisted");
            return Err(e);
        }
        cache.config_mtime = self.store.mtime();
        Ok(())
    }

    // ── Per-fingerprint serialization ───────────────────────────

    fn cert_lock(&self, fingerprint: &str) -> Arc<Mutex<()>> {
        let mut locks = self.cert_locks.lock().expect("cert lock table poisoned");
        Arc::clone(
            locks
                .entry(normalize_fingerprint(fingerprint))
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Serialize lifecycle operations on one certificate.
    pub async fn lock_cert(&self, fingerprint: &str) -> OwnedMutexGuard<()> {
        self.cert_lock(fingerprint).lock_owned().await
    }

    /// Non-blocking variant: `Conflict` when an operation is already
    /// running for this certificate.
    pub fn try_lock_cert(&self, fingerprint: &str) -> EngineResult<OwnedMutexGuard<()>> {
        self.cert_lock(fingerprint).try_lock_owned().map_err(|_| {
            EngineError::Conflict(format!(
                "another operation is running for {fingerprint}"
            ))
        })
    }
}

fn resolve_key(
    certificates: &BTreeMap<String, CertificateEntity>,
    key: &str,
) -> Option<String> {
    let normalized = normalize_fingerprint(key);
    if certificates.contains_key(&normalized) {
        return Some(normalized);
    }
    let name = key.trim();
    certificates
        .values()
        .find(|c| c.name.eq_ignore_ascii_case(name))
        .map(|c| c.fingerprint.clone())
}

// ── Discovery ───────────────────────────────────────────────────

struct DiscoveredCert {
    name: String,
    parsed: ParsedCertificate,
    paths: BTreeMap<String, PathBuf>,
}

fn discover(certs_dir: &Path, crypto: &CryptoProvider) -> Vec<DiscoveredCert> {
    let mut files = Vec::new();
    collect_cert_files(certs_dir, &mut files);
    files.sort();

    let mut found: Vec<DiscoveredCert> = Vec::new();
    for path in files {
        match crypto.parse(&path) {
            Ok(parsed) => {
                if found
                    .iter()
                    .any(|d| d.parsed.fingerprint == parsed.fingerprint)
                {
                    // Duplicate copy of an already discovered certificate
                    // (chain files etc.), first one wins.
                    debug!(path = %path.display(), "duplicate certificate content, skipping");
                    continue;
                }
                let name = if parsed.common_name.is_empty() {
                    path.file_stem()
                        .map(|s| s.to_string_lossy().to_string())
                        .unwrap_or_else(|| parsed.fingerprint.clone())
                } else {
                    parsed.common_name.clone()
                };
                let paths = associate_paths(&path);
                found.push(DiscoveredCert {
                    name,
                    parsed,
                    paths,
                });
            }
            // A single bad file must not abort discovery.
            Err(e) => warn!(path = %path.display(), error = %e, "skipping unparseable certificate file"),
        }
    }
    found
}

fn collect_cert_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let name = file_name.to_string_lossy();
        if name.starts_with('.') {
            continue;
        }
        let path = entry.path();
        if path.is_dir() {
            if name == "backups" || name == "archive" {
                continue;
            }
            collect_cert_files(&path, out);
        } else if path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| CERT_EXTENSIONS.contains(&ext))
        {
            out.push(path);
        }
    }
}

/// Associate sibling files to path roles by stem: `web.pem` picks up
/// `web.key`, `web.csr`, `web-chain.pem`, `web-fullchain.pem`, `web.p12`,
/// `web.der` when they exist.
fn associate_paths(cert_path: &Path) -> BTreeMap<String, PathBuf> {
    let mut paths = BTreeMap::new();
    paths.insert("crt".to_string(), cert_path.to_path_buf());

    let (Some(parent), Some(stem)) = (
        cert_path.parent(),
        cert_path.file_stem().map(|s| s.to_string_lossy().to_string()),
    ) else {
        return paths;
    };

    let candidates: [(&str, Vec<String>); 6] = [
        ("key", vec![format!("{stem}.key")]),
        ("csr", vec![format!("{stem}.csr")]),
        (
            "chain",
            vec![format!("{stem}-chain.pem"), format!("{stem}.chain.pem")],
        ),
        (
            "fullchain",
            vec![
                format!("{stem}-fullchain.pem"),
                format!("{stem}.fullchain.pem"),
            ],
        ),
        ("p12", vec![format!("{stem}.p12"), format!("{stem}.pfx")]),
        ("der", vec![format!("{stem}.der")]),
    ];

    for (role, names) in candidates {
        for name in names {
            let candidate = parent.join(&name);
            if candidate.exists() {
                paths.insert(role.to_string(), candidate);
                break;
            }
        }
    }

    paths
}
