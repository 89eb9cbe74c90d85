//! Create / renew / restore orchestration across the registry, crypto
//! provider, snapshot store, vault and deploy dispatcher.
//!
//! Crypto and bulk filesystem work runs on the blocking pool with
//! per-operation timeouts; registry locks are only held around the commit
//! steps. Operations on one certificate are serialized through the
//! registry's per-fingerprint mutex.

use ck_archive::{SnapshotEntry, SnapshotKind, SnapshotStore};
use ck_common::{EngineError, EngineResult, fs as ckfs};
use ck_crypto::issue::IssuerFiles;
use ck_crypto::{CertSpec, CryptoProvider, KeyAlgorithm, ParsedCertificate, SubjectName};
use ck_registry::{CertificateEntity, CertificateRegistry, ChangeKind};
use ck_vault::PassphraseVault;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::deploy::{DeployContext, DeployDispatcher, DeployReport};
use crate::types::{CreateOrRenewOptions, CreateOrRenewOutcome, DeleteOptions, RestoreOutcome};

const PARSE_TIMEOUT: Duration = Duration::from_secs(10);
const SIGN_TIMEOUT: Duration = Duration::from_secs(60);

pub struct LifecyclePipeline {
    registry: Arc<CertificateRegistry>,
    crypto: CryptoProvider,
    vault: Arc<PassphraseVault>,
    snapshots: Arc<SnapshotStore>,
    deploy: Arc<DeployDispatcher>,
}

impl LifecyclePipeline {
    pub fn new(
        registry: Arc<CertificateRegistry>,
        snapshots: Arc<SnapshotStore>,
        deploy: Arc<DeployDispatcher>,
    ) -> Self {
        Self {
            crypto: registry.crypto(),
            vault: registry.vault(),
            registry,
            snapshots,
            deploy,
        }
    }

    pub fn registry(&self) -> &Arc<CertificateRegistry> {
        &self.registry
    }

    /// Create a new certificate, or renew `key` when it resolves to an
    /// existing one.
    pub async fn create_or_renew(
        &self,
        key: &str,
        options: CreateOrRenewOptions,
        cancel: &CancellationToken,
    ) -> EngineResult<CreateOrRenewOutcome> {
        match self.registry.get(key).await {
            Some(existing) => self.renew(existing, options, cancel).await,
            None => self.create(key, options, cancel).await,
        }
    }

    /// Promote staged SANs and renew so they are baked into the new
    /// certificate.
    pub async fn apply_idle_and_renew(
        &self,
        key: &str,
        mut options: CreateOrRenewOptions,
        cancel: &CancellationToken,
    ) -> EngineResult<CreateOrRenewOutcome> {
        options.apply_idle = true;
        let entity = self
            .registry
            .get(key)
            .await
            .ok_or_else(|| EngineError::NotFound(format!("certificate {key}")))?;
        self.renew(entity, options, cancel).await
    }

    // ── Creation ────────────────────────────────────────────────

    async fn create(
        &self,
        key: &str,
        options: CreateOrRenewOptions,
        cancel: &CancellationToken,
    ) -> EngineResult<CreateOrRenewOutcome> {
        let name = options
            .name
            .clone()
            .unwrap_or_else(|| key.trim().to_string());
        if name.is_empty() {
            return Err(EngineError::BadInput("certificate name is empty".into()));
        }
        let _guard = self.registry.lock_cert(&name).await;
        check_cancelled(cancel)?;

        let stem = ckfs::sanitize_name(&name);
        let dir = self.registry.certs_dir().join(&stem);
        std::fs::create_dir_all(&dir)?;
        let key_path = dir.join(format!("{stem}.key"));
        let csr_path = dir.join(format!("{stem}.csr"));
        let cert_path = dir.join(format!("{stem}.crt"));

        let algorithm = options.algorithm.unwrap_or(KeyAlgorithm::EcP256);
        let passphrase = options.passphrase.clone();
        {
            let crypto = self.crypto;
            let key_path = key_path.clone();
            let passphrase = passphrase.clone();
            run_blocking(SIGN_TIMEOUT, move || {
                crypto.generate_key(&key_path, algorithm, passphrase.as_deref())
            })
            .await?;
        }
        check_cancelled(cancel)?;

        let patch = options.config.clone().unwrap_or_default();
        let validity = options
            .validity_days
            .or(patch.validity_days)
            .unwrap_or(365);
        let subject = options
            .subject
            .clone()
            .unwrap_or_else(|| SubjectName::new(&name));
        let mut spec = if options.is_ca {
            CertSpec::authority(subject, validity)
        } else {
            CertSpec::server(subject, validity)
        };
        spec.domains = options.domains.clone();
        spec.ips = options.ips.clone();
        if let Some(key_usage) = &patch.key_usage {
            spec.key_usage = key_usage.clone();
        }
        if let Some(eku) = &patch.extended_key_usage {
            spec.extended_key_usage = eku.clone();
        }

        let ca_ref = options
            .ca
            .clone()
            .or_else(|| patch.ca_fingerprint.clone().flatten());
        let (parsed, signing_ca) = match ca_ref {
            Some(ca_ref) => {
                let ca = self.registry.get(&ca_ref).await.ok_or_else(|| {
                    EngineError::NotFound(format!("signing CA {ca_ref}"))
                })?;
                if !ca.is_ca {
                    return Err(EngineError::BadInput(format!(
                        "{} is not a certificate authority",
                        ca.name
                    )));
                }
                let ca_pass = self.resolve_ca_passphrase(&ca, options.ca_passphrase.as_deref())?;

                {
                    let crypto = self.crypto;
                    let key_path = key_path.clone();
                    let csr_path = csr_path.clone();
                    let passphrase = passphrase.clone();
                    let spec = spec.clone();
                    run_blocking(SIGN_TIMEOUT, move || {
                        crypto.create_csr(&key_path, passphrase.as_deref(), &spec, &csr_path)
                    })
                    .await?;
                }
                check_cancelled(cancel)?;

                let ca_cert_path = ca.cert_path().ok_or_else(|| {
                    EngineError::NotFound(format!("certificate file of CA {}", ca.name))
                })?;
                let ca_key_path = ca.key_path().ok_or_else(|| {
                    EngineError::NotFound(format!("key file of CA {}", ca.name))
                })?;
                let parsed = {
                    let crypto = self.crypto;
                    let csr_path = csr_path.clone();
                    let cert_path = cert_path.clone();
                    run_blocking(SIGN_TIMEOUT, move || {
                        crypto.sign_csr(
                            &csr_path,
                            IssuerFiles {
                                cert_path: &ca_cert_path,
                                key_path: &ca_key_path,
                                passphrase: ca_pass.as_deref(),
                            },
                            validity,
                            &cert_path,
                        )
                    })
                    .await?
                };
                (parsed, Some(ca))
            }
            None => {
                let crypto = self.crypto;
                let key_path2 = key_path.clone();
                let cert_path2 = cert_path.clone();
                let passphrase = passphrase.clone();
                let spec = spec.clone();
                let parsed = run_blocking(SIGN_TIMEOUT, move || {
                    crypto.self_sign(&key_path2, passphrase.as_deref(), &spec, &cert_path2)
                })
                .await?;
                (parsed, None)
            }
        };

        let mut paths = BTreeMap::new();
        paths.insert("crt".to_string(), cert_path);
        paths.insert("key".to_string(), key_path);
        if csr_path.exists() {
            paths.insert("csr".to_string(), csr_path);
        }

        let mut entity = CertificateEntity::from_parsed(name, &parsed, paths);
        entity.update_config(&patch);
        if let Some(ca) = &signing_ca {
            entity.config.sign_with_ca = true;
            entity.config.ca_fingerprint = Some(ca.fingerprint.clone());
            entity.config.ca_name = Some(ca.name.clone());
        }
        if let Some(pass) = &passphrase {
            self.vault.store(&entity.fingerprint, pass)?;
            entity.needs_passphrase = true;
        }

        self.registry.upsert(entity.clone()).await?;
        self.registry
            .notify_changed(&entity.fingerprint, ChangeKind::Create)
            .await;
        info!(name = %entity.name, fingerprint = %entity.fingerprint, "certificate created");

        let deploy = self.maybe_deploy(&entity, &options).await;
        self.outcome(&entity, false, false, deploy).await
    }

    // ── Renewal ─────────────────────────────────────────────────

    async fn renew(
        &self,
        entity: CertificateEntity,
        options: CreateOrRenewOptions,
        cancel: &CancellationToken,
    ) -> EngineResult<CreateOrRenewOutcome> {
        let old_fingerprint = entity.fingerprint.clone();
        let _guard = self.registry.lock_cert(&old_fingerprint).await;
        // Re-read under the lock: a concurrent operation may have finished.
        let mut entity = self
            .registry
            .get(&old_fingerprint)
            .await
            .ok_or_else(|| EngineError::NotFound(format!("certificate {old_fingerprint}")))?;
        check_cancelled(cancel)?;

        if !options.skip_snapshot {
            let entry = self
                .take_snapshot(&entity, SnapshotKind::Version, "pre-renewal", "before renewal")
                .await?;
            entity.snapshots.push(entry);
        }
        check_cancelled(cancel)?;

        if let Some(patch) = &options.config {
            entity.update_config(patch);
        }
        let applied_idle = options.apply_idle && entity.apply_idle_subjects();

        let key_path = entity.key_path().ok_or_else(|| {
            EngineError::NotFound(format!("private key of {}", entity.name))
        })?;
        let key_pass = match &options.passphrase {
            Some(pass) => Some(pass.clone()),
            None => self.vault.get(&old_fingerprint),
        };
        if entity.needs_passphrase && key_pass.is_none() {
            return Err(EngineError::WrongPassphrase);
        }

        if options.regenerate_key {
            let algorithm = options.algorithm.unwrap_or(KeyAlgorithm::EcP256);
            let crypto = self.crypto;
            let key_path = key_path.clone();
            let pass = key_pass.clone();
            run_blocking(SIGN_TIMEOUT, move || {
                crypto.generate_key(&key_path, algorithm, pass.as_deref())
            })
            .await?;
        }
        check_cancelled(cancel)?;

        let issuer = if entity.config.sign_with_ca {
            let ca_fp = entity.config.ca_fingerprint.clone().ok_or_else(|| {
                EngineError::NotFound(format!("signing CA of {}", entity.name))
            })?;
            let ca = self.registry.get(&ca_fp).await.ok_or_else(|| {
                EngineError::NotFound(format!("signing CA {ca_fp}"))
            })?;
            let ca_pass = self.resolve_ca_passphrase(&ca, options.ca_passphrase.as_deref())?;
            let ca_cert_path = ca.cert_path().ok_or_else(|| {
                EngineError::NotFound(format!("certificate file of CA {}", ca.name))
            })?;
            let ca_key_path = ca.key_path().ok_or_else(|| {
                EngineError::NotFound(format!("key file of CA {}", ca.name))
            })?;
            Some((ca_cert_path, ca_key_path, ca_pass))
        } else {
            None
        };

        let validity = options
            .validity_days
            .unwrap_or(entity.config.validity_days);
        let cert_path = entity.cert_path().ok_or_else(|| {
            EngineError::NotFound(format!("certificate file of {}", entity.name))
        })?;

        // Subject changes or a fresh key force a full re-issue; otherwise the
        // existing certificate is renewed in place, preserving its contents.
        let parsed = if applied_idle || options.regenerate_key {
            self.reissue(&entity, &key_path, key_pass.clone(), issuer, validity, &cert_path)
                .await?
        } else {
            let crypto = self.crypto;
            let cert_path2 = cert_path.clone();
            let key_path2 = key_path.clone();
            let pass = key_pass.clone();
            run_blocking(SIGN_TIMEOUT, move || {
                let issuer_files = issuer.as_ref().map(|(cert, key, pass)| IssuerFiles {
                    cert_path: cert,
                    key_path: key,
                    passphrase: pass.as_deref(),
                });
                crypto.renew(
                    &cert_path2,
                    &cert_path2,
                    &key_path2,
                    pass.as_deref(),
                    issuer_files,
                    validity,
                )
            })
            .await?
        };

        self.commit_renewal(entity, old_fingerprint, parsed, &options, true)
            .await
    }

    /// Full re-issue from current entity state (key → CSR → sign, or
    /// self-sign).
    async fn reissue(
        &self,
        entity: &CertificateEntity,
        key_path: &PathBuf,
        key_pass: Option<String>,
        issuer: Option<(PathBuf, PathBuf, Option<String>)>,
        validity: u32,
        cert_path: &PathBuf,
    ) -> EngineResult<ParsedCertificate> {
        let spec = spec_from_entity(entity, validity);
        let crypto = self.crypto;
        let key_path = key_path.clone();
        let cert_path = cert_path.clone();

        match issuer {
            Some((ca_cert, ca_key, ca_pass)) => {
                let csr_path = entity
                    .paths
                    .get("csr")
                    .cloned()
                    .unwrap_or_else(|| cert_path.with_extension("csr"));
                run_blocking(SIGN_TIMEOUT, move || {
                    crypto.create_csr(&key_path, key_pass.as_deref(), &spec, &csr_path)?;
                    crypto.sign_csr(
                        &csr_path,
                        IssuerFiles {
                            cert_path: &ca_cert,
                            key_path: &ca_key,
                            passphrase: ca_pass.as_deref(),
                        },
                        validity,
                        &cert_path,
                    )
                })
                .await
            }
            None => {
                run_blocking(SIGN_TIMEOUT, move || {
                    crypto.self_sign(&key_path, key_pass.as_deref(), &spec, &cert_path)
                })
                .await
            }
        }
    }

    /// Install the renewal result: refresh the entity, move vault entries,
    /// swap registry keys if the fingerprint rotated, persist and notify.
    async fn commit_renewal(
        &self,
        mut entity: CertificateEntity,
        old_fingerprint: String,
        parsed: ParsedCertificate,
        options: &CreateOrRenewOptions,
        renewed: bool,
    ) -> EngineResult<CreateOrRenewOutcome> {
        entity.refresh_from_parsed(&parsed);

        if let Some(pass) = &options.passphrase {
            self.vault.store(&entity.fingerprint, pass)?;
        } else if entity.fingerprint != old_fingerprint {
            let _ = self.vault.rekey(&old_fingerprint, &entity.fingerprint);
        }
        if let Some(key_path) = entity.key_path() {
            if key_path.exists() {
                entity.needs_passphrase = self.crypto.is_key_encrypted(&key_path)?;
            }
        }

        let fingerprint_changed = entity.fingerprint != old_fingerprint;
        if fingerprint_changed {
            self.registry
                .replace(&old_fingerprint, entity.clone())
                .await?;
        } else {
            self.registry.upsert(entity.clone()).await?;
        }
        self.registry
            .notify_changed(&entity.fingerprint, ChangeKind::Update)
            .await;
        info!(
            name = %entity.name,
            old = %old_fingerprint,
            new = %entity.fingerprint,
            rotated = fingerprint_changed,
            "certificate renewed"
        );

        let deploy = self.maybe_deploy(&entity, options).await;
        self.outcome(&entity, renewed, fingerprint_changed, deploy)
            .await
    }

    // ── Snapshots ───────────────────────────────────────────────

    /// Take a snapshot and return its entry (the caller records it on the
    /// entity it is about to persist).
    async fn take_snapshot(
        &self,
        entity: &CertificateEntity,
        kind: SnapshotKind,
        trigger: &str,
        description: &str,
    ) -> EngineResult<SnapshotEntry> {
        let store = Arc::clone(&self.snapshots);
        let name = entity.name.clone();
        let fingerprint = entity.fingerprint.clone();
        let paths = entity.paths.clone();
        let last_id = entity.last_snapshot_id();
        let trigger = trigger.to_string();
        let description = description.to_string();
        run_blocking(SIGN_TIMEOUT, move || {
            store.create_snapshot(
                &name,
                &fingerprint,
                &paths,
                last_id,
                kind,
                &trigger,
                &description,
            )
        })
        .await
    }

    /// Operator-requested snapshot, recorded on the entity.
    pub async fn create_snapshot(
        &self,
        key: &str,
        kind: SnapshotKind,
        trigger: &str,
        description: &str,
    ) -> EngineResult<SnapshotEntry> {
        let entity = self
            .registry
            .get(key)
            .await
            .ok_or_else(|| EngineError::NotFound(format!("certificate {key}")))?;
        let _guard = self.registry.lock_cert(&entity.fingerprint).await;
        let entity = self
            .registry
            .get(&entity.fingerprint)
            .await
            .ok_or_else(|| EngineError::NotFound(format!("certificate {key}")))?;

        let entry = self.take_snapshot(&entity, kind, trigger, description).await?;
        let recorded = entry.clone();
        self.registry
            .update_entity(&entity.fingerprint, move |e| e.snapshots.push(recorded))
            .await?;
        Ok(entry)
    }

    pub async fn list_snapshots(
        &self,
        key: &str,
        kind: Option<SnapshotKind>,
    ) -> EngineResult<Vec<SnapshotEntry>> {
        let entity = self
            .registry
            .get(key)
            .await
            .ok_or_else(|| EngineError::NotFound(format!("certificate {key}")))?;
        Ok(SnapshotStore::sorted(entity.snapshots, kind))
    }

    pub async fn delete_snapshot(&self, key: &str, snapshot_id: u64) -> EngineResult<()> {
        let entity = self
            .registry
            .get(key)
            .await
            .ok_or_else(|| EngineError::NotFound(format!("certificate {key}")))?;
        let _guard = self.registry.lock_cert(&entity.fingerprint).await;
        let entry = entity
            .snapshots
            .iter()
            .find(|s| s.id == snapshot_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("snapshot {snapshot_id}")))?;

        self.snapshots.delete_snapshot(&entity.name, &entry)?;
        self.registry
            .update_entity(&entity.fingerprint, move |e| {
                e.snapshots.retain(|s| s.id != snapshot_id)
            })
            .await?;
        Ok(())
    }

    /// Restore a prior file set: pre-restore snapshot first, then copy back
    /// and refresh from the restored file.
    pub async fn restore_from_snapshot(
        &self,
        key: &str,
        snapshot_id: u64,
        cancel: &CancellationToken,
    ) -> EngineResult<RestoreOutcome> {
        let current = self
            .registry
            .get(key)
            .await
            .ok_or_else(|| EngineError::NotFound(format!("certificate {key}")))?;
        let old_fingerprint = current.fingerprint.clone();
        let _guard = self.registry.lock_cert(&old_fingerprint).await;
        let mut entity = self
            .registry
            .get(&old_fingerprint)
            .await
            .ok_or_else(|| EngineError::NotFound(format!("certificate {key}")))?;

        let target = entity
            .snapshots
            .iter()
            .find(|s| s.id == snapshot_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("snapshot {snapshot_id}")))?;
        check_cancelled(cancel)?;

        let pre = self
            .take_snapshot(&entity, SnapshotKind::Version, "pre-restore", "before restore")
            .await?;
        entity.snapshots.push(pre);
        check_cancelled(cancel)?;

        let restored_files = {
            let store = Arc::clone(&self.snapshots);
            let name = entity.name.clone();
            let entry = target.clone();
            let paths = entity.paths.clone();
            run_blocking(SIGN_TIMEOUT, move || {
                store.restore_snapshot(&name, &entry, &paths)
            })
            .await?
        };

        let cert_path = entity.cert_path().ok_or_else(|| {
            EngineError::NotFound(format!("certificate file of {}", entity.name))
        })?;
        let parsed = {
            let crypto = self.crypto;
            run_blocking(PARSE_TIMEOUT, move || crypto.parse(&cert_path)).await?
        };

        entity.refresh_from_parsed(&parsed);
        if entity.fingerprint != old_fingerprint {
            let _ = self.vault.rekey(&old_fingerprint, &entity.fingerprint);
        }
        if let Some(key_path) = entity.key_path() {
            if key_path.exists() {
                entity.needs_passphrase = self.crypto.is_key_encrypted(&key_path)?;
            }
        }

        let fingerprint_changed = entity.fingerprint != old_fingerprint;
        if fingerprint_changed {
            self.registry
                .replace(&old_fingerprint, entity.clone())
                .await?;
        } else {
            self.registry.upsert(entity.clone()).await?;
        }
        self.registry
            .notify_changed(&entity.fingerprint, ChangeKind::Update)
            .await;
        info!(
            name = %entity.name,
            snapshot = snapshot_id,
            rotated = fingerprint_changed,
            "snapshot restored"
        );

        let certificate = self
            .registry
            .get_view(&entity.fingerprint)
            .await
            .ok_or_else(|| EngineError::NotFound(format!("certificate {key}")))?;
        Ok(RestoreOutcome {
            success: true,
            fingerprint_changed,
            restored_files,
            certificate,
        })
    }

    // ── Deletion / vault ────────────────────────────────────────

    pub async fn delete_certificate(
        &self,
        key: &str,
        options: DeleteOptions,
    ) -> EngineResult<CertificateEntity> {
        let entity = self
            .registry
            .get(key)
            .await
            .ok_or_else(|| EngineError::NotFound(format!("certificate {key}")))?;
        let _guard = self.registry.lock_cert(&entity.fingerprint).await;

        let removed = self
            .registry
            .remove(&entity.fingerprint, options.delete_files)
            .await?;
        if options.delete_snapshots {
            if let Err(e) = self.snapshots.delete_all(&removed.name) {
                warn!(name = %removed.name, error = %e, "could not delete snapshot archive");
            }
        }
        let _ = self.vault.delete(&removed.fingerprint);
        self.registry
            .notify_changed(&removed.fingerprint, ChangeKind::Delete)
            .await;
        info!(name = %removed.name, fingerprint = %removed.fingerprint, "certificate deleted");
        Ok(removed)
    }

    /// Rotate the vault master key (API: `POST /security/rotate-encryption-key`).
    pub fn rotate_encryption_key(&self) -> EngineResult<()> {
        self.vault.rotate_key()
    }

    // ── Helpers ─────────────────────────────────────────────────

    fn resolve_ca_passphrase(
        &self,
        ca: &CertificateEntity,
        explicit: Option<&str>,
    ) -> EngineResult<Option<String>> {
        if let Some(pass) = explicit {
            return Ok(Some(pass.to_string()));
        }
        if let Some(pass) = self.vault.get(&ca.fingerprint) {
            return Ok(Some(pass));
        }
        if ca.needs_passphrase {
            return Err(EngineError::WrongPassphrase);
        }
        Ok(None)
    }

    async fn maybe_deploy(
        &self,
        entity: &CertificateEntity,
        options: &CreateOrRenewOptions,
    ) -> Option<DeployReport> {
        if options.skip_deploy || entity.config.deploy_actions.is_empty() {
            return None;
        }
        let ctx = DeployContext {
            certificate_name: entity.name.clone(),
            fingerprint: entity.fingerprint.clone(),
            files: entity.paths.clone(),
        };
        Some(
            self.deploy
                .dispatch(&entity.config.deploy_actions, &ctx)
                .await,
        )
    }

    async fn outcome(
        &self,
        entity: &CertificateEntity,
        renewed: bool,
        fingerprint_changed: bool,
        deploy: Option<DeployReport>,
    ) -> EngineResult<CreateOrRenewOutcome> {
        let certificate = self
            .registry
            .get_view(&entity.fingerprint)
            .await
            .ok_or_else(|| {
                EngineError::NotFound(format!("certificate {}", entity.fingerprint))
            })?;
        Ok(CreateOrRenewOutcome {
            success: true,
            renewed,
            fingerprint_changed,
            certificate,
            deploy,
        })
    }
}

fn spec_from_entity(entity: &CertificateEntity, validity_days: u32) -> CertSpec {
    CertSpec {
        subject: SubjectName::from_dn(&entity.subject),
        domains: entity.sans.domains.clone(),
        ips: entity.sans.ips.clone(),
        is_ca: entity.is_ca,
        path_len: entity.path_len_constraint,
        key_usage: entity.config.key_usage.clone(),
        extended_key_usage: entity.config.extended_key_usage.clone(),
        validity_days,
    }
}

fn check_cancelled(cancel: &CancellationToken) -> EngineResult<()> {
    if cancel.is_cancelled() {
        Err(EngineError::Conflict("operation cancelled".into()))
    } else {
        Ok(())
    }
}

async fn run_blocking<T, F>(timeout: Duration, op: F) -> EngineResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> EngineResult<T> + Send + 'static,
{
    match tokio::time::timeout(timeout, task::spawn_blocking(op)).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(EngineError::Crypto(format!(
            "background task failed: {join_err}"
        ))),
        Err(_) => Err(EngineError::Crypto(format!(
            "operation timed out after {}s",
            timeout.as_secs()
        ))),
    }
}
