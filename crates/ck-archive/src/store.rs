//! Content archive for certificate file sets.
//!
//! Layout: `{archive_root}/{sanitized_name}/{backup|version}/{id}/` with the
//! archived files plus a `meta.json` describing the snapshot. Directories are
//! append-only; a snapshot is never mutated after creation.

use chrono::Utc;
use ck_common::{EngineError, EngineResult, fs as ckfs};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::types::{SnapshotEntry, SnapshotKind};

const META_FILE: &str = "meta.json";

pub struct SnapshotStore {
    archive_root: PathBuf,
}

impl SnapshotStore {
    pub fn new(archive_root: impl Into<PathBuf>) -> Self {
        Self {
            archive_root: archive_root.into(),
        }
    }

    pub fn cert_root(&self, cert_name: &str) -> PathBuf {
        self.archive_root.join(ckfs::sanitize_name(cert_name))
    }

    fn snapshot_dir(&self, cert_name: &str, kind: SnapshotKind, id: u64) -> PathBuf {
        self.cert_root(cert_name)
            .join(kind.to_string())
            .join(id.to_string())
    }

    /// Archive every existing file of `paths`.
    ///
    /// `last_id` is the highest id already indexed for this certificate; the
    /// new id is the current millisecond clock, bumped past `last_id` and any
    /// directory collision so ids stay strictly increasing.
    pub fn create_snapshot(
        &self,
        cert_name: &str,
        fingerprint: &str,
        paths: &BTreeMap<String, PathBuf>,
        last_id: u64,
        kind: SnapshotKind,
        trigger: &str,
        description: &str,
    ) -> EngineResult<SnapshotEntry> {
        let mut id = ckfs::now_millis().max(last_id + 1);
        while self.snapshot_dir(cert_name, kind, id).exists() {
            id += 1;
        }
        let dir = self.snapshot_dir(cert_name, kind, id);
        fs::create_dir_all(&dir)?;

        let mut files = Vec::new();
        for (role, path) in paths {
            if !path.exists() {
                debug!(role = %role, path = %path.display(), "skipping missing file");
                continue;
            }
            let Some(basename) = path.file_name().map(|n| n.to_string_lossy().to_string()) else {
                continue;
            };
            if let Err(e) = ckfs::copy_atomic(path, &dir.join(&basename)) {
                let _ = fs::remove_dir_all(&dir);
                return Err(EngineError::Io(e));
            }
            files.push(basename);
        }
        files.sort();
        files.dedup();

        let entry = SnapshotEntry {
            id,
            kind,
            trigger: trigger.to_string(),
            description: description.to_string(),
            created_at: Utc::now(),
            fingerprint_at_snapshot: fingerprint.to_string(),
            files,
        };

        let meta = match serde_json::to_string_pretty(&entry) {
            Ok(meta) => meta,
            Err(e) => {
                let _ = fs::remove_dir_all(&dir);
                return Err(EngineError::Serialization(e));
            }
        };
        if let Err(e) = ckfs::write_atomic(&dir.join(META_FILE), meta.as_bytes()) {
            let _ = fs::remove_dir_all(&dir);
            return Err(EngineError::Io(e));
        }

        debug!(cert = %cert_name, id, kind = %kind, "snapshot created");
        Ok(entry)
    }

    /// Copy the archived files back over the live paths.
    ///
    /// Live files with no counterpart in the snapshot are left untouched:
    /// restores are additive.
    pub fn restore_snapshot(
        &self,
        cert_name: &str,
        entry: &SnapshotEntry,
        live_paths: &BTreeMap<String, PathBuf>,
    ) -> EngineResult<Vec<String>> {
        let dir = self.snapshot_dir(cert_name, entry.kind, entry.id);
        if !dir.exists() {
            return Err(EngineError::NotFound(format!(
                "snapshot {} for {cert_name}",
                entry.id
            )));
        }

        let mut restored = Vec::new();
        for basename in &entry.files {
            let src = dir.join(basename);
            if !src.exists() {
                warn!(cert = %cert_name, file = %basename, "archived file missing, skipping");
                continue;
            }
            let target = live_paths
                .values()
                .find(|p| p.file_name().and_then(|n| n.to_str()) == Some(basename.as_str()));
            let Some(target) = target else {
                warn!(cert = %cert_name, file = %basename, "no live path for archived file");
                continue;
            };
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            ckfs::copy_atomic(&src, target)?;
            restored.push(basename.clone());
        }

        debug!(cert = %cert_name, id = entry.id, files = restored.len(), "snapshot restored");
        Ok(restored)
    }

    /// Remove a snapshot directory. Missing snapshot is an error.
    pub fn delete_snapshot(&self, cert_name: &str, entry: &SnapshotEntry) -> EngineResult<()> {
        let dir = self.snapshot_dir(cert_name, entry.kind, entry.id);
        if !dir.exists() {
            return Err(EngineError::NotFound(format!(
                "snapshot {} for {cert_name}",
                entry.id
            )));
        }
        fs::remove_dir_all(&dir)?;
        Ok(())
    }

    /// Remove the whole archive of a certificate (certificate deletion with
    /// `deleteSnapshots=true`).
    pub fn delete_all(&self, cert_name: &str) -> EngineResult<()> {
        let root = self.cert_root(cert_name);
        if root.exists() {
            fs::remove_dir_all(&root)?;
        }
        Ok(())
    }

    /// Rebuild a snapshot index from the on-disk `meta.json` files, newest
    /// first. Used when persisted metadata was lost.
    pub fn scan(&self, cert_name: &str) -> EngineResult<Vec<SnapshotEntry>> {
        let root = self.cert_root(cert_name);
        let mut entries = Vec::new();
        if !root.exists() {
            return Ok(entries);
        }

        for kind_dir in fs::read_dir(&root)? {
            let kind_dir = kind_dir?;
            if !kind_dir.file_type()?.is_dir() {
                continue;
            }
            for snap_dir in fs::read_dir(kind_dir.path())? {
                let meta_path = snap_dir?.path().join(META_FILE);
                if !meta_path.exists() {
                    continue;
                }
                match fs::read_to_string(&meta_path)
                    .map_err(EngineError::Io)
                    .and_then(|raw| Ok(serde_json::from_str::<SnapshotEntry>(&raw)?))
                {
                    Ok(entry) => entries.push(entry),
                    Err(e) => {
                        warn!(path = %meta_path.display(), error = %e, "unreadable snapshot meta, skipping")
                    }
                }
            }
        }

        Ok(Self::sorted(entries, None))
    }

    /// Sort newest first (createdAt, then id), optionally filtered by kind.
    pub fn sorted(
        mut entries: Vec<SnapshotEntry>,
        kind: Option<SnapshotKind>,
    ) -> Vec<SnapshotEntry> {
        if let Some(kind) = kind {
            entries.retain(|e| e.kind == kind);
        }
        entries.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        entries
    }
}
