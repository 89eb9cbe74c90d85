//! Recursive watch on the certificates directory.
//!
//! Events are debounced per path (quiet window) so rename-in-place
//! sequences collapse into a single reconcile. Hidden entries and the
//! `backups` / `archive` directories are ignored.

use ck_common::{EngineError, EngineResult};
use ck_crypto::parse::CERT_EXTENSIONS;
use ck_registry::{CertificateRegistry, ChangeKind};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Quiet window before a path's events are acted upon.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(200);

pub struct CertWatcher {
    registry: Arc<CertificateRegistry>,
}

impl CertWatcher {
    pub fn new(registry: Arc<CertificateRegistry>) -> Self {
        Self { registry }
    }

    /// Watch until cancelled. Holds the OS watcher for its whole lifetime.
    pub async fn run(&self, cancel: CancellationToken) -> EngineResult<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(
            move |result: Result<Event, notify::Error>| match result {
                Ok(event) => {
                    let _ = tx.send(event);
                }
                Err(e) => warn!(error = %e, "watcher event error"),
            },
        )
        .map_err(|e| EngineError::Io(std::io::Error::other(e)))?;

        let certs_dir = self.registry.certs_dir().to_path_buf();
        watcher
            .watch(&certs_dir, RecursiveMode::Recursive)
            .map_err(|e| EngineError::Io(std::io::Error::other(e)))?;
        info!(dir = %certs_dir.display(), "certificate watcher started");

        let mut pending: HashMap<PathBuf, (ChangeKind, Instant)> = HashMap::new();
        loop {
            let next_deadline = pending.values().map(|(_, deadline)| *deadline).min();
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = rx.recv() => {
                    match received {
                        Some(event) => enqueue(&mut pending, event),
                        None => break,
                    }
                }
                _ = sleep_until_or_forever(next_deadline) => {
                    self.flush_due(&mut pending).await;
                }
            }
        }

        info!("certificate watcher stopped");
        Ok(())
    }

    /// Map quiesced paths to registry notifications, then reconcile once
    /// for the whole burst.
    async fn flush_due(&self, pending: &mut HashMap<PathBuf, (ChangeKind, Instant)>) {
        let now = Instant::now();
        let due: Vec<(PathBuf, ChangeKind)> = pending
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(path, (kind, _))| (path.clone(), *kind))
            .collect();
        if due.is_empty() {
            return;
        }
        for (path, _) in &due {
            pending.remove(path);
        }

        for (path, kind) in due {
            debug!(path = %path.display(), ?kind, "filesystem change");
            match self.registry.fingerprint_for_path(&path).await {
                Some(fingerprint) => self.registry.notify_changed(&fingerprint, kind).await,
                // Unknown path: the on-disk set is suspect as a whole.
                None if kind != ChangeKind::Delete => self.registry.invalidate(None).await,
                None => {}
            }
        }

        if let Err(e) = self.registry.load_all(false).await {
            warn!(error = %e, "reconcile after filesystem change failed");
        }
    }
}

async fn sleep_until_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

fn enqueue(pending: &mut HashMap<PathBuf, (ChangeKind, Instant)>, event: Event) {
    let kind = match event.kind {
        EventKind::Create(_) => ChangeKind::Create,
        EventKind::Modify(_) => ChangeKind::Update,
        EventKind::Remove(_) => ChangeKind::Delete,
        _ => return,
    };
    for path in event.paths {
        if !is_relevant(&path) {
            continue;
        }
        // Newest event wins and the quiet window restarts: a fast
        // delete+recreate collapses into one Create.
        pending.insert(path, (kind, Instant::now() + DEBOUNCE_WINDOW));
    }
}

fn is_relevant(path: &Path) -> bool {
    for component in path.components() {
        let name = component.as_os_str().to_string_lossy();
        if name.starts_with('.') || name == "backups" || name == "archive" {
            return false;
        }
    }
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| CERT_EXTENSIONS.contains(&ext) || ext == "key")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relevant_paths() {
        assert!(is_relevant(Path::new("/certs/web/web.pem")));
        assert!(is_relevant(Path::new("/certs/web/web.crt")));
        assert!(is_relevant(Path::new("/certs/web/web.key")));
        assert!(!is_relevant(Path::new("/certs/web/notes.txt")));
        assert!(!is_relevant(Path::new("/certs/.hidden/web.pem")));
        assert!(!is_relevant(Path::new("/certs/backups/web.pem")));
        assert!(!is_relevant(Path::new("/certs/archive/web.pem")));
        assert!(!is_relevant(Path::new("/certs/web/.web.pem.tmp")));
    }

    #[test]
    fn test_enqueue_coalesces_per_path() {
        let mut pending = HashMap::new();
        let path = PathBuf::from("/certs/web/web.pem");

        enqueue(
            &mut pending,
            Event::new(EventKind::Remove(notify::event::RemoveKind::File))
                .add_path(path.clone()),
        );
        enqueue(
            &mut pending,
            Event::new(EventKind::Create(notify::event::CreateKind::File))
                .add_path(path.clone()),
        );

        assert_eq!(pending.len(), 1);
        assert_eq!(pending[&path].0, ChangeKind::Create);
    }
}
