use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Horodatage courant en millisecondes depuis l'epoch
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Retente une fois les erreurs IO transitoires (EINTR, EAGAIN)
pub fn retry_io<T>(mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    match op() {
        Err(e) if matches!(e.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock) => {
            op()
        }
        other => other,
    }
}

/// Chemin temporaire `<fichier>.tmp` à côté de la cible
pub fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Écriture atomique: fichier temporaire + fsync + rename.
///
/// Si le rename échoue, retombe sur une écriture directe (le contenu prime
/// sur l'atomicité dans ce cas dégradé).
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = tmp_path(path);

    let write_tmp = || -> io::Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        Ok(())
    };

    retry_io(write_tmp)?;

    if let Err(rename_err) = fs::rename(&tmp, path) {
        tracing::warn!(
            path = %path.display(),
            error = %rename_err,
            "atomic rename failed, falling back to direct write"
        );
        let _ = fs::remove_file(&tmp);
        return retry_io(|| fs::write(path, bytes));
    }

    Ok(())
}

/// Copie octet-pour-octet d'un fichier, atomique côté destination
pub fn copy_atomic(src: &Path, dst: &Path) -> io::Result<()> {
    let bytes = retry_io(|| fs::read(src))?;
    write_atomic(dst, &bytes)
}

/// Remplace tout caractère hors `[A-Za-z0-9._-]` par `_` (noms de répertoires)
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("example.test"), "example.test");
        assert_eq!(sanitize_name("my cert/2024"), "my_cert_2024");
        assert_eq!(sanitize_name("*.example.com"), "_.example.com");
        assert_eq!(sanitize_name("a_b-c.d"), "a_b-c.d");
    }

    #[test]
    fn test_write_atomic_replaces_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.json");

        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"second");
        // No temp file left behind
        assert!(!tmp_path(&path).exists());
    }

    #[test]
    fn test_copy_atomic() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src.pem");
        let dst = dir.path().join("dst.pem");
        fs::write(&src, b"pem bytes").unwrap();

        copy_atomic(&src, &dst).unwrap();
        assert_eq!(fs::read(&dst).unwrap(), b"pem bytes");
    }

    #[test]
    fn test_tmp_path_keeps_extension() {
        let p = PathBuf::from("/tmp/certificates.json");
        assert_eq!(tmp_path(&p), PathBuf::from("/tmp/certificates.json.tmp"));
    }

    #[test]
    fn test_retry_io_retries_interrupted() {
        let mut calls = 0;
        let result: io::Result<u32> = retry_io(|| {
            calls += 1;
            if calls == 1 {
                Err(io::Error::from(io::ErrorKind::Interrupted))
            } else {
                Ok(7)
            }
        });
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls, 2);
    }
}
