use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration principale chargée depuis les variables d'environnement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvConfig {
    /// Répertoire de configuration (certificates.json, passphrases.enc)
    pub config_dir: PathBuf,
    /// Répertoire des certificats vivants
    pub certs_dir: PathBuf,
    /// Répertoire d'archivage des snapshots
    pub archive_dir: PathBuf,
    /// Port HTTP de l'API
    pub port: u16,
    /// Port HTTPS de l'API
    pub https_port: u16,
    /// Niveau de log (filtre tracing), ex: "info,certkeep=debug"
    pub log_level: Option<String>,
    /// Répertoire des logs
    pub log_dir: PathBuf,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from("/var/lib/certkeep/config"),
            certs_dir: PathBuf::from("/var/lib/certkeep/certs"),
            archive_dir: PathBuf::from("/var/lib/certkeep/archive"),
            port: 3000,
            https_port: 3443,
            log_level: None,
            log_dir: PathBuf::from("/var/log/certkeep"),
        }
    }
}

impl EnvConfig {
    /// Charge la configuration depuis les variables d'environnement
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("CONFIG_DIR") {
            config.config_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("CERTS_DIR") {
            config.certs_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("ARCHIVE_DIR") {
            config.archive_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("PORT") {
            if let Ok(port) = v.parse() {
                config.port = port;
            }
        }
        if let Ok(v) = std::env::var("HTTPS_PORT") {
            if let Ok(port) = v.parse() {
                config.https_port = port;
            }
        }
        if let Ok(v) = std::env::var("LOG_LEVEL") {
            config.log_level = Some(v);
        }
        if let Ok(v) = std::env::var("LOG_DIR") {
            config.log_dir = PathBuf::from(v);
        }

        config
    }

    /// Charge le fichier .env puis les variables d'environnement
    pub fn load(env_file: Option<&Path>) -> Self {
        if let Some(path) = env_file {
            load_dotenv(path);
        } else {
            // Chercher .env dans le répertoire courant ou /etc/certkeep
            let candidates = [PathBuf::from("/etc/certkeep/.env"), PathBuf::from(".env")];
            for candidate in &candidates {
                if candidate.exists() {
                    load_dotenv(candidate);
                    break;
                }
            }
        }

        Self::from_env()
    }

    /// Chemin du fichier de métadonnées du registre
    pub fn metadata_path(&self) -> PathBuf {
        self.config_dir.join("certificates.json")
    }
}

/// Charge un fichier .env basique (KEY=VALUE par ligne)
fn load_dotenv(path: &Path) {
    if let Ok(content) = std::fs::read_to_string(path) {
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                let value = value.trim().trim_matches('"').trim_matches('\'');
                if std::env::var(key).is_err() {
                    // SAFETY: called before spawning any threads (single-threaded init)
                    unsafe { std::env::set_var(key, value) };
                }
            }
        }
    }
}
