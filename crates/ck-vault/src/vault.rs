//! Stockage chiffré des passphrases de clés privées.
//!
//! Les passphrases sont scellées (AES-256-GCM, nonce aléatoire, AAD = le
//! fingerprint du certificat) avec une clé dérivée par HKDF d'une clé
//! maîtresse tenue dans un fichier séparé du coffre. La rotation régénère la
//! clé maîtresse et rescelle toutes les entrées; le fichier `.new`
//! intermédiaire rend l'opération reprennable après un crash.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use ck_common::{EngineError, EngineResult, fs as ckfs};
use ring::rand::{SecureRandom, SystemRandom};
use ring::{aead, hkdf};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{info, warn};

const VAULT_FILE: &str = "passphrases.enc";
const MASTER_KEY_FILE: &str = "vault.key";
const HKDF_SALT: &[u8] = b"certkeep-vault-v1";
const HKDF_INFO: &[u8] = b"passphrase-store";
const NONCE_LEN: usize = 12;

#[derive(Debug, Default, Serialize, Deserialize)]
struct VaultFileModel {
    version: u32,
    entries: BTreeMap<String, String>,
}

/// Coffre de passphrases, partagé par tout le processus
#[derive(Debug)]
pub struct PassphraseVault {
    vault_path: PathBuf,
    key_path: PathBuf,
    master: RwLock<[u8; 32]>,
    entries: RwLock<BTreeMap<String, String>>,
}

impl PassphraseVault {
    /// Ouvre (ou initialise) le coffre dans `config_dir`
    pub fn open(config_dir: &Path) -> EngineResult<Self> {
        fs::create_dir_all(config_dir)?;
        let vault_path = config_dir.join(VAULT_FILE);
        let key_path = config_dir.join(MASTER_KEY_FILE);

        Self::recover_interrupted_rotation(&vault_path, &key_path);

        let master = if key_path.exists() {
            read_master_key(&key_path)?
        } else {
            if vault_path.exists() {
                return Err(EngineError::ConfigCorrupt(
                    "vault file present but master key is missing".into(),
                ));
            }
            let master = random_master()?;
            write_master_key(&key_path, &master)?;
            info!("vault master key generated");
            master
        };

        let entries = if vault_path.exists() {
            decrypt_vault_file(&vault_path, &master)?
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            vault_path,
            key_path,
            master: RwLock::new(master),
            entries: RwLock::new(entries),
        })
    }

    /// Reprend une rotation interrompue: si `vault.key.new` déchiffre le
    /// coffre courant, la rotation avait abouti côté coffre; on la finalise.
    fn recover_interrupted_rotation(vault_path: &Path, key_path: &Path) {
        let pending = key_path.with_extension("key.new");
        if !pending.exists() {
            return;
        }
        let finalize = read_master_key(&pending)
            .and_then(|master| decrypt_vault_file(vault_path, &master))
            .is_ok();
        if finalize {
            if let Err(e) = fs::rename(&pending, key_path) {
                warn!(error = %e, "could not finalize interrupted key rotation");
            } else {
                info!("finalized interrupted vault key rotation");
            }
        } else {
            warn!("discarding stale vault.key.new from interrupted rotation");
            let _ = fs::remove_file(&pending);
        }
    }

    pub fn store(&self, fingerprint: &str, passphrase: &str) -> EngineResult<()> {
        let fp = fingerprint.to_lowercase();
        self.entries
            .write()
            .expect("vault lock poisoned")
            .insert(fp, passphrase.to_string());
        self.persist()
    }

    pub fn get(&self, fingerprint: &str) -> Option<String> {
        self.entries
            .read()
            .expect("vault lock poisoned")
            .get(&fingerprint.to_lowercase())
            .cloned()
    }

    pub fn has(&self, fingerprint: &str) -> bool {
        self.entries
            .read()
            .expect("vault lock poisoned")
            .contains_key(&fingerprint.to_lowercase())
    }

    pub fn delete(&self, fingerprint: &str) -> EngineResult<bool> {
        let removed = self
            .entries
            .write()
            .expect("vault lock poisoned")
            .remove(&fingerprint.to_lowercase())
            .is_some();
        if removed {
            self.persist()?;
        }
        Ok(removed)
    }

    /// Déplace une entrée vers un nouveau fingerprint (renouvellement)
    pub fn rekey(&self, old_fingerprint: &str, new_fingerprint: &str) -> EngineResult<bool> {
        let moved = {
            let mut entries = self.entries.write().expect("vault lock poisoned");
            match entries.remove(&old_fingerprint.to_lowercase()) {
                Some(pass) => {
                    entries.insert(new_fingerprint.to_lowercase(), pass);
                    true
                }
                None => false,
            }
        };
        if moved {
            self.persist()?;
        }
        Ok(moved)
    }

    pub fn fingerprints(&self) -> Vec<String> {
        self.entries
            .read()
            .expect("vault lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Régénère la clé maîtresse et rescelle toutes les entrées.
    ///
    /// L'ancien fichier n'est remplacé qu'après rechiffrement complet.
    pub fn rotate_key(&self) -> EngineResult<()> {
        let mut master = self.master.write().expect("vault lock poisoned");
        let entries = self.entries.read().expect("vault lock poisoned");

        let new_master = random_master()?;
        let pending = self.key_path.with_extension("key.new");
        write_master_key(&pending, &new_master)?;

        let sealed = encrypt_entries(&entries, &new_master)?;
        write_vault_file(&self.vault_path, sealed)?;

        fs::rename(&pending, &self.key_path)?;
        *master = new_master;
        info!(entries = entries.len(), "vault encryption key rotated");
        Ok(())
    }

    fn persist(&self) -> EngineResult<()> {
        let master = self.master.read().expect("vault lock poisoned");
        let entries = self.entries.read().expect("vault lock poisoned");
        let sealed = encrypt_entries(&entries, &master)?;
        write_vault_file(&self.vault_path, sealed)
    }
}

// ── Chiffrement ─────────────────────────────────────────────────

fn vault_key(master: &[u8; 32]) -> EngineResult<[u8; 32]> {
    struct Len32;
    impl hkdf::KeyType for Len32 {
        fn len(&self) -> usize {
            32
        }
    }

    let prk = hkdf::Salt::new(hkdf::HKDF_SHA256, HKDF_SALT).extract(master);
    let okm = prk
        .expand(&[HKDF_INFO], Len32)
        .map_err(|_| EngineError::Crypto("vault key derivation failed".into()))?;
    let mut key = [0u8; 32];
    okm.fill(&mut key)
        .map_err(|_| EngineError::Crypto("vault key derivation failed".into()))?;
    Ok(key)
}

fn seal_entry(master: &[u8; 32], fingerprint: &str, passphrase: &str) -> EngineResult<String> {
    let key = vault_key(master)?;
    let unbound = aead::UnboundKey::new(&aead::AES_256_GCM, &key)
        .map_err(|_| EngineError::Crypto("AEAD key rejected".into()))?;
    let sealing = aead::LessSafeKey::new(unbound);

    let mut nonce = [0u8; NONCE_LEN];
    SystemRandom::new()
        .fill(&mut nonce)
        .map_err(|_| EngineError::Crypto("secure random unavailable".into()))?;

    let mut data = passphrase.as_bytes().to_vec();
    sealing
        .seal_in_place_append_tag(
            aead::Nonce::assume_unique_for_key(nonce),
            aead::Aad::from(fingerprint.as_bytes()),
            &mut data,
        )
        .map_err(|_| EngineError::Crypto("AEAD seal failed".into()))?;

    let mut payload = Vec::with_capacity(NONCE_LEN + data.len());
    payload.extend_from_slice(&nonce);
    payload.extend_from_slice(&data);
    Ok(BASE64.encode(payload))
}

fn open_entry(master: &[u8; 32], fingerprint: &str, sealed: &str) -> EngineResult<String> {
    let payload = BASE64
        .decode(sealed)
        .map_err(|_| EngineError::ConfigCorrupt("vault entry is not valid base64".into()))?;
    if payload.len() < NONCE_LEN + aead::AES_256_GCM.tag_len() {
        return Err(EngineError::ConfigCorrupt("vault entry truncated".into()));
    }

    let key = vault_key(master)?;
    let unbound = aead::UnboundKey::new(&aead::AES_256_GCM, &key)
        .map_err(|_| EngineError::Crypto("AEAD key rejected".into()))?;
    let opening = aead::LessSafeKey::new(unbound);

    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&payload[..NONCE_LEN]);
    let mut data = payload[NONCE_LEN..].to_vec();

    let plain = opening
        .open_in_place(
            aead::Nonce::assume_unique_for_key(nonce),
            aead::Aad::from(fingerprint.as_bytes()),
            &mut data,
        )
        .map_err(|_| EngineError::ConfigCorrupt("vault entry does not decrypt".into()))?;

    String::from_utf8(plain.to_vec())
        .map_err(|_| EngineError::ConfigCorrupt("vault entry is not UTF-8".into()))
}

fn encrypt_entries(
    entries: &BTreeMap<String, String>,
    master: &[u8; 32],
) -> EngineResult<VaultFileModel> {
    let mut sealed = BTreeMap::new();
    for (fp, pass) in entries {
        sealed.insert(fp.clone(), seal_entry(master, fp, pass)?);
    }
    Ok(VaultFileModel {
        version: 1,
        entries: sealed,
    })
}

fn decrypt_vault_file(
    vault_path: &Path,
    master: &[u8; 32],
) -> EngineResult<BTreeMap<String, String>> {
    let content = ckfs::retry_io(|| fs::read_to_string(vault_path))?;
    if content.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    let model: VaultFileModel = serde_json::from_str(&content)
        .map_err(|e| EngineError::ConfigCorrupt(format!("vault file unreadable: {e}")))?;

    let mut entries = BTreeMap::new();
    for (fp, sealed) in &model.entries {
        entries.insert(fp.clone(), open_entry(master, fp, sealed)?);
    }
    Ok(entries)
}

// ── Fichiers ────────────────────────────────────────────────────

fn write_vault_file(path: &Path, model: VaultFileModel) -> EngineResult<()> {
    let json = serde_json::to_string_pretty(&model)?;
    ckfs::write_atomic(path, json.as_bytes())?;
    restrict_permissions(path)
}

fn read_master_key(path: &Path) -> EngineResult<[u8; 32]> {
    let content = ckfs::retry_io(|| fs::read_to_string(path))?;
    let bytes = hex::decode(content.trim())
        .map_err(|_| EngineError::ConfigCorrupt("master key file is not valid hex".into()))?;
    bytes
        .try_into()
        .map_err(|_| EngineError::ConfigCorrupt("master key has wrong length".into()))
}

fn write_master_key(path: &Path, master: &[u8; 32]) -> EngineResult<()> {
    ckfs::write_atomic(path, hex::encode(master).as_bytes())?;
    restrict_permissions(path)
}

fn random_master() -> EngineResult<[u8; 32]> {
    let mut master = [0u8; 32];
    SystemRandom::new()
        .fill(&mut master)
        .map_err(|_| EngineError::Crypto("secure random unavailable".into()))?;
    Ok(master)
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> EngineResult<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> EngineResult<()> {
    Ok(())
}
