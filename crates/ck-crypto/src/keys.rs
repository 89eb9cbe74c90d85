//! Private key generation and passphrase protection.
//!
//! EC and Ed25519 keys come from `rcgen`; RSA generation goes through the
//! `rsa` crate since ring cannot generate RSA keys. Keys are stored as
//! PKCS#8 PEM. Passphrase protection wraps the PKCS#8 DER in an AEAD
//! container (PBKDF2-HMAC-SHA256 derived key, AES-256-GCM) emitted under an
//! `ENCRYPTED PRIVATE KEY` PEM label.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use ck_common::{EngineError, EngineResult, fs as ckfs};
use rcgen::KeyPair;
use ring::aead;
use ring::rand::{SecureRandom, SystemRandom};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use std::fs;
use std::num::NonZeroU32;
use std::path::Path;

use crate::types::{KeyAlgorithm, KeyInfo};

const ENCRYPTED_LABEL: &str = "ENCRYPTED PRIVATE KEY";
const PLAIN_LABEL: &str = "PRIVATE KEY";

const MAGIC: &[u8; 5] = b"CKEK1";
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_AAD: &[u8] = b"certkeep key wrap v1";
const PBKDF2_ITERATIONS: NonZeroU32 = NonZeroU32::new(210_000).unwrap();

/// Generate a private key at `path`, optionally passphrase-protected.
pub fn generate_key(
    path: &Path,
    algorithm: KeyAlgorithm,
    passphrase: Option<&str>,
) -> EngineResult<KeyInfo> {
    let plain_pem = match algorithm {
        KeyAlgorithm::Rsa { bits } => {
            let mut rng = rand_core::OsRng;
            let key = rsa::RsaPrivateKey::new(&mut rng, bits as usize)
                .map_err(|e| EngineError::Crypto(format!("RSA key generation failed: {e}")))?;
            key.to_pkcs8_pem(LineEnding::LF)
                .map_err(|e| EngineError::Crypto(format!("RSA key encoding failed: {e}")))?
                .to_string()
        }
        KeyAlgorithm::EcP256 => generate_rcgen(&rcgen::PKCS_ECDSA_P256_SHA256)?,
        KeyAlgorithm::EcP384 => generate_rcgen(&rcgen::PKCS_ECDSA_P384_SHA384)?,
        KeyAlgorithm::Ed25519 => generate_rcgen(&rcgen::PKCS_ED25519)?,
    };

    let (content, encrypted) = match passphrase {
        Some(pass) if !pass.is_empty() => (encrypt_key_pem(&plain_pem, pass)?, true),
        _ => (plain_pem, false),
    };

    ckfs::write_atomic(path, content.as_bytes())?;
    restrict_permissions(path)?;

    Ok(KeyInfo {
        path: path.to_path_buf(),
        key_type: algorithm.key_type(),
        key_size: algorithm.bits(),
        encrypted,
    })
}

fn generate_rcgen(alg: &'static rcgen::SignatureAlgorithm) -> EngineResult<String> {
    let key = KeyPair::generate_for(alg)
        .map_err(|e| EngineError::Crypto(format!("key generation failed: {e}")))?;
    Ok(key.serialize_pem())
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

/// True iff the on-disk key is passphrase-protected.
pub fn is_key_encrypted(path: &Path) -> EngineResult<bool> {
    let content = ckfs::retry_io(|| fs::read_to_string(path))?;
    Ok(is_encrypted_pem(&content))
}

pub fn is_encrypted_pem(content: &str) -> bool {
    content.contains(ENCRYPTED_LABEL)
}

/// Load a key pair for signing, decrypting it if needed.
///
/// An encrypted key without a passphrase, or with the wrong one, yields
/// `WrongPassphrase` so the caller can prompt.
pub fn load_key_pair(path: &Path, passphrase: Option<&str>) -> EngineResult<KeyPair> {
    let content = ckfs::retry_io(|| fs::read_to_string(path))?;

    let plain_pem = if is_encrypted_pem(&content) {
        let pass = match passphrase {
            Some(p) if !p.is_empty() => p,
            _ => return Err(EngineError::WrongPassphrase),
        };
        decrypt_key_pem(&content, pass)?
    } else {
        content
    };

    KeyPair::from_pem(&plain_pem)
        .map_err(|e| EngineError::Crypto(format!("key parse failed: {e}")))
}

/// Wrap a plain PKCS#8 PEM under a passphrase.
pub fn encrypt_key_pem(plain_pem: &str, passphrase: &str) -> EngineResult<String> {
    let der = pem_decode(plain_pem, PLAIN_LABEL)
        .ok_or_else(|| EngineError::Crypto("no PKCS#8 private key block found".into()))?;

    let rng = SystemRandom::new();
    let mut salt = [0u8; SALT_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    rng.fill(&mut salt)
        .map_err(|_| EngineError::Crypto("secure random unavailable".into()))?;
    rng.fill(&mut nonce)
        .map_err(|_| EngineError::Crypto("secure random unavailable".into()))?;

    let key = derive_wrap_key(passphrase, &salt);
    let sealed = seal(&key, nonce, der)?;

    let mut payload = Vec::with_capacity(MAGIC.len() + SALT_LEN + NONCE_LEN + sealed.len());
    payload.extend_from_slice(MAGIC);
    payload.extend_from_slice(&salt);
    payload.extend_from_slice(&nonce);
    payload.extend_from_slice(&sealed);

    Ok(pem_encode(ENCRYPTED_LABEL, &payload))
}

/// Unwrap an encrypted key back to plain PKCS#8 PEM.
pub fn decrypt_key_pem(content: &str, passphrase: &str) -> EngineResult<String> {
    let payload = pem_decode(content, ENCRYPTED_LABEL)
        .ok_or_else(|| EngineError::Crypto("no encrypted key block found".into()))?;

    if payload.len() < MAGIC.len() + SALT_LEN + NONCE_LEN + aead::AES_256_GCM.tag_len()
        || &payload[..MAGIC.len()] != MAGIC
    {
        return Err(EngineError::Crypto("unrecognized encrypted key format".into()));
    }

    let salt = &payload[MAGIC.len()..MAGIC.len() + SALT_LEN];
    let nonce_start = MAGIC.len() + SALT_LEN;
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&payload[nonce_start..nonce_start + NONCE_LEN]);
    let ciphertext = payload[nonce_start + NONCE_LEN..].to_vec();

    let key = derive_wrap_key(passphrase, salt);
    let der = open(&key, nonce, ciphertext)?;

    Ok(pem_encode(PLAIN_LABEL, &der))
}

fn derive_wrap_key(passphrase: &str, salt: &[u8]) -> [u8; 32] {
    let mut key = [0u8; 32];
    ring::pbkdf2::derive(
        ring::pbkdf2::PBKDF2_HMAC_SHA256,
        PBKDF2_ITERATIONS,
        salt,
        passphrase.as_bytes(),
        &mut key,
    );
    key
}

fn seal(key: &[u8; 32], nonce: [u8; NONCE_LEN], mut data: Vec<u8>) -> EngineResult<Vec<u8>> {
    let unbound = aead::UnboundKey::new(&aead::AES_256_GCM, key)
        .map_err(|_| EngineError::Crypto("AEAD key rejected".into()))?;
    let sealing = aead::LessSafeKey::new(unbound);
    sealing
        .seal_in_place_append_tag(
            aead::Nonce::assume_unique_for_key(nonce),
            aead::Aad::from(KEY_AAD),
            &mut data,
        )
        .map_err(|_| EngineError::Crypto("AEAD seal failed".into()))?;
    Ok(data)
}

fn open(key: &[u8; 32], nonce: [u8; NONCE_LEN], mut data: Vec<u8>) -> EngineResult<Vec<u8>> {
    let unbound = aead::UnboundKey::new(&aead::AES_256_GCM, key)
        .map_err(|_| EngineError::Crypto("AEAD key rejected".into()))?;
    let opening = aead::LessSafeKey::new(unbound);
    let plain = opening
        .open_in_place(
            aead::Nonce::assume_unique_for_key(nonce),
            aead::Aad::from(KEY_AAD),
            &mut data,
        )
        .map_err(|_| EngineError::WrongPassphrase)?;
    Ok(plain.to_vec())
}

pub(crate) fn pem_encode(label: &str, der: &[u8]) -> String {
    let b64 = BASE64.encode(der);
    let mut out = format!("-----BEGIN {label}-----\n");
    for chunk in b64.as_bytes().chunks(64) {
        out.push_str(&String::from_utf8_lossy(chunk));
        out.push('\n');
    }
    out.push_str(&format!("-----END {label}-----\n"));
    out
}

pub(crate) fn pem_decode(content: &str, label: &str) -> Option<Vec<u8>> {
    let begin = format!("-----BEGIN {label}-----");
    let end = format!("-----END {label}-----");
    let start = content.find(&begin)? + begin.len();
    let stop = content[start..].find(&end)? + start;
    let b64: String = content[start..stop]
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    BASE64.decode(b64).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_generate_ec_key_plain() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("server.key");

        let info = generate_key(&path, KeyAlgorithm::EcP256, None).unwrap();
        assert!(!info.encrypted);
        assert_eq!(info.key_size, 256);

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("BEGIN PRIVATE KEY"));
        assert!(!is_key_encrypted(&path).unwrap());

        // The key must load without a passphrase
        load_key_pair(&path, None).unwrap();
    }

    #[test]
    fn test_generate_encrypted_key_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("server.key");

        let info = generate_key(&path, KeyAlgorithm::EcP256, Some("s3cret")).unwrap();
        assert!(info.encrypted);
        assert!(is_key_encrypted(&path).unwrap());

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("BEGIN ENCRYPTED PRIVATE KEY"));

        // Correct passphrase loads
        load_key_pair(&path, Some("s3cret")).unwrap();

        // Wrong or missing passphrase is distinguished
        assert!(matches!(
            load_key_pair(&path, Some("nope")),
            Err(EngineError::WrongPassphrase)
        ));
        assert!(matches!(
            load_key_pair(&path, None),
            Err(EngineError::WrongPassphrase)
        ));
    }

    #[test]
    fn test_generate_ed25519_key() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ed.key");

        let info = generate_key(&path, KeyAlgorithm::Ed25519, None).unwrap();
        assert_eq!(info.key_type, crate::types::KeyType::Ed25519);
        load_key_pair(&path, None).unwrap();
    }

    #[test]
    fn test_generate_rsa_key() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rsa.key");

        let info = generate_key(&path, KeyAlgorithm::Rsa { bits: 2048 }, None).unwrap();
        assert_eq!(info.key_type, crate::types::KeyType::Rsa);
        assert_eq!(info.key_size, 2048);
        load_key_pair(&path, None).unwrap();
    }

    #[test]
    fn test_pem_roundtrip() {
        let der = vec![0x30, 0x82, 0x01, 0x0a, 0xff, 0x00, 0x42];
        let pem = pem_encode("PRIVATE KEY", &der);
        assert_eq!(pem_decode(&pem, "PRIVATE KEY").unwrap(), der);
        assert!(pem_decode(&pem, "CERTIFICATE").is_none());
    }
}
