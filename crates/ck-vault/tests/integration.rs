use ck_vault::PassphraseVault;
use std::fs;
use tempfile::tempdir;

/// Vérifie le cycle store / get / has / delete
#[test]
fn test_vault_lifecycle() {
    let dir = tempdir().unwrap();
    let vault = PassphraseVault::open(dir.path()).unwrap();

    assert!(!vault.has("abc123"));
    vault.store("ABC123", "s3cret").unwrap();

    // Lookup insensible à la casse du fingerprint
    assert!(vault.has("abc123"));
    assert_eq!(vault.get("abc123").as_deref(), Some("s3cret"));

    assert!(vault.delete("abc123").unwrap());
    assert!(!vault.has("abc123"));
    assert!(!vault.delete("abc123").unwrap());
}

/// Vérifie que le coffre se recharge depuis le disque
#[test]
fn test_vault_persists_across_reopen() {
    let dir = tempdir().unwrap();
    {
        let vault = PassphraseVault::open(dir.path()).unwrap();
        vault.store("aa11", "first").unwrap();
        vault.store("bb22", "second").unwrap();
    }

    let vault = PassphraseVault::open(dir.path()).unwrap();
    assert_eq!(vault.get("aa11").as_deref(), Some("first"));
    assert_eq!(vault.get("bb22").as_deref(), Some("second"));
    assert_eq!(vault.fingerprints().len(), 2);
}

/// Les passphrases n'apparaissent jamais en clair dans le fichier
#[test]
fn test_vault_file_never_contains_plaintext() {
    let dir = tempdir().unwrap();
    let vault = PassphraseVault::open(dir.path()).unwrap();
    vault.store("cc33", "tres-secret-phrase").unwrap();

    let raw = fs::read_to_string(dir.path().join("passphrases.enc")).unwrap();
    assert!(!raw.contains("tres-secret-phrase"));
}

/// La rotation de clé conserve les entrées et change les octets au repos
#[test]
fn test_rotate_key_preserves_plaintext() {
    let dir = tempdir().unwrap();
    let vault = PassphraseVault::open(dir.path()).unwrap();
    vault.store("dd44", "s3cret").unwrap();
    vault.store("ee55", "autre").unwrap();

    let vault_file = dir.path().join("passphrases.enc");
    let key_file = dir.path().join("vault.key");
    let raw_before = fs::read(&vault_file).unwrap();
    let key_before = fs::read(&key_file).unwrap();

    vault.rotate_key().unwrap();

    assert_eq!(vault.get("dd44").as_deref(), Some("s3cret"));
    assert_eq!(vault.get("ee55").as_deref(), Some("autre"));
    assert_ne!(fs::read(&vault_file).unwrap(), raw_before);
    assert_ne!(fs::read(&key_file).unwrap(), key_before);

    // Pas de fichier de rotation résiduel
    assert!(!dir.path().join("vault.key.new").exists());

    // Et le coffre reste lisible après redémarrage
    drop(vault);
    let reopened = PassphraseVault::open(dir.path()).unwrap();
    assert_eq!(reopened.get("dd44").as_deref(), Some("s3cret"));
}

/// Déplacement d'une entrée lors d'un changement de fingerprint
#[test]
fn test_rekey_moves_entry() {
    let dir = tempdir().unwrap();
    let vault = PassphraseVault::open(dir.path()).unwrap();
    vault.store("old", "pass").unwrap();

    assert!(vault.rekey("old", "new").unwrap());
    assert!(!vault.has("old"));
    assert_eq!(vault.get("new").as_deref(), Some("pass"));

    assert!(!vault.rekey("absent", "x").unwrap());
}

/// Coffre présent sans clé maîtresse: erreur explicite, fichier intact
#[test]
fn test_missing_master_key_is_an_error() {
    let dir = tempdir().unwrap();
    {
        let vault = PassphraseVault::open(dir.path()).unwrap();
        vault.store("ff66", "data").unwrap();
    }
    fs::remove_file(dir.path().join("vault.key")).unwrap();

    let err = PassphraseVault::open(dir.path()).unwrap_err();
    assert_eq!(err.kind(), "ConfigCorrupt");
    assert!(dir.path().join("passphrases.enc").exists());
}
