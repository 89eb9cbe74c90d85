//! Per-certificate state: parsed facts, SAN staging, user configuration,
//! path roles and the snapshot index.

use chrono::{DateTime, Utc};
use ck_archive::SnapshotEntry;
use ck_common::{EngineError, EngineResult};
use ck_crypto::{CryptoProvider, KeyType, ParsedCertificate, SubjectName};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;

use crate::types::{CertConfig, CertConfigPatch, CertKind};

/// Active and staged (idle) subject alternative names.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SanSet {
    pub domains: Vec<String>,
    pub ips: Vec<String>,
    pub idle_domains: Vec<String>,
    pub idle_ips: Vec<String>,
}

/// Outcome of an add-domain / add-ip request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AddOutcome {
    pub added: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AddOutcome {
    fn added() -> Self {
        Self {
            added: true,
            reason: None,
        }
    }

    fn rejected(reason: &str) -> Self {
        Self {
            added: false,
            reason: Some(reason.to_string()),
        }
    }
}

/// One certificate as tracked by the registry and persisted to
/// `certificates.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CertificateEntity {
    pub name: String,
    pub fingerprint: String,
    pub subject: String,
    pub issuer: String,
    pub valid_from: DateTime<Utc>,
    pub valid_to: DateTime<Utc>,
    pub cert_type: CertKind,
    pub key_type: KeyType,
    pub key_size: u32,
    pub signature_algorithm: String,
    pub sans: SanSet,
    pub paths: BTreeMap<String, PathBuf>,
    #[serde(rename = "isCA")]
    pub is_ca: bool,
    #[serde(rename = "isRootCA")]
    pub is_root_ca: bool,
    pub path_len_constraint: Option<u32>,
    pub serial_number: String,
    pub subject_key_identifier: String,
    pub authority_key_identifier: Option<String>,
    pub self_signed: bool,
    pub needs_passphrase: bool,
    pub config: CertConfig,
    pub snapshots: Vec<SnapshotEntry>,
    pub description: String,
    pub group: Option<String>,
    pub tags: Vec<String>,
    pub notifications: serde_json::Value,
    pub metadata: serde_json::Value,
}

impl Default for CertificateEntity {
    fn default() -> Self {
        Self {
            name: String::new(),
            fingerprint: String::new(),
            subject: String::new(),
            issuer: String::new(),
            valid_from: DateTime::UNIX_EPOCH,
            valid_to: DateTime::UNIX_EPOCH,
            cert_type: CertKind::Standard,
            key_type: KeyType::Ec,
            key_size: 0,
            signature_algorithm: String::new(),
            sans: SanSet::default(),
            paths: BTreeMap::new(),
            is_ca: false,
            is_root_ca: false,
            path_len_constraint: None,
            serial_number: String::new(),
            subject_key_identifier: String::new(),
            authority_key_identifier: None,
            self_signed: false,
            needs_passphrase: false,
            config: CertConfig::default(),
            snapshots: Vec::new(),
            description: String::new(),
            group: None,
            tags: Vec::new(),
            notifications: serde_json::Value::Object(serde_json::Map::new()),
            metadata: serde_json::Value::Object(serde_json::Map::new()),
        }
    }
}

impl CertificateEntity {
    /// Materialize a certificate discovered on disk.
    pub fn from_parsed(
        name: impl Into<String>,
        parsed: &ParsedCertificate,
        paths: BTreeMap<String, PathBuf>,
    ) -> Self {
        let mut entity = Self {
            name: name.into(),
            paths,
            ..Default::default()
        };
        entity.refresh_from_parsed(parsed);
        entity
    }

    /// Overwrite the parsed-fact fields from a fresh parse, preserving user
    /// fields: config, idle SANs, snapshots, name, description, tags, group,
    /// notifications, metadata and path roles.
    pub fn refresh_from_parsed(&mut self, parsed: &ParsedCertificate) {
        self.fingerprint = parsed.fingerprint.clone();
        self.subject = parsed.subject.clone();
        self.issuer = parsed.issuer.clone();
        self.valid_from = parsed.not_before;
        self.valid_to = parsed.not_after;
        self.key_type = parsed.key_type;
        self.key_size = parsed.key_size;
        self.signature_algorithm = parsed.signature_algorithm.clone();
        self.sans.domains = parsed.domains.clone();
        self.sans.ips = parsed.ips.clone();
        self.is_ca = parsed.is_ca;
        // A root CA is a self-signed CA; intermediates chain to another CA.
        self.is_root_ca = parsed.is_ca && parsed.self_signed;
        self.cert_type = CertKind::from_flags(self.is_ca, self.is_root_ca);
        self.path_len_constraint = parsed.path_len;
        self.serial_number = parsed.serial_number.clone();
        self.subject_key_identifier = parsed.subject_key_id.clone().unwrap_or_default();
        self.authority_key_identifier = parsed.authority_key_id.clone();
        self.self_signed = parsed.self_signed;

        if self.self_signed || self.is_root_ca {
            self.config.sign_with_ca = false;
            self.config.ca_fingerprint = None;
            self.config.ca_name = None;
        }
    }

    /// Re-parse the certificate file and refresh parsed facts.
    pub fn refresh_from_file(&mut self, crypto: &CryptoProvider) -> EngineResult<()> {
        let path = self.cert_path().ok_or_else(|| {
            EngineError::NotFound(format!("certificate file for {}", self.name))
        })?;
        let parsed = crypto.parse(&path)?;
        self.refresh_from_parsed(&parsed);
        Ok(())
    }

    /// The live certificate file (role `crt`, falling back to `pem`).
    pub fn cert_path(&self) -> Option<PathBuf> {
        self.paths
            .get("crt")
            .or_else(|| self.paths.get("pem"))
            .cloned()
    }

    pub fn key_path(&self) -> Option<PathBuf> {
        self.paths.get("key").cloned()
    }

    pub fn common_name(&self) -> String {
        SubjectName::from_dn(&self.subject).common_name
    }

    pub fn issuer_common_name(&self) -> String {
        SubjectName::from_dn(&self.issuer).common_name
    }

    // ── SAN staging ─────────────────────────────────────────────

    /// Stage (or directly activate) a DNS name. DNS comparison is
    /// case-insensitive.
    pub fn add_domain(&mut self, domain: &str, idle: bool) -> EngineResult<AddOutcome> {
        let domain = domain.trim().to_lowercase();
        if !is_valid_domain(&domain) {
            return Err(EngineError::BadInput(format!("invalid domain: {domain}")));
        }
        if contains_ci(&self.sans.domains, &domain) {
            return Ok(AddOutcome::rejected("already in active set"));
        }
        if contains_ci(&self.sans.idle_domains, &domain) {
            return Ok(AddOutcome::rejected("already staged"));
        }
        if idle {
            self.sans.idle_domains.push(domain);
        } else {
            self.sans.domains.push(domain);
        }
        Ok(AddOutcome::added())
    }

    /// Stage (or directly activate) an IP literal.
    pub fn add_ip(&mut self, ip: &str, idle: bool) -> EngineResult<AddOutcome> {
        let ip = ip.trim();
        let parsed: IpAddr = ip
            .parse()
            .map_err(|_| EngineError::BadInput(format!("invalid IP literal: {ip}")))?;
        let canonical = parsed.to_string();
        if self.sans.ips.contains(&canonical) {
            return Ok(AddOutcome::rejected("already in active set"));
        }
        if self.sans.idle_ips.contains(&canonical) {
            return Ok(AddOutcome::rejected("already staged"));
        }
        if idle {
            self.sans.idle_ips.push(canonical);
        } else {
            self.sans.ips.push(canonical);
        }
        Ok(AddOutcome::added())
    }

    pub fn remove_domain(&mut self, domain: &str, from_idle: bool) -> bool {
        let bucket = if from_idle {
            &mut self.sans.idle_domains
        } else {
            &mut self.sans.domains
        };
        let before = bucket.len();
        bucket.retain(|d| !d.eq_ignore_ascii_case(domain));
        bucket.len() != before
    }

    pub fn remove_ip(&mut self, ip: &str, from_idle: bool) -> bool {
        let bucket = if from_idle {
            &mut self.sans.idle_ips
        } else {
            &mut self.sans.ips
        };
        let before = bucket.len();
        bucket.retain(|i| i != ip);
        bucket.len() != before
    }

    /// Promote staged SANs into the active sets. Idempotent once the idle
    /// sets are empty. Returns whether anything moved.
    pub fn apply_idle_subjects(&mut self) -> bool {
        let mut changed = false;
        for domain in std::mem::take(&mut self.sans.idle_domains) {
            if !contains_ci(&self.sans.domains, &domain) {
                self.sans.domains.push(domain);
            }
            changed = true;
        }
        for ip in std::mem::take(&mut self.sans.idle_ips) {
            if !self.sans.ips.contains(&ip) {
                self.sans.ips.push(ip);
            }
            changed = true;
        }
        changed
    }

    // ── Configuration ───────────────────────────────────────────

    /// Apply a partial config update; `Some` fields win.
    pub fn update_config(&mut self, patch: &CertConfigPatch) {
        if let Some(auto_renew) = patch.auto_renew {
            self.config.auto_renew = auto_renew;
        }
        if let Some(days) = patch.renew_days_before_expiry {
            self.config.renew_days_before_expiry = days;
        }
        if let Some(sign_with_ca) = patch.sign_with_ca {
            self.config.sign_with_ca = sign_with_ca;
        }
        if let Some(ca_fingerprint) = &patch.ca_fingerprint {
            self.config.ca_fingerprint = ca_fingerprint
                .as_deref()
                .map(crate::types::normalize_fingerprint);
        }
        if let Some(actions) = &patch.deploy_actions {
            self.config.deploy_actions = actions.clone();
        }
        if let Some(days) = patch.validity_days {
            self.config.validity_days = days;
        }
        if let Some(key_usage) = &patch.key_usage {
            self.config.key_usage = key_usage.clone();
        }
        if let Some(eku) = &patch.extended_key_usage {
            self.config.extended_key_usage = eku.clone();
        }
    }

    // ── Derived state ───────────────────────────────────────────

    pub fn days_until_expiry(&self) -> i64 {
        (self.valid_to - Utc::now()).num_days()
    }

    pub fn is_due_for_renewal(&self, now: DateTime<Utc>) -> bool {
        self.config.auto_renew
            && !self.is_ca
            && (self.valid_to - now).num_days() < i64::from(self.config.renew_days_before_expiry)
    }

    pub fn last_snapshot_id(&self) -> u64 {
        self.snapshots.iter().map(|s| s.id).max().unwrap_or(0)
    }

    // ── Persistence ─────────────────────────────────────────────

    /// Canonical persisted form. Equal logical state serializes to identical
    /// bytes (fixed field order, sorted maps), which the registry relies on
    /// for its dirty check.
    pub fn to_persisted(&self) -> EngineResult<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_persisted(value: serde_json::Value) -> EngineResult<Self> {
        Ok(serde_json::from_value(value)?)
    }
}

fn contains_ci(haystack: &[String], needle: &str) -> bool {
    haystack.iter().any(|d| d.eq_ignore_ascii_case(needle))
}

fn is_valid_domain(domain: &str) -> bool {
    if domain.is_empty() || domain.len() > 253 {
        return false;
    }

    let body = domain.strip_prefix("*.").unwrap_or(domain);
    if body.is_empty() {
        return false;
    }

    body.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
            && !label.starts_with('-')
            && !label.ends_with('-')
    })
}

/// What the HTTP layer sees: the entity plus derived state, never the
/// stored passphrases themselves.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiCertificateView {
    #[serde(flatten)]
    pub certificate: CertificateEntity,
    pub common_name: String,
    pub issuer_common_name: String,
    pub days_until_expiry: i64,
    pub expired: bool,
    pub expiring_soon: bool,
    pub has_passphrase: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modification_time: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity_with_sans(domains: &[&str], ips: &[&str]) -> CertificateEntity {
        CertificateEntity {
            name: "web".to_string(),
            fingerprint: "aa".repeat(32),
            sans: SanSet {
                domains: domains.iter().map(|s| s.to_string()).collect(),
                ips: ips.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_add_domain_stages_idle_by_default() {
        let mut entity = entity_with_sans(&["example.test"], &[]);

        let outcome = entity.add_domain("api.example.test", true).unwrap();
        assert!(outcome.added);
        assert_eq!(entity.sans.idle_domains, vec!["api.example.test"]);
        assert_eq!(entity.sans.domains, vec!["example.test"]);
    }

    #[test]
    fn test_add_domain_rejects_duplicates_case_insensitively() {
        let mut entity = entity_with_sans(&["example.test"], &[]);

        let outcome = entity.add_domain("EXAMPLE.TEST", true).unwrap();
        assert!(!outcome.added);
        assert_eq!(outcome.reason.as_deref(), Some("already in active set"));

        entity.add_domain("api.example.test", true).unwrap();
        let again = entity.add_domain("API.example.test", true).unwrap();
        assert!(!again.added);
        assert_eq!(again.reason.as_deref(), Some("already staged"));
    }

    #[test]
    fn test_add_domain_validates() {
        let mut entity = entity_with_sans(&[], &[]);
        assert!(entity.add_domain("-bad.example", true).is_err());
        assert!(entity.add_domain("", true).is_err());
        assert!(entity.add_domain("*.example.test", true).unwrap().added);
    }

    #[test]
    fn test_add_ip_validates_literal() {
        let mut entity = entity_with_sans(&[], &[]);
        assert!(entity.add_ip("10.0.0.1", true).unwrap().added);
        let err = entity.add_ip("999.0.0.1", true).unwrap_err();
        assert_eq!(err.kind(), "BadInput");
    }

    #[test]
    fn test_apply_idle_subjects_is_idempotent() {
        let mut entity = entity_with_sans(&["example.test"], &["10.0.0.1"]);
        entity.add_domain("api.example.test", true).unwrap();
        entity.add_ip("10.0.0.2", true).unwrap();

        assert!(entity.apply_idle_subjects());
        assert_eq!(
            entity.sans.domains,
            vec!["example.test", "api.example.test"]
        );
        assert_eq!(entity.sans.ips, vec!["10.0.0.1", "10.0.0.2"]);
        assert!(entity.sans.idle_domains.is_empty());
        assert!(entity.sans.idle_ips.is_empty());

        // Second application is a no-op
        assert!(!entity.apply_idle_subjects());
        assert_eq!(entity.sans.domains.len(), 2);
    }

    #[test]
    fn test_remove_domain_from_buckets() {
        let mut entity = entity_with_sans(&["a.test", "b.test"], &[]);
        entity.add_domain("staged.test", true).unwrap();

        assert!(entity.remove_domain("A.TEST", false));
        assert!(!entity.remove_domain("a.test", false));
        assert!(entity.remove_domain("staged.test", true));
        assert_eq!(entity.sans.domains, vec!["b.test"]);
    }

    #[test]
    fn test_persisted_roundtrip_is_stable() {
        let mut entity = entity_with_sans(&["example.test"], &["10.0.0.1"]);
        entity.description = "front cert".to_string();
        entity.tags = vec!["prod".to_string()];
        entity
            .paths
            .insert("crt".to_string(), PathBuf::from("/certs/web/web.pem"));

        let persisted = entity.to_persisted().unwrap();
        let back = CertificateEntity::from_persisted(persisted.clone()).unwrap();
        assert_eq!(back, entity);

        // Byte-identical canonical form for equal logical state
        let again = back.to_persisted().unwrap();
        assert_eq!(
            serde_json::to_string(&persisted).unwrap(),
            serde_json::to_string(&again).unwrap()
        );
    }

    #[test]
    fn test_persisted_uses_spec_key_names() {
        let entity = entity_with_sans(&["example.test"], &[]);
        let value = entity.to_persisted().unwrap();
        for key in [
            "name",
            "fingerprint",
            "subject",
            "issuer",
            "validFrom",
            "validTo",
            "certType",
            "keyType",
            "keySize",
            "signatureAlgorithm",
            "sans",
            "paths",
            "isCA",
            "isRootCA",
            "pathLenConstraint",
            "serialNumber",
            "subjectKeyIdentifier",
            "authorityKeyIdentifier",
            "selfSigned",
            "needsPassphrase",
            "config",
            "snapshots",
            "description",
            "group",
            "tags",
            "notifications",
            "metadata",
        ] {
            assert!(value.get(key).is_some(), "missing key {key}");
        }
        assert!(value["sans"].get("idleDomains").is_some());
        assert!(value["config"].get("renewDaysBeforeExpiry").is_some());
    }
}
