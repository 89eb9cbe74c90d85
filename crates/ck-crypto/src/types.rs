use chrono::{DateTime, Utc};
use ck_common::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Key algorithm requested at generation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    Rsa { bits: u32 },
    EcP256,
    EcP384,
    Ed25519,
}

impl KeyAlgorithm {
    /// Build from the API-level `keyType` / `keySize` pair.
    pub fn from_request(key_type: &str, size_or_curve: Option<&str>) -> EngineResult<Self> {
        match key_type {
            "RSA" | "rsa" => {
                let bits: u32 = size_or_curve
                    .unwrap_or("2048")
                    .parse()
                    .map_err(|_| EngineError::BadInput("invalid RSA key size".into()))?;
                if !(2048..=8192).contains(&bits) {
                    return Err(EngineError::BadInput(format!(
                        "RSA key size out of range: {bits}"
                    )));
                }
                Ok(Self::Rsa { bits })
            }
            "EC" | "ec" => match size_or_curve.unwrap_or("P-256") {
                "P-256" | "prime256v1" | "256" => Ok(Self::EcP256),
                "P-384" | "secp384r1" | "384" => Ok(Self::EcP384),
                other => Err(EngineError::BadInput(format!("unsupported curve: {other}"))),
            },
            "Ed25519" | "ed25519" => Ok(Self::Ed25519),
            other => Err(EngineError::BadInput(format!(
                "unsupported key type: {other}"
            ))),
        }
    }

    pub fn key_type(&self) -> KeyType {
        match self {
            Self::Rsa { .. } => KeyType::Rsa,
            Self::EcP256 | Self::EcP384 => KeyType::Ec,
            Self::Ed25519 => KeyType::Ed25519,
        }
    }

    /// Key size in bits (curve size for EC, 256 for Ed25519).
    pub fn bits(&self) -> u32 {
        match self {
            Self::Rsa { bits } => *bits,
            Self::EcP256 => 256,
            Self::EcP384 => 384,
            Self::Ed25519 => 256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyType {
    #[serde(rename = "RSA")]
    Rsa,
    #[serde(rename = "EC")]
    Ec,
    #[serde(rename = "Ed25519")]
    Ed25519,
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rsa => write!(f, "RSA"),
            Self::Ec => write!(f, "EC"),
            Self::Ed25519 => write!(f, "Ed25519"),
        }
    }
}

/// Result of a key generation.
#[derive(Debug, Clone)]
pub struct KeyInfo {
    pub path: PathBuf,
    pub key_type: KeyType,
    pub key_size: u32,
    pub encrypted: bool,
}

/// Subject distinguished name fields used when issuing certificates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubjectName {
    pub common_name: String,
    pub organization: Option<String>,
    pub organizational_unit: Option<String>,
    pub country: Option<String>,
    pub state: Option<String>,
    pub locality: Option<String>,
}

impl SubjectName {
    pub fn new(common_name: impl Into<String>) -> Self {
        Self {
            common_name: common_name.into(),
            ..Default::default()
        }
    }

    /// Parse a `CN=foo, O=bar` style string back into fields.
    /// Unknown attribute types are dropped.
    pub fn from_dn(dn: &str) -> Self {
        let mut subject = Self::default();
        for part in dn.split(',') {
            let Some((key, value)) = part.split_once('=') else {
                continue;
            };
            let value = value.trim().to_string();
            match key.trim().to_uppercase().as_str() {
                "CN" => subject.common_name = value,
                "O" => subject.organization = Some(value),
                "OU" => subject.organizational_unit = Some(value),
                "C" => subject.country = Some(value),
                "ST" => subject.state = Some(value),
                "L" => subject.locality = Some(value),
                _ => {}
            }
        }
        subject
    }
}

/// Key usage flags baked into issued certificates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KeyUsageConfig {
    pub digital_signature: bool,
    pub content_commitment: bool,
    pub key_encipherment: bool,
    pub data_encipherment: bool,
    pub key_agreement: bool,
    pub key_cert_sign: bool,
    pub crl_sign: bool,
}

impl Default for KeyUsageConfig {
    fn default() -> Self {
        Self {
            digital_signature: true,
            content_commitment: false,
            key_encipherment: true,
            data_encipherment: false,
            key_agreement: false,
            key_cert_sign: false,
            crl_sign: false,
        }
    }
}

impl KeyUsageConfig {
    /// Defaults for a certificate authority.
    pub fn ca() -> Self {
        Self {
            digital_signature: true,
            key_encipherment: false,
            key_cert_sign: true,
            crl_sign: true,
            ..Default::default()
        }
    }
}

/// What to stamp into an issued certificate.
#[derive(Debug, Clone)]
pub struct CertSpec {
    pub subject: SubjectName,
    pub domains: Vec<String>,
    pub ips: Vec<String>,
    pub is_ca: bool,
    pub path_len: Option<u32>,
    pub key_usage: KeyUsageConfig,
    pub extended_key_usage: Vec<String>,
    pub validity_days: u32,
}

impl CertSpec {
    pub fn server(subject: SubjectName, validity_days: u32) -> Self {
        Self {
            subject,
            domains: Vec::new(),
            ips: Vec::new(),
            is_ca: false,
            path_len: None,
            key_usage: KeyUsageConfig::default(),
            extended_key_usage: vec!["serverAuth".to_string()],
            validity_days,
        }
    }

    pub fn authority(subject: SubjectName, validity_days: u32) -> Self {
        Self {
            subject,
            domains: Vec::new(),
            ips: Vec::new(),
            is_ca: true,
            path_len: None,
            key_usage: KeyUsageConfig::ca(),
            extended_key_usage: Vec::new(),
            validity_days,
        }
    }
}

/// Facts read out of an on-disk certificate.
#[derive(Debug, Clone)]
pub struct ParsedCertificate {
    /// SHA-256 over the DER encoding, lowercase hex, no separators.
    pub fingerprint: String,
    pub subject: String,
    pub issuer: String,
    pub common_name: String,
    pub issuer_common_name: String,
    pub serial_number: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub subject_key_id: Option<String>,
    pub authority_key_id: Option<String>,
    pub is_ca: bool,
    pub path_len: Option<u32>,
    pub domains: Vec<String>,
    pub ips: Vec<String>,
    pub self_signed: bool,
    pub key_type: KeyType,
    pub key_size: u32,
    pub signature_algorithm: String,
    pub key_usage: KeyUsageConfig,
    pub extended_key_usage: Vec<String>,
}
