//! X.509 certificate parsing.
//!
//! Reads PEM or DER from disk and extracts the facts the registry tracks:
//! subject and issuer, validity window, SAN lists, SKI/AKI, basic
//! constraints, key material info and the canonical SHA-256 fingerprint.

use chrono::{DateTime, Utc};
use ck_common::{EngineError, EngineResult, fs as ckfs};
use sha2::{Digest, Sha256};
use std::fs;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;
use x509_parser::oid_registry::{
    OID_PKCS1_SHA256WITHRSA, OID_PKCS1_SHA384WITHRSA, OID_PKCS1_SHA512WITHRSA, OID_SIG_ECDSA_WITH_SHA256,
    OID_SIG_ECDSA_WITH_SHA384, OID_SIG_ED25519,
};
use x509_parser::prelude::*;
use x509_parser::public_key::PublicKey;

use crate::types::{KeyType, KeyUsageConfig, ParsedCertificate};

/// File extensions the discovery scan treats as certificates.
pub const CERT_EXTENSIONS: [&str; 4] = ["crt", "pem", "cer", "cert"];

/// Canonical fingerprint: SHA-256 over DER, lowercase hex.
pub fn fingerprint_der(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

/// Read a certificate file (PEM or raw DER) into DER bytes.
pub fn read_cert_der(path: &Path) -> EngineResult<Vec<u8>> {
    let bytes = ckfs::retry_io(|| fs::read(path))?;

    if bytes.windows(27).any(|w| w == b"-----BEGIN CERTIFICATE-----") {
        let mut reader = std::io::BufReader::new(bytes.as_slice());
        let der = rustls_pemfile::certs(&mut reader)
            .next()
            .ok_or_else(|| {
                EngineError::BadInput(format!("no certificate in {}", path.display()))
            })?
            .map_err(|e| EngineError::BadInput(format!("PEM decode failed: {e}")))?;
        Ok(der.as_ref().to_vec())
    } else {
        // Raw DER (.der files, or PEM-less blobs)
        Ok(bytes)
    }
}

/// Parse the certificate at `path`.
pub fn parse_certificate(path: &Path) -> EngineResult<ParsedCertificate> {
    let der = read_cert_der(path)?;
    parse_der(&der)
}

pub fn parse_der(der: &[u8]) -> EngineResult<ParsedCertificate> {
    let (_, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|e| EngineError::Crypto(format!("certificate parse failed: {e}")))?;

    let subject = cert.subject().to_string();
    let issuer = cert.issuer().to_string();
    let common_name = common_name_of(cert.subject());
    let issuer_common_name = common_name_of(cert.issuer());

    let not_before = datetime_from_unix(cert.validity().not_before.timestamp());
    let not_after = datetime_from_unix(cert.validity().not_after.timestamp());

    let mut subject_key_id = None;
    let mut authority_key_id = None;
    let mut is_ca = false;
    let mut path_len = None;
    let mut domains = Vec::new();
    let mut ips = Vec::new();
    let mut key_usage = KeyUsageConfig::default();
    let mut extended_key_usage = Vec::new();

    for ext in cert.extensions() {
        match ext.parsed_extension() {
            ParsedExtension::SubjectKeyIdentifier(kid) => {
                subject_key_id = Some(hex::encode(kid.0));
            }
            ParsedExtension::AuthorityKeyIdentifier(aki) => {
                authority_key_id = aki.key_identifier.as_ref().map(|kid| hex::encode(kid.0));
            }
            ParsedExtension::BasicConstraints(bc) => {
                is_ca = bc.ca;
                path_len = bc.path_len_constraint;
            }
            ParsedExtension::SubjectAlternativeName(san) => {
                for name in &san.general_names {
                    match name {
                        GeneralName::DNSName(dns) => domains.push(dns.to_string()),
                        GeneralName::IPAddress(bytes) => {
                            if let Some(ip) = ip_from_bytes(bytes) {
                                ips.push(ip);
                            }
                        }
                        _ => {}
                    }
                }
            }
            ParsedExtension::KeyUsage(ku) => {
                key_usage = KeyUsageConfig {
                    digital_signature: ku.digital_signature(),
                    content_commitment: ku.non_repudiation(),
                    key_encipherment: ku.key_encipherment(),
                    data_encipherment: ku.data_encipherment(),
                    key_agreement: ku.key_agreement(),
                    key_cert_sign: ku.key_cert_sign(),
                    crl_sign: ku.crl_sign(),
                };
            }
            ParsedExtension::ExtendedKeyUsage(eku) => {
                extended_key_usage = eku_names(eku);
            }
            _ => {}
        }
    }

    let (key_type, key_size) = public_key_info(&cert)?;

    Ok(ParsedCertificate {
        fingerprint: fingerprint_der(der),
        self_signed: cert.subject() == cert.issuer(),
        subject,
        issuer,
        common_name,
        issuer_common_name,
        serial_number: hex::encode(cert.raw_serial()),
        not_before,
        not_after,
        subject_key_id,
        authority_key_id,
        is_ca,
        path_len,
        domains,
        ips,
        key_type,
        key_size,
        signature_algorithm: signature_algorithm_name(&cert),
        key_usage,
        extended_key_usage,
    })
}

fn common_name_of(name: &X509Name<'_>) -> String {
    name.iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn datetime_from_unix(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or(DateTime::UNIX_EPOCH)
}

fn ip_from_bytes(bytes: &[u8]) -> Option<String> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(Ipv4Addr::from(octets).to_string())
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(Ipv6Addr::from(octets).to_string())
        }
        _ => None,
    }
}

fn eku_names(eku: &ExtendedKeyUsage<'_>) -> Vec<String> {
    let mut names = Vec::new();
    if eku.server_auth {
        names.push("serverAuth".to_string());
    }
    if eku.client_auth {
        names.push("clientAuth".to_string());
    }
    if eku.code_signing {
        names.push("codeSigning".to_string());
    }
    if eku.email_protection {
        names.push("emailProtection".to_string());
    }
    if eku.time_stamping {
        names.push("timeStamping".to_string());
    }
    names
}

fn public_key_info(cert: &X509Certificate<'_>) -> EngineResult<(KeyType, u32)> {
    let spki = cert.public_key();
    match spki.parsed() {
        Ok(PublicKey::RSA(rsa)) => Ok((KeyType::Rsa, rsa.key_size() as u32)),
        Ok(PublicKey::EC(point)) => Ok((KeyType::Ec, point.key_size() as u32)),
        _ => {
            if spki.algorithm.algorithm == OID_SIG_ED25519 {
                Ok((KeyType::Ed25519, 256))
            } else {
                Err(EngineError::Crypto(format!(
                    "unsupported public key algorithm: {}",
                    spki.algorithm.algorithm.to_id_string()
                )))
            }
        }
    }
}

fn signature_algorithm_name(cert: &X509Certificate<'_>) -> String {
    let oid = &cert.signature_algorithm.algorithm;
    if *oid == OID_PKCS1_SHA256WITHRSA {
        "sha256WithRSAEncryption".to_string()
    } else if *oid == OID_PKCS1_SHA384WITHRSA {
        "sha384WithRSAEncryption".to_string()
    } else if *oid == OID_PKCS1_SHA512WITHRSA {
        "sha512WithRSAEncryption".to_string()
    } else if *oid == OID_SIG_ECDSA_WITH_SHA256 {
        "ecdsa-with-SHA256".to_string()
    } else if *oid == OID_SIG_ECDSA_WITH_SHA384 {
        "ecdsa-with-SHA384".to_string()
    } else if *oid == OID_SIG_ED25519 {
        "Ed25519".to_string()
    } else {
        oid.to_id_string()
    }
}
