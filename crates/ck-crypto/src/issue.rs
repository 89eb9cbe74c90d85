//! Certificate issuance: self-signing, CSR creation, CA signing, renewal.

use ck_common::{EngineError, EngineResult, fs as ckfs};
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use tracing::debug;

use crate::keys;
use crate::parse;
use crate::types::{CertSpec, KeyAlgorithm, KeyInfo, KeyUsageConfig, ParsedCertificate, SubjectName};

/// Issuer material for CA-signed operations.
#[derive(Debug, Clone, Copy)]
pub struct IssuerFiles<'a> {
    pub cert_path: &'a Path,
    pub key_path: &'a Path,
    pub passphrase: Option<&'a str>,
}

/// All key/CSR/certificate operations the lifecycle engine performs.
///
/// Stateless; crypto work is CPU-bound and callers are expected to run it
/// on a blocking pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct CryptoProvider;

impl CryptoProvider {
    pub fn new() -> Self {
        Self
    }

    pub fn generate_key(
        &self,
        path: &Path,
        algorithm: KeyAlgorithm,
        passphrase: Option<&str>,
    ) -> EngineResult<KeyInfo> {
        keys::generate_key(path, algorithm, passphrase)
    }

    pub fn is_key_encrypted(&self, path: &Path) -> EngineResult<bool> {
        keys::is_key_encrypted(path)
    }

    pub fn parse(&self, path: &Path) -> EngineResult<ParsedCertificate> {
        parse::parse_certificate(path)
    }

    /// Write a CSR for the key at `key_path`.
    pub fn create_csr(
        &self,
        key_path: &Path,
        passphrase: Option<&str>,
        spec: &CertSpec,
        csr_path: &Path,
    ) -> EngineResult<()> {
        let key = keys::load_key_pair(key_path, passphrase)?;
        let params = build_params(spec)?;
        let csr = params
            .serialize_request(&key)
            .map_err(|e| EngineError::Crypto(format!("CSR generation failed: {e}")))?;
        let pem = csr
            .pem()
            .map_err(|e| EngineError::Crypto(format!("CSR encoding failed: {e}")))?;
        ckfs::write_atomic(csr_path, pem.as_bytes())?;
        Ok(())
    }

    /// Self-sign a certificate with the key at `key_path`.
    pub fn self_sign(
        &self,
        key_path: &Path,
        passphrase: Option<&str>,
        spec: &CertSpec,
        cert_path: &Path,
    ) -> EngineResult<ParsedCertificate> {
        let key = keys::load_key_pair(key_path, passphrase)?;
        let params = build_params(spec)?;
        let cert = params
            .self_signed(&key)
            .map_err(|e| EngineError::Crypto(format!("self-sign failed: {e}")))?;
        ckfs::write_atomic(cert_path, cert.pem().as_bytes())?;
        debug!(cert = %cert_path.display(), "self-signed certificate written");
        parse::parse_certificate(cert_path)
    }

    /// Sign the CSR at `csr_path` with the given CA.
    pub fn sign_csr(
        &self,
        csr_path: &Path,
        issuer: IssuerFiles<'_>,
        validity_days: u32,
        cert_path: &Path,
    ) -> EngineResult<ParsedCertificate> {
        let (ca_cert, ca_key) = load_issuer(issuer)?;

        let csr_pem = ckfs::retry_io(|| fs::read_to_string(csr_path))?;
        let mut csr = CertificateSigningRequestParams::from_pem(&csr_pem)
            .map_err(|e| EngineError::BadInput(format!("CSR parse failed: {e}")))?;

        let now = time::OffsetDateTime::now_utc();
        csr.params.not_before = now;
        csr.params.not_after = now + time::Duration::days(i64::from(validity_days));
        csr.params.use_authority_key_identifier_extension = true;

        let cert = csr
            .signed_by(&ca_cert, &ca_key)
            .map_err(|e| EngineError::Crypto(format!("CSR signing failed: {e}")))?;
        ckfs::write_atomic(cert_path, cert.pem().as_bytes())?;
        debug!(cert = %cert_path.display(), "CA-signed certificate written");
        parse::parse_certificate(cert_path)
    }

    /// Re-issue the certificate at `existing_cert_path` with a fresh validity
    /// window, preserving subject, SANs and (through key reuse) the SKI.
    pub fn renew(
        &self,
        existing_cert_path: &Path,
        new_cert_path: &Path,
        key_path: &Path,
        key_passphrase: Option<&str>,
        issuer: Option<IssuerFiles<'_>>,
        validity_days: u32,
    ) -> EngineResult<ParsedCertificate> {
        let existing = parse::parse_certificate(existing_cert_path)?;
        let key = keys::load_key_pair(key_path, key_passphrase)?;

        let spec = CertSpec {
            subject: SubjectName::from_dn(&existing.subject),
            domains: existing.domains.clone(),
            ips: existing.ips.clone(),
            is_ca: existing.is_ca,
            path_len: existing.path_len,
            key_usage: existing.key_usage.clone(),
            extended_key_usage: existing.extended_key_usage.clone(),
            validity_days,
        };
        let mut params = build_params(&spec)?;

        let cert = match issuer {
            Some(files) => {
                let (ca_cert, ca_key) = load_issuer(files)?;
                params.use_authority_key_identifier_extension = true;
                params
                    .signed_by(&key, &ca_cert, &ca_key)
                    .map_err(|e| EngineError::Crypto(format!("renewal signing failed: {e}")))?
            }
            None => params
                .self_signed(&key)
                .map_err(|e| EngineError::Crypto(format!("renewal self-sign failed: {e}")))?,
        };

        ckfs::write_atomic(new_cert_path, cert.pem().as_bytes())?;
        parse::parse_certificate(new_cert_path)
    }
}

fn load_issuer(issuer: IssuerFiles<'_>) -> EngineResult<(rcgen::Certificate, KeyPair)> {
    let ca_key = keys::load_key_pair(issuer.key_path, issuer.passphrase)?;
    let ca_pem = ckfs::retry_io(|| fs::read_to_string(issuer.cert_path))?;
    let ca_params = CertificateParams::from_ca_cert_pem(&ca_pem)
        .map_err(|e| EngineError::Crypto(format!("CA certificate parse failed: {e}")))?;
    // Rebuild a signing handle from the CA's params and key; the DN and key
    // identifier carried into issued certificates match the on-disk CA.
    let ca_cert = ca_params
        .self_signed(&ca_key)
        .map_err(|e| EngineError::Crypto(format!("CA certificate rebuild failed: {e}")))?;
    Ok((ca_cert, ca_key))
}

fn build_params(spec: &CertSpec) -> EngineResult<CertificateParams> {
    let mut params = CertificateParams::new(spec.domains.clone())
        .map_err(|e| EngineError::BadInput(format!("invalid subject alt names: {e}")))?;

    for ip in &spec.ips {
        let addr: IpAddr = ip
            .parse()
            .map_err(|_| EngineError::BadInput(format!("invalid IP literal: {ip}")))?;
        params.subject_alt_names.push(SanType::IpAddress(addr));
    }

    params.distinguished_name = build_dn(&spec.subject);

    if spec.is_ca {
        params.is_ca = IsCa::Ca(match spec.path_len {
            Some(depth) => BasicConstraints::Constrained(depth as u8),
            None => BasicConstraints::Unconstrained,
        });
    }

    params.key_usages = key_usages(&spec.key_usage);
    params.extended_key_usages = extended_key_usages(&spec.extended_key_usage)?;

    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(i64::from(spec.validity_days));

    Ok(params)
}

fn build_dn(subject: &SubjectName) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    if let Some(country) = &subject.country {
        dn.push(DnType::CountryName, country);
    }
    if let Some(state) = &subject.state {
        dn.push(DnType::StateOrProvinceName, state);
    }
    if let Some(locality) = &subject.locality {
        dn.push(DnType::LocalityName, locality);
    }
    if let Some(org) = &subject.organization {
        dn.push(DnType::OrganizationName, org);
    }
    if let Some(unit) = &subject.organizational_unit {
        dn.push(DnType::OrganizationalUnitName, unit);
    }
    if !subject.common_name.is_empty() {
        dn.push(DnType::CommonName, &subject.common_name);
    }
    dn
}

fn key_usages(config: &KeyUsageConfig) -> Vec<KeyUsagePurpose> {
    let mut usages = Vec::new();
    if config.digital_signature {
        usages.push(KeyUsagePurpose::DigitalSignature);
    }
    if config.content_commitment {
        usages.push(KeyUsagePurpose::ContentCommitment);
    }
    if config.key_encipherment {
        usages.push(KeyUsagePurpose::KeyEncipherment);
    }
    if config.data_encipherment {
        usages.push(KeyUsagePurpose::DataEncipherment);
    }
    if config.key_agreement {
        usages.push(KeyUsagePurpose::KeyAgreement);
    }
    if config.key_cert_sign {
        usages.push(KeyUsagePurpose::KeyCertSign);
    }
    if config.crl_sign {
        usages.push(KeyUsagePurpose::CrlSign);
    }
    usages
}

fn extended_key_usages(names: &[String]) -> EngineResult<Vec<ExtendedKeyUsagePurpose>> {
    names
        .iter()
        .map(|name| match name.as_str() {
            "serverAuth" => Ok(ExtendedKeyUsagePurpose::ServerAuth),
            "clientAuth" => Ok(ExtendedKeyUsagePurpose::ClientAuth),
            "codeSigning" => Ok(ExtendedKeyUsagePurpose::CodeSigning),
            "emailProtection" => Ok(ExtendedKeyUsagePurpose::EmailProtection),
            "timeStamping" => Ok(ExtendedKeyUsagePurpose::TimeStamping),
            other => Err(EngineError::BadInput(format!(
                "unsupported extended key usage: {other}"
            ))),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_ca(dir: &Path, crypto: &CryptoProvider) -> (std::path::PathBuf, std::path::PathBuf) {
        let key_path = dir.join("ca.key");
        let cert_path = dir.join("ca.pem");
        crypto
            .generate_key(&key_path, KeyAlgorithm::EcP256, None)
            .unwrap();
        crypto
            .self_sign(
                &key_path,
                None,
                &CertSpec::authority(SubjectName::new("TestCA"), 3650),
                &cert_path,
            )
            .unwrap();
        (cert_path, key_path)
    }

    #[test]
    fn test_sign_csr_links_leaf_to_ca() {
        let dir = tempdir().unwrap();
        let crypto = CryptoProvider::new();
        let (ca_cert, ca_key) = make_ca(dir.path(), &crypto);

        let leaf_key = dir.path().join("leaf.key");
        let leaf_csr = dir.path().join("leaf.csr");
        let leaf_cert = dir.path().join("leaf.pem");
        crypto
            .generate_key(&leaf_key, KeyAlgorithm::EcP256, None)
            .unwrap();

        let mut spec = CertSpec::server(SubjectName::new("leaf.example.test"), 90);
        spec.domains = vec!["leaf.example.test".to_string()];
        crypto.create_csr(&leaf_key, None, &spec, &leaf_csr).unwrap();

        let issuer = IssuerFiles {
            cert_path: &ca_cert,
            key_path: &ca_key,
            passphrase: None,
        };
        let parsed = crypto.sign_csr(&leaf_csr, issuer, 90, &leaf_cert).unwrap();

        let ca_parsed = crypto.parse(&ca_cert).unwrap();
        assert_eq!(parsed.issuer_common_name, "TestCA");
        assert!(!parsed.self_signed);
        // AKI of the leaf must point at the CA's SKI
        assert_eq!(parsed.authority_key_id, ca_parsed.subject_key_id);
    }

    #[test]
    fn test_renew_preserves_subject_and_ski() {
        let dir = tempdir().unwrap();
        let crypto = CryptoProvider::new();

        let key_path = dir.path().join("site.key");
        let cert_path = dir.path().join("site.pem");
        crypto
            .generate_key(&key_path, KeyAlgorithm::EcP256, None)
            .unwrap();
        let mut spec = CertSpec::server(SubjectName::new("site.test"), 30);
        spec.domains = vec!["site.test".to_string(), "alt.site.test".to_string()];
        spec.ips = vec!["192.168.1.10".to_string()];
        let first = crypto.self_sign(&key_path, None, &spec, &cert_path).unwrap();

        let renewed_path = dir.path().join("site-renewed.pem");
        let renewed = crypto
            .renew(&cert_path, &renewed_path, &key_path, None, None, 60)
            .unwrap();

        assert_eq!(renewed.common_name, first.common_name);
        assert_eq!(renewed.domains, first.domains);
        assert_eq!(renewed.ips, first.ips);
        assert_eq!(renewed.subject_key_id, first.subject_key_id);
        // Fresh serial → new fingerprint
        assert_ne!(renewed.fingerprint, first.fingerprint);
        assert!(renewed.not_after > first.not_after);
    }

    #[test]
    fn test_sign_csr_with_encrypted_ca_key() {
        let dir = tempdir().unwrap();
        let crypto = CryptoProvider::new();

        let ca_key = dir.path().join("ca.key");
        let ca_cert = dir.path().join("ca.pem");
        crypto
            .generate_key(&ca_key, KeyAlgorithm::EcP256, Some("ca-pass"))
            .unwrap();
        crypto
            .self_sign(
                &ca_key,
                Some("ca-pass"),
                &CertSpec::authority(SubjectName::new("Locked CA"), 3650),
                &ca_cert,
            )
            .unwrap();

        let leaf_key = dir.path().join("leaf.key");
        let leaf_csr = dir.path().join("leaf.csr");
        let leaf_cert = dir.path().join("leaf.pem");
        crypto
            .generate_key(&leaf_key, KeyAlgorithm::EcP256, None)
            .unwrap();
        let mut spec = CertSpec::server(SubjectName::new("locked.test"), 90);
        spec.domains = vec!["locked.test".to_string()];
        crypto.create_csr(&leaf_key, None, &spec, &leaf_csr).unwrap();

        // Wrong CA passphrase is surfaced as WrongPassphrase
        let bad = crypto.sign_csr(
            &leaf_csr,
            IssuerFiles {
                cert_path: &ca_cert,
                key_path: &ca_key,
                passphrase: Some("wrong"),
            },
            90,
            &leaf_cert,
        );
        assert!(matches!(bad, Err(EngineError::WrongPassphrase)));

        crypto
            .sign_csr(
                &leaf_csr,
                IssuerFiles {
                    cert_path: &ca_cert,
                    key_path: &ca_key,
                    passphrase: Some("ca-pass"),
                },
                90,
                &leaf_cert,
            )
            .unwrap();
    }

    #[test]
    fn test_bad_ip_rejected() {
        let mut spec = CertSpec::server(SubjectName::new("x.test"), 30);
        spec.ips = vec!["not-an-ip".to_string()];
        let err = build_params(&spec).unwrap_err();
        assert_eq!(err.kind(), "BadInput");
    }
}
