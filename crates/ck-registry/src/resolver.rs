//! Binds each non-self-signed certificate to its issuing CA within the set.
//!
//! Primary match is AKI against the candidate CAs' SKIs; the fallback
//! compares normalized distinguished names. A certificate whose issuer
//! cannot be found has its CA link cleared.

use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::entity::CertificateEntity;

/// Resolve issuers for every certificate in the map. Returns the
/// fingerprints whose CA link changed.
pub fn resolve_all(certificates: &mut BTreeMap<String, CertificateEntity>) -> Vec<String> {
    struct Candidate {
        fingerprint: String,
        name: String,
        ski: Option<String>,
        normalized_subject: String,
    }

    let candidates: Vec<Candidate> = certificates
        .values()
        .filter(|c| c.is_ca)
        .map(|c| Candidate {
            fingerprint: c.fingerprint.clone(),
            name: c.name.clone(),
            ski: (!c.subject_key_identifier.is_empty())
                .then(|| c.subject_key_identifier.to_lowercase()),
            normalized_subject: normalize_dn(&c.subject),
        })
        .collect();

    let mut changed = Vec::new();

    for cert in certificates.values_mut() {
        let before = (
            cert.config.sign_with_ca,
            cert.config.ca_fingerprint.clone(),
            cert.config.ca_name.clone(),
        );

        if cert.self_signed || cert.is_root_ca {
            cert.config.sign_with_ca = false;
            cert.config.ca_fingerprint = None;
            cert.config.ca_name = None;
        } else {
            // Primary: unique AKI ↔ SKI match
            let mut issuer = cert.authority_key_identifier.as_ref().and_then(|aki| {
                let aki = aki.to_lowercase();
                let mut matches = candidates
                    .iter()
                    .filter(|ca| ca.fingerprint != cert.fingerprint)
                    .filter(|ca| ca.ski.as_deref() == Some(aki.as_str()));
                match (matches.next(), matches.next()) {
                    (Some(only), None) => Some(only),
                    _ => None,
                }
            });

            // Fallback: normalized issuer DN against CA subject DNs
            if issuer.is_none() {
                let normalized_issuer = normalize_dn(&cert.issuer);
                issuer = candidates
                    .iter()
                    .filter(|ca| ca.fingerprint != cert.fingerprint)
                    .find(|ca| ca.normalized_subject == normalized_issuer);
            }

            match issuer {
                Some(ca) => {
                    cert.config.sign_with_ca = true;
                    cert.config.ca_fingerprint = Some(ca.fingerprint.clone());
                    cert.config.ca_name = Some(ca.name.clone());
                    debug!(cert = %cert.name, ca = %ca.name, "issuer resolved");
                }
                None => {
                    if before.0 || before.1.is_some() {
                        warn!(
                            cert = %cert.name,
                            aki = cert.authority_key_identifier.as_deref().unwrap_or("-"),
                            issuer = %cert.issuer,
                            "issuing CA not found in certificate set, clearing CA link"
                        );
                    }
                    cert.config.sign_with_ca = false;
                    cert.config.ca_fingerprint = None;
                    cert.config.ca_name = None;
                }
            }
        }

        let after = (
            cert.config.sign_with_ca,
            cert.config.ca_fingerprint.clone(),
            cert.config.ca_name.clone(),
        );
        if before != after {
            changed.push(cert.fingerprint.clone());
        }
    }

    changed
}

/// Normalize a DN for comparison: uppercase the keys among
/// {C, ST, L, O, OU, CN}, trim values, sort `key=value` pairs, join with `,`.
pub fn normalize_dn(dn: &str) -> String {
    let mut pairs: Vec<String> = dn
        .split(',')
        .filter_map(|part| {
            let (key, value) = part.split_once('=')?;
            let key = key.trim();
            let upper = key.to_uppercase();
            let key = if matches!(upper.as_str(), "C" | "ST" | "L" | "O" | "OU" | "CN") {
                upper
            } else {
                key.to_string()
            };
            Some(format!("{key}={}", value.trim()))
        })
        .collect();
    pairs.sort();
    pairs.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CertKind;

    fn ca(name: &str, fp: &str, ski: &str, subject: &str) -> CertificateEntity {
        CertificateEntity {
            name: name.to_string(),
            fingerprint: fp.to_string(),
            subject: subject.to_string(),
            issuer: subject.to_string(),
            subject_key_identifier: ski.to_string(),
            is_ca: true,
            is_root_ca: true,
            self_signed: true,
            cert_type: CertKind::RootCa,
            ..Default::default()
        }
    }

    fn leaf(name: &str, fp: &str, aki: Option<&str>, issuer: &str) -> CertificateEntity {
        CertificateEntity {
            name: name.to_string(),
            fingerprint: fp.to_string(),
            subject: format!("CN={name}"),
            issuer: issuer.to_string(),
            authority_key_identifier: aki.map(|s| s.to_string()),
            ..Default::default()
        }
    }

    fn into_map(entities: Vec<CertificateEntity>) -> BTreeMap<String, CertificateEntity> {
        entities
            .into_iter()
            .map(|e| (e.fingerprint.clone(), e))
            .collect()
    }

    #[test]
    fn test_resolve_by_aki() {
        let mut certs = into_map(vec![
            ca("TestCA", "ca01", "ski-1", "CN=TestCA, O=Org"),
            leaf("web", "leaf01", Some("SKI-1"), "CN=Other"),
        ]);

        let changed = resolve_all(&mut certs);
        assert_eq!(changed, vec!["leaf01"]);

        let web = &certs["leaf01"];
        assert!(web.config.sign_with_ca);
        assert_eq!(web.config.ca_fingerprint.as_deref(), Some("ca01"));
        assert_eq!(web.config.ca_name.as_deref(), Some("TestCA"));
    }

    #[test]
    fn test_resolve_by_dn_fallback() {
        let mut certs = into_map(vec![
            ca("TestCA", "ca01", "", "O=Org,  CN=TestCA"),
            leaf("web", "leaf01", None, "cn=TestCA, o=Org"),
        ]);

        resolve_all(&mut certs);
        assert_eq!(
            certs["leaf01"].config.ca_fingerprint.as_deref(),
            Some("ca01")
        );
    }

    #[test]
    fn test_missing_issuer_clears_link() {
        let mut orphan = leaf("web", "leaf01", Some("gone"), "CN=Deleted CA");
        orphan.config.sign_with_ca = true;
        orphan.config.ca_fingerprint = Some("ca-gone".to_string());
        orphan.config.ca_name = Some("Deleted CA".to_string());
        let mut certs = into_map(vec![orphan]);

        let changed = resolve_all(&mut certs);
        assert_eq!(changed, vec!["leaf01"]);
        let web = &certs["leaf01"];
        assert!(!web.config.sign_with_ca);
        assert!(web.config.ca_fingerprint.is_none());
        assert!(web.config.ca_name.is_none());
    }

    #[test]
    fn test_root_ca_short_circuits() {
        let mut root = ca("Root", "ca01", "ski-1", "CN=Root");
        root.config.sign_with_ca = true;
        root.config.ca_fingerprint = Some("bogus".to_string());
        let mut certs = into_map(vec![root]);

        resolve_all(&mut certs);
        let root = &certs["ca01"];
        assert!(!root.config.sign_with_ca);
        assert!(root.config.ca_fingerprint.is_none());
    }

    #[test]
    fn test_intermediate_chains_to_root() {
        let mut inter = ca("Inter", "ca02", "ski-2", "CN=Inter");
        inter.is_root_ca = false;
        inter.self_signed = false;
        inter.issuer = "CN=Root".to_string();
        inter.authority_key_identifier = Some("ski-1".to_string());
        inter.cert_type = CertKind::IntermediateCa;

        let mut certs = into_map(vec![ca("Root", "ca01", "ski-1", "CN=Root"), inter]);
        resolve_all(&mut certs);

        assert_eq!(certs["ca02"].config.ca_fingerprint.as_deref(), Some("ca01"));
        assert!(certs["ca02"].config.sign_with_ca);
    }

    #[test]
    fn test_resolve_is_stable_on_second_pass() {
        let mut certs = into_map(vec![
            ca("TestCA", "ca01", "ski-1", "CN=TestCA"),
            leaf("web", "leaf01", Some("ski-1"), "CN=TestCA"),
        ]);
        let first = resolve_all(&mut certs);
        assert_eq!(first.len(), 1);
        let second = resolve_all(&mut certs);
        assert!(second.is_empty());
    }

    #[test]
    fn test_normalize_dn() {
        assert_eq!(
            normalize_dn("cn=Test CA , o=Org, c=FR"),
            "C=FR,CN=Test CA,O=Org"
        );
        // Pair order does not matter
        assert_eq!(
            normalize_dn("O=Org, CN=Test CA, C=FR"),
            normalize_dn("C=FR, O=Org, CN=Test CA")
        );
    }
}
