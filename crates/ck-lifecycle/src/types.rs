use ck_crypto::{KeyAlgorithm, SubjectName};
use ck_registry::{ApiCertificateView, CertConfigPatch};
use serde::Serialize;

use crate::deploy::DeployReport;

/// Options for [`crate::LifecyclePipeline::create_or_renew`].
#[derive(Debug, Clone, Default)]
pub struct CreateOrRenewOptions {
    /// Name for a newly created certificate (defaults to the lookup key).
    pub name: Option<String>,
    /// Subject DN for creation; defaults to `CN=<name>`.
    pub subject: Option<SubjectName>,
    /// SANs for creation.
    pub domains: Vec<String>,
    pub ips: Vec<String>,
    /// Create a CA certificate instead of a server certificate.
    pub is_ca: bool,
    /// Sign with this CA (fingerprint or name) instead of self-signing.
    pub ca: Option<String>,
    /// Partial config update applied before the operation.
    pub config: Option<CertConfigPatch>,
    /// Overrides `config.validityDays` for this operation only.
    pub validity_days: Option<u32>,
    /// Key algorithm for creation / key regeneration.
    pub algorithm: Option<KeyAlgorithm>,
    /// Passphrase protecting the certificate's own key.
    pub passphrase: Option<String>,
    /// Passphrase of the signing CA's key.
    pub ca_passphrase: Option<String>,
    /// Generate a fresh key pair during renewal.
    pub regenerate_key: bool,
    /// Promote idle SANs into the active sets before renewing.
    pub apply_idle: bool,
    /// Skip the pre-renewal snapshot.
    pub skip_snapshot: bool,
    /// Skip deploy actions even when configured.
    pub skip_deploy: bool,
}

/// Result of a create / renew operation.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrRenewOutcome {
    pub success: bool,
    pub renewed: bool,
    pub fingerprint_changed: bool,
    pub certificate: ApiCertificateView,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deploy: Option<DeployReport>,
}

/// Result of a snapshot restore.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreOutcome {
    pub success: bool,
    pub fingerprint_changed: bool,
    pub restored_files: Vec<String>,
    pub certificate: ApiCertificateView,
}

/// What to remove alongside the registry entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteOptions {
    pub delete_files: bool,
    pub delete_snapshots: bool,
}
