use ck_crypto::KeyUsageConfig;
use serde::{Deserialize, Serialize};

/// Certificate category as persisted in `certType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CertKind {
    #[default]
    #[serde(rename = "standard")]
    Standard,
    #[serde(rename = "intermediateCA")]
    IntermediateCa,
    #[serde(rename = "rootCA")]
    RootCa,
}

impl CertKind {
    pub fn from_flags(is_ca: bool, is_root_ca: bool) -> Self {
        match (is_ca, is_root_ca) {
            (true, true) => Self::RootCa,
            (true, false) => Self::IntermediateCa,
            _ => Self::Standard,
        }
    }
}

/// What changed about a certificate, as reported to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
}

/// Broadcast on every registry mutation for out-of-core subscribers.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub fingerprint: String,
    pub kind: ChangeKind,
}

/// Behavior of the deploy chain when an action fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    #[default]
    Abort,
    Continue,
}

/// One post-renewal deploy action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployAction {
    #[serde(flatten)]
    pub kind: DeployActionKind,
    #[serde(default)]
    pub run_on_failure: FailurePolicy,
}

/// Action catalogue; concrete adapters live outside the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DeployActionKind {
    RestartContainer {
        container: String,
    },
    UploadToProxy {
        url: String,
    },
    SshPush {
        host: String,
        #[serde(default = "default_ssh_port")]
        port: u16,
        user: String,
        remote_path: String,
    },
    Email {
        recipient: String,
    },
}

fn default_ssh_port() -> u16 {
    22
}

impl DeployActionKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::RestartContainer { .. } => "restartContainer",
            Self::UploadToProxy { .. } => "uploadToProxy",
            Self::SshPush { .. } => "sshPush",
            Self::Email { .. } => "email",
        }
    }
}

/// Per-certificate user configuration (the `config` subtree).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CertConfig {
    pub auto_renew: bool,
    pub renew_days_before_expiry: u32,
    #[serde(rename = "signWithCA")]
    pub sign_with_ca: bool,
    pub ca_fingerprint: Option<String>,
    pub ca_name: Option<String>,
    pub deploy_actions: Vec<DeployAction>,
    pub validity_days: u32,
    pub key_usage: KeyUsageConfig,
    pub extended_key_usage: Vec<String>,
}

impl Default for CertConfig {
    fn default() -> Self {
        Self {
            auto_renew: false,
            renew_days_before_expiry: 30,
            sign_with_ca: false,
            ca_fingerprint: None,
            ca_name: None,
            deploy_actions: Vec::new(),
            validity_days: 365,
            key_usage: KeyUsageConfig::default(),
            extended_key_usage: vec!["serverAuth".to_string()],
        }
    }
}

/// Partial config update: `Some` fields win, `None` fields are left alone.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CertConfigPatch {
    pub auto_renew: Option<bool>,
    pub renew_days_before_expiry: Option<u32>,
    #[serde(rename = "signWithCA")]
    pub sign_with_ca: Option<bool>,
    pub ca_fingerprint: Option<Option<String>>,
    pub deploy_actions: Option<Vec<DeployAction>>,
    pub validity_days: Option<u32>,
    pub key_usage: Option<KeyUsageConfig>,
    pub extended_key_usage: Option<Vec<String>>,
}

/// Canonicalize a fingerprint given by a client: strip `sha256`-style
/// prefixes and separators, lowercase. The core only ever compares the
/// canonical form.
pub fn normalize_fingerprint(input: &str) -> String {
    let mut value = input.trim().to_lowercase();
    for prefix in [
        "sha256 fingerprint=",
        "sha-256 fingerprint=",
        "sha256:",
        "sha-256:",
        "sha256=",
    ] {
        if let Some(rest) = value.strip_prefix(prefix) {
            value = rest.trim().to_string();
            break;
        }
    }
    value
        .chars()
        .filter(|c| *c != ':' && !c.is_whitespace())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_fingerprint() {
        assert_eq!(normalize_fingerprint("AB:CD:EF"), "abcdef");
        assert_eq!(normalize_fingerprint("sha256:abCD12"), "abcd12");
        assert_eq!(
            normalize_fingerprint("SHA256 Fingerprint=AA:BB"),
            "aabb"
        );
        assert_eq!(normalize_fingerprint("  a1b2c3  "), "a1b2c3");
    }

    #[test]
    fn test_deploy_action_wire_format() {
        let action = DeployAction {
            kind: DeployActionKind::SshPush {
                host: "web1.internal".to_string(),
                port: 22,
                user: "deploy".to_string(),
                remote_path: "/etc/ssl/web".to_string(),
            },
            run_on_failure: FailurePolicy::Continue,
        };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["type"], "sshPush");
        assert_eq!(json["runOnFailure"], "continue");

        let back: DeployAction = serde_json::from_value(json).unwrap();
        assert_eq!(back, action);
    }

    #[test]
    fn test_deploy_action_defaults() {
        let action: DeployAction = serde_json::from_str(
            r#"{"type":"restartContainer","container":"nginx"}"#,
        )
        .unwrap();
        assert_eq!(action.run_on_failure, FailurePolicy::Abort);
        assert_eq!(action.kind.label(), "restartContainer");
    }

    #[test]
    fn test_cert_kind_from_flags() {
        assert_eq!(CertKind::from_flags(true, true), CertKind::RootCa);
        assert_eq!(CertKind::from_flags(true, false), CertKind::IntermediateCa);
        assert_eq!(CertKind::from_flags(false, false), CertKind::Standard);
    }
}
