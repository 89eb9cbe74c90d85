pub mod entity;
pub mod metadata;
pub mod registry;
pub mod resolver;
pub mod types;

pub use entity::{ApiCertificateView, CertificateEntity, SanSet};
pub use metadata::{MetadataStore, RegistryFile};
pub use registry::CertificateRegistry;
pub use types::{
    CertConfig, CertConfigPatch, CertKind, ChangeEvent, ChangeKind, DeployAction,
    DeployActionKind, FailurePolicy, normalize_fingerprint,
};
