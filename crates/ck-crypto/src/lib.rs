pub mod issue;
pub mod keys;
pub mod parse;
pub mod types;

pub use issue::CryptoProvider;
pub use types::{
    CertSpec, KeyAlgorithm, KeyInfo, KeyType, KeyUsageConfig, ParsedCertificate, SubjectName,
};
