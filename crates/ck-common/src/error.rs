use serde::Serialize;
use thiserror::Error;

/// Erreur unifiée du moteur de cycle de vie des certificats
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    BadInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("crypto operation failed: {0}")]
    Crypto(String),

    #[error("wrong passphrase")]
    WrongPassphrase,

    #[error("metadata corrupt: {0}")]
    ConfigCorrupt(String),

    #[error("conflicting operation in progress: {0}")]
    Conflict(String),

    #[error("deploy action failed: {0}")]
    Deploy(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Identifiant de l'erreur tel qu'exposé par l'API
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NotFound",
            Self::BadInput(_) => "BadInput",
            Self::Io(_) => "IOError",
            Self::Crypto(_) => "CryptoError",
            Self::WrongPassphrase => "WrongPassphrase",
            Self::ConfigCorrupt(_) | Self::Serialization(_) => "ConfigCorrupt",
            Self::Conflict(_) => "Conflict",
            Self::Deploy(_) => "DeployError",
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Enveloppe d'erreur sérialisée vers les clients HTTP
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub kind: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl From<&EngineError> for ApiError {
    fn from(err: &EngineError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            detail: None,
        }
    }
}
