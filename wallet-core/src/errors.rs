use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::credential::WeaknessReason;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum WalletError {
    // Credential errors
    /// Wrong secret or unknown wallet. Deliberately indistinguishable.
    InvalidCredential,
    WeakCredential(WeaknessReason),

    // Wallet lifecycle errors
    WalletCreate(String),
    NoOpenWallet,
    ContactsImport(String),

    // Storage errors
    StoreCorrupt { path: PathBuf, reason: String },
    StorageError(String),
    FileNotFound(String),
    PermissionDenied(String),

    // Backup errors
    BackupFailed(String),
    CloudMirrorFailed(String),

    // Service errors
    ServiceStart(String),

    // Cryptographic errors
    CryptoError(String),

    // Validation errors
    ValidationError(String),

    // Generic errors
    Unknown(String),
}

impl fmt::Display for WalletError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WalletError::InvalidCredential => write!(f, "Incorrect credentials"),
            WalletError::WeakCredential(reason) => {
                write!(f, "Credential rejected ({}): {}", reason.code(), reason)
            }

            WalletError::WalletCreate(msg) => write!(f, "Wallet creation failed: {}", msg),
            WalletError::NoOpenWallet => write!(f, "No wallet is open"),
            WalletError::ContactsImport(msg) => write!(f, "Contacts import failed: {}", msg),

            WalletError::StoreCorrupt { path, reason } => {
                write!(f, "Store file {} is corrupt: {}", path.display(), reason)
            }
            WalletError::StorageError(msg) => write!(f, "Storage error: {}", msg),
            WalletError::FileNotFound(msg) => write!(f, "File not found: {}", msg),
            WalletError::PermissionDenied(msg) => write!(f, "Permission denied: {}", msg),

            WalletError::BackupFailed(msg) => write!(f, "Backup failed: {}", msg),
            WalletError::CloudMirrorFailed(msg) => write!(f, "Cloud backup mirror failed: {}", msg),

            WalletError::ServiceStart(msg) => write!(f, "Service failed to start: {}", msg),

            WalletError::CryptoError(msg) => write!(f, "Cryptographic error: {}", msg),

            WalletError::ValidationError(msg) => write!(f, "Validation error: {}", msg),


            WalletError::Unknown(msg) => write!(f, "Unknown error: {}", msg),
        }
    }
}

impl std::error::Error for WalletError {}

pub type WalletResult<T> = Result<T, WalletError>;

// Conversion helpers
impl From<std::io::Error> for WalletError {
    fn from(error: std::io::Error) -> Self {
        match error.kind() {
            std::io::ErrorKind::NotFound => WalletError::FileNotFound(error.to_string()),
            std::io::ErrorKind::PermissionDenied => {
                WalletError::PermissionDenied(error.to_string())
            }
            _ => WalletError::StorageError(error.to_string()),
        }
    }
}

impl From<serde_json::Error> for WalletError {
    fn from(error: serde_json::Error) -> Self {
        WalletError::ValidationError(format!("JSON error: {}", error))
    }
}

impl From<tokio::task::JoinError> for WalletError {
    fn from(error: tokio::task::JoinError) -> Self {
        WalletError::Unknown(format!("Background task failed: {}", error))
    }
}
