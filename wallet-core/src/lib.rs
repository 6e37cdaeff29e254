// lib.rs - Wallet lifecycle and secure-session core

pub mod backup;
pub mod config_store;
pub mod context;
pub mod credential;
pub mod crypto;
pub mod errors;
pub mod services;
pub mod session;
pub mod storage;
pub mod store;
pub mod wallet;

// Re-export common types
pub use backup::{BackupKind, BackupManager, BackupOutcome, BackupRecord};
pub use config_store::{
    BackupConfig, ConfigStore, Environment, KdfConfig, SessionConfig, WalletConfig,
};
pub use context::WalletContext;
pub use credential::{Credential, CredentialOutcome, CredentialPolicy, WeaknessReason};
pub use errors::{WalletError, WalletResult};
pub use services::{ManagedService, ManagedServiceRegistry, ServiceStage, ShutdownKind};
pub use session::{SessionController, WalletServiceFactory};
pub use storage::ApplicationPaths;
pub use store::{Contact, EncryptedStore, HistoryEntry, StoreRecord};
pub use wallet::{WalletIdentity, WalletManager, WalletState, WalletSummary};
