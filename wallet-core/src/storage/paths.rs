use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::{WalletError, WalletResult};
use crate::wallet::WalletIdentity;

/// Filesystem layout of the application data directory.
///
/// ```text
/// <root>/wallet.config
/// <root>/wallets/wallet-<id>/{wallet.dat, wallet.summary, history.store, contacts.store}
/// <root>/backups/wallet-<id>/{rolling,zip}/wallet-<id>-<timestamp>.zip
/// ```
#[derive(Debug, Clone)]
pub struct ApplicationPaths {
    /// Root directory for application data.
    root_dir: PathBuf,
    /// Parent of every per-wallet directory.
    wallets_dir: PathBuf,
    /// Parent of every per-wallet backup rotation.
    backups_dir: PathBuf,
    /// Path to persisted configuration.
    config_file: PathBuf,
}

impl ApplicationPaths {
    /// Live wallet file holding the sealed seed.
    pub const WALLET_FILENAME: &'static str = "wallet.dat";
    pub const SUMMARY_FILENAME: &'static str = "wallet.summary";
    /// Extension of backup archives.
    pub const BACKUP_EXTENSION: &'static str = "zip";

    /// Create a new path manager rooted at the provided directory.
    pub fn new(root: impl AsRef<Path>) -> WalletResult<Self> {
        let root_dir = root.as_ref().to_path_buf();
        if root_dir.as_os_str().is_empty() {
            return Err(WalletError::StorageError(
                "Application root directory cannot be empty".to_string(),
            ));
        }

        Ok(Self {
            wallets_dir: root_dir.join("wallets"),
            backups_dir: root_dir.join("backups"),
            config_file: root_dir.join("wallet.config"),
            root_dir,
        })
    }

    /// Ensure the directory structure exists, creating missing folders.
    pub fn ensure_directories(&self) -> WalletResult<()> {
        fs::create_dir_all(&self.root_dir)?;
        fs::create_dir_all(&self.wallets_dir)?;
        fs::create_dir_all(&self.backups_dir)?;
        Ok(())
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn wallets_dir(&self) -> &Path {
        &self.wallets_dir
    }

    pub fn config_file(&self) -> &Path {
        &self.config_file
    }

    pub fn wallet_dir(&self, identity: &WalletIdentity) -> PathBuf {
        self.wallets_dir.join(identity.directory_name())
    }

    pub fn wallet_file(&self, identity: &WalletIdentity) -> PathBuf {
        self.wallet_dir(identity).join(Self::WALLET_FILENAME)
    }

    pub fn summary_file(&self, identity: &WalletIdentity) -> PathBuf {
        self.wallet_dir(identity).join(Self::SUMMARY_FILENAME)
    }

    /// Capped rotation of snapshots taken before mutating operations.
    pub fn rolling_backup_dir(&self, identity: &WalletIdentity) -> PathBuf {
        self.backups_dir
            .join(identity.directory_name())
            .join("rolling")
    }

    /// Local copies of full backups that are also mirrored to the cloud location.
    pub fn local_backup_dir(&self, identity: &WalletIdentity) -> PathBuf {
        self.backups_dir.join(identity.directory_name()).join("zip")
    }

    pub fn cloud_backup_dir(cloud_root: &Path, identity: &WalletIdentity) -> PathBuf {
        cloud_root.join(identity.directory_name())
    }
}
