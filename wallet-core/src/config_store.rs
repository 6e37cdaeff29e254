use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::blake3_checksum;
use crate::errors::{WalletError, WalletResult};
use crate::storage::{write_atomic, ApplicationPaths};

const CONFIG_VERSION: u16 = 1;

/// Environment variable selecting the runtime environment.
pub const ENVIRONMENT_VAR: &str = "HDWALLET_ENV";

/// Environment types for different security configurations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    pub fn from_env() -> Self {
        let value = std::env::var(ENVIRONMENT_VAR).unwrap_or_else(|_| "development".to_string());
        Self::parse(&value)
    }

    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "production" | "prod" => Environment::Production,
            "test" | "testing" => Environment::Test,
            _ => Environment::Development,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupConfig {
    /// User-selected directory mirrored by a cloud sync client.
    pub cloud_backup_location: Option<PathBuf>,
    pub rolling_retention: usize,
    pub local_zip_retention: usize,
}

impl BackupConfig {
    /// Both rotations must keep at least the archive they just wrote.
    pub fn validate(&self) -> WalletResult<()> {
        if self.rolling_retention == 0 {
            return Err(WalletError::ValidationError(
                "Rolling backup retention must be at least 1".to_string(),
            ));
        }
        if self.local_zip_retention == 0 {
            return Err(WalletError::ValidationError(
                "Local backup retention must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            cloud_backup_location: None,
            rolling_retention: 4,
            local_zip_retention: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionConfig {
    /// Minimum wait after a rejected credential before the caller is told.
    pub failed_unlock_delay_ms: u64,
}

impl SessionConfig {
    pub fn for_environment(environment: Environment) -> Self {
        let failed_unlock_delay_ms = match environment {
            Environment::Test => 25,
            Environment::Development | Environment::Production => 2_000,
        };
        Self {
            failed_unlock_delay_ms,
        }
    }

    pub fn failed_unlock_delay(&self) -> Duration {
        Duration::from_millis(self.failed_unlock_delay_ms)
    }
}

/// Argon2id cost settings applied to newly derived credentials.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KdfConfig {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl KdfConfig {
    pub fn for_environment(environment: Environment) -> Self {
        match environment {
            Environment::Test => Self {
                memory_kib: 64,
                iterations: 1,
                parallelism: 1,
            },
            Environment::Development | Environment::Production => Self {
                memory_kib: 64 * 1024, // 64 MiB
                iterations: 3,
                parallelism: 1,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WalletConfig {
    pub backup: BackupConfig,
    pub session: SessionConfig,
    pub kdf: KdfConfig,
    pub environment: Environment,
    pub last_updated: DateTime<Utc>,
    pub version: u16,
}

impl WalletConfig {
    pub fn new(environment: Environment) -> Self {
        Self {
            backup: BackupConfig::default(),
            session: SessionConfig::for_environment(environment),
            kdf: KdfConfig::for_environment(environment),
            environment,
            last_updated: Utc::now(),
            version: CONFIG_VERSION,
        }
    }

    pub fn touch(&mut self) {
        self.last_updated = Utc::now();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConfigEnvelope {
    version: u16,
    checksum: [u8; 32],
    payload: WalletConfig,
    modified_at_unix: i64,
}

/// Handles persistence of wallet configuration with integrity checks.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn from_paths(paths: &ApplicationPaths) -> Self {
        Self {
            path: paths.config_file().to_path_buf(),
        }
    }

    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn load_or_default(&self, environment: Environment) -> WalletResult<WalletConfig> {
        if !self.path.exists() {
            let config = WalletConfig::new(environment);
            self.save(&config)?;
            return Ok(config);
        }

        let bytes = fs::read(&self.path)?;
        let envelope: ConfigEnvelope = serde_json::from_slice(&bytes)?;
        if envelope.version != CONFIG_VERSION {
            return Err(WalletError::ValidationError(format!(
                "Unsupported config version {}",
                envelope.version
            )));
        }

        if checksum(&envelope.payload)? != envelope.checksum {
            return Err(WalletError::ValidationError(
                "Config integrity verification failed".to_string(),
            ));
        }

        envelope.payload.backup.validate()?;
        Ok(envelope.payload)
    }

    pub fn save(&self, config: &WalletConfig) -> WalletResult<()> {
        let mut payload = config.clone();
        payload.touch();

        let envelope = ConfigEnvelope {
            version: CONFIG_VERSION,
            checksum: checksum(&payload)?,
            modified_at_unix: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .map_err(|e| WalletError::StorageError(e.to_string()))?
                .as_secs() as i64,
            payload,
        };

        let serialized = serde_json::to_vec_pretty(&envelope)?;
        write_atomic(&self.path, &serialized)
    }

    pub fn update<F>(&self, environment: Environment, updater: F) -> WalletResult<WalletConfig>
    where
        F: FnOnce(&mut WalletConfig) -> WalletResult<()>,
    {
        let mut config = self.load_or_default(environment)?;
        updater(&mut config)?;
        config.backup.validate()?;
        config.touch();
        self.save(&config)?;
        Ok(config)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn checksum(config: &WalletConfig) -> WalletResult<[u8; 32]> {
    let encoded = serde_json::to_vec(config)?;
    Ok(blake3_checksum(&encoded))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn save_and_load_config_round_trip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("wallet.config");
        let store = ConfigStore::new(&path);

        let mut config = WalletConfig::new(Environment::Development);
        config.backup.rolling_retention = 7;
        config.backup.cloud_backup_location = Some(temp.path().join("cloud"));
        store.save(&config).unwrap();

        let loaded = store.load_or_default(Environment::Development).unwrap();
        assert_eq!(loaded.backup.rolling_retention, 7);
        assert_eq!(
            loaded.backup.cloud_backup_location,
            Some(temp.path().join("cloud"))
        );
    }

    #[test]
    fn tampered_config_detected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("wallet.config");
        let store = ConfigStore::new(&path);
        store.save(&WalletConfig::new(Environment::Test)).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let tampered = text.replacen("\"rolling_retention\": 4", "\"rolling_retention\": 1", 1);
        assert_ne!(text, tampered);
        fs::write(&path, tampered).unwrap();

        let result = store.load_or_default(Environment::Test);
        assert!(matches!(result, Err(WalletError::ValidationError(_))));
    }

    #[test]
    fn missing_config_is_created_with_environment_defaults() {
        let temp = TempDir::new().unwrap();
        let store = ConfigStore::new(temp.path().join("nested").join("wallet.config"));

        let config = store.load_or_default(Environment::Test).unwrap();
        assert!(store.path().exists());
        assert_eq!(config.environment, Environment::Test);
        assert_eq!(config.kdf, KdfConfig::for_environment(Environment::Test));
        assert_eq!(config.session.failed_unlock_delay_ms, 25);
    }

    #[test]
    fn update_persists_changes() {
        let temp = TempDir::new().unwrap();
        let store = ConfigStore::new(temp.path().join("wallet.config"));

        store
            .update(Environment::Test, |config| {
                config.backup.local_zip_retention = 3;
                Ok(())
            })
            .unwrap();

        let loaded = store.load_or_default(Environment::Test).unwrap();
        assert_eq!(loaded.backup.local_zip_retention, 3);
    }

    #[test]
    fn zero_retention_is_rejected() {
        let temp = TempDir::new().unwrap();
        let store = ConfigStore::new(temp.path().join("wallet.config"));

        let rolling = store.update(Environment::Test, |config| {
            config.backup.rolling_retention = 0;
            Ok(())
        });
        assert!(matches!(rolling, Err(WalletError::ValidationError(_))));

        let local = store.update(Environment::Test, |config| {
            config.backup.local_zip_retention = 0;
            Ok(())
        });
        assert!(matches!(local, Err(WalletError::ValidationError(_))));

        let loaded = store.load_or_default(Environment::Test).unwrap();
        assert_eq!(loaded.backup, BackupConfig::default());
    }

    #[test]
    fn environment_parsing() {
        assert_eq!(Environment::parse("prod"), Environment::Production);
        assert_eq!(Environment::parse("Testing"), Environment::Test);
        assert_eq!(Environment::parse("anything"), Environment::Development);
    }
}
