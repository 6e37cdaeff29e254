use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::{self, blake3_checksum, DataKey, KdfParameters, SealedBox};
use crate::errors::{WalletError, WalletResult};
use crate::storage::write_atomic;
use crate::wallet::WalletIdentity;

const SUMMARY_VERSION: u16 = 1;
const WALLET_FILE_MAGIC: &[u8; 8] = b"HDWALLET";
const WALLET_FILE_VERSION: u16 = 1;

/// Wallet metadata persisted beside the live wallet file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WalletSummary {
    pub identity: WalletIdentity,
    /// Human-readable wallet name.
    pub name: String,
    #[serde(default)]
    pub notes: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Directory the summary was read from. Not persisted.
    #[serde(skip)]
    pub directory: PathBuf,
    pub(crate) kdf: KdfParameters,
    /// Hex verifier derived from the credential.
    pub(crate) credential_hash: String,
    /// Wallet data key sealed under the credential-derived key.
    pub(crate) wrapped_key: SealedBox,
}

impl WalletSummary {
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub(crate) fn load(path: &Path) -> WalletResult<Self> {
        let bytes = fs::read(path)?;
        let envelope: SummaryEnvelope = serde_json::from_slice(&bytes)?;
        if envelope.version != SUMMARY_VERSION {
            return Err(WalletError::ValidationError(format!(
                "Unsupported wallet summary version {}",
                envelope.version
            )));
        }
        if summary_checksum(&envelope.payload)? != envelope.checksum {
            return Err(WalletError::ValidationError(
                "Wallet summary integrity verification failed".to_string(),
            ));
        }

        let mut summary = envelope.payload;
        summary.directory = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Ok(summary)
    }

    pub(crate) fn save(&self, path: &Path) -> WalletResult<()> {
        let envelope = SummaryEnvelope {
            version: SUMMARY_VERSION,
            checksum: summary_checksum(self)?,
            payload: self.clone(),
        };
        let serialized = serde_json::to_vec_pretty(&envelope)?;
        write_atomic(path, &serialized)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SummaryEnvelope {
    version: u16,
    checksum: [u8; 32],
    payload: WalletSummary,
}

fn summary_checksum(summary: &WalletSummary) -> WalletResult<[u8; 32]> {
    let encoded = serde_json::to_vec(summary)?;
    Ok(blake3_checksum(&encoded))
}

/// On-disk form of the live wallet file: the seed sealed under the data key.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WalletFile {
    magic: [u8; 8],
    version: u16,
    identity: WalletIdentity,
    sealed_seed: SealedBox,
}

pub(crate) fn write_wallet_file(
    path: &Path,
    identity: &WalletIdentity,
    data_key: &DataKey,
    seed: &[u8],
) -> WalletResult<()> {
    let file = WalletFile {
        magic: *WALLET_FILE_MAGIC,
        version: WALLET_FILE_VERSION,
        identity: identity.clone(),
        sealed_seed: crypto::seal(data_key, seed)?,
    };
    let serialized = serde_json::to_vec(&file)?;
    write_atomic(path, &serialized)
}

/// Decrypt the live wallet file and check it belongs to `identity`.
pub(crate) fn verify_wallet_file(
    path: &Path,
    identity: &WalletIdentity,
    data_key: &DataKey,
) -> WalletResult<()> {
    let bytes = fs::read(path)?;
    let file: WalletFile = serde_json::from_slice(&bytes)?;

    if &file.magic != WALLET_FILE_MAGIC {
        return Err(WalletError::ValidationError(
            "Invalid wallet file magic marker".to_string(),
        ));
    }
    if file.version != WALLET_FILE_VERSION {
        return Err(WalletError::ValidationError(format!(
            "Unsupported wallet file version: {}",
            file.version
        )));
    }
    if &file.identity != identity {
        return Err(WalletError::ValidationError(
            "Wallet file belongs to a different wallet".to_string(),
        ));
    }

    let seed = crypto::open(data_key, &file.sealed_seed)?;
    if WalletIdentity::from_seed(&seed)? != *identity {
        return Err(WalletError::ValidationError(
            "Wallet seed does not match its identity".to_string(),
        ));
    }
    Ok(())
}
